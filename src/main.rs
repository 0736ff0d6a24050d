use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use tpar::client::Connection;
use tpar::config::{self, ServerConfig, WorkerConfig};
use tpar::error::{Result, TparError};
use tpar::protocol::{JobView, SinkSpec};
use tpar::scheduler::job::{JobRequest, JobState};
use tpar::scheduler::matcher::JobMatch;
use tpar::{server, worker};

#[derive(Parser, Debug)]
#[command(name = "tpar")]
#[command(about = "A lightweight distributed task queue")]
struct Cli {
    /// Server host
    #[arg(short = 'H', long, global = true, default_value = config::DEFAULT_HOST)]
    host: String,

    /// Server port
    #[arg(short = 'p', long, global = true, default_value_t = config::DEFAULT_PORT)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the queue server
    Server {
        /// Number of worker loops to run inside the server process
        #[arg(short = 'N', long = "workers", default_value_t = 0)]
        workers: usize,
    },

    /// Run one or more workers attached to a server
    Worker {
        /// Number of workers to run
        #[arg(short = 'N', long = "count", default_value_t = 1,
              value_parser = clap::value_parser!(u64).range(1..))]
        count: u64,

        /// Reconnect after losing the server, waiting this many seconds
        #[arg(short = 'r', long, value_name = "SECONDS",
              num_args = 0..=1, default_missing_value = "10")]
        reconnect: Option<u64>,
    },

    /// Submit a job
    Enqueue {
        /// Job name, used by name: filters
        #[arg(short = 'n', long, default_value = "unnamed-job")]
        name: String,

        /// Working directory for the job
        #[arg(short = 'd', long, default_value = ".")]
        directory: String,

        /// Job priority; smaller values run first
        #[arg(short = 'P', long, default_value_t = 0)]
        priority: i64,

        /// Write the job's stdout to this file on the worker
        #[arg(short = 'o', long, value_name = "FILE", requires = "stderr_file")]
        stdout_file: Option<String>,

        /// Write the job's stderr to this file on the worker
        #[arg(short = 'e', long, value_name = "FILE", requires = "stdout_file")]
        stderr_file: Option<String>,

        /// Stream the job's output to this terminal and exit with its code
        #[arg(short = 'w', long, conflicts_with_all = ["stdout_file", "stderr_file"])]
        watch: bool,

        /// The command to run and its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true,
              value_name = "COMMAND")]
        command: Vec<String>,
    },

    /// List jobs
    Status {
        /// Also print priorities, directories, and timestamps
        #[arg(short, long)]
        verbose: bool,

        /// Filter expression; all jobs when omitted
        filter: Option<String>,
    },

    /// Kill queued or running jobs
    Kill {
        /// Filter expression selecting the jobs to kill
        filter: String,
    },

    /// Re-enqueue completed jobs under fresh ids
    Rerun {
        /// Filter expression selecting the jobs to run again
        filter: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("tpar: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Server { workers } => {
            let config = ServerConfig {
                host: cli.host,
                port: cli.port,
                local_workers: workers,
            };
            server::run(config).await?;
            Ok(0)
        }

        Command::Worker { count, reconnect } => {
            let config = WorkerConfig {
                host: cli.host,
                port: cli.port,
                reconnect: reconnect.map(Duration::from_secs),
            };
            let mut workers = JoinSet::new();
            for _ in 0..count {
                workers.spawn(worker::run_remote(config.clone()));
            }
            while let Some(result) = workers.join_next().await {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(e),
                    Err(e) => return Err(TparError::Internal(format!("worker task failed: {e}"))),
                }
            }
            Ok(0)
        }

        Command::Enqueue {
            name,
            directory,
            priority,
            stdout_file,
            stderr_file,
            watch,
            command,
        } => {
            let mut command = command.into_iter();
            let Some(program) = command.next() else {
                return Err(TparError::Internal("missing command".to_string()));
            };
            let request = JobRequest {
                name,
                priority,
                command: program,
                args: command.collect(),
                cwd: directory,
                env: None,
            };
            let sink = if watch {
                SinkSpec::Stream
            } else if let (Some(stdout), Some(stderr)) = (stdout_file, stderr_file) {
                SinkSpec::Files { stdout, stderr }
            } else {
                SinkSpec::Discard
            };

            let mut conn = Connection::connect(&cli.host, cli.port).await?;
            let id = conn.enqueue(request, sink).await?;
            if watch {
                conn.watch().await
            } else {
                println!("job {id} queued");
                Ok(0)
            }
        }

        Command::Status { verbose, filter } => {
            let matcher = parse_filter(filter.as_deref())?;
            let mut conn = Connection::connect(&cli.host, cli.port).await?;
            let jobs = conn.status(matcher).await?;
            print_jobs(jobs, verbose);
            Ok(0)
        }

        Command::Kill { filter } => {
            let matcher = parse_required_filter(&filter)?;
            let mut conn = Connection::connect(&cli.host, cli.port).await?;
            let jobs = conn.kill(matcher).await?;
            if jobs.is_empty() {
                eprintln!("tpar: no jobs matched");
                return Ok(1);
            }
            print_jobs(jobs, false);
            Ok(0)
        }

        Command::Rerun { filter } => {
            let matcher = parse_required_filter(&filter)?;
            let mut conn = Connection::connect(&cli.host, cli.port).await?;
            let jobs = conn.rerun(matcher).await?;
            if jobs.is_empty() {
                eprintln!("tpar: no jobs matched");
                return Ok(1);
            }
            print_jobs(jobs, false);
            Ok(0)
        }
    }
}

fn parse_filter(filter: Option<&str>) -> Result<JobMatch> {
    match filter {
        None => Ok(JobMatch::All),
        Some(expr) => parse_required_filter(expr),
    }
}

fn parse_required_filter(expr: &str) -> Result<JobMatch> {
    JobMatch::parse(expr).map_err(|e| TparError::Filter(e.to_string()))
}

fn print_jobs(mut jobs: Vec<JobView>, verbose: bool) {
    jobs.sort_by_key(|job| job.id);
    for job in &jobs {
        println!(
            "{:>5}  {:<9} {:<20} {}",
            job.id,
            job.state.label(),
            job.request.name,
            command_line(&job.request)
        );
        if verbose {
            println!(
                "       priority {}, cwd {}, output {}",
                job.request.priority,
                job.request.cwd,
                describe_sink(&job.output)
            );
            println!("       {}", describe_state(&job.state));
        }
    }
}

fn command_line(request: &JobRequest) -> String {
    let mut line = request.command.clone();
    for arg in &request.args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

fn describe_sink(sink: &SinkSpec) -> String {
    match sink {
        SinkSpec::Discard => "discarded".to_string(),
        SinkSpec::Files { stdout, stderr } if stdout == stderr => format!("to {stdout}"),
        SinkSpec::Files { stdout, stderr } => format!("stdout to {stdout}, stderr to {stderr}"),
        SinkSpec::Stream => "streamed to client".to_string(),
    }
}

fn describe_state(state: &JobState) -> String {
    const TIME: &str = "%Y-%m-%d %H:%M:%S";
    match state {
        JobState::Queued { queued_at } => format!("queued at {}", queued_at.format(TIME)),
        JobState::Running { worker, started_at } => {
            format!("running on worker {worker} since {}", started_at.format(TIME))
        }
        JobState::Finished { exit, finished_at } => {
            format!("{exit} at {}", finished_at.format(TIME))
        }
        JobState::Failed { reason, failed_at } => {
            format!("failed at {}: {reason}", failed_at.format(TIME))
        }
        JobState::Killed { killed_at } => format!("killed at {}", killed_at.format(TIME)),
    }
}
