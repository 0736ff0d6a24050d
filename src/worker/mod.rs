//! Worker execution engine.
//!
//! A worker runs an endless loop, one job per iteration: ask the server
//! for work, run the child process, route its output to the job's sink,
//! report the exit code. Two flavors share that shape:
//!
//! - [`run_local`]: lives inside the server process and talks to the
//!   dispatch loop directly through a [`ServerIface`].
//! - [`run_remote`]: connects over TCP and speaks the framed worker
//!   protocol, optionally reconnecting after a lost connection.
//!
//! Kill signals are delivered through the assignment's cancellation token
//! (forwarded as a `Kill` frame for remote workers), which terminates the
//! child process; the resulting signal exit is reported normally and the
//! server's state machine decides what it means.

pub mod executor;
pub mod sink;

use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{Result, TparError};
use crate::protocol::codec::{self, FrameCodec};
use crate::protocol::rpc::RpcError;
use crate::protocol::{Hello, SinkSpec, WorkerReply, WorkerRequest};
use crate::scheduler::job::{JobId, JobOutcome, JobRequest, OutputSink, WorkerId};
use crate::server::{Assignment, ServerIface};
use crate::worker::executor::ExecEvent;
use crate::worker::sink::FileSink;

/// Worker loop for a worker living inside the server process.
pub async fn run_local(iface: ServerIface, worker_id: WorkerId) {
    loop {
        match iface.request_job.call(worker_id).await {
            Ok(assignment) => run_assignment(assignment).await,
            // The offered job was withdrawn before dispatch; ask again.
            Err(RpcError::NoReply) => continue,
            Err(RpcError::Closed) => {
                tracing::debug!(worker_id, "server gone, local worker exiting");
                return;
            }
        }
    }
}

async fn run_assignment(assignment: Assignment) {
    let Assignment {
        id,
        request,
        sink,
        outcome,
        cancel,
    } = assignment;
    tracing::info!(job_id = id, command = %request.command, "executing job");

    let result = execute_to_sink(&request, &sink, cancel).await;

    if let OutputSink::Stream(stream) = &sink {
        match &result {
            Ok(exit) => stream.done(*exit).await,
            Err(reason) => stream.fail(reason.clone()).await,
        }
    }
    let _ = outcome.send(result);
}

/// Runs the child and routes every output chunk per `sink`. Returns the
/// exit code, or the reason the job could not produce one.
async fn execute_to_sink(
    request: &JobRequest,
    sink: &OutputSink,
    cancel: CancellationToken,
) -> JobOutcome {
    let mut files = match sink {
        OutputSink::Files { stdout, stderr } => match FileSink::open(stdout, stderr).await {
            Ok(files) => Some(files),
            Err(e) => return Err(format!("cannot open output file: {e}")),
        },
        _ => None,
    };

    let mut events = match executor::start(request, cancel.clone()) {
        Ok(events) => events,
        Err(e) => return Err(format!("failed to spawn {}: {e}", request.command)),
    };

    let mut exit = None;
    let mut write_error = None;
    while let Some(event) = events.recv().await {
        match event {
            ExecEvent::Output(chunk) => match sink {
                OutputSink::Discard => {}
                OutputSink::Files { .. } => {
                    if write_error.is_none() {
                        if let Some(files) = &mut files {
                            if let Err(e) = files.write(&chunk).await {
                                write_error = Some(format!("cannot write output file: {e}"));
                                // No point letting the child keep producing
                                // output nobody can store.
                                cancel.cancel();
                            }
                        }
                    }
                }
                OutputSink::Stream(stream) => {
                    let _ = stream.publish(chunk).await;
                }
            },
            ExecEvent::Exited(code) => exit = Some(code),
        }
    }

    if let Some(files) = files {
        if let Err(e) = files.finish().await {
            tracing::warn!(error = %e, "failed to flush output file");
        }
    }

    match (write_error, exit) {
        (Some(reason), _) => Err(reason),
        (None, Some(exit)) => Ok(exit),
        (None, None) => Err("executor stopped unexpectedly".to_string()),
    }
}

/// Worker loop for a standalone worker process. Returns only on a fatal
/// transport error; with `reconnect` configured it instead sleeps and
/// connects again.
pub async fn run_remote(config: WorkerConfig) -> Result<()> {
    loop {
        let error = match session(&config).await {
            Ok(()) => TparError::Disconnected,
            Err(e) => e,
        };
        match config.reconnect {
            Some(delay) => {
                tracing::warn!(
                    error = %error,
                    delay_secs = delay.as_secs(),
                    "lost server connection, reconnecting"
                );
                tokio::time::sleep(delay).await;
            }
            None => return Err(error),
        }
    }
}

async fn session(config: &WorkerConfig) -> Result<()> {
    let addr = config.addr();
    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|source| TparError::Connect { addr, source })?;
    let mut framed = Framed::new(stream, FrameCodec::new());

    codec::send(&mut framed, &Hello::Worker).await?;
    let worker_id = match codec::recv::<_, WorkerReply>(&mut framed).await? {
        Some(WorkerReply::Welcome { worker_id }) => worker_id,
        Some(_) => return Err(TparError::Protocol("expected a welcome".to_string())),
        None => return Err(TparError::Disconnected),
    };
    tracing::info!(worker_id, addr = %config.addr(), "connected to server");

    loop {
        codec::send(&mut framed, &WorkerRequest::RequestJob).await?;

        let (id, request, sink) = loop {
            match codec::recv::<_, WorkerReply>(&mut framed).await? {
                Some(WorkerReply::Assigned { id, request, sink }) => break (id, request, sink),
                // A kill for a job whose exit we already reported.
                Some(WorkerReply::Kill { .. }) => continue,
                Some(WorkerReply::Welcome { .. }) => {
                    return Err(TparError::Protocol("unexpected welcome".to_string()))
                }
                None => return Err(TparError::Disconnected),
            }
        };

        run_remote_assignment(&mut framed, id, request, sink).await?;
    }
}

async fn run_remote_assignment(
    framed: &mut Framed<TcpStream, FrameCodec>,
    id: JobId,
    request: JobRequest,
    sink: SinkSpec,
) -> Result<()> {
    tracing::info!(job_id = id, command = %request.command, "executing job");
    let cancel = CancellationToken::new();

    let mut files = match &sink {
        SinkSpec::Files { stdout, stderr } => match FileSink::open(stdout, stderr).await {
            Ok(files) => Some(files),
            Err(e) => {
                let outcome: JobOutcome = Err(format!("cannot open output file: {e}"));
                codec::send(framed, &WorkerRequest::Exited { id, outcome }).await?;
                return Ok(());
            }
        },
        _ => None,
    };

    let mut events = match executor::start(&request, cancel.clone()) {
        Ok(events) => events,
        Err(e) => {
            let outcome: JobOutcome = Err(format!("failed to spawn {}: {e}", request.command));
            codec::send(framed, &WorkerRequest::Exited { id, outcome }).await?;
            return Ok(());
        }
    };

    let outcome = match stream_job(framed, id, &sink, &mut files, &mut events, &cancel).await {
        Ok(outcome) => outcome,
        Err(e) => {
            // Transport is gone; make sure the child does not outlive the
            // job it belongs to.
            cancel.cancel();
            return Err(e);
        }
    };

    if let Some(files) = files {
        if let Err(e) = files.finish().await {
            tracing::warn!(error = %e, "failed to flush output file");
        }
    }
    codec::send(framed, &WorkerRequest::Exited { id, outcome }).await?;
    Ok(())
}

/// Pumps executor events outward while watching the connection for a kill.
/// `Ok` carries the job outcome; `Err` means the transport failed.
async fn stream_job(
    framed: &mut Framed<TcpStream, FrameCodec>,
    id: JobId,
    sink: &SinkSpec,
    files: &mut Option<FileSink>,
    events: &mut tokio::sync::mpsc::Receiver<ExecEvent>,
    cancel: &CancellationToken,
) -> Result<JobOutcome> {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ExecEvent::Output(chunk)) => match sink {
                    SinkSpec::Discard => {}
                    SinkSpec::Files { .. } => {
                        if let Some(files) = files {
                            if let Err(e) = files.write(&chunk).await {
                                cancel.cancel();
                                return Ok(Err(format!("cannot write output file: {e}")));
                            }
                        }
                    }
                    SinkSpec::Stream => {
                        codec::send(framed, &WorkerRequest::Output { id, chunk }).await?;
                    }
                },
                Some(ExecEvent::Exited(code)) => return Ok(Ok(code)),
                None => return Ok(Err("executor stopped unexpectedly".to_string())),
            },
            message = codec::recv::<_, WorkerReply>(framed) => match message? {
                Some(WorkerReply::Kill { id: kill_id }) if kill_id == id => cancel.cancel(),
                Some(_) => {}
                None => return Err(TparError::Disconnected),
            },
        }
    }
}
