//! The scheduling and job-lifecycle engine.
//!
//! One serialized dispatch loop owns the [`JobQueue`] and drains five RPC
//! mailboxes: enqueue, request-job, status, kill, and rerun. The caller
//! handles are bundled into a [`ServerIface`], which is what both local
//! workers and the TCP connection layer hold; it is a capability bundle,
//! not an owner of the server.
//!
//! Each request-job call gets its own supervisor task, so an empty queue
//! never blocks the loop. The supervisor claims a job for the requesting
//! worker, hands back an [`Assignment`], and then resolves the job from
//! exactly one of two signals: the worker's outcome report, or the reply
//! channel closing because the worker died.

pub mod connection;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::protocol::rpc::{self, Rpc, RpcClient};
use crate::scheduler::job::{Job, JobId, JobOutcome, JobRequest, JobState, OutputSink, WorkerId};
use crate::scheduler::matcher::JobMatch;
use crate::scheduler::queue::JobQueue;
use crate::worker;

const MAILBOX_CAPACITY: usize = 64;

/// Everything a worker needs to run one job.
#[derive(Debug)]
pub struct Assignment {
    pub id: JobId,
    pub request: JobRequest,
    pub sink: OutputSink,
    /// Reply channel for the job's outcome. Dropping it unanswered is how
    /// the server learns the worker died.
    pub outcome: oneshot::Sender<JobOutcome>,
    /// Cancelled when the job is killed.
    pub cancel: CancellationToken,
}

/// The bundle of RPC caller handles distributed to everything that talks
/// to the server loop.
#[derive(Debug, Clone)]
pub struct ServerIface {
    pub enqueue: RpcClient<(JobRequest, OutputSink), JobId>,
    pub request_job: RpcClient<WorkerId, Assignment>,
    pub status: RpcClient<JobMatch, Vec<Job>>,
    pub kill: RpcClient<JobMatch, Vec<Job>>,
    pub rerun: RpcClient<JobMatch, Vec<Job>>,
    worker_ids: Arc<AtomicU64>,
}

impl ServerIface {
    pub fn next_worker_id(&self) -> WorkerId {
        self.worker_ids.fetch_add(1, Ordering::Relaxed)
    }
}

/// Kill tokens for jobs currently assigned to a worker.
type RunningJobs = Arc<Mutex<HashMap<JobId, CancellationToken>>>;

/// Starts the dispatch loop over `queue`. The loop exits once every clone
/// of the returned [`ServerIface`] has been dropped.
pub fn spawn(queue: Arc<JobQueue>) -> (ServerIface, tokio::task::JoinHandle<()>) {
    let (enqueue, enqueue_rx) = rpc::channel(MAILBOX_CAPACITY);
    let (request_job, request_rx) = rpc::channel(MAILBOX_CAPACITY);
    let (status, status_rx) = rpc::channel(MAILBOX_CAPACITY);
    let (kill, kill_rx) = rpc::channel(MAILBOX_CAPACITY);
    let (rerun, rerun_rx) = rpc::channel(MAILBOX_CAPACITY);

    let iface = ServerIface {
        enqueue,
        request_job,
        status,
        kill,
        rerun,
        worker_ids: Arc::new(AtomicU64::new(0)),
    };

    let handle = tokio::spawn(dispatch_loop(
        queue, enqueue_rx, request_rx, status_rx, kill_rx, rerun_rx,
    ));

    (iface, handle)
}

/// Runs a complete server: dispatch loop, local workers, TCP listener.
/// Returns after the first SIGTERM or SIGINT.
pub async fn run(config: ServerConfig) -> Result<()> {
    let queue = Arc::new(JobQueue::new());
    let (iface, _dispatch) = spawn(queue);

    for _ in 0..config.local_workers {
        let worker_id = iface.next_worker_id();
        tokio::spawn(worker::run_local(iface.clone(), worker_id));
    }
    if config.local_workers > 0 {
        tracing::info!(count = config.local_workers, "started local workers");
    }

    let listener = TcpListener::bind(config.addr()).await?;
    tracing::info!(addr = %config.addr(), "server listening");

    // The accept loop runs until a termination signal wins the race; the
    // token is only for embedders (and tests) that stop serving without
    // signalling the whole process.
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = connection::serve(listener, iface, CancellationToken::new()) => {}
        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
    }
    Ok(())
}

async fn dispatch_loop(
    queue: Arc<JobQueue>,
    mut enqueue_rx: mpsc::Receiver<Rpc<(JobRequest, OutputSink), JobId>>,
    mut request_rx: mpsc::Receiver<Rpc<WorkerId, Assignment>>,
    mut status_rx: mpsc::Receiver<Rpc<JobMatch, Vec<Job>>>,
    mut kill_rx: mpsc::Receiver<Rpc<JobMatch, Vec<Job>>>,
    mut rerun_rx: mpsc::Receiver<Rpc<JobMatch, Vec<Job>>>,
) {
    let running: RunningJobs = Arc::new(Mutex::new(HashMap::new()));

    loop {
        tokio::select! {
            Some(call) = enqueue_rx.recv() => {
                let ((request, sink), replier) = call.into_parts();
                let id = queue.fresh_id().await;
                let job = queue.enqueue(id, request, sink).await;
                tracing::info!(job_id = id, name = %job.request.name, "job enqueued");
                replier.reply(id);
            }
            Some(call) = request_rx.recv() => {
                tokio::spawn(supervise(queue.clone(), running.clone(), call));
            }
            Some(call) = status_rx.recv() => {
                let (matcher, replier) = call.into_parts();
                let jobs = queue.all_jobs().await;
                replier.reply(jobs.into_iter().filter(|j| matcher.matches(j)).collect());
            }
            Some(call) = kill_rx.recv() => {
                handle_kill(&queue, &running, call).await;
            }
            Some(call) = rerun_rx.recv() => {
                handle_rerun(&queue, call).await;
            }
            else => {
                tracing::debug!("all server handles dropped, dispatch loop exiting");
                return;
            }
        }
    }
}

/// Owns one job assignment from claim to terminal state.
async fn supervise(queue: Arc<JobQueue>, running: RunningJobs, call: Rpc<WorkerId, Assignment>) {
    let (worker_id, mut replier) = call.into_parts();

    // Park until a job is available, but give up if the requesting worker
    // goes away first so its slot in the queue is not consumed.
    let job = tokio::select! {
        job = queue.take_queued() => job,
        _ = replier.closed() => return,
    };

    let cancel = CancellationToken::new();
    running.lock().await.insert(job.id, cancel.clone());

    // The token is registered before the claim so a kill arriving from now
    // on always reaches the child.
    if !queue.claim_running(job.id, worker_id).await {
        // Killed between leaving the heap and being claimed. Nothing is
        // replied; the caller retries its request.
        running.lock().await.remove(&job.id);
        return;
    }
    tracing::info!(job_id = job.id, worker_id, "job dispatched");

    let (outcome_tx, outcome_rx) = oneshot::channel();
    let assignment = Assignment {
        id: job.id,
        request: job.request.clone(),
        sink: job.sink.clone(),
        outcome: outcome_tx,
        cancel,
    };

    if !replier.reply(assignment) {
        finalize(&queue, &job, Err("worker disconnected before execution".to_string())).await;
        running.lock().await.remove(&job.id);
        return;
    }

    // Exactly one of: an outcome report, or the worker dying with the
    // channel open.
    let outcome = match outcome_rx.await {
        Ok(outcome) => outcome,
        Err(_) => Err("worker died".to_string()),
    };
    finalize(&queue, &job, outcome).await;
    running.lock().await.remove(&job.id);
}

async fn finalize(queue: &JobQueue, job: &Job, outcome: JobOutcome) {
    match outcome {
        Ok(exit) => {
            if queue.finish(job.id, exit).await {
                tracing::info!(job_id = job.id, %exit, "job finished");
            }
        }
        Err(reason) => {
            if queue.fail(job.id, reason.clone()).await {
                tracing::warn!(job_id = job.id, reason = %reason, "job failed");
            }
            // Watching clients must not hang on a job that will never
            // produce an exit code.
            if let OutputSink::Stream(stream) = &job.sink {
                stream.fail(reason).await;
            }
        }
    }
}

async fn handle_kill(queue: &JobQueue, running: &RunningJobs, call: Rpc<JobMatch, Vec<Job>>) {
    let (matcher, replier) = call.into_parts();

    for job in queue.all_jobs().await {
        if !matcher.matches(&job) || job.state.is_terminal() {
            continue;
        }
        if let Some(token) = running.lock().await.get(&job.id) {
            // Best-effort terminate; the supervisor settles the final state
            // from whichever signal arrives first.
            token.cancel();
        }
        if queue.kill(job.id).await {
            tracing::info!(job_id = job.id, "job killed");
            // A job killed straight out of the queue has no supervisor to
            // close its stream, so its watchers are released here.
            if matches!(job.state, JobState::Queued { .. }) {
                if let OutputSink::Stream(stream) = &job.sink {
                    stream.fail("job killed before it ran").await;
                }
            }
        }
    }

    // Reported from a fresh snapshot: a job whose exit raced the kill and
    // won shows up as finished, not killed, and is omitted.
    let killed = queue
        .all_jobs()
        .await
        .into_iter()
        .filter(|j| matcher.matches(j) && matches!(j.state, JobState::Killed { .. }))
        .collect();
    replier.reply(killed);
}

async fn handle_rerun(queue: &JobQueue, call: Rpc<JobMatch, Vec<Job>>) {
    let (matcher, replier) = call.into_parts();

    let mut created = Vec::new();
    for job in queue.all_jobs().await {
        if !matcher.matches(&job) || !job.state.is_terminal() {
            continue;
        }
        let id = queue.fresh_id().await;
        // A live output stream cannot be replayed to its original
        // subscribers, so reruns of streamed jobs discard their output.
        let sink = match &job.sink {
            OutputSink::Stream(_) => OutputSink::Discard,
            other => other.clone(),
        };
        let new_job = queue.enqueue(id, job.request.clone(), sink).await;
        tracing::info!(job_id = id, rerun_of = job.id, "job re-enqueued");
        created.push(new_job);
    }
    replier.reply(created);
}
