//! TCP side of the server: the accept loop and the per-connection sessions
//! that translate framed messages into [`ServerIface`] calls.
//!
//! A connection opens with a [`Hello`] frame declaring its role. Client
//! sessions are request/reply, except that an enqueue with a streamed sink
//! turns into a subscription forwarded frame by frame. Worker sessions act
//! as the remote worker's in-process proxy: they perform request-job on its
//! behalf, feed its output frames into the job's stream, deliver its exit
//! report, and forward kill signals. When the socket drops, the proxy state
//! drops with it, which the job supervisors observe as worker death.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TparError};
use crate::protocol::codec::{self, FrameCodec};
use crate::protocol::rpc::RpcError;
use crate::protocol::{
    ClientReply, ClientRequest, Hello, JobView, OutputChunk, SinkSpec, WorkerReply, WorkerRequest,
};
use crate::pubsub::{StreamEvent, SubPub};
use crate::scheduler::job::{ExitCode, JobId, JobOutcome, OutputSink, WorkerId};
use crate::server::{Assignment, ServerIface};

/// Accepts connections until `shutdown` fires.
pub async fn serve(listener: TcpListener, iface: ServerIface, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("shutdown requested, no longer accepting connections");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let iface = iface.clone();
                    tokio::spawn(handle_connection(stream, peer, iface));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, iface: ServerIface) {
    let mut framed = Framed::new(stream, FrameCodec::new());

    let result = match codec::recv::<_, Hello>(&mut framed).await {
        Ok(Some(Hello::Client)) => {
            tracing::debug!(%peer, "client connected");
            client_session(framed, iface).await
        }
        Ok(Some(Hello::Worker)) => {
            let worker_id = iface.next_worker_id();
            tracing::info!(%peer, worker_id, "worker connected");
            worker_session(framed, worker_id, iface).await
        }
        Ok(None) => Ok(()),
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(()) => tracing::debug!(%peer, "connection closed"),
        // Frame and decode errors are fatal for the connection only.
        Err(e) => tracing::warn!(%peer, error = %e, "connection dropped"),
    }
}

async fn client_session(
    mut framed: Framed<TcpStream, FrameCodec>,
    iface: ServerIface,
) -> Result<()> {
    codec::send(&mut framed, &ClientReply::Welcome).await?;

    while let Some(request) = codec::recv::<_, ClientRequest>(&mut framed).await? {
        match request {
            ClientRequest::Enqueue {
                request,
                sink: SinkSpec::Stream,
            } => {
                let stream = SubPub::new();
                // Subscribe before the job exists so not a single chunk can
                // be missed.
                let subscription = stream.subscribe().await;
                let id = iface
                    .enqueue
                    .call((request, OutputSink::Stream(stream)))
                    .await?;
                codec::send(&mut framed, &ClientReply::Enqueued { id }).await?;

                let Ok(mut subscription) = subscription else {
                    // Unreachable for a freshly built stream; treat it as
                    // the job having produced nothing.
                    codec::send(
                        &mut framed,
                        &ClientReply::StreamFailed {
                            reason: "output stream unavailable".to_string(),
                        },
                    )
                    .await?;
                    continue;
                };

                loop {
                    let reply = match subscription.next().await {
                        Some(StreamEvent::More(chunk)) => ClientReply::Output(chunk),
                        Some(StreamEvent::Done(exit)) => ClientReply::Done { exit },
                        Some(StreamEvent::Failed(reason)) => ClientReply::StreamFailed { reason },
                        None => ClientReply::StreamFailed {
                            reason: "output stream dropped".to_string(),
                        },
                    };
                    let terminal = !matches!(reply, ClientReply::Output(_));
                    codec::send(&mut framed, &reply).await?;
                    if terminal {
                        break;
                    }
                }
            }
            ClientRequest::Enqueue { request, sink } => {
                let sink = match sink {
                    SinkSpec::Discard => OutputSink::Discard,
                    SinkSpec::Files { stdout, stderr } => OutputSink::Files { stdout, stderr },
                    SinkSpec::Stream => unreachable!("handled above"),
                };
                let id = iface.enqueue.call((request, sink)).await?;
                codec::send(&mut framed, &ClientReply::Enqueued { id }).await?;
            }
            ClientRequest::Status(matcher) => {
                let jobs = iface.status.call(matcher).await?;
                let views: Vec<JobView> = jobs.iter().map(JobView::from).collect();
                codec::send(&mut framed, &ClientReply::Jobs(views)).await?;
            }
            ClientRequest::Kill(matcher) => {
                let jobs = iface.kill.call(matcher).await?;
                let views: Vec<JobView> = jobs.iter().map(JobView::from).collect();
                codec::send(&mut framed, &ClientReply::Jobs(views)).await?;
            }
            ClientRequest::Rerun(matcher) => {
                let jobs = iface.rerun.call(matcher).await?;
                let views: Vec<JobView> = jobs.iter().map(JobView::from).collect();
                codec::send(&mut framed, &ClientReply::Jobs(views)).await?;
            }
        }
    }
    Ok(())
}

/// Server-side state for the one job a remote worker is running.
struct ActiveJob {
    id: JobId,
    outcome: Option<oneshot::Sender<JobOutcome>>,
    stream: Option<SubPub<OutputChunk, ExitCode>>,
    cancel: CancellationToken,
    kill_sent: bool,
}

type PendingAssignment = Pin<Box<dyn Future<Output = std::result::Result<Assignment, RpcError>> + Send>>;

async fn worker_session(
    mut framed: Framed<TcpStream, FrameCodec>,
    worker_id: WorkerId,
    iface: ServerIface,
) -> Result<()> {
    codec::send(&mut framed, &WorkerReply::Welcome { worker_id }).await?;

    let mut active: Option<ActiveJob> = None;
    let mut pending: Option<PendingAssignment> = None;

    loop {
        tokio::select! {
            message = codec::recv::<_, WorkerRequest>(&mut framed) => {
                match message? {
                    None => {
                        tracing::info!(worker_id, "worker disconnected");
                        // Dropping `active` and `pending` here is what
                        // tells the supervisors this worker is gone.
                        return Ok(());
                    }
                    Some(WorkerRequest::RequestJob) => {
                        let client = iface.request_job.clone();
                        pending = Some(Box::pin(async move { client.call(worker_id).await }));
                    }
                    Some(WorkerRequest::Output { id, chunk }) => {
                        if let Some(job) = &active {
                            if job.id == id {
                                if let Some(stream) = &job.stream {
                                    // Suspends when subscribers lag behind;
                                    // that backpressure is intentional.
                                    let _ = stream.publish(chunk).await;
                                }
                            }
                        }
                    }
                    Some(WorkerRequest::Exited { id, outcome }) => {
                        if active.as_ref().is_some_and(|job| job.id == id) {
                            let mut job = active.take().expect("checked above");
                            if let Some(stream) = &job.stream {
                                match &outcome {
                                    Ok(exit) => stream.done(*exit).await,
                                    Err(reason) => stream.fail(reason.clone()).await,
                                }
                            }
                            if let Some(tx) = job.outcome.take() {
                                let _ = tx.send(outcome);
                            }
                        }
                    }
                }
            }
            assignment = async { pending.as_mut().expect("guarded by condition").await },
                if pending.is_some() =>
            {
                pending = None;
                match assignment {
                    Ok(assignment) => {
                        let sink_spec = SinkSpec::from(&assignment.sink);
                        codec::send(&mut framed, &WorkerReply::Assigned {
                            id: assignment.id,
                            request: assignment.request,
                            sink: sink_spec,
                        }).await?;
                        active = Some(ActiveJob {
                            id: assignment.id,
                            outcome: Some(assignment.outcome),
                            stream: match assignment.sink {
                                OutputSink::Stream(stream) => Some(stream),
                                _ => None,
                            },
                            cancel: assignment.cancel,
                            kill_sent: false,
                        });
                    }
                    // The job was withdrawn before dispatch; ask again on
                    // the worker's behalf.
                    Err(RpcError::NoReply) => {
                        let client = iface.request_job.clone();
                        pending = Some(Box::pin(async move { client.call(worker_id).await }));
                    }
                    Err(RpcError::Closed) => return Err(TparError::Server(RpcError::Closed)),
                }
            }
            _ = async { active.as_ref().expect("guarded by condition").cancel.cancelled().await },
                if active.as_ref().is_some_and(|job| !job.kill_sent) =>
            {
                let job = active.as_mut().expect("guarded by condition");
                job.kill_sent = true;
                codec::send(&mut framed, &WorkerReply::Kill { id: job.id }).await?;
            }
        }
    }
}
