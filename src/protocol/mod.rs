//! Wire protocol: the framed codec, the in-process RPC primitive, and the
//! message types exchanged over TCP.

pub mod codec;
pub mod rpc;

use serde::{Deserialize, Serialize};

use crate::scheduler::job::{ExitCode, Job, JobId, JobOutcome, JobRequest, JobState, OutputSink, WorkerId};
use crate::scheduler::matcher::JobMatch;

/// One chunk of child output, tagged with the stream it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

impl OutputChunk {
    pub fn data(&self) -> &[u8] {
        match self {
            OutputChunk::Stdout(data) | OutputChunk::Stderr(data) => data,
        }
    }
}

/// First frame on every connection, declaring the peer's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Hello {
    Client,
    Worker,
}

/// Where a job's output should go, as expressed on the wire. `Files` paths
/// are interpreted on the executing worker's filesystem; `Stream` means the
/// output is fanned out to subscribed clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SinkSpec {
    Discard,
    Files { stdout: String, stderr: String },
    Stream,
}

impl From<&OutputSink> for SinkSpec {
    fn from(sink: &OutputSink) -> Self {
        match sink {
            OutputSink::Discard => SinkSpec::Discard,
            OutputSink::Files { stdout, stderr } => SinkSpec::Files {
                stdout: stdout.clone(),
                stderr: stderr.clone(),
            },
            OutputSink::Stream(_) => SinkSpec::Stream,
        }
    }
}

/// Serializable projection of a [`Job`] for status replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub request: JobRequest,
    pub output: SinkSpec,
    pub state: JobState,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            request: job.request.clone(),
            output: SinkSpec::from(&job.sink),
            state: job.state.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientRequest {
    Enqueue { request: JobRequest, sink: SinkSpec },
    Status(JobMatch),
    Kill(JobMatch),
    Rerun(JobMatch),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientReply {
    Welcome,
    Enqueued { id: JobId },
    Jobs(Vec<JobView>),
    /// Streamed output for a watched job.
    Output(OutputChunk),
    /// Terminal frame of a watched job's stream.
    Done { exit: ExitCode },
    /// The watched job died without producing an exit code.
    StreamFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerRequest {
    /// Ask for the next job. The server replies with `Assigned` once one is
    /// available, however long that takes.
    RequestJob,
    Output { id: JobId, chunk: OutputChunk },
    Exited { id: JobId, outcome: JobOutcome },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerReply {
    Welcome { worker_id: WorkerId },
    Assigned {
        id: JobId,
        request: JobRequest,
        sink: SinkSpec,
    },
    /// Out-of-band terminate for a job this worker is running.
    Kill { id: JobId },
}
