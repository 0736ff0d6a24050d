use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::OutputChunk;
use crate::pubsub::SubPub;

/// Allocated by the server, monotonically increasing, never reused for the
/// lifetime of the server process.
pub type JobId = u64;

pub type WorkerId = u64;

/// What a worker reports back for one job: the child's exit code, or a
/// reason the job could not produce one (spawn failure, unwritable output
/// file). Worker death is observed separately, by the reply channel closing.
pub type JobOutcome = Result<ExitCode, String>;

/// The immutable submission record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: String,
    /// Numerically smaller values are dispatched first; see [`super::queue::JobQueue`].
    pub priority: i64,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: String,
    /// `None` inherits the worker's environment; `Some(map)` replaces it.
    pub env: Option<HashMap<String, String>>,
}

impl Default for JobRequest {
    fn default() -> Self {
        Self {
            name: "unnamed-job".to_string(),
            priority: 0,
            command: String::new(),
            args: Vec::new(),
            cwd: ".".to_string(),
            env: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitCode {
    Success,
    Failure(i32),
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::Failure(code) => code,
        }
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "exit {}", self.code())
    }
}

/// Where the child's combined output goes.
#[derive(Debug, Clone)]
pub enum OutputSink {
    Discard,
    /// If the paths are equal a single file is opened and shared by both
    /// streams.
    Files { stdout: String, stderr: String },
    /// Fan-out to subscribed clients.
    Stream(SubPub<OutputChunk, ExitCode>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobState {
    Queued {
        queued_at: DateTime<Utc>,
    },
    Running {
        worker: WorkerId,
        started_at: DateTime<Utc>,
    },
    Finished {
        exit: ExitCode,
        finished_at: DateTime<Utc>,
    },
    Failed {
        reason: String,
        failed_at: DateTime<Utc>,
    },
    Killed {
        killed_at: DateTime<Utc>,
    },
}

impl JobState {
    pub fn queued_now() -> Self {
        JobState::Queued {
            queued_at: Utc::now(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobState::Queued { .. } => "queued",
            JobState::Running { .. } => "running",
            JobState::Finished { .. } => "finished",
            JobState::Failed { .. } => "failed",
            JobState::Killed { .. } => "killed",
        }
    }

    /// Terminal states are left only by rerun, which creates a new job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Finished { .. } | JobState::Failed { .. } | JobState::Killed { .. }
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued { .. } => write!(f, "queued"),
            JobState::Running { worker, .. } => write!(f, "running on worker {worker}"),
            JobState::Finished { exit, .. } => write!(f, "{exit}"),
            JobState::Failed { reason, .. } => write!(f, "failed: {reason}"),
            JobState::Killed { .. } => write!(f, "killed"),
        }
    }
}

/// A submitted unit of work plus its lifecycle state. The request and sink
/// are fixed at creation; only `state` changes, and only inside the queue's
/// locked regions.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub request: JobRequest,
    pub sink: OutputSink,
    pub state: JobState,
}
