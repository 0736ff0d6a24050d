pub mod job;
pub mod matcher;
pub mod queue;

pub use job::{ExitCode, Job, JobId, JobRequest, JobState, OutputSink, WorkerId};
pub use matcher::JobMatch;
pub use queue::JobQueue;
