use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use chrono::Utc;
use tokio::sync::{Mutex, Notify};

use crate::scheduler::job::{ExitCode, Job, JobId, JobRequest, JobState, OutputSink, WorkerId};

/// The server-owned job store: a fresh-id counter, a priority heap of
/// queued jobs, and the id-to-job map.
///
/// Dispatch order: the job with the numerically smallest priority value is
/// taken first, ties going to the smaller (older) id. Every queued job has
/// exactly one heap entry; jobs in any other state have none.
///
/// All mutation happens under one lock, with [`JobQueue::take_queued`]
/// parking on a [`Notify`] until an enqueue makes work available.
#[derive(Debug, Default)]
pub struct JobQueue {
    inner: Mutex<Inner>,
    available: Notify,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: JobId,
    heap: BinaryHeap<Reverse<(i64, JobId)>>,
    jobs: HashMap<JobId, Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next job id.
    pub async fn fresh_id(&self) -> JobId {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }

    /// Inserts a new queued job and wakes anyone parked in `take_queued`.
    pub async fn enqueue(&self, id: JobId, request: JobRequest, sink: OutputSink) -> Job {
        let job = Job {
            id,
            request,
            sink,
            state: JobState::queued_now(),
        };
        {
            let mut inner = self.inner.lock().await;
            inner.heap.push(Reverse((job.request.priority, id)));
            inner.jobs.insert(id, job.clone());
        }
        self.available.notify_waiters();
        job
    }

    /// Removes and returns the next queued job in dispatch order, parking
    /// without busy-waiting while the heap is empty.
    pub async fn take_queued(&self) -> Job {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register for wakeup before checking, so an enqueue landing
            // between the check and the await is not lost.
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                while let Some(Reverse((_, id))) = inner.heap.pop() {
                    if let Some(job) = inner.jobs.get(&id) {
                        return job.clone();
                    }
                }
            }

            notified.await;
        }
    }

    pub async fn get(&self, id: JobId) -> Option<Job> {
        self.inner.lock().await.jobs.get(&id).cloned()
    }

    /// Applies `update` to the job under the lock, returning its result.
    /// `None` if the id is unknown.
    pub async fn update<T>(&self, id: JobId, update: impl FnOnce(&mut Job) -> T) -> Option<T> {
        let mut inner = self.inner.lock().await;
        inner.jobs.get_mut(&id).map(update)
    }

    /// Claims a queued job for a worker. Returns false if the job is no
    /// longer queued (raced with a kill), in which case the caller must not
    /// dispatch it.
    pub async fn claim_running(&self, id: JobId, worker: WorkerId) -> bool {
        self.update(id, |job| match job.state {
            JobState::Queued { .. } => {
                job.state = JobState::Running {
                    worker,
                    started_at: Utc::now(),
                };
                true
            }
            _ => false,
        })
        .await
        .unwrap_or(false)
    }

    /// Records a running job's exit code. A no-op once the job has reached
    /// a terminal state, so a late exit never overwrites a kill.
    pub async fn finish(&self, id: JobId, exit: ExitCode) -> bool {
        self.update(id, |job| match job.state {
            JobState::Running { .. } => {
                job.state = JobState::Finished {
                    exit,
                    finished_at: Utc::now(),
                };
                true
            }
            _ => false,
        })
        .await
        .unwrap_or(false)
    }

    /// Marks a running job as failed. Same terminal-state guard as `finish`.
    pub async fn fail(&self, id: JobId, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.update(id, |job| match job.state {
            JobState::Running { .. } => {
                job.state = JobState::Failed {
                    reason,
                    failed_at: Utc::now(),
                };
                true
            }
            _ => false,
        })
        .await
        .unwrap_or(false)
    }

    /// Kills a queued or running job: the state becomes `Killed` and a
    /// queued job's heap entry is removed, all under one lock. Jobs already
    /// in a terminal state are left alone. Returns whether a transition
    /// happened.
    pub async fn kill(&self, id: JobId) -> bool {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let Some(job) = inner.jobs.get_mut(&id) else {
            return false;
        };
        match job.state {
            JobState::Queued { .. } => {
                job.state = JobState::Killed {
                    killed_at: Utc::now(),
                };
                inner.heap.retain(|Reverse((_, entry))| *entry != id);
                true
            }
            JobState::Running { .. } => {
                job.state = JobState::Killed {
                    killed_at: Utc::now(),
                };
                true
            }
            _ => false,
        }
    }

    /// Snapshot of every job, in no particular order.
    pub async fn all_jobs(&self) -> Vec<Job> {
        self.inner.lock().await.jobs.values().cloned().collect()
    }

    /// Number of jobs currently queued for dispatch.
    pub async fn queued_len(&self) -> usize {
        self.inner.lock().await.heap.len()
    }
}
