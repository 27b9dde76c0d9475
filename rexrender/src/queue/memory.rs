//! Provides an in memory implementation of [`QueueClient`].
//!
//! Currently this is provided for testing purposes and not designed for use in a production system.
//!
//! Besides handing out jobs it records every status update it receives, and failures or slow
//! responses can be scripted to exercise the worker's error handling.
use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;

use super::{QueueClient, QueueError};
use crate::job::{Job, JobState, JobUid, RenderingStatus};

/// An in memory implementation of [`QueueClient`].
///
/// Cloning the queue is cheap and all clones share the same state, so a test can hand one
/// clone to a worker and inspect the other.
///
/// **This is not designed for use in a production systems.**
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    queued: VecDeque<Job>,
    updates: Vec<RenderingStatus>,
    acquisitions: usize,
    acquire_failures: VecDeque<QueueError>,
    acquire_delay: Option<Duration>,
    failing_states: HashSet<JobState>,
}

impl InMemoryQueue {
    /// Creates a new, empty, instance of [`InMemoryQueue`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a job to the back of the queue.
    pub fn with_job(self, job: Job) -> Self {
        self.push(job);
        self
    }

    /// Adds a job to the back of the queue.
    pub fn push(&self, job: Job) {
        self.lock().queued.push_back(job);
    }

    /// The next call to [`QueueClient::acquire`] fails with `error`.
    ///
    /// Calling this repeatedly queues up several failures, returned in order.
    pub fn fail_next_acquire(&self, error: QueueError) {
        self.lock().acquire_failures.push_back(error);
    }

    /// Every call to [`QueueClient::acquire`] waits `delay` before answering.
    pub fn delay_acquire(&self, delay: Duration) {
        self.lock().acquire_delay = Some(delay);
    }

    /// Every update reporting `state` is rejected.
    pub fn fail_updates_in_state(&self, state: JobState) {
        self.lock().failing_states.insert(state);
    }

    /// Number of jobs still waiting in the queue.
    pub fn pending(&self) -> usize {
        self.lock().queued.len()
    }

    /// Number of calls made to [`QueueClient::acquire`].
    pub fn acquisitions(&self) -> usize {
        self.lock().acquisitions
    }

    /// All updates accepted so far, in the order they were received.
    pub fn updates(&self) -> Vec<RenderingStatus> {
        self.lock().updates.clone()
    }

    /// The states reported for the job `uid`, in the order they were received.
    pub fn reported_states(&self, uid: &JobUid) -> Vec<JobState> {
        self.lock()
            .updates
            .iter()
            .filter(|status| &status.uid == uid)
            .map(|status| status.state)
            .collect()
    }

    /// The most recent status reported for the job `uid`.
    pub fn last_status(&self, uid: &JobUid) -> Option<RenderingStatus> {
        self.lock()
            .updates
            .iter()
            .rev()
            .find(|status| &status.uid == uid)
            .cloned()
    }

    // A panicking test thread must not hide the recorded updates from the assertions that
    // follow, so a poisoned lock is still read.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn acquire(&self, tag_selector: Option<&str>) -> Result<Option<Job>, QueueError> {
        let delay = {
            let mut inner = self.inner.lock().map_err(|_| QueueError::BadState)?;
            inner.acquisitions += 1;
            inner.acquire_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock().map_err(|_| QueueError::BadState)?;
        if let Some(error) = inner.acquire_failures.pop_front() {
            return Err(error);
        }
        let position = inner
            .queued
            .iter()
            .position(|job| tag_selector.map_or(true, |selector| job.matches_tags(selector)));
        Ok(position.and_then(|position| inner.queued.remove(position)))
    }

    async fn update(&self, uid: &JobUid, status: &RenderingStatus) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().map_err(|_| QueueError::BadState)?;
        if inner.failing_states.contains(&status.state) {
            return Err(QueueError::Status {
                status: 503,
                message: format!("Rejected update of job {uid} to {}", status.state),
            });
        }
        inner.updates.push(status.clone());
        Ok(())
    }
}
