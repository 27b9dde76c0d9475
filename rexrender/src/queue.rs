//! The interface between the worker and the remote job queue.
//!
//! The worker only needs two operations from the queue service: acquiring the next job and
//! reporting a job's [`RenderingStatus`]. [`QueueClient`] captures exactly those.
//!
//! An in memory implementation, [`memory::InMemoryQueue`], is provided for testing.
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::job::{Job, JobUid, RenderingStatus};

pub mod memory;

/// A client for the remote job queue.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Acquire the next available job.
    ///
    /// Returns `Ok(None)` when the queue has no job for this worker. If `tag_selector` is
    /// given, only jobs carrying all of the comma separated tags may be returned.
    async fn acquire(&self, tag_selector: Option<&str>) -> Result<Option<Job>, QueueError>;

    /// Report the latest status of a job.
    ///
    /// Sending the same status twice must be harmless, though the worker never retries an
    /// update itself.
    async fn update(&self, uid: &JobUid, status: &RenderingStatus) -> Result<(), QueueError>;
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue request did not complete within {0:?}")]
    Timeout(Duration),
    #[error("Error communicating with the queue service: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Queue service responded with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Error encoding or decoding data")]
    Decode(#[from] serde_json::Error),
    #[error("Queue in bad state")]
    BadState,
}
