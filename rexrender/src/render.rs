//! The seams through which a worker hands a job to the code that actually renders it.
//!
//! - [`Renderer`] turns a prepared job into output. It reports progress and intermediate
//!   errors through the [`RenderReporter`] it is given.
//! - [`JobPreparer`]s run in order before the renderer and may rewrite the job, e.g. to add
//!   default actions or resolve asset locations.
//! - [`WorkerHooks`] observe the lifecycle of every job.
use async_trait::async_trait;
use thiserror::Error;

use crate::{
    job::{Job, RenderingStatus},
    queue::QueueError,
};

/// Where a [`RenderError`] originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderErrorKind {
    /// The rendering engine failed.
    Engine,
    /// A [`JobPreparer`] rejected the job.
    Preparation,
    /// Reporting progress to the queue service failed, see [`RenderReporter::progress`].
    Reporting,
}

/// A failure while preparing or rendering a job.
///
/// The message is what ends up in the job's `error` list on the queue service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RenderError {
    pub kind: RenderErrorKind,
    pub message: String,
}

impl RenderError {
    pub fn engine(message: impl ToString) -> Self {
        Self {
            kind: RenderErrorKind::Engine,
            message: message.to_string(),
        }
    }

    pub fn preparation(message: impl ToString) -> Self {
        Self {
            kind: RenderErrorKind::Preparation,
            message: message.to_string(),
        }
    }
}

impl From<QueueError> for RenderError {
    fn from(value: QueueError) -> Self {
        Self {
            kind: RenderErrorKind::Reporting,
            message: value.to_string(),
        }
    }
}

/// Renders a single job.
///
/// # Example
///
/// ```
/// # use rexrender::prelude::*;
/// struct Instant;
///
/// #[async_trait::async_trait]
/// impl Renderer for Instant {
///     async fn render(&self, mut job: Job, reporter: &dyn RenderReporter) -> Result<Job, RenderError> {
///         reporter.progress(&mut job, 50.0).await?;
///         reporter.progress(&mut job, 100.0).await?;
///         Ok(job)
///     }
/// }
/// ```
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Renders `job`, returning the job as it should be reported once finished.
    async fn render(&self, job: Job, reporter: &dyn RenderReporter) -> Result<Job, RenderError>;
}

/// Reports on a job while it renders.
#[async_trait]
pub trait RenderReporter: Send + Sync {
    /// Records `percent` on the job and reports it to the queue service.
    ///
    /// An error is only returned when the worker is configured to stop on errors; the
    /// renderer should then abort the render and return it.
    async fn progress(&self, job: &mut Job, percent: f64) -> Result<(), RenderError>;

    /// Records an error that did not abort the render.
    ///
    /// The error is appended to the job and reported right away. It is also carried over
    /// into the job's final error list should the render fail later on.
    async fn error(&self, job: &mut Job, error: &RenderError);
}

/// Transforms a job before it is rendered.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobPreparer: Send + Sync {
    async fn prepare(&self, job: Job) -> Result<Job, RenderError>;
}

/// Callbacks invoked at each step of a job's life.
///
/// Hooks run inline on the worker task and should return quickly.
#[cfg_attr(test, mockall::automock)]
pub trait WorkerHooks: Send + Sync {
    /// A progress update was accepted by the queue service.
    fn on_render_progress(&self, _status: &RenderingStatus) {}

    /// A non fatal error was reported during the render.
    fn on_render_error(&self, _status: &RenderingStatus, _error: &RenderError) {}

    /// The job rendered successfully.
    fn on_finished(&self, _status: &RenderingStatus) {}

    /// The job failed.
    fn on_error(&self, _status: &RenderingStatus) {}
}

/// [`WorkerHooks`] that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl WorkerHooks for NoHooks {}

#[cfg(test)]
pub(crate) mod test {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;

    /// A [`Renderer`] that plays back a fixed script for every job it is given.
    #[derive(Clone, Default)]
    pub(crate) struct TestRenderer {
        progress: Vec<f64>,
        render_errors: Vec<String>,
        failure: Option<String>,
        duration: Option<Duration>,
        rebuild: bool,
        rendered: Arc<Mutex<Vec<Job>>>,
    }

    impl TestRenderer {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with_progress(self, progress: impl IntoIterator<Item = f64>) -> Self {
            Self {
                progress: progress.into_iter().collect(),
                ..self
            }
        }

        pub(crate) fn with_render_errors<'a>(self, errors: impl IntoIterator<Item = &'a str>) -> Self {
            Self {
                render_errors: errors.into_iter().map(ToOwned::to_owned).collect(),
                ..self
            }
        }

        pub(crate) fn failing_with(self, message: &str) -> Self {
            Self {
                failure: Some(message.to_owned()),
                ..self
            }
        }

        pub(crate) fn taking(self, duration: Duration) -> Self {
            Self {
                duration: Some(duration),
                ..self
            }
        }

        /// The jobs handed to the renderer so far.
        /// Returns a freshly built job with only the uid of the one it was given.
        pub(crate) fn rebuilding_the_job(self) -> Self {
            Self {
                rebuild: true,
                ..self
            }
        }

        pub(crate) fn rendered(&self) -> Vec<Job> {
            self.rendered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Renderer for TestRenderer {
        async fn render(
            &self,
            mut job: Job,
            reporter: &dyn RenderReporter,
        ) -> Result<Job, RenderError> {
            self.rendered.lock().unwrap().push(job.clone());
            if let Some(duration) = self.duration {
                tokio::time::sleep(duration).await;
            }
            for percent in &self.progress {
                reporter.progress(&mut job, *percent).await?;
            }
            for message in &self.render_errors {
                reporter.error(&mut job, &RenderError::engine(message)).await;
            }
            match &self.failure {
                Some(message) => Err(RenderError::engine(message)),
                None if self.rebuild => Ok(Job::new(job.uid)),
                None => Ok(job),
            }
        }
    }

    #[test]
    fn render_error_displays_its_message() {
        let error = RenderError::engine("aerender exited with code 1");

        assert_eq!(error.to_string(), "aerender exited with code 1");
        assert_eq!(error.kind, RenderErrorKind::Engine);
    }

    #[test]
    fn queue_errors_become_reporting_errors() {
        let error = RenderError::from(QueueError::Status {
            status: 500,
            message: "boom".to_owned(),
        });

        assert_eq!(error.kind, RenderErrorKind::Reporting);
        assert!(error.message.contains("500"));
    }
}
