//! A render worker that acquires jobs from a remote queue and drives each of them through its
//! lifecycle, reporting every step back to the queue service.
//!
//! The worker is built from two collaborators:
//!
//! - a [`QueueClient`](queue::QueueClient) to acquire jobs and report their status, and
//! - a [`Renderer`](render::Renderer) which does the actual rendering.
//!
//! Exactly one job is in flight at any time. The worker keeps polling the queue until its
//! [`ShutdownPolicy`](shutdown::ShutdownPolicy) decides otherwise, [`WorkerHandle::stop`] is
//! called, or the process is interrupted.
//!
//! # Example
//!
//! ```
//! # use rexrender::prelude::*;
//! # use rexrender::queue::memory::InMemoryQueue;
//! struct Instant;
//!
//! #[async_trait::async_trait]
//! impl Renderer for Instant {
//!     async fn render(&self, job: Job, _reporter: &dyn RenderReporter) -> Result<Job, RenderError> {
//!         Ok(job)
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let queue = InMemoryQueue::new().with_job(Job::new("J1"));
//! let settings = WorkerSettings::default()
//!     .with_exit_on_empty_queue(true)
//!     .with_tolerate_empty_queues(0);
//!
//! let exit = Worker::new(queue.clone(), Instant, settings).start().await.unwrap();
//!
//! assert_eq!(exit, WorkerExit::Deactivated);
//! assert_eq!(queue.reported_states(&"J1".into()), vec![JobState::Started, JobState::Finished]);
//! # });
//! ```
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

use chrono::Local;
use thiserror::Error;
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;

pub mod backoff;
pub mod job;
pub mod prelude;
pub mod queue;
pub mod render;
pub mod settings;
pub mod shutdown;
pub mod testing;

mod acquisition;

use acquisition::JobAcquisition;
use job::{runner::JobExecutor, Job, JobUid};
use queue::{QueueClient, QueueError};
use render::{JobPreparer, NoHooks, RenderError, Renderer, WorkerHooks};
use settings::{ResolvedSettings, SettingsError, WorkerSettings};
use shutdown::{ShutdownPolicy, ShutdownSchedule, StopSignal};

/// The worker controller.
///
/// Owns the queue client, the renderer and the worker's settings, and runs the
/// acquire-then-render loop once [`Worker::start`] is called. Obtain a [`WorkerHandle`] before
/// starting to control the worker from elsewhere.
pub struct Worker<Q, R> {
    client: Q,
    renderer: R,
    settings: WorkerSettings,
    preparers: Vec<Box<dyn JobPreparer>>,
    hooks: Box<dyn WorkerHooks>,
    stop_signal: Option<Box<dyn StopSignal>>,
    state: Arc<WorkerState>,
    interrupt: CancellationToken,
}

/// Why a worker stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The worker was stopped, its schedule elapsed, or the queue stayed empty.
    Deactivated,
    /// The worker was interrupted. Any job it was rendering has been handed back to the queue.
    Interrupted,
}

impl<Q, R> Worker<Q, R>
where
    Q: QueueClient,
    R: Renderer,
{
    pub fn new(client: Q, renderer: R, settings: WorkerSettings) -> Self {
        Self {
            client,
            renderer,
            settings,
            preparers: Vec::new(),
            hooks: Box::new(NoHooks),
            stop_signal: None,
            state: Default::default(),
            interrupt: CancellationToken::new(),
        }
    }

    /// Adds a preparer to run before each render. Preparers run in the order they are added.
    pub fn with_preparer(mut self, preparer: impl JobPreparer + 'static) -> Self {
        self.preparers.push(Box::new(preparer));
        self
    }

    pub fn with_hooks(mut self, hooks: impl WorkerHooks + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    /// Stops the worker between jobs whenever `stop_signal` is raised. Replaces the lock file
    /// configured in the settings.
    pub fn with_stop_signal(mut self, stop_signal: impl StopSignal + 'static) -> Self {
        self.stop_signal = Some(Box::new(stop_signal));
        self
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            state: self.state.clone(),
            interrupt: self.interrupt.clone(),
        }
    }

    /// Runs the worker until it deactivates or is interrupted.
    ///
    /// Returns an error if the settings are invalid, or if a failure occurs while the worker
    /// is configured to stop on errors.
    pub async fn start(self) -> Result<WorkerExit, WorkerError> {
        let settings = self.settings.clone().resolve()?;
        self.run(settings).await
    }

    async fn run(mut self, settings: ResolvedSettings) -> Result<WorkerExit, WorkerError> {
        tracing::info!(?settings, "Starting render worker");

        let schedule = settings.stop_at_time.and_then(|at| {
            ShutdownSchedule::next(&Local::now(), at, settings.stop_days.as_ref())
        });
        let mut policy = ShutdownPolicy::new(&settings, schedule);
        if let Some(stop_signal) = self.stop_signal.take() {
            policy = policy.with_stop_signal(stop_signal);
        }
        if let Some(schedule) = policy.schedule() {
            tracing::info!(
                stop_at = %schedule.stop_at(),
                "Worker will stop at {}",
                schedule.stop_at()
            );
        }

        self.state.activate();
        let listener = if settings.handle_interruption {
            let listener = listen_for_interruption(self.interrupt.clone())
                .map_err(WorkerError::SignalHandler)?;
            Some(listener)
        } else {
            None
        };

        let mut acquisition = JobAcquisition::new(policy);
        let executor = JobExecutor::new(
            &self.client,
            &self.renderer,
            &self.preparers,
            self.hooks.as_ref(),
            &settings,
        );
        let result = self.run_loop(&mut acquisition, &executor, &settings).await;

        if let Some(listener) = listener {
            listener.abort();
        }
        self.state.deactivate();
        tracing::info!(?result, "Render worker stopped");
        result
    }

    async fn run_loop(
        &self,
        acquisition: &mut JobAcquisition,
        executor: &JobExecutor<'_>,
        settings: &ResolvedSettings,
    ) -> Result<WorkerExit, WorkerError> {
        while self.state.is_active() {
            let next = tokio::select! {
                biased;
                _ = self.interrupt.cancelled() => return Ok(WorkerExit::Interrupted),
                next = acquisition.next(&self.client, settings, &self.state) => next?,
            };
            let Some(mut job) = next else {
                break;
            };
            if !self.state.is_active() {
                tracing::info!(job_uid = %job.uid, "Worker stopped while acquiring job {}", job.uid);
                executor.requeue(&mut job).await;
                break;
            }

            self.state.set_current_job(Some(job.uid.clone()));
            let outcome = tokio::select! {
                biased;
                _ = self.interrupt.cancelled() => None,
                outcome = executor.run(&mut job) => Some(outcome),
            };
            let outcome = match outcome {
                Some(outcome) => outcome,
                None => {
                    self.handle_interruption(executor, &mut job).await;
                    return Ok(WorkerExit::Interrupted);
                }
            };
            self.state.set_current_job(None);
            tracing::debug!(?outcome, "Job execution complete");
            outcome?;

            tokio::select! {
                biased;
                _ = self.interrupt.cancelled() => return Ok(WorkerExit::Interrupted),
                _ = executor.pause_between_jobs() => {},
            }
        }
        Ok(WorkerExit::Deactivated)
    }

    async fn handle_interruption(&self, executor: &JobExecutor<'_>, job: &mut Job) {
        tracing::info!(job_uid = %job.uid, "Worker interrupted while rendering job {}", job.uid);
        self.state.deactivate();
        executor.requeue(job).await;
        self.state.set_current_job(None);
    }
}

/// A cheap to clone handle used to control a [`Worker`] from another task.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    state: Arc<WorkerState>,
    interrupt: CancellationToken,
}

impl WorkerHandle {
    /// Asks the worker to stop once its current job is done.
    ///
    /// A render in progress is never aborted. A job acquired after this call is handed back
    /// to the queue.
    pub fn stop(&self) {
        tracing::info!("Stopping render worker");
        self.state.deactivate();
    }

    pub fn is_running(&self) -> bool {
        self.state.is_active()
    }

    /// The uid of the job currently being rendered, if any.
    pub fn current_job(&self) -> Option<JobUid> {
        self.state.current_job()
    }

    /// Interrupts the worker as a termination signal would, returning any job in progress to
    /// the queue.
    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }
}

/// State shared between a running worker and its handles.
#[derive(Debug, Default)]
pub(crate) struct WorkerState {
    active: AtomicBool,
    current_job: Mutex<Option<JobUid>>,
    stop: Notify,
}

impl WorkerState {
    pub(crate) fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.stop.notify_one();
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Completes once the worker has been deactivated.
    pub(crate) async fn stopped(&self) {
        while self.is_active() {
            self.stop.notified().await;
        }
    }

    fn current_job(&self) -> Option<JobUid> {
        self.current_job
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_current_job(&self, uid: Option<JobUid>) {
        *self
            .current_job
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = uid;
    }
}

fn listen_for_interruption(interrupt: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => tracing::info!("Received SIGINT"),
                _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
            }
            interrupt.cancel();
        }))
    }
    #[cfg(not(unix))]
    {
        Ok(tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Received Ctrl-C");
                    interrupt.cancel();
                }
                Err(error) => tracing::error!(?error, "Failed to listen for Ctrl-C: {error}"),
            }
        }))
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Error acquiring a job")]
    Acquisition(#[source] QueueError),
    #[error("Error reporting the state of job {uid}")]
    StateUpdate {
        uid: JobUid,
        #[source]
        source: QueueError,
    },
    #[error("Job {uid} failed: {source}")]
    Render {
        uid: JobUid,
        #[source]
        source: RenderError,
    },
    #[error("Invalid worker settings")]
    Settings(#[from] SettingsError),
    #[error("Error installing the termination signal handler")]
    SignalHandler(#[source] std::io::Error),
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        job::JobState,
        queue::memory::InMemoryQueue,
        render::{test::TestRenderer, MockWorkerHooks},
        testing::assert_reported,
    };

    fn settings() -> ResolvedSettings {
        ResolvedSettings {
            exit_on_empty_queue: true,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn renders_jobs_until_the_queue_is_empty() {
        let queue = InMemoryQueue::new()
            .with_job(Job::new("J1"))
            .with_job(Job::new("J2"));
        let renderer = TestRenderer::new();
        let worker = Worker::new(queue.clone(), renderer.clone(), Default::default());
        let handle = worker.handle();

        let exit = worker.run(settings()).await;

        assert_matches!(exit, Ok(WorkerExit::Deactivated));
        assert_eq!(renderer.rendered().len(), 2);
        assert_reported!(to: queue, job: "J1", states: [JobState::Started, JobState::Finished]);
        assert_reported!(to: queue, job: "J2", states: [JobState::Started, JobState::Finished]);
        assert!(!handle.is_running());
        assert_eq!(handle.current_job(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_jobs_do_not_stop_the_worker() {
        let queue = InMemoryQueue::new()
            .with_job(Job::new("J1"))
            .with_job(Job::new("J2"));
        let renderer = TestRenderer::new().failing_with("timeout");

        let exit = Worker::new(queue.clone(), renderer.clone(), Default::default())
            .run(settings())
            .await;

        assert_matches!(exit, Ok(WorkerExit::Deactivated));
        assert_reported!(to: queue, job: "J1", state: JobState::Error);
        assert_reported!(to: queue, job: "J2", state: JobState::Error);
        assert_eq!(
            queue.last_status(&"J1".into()).map(|status| status.error),
            Some(vec!["timeout".to_owned()])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_on_error_stops_after_the_first_failure() {
        let queue = InMemoryQueue::new()
            .with_job(Job::new("J1"))
            .with_job(Job::new("J2"));
        let renderer = TestRenderer::new().failing_with("timeout");
        let worker = Worker::new(queue.clone(), renderer.clone(), Default::default());
        let handle = worker.handle();

        let exit = worker
            .run(ResolvedSettings {
                stop_on_error: true,
                ..settings()
            })
            .await;

        assert_matches!(exit, Err(WorkerError::Render { uid, .. }) if uid == JobUid::from("J1"));
        assert_reported!(to: queue, job: "J1", state: JobState::Error);
        assert_eq!(queue.pending(), 1);
        assert!(!handle.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_jobs_are_skipped() {
        let queue = InMemoryQueue::new()
            .with_job(Job::new("J1"))
            .with_job(Job::new("J2"));
        queue.fail_updates_in_state(JobState::Started);
        let renderer = TestRenderer::new();

        let exit = Worker::new(queue.clone(), renderer.clone(), Default::default())
            .run(settings())
            .await;

        assert_matches!(exit, Ok(WorkerExit::Deactivated));
        assert!(renderer.rendered().is_empty());
        assert_eq!(queue.acquisitions(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_lets_the_current_job_finish() {
        let queue = InMemoryQueue::new()
            .with_job(Job::new("J1"))
            .with_job(Job::new("J2"));
        let renderer = TestRenderer::new().taking(Duration::from_secs(10));
        let worker = Worker::new(queue.clone(), renderer.clone(), Default::default());
        let handle = worker.handle();
        tokio::spawn({
            let handle = handle.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                assert_eq!(handle.current_job(), Some(JobUid::from("J1")));
                handle.stop();
            }
        });

        let exit = worker.run(ResolvedSettings::default()).await;

        assert_matches!(exit, Ok(WorkerExit::Deactivated));
        assert_reported!(to: queue, job: "J1", states: [JobState::Started, JobState::Finished]);
        assert_eq!(queue.pending(), 1);
        assert_eq!(renderer.rendered().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interruption_returns_the_current_job_to_the_queue() {
        let queue = InMemoryQueue::new().with_job(Job::new("J1"));
        let renderer = TestRenderer::new().taking(Duration::from_secs(60));
        let worker = Worker::new(queue.clone(), renderer.clone(), Default::default());
        let handle = worker.handle();
        tokio::spawn({
            let handle = handle.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                handle.interrupt();
            }
        });

        let exit = worker.run(ResolvedSettings::default()).await;

        assert_matches!(exit, Ok(WorkerExit::Interrupted));
        assert_reported!(to: queue, job: "J1", states: [JobState::Started, JobState::Queued]);
        assert!(!handle.is_running());
        assert_eq!(handle.current_job(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn interruption_while_polling_exits_without_updates() {
        let queue = InMemoryQueue::new();
        let worker = Worker::new(queue.clone(), TestRenderer::new(), Default::default());
        let handle = worker.handle();
        handle.interrupt();

        let exit = worker.run(ResolvedSettings::default()).await;

        assert_matches!(exit, Ok(WorkerExit::Interrupted));
        assert!(queue.updates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_between_jobs() {
        let queue = InMemoryQueue::new()
            .with_job(Job::new("J1"))
            .with_job(Job::new("J2"));
        let started = tokio::time::Instant::now();

        Worker::new(queue.clone(), TestRenderer::new(), Default::default())
            .run(ResolvedSettings {
                wait_between_jobs: Some(Duration::from_secs(30)),
                ..settings()
            })
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn hooks_are_called_for_every_job() {
        let queue = InMemoryQueue::new()
            .with_job(Job::new("J1"))
            .with_job(Job::new("J2"));
        let mut hooks = MockWorkerHooks::new();
        hooks.expect_on_finished().times(2).return_const(());

        Worker::new(queue.clone(), TestRenderer::new(), Default::default())
            .with_hooks(hooks)
            .run(settings())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn acquisition_failure_stops_the_worker_with_stop_on_error() {
        let queue = InMemoryQueue::new().with_job(Job::new("J1"));
        queue.fail_next_acquire(QueueError::BadState);

        let exit = Worker::new(queue.clone(), TestRenderer::new(), Default::default())
            .run(ResolvedSettings {
                stop_on_error: true,
                ..settings()
            })
            .await;

        assert_matches!(exit, Err(WorkerError::Acquisition(QueueError::BadState)));
        assert_eq!(queue.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_stop_signal_stops_the_worker_between_jobs() {
        struct AfterFirstCheck(AtomicBool);

        impl StopSignal for AfterFirstCheck {
            fn take(&self) -> bool {
                self.0.swap(true, Ordering::SeqCst)
            }
        }

        let queue = InMemoryQueue::new()
            .with_job(Job::new("J1"))
            .with_job(Job::new("J2"));
        let renderer = TestRenderer::new();

        let exit = Worker::new(queue.clone(), renderer.clone(), Default::default())
            .with_stop_signal(AfterFirstCheck(AtomicBool::new(false)))
            .run(ResolvedSettings::default())
            .await;

        assert_matches!(exit, Ok(WorkerExit::Deactivated));
        assert_eq!(renderer.rendered().len(), 1);
        assert_eq!(queue.pending(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn termination_signal_returns_the_current_job_to_the_queue() {
        use nix::sys::signal::{raise, Signal};

        let queue = InMemoryQueue::new().with_job(Job::new("J1"));
        let renderer = TestRenderer::new().taking(Duration::from_secs(60));
        let worker = Worker::new(queue.clone(), renderer.clone(), Default::default());
        let handle = worker.handle();
        tokio::spawn({
            let handle = handle.clone();
            async move {
                while handle.current_job().is_none() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                raise(Signal::SIGTERM).unwrap();
            }
        });

        let exit = tokio::time::timeout(
            Duration::from_secs(10),
            worker.run(ResolvedSettings {
                handle_interruption: true,
                ..Default::default()
            }),
        )
        .await
        .expect("worker did not react to SIGTERM");

        assert_matches!(exit, Ok(WorkerExit::Interrupted));
        assert_reported!(to: queue, job: "J1", states: [JobState::Started, JobState::Queued]);
        assert!(!handle.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn lock_file_stops_the_worker_between_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let lock_file = dir.path().join(".rexrender-worker.lock");
        let queue = InMemoryQueue::new()
            .with_job(Job::new("J1"))
            .with_job(Job::new("J2"));
        let renderer = TestRenderer::new().taking(Duration::from_secs(10));
        tokio::spawn({
            let lock_file = lock_file.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                std::fs::write(lock_file, b"").unwrap();
            }
        });

        let exit = Worker::new(queue.clone(), renderer.clone(), Default::default())
            .run(ResolvedSettings {
                lock_file: Some(lock_file.clone()),
                ..Default::default()
            })
            .await;

        assert_matches!(exit, Ok(WorkerExit::Deactivated));
        assert_eq!(renderer.rendered().len(), 1);
        assert_eq!(queue.pending(), 1);
        assert!(!lock_file.exists());
    }
}
