use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tracing::instrument;

use crate::{
    queue::QueueClient,
    render::{JobPreparer, RenderError, RenderReporter, Renderer, WorkerHooks},
    settings::ResolvedSettings,
    WorkerError,
};

use super::{Job, JobUid};

/// How a single job execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    Finished,
    Errored,
    /// The job could not be marked as started and was never rendered.
    Abandoned,
}

/// Drives one job at a time through `started`, `rendering` and then `finished` or `error`,
/// reporting every transition to the queue.
pub(crate) struct JobExecutor<'a> {
    client: &'a dyn QueueClient,
    renderer: &'a dyn Renderer,
    preparers: &'a [Box<dyn JobPreparer>],
    hooks: &'a dyn WorkerHooks,
    settings: &'a ResolvedSettings,
}

impl<'a> JobExecutor<'a> {
    pub(crate) fn new(
        client: &'a dyn QueueClient,
        renderer: &'a dyn Renderer,
        preparers: &'a [Box<dyn JobPreparer>],
        hooks: &'a dyn WorkerHooks,
        settings: &'a ResolvedSettings,
    ) -> Self {
        Self {
            client,
            renderer,
            preparers,
            hooks,
            settings,
        }
    }

    #[instrument(skip(self, job), fields(job_uid))]
    pub(crate) async fn run(&self, job: &mut Job) -> Result<JobOutcome, WorkerError> {
        let job_uid = job.uid.clone();
        tracing::Span::current().record("job_uid", tracing::field::display(&job_uid));

        job.mark_started(Utc::now());
        if let Err(error) = self.client.update(&job_uid, &job.rendering_status()).await {
            tracing::error!(
                ?error,
                %job_uid,
                "Failed to mark job {job_uid} as started, abandoning it: {error}",
            );
            if self.settings.stop_on_error {
                return Err(WorkerError::StateUpdate {
                    uid: job_uid,
                    source: error,
                });
            }
            return Ok(JobOutcome::Abandoned);
        }
        tracing::info!(%job_uid, "Job {job_uid} started");

        let reporter = JobReporter {
            client: self.client,
            hooks: self.hooks,
            stop_on_error: self.settings.stop_on_error,
            record: Default::default(),
        };
        let rendered = self.render(job.clone(), &reporter).await;
        let record = reporter
            .record
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        match rendered {
            Ok(rendered) => self.handle_job_finished(job, rendered, record).await,
            Err(error) => self.handle_job_error(job, record, error).await,
        }
    }

    async fn render(&self, mut job: Job, reporter: &JobReporter<'_>) -> Result<Job, RenderError> {
        let job_uid = job.uid.clone();
        for preparer in self.preparers {
            job = preparer.prepare(job).await?;
        }
        tracing::debug!(%job_uid, "Rendering job {job_uid}");
        let mut rendered = self.renderer.render(job, reporter).await?;
        if rendered.uid != job_uid {
            tracing::warn!(
                %job_uid,
                returned_uid = %rendered.uid,
                "Renderer changed the uid of job {job_uid}, restoring it"
            );
            rendered.uid = job_uid;
        }
        Ok(rendered)
    }

    async fn handle_job_finished(
        &self,
        job: &mut Job,
        rendered: Job,
        mut record: RenderRecord,
    ) -> Result<JobOutcome, WorkerError> {
        job.absorb_render(rendered, std::mem::take(&mut record.errors));
        record.apply_progress(job);
        job.mark_finished(Utc::now());
        let job_uid = job.uid.clone();
        let status = job.rendering_status();
        tracing::info!(%job_uid, "Job {job_uid} finished");
        self.hooks.on_finished(&status);

        match self.client.update(&job_uid, &status).await {
            Ok(()) => Ok(JobOutcome::Finished),
            Err(error) => {
                tracing::error!(
                    ?error,
                    %job_uid,
                    "Failed to mark job {job_uid} as finished, error: {error}",
                );
                if self.settings.stop_on_error {
                    return Err(WorkerError::StateUpdate {
                        uid: job_uid,
                        source: error,
                    });
                }
                Ok(JobOutcome::Finished)
            }
        }
    }

    async fn handle_job_error(
        &self,
        job: &mut Job,
        record: RenderRecord,
        error: RenderError,
    ) -> Result<JobOutcome, WorkerError> {
        record.apply_progress(job);
        job.error.extend(record.errors);
        job.mark_errored(error.message.clone(), Utc::now());
        let job_uid = job.uid.clone();
        let status = job.rendering_status();
        tracing::error!(
            %job_uid,
            ?error,
            "Job {job_uid} failed: {error}",
        );
        self.hooks.on_error(&status);

        let _ = self
            .client
            .update(&job_uid, &status)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_uid,
                    "Failed to mark job {job_uid} as errored, error: {err}",
                )
            });

        if self.settings.stop_on_error {
            return Err(WorkerError::Render {
                uid: job_uid,
                source: error,
            });
        }
        Ok(JobOutcome::Errored)
    }

    /// Hands `job` back to the queue so another worker can pick it up.
    pub(crate) async fn requeue(&self, job: &mut Job) {
        job.mark_requeued();
        let job_uid = job.uid.clone();
        tracing::info!(%job_uid, "Returning job {job_uid} to the queue");
        let _ = self
            .client
            .update(&job_uid, &job.rendering_status())
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_uid,
                    "Failed to return job {job_uid} to the queue, error: {err}",
                )
            });
    }

    pub(crate) async fn pause_between_jobs(&self) {
        if let Some(wait) = self.settings.wait_between_jobs {
            tracing::debug!(?wait, "Waiting before the next job");
            tokio::time::sleep(wait).await;
        }
    }
}

/// What the renderer reported while working on its own copy of the job.
#[derive(Debug, Default)]
struct RenderRecord {
    errors: Vec<String>,
    progress: Option<f64>,
}

impl RenderRecord {
    fn apply_progress(&self, job: &mut Job) {
        if let Some(percent) = self.progress {
            job.render_progress = job.render_progress.max(percent);
        }
    }
}

struct JobReporter<'a> {
    client: &'a dyn QueueClient,
    hooks: &'a dyn WorkerHooks,
    stop_on_error: bool,
    record: Mutex<RenderRecord>,
}

impl JobReporter<'_> {
    fn record(&self) -> MutexGuard<'_, RenderRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<'a> RenderReporter for JobReporter<'a> {
    async fn progress(&self, job: &mut Job, percent: f64) -> Result<(), RenderError> {
        job.record_progress(percent);
        self.record().progress = Some(job.render_progress);
        let status = job.rendering_status();
        match self.client.update(&job.uid, &status).await {
            Ok(()) => {
                self.hooks.on_render_progress(&status);
                Ok(())
            }
            Err(error) if self.stop_on_error => Err(error.into()),
            Err(error) => {
                warn_update_failed(&job.uid, "progress", &error);
                Ok(())
            }
        }
    }

    async fn error(&self, job: &mut Job, error: &RenderError) {
        job.error.push(error.message.clone());
        self.record().errors.push(error.message.clone());
        let status = job.rendering_status();
        self.hooks.on_render_error(&status, error);
        if let Err(err) = self.client.update(&job.uid, &status).await {
            warn_update_failed(&job.uid, "error", &err);
        }
    }
}

fn warn_update_failed(job_uid: &JobUid, update: &str, error: &crate::queue::QueueError) {
    tracing::warn!(
        ?error,
        %job_uid,
        "Failed to report {update} of job {job_uid}, error: {error}",
    );
}
