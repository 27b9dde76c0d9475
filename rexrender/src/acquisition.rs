use chrono::Utc;

use crate::{
    job::Job,
    queue::{QueueClient, QueueError},
    settings::ResolvedSettings,
    shutdown::ShutdownPolicy,
    WorkerError, WorkerState,
};

/// Polls the queue until it hands out a job or the worker should deactivate.
pub(crate) struct JobAcquisition {
    policy: ShutdownPolicy,
    empty_polls: u32,
    unsuccessful_polls: u32,
}

impl JobAcquisition {
    pub(crate) fn new(policy: ShutdownPolicy) -> Self {
        Self {
            policy,
            empty_polls: 0,
            unsuccessful_polls: 0,
        }
    }

    /// Returns the next job, or `None` once the worker has been deactivated.
    ///
    /// Acquisition failures are absorbed and retried after the polling delay unless
    /// `stop_on_error` is set, in which case the worker is deactivated and the failure returned.
    pub(crate) async fn next(
        &mut self,
        client: &dyn QueueClient,
        settings: &ResolvedSettings,
        state: &WorkerState,
    ) -> Result<Option<Job>, WorkerError> {
        loop {
            if !state.is_active() {
                return Ok(None);
            }
            if self.policy.should_stop(Utc::now(), self.empty_polls) {
                state.deactivate();
                return Ok(None);
            }

            match Self::acquire(client, settings).await {
                Ok(Some(job)) if !job.uid.is_empty() => {
                    tracing::debug!(job_uid = %job.uid, "Acquired job {}", job.uid);
                    self.empty_polls = 0;
                    self.unsuccessful_polls = 0;
                    return Ok(Some(job));
                }
                Ok(_) => {
                    self.empty_polls = self.empty_polls.saturating_add(1);
                    self.unsuccessful_polls = self.unsuccessful_polls.saturating_add(1);
                    self.log_empty_poll(settings);
                    if self.policy.empty_queue_exhausted(self.empty_polls) {
                        tracing::info!(
                            empty_polls = self.empty_polls,
                            "No more jobs tolerated, deactivating worker"
                        );
                        state.deactivate();
                        return Ok(None);
                    }
                }
                Err(error) if settings.stop_on_error => {
                    tracing::error!(?error, "Error acquiring job, stopping worker: {error}");
                    state.deactivate();
                    return Err(WorkerError::Acquisition(error));
                }
                Err(error) => {
                    self.unsuccessful_polls = self.unsuccessful_polls.saturating_add(1);
                    tracing::warn!(?error, "Error acquiring job: {error}");
                }
            }

            let delay = settings.poll_backoff.delay(self.unsuccessful_polls);
            tracing::debug!(?delay, "Waiting before polling again");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {},
                _ = state.stopped() => return Ok(None),
            }
        }
    }

    async fn acquire(
        client: &dyn QueueClient,
        settings: &ResolvedSettings,
    ) -> Result<Option<Job>, QueueError> {
        let timeout = settings.pickup_timeout;
        tokio::time::timeout(timeout, client.acquire(settings.tag_selector.as_deref()))
            .await
            .unwrap_or(Err(QueueError::Timeout(timeout)))
    }

    fn log_empty_poll(&self, settings: &ResolvedSettings) {
        let attempt = self.empty_polls;
        if settings.exit_on_empty_queue && settings.tolerate_empty_queues > 0 {
            let tolerate = settings.tolerate_empty_queues;
            tracing::info!(attempt, tolerate, "No jobs available (attempt {attempt} of {tolerate})");
        } else {
            tracing::info!(attempt, "No jobs available (attempt {attempt})");
        }
    }
}
