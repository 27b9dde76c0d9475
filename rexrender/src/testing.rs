//! Helpers for testing.

/// A macro for making assertions about the status updates a worker reported.
///
/// Works with the [`InMemoryQueue`](crate::queue::memory::InMemoryQueue), which records every
/// update it accepts. Assert either on the full sequence of states reported for a job or on
/// the last state reported.
///
/// # Example
///
/// ```
/// # use rexrender::prelude::*;
/// # use rexrender::testing::assert_reported;
/// # use rexrender::queue::memory::InMemoryQueue;
/// # struct Instant;
/// #
/// # #[async_trait::async_trait]
/// # impl Renderer for Instant {
/// #     async fn render(&self, job: Job, _reporter: &dyn RenderReporter) -> Result<Job, RenderError> {
/// #         Ok(job)
/// #     }
/// # }
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let queue = InMemoryQueue::new().with_job(Job::new("J1"));
///
/// Worker::new(queue.clone(), Instant, WorkerSettings::default().with_exit_on_empty_queue(true))
///     .start()
///     .await
///     .unwrap();
///
/// assert_reported!(to: queue, job: "J1", states: [JobState::Started, JobState::Finished]);
/// assert_reported!(to: queue, job: "J1", state: JobState::Finished);
/// # });
/// ```
#[macro_export]
macro_rules! assert_reported {
    (to: $queue:ident, job: $uid:expr, states: [$($state:expr),* $(,)?] $(,)?) => {{
        let uid = $crate::job::JobUid::from($uid);
        let reported = $queue.reported_states(&uid);
        let expected: Vec<$crate::job::JobState> = vec![$($state),*];
        assert!(
            reported == expected,
            "Unexpected states reported for job {uid}\n\n\
            Expected: {expected:?}\n\
            Reported: {reported:?}\n\n\
            All updates:\n\
            {:#?}",
            $queue.updates(),
        );
    }};
    (to: $queue:ident, job: $uid:expr, state: $state:expr $(,)?) => {{
        let uid = $crate::job::JobUid::from($uid);
        let last = $queue.last_status(&uid);
        let expected: $crate::job::JobState = $state;
        assert!(
            last.as_ref().is_some_and(|status| status.state == expected),
            "Expected job {uid} to be reported as {expected}\n\n\
            Last reported status:\n\
            {last:#?}",
        );
    }};
}

pub use assert_reported;

#[cfg(test)]
mod test {
    use crate::{
        job::{Job, JobState},
        queue::{memory::InMemoryQueue, QueueClient},
    };

    use super::assert_reported;

    async fn report(queue: &InMemoryQueue, job: &Job) {
        queue.update(&job.uid, &job.rendering_status()).await.unwrap();
    }

    #[tokio::test]
    async fn asserts_on_the_reported_states() {
        let queue = InMemoryQueue::new();
        let mut job = Job::new("J1");
        job.mark_started(chrono::Utc::now());
        report(&queue, &job).await;
        job.mark_requeued();
        report(&queue, &job).await;

        assert_reported!(to: queue, job: "J1", states: [JobState::Started, JobState::Queued]);
        assert_reported!(to: queue, job: "J1", state: JobState::Queued);
        assert_reported!(to: queue, job: "J2", states: []);
    }

    #[tokio::test]
    #[should_panic(expected = "Expected job J1 to be reported as finished")]
    async fn fails_on_a_different_last_state() {
        let queue = InMemoryQueue::new();
        let mut job = Job::new("J1");
        job.mark_started(chrono::Utc::now());
        report(&queue, &job).await;

        assert_reported!(to: queue, job: "J1", state: JobState::Finished);
    }

    #[tokio::test]
    #[should_panic(expected = "Unexpected states reported for job J1")]
    async fn fails_when_nothing_was_reported() {
        let queue = InMemoryQueue::new();

        assert_reported!(to: queue, job: "J1", states: [JobState::Started]);
    }
}
