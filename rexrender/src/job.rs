use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub(crate) mod runner;

/// The identifier the queue service assigns to a job when it is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobUid(String);

impl JobUid {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for JobUid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobUid {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for JobUid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The lifecycle state of a [`Job`].
///
/// A job only ever moves forward through these states while a worker owns it. The single
/// exception is [`JobState::Queued`], which a worker reports when it hands a job back to the
/// queue, for example after being interrupted.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum JobState {
    #[default]
    Queued,
    Started,
    Rendering,
    Finished,
    Error,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Rendering => "rendering",
            Self::Finished => "finished",
            Self::Error => "error",
        }
    }
}

// The queue service uses a few intermediate states of its own (e.g. `picked`). From the
// worker's point of view all of them mean the job has not been started yet.
impl From<String> for JobState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "started" => Self::Started,
            "rendering" => Self::Rendering,
            "finished" => Self::Finished,
            "error" => Self::Error,
            _ => Self::Queued,
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of render work as handed out by the queue service.
///
/// Only the lifecycle fields are interpreted by the worker. The `template` and any other
/// fields sent by the queue service are carried through to the [`crate::render::Renderer`]
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub uid: JobUid,
    #[serde(default)]
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub render_progress: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub error: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub template: serde_json::Value,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Job {
    pub fn new(uid: impl Into<JobUid>) -> Self {
        Self {
            uid: uid.into(),
            state: JobState::Queued,
            tags: None,
            render_progress: 0.0,
            error: Vec::new(),
            started_at: None,
            finished_at: None,
            error_at: None,
            template: serde_json::Value::Null,
            payload: Default::default(),
        }
    }

    pub fn with_tags(self, tags: impl ToString) -> Self {
        Self {
            tags: Some(tags.to_string()),
            ..self
        }
    }

    pub fn with_template(self, template: serde_json::Value) -> Self {
        Self { template, ..self }
    }

    /// Whether the job carries every tag in the comma separated `selector`.
    pub fn matches_tags(&self, selector: &str) -> bool {
        let tags = self.tags.as_deref().unwrap_or_default();
        selector
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .all(|wanted| tags.split(',').map(str::trim).any(|tag| tag == wanted))
    }

    /// The subset of the job reported back to the queue service on every state change.
    pub fn rendering_status(&self) -> RenderingStatus {
        RenderingStatus {
            uid: self.uid.clone(),
            state: self.state,
            render_progress: self.render_progress,
            error: self.error.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            error_at: self.error_at,
        }
    }

    pub(crate) fn mark_started(&mut self, at: DateTime<Utc>) {
        self.state = JobState::Started;
        self.started_at = Some(at);
    }

    pub(crate) fn record_progress(&mut self, percent: f64) {
        self.render_progress = percent.clamp(0.0, 100.0);
        if self.state == JobState::Started {
            self.state = JobState::Rendering;
        }
    }

    /// Takes the renderer's output into the job without giving up the lifecycle fields the
    /// worker owns. Errors are only ever appended to the existing history.
    pub(crate) fn absorb_render(&mut self, rendered: Job, reported_errors: Vec<String>) {
        let added_errors = match rendered.error.strip_prefix(self.error.as_slice()) {
            Some(added) => added.to_vec(),
            None => reported_errors,
        };
        self.error.extend(added_errors);
        self.render_progress = rendered.render_progress.clamp(0.0, 100.0);
        self.template = rendered.template;
        self.payload = rendered.payload;
    }

    pub(crate) fn mark_finished(&mut self, at: DateTime<Utc>) {
        self.state = JobState::Finished;
        self.finished_at = Some(at);
    }

    pub(crate) fn mark_errored(&mut self, error: String, at: DateTime<Utc>) {
        self.error.push(error);
        self.error_at = Some(at);
        self.state = JobState::Error;
    }

    pub(crate) fn mark_requeued(&mut self) {
        self.state = JobState::Queued;
    }
}

/// A snapshot of a job's progress, sent to the queue service with every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderingStatus {
    pub uid: JobUid,
    pub state: JobState,
    pub render_progress: f64,
    pub error: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_at: Option<DateTime<Utc>>,
}
