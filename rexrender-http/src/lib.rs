//! A [`QueueClient`] for queue services speaking the render queue HTTP API.
//!
//! - `GET {host}/api/v1/jobs/pickup` or `GET {host}/api/v1/jobs/pickup/{tags}` hands out the
//!   next job, or an empty object when there is none.
//! - `PUT {host}/api/v1/jobs/{uid}` accepts a [`RenderingStatus`] as JSON.
//!
//! Every request carries a `user-agent` of `rexrender-worker/<version>`, plus the
//! `rexrender-secret` and `rexrender-name` headers when a secret or worker name is configured.
use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue},
    Client, Response,
};
use rexrender::{
    job::{Job, JobUid, RenderingStatus},
    queue::{QueueClient, QueueError},
    render::Renderer,
    settings::WorkerSettings,
    Worker, WorkerError, WorkerExit,
};
use thiserror::Error;
use url::Url;

pub const USER_AGENT: &str = concat!("rexrender-worker/", env!("CARGO_PKG_VERSION"));

const SECRET_HEADER: &str = "rexrender-secret";
const NAME_HEADER: &str = "rexrender-name";
const JOBS_PATH: [&str; 3] = ["api", "v1", "jobs"];

/// Talks to the queue service over HTTP.
#[derive(Debug, Clone)]
pub struct HttpQueueClient {
    http: Client,
    base: Url,
}

impl HttpQueueClient {
    pub fn new(
        host: &str,
        secret: Option<&str>,
        name: Option<&str>,
    ) -> Result<Self, ClientBuildError> {
        let base = Url::parse(host).map_err(|_| ClientBuildError::InvalidHost(host.to_owned()))?;
        if base.cannot_be_a_base() {
            return Err(ClientBuildError::InvalidHost(host.to_owned()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_static(USER_AGENT),
        );
        if let Some(secret) = secret {
            let mut value = HeaderValue::from_str(secret)
                .map_err(|_| ClientBuildError::InvalidHeader(SECRET_HEADER))?;
            value.set_sensitive(true);
            headers.insert(SECRET_HEADER, value);
        }
        if let Some(name) = name {
            let value = HeaderValue::from_str(name)
                .map_err(|_| ClientBuildError::InvalidHeader(NAME_HEADER))?;
            headers.insert(NAME_HEADER, value);
        }

        let http = Client::builder().default_headers(headers).build()?;
        Ok(Self { http, base })
    }

    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.base.clone();
        // Checked in `new`, a base url always has path segments.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(JOBS_PATH).extend(segments);
        }
        url
    }

    async fn error_for_status(response: Response) -> Result<Response, QueueError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(QueueError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl QueueClient for HttpQueueClient {
    async fn acquire(&self, tag_selector: Option<&str>) -> Result<Option<Job>, QueueError> {
        let url = match tag_selector {
            Some(tags) => self.endpoint(["pickup", tags]),
            None => self.endpoint(["pickup"]),
        };
        tracing::debug!(%url, "Picking up job");

        let response = self.http.get(url).send().await.map_err(transport)?;
        let body = Self::error_for_status(response)
            .await?
            .bytes()
            .await
            .map_err(transport)?;

        let value: serde_json::Value = serde_json::from_slice(&body)?;
        if value.get("uid").map_or(true, serde_json::Value::is_null) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    async fn update(&self, uid: &JobUid, status: &RenderingStatus) -> Result<(), QueueError> {
        let url = self.endpoint([uid.as_str()]);
        tracing::debug!(%url, job_uid = %uid, state = %status.state, "Updating job {uid}");

        let response = self
            .http
            .put(url)
            .json(status)
            .send()
            .await
            .map_err(transport)?;
        Self::error_for_status(response).await?;
        Ok(())
    }
}

fn transport(error: reqwest::Error) -> QueueError {
    QueueError::Transport(Box::new(error))
}

#[derive(Debug, Error)]
pub enum ClientBuildError {
    #[error("Invalid queue service host {0:?}")]
    InvalidHost(String),
    #[error("Invalid value for the {0} header")]
    InvalidHeader(&'static str),
    #[error("Error building the HTTP client")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum HttpWorkerError {
    #[error(transparent)]
    Client(#[from] ClientBuildError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Builds a worker polling the queue service at `host`.
///
/// The worker's name from `settings`, if any, is sent to the queue service with every request.
pub fn worker<R: Renderer>(
    host: &str,
    secret: Option<&str>,
    settings: WorkerSettings,
    renderer: R,
) -> Result<Worker<HttpQueueClient, R>, ClientBuildError> {
    let client = HttpQueueClient::new(host, secret, settings.name.as_deref())?;
    Ok(Worker::new(client, renderer, settings))
}

/// Runs a worker polling the queue service at `host` until it deactivates or is interrupted.
pub async fn start<R: Renderer>(
    host: &str,
    secret: Option<&str>,
    settings: WorkerSettings,
    renderer: R,
) -> Result<WorkerExit, HttpWorkerError> {
    Ok(worker(host, secret, settings, renderer)?.start().await?)
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use rexrender::job::JobState;
    use serde_json::json;
    use wiremock::{
        matchers::{body_partial_json, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    async fn client(server: &MockServer) -> HttpQueueClient {
        HttpQueueClient::new(&server.uri(), Some("s3cret"), Some("render-01")).unwrap()
    }

    #[tokio::test]
    async fn picks_up_a_job() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/jobs/pickup"))
            .and(header("rexrender-secret", "s3cret"))
            .and(header("rexrender-name", "render-01"))
            .and(header("user-agent", USER_AGENT))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uid": "J1",
                "state": "picked",
                "template": { "composition": "main" },
            })))
            .expect(1)
            .mount(&server)
            .await;

        let job = client(&server).await.acquire(None).await.unwrap().unwrap();

        assert_eq!(job.uid, JobUid::from("J1"));
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.template["composition"], "main");
    }

    #[tokio::test]
    async fn picks_up_a_job_by_tags() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/jobs/pickup/gpu,fast"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "uid": "J2" })))
            .expect(1)
            .mount(&server)
            .await;

        let job = client(&server).await.acquire(Some("gpu,fast")).await.unwrap();

        assert_matches!(job, Some(job) if job.uid == JobUid::from("J2"));
    }

    #[tokio::test]
    async fn empty_object_means_no_job() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/jobs/pickup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        assert_matches!(client(&server).await.acquire(None).await, Ok(None));
    }

    #[tokio::test]
    async fn error_statuses_are_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid secret"))
            .mount(&server)
            .await;

        assert_matches!(
            client(&server).await.acquire(None).await,
            Err(QueueError::Status { status: 401, message }) if message == "invalid secret"
        );
    }

    #[tokio::test]
    async fn malformed_jobs_fail_to_decode() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        assert_matches!(
            client(&server).await.acquire(None).await,
            Err(QueueError::Decode(_))
        );
    }

    #[tokio::test]
    async fn updates_the_job_status() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/jobs/J1"))
            .and(body_partial_json(json!({
                "uid": "J1",
                "state": "error",
                "error": ["timeout"],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        let status = RenderingStatus {
            uid: "J1".into(),
            state: JobState::Error,
            render_progress: 12.0,
            error: vec!["timeout".to_owned()],
            started_at: None,
            finished_at: None,
            error_at: None,
        };

        let result = client(&server).await.update(&status.uid, &status).await;

        assert_matches!(result, Ok(()));
    }

    #[tokio::test]
    async fn respects_a_path_prefix_on_the_host() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queue/api/v1/jobs/pickup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        let client = HttpQueueClient::new(&format!("{}/queue/", server.uri()), None, None).unwrap();

        assert_matches!(client.acquire(None).await, Ok(None));
    }

    #[tokio::test]
    async fn unreachable_service_is_a_transport_error() {
        let client = HttpQueueClient::new("http://127.0.0.1:9", None, None).unwrap();

        assert_matches!(client.acquire(None).await, Err(QueueError::Transport(_)));
    }

    #[test]
    fn rejects_invalid_hosts() {
        assert_matches!(
            HttpQueueClient::new("localhost:3000", None, None),
            Err(ClientBuildError::InvalidHost(_))
        );
        assert_matches!(
            HttpQueueClient::new("not a url", None, None),
            Err(ClientBuildError::InvalidHost(_))
        );
        assert_matches!(
            HttpQueueClient::new("http://localhost:3000", Some("line\nbreak"), None),
            Err(ClientBuildError::InvalidHeader(SECRET_HEADER))
        );
    }
}
