//! HTTP implementations of the job ports.
//!
//! - [`HttpJobApi`]: REST calls against the job backend
//! - [`SseEventSource`]: `text/event-stream` push updates, one stream per job
//!
//! Error bodies are `{"detail": ...}`; the detail becomes the rejection message.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, error};

use crate::domain::{ApiError, JobId, JobRecord, JobType, StartRequest, TransportError};
use crate::ports::{EventSource, EventStream, JobApi, TransportEvent};

/// Placeholder replaced by the session reference in start routes.
const SESSION_PLACEHOLDER: &str = "{session}";

fn transport(err: reqwest::Error) -> ApiError {
    ApiError::Transport(err.to_string())
}

fn trim_base(base_url: impl Into<String>) -> String {
    base_url.into().trim_end_matches('/').to_string()
}

/// REST client for the job endpoints.
pub struct HttpJobApi {
    client: Client,
    base_url: String,
    start_routes: HashMap<JobType, String>,
}

impl HttpJobApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
            error!(error = %e, "Failed to build HTTP client with custom timeout, using default client");
            Client::new()
        });

        let start_routes = HashMap::from([
            (
                JobType::Transform,
                "/sessions/{session}/transform/start".to_string(),
            ),
            (
                JobType::DicomExtract,
                "/sessions/{session}/dicom/extract/start".to_string(),
            ),
        ]);

        Self {
            client,
            base_url: trim_base(base_url),
            start_routes,
        }
    }

    /// Register (or replace) the start route for a job type.
    /// `{session}` in the template is replaced by the session reference.
    pub fn with_start_route(mut self, kind: JobType, template: impl Into<String>) -> Self {
        self.start_routes.insert(kind, template.into());
        self
    }

    fn start_url(&self, request: &StartRequest) -> Result<String, ApiError> {
        let template = self
            .start_routes
            .get(&request.kind)
            .ok_or(ApiError::UnsupportedJobType(request.kind))?;
        Ok(format!(
            "{}{}",
            self.base_url,
            template.replace(SESSION_PLACEHOLDER, request.session_ref.as_str())
        ))
    }

    fn job_url(&self, id: &JobId) -> String {
        format!("{}/jobs/{}", self.base_url, id)
    }

    async fn check(response: Response, id: Option<&JobId>) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND
            && let Some(id) = id
        {
            return Err(ApiError::NotFound(id.clone()));
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|body| {
                body.get("detail").map(|detail| match detail {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
            })
            .unwrap_or(text);
        Err(ApiError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl JobApi for HttpJobApi {
    async fn start_job(&self, request: &StartRequest) -> Result<JobRecord, ApiError> {
        let url = self.start_url(request)?;
        let body = match &request.params {
            Value::Null => Value::Object(Default::default()),
            params => params.clone(),
        };
        debug!(%url, job_type = %request.kind, "starting job");

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        let response = Self::check(response, None).await?;
        Self::decode(response).await
    }

    async fn get_job_details(&self, id: &JobId) -> Result<JobRecord, ApiError> {
        let response = self
            .client
            .get(self.job_url(id))
            .send()
            .await
            .map_err(transport)?;
        let response = Self::check(response, Some(id)).await?;
        Self::decode(response).await
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>, ApiError> {
        let response = self
            .client
            .get(format!("{}/jobs", self.base_url))
            .send()
            .await
            .map_err(transport)?;
        let response = Self::check(response, None).await?;
        Self::decode(response).await
    }

    async fn stop_job(&self, id: &JobId) -> Result<(), ApiError> {
        let response = self
            .client
            .post(format!("{}/stop", self.job_url(id)))
            .send()
            .await
            .map_err(transport)?;
        Self::check(response, Some(id)).await?;
        Ok(())
    }

    async fn delete_job(&self, id: &JobId) -> Result<(), ApiError> {
        let response = self
            .client
            .delete(self.job_url(id))
            .send()
            .await
            .map_err(transport)?;
        Self::check(response, Some(id)).await?;
        Ok(())
    }
}

/// Opens `GET /jobs/{id}/events` streams.
pub struct SseEventSource {
    client: Client,
    base_url: String,
}

impl SseEventSource {
    /// Streams stay open indefinitely, so only the connect phase is bounded.
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_else(|e| {
                error!(error = %e, "Failed to build SSE client with connect timeout, using default client");
                Client::new()
            });
        Self {
            client,
            base_url: trim_base(base_url),
        }
    }
}

#[async_trait]
impl EventSource for SseEventSource {
    async fn connect(&self, job_id: &JobId) -> Result<Box<dyn EventStream>, TransportError> {
        let url = format!("{}/jobs/{}/events", self.base_url, job_id);
        let response = self
            .client
            .get(&url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(TransportError::NotFound(job_id.clone()));
        }
        if !status.is_success() {
            return Err(TransportError::Connect(format!("unexpected status {status}")));
        }
        debug!(%url, "event stream connected");

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(|e| e.to_string()))
            .boxed();
        Ok(Box::new(SseStream {
            body: Some(body),
            parser: SseParser::default(),
            pending: VecDeque::new(),
        }))
    }
}

struct SseStream {
    body: Option<BoxStream<'static, Result<Vec<u8>, String>>>,
    parser: SseParser,
    pending: VecDeque<String>,
}

#[async_trait]
impl EventStream for SseStream {
    async fn next_event(&mut self) -> TransportEvent {
        loop {
            if let Some(data) = self.pending.pop_front() {
                return TransportEvent::Message(data);
            }
            let Some(body) = self.body.as_mut() else {
                return TransportEvent::Disconnected {
                    clean: true,
                    detail: None,
                };
            };
            match body.next().await {
                Some(Ok(chunk)) => self.pending.extend(self.parser.feed(&chunk)),
                Some(Err(detail)) => {
                    self.body = None;
                    return TransportEvent::Disconnected {
                        clean: false,
                        detail: Some(detail),
                    };
                }
                None => {
                    self.body = None;
                    return TransportEvent::Disconnected {
                        clean: true,
                        detail: None,
                    };
                }
            }
        }
    }

    fn close(&mut self) {
        self.body = None;
        self.pending.clear();
    }
}

/// Incremental `text/event-stream` decoder. Yields the `data` payload of each
/// dispatched event; other fields and comments are ignored.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseParser {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            let line = String::from_utf8_lossy(&raw);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (&*line, ""),
            };
            if field == "data" {
                self.data.push(value.to_string());
            }
        }
        events
    }
}
