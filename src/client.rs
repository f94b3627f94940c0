//! HTTP client for the docqa backend.
//!
//! [`Backend`] is the narrow surface the load cache needs; [`BackendClient`]
//! implements it over reqwest and adds the query calls. Probes use a short
//! bounded timeout so an unreachable backend fails fast instead of hanging a
//! load.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use docqa_core::models::{Citation, StreamEvent};
use docqa_core::protocol::FrameDecoder;

use crate::config::Config;
use crate::error::{LoadError, StreamError};
use crate::server::DOCUMENT_ID_HEADER;

/// Result of an existence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Existence {
    pub exists: bool,
    /// Backend handle, when the backend reports one.
    pub rag_id: Option<String>,
}

/// Document to upload.
#[derive(Debug, Clone)]
pub struct Upload {
    pub document_id: String,
    pub display_name: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Backend operations used by the document load cache.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn health(&self) -> Result<(), LoadError>;
    async fn check_document(&self, document_id: &str) -> Result<Existence, LoadError>;
    /// Returns the backend handle of the indexed document.
    async fn upload(&self, upload: Upload) -> Result<String, LoadError>;
}

/// Events of a streamed answer as seen by a client.
pub type AnswerStream = BoxStream<'static, Result<StreamEvent, StreamError>>;

#[derive(Clone)]
pub struct BackendClient {
    client: reqwest::Client,
    base_url: String,
    probe_timeout: Duration,
    upload_timeout: Duration,
    stream_timeout: Duration,
}

impl BackendClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            probe_timeout: Duration::from_secs(5),
            upload_timeout: Duration::from_secs(300),
            stream_timeout: Duration::from_secs(600),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.backend.url).with_timeouts(
            Duration::from_secs(config.backend.probe_timeout_secs),
            Duration::from_secs(config.backend.upload_timeout_secs),
            config.generation.timeout(),
        )
    }

    pub fn with_timeouts(mut self, probe: Duration, upload: Duration, stream: Duration) -> Self {
        self.probe_timeout = probe;
        self.upload_timeout = upload;
        self.stream_timeout = stream;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `{base}/{route}/{document_id}` with the id as one percent-encoded
    /// path segment, so ids containing `/`, `?` or `#` reach the backend
    /// intact.
    fn document_url(&self, route: &str, document_id: &str) -> Result<reqwest::Url, String> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| format!("invalid backend url '{}': {}", self.base_url, e))?;
        url.path_segments_mut()
            .map_err(|_| format!("backend url '{}' cannot take a path", self.base_url))?
            .pop_if_empty()
            .push(route)
            .push(document_id);
        Ok(url)
    }

    /// Ask the backend to warm a document. Failures are logged and ignored;
    /// the query that follows works either way.
    pub async fn activate(&self, document_id: &str) -> bool {
        let url = match self.document_url("activate-document", document_id) {
            Ok(url) => url,
            Err(e) => {
                debug!(document_id, error = %e, "activation skipped");
                return false;
            }
        };
        let result = self
            .client
            .post(url)
            .timeout(self.probe_timeout)
            .send()
            .await;
        match result {
            Ok(r) if r.status().is_success() => true,
            Ok(r) => {
                debug!(document_id, status = %r.status(), "activation refused");
                false
            }
            Err(e) => {
                debug!(document_id, error = %e, "activation failed");
                false
            }
        }
    }

    /// Stream an answer. Malformed frames are logged and skipped; the stream
    /// ends after the first terminal event. Cancelling `cancel` or dropping
    /// the returned stream closes the connection.
    pub async fn query_stream(
        &self,
        document_id: &str,
        query: &str,
        cancel: CancellationToken,
    ) -> Result<AnswerStream, StreamError> {
        let response = self
            .client
            .post(self.url("/query?stream=true"))
            .header(DOCUMENT_ID_HEADER, document_id)
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StreamError::Backend(format!(
                "{}: {}",
                status,
                error_message(&text)
            )));
        }

        let mut bytes = response.bytes_stream();
        let timeout = self.stream_timeout;
        let (tx, rx) = mpsc::channel(32);
        // Events already buffered are not delivered once cancelled.
        let stop = cancel.clone().cancelled_owned();
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + timeout;
            let mut decoder = FrameDecoder::new();
            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    c = tokio::time::timeout_at(deadline, bytes.next()) => c,
                };
                let events = match chunk {
                    Err(_) => {
                        let _ = tx.send(Err(StreamError::StreamTimeout(timeout.as_secs()))).await;
                        return;
                    }
                    Ok(None) => {
                        let tail: Vec<_> = decoder.finish().into_iter().collect();
                        if !forward(&tx, tail).await {
                            let _ = tx
                                .send(Err(StreamError::Transport(
                                    "stream ended before a terminal event".to_string(),
                                )))
                                .await;
                        }
                        return;
                    }
                    Ok(Some(Err(e))) => {
                        let _ = tx.send(Err(StreamError::from(e))).await;
                        return;
                    }
                    Ok(Some(Ok(b))) => decoder.push(&b),
                };
                if cancel.is_cancelled() || forward(&tx, events).await || tx.is_closed() {
                    return;
                }
            }
        });
        Ok(ReceiverStream::new(rx).take_until(stop).boxed())
    }

    /// Non-streaming query: the final answer and its citations.
    pub async fn query(
        &self,
        document_id: &str,
        query: &str,
    ) -> Result<(String, Vec<Citation>), StreamError> {
        let response = self
            .client
            .post(self.url("/query"))
            .header(DOCUMENT_ID_HEADER, document_id)
            .timeout(self.stream_timeout)
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(StreamError::Backend(format!(
                "{}: {}",
                status,
                error_message(&text)
            )));
        }
        let json: Value = serde_json::from_str(&text)
            .map_err(|e| StreamError::MalformedEventFrame(e.to_string()))?;
        let answer = str_field(&json, &["response", "final_response"])
            .ok_or_else(|| StreamError::MalformedEventFrame("missing response".to_string()))?;
        let citations = match json.get("citations") {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| StreamError::MalformedEventFrame(e.to_string()))?,
            None => Vec::new(),
        };
        Ok((answer, citations))
    }
}

/// Send decoded events; returns `true` once a terminal event has been sent.
async fn forward(
    tx: &mpsc::Sender<Result<StreamEvent, StreamError>>,
    events: Vec<Result<StreamEvent, docqa_core::protocol::FrameError>>,
) -> bool {
    for event in events {
        match event {
            Ok(event) => {
                let terminal = event.is_terminal();
                if tx.send(Ok(event)).await.is_err() {
                    return true;
                }
                if terminal {
                    return true;
                }
            }
            Err(e) => {
                warn!(error = %StreamError::MalformedEventFrame(e.to_string()), "skipping frame");
            }
        }
    }
    false
}

fn str_field(json: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|n| json.get(*n).and_then(Value::as_str))
        .map(str::to_string)
}

/// Human-readable message from an error response body.
fn error_message(body: &str) -> String {
    let Ok(json) = serde_json::from_str::<Value>(body) else {
        return body.trim().to_string();
    };
    json.pointer("/error/message")
        .and_then(Value::as_str)
        .or_else(|| json.get("message").and_then(Value::as_str))
        .or_else(|| json.get("error").and_then(Value::as_str))
        .or_else(|| json.get("detail").and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string())
}

#[async_trait]
impl Backend for BackendClient {
    async fn health(&self) -> Result<(), LoadError> {
        let response = self
            .client
            .get(self.url("/health"))
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| LoadError::BackendUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(LoadError::BackendUnavailable(format!(
                "health check returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn check_document(&self, document_id: &str) -> Result<Existence, LoadError> {
        let url = self
            .document_url("check-document", document_id)
            .map_err(LoadError::ExistenceCheckFailed)?;
        let response = self
            .client
            .get(url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| LoadError::ExistenceCheckFailed(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LoadError::ExistenceCheckFailed(e.to_string()))?;
        if !status.is_success() {
            return Err(LoadError::ExistenceCheckFailed(format!(
                "{}: {}",
                status,
                error_message(&text)
            )));
        }
        let json: Value = serde_json::from_str(&text)
            .map_err(|e| LoadError::ExistenceCheckFailed(format!("invalid response: {}", e)))?;
        let exists = json
            .get("exists")
            .and_then(Value::as_bool)
            .ok_or_else(|| LoadError::ExistenceCheckFailed("response has no 'exists'".to_string()))?;
        Ok(Existence {
            exists,
            rag_id: str_field(&json, &["ragId", "rag_id"]),
        })
    }

    async fn upload(&self, upload: Upload) -> Result<String, LoadError> {
        let mut part = reqwest::multipart::Part::bytes(upload.bytes)
            .file_name(upload.display_name.clone());
        if let Some(ct) = &upload.content_type {
            part = part
                .mime_str(ct)
                .map_err(|e| LoadError::Transport(e.to_string()))?;
        }
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("document_id", upload.document_id.clone())
            .text("display_name", upload.display_name.clone());

        let response = self
            .client
            .post(self.url("/upload-pdf"))
            .timeout(self.upload_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| LoadError::Transport(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LoadError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(LoadError::UploadRejected(error_message(&text)));
        }
        let json: Value = serde_json::from_str(&text)
            .map_err(|e| LoadError::UploadRejected(format!("invalid upload response: {}", e)))?;
        str_field(&json, &["id", "document_id", "ragId"])
            .ok_or_else(|| LoadError::UploadRejected("upload response has no id".to_string()))
    }
}
