//! Streamable HTTP client transport (upstream direction).
//!
//! One endpoint, three verbs: `POST` carries JSON-RPC and may answer with a
//! plain JSON body, a `202` (notifications), or an SSE-upgraded stream whose
//! `data:` lines are messages; `GET` opens an optional server-initiated
//! stream; `DELETE` ends the session. The `mcp-session-id` header is captured
//! from the first response and replayed on every later request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures::StreamExt;
use mcpmux_protocol::JsonRpcMessage;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::sync::{Mutex as TokioMutex, RwLock, mpsc};
use tracing::{debug, trace, warn};

use crate::MCP_SESSION_ID_HEADER;
use crate::sse::SseParser;
use crate::traits::{Transport, TransportError, TransportKind, TransportResult};

const INCOMING_CHANNEL_CAPACITY: usize = 256;
const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// Construction parameters for a streamable HTTP upstream.
#[derive(Debug, Clone)]
pub struct StreamableHttpConfig {
    /// Endpoint URL.
    pub url: String,
    /// Headers forwarded verbatim on every request.
    pub headers: HashMap<String, String>,
}

/// Streamable HTTP client transport.
pub struct StreamableHttpTransport {
    config: StreamableHttpConfig,
    http: reqwest::Client,
    session_id: Arc<RwLock<Option<String>>>,
    incoming_tx: StdMutex<Option<mpsc::Sender<JsonRpcMessage>>>,
    incoming_rx: TokioMutex<mpsc::Receiver<JsonRpcMessage>>,
    failure: Arc<StdMutex<Option<String>>>,
    listener_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StreamableHttpTransport {
    /// Build a transport for `config`.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be constructed.
    pub fn new(config: StreamableHttpConfig) -> TransportResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Configuration(e.to_string()))?;
        let (tx, rx) = mpsc::channel(INCOMING_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            http,
            session_id: Arc::new(RwLock::new(None)),
            incoming_tx: StdMutex::new(Some(tx)),
            incoming_rx: TokioMutex::new(rx),
            failure: Arc::new(StdMutex::new(None)),
            listener_task: StdMutex::new(None),
        })
    }

    fn sender(&self) -> Option<mpsc::Sender<JsonRpcMessage>> {
        self.incoming_tx
            .lock()
            .expect("incoming sender mutex poisoned")
            .clone()
    }

    fn apply_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }
        request
    }

    async fn capture_session_id(&self, response: &reqwest::Response) {
        if let Some(value) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut guard = self.session_id.write().await;
            if guard.as_deref() != Some(value) {
                debug!(session_id = %value, "captured upstream session id");
                *guard = Some(value.to_string());
            }
        }
    }

    /// Deliver every message found in a JSON body (object or batch array).
    async fn deliver_json_body(
        tx: &mpsc::Sender<JsonRpcMessage>,
        body: serde_json::Value,
    ) {
        let items = match body {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        };
        for item in items {
            match JsonRpcMessage::from_value(item) {
                Ok(message) => {
                    if tx.send(message).await.is_err() {
                        return;
                    }
                }
                Err(error) => warn!(%error, "discarding unparseable message in HTTP body"),
            }
        }
    }

    /// Drain an SSE-upgraded response body into the incoming channel.
    async fn drain_sse_body(tx: mpsc::Sender<JsonRpcMessage>, response: reqwest::Response) {
        let mut parser = SseParser::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => {
                    warn!(%error, "SSE response stream broke");
                    return;
                }
            };
            let text = String::from_utf8_lossy(&chunk);
            for event in parser.feed(&text) {
                trace!(event = ?event.event, "SSE event from upstream");
                match JsonRpcMessage::from_slice(event.data.as_bytes()) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            return;
                        }
                    }
                    Err(error) => warn!(%error, "discarding unparseable SSE data line"),
                }
            }
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    async fn open(&self) -> TransportResult<()> {
        // Optional server-initiated stream. Many servers answer 405 here;
        // that is not an error, it only means all traffic rides on POSTs.
        let Some(tx) = self.sender() else {
            return Err(TransportError::Closed);
        };
        let request = self
            .apply_headers(self.http.get(&self.config.url))
            .header(ACCEPT, "text/event-stream");
        let session_id = Arc::clone(&self.session_id);
        let task = tokio::spawn(async move {
            let request = match session_id.read().await.clone() {
                Some(id) => request.header(MCP_SESSION_ID_HEADER, id),
                None => request,
            };
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    Self::drain_sse_body(tx, response).await;
                }
                Ok(response) => {
                    debug!(status = %response.status(), "upstream declined GET stream");
                }
                Err(error) => {
                    debug!(%error, "upstream GET stream unavailable");
                }
            }
        });
        *self
            .listener_task
            .lock()
            .expect("listener task mutex poisoned") = Some(task);
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> TransportResult<()> {
        let Some(tx) = self.sender() else {
            return Err(TransportError::Closed);
        };
        let mut request = self
            .apply_headers(self.http.post(&self.config.url))
            .header(ACCEPT, ACCEPT_BOTH)
            .header(CONTENT_TYPE, "application/json")
            .json(&message.to_value());
        if let Some(id) = self.session_id.read().await.clone() {
            request = request.header(MCP_SESSION_ID_HEADER, id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.capture_session_id(&response).await;

        let status = response.status();
        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if content_type.starts_with("text/event-stream") {
            // The response to this request streams in as SSE events.
            tokio::spawn(Self::drain_sse_body(tx, response));
            return Ok(());
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TransportError::MalformedFrame(e.to_string()))?;
        Self::deliver_json_body(&tx, body).await;
        Ok(())
    }

    async fn receive(&self) -> TransportResult<Option<JsonRpcMessage>> {
        let mut incoming = self.incoming_rx.lock().await;
        match incoming.recv().await {
            Some(message) => Ok(Some(message)),
            None => {
                let failure = self
                    .failure
                    .lock()
                    .expect("failure mutex poisoned")
                    .clone();
                match failure {
                    Some(reason) => Err(TransportError::ReceiveFailed(reason)),
                    None => Ok(None),
                }
            }
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.incoming_tx
            .lock()
            .expect("incoming sender mutex poisoned")
            .take();
        if let Some(task) = self
            .listener_task
            .lock()
            .expect("listener task mutex poisoned")
            .take()
        {
            task.abort();
        }
        // Best-effort session teardown.
        if let Some(id) = self.session_id.read().await.clone() {
            let request = self
                .apply_headers(self.http.delete(&self.config.url))
                .header(MCP_SESSION_ID_HEADER, id);
            if let Err(error) = request.send().await {
                debug!(%error, "session DELETE failed during close");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_is_idempotent_and_ends_receive() {
        let transport = StreamableHttpTransport::new(StreamableHttpConfig {
            // Never contacted: close() only issues DELETE when a session id
            // was captured.
            url: "http://127.0.0.1:9/".to_string(),
            headers: HashMap::new(),
        })
        .unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(transport.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let transport = StreamableHttpTransport::new(StreamableHttpConfig {
            url: "http://127.0.0.1:9/".to_string(),
            headers: HashMap::new(),
        })
        .unwrap();
        transport.close().await.unwrap();
        let message = JsonRpcMessage::Request(mcpmux_protocol::JsonRpcRequest::new(
            1, "ping", None,
        ));
        assert!(matches!(
            transport.send(&message).await,
            Err(TransportError::Closed)
        ));
    }
}
