//! HTTP + SSE client transport (upstream direction, pre-streamable servers).
//!
//! The server holds a long-lived `GET` SSE stream open. Its first `endpoint`
//! event names the URL that outgoing messages must be `POST`ed to; every
//! later event carries one JSON-RPC message in its `data:` payload.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use mcpmux_protocol::JsonRpcMessage;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::sync::{Mutex as TokioMutex, mpsc, watch};
use tracing::{debug, warn};
use url::Url;

use crate::sse::SseParser;
use crate::traits::{Transport, TransportError, TransportKind, TransportResult};

const INCOMING_CHANNEL_CAPACITY: usize = 256;

/// Construction parameters for an SSE upstream.
#[derive(Debug, Clone)]
pub struct SseClientConfig {
    /// SSE endpoint URL (the `GET` side).
    pub url: String,
    /// Headers forwarded verbatim on every request.
    pub headers: HashMap<String, String>,
    /// How long `open` waits for the `endpoint` event.
    pub ready_timeout: Duration,
}

/// SSE client transport.
pub struct SseClientTransport {
    config: SseClientConfig,
    http: reqwest::Client,
    endpoint_rx: watch::Receiver<Option<String>>,
    endpoint_tx: watch::Sender<Option<String>>,
    incoming_tx: StdMutex<Option<mpsc::Sender<JsonRpcMessage>>>,
    incoming_rx: TokioMutex<mpsc::Receiver<JsonRpcMessage>>,
    failure: Arc<StdMutex<Option<String>>>,
    stream_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SseClientTransport {
    /// Build a transport for `config`.
    ///
    /// # Errors
    ///
    /// Fails when the URL does not parse or the HTTP client cannot be built.
    pub fn new(config: SseClientConfig) -> TransportResult<Self> {
        Url::parse(&config.url)
            .map_err(|e| TransportError::Configuration(format!("invalid SSE URL: {e}")))?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Configuration(e.to_string()))?;
        let (endpoint_tx, endpoint_rx) = watch::channel(None);
        let (tx, rx) = mpsc::channel(INCOMING_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            http,
            endpoint_rx,
            endpoint_tx,
            incoming_tx: StdMutex::new(Some(tx)),
            incoming_rx: TokioMutex::new(rx),
            failure: Arc::new(StdMutex::new(None)),
            stream_task: StdMutex::new(None),
        })
    }

    /// Resolve an `endpoint` event payload against the base URL. Servers
    /// send absolute URLs, absolute paths, or bare relative paths.
    fn resolve_endpoint(base: &str, endpoint: &str) -> Option<String> {
        let base = Url::parse(base).ok()?;
        base.join(endpoint).ok().map(Into::into)
    }
}

#[async_trait]
impl Transport for SseClientTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn open(&self) -> TransportResult<()> {
        let Some(tx) = self
            .incoming_tx
            .lock()
            .expect("incoming sender mutex poisoned")
            .clone()
        else {
            return Err(TransportError::Closed);
        };

        let mut request = self
            .http
            .get(&self.config.url)
            .header(ACCEPT, "text/event-stream");
        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }

        let base_url = self.config.url.clone();
        let endpoint_tx = self.endpoint_tx.clone();
        let failure = Arc::clone(&self.failure);
        let task = tokio::spawn(async move {
            let response = match request.send().await {
                Ok(response) if response.status().is_success() => response,
                Ok(response) => {
                    *failure.lock().expect("failure mutex poisoned") =
                        Some(format!("SSE stream refused: HTTP {}", response.status()));
                    return;
                }
                Err(error) => {
                    *failure.lock().expect("failure mutex poisoned") = Some(error.to_string());
                    return;
                }
            };

            let mut parser = SseParser::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(error) => {
                        *failure.lock().expect("failure mutex poisoned") =
                            Some(error.to_string());
                        return;
                    }
                };
                let text = String::from_utf8_lossy(&chunk);
                for event in parser.feed(&text) {
                    match event.event.as_deref() {
                        Some("endpoint") => {
                            match Self::resolve_endpoint(&base_url, event.data.trim()) {
                                Some(endpoint) => {
                                    debug!(%endpoint, "SSE endpoint discovered");
                                    let _ = endpoint_tx.send(Some(endpoint));
                                }
                                None => warn!(data = %event.data, "unresolvable endpoint event"),
                            }
                        }
                        Some("message") | None => {
                            match JsonRpcMessage::from_slice(event.data.as_bytes()) {
                                Ok(message) => {
                                    if tx.send(message).await.is_err() {
                                        return;
                                    }
                                }
                                Err(error) => {
                                    warn!(%error, "discarding unparseable SSE message")
                                }
                            }
                        }
                        Some(other) => debug!(event = %other, "ignoring SSE event"),
                    }
                }
            }
            debug!("SSE stream ended");
        });
        *self
            .stream_task
            .lock()
            .expect("stream task mutex poisoned") = Some(task);

        // The transport is unusable until the endpoint event arrives.
        let mut endpoint_rx = self.endpoint_rx.clone();
        let wait = async {
            loop {
                if endpoint_rx.borrow().is_some() {
                    return Ok::<_, TransportError>(());
                }
                endpoint_rx
                    .changed()
                    .await
                    .map_err(|_| TransportError::Closed)?;
            }
        };
        tokio::time::timeout(self.config.ready_timeout, wait)
            .await
            .map_err(|_| {
                let failure = self
                    .failure
                    .lock()
                    .expect("failure mutex poisoned")
                    .clone();
                TransportError::ConnectionFailed(failure.unwrap_or_else(|| {
                    "timed out waiting for SSE endpoint event".to_string()
                }))
            })?
    }

    async fn send(&self, message: &JsonRpcMessage) -> TransportResult<()> {
        if self
            .incoming_tx
            .lock()
            .expect("incoming sender mutex poisoned")
            .is_none()
        {
            return Err(TransportError::Closed);
        }
        let endpoint = self
            .endpoint_rx
            .borrow()
            .clone()
            .ok_or_else(|| TransportError::SendFailed("SSE endpoint not discovered".to_string()))?;

        let mut request = self
            .http
            .post(&endpoint)
            .header(CONTENT_TYPE, "application/json")
            .json(&message.to_value());
        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::HttpStatus {
                status: response.status().as_u16(),
            });
        }
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
            .stream_task
            .lock()
            .expect("stream task mutex poisoned")
            .take()
        {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn endpoint_resolution() {
        assert_eq!(
            SseClientTransport::resolve_endpoint("http://host:9000/sse", "/message").as_deref(),
            Some("http://host:9000/message")
        );
        assert_eq!(
            SseClientTransport::resolve_endpoint("http://host:9000/sse", "message?session=1")
                .as_deref(),
            Some("http://host:9000/message?session=1")
        );
        assert_eq!(
            SseClientTransport::resolve_endpoint(
                "http://host:9000/sse",
                "http://other:1234/rpc"
            )
            .as_deref(),
            Some("http://other:1234/rpc")
        );
    }

    #[tokio::test]
    async fn send_without_endpoint_fails() {
        let transport = SseClientTransport::new(SseClientConfig {
            url: "http://127.0.0.1:9/sse".to_string(),
            headers: HashMap::new(),
            ready_timeout: Duration::from_millis(10),
        })
        .unwrap();
        let message = JsonRpcMessage::Request(mcpmux_protocol::JsonRpcRequest::new(
            1, "ping", None,
        ));
        assert!(matches!(
            transport.send(&message).await,
            Err(TransportError::SendFailed(_))
        ));
    }
}
