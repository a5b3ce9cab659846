//! Upstream stdio transports.
//!
//! [`IoTransport`] speaks newline-delimited JSON-RPC over any pair of async
//! streams (each line is one message; this is the MCP stdio framing, not
//! LSP framing). [`ChildProcessTransport`] spawns the configured command and
//! wires its stdin/stdout into an `IoTransport` and forwards stderr to the
//! logger. Process exit closes stdout, which the owner observes as a
//! disconnect.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt;
use mcpmux_protocol::JsonRpcMessage;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex as TokioMutex, mpsc};
use tokio_util::codec::{FramedWrite, LinesCodec};
use tracing::{debug, trace, warn};

use crate::traits::{Transport, TransportError, TransportKind, TransportResult};

type BoxedRead = Pin<Box<dyn AsyncRead + Send + 'static>>;
type BoxedWrite = Pin<Box<dyn AsyncWrite + Send + 'static>>;

const INCOMING_CHANNEL_CAPACITY: usize = 256;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Newline-framed JSON-RPC over a raw read/write stream pair.
///
/// The reader side runs as a background task feeding a bounded channel;
/// unparseable lines are logged and skipped so one bad message does not kill
/// the stream.
pub struct IoTransport {
    writer: TokioMutex<Option<FramedWrite<BoxedWrite, LinesCodec>>>,
    incoming: TokioMutex<mpsc::Receiver<JsonRpcMessage>>,
    failure: Arc<StdMutex<Option<String>>>,
    reader_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl IoTransport {
    /// Wrap a stream pair. `reader` is what we read from (the peer's
    /// stdout), `writer` what we write to (the peer's stdin).
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let boxed_reader: BoxedRead = Box::pin(reader);
        let boxed_writer: BoxedWrite = Box::pin(writer);
        let (tx, rx) = mpsc::channel(INCOMING_CHANNEL_CAPACITY);
        let failure = Arc::new(StdMutex::new(None));

        let task_failure = Arc::clone(&failure);
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(boxed_reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        trace!(bytes = trimmed.len(), "stdio line received");
                        match JsonRpcMessage::from_slice(trimmed.as_bytes()) {
                            Ok(message) => {
                                if tx.send(message).await.is_err() {
                                    debug!("incoming channel closed, stopping stdio reader");
                                    break;
                                }
                            }
                            Err(error) => {
                                warn!(%error, "skipping unparseable stdio line");
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("stdio peer closed its stream");
                        break;
                    }
                    Err(error) => {
                        *task_failure.lock().expect("failure mutex poisoned") =
                            Some(error.to_string());
                        break;
                    }
                }
            }
        });

        Self {
            writer: TokioMutex::new(Some(FramedWrite::new(boxed_writer, LinesCodec::new()))),
            incoming: TokioMutex::new(rx),
            failure,
            reader_task: StdMutex::new(Some(reader_task)),
        }
    }

    fn take_failure(&self) -> Option<String> {
        self.failure.lock().expect("failure mutex poisoned").clone()
    }
}

#[async_trait]
impl Transport for IoTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn open(&self) -> TransportResult<()> {
        // The reader task starts in the constructor; nothing to do here.
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> TransportResult<()> {
        let line = serde_json::to_string(&message.to_value())
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        writer
            .send(line)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    async fn receive(&self) -> TransportResult<Option<JsonRpcMessage>> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(message) => Ok(Some(message)),
            None => match self.take_failure() {
                Some(reason) => Err(TransportError::ReceiveFailed(reason)),
                None => Ok(None),
            },
        }
    }

    async fn close(&self) -> TransportResult<()> {
        // Dropping the writer closes the peer's stdin.
        self.writer.lock().await.take();
        if let Some(task) = self
            .reader_task
            .lock()
            .expect("reader task mutex poisoned")
            .take()
        {
            task.abort();
        }
        Ok(())
    }
}

/// How to spawn an upstream child process.
#[derive(Debug, Clone)]
pub struct ChildSpawnSpec {
    /// Executable to run.
    pub command: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
    /// Working directory, when set.
    pub cwd: Option<PathBuf>,
}

/// Transport to a spawned child MCP server.
pub struct ChildProcessTransport {
    inner: IoTransport,
    child: TokioMutex<Option<Child>>,
    server_label: String,
}

impl ChildProcessTransport {
    /// Spawn `spec` and wire its stdio. `label` names the server in logs.
    ///
    /// # Errors
    ///
    /// Fails when the process cannot be spawned or its pipes were not
    /// created.
    pub fn spawn(spec: &ChildSpawnSpec, label: &str) -> TransportResult<Self> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "failed to spawn '{}': {e}",
                spec.command
            ))
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::ConnectionFailed("child stdout was not piped".to_string())
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::ConnectionFailed("child stdin was not piped".to_string())
        })?;
        if let Some(stderr) = child.stderr.take() {
            let stderr_label = label.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %stderr_label, "stderr: {line}");
                }
            });
        }

        let inner = IoTransport::new(stdout, stdin);
        Ok(Self {
            inner,
            child: TokioMutex::new(Some(child)),
            server_label: label.to_string(),
        })
    }

}

#[async_trait]
impl Transport for ChildProcessTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn open(&self) -> TransportResult<()> {
        self.inner.open().await
    }

    async fn send(&self, message: &JsonRpcMessage) -> TransportResult<()> {
        self.inner.send(message).await
    }

    async fn receive(&self) -> TransportResult<Option<JsonRpcMessage>> {
        self.inner.receive().await
    }

    async fn close(&self) -> TransportResult<()> {
        self.inner.close().await?;
        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(server = %self.server_label, %status, "child exited after stdin close");
                }
                Ok(Err(error)) => {
                    debug!(server = %self.server_label, %error, "failed to wait for child");
                }
                Err(_) => {
                    warn!(server = %self.server_label, "child ignored stdin close, killing");
                    let _ = child.kill().await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpmux_protocol::{JsonRpcRequest, RequestId};
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn line_framed_round_trip_over_duplex() {
        let (hub_side, peer_side) = tokio::io::duplex(4096);
        let (peer_read, mut peer_write) = tokio::io::split(peer_side);
        let (hub_read, hub_write) = tokio::io::split(hub_side);
        let transport = IoTransport::new(hub_read, hub_write);

        // Peer sends one message per line.
        peer_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\n")
            .await
            .unwrap();

        let message = transport.receive().await.unwrap().unwrap();
        match message {
            JsonRpcMessage::Response(response) => {
                assert_eq!(response.id.as_request_id(), Some(&RequestId::Number(1)));
            }
            other => panic!("expected response, got {other:?}"),
        }

        // Hub sends a request; the peer sees exactly one line.
        let request =
            JsonRpcMessage::Request(JsonRpcRequest::new(2, "tools/list", None));
        transport.send(&request).await.unwrap();
        drop(transport);

        let mut lines = BufReader::new(peer_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["method"], "tools/list");
        assert_eq!(value["id"], 2);
    }

    #[tokio::test]
    async fn unparseable_lines_are_skipped() {
        let (hub_side, peer_side) = tokio::io::duplex(4096);
        let (_peer_read, mut peer_write) = tokio::io::split(peer_side);
        let (hub_read, hub_write) = tokio::io::split(hub_side);
        let transport = IoTransport::new(hub_read, hub_write);

        peer_write.write_all(b"not json\n").await.unwrap();
        peer_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{\"progressToken\":\"p\",\"progress\":1.0}}\n")
            .await
            .unwrap();

        let message = transport.receive().await.unwrap().unwrap();
        assert!(matches!(message, JsonRpcMessage::Notification(_)));
    }

    #[tokio::test]
    async fn peer_close_yields_none() {
        let (hub_side, peer_side) = tokio::io::duplex(4096);
        let (hub_read, hub_write) = tokio::io::split(hub_side);
        let transport = IoTransport::new(hub_read, hub_write);
        drop(peer_side);
        assert!(transport.receive().await.unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawns_and_talks_to_a_real_child() {
        let spec = ChildSpawnSpec {
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                // Echo a canned response for every line read.
                r#"while IFS= read -r line; do printf '{"jsonrpc":"2.0","id":1,"result":{}}\n'; done"#
                    .to_string(),
            ],
            env: HashMap::new(),
            cwd: None,
        };
        let transport = ChildProcessTransport::spawn(&spec, "test").unwrap();
        let request = JsonRpcMessage::Request(JsonRpcRequest::new(1, "ping", None));
        transport.send(&request).await.unwrap();
        let reply = transport.receive().await.unwrap().unwrap();
        assert!(matches!(reply, JsonRpcMessage::Response(_)));
        transport.close().await.unwrap();
    }
}
