//! Inspector-protocol client for the forked runtime's debug port.
//!
//! Requests carry a numeric id and are matched to responses through a
//! pending map; messages without an id are events and go to a single
//! consumer channel.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::StreamExt;
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;

use crate::config::BridgeConfig;
use crate::logging;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("call `{0}` timed out")]
    Timeout(String),
    #[error("debug connection closed")]
    Closed,
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Outgoing request
#[derive(Debug, Clone, Serialize)]
pub struct InspectorRequest {
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

/// Incoming message: a response when `id` is set, an event otherwise
#[derive(Debug, Clone, Deserialize)]
pub struct InspectorMessage {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<InspectorError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InspectorError {
    pub code: i64,
    pub message: String,
}

/// Notification from the debuggee
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolEvent {
    pub method: String,
    pub params: Value,
}

/// Entry of the `/json/list` discovery endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct DebugTarget {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub web_socket_debugger_url: String,
}

/// A live debugging connection
#[async_trait]
pub trait DebugConnection: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value, ProtocolError>;

    /// Event stream. Only the first caller gets it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ProtocolEvent>>;

    async fn close(&self);
}

#[async_trait]
pub trait Attacher: Send + Sync {
    async fn attach(&self, debug_port: u16) -> Result<Arc<dyn DebugConnection>>;
}

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, ProtocolError>>>>>;

pub struct InspectorClient {
    request_id: AtomicU64,
    pending: PendingCalls,
    writer_tx: mpsc::Sender<Message>,
    events: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ProtocolEvent>>>,
    call_timeout: Duration,
}

impl InspectorClient {
    /// Connect to a WebSocket debugger URL
    pub async fn connect(url: &str, call_timeout: Duration) -> Result<Self> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .with_context(|| format!("Failed to connect to debugger at {}", url))?;
        let (mut sink, mut source) = ws.split();

        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let (writer_tx, mut writer_rx) = mpsc::channel::<Message>(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel::<ProtocolEvent>();

        // Writer task
        tokio::spawn(async move {
            while let Some(msg) = writer_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader task
        let pending_clone = Arc::clone(&pending);
        let pong_tx = writer_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Ping(data)) => {
                        let _ = pong_tx.send(Message::Pong(data)).await;
                        continue;
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let msg: InspectorMessage = match serde_json::from_str(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        logging::debug(&format!("Ignoring malformed inspector frame: {}", e));
                        continue;
                    }
                };
                if let Some(id) = msg.id {
                    let outcome = match msg.error {
                        Some(err) => Err(ProtocolError::Remote {
                            code: err.code,
                            message: err.message,
                        }),
                        None => Ok(msg.result.unwrap_or(Value::Null)),
                    };
                    if let Some(tx) = pending_clone.lock().await.remove(&id) {
                        let _ = tx.send(outcome);
                    }
                } else if let Some(method) = msg.method {
                    let _ = events_tx.send(ProtocolEvent {
                        method,
                        params: msg.params.unwrap_or(Value::Null),
                    });
                }
            }
            // Fail every outstanding call
            for (_, tx) in pending_clone.lock().await.drain() {
                let _ = tx.send(Err(ProtocolError::Closed));
            }
        });

        Ok(Self {
            request_id: AtomicU64::new(1),
            pending,
            writer_tx,
            events: std::sync::Mutex::new(Some(events_rx)),
            call_timeout,
        })
    }
}

#[async_trait]
impl DebugConnection for InspectorClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value, ProtocolError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = InspectorRequest {
            id,
            method: method.to_string(),
            params,
        };
        let text =
            serde_json::to_string(&request).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.writer_tx.send(Message::Text(text.into())).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ProtocolError::Closed);
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ProtocolError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ProtocolError::Timeout(method.to_string()))
            }
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ProtocolEvent>> {
        self.events.lock().ok().and_then(|mut events| events.take())
    }

    async fn close(&self) {
        let _ = self.writer_tx.send(Message::Close(None)).await;
    }
}

/// Finds the debugger endpoint on a local port and connects to it
pub struct InspectorAttacher {
    http: reqwest::Client,
    attach_timeout: Duration,
    call_timeout: Duration,
}

impl InspectorAttacher {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            attach_timeout: config.attach_timeout(),
            call_timeout: config.call_timeout(),
        }
    }

    /// Poll `/json/list` until a target shows up or the attach timeout passes
    pub async fn discover(&self, debug_port: u16) -> Result<String> {
        let url = format!("http://127.0.0.1:{}/json/list", debug_port);
        let deadline = Instant::now() + self.attach_timeout;

        loop {
            let last_error = match self.fetch_targets(&url).await {
                Ok(targets) => match targets.into_iter().next() {
                    Some(target) => return Ok(target.web_socket_debugger_url),
                    None => "no debug targets".to_string(),
                },
                Err(e) => e.to_string(),
            };
            if Instant::now() >= deadline {
                anyhow::bail!(
                    "Debug port {} not available within {}s: {}",
                    debug_port,
                    self.attach_timeout.as_secs(),
                    last_error
                );
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn fetch_targets(&self, url: &str) -> Result<Vec<DebugTarget>> {
        let targets = self
            .http
            .get(url)
            .timeout(Duration::from_secs(2))
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<DebugTarget>>()
            .await?;
        Ok(targets)
    }
}

#[async_trait]
impl Attacher for InspectorAttacher {
    async fn attach(&self, debug_port: u16) -> Result<Arc<dyn DebugConnection>> {
        let ws_url = self.discover(debug_port).await?;
        logging::info(&format!("Attaching debugger at {}", ws_url));
        let client = InspectorClient::connect(&ws_url, self.call_timeout).await?;

        for method in ["Runtime.enable", "Debugger.enable"] {
            client
                .call(method, Value::Null)
                .await
                .with_context(|| format!("{} failed", method))?;
        }
        // Harmless when the runtime was not started paused
        let _ = client
            .call("Runtime.runIfWaitingForDebugger", Value::Null)
            .await;

        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal debuggee: answers every call with `{"echo": method}`, fails
    /// `Fail.me`, and emits one event after `Debugger.enable`.
    async fn fake_debuggee() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut sink, mut source) = ws.split();
            while let Some(Ok(Message::Text(text))) = source.next().await {
                let req: Value = serde_json::from_str(&text).unwrap();
                let id = req["id"].clone();
                let method = req["method"].as_str().unwrap_or_default().to_string();
                if method == "Silent.call" {
                    continue;
                }
                let reply = if method == "Fail.me" {
                    serde_json::json!({"id": id, "error": {"code": -32000, "message": "nope"}})
                } else {
                    serde_json::json!({"id": id, "result": {"echo": method}})
                };
                sink.send(Message::Text(reply.to_string().into())).await.unwrap();
                if method == "Debugger.enable" {
                    let event = serde_json::json!({
                        "method": "Debugger.scriptParsed",
                        "params": {"scriptId": "1", "url": "file:///app.js"}
                    });
                    sink.send(Message::Text(event.to_string().into())).await.unwrap();
                }
            }
        });
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_call_and_events() {
        let url = fake_debuggee().await;
        let client = InspectorClient::connect(&url, Duration::from_secs(5))
            .await
            .unwrap();
        let mut events = client.take_events().unwrap();
        assert!(client.take_events().is_none());

        let result = client.call("Debugger.enable", Value::Null).await.unwrap();
        assert_eq!(result["echo"], "Debugger.enable");

        let event = events.recv().await.unwrap();
        assert_eq!(event.method, "Debugger.scriptParsed");
        assert_eq!(event.params["scriptId"], "1");
    }

    #[tokio::test]
    async fn test_remote_error() {
        let url = fake_debuggee().await;
        let client = InspectorClient::connect(&url, Duration::from_secs(5))
            .await
            .unwrap();
        let err = client.call("Fail.me", Value::Null).await.unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Remote {
                code: -32000,
                message: "nope".into()
            }
        );
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let url = fake_debuggee().await;
        let client = InspectorClient::connect(&url, Duration::from_millis(200))
            .await
            .unwrap();
        let err = client.call("Silent.call", Value::Null).await.unwrap_err();
        assert_eq!(err, ProtocolError::Timeout("Silent.call".into()));
    }

    #[test]
    fn test_request_omits_null_params() {
        let req = InspectorRequest {
            id: 7,
            method: "Debugger.resume".into(),
            params: Value::Null,
        };
        assert_eq!(
            serde_json::to_string(&req).unwrap(),
            r#"{"id":7,"method":"Debugger.resume"}"#
        );
    }

    #[test]
    fn test_target_parsing() {
        let targets: Vec<DebugTarget> = serde_json::from_str(
            r#"[{"id":"abc","type":"node","webSocketDebuggerUrl":"ws://127.0.0.1:9229/abc"}]"#,
        )
        .unwrap();
        assert_eq!(targets[0].web_socket_debugger_url, "ws://127.0.0.1:9229/abc");
    }

    #[tokio::test]
    async fn test_discover_times_out_on_closed_port() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        let attacher = InspectorAttacher::new(&BridgeConfig {
            attach_timeout_secs: 0,
            call_timeout_secs: 1,
        });
        assert!(attacher.discover(port).await.is_err());
    }

    #[tokio::test]
    async fn test_discover_reports_empty_target_list() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 2\r\nconnection: close\r\n\r\n[]")
                .await;
        });

        let attacher = InspectorAttacher::new(&BridgeConfig {
            attach_timeout_secs: 0,
            call_timeout_secs: 1,
        });
        let err = attacher.discover(port).await.unwrap_err();
        assert!(err.to_string().contains("no debug targets"), "{}", err);
    }
}
