//! Parent <-> child coordination on the callback port.
//!
//! Newline-delimited JSON over a local TCP connection. The child connects
//! once, announces itself with `ready`, and then answers `session` pushes
//! with `session_ack`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, oneshot};

use crate::logging;
use crate::remap::ENV_CALLBACK_PORT;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallbackMessage {
    /// child -> parent, once after connecting
    Ready { pid: u32 },
    /// parent -> child
    Session { id: String, data: Value },
    /// child -> parent
    SessionAck { id: String },
}

impl CallbackMessage {
    fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)? + "\n")
    }
}

type PendingAcks = Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>;

/// Listener the parent binds before spawning the child
pub struct CallbackServer {
    listener: TcpListener,
    port: u16,
}

impl CallbackServer {
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("Failed to bind callback port {}", port))?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept the child's connection and wait for its `ready` message.
    ///
    /// Connections that do not open with `ready` are dropped and the next
    /// one is awaited.
    pub async fn accept_ready(self) -> Result<(CallbackLink, u32)> {
        loop {
            let (stream, _) = self
                .listener
                .accept()
                .await
                .context("Callback listener closed")?;
            let (read_half, write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                continue;
            }
            match serde_json::from_str::<CallbackMessage>(line.trim()) {
                Ok(CallbackMessage::Ready { pid }) => {
                    let link = CallbackLink::start(reader, write_half);
                    return Ok((link, pid));
                }
                Ok(other) => {
                    logging::warn(&format!("Unexpected first callback message: {:?}", other));
                }
                Err(e) => {
                    logging::warn(&format!("Invalid callback message: {}", e));
                }
            }
        }
    }
}

/// Parent side of an established callback connection
#[derive(Clone)]
pub struct CallbackLink {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    pending: PendingAcks,
    closed: Arc<AtomicBool>,
}

impl CallbackLink {
    fn start(
        mut reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
        writer: OwnedWriteHalf,
    ) -> Self {
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let pending_clone = Arc::clone(&pending);
        let closed_clone = Arc::clone(&closed);
        tokio::spawn(async move {
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if let Ok(CallbackMessage::SessionAck { id }) =
                            serde_json::from_str::<CallbackMessage>(line.trim())
                        {
                            let mut pending = pending_clone.lock().await;
                            if let Some(tx) = pending.remove(&id) {
                                let _ = tx.send(());
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
            closed_clone.store(true, Ordering::SeqCst);
            // Dropping the senders wakes every waiter with an error
            pending_clone.lock().await.clear();
        });

        Self {
            writer: Arc::new(Mutex::new(writer)),
            pending,
            closed,
        }
    }

    /// Push session state into the child and wait for its acknowledgement
    pub async fn push_session(&self, data: Value, timeout: Duration) -> Result<()> {
        if self.is_closed() {
            anyhow::bail!("Callback connection is closed");
        }
        let id = crate::id::new_id("push");
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let msg = CallbackMessage::Session {
            id: id.clone(),
            data,
        }
        .encode()?;
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(msg.as_bytes()).await {
                self.pending.lock().await.remove(&id);
                return Err(e).context("Failed to write session push");
            }
            writer.flush().await?;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => anyhow::bail!("Callback connection closed before ack"),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                anyhow::bail!("No session ack within {}s", timeout.as_secs())
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Child side: announce readiness and serve session pushes
pub struct ChildAgent {
    stream: TcpStream,
}

impl ChildAgent {
    /// Connect to the parent using `LIVEDEBUG_CALLBACK_PORT`.
    /// Returns `None` when this process was not forked for debugging.
    pub async fn connect() -> Result<Option<Self>> {
        let port = match std::env::var(ENV_CALLBACK_PORT) {
            Ok(raw) => raw
                .trim()
                .parse::<u16>()
                .with_context(|| format!("Invalid {}: {}", ENV_CALLBACK_PORT, raw))?,
            Err(_) => return Ok(None),
        };
        Self::connect_to(port).await.map(Some)
    }

    pub async fn connect_to(port: u16) -> Result<Self> {
        let mut stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .with_context(|| format!("Failed to connect to callback port {}", port))?;
        let ready = CallbackMessage::Ready {
            pid: std::process::id(),
        }
        .encode()?;
        stream.write_all(ready.as_bytes()).await?;
        stream.flush().await?;
        Ok(Self { stream })
    }

    /// Serve session pushes until the parent goes away. `on_session` runs
    /// before the ack is written.
    pub fn serve<F>(self, on_session: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let (read_half, mut write_half) = self.stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let Ok(CallbackMessage::Session { id, data }) =
                    serde_json::from_str::<CallbackMessage>(line.trim())
                else {
                    continue;
                };
                on_session(data);
                let Ok(ack) = (CallbackMessage::SessionAck { id }).encode() else {
                    continue;
                };
                if write_half.write_all(ack.as_bytes()).await.is_err() {
                    break;
                }
            }
        })
    }
}
