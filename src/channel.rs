//! Persistent control connection to the remote controller.
//!
//! One WebSocket at a time. After the hello/welcome handshake the reader
//! loop dispatches incoming calls to the [`RpcHandler`], resolves results of
//! our own outgoing calls, and forwards topic events. When the socket drops,
//! the loop reconnects after a fixed delay, forever. Session state lives in
//! the registry, not here, so nothing needs restoring beyond subscriptions.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::StreamExt;
use futures::SinkExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;

use crate::config::ControllerConfig;
use crate::error::{ErrorBody, RpcError};
use crate::logging;
use crate::protocol::{decode_frame, encode_frame, Frame};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const LANE_IDLE: Duration = Duration::from_secs(30);

/// What the orchestrator needs from the controller side
#[async_trait]
pub trait Controller: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Call a procedure on the controller
    async fn call(&self, procedure: &str, args: Value) -> Result<Value>;

    /// Best effort: dropped while disconnected
    fn publish(&self, topic: &str, payload: Value);
}

/// Receives everything the controller sends us
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle_call(&self, procedure: &str, args: Value) -> Result<Value, RpcError>;

    async fn handle_event(&self, topic: &str, payload: Value);

    /// Calls with the same lane run one at a time, in arrival order.
    /// `None` runs the call concurrently.
    fn lane(&self, procedure: &str, args: &Value) -> Option<String>;

    /// Topics to (re)subscribe after every handshake
    fn topics(&self) -> Vec<String> {
        Vec::new()
    }

    async fn on_connected(&self) {}
}

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, ErrorBody>>>>>;
type Outbound = mpsc::UnboundedSender<Message>;

struct Shared {
    connected: AtomicBool,
    outbound: StdMutex<Option<Outbound>>,
    pending: PendingCalls,
    next_id: AtomicU64,
    call_timeout: Duration,
}

impl Shared {
    fn outbound(&self) -> Option<Outbound> {
        self.outbound.lock().ok().and_then(|o| o.clone())
    }

    fn set_outbound(&self, tx: Option<Outbound>) {
        self.connected.store(tx.is_some(), Ordering::SeqCst);
        if let Ok(mut outbound) = self.outbound.lock() {
            *outbound = tx;
        }
    }
}

/// Cloneable handle used to talk to the controller
#[derive(Clone)]
pub struct ChannelHandle {
    shared: Arc<Shared>,
}

#[async_trait]
impl Controller for ChannelHandle {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn call(&self, procedure: &str, args: Value) -> Result<Value> {
        let out = self
            .shared
            .outbound()
            .context("Controller is not connected")?;

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);

        let frame = Frame::Call {
            id,
            procedure: procedure.to_string(),
            args,
        };
        if out.send(Message::Text(encode_frame(&frame).into())).is_err() {
            self.shared.pending.lock().await.remove(&id);
            anyhow::bail!("Controller connection closed");
        }

        match tokio::time::timeout(self.shared.call_timeout, rx).await {
            Ok(Ok(Ok(payload))) => Ok(payload),
            Ok(Ok(Err(error))) => anyhow::bail!("{}: {}", error.code, error.message),
            Ok(Err(_)) => anyhow::bail!("Controller disconnected during {}", procedure),
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                anyhow::bail!("{} timed out", procedure)
            }
        }
    }

    fn publish(&self, topic: &str, payload: Value) {
        if let Some(out) = self.shared.outbound() {
            let frame = Frame::Publish {
                topic: topic.to_string(),
                payload,
            };
            let _ = out.send(Message::Text(encode_frame(&frame).into()));
        }
    }
}

struct LaneJob {
    id: u64,
    procedure: String,
    args: Value,
    out: Outbound,
}

/// Per-key ordered workers. A worker exits after sitting idle.
#[derive(Clone, Default)]
struct Lanes {
    workers: Arc<StdMutex<HashMap<String, mpsc::UnboundedSender<LaneJob>>>>,
}

impl Lanes {
    fn submit(&self, key: String, job: LaneJob, handler: &Arc<dyn RpcHandler>) {
        let Ok(mut workers) = self.workers.lock() else {
            return;
        };
        let job = match workers.get(&key) {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(job);
        workers.insert(key.clone(), tx);
        tokio::spawn(self.clone().work(key, rx, Arc::clone(handler)));
    }

    async fn work(
        self,
        key: String,
        mut rx: mpsc::UnboundedReceiver<LaneJob>,
        handler: Arc<dyn RpcHandler>,
    ) {
        loop {
            let job = match tokio::time::timeout(LANE_IDLE, rx.recv()).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(_) => {
                    // Senders only push while holding the map lock
                    let Ok(mut workers) = self.workers.lock() else {
                        break;
                    };
                    match rx.try_recv() {
                        Ok(job) => job,
                        Err(_) => {
                            workers.remove(&key);
                            break;
                        }
                    }
                }
            };
            dispatch(&handler, job.id, job.procedure, job.args, job.out).await;
        }
    }
}

async fn dispatch(
    handler: &Arc<dyn RpcHandler>,
    id: u64,
    procedure: String,
    args: Value,
    out: Outbound,
) {
    let started = Instant::now();
    let args_text = args.to_string();
    let outcome = handler.handle_call(&procedure, args).await;
    let summary = match &outcome {
        Ok(_) => format!("ok in {}ms", started.elapsed().as_millis()),
        Err(e) => format!("{} in {}ms", e.code(), started.elapsed().as_millis()),
    };
    logging::rpc(&procedure, &args_text, &summary);
    logging::clear_context();
    let frame = Frame::from_outcome(id, &outcome);
    let _ = out.send(Message::Text(encode_frame(&frame).into()));
}

pub struct ControlChannel {
    config: ControllerConfig,
    shared: Arc<Shared>,
    lanes: Lanes,
}

impl ControlChannel {
    pub fn new(config: ControllerConfig) -> (Self, ChannelHandle) {
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(false),
            outbound: StdMutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            call_timeout: config.call_timeout(),
        });
        let handle = ChannelHandle {
            shared: Arc::clone(&shared),
        };
        (
            Self {
                config,
                shared,
                lanes: Lanes::default(),
            },
            handle,
        )
    }

    /// Connect and serve forever, reconnecting after every disconnect
    pub async fn run(self, handler: Arc<dyn RpcHandler>) -> Result<()> {
        let url = self
            .config
            .url
            .clone()
            .context("No controller URL configured")?;
        url::Url::parse(&url).with_context(|| format!("Invalid controller URL: {}", url))?;
        logging::set_controller(&url);

        let delay = self.config.reconnect_delay();
        loop {
            match self.connect_once(&url, &handler).await {
                Ok(()) => logging::info("Controller connection closed"),
                Err(e) => logging::warn(&format!("Controller connection failed: {:#}", e)),
            }
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_once(&self, url: &str, handler: &Arc<dyn RpcHandler>) -> Result<()> {
        let handshake_timeout = self.config.handshake_timeout();
        let (ws, _) = tokio::time::timeout(handshake_timeout, tokio_tungstenite::connect_async(url))
            .await
            .context("Connect timed out")?
            .with_context(|| format!("Failed to connect to {}", url))?;
        let (mut sink, mut source) = ws.split();

        let hello = Frame::Hello {
            token: self.config.token.clone().unwrap_or_default(),
            client: self.config.client_name.clone(),
            version: env!("LIVEDEBUG_VERSION").to_string(),
        };
        sink.send(Message::Text(encode_frame(&hello).into())).await?;

        let first = tokio::time::timeout(handshake_timeout, next_frame(&mut source))
            .await
            .context("No handshake reply")??;
        match first {
            Frame::Welcome => {}
            Frame::Denied { reason } => anyhow::bail!("Controller denied handshake: {}", reason),
            other => anyhow::bail!("Unexpected handshake reply: {:?}", other),
        }
        logging::info(&format!("Connected to controller {}", url));

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let heartbeat_tx = out_tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let ping = Message::Text(encode_frame(&Frame::Ping).into());
                if heartbeat_tx.send(ping).is_err() {
                    break;
                }
            }
        });

        for topic in handler.topics() {
            let frame = Frame::Subscribe { topic };
            let _ = out_tx.send(Message::Text(encode_frame(&frame).into()));
        }
        self.shared.set_outbound(Some(out_tx.clone()));
        {
            let handler = Arc::clone(handler);
            tokio::spawn(async move { handler.on_connected().await });
        }

        let result = self.read_loop(&mut source, &out_tx, handler).await;

        self.shared.set_outbound(None);
        heartbeat.abort();
        drop(out_tx);
        let _ = writer.await;
        // Outstanding outgoing calls cannot be answered any more
        self.shared.pending.lock().await.clear();

        result
    }

    async fn read_loop<S>(
        &self,
        source: &mut S,
        out: &Outbound,
        handler: &Arc<dyn RpcHandler>,
    ) -> Result<()>
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        while let Some(msg) = source.next().await {
            let text = match msg? {
                Message::Text(text) => text,
                Message::Ping(data) => {
                    let _ = out.send(Message::Pong(data));
                    continue;
                }
                Message::Close(_) => break,
                _ => continue,
            };
            let frame = match decode_frame(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    logging::warn(&format!("Ignoring malformed controller frame: {}", e));
                    continue;
                }
            };

            match frame {
                Frame::Call {
                    id,
                    procedure,
                    args,
                } => {
                    let out = out.clone();
                    match handler.lane(&procedure, &args) {
                        Some(key) => self.lanes.submit(
                            key,
                            LaneJob {
                                id,
                                procedure,
                                args,
                                out,
                            },
                            handler,
                        ),
                        None => {
                            let handler = Arc::clone(handler);
                            tokio::spawn(async move {
                                dispatch(&handler, id, procedure, args, out).await;
                            });
                        }
                    }
                }
                Frame::Result {
                    id,
                    ok,
                    payload,
                    error,
                } => {
                    let outcome = if ok {
                        Ok(payload.unwrap_or(Value::Null))
                    } else {
                        Err(error.unwrap_or_else(|| RpcError::Internal("no error body".into()).to_body()))
                    };
                    if let Some(tx) = self.shared.pending.lock().await.remove(&id) {
                        let _ = tx.send(outcome);
                    }
                }
                Frame::Event { topic, payload } => {
                    let handler = Arc::clone(handler);
                    tokio::spawn(async move { handler.handle_event(&topic, payload).await });
                }
                Frame::Ping => {
                    let _ = out.send(Message::Text(encode_frame(&Frame::Pong).into()));
                }
                Frame::Pong => {}
                other => logging::debug(&format!("Ignoring controller frame {:?}", other)),
            }
        }
        Ok(())
    }
}

async fn next_frame<S>(source: &mut S) -> Result<Frame>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = source.next().await {
        match msg? {
            Message::Text(text) => return Ok(decode_frame(&text)?),
            Message::Close(_) => break,
            _ => continue,
        }
    }
    anyhow::bail!("Connection closed during handshake")
}
