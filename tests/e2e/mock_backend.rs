//! Mock seams for e2e tests
//!
//! Stands in for the process launcher, the debug attacher and the remote
//! controller so the orchestrator can be driven without real child
//! processes or network peers.

use anyhow::Result;
use async_trait::async_trait;
use livedebug::channel::Controller;
use livedebug::fork::{ChildState, ForkSpec, ForkedChild, Launcher};
use livedebug::inspector::{Attacher, DebugConnection, ProtocolError, ProtocolEvent};
use livedebug::protocol::procedures;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub struct MockChild {
    pid: u32,
    kills: AtomicUsize,
    state: watch::Sender<ChildState>,
    pushes: Mutex<Vec<Value>>,
}

impl MockChild {
    fn new(pid: u32) -> Self {
        let (state, _) = watch::channel(ChildState::Running);
        Self {
            pid,
            kills: AtomicUsize::new(0),
            state,
            pushes: Mutex::new(Vec::new()),
        }
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// The process dies on its own
    pub fn simulate_exit(&self, code: Option<i32>) {
        self.state.send_replace(ChildState::Exited(code));
    }

    pub fn pushes(&self) -> Vec<Value> {
        self.pushes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ForkedChild for MockChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn kill(&self) -> bool {
        let first = self.kills.fetch_add(1, Ordering::SeqCst) == 0;
        if first {
            self.state.send_replace(ChildState::Exited(None));
        }
        first
    }

    fn state(&self) -> ChildState {
        *self.state.borrow()
    }

    fn watch_exit(&self) -> watch::Receiver<ChildState> {
        self.state.subscribe()
    }

    async fn push_session(&self, data: Value, _timeout: Duration) -> Result<()> {
        self.pushes.lock().unwrap().push(data);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockLauncher {
    next_pid: AtomicU32,
    pub fail: AtomicBool,
    specs: Mutex<Vec<ForkSpec>>,
    children: Mutex<Vec<Arc<MockChild>>>,
}

impl MockLauncher {
    pub fn launches(&self) -> usize {
        self.specs.lock().unwrap().len()
    }

    pub fn specs(&self) -> Vec<ForkSpec> {
        self.specs.lock().unwrap().clone()
    }

    pub fn child(&self, index: usize) -> Arc<MockChild> {
        Arc::clone(&self.children.lock().unwrap()[index])
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn launch(&self, spec: &ForkSpec) -> Result<Arc<dyn ForkedChild>> {
        self.specs.lock().unwrap().push(spec.clone());
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("spawn refused");
        }
        // Give concurrent starts a chance to interleave
        tokio::task::yield_now().await;
        let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        let child = Arc::new(MockChild::new(pid));
        self.children.lock().unwrap().push(Arc::clone(&child));
        Ok(child)
    }
}

pub struct MockConnection {
    calls: Mutex<Vec<(String, Value)>>,
    events_tx: mpsc::UnboundedSender<ProtocolEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ProtocolEvent>>>,
}

impl MockConnection {
    fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            calls: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn methods(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(m, _)| m.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    /// Deliver a notification as if the debuggee sent it
    pub fn emit(&self, method: &str, params: Value) {
        let _ = self.events_tx.send(ProtocolEvent {
            method: method.to_string(),
            params,
        });
    }
}

#[async_trait]
impl DebugConnection for MockConnection {
    async fn call(&self, method: &str, params: Value) -> Result<Value, ProtocolError> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params));
        Ok(match method {
            "Runtime.evaluate" => json!({"result": {"type": "number", "value": 2}}),
            "Debugger.setBreakpointByUrl" => json!({
                "breakpointId": "bp-1",
                "locations": [{"scriptId": "7", "lineNumber": 3, "columnNumber": 0}]
            }),
            _ => json!({}),
        })
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ProtocolEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    async fn close(&self) {}
}

#[derive(Default)]
pub struct MockAttacher {
    pub fail: AtomicBool,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockAttacher {
    pub fn connection(&self, index: usize) -> Arc<MockConnection> {
        Arc::clone(&self.connections.lock().unwrap()[index])
    }
}

#[async_trait]
impl Attacher for MockAttacher {
    async fn attach(&self, debug_port: u16) -> Result<Arc<dyn DebugConnection>> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("no debug target on port {}", debug_port);
        }
        let conn = Arc::new(MockConnection::new());
        self.connections.lock().unwrap().push(Arc::clone(&conn));
        Ok(conn)
    }
}

pub struct MockController {
    pub connected: AtomicBool,
    pub alive: AtomicBool,
    alive_calls: AtomicUsize,
    published: Mutex<Vec<(String, Value)>>,
}

impl MockController {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            alive: AtomicBool::new(true),
            alive_calls: AtomicUsize::new(0),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn alive_calls(&self) -> usize {
        self.alive_calls.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl Controller for MockController {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn call(&self, procedure: &str, _args: Value) -> Result<Value> {
        if !self.is_connected() {
            anyhow::bail!("not connected");
        }
        match procedure {
            procedures::SESSION_ALIVE => {
                self.alive_calls.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Bool(self.alive.load(Ordering::SeqCst)))
            }
            procedures::CAPTURE_CRITERIA => Ok(json!({"status_codes": [500]})),
            other => anyhow::bail!("unexpected call {}", other),
        }
    }

    fn publish(&self, topic: &str, payload: Value) {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
    }
}
