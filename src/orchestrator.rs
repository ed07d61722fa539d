//! Session lifecycle and RPC dispatch.
//!
//! Per id: absent -> starting -> attached -> ended. A failed start leaves
//! nothing behind: ports go back to the allocator, a spawned child is
//! killed and the id is freed.

use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::bridge::{BreakpointLocation, BridgeFlags, DebugBridge};
use crate::bus::{Bus, SessionEvent, SessionEventKind};
use crate::channel::{Controller, RpcHandler};
use crate::config::Config;
use crate::criteria::CriteriaStore;
use crate::error::RpcError;
use crate::fork::{ForkSpec, ForkedChild, Launcher};
use crate::id::is_valid_session_id;
use crate::inspector::Attacher;
use crate::logging;
use crate::ports::PortAllocator;
use crate::protocol::{procedures, session_id_arg, CRITERIA_TOPIC};
use crate::registry::{Session, SessionRegistry};
use crate::remap::RemapTable;
use crate::replay::{target_port, CapturedRequest, ReplayEntry, ReplayOutcome, RequestReplayer};

/// The parts of [`Config`] the orchestrator acts on
#[derive(Debug, Clone)]
pub struct Settings {
    pub enabled: bool,
    pub flags: BridgeFlags,
    pub listen_ports: Vec<u16>,
    pub working_dir: PathBuf,
    pub orphan_interval: Duration,
    pub criteria_refresh: Duration,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        let mut listen_ports = config.fork.listen_ports.clone();
        listen_ports.sort_unstable();
        listen_ports.dedup();
        Self {
            enabled: config.debugger.enabled,
            flags: BridgeFlags {
                edit_source: config.debugger.edit_source,
                eval_expression: config.debugger.eval_expression,
            },
            listen_ports,
            working_dir: config.working_dir(),
            orphan_interval: config.orphan.check_interval(),
            criteria_refresh: Duration::from_secs(config.capture.refresh_interval_secs.max(1)),
        }
    }
}

#[derive(Deserialize)]
struct SessionArgs {
    session_id: String,
}

#[derive(Deserialize)]
struct ListScriptsArgs {
    session_id: String,
    #[serde(default)]
    since: usize,
}

#[derive(Deserialize)]
struct ScriptArgs {
    session_id: String,
    script_id: String,
}

#[derive(Deserialize)]
struct UpdateSourceArgs {
    session_id: String,
    script_id: String,
    source: String,
}

#[derive(Deserialize)]
struct SetBreakpointArgs {
    session_id: String,
    location: BreakpointLocation,
}

#[derive(Deserialize)]
struct RemoveBreakpointArgs {
    session_id: String,
    breakpoint_id: String,
}

#[derive(Deserialize)]
struct PropertiesArgs {
    session_id: String,
    object_id: String,
}

#[derive(Deserialize)]
struct EvaluateArgs {
    session_id: String,
    expression: String,
    #[serde(default)]
    call_frame_id: Option<String>,
}

#[derive(Deserialize)]
struct DirectoryArgs {
    session_id: String,
    #[serde(default)]
    path: String,
}

#[derive(Deserialize)]
struct ReplayArgs {
    session_id: String,
    request_id: String,
    request: CapturedRequest,
}

#[derive(Deserialize)]
struct CancelReplayArgs {
    session_id: String,
    request_id: String,
}

fn parse<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, RpcError> {
    Ok(serde_json::from_value(args)?)
}

/// Shared cleanup state, cloned into exit watchers
#[derive(Clone)]
struct Lifecycle {
    registry: Arc<SessionRegistry>,
    ports: Arc<PortAllocator>,
    bus: Bus,
}

impl Lifecycle {
    /// Remove the session and release what it holds. Runs once per
    /// session; a concurrent caller returns after the cleanup is done.
    async fn end(&self, session: &Arc<Session>, reason: &str, exit_code: Option<i32>) {
        session
            .cleanup_once(move || async move {
                session.mark_ended();
                if !self.registry.remove(session) {
                    return;
                }
                self.ports.release(&session.ports());
                session.bridge.close().await;
                logging::info(&format!(
                    "Session {} ended ({}, exit code {:?})",
                    session.id, reason, exit_code
                ));
                self.bus.publish(SessionEvent::new(
                    &session.id,
                    SessionEventKind::SessionEnded,
                    json!({ "reason": reason, "exit_code": exit_code }),
                ));
            })
            .await;
    }
}

pub struct Orchestrator {
    settings: Settings,
    launcher: Arc<dyn Launcher>,
    attacher: Arc<dyn Attacher>,
    controller: Arc<dyn Controller>,
    replayer: RequestReplayer,
    criteria: Arc<CriteriaStore>,
    lifecycle: Lifecycle,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        launcher: Arc<dyn Launcher>,
        attacher: Arc<dyn Attacher>,
        controller: Arc<dyn Controller>,
    ) -> Self {
        Self {
            settings: Settings::from_config(config),
            launcher,
            attacher,
            controller,
            replayer: RequestReplayer::new(&config.replay),
            criteria: Arc::new(CriteriaStore::new()),
            lifecycle: Lifecycle {
                registry: Arc::new(SessionRegistry::new()),
                ports: Arc::new(PortAllocator::from_config(&config.ports)),
                bus: Bus::default(),
            },
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.lifecycle.registry
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.lifecycle.ports
    }

    pub fn bus(&self) -> &Bus {
        &self.lifecycle.bus
    }

    pub fn criteria(&self) -> &Arc<CriteriaStore> {
        &self.criteria
    }

    // ------------------------------------------------------------------
    // start / stop
    // ------------------------------------------------------------------

    pub async fn start(&self, session_id: &str) -> Result<Value, RpcError> {
        if !self.settings.enabled {
            return Err(RpcError::DebuggerDisabled);
        }
        if !is_valid_session_id(session_id) {
            return Err(RpcError::InvalidSessionId);
        }
        self.lifecycle.registry.reserve(session_id)?;

        match self.start_reserved(session_id).await {
            Ok(session) => {
                let info = session.info();
                logging::info(&format!(
                    "Session {} attached (pid {}, debug port {})",
                    session_id, info.pid, info.debug_port
                ));
                Ok(json!({
                    "session_id": info.session_id,
                    "state": "attached",
                    "pid": info.pid,
                    "debug_port": info.debug_port,
                    "callback_port": info.callback_port,
                    "ports": info.ports,
                }))
            }
            Err(e) => {
                self.lifecycle.registry.abandon(session_id);
                logging::warn(&format!("Session {} failed to start: {}", session_id, e));
                Err(e)
            }
        }
    }

    async fn start_reserved(&self, session_id: &str) -> Result<Arc<Session>, RpcError> {
        let listen = &self.settings.listen_ports;
        let ports = self
            .lifecycle
            .ports
            .reserve(listen.len() + 2)
            .await
            .map_err(|e| RpcError::ChildProcessFailed(e.to_string()))?;

        let remap: BTreeMap<u16, u16> = listen.iter().copied().zip(ports.iter().copied()).collect();
        let spec = ForkSpec {
            session_id: session_id.to_string(),
            remap: RemapTable::new(remap),
            debug_port: ports[listen.len()],
            callback_port: ports[listen.len() + 1],
        };

        let child = match self.launcher.launch(&spec).await {
            Ok(child) => child,
            Err(e) => {
                self.lifecycle.ports.release(&ports);
                return Err(RpcError::ChildProcessFailed(format!("{:#}", e)));
            }
        };

        let conn = match self.attacher.attach(spec.debug_port).await {
            Ok(conn) => conn,
            Err(e) => {
                child.kill();
                self.lifecycle.ports.release(&ports);
                return Err(RpcError::ChildProcessFailed(format!("attach: {:#}", e)));
            }
        };

        let bridge = DebugBridge::start(
            session_id,
            conn,
            self.settings.flags,
            self.settings.working_dir.clone(),
            self.lifecycle.bus.clone(),
        );
        let session = Arc::new(Session::new(
            session_id,
            child,
            bridge,
            spec.remap,
            spec.debug_port,
            spec.callback_port,
        ));

        if let Err(e) = self.lifecycle.registry.attach(Arc::clone(&session)) {
            session.terminate();
            session.bridge.close().await;
            self.lifecycle.ports.release(&ports);
            return Err(e);
        }

        // An exit before this point is still observed: the watch keeps the
        // last state.
        let lifecycle = self.lifecycle.clone();
        let watched = Arc::clone(&session);
        tokio::spawn(async move {
            let code = watched.child.wait_exit().await;
            lifecycle.end(&watched, "exited", code).await;
        });

        self.lifecycle.bus.publish(SessionEvent::new(
            session_id,
            SessionEventKind::SessionStarted,
            json!({ "pid": session.child.pid() }),
        ));
        Ok(session)
    }

    /// Unconditional and idempotent
    pub async fn stop(&self, session_id: &str) -> Value {
        let Some(session) = self.lifecycle.registry.get(session_id) else {
            return json!({ "session_id": session_id, "state": "ended", "stopped": false });
        };
        session.terminate();
        self.lifecycle.end(&session, "stopped", None).await;
        json!({ "session_id": session_id, "state": "ended", "stopped": true })
    }

    /// Kill every session (shutdown)
    pub async fn stop_all(&self) {
        for session in self.lifecycle.registry.attached() {
            session.terminate();
            self.lifecycle.end(&session, "shutdown", None).await;
        }
    }

    fn session(&self, session_id: &str) -> Result<Arc<Session>, RpcError> {
        self.lifecycle
            .registry
            .get(session_id)
            .ok_or_else(|| RpcError::SessionNotFound(session_id.to_string()))
    }

    pub fn list_sessions(&self) -> Value {
        let mut sessions: Vec<_> = self
            .lifecycle
            .registry
            .attached()
            .iter()
            .map(|s| s.info())
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        json!({ "sessions": sessions })
    }

    // ------------------------------------------------------------------
    // replay
    // ------------------------------------------------------------------

    pub async fn replay(
        &self,
        session_id: &str,
        request_id: &str,
        request: CapturedRequest,
    ) -> Result<Value, RpcError> {
        let session = self.session(session_id)?;
        let port = target_port(&session.remap, request.port)?;
        let ticket = session.replays.begin(request_id)?;
        let entry = Arc::clone(ticket.entry());

        // The send outlives a cancellation: the forked process keeps running
        // the request, and pauses stay skipped until it really completes.
        let (done_tx, done_rx) = oneshot::channel();
        let replayer = self.replayer.clone();
        let child = Arc::clone(&session.child);
        let bridge = Arc::clone(&session.bridge);
        tokio::spawn(async move {
            let result = deliver(&replayer, child.as_ref(), port, &request, ticket.entry()).await;

            let entry = Arc::clone(ticket.entry());
            let mut skipping = entry.skip_state().await;
            ticket.finish();
            if *skipping {
                if let Err(e) = bridge.set_skip_pauses(false).await {
                    logging::warn(&format!("Could not clear pause skipping: {}", e));
                }
                *skipping = false;
            }
            drop(skipping);
            let _ = done_tx.send(result);
        });

        let outcome = entry
            .race(async {
                done_rx
                    .await
                    .unwrap_or_else(|_| Err(RpcError::Internal("replay task ended".into())))
            })
            .await?;
        serde_json::to_value(outcome).map_err(|e| RpcError::Internal(e.to_string()))
    }

    pub async fn cancel_replay(&self, session_id: &str, request_id: &str) -> Result<Value, RpcError> {
        let session = self.session(session_id)?;
        let not_in_flight = json!({ "request_id": request_id, "cancelled": false });
        let Some(entry) = session.replays.get(request_id) else {
            return Ok(not_in_flight);
        };

        // Decided under the skip lock so the replay cannot finish in between
        let mut skipping = entry.skip_state().await;
        if entry.is_finished() {
            return Ok(not_in_flight);
        }
        entry.cancel();
        let bridge = &session.bridge;
        if bridge.is_paused() {
            // Let the cancelled request run to completion
            bridge.set_skip_pauses(false).await?;
            *skipping = false;
            bridge.resume().await?;
        } else if !*skipping {
            bridge.set_skip_pauses(true).await?;
            *skipping = true;
        }
        Ok(json!({ "request_id": request_id, "cancelled": true }))
    }

    // ------------------------------------------------------------------
    // background work
    // ------------------------------------------------------------------

    /// One liveness round
    pub async fn check_orphans(&self) {
        let sessions = self.lifecycle.registry.attached();
        let mut live = Vec::with_capacity(sessions.len());
        for session in sessions {
            if session.child.has_exited() {
                self.lifecycle.end(&session, "exited", None).await;
            } else {
                live.push(session);
            }
        }

        if live.is_empty() {
            return;
        }
        if !self.controller.is_connected() {
            logging::debug("Controller disconnected; skipping liveness round");
            return;
        }

        let checks = live.iter().map(|session| {
            let controller = Arc::clone(&self.controller);
            async move {
                controller
                    .call(
                        procedures::SESSION_ALIVE,
                        json!({ "session_id": session.id }),
                    )
                    .await
            }
        });
        let answers = futures::future::join_all(checks).await;

        for (session, answer) in live.iter().zip(answers) {
            let alive = match answer {
                Ok(value) => is_alive_answer(&value),
                Err(e) => {
                    logging::warn(&format!("Liveness check for {} failed: {}", session.id, e));
                    false
                }
            };
            if !alive {
                logging::info(&format!("Session {} is orphaned", session.id));
                session.terminate();
                self.lifecycle.end(session, "orphaned", None).await;
            }
        }
    }

    /// Orphan loop, criteria refresh and event publishing
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.settings.orphan_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                this.check_orphans().await;
            }
        }));

        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.settings.criteria_refresh);
            interval.tick().await;
            loop {
                interval.tick().await;
                if this.controller.is_connected() {
                    if let Err(e) = this.criteria.refresh(this.controller.as_ref()).await {
                        logging::warn(&format!("Capture criteria refresh failed: {}", e));
                    }
                }
            }
        }));

        let controller = Arc::clone(&self.controller);
        let mut events = self.lifecycle.bus.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => controller.publish(&event.topic(), event.payload()),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        logging::warn(&format!("Dropped {} session events", n));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        tasks
    }
}

/// Push session data if the request carries any, then send it unless the
/// replay was cancelled meanwhile
async fn deliver(
    replayer: &RequestReplayer,
    child: &dyn ForkedChild,
    port: u16,
    request: &CapturedRequest,
    entry: &ReplayEntry,
) -> Result<ReplayOutcome, RpcError> {
    if let Some(data) = &request.session_data {
        child
            .push_session(data.clone(), replayer.session_ack_timeout())
            .await
            .map_err(|e| RpcError::SessionPushFailed(format!("{:#}", e)))?;
    }
    if entry.is_cancelled() {
        return Ok(ReplayOutcome::Cancelled);
    }
    replayer.dispatch(port, request).await
}

fn is_alive_answer(value: &Value) -> bool {
    match value {
        Value::Bool(alive) => *alive,
        Value::Object(map) => map.get("alive").and_then(|v| v.as_bool()).unwrap_or(false),
        _ => false,
    }
}

#[async_trait::async_trait]
impl RpcHandler for Orchestrator {
    async fn handle_call(&self, procedure: &str, args: Value) -> Result<Value, RpcError> {
        if let Some(id) = session_id_arg(&args) {
            logging::set_session(id);
        }
        self.dispatch(procedure, args).await
    }

    async fn handle_event(&self, topic: &str, payload: Value) {
        if topic == CRITERIA_TOPIC {
            if let Err(e) = self.criteria.apply(payload) {
                logging::warn(&format!("Ignoring pushed capture criteria: {}", e));
            }
        }
    }

    fn lane(&self, procedure: &str, args: &Value) -> Option<String> {
        match procedure {
            procedures::START
            | procedures::STOP
            | procedures::REPLAY
            | procedures::CANCEL_REPLAY
            | procedures::LIST_SESSIONS
            | procedures::PING => None,
            _ => session_id_arg(args).map(str::to_string),
        }
    }

    fn topics(&self) -> Vec<String> {
        vec![CRITERIA_TOPIC.to_string()]
    }

    async fn on_connected(&self) {
        if let Err(e) = self.criteria.refresh(self.controller.as_ref()).await {
            logging::warn(&format!("Capture criteria fetch failed: {}", e));
        }
    }
}

impl Orchestrator {
    async fn dispatch(&self, procedure: &str, args: Value) -> Result<Value, RpcError> {
        match procedure {
            procedures::PING => Ok(json!({
                "pong": true,
                "version": env!("LIVEDEBUG_VERSION"),
                "commit": env!("LIVEDEBUG_GIT_HASH"),
            })),
            procedures::LIST_SESSIONS => Ok(self.list_sessions()),
            procedures::START => {
                let session_id = session_id_arg(&args).unwrap_or_default().to_string();
                self.start(&session_id).await
            }
            procedures::STOP => {
                let a: SessionArgs = parse(args)?;
                Ok(self.stop(&a.session_id).await)
            }
            procedures::LIST_SCRIPTS => {
                let a: ListScriptsArgs = parse(args)?;
                Ok(self.session(&a.session_id)?.bridge.list_scripts(a.since).await)
            }
            procedures::GET_SOURCE => {
                let a: ScriptArgs = parse(args)?;
                self.session(&a.session_id)?.bridge.get_source(&a.script_id).await
            }
            procedures::UPDATE_SOURCE => {
                let a: UpdateSourceArgs = parse(args)?;
                self.session(&a.session_id)?
                    .bridge
                    .update_source(&a.script_id, &a.source)
                    .await
            }
            procedures::SET_BREAKPOINT => {
                let a: SetBreakpointArgs = parse(args)?;
                self.session(&a.session_id)?
                    .bridge
                    .set_breakpoint(&a.location)
                    .await
            }
            procedures::REMOVE_BREAKPOINT => {
                let a: RemoveBreakpointArgs = parse(args)?;
                self.session(&a.session_id)?
                    .bridge
                    .remove_breakpoint(&a.breakpoint_id)
                    .await
            }
            procedures::RESUME => {
                let a: SessionArgs = parse(args)?;
                self.session(&a.session_id)?.bridge.resume().await
            }
            procedures::STEP_OVER => {
                let a: SessionArgs = parse(args)?;
                self.session(&a.session_id)?.bridge.step_over().await
            }
            procedures::STEP_INTO => {
                let a: SessionArgs = parse(args)?;
                self.session(&a.session_id)?.bridge.step_into().await
            }
            procedures::STEP_OUT => {
                let a: SessionArgs = parse(args)?;
                self.session(&a.session_id)?.bridge.step_out().await
            }
            procedures::PAUSE => {
                let a: SessionArgs = parse(args)?;
                self.session(&a.session_id)?.bridge.pause().await
            }
            procedures::GET_PROPERTIES => {
                let a: PropertiesArgs = parse(args)?;
                self.session(&a.session_id)?
                    .bridge
                    .get_properties(&a.object_id)
                    .await
            }
            procedures::EVALUATE => {
                let a: EvaluateArgs = parse(args)?;
                self.session(&a.session_id)?
                    .bridge
                    .evaluate(&a.expression, a.call_frame_id.as_deref())
                    .await
            }
            procedures::LIST_DIRECTORY => {
                let a: DirectoryArgs = parse(args)?;
                self.session(&a.session_id)?
                    .bridge
                    .list_directory(&a.path)
                    .await
            }
            procedures::REPLAY => {
                let a: ReplayArgs = parse(args)?;
                self.replay(&a.session_id, &a.request_id, a.request).await
            }
            procedures::CANCEL_REPLAY => {
                let a: CancelReplayArgs = parse(args)?;
                self.cancel_replay(&a.session_id, &a.request_id).await
            }
            other => Err(RpcError::UnknownProcedure(other.to_string())),
        }
    }
}
