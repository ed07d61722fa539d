//! Per-session debugging operations against the forked process.
//!
//! Every protocol operation goes through `op_lock`, so the debuggee sees
//! one command at a time per session. Events are pumped from the
//! connection onto the bus as they arrive.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::bus::{Bus, SessionEvent, SessionEventKind};
use crate::error::RpcError;
use crate::inspector::{DebugConnection, ProtocolError, ProtocolEvent};
use crate::logging;

#[derive(Debug, Clone, Copy, Default)]
pub struct BridgeFlags {
    pub edit_source: bool,
    pub eval_expression: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptInfo {
    pub script_id: String,
    pub url: String,
    #[serde(default)]
    pub start_line: u64,
    #[serde(default)]
    pub end_line: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl ScriptInfo {
    fn from_event(params: &Value) -> Option<Self> {
        Some(Self {
            script_id: params.get("scriptId")?.as_str()?.to_string(),
            url: params
                .get("url")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            start_line: params.get("startLine").and_then(|v| v.as_u64()).unwrap_or(0),
            end_line: params.get("endLine").and_then(|v| v.as_u64()).unwrap_or(0),
            hash: params
                .get("hash")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }
}

/// Where to put a breakpoint: a parsed script or a URL
#[derive(Debug, Clone, Deserialize)]
pub struct BreakpointLocation {
    #[serde(default)]
    pub script_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    pub line_number: u64,
    #[serde(default)]
    pub column_number: Option<u64>,
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

pub struct DebugBridge {
    session_id: String,
    conn: Arc<dyn DebugConnection>,
    flags: BridgeFlags,
    root_dir: PathBuf,
    scripts: Arc<RwLock<Vec<ScriptInfo>>>,
    paused: Arc<AtomicBool>,
    op_lock: Mutex<()>,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DebugBridge {
    /// Wrap an attached connection and start relaying its events
    pub fn start(
        session_id: &str,
        conn: Arc<dyn DebugConnection>,
        flags: BridgeFlags,
        root_dir: PathBuf,
        bus: Bus,
    ) -> Arc<Self> {
        let scripts = Arc::new(RwLock::new(Vec::new()));
        let paused = Arc::new(AtomicBool::new(false));

        let pump = conn.take_events().map(|events| {
            tokio::spawn(pump_events(
                session_id.to_string(),
                events,
                Arc::clone(&scripts),
                Arc::clone(&paused),
                bus,
            ))
        });

        Arc::new(Self {
            session_id: session_id.to_string(),
            conn,
            flags,
            root_dir,
            scripts,
            paused,
            op_lock: Mutex::new(()),
            pump: std::sync::Mutex::new(pump),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let _guard = self.op_lock.lock().await;
        self.conn.call(method, params).await.map_err(|e| {
            logging::warn(&format!("{} failed: {}", method, e));
            RpcError::Protocol(e.to_string())
        })
    }

    /// Scripts parsed after index `since`
    pub async fn list_scripts(&self, since: usize) -> Value {
        let scripts = self.scripts.read().await;
        let total = scripts.len();
        let slice: Vec<&ScriptInfo> = scripts.iter().skip(since).collect();
        json!({ "scripts": slice, "total": total })
    }

    pub async fn get_source(&self, script_id: &str) -> Result<Value, RpcError> {
        let result = self
            .call("Debugger.getScriptSource", json!({ "scriptId": script_id }))
            .await?;
        Ok(json!({
            "script_id": script_id,
            "source": result.get("scriptSource").cloned().unwrap_or(Value::Null),
        }))
    }

    pub async fn update_source(&self, script_id: &str, source: &str) -> Result<Value, RpcError> {
        if !self.flags.edit_source {
            return Err(RpcError::EditSourceDisabled);
        }
        self.call(
            "Debugger.setScriptSource",
            json!({ "scriptId": script_id, "scriptSource": source }),
        )
        .await
    }

    pub async fn set_breakpoint(&self, location: &BreakpointLocation) -> Result<Value, RpcError> {
        let (method, params) = match (&location.script_id, &location.url) {
            (Some(script_id), _) => {
                let mut loc = json!({ "scriptId": script_id, "lineNumber": location.line_number });
                if let Some(col) = location.column_number {
                    loc["columnNumber"] = json!(col);
                }
                let mut params = json!({ "location": loc });
                if let Some(cond) = &location.condition {
                    params["condition"] = json!(cond);
                }
                ("Debugger.setBreakpoint", params)
            }
            (None, Some(url)) => {
                let mut params = json!({ "url": url, "lineNumber": location.line_number });
                if let Some(col) = location.column_number {
                    params["columnNumber"] = json!(col);
                }
                if let Some(cond) = &location.condition {
                    params["condition"] = json!(cond);
                }
                ("Debugger.setBreakpointByUrl", params)
            }
            (None, None) => {
                return Err(RpcError::InvalidArguments(
                    "breakpoint needs script_id or url".to_string(),
                ));
            }
        };

        let _guard = self.op_lock.lock().await;
        let result = match self.conn.call(method, params).await {
            Ok(result) => result,
            Err(ProtocolError::Remote { message, .. }) => {
                return Err(RpcError::CannotAddBreakpoint(message));
            }
            Err(e) => return Err(RpcError::Protocol(e.to_string())),
        };

        let breakpoint_id = result
            .get("breakpointId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RpcError::CannotAddBreakpoint("no breakpoint id returned".into()))?;
        let locations = match (result.get("locations"), result.get("actualLocation")) {
            (_, Some(actual)) => json!([actual]),
            (Some(locations), None) => locations.clone(),
            (None, None) => json!([]),
        };

        // setBreakpointByUrl accepts lines without code and resolves nothing
        if locations.as_array().is_none_or(|l| l.is_empty()) {
            if let Err(e) = self
                .conn
                .call(
                    "Debugger.removeBreakpoint",
                    json!({ "breakpointId": breakpoint_id }),
                )
                .await
            {
                logging::warn(&format!(
                    "Failed to drop unresolved breakpoint {}: {}",
                    breakpoint_id, e
                ));
            }
            return Err(RpcError::CannotAddBreakpoint(format!(
                "no code at line {}",
                location.line_number
            )));
        }
        Ok(json!({ "breakpoint_id": breakpoint_id, "locations": locations }))
    }

    pub async fn remove_breakpoint(&self, breakpoint_id: &str) -> Result<Value, RpcError> {
        self.call(
            "Debugger.removeBreakpoint",
            json!({ "breakpointId": breakpoint_id }),
        )
        .await
    }

    pub async fn resume(&self) -> Result<Value, RpcError> {
        self.call("Debugger.resume", Value::Null).await
    }

    pub async fn step_over(&self) -> Result<Value, RpcError> {
        self.call("Debugger.stepOver", Value::Null).await
    }

    pub async fn step_into(&self) -> Result<Value, RpcError> {
        self.call("Debugger.stepInto", Value::Null).await
    }

    pub async fn step_out(&self) -> Result<Value, RpcError> {
        self.call("Debugger.stepOut", Value::Null).await
    }

    pub async fn pause(&self) -> Result<Value, RpcError> {
        self.call("Debugger.pause", Value::Null).await
    }

    pub async fn set_skip_pauses(&self, skip: bool) -> Result<Value, RpcError> {
        self.call("Debugger.setSkipAllPauses", json!({ "skip": skip }))
            .await
    }

    pub async fn get_properties(&self, object_id: &str) -> Result<Value, RpcError> {
        self.call(
            "Runtime.getProperties",
            json!({ "objectId": object_id, "ownProperties": true }),
        )
        .await
    }

    /// Refused before any protocol traffic when evaluation is disabled
    pub async fn evaluate(
        &self,
        expression: &str,
        call_frame_id: Option<&str>,
    ) -> Result<Value, RpcError> {
        if !self.flags.eval_expression {
            return Err(RpcError::EvalExpressionDisabled);
        }
        match call_frame_id {
            Some(frame) => {
                self.call(
                    "Debugger.evaluateOnCallFrame",
                    json!({ "callFrameId": frame, "expression": expression }),
                )
                .await
            }
            None => {
                self.call("Runtime.evaluate", json!({ "expression": expression }))
                    .await
            }
        }
    }

    /// Entries of a directory inside the working tree, directories first
    pub async fn list_directory(&self, path: &str) -> Result<Value, RpcError> {
        let entries = list_directory(&self.root_dir, path).await?;
        Ok(json!({ "path": path, "entries": entries }))
    }

    /// Stop relaying events and drop the protocol connection
    pub async fn close(&self) {
        if let Some(pump) = self.pump.lock().ok().and_then(|mut p| p.take()) {
            pump.abort();
        }
        self.conn.close().await;
    }
}

async fn pump_events(
    session_id: String,
    mut events: tokio::sync::mpsc::UnboundedReceiver<ProtocolEvent>,
    scripts: Arc<RwLock<Vec<ScriptInfo>>>,
    paused: Arc<AtomicBool>,
    bus: Bus,
) {
    while let Some(event) = events.recv().await {
        let kind = match event.method.as_str() {
            "Debugger.scriptParsed" => {
                if let Some(script) = ScriptInfo::from_event(&event.params) {
                    scripts.write().await.push(script);
                }
                continue;
            }
            "Debugger.paused" => {
                paused.store(true, Ordering::SeqCst);
                SessionEventKind::Paused
            }
            "Debugger.resumed" => {
                paused.store(false, Ordering::SeqCst);
                SessionEventKind::Resumed
            }
            "Runtime.consoleAPICalled" => SessionEventKind::ConsoleApiCalled,
            _ => continue,
        };
        bus.publish(SessionEvent::new(&session_id, kind, event.params));
    }
    logging::debug(&format!("Event pump for {} ended", session_id));
}

/// Resolve `requested` against `root` without leaving it
fn resolve_in_root(root: &Path, requested: &str) -> Result<PathBuf, RpcError> {
    let unreadable = |reason: String| RpcError::DirectoryUnreadable {
        path: requested.to_string(),
        reason,
    };

    let root = root
        .canonicalize()
        .map_err(|e| unreadable(format!("working tree: {}", e)))?;

    let relative = Path::new(requested);
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(RpcError::PathOutsideRoot(requested.to_string()));
    }
    let candidate = if relative.is_absolute() {
        relative.to_path_buf()
    } else {
        root.join(relative)
    };
    let resolved = candidate
        .canonicalize()
        .map_err(|e| unreadable(e.to_string()))?;

    if !resolved.starts_with(&root) {
        return Err(RpcError::PathOutsideRoot(requested.to_string()));
    }
    Ok(resolved)
}

pub async fn list_directory(root: &Path, requested: &str) -> Result<Vec<DirEntry>, RpcError> {
    let dir = resolve_in_root(root, requested)?;
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());

    let mut reader = tokio::fs::read_dir(&dir)
        .await
        .map_err(|e| RpcError::DirectoryUnreadable {
            path: requested.to_string(),
            reason: e.to_string(),
        })?;

    let mut entries = Vec::new();
    loop {
        let entry = match reader.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                return Err(RpcError::DirectoryUnreadable {
                    path: requested.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        let full = entry.path();
        let path = full
            .strip_prefix(&root)
            .unwrap_or(&full)
            .to_string_lossy()
            .into_owned();
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            path,
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
        });
    }

    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
    Ok(entries)
}
