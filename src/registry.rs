//! Session registry
//!
//! Tracks every debugging session by its caller-supplied id. An id is
//! claimed (`Starting`) before any resource is acquired, so two concurrent
//! starts for the same id cannot both proceed.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::bridge::DebugBridge;
use crate::error::RpcError;
use crate::fork::ForkedChild;
use crate::remap::RemapTable;
use crate::replay::ReplayTracker;

/// Information about a live session, as reported to the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    /// Process ID of the forked copy
    pub pid: u32,
    pub debug_port: u16,
    pub callback_port: u16,
    /// Original port -> reassigned port
    pub ports: BTreeMap<u16, u16>,
    /// When the session attached (ISO 8601)
    pub created_at: String,
}

pub struct Session {
    pub id: String,
    pub child: Arc<dyn ForkedChild>,
    pub bridge: Arc<DebugBridge>,
    pub remap: RemapTable,
    pub debug_port: u16,
    pub callback_port: u16,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub replays: ReplayTracker,
    ended: AtomicBool,
    cleanup: tokio::sync::OnceCell<()>,
}

impl Session {
    pub fn new(
        id: &str,
        child: Arc<dyn ForkedChild>,
        bridge: Arc<DebugBridge>,
        remap: RemapTable,
        debug_port: u16,
        callback_port: u16,
    ) -> Self {
        Self {
            id: id.to_string(),
            child,
            bridge,
            remap,
            debug_port,
            callback_port,
            created_at: chrono::Utc::now(),
            replays: ReplayTracker::new(),
            ended: AtomicBool::new(false),
            cleanup: tokio::sync::OnceCell::new(),
        }
    }

    /// Every port this session holds
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.remap.iter().map(|(_, new)| new).collect();
        ports.push(self.debug_port);
        ports.push(self.callback_port);
        ports
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            pid: self.child.pid(),
            debug_port: self.debug_port,
            callback_port: self.callback_port,
            ports: self.remap.as_map().clone(),
            created_at: self.created_at.to_rfc3339(),
        }
    }

    /// Mark ended and kill the child. Only the first call does anything.
    pub fn terminate(&self) -> bool {
        if !self.mark_ended() {
            return false;
        }
        self.child.kill();
        true
    }

    /// Mark ended without touching the child (it already exited)
    pub fn mark_ended(&self) -> bool {
        !self.ended.swap(true, Ordering::SeqCst)
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Run `cleanup` once. Concurrent callers wait until it has finished.
    pub async fn cleanup_once<F, Fut>(&self, cleanup: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        self.cleanup.get_or_init(cleanup).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Absent,
    Starting,
    Attached,
}

enum Slot {
    Starting,
    Attached(Arc<Session>),
}

#[derive(Default)]
pub struct SessionRegistry {
    slots: RwLock<HashMap<String, Slot>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim an id for a start in progress
    pub fn reserve(&self, id: &str) -> Result<(), RpcError> {
        let mut slots = self.write()?;
        if slots.contains_key(id) {
            return Err(RpcError::DuplicateSession(id.to_string()));
        }
        slots.insert(id.to_string(), Slot::Starting);
        Ok(())
    }

    /// Promote a reserved id to an attached session
    pub fn attach(&self, session: Arc<Session>) -> Result<(), RpcError> {
        let mut slots = self.write()?;
        match slots.get(&session.id) {
            Some(Slot::Starting) => {
                slots.insert(session.id.clone(), Slot::Attached(session));
                Ok(())
            }
            Some(Slot::Attached(_)) => Err(RpcError::DuplicateSession(session.id.clone())),
            None => Err(RpcError::Internal(format!(
                "session {} was not reserved",
                session.id
            ))),
        }
    }

    /// Drop a reservation after a failed start
    pub fn abandon(&self, id: &str) {
        if let Ok(mut slots) = self.slots.write() {
            if matches!(slots.get(id), Some(Slot::Starting)) {
                slots.remove(id);
            }
        }
    }

    /// Remove an attached session. Only removes this exact session, so a
    /// late cleanup cannot evict a newer session that reused the id.
    pub fn remove(&self, session: &Arc<Session>) -> bool {
        let Ok(mut slots) = self.slots.write() else {
            return false;
        };
        let matches = matches!(
            slots.get(&session.id),
            Some(Slot::Attached(existing)) if Arc::ptr_eq(existing, session)
        );
        if matches {
            slots.remove(&session.id);
        }
        matches
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let slots = self.slots.read().ok()?;
        match slots.get(id) {
            Some(Slot::Attached(session)) => Some(Arc::clone(session)),
            _ => None,
        }
    }

    pub fn state(&self, id: &str) -> SessionState {
        let Ok(slots) = self.slots.read() else {
            return SessionState::Absent;
        };
        match slots.get(id) {
            None => SessionState::Absent,
            Some(Slot::Starting) => SessionState::Starting,
            Some(Slot::Attached(_)) => SessionState::Attached,
        }
    }

    /// Snapshot of all attached sessions
    pub fn attached(&self) -> Vec<Arc<Session>> {
        let Ok(slots) = self.slots.read() else {
            return Vec::new();
        };
        slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Attached(session) => Some(Arc::clone(session)),
                Slot::Starting => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Slot>>, RpcError> {
        self.slots
            .write()
            .map_err(|_| RpcError::Internal("session registry poisoned".into()))
    }
}
