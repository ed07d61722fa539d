//! Control-channel protocol for livedebug
//!
//! JSON text frames over a WebSocket to the remote controller. Calls flow
//! both ways and are matched to results by id; topics carry session events
//! out and pushed configuration in.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorBody, RpcError};

/// Procedures the controller calls on us
pub mod procedures {
    pub const START: &str = "debugger.start";
    pub const STOP: &str = "debugger.stop";
    pub const LIST_SCRIPTS: &str = "debugger.list_scripts";
    pub const GET_SOURCE: &str = "debugger.get_source";
    pub const UPDATE_SOURCE: &str = "debugger.update_source";
    pub const SET_BREAKPOINT: &str = "debugger.set_breakpoint";
    pub const REMOVE_BREAKPOINT: &str = "debugger.remove_breakpoint";
    pub const RESUME: &str = "debugger.resume";
    pub const STEP_OVER: &str = "debugger.step_over";
    pub const STEP_INTO: &str = "debugger.step_into";
    pub const STEP_OUT: &str = "debugger.step_out";
    pub const PAUSE: &str = "debugger.pause";
    pub const GET_PROPERTIES: &str = "debugger.get_properties";
    pub const EVALUATE: &str = "debugger.evaluate";
    pub const LIST_DIRECTORY: &str = "debugger.list_directory";
    pub const REPLAY: &str = "debugger.replay";
    pub const CANCEL_REPLAY: &str = "debugger.cancel_replay";
    pub const LIST_SESSIONS: &str = "debugger.list_sessions";
    pub const PING: &str = "ping";

    /// Outgoing: ask the controller whether a session is still wanted
    pub const SESSION_ALIVE: &str = "debugger.session_alive";
    /// Outgoing: fetch the capture criteria
    pub const CAPTURE_CRITERIA: &str = "capture.criteria";
}

/// Push topic for capture criteria updates
pub const CRITERIA_TOPIC: &str = "capture.criteria";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// First frame after connecting
    #[serde(rename = "hello")]
    Hello {
        token: String,
        client: String,
        version: String,
    },

    /// Handshake accepted
    #[serde(rename = "welcome")]
    Welcome,

    /// Handshake rejected
    #[serde(rename = "denied")]
    Denied {
        #[serde(default)]
        reason: String,
    },

    /// Remote procedure call, either direction
    #[serde(rename = "call")]
    Call {
        id: u64,
        procedure: String,
        #[serde(default)]
        args: Value,
    },

    /// Outcome of a call
    #[serde(rename = "result")]
    Result {
        id: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },

    #[serde(rename = "subscribe")]
    Subscribe { topic: String },

    #[serde(rename = "publish")]
    Publish { topic: String, payload: Value },

    /// Message on a subscribed topic
    #[serde(rename = "event")]
    Event {
        topic: String,
        #[serde(default)]
        payload: Value,
    },

    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "pong")]
    Pong,
}

impl Frame {
    pub fn success(id: u64, payload: Value) -> Self {
        Frame::Result {
            id,
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(id: u64, error: &RpcError) -> Self {
        Frame::Result {
            id,
            ok: false,
            payload: None,
            error: Some(error.to_body()),
        }
    }

    /// Result frame for a handler outcome
    pub fn from_outcome(id: u64, outcome: &Result<Value, RpcError>) -> Self {
        match outcome {
            Ok(payload) => Frame::success(id, payload.clone()),
            Err(e) => Frame::failure(id, e),
        }
    }
}

pub fn encode_frame(frame: &Frame) -> String {
    serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string())
}

pub fn decode_frame(text: &str) -> Result<Frame, serde_json::Error> {
    serde_json::from_str(text)
}

/// Session id carried in a call's arguments
pub fn session_id_arg(args: &Value) -> Option<&str> {
    args.get("session_id").and_then(|v| v.as_str())
}
