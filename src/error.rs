//! Structured refusals returned to the controller.
//!
//! Every failure that crosses the control channel is one of these. The
//! `code()` string is the machine-readable part the controller matches on;
//! the display text is for humans.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    // --------------------------------- session start --------------------------------------------
    #[error("debugging is disabled in configuration")]
    DebuggerDisabled,
    #[error("missing or invalid session id")]
    InvalidSessionId,
    #[error("session `{0}` already exists")]
    DuplicateSession(String),
    #[error("forked process failed: {0}")]
    ChildProcessFailed(String),

    // --------------------------------- session operations ---------------------------------------
    #[error("session `{0}` not found")]
    SessionNotFound(String),
    #[error("source editing is disabled in configuration")]
    EditSourceDisabled,
    #[error("expression evaluation is disabled in configuration")]
    EvalExpressionDisabled,
    #[error("cannot add breakpoint here: {0}")]
    CannotAddBreakpoint(String),
    #[error("cannot read directory `{path}`: {reason}")]
    DirectoryUnreadable { path: String, reason: String },
    #[error("path `{0}` is outside the working tree")]
    PathOutsideRoot(String),
    #[error("debug protocol error: {0}")]
    Protocol(String),

    // --------------------------------- replay ---------------------------------------------------
    #[error("no port mapping for replay target: {0}")]
    PortNotMapped(String),
    #[error("replay request `{0}` already in flight")]
    DuplicateReplay(String),
    #[error("replay failed: {0}")]
    ReplayFailed(String),
    #[error("replay timed out after {0}s")]
    ReplayTimeout(u64),
    #[error("replay file unavailable: {0}")]
    ReplayFileUnavailable(String),
    #[error("session data was not acknowledged: {0}")]
    SessionPushFailed(String),

    // --------------------------------- dispatch -------------------------------------------------
    #[error("unknown procedure `{0}`")]
    UnknownProcedure(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RpcError {
    /// Stable machine-readable reason
    pub fn code(&self) -> &'static str {
        match self {
            RpcError::DebuggerDisabled => "debugger_disabled",
            RpcError::InvalidSessionId => "debugger_session_id",
            RpcError::DuplicateSession(_) => "debugger_session_id_duplicate",
            RpcError::ChildProcessFailed(_) => "child_process_failed",
            RpcError::SessionNotFound(_) => "session_not_found",
            RpcError::EditSourceDisabled => "edit_source_disabled",
            RpcError::EvalExpressionDisabled => "eval_expression_disabled",
            RpcError::CannotAddBreakpoint(_) => "cannot_add_breakpoint",
            RpcError::DirectoryUnreadable { .. } => "directory_unreadable",
            RpcError::PathOutsideRoot(_) => "path_outside_root",
            RpcError::Protocol(_) => "protocol_error",
            RpcError::PortNotMapped(_) => "port_not_mapped",
            RpcError::DuplicateReplay(_) => "replay_duplicate",
            RpcError::ReplayFailed(_) => "replay_failed",
            RpcError::ReplayTimeout(_) => "replay_timeout",
            RpcError::ReplayFileUnavailable(_) => "replay_file_unavailable",
            RpcError::SessionPushFailed(_) => "session_push_failed",
            RpcError::UnknownProcedure(_) => "unknown_procedure",
            RpcError::InvalidArguments(_) => "invalid_arguments",
            RpcError::Internal(_) => "internal_error",
        }
    }

    /// Wire representation
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::InvalidArguments(e.to_string())
    }
}

/// Error object as sent in a `result` frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}
