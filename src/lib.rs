//! Session Bridge
//!
//! Drives one agent app-server subprocess per workspace over newline-delimited
//! JSON-RPC and turns its output into state a monitor UI can render:
//! - Handshake, request/response correlation and crash detection per channel
//! - Classification of server notifications into typed domain events
//! - Thread/item trees reconciled against optimistic local entries
//! - Pending approvals, permission denials and "always allow" rules

pub mod approvals;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod model;
pub mod protocol;
pub mod reconciler;
pub mod router;
pub mod workspace;

pub use approvals::{ApprovalArbiter, ApprovalDecision, ApprovalRule, RuleStore, SettingsRuleStore};
pub use channel::{ChannelState, SessionChannel, SubprocessTransport};
pub use config::BridgeConfig;
pub use dispatch::AgentSession;
pub use events::{classify, DomainEvent};
pub use model::{ItemId, ThreadItem};
pub use reconciler::{merge_items, ThreadStore};
pub use workspace::{BridgeEvent, ConnectionState, WorkspaceManager};

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur in the bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to start agent: {0}")]
    Spawn(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Channel not ready: {method} sent before the handshake completed")]
    NotReady { method: String },

    #[error("Channel closed")]
    ChannelClosed,

    #[error("{method} failed: {message} (code {code})")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    #[error("{method} timed out")]
    Timeout { method: String },

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Failed to deliver decision for approval {request_id}: {reason}")]
    ApprovalSend { request_id: u64, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("{method} failed in workspace {workspace_id}{}: {source}", thread_context(.thread_id))]
    Dispatch {
        workspace_id: String,
        thread_id: Option<String>,
        method: String,
        source: Box<BridgeError>,
    },

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Whether the caller may reasonably retry the operation that failed.
    ///
    /// Transport failures are retryable by reconnecting; server-side and
    /// contract errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Spawn(_)
            | BridgeError::Handshake(_)
            | BridgeError::ChannelClosed
            | BridgeError::Timeout { .. } => true,
            BridgeError::Dispatch { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

fn thread_context(thread_id: &Option<String>) -> String {
    thread_id
        .as_deref()
        .map(|id| format!(" (thread {id})"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_error_carries_context() {
        let err = BridgeError::Dispatch {
            workspace_id: "ws-1".to_string(),
            thread_id: Some("thr-9".to_string()),
            method: "turn/start".to_string(),
            source: Box::new(BridgeError::ChannelClosed),
        };
        let text = err.to_string();
        assert!(text.contains("ws-1"));
        assert!(text.contains("thr-9"));
        assert!(text.contains("turn/start"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_rpc_error_is_not_retryable() {
        let err = BridgeError::Rpc {
            method: "thread/resume".to_string(),
            code: -32600,
            message: "no such thread".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("no such thread"));
    }
}
