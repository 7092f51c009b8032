//! Pending-request router
//!
//! Correlates outgoing request ids with the callers waiting on them. Every
//! registered id completes exactly once: by a matching response, by an
//! explicit rejection, or by `reject_all` when the channel closes.

use crate::protocol::JsonRpcError;
use crate::{BridgeError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::debug;

struct PendingEntry {
    method: String,
    tx: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
struct RouterState {
    pending: HashMap<u64, PendingEntry>,
    last_id: Option<u64>,
    closed: bool,
}

/// Map from request id to the completion handle of its caller
#[derive(Default)]
pub struct PendingRequests {
    state: Mutex<RouterState>,
}

/// Caller side of a registered request
#[derive(Debug)]
pub struct PendingHandle {
    id: u64,
    method: String,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait for the response. A dropped sender means the router went away
    /// with the channel.
    pub async fn wait(self) -> Result<Value> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::ChannelClosed),
        }
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a fresh id. Ids must strictly increase over the router's
    /// lifetime, and nothing can be registered once the router is closed.
    pub fn register(&self, id: u64, method: &str) -> Result<PendingHandle> {
        let mut state = self.lock();
        if state.closed {
            return Err(BridgeError::ChannelClosed);
        }
        if state.last_id.is_some_and(|last| id <= last) {
            return Err(BridgeError::InvalidArgument(format!(
                "request id {id} was already used on this channel"
            )));
        }
        state.last_id = Some(id);
        let (tx, rx) = oneshot::channel();
        state.pending.insert(
            id,
            PendingEntry {
                method: method.to_string(),
                tx,
            },
        );
        Ok(PendingHandle {
            id,
            method: method.to_string(),
            rx,
        })
    }

    /// Complete `id` with the server's outcome. Returns false for unknown ids.
    pub fn resolve(&self, id: u64, outcome: std::result::Result<Value, JsonRpcError>) -> bool {
        let Some(entry) = self.lock().pending.remove(&id) else {
            debug!("Response for unknown request id {}", id);
            return false;
        };
        let result = outcome.map_err(|error| BridgeError::Rpc {
            method: entry.method.clone(),
            code: error.code,
            message: error.display_message(),
        });
        // The caller may have stopped waiting; that still counts as resolved.
        let _ = entry.tx.send(result);
        true
    }

    /// Fail a single request. Returns false for unknown ids.
    pub fn reject(&self, id: u64, error: BridgeError) -> bool {
        let Some(entry) = self.lock().pending.remove(&id) else {
            return false;
        };
        let _ = entry.tx.send(Err(error));
        true
    }

    /// Fail every outstanding request and refuse new ones. Returns how many
    /// requests were rejected.
    pub fn reject_all(&self, error: impl Fn() -> BridgeError) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut state = self.lock();
            state.closed = true;
            state.pending.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(error()));
        }
        if count > 0 {
            debug!("Rejected {} pending requests", count);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
