//! Workspace registry
//!
//! Each workspace owns at most one live `SessionChannel`, its own thread
//! store and its own approval arbiter. A pump task per connection feeds
//! classified events into that state in arrival order and republishes them
//! on a broadcast bus shared by all workspaces.

use crate::approvals::{ApprovalArbiter, RuleStore, SettingsRuleStore};
use crate::channel::{SessionChannel, SubprocessTransport};
use crate::config::BridgeConfig;
use crate::dispatch::AgentSession;
use crate::events::{classify, DomainEvent};
use crate::protocol::{IncomingMessage, JsonRpcError};
use crate::reconciler::ThreadStore;
use crate::{BridgeError, Result};
use futures::{FutureExt, Stream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

const EVENT_BUS_CAPACITY: usize = 1024;
const METHOD_NOT_FOUND: i64 = -32601;

/// Connection lifecycle of one workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Crashed,
}

/// What the bus carries to UI subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BridgeEvent {
    #[serde(rename_all = "camelCase")]
    Domain { workspace_id: String, event: DomainEvent },
    #[serde(rename_all = "camelCase")]
    ConnectionChanged {
        workspace_id: String,
        state: ConnectionState,
    },
}

impl BridgeEvent {
    pub fn workspace_id(&self) -> &str {
        match self {
            BridgeEvent::Domain { workspace_id, .. } | BridgeEvent::ConnectionChanged { workspace_id, .. } => {
                workspace_id
            }
        }
    }
}

struct Workspace {
    path: PathBuf,
    state: ConnectionState,
    /// Bumped on every connect so a stale pump cannot overwrite a newer state
    generation: u64,
    session: Option<Arc<AgentSession>>,
    store: Arc<RwLock<ThreadStore>>,
    arbiter: Arc<RwLock<ApprovalArbiter>>,
    rules: Arc<dyn RuleStore>,
}

/// Registry of tracked workspaces and their connections
pub struct WorkspaceManager {
    config: BridgeConfig,
    workspaces: Arc<RwLock<HashMap<String, Workspace>>>,
    events: broadcast::Sender<BridgeEvent>,
    next_id: AtomicU64,
}

impl WorkspaceManager {
    pub fn new(config: BridgeConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            config,
            workspaces: Arc::new(RwLock::new(HashMap::new())),
            events,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Track a project directory. Nothing is spawned until `connect`.
    pub async fn add_workspace(&self, path: &Path) -> Result<String> {
        if !path.is_dir() {
            return Err(BridgeError::InvalidArgument(format!(
                "workspace path is not a directory: {}",
                path.display()
            )));
        }
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let id = format!("ws-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let workspace = Workspace {
            rules: Arc::new(SettingsRuleStore::for_workspace(&path)),
            path,
            state: ConnectionState::Disconnected,
            generation: 0,
            session: None,
            store: Arc::new(RwLock::new(ThreadStore::new(&self.config))),
            arbiter: Arc::new(RwLock::new(ApprovalArbiter::new())),
        };
        self.workspaces.write().await.insert(id.clone(), workspace);
        info!("[{}] workspace added", id);
        Ok(id)
    }

    /// Forget a workspace, shutting its channel down first.
    pub async fn remove_workspace(&self, workspace_id: &str) -> Result<()> {
        let removed = self.workspaces.write().await.remove(workspace_id);
        let Some(workspace) = removed else {
            return Err(BridgeError::WorkspaceNotFound(workspace_id.to_string()));
        };
        if let Some(session) = workspace.session {
            session.channel().shutdown();
        }
        info!("[{}] workspace removed", workspace_id);
        Ok(())
    }

    /// Replace the rule store of a workspace.
    pub async fn set_rule_store(&self, workspace_id: &str, rules: Arc<dyn RuleStore>) -> Result<()> {
        let mut workspaces = self.workspaces.write().await;
        let workspace = workspaces
            .get_mut(workspace_id)
            .ok_or_else(|| BridgeError::WorkspaceNotFound(workspace_id.to_string()))?;
        workspace.rules = rules;
        Ok(())
    }

    pub async fn workspace_path(&self, workspace_id: &str) -> Option<PathBuf> {
        self.workspaces
            .read()
            .await
            .get(workspace_id)
            .map(|workspace| workspace.path.clone())
    }

    pub async fn workspace_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workspaces.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn state(&self, workspace_id: &str) -> Option<ConnectionState> {
        self.workspaces
            .read()
            .await
            .get(workspace_id)
            .map(|workspace| workspace.state)
    }

    pub async fn session(&self, workspace_id: &str) -> Option<Arc<AgentSession>> {
        self.workspaces
            .read()
            .await
            .get(workspace_id)
            .and_then(|workspace| workspace.session.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Bus as a stream. Lagging subscribers skip what they missed.
    pub fn event_stream(&self) -> impl Stream<Item = BridgeEvent> {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| async move {
            match event {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("event subscriber lagging: {}", e);
                    None
                }
            }
        })
    }

    /// Spawn the agent for a workspace and run the handshake. A previous
    /// connection, if any, is shut down first.
    pub async fn connect(&self, workspace_id: &str) -> Result<Arc<AgentSession>> {
        let path = self
            .workspace_path(workspace_id)
            .await
            .ok_or_else(|| BridgeError::WorkspaceNotFound(workspace_id.to_string()))?;
        let generation = self.begin_connect(workspace_id).await?;
        let transport = match SubprocessTransport::spawn(&self.config, &path) {
            Ok(transport) => transport,
            Err(e) => {
                error!("[{}] spawn failed: {}", workspace_id, e);
                self.set_state(workspace_id, generation, ConnectionState::Disconnected)
                    .await;
                return Err(e);
            }
        };
        self.finish_connect(workspace_id, generation, transport).await
    }

    /// Connect over a transport the caller already has.
    pub async fn attach(&self, workspace_id: &str, transport: SubprocessTransport) -> Result<Arc<AgentSession>> {
        let generation = self.begin_connect(workspace_id).await?;
        self.finish_connect(workspace_id, generation, transport).await
    }

    /// Shut the workspace's channel down. The state ends `Disconnected`.
    pub async fn disconnect(&self, workspace_id: &str) -> Result<()> {
        let (session, generation) = {
            let mut workspaces = self.workspaces.write().await;
            let workspace = workspaces
                .get_mut(workspace_id)
                .ok_or_else(|| BridgeError::WorkspaceNotFound(workspace_id.to_string()))?;
            (workspace.session.take(), workspace.generation)
        };
        self.set_state(workspace_id, generation, ConnectionState::Disconnected)
            .await;
        if let Some(session) = session {
            let rejected = session.channel().shutdown();
            debug!("[{}] disconnect rejected {} pending requests", workspace_id, rejected);
        }
        Ok(())
    }

    async fn begin_connect(&self, workspace_id: &str) -> Result<u64> {
        let (previous, generation) = {
            let mut workspaces = self.workspaces.write().await;
            let workspace = workspaces
                .get_mut(workspace_id)
                .ok_or_else(|| BridgeError::WorkspaceNotFound(workspace_id.to_string()))?;
            workspace.generation += 1;
            (workspace.session.take(), workspace.generation)
        };
        if let Some(previous) = previous {
            previous.channel().shutdown();
            // The old pump is superseded and will not report the close.
            let closed = DomainEvent::ChannelClosed {
                reason: "reconnecting".to_string(),
            };
            let (store, arbiter) = self.shared_state(workspace_id).await?;
            store.write().await.apply(&closed);
            arbiter.write().await.apply(&closed);
            let _ = self.events.send(BridgeEvent::Domain {
                workspace_id: workspace_id.to_string(),
                event: closed,
            });
        }
        self.set_state(workspace_id, generation, ConnectionState::Connecting)
            .await;
        Ok(generation)
    }

    async fn finish_connect(
        &self,
        workspace_id: &str,
        generation: u64,
        transport: SubprocessTransport,
    ) -> Result<Arc<AgentSession>> {
        let (path, store, arbiter, rules) = {
            let workspaces = self.workspaces.read().await;
            let workspace = workspaces
                .get(workspace_id)
                .ok_or_else(|| BridgeError::WorkspaceNotFound(workspace_id.to_string()))?;
            (
                workspace.path.clone(),
                workspace.store.clone(),
                workspace.arbiter.clone(),
                workspace.rules.clone(),
            )
        };

        let channel = Arc::new(SessionChannel::from_transport(transport, &self.config, workspace_id));
        // Take the stream before the handshake so nothing sent right after
        // `initialized` is missed.
        let Some(notifications) = channel.notifications() else {
            return Err(BridgeError::Handshake("notification stream already taken".to_string()));
        };
        if let Err(e) = channel.handshake().await {
            error!("[{}] handshake failed: {}", workspace_id, e);
            self.set_state(workspace_id, generation, ConnectionState::Disconnected)
                .await;
            return Err(e);
        }

        let session = Arc::new(AgentSession::new(
            workspace_id,
            &path,
            channel.clone(),
            store.clone(),
            arbiter.clone(),
            rules,
        ));
        {
            let mut workspaces = self.workspaces.write().await;
            match workspaces.get_mut(workspace_id) {
                Some(workspace) if workspace.generation == generation => {
                    workspace.session = Some(session.clone());
                }
                _ => {
                    // Superseded or removed while handshaking.
                    channel.shutdown();
                    return Err(BridgeError::ChannelClosed);
                }
            }
        }
        self.set_state(workspace_id, generation, ConnectionState::Connected)
            .await;

        let pump = EventPump {
            workspace_id: workspace_id.to_string(),
            generation,
            channel,
            store,
            arbiter,
            events: self.events.clone(),
            workspaces: self.workspaces.clone(),
        };
        tokio::spawn(pump.run(notifications));
        info!("[{}] connected", workspace_id);
        Ok(session)
    }

    async fn shared_state(
        &self,
        workspace_id: &str,
    ) -> Result<(Arc<RwLock<ThreadStore>>, Arc<RwLock<ApprovalArbiter>>)> {
        let workspaces = self.workspaces.read().await;
        let workspace = workspaces
            .get(workspace_id)
            .ok_or_else(|| BridgeError::WorkspaceNotFound(workspace_id.to_string()))?;
        Ok((workspace.store.clone(), workspace.arbiter.clone()))
    }

    async fn set_state(&self, workspace_id: &str, generation: u64, state: ConnectionState) {
        set_state(&self.workspaces, &self.events, workspace_id, generation, state).await;
    }
}

async fn set_state(
    workspaces: &RwLock<HashMap<String, Workspace>>,
    events: &broadcast::Sender<BridgeEvent>,
    workspace_id: &str,
    generation: u64,
    state: ConnectionState,
) {
    {
        let mut workspaces = workspaces.write().await;
        let Some(workspace) = workspaces.get_mut(workspace_id) else {
            return;
        };
        if workspace.generation != generation || workspace.state == state {
            return;
        }
        workspace.state = state;
        if matches!(state, ConnectionState::Crashed | ConnectionState::Disconnected) {
            workspace.session = None;
        }
    }
    let _ = events.send(BridgeEvent::ConnectionChanged {
        workspace_id: workspace_id.to_string(),
        state,
    });
}

/// Drains one channel's notification stream in order.
struct EventPump {
    workspace_id: String,
    generation: u64,
    channel: Arc<SessionChannel>,
    store: Arc<RwLock<ThreadStore>>,
    arbiter: Arc<RwLock<ApprovalArbiter>>,
    events: broadcast::Sender<BridgeEvent>,
    workspaces: Arc<RwLock<HashMap<String, Workspace>>>,
}

impl EventPump {
    async fn run(self, notifications: impl Stream<Item = IncomingMessage>) {
        let mut notifications = Box::pin(notifications);
        let closed = self.channel.closed();
        tokio::pin!(closed);
        loop {
            let message = tokio::select! {
                message = notifications.next() => message,
                _ = &mut closed => None,
            };
            let Some(message) = message else {
                break;
            };
            self.handle(&message).await;
        }

        // Anything still buffered arrived before the close.
        while let Some(Some(message)) = notifications.next().now_or_never() {
            self.handle(&message).await;
        }

        let state = {
            let workspaces = self.workspaces.read().await;
            workspaces
                .get(&self.workspace_id)
                .filter(|workspace| workspace.generation == self.generation)
                .map(|workspace| workspace.state)
        };
        let Some(state) = state else {
            debug!("[{}] superseded connection closed", self.workspace_id);
            return;
        };
        let crashed = state == ConnectionState::Connected;
        let reason = if crashed { "agent process exited" } else { "shutdown" };
        self.publish(DomainEvent::ChannelClosed {
            reason: reason.to_string(),
        })
        .await;
        if crashed {
            warn!("[{}] agent connection lost", self.workspace_id);
            set_state(
                &self.workspaces,
                &self.events,
                &self.workspace_id,
                self.generation,
                ConnectionState::Crashed,
            )
            .await;
        }
    }

    async fn handle(&self, message: &IncomingMessage) {
        let Some(event) = classify(message) else {
            return;
        };
        if let (IncomingMessage::Request { id, method, .. }, DomainEvent::Passthrough { .. }) = (message, &event) {
            debug!("[{}] rejecting unsupported server request {}", self.workspace_id, method);
            let error = JsonRpcError {
                code: METHOD_NOT_FOUND,
                message: format!("unsupported method: {method}"),
                data: None,
            };
            if let Err(e) = self.channel.respond_error(*id, error) {
                warn!("[{}] could not reject {}: {}", self.workspace_id, method, e);
            }
        }
        self.publish(event).await;
    }

    async fn publish(&self, event: DomainEvent) {
        self.store.write().await.apply(&event);
        self.arbiter.write().await.apply(&event);
        let _ = self.events.send(BridgeEvent::Domain {
            workspace_id: self.workspace_id.clone(),
            event,
        });
    }
}
