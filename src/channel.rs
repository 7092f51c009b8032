//! Session channel for one agent app-server subprocess
//!
//! Owns the subprocess and its stdio, enforces the `initialize` /
//! `initialized` handshake before any other traffic, correlates responses
//! through the pending-request router, and publishes notifications and
//! server requests on a single ordered stream.

use crate::config::BridgeConfig;
use crate::protocol::{self, methods, IncomingMessage, JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::router::PendingRequests;
use crate::{BridgeError, Result};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

/// Lifecycle of a channel. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Spawned,
    Handshaking,
    Ready,
    Closed,
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Raw stdio of an agent process: where lines come from and go to.
///
/// `spawn` launches the real agent; `from_io` wraps any pair of byte streams,
/// which is how tests stand in a scripted agent.
pub struct SubprocessTransport {
    reader: BoxedReader,
    writer: BoxedWriter,
    child: Option<Child>,
    stderr: Option<ChildStderr>,
}

impl SubprocessTransport {
    /// Launch the configured agent with `workspace_path` as working directory.
    pub fn spawn(config: &BridgeConfig, workspace_path: &Path) -> Result<Self> {
        if !workspace_path.is_dir() {
            return Err(BridgeError::Spawn(format!(
                "workspace path is not a directory: {}",
                workspace_path.display()
            )));
        }

        info!(
            "Starting {} {:?} in {}",
            config.agent_bin,
            config.agent_args,
            workspace_path.display()
        );

        let mut child = Command::new(&config.agent_bin)
            .args(&config.agent_args)
            .current_dir(workspace_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::Spawn(format!("{}: {}", config.agent_bin, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Spawn("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Spawn("Failed to get stdout".to_string()))?;
        let stderr = child.stderr.take();

        info!("Agent started with pid {:?}", child.id());
        Ok(Self {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
            stderr,
        })
    }

    /// Wrap an arbitrary reader/writer pair with no process behind it.
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
            stderr: None,
        }
    }
}

/// State shared between the channel handle and its background tasks
struct ChannelShared {
    label: String,
    state: watch::Sender<ChannelState>,
    pending: PendingRequests,
}

impl ChannelShared {
    /// Move to `Closed` and fail everything still waiting. Idempotent.
    fn close(&self, reason: &str) -> usize {
        let previous = self.state.send_replace(ChannelState::Closed);
        let rejected = self.pending.reject_all(|| BridgeError::ChannelClosed);
        if previous != ChannelState::Closed {
            info!("[{}] channel closed: {}", self.label, reason);
        }
        rejected
    }

    fn current(&self) -> ChannelState {
        *self.state.borrow()
    }
}

/// One live connection to an agent subprocess
pub struct SessionChannel {
    shared: Arc<ChannelShared>,
    next_id: AtomicU64,
    outbound: mpsc::UnboundedSender<String>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<IncomingMessage>>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    client_name: String,
    client_version: String,
    handshake_timeout: Duration,
    request_timeout: Option<Duration>,
}

impl SessionChannel {
    /// Spawn the agent for `workspace_path` and wire up its stdio.
    /// The channel starts in `Spawned`; call [`handshake`](Self::handshake)
    /// before anything else.
    pub async fn start(workspace_path: &Path, config: &BridgeConfig) -> Result<Self> {
        let transport = SubprocessTransport::spawn(config, workspace_path)?;
        Ok(Self::from_transport(
            transport,
            config,
            &workspace_path.display().to_string(),
        ))
    }

    /// Build a channel over an existing transport. Must run inside a tokio
    /// runtime: the reader, writer and process-supervision tasks start here.
    pub fn from_transport(transport: SubprocessTransport, config: &BridgeConfig, label: &str) -> Self {
        let SubprocessTransport {
            reader,
            mut writer,
            child,
            stderr,
        } = transport;

        let (state_tx, _) = watch::channel(ChannelState::Spawned);
        let shared = Arc::new(ChannelShared {
            label: label.to_string(),
            state: state_tx,
            pending: PendingRequests::new(),
        });

        // Reader: responses go to the router, everything else is published in
        // arrival order.
        let (notify_tx, notify_rx) = mpsc::unbounded_channel::<IncomingMessage>();
        let reader_shared = shared.clone();
        tokio::spawn(async move {
            let mut messages = Box::pin(protocol::decode_stream(BufReader::new(reader)));
            while let Some(message) = messages.next().await {
                match message {
                    IncomingMessage::Response { id, outcome } => {
                        reader_shared.pending.resolve(id, outcome);
                    }
                    other => {
                        // Nobody listening is not a reason to stop draining stdout.
                        let _ = notify_tx.send(other);
                    }
                }
            }
            reader_shared.close("agent stdout closed");
        });

        // Writer: the single writer to stdin.
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let writer_shared = shared.clone();
        tokio::spawn(async move {
            while let Some(line) = outbound_rx.recv().await {
                let written = async {
                    writer.write_all(line.as_bytes()).await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = written {
                    warn!("[{}] write to agent failed: {}", writer_shared.label, e);
                    writer_shared.close("agent stdin closed");
                    break;
                }
            }
        });

        if let Some(stderr) = stderr {
            let label = shared.label.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        debug!("[{}] agent stderr: {}", label, line);
                    }
                }
            });
        }

        // Process supervision: exit is detected here, and shutdown kills.
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        if let Some(mut child) = child {
            let child_shared = shared.clone();
            tokio::spawn(async move {
                tokio::select! {
                    status = child.wait() => {
                        let reason = match status {
                            Ok(status) => format!("agent exited with {status}"),
                            Err(e) => format!("agent wait failed: {e}"),
                        };
                        child_shared.close(&reason);
                    }
                    _ = kill_rx => {
                        if let Err(e) = child.kill().await {
                            warn!("[{}] failed to kill agent: {}", child_shared.label, e);
                        }
                        child_shared.close("shutdown");
                    }
                }
            });
        }

        Self {
            shared,
            next_id: AtomicU64::new(1),
            outbound: outbound_tx,
            notifications: Mutex::new(Some(notify_rx)),
            kill_tx: Mutex::new(Some(kill_tx)),
            client_name: config.client_name.clone(),
            client_version: config.client_version.clone(),
            handshake_timeout: config.handshake_timeout,
            request_timeout: config.request_timeout,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.shared.current()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ChannelState::Ready
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Resolves once the channel is closed, for whatever reason.
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|state| *state == ChannelState::Closed).await;
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    /// Take the ordered stream of notifications and server requests.
    /// There is exactly one consumer; later calls return `None`.
    pub fn notifications(&self) -> Option<impl Stream<Item = IncomingMessage>> {
        self.notifications
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .map(UnboundedReceiverStream::new)
    }

    /// Run the handshake: `initialize`, wait for its result, then the
    /// `initialized` notification. Any failure shuts the channel down.
    pub async fn handshake(&self) -> Result<Value> {
        match self.state() {
            ChannelState::Spawned => {}
            ChannelState::Closed => return Err(BridgeError::ChannelClosed),
            other => {
                return Err(BridgeError::Handshake(format!(
                    "handshake already attempted (state {other:?})"
                )))
            }
        }
        self.shared.state.send_replace(ChannelState::Handshaking);

        let params = protocol::initialize_params(&self.client_name, &self.client_version);
        let (id, handle) = self.dispatch_request(methods::INITIALIZE, params)?;
        let result = match timeout(self.handshake_timeout, handle.wait()).await {
            Ok(Ok(result)) => result,
            Ok(Err(BridgeError::ChannelClosed)) => {
                self.shutdown();
                return Err(BridgeError::Handshake(
                    "agent exited before answering initialize".to_string(),
                ))
            }
            Ok(Err(e)) => {
                self.shutdown();
                return Err(BridgeError::Handshake(e.to_string()));
            }
            Err(_) => {
                self.shared.pending.reject(
                    id,
                    BridgeError::Timeout {
                        method: methods::INITIALIZE.to_string(),
                    },
                );
                self.shutdown();
                return Err(BridgeError::Handshake(format!(
                    "no response to initialize within {}s",
                    self.handshake_timeout.as_secs()
                )));
            }
        };

        self.write(&JsonRpcRequest::notification(methods::INITIALIZED, None))?;
        // A close that raced the handshake must win.
        let promoted = self.shared.state.send_if_modified(|state| {
            if *state == ChannelState::Handshaking {
                *state = ChannelState::Ready;
                true
            } else {
                false
            }
        });
        if !promoted {
            self.shutdown();
            return Err(BridgeError::Handshake(
                "channel closed during handshake".to_string(),
            ));
        }
        info!("[{}] handshake complete", self.shared.label);
        Ok(result)
    }

    /// Send a request and wait for its result.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        self.ensure_ready(method)?;
        let (id, handle) = self.dispatch_request(method, params)?;
        match self.request_timeout {
            None => handle.wait().await,
            Some(limit) => match timeout(limit, handle.wait()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let error = || BridgeError::Timeout {
                        method: method.to_string(),
                    };
                    self.shared.pending.reject(id, error());
                    Err(error())
                }
            },
        }
    }

    /// Send a notification (no response expected).
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.ensure_ready(method)?;
        self.write(&JsonRpcRequest::notification(method, params))
    }

    /// Answer a server-initiated request on its id.
    pub fn respond(&self, id: u64, result: Value) -> Result<()> {
        self.ensure_ready("response")?;
        self.write(&JsonRpcResponse::result(id, result))
    }

    /// Answer a server-initiated request with an error.
    pub fn respond_error(&self, id: u64, error: JsonRpcError) -> Result<()> {
        self.ensure_ready("response")?;
        self.write(&JsonRpcResponse::error(id, error))
    }

    /// Kill the agent, reject everything pending with `ChannelClosed` and
    /// mark the channel closed. Returns how many requests were rejected.
    pub fn shutdown(&self) -> usize {
        if let Some(kill_tx) = self
            .kill_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            let _ = kill_tx.send(());
        }
        self.shared.close("shutdown")
    }

    fn ensure_ready(&self, method: &str) -> Result<()> {
        match self.state() {
            ChannelState::Ready => Ok(()),
            ChannelState::Closed => Err(BridgeError::ChannelClosed),
            ChannelState::Spawned | ChannelState::Handshaking => {
                warn!("[{}] {} attempted before handshake", self.shared.label, method);
                Err(BridgeError::NotReady {
                    method: method.to_string(),
                })
            }
        }
    }

    fn dispatch_request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(u64, crate::router::PendingHandle)> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = self.shared.pending.register(id, method)?;
        if let Err(e) = self.write(&JsonRpcRequest::request(id, method, params)) {
            self.shared.pending.reject(id, BridgeError::ChannelClosed);
            return Err(e);
        }
        debug!("[{}] -> {} (id {})", self.shared.label, method, id);
        Ok((id, handle))
    }

    fn write<T: serde::Serialize>(&self, message: &T) -> Result<()> {
        let line = protocol::encode(message)?;
        self.outbound
            .send(line)
            .map_err(|_| BridgeError::ChannelClosed)
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, DuplexStream};

    /// Channel wired to in-memory pipes; returns the agent's ends.
    fn mock_channel() -> (SessionChannel, BufReader<DuplexStream>, DuplexStream) {
        let (client_out, agent_in) = duplex(64 * 1024);
        let (agent_out, client_in) = duplex(64 * 1024);
        let channel = SessionChannel::from_transport(
            SubprocessTransport::from_io(client_in, client_out),
            &BridgeConfig::default(),
            "test",
        );
        (channel, BufReader::new(agent_in), agent_out)
    }

    async fn read_json(reader: &mut BufReader<DuplexStream>) -> Value {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_send_before_handshake_is_not_ready() {
        let (channel, _agent_in, _agent_out) = mock_channel();
        assert_eq!(channel.state(), ChannelState::Spawned);
        let err = channel.send("thread/list", json!({})).await.unwrap_err();
        assert!(matches!(err, BridgeError::NotReady { .. }));
        assert!(matches!(
            channel.notify("initialized", None),
            Err(BridgeError::NotReady { .. })
        ));
    }

    #[tokio::test]
    async fn test_handshake_order() {
        let (channel, mut agent_in, mut agent_out) = mock_channel();
        let agent = tokio::spawn(async move {
            let init = read_json(&mut agent_in).await;
            assert_eq!(init["method"], "initialize");
            let reply = format!("{{\"id\":{},\"result\":{{\"userAgent\":\"mock\"}}}}\n", init["id"]);
            agent_out.write_all(reply.as_bytes()).await.unwrap();
            let initialized = read_json(&mut agent_in).await;
            assert_eq!(initialized["method"], "initialized");
            assert!(initialized.get("id").is_none());
            (agent_in, agent_out)
        });
        let result = channel.handshake().await.unwrap();
        assert_eq!(result["userAgent"], "mock");
        assert!(channel.is_ready());
        let _pipes = agent.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_rejects_pending_and_closes() {
        let (channel, mut agent_in, mut agent_out) = mock_channel();
        let agent = tokio::spawn(async move {
            let init = read_json(&mut agent_in).await;
            let reply = format!("{{\"id\":{},\"result\":{{}}}}\n", init["id"]);
            agent_out.write_all(reply.as_bytes()).await.unwrap();
            (agent_in, agent_out)
        });
        channel.handshake().await.unwrap();
        let _pipes = agent.await.unwrap();

        let channel = Arc::new(channel);
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let channel = channel.clone();
                tokio::spawn(async move { channel.send("turn/start", json!({})).await })
            })
            .collect();
        while channel.pending_requests() < 3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(channel.shutdown(), 3);
        for waiter in waiters {
            assert!(matches!(waiter.await.unwrap(), Err(BridgeError::ChannelClosed)));
        }
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(matches!(
            channel.send("thread/list", json!({})).await,
            Err(BridgeError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_agent_exit_during_handshake_shuts_down() {
        let (channel, mut agent_in, agent_out) = mock_channel();
        let agent = tokio::spawn(async move {
            let init = read_json(&mut agent_in).await;
            assert_eq!(init["method"], "initialize");
            // Stdout closes without an answer.
            drop(agent_out);
            agent_in
        });
        let err = channel.handshake().await.unwrap_err();
        assert!(matches!(err, BridgeError::Handshake(_)));
        let _agent_in = agent.await.unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(channel.kill_tx.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (client_out, _agent_in) = duplex(1024);
        let (_agent_out, client_in) = duplex(1024);
        let config = BridgeConfig::default().with_handshake_timeout(Duration::from_millis(20));
        let channel = SessionChannel::from_transport(
            SubprocessTransport::from_io(client_in, client_out),
            &config,
            "slow",
        );
        let err = channel.handshake().await.unwrap_err();
        assert!(matches!(err, BridgeError::Handshake(_)));
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(channel.pending_requests(), 0);
    }
}
