//! Session: request correlation over one logical peer.
//!
//! A [`Session`] is a cheap-clone handle. Each successful connect spawns one
//! event-loop task that exclusively owns the channel and the pending table;
//! callers reach it through an unbounded command queue and await a oneshot
//! completion. Responses are matched by sequence id, never by order.
//!
//! State machine:
//! ```text
//! Disconnected --ensure_ready--> Connecting --version ok--> Ready
//!      ^                              |                       |
//!      +-------- failure -------------+---- channel closed ---+
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::bridge::channel::{Channel, ChannelFactory};
use crate::bridge::protocol::{GET_VERSION, Request, SequenceId};
use crate::config::SessionConfig;
use crate::error::{Result, RpcError};
use crate::handshake::{HandshakeFuture, check_version, parse_version};
use crate::pending::{Completion, PendingTable, ProgressSink};
use crate::router::{ReverseCallHandler, ReverseCallRegistry, Router};

/// Identifies a session in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
}

enum Phase {
    Disconnected,
    Connecting {
        epoch: u64,
        handshake: HandshakeFuture,
        cancel: CancellationToken,
    },
    Ready {
        epoch: u64,
        version: u32,
        connection: Connection,
    },
}

impl Phase {
    fn state(&self) -> SessionState {
        match self {
            Phase::Disconnected => SessionState::Disconnected,
            Phase::Connecting { .. } => SessionState::Connecting,
            Phase::Ready { .. } => SessionState::Ready,
        }
    }
}

struct Invocation {
    sequence: SequenceId,
    action: String,
    params: Value,
    timeout: Duration,
    progress: Option<ProgressSink>,
    completion: Completion,
}

enum Command {
    Invoke(Invocation),
    /// Stop the loop; the sender is acked once every entry is rejected.
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running event loop. Dropping every clone stops the loop.
#[derive(Clone)]
struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    pending: Arc<AtomicUsize>,
}

impl Connection {
    async fn invoke(
        &self,
        sequence: SequenceId,
        action: &str,
        params: Value,
        timeout: Duration,
        progress: Option<ProgressSink>,
    ) -> Result<Value> {
        let (completion, settled) = oneshot::channel();
        let invocation = Invocation {
            sequence,
            action: action.to_string(),
            params,
            timeout,
            progress,
            completion,
        };
        self.commands
            .send(Command::Invoke(invocation))
            .map_err(|_| RpcError::Disconnected)?;
        settled.await.unwrap_or(Err(RpcError::Disconnected))
    }

    async fn shutdown(self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack)).is_ok() {
            // Err means the loop already exited on its own.
            let _ = done.await;
        }
    }
}

struct Shared {
    id: SessionId,
    config: SessionConfig,
    factory: Arc<dyn ChannelFactory>,
    reverse: ReverseCallRegistry,
    next_sequence: AtomicU64,
    next_epoch: AtomicU64,
    phase: Mutex<Phase>,
}

impl Shared {
    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(|poisoned| {
            tracing::error!(session = %self.id, "Session state mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn next_sequence(&self) -> SequenceId {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// One connection attempt. Runs on its own task behind a [`HandshakeFuture`].
    /// Cancelling `cancel` tears the attempt down at whatever step it is in.
    async fn connect(self: Arc<Self>, epoch: u64, cancel: CancellationToken) -> Result<u32> {
        let peer = self.config.peer.as_str();
        tracing::info!(session = %self.id, %peer, epoch, "Connecting");

        let opened = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!(session = %self.id, epoch, "Connect attempt cancelled before open");
                return Err(RpcError::Disconnected);
            }
            opened = self.factory.open(peer) => opened,
        };
        let channel = match opened {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(session = %self.id, %peer, error = %e, "Failed to open channel");
                self.abandon(epoch);
                return Err(RpcError::Disconnected);
            }
        };

        let connection = self.start(epoch, channel);
        let negotiated = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!(session = %self.id, epoch, "Connect attempt cancelled during handshake");
                connection.shutdown().await;
                return Err(RpcError::Disconnected);
            }
            negotiated = self.negotiate(&connection) => negotiated,
        };
        match negotiated {
            Ok(version) => self.promote(epoch, version, connection).await,
            Err(e) => {
                tracing::warn!(session = %self.id, %peer, error = %e, "Handshake failed");
                self.abandon(epoch);
                connection.shutdown().await;
                Err(e)
            }
        }
    }

    fn start(self: &Arc<Self>, epoch: u64, channel: Channel) -> Connection {
        let (commands, queue) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let event_loop = EventLoop {
            session: Arc::downgrade(self),
            session_id: self.id,
            epoch,
            router: Router::new(self.reverse.clone(), channel.sender()),
            channel,
            commands: queue,
            table: PendingTable::new(),
            pending: Arc::clone(&pending),
        };
        tokio::spawn(event_loop.run());
        Connection { commands, pending }
    }

    async fn negotiate(&self, connection: &Connection) -> Result<u32> {
        let sequence = self.next_sequence();
        let data = connection
            .invoke(
                sequence,
                GET_VERSION,
                Value::Object(Default::default()),
                self.config.handshake_timeout,
                None,
            )
            .await?;
        let reported = parse_version(data)?;
        check_version(reported, self.config.supported_version)
    }

    async fn promote(&self, epoch: u64, version: u32, connection: Connection) -> Result<u32> {
        let superseded = {
            let mut phase = self.lock_phase();
            if matches!(&*phase, Phase::Connecting { epoch: current, .. } if *current == epoch) {
                *phase = Phase::Ready {
                    epoch,
                    version,
                    connection,
                };
                None
            } else {
                Some(connection)
            }
        };

        match superseded {
            None => {
                tracing::info!(session = %self.id, peer = %self.config.peer, version, "Session ready");
                Ok(version)
            }
            Some(connection) => {
                // Disconnected while the handshake was in flight.
                tracing::debug!(session = %self.id, epoch, "Connect attempt superseded");
                connection.shutdown().await;
                Err(RpcError::Disconnected)
            }
        }
    }

    /// Back to Disconnected, but only if this attempt still owns the state.
    fn abandon(&self, epoch: u64) {
        let mut phase = self.lock_phase();
        if matches!(&*phase, Phase::Connecting { epoch: current, .. } if *current == epoch) {
            *phase = Phase::Disconnected;
        }
    }

    fn connection_closed(&self, epoch: u64) {
        let mut phase = self.lock_phase();
        if matches!(&*phase, Phase::Ready { epoch: current, .. } if *current == epoch) {
            *phase = Phase::Disconnected;
            tracing::info!(session = %self.id, peer = %self.config.peer, "Session disconnected");
        }
    }
}

/// Correlated request/response over one peer, with version handshake,
/// progress streaming and reverse calls.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    pub fn new(config: SessionConfig, factory: Arc<dyn ChannelFactory>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: SessionId::new(),
                config,
                factory,
                reverse: ReverseCallRegistry::new(),
                next_sequence: AtomicU64::new(0),
                next_epoch: AtomicU64::new(0),
                phase: Mutex::new(Phase::Disconnected),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Handlers apply to the current connection and every later one.
    pub fn register_reverse_handler(
        &self,
        method: impl Into<String>,
        handler: Arc<dyn ReverseCallHandler>,
    ) {
        self.shared.reverse.register(method, handler);
    }

    pub fn reverse_handlers(&self) -> &ReverseCallRegistry {
        &self.shared.reverse
    }

    /// Connect and negotiate the protocol version unless already ready.
    ///
    /// Concurrent callers share a single attempt: one channel is opened and
    /// one `get_version` is sent no matter how many callers are waiting.
    /// A failed attempt leaves the session disconnected; the next call starts
    /// a fresh one.
    pub async fn ensure_ready(&self) -> Result<()> {
        let handshake = {
            let mut phase = self.shared.lock_phase();
            match &*phase {
                Phase::Ready { .. } => return Ok(()),
                Phase::Connecting { handshake, .. } => handshake.clone(),
                Phase::Disconnected => {
                    let epoch = self.shared.next_epoch.fetch_add(1, Ordering::Relaxed);
                    let cancel = CancellationToken::new();
                    let handshake = HandshakeFuture::spawn(
                        Arc::clone(&self.shared).connect(epoch, cancel.clone()),
                    );
                    *phase = Phase::Connecting {
                        epoch,
                        handshake: handshake.clone(),
                        cancel,
                    };
                    handshake
                }
            }
        };
        handshake.await.map(|_| ())
    }

    /// Send `action` and await its terminal response.
    ///
    /// Fails immediately with [`RpcError::Disconnected`] unless the session is
    /// ready. `timeout` falls back to the configured default.
    pub async fn invoke(
        &self,
        action: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.dispatch(action, params, timeout, None).await
    }

    /// Like [`Session::invoke`], forwarding every progress message's `args`
    /// to `sink` until the request settles.
    pub async fn invoke_with_progress(
        &self,
        action: &str,
        params: Value,
        timeout: Option<Duration>,
        sink: ProgressSink,
    ) -> Result<Value> {
        self.dispatch(action, params, timeout, Some(sink)).await
    }

    async fn dispatch(
        &self,
        action: &str,
        params: Value,
        timeout: Option<Duration>,
        progress: Option<ProgressSink>,
    ) -> Result<Value> {
        let connection = match &*self.shared.lock_phase() {
            Phase::Ready { connection, .. } => connection.clone(),
            _ => return Err(RpcError::Disconnected),
        };
        let sequence = self.shared.next_sequence();
        let timeout = timeout.unwrap_or(self.shared.config.default_timeout);
        tracing::debug!(session = %self.shared.id, sequence, %action, "Invoking");
        connection
            .invoke(sequence, action, params, timeout, progress)
            .await
    }

    /// Tear down the current connection. Every pending request is rejected
    /// with [`RpcError::Disconnected`] before this returns. An attempt still
    /// in its handshake is cancelled and its channel closed.
    pub async fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.shared.lock_phase(), Phase::Disconnected);
        match previous {
            Phase::Ready { connection, .. } => {
                tracing::info!(session = %self.shared.id, peer = %self.shared.config.peer, "Disconnecting");
                connection.shutdown().await;
            }
            Phase::Connecting {
                epoch,
                handshake,
                cancel,
            } => {
                tracing::debug!(session = %self.shared.id, epoch, "Disconnect during handshake");
                cancel.cancel();
                // Settles once the attempt has shut its channel down.
                let _ = handshake.await;
            }
            Phase::Disconnected => {}
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock_phase().state()
    }

    /// Version negotiated by the current connection.
    pub fn remote_version(&self) -> Option<u32> {
        match &*self.shared.lock_phase() {
            Phase::Ready { version, .. } => Some(*version),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Whether any request is awaiting its response.
    pub fn is_active(&self) -> bool {
        self.pending_count() > 0
    }

    pub fn pending_count(&self) -> usize {
        match &*self.shared.lock_phase() {
            Phase::Ready { connection, .. } => connection.pending.load(Ordering::Relaxed),
            _ => 0,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.config.peer)
            .field("state", &self.state())
            .finish()
    }
}

struct EventLoop {
    session: Weak<Shared>,
    session_id: SessionId,
    epoch: u64,
    channel: Channel,
    router: Router,
    commands: mpsc::UnboundedReceiver<Command>,
    table: PendingTable,
    pending: Arc<AtomicUsize>,
}

impl EventLoop {
    async fn run(mut self) {
        tracing::debug!(session = %self.session_id, epoch = self.epoch, "Event loop started");
        let mut ack = None;

        loop {
            self.pending.store(self.table.len(), Ordering::Relaxed);

            tokio::select! {
                biased;

                inbound = self.channel.recv() => match inbound {
                    Some(value) => self.router.route(value, &mut self.table),
                    None => {
                        tracing::info!(session = %self.session_id, peer = %self.channel.peer(), "Channel closed by peer");
                        break;
                    }
                },

                command = self.commands.recv() => match command {
                    Some(Command::Invoke(invocation)) => self.submit(invocation),
                    Some(Command::Shutdown(done)) => {
                        ack = Some(done);
                        break;
                    }
                    None => {
                        tracing::debug!(session = %self.session_id, "All handles dropped");
                        break;
                    }
                },

                Some(sequence) = self.table.expired(), if !self.table.is_empty() => {
                    tracing::trace!(session = %self.session_id, sequence, "Deadline reached");
                }
            }
        }

        self.teardown(ack);
    }

    fn submit(&mut self, invocation: Invocation) {
        let Invocation {
            sequence,
            action,
            params,
            timeout,
            progress,
            completion,
        } = invocation;

        let request = Request {
            action: action.clone(),
            params,
            sequence,
        };
        self.table.insert(sequence, action, timeout, completion, progress);
        if let Err(e) = self.channel.send(request) {
            self.table.resolve(sequence, Err(e));
        }
    }

    fn teardown(mut self, ack: Option<oneshot::Sender<()>>) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Invoke(invocation) => {
                    let _ = invocation.completion.send(Err(RpcError::Disconnected));
                }
                Command::Shutdown(done) => {
                    let _ = done.send(());
                }
            }
        }

        let rejected = self.table.reject_all(RpcError::Disconnected);
        self.pending.store(0, Ordering::Relaxed);
        self.channel.close();
        tracing::debug!(session = %self.session_id, epoch = self.epoch, rejected, "Event loop stopped");

        if let Some(shared) = self.session.upgrade() {
            shared.connection_closed(self.epoch);
        }
        if let Some(done) = ack {
            let _ = done.send(());
        }
    }
}
