use std::sync::{
    Arc, OnceLock, Weak,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    common::{Error, Result, types::{GuildId, SessionId, UserId}},
    config::NodeOptions,
    events::{ClientEvent, EventSink, emit},
    protocol::{
        IncomingMessage, NodeEvent, PlayerInfo, PlayerState, PlayerUpdate, SessionUpdate, Stats,
    },
    rest::RestClient,
};

mod backoff;
mod socket;

use socket::SessionOutcome;

/// WebSocket lifecycle of a node session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    Dialing,
    OpenAwaitingReady,
    Ready,
    Closed,
    ReconnectPending,
    Destroyed,
}

/// Narrow interface the manager exposes to its nodes: frame routing and
/// disconnect notification, nothing else.
#[async_trait]
pub(crate) trait NodeObserver: Send + Sync {
    async fn player_update(&self, node: &Arc<Node>, guild_id: GuildId, state: PlayerState);
    async fn player_event(&self, node: &Arc<Node>, event: NodeEvent);
    /// Called on every connection loss; `permanent` when the node will not
    /// come back on its own.
    fn node_disconnected(&self, node: &Arc<Node>, permanent: bool);
}

/// One audio node: an authenticated WebSocket session, a REST client and a
/// health snapshot. Nodes keep dialing until destroyed.
pub struct Node {
    options: NodeOptions,
    rest: RestClient,
    user_id: Arc<OnceLock<UserId>>,

    state: RwLock<NodeState>,
    session_id: RwLock<Option<SessionId>>,
    stats: RwLock<Option<Stats>>,
    reconnect_attempt: AtomicU32,

    wants_connected: AtomicBool,
    destroyed: AtomicBool,
    dial_notify: tokio::sync::Notify,
    session_cancel: Mutex<Option<CancellationToken>>,

    /// Guilds of the players currently bound here. Ids only; the manager
    /// owns the players themselves.
    players: DashMap<GuildId, ()>,

    observer: RwLock<Option<Weak<dyn NodeObserver>>>,
    events: EventSink,
}

impl Node {
    pub(crate) fn new(
        options: NodeOptions,
        user_id: Arc<OnceLock<UserId>>,
        events: EventSink,
    ) -> Result<Self> {
        options.validate()?;
        let rest = RestClient::new(&options)?;
        Ok(Self {
            options,
            rest,
            user_id,
            state: RwLock::new(NodeState::Idle),
            session_id: RwLock::new(None),
            stats: RwLock::new(None),
            reconnect_attempt: AtomicU32::new(0),
            wants_connected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            dial_notify: tokio::sync::Notify::new(),
            session_cancel: Mutex::new(None),
            players: DashMap::new(),
            observer: RwLock::new(None),
            events,
        })
    }

    pub(crate) fn set_observer(&self, observer: Weak<dyn NodeObserver>) {
        *self.observer.write() = Some(observer);
    }

    /// Spawn the session loop. Called once, right after construction.
    pub(crate) fn start(self: &Arc<Self>) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            session_loop(node).await;
        });
    }

    // ------------------------------------------------------------------
    // Public surface
    // ------------------------------------------------------------------

    pub fn identifier(&self) -> &str {
        &self.options.identifier
    }

    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    /// True only while the session is `Ready`.
    pub fn connected(&self) -> bool {
        self.state() == NodeState::Ready
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id.read().clone()
    }

    pub fn stats(&self) -> Option<Stats> {
        self.stats.read().clone()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt.load(Ordering::Relaxed)
    }

    /// Direct REST access for endpoints that need no session (loadtracks,
    /// decode, info, stats, version).
    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    /// Health score for routing: lower is better, infinite while not ready.
    ///
    /// `players + round(1.05^(100·load/cores)·10 − 10) + round(mem/1MiB)
    ///  + deficit/3000 + 2·nulled/3000`
    pub fn penalties(&self) -> f64 {
        if !self.connected() {
            return f64::INFINITY;
        }
        let Some(stats) = self.stats.read().clone() else {
            // Ready but no stats yet: treat as unloaded.
            return 0.0;
        };

        let cores = stats.cpu.cores.max(1) as f64;
        let cpu = (1.05f64.powf(100.0 * stats.cpu.system_load / cores) * 10.0 - 10.0).round();
        let memory = (stats.memory.used as f64 / 1_048_576.0).round();
        let frames = stats
            .frame_stats
            .as_ref()
            .map(|f| f.deficit as f64 / 3_000.0 + 2.0 * f.nulled as f64 / 3_000.0)
            .unwrap_or(0.0);

        stats.players as f64 + cpu + memory + frames
    }

    /// Ask the session loop to (re)establish the connection. A no-op until
    /// the bot user id is known.
    pub fn connect(&self) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        self.wants_connected.store(true, Ordering::SeqCst);
        self.dial_notify.notify_one();
    }

    /// Caller-initiated disconnect: stop reconnecting, close the socket and
    /// forget the session unless a resume key keeps it claimable.
    pub fn disconnect(&self) {
        self.wants_connected.store(false, Ordering::SeqCst);
        if let Some(cancel) = self.session_cancel.lock().as_ref() {
            cancel.cancel();
        }
        self.purge_session_unless_resumable();
        self.dial_notify.notify_one();
    }

    /// Disconnect and disable this node for the rest of its life.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[{}] Node destroyed", self.identifier());
        self.wants_connected.store(false, Ordering::SeqCst);
        if let Some(cancel) = self.session_cancel.lock().as_ref() {
            cancel.cancel();
        }
        *self.state.write() = NodeState::Destroyed;
        self.players.clear();
        self.dial_notify.notify_one();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Session-scoped REST, with invalidation on 404
    // ------------------------------------------------------------------

    pub async fn update_player(
        &self,
        guild_id: &GuildId,
        update: &PlayerUpdate,
        no_replace: bool,
    ) -> Result<PlayerInfo> {
        let session_id = self.require_session()?;
        self.check_session(
            self.rest
                .update_player(&session_id, guild_id, update, no_replace)
                .await,
        )
    }

    pub async fn destroy_player(&self, guild_id: &GuildId) -> Result<()> {
        let session_id = self.require_session()?;
        self.check_session(self.rest.destroy_player(&session_id, guild_id).await)
    }

    pub async fn get_player(&self, guild_id: &GuildId) -> Result<PlayerInfo> {
        let session_id = self.require_session()?;
        self.check_session(self.rest.get_player(&session_id, guild_id).await)
    }

    pub async fn get_players(&self) -> Result<Vec<PlayerInfo>> {
        let session_id = self.require_session()?;
        self.check_session(self.rest.get_players(&session_id).await)
    }

    fn require_session(&self) -> Result<SessionId> {
        self.session_id()
            .ok_or_else(|| Error::NoSession(self.identifier().to_string()))
    }

    fn check_session<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(Error::SessionInvalid(_)) = &result {
            warn!("[{}] Session invalidated by the node", self.identifier());
            self.invalidate_session();
        }
        result
    }

    /// Drop the cached session and bounce the socket so the loop
    /// renegotiates a fresh one.
    fn invalidate_session(&self) {
        *self.session_id.write() = None;
        if let Some(cancel) = self.session_cancel.lock().as_ref() {
            cancel.cancel();
        }
        self.dial_notify.notify_one();
    }

    // ------------------------------------------------------------------
    // Player binding (ids only; ownership lives in the manager)
    // ------------------------------------------------------------------

    pub(crate) fn bind_player(&self, guild_id: GuildId) {
        self.players.insert(guild_id, ());
    }

    pub(crate) fn unbind_player(&self, guild_id: &GuildId) {
        self.players.remove(guild_id);
    }

    pub(crate) fn bound_guilds(&self) -> Vec<GuildId> {
        self.players.iter().map(|e| e.key().clone()).collect()
    }

    // ------------------------------------------------------------------
    // Frame handling (called from the socket read loop, in order)
    // ------------------------------------------------------------------

    pub(super) fn user_id(&self) -> Option<UserId> {
        self.user_id.get().copied()
    }

    pub(super) fn set_state(&self, state: NodeState) {
        *self.state.write() = state;
    }

    pub(super) fn emit_connect(&self) {
        emit(
            &self.events,
            ClientEvent::NodeConnect {
                node: self.identifier().to_string(),
            },
        );
    }

    pub(super) async fn handle_frame(self: Arc<Self>, text: &str) {
        let message = match serde_json::from_str::<IncomingMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                let op = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|v| v.get("op").and_then(|op| op.as_str().map(String::from)))
                    .unwrap_or_else(|| "<none>".to_string());
                debug!(
                    "[{}] Ignoring frame with op '{}': {}",
                    self.identifier(),
                    op,
                    e
                );
                emit(
                    &self.events,
                    ClientEvent::Debug {
                        message: format!(
                            "node `{}` sent an unhandled frame (op '{}')",
                            self.identifier(),
                            op
                        ),
                    },
                );
                return;
            }
        };

        match message {
            IncomingMessage::Ready { resumed, session_id } => {
                self.handle_ready(resumed, session_id).await;
            }
            IncomingMessage::Stats { stats } => {
                *self.stats.write() = Some(stats.clone());
                emit(
                    &self.events,
                    ClientEvent::NodeStats {
                        node: self.identifier().to_string(),
                        stats,
                    },
                );
            }
            IncomingMessage::PlayerUpdate { guild_id, state } => {
                if let Some(observer) = self.observer() {
                    observer.player_update(&self, guild_id, state).await;
                }
            }
            IncomingMessage::Event { event } => {
                if let Some(observer) = self.observer() {
                    observer.player_event(&self, event).await;
                }
            }
        }
    }

    async fn handle_ready(&self, resumed: bool, session_id: SessionId) {
        info!(
            "[{}] Ready (resumed={}, session={})",
            self.identifier(),
            resumed,
            session_id
        );
        *self.session_id.write() = Some(session_id.clone());
        self.set_state(NodeState::Ready);
        self.reconnect_attempt.store(0, Ordering::Relaxed);

        emit(
            &self.events,
            ClientEvent::NodeReady {
                node: self.identifier().to_string(),
                resumed,
                session_id: session_id.clone(),
            },
        );

        // A fresh session with a resume policy must opt in server-side.
        if !resumed && self.options.resume_key.is_some() {
            let update = SessionUpdate {
                resuming: Some(true),
                timeout: Some(self.options.resume_timeout_secs),
            };
            if let Err(e) = self.rest.update_session(&session_id, &update).await {
                warn!("[{}] Failed to enable session resuming: {}", self.identifier(), e);
                self.emit_error("enable session resuming", &e);
            }
        }
    }

    fn observer(&self) -> Option<Arc<dyn NodeObserver>> {
        self.observer.read().as_ref().and_then(Weak::upgrade)
    }

    fn purge_session_unless_resumable(&self) {
        if self.options.resume_key.is_none() {
            *self.session_id.write() = None;
        }
    }

    fn emit_error(&self, context: &str, error: &Error) {
        emit(
            &self.events,
            ClientEvent::NodeError {
                node: self.identifier().to_string(),
                context: context.to_string(),
                error: error.to_string(),
            },
        );
    }

    fn emit_disconnect(&self, code: u16, reason: String) {
        emit(
            &self.events,
            ClientEvent::NodeDisconnect {
                node: self.identifier().to_string(),
                code,
                reason,
            },
        );
    }
}

/// Connection supervisor: dial, pump, classify the ending, back off, repeat.
async fn session_loop(node: Arc<Node>) {
    loop {
        if node.is_destroyed() {
            return;
        }
        if !node.wants_connected.load(Ordering::SeqCst) || node.user_id().is_none() {
            if node.state() != NodeState::Destroyed {
                node.set_state(NodeState::Idle);
            }
            node.dial_notify.notified().await;
            continue;
        }

        let cancel = CancellationToken::new();
        *node.session_cancel.lock() = Some(cancel.clone());
        node.set_state(NodeState::Dialing);

        let outcome = socket::run_session(&node, cancel).await;
        node.session_cancel.lock().take();
        if !node.is_destroyed() {
            node.set_state(NodeState::Closed);
        }

        match outcome {
            Ok(SessionOutcome::Closed) => {
                // disconnect()/destroy() already adjusted the session cache.
                continue;
            }
            Ok(SessionOutcome::Permanent { code, reason }) => {
                error!(
                    "[{}] Permanent close: code={}, reason='{}'",
                    node.identifier(),
                    code,
                    reason
                );
                node.emit_disconnect(code, reason.clone());
                node.emit_error(
                    "websocket closed permanently",
                    &Error::NodeFailed(node.identifier().to_string()),
                );
                node.wants_connected.store(false, Ordering::SeqCst);
                if let Some(observer) = node.observer() {
                    observer.node_disconnected(&node, true);
                }
                continue;
            }
            Ok(SessionOutcome::Lost { code, reason }) => {
                node.emit_disconnect(code, reason);
                node.purge_session_unless_resumable();
                if let Some(observer) = node.observer() {
                    observer.node_disconnected(&node, false);
                }
            }
            Err(e) => {
                warn!("[{}] Connection attempt failed: {}", node.identifier(), e);
                node.emit_error("websocket dial", &e);
            }
        }

        // Transient loss or dial failure: schedule the next attempt.
        let attempt = node.reconnect_attempt.fetch_add(1, Ordering::SeqCst);
        if attempt >= node.options.reconnect.max_tries {
            error!(
                "[{}] Gave up after {} reconnect attempts",
                node.identifier(),
                attempt
            );
            node.emit_error(
                "reconnect budget exhausted",
                &Error::NodeFailed(node.identifier().to_string()),
            );
            node.wants_connected.store(false, Ordering::SeqCst);
            if let Some(observer) = node.observer() {
                observer.node_disconnected(&node, true);
            }
            continue;
        }

        let delay = backoff::reconnect_delay(&node.options.reconnect, attempt);
        debug!(
            "[{}] Reconnecting in {:?} (attempt {})",
            node.identifier(),
            delay,
            attempt + 1
        );
        node.set_state(NodeState::ReconnectPending);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = node.dial_notify.notified() => {}
        }
    }
}

#[cfg(test)]
impl Node {
    pub(crate) fn inject_stats(&self, stats: Stats) {
        *self.stats.write() = Some(stats);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
