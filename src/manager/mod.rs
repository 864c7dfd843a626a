use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::{
    common::{Error, Result, types::{GuildId, UserId}},
    config::{NodeOptions, PlayerOptions},
    events::{ClientEvent, EventSink, emit},
    node::{Node, NodeObserver},
    player::Player,
    protocol::{LoadResult, NodeEvent, PlayerState, VoiceServerUpdate, VoiceStateUpdate},
};

/// Host-supplied callback that delivers voice gateway payloads (opcode 4) to
/// the platform. Must not block.
#[async_trait]
pub trait PayloadSender: Send + Sync {
    async fn send(
        &self,
        guild_id: &GuildId,
        payload: serde_json::Value,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Federates a fleet of audio nodes: routes platform voice events to players,
/// places new players on the healthiest node and migrates them off dead ones.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    self_ref: Weak<ManagerInner>,
    nodes: DashMap<String, Arc<Node>>,
    /// Insertion order, for deterministic penalty tie-breaks.
    node_order: RwLock<Vec<String>>,
    players: DashMap<GuildId, Arc<Player>>,
    user_id: Arc<OnceLock<UserId>>,
    sender: Arc<dyn PayloadSender>,
    events: EventSink,
    player_defaults: PlayerOptions,
}

impl Manager {
    /// Build a manager and the event stream the host consumes.
    pub fn new(
        sender: Arc<dyn PayloadSender>,
        player_defaults: PlayerOptions,
    ) -> (Self, flume::Receiver<ClientEvent>) {
        let (tx, rx) = flume::unbounded();
        let inner = Arc::new_cyclic(|weak| ManagerInner {
            self_ref: weak.clone(),
            nodes: DashMap::new(),
            node_order: RwLock::new(Vec::new()),
            players: DashMap::new(),
            user_id: Arc::new(OnceLock::new()),
            sender,
            events: tx,
            player_defaults,
        });
        (Self { inner }, rx)
    }

    /// Set the bot user id once it is known (after the platform's ready
    /// event). Nodes start dialing the moment this is set.
    pub fn set_user_id(&self, user_id: UserId) -> Result<()> {
        if let Some(existing) = self.inner.user_id.get() {
            if *existing == user_id {
                return Ok(());
            }
            return Err(Error::InvalidNodeOptions {
                identifier: "<manager>".to_string(),
                reason: "bot user id is already set to a different value".to_string(),
            });
        }
        let _ = self.inner.user_id.set(user_id);
        info!("Bot user id set to {}; dialing nodes", user_id);
        for entry in self.inner.nodes.iter() {
            entry.value().connect();
        }
        Ok(())
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.inner.user_id.get().copied()
    }

    // ------------------------------------------------------------------
    // Node fleet
    // ------------------------------------------------------------------

    /// Register a node. It dials on its own as soon as the user id is known.
    pub fn add_node(&self, options: NodeOptions) -> Result<Arc<Node>> {
        if self.inner.nodes.contains_key(&options.identifier) {
            return Err(Error::InvalidNodeOptions {
                identifier: options.identifier,
                reason: "identifier already in use".to_string(),
            });
        }

        let identifier = options.identifier.clone();
        let node = Arc::new(Node::new(
            options,
            Arc::clone(&self.inner.user_id),
            self.inner.events.clone(),
        )?);
        node.set_observer(observer_of(&self.inner));
        node.start();
        node.connect();

        self.inner.nodes.insert(identifier.clone(), Arc::clone(&node));
        self.inner.node_order.write().push(identifier.clone());
        info!("Node `{}` registered", identifier);
        Ok(node)
    }

    /// Deregister a node, moving its players elsewhere (or destroying them
    /// when nowhere is healthy).
    pub async fn remove_node(&self, identifier: &str) -> Result<()> {
        let Some((_, node)) = self.inner.nodes.remove(identifier) else {
            return Err(Error::InvalidNodeOptions {
                identifier: identifier.to_string(),
                reason: "unknown node".to_string(),
            });
        };
        self.inner.node_order.write().retain(|id| id != identifier);

        node.disconnect();
        self.inner.migrate_players_from(&node, true).await;
        node.destroy();
        info!("Node `{}` removed", identifier);
        Ok(())
    }

    pub fn node(&self, identifier: &str) -> Option<Arc<Node>> {
        self.inner.nodes.get(identifier).map(|e| Arc::clone(e.value()))
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        let order = self.inner.node_order.read();
        order
            .iter()
            .filter_map(|id| self.inner.nodes.get(id).map(|e| Arc::clone(e.value())))
            .collect()
    }

    /// Ready node with the lowest penalty; insertion order breaks ties.
    pub fn get_ideal_node(&self) -> Option<Arc<Node>> {
        self.inner.get_ideal_node()
    }

    // ------------------------------------------------------------------
    // Players
    // ------------------------------------------------------------------

    /// Get or create the player for a guild. Needs the user id and at least
    /// one ready node.
    pub fn create_player(
        &self,
        guild_id: GuildId,
        options: Option<PlayerOptions>,
    ) -> Result<Arc<Player>> {
        if self.inner.user_id.get().is_none() {
            return Err(Error::MissingUserId);
        }
        if let Some(existing) = self.get_player(&guild_id) {
            return Ok(existing);
        }

        let node = self.inner.get_ideal_node().ok_or(Error::NoAvailableNode)?;
        let player = Player::new(
            guild_id.clone(),
            node,
            self.inner.self_ref.clone(),
            Arc::clone(&self.inner.sender),
            options.unwrap_or_else(|| self.inner.player_defaults.clone()),
            self.inner.events.clone(),
        );
        self.inner.players.insert(guild_id.clone(), Arc::clone(&player));
        emit(&self.inner.events, ClientEvent::PlayerCreate { guild_id });
        Ok(player)
    }

    /// Existing, non-destroyed player for a guild.
    pub fn get_player(&self, guild_id: &GuildId) -> Option<Arc<Player>> {
        self.inner.get_player(guild_id)
    }

    pub fn players(&self) -> Vec<Arc<Player>> {
        self.inner
            .players
            .iter()
            .map(|e| Arc::clone(e.value()))
            .filter(|p| !p.is_destroyed())
            .collect()
    }

    /// Destroy a guild's player, if any.
    pub async fn destroy_player(&self, guild_id: &GuildId) {
        if let Some(player) = self.get_player(guild_id) {
            player.destroy().await;
        }
    }

    // ------------------------------------------------------------------
    // Track loading
    // ------------------------------------------------------------------

    /// Resolve a query into tracks on the hint player's node (when ready) or
    /// the current ideal node. Bare text becomes a `ytsearch:`.
    pub async fn load_tracks(
        &self,
        query: &str,
        hint: Option<&Player>,
    ) -> Result<LoadResult> {
        let node = match hint {
            Some(player) => {
                let bound = player.node().await;
                if bound.connected() {
                    bound
                } else {
                    self.inner.get_ideal_node().ok_or(Error::NoAvailableNode)?
                }
            }
            None => self.inner.get_ideal_node().ok_or(Error::NoAvailableNode)?,
        };

        let identifier = build_identifier(query);
        debug!("Loading `{}` on node `{}`", identifier, node.identifier());
        node.rest().load_tracks(&identifier).await
    }

    // ------------------------------------------------------------------
    // Platform event routing
    // ------------------------------------------------------------------

    /// Entry point for raw `VOICE_STATE_UPDATE` payloads.
    pub async fn handle_voice_state_update(&self, update: VoiceStateUpdate) {
        let Some(our_id) = self.inner.user_id.get() else {
            return;
        };
        if update.user_id != *our_id {
            return;
        }
        let Some(guild_id) = update.guild_id else {
            return;
        };
        let Some(player) = self.get_player(&guild_id) else {
            return;
        };

        match update.channel_id {
            // Our bot left (or was moved out of) the channel entirely.
            None => {
                debug!("[{}] Bot left voice; destroying player", guild_id);
                player.destroy().await;
            }
            Some(channel_id) => {
                player
                    .handle_voice_state(update.session_id, channel_id)
                    .await;
            }
        }
    }

    /// Entry point for raw `VOICE_SERVER_UPDATE` payloads.
    pub async fn handle_voice_server_update(&self, update: VoiceServerUpdate) {
        if self.inner.user_id.get().is_none() {
            return;
        }
        let Some(player) = self.get_player(&update.guild_id) else {
            return;
        };
        player
            .handle_voice_server(update.token, update.endpoint)
            .await;
    }
}

fn observer_of(inner: &Arc<ManagerInner>) -> Weak<dyn NodeObserver> {
    let as_observer: Arc<dyn NodeObserver> = Arc::clone(inner) as Arc<dyn NodeObserver>;
    Arc::downgrade(&as_observer)
}

impl ManagerInner {
    fn get_player(&self, guild_id: &GuildId) -> Option<Arc<Player>> {
        self.players
            .get(guild_id)
            .map(|e| Arc::clone(e.value()))
            .filter(|p| !p.is_destroyed())
    }

    fn get_ideal_node(&self) -> Option<Arc<Node>> {
        let order = self.node_order.read();
        let mut best: Option<(f64, Arc<Node>)> = None;
        for id in order.iter() {
            let Some(node) = self.nodes.get(id).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            let penalty = node.penalties();
            if penalty.is_infinite() {
                continue;
            }
            // Strictly-less keeps the earliest node on ties.
            if best.as_ref().is_none_or(|(lowest, _)| penalty < *lowest) {
                best = Some((penalty, node));
            }
        }
        best.map(|(_, node)| node)
    }

    /// Remove a destroyed player from the registry. Called by the player's
    /// own teardown.
    pub(crate) fn forget_player(&self, guild_id: &GuildId) {
        self.players.remove(guild_id);
    }

    /// Move every live player off `node`, waiting one grace period for
    /// another node to become ready when the loss may be transient.
    async fn migrate_players_from(&self, node: &Arc<Node>, permanent: bool) {
        let players: Vec<Arc<Player>> = node
            .bound_guilds()
            .into_iter()
            .filter_map(|guild_id| self.get_player(&guild_id))
            .collect();
        if players.is_empty() {
            return;
        }

        let mut target = self.get_ideal_node();
        if target.is_none() && !permanent {
            let grace =
                Duration::from_millis(node.options().reconnect.initial_delay_ms + 500);
            debug!(
                "No ready node for {} player(s) from `{}`; waiting {:?}",
                players.len(),
                node.identifier(),
                grace
            );
            tokio::time::sleep(grace).await;
            if node.connected() {
                // The node came back; everyone stays put.
                return;
            }
            target = self.get_ideal_node();
        }

        match target {
            Some(target) => {
                info!(
                    "Migrating {} player(s) from `{}` to `{}`",
                    players.len(),
                    node.identifier(),
                    target.identifier()
                );
                for player in players {
                    // A failed move destroys the player on its own.
                    if let Err(e) = player.move_to_node(Arc::clone(&target)).await {
                        warn!("[{}] Migration failed: {}", player.guild_id(), e);
                    }
                }
            }
            None => {
                warn!(
                    "No node can host {} player(s) from `{}`; destroying them",
                    players.len(),
                    node.identifier()
                );
                for player in players {
                    player.destroy().await;
                }
            }
        }
    }
}

#[async_trait]
impl NodeObserver for ManagerInner {
    async fn player_update(&self, node: &Arc<Node>, guild_id: GuildId, state: PlayerState) {
        let Some(player) = self.get_player(&guild_id) else {
            return;
        };
        // Ignore frames from a node the player no longer lives on.
        if player.node().await.identifier() != node.identifier() {
            return;
        }
        player.handle_player_update(state).await;
    }

    async fn player_event(&self, node: &Arc<Node>, event: NodeEvent) {
        let Some(player) = self.get_player(event.guild_id()) else {
            return;
        };
        if player.node().await.identifier() != node.identifier() {
            return;
        }
        player.handle_node_event(event).await;
    }

    fn node_disconnected(&self, node: &Arc<Node>, permanent: bool) {
        let Some(inner) = self.self_ref.upgrade() else {
            return;
        };
        let node = Arc::clone(node);
        tokio::spawn(async move {
            inner.migrate_players_from(&node, permanent).await;
        });
    }
}

/// Queries that are already URLs or carry a search prefix pass through;
/// anything else becomes a YouTube search.
fn build_identifier(query: &str) -> String {
    static URL: OnceLock<Regex> = OnceLock::new();
    static SEARCH: OnceLock<Regex> = OnceLock::new();

    let url = URL.get_or_init(|| Regex::new(r"^(?:https?|ftp)://").unwrap());
    let search = SEARCH
        .get_or_init(|| Regex::new(r"^(ytsearch|ytmsearch|scsearch|amsearch|dzsearch|spsearch):").unwrap());

    if url.is_match(query) || search.is_match(query) {
        query.to_string()
    } else {
        format!("ytsearch:{query}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ReconnectPolicy,
        node::NodeState,
        protocol::stats::{Cpu, FrameStats, Memory, Stats},
    };

    struct NullSender;

    #[async_trait]
    impl PayloadSender for NullSender {
        async fn send(
            &self,
            _guild_id: &GuildId,
            _payload: serde_json::Value,
        ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
    }

    fn manager() -> (Manager, flume::Receiver<ClientEvent>) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        Manager::new(Arc::new(NullSender), PlayerOptions::default())
    }

    fn node_options(identifier: &str) -> NodeOptions {
        NodeOptions {
            identifier: identifier.to_string(),
            host: "localhost".to_string(),
            port: 1,
            secure: false,
            password: "pw".to_string(),
            resume_key: None,
            resume_timeout_secs: 60,
            retry_amount: 1,
            reconnect: ReconnectPolicy {
                // Keep background dial churn out of the tests.
                initial_delay_ms: 60_000,
                max_delay_ms: 60_000,
                max_tries: 1,
            },
        }
    }

    fn stats(players: i32, load: f64, cores: i32, used_mib: u64) -> Stats {
        Stats {
            players,
            playing_players: players,
            uptime: 1,
            memory: Memory {
                free: 0,
                used: used_mib * 1_048_576,
                allocated: 0,
                reservable: 0,
            },
            cpu: Cpu {
                cores,
                system_load: load,
                lavalink_load: 0.0,
            },
            frame_stats: Some(FrameStats { sent: 3000, nulled: 0, deficit: 0 }),
        }
    }

    #[test]
    fn test_build_identifier_rules() {
        assert_eq!(
            build_identifier("never gonna give you up"),
            "ytsearch:never gonna give you up"
        );
        assert_eq!(build_identifier("https://example/x"), "https://example/x");
        assert_eq!(build_identifier("scsearch:foo"), "scsearch:foo");
        assert_eq!(build_identifier("spsearch:bar"), "spsearch:bar");
        assert_eq!(build_identifier("ftp://files/x.mp3"), "ftp://files/x.mp3");
        // Prefix-lookalikes in the middle don't count.
        assert_eq!(build_identifier("play ytsearch:x"), "ytsearch:play ytsearch:x");
    }

    #[tokio::test]
    async fn test_duplicate_node_identifier_rejected() {
        let (manager, _rx) = manager();
        manager.add_node(node_options("main")).unwrap();
        assert!(matches!(
            manager.add_node(node_options("main")),
            Err(Error::InvalidNodeOptions { .. })
        ));
    }

    #[tokio::test]
    async fn test_ideal_node_none_when_nothing_ready() {
        let (manager, _rx) = manager();
        manager.add_node(node_options("a")).unwrap();
        manager.add_node(node_options("b")).unwrap();
        assert!(manager.get_ideal_node().is_none());
    }

    #[tokio::test]
    async fn test_ideal_node_prefers_lowest_penalty() {
        let (manager, _rx) = manager();
        let a = manager.add_node(node_options("a")).unwrap();
        let b = manager.add_node(node_options("b")).unwrap();

        // a: 5 players, light load, heavy memory => ~506
        a.set_state(NodeState::Ready);
        a.inject_stats(stats(5, 0.10, 4, 500));
        // b: 50 players, light load, light memory => ~151
        b.set_state(NodeState::Ready);
        b.inject_stats(stats(50, 0.10, 4, 100));

        let ideal = manager.get_ideal_node().unwrap();
        assert_eq!(ideal.identifier(), "b");
    }

    #[tokio::test]
    async fn test_ideal_node_tie_breaks_by_insertion_order() {
        let (manager, _rx) = manager();
        let a = manager.add_node(node_options("a")).unwrap();
        let b = manager.add_node(node_options("b")).unwrap();
        a.set_state(NodeState::Ready);
        b.set_state(NodeState::Ready);
        a.inject_stats(stats(1, 0.0, 4, 10));
        b.inject_stats(stats(1, 0.0, 4, 10));

        assert_eq!(manager.get_ideal_node().unwrap().identifier(), "a");
    }

    #[tokio::test]
    async fn test_create_player_requires_user_id_and_ready_node() {
        let (manager, _rx) = manager();
        assert!(matches!(
            manager.create_player(GuildId::from("g1"), None),
            Err(Error::MissingUserId)
        ));

        manager.set_user_id(UserId(1)).unwrap();
        assert!(matches!(
            manager.create_player(GuildId::from("g1"), None),
            Err(Error::NoAvailableNode)
        ));

        let node = manager.add_node(node_options("a")).unwrap();
        node.set_state(NodeState::Ready);
        let player = manager.create_player(GuildId::from("g1"), None).unwrap();

        // Second call returns the same live player.
        let again = manager.create_player(GuildId::from("g1"), None).unwrap();
        assert!(Arc::ptr_eq(&player, &again));
    }

    #[tokio::test]
    async fn test_set_user_id_is_write_once() {
        let (manager, _rx) = manager();
        manager.set_user_id(UserId(1)).unwrap();
        assert!(manager.set_user_id(UserId(1)).is_ok());
        assert!(manager.set_user_id(UserId(2)).is_err());
    }

    #[tokio::test]
    async fn test_voice_state_for_other_users_is_ignored() {
        let (manager, _rx) = manager();
        manager.set_user_id(UserId(1)).unwrap();
        let node = manager.add_node(node_options("a")).unwrap();
        node.set_state(NodeState::Ready);
        let player = manager.create_player(GuildId::from("g1"), None).unwrap();

        manager
            .handle_voice_state_update(VoiceStateUpdate {
                guild_id: Some(GuildId::from("g1")),
                channel_id: None,
                user_id: UserId(999),
                session_id: "other".to_string(),
            })
            .await;
        assert!(!player.is_destroyed());
    }

    #[tokio::test]
    async fn test_bot_leaving_voice_destroys_player() {
        let (manager, _rx) = manager();
        manager.set_user_id(UserId(1)).unwrap();
        let node = manager.add_node(node_options("a")).unwrap();
        node.set_state(NodeState::Ready);
        let player = manager.create_player(GuildId::from("g1"), None).unwrap();
        // Keep the destroy path off the network.
        node.set_state(NodeState::Closed);

        manager
            .handle_voice_state_update(VoiceStateUpdate {
                guild_id: Some(GuildId::from("g1")),
                channel_id: None,
                user_id: UserId(1),
                session_id: "vs".to_string(),
            })
            .await;

        assert!(player.is_destroyed());
        assert!(manager.get_player(&GuildId::from("g1")).is_none());
    }

    #[tokio::test]
    async fn test_events_from_foreign_node_are_dropped() {
        let (manager, rx) = manager();
        manager.set_user_id(UserId(1)).unwrap();
        let a = manager.add_node(node_options("a")).unwrap();
        let b = manager.add_node(node_options("b")).unwrap();
        a.set_state(NodeState::Ready);
        manager.create_player(GuildId::from("g1"), None).unwrap();
        rx.drain().for_each(drop);

        // The player lives on `a`; an update arriving via `b` is stale.
        manager
            .inner
            .player_update(
                &b,
                GuildId::from("g1"),
                PlayerState { time: 0, position: 1, connected: true, ping: 1 },
            )
            .await;
        assert!(rx.try_recv().is_err());

        manager
            .inner
            .player_update(
                &a,
                GuildId::from("g1"),
                PlayerState { time: 0, position: 1, connected: true, ping: 1 },
            )
            .await;
        assert!(matches!(
            rx.try_recv().unwrap(),
            ClientEvent::PlayerStateUpdate { .. }
        ));
    }
}
