use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{
    common::{Error, Result, types::{ChannelId, GuildId}},
    config::PlayerOptions,
    events::{ClientEvent, EventSink, emit},
    manager::{ManagerInner, PayloadSender},
    node::Node,
    protocol::{
        EndTime, Filters, NodeEvent, PlayerState, PlayerUpdate, Track, TrackEncoded,
        TrackEndReason, VoiceState,
    },
};

pub mod queue;

pub use queue::{LoopMode, Queue};

/// The platform has this long to complete the voice handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Volume ceiling enforced on every write.
const MAX_VOLUME: u16 = 1000;

/// Voice close codes after which reconnecting is pointless: bad session,
/// kicked from the channel, or the channel is gone.
fn is_fatal_voice_close(code: u16) -> bool {
    matches!(code, 4004 | 4006 | 4014)
}

/// Where a player is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStatus {
    Instantiated,
    Connecting,
    WaitingForServer,
    Stopped,
    Playing,
    Paused,
    Disconnected,
    DisconnectedLavalink,
    ConnectionFailed,
    Destroyed,
}

impl PlayerStatus {
    fn name(self) -> &'static str {
        match self {
            Self::Instantiated => "instantiated",
            Self::Connecting => "connecting",
            Self::WaitingForServer => "waiting for the voice server",
            Self::Stopped => "stopped",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Disconnected => "disconnected",
            Self::DisconnectedLavalink => "disconnected from the node",
            Self::ConnectionFailed => "failed to connect",
            Self::Destroyed => "destroyed",
        }
    }
}

/// Options for a single `play` call.
#[derive(Debug, Clone, Default)]
pub struct PlayOptions {
    /// Keep the current track if it is the same one.
    pub no_replace: bool,
    /// Start position in milliseconds, clamped to the track length.
    pub position: Option<u64>,
    /// Stop early at this position; dropped unless strictly past `position`.
    pub end_time: Option<u64>,
    /// Start paused.
    pub paused: bool,
}

/// Voice handshake material accumulated from platform callbacks.
#[derive(Debug, Default)]
struct VoiceContext {
    channel_id: Option<ChannelId>,
    session_id: Option<String>,
    token: Option<String>,
    endpoint: Option<String>,
    connected: bool,
    ping: i64,
}

impl VoiceContext {
    fn as_state(&self) -> Option<VoiceState> {
        Some(VoiceState {
            token: self.token.clone()?,
            endpoint: self.endpoint.clone()?,
            session_id: self.session_id.clone()?,
        })
    }
}

struct PendingConnect {
    target: ChannelId,
    resolver: oneshot::Sender<Result<()>>,
}

/// Mutable player state. One async mutex serializes every command and every
/// inbound node event, REST round-trips included, which is what gives each
/// guild a total order of operations.
struct PlayerCore {
    node: Arc<Node>,
    status: PlayerStatus,
    queue: Queue,
    voice: VoiceContext,
    playing: bool,
    paused: bool,
    volume: u16,
    filters: Filters,
    last_position: u64,
    position_stamp: Option<Instant>,
    pending_connect: Option<PendingConnect>,
}

/// Per-guild playback: the voice handshake with the platform, the queue, and
/// the commands the bound node executes on our behalf.
pub struct Player {
    guild_id: GuildId,
    options: PlayerOptions,
    manager: Weak<ManagerInner>,
    sender: Arc<dyn PayloadSender>,
    events: EventSink,
    destroyed: AtomicBool,
    core: tokio::sync::Mutex<PlayerCore>,
}

impl Player {
    pub(crate) fn new(
        guild_id: GuildId,
        node: Arc<Node>,
        manager: Weak<ManagerInner>,
        sender: Arc<dyn PayloadSender>,
        options: PlayerOptions,
        events: EventSink,
    ) -> Arc<Self> {
        node.bind_player(guild_id.clone());
        let volume = options.initial_volume.min(MAX_VOLUME);
        Arc::new(Self {
            guild_id,
            options,
            manager,
            sender,
            events,
            destroyed: AtomicBool::new(false),
            core: tokio::sync::Mutex::new(PlayerCore {
                node,
                status: PlayerStatus::Instantiated,
                queue: Queue::new(),
                voice: VoiceContext::default(),
                playing: false,
                paused: false,
                volume,
                filters: Filters::default(),
                last_position: 0,
                position_stamp: None,
                pending_connect: None,
            }),
        })
    }

    pub fn guild_id(&self) -> &GuildId {
        &self.guild_id
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> PlayerStatus {
        self.core.lock().await.status
    }

    pub async fn node(&self) -> Arc<Node> {
        self.core.lock().await.node.clone()
    }

    pub async fn is_paused(&self) -> bool {
        self.core.lock().await.paused
    }

    pub async fn volume(&self) -> u16 {
        self.core.lock().await.volume
    }

    pub async fn loop_mode(&self) -> LoopMode {
        self.core.lock().await.queue.loop_mode()
    }

    pub async fn current_track(&self) -> Option<Track> {
        self.core.lock().await.queue.current().cloned()
    }

    pub async fn voice_channel(&self) -> Option<ChannelId> {
        self.core.lock().await.voice.channel_id.clone()
    }

    /// Run `f` against the queue under the player lock.
    pub async fn with_queue<R>(&self, f: impl FnOnce(&mut Queue) -> R) -> R {
        let mut core = self.core.lock().await;
        f(&mut core.queue)
    }

    /// Best estimate of the playhead: the last reported position plus wall
    /// clock while playing, frozen otherwise.
    pub async fn current_position(&self) -> u64 {
        let core = self.core.lock().await;
        Self::position_estimate(&core)
    }

    fn position_estimate(core: &PlayerCore) -> u64 {
        if core.status != PlayerStatus::Playing {
            return core.last_position;
        }
        let elapsed = core
            .position_stamp
            .map(|stamp| stamp.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let position = core.last_position.saturating_add(elapsed);
        match core.queue.current() {
            Some(track) if track.info.length > 0 => position.min(track.info.length),
            _ => position,
        }
    }

    // ------------------------------------------------------------------
    // Voice handshake
    // ------------------------------------------------------------------

    /// Join a voice channel. Resolves once the node holds working voice
    /// credentials; fails (and destroys the player) after 20 s without them.
    pub async fn connect(&self, channel_id: ChannelId) -> Result<()> {
        self.ensure_alive()?;

        let rx = {
            let mut core = self.core.lock().await;
            match core.status {
                PlayerStatus::Instantiated
                | PlayerStatus::Disconnected
                | PlayerStatus::ConnectionFailed
                | PlayerStatus::DisconnectedLavalink => {}
                other => {
                    return Err(Error::WrongState {
                        guild_id: self.guild_id.clone(),
                        operation: "connect",
                        state: other.name(),
                    });
                }
            }
            if core.pending_connect.is_some() {
                return Err(Error::ConnectInProgress(self.guild_id.clone()));
            }

            core.status = PlayerStatus::Connecting;
            core.voice.channel_id = Some(channel_id.clone());
            let (tx, rx) = oneshot::channel();
            core.pending_connect = Some(PendingConnect {
                target: channel_id.clone(),
                resolver: tx,
            });
            rx
        };

        debug!("[{}] Connecting to voice channel {}", self.guild_id, channel_id);
        if let Err(e) = self.send_voice_payload(Some(&channel_id)).await {
            let mut core = self.core.lock().await;
            core.pending_connect = None;
            core.status = PlayerStatus::ConnectionFailed;
            return Err(e);
        }

        match tokio::time::timeout(CONNECT_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::PlayerDestroyed(self.guild_id.clone())),
            Err(_) => {
                warn!("[{}] Voice handshake timed out", self.guild_id);
                self.abort_connect().await;
                Err(Error::ConnectTimeout(self.guild_id.clone()))
            }
        }
    }

    async fn abort_connect(&self) {
        {
            let mut core = self.core.lock().await;
            core.pending_connect = None;
            core.status = PlayerStatus::ConnectionFailed;
            core.voice.channel_id = None;
        }
        // Leave the channel before tearing down, so the platform does not
        // show a ghost connection.
        let _ = self.send_voice_payload(None).await;
        self.destroy().await;
    }

    /// Leave the voice channel but keep the player usable for a later
    /// `connect`.
    pub async fn disconnect(&self) -> Result<()> {
        self.ensure_alive()?;
        let mut core = self.core.lock().await;

        if core.playing || core.queue.current().is_some() {
            // Best effort; a dead node must not wedge the disconnect.
            if let Err(e) = self.stop_inner(&mut core, false).await {
                debug!("[{}] Stop during disconnect failed: {}", self.guild_id, e);
            }
        }

        core.voice = VoiceContext::default();
        core.status = PlayerStatus::Disconnected;
        drop(core);

        self.send_voice_payload(None).await
    }

    /// Platform voice-state callback for this guild's bot user.
    pub(crate) async fn handle_voice_state(&self, session_id: String, channel_id: ChannelId) {
        if self.is_destroyed() {
            return;
        }
        let mut core = self.core.lock().await;
        let session_changed = core.voice.session_id.as_deref() != Some(session_id.as_str());
        core.voice.session_id = Some(session_id);

        match core.status {
            PlayerStatus::Connecting => {
                let on_target = core
                    .pending_connect
                    .as_ref()
                    .is_some_and(|pending| pending.target == channel_id);
                if on_target {
                    core.status = PlayerStatus::WaitingForServer;
                }
            }
            _ => {
                core.voice.channel_id = Some(channel_id);
                // A new session id with cached credentials must be pushed to
                // the node even though no new endpoint will follow.
                if session_changed && core.voice.token.is_some() && core.voice.endpoint.is_some() {
                    self.patch_voice(&mut core).await;
                }
            }
        }
    }

    /// Platform voice-server callback: the token/endpoint half of the
    /// handshake.
    pub(crate) async fn handle_voice_server(&self, token: String, endpoint: Option<String>) {
        if self.is_destroyed() {
            return;
        }
        let mut core = self.core.lock().await;
        let Some(endpoint) = endpoint else {
            // The platform is reallocating the voice server; a follow-up
            // update will carry the new endpoint.
            core.voice.endpoint = None;
            return;
        };

        core.voice.token = Some(token);
        core.voice.endpoint = Some(crate::protocol::normalize_endpoint(&endpoint));
        if core.voice.session_id.is_some() {
            self.patch_voice(&mut core).await;
        }
    }

    /// Push the assembled voice credentials to the node, resolving or
    /// rejecting an in-flight `connect`.
    async fn patch_voice(&self, core: &mut PlayerCore) {
        let Some(voice) = core.voice.as_state() else {
            return;
        };
        let update = PlayerUpdate {
            voice: Some(voice),
            ..Default::default()
        };

        match core.node.update_player(&self.guild_id, &update, false).await {
            Ok(_) => {
                core.voice.connected = true;
                if let Some(pending) = core.pending_connect.take() {
                    info!("[{}] Voice handshake complete", self.guild_id);
                    core.status = PlayerStatus::Stopped;
                    let _ = pending.resolver.send(Ok(()));
                }
            }
            Err(e) => {
                warn!("[{}] Voice update failed: {}", self.guild_id, e);
                if let Some(pending) = core.pending_connect.take() {
                    core.status = PlayerStatus::ConnectionFailed;
                    let _ = pending.resolver.send(Err(Error::ConnectionFailed {
                        guild_id: self.guild_id.clone(),
                        reason: e.to_string(),
                    }));
                    self.destroy_inner(core).await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Playback commands
    // ------------------------------------------------------------------

    /// Start a track, or the next queued one when `track` is `None`.
    pub async fn play(&self, track: Option<Track>, options: PlayOptions) -> Result<()> {
        self.ensure_alive()?;
        let mut core = self.core.lock().await;
        self.check_playable(&core, "play")?;

        match track {
            Some(track) => {
                if options.no_replace
                    && core.playing
                    && core
                        .queue
                        .current()
                        .is_some_and(|current| current.encoded == track.encoded)
                {
                    return Ok(());
                }
                self.start_track(&mut core, track, true, options).await
            }
            None => match core.queue.poll() {
                Some(next) => self.start_track(&mut core, next, false, options).await,
                None => match core.queue.current().cloned() {
                    Some(current) => self.start_track(&mut core, current, false, options).await,
                    None => {
                        emit(
                            &self.events,
                            ClientEvent::QueueEnd {
                                guild_id: self.guild_id.clone(),
                            },
                        );
                        self.stop_inner(&mut core, false).await
                    }
                },
            },
        }
    }

    fn check_playable(&self, core: &PlayerCore, operation: &'static str) -> Result<()> {
        match core.status {
            PlayerStatus::Stopped
            | PlayerStatus::Playing
            | PlayerStatus::Paused
            | PlayerStatus::WaitingForServer => {}
            other => {
                return Err(Error::WrongState {
                    guild_id: self.guild_id.clone(),
                    operation,
                    state: other.name(),
                });
            }
        }
        if !core.node.connected() {
            return Err(Error::NodeNotReady(core.node.identifier().to_string()));
        }
        Ok(())
    }

    /// Issue the play PATCH. `advance` moves the queue's current pointer on
    /// success; polled tracks already advanced it.
    async fn start_track(
        &self,
        core: &mut PlayerCore,
        track: Track,
        advance: bool,
        options: PlayOptions,
    ) -> Result<()> {
        let position = options.position.map(|p| {
            if track.info.length > 0 {
                p.min(track.info.length)
            } else {
                p
            }
        });
        let end_time = options
            .end_time
            .filter(|&end| end > position.unwrap_or(0))
            .map(EndTime::Set);

        let update = PlayerUpdate {
            encoded_track: Some(TrackEncoded::Set(track.encoded.clone())),
            position,
            end_time,
            paused: Some(options.paused),
            ..Default::default()
        };

        core.node
            .update_player(&self.guild_id, &update, options.no_replace)
            .await?;

        if advance {
            core.queue.advance_to(Some(track));
        }
        // PLAYING waits for the node's TrackStartEvent.
        Ok(())
    }

    /// Stop playback; optionally wipe the queue too.
    pub async fn stop(&self, clear_queue: bool) -> Result<()> {
        self.ensure_alive()?;
        let mut core = self.core.lock().await;
        self.stop_inner(&mut core, clear_queue).await
    }

    async fn stop_inner(&self, core: &mut PlayerCore, clear_queue: bool) -> Result<()> {
        core.queue.advance_to(None);
        core.last_position = 0;
        core.position_stamp = None;
        core.playing = false;
        core.status = PlayerStatus::Stopped;
        if clear_queue {
            core.queue.clear();
        }

        if core.node.connected() {
            let update = PlayerUpdate {
                encoded_track: Some(TrackEncoded::Clear),
                ..Default::default()
            };
            core.node.update_player(&self.guild_id, &update, false).await?;
        }
        Ok(())
    }

    /// Pause or resume. Idempotent: repeating the current value is free.
    pub async fn pause(&self, paused: bool) -> Result<()> {
        self.ensure_alive()?;
        let mut core = self.core.lock().await;
        if core.paused == paused {
            return Ok(());
        }
        if core.queue.current().is_none() {
            return Err(Error::NoCurrentTrack(self.guild_id.clone()));
        }
        if !core.node.connected() {
            return Err(Error::NodeNotReady(core.node.identifier().to_string()));
        }

        let update = PlayerUpdate {
            paused: Some(paused),
            ..Default::default()
        };
        core.node.update_player(&self.guild_id, &update, false).await?;

        // Freeze the position clock under the old status before flipping it.
        core.last_position = Self::position_estimate(&core);
        core.position_stamp = Some(Instant::now());
        core.paused = paused;
        match (core.status, paused) {
            (PlayerStatus::Playing, true) => core.status = PlayerStatus::Paused,
            (PlayerStatus::Paused, false) => core.status = PlayerStatus::Playing,
            _ => {}
        }
        Ok(())
    }

    /// Jump to `position_ms`, clamped to the track length.
    pub async fn seek(&self, position_ms: u64) -> Result<()> {
        self.ensure_alive()?;
        let mut core = self.core.lock().await;
        let track = core
            .queue
            .current()
            .ok_or_else(|| Error::NoCurrentTrack(self.guild_id.clone()))?;
        if !track.info.is_seekable {
            return Err(Error::NotSeekable(self.guild_id.clone()));
        }
        if !core.node.connected() {
            return Err(Error::NodeNotReady(core.node.identifier().to_string()));
        }

        let position = position_ms.min(track.info.length);
        // Pre-emptive local update for immediate reads; the next server
        // playerUpdate overwrites it either way.
        core.last_position = position;
        core.position_stamp = Some(Instant::now());

        let update = PlayerUpdate {
            position: Some(position),
            ..Default::default()
        };
        core.node.update_player(&self.guild_id, &update, false).await?;
        Ok(())
    }

    /// Set volume in [0, 1000]. Unchanged values issue no REST call.
    pub async fn set_volume(&self, volume: u16) -> Result<()> {
        self.ensure_alive()?;
        let mut core = self.core.lock().await;
        let volume = volume.min(MAX_VOLUME);
        if core.volume == volume {
            return Ok(());
        }
        if !core.node.connected() {
            return Err(Error::NodeNotReady(core.node.identifier().to_string()));
        }

        let update = PlayerUpdate {
            volume: Some(volume),
            ..Default::default()
        };
        core.node.update_player(&self.guild_id, &update, false).await?;
        core.volume = volume;
        Ok(())
    }

    /// Local queue policy only; the node is not involved.
    pub async fn set_loop(&self, mode: LoopMode) {
        let mut core = self.core.lock().await;
        core.queue.set_loop(mode);
    }

    /// Replace the node-side filter chain. Passthrough only.
    pub async fn set_filters(&self, filters: Filters) -> Result<()> {
        self.ensure_alive()?;
        let mut core = self.core.lock().await;
        if !core.node.connected() {
            return Err(Error::NodeNotReady(core.node.identifier().to_string()));
        }

        let update = PlayerUpdate {
            filters: Some(filters.clone()),
            ..Default::default()
        };
        core.node.update_player(&self.guild_id, &update, false).await?;
        core.filters = filters;
        Ok(())
    }

    /// Jump to the next queued track, or stop if the queue is empty.
    pub async fn skip(&self) -> Result<()> {
        self.ensure_alive()?;
        let mut core = self.core.lock().await;

        if core.queue.peek().is_some() {
            self.check_playable(&core, "skip")?;
        }
        match core.queue.remove_at(0) {
            // The node reports TrackEnd(replaced) for the old track, then
            // TrackStart for the next one.
            Some(next) => {
                self.start_track(&mut core, next, true, PlayOptions::default())
                    .await
            }
            None => self.stop_inner(&mut core, false).await,
        }
    }

    // ------------------------------------------------------------------
    // Node events (dispatched by the manager, in server order)
    // ------------------------------------------------------------------

    pub(crate) async fn handle_player_update(&self, state: PlayerState) {
        if self.is_destroyed() {
            return;
        }
        let mut core = self.core.lock().await;
        core.last_position = state.position;
        core.position_stamp = Some(Instant::now());
        core.voice.connected = state.connected;
        core.voice.ping = state.ping;
        drop(core);

        emit(
            &self.events,
            ClientEvent::PlayerStateUpdate {
                guild_id: self.guild_id.clone(),
                state,
            },
        );
    }

    pub(crate) async fn handle_node_event(&self, event: NodeEvent) {
        if self.is_destroyed() {
            return;
        }
        match event {
            NodeEvent::TrackStart { track, .. } => {
                let mut core = self.core.lock().await;
                core.playing = true;
                core.paused = false;
                core.status = PlayerStatus::Playing;
                core.last_position = 0;
                core.position_stamp = Some(Instant::now());
                drop(core);

                emit(
                    &self.events,
                    ClientEvent::TrackStart {
                        guild_id: self.guild_id.clone(),
                        track,
                    },
                );
            }
            NodeEvent::TrackEnd { track, reason, .. } => {
                let mut core = self.core.lock().await;
                let previous = if reason == TrackEndReason::Replaced {
                    None
                } else {
                    let finished = core.queue.finish_current();
                    core.playing = false;
                    core.status = PlayerStatus::Stopped;
                    core.last_position = 0;
                    core.position_stamp = None;
                    finished
                };

                emit(
                    &self.events,
                    ClientEvent::TrackEnd {
                        guild_id: self.guild_id.clone(),
                        track,
                        reason,
                    },
                );
                self.progress_queue(&mut core, reason, previous).await;
            }
            NodeEvent::TrackException { track, exception, .. } => {
                let mut core = self.core.lock().await;
                core.queue.finish_current();
                core.playing = false;
                core.status = PlayerStatus::Stopped;
                core.last_position = 0;
                core.position_stamp = None;

                let fatal = exception.severity == crate::common::Severity::Fault;
                emit(
                    &self.events,
                    ClientEvent::TrackException {
                        guild_id: self.guild_id.clone(),
                        track,
                        exception,
                    },
                );

                if fatal {
                    warn!("[{}] Fault-severity track exception; tearing down", self.guild_id);
                    self.destroy_inner(&mut core).await;
                } else {
                    self.progress_queue(&mut core, TrackEndReason::LoadFailed, None)
                        .await;
                }
            }
            NodeEvent::TrackStuck { track, threshold_ms, .. } => {
                let mut core = self.core.lock().await;
                core.queue.finish_current();
                core.playing = false;
                core.status = PlayerStatus::Stopped;
                core.last_position = 0;
                core.position_stamp = None;

                emit(
                    &self.events,
                    ClientEvent::TrackStuck {
                        guild_id: self.guild_id.clone(),
                        track,
                        threshold_ms,
                    },
                );
                // A stuck track is never replayed, even in track loop.
                self.progress_queue(&mut core, TrackEndReason::LoadFailed, None)
                    .await;
            }
            NodeEvent::WebSocketClosed { code, reason, by_remote, .. } => {
                let mut core = self.core.lock().await;
                core.voice.connected = false;
                core.status = PlayerStatus::DisconnectedLavalink;

                emit(
                    &self.events,
                    ClientEvent::PlayerWebsocketClosed {
                        guild_id: self.guild_id.clone(),
                        code,
                        reason,
                        by_remote,
                    },
                );

                if is_fatal_voice_close(code) {
                    warn!(
                        "[{}] Voice websocket closed fatally (code {}); tearing down",
                        self.guild_id, code
                    );
                    self.destroy_inner(&mut core).await;
                }
            }
        }
    }

    /// Decide what plays after a track ended for reason `reason`.
    async fn progress_queue(
        &self,
        core: &mut PlayerCore,
        reason: TrackEndReason,
        previous: Option<Track>,
    ) {
        if core.status == PlayerStatus::Destroyed {
            return;
        }

        // Natural end with track loop: replay the same track.
        if reason == TrackEndReason::Finished && core.queue.loop_mode() == LoopMode::Track {
            if let Some(previous) = previous {
                if let Err(e) = self
                    .start_track(core, previous, true, PlayOptions::default())
                    .await
                {
                    warn!("[{}] Track-loop replay failed: {}", self.guild_id, e);
                }
                return;
            }
        }

        // Stop/replace/cleanup never auto-advance; a replacement play is
        // already on its way when relevant.
        if matches!(
            reason,
            TrackEndReason::Stopped | TrackEndReason::Replaced | TrackEndReason::Cleanup
        ) {
            return;
        }

        match core.queue.poll() {
            Some(next) => {
                if let Err(e) = self
                    .start_track(core, next, false, PlayOptions::default())
                    .await
                {
                    warn!("[{}] Queue progression failed: {}", self.guild_id, e);
                }
            }
            None => {
                emit(
                    &self.events,
                    ClientEvent::QueueEnd {
                        guild_id: self.guild_id.clone(),
                    },
                );
                core.status = PlayerStatus::Stopped;
                if core.node.connected() {
                    let update = PlayerUpdate {
                        encoded_track: Some(TrackEncoded::Clear),
                        ..Default::default()
                    };
                    if let Err(e) = core.node.update_player(&self.guild_id, &update, false).await {
                        debug!("[{}] Defensive stop after queue end failed: {}", self.guild_id, e);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Node transfer
    // ------------------------------------------------------------------

    /// Re-home this player onto `target` without losing the playhead.
    pub async fn move_to_node(&self, target: Arc<Node>) -> Result<()> {
        self.ensure_alive()?;
        let mut core = self.core.lock().await;

        if core.node.identifier() == target.identifier() {
            return Err(Error::SameNode(self.guild_id.clone()));
        }
        if !target.connected() {
            return Err(Error::NodeNotReady(target.identifier().to_string()));
        }

        let snapshot = PlayerUpdate {
            encoded_track: core
                .queue
                .current()
                .map(|track| TrackEncoded::Set(track.encoded.clone())),
            position: core
                .queue
                .current()
                .is_some()
                .then(|| Self::position_estimate(&core)),
            volume: Some(core.volume),
            paused: Some(core.paused),
            // Only ship voice when the full triple is known; otherwise the
            // player stays voice-less until the platform re-issues updates.
            voice: core.voice.as_state(),
            ..Default::default()
        };

        let old = core.node.clone();
        info!(
            "[{}] Moving from node `{}` to `{}`",
            self.guild_id,
            old.identifier(),
            target.identifier()
        );

        if old.connected() {
            if let Err(e) = old.destroy_player(&self.guild_id).await {
                debug!(
                    "[{}] Cleanup on `{}` failed (ignored): {}",
                    self.guild_id,
                    old.identifier(),
                    e
                );
            }
        }

        old.unbind_player(&self.guild_id);
        target.bind_player(self.guild_id.clone());
        core.node = Arc::clone(&target);

        match target.update_player(&self.guild_id, &snapshot, false).await {
            Ok(_) => {
                emit(
                    &self.events,
                    ClientEvent::PlayerMove {
                        guild_id: self.guild_id.clone(),
                        from: old.identifier().to_string(),
                        to: target.identifier().to_string(),
                    },
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    "[{}] Transfer to `{}` failed; destroying player: {}",
                    self.guild_id,
                    target.identifier(),
                    e
                );
                self.destroy_inner(&mut core).await;
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Full teardown: reject pending connects, clean the node, leave voice
    /// and drop out of the manager. Idempotent.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut core = self.core.lock().await;
        self.destroy_inner(&mut core).await;
    }

    async fn destroy_inner(&self, core: &mut PlayerCore) {
        self.destroyed.store(true, Ordering::SeqCst);
        if core.status == PlayerStatus::Destroyed {
            return;
        }
        info!("[{}] Player destroyed", self.guild_id);

        if let Some(pending) = core.pending_connect.take() {
            let _ = pending
                .resolver
                .send(Err(Error::PlayerDestroyed(self.guild_id.clone())));
        }

        if core.node.connected() {
            if let Err(e) = core.node.destroy_player(&self.guild_id).await {
                debug!("[{}] Node-side destroy failed (ignored): {}", self.guild_id, e);
            }
        }

        if core.voice.channel_id.take().is_some() {
            let _ = self.send_voice_payload(None).await;
        }

        core.status = PlayerStatus::Destroyed;
        core.playing = false;
        core.queue.clear();
        core.node.unbind_player(&self.guild_id);

        if let Some(manager) = self.manager.upgrade() {
            manager.forget_player(&self.guild_id);
        }

        emit(
            &self.events,
            ClientEvent::PlayerDestroy {
                guild_id: self.guild_id.clone(),
            },
        );
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::PlayerDestroyed(self.guild_id.clone()));
        }
        Ok(())
    }

    /// Platform voice payload (opcode 4): join on `Some`, leave on `None`.
    async fn send_voice_payload(&self, channel_id: Option<&ChannelId>) -> Result<()> {
        let payload = serde_json::json!({
            "op": 4,
            "d": {
                "guild_id": self.guild_id,
                "channel_id": channel_id,
                "self_mute": self.options.self_mute,
                "self_deaf": self.options.self_deaf,
            }
        });
        self.sender
            .send(&self.guild_id, payload)
            .await
            .map_err(|e| Error::PayloadSend(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::types::UserId,
        config::{NodeOptions, ReconnectPolicy},
        protocol::tracks::TrackInfo,
    };
    use std::sync::OnceLock;

    struct NullSender;

    #[async_trait::async_trait]
    impl PayloadSender for NullSender {
        async fn send(
            &self,
            _guild_id: &GuildId,
            _payload: serde_json::Value,
        ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
    }

    fn test_node() -> Arc<Node> {
        let (tx, _rx) = flume::unbounded();
        let user_id = Arc::new(OnceLock::new());
        let _ = user_id.set(UserId(1));
        Arc::new(
            Node::new(
                NodeOptions {
                    identifier: "test".to_string(),
                    host: "localhost".to_string(),
                    port: 2333,
                    secure: false,
                    password: "pw".to_string(),
                    resume_key: None,
                    resume_timeout_secs: 60,
                    retry_amount: 1,
                    reconnect: ReconnectPolicy::default(),
                },
                user_id,
                tx,
            )
            .unwrap(),
        )
    }

    fn test_player() -> (Arc<Player>, flume::Receiver<ClientEvent>) {
        let (tx, rx) = flume::unbounded();
        let player = Player::new(
            GuildId::from("g1"),
            test_node(),
            Weak::new(),
            Arc::new(NullSender),
            PlayerOptions::default(),
            tx,
        );
        (player, rx)
    }

    fn track(id: &str, seekable: bool) -> Track {
        Track {
            encoded: id.to_string(),
            info: TrackInfo {
                identifier: id.to_string(),
                title: id.to_string(),
                is_seekable: seekable,
                length: 60_000,
                source_name: "youtube".to_string(),
                ..Default::default()
            },
            plugin_info: serde_json::json!({}),
            user_data: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_play_rejected_before_handshake() {
        let (player, _rx) = test_player();
        let err = player.play(Some(track("a", true)), PlayOptions::default()).await;
        assert!(matches!(err, Err(Error::WrongState { operation: "play", .. })));
    }

    #[tokio::test]
    async fn test_connect_rejected_in_wrong_state() {
        let (player, _rx) = test_player();
        player.core.lock().await.status = PlayerStatus::Playing;
        let err = player.connect(ChannelId::from("c1")).await;
        assert!(matches!(err, Err(Error::WrongState { operation: "connect", .. })));
    }

    #[tokio::test]
    async fn test_set_volume_clamps_and_dedupes() {
        let (player, _rx) = test_player();
        // Same value as the initial 100: no node contact, immediate Ok.
        assert!(player.set_volume(100).await.is_ok());
        assert_eq!(player.volume().await, 100);

        // A new value needs a ready node, which this test node is not.
        assert!(matches!(
            player.set_volume(50).await,
            Err(Error::NodeNotReady(_))
        ));

        // Clamp makes 9999 the same as 1000.
        player.core.lock().await.volume = 1000;
        assert!(player.set_volume(9999).await.is_ok());
        assert_eq!(player.volume().await, 1000);
    }

    #[tokio::test]
    async fn test_pause_is_idempotent_without_node_traffic() {
        let (player, _rx) = test_player();
        // Already unpaused: no current track needed, no REST issued.
        assert!(player.pause(false).await.is_ok());

        // Changing the value without a track is a precondition error.
        assert!(matches!(
            player.pause(true).await,
            Err(Error::NoCurrentTrack(_))
        ));
    }

    #[tokio::test]
    async fn test_seek_requires_seekable_current() {
        let (player, _rx) = test_player();
        assert!(matches!(
            player.seek(1000).await,
            Err(Error::NoCurrentTrack(_))
        ));

        player
            .with_queue(|queue| queue.advance_to(Some(track("live", false))))
            .await;
        assert!(matches!(player.seek(1000).await, Err(Error::NotSeekable(_))));
    }

    #[tokio::test]
    async fn test_voice_state_transitions_connecting_to_waiting() {
        let (player, _rx) = test_player();
        {
            let mut core = player.core.lock().await;
            core.status = PlayerStatus::Connecting;
            let (tx, _rx_connect) = oneshot::channel();
            core.pending_connect = Some(PendingConnect {
                target: ChannelId::from("c1"),
                resolver: tx,
            });
        }

        player
            .handle_voice_state("vs".to_string(), ChannelId::from("c1"))
            .await;
        assert_eq!(player.status().await, PlayerStatus::WaitingForServer);
    }

    #[tokio::test]
    async fn test_voice_state_for_other_channel_does_not_advance() {
        let (player, _rx) = test_player();
        {
            let mut core = player.core.lock().await;
            core.status = PlayerStatus::Connecting;
            let (tx, _rx_connect) = oneshot::channel();
            core.pending_connect = Some(PendingConnect {
                target: ChannelId::from("c1"),
                resolver: tx,
            });
        }

        player
            .handle_voice_state("vs".to_string(), ChannelId::from("other"))
            .await;
        assert_eq!(player.status().await, PlayerStatus::Connecting);
    }

    #[tokio::test]
    async fn test_destroy_rejects_pending_connect() {
        let (player, rx) = test_player();
        let (tx, connect_rx) = oneshot::channel();
        {
            let mut core = player.core.lock().await;
            core.status = PlayerStatus::Connecting;
            core.pending_connect = Some(PendingConnect {
                target: ChannelId::from("c1"),
                resolver: tx,
            });
        }

        player.destroy().await;
        assert!(player.is_destroyed());
        assert_eq!(player.status().await, PlayerStatus::Destroyed);

        let result = connect_rx.await.unwrap();
        assert!(matches!(result, Err(Error::PlayerDestroyed(_))));

        // Events after destroy are discarded.
        player
            .handle_player_update(PlayerState {
                time: 0,
                position: 5,
                connected: true,
                ping: 1,
            })
            .await;

        let events: Vec<_> = rx.drain().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, ClientEvent::PlayerDestroy { .. })));
        assert!(!events
            .iter()
            .any(|e| matches!(e, ClientEvent::PlayerStateUpdate { .. })));
    }

    #[tokio::test]
    async fn test_commands_fail_after_destroy() {
        let (player, _rx) = test_player();
        player.destroy().await;
        assert!(matches!(
            player.play(None, PlayOptions::default()).await,
            Err(Error::PlayerDestroyed(_))
        ));
        assert!(matches!(
            player.connect(ChannelId::from("c")).await,
            Err(Error::PlayerDestroyed(_))
        ));
    }

    #[tokio::test]
    async fn test_track_start_event_moves_to_playing() {
        let (player, rx) = test_player();
        {
            let mut core = player.core.lock().await;
            core.status = PlayerStatus::Stopped;
            core.queue.advance_to(Some(track("a", true)));
        }

        player
            .handle_node_event(NodeEvent::TrackStart {
                guild_id: GuildId::from("g1"),
                track: track("a", true),
            })
            .await;

        assert_eq!(player.status().await, PlayerStatus::Playing);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ClientEvent::TrackStart { .. }
        ));
    }

    #[tokio::test]
    async fn test_position_estimate_frozen_unless_playing() {
        let (player, _rx) = test_player();
        {
            let mut core = player.core.lock().await;
            core.status = PlayerStatus::Paused;
            core.queue.advance_to(Some(track("a", true)));
            core.last_position = 30_000;
            core.position_stamp = Some(Instant::now() - Duration::from_secs(5));
        }
        assert_eq!(player.current_position().await, 30_000);

        player.core.lock().await.status = PlayerStatus::Playing;
        let estimated = player.current_position().await;
        assert!(estimated >= 35_000, "clock advances while playing");
        assert!(estimated <= 60_000, "clamped to track length");
    }

    #[tokio::test]
    async fn test_fatal_voice_close_destroys_player() {
        let (player, rx) = test_player();
        player.core.lock().await.status = PlayerStatus::Playing;

        player
            .handle_node_event(NodeEvent::WebSocketClosed {
                guild_id: GuildId::from("g1"),
                code: 4014,
                reason: "Disconnected.".to_string(),
                by_remote: true,
            })
            .await;

        assert!(player.is_destroyed());
        let events: Vec<_> = rx.drain().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, ClientEvent::PlayerWebsocketClosed { code: 4014, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ClientEvent::PlayerDestroy { .. })));
    }

    #[tokio::test]
    async fn test_nonfatal_voice_close_keeps_player() {
        let (player, _rx) = test_player();
        player.core.lock().await.status = PlayerStatus::Playing;

        player
            .handle_node_event(NodeEvent::WebSocketClosed {
                guild_id: GuildId::from("g1"),
                code: 4000,
                reason: "Unknown error".to_string(),
                by_remote: true,
            })
            .await;

        assert!(!player.is_destroyed());
        assert_eq!(player.status().await, PlayerStatus::DisconnectedLavalink);
    }

    #[tokio::test]
    async fn test_track_end_finished_pushes_history_and_ends_queue() {
        let (player, rx) = test_player();
        {
            let mut core = player.core.lock().await;
            core.status = PlayerStatus::Playing;
            core.playing = true;
            core.queue.advance_to(Some(track("a", true)));
        }

        player
            .handle_node_event(NodeEvent::TrackEnd {
                guild_id: GuildId::from("g1"),
                track: track("a", true),
                reason: TrackEndReason::Finished,
            })
            .await;

        assert_eq!(player.status().await, PlayerStatus::Stopped);
        let history: Vec<_> = player
            .with_queue(|q| q.history().map(|t| t.encoded.clone()).collect())
            .await;
        assert_eq!(history, ["a"]);

        let events: Vec<_> = rx.drain().collect();
        assert!(events.iter().any(|e| matches!(e, ClientEvent::TrackEnd { .. })));
        assert!(events.iter().any(|e| matches!(e, ClientEvent::QueueEnd { .. })));
    }

    #[tokio::test]
    async fn test_track_end_replaced_leaves_current_alone() {
        let (player, rx) = test_player();
        {
            let mut core = player.core.lock().await;
            core.status = PlayerStatus::Playing;
            core.playing = true;
            core.queue.advance_to(Some(track("b", true)));
        }

        player
            .handle_node_event(NodeEvent::TrackEnd {
                guild_id: GuildId::from("g1"),
                track: track("a", true),
                reason: TrackEndReason::Replaced,
            })
            .await;

        // The replacement play drives the state; nothing is reset here.
        assert_eq!(player.status().await, PlayerStatus::Playing);
        assert_eq!(player.current_track().await.unwrap().encoded, "b");

        let events: Vec<_> = rx.drain().collect();
        assert!(events.iter().any(|e| matches!(e, ClientEvent::TrackEnd { .. })));
        assert!(!events.iter().any(|e| matches!(e, ClientEvent::QueueEnd { .. })));
    }

    #[tokio::test]
    async fn test_move_to_same_node_is_rejected() {
        let (player, _rx) = test_player();
        let node = player.node().await;
        assert!(matches!(
            player.move_to_node(node).await,
            Err(Error::SameNode(_))
        ));
    }

    #[tokio::test]
    async fn test_move_to_unready_node_is_rejected() {
        let (player, _rx) = test_player();
        let (tx, _rx2) = flume::unbounded();
        let user_id = Arc::new(OnceLock::new());
        let _ = user_id.set(UserId(1));
        let other = Arc::new(
            Node::new(
                NodeOptions {
                    identifier: "other".to_string(),
                    host: "localhost".to_string(),
                    port: 2444,
                    secure: false,
                    password: "pw".to_string(),
                    resume_key: None,
                    resume_timeout_secs: 60,
                    retry_amount: 1,
                    reconnect: ReconnectPolicy::default(),
                },
                user_id,
                tx,
            )
            .unwrap(),
        );
        assert!(matches!(
            player.move_to_node(other).await,
            Err(Error::NodeNotReady(_))
        ));
    }
}
