//! Server Loop
//!
//! The authoritative simulation. Once per fixed tick the server claims a
//! new session slot (copying the previous one), drains every pending client
//! command into it, steps entities and the mode, sends each client its own
//! copy of the result, and clears single-tick state.
//!
//! Per tick:
//!
//! ```text
//! claim slot ── settings ── stamp ── pre_tick ── drain commands
//!     ── timeouts/pings ── entities ── mode.modify ── post_tick ── send
//!     ── clear single-tick + override flags
//! ```
//!
//! Player slots are bound to connections by the first message a new peer
//! sends; the lowest free id wins. A command is stepped only when its
//! client tick is ahead of the last one stepped for that player.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::core::history::History;
use crate::core::snapshot::{FieldRead, FieldWrite, Snapshot, SnapshotRef};
use crate::core::ticker::{TickStep, Ticker};
use crate::game::clock::{self, ClockUpdate};
use crate::game::interpolate::{find_bracket, interpolate_into};
use crate::game::standard::{StandardSchemas, MAX_USERNAME_LEN};
use crate::game::stepper::{Commands, SessionSystems, TickContext};
use crate::game::trust;
use crate::network::config::{ConfigError, SessionConfig};
use crate::network::protocol::{
    decode_into, encode_compressed, encode_snapshot, ClientMessage, ProtocolError, ServerMessage,
};
use crate::network::transport::{PeerId, ServerEvent, ServerTransport, TransportError};

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration rejected.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// `mode_id` has no registered mode.
    #[error("no mode registered with id {0}")]
    UnknownMode(u8),

    /// Session schemas do not match the configured sizes.
    #[error("schemas built for {schemas} players, config says {config}")]
    SizeMismatch {
        /// Player slots in the schemas
        schemas: usize,
        /// Player slots in the config
        config: usize,
    },

    /// Message could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Loading gates simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    /// Content still loading; commands are dropped.
    Loading,
    /// Simulating.
    Running,
}

/// Counters for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Ticks simulated.
    pub ticks: u64,
    /// Player clocks snapped back after drifting.
    pub reset_errors: u64,
    /// Commands dropped as stale or duplicate.
    pub dropped_commands: u64,
    /// Modifier or mode steps that returned an error.
    pub modifier_errors: u64,
    /// Players dropped for not sending commands.
    pub timeouts: u64,
    /// Graceful disconnects that had to be forced.
    pub forced_disconnects: u64,
}

#[derive(Debug, Default)]
struct PeerState {
    player_id: Option<u8>,
    username: Option<String>,
    acknowledged_tick: Option<u32>,
}

/// Authoritative server loop.
pub struct ServerLoop<T> {
    config: SessionConfig,
    systems: SessionSystems,
    schemas: Arc<StandardSchemas>,
    transport: T,
    state: ServerState,
    history: History<Snapshot>,
    send_buffer: Snapshot,
    rollback: Snapshot,
    incoming: Commands,
    debug_view: Snapshot,
    peers: BTreeMap<PeerId, PeerState>,
    stats: ServerStats,
}

impl<T: ServerTransport> ServerLoop<T> {
    /// Create a loop in the `Loading` state.
    pub fn new(config: SessionConfig, systems: SessionSystems, transport: T) -> Result<Self, ServerError> {
        config.validate()?;
        if !systems.modes.contains(config.mode_id) {
            return Err(ServerError::UnknownMode(config.mode_id));
        }
        let schemas = Arc::clone(&systems.schemas);
        if schemas.max_players != config.max_players {
            return Err(ServerError::SizeMismatch { schemas: schemas.max_players, config: config.max_players });
        }
        let session = Arc::clone(&schemas.session);
        info!(
            tick_rate = config.tick_rate_hz,
            max_players = config.max_players,
            history = config.history_count,
            mode_id = config.mode_id,
            "Server loop created"
        );
        Ok(Self {
            history: History::new(config.history_count, || Snapshot::new(&session)),
            send_buffer: Snapshot::new(&session),
            rollback: Snapshot::new(&session),
            incoming: Commands::standard(&schemas),
            debug_view: Snapshot::new(&schemas.player),
            config,
            systems,
            schemas,
            transport,
            state: ServerState::Loading,
            peers: BTreeMap::new(),
            stats: ServerStats::default(),
        })
    }

    /// Content is loaded; start simulating on the next tick.
    pub fn set_ready(&mut self) {
        if self.state == ServerState::Loading {
            info!("Server running");
            self.state = ServerState::Running;
        }
    }

    /// Current state.
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Counters.
    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    /// Latest committed session.
    pub fn session(&self) -> SnapshotRef<'_> {
        self.history.peek().view()
    }

    /// Session history.
    pub fn history(&self) -> &History<Snapshot> {
        &self.history
    }

    /// Player slot bound to a connection.
    pub fn player_id_of(&self, peer: PeerId) -> Option<u8> {
        self.peers.get(&peer).and_then(|p| p.player_id)
    }

    /// Number of joined players.
    pub fn player_count(&self) -> usize {
        self.peers.values().filter(|p| p.player_id.is_some()).count()
    }

    /// Last client debug view received.
    pub fn debug_view(&self) -> SnapshotRef<'_> {
        self.debug_view.view()
    }

    /// Transport, for driving it directly.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn context(&self, step: TickStep) -> TickContext {
        TickContext {
            tick: step.tick,
            time_us: step.time_us,
            duration_us: step.duration_us,
            tick_interval_us: self.config.tick_interval_us(),
        }
    }

    // =========================================================================
    // TICK
    // =========================================================================

    /// Run one fixed tick.
    pub fn tick(&mut self, step: TickStep) {
        let ctx = self.context(step);
        if self.state == ServerState::Loading {
            self.drain_while_loading(&ctx);
            return;
        }

        self.begin_tick(&ctx);
        {
            let mut session = self.history.peek_mut().view_mut();
            if let Some(mode) = self.systems.modes.get_mut(self.config.mode_id) {
                mode.pre_tick(&ctx, &mut session);
            }
        }

        self.drain_transport(&ctx);
        self.check_players(&ctx);

        {
            let mut session = self.history.peek_mut().view_mut();
            let active = self.systems.entities.modify_all(&ctx, &mut session);
            if let Some(mode) = self.systems.modes.get_mut(self.config.mode_id) {
                mode.modify(&ctx, &mut session);
            }
            #[cfg(feature = "debug-tracing")]
            debug!(tick = ctx.tick, active, "Entities stepped");
            #[cfg(not(feature = "debug-tracing"))]
            let _ = active;
            if let Some(mode) = self.systems.modes.get_mut(self.config.mode_id) {
                mode.post_tick(&ctx, &mut session);
            }
        }

        // history entries double as compression baselines, so nothing but
        // the single-tick and override clear may touch the slot after this
        self.send_sessions(&ctx);

        trust::end_of_tick(&mut self.history.peek_mut().view_mut());
        self.stats.ticks += 1;
    }

    /// Claim the next slot, copy the previous one in, apply settings and stamp.
    fn begin_tick(&mut self, ctx: &TickContext) {
        let ids = &self.schemas.session_ids;
        let (previous, current) = self.history.claim_next_with_previous();
        if let Some(previous) = previous {
            current.copy_from(previous.view());
        }
        current.set_u16(ids.tick_rate, self.config.tick_rate_hz);
        current.set_u8(ids.mode_id, self.config.mode_id);
        current.set_u32(ids.server_stamp.tick, ctx.tick);
        current.set_u64(ids.server_stamp.time_us, ctx.time_us);
        current.set_u32(ids.server_stamp.duration_us, ctx.duration_us);
    }

    fn drain_while_loading(&mut self, ctx: &TickContext) {
        while let Some(event) = self.transport.poll() {
            match event {
                ServerEvent::Connected(peer) => {
                    info!(peer, "Peer connected while loading");
                    self.peers.insert(peer, PeerState::default());
                }
                ServerEvent::Disconnected(peer) => {
                    self.peers.remove(&peer);
                }
                ServerEvent::Malformed(peer, e) => {
                    warn!(peer, error = %e, "Malformed message");
                    self.disconnect(peer, "malformed message");
                }
                ServerEvent::Message(peer, ClientMessage::Join { username }) => {
                    self.peers.entry(peer).or_default().username = Some(username);
                }
                ServerEvent::Message(peer, _) => {
                    debug!(peer, tick = ctx.tick, "Dropping message while loading");
                }
            }
        }
    }

    fn drain_transport(&mut self, ctx: &TickContext) {
        while let Some(event) = self.transport.poll() {
            match event {
                ServerEvent::Connected(peer) => {
                    info!(peer, "Peer connected");
                    self.peers.insert(peer, PeerState::default());
                }
                ServerEvent::Disconnected(peer) => {
                    info!(peer, "Peer closed connection");
                    self.remove_peer(peer);
                }
                ServerEvent::Malformed(peer, e) => {
                    warn!(peer, error = %e, "Malformed message");
                    self.disconnect(peer, "malformed message");
                }
                ServerEvent::Message(peer, message) => self.handle_message(ctx, peer, message),
            }
        }
    }

    fn handle_message(&mut self, ctx: &TickContext, peer: PeerId, message: ClientMessage) {
        match message {
            ClientMessage::Join { username } => {
                let mut username = username;
                truncate_utf8(&mut username, MAX_USERNAME_LEN);
                self.peers.entry(peer).or_default().username = Some(username);
            }
            ClientMessage::Commands { player, input } => {
                let decoded = decode_into(&player, &mut self.incoming.player.view_mut())
                    .and_then(|_| decode_into(&input, &mut self.incoming.input.view_mut()));
                if let Err(e) = decoded {
                    warn!(peer, error = %e, "Undecodable command");
                    self.disconnect(peer, "invalid command");
                    return;
                }
                let Some(player_id) = self.ensure_player(ctx, peer) else {
                    return;
                };
                let ack = self.incoming.input.get_u32(self.schemas.input_ids.acknowledged_server_tick);
                if let Some(state) = self.peers.get_mut(&peer) {
                    state.acknowledged_tick = ack.or(state.acknowledged_tick);
                }
                self.handle_client_command(ctx, player_id);
            }
            ClientMessage::PingCheck { tick } => self.handle_ping(ctx, peer, tick),
            ClientMessage::DebugView { player } => match decode_into(&player, &mut self.debug_view.view_mut()) {
                Ok(()) => debug!(peer, view = ?self.debug_view.view(), "Client debug view"),
                Err(e) => warn!(peer, error = %e, "Undecodable debug view"),
            },
        }
    }

    /// Step one player with the command in `self.incoming`.
    fn handle_client_command(&mut self, ctx: &TickContext, player_id: u8) {
        let ids = &self.schemas.player_ids;
        let stamp = ids.client_stamp;
        let commands = &self.incoming;
        let mut session = self.history.peek_mut().view_mut();

        let step = {
            let mut player = session.element_mut(self.schemas.session_ids.players, player_id as usize);

            // not predicting yet: keep the player alive
            let Some(tick) = commands.player.get_u32(stamp.tick) else {
                player.set_u64(ids.server_stamp.time_us, ctx.time_us);
                return;
            };
            let Some(last) = player.get_u32(stamp.tick) else {
                player.sub_mut(stamp.root).merge_from(commands.player.view().sub(stamp.root));
                player.set_u64(ids.server_stamp.time_us, ctx.time_us);
                debug!(player_id, tick, "Seeded client stamp");
                return;
            };
            let delta = clock::tick_delta(Some(tick), Some(last)).unwrap_or(0);
            if delta < 1 {
                warn!(player_id, tick, last, "Dropping stale command");
                self.stats.dropped_commands += 1;
                return;
            }

            let sent = commands.player.get_u64(stamp.time_us).unwrap_or(0);
            let before = player.get_u64(stamp.time_us).unwrap_or(sent);
            let (tracked, update) = clock::localize(
                player.get_u64(ids.server_stamp.time_us),
                sent as i64 - before as i64,
                ctx.time_us,
                self.config.drift_tolerance_us(),
            );
            if let ClockUpdate::Snapped { drift_us } = update {
                self.stats.reset_errors += 1;
                warn!(player_id, drift_us, "Client clock drifted, snapping");
            }
            player.set_u64(ids.server_stamp.time_us, tracked);

            trust::merge_client_trusted(&mut player, commands.player.view());
            player.sub_mut(stamp.root).merge_from(commands.player.view().sub(stamp.root));

            let step = ctx.step(player_id, commands.player.get_u32(stamp.duration_us).unwrap_or(0));
            if let Err(e) = self.systems.modifier.modify_checked(&step, &mut player, commands) {
                self.stats.modifier_errors += 1;
                error!(player_id, error = %e, "Player step failed");
            }
            step
        };

        if let Some(mode) = self.systems.modes.get_mut(self.config.mode_id) {
            if let Err(e) = mode.modify_player(&step, &mut session, commands) {
                self.stats.modifier_errors += 1;
                error!(player_id, error = %e, "Mode player step failed");
            }
        }
    }

    // =========================================================================
    // PLAYERS
    // =========================================================================

    /// Player bound to `peer`, allocating the lowest free slot on first use.
    fn ensure_player(&mut self, ctx: &TickContext, peer: PeerId) -> Option<u8> {
        if let Some(id) = self.player_id_of(peer) {
            return Some(id);
        }
        let taken: BTreeSet<u8> = self.peers.values().filter_map(|p| p.player_id).collect();
        let Some(player_id) = (0..self.schemas.max_players as u8).find(|id| !taken.contains(id)) else {
            warn!(peer, "Session full");
            self.disconnect(peer, "session full");
            return None;
        };
        let state = self.peers.entry(peer).or_default();
        state.player_id = Some(player_id);
        let username = state.username.clone().unwrap_or_else(|| format!("player{player_id}"));
        self.setup_new_player(ctx, player_id, &username);
        info!(peer, player_id, %username, "Player joined");
        Some(player_id)
    }

    fn setup_new_player(&mut self, ctx: &TickContext, player_id: u8, username: &str) {
        let ids = &self.schemas.player_ids;
        let players = self.schemas.session_ids.players;
        let mut session = self.history.peek_mut().view_mut();
        {
            let mut player = session.element_mut(players, player_id as usize);
            player.zero();
            player.sub_mut(ids.client_stamp.root).clear();
            player.set_u32(ids.server_stamp.tick, ctx.tick);
            player.set_u64(ids.server_stamp.time_us, ctx.time_us);
            player.set_str(ids.username, username);
        }
        if let Some(mode) = self.systems.modes.get_mut(self.config.mode_id) {
            mode.setup_new_player(ctx, &mut session, player_id);
        }
        self.systems.modifier.synchronize(player_id, session.as_ref().element(players, player_id as usize));
    }

    /// Timeouts and ping checks.
    fn check_players(&mut self, ctx: &TickContext) {
        let ids = &self.schemas.player_ids;
        let players = self.schemas.session_ids.players;
        let mut timed_out = Vec::new();
        let mut pings = Vec::new();
        {
            let mut session = self.history.peek_mut().view_mut();
            for (peer, state) in &self.peers {
                let Some(player_id) = state.player_id else {
                    continue;
                };
                let mut player = session.element_mut(players, player_id as usize);
                if let Some(tracked) = player.get_u64(ids.server_stamp.time_us) {
                    if tracked.abs_diff(ctx.time_us) > self.config.player_timeout_us {
                        timed_out.push(*peer);
                        continue;
                    }
                }
                let elapsed = player.get_u32(ids.ping_elapsed_us).unwrap_or(0).saturating_add(ctx.duration_us);
                if elapsed as u64 >= self.config.ping_interval_us {
                    player.set_u32(ids.ping_elapsed_us, 0);
                    player.set_u32(ids.ping_check_tick, ctx.tick);
                    player.set_u64(ids.ping_check_time_us, ctx.time_us);
                    pings.push(*peer);
                } else {
                    player.set_u32(ids.ping_elapsed_us, elapsed);
                }
            }
        }

        for peer in pings {
            if let Err(e) = self.transport.send(peer, &ServerMessage::PingCheck { tick: ctx.tick }) {
                debug!(peer, error = %e, "Ping check not sent");
            }
        }
        for peer in timed_out {
            self.stats.timeouts += 1;
            warn!(peer, player_id = ?self.player_id_of(peer), "Player timed out");
            self.disconnect(peer, "timed out");
        }
    }

    fn handle_ping(&mut self, ctx: &TickContext, peer: PeerId, tick: u32) {
        let Some(player_id) = self.player_id_of(peer) else {
            return;
        };
        let ids = &self.schemas.player_ids;
        let mut session = self.history.peek_mut().view_mut();
        let mut player = session.element_mut(self.schemas.session_ids.players, player_id as usize);
        if player.get_u32(ids.ping_check_tick) != Some(tick) {
            debug!(player_id, tick, "Ignoring stale ping check");
            return;
        }
        let rtt_us = ctx.time_us.saturating_sub(player.get_u64(ids.ping_check_time_us).unwrap_or(ctx.time_us));
        let latency_us = rtt_us / 2;
        player.set_u32(ids.rtt_us, rtt_us.min(u32::MAX as u64) as u32);
        player.set_u32(ids.latency_us, latency_us.min(u32::MAX as u64) as u32);
        player.set_u16(ids.ping_ms, (latency_us / 1_000).min(u16::MAX as u64) as u16);
        debug!(player_id, rtt_us, "Ping");
    }

    // =========================================================================
    // SEND
    // =========================================================================

    /// Send every joined peer its own copy of the latest session.
    fn send_sessions(&mut self, ctx: &TickContext) {
        let ids = &self.schemas.player_ids;
        let session_ids = &self.schemas.session_ids;
        let stamp_tick = session_ids.server_stamp.tick;
        let targets: Vec<(PeerId, u8, Option<u32>)> = self
            .peers
            .iter()
            .filter_map(|(peer, state)| state.player_id.map(|id| (*peer, id, state.acknowledged_tick)))
            .collect();

        let mut failed = Vec::new();
        for (peer, player_id, acknowledged) in targets {
            let initial = {
                let mut session = self.history.peek_mut().view_mut();
                let mut player = session.element_mut(session_ids.players, player_id as usize);
                if !player.has(ids.health) {
                    continue;
                }
                let initial = player.has(ids.client_stamp.tick) && player.get_bool(ids.has_sent_initial_data) != Some(true);
                if initial {
                    player.set_bool(ids.has_sent_initial_data, true);
                }
                initial
            };

            self.send_buffer.copy_from(self.history.peek().view());
            self.send_buffer.set_u8(session_ids.local_player_id, player_id);
            if initial {
                if let Some(mode) = self.systems.modes.get_mut(self.config.mode_id) {
                    mode.on_send_initial_data(player_id, &mut self.send_buffer.view_mut());
                }
                info!(peer, player_id, tick = ctx.tick, "Sending initial data");
            }

            let baseline = match acknowledged {
                Some(tick) if self.config.compress_sessions && !initial => self
                    .history
                    .position_newest(|s| s.get_u32(stamp_tick) == Some(tick))
                    .filter(|offset| *offset < 0)
                    .map(|offset| (tick, offset)),
                _ => None,
            };
            let (snapshot, baseline_tick) = match baseline {
                Some((tick, offset)) => {
                    (encode_compressed(self.send_buffer.view(), self.history.get(offset).view()), Some(tick))
                }
                None => (encode_snapshot(self.send_buffer.view()), None),
            };

            if let Err(e) = self.transport.send(peer, &ServerMessage::Session { snapshot, baseline_tick }) {
                warn!(peer, player_id, error = %e, "Session send failed");
                failed.push(peer);
            }
        }
        for peer in failed {
            self.disconnect(peer, "send failed");
        }
    }

    // =========================================================================
    // DISCONNECT
    // =========================================================================

    /// Close a connection, forcing it if the graceful path fails.
    pub fn disconnect(&mut self, peer: PeerId, reason: &str) {
        match self.transport.disconnect(peer, reason) {
            Ok(()) => info!(peer, reason, "Disconnected peer"),
            Err(e) => {
                error!(peer, reason, error = %e, "Graceful disconnect failed, forcing");
                self.transport.force_disconnect(peer);
                self.stats.forced_disconnects += 1;
            }
        }
        self.remove_peer(peer);
    }

    /// Forget a connection and free its player slot.
    fn remove_peer(&mut self, peer: PeerId) {
        let Some(state) = self.peers.remove(&peer) else {
            return;
        };
        let Some(player_id) = state.player_id else {
            return;
        };
        let players = self.schemas.session_ids.players;
        let mut session = self.history.peek_mut().view_mut();
        let mut player = session.element_mut(players, player_id as usize);
        player.clear();
        self.systems.modifier.synchronize(player_id, player.as_ref());
        info!(peer, player_id, "Player left");
    }

    /// Disconnect everyone.
    pub fn shutdown(&mut self, reason: &str) {
        let peers: Vec<PeerId> = self.peers.keys().copied().collect();
        for peer in peers {
            self.disconnect(peer, reason);
        }
    }

    // =========================================================================
    // ROLLBACK
    // =========================================================================

    /// The session as `player_id` saw it when acting on the latest tick.
    ///
    /// Interpolated from history at `latest - (render interval x rollback
    /// ticks + player latency)`. `None` when no committed session has a time.
    pub fn rollback_session(&mut self, player_id: u8) -> Option<SnapshotRef<'_>> {
        let time_id = self.schemas.session_ids.server_stamp.time_us;
        let latest = self.history.peek().view();
        let now = latest.get_u64(time_id)?;
        let latency = if (player_id as usize) < self.schemas.max_players {
            self.schemas.player_of(latest, player_id).get_u32(self.schemas.player_ids.latency_us).unwrap_or(0)
        } else {
            0
        };
        let window = self.config.player_render_interval_us() * self.config.rollback_interval_ticks as u64 + latency as u64;
        let target = now.saturating_sub(window);

        let bracket = find_bracket(&self.history, target, |s| s.get_u64(time_id))?;
        interpolate_into(
            &mut self.rollback.view_mut(),
            self.history.get(bracket.older).view(),
            self.history.get(bracket.newer).view(),
            bracket.fraction,
        );
        Some(self.rollback.view())
    }

    // =========================================================================
    // RUN
    // =========================================================================

    /// Drive ticks from the tokio clock until `shutdown` fires.
    #[instrument(skip_all, name = "server")]
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> ServerStats {
        let interval_us = self.config.tick_interval_us();
        let mut ticks = interval(Duration::from_micros(interval_us as u64));
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticker = Ticker::with_interval(interval_us);
        let origin = Instant::now();
        info!(interval_us, "Server loop started");

        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    let now_us = origin.elapsed().as_micros() as u64;
                    for step in ticker.advance(now_us) {
                        self.tick(step);
                    }
                }
                _ = shutdown.recv() => {
                    info!(ticks = self.stats.ticks, "Server loop stopping");
                    break;
                }
            }
        }
        self.shutdown("server shutting down");
        self.stats
    }
}

impl<T> std::fmt::Debug for ServerLoop<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerLoop")
            .field("state", &self.state)
            .field("peers", &self.peers.len())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Cut a string to at most `max` bytes on a char boundary.
fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::FieldId;
    use crate::game::deathmatch::{Deathmatch, DEATHMATCH_ID};
    use crate::game::movement::MovementModifier;
    use crate::game::throwables::Grenades;
    use crate::network::protocol::WireSnapshot;
    use crate::network::transport::{loopback, ClientEvent, ClientTransport, LoopbackClient, LoopbackServer};
    use crate::core::snapshot::SnapshotMut;
    use crate::game::stepper::{Mode, ModifierError, PlayerModifier, StepContext};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const INTERVAL: u32 = 16_666;

    fn step(tick: u32) -> TickStep {
        TickStep { tick, time_us: tick as u64 * INTERVAL as u64, duration_us: INTERVAL }
    }

    fn config() -> SessionConfig {
        SessionConfig { max_players: 2, max_entities: 4, history_count: 32, ..SessionConfig::default() }
    }

    fn server_with(config: SessionConfig) -> (ServerLoop<LoopbackServer>, crate::network::transport::LoopbackConnector) {
        let schemas = StandardSchemas::new(config.max_players, config.max_entities);
        let mut systems = SessionSystems::new(Arc::clone(&schemas), Box::new(MovementModifier::new(Arc::clone(&schemas))));
        systems.modes.register(Box::new(Deathmatch::new(Arc::clone(&schemas), "test")));
        systems.entities.register(Box::new(Grenades::new(Arc::clone(&schemas))));
        server_with_systems(config, systems)
    }

    fn server_with_systems(
        config: SessionConfig,
        systems: SessionSystems,
    ) -> (ServerLoop<LoopbackServer>, crate::network::transport::LoopbackConnector) {
        let (transport, connector) = loopback();
        let mut server = ServerLoop::new(config, systems, transport).unwrap();
        server.set_ready();
        (server, connector)
    }

    fn commands(schemas: &StandardSchemas, stamp: Option<(u32, u64, u32)>) -> Commands {
        let mut commands = Commands::standard(schemas);
        if let Some((tick, time_us, duration_us)) = stamp {
            let ids = schemas.player_ids.client_stamp;
            commands.player.set_u32(ids.tick, tick);
            commands.player.set_u64(ids.time_us, time_us);
            commands.player.set_u32(ids.duration_us, duration_us);
        }
        commands.input.set_f32(schemas.input_ids.move_y, 1.0);
        commands
    }

    fn send(client: &mut LoopbackClient, commands: &Commands) {
        client
            .send(&ClientMessage::Commands {
                player: encode_snapshot(commands.player.view()),
                input: encode_snapshot(commands.input.view()),
            })
            .unwrap();
    }

    fn stamp_tick(server: &ServerLoop<LoopbackServer>, id: u8) -> Option<u32> {
        let schemas = &server.schemas;
        schemas.player_of(server.session(), id).get_u32(schemas.player_ids.client_stamp.tick)
    }

    fn last_session(client: &mut LoopbackClient) -> Option<WireSnapshot> {
        let mut last = None;
        while let Some(event) = client.poll() {
            if let ClientEvent::Message(ServerMessage::Session { snapshot, .. }) = event {
                last = Some(snapshot);
            }
        }
        last
    }

    #[test]
    fn test_rejects_unknown_mode() {
        let schemas = StandardSchemas::new(2, 4);
        let systems = SessionSystems::new(Arc::clone(&schemas), Box::new(MovementModifier::new(Arc::clone(&schemas))));
        let (transport, _connector) = loopback();
        let err = ServerLoop::new(config(), systems, transport).unwrap_err();
        assert!(matches!(err, ServerError::UnknownMode(DEATHMATCH_ID)));
    }

    #[test]
    fn test_loading_drops_commands() {
        let (mut server, connector) = server_with(config());
        server.state = ServerState::Loading;
        let mut client = connector.connect().unwrap();
        send(&mut client, &commands(&server.schemas, None));
        server.tick(step(0));
        assert_eq!(server.player_count(), 0);
        assert_eq!(server.stats().ticks, 0);
    }

    #[test]
    fn test_first_command_allocates_lowest_free_slot() {
        let (mut server, connector) = server_with(config());
        let schemas = Arc::clone(&server.schemas);
        let mut a = connector.connect().unwrap();
        let mut b = connector.connect().unwrap();
        send(&mut a, &commands(&schemas, None));
        send(&mut b, &commands(&schemas, None));
        server.tick(step(0));
        assert_eq!(server.player_id_of(a.peer_id()), Some(0));
        assert_eq!(server.player_id_of(b.peer_id()), Some(1));

        // new player starts with health and no client stamp
        let player = schemas.player_of(server.session(), 1);
        assert_eq!(player.get_u8(schemas.player_ids.health), Some(100));
        assert_eq!(stamp_tick(&server, 1), None);
        assert_eq!(player.get_str(schemas.player_ids.username), Some("player1"));

        // slot 0 frees up and is reused
        a.close();
        server.tick(step(1));
        assert!(!schemas.player_of(server.session(), 0).has(schemas.player_ids.health));
        let mut c = connector.connect().unwrap();
        send(&mut c, &commands(&schemas, None));
        server.tick(step(2));
        assert_eq!(server.player_id_of(c.peer_id()), Some(0));
    }

    #[test]
    fn test_session_full_disconnects() {
        let (mut server, connector) = server_with(config());
        let schemas = Arc::clone(&server.schemas);
        let mut clients: Vec<_> = (0..3).map(|_| connector.connect().unwrap()).collect();
        for client in &mut clients {
            send(client, &commands(&schemas, None));
        }
        server.tick(step(0));
        assert_eq!(server.player_count(), 2);
        let rejected = &mut clients[2];
        let mut reason = None;
        while let Some(event) = rejected.poll() {
            if let ClientEvent::Message(ServerMessage::Disconnect { reason: r }) = event {
                reason = Some(r);
            }
        }
        assert_eq!(reason.as_deref(), Some("session full"));
    }

    #[test]
    fn test_seed_then_step() {
        let (mut server, connector) = server_with(config());
        let schemas = Arc::clone(&server.schemas);
        let ids = schemas.player_ids;
        let mut client = connector.connect().unwrap();

        send(&mut client, &commands(&schemas, None));
        server.tick(step(0));
        let spawn = schemas.player_of(server.session(), 0).get_vec3(ids.position).unwrap();

        // first stamped command only seeds
        send(&mut client, &commands(&schemas, Some((10, 1_000_000, 0))));
        server.tick(step(1));
        assert_eq!(stamp_tick(&server, 0), Some(10));
        assert_eq!(schemas.player_of(server.session(), 0).get_vec3(ids.position), Some(spawn));

        // next one steps
        send(&mut client, &commands(&schemas, Some((11, 1_000_000 + INTERVAL as u64, INTERVAL))));
        server.tick(step(2));
        assert_eq!(stamp_tick(&server, 0), Some(11));
        let moved = schemas.player_of(server.session(), 0).get_vec3(ids.position).unwrap();
        assert!(moved.distance(spawn) > 0.05);
        assert_eq!(server.stats().reset_errors, 0);
    }

    #[test]
    fn test_out_of_order_command_dropped() {
        let (mut server, connector) = server_with(config());
        let schemas = Arc::clone(&server.schemas);
        let ids = schemas.player_ids;
        let mut client = connector.connect().unwrap();
        send(&mut client, &commands(&schemas, None));
        server.tick(step(0));

        let at = |tick: u32| Some((tick, tick as u64 * INTERVAL as u64, INTERVAL));
        send(&mut client, &commands(&schemas, at(9)));
        server.tick(step(1));

        send(&mut client, &commands(&schemas, at(10)));
        send(&mut client, &commands(&schemas, at(12)));
        send(&mut client, &commands(&schemas, at(11)));
        server.tick(step(2));

        assert_eq!(stamp_tick(&server, 0), Some(12));
        assert_eq!(server.stats().dropped_commands, 1);
        // 11 was never applied on top of 12
        let player = schemas.player_of(server.session(), 0);
        assert_eq!(player.get_u64(ids.client_stamp.time_us), Some(12 * INTERVAL as u64));
    }

    #[test]
    fn test_drift_snaps_tracked_time() {
        let (mut server, connector) = server_with(config());
        let schemas = Arc::clone(&server.schemas);
        let ids = schemas.player_ids;
        let mut client = connector.connect().unwrap();
        send(&mut client, &commands(&schemas, None));
        server.tick(step(0));
        send(&mut client, &commands(&schemas, Some((1, 0, 0))));
        server.tick(step(1));

        // client claims four intervals passed in one tick
        send(&mut client, &commands(&schemas, Some((2, 5 * INTERVAL as u64, INTERVAL))));
        server.tick(step(2));
        assert_eq!(server.stats().reset_errors, 1);
        let tracked = schemas.player_of(server.session(), 0).get_u64(ids.server_stamp.time_us);
        assert_eq!(tracked, Some(step(2).time_us));
    }

    #[test]
    fn test_silent_player_times_out() {
        let (mut server, connector) = server_with(SessionConfig { player_timeout_us: 100_000, ..config() });
        let schemas = Arc::clone(&server.schemas);
        let mut client = connector.connect().unwrap();
        send(&mut client, &commands(&schemas, None));
        server.tick(step(0));
        for tick in 1..10 {
            server.tick(step(tick));
        }
        assert_eq!(server.player_count(), 0);
        assert_eq!(server.stats().timeouts, 1);
    }

    #[test]
    fn test_local_player_id_and_initial_data() {
        let (mut server, connector) = server_with(config());
        let schemas = Arc::clone(&server.schemas);
        let mut a = connector.connect().unwrap();
        let mut b = connector.connect().unwrap();
        send(&mut a, &commands(&schemas, None));
        send(&mut b, &commands(&schemas, None));
        server.tick(step(0));

        for (client, expected) in [(&mut a, 0u8), (&mut b, 1u8)] {
            let wire = last_session(client).unwrap();
            let mut received = Snapshot::new(&schemas.session);
            decode_into(&wire, &mut received.view_mut()).unwrap();
            assert_eq!(received.get_u8(schemas.session_ids.local_player_id), Some(expected));
        }

        let initial = |server: &ServerLoop<LoopbackServer>| {
            schemas.player_of(server.session(), 0).get_bool(schemas.player_ids.has_sent_initial_data)
        };
        assert_eq!(initial(&server), Some(false));
        send(&mut a, &commands(&schemas, Some((1, 0, 0))));
        server.tick(step(1));
        assert_eq!(initial(&server), Some(true));
    }

    #[test]
    fn test_single_tick_cleared_after_send() {
        let (mut server, connector) = server_with(config());
        let schemas = Arc::clone(&server.schemas);
        let mut client = connector.connect().unwrap();
        send(&mut client, &commands(&schemas, None));
        server.tick(step(0));
        last_session(&mut client);

        {
            let mut session = server.history.peek_mut().view_mut();
            schemas.apply_damage(&mut session, 1, 0, 10);
        }
        server.tick(step(1));
        // damage set during the previous tick was cleared after that tick's send
        let took: FieldId = schemas.player_ids.took_damage;
        assert!(!schemas.player_of(server.session(), 0).has(took));

        // damage during a tick is sent with it
        server.systems.modes.register(Box::new(HurtMode { schemas: Arc::clone(&schemas) }));
        server.config.mode_id = HurtMode::ID;
        server.tick(step(2));
        let wire = last_session(&mut client).unwrap();
        let mut received = Snapshot::new(&schemas.session);
        decode_into(&wire, &mut received.view_mut()).unwrap();
        assert_eq!(schemas.player_of(received.view(), 0).get_u8(took), Some(5));
        assert!(!schemas.player_of(server.session(), 0).has(took));
    }

    struct HurtMode {
        schemas: Arc<StandardSchemas>,
    }

    impl HurtMode {
        const ID: u8 = 7;
    }

    impl crate::game::stepper::Mode for HurtMode {
        fn id(&self) -> u8 {
            Self::ID
        }

        fn name(&self) -> &'static str {
            "hurt"
        }

        fn modify(&mut self, _ctx: &TickContext, session: &mut crate::core::snapshot::SnapshotMut<'_>) {
            self.schemas.apply_damage(session, 1, 0, 5);
        }
    }

    #[test]
    fn test_ping_round_trip() {
        let (mut server, connector) = server_with(SessionConfig { ping_interval_us: INTERVAL as u64, ..config() });
        let schemas = Arc::clone(&server.schemas);
        let ids = schemas.player_ids;
        let mut client = connector.connect().unwrap();
        send(&mut client, &commands(&schemas, None));
        server.tick(step(0));
        server.tick(step(1));

        let mut check = None;
        while let Some(event) = client.poll() {
            if let ClientEvent::Message(ServerMessage::PingCheck { tick }) = event {
                check = Some(tick);
            }
        }
        let tick = check.unwrap();
        client.send(&ClientMessage::PingCheck { tick }).unwrap();
        send(&mut client, &commands(&schemas, None));
        // ping interval is one tick, so the echo must land before the next check
        server.config.ping_interval_us = u64::MAX;
        server.tick(step(tick + 2));

        let player = schemas.player_of(server.session(), 0);
        assert_eq!(player.get_u32(ids.rtt_us), Some(2 * INTERVAL));
        assert_eq!(player.get_u32(ids.latency_us), Some(INTERVAL));
        assert_eq!(player.get_u16(ids.ping_ms), Some((INTERVAL / 1_000) as u16));
    }

    #[test]
    fn test_rollback_interpolates_history() {
        let (mut server, connector) = server_with(config());
        let schemas = Arc::clone(&server.schemas);
        let mut client = connector.connect().unwrap();
        for tick in 0..10 {
            send(&mut client, &commands(&schemas, None));
            server.tick(step(tick));
        }
        let time_id = schemas.session_ids.server_stamp.time_us;
        let now = server.session().get_u64(time_id).unwrap();
        let window = server.config.player_render_interval_us() * server.config.rollback_interval_ticks as u64;
        let rolled = server.rollback_session(0).unwrap();
        assert_eq!(rolled.get_u64(time_id), Some(now - window));
    }

    #[test]
    fn test_compressed_sessions_reference_acknowledged_tick() {
        let (mut server, connector) = server_with(SessionConfig { compress_sessions: true, ..config() });
        let schemas = Arc::clone(&server.schemas);
        let mut client = connector.connect().unwrap();
        send(&mut client, &commands(&schemas, None));
        server.tick(step(0));
        server.tick(step(1));

        let mut ack = commands(&schemas, None);
        ack.input.set_u32(schemas.input_ids.acknowledged_server_tick, 1);
        while client.poll().is_some() {}
        send(&mut client, &ack);
        server.tick(step(2));

        let mut baseline = None;
        while let Some(event) = client.poll() {
            if let ClientEvent::Message(ServerMessage::Session { baseline_tick, .. }) = event {
                baseline = baseline_tick;
            }
        }
        assert_eq!(baseline, Some(1));
    }

    /// Counts authoritative steps and does nothing else.
    struct CountingModifier {
        steps: Arc<AtomicUsize>,
    }

    impl PlayerModifier for CountingModifier {
        fn modify_checked(
            &self,
            _ctx: &StepContext,
            _player: &mut SnapshotMut<'_>,
            _commands: &Commands,
        ) -> Result<(), ModifierError> {
            self.steps.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Writes the tick into the kill limit after the mode step.
    struct StampKillLimit {
        schemas: Arc<StandardSchemas>,
    }

    impl Mode for StampKillLimit {
        fn id(&self) -> u8 {
            0
        }

        fn name(&self) -> &'static str {
            "stamp-kill-limit"
        }

        fn post_tick(&mut self, ctx: &TickContext, session: &mut SnapshotMut<'_>) {
            session.set_u16(self.schemas.session_ids.kill_limit, ctx.tick as u16);
        }
    }

    #[test]
    fn test_seed_runs_no_step() {
        let schemas = StandardSchemas::new(2, 4);
        let steps = Arc::new(AtomicUsize::new(0));
        let mut systems =
            SessionSystems::new(Arc::clone(&schemas), Box::new(CountingModifier { steps: Arc::clone(&steps) }));
        systems.modes.register(Box::new(Deathmatch::new(Arc::clone(&schemas), "test")));
        let (mut server, connector) = server_with_systems(config(), systems);
        let mut client = connector.connect().unwrap();

        send(&mut client, &commands(&schemas, None));
        server.tick(step(0));
        send(&mut client, &commands(&schemas, Some((10, 1_000_000, 0))));
        server.tick(step(1));
        assert_eq!(stamp_tick(&server, 0), Some(10));
        assert_eq!(steps.load(Ordering::SeqCst), 0);

        send(&mut client, &commands(&schemas, Some((11, 1_000_000 + INTERVAL as u64, INTERVAL))));
        server.tick(step(2));
        assert_eq!(steps.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_post_tick_writes_reach_compressed_clients() {
        let schemas = StandardSchemas::new(2, 4);
        let mut systems =
            SessionSystems::new(Arc::clone(&schemas), Box::new(MovementModifier::new(Arc::clone(&schemas))));
        systems.modes.register(Box::new(StampKillLimit { schemas: Arc::clone(&schemas) }));
        let (mut server, connector) =
            server_with_systems(SessionConfig { compress_sessions: true, ..config() }, systems);
        let kill_limit = schemas.session_ids.kill_limit;
        let mut client = connector.connect().unwrap();

        send(&mut client, &commands(&schemas, None));
        server.tick(step(0));
        server.tick(step(1));

        // the client's copy of tick 1, sent in full
        let full = last_session(&mut client).unwrap();
        let mut seen = Snapshot::new(&schemas.session);
        decode_into(&full, &mut seen.view_mut()).unwrap();
        assert_eq!(seen.get_u16(kill_limit), Some(1));

        let mut ack = commands(&schemas, None);
        ack.input.set_u32(schemas.input_ids.acknowledged_server_tick, 1);
        send(&mut client, &ack);
        server.tick(step(2));

        let compressed = last_session(&mut client).unwrap();
        let mut received = Snapshot::new(&schemas.session);
        decode_into(&compressed, &mut received.view_mut()).unwrap();
        trust::apply_received(&mut seen.view_mut(), received.view());
        assert_eq!(seen.get_u16(kill_limit), Some(2));
        assert_eq!(seen.get_u16(kill_limit), server.session().get_u16(kill_limit));
    }

    #[test]
    fn test_truncate_username() {
        let mut name = "é".repeat(20);
        truncate_utf8(&mut name, MAX_USERNAME_LEN);
        assert!(name.len() <= MAX_USERNAME_LEN);
        assert_eq!(name.chars().count(), 12);
    }
}
