//! Client Loop
//!
//! Predicts the local player ahead of the server and reconciles when the
//! server disagrees. Per tick:
//!
//! ```text
//! predict (claim command + prediction slots, sample input, step)
//!     ── send command ── receive sessions ── localize clocks
//!     ── check prediction (replay on mismatch) ── queue overrides
//! ```
//!
//! Prediction, command and sampled-input histories are claimed together,
//! so offset `k` in one always pairs with offset `k` in the others. Sent
//! commands lose their single-tick fields after the tick; replays read the
//! edges back from the sampled-input history instead. Rendering reads the
//! three histories at different lags: the local player one tick back, other
//! players by the configured render interval, entities two ticks back.

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
use crate::game::input::InputDevice;
use crate::game::interpolate::{find_bracket, interpolate_into};
use crate::game::standard::StandardSchemas;
use crate::game::stepper::{Commands, SessionSystems, StepContext, TickContext};
use crate::game::trust;
use crate::network::config::{ConfigError, SessionConfig};
use crate::network::protocol::{decode_into, encode_snapshot, ClientMessage, ServerMessage, WireSnapshot};
use crate::network::transport::{ClientEvent, ClientTransport, TransportError};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration rejected.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Session schemas do not match the configured sizes.
    #[error("schemas built for {schemas} players, config says {config}")]
    SizeMismatch {
        /// Player slots in the schemas
        schemas: usize,
        /// Player slots in the config
        config: usize,
    },

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Loading gates prediction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    /// Content still loading; commands go out unstamped.
    Loading,
    /// Predicting.
    Running,
}

/// Counters for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Ticks run.
    pub ticks: u64,
    /// Sessions applied.
    pub sessions_received: u64,
    /// Sessions older than the latest one.
    pub out_of_order_sessions: u64,
    /// Sessions too old for the history window, or undecodable.
    pub dropped_sessions: u64,
    /// Predictions that disagreed with the server.
    pub prediction_errors: u64,
    /// Localized clocks snapped back after drifting.
    pub reset_errors: u64,
    /// Server override fields queued into commands.
    pub overrides_applied: u64,
    /// Modifier steps that returned an error.
    pub modifier_errors: u64,
}

/// Interpolated views produced by [`ClientLoop::render`].
#[derive(Clone, Copy, Debug)]
pub struct RenderFrame<'a> {
    /// Local player, from prediction history.
    pub local: SnapshotRef<'a>,
    /// Session for other players and mode state.
    pub session: SnapshotRef<'a>,
    /// Session for entities.
    pub entities: SnapshotRef<'a>,
}

/// Predicting client loop.
pub struct ClientLoop<T> {
    config: SessionConfig,
    systems: SessionSystems,
    schemas: Arc<StandardSchemas>,
    transport: T,
    input: Box<dyn InputDevice>,
    state: ClientState,
    paused: bool,
    username: Option<String>,
    joined: bool,
    sessions: History<Snapshot>,
    predictions: History<Snapshot>,
    commands: History<Commands>,
    sampled: History<Snapshot>,
    replay_command: Commands,
    received: Snapshot,
    baseline: Snapshot,
    pending_overrides: Snapshot,
    has_pending_overrides: bool,
    render_local: Snapshot,
    render_session: Snapshot,
    render_entities: Snapshot,
    has_session: bool,
    local_player_id: Option<u8>,
    disconnected: Option<String>,
    stats: ClientStats,
}

impl<T: ClientTransport> ClientLoop<T> {
    /// Create a loop in the `Loading` state.
    pub fn new(
        config: SessionConfig,
        systems: SessionSystems,
        transport: T,
        input: Box<dyn InputDevice>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let schemas = Arc::clone(&systems.schemas);
        if schemas.max_players != config.max_players {
            return Err(ClientError::SizeMismatch { schemas: schemas.max_players, config: config.max_players });
        }
        let session = Arc::clone(&schemas.session);
        let player = Arc::clone(&schemas.player);
        let count = config.history_count;
        Ok(Self {
            sessions: History::new(count, || Snapshot::new(&session)),
            predictions: History::new(count, || Snapshot::new(&player)),
            commands: History::new(count, || Commands::standard(&schemas)),
            sampled: History::new(count, || Snapshot::new(&schemas.input)),
            replay_command: Commands::standard(&schemas),
            received: Snapshot::new(&session),
            baseline: Snapshot::new(&session),
            pending_overrides: Snapshot::new(&player),
            has_pending_overrides: false,
            render_local: Snapshot::new(&player),
            render_session: Snapshot::new(&session),
            render_entities: Snapshot::new(&session),
            config,
            systems,
            schemas,
            transport,
            input,
            state: ClientState::Loading,
            paused: false,
            username: None,
            joined: false,
            has_session: false,
            local_player_id: None,
            disconnected: None,
            stats: ClientStats::default(),
        })
    }

    /// Name sent with the join request.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Content is loaded; start predicting.
    pub fn set_ready(&mut self) {
        if self.state == ClientState::Loading {
            info!("Client running");
            self.state = ClientState::Running;
        }
    }

    /// Stop or resume stamping commands.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Whether commands currently go out unstamped.
    pub fn is_paused(&self) -> bool {
        self.paused || self.state == ClientState::Loading
    }

    /// Current state.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Counters.
    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    /// Player id assigned by the server.
    pub fn local_player_id(&self) -> Option<u8> {
        self.local_player_id
    }

    /// Why the connection ended, once it has.
    pub fn disconnect_reason(&self) -> Option<&str> {
        self.disconnected.as_deref()
    }

    /// Latest received session.
    pub fn session(&self) -> SnapshotRef<'_> {
        self.sessions.peek().view()
    }

    /// Received sessions.
    pub fn sessions(&self) -> &History<Snapshot> {
        &self.sessions
    }

    /// Latest predicted local player.
    pub fn predicted(&self) -> SnapshotRef<'_> {
        self.predictions.peek().view()
    }

    /// Predicted local player per tick.
    pub fn predictions(&self) -> &History<Snapshot> {
        &self.predictions
    }

    /// Commands per tick, paired with [`predictions`](Self::predictions).
    pub fn commands(&self) -> &History<Commands> {
        &self.commands
    }

    /// Transport, for driving it directly.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Tick interval from the latest session, falling back to config.
    pub fn tick_interval_us(&self) -> u32 {
        self.schemas
            .tick_interval_us(self.sessions.peek().view())
            .unwrap_or_else(|| self.config.tick_interval_us())
    }

    // =========================================================================
    // TICK
    // =========================================================================

    /// Run one fixed tick.
    pub fn tick(&mut self, step: TickStep) {
        let ctx = TickContext {
            tick: step.tick,
            time_us: step.time_us,
            duration_us: step.duration_us,
            tick_interval_us: self.tick_interval_us(),
        };

        if !self.joined {
            let username = self.username.clone().unwrap_or_default();
            match self.transport.send(&ClientMessage::Join { username }) {
                Ok(()) => self.joined = true,
                Err(e) => warn!(error = %e, "Join not sent"),
            }
        }

        if let Some(player_id) = self.local_player_id {
            self.predict(&ctx, player_id);
        }
        self.send_commands();
        self.commands.peek_mut().clear_single_tick();
        self.receive(ctx.time_us);
        self.stats.ticks += 1;
    }

    /// Claim the next command and prediction slots and step the local player.
    fn predict(&mut self, ctx: &TickContext, player_id: u8) {
        let stamp = self.schemas.player_ids.client_stamp;
        let paused = self.is_paused();

        {
            let (previous, current) = self.predictions.claim_next_with_previous();
            if let Some(previous) = previous {
                current.copy_from(previous.view());
            }
        }
        let previous_stamped = {
            let (previous, current) = self.commands.claim_next_with_previous();
            let stamped = previous.map_or(false, |p| p.player.has(stamp.tick));
            if let Some(previous) = previous {
                current.copy_from(previous);
            }
            // overrides go out in exactly one command
            trust::clear_overridden(&mut current.player.view_mut());
            if self.has_pending_overrides {
                current.player.merge_from(self.pending_overrides.view());
            }
            stamped
        };
        if self.has_pending_overrides {
            self.pending_overrides.clear();
            self.has_pending_overrides = false;
        }

        let frame = self.input.sample(ctx.time_us);
        let command = self.commands.peek_mut();
        self.systems.modifier.modify_commands(ctx, &frame, command);
        self.systems.modifier.modify_trusted(ctx, command, self.predictions.peek().view());
        self.sampled.claim_next().copy_from(command.input.view());

        if paused {
            command.player.view_mut().sub_mut(stamp.root).clear();
            return;
        }

        let previous_time = if previous_stamped { self.predictions.get(-1).get_u64(stamp.time_us) } else { None };
        let duration_us = previous_time.map_or(0, |t| ctx.time_us.saturating_sub(t).min(u32::MAX as u64) as u32);

        let predicted = self.predictions.peek_mut();
        predicted.set_u32(stamp.tick, ctx.tick);
        predicted.set_u64(stamp.time_us, ctx.time_us);
        predicted.set_u32(stamp.duration_us, duration_us);
        command.player.view_mut().sub_mut(stamp.root).copy_from(predicted.view().sub(stamp.root));
        predicted.merge_from(command.player.view());

        let step = ctx.step(player_id, duration_us);
        if let Err(e) = self.systems.modifier.modify_checked(&step, &mut predicted.view_mut(), command) {
            self.stats.modifier_errors += 1;
            error!(player_id, tick = ctx.tick, error = %e, "Prediction step failed");
        }
    }

    fn send_commands(&mut self) {
        let command = self.commands.peek();
        let message = ClientMessage::Commands {
            player: encode_snapshot(command.player.view()),
            input: encode_snapshot(command.input.view()),
        };
        if let Err(e) = self.transport.send(&message) {
            debug!(error = %e, "Command not sent");
        }
    }

    /// Send the latest prediction for server-side inspection.
    pub fn send_debug_view(&mut self) -> Result<(), ClientError> {
        let player = encode_snapshot(self.predictions.peek().view());
        self.transport.send(&ClientMessage::DebugView { player })?;
        Ok(())
    }

    // =========================================================================
    // RECEIVE
    // =========================================================================

    fn receive(&mut self, now_us: u64) {
        while let Some(event) = self.transport.poll() {
            match event {
                ClientEvent::Message(ServerMessage::Session { snapshot, baseline_tick }) => {
                    self.receive_session(&snapshot, baseline_tick, now_us);
                }
                ClientEvent::Message(ServerMessage::PingCheck { tick }) => {
                    if let Err(e) = self.transport.send(&ClientMessage::PingCheck { tick }) {
                        debug!(tick, error = %e, "Ping echo not sent");
                    }
                }
                ClientEvent::Message(ServerMessage::Disconnect { reason }) => {
                    warn!(%reason, "Disconnected by server");
                    self.disconnected = Some(reason);
                }
                ClientEvent::Malformed(e) => {
                    warn!(error = %e, "Malformed message");
                }
                ClientEvent::Disconnected => {
                    if self.disconnected.is_none() {
                        info!("Connection closed");
                        self.disconnected = Some("connection closed".to_string());
                    }
                }
            }
        }
    }

    /// Apply one session into history.
    fn receive_session(&mut self, wire: &WireSnapshot, baseline_tick: Option<u32>, now_us: u64) {
        if let Err(e) = decode_into(wire, &mut self.received.view_mut()) {
            self.stats.dropped_sessions += 1;
            warn!(error = %e, "Undecodable session");
            return;
        }
        let tick_id = self.schemas.session_ids.server_stamp.tick;
        let Some(incoming) = self.received.get_u32(tick_id) else {
            self.stats.dropped_sessions += 1;
            warn!("Session without a server tick");
            return;
        };

        let baseline = match baseline_tick {
            Some(tick) => match self.sessions.position_newest(|s| s.get_u32(tick_id) == Some(tick)) {
                Some(offset) => {
                    self.baseline.copy_from(self.sessions.get(offset).view());
                    true
                }
                None => {
                    warn!(incoming, baseline = tick, "Compression baseline not in history");
                    false
                }
            },
            None => false,
        };

        let last = if self.has_session { self.sessions.peek().get_u32(tick_id) } else { None };
        let window = self.sessions.capacity() as i64;
        let ack = self.schemas.input_ids.acknowledged_server_tick;
        let (offset, newest) = match clock::tick_delta(Some(incoming), last) {
            None => {
                self.commands.peek_mut().input.set_u32(ack, incoming);
                self.sessions.claim_next();
                (0, true)
            }
            Some(delta) if delta > 0 => {
                self.commands.peek_mut().input.set_u32(ack, incoming);
                for _ in 0..(delta - 1).min(window - 1) {
                    let (previous, current) = self.sessions.claim_next_with_previous();
                    if let Some(previous) = previous {
                        current.copy_from(previous.view());
                    }
                }
                self.sessions.claim_next();
                (0, true)
            }
            Some(delta) if -delta < window - 1 => {
                self.stats.out_of_order_sessions += 1;
                warn!(incoming, last, "Out-of-order session");
                (delta as i32, false)
            }
            Some(_) => {
                self.stats.dropped_sessions += 1;
                warn!(incoming, last, "Session older than history");
                return;
            }
        };

        {
            let (previous, current) = self.sessions.get_with_previous_mut(offset);
            // a repeat of the latest tick lands on the slot that already holds it
            let repeat = offset == 0 && !newest;
            match previous {
                _ if repeat => {}
                _ if baseline => current.copy_from(self.baseline.view()),
                Some(previous) => current.copy_from(previous.view()),
                None => current.clear(),
            }
            trust::apply_received(&mut current.view_mut(), self.received.view());
        }
        self.has_session = true;
        self.stats.sessions_received += 1;
        if !newest {
            return;
        }

        self.localize_clocks(now_us);
        self.update_local_player();
        self.synchronize_remote_players();
        let corrected = self.check_prediction();
        self.queue_overrides(corrected);
    }

    /// Advance the session and per-player localized clocks.
    fn localize_clocks(&mut self, now_us: u64) {
        let session_ids = &self.schemas.session_ids;
        let ids = &self.schemas.player_ids;
        let tolerance = self.config.drift_tolerance_us();
        let (previous, current) = self.sessions.get_with_previous_mut(0);
        let previous = previous.map(|p| p.view());
        let mut current = current.view_mut();

        let update = localize_one(
            previous.and_then(|p| p.get_u64(session_ids.server_stamp.time_us)),
            previous.and_then(|p| p.get_u64(session_ids.localized_time_us)),
            current.get_u64(session_ids.server_stamp.time_us),
            now_us,
            tolerance,
        );
        match update {
            Some((time, outcome)) => {
                current.set_u64(session_ids.localized_time_us, time);
                if let ClockUpdate::Snapped { drift_us } = outcome {
                    self.stats.reset_errors += 1;
                    warn!(drift_us, "Session clock drifted, snapping");
                }
            }
            None => current.clear_field(session_ids.localized_time_us),
        }

        for player_id in 0..self.schemas.max_players as u8 {
            let mut player = current.element_mut(session_ids.players, player_id as usize);
            if !self.schemas.is_alive(player.as_ref()) {
                if !player.has(ids.health) {
                    player.clear_field(ids.localized_time_us);
                }
                continue;
            }
            let before = previous.map(|p| self.schemas.player_of(p, player_id));
            let update = localize_one(
                before.and_then(|p| p.get_u64(ids.server_stamp.time_us)),
                before.and_then(|p| p.get_u64(ids.localized_time_us)),
                player.get_u64(ids.server_stamp.time_us),
                now_us,
                tolerance,
            );
            if let Some((time, outcome)) = update {
                player.set_u64(ids.localized_time_us, time);
                if let ClockUpdate::Snapped { drift_us } = outcome {
                    self.stats.reset_errors += 1;
                    warn!(player_id, drift_us, "Player clock drifted, snapping");
                }
            }
        }
    }

    /// Learn the local player id; seed prediction on first assignment.
    fn update_local_player(&mut self) {
        let assigned = self.schemas.local_player_id(self.sessions.peek().view());
        if assigned == self.local_player_id {
            return;
        }
        self.local_player_id = assigned;
        let Some(player_id) = assigned else {
            warn!("Server stopped naming a local player");
            return;
        };
        info!(player_id, "Assigned local player");
        let server_player = self.schemas.player_of(self.sessions.peek().view(), player_id);
        self.predictions.for_each_mut(|p| p.copy_from(server_player));
        self.systems.modifier.synchronize(player_id, server_player);
    }

    fn synchronize_remote_players(&mut self) {
        let session = self.sessions.peek().view();
        for player_id in 0..self.schemas.max_players as u8 {
            let player = self.schemas.player_of(session, player_id);
            if Some(player_id) != self.local_player_id && self.schemas.is_joined(player) {
                self.systems.modifier.synchronize(player_id, player);
            }
        }
    }

    /// Compare the prediction for the tick the server last stepped; on a
    /// mismatch, adopt the server's player and replay later commands.
    ///
    /// Returns whether a replay happened.
    fn check_prediction(&mut self) -> bool {
        let Some(player_id) = self.local_player_id else {
            return false;
        };
        let stamp = self.schemas.player_ids.client_stamp;
        let server_player = self.schemas.player_of(self.sessions.peek().view(), player_id);
        if !self.schemas.is_joined(server_player) {
            return false;
        }
        let Some(acked) = server_player.get_u32(stamp.tick) else {
            return false;
        };
        let Some(matched) = self.predictions.position_newest(|p| p.get_u32(stamp.tick) == Some(acked)) else {
            debug!(player_id, tick = acked, "No prediction for acknowledged tick");
            return false;
        };

        trust::pull_server_only(&mut self.predictions.peek_mut().view_mut(), server_player);
        let Some(field) = trust::first_misprediction(self.predictions.get(matched).view(), server_player) else {
            return false;
        };

        self.stats.prediction_errors += 1;
        warn!(
            player_id,
            tick = acked,
            replayed = -matched,
            field = %self.schemas.player.path_of(field),
            "Misprediction, replaying"
        );
        self.predictions.get_mut(matched).copy_from(server_player);
        self.replay(player_id, matched);
        self.systems.modifier.synchronize(player_id, self.predictions.peek().view());
        true
    }

    /// Re-run every command after `from` on top of the corrected entry.
    fn replay(&mut self, player_id: u8, from: i32) {
        let stamp = self.schemas.player_ids.client_stamp;
        let stamp_ids = [stamp.tick, stamp.time_us, stamp.duration_us];
        for offset in (from + 1)..=0 {
            let command = &mut self.replay_command;
            command.copy_from(self.commands.get(offset));
            command.input.copy_from(self.sampled.get(offset).view());
            let command = &*command;
            let (previous, current) = self.predictions.get_with_previous_mut(offset);
            let Some(previous) = previous else {
                continue;
            };
            let saved = stamp_ids.map(|id| current.view().get(id).cloned());
            current.copy_from(previous.view());
            for (id, value) in stamp_ids.into_iter().zip(saved) {
                match value {
                    Some(value) => current.set(id, value),
                    None => current.view_mut().clear_field(id),
                }
            }

            let Some(duration_us) = command.player.get_u32(stamp.duration_us) else {
                continue;
            };
            current.merge_from(command.player.view());
            let step = StepContext { player_id, duration_us };
            if let Err(e) = self.systems.modifier.modify_checked(&step, &mut current.view_mut(), command) {
                self.stats.modifier_errors += 1;
                error!(player_id, offset, error = %e, "Replay step failed");
            }
        }
    }

    /// Hold server overrides for the next command unless a replay already
    /// adopted the server's player.
    fn queue_overrides(&mut self, corrected: bool) {
        let Some(player_id) = self.local_player_id else {
            return;
        };
        if corrected {
            return;
        }
        let server_player = self.schemas.player_of(self.sessions.peek().view(), player_id);
        let copied = trust::copy_overrides(&mut self.pending_overrides.view_mut(), server_player);
        if copied > 0 {
            self.has_pending_overrides = true;
            self.stats.overrides_applied += copied as u64;
            debug!(player_id, copied, "Queued server overrides");
        }
    }

    // =========================================================================
    // RENDER
    // =========================================================================

    /// Interpolate the histories for display at `render_time_us`.
    ///
    /// `None` until the local player is known and predicted.
    pub fn render(&mut self, render_time_us: u64) -> Option<RenderFrame<'_>> {
        self.local_player_id?;
        let interval = self.tick_interval_us() as u64;
        let local_time = self.schemas.player_ids.client_stamp.time_us;
        let session_time = self.schemas.session_ids.localized_time_us;

        let local = find_bracket(&self.predictions, render_time_us.saturating_sub(interval), |p| {
            p.get_u64(local_time)
        })?;
        interpolate_into(
            &mut self.render_local.view_mut(),
            self.predictions.get(local.older).view(),
            self.predictions.get(local.newer).view(),
            local.fraction,
        );
        self.render_local.merge_from(self.commands.peek().player.view());

        let remote_at = render_time_us.saturating_sub(self.config.player_render_interval_us());
        if let Some(b) = find_bracket(&self.sessions, remote_at, |s| s.get_u64(session_time)) {
            interpolate_into(
                &mut self.render_session.view_mut(),
                self.sessions.get(b.older).view(),
                self.sessions.get(b.newer).view(),
                b.fraction,
            );
        }
        let entities_at = render_time_us.saturating_sub(2 * interval);
        if let Some(b) = find_bracket(&self.sessions, entities_at, |s| s.get_u64(session_time)) {
            interpolate_into(
                &mut self.render_entities.view_mut(),
                self.sessions.get(b.older).view(),
                self.sessions.get(b.newer).view(),
                b.fraction,
            );
        }

        self.systems.entities.render_all(self.render_entities.view(), render_time_us);
        let mode_id = self.render_session.get_u8(self.schemas.session_ids.mode_id);
        if let Some(mode) = mode_id.and_then(|id| self.systems.modes.get_mut(id)) {
            mode.render(self.render_session.view(), render_time_us);
        }

        Some(RenderFrame {
            local: self.render_local.view(),
            session: self.render_session.view(),
            entities: self.render_entities.view(),
        })
    }

    // =========================================================================
    // RUN
    // =========================================================================

    /// Drive ticks and renders from the tokio clock until `shutdown` fires
    /// or the server drops the connection.
    #[instrument(skip_all, name = "client")]
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> ClientStats {
        let interval_us = self.config.tick_interval_us();
        let mut ticks = interval(Duration::from_micros(interval_us as u64));
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticker = Ticker::with_interval(interval_us);
        let origin = Instant::now();
        info!(interval_us, "Client loop started");

        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    let now_us = origin.elapsed().as_micros() as u64;
                    for step in ticker.advance(now_us) {
                        self.tick(step);
                    }
                    self.render(now_us);
                    if let Some(reason) = &self.disconnected {
                        info!(%reason, "Client loop stopping");
                        break;
                    }
                }
                _ = shutdown.recv() => {
                    info!(ticks = self.stats.ticks, "Client loop stopping");
                    break;
                }
            }
        }
        self.stats
    }
}

impl<T> std::fmt::Debug for ClientLoop<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientLoop")
            .field("state", &self.state)
            .field("local_player_id", &self.local_player_id)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Localize one clock from a server time delta. `None` when the server
/// time is absent.
fn localize_one(
    server_before: Option<u64>,
    local_before: Option<u64>,
    server_now: Option<u64>,
    now_us: u64,
    tolerance_us: u64,
) -> Option<(u64, ClockUpdate)> {
    let server_now = server_now?;
    let (previous, delta) = match server_before {
        Some(before) => (local_before, server_now as i64 - before as i64),
        None => (None, 0),
    };
    Some(clock::localize(previous, delta, now_us, tolerance_us))
}
