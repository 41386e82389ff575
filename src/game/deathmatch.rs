//! Deathmatch Mode
//!
//! Free-for-all rules: warmup, then play until someone reaches the kill
//! limit, then an intermission before the next round. Spawns are forced
//! with override flags so clients snap to them instead of predicting.
//!
//! Phase machine:
//!
//! ```text
//! Warmup --(warmup_us)--> Playing --(kill limit)--> Ended --(intermission_us)--> Warmup
//! ```

use std::sync::Arc;

use tracing::{debug, info};

use crate::core::rng::DeterministicRng;
use crate::core::snapshot::{FieldRead, FieldWrite, SnapshotMut, SnapshotRef};
use crate::core::value::Value;
use crate::core::vec3::Vec3;
use crate::game::movement::yaw_basis;
use crate::game::standard::{StandardSchemas, INVENTORY_SLOTS, ITEM_GRENADE, MAX_HEALTH};
use crate::game::stepper::{Commands, Mode, ModifierError, StepContext, TickContext};
use crate::game::throwables::spawn_grenade;

/// Mode id of deathmatch.
pub const DEATHMATCH_ID: u8 = 0;

/// Round phase, stored in `session.mode.phase`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// Kills do not count yet
    Warmup = 0,
    /// Round in progress
    Playing = 1,
    /// Winner decided
    Ended = 2,
}

impl Phase {
    /// Decode a stored phase.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Phase::Warmup),
            1 => Some(Phase::Playing),
            2 => Some(Phase::Ended),
            _ => None,
        }
    }
}

/// Deathmatch tuning.
#[derive(Clone, Debug)]
pub struct DeathmatchConfig {
    /// Kills needed to win
    pub kill_limit: u16,
    /// Warmup length (us)
    pub warmup_us: u64,
    /// Intermission after a win (us)
    pub intermission_us: u64,
    /// Spawn centers
    pub spawn_points: Vec<Vec3>,
    /// Random offset around a spawn center
    pub spawn_jitter: f32,
    /// Grenades handed out per life
    pub grenades_per_life: u16,
    /// Throw speed (units/s)
    pub throw_speed: f32,
    /// Eye height above the player's feet
    pub eye_height: f32,
}

impl Default for DeathmatchConfig {
    fn default() -> Self {
        Self {
            kill_limit: 10,
            warmup_us: 3_000_000,
            intermission_us: 5_000_000,
            spawn_points: vec![
                Vec3::new(-20.0, 0.0, -20.0),
                Vec3::new(20.0, 0.0, -20.0),
                Vec3::new(-20.0, 0.0, 20.0),
                Vec3::new(20.0, 0.0, 20.0),
            ],
            spawn_jitter: 3.0,
            grenades_per_life: 3,
            throw_speed: 14.0,
            eye_height: 1.6,
        }
    }
}

/// Free-for-all deathmatch.
#[derive(Debug)]
pub struct Deathmatch {
    schemas: Arc<StandardSchemas>,
    config: DeathmatchConfig,
    rng: DeterministicRng,
}

impl Deathmatch {
    /// Create with default tuning, seeded from a session label.
    pub fn new(schemas: Arc<StandardSchemas>, label: &str) -> Self {
        Self::with_config(schemas, DeathmatchConfig::default(), label)
    }

    /// Create with explicit tuning.
    pub fn with_config(schemas: Arc<StandardSchemas>, config: DeathmatchConfig, label: &str) -> Self {
        Self {
            schemas,
            config,
            rng: DeterministicRng::for_session(label, DEATHMATCH_ID),
        }
    }

    fn phase(&self, session: SnapshotRef<'_>) -> Option<Phase> {
        session.get_u8(self.schemas.session_ids.mode_phase).and_then(Phase::from_u8)
    }

    fn enter(&self, session: &mut SnapshotMut<'_>, phase: Phase) {
        let ids = &self.schemas.session_ids;
        session.set_u8(ids.mode_phase, phase as u8);
        session.set_u64(ids.mode_elapsed_us, 0);
        info!(phase = ?phase, "Deathmatch phase");
    }

    fn reset_round(&mut self, ctx: &TickContext, session: &mut SnapshotMut<'_>) {
        let ids = self.schemas.player_ids;
        session.clear_field(self.schemas.session_ids.winner);
        for player_id in 0..self.schemas.max_players as u8 {
            if !self.schemas.is_joined(self.schemas.player_of(session.as_ref(), player_id)) {
                continue;
            }
            {
                let mut player = session.element_mut(self.schemas.session_ids.players, player_id as usize);
                player.set_u16(ids.kills, 0);
                player.set_u16(ids.deaths, 0);
                player.set_u16(ids.damage, 0);
            }
            self.spawn_player(ctx, session, player_id);
        }
    }

    fn leader(&self, session: SnapshotRef<'_>) -> Option<(u8, u16)> {
        let kills = self.schemas.player_ids.kills;
        (0..self.schemas.max_players as u8)
            .filter(|id| self.schemas.is_joined(self.schemas.player_of(session, *id)))
            .map(|id| (id, self.schemas.player_of(session, id).get_u16(kills).unwrap_or(0)))
            .max_by_key(|(id, kills)| (*kills, std::cmp::Reverse(*id)))
    }

    fn throw(&self, session: &mut SnapshotMut<'_>, player_id: u8) -> Option<usize> {
        let ids = &self.schemas.player_ids;
        let item_ids = &self.schemas.item_ids;
        let (origin, velocity) = {
            let mut player = session.element_mut(self.schemas.session_ids.players, player_id as usize);
            let slot = player.get_u8(ids.equipped_index).unwrap_or(0) as usize % INVENTORY_SLOTS as usize;
            let mut item = player.element_mut(ids.items, slot);
            if item.get_u8(item_ids.id) != Some(ITEM_GRENADE) {
                return None;
            }
            let ammo = item.get_u16(item_ids.ammo).unwrap_or(0);
            if ammo == 0 {
                return None;
            }
            item.set_u16(item_ids.ammo, ammo - 1);

            let yaw = player.get_f32(ids.yaw).unwrap_or(0.0);
            let pitch = player.get_f32(ids.pitch).unwrap_or(0.0).to_radians();
            let (forward, _) = yaw_basis(yaw);
            let aim = Vec3::new(forward.x * pitch.cos(), pitch.sin(), forward.z * pitch.cos());
            let position = player.get_vec3(ids.position).unwrap_or(Vec3::ZERO);
            let carried = player.get_vec3(ids.velocity).unwrap_or(Vec3::ZERO);
            (
                position + Vec3::new(0.0, self.config.eye_height, 0.0),
                aim.scale(self.config.throw_speed) + carried,
            )
        };
        spawn_grenade(&self.schemas, session, player_id, origin, velocity)
    }
}

impl Mode for Deathmatch {
    fn id(&self) -> u8 {
        DEATHMATCH_ID
    }

    fn name(&self) -> &'static str {
        "deathmatch"
    }

    fn setup_new_player(&mut self, ctx: &TickContext, session: &mut SnapshotMut<'_>, player_id: u8) {
        session
            .element_mut(self.schemas.session_ids.players, player_id as usize)
            .set_u8(self.schemas.player_ids.team, player_id);
        self.spawn_player(ctx, session, player_id);
    }

    fn spawn_player(&mut self, _ctx: &TickContext, session: &mut SnapshotMut<'_>, player_id: u8) {
        let ids = self.schemas.player_ids;
        let item_ids = self.schemas.item_ids;
        let center = self.rng.choose(&self.config.spawn_points).copied().unwrap_or(Vec3::ZERO);
        let spawn = self.rng.jitter_horizontal(center, self.config.spawn_jitter);

        let mut player = session.element_mut(self.schemas.session_ids.players, player_id as usize);
        player.set_u8(ids.health, MAX_HEALTH);
        player.set_u32(ids.respawn_timer_us, 0);
        player.set_override(ids.position, Value::Vec3(spawn));
        player.set_override(ids.velocity, Value::Vec3(Vec3::ZERO));
        for slot in 0..INVENTORY_SLOTS as usize {
            player.element_mut(ids.items, slot).clear();
        }
        let mut item = player.element_mut(ids.items, 0);
        item.set_u8(item_ids.id, ITEM_GRENADE);
        item.set_u16(item_ids.ammo, self.config.grenades_per_life);
        debug!(player_id, %spawn, "Spawned player");
    }

    fn pre_tick(&mut self, _ctx: &TickContext, session: &mut SnapshotMut<'_>) {
        if self.phase(session.as_ref()).is_none() {
            session.set_u16(self.schemas.session_ids.kill_limit, self.config.kill_limit);
            self.enter(session, Phase::Warmup);
        }
    }

    fn modify_player(
        &mut self,
        ctx: &StepContext,
        session: &mut SnapshotMut<'_>,
        commands: &Commands,
    ) -> Result<(), ModifierError> {
        if commands.input.get_bool(self.schemas.input_ids.use_item) != Some(true) {
            return Ok(());
        }
        if self.phase(session.as_ref()) == Some(Phase::Ended) {
            return Ok(());
        }
        if !self.schemas.is_alive(self.schemas.player_of(session.as_ref(), ctx.player_id)) {
            return Ok(());
        }
        if let Some(index) = self.throw(session, ctx.player_id) {
            debug!(player_id = ctx.player_id, index, "Grenade thrown");
        }
        Ok(())
    }

    fn modify(&mut self, ctx: &TickContext, session: &mut SnapshotMut<'_>) {
        let session_ids = self.schemas.session_ids;
        let ids = self.schemas.player_ids;
        let elapsed = session.get_u64(session_ids.mode_elapsed_us).unwrap_or(0) + ctx.duration_us as u64;
        session.set_u64(session_ids.mode_elapsed_us, elapsed);

        let phase = self.phase(session.as_ref()).unwrap_or(Phase::Warmup);
        match phase {
            Phase::Warmup if elapsed >= self.config.warmup_us => {
                self.enter(session, Phase::Playing);
                self.reset_round(ctx, session);
                return;
            }
            Phase::Ended => {
                if elapsed >= self.config.intermission_us {
                    self.enter(session, Phase::Warmup);
                }
                return;
            }
            _ => {}
        }

        for player_id in 0..self.schemas.max_players as u8 {
            let player = self.schemas.player_of(session.as_ref(), player_id);
            if !self.schemas.is_joined(player) || self.schemas.is_alive(player) {
                continue;
            }
            let remaining = player.get_u32(ids.respawn_timer_us).unwrap_or(0).saturating_sub(ctx.duration_us);
            if remaining == 0 {
                self.spawn_player(ctx, session, player_id);
            } else {
                session
                    .element_mut(session_ids.players, player_id as usize)
                    .set_u32(ids.respawn_timer_us, remaining);
            }
        }

        if phase == Phase::Playing {
            let limit = session.get_u16(session_ids.kill_limit).unwrap_or(self.config.kill_limit);
            if let Some((winner, kills)) = self.leader(session.as_ref()).filter(|(_, kills)| *kills >= limit) {
                session.set_u8(session_ids.winner, winner);
                self.enter(session, Phase::Ended);
                info!(winner, kills, "Round won");
            }
        }
    }

    fn on_send_initial_data(&mut self, player_id: u8, send: &mut SnapshotMut<'_>) {
        let phase = send.get_u8(self.schemas.session_ids.mode_phase);
        debug!(player_id, ?phase, "Sending initial mode data");
    }
}
