//! Player Movement
//!
//! Reference [`PlayerModifier`]: walk, jump and gravity on a flat,
//! bounded floor at `y = 0`, camera look, and inventory slot cycling.
//!
//! Everything in `modify_checked` is a pure function of the player, the
//! command and the duration. Float operations are identical on both ends,
//! so predictions only diverge when the server changes something the
//! client could not know.

use std::sync::Arc;

use crate::core::snapshot::{FieldRead, FieldWrite, SnapshotMut, SnapshotRef};
use crate::core::vec3::Vec3;
use crate::game::input::InputFrame;
use crate::game::standard::{StandardSchemas, INVENTORY_SLOTS};
use crate::game::stepper::{Commands, ModifierError, PlayerModifier, StepContext, TickContext};

/// Movement tuning.
#[derive(Clone, Debug, PartialEq)]
pub struct MovementConfig {
    /// Ground speed (units/s)
    pub walk_speed: f32,
    /// Downward acceleration (units/s^2)
    pub gravity: f32,
    /// Initial upward speed of a jump (units/s)
    pub jump_speed: f32,
    /// Floor extends `[-extent, extent]` on x and z
    pub arena_half_extent: f32,
    /// Distance covered by one walk cycle
    pub stride: f32,
    /// Pitch limit in degrees
    pub max_pitch: f32,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            walk_speed: 6.0,
            gravity: 20.0,
            jump_speed: 7.0,
            arena_half_extent: 40.0,
            stride: 2.5,
            max_pitch: 89.0,
        }
    }
}

/// Walk/jump/look modifier over the standard player schema.
#[derive(Debug)]
pub struct MovementModifier {
    schemas: Arc<StandardSchemas>,
    config: MovementConfig,
}

impl MovementModifier {
    /// Create with default tuning.
    pub fn new(schemas: Arc<StandardSchemas>) -> Self {
        Self::with_config(schemas, MovementConfig::default())
    }

    /// Create with explicit tuning.
    pub fn with_config(schemas: Arc<StandardSchemas>, config: MovementConfig) -> Self {
        Self { schemas, config }
    }

    /// Tuning in use.
    pub fn config(&self) -> &MovementConfig {
        &self.config
    }
}

/// Horizontal forward and right unit vectors for a yaw in degrees.
pub fn yaw_basis(yaw_degrees: f32) -> (Vec3, Vec3) {
    let (sin, cos) = yaw_degrees.to_radians().sin_cos();
    (Vec3::new(sin, 0.0, cos), Vec3::new(cos, 0.0, -sin))
}

impl PlayerModifier for MovementModifier {
    fn modify_commands(&mut self, _ctx: &TickContext, frame: &InputFrame, commands: &mut Commands) {
        let ids = &self.schemas.input_ids;
        let (x, y) = frame.axes();
        let (look_x, look_y) = frame.look_degrees();
        let input = &mut commands.input;
        input.set_f32(ids.move_x, x);
        input.set_f32(ids.move_y, y);
        if look_x != 0.0 || look_y != 0.0 {
            input.set_f32(ids.look_dx, look_x);
            input.set_f32(ids.look_dy, look_y);
        }
        if frame.pressed(InputFrame::FLAG_JUMP) {
            input.set_bool(ids.jump, true);
        }
        if frame.pressed(InputFrame::FLAG_USE) {
            input.set_bool(ids.use_item, true);
        }
        if frame.pressed(InputFrame::FLAG_CYCLE_ITEM) {
            input.set_bool(ids.cycle_item, true);
        }
    }

    fn modify_trusted(&mut self, _ctx: &TickContext, commands: &mut Commands, verified: SnapshotRef<'_>) {
        let ids = &self.schemas.player_ids;
        let input = &self.schemas.input_ids;

        let yaw = commands.player.get_f32(ids.yaw).or_else(|| verified.get_f32(ids.yaw)).unwrap_or(0.0);
        let pitch = commands.player.get_f32(ids.pitch).or_else(|| verified.get_f32(ids.pitch)).unwrap_or(0.0);
        let look_x = commands.input.get_f32(input.look_dx).unwrap_or(0.0);
        let look_y = commands.input.get_f32(input.look_dy).unwrap_or(0.0);
        commands.player.set_f32(ids.yaw, (yaw + look_x).rem_euclid(360.0));
        commands.player.set_f32(ids.pitch, (pitch - look_y).clamp(-self.config.max_pitch, self.config.max_pitch));

        if commands.input.get_bool(input.cycle_item) == Some(true) {
            let equipped = commands
                .player
                .get_u8(ids.equipped_index)
                .or_else(|| verified.get_u8(ids.equipped_index))
                .unwrap_or(0);
            commands.player.set_u8(ids.equipped_index, (equipped + 1) % INVENTORY_SLOTS as u8);
        }
    }

    fn modify_checked(
        &self,
        ctx: &StepContext,
        player: &mut SnapshotMut<'_>,
        commands: &Commands,
    ) -> Result<(), ModifierError> {
        if ctx.duration_us == 0 {
            return Ok(());
        }
        let ids = &self.schemas.player_ids;
        let input = &self.schemas.input_ids;
        if player.get_u8(ids.health) == Some(0) {
            return Ok(());
        }

        let dt = ctx.duration_us as f32 / 1_000_000.0;
        let config = &self.config;
        let mut position = player.get_vec3(ids.position).unwrap_or(Vec3::ZERO);
        let velocity = player.get_vec3(ids.velocity).unwrap_or(Vec3::ZERO);
        let yaw = player.get_f32(ids.yaw).unwrap_or(0.0);

        let x = commands.input.get_f32(input.move_x).unwrap_or(0.0).clamp(-1.0, 1.0);
        let y = commands.input.get_f32(input.move_y).unwrap_or(0.0).clamp(-1.0, 1.0);
        let (forward, right) = yaw_basis(yaw);
        let mut wish = right.scale(x) + forward.scale(y);
        if wish.length_squared() > 1.0 {
            wish = wish.normalize();
        }

        let grounded = position.y <= 0.0;
        let mut vertical = velocity.y;
        if grounded {
            vertical = vertical.max(0.0);
            if commands.input.get_bool(input.jump) == Some(true) {
                vertical = config.jump_speed;
            }
        } else {
            vertical -= config.gravity * dt;
        }

        let mut velocity = Vec3::new(wish.x * config.walk_speed, vertical, wish.z * config.walk_speed);
        position = position + velocity.scale(dt);
        if position.y <= 0.0 {
            position.y = 0.0;
            velocity.y = 0.0;
        }
        let extent = config.arena_half_extent;
        position.x = position.x.clamp(-extent, extent);
        position.z = position.z.clamp(-extent, extent);

        if !(position.x.is_finite() && position.y.is_finite() && position.z.is_finite()) {
            return Err(ModifierError::NonFinite { player_id: ctx.player_id, field: "move.position" });
        }

        let ground_tick = if position.y <= 0.0 {
            player.get_u8(ids.ground_tick).unwrap_or(0).saturating_add(1)
        } else {
            0
        };
        let horizontal = Vec3::new(velocity.x, 0.0, velocity.z).length();
        let phase = player.get_f32(ids.normalized_move).unwrap_or(0.0);
        let phase = (phase + horizontal * dt / config.stride).rem_euclid(1.0);

        player.set_vec3(ids.position, position);
        player.set_vec3(ids.velocity, velocity);
        player.set_u8(ids.ground_tick, ground_tick);
        player.set_f32(ids.normalized_move, phase);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::snapshot::Snapshot;

    fn setup() -> (Arc<StandardSchemas>, MovementModifier, Snapshot, Commands) {
        let schemas = StandardSchemas::new(2, 2);
        let modifier = MovementModifier::new(Arc::clone(&schemas));
        let mut player = Snapshot::new(&schemas.player);
        player.zero();
        let commands = Commands::standard(&schemas);
        (schemas, modifier, player, commands)
    }

    fn step(modifier: &MovementModifier, player: &mut Snapshot, commands: &Commands, duration_us: u32) {
        let ctx = StepContext { player_id: 0, duration_us };
        modifier.modify_checked(&ctx, &mut player.view_mut(), commands).unwrap();
    }

    #[test]
    fn test_zero_duration_is_noop() {
        let (schemas, modifier, mut player, mut commands) = setup();
        commands.input.set_f32(schemas.input_ids.move_y, 1.0);
        let before = player.clone();
        step(&modifier, &mut player, &commands, 0);
        assert!(player.view().values_eq(before.view()));
    }

    #[test]
    fn test_walk_forward() {
        let (schemas, modifier, mut player, mut commands) = setup();
        commands.input.set_f32(schemas.input_ids.move_y, 1.0);
        step(&modifier, &mut player, &commands, 500_000);
        let position = player.get_vec3(schemas.player_ids.position).unwrap();
        assert!((position.z - 3.0).abs() < 1e-4);
        assert!(position.x.abs() < 1e-4);
        assert_eq!(player.get_u8(schemas.player_ids.ground_tick), Some(1));
    }

    #[test]
    fn test_jump_and_land() {
        let (schemas, modifier, mut player, mut commands) = setup();
        commands.input.set_bool(schemas.input_ids.jump, true);
        step(&modifier, &mut player, &commands, 16_666);
        let airborne = player.get_vec3(schemas.player_ids.position).unwrap();
        assert!(airborne.y > 0.0);
        assert_eq!(player.get_u8(schemas.player_ids.ground_tick), Some(0));

        commands.clear_single_tick();
        for _ in 0..120 {
            step(&modifier, &mut player, &commands, 16_666);
        }
        assert_eq!(player.get_vec3(schemas.player_ids.position).unwrap().y, 0.0);
        assert!(player.get_u8(schemas.player_ids.ground_tick).unwrap() > 0);
    }

    #[test]
    fn test_dead_player_frozen() {
        let (schemas, modifier, mut player, mut commands) = setup();
        player.set_u8(schemas.player_ids.health, 0);
        commands.input.set_f32(schemas.input_ids.move_x, 1.0);
        let before = player.clone();
        step(&modifier, &mut player, &commands, 16_666);
        assert!(player.view().values_eq(before.view()));
    }

    #[test]
    fn test_arena_clamp() {
        let (schemas, modifier, mut player, mut commands) = setup();
        player.set_vec3(schemas.player_ids.position, Vec3::new(39.9, 0.0, 0.0));
        commands.input.set_f32(schemas.input_ids.move_x, 1.0);
        step(&modifier, &mut player, &commands, 1_000_000);
        assert_eq!(player.get_vec3(schemas.player_ids.position).unwrap().x, 40.0);
    }

    #[test]
    fn test_deterministic() {
        let (schemas, modifier, mut a, mut commands) = setup();
        let mut b = a.clone();
        commands.input.set_f32(schemas.input_ids.move_x, 0.3);
        commands.input.set_f32(schemas.input_ids.move_y, -0.7);
        commands.player.set_f32(schemas.player_ids.yaw, 33.0);
        a.merge_from(commands.player.view());
        b.merge_from(commands.player.view());
        for duration in [16_666, 17_001, 15_990, 16_666] {
            step(&modifier, &mut a, &commands, duration);
            step(&modifier, &mut b, &commands, duration);
        }
        assert!(a.view().values_eq(b.view()));
    }

    #[test]
    fn test_trusted_look_and_cycle() {
        let (schemas, mut modifier, player, mut commands) = setup();
        let ctx = TickContext { tick: 0, time_us: 0, duration_us: 16_666, tick_interval_us: 16_666 };
        let mut frame = InputFrame::new();
        frame.look_dx = -1_000;
        frame.look_dy = 20_000;
        frame.set(InputFrame::FLAG_CYCLE_ITEM, true);

        modifier.modify_commands(&ctx, &frame, &mut commands);
        modifier.modify_trusted(&ctx, &mut commands, player.view());

        let ids = &schemas.player_ids;
        assert_eq!(commands.player.get_f32(ids.yaw), Some(350.0));
        assert_eq!(commands.player.get_f32(ids.pitch), Some(-89.0));
        assert_eq!(commands.player.get_u8(ids.equipped_index), Some(1));
    }
}
