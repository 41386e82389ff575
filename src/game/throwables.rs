//! Throwables
//!
//! Grenade entities: thrown by the mode, simulated by the server once per
//! tick, and interpolated by clients for rendering. A grenade bounces on
//! the floor, detonates when its fuse runs out, damages every living
//! player in range with linear falloff, and frees its slot shortly after
//! so the detonation is broadcast at least once.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::core::snapshot::{FieldRead, FieldWrite, SnapshotMut, SnapshotRef};
use crate::core::vec3::Vec3;
use crate::game::standard::{StandardSchemas, ENTITY_GRENADE};
use crate::game::stepper::{EntitySystem, TickContext};

/// Grenade tuning.
#[derive(Clone, Debug, PartialEq)]
pub struct GrenadeConfig {
    /// Time from throw to detonation (us)
    pub fuse_us: u32,
    /// Time the detonated grenade stays in its slot (us)
    pub linger_us: u32,
    /// Blast radius
    pub radius: f32,
    /// Damage at the center of the blast
    pub max_damage: u8,
    /// Downward acceleration (units/s^2)
    pub gravity: f32,
    /// Vertical speed kept on a bounce
    pub bounce: f32,
    /// Horizontal speed kept on a bounce
    pub friction: f32,
}

impl Default for GrenadeConfig {
    fn default() -> Self {
        Self {
            fuse_us: 2_000_000,
            linger_us: 100_000,
            radius: 5.0,
            max_damage: 80,
            gravity: 20.0,
            bounce: 0.4,
            friction: 0.7,
        }
    }
}

/// Put a new grenade into the first free entity slot.
///
/// Returns the slot index, or `None` when every slot is taken.
pub fn spawn_grenade(
    schemas: &StandardSchemas,
    session: &mut SnapshotMut<'_>,
    owner: u8,
    position: Vec3,
    velocity: Vec3,
) -> Option<usize> {
    let ids = &schemas.entity_ids;
    let entities = schemas.session_ids.entities;
    let index = (0..schemas.max_entities).find(|i| !session.as_ref().element(entities, *i).is_present(ids.kind))?;
    let mut entity = session.element_mut(entities, index);
    entity.clear();
    entity.set_u8(ids.kind, ENTITY_GRENADE);
    entity.set_u8(ids.owner, owner);
    entity.set_vec3(ids.position, position);
    entity.set_vec3(ids.velocity, velocity);
    entity.set_u32(ids.elapsed_us, 0);
    Some(index)
}

/// Grenade entity system.
#[derive(Debug)]
pub struct Grenades {
    schemas: Arc<StandardSchemas>,
    config: GrenadeConfig,
}

impl Grenades {
    /// Create with default tuning.
    pub fn new(schemas: Arc<StandardSchemas>) -> Self {
        Self::with_config(schemas, GrenadeConfig::default())
    }

    /// Create with explicit tuning.
    pub fn with_config(schemas: Arc<StandardSchemas>, config: GrenadeConfig) -> Self {
        Self { schemas, config }
    }

    /// Damage for a player `distance` away from the blast.
    pub fn damage_at(&self, distance: f32) -> u8 {
        if distance >= self.config.radius {
            return 0;
        }
        let falloff = 1.0 - distance / self.config.radius;
        (self.config.max_damage as f32 * falloff).round() as u8
    }

    fn detonate(&self, session: &mut SnapshotMut<'_>, owner: u8, center: Vec3) {
        let ids = &self.schemas.player_ids;
        let mut hits = Vec::new();
        for player_id in 0..self.schemas.max_players as u8 {
            let player = self.schemas.player_of(session.as_ref(), player_id);
            if !self.schemas.is_alive(player) {
                continue;
            }
            let position = player.get_vec3(ids.position).unwrap_or(Vec3::ZERO);
            let damage = self.damage_at(position.distance(center));
            if damage > 0 {
                hits.push((player_id, damage));
            }
        }
        for (victim, damage) in hits {
            let killed = self.schemas.apply_damage(session, owner, victim, damage);
            debug!(owner, victim, damage, killed, "Grenade hit");
        }
    }
}

impl EntitySystem for Grenades {
    fn kind(&self) -> u8 {
        ENTITY_GRENADE
    }

    fn modify(&mut self, ctx: &TickContext, session: &mut SnapshotMut<'_>, index: usize) {
        let ids = self.schemas.entity_ids;
        let config = &self.config;
        let dt = ctx.duration_us as f32 / 1_000_000.0;

        let (owner, center) = {
            let mut entity = session.element_mut(self.schemas.session_ids.entities, index);
            let before = entity.get_u32(ids.elapsed_us).unwrap_or(0);
            let elapsed = before.saturating_add(ctx.duration_us);
            entity.set_u32(ids.elapsed_us, elapsed);

            if before >= config.fuse_us {
                if elapsed >= config.fuse_us.saturating_add(config.linger_us) {
                    entity.clear();
                }
                return;
            }

            let mut velocity = entity.get_vec3(ids.velocity).unwrap_or(Vec3::ZERO);
            velocity.y -= config.gravity * dt;
            let mut position = entity.get_vec3(ids.position).unwrap_or(Vec3::ZERO) + velocity.scale(dt);
            if position.y < 0.0 {
                position.y = 0.0;
                velocity = Vec3::new(velocity.x * config.friction, -velocity.y * config.bounce, velocity.z * config.friction);
            }
            entity.set_vec3(ids.position, position);
            entity.set_vec3(ids.velocity, velocity);

            if elapsed < config.fuse_us {
                return;
            }
            entity.set_bool(ids.detonated, true);
            (entity.get_u8(ids.owner).unwrap_or(u8::MAX), position)
        };
        self.detonate(session, owner, center);
    }

    fn render(&mut self, index: usize, entity: SnapshotRef<'_>, render_time_us: u64) {
        let ids = &self.schemas.entity_ids;
        if let Some(position) = entity.get_vec3(ids.position) {
            trace!(index, render_time_us, %position, "Render grenade");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::snapshot::Snapshot;

    fn ctx(duration_us: u32) -> TickContext {
        TickContext { tick: 0, time_us: 0, duration_us, tick_interval_us: duration_us }
    }

    fn session_with_players(schemas: &StandardSchemas) -> Snapshot {
        let mut session = Snapshot::new(&schemas.session);
        {
            let mut view = session.view_mut();
            for id in 0..2 {
                let mut player = view.element_mut(schemas.session_ids.players, id);
                player.zero();
                player.set_vec3(schemas.player_ids.position, Vec3::new(id as f32 * 20.0, 0.0, 0.0));
            }
        }
        session
    }

    #[test]
    fn test_spawn_uses_free_slots() {
        let schemas = StandardSchemas::new(2, 2);
        let mut session = Snapshot::new(&schemas.session);
        let mut view = session.view_mut();
        assert_eq!(spawn_grenade(&schemas, &mut view, 0, Vec3::ZERO, Vec3::ZERO), Some(0));
        assert_eq!(spawn_grenade(&schemas, &mut view, 0, Vec3::ZERO, Vec3::ZERO), Some(1));
        assert_eq!(spawn_grenade(&schemas, &mut view, 0, Vec3::ZERO, Vec3::ZERO), None);
    }

    #[test]
    fn test_falloff() {
        let grenades = Grenades::new(StandardSchemas::new(2, 2));
        assert_eq!(grenades.damage_at(0.0), 80);
        assert_eq!(grenades.damage_at(2.5), 40);
        assert_eq!(grenades.damage_at(5.0), 0);
    }

    #[test]
    fn test_fuse_detonates_and_frees_slot() {
        let schemas = StandardSchemas::new(2, 2);
        let config = GrenadeConfig { gravity: 0.0, ..GrenadeConfig::default() };
        let mut grenades = Grenades::with_config(Arc::clone(&schemas), config);
        let mut session = session_with_players(&schemas);
        let entities = schemas.session_ids.entities;
        let index = spawn_grenade(&schemas, &mut session.view_mut(), 1, Vec3::ZERO, Vec3::ZERO).unwrap();

        // 1.5 s: still live
        grenades.modify(&ctx(1_500_000), &mut session.view_mut(), index);
        assert!(!session.view().element(entities, index).is_present(schemas.entity_ids.detonated));

        // 2.0 s: detonates on top of player 0
        grenades.modify(&ctx(500_000), &mut session.view_mut(), index);
        let entity = session.view().element(entities, index);
        assert_eq!(entity.get_bool(schemas.entity_ids.detonated), Some(true));
        let victim = schemas.player_of(session.view(), 0);
        assert_eq!(victim.get_u8(schemas.player_ids.health), Some(20));
        let far = schemas.player_of(session.view(), 1);
        assert_eq!(far.get_u8(schemas.player_ids.health), Some(100));
        assert_eq!(far.get_u16(schemas.player_ids.damage), Some(80));

        // linger expires
        grenades.modify(&ctx(200_000), &mut session.view_mut(), index);
        assert!(!session.view().element(entities, index).is_present(schemas.entity_ids.kind));
    }

    #[test]
    fn test_bounce() {
        let schemas = StandardSchemas::new(1, 1);
        let mut grenades = Grenades::new(Arc::clone(&schemas));
        let mut session = Snapshot::new(&schemas.session);
        let index = spawn_grenade(
            &schemas,
            &mut session.view_mut(),
            0,
            Vec3::new(0.0, 0.1, 0.0),
            Vec3::new(1.0, -10.0, 0.0),
        )
        .unwrap();
        grenades.modify(&ctx(100_000), &mut session.view_mut(), index);
        let entity = session.view().element(schemas.session_ids.entities, index);
        let position = entity.get_vec3(schemas.entity_ids.position).unwrap();
        let velocity = entity.get_vec3(schemas.entity_ids.velocity).unwrap();
        assert_eq!(position.y, 0.0);
        assert!(velocity.y > 0.0);
        assert!(velocity.x < 1.0);
    }
}
