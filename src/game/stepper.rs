//! Simulation Stepper
//!
//! The contracts the loops call into. Game behavior lives behind three
//! seams:
//!
//! - [`PlayerModifier`]: per-player input, cosmetic and authoritative steps.
//! - [`Mode`]: session-level rules (spawning, scoring, phases).
//! - [`EntitySystem`]: per-kind world entity behavior.
//!
//! `modify_checked` is the only hook both ends run on the same data, so it
//! must be a pure function of `(player, commands, duration)`. The client
//! re-executes it during replay.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::core::schema::Schema;
use crate::core::snapshot::{FieldRead, Snapshot, SnapshotMut, SnapshotRef};
use crate::game::input::InputFrame;
use crate::game::standard::StandardSchemas;
use crate::game::trust;

// =============================================================================
// ERRORS
// =============================================================================

/// Failure raised by a modifier or mode while stepping one player.
#[derive(Debug, Error)]
pub enum ModifierError {
    /// A field the step needs has no value.
    #[error("player {player_id} has no value for `{field}`")]
    MissingField {
        /// Player being stepped
        player_id: u8,
        /// Field name
        field: &'static str,
    },

    /// The step produced a NaN or infinite value.
    #[error("player {player_id} produced a non-finite `{field}`")]
    NonFinite {
        /// Player being stepped
        player_id: u8,
        /// Field name
        field: &'static str,
    },

    /// The step refused the command.
    #[error("rejected command from player {player_id}: {reason}")]
    Rejected {
        /// Player being stepped
        player_id: u8,
        /// Why
        reason: String,
    },
}

// =============================================================================
// CONTEXTS
// =============================================================================

/// Per-player step parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepContext {
    /// Player being stepped
    pub player_id: u8,
    /// Step duration in microseconds (client-reported on the server)
    pub duration_us: u32,
}

/// Session-level tick parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickContext {
    /// Tick number
    pub tick: u32,
    /// Absolute tick time (us)
    pub time_us: u64,
    /// Tick duration (us)
    pub duration_us: u32,
    /// Nominal tick interval (us)
    pub tick_interval_us: u32,
}

impl TickContext {
    /// Step context for one player with an explicit duration.
    #[inline]
    pub fn step(&self, player_id: u8, duration_us: u32) -> StepContext {
        StepContext { player_id, duration_us }
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

/// A command snapshot: the player schema plus input fields.
///
/// `player` carries the client stamp, client-trusted fields and any server
/// overrides; `input` carries axes and button edges.
#[derive(Clone)]
pub struct Commands {
    /// Player-schema part
    pub player: Snapshot,
    /// Input part
    pub input: Snapshot,
}

impl Commands {
    /// Allocate with every field absent.
    pub fn new(player: &Arc<Schema>, input: &Arc<Schema>) -> Self {
        Self {
            player: Snapshot::new(player),
            input: Snapshot::new(input),
        }
    }

    /// Allocate from the standard schemas.
    pub fn standard(schemas: &StandardSchemas) -> Self {
        Self::new(&schemas.player, &schemas.input)
    }

    /// Value-copy both parts.
    pub fn copy_from(&mut self, other: &Commands) {
        self.player.copy_from(other.player.view());
        self.input.copy_from(other.input.view());
    }

    /// Clear single-tick fields in both parts.
    pub fn clear_single_tick(&mut self) {
        trust::clear_single_tick(&mut self.player.view_mut());
        trust::clear_single_tick(&mut self.input.view_mut());
    }

    /// Make every field absent.
    pub fn clear(&mut self) {
        self.player.clear();
        self.input.clear();
    }
}

impl fmt::Debug for Commands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Commands")
            .field("player", &self.player)
            .field("input", &self.input)
            .finish()
    }
}

// =============================================================================
// PLAYER MODIFIER
// =============================================================================

/// Per-player behavior.
pub trait PlayerModifier: Send {
    /// Client only: fill command fields from device state.
    fn modify_commands(&mut self, _ctx: &TickContext, _frame: &InputFrame, _commands: &mut Commands) {}

    /// Client only: instantaneous cosmetic effects written into
    /// `commands.player` (camera look). `verified` is the latest predicted
    /// player.
    fn modify_trusted(&mut self, _ctx: &TickContext, _commands: &mut Commands, _verified: SnapshotRef<'_>) {}

    /// The authoritative step. Deterministic in `(player, commands,
    /// ctx.duration_us)`; a zero duration must leave `player` unchanged.
    fn modify_checked(
        &self,
        ctx: &StepContext,
        player: &mut SnapshotMut<'_>,
        commands: &Commands,
    ) -> Result<(), ModifierError>;

    /// Client only: push authoritative state to presentation.
    fn synchronize(&mut self, _player_id: u8, _player: SnapshotRef<'_>) {}
}

// =============================================================================
// MODE
// =============================================================================

/// Session-level rules.
///
/// Every hook except `render` runs on the server only.
pub trait Mode: Send {
    /// Mode id carried in `session.mode_id`.
    fn id(&self) -> u8;

    /// Display name.
    fn name(&self) -> &'static str;

    /// A player slot was just activated; the slot has been zeroed.
    fn setup_new_player(&mut self, ctx: &TickContext, session: &mut SnapshotMut<'_>, player_id: u8) {
        self.spawn_player(ctx, session, player_id);
    }

    /// Place a player into the world.
    fn spawn_player(&mut self, _ctx: &TickContext, _session: &mut SnapshotMut<'_>, _player_id: u8) {}

    /// Before commands are drained.
    fn pre_tick(&mut self, _ctx: &TickContext, _session: &mut SnapshotMut<'_>) {}

    /// After one player's `modify_checked`, with the same command.
    fn modify_player(
        &mut self,
        _ctx: &StepContext,
        _session: &mut SnapshotMut<'_>,
        _commands: &Commands,
    ) -> Result<(), ModifierError> {
        Ok(())
    }

    /// Global step, after entities.
    fn modify(&mut self, _ctx: &TickContext, _session: &mut SnapshotMut<'_>) {}

    /// Last write to the session before it is sent.
    fn post_tick(&mut self, _ctx: &TickContext, _session: &mut SnapshotMut<'_>) {}

    /// The first session going to `player_id` is about to be sent.
    fn on_send_initial_data(&mut self, _player_id: u8, _send: &mut SnapshotMut<'_>) {}

    /// Client only: present an interpolated session.
    fn render(&mut self, _session: SnapshotRef<'_>, _render_time_us: u64) {}
}

/// Modes by id.
#[derive(Default)]
pub struct ModeRegistry {
    modes: BTreeMap<u8, Box<dyn Mode>>,
}

impl ModeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mode under its own id, replacing any previous one.
    pub fn register(&mut self, mode: Box<dyn Mode>) -> &mut Self {
        self.modes.insert(mode.id(), mode);
        self
    }

    /// Mode by id.
    pub fn get_mut(&mut self, id: u8) -> Option<&mut (dyn Mode + 'static)> {
        self.modes.get_mut(&id).map(|mode| mode.as_mut())
    }

    /// Whether a mode is registered.
    pub fn contains(&self, id: u8) -> bool {
        self.modes.contains_key(&id)
    }
}

impl fmt::Debug for ModeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.modes.values().map(|m| (m.id(), m.name())))
            .finish()
    }
}

// =============================================================================
// ENTITIES
// =============================================================================

/// Behavior of one entity kind.
pub trait EntitySystem: Send {
    /// Entity kind handled.
    fn kind(&self) -> u8;

    /// Server: advance the entity at `index` by one tick.
    fn modify(&mut self, ctx: &TickContext, session: &mut SnapshotMut<'_>, index: usize);

    /// Client: present one interpolated entity.
    fn render(&mut self, _index: usize, _entity: SnapshotRef<'_>, _render_time_us: u64) {}
}

/// Entity systems by kind, swept over the session's entity array.
pub struct EntityManager {
    schemas: Arc<StandardSchemas>,
    systems: BTreeMap<u8, Box<dyn EntitySystem>>,
}

impl EntityManager {
    /// Empty manager.
    pub fn new(schemas: Arc<StandardSchemas>) -> Self {
        Self {
            schemas,
            systems: BTreeMap::new(),
        }
    }

    /// Register a system under its kind.
    pub fn register(&mut self, system: Box<dyn EntitySystem>) -> &mut Self {
        self.systems.insert(system.kind(), system);
        self
    }

    fn kind_at(&self, session: SnapshotRef<'_>, index: usize) -> Option<u8> {
        session
            .element(self.schemas.session_ids.entities, index)
            .get_u8(self.schemas.entity_ids.kind)
    }

    /// Run every live entity's system once. Returns how many ran.
    pub fn modify_all(&mut self, ctx: &TickContext, session: &mut SnapshotMut<'_>) -> usize {
        let mut ran = 0;
        for index in 0..self.schemas.max_entities {
            let Some(kind) = self.kind_at(session.as_ref(), index) else {
                continue;
            };
            if let Some(system) = self.systems.get_mut(&kind) {
                system.modify(ctx, session, index);
                ran += 1;
            }
        }
        ran
    }

    /// Render every live entity of an interpolated session.
    pub fn render_all(&mut self, session: SnapshotRef<'_>, render_time_us: u64) {
        for index in 0..self.schemas.max_entities {
            let Some(kind) = self.kind_at(session, index) else {
                continue;
            };
            if let Some(system) = self.systems.get_mut(&kind) {
                let entity = session.element(self.schemas.session_ids.entities, index);
                system.render(index, entity, render_time_us);
            }
        }
    }
}

impl fmt::Debug for EntityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityManager")
            .field("kinds", &self.systems.keys().collect::<Vec<_>>())
            .finish()
    }
}

// =============================================================================
// SESSION SYSTEMS
// =============================================================================

/// Everything a loop needs to step a session, injected at construction.
pub struct SessionSystems {
    /// Schemas and ids
    pub schemas: Arc<StandardSchemas>,
    /// Player modifier
    pub modifier: Box<dyn PlayerModifier>,
    /// Registered modes
    pub modes: ModeRegistry,
    /// Entity systems
    pub entities: EntityManager,
}

impl SessionSystems {
    /// Systems with no modes or entity kinds registered.
    pub fn new(schemas: Arc<StandardSchemas>, modifier: Box<dyn PlayerModifier>) -> Self {
        let entities = EntityManager::new(Arc::clone(&schemas));
        Self {
            schemas,
            modifier,
            modes: ModeRegistry::new(),
            entities,
        }
    }
}

impl fmt::Debug for SessionSystems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSystems")
            .field("modes", &self.modes)
            .field("entities", &self.entities)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::snapshot::FieldWrite;

    struct Counter {
        calls: u32,
    }

    impl EntitySystem for Counter {
        fn kind(&self) -> u8 {
            7
        }

        fn modify(&mut self, _ctx: &TickContext, _session: &mut SnapshotMut<'_>, _index: usize) {
            self.calls += 1;
        }
    }

    struct Named(u8);

    impl Mode for Named {
        fn id(&self) -> u8 {
            self.0
        }

        fn name(&self) -> &'static str {
            "named"
        }
    }

    fn ctx() -> TickContext {
        TickContext { tick: 1, time_us: 0, duration_us: 16_666, tick_interval_us: 16_666 }
    }

    #[test]
    fn test_modify_all_skips_free_slots() {
        let schemas = StandardSchemas::new(2, 4);
        let mut manager = EntityManager::new(Arc::clone(&schemas));
        manager.register(Box::new(Counter { calls: 0 }));

        let mut session = Snapshot::new(&schemas.session);
        {
            let mut view = session.view_mut();
            view.element_mut(schemas.session_ids.entities, 1).set_u8(schemas.entity_ids.kind, 7);
            // unknown kind is ignored
            view.element_mut(schemas.session_ids.entities, 3).set_u8(schemas.entity_ids.kind, 9);
        }
        let ran = manager.modify_all(&ctx(), &mut session.view_mut());
        assert_eq!(ran, 1);
    }

    #[test]
    fn test_mode_registry() {
        let mut registry = ModeRegistry::new();
        registry.register(Box::new(Named(0))).register(Box::new(Named(3)));
        assert!(registry.contains(3));
        assert!(!registry.contains(1));
        assert_eq!(registry.get_mut(3).map(|m| m.id()), Some(3));
    }

    #[test]
    fn test_commands_single_tick() {
        let schemas = StandardSchemas::new(2, 2);
        let mut commands = Commands::standard(&schemas);
        commands.input.set_bool(schemas.input_ids.jump, true);
        commands.input.set_f32(schemas.input_ids.move_x, 0.5);

        let mut copy = Commands::standard(&schemas);
        copy.copy_from(&commands);
        commands.clear_single_tick();

        assert!(!commands.input.has(schemas.input_ids.jump));
        assert_eq!(commands.input.get_f32(schemas.input_ids.move_x), Some(0.5));
        assert_eq!(copy.input.get_bool(schemas.input_ids.jump), Some(true));
    }
}
