//! Game Logic Module
//!
//! Trust rules, the modifier/mode/entity contracts, clocks, interpolation,
//! and the standard schemas with a reference game built on them.
//!
//! ## Module Structure
//!
//! - `trust`: merge and prediction-check rules driven by field metadata
//! - `stepper`: `PlayerModifier`, `Mode`, `EntitySystem` and their registries
//! - `clock`: localized-time estimates with drift snapping
//! - `interpolate`: render-time blending of history samples
//! - `input`: device sampling
//! - `standard`: session/player/input/entity schemas and ids
//! - `movement`, `deathmatch`, `throwables`: the reference game

pub mod trust;
pub mod stepper;
pub mod clock;
pub mod interpolate;
pub mod input;
pub mod standard;
pub mod movement;
pub mod deathmatch;
pub mod throwables;

// Re-export key types
pub use stepper::{
    Commands, EntityManager, EntitySystem, Mode, ModeRegistry, ModifierError,
    PlayerModifier, SessionSystems, StepContext, TickContext,
};
pub use clock::ClockUpdate;
pub use interpolate::Bracket;
pub use input::{IdleInput, InputDevice, InputFrame, ScriptedInput};
pub use standard::StandardSchemas;
pub use movement::MovementModifier;
pub use deathmatch::Deathmatch;
pub use throwables::Grenades;
