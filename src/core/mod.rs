//! Core data model.
//!
//! Schemas, snapshots and the history ring, plus the small deterministic
//! helpers the loops rely on (digests, RNG, fixed-step ticker). Nothing in
//! here knows about trust rules, players or the network.

pub mod vec3;
pub mod value;
pub mod schema;
pub mod snapshot;
pub mod history;
pub mod hash;
pub mod rng;
pub mod ticker;

// Re-export core types
pub use vec3::Vec3;
pub use value::{Field, FieldKind, Value};
pub use schema::{FieldId, FieldMeta, Interpolation, Node, NodeKind, Schema, SchemaBuilder, Trust};
pub use snapshot::{
    navigate, navigate_mut, navigate_zipped, navigate_zipped_mut,
    FieldRead, FieldWrite, Navigation, Snapshot, SnapshotMut, SnapshotRef,
};
pub use history::History;
pub use hash::{hash_snapshot, StateHash};
pub use rng::DeterministicRng;
pub use ticker::{TickStep, Ticker};
