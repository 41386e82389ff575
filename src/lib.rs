//! # tickstate
//!
//! Client-server state synchronization for fixed-tick multiplayer games:
//! an authoritative server loop, client-side prediction with
//! reconciliation, and render-time interpolation between snapshots.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         TICKSTATE                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/             - Data model                              │
//! │  ├── schema.rs     - Field trees with per-node metadata      │
//! │  ├── snapshot.rs   - Flat field storage, views, navigation   │
//! │  ├── history.rs    - Fixed-capacity ring of snapshots        │
//! │  ├── ticker.rs     - Fixed-step tick pacing                  │
//! │  └── hash.rs       - Snapshot digests                        │
//! │                                                              │
//! │  game/             - Rules                                   │
//! │  ├── trust.rs      - Merge and prediction-check rules        │
//! │  ├── stepper.rs    - Modifier, mode and entity contracts     │
//! │  ├── clock.rs      - Localized clocks with drift snapping    │
//! │  ├── interpolate.rs- Render-time blending                    │
//! │  └── standard.rs   - Standard schemas + reference game       │
//! │                                                              │
//! │  network/          - Loops and wire                          │
//! │  ├── server.rs     - Authoritative tick loop                 │
//! │  ├── client.rs     - Prediction and reconciliation           │
//! │  ├── protocol.rs   - Wire snapshots and messages             │
//! │  └── transport.rs  - Transport traits + loopback             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism
//!
//! Player steps are pure functions of `(player, command, duration)`. The
//! client replays them after a correction and must land where the server
//! did, so modifiers never read wall-clock time, iterate hash maps, or draw
//! from an unseeded RNG.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use core::history::History;
pub use core::schema::{FieldId, Schema, SchemaBuilder, Trust};
pub use core::snapshot::{FieldRead, FieldWrite, Snapshot, SnapshotMut, SnapshotRef};
pub use core::ticker::{TickStep, Ticker};
pub use core::value::{FieldKind, Value};
pub use core::vec3::Vec3;
pub use game::stepper::{Commands, Mode, PlayerModifier, SessionSystems};
pub use game::standard::StandardSchemas;
pub use network::client::ClientLoop;
pub use network::config::SessionConfig;
pub use network::server::ServerLoop;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
