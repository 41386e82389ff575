//! Network Layer
//!
//! The two loops that keep sessions in sync, the wire format between them,
//! and the transport seam they talk through. All simulation rules live in
//! `game/`; this layer decides when they run and on which snapshot.
//!
//! ## Module Structure
//!
//! - `config`: session settings shared by both loops
//! - `protocol`: wire snapshots, compression and message types
//! - `transport`: non-blocking transport traits and an in-process loopback
//! - `server`: authoritative tick loop
//! - `client`: prediction, reconciliation and render interpolation

pub mod config;
pub mod protocol;
pub mod transport;
pub mod server;
pub mod client;


pub use config::{ConfigError, SessionConfig};
pub use protocol::{
    decode_into, encode_compressed, encode_snapshot, ClientMessage, ProtocolError, ServerMessage,
    WireField, WireSnapshot,
};
pub use transport::{
    loopback, ClientEvent, ClientTransport, LoopbackClient, LoopbackConnector, LoopbackServer, PeerId,
    ServerEvent, ServerTransport, TransportError,
};
pub use server::{ServerError, ServerLoop, ServerState, ServerStats};
pub use client::{ClientError, ClientLoop, ClientState, ClientStats, RenderFrame};
