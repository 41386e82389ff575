//! Network Protocol
//!
//! Message types exchanged between the client and server loops, and the
//! snapshot wire form they carry.
//!
//! A [`WireSnapshot`] is the schema's leaves in pre-order, each with its
//! value (if present) and two flags: the server-override marker and the
//! "same as what you already have" marker set by session compression.
//! Local-only leaves always travel absent.
//!
//! Messages serialize as JSON for debugging and bincode on the wire.
//! Enums are externally tagged (bincode cannot decode internally tagged
//! enums).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::schema::{FieldId, Node};
use crate::core::snapshot::{navigate, navigate_mut, navigate_zipped, Navigation, SnapshotMut, SnapshotRef};
use crate::core::value::{FieldKind, Value};

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Binary encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Snapshot was built from a different schema.
    #[error("schema shape mismatch: expected {expected:016x}, got {got:016x}")]
    ShapeMismatch {
        /// Receiver's shape
        expected: u64,
        /// Sender's shape
        got: u64,
    },

    /// Leaf count does not match the schema.
    #[error("expected {expected} fields, got {got}")]
    FieldCount {
        /// Receiver's leaf count
        expected: usize,
        /// Leaves in the message
        got: usize,
    },

    /// A value's type does not match its leaf.
    #[error("field {index}: expected {expected:?}, got {got:?}")]
    KindMismatch {
        /// Leaf position in pre-order
        index: usize,
        /// Schema kind
        expected: FieldKind,
        /// Received kind
        got: FieldKind,
    },
}

// =============================================================================
// SNAPSHOT WIRE FORM
// =============================================================================

/// One leaf on the wire.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WireField {
    /// `FLAG_*` bits.
    pub flags: u8,
    /// Value when present.
    pub value: Option<Value>,
}

impl WireField {
    /// Value carries a server override.
    pub const FLAG_OVERRIDE: u8 = 0b01;
    /// Sender omitted the value because the receiver already has it.
    pub const FLAG_SAME: u8 = 0b10;

    const SAME: WireField = WireField { flags: Self::FLAG_SAME, value: None };

    /// Whether a flag is set.
    #[inline]
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// A snapshot as sent: schema fingerprint plus every leaf in pre-order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WireSnapshot {
    /// Shape of the sender's schema.
    pub shape: u64,
    /// Leaves in pre-order.
    pub fields: Vec<WireField>,
}

/// Encode every leaf of a view.
pub fn encode_snapshot(view: SnapshotRef<'_>) -> WireSnapshot {
    let mut fields = Vec::with_capacity(view.fields().len());
    navigate(view, |_, node, field| {
        if let Some(field) = field {
            fields.push(if node.meta.local_only {
                WireField::default()
            } else {
                WireField {
                    flags: if field.is_override { WireField::FLAG_OVERRIDE } else { 0 },
                    value: field.get().cloned(),
                }
            });
        }
        Navigation::Continue
    });
    WireSnapshot { shape: view.shape(), fields }
}

/// Whether a leaf may be sent as "same".
fn compressible(node: &Node) -> bool {
    let meta = &node.meta;
    !(meta.single_tick || meta.never_compress || meta.local_only)
        && !matches!(node.field_kind(), Some(FieldKind::Vec3 | FieldKind::Str) | None)
}

/// Encode a view, marking leaves equal to `baseline` as "same".
///
/// Single-tick, never-compress, vector and string leaves are always sent
/// in full, as are leaves carrying an override.
pub fn encode_compressed(view: SnapshotRef<'_>, baseline: SnapshotRef<'_>) -> WireSnapshot {
    let mut fields = Vec::with_capacity(view.fields().len());
    navigate_zipped(view, baseline, |_, node, pair| {
        let Some((field, base)) = pair else {
            return Navigation::Continue;
        };
        fields.push(if node.meta.local_only {
            WireField::default()
        } else if compressible(node) && !field.is_override && field.is_present() && field.value_eq(base) {
            WireField::SAME
        } else {
            WireField {
                flags: if field.is_override { WireField::FLAG_OVERRIDE } else { 0 },
                value: field.get().cloned(),
            }
        });
        Navigation::Continue
    });
    WireSnapshot { shape: view.shape(), fields }
}

/// Decode into a same-schema view, overwriting every leaf.
///
/// "Same" leaves decode absent with `was_same` set; the receiver keeps its
/// own value for them. Local-only leaves decode absent.
pub fn decode_into(wire: &WireSnapshot, target: &mut SnapshotMut<'_>) -> Result<(), ProtocolError> {
    let expected = target.as_ref().shape();
    if wire.shape != expected {
        return Err(ProtocolError::ShapeMismatch { expected, got: wire.shape });
    }
    let count = target.as_ref().fields().len();
    if wire.fields.len() != count {
        return Err(ProtocolError::FieldCount { expected: count, got: wire.fields.len() });
    }

    let mut incoming = wire.fields.iter().enumerate();
    let mut error = None;
    navigate_mut(target, |_, node, field| {
        let (Some(field), Some((index, wire))) = (field, field_next(node, &mut incoming)) else {
            return Navigation::Continue;
        };
        field.clear();
        field.was_same = false;
        if node.meta.local_only {
            return Navigation::Continue;
        }
        match &wire.value {
            Some(value) if value.kind() != field.kind() => {
                error = Some(ProtocolError::KindMismatch { index, expected: field.kind(), got: value.kind() });
                return Navigation::Stop;
            }
            Some(value) => {
                field.set_ref(value);
                field.is_override = wire.has(WireField::FLAG_OVERRIDE);
            }
            None => field.was_same = wire.has(WireField::FLAG_SAME),
        }
        Navigation::Continue
    });
    error.map_or(Ok(()), Err)
}

/// Pull the next wire leaf only when standing on a schema leaf.
#[inline]
fn field_next<'w>(
    node: &Node,
    incoming: &mut impl Iterator<Item = (usize, &'w WireField)>,
) -> Option<(usize, &'w WireField)> {
    if node.is_property() {
        incoming.next()
    } else {
        None
    }
}

/// Position of a leaf in a wire snapshot's field list.
pub fn wire_index(view: SnapshotRef<'_>, id: FieldId) -> Option<usize> {
    let mut index = 0;
    let mut found = None;
    navigate(view, |at, node, _| {
        if at == id {
            found = node.is_property().then_some(index);
            return Navigation::Stop;
        }
        if node.is_property() {
            index += 1;
        }
        Navigation::Continue
    });
    found
}

// =============================================================================
// MESSAGES
// =============================================================================

/// Messages from client to server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Optional first message: requested display name.
    Join {
        /// Display name (truncated by the server)
        username: String,
    },
    /// This tick's command.
    Commands {
        /// Player-schema part
        player: WireSnapshot,
        /// Input part
        input: WireSnapshot,
    },
    /// Echo of a server ping check.
    PingCheck {
        /// Tick the check was issued on
        tick: u32,
    },
    /// Client's predicted player, for server-side logging.
    DebugView {
        /// Predicted player snapshot
        player: WireSnapshot,
    },
}

/// Messages from server to client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Authoritative session for this tick.
    Session {
        /// Session snapshot addressed to this client
        snapshot: WireSnapshot,
        /// Server tick of the entry "same" fields refer to, when compressed
        baseline_tick: Option<u32>,
    },
    /// Round-trip probe; echo back unchanged.
    PingCheck {
        /// Tick the check was issued on
        tick: u32,
    },
    /// Server is closing the connection.
    Disconnect {
        /// Human-readable reason
        reason: String,
    },
}

macro_rules! impl_codec {
    ($ty:ty) => {
        impl $ty {
            /// Serialize to JSON.
            pub fn to_json(&self) -> Result<String, ProtocolError> {
                Ok(serde_json::to_string(self)?)
            }

            /// Deserialize from JSON.
            pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
                Ok(serde_json::from_str(s)?)
            }

            /// Serialize to binary.
            pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
                Ok(bincode::serialize(self)?)
            }

            /// Deserialize from binary.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
                Ok(bincode::deserialize(bytes)?)
            }
        }
    };
}

impl_codec!(ClientMessage);
impl_codec!(ServerMessage);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::core::schema::{Schema, SchemaBuilder, Trust};
    use crate::core::snapshot::{FieldRead, FieldWrite, Snapshot};
    use crate::core::vec3::Vec3;

    fn schema() -> Arc<Schema> {
        SchemaBuilder::new("player")
            .component("stamp", |c| c.prop("tick", FieldKind::U32)).never_compress()
            .prop("position", FieldKind::Vec3)
            .prop("health", FieldKind::U8).trust(Trust::ServerOnly)
            .prop("kills", FieldKind::U16)
            .prop("hit", FieldKind::Bool).single_tick()
            .prop("rtt_us", FieldKind::U32).local_only()
            .build()
    }

    fn filled(schema: &Arc<Schema>) -> Snapshot {
        let mut snapshot = Snapshot::new(schema);
        snapshot.set_u32(schema.id("stamp.tick"), 9);
        snapshot.set_vec3(schema.id("position"), Vec3::new(1.0, 2.0, 3.0));
        snapshot.set_u8(schema.id("health"), 90);
        snapshot.set_u16(schema.id("kills"), 2);
        snapshot.set_bool(schema.id("hit"), true);
        snapshot.set_u32(schema.id("rtt_us"), 40_000);
        snapshot
    }

    #[test]
    fn test_local_only_not_sent() {
        let schema = schema();
        let source = filled(&schema);
        let wire = encode_snapshot(source.view());
        let index = wire_index(source.view(), schema.id("rtt_us")).unwrap();
        assert_eq!(wire.fields[index], WireField::default());

        let mut target = Snapshot::new(&schema);
        target.set_u32(schema.id("rtt_us"), 5);
        decode_into(&wire, &mut target.view_mut()).unwrap();
        assert!(!target.has(schema.id("rtt_us")));
        assert_eq!(target.get_u8(schema.id("health")), Some(90));
        assert_eq!(target.get_vec3(schema.id("position")), Some(Vec3::new(1.0, 2.0, 3.0)));
    }

    #[test]
    fn test_override_flag_travels() {
        let schema = schema();
        let mut source = Snapshot::new(&schema);
        source.view_mut().set_override(schema.id("position"), Value::Vec3(Vec3::ZERO));
        let wire = encode_snapshot(source.view());

        let mut target = Snapshot::new(&schema);
        decode_into(&wire, &mut target.view_mut()).unwrap();
        assert!(target.view().field(schema.id("position")).is_override);
        assert!(!target.view().field(schema.id("health")).is_override);
    }

    #[test]
    fn test_compression_rules() {
        let schema = schema();
        let current = filled(&schema);
        let baseline = filled(&schema);
        let wire = encode_compressed(current.view(), baseline.view());
        let at = |path: &str| &wire.fields[wire_index(current.view(), schema.id(path)).unwrap()];

        // plain scalars compress
        assert!(at("health").has(WireField::FLAG_SAME));
        assert!(at("kills").has(WireField::FLAG_SAME));
        // never-compress, vector and single-tick leaves always go in full
        assert_eq!(at("stamp.tick").value, Some(Value::U32(9)));
        assert_eq!(at("position").value, Some(Value::Vec3(Vec3::new(1.0, 2.0, 3.0))));
        assert_eq!(at("hit").value, Some(Value::Bool(true)));

        let mut target = Snapshot::new(&schema);
        decode_into(&wire, &mut target.view_mut()).unwrap();
        let health = target.view().field(schema.id("health"));
        assert!(health.was_same);
        assert!(!health.is_present());
    }

    #[test]
    fn test_changed_value_not_compressed() {
        let schema = schema();
        let current = filled(&schema);
        let mut baseline = filled(&schema);
        baseline.set_u8(schema.id("health"), 100);
        let wire = encode_compressed(current.view(), baseline.view());
        let index = wire_index(current.view(), schema.id("health")).unwrap();
        assert_eq!(wire.fields[index].value, Some(Value::U8(90)));
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let schema = schema();
        let other = SchemaBuilder::new("other").prop("x", FieldKind::U8).build();
        let wire = encode_snapshot(Snapshot::new(&other).view());
        let mut target = Snapshot::new(&schema);
        let err = decode_into(&wire, &mut target.view_mut()).unwrap_err();
        assert!(matches!(err, ProtocolError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let schema = schema();
        let mut wire = encode_snapshot(filled(&schema).view());
        let index = wire_index(Snapshot::new(&schema).view(), schema.id("kills")).unwrap();
        wire.fields[index].value = Some(Value::Bool(true));
        let mut target = Snapshot::new(&schema);
        let err = decode_into(&wire, &mut target.view_mut()).unwrap_err();
        assert!(matches!(err, ProtocolError::KindMismatch { expected: FieldKind::U16, got: FieldKind::Bool, .. }));
    }

    #[test]
    fn test_message_binary_and_json() {
        let schema = schema();
        let message = ClientMessage::Commands {
            player: encode_snapshot(filled(&schema).view()),
            input: WireSnapshot::default(),
        };
        let bytes = message.to_bytes().unwrap();
        assert_eq!(ClientMessage::from_bytes(&bytes).unwrap(), message);

        let json = ServerMessage::Disconnect { reason: "timed out".into() }.to_json().unwrap();
        assert!(json.contains("Disconnect"));
        assert_eq!(
            ServerMessage::from_json(&json).unwrap(),
            ServerMessage::Disconnect { reason: "timed out".into() }
        );
    }

    #[test]
    fn test_garbage_bytes_rejected() {
        assert!(matches!(ServerMessage::from_bytes(&[0xff, 0xff, 0xff, 0xff, 0xff]), Err(ProtocolError::Codec(_))));
    }
}
