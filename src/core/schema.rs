//! Snapshot Schema
//!
//! A static descriptor of a snapshot's structure: a flat table of nodes in
//! depth-first, left-to-right order. Components and arrays are interior
//! nodes; properties are leaves that own one field slot each.
//!
//! Schemas are built once with [`SchemaBuilder`] and shared behind an
//! [`Arc`]. Per-field metadata (trust class, tolerance, single-tick, ...)
//! lives on the nodes, so the walkers in [`super::snapshot`] are plain
//! table scans.
//!
//! ```
//! use tickstate::core::schema::{SchemaBuilder, Trust};
//! use tickstate::core::value::{FieldKind, Value};
//!
//! let player = SchemaBuilder::new("player")
//!     .component("move", |c| c
//!         .prop("position", FieldKind::Vec3).tolerance(0.01)
//!         .prop("ground_tick", FieldKind::U8))
//!     .prop("health", FieldKind::U8).trust(Trust::ServerOnly).default_value(Value::U8(100))
//!     .build();
//!
//! assert_eq!(player.slot_count(), 3);
//! assert!(player.find("move.position").is_some());
//! ```

use std::fmt;
use std::sync::Arc;

use super::value::{FieldKind, Value};

// =============================================================================
// METADATA
// =============================================================================

/// Trust class of a field (or of a whole component subtree).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Trust {
    /// Must match exactly for prediction to hold; both sides may mutate.
    #[default]
    Checked,
    /// Server takes the client's value verbatim; never a misprediction.
    ClientTrusted,
    /// Authoritative only on the server; clients always overwrite theirs.
    ServerOnly,
}

/// How a leaf is blended between two history samples.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Interpolation {
    /// Straight lerp (floats and vectors).
    Linear,
    /// Shortest path around 360 degrees.
    Angle,
    /// Wraps within `[min, max)`.
    Cyclic {
        /// Inclusive lower bound
        min: f32,
        /// Exclusive upper bound
        max: f32,
    },
    /// Takes the nearer sample.
    Step,
}

/// Per-node metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldMeta {
    /// Trust class; inherited by every descendant.
    pub trust: Trust,
    /// Cleared to absent after one simulation step; inherited.
    pub single_tick: bool,
    /// Prediction-check epsilon for float and vector leaves.
    pub tolerance: Option<f32>,
    /// Never marked "same" by session compression; inherited.
    pub never_compress: bool,
    /// Exists only at this end of the connection: not sent, never applied
    /// from a received snapshot, never prediction-checked. Inherited.
    pub local_only: bool,
    /// Blend rule used by the interpolator.
    pub interpolation: Interpolation,
    /// Value written by `zero()`. Falls back to the kind's zero.
    pub default: Option<Value>,
}

impl FieldMeta {
    fn for_kind(kind: Option<FieldKind>) -> Self {
        let interpolation = match kind {
            Some(k) if k.is_continuous() => Interpolation::Linear,
            _ => Interpolation::Step,
        };
        Self {
            trust: Trust::Checked,
            single_tick: false,
            tolerance: None,
            never_compress: false,
            local_only: false,
            interpolation,
            default: None,
        }
    }

    /// Trust-agnostic flags a child inherits from its parent.
    fn inherit(&mut self, parent: &FieldMeta) {
        if self.trust == Trust::Checked {
            self.trust = parent.trust;
        }
        self.single_tick |= parent.single_tick;
        self.never_compress |= parent.never_compress;
        self.local_only |= parent.local_only;
    }
}

// =============================================================================
// NODES
// =============================================================================

/// Structural kind of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Named group of children.
    Component,
    /// Fixed-length array of identical element subtrees.
    Array {
        /// Element count
        len: u16,
    },
    /// Leaf holding one field.
    Property(FieldKind),
}

/// One entry of the flattened schema table.
#[derive(Clone, Debug)]
pub struct Node {
    /// Local name (not a path)
    pub name: &'static str,
    /// Structural kind
    pub kind: NodeKind,
    /// Effective metadata (inherited flags already applied)
    pub meta: FieldMeta,
    /// Number of nodes in this subtree, including itself
    pub subtree_len: usize,
    /// First field slot covered by this subtree (own slot for leaves)
    pub slot: usize,
    /// Number of field slots in this subtree
    pub slot_count: usize,
    /// Structural fingerprint of the subtree
    pub shape: u64,
}

impl Node {
    /// Whether this node is a leaf.
    #[inline]
    pub fn is_property(&self) -> bool {
        matches!(self.kind, NodeKind::Property(_))
    }

    /// Leaf kind, if a leaf.
    #[inline]
    pub fn field_kind(&self) -> Option<FieldKind> {
        match self.kind {
            NodeKind::Property(kind) => Some(kind),
            _ => None,
        }
    }

    /// Default value written by `zero()`.
    pub fn default_value(&self) -> Option<Value> {
        let kind = self.field_kind()?;
        Some(self.meta.default.clone().unwrap_or_else(|| Value::zero_of(kind)))
    }
}

/// Index of a node relative to the root of the view it is used with.
///
/// Ids taken from an element schema are valid on every element of an
/// array built from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub u32);

impl FieldId {
    /// The root node of any view.
    pub const ROOT: FieldId = FieldId(0);

    /// Node index.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// =============================================================================
// SCHEMA
// =============================================================================

/// Immutable flattened schema. `nodes[0]` is the root component.
#[derive(Debug)]
pub struct Schema {
    nodes: Vec<Node>,
}

impl Schema {
    /// Root name.
    pub fn name(&self) -> &'static str {
        self.nodes[0].name
    }

    /// All nodes in navigation order.
    #[inline]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Number of leaf slots.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.nodes[0].slot_count
    }

    /// Structural fingerprint.
    #[inline]
    pub fn shape(&self) -> u64 {
        self.nodes[0].shape
    }

    /// Resolve a dotted path (`"move.position"`, `"players.3.health"`).
    pub fn find(&self, path: &str) -> Option<FieldId> {
        find_in(&self.nodes, path)
    }

    /// Resolve a path, panicking on a typo. For schema setup code only.
    pub fn id(&self, path: &str) -> FieldId {
        match self.find(path) {
            Some(id) => id,
            None => panic!("schema `{}` has no field `{}`", self.name(), path),
        }
    }

    /// Dotted path of a node, for logs.
    pub fn path_of(&self, id: FieldId) -> String {
        path_of(&self.nodes, id)
    }
}

/// Resolve a dotted path within a node table rooted at `nodes[0]`.
pub fn find_in(nodes: &[Node], path: &str) -> Option<FieldId> {
    let mut at = 0usize;
    for part in path.split('.').filter(|p| !p.is_empty()) {
        let node = nodes.get(at)?;
        match node.kind {
            NodeKind::Property(_) => return None,
            NodeKind::Array { len } => {
                let index: usize = part.parse().ok()?;
                if index >= len as usize {
                    return None;
                }
                let element_len = nodes.get(at + 1)?.subtree_len;
                at = at + 1 + index * element_len;
            }
            NodeKind::Component => {
                let end = at + node.subtree_len;
                let mut child = at + 1;
                let mut found = None;
                while child < end {
                    if nodes[child].name == part {
                        found = Some(child);
                        break;
                    }
                    child += nodes[child].subtree_len;
                }
                at = found?;
            }
        }
    }
    Some(FieldId(at as u32))
}

/// Dotted path of a node within a table rooted at `nodes[0]`.
pub fn path_of(nodes: &[Node], id: FieldId) -> String {
    let target = id.index();
    let mut parts = Vec::new();
    let mut at = 0usize;
    while at != target && at < nodes.len() {
        let node = &nodes[at];
        let mut child = at + 1;
        let mut index = 0usize;
        let mut next = None;
        while child < at + node.subtree_len {
            if target < child + nodes[child].subtree_len {
                next = Some(child);
                break;
            }
            child += nodes[child].subtree_len;
            index += 1;
        }
        let Some(child) = next else { break };
        match node.kind {
            NodeKind::Array { .. } => parts.push(index.to_string()),
            _ => parts.push(nodes[child].name.to_string()),
        }
        at = child;
    }
    if parts.is_empty() {
        nodes.first().map(|n| n.name.to_string()).unwrap_or_default()
    } else {
        parts.join(".")
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Fluent schema builder.
///
/// Metadata setters (`trust`, `tolerance`, ...) apply to the most recently
/// added child.
#[derive(Debug)]
pub struct SchemaBuilder {
    nodes: Vec<Node>,
    last: Option<usize>,
}

impl SchemaBuilder {
    /// Start a schema whose root component has the given name.
    pub fn new(name: &'static str) -> Self {
        Self {
            nodes: vec![raw_node(name, NodeKind::Component)],
            last: None,
        }
    }

    /// Add a leaf property.
    pub fn prop(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.last = Some(self.nodes.len());
        self.nodes.push(raw_node(name, NodeKind::Property(kind)));
        self
    }

    /// Add a nested component built by `build`.
    pub fn component(mut self, name: &'static str, build: impl FnOnce(SchemaBuilder) -> SchemaBuilder) -> Self {
        let child = build(SchemaBuilder::new(name));
        self.last = Some(self.nodes.len());
        self.nodes.extend(child.into_raw());
        self
    }

    /// Add a fixed-length array whose elements share `element`'s structure.
    pub fn array(mut self, name: &'static str, len: u16, element: &Schema) -> Self {
        self.last = Some(self.nodes.len());
        let mut array = raw_node(name, NodeKind::Array { len });
        array.subtree_len = 1 + element.nodes.len() * len as usize;
        self.nodes.push(array);
        for _ in 0..len {
            self.nodes.extend(element.nodes.iter().cloned());
        }
        self
    }

    /// Set the trust class of the last child.
    pub fn trust(self, trust: Trust) -> Self {
        self.with_last(|m| m.trust = trust)
    }

    /// Mark the last child as single-tick.
    pub fn single_tick(self) -> Self {
        self.with_last(|m| m.single_tick = true)
    }

    /// Set the prediction tolerance of the last child.
    pub fn tolerance(self, epsilon: f32) -> Self {
        self.with_last(|m| m.tolerance = Some(epsilon))
    }

    /// Exclude the last child from session compression.
    pub fn never_compress(self) -> Self {
        self.with_last(|m| m.never_compress = true)
    }

    /// Keep the last child local to this end of the connection.
    pub fn local_only(self) -> Self {
        self.with_last(|m| m.local_only = true)
    }

    /// Set the interpolation rule of the last child.
    pub fn interpolate(self, interpolation: Interpolation) -> Self {
        self.with_last(|m| m.interpolation = interpolation)
    }

    /// Set the `zero()` value of the last child.
    pub fn default_value(self, value: Value) -> Self {
        self.with_last(|m| m.default = Some(value))
    }

    fn with_last(mut self, apply: impl FnOnce(&mut FieldMeta)) -> Self {
        let index = self.last.unwrap_or(0);
        apply(&mut self.nodes[index].meta);
        self
    }

    /// Raw pre-order nodes with the root's subtree length fixed up.
    fn into_raw(mut self) -> Vec<Node> {
        let len = self.nodes.len();
        self.nodes[0].subtree_len = len;
        self.nodes
    }

    /// Finish: assign slots, inherit flags, fingerprint subtrees.
    pub fn build(self) -> Arc<Schema> {
        let mut nodes = self.into_raw();
        let mut next_slot = 0usize;
        finalize(&mut nodes, 0, None, &mut next_slot);
        Arc::new(Schema { nodes })
    }
}

fn raw_node(name: &'static str, kind: NodeKind) -> Node {
    Node {
        name,
        kind,
        meta: FieldMeta::for_kind(match kind {
            NodeKind::Property(k) => Some(k),
            _ => None,
        }),
        subtree_len: 1,
        slot: 0,
        slot_count: 0,
        shape: 0,
    }
}

/// Recursively finalize the subtree at `at`. Returns its end index.
fn finalize(nodes: &mut [Node], at: usize, parent: Option<&FieldMeta>, next_slot: &mut usize) -> usize {
    if let Some(parent) = parent {
        nodes[at].meta.inherit(parent);
    }
    let meta = nodes[at].meta.clone();
    let first_slot = *next_slot;
    let mut shape = Fnv::new();
    shape.write(nodes[at].name.as_bytes());

    match nodes[at].kind {
        NodeKind::Property(kind) => {
            shape.write(&[0, kind as u8, meta.trust as u8, meta.single_tick as u8, meta.local_only as u8]);
            *next_slot += 1;
        }
        NodeKind::Array { len } => {
            shape.write(&[1]);
            shape.write(&len.to_le_bytes());
            let end = at + nodes[at].subtree_len;
            let mut child = at + 1;
            while child < end {
                child = finalize(nodes, child, Some(&meta), next_slot);
            }
            if let Some(element) = nodes.get(at + 1).filter(|_| len > 0) {
                shape.write(&element.shape.to_le_bytes());
            }
        }
        NodeKind::Component => {
            shape.write(&[2, meta.trust as u8]);
            let end = at + nodes[at].subtree_len;
            let mut child = at + 1;
            while child < end {
                let child_end = finalize(nodes, child, Some(&meta), next_slot);
                shape.write(&nodes[child].shape.to_le_bytes());
                child = child_end;
            }
        }
    }

    let node = &mut nodes[at];
    node.slot = first_slot;
    node.slot_count = *next_slot - first_slot;
    node.shape = shape.finish();
    at + node.subtree_len
}

/// FNV-1a, for structural fingerprints only.
struct Fnv(u64);

impl Fnv {
    fn new() -> Self {
        Self(0xcbf2_9ce4_8422_2325)
    }

    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= *byte as u64;
            self.0 = self.0.wrapping_mul(0x0100_0000_01b3);
        }
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element() -> Arc<Schema> {
        SchemaBuilder::new("player")
            .component("camera", |c| c
                .prop("yaw", FieldKind::F32).interpolate(Interpolation::Angle)
                .prop("pitch", FieldKind::F32))
            .trust(Trust::ClientTrusted)
            .prop("health", FieldKind::U8).trust(Trust::ServerOnly).default_value(Value::U8(100))
            .prop("jump", FieldKind::Bool).single_tick()
            .build()
    }

    #[test]
    fn test_slots_are_preorder() {
        let schema = element();
        let yaw = schema.id("camera.yaw");
        let health = schema.id("health");
        assert_eq!(schema.nodes()[yaw.index()].slot, 0);
        assert_eq!(schema.nodes()[health.index()].slot, 2);
        assert_eq!(schema.slot_count(), 4);
    }

    #[test]
    fn test_trust_is_inherited() {
        let schema = element();
        let pitch = &schema.nodes()[schema.id("camera.pitch").index()];
        assert_eq!(pitch.meta.trust, Trust::ClientTrusted);
        assert_eq!(pitch.meta.interpolation, Interpolation::Linear);
        let jump = &schema.nodes()[schema.id("jump").index()];
        assert!(jump.meta.single_tick);
        assert_eq!(jump.meta.interpolation, Interpolation::Step);
    }

    #[test]
    fn test_array_elements_share_shape() {
        let player = element();
        let session = SchemaBuilder::new("session")
            .prop("tick", FieldKind::U32)
            .array("players", 3, &player)
            .build();

        assert_eq!(session.slot_count(), 1 + 3 * player.slot_count());
        let second = session.id("players.1");
        let node = &session.nodes()[second.index()];
        assert_eq!(node.shape, player.shape());
        assert_eq!(node.slot, 1 + player.slot_count());

        let health = session.id("players.2.health");
        assert_eq!(session.path_of(health), "players.2.health");
        assert!(session.find("players.3").is_none());
    }

    #[test]
    fn test_different_structure_different_shape() {
        let a = SchemaBuilder::new("x").prop("a", FieldKind::U8).build();
        let b = SchemaBuilder::new("x").prop("a", FieldKind::U16).build();
        assert_ne!(a.shape(), b.shape());
    }

    #[test]
    fn test_default_value() {
        let schema = element();
        let health = &schema.nodes()[schema.id("health").index()];
        assert_eq!(health.default_value(), Some(Value::U8(100)));
        assert_eq!(schema.nodes()[0].default_value(), None);
    }
}
