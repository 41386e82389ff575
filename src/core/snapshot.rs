//! State Snapshots
//!
//! A [`Snapshot`] owns one [`Field`] per leaf of its schema, allocated once.
//! Everything after construction is value-copy: histories claim and
//! overwrite slots, they never allocate.
//!
//! [`SnapshotRef`] and [`SnapshotMut`] are views onto a subtree (a whole
//! snapshot, a component, or one element of an array). Two views can be
//! navigated in lockstep only when their structure is identical; a player
//! element inside a session and a standalone player snapshot qualify.

use std::fmt;
use std::sync::Arc;

use super::schema::{FieldId, Node, NodeKind, Schema};
use super::value::{Field, Value};
use super::vec3::Vec3;

// =============================================================================
// NAVIGATION
// =============================================================================

/// Visitor verdict at each node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Navigation {
    /// Descend into children / move to next node.
    Continue,
    /// Do not visit this node's descendants.
    SkipSubtree,
    /// Abort the walk.
    Stop,
}

#[inline]
fn advance(at: usize, node: &Node, verdict: Navigation) -> Option<usize> {
    match verdict {
        Navigation::Continue => Some(at + 1),
        Navigation::SkipSubtree => Some(at + node.subtree_len),
        Navigation::Stop => None,
    }
}

#[inline]
fn assert_same_schema(a: &[Node], b: &[Node]) {
    assert!(
        a.len() == b.len() && a[0].shape == b[0].shape,
        "navigating mismatched schemas: `{}` ({} nodes) vs `{}` ({} nodes)",
        a[0].name,
        a.len(),
        b[0].name,
        b.len(),
    );
}

/// Walk one view depth-first, left to right.
///
/// The visitor receives the leaf field for properties and `None` for
/// components and arrays. Returns `false` if the visitor stopped the walk.
pub fn navigate<'a>(
    view: SnapshotRef<'a>,
    mut visit: impl FnMut(FieldId, &'a Node, Option<&'a Field>) -> Navigation,
) -> bool {
    let mut at = 0;
    while at < view.nodes.len() {
        let node = &view.nodes[at];
        let field = node.is_property().then(|| &view.fields[node.slot - view.base]);
        match advance(at, node, visit(FieldId(at as u32), node, field)) {
            Some(next) => at = next,
            None => return false,
        }
    }
    true
}

/// Walk a mutable view depth-first, left to right.
pub fn navigate_mut(
    view: &mut SnapshotMut<'_>,
    mut visit: impl FnMut(FieldId, &Node, Option<&mut Field>) -> Navigation,
) -> bool {
    let nodes = view.nodes;
    let mut at = 0;
    while at < nodes.len() {
        let node = &nodes[at];
        let field = if node.is_property() {
            Some(&mut view.fields[node.slot - view.base])
        } else {
            None
        };
        match advance(at, node, visit(FieldId(at as u32), node, field)) {
            Some(next) => at = next,
            None => return false,
        }
    }
    true
}

/// Walk two same-schema views in lockstep.
///
/// # Panics
///
/// If the views do not share a structure.
pub fn navigate_zipped<'a, 'b>(
    a: SnapshotRef<'a>,
    b: SnapshotRef<'b>,
    mut visit: impl FnMut(FieldId, &'a Node, Option<(&'a Field, &'b Field)>) -> Navigation,
) -> bool {
    assert_same_schema(a.nodes, b.nodes);
    let mut at = 0;
    while at < a.nodes.len() {
        let node = &a.nodes[at];
        let pair = node.is_property().then(|| {
            let b_node = &b.nodes[at];
            (&a.fields[node.slot - a.base], &b.fields[b_node.slot - b.base])
        });
        match advance(at, node, visit(FieldId(at as u32), node, pair)) {
            Some(next) => at = next,
            None => return false,
        }
    }
    true
}

/// Walk a mutable view and a read-only view in lockstep.
///
/// # Panics
///
/// If the views do not share a structure.
pub fn navigate_zipped_mut<'b>(
    a: &mut SnapshotMut<'_>,
    b: SnapshotRef<'b>,
    mut visit: impl FnMut(FieldId, &Node, Option<(&mut Field, &'b Field)>) -> Navigation,
) -> bool {
    assert_same_schema(a.nodes, b.nodes);
    let nodes = a.nodes;
    let mut at = 0;
    while at < nodes.len() {
        let node = &nodes[at];
        let pair = if node.is_property() {
            let b_node = &b.nodes[at];
            Some((&mut a.fields[node.slot - a.base], &b.fields[b_node.slot - b.base]))
        } else {
            None
        };
        match advance(at, node, visit(FieldId(at as u32), node, pair)) {
            Some(next) => at = next,
            None => return false,
        }
    }
    true
}

// =============================================================================
// VIEWS
// =============================================================================

/// Read-only view onto a snapshot subtree.
#[derive(Clone, Copy)]
pub struct SnapshotRef<'a> {
    nodes: &'a [Node],
    fields: &'a [Field],
    base: usize,
}

/// Mutable view onto a snapshot subtree.
pub struct SnapshotMut<'a> {
    nodes: &'a [Node],
    fields: &'a mut [Field],
    base: usize,
}

fn subtree(nodes: &[Node], id: FieldId) -> (&[Node], usize, usize) {
    let node = &nodes[id.index()];
    let sub = &nodes[id.index()..id.index() + node.subtree_len];
    (sub, node.slot, node.slot_count)
}

fn element_id(nodes: &[Node], array: FieldId, index: usize) -> FieldId {
    let node = &nodes[array.index()];
    let NodeKind::Array { len } = node.kind else {
        panic!("`{}` is not an array", node.name);
    };
    assert!(index < len as usize, "index {} out of bounds for `{}` (len {})", index, node.name, len);
    let element_len = nodes[array.index() + 1].subtree_len;
    FieldId((array.index() + 1 + index * element_len) as u32)
}

fn leaf<'n>(nodes: &'n [Node], id: FieldId) -> &'n Node {
    let node = &nodes[id.index()];
    assert!(node.is_property(), "`{}` is not a property", node.name);
    node
}

impl<'a> SnapshotRef<'a> {
    /// Node table of this view (root first).
    #[inline]
    pub fn nodes(self) -> &'a [Node] {
        self.nodes
    }

    /// Node by id.
    #[inline]
    pub fn node(self, id: FieldId) -> &'a Node {
        &self.nodes[id.index()]
    }

    /// Structural fingerprint of the view's root.
    #[inline]
    pub fn shape(self) -> u64 {
        self.nodes[0].shape
    }

    /// Leaf field by id.
    #[inline]
    pub fn field(self, id: FieldId) -> &'a Field {
        let node = leaf(self.nodes, id);
        &self.fields[node.slot - self.base]
    }

    /// Leaf value by id, if present.
    #[inline]
    pub fn get(self, id: FieldId) -> Option<&'a Value> {
        self.field(id).get()
    }

    /// Whether a leaf is present.
    #[inline]
    pub fn is_present(self, id: FieldId) -> bool {
        self.field(id).is_present()
    }

    /// View of a component or array subtree.
    pub fn sub(self, id: FieldId) -> SnapshotRef<'a> {
        let (nodes, slot, count) = subtree(self.nodes, id);
        let start = slot - self.base;
        SnapshotRef {
            nodes,
            fields: &self.fields[start..start + count],
            base: slot,
        }
    }

    /// View of one array element.
    pub fn element(self, array: FieldId, index: usize) -> SnapshotRef<'a> {
        self.sub(element_id(self.nodes, array, index))
    }

    /// Leaf fields in slot order.
    #[inline]
    pub fn fields(self) -> &'a [Field] {
        self.fields
    }

    /// Presence-aware equality of every leaf.
    pub fn values_eq(self, other: SnapshotRef<'_>) -> bool {
        assert_same_schema(self.nodes, other.nodes);
        self.fields.iter().zip(other.fields).all(|(a, b)| a.value_eq(b))
    }
}

impl<'a> SnapshotMut<'a> {
    /// Shorter-lived mutable view of the same subtree.
    #[inline]
    pub fn reborrow(&mut self) -> SnapshotMut<'_> {
        SnapshotMut {
            nodes: self.nodes,
            fields: &mut *self.fields,
            base: self.base,
        }
    }

    /// Read-only view of the same subtree.
    #[inline]
    pub fn as_ref(&self) -> SnapshotRef<'_> {
        SnapshotRef {
            nodes: self.nodes,
            fields: &*self.fields,
            base: self.base,
        }
    }

    /// Node by id.
    #[inline]
    pub fn node(&self, id: FieldId) -> &'a Node {
        &self.nodes[id.index()]
    }

    /// Mutable leaf field by id.
    #[inline]
    pub fn field_mut(&mut self, id: FieldId) -> &mut Field {
        let node = leaf(self.nodes, id);
        &mut self.fields[node.slot - self.base]
    }

    /// Mutable view of a component or array subtree.
    pub fn sub_mut(&mut self, id: FieldId) -> SnapshotMut<'_> {
        let (nodes, slot, count) = subtree(self.nodes, id);
        let start = slot - self.base;
        SnapshotMut {
            nodes,
            fields: &mut self.fields[start..start + count],
            base: slot,
        }
    }

    /// Consume into a view of a subtree.
    pub fn into_sub(self, id: FieldId) -> SnapshotMut<'a> {
        let (nodes, slot, count) = subtree(self.nodes, id);
        let start = slot - self.base;
        let fields = self.fields;
        SnapshotMut {
            nodes,
            fields: &mut fields[start..start + count],
            base: slot,
        }
    }

    /// Mutable view of one array element.
    pub fn element_mut(&mut self, array: FieldId, index: usize) -> SnapshotMut<'_> {
        let id = element_id(self.nodes, array, index);
        self.sub_mut(id)
    }

    /// Consume into a view of one array element.
    pub fn into_element(self, array: FieldId, index: usize) -> SnapshotMut<'a> {
        let id = element_id(self.nodes, array, index);
        self.into_sub(id)
    }

    /// Set a leaf value.
    #[inline]
    pub fn set(&mut self, id: FieldId, value: Value) {
        self.field_mut(id).set(value);
    }

    /// Set a leaf value and flag it as a server-forced correction.
    pub fn set_override(&mut self, id: FieldId, value: Value) {
        let field = self.field_mut(id);
        field.set(value);
        field.is_override = true;
    }

    /// Make one leaf absent.
    #[inline]
    pub fn clear_field(&mut self, id: FieldId) {
        self.field_mut(id).clear();
    }

    /// Value-copy every field of `other` (same schema).
    pub fn copy_from(&mut self, other: SnapshotRef<'_>) {
        assert_same_schema(self.nodes, other.nodes);
        for (dst, src) in self.fields.iter_mut().zip(other.fields) {
            dst.copy_from(src);
        }
    }

    /// Copy only the fields that are present in `other`.
    pub fn merge_from(&mut self, other: SnapshotRef<'_>) {
        assert_same_schema(self.nodes, other.nodes);
        for (dst, src) in self.fields.iter_mut().zip(other.fields) {
            if src.is_present() {
                dst.copy_from(src);
            }
        }
    }

    /// Set every leaf to its present default value.
    pub fn zero(&mut self) {
        let nodes = self.nodes;
        for node in nodes.iter().filter(|n| n.is_property()) {
            if let Some(default) = node.default_value() {
                let field = &mut self.fields[node.slot - self.base];
                field.set(default);
                field.is_override = false;
                field.was_same = false;
            }
        }
    }

    /// Set every leaf back to absent.
    pub fn clear(&mut self) {
        for field in self.fields.iter_mut() {
            field.clear();
            field.was_same = false;
        }
    }
}

// =============================================================================
// OWNED SNAPSHOT
// =============================================================================

/// An owned, pre-allocated instance of a schema.
#[derive(Clone)]
pub struct Snapshot {
    schema: Arc<Schema>,
    fields: Vec<Field>,
}

impl Snapshot {
    /// Allocate with every field absent.
    pub fn new(schema: &Arc<Schema>) -> Self {
        let fields = schema
            .nodes()
            .iter()
            .filter_map(|node| node.field_kind().map(Field::absent))
            .collect();
        Self {
            schema: Arc::clone(schema),
            fields,
        }
    }

    /// Schema of this snapshot.
    #[inline]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Read-only view of the whole snapshot.
    #[inline]
    pub fn view(&self) -> SnapshotRef<'_> {
        SnapshotRef {
            nodes: self.schema.nodes(),
            fields: &self.fields,
            base: 0,
        }
    }

    /// Mutable view of the whole snapshot.
    #[inline]
    pub fn view_mut(&mut self) -> SnapshotMut<'_> {
        SnapshotMut {
            nodes: self.schema.nodes(),
            fields: &mut self.fields,
            base: 0,
        }
    }

    /// See [`SnapshotMut::copy_from`].
    pub fn copy_from(&mut self, other: SnapshotRef<'_>) {
        self.view_mut().copy_from(other);
    }

    /// See [`SnapshotMut::merge_from`].
    pub fn merge_from(&mut self, other: SnapshotRef<'_>) {
        self.view_mut().merge_from(other);
    }

    /// See [`SnapshotMut::zero`].
    pub fn zero(&mut self) {
        self.view_mut().zero();
    }

    /// See [`SnapshotMut::clear`].
    pub fn clear(&mut self) {
        self.view_mut().clear();
    }

    /// See [`SnapshotMut::set`].
    pub fn set(&mut self, id: FieldId, value: Value) {
        self.view_mut().set(id, value);
    }
}

// =============================================================================
// TYPED ACCESS
// =============================================================================

macro_rules! typed_getter {
    ($name:ident, $variant:ident, $ty:ty) => {
        #[doc = concat!("Typed read of a `", stringify!($variant), "` leaf.")]
        #[inline]
        fn $name(&self, id: FieldId) -> Option<$ty> {
            match self.read().get(id) {
                Some(Value::$variant(v)) => Some(*v),
                _ => None,
            }
        }
    };
}

macro_rules! typed_setter {
    ($name:ident, $variant:ident, $ty:ty) => {
        #[doc = concat!("Typed write of a `", stringify!($variant), "` leaf.")]
        #[inline]
        fn $name(&mut self, id: FieldId, value: $ty) {
            self.write().set(id, Value::$variant(value));
        }
    };
}

/// Typed getters shared by snapshots and views.
pub trait FieldRead {
    /// Read-only view to read through.
    fn read(&self) -> SnapshotRef<'_>;

    typed_getter!(get_bool, Bool, bool);
    typed_getter!(get_u8, U8, u8);
    typed_getter!(get_u16, U16, u16);
    typed_getter!(get_u32, U32, u32);
    typed_getter!(get_u64, U64, u64);
    typed_getter!(get_f32, F32, f32);
    typed_getter!(get_vec3, Vec3, Vec3);

    /// Typed read of a string leaf.
    fn get_str(&self, id: FieldId) -> Option<&str> {
        match self.read().get(id) {
            Some(Value::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Whether a leaf is present.
    fn has(&self, id: FieldId) -> bool {
        self.read().is_present(id)
    }
}

/// Typed setters shared by snapshots and mutable views.
pub trait FieldWrite: FieldRead {
    /// Mutable view to write through.
    fn write(&mut self) -> SnapshotMut<'_>;

    typed_setter!(set_bool, Bool, bool);
    typed_setter!(set_u8, U8, u8);
    typed_setter!(set_u16, U16, u16);
    typed_setter!(set_u32, U32, u32);
    typed_setter!(set_u64, U64, u64);
    typed_setter!(set_f32, F32, f32);
    typed_setter!(set_vec3, Vec3, Vec3);

    /// Typed write of a string leaf.
    fn set_str(&mut self, id: FieldId, value: &str) {
        let mut view = self.write();
        let field = view.field_mut(id);
        let unchanged = matches!(field.get(), Some(Value::Str(current)) if current.as_str() == value);
        if !unchanged {
            field.set(Value::Str(value.to_string()));
        }
    }
}

impl FieldRead for SnapshotRef<'_> {
    fn read(&self) -> SnapshotRef<'_> {
        *self
    }
}

impl FieldRead for SnapshotMut<'_> {
    fn read(&self) -> SnapshotRef<'_> {
        self.as_ref()
    }
}

impl FieldWrite for SnapshotMut<'_> {
    fn write(&mut self) -> SnapshotMut<'_> {
        self.reborrow()
    }
}

impl FieldRead for Snapshot {
    fn read(&self) -> SnapshotRef<'_> {
        self.view()
    }
}

impl FieldWrite for Snapshot {
    fn write(&mut self) -> SnapshotMut<'_> {
        self.view_mut()
    }
}

// =============================================================================
// DISPLAY
// =============================================================================

impl fmt::Debug for SnapshotRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nodes = self.nodes;
        let mut map = f.debug_map();
        navigate(*self, |id, _, field| {
            if let Some(field) = field.filter(|field| field.is_present()) {
                map.entry(&super::schema::path_of(nodes, id), &format_args!("{}", field));
            }
            Navigation::Continue
        });
        map.finish()
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.schema.name())?;
        fmt::Debug::fmt(&self.view(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{SchemaBuilder, Trust};
    use crate::core::value::FieldKind;
    use proptest::prelude::*;

    fn player_schema() -> Arc<Schema> {
        SchemaBuilder::new("player")
            .component("move", |c| c
                .prop("position", FieldKind::Vec3).tolerance(0.01)
                .prop("ground_tick", FieldKind::U8))
            .prop("health", FieldKind::U8).trust(Trust::ServerOnly).default_value(Value::U8(100))
            .prop("name", FieldKind::Str)
            .build()
    }

    fn session_schema(player: &Schema) -> Arc<Schema> {
        SchemaBuilder::new("session")
            .prop("tick", FieldKind::U32)
            .array("players", 4, player)
            .build()
    }

    #[test]
    fn test_new_is_absent() {
        let snapshot = Snapshot::new(&player_schema());
        assert!(snapshot.view().fields().iter().all(|f| !f.is_present()));
    }

    #[test]
    fn test_zero_vs_clear() {
        let schema = player_schema();
        let health = schema.id("health");
        let mut snapshot = Snapshot::new(&schema);

        snapshot.zero();
        assert_eq!(snapshot.get_u8(health), Some(100));
        assert_eq!(snapshot.get_vec3(schema.id("move.position")), Some(Vec3::ZERO));

        snapshot.clear();
        assert_eq!(snapshot.get_u8(health), None);
        assert!(!snapshot.has(health));
    }

    #[test]
    fn test_merge_keeps_absent_isolated() {
        let schema = player_schema();
        let health = schema.id("health");
        let ground = schema.id("move.ground_tick");

        let mut dst = Snapshot::new(&schema);
        dst.set_u8(health, 50);
        let mut src = Snapshot::new(&schema);
        src.set_u8(ground, 3);

        dst.merge_from(src.view());
        assert_eq!(dst.get_u8(health), Some(50));
        assert_eq!(dst.get_u8(ground), Some(3));
        assert!(!dst.has(schema.id("name")));
    }

    #[test]
    fn test_element_view_zips_with_standalone() {
        let player = player_schema();
        let session = session_schema(&player);
        let players = session.id("players");
        let health = player.id("health");

        let mut standalone = Snapshot::new(&player);
        standalone.zero();
        standalone.set_str(player.id("name"), "alpha");

        let mut snapshot = Snapshot::new(&session);
        {
            let mut view = snapshot.view_mut();
            let mut element = view.element_mut(players, 2);
            element.copy_from(standalone.view());
            element.set_u8(health, 7);
        }

        let element = snapshot.view().element(players, 2);
        assert_eq!(element.get_u8(health), Some(7));
        assert_eq!(element.get_str(player.id("name")), Some("alpha"));
        assert!(!snapshot.view().element(players, 1).is_present(health));
        assert!(!snapshot.has(session.id("tick")));
    }

    #[test]
    fn test_navigate_order_and_skip() {
        let schema = player_schema();
        let mut names = Vec::new();
        navigate(Snapshot::new(&schema).view(), |_, node, _| {
            names.push(node.name);
            if node.name == "move" {
                Navigation::SkipSubtree
            } else {
                Navigation::Continue
            }
        });
        assert_eq!(names, vec!["player", "move", "health", "name"]);
    }

    #[test]
    fn test_navigate_zipped_stop() {
        let schema = player_schema();
        let a = Snapshot::new(&schema);
        let mut b = Snapshot::new(&schema);
        b.set_u8(schema.id("move.ground_tick"), 1);

        let mut first_diff = None;
        let completed = navigate_zipped(a.view(), b.view(), |id, _, pair| match pair {
            Some((x, y)) if !x.value_eq(y) => {
                first_diff = Some(id);
                Navigation::Stop
            }
            _ => Navigation::Continue,
        });
        assert!(!completed);
        assert_eq!(first_diff, Some(schema.id("move.ground_tick")));
    }

    #[test]
    #[should_panic(expected = "mismatched schemas")]
    fn test_mismatched_schema_panics() {
        let player = player_schema();
        let other = SchemaBuilder::new("other").prop("x", FieldKind::U8).build();
        let mut a = Snapshot::new(&player);
        a.copy_from(Snapshot::new(&other).view());
    }

    fn arb_field_values() -> impl Strategy<Value = Vec<Option<u8>>> {
        proptest::collection::vec(proptest::option::of(any::<u8>()), 4)
    }

    fn fill(snapshot: &mut Snapshot, values: &[Option<u8>]) {
        let schema = Arc::clone(snapshot.schema());
        let ids = [
            schema.id("move.ground_tick"),
            schema.id("health"),
        ];
        for (id, value) in ids.iter().zip(values) {
            if let Some(v) = value {
                snapshot.set_u8(*id, *v);
            }
        }
        if let Some(v) = values[2] {
            snapshot.set_vec3(schema.id("move.position"), Vec3::new(v as f32, 0.0, 0.0));
        }
        if let Some(v) = values[3] {
            snapshot.set_str(schema.id("name"), &v.to_string());
        }
    }

    proptest! {
        #[test]
        fn prop_copy_is_idempotent(src in arb_field_values(), dst in arb_field_values()) {
            let schema = player_schema();
            let mut a = Snapshot::new(&schema);
            fill(&mut a, &src);

            let mut once = Snapshot::new(&schema);
            fill(&mut once, &dst);
            once.copy_from(a.view());

            let mut twice = Snapshot::new(&schema);
            fill(&mut twice, &dst);
            twice.copy_from(a.view());
            twice.copy_from(a.view());

            prop_assert!(once.view().values_eq(twice.view()));
            prop_assert!(once.view().values_eq(a.view()));
        }

        #[test]
        fn prop_merge_never_creates_presence(src in arb_field_values(), dst in arb_field_values()) {
            let schema = player_schema();
            let mut source = Snapshot::new(&schema);
            fill(&mut source, &src);
            let mut target = Snapshot::new(&schema);
            fill(&mut target, &dst);
            let before = target.clone();

            target.merge_from(source.view());

            let fields = target.view().fields().iter()
                .zip(source.view().fields())
                .zip(before.view().fields());
            for ((merged, source), before) in fields {
                if source.is_present() {
                    prop_assert!(merged.value_eq(source));
                } else {
                    prop_assert!(merged.value_eq(before));
                }
            }
        }
    }
}
