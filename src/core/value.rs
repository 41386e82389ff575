//! Field Values
//!
//! Typed leaf values stored in snapshots. Every leaf carries a presence
//! bit separate from its value: an absent field is "not yet known", which
//! is different from a zero.

use std::fmt;
use serde::{Serialize, Deserialize};

use super::vec3::Vec3;

/// Semantic type of a leaf field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FieldKind {
    /// Boolean flag
    Bool = 0,
    /// Byte (also used for byte-enums such as team or item ids)
    U8 = 1,
    /// 16-bit unsigned
    U16 = 2,
    /// 32-bit unsigned (ticks, durations)
    U32 = 3,
    /// 64-bit unsigned (absolute times in microseconds)
    U64 = 4,
    /// Float
    F32 = 5,
    /// 3D float vector
    Vec3 = 6,
    /// Bounded string
    Str = 7,
}

impl FieldKind {
    /// Whether values of this kind can be blended and tolerance-compared.
    #[inline]
    pub fn is_continuous(self) -> bool {
        matches!(self, FieldKind::F32 | FieldKind::Vec3)
    }
}

/// A typed leaf value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Boolean flag
    Bool(bool),
    /// Byte
    U8(u8),
    /// 16-bit unsigned
    U16(u16),
    /// 32-bit unsigned
    U32(u32),
    /// 64-bit unsigned
    U64(u64),
    /// Float
    F32(f32),
    /// 3D vector
    Vec3(Vec3),
    /// String
    Str(String),
}

impl Value {
    /// Zero value of a kind.
    pub fn zero_of(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Bool => Value::Bool(false),
            FieldKind::U8 => Value::U8(0),
            FieldKind::U16 => Value::U16(0),
            FieldKind::U32 => Value::U32(0),
            FieldKind::U64 => Value::U64(0),
            FieldKind::F32 => Value::F32(0.0),
            FieldKind::Vec3 => Value::Vec3(Vec3::ZERO),
            FieldKind::Str => Value::Str(String::new()),
        }
    }

    /// Kind of this value.
    pub fn kind(&self) -> FieldKind {
        match self {
            Value::Bool(_) => FieldKind::Bool,
            Value::U8(_) => FieldKind::U8,
            Value::U16(_) => FieldKind::U16,
            Value::U32(_) => FieldKind::U32,
            Value::U64(_) => FieldKind::U64,
            Value::F32(_) => FieldKind::F32,
            Value::Vec3(_) => FieldKind::Vec3,
            Value::Str(_) => FieldKind::Str,
        }
    }

    /// Overwrite with another value of the same kind.
    ///
    /// Strings reuse their existing buffer.
    #[inline]
    pub fn assign(&mut self, other: &Value) {
        match (self, other) {
            (Value::Str(dst), Value::Str(src)) => dst.clone_from(src),
            (dst, src) => *dst = src.clone(),
        }
    }

    /// Reset to the zero value of the current kind without freeing buffers.
    #[inline]
    pub fn reset(&mut self) {
        match self {
            Value::Str(s) => s.clear(),
            other => *other = Value::zero_of(other.kind()),
        }
    }

    /// Tolerance comparison for continuous kinds; exact equality otherwise.
    pub fn within(&self, other: &Value, tolerance: f32) -> bool {
        match (self, other) {
            (Value::F32(a), Value::F32(b)) => (a - b).abs() <= tolerance,
            (Value::Vec3(a), Value::Vec3(b)) => a.within(*b, tolerance),
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::U8(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::F32(v) => write!(f, "{:.4}", v),
            Value::Vec3(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{:?}", v),
        }
    }
}

/// A leaf slot: value plus presence and wire flags.
#[derive(Clone, Debug)]
pub struct Field {
    value: Value,
    present: bool,
    /// Server-forced correction marker, travels with the value.
    pub is_override: bool,
    /// Set on received fields the sender omitted because they were unchanged.
    pub was_same: bool,
}

impl Field {
    /// Create an absent field of a kind.
    pub fn absent(kind: FieldKind) -> Self {
        Self {
            value: Value::zero_of(kind),
            present: false,
            is_override: false,
            was_same: false,
        }
    }

    /// Kind of the stored value.
    #[inline]
    pub fn kind(&self) -> FieldKind {
        self.value.kind()
    }

    /// Whether the field holds a value.
    #[inline]
    pub fn is_present(&self) -> bool {
        self.present
    }

    /// Value if present.
    #[inline]
    pub fn get(&self) -> Option<&Value> {
        if self.present {
            Some(&self.value)
        } else {
            None
        }
    }

    /// Set a value. The kind must match the schema.
    #[inline]
    pub fn set(&mut self, value: Value) {
        debug_assert_eq!(self.value.kind(), value.kind(), "field kind mismatch");
        self.value = value;
        self.present = true;
    }

    /// Set from a borrowed value, reusing buffers.
    #[inline]
    pub fn set_ref(&mut self, value: &Value) {
        debug_assert_eq!(self.value.kind(), value.kind(), "field kind mismatch");
        self.value.assign(value);
        self.present = true;
    }

    /// Make the field absent.
    #[inline]
    pub fn clear(&mut self) {
        self.value.reset();
        self.present = false;
        self.is_override = false;
    }

    /// Copy value, presence and override flag from another field.
    #[inline]
    pub fn copy_from(&mut self, other: &Field) {
        self.value.assign(&other.value);
        self.present = other.present;
        self.is_override = other.is_override;
    }

    /// Presence-aware equality: absent equals absent, present compares values.
    #[inline]
    pub fn value_eq(&self, other: &Field) -> bool {
        match (self.present, other.present) {
            (false, false) => true,
            (true, true) => self.value == other.value,
            _ => false,
        }
    }

    /// Presence-aware tolerance comparison.
    #[inline]
    pub fn within(&self, other: &Field, tolerance: f32) -> bool {
        match (self.present, other.present) {
            (false, false) => true,
            (true, true) => self.value.within(&other.value, tolerance),
            _ => false,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => write!(f, "{}", value),
            None => write!(f, "<absent>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_is_not_zero() {
        let mut field = Field::absent(FieldKind::U8);
        assert!(!field.is_present());
        assert_eq!(field.get(), None);

        field.set(Value::U8(0));
        assert!(field.is_present());
        assert_eq!(field.get(), Some(&Value::U8(0)));
        assert!(!field.value_eq(&Field::absent(FieldKind::U8)));
    }

    #[test]
    fn test_clear_keeps_kind() {
        let mut field = Field::absent(FieldKind::Str);
        field.set(Value::Str("player".to_string()));
        field.clear();
        assert!(!field.is_present());
        assert_eq!(field.kind(), FieldKind::Str);
    }

    #[test]
    fn test_within_tolerance() {
        let mut a = Field::absent(FieldKind::F32);
        let mut b = Field::absent(FieldKind::F32);
        a.set(Value::F32(1.0));
        b.set(Value::F32(1.009));
        assert!(a.within(&b, 0.01));
        assert!(!a.value_eq(&b));

        b.set(Value::F32(1.011));
        assert!(!a.within(&b, 0.01));
    }

    #[test]
    fn test_copy_carries_override() {
        let mut a = Field::absent(FieldKind::U32);
        a.set(Value::U32(7));
        a.is_override = true;
        let mut b = Field::absent(FieldKind::U32);
        b.copy_from(&a);
        assert!(b.is_override);
        assert!(b.value_eq(&a));
    }
}
