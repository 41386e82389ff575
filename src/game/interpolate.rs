//! Interpolator
//!
//! Render-time blending of two history samples. Rendering only reads
//! committed history; every function here takes shared references to it
//! and writes into a caller-owned scratch snapshot.

use crate::core::history::History;
use crate::core::schema::Interpolation;
use crate::core::snapshot::{navigate_zipped_mut, Navigation, SnapshotMut, SnapshotRef};
use crate::core::value::{Field, Value};

/// Two history offsets bracketing a render time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bracket {
    /// Offset of the sample at or before the render time
    pub older: i32,
    /// Offset of the sample after it (equal to `older` when clamped)
    pub newer: i32,
    /// Blend weight of `newer` in `[0, 1]`
    pub fraction: f32,
}

/// Find the two entries around `render_time_us`.
///
/// Scans newest to oldest for the first entry whose time is at or before
/// the render time. Clamps to the newest entry when the render time is
/// ahead of everything, and to the oldest timed entry when it is behind
/// everything. Returns `None` when no entry has a time.
pub fn find_bracket<T>(
    history: &History<T>,
    render_time_us: u64,
    time_of: impl Fn(&T) -> Option<u64>,
) -> Option<Bracket> {
    let mut newer: Option<(i32, u64)> = None;
    let mut oldest: Option<i32> = None;
    for (offset, entry) in history.iter_newest_first() {
        let Some(time) = time_of(entry) else {
            continue;
        };
        if time <= render_time_us {
            let bracket = match newer {
                Some((newer_offset, newer_time)) if newer_time > time => Bracket {
                    older: offset,
                    newer: newer_offset,
                    fraction: ((render_time_us - time) as f64 / (newer_time - time) as f64) as f32,
                },
                _ => Bracket { older: offset, newer: offset, fraction: 0.0 },
            };
            return Some(bracket);
        }
        newer = Some((offset, time));
        oldest = Some(offset);
    }
    oldest.map(|offset| Bracket { older: offset, newer: offset, fraction: 0.0 })
}

/// Blend `older` and `newer` into `out`, leaf by leaf.
///
/// Present pairs blend by the leaf's interpolation rule. Pairs with an
/// absent side take the newer field as-is.
pub fn interpolate_into(out: &mut SnapshotMut<'_>, older: SnapshotRef<'_>, newer: SnapshotRef<'_>, fraction: f32) {
    let t = fraction.clamp(0.0, 1.0);
    navigate_zipped_mut(out, newer, |id, node, pair| {
        if let Some((out, newer)) = pair {
            match blend_field(older.field(id), newer, node.meta.interpolation, t) {
                Some(value) => {
                    out.copy_from(newer);
                    out.set(value);
                }
                None => out.copy_from(newer),
            }
        }
        Navigation::Continue
    });
}

fn blend_field(a: &Field, b: &Field, rule: Interpolation, t: f32) -> Option<Value> {
    let (a, b) = (a.get()?, b.get()?);
    match (rule, a, b) {
        (Interpolation::Step, a, _) if t < 0.5 => Some(a.clone()),
        (Interpolation::Step, _, _) => None,
        (rule, Value::F32(a), Value::F32(b)) => Some(Value::F32(blend_scalar(rule, *a, *b, t))),
        (_, Value::Vec3(a), Value::Vec3(b)) => Some(Value::Vec3(a.lerp(*b, t))),
        // non-numeric leaves fall back to the nearer sample
        (_, a, _) if t < 0.5 => Some(a.clone()),
        _ => None,
    }
}

/// Blend two scalars by rule.
pub fn blend_scalar(rule: Interpolation, a: f32, b: f32, t: f32) -> f32 {
    match rule {
        Interpolation::Linear => a + (b - a) * t,
        Interpolation::Angle => wrap(a + shortest(a, b, 360.0) * t, 0.0, 360.0),
        Interpolation::Cyclic { min, max } => wrap(a + shortest(a, b, max - min) * t, min, max),
        Interpolation::Step => if t < 0.5 { a } else { b },
    }
}

#[inline]
fn shortest(a: f32, b: f32, range: f32) -> f32 {
    let d = (b - a).rem_euclid(range);
    if d > range / 2.0 { d - range } else { d }
}

#[inline]
fn wrap(value: f32, min: f32, max: f32) -> f32 {
    min + (value - min).rem_euclid(max - min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::core::schema::{Schema, SchemaBuilder};
    use crate::core::snapshot::{FieldRead, FieldWrite, Snapshot};
    use crate::core::value::FieldKind;
    use crate::core::vec3::Vec3;

    fn schema() -> Arc<Schema> {
        SchemaBuilder::new("sample")
            .prop("time", FieldKind::U64)
            .prop("position", FieldKind::Vec3)
            .prop("yaw", FieldKind::F32).interpolate(Interpolation::Angle)
            .prop("phase", FieldKind::F32).interpolate(Interpolation::Cyclic { min: 0.0, max: 1.0 })
            .prop("ground", FieldKind::U8)
            .prop("name", FieldKind::Str)
            .build()
    }

    #[test]
    fn test_angle_takes_short_way() {
        let v = blend_scalar(Interpolation::Angle, 350.0, 10.0, 0.5);
        assert!(v.abs() < 1e-4 || (v - 360.0).abs() < 1e-4);
        let v = blend_scalar(Interpolation::Angle, 10.0, 350.0, 0.25);
        assert!((v - 5.0).abs() < 1e-4);
    }

    #[test]
    fn test_cyclic_wraps() {
        let rule = Interpolation::Cyclic { min: 0.0, max: 1.0 };
        let v = blend_scalar(rule, 0.9, 0.1, 0.5);
        assert!(v.abs() < 1e-5 || (v - 1.0).abs() < 1e-5);
        assert!((blend_scalar(rule, 0.2, 0.4, 0.5) - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_interpolate_into() {
        let s = schema();
        let mut a = Snapshot::new(&s);
        let mut b = Snapshot::new(&s);
        a.set_vec3(s.id("position"), Vec3::new(0.0, 0.0, 0.0));
        b.set_vec3(s.id("position"), Vec3::new(10.0, 0.0, 0.0));
        a.set_u8(s.id("ground"), 1);
        b.set_u8(s.id("ground"), 2);
        a.set_str(s.id("name"), "old");
        b.set_str(s.id("name"), "new");
        b.set_f32(s.id("yaw"), 90.0);

        let mut out = Snapshot::new(&s);
        interpolate_into(&mut out.view_mut(), a.view(), b.view(), 0.25);
        assert_eq!(out.get_vec3(s.id("position")), Some(Vec3::new(2.5, 0.0, 0.0)));
        assert_eq!(out.get_u8(s.id("ground")), Some(1));
        assert_eq!(out.get_str(s.id("name")), Some("old"));
        // absent on one side: newer wins
        assert_eq!(out.get_f32(s.id("yaw")), Some(90.0));

        interpolate_into(&mut out.view_mut(), a.view(), b.view(), 0.75);
        assert_eq!(out.get_u8(s.id("ground")), Some(2));
        assert_eq!(out.get_str(s.id("name")), Some("new"));
    }

    #[test]
    fn test_find_bracket() {
        let s = schema();
        let time = s.id("time");
        let mut history = History::new(8, || Snapshot::new(&s));
        for t in [100u64, 200, 300, 400] {
            history.claim_next().set_u64(time, t);
        }
        let time_of = |snapshot: &Snapshot| snapshot.get_u64(time);

        let bracket = find_bracket(&history, 250, time_of).unwrap();
        assert_eq!((bracket.older, bracket.newer), (-2, -1));
        assert!((bracket.fraction - 0.5).abs() < 1e-6);

        let ahead = find_bracket(&history, 900, time_of).unwrap();
        assert_eq!((ahead.older, ahead.newer, ahead.fraction), (0, 0, 0.0));

        let behind = find_bracket(&history, 50, time_of).unwrap();
        assert_eq!((behind.older, behind.newer), (-3, -3));

        let exact = find_bracket(&history, 300, time_of).unwrap();
        assert_eq!((exact.older, exact.newer, exact.fraction), (-1, 0, 0.0));

        let empty: History<Snapshot> = History::new(4, || Snapshot::new(&s));
        assert!(find_bracket(&empty, 10, time_of).is_none());
    }
}
