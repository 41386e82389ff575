//! Localized Clocks
//!
//! Accumulates a remote clock's deltas onto a local estimate and snaps the
//! estimate back when it drifts too far. Used by the client for the
//! session and per-player localized stamps, and by the server for each
//! player's tracked time.

/// What happened to an estimate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockUpdate {
    /// No previous estimate; seeded from the local clock.
    Seeded,
    /// Delta accumulated, within tolerance.
    Advanced,
    /// Drifted past tolerance; reset to the local clock.
    Snapped {
        /// Signed drift before the snap (estimate - local)
        drift_us: i64,
    },
}

impl ClockUpdate {
    /// Whether this update counts as a reset error.
    #[inline]
    pub fn is_reset(self) -> bool {
        matches!(self, ClockUpdate::Snapped { .. })
    }
}

/// Advance `previous` by `delta_us` and check it against `local_now_us`.
///
/// Returns the new estimate. Drift strictly greater than `tolerance_us`
/// snaps to `local_now_us` exactly.
pub fn localize(previous: Option<u64>, delta_us: i64, local_now_us: u64, tolerance_us: u64) -> (u64, ClockUpdate) {
    let Some(previous) = previous else {
        return (local_now_us, ClockUpdate::Seeded);
    };
    let estimate = (previous as i64).saturating_add(delta_us).max(0) as u64;
    let drift_us = estimate as i64 - local_now_us as i64;
    if drift_us.unsigned_abs() > tolerance_us {
        (local_now_us, ClockUpdate::Snapped { drift_us })
    } else {
        (estimate, ClockUpdate::Advanced)
    }
}

/// Signed tick delta `incoming - last`, or `None` when either is unknown.
#[inline]
pub fn tick_delta(incoming: Option<u32>, last: Option<u32>) -> Option<i64> {
    Some(incoming? as i64 - last? as i64)
}
