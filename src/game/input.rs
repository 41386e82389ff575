//! Input Sampling
//!
//! Device state as seen by the client loop once per frame or tick. A
//! [`PlayerModifier`](super::stepper::PlayerModifier) turns an
//! [`InputFrame`] into command fields; the loops never read devices
//! directly.

use serde::{Serialize, Deserialize};

use crate::core::rng::DeterministicRng;

// =============================================================================
// INPUT FRAME
// =============================================================================

/// Raw device state for one sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFrame {
    /// Strafe axis: -127 (left) to +127 (right)
    pub move_x: i8,
    /// Forward axis: -127 (back) to +127 (forward)
    pub move_y: i8,
    /// Horizontal look delta in hundredths of a degree
    pub look_dx: i16,
    /// Vertical look delta in hundredths of a degree
    pub look_dy: i16,
    /// Button bits, see the `FLAG_*` constants
    pub flags: u8,
}

impl InputFrame {
    /// Jump pressed this sample
    pub const FLAG_JUMP: u8 = 0x01;
    /// Primary use (throw) pressed this sample
    pub const FLAG_USE: u8 = 0x02;
    /// Next inventory slot pressed this sample
    pub const FLAG_CYCLE_ITEM: u8 = 0x04;

    /// Idle frame.
    pub const fn new() -> Self {
        Self {
            move_x: 0,
            move_y: 0,
            look_dx: 0,
            look_dy: 0,
            flags: 0,
        }
    }

    /// Frame with movement axes set.
    pub const fn with_movement(move_x: i8, move_y: i8) -> Self {
        Self {
            move_x,
            move_y,
            look_dx: 0,
            look_dy: 0,
            flags: 0,
        }
    }

    /// Axes mapped to `[-1, 1]`.
    #[inline]
    pub fn axes(&self) -> (f32, f32) {
        (axis(self.move_x), axis(self.move_y))
    }

    /// Look delta in degrees.
    #[inline]
    pub fn look_degrees(&self) -> (f32, f32) {
        (self.look_dx as f32 / 100.0, self.look_dy as f32 / 100.0)
    }

    /// Whether a button bit is set.
    #[inline]
    pub fn pressed(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Set or clear a button bit.
    #[inline]
    pub fn set(&mut self, flag: u8, pressed: bool) {
        if pressed {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }
}

#[inline]
fn axis(value: i8) -> f32 {
    (value.max(-127) as f32) / 127.0
}

// =============================================================================
// DEVICES
// =============================================================================

/// Source of input samples for the client loop.
pub trait InputDevice: Send {
    /// Sample device state at `time_us`.
    fn sample(&mut self, time_us: u64) -> InputFrame;
}

/// Device that never produces input.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleInput;

impl InputDevice for IdleInput {
    fn sample(&mut self, _time_us: u64) -> InputFrame {
        InputFrame::new()
    }
}

/// Seeded pseudo-player: wanders, looks around, jumps and throws now and then.
#[derive(Debug, Clone)]
pub struct ScriptedInput {
    rng: DeterministicRng,
    current: InputFrame,
    hold_until_us: u64,
}

impl ScriptedInput {
    /// Create from a seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: DeterministicRng::new(seed),
            current: InputFrame::new(),
            hold_until_us: 0,
        }
    }
}

impl InputDevice for ScriptedInput {
    fn sample(&mut self, time_us: u64) -> InputFrame {
        if time_us >= self.hold_until_us {
            let x = self.rng.next_int(255) as i16 - 127;
            let y = self.rng.next_int(255) as i16 - 127;
            self.current = InputFrame::with_movement(x as i8, y as i8);
            self.current.look_dx = self.rng.next_int(401) as i16 - 200;
            self.hold_until_us = time_us + 250_000 + self.rng.next_int(500_000) as u64;
        }
        let mut frame = self.current;
        frame.set(InputFrame::FLAG_JUMP, self.rng.next_int(90) == 0);
        frame.set(InputFrame::FLAG_USE, self.rng.next_int(240) == 0);
        frame.set(InputFrame::FLAG_CYCLE_ITEM, self.rng.next_int(600) == 0);
        frame
    }
}
