//! Fixed-Step Ticker
//!
//! Turns an uneven stream of frame timestamps into whole simulation ticks
//! of a fixed duration. Tick times are exact multiples of the interval from
//! the first frame, so two tickers fed the same interval agree on every
//! `(tick, time_us)` pair regardless of frame jitter.

use serde::{Serialize, Deserialize};

/// One fixed simulation step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickStep {
    /// Monotonic tick number
    pub tick: u32,
    /// Absolute tick time in microseconds
    pub time_us: u64,
    /// Step duration in microseconds
    pub duration_us: u32,
}

/// Accumulates frame time into fixed ticks.
#[derive(Clone, Debug)]
pub struct Ticker {
    interval_us: u32,
    next_tick: u32,
    origin_us: Option<u64>,
    /// Upper bound on ticks emitted per frame after a stall.
    max_catch_up: u32,
}

impl Ticker {
    /// Create a ticker for `tick_rate_hz`.
    pub fn new(tick_rate_hz: u32) -> Self {
        Self::with_interval(1_000_000 / tick_rate_hz.max(1))
    }

    /// Create a ticker with an explicit interval.
    pub fn with_interval(interval_us: u32) -> Self {
        Self {
            interval_us: interval_us.max(1),
            next_tick: 0,
            origin_us: None,
            max_catch_up: 8,
        }
    }

    /// Tick interval in microseconds.
    #[inline]
    pub fn interval_us(&self) -> u32 {
        self.interval_us
    }

    /// Next tick number to be emitted.
    #[inline]
    pub fn next_tick(&self) -> u32 {
        self.next_tick
    }

    fn tick_time(&self, origin: u64, tick: u32) -> u64 {
        origin + tick as u64 * self.interval_us as u64
    }

    /// Collect every tick due at `now_us`.
    ///
    /// The first call anchors tick 0 at `now_us`. After a stall longer than
    /// the catch-up limit the origin slides forward so the backlog is
    /// dropped instead of replayed.
    pub fn advance(&mut self, now_us: u64) -> Vec<TickStep> {
        let origin = *self.origin_us.get_or_insert(now_us);
        let mut steps = Vec::new();
        while self.tick_time(origin, self.next_tick) <= now_us {
            if steps.len() as u32 == self.max_catch_up {
                let behind = now_us - self.tick_time(origin, self.next_tick);
                let skipped = behind / self.interval_us as u64 + 1;
                self.origin_us = Some(origin + skipped * self.interval_us as u64);
                break;
            }
            steps.push(TickStep {
                tick: self.next_tick,
                time_us: self.tick_time(origin, self.next_tick),
                duration_us: self.interval_us,
            });
            self.next_tick = self.next_tick.wrapping_add(1);
        }
        steps
    }
}
