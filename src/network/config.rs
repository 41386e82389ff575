//! Session Configuration
//!
//! Explicit settings handed to both loops at construction. Loaded from
//! JSON; every field is optional and falls back to [`SessionConfig::default`].

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid JSON for this struct.
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),

    /// A value is out of range.
    #[error("invalid `{field}`: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: &'static str,
    },
}

/// Settings shared by the server and client loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Simulation tick rate (Hz).
    pub tick_rate_hz: u16,
    /// Player array length.
    pub max_players: usize,
    /// Entity array length.
    pub max_entities: usize,
    /// Entries per history ring.
    pub history_count: usize,
    /// Mode the server runs.
    pub mode_id: u8,
    /// Remote-player render lag, in ticks.
    pub player_render_interval_ticks: u32,
    /// Drift beyond this many ticks counts as a reset error.
    pub drift_tolerance_ticks: u32,
    /// Server drops a player whose tracked time lags by more than this (us).
    pub player_timeout_us: u64,
    /// Server ping-check cadence (us).
    pub ping_interval_us: u64,
    /// Rollback window multiplier for hit detection.
    pub rollback_interval_ticks: u32,
    /// Mark unchanged fields "same" on outgoing sessions.
    pub compress_sessions: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 60,
            max_players: 10,
            max_entities: 16,
            history_count: 250,
            mode_id: 0,
            player_render_interval_ticks: 2,
            drift_tolerance_ticks: 3,
            player_timeout_us: 2_000_000,
            ping_interval_us: 1_000_000,
            rollback_interval_ticks: 2,
            compress_sessions: false,
        }
    }
}

impl SessionConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate_hz == 0 {
            return Err(ConfigError::Invalid { field: "tick_rate_hz", reason: "must be non-zero" });
        }
        if self.max_players == 0 || self.max_players > u8::MAX as usize {
            return Err(ConfigError::Invalid { field: "max_players", reason: "must be 1..=255" });
        }
        if self.history_count < 8 {
            return Err(ConfigError::Invalid { field: "history_count", reason: "must be at least 8" });
        }
        Ok(())
    }

    /// Fixed tick interval (us).
    #[inline]
    pub fn tick_interval_us(&self) -> u32 {
        1_000_000 / self.tick_rate_hz.max(1) as u32
    }

    /// Remote-player render lag (us).
    #[inline]
    pub fn player_render_interval_us(&self) -> u64 {
        self.tick_interval_us() as u64 * self.player_render_interval_ticks as u64
    }

    /// Reset-error threshold (us).
    #[inline]
    pub fn drift_tolerance_us(&self) -> u64 {
        self.tick_interval_us() as u64 * self.drift_tolerance_ticks as u64
    }
}
