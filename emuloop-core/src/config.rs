//! Controller configuration
//!
//! Plain structs with sensible defaults. Every field can also come from a
//! JSON file; missing keys fall back to the defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Per-controller log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// Rewind history configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewindConfig {
    /// Capture snapshots at all
    pub enabled: bool,
    /// Maximum snapshots retained
    pub capacity: usize,
    /// Frames between snapshots
    pub interval: u64,
    /// Store older entries as reverse deltas
    pub deltas: bool,
}

impl Default for RewindConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 600,
            interval: 1,
            deltas: true,
        }
    }
}

/// Producer/consumer sync configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Block on the consumer and cap the producer at `target_fps`
    pub video_sync: bool,
    /// Block the producer while the audio buffer is full
    pub audio_sync: bool,
    /// Allow completed frames to be dropped (fast-forward)
    pub drop_frames: bool,
    /// Target frame rate when video sync is on
    pub target_fps: f64,
    /// Frames the consumer may hold before the producer must wait
    pub frame_slots: usize,
    /// Audio samples buffered before the producer waits (or discards)
    pub audio_buffer_samples: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            video_sync: true,
            audio_sync: false,
            drop_frames: false,
            target_fps: 59.7275,
            frame_slots: 1,
            audio_buffer_samples: 4096,
        }
    }
}

/// Thread controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadConfig {
    /// Execution thread name, also used to tag log output
    pub name: String,
    /// Initial log level for this controller
    pub log_level: LogLevel,
    pub rewind: RewindConfig,
    pub sync: SyncConfig,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            name: "emu".to_string(),
            log_level: LogLevel::Info,
            rewind: RewindConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl ThreadConfig {
    /// Parse from a JSON document
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let config: ThreadConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.rewind.enabled {
            if self.rewind.capacity == 0 {
                return Err(ConfigError::Invalid("rewind.capacity must be > 0".into()));
            }
            if self.rewind.interval == 0 {
                return Err(ConfigError::Invalid("rewind.interval must be > 0".into()));
            }
        }
        if !(self.sync.target_fps > 0.0) {
            return Err(ConfigError::Invalid("sync.target_fps must be > 0".into()));
        }
        if self.sync.frame_slots == 0 {
            return Err(ConfigError::Invalid("sync.frame_slots must be > 0".into()));
        }
        Ok(())
    }
}
