//! TOML configuration for the slidesync CLI.
//!
//! Only operational knobs live here; the tracking thresholds are fixed by
//! design and are not configurable.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Log verbosity level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ValueEnum, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Configuration loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SlideSyncConfig {
    /// Log verbosity.
    pub log_level: Option<LogLevel>,
    /// Feature detector block.
    pub detector: DetectorConfig,
}

/// Detector budget knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectorConfig {
    /// Keep at most this many keypoints per image.
    pub max_features: usize,
    /// FAST segment-test threshold.
    pub fast_threshold: u8,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_features: 1500,
            fast_threshold: 20,
        }
    }
}
