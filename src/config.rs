//! Runtime configuration.
//!
//! Every tunable the runtime used to hard-code (poll tiers, underrun
//! tolerance, ring sizing) lives here and can be loaded from TOML:
//!
//! ```toml
//! sample_rate = 48000
//! max_message_depth = 256
//! analyzer_type = "fft~"
//!
//! [analysis]
//! focused_poll_hz = 60.0
//! unfocused_poll_hz = 10.0
//!
//! [bridge]
//! ring_blocks = 8
//! backlog_threshold_blocks = 4
//! max_consecutive_underruns = 100
//! engine_mode = "threaded"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a file
    #[error("failed to read file '{path}': {source}")]
    ReadFile {
        /// Path of the file that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// A field holds a value the runtime cannot work with
    #[error("invalid value for '{field}': {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: &'static str,
    },
}

/// Top-level runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Sample rate of the native audio graph in Hz.
    pub sample_rate: u32,
    /// Maximum nesting of synchronous message delivery before a cycle is cut.
    pub max_message_depth: usize,
    /// Object type treated as an FFT analyzer during connection inference.
    pub analyzer_type: String,
    /// FFT polling settings.
    pub analysis: AnalysisConfig,
    /// Real-time bridge settings.
    pub bridge: BridgeConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            max_message_depth: 256,
            analyzer_type: "fft~".into(),
            analysis: AnalysisConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

/// Polling tiers for the FFT subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Poll rate while the host window has input focus.
    pub focused_poll_hz: f64,
    /// Poll rate while the host window is unfocused but visible.
    pub unfocused_poll_hz: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            focused_poll_hz: 60.0,
            unfocused_poll_hz: 10.0,
        }
    }
}

impl AnalysisConfig {
    /// Slowest accepted poll rate (one poll every 100 s).
    pub const MIN_POLL_HZ: f64 = 0.01;
    /// Fastest accepted poll rate.
    pub const MAX_POLL_HZ: f64 = 1000.0;

    /// Interval between polls for the given focus state. Rates outside
    /// `MIN_POLL_HZ..=MAX_POLL_HZ` are clamped into it.
    pub fn poll_interval(&self, focused: bool) -> Duration {
        let hz = if focused {
            self.focused_poll_hz
        } else {
            self.unfocused_poll_hz
        };
        let hz = if hz.is_nan() {
            Self::MIN_POLL_HZ
        } else {
            hz.clamp(Self::MIN_POLL_HZ, Self::MAX_POLL_HZ)
        };
        Duration::from_secs_f64(1.0 / hz)
    }
}

/// Sizing and failure tolerance of the real-time bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Ring capacity, in real-time callback blocks.
    pub ring_blocks: usize,
    /// The producer is asked for more once the backlog drops below this many blocks.
    pub backlog_threshold_blocks: usize,
    /// Consecutive underruns tolerated before the stream is declared dead.
    pub max_consecutive_underruns: u32,
    /// What drives embedded engines.
    pub engine_mode: EngineMode,
}

/// Who pumps the producer side of an engine's bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    /// A worker thread, on wall-clock time
    #[default]
    Threaded,
    /// The render loop, before every quantum. For offline rendering.
    Inline,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ring_blocks: 8,
            backlog_threshold_blocks: 4,
            max_consecutive_underruns: 100,
            engine_mode: EngineMode::Threaded,
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid {
                field: "sample_rate",
                reason: "must be positive",
            });
        }
        if self.max_message_depth == 0 {
            return Err(ConfigError::Invalid {
                field: "max_message_depth",
                reason: "must be positive",
            });
        }
        let rates = AnalysisConfig::MIN_POLL_HZ..=AnalysisConfig::MAX_POLL_HZ;
        if !rates.contains(&self.analysis.focused_poll_hz) {
            return Err(ConfigError::Invalid {
                field: "analysis.focused_poll_hz",
                reason: "must be between 0.01 and 1000",
            });
        }
        if !rates.contains(&self.analysis.unfocused_poll_hz) {
            return Err(ConfigError::Invalid {
                field: "analysis.unfocused_poll_hz",
                reason: "must be between 0.01 and 1000",
            });
        }
        if self.bridge.ring_blocks < 2 {
            return Err(ConfigError::Invalid {
                field: "bridge.ring_blocks",
                reason: "the ring must hold at least two blocks",
            });
        }
        if self.bridge.backlog_threshold_blocks == 0
            || self.bridge.backlog_threshold_blocks > self.bridge.ring_blocks
        {
            return Err(ConfigError::Invalid {
                field: "bridge.backlog_threshold_blocks",
                reason: "must be between 1 and ring_blocks",
            });
        }
        if self.bridge.max_consecutive_underruns == 0 {
            return Err(ConfigError::Invalid {
                field: "bridge.max_consecutive_underruns",
                reason: "must be positive",
            });
        }
        Ok(())
    }
}
