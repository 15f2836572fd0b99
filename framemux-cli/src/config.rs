//! Configuration for the framemux command line tool.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use framemux_core::pacer::DEFAULT_WINDOW;
use framemux_core::{EncoderConfig, EncoderError, PacingMode, QueueConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Encode session settings.
    pub encoder: EncoderConfig,
    /// Where frames come from.
    pub source: SourceConfig,
    /// Frame pacing.
    pub pacing: PacingConfig,
    /// Command queue tuning.
    pub queue: QueueConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Kind of frame source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Generated moving test pattern.
    #[default]
    Synthetic,
    /// Packed BGR24 frames read back to back from a file or stdin.
    Raw,
}

/// Frame source configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Input for `raw` sources; `-` reads stdin.
    pub path: PathBuf,
    /// Stop after this many frames. Zero runs until the source ends.
    pub frames: u64,
}

/// Pacing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub mode: PacingMode,
    /// Frames averaged when estimating the per-frame cost.
    pub window: usize,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Also raise the codec library's own log verbosity.
    pub codec_debug: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid encoder settings: {0}")]
    Invalid(#[from] EncoderError),
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Synthetic,
            path: PathBuf::from("-"),
            frames: 300,
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            mode: PacingMode::Throttle,
            window: DEFAULT_WINDOW,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            codec_debug: false,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl AppConfig {
    /// Parse and validate a config file.
    pub fn try_load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.encoder.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(config) => config,
            Err(ConfigError::Read(_)) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, Self::default().to_toml()?)?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
