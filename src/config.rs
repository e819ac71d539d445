//! ==============================================================================
//! config.rs - station configuration loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `station.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - ServerConfig: where the http api listens.
//!     - HistoryConfig: retention window and shared listener queue depth.
//!     - LoggingConfig: default log level (RUST_LOG still wins).
//!     - SourceConfig: one entry per serial controller.
//!
//! ==============================================================================

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::history::DEFAULT_WINDOW;
use crate::link::{LinkConfig, DEFAULT_BAUD};

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StationConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    /// readings kept per source (W); a query returns up to W+1
    #[serde(default = "default_window")]
    pub window: usize,
    /// depth of the queue each device fills for the store and the hub
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

/// one serial controller, also returned as-is by GET /api/sources
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SourceConfig {
    pub name: String,
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default)]
    pub disabled: bool,
}

impl SourceConfig {
    pub fn link(&self) -> LinkConfig {
        LinkConfig::new(&self.port, self.baud)
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_window() -> usize {
    DEFAULT_WINDOW
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_level() -> String {
    "info".to_string()
}

fn default_baud() -> u32 {
    DEFAULT_BAUD
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind(), port: default_port() }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { window: default_window(), queue_capacity: default_queue_capacity() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_level() }
    }
}

/// result of load_or_default
#[derive(Debug)]
pub struct Loaded {
    pub config: StationConfig,
    /// None when running on defaults
    pub path: Option<PathBuf>,
    pub warnings: Vec<String>,
}

impl Loaded {
    pub fn log(&self) {
        for warning in &self.warnings {
            tracing::warn!(error = %warning, "failed to load config");
        }
        match &self.path {
            Some(path) => tracing::info!(path = %path.display(), "configuration loaded"),
            None => tracing::warn!("no config file found, using defaults"),
        }
        self.config.log_summary();
    }
}

impl StationConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load with default fallback
    ///
    /// an explicit path must exist and parse. without one, the usual
    /// locations are tried and the first that loads wins; nothing found means
    /// defaults. returns the path actually used. runs before logging is set
    /// up, so problems with candidate files are handed back as warnings.
    pub fn load_or_default(explicit: Option<&Path>) -> anyhow::Result<Loaded> {
        if let Some(path) = explicit {
            let config = Self::load(path)?;
            return Ok(Loaded { config, path: Some(path.to_path_buf()), warnings: Vec::new() });
        }

        let paths = [
            PathBuf::from("config").join("station.toml"),
            PathBuf::from("..").join("config").join("station.toml"),
        ];

        let mut warnings = Vec::new();
        for path in paths {
            if path.exists() {
                match Self::load(&path) {
                    Ok(config) => return Ok(Loaded { config, path: Some(path), warnings }),
                    Err(e) => warnings.push(format!("{e:#}")),
                }
            }
        }

        Ok(Loaded { config: Self::default(), path: None, warnings })
    }

    /// sources that should be started
    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| !s.disabled)
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        tracing::info!(
            bind = %self.server.bind,
            port = self.server.port,
            window = self.history.window,
            queue_capacity = self.history.queue_capacity,
            level = %self.logging.level,
            "station configuration"
        );
        for source in &self.sources {
            tracing::info!(
                source = %source.name,
                port = %source.port,
                baud = source.baud,
                disabled = source.disabled,
                "configured source"
            );
        }
    }
}
