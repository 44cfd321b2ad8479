//! Application configuration.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::args::CliArgs;
use crate::infrastructure::image::{ImageLoaderConfig, default_cache_dir, default_document_dir};

const APP_NAME: &str = "asyncimage";
const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "linuxmobile";

/// Log level configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl LogLevel {
    /// Converts to tracing level.
    #[must_use]
    pub const fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Application configuration, from `config.toml` and the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Configuration file path.
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Log file path. Logs go to stderr when unset.
    #[serde(default)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Directory loaded images are written into.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// Scheduler settings.
    #[serde(default)]
    pub loader: LoaderSection,

    /// Memory cache settings.
    #[serde(default)]
    pub cache: CacheSection,
}

/// `[loader]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderSection {
    /// Maximum concurrent loads, 0 for unbounded.
    #[serde(default = "default_max_concurrent_loads")]
    pub max_concurrent_loads: usize,

    /// Per-load deadline in milliseconds, 0 for none.
    #[serde(default = "default_loading_timeout_ms")]
    pub loading_timeout_ms: u64,
}

impl Default for LoaderSection {
    fn default() -> Self {
        Self {
            max_concurrent_loads: default_max_concurrent_loads(),
            loading_timeout_ms: default_loading_timeout_ms(),
        }
    }
}

/// `[cache]` section. Zero means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSection {
    /// Maximum number of cached images.
    #[serde(default)]
    pub count_limit: usize,

    /// Maximum summed cost (decoded bytes) of cached images.
    #[serde(default)]
    pub total_cost_limit: usize,
}

const fn default_max_concurrent_loads() -> usize {
    4
}

const fn default_loading_timeout_ms() -> u64 {
    30_000
}

impl AppConfig {
    /// Merges CLI arguments into the configuration.
    pub fn merge_with_args(&mut self, args: &CliArgs) {
        if let Some(config_path) = &args.config {
            self.config = Some(config_path.clone());
        }
        if let Some(log_path) = &args.log_path {
            self.log_path = Some(log_path.clone());
        }
        if let Some(log_level) = args.log_level {
            self.log_level = log_level;
        }
        if let Some(output_dir) = &args.output_dir {
            self.output_dir = Some(output_dir.clone());
        }
        if let Some(max) = args.max_concurrent_loads {
            self.loader.max_concurrent_loads = max;
        }
        if let Some(timeout_ms) = args.timeout_ms {
            self.loader.loading_timeout_ms = timeout_ms;
        }
        if let Some(limit) = args.cache_limit {
            self.cache.count_limit = limit;
        }
    }

    /// Builds the loader configuration these settings describe.
    #[must_use]
    pub fn loader_config(&self) -> ImageLoaderConfig {
        ImageLoaderConfig {
            max_concurrent_loads: self.loader.max_concurrent_loads,
            loading_timeout: (self.loader.loading_timeout_ms > 0)
                .then(|| Duration::from_millis(self.loader.loading_timeout_ms)),
            cache_dir: Some(default_cache_dir()),
            document_dir: Some(default_document_dir()),
        }
    }

    /// Returns default config directory.
    #[must_use]
    pub fn default_config_dir() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Returns default config file path.
    #[must_use]
    pub fn default_config_path() -> Option<PathBuf> {
        Self::default_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Returns effective config path.
    #[must_use]
    pub fn effective_config_path(&self) -> Option<PathBuf> {
        self.config.clone().or_else(Self::default_config_path)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config: None,
            log_path: None,
            log_level: LogLevel::Info,
            output_dir: None,
            loader: LoaderSection::default(),
            cache: CacheSection::default(),
        }
    }
}
