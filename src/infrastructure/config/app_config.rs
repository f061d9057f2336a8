//! Pipeline configuration.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use super::args::CliArgs;
use crate::infrastructure::image::components::DEFAULT_USER_AGENT;
use crate::infrastructure::image::disk_cache::{
    DEFAULT_DOWNLOAD_CACHE_SIZE, DEFAULT_RESULT_CACHE_SIZE,
};
use crate::infrastructure::image::loader::ImageLoaderConfig;
use crate::infrastructure::image::memory_cache::DEFAULT_MEMORY_CACHE_SIZE;

pub(super) const APP_NAME: &str = "pixflow";
pub(super) const APP_QUALIFIER: &str = "com";
pub(super) const APP_ORGANIZATION: &str = "linuxmobile";

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

/// Pipeline configuration, read from `config.toml` and overridden by CLI
/// arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Configuration file path.
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Log file path. Logs go to stderr when unset.
    #[serde(default)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Memory cache budget in bytes.
    #[serde(default = "default_memory_cache_size")]
    pub memory_cache_size: u64,

    /// Download cache budget in bytes.
    #[serde(default = "default_download_cache_size")]
    pub download_cache_size: u64,

    /// Result cache budget in bytes.
    #[serde(default = "default_result_cache_size")]
    pub result_cache_size: u64,

    /// Root directory of the disk caches.
    /// Defaults to the platform cache directory.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Maximum concurrent network fetches.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,

    /// Maximum concurrent decodes.
    #[serde(default = "default_max_concurrent_decodes")]
    pub max_concurrent_decodes: usize,

    /// HTTP request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// `User-Agent` sent with HTTP requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_memory_cache_size() -> u64 {
    DEFAULT_MEMORY_CACHE_SIZE
}

fn default_download_cache_size() -> u64 {
    DEFAULT_DOWNLOAD_CACHE_SIZE
}

fn default_result_cache_size() -> u64 {
    DEFAULT_RESULT_CACHE_SIZE
}

fn default_max_concurrent_fetches() -> usize {
    4
}

fn default_max_concurrent_decodes() -> usize {
    std::thread::available_parallelism().map_or(2, NonZeroUsize::get)
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

impl PipelineConfig {
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
        if let Some(cache_dir) = &args.cache_dir {
            self.cache_dir = Some(cache_dir.clone());
        }
        if let Some(size) = args.memory_cache_size {
            self.memory_cache_size = size;
        }
        if let Some(fetches) = args.max_concurrent_fetches {
            self.max_concurrent_fetches = fetches;
        }
        if let Some(timeout) = args.timeout_secs {
            self.timeout_secs = timeout;
        }
    }

    /// Returns the default cache directory.
    #[must_use]
    pub fn default_cache_dir() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.cache_dir().to_path_buf())
    }

    /// Returns the effective cache directory.
    #[must_use]
    pub fn effective_cache_dir(&self) -> Option<PathBuf> {
        self.cache_dir.clone().or_else(Self::default_cache_dir)
    }

    /// Returns the effective log path; `None` logs to stderr.
    #[must_use]
    pub fn effective_log_path(&self) -> Option<PathBuf> {
        self.log_path.clone()
    }

    /// HTTP timeout as a duration.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Builds the loader configuration.
    #[must_use]
    pub fn to_loader_config(&self) -> ImageLoaderConfig {
        ImageLoaderConfig {
            memory_cache_size: self.memory_cache_size,
            download_cache_size: self.download_cache_size,
            result_cache_size: self.result_cache_size,
            cache_dir: self.effective_cache_dir(),
            max_concurrent_fetches: self.max_concurrent_fetches.max(1),
            max_concurrent_decodes: self.max_concurrent_decodes.max(1),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            config: None,
            log_path: None,
            log_level: LogLevel::Info,
            memory_cache_size: default_memory_cache_size(),
            download_cache_size: default_download_cache_size(),
            result_cache_size: default_result_cache_size(),
            cache_dir: None,
            max_concurrent_fetches: default_max_concurrent_fetches(),
            max_concurrent_decodes: default_max_concurrent_decodes(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_parse_partial_config() {
        let toml_content = r#"
            memory_cache_size = 1024
            cache_dir = "/tmp/pixflow"
            log_level = "debug"
        "#;

        let config: PipelineConfig = toml::from_str(toml_content).expect("Failed to parse config");

        assert_eq!(config.memory_cache_size, 1024);
        assert_eq!(config.cache_dir, Some(PathBuf::from("/tmp/pixflow")));
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.download_cache_size, DEFAULT_DOWNLOAD_CACHE_SIZE);
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
    }

    #[test]
    fn test_args_override_file_values() {
        let mut config = PipelineConfig::default();
        let args = CliArgs::parse_from([
            "pixflow",
            "--log-level",
            "trace",
            "--cache-dir",
            "/var/cache/px",
            "--timeout-secs",
            "5",
            "clear",
        ]);

        config.merge_with_args(&args);

        assert_eq!(config.log_level, LogLevel::Trace);
        assert_eq!(config.cache_dir, Some(PathBuf::from("/var/cache/px")));
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.memory_cache_size, DEFAULT_MEMORY_CACHE_SIZE);
    }

    #[test]
    fn test_loader_config_uses_effective_values() {
        let config = PipelineConfig {
            cache_dir: Some(PathBuf::from("/tmp/px")),
            max_concurrent_fetches: 0,
            result_cache_size: 7,
            ..PipelineConfig::default()
        };

        let loader = config.to_loader_config();

        assert_eq!(loader.cache_dir, Some(PathBuf::from("/tmp/px")));
        assert_eq!(loader.max_concurrent_fetches, 1);
        assert_eq!(loader.result_cache_size, 7);
    }
}
