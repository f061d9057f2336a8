use super::app_config::LogLevel;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "pixflow",
    version,
    about = "Load images through a cached, coalescing pipeline",
    long_about = None
)]
pub struct CliArgs {
    /// Configuration file path.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH")]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Root directory of the disk caches.
    #[arg(long, value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Memory cache budget in bytes.
    #[arg(long)]
    pub memory_cache_size: Option<u64>,

    /// Maximum concurrent network fetches.
    #[arg(long)]
    pub max_concurrent_fetches: Option<usize>,

    /// HTTP request timeout in seconds.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load an image and optionally save it as PNG.
    Load {
        /// URL, file path or data URI.
        locator: String,

        /// Target width in pixels.
        #[arg(long, requires = "height")]
        width: Option<u32>,

        /// Target height in pixels.
        #[arg(long, requires = "width")]
        height: Option<u32>,

        /// Where to write the decoded image.
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Remove every cached entry.
    Clear,
}
