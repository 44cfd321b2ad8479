use super::app_config::LogLevel;
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "asyncimage",
    version,
    about = "Load images through a coalescing, bounded async loader",
    long_about = None
)]
pub struct CliArgs {
    /// Image identifiers: URLs, `file://` URLs or absolute paths.
    #[arg(required = true, value_name = "ID")]
    pub ids: Vec<String>,

    /// Configuration file path.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH")]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Write each loaded image into this directory.
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Maximum concurrent loads, 0 for unbounded.
    #[arg(long)]
    pub max_concurrent_loads: Option<usize>,

    /// Per-load deadline in milliseconds, 0 for none.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Maximum number of images kept in memory, 0 for unlimited.
    #[arg(long)]
    pub cache_limit: Option<usize>,

    /// Print outcomes as JSON lines.
    #[arg(long)]
    pub json: bool,
}
