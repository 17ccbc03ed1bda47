//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Resumable downloads and uploads for the EDO content platform.
///
/// Interrupted transfers pick up where they stopped: downloads from the
/// partial temp file, uploads from a checkpoint kept between runs.
#[derive(Parser, Debug)]
#[command(name = "edo-transfer")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Hide the progress bar
    #[arg(long, global = true)]
    pub no_progress: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download a URL to a local file, resuming a partial temp file
    Download(DownloadArgs),
    /// Upload a local file against an upload ticket
    Upload(UploadArgs),
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// URL to download
    pub url: String,

    /// Destination file
    pub dest: PathBuf,

    /// First byte to fetch
    #[arg(long, default_value_t = 0)]
    pub start: u64,

    /// Last byte to fetch, inclusive (defaults to end of file)
    #[arg(long)]
    pub end: Option<u64>,

    /// Fetch in one request without Range headers
    #[arg(long)]
    pub no_resume: bool,

    /// Print the MD5 of the written bytes
    #[arg(long)]
    pub md5: bool,

    /// Retry budget for transient failures (0-100)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(0..=100))]
    pub retries: Option<u32>,

    /// Temp file to stream into (defaults to `.<name>` next to the destination)
    #[arg(long)]
    pub temp_path: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    /// File to upload
    pub file: PathBuf,

    /// JSON file holding the upload ticket
    #[arg(long)]
    pub ticket: PathBuf,

    /// Platform API host (overrides config)
    #[arg(long)]
    pub api_host: Option<String>,

    /// Chunk and part size in bytes
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub chunk_size: Option<u64>,

    /// Directory for upload checkpoints (overrides config)
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Bearer token for the platform API
    #[arg(long, env = "EDO_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}
