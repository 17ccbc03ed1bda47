//! CLI entry point for edo-transfer.

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use edo_transfer::download::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_DOWNLOAD_RETRIES, READ_TIMEOUT_SECS, REQUEST_TIMEOUT,
};
use edo_transfer::{
    CheckpointStore, DownloadOptions, Downloader, HttpClient, ObjectStoreBridge, RetryPolicy,
    StaticToken, TokenSource, TransferError, TransferProgress, TransferTicket, UploadOptions,
    UploadResponse, Uploader, default_object_store_root, default_upload_root,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

mod app_config;
mod cli;

use app_config::FileConfig;
use cli::{Cli, Command, DownloadArgs, UploadArgs};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();
    let config = app_config::load_default_file_config()?;

    // Priority: RUST_LOG env var > quiet flag > verbose flag > config > default (info)
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => config.verbosity.map_or("info", |v| v.filter()),
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(verbose = cli.verbose, quiet = cli.quiet, ?config, "CLI arguments parsed");

    let http = HttpClient::try_new_with_timeouts(
        config.connect_timeout_secs.unwrap_or(CONNECT_TIMEOUT_SECS),
        config.read_timeout_secs.unwrap_or(READ_TIMEOUT_SECS),
    )
    .context("Failed to build HTTP client")?;

    let interrupted = Arc::new(AtomicBool::new(false));
    spawn_interrupt_watcher(Arc::clone(&interrupted));
    let bar = progress_bar(cli.quiet || cli.no_progress);

    let result = match cli.command {
        Command::Download(args) => run_download(http, &config, args, &bar, &interrupted).await,
        Command::Upload(args) => run_upload(http, &config, args, &bar, &interrupted).await,
    };
    bar.finish_and_clear();

    if let Err(error) = &result
        && let Some(TransferError::Cancelled { transferred }) = error.downcast_ref::<TransferError>()
    {
        warn!(transferred, "transfer interrupted");
    }
    result
}

async fn run_download(
    http: HttpClient,
    config: &FileConfig,
    args: DownloadArgs,
    bar: &ProgressBar,
    interrupted: &AtomicBool,
) -> Result<()> {
    let defaults = DownloadOptions::default();
    let options = DownloadOptions {
        start: args.start,
        end: args.end,
        resumable: !args.no_resume,
        retries: args
            .retries
            .or(config.download_retries)
            .unwrap_or(DEFAULT_DOWNLOAD_RETRIES),
        calc_hash: args.md5,
        request_timeout: config
            .request_timeout_secs
            .map_or(defaults.request_timeout, Duration::from_secs),
        ..defaults
    };

    info!(url = %args.url, dest = %args.dest.display(), "Downloading");
    let mut on_progress = progress_callback(bar, interrupted);
    let outcome = Downloader::new(http)
        .download_to_file(
            &args.url,
            &args.dest,
            args.temp_path.as_deref(),
            &options,
            &mut on_progress,
        )
        .await
        .with_context(|| format!("Failed to download '{}'", args.url))?;

    info!(bytes = outcome.bytes_written, total = outcome.total_size, "Download finished");
    if let Some(md5) = outcome.md5 {
        println!("{md5}  {}", args.dest.display());
    }
    Ok(())
}

async fn run_upload(
    http: HttpClient,
    config: &FileConfig,
    args: UploadArgs,
    bar: &ProgressBar,
    interrupted: &AtomicBool,
) -> Result<()> {
    let ticket = read_ticket(&args.ticket)?;
    let chunk_size = args
        .chunk_size
        .or(config.chunk_size)
        .unwrap_or(edo_transfer::upload::DEFAULT_CHUNK_SIZE);

    let object_store_root = config
        .object_store_checkpoint_dir
        .clone()
        .or_else(default_object_store_root)
        .context("No object store checkpoint directory; set HOME or `object_store_checkpoint_dir`")?;
    let bridge = ObjectStoreBridge::new(
        http.clone(),
        CheckpointStore::open(&object_store_root)?,
        chunk_size,
    )?;

    info!(file = %args.file.display(), service = ticket.service(), "Uploading");
    let mut on_progress = progress_callback(bar, interrupted);
    let response: UploadResponse = match &ticket {
        TransferTicket::ObjectStore(store_ticket) => bridge
            .upload(&args.file, store_ticket, &mut on_progress)
            .await
            .with_context(|| format!("Failed to upload '{}'", args.file.display()))?,
        TransferTicket::Direct(_) => {
            let Some(api_host) = args.api_host.as_deref().or(config.api_host.as_deref()) else {
                bail!("Direct upload tickets need --api-host or `api_host` in the config file");
            };
            let checkpoint_root = args
                .checkpoint_dir
                .clone()
                .or_else(|| config.checkpoint_dir.clone())
                .or_else(default_upload_root)
                .context("No checkpoint directory; set HOME or pass --checkpoint-dir")?;
            let tokens = args
                .token
                .map(|token| Arc::new(StaticToken::new(token)) as Arc<dyn TokenSource>);
            let retry = config
                .upload_retries
                .map_or_else(RetryPolicy::default, RetryPolicy::with_max_attempts);
            let uploader = Uploader::new(
                http,
                api_host,
                tokens,
                CheckpointStore::open(&checkpoint_root)?,
                bridge,
                UploadOptions {
                    chunk_size,
                    retry,
                    request_timeout: config
                        .request_timeout_secs
                        .map_or(REQUEST_TIMEOUT, Duration::from_secs),
                },
            )?;
            uploader
                .upload(&args.file, &ticket, &mut on_progress)
                .await
                .with_context(|| format!("Failed to upload '{}'", args.file.display()))?
        }
    };

    println!("{}", response.body);
    Ok(())
}

fn read_ticket(path: &Path) -> Result<TransferTicket> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read ticket file '{}'", path.display()))?;
    TransferTicket::from_json_str(&raw)
        .with_context(|| format!("Invalid ticket in '{}'", path.display()))
}

fn progress_bar(hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner} [{elapsed_precise}] [{wide_bar}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar
}

fn progress_callback<'a>(
    bar: &'a ProgressBar,
    interrupted: &'a AtomicBool,
) -> impl FnMut(TransferProgress) -> ControlFlow<()> + Send + 'a {
    move |progress: TransferProgress| {
        bar.set_length(progress.total);
        bar.set_position(progress.transferred);
        if interrupted.load(Ordering::SeqCst) {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

/// Flags the transfer for cancellation on Ctrl-C so checkpoints stay valid.
fn spawn_interrupt_watcher(interrupted: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupted.store(true, Ordering::SeqCst);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_progress_callback_breaks_after_interrupt() {
        let bar = ProgressBar::hidden();
        let interrupted = AtomicBool::new(false);
        let mut callback = progress_callback(&bar, &interrupted);
        let progress = TransferProgress {
            transferred: 5,
            total: 10,
        };
        assert_eq!(callback(progress), ControlFlow::Continue(()));
        interrupted.store(true, Ordering::SeqCst);
        assert_eq!(callback(progress), ControlFlow::Break(()));
        assert_eq!(bar.position(), 5);
    }

    #[test]
    fn test_read_ticket_reports_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("ticket.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = read_ticket(&path).unwrap_err();
        assert!(format!("{err:#}").contains("ticket.json"));
    }
}
