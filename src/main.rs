//! torrent-leech - Main entry point
//!
//! Downloads the contents of a .torrent file from its swarm.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use torrent_leech::cli::format_bytes;
use torrent_leech::{
    CliArgs, Config, DiskWriter, DownloadSummary, Downloader, HttpTracker, PieceStore, ProgressDisplay, TorrentError,
    TorrentInfo, TorrentParser,
};
use tracing::{debug, error, info, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at an unknown location"),
        }

        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    info!("torrent-leech starting");
    debug!("CLI arguments: {:?}", args);

    let torrent_info = load_torrent_file(&args.torrent_file).context("Failed to load torrent file")?;

    let config = Config::from_args(&args, torrent_info.clone());
    config.validate().context("Invalid configuration")?;

    display_torrent_info(&torrent_info, &config);

    let progress = ProgressDisplay::new(config.is_quiet());
    let summary = match run_download(&torrent_info, &config, progress).await {
        Ok(summary) => summary,
        Err(e) => {
            error!("Download failed: {:#}", e);
            ProgressDisplay::new(config.is_quiet()).print_error(&format!("Download failed: {:#}", e))?;
            return Err(e);
        }
    };

    if let Some(path) = &config.summary_path {
        write_summary(path, &summary)?;
    }

    info!("torrent-leech finished");
    Ok(())
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }

    debug!("Logging initialized at {:?}", args.log_level());
}

/// Load and parse the torrent file
fn load_torrent_file(path: &Path) -> Result<TorrentInfo> {
    info!("Loading torrent file: {}", path.display());

    let torrent_data = std::fs::read(path)
        .map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
        })
        .context("Failed to read torrent file")?;

    debug!("Torrent file size: {} bytes", torrent_data.len());

    let info = TorrentParser::parse_bytes(&torrent_data)
        .map_err(|e| {
            error!("Failed to parse torrent file '{}': {}", path.display(), e);
            TorrentError::parse_error_with_source("Failed to parse torrent file", format!("{:#}", e))
        })
        .context("Failed to parse torrent file")?;

    info!("Successfully loaded torrent file: {}", info.name);
    Ok(info)
}

/// Display torrent information
fn display_torrent_info(torrent_info: &TorrentInfo, config: &Config) {
    if config.is_quiet() {
        return;
    }

    println!("Torrent Information:");
    println!("  Name: {}", torrent_info.name);
    println!(
        "  Size: {} ({})",
        torrent_info.total_size(),
        format_bytes(torrent_info.total_size())
    );
    println!("  Files: {}", torrent_info.file_entries().len());
    println!("  Pieces: {}", torrent_info.piece_count());
    println!("  Piece length: {}", format_bytes(torrent_info.piece_length));
    println!("  Info hash: {}", torrent_info.info_hash_hex());
    println!();
    println!("Configuration:");
    println!("  Output directory: {}", config.output_dir.display());
    println!("  Port: {}", config.port);
    println!("  Max peers: {}", config.max_peers);
    println!("  Trackers: {}", torrent_info.announce_urls().len());
    println!();
}

/// Set up storage and the tracker, then download until done or interrupted
async fn run_download(
    torrent_info: &TorrentInfo,
    config: &Config,
    mut progress: ProgressDisplay,
) -> Result<DownloadSummary> {
    let disk = DiskWriter::from_torrent(&config.output_dir, torrent_info)
        .await
        .map_err(TorrentError::from)
        .context("Failed to prepare output files")?;
    let store = PieceStore::from_torrent(torrent_info);

    let found = disk
        .verify_existing(&store)
        .await
        .map_err(TorrentError::from)
        .context("Failed to check existing data")?;
    if found > 0 {
        progress.print_status(&format!(
            "Resuming: {}/{} pieces already on disk",
            found,
            store.piece_count()
        ))?;
    }

    let tracker = HttpTracker::new(torrent_info.announce_urls())
        .map_err(TorrentError::from)
        .context("No usable tracker")?;

    let downloader = Arc::new(Downloader::new(
        torrent_info.info_hash,
        Arc::new(store),
        Arc::new(disk),
        Arc::new(tracker),
        config.download_config(),
    ));

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupted, shutting down");
                interrupt.cancel();
            }
            Err(e) => error!("Failed to listen for ctrl-c: {}", e),
        }
    });

    let run = {
        let downloader = downloader.clone();
        tokio::spawn(async move { downloader.run(cancel).await })
    };

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    tokio::pin!(run);
    let summary = loop {
        tokio::select! {
            joined = &mut run => break joined.context("Download task panicked")??,
            _ = ticker.tick() => progress.update(&downloader.progress())?,
        }
    };

    progress.print_summary(&summary, torrent_info.total_size())?;
    if !summary.completed {
        progress.print_status("Download interrupted; run again to resume")?;
    }
    Ok(summary)
}

/// Write the run summary as JSON
fn write_summary(path: &Path, summary: &DownloadSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary).context("Failed to serialize summary")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write summary to {}", path.display()))?;
    info!("Wrote summary to {}", path.display());
    Ok(())
}
