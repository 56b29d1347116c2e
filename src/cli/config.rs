//! CLI configuration module
//!
//! Turns parsed arguments into a validated run configuration.

use crate::cli::args::CliArgs;
use crate::download::DownloadConfig;
use crate::error::TorrentError;
use crate::torrent::TorrentInfo;
use std::path::PathBuf;

/// Configuration for one download run
#[derive(Debug, Clone)]
pub struct Config {
    /// Torrent information
    pub torrent_info: TorrentInfo,
    /// Download directory
    pub output_dir: PathBuf,
    /// Port reported to the tracker
    pub port: u16,
    /// Concurrent peer workers
    pub max_peers: usize,
    /// Where to write the JSON run summary
    pub summary_path: Option<PathBuf>,
    pub verbose: bool,
    pub quiet: bool,
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs, torrent_info: TorrentInfo) -> Self {
        let output_dir = args
            .output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("./downloads"));

        Self {
            torrent_info,
            output_dir,
            port: args.port,
            max_peers: args.max_peers,
            summary_path: args.summary.clone(),
            verbose: args.verbose,
            quiet: args.quiet,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), TorrentError> {
        if self.port == 0 {
            return Err(TorrentError::config_error_with_field("Port cannot be 0", "port"));
        }

        if self.max_peers == 0 {
            return Err(TorrentError::config_error_with_field(
                "max_peers must be at least 1",
                "max_peers",
            ));
        }

        if self.output_dir.as_os_str().is_empty() {
            return Err(TorrentError::config_error_with_field(
                "output_dir cannot be empty",
                "output_dir",
            ));
        }

        if self.torrent_info.announce_urls().is_empty() {
            return Err(TorrentError::config_error_with_field(
                "torrent has no tracker to announce to",
                "announce",
            ));
        }

        Ok(())
    }

    /// Orchestrator settings for this run
    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            max_peers: self.max_peers,
            port: self.port,
            ..DownloadConfig::default()
        }
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}
