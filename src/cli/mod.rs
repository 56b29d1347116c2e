//! CLI module
//!
//! Command-line interface for the downloader.

pub mod args;
pub mod config;
pub mod progress;

pub use args::CliArgs;
pub use config::Config;
pub use progress::{format_bytes, format_duration, ProgressDisplay};
