//! Progress display module
//!
//! A single refreshing status line plus the end-of-run report.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::download::{DownloadSummary, Progress};

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed to human readable string
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

/// Format duration to human readable string
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Time left at `speed`, if there is a speed and anything left
pub fn calculate_eta(bytes_left: u64, speed: f64) -> Option<Duration> {
    if speed <= 0.0 || bytes_left == 0 {
        return None;
    }
    Some(Duration::from_secs_f64(bytes_left as f64 / speed))
}

/// Progress display for CLI
pub struct ProgressDisplay {
    start_time: Instant,
    last_update: Option<Instant>,
    update_interval: Duration,
    /// Quiet mode (no progress output)
    quiet: bool,
    /// Download counter at the previous refresh, for the speed estimate
    last_downloaded: u64,
    speed: f64,
}

impl ProgressDisplay {
    pub fn new(quiet: bool) -> Self {
        Self::with_interval(quiet, Duration::from_millis(500))
    }

    pub fn with_interval(quiet: bool, interval: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            last_update: None,
            update_interval: interval,
            quiet,
            last_downloaded: 0,
            speed: 0.0,
        }
    }

    /// Redraw the status line if the refresh interval has passed
    pub fn update(&mut self, progress: &Progress) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        let now = Instant::now();
        if let Some(last) = self.last_update {
            let elapsed = now.duration_since(last);
            if elapsed < self.update_interval {
                return Ok(());
            }
            let delta = progress.downloaded_bytes.saturating_sub(self.last_downloaded);
            self.speed = delta as f64 / elapsed.as_secs_f64();
        }
        self.last_update = Some(now);
        self.last_downloaded = progress.downloaded_bytes;

        let mut stdout = io::stdout().lock();
        write!(stdout, "\r\x1b[2K{}", self.status_line(progress))?;
        stdout.flush()
    }

    /// One-line rendering of `progress`
    pub fn status_line(&self, progress: &Progress) -> String {
        let percent = progress.fraction() * 100.0;

        let bar_width: usize = 30;
        let filled = ((progress.fraction() * bar_width as f64) as usize).min(bar_width);
        let bar = "=".repeat(filled) + &" ".repeat(bar_width - filled);

        let eta = calculate_eta(progress.bytes_left, self.speed)
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());

        format!(
            "[{}] {:.1}% | {}/{} pieces | {} / {} | {} | Peers: {} | ETA: {}",
            bar,
            percent,
            progress.verified_pieces,
            progress.total_pieces,
            format_bytes(progress.total_bytes - progress.bytes_left.min(progress.total_bytes)),
            format_bytes(progress.total_bytes),
            format_speed(self.speed),
            progress.active_peers,
            eta,
        )
    }

    /// Print the end-of-run report
    pub fn print_summary(&self, summary: &DownloadSummary, total: u64) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        let mut stdout = io::stdout().lock();
        writeln!(stdout, "\r\x1b[2K")?;
        if summary.completed {
            writeln!(stdout, "Download Complete!")?;
        } else {
            writeln!(stdout, "Download stopped")?;
        }
        writeln!(
            stdout,
            "  Pieces: {} / {}",
            summary.verified_pieces, summary.total_pieces
        )?;
        writeln!(
            stdout,
            "  Fetched: {} (of {})",
            format_bytes(summary.downloaded_bytes),
            format_bytes(total)
        )?;
        writeln!(
            stdout,
            "  Elapsed Time: {}",
            format_duration(Duration::from_secs_f64(summary.elapsed_secs))
        )?;
        Ok(())
    }

    /// Print a status message
    pub fn print_status(&self, message: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        println!("\r\x1b[2K{}", message);
        Ok(())
    }

    /// Errors are printed even in quiet mode
    pub fn print_error(&self, message: &str) -> io::Result<()> {
        eprintln!("\r\x1b[2KError: {}", message);
        Ok(())
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(verified: usize, bytes_left: u64) -> Progress {
        Progress {
            verified_pieces: verified,
            total_pieces: 4,
            downloaded_bytes: 4096 - bytes_left,
            bytes_left,
            total_bytes: 4096,
            active_peers: 2,
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(1024.0), "1.00 KB/s");
        assert_eq!(format_speed(1024.0 * 1024.0), "1.00 MB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_calculate_eta() {
        assert_eq!(calculate_eta(50, 10.0), Some(Duration::from_secs(5)));
        assert_eq!(calculate_eta(0, 10.0), None);
        assert_eq!(calculate_eta(50, 0.0), None);
    }

    #[test]
    fn test_status_line() {
        let display = ProgressDisplay::new(false);
        let line = display.status_line(&progress(2, 2048));

        assert!(line.contains("50.0%"));
        assert!(line.contains("2/4 pieces"));
        assert!(line.contains("2.00 KB / 4.00 KB"));
        assert!(line.contains("Peers: 2"));
        assert!(line.ends_with("ETA: -"));
    }

    #[test]
    fn test_progress_display_quiet() {
        let mut display = ProgressDisplay::new(true);
        assert!(display.is_quiet());
        display.update(&progress(1, 3072)).unwrap();
        assert!(display.last_update.is_none());
    }
}
