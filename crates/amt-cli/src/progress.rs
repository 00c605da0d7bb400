//! Receive progress display.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner showing how much of a stream has arrived
pub struct StreamProgress {
    bar: ProgressBar,
}

impl StreamProgress {
    /// Create a spinner for `stream`; hidden when `visible` is false
    #[must_use]
    pub fn new(stream: &str, visible: bool) -> Self {
        let bar = if visible {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::hidden()
        };

        let style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg} {bytes} ({bytes_per_sec})")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        bar.set_style(style);
        bar.set_message(format!("{stream} native"));
        bar.enable_steady_tick(Duration::from_millis(120));

        Self { bar }
    }

    /// Record `bytes` more received
    pub fn inc(&self, bytes: u64) {
        self.bar.inc(bytes);
    }

    /// Set the status message
    pub fn set_message(&self, msg: String) {
        self.bar.set_message(msg);
    }

    /// Finish with a message
    pub fn finish_with_message(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }
}

/// Format bytes in human-readable format
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

/// Format duration in human-readable format
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
