//! Progress reporting for engine operations.
//!
//! Provides visual feedback while instances are captured, restored or verified.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn bar_style(color: &str, unit: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(&format!(
            "{{msg}} [{{bar:40.{}/blue}}] {{pos}}/{{len}} {} ({{percent}}%)",
            color, unit
        ))
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// Progress reporter for backups.
#[derive(Debug, Clone)]
pub struct BackupProgress {
    multi: Arc<MultiProgress>,
    instance_bar: Option<ProgressBar>,
    archive_bar: Option<ProgressBar>,
}

impl BackupProgress {
    pub fn new() -> Self {
        Self {
            multi: Arc::new(MultiProgress::new()),
            instance_bar: None,
            archive_bar: None,
        }
    }

    /// Starts the spinner for one instance.
    pub fn start_instance(&mut self, message: &str) {
        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(spinner_style());
        bar.set_message(message.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        self.instance_bar = Some(bar);
    }

    /// Starts the archive phase with a known archive count.
    pub fn start_archives(&mut self, total: u64, message: &str) {
        let bar = self.multi.add(ProgressBar::new(total));
        bar.set_style(bar_style("cyan", "archives"));
        bar.set_message(message.to_string());
        self.archive_bar = Some(bar);
    }

    /// Marks one archive packed.
    pub fn inc_archive(&self, name: &str) {
        if let Some(bar) = &self.archive_bar {
            bar.set_message(name.to_string());
            bar.inc(1);
        }
    }

    /// Finishes the current instance.
    pub fn finish_instance(&mut self, message: &str) {
        if let Some(bar) = self.archive_bar.take() {
            bar.finish_and_clear();
        }
        if let Some(bar) = self.instance_bar.take() {
            bar.finish_with_message(message.to_string());
        }
    }

    /// Finishes all progress bars.
    pub fn finish_all(&self) {
        if let Some(bar) = &self.instance_bar {
            bar.finish_and_clear();
        }
        if let Some(bar) = &self.archive_bar {
            bar.finish_and_clear();
        }
    }
}

impl Default for BackupProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress reporter for restores and verification.
#[derive(Debug, Clone)]
pub struct RestoreProgress {
    multi: Arc<MultiProgress>,
    extract_bar: Option<ProgressBar>,
}

impl RestoreProgress {
    pub fn new() -> Self {
        Self {
            multi: Arc::new(MultiProgress::new()),
            extract_bar: None,
        }
    }

    /// Starts the extraction phase with a known archive count.
    pub fn start_extract(&mut self, total: u64, message: &str) {
        let bar = self.multi.add(ProgressBar::new(total));
        bar.set_style(bar_style("green", "archives"));
        bar.set_message(message.to_string());
        self.extract_bar = Some(bar);
    }

    /// Marks one archive processed.
    pub fn inc_extract(&self, name: &str) {
        if let Some(bar) = &self.extract_bar {
            bar.set_message(name.to_string());
            bar.inc(1);
        }
    }

    /// Finishes the extraction phase.
    pub fn finish_extract(&mut self, message: &str) {
        if let Some(bar) = self.extract_bar.take() {
            bar.finish_with_message(message.to_string());
        }
    }
}

impl Default for RestoreProgress {
    fn default() -> Self {
        Self::new()
    }
}
