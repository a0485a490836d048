//! Console rendering for command banners, run settings and instance outcomes.
//!
//! Outcome lines go to stdout for successes and stderr for failures so a
//! script can capture the instances that made it through.

use console::{style, StyledObject};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Title printed before a command starts touching the backup root.
pub fn banner(title: &str) {
    println!("\n{}", style(title).bold().underlined());
}

/// The settings a command is about to run with, printed as an aligned block.
#[derive(Debug, Default)]
pub struct Settings {
    rows: Vec<(&'static str, String)>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row(mut self, label: &'static str, value: impl ToString) -> Self {
        self.rows.push((label, value.to_string()));
        self
    }

    /// Adds a row only when a value is present.
    pub fn optional_row(self, label: &'static str, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.row(label, value),
            None => self,
        }
    }

    fn render(&self) -> Vec<String> {
        let width = self.rows.iter().map(|(label, _)| label.len()).max().unwrap_or(0);
        self.rows
            .iter()
            .map(|(label, value)| format!("  {:<width$}  {}", label, value, width = width))
            .collect()
    }

    pub fn print(&self) {
        for line in self.render() {
            println!("{}", style(line).dim());
        }
        println!();
    }
}

fn marker(ok: bool) -> StyledObject<&'static str> {
    if ok {
        style("✓").green().bold()
    } else {
        style("✗").red().bold()
    }
}

/// One instance that completed.
pub fn instance_done(instance: &str, detail: &str) {
    println!("{} {} {}", marker(true), style(instance).cyan(), detail);
}

/// One instance that failed, with the error kind used for scripting.
pub fn instance_failed(instance: &str, error: &str, kind: &str) {
    eprintln!(
        "{} {} {} {}",
        marker(false),
        style(instance).cyan(),
        error,
        style(format!("[{}]", kind)).dim()
    );
}

/// Command-level result that is not tied to an instance.
pub fn done(msg: &str) {
    println!("{} {}", marker(true), msg);
}

pub fn caution(msg: &str) {
    eprintln!("{} {}", style("!").yellow().bold(), msg);
}

pub fn note(msg: &str) {
    println!("  {}", style(msg).italic());
}

/// Spinner for a scan of the backup root, cleared when dropped by the caller.
pub fn scanning(root: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    if let Ok(template) = ProgressStyle::with_template("{spinner:.cyan} {msg} ({elapsed})") {
        bar.set_style(template);
    }
    bar.set_message(format!("Scanning {}", root));
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_align_labels() {
        let lines = Settings::new()
            .row("Application", "com.example.notes@0")
            .row("Crypto", "ecc")
            .optional_row("Target user", None::<u32>)
            .render();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "  Application  com.example.notes@0");
        assert_eq!(lines[1], "  Crypto       ecc");
    }
}
