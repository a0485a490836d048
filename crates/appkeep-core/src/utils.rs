//! Shared utility functions for AppKeep crates

use anyhow::anyhow;
use std::path::PathBuf;

/// Name of the per-user state directory under the home directory
pub const STATE_DIR_NAME: &str = ".appkeep";

/// Get the user's home directory
///
/// HOME wins over `dirs::home_dir()` so that wrappers running the CLI as a
/// different account can point it at their own state.
pub fn get_home_dir() -> anyhow::Result<PathBuf> {
    if let Ok(home) = std::env::var("HOME") {
        return Ok(PathBuf::from(home));
    }

    dirs::home_dir().ok_or_else(|| anyhow!("Could not determine home directory"))
}

/// Get the AppKeep state directory (~/.appkeep)
pub fn get_state_dir() -> anyhow::Result<PathBuf> {
    Ok(get_home_dir()?.join(STATE_DIR_NAME))
}

/// Formats bytes as a human-readable string.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}
