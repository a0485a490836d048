//! File filtering for data-directory capture and restore.

use appkeep_core::{Error, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

/// Cache subtrees at the top of a data directory, regenerated by the application.
pub const CACHE_DIRS: &[&str] = &["cache", "code_cache"];

/// Exclusion configuration for one data directory.
#[derive(Debug, Clone)]
pub struct ExclusionConfig {
    globset: GlobSet,
}

impl ExclusionConfig {
    /// Builds the exclusion set. Cache subtrees are added when `exclude_cache` is set.
    pub fn new(exclude_cache: bool, additional_patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();

        let mut patterns: Vec<String> = Vec::new();
        if exclude_cache {
            for dir in CACHE_DIRS {
                patterns.push(dir.to_string());
                patterns.push(format!("{}/**", dir));
            }
        }
        patterns.extend(additional_patterns.iter().cloned());

        for pattern in &patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                Error::invalid_config(format!("Invalid exclusion pattern '{}': {}", pattern, e))
            })?;
            builder.add(glob);
        }

        let globset = builder.build().map_err(|e| {
            Error::invalid_config(format!("Failed to build exclusion globset: {}", e))
        })?;

        Ok(Self { globset })
    }

    /// Checks if a path relative to the data directory should be skipped.
    pub fn should_exclude(&self, relative: &Path) -> bool {
        self.globset.is_match(relative)
    }
}
