//! On-disk addressing of backup instances.
//!
//! Layout under the backup root:
//!
//! ```text
//! <root>/<application id>/<user>          base instance
//! <root>/<application id>/<user>_<name>   named instance
//! <root>/<application id>/.<dir>[_n]      in-progress capture (never listed)
//! ```

use appkeep_core::types::validate_application_id;
use appkeep_core::{Error, Result, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Identifies one backup instance of an application
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackupInstanceId {
    /// Owning user the instance was captured for
    pub user: UserId,

    /// `None` for the base instance
    pub name: Option<String>,
}

impl BackupInstanceId {
    /// The base instance of `user`
    pub fn base(user: UserId) -> Self {
        Self { user, name: None }
    }

    /// A named instance of `user`
    pub fn named(user: UserId, name: impl Into<String>) -> Self {
        Self {
            user,
            name: Some(name.into()),
        }
    }

    pub fn is_base(&self) -> bool {
        self.name.is_none()
    }

    /// Directory name relative to the application root
    pub fn relative_dir(&self) -> String {
        match &self.name {
            None => self.user.to_string(),
            Some(name) => format!("{}_{}", self.user, name),
        }
    }

    /// Parses a caller-supplied selector: `{user}` or `{user}_{name}`.
    ///
    /// The first underscore splits the user from the name. A selector
    /// without a numeric user prefix is rejected even if an instance with
    /// that name exists.
    pub fn parse_selector(selector: &str) -> Result<Self> {
        let (user_part, name) = match selector.split_once('_') {
            Some((user, name)) => (user, Some(name)),
            None => (selector, None),
        };

        if user_part.is_empty() || !user_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::invalid_selector(
                selector,
                "selector must start with a numeric owning user",
            ));
        }
        let user: UserId = user_part
            .parse()
            .map_err(|_| Error::invalid_selector(selector, "owning user out of range"))?;

        match name {
            None => Ok(Self::base(user)),
            Some("") => Err(Error::invalid_selector(
                selector,
                "instance name must not be empty",
            )),
            Some(name) if name.contains(['/', '\\', '\0']) => Err(Error::invalid_selector(
                selector,
                "instance name must not contain path separators",
            )),
            Some(name) => Ok(Self::named(user, name)),
        }
    }
}

impl fmt::Display for BackupInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.relative_dir())
    }
}

impl FromStr for BackupInstanceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_selector(s)
    }
}

/// Parses every selector before any I/O so a malformed one aborts the whole call.
pub fn parse_selectors(selectors: &[String]) -> Result<Vec<BackupInstanceId>> {
    selectors
        .iter()
        .map(|s| BackupInstanceId::parse_selector(s.trim()))
        .collect()
}

/// Cleans a user-supplied backup name: trims it and replaces runs of
/// characters that are unsafe in directory names with `_`.
pub fn sanitize_backup_name(name: &str) -> Result<String> {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.trim().chars() {
        let unsafe_char = matches!(c, '\\' | '/' | '?' | '"' | '<' | '>' | '|') || c.is_whitespace();
        if unsafe_char {
            if !in_run {
                out.push('_');
            }
            in_run = true;
        } else {
            out.push(c);
            in_run = false;
        }
    }
    if out.is_empty() || out.starts_with('.') {
        return Err(Error::invalid_selector(name, "backup name is empty or hidden"));
    }
    Ok(out)
}

/// Resolves and enumerates instance directories under a backup root.
#[derive(Debug, Clone)]
pub struct BackupLayout {
    root: PathBuf,
}

impl BackupLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every instance of `application_id`
    pub fn app_root(&self, application_id: &str) -> Result<PathBuf> {
        validate_application_id(application_id)?;
        Ok(self.root.join(application_id))
    }

    /// Absolute directory of an instance
    pub fn instance_dir(&self, application_id: &str, id: &BackupInstanceId) -> Result<PathBuf> {
        Ok(self.app_root(application_id)?.join(id.relative_dir()))
    }

    /// Relative directory of an instance recorded by a pre-split schema.
    ///
    /// Those records never stored their directory, so it is derived from
    /// the owning user, the instance name and the application id.
    pub fn legacy_relative_dir(user: UserId, name: Option<&str>, application_id: &str) -> String {
        let dir = match name.map(str::trim).filter(|n| !n.is_empty()) {
            None => user.to_string(),
            Some(name) => format!("{}_{}", user, name),
        };
        tracing::trace!("Legacy relative dir for {}: {}", application_id, dir);
        dir
    }

    /// Creates a fresh hidden scratch directory next to the final instance directory.
    pub fn create_temp_instance_dir(
        &self,
        application_id: &str,
        id: &BackupInstanceId,
    ) -> Result<PathBuf> {
        let app_root = self.app_root(application_id)?;
        fs::create_dir_all(&app_root)?;

        let base = format!(".{}", id.relative_dir());
        let mut candidate = base.clone();
        let mut counter = 0;
        while app_root.join(&candidate).exists() {
            counter += 1;
            candidate = format!("{}_{}", base, counter);
        }

        let path = app_root.join(candidate);
        fs::create_dir(&path)?;
        Ok(path)
    }

    /// Lists the instances of `application_id`, sorted by user then name.
    ///
    /// Hidden directories and names matching neither pattern are ignored.
    pub fn list_instances(&self, application_id: &str) -> Result<Vec<BackupInstanceId>> {
        let app_root = self.app_root(application_id)?;
        if !app_root.is_dir() {
            return Ok(Vec::new());
        }

        let mut instances = Vec::new();
        for entry in fs::read_dir(&app_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            match BackupInstanceId::parse_selector(&name) {
                Ok(id) => instances.push(id),
                Err(_) => tracing::debug!("Ignoring foreign directory {:?}", entry.path()),
            }
        }

        instances.sort();
        Ok(instances)
    }

    /// Lists application ids that have a directory under the root.
    pub fn list_applications(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }

        let mut apps = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_application_id(name).is_ok() {
                    apps.push(name.to_string());
                }
            }
        }

        apps.sort();
        Ok(apps)
    }

    /// Removes the application directory once no instance or scratch directory remains.
    pub fn remove_app_root_if_empty(&self, application_id: &str) -> Result<bool> {
        let app_root = self.app_root(application_id)?;
        if !app_root.is_dir() {
            return Ok(false);
        }
        if fs::read_dir(&app_root)?.next().is_none() {
            fs::remove_dir(&app_root)?;
            return Ok(true);
        }
        Ok(false)
    }
}
