//! Identity types shared across AppKeep crates

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Owning user id (an OS-level multi-tenant partition)
pub type UserId = u32;

/// The subject of a backup: one application under one owning user
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApplicationRef {
    /// Stable application identifier, unique per owning user
    pub application_id: String,

    /// Owning user the application belongs to
    pub user: UserId,
}

impl ApplicationRef {
    /// Creates a reference after checking the identifier is usable as a directory name.
    pub fn new(application_id: impl Into<String>, user: UserId) -> Result<Self> {
        let application_id = application_id.into();
        validate_application_id(&application_id)?;
        Ok(Self {
            application_id,
            user,
        })
    }
}

impl fmt::Display for ApplicationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.application_id, self.user)
    }
}

/// Rejects identifiers that cannot name a directory under the backup root.
pub fn validate_application_id(application_id: &str) -> Result<()> {
    if application_id.trim().is_empty() {
        return Err(Error::invalid_selector(
            application_id,
            "application id must not be empty",
        ));
    }
    if application_id.starts_with('.') {
        return Err(Error::invalid_selector(
            application_id,
            "application id must not start with '.'",
        ));
    }
    if application_id.contains(['/', '\\']) || application_id.contains('\0') {
        return Err(Error::invalid_selector(
            application_id,
            "application id must not contain path separators",
        ));
    }
    Ok(())
}
