//! Error types for appkeep-core

use thiserror::Error;

/// Result type alias using appkeep-core's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by the backup engine and its front ends
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or unqualified caller input (never retried)
    #[error("Invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    /// Unreadable or schema-inconsistent metadata record
    #[error("Metadata record is corrupt ({path}): {message}")]
    MetadataCorrupt { path: String, message: String },

    /// Stored content does not match its recorded checksum
    #[error("Checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    /// Crypto-mode tag not understood by this engine
    #[error("Unsupported crypto mode: {mode}")]
    UnsupportedCryptoMode { mode: String },

    /// Archive-format tag not understood by this engine
    #[error("Unsupported archive format: {format}")]
    UnsupportedArchiveFormat { format: String },

    /// An archive entry could not be produced during backup
    #[error("Failed to capture {entry}: {message}")]
    PartialCaptureFailure { entry: String, message: String },

    /// Declared payloads and stored files disagree
    #[error("Integrity violation in {instance}: {message}")]
    IntegrityViolation { instance: String, message: String },

    /// Behavior deliberately left unimplemented
    #[error("Not implemented: {what}")]
    NotImplemented { what: String },

    /// Well-formed selector with no backup behind it
    #[error("Backup instance not found: {instance}")]
    InstanceNotFound { instance: String },

    /// Operation stopped through its cancel flag
    #[error("Operation cancelled")]
    Cancelled,

    /// Encrypted instance without usable key material
    #[error("No key available for crypto mode {mode}: {message}")]
    KeyUnavailable { mode: String, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Failure reported by an external collaborator (package manager, installer)
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: String,
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlParse(#[from] serde_yaml_ng::Error),
}

impl Error {
    /// Create an invalid selector error
    pub fn invalid_selector(selector: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSelector {
            selector: selector.into(),
            reason: reason.into(),
        }
    }

    /// Create a metadata corrupt error
    pub fn metadata_corrupt(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MetadataCorrupt {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a checksum mismatch error
    pub fn checksum_mismatch(
        file: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::ChecksumMismatch {
            file: file.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create an unsupported crypto mode error
    pub fn unsupported_crypto_mode(mode: impl Into<String>) -> Self {
        Self::UnsupportedCryptoMode { mode: mode.into() }
    }

    /// Create an unsupported archive format error
    pub fn unsupported_archive_format(format: impl Into<String>) -> Self {
        Self::UnsupportedArchiveFormat {
            format: format.into(),
        }
    }

    /// Create a partial capture failure
    pub fn partial_capture(entry: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PartialCaptureFailure {
            entry: entry.into(),
            message: message.into(),
        }
    }

    /// Create an integrity violation error
    pub fn integrity_violation(instance: impl Into<String>, message: impl Into<String>) -> Self {
        Self::IntegrityViolation {
            instance: instance.into(),
            message: message.into(),
        }
    }

    /// Create a not implemented error
    pub fn not_implemented(what: impl Into<String>) -> Self {
        Self::NotImplemented { what: what.into() }
    }

    /// Create an instance not found error
    pub fn instance_not_found(instance: impl Into<String>) -> Self {
        Self::InstanceNotFound {
            instance: instance.into(),
        }
    }

    /// Create a key unavailable error
    pub fn key_unavailable(mode: impl Into<String>, message: impl Into<String>) -> Self {
        Self::KeyUnavailable {
            mode: mode.into(),
            message: message.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a collaborator failure
    pub fn collaborator(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }

    /// Short machine-friendly name of the error class, used in reports
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSelector { .. } => "invalid-selector",
            Self::MetadataCorrupt { .. } => "metadata-corrupt",
            Self::ChecksumMismatch { .. } => "checksum-mismatch",
            Self::UnsupportedCryptoMode { .. } => "unsupported-crypto-mode",
            Self::UnsupportedArchiveFormat { .. } => "unsupported-archive-format",
            Self::PartialCaptureFailure { .. } => "partial-capture-failure",
            Self::IntegrityViolation { .. } => "integrity-violation",
            Self::NotImplemented { .. } => "not-implemented",
            Self::InstanceNotFound { .. } => "instance-not-found",
            Self::Cancelled => "cancelled",
            Self::KeyUnavailable { .. } => "key-unavailable",
            Self::InvalidConfig { .. } => "invalid-config",
            Self::Collaborator { .. } => "collaborator",
            Self::Io(_) => "io",
            Self::JsonParse(_) => "json",
            Self::YamlParse(_) => "yaml",
        }
    }
}
