//! Syntactic classification of application data directories.
//!
//! Classification never touches the filesystem: it only looks at path
//! segments, so restore planning can run before any I/O happens.

use crate::flags::SelectionFlags;
use appkeep_core::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Semantic class of a captured data directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryClass {
    /// Per-user credential-encrypted internal storage
    InternalCredentialProtected,
    /// Per-user device-encrypted internal storage
    InternalDeviceProtected,
    /// `Android/data` tree on shared storage
    ExternalAppPrivate,
    /// `Android/obb` tree on shared storage
    ExternalObb,
    /// `Android/media` tree on shared storage
    ExternalMedia,
    /// Anything else on shared storage
    ExternalUnclassified,
    /// Unrecognized location, or internal storage keyed to another user
    Custom,
}

impl DirectoryClass {
    /// Stable short name used in listings
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InternalCredentialProtected => "internal-ce",
            Self::InternalDeviceProtected => "internal-de",
            Self::ExternalAppPrivate => "external-data",
            Self::ExternalObb => "external-obb",
            Self::ExternalMedia => "external-media",
            Self::ExternalUnclassified => "external-other",
            Self::Custom => "custom",
        }
    }

    /// True for classes living on shared storage
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            Self::ExternalAppPrivate
                | Self::ExternalObb
                | Self::ExternalMedia
                | Self::ExternalUnclassified
        )
    }

    /// Selection bit that has to be set for this class to be captured or restored
    pub fn selection_flag(&self) -> SelectionFlags {
        match self {
            Self::InternalCredentialProtected | Self::InternalDeviceProtected | Self::Custom => {
                SelectionFlags::INTERNAL_DATA
            }
            Self::ExternalAppPrivate | Self::ExternalUnclassified => SelectionFlags::EXTERNAL_DATA,
            Self::ExternalObb | Self::ExternalMedia => SelectionFlags::EXTERNAL_OBB_MEDIA,
        }
    }
}

impl fmt::Display for DirectoryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of classifying one path for one owning user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub class: DirectoryClass,
    pub directly_reachable: bool,
}

/// Which internal root a path sits under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InternalRoot {
    Credential,
    Device,
}

/// An internal path split into its root, embedded user and remainder
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InternalPath {
    pub root: InternalRoot,
    pub user: UserId,
    /// Segments after the user segment, joined with '/'
    pub rest: String,
}

impl InternalPath {
    /// Canonical spelling for `user`
    pub fn canonical_for(&self, user: UserId) -> String {
        let base = match self.root {
            InternalRoot::Credential => "/data/user",
            InternalRoot::Device => "/data/user_de",
        };
        if self.rest.is_empty() {
            format!("{}/{}", base, user)
        } else {
            format!("{}/{}/{}", base, user, self.rest)
        }
    }
}

/// Splits a path into non-empty segments.
pub(crate) fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty() && *s != ".").collect()
}

fn join_rest(rest: &[&str]) -> String {
    rest.join("/")
}

/// Recognizes the canonical and legacy spellings of internal per-user storage.
///
/// Accepted spellings:
/// - `/data/user/{u}/...` and `/data/user_de/{u}/...` (canonical)
/// - `/data/data/...` (pre multi-user, implicitly user 0)
/// - `/data_mirror/data_ce/null/{u}/...` and `/data_mirror/data_de/null/{u}/...`
pub(crate) fn parse_internal(path: &str) -> Option<InternalPath> {
    if !path.starts_with('/') {
        return None;
    }
    let segs = segments(path);
    match segs.as_slice() {
        ["data", "user", user, rest @ ..] => Some(InternalPath {
            root: InternalRoot::Credential,
            user: user.parse().ok()?,
            rest: join_rest(rest),
        }),
        ["data", "user_de", user, rest @ ..] => Some(InternalPath {
            root: InternalRoot::Device,
            user: user.parse().ok()?,
            rest: join_rest(rest),
        }),
        ["data", "data", rest @ ..] => Some(InternalPath {
            root: InternalRoot::Credential,
            user: 0,
            rest: join_rest(rest),
        }),
        ["data_mirror", "data_ce", "null", user, rest @ ..] => Some(InternalPath {
            root: InternalRoot::Credential,
            user: user.parse().ok()?,
            rest: join_rest(rest),
        }),
        ["data_mirror", "data_de", "null", user, rest @ ..] => Some(InternalPath {
            root: InternalRoot::Device,
            user: user.parse().ok()?,
            rest: join_rest(rest),
        }),
        _ => None,
    }
}

/// True when the path is rooted at shared (external) storage.
pub(crate) fn is_shared_storage(path: &str) -> bool {
    let segs = segments(path);
    if !path.starts_with('/') {
        return false;
    }
    matches!(
        segs.as_slice(),
        ["storage", ..] | ["sdcard", ..] | ["mnt", "sdcard", ..]
    )
}

fn external_class(path: &str) -> DirectoryClass {
    let segs = segments(path);
    for pair in segs.windows(2) {
        if pair[0] == "Android" {
            match pair[1] {
                "data" => return DirectoryClass::ExternalAppPrivate,
                "obb" => return DirectoryClass::ExternalObb,
                "media" => return DirectoryClass::ExternalMedia,
                _ => {}
            }
        }
    }
    DirectoryClass::ExternalUnclassified
}

/// Classifies `path` for owning user `user`.
///
/// Internal storage keyed to another user is `Custom` but still reachable;
/// shared storage is never directly reachable.
pub fn classify(path: &str, user: UserId) -> Classification {
    if let Some(internal) = parse_internal(path) {
        if internal.user == user {
            let class = match internal.root {
                InternalRoot::Credential => DirectoryClass::InternalCredentialProtected,
                InternalRoot::Device => DirectoryClass::InternalDeviceProtected,
            };
            return Classification {
                class,
                directly_reachable: true,
            };
        }
        return Classification {
            class: DirectoryClass::Custom,
            directly_reachable: true,
        };
    }

    if is_shared_storage(path) {
        return Classification {
            class: external_class(path),
            directly_reachable: false,
        };
    }

    Classification {
        class: DirectoryClass::Custom,
        directly_reachable: path.starts_with('/'),
    }
}
