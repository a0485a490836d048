//! Restore-time rewriting of recorded data-directory paths.
//!
//! Pure string manipulation, no filesystem access.

use crate::classifier::{is_shared_storage, parse_internal};
use appkeep_core::{Error, Result, UserId};

/// Rewrites `path`, recorded for owning user `source`, into the path to write for `target`.
///
/// Internal paths are normalized to the canonical `/data/user{,_de}/{u}/...`
/// spelling. Shared-storage paths only support `source == target`.
pub fn remap(path: &str, source: UserId, target: UserId) -> Result<String> {
    if let Some(internal) = parse_internal(path) {
        let user = if internal.user == source {
            target
        } else {
            internal.user
        };
        return Ok(internal.canonical_for(user));
    }

    if is_shared_storage(path) {
        if source == target {
            return Ok(path.to_string());
        }
        return Err(Error::not_implemented(format!(
            "remapping shared storage path {} from user {} to user {}",
            path, source, target
        )));
    }

    if source == target {
        return Ok(path.to_string());
    }
    Ok(replace_once(
        path,
        &format!("/{}/", source),
        &format!("/{}/", target),
    ))
}

fn replace_once(haystack: &str, from: &str, to: &str) -> String {
    match haystack.find(from) {
        Some(index) => {
            let mut out = String::with_capacity(haystack.len() + to.len());
            out.push_str(&haystack[..index]);
            out.push_str(to);
            out.push_str(&haystack[index + from.len()..]);
            out
        }
        None => haystack.to_string(),
    }
}

/// Rewrites the `user_{n}` segment of a keystore entry path.
pub fn remap_keystore(path: &str, source: UserId, target: UserId) -> String {
    if source == target {
        return path.to_string();
    }
    replace_once(
        path,
        &format!("/user_{}/", source),
        &format!("/user_{}/", target),
    )
}
