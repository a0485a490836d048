//! `checksums.txt`: one `<hex checksum>\t<file name>` line per stored file.

use appkeep_core::{Error, Result};
use std::collections::BTreeMap;

/// Parses checksum lines into file name -> checksum.
pub fn parse(content: &str, source: &str) -> Result<BTreeMap<String, String>> {
    let mut checksums = BTreeMap::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let Some((checksum, file)) = line.split_once('\t') else {
            return Err(Error::metadata_corrupt(
                source,
                format!("malformed checksum line {}", number + 1),
            ));
        };
        if checksum.is_empty() || file.is_empty() {
            return Err(Error::metadata_corrupt(
                source,
                format!("empty field on checksum line {}", number + 1),
            ));
        }
        checksums.insert(file.to_string(), checksum.to_string());
    }
    Ok(checksums)
}

/// Formats a checksum map as `checksums.txt` content.
pub fn format(checksums: &BTreeMap<String, String>) -> String {
    checksums
        .iter()
        .map(|(file, checksum)| format!("{}\t{}\n", checksum, file))
        .collect()
}
