//! Per-application device settings captured next to the data.
//!
//! Stored as `misc.am.tsv` (plus the crypto extension), one entry per line:
//!
//! ```text
//! <name>\t<KIND>\t<value>
//! ```
//!
//! Runtime permission grants, app-op modes, network policy, battery
//! optimization exemption, hide-from-root status, notification listener
//! access and URI grants. Entries that fail to parse are skipped with a
//! warning so a payload written by a newer release still restores.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

pub const MISC_FILENAME: &str = "misc.am.tsv";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MiscKind {
    /// `value` is `true` for granted
    Permission,
    /// `name` is the op number, `value` the mode
    AppOp,
    /// `value` is the policy bitmask
    NetPolicy,
    BatteryOpt,
    MagiskHide,
    /// `name` is the listener component class
    Notification,
    /// `name` is the URI, `value` the grant mode flags
    UriGrant,
}

impl MiscKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Permission => "PERMISSION",
            Self::AppOp => "APP_OP",
            Self::NetPolicy => "NET_POLICY",
            Self::BatteryOpt => "BATTERY_OPT",
            Self::MagiskHide => "MAGISK_HIDE",
            Self::Notification => "NOTIFICATION",
            Self::UriGrant => "URI_GRANT",
        }
    }

    fn accepts(&self, value: &str) -> bool {
        match self {
            Self::Permission | Self::BatteryOpt | Self::MagiskHide | Self::Notification => {
                value.parse::<bool>().is_ok()
            }
            Self::AppOp | Self::NetPolicy | Self::UriGrant => value.parse::<i64>().is_ok(),
        }
    }
}

impl FromStr for MiscKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PERMISSION" => Ok(Self::Permission),
            "APP_OP" => Ok(Self::AppOp),
            "NET_POLICY" => Ok(Self::NetPolicy),
            "BATTERY_OPT" => Ok(Self::BatteryOpt),
            "MAGISK_HIDE" => Ok(Self::MagiskHide),
            "NOTIFICATION" => Ok(Self::Notification),
            "URI_GRANT" => Ok(Self::UriGrant),
            other => Err(format!("unknown kind {}", other)),
        }
    }
}

impl fmt::Display for MiscKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One captured setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MiscEntry {
    pub kind: MiscKind,
    pub name: String,
    pub value: String,
}

impl MiscEntry {
    pub fn new(kind: MiscKind, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn permission(name: impl Into<String>, granted: bool) -> Self {
        Self::new(MiscKind::Permission, name, granted.to_string())
    }

    fn parse_line(line: &str) -> Result<Self, String> {
        let mut fields = line.split('\t');
        let (Some(name), Some(kind), Some(value), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err("expected three tab separated fields".to_string());
        };
        let kind: MiscKind = kind.parse()?;
        if name.is_empty() {
            return Err("empty name".to_string());
        }
        if !kind.accepts(value) {
            return Err(format!("invalid value {} for {}", value, kind));
        }
        Ok(Self::new(kind, name, value))
    }
}

/// Parses a misc payload, skipping blank and malformed lines.
pub fn parse_misc(text: &str) -> Vec<MiscEntry> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(index, line)| match MiscEntry::parse_line(line.trim_end_matches('\r')) {
            Ok(entry) => Some(entry),
            Err(reason) => {
                warn!("Skipping misc line {}: {}", index + 1, reason);
                None
            }
        })
        .collect()
}

pub fn render_misc(entries: &[MiscEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{}\t{}\t{}\n", e.name, e.kind, e.value))
        .collect()
}
