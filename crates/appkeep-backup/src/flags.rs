//! Selection bitmask controlling what a backup captures and what a restore applies.
//!
//! Bit positions are part of the stored format: `Info.flags` keeps the raw
//! integer, and bits this engine does not know are carried along untouched.

use bitflags::bitflags;
use std::fmt;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SelectionFlags: u32 {
        /// Application binaries (base and split packages)
        const BINARIES = 1 << 0;
        /// Internal credential- and device-protected data, plus keystore entries
        const INTERNAL_DATA = 1 << 1;
        /// App-private tree on shared storage
        const EXTERNAL_DATA = 1 << 2;
        /// Skip cache subtrees of every data directory
        const EXCLUDE_CACHE = 1 << 3;
        /// Access-rules payload
        const RULES = 1 << 4;
        /// Skip signature comparison when reinstalling binaries
        const NO_SIGNATURE_CHECK = 1 << 5;
        /// Only `*.apk` files of the binary directory
        const BINARIES_APK_ONLY = 1 << 6;
        /// Expansion-file and media trees on shared storage
        const EXTERNAL_OBB_MEDIA = 1 << 7;
        /// Caller picked target users explicitly
        const CUSTOM_USERS = 1 << 8;
        /// Allow multiple named instances for this application
        const MULTIPLE = 1 << 9;
        /// Extra payloads (icon and similar)
        const EXTRAS = 1 << 10;
    }
}

impl SelectionFlags {
    /// Flags assumed for legacy records that predate the stored bitmask
    pub const LEGACY_DEFAULT: Self = Self::BINARIES
        .union(Self::INTERNAL_DATA)
        .union(Self::EXTERNAL_DATA)
        .union(Self::EXCLUDE_CACHE)
        .union(Self::RULES);

    /// Builds flags from a stored integer, keeping unknown bits.
    pub fn from_stored(bits: u32) -> Self {
        Self::from_bits_retain(bits)
    }

    /// True when nothing restorable is selected
    pub fn selects_nothing(&self) -> bool {
        !self.intersects(
            Self::BINARIES
                | Self::INTERNAL_DATA
                | Self::EXTERNAL_DATA
                | Self::EXTERNAL_OBB_MEDIA
                | Self::RULES,
        )
    }

    /// Known flag names in kebab case, in bit order.
    ///
    /// Unknown bits are not named.
    pub fn describe(&self) -> Vec<String> {
        self.iter_names()
            .map(|(name, _)| name.to_ascii_lowercase().replace('_', "-"))
            .collect()
    }

    /// Parses a kebab-case flag name as printed by [`SelectionFlags::describe`].
    pub fn from_cli_name(name: &str) -> Option<Self> {
        Self::from_name(&name.trim().to_ascii_uppercase().replace('-', "_"))
    }
}

impl fmt::Display for SelectionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.describe();
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join(","))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_positions() {
        assert_eq!(SelectionFlags::BINARIES.bits(), 1);
        assert_eq!(SelectionFlags::INTERNAL_DATA.bits(), 2);
        assert_eq!(SelectionFlags::EXCLUDE_CACHE.bits(), 8);
        assert_eq!(SelectionFlags::MULTIPLE.bits(), 512);
        assert_eq!(SelectionFlags::EXTRAS.bits(), 1024);
    }

    #[test]
    fn test_unknown_bits_retained() {
        let flags = SelectionFlags::from_stored(1110 | (1 << 20));
        assert!(flags.contains(SelectionFlags::INTERNAL_DATA));
        assert!(flags.contains(SelectionFlags::EXTRAS));
        assert_eq!(flags.bits() & (1 << 20), 1 << 20);
    }

    #[test]
    fn test_display_names() {
        let flags = SelectionFlags::BINARIES | SelectionFlags::INTERNAL_DATA;
        assert_eq!(flags.to_string(), "binaries,internal-data");
        assert_eq!(SelectionFlags::empty().to_string(), "none");
    }

    #[test]
    fn test_cli_names_round_trip_describe() {
        let flags = SelectionFlags::from_stored(0b111_1111_1111);
        for name in flags.describe() {
            assert!(SelectionFlags::from_cli_name(&name).is_some(), "{}", name);
        }
        assert_eq!(
            SelectionFlags::from_cli_name("binaries-apk-only"),
            Some(SelectionFlags::BINARIES_APK_ONLY)
        );
        assert!(SelectionFlags::from_cli_name("everything").is_none());
    }

    #[test]
    fn test_selects_nothing() {
        assert!(SelectionFlags::EXCLUDE_CACHE.selects_nothing());
        assert!(!SelectionFlags::RULES.selects_nothing());
    }
}
