//! Archive attribute bits
//!
//! The bit values are part of the archive header and of the project property
//! files, so they never change.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

bitflags! {
    /// Raw attribute bits as stored in the archive header
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct AttributeBits: u16 {
        const DELETE_WORK = 0x02;
        /// Deprecated; carried for format compatibility
        const PROTECT_ARCHIVE = 0x08;
        const PROTECT_WORKFILE = 0x10;
        const BINARY_FILE = 0x20;
        /// Deprecated; carried for format compatibility
        const JOURNAL_FILE = 0x40;
        const COMPRESSION = 0x80;
        /// Never implemented by any client
        const AUTO_MERGE = 0x100;
        /// Inverted: a set bit means "do not compute deltas"
        const COMPUTE_DELTA = 0x200;
        /// Never implemented by any client
        const LATEST_REV_ONLY = 0x400;
    }
}

/// Field order of the YES/NO property string
const PROPERTY_ORDER: [AttributeBits; 9] = [
    AttributeBits::DELETE_WORK,
    AttributeBits::PROTECT_ARCHIVE,
    AttributeBits::PROTECT_WORKFILE,
    AttributeBits::JOURNAL_FILE,
    AttributeBits::COMPRESSION,
    AttributeBits::BINARY_FILE,
    AttributeBits::AUTO_MERGE,
    AttributeBits::COMPUTE_DELTA,
    AttributeBits::LATEST_REV_ONLY,
];

const YES: &str = "YES";
const NO: &str = "NO";

/// Per-archive behavior flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchiveAttributes {
    bits: AttributeBits,
}

impl Default for ArchiveAttributes {
    fn default() -> Self {
        Self { bits: AttributeBits::COMPUTE_DELTA | AttributeBits::JOURNAL_FILE }
    }
}

impl ArchiveAttributes {
    pub fn from_bits(raw: u16) -> Self {
        Self { bits: AttributeBits::from_bits_retain(raw) }
    }

    pub fn bits(&self) -> u16 {
        self.bits.bits()
    }

    fn set(&mut self, bit: AttributeBits, flag: bool) {
        self.bits.set(bit, flag);
    }

    pub fn is_delete_work(&self) -> bool {
        self.bits.contains(AttributeBits::DELETE_WORK)
    }

    pub fn set_delete_work(&mut self, flag: bool) {
        self.set(AttributeBits::DELETE_WORK, flag);
    }

    pub fn is_protect_archive(&self) -> bool {
        self.bits.contains(AttributeBits::PROTECT_ARCHIVE)
    }

    pub fn set_protect_archive(&mut self, flag: bool) {
        self.set(AttributeBits::PROTECT_ARCHIVE, flag);
    }

    pub fn is_protect_workfile(&self) -> bool {
        self.bits.contains(AttributeBits::PROTECT_WORKFILE)
    }

    pub fn set_protect_workfile(&mut self, flag: bool) {
        self.set(AttributeBits::PROTECT_WORKFILE, flag);
    }

    pub fn is_binary_file(&self) -> bool {
        self.bits.contains(AttributeBits::BINARY_FILE)
    }

    pub fn set_binary_file(&mut self, flag: bool) {
        self.set(AttributeBits::BINARY_FILE, flag);
    }

    pub fn is_journal_file(&self) -> bool {
        self.bits.contains(AttributeBits::JOURNAL_FILE)
    }

    pub fn set_journal_file(&mut self, flag: bool) {
        self.set(AttributeBits::JOURNAL_FILE, flag);
    }

    pub fn is_compression(&self) -> bool {
        self.bits.contains(AttributeBits::COMPRESSION)
    }

    pub fn set_compression(&mut self, flag: bool) {
        self.set(AttributeBits::COMPRESSION, flag);
    }

    pub fn is_auto_merge(&self) -> bool {
        self.bits.contains(AttributeBits::AUTO_MERGE)
    }

    pub fn set_auto_merge(&mut self, flag: bool) {
        self.set(AttributeBits::AUTO_MERGE, flag);
    }

    /// Logical compute-delta flag; true when the stored bit is clear.
    pub fn is_compute_delta(&self) -> bool {
        !self.bits.contains(AttributeBits::COMPUTE_DELTA)
    }

    pub fn set_compute_delta(&mut self, flag: bool) {
        self.set(AttributeBits::COMPUTE_DELTA, !flag);
    }

    pub fn is_latest_rev_only(&self) -> bool {
        self.bits.contains(AttributeBits::LATEST_REV_ONLY)
    }

    pub fn set_latest_rev_only(&mut self, flag: bool) {
        self.set(AttributeBits::LATEST_REV_ONLY, flag);
    }

    /// Encode as nine comma-separated YES/NO tokens of the raw bit states.
    pub fn to_property_string(&self) -> String {
        PROPERTY_ORDER
            .iter()
            .map(|bit| if self.bits.contains(*bit) { YES } else { NO })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parse a property string. Missing tokens leave their bit clear; any
    /// token other than a case-insensitive `YES` counts as NO.
    pub fn from_property_string(value: &str) -> Self {
        let mut bits = AttributeBits::empty();
        for (token, bit) in value.split(',').zip(PROPERTY_ORDER.iter()) {
            if token.trim().eq_ignore_ascii_case(YES) {
                bits |= *bit;
            }
        }
        Self { bits }
    }
}

impl fmt::Display for ArchiveAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let report = [
            (self.is_delete_work(), "DELETEWORK"),
            (self.is_protect_archive(), "PROTECTARCHIVE"),
            (self.is_protect_workfile(), "PROTECTWORKFILE"),
            (self.is_binary_file(), "BINARYFILE"),
            (self.is_journal_file(), "JOURNALFILE"),
            (self.is_compression(), "COMPRESSION"),
            (self.is_auto_merge(), "AUTOMERGE"),
            (self.is_compute_delta(), "COMPUTEDELTA"),
            (self.is_latest_rev_only(), "LATESTREVONLY"),
        ];
        writeln!(f, "Attributes:")?;
        for (flag, name) in report {
            let prefix = if flag { "   " } else { "NO " };
            writeln!(f, "{}{}", prefix, name)?;
        }
        Ok(())
    }
}
