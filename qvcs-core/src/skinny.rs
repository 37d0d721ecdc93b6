//! Compact archive summary used for listings and notifications

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attributes::ArchiveAttributes;

/// What a client needs to know about an archive without its history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkinnyLogfileInfo {
    pub short_workfile_name: String,
    pub file_id: i32,
    /// Branch this projection was produced for
    pub branch_id: i32,
    pub attributes: ArchiveAttributes,
    pub default_revision: String,
    /// Hex SHA-256 of the default revision's bytes
    pub default_revision_digest: String,
    pub last_check_in: Option<DateTime<Utc>>,
    pub last_edit_by: String,
    pub revision_count: usize,
    pub lock_count: usize,
    /// user -> revision string the user holds locked
    pub locked_revisions: BTreeMap<String, String>,
    pub overlap: bool,
}

impl SkinnyLogfileInfo {
    pub fn new(short_workfile_name: &str, file_id: i32, branch_id: i32) -> Self {
        Self {
            short_workfile_name: short_workfile_name.to_string(),
            file_id,
            branch_id,
            attributes: ArchiveAttributes::default(),
            default_revision: String::new(),
            default_revision_digest: String::new(),
            last_check_in: None,
            last_edit_by: String::new(),
            revision_count: 0,
            lock_count: 0,
            locked_revisions: BTreeMap::new(),
            overlap: false,
        }
    }

    pub fn locked_revision(&self, user: &str) -> Option<&str> {
        self.locked_revisions.get(user).map(String::as_str)
    }

    /// Comma-separated lockers, in user order
    pub fn locked_by(&self) -> String {
        self.locked_revisions.keys().cloned().collect::<Vec<_>>().join(",")
    }
}
