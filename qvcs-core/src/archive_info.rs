//! The view of an archive shared by server archives and client proxies

use chrono::{DateTime, Utc};

use crate::attributes::ArchiveAttributes;
use crate::skinny::SkinnyLogfileInfo;

/// Read-only archive state consumed by the directory merge.
///
/// Implemented by [`crate::logfile::LogFile`] on the server, where the answer
/// comes from the archive on disk, and by [`crate::proxy::LogFileProxy`] on
/// the client, where it comes from the last skinny info pushed by the server.
pub trait ArchiveInfo: Send + Sync {
    fn short_workfile_name(&self) -> String;

    fn file_id(&self) -> i32;

    fn attributes(&self) -> ArchiveAttributes;

    fn default_revision_string(&self) -> String;

    /// Hex SHA-256 of the default revision, empty when unknown
    fn default_revision_digest(&self) -> String;

    fn last_check_in_date(&self) -> Option<DateTime<Utc>>;

    fn last_edit_by(&self) -> String;

    fn revision_count(&self) -> usize;

    fn lock_count(&self) -> usize;

    fn locked_by(&self) -> String;

    fn locked_revision(&self, user: &str) -> Option<String>;

    fn is_overlap(&self) -> bool {
        false
    }

    fn skinny(&self, branch_id: i32) -> SkinnyLogfileInfo;
}
