//! One file as seen from both sides: archive and workfile

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::archive_info::ArchiveInfo;
use crate::workfile::WorkfileInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergedStatus {
    Current,
    Stale,
    YourCopyChanged,
    MergeRequired,
    Different,
    Missing,
    NotControlled,
    Invalid,
}

impl MergedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MergedStatus::Current => "Current",
            MergedStatus::Stale => "Stale",
            MergedStatus::YourCopyChanged => "Your copy changed",
            MergedStatus::MergeRequired => "Merge required",
            MergedStatus::Different => "Different",
            MergedStatus::Missing => "Missing",
            MergedStatus::NotControlled => "Not controlled",
            MergedStatus::Invalid => "Invalid",
        }
    }

    /// Key used to sort file listings so the files needing attention come
    /// first.
    pub fn sort_value(self) -> u8 {
        match self {
            MergedStatus::Stale => 0,
            MergedStatus::YourCopyChanged => 1,
            MergedStatus::MergeRequired => 2,
            MergedStatus::Different => 3,
            MergedStatus::Missing => 4,
            MergedStatus::Current => 5,
            MergedStatus::NotControlled => 6,
            MergedStatus::Invalid => 7,
        }
    }
}

impl fmt::Display for MergedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct MergedInfo {
    short_name: String,
    archive: Option<Arc<dyn ArchiveInfo>>,
    workfile: Option<WorkfileInfo>,
}

impl fmt::Debug for MergedInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergedInfo")
            .field("short_name", &self.short_name)
            .field("file_id", &self.file_id())
            .field("workfile", &self.workfile.as_ref().map(|w| &w.path))
            .finish()
    }
}

impl MergedInfo {
    pub fn new(short_name: &str, archive: Option<Arc<dyn ArchiveInfo>>, workfile: Option<WorkfileInfo>) -> Self {
        Self { short_name: short_name.to_string(), archive, workfile }
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn archive(&self) -> Option<&Arc<dyn ArchiveInfo>> {
        self.archive.as_ref()
    }

    pub fn set_archive(&mut self, archive: Arc<dyn ArchiveInfo>) {
        self.archive = Some(archive);
    }

    pub fn workfile(&self) -> Option<&WorkfileInfo> {
        self.workfile.as_ref()
    }

    pub fn file_id(&self) -> Option<i32> {
        self.archive.as_ref().map(|a| a.file_id())
    }

    pub fn lock_count(&self) -> usize {
        self.archive.as_ref().map_or(0, |a| a.lock_count())
    }

    pub fn locked_by(&self) -> String {
        self.archive.as_ref().map(|a| a.locked_by()).unwrap_or_default()
    }

    pub fn default_revision_string(&self) -> Option<String> {
        self.archive.as_ref().map(|a| a.default_revision_string())
    }

    /// `(short name, file id, workfile path)`, used to compare two merges
    pub fn association(&self) -> (String, Option<i32>, Option<std::path::PathBuf>) {
        (self.short_name.clone(), self.file_id(), self.workfile.as_ref().map(|w| w.path.clone()))
    }

    fn digests_match(&self, archive: &dyn ArchiveInfo, workfile: &WorkfileInfo) -> bool {
        let digest = archive.default_revision_digest();
        !digest.is_empty() && digest == workfile.digest
    }

    /// Status of the workfile relative to the archive's default revision,
    /// from the point of view of `user`.
    pub fn status(&self, user: &str) -> MergedStatus {
        let (archive, workfile) = match (&self.archive, &self.workfile) {
            (Some(archive), Some(workfile)) => (archive.as_ref(), workfile),
            (Some(_), None) => return MergedStatus::Missing,
            (None, Some(_)) => return MergedStatus::NotControlled,
            (None, None) => return MergedStatus::Invalid,
        };
        if !workfile.exists {
            return MergedStatus::Missing;
        }
        if self.digests_match(archive, workfile) {
            return MergedStatus::Current;
        }

        let Some(fetched) = workfile.fetched_revision.as_deref() else {
            return MergedStatus::Different;
        };
        let default_revision = archive.default_revision_string();
        if fetched == default_revision {
            return MergedStatus::YourCopyChanged;
        }
        if !workfile.modified_since_fetch() {
            return MergedStatus::Stale;
        }
        match archive.locked_revision(user) {
            // Locked the tip after editing an older fetch.
            Some(locked) if locked == default_revision => MergedStatus::MergeRequired,
            // Editing a non-tip revision the user holds locked.
            Some(locked) if locked == fetched => MergedStatus::YourCopyChanged,
            _ => MergedStatus::MergeRequired,
        }
    }
}
