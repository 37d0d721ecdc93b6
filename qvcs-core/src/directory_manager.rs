//! Directory merge: archive side plus workfile side, one entry per file
//!
//! [`DirectoryManager::merge_managers`] rebuilds the merged maps from scratch
//! every time. Both source collections carry a generation counter; if either
//! moves while the merge runs, the partial result is thrown away and the
//! merge starts over.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::archive_info::ArchiveInfo;
use crate::merged_info::MergedInfo;
use crate::utility::{archive_key, CEMETERY_APPENDED_PATH};
use crate::workfile::{IgnoreFilter, WorkfileDirectoryManager};

/// The archive collection of one directory, server or client side.
pub trait ArchiveDirectory: Send + Sync {
    fn appended_path(&self) -> String;

    /// Snapshot of the archives currently in the directory
    fn archive_infos(&self) -> Vec<Arc<dyn ArchiveInfo>>;

    /// Bumped on every change to the collection
    fn generation(&self) -> u64;

    fn is_cemetery(&self) -> bool {
        self.appended_path() == CEMETERY_APPENDED_PATH
    }
}

/// Something that can re-run a directory merge.
pub trait DirectoryMerge: Send + Sync {
    fn merge(&self);
}

#[derive(Default)]
struct MergedMaps {
    by_name: BTreeMap<String, MergedInfo>,
    by_file_id: HashMap<i32, String>,
}

pub struct DirectoryManager {
    archives: Arc<dyn ArchiveDirectory>,
    workfiles: Option<Arc<WorkfileDirectoryManager>>,
    ignore: Arc<dyn IgnoreFilter>,
    ignore_case: bool,
    merged: RwLock<MergedMaps>,
    merge_count: AtomicU64,
}

impl DirectoryManager {
    pub fn new(
        archives: Arc<dyn ArchiveDirectory>,
        workfiles: Option<Arc<WorkfileDirectoryManager>>,
        ignore: Arc<dyn IgnoreFilter>,
        ignore_case: bool,
    ) -> Self {
        Self {
            archives,
            workfiles,
            ignore,
            ignore_case,
            merged: RwLock::new(MergedMaps::default()),
            merge_count: AtomicU64::new(0),
        }
    }

    pub fn archive_directory(&self) -> &Arc<dyn ArchiveDirectory> {
        &self.archives
    }

    pub fn workfile_directory(&self) -> Option<&Arc<WorkfileDirectoryManager>> {
        self.workfiles.as_ref()
    }

    pub fn appended_path(&self) -> String {
        self.archives.appended_path()
    }

    fn source_generations(&self) -> (u64, u64) {
        (self.archives.generation(), self.workfiles.as_ref().map_or(0, |w| w.generation()))
    }

    fn build(&self) -> MergedMaps {
        let mut maps = MergedMaps::default();
        if !self.archives.is_cemetery() {
            if let Some(workfiles) = &self.workfiles {
                for workfile in workfiles.workfiles() {
                    if self.ignore.ignore_file(&workfile.short_name) {
                        continue;
                    }
                    let key = archive_key(&workfile.short_name, self.ignore_case);
                    let short_name = workfile.short_name.clone();
                    maps.by_name.insert(key, MergedInfo::new(&short_name, None, Some(workfile)));
                }
            }
        }
        for archive in self.archives.archive_infos() {
            let short_name = archive.short_workfile_name();
            let key = archive_key(&short_name, self.ignore_case);
            let file_id = archive.file_id();
            if let Some(existing) = maps.by_name.get_mut(&key) {
                existing.set_archive(archive);
            } else if !self.ignore.ignore_file(&short_name) {
                maps.by_name.insert(key.clone(), MergedInfo::new(&short_name, Some(archive), None));
            } else {
                continue;
            }
            maps.by_file_id.insert(file_id, key);
        }
        maps
    }

    /// Rebuild the merged view. Retries until neither source collection
    /// changed during the rebuild.
    pub fn merge_managers(&self) {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let before = self.source_generations();
            let maps = self.build();
            if self.source_generations() == before {
                *self.merged.write().unwrap_or_else(|e| e.into_inner()) = maps;
                break;
            }
            debug!("Directory {} changed during merge; retrying (attempt {})", self.appended_path(), attempts);
        }
        self.merge_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of completed merges
    pub fn merge_count(&self) -> u64 {
        self.merge_count.load(Ordering::Acquire)
    }

    pub fn merged_info(&self, short_name: &str) -> Option<MergedInfo> {
        let key = archive_key(short_name, self.ignore_case);
        self.merged.read().unwrap_or_else(|e| e.into_inner()).by_name.get(&key).cloned()
    }

    pub fn merged_info_by_file_id(&self, file_id: i32) -> Option<MergedInfo> {
        let maps = self.merged.read().unwrap_or_else(|e| e.into_inner());
        maps.by_file_id.get(&file_id).and_then(|key| maps.by_name.get(key)).cloned()
    }

    /// Every merged entry, sorted by key
    pub fn merged_infos(&self) -> Vec<MergedInfo> {
        self.merged.read().unwrap_or_else(|e| e.into_inner()).by_name.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.merged.read().unwrap_or_else(|e| e.into_inner()).by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DirectoryMerge for DirectoryManager {
    fn merge(&self) {
        self.merge_managers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::ArchiveAttributes;
    use crate::skinny::SkinnyLogfileInfo;
    use crate::workfile::{IgnoreList, NoIgnore};
    use chrono::{DateTime, Utc};
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Named(&'static str, i32);

    impl ArchiveInfo for Named {
        fn short_workfile_name(&self) -> String {
            self.0.to_string()
        }
        fn file_id(&self) -> i32 {
            self.1
        }
        fn attributes(&self) -> ArchiveAttributes {
            ArchiveAttributes::default()
        }
        fn default_revision_string(&self) -> String {
            "1.1".into()
        }
        fn default_revision_digest(&self) -> String {
            String::new()
        }
        fn last_check_in_date(&self) -> Option<DateTime<Utc>> {
            None
        }
        fn last_edit_by(&self) -> String {
            String::new()
        }
        fn revision_count(&self) -> usize {
            1
        }
        fn lock_count(&self) -> usize {
            0
        }
        fn locked_by(&self) -> String {
            String::new()
        }
        fn locked_revision(&self, _user: &str) -> Option<String> {
            None
        }
        fn skinny(&self, branch_id: i32) -> SkinnyLogfileInfo {
            SkinnyLogfileInfo::new(self.0, self.1, branch_id)
        }
    }

    /// Archive side whose generation moves on the first `bumps` snapshots
    struct Flaky {
        path: &'static str,
        archives: Vec<Arc<dyn ArchiveInfo>>,
        generation: AtomicU64,
        bumps: Mutex<u32>,
    }

    impl Flaky {
        fn new(path: &'static str, names: &[(&'static str, i32)], bumps: u32) -> Self {
            Self {
                path,
                archives: names.iter().map(|(n, id)| Arc::new(Named(n, *id)) as Arc<dyn ArchiveInfo>).collect(),
                generation: AtomicU64::new(0),
                bumps: Mutex::new(bumps),
            }
        }
    }

    impl ArchiveDirectory for Flaky {
        fn appended_path(&self) -> String {
            self.path.to_string()
        }
        fn archive_infos(&self) -> Vec<Arc<dyn ArchiveInfo>> {
            let mut bumps = self.bumps.lock().unwrap();
            if *bumps > 0 {
                *bumps -= 1;
                self.generation.fetch_add(1, Ordering::AcqRel);
            }
            self.archives.clone()
        }
        fn generation(&self) -> u64 {
            self.generation.load(Ordering::Acquire)
        }
    }

    fn workfiles(names: &[&str]) -> (TempDir, Arc<WorkfileDirectoryManager>) {
        let tmp = TempDir::new().unwrap();
        for name in names {
            fs::write(tmp.path().join(name), name.as_bytes()).unwrap();
        }
        let manager = Arc::new(WorkfileDirectoryManager::new(tmp.path()));
        manager.refresh().unwrap();
        (tmp, manager)
    }

    #[test]
    fn test_merge_pairs_by_short_name() {
        let (_tmp, work) = workfiles(&["a.c", "local.c", "x.o"]);
        let archives = Arc::new(Flaky::new("src", &[("a.c", 1), ("remote.c", 2)], 0));
        let manager = DirectoryManager::new(archives, Some(work), Arc::new(IgnoreList::parse("*.o")), false);
        manager.merge_managers();

        let names: Vec<String> = manager.merged_infos().iter().map(|m| m.short_name().to_string()).collect();
        assert_eq!(names, vec!["a.c", "local.c", "remote.c"]);
        let a = manager.merged_info("a.c").unwrap();
        assert!(a.archive().is_some() && a.workfile().is_some());
        assert!(manager.merged_info("local.c").unwrap().archive().is_none());
        assert!(manager.merged_info("remote.c").unwrap().workfile().is_none());
        assert_eq!(manager.merged_info_by_file_id(2).unwrap().short_name(), "remote.c");
        assert!(manager.merged_info_by_file_id(9).is_none());
    }

    #[test]
    fn test_merge_idempotent() {
        let (_tmp, work) = workfiles(&["a.c", "b.c"]);
        let archives = Arc::new(Flaky::new("src", &[("a.c", 1), ("c.c", 3)], 0));
        let manager = DirectoryManager::new(archives, Some(work), Arc::new(NoIgnore), false);
        manager.merge_managers();
        let first: Vec<_> = manager.merged_infos().iter().map(MergedInfo::association).collect();
        manager.merge_managers();
        let second: Vec<_> = manager.merged_infos().iter().map(MergedInfo::association).collect();
        assert_eq!(first, second);
        assert_eq!(manager.merge_count(), 2);
    }

    #[test]
    fn test_merge_retries_on_concurrent_change() {
        let archives = Arc::new(Flaky::new("src", &[("a.c", 1)], 3));
        let manager = DirectoryManager::new(archives.clone(), None, Arc::new(NoIgnore), false);
        manager.merge_managers();
        assert_eq!(*archives.bumps.lock().unwrap(), 0);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_cemetery_skips_workfiles() {
        let (_tmp, work) = workfiles(&["stray.c"]);
        let archives = Arc::new(Flaky::new(CEMETERY_APPENDED_PATH, &[("QVCS_CEMETERY_ARCHIVE5.QVCS_ARCHIVE", 5)], 0));
        let manager = DirectoryManager::new(archives, Some(work), Arc::new(NoIgnore), false);
        manager.merge_managers();
        assert_eq!(manager.len(), 1);
        assert!(manager.merged_info("stray.c").is_none());
    }

    #[test]
    fn test_ignore_case_keys() {
        let (_tmp, work) = workfiles(&["Main.C"]);
        let archives = Arc::new(Flaky::new("src", &[("main.c", 1)], 0));
        let manager = DirectoryManager::new(archives, Some(work), Arc::new(NoIgnore), true);
        manager.merge_managers();
        assert_eq!(manager.len(), 1);
        assert!(manager.merged_info("MAIN.c").unwrap().archive().is_some());
    }
}
