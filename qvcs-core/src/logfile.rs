//! One archive file on disk
//!
//! A [`LogFile`] keeps the parsed [`LogfileInfo`] in memory behind a lock.
//! Every mutation is applied to a copy, written to a uniquely named hidden
//! temp file beside the archive and renamed over it; only then does the
//! in-memory copy change, so a failed write leaves both the file and the
//! cached history untouched.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::archive_info::ArchiveInfo;
use crate::attributes::ArchiveAttributes;
use crate::compression::CompressionAlgorithm;
use crate::error::{QvcsError, Result};
use crate::logfile_info::{CheckIn, CreateArchive, LogfileInfo};
use crate::skinny::SkinnyLogfileInfo;

pub struct LogFile {
    path: RwLock<PathBuf>,
    algorithm: CompressionAlgorithm,
    info: RwLock<LogfileInfo>,
}

impl std::fmt::Debug for LogFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFile").field("path", &self.path()).finish()
    }
}

/// Write `data` to a fresh temp file in the archive's directory.
fn stage(path: &Path, data: &[u8]) -> Result<NamedTempFile> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let mut staged = NamedTempFile::new_in(parent)?;
    staged.write_all(data)?;
    staged.as_file().sync_all()?;
    Ok(staged)
}

/// Replace the file at `path` with `data` in one rename.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    stage(path, data)?.persist(path).map_err(|e| QvcsError::Io(e.error))?;
    Ok(())
}

/// Publish `data` at `path` only if nothing is there yet.
fn write_new(path: &Path, data: &[u8]) -> Result<()> {
    stage(path, data)?.persist_noclobber(path).map_err(|e| match e.error.kind() {
        ErrorKind::AlreadyExists => QvcsError::ArchiveExists(path.display().to_string()),
        _ => QvcsError::Io(e.error),
    })?;
    Ok(())
}

impl LogFile {
    /// Write a new archive at `path`. Fails if the file already exists.
    pub fn create(path: &Path, request: CreateArchive<'_>, algorithm: CompressionAlgorithm) -> Result<Self> {
        if path.exists() {
            return Err(QvcsError::ArchiveExists(path.display().to_string()));
        }
        let mut info = LogfileInfo::create(request, algorithm)?;
        write_new(path, &info.to_bytes()?)?;
        debug!("Created archive {:?} (file id {})", path, info.file_id());
        Ok(Self { path: RwLock::new(path.to_path_buf()), algorithm, info: RwLock::new(info) })
    }

    /// Read an existing archive. The short workfile name is derived from the
    /// archive file name unless `short_workfile_name` is given.
    pub fn open(path: &Path, short_workfile_name: &str, algorithm: CompressionAlgorithm) -> Result<Self> {
        let data = fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => QvcsError::ArchiveNotFound(path.display().to_string()),
            _ => QvcsError::Io(e),
        })?;
        let info = LogfileInfo::from_bytes(short_workfile_name, &data, algorithm).inspect_err(|e| {
            if e.is_corruption() {
                warn!("Archive {:?} is unreadable: {}", path, e);
            }
        })?;
        Ok(Self { path: RwLock::new(path.to_path_buf()), algorithm, info: RwLock::new(info) })
    }

    pub fn path(&self) -> PathBuf {
        self.path.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    fn read_info(&self) -> RwLockReadGuard<'_, LogfileInfo> {
        self.info.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_info(&self) -> RwLockWriteGuard<'_, LogfileInfo> {
        self.info.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` against the cached history.
    pub fn with_info<T>(&self, f: impl FnOnce(&LogfileInfo) -> T) -> T {
        f(&self.read_info())
    }

    /// Apply `f` to a copy of the history, persist it, then publish it.
    fn mutate<T>(&self, f: impl FnOnce(&mut LogfileInfo) -> Result<T>) -> Result<T> {
        let mut guard = self.write_info();
        let mut updated = guard.clone();
        let result = f(&mut updated)?;
        write_atomic(&self.path(), &updated.to_bytes()?)?;
        *guard = updated;
        Ok(result)
    }

    pub fn fetch_revision(&self, revision: &str) -> Result<Vec<u8>> {
        self.read_info().fetch_revision(revision)
    }

    pub fn fetch_default(&self) -> Result<Vec<u8>> {
        self.read_info().fetch_default()
    }

    /// Returns the new revision string, or `None` when nothing changed.
    pub fn check_in(&self, request: CheckIn<'_>) -> Result<Option<String>> {
        self.mutate(|info| info.check_in(request))
    }

    pub fn lock(&self, user: &str, revision: &str) -> Result<()> {
        self.mutate(|info| info.lock(user, revision))
    }

    pub fn unlock(&self, user: &str, revision: &str) -> Result<()> {
        self.mutate(|info| info.unlock(user, revision))
    }

    pub fn break_lock(&self, revision: &str) -> Result<()> {
        self.mutate(|info| info.break_lock(revision))
    }

    pub fn set_revision_description(&self, revision: &str, description: &str) -> Result<()> {
        self.mutate(|info| info.set_revision_description(revision, description))
    }

    pub fn add_label(&self, user: &str, label: &str, revision: &str, floating: bool) -> Result<()> {
        self.mutate(|info| info.add_label(user, label, revision, floating))
    }

    pub fn remove_label(&self, label: &str) -> Result<bool> {
        self.mutate(|info| Ok(info.remove_label(label)))
    }

    pub fn set_attributes(&self, attributes: ArchiveAttributes) -> Result<()> {
        self.mutate(|info| {
            info.set_attributes(attributes);
            Ok(())
        })
    }

    pub fn set_module_description(&self, description: &str) -> Result<()> {
        self.mutate(|info| info.set_module_description(description))
    }

    pub fn set_comment_prefix(&self, prefix: &str) -> Result<()> {
        self.mutate(|info| info.set_comment_prefix(prefix))
    }

    /// Move the archive file to `new_path`, taking a new short name.
    pub fn relocate(&self, new_path: &Path, short_workfile_name: &str) -> Result<()> {
        if new_path.exists() {
            return Err(QvcsError::ArchiveExists(new_path.display().to_string()));
        }
        let mut path = self.path.write().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = new_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&*path, new_path)?;
        debug!("Moved archive {:?} to {:?}", *path, new_path);
        *path = new_path.to_path_buf();
        self.write_info().set_short_workfile_name(short_workfile_name);
        Ok(())
    }

    pub fn oldest_revision_date(&self) -> Option<DateTime<Utc>> {
        self.read_info().oldest_revision_date()
    }
}

impl ArchiveInfo for LogFile {
    fn short_workfile_name(&self) -> String {
        self.read_info().short_workfile_name().to_string()
    }

    fn file_id(&self) -> i32 {
        self.read_info().file_id()
    }

    fn attributes(&self) -> ArchiveAttributes {
        self.read_info().attributes()
    }

    fn default_revision_string(&self) -> String {
        self.read_info().default_revision_string().unwrap_or_default()
    }

    fn default_revision_digest(&self) -> String {
        self.read_info().default_revision_digest().unwrap_or_default()
    }

    fn last_check_in_date(&self) -> Option<DateTime<Utc>> {
        self.read_info().last_check_in_date()
    }

    fn last_edit_by(&self) -> String {
        self.read_info().last_edit_by().unwrap_or_default()
    }

    fn revision_count(&self) -> usize {
        self.read_info().revision_count()
    }

    fn lock_count(&self) -> usize {
        self.read_info().lock_count()
    }

    fn locked_by(&self) -> String {
        self.read_info().locked_by()
    }

    fn locked_revision(&self, user: &str) -> Option<String> {
        self.read_info().locked_revision(user)
    }

    fn skinny(&self, branch_id: i32) -> SkinnyLogfileInfo {
        self.read_info().skinny(branch_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn request<'a>(content: &'a [u8]) -> CreateArchive<'a> {
        CreateArchive {
            short_workfile_name: "notes.txt",
            file_id: 7,
            user: "alice",
            content,
            description: "first",
            module_description: "",
            attributes: ArchiveAttributes::default(),
            edit_date: Utc::now(),
            lock: false,
        }
    }

    #[test]
    fn test_create_and_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("notes.uyu");
        let log = LogFile::create(&path, request(b"hello\n"), CompressionAlgorithm::Lz).unwrap();
        log.check_in(CheckIn {
            user: "alice",
            parent_revision: "1.1",
            content: b"hello\nworld\n",
            description: "second",
            edit_date: Utc::now(),
            keep_locked: false,
            label: Some("V2"),
        })
        .unwrap();
        let leftovers: Vec<_> = fs::read_dir(tmp.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("notes.uyu")]);

        let reopened = LogFile::open(&path, "notes.txt", CompressionAlgorithm::Lz).unwrap();
        assert_eq!(reopened.revision_count(), 2);
        assert_eq!(reopened.default_revision_string(), "1.2");
        assert_eq!(reopened.fetch_revision("1.1").unwrap(), b"hello\n");
        assert_eq!(reopened.with_info(|i| i.label_revision("V2")).unwrap(), "1.2");
    }

    #[test]
    fn test_create_existing_fails() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("notes.uyu");
        LogFile::create(&path, request(b"a"), CompressionAlgorithm::Lz).unwrap();
        let err = LogFile::create(&path, request(b"a"), CompressionAlgorithm::Lz).unwrap_err();
        assert!(matches!(err, QvcsError::ArchiveExists(_)));
    }

    #[test]
    fn test_open_missing_and_corrupt() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("gone.d");
        assert!(matches!(
            LogFile::open(&missing, "gone.c", CompressionAlgorithm::Lz),
            Err(QvcsError::ArchiveNotFound(_))
        ));
        let corrupt = tmp.path().join("bad.d");
        fs::write(&corrupt, b"not an archive at all, just some text").unwrap();
        let err = LogFile::open(&corrupt, "bad.c", CompressionAlgorithm::Lz).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_failed_mutation_leaves_state() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("notes.uyu");
        let log = LogFile::create(&path, request(b"a"), CompressionAlgorithm::Lz).unwrap();
        log.lock("alice", "1.1").unwrap();
        assert!(log.lock("bob", "1.1").is_err());
        assert_eq!(log.locked_by(), "alice");
        assert!(log.unlock("alice", "9.9").is_err());
        assert_eq!(log.lock_count(), 1);
    }

    #[test]
    fn test_relocate() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("notes.uyu");
        let log = LogFile::create(&path, request(b"a"), CompressionAlgorithm::Lz).unwrap();
        let target = tmp.path().join("sub").join("renamed.uyu");
        log.relocate(&target, "renamed.txt").unwrap();
        assert!(!path.exists());
        assert!(target.exists());
        assert_eq!(log.short_workfile_name(), "renamed.txt");
        assert_eq!(log.path(), target);
    }

    #[test]
    fn test_concurrent_creates_of_one_path() {
        let tmp = TempDir::new().unwrap();
        let path = Arc::new(tmp.path().join("notes.uyu"));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let path = Arc::clone(&path);
                thread::spawn(move || {
                    let content = format!("writer {}\n", i);
                    LogFile::create(&path, request(content.as_bytes()), CompressionAlgorithm::Lz)
                        .map(|log| log.fetch_default().unwrap())
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners: Vec<&Vec<u8>> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(e, QvcsError::ArchiveExists(_))));
        let on_disk = LogFile::open(&path, "notes.txt", CompressionAlgorithm::Lz).unwrap();
        assert_eq!(&on_disk.fetch_default().unwrap(), winners[0]);
    }

    #[test]
    fn test_sibling_archives_mutate_concurrently() {
        let tmp = TempDir::new().unwrap();
        let source = Arc::new(LogFile::create(&tmp.path().join("main.d"), request(b"0\n"), CompressionAlgorithm::Lz).unwrap());
        let header = Arc::new(LogFile::create(&tmp.path().join("main.i"), request(b"0\n"), CompressionAlgorithm::Lz).unwrap());

        let handles: Vec<_> = [source, header]
            .into_iter()
            .map(|log| {
                thread::spawn(move || {
                    for n in 1..=100u32 {
                        let parent = format!("1.{}", n);
                        let content = format!("{}\n", n);
                        log.check_in(CheckIn {
                            user: "alice",
                            parent_revision: &parent,
                            content: content.as_bytes(),
                            description: "bump",
                            edit_date: Utc::now(),
                            keep_locked: false,
                            label: None,
                        })?;
                    }
                    Ok::<_, QvcsError>(log.path())
                })
            })
            .collect();

        for handle in handles {
            let path = handle.join().unwrap().unwrap();
            let reopened = LogFile::open(&path, "main", CompressionAlgorithm::Lz).unwrap();
            assert_eq!(reopened.revision_count(), 101);
            assert_eq!(reopened.fetch_default().unwrap(), b"100\n");
        }
        let mut names: Vec<_> = fs::read_dir(tmp.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
        names.sort();
        assert_eq!(names, vec![std::ffi::OsString::from("main.d"), std::ffi::OsString::from("main.i")]);
    }

    #[test]
    fn test_overlong_description_never_reaches_disk() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("notes.uyu");
        let long = "c".repeat(70_000);
        let mut oversized = request(b"a");
        oversized.description = &long;
        let err = LogFile::create(&path, oversized, CompressionAlgorithm::Lz).unwrap_err();
        assert!(matches!(err, QvcsError::StringTooLong { length: 70_000, .. }));
        assert!(!path.exists());

        let log = LogFile::create(&path, request(b"a"), CompressionAlgorithm::Lz).unwrap();
        assert!(log.set_revision_description("1.1", &long).is_err());
        let reopened = LogFile::open(&path, "notes.txt", CompressionAlgorithm::Lz).unwrap();
        assert_eq!(reopened.with_info(|i| i.find_revision("1.1").map(|r| r.description().to_string())).unwrap(), "first");
    }
}
