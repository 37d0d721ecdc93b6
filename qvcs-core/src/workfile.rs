//! Client-side workfiles: what is on disk, and what was last fetched

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::utility::digest_hex;

/// Name of the per-directory fetch record
pub const WORKFILE_DIGEST_STORE_NAME: &str = ".qvcs-workfile-digests.json";

/// Name of the ignore file read from a project root
pub const IGNORE_FILE_NAME: &str = ".qvcsosignore";

/// One file in a workfile directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkfileInfo {
    pub short_name: String,
    pub path: PathBuf,
    pub exists: bool,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub digest: String,
    /// Revision that was last fetched into this workfile, if known
    pub fetched_revision: Option<String>,
    pub fetch_date: Option<DateTime<Utc>>,
}

impl WorkfileInfo {
    /// Stat and digest the file at `path`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path)?;
        let data = fs::read(path)?;
        let modified = metadata.modified().map(DateTime::<Utc>::from).unwrap_or_default();
        Ok(Self {
            short_name: path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
            path: path.to_path_buf(),
            exists: true,
            size: metadata.len(),
            modified,
            digest: digest_hex(&data),
            fetched_revision: None,
            fetch_date: None,
        })
    }

    /// A workfile the digest store remembers but that is gone from disk
    pub fn missing(short_name: &str, path: PathBuf) -> Self {
        Self {
            short_name: short_name.to_string(),
            path,
            exists: false,
            size: 0,
            modified: DateTime::<Utc>::default(),
            digest: String::new(),
            fetched_revision: None,
            fetch_date: None,
        }
    }

    /// Modified on disk after the last recorded fetch
    pub fn modified_since_fetch(&self) -> bool {
        match self.fetch_date {
            Some(fetched) => self.modified > fetched,
            None => true,
        }
    }
}

/// What the client fetched for one workfile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRecord {
    pub revision: String,
    pub fetch_date: DateTime<Utc>,
    pub digest: String,
}

/// Per-directory JSON record of fetched revisions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkfileDigestStore {
    #[serde(default)]
    pub entries: BTreeMap<String, FetchRecord>,
}

impl WorkfileDigestStore {
    /// Load the store in `directory`; a missing file is an empty store.
    pub fn load(directory: &Path) -> Result<Self> {
        let path = directory.join(WORKFILE_DIGEST_STORE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, directory: &Path) -> Result<()> {
        let path = directory.join(WORKFILE_DIGEST_STORE_NAME);
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn get(&self, short_name: &str) -> Option<&FetchRecord> {
        self.entries.get(short_name)
    }

    pub fn record(&mut self, short_name: &str, revision: &str, digest: &str, fetch_date: DateTime<Utc>) {
        self.entries.insert(
            short_name.to_string(),
            FetchRecord { revision: revision.to_string(), fetch_date, digest: digest.to_string() },
        );
    }

    pub fn remove(&mut self, short_name: &str) -> Option<FetchRecord> {
        self.entries.remove(short_name)
    }
}

/// Decides which files the directory merge skips.
pub trait IgnoreFilter: Send + Sync {
    fn ignore_file(&self, short_name: &str) -> bool;

    fn ignore_directory(&self, _appended_path: &str) -> bool {
        false
    }
}

/// Filter that ignores nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIgnore;

impl IgnoreFilter for NoIgnore {
    fn ignore_file(&self, _short_name: &str) -> bool {
        false
    }
}

/// Exact names and `*.ext` patterns for files, plus directory segments
/// (lines ending in `/`).
#[derive(Debug, Default, Clone)]
pub struct IgnoreList {
    files: HashSet<String>,
    extensions: HashSet<String>,
    directories: HashSet<String>,
}

impl IgnoreList {
    pub fn parse(text: &str) -> Self {
        let mut list = Self::default();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with('#')) {
            if let Some(directory) = line.strip_suffix('/') {
                list.directories.insert(directory.trim_matches('/').to_string());
            } else if let Some(extension) = line.strip_prefix("*.") {
                list.extensions.insert(extension.to_string());
            } else {
                list.files.insert(line.to_string());
            }
        }
        list
    }

    /// Read `.qvcsosignore` from `project_root`; missing means empty.
    pub fn load(project_root: &Path) -> Self {
        let path = project_root.join(IGNORE_FILE_NAME);
        match fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!("Could not read ignore file {:?}: {}", path, e);
                Self::default()
            }
        }
    }
}

impl IgnoreFilter for IgnoreList {
    fn ignore_file(&self, short_name: &str) -> bool {
        if short_name == WORKFILE_DIGEST_STORE_NAME || short_name == IGNORE_FILE_NAME {
            return true;
        }
        if self.files.contains(short_name) {
            return true;
        }
        match short_name.rsplit_once('.') {
            Some((_, extension)) => self.extensions.contains(extension),
            None => false,
        }
    }

    fn ignore_directory(&self, appended_path: &str) -> bool {
        appended_path.split(['/', '\\']).any(|segment| self.directories.contains(segment))
    }
}

/// The workfile side of one directory
pub struct WorkfileDirectoryManager {
    directory: PathBuf,
    workfiles: RwLock<BTreeMap<String, WorkfileInfo>>,
    store: RwLock<WorkfileDigestStore>,
    generation: AtomicU64,
}

impl WorkfileDirectoryManager {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            workfiles: RwLock::new(BTreeMap::new()),
            store: RwLock::new(WorkfileDigestStore::default()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Bumped whenever the workfile collection changes
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Re-read the directory and the digest store.
    pub fn refresh(&self) -> Result<()> {
        let store = WorkfileDigestStore::load(&self.directory)?;
        let mut scanned = BTreeMap::new();
        if self.directory.is_dir() {
            for entry in fs::read_dir(&self.directory)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if name == WORKFILE_DIGEST_STORE_NAME || name.ends_with(".tmp") {
                    continue;
                }
                let mut info = WorkfileInfo::from_path(&entry.path())?;
                if let Some(record) = store.get(&name) {
                    info.fetched_revision = Some(record.revision.clone());
                    info.fetch_date = Some(record.fetch_date);
                }
                scanned.insert(name, info);
            }
        }
        debug!("Scanned {} workfiles in {:?}", scanned.len(), self.directory);
        *self.workfiles.write().unwrap_or_else(|e| e.into_inner()) = scanned;
        *self.store.write().unwrap_or_else(|e| e.into_inner()) = store;
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn workfiles(&self) -> Vec<WorkfileInfo> {
        self.workfiles.read().unwrap_or_else(|e| e.into_inner()).values().cloned().collect()
    }

    pub fn workfile(&self, short_name: &str) -> Option<WorkfileInfo> {
        self.workfiles.read().unwrap_or_else(|e| e.into_inner()).get(short_name).cloned()
    }

    pub fn fetch_record(&self, short_name: &str) -> Option<FetchRecord> {
        self.store.read().unwrap_or_else(|e| e.into_inner()).get(short_name).cloned()
    }

    /// Write fetched bytes to the workfile and remember the fetch.
    pub fn write_fetched(&self, short_name: &str, revision: &str, content: &[u8]) -> Result<WorkfileInfo> {
        let path = self.directory.join(short_name);
        fs::create_dir_all(&self.directory)?;
        fs::write(&path, content)?;
        let mut info = WorkfileInfo::from_path(&path)?;
        // Anything modified after this moment counts as a local edit.
        let fetch_date = info.modified;
        {
            let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
            store.record(short_name, revision, &info.digest, fetch_date);
            store.save(&self.directory)?;
        }
        info.fetched_revision = Some(revision.to_string());
        info.fetch_date = Some(fetch_date);
        self.workfiles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(short_name.to_string(), info.clone());
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(info)
    }

    /// Update the remembered revision for a workfile whose bytes already
    /// match `revision`.
    pub fn record_fetch(&self, short_name: &str, revision: &str, digest: &str, fetch_date: DateTime<Utc>) -> Result<()> {
        let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
        store.record(short_name, revision, digest, fetch_date);
        store.save(&self.directory)?;
        if let Some(info) = self.workfiles.write().unwrap_or_else(|e| e.into_inner()).get_mut(short_name) {
            info.fetched_revision = Some(revision.to_string());
            info.fetch_date = Some(fetch_date);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_digest_store_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let mut store = WorkfileDigestStore::default();
        store.record("a.c", "1.3", "abcd", Utc::now());
        store.save(tmp.path()).unwrap();
        let loaded = WorkfileDigestStore::load(tmp.path()).unwrap();
        assert_eq!(loaded, store);
        assert_eq!(WorkfileDigestStore::load(&tmp.path().join("none")).unwrap(), WorkfileDigestStore::default());
    }

    #[test]
    fn test_ignore_list() {
        let list = IgnoreList::parse("# build output\n*.o\ncore\ntarget/\n\n");
        assert!(list.ignore_file("main.o"));
        assert!(list.ignore_file("core"));
        assert!(!list.ignore_file("main.c"));
        assert!(list.ignore_file(WORKFILE_DIGEST_STORE_NAME));
        assert!(list.ignore_directory("src/target/debug"));
        assert!(!list.ignore_directory("src/lib"));
        assert!(!NoIgnore.ignore_file("anything"));
    }

    #[test]
    fn test_refresh_and_fetch() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.c"), b"int a;\n").unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        let manager = WorkfileDirectoryManager::new(tmp.path());
        manager.refresh().unwrap();
        let generation = manager.generation();
        assert_eq!(manager.workfiles().len(), 1);
        assert_eq!(manager.workfile("a.c").unwrap().digest, digest_hex(b"int a;\n"));
        assert!(manager.workfile("a.c").unwrap().fetched_revision.is_none());

        let info = manager.write_fetched("b.c", "1.2", b"int b;\n").unwrap();
        assert_eq!(info.fetched_revision.as_deref(), Some("1.2"));
        assert!(!info.modified_since_fetch());
        assert!(manager.generation() > generation);

        // The fetch record survives a rescan.
        manager.refresh().unwrap();
        assert_eq!(manager.workfiles().len(), 2);
        assert_eq!(manager.workfile("b.c").unwrap().fetched_revision.as_deref(), Some("1.2"));
        assert_eq!(manager.fetch_record("b.c").unwrap().digest, digest_hex(b"int b;\n"));
    }
}
