//! Server-side archive directories
//!
//! An [`ArchiveDirManager`] owns the archives of one project directory and
//! is the only writer of those files. Managers are handed out by the
//! [`ArchiveDirManagerFactory`], which also owns what is shared across a
//! project (file and directory id allocation, the cemetery) and across the
//! server (the move lock).
//!
//! Archives are shared by every branch of a project; branch identity only
//! matters to clients and to the notification fan-out.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::archive_info::ArchiveInfo;
use crate::attributes::ArchiveAttributes;
use crate::branch::TRUNK_BRANCH_ID;
use crate::change_notifier::{ChangeNotifier, DirectoryListener};
use crate::config::{ProjectProperties, ServerConfig};
use crate::directory_manager::{ArchiveDirectory, DirectoryMerge};
use crate::error::{QvcsError, Result};
use crate::logfile::{write_atomic, LogFile};
use crate::logfile_info::{CheckIn, CreateArchive};
use crate::notification::{ArchiveEvent, ArchiveEventListener};
use crate::skinny::SkinnyLogfileInfo;
use crate::utility::{
    archive_key, archive_to_workfile_name, cemetery_archive_name, file_id_from_cemetery_name, standard_path,
    workfile_to_archive_name, CEMETERY_APPENDED_PATH,
};

/// Name of the per-project id allocation file
pub const PROJECT_IDS_FILE: &str = ".qvcs-ids.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdState {
    next_file_id: i32,
    next_directory_id: i32,
    directories: BTreeMap<String, i32>,
}

impl Default for IdState {
    fn default() -> Self {
        Self { next_file_id: 1, next_directory_id: 1, directories: BTreeMap::new() }
    }
}

/// File and directory ids for one project, persisted as JSON in the
/// project root
#[derive(Debug)]
pub struct ProjectIds {
    path: PathBuf,
    state: Mutex<IdState>,
}

impl ProjectIds {
    pub fn load(project_root: &Path) -> Result<Self> {
        let path = project_root.join(PROJECT_IDS_FILE);
        let state = if path.exists() { serde_json::from_str(&fs::read_to_string(&path)?)? } else { IdState::default() };
        Ok(Self { path, state: Mutex::new(state) })
    }

    fn save(&self, state: &IdState) -> Result<()> {
        write_atomic(&self.path, serde_json::to_string_pretty(state)?.as_bytes())
    }

    pub fn allocate_file_id(&self) -> Result<i32> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let id = state.next_file_id;
        state.next_file_id += 1;
        self.save(&state)?;
        Ok(id)
    }

    /// Make sure ids already present on disk are never handed out again.
    pub fn observe_file_id(&self, file_id: i32) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if file_id >= state.next_file_id {
            state.next_file_id = file_id + 1;
        }
    }

    /// Id of a directory, assigning one on first use.
    pub fn directory_id(&self, appended_path: &str) -> Result<i32> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = state.directories.get(appended_path) {
            return Ok(*id);
        }
        let id = state.next_directory_id;
        state.next_directory_id += 1;
        state.directories.insert(appended_path.to_string(), id);
        self.save(&state)?;
        Ok(id)
    }
}

/// Plain-file mirror of each archive's default revision
#[derive(Debug, Clone)]
pub struct ReferenceCopies {
    root: PathBuf,
}

impl ReferenceCopies {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, appended_path: &str, short_name: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in appended_path.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path.join(short_name)
    }

    /// Failures are logged and swallowed; the archive operation already
    /// succeeded.
    pub fn write(&self, appended_path: &str, short_name: &str, content: &[u8]) {
        let path = self.path(appended_path, short_name);
        let result = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| fs::write(&path, content));
        if let Err(e) = result {
            warn!("Failed to write reference copy {:?}: {}", path, e);
        }
    }

    pub fn delete(&self, appended_path: &str, short_name: &str) {
        let path = self.path(appended_path, short_name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete reference copy {:?}: {}", path, e),
        }
    }
}

/// Parameters for [`ArchiveDirManager::create_archive`]
#[derive(Debug, Clone)]
pub struct NewArchive<'a> {
    pub user: &'a str,
    pub short_workfile_name: &'a str,
    pub content: &'a [u8],
    pub description: &'a str,
    pub module_description: &'a str,
    /// Project defaults apply when `None`
    pub attributes: Option<ArchiveAttributes>,
    pub edit_date: DateTime<Utc>,
    pub lock: bool,
}

pub struct ArchiveDirManager {
    project: String,
    appended_path: String,
    directory: PathBuf,
    directory_id: i32,
    properties: ProjectProperties,
    ids: Arc<ProjectIds>,
    move_lock: Arc<Mutex<()>>,
    /// Held from the existence check until the new archive is in the map
    create_lock: Mutex<()>,
    references: Option<ReferenceCopies>,
    archives: RwLock<BTreeMap<String, Arc<LogFile>>>,
    generation: AtomicU64,
    most_recent_activity: RwLock<Option<DateTime<Utc>>>,
    notifier: ChangeNotifier,
    event_listeners: RwLock<Vec<Arc<dyn ArchiveEventListener>>>,
}

impl std::fmt::Debug for ArchiveDirManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveDirManager")
            .field("project", &self.project)
            .field("appended_path", &self.appended_path)
            .field("directory", &self.directory)
            .finish()
    }
}

impl ArchiveDirManager {
    /// Open the directory and read every archive in it. Unreadable archives
    /// are logged and left out.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        project: &str,
        appended_path: &str,
        directory: PathBuf,
        properties: ProjectProperties,
        ids: Arc<ProjectIds>,
        move_lock: Arc<Mutex<()>>,
        notify_delay: Duration,
    ) -> Result<Self> {
        let appended_path = standard_path(appended_path);
        let directory_id = ids.directory_id(&appended_path)?;
        let references = properties.reference_root().map(ReferenceCopies::new);
        let manager = Self {
            project: project.to_string(),
            notifier: ChangeNotifier::new(&appended_path, notify_delay),
            appended_path,
            directory,
            directory_id,
            properties,
            ids,
            move_lock,
            create_lock: Mutex::new(()),
            references,
            archives: RwLock::new(BTreeMap::new()),
            generation: AtomicU64::new(0),
            most_recent_activity: RwLock::new(None),
            event_listeners: RwLock::new(Vec::new()),
        };
        manager.load()?;
        Ok(manager)
    }

    fn load(&self) -> Result<()> {
        if !self.directory.is_dir() {
            return Ok(());
        }
        let mut loaded = BTreeMap::new();
        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with('.') {
                continue;
            }
            let short_name = if self.is_cemetery() {
                if file_id_from_cemetery_name(&file_name).is_none() {
                    continue;
                }
                file_name.clone()
            } else {
                archive_to_workfile_name(&file_name)
            };
            match LogFile::open(&entry.path(), &short_name, self.properties.compression) {
                Ok(log) => {
                    self.ids.observe_file_id(log.file_id());
                    loaded.insert(self.key(&short_name), Arc::new(log));
                }
                Err(e) => warn!("Skipping archive {:?}: {}", entry.path(), e),
            }
        }
        debug!("Loaded {} archives for {}::{}", loaded.len(), self.project, self.appended_path);
        *self.archives.write().unwrap_or_else(|e| e.into_inner()) = loaded;
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn key(&self, short_name: &str) -> String {
        archive_key(short_name, self.properties.ignore_case)
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn directory_id(&self) -> i32 {
        self.directory_id
    }

    pub fn properties(&self) -> &ProjectProperties {
        &self.properties
    }

    pub fn most_recent_activity_date(&self) -> Option<DateTime<Utc>> {
        *self.most_recent_activity.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Oldest check-in across every archive in the directory
    pub fn oldest_revision_date(&self) -> Option<DateTime<Utc>> {
        self.archives().iter().filter_map(|log| log.oldest_revision_date()).min()
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub fn add_listener(&self, listener: Arc<dyn DirectoryListener>) {
        self.notifier.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn DirectoryListener>) {
        self.notifier.remove_listener(listener);
    }

    pub fn set_fast_notify(&self, fast: bool) {
        self.notifier.set_fast_notify(fast);
    }

    pub fn set_directory_merge(&self, merge: std::sync::Weak<dyn DirectoryMerge>) {
        self.notifier.set_merge(merge);
    }

    pub fn add_event_listener(&self, listener: Arc<dyn ArchiveEventListener>) {
        self.event_listeners.write().unwrap_or_else(|e| e.into_inner()).push(listener);
    }

    pub fn archive(&self, short_name: &str) -> Option<Arc<LogFile>> {
        self.archives.read().unwrap_or_else(|e| e.into_inner()).get(&self.key(short_name)).cloned()
    }

    fn require(&self, short_name: &str) -> Result<Arc<LogFile>> {
        self.archive(short_name).ok_or_else(|| QvcsError::ArchiveNotFound(format!("{}/{}", self.appended_path, short_name)))
    }

    pub fn archives(&self) -> Vec<Arc<LogFile>> {
        self.archives.read().unwrap_or_else(|e| e.into_inner()).values().cloned().collect()
    }

    /// Skinny view of every archive, as sent to a newly registered client
    pub fn skinny_list(&self, branch_id: i32) -> Vec<SkinnyLogfileInfo> {
        self.archives().iter().map(|log| log.skinny(branch_id)).collect()
    }

    fn insert(&self, short_name: &str, log: Arc<LogFile>) {
        self.archives.write().unwrap_or_else(|e| e.into_inner()).insert(self.key(short_name), log);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn take(&self, short_name: &str) -> Option<Arc<LogFile>> {
        let removed = self.archives.write().unwrap_or_else(|e| e.into_inner()).remove(&self.key(short_name));
        if removed.is_some() {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        removed
    }

    fn touch(&self) {
        let now = Utc::now();
        let mut latest = self.most_recent_activity.write().unwrap_or_else(|e| e.into_inner());
        if latest.is_none_or(|t| t < now) {
            *latest = Some(now);
        }
    }

    fn emit(&self, event: ArchiveEvent) {
        self.touch();
        let listeners = self.event_listeners.read().unwrap_or_else(|e| e.into_inner()).clone();
        for listener in listeners {
            listener.archive_event(&self.project, &self.appended_path, &event);
        }
        self.notifier.notify();
    }

    fn refresh_reference_copy(&self, log: &LogFile) {
        if let Some(references) = &self.references {
            match log.fetch_default() {
                Ok(content) => references.write(&self.appended_path, &log.short_workfile_name(), &content),
                Err(e) => warn!("No reference copy for {}: {}", log.short_workfile_name(), e),
            }
        }
    }

    fn archive_path(&self, short_name: &str) -> PathBuf {
        self.directory.join(workfile_to_archive_name(short_name))
    }

    pub fn create_archive(&self, request: NewArchive<'_>) -> Result<Arc<LogFile>> {
        if self.is_cemetery() {
            return Err(QvcsError::UnsupportedOperation("create archive in cemetery".into()));
        }
        let _guard = self.create_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.archive(request.short_workfile_name).is_some() {
            return Err(QvcsError::ArchiveExists(request.short_workfile_name.to_string()));
        }
        let file_id = self.ids.allocate_file_id()?;
        let log = LogFile::create(
            &self.archive_path(request.short_workfile_name),
            CreateArchive {
                short_workfile_name: request.short_workfile_name,
                file_id,
                user: request.user,
                content: request.content,
                description: request.description,
                module_description: request.module_description,
                attributes: request.attributes.unwrap_or_else(|| self.properties.attributes()),
                edit_date: request.edit_date,
                lock: request.lock,
            },
            self.properties.compression,
        )?;
        let log = Arc::new(log);
        self.insert(request.short_workfile_name, Arc::clone(&log));
        self.refresh_reference_copy(&log);
        info!("Created archive {}/{} (file id {})", self.appended_path, request.short_workfile_name, file_id);
        self.emit(ArchiveEvent::Create(log.skinny(TRUNK_BRANCH_ID)));
        Ok(log)
    }

    pub fn check_in(&self, short_name: &str, request: CheckIn<'_>) -> Result<Option<String>> {
        let log = self.require(short_name)?;
        let revision = log.check_in(request)?;
        self.refresh_reference_copy(&log);
        let skinny = log.skinny(TRUNK_BRANCH_ID);
        self.emit(if revision.is_some() { ArchiveEvent::CheckIn(skinny) } else { ArchiveEvent::Unlock(skinny) });
        Ok(revision)
    }

    pub fn fetch(&self, short_name: &str, revision: Option<&str>) -> Result<Vec<u8>> {
        let log = self.require(short_name)?;
        match revision {
            Some(revision) => log.fetch_revision(revision),
            None => log.fetch_default(),
        }
    }

    /// Lock `revision` (the default revision when `None`) and return the
    /// revision locked.
    pub fn lock(&self, short_name: &str, user: &str, revision: Option<&str>) -> Result<String> {
        let log = self.require(short_name)?;
        let revision = revision.map(str::to_string).unwrap_or_else(|| log.default_revision_string());
        log.lock(user, &revision)?;
        self.emit(ArchiveEvent::Lock(log.skinny(TRUNK_BRANCH_ID)));
        Ok(revision)
    }

    pub fn unlock(&self, short_name: &str, user: &str, revision: Option<&str>) -> Result<String> {
        let log = self.require(short_name)?;
        let revision = match revision {
            Some(revision) => revision.to_string(),
            None => log
                .locked_revision(user)
                .ok_or_else(|| QvcsError::NotLocked { revision: log.default_revision_string(), user: user.to_string() })?,
        };
        log.unlock(user, &revision)?;
        self.emit(ArchiveEvent::Unlock(log.skinny(TRUNK_BRANCH_ID)));
        Ok(revision)
    }

    pub fn break_lock(&self, short_name: &str, revision: &str) -> Result<()> {
        let log = self.require(short_name)?;
        log.break_lock(revision)?;
        self.emit(ArchiveEvent::Unlock(log.skinny(TRUNK_BRANCH_ID)));
        Ok(())
    }

    pub fn set_revision_description(&self, short_name: &str, revision: &str, description: &str) -> Result<()> {
        let log = self.require(short_name)?;
        log.set_revision_description(revision, description)?;
        self.emit(ArchiveEvent::SetRevisionDescription {
            skinny: log.skinny(TRUNK_BRANCH_ID),
            revision: revision.to_string(),
            description: description.to_string(),
        });
        Ok(())
    }

    pub fn add_label(&self, short_name: &str, user: &str, label: &str, revision: &str, floating: bool) -> Result<()> {
        let log = self.require(short_name)?;
        log.add_label(user, label, revision, floating)?;
        self.emit(ArchiveEvent::Label(log.skinny(TRUNK_BRANCH_ID)));
        Ok(())
    }

    pub fn remove_label(&self, short_name: &str, label: &str) -> Result<bool> {
        let log = self.require(short_name)?;
        let removed = log.remove_label(label)?;
        if removed {
            self.emit(ArchiveEvent::UnLabel(log.skinny(TRUNK_BRANCH_ID)));
        }
        Ok(removed)
    }

    pub fn set_attributes(&self, short_name: &str, attributes: ArchiveAttributes) -> Result<()> {
        let log = self.require(short_name)?;
        log.set_attributes(attributes)?;
        self.emit(ArchiveEvent::ChangeHeader(log.skinny(TRUNK_BRANCH_ID)));
        Ok(())
    }

    pub fn set_module_description(&self, short_name: &str, description: &str) -> Result<()> {
        let log = self.require(short_name)?;
        log.set_module_description(description)?;
        self.emit(ArchiveEvent::ChangeHeader(log.skinny(TRUNK_BRANCH_ID)));
        Ok(())
    }

    pub fn set_comment_prefix(&self, short_name: &str, prefix: &str) -> Result<()> {
        let log = self.require(short_name)?;
        log.set_comment_prefix(prefix)?;
        self.emit(ArchiveEvent::ChangeHeader(log.skinny(TRUNK_BRANCH_ID)));
        Ok(())
    }

    pub fn rename_archive(&self, old_name: &str, new_name: &str) -> Result<()> {
        if self.is_cemetery() {
            return Err(QvcsError::UnsupportedOperation("rename in cemetery".into()));
        }
        if self.archive(new_name).is_some() {
            return Err(QvcsError::ArchiveExists(new_name.to_string()));
        }
        let log = self.take(old_name).ok_or_else(|| QvcsError::ArchiveNotFound(old_name.to_string()))?;
        if let Err(e) = log.relocate(&self.archive_path(new_name), new_name) {
            self.insert(old_name, log);
            return Err(e);
        }
        self.insert(new_name, Arc::clone(&log));
        if let Some(references) = &self.references {
            references.delete(&self.appended_path, old_name);
        }
        self.refresh_reference_copy(&log);
        self.emit(ArchiveEvent::Rename { old_name: old_name.to_string(), skinny: log.skinny(TRUNK_BRANCH_ID) });
        Ok(())
    }

    /// Move an archive to another directory of the same project.
    pub fn move_archive(&self, short_name: &str, target: &ArchiveDirManager) -> Result<()> {
        if self.is_cemetery() || target.is_cemetery() {
            return Err(QvcsError::UnsupportedOperation("move into or out of cemetery".into()));
        }
        if target.appended_path == self.appended_path {
            return Ok(());
        }
        let _guard = self.move_lock.lock().unwrap_or_else(|e| e.into_inner());
        if target.archive(short_name).is_some() {
            return Err(QvcsError::ArchiveExists(format!("{}/{}", target.appended_path, short_name)));
        }
        let log = self.take(short_name).ok_or_else(|| QvcsError::ArchiveNotFound(short_name.to_string()))?;
        if let Err(e) = log.relocate(&target.archive_path(short_name), short_name) {
            self.insert(short_name, log);
            return Err(e);
        }
        target.insert(short_name, Arc::clone(&log));
        if let Some(references) = &self.references {
            references.delete(&self.appended_path, short_name);
        }
        target.refresh_reference_copy(&log);
        let event = ArchiveEvent::MoveFile {
            origin: self.appended_path.clone(),
            destination: target.appended_path.clone(),
            skinny: log.skinny(TRUNK_BRANCH_ID),
        };
        self.emit(event.clone());
        target.emit(event);
        Ok(())
    }

    /// Move an archive into the project cemetery. Refused while any
    /// revision is locked.
    pub fn delete_archive(&self, short_name: &str, cemetery: &ArchiveDirManager) -> Result<String> {
        if self.is_cemetery() || !cemetery.is_cemetery() {
            return Err(QvcsError::UnsupportedOperation("delete needs a live directory and the cemetery".into()));
        }
        let _guard = self.move_lock.lock().unwrap_or_else(|e| e.into_inner());
        let log = self.require(short_name)?;
        if log.lock_count() > 0 {
            return Err(QvcsError::ArchiveLocked(short_name.to_string()));
        }
        let cemetery_name = cemetery_archive_name(log.file_id());
        self.take(short_name);
        if let Err(e) = log.relocate(&cemetery.directory.join(&cemetery_name), &cemetery_name) {
            self.insert(short_name, log);
            return Err(e);
        }
        cemetery.insert(&cemetery_name, Arc::clone(&log));
        if let Some(references) = &self.references {
            references.delete(&self.appended_path, short_name);
        }
        info!("Deleted {}/{} into {}", self.appended_path, short_name, cemetery_name);
        self.emit(ArchiveEvent::Remove { short_name: short_name.to_string(), file_id: log.file_id() });
        cemetery.emit(ArchiveEvent::Create(log.skinny(TRUNK_BRANCH_ID)));
        Ok(cemetery_name)
    }

    /// Restore a cemetery archive into `target` under `short_name`. Called
    /// on the cemetery manager.
    pub fn undelete_archive(&self, cemetery_name: &str, target: &ArchiveDirManager, short_name: &str) -> Result<()> {
        if !self.is_cemetery() || target.is_cemetery() {
            return Err(QvcsError::UnsupportedOperation("undelete must run from the cemetery".into()));
        }
        let _guard = self.move_lock.lock().unwrap_or_else(|e| e.into_inner());
        if target.archive(short_name).is_some() {
            return Err(QvcsError::ArchiveExists(short_name.to_string()));
        }
        let log = self.take(cemetery_name).ok_or_else(|| QvcsError::ArchiveNotFound(cemetery_name.to_string()))?;
        if let Err(e) = log.relocate(&target.archive_path(short_name), short_name) {
            self.insert(cemetery_name, log);
            return Err(e);
        }
        target.insert(short_name, Arc::clone(&log));
        target.refresh_reference_copy(&log);
        self.emit(ArchiveEvent::Remove { short_name: cemetery_name.to_string(), file_id: log.file_id() });
        target.emit(ArchiveEvent::Create(log.skinny(TRUNK_BRANCH_ID)));
        Ok(())
    }
}

impl ArchiveDirectory for ArchiveDirManager {
    fn appended_path(&self) -> String {
        self.appended_path.clone()
    }

    fn archive_infos(&self) -> Vec<Arc<dyn ArchiveInfo>> {
        self.archives().into_iter().map(|log| log as Arc<dyn ArchiveInfo>).collect()
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// Hands out one [`ArchiveDirManager`] per project directory.
pub struct ArchiveDirManagerFactory {
    archive_root: PathBuf,
    notify_delay: Duration,
    move_lock: Arc<Mutex<()>>,
    projects: RwLock<HashMap<String, ProjectProperties>>,
    ids: RwLock<HashMap<String, Arc<ProjectIds>>>,
    managers: RwLock<HashMap<String, Arc<ArchiveDirManager>>>,
    event_listeners: RwLock<Vec<Arc<dyn ArchiveEventListener>>>,
}

impl ArchiveDirManagerFactory {
    pub fn new(config: &ServerConfig) -> Self {
        let projects = config.projects.iter().map(|p| (p.project_name.clone(), p.clone())).collect();
        Self {
            archive_root: config.archive_root.clone(),
            notify_delay: config.notify_delay(),
            move_lock: Arc::new(Mutex::new(())),
            projects: RwLock::new(projects),
            ids: RwLock::new(HashMap::new()),
            managers: RwLock::new(HashMap::new()),
            event_listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn archive_root(&self) -> &Path {
        &self.archive_root
    }

    pub fn project_root(&self, project: &str) -> PathBuf {
        self.archive_root.join(project)
    }

    pub fn add_project(&self, properties: ProjectProperties) {
        self.projects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(properties.project_name.clone(), properties);
    }

    pub fn project(&self, project: &str) -> Result<ProjectProperties> {
        self.projects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(project)
            .cloned()
            .ok_or_else(|| QvcsError::Config(format!("unknown project {}", project)))
    }

    pub fn project_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.projects.read().unwrap_or_else(|e| e.into_inner()).keys().cloned().collect();
        names.sort();
        names
    }

    /// Listener attached to every manager, present and future.
    pub fn add_event_listener(&self, listener: Arc<dyn ArchiveEventListener>) {
        for manager in self.managers.read().unwrap_or_else(|e| e.into_inner()).values() {
            manager.add_event_listener(Arc::clone(&listener));
        }
        self.event_listeners.write().unwrap_or_else(|e| e.into_inner()).push(listener);
    }

    fn project_ids(&self, project: &str) -> Result<Arc<ProjectIds>> {
        if let Some(ids) = self.ids.read().unwrap_or_else(|e| e.into_inner()).get(project) {
            return Ok(Arc::clone(ids));
        }
        let mut ids = self.ids.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = ids.get(project) {
            return Ok(Arc::clone(existing));
        }
        let loaded = Arc::new(ProjectIds::load(&self.project_root(project))?);
        ids.insert(project.to_string(), Arc::clone(&loaded));
        Ok(loaded)
    }

    fn directory_path(&self, project: &str, appended_path: &str) -> PathBuf {
        let mut path = self.project_root(project);
        for segment in appended_path.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }

    /// Manager for `project`/`appended_path`, opening it on first use.
    pub fn manager(&self, project: &str, appended_path: &str) -> Result<Arc<ArchiveDirManager>> {
        let appended_path = standard_path(appended_path);
        let key = format!("{}::{}", project, appended_path);
        if let Some(manager) = self.managers.read().unwrap_or_else(|e| e.into_inner()).get(&key) {
            return Ok(Arc::clone(manager));
        }
        let properties = self.project(project)?;
        let ids = self.project_ids(project)?;

        let mut managers = self.managers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(manager) = managers.get(&key) {
            return Ok(Arc::clone(manager));
        }
        let manager = ArchiveDirManager::open(
            project,
            &appended_path,
            self.directory_path(project, &appended_path),
            properties,
            ids,
            Arc::clone(&self.move_lock),
            self.notify_delay,
        )?;
        for listener in self.event_listeners.read().unwrap_or_else(|e| e.into_inner()).iter() {
            manager.add_event_listener(Arc::clone(listener));
        }
        let manager = Arc::new(manager);
        managers.insert(key, Arc::clone(&manager));
        Ok(manager)
    }

    pub fn create_directory(&self, project: &str, appended_path: &str) -> Result<Arc<ArchiveDirManager>> {
        let appended_path = standard_path(appended_path);
        if appended_path == CEMETERY_APPENDED_PATH {
            return Err(QvcsError::UnsupportedOperation("create cemetery directory".into()));
        }
        self.project(project)?;
        fs::create_dir_all(self.directory_path(project, &appended_path))?;
        self.manager(project, &appended_path)
    }

    pub fn cemetery(&self, project: &str) -> Result<Arc<ArchiveDirManager>> {
        self.manager(project, CEMETERY_APPENDED_PATH)
    }

    /// Directories with an open manager, as `(project, appended path)`
    pub fn open_directories(&self) -> Vec<(String, String)> {
        let mut open: Vec<(String, String)> = self
            .managers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|m| (m.project.clone(), m.appended_path.clone()))
            .collect();
        open.sort();
        open
    }
}
