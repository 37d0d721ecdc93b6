//! Client-side mirror of a server archive directory
//!
//! An [`ArchiveDirManagerProxy`] never touches archive files. It learns the
//! directory contents from the skinny list it gets when it registers as a
//! listener, and keeps them current from the notifications the server
//! pushes. Mutations go to the server as requests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::archive_info::ArchiveInfo;
use crate::attributes::ArchiveAttributes;
use crate::change_notifier::{ChangeNotifier, DirectoryListener};
use crate::directory_manager::{ArchiveDirectory, DirectoryMerge};
use crate::error::{QvcsError, Result};
use crate::notification::{DirectoryCoordinate, NotificationKind, ServerNotification};
use crate::protocol::{Request, Response};
use crate::proxy_cache::LogFileProxyCache;
use crate::skinny::SkinnyLogfileInfo;
use crate::transport::RequestSender;
use crate::utility::archive_key;

/// Archive state as last reported by the server
pub struct LogFileProxy {
    skinny: RwLock<SkinnyLogfileInfo>,
    directory: Option<ChangeNotifier>,
}

impl std::fmt::Debug for LogFileProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFileProxy").field("skinny", &self.skinny_info()).finish()
    }
}

impl LogFileProxy {
    /// A proxy that belongs to no directory.
    pub fn new(skinny: SkinnyLogfileInfo) -> Self {
        Self { skinny: RwLock::new(skinny), directory: None }
    }

    fn attached(skinny: SkinnyLogfileInfo, directory: ChangeNotifier) -> Self {
        Self { skinny: RwLock::new(skinny), directory: Some(directory) }
    }

    pub fn skinny_info(&self) -> SkinnyLogfileInfo {
        self.skinny.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_skinny_info(&self, skinny: SkinnyLogfileInfo) {
        *self.skinny.write().unwrap_or_else(|e| e.into_inner()) = skinny;
    }

    /// Branch the skinny info was produced for
    pub fn branch_id(&self) -> i32 {
        self.skinny.read().unwrap_or_else(|e| e.into_inner()).branch_id
    }

    /// Tell the owning directory that this archive changed.
    pub fn notify_directory(&self) {
        if let Some(directory) = &self.directory {
            directory.notify();
        }
    }

    fn read<T>(&self, f: impl FnOnce(&SkinnyLogfileInfo) -> T) -> T {
        f(&self.skinny.read().unwrap_or_else(|e| e.into_inner()))
    }
}

impl ArchiveInfo for LogFileProxy {
    fn short_workfile_name(&self) -> String {
        self.read(|s| s.short_workfile_name.clone())
    }

    fn file_id(&self) -> i32 {
        self.read(|s| s.file_id)
    }

    fn attributes(&self) -> ArchiveAttributes {
        self.read(|s| s.attributes)
    }

    fn default_revision_string(&self) -> String {
        self.read(|s| s.default_revision.clone())
    }

    fn default_revision_digest(&self) -> String {
        self.read(|s| s.default_revision_digest.clone())
    }

    fn last_check_in_date(&self) -> Option<DateTime<Utc>> {
        self.read(|s| s.last_check_in)
    }

    fn last_edit_by(&self) -> String {
        self.read(|s| s.last_edit_by.clone())
    }

    fn revision_count(&self) -> usize {
        self.read(|s| s.revision_count)
    }

    fn lock_count(&self) -> usize {
        self.read(|s| s.lock_count)
    }

    fn locked_by(&self) -> String {
        self.read(SkinnyLogfileInfo::locked_by)
    }

    fn locked_revision(&self, user: &str) -> Option<String> {
        self.read(|s| s.locked_revision(user).map(str::to_string))
    }

    fn is_overlap(&self) -> bool {
        self.read(|s| s.overlap)
    }

    fn skinny(&self, _branch_id: i32) -> SkinnyLogfileInfo {
        self.skinny_info()
    }
}

/// Client view of one server directory on one branch.
pub struct ArchiveDirManagerProxy {
    coordinate: DirectoryCoordinate,
    branch_id: i32,
    ignore_case: bool,
    sender: Arc<dyn RequestSender>,
    cache: Arc<LogFileProxyCache>,
    archives: RwLock<BTreeMap<String, Arc<LogFileProxy>>>,
    generation: AtomicU64,
    directory_id: AtomicI32,
    most_recent_activity: RwLock<Option<DateTime<Utc>>>,
    notifier: ChangeNotifier,
}

impl std::fmt::Debug for ArchiveDirManagerProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveDirManagerProxy")
            .field("coordinate", &self.coordinate)
            .field("branch_id", &self.branch_id)
            .finish()
    }
}

impl ArchiveDirManagerProxy {
    pub fn new(
        coordinate: DirectoryCoordinate,
        branch_id: i32,
        ignore_case: bool,
        sender: Arc<dyn RequestSender>,
        cache: Arc<LogFileProxyCache>,
        notify_delay: Duration,
    ) -> Self {
        Self {
            notifier: ChangeNotifier::new(&coordinate.appended_path, notify_delay),
            coordinate,
            branch_id,
            ignore_case,
            sender,
            cache,
            archives: RwLock::new(BTreeMap::new()),
            generation: AtomicU64::new(0),
            directory_id: AtomicI32::new(-1),
            most_recent_activity: RwLock::new(None),
        }
    }

    /// Register with the server as a listener for this directory and load
    /// the archive list it answers with.
    pub async fn start(&self) -> Result<()> {
        let response = self
            .sender
            .request(Request::RegisterListener { coordinate: self.coordinate.clone() })
            .await?;
        let (directory_id, skinny, most_recent_activity) = match response {
            Response::Directory { directory_id, skinny, most_recent_activity } => (directory_id, skinny, most_recent_activity),
            other => return Err(QvcsError::Protocol(format!("unexpected response to listener registration: {:?}", other))),
        };
        self.directory_id.store(directory_id, Ordering::Release);
        if let Some(date) = most_recent_activity {
            self.update_most_recent_activity_date(date);
        }
        debug!("{} starts with {} archives", self.coordinate, skinny.len());
        for info in skinny {
            let name = info.short_workfile_name.clone();
            self.update_archive_info(&name, Some(info))?;
        }
        self.notifier.notify();
        Ok(())
    }

    pub fn coordinate(&self) -> &DirectoryCoordinate {
        &self.coordinate
    }

    pub fn branch_id(&self) -> i32 {
        self.branch_id
    }

    /// Server-assigned id, -1 until [`start`](Self::start) has run
    pub fn directory_id(&self) -> i32 {
        self.directory_id.load(Ordering::Acquire)
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub fn add_listener(&self, listener: Arc<dyn DirectoryListener>) {
        self.notifier.add_listener(listener);
    }

    pub fn set_directory_merge(&self, merge: Weak<dyn DirectoryMerge>) {
        self.notifier.set_merge(merge);
    }

    pub fn most_recent_activity_date(&self) -> Option<DateTime<Utc>> {
        *self.most_recent_activity.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Move the most recent activity date forward; older dates are ignored.
    pub fn update_most_recent_activity_date(&self, date: DateTime<Utc>) {
        let mut latest = self.most_recent_activity.write().unwrap_or_else(|e| e.into_inner());
        if latest.is_none_or(|current| date > current) {
            *latest = Some(date);
        }
    }

    pub fn archive(&self, short_name: &str) -> Option<Arc<LogFileProxy>> {
        self.archives
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&archive_key(short_name, self.ignore_case))
            .cloned()
    }

    pub fn archives(&self) -> Vec<Arc<LogFileProxy>> {
        self.archives.read().unwrap_or_else(|e| e.into_inner()).values().cloned().collect()
    }

    /// Apply a skinny info for `short_name`: `None` drops the file, `Some`
    /// replaces or adds it. Every change also goes to the proxy cache.
    pub fn update_archive_info(&self, short_name: &str, skinny: Option<SkinnyLogfileInfo>) -> Result<()> {
        let key = archive_key(short_name, self.ignore_case);
        match skinny {
            Some(skinny) => {
                if let Some(date) = skinny.last_check_in {
                    self.update_most_recent_activity_date(date);
                }
                let proxy = {
                    let mut archives = self.archives.write().unwrap_or_else(|e| e.into_inner());
                    match archives.get(&key) {
                        Some(existing) => {
                            existing.set_skinny_info(skinny);
                            Arc::clone(existing)
                        }
                        None => {
                            let proxy = Arc::new(LogFileProxy::attached(skinny, self.notifier.clone()));
                            archives.insert(key, Arc::clone(&proxy));
                            proxy
                        }
                    }
                };
                self.generation.fetch_add(1, Ordering::AcqRel);
                self.cache.update_log_file_proxy(self.branch_id, proxy)
            }
            None => {
                let removed = self.archives.write().unwrap_or_else(|e| e.into_inner()).remove(&key);
                if let Some(proxy) = removed {
                    self.generation.fetch_add(1, Ordering::AcqRel);
                    self.cache.remove_log_file_proxy(self.branch_id, proxy.file_id());
                }
                Ok(())
            }
        }
    }

    /// Apply one pushed notification and schedule a directory refresh.
    pub fn apply_notification(&self, notification: &ServerNotification) -> Result<()> {
        match &notification.kind {
            NotificationKind::CheckIn(skinny)
            | NotificationKind::Create(skinny)
            | NotificationKind::HeaderChange(skinny)
            | NotificationKind::SetRevisionDescription { skinny, .. } => {
                self.update_archive_info(&skinny.short_workfile_name, Some(skinny.clone()))?;
            }
            NotificationKind::Remove { short_name, .. } => self.update_archive_info(short_name, None)?,
            NotificationKind::Rename { old_name, skinny } => {
                self.update_archive_info(old_name, None)?;
                self.update_archive_info(&skinny.short_workfile_name, Some(skinny.clone()))?;
            }
            NotificationKind::MoveFile { origin, destination, skinny } => {
                if *origin == self.coordinate.appended_path {
                    self.update_archive_info(&skinny.short_workfile_name, None)?;
                }
                if *destination == self.coordinate.appended_path {
                    self.update_archive_info(&skinny.short_workfile_name, Some(skinny.clone()))?;
                }
            }
        }
        self.notifier.notify();
        Ok(())
    }

    pub async fn create_directory(&self) -> Result<()> {
        self.sender.request(Request::CreateDirectory { coordinate: self.coordinate.clone() }).await?;
        Ok(())
    }

    pub async fn create_archive(
        &self,
        user: &str,
        short_name: &str,
        content: Vec<u8>,
        description: &str,
        attributes: Option<ArchiveAttributes>,
        lock: bool,
    ) -> Result<SkinnyLogfileInfo> {
        let request = Request::CreateArchive {
            coordinate: self.coordinate.clone(),
            short_name: short_name.to_string(),
            user: user.to_string(),
            content,
            description: description.to_string(),
            attributes: attributes.map(|a| a.bits()),
            lock,
        };
        match self.sender.request(request).await? {
            Response::Skinny(skinny) => {
                info!("Created archive {} in {}", short_name, self.coordinate);
                self.update_archive_info(short_name, Some(skinny.clone()))?;
                Ok(skinny)
            }
            other => Err(QvcsError::Protocol(format!("unexpected response to create archive: {:?}", other))),
        }
    }

    pub async fn rename_archive(&self, user: &str, old_name: &str, new_name: &str) -> Result<()> {
        let request = Request::Rename {
            coordinate: self.coordinate.clone(),
            user: user.to_string(),
            old_name: old_name.to_string(),
            new_name: new_name.to_string(),
        };
        match self.sender.request(request).await? {
            Response::Skinny(skinny) => {
                self.update_archive_info(old_name, None)?;
                self.update_archive_info(new_name, Some(skinny))?;
                self.notifier.notify();
                Ok(())
            }
            other => Err(QvcsError::Protocol(format!("unexpected response to rename: {:?}", other))),
        }
    }

    pub fn move_archive(&self, _short_name: &str, _target: &DirectoryCoordinate) -> Result<()> {
        Err(QvcsError::UnsupportedOperation("move archive on a client proxy".into()))
    }

    pub fn delete_archive(&self, _short_name: &str) -> Result<()> {
        Err(QvcsError::UnsupportedOperation("delete archive on a client proxy".into()))
    }

    pub fn undelete_archive(&self, _short_name: &str) -> Result<()> {
        Err(QvcsError::UnsupportedOperation("undelete archive on a client proxy".into()))
    }
}

impl ArchiveDirectory for ArchiveDirManagerProxy {
    fn appended_path(&self) -> String {
        self.coordinate.appended_path.clone()
    }

    fn archive_infos(&self) -> Vec<Arc<dyn ArchiveInfo>> {
        self.archives().into_iter().map(|p| p as Arc<dyn ArchiveInfo>).collect()
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// Routes pushed notifications to the proxy registered for their
/// directory coordinate.
#[derive(Default)]
pub struct ProxyRegistry {
    proxies: RwLock<HashMap<String, Weak<ArchiveDirManagerProxy>>>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, proxy: &Arc<ArchiveDirManagerProxy>) {
        self.proxies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(proxy.coordinate().key(), Arc::downgrade(proxy));
    }

    pub fn unregister(&self, coordinate: &DirectoryCoordinate) {
        self.proxies.write().unwrap_or_else(|e| e.into_inner()).remove(&coordinate.key());
    }

    /// Deliver one notification. Returns false when no live proxy wants it.
    pub fn dispatch(&self, notification: &ServerNotification) -> bool {
        let key = notification.coordinate.key();
        let proxy = self.proxies.read().unwrap_or_else(|e| e.into_inner()).get(&key).and_then(Weak::upgrade);
        let Some(proxy) = proxy else {
            debug!("No proxy for notification on {}", key);
            return false;
        };
        if let Err(e) = proxy.apply_notification(notification) {
            warn!("Failed to apply notification on {}: {}", key, e);
        }
        true
    }

    /// Dispatch until the connection's notification stream ends.
    pub async fn run(&self, mut notifications: mpsc::UnboundedReceiver<ServerNotification>) {
        while let Some(notification) = notifications.recv().await {
            self.dispatch(&notification);
        }
        debug!("Notification stream ended");
    }
}
