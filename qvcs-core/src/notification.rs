//! Archive change events and their delivery to connected clients
//!
//! Server-side directory managers emit [`ArchiveEvent`]s. The
//! [`NotificationManager`] turns each event into a [`ServerNotification`]
//! for every client listening on that directory and sends the queued batch
//! from a spawned task after a short delay.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{QvcsError, Result};
use crate::skinny::SkinnyLogfileInfo;

pub const DEFAULT_SEND_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    CheckIn,
    CheckOut,
    Lock,
    Unlock,
    Create,
    MoveFile,
    SetRevisionDescription,
    Remove,
    Rename,
    ChangeHeader,
    Label,
    UnLabel,
}

/// Something that happened to one archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveEvent {
    CheckIn(SkinnyLogfileInfo),
    CheckOut(SkinnyLogfileInfo),
    Lock(SkinnyLogfileInfo),
    Unlock(SkinnyLogfileInfo),
    Create(SkinnyLogfileInfo),
    MoveFile { origin: String, destination: String, skinny: SkinnyLogfileInfo },
    SetRevisionDescription { skinny: SkinnyLogfileInfo, revision: String, description: String },
    Remove { short_name: String, file_id: i32 },
    Rename { old_name: String, skinny: SkinnyLogfileInfo },
    ChangeHeader(SkinnyLogfileInfo),
    Label(SkinnyLogfileInfo),
    UnLabel(SkinnyLogfileInfo),
}

impl ArchiveEvent {
    pub fn action(&self) -> ActionType {
        match self {
            ArchiveEvent::CheckIn(_) => ActionType::CheckIn,
            ArchiveEvent::CheckOut(_) => ActionType::CheckOut,
            ArchiveEvent::Lock(_) => ActionType::Lock,
            ArchiveEvent::Unlock(_) => ActionType::Unlock,
            ArchiveEvent::Create(_) => ActionType::Create,
            ArchiveEvent::MoveFile { .. } => ActionType::MoveFile,
            ArchiveEvent::SetRevisionDescription { .. } => ActionType::SetRevisionDescription,
            ArchiveEvent::Remove { .. } => ActionType::Remove,
            ArchiveEvent::Rename { .. } => ActionType::Rename,
            ArchiveEvent::ChangeHeader(_) => ActionType::ChangeHeader,
            ArchiveEvent::Label(_) => ActionType::Label,
            ArchiveEvent::UnLabel(_) => ActionType::UnLabel,
        }
    }

    fn skinny(&self) -> Option<&SkinnyLogfileInfo> {
        match self {
            ArchiveEvent::CheckIn(s)
            | ArchiveEvent::CheckOut(s)
            | ArchiveEvent::Lock(s)
            | ArchiveEvent::Unlock(s)
            | ArchiveEvent::Create(s)
            | ArchiveEvent::ChangeHeader(s)
            | ArchiveEvent::Label(s)
            | ArchiveEvent::UnLabel(s) => Some(s),
            ArchiveEvent::MoveFile { skinny, .. }
            | ArchiveEvent::SetRevisionDescription { skinny, .. }
            | ArchiveEvent::Rename { skinny, .. } => Some(skinny),
            ArchiveEvent::Remove { .. } => None,
        }
    }
}

/// Receives every event from a server-side directory manager.
pub trait ArchiveEventListener: Send + Sync {
    fn archive_event(&self, project: &str, appended_path: &str, event: &ArchiveEvent);
}

/// What a client is told
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    CheckIn(SkinnyLogfileInfo),
    Create(SkinnyLogfileInfo),
    MoveFile { origin: String, destination: String, skinny: SkinnyLogfileInfo },
    SetRevisionDescription { skinny: SkinnyLogfileInfo, revision: String, description: String },
    Remove { short_name: String, file_id: i32 },
    Rename { old_name: String, skinny: SkinnyLogfileInfo },
    /// Locks, labels and attribute changes
    HeaderChange(SkinnyLogfileInfo),
}

impl NotificationKind {
    pub fn short_name(&self) -> &str {
        match self {
            NotificationKind::Remove { short_name, .. } => short_name,
            NotificationKind::CheckIn(skinny)
            | NotificationKind::Create(skinny)
            | NotificationKind::HeaderChange(skinny)
            | NotificationKind::MoveFile { skinny, .. }
            | NotificationKind::SetRevisionDescription { skinny, .. }
            | NotificationKind::Rename { skinny, .. } => &skinny.short_workfile_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirectoryCoordinate {
    pub project: String,
    pub branch: String,
    pub appended_path: String,
}

impl DirectoryCoordinate {
    pub fn new(project: &str, branch: &str, appended_path: &str) -> Self {
        Self { project: project.to_string(), branch: branch.to_string(), appended_path: appended_path.to_string() }
    }

    /// `project::branch::path`
    pub fn key(&self) -> String {
        format!("{}::{}::{}", self.project, self.branch, self.appended_path)
    }
}

impl fmt::Display for DirectoryCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerNotification {
    pub coordinate: DirectoryCoordinate,
    pub kind: NotificationKind,
}

/// `server::ip::port`
pub fn client_key(server_name: &str, addr: SocketAddr) -> String {
    format!("{}::{}::{}", server_name, addr.ip(), addr.port())
}

/// One client's interest in one directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryCoordinateListener {
    pub client_key: String,
    pub coordinate: DirectoryCoordinate,
}

impl DirectoryCoordinateListener {
    pub fn new(client_key: &str, coordinate: DirectoryCoordinate) -> Self {
        Self { client_key: client_key.to_string(), coordinate }
    }

    pub fn matches(&self, project: &str, appended_path: &str) -> bool {
        self.coordinate.project == project && self.coordinate.appended_path == appended_path
    }

    /// Translate an archive event for this listener. Events without their
    /// own notification kind become header changes.
    pub fn notification_for(&self, event: &ArchiveEvent) -> Option<ServerNotification> {
        let kind = match event.clone() {
            ArchiveEvent::CheckIn(skinny) => NotificationKind::CheckIn(skinny),
            ArchiveEvent::Create(skinny) => NotificationKind::Create(skinny),
            ArchiveEvent::MoveFile { origin, destination, skinny } => {
                NotificationKind::MoveFile { origin, destination, skinny }
            }
            ArchiveEvent::SetRevisionDescription { skinny, revision, description } => {
                NotificationKind::SetRevisionDescription { skinny, revision, description }
            }
            ArchiveEvent::Remove { short_name, file_id } => NotificationKind::Remove { short_name, file_id },
            ArchiveEvent::Rename { old_name, skinny } => NotificationKind::Rename { old_name, skinny },
            other => NotificationKind::HeaderChange(other.skinny()?.clone()),
        };
        Some(ServerNotification { coordinate: self.coordinate.clone(), kind })
    }
}

#[derive(Default)]
struct ClientEntry {
    sender: Option<mpsc::UnboundedSender<ServerNotification>>,
    coordinates: HashSet<String>,
}

/// Notifications waiting for the delayed send, and whether a send task is
/// already scheduled. Both change under one lock.
#[derive(Default)]
struct PendingSends {
    queue: Vec<(String, ServerNotification)>,
    flush_scheduled: bool,
}

struct Inner {
    delay: Duration,
    listeners: RwLock<HashMap<String, Vec<DirectoryCoordinateListener>>>,
    clients: RwLock<HashMap<String, ClientEntry>>,
    pending: Mutex<PendingSends>,
}

impl Inner {
    /// Take everything queued so far. Anything queued afterwards schedules
    /// its own send.
    fn take_batch(&self) -> Vec<(String, ServerNotification)> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.flush_scheduled = false;
        std::mem::take(&mut pending.queue)
    }

    fn flush(&self) {
        let batch = self.take_batch();
        self.send(batch);
    }

    fn send(&self, batch: Vec<(String, ServerNotification)>) {
        let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
        for (client_key, notification) in batch {
            let Some(sender) = clients.get(&client_key).and_then(|c| c.sender.as_ref()) else {
                debug!("Dropping notification for departed client {}", client_key);
                continue;
            };
            if sender.send(notification).is_err() {
                debug!("Client {} stopped receiving notifications", client_key);
            }
        }
    }
}

/// Tracks which client listens on which directory and delivers
/// notifications to them.
#[derive(Clone)]
pub struct NotificationManager {
    inner: Arc<Inner>,
}

impl Default for NotificationManager {
    fn default() -> Self {
        Self::new(DEFAULT_SEND_DELAY)
    }
}

impl NotificationManager {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                delay,
                listeners: RwLock::new(HashMap::new()),
                clients: RwLock::new(HashMap::new()),
                pending: Mutex::new(PendingSends::default()),
            }),
        }
    }

    /// Attach the channel notifications for `client_key` are sent on.
    pub fn register_client(&self, client_key: &str, sender: mpsc::UnboundedSender<ServerNotification>) {
        self.inner
            .clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(client_key.to_string())
            .or_default()
            .sender = Some(sender);
    }

    pub fn add_listener(&self, client_key: &str, coordinate: DirectoryCoordinate) {
        let key = coordinate.key();
        {
            let mut listeners = self.inner.listeners.write().unwrap_or_else(|e| e.into_inner());
            let entry = listeners.entry(key.clone()).or_default();
            if !entry.iter().any(|l| l.client_key == client_key) {
                entry.push(DirectoryCoordinateListener::new(client_key, coordinate));
            }
        }
        self.inner
            .clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(client_key.to_string())
            .or_default()
            .coordinates
            .insert(key);
    }

    pub fn remove_listener(&self, client_key: &str, coordinate: &DirectoryCoordinate) -> Result<()> {
        let key = coordinate.key();
        let mut listeners = self.inner.listeners.write().unwrap_or_else(|e| e.into_inner());
        let entry = listeners.get_mut(&key).ok_or_else(|| QvcsError::ListenerNotFound(key.clone()))?;
        let before = entry.len();
        entry.retain(|l| l.client_key != client_key);
        if entry.len() == before {
            return Err(QvcsError::ListenerNotFound(key));
        }
        if entry.is_empty() {
            listeners.remove(&key);
        }
        if let Some(client) = self.inner.clients.write().unwrap_or_else(|e| e.into_inner()).get_mut(client_key) {
            client.coordinates.remove(&key);
        }
        Ok(())
    }

    /// Forget a client and every directory it listened on.
    pub fn remove_client(&self, client_key: &str) {
        let Some(client) = self.inner.clients.write().unwrap_or_else(|e| e.into_inner()).remove(client_key) else {
            return;
        };
        let mut listeners = self.inner.listeners.write().unwrap_or_else(|e| e.into_inner());
        for key in client.coordinates {
            if let Some(entry) = listeners.get_mut(&key) {
                entry.retain(|l| l.client_key != client_key);
                if entry.is_empty() {
                    listeners.remove(&key);
                }
            }
        }
        debug!("Removed notification client {}", client_key);
    }

    pub fn listener_count(&self, coordinate: &DirectoryCoordinate) -> usize {
        self.inner.listeners.read().unwrap_or_else(|e| e.into_inner()).get(&coordinate.key()).map_or(0, Vec::len)
    }

    pub fn client_coordinates(&self, client_key: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(client_key)
            .map(|c| c.coordinates.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    fn queue(&self, notifications: Vec<(String, ServerNotification)>) {
        if notifications.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime for delayed notification send; sending now");
            self.inner.pending.lock().unwrap_or_else(|e| e.into_inner()).queue.extend(notifications);
            self.inner.flush();
            return;
        };
        {
            let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.queue.extend(notifications);
            if pending.flush_scheduled {
                return;
            }
            pending.flush_scheduled = true;
        }
        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            tokio::time::sleep(inner.delay).await;
            inner.flush();
        });
    }
}

impl ArchiveEventListener for NotificationManager {
    fn archive_event(&self, project: &str, appended_path: &str, event: &ArchiveEvent) {
        let notifications: Vec<(String, ServerNotification)> = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .flatten()
            .filter(|l| l.matches(project, appended_path))
            .filter_map(|l| l.notification_for(event).map(|n| (l.client_key.clone(), n)))
            .collect();
        debug!(
            "{:?} on {}::{} queued for {} listeners",
            event.action(),
            project,
            appended_path,
            notifications.len()
        );
        self.queue(notifications);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skinny(name: &str) -> SkinnyLogfileInfo {
        SkinnyLogfileInfo::new(name, 42, 1)
    }

    fn listener() -> DirectoryCoordinateListener {
        DirectoryCoordinateListener::new("srv::127.0.0.1::5000", DirectoryCoordinate::new("demo", "Trunk", "src"))
    }

    #[test]
    fn test_keys() {
        assert_eq!(DirectoryCoordinate::new("demo", "Trunk", "src/a").key(), "demo::Trunk::src/a");
        assert_eq!(client_key("srv", "10.0.0.2:9889".parse().unwrap()), "srv::10.0.0.2::9889");
    }

    #[test]
    fn test_action_mapping() {
        let l = listener();
        let kind = |e: ArchiveEvent| l.notification_for(&e).unwrap().kind;
        assert!(matches!(kind(ArchiveEvent::CheckIn(skinny("a"))), NotificationKind::CheckIn(_)));
        assert!(matches!(kind(ArchiveEvent::Create(skinny("a"))), NotificationKind::Create(_)));
        assert!(matches!(
            kind(ArchiveEvent::Rename { old_name: "b".into(), skinny: skinny("a") }),
            NotificationKind::Rename { .. }
        ));
        assert!(matches!(
            kind(ArchiveEvent::Remove { short_name: "a".into(), file_id: 42 }),
            NotificationKind::Remove { file_id: 42, .. }
        ));
        for event in [
            ArchiveEvent::Lock(skinny("a")),
            ArchiveEvent::Unlock(skinny("a")),
            ArchiveEvent::CheckOut(skinny("a")),
            ArchiveEvent::Label(skinny("a")),
            ArchiveEvent::UnLabel(skinny("a")),
            ArchiveEvent::ChangeHeader(skinny("a")),
        ] {
            assert!(matches!(kind(event), NotificationKind::HeaderChange(_)));
        }
    }

    #[test]
    fn test_remove_unknown_listener() {
        let manager = NotificationManager::default();
        let coordinate = DirectoryCoordinate::new("demo", "Trunk", "src");
        assert!(matches!(manager.remove_listener("c", &coordinate), Err(QvcsError::ListenerNotFound(_))));
        manager.add_listener("c", coordinate.clone());
        assert!(matches!(manager.remove_listener("other", &coordinate), Err(QvcsError::ListenerNotFound(_))));
        manager.remove_listener("c", &coordinate).unwrap();
        assert_eq!(manager.listener_count(&coordinate), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_delivery_to_matching_listeners() {
        let manager = NotificationManager::new(Duration::from_secs(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.register_client("c1", tx);
        manager.add_listener("c1", DirectoryCoordinate::new("demo", "Trunk", "src"));
        manager.add_listener("c1", DirectoryCoordinate::new("demo", "feature", "src"));
        manager.add_listener("c1", DirectoryCoordinate::new("demo", "Trunk", "lib"));

        manager.archive_event("demo", "src", &ArchiveEvent::CheckIn(skinny("a.c")));
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let mut branches = vec![rx.recv().await.unwrap().coordinate.branch, rx.recv().await.unwrap().coordinate.branch];
        branches.sort();
        assert_eq!(branches, vec!["Trunk", "feature"]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_client_gets_nothing() {
        let manager = NotificationManager::new(Duration::from_secs(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.register_client("c1", tx);
        let coordinate = DirectoryCoordinate::new("demo", "Trunk", "src");
        manager.add_listener("c1", coordinate.clone());
        assert_eq!(manager.client_coordinates("c1"), vec![coordinate.key()]);
        manager.remove_client("c1");
        assert_eq!(manager.listener_count(&coordinate), 0);
        manager.archive_event("demo", "src", &ArchiveEvent::Create(skinny("a.c")));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_arriving_mid_flush_gets_its_own_send() {
        let manager = NotificationManager::new(Duration::from_secs(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.register_client("c1", tx);
        manager.add_listener("c1", DirectoryCoordinate::new("demo", "Trunk", "src"));
        let name = |n: ServerNotification| match n.kind {
            NotificationKind::CheckIn(skinny) => skinny.short_workfile_name,
            other => panic!("unexpected {:?}", other),
        };

        // A send task is due and has just taken its batch.
        manager.inner.pending.lock().unwrap().flush_scheduled = true;
        manager.archive_event("demo", "src", &ArchiveEvent::CheckIn(skinny("a.c")));
        let batch = manager.inner.take_batch();
        manager.archive_event("demo", "src", &ArchiveEvent::CheckIn(skinny("b.c")));
        manager.inner.send(batch);

        assert_eq!(name(rx.recv().await.unwrap()), "a.c");
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(name(rx.recv().await.unwrap()), "b.c");
        assert!(!manager.inner.pending.lock().unwrap().flush_scheduled);
    }
}
