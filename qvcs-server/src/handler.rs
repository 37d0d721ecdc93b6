//! Per-connection request handling
//!
//! Each accepted connection gets one reader loop. Requests are answered in
//! the order they arrive, so the order inside a transaction is kept. Archive
//! work runs on the blocking pool while the loop awaits it. Pushed
//! notifications and heartbeats share the connection's single writer task.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use qvcs_core::archive_dir_manager::ArchiveDirManager;
use qvcs_core::archive_info::ArchiveInfo;
use qvcs_core::branch::TRUNK_BRANCH_ID;
use qvcs_core::notification::client_key;
use qvcs_core::protocol::{read_envelope, write_envelope};
use qvcs_core::transport::{run_heartbeat, ActivityMonitor, HeartbeatConfig};
use qvcs_core::{
    ArchiveAttributes, ArchiveDirManagerFactory, CheckIn, DirectoryCoordinate, Envelope, NewArchive,
    NotificationManager, QvcsError, Request, Response, ServerConfig, ServerNotification, SkinnyLogfileInfo,
};

pub struct Server {
    name: String,
    factory: Arc<ArchiveDirManagerFactory>,
    notifications: NotificationManager,
    heartbeat: HeartbeatConfig,
}

impl Server {
    pub fn new(name: &str, config: &ServerConfig) -> Self {
        let factory = Arc::new(ArchiveDirManagerFactory::new(config));
        let notifications = NotificationManager::new(config.notify_delay());
        factory.add_event_listener(Arc::new(notifications.clone()));
        Self {
            name: name.to_string(),
            factory,
            notifications,
            heartbeat: HeartbeatConfig::new(config.heartbeat_interval(), config.heartbeat_timeout_multiple),
        }
    }

    pub fn factory(&self) -> &Arc<ArchiveDirManagerFactory> {
        &self.factory
    }

    /// Serve one client until it disconnects or stops sending anything.
    pub async fn serve<S>(self: Arc<Self>, stream: S, peer: SocketAddr) -> qvcs_core::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let client = client_key(&self.name, peer);
        info!("Client {} connected", client);
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<ServerNotification>();
        self.notifications.register_client(&client, notify_tx);

        let forward_tx = outbound_tx.clone();
        let forward = tokio::spawn(async move {
            while let Some(notification) = notify_rx.recv().await {
                if forward_tx.send(Envelope::Notification(notification)).is_err() {
                    break;
                }
            }
        });
        let writer_task = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                if let Err(e) = write_envelope(&mut writer, &envelope).await {
                    warn!("Write failed: {}", e);
                    break;
                }
            }
        });

        let activity = ActivityMonitor::default();
        let mut open_transactions = HashSet::new();
        let result = {
            let heartbeat = run_heartbeat(self.heartbeat, &activity, &outbound_tx);
            tokio::pin!(heartbeat);
            loop {
                let envelope = tokio::select! {
                    _ = &mut heartbeat => break Ok(()),
                    read = read_envelope(&mut reader) => read,
                };
                activity.touch();
                match envelope {
                    Ok(Some(Envelope::BeginTransaction { transaction_id })) => {
                        open_transactions.insert(transaction_id);
                    }
                    Ok(Some(Envelope::EndTransaction { transaction_id })) => {
                        if !open_transactions.remove(&transaction_id) {
                            debug!("End of unknown transaction {} from {}", transaction_id, client);
                        }
                    }
                    Ok(Some(Envelope::Request { transaction_id, request_id, request })) => {
                        if !open_transactions.contains(&transaction_id) {
                            debug!("Request {} from {} outside an open transaction", request_id, client);
                        }
                        let response = self.handle_blocking(&client, request).await;
                        if outbound_tx.send(Envelope::Response { request_id, response }).is_err() {
                            break Err(QvcsError::ConnectionClosed);
                        }
                    }
                    Ok(Some(Envelope::Heartbeat)) => {}
                    Ok(Some(other)) => debug!("Ignoring unexpected frame from {}: {:?}", client, other),
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
        };

        self.notifications.remove_client(&client);
        forward.abort();
        drop(outbound_tx);
        let _ = writer_task.await;
        info!("Client {} disconnected", client);
        result
    }

    /// Run one request on the blocking pool, since archive requests read
    /// and rewrite files.
    pub async fn handle_blocking(self: &Arc<Self>, client: &str, request: Request) -> Response {
        let name = request.name();
        let server = Arc::clone(self);
        let client = client.to_string();
        let client_for_task = client.clone();
        match tokio::task::spawn_blocking(move || server.handle(&client_for_task, request)).await {
            Ok(response) => response,
            Err(e) => {
                warn!("{} from {} did not complete: {}", name, client, e);
                Response::from_error(&QvcsError::Protocol(format!("{} did not complete", name)))
            }
        }
    }

    /// Run one request. Failures become error responses.
    pub fn handle(&self, client: &str, request: Request) -> Response {
        let name = request.name();
        match self.dispatch(client, request) {
            Ok(response) => response,
            Err(e) => {
                warn!("{} from {} failed: {}", name, client, e);
                Response::from_error(&e)
            }
        }
    }

    fn manager(&self, coordinate: &DirectoryCoordinate) -> qvcs_core::Result<Arc<ArchiveDirManager>> {
        self.factory.manager(&coordinate.project, &coordinate.appended_path)
    }

    fn skinny(manager: &ArchiveDirManager, short_name: &str) -> qvcs_core::Result<SkinnyLogfileInfo> {
        let log = manager.archive(short_name).ok_or_else(|| QvcsError::ArchiveNotFound(short_name.to_string()))?;
        Ok(log.skinny(TRUNK_BRANCH_ID))
    }

    fn dispatch(&self, client: &str, request: Request) -> qvcs_core::Result<Response> {
        debug!("{} from {}", request.name(), client);
        match request {
            Request::RegisterListener { coordinate } => {
                let manager = self.manager(&coordinate)?;
                self.notifications.add_listener(client, coordinate);
                Ok(Response::Directory {
                    directory_id: manager.directory_id(),
                    skinny: manager.skinny_list(TRUNK_BRANCH_ID),
                    most_recent_activity: manager.most_recent_activity_date(),
                })
            }
            Request::UnregisterListener { coordinate } => {
                self.notifications.remove_listener(client, &coordinate)?;
                Ok(Response::Ok)
            }
            Request::CreateDirectory { coordinate } => {
                self.factory.create_directory(&coordinate.project, &coordinate.appended_path)?;
                Ok(Response::Ok)
            }
            Request::CreateArchive { coordinate, short_name, user, content, description, attributes, lock } => {
                let manager = self.manager(&coordinate)?;
                let log = manager.create_archive(NewArchive {
                    user: &user,
                    short_workfile_name: &short_name,
                    content: &content,
                    description: &description,
                    module_description: "",
                    attributes: attributes.map(ArchiveAttributes::from_bits),
                    edit_date: Utc::now(),
                    lock,
                })?;
                Ok(Response::Skinny(log.skinny(TRUNK_BRANCH_ID)))
            }
            Request::CheckIn { coordinate, short_name, user, parent_revision, content, description, keep_locked, label } => {
                let manager = self.manager(&coordinate)?;
                let revision = manager.check_in(
                    &short_name,
                    CheckIn {
                        user: &user,
                        parent_revision: &parent_revision,
                        content: &content,
                        description: &description,
                        edit_date: Utc::now(),
                        keep_locked,
                        label: label.as_deref(),
                    },
                )?;
                let skinny = Self::skinny(&manager, &short_name)?;
                Ok(Response::CheckedIn { revision, skinny })
            }
            Request::GetRevision { coordinate, short_name, revision } => {
                let manager = self.manager(&coordinate)?;
                let content = manager.fetch(&short_name, revision.as_deref())?;
                let revision = match revision {
                    Some(revision) => revision,
                    None => manager
                        .archive(&short_name)
                        .map(|log| log.default_revision_string())
                        .ok_or_else(|| QvcsError::ArchiveNotFound(short_name.clone()))?,
                };
                Ok(Response::Revision { revision, content })
            }
            Request::Lock { coordinate, short_name, user, revision } => {
                let manager = self.manager(&coordinate)?;
                manager.lock(&short_name, &user, revision.as_deref())?;
                Self::skinny(&manager, &short_name).map(Response::Skinny)
            }
            Request::Unlock { coordinate, short_name, user, revision } => {
                let manager = self.manager(&coordinate)?;
                manager.unlock(&short_name, &user, revision.as_deref())?;
                Self::skinny(&manager, &short_name).map(Response::Skinny)
            }
            Request::Rename { coordinate, user, old_name, new_name } => {
                let manager = self.manager(&coordinate)?;
                manager.rename_archive(&old_name, &new_name)?;
                info!("{} renamed {} to {} in {}", user, old_name, new_name, coordinate);
                Self::skinny(&manager, &new_name).map(Response::Skinny)
            }
            Request::SetRevisionDescription { coordinate, short_name, revision, description } => {
                self.manager(&coordinate)?.set_revision_description(&short_name, &revision, &description)?;
                Ok(Response::Ok)
            }
            Request::Label { coordinate, short_name, user, label, revision, floating } => {
                self.manager(&coordinate)?.add_label(&short_name, &user, &label, &revision, floating)?;
                Ok(Response::Ok)
            }
            Request::UnLabel { coordinate, short_name, label } => {
                if !self.manager(&coordinate)?.remove_label(&short_name, &label)? {
                    return Err(QvcsError::RevisionNotFound(format!("label {} on {}", label, short_name)));
                }
                Ok(Response::Ok)
            }
            Request::ListProjects => Ok(Response::Projects(self.factory.project_names())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use qvcs_core::branch::{ClientBranchInfo, ClientBranchManager};
    use qvcs_core::transport::ClientConnection;
    use qvcs_core::{ArchiveDirManagerProxy, LogFileProxyCache, NotificationKind, ProjectProperties};
    use tempfile::TempDir;

    fn server(tmp: &TempDir) -> Arc<Server> {
        let mut config = ServerConfig { archive_root: tmp.path().join("archives"), notify_delay_ms: 20, ..Default::default() };
        config.upsert_project(ProjectProperties::new("demo"));
        Arc::new(Server::new("test", &config))
    }

    fn connect(server: &Arc<Server>, port: u16) -> (ClientConnection, mpsc::UnboundedReceiver<ServerNotification>) {
        let (client, remote) = tokio::io::duplex(256 * 1024);
        let peer: SocketAddr = ([127, 0, 0, 1], port).into();
        tokio::spawn(Arc::clone(server).serve(remote, peer));
        ClientConnection::start(client, HeartbeatConfig::default())
    }

    fn coordinate() -> DirectoryCoordinate {
        DirectoryCoordinate::new("demo", "Trunk", "src")
    }

    #[tokio::test]
    async fn test_create_check_in_fetch() {
        let tmp = TempDir::new().unwrap();
        let server = server(&tmp);
        let (connection, _notifications) = connect(&server, 5001);
        let broker = connection.broker();

        assert_eq!(broker.request(Request::ListProjects).await.unwrap(), Response::Projects(vec!["demo".into()]));
        broker.request(Request::CreateDirectory { coordinate: coordinate() }).await.unwrap();
        let created = broker
            .request(Request::CreateArchive {
                coordinate: coordinate(),
                short_name: "a.c".into(),
                user: "alice".into(),
                content: b"one\n".to_vec(),
                description: "initial".into(),
                attributes: None,
                lock: true,
            })
            .await
            .unwrap();
        assert!(matches!(created, Response::Skinny(ref s) if s.default_revision == "1.1" && s.lock_count == 1));

        let checked_in = broker
            .request(Request::CheckIn {
                coordinate: coordinate(),
                short_name: "a.c".into(),
                user: "alice".into(),
                parent_revision: "1.1".into(),
                content: b"one\ntwo\n".to_vec(),
                description: "second".into(),
                keep_locked: false,
                label: None,
            })
            .await
            .unwrap();
        match checked_in {
            Response::CheckedIn { revision, skinny } => {
                assert_eq!(revision.as_deref(), Some("1.2"));
                assert_eq!(skinny.lock_count, 0);
            }
            other => panic!("unexpected {:?}", other),
        }

        let fetched = broker
            .request(Request::GetRevision { coordinate: coordinate(), short_name: "a.c".into(), revision: Some("1.1".into()) })
            .await
            .unwrap();
        assert_eq!(fetched, Response::Revision { revision: "1.1".into(), content: b"one\n".to_vec() });
        let tip = broker
            .request(Request::GetRevision { coordinate: coordinate(), short_name: "a.c".into(), revision: None })
            .await
            .unwrap();
        assert_eq!(tip, Response::Revision { revision: "1.2".into(), content: b"one\ntwo\n".to_vec() });
    }

    #[tokio::test]
    async fn test_errors_come_back_typed() {
        let tmp = TempDir::new().unwrap();
        let server = server(&tmp);
        let (connection, _notifications) = connect(&server, 5002);
        let err = connection
            .broker()
            .request(Request::GetRevision { coordinate: coordinate(), short_name: "missing.c".into(), revision: None })
            .await
            .unwrap_err();
        assert!(matches!(err, QvcsError::ArchiveNotFound(_)));
    }

    #[tokio::test]
    async fn test_listener_receives_notifications() {
        let tmp = TempDir::new().unwrap();
        let server = server(&tmp);
        server.factory().create_directory("demo", "src").unwrap();

        let (watcher, mut notifications) = connect(&server, 5003);
        let branches = ClientBranchManager::new();
        branches.register("demo", ClientBranchInfo::trunk());
        let cache = Arc::new(LogFileProxyCache::new("demo", Arc::new(branches)));
        let proxy = ArchiveDirManagerProxy::new(
            coordinate(),
            TRUNK_BRANCH_ID,
            false,
            watcher.broker().clone(),
            cache,
            Duration::from_millis(10),
        );
        proxy.start().await.unwrap();
        assert!(proxy.archives().is_empty());

        let (writer, _writer_notifications) = connect(&server, 5004);
        writer
            .broker()
            .request(Request::CreateArchive {
                coordinate: coordinate(),
                short_name: "b.c".into(),
                user: "bob".into(),
                content: b"hello".to_vec(),
                description: "new".into(),
                attributes: None,
                lock: false,
            })
            .await
            .unwrap();

        let notification = tokio::time::timeout(Duration::from_secs(5), notifications.recv()).await.unwrap().unwrap();
        assert!(matches!(notification.kind, NotificationKind::Create(ref s) if s.short_workfile_name == "b.c"));
        proxy.apply_notification(&notification).unwrap();
        assert_eq!(proxy.archive("b.c").unwrap().default_revision_string(), "1.1");
    }

    #[tokio::test]
    async fn test_blocking_dispatch_answers_and_reports_errors() {
        let tmp = TempDir::new().unwrap();
        let server = server(&tmp);
        server.factory().create_directory("demo", "src").unwrap();

        let created = server
            .handle_blocking(
                "local",
                Request::CreateArchive {
                    coordinate: coordinate(),
                    short_name: "c.c".into(),
                    user: "carol".into(),
                    content: b"body\n".to_vec(),
                    description: "d".repeat(70_000),
                    attributes: None,
                    lock: false,
                },
            )
            .await;
        assert!(matches!(created, Response::Error { ref message, .. } if message.contains("70000 bytes")));
        assert!(server.factory().manager("demo", "src").unwrap().archive("c.c").is_none());

        let listed = server.handle_blocking("local", Request::ListProjects).await;
        assert_eq!(listed, Response::Projects(vec!["demo".into()]));
    }
}
