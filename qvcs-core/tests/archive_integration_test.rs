//! Archive, proxy and connection integration tests
//!
//! These drive the public API end to end: archives on disk, directory
//! merge with debounced notification, the cross-branch proxy cache and a
//! client connection talking to an in-process server loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use qvcs_core::protocol::{read_envelope, write_envelope};
use qvcs_core::transport::RequestSender;
use qvcs_core::workfile::NoIgnore;
use qvcs_core::{
    ArchiveAttributes, ArchiveDirManagerFactory, ArchiveDirManagerProxy, ArchiveDirectory, ArchiveInfo, BranchType,
    CheckIn, ClientBranchInfo, ClientBranchManager, ClientConnection, CompressionAlgorithm, CreateArchive,
    DirectoryCoordinate, DirectoryListener, DirectoryManager, DirectoryMerge, Envelope, HeartbeatConfig, LogFile,
    LogFileProxyCache, NewArchive, ProjectProperties, QvcsError, Request, Response, Result, ServerConfig,
    SkinnyLogfileInfo, WorkfileDirectoryManager, TRUNK_BRANCH_ID,
};

fn factory(tmp: &TempDir, notify_delay_ms: u64) -> ArchiveDirManagerFactory {
    let mut config = ServerConfig { archive_root: tmp.path().join("archives"), notify_delay_ms, ..Default::default() };
    config.upsert_project(ProjectProperties::new("demo"));
    ArchiveDirManagerFactory::new(&config)
}

fn new_archive<'a>(name: &'a str, content: &'a [u8]) -> NewArchive<'a> {
    NewArchive {
        user: "alice",
        short_workfile_name: name,
        content,
        description: "initial",
        module_description: "",
        attributes: None,
        edit_date: Utc::now(),
        lock: false,
    }
}

fn check_in<'a>(parent: &'a str, content: &'a [u8]) -> CheckIn<'a> {
    CheckIn {
        user: "alice",
        parent_revision: parent,
        content,
        description: "change",
        edit_date: Utc::now(),
        keep_locked: false,
        label: None,
    }
}

#[test]
fn test_three_branch_archive_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("tree.d");
    let log = LogFile::create(
        &path,
        CreateArchive {
            short_workfile_name: "tree.c",
            file_id: 11,
            user: "alice",
            content: b"r1.1\n",
            description: "initial",
            module_description: "",
            attributes: ArchiveAttributes::default(),
            edit_date: Utc::now(),
            lock: false,
        },
        CompressionAlgorithm::Lz,
    )
    .unwrap();

    let steps: [(&str, &[u8], &str); 6] = [
        ("1.1", b"r1.2\n", "1.2"),
        ("1.2", b"r1.3\n", "1.3"),
        ("1.2", b"r1.2.1.1\n", "1.2.1.1"),
        ("1.2.1.1", b"r1.2.1.2\n", "1.2.1.2"),
        ("1.1", b"r1.1.1.1\n", "1.1.1.1"),
        ("1.1.1.1", b"r1.1.1.2\n", "1.1.1.2"),
    ];
    for (parent, content, expected) in steps {
        assert_eq!(log.check_in(check_in(parent, content)).unwrap().as_deref(), Some(expected));
    }

    let reopened = LogFile::open(&path, "tree.c", CompressionAlgorithm::Lz).unwrap();
    assert_eq!(reopened.revision_count(), 7);
    assert_eq!(reopened.default_revision_string(), "1.3");

    let forest: Vec<(String, Option<String>)> = reopened.with_info(|info| {
        let revisions = info.revision_information();
        revisions
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let parent = revisions.parent_of(i).and_then(|p| revisions.get(p)).map(|p| p.revision_string());
                (r.revision_string(), parent)
            })
            .collect()
    });
    let expected: Vec<(String, Option<String>)> = [
        ("1.3", None),
        ("1.2", Some("1.3")),
        ("1.2.1.1", Some("1.2")),
        ("1.2.1.2", Some("1.2.1.1")),
        ("1.1", Some("1.2")),
        ("1.1.1.1", Some("1.1")),
        ("1.1.1.2", Some("1.1.1.1")),
    ]
    .iter()
    .map(|(r, p)| (r.to_string(), p.map(str::to_string)))
    .collect();
    assert_eq!(forest, expected);

    for (revision, _) in &expected {
        assert_eq!(reopened.fetch_revision(revision).unwrap(), format!("r{}\n", revision).into_bytes());
    }
}

#[test]
fn test_archive_lifecycle_in_directory() {
    let tmp = TempDir::new().unwrap();
    let factory = factory(&tmp, 1000);
    let dir = factory.create_directory("demo", "src").unwrap();
    dir.create_archive(new_archive("main.c", b"int main;\n")).unwrap();

    assert_eq!(dir.check_in("main.c", check_in("1.1", b"int main(void);\n")).unwrap().as_deref(), Some("1.2"));
    assert_eq!(dir.fetch("main.c", None).unwrap(), b"int main(void);\n");
    assert_eq!(dir.fetch("main.c", Some("1.1")).unwrap(), b"int main;\n");

    assert_eq!(dir.lock("main.c", "alice", None).unwrap(), "1.2");
    assert!(matches!(dir.lock("main.c", "bob", Some("1.2")), Err(QvcsError::LockConflict { .. })));
    dir.add_label("main.c", "alice", "REL_1", "1.2", false).unwrap();
    assert!(dir.remove_label("main.c", "REL_1").unwrap());
    assert_eq!(dir.unlock("main.c", "alice", None).unwrap(), "1.2");

    dir.rename_archive("main.c", "entry.c").unwrap();
    assert!(dir.archive("main.c").is_none());
    assert_eq!(dir.fetch("entry.c", None).unwrap(), b"int main(void);\n");

    let skinny = dir.skinny_list(TRUNK_BRANCH_ID);
    assert_eq!(skinny.len(), 1);
    assert_eq!(skinny[0].short_workfile_name, "entry.c");
    assert_eq!(skinny[0].revision_count, 2);
}

struct MergeRecorder {
    manager: Arc<DirectoryManager>,
    /// (merge count, merged entries) seen at each callback
    calls: Mutex<Vec<(u64, usize)>>,
}

impl DirectoryListener for MergeRecorder {
    fn directory_changed(&self, _appended_path: &str) {
        self.calls.lock().unwrap().push((self.manager.merge_count(), self.manager.len()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_changes_merges_once_before_callback() {
    let tmp = TempDir::new().unwrap();
    let factory = factory(&tmp, 1000);
    let dir = factory.create_directory("demo", "src").unwrap();

    let workdir = tmp.path().join("work");
    std::fs::create_dir_all(&workdir).unwrap();
    std::fs::write(workdir.join("local.c"), b"local\n").unwrap();
    let workfiles = Arc::new(WorkfileDirectoryManager::new(&workdir));
    workfiles.refresh().unwrap();

    let archives: Arc<dyn ArchiveDirectory> = dir.clone();
    let manager = Arc::new(DirectoryManager::new(archives, Some(workfiles), Arc::new(NoIgnore), false));
    let as_merge: Arc<dyn DirectoryMerge> = manager.clone();
    dir.set_directory_merge(Arc::downgrade(&as_merge));
    let recorder = Arc::new(MergeRecorder { manager: Arc::clone(&manager), calls: Mutex::new(Vec::new()) });
    dir.add_listener(recorder.clone());

    for name in ["a.c", "b.c", "c.c", "d.c", "e.c"] {
        dir.create_archive(new_archive(name, name.as_bytes())).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(recorder.calls.lock().unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(*recorder.calls.lock().unwrap(), vec![(1, 6)]);
    assert!(manager.merged_info("local.c").unwrap().archive().is_none());
    assert_eq!(manager.merged_info("c.c").unwrap().file_id(), Some(3));

    manager.merge_managers();
    let first: Vec<String> = manager.merged_infos().iter().map(|m| m.short_name().to_string()).collect();
    manager.merge_managers();
    let second: Vec<String> = manager.merged_infos().iter().map(|m| m.short_name().to_string()).collect();
    assert_eq!(first, second);
    assert_eq!(manager.len(), 6);
}

/// Sender for proxies that never talk to a server
struct Offline;

#[async_trait]
impl RequestSender for Offline {
    async fn request(&self, request: Request) -> Result<Response> {
        Err(QvcsError::UnsupportedOperation(request.name().to_string()))
    }
}

fn branch(branch_id: i32, name: &str, branch_type: BranchType) -> ClientBranchInfo {
    ClientBranchInfo {
        branch_id,
        name: name.to_string(),
        branch_type,
        parent_branch_id: Some(TRUNK_BRANCH_ID),
        anchor_date: None,
    }
}

#[derive(Default)]
struct CountingListener(AtomicUsize);

impl DirectoryListener for CountingListener {
    fn directory_changed(&self, _appended_path: &str) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn test_trunk_update_fans_out_to_feature_branch_only() {
    let branches = Arc::new(ClientBranchManager::new());
    branches.register("demo", ClientBranchInfo::trunk());
    branches.register("demo", branch(2, "tag-1.0", BranchType::TagBased));
    branches.register("demo", branch(3, "feature", BranchType::Feature));
    let cache = Arc::new(LogFileProxyCache::new("demo", Arc::clone(&branches)));

    let proxy = |branch_id: i32, name: &str| {
        ArchiveDirManagerProxy::new(
            DirectoryCoordinate::new("demo", name, "src"),
            branch_id,
            false,
            Arc::new(Offline),
            Arc::clone(&cache),
            Duration::from_millis(200),
        )
    };
    let trunk = proxy(TRUNK_BRANCH_ID, "Trunk");
    let tag = proxy(2, "tag-1.0");
    let feature = proxy(3, "feature");
    let feature_listener = Arc::new(CountingListener::default());
    feature.add_listener(feature_listener.clone());

    let skinny = |revision: &str| {
        let mut skinny = SkinnyLogfileInfo::new("a.c", 42, TRUNK_BRANCH_ID);
        skinny.default_revision = revision.to_string();
        skinny
    };
    trunk.update_archive_info("a.c", Some(skinny("1.1"))).unwrap();
    tag.update_archive_info("a.c", Some(skinny("1.1"))).unwrap();
    feature.update_archive_info("a.c", Some(skinny("1.1"))).unwrap();

    trunk.update_archive_info("a.c", Some(skinny("1.2"))).unwrap();
    assert_eq!(feature.archive("a.c").unwrap().default_revision_string(), "1.2");
    assert_eq!(tag.archive("a.c").unwrap().default_revision_string(), "1.1");
    assert_eq!(cache.cached_count(2), 0);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(feature_listener.0.load(Ordering::SeqCst), 1);

    assert!(matches!(feature.delete_archive("a.c"), Err(QvcsError::UnsupportedOperation(_))));
}

#[tokio::test]
async fn test_proxy_loads_directory_over_connection() {
    let tmp = TempDir::new().unwrap();
    let factory = factory(&tmp, 50);
    let dir = factory.create_directory("demo", "src").unwrap();
    dir.create_archive(new_archive("main.c", b"one\n")).unwrap();
    dir.check_in("main.c", check_in("1.1", b"two\n")).unwrap();

    let (client, server) = tokio::io::duplex(64 * 1024);
    let server_dir = Arc::clone(&dir);
    let server_task = tokio::spawn(async move {
        let (mut reader, mut writer) = tokio::io::split(server);
        let mut seen = Vec::new();
        while let Ok(Some(envelope)) = read_envelope(&mut reader).await {
            let Envelope::Request { request_id, request, .. } = envelope else {
                continue;
            };
            seen.push(request.name());
            let response = match request {
                Request::RegisterListener { .. } => Response::Directory {
                    directory_id: server_dir.directory_id(),
                    skinny: server_dir.skinny_list(TRUNK_BRANCH_ID),
                    most_recent_activity: server_dir.most_recent_activity_date(),
                },
                _ => Response::from_error(&QvcsError::UnsupportedOperation(request.name().to_string())),
            };
            write_envelope(&mut writer, &Envelope::Response { request_id, response }).await.unwrap();
        }
        seen
    });

    let branches = Arc::new(ClientBranchManager::new());
    branches.register("demo", ClientBranchInfo::trunk());
    let cache = Arc::new(LogFileProxyCache::new("demo", branches));
    let (connection, _notifications) = ClientConnection::start(client, HeartbeatConfig::new(Duration::from_secs(60), 3));
    let sender: Arc<dyn RequestSender> = connection.broker().clone();
    let proxy = ArchiveDirManagerProxy::new(
        DirectoryCoordinate::new("demo", "Trunk", "src"),
        TRUNK_BRANCH_ID,
        false,
        sender,
        Arc::clone(&cache),
        Duration::from_millis(50),
    );
    proxy.start().await.unwrap();

    assert_eq!(proxy.directory_id(), dir.directory_id());
    let main = proxy.archive("main.c").unwrap();
    assert_eq!(main.default_revision_string(), "1.2");
    assert_eq!(main.revision_count(), 2);
    assert!(cache.cached(TRUNK_BRANCH_ID, main.file_id()).is_some());

    let err = proxy.rename_archive("alice", "main.c", "entry.c").await.unwrap_err();
    assert!(matches!(err, QvcsError::UnsupportedOperation(_)));

    connection.close();
    drop(connection);
    drop(proxy);
    let seen = server_task.await.unwrap();
    assert_eq!(seen, vec!["RegisterListener", "Rename"]);
}
