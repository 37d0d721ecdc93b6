//! QVCS Core Library
//!
//! Core functionality for the QVCS revision archive including:
//! - Revision compression (custom LZ and zlib) and edit-script deltas
//! - The on-disk archive format: header, labels, revision tree
//! - Archive files with check-in, fetch, locks and labels
//! - Server-side archive directories with change notification
//! - Client-side proxies, the cross-branch proxy cache and directory merge
//! - The wire protocol and the request/response broker

pub mod access_list;
pub mod archive_dir_manager;
pub mod archive_info;
pub mod attributes;
pub mod branch;
pub mod change_notifier;
pub mod codec;
pub mod compression;
pub mod config;
pub mod directory_manager;
pub mod edits;
pub mod error;
pub mod label;
pub mod logfile;
pub mod logfile_header;
pub mod logfile_info;
pub mod merged_info;
pub mod notification;
pub mod protocol;
pub mod proxy;
pub mod proxy_cache;
pub mod revision_descriptor;
pub mod revision_header;
pub mod revision_information;
pub mod skinny;
pub mod transport;
pub mod utility;
pub mod workfile;

pub use access_list::AccessList;
pub use archive_dir_manager::{ArchiveDirManager, ArchiveDirManagerFactory, NewArchive};
pub use archive_info::ArchiveInfo;
pub use attributes::ArchiveAttributes;
pub use branch::{BranchType, ClientBranchInfo, ClientBranchManager, TRUNK_BRANCH_ID};
pub use change_notifier::{ChangeNotifier, DirectoryListener};
pub use compression::{CompressionAlgorithm, CompressionHeader};
pub use config::{ProjectProperties, ServerConfig};
pub use directory_manager::{ArchiveDirectory, DirectoryManager, DirectoryMerge};
pub use error::{QvcsError, Result};
pub use logfile::LogFile;
pub use logfile_info::{CheckIn, CreateArchive, LogfileInfo};
pub use merged_info::{MergedInfo, MergedStatus};
pub use notification::{
    ArchiveEvent, ArchiveEventListener, DirectoryCoordinate, NotificationKind, NotificationManager, ServerNotification,
};
pub use protocol::{Envelope, Request, Response};
pub use proxy::{ArchiveDirManagerProxy, LogFileProxy, ProxyRegistry};
pub use proxy_cache::LogFileProxyCache;
pub use revision_descriptor::RevisionDescriptor;
pub use revision_information::RevisionInformation;
pub use skinny::SkinnyLogfileInfo;
pub use transport::{ClientConnection, HeartbeatConfig, RequestBroker};
pub use workfile::{IgnoreList, WorkfileDirectoryManager, WorkfileInfo};
