//! Client/server wire protocol
//!
//! Every frame is `[len: u32 LE][flag: u8][payload]`, where the payload is a
//! bincode-encoded [`Envelope`] and `flag` says whether it is zstd
//! compressed. `len` counts the flag byte and the payload.

use std::io::Read;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{QvcsError, Result};
use crate::notification::{DirectoryCoordinate, ServerNotification};
use crate::skinny::SkinnyLogfileInfo;

/// Largest frame accepted in either direction (64 MiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Payloads above this size are zstd compressed.
pub const COMPRESSION_THRESHOLD: usize = 32 * 1024;

const FLAG_PLAIN: u8 = 0;
const FLAG_ZSTD: u8 = 1;

pub type TransactionId = u64;
pub type RequestId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Start listening on a directory; answered with its skinny list.
    RegisterListener { coordinate: DirectoryCoordinate },
    UnregisterListener { coordinate: DirectoryCoordinate },
    CreateDirectory { coordinate: DirectoryCoordinate },
    CreateArchive {
        coordinate: DirectoryCoordinate,
        short_name: String,
        user: String,
        content: Vec<u8>,
        description: String,
        /// Attribute bits; project defaults when absent
        attributes: Option<u16>,
        lock: bool,
    },
    CheckIn {
        coordinate: DirectoryCoordinate,
        short_name: String,
        user: String,
        parent_revision: String,
        content: Vec<u8>,
        description: String,
        keep_locked: bool,
        label: Option<String>,
    },
    GetRevision { coordinate: DirectoryCoordinate, short_name: String, revision: Option<String> },
    Lock { coordinate: DirectoryCoordinate, short_name: String, user: String, revision: Option<String> },
    Unlock { coordinate: DirectoryCoordinate, short_name: String, user: String, revision: Option<String> },
    Rename { coordinate: DirectoryCoordinate, user: String, old_name: String, new_name: String },
    SetRevisionDescription { coordinate: DirectoryCoordinate, short_name: String, revision: String, description: String },
    Label {
        coordinate: DirectoryCoordinate,
        short_name: String,
        user: String,
        label: String,
        revision: String,
        floating: bool,
    },
    UnLabel { coordinate: DirectoryCoordinate, short_name: String, label: String },
    ListProjects,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::RegisterListener { .. } => "RegisterListener",
            Request::UnregisterListener { .. } => "UnregisterListener",
            Request::CreateDirectory { .. } => "CreateDirectory",
            Request::CreateArchive { .. } => "CreateArchive",
            Request::CheckIn { .. } => "CheckIn",
            Request::GetRevision { .. } => "GetRevision",
            Request::Lock { .. } => "Lock",
            Request::Unlock { .. } => "Unlock",
            Request::Rename { .. } => "Rename",
            Request::SetRevisionDescription { .. } => "SetRevisionDescription",
            Request::Label { .. } => "Label",
            Request::UnLabel { .. } => "UnLabel",
            Request::ListProjects => "ListProjects",
        }
    }
}

/// Error categories that survive the trip to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ArchiveNotFound,
    ArchiveExists,
    ArchiveLocked,
    LockConflict,
    NotLocked,
    RevisionNotFound,
    Unsupported,
    Corrupt,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Directory {
        directory_id: i32,
        skinny: Vec<SkinnyLogfileInfo>,
        most_recent_activity: Option<DateTime<Utc>>,
    },
    Skinny(SkinnyLogfileInfo),
    CheckedIn { revision: Option<String>, skinny: SkinnyLogfileInfo },
    Revision { revision: String, content: Vec<u8> },
    Projects(Vec<String>),
    Error { kind: ErrorKind, message: String },
}

impl Response {
    pub fn from_error(error: &QvcsError) -> Self {
        let kind = match error {
            QvcsError::ArchiveNotFound(_) => ErrorKind::ArchiveNotFound,
            QvcsError::ArchiveExists(_) => ErrorKind::ArchiveExists,
            QvcsError::ArchiveLocked(_) => ErrorKind::ArchiveLocked,
            QvcsError::LockConflict { .. } => ErrorKind::LockConflict,
            QvcsError::NotLocked { .. } => ErrorKind::NotLocked,
            QvcsError::RevisionNotFound(_) => ErrorKind::RevisionNotFound,
            QvcsError::UnsupportedOperation(_) => ErrorKind::Unsupported,
            e if e.is_corruption() => ErrorKind::Corrupt,
            _ => ErrorKind::Other,
        };
        Response::Error { kind, message: error.to_string() }
    }

    /// Turn an error response back into an error.
    pub fn into_result(self) -> Result<Response> {
        match self {
            Response::Error { kind, message } => Err(match kind {
                ErrorKind::ArchiveNotFound => QvcsError::ArchiveNotFound(message),
                ErrorKind::ArchiveExists => QvcsError::ArchiveExists(message),
                ErrorKind::ArchiveLocked => QvcsError::ArchiveLocked(message),
                ErrorKind::RevisionNotFound => QvcsError::RevisionNotFound(message),
                ErrorKind::Unsupported => QvcsError::UnsupportedOperation(message),
                ErrorKind::Corrupt => QvcsError::Format(message),
                ErrorKind::LockConflict | ErrorKind::NotLocked | ErrorKind::Other => QvcsError::Protocol(message),
            }),
            other => Ok(other),
        }
    }
}

/// Everything that travels on a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    BeginTransaction { transaction_id: TransactionId },
    EndTransaction { transaction_id: TransactionId },
    Request { transaction_id: TransactionId, request_id: RequestId, request: Request },
    Response { request_id: RequestId, response: Response },
    Notification(ServerNotification),
    Heartbeat,
}

impl Envelope {
    /// Serialize to a complete frame, length prefix included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let (flag, body) = if payload.len() > COMPRESSION_THRESHOLD {
            (FLAG_ZSTD, zstd::encode_all(&payload[..], 3)?)
        } else {
            (FLAG_PLAIN, payload)
        };
        let len = body.len() + 1;
        if len > MAX_FRAME_SIZE {
            return Err(QvcsError::Protocol(format!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE)));
        }
        let mut buf = Vec::with_capacity(4 + len);
        buf.extend_from_slice(&(len as u32).to_le_bytes());
        buf.push(flag);
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Deserialize a frame body (everything after the length prefix).
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (flag, body) = frame.split_first().ok_or_else(|| QvcsError::Protocol("empty frame".into()))?;
        match *flag {
            FLAG_PLAIN => Ok(bincode::deserialize(body)?),
            FLAG_ZSTD => {
                let mut payload = Vec::new();
                zstd::stream::read::Decoder::new(body)?
                    .take(MAX_FRAME_SIZE as u64 + 1)
                    .read_to_end(&mut payload)?;
                if payload.len() > MAX_FRAME_SIZE {
                    return Err(QvcsError::Protocol(format!(
                        "compressed frame expands past {} bytes",
                        MAX_FRAME_SIZE
                    )));
                }
                Ok(bincode::deserialize(&payload)?)
            }
            other => Err(QvcsError::Protocol(format!("unknown frame flag {}", other))),
        }
    }
}

pub async fn write_envelope<W: AsyncWrite + Unpin>(writer: &mut W, envelope: &Envelope) -> Result<()> {
    let frame = envelope.encode()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one envelope. `Ok(None)` means the peer closed the stream cleanly
/// between frames.
pub async fn read_envelope<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Envelope>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(QvcsError::Protocol(format!("bad frame length {}", len)));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Envelope::decode(&frame).map(Some)
}
