//! Per-revision metadata and stored payload

use bytes::BufMut;
use chrono::{DateTime, Utc};

use crate::access_list::AccessList;
use crate::codec::{nul_string_size, ArchiveReader, ArchiveWrite};
use crate::compression::{self, CompressionHeader};
use crate::error::{QvcsError, Result};
use crate::revision_descriptor::{RevisionDescriptor, RevisionPair};

/// Size of the fixed-length part of a stored revision header
pub const REVISION_HEADER_FIXED_SIZE: usize = 36;

/// One revision of an archive.
///
/// `parent` is an index into the owning [`crate::RevisionInformation`]
/// arena. It is rebuilt on every load and never written.
#[derive(Debug, Clone)]
pub struct RevisionHeader {
    descriptor: RevisionDescriptor,
    pub locked: bool,
    pub child_count: u16,
    pub is_tip: bool,
    pub compressed: bool,
    pub newline_flag: u8,
    pub newline_char: u8,
    pub check_in_date: DateTime<Utc>,
    pub edit_date: DateTime<Utc>,
    pub locker_index: u16,
    pub creator_index: u16,
    /// Check-in that produced this revision; 0 for archives written before
    /// commit ids were recorded
    pub commit_id: u32,
    description: String,
    compression: Option<CompressionHeader>,
    /// Stored bytes: a whole file or an edit script, possibly compressed
    data: Vec<u8>,
    pub(crate) parent: Option<usize>,
}

impl RevisionHeader {
    pub fn new(descriptor: RevisionDescriptor, creator_index: u16, description: &str) -> Self {
        let now = Utc::now();
        Self {
            descriptor,
            locked: false,
            child_count: 0,
            is_tip: false,
            compressed: false,
            newline_flag: 0,
            newline_char: b'\n',
            check_in_date: now,
            edit_date: now,
            locker_index: 0,
            creator_index,
            commit_id: 0,
            description: description.to_string(),
            compression: None,
            data: Vec::new(),
            parent: None,
        }
    }

    pub fn descriptor(&self) -> &RevisionDescriptor {
        &self.descriptor
    }

    /// Dotted revision string such as `1.4` or `1.2.1.3`
    pub fn revision_string(&self) -> String {
        self.descriptor.to_string()
    }

    pub fn major(&self) -> u16 {
        self.descriptor.last().major
    }

    pub fn minor(&self) -> u16 {
        self.descriptor.last().minor
    }

    pub fn depth(&self) -> usize {
        self.descriptor.depth()
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Fails with [`QvcsError::StringTooLong`] when the text would not fit
    /// the stored size field.
    pub fn set_description(&mut self, description: &str) -> Result<()> {
        nul_string_size("description", description)?;
        self.description = description.to_string();
        Ok(())
    }

    pub fn compression_header(&self) -> Option<&CompressionHeader> {
        self.compression.as_ref()
    }

    pub fn revision_size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Raw stored bytes, exactly as they sit in the archive
    pub fn stored_data(&self) -> &[u8] {
        &self.data
    }

    /// Store `data` as this revision's payload, compressing it when asked
    /// and when compression actually shrinks it.
    pub fn set_data(&mut self, data: Vec<u8>, algorithm: Option<compression::CompressionAlgorithm>) {
        if let Some(algorithm) = algorithm {
            if let Some(compressed) = compression::compress(algorithm, &data) {
                self.compressed = true;
                self.compression = Some(compressed.header);
                self.data = compressed.data;
                return;
            }
        }
        self.compressed = false;
        self.compression = None;
        self.data = data;
    }

    /// Stored payload with any compression removed
    pub fn expanded_data(&self) -> Result<Vec<u8>> {
        if self.compressed && !self.data.is_empty() {
            compression::expand(&self.data)
        } else {
            Ok(self.data.clone())
        }
    }

    pub fn creator<'a>(&self, modifiers: &'a AccessList) -> Result<&'a str> {
        modifiers.index_to_user(self.creator_index as usize)
    }

    pub fn locker<'a>(&self, modifiers: &'a AccessList) -> Option<&'a str> {
        if self.locked {
            modifiers.index_to_user(self.locker_index as usize).ok()
        } else {
            None
        }
    }

    /// Read one revision. `path` carries the branch path of the previous
    /// revision and is updated in place, since a stored header only records
    /// its own `major.minor` and depth.
    pub fn read(reader: &mut ArchiveReader<'_>, path: &mut Vec<RevisionPair>, index: usize) -> Result<Self> {
        let major = reader.read_u16()?;
        let minor = reader.read_u16()?;
        let locked = reader.read_u16()? != 0;
        let child_count = reader.read_u16()?;
        let depth = reader.read_u16()? as usize;
        if depth > path.len() {
            return Err(QvcsError::MalformedDepthSequence { index, depth });
        }
        path.truncate(depth);
        path.push(RevisionPair::new(major, minor));
        let descriptor = RevisionDescriptor::new(path.clone());

        let is_tip = reader.read_u8()? != 0;
        let compressed = reader.read_u8()? != 0;
        let newline_flag = reader.read_u8()?;
        let newline_char = reader.read_u8()?;
        let check_in_date = reader.read_time()?;
        let edit_date = reader.read_time()?;
        let revision_size = reader.read_u32()? as usize;
        let locker_index = reader.read_u16()?;
        let creator_index = reader.read_u16()?;
        let commit_id = reader.read_u32()?;
        let description_size = reader.read_u16()? as usize;
        let description = reader.read_nul_string(description_size)?;
        let data = reader.read_bytes(revision_size)?.to_vec();
        let compression = if compressed && !data.is_empty() {
            Some(CompressionHeader::read_from(&data)?)
        } else {
            None
        };

        Ok(Self {
            descriptor,
            locked,
            child_count,
            is_tip,
            compressed,
            newline_flag,
            newline_char,
            check_in_date,
            edit_date,
            locker_index,
            creator_index,
            commit_id,
            description,
            compression,
            data,
            parent: None,
        })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        let description_size = nul_string_size("description", &self.description)?;
        buf.put_u16_le(self.major());
        buf.put_u16_le(self.minor());
        buf.put_u16_le(u16::from(self.locked));
        buf.put_u16_le(self.child_count);
        buf.put_u16_le(self.depth() as u16);
        buf.put_u8(u8::from(self.is_tip));
        buf.put_u8(u8::from(self.compressed));
        buf.put_u8(self.newline_flag);
        buf.put_u8(self.newline_char);
        buf.put_time(&self.check_in_date);
        buf.put_time(&self.edit_date);
        buf.put_u32_le(self.revision_size());
        buf.put_u16_le(self.locker_index);
        buf.put_u16_le(self.creator_index);
        buf.put_u32_le(self.commit_id);
        buf.put_u16_le(description_size);
        buf.put_nul_string(&self.description);
        buf.put_slice(&self.data);
        Ok(())
    }

    /// Human-readable summary, resolving the creator through `modifiers`
    pub fn report(&self, modifiers: &AccessList) -> String {
        let creator = self.creator(modifiers).unwrap_or("<unknown>");
        let storage = match &self.compression {
            Some(header) => format!(
                "Revision storage compressed from: {} bytes to: {} bytes",
                header.input_size, header.compressed_size
            ),
            None => format!("Revision storage requires: {} bytes", self.revision_size()),
        };
        format!(
            "Revision {} created by {} (commit {})\nLast File edit: {}\nCheck-in date: {}\n{}\nRevision description:\n{}\n",
            self.descriptor,
            creator,
            self.commit_id,
            self.edit_date.to_rfc2822(),
            self.check_in_date.to_rfc2822(),
            storage,
            self.description
        )
    }
}
