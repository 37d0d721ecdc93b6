//! Archive header: the fixed 30-byte record plus its variable-length tail

use bytes::BufMut;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::access_list::AccessList;
use crate::attributes::ArchiveAttributes;
use crate::codec::{datetime_to_secs, nul_string_size, secs_to_datetime, ArchiveReader, ArchiveWrite};
use crate::error::{QvcsError, Result};
use crate::label::LabelInfo;
use crate::revision_descriptor::RevisionDescriptor;

pub const ARCHIVE_VERSION: u16 = 10;
pub const LOGFILE_HEADER_SIZE: usize = 30;
pub const SUPPLEMENTAL_INFO_SIZE: usize = 516;

const FILE_ID_MARKER: &str = "QVCSFILEID:";

/// Fixed header fields, in on-disk order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileHeader {
    pub version: u16,
    pub trunk_major: u16,
    pub trunk_minor: u16,
    pub attributes: ArchiveAttributes,
    pub label_count: u16,
    pub revision_count: u16,
    /// Element count of the default branch descriptor; 0 means the trunk
    pub default_depth: u16,
    pub lock_count: u16,
    pub access_size: u16,
    pub modifier_size: u16,
    pub comment_size: u16,
    pub owner_size: u16,
    pub description_size: u16,
    pub supplemental_size: u16,
}

impl Default for LogFileHeader {
    fn default() -> Self {
        Self {
            version: ARCHIVE_VERSION,
            trunk_major: 1,
            trunk_minor: 0,
            attributes: ArchiveAttributes::default(),
            label_count: 0,
            revision_count: 0,
            default_depth: 0,
            lock_count: 0,
            access_size: 0,
            modifier_size: 0,
            comment_size: 0,
            owner_size: 0,
            description_size: 0,
            supplemental_size: 0,
        }
    }
}

impl LogFileHeader {
    fn fields(&self) -> [u16; 14] {
        [
            self.version,
            self.trunk_major,
            self.trunk_minor,
            self.attributes.bits(),
            self.label_count,
            self.revision_count,
            self.default_depth,
            self.lock_count,
            self.access_size,
            self.modifier_size,
            self.comment_size,
            self.owner_size,
            self.description_size,
            self.supplemental_size,
        ]
    }

    /// Wrapping 16-bit sum of every other field
    pub fn checksum(&self) -> i16 {
        self.fields().iter().fold(0i16, |sum, v| sum.wrapping_add(*v as i16))
    }

    pub fn read(reader: &mut ArchiveReader<'_>) -> Result<Self> {
        let header = Self {
            version: reader.read_u16()?,
            trunk_major: reader.read_u16()?,
            trunk_minor: reader.read_u16()?,
            attributes: ArchiveAttributes::from_bits(reader.read_u16()?),
            label_count: reader.read_u16()?,
            revision_count: reader.read_u16()?,
            default_depth: reader.read_u16()?,
            lock_count: reader.read_u16()?,
            access_size: reader.read_u16()?,
            modifier_size: reader.read_u16()?,
            comment_size: reader.read_u16()?,
            owner_size: reader.read_u16()?,
            description_size: reader.read_u16()?,
            supplemental_size: reader.read_u16()?,
        };
        let stored = reader.read_i16()?;
        let computed = header.checksum();
        if stored != computed {
            return Err(QvcsError::BadChecksum { stored, computed });
        }
        Ok(header)
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        for field in self.fields() {
            buf.put_u16_le(field);
        }
        buf.put_i16_le(self.checksum());
    }

    pub fn latest_trunk_revision(&self) -> String {
        format!("{}.{}", self.trunk_major, self.trunk_minor)
    }
}

/// The fixed 516-byte block after the header strings:
/// `location\0modifierIndex~updateSecs~workfileSize\0QVCSFILEID:id\0`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupplementalInfo {
    pub workfile_location: String,
    pub last_modifier_index: i32,
    pub last_archive_update: DateTime<Utc>,
    pub last_workfile_size: u64,
    pub file_id: i32,
}

impl SupplementalInfo {
    pub fn new(file_id: i32) -> Self {
        Self {
            workfile_location: String::new(),
            last_modifier_index: -1,
            last_archive_update: Utc::now(),
            last_workfile_size: 0,
            file_id,
        }
    }

    /// Parse a block of any size. Unparseable numbers fall back to the same
    /// defaults the writer would use; a missing file id marker gives -1.
    pub fn parse(block: &[u8]) -> Self {
        let mut fields = block.splitn(2, |b| *b == 0);
        let location = fields.next().unwrap_or_default();
        let rest = fields.next().unwrap_or_default();
        let mut info = Self::new(-1);
        info.workfile_location = String::from_utf8_lossy(location).into_owned();

        let mut sections = rest.splitn(2, |b| *b == 0);
        let stats = String::from_utf8_lossy(sections.next().unwrap_or_default()).into_owned();
        let tail = sections.next().unwrap_or_default();

        let mut stat_fields = stats.split('~');
        info.last_modifier_index = stat_fields.next().and_then(|s| s.parse().ok()).unwrap_or(-1);
        info.last_archive_update = stat_fields
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .map(secs_to_datetime)
            .unwrap_or_else(Utc::now);
        info.last_workfile_size = stat_fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);

        let id_field = tail.split(|b| *b == 0).next().unwrap_or_default();
        let id_text = String::from_utf8_lossy(id_field);
        info.file_id = match id_text.strip_prefix(FILE_ID_MARKER) {
            Some(id) => id.parse().unwrap_or(-1),
            None => {
                debug!("No file id marker in supplemental header info");
                -1
            }
        };
        info
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        let mut block = Vec::with_capacity(SUPPLEMENTAL_INFO_SIZE);
        block.put_slice(self.workfile_location.as_bytes());
        block.put_u8(0);
        block.put_slice(
            format!(
                "{}~{}~{}",
                self.last_modifier_index,
                datetime_to_secs(&self.last_archive_update),
                self.last_workfile_size
            )
            .as_bytes(),
        );
        block.put_u8(0);
        block.put_slice(format!("{}{}", FILE_ID_MARKER, self.file_id).as_bytes());
        block.put_u8(0);
        if block.len() > SUPPLEMENTAL_INFO_SIZE {
            return Err(QvcsError::Format(format!(
                "supplemental header info needs {} bytes, only {} available",
                block.len(),
                SUPPLEMENTAL_INFO_SIZE
            )));
        }
        block.resize(SUPPLEMENTAL_INFO_SIZE, 0);
        buf.put_slice(&block);
        Ok(())
    }
}

/// Header plus every variable-length section that precedes the revisions.
///
/// The access and modifier lists are handed to the revision arena on read
/// and passed back in on write, so the arena stays their single owner.
#[derive(Debug, Clone, Default)]
pub struct LogFileHeaderInfo {
    pub header: LogFileHeader,
    pub default_descriptor: Option<RevisionDescriptor>,
    pub comment_prefix: String,
    pub owner: String,
    pub module_description: String,
    pub supplemental: Option<SupplementalInfo>,
    pub labels: Vec<LabelInfo>,
}

impl LogFileHeaderInfo {
    pub fn read(reader: &mut ArchiveReader<'_>) -> Result<(Self, AccessList, AccessList)> {
        let header = LogFileHeader::read(reader)?;
        let default_descriptor = if header.default_depth > 0 {
            Some(RevisionDescriptor::read(reader, header.default_depth as usize)?)
        } else {
            None
        };
        let access = AccessList::parse(&reader.read_nul_string(header.access_size as usize)?);
        let modifiers = AccessList::parse(&reader.read_nul_string(header.modifier_size as usize)?);
        let comment_prefix = reader.read_nul_string(header.comment_size as usize)?;
        let owner = reader.read_nul_string(header.owner_size as usize)?;
        let module_description = reader.read_nul_string(header.description_size as usize)?;
        let supplemental = if header.supplemental_size > 0 {
            Some(SupplementalInfo::parse(reader.read_bytes(header.supplemental_size as usize)?))
        } else {
            None
        };
        let mut labels = Vec::with_capacity(header.label_count as usize);
        for _ in 0..header.label_count {
            labels.push(LabelInfo::read(reader)?);
        }
        Ok((
            Self { header, default_descriptor, comment_prefix, owner, module_description, supplemental, labels },
            access,
            modifiers,
        ))
    }

    /// Write the header and its tail. Size and count fields are refreshed
    /// from the current contents first.
    pub fn write_to(&mut self, buf: &mut Vec<u8>, access: &AccessList, modifiers: &AccessList) -> Result<()> {
        let access_text = access.to_comma_separated();
        let modifier_text = modifiers.to_comma_separated();
        let header = &mut self.header;
        header.default_depth = self.default_descriptor.as_ref().map(|d| d.element_count() as u16).unwrap_or(0);
        header.access_size = nul_string_size("access list", &access_text)?;
        header.modifier_size = nul_string_size("modifier list", &modifier_text)?;
        header.comment_size = nul_string_size("comment prefix", &self.comment_prefix)?;
        header.owner_size = nul_string_size("owner", &self.owner)?;
        header.description_size = nul_string_size("module description", &self.module_description)?;
        header.supplemental_size = if self.supplemental.is_some() { SUPPLEMENTAL_INFO_SIZE as u16 } else { 0 };
        header.label_count = self.labels.len() as u16;

        header.write_to(buf);
        if let Some(descriptor) = &self.default_descriptor {
            descriptor.write_to(buf);
        }
        buf.put_nul_string(&access_text);
        buf.put_nul_string(&modifier_text);
        buf.put_nul_string(&self.comment_prefix);
        buf.put_nul_string(&self.owner);
        buf.put_nul_string(&self.module_description);
        if let Some(supplemental) = &self.supplemental {
            supplemental.write_to(buf)?;
        }
        for label in &self.labels {
            label.write_to(buf)?;
        }
        Ok(())
    }

    pub fn file_id(&self) -> i32 {
        self.supplemental.as_ref().map(|s| s.file_id).unwrap_or(-1)
    }

    pub fn find_label(&self, label: &str) -> Option<&LabelInfo> {
        self.labels.iter().find(|l| l.label() == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_30_bytes_with_checksum() {
        let header = LogFileHeader { revision_count: 3, trunk_minor: 3, ..Default::default() };
        let mut buf = Vec::new();
        header.write_to(&mut buf);
        assert_eq!(buf.len(), LOGFILE_HEADER_SIZE);
        let read = LogFileHeader::read(&mut ArchiveReader::new(&buf)).unwrap();
        assert_eq!(read, header);
    }

    #[test]
    fn test_bad_checksum_detected() {
        let mut buf = Vec::new();
        LogFileHeader::default().write_to(&mut buf);
        buf[10] ^= 0x01;
        let err = LogFileHeader::read(&mut ArchiveReader::new(&buf)).unwrap_err();
        assert!(matches!(err, QvcsError::BadChecksum { .. }));
    }

    #[test]
    fn test_checksum_wraps() {
        let header = LogFileHeader {
            access_size: u16::MAX,
            modifier_size: u16::MAX,
            ..Default::default()
        };
        let expected = header.fields().iter().fold(0i16, |s, v| s.wrapping_add(*v as i16));
        assert_eq!(header.checksum(), expected);
    }

    #[test]
    fn test_supplemental_block_layout() {
        let mut info = SupplementalInfo::new(42);
        info.workfile_location = "/home/alice/src/main.c".into();
        info.last_modifier_index = 1;
        info.last_archive_update = secs_to_datetime(1_700_000_000);
        info.last_workfile_size = 1234;
        let mut buf = Vec::new();
        info.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), SUPPLEMENTAL_INFO_SIZE);
        let text = String::from_utf8_lossy(&buf);
        assert!(text.starts_with("/home/alice/src/main.c\u{0}1~1700000000~1234\u{0}QVCSFILEID:42\u{0}"));
        assert_eq!(SupplementalInfo::parse(&buf), info);
    }

    #[test]
    fn test_supplemental_without_marker() {
        let block = b"loc\0-1~100~5\0garbage\0";
        let info = SupplementalInfo::parse(block);
        assert_eq!(info.workfile_location, "loc");
        assert_eq!(info.file_id, -1);
        assert_eq!(info.last_workfile_size, 5);
    }

    #[test]
    fn test_header_info_roundtrip() {
        let mut info = LogFileHeaderInfo {
            comment_prefix: "# ".into(),
            module_description: "Main module".into(),
            supplemental: Some(SupplementalInfo::new(7)),
            ..Default::default()
        };
        info.labels.push(LabelInfo::new("V1", &"1.1".parse().unwrap(), false, 0));
        let access = AccessList::parse("alice,bob");
        let modifiers = AccessList::parse("alice");
        let mut buf = Vec::new();
        info.write_to(&mut buf, &access, &modifiers).unwrap();

        let (read, read_access, read_modifiers) = LogFileHeaderInfo::read(&mut ArchiveReader::new(&buf)).unwrap();
        assert_eq!(read_access, access);
        assert_eq!(read_modifiers, modifiers);
        assert_eq!(read.comment_prefix, "# ");
        assert_eq!(read.owner, "");
        assert_eq!(read.file_id(), 7);
        assert_eq!(read.find_label("V1").unwrap().revision_string(), "1.1");
    }
}
