//! Edit scripts that turn one revision's bytes into another's
//!
//! Every stored revision other than the trunk tip is an edit script against
//! its parent in the revision arena. Records are big-endian:
//!
//! ```text
//! seek (u32) | type (u16) | deleted (u32) | inserted (u32) | inserted bytes
//! ```
//!
//! `seek` is an absolute offset into the parent buffer; records appear in
//! ascending seek order and bytes between edits are copied unchanged.

use bytes::BufMut;

use crate::codec::ArchiveReader;
use crate::error::{QvcsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EditType {
    Insert = 0,
    Delete = 1,
    Replace = 2,
}

impl EditType {
    fn from_u16(value: u16) -> Result<Self> {
        match value {
            0 => Ok(EditType::Insert),
            1 => Ok(EditType::Delete),
            2 => Ok(EditType::Replace),
            other => Err(QvcsError::Format(format!("unknown edit type {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditRecord {
    pub seek: u32,
    pub kind: EditType,
    pub deleted: u32,
    pub inserted: Vec<u8>,
}

impl EditRecord {
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.put_u32(self.seek);
        buf.put_u16(self.kind as u16);
        buf.put_u32(self.deleted);
        buf.put_u32(self.inserted.len() as u32);
        buf.put_slice(&self.inserted);
    }

    fn read(reader: &mut ArchiveReader<'_>) -> Result<Self> {
        let seek = reader.read_u32_be()?;
        let kind = EditType::from_u16(reader.read_u16_be()?)?;
        let deleted = reader.read_u32_be()?;
        let inserted_len = reader.read_u32_be()? as usize;
        let inserted = match kind {
            EditType::Delete => Vec::new(),
            EditType::Insert | EditType::Replace => reader.read_bytes(inserted_len)?.to_vec(),
        };
        Ok(Self { seek, kind, deleted, inserted })
    }
}

/// Apply an edit script to `original`.
pub fn apply_edits(edits: &[u8], original: &[u8]) -> Result<Vec<u8>> {
    let mut reader = ArchiveReader::new(edits);
    let mut out = Vec::with_capacity(edits.len() + original.len());
    let mut in_index = 0usize;

    while !reader.is_empty() {
        let record = EditRecord::read(&mut reader)?;
        let seek = record.seek as usize;
        if seek < in_index || seek > original.len() {
            return Err(QvcsError::Format(format!(
                "edit seek {} outside parent range {}..{}",
                seek,
                in_index,
                original.len()
            )));
        }
        out.extend_from_slice(&original[in_index..seek]);
        in_index = seek;

        if matches!(record.kind, EditType::Delete | EditType::Replace) {
            in_index += record.deleted as usize;
            if in_index > original.len() {
                return Err(QvcsError::Format(format!(
                    "edit deletes past end of parent ({} > {})",
                    in_index,
                    original.len()
                )));
            }
        }
        out.extend_from_slice(&record.inserted);
    }

    out.extend_from_slice(&original[in_index..]);
    Ok(out)
}

/// Build an edit script that turns `base` into `target`.
///
/// The script is a single record covering everything between the common
/// prefix and the common suffix; identical buffers give an empty script.
pub fn compute_edits(base: &[u8], target: &[u8]) -> Vec<u8> {
    let prefix = base.iter().zip(target).take_while(|(a, b)| a == b).count();
    let max_suffix = base.len().min(target.len()) - prefix;
    let suffix = base
        .iter()
        .rev()
        .zip(target.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let deleted = base.len() - prefix - suffix;
    let inserted = &target[prefix..target.len() - suffix];
    let kind = match (deleted, inserted.len()) {
        (0, 0) => return Vec::new(),
        (0, _) => EditType::Insert,
        (_, 0) => EditType::Delete,
        _ => EditType::Replace,
    };

    let record = EditRecord { seek: prefix as u32, kind, deleted: deleted as u32, inserted: inserted.to_vec() };
    let mut script = Vec::with_capacity(14 + inserted.len());
    record.write_to(&mut script);
    script
}
