//! Revision labels stored in the archive header

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::codec::{nul_string_size, ArchiveReader, ArchiveWrite};
use crate::error::{QvcsError, Result};
use crate::revision_descriptor::RevisionDescriptor;

/// Minor number marking the last pair of a floating label
pub const FLOATING_MINOR: i16 = -1;

/// A named pointer at a revision. A floating label follows the tip of the
/// branch it names instead of one fixed revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelInfo {
    label: String,
    creator_index: u16,
    pairs: Vec<(i16, i16)>,
}

impl LabelInfo {
    pub fn new(label: &str, revision: &RevisionDescriptor, floating: bool, creator_index: u16) -> Self {
        let mut pairs: Vec<(i16, i16)> = revision.pairs().iter().map(|p| (p.major as i16, p.minor as i16)).collect();
        if floating {
            if let Some(last) = pairs.last_mut() {
                last.1 = FLOATING_MINOR;
            }
        }
        Self { label: label.to_string(), creator_index, pairs }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn creator_index(&self) -> u16 {
        self.creator_index
    }

    pub fn is_floating(&self) -> bool {
        self.pairs.last().is_some_and(|p| p.1 == FLOATING_MINOR)
    }

    pub fn depth(&self) -> usize {
        self.pairs.len().saturating_sub(1)
    }

    /// The stored revision string; a floating label ends in `.-1`
    pub fn revision_string(&self) -> String {
        self.pairs.iter().map(|(major, minor)| format!("{}.{}", major, minor)).collect::<Vec<_>>().join(".")
    }

    /// Descriptor the label names. For a floating label the last minor is
    /// replaced by 1, which identifies the branch but not its tip.
    pub fn descriptor(&self) -> Result<RevisionDescriptor> {
        let text = self
            .pairs
            .iter()
            .map(|(major, minor)| {
                let minor = if *minor == FLOATING_MINOR { 1 } else { *minor };
                format!("{}.{}", major, minor)
            })
            .collect::<Vec<_>>()
            .join(".");
        text.parse()
    }

    pub fn read(reader: &mut ArchiveReader<'_>) -> Result<Self> {
        let count = reader.read_u16()? as usize;
        let creator_index = reader.read_u16()?;
        let label_size = reader.read_u16()? as usize;
        if count == 0 {
            return Err(QvcsError::Format("label with no revision pairs".into()));
        }
        let mut pairs = Vec::with_capacity(count);
        for _ in 0..count {
            let major = reader.read_i16()?;
            let minor = reader.read_i16()?;
            pairs.push((major, minor));
        }
        let label = reader.read_nul_string(label_size)?;
        Ok(Self { label, creator_index, pairs })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        let label_size = nul_string_size("label", &self.label)?;
        buf.put_u16_le(self.pairs.len() as u16);
        buf.put_u16_le(self.creator_index);
        buf.put_u16_le(label_size);
        for (major, minor) in &self.pairs {
            buf.put_i16_le(*major);
            buf.put_i16_le(*minor);
        }
        buf.put_nul_string(&self.label);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_label() {
        let label = LabelInfo::new("RELEASE_1", &"1.4".parse().unwrap(), false, 2);
        assert!(!label.is_floating());
        assert_eq!(label.revision_string(), "1.4");
        assert_eq!(label.descriptor().unwrap().to_string(), "1.4");
    }

    #[test]
    fn test_floating_label_marks_last_minor() {
        let label = LabelInfo::new("LATEST", &"1.2.1.5".parse().unwrap(), true, 0);
        assert!(label.is_floating());
        assert_eq!(label.revision_string(), "1.2.1.-1");
        assert_eq!(label.descriptor().unwrap().to_string(), "1.2.1.1");
    }

    #[test]
    fn test_disk_layout() {
        let label = LabelInfo::new("B", &"1.2.1.3".parse().unwrap(), true, 1);
        let mut buf = Vec::new();
        label.write_to(&mut buf).unwrap();
        // three shorts, two pairs, "B\0"
        assert_eq!(buf.len(), 6 + 8 + 2);
        assert_eq!(&buf[12..14], &(-1i16).to_le_bytes());
        let read = LabelInfo::read(&mut ArchiveReader::new(&buf)).unwrap();
        assert_eq!(read, label);
    }
}
