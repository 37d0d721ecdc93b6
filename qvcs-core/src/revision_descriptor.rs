//! Branch paths from the trunk to a revision

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::codec::ArchiveReader;
use crate::error::{QvcsError, Result};

/// One `major.minor` step of a revision path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct RevisionPair {
    pub major: u16,
    pub minor: u16,
}

impl RevisionPair {
    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for RevisionPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Full branch path of a revision.
///
/// The element count is always the revision depth plus one. Equality and
/// ordering go through [`RevisionDescriptor::sortable_string`], so `1.10`
/// sorts after `1.2`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionDescriptor {
    pairs: Vec<RevisionPair>,
}

impl RevisionDescriptor {
    pub fn new(pairs: Vec<RevisionPair>) -> Self {
        Self { pairs }
    }

    /// Descriptor of a trunk revision
    pub fn trunk(major: u16, minor: u16) -> Self {
        Self { pairs: vec![RevisionPair::new(major, minor)] }
    }

    /// Descriptor for a revision one level below `parent`'s path, or beside it
    /// when `depth` equals the parent's depth.
    pub fn derived(parent: &RevisionDescriptor, depth: usize, pair: RevisionPair) -> Self {
        let mut pairs: Vec<RevisionPair> = parent.pairs.iter().take(depth).copied().collect();
        pairs.push(pair);
        Self { pairs }
    }

    pub fn pairs(&self) -> &[RevisionPair] {
        &self.pairs
    }

    pub fn element_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn depth(&self) -> usize {
        self.pairs.len().saturating_sub(1)
    }

    pub fn last(&self) -> RevisionPair {
        self.pairs.last().copied().unwrap_or_default()
    }

    pub fn trunk_minor(&self) -> u16 {
        self.pairs.first().map(|p| p.minor).unwrap_or(0)
    }

    /// Each pair as two zero-padded 4-digit fields, concatenated in branch
    /// order.
    pub fn sortable_string(&self) -> String {
        let mut out = String::with_capacity(self.pairs.len() * 8);
        for pair in &self.pairs {
            out.push_str(&format!("{:04}{:04}", pair.major, pair.minor));
        }
        out
    }

    /// Read a descriptor of `element_count` pairs, including the trailing
    /// pad pair and zero word the archive format carries.
    pub fn read(reader: &mut ArchiveReader<'_>, element_count: usize) -> Result<Self> {
        if element_count == 0 {
            return Ok(Self { pairs: Vec::new() });
        }
        let stored_count = reader.read_u16()? as usize;
        let _attributes = reader.read_u16()?;
        if stored_count != element_count {
            return Err(QvcsError::Format(format!(
                "revision descriptor holds {} elements, header expects {}",
                stored_count, element_count
            )));
        }
        let mut pairs = Vec::with_capacity(element_count);
        for _ in 0..element_count {
            let major = reader.read_u16()?;
            let minor = reader.read_u16()?;
            pairs.push(RevisionPair::new(major, minor));
        }
        reader.read_u16()?;
        reader.read_u16()?;
        reader.read_u32()?;
        Ok(Self { pairs })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        if self.pairs.is_empty() {
            return;
        }
        buf.put_u16_le(self.pairs.len() as u16);
        buf.put_u16_le(0);
        for pair in &self.pairs {
            buf.put_u16_le(pair.major);
            buf.put_u16_le(pair.minor);
        }
        buf.put_u16_le(0);
        buf.put_u16_le(0);
        buf.put_u32_le(0);
    }
}

impl fmt::Display for RevisionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pair) in self.pairs.iter().enumerate() {
            if i != 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", pair)?;
        }
        Ok(())
    }
}

impl FromStr for RevisionDescriptor {
    type Err = QvcsError;

    fn from_str(s: &str) -> Result<Self> {
        let numbers = s
            .split('.')
            .map(|n| n.trim().parse::<u16>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| QvcsError::RevisionNotFound(s.to_string()))?;
        if numbers.is_empty() || numbers.len() % 2 != 0 {
            return Err(QvcsError::RevisionNotFound(s.to_string()));
        }
        let pairs = numbers.chunks(2).map(|c| RevisionPair::new(c[0], c[1])).collect();
        Ok(Self { pairs })
    }
}

impl PartialEq for RevisionDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.sortable_string() == other.sortable_string()
    }
}

impl Eq for RevisionDescriptor {}

impl PartialOrd for RevisionDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RevisionDescriptor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sortable_string().cmp(&other.sortable_string())
    }
}

impl std::hash::Hash for RevisionDescriptor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.sortable_string().hash(state);
    }
}
