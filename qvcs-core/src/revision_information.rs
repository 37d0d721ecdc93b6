//! Revision arena and branch-tree reconstruction

use tracing::debug;

use crate::access_list::AccessList;
use crate::codec::ArchiveReader;
use crate::error::{QvcsError, Result};
use crate::revision_descriptor::RevisionDescriptor;
use crate::revision_header::RevisionHeader;

/// All revisions of one archive in storage order.
///
/// Storage order is the trunk newest-first, with each branch placed directly
/// after its branch-point revision, oldest revision first. Branches anchored
/// at the same revision are placed newest branch first.
#[derive(Debug, Clone, Default)]
pub struct RevisionInformation {
    revisions: Vec<RevisionHeader>,
    access_list: AccessList,
    modifier_list: AccessList,
}

impl RevisionInformation {
    pub fn new(access_list: AccessList, modifier_list: AccessList) -> Self {
        Self { revisions: Vec::new(), access_list, modifier_list }
    }

    /// Read `count` revisions and rebuild their parent links.
    pub fn read(
        reader: &mut ArchiveReader<'_>,
        count: usize,
        access_list: AccessList,
        modifier_list: AccessList,
    ) -> Result<Self> {
        let mut path = Vec::new();
        let mut revisions = Vec::with_capacity(count);
        for index in 0..count {
            revisions.push(RevisionHeader::read(reader, &mut path, index)?);
        }
        let mut info = Self { revisions, access_list, modifier_list };
        info.rebuild_parents()?;
        Ok(info)
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        for revision in &self.revisions {
            revision.write_to(buf)?;
        }
        Ok(())
    }

    /// Recompute every parent index in one linear pass.
    ///
    /// `most_recent_at_depth[d]` tracks the last revision seen at depth `d`.
    /// A revision at depth 0 hangs off the previous trunk revision. At equal
    /// depth, the same major number continues the branch and a different one
    /// starts a sibling branch at the shared branch point. A deeper revision
    /// starts a branch at its predecessor. A shallower revision continues the
    /// branch last seen at its depth, or starts a sibling of it when the
    /// major number differs.
    pub fn rebuild_parents(&mut self) -> Result<()> {
        let mut most_recent_at_depth: Vec<Option<usize>> = Vec::new();

        for i in 0..self.revisions.len() {
            let depth = self.revisions[i].depth();
            let major = self.revisions[i].major();
            if most_recent_at_depth.len() <= depth {
                most_recent_at_depth.resize(depth + 1, None);
            }
            let at = |d: usize| most_recent_at_depth.get(d).copied().flatten();

            let parent = if i == 0 {
                if depth != 0 {
                    return Err(QvcsError::MalformedDepthSequence { index: i, depth });
                }
                None
            } else if depth == 0 {
                at(0)
            } else {
                let previous = &self.revisions[i - 1];
                let previous_depth = previous.depth();
                if depth == previous_depth {
                    if major == previous.major() {
                        Some(i - 1)
                    } else {
                        at(depth - 1)
                    }
                } else if depth == previous_depth + 1 {
                    Some(i - 1)
                } else if depth > previous_depth {
                    return Err(QvcsError::MalformedDepthSequence { index: i, depth });
                } else {
                    match at(depth) {
                        Some(last) if self.revisions[last].major() == major => Some(last),
                        _ => at(depth - 1),
                    }
                }
            };

            if i > 0 && parent.is_none() {
                return Err(QvcsError::MalformedDepthSequence { index: i, depth });
            }
            self.revisions[i].parent = parent;
            most_recent_at_depth[depth] = Some(i);
        }

        debug!("Rebuilt parent links for {} revisions", self.revisions.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&RevisionHeader> {
        self.revisions.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut RevisionHeader> {
        self.revisions.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RevisionHeader> {
        self.revisions.iter()
    }

    pub fn parent_of(&self, index: usize) -> Option<usize> {
        self.revisions.get(index).and_then(|r| r.parent)
    }

    /// Index of the revision whose string is `revision`
    pub fn find(&self, revision: &str) -> Option<usize> {
        self.revisions.iter().position(|r| r.revision_string() == revision)
    }

    pub fn find_descriptor(&self, descriptor: &RevisionDescriptor) -> Option<usize> {
        self.revisions.iter().position(|r| r.descriptor() == descriptor)
    }

    /// Tip of the branch that `descriptor` lies on
    pub fn branch_tip(&self, descriptor: &RevisionDescriptor) -> Option<usize> {
        let depth = descriptor.depth();
        let pairs = descriptor.pairs();
        self.revisions.iter().position(|r| {
            r.is_tip
                && r.depth() == depth
                && r.descriptor().pairs()[..depth] == pairs[..depth]
                && r.major() == descriptor.last().major
        })
    }

    /// Index of the first slot after `index` and any branches anchored
    /// beneath it
    pub fn end_of_subtree(&self, index: usize) -> usize {
        let depth = self.revisions[index].depth();
        let mut end = index + 1;
        while end < self.revisions.len() && self.revisions[end].depth() > depth {
            end += 1;
        }
        end
    }

    pub(crate) fn insert(&mut self, index: usize, header: RevisionHeader) -> Result<()> {
        self.revisions.insert(index, header);
        self.rebuild_parents()
    }

    /// Revision string locked by `user`, if any.
    pub fn locked_revision(&self, user: &str) -> Option<String> {
        self.revisions
            .iter()
            .find(|r| r.locker(&self.modifier_list) == Some(user))
            .map(RevisionHeader::revision_string)
    }

    /// Commit id for the next check-in: one past the highest recorded
    pub fn next_commit_id(&self) -> u32 {
        self.revisions.iter().map(|r| r.commit_id).max().unwrap_or(0).saturating_add(1)
    }

    pub fn lock_count(&self) -> usize {
        self.revisions.iter().filter(|r| r.locked).count()
    }

    /// `(revision string, user)` for every locked revision
    pub fn locks(&self) -> Vec<(String, String)> {
        self.revisions
            .iter()
            .filter_map(|r| r.locker(&self.modifier_list).map(|user| (r.revision_string(), user.to_string())))
            .collect()
    }

    pub fn access_list(&self) -> &AccessList {
        &self.access_list
    }

    pub fn modifier_list(&self) -> &AccessList {
        &self.modifier_list
    }

    pub fn modifier_list_mut(&mut self) -> &mut AccessList {
        &mut self.modifier_list
    }

    pub fn access_list_mut(&mut self) -> &mut AccessList {
        &mut self.access_list
    }
}
