//! Complete in-memory history of one archive
//!
//! [`LogfileInfo`] is the parsed archive: header, labels and the revision
//! arena. Every mutation keeps the arena in storage order so that
//! [`LogfileInfo::to_bytes`] can write it straight back out.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::attributes::ArchiveAttributes;
use crate::codec::{nul_string_size, ArchiveReader};
use crate::compression::CompressionAlgorithm;
use crate::edits::{apply_edits, compute_edits, EditRecord, EditType};
use crate::error::{QvcsError, Result};
use crate::label::LabelInfo;
use crate::logfile_header::{LogFileHeaderInfo, SupplementalInfo};
use crate::access_list::AccessList;
use crate::revision_descriptor::{RevisionDescriptor, RevisionPair};
use crate::revision_header::RevisionHeader;
use crate::revision_information::RevisionInformation;
use crate::skinny::SkinnyLogfileInfo;
use crate::utility::digest_hex;

/// Parameters of a check-in
#[derive(Debug, Clone)]
pub struct CheckIn<'a> {
    pub user: &'a str,
    /// Revision the new content was derived from
    pub parent_revision: &'a str,
    pub content: &'a [u8],
    pub description: &'a str,
    pub edit_date: DateTime<Utc>,
    /// Keep the new revision locked by `user`
    pub keep_locked: bool,
    pub label: Option<&'a str>,
}

/// Parameters for creating a new archive
#[derive(Debug, Clone)]
pub struct CreateArchive<'a> {
    pub short_workfile_name: &'a str,
    pub file_id: i32,
    pub user: &'a str,
    pub content: &'a [u8],
    pub description: &'a str,
    pub module_description: &'a str,
    pub attributes: ArchiveAttributes,
    pub edit_date: DateTime<Utc>,
    pub lock: bool,
}

#[derive(Debug, Clone)]
pub struct LogfileInfo {
    short_workfile_name: String,
    header_info: LogFileHeaderInfo,
    revisions: RevisionInformation,
    algorithm: CompressionAlgorithm,
}

impl LogfileInfo {
    /// Build a fresh archive holding revision 1.1.
    pub fn create(request: CreateArchive<'_>, algorithm: CompressionAlgorithm) -> Result<Self> {
        nul_string_size("description", request.description)?;
        nul_string_size("module description", request.module_description)?;
        let mut modifiers = AccessList::default();
        let creator = modifiers.ensure_user(request.user) as u16;

        let mut header_info = LogFileHeaderInfo {
            module_description: request.module_description.to_string(),
            supplemental: Some(SupplementalInfo {
                workfile_location: String::new(),
                last_modifier_index: creator as i32,
                last_archive_update: Utc::now(),
                last_workfile_size: request.content.len() as u64,
                file_id: request.file_id,
            }),
            ..Default::default()
        };
        header_info.header.attributes = request.attributes;

        let compression = request.attributes.is_compression().then_some(algorithm);
        let mut tip = RevisionHeader::new(RevisionDescriptor::trunk(1, 1), creator, request.description);
        tip.is_tip = true;
        tip.commit_id = 1;
        tip.edit_date = request.edit_date;
        if request.lock {
            tip.locked = true;
            tip.locker_index = creator;
        }
        tip.set_data(request.content.to_vec(), compression);

        let mut revisions = RevisionInformation::new(AccessList::default(), modifiers);
        revisions.insert(0, tip)?;
        let mut info = Self {
            short_workfile_name: request.short_workfile_name.to_string(),
            header_info,
            revisions,
            algorithm,
        };
        info.sync_header();
        Ok(info)
    }

    /// Parse a complete archive image.
    pub fn from_bytes(short_workfile_name: &str, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Self> {
        let mut reader = ArchiveReader::new(data);
        let (header_info, access, modifiers) = LogFileHeaderInfo::read(&mut reader)?;
        let count = header_info.header.revision_count as usize;
        let revisions = RevisionInformation::read(&mut reader, count, access, modifiers)?;
        if !reader.is_empty() {
            debug!(
                "{} trailing bytes after {} revisions in archive for {}",
                reader.remaining(),
                count,
                short_workfile_name
            );
        }
        Ok(Self { short_workfile_name: short_workfile_name.to_string(), header_info, revisions, algorithm })
    }

    /// Serialize the archive. Header counts are refreshed first.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        self.sync_header();
        let mut buf = Vec::new();
        self.header_info.write_to(&mut buf, self.revisions.access_list(), self.revisions.modifier_list())?;
        self.revisions.write_to(&mut buf)?;
        Ok(buf)
    }

    fn sync_header(&mut self) {
        let header = &mut self.header_info.header;
        header.revision_count = self.revisions.len() as u16;
        header.lock_count = self.revisions.lock_count() as u16;
        if let Some(tip) = self.revisions.get(0) {
            header.trunk_major = tip.major();
            header.trunk_minor = tip.minor();
        }
    }

    fn compression(&self) -> Option<CompressionAlgorithm> {
        self.attributes().is_compression().then_some(self.algorithm)
    }

    pub fn short_workfile_name(&self) -> &str {
        &self.short_workfile_name
    }

    pub fn set_short_workfile_name(&mut self, name: &str) {
        self.short_workfile_name = name.to_string();
    }

    pub fn header_info(&self) -> &LogFileHeaderInfo {
        &self.header_info
    }

    pub fn revision_information(&self) -> &RevisionInformation {
        &self.revisions
    }

    pub fn attributes(&self) -> ArchiveAttributes {
        self.header_info.header.attributes
    }

    pub fn set_attributes(&mut self, attributes: ArchiveAttributes) {
        self.header_info.header.attributes = attributes;
    }

    pub fn file_id(&self) -> i32 {
        self.header_info.file_id()
    }

    pub fn set_file_id(&mut self, file_id: i32) {
        self.header_info.supplemental.get_or_insert_with(|| SupplementalInfo::new(file_id)).file_id = file_id;
    }

    pub fn revision_count(&self) -> usize {
        self.revisions.len()
    }

    pub fn lock_count(&self) -> usize {
        self.revisions.lock_count()
    }

    pub fn module_description(&self) -> &str {
        &self.header_info.module_description
    }

    pub fn set_module_description(&mut self, description: &str) -> Result<()> {
        nul_string_size("module description", description)?;
        self.header_info.module_description = description.to_string();
        Ok(())
    }

    pub fn comment_prefix(&self) -> &str {
        &self.header_info.comment_prefix
    }

    pub fn set_comment_prefix(&mut self, prefix: &str) -> Result<()> {
        nul_string_size("comment prefix", prefix)?;
        self.header_info.comment_prefix = prefix.to_string();
        Ok(())
    }

    pub fn last_archive_update(&self) -> Option<DateTime<Utc>> {
        self.header_info.supplemental.as_ref().map(|s| s.last_archive_update)
    }

    /// Trunk tip, or the tip of the default branch when one is set
    pub fn default_revision_index(&self) -> Option<usize> {
        match &self.header_info.default_descriptor {
            Some(descriptor) => self.revisions.branch_tip(descriptor),
            None if !self.revisions.is_empty() => Some(0),
            None => None,
        }
    }

    pub fn default_revision(&self) -> Option<&RevisionHeader> {
        self.default_revision_index().and_then(|i| self.revisions.get(i))
    }

    pub fn default_revision_string(&self) -> Option<String> {
        self.default_revision().map(RevisionHeader::revision_string)
    }

    /// Make the branch containing `revision` the default branch, or the
    /// trunk when `revision` is `None`.
    pub fn set_default_branch(&mut self, revision: Option<&str>) -> Result<()> {
        self.header_info.default_descriptor = match revision {
            None => None,
            Some(rev) => {
                let index = self.require(rev)?;
                let descriptor = self.revisions.get(index).map(|r| r.descriptor().clone());
                descriptor.filter(|d| d.depth() > 0)
            }
        };
        Ok(())
    }

    pub fn last_check_in_date(&self) -> Option<DateTime<Utc>> {
        self.default_revision().map(|r| r.check_in_date)
    }

    pub fn last_edit_by(&self) -> Option<String> {
        let revision = self.default_revision()?;
        revision.creator(self.revisions.modifier_list()).ok().map(str::to_string)
    }

    /// Comma-separated users holding locks, in storage order
    pub fn locked_by(&self) -> String {
        self.revisions.locks().into_iter().map(|(_, user)| user).collect::<Vec<_>>().join(",")
    }

    pub fn locked_revision(&self, user: &str) -> Option<String> {
        self.revisions.locked_revision(user)
    }

    pub fn find_revision(&self, revision: &str) -> Option<&RevisionHeader> {
        self.revisions.find(revision).and_then(|i| self.revisions.get(i))
    }

    fn require(&self, revision: &str) -> Result<usize> {
        self.revisions.find(revision).ok_or_else(|| QvcsError::RevisionNotFound(revision.to_string()))
    }

    /// Reconstruct a revision by walking up to a whole stored revision and
    /// applying each edit script on the way back down.
    pub fn fetch(&self, index: usize) -> Result<Vec<u8>> {
        let mut chain = vec![index];
        let mut current = index;
        while let Some(parent) = self.revisions.parent_of(current) {
            chain.push(parent);
            current = parent;
        }
        let root = self
            .revisions
            .get(current)
            .ok_or_else(|| QvcsError::RevisionNotFound(format!("index {}", index)))?;
        if current != 0 || !root.is_tip || root.depth() != 0 {
            return Err(QvcsError::Format(format!(
                "revision chain from index {} ends at non-tip revision {}",
                index,
                root.revision_string()
            )));
        }

        let mut buffer = root.expanded_data()?;
        for step in chain.iter().rev().skip(1) {
            let revision = self
                .revisions
                .get(*step)
                .ok_or_else(|| QvcsError::RevisionNotFound(format!("index {}", step)))?;
            buffer = apply_edits(&revision.expanded_data()?, &buffer)?;
        }
        Ok(buffer)
    }

    pub fn fetch_revision(&self, revision: &str) -> Result<Vec<u8>> {
        self.fetch(self.require(revision)?)
    }

    pub fn fetch_default(&self) -> Result<Vec<u8>> {
        let index = self
            .default_revision_index()
            .ok_or_else(|| QvcsError::RevisionNotFound("default".to_string()))?;
        self.fetch(index)
    }

    pub fn default_revision_digest(&self) -> Result<String> {
        Ok(digest_hex(&self.fetch_default()?))
    }

    /// Edit script taking `base` to `target`, honoring the compute-delta
    /// and binary attributes.
    fn edit_script(&self, base: &[u8], target: &[u8]) -> Vec<u8> {
        let attributes = self.attributes();
        if attributes.is_binary_file() || !attributes.is_compute_delta() {
            let kind = if base.is_empty() { EditType::Insert } else { EditType::Replace };
            let record = EditRecord { seek: 0, kind, deleted: base.len() as u32, inserted: target.to_vec() };
            let mut script = Vec::with_capacity(14 + target.len());
            record.write_to(&mut script);
            script
        } else {
            compute_edits(base, target)
        }
    }

    /// Add a revision. Checking in against the trunk tip adds a new trunk
    /// tip, against a branch tip extends that branch, and against any other
    /// revision starts a new branch there.
    ///
    /// Returns the new revision string, or `None` when the content equals
    /// the parent revision (the parent's lock is still released).
    pub fn check_in(&mut self, request: CheckIn<'_>) -> Result<Option<String>> {
        nul_string_size("description", request.description)?;
        let parent_index = self.require(request.parent_revision)?;
        let parent = self
            .revisions
            .get(parent_index)
            .ok_or_else(|| QvcsError::RevisionNotFound(request.parent_revision.to_string()))?;
        if let Some(locker) = parent.locker(self.revisions.modifier_list()) {
            if locker != request.user {
                return Err(QvcsError::LockConflict {
                    revision: request.parent_revision.to_string(),
                    user: locker.to_string(),
                });
            }
        }

        let parent_content = self.fetch(parent_index)?;
        if parent_content == request.content {
            if let Some(parent) = self.revisions.get_mut(parent_index) {
                parent.locked = false;
            }
            if let Some(label) = request.label {
                self.add_label(request.user, label, request.parent_revision, false)?;
            }
            return Ok(None);
        }

        let creator = self.revisions.modifier_list_mut().ensure_user(request.user) as u16;
        let compression = self.compression();
        let Some((parent_descriptor, parent_is_tip, parent_depth, parent_children)) = self
            .revisions
            .get(parent_index)
            .map(|p| (p.descriptor().clone(), p.is_tip, p.depth(), p.child_count))
        else {
            return Err(QvcsError::RevisionNotFound(request.parent_revision.to_string()));
        };

        let last = parent_descriptor.last();
        let (descriptor, insert_at) = if parent_is_tip {
            let next = RevisionPair::new(last.major, last.minor + 1);
            let descriptor = RevisionDescriptor::derived(&parent_descriptor, parent_depth, next);
            let slot = if parent_depth == 0 { 0 } else { self.revisions.end_of_subtree(parent_index) };
            (descriptor, slot)
        } else {
            let branch = RevisionPair::new(parent_children + 1, 1);
            (RevisionDescriptor::derived(&parent_descriptor, parent_depth + 1, branch), parent_index + 1)
        };

        let mut revision = RevisionHeader::new(descriptor, creator, request.description);
        revision.is_tip = true;
        revision.commit_id = self.revisions.next_commit_id();
        revision.edit_date = request.edit_date;
        if request.keep_locked {
            revision.locked = true;
            revision.locker_index = creator;
        }

        if parent_is_tip && parent_depth == 0 {
            // New trunk tip is stored whole; the old tip becomes a reverse delta.
            revision.set_data(request.content.to_vec(), compression);
            let reverse = self.edit_script(request.content, &parent_content);
            if let Some(old_tip) = self.revisions.get_mut(parent_index) {
                old_tip.set_data(reverse, compression);
            }
        } else {
            revision.set_data(self.edit_script(&parent_content, request.content), compression);
        }

        if let Some(parent) = self.revisions.get_mut(parent_index) {
            parent.locked = false;
            if parent_is_tip {
                parent.is_tip = false;
            } else {
                parent.child_count += 1;
            }
        }

        let revision_string = revision.revision_string();
        self.revisions.insert(insert_at, revision)?;

        if let Some(supplemental) = self.header_info.supplemental.as_mut() {
            supplemental.last_modifier_index = creator as i32;
            supplemental.last_archive_update = Utc::now();
            supplemental.last_workfile_size = request.content.len() as u64;
        }
        if let Some(label) = request.label {
            self.add_label(request.user, label, &revision_string, false)?;
        }
        debug!(
            "Checked in {} as {} (parent {})",
            self.short_workfile_name, revision_string, request.parent_revision
        );
        Ok(Some(revision_string))
    }

    pub fn lock(&mut self, user: &str, revision: &str) -> Result<()> {
        let index = self.require(revision)?;
        let current = self.revisions.get(index).and_then(|r| r.locker(self.revisions.modifier_list()));
        match current {
            Some(locker) if locker == user => return Ok(()),
            Some(locker) => {
                return Err(QvcsError::LockConflict { revision: revision.to_string(), user: locker.to_string() });
            }
            None => {}
        }
        let locker_index = self.revisions.modifier_list_mut().ensure_user(user) as u16;
        if let Some(header) = self.revisions.get_mut(index) {
            header.locked = true;
            header.locker_index = locker_index;
        }
        Ok(())
    }

    pub fn unlock(&mut self, user: &str, revision: &str) -> Result<()> {
        let index = self.require(revision)?;
        let owner = self.revisions.get(index).and_then(|r| r.locker(self.revisions.modifier_list()));
        if owner != Some(user) {
            return Err(QvcsError::NotLocked { revision: revision.to_string(), user: user.to_string() });
        }
        if let Some(header) = self.revisions.get_mut(index) {
            header.locked = false;
        }
        Ok(())
    }

    /// Release a lock regardless of who holds it.
    pub fn break_lock(&mut self, revision: &str) -> Result<()> {
        let index = self.require(revision)?;
        if let Some(header) = self.revisions.get_mut(index) {
            header.locked = false;
        }
        Ok(())
    }

    pub fn set_revision_description(&mut self, revision: &str, description: &str) -> Result<()> {
        let index = self.require(revision)?;
        match self.revisions.get_mut(index) {
            Some(header) => header.set_description(description),
            None => Err(QvcsError::RevisionNotFound(revision.to_string())),
        }
    }

    /// Apply `label` to `revision`, replacing any label of the same name.
    pub fn add_label(&mut self, user: &str, label: &str, revision: &str, floating: bool) -> Result<()> {
        nul_string_size("label", label)?;
        let index = self.require(revision)?;
        let descriptor = self
            .revisions
            .get(index)
            .map(|r| r.descriptor().clone())
            .ok_or_else(|| QvcsError::RevisionNotFound(revision.to_string()))?;
        let creator = self.revisions.modifier_list_mut().ensure_user(user) as u16;
        self.header_info.labels.retain(|l| l.label() != label);
        self.header_info.labels.push(LabelInfo::new(label, &descriptor, floating, creator));
        Ok(())
    }

    /// Returns false when no such label existed.
    pub fn remove_label(&mut self, label: &str) -> bool {
        let before = self.header_info.labels.len();
        self.header_info.labels.retain(|l| l.label() != label);
        before != self.header_info.labels.len()
    }

    pub fn labels(&self) -> &[LabelInfo] {
        &self.header_info.labels
    }

    /// Revision a label currently points at. Floating labels resolve to the
    /// tip of their branch.
    pub fn label_revision(&self, label: &str) -> Option<String> {
        let info = self.header_info.find_label(label)?;
        if info.is_floating() {
            let descriptor = info.descriptor().ok()?;
            let tip = self.revisions.branch_tip(&descriptor)?;
            self.revisions.get(tip).map(RevisionHeader::revision_string)
        } else {
            Some(info.revision_string())
        }
    }

    /// Oldest check-in date in the archive
    pub fn oldest_revision_date(&self) -> Option<DateTime<Utc>> {
        self.revisions.iter().map(|r| r.check_in_date).min()
    }

    /// Project the archive for one branch.
    pub fn skinny(&self, branch_id: i32) -> SkinnyLogfileInfo {
        let mut skinny = SkinnyLogfileInfo::new(&self.short_workfile_name, self.file_id(), branch_id);
        skinny.attributes = self.attributes();
        skinny.default_revision = self.default_revision_string().unwrap_or_default();
        skinny.default_revision_digest = match self.default_revision_digest() {
            Ok(digest) => digest,
            Err(e) => {
                debug!("No digest for {}: {}", self.short_workfile_name, e);
                String::new()
            }
        };
        skinny.last_check_in = self.last_check_in_date();
        skinny.last_edit_by = self.last_edit_by().unwrap_or_default();
        skinny.revision_count = self.revision_count();
        skinny.lock_count = self.lock_count();
        skinny.locked_revisions = self.revisions.locks().into_iter().map(|(rev, user)| (user, rev)).collect();
        skinny
    }
}
