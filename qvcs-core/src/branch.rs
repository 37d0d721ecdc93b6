//! Branch metadata and the per-project branch registry

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QvcsError, Result};

/// Trunk branch id by convention
pub const TRUNK_BRANCH_ID: i32 = 1;
pub const TRUNK_BRANCH_NAME: &str = "Trunk";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum BranchType {
    Trunk = 1,
    Feature = 2,
    /// Read-only branch pinned to a tag
    TagBased = 3,
    Release = 4,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientBranchInfo {
    pub branch_id: i32,
    pub name: String,
    pub branch_type: BranchType,
    #[serde(default)]
    pub parent_branch_id: Option<i32>,
    #[serde(default)]
    pub anchor_date: Option<DateTime<Utc>>,
}

impl ClientBranchInfo {
    pub fn trunk() -> Self {
        Self {
            branch_id: TRUNK_BRANCH_ID,
            name: TRUNK_BRANCH_NAME.to_string(),
            branch_type: BranchType::Trunk,
            parent_branch_id: None,
            anchor_date: None,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.branch_type == BranchType::TagBased
    }

    pub fn is_release(&self) -> bool {
        self.branch_type == BranchType::Release
    }

    pub fn is_feature(&self) -> bool {
        self.branch_type == BranchType::Feature
    }

    /// Read-only and release branches never hold or forward cached proxies.
    pub fn receives_fan_out(&self) -> bool {
        !self.is_read_only() && !self.is_release()
    }
}

/// Branches known to the client, per project
#[derive(Debug, Default)]
pub struct ClientBranchManager {
    projects: RwLock<HashMap<String, BTreeMap<i32, ClientBranchInfo>>>,
}

impl ClientBranchManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a branch definition.
    pub fn register(&self, project: &str, info: ClientBranchInfo) {
        self.projects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(project.to_string())
            .or_default()
            .insert(info.branch_id, info);
    }

    pub fn remove(&self, project: &str, branch_id: i32) -> Option<ClientBranchInfo> {
        self.projects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(project)
            .and_then(|branches| branches.remove(&branch_id))
    }

    pub fn branch_info(&self, project: &str, branch_id: i32) -> Result<ClientBranchInfo> {
        self.projects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(project)
            .and_then(|branches| branches.get(&branch_id))
            .cloned()
            .ok_or_else(|| QvcsError::BranchInfoNotFound { project: project.to_string(), branch_id })
    }

    pub fn branch_by_name(&self, project: &str, name: &str) -> Option<ClientBranchInfo> {
        self.projects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(project)
            .and_then(|branches| branches.values().find(|b| b.name == name).cloned())
    }

    /// Branches of `project` in id order
    pub fn branches(&self, project: &str) -> Vec<ClientBranchInfo> {
        self.projects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(project)
            .map(|branches| branches.values().cloned().collect())
            .unwrap_or_default()
    }
}
