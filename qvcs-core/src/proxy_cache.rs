//! Cross-branch cache of client archive proxies
//!
//! One cache per project, keyed by branch id and then file id. An update on
//! one branch is copied to every numerically greater branch whose cached
//! proxy for the same file still names the updating branch as its origin.
//! Branch ids are not checked against the real parent chain.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::branch::ClientBranchManager;
use crate::error::Result;
use crate::proxy::LogFileProxy;

pub struct LogFileProxyCache {
    project: String,
    branches: Arc<ClientBranchManager>,
    maps: RwLock<BTreeMap<i32, HashMap<i32, Arc<LogFileProxy>>>>,
}

impl LogFileProxyCache {
    pub fn new(project: &str, branches: Arc<ClientBranchManager>) -> Self {
        Self { project: project.to_string(), branches, maps: RwLock::new(BTreeMap::new()) }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Record `proxy` as the current state of its file on `branch_id` and
    /// fan the new state out to child branches. Read-only and release
    /// branches are left alone.
    pub fn update_log_file_proxy(&self, branch_id: i32, proxy: Arc<LogFileProxy>) -> Result<()> {
        let branch = self.branches.branch_info(&self.project, branch_id)?;
        if !branch.receives_fan_out() {
            debug!("Branch {} of {} is not cached", branch.name, self.project);
            return Ok(());
        }
        let skinny = proxy.skinny_info();
        let file_id = skinny.file_id;

        let mut maps = self.maps.write().unwrap_or_else(|e| e.into_inner());
        let mut children = Vec::new();
        for &branch_key in maps.keys().filter(|&&key| key > branch_id) {
            if self.branches.branch_info(&self.project, branch_key)?.receives_fan_out() {
                children.push(branch_key);
            }
        }

        let map = maps.entry(branch_id).or_default();
        match map.get(&file_id) {
            Some(existing) if !Arc::ptr_eq(existing, &proxy) => existing.set_skinny_info(skinny.clone()),
            Some(_) => {}
            None => {
                map.insert(file_id, Arc::clone(&proxy));
            }
        }

        let mut touched = vec![proxy];
        for branch_key in children {
            let Some(child) = maps.get(&branch_key).and_then(|m| m.get(&file_id)) else {
                continue;
            };
            if child.branch_id() == skinny.branch_id {
                child.set_skinny_info(skinny.clone());
                touched.push(Arc::clone(child));
            }
        }
        drop(maps);

        debug!("Updated file {} on branch {}, {} directories to merge", file_id, branch_id, touched.len());
        for proxy in touched {
            proxy.notify_directory();
        }
        Ok(())
    }

    /// Drop the file from `branch_id` and from every other branch whose
    /// cached copy still comes from `branch_id`.
    pub fn remove_log_file_proxy(&self, branch_id: i32, file_id: i32) {
        let mut maps = self.maps.write().unwrap_or_else(|e| e.into_inner());
        if let Some(map) = maps.get_mut(&branch_id) {
            map.remove(&file_id);
        }
        for (_, map) in maps.iter_mut().filter(|(key, _)| **key != branch_id) {
            if map.get(&file_id).is_some_and(|p| p.branch_id() == branch_id) {
                map.remove(&file_id);
            }
        }
    }

    pub fn cached(&self, branch_id: i32, file_id: i32) -> Option<Arc<LogFileProxy>> {
        self.maps.read().unwrap_or_else(|e| e.into_inner()).get(&branch_id).and_then(|m| m.get(&file_id)).cloned()
    }

    pub fn cached_count(&self, branch_id: i32) -> usize {
        self.maps.read().unwrap_or_else(|e| e.into_inner()).get(&branch_id).map_or(0, HashMap::len)
    }
}
