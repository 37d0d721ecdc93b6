//! Server and project configuration
//!
//! Configuration lives in JSON files. Every type has a `Default` so a
//! missing file or missing field falls back to a working setup.

use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::attributes::ArchiveAttributes;
use crate::branch::ClientBranchInfo;
use crate::compression::CompressionAlgorithm;

pub const SERVER_CONFIG_FILE: &str = "qvcs-server.json";

fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let data = serde_json::to_string_pretty(value)?;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let mut staged = NamedTempFile::new_in(dir).with_context(|| format!("Failed to stage {:?}", path))?;
    staged.write_all(data.as_bytes()).with_context(|| format!("Failed to write {:?}", staged.path()))?;
    staged.persist(path).with_context(|| format!("Failed to replace {:?}", path))?;
    Ok(())
}

/// Per-project settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectProperties {
    pub project_name: String,
    /// Match workfile names case-insensitively
    pub ignore_case: bool,
    /// Mirror each tip revision as a plain file under `reference_location`
    pub create_reference_copies: bool,
    pub reference_location: Option<PathBuf>,
    pub compression: CompressionAlgorithm,
    /// Attributes given to new archives, as a YES/NO property string
    pub default_attributes: String,
    pub branches: Vec<ClientBranchInfo>,
}

impl Default for ProjectProperties {
    fn default() -> Self {
        Self {
            project_name: String::new(),
            ignore_case: false,
            create_reference_copies: false,
            reference_location: None,
            compression: CompressionAlgorithm::Lz,
            default_attributes: ArchiveAttributes::default().to_property_string(),
            branches: vec![ClientBranchInfo::trunk()],
        }
    }
}

impl ProjectProperties {
    pub fn new(project_name: &str) -> Self {
        Self { project_name: project_name.to_string(), ..Default::default() }
    }

    pub fn attributes(&self) -> ArchiveAttributes {
        ArchiveAttributes::from_property_string(&self.default_attributes)
    }

    pub fn set_attributes(&mut self, attributes: ArchiveAttributes) {
        self.default_attributes = attributes.to_property_string();
    }

    /// Reference copy location, when reference copies are on
    pub fn reference_root(&self) -> Option<&Path> {
        if self.create_reference_copies {
            self.reference_location.as_deref()
        } else {
            None
        }
    }
}

/// Server settings, stored as `qvcs-server.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub archive_root: PathBuf,
    pub heartbeat_interval_secs: u64,
    /// Missed heartbeat intervals before a connection is dropped
    pub heartbeat_timeout_multiple: u32,
    pub notify_delay_ms: u64,
    pub projects: Vec<ProjectProperties>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9889)),
            archive_root: PathBuf::from("qvcsProjectsArchiveData"),
            heartbeat_interval_secs: 10,
            heartbeat_timeout_multiple: 3,
            notify_delay_ms: 1000,
            projects: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load `qvcs-server.json` from `dir`; a missing file gives defaults.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(SERVER_CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&path).with_context(|| format!("Failed to read server config from {:?}", path))?;
        let config: ServerConfig = serde_json::from_str(&data).with_context(|| "Failed to parse server config JSON")?;
        Ok(config)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        write_json(self, &dir.join(SERVER_CONFIG_FILE))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn notify_delay(&self) -> Duration {
        Duration::from_millis(self.notify_delay_ms)
    }

    pub fn project(&self, name: &str) -> Option<&ProjectProperties> {
        self.projects.iter().find(|p| p.project_name == name)
    }

    /// Add a project or replace the one with the same name.
    pub fn upsert_project(&mut self, properties: ProjectProperties) {
        match self.projects.iter_mut().find(|p| p.project_name == properties.project_name) {
            Some(existing) => *existing = properties,
            None => self.projects.push(properties),
        }
    }
}
