//! Image and container engine
//!
//! The lifecycle code talks to the container engine only through the
//! [`Engine`] trait. [`LocalEngine`] is an in-process implementation that keeps
//! its state in memory and optionally in a JSON file.

#[cfg(test)]
pub(crate) mod faulty;
pub mod labels;
pub mod local;

pub use labels::scan_allocations;
pub use local::LocalEngine;

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Container status as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is created but not running
    Created,
    /// Container is running
    Running,
    /// Container is paused
    Paused,
    /// Container has exited
    Exited,
    /// Container is being removed
    Removing,
    /// Container is in an error state
    Dead,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Paused => write!(f, "paused"),
            ContainerStatus::Exited => write!(f, "exited"),
            ContainerStatus::Removing => write!(f, "removing"),
            ContainerStatus::Dead => write!(f, "dead"),
        }
    }
}

/// Bind mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

impl Mount {
    pub fn new(host_path: PathBuf, container_path: &str) -> Self {
        Self {
            host_path,
            container_path: container_path.to_string(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Image build request
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Repository tag, e.g. `main/s1/web:260301-101500`
    pub tag: String,
    /// Values for `ARG` instructions
    pub build_args: BTreeMap<String, String>,
    /// Labels attached to the image
    pub labels: HashMap<String, String>,
    /// Directory containing the `Dockerfile`
    pub context_dir: PathBuf,
    /// Do not use cached layers
    pub no_cache: bool,
}

/// Successful build
#[derive(Debug, Clone)]
pub struct Built {
    /// Image ID
    pub id: String,
    /// Full build output
    pub output: String,
}

/// Image metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMeta {
    pub id: String,
    pub tags: Vec<String>,
    pub created: DateTime<Utc>,
    pub labels: HashMap<String, String>,
}

/// What to create a container from
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image_id: String,
    pub name: String,
    pub memory_bytes: u64,
    pub labels: HashMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    /// Container port to host port
    pub ports: BTreeMap<u16, u16>,
}

/// Container details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image_id: String,
    pub labels: HashMap<String, String>,
    pub status: ContainerStatus,
    pub created: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub memory_bytes: u64,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub ports: BTreeMap<u16, u16>,
}

/// Image/container backend.
///
/// All calls block. Build failures are reported as
/// [`StoolError::Build`](crate::error::StoolError::Build) carrying the full
/// build output.
pub trait Engine: Send + Sync {
    /// Fails if the engine is unreachable
    fn ping(&self) -> Result<()>;

    fn build_image(&self, request: &BuildRequest) -> Result<Built>;

    /// Images carrying all of the given labels
    fn list_images(&self, labels: &HashMap<String, String>) -> Result<Vec<ImageMeta>>;

    fn inspect_image(&self, id: &str) -> Result<ImageMeta>;

    fn remove_image(&self, id: &str, force: bool) -> Result<()>;

    /// Containers carrying all of the given labels
    fn list_containers(&self, labels: &HashMap<String, String>, running_only: bool) -> Result<Vec<String>>;

    fn list_containers_for_image(&self, image_id: &str) -> Result<Vec<String>>;

    fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    fn start_container(&self, id: &str) -> Result<()>;

    fn container_status(&self, id: &str) -> Result<ContainerStatus>;

    /// Graceful stop, killing the container after `timeout`
    fn stop_container(&self, id: &str, timeout: Duration) -> Result<()>;

    fn remove_container(&self, id: &str) -> Result<()>;

    fn inspect_container(&self, id: &str) -> Result<ContainerInfo>;
}

/// True if `labels` contains every entry of `filter`
pub fn labels_match(labels: &HashMap<String, String>, filter: &HashMap<String, String>) -> bool {
    filter
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}
