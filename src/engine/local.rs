//! In-process engine
//!
//! Keeps images and containers as plain records. Builds validate the
//! Dockerfile and the files it copies from the context, but run nothing.

use super::{
    labels_match, BuildRequest, Built, ContainerInfo, ContainerSpec, ContainerStatus, Engine,
    ImageMeta,
};
use crate::error::{Result, StoolError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info};
use walkdir::WalkDir;

const INSTRUCTIONS: &[&str] = &[
    "FROM", "RUN", "CMD", "LABEL", "EXPOSE", "ENV", "ADD", "COPY", "ENTRYPOINT", "VOLUME",
    "USER", "WORKDIR", "ARG", "ONBUILD", "STOPSIGNAL", "HEALTHCHECK", "SHELL",
];

#[derive(Debug, Default, Serialize, Deserialize)]
struct EngineState {
    images: HashMap<String, ImageMeta>,
    /// Image id to digest of the context it was built from
    #[serde(default)]
    digests: HashMap<String, String>,
    containers: HashMap<String, ContainerInfo>,
}

impl EngineState {
    /// Creation time strictly after every existing image, so newest-first order is total
    fn next_created(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.images.values().map(|i| i.created).max() {
            Some(latest) if latest >= now => latest + chrono::Duration::microseconds(1),
            _ => now,
        }
    }
}

/// Engine that keeps its records in memory, optionally mirrored to a JSON file
pub struct LocalEngine {
    state: Arc<RwLock<EngineState>>,
    state_file: Option<PathBuf>,
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl LocalEngine {
    /// Engine without persistence
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(RwLock::new(EngineState::default())),
            state_file: None,
        }
    }

    /// Engine persisted in `path`; loads existing records
    pub fn open(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            let content = fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            EngineState::default()
        };
        debug!(
            "Engine state loaded from {}: {} image(s), {} container(s)",
            path.display(),
            state.images.len(),
            state.containers.len()
        );
        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            state_file: Some(path.to_path_buf()),
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, EngineState>> {
        self.state
            .read()
            .map_err(|_| StoolError::Lock("Failed to acquire read lock".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, EngineState>> {
        self.state
            .write()
            .map_err(|_| StoolError::Lock("Failed to acquire write lock".to_string()))
    }

    fn save(&self, state: &EngineState) -> Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string_pretty(state)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Register an image without building it
    #[cfg(test)]
    pub(crate) fn add_image(&self, tag: &str, labels: HashMap<String, String>) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let mut state = self.write().unwrap();
        let created = state.next_created();
        state.images.insert(
            id.clone(),
            ImageMeta {
                id: id.clone(),
                tags: vec![tag.to_string()],
                created,
                labels,
            },
        );
        id
    }

    fn container_mut<'a>(state: &'a mut EngineState, id: &str) -> Result<&'a mut ContainerInfo> {
        state
            .containers
            .get_mut(id)
            .ok_or_else(|| StoolError::ContainerNotFound(id.to_string()))
    }
}

/// Digest over relative paths and contents of all files below `dir`
fn context_digest(dir: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() {
            let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update(fs::read(entry.path())?);
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Instructions as `(line, keyword, arguments)`, continuation lines joined
fn instructions(content: &str) -> Vec<(usize, String, String)> {
    let mut result = Vec::new();
    let mut pending = String::new();
    let mut start = 0;
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if pending.is_empty() && (line.is_empty() || line.starts_with('#')) {
            continue;
        }
        if pending.is_empty() {
            start = idx + 1;
        }
        if let Some(head) = line.strip_suffix('\\') {
            pending.push_str(head);
            pending.push(' ');
            continue;
        }
        pending.push_str(line);
        let full = std::mem::take(&mut pending);
        let mut parts = full.splitn(2, char::is_whitespace);
        let keyword = parts.next().unwrap_or_default().to_uppercase();
        let args = parts.next().unwrap_or_default().trim().to_string();
        result.push((start, keyword, args));
    }
    result
}

/// Sources of a COPY/ADD instruction that must exist in the context
fn copy_sources(args: &str) -> Vec<&str> {
    if args.contains("--from") {
        return Vec::new();
    }
    let words: Vec<&str> = args.split_whitespace().filter(|w| !w.starts_with("--")).collect();
    match words.split_last() {
        Some((_, sources)) => sources
            .iter()
            .copied()
            .filter(|s| !s.contains('*') && !s.contains("://") && !s.contains('$'))
            .collect(),
        None => Vec::new(),
    }
}

impl Engine for LocalEngine {
    fn ping(&self) -> Result<()> {
        self.read().map(|_| ())
    }

    fn build_image(&self, request: &BuildRequest) -> Result<Built> {
        let dockerfile = request.context_dir.join("Dockerfile");
        let mut output = String::new();
        let fail = |summary: String, mut output: String| {
            let _ = writeln!(output, "{}", summary);
            StoolError::Build { summary, output }
        };

        let content = fs::read_to_string(&dockerfile)
            .map_err(|e| fail(format!("cannot read {}: {}", dockerfile.display(), e), String::new()))?;
        let steps = instructions(&content);
        if steps.is_empty() {
            return Err(fail("Dockerfile has no instructions".to_string(), output));
        }
        let digest = context_digest(&request.context_dir)?;
        let cached = !request.no_cache && self.read()?.digests.values().any(|d| *d == digest);

        let total = steps.len();
        for (idx, (line, keyword, args)) in steps.iter().enumerate() {
            let _ = writeln!(output, "Step {}/{} : {} {}", idx + 1, total, keyword, args);
            if idx == 0 && keyword != "FROM" {
                return Err(fail(format!("line {}: instruction {} before FROM", line, keyword), output));
            }
            if !INSTRUCTIONS.contains(&keyword.as_str()) {
                return Err(fail(format!("line {}: unknown instruction: {}", line, keyword), output));
            }
            if keyword == "COPY" || keyword == "ADD" {
                for source in copy_sources(args) {
                    if !request.context_dir.join(source).exists() {
                        return Err(fail(
                            format!("{} failed: file not found in build context: {}", keyword, source),
                            output,
                        ));
                    }
                }
            }
            if cached {
                output.push_str(" ---> Using cache\n");
            }
        }

        let mut state = self.write()?;
        let created = state.next_created();
        let mut hasher = Sha256::new();
        hasher.update(digest.as_bytes());
        hasher.update(request.tag.as_bytes());
        hasher.update(created.to_rfc3339().as_bytes());
        let id = format!("{:x}", hasher.finalize());
        let _ = writeln!(output, "Successfully built {}", &id[..12]);
        let _ = writeln!(output, "Successfully tagged {}", request.tag);

        for image in state.images.values_mut() {
            image.tags.retain(|tag| *tag != request.tag);
        }
        state.images.insert(
            id.clone(),
            ImageMeta {
                id: id.clone(),
                tags: vec![request.tag.clone()],
                created,
                labels: request.labels.clone(),
            },
        );
        state.digests.insert(id.clone(), digest);
        self.save(&state)?;
        info!("Built image {} as {}", &id[..12], request.tag);
        Ok(Built { id, output })
    }

    fn list_images(&self, labels: &HashMap<String, String>) -> Result<Vec<ImageMeta>> {
        let state = self.read()?;
        let mut result: Vec<ImageMeta> = state
            .images
            .values()
            .filter(|image| labels_match(&image.labels, labels))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.id.cmp(&b.id)));
        Ok(result)
    }

    fn inspect_image(&self, id: &str) -> Result<ImageMeta> {
        self.read()?
            .images
            .get(id)
            .cloned()
            .ok_or_else(|| StoolError::ImageNotFound(id.to_string()))
    }

    fn remove_image(&self, id: &str, force: bool) -> Result<()> {
        let mut state = self.write()?;
        if !state.images.contains_key(id) {
            return Err(StoolError::ImageNotFound(id.to_string()));
        }
        let users: Vec<&str> = state
            .containers
            .values()
            .filter(|c| c.image_id == id)
            .map(|c| c.name.as_str())
            .collect();
        if !users.is_empty() && !force {
            return Err(StoolError::Engine(format!(
                "image {} is in use by container(s) {}",
                id,
                users.join(", ")
            )));
        }
        state.images.remove(id);
        state.digests.remove(id);
        self.save(&state)?;
        debug!("Removed image {}", id);
        Ok(())
    }

    fn list_containers(&self, labels: &HashMap<String, String>, running_only: bool) -> Result<Vec<String>> {
        let state = self.read()?;
        let mut result: Vec<&ContainerInfo> = state
            .containers
            .values()
            .filter(|c| !running_only || c.status == ContainerStatus::Running)
            .filter(|c| labels_match(&c.labels, labels))
            .collect();
        result.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(result.into_iter().map(|c| c.id.clone()).collect())
    }

    fn list_containers_for_image(&self, image_id: &str) -> Result<Vec<String>> {
        let state = self.read()?;
        let mut result: Vec<String> = state
            .containers
            .values()
            .filter(|c| c.image_id == image_id)
            .map(|c| c.id.clone())
            .collect();
        result.sort();
        Ok(result)
    }

    fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.write()?;
        if !state.images.contains_key(&spec.image_id) {
            return Err(StoolError::ImageNotFound(spec.image_id.clone()));
        }
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(StoolError::Engine(format!(
                "container name already in use: {}",
                spec.name
            )));
        }
        let id = uuid::Uuid::new_v4().to_string().replace("-", "")[..12].to_string();
        state.containers.insert(
            id.clone(),
            ContainerInfo {
                id: id.clone(),
                name: spec.name.clone(),
                image_id: spec.image_id.clone(),
                labels: spec.labels.clone(),
                status: ContainerStatus::Created,
                created: Utc::now(),
                started_at: None,
                finished_at: None,
                memory_bytes: spec.memory_bytes,
                env: spec.env.clone(),
                mounts: spec.mounts.clone(),
                ports: spec.ports.clone(),
            },
        );
        self.save(&state)?;
        debug!("Created container {} ({})", id, spec.name);
        Ok(id)
    }

    fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.write()?;
        let container = Self::container_mut(&mut state, id)?;
        if container.status == ContainerStatus::Running {
            return Err(StoolError::Engine(format!("container {} is already running", id)));
        }
        container.status = ContainerStatus::Running;
        container.started_at = Some(Utc::now());
        container.finished_at = None;
        self.save(&state)?;
        Ok(())
    }

    fn container_status(&self, id: &str) -> Result<ContainerStatus> {
        self.read()?
            .containers
            .get(id)
            .map(|c| c.status)
            .ok_or_else(|| StoolError::ContainerNotFound(id.to_string()))
    }

    fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        let mut state = self.write()?;
        let container = Self::container_mut(&mut state, id)?;
        if container.status != ContainerStatus::Running && container.status != ContainerStatus::Paused {
            debug!("Container {} is not running, nothing to stop", id);
            return Ok(());
        }
        container.status = ContainerStatus::Exited;
        container.finished_at = Some(Utc::now());
        self.save(&state)?;
        debug!("Stopped container {} (timeout {}s)", id, timeout.as_secs());
        Ok(())
    }

    fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.write()?;
        let container = Self::container_mut(&mut state, id)?;
        if container.status == ContainerStatus::Running {
            return Err(StoolError::Engine(format!(
                "cannot remove a running container: {}",
                id
            )));
        }
        state.containers.remove(id);
        self.save(&state)?;
        debug!("Removed container {}", id);
        Ok(())
    }

    fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        self.read()?
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| StoolError::ContainerNotFound(id.to_string()))
    }
}
