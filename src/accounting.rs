//! Memory and disk accounting
//!
//! Pure reads over the engine and the stage directories. Limits only gate new
//! builds and starts; nothing running is ever evicted.

use crate::config::Settings;
use crate::engine::labels::{self, LABEL_MEMORY};
use crate::engine::Engine;
use crate::error::{Result, StoolError};
use crate::stage::store::StageStore;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

const MB: u64 = 1024 * 1024;

/// Reservation sums across all stages
pub struct Accounting<'a> {
    engine: &'a dyn Engine,
    settings: &'a Settings,
    store: &'a StageStore,
}

impl<'a> Accounting<'a> {
    pub fn new(engine: &'a dyn Engine, settings: &'a Settings, store: &'a StageStore) -> Self {
        Self {
            engine,
            settings,
            store,
        }
    }

    /// Memory in mb declared by the images of all running containers
    pub fn memory_reserved(&self) -> Result<u64> {
        let mut reserved = 0;
        for container in self
            .engine
            .list_containers(&labels::stool_labels(&self.settings.id), true)?
        {
            let info = self.engine.inspect_container(&container)?;
            let declared = match self.engine.inspect_image(&info.image_id) {
                Ok(image) => image.labels.get(LABEL_MEMORY).and_then(|m| m.parse().ok()),
                Err(StoolError::ImageNotFound(_)) => None,
                Err(e) => return Err(e),
            };
            reserved += declared.unwrap_or(info.memory_bytes / MB);
        }
        Ok(reserved)
    }

    /// Memory in mb still available for starts; `None` without a memory quota
    pub fn memory_unreserved(&self) -> Result<Option<u64>> {
        if self.settings.memory_quota == 0 {
            return Ok(None);
        }
        let reserved = self.memory_reserved()?;
        debug!("memory: quota {} mb, reserved {} mb", self.settings.memory_quota, reserved);
        Ok(Some(self.settings.memory_quota.saturating_sub(reserved)))
    }

    /// Disk space in mb used by one stage directory
    pub fn disk_used(&self, stage: &str) -> Result<u64> {
        Ok(dir_size(&self.store.dir(stage))? / MB)
    }

    /// Disk space in mb used by all stages
    pub fn disk_used_total(&self) -> Result<u64> {
        let mut total = 0;
        for stage in self.store.list()? {
            total += dir_size(&self.store.dir(&stage))?;
        }
        Ok(total / MB)
    }

    /// Fail if the global disk quota is used up
    pub fn check_disk(&self, stage: &str) -> Result<()> {
        if self.settings.disk_quota == 0 {
            return Ok(());
        }
        let used = self.disk_used_total()?;
        if used > self.settings.disk_quota {
            return Err(StoolError::DiskExhausted {
                stage: stage.to_string(),
                used,
                quota: self.settings.disk_quota,
            });
        }
        Ok(())
    }
}

fn dir_size(path: &Path) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }
    let mut size = 0;
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() {
            size += entry.metadata().map_err(std::io::Error::from)?.len();
        }
    }
    Ok(size)
}
