//! Engine double for tests

use super::{
    BuildRequest, Built, ContainerInfo, ContainerSpec, ContainerStatus, Engine, ImageMeta,
    LocalEngine,
};
use crate::error::{Result, StoolError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Local engine that misreports container status or fails removals on demand
#[derive(Default)]
pub(crate) struct FaultyEngine {
    inner: LocalEngine,
    status: Mutex<Option<ContainerStatus>>,
    fail_remove: AtomicBool,
}

impl FaultyEngine {
    /// Report `status` for every container; `None` reports the real one
    pub(crate) fn report_status(&self, status: Option<ContainerStatus>) {
        *self.status.lock().unwrap() = status;
    }

    pub(crate) fn fail_removals(&self, fail: bool) {
        self.fail_remove.store(fail, Ordering::SeqCst);
    }
}

impl Engine for FaultyEngine {
    fn ping(&self) -> Result<()> {
        self.inner.ping()
    }

    fn build_image(&self, request: &BuildRequest) -> Result<Built> {
        self.inner.build_image(request)
    }

    fn list_images(&self, labels: &HashMap<String, String>) -> Result<Vec<ImageMeta>> {
        self.inner.list_images(labels)
    }

    fn inspect_image(&self, id: &str) -> Result<ImageMeta> {
        self.inner.inspect_image(id)
    }

    fn remove_image(&self, id: &str, force: bool) -> Result<()> {
        self.inner.remove_image(id, force)
    }

    fn list_containers(&self, labels: &HashMap<String, String>, running_only: bool) -> Result<Vec<String>> {
        self.inner.list_containers(labels, running_only)
    }

    fn list_containers_for_image(&self, image_id: &str) -> Result<Vec<String>> {
        self.inner.list_containers_for_image(image_id)
    }

    fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.inner.create_container(spec)
    }

    fn start_container(&self, id: &str) -> Result<()> {
        self.inner.start_container(id)
    }

    fn container_status(&self, id: &str) -> Result<ContainerStatus> {
        match *self.status.lock().unwrap() {
            Some(status) => Ok(status),
            None => self.inner.container_status(id),
        }
    }

    fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        self.inner.stop_container(id, timeout)
    }

    fn remove_container(&self, id: &str) -> Result<()> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(StoolError::Engine(format!("cannot remove {}", id)));
        }
        self.inner.remove_container(id)
    }

    fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        self.inner.inspect_container(id)
    }
}
