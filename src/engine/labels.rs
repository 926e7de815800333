//! Engine labels and the port-label reader

use super::Engine;
use crate::error::Result;
use crate::pool::{Allocation, Ports};
use std::collections::HashMap;
use tracing::warn;

const LABEL_PREFIX: &str = "stool.";

/// Stool instance id; marks every image and container stool manages
pub const LABEL_STOOL: &str = "stool.stool";
pub const LABEL_STAGE: &str = "stool.stage";
pub const LABEL_APP: &str = "stool.app";
pub const LABEL_COMMENT: &str = "stool.comment";
pub const LABEL_ORIGIN: &str = "stool.origin";
pub const LABEL_CREATED_BY: &str = "stool.created-by";
pub const LABEL_CREATED_ON: &str = "stool.created-on";
/// Memory in mb an app needs
pub const LABEL_MEMORY: &str = "stool.memory";

/// Allocated host ports on containers
pub const LABEL_HOST_PORT_PREFIX: &str = "stool.host.port.";
/// Ports an image declares
pub const LABEL_CONTAINER_PORT_PREFIX: &str = "stool.container.port.";
/// `stool.mount-secrets-<project>` = container path
pub const LABEL_SECRETS_PREFIX: &str = "stool.mount-secrets-";

/// Labels selecting everything of one stool instance
pub fn stool_labels(stool_id: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(LABEL_STOOL.to_string(), stool_id.to_string());
    labels
}

/// Labels selecting everything of one stage
pub fn stage_labels(stool_id: &str, stage: &str) -> HashMap<String, String> {
    let mut labels = stool_labels(stool_id);
    labels.insert(LABEL_STAGE.to_string(), stage.to_string());
    labels
}

/// True for labels stool itself sets
pub fn is_stool_label(key: &str) -> bool {
    key.starts_with(LABEL_PREFIX)
}

/// Read `(stage, app, ports)` from the labels of all running stool containers.
///
/// Containers with missing or broken labels are skipped with a warning; they
/// cannot be attributed to a stage anyway.
pub fn scan_allocations(engine: &dyn Engine, stool_id: &str) -> Result<Vec<Allocation>> {
    let mut result = Vec::new();
    for container in engine.list_containers(&stool_labels(stool_id), true)? {
        let info = engine.inspect_container(&container)?;
        let (Some(stage), Some(app)) = (info.labels.get(LABEL_STAGE), info.labels.get(LABEL_APP)) else {
            warn!("Container {} has no stage/app labels, ignored", container);
            continue;
        };
        match Ports::from_labels(&info.labels, LABEL_HOST_PORT_PREFIX) {
            Ok(ports) => result.push(Allocation::new(stage, app, ports)),
            Err(e) => warn!("Container {}: {}", container, e),
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ContainerSpec, LocalEngine};

    #[test]
    fn test_scan_allocations_reads_running_containers() {
        let engine = LocalEngine::in_memory();
        let image = engine.add_image("s1/web:1", stage_labels("stool", "s1"));

        let ports = Ports::new(Some(9000), Some(9001), Some(9002), Some(9003));
        let mut labels = stage_labels("stool", "s1");
        labels.insert(LABEL_APP.to_string(), "web".to_string());
        labels.extend(ports.to_labels(LABEL_HOST_PORT_PREFIX));
        let running = engine
            .create_container(&ContainerSpec {
                image_id: image.clone(),
                name: "s1.web".to_string(),
                labels: labels.clone(),
                ..Default::default()
            })
            .unwrap();
        engine.start_container(&running).unwrap();

        // created but never started: not an allocation
        labels.insert(LABEL_APP.to_string(), "api".to_string());
        engine
            .create_container(&ContainerSpec {
                image_id: image,
                name: "s1.api".to_string(),
                labels,
                ..Default::default()
            })
            .unwrap();

        let allocations = scan_allocations(&engine, "stool").unwrap();
        assert_eq!(allocations, vec![Allocation::new("s1", "web", ports)]);
        assert!(scan_allocations(&engine, "other").unwrap().is_empty());
    }
}
