//! Built images and running instances

use crate::engine::labels::{
    self, LABEL_APP, LABEL_COMMENT, LABEL_CONTAINER_PORT_PREFIX, LABEL_CREATED_BY,
    LABEL_CREATED_ON, LABEL_MEMORY, LABEL_ORIGIN, LABEL_SECRETS_PREFIX,
};
use crate::engine::{Engine, ImageMeta};
use crate::error::{Result, StoolError};
use crate::pool::Ports;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Memory in mb assumed for images without a memory label
pub const DEFAULT_MEMORY: u64 = 1024;

/// A built, immutable artifact of one app
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub id: String,
    pub tag: Option<String>,
    pub created: DateTime<Utc>,
    pub app: String,
    /// Container ports the image declares
    pub ports: Ports,
    /// Memory in mb
    pub memory: u64,
    pub comment: String,
    pub origin: String,
    pub created_by: String,
    pub created_on: String,
    /// Secret project to container path
    pub secrets: BTreeMap<String, String>,
}

impl Image {
    pub fn from_meta(meta: &ImageMeta) -> Result<Self> {
        let label = |key: &str| meta.labels.get(key).cloned().unwrap_or_default();
        let app = meta
            .labels
            .get(LABEL_APP)
            .cloned()
            .ok_or_else(|| StoolError::Engine(format!("image {} has no app label", meta.id)))?;
        let memory = match meta.labels.get(LABEL_MEMORY) {
            None => DEFAULT_MEMORY,
            Some(value) => value.parse().map_err(|_| StoolError::InvalidProperty {
                name: LABEL_MEMORY.to_string(),
                message: format!("image {}: not a number: {}", meta.id, value),
            })?,
        };
        let secrets = meta
            .labels
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(LABEL_SECRETS_PREFIX)
                    .map(|project| (project.to_string(), value.clone()))
            })
            .collect();
        Ok(Self {
            id: meta.id.clone(),
            tag: meta.tags.first().cloned(),
            created: meta.created,
            app,
            ports: Ports::from_labels(&meta.labels, LABEL_CONTAINER_PORT_PREFIX)?,
            memory,
            comment: label(LABEL_COMMENT),
            origin: label(LABEL_ORIGIN),
            created_by: label(LABEL_CREATED_BY),
            created_on: label(LABEL_CREATED_ON),
            secrets,
        })
    }

    /// All images of a stage by app, newest first
    pub fn list(engine: &dyn Engine, stool_id: &str, stage: &str) -> Result<BTreeMap<String, Vec<Image>>> {
        let mut result: BTreeMap<String, Vec<Image>> = BTreeMap::new();
        for meta in engine.list_images(&labels::stage_labels(stool_id, stage))? {
            let image = Image::from_meta(&meta)?;
            result.entry(image.app.clone()).or_default().push(image);
        }
        for images in result.values_mut() {
            images.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.id.cmp(&b.id)));
        }
        Ok(result)
    }
}

/// The image an app currently uses, and the container running it if any
#[derive(Debug, Clone, PartialEq)]
pub struct Current {
    pub image: Image,
    pub container: Option<String>,
}

impl Current {
    pub fn is_running(&self) -> bool {
        self.container.is_some()
    }
}
