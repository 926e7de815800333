//! Per-stage configuration

use crate::config::property::{self, format_map, parse, parse_list, parse_map, Property};
use crate::config::{Expire, Settings};
use crate::error::{Result, StoolError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Persisted configuration of one stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Who receives validation messages: logins, addresses, `@created-by`, `@last-modified-by`
    pub notify: Vec<String>,
    pub expire: Expire,
    pub comment: String,
    /// Extra environment for the stage's containers
    pub environment: BTreeMap<String, String>,
    /// Disk quota for the stage directory in mb, 0 for unlimited
    pub quota: u64,
    /// Build command, informational
    pub build: String,
    pub created_by: String,
    pub last_modified_by: String,
}

impl StageConfig {
    /// Fresh configuration for a stage created by `who`
    pub fn new(settings: &Settings, who: &str) -> Self {
        Self {
            notify: settings.notify.clone(),
            created_by: who.to_string(),
            last_modified_by: who.to_string(),
            ..Default::default()
        }
    }

    pub fn get(&self, name: &str) -> Result<String> {
        let property = property::lookup(STAGE_PROPERTIES, name)?;
        Ok((property.get)(self))
    }

    /// Apply assignments atomically and record `who` as last modifier
    pub fn set(&mut self, assignments: &BTreeMap<String, String>, who: &str) -> Result<()> {
        property::set_all(STAGE_PROPERTIES, self, assignments)?;
        self.last_modified_by = who.to_string();
        Ok(())
    }

    pub fn properties(&self) -> BTreeMap<String, String> {
        property::get_all(STAGE_PROPERTIES, self)
    }
}

fn read_only(name: &str) -> Result<()> {
    Err(StoolError::InvalidProperty {
        name: name.to_string(),
        message: "property is read-only".to_string(),
    })
}

/// Stage properties, in display order
pub static STAGE_PROPERTIES: &[Property<StageConfig>] = &[
    Property {
        name: "notify",
        get: |c| c.notify.join(","),
        set: |c, v| {
            c.notify = parse_list(v);
            Ok(())
        },
    },
    Property {
        name: "expire",
        get: |c| c.expire.to_string(),
        set: |c, v| {
            c.expire = Expire::parse(v)?;
            Ok(())
        },
    },
    Property {
        name: "comment",
        get: |c| c.comment.clone(),
        set: |c, v| {
            c.comment = v.to_string();
            Ok(())
        },
    },
    Property {
        name: "environment",
        get: |c| format_map(&c.environment),
        set: |c, v| {
            c.environment = parse_map("environment", v)?;
            Ok(())
        },
    },
    Property {
        name: "quota",
        get: |c| c.quota.to_string(),
        set: |c, v| {
            c.quota = parse("quota", v)?;
            Ok(())
        },
    },
    Property {
        name: "build",
        get: |c| c.build.clone(),
        set: |c, v| {
            c.build = v.to_string();
            Ok(())
        },
    },
    Property {
        name: "created-by",
        get: |c| c.created_by.clone(),
        set: |_, _| read_only("created-by"),
    },
    Property {
        name: "last-modified-by",
        get: |c| c.last_modified_by.clone(),
        set: |_, _| read_only("last-modified-by"),
    },
];
