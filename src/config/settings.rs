//! Process-wide settings
//!
//! Loaded once at process start (defaults, then an optional JSON file, then
//! `STOOL_*` environment variables) and immutable afterwards. Components get
//! them by reference; there is no global instance.

use super::property::{self, parse, parse_list, parse_map, format_map, Property};
use crate::error::{Result, StoolError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "STOOL";

/// Default settings file name inside the home directory
pub const SETTINGS_FILE: &str = "settings.json";

/// Notify token resolving to the stage creator
pub const NOTIFY_CREATED_BY: &str = "@created-by";
/// Notify token resolving to the last user who modified the stage
pub const NOTIFY_LAST_MODIFIED_BY: &str = "@last-modified-by";

/// Stool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Identifies this stool instance in engine labels
    pub id: String,
    /// Directory holding one sub directory per stage
    pub stages: PathBuf,
    /// State file of the local engine
    pub engine_state: PathBuf,
    /// First allocatable port, inclusive
    pub port_first: u16,
    /// Last allocatable port, inclusive
    pub port_last: u16,
    /// Used for urls and container names
    pub hostname: String,
    /// Receives admin-only validation messages
    pub admin: String,
    /// Memory available for running apps in mb, 0 for unlimited
    pub memory_quota: u64,
    /// Disk available for all stage directories in mb, 0 for unlimited
    pub disk_quota: u64,
    /// Days to wait before removing an expired stage, -1 to never remove
    pub auto_remove: i64,
    /// Root of secret projects mounted into containers
    pub secrets: PathBuf,
    /// Directory with `<name>.p12` keystores for https
    pub certificates: PathBuf,
    /// Default environment for every container
    pub environment: BTreeMap<String, String>,
    /// Default notify list for new stages
    pub notify: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let home = default_home();
        Self {
            id: "stool".to_string(),
            stages: home.join("stages"),
            engine_state: home.join("engine.json"),
            port_first: 9000,
            port_last: 9999,
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            admin: String::new(),
            memory_quota: 0,
            disk_quota: 0,
            auto_remove: -1,
            secrets: home.join("secrets"),
            certificates: home.join("certificates"),
            environment: BTreeMap::new(),
            notify: vec![NOTIFY_CREATED_BY.to_string()],
        }
    }
}

/// Default data directory, `$STOOL_HOME` or the platform data dir
pub fn default_home() -> PathBuf {
    std::env::var_os("STOOL_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/var/lib"))
                .join("stool")
        })
}

impl Settings {
    /// Load settings: defaults, then `file` (if it exists), then the environment
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let default_file = default_home().join(SETTINGS_FILE);
        let file = file.unwrap_or(&default_file);
        let mut settings = if file.exists() {
            info!("Loading settings from {}", file.display());
            serde_json::from_str(&std::fs::read_to_string(file)?)?
        } else {
            debug!("No settings file at {}, using defaults", file.display());
            Settings::default()
        };
        settings.apply_env(|name| std::env::var(name).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `STOOL_<PROPERTY>` overrides through the property table
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for property in SETTINGS_PROPERTIES {
            if let Some(value) = lookup(&property.env_name(ENV_PREFIX)) {
                debug!("Setting {} from environment", property.name);
                (property.set)(self, &value)?;
            }
        }
        Ok(())
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.port_first == 0 || self.port_first > self.port_last {
            return Err(StoolError::InvalidConfig(format!(
                "invalid port range {} .. {}",
                self.port_first, self.port_last
            )));
        }
        if self.hostname.is_empty() {
            return Err(StoolError::InvalidConfig("hostname is empty".to_string()));
        }
        Ok(())
    }

    /// Property view, e.g. for `stool settings`
    pub fn properties(&self) -> BTreeMap<String, String> {
        property::get_all(SETTINGS_PROPERTIES, self)
    }
}

/// All settings, in display order
pub static SETTINGS_PROPERTIES: &[Property<Settings>] = &[
    Property {
        name: "id",
        get: |s| s.id.clone(),
        set: |s, v| {
            s.id = v.to_string();
            Ok(())
        },
    },
    Property {
        name: "stages",
        get: |s| s.stages.display().to_string(),
        set: |s, v| {
            s.stages = PathBuf::from(v);
            Ok(())
        },
    },
    Property {
        name: "engine_state",
        get: |s| s.engine_state.display().to_string(),
        set: |s, v| {
            s.engine_state = PathBuf::from(v);
            Ok(())
        },
    },
    Property {
        name: "port_first",
        get: |s| s.port_first.to_string(),
        set: |s, v| {
            s.port_first = parse("port_first", v)?;
            Ok(())
        },
    },
    Property {
        name: "port_last",
        get: |s| s.port_last.to_string(),
        set: |s, v| {
            s.port_last = parse("port_last", v)?;
            Ok(())
        },
    },
    Property {
        name: "hostname",
        get: |s| s.hostname.clone(),
        set: |s, v| {
            s.hostname = v.trim().to_string();
            Ok(())
        },
    },
    Property {
        name: "admin",
        get: |s| s.admin.clone(),
        set: |s, v| {
            s.admin = v.trim().to_string();
            Ok(())
        },
    },
    Property {
        name: "memory_quota",
        get: |s| s.memory_quota.to_string(),
        set: |s, v| {
            s.memory_quota = parse("memory_quota", v)?;
            Ok(())
        },
    },
    Property {
        name: "disk_quota",
        get: |s| s.disk_quota.to_string(),
        set: |s, v| {
            s.disk_quota = parse("disk_quota", v)?;
            Ok(())
        },
    },
    Property {
        name: "auto_remove",
        get: |s| s.auto_remove.to_string(),
        set: |s, v| {
            s.auto_remove = parse("auto_remove", v)?;
            Ok(())
        },
    },
    Property {
        name: "secrets",
        get: |s| s.secrets.display().to_string(),
        set: |s, v| {
            s.secrets = PathBuf::from(v);
            Ok(())
        },
    },
    Property {
        name: "certificates",
        get: |s| s.certificates.display().to_string(),
        set: |s, v| {
            s.certificates = PathBuf::from(v);
            Ok(())
        },
    },
    Property {
        name: "environment",
        get: |s| format_map(&s.environment),
        set: |s, v| {
            s.environment = parse_map("environment", v)?;
            Ok(())
        },
    },
    Property {
        name: "notify",
        get: |s| s.notify.join(","),
        set: |s, v| {
            s.notify = parse_list(v);
            Ok(())
        },
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert_eq!(settings.port_first, 9000);
        assert_eq!(settings.port_last, 9999);
        assert_eq!(settings.auto_remove, -1);
        settings.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("STOOL_PORT_FIRST", "7000"),
            ("STOOL_PORT_LAST", "7099"),
            ("STOOL_ENVIRONMENT", "A=1,B=2"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings
            .apply_env(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(settings.port_first, 7000);
        assert_eq!(settings.port_last, 7099);
        assert_eq!(settings.environment.len(), 2);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut settings = Settings::default();
        let result = settings.apply_env(|name| {
            (name == "STOOL_MEMORY_QUOTA").then(|| "lots".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_load_file_and_reject_unknown_keys() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("settings.json");

        std::fs::write(&file, r#"{"port_first": 8000, "port_last": 8010, "hostname": "h"}"#).unwrap();
        let settings = Settings::load(Some(&file)).unwrap();
        assert_eq!(settings.port_first, 8000);
        assert_eq!(settings.hostname, "h");

        std::fs::write(&file, r#"{"portFirst": 8000}"#).unwrap();
        assert!(Settings::load(Some(&file)).is_err());
    }

    #[test]
    fn test_invalid_range() {
        let settings = Settings {
            port_first: 9010,
            port_last: 9000,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }
}
