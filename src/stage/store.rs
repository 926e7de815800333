//! Stage directories
//!
//! Every stage owns `<stages>/<name>/` with `config.json`, a `logs/` tree and
//! the generated build `context/`.

use super::config::StageConfig;
use crate::error::{Result, StoolError};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info};

const CONFIG_FILE: &str = "config.json";

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_.-]*$").expect("stage name pattern"))
}

/// Directory based store of stage configurations
#[derive(Debug, Clone)]
pub struct StageStore {
    root: PathBuf,
}

impl StageStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stage names start with a lowercase letter or digit and use only `a-z0-9-_.`
    pub fn validate_name(name: &str) -> Result<()> {
        if name_pattern().is_match(name) {
            Ok(())
        } else {
            Err(StoolError::InvalidName(name.to_string()))
        }
    }

    pub fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn logs_dir(&self, name: &str) -> PathBuf {
        self.dir(name).join("logs")
    }

    pub fn context_dir(&self, name: &str) -> PathBuf {
        self.dir(name).join("context")
    }

    fn config_file(&self, name: &str) -> PathBuf {
        self.dir(name).join(CONFIG_FILE)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.config_file(name).is_file()
    }

    /// Create the directory tree of a new stage
    pub fn create(&self, name: &str, config: &StageConfig) -> Result<()> {
        Self::validate_name(name)?;
        if self.exists(name) {
            return Err(StoolError::StageExists(name.to_string()));
        }
        fs::create_dir_all(self.logs_dir(name))?;
        self.save(name, config)?;
        info!("Created stage {} in {}", name, self.dir(name).display());
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<StageConfig> {
        let file = self.config_file(name);
        if !file.is_file() {
            return Err(StoolError::StageNotFound(name.to_string()));
        }
        Ok(serde_json::from_str(&fs::read_to_string(file)?)?)
    }

    /// Write the config; replaces the old file in one step
    pub fn save(&self, name: &str, config: &StageConfig) -> Result<()> {
        let file = self.config_file(name);
        let tmp = file.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(config)?)?;
        fs::rename(&tmp, &file)?;
        debug!("Saved config of stage {}", name);
        Ok(())
    }

    /// Names of all stages, sorted
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if self.exists(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete the whole stage directory
    pub fn delete(&self, name: &str) -> Result<()> {
        let dir = self.dir(name);
        if !dir.exists() {
            return Err(StoolError::StageNotFound(name.to_string()));
        }
        fs::remove_dir_all(&dir)?;
        info!("Deleted {}", dir.display());
        Ok(())
    }
}
