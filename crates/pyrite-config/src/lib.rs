//! Configuration management for Pyrite
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (PYRITE_* prefix, "__" between sections)
//! 2. pyrite.local.toml (gitignored, local overrides)
//! 3. pyrite.toml (git-tracked, project config)
//! 4. ~/.config/pyrite/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use anyhow::Result;
use pyrite_compaction::{CompactorConfig, SchedulerConfig};
use pyrite_metastore::ServiceConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

mod error;
mod loader;

pub use error::ConfigError;
pub use loader::{ConfigLoader, LOCAL_FILE, PROJECT_FILE};

/// Main Pyrite configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PyriteConfig {
    pub compactor: CompactorConfig,
    pub scheduler: SchedulerConfig,
    pub service: ServiceConfig,
}

impl PyriteConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Reads a single TOML file, without layering.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the configuration as TOML, e.g. to seed a pyrite.toml.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Rejects thresholds the compactor and scheduler cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.compactor
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        self.scheduler
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(())
    }
}
