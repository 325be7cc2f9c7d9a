//! Configuration loader with multi-source merging

use crate::PyriteConfig;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::env;
use std::path::{Path, PathBuf};

/// Git-tracked project file.
pub const PROJECT_FILE: &str = "pyrite.toml";
/// Gitignored per-checkout overrides.
pub const LOCAL_FILE: &str = "pyrite.local.toml";
const USER_FILE: &str = "config.toml";

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    user_config: bool,
}

impl ConfigLoader {
    /// Create a new config loader with the current directory as project
    /// directory
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "PYRITE".to_string(),
            user_config: true,
        }
    }

    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "PYRITE")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Skip the per-user config file
    pub fn without_user_config(mut self) -> Self {
        self.user_config = false;
        self
    }

    /// Candidate config files, lowest precedence first. Missing files are
    /// skipped by [`load`](Self::load).
    ///
    /// The user file lives in the platform config directory, e.g.
    /// `~/.config/pyrite/config.toml`; it is left out when no home
    /// directory can be found.
    pub fn config_files(&self) -> Vec<PathBuf> {
        let user = ProjectDirs::from("dev", "Pyrite", "pyrite")
            .filter(|_| self.user_config)
            .map(|dirs| dirs.config_dir().join(USER_FILE));
        user.into_iter()
            .chain([
                self.project_dir.join(PROJECT_FILE),
                self.project_dir.join(LOCAL_FILE),
            ])
            .collect()
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<PyriteConfig> {
        let defaults = PyriteConfig::default();
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&defaults)?);

        for file in self.config_files().into_iter().filter(|f| f.exists()) {
            builder = builder.add_source(
                config::File::from(file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // PYRITE_SCHEDULER__LEASE_DURATION_MS and friends. Field names
        // contain underscores, so sections are split on "__".
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;
        let pyrite_config: PyriteConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        pyrite_config
            .validate()
            .context("Configuration failed validation")?;

        Ok(pyrite_config)
    }

    /// Load configuration or return defaults if loading fails
    pub fn load_or_default(self) -> PyriteConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn loader(dir: &Path) -> ConfigLoader {
        ConfigLoader::new()
            .with_project_dir(dir)
            .with_env_prefix("PYRITE_LOADER_TEST")
            .without_user_config()
    }

    #[test]
    fn test_load_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = loader(temp_dir.path()).load().expect("Failed to load config");
        assert_eq!(config, PyriteConfig::default());
    }

    #[test]
    fn test_load_project_config() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_content = r#"
[compactor]
max_compaction_level = 5
tombstone_cleanup_delay_ms = 1000

[scheduler]
max_failures = 7
lease_duration_ms = 30000

[service]
max_new_jobs_per_poll = 8
"#;
        fs::write(project_dir.join("pyrite.toml"), config_content)
            .expect("Failed to write config");

        let config = loader(project_dir).load().expect("Failed to load config");

        assert_eq!(config.compactor.max_compaction_level, 5);
        assert_eq!(config.compactor.tombstone_cleanup_delay_ms, 1000);
        assert_eq!(config.scheduler.max_failures, 7);
        assert_eq!(config.scheduler.lease_duration_ms, 30_000);
        assert_eq!(config.service.max_new_jobs_per_poll, 8);
        // Untouched keys keep their defaults.
        assert_eq!(config.scheduler.max_queue_size, 0);
    }

    #[test]
    fn test_local_overrides() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("pyrite.toml"),
            "[scheduler]\nlease_duration_ms = 20000\n",
        )
        .expect("Failed to write project config");
        fs::write(
            project_dir.join("pyrite.local.toml"),
            "[scheduler]\nlease_duration_ms = 5000\n",
        )
        .expect("Failed to write local config");

        let config = loader(project_dir).load().expect("Failed to load config");
        assert_eq!(config.scheduler.lease_duration_ms, 5000);
    }

    #[test]
    fn test_config_files_order() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();
        assert_eq!(
            loader(project_dir).config_files(),
            [project_dir.join(PROJECT_FILE), project_dir.join(LOCAL_FILE)]
        );

        // Platform dependent; only checked when a home directory exists.
        let files = ConfigLoader::new().with_project_dir(project_dir).config_files();
        if files.len() == 3 {
            assert!(files[0].to_string_lossy().contains("pyrite"));
            assert!(files[0].ends_with(USER_FILE));
        }
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();
        fs::write(
            project_dir.join("pyrite.toml"),
            "[scheduler]\nlease_duration_ms = 0\n",
        )
        .expect("Failed to write config");

        assert!(loader(project_dir).load().is_err());
        assert_eq!(
            loader(project_dir).load_or_default(),
            PyriteConfig::default()
        );
    }
}
