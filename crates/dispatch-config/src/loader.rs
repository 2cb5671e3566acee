use std::path::{Path, PathBuf};

use dispatch_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

const DEFAULT_DB_FILE: &str = "dispatch.db";

/// Reads `AppConfig` from YAML or TOML, picking the parser by file extension.
pub struct ConfigLoader;

impl ConfigLoader {
    /// `~/.config/dispatch` (platform equivalent), or `./.dispatch` when no
    /// config directory can be determined.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("dispatch"))
            .unwrap_or_else(|| PathBuf::from(".dispatch"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yml")
    }

    pub fn load(path: &Path) -> Result<AppConfig> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;

        let config = Self::parse(path, &contents)?;
        info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Like [`ConfigLoader::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<AppConfig> {
        if !path.exists() {
            debug!("no config at {}, using defaults", path.display());
            return Ok(AppConfig::default());
        }
        Self::load(path)
    }

    /// Database file to open: the configured path, else `dispatch.db` in the
    /// default config directory.
    pub fn database_path(config: &AppConfig) -> PathBuf {
        config
            .database
            .path
            .clone()
            .unwrap_or_else(|| Self::default_config_dir().join(DEFAULT_DB_FILE))
    }

    fn parse(path: &Path, contents: &str) -> Result<AppConfig> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "yml" | "yaml" => serde_yaml::from_str(contents)
                .map_err(|e| Error::Config(format!("YAML parse error: {e}"))),
            "toml" => {
                toml::from_str(contents).map_err(|e| Error::Config(format!("TOML parse error: {e}")))
            }
            other => Err(Error::Config(format!(
                "unsupported config extension: {other}"
            ))),
        }
    }
}
