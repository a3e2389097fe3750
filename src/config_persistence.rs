//! Config file loading and data-path resolution.

use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::config::{sanitize_config, Config};
use crate::error::ConfigError;

const CONFIG_FILE_NAME: &str = "artist-deloc.toml";
const DATA_DIR_NAME: &str = "artist-deloc";
const DATABASE_FILE_NAME: &str = "deloc.db";
const UNRESOLVED_FILE_NAME: &str = "unresolved.tsv";
const MAPPINGS_FILE_NAME: &str = "mappings.tsv";

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .ok_or(ConfigError::MissingDirectory("config"))
}

/// Loads the config at `path`, writing defaults first when the file is missing.
///
/// A file that exists but does not parse is left untouched and defaults are
/// used for this run.
pub fn load_or_create_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        let default_config = Config::default();
        info!(
            "Config file not found. Creating default config. path={}",
            path.display()
        );
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string(&default_config)?)?;
        return Ok(sanitize_config(default_config));
    }

    let content = std::fs::read_to_string(path)?;
    let config = match toml::from_str::<Config>(&content) {
        Ok(config) => config,
        Err(err) => {
            warn!(
                "Failed to parse config file {}. Using defaults. error={}",
                path.display(),
                err
            );
            Config::default()
        }
    };
    Ok(sanitize_config(config))
}

/// Filesystem locations derived from the config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    pub data_dir: PathBuf,
    pub database: PathBuf,
    pub unresolved: PathBuf,
    pub mappings: PathBuf,
}

pub fn resolve_data_paths(config: &Config) -> Result<DataPaths, ConfigError> {
    let data_dir = if config.storage.data_dir.trim().is_empty() {
        dirs::data_dir()
            .map(|dir| dir.join(DATA_DIR_NAME))
            .ok_or(ConfigError::MissingDirectory("data"))?
    } else {
        PathBuf::from(config.storage.data_dir.trim())
    };
    let pick = |configured: &str, fallback: &str| {
        if configured.trim().is_empty() {
            data_dir.join(fallback)
        } else {
            PathBuf::from(configured.trim())
        }
    };
    Ok(DataPaths {
        database: data_dir.join(DATABASE_FILE_NAME),
        unresolved: pick(&config.assist.unresolved_path, UNRESOLVED_FILE_NAME),
        mappings: pick(&config.assist.mappings_path, MAPPINGS_FILE_NAME),
        data_dir,
    })
}
