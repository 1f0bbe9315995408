//! Configuration loading and data directory resolution

use crate::file_handler;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV_VAR: &str = "MIM_DATA_DIR";

/// Compiled default data directory (relative to the working directory)
pub const DEFAULT_DATA_DIR: &str = "data/images";

/// File name suffix of every metadata sidecar
pub const METADATA_SUFFIX: &str = "_metadata.json";

/// On-disk TOML configuration. Every key is optional.
///
/// ```toml
/// data_dir = "/srv/imaging/records"
/// suffix = "_metadata.json"
/// create_data_dir = true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_data_dir: Option<bool>,
}

/// Resolved store settings handed to the loader and manager
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub suffix: String,
    /// Create `data_dir` on open/register when it does not exist yet
    pub create_data_dir: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            suffix: METADATA_SUFFIX.to_string(),
            create_data_dir: true,
        }
    }
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Merge a parsed TOML file over the defaults
    pub fn from_toml(toml: TomlConfig) -> Result<Self> {
        let defaults = Self::default();
        let suffix = toml.suffix.unwrap_or(defaults.suffix);
        if suffix.trim().is_empty() {
            return Err(Error::Config("suffix must not be empty".to_string()));
        }

        Ok(Self {
            data_dir: toml.data_dir.unwrap_or(defaults.data_dir),
            suffix,
            create_data_dir: toml.create_data_dir.unwrap_or(defaults.create_data_dir),
        })
    }

    /// Load settings from a specific TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_toml(parse_toml_config(&content)?)
    }

    /// Resolve settings the way an entrypoint would.
    ///
    /// The data directory follows [`resolve_data_dir`]; the remaining keys
    /// come from the user config file when one exists. A missing or broken
    /// config file is not fatal: it is logged and defaults are used.
    pub fn resolve(cli_arg: Option<&str>) -> Self {
        let config_path = default_config_path();
        let toml = config_path
            .as_deref()
            .and_then(read_optional_config)
            .unwrap_or_default();

        let mut config = Self::from_toml(toml).unwrap_or_else(|e| {
            tracing::warn!("Ignoring config file: {}", e);
            Self::default()
        });
        config.data_dir = resolve_data_dir_from(cli_arg, DATA_DIR_ENV_VAR, config_path.as_deref());
        config
    }
}

/// Data directory resolution in priority order:
/// 1. Explicit argument (highest priority)
/// 2. Environment variable
/// 3. `data_dir` from the user TOML config file
/// 4. Compiled default `data/images` (fallback)
pub fn resolve_data_dir(cli_arg: Option<&str>, env_var_name: &str) -> PathBuf {
    resolve_data_dir_from(cli_arg, env_var_name, default_config_path().as_deref())
}

/// [`resolve_data_dir`] with an explicit config file location
pub fn resolve_data_dir_from(
    cli_arg: Option<&str>,
    env_var_name: &str,
    config_path: Option<&Path>,
) -> PathBuf {
    // Priority 1: explicit argument
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    // Priority 2: environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    // Priority 3: TOML config file
    if let Some(data_dir) = config_path
        .and_then(read_optional_config)
        .and_then(|config| config.data_dir)
    {
        return data_dir;
    }

    // Priority 4: compiled default
    PathBuf::from(DEFAULT_DATA_DIR)
}

/// `<config_dir>/mim/config.toml` for the current platform
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("mim").join("config.toml"))
}

pub fn parse_toml_config(content: &str) -> Result<TomlConfig> {
    toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
}

fn read_optional_config(path: &Path) -> Option<TomlConfig> {
    if !path.exists() {
        return None;
    }
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!("Cannot read config file {}: {}", path.display(), e);
            return None;
        }
    };
    match parse_toml_config(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!("Malformed config file {}: {}", path.display(), e);
            None
        }
    }
}

/// Persist a TOML config atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config).map_err(|e| Error::Config(e.to_string()))?;
    file_handler::write_atomic(path, |writer| writer.write_all(content.as_bytes()))?;
    tracing::info!("Wrote config to {}", path.display());
    Ok(())
}
