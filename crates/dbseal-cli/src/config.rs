use std::{
    fs,
    path::{Path, PathBuf},
};

use color_eyre::Result;
use dbseal_storage::{kdf::KdfParams, StoreSettings};
use dirs::config_dir;
use serde::{Deserialize, Serialize};

/// Operator configuration loaded from `~/.config/dbseal/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Base directory for relative database paths.
    pub data_dir: Option<PathBuf>,
    pub kdf: KdfParams,
    pub store: StoreConfig,
    pub key: KeyConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub compact_on_close: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            compact_on_close: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeySource {
    #[default]
    Keyring,
    Env,
}

/// Where the master key comes from.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct KeyConfig {
    pub source: KeySource,
    pub env_var: String,
    pub service: String,
    pub account: String,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            source: KeySource::Keyring,
            env_var: "DBSEAL_MASTER_KEY".into(),
            service: "dbseal".into(),
            account: "master-key".into(),
        }
    }
}

impl Config {
    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            kdf: self.kdf,
            compact_on_close: self.store.compact_on_close,
        }
    }

    /// Resolve a database path against `data_dir` when it is relative.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        match &self.data_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

/// Load config from the default path; if missing, return defaults.
pub fn load() -> Result<Config> {
    let path = default_path()?;
    load_from_path(path)
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("dbseal").join("config.toml"))
}

/// Write the config to `path` unless a file is already there, creating parent
/// directories as needed. Never clobbers user edits.
pub fn write_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}
