//! Configuration system: TOML file + env var override + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::Result;

/// Default minimum tracked file size. Sub-block files are stored inline in
/// metadata and cannot share extents, so one block is the useful floor.
/// Busy volumes benefit from a much larger cutoff (megabytes) via config.
pub const DEFAULT_SIZE_CUTOFF: u64 = 4096;

/// Block size for byte-exact comparison reads.
pub const DEFAULT_COMPARE_BLOCK: usize = 128 * 1024;

/// Full bdh configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub dedup: DedupConfig,
}

/// State store location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the tracking database. Must be user-private; volume state and
    /// the inode index survive restarts here.
    pub db_path: PathBuf,
}

/// Dedup pass knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DedupConfig {
    /// Minimum size (bytes) of files tracked per volume unless overridden
    /// on the command line.
    pub size_cutoff: u64,
    /// Comparison read block size in bytes.
    pub compare_block: usize,
    /// Defragment both sides before comparison.
    pub defrag: bool,
    /// Allow clones to cross subvolume boundaries (kernel >= 3.6).
    pub crossvol: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("tracking.db"),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            size_cutoff: DEFAULT_SIZE_CUTOFF,
            compare_block: DEFAULT_COMPARE_BLOCK,
            defrag: false,
            crossvol: true,
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Resolution order: explicit `--config` path, `BDH_CONFIG` env var,
    /// the default config file if present, otherwise built-in defaults.
    /// A missing explicit file is an error; a missing default file is not.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let env_path = env::var_os("BDH_CONFIG").map(PathBuf::from);
        let path = explicit
            .map(Path::to_path_buf)
            .or(env_path)
            .unwrap_or_else(default_config_path);

        if !path.exists() {
            if explicit.is_some() {
                return Err(crate::core::errors::BdhError::InvalidConfig {
                    details: format!("config file not found: {}", path.display()),
                });
            }
            return Ok(Self::default());
        }

        let text = fs::read_to_string(&path)
            .map_err(|e| crate::core::errors::BdhError::io(&path, e))?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no pass could run with.
    pub fn validate(&self) -> Result<()> {
        if self.dedup.compare_block == 0 {
            return Err(crate::core::errors::BdhError::InvalidConfig {
                details: "dedup.compare_block must be non-zero".to_string(),
            });
        }
        if self.store.db_path.as_os_str().is_empty() {
            return Err(crate::core::errors::BdhError::InvalidConfig {
                details: "store.db_path must be set".to_string(),
            });
        }
        Ok(())
    }
}

/// `$XDG_DATA_HOME/bdh`, falling back to `~/.local/share/bdh`.
pub fn default_data_dir() -> PathBuf {
    if let Some(xdg) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg).join("bdh");
    }
    home_dir().join(".local/share/bdh")
}

/// `$XDG_CONFIG_HOME/bdh/config.toml`, falling back to `~/.config/bdh/config.toml`.
pub fn default_config_path() -> PathBuf {
    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg).join("bdh/config.toml");
    }
    home_dir().join(".config/bdh/config.toml")
}

fn home_dir() -> PathBuf {
    env::var_os("HOME").map_or_else(|| PathBuf::from("/root"), PathBuf::from)
}
