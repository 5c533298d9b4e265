// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Environment variable overriding the default config path.
pub const CONFIG_ENV_VAR: &str = "FANOUT_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "Fanout.toml";

/// Load a configuration file from a given path and return the raw `RawConfigFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation (hierarchy, target references, ...). Use [`load_and_validate`]
/// for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a configuration file from path and validate it.
///
/// - Reads TOML.
/// - Applies defaults (handled by `serde` + `Default` impls).
/// - Checks for:
///   - a single root and no parent cycles,
///   - unknown parent and target references,
///   - conflicting role declarations,
///   - settings sanity (durations, sizes).
///
/// Isolation rules that need the assembled tree are checked later, by
/// [`ConfigFile::build_tree`].
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw_config = load_from_path(&path)?;
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// `Fanout.toml` in the current directory, unless `FANOUT_CONFIG` is set.
pub fn default_config_path() -> PathBuf {
    config_path_from(std::env::var(CONFIG_ENV_VAR).ok())
}

fn config_path_from(env_value: Option<String>) -> PathBuf {
    match env_value {
        Some(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_CONFIG_FILE),
    }
}
