// src/config/mod.rs

//! Configuration loading and validation for fanout.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate it and turn it into targets and a node tree (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{CONFIG_ENV_VAR, default_config_path, load_and_validate, load_from_path};
pub use model::{
    ActionConfig, ConfigFile, IsolateDecl, MapSource, NodeConfig, RawConfigFile, Settings,
    TargetConfig, TargetKind,
};
