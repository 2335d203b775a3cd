// src/config/mod.rs

//! Configuration loading and validation for auditflow.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Turn the raw model into validated runtime options (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{AccountSeed, ConfigFile, EngineOptions, RawConfigFile, StoreSection};
pub use validate::parse_duration;
