// src/config/loader.rs

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Load a configuration file from a given path and return the raw
/// `RawConfigFile`.
///
/// This only performs TOML deserialization. Use [`load_and_validate`] to get
/// the durations parsed and the accounts checked.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a configuration file from path and validate it.
///
/// A missing file is not an error: every section has defaults, so the
/// defaults are used instead.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let path = path.as_ref();
    let raw_config = match load_from_path(path) {
        Ok(raw) => raw,
        Err(crate::errors::FlowError::IoError(e)) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found; using defaults");
            RawConfigFile::default()
        }
        Err(e) => return Err(e),
    };
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// `Auditflow.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Auditflow.toml")
}
