//! Loaders for the files a driver process reads at startup.
//!
//! - `driver.json`: the driver metadata, served verbatim to controllers.
//! - An optional TOML file with [`EngineSettings`].  Missing keys keep their
//!   defaults, so an empty file is valid.
//!
//! Nothing is ever written back; driver-specific persistence belongs to the
//! driver and lives in its configuration directory.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::domain::{DriverMetadata, EngineSettings};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to parse driver metadata: {0}")]
    Json(#[from] serde_json::Error),
}

fn read(path: &Path) -> Result<String, SettingsError> {
    std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads [`EngineSettings`] from a TOML file.
///
/// # Errors
///
/// [`SettingsError::Io`] if the file cannot be read, [`SettingsError::Toml`]
/// if it is not valid TOML for the settings schema.
pub fn load_engine_settings(path: &Path) -> Result<EngineSettings, SettingsError> {
    let settings: EngineSettings = toml::from_str(&read(path)?)?;
    debug!("engine settings loaded from {}: {settings:?}", path.display());
    Ok(settings)
}

/// Reads a `driver.json` document.
///
/// # Errors
///
/// [`SettingsError::Io`] if the file cannot be read, [`SettingsError::Json`]
/// if required fields are missing or mistyped.
pub fn load_driver_metadata(path: &Path) -> Result<DriverMetadata, SettingsError> {
    let metadata = DriverMetadata::from_json(&read(path)?)?;
    debug!("driver metadata for '{}' loaded from {}", metadata.driver_id, path.display());
    Ok(metadata)
}
