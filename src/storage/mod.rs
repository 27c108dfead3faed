//! Configuration storage
//!
//! Locates and persists the server settings file.

use std::path::PathBuf;
use thiserror::Error;

pub mod settings;

pub use settings::{load_settings, save_settings, SamplingSettings, ServerSettings};

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access config directory: {0}")]
    ConfigDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Get the application config directory
///
/// - Windows: `C:\Users\{user}\AppData\Roaming\slotserve\slotserve\config`
/// - macOS: `/Users/{user}/Library/Application Support/com.slotserve.slotserve`
/// - Linux: `/home/{user}/.config/slotserve`
pub fn get_config_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "slotserve", "slotserve")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| {
            StorageError::ConfigDirError("Could not determine config directory".to_string())
        })
}
