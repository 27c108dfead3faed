//! Server settings
//!
//! Loaded from `settings.json` (or an explicit path), then overridden by the
//! command line.

use crate::storage::{get_config_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Sampling chain parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingSettings {
    /// Min-p cutoff (0.0 - 1.0)
    pub min_p: f32,
    /// Temperature (0.0 - 2.0). Below 0.01 the chain is greedy.
    pub temperature: f32,
    /// Seed for the distribution sampler
    pub seed: u32,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            min_p: 0.05,
            temperature: 0.8,
            // LLAMA_DEFAULT_SEED: a random seed per process
            seed: 0xFFFF_FFFF,
        }
    }
}

/// Server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// GGUF model to serve
    pub model_path: Option<PathBuf>,
    /// Context window in tokens
    pub context_size: u32,
    /// Number of layers to offload to the GPU (0 = CPU only)
    pub gpu_layers: u32,
    /// Address to listen on
    pub host: String,
    pub port: u16,
    /// Generated tokens per request (0 = until end of generation or full context)
    pub max_tokens: u32,
    pub sampling: SamplingSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            model_path: None,
            context_size: 2048,
            gpu_layers: 99, // Offload all layers to GPU by default
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_tokens: 0,
            sampling: SamplingSettings::default(),
        }
    }
}

impl ServerSettings {
    /// Validate settings values
    ///
    /// Clamps sampling parameters and restores defaults for unusable values.
    pub fn validate(&mut self) {
        self.sampling.temperature = self.sampling.temperature.clamp(0.0, 2.0);
        self.sampling.min_p = self.sampling.min_p.clamp(0.0, 1.0);

        if self.context_size == 0 {
            self.context_size = 2048;
        }

        if self.host.trim().is_empty() {
            self.host = "0.0.0.0".to_string();
        }
    }
}

/// Default settings file path
pub fn default_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_config_dir()?.join("settings.json"))
}

fn resolve_path(path: Option<&Path>) -> Result<PathBuf, StorageError> {
    match path {
        Some(p) => Ok(p.to_path_buf()),
        None => default_settings_path(),
    }
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings(path: Option<&Path>) -> ServerSettings {
    match load_settings_internal(path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            ServerSettings::default()
        }
    }
}

/// Internal settings loading with error propagation
fn load_settings_internal(path: Option<&Path>) -> Result<ServerSettings, StorageError> {
    let path = resolve_path(path)?;

    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(ServerSettings::default());
    }

    let json = fs::read_to_string(&path)?;
    let mut settings: ServerSettings = serde_json::from_str(&json)?;

    // Validate loaded settings
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to disk, returning the path written
pub fn save_settings(
    settings: &ServerSettings,
    path: Option<&Path>,
) -> Result<PathBuf, StorageError> {
    let path = resolve_path(path)?;

    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(&path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(path)
}
