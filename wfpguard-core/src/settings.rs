//! Engine settings persistence
//!
//! Windows: %APPDATA%\WfpGuard\engine.json

use crate::enumerate::DEFAULT_BATCH_SIZE;
use crate::error::{FilterError, FilterResult};
use crate::identity::EngineIdentity;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const APP_NAME: &str = "WfpGuard";
const SETTINGS_FILE: &str = "engine.json";

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const MAX_BATCH_SIZE: u32 = 1000;
const MAX_RETRY_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub identity: EngineIdentity,
    /// Records per enumeration batch
    pub enum_batch_size: u32,
    /// Attempts made by `apply_filters_with_retry`
    pub retry_attempts: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            identity: EngineIdentity::default(),
            enum_batch_size: DEFAULT_BATCH_SIZE,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
        }
    }
}

impl EngineSettings {
    /// Clamp numeric fields into their supported ranges
    pub fn normalized(mut self) -> Self {
        self.enum_batch_size = self.enum_batch_size.clamp(1, MAX_BATCH_SIZE);
        self.retry_attempts = self.retry_attempts.clamp(1, MAX_RETRY_ATTEMPTS);
        self
    }
}

fn get_settings_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_NAME))
}

/// Full path to the settings file, when a config directory exists
pub fn get_settings_path() -> Option<PathBuf> {
    get_settings_dir().map(|p| p.join(SETTINGS_FILE))
}

/// Load settings from the default location, falling back to defaults
pub fn load_settings() -> EngineSettings {
    let path = match get_settings_path() {
        Some(p) => p,
        None => {
            debug!("Could not determine settings path, using defaults");
            return EngineSettings::default();
        }
    };

    if !path.exists() {
        debug!("Settings file does not exist, using defaults");
        return EngineSettings::default();
    }

    match load_settings_from(&path) {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            EngineSettings::default()
        }
    }
}

/// Load settings from `path`; errors are returned, not defaulted
pub fn load_settings_from(path: &Path) -> FilterResult<EngineSettings> {
    let content = fs::read_to_string(path)?;
    let settings: EngineSettings = serde_json::from_str(&content)
        .map_err(|e| FilterError::Settings(format!("Failed to parse settings file: {}", e)))?;
    info!("Loaded settings from {:?}", path);
    Ok(settings.normalized())
}

/// Write settings to `path` as pretty JSON, creating parent directories
pub fn save_settings_to(path: &Path, settings: &EngineSettings) -> FilterResult<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir)?;
        }
    }

    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| FilterError::Settings(format!("Failed to serialize settings: {}", e)))?;
    fs::write(path, json)?;
    info!("Saved settings to {:?}", path);
    Ok(())
}

/// Write settings to the default location
pub fn save_settings(settings: &EngineSettings) -> FilterResult<()> {
    let path = get_settings_path().ok_or_else(|| {
        FilterError::Settings("Could not determine settings directory".to_string())
    })?;
    save_settings_to(&path, settings)
}
