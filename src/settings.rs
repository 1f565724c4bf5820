use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::config::ProcessingConfig;

fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("framestack")
        .join("settings.json")
}

pub fn save_settings(config: &ProcessingConfig) -> Result<()> {
    let settings_path = settings_path();
    if let Some(parent) = settings_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&settings_path, json)
        .with_context(|| format!("writing {}", settings_path.display()))?;

    log::info!("Settings saved to: {}", settings_path.display());
    Ok(())
}

/// Load persisted settings, falling back to defaults on any problem.
pub fn load_settings() -> ProcessingConfig {
    let settings_path = settings_path();
    if !settings_path.exists() {
        log::info!("No settings file found. Using defaults.");
        return ProcessingConfig::default();
    }

    match std::fs::read_to_string(&settings_path) {
        Ok(json) => match serde_json::from_str(&json) {
            Ok(config) => {
                log::info!("Settings loaded from: {}", settings_path.display());
                config
            }
            Err(e) => {
                log::warn!("Failed to parse settings file: {}. Using defaults.", e);
                ProcessingConfig::default()
            }
        },
        Err(e) => {
            log::warn!("Failed to read settings file: {}. Using defaults.", e);
            ProcessingConfig::default()
        }
    }
}
