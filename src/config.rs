// SPDX-License-Identifier: GPL-3.0-only

//! Persistent key/value settings
//!
//! Settings live in one JSON object under the user's config directory. The
//! file is rewritten atomically on every change. Unreadable files and values
//! of the wrong type fall back to their defaults instead of failing start-up.

use crate::backends::camera::network::NetworkCameraEntry;
use crate::constants::app_info;
use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// User settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    // Window
    pub window_width: u32,
    pub window_height: u32,
    pub window_maximized: bool,
    // Preview
    /// Preferred frame height ("720", "1080p", "1920x1080"); empty picks automatically
    pub preferred_resolution: String,
    /// Frame rate cap, 0 for none
    pub fps_limit: u32,
    #[serde(rename = "mirror_preview")]
    pub mirror_preview: bool,
    // Photo
    /// Empty uses the pictures directory
    pub photo_directory: String,
    /// `{datetime}` is replaced with the capture time
    pub photo_name_pattern: String,
    // gPhoto2
    /// Live view bitrate in kbit/s
    pub gphoto2_bitrate: u32,
    // General
    pub auto_start_preview: bool,
    #[serde(rename = "hotplug_enabled")]
    pub hotplug_enabled: bool,
    pub last_camera_id: Option<String>,
    pub virtual_camera_enabled: bool,
    /// Manually added network cameras
    #[serde(rename = "ip_cameras")]
    pub ip_cameras: Vec<NetworkCameraEntry>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            window_width: 1100,
            window_height: 700,
            window_maximized: false,
            preferred_resolution: String::new(),
            fps_limit: 0,
            mirror_preview: false,
            photo_directory: String::new(),
            photo_name_pattern: "photo_{datetime}".to_string(),
            gphoto2_bitrate: 5000,
            auto_start_preview: true,
            hotplug_enabled: true,
            last_camera_id: None,
            virtual_camera_enabled: false,
            ip_cameras: Vec::new(),
        }
    }
}

impl Settings {
    /// Frame rate cap, if one is set
    pub fn fps_cap(&self) -> Option<u32> {
        (self.fps_limit > 0).then_some(self.fps_limit)
    }

    /// Last used camera id, ignoring an empty value
    pub fn last_camera(&self) -> Option<&str> {
        self.last_camera_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Directory photos are saved to
    pub fn photo_dir(&self) -> PathBuf {
        if self.photo_directory.trim().is_empty() {
            dirs::picture_dir()
                .or_else(dirs::home_dir)
                .unwrap_or_else(std::env::temp_dir)
                .join("camhub")
        } else {
            PathBuf::from(self.photo_directory.trim())
        }
    }

    /// Build settings from a JSON object, dropping keys whose values do not fit
    pub fn from_value_lenient(value: Value) -> Self {
        let Value::Object(stored) = value else {
            warn!("Settings file is not a JSON object, using defaults");
            return Self::default();
        };

        let mut merged = match serde_json::to_value(Self::default()) {
            Ok(Value::Object(map)) => map,
            _ => return Self::default(),
        };
        for (key, value) in stored {
            if !merged.contains_key(&key) {
                debug!(key = %key, "Ignoring unknown setting");
                continue;
            }
            let previous = merged.insert(key.clone(), value);
            if serde_json::from_value::<Self>(Value::Object(merged.clone())).is_err() {
                warn!(key = %key, "Setting has the wrong type, using its default");
                if let Some(previous) = previous {
                    merged.insert(key, previous);
                }
            }
        }
        serde_json::from_value(Value::Object(merged)).unwrap_or_default()
    }
}

/// Interpret a command-line value: JSON when it parses, a plain string otherwise
pub fn parse_cli_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Settings file with an in-memory copy
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    settings: Mutex<Settings>,
}

impl SettingsStore {
    /// `<config dir>/camhub/settings.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| {
            dir.join(app_info::CONFIG_DIR_NAME)
                .join(app_info::SETTINGS_FILE)
        })
    }

    /// Open the settings file in the user's config directory
    pub fn open_default() -> AppResult<Self> {
        let path = Self::default_path()
            .ok_or_else(|| AppError::Config("no configuration directory".to_string()))?;
        Ok(Self::open(path))
    }

    /// Load settings from `path`; a missing or corrupt file yields defaults
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = load(&path);
        Self {
            path,
            settings: Mutex::new(settings),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current settings
    pub fn settings(&self) -> Settings {
        self.settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Change settings and persist them when anything changed
    pub fn update(&self, change: impl FnOnce(&mut Settings)) -> AppResult<()> {
        let mut settings = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        let mut updated = settings.clone();
        change(&mut updated);
        if updated == *settings {
            return Ok(());
        }
        write_atomic(&self.path, &updated)?;
        *settings = updated;
        Ok(())
    }

    /// Value of one setting by its file key
    pub fn get(&self, key: &str) -> Option<Value> {
        match serde_json::to_value(self.settings()) {
            Ok(Value::Object(mut map)) => map.remove(key),
            _ => None,
        }
    }

    /// Set one setting by its file key
    ///
    /// # Errors
    /// Unknown keys and values of the wrong type are rejected.
    pub fn set(&self, key: &str, value: Value) -> AppResult<()> {
        let mut settings = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        let Value::Object(mut map) = serde_json::to_value(&*settings)? else {
            return Err(AppError::Config("settings are not an object".to_string()));
        };
        if !map.contains_key(key) {
            return Err(AppError::Config(format!("unknown setting '{}'", key)));
        }
        map.insert(key.to_string(), value);
        let updated: Settings = serde_json::from_value(Value::Object(map))
            .map_err(|e| AppError::Config(format!("invalid value for '{}': {}", key, e)))?;
        if updated != *settings {
            write_atomic(&self.path, &updated)?;
            *settings = updated;
        }
        info!(key, "Setting saved");
        Ok(())
    }

    /// All file keys
    pub fn keys(&self) -> Vec<String> {
        match serde_json::to_value(Settings::default()) {
            Ok(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }
}

fn load(path: &Path) -> Settings {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No settings file, using defaults");
            return Settings::default();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read settings, using defaults");
            return Settings::default();
        }
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => Settings::from_value_lenient(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt settings file, using defaults");
            Settings::default()
        }
    }
}

/// Write through a temporary file in the same directory, then rename over the target
fn write_atomic(path: &Path, settings: &Settings) -> AppResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| AppError::Config(format!("{} has no parent directory", path.display())))?;
    std::fs::create_dir_all(dir)?;

    let json = serde_json::to_string_pretty(settings)?;
    let tmp = dir.join(format!(".settings-{}.tmp", uuid::Uuid::new_v4()));
    if let Err(e) = std::fs::write(&tmp, json).and_then(|_| std::fs::rename(&tmp, path)) {
        let _ = std::fs::remove_file(&tmp);
        return Err(AppError::Storage(format!(
            "failed to save {}: {}",
            path.display(),
            e
        )));
    }
    debug!(path = %path.display(), "Settings written");
    Ok(())
}
