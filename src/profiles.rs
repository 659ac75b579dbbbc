// SPDX-License-Identifier: GPL-3.0-only

//! Control profiles
//!
//! A profile is a named snapshot of a camera's control values, stored as
//! `<config dir>/camhub/profiles/<camera name>/<profile>.json`.

use crate::backends::camera::types::{BackendError, CameraControl, CameraInfo, ControlType, ControlValue};
use crate::constants::app_info;
use crate::errors::{AppError, AppResult, ProfileError};
use crate::session::StreamController;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Saved control values by control id
pub type ProfileValues = BTreeMap<String, ControlValue>;

/// Replace anything but word characters, `-` and `.` with `_`
pub fn sanitize_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Result of applying a profile
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub applied: usize,
    pub failed: Vec<(String, BackendError)>,
}

/// Profile directory tree
#[derive(Debug, Clone)]
pub struct ProfileStore {
    root: PathBuf,
}

impl ProfileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Profiles under the user's config directory
    pub fn open_default() -> AppResult<Self> {
        let root = dirs::config_dir()
            .ok_or_else(|| AppError::Config("no configuration directory".to_string()))?
            .join(app_info::CONFIG_DIR_NAME)
            .join(app_info::PROFILES_DIR);
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn camera_dir(&self, camera: &CameraInfo) -> PathBuf {
        self.root.join(sanitize_name(&camera.name))
    }

    fn profile_path(&self, camera: &CameraInfo, profile: &str) -> AppResult<PathBuf> {
        let file = sanitize_name(profile);
        if file.is_empty() || file.chars().all(|c| c == '.') {
            return Err(ProfileError::InvalidName(profile.to_string()).into());
        }
        Ok(self.camera_dir(camera).join(format!("{}.json", file)))
    }

    /// Profile names saved for a camera, sorted
    pub fn list(&self, camera: &CameraInfo) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.camera_dir(camera)) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_suffix(".json"))
                    .map(str::to_string)
            })
            .collect();
        names.sort();
        names
    }

    /// Save the current values of a camera's controls
    ///
    /// Buttons have no value and are skipped.
    ///
    /// # Returns
    /// Path of the written profile
    pub fn save(&self, camera: &CameraInfo, profile: &str, controls: &[CameraControl]) -> AppResult<PathBuf> {
        let path = self.profile_path(camera, profile)?;
        let values: ProfileValues = controls
            .iter()
            .filter(|c| c.control_type != ControlType::Button)
            .map(|c| (c.id.clone(), c.value.clone()))
            .collect();

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(&values)?)?;
        info!(camera = %camera.id, profile, count = values.len(), "Profile saved");
        Ok(path)
    }

    pub fn load(&self, camera: &CameraInfo, profile: &str) -> AppResult<ProfileValues> {
        let path = self.profile_path(camera, profile)?;
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProfileError::NotFound {
                    camera: camera.id.clone(),
                    profile: profile.to_string(),
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&text)
            .map_err(|e| ProfileError::Malformed(format!("{}: {}", path.display(), e)).into())
    }

    /// # Returns
    /// `false` when the profile did not exist
    pub fn delete(&self, camera: &CameraInfo, profile: &str) -> AppResult<bool> {
        let path = self.profile_path(camera, profile)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(camera = %camera.id, profile, "Profile deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Push saved values through the controller's `set_control`
///
/// One failing control does not stop the others.
pub async fn apply_profile(controller: &StreamController, camera_id: &str, values: &ProfileValues) -> ApplyReport {
    let mut report = ApplyReport::default();
    for (control, value) in values {
        match controller.set_control(camera_id, control, value.clone()).await {
            Ok(()) => report.applied += 1,
            Err(e) => {
                warn!(camera = camera_id, control = %control, error = %e, "Profile value not applied");
                report.failed.push((control.clone(), e));
            }
        }
    }
    debug!(camera = camera_id, applied = report.applied, failed = report.failed.len(), "Profile applied");
    report
}
