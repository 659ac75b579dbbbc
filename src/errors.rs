// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the persistence and command-line layers
//!
//! Driver and session failures stay [`BackendError`]s; this type wraps them
//! together with settings, profile and argument problems.

use crate::backends::camera::BackendError;
use std::fmt;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Main application error type
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Camera backend or session error
    Camera(BackendError),
    /// Settings could not be read, written or interpreted
    Config(String),
    /// Profile errors
    Profile(ProfileError),
    /// Storage/filesystem errors
    Storage(String),
    /// Bad command-line input
    InvalidArgument(String),
    /// Generic error with message
    Other(String),
}

/// Control profile errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    /// No profile with this name for the camera
    NotFound { camera: String, profile: String },
    /// Name is empty once sanitized
    InvalidName(String),
    /// Profile file is not a control map
    Malformed(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Camera(e) => write!(f, "{}", e),
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Profile(e) => write!(f, "Profile error: {}", e),
            AppError::Storage(msg) => write!(f, "Storage error: {}", msg),
            AppError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            AppError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl fmt::Display for ProfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileError::NotFound { camera, profile } => {
                write!(f, "No profile '{}' for camera {}", profile, camera)
            }
            ProfileError::InvalidName(name) => write!(f, "'{}' is not a usable profile name", name),
            ProfileError::Malformed(msg) => write!(f, "Malformed profile: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}
impl std::error::Error for ProfileError {}

impl From<BackendError> for AppError {
    fn from(err: BackendError) -> Self {
        AppError::Camera(err)
    }
}

impl From<ProfileError> for AppError {
    fn from(err: ProfileError) -> Self {
        AppError::Profile(err)
    }
}

impl From<String> for AppError {
    fn from(msg: String) -> Self {
        AppError::Other(msg)
    }
}

impl From<&str> for AppError {
    fn from(msg: &str) -> Self {
        AppError::Other(msg.to_string())
    }
}

// Conversions for I/O errors
impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_errors_keep_their_message() {
        let err: AppError = BackendError::DeviceBusy {
            device: "/dev/video0".to_string(),
            holders: vec!["zoom".to_string()],
        }
        .into();
        assert_eq!(err.to_string(), "Camera in use by: zoom");
    }

    #[test]
    fn test_profile_not_found_message() {
        let err: AppError = ProfileError::NotFound {
            camera: "v4l2:/dev/video0".to_string(),
            profile: "night".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Profile error: No profile 'night' for camera v4l2:/dev/video0"
        );
    }
}
