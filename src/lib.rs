// SPDX-License-Identifier: GPL-3.0-only

//! camhub - camera discovery and streaming sessions for Linux
//!
//! Cameras are reached only through external tools and daemons (v4l2-ctl,
//! gphoto2, libcamera, PipeWire, GStreamer). This crate reconciles those
//! backends into one camera model and drives streaming sessions over it.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`backends`]: Driver trait, per-backend drivers, registry, hotplug and conflict resolution
//! - [`session`]: Streaming session controller and pipeline engines
//! - [`config`]: Persistent user settings
//! - [`profiles`]: Saved control presets
//! - [`errors`]: Errors of the persistence and command-line layers
//!
//! # Example
//!
//! ```no_run
//! use camhub::backends::camera::{CameraManager, SystemRunner};
//! use std::sync::Arc;
//!
//! # async fn demo() {
//! let manager = CameraManager::with_default_backends(Arc::new(SystemRunner::new())).await;
//! manager.detect_cameras().await;
//! for camera in manager.cameras() {
//!     println!("{} {}", camera.id, camera.name);
//! }
//! # }
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod errors;
pub mod profiles;
pub mod session;

// Re-export commonly used types
pub use backends::camera::{CameraBackend, CameraInfo, CameraManager};
pub use config::{Settings, SettingsStore};
pub use errors::{AppError, AppResult};
pub use session::{PlayOutcome, SessionEvent, SessionState, StreamController};
