// SPDX-License-Identifier: GPL-3.0-only

//! Camera backend abstraction
//!
//! Every device family is reached through one driver implementing
//! [`CameraBackend`]. The registry and the session controller only ever talk
//! to drivers through this trait.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │   StreamController   │  ← Session state machine, hot-swap, bounded retry
//! └──────────┬───────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐
//! │    CameraManager     │  ← Concurrent detection, dedup, change events, hotplug
//! └──────────┬───────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐
//! │ CameraBackend Trait  │  ← Common interface
//! └──────────┬───────────┘
//!            │
//!            ▼
//!  ┌──────┬───────┬─────────┬────────┬───────┬──────┐
//!  │ V4L2 │gPhoto2│libcamera│PipeWire│Network│Phone │
//!  └──────┴───────┴─────────┴────────┴───────┴──────┘
//! ```

pub mod conflict;
pub mod dependencies;
pub mod gphoto2;
pub mod hotplug;
pub mod libcamera;
pub mod manager;
pub mod network;
pub mod phone;
pub mod pipewire;
pub mod process;
pub mod types;
pub mod v4l2;

pub use conflict::ConflictResolver;
pub use hotplug::{HotplugHandle, HotplugMonitor};
pub use manager::{CameraManager, ManagerEvent};
pub use phone::{FrameCallback, FrameRelay, FrameSource, PhoneFrame};
pub use process::{CommandOutput, CommandRunner, ScriptedRunner, SystemRunner};
pub use types::*;

use std::path::Path;
use std::sync::Arc;

/// Interface every camera driver implements
///
/// Methods that shell out to external tools block their calling thread for
/// up to the tool's timeout. Callers on an async runtime run them through
/// `spawn_blocking`. Expected failures (missing tool, busy device, garbled
/// output) come back as `Err`, never as panics.
pub trait CameraBackend: Send + Sync {
    // ===== Metadata =====

    /// Get the backend type identifier
    fn backend_type(&self) -> CameraBackendType;

    /// Check if this backend is available on the current system
    ///
    /// Cheap presence check of the backend's tool or daemon. Returns false on
    /// any failure.
    fn is_available(&self) -> bool;

    // ===== Enumeration =====

    /// Enumerate cameras reachable through this backend
    ///
    /// # Returns
    /// * `Ok(cameras)` - Enumeration ran; an empty list means nothing is connected
    /// * `Err(BackendError)` - The enumeration tool failed
    fn detect_cameras(&self) -> BackendResult<Vec<CameraInfo>>;

    // ===== Controls =====

    /// Read the camera's adjustable parameters
    ///
    /// May take seconds. Safe to call repeatedly. The driver may refresh the
    /// camera's identity (port renumbering) while doing so.
    fn get_controls(&self, camera: &mut CameraInfo) -> BackendResult<Vec<CameraControl>>;

    /// Write one control value
    ///
    /// Either the value is applied or an error is returned; never partially applied.
    fn set_control(
        &self,
        camera: &mut CameraInfo,
        control_id: &str,
        value: &ControlValue,
    ) -> BackendResult<()>;

    /// Restore one control to its default value
    ///
    /// # Returns
    /// * `Ok(true)` - The default was written
    /// * `Ok(false)` - The control is inactive or read-only and was left alone
    fn reset_control(&self, camera: &mut CameraInfo, control: &CameraControl) -> BackendResult<bool> {
        if control.is_inactive() || control.is_read_only() {
            return Ok(false);
        }
        self.set_control(camera, &control.id, &control.default)?;
        Ok(true)
    }

    /// Restore every writable control to its default value
    ///
    /// # Returns
    /// Number of controls that were reset
    fn reset_all_controls(&self, camera: &mut CameraInfo, controls: &[CameraControl]) -> usize {
        controls
            .iter()
            .filter(|control| matches!(self.reset_control(camera, control), Ok(true)))
            .count()
    }

    // ===== Streaming =====

    /// Build the source descriptor for the external media pipeline
    ///
    /// Pure function of the camera's current state.
    ///
    /// # Returns
    /// * `Some(descriptor)` - Pipeline source description
    /// * `None` - This camera cannot be streamed
    fn source_descriptor(&self, camera: &CameraInfo, format: Option<&VideoFormat>) -> Option<String>;

    /// How frames from this backend reach the consumer
    fn source_kind(&self) -> SourceKind {
        SourceKind::Direct
    }

    /// Whether a long-lived helper process must run before the source can be built
    fn needs_external_streaming_setup(&self) -> bool {
        false
    }

    /// Start the helper process for `camera`
    ///
    /// Returns `Ok(())` immediately when the helper for this camera is already alive.
    fn start_external_streaming(&self, _camera: &mut CameraInfo) -> BackendResult<()> {
        Ok(())
    }

    /// Stop the helper process for `camera` only
    fn stop_external_streaming(&self, _camera: &CameraInfo) {}

    /// Whether the helper for `camera` is confirmed alive right now
    fn is_camera_streaming(&self, _camera: &CameraInfo) -> bool {
        false
    }

    /// Push-based frame source, for backends that do not use a pipeline
    fn frame_source(&self) -> Option<Arc<dyn FrameSource>> {
        None
    }

    // ===== Capture: Photo =====

    /// Whether [`CameraBackend::capture_photo`] is supported
    fn can_capture_photo(&self) -> bool {
        false
    }

    /// Capture a still image to `output`
    fn capture_photo(&self, _camera: &CameraInfo, _output: &Path) -> BackendResult<()> {
        Err(BackendError::NotAvailable(format!(
            "{} cannot capture photos",
            self.backend_type()
        )))
    }
}

/// Build the full set of drivers, sharing one command runner
///
/// The order here is the registration order the registry uses for
/// "first occurrence wins" deduplication.
pub fn default_backends(runner: Arc<dyn CommandRunner>) -> Vec<Arc<dyn CameraBackend>> {
    CameraBackendType::ALL
        .iter()
        .map(|backend_type| get_backend_for_type(*backend_type, Arc::clone(&runner)))
        .collect()
}

/// Get a concrete backend instance for a backend type
pub fn get_backend_for_type(
    backend_type: CameraBackendType,
    runner: Arc<dyn CommandRunner>,
) -> Arc<dyn CameraBackend> {
    match backend_type {
        CameraBackendType::V4l2 => Arc::new(v4l2::V4l2Backend::new(runner)),
        CameraBackendType::Gphoto2 => Arc::new(gphoto2::Gphoto2Backend::new(runner)),
        CameraBackendType::Libcamera => Arc::new(libcamera::LibcameraBackend::new(runner)),
        CameraBackendType::PipeWire => Arc::new(pipewire::PipeWireBackend::new(runner)),
        CameraBackendType::Network => Arc::new(network::NetworkBackend::new(runner)),
        CameraBackendType::Phone => Arc::new(phone::PhoneBackend::new()),
    }
}
