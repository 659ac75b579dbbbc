// SPDX-License-Identifier: GPL-3.0-only

//! Phone bridge backend
//!
//! A phone streams JPEG frames to an ingestion server that lives outside this
//! crate. The server exposes itself as a [`FrameSource`]; frames are pushed
//! to whichever callback the session controller registered, so there is no
//! pipeline description for this backend.

use super::types::*;
use super::CameraBackend;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Id of the single phone camera
pub const PHONE_CAMERA_ID: &str = "phone:bridge";

/// One frame received from the phone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneFrame {
    pub width: u32,
    pub height: u32,
    /// JPEG payload
    pub data: Arc<[u8]>,
}

/// Receiver of pushed frames
pub type FrameCallback = Arc<dyn Fn(PhoneFrame) + Send + Sync>;

/// Producer of pushed frames
pub trait FrameSource: Send + Sync {
    /// Register (`Some`) or unregister (`None`) the frame consumer
    fn set_frame_callback(&self, callback: Option<FrameCallback>);

    /// Whether a callback is currently registered
    fn has_frame_callback(&self) -> bool;

    /// Whether a phone is currently connected
    fn is_connected(&self) -> bool;

    /// Most recent frame, if any was received
    fn latest_frame(&self) -> Option<PhoneFrame>;
}

/// In-process frame source that ingestion code pushes frames into
#[derive(Default)]
pub struct FrameRelay {
    callback: Mutex<Option<FrameCallback>>,
    latest: Mutex<Option<PhoneFrame>>,
    connected: AtomicBool,
    delivered: AtomicU64,
}

impl FrameRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if !connected {
            *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = None;
        }
    }

    /// Hand a frame to the registered callback
    ///
    /// # Returns
    /// `true` when a callback consumed the frame
    pub fn push_frame(&self, frame: PhoneFrame) -> bool {
        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(frame.clone());

        // Clone the callback out so it never runs under the lock
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match callback {
            Some(callback) => {
                callback(frame);
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Frames handed to a callback so far
    pub fn frames_delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl FrameSource for FrameRelay {
    fn set_frame_callback(&self, callback: Option<FrameCallback>) {
        *self.callback.lock().unwrap_or_else(|e| e.into_inner()) = callback;
    }

    fn has_frame_callback(&self) -> bool {
        self.callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn latest_frame(&self) -> Option<PhoneFrame> {
        self.latest.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Registry entry for a connected phone
pub fn phone_camera(width: u32, height: u32) -> CameraInfo {
    let mut camera = CameraInfo::new(PHONE_CAMERA_ID, "Phone Camera", CameraBackendType::Phone, "")
        .with_capabilities(&[Capability::Video, Capability::Photo]);
    if width > 0 && height > 0 {
        camera.formats.push(VideoFormat {
            width,
            height,
            fps: vec![30.0],
            pixel_format: "MJPG".to_string(),
            description: "Phone stream".to_string(),
        });
    }
    camera
}

/// Driver for the phone bridge
pub struct PhoneBackend {
    source: Arc<dyn FrameSource>,
}

impl Default for PhoneBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PhoneBackend {
    /// Backend fed by a fresh [`FrameRelay`]
    pub fn new() -> Self {
        Self {
            source: Arc::new(FrameRelay::new()),
        }
    }

    /// Backend fed by an existing frame source
    pub fn with_source(source: Arc<dyn FrameSource>) -> Self {
        Self { source }
    }
}

impl CameraBackend for PhoneBackend {
    fn backend_type(&self) -> CameraBackendType {
        CameraBackendType::Phone
    }

    fn is_available(&self) -> bool {
        true
    }

    /// The phone is registered when it connects, never detected
    fn detect_cameras(&self) -> BackendResult<Vec<CameraInfo>> {
        Ok(Vec::new())
    }

    fn get_controls(&self, _camera: &mut CameraInfo) -> BackendResult<Vec<CameraControl>> {
        Ok(Vec::new())
    }

    fn set_control(
        &self,
        _camera: &mut CameraInfo,
        control_id: &str,
        _value: &ControlValue,
    ) -> BackendResult<()> {
        Err(BackendError::InvalidControl(format!(
            "the phone camera has no control '{}'",
            control_id
        )))
    }

    fn source_descriptor(&self, _camera: &CameraInfo, _format: Option<&VideoFormat>) -> Option<String> {
        None
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::Push
    }

    fn frame_source(&self) -> Option<Arc<dyn FrameSource>> {
        Some(Arc::clone(&self.source))
    }

    fn can_capture_photo(&self) -> bool {
        true
    }

    /// Save the most recent frame
    fn capture_photo(&self, camera: &CameraInfo, output: &Path) -> BackendResult<()> {
        let frame = self
            .source
            .latest_frame()
            .ok_or_else(|| BackendError::DeviceNotFound(format!("no frame received from {}", camera.name)))?;
        std::fs::write(output, &frame.data[..])?;
        info!(path = %output.display(), width = frame.width, height = frame.height, "Saved phone frame");
        debug!(bytes = frame.data.len(), "Phone frame size");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn frame() -> PhoneFrame {
        PhoneFrame {
            width: 640,
            height: 480,
            data: Arc::from(vec![0xff, 0xd8, 0xff, 0xd9]),
        }
    }

    #[test]
    fn test_relay_delivers_only_with_callback() {
        let relay = FrameRelay::new();
        assert!(!relay.push_frame(frame()));

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        relay.set_frame_callback(Some(Arc::new(move |f: PhoneFrame| {
            assert_eq!(f.width, 640);
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        assert!(relay.push_frame(frame()));
        assert!(relay.push_frame(frame()));

        relay.set_frame_callback(None);
        assert!(!relay.push_frame(frame()));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(relay.frames_delivered(), 2);
    }

    #[test]
    fn test_backend_is_push_without_descriptor() {
        let backend = PhoneBackend::new();
        let camera = phone_camera(1280, 720);
        assert_eq!(camera.id, PHONE_CAMERA_ID);
        assert_eq!(backend.source_kind(), SourceKind::Push);
        assert_eq!(backend.source_descriptor(&camera, None), None);
        assert!(backend.frame_source().is_some());
        assert!(backend.detect_cameras().unwrap().is_empty());
    }

    #[test]
    fn test_capture_needs_a_frame() {
        let relay = Arc::new(FrameRelay::new());
        let backend = PhoneBackend::with_source(relay.clone());
        let camera = phone_camera(640, 480);
        let path = std::env::temp_dir().join(format!("camhub-phone-{}.jpg", uuid::Uuid::new_v4()));

        assert!(backend.capture_photo(&camera, &path).is_err());

        relay.set_connected(true);
        relay.push_frame(frame());
        backend.capture_photo(&camera, &path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![0xff, 0xd8, 0xff, 0xd9]);
        let _ = std::fs::remove_file(&path);
    }
}
