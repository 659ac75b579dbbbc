// SPDX-License-Identifier: GPL-3.0-only

//! Camera registry and detection orchestrator
//!
//! The manager provides:
//! - Backend availability probing (once, at construction)
//! - Concurrent detection across backends with "first occurrence wins" dedup
//! - Manually registered cameras (network URLs, phone bridge)
//! - Change notifications that fire only when the set of camera ids changes

use super::network::{self, NetworkCameraEntry};
use super::process::CommandRunner;
use super::types::*;
use super::{CameraBackend, default_backends};
use futures::Stream;
use futures::future::join_all;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the event channel before slow subscribers start lagging
const EVENT_CAPACITY: usize = 64;

/// Notifications published by the registry
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    /// The set of camera ids changed; carries the full new list
    CamerasChanged(Vec<CameraInfo>),
    /// One backend's enumeration failed; other backends' results still apply
    DetectionFailed {
        backend: CameraBackendType,
        reason: String,
    },
}

/// Internal registry state
struct ManagerInner {
    /// Backends that passed their availability probe, in registration order
    backends: Vec<Arc<dyn CameraBackend>>,
    /// Backends excluded for the lifetime of the process
    unavailable: Vec<CameraBackendType>,
    cameras: Mutex<Vec<CameraInfo>>,
    detecting: AtomicBool,
    events: broadcast::Sender<ManagerEvent>,
}

/// Clears the detection flag when a pass ends, however it ends
struct DetectionGuard<'a>(&'a AtomicBool);

impl<'a> DetectionGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DetectionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Camera registry
///
/// Thread-safe and cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct CameraManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for CameraManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraManager")
            .field("backends", &self.available_backends())
            .field("unavailable", &self.inner.unavailable)
            .field("cameras", &self.cameras().len())
            .field("detecting", &self.is_detecting())
            .finish()
    }
}

impl CameraManager {
    /// Create a registry, keeping only the backends whose probe succeeds
    ///
    /// Probes run on the calling thread and may block for a few seconds;
    /// prefer [`CameraManager::probe`] from async code.
    pub fn new(backends: Vec<Arc<dyn CameraBackend>>) -> Self {
        let probed = backends
            .into_iter()
            .map(|backend| {
                let available = backend.is_available();
                (backend, available)
            })
            .collect();
        Self::from_probed(probed)
    }

    /// Create a registry, probing every backend concurrently on the blocking pool
    pub async fn probe(backends: Vec<Arc<dyn CameraBackend>>) -> Self {
        let checks = backends.into_iter().map(|backend| async move {
            let probe = Arc::clone(&backend);
            let available = tokio::task::spawn_blocking(move || probe.is_available())
                .await
                .unwrap_or(false);
            (backend, available)
        });
        Self::from_probed(join_all(checks).await)
    }

    /// Registry over every built-in backend sharing `runner`
    pub async fn with_default_backends(runner: Arc<dyn CommandRunner>) -> Self {
        Self::probe(default_backends(runner)).await
    }

    fn from_probed(probed: Vec<(Arc<dyn CameraBackend>, bool)>) -> Self {
        let mut backends = Vec::new();
        let mut unavailable = Vec::new();
        for (backend, available) in probed {
            let backend_type = backend.backend_type();
            if available {
                info!(backend = %backend_type, "Backend available");
                backends.push(backend);
            } else {
                info!(backend = %backend_type, "Backend unavailable, excluded");
                unavailable.push(backend_type);
            }
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                backends,
                unavailable,
                cameras: Mutex::new(Vec::new()),
                detecting: AtomicBool::new(false),
                events,
            }),
        }
    }

    // ===== Queries =====

    /// Types of the backends that passed their probe, in registration order
    pub fn available_backends(&self) -> Vec<CameraBackendType> {
        self.inner.backends.iter().map(|b| b.backend_type()).collect()
    }

    /// Types of the backends excluded at construction
    pub fn unavailable_backends(&self) -> Vec<CameraBackendType> {
        self.inner.unavailable.clone()
    }

    /// Driver for a backend type, if it is available
    pub fn backend(&self, backend_type: CameraBackendType) -> Option<Arc<dyn CameraBackend>> {
        self.inner
            .backends
            .iter()
            .find(|b| b.backend_type() == backend_type)
            .cloned()
    }

    /// Snapshot of the camera list
    pub fn cameras(&self) -> Vec<CameraInfo> {
        self.inner
            .cameras
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Look up one camera by id
    pub fn camera(&self, id: &str) -> Option<CameraInfo> {
        self.inner
            .cameras
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    /// Whether a detection pass is running
    pub fn is_detecting(&self) -> bool {
        self.inner.detecting.load(Ordering::Acquire)
    }

    // ===== Events =====

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// Registry events as a stream; lagged events are skipped
    pub fn events(&self) -> impl Stream<Item = ManagerEvent> + Send + 'static {
        let mut rx = self.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Registry event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    fn publish(&self, event: ManagerEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn publish_cameras(&self, cameras: Vec<CameraInfo>) {
        debug!(count = cameras.len(), "Publishing camera list");
        self.publish(ManagerEvent::CamerasChanged(cameras));
    }

    // ===== Detection =====

    /// Run one detection pass over every auto-detected backend
    ///
    /// Backends run concurrently on the blocking pool. The merged list keeps
    /// the first camera seen for each id, in backend registration order.
    /// Manually registered cameras are carried over. A backend whose
    /// enumeration fails keeps its previously known cameras and a
    /// [`ManagerEvent::DetectionFailed`] is published.
    ///
    /// # Returns
    /// * `true` - A pass ran
    /// * `false` - Another pass was already running; nothing was done
    pub async fn detect_cameras(&self) -> bool {
        let Some(_guard) = DetectionGuard::acquire(&self.inner.detecting) else {
            debug!("Detection already running, ignoring request");
            return false;
        };

        let detectable: Vec<Arc<dyn CameraBackend>> = self
            .inner
            .backends
            .iter()
            .filter(|b| b.backend_type().is_auto_detected())
            .cloned()
            .collect();

        let passes = detectable.iter().map(|backend| {
            let backend = Arc::clone(backend);
            async move {
                let backend_type = backend.backend_type();
                let result = tokio::task::spawn_blocking(move || backend.detect_cameras())
                    .await
                    .unwrap_or_else(|e| Err(BackendError::DetectionFailed(e.to_string())));
                (backend_type, result)
            }
        });
        let results = join_all(passes).await;

        let previous = self.cameras();
        let mut merged: Vec<CameraInfo> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut push = |camera: CameraInfo, merged: &mut Vec<CameraInfo>| {
            if seen.insert(camera.id.clone()) {
                merged.push(camera);
            } else {
                debug!(camera = %camera.id, backend = %camera.backend, "Dropping duplicate camera id");
            }
        };

        for (backend_type, result) in results {
            match result {
                Ok(cameras) => {
                    debug!(backend = %backend_type, count = cameras.len(), "Backend detection finished");
                    for camera in cameras {
                        push(camera, &mut merged);
                    }
                }
                Err(e) => {
                    warn!(backend = %backend_type, error = %e, "Backend detection failed");
                    for camera in previous.iter().filter(|c| c.backend == backend_type) {
                        push(camera.clone(), &mut merged);
                    }
                    self.publish(ManagerEvent::DetectionFailed {
                        backend: backend_type,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let changed = {
            let mut cameras = self.inner.cameras.lock().unwrap_or_else(|e| e.into_inner());
            // Manual cameras live until explicitly removed
            for camera in cameras.iter().filter(|c| !c.backend.is_auto_detected()) {
                push(camera.clone(), &mut merged);
            }
            let changed = id_set(&cameras) != id_set(&merged);
            *cameras = merged.clone();
            changed
        };

        info!(count = merged.len(), changed, "Detection pass finished");
        if changed {
            self.publish_cameras(merged);
        }
        true
    }

    // ===== Manual registration =====

    /// Register a camera outside detection (phone bridge, network)
    ///
    /// # Returns
    /// `false` when a camera with the same id is already registered
    pub fn add_camera(&self, camera: CameraInfo) -> bool {
        let snapshot = {
            let mut cameras = self.inner.cameras.lock().unwrap_or_else(|e| e.into_inner());
            if cameras.iter().any(|c| c.id == camera.id) {
                debug!(camera = %camera.id, "Camera already registered");
                return false;
            }
            info!(camera = %camera.id, name = %camera.name, "Registering camera");
            cameras.push(camera);
            cameras.clone()
        };
        self.publish_cameras(snapshot);
        true
    }

    /// Register network cameras from user entries
    ///
    /// Entries with a disallowed URL are rejected and never reach the registry.
    ///
    /// # Returns
    /// The rejected entries with the reason
    pub fn add_network_cameras(
        &self,
        entries: &[NetworkCameraEntry],
    ) -> Vec<(NetworkCameraEntry, BackendError)> {
        let mut rejected = Vec::new();
        let mut accepted = Vec::new();
        for entry in entries {
            match network::camera_from_entry(entry) {
                Ok(camera) => accepted.push(camera),
                Err(e) => {
                    warn!(url = %entry.url, error = %e, "Rejected network camera");
                    rejected.push((entry.clone(), e));
                }
            }
        }

        let snapshot = {
            let mut cameras = self.inner.cameras.lock().unwrap_or_else(|e| e.into_inner());
            let before = cameras.len();
            for camera in accepted {
                if !cameras.iter().any(|c| c.id == camera.id) {
                    info!(camera = %camera.id, name = %camera.name, "Registering network camera");
                    cameras.push(camera);
                }
            }
            (cameras.len() != before).then(|| cameras.clone())
        };
        if let Some(snapshot) = snapshot {
            self.publish_cameras(snapshot);
        }
        rejected
    }

    /// Remove a camera
    ///
    /// # Returns
    /// `true` when the camera was registered
    pub fn remove_camera(&self, id: &str) -> bool {
        let snapshot = {
            let mut cameras = self.inner.cameras.lock().unwrap_or_else(|e| e.into_inner());
            let before = cameras.len();
            cameras.retain(|c| c.id != id);
            if cameras.len() == before {
                return false;
            }
            cameras.clone()
        };
        info!(camera = id, "Removed camera");
        self.publish_cameras(snapshot);
        true
    }

    /// Replace a camera's entry after a driver refreshed its identity
    ///
    /// Publishes a change when the id changed.
    pub fn update_camera(&self, old_id: &str, camera: CameraInfo) {
        let snapshot = {
            let mut cameras = self.inner.cameras.lock().unwrap_or_else(|e| e.into_inner());
            let id_changed = old_id != camera.id;
            match cameras.iter_mut().find(|c| c.id == old_id) {
                Some(slot) => *slot = camera,
                None => {
                    debug!(camera = old_id, "Updated camera is no longer registered");
                    return;
                }
            }
            id_changed.then(|| cameras.clone())
        };
        if let Some(snapshot) = snapshot {
            info!(old = old_id, "Camera identity changed");
            self.publish_cameras(snapshot);
        }
    }
}

fn id_set(cameras: &[CameraInfo]) -> BTreeSet<&str> {
    cameras.iter().map(|c| c.id.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticBackend {
        backend_type: CameraBackendType,
        available: bool,
        ids: Vec<&'static str>,
    }

    impl CameraBackend for StaticBackend {
        fn backend_type(&self) -> CameraBackendType {
            self.backend_type
        }
        fn is_available(&self) -> bool {
            self.available
        }
        fn detect_cameras(&self) -> BackendResult<Vec<CameraInfo>> {
            Ok(self
                .ids
                .iter()
                .map(|id| CameraInfo::new(*id, *id, self.backend_type, *id))
                .collect())
        }
        fn get_controls(&self, _camera: &mut CameraInfo) -> BackendResult<Vec<CameraControl>> {
            Ok(Vec::new())
        }
        fn set_control(&self, _: &mut CameraInfo, _: &str, _: &ControlValue) -> BackendResult<()> {
            Ok(())
        }
        fn source_descriptor(&self, _: &CameraInfo, _: Option<&VideoFormat>) -> Option<String> {
            None
        }
    }

    fn backend(
        backend_type: CameraBackendType,
        available: bool,
        ids: Vec<&'static str>,
    ) -> Arc<dyn CameraBackend> {
        Arc::new(StaticBackend {
            backend_type,
            available,
            ids,
        })
    }

    #[test]
    fn test_unavailable_backends_are_excluded() {
        let manager = CameraManager::new(vec![
            backend(CameraBackendType::V4l2, true, vec![]),
            backend(CameraBackendType::Gphoto2, false, vec![]),
        ]);
        assert_eq!(manager.available_backends(), vec![CameraBackendType::V4l2]);
        assert_eq!(manager.unavailable_backends(), vec![CameraBackendType::Gphoto2]);
        assert!(manager.backend(CameraBackendType::Gphoto2).is_none());
    }

    #[tokio::test]
    async fn test_first_occurrence_wins() {
        let manager = CameraManager::new(vec![
            backend(CameraBackendType::V4l2, true, vec!["cam:a", "cam:b"]),
            backend(CameraBackendType::PipeWire, true, vec!["cam:b", "cam:c"]),
        ]);
        assert!(manager.detect_cameras().await);

        let cameras = manager.cameras();
        let ids: Vec<&str> = cameras.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["cam:a", "cam:b", "cam:c"]);
        assert_eq!(cameras[1].backend, CameraBackendType::V4l2);
    }

    #[tokio::test]
    async fn test_manual_cameras_survive_detection() {
        let manager = CameraManager::new(vec![backend(CameraBackendType::V4l2, true, vec!["v4l2:/dev/video0"])]);
        let rejected = manager.add_network_cameras(&[
            NetworkCameraEntry::new("Door", "rtsp://door/1"),
            NetworkCameraEntry::new("Bad", "javascript:alert(1)"),
        ]);
        assert_eq!(rejected.len(), 1);

        manager.detect_cameras().await;
        let ids: Vec<String> = manager.cameras().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["v4l2:/dev/video0", "ip:rtsp://door/1"]);
    }

    #[tokio::test]
    async fn test_update_camera_replaces_entry() {
        let manager = CameraManager::new(vec![backend(CameraBackendType::Gphoto2, true, vec!["gphoto2:usb:001,005"])]);
        manager.detect_cameras().await;
        let mut rx = manager.subscribe();

        let mut camera = manager.camera("gphoto2:usb:001,005").unwrap();
        camera.id = "gphoto2:usb:001,009".to_string();
        manager.update_camera("gphoto2:usb:001,005", camera);

        assert!(manager.camera("gphoto2:usb:001,005").is_none());
        assert!(manager.camera("gphoto2:usb:001,009").is_some());
        assert!(matches!(rx.try_recv(), Ok(ManagerEvent::CamerasChanged(_))));
    }

    #[tokio::test]
    async fn test_remove_camera() {
        let manager = CameraManager::new(vec![]);
        assert!(manager.add_camera(CameraInfo::new("phone:bridge", "Phone", CameraBackendType::Phone, "")));
        assert!(!manager.add_camera(CameraInfo::new("phone:bridge", "Phone", CameraBackendType::Phone, "")));
        assert!(manager.remove_camera("phone:bridge"));
        assert!(!manager.remove_camera("phone:bridge"));
    }
}
