// SPDX-License-Identifier: GPL-3.0-only

//! Streaming session controller
//!
//! Owns the "current session": which camera is selected, where its play
//! sequence is, and the background work attached to it (pull-source retry,
//! helper teardown, phone removal). Drivers are only ever called through
//! `spawn_blocking`; the controller's own state is a plain mutex that is
//! never held across an await point.
//!
//! A play sequence runs:
//!
//! ```text
//! Idle ─► AcquiringControls ─► StartingHelper ─► BuildingSource ─► Playing
//!                                  (gphoto2)           │
//!                                                      ├─► Retrying ─► Playing / Error (pull sources)
//!                                                      └─► Error
//! ```

pub mod format;
pub mod pipeline;
pub mod retry;
pub mod state;

pub use format::pick_preferred_format;
#[cfg(feature = "gstreamer")]
pub use pipeline::GstEngine;
pub use pipeline::{GstLaunchEngine, PipelineEngine, PipelineEvent, PipelineEventSender};
pub use retry::RetryPolicy;
pub use state::{PlayOutcome, SessionEvent, SessionState};

use crate::backends::camera::phone::{self, PHONE_CAMERA_ID};
use crate::backends::camera::types::*;
use crate::backends::camera::{
    CameraBackend, CameraManager, ConflictResolver, FrameCallback, HotplugHandle, ManagerEvent,
    PhoneFrame,
};
use crate::config::SettingsStore;
use crate::constants::timing;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Capacity of the event channel before slow subscribers start lagging
const EVENT_CAPACITY: usize = 64;

/// Run a blocking driver call on the blocking pool
async fn blocking<T, F>(f: F) -> BackendResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackendError::Other(format!("worker task failed: {}", e)))
}

/// Pipeline messages that mean another process has the device
fn looks_busy(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("busy") || lower.contains("in use")
}

/// Optional collaborators and tuning for a [`StreamController`]
pub struct ControllerOptions {
    /// Names holders of a busy device in error messages
    pub resolver: Option<ConflictResolver>,
    /// Source of format preferences, target of last-camera-id
    pub settings: Option<Arc<SettingsStore>>,
    /// Paused while a gphoto2 play sequence runs
    pub hotplug: Option<HotplugHandle>,
    pub retry: RetryPolicy,
    /// How long a disconnected phone stays registered
    pub phone_grace: Duration,
    /// Receives phone frames while the phone camera plays
    pub frame_sink: Option<FrameCallback>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            resolver: None,
            settings: None,
            hotplug: None,
            retry: RetryPolicy::default(),
            phone_grace: timing::PHONE_DISCONNECT_GRACE,
            frame_sink: None,
        }
    }
}

/// State of the current session
#[derive(Default)]
struct Session {
    /// Bumped by every play and stop; background work carries the epoch it belongs to
    epoch: u64,
    camera: Option<CameraInfo>,
    state: SessionState,
    retry_task: Option<JoinHandle<()>>,
}

struct ControllerInner {
    manager: CameraManager,
    engine: Arc<dyn PipelineEngine>,
    resolver: Option<ConflictResolver>,
    settings: Option<Arc<SettingsStore>>,
    hotplug: Option<HotplugHandle>,
    retry: RetryPolicy,
    phone_grace: Duration,
    frame_sink: FrameCallback,
    /// Held for the whole of a play sequence; contenders are dropped, not queued
    play_lock: tokio::sync::Mutex<()>,
    session: Mutex<Session>,
    controls: Mutex<HashMap<String, Vec<CameraControl>>>,
    /// Background helper teardowns by camera id
    teardowns: Mutex<HashMap<String, JoinHandle<()>>>,
    phone_removal: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<SessionEvent>,
}

/// Pauses hotplug polling until dropped
struct HotplugPause(Option<HotplugHandle>);

impl HotplugPause {
    fn new(handle: Option<HotplugHandle>) -> Self {
        if let Some(handle) = &handle {
            handle.pause();
        }
        Self(handle)
    }
}

impl Drop for HotplugPause {
    fn drop(&mut self) {
        if let Some(handle) = &self.0 {
            handle.resume();
        }
    }
}

/// Drives streaming sessions over the registry's cameras
///
/// Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct StreamController {
    inner: Arc<ControllerInner>,
}

impl std::fmt::Debug for StreamController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamController")
            .field("state", &self.state())
            .field("camera", &self.current_camera().map(|c| c.id))
            .field("retry", &self.inner.retry)
            .finish()
    }
}

impl StreamController {
    pub fn new(
        manager: CameraManager,
        engine: Arc<dyn PipelineEngine>,
        options: ControllerOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let frame_sink = options.frame_sink.unwrap_or_else(|| {
            Arc::new(|frame: PhoneFrame| {
                trace!(width = frame.width, height = frame.height, "Phone frame");
            })
        });
        Self {
            inner: Arc::new(ControllerInner {
                manager,
                engine,
                resolver: options.resolver,
                settings: options.settings,
                hotplug: options.hotplug,
                retry: options.retry,
                phone_grace: options.phone_grace,
                frame_sink,
                play_lock: tokio::sync::Mutex::new(()),
                session: Mutex::new(Session::default()),
                controls: Mutex::new(HashMap::new()),
                teardowns: Mutex::new(HashMap::new()),
                phone_removal: Mutex::new(None),
                events,
            }),
        }
    }

    // ===== Queries =====

    pub fn manager(&self) -> &CameraManager {
        &self.inner.manager
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.lock_session().state
    }

    pub fn current_camera(&self) -> Option<CameraInfo> {
        self.lock_session().camera.clone()
    }

    /// Controls read during the last play sequence or control query
    pub fn cached_controls(&self, camera_id: &str) -> Option<Vec<CameraControl>> {
        self.inner
            .controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(camera_id)
            .cloned()
    }

    /// Background helper teardowns that have not finished yet
    pub fn pending_teardowns(&self) -> usize {
        let mut teardowns = self.inner.teardowns.lock().unwrap_or_else(|e| e.into_inner());
        teardowns.retain(|_, task| !task.is_finished());
        teardowns.len()
    }

    // ===== Session bookkeeping =====

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Session> {
        self.inner.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.lock_session().epoch == epoch
    }

    /// Move to `state` if `epoch` still owns the session
    fn transition(&self, epoch: u64, state: SessionState) -> bool {
        let camera_id = {
            let mut session = self.lock_session();
            if session.epoch != epoch {
                return false;
            }
            session.state = state;
            session.camera.as_ref().map(|c| c.id.clone())
        };
        debug!(camera = ?camera_id, %state, "Session state");
        self.publish(SessionEvent::StateChanged { camera_id, state });
        true
    }

    /// Enter the error state and publish the reason once
    fn fail(&self, epoch: u64, camera_id: &str, err: BackendError) -> BackendError {
        if self.transition(epoch, SessionState::Error) {
            error!(camera = camera_id, error = %err, "Session failed");
            self.publish(SessionEvent::Error {
                camera_id: Some(camera_id.to_string()),
                message: err.to_string(),
            });
        }
        err
    }

    /// Start a new sequence for `camera`, cancelling whatever the old one left running
    fn begin_sequence(&self, camera: &CameraInfo) -> (u64, Option<CameraInfo>) {
        let (epoch, previous, retry_task) = {
            let mut session = self.lock_session();
            session.epoch += 1;
            let previous = session.camera.replace(camera.clone());
            (session.epoch, previous, session.retry_task.take())
        };
        if let Some(task) = retry_task {
            task.abort();
        }
        (epoch, previous)
    }

    /// Write a driver's identity or state refresh back to the session and registry
    fn refresh_identity(&self, old_id: &str, camera: &CameraInfo) {
        {
            let mut session = self.lock_session();
            if let Some(current) = session.camera.as_mut()
                && current.id == old_id
            {
                *current = camera.clone();
            }
        }
        if old_id != camera.id {
            let mut controls = self.inner.controls.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = controls.remove(old_id) {
                controls.insert(camera.id.clone(), cached);
            }
        }
        self.inner.manager.update_camera(old_id, camera.clone());
    }

    fn remember_camera(&self, camera_id: &str) {
        let Some(settings) = &self.inner.settings else {
            return;
        };
        if let Err(e) = settings.update(|s| s.last_camera_id = Some(camera_id.to_string())) {
            warn!(error = %e, "Failed to save last camera");
        }
    }

    fn preferred_format(&self, camera: &CameraInfo) -> Option<VideoFormat> {
        let settings = self.inner.settings.as_ref().map(|s| s.settings());
        let height = settings
            .as_ref()
            .and_then(|s| format::parse_resolution_preference(&s.preferred_resolution));
        let fps_limit = settings.and_then(|s| s.fps_cap()).map(f64::from);
        pick_preferred_format(&camera.formats, height, fps_limit)
    }

    /// Stop a camera's streaming helper without blocking the caller
    ///
    /// The camera's cached controls are dropped once the helper is gone.
    /// A teardown already pending for the same camera runs first.
    fn schedule_teardown(&self, camera: CameraInfo) {
        let Some(backend) = self.inner.manager.backend(camera.backend) else {
            return;
        };
        info!(camera = %camera.id, "Stopping streaming helper in the background");
        let camera_id = camera.id.clone();
        let controller = self.clone();

        let mut teardowns = self.inner.teardowns.lock().unwrap_or_else(|e| e.into_inner());
        teardowns.retain(|_, task| !task.is_finished());
        let pending = teardowns.remove(&camera_id);
        let task = tokio::spawn(async move {
            if let Some(pending) = pending
                && let Err(e) = pending.await
            {
                warn!(camera = %camera.id, error = %e, "Earlier helper teardown failed");
            }
            let id = camera.id.clone();
            if let Err(e) = blocking(move || backend.stop_external_streaming(&camera)).await {
                warn!(camera = %id, error = %e, "Helper teardown failed");
            }
            controller
                .inner
                .controls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            debug!(camera = %id, "Helper teardown finished");
        });
        teardowns.insert(camera_id, task);
    }

    /// Wait for a pending helper teardown of `camera_id`
    async fn await_teardown(&self, camera_id: &str) {
        let pending = self
            .inner
            .teardowns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(camera_id);
        if let Some(task) = pending {
            info!(camera = camera_id, "Waiting for the previous helper teardown");
            if let Err(e) = task.await {
                warn!(camera = camera_id, error = %e, "Helper teardown task failed");
            }
        }
    }

    async fn stop_pipeline(&self) {
        let engine = Arc::clone(&self.inner.engine);
        if let Err(e) = blocking(move || engine.stop()).await {
            warn!(error = %e, "Failed to stop pipeline");
        }
    }

    /// Unregister the phone callback when `camera` is the phone
    fn detach_push_source(&self, camera: &CameraInfo) {
        if let Some(backend) = self.inner.manager.backend(camera.backend)
            && backend.source_kind() == SourceKind::Push
            && let Some(source) = backend.frame_source()
        {
            source.set_frame_callback(None);
            debug!(camera = %camera.id, "Frame callback unregistered");
        }
    }

    /// Tear down what the previous camera left behind before `next` starts
    ///
    /// The pipeline goes synchronously. When the switch leaves the helper's
    /// backend, the old helper is stopped in the background so the switch is
    /// never held up by it. Helpers of the same backend keep running.
    async fn release_previous(&self, previous: Option<CameraInfo>, next: &CameraInfo) {
        self.stop_pipeline().await;
        let Some(previous) = previous else {
            return;
        };
        self.detach_push_source(&previous);
        if previous.backend != next.backend
            && self
                .inner
                .manager
                .backend(previous.backend)
                .is_some_and(|b| b.needs_external_streaming_setup())
        {
            self.schedule_teardown(previous);
        }
    }

    /// Add the names of processes holding the device to a busy failure
    async fn enrich_failure(&self, camera: &CameraInfo, message: String) -> BackendError {
        if !looks_busy(&message) {
            return BackendError::PipelineFailed(message);
        }
        let holders = match self.inner.resolver.clone() {
            Some(resolver) => {
                let device = camera.device_path.clone();
                blocking(move || resolver.processes_holding(&device))
                    .await
                    .unwrap_or_default()
            }
            None => Vec::new(),
        };
        BackendError::DeviceBusy {
            device: camera.device_path.clone(),
            holders,
        }
    }

    // ===== Play =====

    /// Whether `camera`'s helper is alive and its controls are cached
    async fn can_hot_swap(&self, backend: &Arc<dyn CameraBackend>, camera: &CameraInfo) -> bool {
        if !backend.needs_external_streaming_setup() || self.cached_controls(&camera.id).is_none() {
            return false;
        }
        let worker = Arc::clone(backend);
        let camera = camera.clone();
        blocking(move || worker.is_camera_streaming(&camera))
            .await
            .unwrap_or(false)
    }

    /// Read controls, serving them from the cache when possible
    async fn acquire_controls(
        &self,
        epoch: u64,
        backend: &Arc<dyn CameraBackend>,
        camera: CameraInfo,
    ) -> BackendResult<CameraInfo> {
        if let Some(controls) = self.cached_controls(&camera.id) {
            self.publish(SessionEvent::ControlsReady {
                camera_id: camera.id.clone(),
                controls,
            });
            return Ok(camera);
        }

        let old_id = camera.id.clone();
        let worker = Arc::clone(backend);
        let (camera, result) = blocking(move || {
            let mut camera = camera;
            let result = worker.get_controls(&mut camera);
            (camera, result)
        })
        .await
        .map_err(|e| self.fail(epoch, &old_id, e))?;
        self.refresh_identity(&old_id, &camera);

        match result {
            Ok(controls) => {
                info!(camera = %camera.id, count = controls.len(), "Controls acquired");
                self.inner
                    .controls
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(camera.id.clone(), controls.clone());
                self.publish(SessionEvent::ControlsReady {
                    camera_id: camera.id.clone(),
                    controls,
                });
            }
            Err(e) => {
                warn!(camera = %camera.id, error = %e, "Could not read controls, continuing without them");
            }
        }
        Ok(camera)
    }

    /// Start the selected camera
    ///
    /// Only one play sequence runs at a time; a request arriving while one is
    /// in flight is dropped. For backends with a streaming helper, controls
    /// are read before the helper starts, since the helper takes exclusive
    /// access to the device.
    ///
    /// # Arguments
    /// * `camera_id` - Registered camera to play
    /// * `format` - Explicit format, or `None` to use the configured preference
    ///
    /// # Returns
    /// * `Ok(PlayOutcome)` - See [`PlayOutcome`]; pull sources report the final result through events
    /// * `Err(BackendError)` - The sequence failed; an `Error` event was published too
    pub async fn play(
        &self,
        camera_id: &str,
        format: Option<VideoFormat>,
    ) -> BackendResult<PlayOutcome> {
        let Ok(_sequence) = self.inner.play_lock.try_lock() else {
            info!(camera = camera_id, "Play already in progress, dropping request");
            return Ok(PlayOutcome::Dropped);
        };

        let camera = self
            .inner
            .manager
            .camera(camera_id)
            .ok_or_else(|| BackendError::DeviceNotFound(camera_id.to_string()))?;
        let backend = self
            .inner
            .manager
            .backend(camera.backend)
            .ok_or_else(|| BackendError::NotAvailable(camera.backend.to_string()))?;
        info!(camera = camera_id, backend = %camera.backend, "Play requested");
        self.remember_camera(camera_id);

        self.await_teardown(&camera.id).await;
        let hot_swap = self.can_hot_swap(&backend, &camera).await;
        let (epoch, previous) = self.begin_sequence(&camera);
        self.release_previous(previous, &camera).await;

        if hot_swap {
            info!(camera = camera_id, "Helper still alive, rebuilding the pipeline source only");
            if let Some(controls) = self.cached_controls(camera_id) {
                self.publish(SessionEvent::ControlsReady {
                    camera_id: camera_id.to_string(),
                    controls,
                });
            }
            self.build_source(epoch, &backend, camera, format, HotplugPause::new(None))
                .await?;
            return Ok(PlayOutcome::HotSwapped);
        }

        let needs_helper = backend.needs_external_streaming_setup();
        let paused = HotplugPause::new(if needs_helper {
            self.inner.hotplug.clone()
        } else {
            None
        });

        self.transition(epoch, SessionState::AcquiringControls);
        let mut camera = self.acquire_controls(epoch, &backend, camera).await?;
        if !self.is_current(epoch) {
            debug!(camera = camera_id, "Play superseded while reading controls");
            return Ok(PlayOutcome::Dropped);
        }

        if needs_helper {
            self.transition(epoch, SessionState::StartingHelper);
            let old_id = camera.id.clone();
            let worker = Arc::clone(&backend);
            let (started, result) = blocking(move || {
                let mut camera = camera;
                let result = worker.start_external_streaming(&mut camera);
                (camera, result)
            })
            .await
            .map_err(|e| self.fail(epoch, &old_id, e))?;
            camera = started;
            self.refresh_identity(&old_id, &camera);

            if let Err(e) = result {
                return Err(self.fail(epoch, &camera.id, e));
            }
            if !self.is_current(epoch) {
                debug!(camera = %camera.id, "Play superseded while starting helper");
                self.schedule_teardown(camera);
                return Ok(PlayOutcome::Dropped);
            }
        }

        self.build_source(epoch, &backend, camera, format, paused).await
    }

    /// Hand the camera's source to the pipeline engine (or register the frame callback)
    ///
    /// `paused` is held until the source is up, including a background retry.
    async fn build_source(
        &self,
        epoch: u64,
        backend: &Arc<dyn CameraBackend>,
        camera: CameraInfo,
        format: Option<VideoFormat>,
        paused: HotplugPause,
    ) -> BackendResult<PlayOutcome> {
        let kind = backend.source_kind();
        if kind == SourceKind::Push {
            let Some(source) = backend.frame_source() else {
                let err = BackendError::NotAvailable(format!("{} has no frame source", camera.name));
                return Err(self.fail(epoch, &camera.id, err));
            };
            source.set_frame_callback(Some(Arc::clone(&self.inner.frame_sink)));
            if self.transition(epoch, SessionState::Playing) {
                info!(camera = %camera.id, "Frame callback registered");
                self.publish(SessionEvent::Playing {
                    camera_id: camera.id.clone(),
                });
            }
            return Ok(PlayOutcome::Started);
        }

        self.transition(epoch, SessionState::BuildingSource);
        let format = format.or_else(|| self.preferred_format(&camera));
        let worker = Arc::clone(backend);
        let target = camera.clone();
        let descriptor = blocking(move || worker.source_descriptor(&target, format.as_ref()))
            .await
            .map_err(|e| self.fail(epoch, &camera.id, e))?;
        let Some(descriptor) = descriptor else {
            let err = BackendError::PipelineFailed(format!("{} cannot be streamed", camera.name));
            return Err(self.fail(epoch, &camera.id, err));
        };
        debug!(camera = %camera.id, %descriptor, "Source descriptor");

        if kind == SourceKind::Pull {
            self.spawn_retry(epoch, camera, descriptor, paused);
            return Ok(PlayOutcome::Connecting);
        }

        let engine = Arc::clone(&self.inner.engine);
        let started = blocking(move || engine.start(&descriptor))
            .await
            .map_err(|e| self.fail(epoch, &camera.id, e))?;
        match started {
            Ok(()) => {
                if self.transition(epoch, SessionState::Playing) {
                    info!(camera = %camera.id, "Playing");
                    self.publish(SessionEvent::Playing {
                        camera_id: camera.id.clone(),
                    });
                }
                Ok(PlayOutcome::Started)
            }
            Err(message) => {
                let err = self.enrich_failure(&camera, message).await;
                Err(self.fail(epoch, &camera.id, err))
            }
        }
    }

    fn spawn_retry(&self, epoch: u64, camera: CameraInfo, descriptor: String, paused: HotplugPause) {
        self.transition(epoch, SessionState::Retrying);
        let controller = self.clone();
        let task = tokio::spawn(async move {
            controller.retry_pipeline(epoch, camera, descriptor).await;
            drop(paused);
        });

        let mut session = self.lock_session();
        if session.epoch == epoch {
            session.retry_task = Some(task);
        } else {
            task.abort();
        }
    }

    /// Bounded pipeline construction for pull sources
    ///
    /// Ends on the first confirmed start, when a later play or stop takes
    /// over the session, or after the attempt cap with exactly one error.
    async fn retry_pipeline(&self, epoch: u64, camera: CameraInfo, descriptor: String) {
        let policy = self.inner.retry;
        for attempt in 1..=policy.max_attempts {
            tokio::time::sleep(policy.delay_before(attempt)).await;
            if !self.is_current(epoch) {
                debug!(camera = %camera.id, attempt, "Pipeline retry superseded");
                return;
            }

            let candidate = retry::descriptor_for_attempt(&descriptor, attempt);
            let engine = Arc::clone(&self.inner.engine);
            match blocking(move || engine.start(&candidate)).await {
                Ok(Ok(())) => {
                    if self.transition(epoch, SessionState::Playing) {
                        info!(camera = %camera.id, attempt, "Playing");
                        self.publish(SessionEvent::Playing {
                            camera_id: camera.id.clone(),
                        });
                    } else if self.state().is_inactive() {
                        // Stopped while this attempt was starting
                        self.stop_pipeline().await;
                    }
                    return;
                }
                Ok(Err(message)) => {
                    debug!(
                        camera = %camera.id,
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %message,
                        "Pipeline attempt failed"
                    );
                }
                Err(e) => warn!(camera = %camera.id, attempt, error = %e, "Pipeline attempt aborted"),
            }
        }

        self.fail(
            epoch,
            &camera.id,
            BackendError::RetryExhausted {
                attempts: policy.max_attempts,
            },
        );
    }

    // ===== Stop =====

    /// Stop the current session
    ///
    /// The pipeline is torn down before the call returns; the camera's helper
    /// (and only that camera's) is stopped in the background. A no-op when
    /// nothing is running.
    pub async fn stop(&self) {
        let (camera, retry_task) = {
            let mut session = self.lock_session();
            if session.state.is_inactive() {
                return;
            }
            session.epoch += 1;
            session.state = SessionState::Stopped;
            (session.camera.take(), session.retry_task.take())
        };
        if let Some(task) = retry_task {
            task.abort();
        }

        self.stop_pipeline().await;
        let camera_id = camera.as_ref().map(|c| c.id.clone());
        self.publish(SessionEvent::StateChanged {
            camera_id: camera_id.clone(),
            state: SessionState::Stopped,
        });

        let Some(camera) = camera else {
            return;
        };
        self.detach_push_source(&camera);
        if self
            .inner
            .manager
            .backend(camera.backend)
            .is_some_and(|b| b.needs_external_streaming_setup())
        {
            self.schedule_teardown(camera.clone());
        }
        info!(camera = %camera.id, "Session stopped");
        self.publish(SessionEvent::Stopped {
            camera_id: camera.id,
        });
    }

    /// Stop the session and wait for every background helper teardown
    pub async fn shutdown(&self) {
        self.stop().await;
        if let Some(task) = self
            .inner
            .phone_removal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }

        let teardowns: Vec<_> =
            std::mem::take(&mut *self.inner.teardowns.lock().unwrap_or_else(|e| e.into_inner()))
                .into_values()
                .collect();
        for task in teardowns {
            if let Err(e) = task.await {
                warn!(error = %e, "Helper teardown task failed");
            }
        }
        info!("Session controller shut down");
    }

    // ===== Controls =====

    /// Controls of a camera, read from the device when not cached
    pub async fn controls(&self, camera_id: &str) -> BackendResult<Vec<CameraControl>> {
        if let Some(controls) = self.cached_controls(camera_id) {
            return Ok(controls);
        }
        let camera = self
            .inner
            .manager
            .camera(camera_id)
            .ok_or_else(|| BackendError::DeviceNotFound(camera_id.to_string()))?;
        let backend = self
            .inner
            .manager
            .backend(camera.backend)
            .ok_or_else(|| BackendError::NotAvailable(camera.backend.to_string()))?;

        let old_id = camera.id.clone();
        let (camera, result) = blocking(move || {
            let mut camera = camera;
            let result = backend.get_controls(&mut camera);
            (camera, result)
        })
        .await?;
        self.refresh_identity(&old_id, &camera);

        let controls = result?;
        self.inner
            .controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(camera.id.clone(), controls.clone());
        Ok(controls)
    }

    /// Write one control through the camera's driver and update the cache
    pub async fn set_control(
        &self,
        camera_id: &str,
        control_id: &str,
        value: ControlValue,
    ) -> BackendResult<()> {
        let camera = self
            .inner
            .manager
            .camera(camera_id)
            .ok_or_else(|| BackendError::DeviceNotFound(camera_id.to_string()))?;
        let backend = self
            .inner
            .manager
            .backend(camera.backend)
            .ok_or_else(|| BackendError::NotAvailable(camera.backend.to_string()))?;

        let old_id = camera.id.clone();
        let control = control_id.to_string();
        let written = value.clone();
        let (camera, result) = blocking(move || {
            let mut camera = camera;
            let result = backend.set_control(&mut camera, &control, &written);
            (camera, result)
        })
        .await?;
        self.refresh_identity(&old_id, &camera);
        result?;

        let mut cache = self.inner.controls.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = cache
            .get_mut(&camera.id)
            .and_then(|controls| controls.iter_mut().find(|c| c.id == control_id))
        {
            cached.value = value;
        }
        drop(cache);
        debug!(camera = %camera.id, control = control_id, "Control updated");
        Ok(())
    }

    /// Restore one control, or all of them, to their defaults
    ///
    /// # Returns
    /// Number of controls that were reset
    pub async fn reset_controls(&self, camera_id: &str, control_id: Option<&str>) -> BackendResult<usize> {
        let controls = self.controls(camera_id).await?;
        let targets: Vec<CameraControl> = match control_id {
            Some(id) => {
                let control = controls
                    .into_iter()
                    .find(|c| c.id == id)
                    .ok_or_else(|| BackendError::InvalidControl(format!("no control '{}'", id)))?;
                vec![control]
            }
            None => controls,
        };

        let camera = self
            .inner
            .manager
            .camera(camera_id)
            .ok_or_else(|| BackendError::DeviceNotFound(camera_id.to_string()))?;
        let backend = self
            .inner
            .manager
            .backend(camera.backend)
            .ok_or_else(|| BackendError::NotAvailable(camera.backend.to_string()))?;

        let old_id = camera.id.clone();
        let (camera, reset) = blocking(move || {
            let mut camera = camera;
            let reset = backend.reset_all_controls(&mut camera, &targets);
            (camera, reset)
        })
        .await?;
        self.refresh_identity(&old_id, &camera);

        // Re-read on next query
        self.inner
            .controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&camera.id);
        info!(camera = %camera.id, reset, "Controls reset to defaults");
        Ok(reset)
    }

    // ===== Registry integration =====

    /// Play the last used camera, or the first registered one
    ///
    /// # Returns
    /// `Ok(None)` when no camera is registered
    pub async fn restore_session(&self) -> BackendResult<Option<PlayOutcome>> {
        let cameras = self.inner.manager.cameras();
        let last = self
            .inner
            .settings
            .as_ref()
            .and_then(|s| s.settings().last_camera().map(str::to_string));
        let target = last
            .as_deref()
            .and_then(|id| cameras.iter().find(|c| c.id == id))
            .or_else(|| cameras.first());
        let Some(target) = target.map(|c| c.id.clone()) else {
            debug!("No camera to restore");
            return Ok(None);
        };

        info!(
            camera = %target,
            restored = last.as_deref() == Some(target.as_str()),
            "Restoring session"
        );
        self.play(&target, None).await.map(Some)
    }

    async fn on_cameras_changed(&self, cameras: &[CameraInfo]) {
        let (state, current) = {
            let session = self.lock_session();
            (session.state, session.camera.as_ref().map(|c| c.id.clone()))
        };

        let vanished = current
            .as_deref()
            .is_some_and(|id| !cameras.iter().any(|c| c.id == id));
        if vanished && !state.is_inactive() {
            info!(camera = ?current, "Active camera disappeared");
            self.stop().await;
        }

        if (state == SessionState::Idle || vanished) && !cameras.is_empty() {
            if let Err(e) = self.restore_session().await {
                warn!(error = %e, "Failed to restore session");
            }
        }
    }

    /// Follow registry changes: restore a session on the first detection and
    /// move off a camera that disappeared
    pub fn attach_registry_events(&self) -> JoinHandle<()> {
        let controller = self.clone();
        let mut events = self.inner.manager.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ManagerEvent::CamerasChanged(cameras)) => {
                        controller.on_cameras_changed(&cameras).await;
                    }
                    Ok(ManagerEvent::DetectionFailed { backend, reason }) => {
                        debug!(%backend, %reason, "Detection failure noted");
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Registry events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Drain lifecycle events from the pipeline engine
    pub fn attach_pipeline_events(
        &self,
        mut events: mpsc::UnboundedReceiver<PipelineEvent>,
    ) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                controller.on_pipeline_event(event).await;
            }
            debug!("Pipeline event inbox closed");
        })
    }

    async fn on_pipeline_event(&self, event: PipelineEvent) {
        let (epoch, state, camera) = {
            let session = self.lock_session();
            (session.epoch, session.state, session.camera.clone())
        };
        // Start-up failures are handled by the play sequence itself
        if state != SessionState::Playing {
            debug!(?event, %state, "Ignoring pipeline event");
            return;
        }
        let Some(camera) = camera else {
            return;
        };

        match event {
            PipelineEvent::Error(message) => {
                let err = self.enrich_failure(&camera, message).await;
                self.fail(epoch, &camera.id, err);
            }
            PipelineEvent::EndOfStream => {
                info!(camera = %camera.id, "Stream ended");
                self.stop().await;
            }
        }
    }

    // ===== Phone bridge =====

    /// Register the phone camera; cancels a pending removal
    ///
    /// # Returns
    /// `true` when the phone was not registered yet
    pub fn phone_connected(&self, width: u32, height: u32) -> bool {
        if let Some(task) = self
            .inner
            .phone_removal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
            info!("Phone reconnected within the grace period");
        }
        self.inner
            .manager
            .add_camera(phone::phone_camera(width, height))
    }

    /// Remove the phone camera after the grace period unless it reconnects
    pub fn phone_disconnected(&self) {
        let controller = self.clone();
        let grace = self.inner.phone_grace;
        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if controller
                .current_camera()
                .is_some_and(|c| c.id == PHONE_CAMERA_ID)
            {
                controller.stop().await;
            }
            if controller.inner.manager.remove_camera(PHONE_CAMERA_ID) {
                info!("Phone camera removed");
            }
        });

        if let Some(previous) = self
            .inner
            .phone_removal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task)
        {
            previous.abort();
        }
    }
}
