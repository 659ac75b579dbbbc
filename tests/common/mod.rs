// SPDX-License-Identifier: GPL-3.0-only

//! Test doubles shared by the integration tests

#![allow(dead_code)]

use camhub::backends::camera::{
    BackendError, BackendResult, CameraBackend, CameraBackendType, CameraControl, CameraInfo,
    Capability, ControlCategory, ControlType, ControlValue, SourceKind, VideoFormat,
};
use camhub::session::PipelineEngine;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

/// Shared, ordered record of driver and engine calls
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

/// Scriptable driver recording every call it receives
pub struct FakeBackend {
    pub backend_type: CameraBackendType,
    pub ids: Mutex<Vec<String>>,
    pub helper: bool,
    pub kind: SourceKind,
    pub log: CallLog,
    pub helper_alive: AtomicBool,
    pub fail_detection: AtomicBool,
    pub fail_helper: AtomicBool,
    /// `get_controls` panics, as a crashed worker would
    pub crash_controls: AtomicBool,
    /// How long `stop_external_streaming` takes
    stop_delay: Duration,
    /// `get_controls` waits for a message on this channel when set
    gate: Mutex<Option<mpsc::Receiver<()>>>,
    /// `detect_cameras` waits for a message on this channel when set
    detect_gate: Mutex<Option<mpsc::Receiver<()>>>,
}

impl FakeBackend {
    pub fn new(backend_type: CameraBackendType, ids: &[&str], log: CallLog) -> Self {
        Self {
            backend_type,
            ids: Mutex::new(ids.iter().map(|id| id.to_string()).collect()),
            helper: false,
            kind: SourceKind::Direct,
            log,
            helper_alive: AtomicBool::new(false),
            fail_detection: AtomicBool::new(false),
            fail_helper: AtomicBool::new(false),
            crash_controls: AtomicBool::new(false),
            stop_delay: Duration::ZERO,
            gate: Mutex::new(None),
            detect_gate: Mutex::new(None),
        }
    }

    /// Behave like a tethered camera: helper process plus a pulled stream
    pub fn with_helper(mut self) -> Self {
        self.helper = true;
        self.kind = SourceKind::Pull;
        self
    }

    pub fn with_kind(mut self, kind: SourceKind) -> Self {
        self.kind = kind;
        self
    }

    /// Make helper teardown slow, like a graceful helper shutdown
    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    /// Make the next `get_controls` block until the returned sender fires
    pub fn hold_controls(&self) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    /// Make the next `detect_cameras` block until the returned sender fires
    pub fn hold_detection(&self) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel();
        *self.detect_gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn set_ids(&self, ids: &[&str]) {
        *self.ids.lock().unwrap() = ids.iter().map(|id| id.to_string()).collect();
    }
}

pub fn brightness(value: i64) -> CameraControl {
    CameraControl {
        id: "brightness".to_string(),
        name: "Brightness".to_string(),
        category: ControlCategory::Image,
        control_type: ControlType::Integer,
        value: ControlValue::Int(value),
        default: ControlValue::Int(0),
        minimum: Some(-64),
        maximum: Some(64),
        step: Some(1),
        choices: Vec::new(),
        flags: String::new(),
    }
}

impl CameraBackend for FakeBackend {
    fn backend_type(&self) -> CameraBackendType {
        self.backend_type
    }

    fn is_available(&self) -> bool {
        true
    }

    fn detect_cameras(&self) -> BackendResult<Vec<CameraInfo>> {
        self.log.push(format!("detect:{}", self.backend_type.id_prefix()));
        if let Some(gate) = self.detect_gate.lock().unwrap().take() {
            let _ = gate.recv_timeout(Duration::from_secs(5));
        }
        if self.fail_detection.load(Ordering::SeqCst) {
            return Err(BackendError::DetectionFailed("tool crashed".to_string()));
        }
        Ok(self
            .ids
            .lock()
            .unwrap()
            .iter()
            .map(|id| {
                let mut camera = CameraInfo::new(id.clone(), format!("Fake {}", id), self.backend_type, id.clone())
                    .with_capabilities(&[Capability::Video, Capability::Controls]);
                camera.formats = vec![VideoFormat {
                    width: 1280,
                    height: 720,
                    fps: vec![30.0],
                    pixel_format: "MJPG".to_string(),
                    description: String::new(),
                }];
                camera
            })
            .collect())
    }

    fn get_controls(&self, camera: &mut CameraInfo) -> BackendResult<Vec<CameraControl>> {
        self.log.push(format!("get_controls:{}", camera.id));
        if self.crash_controls.load(Ordering::SeqCst) {
            panic!("driver crashed reading controls");
        }
        if let Some(gate) = self.gate.lock().unwrap().take() {
            let _ = gate.recv_timeout(Duration::from_secs(5));
        }
        Ok(vec![brightness(10)])
    }

    fn set_control(&self, camera: &mut CameraInfo, control_id: &str, value: &ControlValue) -> BackendResult<()> {
        self.log.push(format!("set_control:{}:{}={}", camera.id, control_id, value));
        if control_id == "brightness" {
            Ok(())
        } else {
            Err(BackendError::InvalidControl(control_id.to_string()))
        }
    }

    fn source_descriptor(&self, camera: &CameraInfo, _format: Option<&VideoFormat>) -> Option<String> {
        Some(format!("fakesrc name={} address=127.0.0.1 ! videoconvert", camera.id))
    }

    fn source_kind(&self) -> SourceKind {
        self.kind
    }

    fn needs_external_streaming_setup(&self) -> bool {
        self.helper
    }

    fn start_external_streaming(&self, camera: &mut CameraInfo) -> BackendResult<()> {
        self.log.push(format!("start_helper:{}", camera.id));
        if self.fail_helper.load(Ordering::SeqCst) {
            return Err(BackendError::HelperStartFailed("no camera found".to_string()));
        }
        self.helper_alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_external_streaming(&self, camera: &CameraInfo) {
        std::thread::sleep(self.stop_delay);
        self.log.push(format!("stop_helper:{}", camera.id));
        self.helper_alive.store(false, Ordering::SeqCst);
    }

    fn is_camera_streaming(&self, _camera: &CameraInfo) -> bool {
        self.helper_alive.load(Ordering::SeqCst)
    }
}

/// Pipeline engine replaying scripted start results
#[derive(Default)]
pub struct RecordingEngine {
    pub log: CallLog,
    results: Mutex<VecDeque<Result<(), String>>>,
    /// Result once the script runs out
    fallback_error: Mutex<Option<String>>,
    pub running: AtomicBool,
    pub stops: AtomicUsize,
}

impl RecordingEngine {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    /// Every start fails with `message`
    pub fn failing(log: CallLog, message: &str) -> Self {
        let engine = Self::new(log);
        *engine.fallback_error.lock().unwrap() = Some(message.to_string());
        engine
    }

    pub fn script(&self, results: Vec<Result<(), String>>) {
        *self.results.lock().unwrap() = results.into();
    }

    pub fn starts(&self) -> Vec<String> {
        self.log
            .entries()
            .into_iter()
            .filter_map(|e| e.strip_prefix("engine_start:").map(str::to_string))
            .collect()
    }
}

impl PipelineEngine for RecordingEngine {
    fn start(&self, descriptor: &str) -> Result<(), String> {
        self.log.push(format!("engine_start:{}", descriptor));
        let scripted = self.results.lock().unwrap().pop_front();
        let result = match scripted {
            Some(result) => result,
            None => match self.fallback_error.lock().unwrap().clone() {
                Some(message) => Err(message),
                None => Ok(()),
            },
        };
        self.running.store(result.is_ok(), Ordering::SeqCst);
        result
    }

    fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
