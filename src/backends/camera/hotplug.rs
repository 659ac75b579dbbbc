// SPDX-License-Identifier: GPL-3.0-only

//! USB hotplug polling
//!
//! Fingerprints the USB topology (`lsusb` output) on a timer and runs a full
//! detection pass only when the fingerprint changes. Polling can be paused,
//! which the session controller does while a gphoto2 helper is being set up.

use super::manager::CameraManager;
use super::process::CommandRunner;
use crate::constants::{timing, tools};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Polling is paused
    Paused,
    /// A detection pass is already running
    Busy,
    /// The topology could not be read
    Unavailable,
    /// Same fingerprint as last time
    Unchanged,
    /// Fingerprint changed and a detection pass ran
    Changed,
}

/// Polls the USB topology and triggers detection on change
pub struct HotplugMonitor {
    manager: CameraManager,
    runner: Arc<dyn CommandRunner>,
    paused: Arc<AtomicBool>,
    last_fingerprint: Mutex<Option<u64>>,
}

impl HotplugMonitor {
    pub fn new(manager: CameraManager, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            manager,
            runner,
            paused: Arc::new(AtomicBool::new(false)),
            last_fingerprint: Mutex::new(None),
        }
    }

    /// Hash of the current `lsusb` listing
    fn fingerprint(runner: &dyn CommandRunner) -> Option<u64> {
        let output = runner
            .run("lsusb", &[], tools::HOUSEKEEPING_TIMEOUT)
            .ok()
            .filter(|o| o.success())?;
        let mut hasher = DefaultHasher::new();
        output.stdout.hash(&mut hasher);
        Some(hasher.finish())
    }

    /// Run one poll
    ///
    /// The first successful poll always triggers detection. A fingerprint is
    /// only remembered once a detection pass actually ran for it, so a change
    /// seen while another pass is in flight is picked up by the next poll.
    pub async fn poll_once(&self) -> PollOutcome {
        if self.paused.load(Ordering::Acquire) {
            return PollOutcome::Paused;
        }

        let runner = Arc::clone(&self.runner);
        let fingerprint = tokio::task::spawn_blocking(move || Self::fingerprint(runner.as_ref()))
            .await
            .ok()
            .flatten();
        let Some(fingerprint) = fingerprint else {
            debug!("USB topology unavailable");
            return PollOutcome::Unavailable;
        };

        let last = *self
            .last_fingerprint
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if last == Some(fingerprint) {
            return PollOutcome::Unchanged;
        }

        info!("USB topology changed, detecting cameras");
        if !self.manager.detect_cameras().await {
            debug!("Detection already running, retrying on the next poll");
            return PollOutcome::Busy;
        }
        *self
            .last_fingerprint
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(fingerprint);
        PollOutcome::Changed
    }

    /// Start polling every `interval` on the current runtime
    pub fn spawn(self, interval: Duration) -> HotplugHandle {
        let paused = Arc::clone(&self.paused);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let outcome = self.poll_once().await;
                        debug!(?outcome, "Hotplug poll");
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Hotplug polling shutdown requested");
                        break;
                    }
                }
            }
        });

        HotplugHandle {
            inner: Arc::new(HandleInner {
                paused,
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                task: Mutex::new(Some(task)),
            }),
        }
    }

    /// Start polling at the default interval
    pub fn spawn_default(self) -> HotplugHandle {
        self.spawn(timing::HOTPLUG_INTERVAL)
    }
}

struct HandleInner {
    paused: Arc<AtomicBool>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Control handle for a running [`HotplugMonitor`]
#[derive(Clone)]
pub struct HotplugHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for HotplugHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotplugHandle")
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl HotplugHandle {
    pub fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::AcqRel) {
            debug!("Hotplug polling paused");
        }
    }

    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::AcqRel) {
            debug!("Hotplug polling resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Stop polling; later calls are no-ops
    pub fn stop(&self) {
        self.inner
            .shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = self.inner.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
            info!("Hotplug polling stopped");
        } else {
            warn!("Hotplug polling already stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::process::{CommandOutput, ScriptedRunner};

    #[tokio::test]
    async fn test_paused_monitor_skips_polls() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("lsusb", &[], CommandOutput::ok("Bus 001 Device 001: ID 1d6b:0002 hub"));
        let monitor = HotplugMonitor::new(CameraManager::new(vec![]), runner.clone());

        monitor.paused.store(true, Ordering::Release);
        assert_eq!(monitor.poll_once().await, PollOutcome::Paused);
        assert_eq!(runner.count("lsusb", &[]), 0);

        monitor.paused.store(false, Ordering::Release);
        assert_eq!(monitor.poll_once().await, PollOutcome::Changed);
        assert_eq!(monitor.poll_once().await, PollOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_missing_lsusb() {
        let runner = Arc::new(ScriptedRunner::new());
        let monitor = HotplugMonitor::new(CameraManager::new(vec![]), runner);
        assert_eq!(monitor.poll_once().await, PollOutcome::Unavailable);
    }

    #[tokio::test]
    async fn test_handle_pause_resume_stop() {
        let runner = Arc::new(ScriptedRunner::new());
        let handle = HotplugMonitor::new(CameraManager::new(vec![]), runner).spawn(Duration::from_secs(60));

        handle.pause();
        assert!(handle.is_paused());
        handle.resume();
        assert!(!handle.is_paused());
        handle.stop();
        handle.stop();
    }
}
