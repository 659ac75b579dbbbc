// SPDX-License-Identifier: GPL-3.0-only

//! gphoto2 backend for DSLR and mirrorless cameras
//!
//! gphoto2 claims the USB device exclusively and competes with the desktop's
//! auto-mount monitor for it, so every device operation is preceded by
//! suppressing that monitor and evicting whoever holds the device node.
//! Live view runs through a helper process per camera (see [`helper`]) that
//! streams MPEG-TS to a loopback UDP port, which the pipeline then pulls.

pub mod config;
pub mod helper;

use super::conflict::ConflictResolver;
use super::process::CommandRunner;
use super::types::*;
use super::CameraBackend;
use crate::constants::{network, retry, timing, tools};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Key in `CameraInfo::extra` holding the gphoto2 port (`usb:BBB,DDD`)
pub const PORT_KEY: &str = "port";

/// Key in `CameraInfo::extra` holding the UDP port of the helper stream
pub const UDP_PORT_KEY: &str = "udp_port";

/// Desktop auto-mount monitor that grabs PTP cameras
const AUTOMOUNT_SERVICE: &str = "gvfs-gphoto2-volume-monitor.service";

/// Delays used by the driver's retry and settle steps
#[derive(Debug, Clone, PartialEq)]
pub struct Gphoto2Timing {
    /// Wait before each `--list-all-config` attempt
    pub control_retry_delays: Vec<Duration>,
    /// Wait after suppressing the auto-mount monitor, before enumerating
    pub automount_settle: Duration,
    /// Wait between `--auto-detect` attempts
    pub detect_retry_delay: Duration,
    /// Wait between the graceful and forced helper kill
    pub helper_stop_grace: Duration,
    /// Wait between the two capture attempts
    pub capture_retry_delay: Duration,
}

impl Default for Gphoto2Timing {
    fn default() -> Self {
        Self {
            control_retry_delays: retry::CONTROL_RETRY_DELAYS.to_vec(),
            automount_settle: timing::AUTOMOUNT_SETTLE,
            detect_retry_delay: timing::RELEASE_SETTLE,
            helper_stop_grace: timing::HELPER_STOP_GRACE,
            capture_retry_delay: timing::CAPTURE_RETRY_DELAY,
        }
    }
}

impl Gphoto2Timing {
    /// Same attempt counts with every delay set to zero
    pub fn immediate() -> Self {
        Self {
            control_retry_delays: vec![Duration::ZERO; retry::CONTROL_RETRY_DELAYS.len()],
            automount_settle: Duration::ZERO,
            detect_retry_delay: Duration::ZERO,
            helper_stop_grace: Duration::ZERO,
            capture_retry_delay: Duration::ZERO,
        }
    }
}

fn pause(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}

/// Driver for PTP cameras driven by the gphoto2 CLI
pub struct Gphoto2Backend {
    runner: Arc<dyn CommandRunner>,
    resolver: ConflictResolver,
    timing: Gphoto2Timing,
    helper_script: PathBuf,
    bitrate_kbps: u32,
    base_udp_port: u16,
    /// gphoto2 port -> UDP port of the running helper
    active_streams: Mutex<HashMap<String, u16>>,
    /// Returned from detection while a helper owns the USB device
    last_detected: Mutex<Vec<CameraInfo>>,
}

impl Gphoto2Backend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        // Offset by pid so two instances never share a UDP port
        let pid_offset = (std::process::id() % 1000) as u16;
        Self {
            resolver: ConflictResolver::new(Arc::clone(&runner)),
            runner,
            timing: Gphoto2Timing::default(),
            helper_script: helper::locate_script(),
            bitrate_kbps: 5000,
            base_udp_port: network::BASE_UDP_PORT + pid_offset,
            active_streams: Mutex::new(HashMap::new()),
            last_detected: Mutex::new(Vec::new()),
        }
    }

    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_timing(mut self, timing: Gphoto2Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_helper_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.helper_script = script.into();
        self
    }

    /// Video bitrate the helper encodes at
    pub fn with_bitrate(mut self, kbps: u32) -> Self {
        self.bitrate_kbps = kbps;
        self
    }

    pub fn with_base_udp_port(mut self, port: u16) -> Self {
        self.base_udp_port = port;
        self
    }

    /// Whether any helper is currently registered
    pub fn is_streaming(&self) -> bool {
        !self
            .active_streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    fn port_of(camera: &CameraInfo) -> String {
        camera
            .extra
            .get(PORT_KEY)
            .cloned()
            .unwrap_or_else(|| camera.device_path.clone())
    }

    fn udp_port_of(&self, camera: &CameraInfo) -> u16 {
        camera
            .extra
            .get(UDP_PORT_KEY)
            .and_then(|p| p.parse().ok())
            .unwrap_or(self.base_udp_port)
    }

    fn housekeeping(&self, program: &str, args: &[&str]) {
        if let Err(e) = self.runner.run(program, args, tools::HOUSEKEEPING_TIMEOUT) {
            debug!(program, ?args, error = %e, "Housekeeping command failed");
        }
    }

    /// Stop and mask the auto-mount monitor and kill its workers
    ///
    /// Idempotent and never fails; the mask is left in place.
    pub fn suppress_automount(&self) {
        self.housekeeping("systemctl", &["--user", "stop", AUTOMOUNT_SERVICE]);
        self.housekeeping("systemctl", &["--user", "mask", AUTOMOUNT_SERVICE]);
        self.housekeeping("pkill", &["-9", "-f", "gvfs-gphoto2-volume-monitor"]);
        self.housekeeping("pkill", &["-9", "-f", "gvfsd-gphoto2"]);
        self.housekeeping("gio", &["mount", "-u", "gphoto2://"]);
    }

    /// Kill other processes holding the USB node behind `port`
    fn release_device(&self, port: &str) {
        let Some((bus, device)) = config::usb_address(port) else {
            return;
        };
        let node = self.resolver.usb_node(&bus, &device);
        let killed = self.resolver.force_release(&node.to_string_lossy());
        if killed > 0 {
            info!(port, killed, "Released camera from other processes");
        }
    }

    fn remediate(&self, port: &str) {
        self.suppress_automount();
        self.release_device(port);
    }

    /// Busy error naming the holders of the USB node behind `port`
    fn busy_error(&self, port: &str) -> BackendError {
        let holders = config::usb_address(port)
            .map(|(bus, device)| {
                let node = self.resolver.usb_node(&bus, &device);
                self.resolver.processes_holding(&node.to_string_lossy())
            })
            .unwrap_or_default();
        BackendError::DeviceBusy {
            device: port.to_string(),
            holders,
        }
    }

    /// Run `--list-all-config`, returning stdout or the failure text
    fn list_all_config(&self, port: &str) -> Result<String, String> {
        match self.runner.run(
            "gphoto2",
            &["--port", port, "--list-all-config"],
            tools::LIST_CONFIG_TIMEOUT,
        ) {
            Ok(output) if output.success() && !output.stdout.trim().is_empty() => Ok(output.stdout),
            Ok(output) => Err(output.combined()),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Re-detect the camera's port after the OS may have renumbered it
    ///
    /// Matches by model name containment. When nothing matches the old
    /// identity is kept.
    pub fn refresh_port(&self, camera: &mut CameraInfo) -> String {
        let old_port = Self::port_of(camera);
        let output = match self
            .runner
            .run("gphoto2", &["--auto-detect"], tools::ENUMERATION_TIMEOUT)
        {
            Ok(output) if output.success() => output,
            _ => return old_port,
        };

        let found = config::parse_auto_detect(&output.stdout)
            .into_iter()
            .find(|row| camera.name.contains(&row.model) || row.model.contains(&camera.name));
        let Some(row) = found else {
            return old_port;
        };

        if row.port != old_port {
            info!(camera = %camera.name, old = %old_port, new = %row.port, "Camera port changed");
            camera.id = format!("gphoto2:{}", row.port);
            camera.device_path = row.port.clone();
            camera.extra.insert(PORT_KEY.to_string(), row.port.clone());
        }
        row.port
    }

    /// Reset the camera's USB device when gphoto2 reported a PTP stall
    fn reset_if_stalled(&self, port: &str, failure: &str) {
        if !config::is_stalled(failure) {
            return;
        }
        let Some((bus, device)) = config::usb_address(port) else {
            return;
        };
        let Some(usb) = self.resolver.usb_device_at(&bus, &device) else {
            debug!(port, "Stalled device not found on the bus");
            return;
        };
        warn!(port, vendor = %usb.vendor_id, "Camera stopped answering, resetting USB device");
        if let Err(e) = self.resolver.reset_usb_device(&usb.vendor_id) {
            warn!(port, error = %e, "USB reset failed");
        }
    }

    fn read_single_config(&self, port: &str, path: &str) -> Option<CameraControl> {
        let output = self
            .runner
            .run_checked(
                "gphoto2",
                &["--port", port, "--get-config", path],
                tools::SINGLE_CONFIG_TIMEOUT,
            )
            .ok()?;
        config::parse_config(path, &output.stdout)
    }

    /// Read config paths in batches, falling back to single reads per failing batch
    fn read_configs(&self, port: &str, paths: &[String]) -> Vec<CameraControl> {
        let mut controls = Vec::new();

        for batch in paths.chunks(retry::CONFIG_BATCH_SIZE) {
            let mut args: Vec<&str> = vec!["--port", port];
            for path in batch {
                args.push("--get-config");
                args.push(path);
            }

            match self.runner.run("gphoto2", &args, tools::BATCH_CONFIG_TIMEOUT) {
                Ok(output) if output.success() => {
                    controls.extend(config::parse_batch_output(batch, &output.stdout));
                }
                _ => {
                    debug!(port, size = batch.len(), "Batch read failed, reading one at a time");
                    controls.extend(
                        batch
                            .iter()
                            .filter_map(|path| self.read_single_config(port, path)),
                    );
                }
            }
        }

        controls
    }
}

impl CameraBackend for Gphoto2Backend {
    fn backend_type(&self) -> CameraBackendType {
        CameraBackendType::Gphoto2
    }

    fn is_available(&self) -> bool {
        self.runner
            .run("gphoto2", &["--version"], tools::PROBE_TIMEOUT)
            .map(|o| o.success())
            .unwrap_or(false)
    }

    fn detect_cameras(&self) -> BackendResult<Vec<CameraInfo>> {
        // Enumerating would disturb the running helper
        if self.is_streaming() {
            let cached = self
                .last_detected
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            debug!(count = cached.len(), "Helper active, returning last detected cameras");
            return Ok(cached);
        }

        self.suppress_automount();
        pause(self.timing.automount_settle);

        let mut rows = Vec::new();
        for attempt in 1..=retry::DETECT_ATTEMPTS {
            let output = self
                .runner
                .run_checked("gphoto2", &["--auto-detect"], tools::ENUMERATION_TIMEOUT)
                .map_err(|e| BackendError::DetectionFailed(e.to_string()))?;
            rows = config::parse_auto_detect(&output.stdout);
            if !rows.is_empty() {
                break;
            }
            if attempt < retry::DETECT_ATTEMPTS {
                pause(self.timing.detect_retry_delay);
            }
        }

        let cameras: Vec<CameraInfo> = rows
            .into_iter()
            .enumerate()
            .map(|(index, row)| {
                let udp_port = self.base_udp_port.saturating_add(index as u16);
                let mut camera = CameraInfo::new(
                    format!("gphoto2:{}", row.port),
                    row.model,
                    CameraBackendType::Gphoto2,
                    row.port.clone(),
                )
                .with_capabilities(&[Capability::Photo, Capability::Video, Capability::Controls]);
                camera.extra.insert(PORT_KEY.to_string(), row.port);
                camera
                    .extra
                    .insert(UDP_PORT_KEY.to_string(), udp_port.to_string());
                camera
            })
            .collect();

        if !cameras.is_empty() {
            *self.last_detected.lock().unwrap_or_else(|e| e.into_inner()) = cameras.clone();
        }
        info!(count = cameras.len(), "Found gphoto2 cameras");
        Ok(cameras)
    }

    fn get_controls(&self, camera: &mut CameraInfo) -> BackendResult<Vec<CameraControl>> {
        let mut port = Self::port_of(camera);
        let attempts = self.timing.control_retry_delays.len();
        let mut listing: Option<String> = None;
        let mut last_failure = String::new();

        for (attempt, delay) in self.timing.control_retry_delays.iter().enumerate() {
            pause(*delay);
            self.remediate(&port);

            debug!(port = %port, attempt = attempt + 1, attempts, "Listing camera config");
            match self.list_all_config(&port) {
                Ok(stdout) => {
                    listing = Some(stdout);
                    break;
                }
                Err(failure) => {
                    warn!(port = %port, attempt = attempt + 1, failure = %failure.trim(), "Config listing failed");
                    last_failure = failure;
                }
            }
        }

        let listing = match listing {
            Some(listing) => listing,
            None => {
                // Last resort: clear a stall, re-identify and try once more
                self.reset_if_stalled(&port, &last_failure);
                port = self.refresh_port(camera);
                self.remediate(&port);
                self.list_all_config(&port).map_err(|failure| {
                    warn!(port = %port, "All config listing attempts failed");
                    if config::is_claim_failure(&failure) {
                        self.busy_error(&port)
                    } else {
                        BackendError::CommandFailed {
                            program: "gphoto2".to_string(),
                            status: None,
                            stderr: failure.trim().to_string(),
                        }
                    }
                })?
            }
        };

        let paths = config::config_paths(&listing);
        let controls = self.read_configs(&port, &paths);
        info!(port = %port, paths = paths.len(), controls = controls.len(), "Read camera controls");
        Ok(controls)
    }

    fn set_control(
        &self,
        camera: &mut CameraInfo,
        control_id: &str,
        value: &ControlValue,
    ) -> BackendResult<()> {
        let port = Self::port_of(camera);
        let assignment = format!("{}={}", control_id, value.to_arg());
        self.runner.run_checked(
            "gphoto2",
            &["--port", &port, "--set-config", &assignment],
            tools::SET_CONTROL_TIMEOUT,
        )?;
        debug!(port = %port, control = control_id, value = %value, "Config set");
        Ok(())
    }

    fn source_descriptor(&self, camera: &CameraInfo, _format: Option<&VideoFormat>) -> Option<String> {
        Some(format!(
            "udpsrc port={} address={} caps=\"video/mpegts,packetsize=(int)1316\" \
             ! queue max-size-bytes=2097152 ! tsdemux ! decodebin ! videoconvert",
            self.udp_port_of(camera),
            network::LOOPBACK_ADDRESS
        ))
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::Pull
    }

    fn needs_external_streaming_setup(&self) -> bool {
        true
    }

    fn start_external_streaming(&self, camera: &mut CameraInfo) -> BackendResult<()> {
        if self.is_camera_streaming(camera) {
            debug!(camera = %camera.name, "Helper already running");
            return Ok(());
        }

        let port = self.refresh_port(camera);
        let udp_port = self.udp_port_of(camera);
        self.remediate(&port);

        let script = self.helper_script.to_string_lossy();
        let udp_arg = udp_port.to_string();
        let bitrate_arg = self.bitrate_kbps.to_string();
        info!(camera = %camera.name, port = %port, udp_port, script = %script, "Starting gphoto2 helper");

        let output = self
            .runner
            .run(
                &script,
                &[&port, &udp_arg, &camera.name, &bitrate_arg],
                tools::HELPER_TIMEOUT,
            )
            .map_err(|e| BackendError::HelperStartFailed(e.to_string()))?;

        match helper::interpret(&output) {
            helper::HelperOutcome::Failed(reason) => {
                warn!(camera = %camera.name, reason = %reason, "gphoto2 helper failed");
                Err(BackendError::HelperStartFailed(reason))
            }
            outcome => {
                info!(camera = %camera.name, ?outcome, "gphoto2 helper running");
                self.active_streams
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(port, udp_port);
                Ok(())
            }
        }
    }

    fn stop_external_streaming(&self, camera: &CameraInfo) {
        let port = Self::port_of(camera);
        let udp_port = self
            .active_streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&port)
            .unwrap_or_else(|| self.udp_port_of(camera));

        let gphoto2_pattern = helper::gphoto2_pattern(&port);
        let ffmpeg_pattern = helper::ffmpeg_pattern(udp_port);
        info!(camera = %camera.name, port = %port, "Stopping gphoto2 helper");

        // Terminate first so gphoto2 can close the PTP session
        self.housekeeping("pkill", &["-f", &gphoto2_pattern]);
        self.housekeeping("pkill", &["-f", &ffmpeg_pattern]);
        pause(self.timing.helper_stop_grace);
        self.housekeeping("pkill", &["-9", "-f", &gphoto2_pattern]);
        self.housekeeping("pkill", &["-9", "-f", &ffmpeg_pattern]);

        // The monitor re-claims the camera as soon as it is free
        self.suppress_automount();
    }

    fn is_camera_streaming(&self, camera: &CameraInfo) -> bool {
        let port = Self::port_of(camera);
        let mut streams = self.active_streams.lock().unwrap_or_else(|e| e.into_inner());
        if !streams.contains_key(&port) {
            return false;
        }

        let pattern = helper::gphoto2_pattern(&port);
        let alive = self
            .runner
            .run("pgrep", &["-f", &pattern], tools::HOUSEKEEPING_TIMEOUT)
            .map(|o| o.success())
            .unwrap_or(false);
        if !alive {
            debug!(port = %port, "Helper process is gone");
            streams.remove(&port);
        }
        alive
    }

    fn can_capture_photo(&self) -> bool {
        true
    }

    fn capture_photo(&self, camera: &CameraInfo, output: &Path) -> BackendResult<()> {
        let port = Self::port_of(camera);
        let out = output.to_string_lossy();
        let mut last_error = BackendError::Other("capture not attempted".to_string());

        for attempt in 0..2 {
            self.suppress_automount();
            if attempt > 0 {
                self.release_device(&port);
                pause(self.timing.capture_retry_delay);
            }

            let result = self.runner.run_checked(
                "gphoto2",
                &[
                    "--port",
                    &port,
                    "--capture-image-and-download",
                    "--filename",
                    &out,
                    "--force-overwrite",
                ],
                tools::PHOTO_TIMEOUT,
            );
            match result {
                Ok(_) if output.is_file() => return Ok(()),
                Ok(_) => {
                    last_error = BackendError::IoError(format!("{} was not written", output.display()));
                }
                Err(e) => last_error = e,
            }
            warn!(port = %port, attempt = attempt + 1, error = %last_error, "Capture attempt failed");
        }

        Err(last_error)
    }
}
