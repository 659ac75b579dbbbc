// SPDX-License-Identifier: GPL-3.0-only

//! Device conflict resolution
//!
//! Finds out who holds a device node, evicts them when asked to, and can
//! reset a wedged USB device. Used by the gphoto2 driver before it touches
//! the camera and by the session controller to make busy errors actionable.

use super::process::CommandRunner;
use super::types::{BackendError, BackendResult};
use crate::constants::{timing, tools};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// `USBDEVFS_RESET` ioctl number (`_IO('U', 20)`)
const USBDEVFS_RESET: libc::c_ulong = 0x5514;

/// One row of `lsusb` output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    /// Zero-padded bus number (e.g. "001")
    pub bus: String,
    /// Zero-padded device number (e.g. "005")
    pub device: String,
    /// Lower-case hex vendor id (e.g. "04a9")
    pub vendor_id: String,
    pub product_id: String,
    pub description: String,
}

/// Parse `lsusb` output
///
/// Format: `Bus 001 Device 005: ID 04a9:3218 Canon, Inc. EOS 600D`
pub fn parse_lsusb(output: &str) -> Vec<UsbDevice> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("Bus ")?;
            let (bus, rest) = rest.split_once(" Device ")?;
            let (device, rest) = rest.split_once(": ID ")?;
            let (ids, description) = rest.split_once(' ').unwrap_or((rest, ""));
            let (vendor_id, product_id) = ids.split_once(':')?;
            Some(UsbDevice {
                bus: bus.trim().to_string(),
                device: device.trim().to_string(),
                vendor_id: vendor_id.to_ascii_lowercase(),
                product_id: product_id.to_ascii_lowercase(),
                description: description.trim().to_string(),
            })
        })
        .collect()
}

/// Parse the pid list printed by `fuser`
///
/// `fuser` prints pids on stdout with optional access letters appended
/// (`1234 5678m`), and the file name on stderr.
pub fn parse_fuser_pids(output: &str) -> Vec<u32> {
    let mut pids = Vec::new();
    for token in output.split_whitespace() {
        let digits = token.trim_end_matches(|c: char| !c.is_ascii_digit());
        if let Ok(pid) = digits.parse::<u32>()
            && !pids.contains(&pid)
        {
            pids.push(pid);
        }
    }
    pids
}

/// Timing knobs for forceful interventions
#[derive(Debug, Clone, Copy)]
pub struct ResolverTiming {
    /// Wait after killing holders
    pub release_settle: Duration,
    /// Wait after a USB reset before polling for the device
    pub reset_settle: Duration,
    /// Give up waiting for a reset device after this long
    pub reappear_timeout: Duration,
}

impl Default for ResolverTiming {
    fn default() -> Self {
        Self {
            release_settle: timing::RELEASE_SETTLE,
            reset_settle: timing::USB_RESET_SETTLE,
            reappear_timeout: timing::USB_REAPPEAR_TIMEOUT,
        }
    }
}

/// Identifies and evicts processes holding a device
#[derive(Clone)]
pub struct ConflictResolver {
    runner: Arc<dyn CommandRunner>,
    proc_root: PathBuf,
    usb_root: PathBuf,
    own_pid: u32,
    timing: ResolverTiming,
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("proc_root", &self.proc_root)
            .field("usb_root", &self.usb_root)
            .field("own_pid", &self.own_pid)
            .finish()
    }
}

impl ConflictResolver {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            proc_root: PathBuf::from("/proc"),
            usb_root: PathBuf::from("/dev/bus/usb"),
            own_pid: std::process::id(),
            timing: ResolverTiming::default(),
        }
    }

    /// Read process names from a different process table root
    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }

    /// Look up USB device nodes under a different root
    pub fn with_usb_root(mut self, usb_root: impl Into<PathBuf>) -> Self {
        self.usb_root = usb_root.into();
        self
    }

    pub fn with_timing(mut self, timing: ResolverTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Pid treated as "ourselves" and never reported or killed
    pub fn with_own_pid(mut self, pid: u32) -> Self {
        self.own_pid = pid;
        self
    }

    /// Node for a USB bus/device pair (`/dev/bus/usb/BBB/DDD`)
    pub fn usb_node(&self, bus: &str, device: &str) -> PathBuf {
        self.usb_root.join(bus).join(device)
    }

    /// Pids holding `device_path`, excluding this process
    pub fn holder_pids(&self, device_path: &str) -> Vec<u32> {
        let output = match self
            .runner
            .run("fuser", &[device_path], tools::FUSER_TIMEOUT)
        {
            Ok(output) => output,
            Err(e) => {
                debug!(device = device_path, error = %e, "fuser unavailable");
                return Vec::new();
            }
        };

        // fuser exits 1 when nobody holds the file
        parse_fuser_pids(&output.stdout)
            .into_iter()
            .filter(|pid| *pid != self.own_pid)
            .collect()
    }

    /// Names of the processes holding `device_path`
    ///
    /// Never fails; an unreadable process table entry is reported as `pid N`.
    pub fn processes_holding(&self, device_path: &str) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for pid in self.holder_pids(device_path) {
            let name = self
                .process_name(pid)
                .unwrap_or_else(|| format!("pid {}", pid));
            if !names.contains(&name) {
                names.push(name);
            }
        }
        if !names.is_empty() {
            debug!(device = device_path, holders = ?names, "Device is held");
        }
        names
    }

    fn process_name(&self, pid: u32) -> Option<String> {
        let comm = std::fs::read_to_string(self.proc_root.join(pid.to_string()).join("comm")).ok()?;
        let name = comm.trim();
        if name.is_empty() { None } else { Some(name.to_string()) }
    }

    /// Kill every process holding `device_path` (except ourselves)
    ///
    /// # Returns
    /// Number of processes signalled
    pub fn force_release(&self, device_path: &str) -> usize {
        let pids = self.holder_pids(device_path);
        let mut killed = 0;

        for pid in &pids {
            let pid_arg = pid.to_string();
            match self
                .runner
                .run("kill", &["-9", &pid_arg], tools::HOUSEKEEPING_TIMEOUT)
            {
                Ok(output) if output.success() => {
                    info!(pid, device = device_path, "Killed process holding device");
                    killed += 1;
                }
                Ok(output) => debug!(pid, stderr = %output.stderr.trim(), "kill failed"),
                Err(e) => debug!(pid, error = %e, "kill failed"),
            }
        }

        if killed > 0 {
            std::thread::sleep(self.timing.release_settle);
        }
        killed
    }

    /// Enumerate USB devices via `lsusb`
    pub fn usb_devices(&self) -> Vec<UsbDevice> {
        match self.runner.run("lsusb", &[], tools::HOUSEKEEPING_TIMEOUT) {
            Ok(output) if output.success() => parse_lsusb(&output.stdout),
            _ => Vec::new(),
        }
    }

    /// Look up the device sitting at a bus/device address
    pub fn usb_device_at(&self, bus: &str, device: &str) -> Option<UsbDevice> {
        let selector = format!("{}:{}", bus, device);
        let output = self
            .runner
            .run("lsusb", &["-s", &selector], tools::HOUSEKEEPING_TIMEOUT)
            .ok()?;
        if !output.success() {
            return None;
        }
        parse_lsusb(&output.stdout).into_iter().next()
    }

    /// Reset the first USB device of `vendor_id` and wait for it to come back
    ///
    /// Disruptive: the device disconnects and usually comes back with a new
    /// device number. Only used for the gphoto2 "stuck" failure mode.
    pub fn reset_usb_device(&self, vendor_id: &str) -> BackendResult<()> {
        let vendor = vendor_id.to_ascii_lowercase();
        let target = self
            .usb_devices()
            .into_iter()
            .find(|d| d.vendor_id == vendor)
            .ok_or_else(|| BackendError::DeviceNotFound(format!("no USB device with vendor {}", vendor)))?;

        let node = self.usb_node(&target.bus, &target.device);
        info!(node = %node.display(), vendor = %vendor, "Resetting USB device");
        issue_usb_reset(&node)?;

        std::thread::sleep(self.timing.reset_settle);

        let deadline = Instant::now() + self.timing.reappear_timeout;
        loop {
            if self.usb_devices().iter().any(|d| d.vendor_id == vendor) {
                info!(vendor = %vendor, "USB device is back after reset");
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(vendor = %vendor, "USB device did not reappear after reset");
                return Err(BackendError::DeviceNotFound(format!(
                    "USB device {} did not reappear after reset",
                    vendor
                )));
            }
            std::thread::sleep(Duration::from_millis(500));
        }
    }
}

fn issue_usb_reset(node: &Path) -> BackendResult<()> {
    let file = std::fs::OpenOptions::new().write(true).open(node)?;
    let result = unsafe { libc::ioctl(file.as_raw_fd(), USBDEVFS_RESET as _, 0) };
    if result < 0 {
        let err = std::io::Error::last_os_error();
        warn!(node = %node.display(), error = %err, "USBDEVFS_RESET failed");
        return Err(BackendError::IoError(format!(
            "USB reset of {} failed: {}",
            node.display(),
            err
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::process::{CommandOutput, ScriptedRunner};

    const LSUSB: &str = "\
Bus 002 Device 001: ID 1d6b:0003 Linux Foundation 3.0 root hub
Bus 001 Device 005: ID 04A9:3218 Canon, Inc. EOS 600D
Bus 001 Device 003: ID 046d:0825 Logitech, Inc. Webcam C270
";

    fn quick_timing() -> ResolverTiming {
        ResolverTiming {
            release_settle: Duration::ZERO,
            reset_settle: Duration::ZERO,
            reappear_timeout: Duration::ZERO,
        }
    }

    #[test]
    fn test_parse_lsusb() {
        let devices = parse_lsusb(LSUSB);
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[1].bus, "001");
        assert_eq!(devices[1].device, "005");
        assert_eq!(devices[1].vendor_id, "04a9");
        assert_eq!(devices[1].description, "Canon, Inc. EOS 600D");
    }

    #[test]
    fn test_parse_fuser_pids_strips_access_flags() {
        assert_eq!(parse_fuser_pids(" 1234 5678m  1234"), vec![1234, 5678]);
        assert!(parse_fuser_pids("").is_empty());
    }

    #[test]
    fn test_processes_holding_excludes_self_and_resolves_names() {
        let proc_root = std::env::temp_dir().join(format!("camhub-proc-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(proc_root.join("4242")).unwrap();
        std::fs::write(proc_root.join("4242").join("comm"), "gvfsd-gphoto2\n").unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("fuser", &["/dev/bus/usb/001/005"], CommandOutput::ok(" 4242 100 77"));

        let resolver = ConflictResolver::new(runner)
            .with_proc_root(&proc_root)
            .with_own_pid(100);
        let names = resolver.processes_holding("/dev/bus/usb/001/005");

        assert_eq!(names, vec!["gvfsd-gphoto2".to_string(), "pid 77".to_string()]);
        let _ = std::fs::remove_dir_all(&proc_root);
    }

    #[test]
    fn test_processes_holding_tool_missing_is_empty() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond_err(
            "fuser",
            &[],
            BackendError::NotAvailable("fuser not found".into()),
        );
        let resolver = ConflictResolver::new(runner);
        assert!(resolver.processes_holding("/dev/video0").is_empty());
    }

    #[test]
    fn test_force_release_kills_only_foreign_pids() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .respond("fuser", &[], CommandOutput::ok("300 301"))
            .respond("kill", &[], CommandOutput::ok(""));

        let resolver = ConflictResolver::new(runner.clone())
            .with_own_pid(301)
            .with_timing(quick_timing());

        assert_eq!(resolver.force_release("/dev/video0"), 1);
        assert_eq!(runner.count("kill", &["-9", "300"]), 1);
        assert_eq!(runner.count("kill", &["301"]), 0);
    }

    #[test]
    fn test_reset_unknown_vendor_fails() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("lsusb", &[], CommandOutput::ok(LSUSB));
        let resolver = ConflictResolver::new(runner).with_timing(quick_timing());
        assert!(matches!(
            resolver.reset_usb_device("ffff"),
            Err(BackendError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_usb_device_at() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(
            "lsusb",
            &["-s", "001:005"],
            CommandOutput::ok("Bus 001 Device 005: ID 04a9:3218 Canon, Inc. EOS 600D\n"),
        );
        let resolver = ConflictResolver::new(runner);
        let dev = resolver.usb_device_at("001", "005").unwrap();
        assert_eq!(dev.vendor_id, "04a9");
    }
}
