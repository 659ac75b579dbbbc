// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

use std::time::Duration;

/// Application identity
pub mod app_info {
    /// Directory name under the user's config dir
    pub const CONFIG_DIR_NAME: &str = "camhub";

    /// Settings file name inside the config dir
    pub const SETTINGS_FILE: &str = "settings.json";

    /// Profiles directory name inside the config dir
    pub const PROFILES_DIR: &str = "profiles";

    /// Name of this application's own virtual camera output.
    /// Sources carrying it are skipped during detection.
    pub const VIRTUAL_OUTPUT_NAME: &str = "camhub (Virtual)";

    /// Get the application version (git describe output when built from a checkout)
    pub fn version() -> &'static str {
        env!("CAMHUB_BUILD_VERSION")
    }
}

/// Timeouts applied to external tool invocations
pub mod tools {
    use super::Duration;

    /// Presence probes (`--version`)
    pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

    /// Device enumeration and capability queries
    pub const ENUMERATION_TIMEOUT: Duration = Duration::from_secs(10);

    /// Control writes
    pub const SET_CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

    /// gphoto2 `--list-all-config`
    pub const LIST_CONFIG_TIMEOUT: Duration = Duration::from_secs(15);

    /// gphoto2 batched `--get-config`
    pub const BATCH_CONFIG_TIMEOUT: Duration = Duration::from_secs(30);

    /// gphoto2 single `--get-config`
    pub const SINGLE_CONFIG_TIMEOUT: Duration = Duration::from_secs(10);

    /// Still capture
    pub const PHOTO_TIMEOUT: Duration = Duration::from_secs(60);

    /// Quick one-shot grabs (ffmpeg, gst-launch)
    pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);

    /// `fuser` on a device node
    pub const FUSER_TIMEOUT: Duration = Duration::from_secs(5);

    /// Streaming helper start-up
    pub const HELPER_TIMEOUT: Duration = Duration::from_secs(60);

    /// Small housekeeping commands (pkill, pgrep, systemctl, gio)
    pub const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(5);

    /// Polling interval while waiting on a child process
    pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
}

/// Timing of orchestration activities
pub mod timing {
    use super::Duration;

    /// Hotplug fingerprint polling period
    pub const HOTPLUG_INTERVAL: Duration = Duration::from_secs(5);

    /// Grace period before a disconnected phone is removed
    pub const PHONE_DISCONNECT_GRACE: Duration = Duration::from_secs(5);

    /// Wait after killing device holders for the kernel to reflect the release
    pub const RELEASE_SETTLE: Duration = Duration::from_secs(1);

    /// Wait after a USB reset before the device is expected back
    pub const USB_RESET_SETTLE: Duration = Duration::from_secs(2);

    /// How long to wait for a reset device to reappear on the bus
    pub const USB_REAPPEAR_TIMEOUT: Duration = Duration::from_secs(10);

    /// Graceful terminate window before force-killing a streaming helper
    pub const HELPER_STOP_GRACE: Duration = Duration::from_secs(2);

    /// Settle time after the auto-mount monitor is killed before enumeration
    pub const AUTOMOUNT_SETTLE: Duration = Duration::from_millis(500);

    /// Delay between the two photo capture attempts
    pub const CAPTURE_RETRY_DELAY: Duration = Duration::from_secs(2);

    /// Confirmation window for child-process pipelines
    pub const PIPELINE_CONFIRM: Duration = Duration::from_millis(1500);

    /// Timeout waiting for an in-process pipeline to reach PLAYING
    pub const PIPELINE_STATE_TIMEOUT: Duration = Duration::from_secs(2);
}

/// Bounded retry parameters
pub mod retry {
    use super::Duration;

    /// Warm-up delay before the first pipeline construction attempt for pull sources
    pub const PIPELINE_INITIAL_DELAY: Duration = Duration::from_secs(2);

    /// Interval between pipeline construction attempts
    pub const PIPELINE_INTERVAL: Duration = Duration::from_millis(500);

    /// Maximum number of pipeline construction attempts
    pub const PIPELINE_MAX_ATTEMPTS: u32 = 30;

    /// Back-off schedule for gphoto2 control discovery
    pub const CONTROL_RETRY_DELAYS: [Duration; 3] = [
        Duration::ZERO,
        Duration::from_secs(3),
        Duration::from_secs(5),
    ];

    /// gphoto2 `--auto-detect` attempts
    pub const DETECT_ATTEMPTS: u32 = 2;

    /// Config paths read per gphoto2 invocation
    pub const CONFIG_BATCH_SIZE: usize = 50;
}

/// Network source parameters
pub mod network {
    /// URL schemes accepted for network cameras
    pub const ALLOWED_SCHEMES: &[&str] = &["rtsp", "rtsps", "http", "https"];

    /// rtspsrc jitter buffer latency in milliseconds
    pub const RTSP_LATENCY_MS: u32 = 300;

    /// Loopback address the gphoto2 helper streams to
    pub const LOOPBACK_ADDRESS: &str = "127.0.0.1";

    /// First UDP port handed to gphoto2 helpers (offset by pid to avoid clashes between instances)
    pub const BASE_UDP_PORT: u16 = 5000;
}

/// Format selection thresholds
pub mod formats {
    /// Minimum frame rate a format must reach to be preferred automatically
    pub const MIN_PREFERRED_FPS: f64 = 25.0;

    /// Resolution presets accepted by the `preferred-resolution` setting
    pub const RESOLUTION_PRESETS: &[(&str, u32)] =
        &[("480", 480), ("720", 720), ("1080", 1080), ("2160", 2160)];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_budget_is_bounded() {
        let total = retry::PIPELINE_INITIAL_DELAY
            + retry::PIPELINE_INTERVAL * retry::PIPELINE_MAX_ATTEMPTS;
        assert_eq!(total, Duration::from_secs(17));
    }

    #[test]
    fn test_control_retry_delays_escalate() {
        let delays = retry::CONTROL_RETRY_DELAYS;
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }
}
