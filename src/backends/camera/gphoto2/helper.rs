// SPDX-License-Identifier: GPL-3.0-only

//! Streaming helper process for gphoto2 cameras
//!
//! gphoto2 holds the camera exclusively while it streams live view, so a
//! helper script pipes `gphoto2 --capture-movie` through ffmpeg into an MPEG-TS
//! UDP stream on the loopback interface. The script is started with
//! `<port> <udp_port> <camera name>` and reports `SUCCESS:<target>` once the
//! stream is up.

use super::super::process::CommandOutput;
use crate::constants::network;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable overriding the helper script location
pub const HELPER_ENV: &str = "CAMHUB_GPHOTO2_HELPER";

const SCRIPT_NAME: &str = "gphoto2-stream.sh";

/// Locate the helper script
///
/// Checks the override variable, the system share directories, then the
/// copy shipped in the source tree.
pub fn locate_script() -> PathBuf {
    if let Some(path) = std::env::var_os(HELPER_ENV) {
        return PathBuf::from(path);
    }

    let candidates = [
        PathBuf::from("/usr/local/share/camhub").join(SCRIPT_NAME),
        PathBuf::from("/usr/share/camhub").join(SCRIPT_NAME),
        Path::new(env!("CARGO_MANIFEST_DIR")).join("scripts").join(SCRIPT_NAME),
    ];
    for candidate in &candidates {
        if candidate.is_file() {
            debug!(script = %candidate.display(), "Found gphoto2 helper script");
            return candidate.clone();
        }
    }
    candidates[candidates.len() - 1].clone()
}

/// Outcome of one helper start
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperOutcome {
    /// The script printed `SUCCESS:<target>`
    Confirmed(String),
    /// The script exited 0 without a marker
    ExitedCleanly,
    /// Anything else
    Failed(String),
}

impl HelperOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, HelperOutcome::Failed(_))
    }
}

/// Interpret the helper's combined output and exit status
pub fn interpret(output: &CommandOutput) -> HelperOutcome {
    let combined = output.combined();
    if let Some(target) = combined
        .lines()
        .find_map(|line| line.trim().strip_prefix("SUCCESS:"))
    {
        return HelperOutcome::Confirmed(target.trim().to_string());
    }
    if output.success() {
        return HelperOutcome::ExitedCleanly;
    }

    let reason = combined
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no output")
        .to_string();
    HelperOutcome::Failed(match output.status {
        Some(code) => format!("helper exited with code {}: {}", code, reason),
        None => format!("helper was killed: {}", reason),
    })
}

/// `pgrep`/`pkill` pattern matching the gphoto2 process of a port
pub fn gphoto2_pattern(port: &str) -> String {
    format!("gphoto2.*--port {}", port)
}

/// `pgrep`/`pkill` pattern matching the ffmpeg process feeding a UDP port
pub fn ffmpeg_pattern(udp_port: u16) -> String {
    format!("ffmpeg.*udp://{}:{}", network::LOOPBACK_ADDRESS, udp_port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpret_success_marker() {
        let output = CommandOutput::ok("starting\nSUCCESS:udp://127.0.0.1:5123\n");
        assert_eq!(
            interpret(&output),
            HelperOutcome::Confirmed("udp://127.0.0.1:5123".to_string())
        );
    }

    #[test]
    fn test_interpret_marker_on_stderr_with_failure_code() {
        let output = CommandOutput {
            status: Some(1),
            stdout: String::new(),
            stderr: "SUCCESS:/dev/video9".into(),
        };
        assert!(interpret(&output).is_success());
    }

    #[test]
    fn test_interpret_clean_exit_and_failure() {
        assert_eq!(interpret(&CommandOutput::ok("")), HelperOutcome::ExitedCleanly);

        let failed = interpret(&CommandOutput::failed(2, "gphoto2: Could not claim the USB device\n"));
        assert_eq!(
            failed,
            HelperOutcome::Failed(
                "helper exited with code 2: gphoto2: Could not claim the USB device".to_string()
            )
        );
    }

    #[test]
    fn test_process_patterns() {
        assert_eq!(gphoto2_pattern("usb:001,005"), "gphoto2.*--port usb:001,005");
        assert_eq!(ffmpeg_pattern(5123), "ffmpeg.*udp://127.0.0.1:5123");
    }
}
