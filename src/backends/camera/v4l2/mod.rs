// SPDX-License-Identifier: GPL-3.0-only

//! USB Video Class backend
//!
//! Discovers webcams with `v4l2-ctl`, reads their formats and controls, and
//! builds a source that goes through PipeWire when the device is registered
//! there (shared access) or opens the node directly otherwise (exclusive).

pub mod parse;

use super::pipewire::dump;
use super::process::CommandRunner;
use super::types::*;
use super::CameraBackend;
use crate::constants::{formats, tools};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Driver for V4L2 capture devices
pub struct V4l2Backend {
    runner: Arc<dyn CommandRunner>,
}

impl V4l2Backend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn is_capture_device(&self, device: &str) -> bool {
        match self
            .runner
            .run("v4l2-ctl", &["-d", device, "--info"], tools::ENUMERATION_TIMEOUT)
        {
            Ok(output) => output.stdout.contains("Video Capture"),
            Err(e) => {
                debug!(device, error = %e, "Capability query failed");
                false
            }
        }
    }

    fn query_formats(&self, device: &str) -> Vec<VideoFormat> {
        match self.runner.run_checked(
            "v4l2-ctl",
            &["-d", device, "--list-formats-ext"],
            tools::ENUMERATION_TIMEOUT,
        ) {
            Ok(output) => parse::parse_formats(&output.stdout),
            Err(e) => {
                warn!(device, error = %e, "Format enumeration failed");
                Vec::new()
            }
        }
    }

    /// PipeWire node id for a V4L2 device, when PipeWire manages it
    fn find_pipewire_node(&self, device: &str) -> Option<u32> {
        let output = self
            .runner
            .run("pw-dump", &[], tools::HOUSEKEEPING_TIMEOUT)
            .ok()?;
        if !output.success() {
            return None;
        }
        let objects = dump::parse_dump(&output.stdout).ok()?;
        let node = dump::find_v4l2_node(&objects, device)?;
        info!(node, device, "PipeWire node found for V4L2 device");
        Some(node)
    }
}

/// Pick a streaming format automatically
///
/// Prefers MJPEG reaching 25 fps (lower USB bandwidth at high resolutions),
/// then uncompressed formats reaching 25 fps, then anything. Among the
/// candidates the largest resolution wins, ties broken by frame rate.
pub fn pick_best_format(available: &[VideoFormat]) -> Option<VideoFormat> {
    let fast_enough = |f: &&VideoFormat| f.max_fps() >= formats::MIN_PREFERRED_FPS;

    let mjpeg: Vec<&VideoFormat> = available.iter().filter(|f| f.is_mjpeg()).filter(fast_enough).collect();
    let raw: Vec<&VideoFormat> = available.iter().filter(|f| !f.is_mjpeg()).filter(fast_enough).collect();

    let candidates: Vec<&VideoFormat> = if !mjpeg.is_empty() {
        mjpeg
    } else if !raw.is_empty() {
        raw
    } else {
        available.iter().collect()
    };

    candidates
        .into_iter()
        .max_by(|a, b| {
            a.pixels()
                .cmp(&b.pixels())
                .then(a.max_fps().total_cmp(&b.max_fps()))
        })
        .cloned()
}

impl CameraBackend for V4l2Backend {
    fn backend_type(&self) -> CameraBackendType {
        CameraBackendType::V4l2
    }

    fn is_available(&self) -> bool {
        self.runner
            .run("v4l2-ctl", &["--version"], tools::PROBE_TIMEOUT)
            .map(|o| o.success())
            .unwrap_or(false)
    }

    fn detect_cameras(&self) -> BackendResult<Vec<CameraInfo>> {
        let output = self
            .runner
            .run_checked("v4l2-ctl", &["--list-devices"], tools::ENUMERATION_TIMEOUT)
            .map_err(|e| BackendError::DetectionFailed(e.to_string()))?;

        let mut cameras = Vec::new();
        for block in parse::parse_device_list(&output.stdout) {
            if block.is_loopback() {
                debug!(header = %block.header, "Skipping loopback device");
                continue;
            }
            let Some(device) = block.primary_node() else {
                continue;
            };
            if !self.is_capture_device(device) {
                debug!(device, "Not a capture device");
                continue;
            }

            let mut camera = CameraInfo::new(
                format!("v4l2:{}", device),
                block.name.clone(),
                CameraBackendType::V4l2,
                device,
            )
            .with_capabilities(&[Capability::Video, Capability::Controls, Capability::Photo]);
            camera.formats = self.query_formats(device);

            debug!(device, name = %camera.name, formats = camera.formats.len(), "Found V4L2 camera");
            cameras.push(camera);
        }

        info!(count = cameras.len(), "Found V4L2 cameras");
        Ok(cameras)
    }

    fn get_controls(&self, camera: &mut CameraInfo) -> BackendResult<Vec<CameraControl>> {
        let output = self.runner.run_checked(
            "v4l2-ctl",
            &["-d", &camera.device_path, "--list-ctrls-menus"],
            tools::ENUMERATION_TIMEOUT,
        )?;
        Ok(parse::parse_controls(&output.stdout))
    }

    fn set_control(
        &self,
        camera: &mut CameraInfo,
        control_id: &str,
        value: &ControlValue,
    ) -> BackendResult<()> {
        let assignment = format!("{}={}", control_id, value.to_arg());
        self.runner.run_checked(
            "v4l2-ctl",
            &["-d", &camera.device_path, "--set-ctrl", &assignment],
            tools::SET_CONTROL_TIMEOUT,
        )?;
        debug!(device = %camera.device_path, control = control_id, value = %value, "Control set");
        Ok(())
    }

    fn source_descriptor(&self, camera: &CameraInfo, format: Option<&VideoFormat>) -> Option<String> {
        let device = camera.device_path.as_str();
        if device.is_empty() {
            return None;
        }

        // PipeWire lets other applications share the camera
        let src = match self.find_pipewire_node(device) {
            Some(node) => format!("pipewiresrc target-object={}", node),
            None => format!("v4l2src device={}", device),
        };

        let chosen = format.cloned().or_else(|| pick_best_format(&camera.formats));
        Some(match chosen {
            Some(fmt) => format!("{} ! {} ! videoconvert", src, fmt.caps_fragment()),
            None => format!("{} ! videoconvert", src),
        })
    }

    fn can_capture_photo(&self) -> bool {
        true
    }

    fn capture_photo(&self, camera: &CameraInfo, output: &Path) -> BackendResult<()> {
        let out = output.to_string_lossy();
        self.runner.run_checked(
            "ffmpeg",
            &[
                "-y",
                "-f",
                "v4l2",
                "-i",
                &camera.device_path,
                "-frames:v",
                "1",
                "-q:v",
                "2",
                &out,
            ],
            tools::SNAPSHOT_TIMEOUT,
        )?;
        if output.is_file() {
            Ok(())
        } else {
            Err(BackendError::IoError(format!("{} was not written", output.display())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(pixel_format: &str, width: u32, height: u32, fps: f64) -> VideoFormat {
        VideoFormat {
            width,
            height,
            fps: vec![fps],
            pixel_format: pixel_format.to_string(),
            description: String::new(),
        }
    }

    #[test]
    fn test_pick_best_prefers_fast_mjpeg() {
        let formats = vec![
            fmt("YUYV", 1920, 1080, 5.0),
            fmt("MJPG", 1280, 720, 30.0),
            fmt("MJPG", 1920, 1080, 30.0),
            fmt("MJPG", 3840, 2160, 10.0),
        ];
        let best = pick_best_format(&formats).unwrap();
        assert_eq!((best.width, best.height), (1920, 1080));
        assert!(best.is_mjpeg());
    }

    #[test]
    fn test_pick_best_falls_back_to_raw_then_anything() {
        let raw = vec![fmt("YUYV", 640, 480, 30.0), fmt("MJPG", 1920, 1080, 15.0)];
        assert_eq!(pick_best_format(&raw).unwrap().pixel_format, "YUYV");

        let slow = vec![fmt("YUYV", 640, 480, 10.0), fmt("YUYV", 1280, 720, 10.0)];
        assert_eq!(pick_best_format(&slow).unwrap().width, 1280);

        assert!(pick_best_format(&[]).is_none());
    }

    #[test]
    fn test_pick_best_tie_breaks_on_fps() {
        let formats = vec![fmt("MJPG", 1280, 720, 30.0), fmt("MJPG", 1280, 720, 60.0)];
        assert_eq!(pick_best_format(&formats).unwrap().max_fps(), 60.0);
    }
}
