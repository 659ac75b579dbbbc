// SPDX-License-Identifier: GPL-3.0-only

//! libcamera backend for CSI/ISP sensors
//!
//! Cameras are listed with the `cam` utility. The sensor pipeline exposes no
//! controls we can query from the command line, so a fixed set of image
//! controls is offered and their values are kept on the camera and applied
//! when the source is built.

pub mod enumeration;

use super::process::CommandRunner;
use super::types::*;
use super::CameraBackend;
use crate::constants::tools;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Key in `CameraInfo::extra` holding the `cam` index
pub const INDEX_KEY: &str = "index";

/// Prefix of `CameraInfo::extra` keys storing control values
const CONTROL_KEY_PREFIX: &str = "ctrl_";

const AWB_MODES: &[&str] = &[
    "auto",
    "incandescent",
    "tungsten",
    "fluorescent",
    "indoor",
    "daylight",
    "cloudy",
    "custom",
];

const EXPOSURE_MODES: &[&str] = &["normal", "short", "long", "custom"];

/// Driver for libcamera-managed sensors
pub struct LibcameraBackend {
    runner: Arc<dyn CommandRunner>,
}

impl LibcameraBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn query_formats(&self, index: u32) -> Vec<VideoFormat> {
        let index = index.to_string();
        let formats = self
            .runner
            .run_checked("cam", &["-c", &index, "-I"], tools::ENUMERATION_TIMEOUT)
            .map(|output| enumeration::parse_stream_info(&output.stdout))
            .unwrap_or_default();
        if formats.is_empty() {
            debug!(index = %index, "No stream info, using fallback formats");
            enumeration::fallback_formats()
        } else {
            formats
        }
    }
}

fn integer_control(id: &str, name: &str, min: i64, max: i64, default: i64) -> CameraControl {
    CameraControl {
        id: id.to_string(),
        name: name.to_string(),
        category: ControlCategory::Image,
        control_type: ControlType::Integer,
        value: ControlValue::Int(default),
        default: ControlValue::Int(default),
        minimum: Some(min),
        maximum: Some(max),
        step: Some(1),
        choices: Vec::new(),
        flags: String::new(),
    }
}

fn menu_control(id: &str, name: &str, category: ControlCategory, choices: &[&str]) -> CameraControl {
    let default = ControlValue::Text(choices[0].to_string());
    CameraControl {
        id: id.to_string(),
        name: name.to_string(),
        category,
        control_type: ControlType::Menu,
        value: default.clone(),
        default,
        minimum: None,
        maximum: None,
        step: None,
        choices: choices.iter().map(|c| c.to_string()).collect(),
        flags: String::new(),
    }
}

/// The controls libcamerasrc can apply, at their defaults
fn fixed_controls() -> Vec<CameraControl> {
    vec![
        integer_control("brightness", "Brightness", -100, 100, 0),
        integer_control("contrast", "Contrast", 0, 200, 100),
        integer_control("saturation", "Saturation", 0, 200, 100),
        menu_control("awb-mode", "White Balance", ControlCategory::WhiteBalance, AWB_MODES),
        menu_control("exposure-mode", "Exposure Mode", ControlCategory::Exposure, EXPOSURE_MODES),
    ]
}

fn stored_value<'a>(camera: &'a CameraInfo, id: &str) -> Option<&'a str> {
    camera
        .extra
        .get(&format!("{}{}", CONTROL_KEY_PREFIX, id))
        .map(String::as_str)
}

/// Pipeline fragment applying stored control values
///
/// Returns the extra libcamerasrc properties and an optional videobalance
/// element. Values at their defaults are omitted.
fn control_fragments(camera: &CameraInfo) -> (String, Option<String>) {
    let int_of = |id: &str| stored_value(camera, id).and_then(|v| v.parse::<i64>().ok());

    let mut properties = String::new();
    if let Some(mode) = stored_value(camera, "awb-mode")
        && mode != AWB_MODES[0]
    {
        properties.push_str(&format!(" awb-mode={}", mode));
    }
    if let Some(mode) = stored_value(camera, "exposure-mode")
        && mode != EXPOSURE_MODES[0]
    {
        properties.push_str(&format!(" ae-exposure-mode={}", mode));
    }

    let brightness = int_of("brightness").filter(|v| *v != 0);
    let contrast = int_of("contrast").filter(|v| *v != 100);
    let saturation = int_of("saturation").filter(|v| *v != 100);
    if brightness.is_none() && contrast.is_none() && saturation.is_none() {
        return (properties, None);
    }

    let mut balance = String::from("videobalance");
    if let Some(v) = brightness {
        balance.push_str(&format!(" brightness={:.2}", v as f64 / 100.0));
    }
    if let Some(v) = contrast {
        balance.push_str(&format!(" contrast={:.2}", v as f64 / 100.0));
    }
    if let Some(v) = saturation {
        balance.push_str(&format!(" saturation={:.2}", v as f64 / 100.0));
    }
    (properties, Some(balance))
}

impl CameraBackend for LibcameraBackend {
    fn backend_type(&self) -> CameraBackendType {
        CameraBackendType::Libcamera
    }

    fn is_available(&self) -> bool {
        ["cam", "libcamera-hello"].iter().any(|tool| {
            self.runner
                .run(tool, &["--version"], tools::PROBE_TIMEOUT)
                .map(|o| o.success())
                .unwrap_or(false)
        })
    }

    fn detect_cameras(&self) -> BackendResult<Vec<CameraInfo>> {
        let output = self
            .runner
            .run_checked("cam", &["--list"], tools::ENUMERATION_TIMEOUT)
            .map_err(|e| BackendError::DetectionFailed(e.to_string()))?;

        let cameras: Vec<CameraInfo> = enumeration::parse_cam_list(&output.stdout)
            .into_iter()
            .map(|listing| {
                let mut camera = CameraInfo::new(
                    format!("libcamera:{}", listing.index),
                    listing.name,
                    CameraBackendType::Libcamera,
                    listing.camera_id,
                )
                .with_capabilities(&[Capability::Video, Capability::Photo, Capability::Controls]);
                camera.formats = self.query_formats(listing.index);
                camera
                    .extra
                    .insert(INDEX_KEY.to_string(), listing.index.to_string());
                camera
            })
            .collect();

        info!(count = cameras.len(), "Found libcamera cameras");
        Ok(cameras)
    }

    fn get_controls(&self, camera: &mut CameraInfo) -> BackendResult<Vec<CameraControl>> {
        let mut controls = fixed_controls();
        for control in &mut controls {
            if let Some(stored) = stored_value(camera, &control.id)
                && let Ok(value) = ControlValue::parse_for(control.control_type, stored)
            {
                control.value = value;
            }
        }
        Ok(controls)
    }

    fn set_control(
        &self,
        camera: &mut CameraInfo,
        control_id: &str,
        value: &ControlValue,
    ) -> BackendResult<()> {
        let Some(control) = fixed_controls().into_iter().find(|c| c.id == control_id) else {
            return Err(BackendError::InvalidControl(format!(
                "libcamera has no control '{}'",
                control_id
            )));
        };

        let stored = match control.control_type {
            ControlType::Menu => {
                let choice = value.to_arg();
                if !control.choices.contains(&choice) {
                    return Err(BackendError::InvalidControl(format!(
                        "'{}' is not a valid {}",
                        choice, control.name
                    )));
                }
                choice
            }
            _ => {
                let v = value.as_int().ok_or_else(|| {
                    BackendError::InvalidControl(format!("'{}' is not an integer", value))
                })?;
                control.clamp(v).to_string()
            }
        };

        debug!(camera = %camera.id, control = control_id, value = %stored, "Storing libcamera control");
        camera
            .extra
            .insert(format!("{}{}", CONTROL_KEY_PREFIX, control_id), stored);
        Ok(())
    }

    fn source_descriptor(&self, camera: &CameraInfo, format: Option<&VideoFormat>) -> Option<String> {
        if camera.device_path.is_empty() {
            return None;
        }
        let (properties, balance) = control_fragments(camera);
        let mut descriptor = format!(
            "libcamerasrc camera-name=\"{}\"{}",
            camera.device_path.replace('"', "\\\""),
            properties
        );
        if let Some(fmt) = format {
            descriptor.push_str(&format!(
                " ! video/x-raw,width={},height={}",
                fmt.width, fmt.height
            ));
        }
        descriptor.push_str(" ! videoconvert");
        if let Some(balance) = balance {
            descriptor.push_str(" ! ");
            descriptor.push_str(&balance);
        }
        Some(descriptor)
    }

    fn can_capture_photo(&self) -> bool {
        true
    }

    fn capture_photo(&self, camera: &CameraInfo, output: &Path) -> BackendResult<()> {
        let out = output.to_string_lossy();
        // libcamera-still counts cameras from zero, cam from one
        let camera_index = camera
            .extra
            .get(INDEX_KEY)
            .and_then(|i| i.parse::<u32>().ok())
            .map(|i| i.saturating_sub(1).to_string());

        let mut args = vec!["-o", out.as_ref(), "--nopreview", "-t", "1"];
        if let Some(index) = camera_index.as_deref() {
            args.extend(["--camera", index]);
        }
        self.runner
            .run_checked("libcamera-still", &args, tools::PHOTO_TIMEOUT)?;
        written(output)
    }
}

fn written(output: &Path) -> BackendResult<()> {
    if output.is_file() {
        Ok(())
    } else {
        Err(BackendError::IoError(format!("{} was not written", output.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::process::{CommandOutput, ScriptedRunner};

    fn detected() -> (Arc<ScriptedRunner>, LibcameraBackend, CameraInfo) {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(
            "cam",
            &["--list"],
            CommandOutput::ok("Available cameras:\n1: 'imx219' (/base/soc/i2c0mux/i2c@1/imx219@10)\n"),
        );
        let backend = LibcameraBackend::new(runner.clone());
        let camera = backend.detect_cameras().unwrap().remove(0);
        (runner, backend, camera)
    }

    #[test]
    fn test_detect_cameras() {
        let (_, _, camera) = detected();
        assert_eq!(camera.id, "libcamera:1");
        assert_eq!(camera.name, "imx219");
        assert_eq!(camera.device_path, "/base/soc/i2c0mux/i2c@1/imx219@10");
        assert_eq!(camera.extra.get(INDEX_KEY).map(String::as_str), Some("1"));
        // cam -I unscripted, fallback formats used
        assert_eq!(camera.formats.len(), 3);
    }

    #[test]
    fn test_controls_reflect_stored_values() {
        let (_, backend, mut camera) = detected();
        backend
            .set_control(&mut camera, "brightness", &ControlValue::Int(250))
            .unwrap();
        backend
            .set_control(&mut camera, "awb-mode", &ControlValue::Text("daylight".into()))
            .unwrap();

        let controls = backend.get_controls(&mut camera).unwrap();
        assert_eq!(controls.len(), 5);
        let brightness = controls.iter().find(|c| c.id == "brightness").unwrap();
        assert_eq!(brightness.value, ControlValue::Int(100));
        let awb = controls.iter().find(|c| c.id == "awb-mode").unwrap();
        assert_eq!(awb.value, ControlValue::Text("daylight".into()));
    }

    #[test]
    fn test_set_control_rejects_unknown() {
        let (_, backend, mut camera) = detected();
        assert!(backend
            .set_control(&mut camera, "zoom", &ControlValue::Int(1))
            .is_err());
        assert!(backend
            .set_control(&mut camera, "awb-mode", &ControlValue::Text("sunset".into()))
            .is_err());
    }

    #[test]
    fn test_descriptor_applies_controls() {
        let (_, backend, mut camera) = detected();
        assert_eq!(
            backend.source_descriptor(&camera, None).as_deref(),
            Some("libcamerasrc camera-name=\"/base/soc/i2c0mux/i2c@1/imx219@10\" ! videoconvert")
        );

        backend
            .set_control(&mut camera, "contrast", &ControlValue::Int(150))
            .unwrap();
        backend
            .set_control(&mut camera, "exposure-mode", &ControlValue::Text("short".into()))
            .unwrap();
        let descriptor = backend.source_descriptor(&camera, None).unwrap();
        assert!(descriptor.contains("ae-exposure-mode=short"));
        assert!(descriptor.ends_with("! videoconvert ! videobalance contrast=1.50"));
    }
}
