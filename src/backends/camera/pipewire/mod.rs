// SPDX-License-Identifier: GPL-3.0-only

//! PipeWire virtual node backend
//!
//! Lists software-routed video sources (screen casts, other applications'
//! virtual cameras) that PipeWire exposes as nodes. No controls.

pub mod dump;
pub mod enumeration;

use super::process::CommandRunner;
use super::types::*;
use super::CameraBackend;
use crate::constants::tools;
use enumeration::{PwVideoNode, video_nodes_from_dump, video_nodes_from_pw_cli};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Key in `CameraInfo::extra` holding the PipeWire node id
pub const NODE_ID_KEY: &str = "node_id";

/// Driver for PipeWire video source nodes
pub struct PipeWireBackend {
    runner: Arc<dyn CommandRunner>,
}

impl PipeWireBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn enumerate_nodes(&self) -> BackendResult<Vec<PwVideoNode>> {
        match self.runner.run("pw-dump", &[], tools::ENUMERATION_TIMEOUT) {
            Ok(output) if output.success() => {
                let objects = dump::parse_dump(&output.stdout)?;
                return Ok(video_nodes_from_dump(&objects));
            }
            Ok(output) => debug!(status = ?output.status, "pw-dump failed, trying pw-cli"),
            Err(e) => debug!(error = %e, "pw-dump unavailable, trying pw-cli"),
        }

        let output = self
            .runner
            .run_checked("pw-cli", &["list-objects"], tools::ENUMERATION_TIMEOUT)
            .map_err(|e| BackendError::DetectionFailed(e.to_string()))?;
        Ok(video_nodes_from_pw_cli(&output.stdout))
    }

    fn node_id(camera: &CameraInfo) -> &str {
        camera
            .extra
            .get(NODE_ID_KEY)
            .map(String::as_str)
            .unwrap_or(&camera.device_path)
    }
}

impl CameraBackend for PipeWireBackend {
    fn backend_type(&self) -> CameraBackendType {
        CameraBackendType::PipeWire
    }

    fn is_available(&self) -> bool {
        ["pw-dump", "pw-cli"].iter().any(|tool| {
            self.runner
                .run(tool, &["--version"], tools::PROBE_TIMEOUT)
                .map(|o| o.success())
                .unwrap_or(false)
        })
    }

    fn detect_cameras(&self) -> BackendResult<Vec<CameraInfo>> {
        let cameras: Vec<CameraInfo> = self
            .enumerate_nodes()?
            .into_iter()
            .map(|node| {
                let id = node.id.to_string();
                let mut camera = CameraInfo::new(
                    format!("pipewire:{}", id),
                    node.name.clone(),
                    CameraBackendType::PipeWire,
                    id.clone(),
                )
                .with_capabilities(&[Capability::Video, Capability::Photo]);
                camera.is_virtual = node.is_virtual();
                camera.extra.insert(NODE_ID_KEY.to_string(), id);
                camera
            })
            .collect();

        info!(count = cameras.len(), "Found PipeWire video nodes");
        Ok(cameras)
    }

    fn get_controls(&self, _camera: &mut CameraInfo) -> BackendResult<Vec<CameraControl>> {
        Ok(Vec::new())
    }

    fn set_control(
        &self,
        _camera: &mut CameraInfo,
        control_id: &str,
        _value: &ControlValue,
    ) -> BackendResult<()> {
        Err(BackendError::InvalidControl(format!(
            "PipeWire nodes have no control '{}'",
            control_id
        )))
    }

    fn source_descriptor(&self, camera: &CameraInfo, _format: Option<&VideoFormat>) -> Option<String> {
        Some(format!("pipewiresrc path={} ! videoconvert", Self::node_id(camera)))
    }

    fn can_capture_photo(&self) -> bool {
        true
    }

    fn capture_photo(&self, camera: &CameraInfo, output: &Path) -> BackendResult<()> {
        let path_arg = format!("path={}", Self::node_id(camera));
        let location = format!("location={}", output.display());
        self.runner.run_checked(
            "gst-launch-1.0",
            &[
                "-e",
                "pipewiresrc",
                &path_arg,
                "num-buffers=1",
                "!",
                "videoconvert",
                "!",
                "jpegenc",
                "!",
                "filesink",
                &location,
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
    use crate::backends::camera::process::{CommandOutput, ScriptedRunner};

    #[test]
    fn test_detect_from_dump() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(
            "pw-dump",
            &[],
            CommandOutput::ok(
                r#"[{"id": 77, "type": "PipeWire:Interface:Node", "info": {"props": {
                    "media.class": "Video/Source/Virtual", "node.description": "OBS Virtual Camera"}}}]"#,
            ),
        );
        let backend = PipeWireBackend::new(runner);
        let cameras = backend.detect_cameras().unwrap();

        assert_eq!(cameras.len(), 1);
        assert_eq!(cameras[0].id, "pipewire:77");
        assert!(cameras[0].is_virtual);
        assert_eq!(
            backend.source_descriptor(&cameras[0], None).as_deref(),
            Some("pipewiresrc path=77 ! videoconvert")
        );
    }

    #[test]
    fn test_detect_falls_back_to_pw_cli() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .respond_err("pw-dump", &[], BackendError::NotAvailable("pw-dump".into()))
            .respond(
                "pw-cli",
                &["list-objects"],
                CommandOutput::ok(
                    "id 12, type PipeWire:Interface:Node/3\n  media.class = \"Video/Source\"\n  node.nick = \"Cam\"\n",
                ),
            );
        let cameras = PipeWireBackend::new(runner).detect_cameras().unwrap();
        assert_eq!(cameras.len(), 1);
        assert_eq!(cameras[0].name, "Cam");
    }

    #[test]
    fn test_detect_reports_failure_when_both_tools_fail() {
        let runner = Arc::new(ScriptedRunner::new());
        let result = PipeWireBackend::new(runner).detect_cameras();
        assert!(matches!(result, Err(BackendError::DetectionFailed(_))));
    }
}
