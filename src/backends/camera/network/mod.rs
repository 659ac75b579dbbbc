// SPDX-License-Identifier: GPL-3.0-only

//! Network camera backend (RTSP and HTTP streams)
//!
//! Network cameras are never discovered; they are built from user supplied
//! `(name, url)` entries. URLs are checked against a scheme allow-list before
//! a camera is created and every value placed into a pipeline description is
//! escaped, so a URL can never smuggle extra pipeline elements in.

use super::process::CommandRunner;
use super::types::*;
use super::CameraBackend;
use crate::constants::{network, tools};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Key in `CameraInfo::extra` holding the stream URL
pub const URL_KEY: &str = "url";

/// A user-configured network camera as persisted in settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCameraEntry {
    #[serde(default)]
    pub name: String,
    pub url: String,
}

impl NetworkCameraEntry {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// Check a stream URL against the scheme allow-list
///
/// # Returns
/// * `Ok(url)` - The trimmed URL
/// * `Err(BackendError::InvalidUrl)` - Unsupported scheme, missing host or control characters
pub fn validate_url(url: &str) -> BackendResult<String> {
    let url = url.trim();
    let Some((scheme, rest)) = url.split_once("://") else {
        return Err(BackendError::InvalidUrl(format!("'{}' has no scheme", url)));
    };

    let scheme = scheme.to_ascii_lowercase();
    if !network::ALLOWED_SCHEMES.contains(&scheme.as_str()) {
        return Err(BackendError::InvalidUrl(format!(
            "unsupported scheme '{}' (allowed: {})",
            scheme,
            network::ALLOWED_SCHEMES.join(", ")
        )));
    }

    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = host.rsplit('@').next().unwrap_or_default();
    if host.is_empty() {
        return Err(BackendError::InvalidUrl(format!("'{}' has no host", url)));
    }
    if url.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(BackendError::InvalidUrl(format!(
            "'{}' contains whitespace or control characters",
            url
        )));
    }

    Ok(url.to_string())
}

/// Escape a value for a double-quoted pipeline description string
pub fn escape_descriptor_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn is_rtsp(url: &str) -> bool {
    url.get(..4)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("rtsp"))
}

/// Build the registry entry for a network camera
pub fn camera_from_entry(entry: &NetworkCameraEntry) -> BackendResult<CameraInfo> {
    let url = validate_url(&entry.url)?;
    let name = match entry.name.trim() {
        "" => url.clone(),
        name => name.to_string(),
    };
    let mut camera = CameraInfo::new(
        format!("ip:{}", url),
        name,
        CameraBackendType::Network,
        url.clone(),
    )
    .with_capabilities(&[Capability::Video, Capability::Photo]);
    camera.extra.insert(URL_KEY.to_string(), url);
    Ok(camera)
}

/// Driver for URL-addressed cameras
pub struct NetworkBackend {
    runner: Arc<dyn CommandRunner>,
}

impl NetworkBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Validated URL of a camera; a camera that fails validation is never streamed
    fn url_of(camera: &CameraInfo) -> BackendResult<String> {
        let url = camera
            .extra
            .get(URL_KEY)
            .map(String::as_str)
            .unwrap_or(&camera.device_path);
        validate_url(url)
    }
}

impl CameraBackend for NetworkBackend {
    fn backend_type(&self) -> CameraBackendType {
        CameraBackendType::Network
    }

    /// Streams are decoded by the pipeline engine, nothing to probe
    fn is_available(&self) -> bool {
        true
    }

    fn detect_cameras(&self) -> BackendResult<Vec<CameraInfo>> {
        Ok(Vec::new())
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
            "network cameras have no control '{}'",
            control_id
        )))
    }

    fn source_descriptor(&self, camera: &CameraInfo, _format: Option<&VideoFormat>) -> Option<String> {
        let url = match Self::url_of(camera) {
            Ok(url) => url,
            Err(e) => {
                warn!(camera = %camera.id, error = %e, "Refusing to stream network camera");
                return None;
            }
        };
        let quoted = escape_descriptor_value(&url);
        Some(if is_rtsp(&url) {
            format!(
                "rtspsrc location=\"{}\" latency={} ! decodebin ! videoconvert",
                quoted,
                network::RTSP_LATENCY_MS
            )
        } else {
            format!("souphttpsrc location=\"{}\" ! decodebin ! videoconvert", quoted)
        })
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::Pull
    }

    fn can_capture_photo(&self) -> bool {
        true
    }

    fn capture_photo(&self, camera: &CameraInfo, output: &Path) -> BackendResult<()> {
        let url = Self::url_of(camera)?;
        let location = format!("location={}", url);
        let latency = format!("latency={}", network::RTSP_LATENCY_MS);
        let sink_location = format!("location={}", output.display());

        let mut args: Vec<&str> = vec!["-e"];
        if is_rtsp(&url) {
            args.extend(["rtspsrc", &location, &latency]);
        } else {
            args.extend(["souphttpsrc", &location]);
        }
        args.extend([
            "!",
            "decodebin",
            "!",
            "videoconvert",
            "!",
            "jpegenc",
            "snapshot=true",
            "!",
            "filesink",
            &sink_location,
        ]);

        debug!(camera = %camera.id, "Capturing network snapshot");
        self.runner
            .run_checked("gst-launch-1.0", &args, tools::SNAPSHOT_TIMEOUT)?;
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
    use crate::backends::camera::process::ScriptedRunner;

    #[test]
    fn test_validate_url_allow_list() {
        assert!(validate_url("rtsp://192.168.1.20:554/stream1").is_ok());
        assert!(validate_url("RTSPS://cam.local/live").is_ok());
        assert!(validate_url("http://user:pw@10.0.0.3/video.mjpg").is_ok());
        assert!(validate_url("  https://cam.example/feed  ").is_ok());

        for bad in [
            "javascript:alert(1)",
            "file:///dev/video0",
            "ftp://host/stream",
            "rtsp://",
            "rtsp:///path",
            "rtsp://host/a b",
            "",
        ] {
            assert!(
                matches!(validate_url(bad), Err(BackendError::InvalidUrl(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_escape_descriptor_value() {
        assert_eq!(escape_descriptor_value(r#"a"b\c"#), r#"a\"b\\c"#);
    }

    #[test]
    fn test_camera_from_entry() {
        let camera = camera_from_entry(&NetworkCameraEntry::new("", "rtsp://cam/1")).unwrap();
        assert_eq!(camera.id, "ip:rtsp://cam/1");
        assert_eq!(camera.name, "rtsp://cam/1");
        assert_eq!(camera.backend, CameraBackendType::Network);
    }

    #[test]
    fn test_descriptors() {
        let backend = NetworkBackend::new(Arc::new(ScriptedRunner::new()));
        let rtsp = camera_from_entry(&NetworkCameraEntry::new("Door", "rtsp://cam/1")).unwrap();
        assert_eq!(
            backend.source_descriptor(&rtsp, None).as_deref(),
            Some("rtspsrc location=\"rtsp://cam/1\" latency=300 ! decodebin ! videoconvert")
        );

        let http = camera_from_entry(&NetworkCameraEntry::new("Yard", "http://cam/x?a=\"1\"")).unwrap();
        assert_eq!(
            backend.source_descriptor(&http, None).as_deref(),
            Some("souphttpsrc location=\"http://cam/x?a=\\\"1\\\"\" ! decodebin ! videoconvert")
        );
    }

    #[test]
    fn test_descriptor_refuses_tampered_camera() {
        let backend = NetworkBackend::new(Arc::new(ScriptedRunner::new()));
        let mut camera = camera_from_entry(&NetworkCameraEntry::new("Door", "rtsp://cam/1")).unwrap();
        camera
            .extra
            .insert(URL_KEY.to_string(), "javascript:alert(1)".to_string());
        assert_eq!(backend.source_descriptor(&camera, None), None);
    }
}
