// SPDX-License-Identifier: GPL-3.0-only
// Shared types for camera backend abstraction

//! Shared types for camera backends

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Camera backend type
///
/// One variant per device family. Dispatch always goes through this tag,
/// never through runtime type inspection of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum CameraBackendType {
    /// USB Video Class webcams via v4l2-ctl
    #[default]
    V4l2,
    /// DSLR / mirrorless cameras via gphoto2 and a streaming helper
    Gphoto2,
    /// CSI sensors behind an ISP via libcamera tools
    Libcamera,
    /// Software-routed PipeWire video sources
    PipeWire,
    /// URL-addressed network cameras (RTSP / HTTP)
    Network,
    /// Smartphone frames pushed by the phone bridge
    Phone,
}

impl CameraBackendType {
    /// All backend types in registration order
    pub const ALL: [CameraBackendType; 6] = [
        CameraBackendType::V4l2,
        CameraBackendType::Gphoto2,
        CameraBackendType::Libcamera,
        CameraBackendType::PipeWire,
        CameraBackendType::Network,
        CameraBackendType::Phone,
    ];

    /// Whether the registry runs this backend during a detection pass
    ///
    /// Network and phone cameras are registered manually.
    pub fn is_auto_detected(&self) -> bool {
        !matches!(self, CameraBackendType::Network | CameraBackendType::Phone)
    }

    /// Prefix used for camera ids produced by this backend
    pub fn id_prefix(&self) -> &'static str {
        match self {
            CameraBackendType::V4l2 => "v4l2",
            CameraBackendType::Gphoto2 => "gphoto2",
            CameraBackendType::Libcamera => "libcamera",
            CameraBackendType::PipeWire => "pipewire",
            CameraBackendType::Network => "ip",
            CameraBackendType::Phone => "phone",
        }
    }
}

impl std::fmt::Display for CameraBackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraBackendType::V4l2 => write!(f, "V4L2"),
            CameraBackendType::Gphoto2 => write!(f, "gPhoto2"),
            CameraBackendType::Libcamera => write!(f, "libcamera"),
            CameraBackendType::PipeWire => write!(f, "PipeWire"),
            CameraBackendType::Network => write!(f, "Network"),
            CameraBackendType::Phone => write!(f, "Phone"),
        }
    }
}

/// What a camera can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Photo,
    Video,
    Controls,
}

/// How frames reach the consumer once a camera is selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceKind {
    /// Descriptor is handed to the pipeline engine once; confirmation is immediate
    #[default]
    Direct,
    /// Descriptor pulls from a producer that needs warm-up time, so construction is retried
    Pull,
    /// Frames are pushed through a registered callback, no pipeline is built
    Push,
}

/// A discovered camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    /// Backend-prefixed unique id (e.g. `v4l2:/dev/video0`)
    pub id: String,
    /// Display name
    pub name: String,
    /// Backend that produced this camera
    pub backend: CameraBackendType,
    /// Backend-specific address (device node, USB port, node id, URL)
    pub device_path: String,
    pub capabilities: BTreeSet<Capability>,
    /// Supported formats, may be empty
    pub formats: Vec<VideoFormat>,
    pub is_virtual: bool,
    /// Backend-private state (negotiated ports, node ids, pending element properties)
    pub extra: BTreeMap<String, String>,
}

impl CameraInfo {
    /// Create a camera with no formats and no extra state
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        backend: CameraBackendType,
        device_path: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            backend,
            device_path: device_path.into(),
            capabilities: BTreeSet::new(),
            formats: Vec::new(),
            is_virtual: false,
            extra: BTreeMap::new(),
        }
    }

    /// Builder-style capability setter
    pub fn with_capabilities(mut self, capabilities: &[Capability]) -> Self {
        self.capabilities.extend(capabilities.iter().copied());
        self
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

impl std::fmt::Display for CameraInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}] ({})", self.name, self.backend, self.id)
    }
}

/// One supported resolution with its frame rates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    /// Frame rates supported at this resolution, in the order the device reported them
    pub fps: Vec<f64>,
    /// FourCC-like tag (e.g. "MJPG", "YUYV")
    pub pixel_format: String,
    pub description: String,
}

impl VideoFormat {
    /// Highest advertised frame rate, 0 when none were reported
    pub fn max_fps(&self) -> f64 {
        self.fps.iter().copied().fold(0.0, f64::max)
    }

    /// Total pixel count
    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Motion-JPEG frames need a decoder element after the source
    pub fn is_mjpeg(&self) -> bool {
        self.pixel_format.eq_ignore_ascii_case("MJPG")
    }

    /// Caps fragment for the pipeline engine (e.g. `image/jpeg,width=1280,height=720,framerate=30/1 ! jpegdec`)
    pub fn caps_fragment(&self) -> String {
        let media = if self.is_mjpeg() { "image/jpeg" } else { "video/x-raw" };
        let mut caps = format!("{},width={},height={}", media, self.width, self.height);
        if !self.fps.is_empty() {
            caps.push_str(&format!(",framerate={}/1", self.max_fps() as u32));
        }
        if self.is_mjpeg() {
            caps.push_str(" ! jpegdec");
        }
        caps
    }
}

impl std::fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.fps.is_empty() {
            write!(f, "{}x{} {}", self.width, self.height, self.pixel_format)
        } else {
            write!(
                f,
                "{}x{} @ {}fps {}",
                self.width,
                self.height,
                self.max_fps() as u32,
                self.pixel_format
            )
        }
    }
}

/// Grouping used when presenting controls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ControlCategory {
    Image,
    Exposure,
    Focus,
    WhiteBalance,
    Capture,
    Status,
    #[default]
    Advanced,
}

impl std::fmt::Display for ControlCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlCategory::Image => write!(f, "Image"),
            ControlCategory::Exposure => write!(f, "Exposure"),
            ControlCategory::Focus => write!(f, "Focus"),
            ControlCategory::WhiteBalance => write!(f, "White Balance"),
            ControlCategory::Capture => write!(f, "Capture"),
            ControlCategory::Status => write!(f, "Status"),
            ControlCategory::Advanced => write!(f, "Advanced"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlType {
    Integer,
    Boolean,
    Menu,
    Button,
    String,
}

/// Value of a control as reported by, or sent to, a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl ControlValue {
    /// Parse user input according to the control's type
    ///
    /// Booleans accept `1/0`, `true/false`, `on/off`, `yes/no`.
    pub fn parse_for(control_type: ControlType, input: &str) -> BackendResult<Self> {
        let trimmed = input.trim();
        match control_type {
            ControlType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => Ok(ControlValue::Bool(true)),
                "0" | "false" | "off" | "no" => Ok(ControlValue::Bool(false)),
                _ => Err(BackendError::InvalidControl(format!(
                    "'{}' is not a boolean",
                    input
                ))),
            },
            ControlType::Integer | ControlType::Button => trimmed
                .parse::<i64>()
                .map(ControlValue::Int)
                .map_err(|_| BackendError::InvalidControl(format!("'{}' is not an integer", input))),
            ControlType::Menu => Ok(trimmed
                .parse::<i64>()
                .map(ControlValue::Int)
                .unwrap_or_else(|_| ControlValue::Text(trimmed.to_string()))),
            ControlType::String => Ok(ControlValue::Text(input.to_string())),
        }
    }

    /// Integer view of the value, if it has one
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ControlValue::Int(v) => Some(*v),
            ControlValue::Bool(b) => Some(i64::from(*b)),
            ControlValue::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Representation passed on a tool's command line (`name=<arg>`)
    pub fn to_arg(&self) -> String {
        match self {
            ControlValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            ControlValue::Int(v) => v.to_string(),
            ControlValue::Text(s) => s.clone(),
        }
    }
}

impl std::fmt::Display for ControlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlValue::Bool(b) => write!(f, "{}", b),
            ControlValue::Int(v) => write!(f, "{}", v),
            ControlValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// One adjustable or readable device parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraControl {
    /// Backend identifier (v4l2 control name, gphoto2 config path)
    pub id: String,
    /// Human readable label
    pub name: String,
    pub category: ControlCategory,
    pub control_type: ControlType,
    pub value: ControlValue,
    pub default: ControlValue,
    pub minimum: Option<i64>,
    pub maximum: Option<i64>,
    pub step: Option<i64>,
    /// Menu entries in device order
    pub choices: Vec<String>,
    /// Raw flags token (e.g. "inactive", "read-only")
    pub flags: String,
}

impl CameraControl {
    pub fn is_read_only(&self) -> bool {
        self.flags.contains("read-only") || self.flags.contains("readonly")
    }

    pub fn is_inactive(&self) -> bool {
        self.flags.contains("inactive")
    }

    /// Clamp an integer value into `[minimum, maximum]` when both are known
    pub fn clamp(&self, value: i64) -> i64 {
        match (self.minimum, self.maximum) {
            (Some(min), Some(max)) if min <= max => value.clamp(min, max),
            _ => value,
        }
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Error types for backend operations
#[derive(Debug, Clone, PartialEq)]
pub enum BackendError {
    /// Backend is not available on this system
    NotAvailable(String),
    /// A driver's enumeration failed
    DetectionFailed(String),
    /// Camera device not found
    DeviceNotFound(String),
    /// Another process holds the device
    DeviceBusy {
        device: String,
        holders: Vec<String>,
    },
    /// External tool exited unsuccessfully
    CommandFailed {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
    /// External tool exceeded its timeout
    Timeout { program: String, seconds: u64 },
    /// Streaming helper process did not report success
    HelperStartFailed(String),
    /// Media pipeline refused the source descriptor
    PipelineFailed(String),
    /// Pipeline construction retries ran out
    RetryExhausted { attempts: u32 },
    /// Network URL rejected before reaching a descriptor
    InvalidUrl(String),
    /// Control id or value not accepted
    InvalidControl(String),
    /// General I/O error
    IoError(String),
    /// Other errors
    Other(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::NotAvailable(msg) => write!(f, "Backend not available: {}", msg),
            BackendError::DetectionFailed(msg) => write!(f, "Detection failed: {}", msg),
            BackendError::DeviceNotFound(msg) => write!(f, "Device not found: {}", msg),
            BackendError::DeviceBusy { device, holders } => {
                if holders.is_empty() {
                    write!(f, "{} is being used by another application", device)
                } else {
                    write!(f, "Camera in use by: {}", holders.join(", "))
                }
            }
            BackendError::CommandFailed {
                program,
                status,
                stderr,
            } => match status {
                Some(code) => write!(f, "{} exited with status {}: {}", program, code, stderr.trim()),
                None => write!(f, "{} was terminated: {}", program, stderr.trim()),
            },
            BackendError::Timeout { program, seconds } => {
                write!(f, "{} timed out after {}s", program, seconds)
            }
            BackendError::HelperStartFailed(msg) => {
                write!(f, "Failed to start camera streaming process: {}", msg)
            }
            BackendError::PipelineFailed(msg) => write!(f, "Failed to start camera stream: {}", msg),
            BackendError::RetryExhausted { attempts } => write!(
                f,
                "Could not connect to camera stream after {} attempts",
                attempts
            ),
            BackendError::InvalidUrl(msg) => write!(f, "Invalid camera URL: {}", msg),
            BackendError::InvalidControl(msg) => write!(f, "Invalid control: {}", msg),
            BackendError::IoError(msg) => write!(f, "I/O error: {}", msg),
            BackendError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::IoError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(pixel_format: &str, width: u32, height: u32, fps: &[f64]) -> VideoFormat {
        VideoFormat {
            width,
            height,
            fps: fps.to_vec(),
            pixel_format: pixel_format.to_string(),
            description: String::new(),
        }
    }

    #[test]
    fn test_auto_detected_backends() {
        assert!(CameraBackendType::V4l2.is_auto_detected());
        assert!(CameraBackendType::Gphoto2.is_auto_detected());
        assert!(!CameraBackendType::Network.is_auto_detected());
        assert!(!CameraBackendType::Phone.is_auto_detected());
    }

    #[test]
    fn test_caps_fragment_mjpeg() {
        let fmt = format("MJPG", 1280, 720, &[15.0, 30.0]);
        assert_eq!(
            fmt.caps_fragment(),
            "image/jpeg,width=1280,height=720,framerate=30/1 ! jpegdec"
        );
    }

    #[test]
    fn test_caps_fragment_raw_without_fps() {
        let fmt = format("YUYV", 640, 480, &[]);
        assert_eq!(fmt.caps_fragment(), "video/x-raw,width=640,height=480");
    }

    #[test]
    fn test_control_value_parsing() {
        assert_eq!(
            ControlValue::parse_for(ControlType::Boolean, "on").unwrap(),
            ControlValue::Bool(true)
        );
        assert_eq!(
            ControlValue::parse_for(ControlType::Integer, " -5 ").unwrap(),
            ControlValue::Int(-5)
        );
        assert_eq!(
            ControlValue::parse_for(ControlType::Menu, "Auto").unwrap(),
            ControlValue::Text("Auto".to_string())
        );
        assert!(ControlValue::parse_for(ControlType::Integer, "abc").is_err());
    }

    #[test]
    fn test_control_value_arg() {
        assert_eq!(ControlValue::Bool(true).to_arg(), "1");
        assert_eq!(ControlValue::Int(42).to_arg(), "42");
        assert_eq!(ControlValue::Text("1/125".into()).to_arg(), "1/125");
    }

    #[test]
    fn test_busy_error_names_holders() {
        let err = BackendError::DeviceBusy {
            device: "/dev/video0".into(),
            holders: vec!["obs".into(), "zoom".into()],
        };
        assert_eq!(err.to_string(), "Camera in use by: obs, zoom");
    }
}
