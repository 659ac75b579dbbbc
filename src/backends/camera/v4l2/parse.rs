// SPDX-License-Identifier: GPL-3.0-only

//! Parsers for `v4l2-ctl` text output

use super::super::types::*;

/// A device block from `v4l2-ctl --list-devices`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBlock {
    /// Card name with the bus suffix removed
    pub name: String,
    /// Raw header line
    pub header: String,
    /// `/dev/video*` nodes in listed order
    pub video_nodes: Vec<String>,
}

impl DeviceBlock {
    /// First video node, used as the capture node
    pub fn primary_node(&self) -> Option<&str> {
        self.video_nodes.first().map(String::as_str)
    }

    /// v4l2loopback devices and their proxies are outputs, not cameras
    pub fn is_loopback(&self) -> bool {
        let lower = self.header.to_lowercase();
        lower.contains("loopback") || lower.contains("(v4l2)")
    }
}

/// Split `v4l2-ctl --list-devices` output into device blocks
///
/// ```text
/// HD Webcam: HD Webcam (usb-0000:00:14.0-6):
///         /dev/video0
///         /dev/video1
///         /dev/media0
/// ```
pub fn parse_device_list(output: &str) -> Vec<DeviceBlock> {
    let mut blocks: Vec<DeviceBlock> = Vec::new();

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with(char::is_whitespace) {
            let header = line.trim().trim_end_matches(':').to_string();
            // "Card: Card (bus-info)" names the card twice
            let card = header.split('(').next().unwrap_or(&header).trim();
            let name = card
                .split(": ")
                .next()
                .unwrap_or(card)
                .trim()
                .trim_end_matches(':')
                .to_string();
            blocks.push(DeviceBlock {
                name,
                header,
                video_nodes: Vec::new(),
            });
            continue;
        }
        let node = line.trim();
        if node.starts_with("/dev/video")
            && let Some(block) = blocks.last_mut()
        {
            block.video_nodes.push(node.to_string());
        }
    }

    blocks.retain(|b| !b.video_nodes.is_empty());
    blocks
}

/// One classified line of `--list-formats-ext` output
#[derive(Debug, Clone, PartialEq)]
enum FormatLine {
    /// `[0]: 'MJPG' (Motion-JPEG, compressed)`
    PixelFormat { fourcc: String, description: String },
    /// `Size: Discrete 1920x1080`
    Size { width: u32, height: u32 },
    /// `Interval: Discrete 0.033s (30.000 fps)`
    Interval { fps: f64 },
}

fn classify_format_line(line: &str) -> Option<FormatLine> {
    let trimmed = line.trim();

    if let Some(rest) = trimmed.strip_prefix('[')
        && let Some((index, rest)) = rest.split_once("]:")
        && index.chars().all(|c| c.is_ascii_digit())
    {
        let rest = rest.trim();
        let rest = rest.strip_prefix('\'')?;
        let (fourcc, rest) = rest.split_once('\'')?;
        let open = rest.find('(')?;
        let close = rest.rfind(')')?;
        if close <= open {
            return None;
        }
        return Some(FormatLine::PixelFormat {
            fourcc: fourcc.to_string(),
            description: rest[open + 1..close].trim().to_string(),
        });
    }

    if let Some(rest) = trimmed.strip_prefix("Size:") {
        // "Discrete 1920x1080" or "Stepwise 16x16 - 1920x1080 ..."
        let dims = rest.split_whitespace().nth(1)?;
        let (w, h) = dims.split_once('x')?;
        return Some(FormatLine::Size {
            width: w.parse().ok()?,
            height: h.parse().ok()?,
        });
    }

    if trimmed.starts_with("Interval:") {
        let open = trimmed.rfind('(')?;
        let inner = trimmed[open + 1..].strip_suffix(')')?;
        let fps = inner.trim().strip_suffix("fps")?.trim();
        return Some(FormatLine::Interval {
            fps: fps.parse().ok()?,
        });
    }

    None
}

/// Parse `v4l2-ctl --list-formats-ext`
///
/// First pass classifies the raw lines. Second pass stitches
/// format → size → interval runs into complete records; a new format or size
/// line flushes the pending record when it has collected frame rates.
pub fn parse_formats(output: &str) -> Vec<VideoFormat> {
    let lines: Vec<FormatLine> = output.lines().filter_map(classify_format_line).collect();

    let mut formats = Vec::new();
    let mut fourcc = String::new();
    let mut description = String::new();
    let mut size: Option<(u32, u32)> = None;
    let mut fps: Vec<f64> = Vec::new();

    let flush = |formats: &mut Vec<VideoFormat>,
                 fourcc: &str,
                 description: &str,
                 size: Option<(u32, u32)>,
                 fps: &mut Vec<f64>| {
        if let Some((width, height)) = size
            && !fourcc.is_empty()
            && !fps.is_empty()
        {
            formats.push(VideoFormat {
                width,
                height,
                fps: std::mem::take(fps),
                pixel_format: fourcc.to_string(),
                description: description.to_string(),
            });
        }
        fps.clear();
    };

    for line in lines {
        match line {
            FormatLine::PixelFormat {
                fourcc: next_fourcc,
                description: next_description,
            } => {
                flush(&mut formats, &fourcc, &description, size, &mut fps);
                fourcc = next_fourcc;
                description = next_description;
                size = None;
            }
            FormatLine::Size { width, height } => {
                flush(&mut formats, &fourcc, &description, size, &mut fps);
                size = Some((width, height));
            }
            FormatLine::Interval { fps: rate } => {
                if size.is_some() {
                    fps.push(rate);
                }
            }
        }
    }
    flush(&mut formats, &fourcc, &description, size, &mut fps);

    formats
}

/// Human-friendly labels for common V4L2 control ids
fn control_label(id: &str) -> String {
    let label = match id {
        "brightness" => "Brightness",
        "contrast" => "Contrast",
        "saturation" => "Saturation",
        "hue" => "Hue",
        "sharpness" => "Sharpness",
        "gamma" => "Gamma",
        "white_balance_automatic" => "Auto White Balance",
        "white_balance_temperature" => "White Balance Temperature",
        "white_balance_auto_preset" => "WB Preset",
        "gain" => "Gain",
        "exposure_auto" | "auto_exposure" => "Auto Exposure",
        "exposure_absolute" | "exposure_time_absolute" => "Exposure Time",
        "exposure_auto_priority" | "exposure_dynamic_framerate" => "Exposure Auto Priority",
        "auto_exposure_bias" => "Exposure Bias",
        "focus_auto" | "focus_automatic_continuous" => "Auto Focus",
        "focus_absolute" => "Focus Distance",
        "zoom_absolute" => "Zoom",
        "pan_absolute" => "Pan",
        "tilt_absolute" => "Tilt",
        "backlight_compensation" => "Backlight Compensation",
        "power_line_frequency" => "Power Line Frequency",
        "image_stabilization" => "Image Stabilization",
        "iso_sensitivity" => "ISO Sensitivity",
        "iso_sensitivity_auto" => "Auto ISO",
        "scene_mode" => "Scene Mode",
        "3a_lock" => "3A Lock",
        "led1_mode" => "LED Mode",
        "led1_frequency" => "LED Frequency",
        _ => return title_case(id),
    };
    label.to_string()
}

fn title_case(id: &str) -> String {
    id.split('_')
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Category for a V4L2 control id
pub fn control_category(id: &str) -> ControlCategory {
    match id {
        "brightness" | "contrast" | "saturation" | "hue" | "sharpness" => ControlCategory::Image,
        "white_balance_automatic"
        | "white_balance_temperature"
        | "white_balance_auto_preset" => ControlCategory::WhiteBalance,
        "gain"
        | "exposure_auto"
        | "auto_exposure"
        | "exposure_absolute"
        | "exposure_time_absolute"
        | "exposure_auto_priority"
        | "exposure_dynamic_framerate"
        | "auto_exposure_bias"
        | "backlight_compensation"
        | "iso_sensitivity"
        | "iso_sensitivity_auto" => ControlCategory::Exposure,
        "focus_auto" | "focus_automatic_continuous" | "focus_absolute" | "zoom_absolute" => {
            ControlCategory::Focus
        }
        _ => ControlCategory::Advanced,
    }
}

/// Parse `v4l2-ctl --list-ctrls-menus`
///
/// ```text
///                      brightness 0x00980900 (int)    : min=0 max=255 step=1 default=128 value=128
///            power_line_frequency 0x00980918 (menu)   : min=0 max=2 default=2 value=2
///                                 0: Disabled
///                                 1: 50 Hz
/// ```
///
/// Menu entry lines attach to the most recently seen control.
pub fn parse_controls(output: &str) -> Vec<CameraControl> {
    let mut controls: Vec<CameraControl> = Vec::new();

    for line in output.lines() {
        if let Some(control) = parse_control_line(line) {
            controls.push(control);
            continue;
        }

        if let Some(label) = parse_menu_entry(line)
            && let Some(last) = controls.last_mut()
            && last.control_type == ControlType::Menu
        {
            last.choices.push(label);
        }
    }

    controls
}

fn parse_control_line(line: &str) -> Option<CameraControl> {
    let (head, params) = line.split_once(':')?;
    let mut tokens = head.split_whitespace();
    let id = tokens.next()?;
    let hex = tokens.next()?;
    let kind = tokens.next()?;
    if !hex.starts_with("0x") || !kind.starts_with('(') || !kind.ends_with(')') {
        return None;
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }

    let kind = &kind[1..kind.len() - 1];
    let control_type = match kind {
        "bool" => ControlType::Boolean,
        "menu" | "intmenu" => ControlType::Menu,
        "button" => ControlType::Button,
        "str" => ControlType::String,
        _ => ControlType::Integer,
    };

    let mut value = 0i64;
    let mut default = 0i64;
    let mut minimum = None;
    let mut maximum = None;
    let mut step = None;
    let mut flags = String::new();

    for token in params.split_whitespace() {
        let Some((key, raw)) = token.split_once('=') else {
            continue;
        };
        if key == "flags" {
            flags = raw.to_string();
            continue;
        }
        let Ok(number) = raw.parse::<i64>() else {
            continue;
        };
        match key {
            "value" => value = number,
            "default" => default = number,
            "min" => minimum = Some(number),
            "max" => maximum = Some(number),
            "step" => step = Some(number),
            _ => {}
        }
    }

    let wrap = |v: i64| match control_type {
        ControlType::Boolean => ControlValue::Bool(v != 0),
        _ => ControlValue::Int(v),
    };

    Some(CameraControl {
        id: id.to_string(),
        name: control_label(id),
        category: control_category(id),
        control_type,
        value: wrap(value),
        default: wrap(default),
        minimum,
        maximum,
        step: step.or(Some(1)),
        choices: Vec::new(),
        flags,
    })
}

fn parse_menu_entry(line: &str) -> Option<String> {
    if !line.starts_with(char::is_whitespace) {
        return None;
    }
    let (index, label) = line.trim().split_once(':')?;
    if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let label = label.trim();
    if label.is_empty() { None } else { Some(label.to_string()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICES: &str = "\
HD Webcam: HD Webcam (usb-0000:00:14.0-6):
\t/dev/video0
\t/dev/video1
\t/dev/media0

Dummy video device (0x0000) (platform:v4l2loopback-000):
\t/dev/video10

bcm2835-codec-decode (platform:bcm2835-codec):
\t/dev/media2
";

    const FORMATS: &str = "\
ioctl: VIDIOC_ENUM_FMT
\tType: Video Capture

\t[0]: 'MJPG' (Motion-JPEG, compressed)
\t\tSize: Discrete 1920x1080
\t\t\tInterval: Discrete 0.033s (30.000 fps)
\t\t\tInterval: Discrete 0.067s (15.000 fps)
\t\tSize: Discrete 1280x720
\t\t\tInterval: Discrete 0.017s (60.000 fps)
\t[1]: 'YUYV' (YUYV 4:2:2)
\t\tSize: Discrete 640x480
\t\t\tInterval: Discrete 0.033s (30.000 fps)
\t\tSize: Discrete 320x240
";

    const CONTROLS: &str = "
User Controls

                     brightness 0x00980900 (int)    : min=-64 max=64 step=1 default=0 value=10
        white_balance_automatic 0x0098090c (bool)   : default=1 value=0
           power_line_frequency 0x00980918 (menu)   : min=0 max=2 default=1 value=2
\t\t\t\t0: Disabled
\t\t\t\t1: 50 Hz
\t\t\t\t2: 60 Hz
      white_balance_temperature 0x0098091a (int)    : min=2800 max=6500 step=10 default=4600 value=4600 flags=inactive

Camera Controls

                  auto_exposure 0x009a0901 (menu)   : min=0 max=3 default=3 value=3
\t\t\t\t1: Manual Mode
\t\t\t\t3: Aperture Priority Mode
";

    #[test]
    fn test_parse_device_list() {
        let blocks = parse_device_list(DEVICES);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].name, "HD Webcam");
        assert_eq!(blocks[0].header, "HD Webcam: HD Webcam (usb-0000:00:14.0-6)");
        assert_eq!(blocks[1].name, "Dummy video device");
        assert_eq!(blocks[0].primary_node(), Some("/dev/video0"));
        assert!(!blocks[0].is_loopback());
        assert!(blocks[1].is_loopback());
    }

    #[test]
    fn test_parse_formats_stitches_blocks() {
        let formats = parse_formats(FORMATS);
        assert_eq!(formats.len(), 3, "320x240 has no intervals and is dropped");

        assert_eq!(formats[0].pixel_format, "MJPG");
        assert_eq!(formats[0].description, "Motion-JPEG, compressed");
        assert_eq!((formats[0].width, formats[0].height), (1920, 1080));
        assert_eq!(formats[0].fps, vec![30.0, 15.0]);

        assert_eq!((formats[1].width, formats[1].height), (1280, 720));
        assert_eq!(formats[1].fps, vec![60.0]);

        assert_eq!(formats[2].pixel_format, "YUYV");
        assert_eq!(formats[2].description, "YUYV 4:2:2");
    }

    #[test]
    fn test_parse_controls() {
        let controls = parse_controls(CONTROLS);
        assert_eq!(controls.len(), 5);

        let brightness = &controls[0];
        assert_eq!(brightness.name, "Brightness");
        assert_eq!(brightness.category, ControlCategory::Image);
        assert_eq!(brightness.value, ControlValue::Int(10));
        assert_eq!(brightness.minimum, Some(-64));

        assert_eq!(controls[1].control_type, ControlType::Boolean);
        assert_eq!(controls[1].default, ControlValue::Bool(true));

        let plf = &controls[2];
        assert_eq!(plf.control_type, ControlType::Menu);
        assert_eq!(plf.choices, vec!["Disabled", "50 Hz", "60 Hz"]);

        assert!(controls[3].is_inactive());
        assert_eq!(controls[3].category, ControlCategory::WhiteBalance);

        assert_eq!(controls[4].choices.len(), 2);
        assert_eq!(controls[4].category, ControlCategory::Exposure);
    }

    #[test]
    fn test_unknown_control_label_is_title_cased() {
        assert_eq!(control_label("led1_mode"), "LED Mode");
        assert_eq!(control_label("rotate_flip"), "Rotate Flip");
    }
}
