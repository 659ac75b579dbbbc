// SPDX-License-Identifier: GPL-3.0-only

//! gphoto2 text output parsing
//!
//! Covers `--auto-detect` tables, `--list-all-config` path lists and the
//! `--get-config` property blocks (single or concatenated).

use super::super::types::{CameraControl, ControlCategory, ControlType, ControlValue};

/// One camera row of `gphoto2 --auto-detect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedCamera {
    pub model: String,
    /// Port in gphoto2 syntax (`usb:001,005`)
    pub port: String,
}

impl DetectedCamera {
    /// Bus and device numbers of a `usb:BBB,DDD` port
    pub fn usb_address(&self) -> Option<(String, String)> {
        usb_address(&self.port)
    }
}

/// Bus and device numbers of a `usb:BBB,DDD` port
pub fn usb_address(port: &str) -> Option<(String, String)> {
    let (bus, device) = port.strip_prefix("usb:")?.split_once(',')?;
    let (bus, device) = (bus.trim(), device.trim());
    if bus.is_empty() || device.is_empty() {
        return None;
    }
    Some((bus.to_string(), device.to_string()))
}

/// Parse `gphoto2 --auto-detect`
///
/// Example format:
/// ```text
/// Model                          Port
/// ----------------------------------------------------------
/// Canon EOS 600D                 usb:001,005
/// ```
pub fn parse_auto_detect(output: &str) -> Vec<DetectedCamera> {
    output
        .lines()
        .skip(2)
        .filter_map(|line| {
            let (model, port) = line.trim().split_once("usb:")?;
            let port = port.trim();
            if port.is_empty() {
                return None;
            }
            let model = match model.trim() {
                "" => "Generic Camera".to_string(),
                m => m.to_string(),
            };
            Some(DetectedCamera {
                model,
                port: format!("usb:{}", port),
            })
        })
        .collect()
}

/// Config paths from `--list-all-config` (or `--list-config`) output
pub fn config_paths(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('/'))
        .map(String::from)
        .collect()
}

/// Keyword table mapping config leaf names to categories
const LEAF_CATEGORIES: &[(&str, ControlCategory)] = &[
    // Exposure
    ("iso", ControlCategory::Exposure),
    ("shutterspeed", ControlCategory::Exposure),
    ("aperture", ControlCategory::Exposure),
    ("f-number", ControlCategory::Exposure),
    ("exposurecompensation", ControlCategory::Exposure),
    ("autoexposuremode", ControlCategory::Exposure),
    ("autoexposuremodedial", ControlCategory::Exposure),
    ("expprogram", ControlCategory::Exposure),
    ("meteringmode", ControlCategory::Exposure),
    ("aeb", ControlCategory::Exposure),
    ("bracketmode", ControlCategory::Exposure),
    ("exposuremetermode", ControlCategory::Exposure),
    ("exposureiso", ControlCategory::Exposure),
    ("aebracket", ControlCategory::Exposure),
    ("manualexposurecompensation", ControlCategory::Exposure),
    ("flashmode", ControlCategory::Exposure),
    ("flashcompensation", ControlCategory::Exposure),
    ("internalflashmode", ControlCategory::Exposure),
    ("flashopen", ControlCategory::Exposure),
    ("flashcharge", ControlCategory::Exposure),
    // Focus
    ("focusmode", ControlCategory::Focus),
    ("manualfocusdrive", ControlCategory::Focus),
    ("autofocusdrive", ControlCategory::Focus),
    ("focusarea", ControlCategory::Focus),
    ("focuspoints", ControlCategory::Focus),
    ("continuousaf", ControlCategory::Focus),
    ("cancelautofocus", ControlCategory::Focus),
    ("afbeam", ControlCategory::Focus),
    ("afmethod", ControlCategory::Focus),
    ("focuslock", ControlCategory::Focus),
    ("afoperation", ControlCategory::Focus),
    // White balance
    ("whitebalance", ControlCategory::WhiteBalance),
    ("whitebalanceadjust", ControlCategory::WhiteBalance),
    ("whitebalanceadjusta", ControlCategory::WhiteBalance),
    ("whitebalancexa", ControlCategory::WhiteBalance),
    ("whitebalancexb", ControlCategory::WhiteBalance),
    ("colortemperature", ControlCategory::WhiteBalance),
    ("wb_adjust", ControlCategory::WhiteBalance),
    // Image
    ("imageformat", ControlCategory::Image),
    ("imageformatsd", ControlCategory::Image),
    ("imageformatcf", ControlCategory::Image),
    ("imageformatexthd", ControlCategory::Image),
    ("imagesize", ControlCategory::Image),
    ("imagequality", ControlCategory::Image),
    ("picturestyle", ControlCategory::Image),
    ("colorspace", ControlCategory::Image),
    ("contrast", ControlCategory::Image),
    ("saturation", ControlCategory::Image),
    ("sharpness", ControlCategory::Image),
    ("hue", ControlCategory::Image),
    ("colormodel", ControlCategory::Image),
    ("highlighttonepr", ControlCategory::Image),
    ("shadowtonepr", ControlCategory::Image),
    ("highisonr", ControlCategory::Image),
    ("longexpnr", ControlCategory::Image),
    ("aspectratio", ControlCategory::Image),
    // Capture
    ("drivemode", ControlCategory::Capture),
    ("capturemode", ControlCategory::Capture),
    ("capturetarget", ControlCategory::Capture),
    ("eosremoterelease", ControlCategory::Capture),
    ("viewfinder", ControlCategory::Capture),
    ("reviewtime", ControlCategory::Capture),
    ("eoszoomposition", ControlCategory::Capture),
    ("eoszoom", ControlCategory::Capture),
    ("eosvfmode", ControlCategory::Capture),
    ("output", ControlCategory::Capture),
    ("movieservoaf", ControlCategory::Capture),
    ("liveviewsize", ControlCategory::Capture),
    ("remotemode", ControlCategory::Capture),
    // Status
    ("batterylevel", ControlCategory::Status),
    ("lensname", ControlCategory::Status),
    ("serialnumber", ControlCategory::Status),
    ("cameramodel", ControlCategory::Status),
    ("deviceversion", ControlCategory::Status),
    ("availableshots", ControlCategory::Status),
    ("eosserialnumber", ControlCategory::Status),
    ("firmwareversion", ControlCategory::Status),
    ("model", ControlCategory::Status),
    ("ptpversion", ControlCategory::Status),
];

/// Section names used when the leaf is unknown
const SECTION_CATEGORIES: &[(&str, ControlCategory)] = &[
    ("imgsettings", ControlCategory::Image),
    ("capturesettings", ControlCategory::Capture),
    ("status", ControlCategory::Status),
    ("settings", ControlCategory::Advanced),
    ("actions", ControlCategory::Advanced),
    ("other", ControlCategory::Advanced),
];

/// Category of a config path: leaf keyword first, then section, then Advanced
pub fn categorize(config_path: &str) -> ControlCategory {
    let lower = config_path.trim_matches('/').to_lowercase();
    let parts: Vec<&str> = lower.split('/').collect();

    if let Some(leaf) = parts.last()
        && let Some((_, category)) = LEAF_CATEGORIES.iter().find(|(name, _)| name == leaf)
    {
        return *category;
    }

    parts
        .iter()
        .find_map(|part| {
            SECTION_CATEGORIES
                .iter()
                .find(|(name, _)| name == part)
                .map(|(_, category)| *category)
        })
        .unwrap_or(ControlCategory::Advanced)
}

/// Parse one `--get-config` block into a control
///
/// Returns `None` for blocks without a label and for widget types that have
/// no control equivalent (sections, buttons).
pub fn parse_config(config_path: &str, block: &str) -> Option<CameraControl> {
    let mut label: Option<String> = None;
    let mut widget = "TEXT".to_string();
    let mut current = String::new();
    let mut bottom: Option<String> = None;
    let mut top: Option<String> = None;
    let mut step: Option<String> = None;
    let mut readonly = false;
    let mut choices = Vec::new();

    for line in block.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Label" => label = Some(value.to_string()),
            "Type" => widget = value.to_string(),
            "Current" => current = value.to_string(),
            "Bottom" => bottom = Some(value.to_string()),
            "Top" => top = Some(value.to_string()),
            "Step" => step = Some(value.to_string()),
            "Readonly" => readonly = value == "1",
            // "Choice: 0 Auto" -> "Auto"
            "Choice" => {
                if let Some((_, text)) = value.split_once(' ') {
                    choices.push(text.trim().to_string());
                }
            }
            _ => {}
        }
    }

    let label = label?;
    let control_type = match widget.as_str() {
        "RADIO" | "MENU" => ControlType::Menu,
        "TOGGLE" => ControlType::Boolean,
        "RANGE" => ControlType::Integer,
        "TEXT" | "DATE" => ControlType::String,
        _ => return None,
    };

    let mut control = CameraControl {
        id: config_path.to_string(),
        name: label,
        category: categorize(config_path),
        control_type,
        value: ControlValue::Text(current.clone()),
        default: ControlValue::Text(current.clone()),
        minimum: None,
        maximum: None,
        step: None,
        choices: Vec::new(),
        flags: if readonly { "read-only".to_string() } else { String::new() },
    };

    match control_type {
        ControlType::Integer => {
            // RANGE values are floats in gphoto2 output ("Current: 50.000000")
            let as_int = |s: &str| s.parse::<f64>().ok().map(|v| v.round() as i64);
            control.minimum = Some(bottom.as_deref().and_then(as_int).unwrap_or(0));
            control.maximum = Some(top.as_deref().and_then(as_int).unwrap_or(100));
            control.step = Some(step.as_deref().and_then(as_int).unwrap_or(1));
            if let Some(v) = as_int(&current) {
                control.value = ControlValue::Int(v);
                control.default = ControlValue::Int(v);
            }
        }
        ControlType::Boolean => {
            let on = matches!(current.to_lowercase().as_str(), "1" | "true" | "on");
            control.value = ControlValue::Bool(on);
            control.default = ControlValue::Bool(on);
        }
        ControlType::Menu => control.choices = choices,
        _ => {}
    }

    Some(control)
}

/// Split concatenated `--get-config` output into per-path controls
///
/// Blocks are delimited by `Label:` lines and paired with `paths` in order.
pub fn parse_batch_output(paths: &[String], output: &str) -> Vec<CameraControl> {
    let mut blocks: Vec<Vec<&str>> = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in output.lines() {
        if line.starts_with("Label:") && !current.is_empty() {
            blocks.push(std::mem::take(&mut current));
        }
        current.push(line);
    }
    if !current.is_empty() {
        blocks.push(current);
    }

    blocks
        .iter()
        .zip(paths)
        .filter_map(|(block, path)| parse_config(path, &block.join("\n")))
        .collect()
}

/// Whether tool output indicates the device stopped answering PTP requests
///
/// This is the one failure a USB reset clears.
pub fn is_stalled(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("ptp i/o error")
        || lower.contains("ptp timeout")
        || lower.contains("ptp device busy")
        || lower.contains("i/o in progress")
}

/// Whether tool output indicates another process claimed the device
pub fn is_claim_failure(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("could not claim") || lower.contains("device or resource busy")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_auto_detect() {
        let output = "\
Model                          Port
----------------------------------------------------------
Canon EOS 600D                 usb:001,005
                               usb:002,003
";
        let cameras = parse_auto_detect(output);
        assert_eq!(cameras.len(), 2);
        assert_eq!(cameras[0].model, "Canon EOS 600D");
        assert_eq!(cameras[0].port, "usb:001,005");
        assert_eq!(
            cameras[0].usb_address(),
            Some(("001".to_string(), "005".to_string()))
        );
        assert_eq!(cameras[1].model, "Generic Camera");
    }

    #[test]
    fn test_usb_address_rejects_other_ports() {
        assert_eq!(usb_address("ptpip:192.168.1.10"), None);
        assert_eq!(usb_address("usb:"), None);
    }

    #[test]
    fn test_categorize_leaf_then_section() {
        assert_eq!(categorize("/main/capturesettings/shutterspeed"), ControlCategory::Exposure);
        assert_eq!(categorize("/main/imgsettings/whitebalance"), ControlCategory::WhiteBalance);
        assert_eq!(categorize("/main/capturesettings/somethingnew"), ControlCategory::Capture);
        assert_eq!(categorize("/main/imgsettings/unknown"), ControlCategory::Image);
        assert_eq!(categorize("/main/status/batterylevel"), ControlCategory::Status);
        assert_eq!(categorize("/vendor/thing"), ControlCategory::Advanced);
    }

    #[test]
    fn test_parse_radio_config() {
        let block = "\
Label: ISO Speed
Readonly: 0
Type: RADIO
Current: 400
Choice: 0 Auto
Choice: 1 100
Choice: 2 400
END
";
        let control = parse_config("/main/imgsettings/iso", block).unwrap();
        assert_eq!(control.name, "ISO Speed");
        assert_eq!(control.control_type, ControlType::Menu);
        assert_eq!(control.category, ControlCategory::Exposure);
        assert_eq!(control.value, ControlValue::Text("400".into()));
        assert_eq!(control.choices, vec!["Auto", "100", "400"]);
        assert!(!control.is_read_only());
    }

    #[test]
    fn test_parse_range_and_toggle() {
        let range = "Label: Zoom\nType: RANGE\nCurrent: 5.000000\nBottom: 1.000000\nTop: 10.000000\nStep: 1.000000\n";
        let control = parse_config("/main/capturesettings/eoszoom", range).unwrap();
        assert_eq!(control.value, ControlValue::Int(5));
        assert_eq!((control.minimum, control.maximum, control.step), (Some(1), Some(10), Some(1)));

        let toggle = "Label: Viewfinder\nReadonly: 1\nType: TOGGLE\nCurrent: 1\n";
        let control = parse_config("/main/actions/viewfinder", toggle).unwrap();
        assert_eq!(control.value, ControlValue::Bool(true));
        assert!(control.is_read_only());
    }

    #[test]
    fn test_parse_config_skips_unknown_types() {
        assert!(parse_config("/main/actions/bulb", "Label: Bulb\nType: BUTTON\n").is_none());
        assert!(parse_config("/main/x", "Type: TEXT\nCurrent: a\n").is_none());
    }

    #[test]
    fn test_parse_batch_output_pairs_blocks_with_paths() {
        let paths = vec![
            "/main/status/batterylevel".to_string(),
            "/main/imgsettings/iso".to_string(),
        ];
        let output = "\
Label: Battery Level
Readonly: 1
Type: TEXT
Current: 75%
END
Label: ISO Speed
Type: RADIO
Current: Auto
Choice: 0 Auto
END
";
        let controls = parse_batch_output(&paths, output);
        assert_eq!(controls.len(), 2);
        assert_eq!(controls[0].id, "/main/status/batterylevel");
        assert_eq!(controls[0].category, ControlCategory::Status);
        assert_eq!(controls[1].id, "/main/imgsettings/iso");
    }

    #[test]
    fn test_failure_classification() {
        assert!(is_stalled("*** Error: PTP I/O Error"));
        assert!(is_claim_failure("Could not claim the USB device"));
        assert!(!is_stalled("Could not claim the USB device"));
    }
}
