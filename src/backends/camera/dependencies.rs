// SPDX-License-Identifier: GPL-3.0-only

//! Runtime dependency report
//!
//! Lists which external tools the drivers rely on are installed, so a user
//! can tell why a backend is missing from the registry.

use super::process::is_on_path;
use serde::Serialize;
use std::path::Path;

/// One checked dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    pub name: &'static str,
    /// What needs it
    pub purpose: &'static str,
    pub available: bool,
    /// Missing critical dependencies disable core functionality
    pub critical: bool,
}

/// Tool checks as (name, alternatives, purpose, critical)
const TOOLS: &[(&str, &[&str], &str, bool)] = &[
    ("v4l2-ctl", &["v4l2-ctl"], "USB webcams", true),
    ("gst-launch-1.0", &["gst-launch-1.0"], "preview pipelines", true),
    ("gphoto2", &["gphoto2"], "DSLR and mirrorless cameras", false),
    ("ffmpeg", &["ffmpeg"], "DSLR live view and webcam snapshots", false),
    ("libcamera", &["cam", "libcamera-hello"], "CSI sensor cameras", false),
    ("libcamera-still", &["libcamera-still"], "CSI sensor photos", false),
    ("pipewire", &["pw-dump", "pw-cli"], "PipeWire video sources", false),
    ("fuser", &["fuser"], "busy device diagnostics", false),
    ("lsusb", &["lsusb"], "hotplug detection and USB reset", false),
];

/// Check every dependency against `PATH` and the loaded kernel modules
pub fn check_all() -> Vec<Dependency> {
    let modules = std::fs::read_to_string("/proc/modules").unwrap_or_default();
    check_with(is_on_path, &modules)
}

/// Check dependencies with an injected lookup and `/proc/modules` content
pub fn check_with(on_path: impl Fn(&str) -> bool, proc_modules: &str) -> Vec<Dependency> {
    let mut deps: Vec<Dependency> = TOOLS
        .iter()
        .map(|(name, alternatives, purpose, critical)| Dependency {
            name,
            purpose,
            available: alternatives.iter().any(|tool| on_path(tool)),
            critical: *critical,
        })
        .collect();

    deps.push(Dependency {
        name: "v4l2loopback",
        purpose: "virtual camera output",
        available: module_loaded(proc_modules, "v4l2loopback")
            || Path::new("/sys/module/v4l2loopback").exists(),
        critical: false,
    });
    deps
}

/// Names of missing critical dependencies
pub fn missing_critical(deps: &[Dependency]) -> Vec<&'static str> {
    deps.iter()
        .filter(|d| d.critical && !d.available)
        .map(|d| d.name)
        .collect()
}

fn module_loaded(proc_modules: &str, module: &str) -> bool {
    proc_modules
        .lines()
        .any(|line| line.split_whitespace().next() == Some(module))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alternatives_and_modules() {
        let deps = check_with(
            |tool| matches!(tool, "libcamera-hello" | "v4l2-ctl"),
            "videodev 344064 3 uvcvideo, Live 0x0\nv4l2loopback 49152 0 - Live 0x0\n",
        );
        let get = |name: &str| deps.iter().find(|d| d.name == name).unwrap().available;

        assert!(get("libcamera"));
        assert!(get("v4l2-ctl"));
        assert!(!get("gphoto2"));
        assert!(get("v4l2loopback"));
        assert_eq!(missing_critical(&deps), vec!["gst-launch-1.0"]);
    }

    #[test]
    fn test_module_name_must_match_exactly() {
        assert!(!module_loaded("v4l2loopback_dc 1 0 - Live\n", "v4l2loopback"));
    }
}
