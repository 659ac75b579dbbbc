// SPDX-License-Identifier: GPL-3.0-only

//! libcamera camera enumeration
//!
//! Parses the `cam` CLI listings. libcamera has no rich text introspection,
//! so formats are read from `cam -c <id> -I` when it reports a resolution and
//! otherwise fall back to a conservative set of ISP output sizes.

use super::super::types::VideoFormat;
use tracing::debug;

/// One row of `cam --list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CamListing {
    /// 1-based index printed by `cam`
    pub index: u32,
    pub name: String,
    /// libcamera camera id (device tree path or USB path)
    pub camera_id: String,
}

/// Parse `cam --list` output
///
/// Example format:
/// ```text
/// Available cameras:
/// 1: Internal front camera (/base/soc/i2c0mux/i2c@1/imx219@10)
/// 2: 'ov5640 2-003c' (/base/soc/i2c@fdd40000/ov5640@3c)
/// ```
pub fn parse_cam_list(output: &str) -> Vec<CamListing> {
    let mut cameras = Vec::new();

    for line in output.lines() {
        let trimmed = line.trim();

        // Look for lines starting with a number followed by ':'
        let Some((before_colon, rest)) = trimmed.split_once(':') else {
            continue;
        };
        let Ok(index) = before_colon.trim().parse::<u32>() else {
            continue;
        };
        let rest = rest.trim();

        // Camera id between the last pair of parentheses
        let (Some(id_start), Some(id_end)) = (rest.rfind('('), rest.rfind(')')) else {
            continue;
        };
        if id_end <= id_start {
            continue;
        }
        let camera_id = rest[id_start + 1..id_end].trim().to_string();
        let name = rest[..id_start].trim().trim_matches('\'').trim().to_string();
        if name.is_empty() || camera_id.is_empty() {
            continue;
        }

        debug!(index, name = %name, camera_id = %camera_id, "Found libcamera camera");
        cameras.push(CamListing {
            index,
            name,
            camera_id,
        });
    }

    cameras
}

/// Formats from `cam -c <id> -I` output
///
/// Only the largest reported resolution is trusted; frame rates are the
/// ones every libcamera pipeline handler supports.
pub fn parse_stream_info(output: &str) -> Vec<VideoFormat> {
    let Some((width, height)) = output
        .lines()
        .filter_map(find_resolution_in_line)
        .max_by_key(|(w, h)| u64::from(*w) * u64::from(*h))
    else {
        return Vec::new();
    };

    vec![VideoFormat {
        width,
        height,
        fps: vec![30.0, 15.0, 10.0],
        pixel_format: "NV12".to_string(),
        description: "ISP output".to_string(),
    }]
}

/// Fallback formats for ISP cameras when enumeration fails
pub fn fallback_formats() -> Vec<VideoFormat> {
    [(1920, 1080), (1280, 720), (640, 480)]
        .into_iter()
        .map(|(width, height)| VideoFormat {
            width,
            height,
            fps: vec![30.0, 15.0],
            pixel_format: "NV12".to_string(),
            description: "ISP output".to_string(),
        })
        .collect()
}

/// Find resolution pattern (WxH) in a line
fn find_resolution_in_line(line: &str) -> Option<(u32, u32)> {
    line.split(|c: char| c.is_whitespace() || c == ',' || c == '-' || c == '/')
        .filter_map(|word| {
            let (w, h) = word.split_once('x')?;
            let (w, h) = (w.parse::<u32>().ok()?, h.parse::<u32>().ok()?);
            (w >= 320 && h >= 240).then_some((w, h))
        })
        .next()
}
