// SPDX-License-Identifier: GPL-3.0-only

//! Format selection and preference logic

use crate::backends::camera::types::VideoFormat;
use crate::constants::formats;
use tracing::debug;

/// Parse a `preferred-resolution` setting ("720", "1080p", "1920x1080") into a frame height
pub fn parse_resolution_preference(value: &str) -> Option<u32> {
    let value = value.trim().trim_end_matches(['p', 'P']);
    if let Some((_, height)) = formats::RESOLUTION_PRESETS
        .iter()
        .find(|(name, _)| *name == value)
    {
        return Some(*height);
    }
    match value.split_once(['x', 'X']) {
        Some((_, height)) => height.parse().ok(),
        None => value.parse().ok(),
    }
    .filter(|height| *height > 0)
}

/// Frame rates of `format` that respect `fps_limit`
///
/// When every advertised rate is above the limit the slowest one is kept.
fn limited_fps(format: &VideoFormat, fps_limit: Option<f64>) -> Vec<f64> {
    let Some(limit) = fps_limit.filter(|l| *l > 0.0) else {
        return format.fps.clone();
    };
    let within: Vec<f64> = format.fps.iter().copied().filter(|f| *f <= limit).collect();
    if within.is_empty() {
        format
            .fps
            .iter()
            .copied()
            .reduce(f64::min)
            .into_iter()
            .collect()
    } else {
        within
    }
}

/// Pick the format a session starts with
///
/// Returns `None` when neither a preferred height nor an fps limit is set,
/// leaving the choice to the driver. Otherwise candidates are narrowed to
/// the preferred height (exact match, else the tallest formats below it),
/// then to compressed formats reaching a smooth frame rate, then to any
/// smooth format. The largest remaining format wins; ties go to the higher
/// frame rate and then to compressed pixel formats. The returned format
/// only lists frame rates within `fps_limit`.
pub fn pick_preferred_format(
    available: &[VideoFormat],
    preferred_height: Option<u32>,
    fps_limit: Option<f64>,
) -> Option<VideoFormat> {
    let fps_limit = fps_limit.filter(|l| *l > 0.0);
    if available.is_empty() || (preferred_height.is_none() && fps_limit.is_none()) {
        return None;
    }

    let mut candidates: Vec<&VideoFormat> = available.iter().collect();
    if let Some(height) = preferred_height {
        let exact: Vec<_> = candidates.iter().copied().filter(|f| f.height == height).collect();
        if !exact.is_empty() {
            candidates = exact;
        } else {
            let below: Vec<_> = candidates.iter().copied().filter(|f| f.height < height).collect();
            if let Some(tallest) = below.iter().map(|f| f.height).max() {
                candidates = below.into_iter().filter(|f| f.height == tallest).collect();
            }
        }
    }

    let effective_fps = |f: &VideoFormat| limited_fps(f, fps_limit).into_iter().fold(0.0, f64::max);
    let smooth: Vec<_> = candidates
        .iter()
        .copied()
        .filter(|f| effective_fps(f) >= formats::MIN_PREFERRED_FPS)
        .collect();
    let smooth_compressed: Vec<_> = smooth.iter().copied().filter(|f| f.is_mjpeg()).collect();
    if !smooth_compressed.is_empty() {
        candidates = smooth_compressed;
    } else if !smooth.is_empty() {
        candidates = smooth;
    }

    let best = candidates.into_iter().max_by(|a, b| {
        a.pixels()
            .cmp(&b.pixels())
            .then(effective_fps(a).total_cmp(&effective_fps(b)))
            .then(a.is_mjpeg().cmp(&b.is_mjpeg()))
    })?;

    debug!(format = %best, ?preferred_height, ?fps_limit, "Selected preferred format");
    Some(VideoFormat {
        fps: limited_fps(best, fps_limit),
        ..best.clone()
    })
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

    fn webcam() -> Vec<VideoFormat> {
        vec![
            format("YUYV", 640, 480, &[30.0, 15.0]),
            format("YUYV", 1920, 1080, &[5.0]),
            format("MJPG", 1280, 720, &[60.0, 30.0]),
            format("MJPG", 1920, 1080, &[30.0]),
        ]
    }

    #[test]
    fn test_parse_resolution_preference() {
        assert_eq!(parse_resolution_preference("720"), Some(720));
        assert_eq!(parse_resolution_preference("1080p"), Some(1080));
        assert_eq!(parse_resolution_preference("1920x1080"), Some(1080));
        assert_eq!(parse_resolution_preference("auto"), None);
        assert_eq!(parse_resolution_preference("0"), None);
    }

    #[test]
    fn test_no_preference_leaves_choice_to_driver() {
        assert!(pick_preferred_format(&webcam(), None, None).is_none());
        assert!(pick_preferred_format(&webcam(), None, Some(0.0)).is_none());
    }

    #[test]
    fn test_compressed_smooth_formats_come_first() {
        let formats = vec![
            format("YUYV", 1920, 1080, &[30.0]),
            format("MJPG", 1920, 1080, &[30.0]),
            format("MJPG", 1280, 720, &[30.0]),
        ];
        let best = pick_preferred_format(&formats, Some(1080), None).unwrap();
        assert_eq!(best.pixel_format, "MJPG");
        assert_eq!(best.height, 1080);

        // A 60 fps limit keeps the same tiers
        let best = pick_preferred_format(&formats, None, Some(60.0)).unwrap();
        assert_eq!((best.pixel_format.as_str(), best.height), ("MJPG", 1080));
    }

    #[test]
    fn test_preferred_height_and_fps_limit() {
        let best = pick_preferred_format(&webcam(), Some(720), Some(30.0)).unwrap();
        assert_eq!((best.width, best.height), (1280, 720));
        assert_eq!(best.fps, vec![30.0]);
    }

    #[test]
    fn test_preference_falls_back_to_tallest_below() {
        let best = pick_preferred_format(&webcam(), Some(900), None).unwrap();
        assert_eq!(best.height, 720);
    }

    #[test]
    fn test_slow_only_formats_still_selected() {
        let formats = vec![format("NV12", 4056, 3040, &[10.0])];
        let best = pick_preferred_format(&formats, None, Some(5.0)).unwrap();
        assert_eq!(best.fps, vec![10.0]);
        assert!(pick_preferred_format(&[], None, None).is_none());
    }
}
