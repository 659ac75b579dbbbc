// SPDX-License-Identifier: GPL-3.0-only

//! PipeWire video source enumeration
//!
//! Primary source is the structured `pw-dump` output. When `pw-dump` is not
//! installed the `pw-cli list-objects` text listing is parsed instead.

use super::dump::PwObject;
use crate::constants::app_info;
use tracing::debug;

/// A PipeWire node producing video
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PwVideoNode {
    pub id: u32,
    pub name: String,
    pub media_class: String,
}

impl PwVideoNode {
    pub fn is_virtual(&self) -> bool {
        self.media_class.contains("Virtual")
    }
}

fn is_video_source_class(class: &str) -> bool {
    class == "Video/Source" || class == "Video/Source/Virtual"
}

/// Loopback outputs (ours or v4l2loopback's proxies) must not show up as inputs
fn is_loopback_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.contains("v4l2loopback")
        || lower.contains("(v4l2)")
        || name.contains(app_info::VIRTUAL_OUTPUT_NAME)
}

fn accept(id: u32, name: Option<String>, media_class: String) -> Option<PwVideoNode> {
    if !is_video_source_class(&media_class) {
        return None;
    }
    let name = name.unwrap_or_else(|| format!("PipeWire Camera {}", id));
    if is_loopback_name(&name) {
        debug!(name = %name, "Skipping loopback video node");
        return None;
    }
    Some(PwVideoNode {
        id,
        name,
        media_class,
    })
}

/// Video source nodes from parsed `pw-dump` objects
pub fn video_nodes_from_dump(objects: &[PwObject]) -> Vec<PwVideoNode> {
    objects
        .iter()
        .filter(|obj| obj.is_node())
        .filter_map(|obj| {
            let media_class = obj.prop("media.class")?;
            let name = obj
                .prop("node.description")
                .or_else(|| obj.prop("node.nick"))
                .or_else(|| obj.prop("node.name"));
            accept(obj.id, name, media_class)
        })
        .collect()
}

/// Video source nodes from `pw-cli list-objects` text
///
/// Blocks start with `id N, type PipeWire:Interface:Node/3` and continue with
/// indented `key = "value"` property lines.
pub fn video_nodes_from_pw_cli(output: &str) -> Vec<PwVideoNode> {
    let mut nodes = Vec::new();
    let mut current_id: Option<u32> = None;
    let mut media_class: Option<String> = None;
    let mut description: Option<String> = None;
    let mut nick: Option<String> = None;
    let mut node_name: Option<String> = None;

    let mut flush = |id: Option<u32>,
                     class: Option<String>,
                     description: Option<String>,
                     nick: Option<String>,
                     node_name: Option<String>| {
        if let (Some(id), Some(class)) = (id, class)
            && let Some(node) = accept(id, description.or(nick).or(node_name), class)
        {
            nodes.push(node);
        }
    };

    for line in output.lines() {
        let trimmed = line.trim();

        if let Some(rest) = trimmed.strip_prefix("id ")
            && let Some((id, kind)) = rest.split_once(',')
        {
            flush(
                current_id.take(),
                media_class.take(),
                description.take(),
                nick.take(),
                node_name.take(),
            );
            if kind.contains("PipeWire:Interface:Node") {
                current_id = id.trim().parse().ok();
            }
            continue;
        }

        if current_id.is_none() {
            continue;
        }

        let Some((key, _)) = trimmed.split_once('=') else {
            continue;
        };
        let Some(value) = extract_quoted_value(trimmed) else {
            continue;
        };
        match key.trim() {
            "media.class" => media_class = Some(value),
            "node.description" => description = Some(value),
            "node.nick" => nick = Some(value),
            "node.name" => node_name = Some(value),
            _ => {}
        }
    }

    // Don't forget the last node
    flush(current_id, media_class, description, nick, node_name);
    nodes
}

/// Extract quoted value from a property line (e.g., 'property = "value"' -> "value")
pub(crate) fn extract_quoted_value(line: &str) -> Option<String> {
    let start = line.find('"')?;
    let end = line[start + 1..].find('"')?;
    Some(line[start + 1..start + 1 + end].to_string())
}
