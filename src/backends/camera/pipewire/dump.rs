// SPDX-License-Identifier: GPL-3.0-only

//! `pw-dump` object model
//!
//! `pw-dump` prints every PipeWire object as a JSON array. Only nodes and
//! their property dictionaries are of interest here.

use super::super::types::{BackendError, BackendResult};
use serde::Deserialize;
use serde_json::{Map, Value};

/// One object from `pw-dump`
#[derive(Debug, Clone, Deserialize)]
pub struct PwObject {
    pub id: u32,
    #[serde(rename = "type", default)]
    pub object_type: String,
    #[serde(default)]
    pub info: Option<PwInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PwInfo {
    #[serde(default)]
    pub props: Map<String, Value>,
}

impl PwObject {
    /// String view of a property; numbers are rendered in decimal
    pub fn prop(&self, key: &str) -> Option<String> {
        match self.info.as_ref()?.props.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn is_node(&self) -> bool {
        self.object_type.starts_with("PipeWire:Interface:Node")
    }
}

/// Parse the full `pw-dump` output
pub fn parse_dump(json: &str) -> BackendResult<Vec<PwObject>> {
    serde_json::from_str(json)
        .map_err(|e| BackendError::DetectionFailed(format!("malformed pw-dump output: {}", e)))
}

/// Find the `Video/Source` node PipeWire created for a V4L2 device node
pub fn find_v4l2_node(objects: &[PwObject], device_path: &str) -> Option<u32> {
    objects
        .iter()
        .find(|obj| {
            obj.prop("media.class").as_deref() == Some("Video/Source")
                && obj.prop("api.v4l2.path").as_deref() == Some(device_path)
        })
        .map(|obj| obj.id)
}
