//! Decoded message types: the payload shapes behind each command code.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::frame::CommandType;

/// Data-point mapping: device-defined numeric index to an arbitrary value.
pub type DpMap = BTreeMap<u32, Value>;

/// A device announcement received via UDP discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "gwId")]
    pub device_id: String,
    pub ip: String,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "productKey", default, skip_serializing_if = "Option::is_none")]
    pub product_key: Option<String>,
}

/// One in-memory protocol message: command type plus a payload whose shape
/// depends on the command.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Control/status family: a data-point mapping, optionally scoped to a
    /// sub-device behind a gateway. An empty map encodes a plain query.
    DataPoints {
        command: CommandType,
        sub_device: Option<String>,
        dps: DpMap,
    },
    /// DP_REFRESH: ask the device to re-report the listed data points.
    Refresh {
        command: CommandType,
        dp_ids: Vec<u32>,
    },
    /// Opaque byte payloads: session negotiation, heartbeat, unknown commands.
    Raw {
        command: CommandType,
        payload: Bytes,
    },
    /// UDP discovery broadcast.
    Discovery {
        command: CommandType,
        info: DeviceInfo,
    },
}

impl Message {
    pub fn command(&self) -> CommandType {
        match self {
            Message::DataPoints { command, .. } => *command,
            Message::Refresh { command, .. } => *command,
            Message::Raw { command, .. } => *command,
            Message::Discovery { command, .. } => *command,
        }
    }

    pub fn heartbeat() -> Self {
        Message::Raw {
            command: CommandType::HeartBeat,
            payload: Bytes::new(),
        }
    }
}

/// Render a dp map as the JSON object the wire expects (string keys).
pub(crate) fn dps_to_json(dps: &DpMap) -> Value {
    let mut obj = serde_json::Map::with_capacity(dps.len());
    for (id, value) in dps {
        obj.insert(id.to_string(), value.clone());
    }
    Value::Object(obj)
}

/// Extract a dp map from a decoded JSON object, skipping non-numeric keys.
pub(crate) fn dps_from_json(value: &Value) -> DpMap {
    let mut dps = DpMap::new();
    if let Some(obj) = value.as_object() {
        for (key, val) in obj {
            match key.parse::<u32>() {
                Ok(id) => {
                    dps.insert(id, val.clone());
                }
                Err(_) => warn!("ignoring non-numeric dp index {key:?}"),
            }
        }
    }
    dps
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dp_map_json_roundtrip() {
        let mut dps = DpMap::new();
        dps.insert(1, json!(true));
        dps.insert(20, json!("white"));
        let value = dps_to_json(&dps);
        assert_eq!(value, json!({"1": true, "20": "white"}));
        assert_eq!(dps_from_json(&value), dps);
    }

    #[test]
    fn non_numeric_dp_keys_are_skipped() {
        let dps = dps_from_json(&json!({"1": 5, "type": "obj"}));
        assert_eq!(dps.len(), 1);
        assert_eq!(dps.get(&1), Some(&json!(5)));
    }

    #[test]
    fn device_info_ignores_extra_fields() {
        let raw = r#"{"ip":"192.168.0.9","gwId":"bf6b","active":2,"ability":0,
                      "encrypt":true,"productKey":"keyjap","version":"3.3"}"#;
        let info: DeviceInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.device_id, "bf6b");
        assert_eq!(info.ip, "192.168.0.9");
        assert_eq!(info.version, "3.3");
    }
}
