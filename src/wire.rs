//! JSON wire shapes for the control plane and the gossip plane, plus the
//! three-part binary `DataMessage` used by the data plane.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One message received on a sensor's data-subscription socket:
/// `[sensor_uuid_bytes, header_bytes, body_bytes]` with the first frame
/// already stripped off by the caller.
#[derive(Debug, Clone)]
pub struct DataMessage {
    pub sensor_uuid: String,
    pub header: Bytes,
    pub body: Bytes,
}

/// A notification received on a sensor's notify-subscription socket,
/// frame 1 of `[sensor_uuid_bytes, json]`.
///
/// Parsed by [`Notification::parse`] rather than a derived `Deserialize`:
/// an unrecognized `subject` is not a parse failure, it's a notification
/// the built-in cache logic ignores but the callback chain still sees.
/// Only a missing/non-string `subject`, or a recognized subject missing
/// its required fields, counts as malformed.
#[derive(Debug, Clone)]
pub enum Notification {
    Update {
        control_id: String,
        changes: serde_json::Map<String, Value>,
        seq: Option<u64>,
    },
    Remove {
        control_id: String,
        seq: Option<u64>,
    },
    Error {
        control_id: String,
        info: Value,
        seq: Option<u64>,
    },
    /// Any other `subject`. Still dispatched to the callback chain; the
    /// built-in reconciliation callback does nothing with it.
    Other {
        subject: String,
        raw: serde_json::Map<String, Value>,
    },
}

impl Notification {
    pub fn subject(&self) -> &str {
        match self {
            Notification::Update { .. } => "update",
            Notification::Remove { .. } => "remove",
            Notification::Error { .. } => "error",
            Notification::Other { subject, .. } => subject,
        }
    }

    /// Returns `None` for anything that doesn't parse as a JSON object with
    /// a string `subject` field, or whose recognized subject is missing a
    /// required field — both cases the caller treats as malformed and
    /// drops with a debug log, never surfacing a hard error.
    pub fn parse(bytes: &[u8]) -> Option<Notification> {
        let value: Value = serde_json::from_slice(bytes).ok()?;
        let obj = value.as_object()?;
        let subject = obj.get("subject")?.as_str()?.to_string();
        let seq = obj.get("seq").and_then(Value::as_u64);
        match subject.as_str() {
            "update" => Some(Notification::Update {
                control_id: obj.get("control_id")?.as_str()?.to_string(),
                changes: obj.get("changes")?.as_object()?.clone(),
                seq,
            }),
            "remove" => Some(Notification::Remove {
                control_id: obj.get("control_id")?.as_str()?.to_string(),
                seq,
            }),
            "error" => Some(Notification::Error {
                control_id: obj.get("control_id")?.as_str()?.to_string(),
                info: obj.get("info").cloned().unwrap_or(Value::Null),
                seq,
            }),
            _ => Some(Notification::Other {
                subject,
                raw: obj.clone(),
            }),
        }
    }
}

/// A gossip message (SHOUT on the group, or WHISPER on join) announcing a
/// sensor attach or detach. `host_uuid`/`host_name` are not present on the
/// wire — the node injects them from the originating peer before this is
/// handed to callbacks.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "subject", rename_all = "snake_case")]
pub enum GossipPayload {
    Attach {
        sensor_uuid: String,
        sensor_name: String,
        sensor_type: String,
        notify_endpoint: String,
        command_endpoint: String,
        #[serde(default)]
        data_endpoint: Option<String>,
    },
    Detach {
        sensor_uuid: String,
    },
}

/// A command sent to the publisher over the command-push socket:
/// `[sensor_uuid_str, json]`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    RefreshControls,
    SetControlValue { control_id: String, value: Value },
}
