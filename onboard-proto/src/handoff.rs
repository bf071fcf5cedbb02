//! Local handoff bodies
//!
//! Once the device has joined the target network it serves a small HTTP
//! endpoint. The app POSTs the owner's identity and the device answers with
//! its durable identifier.

use serde::{Deserialize, Serialize};

/// Where the device listens after joining the network
pub const DEFAULT_HANDOFF_URL: &str = "http://esp32.local/receiveUID";

pub const HANDOFF_PATH: &str = "/receiveUID";

/// Request body: `{"uid": "<owner>"}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HandoffBody {
    pub uid: String,
}

/// Response body: `{"deviceId": "<id>"}`
///
/// `device_id` is optional here so that a missing field can be told apart
/// from a body that is not JSON at all.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HandoffReply {
    #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<serde_json::Value>,
}

impl HandoffReply {
    /// The identifier, if present, a string, and non-empty after trimming
    pub fn device_id(&self) -> Option<&str> {
        match &self.device_id {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(s.trim()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_uses_uid_field() {
        let body = HandoffBody { uid: "user-1".to_string() };
        assert_eq!(serde_json::to_string(&body).unwrap(), r#"{"uid":"user-1"}"#);
    }

    #[test]
    fn reply_device_id_must_be_a_non_empty_string() {
        let ok: HandoffReply = serde_json::from_str(r#"{"deviceId":"esp32-9F3A"}"#).unwrap();
        assert_eq!(ok.device_id(), Some("esp32-9F3A"));

        let missing: HandoffReply = serde_json::from_str(r#"{"status":"ok"}"#).unwrap();
        assert_eq!(missing.device_id(), None);

        let empty: HandoffReply = serde_json::from_str(r#"{"deviceId":"  "}"#).unwrap();
        assert_eq!(empty.device_id(), None);

        let number: HandoffReply = serde_json::from_str(r#"{"deviceId":42}"#).unwrap();
        assert_eq!(number.device_id(), None);
    }
}
