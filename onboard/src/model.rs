//! Data carried through a provisioning attempt

use serde::{Deserialize, Serialize};

/// Free-form attributes stored with a registered device
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Opaque reference into the transport that produced a [`DiscoveredDevice`]
///
/// Only the transport knows what the string means (a peripheral id, an index
/// into its own table, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle(String);

impl DeviceHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A device found by discovery. Lives only as long as the scan results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Radio identifier, also the key of the per-device attempt lock
    pub identifier: String,
    pub display_name: Option<String>,
    pub rssi: Option<i16>,
    pub handle: DeviceHandle,
}

impl DiscoveredDevice {
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.identifier)
    }
}

/// WiFi credentials for one attempt. Never persisted, never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialPayload {
    pub network_name: String,
    pub network_secret: String,
}

impl CredentialPayload {
    /// Both fields must be non-empty before a transfer is attempted
    pub fn new(network_name: &str, network_secret: &str) -> Option<Self> {
        if network_name.is_empty() || network_secret.is_empty() {
            return None;
        }
        Some(Self {
            network_name: network_name.to_string(),
            network_secret: network_secret.to_string(),
        })
    }
}

impl std::fmt::Debug for CredentialPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPayload")
            .field("network_name", &self.network_name)
            .field("network_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffRequest {
    /// Stable identifier of the authenticated user
    pub owner_identity: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffResponse {
    /// Non-empty, stable across repeated handoffs for the same device.
    /// Primary key of the registry entry.
    pub device_identifier: String,
}

/// A device bound under an owner in the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredDevice {
    pub id: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl RegisteredDevice {
    /// The `name` attribute, if the entry carries one
    pub fn name(&self) -> Option<&str> {
        self.attributes.get("name").and_then(|v| v.as_str())
    }
}

/// Full device list of one owner at a point in time, sorted by id
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceListSnapshot {
    pub owner: String,
    pub devices: Vec<RegisteredDevice>,
}

impl DeviceListSnapshot {
    /// Build a snapshot from the raw `devices` collection of an owner.
    ///
    /// Each child becomes one device keyed by its name. A child that is not
    /// an object carries no attributes; a null or absent collection is an
    /// empty list.
    pub fn from_value(owner: &str, value: &serde_json::Value) -> Self {
        let mut devices: Vec<RegisteredDevice> = match value.as_object() {
            Some(children) => children
                .iter()
                .map(|(id, v)| RegisteredDevice {
                    id: id.clone(),
                    attributes: v.as_object().cloned().unwrap_or_default(),
                })
                .collect(),
            None => Vec::new(),
        };
        devices.sort_by(|a, b| a.id.cmp(&b.id));

        Self { owner: owner.to_string(), devices }
    }

    pub fn get(&self, id: &str) -> Option<&RegisteredDevice> {
        self.devices.iter().find(|d| d.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn credentials_require_both_fields() {
        assert!(CredentialPayload::new("Home", "pw1234").is_some());
        assert!(CredentialPayload::new("", "pw1234").is_none());
        assert!(CredentialPayload::new("Home", "").is_none());
    }

    #[test]
    fn credential_debug_hides_the_secret() {
        let creds = CredentialPayload::new("Home", "pw1234").unwrap();
        let printed = format!("{creds:?}");
        assert!(printed.contains("Home"));
        assert!(!printed.contains("pw1234"));
    }

    #[test]
    fn snapshot_from_collection() {
        let value = json!({
            "esp32-B": {"name": "Porch"},
            "esp32-A": {"name": "Kitchen", "on": true},
            "esp32-C": 5,
        });
        let snapshot = DeviceListSnapshot::from_value("user-1", &value);

        let ids: Vec<_> = snapshot.devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["esp32-A", "esp32-B", "esp32-C"]);
        assert_eq!(snapshot.get("esp32-A").and_then(|d| d.name()), Some("Kitchen"));
        assert!(snapshot.get("esp32-C").unwrap().attributes.is_empty());
    }

    #[test]
    fn null_collection_is_empty() {
        let snapshot = DeviceListSnapshot::from_value("user-1", &serde_json::Value::Null);
        assert!(snapshot.devices.is_empty());
        assert_eq!(snapshot.owner, "user-1");
    }
}
