use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use futures::StreamExt;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use super::{DeviceStream, Registry, check_key};
use crate::{Attributes, DeviceListSnapshot, RegisteredDevice, RegistryError};

type Devices = BTreeMap<String, Attributes>;

/// In-process registry with the same contract as the remote store
///
/// Every owner has a watch channel holding its device map; subscribers get
/// the current map first and then every change.
#[derive(Default)]
pub struct MemoryRegistry {
    owners: Mutex<HashMap<String, watch::Sender<Devices>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn owners(&self) -> MutexGuard<'_, HashMap<String, watch::Sender<Devices>>> {
        self.owners.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn channel(&self, owner: &str) -> watch::Sender<Devices> {
        self.owners()
            .entry(owner.to_string())
            .or_insert_with(|| watch::channel(Devices::new()).0)
            .clone()
    }

    /// Number of entries under `owner`
    pub fn len(&self, owner: &str) -> usize {
        self.owners().get(owner).map(|tx| tx.borrow().len()).unwrap_or(0)
    }
}

fn snapshot(owner: &str, devices: &Devices) -> DeviceListSnapshot {
    DeviceListSnapshot {
        owner: owner.to_string(),
        devices: devices
            .iter()
            .map(|(id, attributes)| RegisteredDevice { id: id.clone(), attributes: attributes.clone() })
            .collect(),
    }
}

#[async_trait::async_trait]
impl Registry for MemoryRegistry {
    async fn register(
        &self,
        owner: &str,
        device_identifier: &str,
        attributes: Attributes,
    ) -> Result<RegisteredDevice, RegistryError> {
        check_key(owner)?;
        check_key(device_identifier)?;

        let mut stored = Attributes::new();
        self.channel(owner).send_modify(|devices| {
            let entry = devices.entry(device_identifier.to_string()).or_default();
            for (k, v) in attributes {
                if v.is_null() {
                    entry.remove(&k);
                } else {
                    entry.insert(k, v);
                }
            }
            stored = entry.clone();
        });

        Ok(RegisteredDevice { id: device_identifier.to_string(), attributes: stored })
    }

    async fn lookup(
        &self,
        owner: &str,
        device_identifier: &str,
    ) -> Result<Option<RegisteredDevice>, RegistryError> {
        check_key(owner)?;
        let devices = self.channel(owner);
        let devices = devices.borrow();
        Ok(devices
            .get(device_identifier)
            .map(|attributes| RegisteredDevice {
                id: device_identifier.to_string(),
                attributes: attributes.clone(),
            }))
    }

    async fn subscribe(&self, owner: &str) -> Result<DeviceStream, RegistryError> {
        check_key(owner)?;
        let owner = owner.to_string();
        let rx = self.channel(&owner).subscribe();

        Ok(WatchStream::new(rx).map(move |devices| Ok(snapshot(&owner, &devices))).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(v: serde_json::Value) -> Attributes {
        v.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn re_registering_is_an_upsert() {
        let registry = MemoryRegistry::new();
        registry.register("user-1", "esp32-9F3A", attrs(json!({"name": "Kitchen"}))).await.unwrap();
        let second = registry
            .register("user-1", "esp32-9F3A", attrs(json!({"network": "Home"})))
            .await
            .unwrap();

        assert_eq!(registry.len("user-1"), 1);
        assert_eq!(second.attributes.get("name"), Some(&json!("Kitchen")));
        assert_eq!(second.attributes.get("network"), Some(&json!("Home")));
    }

    #[tokio::test]
    async fn owners_are_separate_namespaces() {
        let registry = MemoryRegistry::new();
        registry.register("user-1", "esp32-9F3A", Attributes::new()).await.unwrap();

        assert!(registry.lookup("user-2", "esp32-9F3A").await.unwrap().is_none());
        assert!(registry.lookup("user-1", "esp32-9F3A").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn subscription_starts_with_current_state() {
        let registry = MemoryRegistry::new();
        registry.register("user-1", "esp32-A", Attributes::new()).await.unwrap();

        let mut stream = registry.subscribe("user-1").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.devices.len(), 1);

        registry.register("user-1", "esp32-B", Attributes::new()).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        let ids: Vec<_> = second.devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["esp32-A", "esp32-B"]);
    }

    #[tokio::test]
    async fn invalid_keys_are_refused() {
        let registry = MemoryRegistry::new();
        let err = registry.register("user-1", "a/b", Attributes::new()).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidKey(_)));
        assert_eq!(registry.len("user-1"), 0);
    }
}
