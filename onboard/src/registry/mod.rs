//! Registry client
//!
//! A hierarchical keyed store rooted at the owner's identity:
//! `users/<owner>/devices/<deviceId>`. Writes are upserts keyed by device
//! identifier. Reads are either a point lookup or a live subscription that
//! yields the current list immediately and then one snapshot per change.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;

use crate::{Attributes, DeviceListSnapshot, RegisteredDevice, RegistryConfig, RegistryError};

mod firebase;
mod memory;
pub mod sse;
mod tree;

pub use firebase::FirebaseRegistry;
pub use memory::MemoryRegistry;

/// Infinite stream of device-list snapshots for one owner
pub type DeviceStream = Pin<Box<dyn Stream<Item = Result<DeviceListSnapshot, RegistryError>> + Send>>;

#[async_trait::async_trait]
pub trait Registry: Send + Sync {
    /// Bind `device_identifier` under `owner`. Writing the same key twice
    /// leaves one entry; attributes are merged into what is already there.
    async fn register(
        &self,
        owner: &str,
        device_identifier: &str,
        attributes: Attributes,
    ) -> Result<RegisteredDevice, RegistryError>;

    async fn lookup(
        &self,
        owner: &str,
        device_identifier: &str,
    ) -> Result<Option<RegisteredDevice>, RegistryError>;

    async fn subscribe(&self, owner: &str) -> Result<DeviceStream, RegistryError>;
}

/// Build the backend named by the configuration
pub fn from_config(config: &RegistryConfig) -> Arc<dyn Registry> {
    match config {
        RegistryConfig::Memory => Arc::new(MemoryRegistry::new()),
        RegistryConfig::Firebase { database_url, auth_token } => {
            Arc::new(FirebaseRegistry::new(database_url, auth_token.clone()))
        }
    }
}

pub(crate) fn check_key(key: &str) -> Result<(), RegistryError> {
    if onboard_proto::is_valid_key(key) {
        Ok(())
    } else {
        Err(RegistryError::InvalidKey(key.to_string()))
    }
}
