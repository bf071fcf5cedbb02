//! Short-range radio transport seam
//!
//! Discovery and the secure channel are provided by an external driver.
//! `onboard-ble` implements this trait over btleplug; tests use fakes.

use std::time::Duration;

use crate::{CredentialPayload, DiscoveredDevice, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Ble,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    /// Session authenticated with a proof-of-possession value
    Secure2,
}

/// What to look for during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFilter {
    /// Advertised name prefix; empty matches every provisioning device
    pub prefix: String,
    pub transport: TransportKind,
    pub security: SecurityLevel,
    /// How long the radio listens before results are returned
    pub duration: Duration,
}

impl Default for DiscoveryFilter {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            transport: TransportKind::Ble,
            security: SecurityLevel::Secure2,
            duration: Duration::from_secs(5),
        }
    }
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// An open secure session with one device
    type Session: Send + Sync;

    /// Zero results is `Ok(vec![])`, not an error
    async fn discover(&self, filter: &DiscoveryFilter)
    -> Result<Vec<DiscoveredDevice>, TransportError>;

    async fn connect(
        &self,
        device: &DiscoveredDevice,
        proof_of_possession: &str,
    ) -> Result<Self::Session, TransportError>;

    /// Transfers both fields or none
    async fn send_credentials(
        &self,
        session: &Self::Session,
        credentials: &CredentialPayload,
    ) -> Result<(), TransportError>;

    /// Release any link to `device`, whether or not a session was fully
    /// established.
    async fn disconnect(&self, device: &DiscoveredDevice) -> Result<(), TransportError>;
}
