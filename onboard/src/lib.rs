//! Onboard - provision headless devices onto a user's account
//!
//! The flow, driven by [`Orchestrator`]:
//!
//! ```text
//! discover (BLE) -> pair -> send WiFi credentials -> disconnect
//!     -> local HTTP handoff (device answers with its id)
//!     -> bind the id under the owner in the registry
//! ```
//!
//! The three channels involved are all fallible and independent. Each one
//! sits behind a trait so the orchestrator can be driven against fakes:
//! [`Transport`], [`Handoff`] and [`Registry`].
//!
//! # Example
//!
//! ```ignore
//! let orchestrator = Arc::new(Orchestrator::new(
//!     Arc::new(transport),
//!     Arc::new(HttpHandoff::new(config.handoff_timeout())),
//!     registry::from_config(&config.registry),
//!     "user-1",
//!     config.flow_settings(),
//! ));
//!
//! if let ScanOutcome::Devices(devices) = orchestrator.start_scan().await? {
//!     orchestrator.select_device(&devices[0].identifier)?;
//!     orchestrator.submit_credentials("Home", "pw1234").await?;
//! }
//! ```

extern crate self as onboard;

pub mod config;
mod error;
pub mod handoff;
mod locks;
pub mod machine;
mod model;
mod orchestrator;
pub mod projector;
pub mod registry;
mod transport;

pub use config::{ConfigError, ProvisionConfig, RegistryConfig, onboard_home};
pub use error::{HandoffError, ProvisionError, RegistryError, Step, TransportError};
pub use handoff::{Handoff, HttpHandoff};
pub use locks::{AttemptGuard, AttemptLocks};
pub use machine::{Action, Event, ProvisioningState};
pub use model::{
    Attributes, CredentialPayload, DeviceHandle, DeviceListSnapshot, DiscoveredDevice,
    HandoffRequest, HandoffResponse, RegisteredDevice,
};
pub use orchestrator::{FlowOutcome, FlowSettings, Orchestrator, ScanOutcome};
pub use registry::{DeviceStream, FirebaseRegistry, MemoryRegistry, Registry};
pub use transport::{DiscoveryFilter, SecurityLevel, Transport, TransportKind};
