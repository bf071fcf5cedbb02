//! Onboard BLE transport
//!
//! [`BleTransport`] implements [`onboard::Transport`] over btleplug.
//!
//! # Example
//!
//! ```ignore
//! use onboard::{DiscoveryFilter, Transport};
//! use onboard_ble::BleTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = BleTransport::new().await?;
//!     for device in transport.discover(&DiscoveryFilter::default()).await? {
//!         println!("{} ({})", device.label(), device.identifier);
//!     }
//!     Ok(())
//! }
//! ```

pub mod ble;

pub use ble::{BleSession, BleTransport};
