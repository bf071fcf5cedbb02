//! Onboard wire vocabulary
//!
//! Everything two parties have to agree on byte-for-byte lives here:
//! - the BLE GATT provisioning service (UUIDs, command bytes, status values)
//! - the JSON bodies of the local handoff exchange
//! - the path layout of the device registry
//!
//! No I/O and no async, so the device firmware side can share it.

pub mod ble;
pub mod handoff;
pub mod registry;

pub use handoff::{HandoffBody, HandoffReply, DEFAULT_HANDOFF_URL, HANDOFF_PATH};
pub use registry::{device_path, devices_path, is_valid_key};
