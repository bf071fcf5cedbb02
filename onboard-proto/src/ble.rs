//! BLE GATT service constants for device provisioning
//!
//! A device advertises the provisioning service while it has no network.
//! The phone side proves possession first, then writes SSID and password
//! followed by a command byte.

/// Provisioning service UUID
pub const SERVICE_UUID: &str = "b40e1000-5e7c-1c3e-0000-000000000000";

/// WiFi SSID characteristic (write)
pub const WIFI_SSID_UUID: &str = "b40e1001-5e7c-1c3e-0000-000000000000";

/// WiFi password characteristic (write)
pub const WIFI_PASS_UUID: &str = "b40e1002-5e7c-1c3e-0000-000000000000";

/// Command characteristic (write)
pub const COMMAND_UUID: &str = "b40e1003-5e7c-1c3e-0000-000000000000";

/// Status characteristic (read/notify)
pub const STATUS_UUID: &str = "b40e1004-5e7c-1c3e-0000-000000000000";

/// Length of the proof-of-possession digest carried by authenticated commands
pub const PROOF_LEN: usize = 32;

/// Command bytes written to [`COMMAND_UUID`]
pub mod commands {
    /// Check a 32-byte proof-of-possession digest. The device answers on the
    /// status characteristic with [`super::ProofVerdict`], or fails the write.
    pub const VERIFY: u8 = 0x10;

    /// Apply the SSID/password just written and restart into station mode.
    /// Only accepted while the device reports [`super::DeviceStatus::Unpaired`].
    pub const PROVISION: u8 = 0x02;

    /// Same as `PROVISION`, followed by a 32-byte proof-of-possession digest
    pub const PROVISION_AUTH: u8 = 0x12;
}

// some firmwares NUL-terminate the value
fn trim_nul(data: &[u8]) -> &[u8] {
    match data.iter().position(|b| *b == 0) {
        Some(end) => &data[..end],
        None => data,
    }
}

/// Value of the status characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Unpaired,
    Paired,
    Connected,
    WifiFailed,
}

impl DeviceStatus {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            DeviceStatus::Unpaired => b"unpaired",
            DeviceStatus::Paired => b"paired",
            DeviceStatus::Connected => b"connected",
            DeviceStatus::WifiFailed => b"wifi_failed",
        }
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        match trim_nul(data) {
            b"unpaired" => Some(DeviceStatus::Unpaired),
            b"paired" => Some(DeviceStatus::Paired),
            b"connected" => Some(DeviceStatus::Connected),
            b"wifi_failed" => Some(DeviceStatus::WifiFailed),
            _ => None,
        }
    }

    /// Whether provisioning must use the authenticated command
    pub fn requires_proof(&self) -> bool {
        !matches!(self, DeviceStatus::Unpaired)
    }
}

/// Status characteristic value right after a [`commands::VERIFY`] write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofVerdict {
    Verified,
    Denied,
}

impl ProofVerdict {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        match trim_nul(data) {
            b"verified" => Some(ProofVerdict::Verified),
            b"denied" => Some(ProofVerdict::Denied),
            _ => None,
        }
    }
}

pub fn verify_command(proof: &[u8; PROOF_LEN]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + PROOF_LEN);
    buf.push(commands::VERIFY);
    buf.extend_from_slice(proof);
    buf
}

/// Build the bytes written to the command characteristic
pub fn provision_command(proof: Option<&[u8; PROOF_LEN]>) -> Vec<u8> {
    match proof {
        Some(proof) => {
            let mut buf = Vec::with_capacity(1 + PROOF_LEN);
            buf.push(commands::PROVISION_AUTH);
            buf.extend_from_slice(proof);
            buf
        }
        None => vec![commands::PROVISION],
    }
}
