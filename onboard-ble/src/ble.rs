//! BLE transport for provisioning devices
//!
//! Scans for devices advertising the provisioning service, opens a GATT
//! session, proves possession of the device and writes WiFi credentials.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use onboard::{
    CredentialPayload, DeviceHandle, DiscoveredDevice, DiscoveryFilter, Transport, TransportError,
};
use onboard_proto::ble::{
    COMMAND_UUID, DeviceStatus, PROOF_LEN, ProofVerdict, SERVICE_UUID, STATUS_UUID,
    WIFI_PASS_UUID, WIFI_SSID_UUID, provision_command, verify_command,
};

fn parse_uuid(s: &str) -> Result<Uuid, TransportError> {
    Uuid::parse_str(s).map_err(|e| TransportError::Connect(format!("invalid UUID {s}: {e}")))
}

fn unavailable(e: btleplug::Error) -> TransportError {
    TransportError::Unavailable(e.to_string())
}

fn connect_failed(e: btleplug::Error) -> TransportError {
    TransportError::Connect(e.to_string())
}

/// Get the default Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new().await.map_err(unavailable)?;
    let adapters = manager.adapters().await.map_err(unavailable)?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| TransportError::Unavailable("No Bluetooth adapter found".into()))
}

/// Whether an advertisement belongs to a device we can provision.
///
/// With a prefix, the advertised name must start with it (or carry it in
/// the `nimble [Prefix-xxx]` form some stacks use). Without one, the
/// device must advertise the provisioning service.
pub fn matches(name: Option<&str>, advertises_service: bool, prefix: &str) -> bool {
    if prefix.is_empty() {
        return advertises_service;
    }
    match name {
        Some(name) => name.starts_with(prefix) || name.contains(&format!("[{prefix}")),
        None => false,
    }
}

/// Digest carried by the authenticated provision command
pub fn proof_digest(proof_of_possession: &str) -> [u8; PROOF_LEN] {
    Sha256::digest(proof_of_possession.as_bytes()).into()
}

/// Anything but `verified` after a proof check fails the pairing
pub fn check_verdict(raw: &[u8]) -> Result<(), TransportError> {
    match ProofVerdict::from_bytes(raw) {
        Some(ProofVerdict::Verified) => Ok(()),
        Some(ProofVerdict::Denied) => {
            Err(TransportError::Connect("proof of possession rejected".into()))
        }
        None => Err(TransportError::Connect(format!(
            "unexpected answer to proof check {:?}",
            String::from_utf8_lossy(raw)
        ))),
    }
}

/// Runs `stop` exactly once: when discovery finishes, or from a spawned task
/// if the discovery future is dropped or bails out early.
struct ScanGuard<F: Future<Output = ()> + Send + 'static> {
    stop: Option<F>,
}

impl<F: Future<Output = ()> + Send + 'static> ScanGuard<F> {
    fn new(stop: F) -> Self {
        Self { stop: Some(stop) }
    }

    async fn finish(mut self) {
        if let Some(stop) = self.stop.take() {
            stop.await;
        }
    }
}

impl<F: Future<Output = ()> + Send + 'static> Drop for ScanGuard<F> {
    fn drop(&mut self) {
        let Some(stop) = self.stop.take() else { return };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(stop);
            }
            Err(_) => tracing::warn!("no runtime left to stop the scan"),
        }
    }
}

pub struct BleTransport {
    adapter: Adapter,
    /// Peripherals seen by the last scan, keyed by identifier
    peripherals: Mutex<HashMap<String, Peripheral>>,
}

/// An open GATT session with the provisioning characteristics resolved
pub struct BleSession {
    peripheral: Peripheral,
    ssid: Characteristic,
    password: Characteristic,
    command: Characteristic,
    status: DeviceStatus,
    proof: Option<[u8; PROOF_LEN]>,
}

impl BleSession {
    /// Status the device reported when the session was opened
    pub fn status(&self) -> DeviceStatus {
        self.status
    }
}

impl BleTransport {
    pub async fn new() -> Result<Self, TransportError> {
        Ok(Self::with_adapter(get_adapter().await?))
    }

    pub fn with_adapter(adapter: Adapter) -> Self {
        Self { adapter, peripherals: Mutex::new(HashMap::new()) }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Peripheral>> {
        self.peripherals.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn peripheral(&self, identifier: &str) -> Option<Peripheral> {
        self.table().get(identifier).cloned()
    }
}

#[async_trait::async_trait]
impl Transport for BleTransport {
    type Session = BleSession;

    async fn discover(
        &self,
        filter: &DiscoveryFilter,
    ) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let service = parse_uuid(SERVICE_UUID)?;

        self.adapter.start_scan(ScanFilter::default()).await.map_err(unavailable)?;
        let adapter = self.adapter.clone();
        let scanning = ScanGuard::new(async move {
            if let Err(e) = adapter.stop_scan().await {
                tracing::warn!("failed to stop scan: {e}");
            }
        });
        tokio::time::sleep(filter.duration).await;

        let peripherals = self.adapter.peripherals().await.map_err(unavailable)?;
        let mut devices = Vec::new();
        let mut seen = HashMap::new();

        for peripheral in peripherals {
            let Some(props) = peripheral.properties().await.map_err(unavailable)? else {
                continue;
            };
            let advertises = props.services.contains(&service);
            if !matches(props.local_name.as_deref(), advertises, &filter.prefix) {
                continue;
            }

            let identifier = peripheral.address().to_string();
            tracing::debug!(%identifier, name = ?props.local_name, rssi = ?props.rssi, "found device");
            devices.push(DiscoveredDevice {
                identifier: identifier.clone(),
                display_name: props.local_name,
                rssi: props.rssi,
                handle: DeviceHandle::new(identifier.clone()),
            });
            seen.insert(identifier, peripheral);
        }

        scanning.finish().await;

        devices.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        *self.table() = seen;
        Ok(devices)
    }

    async fn connect(
        &self,
        device: &DiscoveredDevice,
        proof_of_possession: &str,
    ) -> Result<BleSession, TransportError> {
        let peripheral = self.peripheral(&device.identifier).ok_or_else(|| {
            TransportError::Connect(format!("{} is no longer in range", device.identifier))
        })?;

        peripheral.connect().await.map_err(connect_failed)?;
        peripheral.discover_services().await.map_err(connect_failed)?;

        let characteristics = peripheral.characteristics();
        let find = |uuid: &str, what: &str| -> Result<Characteristic, TransportError> {
            let uuid = parse_uuid(uuid)?;
            characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| TransportError::Connect(format!("{what} characteristic not found")))
        };

        let ssid = find(WIFI_SSID_UUID, "WiFi SSID")?;
        let password = find(WIFI_PASS_UUID, "WiFi password")?;
        let command = find(COMMAND_UUID, "Command")?;
        let status_char = find(STATUS_UUID, "Status")?;

        let raw = peripheral.read(&status_char).await.map_err(connect_failed)?;
        let status = DeviceStatus::from_bytes(&raw).ok_or_else(|| {
            TransportError::Connect(format!(
                "unknown device status {:?}",
                String::from_utf8_lossy(&raw)
            ))
        })?;

        let proof = proof_digest(proof_of_possession);
        peripheral
            .write(&command, &verify_command(&proof), WriteType::WithResponse)
            .await
            .map_err(|e| TransportError::Connect(format!("proof of possession rejected: {e}")))?;
        let verdict = peripheral.read(&status_char).await.map_err(connect_failed)?;
        check_verdict(&verdict)?;
        tracing::info!(device = %device.identifier, ?status, "secure session open");

        let proof = status.requires_proof().then_some(proof);
        Ok(BleSession { peripheral, ssid, password, command, status, proof })
    }

    async fn send_credentials(
        &self,
        session: &BleSession,
        credentials: &CredentialPayload,
    ) -> Result<(), TransportError> {
        let rejected = |e: btleplug::Error| TransportError::Rejected(e.to_string());
        let p = &session.peripheral;

        p.write(&session.ssid, credentials.network_name.as_bytes(), WriteType::WithResponse)
            .await
            .map_err(rejected)?;
        p.write(&session.password, credentials.network_secret.as_bytes(), WriteType::WithResponse)
            .await
            .map_err(rejected)?;
        p.write(&session.command, &provision_command(session.proof.as_ref()), WriteType::WithResponse)
            .await
            .map_err(rejected)?;
        Ok(())
    }

    async fn disconnect(&self, device: &DiscoveredDevice) -> Result<(), TransportError> {
        let Some(peripheral) = self.peripheral(&device.identifier) else {
            return Ok(());
        };
        if peripheral.is_connected().await.unwrap_or(false) {
            peripheral.disconnect().await.map_err(connect_failed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn prefix_matches_plain_and_nimble_names() {
        assert!(matches(Some("PROV_9F3A"), false, "PROV_"));
        assert!(matches(Some("nimble [PROV_9F3A]"), false, "PROV_"));
        assert!(!matches(Some("Headphones"), true, "PROV_"));
        assert!(!matches(None, true, "PROV_"));
    }

    #[test]
    fn without_prefix_the_service_decides() {
        assert!(matches(None, true, ""));
        assert!(!matches(Some("PROV_9F3A"), false, ""));
    }

    #[test]
    fn denied_proof_fails_the_pairing() {
        assert!(check_verdict(b"verified\0").is_ok());
        assert!(matches!(check_verdict(b"denied"), Err(TransportError::Connect(_))));
        assert!(matches!(check_verdict(b"paired"), Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn scan_is_stopped_when_discovery_is_dropped() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let guard = ScanGuard::new(async move {
            let _ = tx.send(());
        });
        let discovery = async move {
            let _scanning = guard;
            std::future::pending::<()>().await
        };
        assert!(tokio::time::timeout(Duration::from_millis(20), discovery).await.is_err());
        tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn scan_is_stopped_once_on_the_normal_path() {
        let stops = Arc::new(AtomicUsize::new(0));
        let counted = stops.clone();
        let guard = ScanGuard::new(async move {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        guard.finish().await;
        tokio::task::yield_now().await;
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn proof_is_sha256_of_the_shared_value() {
        let digest = proof_digest("abcd1234");
        assert_eq!(digest[..4], [0xe9, 0xce, 0xe7, 0x1a]);
        assert_ne!(digest, proof_digest("abcd1235"));
    }
}
