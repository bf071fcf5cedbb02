//! Provisioning orchestrator
//!
//! Drives [`machine::step`] against the real collaborators. Every operation
//! applies one event under the state lock, performs the resulting action
//! with the lock released, and feeds the outcome back as the next event.
//! Steps run strictly one after another; nothing begins before the previous
//! result is known.
//!
//! The orchestrator is shared (`Arc<Orchestrator<_>>`): `cancel` and the
//! state accessors may be called from another task while `start_scan` or
//! `submit_credentials` is in flight. The async operations run on their own
//! task, so a caller that drops its future (a timeout, a lost `select!`)
//! leaves the attempt running; it still reaches `Idle` or a terminal state
//! and still answers `cancel`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::machine::{self, Action, Event, ProvisioningState};
use crate::{
    AttemptLocks, Attributes, CredentialPayload, DiscoveredDevice, DiscoveryFilter, Handoff,
    HandoffRequest, ProvisionConfig, ProvisionError, RegisteredDevice, Registry, Transport,
};

/// Per-flow knobs, usually taken from [`ProvisionConfig::flow_settings`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSettings {
    pub filter: DiscoveryFilter,
    /// Fixed pre-shared value proving physical possession of the device
    pub proof_of_possession: String,
    pub pairing_timeout: Duration,
    pub handoff_url: String,
    /// Pause between releasing the radio link and the handoff call
    pub network_join_grace: Duration,
}

impl Default for FlowSettings {
    fn default() -> Self {
        ProvisionConfig::default().flow_settings()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Devices(Vec<DiscoveredDevice>),
    NoDevices,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlowOutcome {
    Completed(RegisteredDevice),
    Cancelled,
}

/// One attempt to provision one device. The credentials are not kept here;
/// they live only as long as the task driving the attempt.
struct ProvisioningSession {
    selected: DiscoveredDevice,
}

#[derive(Default)]
struct Inner {
    state: Option<ProvisioningState>,
    results: Vec<DiscoveredDevice>,
    session: Option<ProvisioningSession>,
    last_error: Option<ProvisionError>,
    /// Set while discovery or pairing is running
    cancel: Option<CancellationToken>,
    /// Credentials are on their way to the device; cancel is no longer offered
    committed: bool,
    /// Registration that failed and may be resumed
    pending: Option<(String, Attributes)>,
    /// Device whose attempt is still running, including the closing steps
    /// after a terminal state was reported
    driving: Option<String>,
}

impl Inner {
    fn state(&self) -> &ProvisioningState {
        self.state.as_ref().unwrap_or(&ProvisioningState::Idle)
    }

    fn selected_identifier(&self) -> String {
        self.session.as_ref().map(|s| s.selected.identifier.clone()).unwrap_or_default()
    }

    fn busy(&self) -> Option<ProvisionError> {
        if let Some(device) = &self.driving {
            return Some(ProvisionError::ConcurrentAttemptRejected { device: device.clone() });
        }
        if self.state().is_in_flight() {
            return Some(ProvisionError::ConcurrentAttemptRejected {
                device: self.selected_identifier(),
            });
        }
        None
    }
}

/// Clears `Inner::driving` when the attempt ends, even if its future is dropped
struct Driving<'a>(&'a Mutex<Inner>);

impl Drop for Driving<'_> {
    fn drop(&mut self) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).driving = None;
    }
}

pub struct Orchestrator<T: Transport> {
    transport: Arc<T>,
    handoff: Arc<dyn Handoff>,
    registry: Arc<dyn Registry>,
    owner: String,
    settings: FlowSettings,
    locks: AttemptLocks,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ProvisioningState>,
}

impl<T: Transport> Orchestrator<T> {
    pub fn new(
        transport: Arc<T>,
        handoff: Arc<dyn Handoff>,
        registry: Arc<dyn Registry>,
        owner: &str,
        settings: FlowSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(ProvisioningState::Idle);
        Self {
            transport,
            handoff,
            registry,
            owner: owner.to_string(),
            settings,
            locks: AttemptLocks::new(),
            inner: Mutex::new(Inner::default()),
            state_tx,
        }
    }

    /// Share attempt locks with other orchestrators, so the same device is
    /// never provisioned twice at once
    pub fn with_locks(mut self, locks: AttemptLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn settings(&self) -> &FlowSettings {
        &self.settings
    }

    pub fn state(&self) -> ProvisioningState {
        self.lock().state().clone()
    }

    /// Observe every state change
    pub fn watch_state(&self) -> watch::Receiver<ProvisioningState> {
        self.state_tx.subscribe()
    }

    pub fn last_error(&self) -> Option<ProvisionError> {
        self.lock().last_error.clone()
    }

    pub fn scan_results(&self) -> Vec<DiscoveredDevice> {
        self.lock().results.clone()
    }

    pub fn selected_device(&self) -> Option<DiscoveredDevice> {
        self.lock().session.as_ref().map(|s| s.selected.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, inner: &mut Inner, event: Event) -> Result<Action, ProvisionError> {
        let from = inner.state().name();
        let t = machine::step(inner.state(), event)
            .map_err(|r| ProvisionError::InvalidRequest(r.to_string()))?;

        tracing::debug!(from, to = %t.state, action = ?t.action, "transition");

        if let ProvisioningState::Failed(e) = &t.state {
            inner.last_error = Some(e.clone());
        }
        if t.state == ProvisioningState::Idle || t.state.is_terminal() {
            // the session is discarded on every way out
            inner.session = None;
            inner.results.clear();
            inner.cancel = None;
            inner.committed = false;
        }
        if t.state == ProvisioningState::Completed {
            inner.pending = None;
        }

        inner.state = Some(t.state.clone());
        self.state_tx.send_replace(t.state);
        Ok(t.action)
    }

    fn advance(&self, event: Event) -> Result<Action, ProvisionError> {
        let mut inner = self.lock();
        self.transition(&mut inner, event)
    }

    /// Discover devices. Zero results is not an error and returns to `Idle`.
    pub async fn start_scan(self: &Arc<Self>) -> Result<ScanOutcome, ProvisionError> {
        let this = self.clone();
        detach(async move { this.scan().await }).await
    }

    async fn scan(&self) -> Result<ScanOutcome, ProvisionError> {
        let token = CancellationToken::new();
        {
            let mut inner = self.lock();
            if let Some(e) = inner.busy() {
                return Err(e);
            }
            self.transition(&mut inner, Event::ScanRequested)?;
            inner.cancel = Some(token.clone());
        }

        tracing::info!(prefix = %self.settings.filter.prefix, duration = ?self.settings.filter.duration, "scanning");

        let found = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            r = self.transport.discover(&self.settings.filter) => Some(r),
        };

        let mut inner = self.lock();
        inner.cancel = None;

        match found {
            _ if token.is_cancelled() => {
                self.transition(&mut inner, Event::CancelRequested)?;
                tracing::info!("scan cancelled");
                Ok(ScanOutcome::Cancelled)
            }
            None => {
                self.transition(&mut inner, Event::CancelRequested)?;
                Ok(ScanOutcome::Cancelled)
            }
            Some(Ok(devices)) => {
                tracing::info!(found = devices.len(), "scan finished");
                inner.results = devices.clone();
                self.transition(&mut inner, Event::ScanFinished(Ok(devices.len())))?;
                if devices.is_empty() {
                    Ok(ScanOutcome::NoDevices)
                } else {
                    Ok(ScanOutcome::Devices(devices))
                }
            }
            Some(Err(e)) => {
                let e = ProvisionError::TransportUnavailable(e.to_string());
                self.transition(&mut inner, Event::ScanFinished(Err(e.clone())))?;
                Err(e)
            }
        }
    }

    /// Pick a device from the last scan. The snapshot taken here is what the
    /// rest of the flow uses, even if the device leaves range.
    pub fn select_device(&self, identifier: &str) -> Result<DiscoveredDevice, ProvisionError> {
        let mut inner = self.lock();

        if let Some(e) = inner.busy() {
            return Err(e);
        }
        if inner.cancel.is_some() {
            return Err(ProvisionError::InvalidRequest("discovery is still running".to_string()));
        }

        let device = inner
            .results
            .iter()
            .find(|d| d.identifier == identifier)
            .cloned()
            .ok_or_else(|| {
                ProvisionError::InvalidRequest(format!("{identifier} is not in the scan results"))
            })?;

        if self.locks.is_held(&device.identifier) {
            return Err(ProvisionError::ConcurrentAttemptRejected { device: device.identifier });
        }

        self.transition(&mut inner, Event::DeviceChosen)?;
        inner.session = Some(ProvisioningSession { selected: device.clone() });
        tracing::info!(device = %device.identifier, name = device.label(), "device selected");
        Ok(device)
    }

    /// Pair with the selected device, hand it the credentials, then run the
    /// handoff and registration. Returns once a terminal state is reached or
    /// the attempt was cancelled before the credentials were committed.
    pub async fn submit_credentials(
        self: &Arc<Self>,
        network_name: &str,
        network_secret: &str,
    ) -> Result<FlowOutcome, ProvisionError> {
        let this = self.clone();
        let (name, secret) = (network_name.to_string(), network_secret.to_string());
        detach(async move { this.provision(&name, &secret).await }).await
    }

    async fn provision(
        &self,
        network_name: &str,
        network_secret: &str,
    ) -> Result<FlowOutcome, ProvisionError> {
        let token = CancellationToken::new();

        let (device, credentials, _guard) = {
            let mut inner = self.lock();

            if let Some(e) = inner.busy() {
                return Err(e);
            }
            let device = match (inner.state(), &inner.session) {
                (ProvisioningState::DeviceSelected, Some(s)) => s.selected.clone(),
                (s, _) => {
                    return Err(ProvisionError::InvalidRequest(format!(
                        "no device selected (state {s})"
                    )));
                }
            };
            let credentials =
                CredentialPayload::new(network_name, network_secret).ok_or_else(|| {
                    ProvisionError::InvalidRequest(
                        "network name and secret must both be non-empty".to_string(),
                    )
                })?;
            let guard = self.locks.try_acquire(&device.identifier).ok_or_else(|| {
                ProvisionError::ConcurrentAttemptRejected { device: device.identifier.clone() }
            })?;

            self.transition(&mut inner, Event::CredentialsSubmitted)?;
            inner.cancel = Some(token.clone());
            inner.driving = Some(device.identifier.clone());
            (device, credentials, guard)
        };

        tracing::info!(
            device = %device.identifier,
            network = %credentials.network_name,
            owner = %self.owner,
            "provisioning"
        );

        let _driving = Driving(&self.inner);
        self.drive(&device, &credentials, &token).await
    }

    async fn drive(
        &self,
        device: &DiscoveredDevice,
        credentials: &CredentialPayload,
        token: &CancellationToken,
    ) -> Result<FlowOutcome, ProvisionError> {
        let attributes = registration_attributes(Some(device), Some(&credentials.network_name));
        let mut action = Action::OpenSession;
        let mut session: Option<T::Session> = None;
        let mut registered = None;
        let mut failed_registration = None;
        let mut cancelled = false;

        loop {
            let event = match action {
                Action::OpenSession => {
                    let timeout = self.settings.pairing_timeout;
                    let connect = tokio::time::timeout(
                        timeout,
                        self.transport.connect(device, &self.settings.proof_of_possession),
                    );
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            cancelled = true;
                            Event::CancelRequested
                        }
                        r = connect => match r {
                            Ok(Ok(s)) => {
                                session = Some(s);
                                Event::SessionOpened(Ok(()))
                            }
                            Ok(Err(e)) => {
                                Event::SessionOpened(Err(ProvisionError::PairingFailed(e.to_string())))
                            }
                            Err(_) => Event::SessionOpened(Err(ProvisionError::PairingFailed(
                                format!("no secure session within {timeout:?}"),
                            ))),
                        }
                    }
                }
                Action::SendCredentials => {
                    if !self.commit(token) {
                        cancelled = true;
                        Event::CancelRequested
                    } else {
                        let sent = match session.as_ref() {
                            Some(s) => self
                                .transport
                                .send_credentials(s, credentials)
                                .await
                                .map_err(|e| ProvisionError::CredentialRejected(e.to_string())),
                            None => Err(ProvisionError::PairingFailed("secure session lost".into())),
                        };
                        Event::CredentialsTransferred(sent)
                    }
                }
                Action::CloseSession => {
                    if let Err(e) = self.transport.disconnect(device).await {
                        tracing::warn!(device = %device.identifier, "disconnect failed: {e}");
                    }
                    session = None;
                    Event::SessionClosed
                }
                Action::AwaitNetworkJoin => {
                    let grace = self.settings.network_join_grace;
                    if !grace.is_zero() {
                        tracing::info!(?grace, "waiting for device to join the network");
                        tokio::time::sleep(grace).await;
                    }
                    Event::JoinWaitElapsed
                }
                Action::RequestHandoff => {
                    let request = HandoffRequest { owner_identity: self.owner.clone() };
                    tracing::info!(address = %self.settings.handoff_url, "handoff");
                    let r = self
                        .handoff
                        .send(&self.settings.handoff_url, &request)
                        .await
                        .map(|r| r.device_identifier)
                        .map_err(ProvisionError::from);
                    Event::HandoffFinished(r)
                }
                Action::Register { device_identifier } => {
                    match self.register(&device_identifier, attributes.clone()).await {
                        Ok(d) => {
                            registered = Some(d);
                            Event::RegistrationFinished(Ok(()))
                        }
                        Err(e) => {
                            failed_registration = Some((device_identifier, attributes.clone()));
                            Event::RegistrationFinished(Err(e))
                        }
                    }
                }
                Action::Report
                | Action::Discover
                | Action::AwaitSelection
                | Action::AwaitCredentials => break,
            };

            action = self.advance(event)?;
        }

        match self.state() {
            ProvisioningState::Completed => {
                let device = registered.ok_or_else(|| {
                    ProvisionError::InvalidRequest("completed without a registry entry".into())
                })?;
                tracing::info!(device = %device.id, owner = %self.owner, "provisioning completed");
                Ok(FlowOutcome::Completed(device))
            }
            ProvisioningState::Failed(e) => {
                tracing::warn!(step = ?e.step(), "provisioning failed: {e}");
                if failed_registration.is_some() {
                    self.lock().pending = failed_registration;
                }
                Err(e)
            }
            ProvisioningState::Idle if cancelled => {
                tracing::info!(device = %device.identifier, "provisioning cancelled");
                Ok(FlowOutcome::Cancelled)
            }
            other => Err(ProvisionError::InvalidRequest(format!("flow stopped in state {other}"))),
        }
    }

    /// Last point at which cancellation wins. After this the payload is
    /// committed to the device and the flow runs to a terminal state.
    fn commit(&self, token: &CancellationToken) -> bool {
        let mut inner = self.lock();
        if token.is_cancelled() {
            return false;
        }
        inner.committed = true;
        true
    }

    async fn register(
        &self,
        device_identifier: &str,
        attributes: Attributes,
    ) -> Result<RegisteredDevice, ProvisionError> {
        tracing::info!(device = device_identifier, owner = %self.owner, "registering");
        self.registry.register(&self.owner, device_identifier, attributes).await.map_err(|e| {
            ProvisionError::RegistrationFailed {
                device_identifier: device_identifier.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Accept cancellation in `Scanning`, `DeviceSelected` and `Pairing`
    /// until the credentials are committed. In-flight work observes the
    /// request and releases the radio link before returning to `Idle`.
    pub fn cancel(&self) -> Result<(), ProvisionError> {
        let mut inner = self.lock();
        let state = inner.state().clone();

        match state {
            ProvisioningState::Idle | ProvisioningState::Completed | ProvisioningState::Failed(_) => {
                Ok(())
            }
            ProvisioningState::Scanning | ProvisioningState::Pairing
                if inner.cancel.is_some() && !inner.committed =>
            {
                if let Some(token) = &inner.cancel {
                    token.cancel();
                }
                tracing::info!(%state, "cancel requested");
                Ok(())
            }
            ProvisioningState::Scanning | ProvisioningState::DeviceSelected => {
                self.transition(&mut inner, Event::CancelRequested)?;
                Ok(())
            }
            s => Err(ProvisionError::InvalidRequest(format!(
                "cannot cancel in state {s}, the credentials are already with the device"
            ))),
        }
    }

    /// Bind an already-known device identifier without pairing again.
    /// Used after `RegistrationFailed`.
    pub async fn retry_registration(
        self: &Arc<Self>,
        device_identifier: &str,
    ) -> Result<RegisteredDevice, ProvisionError> {
        let this = self.clone();
        let device_identifier = device_identifier.to_string();
        detach(async move { this.resume_registration(&device_identifier).await }).await
    }

    async fn resume_registration(
        &self,
        device_identifier: &str,
    ) -> Result<RegisteredDevice, ProvisionError> {
        if device_identifier.trim().is_empty() {
            return Err(ProvisionError::InvalidRequest("device identifier is empty".into()));
        }

        let attributes = {
            let mut inner = self.lock();
            if let Some(e) = inner.busy() {
                return Err(e);
            }
            self.transition(
                &mut inner,
                Event::RegistrationRequested { device_identifier: device_identifier.to_string() },
            )?;
            match inner.pending.take() {
                Some((id, attributes)) if id == device_identifier => attributes,
                other => {
                    inner.pending = other;
                    registration_attributes(None, None)
                }
            }
        };

        let result = self.register(device_identifier, attributes.clone()).await;

        let mut inner = self.lock();
        match result {
            Ok(device) => {
                self.transition(&mut inner, Event::RegistrationFinished(Ok(())))?;
                tracing::info!(device = %device.id, "registration completed");
                Ok(device)
            }
            Err(e) => {
                self.transition(&mut inner, Event::RegistrationFinished(Err(e.clone())))?;
                inner.pending = Some((device_identifier.to_string(), attributes));
                Err(e)
            }
        }
    }
}

/// Runs `op` on its own task. Dropping the returned future detaches it; a
/// panic inside is raised again in the caller.
async fn detach<R: Send + 'static>(
    op: impl Future<Output = Result<R, ProvisionError>> + Send + 'static,
) -> Result<R, ProvisionError> {
    match tokio::spawn(op).await {
        Ok(r) => r,
        Err(e) => match e.try_into_panic() {
            Ok(panic) => std::panic::resume_unwind(panic),
            Err(e) => Err(ProvisionError::Interrupted(e.to_string())),
        },
    }
}

/// Attributes written with a new registry entry. The network secret is
/// never part of them.
fn registration_attributes(device: Option<&DiscoveredDevice>, network: Option<&str>) -> Attributes {
    let mut attributes = Attributes::new();
    if let Some(name) = device.and_then(|d| d.display_name.as_deref()) {
        attributes.insert("name".into(), name.into());
    }
    if let Some(network) = network {
        attributes.insert("network".into(), network.into());
    }
    let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    attributes.insert("registeredAt".into(), now.into());
    attributes
}
