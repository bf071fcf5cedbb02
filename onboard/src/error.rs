/// Step of the provisioning flow an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Discovery,
    Pairing,
    CredentialTransfer,
    Handoff,
    Registration,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Step::Discovery => "discovery",
            Step::Pairing => "pairing",
            Step::CredentialTransfer => "credential transfer",
            Step::Handoff => "handoff",
            Step::Registration => "registration",
        };
        f.write_str(s)
    }
}

/// Caller-visible failure of a provisioning attempt.
///
/// All of these end the current session; none is retried internally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionError {
    #[error("radio transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("could not open a secure session: {0}")]
    PairingFailed(String),
    #[error("device rejected the credentials: {0}")]
    CredentialRejected(String),
    #[error("device not reachable on the local network: {0}")]
    HandoffUnreachable(String),
    #[error("device answered the handoff with status {status}")]
    HandoffRejected { status: u16 },
    #[error("malformed handoff response: {0}")]
    HandoffMalformed(String),
    #[error("registering {device_identifier} failed: {reason}")]
    RegistrationFailed { device_identifier: String, reason: String },
    #[error("a provisioning attempt for {device} is already in flight")]
    ConcurrentAttemptRejected { device: String },
    /// Misuse of the operation surface. Never changes the session state.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The task running the attempt was torn down, e.g. at runtime shutdown
    #[error("provisioning task stopped: {0}")]
    Interrupted(String),
}

impl ProvisionError {
    pub fn step(&self) -> Option<Step> {
        match self {
            ProvisionError::TransportUnavailable(_) => Some(Step::Discovery),
            ProvisionError::PairingFailed(_) => Some(Step::Pairing),
            ProvisionError::CredentialRejected(_) => Some(Step::CredentialTransfer),
            ProvisionError::HandoffUnreachable(_)
            | ProvisionError::HandoffRejected { .. }
            | ProvisionError::HandoffMalformed(_) => Some(Step::Handoff),
            ProvisionError::RegistrationFailed { .. } => Some(Step::Registration),
            ProvisionError::ConcurrentAttemptRejected { .. }
            | ProvisionError::InvalidRequest(_)
            | ProvisionError::Interrupted(_) => None,
        }
    }

    /// The device identifier to pass to `retry_registration`, when this
    /// failure can be resumed without pairing again
    pub fn resumable_device(&self) -> Option<&str> {
        match self {
            ProvisionError::RegistrationFailed { device_identifier, .. } => Some(device_identifier),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Radio off, permission denied, no adapter
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("connect failed: {0}")]
    Connect(String),
    /// The device answered a transfer with an error status
    #[error("device rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum HandoffError {
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid registry key: {0:?}")]
    InvalidKey(String),
    #[error("registry answered with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("registry request failed: {0}")]
    Network(String),
    #[error("could not decode registry data: {0}")]
    Decode(String),
    #[error("subscription closed: {0}")]
    Closed(String),
}

impl From<HandoffError> for ProvisionError {
    fn from(e: HandoffError) -> Self {
        match e {
            HandoffError::Unreachable(m) => ProvisionError::HandoffUnreachable(m),
            HandoffError::Rejected { status, .. } => ProvisionError::HandoffRejected { status },
            HandoffError::Malformed(m) => ProvisionError::HandoffMalformed(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_flow_failure_names_its_step() {
        assert_eq!(
            ProvisionError::TransportUnavailable("radio off".into()).step(),
            Some(Step::Discovery)
        );
        assert_eq!(ProvisionError::HandoffRejected { status: 500 }.step(), Some(Step::Handoff));
        assert_eq!(ProvisionError::InvalidRequest("x".into()).step(), None);
    }

    #[test]
    fn only_registration_failures_are_resumable() {
        let e = ProvisionError::RegistrationFailed {
            device_identifier: "esp32-9F3A".into(),
            reason: "offline".into(),
        };
        assert_eq!(e.resumable_device(), Some("esp32-9F3A"));
        assert_eq!(ProvisionError::PairingFailed("busy".into()).resumable_device(), None);
    }

    #[test]
    fn handoff_errors_map_one_to_one() {
        let e: ProvisionError = HandoffError::Rejected { status: 404, body: String::new() }.into();
        assert_eq!(e, ProvisionError::HandoffRejected { status: 404 });

        let e: ProvisionError = HandoffError::Malformed("no deviceId".into()).into();
        assert!(matches!(e, ProvisionError::HandoffMalformed(_)));
    }
}
