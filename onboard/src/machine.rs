//! Provisioning state machine
//!
//! [`step`] is a pure function: it consumes the current state and one
//! completed result, and returns the new state plus the next thing the
//! driver has to do. It knows nothing about radios, HTTP or threads, so the
//! same table works for the async [`crate::Orchestrator`] or a blocking
//! driver.
//!
//! ```text
//! Idle -> Scanning -> DeviceSelected -> Pairing -> CredentialSent
//!      -> AwaitingNetworkJoin -> HandoffRequested -> Registering -> Completed
//!
//! any non-terminal state -> Failed(reason)
//! ```

use crate::ProvisionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningState {
    Idle,
    Scanning,
    DeviceSelected,
    Pairing,
    CredentialSent,
    AwaitingNetworkJoin,
    HandoffRequested,
    Registering,
    Completed,
    Failed(ProvisionError),
}

impl ProvisioningState {
    pub fn name(&self) -> &'static str {
        match self {
            ProvisioningState::Idle => "Idle",
            ProvisioningState::Scanning => "Scanning",
            ProvisioningState::DeviceSelected => "DeviceSelected",
            ProvisioningState::Pairing => "Pairing",
            ProvisioningState::CredentialSent => "CredentialSent",
            ProvisioningState::AwaitingNetworkJoin => "AwaitingNetworkJoin",
            ProvisioningState::HandoffRequested => "HandoffRequested",
            ProvisioningState::Registering => "Registering",
            ProvisioningState::Completed => "Completed",
            ProvisioningState::Failed(_) => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProvisioningState::Completed | ProvisioningState::Failed(_))
    }

    /// States from which a new attempt may start
    pub fn is_ready(&self) -> bool {
        matches!(self, ProvisioningState::Idle) || self.is_terminal()
    }

    /// Past `DeviceSelected` and not yet terminal
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ProvisioningState::Pairing
                | ProvisioningState::CredentialSent
                | ProvisioningState::AwaitingNetworkJoin
                | ProvisioningState::HandoffRequested
                | ProvisioningState::Registering
        )
    }
}

impl std::fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisioningState::Failed(e) => write!(f, "Failed({e})"),
            s => f.write_str(s.name()),
        }
    }
}

/// A request from the caller or the result of a completed action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ScanRequested,
    /// Discovery returned; `Ok` carries the number of devices found
    ScanFinished(Result<usize, ProvisionError>),
    DeviceChosen,
    CredentialsSubmitted,
    SessionOpened(Result<(), ProvisionError>),
    CredentialsTransferred(Result<(), ProvisionError>),
    SessionClosed,
    JoinWaitElapsed,
    /// `Ok` carries the device identifier from the handoff response
    HandoffFinished(Result<String, ProvisionError>),
    /// Resume at registration with an already-known identifier
    RegistrationRequested { device_identifier: String },
    RegistrationFinished(Result<(), ProvisionError>),
    CancelRequested,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::ScanRequested => "ScanRequested",
            Event::ScanFinished(_) => "ScanFinished",
            Event::DeviceChosen => "DeviceChosen",
            Event::CredentialsSubmitted => "CredentialsSubmitted",
            Event::SessionOpened(_) => "SessionOpened",
            Event::CredentialsTransferred(_) => "CredentialsTransferred",
            Event::SessionClosed => "SessionClosed",
            Event::JoinWaitElapsed => "JoinWaitElapsed",
            Event::HandoffFinished(_) => "HandoffFinished",
            Event::RegistrationRequested { .. } => "RegistrationRequested",
            Event::RegistrationFinished(_) => "RegistrationFinished",
            Event::CancelRequested => "CancelRequested",
        }
    }
}

/// What the driver must do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Discover,
    AwaitSelection,
    AwaitCredentials,
    OpenSession,
    SendCredentials,
    CloseSession,
    AwaitNetworkJoin,
    RequestHandoff,
    Register { device_identifier: String },
    /// Nothing left to do; surface the state to the caller
    Report,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: ProvisioningState,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{event} is not accepted in state {state}")]
pub struct Rejected {
    pub state: &'static str,
    pub event: &'static str,
}

fn to(state: ProvisioningState, action: Action) -> Result<Transition, Rejected> {
    Ok(Transition { state, action })
}

pub fn step(state: &ProvisioningState, event: Event) -> Result<Transition, Rejected> {
    use Action as A;
    use ProvisioningState as S;

    match (state, event) {
        (s, Event::ScanRequested) if s.is_ready() => to(S::Scanning, A::Discover),

        (S::Scanning, Event::ScanFinished(Ok(0))) => to(S::Idle, A::Report),
        (S::Scanning, Event::ScanFinished(Ok(_))) => to(S::Scanning, A::AwaitSelection),
        (S::Scanning, Event::ScanFinished(Err(e))) => to(S::Failed(e), A::Report),

        (S::Scanning | S::DeviceSelected, Event::DeviceChosen) => {
            to(S::DeviceSelected, A::AwaitCredentials)
        }
        (S::DeviceSelected, Event::CredentialsSubmitted) => to(S::Pairing, A::OpenSession),

        (S::Pairing, Event::SessionOpened(Ok(()))) => to(S::Pairing, A::SendCredentials),
        // a half-open link may still be held by the radio
        (S::Pairing, Event::SessionOpened(Err(e))) => to(S::Failed(e), A::CloseSession),
        (S::Pairing, Event::CredentialsTransferred(Ok(()))) => {
            to(S::CredentialSent, A::CloseSession)
        }
        (S::Pairing, Event::CredentialsTransferred(Err(e))) => to(S::Failed(e), A::CloseSession),

        (S::CredentialSent, Event::SessionClosed) => {
            to(S::AwaitingNetworkJoin, A::AwaitNetworkJoin)
        }
        // only reachable through cancellation: the link is released first,
        // then the session goes back to Idle
        (S::Pairing, Event::SessionClosed) => to(S::Idle, A::Report),
        (S::Failed(e), Event::SessionClosed) => to(S::Failed(e.clone()), A::Report),

        (S::AwaitingNetworkJoin, Event::JoinWaitElapsed) => {
            to(S::HandoffRequested, A::RequestHandoff)
        }
        (S::HandoffRequested, Event::HandoffFinished(Ok(device_identifier))) => {
            to(S::Registering, A::Register { device_identifier })
        }
        (S::HandoffRequested, Event::HandoffFinished(Err(e))) => to(S::Failed(e), A::Report),

        (s, Event::RegistrationRequested { device_identifier }) if s.is_ready() => {
            to(S::Registering, A::Register { device_identifier })
        }
        (S::Registering, Event::RegistrationFinished(Ok(()))) => to(S::Completed, A::Report),
        (S::Registering, Event::RegistrationFinished(Err(e))) => to(S::Failed(e), A::Report),

        (S::Idle | S::Scanning | S::DeviceSelected, Event::CancelRequested) => {
            to(S::Idle, A::Report)
        }
        (S::Pairing, Event::CancelRequested) => to(S::Pairing, A::CloseSession),

        (s, e) => Err(Rejected { state: s.name(), event: e.name() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(mut state: ProvisioningState, events: Vec<Event>) -> (ProvisioningState, Action) {
        let mut action = Action::Report;
        for event in events {
            let t = step(&state, event).unwrap();
            state = t.state;
            action = t.action;
        }
        (state, action)
    }

    #[test]
    fn happy_path_reaches_completed() {
        let (state, action) = run(
            ProvisioningState::Idle,
            vec![
                Event::ScanRequested,
                Event::ScanFinished(Ok(2)),
                Event::DeviceChosen,
                Event::CredentialsSubmitted,
                Event::SessionOpened(Ok(())),
                Event::CredentialsTransferred(Ok(())),
                Event::SessionClosed,
                Event::JoinWaitElapsed,
                Event::HandoffFinished(Ok("esp32-9F3A".into())),
            ],
        );
        assert_eq!(state, ProvisioningState::Registering);
        assert_eq!(action, Action::Register { device_identifier: "esp32-9F3A".into() });

        let t = step(&state, Event::RegistrationFinished(Ok(()))).unwrap();
        assert_eq!(t.state, ProvisioningState::Completed);
        assert_eq!(t.action, Action::Report);
    }

    #[test]
    fn empty_scan_returns_to_idle() {
        let (state, action) =
            run(ProvisioningState::Idle, vec![Event::ScanRequested, Event::ScanFinished(Ok(0))]);
        assert_eq!(state, ProvisioningState::Idle);
        assert_eq!(action, Action::Report);
    }

    #[test]
    fn credential_transfer_happens_once() {
        let t = step(&ProvisioningState::Pairing, Event::SessionOpened(Ok(()))).unwrap();
        assert_eq!(t.action, Action::SendCredentials);

        let t = step(&t.state, Event::CredentialsTransferred(Ok(()))).unwrap();
        assert_eq!(t.state, ProvisioningState::CredentialSent);
        assert_eq!(t.action, Action::CloseSession);

        // a second transfer result after the state moved on is refused
        assert!(step(&t.state, Event::CredentialsTransferred(Ok(()))).is_err());
    }

    #[test]
    fn pairing_failure_releases_the_link_then_fails() {
        let err = ProvisionError::PairingFailed("wrong proof".into());
        let t = step(&ProvisioningState::Pairing, Event::SessionOpened(Err(err.clone()))).unwrap();
        assert_eq!(t.state, ProvisioningState::Failed(err.clone()));
        assert_eq!(t.action, Action::CloseSession);

        let t = step(&t.state, Event::SessionClosed).unwrap();
        assert_eq!(t.state, ProvisioningState::Failed(err));
        assert_eq!(t.action, Action::Report);
    }

    #[test]
    fn cancel_during_pairing_disconnects_before_idle() {
        let t = step(&ProvisioningState::Pairing, Event::CancelRequested).unwrap();
        assert_eq!(t.state, ProvisioningState::Pairing);
        assert_eq!(t.action, Action::CloseSession);

        let t = step(&t.state, Event::SessionClosed).unwrap();
        assert_eq!(t.state, ProvisioningState::Idle);
    }

    #[test]
    fn cancel_is_refused_once_credentials_are_committed() {
        for state in [
            ProvisioningState::CredentialSent,
            ProvisioningState::AwaitingNetworkJoin,
            ProvisioningState::HandoffRequested,
            ProvisioningState::Registering,
        ] {
            let rejected = step(&state, Event::CancelRequested).unwrap_err();
            assert_eq!(rejected.event, "CancelRequested");
        }
    }

    #[test]
    fn handoff_failure_is_terminal_without_registration() {
        let err = ProvisionError::HandoffMalformed("missing deviceId".into());
        let t = step(&ProvisioningState::HandoffRequested, Event::HandoffFinished(Err(err.clone())))
            .unwrap();
        assert_eq!(t.state, ProvisioningState::Failed(err));
        assert_eq!(t.action, Action::Report);
    }

    #[test]
    fn registration_can_resume_from_failed() {
        let failed = ProvisioningState::Failed(ProvisionError::RegistrationFailed {
            device_identifier: "esp32-9F3A".into(),
            reason: "offline".into(),
        });
        let t = step(
            &failed,
            Event::RegistrationRequested { device_identifier: "esp32-9F3A".into() },
        )
        .unwrap();
        assert_eq!(t.state, ProvisioningState::Registering);
        assert_eq!(t.action, Action::Register { device_identifier: "esp32-9F3A".into() });
    }

    #[test]
    fn new_scan_only_from_ready_states() {
        assert!(step(&ProvisioningState::Completed, Event::ScanRequested).is_ok());
        assert!(step(&ProvisioningState::Pairing, Event::ScanRequested).is_err());
        assert!(step(&ProvisioningState::Scanning, Event::ScanRequested).is_err());
    }

    #[test]
    fn selection_can_change_before_credentials() {
        let t = step(&ProvisioningState::DeviceSelected, Event::DeviceChosen).unwrap();
        assert_eq!(t.state, ProvisioningState::DeviceSelected);

        assert!(step(&ProvisioningState::Pairing, Event::DeviceChosen).is_err());
    }
}
