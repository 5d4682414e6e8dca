//! Transfer lifecycle.
//!
//! ```text
//! draft --initialized--> to_sign --sent--> sent --confirmed--> confirmed
//!   |                       |               |
//!   +------abandoned--------+               +--declined--> declined
//! ```
//!
//! Operations invoked in a state that does not allow them are silent
//! no-ops, so an external scheduler can retry them blindly.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Draft,
    ToSign,
    Sent,
    Confirmed,
    Declined,
}

/// Events that move a transfer between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Documents encrypted, chunked and unsigned metadata rendered.
    Initialized,
    /// Every part uploaded and the upload finalized.
    Sent,
    PollConfirmed,
    PollDeclined,
    PollInProgress,
    Abandoned,
}

impl TransferState {
    pub const ALL: [TransferState; 5] = [
        Self::Draft,
        Self::ToSign,
        Self::Sent,
        Self::Confirmed,
        Self::Declined,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::ToSign => "to_sign",
            Self::Sent => "sent",
            Self::Confirmed => "confirmed",
            Self::Declined => "declined",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Draft => "Draft",
            Self::ToSign => "To Sign",
            Self::Sent => "Sent to IRS",
            Self::Confirmed => "Confirmed",
            Self::Declined => "Declined",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Declined)
    }

    pub fn can_initialize(&self) -> bool {
        *self == Self::Draft
    }

    pub fn can_send(&self) -> bool {
        *self == Self::ToSign
    }

    pub fn can_poll(&self) -> bool {
        *self == Self::Sent
    }

    pub fn can_abandon(&self) -> bool {
        matches!(self, Self::Draft | Self::ToSign)
    }

    pub fn can_delete(&self) -> bool {
        *self == Self::Declined
    }

    pub fn can_archive(&self) -> bool {
        self.is_terminal()
    }

    /// Target state for `event`, or `None` when the event is not legal here.
    pub fn next(self, event: Transition) -> Option<Self> {
        use TransferState as S;
        use Transition as T;

        match (self, event) {
            (S::Draft, T::Initialized) => Some(S::ToSign),
            (S::ToSign, T::Sent) => Some(S::Sent),
            (S::Sent, T::PollConfirmed) => Some(S::Confirmed),
            (S::Sent, T::PollDeclined) => Some(S::Declined),
            (S::Sent, T::PollInProgress) => Some(S::Sent),
            (S::Draft | S::ToSign, T::Abandoned) => Some(S::Declined),
            _ => None,
        }
    }
}

impl FromStr for TransferState {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "to_sign" => Ok(Self::ToSign),
            "sent" => Ok(Self::Sent),
            "confirmed" => Ok(Self::Confirmed),
            "declined" => Ok(Self::Declined),
            _ => Err(TransferError::validation(format!("unknown transfer state '{s}'"))),
        }
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_str() {
        for state in TransferState::ALL {
            assert_eq!(state.as_str().parse::<TransferState>().unwrap(), state);
        }
        let err = "archived".parse::<TransferState>().unwrap_err();
        assert_eq!(err.to_string(), "unknown transfer state 'archived'");
    }

    #[test]
    fn happy_path_transitions() {
        let state = TransferState::Draft;
        let state = state.next(Transition::Initialized).unwrap();
        assert_eq!(state, TransferState::ToSign);
        let state = state.next(Transition::Sent).unwrap();
        assert_eq!(state, TransferState::Sent);
        assert_eq!(
            state.next(Transition::PollInProgress),
            Some(TransferState::Sent)
        );
        assert_eq!(
            state.next(Transition::PollConfirmed),
            Some(TransferState::Confirmed)
        );
        assert_eq!(
            state.next(Transition::PollDeclined),
            Some(TransferState::Declined)
        );
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for state in [TransferState::Confirmed, TransferState::Declined] {
            for event in [
                Transition::Initialized,
                Transition::Sent,
                Transition::PollConfirmed,
                Transition::PollDeclined,
                Transition::PollInProgress,
                Transition::Abandoned,
            ] {
                assert_eq!(state.next(event), None, "{state} accepted {event:?}");
            }
        }
    }

    #[test]
    fn abandon_only_before_sending() {
        assert_eq!(
            TransferState::Draft.next(Transition::Abandoned),
            Some(TransferState::Declined)
        );
        assert_eq!(
            TransferState::ToSign.next(Transition::Abandoned),
            Some(TransferState::Declined)
        );
        assert_eq!(TransferState::Sent.next(Transition::Abandoned), None);
    }

    #[test]
    fn gates() {
        assert!(TransferState::Draft.can_initialize());
        assert!(!TransferState::ToSign.can_initialize());
        assert!(TransferState::ToSign.can_send());
        assert!(!TransferState::Sent.can_send());
        assert!(TransferState::Sent.can_poll());
        assert!(!TransferState::Confirmed.can_poll());
        assert!(TransferState::Declined.can_delete());
        assert!(!TransferState::Sent.can_delete());
        assert!(TransferState::Confirmed.can_archive());
        assert!(!TransferState::Draft.can_archive());
    }
}
