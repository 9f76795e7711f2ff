//! Connect attempt state machine

use crate::error::ErrorClass;
use crate::{Error, Result};
use std::fmt;

/// Progress of one `connect` call
///
/// Only `Ready` is ever observed by callers; a fresh call always starts at `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// Nothing done yet
    Idle,
    /// Credential source being resolved
    ResolvingCredential,
    /// Dial + login + ping, possibly retried
    Dialing {
        /// 1-based attempt number
        attempt: u32,
    },
    /// Logged in and pinged
    Connected,
    /// Session SQL mode fixed
    SessionNormalized,
    /// Version and flavor known
    VersionProbed,
    /// Handed to the caller
    Ready,
    /// Terminal failure
    Failed(ErrorClass),
}

impl AttemptState {
    /// Check if transition is valid
    pub fn can_transition_to(&self, next: AttemptState) -> bool {
        use AttemptState::*;

        match (self, next) {
            (Idle, ResolvingCredential) => true,
            (ResolvingCredential, Dialing { attempt: 1 }) => true,
            (Dialing { attempt }, Dialing { attempt: next }) => next == attempt + 1,
            (Dialing { .. }, Connected) => true,
            (Connected, SessionNormalized) => true,
            (SessionNormalized, VersionProbed) => true,
            (VersionProbed, Ready) => true,
            (Ready, _) | (Failed(_), _) => false,
            (_, Failed(_)) => true,
            _ => false,
        }
    }

    /// Transition to new state
    pub fn transition(&mut self, next: AttemptState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidState {
                expected: format!("valid transition from {}", self),
                actual: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }

    /// Current attempt number while dialing
    pub fn attempt(&self) -> Option<u32> {
        match self {
            AttemptState::Dialing { attempt } => Some(*attempt),
            _ => None,
        }
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::ResolvingCredential => write!(f, "resolving_credential"),
            Self::Dialing { attempt } => write!(f, "dialing(attempt {})", attempt),
            Self::Connected => write!(f, "connected"),
            Self::SessionNormalized => write!(f, "session_normalized"),
            Self::VersionProbed => write!(f, "version_probed"),
            Self::Ready => write!(f, "ready"),
            Self::Failed(class) => write!(f, "failed({})", class),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = AttemptState::Idle;
        for next in [
            AttemptState::ResolvingCredential,
            AttemptState::Dialing { attempt: 1 },
            AttemptState::Dialing { attempt: 2 },
            AttemptState::Connected,
            AttemptState::SessionNormalized,
            AttemptState::VersionProbed,
            AttemptState::Ready,
        ] {
            state.transition(next).unwrap();
        }
        assert_eq!(state, AttemptState::Ready);
    }

    #[test]
    fn test_attempts_must_be_sequential() {
        let mut state = AttemptState::Dialing { attempt: 1 };
        assert!(state.transition(AttemptState::Dialing { attempt: 3 }).is_err());
        assert_eq!(state.attempt(), Some(1));
    }

    #[test]
    fn test_cannot_skip_normalization() {
        let mut state = AttemptState::Connected;
        assert!(state.transition(AttemptState::VersionProbed).is_err());
    }

    #[test]
    fn test_failure_is_terminal() {
        let mut state = AttemptState::ResolvingCredential;
        state
            .transition(AttemptState::Failed(ErrorClass::Auth))
            .unwrap();
        assert!(state
            .transition(AttemptState::Dialing { attempt: 1 })
            .is_err());
        assert!(!AttemptState::Ready.can_transition_to(AttemptState::Failed(ErrorClass::Config)));
    }
}
