//! Engine lifecycle states

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Lifecycle of one engine instance.
///
/// ```text
/// STARTING -> RUNNING -> STOPPING -> STOPPED
///                |           |
///                +-> ERRORED <+-> STOPPED
///                +----------------> STOPPED   (lock lost)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Errored,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
            EngineState::Stopped => "stopped",
            EngineState::Errored => "errored",
        }
    }

    pub fn can_transition(&self, to: EngineState) -> bool {
        use EngineState::*;
        matches!(
            (self, to),
            (Starting, Running)
                | (Starting, Errored)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Running, Errored)
                | (Running, Stopped)
                | (Stopping, Stopped)
                | (Stopping, Errored)
                | (Errored, Stopped)
        )
    }

    /// Validated transition
    pub fn transition(self, to: EngineState) -> Result<EngineState> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(Error::InvalidTransition { from: self, to })
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "starting" => Ok(EngineState::Starting),
            "running" => Ok(EngineState::Running),
            "stopping" => Ok(EngineState::Stopping),
            "stopped" => Ok(EngineState::Stopped),
            "errored" => Ok(EngineState::Errored),
            other => Err(format!("unknown engine state {:?}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let s = EngineState::Starting;
        let s = s.transition(EngineState::Running).unwrap();
        let s = s.transition(EngineState::Stopping).unwrap();
        let s = s.transition(EngineState::Stopped).unwrap();
        assert_eq!(s, EngineState::Stopped);
    }

    #[test]
    fn test_error_and_lock_loss_paths() {
        assert!(EngineState::Running.can_transition(EngineState::Errored));
        assert!(EngineState::Errored.can_transition(EngineState::Stopped));
        assert!(EngineState::Running.can_transition(EngineState::Stopped));
    }

    #[test]
    fn test_rejected_transitions() {
        assert!(matches!(
            EngineState::Stopped.transition(EngineState::Running),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(EngineState::Errored.transition(EngineState::Running).is_err());
        assert!(EngineState::Stopping.transition(EngineState::Running).is_err());
    }

    #[test]
    fn test_string_round_trip() {
        for state in [
            EngineState::Starting,
            EngineState::Running,
            EngineState::Stopping,
            EngineState::Stopped,
            EngineState::Errored,
        ] {
            assert_eq!(state.as_str().parse::<EngineState>().unwrap(), state);
        }
        assert!("paused".parse::<EngineState>().is_err());
    }
}
