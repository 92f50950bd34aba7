//! BackendState value object
//! Lifecycle state machine for one supervised proxy-core backend

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a managed backend
///
/// Crashed is not terminal: the supervisor may re-enter Starting per
/// the restart policy. Degraded is terminal until explicit operator
/// action (Start/Restart/Configure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BackendState {
    #[default]
    Stopped,

    Starting,

    Running,

    Stopping,

    /// Unexpected exit while Running; carries the exit code.
    Crashed(i32),

    /// Automatic restart budget exhausted.
    Degraded,
}

impl BackendState {
    /// Check whether a transition to `to` is allowed
    pub fn can_transition_to(&self, to: BackendState) -> bool {
        use BackendState::*;
        matches!(
            (*self, to),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Running, Crashed(_))
                | (Stopping, Stopped)
                | (Crashed(_), Starting)
                | (Crashed(_), Degraded)
                | (Crashed(_), Stopped)
                | (Degraded, Starting)
                | (Degraded, Stopped)
        )
    }

    /// True while an OS process may exist for this backend
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            BackendState::Starting | BackendState::Running | BackendState::Stopping
        )
    }

    pub fn can_start(&self) -> bool {
        matches!(
            self,
            BackendState::Stopped | BackendState::Crashed(_) | BackendState::Degraded
        )
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, BackendState::Starting | BackendState::Running)
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendState::Stopped => write!(f, "stopped"),
            BackendState::Starting => write!(f, "starting"),
            BackendState::Running => write!(f, "running"),
            BackendState::Stopping => write!(f, "stopping"),
            BackendState::Crashed(code) => write!(f, "crashed({code})"),
            BackendState::Degraded => write!(f, "degraded"),
        }
    }
}
