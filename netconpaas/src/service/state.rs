use std::fmt::Display;

use crate::{
    entity::state::LifecycleState,
    error::{Error, Result},
};

/// Observations that move a service through its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    AddressResolved,
    /// A status fetch listed nodes; `complete` when every required role is filled
    NodesReported { complete: bool },
    FetchFailed,
    TerminateRequested,
    ShutdownConfirmed,
    ShutdownTimedOut,
    ManagerMoved,
    Unrecoverable,
    Recover,
}

impl Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleEvent::AddressResolved => write!(f, "address resolved"),
            LifecycleEvent::NodesReported { complete } => {
                write!(f, "nodes reported (complete: {complete})")
            }
            LifecycleEvent::FetchFailed => write!(f, "fetch failed"),
            LifecycleEvent::TerminateRequested => write!(f, "terminate requested"),
            LifecycleEvent::ShutdownConfirmed => write!(f, "shutdown confirmed"),
            LifecycleEvent::ShutdownTimedOut => write!(f, "shutdown timed out"),
            LifecycleEvent::ManagerMoved => write!(f, "manager moved"),
            LifecycleEvent::Unrecoverable => write!(f, "unrecoverable error"),
            LifecycleEvent::Recover => write!(f, "recover"),
        }
    }
}

/// Next lifecycle state for `event`, without side effects.
///
/// Applying an event to the state it produced is a no-op, so two pollers
/// observing the same remote fact cannot push the service past where it
/// belongs. Late status reports never resurrect a stopping or failed service.
pub fn transition(from: LifecycleState, event: LifecycleEvent) -> Result<LifecycleState> {
    use LifecycleEvent as E;
    use LifecycleState as S;

    let invalid = || Error::InvalidTransition {
        from,
        event: event.to_string(),
    };
    match (from, event) {
        (_, E::ManagerMoved) => Ok(S::Init),
        (_, E::Unrecoverable) => Ok(S::Error),

        (S::Init, E::AddressResolved) => Ok(S::Starting),
        (state, E::AddressResolved) => Ok(state),

        (S::Init, E::NodesReported { .. }) => Err(invalid()),
        (S::Starting, E::NodesReported { complete: true }) => Ok(S::Running),
        (S::Starting, E::NodesReported { complete: false }) => Ok(S::Starting),
        (state, E::NodesReported { .. }) => Ok(state),

        (state, E::FetchFailed) => Ok(state),

        (S::Stopped, E::TerminateRequested) => {
            Err(Error::Conflict("service is already stopped".to_string()))
        }
        (_, E::TerminateRequested) => Ok(S::Stopping),

        (S::Stopping | S::Stopped, E::ShutdownConfirmed | E::ShutdownTimedOut) => Ok(S::Stopped),
        (_, E::ShutdownConfirmed | E::ShutdownTimedOut) => Err(invalid()),

        (S::Error | S::Init, E::Recover) => Ok(S::Init),
        (_, E::Recover) => Err(invalid()),
    }
}
