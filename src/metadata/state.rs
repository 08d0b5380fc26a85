//! Item lifecycle state machine (§3.3).

use crate::error::Error;

/// Lifecycle state of a durable metadata entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum LifecycleState {
    Ghost,
    Hydrating,
    Hydrated,
    DirtyLocal,
    Conflict,
    Error,
}

impl LifecycleState {
    fn name(self) -> &'static str {
        match self {
            LifecycleState::Ghost => "GHOST",
            LifecycleState::Hydrating => "HYDRATING",
            LifecycleState::Hydrated => "HYDRATED",
            LifecycleState::DirtyLocal => "DIRTY_LOCAL",
            LifecycleState::Conflict => "CONFLICT",
            LifecycleState::Error => "ERROR",
        }
    }
}

/// Validates a proposed transition against the table in spec §3.3.
///
/// `Any -> ERROR` and `ERROR -> GHOST` are allowed unconditionally (terminal
/// failure / manual retry); all other edges must appear explicitly below.
pub fn validate_transition(from: LifecycleState, to: LifecycleState) -> Result<(), Error> {
    use LifecycleState::*;

    let allowed = match (from, to) {
        (_, Error) => true,
        (Error, Ghost) => true,
        (Ghost, Hydrating) => true,
        (Hydrating, Hydrated) => true,
        (Hydrating, Ghost) => true,
        (Hydrated, DirtyLocal) => true,
        (Hydrated, Ghost) => true,
        (DirtyLocal, Hydrated) => true,
        (DirtyLocal, Conflict) => true,
        (Conflict, Hydrated) => true,
        (same_from, same_to) if same_from == same_to => true,
        _ => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(Error::IllegalStateTransition {
            from: from.name().to_string(),
            to: to.name().to_string(),
        })
    }
}
