use std::fmt;

use crate::error::CoreError;

/// Lifecycle states of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    /// Created; looking up candidate paths.
    Query,
    /// Candidate paths known and being evaluated.
    Advert,
    /// A path was chosen and per-hop capacity reserved.
    Select,
    /// HTLCs are being established hop by hop.
    Locked,
    /// Every hop is locked; waiting on the delivery layer.
    Serve,
    /// Preimage revealed; hops are being released.
    Proof,
    /// Terminal success.
    Settle,
    /// Terminal failure.
    Abort,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Settle | Self::Abort)
    }

    /// The payer may still cancel: locking has not completed.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            Self::Query | Self::Advert | Self::Select | Self::Locked
        )
    }

    /// True once any HTLC can have been committed to the payee.
    pub fn funds_committed(&self) -> bool {
        matches!(self, Self::Serve | Self::Proof)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query => write!(f, "QUERY"),
            Self::Advert => write!(f, "ADVERT"),
            Self::Select => write!(f, "SELECT"),
            Self::Locked => write!(f, "LOCKED"),
            Self::Serve => write!(f, "SERVE"),
            Self::Proof => write!(f, "PROOF"),
            Self::Settle => write!(f, "SETTLE"),
            Self::Abort => write!(f, "ABORT"),
        }
    }
}

/// Events that drive [`TransactionState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEvent {
    CandidatesFound,
    PathSelected,
    /// Reservation or downstream selection failed; try another candidate.
    SelectionFailed,
    LockingStarted,
    AllHopsLocked,
    DeliveryConfirmed,
    AllHopsSettled,
    Abort,
}

impl fmt::Display for TransactionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Transaction state transitions.
///
/// Valid transitions:
/// - Query → Advert (CandidatesFound)
/// - Advert → Select (PathSelected)
/// - Select → Advert (SelectionFailed)
/// - Select → Locked (LockingStarted)
/// - Locked → Serve (AllHopsLocked)
/// - Serve → Proof (DeliveryConfirmed)
/// - Proof → Settle (AllHopsSettled)
/// - any non-terminal → Abort (Abort)
pub struct TransactionStateMachine;

impl TransactionStateMachine {
    pub fn transition(
        current: TransactionState,
        event: TransactionEvent,
    ) -> Result<TransactionState, CoreError> {
        use TransactionEvent as E;
        use TransactionState as S;

        let next = match (current, event) {
            (S::Query, E::CandidatesFound) => S::Advert,
            (S::Advert, E::PathSelected) => S::Select,
            (S::Select, E::SelectionFailed) => S::Advert,
            (S::Select, E::LockingStarted) => S::Locked,
            (S::Locked, E::AllHopsLocked) => S::Serve,
            (S::Serve, E::DeliveryConfirmed) => S::Proof,
            (S::Proof, E::AllHopsSettled) => S::Settle,
            (s, E::Abort) if !s.is_terminal() => S::Abort,
            _ => {
                return Err(CoreError::InvalidStateTransition {
                    from: current,
                    event: event.to_string(),
                })
            }
        };

        tracing::debug!(from = %current, to = %next, event = %event, "transaction state transition");
        Ok(next)
    }

    pub fn can_transition(current: TransactionState, event: TransactionEvent) -> bool {
        Self::transition(current, event).is_ok()
    }
}
