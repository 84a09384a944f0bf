use tgp_core::{CoreError, TransactionId, TransactionState};
use tgp_routing::RoutingError;
use tgp_settlement::SettlementError;

/// Errors surfaced by the gateway core.
///
/// The first five variants are the protocol's failure taxonomy; callers
/// decide on retries with [`GatewayError::is_recoverable`].
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed or unexpected message. The delivering session is reset.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("policy rejection [{code}]: {reason}")]
    PolicyRejection { code: String, reason: String },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// Preimage revealed but a hop could not move its funds. Needs an
    /// operator; never retried automatically.
    #[error("settlement inconsistency for {transaction_id}: {detail}")]
    SettlementInconsistency {
        transaction_id: TransactionId,
        detail: String,
    },

    #[error("no route to {0}")]
    NoRoute(String),

    #[error("transaction not found: {0}")]
    NotFound(TransactionId),

    #[error("transaction {transaction_id} cannot be cancelled in state {state}")]
    CancellationForbidden {
        transaction_id: TransactionId,
        state: TransactionState,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::SettlementInconsistency { .. })
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

impl From<SettlementError> for GatewayError {
    fn from(err: SettlementError) -> Self {
        match err {
            SettlementError::NotFound(id) => Self::NotFound(id),
            SettlementError::NoRoute(domain) => Self::NoRoute(domain.to_string()),
            SettlementError::NoAcceptablePath {
                transaction_id,
                rejection,
            } => match rejection {
                Some((code, reason)) if code == "CAPACITY_EXHAUSTED" => {
                    Self::CapacityExhausted(reason)
                }
                Some((code, reason)) => Self::PolicyRejection { code, reason },
                None => Self::PolicyRejection {
                    code: "NO_ACCEPTABLE_PATH".into(),
                    reason: format!("no acceptable path for {}", transaction_id),
                },
            },
            e @ SettlementError::CapacityExhausted { .. } => Self::CapacityExhausted(e.to_string()),
            SettlementError::Inconsistent {
                transaction_id,
                hops,
            } => Self::SettlementInconsistency {
                transaction_id,
                detail: format!("hops {:?} failed to settle", hops),
            },
            SettlementError::CancellationForbidden {
                transaction_id,
                state,
            } => Self::CancellationForbidden {
                transaction_id,
                state,
            },
            e @ (SettlementError::Expired { .. }
            | SettlementError::DeadlineTooClose { .. }
            | SettlementError::TimeoutOrdering { .. }) => Self::Timeout(e.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<RoutingError> for GatewayError {
    fn from(err: RoutingError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<CoreError> for GatewayError {
    fn from(err: CoreError) -> Self {
        Self::Protocol(err.to_string())
    }
}
