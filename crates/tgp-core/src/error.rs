use crate::state_machine::TransactionState;

/// Core protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid state transition from {from} on {event}")]
    InvalidStateTransition {
        from: TransactionState,
        event: String,
    },

    #[error("message validation failed: {0}")]
    ValidationError(String),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("transaction expired: deadline passed")]
    Expired,

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("routing loop: path {path} contains {domain}")]
    LoopDetected { domain: String, path: String },
}
