use tgp_core::{CoreError, DomainId, TransactionId, TransactionState};

/// Errors reported by a ledger backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient funds in {account}: available {available}, required {required}")]
    InsufficientFunds {
        account: String,
        available: i128,
        required: u64,
    },

    #[error("no hold for transaction {transaction_id} hop {hop}")]
    HoldNotFound {
        transaction_id: TransactionId,
        hop: u32,
    },

    #[error("hold already exists for transaction {transaction_id} hop {hop}")]
    DuplicateHold {
        transaction_id: TransactionId,
        hop: u32,
    },

    #[error("ledger rejected operation: {0}")]
    Rejected(String),
}

/// Settlement-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("transaction not found: {0}")]
    NotFound(TransactionId),

    #[error("transaction already exists: {0}")]
    AlreadyExists(TransactionId),

    #[error("HTLC not found: transaction {transaction_id} hop {hop}")]
    HtlcNotFound {
        transaction_id: TransactionId,
        hop: u32,
    },

    #[error("an active HTLC already exists for transaction {transaction_id} hop {hop}")]
    DuplicateHtlc {
        transaction_id: TransactionId,
        hop: u32,
    },

    #[error("cannot {op} HTLC {transaction_id}/{hop} in status {status}")]
    InvalidHtlcState {
        transaction_id: TransactionId,
        hop: u32,
        status: String,
        op: &'static str,
    },

    #[error("preimage does not match hash commitment for {0}")]
    PreimageMismatch(TransactionId),

    #[error("HTLC {transaction_id}/{hop} expired")]
    Expired {
        transaction_id: TransactionId,
        hop: u32,
    },

    #[error("HTLC {transaction_id}/{hop} has not expired yet")]
    NotExpired {
        transaction_id: TransactionId,
        hop: u32,
    },

    #[error("timeout ordering violated at hop {hop}: {reason}")]
    TimeoutOrdering { hop: u32, reason: String },

    #[error("deadline too close for a {hops}-hop path")]
    DeadlineTooClose { hops: usize },

    #[error("amount {amount} does not cover relay fees {fees}")]
    FeesExceedAmount { amount: u64, fees: u64 },

    #[error("capacity exhausted at hop {hop}: {source}")]
    CapacityExhausted {
        hop: u32,
        #[source]
        source: LedgerError,
    },

    #[error("no route to {0}")]
    NoRoute(DomainId),

    #[error("no acceptable path for {transaction_id}")]
    NoAcceptablePath {
        transaction_id: TransactionId,
        /// Code and reason of the last policy rejection, if any.
        rejection: Option<(String, String)>,
    },

    #[error("transaction {transaction_id} cannot be cancelled in state {state}")]
    CancellationForbidden {
        transaction_id: TransactionId,
        state: TransactionState,
    },

    #[error("settlement inconsistency for {transaction_id}: hops {hops:?} failed to release after preimage reveal")]
    Inconsistent {
        transaction_id: TransactionId,
        hops: Vec<u32>,
    },

    #[error("unexpected {kind} for {transaction_id} in state {state}")]
    UnexpectedMessage {
        transaction_id: TransactionId,
        kind: &'static str,
        state: TransactionState,
    },

    #[error("invalid gateway path: {0}")]
    InvalidPath(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Core(#[from] CoreError),
}
