//! TGP Settlement Layer
//!
//! Atomic multi-hop settlement over hashed time-locked contracts: the
//! ledger backend seam, an in-memory double-entry ledger, the per-hop HTLC
//! arena, the decreasing timeout schedule, and the payer-side transaction
//! manager.

pub mod adapters;
pub mod config;
pub mod error;
pub mod htlc;
pub mod manager;
pub mod timeout;
pub mod traits;
pub mod types;

pub use adapters::InternalLedger;
pub use config::{HtlcConfig, LockOrder};
pub use error::{LedgerError, SettlementError};
pub use htlc::{Htlc, HtlcArena, HtlcStatus};
pub use manager::{HtlcManager, ProofOutcome, SweepReport};
pub use traits::LedgerBackend;
pub use types::{CandidatePath, HopPlan, HopRef, TransactionRecord};
