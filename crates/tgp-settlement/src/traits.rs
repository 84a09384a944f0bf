use async_trait::async_trait;
use tgp_core::Preimage;

use crate::error::LedgerError;
use crate::types::HopRef;

/// The settlement rail that actually moves value.
///
/// A hop's funds are held by `reserve`, returned by `release`, and moved to
/// the hop's receiving domain by `settle`. `release` on a hop with no hold is
/// a no-op so refunds can be repeated safely.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    async fn reserve(&self, hop: &HopRef, amount: u64) -> Result<(), LedgerError>;

    async fn release(&self, hop: &HopRef) -> Result<(), LedgerError>;

    /// Move the held funds. `proof` is the revealed preimage.
    async fn settle(&self, hop: &HopRef, proof: &Preimage) -> Result<(), LedgerError>;

    /// Return the unique identifier of this backend (e.g. "ledger-internal").
    fn ledger_id(&self) -> &str;
}
