use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tgp_core::{Asset, DomainId, Preimage, TransactionId};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::traits::LedgerBackend;
use crate::types::HopRef;

/// An individual entry in the double-entry journal.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub id: Uuid,
    /// `domain:asset` account key.
    pub account: String,
    /// Positive = credit, negative = debit.
    pub delta: i128,
    pub transaction_id: TransactionId,
    pub hop: u32,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Hold {
    hop: HopRef,
    amount: u64,
}

/// In-memory double-entry ledger.
///
/// Accounts are per (domain, asset). A reservation places a hold that
/// reduces the paying account's available balance; settlement turns the
/// hold into a debit/credit pair. Accounts may go negative down to their
/// credit limit.
pub struct InternalLedger {
    balances: DashMap<String, i128>,
    /// Total held per account.
    held: DashMap<String, u64>,
    holds: DashMap<(TransactionId, u32), Hold>,
    journal: DashMap<Uuid, LedgerEntry>,
    credit_limits: DashMap<String, u64>,
    default_credit_limit: u64,
}

impl InternalLedger {
    pub fn new() -> Self {
        Self {
            balances: DashMap::new(),
            held: DashMap::new(),
            holds: DashMap::new(),
            journal: DashMap::new(),
            credit_limits: DashMap::new(),
            default_credit_limit: 0,
        }
    }

    pub fn with_default_credit_limit(mut self, limit: u64) -> Self {
        self.default_credit_limit = limit;
        self
    }

    fn account(domain: &DomainId, asset: &Asset) -> String {
        format!("{}:{}", domain, asset)
    }

    pub fn deposit(&self, domain: &DomainId, asset: &Asset, amount: u64) {
        *self
            .balances
            .entry(Self::account(domain, asset))
            .or_insert(0) += amount as i128;
    }

    pub fn set_credit_limit(&self, domain: &DomainId, asset: &Asset, limit: u64) {
        self.credit_limits.insert(Self::account(domain, asset), limit);
    }

    pub fn balance(&self, domain: &DomainId, asset: &Asset) -> i128 {
        self.balances
            .get(&Self::account(domain, asset))
            .map(|b| *b)
            .unwrap_or(0)
    }

    pub fn held(&self, domain: &DomainId, asset: &Asset) -> u64 {
        self.held
            .get(&Self::account(domain, asset))
            .map(|h| *h)
            .unwrap_or(0)
    }

    /// Balance plus credit limit minus holds.
    pub fn available(&self, domain: &DomainId, asset: &Asset) -> i128 {
        let key = Self::account(domain, asset);
        let held = self.held.get(&key).map(|h| *h).unwrap_or(0);
        self.available_with(&key, held)
    }

    fn available_with(&self, key: &str, held: u64) -> i128 {
        let balance = self.balances.get(key).map(|b| *b).unwrap_or(0);
        let limit = self
            .credit_limits
            .get(key)
            .map(|l| *l)
            .unwrap_or(self.default_credit_limit);
        balance + limit as i128 - held as i128
    }

    pub fn active_holds(&self) -> usize {
        self.holds.len()
    }

    pub fn journal(&self) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> = self.journal.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    fn record(&self, account: String, delta: i128, hop: &HopRef) {
        let id = Uuid::now_v7();
        self.journal.insert(
            id,
            LedgerEntry {
                id,
                account: account.clone(),
                delta,
                transaction_id: hop.transaction_id,
                hop: hop.hop,
                recorded_at: Utc::now(),
            },
        );
        *self.balances.entry(account).or_insert(0) += delta;
    }
}

impl Default for InternalLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerBackend for InternalLedger {
    async fn reserve(&self, hop: &HopRef, amount: u64) -> Result<(), LedgerError> {
        let key = (hop.transaction_id, hop.hop);
        if self.holds.contains_key(&key) {
            return Err(LedgerError::DuplicateHold {
                transaction_id: hop.transaction_id,
                hop: hop.hop,
            });
        }

        let account = Self::account(&hop.from, &hop.asset);
        // The held entry serializes reservations against one account.
        let mut held = self.held.entry(account.clone()).or_insert(0);
        let available = self.available_with(&account, *held);
        if available < amount as i128 {
            return Err(LedgerError::InsufficientFunds {
                account,
                available,
                required: amount,
            });
        }
        *held += amount;
        drop(held);

        self.holds.insert(
            key,
            Hold {
                hop: hop.clone(),
                amount,
            },
        );
        tracing::debug!(hop = %hop, amount, "ledger hold placed");
        Ok(())
    }

    async fn release(&self, hop: &HopRef) -> Result<(), LedgerError> {
        let Some((_, hold)) = self.holds.remove(&(hop.transaction_id, hop.hop)) else {
            return Ok(());
        };
        let account = Self::account(&hold.hop.from, &hold.hop.asset);
        if let Some(mut held) = self.held.get_mut(&account) {
            *held = held.saturating_sub(hold.amount);
        }
        tracing::debug!(hop = %hop, amount = hold.amount, "ledger hold released");
        Ok(())
    }

    async fn settle(&self, hop: &HopRef, _proof: &Preimage) -> Result<(), LedgerError> {
        let (_, hold) = self
            .holds
            .remove(&(hop.transaction_id, hop.hop))
            .ok_or(LedgerError::HoldNotFound {
                transaction_id: hop.transaction_id,
                hop: hop.hop,
            })?;

        let from = Self::account(&hold.hop.from, &hold.hop.asset);
        let to = Self::account(&hold.hop.to, &hold.hop.asset);
        if let Some(mut held) = self.held.get_mut(&from) {
            *held = held.saturating_sub(hold.amount);
        }
        let value = hold.amount as i128;
        self.record(from, -value, &hold.hop);
        self.record(to, value, &hold.hop);
        tracing::info!(hop = %hop, amount = hold.amount, "ledger hop settled");
        Ok(())
    }

    fn ledger_id(&self) -> &str {
        "ledger-internal"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usd() -> Asset {
        Asset::new("USD")
    }

    fn hop(tx: TransactionId, n: u32, from: &str, to: &str) -> HopRef {
        HopRef {
            transaction_id: tx,
            hop: n,
            from: DomainId::from(from),
            to: DomainId::from(to),
            asset: usd(),
        }
    }

    #[tokio::test]
    async fn test_reserve_requires_funds() {
        let ledger = InternalLedger::new();
        let a = DomainId::from("A");
        ledger.deposit(&a, &usd(), 50);
        let tx = TransactionId::new();
        let result = ledger.reserve(&hop(tx, 1, "A", "B"), 100).await;
        assert!(matches!(result, Err(LedgerError::InsufficientFunds { .. })));
        ledger.reserve(&hop(tx, 1, "A", "B"), 40).await.unwrap();
        assert_eq!(ledger.available(&a, &usd()), 10);
        assert_eq!(ledger.held(&a, &usd()), 40);
    }

    #[tokio::test]
    async fn test_credit_limit_extends_available() {
        let ledger = InternalLedger::new();
        let b = DomainId::from("B");
        ledger.set_credit_limit(&b, &usd(), 100);
        ledger
            .reserve(&hop(TransactionId::new(), 2, "B", "C"), 95)
            .await
            .unwrap();
        assert_eq!(ledger.available(&b, &usd()), 5);
    }

    #[tokio::test]
    async fn test_duplicate_hold_rejected() {
        let ledger = InternalLedger::new().with_default_credit_limit(1000);
        let tx = TransactionId::new();
        ledger.reserve(&hop(tx, 1, "A", "B"), 10).await.unwrap();
        let again = ledger.reserve(&hop(tx, 1, "A", "B"), 10).await;
        assert!(matches!(again, Err(LedgerError::DuplicateHold { .. })));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let ledger = InternalLedger::new().with_default_credit_limit(100);
        let a = DomainId::from("A");
        let h = hop(TransactionId::new(), 1, "A", "B");
        ledger.reserve(&h, 60).await.unwrap();
        ledger.release(&h).await.unwrap();
        ledger.release(&h).await.unwrap();
        assert_eq!(ledger.available(&a, &usd()), 100);
        assert_eq!(ledger.active_holds(), 0);
        assert!(ledger.journal().is_empty());
    }

    #[tokio::test]
    async fn test_settle_moves_value_double_entry() {
        let ledger = InternalLedger::new();
        let (a, b, c) = (DomainId::from("A"), DomainId::from("B"), DomainId::from("C"));
        ledger.deposit(&a, &usd(), 100);
        ledger.deposit(&b, &usd(), 95);
        let tx = TransactionId::new();
        let h1 = hop(tx, 1, "A", "B");
        let h2 = hop(tx, 2, "B", "C");
        ledger.reserve(&h1, 100).await.unwrap();
        ledger.reserve(&h2, 95).await.unwrap();

        let proof = Preimage::random();
        ledger.settle(&h2, &proof).await.unwrap();
        ledger.settle(&h1, &proof).await.unwrap();

        assert_eq!(ledger.balance(&a, &usd()), 0);
        assert_eq!(ledger.balance(&b, &usd()), 100);
        assert_eq!(ledger.balance(&c, &usd()), 95);
        let journal = ledger.journal();
        assert_eq!(journal.len(), 4);
        assert_eq!(journal.iter().map(|e| e.delta).sum::<i128>(), 0);
    }

    #[tokio::test]
    async fn test_settle_without_hold_fails() {
        let ledger = InternalLedger::new();
        let result = ledger
            .settle(&hop(TransactionId::new(), 1, "A", "B"), &Preimage::random())
            .await;
        assert!(matches!(result, Err(LedgerError::HoldNotFound { .. })));
    }
}
