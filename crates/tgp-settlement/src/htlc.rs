use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tgp_core::{Asset, DomainId, HashLock, Preimage, TransactionId};

use crate::error::SettlementError;
use crate::types::HopRef;

/// Status of a per-hop Hash Time-Locked Contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HtlcStatus {
    /// Capacity reserved during SELECT; not yet bound to a hash.
    Reserved,
    /// Locked against the hash commitment until `timeout`.
    Locked,
    /// Claimed with the preimage; value moved.
    Settled,
    /// Timed out and returned to the paying side.
    Refunded,
    /// Cancelled cooperatively before any preimage could be revealed.
    Released,
}

impl HtlcStatus {
    /// Reserved and locked HTLCs count towards the one-per-hop limit.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Reserved | Self::Locked)
    }
}

impl std::fmt::Display for HtlcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reserved => write!(f, "Reserved"),
            Self::Locked => write!(f, "Locked"),
            Self::Settled => write!(f, "Settled"),
            Self::Refunded => write!(f, "Refunded"),
            Self::Released => write!(f, "Released"),
        }
    }
}

/// One hop of a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Htlc {
    pub transaction_id: TransactionId,
    /// 1 is the payer-adjacent hop.
    pub hop: u32,
    pub from: DomainId,
    pub to: DomainId,
    pub asset: Asset,
    pub amount: u64,
    /// Set when the hop is locked.
    pub hash_lock: Option<HashLock>,
    pub timeout: DateTime<Utc>,
    pub status: HtlcStatus,
    /// The preimage was revealed but the ledger failed to settle this hop.
    #[serde(default)]
    pub inconsistent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Htlc {
    pub fn hop_ref(&self) -> HopRef {
        HopRef {
            transaction_id: self.transaction_id,
            hop: self.hop,
            from: self.from.clone(),
            to: self.to.clone(),
            asset: self.asset.clone(),
        }
    }
}

/// Arena of HTLCs keyed by (transaction, hop index).
///
/// Thread-safe: uses `DashMap` for concurrent access. Holding the entry
/// for a key serializes every transition on that hop.
pub struct HtlcArena {
    htlcs: DashMap<(TransactionId, u32), Htlc>,
}

impl HtlcArena {
    pub fn new() -> Self {
        Self {
            htlcs: DashMap::new(),
        }
    }

    /// Open a reserved HTLC for `hop`.
    ///
    /// Fails if an active HTLC already exists for the same (transaction, hop).
    /// A finished one is replaced.
    pub fn open(
        &self,
        hop: &HopRef,
        amount: u64,
        timeout: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Htlc, SettlementError> {
        let key = (hop.transaction_id, hop.hop);
        let htlc = Htlc {
            transaction_id: hop.transaction_id,
            hop: hop.hop,
            from: hop.from.clone(),
            to: hop.to.clone(),
            asset: hop.asset.clone(),
            amount,
            hash_lock: None,
            timeout,
            status: HtlcStatus::Reserved,
            inconsistent: false,
            created_at: now,
            updated_at: now,
        };

        match self.htlcs.entry(key) {
            Entry::Occupied(mut existing) => {
                if existing.get().status.is_active() {
                    return Err(SettlementError::DuplicateHtlc {
                        transaction_id: hop.transaction_id,
                        hop: hop.hop,
                    });
                }
                existing.insert(htlc.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(htlc.clone());
            }
        }
        tracing::debug!(hop = %hop, amount, %timeout, "HTLC reserved");
        Ok(htlc)
    }

    fn update<F>(
        &self,
        transaction_id: TransactionId,
        hop: u32,
        f: F,
    ) -> Result<Htlc, SettlementError>
    where
        F: FnOnce(&mut Htlc) -> Result<(), SettlementError>,
    {
        let mut entry = self
            .htlcs
            .get_mut(&(transaction_id, hop))
            .ok_or(SettlementError::HtlcNotFound {
                transaction_id,
                hop,
            })?;
        let htlc = entry.value_mut();
        f(htlc)?;
        Ok(htlc.clone())
    }

    fn invalid(htlc: &Htlc, op: &'static str) -> SettlementError {
        SettlementError::InvalidHtlcState {
            transaction_id: htlc.transaction_id,
            hop: htlc.hop,
            status: htlc.status.to_string(),
            op,
        }
    }

    /// Bind a reserved hop to the hash commitment.
    pub fn lock(
        &self,
        transaction_id: TransactionId,
        hop: u32,
        hash_lock: HashLock,
        now: DateTime<Utc>,
    ) -> Result<Htlc, SettlementError> {
        let htlc = self.update(transaction_id, hop, |h| {
            if h.status != HtlcStatus::Reserved {
                return Err(Self::invalid(h, "lock"));
            }
            if now >= h.timeout {
                return Err(SettlementError::Expired {
                    transaction_id,
                    hop,
                });
            }
            h.hash_lock = Some(hash_lock);
            h.status = HtlcStatus::Locked;
            h.updated_at = now;
            Ok(())
        })?;
        tracing::info!(%transaction_id, hop, timeout = %htlc.timeout, "HTLC locked");
        Ok(htlc)
    }

    /// Check that `preimage` would claim the hop right now, without changing it.
    pub fn check_claimable(
        &self,
        transaction_id: TransactionId,
        hop: u32,
        preimage: &Preimage,
        now: DateTime<Utc>,
    ) -> Result<(), SettlementError> {
        let entry = self
            .htlcs
            .get(&(transaction_id, hop))
            .ok_or(SettlementError::HtlcNotFound {
                transaction_id,
                hop,
            })?;
        Self::claimable(entry.value(), preimage, now)
    }

    fn claimable(h: &Htlc, preimage: &Preimage, now: DateTime<Utc>) -> Result<(), SettlementError> {
        if h.status != HtlcStatus::Locked {
            return Err(Self::invalid(h, "claim"));
        }
        if now >= h.timeout {
            return Err(SettlementError::Expired {
                transaction_id: h.transaction_id,
                hop: h.hop,
            });
        }
        match h.hash_lock {
            Some(lock) if lock.verify(preimage) => Ok(()),
            _ => Err(SettlementError::PreimageMismatch(h.transaction_id)),
        }
    }

    /// Claim a locked hop by revealing the preimage.
    pub fn claim(
        &self,
        transaction_id: TransactionId,
        hop: u32,
        preimage: &Preimage,
        now: DateTime<Utc>,
    ) -> Result<Htlc, SettlementError> {
        let htlc = self.update(transaction_id, hop, |h| {
            Self::claimable(h, preimage, now)?;
            h.status = HtlcStatus::Settled;
            h.inconsistent = false;
            h.updated_at = now;
            Ok(())
        })?;
        tracing::info!(%transaction_id, hop, "HTLC claimed");
        Ok(htlc)
    }

    /// Refund a locked hop whose timeout has passed.
    pub fn refund(
        &self,
        transaction_id: TransactionId,
        hop: u32,
        now: DateTime<Utc>,
    ) -> Result<Htlc, SettlementError> {
        let htlc = self.update(transaction_id, hop, |h| {
            if h.status != HtlcStatus::Locked {
                return Err(Self::invalid(h, "refund"));
            }
            if now < h.timeout {
                return Err(SettlementError::NotExpired {
                    transaction_id,
                    hop,
                });
            }
            h.status = HtlcStatus::Refunded;
            h.updated_at = now;
            Ok(())
        })?;
        tracing::info!(%transaction_id, hop, "HTLC refunded");
        Ok(htlc)
    }

    /// Cancel an active hop before its timeout. Only valid while no
    /// preimage can have been revealed, which the caller guarantees.
    pub fn release(
        &self,
        transaction_id: TransactionId,
        hop: u32,
        now: DateTime<Utc>,
    ) -> Result<Htlc, SettlementError> {
        let htlc = self.update(transaction_id, hop, |h| {
            if !h.status.is_active() {
                return Err(Self::invalid(h, "release"));
            }
            h.status = HtlcStatus::Released;
            h.updated_at = now;
            Ok(())
        })?;
        tracing::debug!(%transaction_id, hop, "HTLC released");
        Ok(htlc)
    }

    pub fn mark_inconsistent(&self, transaction_id: TransactionId, hop: u32, now: DateTime<Utc>) {
        if let Some(mut h) = self.htlcs.get_mut(&(transaction_id, hop)) {
            h.inconsistent = true;
            h.updated_at = now;
        }
    }

    /// Locked hops whose timeout has passed. Inconsistent hops are left to
    /// the operator.
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<Htlc> {
        let mut out: Vec<Htlc> = self
            .htlcs
            .iter()
            .filter(|e| {
                let h = e.value();
                h.status == HtlcStatus::Locked && now >= h.timeout && !h.inconsistent
            })
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|h| (h.transaction_id, h.hop));
        out
    }

    /// Every HTLC of a transaction, ordered by hop.
    pub fn for_transaction(&self, transaction_id: TransactionId) -> Vec<Htlc> {
        let mut out: Vec<Htlc> = self
            .htlcs
            .iter()
            .filter(|e| e.key().0 == transaction_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|h| h.hop);
        out
    }

    pub fn get(&self, transaction_id: TransactionId, hop: u32) -> Option<Htlc> {
        self.htlcs.get(&(transaction_id, hop)).map(|e| e.clone())
    }

    pub fn all(&self) -> Vec<Htlc> {
        self.htlcs.iter().map(|e| e.value().clone()).collect()
    }

    /// Reload HTLCs from storage. Existing entries with the same key are
    /// overwritten.
    pub fn restore(&self, htlcs: impl IntoIterator<Item = Htlc>) {
        for h in htlcs {
            self.htlcs.insert((h.transaction_id, h.hop), h);
        }
    }

    pub fn len(&self) -> usize {
        self.htlcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.htlcs.is_empty()
    }
}

impl Default for HtlcArena {
    fn default() -> Self {
        Self::new()
    }
}
