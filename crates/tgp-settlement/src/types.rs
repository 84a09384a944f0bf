use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tgp_core::{
    Asset, CoreError, DomainId, GatewayId, HashLock, Preimage, RouteAdvertisement, Transaction,
    TransactionEvent, TransactionId, TransactionState, TransactionStateMachine,
};

/// Identifies one hop of a transaction to the ledger backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HopRef {
    pub transaction_id: TransactionId,
    pub hop: u32,
    /// Domain paying on this hop.
    pub from: DomainId,
    /// Domain paid on this hop.
    pub to: DomainId,
    pub asset: Asset,
}

impl fmt::Display for HopRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}->{}", self.transaction_id, self.hop, self.from, self.to)
    }
}

/// A candidate route for a transaction and the peer it leaves through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePath {
    pub first_hop: GatewayId,
    pub route: RouteAdvertisement,
}

/// Amount and timeout planned for one hop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopPlan {
    pub hop: u32,
    pub from: DomainId,
    pub to: DomainId,
    pub amount: u64,
    pub timeout: DateTime<Utc>,
}

/// Payer-side state of one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction: Transaction,
    pub state: TransactionState,
    /// Every state entered, in order.
    pub history: Vec<TransactionState>,
    /// Candidates not tried yet, best first.
    pub remaining: Vec<CandidatePath>,
    pub first_hop: Option<GatewayId>,
    pub domain_path: Vec<DomainId>,
    /// Filled in from SELECT_ACK.
    pub gateway_path: Vec<GatewayId>,
    pub hops: Vec<HopPlan>,
    pub hash_lock: Option<HashLock>,
    pub preimage: Option<Preimage>,
    pub locked: BTreeSet<u32>,
    pub settled: BTreeSet<u32>,
    pub serve_deadline: Option<DateTime<Utc>>,
    /// Set while waiting on a SELECT_ACK or LOCK_ACK.
    pub awaiting_since: Option<DateTime<Utc>>,
    /// True once any gateway downstream has heard of the transaction.
    pub select_sent: bool,
    pub last_rejection: Option<(String, String)>,
    pub abort_reason: Option<String>,
    pub escalated: bool,
    /// Hops were claimed with a preimage that arrived after the abort.
    #[serde(default)]
    pub late_claim: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn new(transaction: Transaction, now: DateTime<Utc>) -> Self {
        Self {
            transaction,
            state: TransactionState::Query,
            history: vec![TransactionState::Query],
            remaining: Vec::new(),
            first_hop: None,
            domain_path: Vec::new(),
            gateway_path: Vec::new(),
            hops: Vec::new(),
            hash_lock: None,
            preimage: None,
            locked: BTreeSet::new(),
            settled: BTreeSet::new(),
            serve_deadline: None,
            awaiting_since: None,
            select_sent: false,
            last_rejection: None,
            abort_reason: None,
            escalated: false,
            late_claim: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.transaction.id
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    pub fn apply(&mut self, event: TransactionEvent, now: DateTime<Utc>) -> Result<(), CoreError> {
        let next = TransactionStateMachine::transition(self.state, event)?;
        tracing::info!(
            transaction_id = %self.transaction.id,
            from = %self.state,
            to = %next,
            "transaction state changed"
        );
        self.state = next;
        self.history.push(next);
        self.updated_at = now;
        Ok(())
    }

    pub fn hop_ref(&self, plan: &HopPlan) -> HopRef {
        HopRef {
            transaction_id: self.transaction.id,
            hop: plan.hop,
            from: plan.from.clone(),
            to: plan.to.clone(),
            asset: self.transaction.asset.clone(),
        }
    }

    pub fn plan(&self, hop: u32) -> Option<&HopPlan> {
        self.hops.iter().find(|p| p.hop == hop)
    }

    /// Forget the current path so another candidate can be tried.
    pub fn clear_path(&mut self) {
        self.first_hop = None;
        self.domain_path.clear();
        self.gateway_path.clear();
        self.hops.clear();
        self.hash_lock = None;
        self.locked.clear();
        self.serve_deadline = None;
        self.awaiting_since = None;
        self.select_sent = false;
    }
}
