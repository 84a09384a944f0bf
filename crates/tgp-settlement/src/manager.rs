use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tgp_core::{
    DomainId, GatewayId, HashLock, Message, Outbound, Preimage, SettleStatus, Transaction,
    TransactionEvent, TransactionId, TransactionState,
};
use tgp_policy::{Direction, PolicyDecision, PolicyEngine, PolicySubject};
use tokio::sync::Mutex;

use crate::config::{HtlcConfig, LockOrder};
use crate::error::SettlementError;
use crate::htlc::{Htlc, HtlcArena, HtlcStatus};
use crate::timeout;
use crate::traits::LedgerBackend;
use crate::types::{CandidatePath, HopPlan, HopRef, TransactionRecord};

/// What a sweep pass did.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub aborted: Vec<TransactionId>,
    pub refunded: Vec<(TransactionId, u32)>,
    /// Reservations force-released after the transaction deadline.
    pub released: Vec<(TransactionId, u32)>,
    pub outbound: Vec<Outbound>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.aborted.is_empty()
            && self.refunded.is_empty()
            && self.released.is_empty()
            && self.outbound.is_empty()
    }
}

/// Result of handling a PROOF.
#[derive(Debug, Default)]
pub struct ProofOutcome {
    /// SETTLE notifications for the hops that moved.
    pub outbound: Vec<Outbound>,
    /// Hops that could not be settled after the preimage was revealed.
    pub inconsistent: Vec<u32>,
}

/// Payer-side transaction manager.
///
/// Drives each transaction it originates through
/// QUERY → ADVERT → SELECT → LOCKED → SERVE → PROOF → SETTLE, reserving,
/// locking and settling every hop through the ledger backend. Operations on
/// one transaction are serialized by its record lock; different transactions
/// run in parallel.
pub struct HtlcManager {
    local_gateway: GatewayId,
    local_domain: DomainId,
    config: HtlcConfig,
    ledger: Arc<dyn LedgerBackend>,
    policy: Arc<dyn PolicyEngine>,
    arena: HtlcArena,
    transactions: DashMap<TransactionId, Arc<Mutex<TransactionRecord>>>,
}

impl HtlcManager {
    pub fn new(
        local_gateway: GatewayId,
        local_domain: DomainId,
        config: HtlcConfig,
        ledger: Arc<dyn LedgerBackend>,
        policy: Arc<dyn PolicyEngine>,
    ) -> Self {
        tracing::info!(
            gateway = %local_gateway,
            ledger = ledger.ledger_id(),
            lock_order = ?config.lock_order,
            "HTLC manager created"
        );
        Self {
            local_gateway,
            local_domain,
            config,
            ledger,
            policy,
            arena: HtlcArena::new(),
            transactions: DashMap::new(),
        }
    }

    pub fn config(&self) -> &HtlcConfig {
        &self.config
    }

    pub fn arena(&self) -> &HtlcArena {
        &self.arena
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerBackend> {
        &self.ledger
    }

    fn handle(&self, id: TransactionId) -> Result<Arc<Mutex<TransactionRecord>>, SettlementError> {
        self.transactions
            .get(&id)
            .map(|r| Arc::clone(r.value()))
            .ok_or(SettlementError::NotFound(id))
    }

    fn handles(&self) -> Vec<Arc<Mutex<TransactionRecord>>> {
        self.transactions.iter().map(|r| Arc::clone(r.value())).collect()
    }

    pub async fn get(&self, id: TransactionId) -> Option<TransactionRecord> {
        let handle = self.handle(id).ok()?;
        let rec = handle.lock().await;
        Some(rec.clone())
    }

    pub async fn state(&self, id: TransactionId) -> Option<TransactionState> {
        let handle = self.handle(id).ok()?;
        let rec = handle.lock().await;
        Some(rec.state)
    }

    pub async fn records(&self) -> Vec<TransactionRecord> {
        let mut out = Vec::new();
        for handle in self.handles() {
            out.push(handle.lock().await.clone());
        }
        out.sort_by_key(|r| r.id());
        out
    }

    pub fn contains(&self, id: TransactionId) -> bool {
        self.transactions.contains_key(&id)
    }

    /// Register a new outgoing transaction in QUERY.
    pub fn create(&self, tx: Transaction, now: DateTime<Utc>) -> Result<TransactionId, SettlementError> {
        tx.validate(now)?;
        if tx.payee == self.local_domain {
            return Err(SettlementError::InvalidPath(format!(
                "payee {} is the local domain",
                tx.payee
            )));
        }
        let id = tx.id;
        match self.transactions.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(SettlementError::AlreadyExists(id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(TransactionRecord::new(tx.clone(), now))));
            }
        }
        tracing::info!(
            transaction_id = %id,
            payee = %tx.payee,
            amount = tx.amount,
            asset = %tx.asset,
            "transaction created"
        );
        Ok(id)
    }

    /// Hand the candidate paths for a QUERY-state transaction to the manager.
    ///
    /// Candidates are tried in order. On success the SELECT for the first
    /// usable one is returned; if none is usable the transaction aborts.
    pub async fn submit_candidates(
        &self,
        id: TransactionId,
        candidates: Vec<CandidatePath>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Outbound>, SettlementError> {
        let handle = self.handle(id)?;
        let mut rec = handle.lock().await;
        if rec.state != TransactionState::Query {
            return Err(SettlementError::UnexpectedMessage {
                transaction_id: id,
                kind: "candidates",
                state: rec.state,
            });
        }
        if candidates.is_empty() {
            let payee = rec.transaction.payee.clone();
            self.abort(&mut rec, format!("no route to {}", payee), true, now)
                .await;
            return Err(SettlementError::NoRoute(payee));
        }

        rec.remaining = candidates;
        rec.apply(TransactionEvent::CandidatesFound, now)?;
        let outbound = self.try_next(&mut rec, now).await;
        if rec.state == TransactionState::Abort {
            return Err(SettlementError::NoAcceptablePath {
                transaction_id: id,
                rejection: rec.last_rejection.clone(),
            });
        }
        Ok(outbound)
    }

    /// From ADVERT, pick the next acceptable candidate, reserve every hop
    /// and send SELECT. Aborts when candidates run out.
    async fn try_next(&self, rec: &mut TransactionRecord, now: DateTime<Utc>) -> Vec<Outbound> {
        while !rec.remaining.is_empty() {
            let candidate = rec.remaining.remove(0);
            let id = rec.id();

            let decision = self.policy.evaluate(
                PolicySubject::Transaction {
                    tx: &rec.transaction,
                    source: &self.local_domain,
                    route: &candidate.route,
                },
                Direction::Transaction,
            );
            if let PolicyDecision::Reject(reason) = decision {
                rec.last_rejection = Some((reason.code().to_string(), reason.to_string()));
                continue;
            }

            let (domain_path, hops, serve_deadline) =
                match self.plan(&rec.transaction, &candidate, now) {
                    Ok(plan) => plan,
                    Err(e) => {
                        tracing::warn!(
                            transaction_id = %id,
                            path = %candidate.route.path_string(),
                            error = %e,
                            "candidate path unusable"
                        );
                        rec.last_rejection = Some(("PATH_UNUSABLE".into(), e.to_string()));
                        continue;
                    }
                };

            if let Err(e) = rec.apply(TransactionEvent::PathSelected, now) {
                tracing::error!(transaction_id = %id, error = %e, "cannot select path");
                break;
            }
            rec.first_hop = Some(candidate.first_hop.clone());
            rec.domain_path = domain_path;
            rec.hops = hops;
            rec.serve_deadline = Some(serve_deadline);

            if let Err(e) = self.reserve_all(rec, now).await {
                tracing::warn!(
                    transaction_id = %id,
                    path = %candidate.route.path_string(),
                    error = %e,
                    "reservation failed, trying next candidate"
                );
                rec.last_rejection = Some(("CAPACITY_EXHAUSTED".into(), e.to_string()));
                rec.clear_path();
                if rec.apply(TransactionEvent::SelectionFailed, now).is_err() {
                    break;
                }
                continue;
            }

            rec.select_sent = true;
            rec.awaiting_since = Some(now);
            tracing::info!(
                transaction_id = %id,
                first_hop = %candidate.first_hop,
                path = %candidate.route.path_string(),
                hops = rec.hops.len(),
                "path selected"
            );
            return vec![Outbound::new(
                candidate.first_hop,
                Message::Select {
                    transaction_id: id,
                    path: vec![self.local_gateway.clone()],
                    domain_path: rec.domain_path.clone(),
                    amount: rec.transaction.amount,
                    asset: rec.transaction.asset.clone(),
                    hash_commitment: None,
                    deadline: rec.transaction.deadline,
                },
            )];
        }

        let reason = match &rec.last_rejection {
            Some((code, reason)) => format!("no acceptable path ({}: {})", code, reason),
            None => "no acceptable path".to_string(),
        };
        self.abort(rec, reason, true, now).await
    }

    /// Domain path, per-hop amounts and timeouts, and the delivery deadline
    /// for a candidate.
    fn plan(
        &self,
        tx: &Transaction,
        candidate: &CandidatePath,
        now: DateTime<Utc>,
    ) -> Result<(Vec<DomainId>, Vec<HopPlan>, DateTime<Utc>), SettlementError> {
        let route = &candidate.route;
        if route.destination != tx.payee {
            return Err(SettlementError::InvalidPath(format!(
                "route leads to {}, payee is {}",
                route.destination, tx.payee
            )));
        }
        if route.path.is_empty() || route.contains(&self.local_domain) {
            return Err(SettlementError::InvalidPath(route.path_string()));
        }
        if !route.fees_within_cost() {
            return Err(SettlementError::InvalidPath(format!(
                "recorded fees on {} exceed cost {}",
                route.path_string(),
                route.cost
            )));
        }

        let mut domain_path = Vec::with_capacity(route.path.len() + 1);
        domain_path.push(self.local_domain.clone());
        domain_path.extend(route.path.iter().cloned());

        let fees = route.relay_fees();
        let total: u64 = fees.iter().fold(0u64, |acc, f| acc.saturating_add(*f));
        if total >= tx.amount {
            return Err(SettlementError::FeesExceedAmount {
                amount: tx.amount,
                fees: total,
            });
        }

        let n = route.path.len();
        let margin = HtlcConfig::chrono(self.config.hop_margin);
        let timeouts = timeout::hop_timeouts(tx.deadline, n, margin)
            .ok_or(SettlementError::DeadlineTooClose { hops: n })?;
        timeout::verify_ordering(&timeouts, margin)?;
        let serve_deadline = timeout::serve_deadline(
            &timeouts,
            HtlcConfig::chrono(self.config.claim_grace),
        )
        .ok_or(SettlementError::DeadlineTooClose { hops: n })?;
        if serve_deadline <= now {
            return Err(SettlementError::DeadlineTooClose { hops: n });
        }

        let mut amount = tx.amount;
        let mut hops = Vec::with_capacity(n);
        for i in 0..n {
            hops.push(HopPlan {
                hop: i as u32 + 1,
                from: domain_path[i].clone(),
                to: domain_path[i + 1].clone(),
                amount,
                timeout: timeouts[i],
            });
            if let Some(fee) = fees.get(i) {
                amount -= fee;
            }
        }
        Ok((domain_path, hops, serve_deadline))
    }

    /// Reserve every hop or none.
    async fn reserve_all(&self, rec: &TransactionRecord, now: DateTime<Utc>) -> Result<(), SettlementError> {
        let mut done: Vec<HopRef> = Vec::with_capacity(rec.hops.len());
        for plan in &rec.hops {
            let hop = rec.hop_ref(plan);
            let result = match self.ledger.reserve(&hop, plan.amount).await {
                Ok(()) => match self.arena.open(&hop, plan.amount, plan.timeout, now) {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        self.release_hold(&hop).await;
                        Err(e)
                    }
                },
                Err(source) => Err(SettlementError::CapacityExhausted {
                    hop: plan.hop,
                    source,
                }),
            };

            if let Err(e) = result {
                for hop in done.iter().rev() {
                    self.release_hold(hop).await;
                    let _ = self.arena.release(hop.transaction_id, hop.hop, now);
                }
                return Err(e);
            }
            done.push(hop);
        }
        Ok(())
    }

    async fn release_hold(&self, hop: &HopRef) {
        if let Err(e) = self.ledger.release(hop).await {
            tracing::error!(hop = %hop, error = %e, "ledger release failed");
        }
    }

    /// Release every active hop of the transaction immediately.
    async fn release_active(&self, id: TransactionId, now: DateTime<Utc>) -> Vec<(TransactionId, u32)> {
        let mut released = Vec::new();
        for htlc in self.arena.for_transaction(id) {
            if !htlc.status.is_active() || htlc.inconsistent {
                continue;
            }
            self.release_hold(&htlc.hop_ref()).await;
            if self.arena.release(id, htlc.hop, now).is_ok() {
                released.push((id, htlc.hop));
            }
        }
        released
    }

    /// Move the record to ABORT. With `release`, every hop is released
    /// now; otherwise reserved hops are released and locked hops wait for
    /// their timeout. Returns SETTLE(aborted) notices for the path.
    async fn abort(
        &self,
        rec: &mut TransactionRecord,
        reason: String,
        release: bool,
        now: DateTime<Utc>,
    ) -> Vec<Outbound> {
        let id = rec.id();
        if rec.state.is_terminal() {
            return Vec::new();
        }
        if let Err(e) = rec.apply(TransactionEvent::Abort, now) {
            tracing::error!(transaction_id = %id, error = %e, "abort rejected");
            return Vec::new();
        }
        tracing::warn!(transaction_id = %id, %reason, release, "transaction aborted");
        rec.abort_reason = Some(reason);
        rec.awaiting_since = None;

        if release {
            self.release_active(id, now).await;
        } else {
            for htlc in self.arena.for_transaction(id) {
                if htlc.status == HtlcStatus::Reserved {
                    self.release_hold(&htlc.hop_ref()).await;
                    let _ = self.arena.release(id, htlc.hop, now);
                }
            }
        }

        if rec.select_sent {
            self.notify_path(rec, SettleStatus::Aborted)
        } else {
            Vec::new()
        }
    }

    fn notify_path(&self, rec: &TransactionRecord, status: SettleStatus) -> Vec<Outbound> {
        let Some(first_hop) = rec.first_hop.clone() else {
            return Vec::new();
        };
        rec.hops
            .iter()
            .map(|plan| {
                Outbound::new(
                    first_hop.clone(),
                    Message::Settle {
                        transaction_id: rec.id(),
                        hop: plan.hop,
                        status,
                    },
                )
            })
            .collect()
    }

    fn lock_message(&self, rec: &TransactionRecord, hop: u32) -> Option<Outbound> {
        let plan = rec.plan(hop)?;
        let hash = rec.hash_lock?;
        let first_hop = rec.first_hop.clone()?;
        Some(Outbound::new(
            first_hop,
            Message::Lock {
                transaction_id: rec.id(),
                hop,
                hash_commitment: hash,
                timeout: plan.timeout,
                amount: plan.amount,
            },
        ))
    }

    fn next_lock_hop(&self, rec: &TransactionRecord) -> Option<u32> {
        let pending = rec.hops.iter().map(|p| p.hop).filter(|h| !rec.locked.contains(h));
        match self.config.lock_order {
            LockOrder::Forward => pending.min(),
            LockOrder::PayeeFirst => pending.max(),
        }
    }

    fn check_first_hop(&self, rec: &TransactionRecord, from: &GatewayId, kind: &'static str) -> Result<(), SettlementError> {
        if rec.first_hop.as_ref() != Some(from) {
            return Err(SettlementError::UnexpectedMessage {
                transaction_id: rec.id(),
                kind,
                state: rec.state,
            });
        }
        Ok(())
    }

    /// Handle the payee's answer to SELECT, relayed back through `from`.
    pub async fn on_select_ack(
        &self,
        from: &GatewayId,
        id: TransactionId,
        path: Vec<GatewayId>,
        hash_commitment: Option<HashLock>,
        accepted: bool,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Outbound>, SettlementError> {
        let handle = self.handle(id)?;
        let mut rec = handle.lock().await;
        if rec.state != TransactionState::Select || !rec.select_sent {
            return Err(SettlementError::UnexpectedMessage {
                transaction_id: id,
                kind: "SELECT_ACK",
                state: rec.state,
            });
        }
        self.check_first_hop(&rec, from, "SELECT_ACK")?;

        let failure = if !accepted {
            Some(reason.unwrap_or_else(|| "rejected downstream".into()))
        } else if hash_commitment.is_none() {
            Some("SELECT_ACK without hash commitment".into())
        } else if path.len() != rec.domain_path.len()
            || path.first() != Some(&self.local_gateway)
            || path.get(1) != rec.first_hop.as_ref()
        {
            Some(format!("gateway path {:?} does not match domain path", path))
        } else {
            None
        };

        if let Some(reason) = failure {
            tracing::warn!(transaction_id = %id, %reason, "selection failed downstream");
            self.release_active(id, now).await;
            rec.last_rejection = Some(("SELECT_REJECTED".into(), reason));
            rec.clear_path();
            rec.apply(TransactionEvent::SelectionFailed, now)?;
            return Ok(self.try_next(&mut rec, now).await);
        }

        rec.hash_lock = hash_commitment;
        rec.gateway_path = path;
        rec.apply(TransactionEvent::LockingStarted, now)?;
        rec.awaiting_since = Some(now);

        let hop = self.next_lock_hop(&rec);
        Ok(hop
            .and_then(|h| self.lock_message(&rec, h))
            .into_iter()
            .collect())
    }

    /// Handle a LOCK_ACK for `hop`.
    pub async fn on_lock_ack(
        &self,
        from: &GatewayId,
        id: TransactionId,
        hop: u32,
        accepted: bool,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Outbound>, SettlementError> {
        let handle = self.handle(id)?;
        let mut rec = handle.lock().await;
        if rec.state != TransactionState::Locked || self.next_lock_hop(&rec) != Some(hop) {
            return Err(SettlementError::UnexpectedMessage {
                transaction_id: id,
                kind: "LOCK_ACK",
                state: rec.state,
            });
        }
        self.check_first_hop(&rec, from, "LOCK_ACK")?;

        if !accepted {
            let reason = format!(
                "hop {} refused lock: {}",
                hop,
                reason.unwrap_or_else(|| "unspecified".into())
            );
            return Ok(self.abort(&mut rec, reason, true, now).await);
        }

        let hash = rec.hash_lock.ok_or(SettlementError::UnexpectedMessage {
            transaction_id: id,
            kind: "LOCK_ACK",
            state: rec.state,
        })?;
        if let Err(e) = self.arena.lock(id, hop, hash, now) {
            return Ok(self.abort(&mut rec, e.to_string(), true, now).await);
        }
        rec.locked.insert(hop);
        rec.awaiting_since = Some(now);

        if let Some(next) = self.next_lock_hop(&rec) {
            return Ok(self.lock_message(&rec, next).into_iter().collect());
        }

        rec.apply(TransactionEvent::AllHopsLocked, now)?;
        rec.awaiting_since = None;
        tracing::info!(
            transaction_id = %id,
            serve_deadline = ?rec.serve_deadline,
            "all hops locked, requesting delivery"
        );
        let first_hop = rec.first_hop.clone().ok_or(SettlementError::InvalidPath(
            "locked transaction without first hop".into(),
        ))?;
        Ok(vec![Outbound::new(
            first_hop,
            Message::Serve {
                transaction_id: id,
                service_descriptor: rec.transaction.service.clone(),
            },
        )])
    }

    /// Handle the payee's preimage and settle every hop, payee side first.
    pub async fn on_proof(
        &self,
        from: &GatewayId,
        id: TransactionId,
        preimage: Preimage,
        now: DateTime<Utc>,
    ) -> Result<ProofOutcome, SettlementError> {
        let handle = self.handle(id)?;
        let mut rec = handle.lock().await;
        self.check_first_hop(&rec, from, "PROOF")?;
        match rec.state {
            TransactionState::Serve => {
                let hash = rec.hash_lock.ok_or(SettlementError::PreimageMismatch(id))?;
                if !hash.verify(&preimage) {
                    tracing::warn!(transaction_id = %id, "PROOF with wrong preimage");
                    return Err(SettlementError::PreimageMismatch(id));
                }
                rec.preimage = Some(preimage);
                rec.apply(TransactionEvent::DeliveryConfirmed, now)?;
            }
            // Duplicate PROOF: settle whatever is left.
            TransactionState::Proof => {}
            // The delivery deadline passed but the payee revealed while every
            // hop could still be claimed. The record stays in ABORT.
            TransactionState::Abort if rec.preimage.is_none() => {
                let hash = rec.hash_lock.ok_or(SettlementError::PreimageMismatch(id))?;
                if !hash.verify(&preimage) {
                    tracing::warn!(transaction_id = %id, "PROOF with wrong preimage");
                    return Err(SettlementError::PreimageMismatch(id));
                }
                if !self.all_hops_claimable(&rec, &preimage, now) {
                    return Err(SettlementError::UnexpectedMessage {
                        transaction_id: id,
                        kind: "PROOF",
                        state: rec.state,
                    });
                }
                tracing::warn!(
                    transaction_id = %id,
                    late_claim = true,
                    "preimage revealed after abort, claiming locked hops"
                );
                rec.preimage = Some(preimage);
                rec.late_claim = true;
            }
            state => {
                return Err(SettlementError::UnexpectedMessage {
                    transaction_id: id,
                    kind: "PROOF",
                    state,
                })
            }
        }
        Ok(self.settle_hops(&mut rec, now).await)
    }

    /// Every hop is locked, consistent and before its timeout.
    fn all_hops_claimable(&self, rec: &TransactionRecord, preimage: &Preimage, now: DateTime<Utc>) -> bool {
        !rec.hops.is_empty()
            && rec.hops.iter().all(|plan| {
                self.arena
                    .get(rec.id(), plan.hop)
                    .map(|h| !h.inconsistent)
                    .unwrap_or(false)
                    && self.arena.check_claimable(rec.id(), plan.hop, preimage, now).is_ok()
            })
    }

    async fn settle_hops(&self, rec: &mut TransactionRecord, now: DateTime<Utc>) -> ProofOutcome {
        let id = rec.id();
        let mut outcome = ProofOutcome::default();
        let Some(preimage) = rec.preimage.clone() else {
            return outcome;
        };

        let hops: Vec<u32> = rec.hops.iter().rev().map(|p| p.hop).collect();
        for hop in hops {
            if rec.settled.contains(&hop) {
                continue;
            }
            let Some(htlc) = self.arena.get(id, hop) else {
                outcome.inconsistent.push(hop);
                continue;
            };
            if htlc.inconsistent {
                outcome.inconsistent.push(hop);
                continue;
            }

            let result = match self.arena.check_claimable(id, hop, &preimage, now) {
                Ok(()) => self
                    .ledger
                    .settle(&htlc.hop_ref(), &preimage)
                    .await
                    .map_err(SettlementError::from),
                Err(e) => Err(e),
            };
            match result.and_then(|_| self.arena.claim(id, hop, &preimage, now)) {
                Ok(_) => {
                    rec.settled.insert(hop);
                    if let Some(first_hop) = rec.first_hop.clone() {
                        outcome.outbound.push(Outbound::new(
                            first_hop,
                            Message::Settle {
                                transaction_id: id,
                                hop,
                                status: SettleStatus::Settled,
                            },
                        ));
                    }
                }
                Err(e) => {
                    self.arena.mark_inconsistent(id, hop, now);
                    tracing::error!(
                        transaction_id = %id,
                        hop,
                        error = %e,
                        escalation = true,
                        "hop failed to settle after preimage reveal"
                    );
                    outcome.inconsistent.push(hop);
                }
            }
        }

        if outcome.inconsistent.is_empty() {
            if rec.late_claim {
                tracing::info!(transaction_id = %id, "late claim settled every hop");
            } else if let Err(e) = rec.apply(TransactionEvent::AllHopsSettled, now) {
                tracing::error!(transaction_id = %id, error = %e, "cannot complete settlement");
            }
        } else {
            rec.escalated = true;
        }
        outcome
    }

    /// A downstream gateway abandoned the transaction (SETTLE aborted).
    ///
    /// Nobody downstream will reveal the preimage, so every hop is released
    /// at once. Ignored once the preimage is known.
    pub async fn on_remote_abort(
        &self,
        from: &GatewayId,
        id: TransactionId,
        hop: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Outbound>, SettlementError> {
        let handle = self.handle(id)?;
        let mut rec = handle.lock().await;
        self.check_first_hop(&rec, from, "SETTLE")?;
        match rec.state {
            TransactionState::Proof | TransactionState::Settle => {
                tracing::warn!(transaction_id = %id, hop, state = %rec.state, "ignoring abort after proof");
                Ok(Vec::new())
            }
            TransactionState::Abort => {
                self.release_active(id, now).await;
                Ok(Vec::new())
            }
            _ => {
                let reason = format!("aborted downstream at hop {}", hop);
                Ok(self.abort(&mut rec, reason, true, now).await)
            }
        }
    }

    /// Payer cancellation; only allowed until every hop is locked.
    pub async fn cancel(&self, id: TransactionId, now: DateTime<Utc>) -> Result<Vec<Outbound>, SettlementError> {
        let handle = self.handle(id)?;
        let mut rec = handle.lock().await;
        if !rec.state.is_cancellable() {
            return Err(SettlementError::CancellationForbidden {
                transaction_id: id,
                state: rec.state,
            });
        }
        Ok(self.abort(&mut rec, "cancelled by payer".into(), true, now).await)
    }

    /// Abort transactions whose first hop went through `peer`.
    ///
    /// Transactions in PROOF are left alone; their hops settle locally.
    pub async fn peer_down(&self, peer: &GatewayId, now: DateTime<Utc>) -> Vec<TransactionId> {
        let mut aborted = Vec::new();
        for handle in self.handles() {
            let mut rec = handle.lock().await;
            if rec.first_hop.as_ref() != Some(peer)
                || rec.state.is_terminal()
                || rec.state == TransactionState::Proof
            {
                continue;
            }
            let release = !rec.state.funds_committed();
            self.abort(&mut rec, format!("peer {} down", peer), release, now)
                .await;
            aborted.push(rec.id());
        }
        aborted
    }

    /// Fire ack and delivery timeouts, refund expired hops, and
    /// force-release anything held past a transaction deadline.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let ack_timeout = HtlcConfig::chrono(self.config.ack_timeout);

        for handle in self.handles() {
            let mut rec = handle.lock().await;
            let id = rec.id();
            let was_terminal = rec.state.is_terminal();
            let ack_expired = rec
                .awaiting_since
                .map(|since| {
                    since
                        .checked_add_signed(ack_timeout)
                        .map(|due| now >= due)
                        .unwrap_or(false)
                })
                .unwrap_or(false);

            match rec.state {
                s if !s.is_terminal() && s != TransactionState::Proof && now >= rec.transaction.deadline => {
                    let out = self.abort(&mut rec, "deadline passed".into(), true, now).await;
                    report.outbound.extend(out);
                }
                TransactionState::Select if ack_expired => {
                    tracing::warn!(transaction_id = %id, "SELECT_ACK timed out");
                    report.outbound.extend(self.notify_path(&rec, SettleStatus::Aborted));
                    self.release_active(id, now).await;
                    rec.last_rejection = Some(("TIMEOUT".into(), "no SELECT_ACK".into()));
                    rec.clear_path();
                    if rec.apply(TransactionEvent::SelectionFailed, now).is_ok() {
                        let out = self.try_next(&mut rec, now).await;
                        report.outbound.extend(out);
                    }
                }
                TransactionState::Locked if ack_expired => {
                    let out = self.abort(&mut rec, "LOCK_ACK timed out".into(), true, now).await;
                    report.outbound.extend(out);
                }
                TransactionState::Serve
                    if rec.serve_deadline.map(|d| now >= d).unwrap_or(false) =>
                {
                    let out = self
                        .abort(&mut rec, "delivery not confirmed before deadline".into(), false, now)
                        .await;
                    report.outbound.extend(out);
                }
                _ => {}
            }
            if !was_terminal && rec.state == TransactionState::Abort {
                report.aborted.push(id);
            }

            if rec.state == TransactionState::Abort {
                for htlc in self.arena.for_transaction(id) {
                    if htlc.status != HtlcStatus::Locked || htlc.inconsistent || now < htlc.timeout {
                        continue;
                    }
                    if let Some(out) = self.refund(&rec, &htlc, now).await {
                        report.refunded.push((id, htlc.hop));
                        report.outbound.push(out);
                    }
                }
            }

            if now >= rec.transaction.deadline && rec.state != TransactionState::Proof {
                for (tx, hop) in self.release_active(id, now).await {
                    tracing::warn!(transaction_id = %tx, hop, "reservation force-released after deadline");
                    report.released.push((tx, hop));
                }
            }
        }
        report
    }

    async fn refund(&self, rec: &TransactionRecord, htlc: &Htlc, now: DateTime<Utc>) -> Option<Outbound> {
        self.release_hold(&htlc.hop_ref()).await;
        if let Err(e) = self.arena.refund(htlc.transaction_id, htlc.hop, now) {
            tracing::error!(transaction_id = %htlc.transaction_id, hop = htlc.hop, error = %e, "refund failed");
            return None;
        }
        rec.first_hop.clone().map(|first_hop| {
            Outbound::new(
                first_hop,
                Message::Settle {
                    transaction_id: htlc.transaction_id,
                    hop: htlc.hop,
                    status: SettleStatus::Refunded,
                },
            )
        })
    }

    /// Reload persisted state after a restart and resume it.
    ///
    /// Transactions that never finished locking are aborted and released,
    /// SERVE ones stay under sweeper control, and PROOF ones retry the hops
    /// that have not settled yet.
    pub async fn restore(
        &self,
        records: Vec<TransactionRecord>,
        htlcs: Vec<Htlc>,
        now: DateTime<Utc>,
    ) -> Vec<Outbound> {
        self.arena.restore(htlcs);
        let mut outbound = Vec::new();
        for rec in records {
            let id = rec.id();
            let handle = Arc::new(Mutex::new(rec));
            self.transactions.insert(id, Arc::clone(&handle));
            let mut rec = handle.lock().await;
            match rec.state {
                TransactionState::Query
                | TransactionState::Advert
                | TransactionState::Select
                | TransactionState::Locked => {
                    outbound.extend(
                        self.abort(&mut rec, "interrupted by restart".into(), true, now)
                            .await,
                    );
                }
                TransactionState::Proof => {
                    let outcome = self.settle_hops(&mut rec, now).await;
                    outbound.extend(outcome.outbound);
                }
                _ => {}
            }
        }
        tracing::info!(transactions = self.transactions.len(), htlcs = self.arena.len(), "settlement state restored");
        outbound
    }
}
