//! The gateway core.
//!
//! Composes route selection, the payer-side HTLC manager, relay and payee
//! participant records, the invoice book and the delivery layer. Every
//! operation returns the messages to send; the node runtime (or a test
//! harness) routes them to the session of the addressed peer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tgp_core::{
    Asset, DomainId, GatewayId, HashLock, Message, Outbound, PolicyAttributes, Preimage,
    ProtocolLimits, SettleStatus, Transaction, TransactionId,
};
use tgp_policy::PolicyEngine;
use tgp_routing::{LocalRoute, PeerInfo, RouteSelector, UpdateOutcome};
use tgp_settlement::{
    CandidatePath, HtlcConfig, HtlcManager, LedgerBackend, TransactionRecord,
};
use tokio::sync::Mutex;

use crate::config::GatewayConfig;
use crate::delivery::DeliveryLayer;
use crate::error::GatewayError;
use crate::invoice::InvoiceBook;
use crate::participant::{ParticipantRecord, ParticipantState, Role, Side};
use crate::storage::{Storage, StoredParticipant};

/// Identity and protocol parameters of one gateway.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub gateway: GatewayId,
    pub domain: DomainId,
    pub limits: ProtocolLimits,
    pub htlc: HtlcConfig,
    /// Attributes announced with the local domain's route.
    pub origin_attributes: PolicyAttributes,
}

impl CoreConfig {
    pub fn new(gateway: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            gateway: GatewayId::new(gateway),
            domain: DomainId::new(domain),
            limits: ProtocolLimits::default(),
            htlc: HtlcConfig::default(),
            origin_attributes: PolicyAttributes::new(),
        }
    }
}

impl From<&GatewayConfig> for CoreConfig {
    fn from(config: &GatewayConfig) -> Self {
        let mut origin_attributes = config.policy.export_attributes.clone();
        origin_attributes.merge(&config.gateway.attributes);
        Self {
            gateway: config.gateway_id(),
            domain: config.domain_id(),
            limits: config.limits(),
            htlc: config.htlc.clone(),
            origin_attributes,
        }
    }
}

/// A transaction as seen from this gateway.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum TransactionView {
    Payer(TransactionRecord),
    Participant(ParticipantRecord),
}

pub struct GatewayCore {
    gateway: GatewayId,
    domain: DomainId,
    hop_margin: chrono::Duration,
    /// The payee stops revealing this long before its incoming hop expires.
    claim_grace: chrono::Duration,
    selector: RouteSelector,
    htlc: HtlcManager,
    participants: DashMap<TransactionId, Arc<Mutex<ParticipantRecord>>>,
    invoices: InvoiceBook,
    delivery: Arc<dyn DeliveryLayer>,
    storage: Option<Arc<Storage>>,
}

impl GatewayCore {
    /// Build a gateway and originate its own domain.
    pub fn new(
        config: CoreConfig,
        policy: Arc<dyn PolicyEngine>,
        ledger: Arc<dyn LedgerBackend>,
        delivery: Arc<dyn DeliveryLayer>,
    ) -> Self {
        let hop_margin = HtlcConfig::chrono(config.htlc.hop_margin);
        let claim_grace = HtlcConfig::chrono(config.htlc.claim_grace);
        let selector = RouteSelector::new(
            config.gateway.clone(),
            config.domain.clone(),
            config.limits.clone(),
            Arc::clone(&policy),
        );
        // No peers yet, so nothing to send.
        let _ = selector.originate(config.origin_attributes.clone());
        let htlc = HtlcManager::new(
            config.gateway.clone(),
            config.domain.clone(),
            config.htlc.clone(),
            ledger,
            policy,
        );
        tracing::info!(gateway = %config.gateway, domain = %config.domain, "gateway core created");
        Self {
            gateway: config.gateway,
            domain: config.domain,
            hop_margin,
            claim_grace,
            selector,
            htlc,
            participants: DashMap::new(),
            invoices: InvoiceBook::new(),
            delivery,
            storage: None,
        }
    }

    pub fn with_storage(mut self, storage: Arc<Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn gateway_id(&self) -> &GatewayId {
        &self.gateway
    }

    pub fn domain_id(&self) -> &DomainId {
        &self.domain
    }

    pub fn selector(&self) -> &RouteSelector {
        &self.selector
    }

    pub fn htlc(&self) -> &HtlcManager {
        &self.htlc
    }

    pub fn invoices(&self) -> &InvoiceBook {
        &self.invoices
    }

    pub fn routes(&self) -> Vec<(DomainId, LocalRoute)> {
        self.selector.local_rib()
    }

    pub async fn participant(&self, id: TransactionId) -> Option<ParticipantRecord> {
        let handle = self.participants.get(&id).map(|h| Arc::clone(h.value()))?;
        let rec = handle.lock().await;
        Some(rec.clone())
    }

    pub async fn transaction(&self, id: TransactionId) -> Option<TransactionView> {
        if let Some(rec) = self.htlc.get(id).await {
            return Some(TransactionView::Payer(rec));
        }
        self.participant(id).await.map(TransactionView::Participant)
    }

    fn participant_handle(
        &self,
        id: TransactionId,
    ) -> Result<Arc<Mutex<ParticipantRecord>>, GatewayError> {
        self.participants
            .get(&id)
            .map(|h| Arc::clone(h.value()))
            .ok_or(GatewayError::NotFound(id))
    }

    // --- Sessions ---

    /// A session with `info.gateway` came up: register it and return the
    /// table dump for it.
    pub fn attach_peer(&self, info: PeerInfo) -> Vec<Outbound> {
        let outbound = self.selector.add_peer(info);
        self.persist_all_routes();
        outbound
    }

    /// A session went down: withdraw its routes and unwind transactions
    /// that depended on it.
    pub async fn peer_down(&self, peer: &GatewayId, now: DateTime<Utc>) -> Vec<Outbound> {
        let down = self.selector.peer_down(peer);
        if !down.unreachable.is_empty() {
            tracing::warn!(peer = %peer, unreachable = ?down.unreachable, "destinations lost with peer");
        }
        self.persist_all_routes();
        let mut outbound = down.outbound;

        for id in self.htlc.peer_down(peer, now).await {
            self.persist_transaction(id).await;
        }

        let handles: Vec<_> = self.participants.iter().map(|h| Arc::clone(h.value())).collect();
        for handle in handles {
            let mut rec = handle.lock().await;
            let Some(side) = rec.side_of(peer) else {
                continue;
            };
            if rec.state.is_terminal() || rec.preimage.is_some() {
                continue;
            }
            let id = rec.transaction_id;
            tracing::warn!(transaction_id = %id, peer = %peer, ?side, "path neighbour down, abandoning transaction");
            let hop = rec.outgoing_hop().unwrap_or_else(|| rec.incoming_hop());
            let notice = Message::Settle {
                transaction_id: id,
                hop,
                status: SettleStatus::Aborted,
            };
            match (side, rec.downstream.clone()) {
                (Side::Upstream, Some(next)) => outbound.push(Outbound::new(next, notice)),
                (Side::Downstream, _) => outbound.push(Outbound::new(rec.upstream.clone(), notice)),
                (Side::Upstream, None) => {}
            }
            if rec.role == Role::Payee {
                self.abandon_invoice(id, "upstream session lost").await;
            }
            rec.set_state(ParticipantState::Aborted, now);
            self.persist_participant(&rec);
        }
        outbound
    }

    // --- Inbound messages ---

    /// Handle a protocol message from an established peer.
    ///
    /// Errors are protocol errors; the caller resets the session.
    /// Problems with a single transaction are logged and the message is
    /// dropped, since they are usually races with timeouts.
    pub async fn handle_message(
        &self,
        peer: &GatewayId,
        message: Message,
        now: DateTime<Utc>,
    ) -> Result<Vec<Outbound>, GatewayError> {
        if self.selector.peer(peer).is_none() {
            return Err(GatewayError::Protocol(format!(
                "{} from unknown peer {}",
                message.kind(),
                peer
            )));
        }
        message.validate()?;

        let kind = message.kind();
        match message {
            Message::Query { dest_domain, .. } => {
                Ok(vec![self.selector.answer_query(peer, &dest_domain)?])
            }
            Message::Advert(advert) => {
                let dest = advert.destination.clone();
                let update = self.selector.handle_advert(peer, advert, now)?;
                self.log_update(peer, &dest, kind, &update.outcome, update.best_changed);
                if update.outcome == UpdateOutcome::Applied || update.best_changed {
                    self.persist_routes(&dest);
                }
                Ok(update.outbound)
            }
            Message::Withdraw { dest_domain, seq } => {
                let update = self.selector.handle_withdraw(peer, &dest_domain, seq)?;
                self.log_update(peer, &dest_domain, kind, &update.outcome, update.best_changed);
                if update.outcome == UpdateOutcome::Applied {
                    self.persist_routes(&dest_domain);
                }
                Ok(update.outbound)
            }
            Message::Open { .. } | Message::Keepalive | Message::Notification { .. } => Err(
                GatewayError::Protocol(format!("session message {} reached the core", kind)),
            ),
            message => {
                let id = message.transaction_id();
                match self.handle_transaction_message(peer, message, now).await {
                    Ok(outbound) => {
                        if let Some(id) = id {
                            if self.htlc.contains(id) {
                                self.persist_transaction(id).await;
                            }
                        }
                        Ok(outbound)
                    }
                    Err(e) => {
                        tracing::warn!(
                            peer = %peer,
                            kind,
                            transaction_id = ?id,
                            error = %e,
                            "transaction message dropped"
                        );
                        Ok(Vec::new())
                    }
                }
            }
        }
    }

    fn log_update(
        &self,
        peer: &GatewayId,
        dest: &DomainId,
        kind: &'static str,
        outcome: &UpdateOutcome,
        best_changed: bool,
    ) {
        match outcome {
            UpdateOutcome::Rejected(reason) => tracing::warn!(
                peer = %peer,
                destination = %dest,
                code = reason.code(),
                %reason,
                "route rejected by import policy"
            ),
            outcome => tracing::debug!(
                peer = %peer,
                destination = %dest,
                kind,
                ?outcome,
                best_changed,
                "route update"
            ),
        }
    }

    async fn handle_transaction_message(
        &self,
        peer: &GatewayId,
        message: Message,
        now: DateTime<Utc>,
    ) -> Result<Vec<Outbound>, GatewayError> {
        match message {
            Message::Select {
                transaction_id,
                path,
                domain_path,
                amount,
                asset,
                hash_commitment,
                deadline,
            } => {
                self.on_select(
                    peer,
                    transaction_id,
                    path,
                    domain_path,
                    amount,
                    asset,
                    hash_commitment,
                    deadline,
                    now,
                )
                .await
            }
            Message::SelectAck {
                transaction_id,
                path,
                hash_commitment,
                accepted,
                reason,
            } => {
                if self.htlc.contains(transaction_id) {
                    return Ok(self
                        .htlc
                        .on_select_ack(peer, transaction_id, path, hash_commitment, accepted, reason, now)
                        .await?);
                }
                self.relay_select_ack(peer, transaction_id, path, hash_commitment, accepted, reason, now)
                    .await
            }
            Message::Lock {
                transaction_id,
                hop,
                hash_commitment,
                timeout,
                amount,
            } => {
                self.on_lock(peer, transaction_id, hop, hash_commitment, timeout, amount, now)
                    .await
            }
            Message::LockAck {
                transaction_id,
                hop,
                accepted,
                reason,
            } => {
                if self.htlc.contains(transaction_id) {
                    return Ok(self
                        .htlc
                        .on_lock_ack(peer, transaction_id, hop, accepted, reason, now)
                        .await?);
                }
                self.relay_upstream(
                    peer,
                    transaction_id,
                    Message::LockAck {
                        transaction_id,
                        hop,
                        accepted,
                        reason,
                    },
                )
                .await
            }
            Message::Serve {
                transaction_id,
                service_descriptor,
            } => self.on_serve(peer, transaction_id, service_descriptor, now).await,
            Message::Proof {
                transaction_id,
                preimage,
            } => {
                if self.htlc.contains(transaction_id) {
                    let outcome = self.htlc.on_proof(peer, transaction_id, preimage, now).await?;
                    if !outcome.inconsistent.is_empty() {
                        tracing::error!(
                            transaction_id = %transaction_id,
                            hops = ?outcome.inconsistent,
                            escalation = true,
                            "settlement inconsistency, operator action required"
                        );
                    }
                    return Ok(outcome.outbound);
                }
                self.relay_proof(peer, transaction_id, preimage, now).await
            }
            Message::Settle {
                transaction_id,
                hop,
                status,
            } => {
                if self.htlc.contains(transaction_id) {
                    if status != SettleStatus::Aborted {
                        return Err(GatewayError::Protocol(format!(
                            "payer received SETTLE {} for hop {}",
                            status, hop
                        )));
                    }
                    return Ok(self
                        .htlc
                        .on_remote_abort(peer, transaction_id, hop, now)
                        .await?);
                }
                self.on_settle(peer, transaction_id, hop, status, now).await
            }
            other => Err(GatewayError::Protocol(format!(
                "{} is not a transaction message",
                other.kind()
            ))),
        }
    }

    // --- Relay and payee side ---

    #[allow(clippy::too_many_arguments)]
    async fn on_select(
        &self,
        from: &GatewayId,
        id: TransactionId,
        path: Vec<GatewayId>,
        domain_path: Vec<DomainId>,
        amount: u64,
        asset: Asset,
        hash_commitment: Option<HashLock>,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Outbound>, GatewayError> {
        let position = path.len();
        let refusal = self.check_select(from, id, &path, &domain_path, deadline, now);
        let reject = |reason: String| {
            tracing::warn!(transaction_id = %id, peer = %from, %reason, "SELECT refused");
            Ok(vec![Outbound::new(
                from.clone(),
                Message::SelectAck {
                    transaction_id: id,
                    path: path.clone(),
                    hash_commitment: None,
                    accepted: false,
                    reason: Some(reason),
                },
            )])
        };
        if let Some(reason) = refusal {
            return reject(reason);
        }

        let mut forwarded = path.clone();
        forwarded.push(self.gateway.clone());
        let is_payee = position + 1 == domain_path.len();

        if is_payee {
            let hash = match self.invoices.create(id, amount, now) {
                Ok(hash) => hash,
                Err(e) => return reject(e.to_string()),
            };
            let mut rec = ParticipantRecord::new(
                id,
                position,
                domain_path,
                from.clone(),
                None,
                amount,
                asset,
                deadline,
                now,
            );
            rec.hash_lock = Some(hash);
            rec.set_state(ParticipantState::Selected, now);
            self.persist_participant(&rec);
            self.participants.insert(id, Arc::new(Mutex::new(rec)));
            tracing::info!(transaction_id = %id, payer = %forwarded[0], amount, "transaction accepted as payee");
            return Ok(vec![Outbound::new(
                from.clone(),
                Message::SelectAck {
                    transaction_id: id,
                    path: forwarded,
                    hash_commitment: Some(hash),
                    accepted: true,
                    reason: None,
                },
            )]);
        }

        let next_domain = &domain_path[position + 1];
        let Some(next) = self
            .selector
            .peers()
            .into_iter()
            .find(|p| &p.domain == next_domain)
        else {
            return reject(format!("no session towards {}", next_domain));
        };

        let rec = ParticipantRecord::new(
            id,
            position,
            domain_path.clone(),
            from.clone(),
            Some(next.gateway.clone()),
            amount,
            asset.clone(),
            deadline,
            now,
        );
        self.persist_participant(&rec);
        self.participants.insert(id, Arc::new(Mutex::new(rec)));
        tracing::info!(transaction_id = %id, upstream = %from, downstream = %next.gateway, "relaying SELECT");
        Ok(vec![Outbound::new(
            next.gateway,
            Message::Select {
                transaction_id: id,
                path: forwarded,
                domain_path,
                amount,
                asset,
                hash_commitment,
                deadline,
            },
        )])
    }

    /// Reason to refuse a SELECT, if any.
    fn check_select(
        &self,
        from: &GatewayId,
        id: TransactionId,
        path: &[GatewayId],
        domain_path: &[DomainId],
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let position = path.len();
        if domain_path.get(position) != Some(&self.domain) {
            return Some(format!(
                "domain path does not reach {} at position {}",
                self.domain, position
            ));
        }
        if path.last() != Some(from) {
            return Some("gateway path does not end at the sender".into());
        }
        if path.contains(&self.gateway) {
            return Some("gateway path loops".into());
        }
        let mut seen = std::collections::HashSet::new();
        if !domain_path.iter().all(|d| seen.insert(d)) {
            return Some("domain path loops".into());
        }
        let upstream_domain = &domain_path[position - 1];
        match self.selector.peer(from) {
            Some(info) if &info.domain == upstream_domain => {}
            _ => return Some(format!("sender is not in domain {}", upstream_domain)),
        }
        if self.participants.contains_key(&id) || self.htlc.contains(id) {
            return Some("duplicate transaction".into());
        }
        if deadline <= now {
            return Some("deadline passed".into());
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    async fn relay_select_ack(
        &self,
        from: &GatewayId,
        id: TransactionId,
        path: Vec<GatewayId>,
        hash_commitment: Option<HashLock>,
        accepted: bool,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Outbound>, GatewayError> {
        let handle = self.participant_handle(id)?;
        let mut rec = handle.lock().await;
        if rec.side_of(from) != Some(Side::Downstream) || rec.state != ParticipantState::Selecting {
            return Err(GatewayError::Protocol(format!(
                "unexpected SELECT_ACK from {} in state {}",
                from, rec.state
            )));
        }
        if accepted && hash_commitment.is_some() {
            rec.hash_lock = hash_commitment;
            rec.set_state(ParticipantState::Selected, now);
        } else {
            rec.set_state(ParticipantState::Aborted, now);
        }
        self.persist_participant(&rec);
        Ok(vec![Outbound::new(
            rec.upstream.clone(),
            Message::SelectAck {
                transaction_id: id,
                path,
                hash_commitment,
                accepted,
                reason,
            },
        )])
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_lock(
        &self,
        from: &GatewayId,
        id: TransactionId,
        hop: u32,
        hash: HashLock,
        timeout: DateTime<Utc>,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Outbound>, GatewayError> {
        let handle = self.participant_handle(id)?;
        let mut rec = handle.lock().await;
        if rec.side_of(from) != Some(Side::Upstream) {
            return Err(GatewayError::Protocol(format!("LOCK from non-upstream peer {}", from)));
        }
        let incoming = rec.incoming_hop();
        let outgoing = rec.outgoing_hop();
        let lock = Message::Lock {
            transaction_id: id,
            hop,
            hash_commitment: hash,
            timeout,
            amount,
        };

        if hop < incoming || (outgoing.is_none() && hop > incoming) {
            return Err(GatewayError::Protocol(format!(
                "LOCK for hop {} at position {}",
                hop, rec.position
            )));
        }
        // Further downstream: nothing to check here.
        if outgoing.map(|o| hop > o).unwrap_or(false) {
            let next = rec.downstream.clone().ok_or(GatewayError::NotFound(id))?;
            return Ok(vec![Outbound::new(next, lock)]);
        }

        match rec.observe_lock(hop, hash, timeout, amount, self.hop_margin, now) {
            Err(reason) => {
                tracing::warn!(transaction_id = %id, hop, %reason, "LOCK refused");
                self.persist_participant(&rec);
                Ok(vec![Outbound::new(
                    rec.upstream.clone(),
                    Message::LockAck {
                        transaction_id: id,
                        hop,
                        accepted: false,
                        reason: Some(reason),
                    },
                )])
            }
            Ok(()) if hop == incoming => {
                tracing::debug!(transaction_id = %id, hop, %timeout, amount, "incoming hop locked");
                self.persist_participant(&rec);
                Ok(vec![Outbound::new(
                    rec.upstream.clone(),
                    Message::LockAck {
                        transaction_id: id,
                        hop,
                        accepted: true,
                        reason: None,
                    },
                )])
            }
            Ok(()) => {
                self.persist_participant(&rec);
                let next = rec.downstream.clone().ok_or(GatewayError::NotFound(id))?;
                Ok(vec![Outbound::new(next, lock)])
            }
        }
    }

    /// Pass a message from downstream on to the upstream neighbour.
    async fn relay_upstream(
        &self,
        from: &GatewayId,
        id: TransactionId,
        message: Message,
    ) -> Result<Vec<Outbound>, GatewayError> {
        let handle = self.participant_handle(id)?;
        let rec = handle.lock().await;
        if rec.side_of(from) != Some(Side::Downstream) {
            return Err(GatewayError::Protocol(format!(
                "{} from non-downstream peer {}",
                message.kind(),
                from
            )));
        }
        Ok(vec![Outbound::new(rec.upstream.clone(), message)])
    }

    async fn on_serve(
        &self,
        from: &GatewayId,
        id: TransactionId,
        service_descriptor: String,
        now: DateTime<Utc>,
    ) -> Result<Vec<Outbound>, GatewayError> {
        let handle = self.participant_handle(id)?;
        let mut rec = handle.lock().await;
        if rec.side_of(from) != Some(Side::Upstream) || rec.state != ParticipantState::Locked {
            return Err(GatewayError::Protocol(format!(
                "unexpected SERVE from {} in state {}",
                from, rec.state
            )));
        }
        rec.set_state(ParticipantState::Serving, now);
        self.persist_participant(&rec);
        match rec.downstream.clone() {
            Some(next) => Ok(vec![Outbound::new(
                next,
                Message::Serve {
                    transaction_id: id,
                    service_descriptor,
                },
            )]),
            None => {
                tracing::info!(transaction_id = %id, service = %service_descriptor, "all hops locked, notifying delivery layer");
                self.delivery.notify_locked(id, &service_descriptor).await;
                Ok(Vec::new())
            }
        }
    }

    async fn relay_proof(
        &self,
        from: &GatewayId,
        id: TransactionId,
        preimage: Preimage,
        now: DateTime<Utc>,
    ) -> Result<Vec<Outbound>, GatewayError> {
        let handle = self.participant_handle(id)?;
        let mut rec = handle.lock().await;
        if rec.side_of(from) != Some(Side::Downstream) {
            return Err(GatewayError::Protocol(format!("PROOF from non-downstream peer {}", from)));
        }
        if !rec.observe_preimage(&preimage, now) {
            return Err(GatewayError::Protocol(format!(
                "PROOF for {} does not match the hash commitment",
                id
            )));
        }
        tracing::info!(transaction_id = %id, "preimage verified, forwarding upstream");
        self.persist_participant(&rec);
        Ok(vec![Outbound::new(
            rec.upstream.clone(),
            Message::Proof {
                transaction_id: id,
                preimage,
            },
        )])
    }

    async fn on_settle(
        &self,
        from: &GatewayId,
        id: TransactionId,
        hop: u32,
        status: SettleStatus,
        now: DateTime<Utc>,
    ) -> Result<Vec<Outbound>, GatewayError> {
        let handle = self.participant_handle(id)?;
        let mut rec = handle.lock().await;
        let notice = Message::Settle {
            transaction_id: id,
            hop,
            status,
        };
        let outbound = match rec.side_of(from) {
            Some(Side::Upstream) => {
                rec.observe_settle(hop, status, now);
                if hop == rec.incoming_hop() {
                    tracing::info!(transaction_id = %id, hop, %status, "hop outcome");
                }
                if rec.role == Role::Payee && rec.state == ParticipantState::Aborted {
                    self.abandon_invoice(id, "aborted by payer").await;
                }
                match rec.downstream.clone() {
                    Some(next) if hop > rec.incoming_hop() => vec![Outbound::new(next, notice)],
                    _ => Vec::new(),
                }
            }
            Some(Side::Downstream) if status == SettleStatus::Aborted => {
                if rec.preimage.is_none() {
                    rec.set_state(ParticipantState::Aborted, now);
                }
                vec![Outbound::new(rec.upstream.clone(), notice)]
            }
            _ => {
                return Err(GatewayError::Protocol(format!(
                    "SETTLE {} from {} out of place",
                    status, from
                )))
            }
        };
        self.persist_participant(&rec);
        Ok(outbound)
    }

    /// Cancel the invoice (if still open) and tell the delivery layer.
    async fn abandon_invoice(&self, id: TransactionId, reason: &str) {
        if self.invoices.cancel(id) {
            self.delivery.notify_aborted(id, reason).await;
        }
    }

    // --- Delivery layer ---

    /// The delivery layer provided the service: reveal the preimage.
    pub async fn confirm_delivery(
        &self,
        id: TransactionId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Outbound>, GatewayError> {
        let handle = self.participant_handle(id)?;
        let mut rec = handle.lock().await;
        if rec.role != Role::Payee {
            return Err(GatewayError::NotFound(id));
        }
        if rec.state != ParticipantState::Serving {
            return Err(GatewayError::Protocol(format!(
                "transaction {} is {}, not awaiting delivery",
                id, rec.state
            )));
        }
        // The preimage must reach the payer while every hop can still be
        // claimed; the payer gives up at the same cutoff.
        if let Some(incoming) = &rec.incoming {
            let cutoff = incoming.timeout.checked_sub_signed(self.claim_grace);
            if cutoff.map(|c| now >= c).unwrap_or(true) {
                return Err(GatewayError::Timeout(format!(
                    "hop {} too close to expiry to reveal",
                    incoming.hop
                )));
            }
        }
        let preimage = self
            .invoices
            .reveal(id)
            .map_err(|e| GatewayError::Protocol(e.to_string()))?;
        rec.preimage = Some(preimage.clone());
        rec.set_state(ParticipantState::Revealed, now);
        self.persist_participant(&rec);
        tracing::info!(transaction_id = %id, "delivery confirmed, revealing preimage");
        Ok(vec![Outbound::new(
            rec.upstream.clone(),
            Message::Proof {
                transaction_id: id,
                preimage,
            },
        )])
    }

    /// The delivery layer could not provide the service: abandon the
    /// transaction without revealing.
    pub async fn delivery_failed(
        &self,
        id: TransactionId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Outbound>, GatewayError> {
        let handle = self.participant_handle(id)?;
        let mut rec = handle.lock().await;
        if rec.role != Role::Payee {
            return Err(GatewayError::NotFound(id));
        }
        if rec.preimage.is_some() {
            return Err(GatewayError::Protocol(format!(
                "preimage for {} already revealed",
                id
            )));
        }
        if rec.state.is_terminal() {
            return Ok(Vec::new());
        }
        self.invoices.cancel(id);
        rec.set_state(ParticipantState::Aborted, now);
        self.persist_participant(&rec);
        tracing::warn!(transaction_id = %id, %reason, "delivery failed, aborting");
        Ok(vec![Outbound::new(
            rec.upstream.clone(),
            Message::Settle {
                transaction_id: id,
                hop: rec.incoming_hop(),
                status: SettleStatus::Aborted,
            },
        )])
    }

    // --- Payer side ---

    /// Start a transaction from this gateway: look up candidate paths for
    /// the payee and send SELECT along the first usable one.
    pub async fn submit(
        &self,
        tx: Transaction,
        now: DateTime<Utc>,
    ) -> Result<(TransactionId, Vec<Outbound>), GatewayError> {
        if tx.payer != self.gateway {
            return Err(GatewayError::Protocol(format!(
                "payer {} is not this gateway",
                tx.payer
            )));
        }
        let payee = tx.payee.clone();
        let id = self.htlc.create(tx, now)?;
        let candidates: Vec<CandidatePath> = self
            .selector
            .candidates(&payee)
            .into_iter()
            .map(|r| CandidatePath {
                first_hop: r.peer,
                route: r.advert,
            })
            .collect();
        tracing::debug!(transaction_id = %id, payee = %payee, candidates = candidates.len(), "candidate paths");
        let result = self.htlc.submit_candidates(id, candidates, now).await;
        self.persist_transaction(id).await;
        Ok((id, result?))
    }

    /// Convenience wrapper around [`GatewayCore::submit`].
    pub async fn send(
        &self,
        payee: DomainId,
        amount: u64,
        asset: Asset,
        service: impl Into<String>,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(TransactionId, Vec<Outbound>), GatewayError> {
        let tx = Transaction::new(self.gateway.clone(), payee, amount, asset, service, deadline);
        self.submit(tx, now).await
    }

    /// Payer cancellation, allowed until every hop is locked.
    pub async fn cancel(
        &self,
        id: TransactionId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Outbound>, GatewayError> {
        let result = self.htlc.cancel(id, now).await;
        self.persist_transaction(id).await;
        Ok(result?)
    }

    // --- Timers ---

    /// Fire every due timeout. Called periodically by the runtime.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<Outbound> {
        let report = self.htlc.sweep(now).await;
        if !report.is_empty() {
            tracing::debug!(
                aborted = report.aborted.len(),
                refunded = report.refunded.len(),
                released = report.released.len(),
                "sweep"
            );
        }
        let mut touched: Vec<TransactionId> = report
            .aborted
            .iter()
            .copied()
            .chain(report.refunded.iter().map(|(id, _)| *id))
            .chain(report.released.iter().map(|(id, _)| *id))
            .collect();
        touched.sort();
        touched.dedup();
        for id in touched {
            self.persist_transaction(id).await;
        }

        let handles: Vec<_> = self
            .participants
            .iter()
            .map(|h| (*h.key(), Arc::clone(h.value())))
            .collect();
        for (id, handle) in handles {
            let mut rec = handle.lock().await;
            if rec.role == Role::Payee && rec.preimage.is_none() && !rec.state.is_terminal() {
                let expired = rec
                    .incoming
                    .as_ref()
                    .map(|inc| now >= inc.timeout)
                    .unwrap_or(now >= rec.deadline);
                if expired {
                    self.abandon_invoice(id, "incoming hop expired").await;
                    rec.set_state(ParticipantState::Aborted, now);
                    self.persist_participant(&rec);
                }
            }
            if rec.is_finished(now) {
                drop(rec);
                self.participants.remove(&id);
                self.invoices.remove(id);
                if let Some(storage) = &self.storage {
                    if let Err(e) = storage.delete_participant(id) {
                        tracing::error!(transaction_id = %id, error = %e, "failed to delete participant");
                    }
                }
                tracing::debug!(transaction_id = %id, "participant record retired");
            }
        }
        report.outbound
    }

    // --- Persistence ---

    /// Reload routes, transactions and participant records from storage.
    /// Returns the messages produced by resuming in-flight transactions.
    pub async fn restore(&self, now: DateTime<Utc>) -> Result<Vec<Outbound>, GatewayError> {
        let Some(storage) = self.storage.clone() else {
            return Ok(Vec::new());
        };
        let storage_err = |e: anyhow::Error| GatewayError::Storage(e.to_string());

        let routes = storage.load_adj_rib_in().map_err(storage_err)?;
        self.selector.restore(routes);

        let records = storage.load_transactions().map_err(storage_err)?;
        let htlcs = storage.load_htlcs().map_err(storage_err)?;
        let ids: Vec<TransactionId> = records.iter().map(|r| r.id()).collect();
        let outbound = self.htlc.restore(records, htlcs, now).await;
        for id in ids {
            self.persist_transaction(id).await;
        }

        let participants = storage.load_participants().map_err(storage_err)?;
        let count = participants.len();
        for stored in participants {
            if let Some(invoice) = stored.invoice {
                self.invoices.restore(invoice);
            }
            let id = stored.record.transaction_id;
            self.participants.insert(id, Arc::new(Mutex::new(stored.record)));
        }
        tracing::info!(participants = count, "gateway state restored");
        Ok(outbound)
    }

    fn persist_routes(&self, dest: &DomainId) {
        let Some(storage) = &self.storage else {
            return;
        };
        let routes = self.selector.table().candidates(dest);
        let best = self.selector.best(dest);
        if let Err(e) = storage.replace_routes(dest, &routes, best.as_ref()) {
            tracing::error!(destination = %dest, error = %e, "failed to persist routes");
        }
    }

    fn persist_all_routes(&self) {
        if self.storage.is_none() {
            return;
        }
        for dest in self.selector.table().destinations() {
            self.persist_routes(&dest);
        }
    }

    async fn persist_transaction(&self, id: TransactionId) {
        let Some(storage) = &self.storage else {
            return;
        };
        if let Some(rec) = self.htlc.get(id).await {
            if let Err(e) = storage.put_transaction(&rec) {
                tracing::error!(transaction_id = %id, error = %e, "failed to persist transaction");
            }
        }
        for htlc in self.htlc.arena().for_transaction(id) {
            if let Err(e) = storage.put_htlc(&htlc) {
                tracing::error!(transaction_id = %id, hop = htlc.hop, error = %e, "failed to persist HTLC");
            }
        }
    }

    fn persist_participant(&self, rec: &ParticipantRecord) {
        let Some(storage) = &self.storage else {
            return;
        };
        let stored = StoredParticipant {
            record: rec.clone(),
            invoice: self.invoices.get(rec.transaction_id),
        };
        if let Err(e) = storage.put_participant(&stored) {
            tracing::error!(transaction_id = %rec.transaction_id, error = %e, "failed to persist participant");
        }
    }
}
