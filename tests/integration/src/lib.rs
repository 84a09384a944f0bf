//! In-process gateway network for integration tests.
//!
//! Gateways are plain [`GatewayCore`]s. Links are pairs of attached peers;
//! messages travel through one FIFO queue and are delivered only while the
//! link they use is up. Every gateway settles on the same in-memory ledger.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tgp_core::{Asset, DomainId, GatewayId, Message, Outbound};
use tgp_gateway::{CoreConfig, DeliveryQueue, GatewayCore, GatewayError};
use tgp_policy::{AcceptAll, PolicyEngine};
use tgp_routing::PeerInfo;
use tgp_settlement::InternalLedger;

/// Bound on deliveries per pump; a protocol loop would otherwise spin.
const MAX_DELIVERIES: usize = 10_000;

pub struct Node {
    pub core: GatewayCore,
    pub delivery: Arc<DeliveryQueue>,
}

/// A message that reached a gateway and was refused at protocol level.
#[derive(Debug)]
pub struct Refused {
    pub from: GatewayId,
    pub to: GatewayId,
    pub kind: &'static str,
    pub error: GatewayError,
}

pub struct Network {
    pub ledger: Arc<InternalLedger>,
    pub now: DateTime<Utc>,
    nodes: BTreeMap<GatewayId, Node>,
    links: HashSet<(GatewayId, GatewayId)>,
    queue: VecDeque<(GatewayId, Outbound)>,
    pub refused: Vec<Refused>,
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl Network {
    pub fn new() -> Self {
        Self {
            ledger: Arc::new(InternalLedger::new()),
            now: Utc::now(),
            nodes: BTreeMap::new(),
            links: HashSet::new(),
            queue: VecDeque::new(),
            refused: Vec::new(),
        }
    }

    /// Add a gateway `gw-<domain>` for `domain` with default settings.
    pub fn add(&mut self, domain: &str) -> GatewayId {
        let config = CoreConfig::new(format!("gw-{}", domain.to_lowercase()), domain);
        self.add_with(config, Arc::new(AcceptAll))
    }

    pub fn add_with(&mut self, config: CoreConfig, policy: Arc<dyn PolicyEngine>) -> GatewayId {
        let id = config.gateway.clone();
        let delivery = Arc::new(DeliveryQueue::new());
        let core = GatewayCore::new(config, policy, self.ledger.clone(), delivery.clone());
        self.nodes.insert(id.clone(), Node { core, delivery });
        id
    }

    pub fn node(&self, gw: &GatewayId) -> &Node {
        &self.nodes[gw]
    }

    pub fn core(&self, gw: &GatewayId) -> &GatewayCore {
        &self.nodes[gw].core
    }

    pub fn deposit(&self, domain: &str, amount: u64) {
        self.ledger.deposit(&DomainId::from(domain), &usd(), amount);
    }

    pub fn balance(&self, domain: &str) -> i128 {
        self.ledger.balance(&DomainId::from(domain), &usd())
    }

    fn link_key(a: &GatewayId, b: &GatewayId) -> (GatewayId, GatewayId) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    pub fn is_linked(&self, a: &GatewayId, b: &GatewayId) -> bool {
        self.links.contains(&Self::link_key(a, b))
    }

    /// Bring up a session between `a` and `b`; `cost` is the link cost both
    /// sides use.
    pub fn connect(&mut self, a: &GatewayId, b: &GatewayId, cost: u64) {
        self.links.insert(Self::link_key(a, b));
        for (local, remote) in [(a, b), (b, a)] {
            let info = PeerInfo {
                gateway: remote.clone(),
                domain: self.core(remote).domain_id().clone(),
                link_cost: cost,
            };
            let out = self.core(local).attach_peer(info);
            self.enqueue(local, out);
        }
    }

    /// Tear down the session between `a` and `b` on both sides.
    pub async fn disconnect(&mut self, a: &GatewayId, b: &GatewayId) {
        self.links.remove(&Self::link_key(a, b));
        for (local, remote) in [(a, b), (b, a)] {
            let out = self.core(local).peer_down(remote, self.now).await;
            self.enqueue(local, out);
        }
    }

    pub fn enqueue(&mut self, from: &GatewayId, outbound: Vec<Outbound>) {
        self.queue
            .extend(outbound.into_iter().map(|o| (from.clone(), o)));
    }

    /// Deliver queued messages until the network is quiet. Returns the
    /// number delivered.
    pub async fn pump(&mut self) -> usize {
        let mut delivered = 0;
        while let Some((from, Outbound { peer: to, message })) = self.queue.pop_front() {
            if !self.is_linked(&from, &to) {
                tracing::debug!(%from, %to, kind = message.kind(), "dropped on a down link");
                continue;
            }
            delivered += 1;
            assert!(delivered <= MAX_DELIVERIES, "message pump did not converge");
            let kind = message.kind();
            let result = self.core(&to).handle_message(&from, message, self.now).await;
            match result {
                Ok(out) => self.enqueue(&to, out),
                Err(error) => self.refused.push(Refused {
                    from: from.clone(),
                    to: to.clone(),
                    kind,
                    error,
                }),
            }
        }
        delivered
    }

    /// Move the clock forward, run every sweeper and deliver the results.
    pub async fn advance(&mut self, by: Duration) {
        self.tick(by).await;
        self.pump().await;
    }

    /// Move the clock forward and run every sweeper, leaving what they
    /// produce in the queue.
    pub async fn tick(&mut self, by: Duration) {
        self.now += by;
        let ids: Vec<GatewayId> = self.nodes.keys().cloned().collect();
        for id in ids {
            let out = self.core(&id).sweep(self.now).await;
            self.enqueue(&id, out);
        }
    }

    /// Discard queued messages matching `lost(from, to, message)`. Returns
    /// how many were dropped.
    pub fn lose(&mut self, lost: impl Fn(&GatewayId, &GatewayId, &Message) -> bool) -> usize {
        let before = self.queue.len();
        self.queue
            .retain(|(from, o)| !lost(from, &o.peer, &o.message));
        before - self.queue.len()
    }

    /// Submit a transaction at `payer` and pump until quiet.
    pub async fn send(
        &mut self,
        payer: &GatewayId,
        payee: &str,
        amount: u64,
        deadline_in: Duration,
    ) -> Result<tgp_core::TransactionId, GatewayError> {
        let deadline = self.now + deadline_in;
        let (id, out) = self
            .core(payer)
            .send(DomainId::from(payee), amount, usd(), "svc://test", deadline, self.now)
            .await?;
        self.enqueue(payer, out);
        self.pump().await;
        Ok(id)
    }

    /// Confirm delivery at the payee gateway and pump until quiet.
    pub async fn deliver(
        &mut self,
        payee: &GatewayId,
        id: tgp_core::TransactionId,
    ) -> Result<(), GatewayError> {
        let out = self.core(payee).confirm_delivery(id, self.now).await?;
        self.node(payee).delivery.take(id);
        self.enqueue(payee, out);
        self.pump().await;
        Ok(())
    }

    /// Messages currently queued, for assertions on what a step produced.
    pub fn queued(&self) -> Vec<(GatewayId, GatewayId, Message)> {
        self.queue
            .iter()
            .map(|(from, o)| (from.clone(), o.peer.clone(), o.message.clone()))
            .collect()
    }
}

pub fn usd() -> Asset {
    Asset::new("USD")
}
