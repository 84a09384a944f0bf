use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tgp_core::{
    DomainId, GatewayId, Message, Outbound, PolicyAttributes, ProtocolLimits, RouteAdvertisement,
};
use tgp_policy::{Direction, PolicyDecision, PolicyEngine, PolicySubject, RejectReason};

use crate::error::RoutingError;
use crate::rib::{DestinationEntry, LearnedRoute, LocalRoute, RouteSource, RoutingTable};

/// A directly connected peer gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub gateway: GatewayId,
    pub domain: DomainId,
    /// Cost of forwarding over the link to this peer. Added to routes learned
    /// from it when they are re-advertised.
    pub link_cost: u64,
}

/// What happened to an inbound ADVERT or WITHDRAW.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied,
    /// Same route and sequence number as already stored.
    Duplicate,
    /// Older than what is stored, or nothing to withdraw.
    Stale,
    /// Path contains the local domain.
    Loop,
    PathTooLong,
    /// Recorded relay fees add up to more than the advertised cost.
    FeesExceedCost,
    Rejected(RejectReason),
}

#[derive(Debug, Clone)]
pub struct RouteUpdate {
    pub outcome: UpdateOutcome,
    pub best_changed: bool,
    pub outbound: Vec<Outbound>,
}

impl RouteUpdate {
    fn unchanged(outcome: UpdateOutcome) -> Self {
        Self {
            outcome,
            best_changed: false,
            outbound: Vec::new(),
        }
    }
}

/// Result of tearing down a peer.
#[derive(Debug, Clone, Default)]
pub struct PeerDown {
    /// Destinations that became unreachable.
    pub unreachable: Vec<DomainId>,
    pub outbound: Vec<Outbound>,
}

/// Best-path selection and propagation for one gateway.
///
/// Every operation returns the messages to send instead of sending them, so
/// session workers stay the only writers of their streams.
pub struct RouteSelector {
    local_gateway: GatewayId,
    local_domain: DomainId,
    limits: ProtocolLimits,
    default_link_cost: u64,
    table: RoutingTable,
    peers: DashMap<GatewayId, PeerInfo>,
    policy: Arc<dyn PolicyEngine>,
}

impl RouteSelector {
    pub fn new(
        local_gateway: GatewayId,
        local_domain: DomainId,
        limits: ProtocolLimits,
        policy: Arc<dyn PolicyEngine>,
    ) -> Self {
        Self {
            local_gateway,
            local_domain,
            limits,
            default_link_cost: 1,
            table: RoutingTable::new(),
            peers: DashMap::new(),
            policy,
        }
    }

    /// Link cost applied to restored routes whose peer is not connected.
    pub fn with_default_link_cost(mut self, cost: u64) -> Self {
        self.default_link_cost = cost;
        self
    }

    pub fn local_domain(&self) -> &DomainId {
        &self.local_domain
    }

    pub fn local_gateway(&self) -> &GatewayId {
        &self.local_gateway
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn peer(&self, gateway: &GatewayId) -> Option<PeerInfo> {
        self.peers.get(gateway).map(|p| p.value().clone())
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut out: Vec<PeerInfo> = self.peers.iter().map(|p| p.value().clone()).collect();
        out.sort_by(|a, b| a.gateway.cmp(&b.gateway));
        out
    }

    /// Announce the local domain with the given attributes.
    pub fn originate(&self, attributes: PolicyAttributes) -> Vec<Outbound> {
        let dest = self.local_domain.clone();
        let mut entry = self.table.entry(&dest);
        entry.originated = Some(RouteAdvertisement::originate(dest.clone(), attributes, 0));
        let (_, outbound) = self.reselect(&mut entry, &dest);
        outbound
    }

    /// Register a peer whose session just came up and return the full
    /// table dump for it. State left over from an earlier session with the
    /// same peer is discarded first.
    pub fn add_peer(&self, info: PeerInfo) -> Vec<Outbound> {
        let gateway = info.gateway.clone();
        self.peers.remove(&gateway);
        let mut outbound = self.purge_peer(&gateway);
        self.peers.insert(gateway.clone(), info.clone());
        tracing::info!(peer = %gateway, domain = %info.domain, "routing peer added");

        for dest in self.table.destinations() {
            let (best, seq) = self.table.best_with_seq(&dest);
            if let Some(out) = self.export_to(&info, best.as_ref(), &dest, seq) {
                outbound.push(out);
            }
        }
        outbound
    }

    /// Tear down a peer: every route learned from it is withdrawn and the
    /// affected destinations are re-selected and re-propagated.
    pub fn peer_down(&self, peer: &GatewayId) -> PeerDown {
        if self.peers.remove(peer).is_some() {
            tracing::info!(peer = %peer, "routing peer removed");
        }
        let mut result = PeerDown::default();
        for dest in self.table.destinations_via(peer) {
            let mut entry = self.table.entry(&dest);
            entry.adj_in.remove(peer);
            entry.withdrawn.remove(peer);
            let (changed, outbound) = self.reselect(&mut entry, &dest);
            if changed && entry.best.is_none() {
                result.unreachable.push(dest.clone());
            }
            result.outbound.extend(outbound);
        }
        self.table.clear_sent(peer);
        result
    }

    pub fn handle_advert(
        &self,
        peer: &GatewayId,
        mut advert: RouteAdvertisement,
        now: DateTime<Utc>,
    ) -> Result<RouteUpdate, RoutingError> {
        let info = self
            .peer(peer)
            .ok_or_else(|| RoutingError::UnknownPeer(peer.clone()))?;

        let structural = ProtocolLimits {
            max_path_len: usize::MAX,
            ..self.limits.clone()
        };
        advert
            .validate(&structural)
            .map_err(|source| RoutingError::InvalidAdvertisement {
                peer: peer.clone(),
                source,
            })?;
        if let Some(first) = advert.next_domain() {
            if *first != info.domain {
                return Err(RoutingError::WrongFirstHop {
                    peer: peer.clone(),
                    first: first.clone(),
                    expected: info.domain.clone(),
                });
            }
        }

        let dest = advert.destination.clone();
        let mut entry = self.table.entry(&dest);

        if let Some(existing) = entry.adj_in.get(peer) {
            if advert.seq < existing.advert.seq {
                tracing::debug!(peer = %peer, destination = %dest, seq = advert.seq, "stale advert ignored");
                return Ok(RouteUpdate::unchanged(UpdateOutcome::Stale));
            }
            if advert.seq == existing.advert.seq && existing.advert.same_route(&advert) {
                return Ok(RouteUpdate::unchanged(UpdateOutcome::Duplicate));
            }
        }
        if let Some(withdrawn_at) = entry.withdrawn.get(peer) {
            if advert.seq <= *withdrawn_at {
                tracing::debug!(peer = %peer, destination = %dest, seq = advert.seq, "advert older than withdraw ignored");
                return Ok(RouteUpdate::unchanged(UpdateOutcome::Stale));
            }
        }

        // An unusable advert still supersedes the peer's previous one.
        let unusable = if advert.contains(&self.local_domain) {
            tracing::debug!(
                peer = %peer,
                destination = %dest,
                path = %advert.path_string(),
                "advert rejected: path contains local domain"
            );
            Some(UpdateOutcome::Loop)
        } else if advert.path_len() > self.limits.max_path_len {
            tracing::debug!(peer = %peer, destination = %dest, len = advert.path_len(), "advert rejected: path too long");
            Some(UpdateOutcome::PathTooLong)
        } else if !advert.fees_within_cost() {
            tracing::debug!(peer = %peer, destination = %dest, cost = advert.cost, "advert rejected: fees exceed cost");
            Some(UpdateOutcome::FeesExceedCost)
        } else {
            let subject = PolicySubject::Route {
                peer,
                advert: &advert,
            };
            match self.policy.evaluate(subject, Direction::Import) {
                PolicyDecision::Accept => None,
                PolicyDecision::Modify(attrs) => {
                    advert.attributes = attrs;
                    (!advert.fees_within_cost()).then_some(UpdateOutcome::FeesExceedCost)
                }
                PolicyDecision::Reject(reason) => Some(UpdateOutcome::Rejected(reason)),
            }
        };

        if let Some(outcome) = unusable {
            if entry.adj_in.remove(peer).is_none() {
                return Ok(RouteUpdate::unchanged(outcome));
            }
            let (best_changed, outbound) = self.reselect(&mut entry, &dest);
            return Ok(RouteUpdate {
                outcome,
                best_changed,
                outbound,
            });
        }

        entry.withdrawn.remove(peer);
        entry.adj_in.insert(
            peer.clone(),
            LearnedRoute {
                peer: peer.clone(),
                advert,
                received_at: now,
            },
        );
        let (best_changed, outbound) = self.reselect(&mut entry, &dest);
        Ok(RouteUpdate {
            outcome: UpdateOutcome::Applied,
            best_changed,
            outbound,
        })
    }

    pub fn handle_withdraw(
        &self,
        peer: &GatewayId,
        dest: &DomainId,
        seq: u64,
    ) -> Result<RouteUpdate, RoutingError> {
        if !self.peers.contains_key(peer) {
            return Err(RoutingError::UnknownPeer(peer.clone()));
        }
        let mut entry = self.table.entry(dest);
        let stored_seq = match entry.adj_in.get(peer) {
            Some(existing) => existing.advert.seq,
            None => return Ok(RouteUpdate::unchanged(UpdateOutcome::Stale)),
        };
        if seq < stored_seq {
            tracing::debug!(peer = %peer, destination = %dest, seq, stored_seq, "stale withdraw ignored");
            return Ok(RouteUpdate::unchanged(UpdateOutcome::Stale));
        }

        entry.adj_in.remove(peer);
        entry.withdrawn.insert(peer.clone(), seq);
        tracing::debug!(peer = %peer, destination = %dest, seq, "route withdrawn");
        let (best_changed, outbound) = self.reselect(&mut entry, dest);
        Ok(RouteUpdate {
            outcome: UpdateOutcome::Applied,
            best_changed,
            outbound,
        })
    }

    /// Reply to a QUERY from `peer`: the route we would advertise to it, or a
    /// WITHDRAW when there is none.
    pub fn answer_query(&self, peer: &GatewayId, dest: &DomainId) -> Result<Outbound, RoutingError> {
        let info = self
            .peer(peer)
            .ok_or_else(|| RoutingError::UnknownPeer(peer.clone()))?;
        let (best, seq) = self.table.best_with_seq(dest);
        let message = match best.as_ref().and_then(|b| self.exportable(&info, b, seq)) {
            Some(ad) => {
                self.table.record_sent(peer, ad.clone());
                Message::Advert(ad)
            }
            None => Message::Withdraw {
                dest_domain: dest.clone(),
                seq,
            },
        };
        Ok(Outbound::new(peer.clone(), message))
    }

    /// Transaction candidates for `dest`: every Adj-RIB-In entry from a
    /// connected peer, in best-path order.
    pub fn candidates(&self, dest: &DomainId) -> Vec<LearnedRoute> {
        self.table
            .candidates(dest)
            .into_iter()
            .filter(|r| self.peers.contains_key(&r.peer))
            .collect()
    }

    pub fn best(&self, dest: &DomainId) -> Option<LocalRoute> {
        self.table.best(dest)
    }

    pub fn local_rib(&self) -> Vec<(DomainId, LocalRoute)> {
        self.table.local_rib()
    }

    pub fn adj_rib_in(&self) -> Vec<LearnedRoute> {
        self.table.adj_rib_in()
    }

    /// Reload persisted Adj-RIB-In entries. Nothing is propagated; peers get
    /// the resulting routes in their table dump once their session is up.
    pub fn restore(&self, routes: Vec<LearnedRoute>) {
        let count = routes.len();
        for learned in routes {
            let dest = learned.advert.destination.clone();
            if learned.advert.contains(&self.local_domain) {
                continue;
            }
            let mut entry = self.table.entry(&dest);
            entry.adj_in.insert(learned.peer.clone(), learned);
            let _ = self.reselect(&mut entry, &dest);
        }
        tracing::info!(count, "restored Adj-RIB-In entries");
    }

    fn purge_peer(&self, peer: &GatewayId) -> Vec<Outbound> {
        self.table.clear_sent(peer);
        let mut outbound = Vec::new();
        for dest in self.table.destinations() {
            let mut entry = self.table.entry(&dest);
            entry.withdrawn.remove(peer);
            if entry.adj_in.remove(peer).is_some() {
                let (_, out) = self.reselect(&mut entry, &dest);
                outbound.extend(out);
            }
        }
        outbound
    }

    /// Recompute the best route for `dest` and, if it changed, propagate the
    /// change to every peer.
    fn reselect(&self, entry: &mut DestinationEntry, dest: &DomainId) -> (bool, Vec<Outbound>) {
        let new_best = entry.select_best();
        let changed = match (&entry.best, &new_best) {
            (None, None) => false,
            (Some(old), Some(new)) => old.source != new.source || !old.advert.same_route(&new.advert),
            _ => true,
        };
        entry.best = new_best;
        if !changed {
            return (false, Vec::new());
        }

        let seq = entry.next_seq();
        match &entry.best {
            Some(best) => tracing::info!(
                destination = %dest,
                path = %best.advert.path_string(),
                cost = best.advert.cost,
                via = %best.peer().map(GatewayId::as_str).unwrap_or("local"),
                seq,
                "best route changed"
            ),
            None => tracing::info!(destination = %dest, seq, "destination unreachable"),
        }

        let peers: Vec<PeerInfo> = self.peers.iter().map(|p| p.value().clone()).collect();
        let outbound = peers
            .iter()
            .filter_map(|peer| self.export_to(peer, entry.best.as_ref(), dest, seq))
            .collect();
        (true, outbound)
    }

    /// Bring the Adj-RIB-Out for (`peer`, `dest`) in line with `best`.
    fn export_to(
        &self,
        peer: &PeerInfo,
        best: Option<&LocalRoute>,
        dest: &DomainId,
        seq: u64,
    ) -> Option<Outbound> {
        match best.and_then(|b| self.exportable(peer, b, seq)) {
            Some(ad) => {
                if let Some(prev) = self.table.sent(&peer.gateway, dest) {
                    if prev.same_route(&ad) {
                        return None;
                    }
                }
                self.table.record_sent(&peer.gateway, ad.clone());
                Some(Outbound::new(peer.gateway.clone(), Message::Advert(ad)))
            }
            None => self.table.take_sent(&peer.gateway, dest).map(|_| {
                Outbound::new(
                    peer.gateway.clone(),
                    Message::Withdraw {
                        dest_domain: dest.clone(),
                        seq,
                    },
                )
            }),
        }
    }

    /// The advertisement `peer` should see for `best`, if any.
    fn exportable(&self, peer: &PeerInfo, best: &LocalRoute, seq: u64) -> Option<RouteAdvertisement> {
        // Split horizon.
        if best.peer() == Some(&peer.gateway) {
            return None;
        }
        if best.advert.contains(&peer.domain) {
            return None;
        }

        let mut ad = match &best.source {
            RouteSource::Local => {
                let mut own = best.advert.clone();
                own.seq = seq;
                own
            }
            RouteSource::Peer(from) => {
                let link_cost = self
                    .peers
                    .get(from)
                    .map(|p| p.link_cost)
                    .unwrap_or(self.default_link_cost);
                best.advert.extend(&self.local_domain, link_cost, seq)
            }
        };
        if ad.path_len() > self.limits.max_path_len {
            return None;
        }

        let subject = PolicySubject::Route {
            peer: &peer.gateway,
            advert: &ad,
        };
        match self.policy.evaluate(subject, Direction::Export) {
            PolicyDecision::Accept => Some(ad),
            PolicyDecision::Modify(attrs) => {
                ad.attributes = attrs;
                Some(ad)
            }
            PolicyDecision::Reject(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use tgp_policy::{AcceptAll, DenyRule, DefaultPolicyEngine, PolicyConfig};

    struct Net {
        nodes: HashMap<GatewayId, RouteSelector>,
        pending: VecDeque<(GatewayId, Outbound)>,
    }

    impl Net {
        fn new(domains: &[&str]) -> Self {
            let mut nodes = HashMap::new();
            for d in domains {
                let gw = gw(d);
                let sel = RouteSelector::new(
                    gw.clone(),
                    DomainId::from(*d),
                    ProtocolLimits::default(),
                    Arc::new(AcceptAll),
                );
                nodes.insert(gw, sel);
            }
            Self {
                nodes,
                pending: VecDeque::new(),
            }
        }

        fn originate_all(&mut self) {
            for (gw, sel) in &self.nodes {
                for out in sel.originate(PolicyAttributes::new()) {
                    self.pending.push_back((gw.clone(), out));
                }
            }
        }

        fn link(&mut self, a: &str, b: &str, cost: u64) {
            for (x, y) in [(a, b), (b, a)] {
                let outs = self.nodes[&gw(x)].add_peer(PeerInfo {
                    gateway: gw(y),
                    domain: DomainId::from(y),
                    link_cost: cost,
                });
                for out in outs {
                    self.pending.push_back((gw(x), out));
                }
            }
        }

        fn deliver(&mut self, from: GatewayId, out: Outbound) -> Vec<(GatewayId, Outbound)> {
            let node = &self.nodes[&out.peer];
            let update = match out.message {
                Message::Advert(ad) => node.handle_advert(&from, ad, Utc::now()).unwrap(),
                Message::Withdraw { dest_domain, seq } => {
                    node.handle_withdraw(&from, &dest_domain, seq).unwrap()
                }
                other => panic!("unexpected {:?}", other),
            };
            update
                .outbound
                .into_iter()
                .map(|o| (out.peer.clone(), o))
                .collect()
        }

        /// Deliver in rounds until quiet; returns the number of rounds.
        fn run(&mut self) -> usize {
            let mut rounds = 0;
            while !self.pending.is_empty() {
                rounds += 1;
                let batch: Vec<_> = self.pending.drain(..).collect();
                for (from, out) in batch {
                    let next = self.deliver(from, out);
                    self.pending.extend(next);
                }
                assert!(rounds < 64, "routing did not converge");
            }
            rounds
        }

        fn best(&self, at: &str, dest: &str) -> Option<LocalRoute> {
            self.nodes[&gw(at)].best(&DomainId::from(dest))
        }
    }

    fn gw(d: &str) -> GatewayId {
        GatewayId::new(format!("gw-{}", d.to_lowercase()))
    }

    fn path(route: &LocalRoute) -> String {
        route.advert.path_string()
    }

    #[test]
    fn test_three_domain_advert() {
        let mut net = Net::new(&["A", "B", "C"]);
        net.originate_all();
        net.link("A", "B", 1);
        net.link("B", "C", 5);
        net.run();

        let best = net.best("A", "C").unwrap();
        assert_eq!(path(&best), "B,C");
        assert_eq!(best.advert.cost, 5);
        assert_eq!(best.peer(), Some(&gw("B")));
        assert_eq!(best.advert.relay_fees(), vec![5]);
    }

    #[test]
    fn test_line_converges_within_diameter() {
        let mut net = Net::new(&["A", "B", "C", "D"]);
        net.originate_all();
        net.link("A", "B", 1);
        net.link("B", "C", 1);
        net.link("C", "D", 1);
        let rounds = net.run();
        assert!(rounds <= 3, "took {} rounds", rounds);

        for (at, dest, expected) in [("A", "D", "B,C,D"), ("D", "A", "C,B,A"), ("B", "D", "C,D")] {
            assert_eq!(path(&net.best(at, dest).unwrap()), expected);
        }
        let before = net.nodes[&gw("A")].local_rib();
        assert_eq!(net.run(), 0);
        assert_eq!(net.nodes[&gw("A")].local_rib(), before);
    }

    #[test]
    fn test_prefers_cheaper_path_then_fails_over() {
        // A - B - C and A - E - C; the E side is cheaper.
        let mut net = Net::new(&["A", "B", "C", "E"]);
        net.originate_all();
        net.link("A", "B", 1);
        net.link("A", "E", 1);
        net.link("B", "C", 5);
        net.link("E", "C", 2);
        net.run();
        assert_eq!(path(&net.best("A", "C").unwrap()), "E,C");

        let a = &net.nodes[&gw("A")];
        let candidates: Vec<String> = a
            .candidates(&DomainId::from("C"))
            .iter()
            .map(|r| r.advert.path_string())
            .collect();
        assert_eq!(candidates, vec!["E,C", "B,C"]);

        let down = a.peer_down(&gw("E"));
        assert!(!down.unreachable.contains(&DomainId::from("C")));
        assert_eq!(path(&net.best("A", "C").unwrap()), "B,C");
    }

    #[test]
    fn test_peer_down_makes_destination_unreachable() {
        let mut net = Net::new(&["A", "B", "C"]);
        net.originate_all();
        net.link("A", "B", 1);
        net.link("B", "C", 1);
        net.run();

        let b = &net.nodes[&gw("B")];
        let down = b.peer_down(&gw("C"));
        assert_eq!(down.unreachable, vec![DomainId::from("C")]);
        // A had learned C through B, so B withdraws it.
        assert!(down.outbound.iter().any(|o| o.peer == gw("A")
            && matches!(&o.message, Message::Withdraw { dest_domain, .. } if *dest_domain == DomainId::from("C"))));
        for out in down.outbound {
            net.pending.push_back((gw("B"), out));
        }
        net.run();
        assert!(net.best("A", "C").is_none());
    }

    #[test]
    fn test_loop_rejected_and_not_stored() {
        let net = {
            let mut n = Net::new(&["A", "B"]);
            n.link("A", "B", 1);
            n.pending.clear();
            n
        };
        let a = &net.nodes[&gw("A")];
        let ad = RouteAdvertisement {
            destination: DomainId::from("C"),
            path: vec![DomainId::from("B"), DomainId::from("A"), DomainId::from("C")],
            cost: 3,
            attributes: PolicyAttributes::new(),
            originated_at: Utc::now(),
            seq: 1,
        };
        let update = a.handle_advert(&gw("B"), ad, Utc::now()).unwrap();
        assert_eq!(update.outcome, UpdateOutcome::Loop);
        assert!(a.adj_rib_in().is_empty());
        assert!(a.best(&DomainId::from("C")).is_none());
    }

    #[test]
    fn test_idempotent_redelivery() {
        let mut net = Net::new(&["A", "B", "C"]);
        net.link("A", "B", 1);
        net.pending.clear();
        let a = &net.nodes[&gw("A")];
        let ad = RouteAdvertisement {
            destination: DomainId::from("C"),
            path: vec![DomainId::from("B"), DomainId::from("C")],
            cost: 5,
            attributes: PolicyAttributes::new(),
            originated_at: Utc::now(),
            seq: 7,
        };
        let first = a.handle_advert(&gw("B"), ad.clone(), Utc::now()).unwrap();
        assert_eq!(first.outcome, UpdateOutcome::Applied);
        assert!(first.best_changed);
        let rib = a.local_rib();

        let second = a.handle_advert(&gw("B"), ad.clone(), Utc::now()).unwrap();
        assert_eq!(second.outcome, UpdateOutcome::Duplicate);
        assert!(!second.best_changed);
        assert!(second.outbound.is_empty());
        assert_eq!(a.local_rib(), rib);

        let mut older = ad;
        older.seq = 6;
        older.cost = 1;
        assert_eq!(a.handle_advert(&gw("B"), older, Utc::now()).unwrap().outcome, UpdateOutcome::Stale);
        assert_eq!(a.best(&DomainId::from("C")).unwrap().advert.cost, 5);
    }

    #[test]
    fn test_withdraw_sequencing() {
        let mut net = Net::new(&["A", "B"]);
        net.link("A", "B", 1);
        net.pending.clear();
        let a = &net.nodes[&gw("A")];
        let dest = DomainId::from("C");
        let mut ad = RouteAdvertisement {
            destination: dest.clone(),
            path: vec![DomainId::from("B"), dest.clone()],
            cost: 5,
            attributes: PolicyAttributes::new(),
            originated_at: Utc::now(),
            seq: 4,
        };
        a.handle_advert(&gw("B"), ad.clone(), Utc::now()).unwrap();

        assert_eq!(a.handle_withdraw(&gw("B"), &dest, 3).unwrap().outcome, UpdateOutcome::Stale);
        assert!(a.best(&dest).is_some());

        let update = a.handle_withdraw(&gw("B"), &dest, 5).unwrap();
        assert_eq!(update.outcome, UpdateOutcome::Applied);
        assert!(a.best(&dest).is_none());

        // Replayed advert from before the withdraw.
        ad.seq = 5;
        assert_eq!(a.handle_advert(&gw("B"), ad.clone(), Utc::now()).unwrap().outcome, UpdateOutcome::Stale);
        ad.seq = 6;
        assert_eq!(a.handle_advert(&gw("B"), ad, Utc::now()).unwrap().outcome, UpdateOutcome::Applied);
    }

    #[test]
    fn test_split_horizon() {
        let mut net = Net::new(&["A", "B", "C"]);
        net.originate_all();
        net.link("A", "B", 1);
        net.link("B", "C", 1);
        net.run();
        let b = &net.nodes[&gw("B")];
        let to_c = b.table().adj_rib_out(&gw("C"));
        assert!(to_c.iter().all(|ad| ad.destination != DomainId::from("C")));
        assert!(b.table().sent(&gw("A"), &DomainId::from("C")).is_some());
    }

    #[test]
    fn test_unknown_peer_and_wrong_first_hop() {
        let mut net = Net::new(&["A", "B"]);
        net.link("A", "B", 1);
        let a = &net.nodes[&gw("A")];
        let ad = RouteAdvertisement {
            destination: DomainId::from("C"),
            path: vec![DomainId::from("X"), DomainId::from("C")],
            cost: 1,
            attributes: PolicyAttributes::new(),
            originated_at: Utc::now(),
            seq: 1,
        };
        assert!(matches!(
            a.handle_advert(&gw("Z"), ad.clone(), Utc::now()),
            Err(RoutingError::UnknownPeer(_))
        ));
        assert!(matches!(
            a.handle_advert(&gw("B"), ad, Utc::now()),
            Err(RoutingError::WrongFirstHop { .. })
        ));
    }

    #[test]
    fn test_received_at_is_caller_time() {
        let mut net = Net::new(&["A", "B"]);
        net.link("A", "B", 1);
        let a = &net.nodes[&gw("A")];
        let ad = RouteAdvertisement {
            destination: DomainId::from("C"),
            path: vec![DomainId::from("B"), DomainId::from("C")],
            cost: 5,
            attributes: PolicyAttributes::new(),
            originated_at: Utc::now(),
            seq: 1,
        };
        let at = Utc::now() - chrono::Duration::hours(3);
        a.handle_advert(&gw("B"), ad, at).unwrap();
        let rib = a.adj_rib_in();
        assert_eq!(rib.len(), 1);
        assert_eq!(rib[0].received_at, at);
    }

    #[test]
    fn test_fees_above_cost_rejected_on_import() {
        let mut net = Net::new(&["A", "B"]);
        net.link("A", "B", 1);
        let a = &net.nodes[&gw("A")];
        let dest = DomainId::from("C");
        let mut ad = RouteAdvertisement {
            destination: dest.clone(),
            path: vec![DomainId::from("B"), DomainId::from("X"), dest.clone()],
            cost: 5,
            attributes: PolicyAttributes::new(),
            originated_at: Utc::now(),
            seq: 1,
        };
        a.handle_advert(&gw("B"), ad.clone(), Utc::now()).unwrap();
        assert!(a.best(&dest).is_some());

        ad.seq = 2;
        ad.attributes.set_fee(&DomainId::from("B"), u64::MAX);
        ad.attributes.set_fee(&DomainId::from("X"), 1);
        let update = a.handle_advert(&gw("B"), ad, Utc::now()).unwrap();
        assert_eq!(update.outcome, UpdateOutcome::FeesExceedCost);
        assert!(update.best_changed);
        assert!(a.best(&dest).is_none());
        assert!(a.adj_rib_in().is_empty());
    }

    #[test]
    fn test_import_policy_rejection_replaces_previous() {
        let policy = DefaultPolicyEngine::new(PolicyConfig {
            deny: vec![DenyRule::new("XX", "*")],
            ..PolicyConfig::default()
        });
        let a = RouteSelector::new(gw("A"), DomainId::from("A"), ProtocolLimits::default(), Arc::new(policy));
        a.add_peer(PeerInfo {
            gateway: gw("B"),
            domain: DomainId::from("B"),
            link_cost: 1,
        });
        let dest = DomainId::from("C");
        let mut ad = RouteAdvertisement {
            destination: dest.clone(),
            path: vec![DomainId::from("B"), dest.clone()],
            cost: 5,
            attributes: PolicyAttributes::new(),
            originated_at: Utc::now(),
            seq: 1,
        };
        a.handle_advert(&gw("B"), ad.clone(), Utc::now()).unwrap();
        assert!(a.best(&dest).is_some());

        ad.seq = 2;
        ad.attributes
            .insert(tgp_core::attributes::JURISDICTION, serde_json::json!("XX"));
        let update = a.handle_advert(&gw("B"), ad, Utc::now()).unwrap();
        assert!(matches!(update.outcome, UpdateOutcome::Rejected(_)));
        assert!(update.best_changed);
        assert!(a.best(&dest).is_none());
    }

    #[test]
    fn test_answer_query() {
        let mut net = Net::new(&["A", "B", "C"]);
        net.originate_all();
        net.link("A", "B", 1);
        net.link("B", "C", 2);
        net.run();
        let b = &net.nodes[&gw("B")];
        match b.answer_query(&gw("A"), &DomainId::from("C")).unwrap().message {
            Message::Advert(ad) => assert_eq!(ad.path_string(), "B,C"),
            other => panic!("unexpected {:?}", other),
        }
        match b.answer_query(&gw("A"), &DomainId::from("Q")).unwrap().message {
            Message::Withdraw { dest_domain, .. } => assert_eq!(dest_domain, DomainId::from("Q")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reconnect_discards_old_session_state() {
        let mut net = Net::new(&["A", "B", "C"]);
        net.originate_all();
        net.link("A", "B", 1);
        net.link("B", "C", 1);
        net.run();
        let a = &net.nodes[&gw("A")];
        assert!(a.best(&DomainId::from("C")).is_some());

        // Session with B restarts; B's sequence numbers start over.
        a.add_peer(PeerInfo {
            gateway: gw("B"),
            domain: DomainId::from("B"),
            link_cost: 1,
        });
        assert!(a.best(&DomainId::from("C")).is_none());
        let ad = RouteAdvertisement {
            destination: DomainId::from("C"),
            path: vec![DomainId::from("B"), DomainId::from("C")],
            cost: 1,
            attributes: PolicyAttributes::new(),
            originated_at: Utc::now(),
            seq: 1,
        };
        assert_eq!(a.handle_advert(&gw("B"), ad, Utc::now()).unwrap().outcome, UpdateOutcome::Applied);
    }

    #[test]
    fn test_restore_installs_without_peers() {
        let a = RouteSelector::new(gw("A"), DomainId::from("A"), ProtocolLimits::default(), Arc::new(AcceptAll));
        let learned = LearnedRoute {
            peer: gw("B"),
            advert: RouteAdvertisement {
                destination: DomainId::from("C"),
                path: vec![DomainId::from("B"), DomainId::from("C")],
                cost: 5,
                attributes: PolicyAttributes::new(),
                originated_at: Utc::now(),
                seq: 3,
            },
            received_at: Utc::now(),
        };
        a.restore(vec![learned]);
        assert!(a.best(&DomainId::from("C")).is_some());
        // Not a transaction candidate until B is connected.
        assert!(a.candidates(&DomainId::from("C")).is_empty());
    }
}
