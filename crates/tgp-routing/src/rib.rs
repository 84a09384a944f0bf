use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tgp_core::{DomainId, GatewayId, RouteAdvertisement};

/// An Adj-RIB-In entry: the most recent non-withdrawn advertisement from one
/// peer for one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedRoute {
    pub peer: GatewayId,
    pub advert: RouteAdvertisement,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "peer")]
pub enum RouteSource {
    /// Originated by this gateway.
    Local,
    Peer(GatewayId),
}

/// A Local-RIB entry: the selected best route for a destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRoute {
    pub source: RouteSource,
    pub advert: RouteAdvertisement,
}

impl LocalRoute {
    pub fn peer(&self) -> Option<&GatewayId> {
        match &self.source {
            RouteSource::Local => None,
            RouteSource::Peer(p) => Some(p),
        }
    }
}

/// Best-path order: lowest cost, then shortest path, then lowest peer
/// `GatewayId`.
pub fn compare_routes(a: &LearnedRoute, b: &LearnedRoute) -> Ordering {
    a.advert
        .cost
        .cmp(&b.advert.cost)
        .then_with(|| a.advert.path_len().cmp(&b.advert.path_len()))
        .then_with(|| a.peer.cmp(&b.peer))
}

/// All routing state for one destination domain.
#[derive(Debug, Default)]
pub struct DestinationEntry {
    pub adj_in: BTreeMap<GatewayId, LearnedRoute>,
    /// Sequence number of the last WITHDRAW accepted from each peer.
    pub withdrawn: BTreeMap<GatewayId, u64>,
    pub originated: Option<RouteAdvertisement>,
    pub best: Option<LocalRoute>,
    /// Outbound sequence number for this destination.
    pub out_seq: u64,
}

impl DestinationEntry {
    /// Run the selection algorithm over the current entries. A locally
    /// originated route always wins.
    pub fn select_best(&self) -> Option<LocalRoute> {
        if let Some(own) = &self.originated {
            return Some(LocalRoute {
                source: RouteSource::Local,
                advert: own.clone(),
            });
        }
        self.adj_in
            .values()
            .min_by(|a, b| compare_routes(a, b))
            .map(|learned| LocalRoute {
                source: RouteSource::Peer(learned.peer.clone()),
                advert: learned.advert.clone(),
            })
    }

    /// Adj-RIB-In entries in best-path order.
    pub fn ranked(&self) -> Vec<LearnedRoute> {
        let mut routes: Vec<LearnedRoute> = self.adj_in.values().cloned().collect();
        routes.sort_by(compare_routes);
        routes
    }

    pub fn next_seq(&mut self) -> u64 {
        self.out_seq += 1;
        self.out_seq
    }

    pub fn is_empty(&self) -> bool {
        self.adj_in.is_empty() && self.originated.is_none() && self.best.is_none()
    }
}

/// Concurrent routing table.
///
/// Per-destination state sits behind one map entry, so updates to a
/// destination are serialized while different destinations proceed in
/// parallel. Reads return cloned snapshots.
pub struct RoutingTable {
    destinations: DashMap<DomainId, DestinationEntry>,
    adj_out: DashMap<(GatewayId, DomainId), RouteAdvertisement>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            destinations: DashMap::new(),
            adj_out: DashMap::new(),
        }
    }

    /// Exclusive access to one destination's state, created on demand.
    pub fn entry(&self, dest: &DomainId) -> RefMut<'_, DomainId, DestinationEntry> {
        self.destinations.entry(dest.clone()).or_default()
    }

    pub fn best(&self, dest: &DomainId) -> Option<LocalRoute> {
        self.destinations.get(dest).and_then(|e| e.best.clone())
    }

    /// Current best route together with the destination's outbound sequence.
    pub fn best_with_seq(&self, dest: &DomainId) -> (Option<LocalRoute>, u64) {
        self.destinations
            .get(dest)
            .map(|e| (e.best.clone(), e.out_seq))
            .unwrap_or((None, 0))
    }

    pub fn candidates(&self, dest: &DomainId) -> Vec<LearnedRoute> {
        self.destinations
            .get(dest)
            .map(|e| e.ranked())
            .unwrap_or_default()
    }

    pub fn learned(&self, peer: &GatewayId, dest: &DomainId) -> Option<LearnedRoute> {
        self.destinations
            .get(dest)
            .and_then(|e| e.adj_in.get(peer).cloned())
    }

    pub fn destinations(&self) -> Vec<DomainId> {
        self.destinations.iter().map(|e| e.key().clone()).collect()
    }

    /// Destinations with an Adj-RIB-In entry from `peer`.
    pub fn destinations_via(&self, peer: &GatewayId) -> Vec<DomainId> {
        self.destinations
            .iter()
            .filter(|e| e.adj_in.contains_key(peer))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Snapshot of the Local-RIB.
    pub fn local_rib(&self) -> Vec<(DomainId, LocalRoute)> {
        let mut out: Vec<(DomainId, LocalRoute)> = self
            .destinations
            .iter()
            .filter_map(|e| e.best.clone().map(|b| (e.key().clone(), b)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Snapshot of every Adj-RIB-In entry.
    pub fn adj_rib_in(&self) -> Vec<LearnedRoute> {
        self.destinations
            .iter()
            .flat_map(|e| e.adj_in.values().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn sent(&self, peer: &GatewayId, dest: &DomainId) -> Option<RouteAdvertisement> {
        self.adj_out
            .get(&(peer.clone(), dest.clone()))
            .map(|r| r.value().clone())
    }

    pub fn record_sent(&self, peer: &GatewayId, advert: RouteAdvertisement) {
        self.adj_out
            .insert((peer.clone(), advert.destination.clone()), advert);
    }

    pub fn take_sent(&self, peer: &GatewayId, dest: &DomainId) -> Option<RouteAdvertisement> {
        self.adj_out
            .remove(&(peer.clone(), dest.clone()))
            .map(|(_, ad)| ad)
    }

    /// Forget everything sent to `peer`.
    pub fn clear_sent(&self, peer: &GatewayId) {
        self.adj_out.retain(|(p, _), _| p != peer);
    }

    pub fn adj_rib_out(&self, peer: &GatewayId) -> Vec<RouteAdvertisement> {
        self.adj_out
            .iter()
            .filter(|e| &e.key().0 == peer)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tgp_core::PolicyAttributes;

    fn learned(peer: &str, path: &[&str], cost: u64) -> LearnedRoute {
        let path: Vec<DomainId> = path.iter().map(|d| DomainId::from(*d)).collect();
        LearnedRoute {
            peer: GatewayId::from(peer),
            advert: RouteAdvertisement {
                destination: path.last().cloned().unwrap(),
                path,
                cost,
                attributes: PolicyAttributes::new(),
                originated_at: Utc::now(),
                seq: 1,
            },
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_compare_cost_first() {
        let cheap_long = learned("gw-z", &["B", "D", "C"], 3);
        let dear_short = learned("gw-a", &["E", "C"], 4);
        assert_eq!(compare_routes(&cheap_long, &dear_short), Ordering::Less);
    }

    #[test]
    fn test_compare_path_len_then_peer() {
        let short = learned("gw-z", &["E", "C"], 5);
        let long = learned("gw-a", &["B", "D", "C"], 5);
        assert_eq!(compare_routes(&short, &long), Ordering::Less);

        let a = learned("gw-a", &["B", "C"], 5);
        let b = learned("gw-b", &["E", "C"], 5);
        assert_eq!(compare_routes(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_select_best_and_ranked() {
        let mut entry = DestinationEntry::default();
        for r in [
            learned("gw-b", &["B", "C"], 5),
            learned("gw-e", &["E", "C"], 2),
            learned("gw-d", &["D", "F", "C"], 2),
        ] {
            entry.adj_in.insert(r.peer.clone(), r);
        }
        let best = entry.select_best().unwrap();
        assert_eq!(best.source, RouteSource::Peer(GatewayId::from("gw-e")));
        let order: Vec<String> = entry
            .ranked()
            .iter()
            .map(|r| r.peer.to_string())
            .collect();
        assert_eq!(order, vec!["gw-e", "gw-d", "gw-b"]);
    }

    #[test]
    fn test_originated_wins() {
        let mut entry = DestinationEntry::default();
        let r = learned("gw-b", &["B", "C"], 0);
        entry.adj_in.insert(r.peer.clone(), r);
        entry.originated = Some(RouteAdvertisement::originate(
            DomainId::from("C"),
            PolicyAttributes::new(),
            1,
        ));
        assert_eq!(entry.select_best().unwrap().source, RouteSource::Local);
    }

    #[test]
    fn test_adj_out_bookkeeping() {
        let table = RoutingTable::new();
        let peer = GatewayId::from("gw-a");
        let ad = learned("gw-b", &["B", "C"], 5).advert;
        table.record_sent(&peer, ad.clone());
        assert_eq!(table.sent(&peer, &DomainId::from("C")), Some(ad));
        assert_eq!(table.adj_rib_out(&peer).len(), 1);
        table.clear_sent(&peer);
        assert!(table.sent(&peer, &DomainId::from("C")).is_none());
    }

    #[test]
    fn test_local_route_serde() {
        let route = LocalRoute {
            source: RouteSource::Peer(GatewayId::from("gw-b")),
            advert: learned("gw-b", &["B", "C"], 5).advert,
        };
        let json = serde_json::to_string(&route).unwrap();
        let back: LocalRoute = serde_json::from_str(&json).unwrap();
        assert_eq!(back, route);
    }
}
