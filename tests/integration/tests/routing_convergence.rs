//! Integration test: route propagation, best-path choice and withdrawal
//! over small topologies.

use tgp_core::{DomainId, GatewayId};
use tgp_integration_tests::Network;

fn domains(path: &[DomainId]) -> Vec<&str> {
    path.iter().map(|d| d.as_str()).collect()
}

/// `(path, cost, next hop)` of the best route at `gw` towards `dest`.
fn best(net: &Network, gw: &GatewayId, dest: &str) -> Option<(Vec<String>, u64, Option<GatewayId>)> {
    net.core(gw).selector().best(&DomainId::from(dest)).map(|r| {
        (
            domains(&r.advert.path).into_iter().map(String::from).collect(),
            r.advert.cost,
            r.peer().cloned(),
        )
    })
}

#[tokio::test]
async fn test_line_topology_learns_transit_route() {
    let mut net = Network::new();
    let a = net.add("A");
    let b = net.add("B");
    let c = net.add("C");
    net.connect(&a, &b, 1);
    net.connect(&b, &c, 5);
    net.pump().await;

    let (path, cost, via) = best(&net, &a, "C").unwrap();
    assert_eq!(path, vec!["B", "C"]);
    assert_eq!(cost, 5);
    assert_eq!(via, Some(b.clone()));

    let (path, _, via) = best(&net, &c, "A").unwrap();
    assert_eq!(path, vec!["B", "A"]);
    assert_eq!(via, Some(b.clone()));

    // Every gateway knows every domain, its own as a local route.
    for gw in [&a, &b, &c] {
        assert_eq!(net.core(gw).routes().len(), 3);
        let own = net.core(gw).domain_id().clone();
        let local = net.core(gw).selector().best(&own).unwrap();
        assert!(local.peer().is_none());
    }
    assert!(net.refused.is_empty(), "{:?}", net.refused);
}

#[tokio::test]
async fn test_diamond_prefers_cheaper_path_and_fails_over() {
    //     B
    //   /   \
    //  A     C
    //   \   /
    //     D
    let mut net = Network::new();
    let a = net.add("A");
    let b = net.add("B");
    let c = net.add("C");
    let d = net.add("D");
    net.connect(&a, &b, 1);
    net.connect(&a, &d, 1);
    net.connect(&b, &c, 5);
    net.connect(&d, &c, 2);
    net.pump().await;

    let (path, cost, via) = best(&net, &a, "C").unwrap();
    assert_eq!(path, vec!["D", "C"]);
    assert_eq!(cost, 2);
    assert_eq!(via, Some(d.clone()));
    // The losing path stays in the Adj-RIB-In as a fallback.
    assert_eq!(net.core(&a).selector().candidates(&DomainId::from("C")).len(), 2);

    net.disconnect(&d, &c).await;
    net.pump().await;

    let (path, cost, via) = best(&net, &a, "C").unwrap();
    assert_eq!(path, vec!["B", "C"]);
    assert_eq!(cost, 5);
    assert_eq!(via, Some(b.clone()));

    // D now reaches C the long way round, through A.
    let (path, _, via) = best(&net, &d, "C").unwrap();
    assert_eq!(path, vec!["A", "B", "C"]);
    assert_eq!(via, Some(a.clone()));
}

#[tokio::test]
async fn test_equal_cost_ties_break_on_shorter_path_then_gateway() {
    let mut net = Network::new();
    let a = net.add("A");
    let b = net.add("B");
    let d = net.add("D");
    let c = net.add("C");
    net.connect(&a, &b, 1);
    net.connect(&a, &d, 1);
    net.connect(&b, &c, 3);
    net.connect(&d, &c, 3);
    net.pump().await;

    // Same cost, same length: the lower peer id wins.
    let (_, _, via) = best(&net, &a, "C").unwrap();
    assert_eq!(via, Some(b));
}

#[tokio::test]
async fn test_ring_never_selects_looping_path() {
    let mut net = Network::new();
    let gws: Vec<GatewayId> = ["A", "B", "C", "D", "E"].iter().map(|d| net.add(d)).collect();
    for i in 0..gws.len() {
        let next = (i + 1) % gws.len();
        net.connect(&gws[i], &gws[next], 1 + i as u64);
    }
    net.pump().await;

    for gw in &gws {
        let own = net.core(gw).domain_id().clone();
        let routes = net.core(gw).routes();
        assert_eq!(routes.len(), gws.len(), "{} is missing routes", gw);
        for (dest, route) in routes {
            if dest == own {
                continue;
            }
            assert!(!route.advert.contains(&own), "{} selected {}", gw, route.advert.path_string());
            let mut seen = route.advert.path.clone();
            seen.sort();
            seen.dedup();
            assert_eq!(seen.len(), route.advert.path.len());
        }
    }

    // Breaking one link keeps everything reachable the other way round.
    net.disconnect(&gws[0], &gws[1]).await;
    net.pump().await;
    let (path, _, _) = best(&net, &gws[0], "B").unwrap();
    assert_eq!(path, vec!["E", "D", "C", "B"]);
}

#[tokio::test]
async fn test_disconnect_withdraws_unreachable_destinations() {
    let mut net = Network::new();
    let a = net.add("A");
    let b = net.add("B");
    let c = net.add("C");
    net.connect(&a, &b, 1);
    net.connect(&b, &c, 1);
    net.pump().await;
    assert!(best(&net, &a, "C").is_some());

    net.disconnect(&b, &c).await;
    net.pump().await;
    assert!(best(&net, &a, "C").is_none());
    assert!(best(&net, &b, "C").is_none());
    assert!(best(&net, &a, "B").is_some());
    assert!(net.core(&a).selector().candidates(&DomainId::from("C")).is_empty());

    // The link comes back and the route with it.
    net.connect(&b, &c, 1);
    net.pump().await;
    let (path, _, _) = best(&net, &a, "C").unwrap();
    assert_eq!(path, vec!["B", "C"]);
}
