//! Integration test: transactions across three domains.
//!
//! A (payer) - B (relay, fee 5) - C (payee), all settling on one shared
//! in-memory ledger.

use std::sync::Arc;

use chrono::Duration;
use tgp_core::{GatewayId, Message, SettleStatus, TransactionState};
use tgp_gateway::{CoreConfig, GatewayError, ParticipantState};
use tgp_integration_tests::Network;
use tgp_policy::{AcceptAll, DefaultPolicyEngine, PolicyConfig};
use tgp_settlement::HtlcStatus;

const OPENING: u64 = 1_000;

/// A - B - C with B charging 5 to reach C.
fn line() -> (Network, GatewayId, GatewayId, GatewayId) {
    let mut net = Network::new();
    let a = net.add("A");
    let b = net.add("B");
    let c = net.add("C");
    for domain in ["A", "B", "C"] {
        net.deposit(domain, OPENING);
    }
    net.connect(&a, &b, 1);
    net.connect(&b, &c, 5);
    (net, a, b, c)
}

#[tokio::test]
async fn test_three_domain_transaction_settles_with_relay_fee() {
    let (mut net, a, b, c) = line();
    net.pump().await;

    let id = net.send(&a, "C", 100, Duration::seconds(60)).await.unwrap();
    assert_eq!(net.core(&a).htlc().state(id).await, Some(TransactionState::Serve));
    assert!(net.node(&c).delivery.is_pending(id));

    // Hop timeouts step down towards the payee by the margin.
    let htlcs = net.core(&a).htlc().arena().for_transaction(id);
    assert_eq!(htlcs.len(), 2);
    let (h1, h2) = (&htlcs[0], &htlcs[1]);
    assert_eq!((h1.hop, h1.amount), (1, 100));
    assert_eq!((h2.hop, h2.amount), (2, 95));
    assert_eq!(h1.timeout - h2.timeout, Duration::seconds(10));
    assert!(htlcs.iter().all(|h| h.status == HtlcStatus::Locked));

    // Nothing moves before the preimage.
    assert_eq!(net.balance("A"), OPENING as i128);

    net.deliver(&c, id).await.unwrap();
    assert_eq!(net.core(&a).htlc().state(id).await, Some(TransactionState::Settle));
    assert_eq!(net.balance("A"), OPENING as i128 - 100);
    assert_eq!(net.balance("B"), OPENING as i128 + 5);
    assert_eq!(net.balance("C"), OPENING as i128 + 95);
    assert_eq!(net.ledger.active_holds(), 0);

    // Relay and payee saw the outcome of their hops.
    assert_eq!(net.core(&b).participant(id).await.unwrap().state, ParticipantState::Settled);
    assert_eq!(net.core(&c).participant(id).await.unwrap().state, ParticipantState::Settled);
    assert!(net.refused.is_empty(), "{:?}", net.refused);

    // Settled participant records are retired by the sweeper.
    net.advance(Duration::seconds(1)).await;
    assert!(net.core(&b).participant(id).await.is_none());
}

#[tokio::test]
async fn test_serve_timeout_refunds_every_hop() {
    let (mut net, a, b, c) = line();
    net.pump().await;

    let id = net.send(&a, "C", 100, Duration::seconds(60)).await.unwrap();
    assert!(net.node(&c).delivery.is_pending(id));

    // Delivery deadline: T - 2 * 10s - 5s.
    net.advance(Duration::seconds(36)).await;
    assert_eq!(net.core(&a).htlc().state(id).await, Some(TransactionState::Abort));
    assert!(!net.node(&c).delivery.is_pending(id));
    assert_eq!(net.core(&b).participant(id).await.unwrap().state, ParticipantState::Aborted);

    // Too late to reveal now.
    assert!(net.deliver(&c, id).await.is_err());

    // Locked hops stay held until their own timeouts.
    assert_eq!(net.ledger.active_holds(), 2);
    net.advance(Duration::seconds(15)).await;
    assert_eq!(net.ledger.active_holds(), 0);
    let htlcs = net.core(&a).htlc().arena().for_transaction(id);
    assert!(htlcs.iter().all(|h| h.status == HtlcStatus::Refunded));

    for domain in ["A", "B", "C"] {
        assert_eq!(net.balance(domain), OPENING as i128, "{} moved", domain);
    }
}

fn is_abort_notice(m: &Message) -> bool {
    matches!(m, Message::Settle { status: SettleStatus::Aborted, .. })
}

#[tokio::test]
async fn test_proof_in_flight_at_abort_still_settles_every_hop() {
    let (mut net, a, b, c) = line();
    net.pump().await;

    let id = net.send(&a, "C", 100, Duration::seconds(60)).await.unwrap();

    // The payee reveals just before the cutoff, but the PROOF is slow.
    net.tick(Duration::seconds(34)).await;
    let proof = net.core(&c).confirm_delivery(id, net.now).await.unwrap();
    net.node(&c).delivery.take(id);

    // The payer gives up, and its abort notices are lost.
    net.tick(Duration::seconds(2)).await;
    assert_eq!(net.core(&a).htlc().state(id).await, Some(TransactionState::Abort));
    assert!(net.lose(|_, _, m| is_abort_notice(m)) > 0);
    net.pump().await;

    // Every hop is still locked and before its timeout, so the preimage
    // is honoured end to end.
    net.enqueue(&c, proof);
    net.pump().await;
    let rec = net.core(&a).htlc().get(id).await.unwrap();
    assert_eq!(rec.state, TransactionState::Abort);
    assert!(rec.late_claim);
    assert_eq!(net.balance("A"), OPENING as i128 - 100);
    assert_eq!(net.balance("B"), OPENING as i128 + 5);
    assert_eq!(net.balance("C"), OPENING as i128 + 95);
    assert_eq!(net.ledger.active_holds(), 0);
    assert_eq!(net.core(&b).participant(id).await.unwrap().state, ParticipantState::Settled);

    // Nothing is refunded afterwards.
    net.advance(Duration::seconds(20)).await;
    assert_eq!(net.balance("A"), OPENING as i128 - 100);
    let htlcs = net.core(&a).htlc().arena().for_transaction(id);
    assert!(htlcs.iter().all(|h| h.status == HtlcStatus::Settled));
}

#[tokio::test]
async fn test_lost_abort_notice_payee_cannot_reveal_after_cutoff() {
    let (mut net, a, _b, c) = line();
    net.pump().await;

    let id = net.send(&a, "C", 100, Duration::seconds(60)).await.unwrap();
    net.tick(Duration::seconds(36)).await;
    assert_eq!(net.core(&a).htlc().state(id).await, Some(TransactionState::Abort));
    assert!(net.lose(|_, _, m| is_abort_notice(m)) > 0);
    net.pump().await;

    // The payee never heard of the abort but refuses on its own clock.
    assert!(net.deliver(&c, id).await.is_err());
    assert!(net.core(&c).participant(id).await.unwrap().preimage.is_none());

    net.advance(Duration::seconds(15)).await;
    assert_eq!(net.ledger.active_holds(), 0);
    for domain in ["A", "B", "C"] {
        assert_eq!(net.balance(domain), OPENING as i128, "{} moved", domain);
    }
}

#[tokio::test]
async fn test_delivery_failure_aborts_and_releases() {
    let (mut net, a, _b, c) = line();
    net.pump().await;

    let id = net.send(&a, "C", 100, Duration::seconds(60)).await.unwrap();
    let out = net.core(&c).delivery_failed(id, "service offline", net.now).await.unwrap();
    net.enqueue(&c, out);
    net.pump().await;

    assert_eq!(net.core(&a).htlc().state(id).await, Some(TransactionState::Abort));
    assert_eq!(net.ledger.active_holds(), 0);
    assert_eq!(net.balance("A"), OPENING as i128);
}

#[tokio::test]
async fn test_relay_with_wider_margin_refuses_lock() {
    let mut net = Network::new();
    let a = net.add("A");
    let mut b_config = CoreConfig::new("gw-b", "B");
    b_config.htlc.hop_margin = std::time::Duration::from_secs(30);
    let b = net.add_with(b_config, Arc::new(AcceptAll));
    let c = net.add("C");
    for domain in ["A", "B", "C"] {
        net.deposit(domain, OPENING);
    }
    net.connect(&a, &b, 1);
    net.connect(&b, &c, 5);
    net.pump().await;

    let id = net.send(&a, "C", 100, Duration::seconds(90)).await.unwrap();
    let rec = net.core(&a).htlc().get(id).await.unwrap();
    assert_eq!(rec.state, TransactionState::Abort);
    assert_eq!(net.ledger.active_holds(), 0);
    assert!(!net.node(&c).delivery.is_pending(id));
    for domain in ["A", "B", "C"] {
        assert_eq!(net.balance(domain), OPENING as i128);
    }
}

#[tokio::test]
async fn test_payer_policy_cap_rejects_before_select() {
    let mut net = Network::new();
    let mut policy = PolicyConfig::default();
    policy.risk.base_cap = 50;
    let a = net.add_with(
        CoreConfig::new("gw-a", "A"),
        Arc::new(DefaultPolicyEngine::new(policy)),
    );
    let b = net.add("B");
    net.deposit("A", OPENING);
    net.connect(&a, &b, 1);
    net.pump().await;

    let err = net.send(&a, "B", 100, Duration::seconds(60)).await.unwrap_err();
    match err {
        GatewayError::PolicyRejection { code, .. } => assert_eq!(code, "RISK_CAP"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(net.ledger.active_holds(), 0);

    // Under the cap it goes through.
    let id = net.send(&a, "B", 40, Duration::seconds(60)).await.unwrap();
    net.deliver(&b, id).await.unwrap();
    assert_eq!(net.balance("B"), 40);
}

#[tokio::test]
async fn test_insufficient_funds_is_capacity_exhausted() {
    let (mut net, a, _b, _c) = line();
    net.pump().await;

    let err = net.send(&a, "C", 5_000, Duration::seconds(60)).await.unwrap_err();
    assert!(matches!(err, GatewayError::CapacityExhausted(_)), "{:?}", err);
    assert_eq!(net.ledger.active_holds(), 0);
}
