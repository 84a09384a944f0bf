//! Integration test: sessions dropping while a transaction is in flight.

use chrono::Duration;
use tgp_core::{DomainId, GatewayId, TransactionState};
use tgp_gateway::ParticipantState;
use tgp_integration_tests::Network;

const OPENING: u64 = 1_000;

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
async fn test_downstream_loss_during_serve_aborts_without_movement() {
    let (mut net, a, b, c) = line();
    net.pump().await;

    let id = net.send(&a, "C", 100, Duration::seconds(60)).await.unwrap();
    assert!(net.node(&c).delivery.is_pending(id));

    net.disconnect(&b, &c).await;
    net.pump().await;

    // The payee lost its upstream and withdrew the delivery.
    assert!(!net.node(&c).delivery.is_pending(id));
    assert_eq!(net.core(&c).participant(id).await.unwrap().state, ParticipantState::Aborted);
    assert!(net.deliver(&c, id).await.is_err());

    // The relay told the payer, which released every hop.
    assert_eq!(net.core(&b).participant(id).await.unwrap().state, ParticipantState::Aborted);
    assert_eq!(net.core(&a).htlc().state(id).await, Some(TransactionState::Abort));
    assert_eq!(net.ledger.active_holds(), 0);
    for domain in ["A", "B", "C"] {
        assert_eq!(net.balance(domain), OPENING as i128);
    }

    // The sweeper eventually forgets the dead records.
    net.advance(Duration::seconds(61)).await;
    assert!(net.core(&b).participant(id).await.is_none());
    assert!(net.core(&c).participant(id).await.is_none());
}

#[tokio::test]
async fn test_new_transaction_uses_backup_path_after_failover() {
    let mut net = Network::new();
    let a = net.add("A");
    let b = net.add("B");
    let c = net.add("C");
    let d = net.add("D");
    for domain in ["A", "B", "C", "D"] {
        net.deposit(domain, OPENING);
    }
    net.connect(&a, &b, 1);
    net.connect(&a, &d, 1);
    net.connect(&b, &c, 2);
    net.connect(&d, &c, 7);
    net.pump().await;

    net.disconnect(&b, &c).await;
    net.pump().await;
    let best = net.core(&a).selector().best(&DomainId::from("C")).unwrap();
    assert_eq!(best.peer(), Some(&d));

    let id = net.send(&a, "C", 100, Duration::seconds(60)).await.unwrap();
    net.deliver(&c, id).await.unwrap();
    assert_eq!(net.core(&a).htlc().state(id).await, Some(TransactionState::Settle));
    assert_eq!(net.balance("A"), OPENING as i128 - 100);
    assert_eq!(net.balance("D"), OPENING as i128 + 7);
    assert_eq!(net.balance("C"), OPENING as i128 + 93);
    assert_eq!(net.balance("B"), OPENING as i128);
}
