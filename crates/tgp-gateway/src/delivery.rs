//! Seam to the external delivery layer.
//!
//! The core tells the delivery layer when a transaction it is the payee of
//! is fully locked (and when it is abandoned). The delivery layer answers
//! through [`crate::GatewayCore::confirm_delivery`] or
//! [`crate::GatewayCore::delivery_failed`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tgp_core::TransactionId;

#[async_trait]
pub trait DeliveryLayer: Send + Sync {
    /// Every hop is locked; the service may be provided now.
    async fn notify_locked(&self, id: TransactionId, service_descriptor: &str);

    /// The transaction was abandoned; nothing should be delivered.
    async fn notify_aborted(&self, id: TransactionId, reason: &str);
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingDelivery {
    pub transaction_id: TransactionId,
    pub service_descriptor: String,
    pub locked_at: DateTime<Utc>,
}

/// Delivery layer that parks locked transactions until an operator or the
/// HTTP callback API confirms or fails them.
#[derive(Default)]
pub struct DeliveryQueue {
    pending: DashMap<TransactionId, PendingDelivery>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Vec<PendingDelivery> {
        let mut out: Vec<PendingDelivery> = self.pending.iter().map(|p| p.value().clone()).collect();
        out.sort_by_key(|p| p.locked_at);
        out
    }

    pub fn is_pending(&self, id: TransactionId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Drop a pending entry once it was answered.
    pub fn take(&self, id: TransactionId) -> Option<PendingDelivery> {
        self.pending.remove(&id).map(|(_, p)| p)
    }
}

#[async_trait]
impl DeliveryLayer for DeliveryQueue {
    async fn notify_locked(&self, id: TransactionId, service_descriptor: &str) {
        tracing::info!(transaction_id = %id, service = service_descriptor, "delivery requested");
        self.pending.insert(
            id,
            PendingDelivery {
                transaction_id: id,
                service_descriptor: service_descriptor.to_string(),
                locked_at: Utc::now(),
            },
        );
    }

    async fn notify_aborted(&self, id: TransactionId, reason: &str) {
        if self.pending.remove(&id).is_some() {
            tracing::warn!(transaction_id = %id, %reason, "pending delivery withdrawn");
        }
    }
}
