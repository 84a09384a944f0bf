//! Commands dispatched from the HTTP API to the node event loop.
//!
//! Anything that produces protocol messages goes through the event loop,
//! which owns the session senders.

use serde::Serialize;
use tgp_core::{Transaction, TransactionId};
use tokio::sync::oneshot;

use crate::error::GatewayError;

pub type Reply<T> = oneshot::Sender<Result<T, GatewayError>>;

/// A command sent from the HTTP API to the node's main event loop.
pub enum NodeCommand {
    /// Start a transaction with this gateway as the payer.
    Submit {
        transaction: Transaction,
        reply: Reply<SubmitResponse>,
    },
    /// Payer cancellation.
    Cancel {
        transaction_id: TransactionId,
        reply: Reply<()>,
    },
    /// The delivery layer provided the service.
    ConfirmDelivery {
        transaction_id: TransactionId,
        reply: Reply<()>,
    },
    /// The delivery layer gave up.
    DeliveryFailed {
        transaction_id: TransactionId,
        reason: String,
        reply: Reply<()>,
    },
}

/// Response returned after a transaction was submitted.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub transaction_id: TransactionId,
    pub status: String,
}
