//! TGP Gateway: the composition of routing, policy, sessions and
//! settlement into one gateway, plus the relay/payee side of transactions,
//! persistence, configuration and the node runtime.

pub mod api;
pub mod commands;
pub mod config;
pub mod delivery;
pub mod error;
pub mod gateway;
pub mod invoice;
pub mod node;
pub mod participant;
pub mod state;
pub mod storage;

pub use gateway::{CoreConfig, GatewayCore, TransactionView};
pub use config::GatewayConfig;
pub use delivery::{DeliveryLayer, DeliveryQueue, PendingDelivery};
pub use error::GatewayError;
pub use invoice::{Invoice, InvoiceBook, InvoiceStatus};
pub use node::GatewayNode;
pub use participant::{ParticipantRecord, ParticipantState, Role};
pub use storage::Storage;
