//! TGP Core: identifiers, route and transaction data model, wire messages,
//! codec, and the transaction state machine shared by every gateway crate.

pub mod attributes;
pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod route;
pub mod state_machine;
pub mod types;

pub use attributes::PolicyAttributes;
pub use config::ProtocolLimits;
pub use error::CoreError;
pub use message::{Message, Outbound, SettleStatus};
pub use route::RouteAdvertisement;
pub use state_machine::{TransactionEvent, TransactionState, TransactionStateMachine};
pub use types::{Asset, DomainId, GatewayId, HashLock, Preimage, Transaction, TransactionId};
