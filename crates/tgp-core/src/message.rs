//! The TGP wire messages.
//!
//! One tagged variant per message kind. Serialized as a JSON object whose
//! `type` field names the kind (`"ADVERT"`, `"LOCK_ACK"`, ...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;
use crate::route::RouteAdvertisement;
use crate::types::{Asset, DomainId, GatewayId, HashLock, Preimage, TransactionId};

/// Outcome reported for a hop in a SETTLE message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettleStatus {
    /// Value moved for this hop.
    Settled,
    /// Locked funds returned upstream.
    Refunded,
    /// Transaction abandoned; the receiver must not reveal or release.
    Aborted,
}

impl fmt::Display for SettleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Settled => write!(f, "settled"),
            Self::Refunded => write!(f, "refunded"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Notification codes sent before tearing a session down.
pub mod notification {
    pub const MALFORMED_MESSAGE: u16 = 1;
    pub const UNEXPECTED_MESSAGE: u16 = 2;
    pub const HOLD_TIMER_EXPIRED: u16 = 3;
    pub const CEASE: u16 = 4;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Session handshake and capability exchange.
    #[serde(rename_all = "camelCase")]
    Open {
        gateway_id: GatewayId,
        domain_id: DomainId,
        #[serde(default)]
        capabilities: Vec<String>,
        hold_time_secs: u64,
        #[serde(default = "default_version")]
        version: u16,
    },

    Keepalive,

    Notification { code: u16, reason: String },

    /// Ask a neighbour for its route to `dest_domain`; answered with ADVERT
    /// or WITHDRAW.
    #[serde(rename_all = "camelCase")]
    Query {
        dest_domain: DomainId,
        amount: u64,
        asset: Asset,
        deadline: DateTime<Utc>,
    },

    Advert(RouteAdvertisement),

    #[serde(rename_all = "camelCase")]
    Withdraw { dest_domain: DomainId, seq: u64 },

    /// Payer proposes a path; forwarded downstream, each gateway appending
    /// itself to `path`.
    #[serde(rename_all = "camelCase")]
    Select {
        transaction_id: TransactionId,
        path: Vec<GatewayId>,
        domain_path: Vec<DomainId>,
        amount: u64,
        asset: Asset,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hash_commitment: Option<HashLock>,
        deadline: DateTime<Utc>,
    },

    /// Payee's answer to SELECT, relayed back to the payer.
    #[serde(rename_all = "camelCase")]
    SelectAck {
        transaction_id: TransactionId,
        path: Vec<GatewayId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hash_commitment: Option<HashLock>,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Lock `amount` on hop `hop` against `hash_commitment` until `timeout`.
    /// Hops are numbered from 1 (payer-adjacent).
    #[serde(rename_all = "camelCase")]
    Lock {
        transaction_id: TransactionId,
        hop: u32,
        hash_commitment: HashLock,
        timeout: DateTime<Utc>,
        amount: u64,
    },

    #[serde(rename_all = "camelCase")]
    LockAck {
        transaction_id: TransactionId,
        hop: u32,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Every hop is locked; the payee may now deliver.
    #[serde(rename_all = "camelCase")]
    Serve {
        transaction_id: TransactionId,
        service_descriptor: String,
    },

    #[serde(rename_all = "camelCase")]
    Proof {
        transaction_id: TransactionId,
        preimage: Preimage,
    },

    #[serde(rename_all = "camelCase")]
    Settle {
        transaction_id: TransactionId,
        hop: u32,
        status: SettleStatus,
    },
}

fn default_version() -> u16 {
    1
}

/// A message addressed to a directly connected peer gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub peer: GatewayId,
    pub message: Message,
}

impl Outbound {
    pub fn new(peer: GatewayId, message: Message) -> Self {
        Self { peer, message }
    }
}

impl Message {
    /// Wire name of the message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Open { .. } => "OPEN",
            Self::Keepalive => "KEEPALIVE",
            Self::Notification { .. } => "NOTIFICATION",
            Self::Query { .. } => "QUERY",
            Self::Advert(_) => "ADVERT",
            Self::Withdraw { .. } => "WITHDRAW",
            Self::Select { .. } => "SELECT",
            Self::SelectAck { .. } => "SELECT_ACK",
            Self::Lock { .. } => "LOCK",
            Self::LockAck { .. } => "LOCK_ACK",
            Self::Serve { .. } => "SERVE",
            Self::Proof { .. } => "PROOF",
            Self::Settle { .. } => "SETTLE",
        }
    }

    /// Transaction this message belongs to, if any.
    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            Self::Select { transaction_id, .. }
            | Self::SelectAck { transaction_id, .. }
            | Self::Lock { transaction_id, .. }
            | Self::LockAck { transaction_id, .. }
            | Self::Serve { transaction_id, .. }
            | Self::Proof { transaction_id, .. }
            | Self::Settle { transaction_id, .. } => Some(*transaction_id),
            _ => None,
        }
    }

    /// True for messages that belong to an established session's routing
    /// or transaction traffic (everything except the session control kinds).
    pub fn is_protocol(&self) -> bool {
        !matches!(
            self,
            Self::Open { .. } | Self::Keepalive | Self::Notification { .. }
        )
    }

    /// Semantic checks that serde cannot express.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            Self::Open {
                hold_time_secs, ..
            } if *hold_time_secs == 0 => Err(CoreError::ValidationError(
                "OPEN hold time must be positive".into(),
            )),
            Self::Advert(ad) if ad.path.is_empty() => Err(CoreError::ValidationError(
                "ADVERT path is empty".into(),
            )),
            Self::Select {
                path, domain_path, amount, ..
            } => {
                if path.is_empty() {
                    return Err(CoreError::ValidationError("SELECT path is empty".into()));
                }
                if domain_path.len() < 2 {
                    return Err(CoreError::ValidationError(
                        "SELECT domain path needs payer and payee".into(),
                    ));
                }
                if path.len() > domain_path.len() {
                    return Err(CoreError::ValidationError(
                        "SELECT gateway path longer than domain path".into(),
                    ));
                }
                if *amount == 0 {
                    return Err(CoreError::InvalidAmount("SELECT amount is zero".into()));
                }
                Ok(())
            }
            Self::Lock { hop, amount, .. } => {
                if *hop == 0 {
                    return Err(CoreError::ValidationError("LOCK hop must be >= 1".into()));
                }
                if *amount == 0 {
                    return Err(CoreError::InvalidAmount("LOCK amount is zero".into()));
                }
                Ok(())
            }
            Self::LockAck { hop, .. } | Self::Settle { hop, .. } if *hop == 0 => Err(
                CoreError::ValidationError(format!("{} hop must be >= 1", self.kind())),
            ),
            Self::Query { amount, .. } if *amount == 0 => {
                Err(CoreError::InvalidAmount("QUERY amount is zero".into()))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transaction_id() {
            Some(id) => write!(f, "{}({})", self.kind(), id),
            None => write!(f, "{}", self.kind()),
        }
    }
}
