use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

use crate::error::CoreError;

/// Identifier of a trust domain. Opaque and globally unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainId(String);

impl DomainId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DomainId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of a routing/settlement node.
///
/// Ordering matters: the lowest originating `GatewayId` is the final
/// tie-break of best-path selection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GatewayId(String);

impl GatewayId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GatewayId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Unique identifier for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    /// Create a new time-ordered (UUID v7) transaction ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse from the canonical hyphenated form.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CoreError::ValidationError(format!("invalid transaction id: {}", e)))
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Asset code (e.g. "USD", "USDC"). Semantics belong to the ledger backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Asset(String);

impl Asset {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn code(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serde helper: 32-byte arrays as lowercase hex strings.
mod hex32 {
    use super::*;

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let raw = hex::decode(&s).map_err(serde::de::Error::custom)?;
        raw.try_into()
            .map_err(|v: Vec<u8>| serde::de::Error::custom(format!("expected 32 bytes, got {}", v.len())))
    }
}

/// Secret revealed by the payee to release every hop of a transaction.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preimage(#[serde(with = "hex32")] [u8; 32]);

impl Preimage {
    /// Generate a fresh random preimage.
    pub fn random() -> Self {
        Self(rand::random::<[u8; 32]>())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The hash commitment `H = blake3(preimage)`.
    pub fn commitment(&self) -> HashLock {
        HashLock(*blake3::hash(&self.0).as_bytes())
    }
}

// Never print the secret itself.
impl fmt::Debug for Preimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Preimage({})", self.commitment())
    }
}

/// Hash commitment every hop locks funds against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashLock(#[serde(with = "hex32")] [u8; 32]);

impl HashLock {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns true if `hash(preimage) == self`.
    pub fn verify(&self, preimage: &Preimage) -> bool {
        preimage.commitment() == *self
    }
}

impl fmt::Display for HashLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// A value-transfer request from a payer gateway to a payee domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: TransactionId,
    pub payer: GatewayId,
    pub payee: DomainId,
    /// Amount debited from the payer, in the asset's smallest unit.
    pub amount: u64,
    pub asset: Asset,
    /// Opaque description of the paid service, handed to the delivery layer.
    pub service: String,
    /// Overall deadline; every hop timeout lies before it.
    pub deadline: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        payer: GatewayId,
        payee: DomainId,
        amount: u64,
        asset: Asset,
        service: impl Into<String>,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            payer,
            payee,
            amount,
            asset,
            service: service.into(),
            deadline,
        }
    }

    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), CoreError> {
        if self.amount == 0 {
            return Err(CoreError::InvalidAmount("amount must be positive".into()));
        }
        if self.deadline <= now {
            return Err(CoreError::Expired);
        }
        Ok(())
    }
}
