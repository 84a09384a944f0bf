use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Serde helper to serialize/deserialize `std::time::Duration` as seconds (u64).
pub mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Order in which the payer sends LOCK messages along the path. Timeouts
/// are identical either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockOrder {
    /// Payer-adjacent hop first.
    #[default]
    Forward,
    PayeeFirst,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HtlcConfig {
    /// Minimum gap between adjacent hop timeouts.
    #[serde(with = "duration_secs", default = "default_hop_margin")]
    pub hop_margin: Duration,
    /// Gap between the delivery deadline and the payee-adjacent hop timeout.
    #[serde(with = "duration_secs", default = "default_claim_grace")]
    pub claim_grace: Duration,
    #[serde(default)]
    pub lock_order: LockOrder,
    /// How long to wait for a SELECT_ACK or LOCK_ACK.
    #[serde(with = "duration_secs", default = "default_ack_timeout")]
    pub ack_timeout: Duration,
    #[serde(with = "duration_secs", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
}

fn default_hop_margin() -> Duration {
    Duration::from_secs(10)
}

fn default_claim_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(1)
}

impl Default for HtlcConfig {
    fn default() -> Self {
        Self {
            hop_margin: default_hop_margin(),
            claim_grace: default_claim_grace(),
            lock_order: LockOrder::default(),
            ack_timeout: default_ack_timeout(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl HtlcConfig {
    /// `d` as a chrono duration, saturating at `chrono::Duration::MAX`.
    pub fn chrono(d: Duration) -> chrono::Duration {
        chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
    }
}
