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

/// Serde helper for millisecond durations.
pub mod duration_millis {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Peering session parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interval between KEEPALIVE messages.
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,
    /// Missed keepalive intervals before the session fails.
    pub missed_keepalives: u32,
    /// Time allowed for the OPEN exchange.
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,
    /// Connection attempts before a peer is given up on.
    pub reconnect_attempts: u32,
    /// First reconnect delay; doubled on each further attempt.
    #[serde(with = "duration_millis")]
    pub reconnect_backoff: Duration,
    /// Upper bound on a single reconnect delay.
    #[serde(with = "duration_secs")]
    pub reconnect_backoff_max: Duration,
    /// Capabilities announced in OPEN.
    pub capabilities: Vec<String>,
    /// Bound of the per-session outbound queue.
    pub outbound_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(10),
            missed_keepalives: 3,
            handshake_timeout: Duration::from_secs(10),
            reconnect_attempts: 5,
            reconnect_backoff: Duration::from_millis(500),
            reconnect_backoff_max: Duration::from_secs(30),
            capabilities: vec!["route-v1".into(), "htlc-v1".into()],
            outbound_queue: 256,
        }
    }
}

impl SessionConfig {
    /// Hold time announced in OPEN: missed keepalives times the interval.
    pub fn hold_time(&self) -> Duration {
        self.keepalive_interval * self.missed_keepalives.max(1)
    }
}

/// Bounded exponential backoff for reconnects.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: u32,
    limit: u32,
}

impl Backoff {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            base: config.reconnect_backoff,
            max: config.reconnect_backoff_max,
            attempts: 0,
            limit: config.reconnect_attempts,
        }
    }

    /// Delay before the next attempt, or `None` once the limit is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.limit {
            return None;
        }
        let factor = 1u32.checked_shl(self.attempts).unwrap_or(u32::MAX);
        self.attempts += 1;
        Some(self.base.saturating_mul(factor).min(self.max))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
