//! Gateway configuration loading and management.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tgp_core::{DomainId, GatewayId, PolicyAttributes, ProtocolLimits};
use tgp_policy::PolicyConfig;
use tgp_session::SessionConfig;
use tgp_settlement::HtlcConfig;

use crate::error::GatewayError;

/// Full configuration for one gateway.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySection,

    /// Neighbour gateways.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub htlc: HtlcConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_gateway_id")]
    pub id: String,
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Session listen address.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Link cost for peers that do not set their own.
    #[serde(default = "default_link_cost")]
    pub link_cost: u64,
    /// Attributes advertised with the local domain's own route.
    #[serde(default)]
    pub attributes: PolicyAttributes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub domain: String,
    /// `host:port` to dial. Peers without an address are accepted only.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub link_cost: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Longest accepted domain path.
    #[serde(default = "default_max_path_len")]
    pub max_path_len: usize,
}

/// The in-memory ledger the node settles on, and what it starts with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub opening_balances: Vec<OpeningBalance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpeningBalance {
    pub domain: String,
    pub asset: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_addr")]
    pub listen_addr: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (text, json).
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_gateway_id() -> String {
    "gw-local".into()
}
fn default_domain() -> String {
    "local".into()
}
fn default_listen_addr() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    7400
}
fn default_link_cost() -> u64 {
    1
}
fn default_max_path_len() -> usize {
    ProtocolLimits::default().max_path_len
}
fn default_true() -> bool {
    true
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_api_addr() -> String {
    "127.0.0.1".into()
}
fn default_api_port() -> u16 {
    7401
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            id: default_gateway_id(),
            domain: default_domain(),
            listen_addr: default_listen_addr(),
            port: default_port(),
            link_cost: default_link_cost(),
            attributes: PolicyAttributes::new(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_path_len: default_max_path_len(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: default_data_dir(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: default_api_addr(),
            port: default_api_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl GatewayConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let config: GatewayConfig = toml::from_str(&contents)
                .map_err(|e| anyhow::anyhow!("parsing {}: {}", path.display(), e))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save the current config to a TOML file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.gateway.id.trim().is_empty() || self.gateway.domain.trim().is_empty() {
            return Err(GatewayError::Config("gateway id and domain must be set".into()));
        }
        if self.htlc.hop_margin.is_zero() {
            return Err(GatewayError::Config("htlc.hop_margin must be positive".into()));
        }
        if self.session.keepalive_interval.is_zero() {
            return Err(GatewayError::Config("session.keepalive_interval must be positive".into()));
        }
        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.id == self.gateway.id {
                return Err(GatewayError::Config(format!("peer {} is the local gateway", peer.id)));
            }
            if !seen.insert(peer.id.as_str()) {
                return Err(GatewayError::Config(format!("peer {} listed twice", peer.id)));
            }
            if let Some(addr) = &peer.address {
                addr.parse::<SocketAddr>().map_err(|e| {
                    GatewayError::Config(format!("peer {} address {}: {}", peer.id, addr, e))
                })?;
            }
        }
        Ok(())
    }

    pub fn gateway_id(&self) -> GatewayId {
        GatewayId::new(self.gateway.id.clone())
    }

    pub fn domain_id(&self) -> DomainId {
        DomainId::new(self.gateway.domain.clone())
    }

    pub fn limits(&self) -> ProtocolLimits {
        ProtocolLimits {
            max_path_len: self.routing.max_path_len,
            ..ProtocolLimits::default()
        }
    }

    pub fn listen_socket(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.gateway.listen_addr, self.gateway.port).parse()?)
    }

    pub fn api_socket(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.api.listen_addr, self.api.port).parse()?)
    }

    /// Link cost towards `peer`: its own setting or the gateway default.
    pub fn link_cost(&self, peer: &GatewayId) -> u64 {
        self.peers
            .iter()
            .find(|p| p.id == peer.as_str())
            .and_then(|p| p.link_cost)
            .unwrap_or(self.gateway.link_cost)
    }

    pub fn sweep_interval(&self) -> Duration {
        self.htlc.sweep_interval.max(Duration::from_millis(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tgp_settlement::LockOrder;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.gateway.port, 7400);
        assert_eq!(config.api.port, 7401);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.htlc.hop_margin, Duration::from_secs(10));
        assert!(config.peers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = GatewayConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let decoded: GatewayConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(decoded.gateway.port, config.gateway.port);
        assert_eq!(decoded.session.missed_keepalives, config.session.missed_keepalives);
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let config = GatewayConfig::load(Path::new("/nonexistent/tgp.toml")).unwrap();
        assert_eq!(config.gateway.id, "gw-local");
    }

    #[test]
    fn test_config_from_toml_partial() {
        let toml_str = r#"
[gateway]
id = "gw-b"
domain = "B"
link_cost = 5
attributes = { jurisdiction = "EU", assets = ["USD", "EUR"] }

[[peers]]
id = "gw-a"
domain = "A"
address = "127.0.0.1:7400"

[[peers]]
id = "gw-c"
domain = "C"
link_cost = 2

[htlc]
hop_margin = 30
lock_order = "payee_first"

[policy.rate_limit]
burst = 4

[[ledger.opening_balances]]
domain = "B"
asset = "USD"
amount = 1000
"#;
        let config: GatewayConfig = toml::from_str(toml_str).expect("parse");
        assert!(config.validate().is_ok());
        assert_eq!(config.domain_id(), DomainId::from("B"));
        assert_eq!(config.gateway.attributes.jurisdiction(), Some("EU"));
        assert_eq!(config.link_cost(&GatewayId::from("gw-a")), 5);
        assert_eq!(config.link_cost(&GatewayId::from("gw-c")), 2);
        assert_eq!(config.htlc.hop_margin, Duration::from_secs(30));
        assert_eq!(config.htlc.lock_order, LockOrder::PayeeFirst);
        assert_eq!(config.policy.rate_limit.burst, 4);
        assert_eq!(config.ledger.opening_balances[0].amount, 1000);
        // Defaults for unspecified
        assert_eq!(config.api.port, 7401);
        assert_eq!(config.session.missed_keepalives, 3);
    }

    #[test]
    fn test_validate_rejects_duplicates_and_bad_addresses() {
        let mut config = GatewayConfig::default();
        config.peers.push(PeerConfig {
            id: "gw-x".into(),
            domain: "X".into(),
            address: Some("not-an-address".into()),
            link_cost: None,
        });
        assert!(matches!(config.validate(), Err(GatewayError::Config(_))));

        config.peers[0].address = None;
        config.peers.push(config.peers[0].clone());
        assert!(matches!(config.validate(), Err(GatewayError::Config(_))));
    }
}
