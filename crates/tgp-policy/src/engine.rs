use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tgp_core::attributes::ASSETS;
use tgp_core::{DomainId, GatewayId, PolicyAttributes, RouteAdvertisement, Transaction};

use crate::compliance::{ComplianceRules, DenyRule};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::risk::{RiskConfig, RiskLimits};

/// Where in the gateway a policy question is asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// An ADVERT arriving from a peer.
    Import,
    /// An ADVERT about to be sent to a peer.
    Export,
    /// A candidate path for a transaction.
    Transaction,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Import => write!(f, "import"),
            Self::Export => write!(f, "export"),
            Self::Transaction => write!(f, "transaction"),
        }
    }
}

/// What is being evaluated.
#[derive(Debug, Clone, Copy)]
pub enum PolicySubject<'a> {
    /// A route learned from (import) or sent to (export) `peer`.
    Route {
        peer: &'a GatewayId,
        advert: &'a RouteAdvertisement,
    },
    /// A transaction from `source` over the candidate `route`.
    Transaction {
        tx: &'a Transaction,
        source: &'a DomainId,
        route: &'a RouteAdvertisement,
    },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RejectReason {
    #[error("compliance: {asset} denied in jurisdiction {jurisdiction}")]
    Compliance { jurisdiction: String, asset: String },

    #[error("rate limit exhausted for {source_domain} -> {dest_domain}")]
    RateLimited {
        source_domain: DomainId,
        dest_domain: DomainId,
    },

    #[error("amount {amount} exceeds risk cap {cap}")]
    RiskCap { amount: u64, cap: u64 },

    #[error("route risk score {score} above import threshold {max}")]
    RiskThreshold { score: f64, max: f64 },

    #[error("asset {0} not supported on path")]
    AssetUnsupported(String),

    #[error("{reason}")]
    Custom { code: String, reason: String },
}

impl RejectReason {
    /// Stable machine-readable code reported to callers.
    pub fn code(&self) -> &str {
        match self {
            Self::Compliance { .. } => "COMPLIANCE",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::RiskCap { .. } => "RISK_CAP",
            Self::RiskThreshold { .. } => "RISK_THRESHOLD",
            Self::AssetUnsupported(_) => "ASSET_UNSUPPORTED",
            Self::Custom { code, .. } => code,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    Accept,
    Reject(RejectReason),
    /// Accept with the attribute set replaced by the given one.
    Modify(PolicyAttributes),
}

impl PolicyDecision {
    pub fn is_reject(&self) -> bool {
        matches!(self, Self::Reject(_))
    }
}

/// Pluggable policy evaluation.
///
/// Implementations must be pure apart from externally owned counters, and
/// must update those atomically per call.
pub trait PolicyEngine: Send + Sync {
    fn evaluate(&self, subject: PolicySubject<'_>, direction: Direction) -> PolicyDecision;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Denied (jurisdiction, asset) combinations.
    #[serde(default)]
    pub deny: Vec<DenyRule>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    /// Jurisdiction of the local domain, appended to exported routes.
    #[serde(default)]
    pub jurisdiction: Option<String>,
    /// Attributes stamped on routes this gateway originates.
    #[serde(default)]
    pub export_attributes: PolicyAttributes,
}

/// Built-in engine: compliance deny-list, per-domain-pair token buckets and
/// risk-derived amount caps.
pub struct DefaultPolicyEngine {
    compliance: ComplianceRules,
    rate_limiter: RateLimiter,
    risk: RiskLimits,
    jurisdiction: Option<String>,
    export_attributes: PolicyAttributes,
}

impl DefaultPolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            compliance: ComplianceRules::new(config.deny),
            rate_limiter: RateLimiter::new(config.rate_limit),
            risk: RiskLimits::new(config.risk),
            jurisdiction: config.jurisdiction,
            export_attributes: config.export_attributes,
        }
    }

    pub fn evaluate_at(
        &self,
        subject: PolicySubject<'_>,
        direction: Direction,
        now: Instant,
    ) -> PolicyDecision {
        let decision = match (subject, direction) {
            (PolicySubject::Route { advert, .. }, Direction::Import) => self.import(advert),
            (PolicySubject::Route { advert, .. }, Direction::Export) => self.export(advert),
            (PolicySubject::Transaction { tx, source, route }, _) => {
                self.transaction(tx, source, route, now)
            }
            (PolicySubject::Route { .. }, Direction::Transaction) => PolicyDecision::Accept,
        };
        if let PolicyDecision::Reject(reason) = &decision {
            tracing::warn!(%direction, code = reason.code(), %reason, "policy rejection");
        }
        decision
    }

    fn import(&self, advert: &RouteAdvertisement) -> PolicyDecision {
        if let Some(rule) = self.compliance.check_route(&advert.attributes) {
            return PolicyDecision::Reject(RejectReason::Compliance {
                jurisdiction: rule.jurisdiction.clone(),
                asset: rule.asset.clone(),
            });
        }
        if !self.risk.import_allowed(&advert.attributes) {
            return PolicyDecision::Reject(RejectReason::RiskThreshold {
                score: advert.attributes.risk_score(),
                max: self.risk.import_max(),
            });
        }

        // Strip assets the path can carry but we may not route.
        let denied = self.compliance.denied_assets(&advert.attributes);
        if denied.is_empty() {
            return PolicyDecision::Accept;
        }
        let allowed: Vec<String> = advert
            .attributes
            .assets()
            .unwrap_or_default()
            .into_iter()
            .filter(|a| !denied.contains(a))
            .map(|a| a.code().to_string())
            .collect();
        let mut attrs = advert.attributes.clone();
        attrs.insert(ASSETS, serde_json::json!(allowed));
        PolicyDecision::Modify(attrs)
    }

    fn export(&self, advert: &RouteAdvertisement) -> PolicyDecision {
        let originated = advert.path_len() == 1;
        if self.jurisdiction.is_none() && (!originated || self.export_attributes.is_empty()) {
            return PolicyDecision::Accept;
        }

        let mut attrs = advert.attributes.clone();
        if originated {
            attrs.merge(&self.export_attributes);
        }
        if let Some(j) = &self.jurisdiction {
            if originated && attrs.jurisdiction().is_none() {
                attrs.insert(tgp_core::attributes::JURISDICTION, serde_json::json!(j));
            }
            attrs.add_jurisdiction(j);
        }
        if attrs == advert.attributes {
            PolicyDecision::Accept
        } else {
            PolicyDecision::Modify(attrs)
        }
    }

    fn transaction(
        &self,
        tx: &Transaction,
        source: &DomainId,
        route: &RouteAdvertisement,
        now: Instant,
    ) -> PolicyDecision {
        if !route.attributes.supports_asset(&tx.asset) {
            return PolicyDecision::Reject(RejectReason::AssetUnsupported(
                tx.asset.code().to_string(),
            ));
        }
        if let Some(rule) = self.compliance.check_transaction(&route.attributes, &tx.asset) {
            return PolicyDecision::Reject(RejectReason::Compliance {
                jurisdiction: rule.jurisdiction.clone(),
                asset: tx.asset.code().to_string(),
            });
        }
        let cap = self.risk.cap_for(&route.destination, &route.attributes);
        if tx.amount > cap {
            return PolicyDecision::Reject(RejectReason::RiskCap {
                amount: tx.amount,
                cap,
            });
        }
        // Last, so rejected candidates never consume a token.
        if !self.rate_limiter.try_acquire_at(source, &route.destination, now) {
            return PolicyDecision::Reject(RejectReason::RateLimited {
                source_domain: source.clone(),
                dest_domain: route.destination.clone(),
            });
        }
        PolicyDecision::Accept
    }
}

impl PolicyEngine for DefaultPolicyEngine {
    fn evaluate(&self, subject: PolicySubject<'_>, direction: Direction) -> PolicyDecision {
        self.evaluate_at(subject, direction, Instant::now())
    }
}

/// Accepts everything. Useful for closed deployments and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl PolicyEngine for AcceptAll {
    fn evaluate(&self, _subject: PolicySubject<'_>, _direction: Direction) -> PolicyDecision {
        PolicyDecision::Accept
    }
}
