use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tgp_core::{DomainId, PolicyAttributes};

/// Risk limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Largest amount accepted over a zero-risk path.
    #[serde(default = "default_base_cap")]
    pub base_cap: u64,
    /// Per-destination overrides of `base_cap`.
    #[serde(default)]
    pub destination_caps: HashMap<DomainId, u64>,
    /// Routes advertising a higher risk score are rejected on import.
    #[serde(default = "default_max_import_risk")]
    pub max_import_risk: f64,
}

fn default_base_cap() -> u64 {
    1_000_000
}

fn default_max_import_risk() -> f64 {
    1.0
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            base_cap: default_base_cap(),
            destination_caps: HashMap::new(),
            max_import_risk: default_max_import_risk(),
        }
    }
}

pub struct RiskLimits {
    config: RiskConfig,
}

impl RiskLimits {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// `cap = base * (1 - riskScore)`, where base is the destination override
    /// or the global base cap.
    pub fn cap_for(&self, dest: &DomainId, attrs: &PolicyAttributes) -> u64 {
        let base = self
            .config
            .destination_caps
            .get(dest)
            .copied()
            .unwrap_or(self.config.base_cap);
        let factor = 1.0 - attrs.risk_score();
        (base as f64 * factor).floor() as u64
    }

    pub fn import_allowed(&self, attrs: &PolicyAttributes) -> bool {
        attrs.risk_score() <= self.config.max_import_risk
    }

    pub fn import_max(&self) -> f64 {
        self.config.max_import_risk
    }
}
