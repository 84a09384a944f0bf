//! Jurisdiction/asset deny-list.

use serde::{Deserialize, Serialize};
use tgp_core::{Asset, PolicyAttributes};

/// Matches every asset.
pub const ANY_ASSET: &str = "*";

/// A denied (jurisdiction, asset) combination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyRule {
    pub jurisdiction: String,
    /// Asset code, or `"*"` for every asset.
    #[serde(default = "any_asset")]
    pub asset: String,
}

fn any_asset() -> String {
    ANY_ASSET.to_string()
}

impl DenyRule {
    pub fn new(jurisdiction: impl Into<String>, asset: impl Into<String>) -> Self {
        Self {
            jurisdiction: jurisdiction.into(),
            asset: asset.into(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.asset == ANY_ASSET
    }

    fn matches_asset(&self, asset: &Asset) -> bool {
        self.is_wildcard() || self.asset == asset.code()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ComplianceRules {
    deny: Vec<DenyRule>,
}

impl ComplianceRules {
    pub fn new(deny: Vec<DenyRule>) -> Self {
        Self { deny }
    }

    pub fn is_empty(&self) -> bool {
        self.deny.is_empty()
    }

    /// First rule that forbids moving `asset` through any jurisdiction the
    /// route touches.
    pub fn check_transaction(&self, attrs: &PolicyAttributes, asset: &Asset) -> Option<&DenyRule> {
        let jurisdictions = attrs.jurisdictions();
        self.deny.iter().find(|rule| {
            rule.matches_asset(asset) && jurisdictions.iter().any(|j| *j == rule.jurisdiction)
        })
    }

    /// A route is unusable when a wildcard rule covers one of its
    /// jurisdictions.
    pub fn check_route(&self, attrs: &PolicyAttributes) -> Option<&DenyRule> {
        let jurisdictions = attrs.jurisdictions();
        self.deny.iter().find(|rule| {
            rule.is_wildcard() && jurisdictions.iter().any(|j| *j == rule.jurisdiction)
        })
    }

    /// Assets the route advertises that a specific rule denies for one of
    /// its jurisdictions.
    pub fn denied_assets(&self, attrs: &PolicyAttributes) -> Vec<Asset> {
        let Some(assets) = attrs.assets() else {
            return Vec::new();
        };
        let jurisdictions = attrs.jurisdictions();
        assets
            .into_iter()
            .filter(|asset| {
                self.deny.iter().any(|rule| {
                    !rule.is_wildcard()
                        && rule.matches_asset(asset)
                        && jurisdictions.iter().any(|j| *j == rule.jurisdiction)
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tgp_core::attributes;

    fn attrs(jurisdiction: &str, assets: Option<&[&str]>) -> PolicyAttributes {
        let mut a = PolicyAttributes::new();
        a.insert(attributes::JURISDICTION, json!(jurisdiction));
        if let Some(list) = assets {
            a.insert(attributes::ASSETS, json!(list));
        }
        a
    }

    #[test]
    fn test_transaction_denied_for_asset() {
        let rules = ComplianceRules::new(vec![DenyRule::new("XX", "USDC")]);
        let route = attrs("XX", None);
        assert!(rules.check_transaction(&route, &Asset::new("USDC")).is_some());
        assert!(rules.check_transaction(&route, &Asset::new("EUR")).is_none());
    }

    #[test]
    fn test_wildcard_blocks_route() {
        let rules = ComplianceRules::new(vec![DenyRule::new("XX", ANY_ASSET)]);
        assert!(rules.check_route(&attrs("XX", None)).is_some());
        assert!(rules.check_route(&attrs("EU", None)).is_none());
    }

    #[test]
    fn test_specific_rule_does_not_block_route() {
        let rules = ComplianceRules::new(vec![DenyRule::new("XX", "USDC")]);
        assert!(rules.check_route(&attrs("XX", None)).is_none());
    }

    #[test]
    fn test_denied_assets() {
        let rules = ComplianceRules::new(vec![DenyRule::new("XX", "USDC")]);
        let denied = rules.denied_assets(&attrs("XX", Some(&["USDC", "EUR"])));
        assert_eq!(denied, vec![Asset::new("USDC")]);
        assert!(rules.denied_assets(&attrs("EU", Some(&["USDC"]))).is_empty());
    }

    #[test]
    fn test_deny_rule_default_asset_is_wildcard() {
        let rule: DenyRule = serde_json::from_value(json!({"jurisdiction": "XX"})).unwrap();
        assert!(rule.is_wildcard());
    }
}
