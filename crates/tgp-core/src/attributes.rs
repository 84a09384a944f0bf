//! Registry of well-known route policy attributes.
//!
//! Attributes travel with every ADVERT as an open key/value map. The keys
//! below have defined meaning to the policy engine and the settlement layer;
//! anything else passes through unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::types::{Asset, DomainId};

/// Jurisdiction of the originating domain (string).
pub const JURISDICTION: &str = "jurisdiction";
/// Jurisdictions traversed by the path (list of strings).
pub const JURISDICTIONS: &str = "jurisdictions";
/// Asset codes the path can carry (list of strings).
pub const ASSETS: &str = "assets";
/// Path risk score in [0, 1].
pub const RISK_SCORE: &str = "riskScore";
/// Relay fees charged along the path (object: domain -> fee).
pub const FEES: &str = "fees";
/// Advertised latency in milliseconds.
pub const LATENCY_MS: &str = "latencyMs";

/// Extensible attribute set carried by a route advertisement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyAttributes(BTreeMap<String, Value>);

impl PolicyAttributes {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Overlay `other` on top of `self`; keys in `other` win.
    pub fn merge(&mut self, other: &PolicyAttributes) {
        for (k, v) in other.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn jurisdiction(&self) -> Option<&str> {
        self.get(JURISDICTION).and_then(Value::as_str)
    }

    /// All jurisdictions the path touches: the accumulated list plus the
    /// origin jurisdiction.
    pub fn jurisdictions(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .get(JURISDICTIONS)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if let Some(origin) = self.jurisdiction() {
            if !out.iter().any(|j| j == origin) {
                out.push(origin.to_string());
            }
        }
        out
    }

    /// Append a jurisdiction to the traversed list (deduplicated).
    pub fn add_jurisdiction(&mut self, jurisdiction: &str) {
        let mut list = match self.get(JURISDICTIONS).and_then(Value::as_array) {
            Some(items) => items.clone(),
            None => Vec::new(),
        };
        if !list.iter().any(|v| v.as_str() == Some(jurisdiction)) {
            list.push(Value::String(jurisdiction.to_string()));
        }
        self.insert(JURISDICTIONS, Value::Array(list));
    }

    /// Supported assets. `None` means the path did not restrict assets.
    pub fn assets(&self) -> Option<Vec<Asset>> {
        self.get(ASSETS).and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(Asset::new)
                .collect()
        })
    }

    pub fn supports_asset(&self, asset: &Asset) -> bool {
        self.assets().map_or(true, |assets| assets.contains(asset))
    }

    /// Risk score clamped to [0, 1]; missing means 0.
    pub fn risk_score(&self) -> f64 {
        self.get(RISK_SCORE)
            .and_then(Value::as_f64)
            .map(|s| s.clamp(0.0, 1.0))
            .unwrap_or(0.0)
    }

    /// Per-relay fees recorded along the path.
    pub fn fees(&self) -> BTreeMap<DomainId, u64> {
        self.get(FEES)
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_u64().map(|fee| (DomainId::new(k.clone()), fee)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_fee(&mut self, domain: &DomainId, fee: u64) {
        let mut obj = match self.get(FEES).and_then(Value::as_object) {
            Some(existing) => existing.clone(),
            None => serde_json::Map::new(),
        };
        obj.insert(domain.as_str().to_string(), Value::from(fee));
        self.insert(FEES, Value::Object(obj));
    }
}

impl FromIterator<(String, Value)> for PolicyAttributes {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
