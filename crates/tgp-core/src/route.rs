use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::attributes::PolicyAttributes;
use crate::config::ProtocolLimits;
use crate::error::CoreError;
use crate::types::DomainId;

/// A path-vector route announcement for one destination domain.
///
/// `path` lists the domains traversed, nearest first, ending at the
/// destination. It never repeats a domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteAdvertisement {
    #[serde(rename = "destDomain")]
    pub destination: DomainId,
    pub path: Vec<DomainId>,
    pub cost: u64,
    #[serde(rename = "policyAttrs", default)]
    pub attributes: PolicyAttributes,
    #[serde(default = "Utc::now")]
    pub originated_at: DateTime<Utc>,
    pub seq: u64,
}

impl RouteAdvertisement {
    /// A domain announcing itself: path `[domain]`, cost 0.
    pub fn originate(domain: DomainId, attributes: PolicyAttributes, seq: u64) -> Self {
        Self {
            destination: domain.clone(),
            path: vec![domain],
            cost: 0,
            attributes,
            originated_at: Utc::now(),
            seq,
        }
    }

    pub fn contains(&self, domain: &DomainId) -> bool {
        self.path.iter().any(|d| d == domain)
    }

    /// The neighbouring domain this route leaves through.
    pub fn next_domain(&self) -> Option<&DomainId> {
        self.path.first()
    }

    pub fn path_len(&self) -> usize {
        self.path.len()
    }

    /// Structural checks: non-empty, loop-free, ends at the destination,
    /// within the configured length.
    pub fn validate(&self, limits: &ProtocolLimits) -> Result<(), CoreError> {
        let last = self
            .path
            .last()
            .ok_or_else(|| CoreError::ValidationError("advertised path is empty".into()))?;
        if *last != self.destination {
            return Err(CoreError::ValidationError(format!(
                "path ends at {} but destination is {}",
                last, self.destination
            )));
        }
        if self.path.len() > limits.max_path_len {
            return Err(CoreError::ValidationError(format!(
                "path length {} exceeds maximum {}",
                self.path.len(),
                limits.max_path_len
            )));
        }
        let mut seen = HashSet::with_capacity(self.path.len());
        for domain in &self.path {
            if !seen.insert(domain) {
                return Err(CoreError::LoopDetected {
                    domain: domain.to_string(),
                    path: self.path_string(),
                });
            }
        }
        Ok(())
    }

    /// Derive the advertisement a gateway in `local` sends onward: local
    /// domain prepended, cost raised by the link cost, which is also
    /// recorded as the local relay fee.
    pub fn extend(&self, local: &DomainId, link_cost: u64, seq: u64) -> Self {
        let mut path = Vec::with_capacity(self.path.len() + 1);
        path.push(local.clone());
        path.extend(self.path.iter().cloned());

        let mut attributes = self.attributes.clone();
        attributes.set_fee(local, link_cost);

        Self {
            destination: self.destination.clone(),
            path,
            cost: self.cost.saturating_add(link_cost),
            attributes,
            originated_at: self.originated_at,
            seq,
        }
    }

    /// Fee charged by each relay on the path (every domain but the
    /// destination), in path order. Cost not explained by recorded fees is
    /// charged by the first relay.
    pub fn relay_fees(&self) -> Vec<u64> {
        let mut fees = self.recorded_fees();
        let explained = fees_total(&fees);
        if let Some(first) = fees.first_mut() {
            *first = first.saturating_add(self.cost.saturating_sub(explained));
        }
        fees
    }

    /// True unless the recorded relay fees add up to more than `cost`.
    pub fn fees_within_cost(&self) -> bool {
        fees_total(&self.recorded_fees()) <= self.cost
    }

    fn recorded_fees(&self) -> Vec<u64> {
        let relays = &self.path[..self.path.len().saturating_sub(1)];
        let recorded = self.attributes.fees();
        relays
            .iter()
            .map(|d| recorded.get(d).copied().unwrap_or(0))
            .collect()
    }

    /// True if both describe the same route, ignoring sequence and
    /// origination time.
    pub fn same_route(&self, other: &RouteAdvertisement) -> bool {
        self.destination == other.destination
            && self.path == other.path
            && self.cost == other.cost
            && self.attributes == other.attributes
    }

    pub fn path_string(&self) -> String {
        self.path
            .iter()
            .map(DomainId::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn fees_total(fees: &[u64]) -> u64 {
    fees.iter().fold(0u64, |acc, f| acc.saturating_add(*f))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advert(path: &[&str], cost: u64) -> RouteAdvertisement {
        let path: Vec<DomainId> = path.iter().map(|d| DomainId::from(*d)).collect();
        RouteAdvertisement {
            destination: path.last().cloned().unwrap(),
            path,
            cost,
            attributes: PolicyAttributes::new(),
            originated_at: Utc::now(),
            seq: 1,
        }
    }

    #[test]
    fn test_originate() {
        let ad = RouteAdvertisement::originate(DomainId::from("C"), PolicyAttributes::new(), 1);
        assert_eq!(ad.path, vec![DomainId::from("C")]);
        assert_eq!(ad.cost, 0);
        assert!(ad.validate(&ProtocolLimits::default()).is_ok());
    }

    #[test]
    fn test_validate_rejects_repeat() {
        let ad = advert(&["B", "D", "B", "C"], 3);
        assert!(matches!(
            ad.validate(&ProtocolLimits::default()),
            Err(CoreError::LoopDetected { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_wrong_tail() {
        let mut ad = advert(&["B", "C"], 3);
        ad.destination = DomainId::from("X");
        assert!(ad.validate(&ProtocolLimits::default()).is_err());
    }

    #[test]
    fn test_validate_rejects_long_path() {
        let ad = advert(&["A", "B", "C", "D"], 3);
        let limits = ProtocolLimits {
            max_path_len: 3,
            ..ProtocolLimits::default()
        };
        assert!(ad.validate(&limits).is_err());
    }

    #[test]
    fn test_extend_prepends_and_adds_cost() {
        let ad = advert(&["C"], 0);
        let out = ad.extend(&DomainId::from("B"), 5, 9);
        assert_eq!(out.path, vec![DomainId::from("B"), DomainId::from("C")]);
        assert_eq!(out.cost, 5);
        assert_eq!(out.seq, 9);
        assert_eq!(out.attributes.fees().get(&DomainId::from("B")), Some(&5));
    }

    #[test]
    fn test_relay_fees_from_attributes() {
        let ad = advert(&["C"], 0)
            .extend(&DomainId::from("D"), 2, 1)
            .extend(&DomainId::from("B"), 5, 1);
        assert_eq!(ad.cost, 7);
        // Relays are B and D (destination C is not a relay).
        assert_eq!(ad.relay_fees(), vec![5, 2]);
    }

    #[test]
    fn test_relay_fees_fallback_to_first_relay() {
        let ad = advert(&["B", "C"], 5);
        assert_eq!(ad.relay_fees(), vec![5]);
        let direct = advert(&["C"], 0);
        assert!(direct.relay_fees().is_empty());
    }

    #[test]
    fn test_oversized_recorded_fees_do_not_overflow() {
        let mut ad = advert(&["B", "X", "C"], 10);
        ad.attributes.set_fee(&DomainId::from("B"), u64::MAX);
        ad.attributes.set_fee(&DomainId::from("X"), 1);
        assert_eq!(ad.relay_fees(), vec![u64::MAX, 1]);
        assert!(!ad.fees_within_cost());

        let honest = advert(&["C"], 0)
            .extend(&DomainId::from("D"), 2, 1)
            .extend(&DomainId::from("B"), 5, 1);
        assert!(honest.fees_within_cost());
    }

    #[test]
    fn test_same_route_ignores_seq() {
        let a = advert(&["B", "C"], 5);
        let mut b = a.clone();
        b.seq = 42;
        assert!(a.same_route(&b));
        b.cost = 6;
        assert!(!a.same_route(&b));
    }
}
