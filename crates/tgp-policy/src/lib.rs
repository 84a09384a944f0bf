//! TGP Policy: accept/reject/modify decisions for routes and transactions.
//!
//! - [`DefaultPolicyEngine`] combines a jurisdiction/asset deny-list, a token
//!   bucket per ordered (source, destination) domain pair, and risk-derived
//!   amount caps.
//! - [`PolicyEngine`] is the seam for deployment-specific engines.

pub mod compliance;
pub mod engine;
pub mod rate_limit;
pub mod risk;

pub use compliance::{ComplianceRules, DenyRule};
pub use engine::{
    AcceptAll, DefaultPolicyEngine, Direction, PolicyConfig, PolicyDecision, PolicyEngine,
    PolicySubject, RejectReason,
};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use risk::{RiskConfig, RiskLimits};
