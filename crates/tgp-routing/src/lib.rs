//! TGP Routing: path-vector route computation between trust domains.
//!
//! This crate provides:
//! - [`RoutingTable`]: Adj-RIB-In, Local-RIB and Adj-RIB-Out, with
//!   per-destination serialized updates on top of DashMap.
//! - [`RouteSelector`]: best-path selection (cost, path length, peer id),
//!   loop rejection, sequence handling, split-horizon export and withdrawal.

pub mod error;
pub mod rib;
pub mod selector;

pub use error::RoutingError;
pub use rib::{compare_routes, DestinationEntry, LearnedRoute, LocalRoute, RouteSource, RoutingTable};
pub use selector::{PeerDown, PeerInfo, RouteSelector, RouteUpdate, UpdateOutcome};
