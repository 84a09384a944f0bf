//! Shared node state for cross-task communication.

use dashmap::DashSet;
use std::sync::Arc;
use std::time::Instant;
use tgp_core::GatewayId;
use tokio::sync::mpsc;

use crate::commands::NodeCommand;
use crate::gateway::GatewayCore;
use crate::delivery::DeliveryQueue;

/// Shared state for the running node, accessible from HTTP handlers.
pub struct NodeState {
    pub core: Arc<GatewayCore>,
    pub delivery: Arc<DeliveryQueue>,
    /// When the node started.
    pub start_time: Instant,
    /// Peers with an established session (updated by the event loop).
    peers: DashSet<GatewayId>,
    /// Channel to send commands to the event loop.
    pub command_tx: mpsc::Sender<NodeCommand>,
}

impl NodeState {
    pub fn new(
        core: Arc<GatewayCore>,
        delivery: Arc<DeliveryQueue>,
        command_tx: mpsc::Sender<NodeCommand>,
    ) -> Self {
        Self {
            core,
            delivery,
            start_time: Instant::now(),
            peers: DashSet::new(),
            command_tx,
        }
    }

    pub fn add_peer(&self, peer: GatewayId) {
        self.peers.insert(peer);
    }

    pub fn remove_peer(&self, peer: &GatewayId) {
        self.peers.remove(peer);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn connected_peers(&self) -> Vec<GatewayId> {
        let mut peers: Vec<GatewayId> = self.peers.iter().map(|p| p.clone()).collect();
        peers.sort();
        peers
    }
}
