//! Events a session worker reports to the gateway core.

use tgp_core::{GatewayId, Message};
use tokio::sync::mpsc;

use crate::session::PeerIdentity;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Handshake completed. `sender` queues messages to the peer.
    Up {
        peer: PeerIdentity,
        sender: mpsc::Sender<Message>,
    },
    /// Routing or transaction traffic received from `peer`.
    Message { peer: GatewayId, message: Message },
    /// The session ended; its routes and transactions must be unwound.
    Down { peer: GatewayId, reason: String },
}

impl SessionEvent {
    pub fn peer(&self) -> &GatewayId {
        match self {
            Self::Up { peer, .. } => &peer.gateway,
            Self::Message { peer, .. } | Self::Down { peer, .. } => peer,
        }
    }
}
