use tgp_core::{CoreError, DomainId, GatewayId};

/// Errors that can occur within the routing layer.
///
/// Every variant is a protocol error from the sending peer's point of view:
/// the session that delivered the message should be reset.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("advertisement from unknown peer {0}")]
    UnknownPeer(GatewayId),

    #[error("invalid advertisement from {peer}: {source}")]
    InvalidAdvertisement {
        peer: GatewayId,
        #[source]
        source: CoreError,
    },

    #[error("advertisement from {peer} starts at {first}, expected peer domain {expected}")]
    WrongFirstHop {
        peer: GatewayId,
        first: DomainId,
        expected: DomainId,
    },
}
