//! Session error types.

use tgp_core::CoreError;

/// Errors that end or prevent a peering session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Transport-level failure (connect, read, write).
    #[error("transport error: {0}")]
    Transport(String),

    /// OPEN exchange failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// No traffic from the peer for the negotiated hold time.
    #[error("hold timer expired")]
    HoldTimerExpired,

    /// Malformed or out-of-order message; the session is reset.
    #[error("protocol error {code}: {reason}")]
    Protocol { code: u16, reason: String },

    /// The peer sent NOTIFICATION and closed.
    #[error("peer closed session with code {code}: {reason}")]
    PeerClosed { code: u16, reason: String },

    /// The link was closed cleanly by the remote side.
    #[error("link closed")]
    Closed,

    /// Every reconnect attempt failed.
    #[error("gave up after {attempts} connection attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Encoding or decoding failure.
    #[error("codec error: {0}")]
    Codec(#[from] CoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Errors caused by the peer's messages rather than the transport.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. } | Self::Codec(_) | Self::Handshake(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SessionError::Protocol {
            code: 2,
            reason: "LOCK before OPEN".into(),
        };
        assert_eq!(err.to_string(), "protocol error 2: LOCK before OPEN");
        assert_eq!(SessionError::HoldTimerExpired.to_string(), "hold timer expired");
    }

    #[test]
    fn test_protocol_classification() {
        assert!(SessionError::Handshake("version".into()).is_protocol());
        assert!(!SessionError::Closed.is_protocol());
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: SessionError = io_err.into();
        assert!(matches!(err, SessionError::Io(_)));
        assert!(!err.is_protocol());
    }
}
