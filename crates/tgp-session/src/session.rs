//! Peering session state machine.
//!
//! `Idle → Connecting → Established → Failed`. The machine is pure: the
//! worker feeds it received messages and the current time and acts on the
//! returned [`SessionInput`].

use std::fmt;
use std::time::{Duration, Instant};

use tgp_core::message::notification;
use tgp_core::{DomainId, GatewayId, Message};

use crate::config::SessionConfig;
use crate::error::SessionError;

pub const PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// OPEN sent, waiting for the peer's OPEN.
    Connecting,
    Established,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Established => write!(f, "Established"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// What the peer announced and what was negotiated with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub gateway: GatewayId,
    pub domain: DomainId,
    /// Capabilities both sides announced.
    pub capabilities: Vec<String>,
    /// Lower of the two announced hold times.
    pub hold_time: Duration,
}

/// Result of feeding one message to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    /// Handshake completed.
    Established(PeerIdentity),
    /// Routing or transaction traffic for the gateway core.
    Deliver(Message),
    /// Liveness only.
    Keepalive,
}

#[derive(Debug)]
pub struct PeerSession {
    local_gateway: GatewayId,
    local_domain: DomainId,
    /// Set when dialing a configured peer; inbound sessions accept anyone.
    expected_peer: Option<GatewayId>,
    config: SessionConfig,
    state: SessionState,
    peer: Option<PeerIdentity>,
    started_at: Option<Instant>,
    last_activity: Option<Instant>,
    failure: Option<String>,
}

impl PeerSession {
    pub fn new(
        local_gateway: GatewayId,
        local_domain: DomainId,
        expected_peer: Option<GatewayId>,
        config: SessionConfig,
    ) -> Self {
        Self {
            local_gateway,
            local_domain,
            expected_peer,
            config,
            state: SessionState::Idle,
            peer: None,
            started_at: None,
            last_activity: None,
            failure: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> Option<&PeerIdentity> {
        self.peer.as_ref()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            tracing::debug!(
                local = %self.local_gateway,
                peer = ?self.peer.as_ref().map(|p| p.gateway.as_str()),
                from = %self.state,
                to = %next,
                "session state transition"
            );
            self.state = next;
        }
    }

    /// The OPEN this side sends.
    pub fn open_message(&self) -> Message {
        Message::Open {
            gateway_id: self.local_gateway.clone(),
            domain_id: self.local_domain.clone(),
            capabilities: self.config.capabilities.clone(),
            hold_time_secs: self.config.hold_time().as_secs().max(1),
            version: PROTOCOL_VERSION,
        }
    }

    /// Leave Idle and return the OPEN to send.
    pub fn start(&mut self, now: Instant) -> Message {
        self.started_at = Some(now);
        self.set_state(SessionState::Connecting);
        self.open_message()
    }

    /// Deadline for the peer's OPEN while connecting.
    pub fn handshake_deadline(&self) -> Option<Instant> {
        match self.state {
            SessionState::Connecting => self.started_at.map(|t| t + self.config.handshake_timeout),
            _ => None,
        }
    }

    /// Instant at which the session fails without further traffic.
    pub fn hold_deadline(&self) -> Option<Instant> {
        match (self.state, &self.peer, self.last_activity) {
            (SessionState::Established, Some(peer), Some(last)) => Some(last + peer.hold_time),
            _ => None,
        }
    }

    /// Mark the session failed. Returns the NOTIFICATION to send, if the
    /// session was live.
    pub fn fail(&mut self, error: &SessionError) -> Option<Message> {
        if self.state == SessionState::Failed {
            return None;
        }
        let was_live = matches!(self.state, SessionState::Connecting | SessionState::Established);
        self.failure = Some(error.to_string());
        self.set_state(SessionState::Failed);
        tracing::warn!(
            local = %self.local_gateway,
            peer = ?self.peer.as_ref().map(|p| p.gateway.as_str()),
            error = %error,
            "session failed"
        );
        let code = match error {
            SessionError::HoldTimerExpired => notification::HOLD_TIMER_EXPIRED,
            SessionError::Codec(_) => notification::MALFORMED_MESSAGE,
            SessionError::Protocol { code, .. } => *code,
            SessionError::Handshake(_) => notification::UNEXPECTED_MESSAGE,
            SessionError::PeerClosed { .. } | SessionError::Closed => return None,
            _ => notification::CEASE,
        };
        was_live.then(|| Message::Notification {
            code,
            reason: error.to_string(),
        })
    }

    /// Fail if the handshake or hold timer has run out.
    pub fn check_liveness(&mut self, now: Instant) -> Result<(), SessionError> {
        if let Some(deadline) = self.handshake_deadline() {
            if now >= deadline {
                return Err(SessionError::Handshake("no OPEN before timeout".into()));
            }
        }
        if let Some(deadline) = self.hold_deadline() {
            if now >= deadline {
                return Err(SessionError::HoldTimerExpired);
            }
        }
        Ok(())
    }

    /// Feed one received message.
    pub fn on_message(&mut self, msg: Message, now: Instant) -> Result<SessionInput, SessionError> {
        match self.state {
            SessionState::Idle | SessionState::Failed => Err(SessionError::Protocol {
                code: notification::UNEXPECTED_MESSAGE,
                reason: format!("{} while {}", msg.kind(), self.state),
            }),
            SessionState::Connecting => self.on_handshake(msg, now),
            SessionState::Established => {
                self.last_activity = Some(now);
                match msg {
                    Message::Keepalive => Ok(SessionInput::Keepalive),
                    Message::Notification { code, reason } => {
                        Err(SessionError::PeerClosed { code, reason })
                    }
                    Message::Open { .. } => Err(SessionError::Protocol {
                        code: notification::UNEXPECTED_MESSAGE,
                        reason: "OPEN on established session".into(),
                    }),
                    msg => Ok(SessionInput::Deliver(msg)),
                }
            }
        }
    }

    fn on_handshake(&mut self, msg: Message, now: Instant) -> Result<SessionInput, SessionError> {
        let (gateway, domain, capabilities, hold_time_secs, version) = match msg {
            Message::Open {
                gateway_id,
                domain_id,
                capabilities,
                hold_time_secs,
                version,
            } => (gateway_id, domain_id, capabilities, hold_time_secs, version),
            Message::Notification { code, reason } => {
                return Err(SessionError::PeerClosed { code, reason })
            }
            other => {
                return Err(SessionError::Handshake(format!(
                    "expected OPEN, got {}",
                    other.kind()
                )))
            }
        };

        if version != PROTOCOL_VERSION {
            return Err(SessionError::Handshake(format!(
                "unsupported version {}",
                version
            )));
        }
        if gateway == self.local_gateway {
            return Err(SessionError::Handshake("connected to self".into()));
        }
        if let Some(expected) = &self.expected_peer {
            if *expected != gateway {
                return Err(SessionError::Handshake(format!(
                    "expected {}, peer identified as {}",
                    expected, gateway
                )));
            }
        }

        let capabilities: Vec<String> = self
            .config
            .capabilities
            .iter()
            .filter(|c| capabilities.contains(c))
            .cloned()
            .collect();
        let hold_time = self
            .config
            .hold_time()
            .min(Duration::from_secs(hold_time_secs));
        let identity = PeerIdentity {
            gateway,
            domain,
            capabilities,
            hold_time,
        };

        self.peer = Some(identity.clone());
        self.last_activity = Some(now);
        self.set_state(SessionState::Established);
        tracing::info!(
            local = %self.local_gateway,
            peer = %identity.gateway,
            peer_domain = %identity.domain,
            capabilities = ?identity.capabilities,
            hold_secs = identity.hold_time.as_secs(),
            "session established"
        );
        Ok(SessionInput::Established(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(expected: Option<&str>) -> PeerSession {
        PeerSession::new(
            GatewayId::from("gw-a"),
            DomainId::from("A"),
            expected.map(GatewayId::from),
            SessionConfig::default(),
        )
    }

    fn open_from(gateway: &str, caps: &[&str], hold: u64) -> Message {
        Message::Open {
            gateway_id: GatewayId::from(gateway),
            domain_id: DomainId::from("B"),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            hold_time_secs: hold,
            version: PROTOCOL_VERSION,
        }
    }

    #[test]
    fn test_handshake_negotiates_capabilities_and_hold_time() {
        let now = Instant::now();
        let mut s = session(Some("gw-b"));
        assert_eq!(s.state(), SessionState::Idle);
        let open = s.start(now);
        assert!(matches!(open, Message::Open { hold_time_secs: 30, .. }));
        assert_eq!(s.state(), SessionState::Connecting);

        let input = s
            .on_message(open_from("gw-b", &["htlc-v1", "other"], 9), now)
            .unwrap();
        match input {
            SessionInput::Established(peer) => {
                assert_eq!(peer.gateway, GatewayId::from("gw-b"));
                assert_eq!(peer.capabilities, vec!["htlc-v1".to_string()]);
                assert_eq!(peer.hold_time, Duration::from_secs(9));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(s.state(), SessionState::Established);
        assert_eq!(s.hold_deadline(), Some(now + Duration::from_secs(9)));
    }

    #[test]
    fn test_wrong_peer_rejected() {
        let now = Instant::now();
        let mut s = session(Some("gw-b"));
        s.start(now);
        let err = s.on_message(open_from("gw-x", &[], 30), now).unwrap_err();
        assert!(matches!(err, SessionError::Handshake(_)));
        let notice = s.fail(&err);
        assert!(matches!(
            notice,
            Some(Message::Notification { code: notification::UNEXPECTED_MESSAGE, .. })
        ));
        assert_eq!(s.state(), SessionState::Failed);
        assert!(s.fail(&err).is_none());
    }

    #[test]
    fn test_protocol_message_before_open_rejected() {
        let now = Instant::now();
        let mut s = session(None);
        s.start(now);
        let ad = Message::Withdraw {
            dest_domain: DomainId::from("C"),
            seq: 1,
        };
        assert!(s.on_message(ad, now).is_err());
    }

    #[test]
    fn test_established_delivers_and_tracks_activity() {
        let now = Instant::now();
        let mut s = session(None);
        s.start(now);
        s.on_message(open_from("gw-b", &[], 30), now).unwrap();

        let later = now + Duration::from_secs(20);
        assert_eq!(s.on_message(Message::Keepalive, later).unwrap(), SessionInput::Keepalive);
        assert_eq!(s.last_activity(), Some(later));

        let wd = Message::Withdraw {
            dest_domain: DomainId::from("C"),
            seq: 3,
        };
        assert_eq!(
            s.on_message(wd.clone(), later).unwrap(),
            SessionInput::Deliver(wd)
        );
        assert!(s.on_message(open_from("gw-b", &[], 30), later).is_err());
    }

    #[test]
    fn test_missed_keepalives_fail_session() {
        let now = Instant::now();
        let mut s = session(None);
        s.start(now);
        s.on_message(open_from("gw-b", &[], 30), now).unwrap();
        assert!(s.check_liveness(now + Duration::from_secs(29)).is_ok());
        let err = s.check_liveness(now + Duration::from_secs(30)).unwrap_err();
        assert!(matches!(err, SessionError::HoldTimerExpired));
        assert!(matches!(
            s.fail(&err),
            Some(Message::Notification { code: notification::HOLD_TIMER_EXPIRED, .. })
        ));
    }

    #[test]
    fn test_handshake_timeout() {
        let now = Instant::now();
        let mut s = session(None);
        s.start(now);
        assert!(s.check_liveness(now + Duration::from_secs(9)).is_ok());
        assert!(matches!(
            s.check_liveness(now + Duration::from_secs(10)),
            Err(SessionError::Handshake(_))
        ));
    }

    #[test]
    fn test_notification_closes() {
        let now = Instant::now();
        let mut s = session(None);
        s.start(now);
        s.on_message(open_from("gw-b", &[], 30), now).unwrap();
        let err = s
            .on_message(
                Message::Notification {
                    code: notification::CEASE,
                    reason: "shutdown".into(),
                },
                now,
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::PeerClosed { code: 4, .. }));
        assert!(s.fail(&err).is_none());
    }
}
