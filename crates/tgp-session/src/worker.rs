//! One worker task per peering session.
//!
//! The worker owns the link and the session state machine. It multiplexes
//! inbound frames, the outbound queue, timers and shutdown in a single
//! `tokio::select!` loop and reports [`SessionEvent`]s to the gateway core.

use std::time::{Duration, Instant};

use tgp_core::message::notification;
use tgp_core::Message;
use tokio::sync::{mpsc, watch};

use crate::error::SessionError;
use crate::events::SessionEvent;
use crate::session::{PeerSession, SessionInput, SessionState};
use crate::timer::Timers;
use crate::transport::PeerLink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SessionTimer {
    Handshake,
    Keepalive,
    Hold,
}

pub struct SessionWorker<L: PeerLink> {
    session: PeerSession,
    link: L,
    outbound_tx: mpsc::Sender<Message>,
    outbound_rx: mpsc::Receiver<Message>,
    events: mpsc::Sender<SessionEvent>,
    timers: Timers<SessionTimer>,
}

enum Action {
    Received(Result<Option<Message>, SessionError>),
    Outbound(Message),
    Timer,
    Shutdown,
}

impl<L: PeerLink> SessionWorker<L> {
    pub fn new(session: PeerSession, link: L, events: mpsc::Sender<SessionEvent>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(session.config().outbound_queue.max(1));
        Self {
            session,
            link,
            outbound_tx,
            outbound_rx,
            events,
            timers: Timers::new(),
        }
    }

    fn keepalive_interval(&self) -> Duration {
        let configured = self.session.config().keepalive_interval;
        match self.session.peer() {
            Some(peer) => configured.min(peer.hold_time / 3),
            None => configured,
        }
    }

    fn arm_hold(&mut self) {
        if let Some(deadline) = self.session.hold_deadline() {
            self.timers.register(SessionTimer::Hold, deadline);
        }
    }

    /// Run the session until it fails, the peer closes it, or `shutdown`
    /// flips. Returns `Ok` only for a local shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SessionError> {
        let remote = self.link.remote();
        let open = self.session.start(Instant::now());
        if let Err(e) = self.link.send(&open).await {
            self.session.fail(&e);
            return Err(e);
        }
        if let Some(deadline) = self.session.handshake_deadline() {
            self.timers.register(SessionTimer::Handshake, deadline);
        }
        tracing::debug!(%remote, "session worker started");

        let result = loop {
            let next_timer = self
                .timers
                .next_deadline()
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));
            let established = self.session.state() == SessionState::Established;

            let action = tokio::select! {
                received = self.link.recv() => Action::Received(received),
                Some(msg) = self.outbound_rx.recv(), if established => Action::Outbound(msg),
                _ = tokio::time::sleep_until(next_timer) => Action::Timer,
                _ = shutdown.changed() => Action::Shutdown,
            };

            let now = Instant::now();
            let step = match action {
                Action::Received(Ok(Some(msg))) => self.on_received(msg, now).await,
                Action::Received(Ok(None)) => Err(SessionError::Closed),
                Action::Received(Err(e)) => Err(e),
                // A queued NOTIFICATION resets the session; finish() sends it.
                Action::Outbound(Message::Notification { code, reason }) => {
                    Err(SessionError::Protocol { code, reason })
                }
                Action::Outbound(msg) => self.link.send(&msg).await.map(|_| true),
                Action::Timer => self.on_timers(now).await,
                Action::Shutdown => break Ok(()),
            };
            match step {
                Ok(true) => {}
                // The core stopped listening.
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.finish(result).await
    }

    /// Returns `Ok(false)` when the event channel is closed.
    async fn on_received(&mut self, msg: Message, now: Instant) -> Result<bool, SessionError> {
        match self.session.on_message(msg, now)? {
            SessionInput::Established(peer) => {
                self.timers.cancel(&SessionTimer::Handshake);
                let interval = self.keepalive_interval();
                self.timers.register(SessionTimer::Keepalive, now + interval);
                self.arm_hold();
                let event = SessionEvent::Up {
                    peer,
                    sender: self.outbound_tx.clone(),
                };
                Ok(self.events.send(event).await.is_ok())
            }
            SessionInput::Deliver(message) => {
                self.arm_hold();
                let peer = match self.session.peer() {
                    Some(p) => p.gateway.clone(),
                    None => return Ok(true),
                };
                tracing::trace!(%peer, kind = message.kind(), "message received");
                Ok(self
                    .events
                    .send(SessionEvent::Message { peer, message })
                    .await
                    .is_ok())
            }
            SessionInput::Keepalive => {
                self.arm_hold();
                Ok(true)
            }
        }
    }

    async fn on_timers(&mut self, now: Instant) -> Result<bool, SessionError> {
        for timer in self.timers.due(now) {
            match timer {
                SessionTimer::Handshake | SessionTimer::Hold => {
                    self.session.check_liveness(now)?;
                    self.arm_hold();
                }
                SessionTimer::Keepalive => {
                    self.link.send(&Message::Keepalive).await?;
                    let interval = self.keepalive_interval();
                    self.timers.register(SessionTimer::Keepalive, now + interval);
                }
            }
        }
        Ok(true)
    }

    async fn finish(mut self, result: Result<(), SessionError>) -> Result<(), SessionError> {
        self.timers.clear();
        // Senders handed out in `Up` report closed from here on.
        self.outbound_rx.close();
        let peer = self.session.peer().map(|p| p.gateway.clone());

        let reason = match &result {
            Ok(()) => {
                if self.session.state() == SessionState::Established {
                    let _ = self
                        .link
                        .send(&Message::Notification {
                            code: notification::CEASE,
                            reason: "gateway shutting down".into(),
                        })
                        .await;
                }
                "shutdown".to_string()
            }
            Err(e) => {
                if let Some(notice) = self.session.fail(e) {
                    let _ = self.link.send(&notice).await;
                }
                e.to_string()
            }
        };

        if let Some(peer) = peer {
            tracing::info!(%peer, %reason, "session down");
            let _ = self.events.send(SessionEvent::Down { peer, reason }).await;
        }
        result
    }
}
