//! The gateway node runtime.
//!
//! Ties the core to the outside world: accepts and dials peering sessions,
//! feeds session events into the core, routes the core's outbound messages
//! to the right session, runs the sweeper, and serves the HTTP API.

use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use tgp_core::message::notification;
use tgp_core::{Asset, DomainId, GatewayId, Message, Outbound};
use tgp_policy::DefaultPolicyEngine;
use tgp_routing::PeerInfo;
use tgp_session::{
    connect_with_backoff, PeerIdentity, PeerSession, SessionConfig, SessionEvent, SessionWorker,
    TcpLink,
};
use tgp_settlement::InternalLedger;

use crate::commands::{NodeCommand, SubmitResponse};
use crate::config::GatewayConfig;
use crate::delivery::DeliveryQueue;
use crate::error::GatewayError;
use crate::gateway::{CoreConfig, GatewayCore};
use crate::state::NodeState;
use crate::storage::Storage;

/// Messages buffered per peer ahead of its inbound worker.
const INBOX_CAPACITY: usize = 1024;

/// A running gateway: core, sessions, sweeper and API.
pub struct GatewayNode {
    config: GatewayConfig,
    core: Arc<GatewayCore>,
    delivery: Arc<DeliveryQueue>,
    ledger: Arc<InternalLedger>,
    /// Shared state accessible from HTTP handlers.
    node_state: Option<Arc<NodeState>>,
    /// Receives commands from the HTTP API.
    command_rx: Option<mpsc::Receiver<NodeCommand>>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: Option<mpsc::Receiver<SessionEvent>>,
    shutdown_tx: watch::Sender<bool>,
    /// Senders of established sessions. Written by the event loop only.
    sessions: Arc<DashMap<GatewayId, mpsc::Sender<Message>>>,
    /// Per-peer queues into the inbound workers.
    inboxes: HashMap<GatewayId, mpsc::Sender<Message>>,
}

impl GatewayNode {
    /// Create a node from its configuration. Opens storage when enabled.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        config.validate()?;

        let ledger = Arc::new(InternalLedger::new());
        for opening in &config.ledger.opening_balances {
            ledger.deposit(
                &DomainId::new(opening.domain.clone()),
                &Asset::new(opening.asset.clone()),
                opening.amount,
            );
        }
        let policy = Arc::new(DefaultPolicyEngine::new(config.policy.clone()));
        let delivery = Arc::new(DeliveryQueue::new());

        let mut core = GatewayCore::new(
            CoreConfig::from(&config),
            policy,
            ledger.clone(),
            delivery.clone(),
        );
        if config.storage.enabled {
            let storage = Storage::open(&config.storage.data_dir)?;
            tracing::info!(path = %config.storage.data_dir.display(), "storage initialized");
            core = core.with_storage(Arc::new(storage));
        }

        let (events_tx, events_rx) = mpsc::channel(1024);
        let (shutdown_tx, _) = watch::channel(false);

        tracing::info!(gateway = %config.gateway.id, domain = %config.gateway.domain, "gateway node created");
        Ok(Self {
            config,
            core: Arc::new(core),
            delivery,
            ledger,
            node_state: None,
            command_rx: None,
            events_tx,
            events_rx: Some(events_rx),
            shutdown_tx,
            sessions: Arc::new(DashMap::new()),
            inboxes: HashMap::new(),
        })
    }

    pub fn core(&self) -> &Arc<GatewayCore> {
        &self.core
    }

    pub fn ledger(&self) -> &Arc<InternalLedger> {
        &self.ledger
    }

    /// Restore persisted state, start listening and dialing, and spawn the
    /// HTTP API.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!("starting gateway node");

        let resumed = self.core.restore(Utc::now()).await?;
        if !resumed.is_empty() {
            // No sessions yet; the peers learn the outcome from their own
            // timeouts.
            tracing::warn!(messages = resumed.len(), "restored transactions produced messages before peering");
        }

        let listen_addr = self.config.listen_socket()?;
        let listener = TcpListener::bind(listen_addr).await?;
        tracing::info!(%listen_addr, "listening for peering sessions");
        tokio::spawn(accept_loop(
            listener,
            self.core.gateway_id().clone(),
            self.core.domain_id().clone(),
            self.config.session.clone(),
            self.events_tx.clone(),
            self.shutdown_tx.subscribe(),
        ));

        for peer in &self.config.peers {
            let Some(address) = &peer.address else {
                continue;
            };
            // Only the lower id dials, so a pair never opens two sessions.
            if self.config.gateway.id >= peer.id {
                continue;
            }
            let addr: SocketAddr = address.parse()?;
            tokio::spawn(dial_loop(
                addr,
                self.core.gateway_id().clone(),
                self.core.domain_id().clone(),
                GatewayId::new(peer.id.clone()),
                self.config.session.clone(),
                self.events_tx.clone(),
                self.shutdown_tx.subscribe(),
            ));
        }

        let (command_tx, command_rx) = mpsc::channel::<NodeCommand>(256);
        let node_state = Arc::new(NodeState::new(
            self.core.clone(),
            self.delivery.clone(),
            command_tx,
        ));

        if self.config.api.enabled {
            let api_addr = self.config.api_socket()?;
            let api_state = node_state.clone();
            tokio::spawn(async move {
                if let Err(e) = crate::api::start_api_server(api_addr, api_state).await {
                    tracing::error!(error = %e, "HTTP API server error");
                }
            });
        }

        self.node_state = Some(node_state);
        self.command_rx = Some(command_rx);
        Ok(())
    }

    /// Run the main event loop: session lifecycle, API commands and sweeps.
    ///
    /// Protocol messages are handed to the sending peer's inbound worker, so
    /// each peer's messages reach the core in arrival order while different
    /// peers are handled in parallel.
    pub async fn run(&mut self) -> Result<()> {
        let mut events_rx = self
            .events_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("node not started"))?;
        let mut command_rx = self
            .command_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("node not started"))?;
        let node_state = self
            .node_state
            .clone()
            .ok_or_else(|| anyhow::anyhow!("node not started"))?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut sweep = tokio::time::interval(self.config.sweep_interval());

        tracing::info!("entering main event loop");

        loop {
            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(ev) => self.handle_session_event(&node_state, ev).await,
                    None => {
                        tracing::info!("session event channel closed");
                        break;
                    }
                },
                cmd = command_rx.recv() => match cmd {
                    Some(c) => self.handle_api_command(c).await,
                    None => {
                        tracing::info!("API command channel closed");
                        break;
                    }
                },
                _ = sweep.tick() => {
                    let outbound = self.core.sweep(Utc::now()).await;
                    self.dispatch(outbound);
                }
                _ = shutdown_rx.changed() => break,
            }
        }
        Ok(())
    }

    /// Stop every session (each sends CEASE) and the loops.
    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("shutting down gateway node");
        let _ = self.shutdown_tx.send(true);
        self.inboxes.clear();
        self.sessions.clear();
        self.node_state = None;
        // Give workers a moment to send CEASE.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        tracing::info!("gateway node shut down");
        Ok(())
    }

    async fn handle_session_event(&mut self, state: &Arc<NodeState>, event: SessionEvent) {
        match event {
            SessionEvent::Up { peer, sender } => self.session_up(state, peer, sender).await,
            SessionEvent::Message { peer, message } => match self.inboxes.get(&peer) {
                Some(inbox) => {
                    if inbox.send(message).await.is_err() {
                        tracing::debug!(peer = %peer, "inbound worker gone, message dropped");
                    }
                }
                None => tracing::warn!(peer = %peer, kind = message.kind(), "message from peer without session"),
            },
            SessionEvent::Down { peer, reason } => {
                // A superseded or refused session ended.
                if self.sessions.get(&peer).map(|s| s.is_closed()) != Some(true) {
                    tracing::debug!(peer = %peer, %reason, "stale session down ignored");
                    return;
                }
                self.inboxes.remove(&peer);
                self.sessions.remove(&peer);
                state.remove_peer(&peer);
                tracing::info!(peer = %peer, %reason, "peer down");
                let outbound = self.core.peer_down(&peer, Utc::now()).await;
                self.dispatch(outbound);
            }
        }
    }

    async fn session_up(
        &mut self,
        state: &Arc<NodeState>,
        peer: PeerIdentity,
        sender: mpsc::Sender<Message>,
    ) {
        let refuse = |reason: String| {
            tracing::warn!(peer = %peer.gateway, domain = %peer.domain, %reason, "refusing session");
            let _ = sender.try_send(Message::Notification {
                code: notification::CEASE,
                reason,
            });
        };

        match self
            .config
            .peers
            .iter()
            .find(|p| p.id == peer.gateway.as_str())
        {
            None => return refuse("gateway not configured as a peer".into()),
            Some(p) if p.domain != peer.domain.as_str() => {
                return refuse(format!("expected domain {}", p.domain))
            }
            Some(_) => {}
        }

        if let Some(closed) = self.sessions.get(&peer.gateway).map(|s| s.is_closed()) {
            if !closed {
                return refuse("session already established".into());
            }
            // The old session's Down has not arrived yet; settle it first.
            self.inboxes.remove(&peer.gateway);
            self.sessions.remove(&peer.gateway);
            let outbound = self.core.peer_down(&peer.gateway, Utc::now()).await;
            self.dispatch(outbound);
        }

        tracing::info!(
            peer = %peer.gateway,
            domain = %peer.domain,
            capabilities = ?peer.capabilities,
            hold_time_secs = peer.hold_time.as_secs(),
            "peer up"
        );
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        tokio::spawn(inbound_loop(
            peer.gateway.clone(),
            sender.clone(),
            inbox_rx,
            self.core.clone(),
            self.sessions.clone(),
        ));
        self.inboxes.insert(peer.gateway.clone(), inbox_tx);
        self.sessions.insert(peer.gateway.clone(), sender);
        state.add_peer(peer.gateway.clone());
        let link_cost = self.config.link_cost(&peer.gateway);
        let outbound = self.core.attach_peer(PeerInfo {
            gateway: peer.gateway,
            domain: peer.domain,
            link_cost,
        });
        self.dispatch(outbound);
    }

    async fn handle_api_command(&mut self, cmd: NodeCommand) {
        let now = Utc::now();
        match cmd {
            NodeCommand::Submit { transaction, reply } => {
                tracing::info!(
                    payee = %transaction.payee,
                    amount = transaction.amount,
                    asset = %transaction.asset,
                    "submitting transaction"
                );
                let result = match self.core.submit(transaction, now).await {
                    Ok((id, outbound)) => {
                        self.dispatch(outbound);
                        let status = self
                            .core
                            .htlc()
                            .state(id)
                            .await
                            .map(|s| s.to_string())
                            .unwrap_or_default();
                        Ok(SubmitResponse {
                            transaction_id: id,
                            status,
                        })
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            NodeCommand::Cancel {
                transaction_id,
                reply,
            } => {
                let result = self.core.cancel(transaction_id, now).await;
                let _ = reply.send(self.finish_command(result));
            }
            NodeCommand::ConfirmDelivery {
                transaction_id,
                reply,
            } => {
                let result = self.core.confirm_delivery(transaction_id, now).await;
                if result.is_ok() {
                    self.delivery.take(transaction_id);
                }
                let _ = reply.send(self.finish_command(result));
            }
            NodeCommand::DeliveryFailed {
                transaction_id,
                reason,
                reply,
            } => {
                let result = self.core.delivery_failed(transaction_id, &reason, now).await;
                let _ = reply.send(self.finish_command(result));
            }
        }
    }

    fn finish_command(
        &self,
        result: Result<Vec<Outbound>, GatewayError>,
    ) -> Result<(), GatewayError> {
        let outbound = result?;
        self.dispatch(outbound);
        Ok(())
    }

    fn dispatch(&self, outbound: Vec<Outbound>) {
        dispatch(&self.sessions, outbound);
    }
}

/// Queue each message on its peer's session.
fn dispatch(sessions: &DashMap<GatewayId, mpsc::Sender<Message>>, outbound: Vec<Outbound>) {
    for Outbound { peer, message } in outbound {
        let kind = message.kind();
        match sessions.get(&peer) {
            Some(sender) => {
                if let Err(e) = sender.try_send(message) {
                    tracing::warn!(peer = %peer, kind, error = %e, "session queue rejected message");
                }
            }
            None => tracing::warn!(peer = %peer, kind, "no session for outbound message"),
        }
    }
}

/// Feed one peer's messages to the core in arrival order. Stops when the
/// session closes, so a reconnect never sees the old session's backlog.
async fn inbound_loop(
    peer: GatewayId,
    session: mpsc::Sender<Message>,
    mut inbox: mpsc::Receiver<Message>,
    core: Arc<GatewayCore>,
    sessions: Arc<DashMap<GatewayId, mpsc::Sender<Message>>>,
) {
    while let Some(message) = inbox.recv().await {
        if session.is_closed() {
            break;
        }
        let kind = message.kind();
        match core.handle_message(&peer, message, Utc::now()).await {
            Ok(outbound) => dispatch(&sessions, outbound),
            Err(e) => {
                tracing::warn!(peer = %peer, kind, error = %e, "resetting session");
                let code = if matches!(e, GatewayError::Protocol(_)) {
                    notification::MALFORMED_MESSAGE
                } else {
                    notification::UNEXPECTED_MESSAGE
                };
                dispatch(
                    &sessions,
                    vec![Outbound::new(
                        peer.clone(),
                        Message::Notification {
                            code,
                            reason: e.to_string(),
                        },
                    )],
                );
            }
        }
    }
    tracing::debug!(peer = %peer, "inbound worker stopped");
}

/// Accept inbound sessions until shutdown.
async fn accept_loop(
    listener: TcpListener,
    gateway: GatewayId,
    domain: DomainId,
    config: SessionConfig,
    events: mpsc::Sender<SessionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tracing::debug!(%remote, "inbound connection");
                    let session = PeerSession::new(gateway.clone(), domain.clone(), None, config.clone());
                    let worker = SessionWorker::new(session, TcpLink::new(stream), events.clone());
                    let stop = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = worker.run(stop).await {
                            tracing::debug!(%remote, error = %e, "inbound session ended");
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
            _ = shutdown.changed() => break,
        }
    }
    tracing::info!("session listener stopped");
}

/// Keep a session to `peer` up, redialing with backoff after failures.
async fn dial_loop(
    addr: SocketAddr,
    gateway: GatewayId,
    domain: DomainId,
    peer: GatewayId,
    config: SessionConfig,
    events: mpsc::Sender<SessionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match connect_with_backoff(addr, &config).await {
            Ok(link) => {
                tracing::info!(peer = %peer, %addr, "connected");
                let session =
                    PeerSession::new(gateway.clone(), domain.clone(), Some(peer.clone()), config.clone());
                match SessionWorker::new(session, link, events.clone())
                    .run(shutdown.clone())
                    .await
                {
                    Ok(()) => break,
                    Err(e) => tracing::warn!(peer = %peer, error = %e, "session failed"),
                }
            }
            Err(e) => tracing::warn!(peer = %peer, %addr, error = %e, "peer unreachable"),
        }
        tokio::select! {
            _ = tokio::time::sleep(config.reconnect_backoff_max) => {}
            _ = shutdown.changed() => break,
        }
    }
}
