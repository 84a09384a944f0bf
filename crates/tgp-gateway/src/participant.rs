//! Relay and payee bookkeeping for transactions this gateway does not
//! originate.
//!
//! A gateway at position `p` of the domain path receives hop `p` (from
//! `domain_path[p-1]`) and, as a relay, pays hop `p + 1`. It checks what
//! the payer asks it to lock against those two hops: the hash commitment,
//! the amounts, and that its incoming hop outlives its outgoing hop by the
//! safety margin.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tgp_core::{Asset, DomainId, GatewayId, HashLock, Preimage, SettleStatus, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Relay,
    Payee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantState {
    /// SELECT passed through, waiting for the payee's answer.
    Selecting,
    /// Payee accepted; hash commitment known.
    Selected,
    /// The incoming hop is locked.
    Locked,
    /// SERVE seen.
    Serving,
    /// Preimage seen.
    Revealed,
    Settled,
    Refunded,
    Aborted,
}

impl ParticipantState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Settled | Self::Refunded | Self::Aborted)
    }
}

impl fmt::Display for ParticipantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Selecting => "selecting",
            Self::Selected => "selected",
            Self::Locked => "locked",
            Self::Serving => "serving",
            Self::Revealed => "revealed",
            Self::Settled => "settled",
            Self::Refunded => "refunded",
            Self::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// What this gateway has seen of one hop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopObservation {
    pub hop: u32,
    pub amount: u64,
    pub timeout: DateTime<Utc>,
    #[serde(default)]
    pub status: Option<SettleStatus>,
}

/// Which neighbour a message came from, relative to the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Upstream,
    Downstream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub transaction_id: TransactionId,
    pub role: Role,
    /// Index of the local domain in `domain_path`.
    pub position: usize,
    pub domain_path: Vec<DomainId>,
    pub upstream: GatewayId,
    pub downstream: Option<GatewayId>,
    pub amount: u64,
    pub asset: Asset,
    pub deadline: DateTime<Utc>,
    pub hash_lock: Option<HashLock>,
    pub preimage: Option<Preimage>,
    pub incoming: Option<HopObservation>,
    pub outgoing: Option<HopObservation>,
    pub state: ParticipantState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ParticipantRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transaction_id: TransactionId,
        position: usize,
        domain_path: Vec<DomainId>,
        upstream: GatewayId,
        downstream: Option<GatewayId>,
        amount: u64,
        asset: Asset,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let role = if downstream.is_some() {
            Role::Relay
        } else {
            Role::Payee
        };
        Self {
            transaction_id,
            role,
            position,
            domain_path,
            upstream,
            downstream,
            amount,
            asset,
            deadline,
            hash_lock: None,
            preimage: None,
            incoming: None,
            outgoing: None,
            state: ParticipantState::Selecting,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn incoming_hop(&self) -> u32 {
        self.position as u32
    }

    pub fn outgoing_hop(&self) -> Option<u32> {
        match self.role {
            Role::Relay => Some(self.position as u32 + 1),
            Role::Payee => None,
        }
    }

    pub fn side_of(&self, peer: &GatewayId) -> Option<Side> {
        if *peer == self.upstream {
            Some(Side::Upstream)
        } else if self.downstream.as_ref() == Some(peer) {
            Some(Side::Downstream)
        } else {
            None
        }
    }

    pub fn set_state(&mut self, state: ParticipantState, now: DateTime<Utc>) {
        if self.state != state {
            tracing::debug!(
                transaction_id = %self.transaction_id,
                from = %self.state,
                to = %state,
                "participant state changed"
            );
        }
        self.state = state;
        self.updated_at = now;
    }

    /// Check and record a LOCK for `hop`, which must be one of this
    /// gateway's two hops. The error is the reason sent back in LOCK_ACK.
    pub fn observe_lock(
        &mut self,
        hop: u32,
        hash: HashLock,
        timeout: DateTime<Utc>,
        amount: u64,
        margin: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        if self.state.is_terminal() {
            return Err(format!("transaction already {}", self.state));
        }
        match self.hash_lock {
            Some(h) if h == hash => {}
            Some(_) => return Err("hash commitment differs from SELECT_ACK".into()),
            None => return Err("no hash commitment agreed yet".into()),
        }
        if timeout <= now {
            return Err(format!("hop {} timeout already passed", hop));
        }
        if timeout > self.deadline {
            return Err(format!("hop {} timeout beyond transaction deadline", hop));
        }

        let observation = HopObservation {
            hop,
            amount,
            timeout,
            status: None,
        };
        let mut incoming = self.incoming.clone();
        let mut outgoing = self.outgoing.clone();
        if hop == self.incoming_hop() {
            incoming = Some(observation);
        } else if Some(hop) == self.outgoing_hop() {
            outgoing = Some(observation);
        } else {
            return Err(format!("hop {} does not touch position {}", hop, self.position));
        }

        if let (Some(inc), Some(out)) = (&incoming, &outgoing) {
            if inc.timeout - out.timeout < margin {
                return Err(format!(
                    "timeout gap {}s between hops {} and {} below margin {}s",
                    (inc.timeout - out.timeout).num_seconds(),
                    inc.hop,
                    out.hop,
                    margin.num_seconds()
                ));
            }
            if out.amount > inc.amount {
                return Err(format!(
                    "outgoing amount {} exceeds incoming {}",
                    out.amount, inc.amount
                ));
            }
        }

        self.incoming = incoming;
        self.outgoing = outgoing;
        if hop == self.incoming_hop() && self.state == ParticipantState::Selected {
            self.set_state(ParticipantState::Locked, now);
        }
        self.updated_at = now;
        Ok(())
    }

    /// Record a preimage seen travelling upstream. False if it does not
    /// open the agreed commitment.
    pub fn observe_preimage(&mut self, preimage: &Preimage, now: DateTime<Utc>) -> bool {
        match self.hash_lock {
            Some(h) if h.verify(preimage) => {
                self.preimage = Some(preimage.clone());
                if !self.state.is_terminal() {
                    self.set_state(ParticipantState::Revealed, now);
                }
                true
            }
            _ => false,
        }
    }

    /// Record a SETTLE outcome for one of this gateway's hops.
    pub fn observe_settle(&mut self, hop: u32, status: SettleStatus, now: DateTime<Utc>) {
        for obs in [self.incoming.as_mut(), self.outgoing.as_mut()].into_iter().flatten() {
            if obs.hop == hop {
                obs.status = Some(status);
            }
        }
        if hop != self.incoming_hop() {
            self.updated_at = now;
            return;
        }
        let next = match status {
            SettleStatus::Settled => ParticipantState::Settled,
            SettleStatus::Refunded => ParticipantState::Refunded,
            // A late abort notice cannot undo a revealed preimage.
            SettleStatus::Aborted if self.preimage.is_some() => return,
            SettleStatus::Aborted => ParticipantState::Aborted,
        };
        self.set_state(next, now);
    }

    fn hop_closed(obs: &Option<HopObservation>) -> bool {
        match obs {
            None => true,
            Some(o) => matches!(o.status, Some(SettleStatus::Settled | SettleStatus::Refunded)),
        }
    }

    /// Nothing more can arrive for this record: every hop it locked was
    /// settled or refunded, or the transaction deadline is behind us.
    pub fn is_finished(&self, now: DateTime<Utc>) -> bool {
        if now >= self.deadline {
            return true;
        }
        self.state.is_terminal()
            && Self::hop_closed(&self.incoming)
            && Self::hop_closed(&self.outgoing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay(now: DateTime<Utc>) -> ParticipantRecord {
        let mut rec = ParticipantRecord::new(
            TransactionId::new(),
            1,
            vec![DomainId::from("A"), DomainId::from("B"), DomainId::from("C")],
            GatewayId::from("gw-a"),
            Some(GatewayId::from("gw-c")),
            100,
            Asset::new("USD"),
            now + Duration::seconds(60),
            now,
        );
        rec.hash_lock = Some(Preimage::from_bytes([7; 32]).commitment());
        rec.state = ParticipantState::Selected;
        rec
    }

    #[test]
    fn test_role_and_hops() {
        let now = Utc::now();
        let rec = relay(now);
        assert_eq!(rec.role, Role::Relay);
        assert_eq!(rec.incoming_hop(), 1);
        assert_eq!(rec.outgoing_hop(), Some(2));
        assert_eq!(rec.side_of(&GatewayId::from("gw-c")), Some(Side::Downstream));
        assert_eq!(rec.side_of(&GatewayId::from("gw-x")), None);
    }

    #[test]
    fn test_lock_pair_with_margin_accepted() {
        let now = Utc::now();
        let mut rec = relay(now);
        let hash = rec.hash_lock.unwrap();
        let t = rec.deadline;
        let margin = Duration::seconds(10);
        rec.observe_lock(1, hash, t - Duration::seconds(10), 100, margin, now).unwrap();
        assert_eq!(rec.state, ParticipantState::Locked);
        rec.observe_lock(2, hash, t - Duration::seconds(20), 95, margin, now).unwrap();
        assert_eq!(rec.outgoing.as_ref().unwrap().amount, 95);
    }

    #[test]
    fn test_lock_pair_inside_margin_rejected_in_either_order() {
        let now = Utc::now();
        let margin = Duration::seconds(10);

        let mut rec = relay(now);
        let hash = rec.hash_lock.unwrap();
        let t = rec.deadline;
        rec.observe_lock(2, hash, t - Duration::seconds(15), 95, margin, now).unwrap();
        let err = rec
            .observe_lock(1, hash, t - Duration::seconds(10), 100, margin, now)
            .unwrap_err();
        assert!(err.contains("below margin"));
        // Rejected lock is not recorded.
        assert!(rec.incoming.is_none());
        assert_eq!(rec.state, ParticipantState::Selected);
    }

    #[test]
    fn test_lock_with_wrong_hash_or_amount_rejected() {
        let now = Utc::now();
        let margin = Duration::seconds(10);
        let mut rec = relay(now);
        let hash = rec.hash_lock.unwrap();
        let t = rec.deadline;
        let other = Preimage::from_bytes([8; 32]).commitment();
        assert!(rec.observe_lock(1, other, t - Duration::seconds(10), 100, margin, now).is_err());
        rec.observe_lock(1, hash, t - Duration::seconds(10), 100, margin, now).unwrap();
        assert!(rec
            .observe_lock(2, hash, t - Duration::seconds(20), 150, margin, now)
            .unwrap_err()
            .contains("exceeds"));
        assert!(rec.observe_lock(3, hash, t - Duration::seconds(30), 90, margin, now).is_err());
    }

    #[test]
    fn test_preimage_checked_against_commitment() {
        let now = Utc::now();
        let mut rec = relay(now);
        assert!(!rec.observe_preimage(&Preimage::from_bytes([1; 32]), now));
        assert!(rec.preimage.is_none());
        assert!(rec.observe_preimage(&Preimage::from_bytes([7; 32]), now));
        assert_eq!(rec.state, ParticipantState::Revealed);
        // Abort after reveal does not roll the state back.
        rec.observe_settle(1, SettleStatus::Aborted, now);
        assert_eq!(rec.state, ParticipantState::Revealed);
    }

    #[test]
    fn test_finished_once_both_hops_close() {
        let now = Utc::now();
        let margin = Duration::seconds(10);
        let mut rec = relay(now);
        let hash = rec.hash_lock.unwrap();
        let t = rec.deadline;
        rec.observe_lock(1, hash, t - Duration::seconds(10), 100, margin, now).unwrap();
        rec.observe_lock(2, hash, t - Duration::seconds(20), 95, margin, now).unwrap();

        rec.observe_settle(2, SettleStatus::Settled, now);
        assert!(!rec.is_finished(now));
        rec.observe_settle(1, SettleStatus::Settled, now);
        assert_eq!(rec.state, ParticipantState::Settled);
        assert!(rec.is_finished(now));
    }

    #[test]
    fn test_finished_after_deadline() {
        let now = Utc::now();
        let rec = relay(now);
        assert!(!rec.is_finished(now));
        assert!(rec.is_finished(rec.deadline));
    }
}
