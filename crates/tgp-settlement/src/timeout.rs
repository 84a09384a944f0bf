//! Per-hop timeout schedule.
//!
//! Hop 1 is payer-adjacent and gets the latest timeout; each hop towards
//! the payee expires one margin earlier, so every upstream gateway sees a
//! downstream timeout at least one margin before its own fires.

use chrono::{DateTime, Duration, Utc};

use crate::error::SettlementError;

/// `timeout(h_i) = deadline - i * margin` for `i` in `1..=hops`. `None`
/// when the schedule falls outside the representable time range.
pub fn hop_timeouts(deadline: DateTime<Utc>, hops: usize, margin: Duration) -> Option<Vec<DateTime<Utc>>> {
    (1..=hops)
        .map(|i| {
            let i = i32::try_from(i).ok()?;
            deadline.checked_sub_signed(margin.checked_mul(i)?)
        })
        .collect()
}

/// Deadline for delivery confirmation: the payee-adjacent hop timeout
/// minus the grace left for the preimage to travel back.
pub fn serve_deadline(timeouts: &[DateTime<Utc>], claim_grace: Duration) -> Option<DateTime<Utc>> {
    timeouts.last().and_then(|t| t.checked_sub_signed(claim_grace))
}

/// Check that timeouts strictly decrease from hop 1 with at least `margin`
/// between neighbours.
pub fn verify_ordering(timeouts: &[DateTime<Utc>], margin: Duration) -> Result<(), SettlementError> {
    for (i, pair) in timeouts.windows(2).enumerate() {
        let gap = pair[0] - pair[1];
        if gap < margin {
            return Err(SettlementError::TimeoutOrdering {
                hop: i as u32 + 2,
                reason: format!(
                    "gap to previous hop is {}s, margin is {}s",
                    gap.num_seconds(),
                    margin.num_seconds()
                ),
            });
        }
    }
    Ok(())
}
