//! Power-of-two-choices endpoint selection weighted by latency or load.
//!
//! # Algorithm
//! ```text
//! 0 candidates  → None
//! 1 candidate   → it
//! 2 candidates  → compare both
//! n candidates  → compare two distinct random picks
//!
//! weights  = latency averages if both have a full window, else loads
//! sort so w0 <= w1, W = w0 + w1, draw d in [0, W]
//! d <= w0  → the heavier candidate, else the lighter one
//! ```
//! The lighter candidate wins with probability `w1 / W`. When both weights
//! are zero the draw is always 0 and the heavier (second) candidate wins.
//!
//! The winner must also pass its announced limiter for the identity; if it
//! refuses, the other candidate is tried, and if both refuse the request is
//! rejected with `TooManyRequests`.

use std::sync::Arc;

use crate::routing::upstream::UpstreamError;
use crate::upstreamer::endpoint::Endpoint;
use crate::upstreamer::latency::LatencyTable;
use crate::upstreamer::peers::PeerState;
use crate::upstreamer::randomizer::Randomizer;

/// Inputs shared by every selection.
pub struct Balancer<'a> {
    pub latencies: &'a LatencyTable,
    pub randomizer: &'a dyn Randomizer,
    pub peers: &'a PeerState,
}

impl Balancer<'_> {
    pub fn select(
        &self,
        identity: &str,
        candidates: &[Arc<Endpoint>],
    ) -> Result<Option<String>, UpstreamError> {
        let (n1, n2) = match candidates.len() {
            0 => return Ok(None),
            1 => return Ok(Some(candidates[0].address().to_string())),
            2 => (0, 1),
            len => self.randomizer.pick_pair(len),
        };

        let mut pair = [&candidates[n1], &candidates[n2]];

        let gateways = self.peers.gateways();
        let peers_changed_at = self.peers.last_change();
        for ep in pair {
            ep.adjust_limiter(identity, gateways, peers_changed_at);
        }

        let mut weights = match (
            self.latencies.average(pair[0].address()),
            self.latencies.average(pair[1].address()),
        ) {
            (Some(w0), Some(w1)) if w0 > 0.0 && w1 > 0.0 => [w0, w1],
            _ => [pair[0].last_load(), pair[1].last_load()],
        };

        if weights[0] > weights[1] {
            pair.swap(0, 1);
            weights.swap(0, 1);
        }

        let total = weights[0] + weights[1];
        let draw = self.randomizer.draw(total);
        let winner = if draw <= weights[0] { 1 } else { 0 };

        for idx in [winner, 1 - winner] {
            let ep = pair[idx];
            let admitted = ep.limiter(identity).map_or(true, |l| l.allow());
            if admitted {
                return Ok(Some(ep.address().to_string()));
            }
        }

        Err(UpstreamError::TooManyRequests)
    }
}
