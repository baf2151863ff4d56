//! Proposer selection: closest bid to a target hash.
//!
//! Pure and stateless. Bid hashes and the target are read as unsigned
//! 256-bit big-endian integers. The winner is the bid with minimal
//! absolute distance to the target; equal distances go to the
//! lexicographically smaller public key. Any two nodes holding the same
//! bid set and target pick the same winner regardless of arrival order.

use crate::types::{BidEntry, Hash256, PublicKey};

/// Sorts bids by numeric value ascending, then by public key.
pub fn sort_bids(bids: &mut [BidEntry]) {
    bids.sort_by(|a, b| {
        a.bid_hash
            .cmp(&b.bid_hash)
            .then_with(|| a.public_key.cmp(&b.public_key))
    });
}

/// Binary-searches a slice already ordered by [`sort_bids`].
///
/// Returns `None` only for an empty slice.
pub fn closest_bid<'a>(sorted: &'a [BidEntry], target: &Hash256) -> Option<&'a BidEntry> {
    if sorted.is_empty() {
        return None;
    }
    let t = target.to_u256();

    // First entry whose value is >= target; it heads its equal-value group.
    let upper = sorted.partition_point(|b| b.bid_hash.to_u256() < t);

    let mut candidates: Vec<usize> = Vec::with_capacity(2);
    if upper < sorted.len() {
        candidates.push(upper);
    }
    if upper > 0 {
        // Walk back to the head of the lower neighbour's group so equal
        // values resolve to the smallest key.
        let value = sorted[upper - 1].bid_hash;
        let mut i = upper - 1;
        while i > 0 && sorted[i - 1].bid_hash == value {
            i -= 1;
        }
        candidates.push(i);
    }

    candidates
        .into_iter()
        .map(|i| &sorted[i])
        .min_by(|a, b| {
            a.bid_hash
                .to_u256()
                .abs_diff(t)
                .cmp(&b.bid_hash.to_u256().abs_diff(t))
                .then_with(|| a.public_key.cmp(&b.public_key))
        })
}

/// Sorts a copy of `bids` and returns the winning identity.
pub fn select_proposer(bids: &[BidEntry], target: &Hash256) -> Option<PublicKey> {
    let mut sorted = bids.to_vec();
    sort_bids(&mut sorted);
    closest_bid(&sorted, target).map(|b| b.public_key.clone())
}
