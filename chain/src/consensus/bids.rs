//! Per-round bid collection.
//!
//! Bids are collected during the first phase of a round. A bid is kept
//! only if its signature verifies, its sender is not blacklisted, it
//! arrives before the window closes and (in strict mode) it targets the
//! local round exactly. The first valid bid per identity wins.

use std::collections::BTreeMap;

use rand::RngCore;
use tracing::debug;

use crate::crypto::Wallet;
use crate::types::{BidEntry, BidPacket, Hash256, PublicKey};

use super::config::ConsensusConfig;
use super::error::ConsensusError;
use super::malicious::MaliciousRecord;
use super::selector::sort_bids;

/// Collects and validates bids, and tracks the local round number.
#[derive(Debug)]
pub struct BidManager {
    round_interval_ms: u64,
    phase1_duration_ms: u64,
    strict_rounds: bool,
    current_round: u64,
    phase1_end_ms: u64,
    bids: BTreeMap<u64, BTreeMap<PublicKey, BidPacket>>,
}

impl BidManager {
    pub fn new(cfg: &ConsensusConfig) -> Self {
        Self {
            round_interval_ms: cfg.round_interval_ms.max(1),
            phase1_duration_ms: cfg.phase1_duration_ms,
            strict_rounds: cfg.strict_rounds,
            current_round: 0,
            phase1_end_ms: 0,
            bids: BTreeMap::new(),
        }
    }

    pub fn current_round(&self) -> u64 {
        self.current_round
    }

    /// Absolute time after which bids for the current round are refused.
    pub fn phase1_end(&self) -> u64 {
        self.phase1_end_ms
    }

    /// Enters `round` and opens its bid window.
    pub fn start_round(&mut self, round: u64, now_ms: u64) {
        let round_start = now_ms - now_ms % self.round_interval_ms;
        self.current_round = round;
        self.phase1_end_ms = round_start + self.phase1_duration_ms;
    }

    /// Checks a peer-announced round. Ignored in strict mode.
    ///
    /// The local round only ever follows the scheduler, so proposals and
    /// the bids they are derived from stay keyed by the same round. A peer
    /// one round ahead is tolerated (its early bids are accepted); one
    /// further ahead is refused. Returns `true` if the peer is ahead.
    pub fn handle_round(&self, announced: u64) -> Result<bool, ConsensusError> {
        if self.strict_rounds {
            return Ok(false);
        }
        let next = self.current_round.saturating_add(1);
        if announced > next {
            return Err(ConsensusError::StaleOrFutureRound {
                expected: next,
                got: announced,
            });
        }
        if announced == next && next > self.current_round {
            debug!(local = self.current_round, peer = announced, "peer is one round ahead");
            return Ok(true);
        }
        Ok(false)
    }

    /// Draws a fresh secret, signs a bid for the current round and keeps it.
    pub fn generate_bid<R: RngCore>(&mut self, wallet: &Wallet, now_ms: u64, rng: &mut R) -> BidPacket {
        let mut secret = [0u8; 32];
        rng.fill_bytes(&mut secret);
        let packet = BidPacket::sign(wallet, self.current_round, Hash256::compute(&secret), now_ms);

        self.bids
            .entry(packet.round)
            .or_default()
            .entry(packet.public_key.clone())
            .or_insert_with(|| packet.clone());
        packet
    }

    /// Validates and stores a peer's bid.
    pub fn receive_bid(
        &mut self,
        packet: BidPacket,
        malicious: &MaliciousRecord,
        now_ms: u64,
    ) -> Result<(), ConsensusError> {
        if !packet.verify() {
            return Err(ConsensusError::SignatureInvalid("bid"));
        }
        if malicious.is_blacklisted(&packet.public_key) {
            return Err(ConsensusError::Blacklisted(packet.public_key));
        }
        if now_ms > self.phase1_end_ms || packet.timestamp > self.phase1_end_ms {
            return Err(ConsensusError::StaleOrFutureRound {
                expected: self.current_round.saturating_add(1),
                got: packet.round,
            });
        }
        let round_ok = if self.strict_rounds {
            packet.round == self.current_round
        } else {
            packet.round == self.current_round || Some(packet.round) == self.current_round.checked_add(1)
        };
        if !round_ok {
            return Err(ConsensusError::StaleOrFutureRound {
                expected: self.current_round,
                got: packet.round,
            });
        }

        let round_bids = self.bids.entry(packet.round).or_default();
        if round_bids.contains_key(&packet.public_key) {
            return Err(ConsensusError::DuplicateDelivery);
        }
        round_bids.insert(packet.public_key.clone(), packet);
        Ok(())
    }

    pub fn bids_for_round(&self, round: u64) -> Vec<BidPacket> {
        self.bids
            .get(&round)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn bid_count(&self, round: u64) -> usize {
        self.bids.get(&round).map_or(0, BTreeMap::len)
    }

    /// Sorted `{public_key, bid_hash}` snapshot, skipping blacklisted peers.
    pub fn bid_entries(&self, round: u64, malicious: &MaliciousRecord) -> Vec<BidEntry> {
        let mut entries: Vec<BidEntry> = self
            .bids
            .get(&round)
            .into_iter()
            .flat_map(|m| m.values())
            .filter(|b| !malicious.is_blacklisted(&b.public_key))
            .map(|b| BidEntry {
                public_key: b.public_key.clone(),
                bid_hash: b.bid_hash,
            })
            .collect();
        sort_bids(&mut entries);
        entries
    }

    /// Drops bids of every round strictly before `round`.
    pub fn clear_before(&mut self, round: u64) {
        self.bids = self.bids.split_off(&round);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    const ROUND: u64 = 600_000;

    fn setup(strict: bool) -> (BidManager, StdRng) {
        let cfg = ConsensusConfig {
            strict_rounds: strict,
            ..ConsensusConfig::default()
        };
        let mut mgr = BidManager::new(&cfg);
        mgr.start_round(5, 5 * ROUND);
        (mgr, StdRng::seed_from_u64(3))
    }

    #[test]
    fn accepts_valid_bid_inside_window() {
        let (mut mgr, mut rng) = setup(true);
        let peer = Wallet::generate(&mut rng);
        let bid = BidPacket::sign(&peer, 5, Hash256::compute(b"s"), 5 * ROUND + 10);
        mgr.receive_bid(bid, &MaliciousRecord::new(3), 5 * ROUND + 20).expect("accepted");
        assert_eq!(mgr.bid_count(5), 1);
    }

    #[test]
    fn first_bid_per_identity_wins() {
        let (mut mgr, mut rng) = setup(true);
        let peer = Wallet::generate(&mut rng);
        let rec = MaliciousRecord::new(3);
        let first = BidPacket::sign(&peer, 5, Hash256::compute(b"a"), 5 * ROUND + 1);
        let second = BidPacket::sign(&peer, 5, Hash256::compute(b"b"), 5 * ROUND + 2);

        mgr.receive_bid(first.clone(), &rec, 5 * ROUND + 3).expect("first");
        let err = mgr.receive_bid(second, &rec, 5 * ROUND + 4).unwrap_err();
        assert!(matches!(err, ConsensusError::DuplicateDelivery));
        assert_eq!(mgr.bids_for_round(5), vec![first]);
    }

    #[test]
    fn rejects_bad_signature_blacklisted_and_late() {
        let (mut mgr, mut rng) = setup(true);
        let peer = Wallet::generate(&mut rng);
        let mut rec = MaliciousRecord::new(3);

        let mut forged = BidPacket::sign(&peer, 5, Hash256::compute(b"a"), 5 * ROUND);
        forged.bid_hash = Hash256::compute(b"b");
        assert!(matches!(
            mgr.receive_bid(forged, &rec, 5 * ROUND),
            Err(ConsensusError::SignatureInvalid(_))
        ));

        let late = BidPacket::sign(&peer, 5, Hash256::compute(b"a"), 5 * ROUND);
        assert!(matches!(
            mgr.receive_bid(late.clone(), &rec, mgr.phase1_end() + 1),
            Err(ConsensusError::StaleOrFutureRound { .. })
        ));

        for _ in 0..3 {
            rec.add_strike(peer.public_key());
        }
        assert!(matches!(
            mgr.receive_bid(late, &rec, 5 * ROUND),
            Err(ConsensusError::Blacklisted(_))
        ));
        assert_eq!(mgr.bid_count(5), 0);
    }

    #[test]
    fn strict_mode_requires_exact_round() {
        let (mut mgr, mut rng) = setup(true);
        let peer = Wallet::generate(&mut rng);
        let rec = MaliciousRecord::new(3);
        for round in [4, 6] {
            let bid = BidPacket::sign(&peer, round, Hash256::compute(b"x"), 5 * ROUND);
            assert!(matches!(
                mgr.receive_bid(bid, &rec, 5 * ROUND),
                Err(ConsensusError::StaleOrFutureRound { .. })
            ));
        }
        assert!(!mgr.handle_round(9).expect("ignored"));
        assert_eq!(mgr.current_round(), 5);
    }

    #[test]
    fn peer_driven_mode_tolerates_one_round_ahead() {
        let (mgr, _) = setup(false);
        assert!(mgr.handle_round(6).expect("next round"));
        assert!(!mgr.handle_round(5).expect("same round"));
        assert!(!mgr.handle_round(4).expect("past round"));
        assert!(matches!(
            mgr.handle_round(7),
            Err(ConsensusError::StaleOrFutureRound { expected: 6, got: 7 })
        ));
        assert_eq!(mgr.current_round(), 5);
    }

    #[test]
    fn far_future_announcements_leave_the_bid_round_alone() {
        let (mut mgr, mut rng) = setup(false);
        let rec = MaliciousRecord::new(3);
        for announced in [u64::MAX, 1_000] {
            assert!(mgr.handle_round(announced).is_err());
        }
        assert_eq!(mgr.current_round(), 5);

        let peer = Wallet::generate(&mut rng);
        let bid = BidPacket::sign(&peer, 5, Hash256::compute(b"honest"), 5 * ROUND + 10);
        mgr.receive_bid(bid, &rec, 5 * ROUND + 20).expect("honest bid");
        let own = mgr.generate_bid(&Wallet::generate(&mut rng), 5 * ROUND + 30, &mut rng);
        assert_eq!(own.round, 5);
        assert_eq!(mgr.bid_count(5), 2);
        assert_eq!(mgr.bid_count(1_000), 0);
    }

    #[test]
    fn next_round_announcement_mid_window_keeps_current_bids() {
        let (mut mgr, mut rng) = setup(false);
        let rec = MaliciousRecord::new(3);
        assert!(mgr.handle_round(6).expect("one ahead"));

        let peer = Wallet::generate(&mut rng);
        let bid = BidPacket::sign(&peer, 5, Hash256::compute(b"on time"), 5 * ROUND + 50);
        mgr.receive_bid(bid, &rec, 5 * ROUND + 60).expect("current round bid");
        let other = Wallet::generate(&mut rng);
        let early = BidPacket::sign(&other, 6, Hash256::compute(b"early"), 5 * ROUND + 70);
        mgr.receive_bid(early, &rec, 5 * ROUND + 80).expect("next round bid");
        assert_eq!((mgr.bid_count(5), mgr.bid_count(6)), (1, 1));
    }

    #[test]
    fn last_round_does_not_overflow() {
        let cfg = ConsensusConfig {
            strict_rounds: false,
            ..ConsensusConfig::default()
        };
        let mut mgr = BidManager::new(&cfg);
        mgr.start_round(u64::MAX, 5 * ROUND);
        assert!(!mgr.handle_round(u64::MAX).expect("same round"));

        let mut rng = StdRng::seed_from_u64(8);
        let peer = Wallet::generate(&mut rng);
        let late = BidPacket::sign(&peer, u64::MAX, Hash256::compute(b"x"), 5 * ROUND);
        assert!(matches!(
            mgr.receive_bid(late.clone(), &MaliciousRecord::new(3), mgr.phase1_end() + 1),
            Err(ConsensusError::StaleOrFutureRound { .. })
        ));
        mgr.receive_bid(late, &MaliciousRecord::new(3), 5 * ROUND).expect("accepted");
    }

    #[test]
    fn entries_are_sorted_and_skip_blacklisted() {
        let (mut mgr, mut rng) = setup(true);
        let mut rec = MaliciousRecord::new(1);
        let wallets: Vec<Wallet> = (0..4).map(|_| Wallet::generate(&mut rng)).collect();
        for (i, w) in wallets.iter().enumerate() {
            let bid = BidPacket::sign(w, 5, Hash256::compute(&[i as u8]), 5 * ROUND);
            mgr.receive_bid(bid, &rec, 5 * ROUND).expect("accepted");
        }
        rec.add_strike(wallets[0].public_key());

        let entries = mgr.bid_entries(5, &rec);
        assert_eq!(entries.len(), 3);
        assert!(entries.windows(2).all(|w| w[0].bid_hash <= w[1].bid_hash));
        assert!(entries.iter().all(|e| &e.public_key != wallets[0].public_key()));
    }

    #[test]
    fn own_bid_is_recorded_and_old_rounds_clear() {
        let (mut mgr, mut rng) = setup(true);
        let me = Wallet::generate(&mut rng);
        let bid = mgr.generate_bid(&me, 5 * ROUND + 1, &mut rng);
        assert!(bid.verify());
        assert_eq!(bid.round, 5);
        assert_eq!(mgr.bid_count(5), 1);

        mgr.clear_before(6);
        assert_eq!(mgr.bid_count(5), 0);
    }
}
