//! Luck-mode proposal timing and evaluation.
//!
//! Every node proposes a block carrying a [`LuckProof`] but waits before
//! broadcasting it: the luckier the node, the earlier its slot. Receivers
//! keep whichever verifiable proposal for the next index has the highest
//! luck.

use rand::Rng;

use crate::types::{Block, LuckProof};

use super::error::ConsensusError;
use super::malicious::MaliciousRecord;

/// Broadcast slot for `luck`: `floor((1 - luck) * slots)`, clamped to the
/// last slot.
pub fn broadcast_slot(luck: f64, slots: u64) -> u64 {
    let slots = slots.max(1);
    let raw = ((1.0 - luck.clamp(0.0, 1.0)) * slots as f64).floor() as u64;
    raw.min(slots - 1)
}

/// Slot start plus a uniform jitter inside the slot.
pub fn broadcast_delay<R: Rng>(luck: f64, slots: u64, slot_ms: u64, rng: &mut R) -> u64 {
    let base = broadcast_slot(luck, slots) * slot_ms;
    if slot_ms == 0 {
        base
    } else {
        base + rng.gen_range(0..slot_ms)
    }
}

/// What to do with a luck-mode proposal relative to the local tip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LuckVerdict {
    /// Extends the tip.
    Append,
    /// Competes with the tip and is luckier.
    ReplaceTip,
    /// Anything else.
    Outdated,
}

fn proof_of(block: &Block) -> Result<&LuckProof, ConsensusError> {
    let proof = block
        .luck_proof
        .as_ref()
        .ok_or_else(|| ConsensusError::MalformedInput("proposal without luck proof".into()))?;
    if !proof.verify() {
        return Err(ConsensusError::SignatureInvalid("luck proof"));
    }
    if proof.public_key != block.proposer || proof.round != block.index {
        return Err(ConsensusError::MalformedInput(
            "luck proof does not belong to the proposal".into(),
        ));
    }
    // The seed must be committed in the hashed bid list.
    let committed = block
        .bid_hash_list
        .iter()
        .any(|e| e.public_key == block.proposer && e.bid_hash == proof.seed);
    if !committed {
        return Err(ConsensusError::MalformedInput(
            "luck proof seed missing from the bid list".into(),
        ));
    }
    Ok(proof)
}

/// Checks a proposal's luck proof and classifies it against `tip`.
///
/// Linkage, hash and signature checks are left to the ledger.
pub fn evaluate_proposal(
    block: &Block,
    tip: &Block,
    malicious: &MaliciousRecord,
) -> Result<LuckVerdict, ConsensusError> {
    if malicious.is_blacklisted(&block.proposer) {
        return Err(ConsensusError::Blacklisted(block.proposer.clone()));
    }
    let proof = proof_of(block)?;

    if block.index == tip.index + 1 {
        return Ok(LuckVerdict::Append);
    }
    if block.index == tip.index && block.hash != tip.hash {
        let beats_tip = tip
            .luck_proof
            .as_ref()
            .is_some_and(|current| proof.luck_value > current.luck_value);
        if beats_tip {
            return Ok(LuckVerdict::ReplaceTip);
        }
    }
    Ok(LuckVerdict::Outdated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Wallet;
    use crate::types::{BidEntry, BlockHash, Hash256};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn proposal(w: &Wallet, index: u64, prev: BlockHash, seed: u8) -> Block {
        let entry = BidEntry {
            public_key: w.public_key().clone(),
            bid_hash: Hash256([seed; 32]),
        };
        let mut b = Block::candidate(index, prev, vec![], vec![entry]).seal(w, index * 10);
        b.luck_proof = Some(LuckProof::from_seed(w, index, Hash256([seed; 32])));
        b
    }

    #[test]
    fn luckier_nodes_get_earlier_slots() {
        assert_eq!(broadcast_slot(1.0, 10), 0);
        assert_eq!(broadcast_slot(0.95, 10), 0);
        assert_eq!(broadcast_slot(0.5, 10), 5);
        assert_eq!(broadcast_slot(0.0, 10), 9);
        assert_eq!(broadcast_slot(0.3, 0), 0);
    }

    #[test]
    fn delay_stays_inside_the_slot() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let d = broadcast_delay(0.5, 10, 100, &mut rng);
            assert!((500..600).contains(&d), "{d}");
        }
        assert_eq!(broadcast_delay(0.5, 10, 0, &mut rng), 0);
    }

    #[test]
    fn next_index_appends_and_luckier_rival_replaces() {
        let mut rng = StdRng::seed_from_u64(9);
        let (a, b) = (Wallet::generate(&mut rng), Wallet::generate(&mut rng));
        let g = Block::genesis();
        let rec = MaliciousRecord::new(3);

        let pa = proposal(&a, 1, g.hash, 1);
        assert_eq!(evaluate_proposal(&pa, &g, &rec).expect("valid"), LuckVerdict::Append);

        let pb = proposal(&b, 1, g.hash, 2);
        let (lucky, unlucky) = if pa.luck_proof.as_ref().map(|p| p.luck_value)
            > pb.luck_proof.as_ref().map(|p| p.luck_value)
        {
            (pa, pb)
        } else {
            (pb, pa)
        };
        assert_eq!(evaluate_proposal(&lucky, &unlucky, &rec).expect("valid"), LuckVerdict::ReplaceTip);
        assert_eq!(evaluate_proposal(&unlucky, &lucky, &rec).expect("valid"), LuckVerdict::Outdated);
    }

    #[test]
    fn forged_or_foreign_proofs_are_rejected() {
        let mut rng = StdRng::seed_from_u64(10);
        let (a, b) = (Wallet::generate(&mut rng), Wallet::generate(&mut rng));
        let g = Block::genesis();
        let rec = MaliciousRecord::new(3);

        let mut inflated = proposal(&a, 1, g.hash, 1);
        if let Some(p) = inflated.luck_proof.as_mut() {
            p.luck_value = u64::MAX;
        }
        assert!(matches!(
            evaluate_proposal(&inflated, &g, &rec),
            Err(ConsensusError::SignatureInvalid(_))
        ));

        let mut borrowed = proposal(&a, 1, g.hash, 1);
        borrowed.luck_proof = Some(LuckProof::from_seed(&b, 1, Hash256([1; 32])));
        assert!(matches!(
            evaluate_proposal(&borrowed, &g, &rec),
            Err(ConsensusError::MalformedInput(_))
        ));

        let bare = Block::candidate(1, g.hash, vec![], vec![]).seal(&a, 5);
        assert!(evaluate_proposal(&bare, &g, &rec).is_err());
    }

    #[test]
    fn seed_must_be_committed_in_the_bid_list() {
        let mut rng = StdRng::seed_from_u64(12);
        let (a, b) = (Wallet::generate(&mut rng), Wallet::generate(&mut rng));
        let g = Block::genesis();
        let rec = MaliciousRecord::new(3);
        let seed = Hash256([7; 32]);

        let commit = |entries: Vec<BidEntry>| {
            let mut block = Block::candidate(1, g.hash, vec![], entries).seal(&a, 10);
            block.luck_proof = Some(LuckProof::from_seed(&a, 1, seed));
            block
        };
        let own = BidEntry { public_key: a.public_key().clone(), bid_hash: seed };
        let other_seed = BidEntry { public_key: a.public_key().clone(), bid_hash: Hash256([8; 32]) };
        let other_key = BidEntry { public_key: b.public_key().clone(), bid_hash: seed };

        assert_eq!(evaluate_proposal(&commit(vec![own]), &g, &rec).expect("committed"), LuckVerdict::Append);
        for entries in [vec![], vec![other_seed], vec![other_key]] {
            assert!(matches!(
                evaluate_proposal(&commit(entries), &g, &rec),
                Err(ConsensusError::MalformedInput(_))
            ));
        }
    }

    #[test]
    fn blacklisted_proposer_is_rejected() {
        let mut rng = StdRng::seed_from_u64(11);
        let a = Wallet::generate(&mut rng);
        let mut rec = MaliciousRecord::new(1);
        rec.add_strike(a.public_key());
        let p = proposal(&a, 1, Block::genesis().hash, 1);
        assert!(matches!(
            evaluate_proposal(&p, &Block::genesis(), &rec),
            Err(ConsensusError::Blacklisted(_))
        ));
    }
}
