//! Transaction-pool synchronization by Merkle-root comparison.
//!
//! Divergent pools produce divergent candidate blocks and therefore
//! divergent target hashes, even among honest peers. Before the proposal
//! phase each node publishes the Merkle root of its round set; a node whose
//! root differs from the plurality fetches the full set from a peer that
//! holds the majority root and merges what it is missing.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::consensus::votes::{VoteOutcome, VoteTally};
use crate::types::{Hash256, PublicKey, Transaction, TxId};

use super::pool::TransactionPool;

const EMPTY_SENTINEL: &[u8] = b"empty";

/// Merkle root over transaction digests.
///
/// Leaves are the per-transaction hashes sorted ascending; parents hash
/// the concatenation of their children; an odd trailing node pairs with
/// itself. A single leaf is its own root and the empty set maps to
/// `H("empty")`.
pub fn merkle_root(transactions: &[Transaction]) -> Hash256 {
    if transactions.is_empty() {
        return Hash256::compute(EMPTY_SENTINEL);
    }
    let mut level: Vec<Hash256> = transactions.iter().map(|tx| tx.hash).collect();
    level.sort();

    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = pair[0];
                let right = pair.get(1).copied().unwrap_or(left);
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(left.as_bytes());
                buf[32..].copy_from_slice(right.as_bytes());
                Hash256::compute(&buf)
            })
            .collect();
    }
    level[0]
}

/// Transactions in `theirs` whose id is absent from `ours`.
pub fn find_missing(ours: &[Transaction], theirs: &[Transaction]) -> Vec<Transaction> {
    let known: BTreeSet<&str> = ours.iter().map(|tx| tx.id.as_str()).collect();
    theirs
        .iter()
        .filter(|tx| !known.contains(tx.id.as_str()))
        .cloned()
        .collect()
}

/// Outcome of applying a peer's transaction set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Transactions newly merged into the pool.
    pub added: usize,
    /// Whether the local round set now hashes to the majority root.
    pub converged: bool,
}

/// Per-round root tally and repair state.
#[derive(Debug, Default)]
pub struct TransactionSynchronizer {
    round: u64,
    local_root: Option<Hash256>,
    roots: VoteTally,
    requested: bool,
    adopted: Option<BTreeSet<TxId>>,
}

impl TransactionSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    /// Starts a new exchange for `round`, counting the local root.
    pub fn begin_round(&mut self, round: u64, self_pk: &PublicKey, local_root: Hash256) {
        if self.round != round {
            self.reset(round);
        }
        self.local_root = Some(local_root);
        self.roots.record(self_pk.clone(), local_root);
    }

    fn reset(&mut self, round: u64) {
        self.round = round;
        self.local_root = None;
        self.roots = VoteTally::new();
        self.requested = false;
        self.adopted = None;
    }

    pub fn local_root(&self) -> Option<Hash256> {
        self.local_root
    }

    /// Counts a peer's root. Returns `false` for past rounds or repeats.
    ///
    /// A root for a later round opens that round early, so peers whose
    /// cut-off fires a little before ours are still counted.
    pub fn record_root(&mut self, round: u64, peer: PublicKey, root: Hash256) -> bool {
        if round < self.round {
            debug!(round, local = self.round, "merkle root for a past round ignored");
            return false;
        }
        if round > self.round {
            self.reset(round);
        }
        matches!(self.roots.record(peer, root), VoteOutcome::Counted)
    }

    /// Plurality root; ties go to the smallest root.
    pub fn majority_root(&self) -> Option<Hash256> {
        self.roots.leader().map(|(root, _)| root)
    }

    /// `true` if the local root disagrees with the plurality and no set
    /// has been requested yet this round.
    pub fn needs_repair(&self) -> bool {
        match (self.local_root, self.majority_root()) {
            (Some(local), Some(major)) => local != major && !self.requested,
            _ => false,
        }
    }

    /// Smallest peer key (other than `self_pk`) holding the majority root.
    pub fn responder(&self, self_pk: &PublicKey) -> Option<PublicKey> {
        let major = self.majority_root()?;
        self.roots
            .voters_for(&major)
            .into_iter()
            .find(|pk| pk != self_pk)
    }

    pub fn mark_requested(&mut self) {
        self.requested = true;
    }

    /// Forces a fresh request, e.g. after a target-hash mismatch.
    pub fn reset_request(&mut self) {
        self.requested = false;
    }

    /// Merges a peer's round set into `pool`.
    ///
    /// The set is only used if it hashes to the current majority root. On
    /// success the round's candidate block is restricted to exactly these
    /// ids (see [`Self::adopted_ids`]).
    pub fn apply_set(
        &mut self,
        round: u64,
        set: &[Transaction],
        pool: &mut TransactionPool,
    ) -> Option<SyncOutcome> {
        if round != self.round {
            return None;
        }
        let major = self.majority_root()?;
        if merkle_root(set) != major {
            debug!(round, "transaction set does not match majority root");
            return None;
        }

        let ours = pool.transactions();
        let missing = find_missing(&ours, set);
        let added = pool.merge_missing(missing);

        let ids: BTreeSet<TxId> = set.iter().map(|tx| tx.id.clone()).collect();
        let converged = pool
            .select_ids(&ids)
            .map(|txs| merkle_root(&txs) == major)
            .unwrap_or(false);
        if converged {
            self.local_root = Some(major);
            self.adopted = Some(ids);
        }
        info!(round, added, converged, "transaction pool synchronized");
        Some(SyncOutcome { added, converged })
    }

    /// Ids the round's candidate block must contain, once repaired.
    pub fn adopted_ids(&self, round: u64) -> Option<&BTreeSet<TxId>> {
        (round == self.round).then_some(self.adopted.as_ref()).flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Wallet;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn wallet() -> Wallet {
        Wallet::generate(&mut StdRng::seed_from_u64(41))
    }

    fn txs(ids: &[&str]) -> Vec<Transaction> {
        let w = wallet();
        ids.iter()
            .enumerate()
            .map(|(i, id)| Transaction::with_id(&w, *id, format!("reading-{id}"), 100 + i as u64))
            .collect()
    }

    #[test]
    fn empty_set_maps_to_sentinel() {
        assert_eq!(merkle_root(&[]), Hash256::compute(b"empty"));
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let set = txs(&["a"]);
        assert_eq!(merkle_root(&set), set[0].hash);
    }

    #[test]
    fn root_is_permutation_invariant() {
        let mut set = txs(&["a", "b", "c", "d", "e"]);
        let root = merkle_root(&set);
        set.reverse();
        assert_eq!(merkle_root(&set), root);
        set.rotate_left(2);
        assert_eq!(merkle_root(&set), root);
    }

    #[test]
    fn odd_node_pairs_with_itself() {
        let set = txs(&["a", "b", "c"]);
        let mut leaves: Vec<Hash256> = set.iter().map(|t| t.hash).collect();
        leaves.sort();
        let pair = |l: Hash256, r: Hash256| {
            let mut buf = Vec::with_capacity(64);
            buf.extend_from_slice(l.as_bytes());
            buf.extend_from_slice(r.as_bytes());
            Hash256::compute(&buf)
        };
        let expected = pair(pair(leaves[0], leaves[1]), pair(leaves[2], leaves[2]));
        assert_eq!(merkle_root(&set), expected);
    }

    #[test]
    fn distinct_sets_have_distinct_roots() {
        let all = txs(&["a", "b", "c", "d", "e", "f", "g", "h"]);
        let mut seen = BTreeSet::new();
        for mask in 0u32..(1 << all.len()) {
            let subset: Vec<Transaction> = all
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, t)| t.clone())
                .collect();
            assert!(seen.insert(merkle_root(&subset)), "collision at mask {mask}");
        }
    }

    #[test]
    fn missing_is_computed_by_id() {
        let ours = txs(&["a", "b"]);
        let theirs = txs(&["a", "b", "c"]);
        let missing = find_missing(&ours, &theirs);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].id, "c");
    }

    #[test]
    fn majority_is_plurality_with_smallest_root_tiebreak() {
        let mut s = TransactionSynchronizer::new();
        let me = PublicKey(vec![0x02, 0]);
        let (x, y) = (Hash256::compute(b"x"), Hash256::compute(b"y"));
        s.begin_round(1, &me, x);
        s.record_root(1, PublicKey(vec![0x02, 1]), y);
        assert_eq!(s.majority_root(), Some(x.min(y)));

        s.record_root(1, PublicKey(vec![0x02, 2]), y);
        assert_eq!(s.majority_root(), Some(y));
        assert!(s.needs_repair());
        assert_eq!(s.responder(&me), Some(PublicKey(vec![0x02, 1])));

        s.mark_requested();
        assert!(!s.needs_repair());
    }

    #[test]
    fn other_rounds_and_repeats_are_not_counted() {
        let mut s = TransactionSynchronizer::new();
        let me = PublicKey(vec![0x02, 0]);
        let root = Hash256::compute(b"r");
        s.begin_round(3, &me, root);
        assert!(!s.record_root(2, PublicKey(vec![0x02, 1]), root));
        assert!(s.record_root(3, PublicKey(vec![0x02, 1]), root));
        assert!(!s.record_root(3, PublicKey(vec![0x02, 1]), root));
    }

    #[test]
    fn early_roots_for_the_next_round_are_kept() {
        let mut s = TransactionSynchronizer::new();
        let me = PublicKey(vec![0x02, 0]);
        let (ours, theirs) = (Hash256::compute(b"ours"), Hash256::compute(b"theirs"));
        s.begin_round(3, &me, ours);

        assert!(s.record_root(4, PublicKey(vec![0x02, 1]), theirs));
        assert!(s.record_root(4, PublicKey(vec![0x02, 2]), theirs));
        assert_eq!(s.round(), 4);
        assert_eq!(s.local_root(), None);
        assert!(!s.needs_repair());

        s.begin_round(4, &me, ours);
        assert_eq!(s.majority_root(), Some(theirs));
        assert!(s.needs_repair());
    }

    #[test]
    fn divergent_pool_converges_after_apply() {
        let full = txs(&["tx1", "tx2", "tx3"]);
        let partial: Vec<Transaction> = full[..2].to_vec();

        let mut pool = TransactionPool::new();
        for tx in &partial {
            pool.add(tx.clone()).expect("add");
        }

        let me = PublicKey(vec![0x02, 9]);
        let mut s = TransactionSynchronizer::new();
        s.begin_round(1, &me, merkle_root(&partial));
        for i in 1..=4u8 {
            s.record_root(1, PublicKey(vec![0x02, i]), merkle_root(&full));
        }
        assert!(s.needs_repair());

        // A set that does not hash to the majority root is refused.
        assert_eq!(s.apply_set(1, &partial, &mut pool), None);

        let outcome = s.apply_set(1, &full, &mut pool).expect("applied");
        assert_eq!(outcome, SyncOutcome { added: 1, converged: true });
        assert!(pool.contains("tx3"));
        assert_eq!(s.local_root(), Some(merkle_root(&full)));
        assert_eq!(s.adopted_ids(1).map(BTreeSet::len), Some(3));
    }
}
