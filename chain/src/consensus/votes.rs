//! Vote tallying with one vote per identity.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{Hash256, PublicKey};

/// Two-thirds quorum over `n` active identities: `ceil(2n / 3)`.
pub fn quorum_threshold(n: usize) -> usize {
    (2 * n).div_ceil(3)
}

/// Result of recording a single vote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VoteOutcome {
    /// First vote from this identity.
    Counted,
    /// Same identity, same hash. No-op.
    Duplicate,
    /// Same identity voted for a different hash earlier. The original
    /// vote stands.
    Equivocation { first: Hash256 },
}

/// Votes cast for one decision (a round's block, a chain length, ...).
#[derive(Clone, Debug, Default)]
pub struct VoteTally {
    votes: BTreeMap<PublicKey, Hash256>,
    counts: BTreeMap<Hash256, usize>,
}

impl VoteTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, voter: PublicKey, hash: Hash256) -> VoteOutcome {
        if let Some(first) = self.votes.get(&voter) {
            if *first == hash {
                return VoteOutcome::Duplicate;
            }
            return VoteOutcome::Equivocation { first: *first };
        }
        self.votes.insert(voter, hash);
        *self.counts.entry(hash).or_insert(0) += 1;
        VoteOutcome::Counted
    }

    pub fn vote_of(&self, voter: &PublicKey) -> Option<&Hash256> {
        self.votes.get(voter)
    }

    pub fn count(&self, hash: &Hash256) -> usize {
        self.counts.get(hash).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// Hash with the most votes. Ties go to the smallest hash.
    pub fn leader(&self) -> Option<(Hash256, usize)> {
        self.counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(h, c)| (*h, *c))
    }

    /// Leading hash if it reaches two-thirds of `active`.
    pub fn supermajority(&self, active: usize) -> Option<Hash256> {
        let (hash, count) = self.leader()?;
        (active > 0 && count >= quorum_threshold(active)).then_some(hash)
    }

    /// `true` when every member of `electorate` has voted.
    pub fn complete(&self, electorate: &BTreeSet<PublicKey>) -> bool {
        electorate.iter().all(|pk| self.votes.contains_key(pk))
    }

    /// Voters for `hash`, in key order.
    pub fn voters_for(&self, hash: &Hash256) -> Vec<PublicKey> {
        self.votes
            .iter()
            .filter(|(_, h)| *h == hash)
            .map(|(pk, _)| pk.clone())
            .collect()
    }

    /// Drops votes cast by identities outside `electorate`.
    pub fn retain_voters(&mut self, electorate: &BTreeSet<PublicKey>) {
        self.votes.retain(|pk, _| electorate.contains(pk));
        self.counts.clear();
        for hash in self.votes.values() {
            *self.counts.entry(*hash).or_insert(0) += 1;
        }
    }

    /// Voters whose hash differs from `hash`.
    pub fn dissenters(&self, hash: &Hash256) -> Vec<PublicKey> {
        self.votes
            .iter()
            .filter(|(_, h)| *h != hash)
            .map(|(pk, _)| pk.clone())
            .collect()
    }
}
