//! Majority voting over blocks, chains and malicious-peer records.
//!
//! The coordinator owns every tally the node keeps plus the
//! [`MaliciousRecord`] they feed. It performs no I/O: callers pass in
//! verified votes and act on the returned events.
//!
//! Block votes are decided per round once every member of the round's
//! electorate (the non-blacklisted bidders) has voted and one hash holds a
//! two-thirds majority. Chain votes are decided as soon as two-thirds of
//! the active peers agree. In both cases identities on the losing side are
//! struck once; votes arriving after the decision only feed that
//! accounting and never re-open it.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::types::{Block, BlockHash, Hash256, PublicKey};

use super::error::ConsensusError;
use super::malicious::{MaliciousRecord, MaliciousSnapshot};
use super::votes::{VoteOutcome, VoteTally, quorum_threshold};

/// Identities struck by one event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Strikes {
    pub struck: Vec<PublicKey>,
    /// Subset of `struck` that crossed the blacklist threshold.
    pub blacklisted: Vec<PublicKey>,
}

impl Strikes {
    pub fn is_empty(&self) -> bool {
        self.struck.is_empty()
    }

    fn into_block_event(self) -> BlockVoteEvent {
        if self.is_empty() {
            BlockVoteEvent::Pending
        } else {
            BlockVoteEvent::Struck(self)
        }
    }

    fn merge(&mut self, other: Strikes) {
        self.struck.extend(other.struck);
        self.blacklisted.extend(other.blacklisted);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockDecision {
    pub round: u64,
    pub hash: BlockHash,
    pub strikes: Strikes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockVoteEvent {
    Pending,
    Decided(BlockDecision),
    /// No decision, but someone was struck (equivocation or late dissent).
    Struck(Strikes),
}

/// Chain tallies are keyed by what is being compared.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChainKey {
    /// Whole chains of this many blocks.
    Full { len: u64 },
    /// Suffixes ending at this tip index.
    Suffix { tip: u64 },
}

impl ChainKey {
    fn height(&self) -> u64 {
        match self {
            ChainKey::Full { len } => len.saturating_sub(1),
            ChainKey::Suffix { tip } => *tip,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainDecision {
    pub key: ChainKey,
    pub hash: Hash256,
    pub blocks: Vec<Block>,
    pub strikes: Strikes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainVoteEvent {
    Pending,
    Decided(ChainDecision),
    Struck(Strikes),
}

#[derive(Debug, Default)]
struct BlockRound {
    tally: VoteTally,
    electorate: Option<BTreeSet<PublicKey>>,
    /// Proposer -> hash of the block it broadcast.
    proposals: BTreeMap<PublicKey, Hash256>,
    decided: Option<Hash256>,
    struck: BTreeSet<PublicKey>,
}

#[derive(Debug, Default)]
struct ChainRound {
    tally: VoteTally,
    candidates: BTreeMap<Hash256, Vec<Block>>,
    decided: Option<Hash256>,
    struck: BTreeSet<PublicKey>,
}

pub struct ConsensusCoordinator {
    local: PublicKey,
    malicious: MaliciousRecord,
    rounds: BTreeMap<u64, BlockRound>,
    chains: BTreeMap<ChainKey, ChainRound>,
    /// Latest snapshot digest announced by each peer.
    snapshot_votes: BTreeMap<PublicKey, Hash256>,
    snapshots: BTreeMap<Hash256, MaliciousSnapshot>,
}

/// Strikes `pk` unless it is the local node, already blacklisted or
/// already struck for this decision.
fn strike(
    malicious: &mut MaliciousRecord,
    local: &PublicKey,
    already: &mut BTreeSet<PublicKey>,
    pk: &PublicKey,
) -> Strikes {
    let mut out = Strikes::default();
    if pk == local || malicious.is_blacklisted(pk) || !already.insert(pk.clone()) {
        return out;
    }
    out.struck.push(pk.clone());
    if malicious.add_strike(pk) {
        out.blacklisted.push(pk.clone());
    }
    debug!(peer = %pk.short(), strikes = malicious.strikes(pk), "malicious strike");
    out
}

impl ConsensusCoordinator {
    pub fn new(local: PublicKey, malicious: MaliciousRecord) -> Self {
        Self {
            local,
            malicious,
            rounds: BTreeMap::new(),
            chains: BTreeMap::new(),
            snapshot_votes: BTreeMap::new(),
            snapshots: BTreeMap::new(),
        }
    }

    pub fn malicious(&self) -> &MaliciousRecord {
        &self.malicious
    }

    pub fn is_blacklisted(&self, pk: &PublicKey) -> bool {
        self.malicious.is_blacklisted(pk)
    }

    // ------------------------------------------------------------------
    // Block votes
    // ------------------------------------------------------------------

    /// Fixes the electorate of `round`. Votes already received from
    /// outsiders are discarded.
    pub fn open_block_round(&mut self, round: u64, electorate: BTreeSet<PublicKey>) -> BlockVoteEvent {
        let electorate: BTreeSet<PublicKey> = electorate
            .into_iter()
            .filter(|pk| !self.malicious.is_blacklisted(pk))
            .collect();
        let entry = self.rounds.entry(round).or_default();
        entry.tally.retain_voters(&electorate);
        entry.electorate = Some(electorate);
        self.try_decide_block(round)
    }

    /// Records `voter`'s vote for `hash` in `round`.
    pub fn record_block_vote(
        &mut self,
        round: u64,
        voter: PublicKey,
        hash: BlockHash,
    ) -> Result<BlockVoteEvent, ConsensusError> {
        if self.malicious.is_blacklisted(&voter) {
            return Err(ConsensusError::Blacklisted(voter));
        }
        let entry = self.rounds.entry(round).or_default();
        if let Some(electorate) = &entry.electorate {
            if !electorate.contains(&voter) {
                return Err(ConsensusError::MalformedInput(format!(
                    "voter {} did not bid in round {round}",
                    voter.short()
                )));
            }
        }

        match entry.tally.record(voter.clone(), hash.0) {
            VoteOutcome::Duplicate => Err(ConsensusError::DuplicateDelivery),
            VoteOutcome::Equivocation { first } => {
                warn!(round, voter = %voter.short(), first = %first.short(), second = %hash.0.short(), "vote equivocation");
                let strikes = strike(&mut self.malicious, &self.local, &mut entry.struck, &voter);
                Ok(strikes.into_block_event())
            }
            VoteOutcome::Counted => {
                let decided = entry.decided;
                match decided {
                    Some(decided) if decided != hash.0 => {
                        debug!(round, voter = %voter.short(), "late dissenting vote");
                        let strikes = strike(&mut self.malicious, &self.local, &mut entry.struck, &voter);
                        Ok(strikes.into_block_event())
                    }
                    Some(_) => Ok(BlockVoteEvent::Pending),
                    None => Ok(self.try_decide_block(round)),
                }
            }
        }
    }

    /// Remembers which block `proposer` broadcast for `round`.
    ///
    /// A proposer whose block loses the round's decision is struck, at
    /// most once per round even if it also voted for its own block.
    pub fn note_proposal(&mut self, round: u64, proposer: PublicKey, hash: BlockHash) -> BlockVoteEvent {
        let entry = self.rounds.entry(round).or_default();
        entry.proposals.entry(proposer.clone()).or_insert(hash.0);
        let decided = entry.decided;
        match decided {
            Some(decided) if decided != hash.0 => {
                strike(&mut self.malicious, &self.local, &mut entry.struck, &proposer).into_block_event()
            }
            _ => BlockVoteEvent::Pending,
        }
    }

    fn try_decide_block(&mut self, round: u64) -> BlockVoteEvent {
        let Some(entry) = self.rounds.get_mut(&round) else {
            return BlockVoteEvent::Pending;
        };
        if entry.decided.is_some() {
            return BlockVoteEvent::Pending;
        }
        let Some(electorate) = &entry.electorate else {
            return BlockVoteEvent::Pending;
        };
        if electorate.is_empty() || !entry.tally.complete(electorate) {
            return BlockVoteEvent::Pending;
        }
        let Some(hash) = entry.tally.supermajority(electorate.len()) else {
            info!(round, voters = entry.tally.len(), "block votes complete without a two-thirds majority");
            return BlockVoteEvent::Pending;
        };
        entry.decided = Some(hash);

        let mut losers = entry.tally.dissenters(&hash);
        losers.extend(
            entry
                .proposals
                .iter()
                .filter(|(_, h)| **h != hash)
                .map(|(pk, _)| pk.clone()),
        );
        let mut strikes = Strikes::default();
        for pk in &losers {
            strikes.merge(strike(&mut self.malicious, &self.local, &mut entry.struck, pk));
        }
        info!(
            round,
            hash = %hash.short(),
            votes = entry.tally.count(&hash),
            electorate = electorate.len(),
            struck = strikes.struck.len(),
            "block majority reached"
        );
        BlockVoteEvent::Decided(BlockDecision {
            round,
            hash: BlockHash(hash),
            strikes,
        })
    }

    pub fn decided_block(&self, round: u64) -> Option<BlockHash> {
        self.rounds.get(&round).and_then(|r| r.decided).map(BlockHash)
    }

    pub fn block_vote_of(&self, round: u64, voter: &PublicKey) -> Option<BlockHash> {
        self.rounds
            .get(&round)
            .and_then(|r| r.tally.vote_of(voter))
            .copied()
            .map(BlockHash)
    }

    /// Forgets block rounds strictly before `round`.
    pub fn prune_rounds(&mut self, round: u64) {
        self.rounds = self.rounds.split_off(&round);
    }

    // ------------------------------------------------------------------
    // Chain votes
    // ------------------------------------------------------------------

    /// Records `voter`'s chain (or suffix) under `key`.
    ///
    /// `active` is the number of non-blacklisted identities, the local
    /// node included.
    pub fn record_chain(
        &mut self,
        key: ChainKey,
        voter: PublicKey,
        hash: Hash256,
        blocks: Vec<Block>,
        active: usize,
    ) -> Result<ChainVoteEvent, ConsensusError> {
        if self.malicious.is_blacklisted(&voter) {
            return Err(ConsensusError::Blacklisted(voter));
        }
        let entry = self.chains.entry(key).or_default();
        match entry.tally.record(voter.clone(), hash) {
            VoteOutcome::Duplicate => return Err(ConsensusError::DuplicateDelivery),
            VoteOutcome::Equivocation { .. } => {
                warn!(?key, voter = %voter.short(), "chain vote equivocation");
                let strikes = strike(&mut self.malicious, &self.local, &mut entry.struck, &voter);
                if strikes.is_empty() {
                    return Ok(ChainVoteEvent::Pending);
                }
                return Ok(ChainVoteEvent::Struck(strikes));
            }
            VoteOutcome::Counted => {}
        }
        entry.candidates.entry(hash).or_insert(blocks);

        if let Some(decided) = entry.decided {
            if decided == hash {
                return Ok(ChainVoteEvent::Pending);
            }
            let strikes = strike(&mut self.malicious, &self.local, &mut entry.struck, &voter);
            if strikes.is_empty() {
                return Ok(ChainVoteEvent::Pending);
            }
            return Ok(ChainVoteEvent::Struck(strikes));
        }

        let Some(majority) = entry.tally.supermajority(active) else {
            return Ok(ChainVoteEvent::Pending);
        };
        entry.decided = Some(majority);
        let blocks = entry.candidates.remove(&majority).unwrap_or_default();
        entry.candidates.clear();

        let mut strikes = Strikes::default();
        for pk in entry.tally.dissenters(&majority) {
            strikes.merge(strike(&mut self.malicious, &self.local, &mut entry.struck, &pk));
        }
        info!(?key, hash = %majority.short(), votes = entry.tally.count(&majority), active, "chain majority reached");
        Ok(ChainVoteEvent::Decided(ChainDecision {
            key,
            hash: majority,
            blocks,
            strikes,
        }))
    }

    pub fn has_chain_vote(&self, key: ChainKey, voter: &PublicKey) -> bool {
        self.chains
            .get(&key)
            .is_some_and(|c| c.tally.vote_of(voter).is_some())
    }

    /// Forgets chain tallies for heights strictly below `height`.
    pub fn prune_chains(&mut self, height: u64) {
        self.chains.retain(|key, _| key.height() >= height);
    }

    // ------------------------------------------------------------------
    // Malicious-record votes
    // ------------------------------------------------------------------

    /// Counts a peer's snapshot. Returns the merged snapshot once two
    /// thirds of `active` identities announced the same one.
    ///
    /// Snapshots that do not carry more strikes than the local record are
    /// ignored.
    pub fn record_malicious(
        &mut self,
        voter: PublicKey,
        snapshot: MaliciousSnapshot,
        active: usize,
    ) -> Result<Option<MaliciousSnapshot>, ConsensusError> {
        if self.malicious.is_blacklisted(&voter) {
            return Err(ConsensusError::Blacklisted(voter));
        }
        if snapshot.total_strikes() <= self.malicious.total_strikes() {
            debug!(peer = %voter.short(), "malicious snapshot not ahead of local record");
            return Ok(None);
        }
        let digest = snapshot.digest();
        if self.snapshot_votes.get(&voter) == Some(&digest) {
            return Err(ConsensusError::DuplicateDelivery);
        }
        self.snapshot_votes.insert(voter, digest);
        self.snapshots.entry(digest).or_insert(snapshot);

        let agreeing = self.snapshot_votes.values().filter(|d| **d == digest).count();
        if active == 0 || agreeing < quorum_threshold(active) {
            return Ok(None);
        }
        let Some(snapshot) = self.snapshots.remove(&digest) else {
            return Ok(None);
        };
        self.malicious.adopt(&snapshot);
        self.snapshot_votes.clear();
        self.snapshots.clear();
        info!(
            agreeing,
            strikes = self.malicious.total_strikes(),
            blacklisted = self.malicious.blacklisted().len(),
            "adopted majority malicious record"
        );
        Ok(Some(self.malicious.snapshot()))
    }
}
