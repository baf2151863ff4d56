//! The consensus node: one owner for all per-node protocol state.
//!
//! A [`ConsensusNode`] wires together:
//!
//! - a [`Ledger`] (chain, persistence and block validity),
//! - a [`BidManager`] for per-round bids,
//! - the [`TransactionPool`] and its [`TransactionSynchronizer`],
//! - a [`ConsensusCoordinator`] for block/chain/malicious-data votes,
//! - a [`RoundScheduler`] driving the round phases, and
//! - a [`ForkChoice`] rule filtering announced chains.
//!
//! Every entry point takes the current time explicitly and returns the
//! messages to send as [`Outbound`] effects. The node itself performs no
//! I/O, which keeps it deterministic under test.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use rand::rngs::StdRng;
use rand::{CryptoRng, RngCore, SeedableRng};
use tracing::{debug, info, warn};

use crate::crypto::Wallet;
use crate::mempool::{TransactionPool, TransactionSynchronizer, merkle_root};
use crate::metrics::ConsensusMetrics;
use crate::p2p::dedup::ProcessedMessages;
use crate::p2p::message::{
    BlockVote, ChainAnnouncement, ChainRequest, MaliciousData, Message, MerkleRootMsg,
    RoundAnnouncement, Signed, TxSet, TxSetRequest,
};
use crate::types::{
    BidEntry, BidPacket, Block, BlockHash, Hash256, LuckProof, PublicKey, Transaction,
    simplified_chain_hash,
};

use super::bids::BidManager;
use super::config::{ConsensusConfig, ConsensusMode};
use super::coordinator::{
    BlockVoteEvent, ChainDecision, ChainKey, ChainVoteEvent, ConsensusCoordinator, Strikes,
};
use super::error::ConsensusError;
use super::fork_choice::ForkChoice;
use super::ledger::{Ledger, validate_chain};
use super::luck::{LuckVerdict, broadcast_delay, evaluate_proposal};
use super::malicious::MaliciousRecord;
use super::proposer::{Proposer, RoundTarget};
use super::scheduler::{PhaseAction, RoundScheduler, SchedulerState};
use super::store::LedgerStore;
use super::validator::BlockValidator;

/// Block rounds and targets older than this many rounds are forgotten.
const RETAINED_ROUNDS: u64 = 8;

/// Side effect requested by the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Send to every connected peer.
    Broadcast(Message),
    /// Send to the peer the current message came from.
    Reply(Message),
    /// Call [`ConsensusNode::run_deferred`] with `task` after `delay_ms`.
    Schedule { delay_ms: u64, task: Deferred },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deferred {
    /// Broadcast the local luck-mode proposal for `index` if it still wins.
    BroadcastProposal { index: u64 },
}

/// Loads the node's key from `store`, generating and persisting a new one
/// on first start.
pub fn load_or_create_wallet<S, R>(store: &mut S, rng: &mut R) -> Result<Wallet, ConsensusError>
where
    S: LedgerStore,
    R: RngCore + CryptoRng,
{
    if let Some(secret) = store.load_wallet_secret()? {
        return Wallet::from_secret_bytes(&secret)
            .map_err(|e| ConsensusError::MalformedInput(format!("stored wallet key: {e}")));
    }
    let wallet = Wallet::generate(rng);
    store.save_wallet_secret(&wallet.secret_bytes())?;
    info!(public_key = %wallet.public_key().short(), "generated node wallet");
    Ok(wallet)
}

pub struct ConsensusNode<S, V, F> {
    config: ConsensusConfig,
    wallet: Wallet,
    ledger: Ledger<S, V>,
    fork_choice: F,
    proposer: Proposer,
    scheduler: RoundScheduler,
    schedule: SchedulerState,
    bids: BidManager,
    pool: TransactionPool,
    sync: TransactionSynchronizer,
    coordinator: ConsensusCoordinator,
    /// Round -> independently derived target.
    targets: BTreeMap<u64, RoundTarget>,
    /// Blocks waiting for their round's target, with arrival time.
    buffered: Vec<(Block, u64)>,
    /// Verified blocks by hash, kept for convergence after a decision.
    seen_blocks: HashMap<BlockHash, Block>,
    /// Luck mode: our sealed proposal waiting for its broadcast slot.
    own_proposal: Option<Block>,
    processed: ProcessedMessages,
    peers: BTreeSet<PublicKey>,
    blocks_since_cleanup: u64,
    rng: StdRng,
    metrics: Option<ConsensusMetrics>,
}

impl<S, V, F> ConsensusNode<S, V, F>
where
    S: LedgerStore,
    V: BlockValidator,
    F: ForkChoice,
{
    /// Builds a node around an opened ledger, restoring the persisted
    /// malicious-peer record.
    pub fn new(
        config: ConsensusConfig,
        wallet: Wallet,
        ledger: Ledger<S, V>,
        fork_choice: F,
    ) -> Result<Self, ConsensusError> {
        let malicious = match ledger.store().load_malicious()? {
            Some(snapshot) => MaliciousRecord::from_snapshot(snapshot, config.malicious_threshold),
            None => MaliciousRecord::new(config.malicious_threshold),
        };
        let coordinator = ConsensusCoordinator::new(wallet.public_key().clone(), malicious);
        info!(
            public_key = %wallet.public_key().short(),
            mode = ?config.mode,
            strict_rounds = config.strict_rounds,
            "consensus node ready"
        );
        Ok(Self {
            proposer: Proposer::from_config(&config),
            scheduler: RoundScheduler::from_config(&config),
            schedule: SchedulerState::default(),
            bids: BidManager::new(&config),
            pool: TransactionPool::new(),
            sync: TransactionSynchronizer::new(),
            coordinator,
            targets: BTreeMap::new(),
            buffered: Vec::new(),
            seen_blocks: HashMap::new(),
            own_proposal: None,
            processed: ProcessedMessages::new(config.dedup_retention_ms),
            peers: BTreeSet::new(),
            blocks_since_cleanup: 0,
            rng: StdRng::from_entropy(),
            metrics: None,
            config,
            wallet,
            ledger,
            fork_choice,
        })
    }

    /// Replaces the entropy-seeded RNG, for reproducible runs.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_metrics(mut self, metrics: ConsensusMetrics) -> Self {
        metrics.chain_height.set(self.ledger.tip().index as i64);
        metrics
            .blacklisted_peers
            .set(self.coordinator.malicious().blacklisted().len() as i64);
        self.metrics = Some(metrics);
        self
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn public_key(&self) -> &PublicKey {
        self.wallet.public_key()
    }

    pub fn ledger(&self) -> &Ledger<S, V> {
        &self.ledger
    }

    pub fn chain(&self) -> &[Block] {
        self.ledger.chain()
    }

    pub fn tip(&self) -> &Block {
        self.ledger.tip()
    }

    pub fn pool(&self) -> &TransactionPool {
        &self.pool
    }

    pub fn malicious(&self) -> &MaliciousRecord {
        self.coordinator.malicious()
    }

    pub fn current_round(&self) -> u64 {
        self.bids.current_round()
    }

    pub fn bids_for_round(&self, round: u64) -> Vec<BidPacket> {
        self.bids.bids_for_round(round)
    }

    pub fn target(&self, round: u64) -> Option<&RoundTarget> {
        self.targets.get(&round)
    }

    pub fn peers(&self) -> &BTreeSet<PublicKey> {
        &self.peers
    }

    pub fn register_peer(&mut self, peer: PublicKey) {
        if &peer != self.wallet.public_key() {
            self.peers.insert(peer);
        }
    }

    fn me(&self) -> PublicKey {
        self.wallet.public_key().clone()
    }

    /// Non-blacklisted known peers plus the local node.
    fn active_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|pk| !self.coordinator.is_blacklisted(pk))
            .count()
            + 1
    }

    fn metric(&self, f: impl FnOnce(&ConsensusMetrics)) {
        if let Some(m) = &self.metrics {
            f(m);
        }
    }

    // ------------------------------------------------------------------
    // Local entry points
    // ------------------------------------------------------------------

    /// Messages sent to a freshly connected peer.
    pub fn hello(&self) -> Vec<Message> {
        vec![
            Message::Chain(ChainAnnouncement::new(&self.wallet, self.ledger.chain().to_vec())),
            Message::Round(RoundAnnouncement::new(&self.wallet, self.bids.current_round())),
        ]
    }

    /// Signs `payload` as a new transaction, pools it and returns it with
    /// the broadcast to perform.
    pub fn submit_transaction(
        &mut self,
        payload: impl Into<String>,
        now_ms: u64,
    ) -> Result<(Transaction, Vec<Outbound>), ConsensusError> {
        let tx = Transaction::new(&self.wallet, payload, now_ms);
        self.pool.add(tx.clone())?;
        info!(id = %tx.id, "transaction submitted");
        let out = vec![Outbound::Broadcast(Message::Transaction(tx.clone()))];
        Ok((tx, out))
    }

    /// Advances the round scheduler and runs the phases that are due.
    pub fn tick(&mut self, now_ms: u64) -> Vec<Outbound> {
        self.expire_buffered(now_ms);
        let (state, actions) = self.scheduler.step(self.schedule, now_ms);
        self.schedule = state;

        let mut out = Vec::new();
        for action in actions {
            out.extend(match action {
                PhaseAction::StartRound { round } => self.start_round(round, now_ms),
                PhaseAction::CloseBidding { round } => self.close_bidding(round),
                PhaseAction::SyncTransactions { round } => self.sync_transactions(round),
                PhaseAction::Propose { round } => self.propose(round, now_ms),
            });
        }
        out
    }

    /// Absolute time at which [`Self::tick`] has work to do.
    pub fn next_wakeup(&self, now_ms: u64) -> u64 {
        self.scheduler.next_wakeup(self.schedule, now_ms)
    }

    pub fn run_deferred(&mut self, task: Deferred, now_ms: u64) -> Vec<Outbound> {
        match task {
            Deferred::BroadcastProposal { index } => self.broadcast_own_proposal(index, now_ms),
        }
    }

    // ------------------------------------------------------------------
    // Round phases
    // ------------------------------------------------------------------

    fn start_round(&mut self, round: u64, now_ms: u64) -> Vec<Outbound> {
        self.bids.start_round(round, now_ms);
        self.bids.clear_before(round.saturating_sub(1));
        let keep_from = round.saturating_sub(RETAINED_ROUNDS);
        self.coordinator.prune_rounds(keep_from);
        self.targets = self.targets.split_off(&keep_from);
        self.own_proposal = None;
        self.metric(|m| m.rounds_started.inc());
        info!(round, tip = self.ledger.tip().index, "round started");

        let mut out = Vec::new();
        if !self.config.strict_rounds {
            out.push(Outbound::Broadcast(Message::Round(RoundAnnouncement::new(
                &self.wallet,
                round,
            ))));
        }
        if self.config.mode == ConsensusMode::Bid {
            let bid = self.bids.generate_bid(&self.wallet, now_ms, &mut self.rng);
            debug!(round, bid = %bid.bid_hash.short(), "bid generated");
            out.push(Outbound::Broadcast(Message::Bid(bid)));
        }
        out
    }

    fn close_bidding(&mut self, round: u64) -> Vec<Outbound> {
        info!(round, bids = self.bids.bid_count(round), "bidding closed");
        Vec::new()
    }

    /// The round's deterministic transaction set.
    fn round_set(&self, round: u64) -> Vec<Transaction> {
        self.proposer.round_transactions(
            &self.pool,
            self.scheduler.round_start(round),
            self.config.tx_collection_ms,
            self.sync.adopted_ids(round),
        )
    }

    fn sync_transactions(&mut self, round: u64) -> Vec<Outbound> {
        let root = merkle_root(&self.round_set(round));
        let me = self.me();
        self.sync.begin_round(round, &me, root);
        debug!(round, root = %root.short(), "merkle root published");

        let mut out = vec![Outbound::Broadcast(Message::MerkleRoot(MerkleRootMsg::new(
            &self.wallet,
            round,
            root,
        )))];
        out.extend(self.request_missing_set(round));
        out
    }

    /// Asks a majority holder for its set if the local pool diverges.
    fn request_missing_set(&mut self, round: u64) -> Vec<Outbound> {
        if self.sync.round() != round || !self.sync.needs_repair() {
            return Vec::new();
        }
        let me = self.me();
        let (Some(root), Some(responder)) = (self.sync.majority_root(), self.sync.responder(&me)) else {
            return Vec::new();
        };
        self.sync.mark_requested();
        info!(round, majority = %root.short(), responder = %responder.short(), "transaction pool diverges, requesting set");
        vec![Outbound::Broadcast(Message::TransactionSetRequest(TxSetRequest::new(
            &self.wallet,
            round,
            root,
            responder,
        )))]
    }

    /// Re-publishes the local root after a target mismatch.
    fn resynchronize(&mut self, round: u64) -> Vec<Outbound> {
        if self.sync.round() != round {
            return Vec::new();
        }
        self.sync.reset_request();
        let mut out = Vec::new();
        if let Some(root) = self.sync.local_root() {
            out.push(Outbound::Broadcast(Message::MerkleRoot(MerkleRootMsg::new(
                &self.wallet,
                round,
                root,
            ))));
        }
        out.extend(self.request_missing_set(round));
        out
    }

    fn propose(&mut self, round: u64, now_ms: u64) -> Vec<Outbound> {
        match self.config.mode {
            ConsensusMode::Bid => self.propose_by_bid(round, now_ms),
            ConsensusMode::Luck => self.propose_by_luck(round, now_ms),
        }
    }

    fn propose_by_bid(&mut self, round: u64, now_ms: u64) -> Vec<Outbound> {
        let entries = self.bids.bid_entries(round, self.coordinator.malicious());
        if entries.len() < self.config.min_bids_required {
            let err = ConsensusError::InsufficientQuorum {
                have: entries.len(),
                need: self.config.min_bids_required,
            };
            info!(round, %err, "skipping proposal");
            self.metric(|m| m.rounds_skipped.inc());
            return Vec::new();
        }

        let electorate: BTreeSet<PublicKey> = entries.iter().map(|e| e.public_key.clone()).collect();
        let txs = self.round_set(round);
        let Some(target) = self.proposer.derive_target(round, self.ledger.tip(), txs, entries) else {
            return Vec::new();
        };
        info!(
            round,
            index = target.index(),
            target = %target.hash().0.short(),
            proposer = %target.proposer.short(),
            txs = target.candidate.transactions.len(),
            "round target derived"
        );
        self.targets.insert(round, target.clone());

        let mut out = Vec::new();
        let event = self.coordinator.open_block_round(round, electorate.clone());
        out.extend(self.apply_block_event(event, now_ms));

        let me = self.me();
        if electorate.contains(&me) {
            match self.coordinator.record_block_vote(round, me.clone(), target.hash()) {
                Ok(event) => out.extend(self.apply_block_event(event, now_ms)),
                Err(e) => debug!(round, error = %e, "own block vote not counted"),
            }
            out.push(Outbound::Broadcast(Message::RequestBlockVote(BlockVote::new(
                &self.wallet,
                round,
                target.hash(),
            ))));
        }

        if target.proposer == me {
            let block = self.proposer.seal(&target, self.ledger.tip(), &self.wallet, now_ms);
            self.coordinator.note_proposal(round, me, block.hash);
            match self.ledger.add_block(block.clone(), self.coordinator.malicious(), &target) {
                Ok(()) => {
                    info!(round, index = block.index, "proposed block as elected proposer");
                    self.after_block_accepted(&block, Some(round), now_ms);
                    out.push(Outbound::Broadcast(Message::Block(block)));
                }
                Err(e) => warn!(round, error = %e, "own proposal rejected"),
            }
        }

        let index = target.index();
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.buffered)
            .into_iter()
            .partition(|(b, _)| b.index == index);
        self.buffered = waiting;
        for (block, _) in ready {
            match self.process_block(round, block, now_ms) {
                Ok(more) => out.extend(more),
                Err(e) => debug!(round, error = %e, "buffered block rejected"),
            }
        }
        out
    }

    fn propose_by_luck(&mut self, round: u64, now_ms: u64) -> Vec<Outbound> {
        let tip = self.ledger.tip().clone();
        let index = tip.index + 1;
        let proof = LuckProof::generate(&self.wallet, index, &mut self.rng);
        let luck = proof.luck();

        // The proposer's own entry keeps competing proposals for the same
        // index apart and ties the proof seed to the block hash.
        let entry = BidEntry {
            public_key: self.me(),
            bid_hash: proof.seed,
        };
        let mut block = Block::candidate(index, tip.hash, self.round_set(round), vec![entry])
            .seal(&self.wallet, now_ms.max(tip.timestamp + 1));
        block.luck_proof = Some(proof);
        self.own_proposal = Some(block);

        let delay_ms = broadcast_delay(luck, self.config.luck_slots, self.config.luck_slot_ms, &mut self.rng);
        info!(round, index, luck, delay_ms, "luck proposal scheduled");
        vec![Outbound::Schedule {
            delay_ms,
            task: Deferred::BroadcastProposal { index },
        }]
    }

    fn broadcast_own_proposal(&mut self, index: u64, now_ms: u64) -> Vec<Outbound> {
        let Some(block) = self.own_proposal.take() else {
            return Vec::new();
        };
        if block.index != index {
            return Vec::new();
        }
        let verdict = evaluate_proposal(&block, self.ledger.tip(), self.coordinator.malicious());
        let applied = match verdict {
            Ok(LuckVerdict::Append) => self.ledger.append(block.clone()),
            Ok(LuckVerdict::ReplaceTip) => self.ledger.replace_tip(block.clone()),
            Ok(LuckVerdict::Outdated) => {
                debug!(index, "own luck proposal outdated, not broadcasting");
                return Vec::new();
            }
            Err(e) => Err(e),
        };
        match applied {
            Ok(()) => {
                let round = self.bids.current_round();
                self.after_block_accepted(&block, Some(round), now_ms);
                vec![Outbound::Broadcast(Message::Proposal(block))]
            }
            Err(e) => {
                warn!(index, error = %e, "own luck proposal rejected");
                Vec::new()
            }
        }
    }

    // ------------------------------------------------------------------
    // Block admission and convergence
    // ------------------------------------------------------------------

    fn round_for_index(&self, index: u64) -> Option<u64> {
        self.targets
            .iter()
            .rev()
            .find(|(_, t)| t.index() == index)
            .map(|(round, _)| *round)
    }

    /// Admits `block` against the target of `round`.
    fn process_block(&mut self, round: u64, block: Block, now_ms: u64) -> Result<Vec<Outbound>, ConsensusError> {
        let Some(target) = self.targets.get(&round).cloned() else {
            return Err(ConsensusError::StaleOrFutureRound {
                expected: self.bids.current_round(),
                got: round,
            });
        };
        match self.ledger.add_block(block.clone(), self.coordinator.malicious(), &target) {
            Ok(()) => {
                self.after_block_accepted(&block, Some(round), now_ms);
                Ok(Vec::new())
            }
            Err(ConsensusError::ConsensusMismatch(reason)) => {
                warn!(round, index = block.index, %reason, "block does not match local target, resynchronizing");
                self.metric(|m| m.blocks_rejected.inc());
                Ok(self.resynchronize(round))
            }
            Err(e) => {
                self.metric(|m| m.blocks_rejected.inc());
                Err(e)
            }
        }
    }

    fn after_block_accepted(&mut self, block: &Block, round: Option<u64>, now_ms: u64) {
        let me = self.me();
        self.pool
            .remove_confirmed(&block.transactions, &block.proposer, &me, now_ms);

        self.blocks_since_cleanup += 1;
        if self.blocks_since_cleanup >= self.config.pending_cleanup_every_blocks.max(1) {
            self.blocks_since_cleanup = 0;
            let expired = self.pool.expire_pending(now_ms, self.config.pending_max_age_ms());
            if expired > 0 {
                debug!(expired, "expired pending transactions");
            }
        }

        let tip = self.ledger.tip().index;
        self.buffered.retain(|(b, _)| b.index > tip);
        self.seen_blocks.retain(|_, b| b.index >= tip);

        let latency = round.map(|r| now_ms.saturating_sub(self.scheduler.round_start(r)) as f64 / 1_000.0);
        self.metric(|m| {
            m.blocks_accepted.inc();
            m.chain_height.set(tip as i64);
            if let Some(latency) = latency {
                m.block_latency_seconds.observe(latency);
            }
        });
    }

    fn expire_buffered(&mut self, now_ms: u64) {
        let wait = self.config.target_wait_ms;
        self.buffered.retain(|(block, at)| {
            let keep = now_ms.saturating_sub(*at) <= wait;
            if !keep {
                debug!(index = block.index, hash = %block.hash.0.short(), "no target in time, block dropped");
            }
            keep
        });
    }

    /// Moves the local chain onto a decided block hash.
    fn converge_on_block(&mut self, round: u64, hash: BlockHash, now_ms: u64) -> Vec<Outbound> {
        if self.ledger.contains(&hash) {
            return Vec::new();
        }
        if let Some(block) = self.seen_blocks.get(&hash).cloned() {
            let tip = self.ledger.tip();
            let applied = if block.index == tip.index + 1 {
                self.ledger.append(block.clone())
            } else if block.index == tip.index {
                self.ledger.replace_tip(block.clone())
            } else {
                Err(ConsensusError::ConsensusMismatch(format!(
                    "majority block {} not adjacent to tip {}",
                    block.index, tip.index
                )))
            };
            match applied {
                Ok(()) => {
                    info!(round, index = block.index, hash = %hash.0.short(), "converged on majority block");
                    self.after_block_accepted(&block, Some(round), now_ms);
                    return Vec::new();
                }
                Err(e) => warn!(round, error = %e, "cannot apply majority block locally"),
            }
        }
        info!(round, hash = %hash.0.short(), "majority block unknown locally, requesting chains");
        self.request_chains(true, now_ms)
    }

    fn apply_block_event(&mut self, event: BlockVoteEvent, now_ms: u64) -> Vec<Outbound> {
        match event {
            BlockVoteEvent::Pending => Vec::new(),
            BlockVoteEvent::Struck(strikes) => self.after_strikes(strikes),
            BlockVoteEvent::Decided(decision) => {
                self.metric(|m| m.majority_decisions.inc());
                let mut out = self.after_strikes(decision.strikes);
                out.extend(self.converge_on_block(decision.round, decision.hash, now_ms));
                out
            }
        }
    }

    /// Persists and announces the malicious record after strikes.
    fn after_strikes(&mut self, strikes: Strikes) -> Vec<Outbound> {
        if strikes.is_empty() {
            return Vec::new();
        }
        for pk in &strikes.blacklisted {
            warn!(peer = %pk.short(), "peer blacklisted by majority decision");
        }
        let snapshot = self.coordinator.malicious().snapshot();
        if let Err(e) = self.ledger.store_mut().save_malicious(&snapshot) {
            warn!(error = %e, "failed to persist malicious record");
        }
        let blacklisted = snapshot.blacklisted.len() as i64;
        let struck = strikes.struck.len() as u64;
        self.metric(|m| {
            m.malicious_strikes.inc_by(struck);
            m.blacklisted_peers.set(blacklisted);
        });
        vec![Outbound::Broadcast(Message::MaliciousData(MaliciousData::new(
            &self.wallet,
            snapshot,
        )))]
    }

    // ------------------------------------------------------------------
    // Chain reconciliation
    // ------------------------------------------------------------------

    /// The local chain (or suffix) comparable under `key`, with its hash.
    fn own_chain_for(&self, key: ChainKey) -> Option<(Hash256, Vec<Block>)> {
        let blocks = match key {
            ChainKey::Full { len } if self.ledger.len() as u64 == len => self.ledger.chain(),
            ChainKey::Suffix { tip } if self.ledger.tip().index == tip => {
                self.ledger.suffix(self.config.suffix_len)
            }
            _ => return None,
        };
        Some((simplified_chain_hash(blocks), blocks.to_vec()))
    }

    fn cast_own_chain_vote(&mut self, key: ChainKey, now_ms: u64) -> Vec<Outbound> {
        let me = self.me();
        if self.coordinator.has_chain_vote(key, &me) {
            return Vec::new();
        }
        let Some((hash, blocks)) = self.own_chain_for(key) else {
            return Vec::new();
        };
        let active = self.active_count();
        match self.coordinator.record_chain(key, me, hash, blocks, active) {
            Ok(event) => self.apply_chain_event(event, now_ms),
            Err(e) => {
                debug!(?key, error = %e, "own chain vote not counted");
                Vec::new()
            }
        }
    }

    fn request_chains(&mut self, suffix: bool, now_ms: u64) -> Vec<Outbound> {
        let mut out = vec![Outbound::Broadcast(Message::ChainVoteRequest(ChainRequest::new(
            &self.wallet,
            suffix,
            now_ms,
        )))];
        let key = if suffix {
            ChainKey::Suffix { tip: self.ledger.tip().index }
        } else {
            ChainKey::Full { len: self.ledger.len() as u64 }
        };
        out.extend(self.cast_own_chain_vote(key, now_ms));
        out
    }

    fn apply_chain_event(&mut self, event: ChainVoteEvent, now_ms: u64) -> Vec<Outbound> {
        match event {
            ChainVoteEvent::Pending => Vec::new(),
            ChainVoteEvent::Struck(strikes) => self.after_strikes(strikes),
            ChainVoteEvent::Decided(decision) => {
                self.metric(|m| m.majority_decisions.inc());
                let strikes = decision.strikes.clone();
                let mut out = self.after_strikes(strikes);
                out.extend(self.adopt_chain(decision, now_ms));
                out
            }
        }
    }

    fn adopt_chain(&mut self, decision: ChainDecision, now_ms: u64) -> Vec<Outbound> {
        if self.own_chain_for(decision.key).map(|(h, _)| h) == Some(decision.hash) {
            debug!(key = ?decision.key, "local chain already matches the majority");
            return Vec::new();
        }
        let starts_at_genesis = decision.blocks.first().is_some_and(|b| b.index == 0);
        let blocks = decision.blocks;
        let confirmed: Vec<(Vec<Transaction>, PublicKey)> = blocks
            .iter()
            .map(|b| (b.transactions.clone(), b.proposer.clone()))
            .collect();

        let applied = match decision.key {
            ChainKey::Full { .. } => self.ledger.replace_chain(blocks),
            ChainKey::Suffix { .. } if starts_at_genesis => self.ledger.replace_chain(blocks),
            ChainKey::Suffix { .. } => self.ledger.replace_suffix(blocks),
        };
        match applied {
            Ok(()) => {
                let me = self.me();
                for (txs, proposer) in &confirmed {
                    self.pool.remove_confirmed(txs, proposer, &me, now_ms);
                }
                let tip = self.ledger.tip().index;
                self.buffered.retain(|(b, _)| b.index > tip);
                self.coordinator.prune_chains(tip.saturating_sub(self.config.suffix_len as u64));
                self.metric(|m| m.chain_height.set(tip as i64));
                info!(key = ?decision.key, tip, "adopted majority chain");
                Vec::new()
            }
            Err(e) if matches!(decision.key, ChainKey::Suffix { .. }) => {
                info!(error = %e, "majority suffix does not attach, requesting full chains");
                self.request_chains(false, now_ms)
            }
            Err(e) => {
                warn!(error = %e, "majority chain rejected");
                Vec::new()
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound messages
    // ------------------------------------------------------------------

    /// Checks a signed payload and learns its signer as a peer.
    fn admit<T: Signed>(&mut self, payload: &T, what: &'static str) -> Result<(), ConsensusError> {
        if !payload.verify() {
            return Err(ConsensusError::SignatureInvalid(what));
        }
        let signer = payload.signer();
        if self.coordinator.is_blacklisted(signer) {
            return Err(ConsensusError::Blacklisted(signer.clone()));
        }
        self.register_peer(signer.clone());
        Ok(())
    }

    /// Handles one inbound message.
    ///
    /// Errors mean the message was dropped; none of them is fatal.
    pub fn handle_message(&mut self, msg: Message, now_ms: u64) -> Result<Vec<Outbound>, ConsensusError> {
        let kind = msg.kind();
        self.metric(|m| m.messages_received.with_label_values(&[kind]).inc());
        if !msg.verify() {
            return Err(ConsensusError::SignatureInvalid(kind));
        }
        if !self.processed.first_delivery(msg.dedup_key(), now_ms) {
            return Err(ConsensusError::DuplicateDelivery);
        }

        match msg {
            Message::Transaction(tx) => self.on_transaction(tx),
            Message::Bid(bid) => self.on_bid(bid, now_ms),
            Message::Round(announcement) => self.on_round(announcement),
            Message::Block(block) => self.on_block(block, now_ms),
            Message::Proposal(block) => self.on_luck_proposal(block, now_ms),
            Message::RequestBlockVote(vote) => self.on_block_vote(vote, true, now_ms),
            Message::BlockVoteResponse(vote) => self.on_block_vote(vote, false, now_ms),
            Message::Chain(chain) | Message::ChainVoteResponse(chain) => self.on_chain(chain, false, now_ms),
            Message::LastBlocks(chain) => self.on_chain(chain, true, now_ms),
            Message::ChainVoteRequest(request) => self.on_chain_request(request),
            Message::MaliciousData(data) => self.on_malicious_data(data),
            Message::MerkleRoot(root) => self.on_merkle_root(root),
            Message::TransactionSetRequest(request) => self.on_tx_set_request(request),
            Message::TransactionSet(set) => self.on_tx_set(set, now_ms),
        }
    }

    fn on_transaction(&mut self, tx: Transaction) -> Result<Vec<Outbound>, ConsensusError> {
        if self.pool.add(tx.clone())? {
            debug!(id = %tx.id, "transaction pooled");
            return Ok(vec![Outbound::Broadcast(Message::Transaction(tx))]);
        }
        Ok(Vec::new())
    }

    fn on_bid(&mut self, bid: BidPacket, now_ms: u64) -> Result<Vec<Outbound>, ConsensusError> {
        let bidder = bid.public_key.clone();
        let round = bid.round;
        match self.bids.receive_bid(bid, self.coordinator.malicious(), now_ms) {
            Ok(()) => {
                self.register_peer(bidder.clone());
                self.metric(|m| m.bids_accepted.inc());
                debug!(round, bidder = %bidder.short(), "bid accepted");
                Ok(Vec::new())
            }
            Err(e) => {
                self.metric(|m| m.bids_rejected.inc());
                Err(e)
            }
        }
    }

    fn on_round(&mut self, announcement: RoundAnnouncement) -> Result<Vec<Outbound>, ConsensusError> {
        if self.config.strict_rounds {
            return Ok(Vec::new());
        }
        self.admit(&announcement, "round announcement")?;
        if self.bids.handle_round(announcement.round)? {
            info!(
                round = announcement.round,
                peer = %announcement.public_key.short(),
                "peer announced the next round"
            );
        }
        Ok(Vec::new())
    }

    fn on_block(&mut self, block: Block, now_ms: u64) -> Result<Vec<Outbound>, ConsensusError> {
        if !block.verify() {
            return Err(ConsensusError::SignatureInvalid("block"));
        }
        if self.coordinator.is_blacklisted(&block.proposer) {
            return Err(ConsensusError::Blacklisted(block.proposer));
        }
        if self.ledger.contains(&block.hash) {
            return Err(ConsensusError::DuplicateDelivery);
        }
        self.register_peer(block.proposer.clone());
        self.seen_blocks.insert(block.hash, block.clone());

        let Some(round) = self.round_for_index(block.index) else {
            let tip = self.ledger.tip().index;
            if block.index > tip {
                debug!(index = block.index, "block ahead of local target, buffered");
                self.buffered.push((block, now_ms));
                return Ok(Vec::new());
            }
            return Err(ConsensusError::StaleOrFutureRound {
                expected: tip + 1,
                got: block.index,
            });
        };

        let event = self.coordinator.note_proposal(round, block.proposer.clone(), block.hash);
        let mut out = self.apply_block_event(event, now_ms);
        if self.coordinator.decided_block(round) == Some(block.hash) {
            // The majority already settled on this block.
            out.extend(self.converge_on_block(round, block.hash, now_ms));
            return Ok(out);
        }
        out.extend(self.process_block(round, block, now_ms)?);
        Ok(out)
    }

    fn on_luck_proposal(&mut self, block: Block, now_ms: u64) -> Result<Vec<Outbound>, ConsensusError> {
        if self.config.mode != ConsensusMode::Luck {
            return Err(ConsensusError::MalformedInput("luck proposal outside luck mode".into()));
        }
        if !block.verify() {
            return Err(ConsensusError::SignatureInvalid("proposal"));
        }
        if self.ledger.contains(&block.hash) {
            return Err(ConsensusError::DuplicateDelivery);
        }
        self.register_peer(block.proposer.clone());

        let tip_index = self.ledger.tip().index;
        match evaluate_proposal(&block, self.ledger.tip(), self.coordinator.malicious())? {
            LuckVerdict::Append => self.ledger.append(block.clone())?,
            LuckVerdict::ReplaceTip => self.ledger.replace_tip(block.clone())?,
            LuckVerdict::Outdated => {
                return Err(ConsensusError::StaleOrFutureRound {
                    expected: tip_index + 1,
                    got: block.index,
                });
            }
        }
        info!(index = block.index, proposer = %block.proposer.short(), "luck proposal accepted");
        let round = self.bids.current_round();
        self.after_block_accepted(&block, Some(round), now_ms);
        Ok(Vec::new())
    }

    fn on_block_vote(&mut self, vote: BlockVote, is_request: bool, now_ms: u64) -> Result<Vec<Outbound>, ConsensusError> {
        self.admit(&vote, "block vote")?;
        let event = self
            .coordinator
            .record_block_vote(vote.round, vote.public_key.clone(), vote.hash)?;
        self.metric(|m| m.votes_recorded.inc());
        let mut out = self.apply_block_event(event, now_ms);

        if is_request {
            let me = self.me();
            if let Some(own) = self.coordinator.block_vote_of(vote.round, &me) {
                out.push(Outbound::Reply(Message::BlockVoteResponse(BlockVote::new(
                    &self.wallet,
                    vote.round,
                    own,
                ))));
            }
        }
        Ok(out)
    }

    fn on_chain_request(&mut self, request: ChainRequest) -> Result<Vec<Outbound>, ConsensusError> {
        self.admit(&request, "chain vote request")?;
        let reply = if request.suffix {
            let suffix = self.ledger.suffix(self.config.suffix_len).to_vec();
            Message::LastBlocks(ChainAnnouncement::new(&self.wallet, suffix))
        } else {
            Message::ChainVoteResponse(ChainAnnouncement::new(&self.wallet, self.ledger.chain().to_vec()))
        };
        Ok(vec![Outbound::Reply(reply)])
    }

    fn on_chain(&mut self, chain: ChainAnnouncement, suffix: bool, now_ms: u64) -> Result<Vec<Outbound>, ConsensusError> {
        self.admit(&chain, "chain")?;
        let Some(candidate_tip) = chain.blocks.last() else {
            return Err(ConsensusError::MalformedInput("empty chain".into()));
        };
        if !self.fork_choice.qualifies(self.ledger.tip(), candidate_tip) {
            debug!(peer = %chain.public_key.short(), tip = candidate_tip.index, "shorter chain ignored");
            return Ok(Vec::new());
        }

        let key = if suffix {
            let validator = self.ledger.validator();
            if let Some(first) = chain.blocks.first() {
                if first.index > 0 && !first.verify() {
                    return Err(ConsensusError::SignatureInvalid("chain suffix block"));
                }
            }
            for pair in chain.blocks.windows(2) {
                validator.validate(&pair[1], &pair[0])?;
            }
            ChainKey::Suffix { tip: candidate_tip.index }
        } else {
            validate_chain(self.ledger.validator(), &chain.blocks)?;
            ChainKey::Full { len: chain.blocks.len() as u64 }
        };

        let hash = chain.chain_hash();
        let mut out = self.cast_own_chain_vote(key, now_ms);
        let active = self.active_count();
        let event = self
            .coordinator
            .record_chain(key, chain.public_key, hash, chain.blocks, active)?;
        self.metric(|m| m.votes_recorded.inc());
        out.extend(self.apply_chain_event(event, now_ms));
        Ok(out)
    }

    fn on_malicious_data(&mut self, data: MaliciousData) -> Result<Vec<Outbound>, ConsensusError> {
        self.admit(&data, "malicious data")?;
        let active = self.active_count();
        if let Some(snapshot) = self
            .coordinator
            .record_malicious(data.public_key, data.snapshot, active)?
        {
            self.ledger.store_mut().save_malicious(&snapshot)?;
            let blacklisted = snapshot.blacklisted.len() as i64;
            self.metric(|m| m.blacklisted_peers.set(blacklisted));
        }
        Ok(Vec::new())
    }

    fn on_merkle_root(&mut self, root: MerkleRootMsg) -> Result<Vec<Outbound>, ConsensusError> {
        self.admit(&root, "merkle root")?;
        if !self.sync.record_root(root.round, root.public_key, root.root) {
            return Ok(Vec::new());
        }
        Ok(self.request_missing_set(root.round))
    }

    fn on_tx_set_request(&mut self, request: TxSetRequest) -> Result<Vec<Outbound>, ConsensusError> {
        self.admit(&request, "transaction set request")?;
        if &request.responder != self.wallet.public_key() {
            return Ok(Vec::new());
        }
        let set = self.round_set(request.round);
        if merkle_root(&set) != request.root {
            debug!(round = request.round, "requested root differs from local set, not answering");
            return Ok(Vec::new());
        }
        debug!(round = request.round, to = %request.public_key.short(), txs = set.len(), "sending transaction set");
        Ok(vec![Outbound::Reply(Message::TransactionSet(TxSet::new(
            &self.wallet,
            request.round,
            set,
        )))])
    }

    fn on_tx_set(&mut self, set: TxSet, now_ms: u64) -> Result<Vec<Outbound>, ConsensusError> {
        self.admit(&set, "transaction set")?;
        let Some(outcome) = self.sync.apply_set(set.round, &set.transactions, &mut self.pool) else {
            return Ok(Vec::new());
        };
        if !outcome.converged {
            return Ok(Vec::new());
        }
        self.metric(|m| m.pool_repairs.inc());
        Ok(self.rederive_target(set.round, now_ms))
    }

    /// Recomputes a round target after a late pool repair and retries a
    /// matching block that was already received.
    fn rederive_target(&mut self, round: u64, now_ms: u64) -> Vec<Outbound> {
        let Some(old) = self.targets.get(&round) else {
            return Vec::new();
        };
        if self.ledger.tip().index >= old.index() || self.ledger.tip().hash != old.candidate.previous_hash {
            return Vec::new();
        }
        let old_hash = old.hash();
        let entries = self.bids.bid_entries(round, self.coordinator.malicious());
        let txs = self.round_set(round);
        let Some(target) = self.proposer.derive_target(round, self.ledger.tip(), txs, entries) else {
            return Vec::new();
        };
        if target.hash() == old_hash {
            return Vec::new();
        }
        info!(round, target = %target.hash().0.short(), "round target re-derived after pool repair");
        let hash = target.hash();
        self.targets.insert(round, target);

        match self.seen_blocks.get(&hash).cloned() {
            Some(block) => self.process_block(round, block, now_ms).unwrap_or_else(|e| {
                debug!(round, error = %e, "block still rejected after repair");
                Vec::new()
            }),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::LongestChainForkChoice;
    use crate::storage::InMemoryLedgerStore;
    use crate::types::Signature;
    use crate::validation::IntegrityValidity;

    type TestNode = ConsensusNode<InMemoryLedgerStore, IntegrityValidity, LongestChainForkChoice>;

    const T0: u64 = 10_000;

    fn test_config() -> ConsensusConfig {
        ConsensusConfig {
            round_interval_ms: 1_000,
            phase1_duration_ms: 200,
            tx_collection_ms: 600,
            phase3_start_ms: 800,
            target_wait_ms: 300,
            ..ConsensusConfig::default()
        }
    }

    fn node(seed: u64, cfg: ConsensusConfig) -> TestNode {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut store = InMemoryLedgerStore::new();
        let wallet = load_or_create_wallet(&mut store, &mut rng).expect("wallet");
        let ledger = Ledger::open(store, IntegrityValidity).expect("ledger");
        ConsensusNode::new(cfg, wallet, ledger, LongestChainForkChoice)
            .expect("node")
            .with_rng_seed(seed)
    }

    fn broadcasts(out: &[Outbound]) -> Vec<&Message> {
        out.iter()
            .filter_map(|o| match o {
                Outbound::Broadcast(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn wallet_is_created_once_and_reloaded() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut store = InMemoryLedgerStore::new();
        let first = load_or_create_wallet(&mut store, &mut rng).expect("create");
        let again = load_or_create_wallet(&mut store, &mut rng).expect("reload");
        assert_eq!(first.public_key(), again.public_key());
    }

    #[test]
    fn round_start_broadcasts_a_bid() {
        let mut n = node(1, test_config());
        let out = n.tick(T0);
        let msgs = broadcasts(&out);
        assert!(matches!(msgs.as_slice(), [Message::Bid(b)] if b.round == 10 && b.verify()));
        assert_eq!(n.current_round(), 10);
        assert_eq!(n.bids_for_round(10).len(), 1);
    }

    #[test]
    fn lone_node_does_not_propose() {
        let mut n = node(2, test_config());
        n.tick(T0);
        n.tick(T0 + 600);
        let out = n.tick(T0 + 800);
        assert!(out.is_empty());
        assert!(n.target(10).is_none());
        assert_eq!(n.tip().index, 0);
    }

    #[test]
    fn duplicate_messages_are_dropped() {
        let mut a = node(3, test_config());
        let mut b = node(4, test_config());
        a.tick(T0);
        let out = b.tick(T0);
        let bid = broadcasts(&out)[0].clone();

        a.handle_message(bid.clone(), T0 + 1).expect("first delivery");
        assert!(matches!(
            a.handle_message(bid, T0 + 2),
            Err(ConsensusError::DuplicateDelivery)
        ));
        assert_eq!(a.bids_for_round(10).len(), 2);
        assert!(a.peers().contains(b.public_key()));
    }

    #[test]
    fn forged_copy_does_not_shadow_the_genuine_block() {
        let mut a = node(16, test_config());
        let b = node(17, test_config());
        let block = Block::candidate(1, a.tip().hash, Vec::new(), Vec::new()).seal(&b.wallet, T0 + 900);
        let mut forged = block.clone();
        forged.signature = Signature(vec![0x30; 70]);

        assert!(matches!(
            a.handle_message(Message::Block(forged), T0 + 900),
            Err(ConsensusError::SignatureInvalid("BLOCK"))
        ));
        assert!(
            !matches!(
                a.handle_message(Message::Block(block.clone()), T0 + 901),
                Err(ConsensusError::DuplicateDelivery)
            ),
            "genuine block shadowed by its forgery"
        );
        assert!(matches!(
            a.handle_message(Message::Block(block), T0 + 902),
            Err(ConsensusError::DuplicateDelivery)
        ));
    }

    #[test]
    fn submitted_transactions_are_pooled_and_relayed_once() {
        let mut a = node(5, test_config());
        let mut b = node(6, test_config());
        let (tx, out) = a.submit_transaction("reading=42", T0).expect("submit");
        assert!(a.pool().contains(&tx.id));

        let relay = b.handle_message(Message::Transaction(tx.clone()), T0).expect("pooled");
        assert_eq!(broadcasts(&relay).len(), 1);
        assert!(b.pool().contains(&tx.id));
        assert_eq!(broadcasts(&out).len(), 1);
    }

    #[test]
    fn hello_carries_chain_and_round() {
        let n = node(7, test_config());
        let hello = n.hello();
        assert!(matches!(&hello[0], Message::Chain(c) if c.blocks == vec![Block::genesis()]));
        assert!(matches!(&hello[1], Message::Round(_)));
    }

    #[test]
    fn strict_rounds_ignore_announcements() {
        let mut a = node(8, test_config());
        let b = node(9, test_config());
        a.tick(T0);
        let far = RoundAnnouncement::new(&b.wallet, 99);
        a.handle_message(Message::Round(far), T0).expect("ignored");
        assert_eq!(a.current_round(), 10);

        let mut loose = node(10, ConsensusConfig { strict_rounds: false, ..test_config() });
        loose.tick(T0);
        let far = RoundAnnouncement::new(&b.wallet, 99);
        assert!(matches!(
            loose.handle_message(Message::Round(far), T0),
            Err(ConsensusError::StaleOrFutureRound { expected: 11, got: 99 })
        ));
        let next = RoundAnnouncement::new(&b.wallet, 11);
        loose.handle_message(Message::Round(next), T0).expect("tolerated");
        assert_eq!(loose.current_round(), 10);
    }

    #[test]
    fn peer_driven_node_keeps_proposing_after_wild_announcements() {
        let cfg = ConsensusConfig { strict_rounds: false, ..test_config() };
        let mut a = node(13, cfg.clone());
        let mut b = node(14, cfg.clone());
        let mut c = node(15, cfg);
        let bids: Vec<Message> = [&mut a, &mut b, &mut c]
            .into_iter()
            .flat_map(|n| broadcasts(&n.tick(T0)).into_iter().cloned().collect::<Vec<_>>())
            .filter(|m| matches!(m, Message::Bid(_)))
            .collect();

        for round in [u64::MAX, 1_000, 11] {
            let _ = a.handle_message(Message::Round(RoundAnnouncement::new(&b.wallet, round)), T0 + 5);
        }
        assert_eq!(a.current_round(), 10);
        for bid in bids {
            match a.handle_message(bid, T0 + 10) {
                Ok(_) | Err(ConsensusError::DuplicateDelivery) => {}
                Err(e) => panic!("honest bid refused: {e}"),
            }
        }
        assert_eq!(a.bids_for_round(10).len(), 3);
        assert!(a.bids_for_round(1_000).is_empty());

        a.tick(T0 + 600);
        a.tick(T0 + 800);
        assert!(a.target(10).is_some());
    }

    #[test]
    fn chain_request_is_answered_with_suffix_or_full_chain() {
        let mut a = node(11, test_config());
        let b = node(12, test_config());
        let out = a
            .handle_message(Message::ChainVoteRequest(ChainRequest::new(&b.wallet, true, T0)), T0)
            .expect("answered");
        assert!(matches!(out.as_slice(), [Outbound::Reply(Message::LastBlocks(_))]));

        let out = a
            .handle_message(Message::ChainVoteRequest(ChainRequest::new(&b.wallet, false, T0)), T0)
            .expect("answered");
        assert!(matches!(out.as_slice(), [Outbound::Reply(Message::ChainVoteResponse(_))]));
    }

    #[test]
    fn luck_mode_schedules_and_broadcasts_own_proposal() {
        let cfg = ConsensusConfig {
            mode: ConsensusMode::Luck,
            luck_slots: 4,
            luck_slot_ms: 10,
            ..test_config()
        };
        let mut n = node(13, cfg);
        assert!(broadcasts(&n.tick(T0)).is_empty());
        n.tick(T0 + 600);
        let out = n.tick(T0 + 800);
        let [Outbound::Schedule { delay_ms, task }] = out.as_slice() else {
            panic!("expected a scheduled broadcast, got {out:?}");
        };
        assert!(*delay_ms < 40);

        let out = n.run_deferred(*task, T0 + 800 + delay_ms);
        assert!(matches!(broadcasts(&out).as_slice(), [Message::Proposal(b)] if b.index == 1));
        assert_eq!(n.tip().index, 1);
        assert!(n.run_deferred(*task, T0 + 900).is_empty());
    }

    #[test]
    fn luck_proposal_rejected_in_bid_mode() {
        let mut n = node(14, test_config());
        let other = node(15, test_config());
        let mut block = Block::candidate(1, Block::genesis().hash, vec![], vec![]).seal(&other.wallet, 5);
        block.luck_proof = Some(LuckProof::from_seed(&other.wallet, 1, Hash256::ZERO));
        assert!(matches!(
            n.handle_message(Message::Proposal(block), T0),
            Err(ConsensusError::MalformedInput(_))
        ));
    }
}
