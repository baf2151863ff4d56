//! Round phase state machine.
//!
//! Rounds are aligned to wall-clock boundaries: round `r` starts at
//! `r * round_interval_ms`. Inside a round the phases follow fixed offsets:
//!
//! ```text
//! 0 ........ phase1 ........ tx_collection ........ phase3 ........ interval
//! | Bidding  | Collecting    | Syncing              | Proposing       |
//! ```
//!
//! [`RoundScheduler::step`] is a pure function over `(state, now)`; the
//! node executes the returned [`PhaseAction`]s and sleeps until
//! [`RoundScheduler::next_wakeup`].

use super::config::ConsensusConfig;

/// Where the local node stands inside the current round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Not participating in this round (fresh start or missed bid window).
    #[default]
    Idle,
    Bidding,
    Collecting,
    Syncing,
    Proposing,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerState {
    pub round: Option<u64>,
    pub phase: Phase,
}

/// Work the node performs on a phase transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseAction {
    StartRound { round: u64 },
    CloseBidding { round: u64 },
    SyncTransactions { round: u64 },
    Propose { round: u64 },
}

#[derive(Clone, Debug)]
pub struct RoundScheduler {
    interval_ms: u64,
    phase1_ms: u64,
    collection_ms: u64,
    phase3_ms: u64,
}

impl RoundScheduler {
    pub fn from_config(cfg: &ConsensusConfig) -> Self {
        Self {
            interval_ms: cfg.round_interval_ms.max(1),
            phase1_ms: cfg.phase1_duration_ms,
            collection_ms: cfg.tx_collection_ms,
            phase3_ms: cfg.phase3_start_ms,
        }
    }

    pub fn round_at(&self, now_ms: u64) -> u64 {
        now_ms / self.interval_ms
    }

    pub fn round_start(&self, round: u64) -> u64 {
        round * self.interval_ms
    }

    /// `interval - (now mod interval)`.
    pub fn delay_to_boundary(&self, now_ms: u64) -> u64 {
        self.interval_ms - now_ms % self.interval_ms
    }

    fn phase_at_offset(&self, offset: u64) -> Phase {
        if offset < self.phase1_ms {
            Phase::Bidding
        } else if offset < self.collection_ms {
            Phase::Collecting
        } else if offset < self.phase3_ms {
            Phase::Syncing
        } else {
            Phase::Proposing
        }
    }

    fn phase_offset(&self, phase: Phase) -> Option<u64> {
        match phase {
            Phase::Idle => None,
            Phase::Bidding => Some(0),
            Phase::Collecting => Some(self.phase1_ms),
            Phase::Syncing => Some(self.collection_ms),
            Phase::Proposing => Some(self.phase3_ms),
        }
    }

    /// Advances `state` to `now`.
    ///
    /// Within a round every phase that was entered since the last step
    /// yields its action, in order, so a late wakeup never skips work. A
    /// node that joins after the bid window stays idle until the next
    /// boundary.
    pub fn step(&self, state: SchedulerState, now_ms: u64) -> (SchedulerState, Vec<PhaseAction>) {
        let round = self.round_at(now_ms);
        let offset = now_ms % self.interval_ms;
        let target = self.phase_at_offset(offset);

        let from = match state.round {
            Some(r) if r == round => state.phase,
            // Clock moved backwards; wait for it to catch up.
            Some(r) if r > round => return (state, Vec::new()),
            Some(_) if offset < self.phase1_ms => {
                let mut actions = vec![PhaseAction::StartRound { round }];
                actions.extend(transitions(Phase::Bidding, target, round));
                return (SchedulerState { round: Some(round), phase: target }, actions);
            }
            None if offset == 0 => {
                return (
                    SchedulerState { round: Some(round), phase: Phase::Bidding },
                    vec![PhaseAction::StartRound { round }],
                );
            }
            _ => {
                return (SchedulerState { round: Some(round), phase: Phase::Idle }, Vec::new());
            }
        };

        if from == Phase::Idle || target <= from {
            return (state, Vec::new());
        }
        let actions = transitions(from, target, round);
        (SchedulerState { round: Some(round), phase: target }, actions)
    }

    /// Absolute time of the next phase change that matters for `state`.
    pub fn next_wakeup(&self, state: SchedulerState, now_ms: u64) -> u64 {
        let round = self.round_at(now_ms);
        let boundary = now_ms + self.delay_to_boundary(now_ms);
        if state.round != Some(round) {
            return boundary;
        }
        let next = match state.phase {
            Phase::Idle | Phase::Proposing => None,
            Phase::Bidding => self.phase_offset(Phase::Collecting),
            Phase::Collecting => self.phase_offset(Phase::Syncing),
            Phase::Syncing => self.phase_offset(Phase::Proposing),
        };
        next.map(|offset| self.round_start(round) + offset)
            .filter(|at| *at > now_ms)
            .unwrap_or(boundary)
    }
}

fn transitions(from: Phase, to: Phase, round: u64) -> Vec<PhaseAction> {
    let mut actions = Vec::new();
    if from < Phase::Collecting && to >= Phase::Collecting {
        actions.push(PhaseAction::CloseBidding { round });
    }
    if from < Phase::Syncing && to >= Phase::Syncing {
        actions.push(PhaseAction::SyncTransactions { round });
    }
    if from < Phase::Proposing && to >= Phase::Proposing {
        actions.push(PhaseAction::Propose { round });
    }
    actions
}
