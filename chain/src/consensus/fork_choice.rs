//! Fork-choice rule for deciding which peer chains are worth tallying.

use crate::types::Block;

/// Abstraction over fork-choice rules.
///
/// Given the local tip and the tip of a chain (or chain suffix) announced
/// by a peer, an implementation decides whether the announcement may
/// take part in chain reconciliation at all.
pub trait ForkChoice {
    fn qualifies(&self, local_tip: &Block, candidate_tip: &Block) -> bool;
}

/// Simple "longest chain by height" fork choice.
///
/// Candidates at least as long as the local chain qualify; shorter ones
/// are ignored. Equal heights qualify so that competing blocks at the same
/// index can be settled by majority.
#[derive(Clone, Copy, Debug, Default)]
pub struct LongestChainForkChoice;

impl ForkChoice for LongestChainForkChoice {
    fn qualifies(&self, local_tip: &Block, candidate_tip: &Block) -> bool {
        candidate_tip.index >= local_tip.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(index: u64) -> Block {
        let mut b = Block::genesis();
        b.index = index;
        b
    }

    #[test]
    fn longer_or_equal_qualifies() {
        let fc = LongestChainForkChoice;
        assert!(fc.qualifies(&at(3), &at(4)));
        assert!(fc.qualifies(&at(3), &at(3)));
        assert!(!fc.qualifies(&at(3), &at(2)));
    }
}
