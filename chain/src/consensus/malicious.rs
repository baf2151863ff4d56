//! Malicious-peer accounting.
//!
//! Every time a peer reports a hash that loses a majority decision it
//! receives a strike. Reaching the threshold blacklists the peer for good:
//! its bids, blocks and votes are rejected from then on. Blacklisting is
//! the only irreversible outcome in the protocol, so the record is
//! persisted after every change.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{Hash256, PublicKey};

/// Serializable form of a [`MaliciousRecord`], exchanged in
/// `MALICIOUS_DATA` messages and persisted by the ledger store.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MaliciousSnapshot {
    pub counts: BTreeMap<PublicKey, u32>,
    pub blacklisted: BTreeSet<PublicKey>,
}

impl MaliciousSnapshot {
    pub fn total_strikes(&self) -> u64 {
        self.counts.values().map(|c| u64::from(*c)).sum()
    }

    /// Content digest used to tally identical snapshots.
    pub fn digest(&self) -> Hash256 {
        Hash256::of(self)
    }
}

/// Strike counts plus the blacklist derived from them.
#[derive(Clone, Debug)]
pub struct MaliciousRecord {
    counts: BTreeMap<PublicKey, u32>,
    blacklisted: BTreeSet<PublicKey>,
    threshold: u32,
}

impl MaliciousRecord {
    pub fn new(threshold: u32) -> Self {
        Self {
            counts: BTreeMap::new(),
            blacklisted: BTreeSet::new(),
            threshold,
        }
    }

    /// Restores a record, re-deriving blacklist entries from counts.
    pub fn from_snapshot(snapshot: MaliciousSnapshot, threshold: u32) -> Self {
        let mut record = Self {
            counts: snapshot.counts,
            blacklisted: snapshot.blacklisted,
            threshold,
        };
        record.enforce_threshold();
        record
    }

    fn enforce_threshold(&mut self) {
        for (pk, count) in &self.counts {
            if *count >= self.threshold {
                self.blacklisted.insert(pk.clone());
            }
        }
    }

    pub fn is_blacklisted(&self, pk: &PublicKey) -> bool {
        self.blacklisted.contains(pk)
    }

    pub fn strikes(&self, pk: &PublicKey) -> u32 {
        self.counts.get(pk).copied().unwrap_or(0)
    }

    pub fn blacklisted(&self) -> &BTreeSet<PublicKey> {
        &self.blacklisted
    }

    /// Adds one strike. Returns `true` if this strike blacklisted the peer.
    pub fn add_strike(&mut self, pk: &PublicKey) -> bool {
        let count = self.counts.entry(pk.clone()).or_insert(0);
        *count += 1;
        let count = *count;

        if count >= self.threshold && self.blacklisted.insert(pk.clone()) {
            warn!(peer = %pk.short(), strikes = count, "peer blacklisted");
            return true;
        }
        false
    }

    pub fn total_strikes(&self) -> u64 {
        self.counts.values().map(|c| u64::from(*c)).sum()
    }

    pub fn snapshot(&self) -> MaliciousSnapshot {
        MaliciousSnapshot {
            counts: self.counts.clone(),
            blacklisted: self.blacklisted.clone(),
        }
    }

    /// Merges a majority-approved snapshot.
    ///
    /// Counts take the per-peer maximum and blacklists are unioned, so
    /// adopting never lifts an existing blacklist entry.
    pub fn adopt(&mut self, snapshot: &MaliciousSnapshot) {
        for (pk, count) in &snapshot.counts {
            let local = self.counts.entry(pk.clone()).or_insert(0);
            *local = (*local).max(*count);
        }
        self.blacklisted.extend(snapshot.blacklisted.iter().cloned());
        self.enforce_threshold();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(b: u8) -> PublicKey {
        PublicKey(vec![0x02, b])
    }

    #[test]
    fn third_strike_blacklists() {
        let mut rec = MaliciousRecord::new(3);
        assert!(!rec.add_strike(&pk(1)));
        assert!(!rec.add_strike(&pk(1)));
        assert!(!rec.is_blacklisted(&pk(1)));
        assert!(rec.add_strike(&pk(1)));
        assert!(rec.is_blacklisted(&pk(1)));
        // Further strikes keep counting but do not re-report.
        assert!(!rec.add_strike(&pk(1)));
        assert_eq!(rec.strikes(&pk(1)), 4);
    }

    #[test]
    fn snapshot_restore_rederives_blacklist() {
        let mut counts = BTreeMap::new();
        counts.insert(pk(1), 3);
        counts.insert(pk(2), 1);
        let snap = MaliciousSnapshot {
            counts,
            blacklisted: BTreeSet::new(),
        };
        let rec = MaliciousRecord::from_snapshot(snap, 3);
        assert!(rec.is_blacklisted(&pk(1)));
        assert!(!rec.is_blacklisted(&pk(2)));
        assert_eq!(rec.total_strikes(), 4);
    }

    #[test]
    fn adopt_is_monotonic() {
        let mut rec = MaliciousRecord::new(3);
        for _ in 0..3 {
            rec.add_strike(&pk(9));
        }
        let mut incoming = MaliciousRecord::new(3);
        incoming.add_strike(&pk(1));
        incoming.add_strike(&pk(1));

        rec.adopt(&incoming.snapshot());
        assert!(rec.is_blacklisted(&pk(9)));
        assert_eq!(rec.strikes(&pk(1)), 2);
        assert_eq!(rec.total_strikes(), 5);
    }

    #[test]
    fn identical_snapshots_share_a_digest() {
        let mut a = MaliciousRecord::new(3);
        let mut b = MaliciousRecord::new(3);
        a.add_strike(&pk(1));
        a.add_strike(&pk(2));
        b.add_strike(&pk(2));
        b.add_strike(&pk(1));
        assert_eq!(a.snapshot().digest(), b.snapshot().digest());
    }
}
