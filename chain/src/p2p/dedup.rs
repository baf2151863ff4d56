//! Processed-message ledger.

use std::collections::HashMap;

use crate::types::Hash256;

/// Remembers message digests for a bounded time so that re-deliveries
/// inside the window are recognised as duplicates.
#[derive(Debug)]
pub struct ProcessedMessages {
    retention_ms: u64,
    seen: HashMap<Hash256, u64>,
}

impl ProcessedMessages {
    pub fn new(retention_ms: u64) -> Self {
        Self {
            retention_ms,
            seen: HashMap::new(),
        }
    }

    /// Returns `true` if `key` was not seen within the retention window,
    /// and records it.
    pub fn first_delivery(&mut self, key: Hash256, now_ms: u64) -> bool {
        self.prune(now_ms);
        match self.seen.get(&key) {
            Some(_) => false,
            None => {
                self.seen.insert(key, now_ms);
                true
            }
        }
    }

    pub fn prune(&mut self, now_ms: u64) {
        let retention = self.retention_ms;
        self.seen
            .retain(|_, seen| now_ms.saturating_sub(*seen) < retention);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_inside_window_are_flagged() {
        let mut p = ProcessedMessages::new(1_000);
        let key = Hash256::compute(b"m");
        assert!(p.first_delivery(key, 10));
        assert!(!p.first_delivery(key, 500));
        assert!(p.first_delivery(Hash256::compute(b"other"), 500));
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn entries_expire_after_retention() {
        let mut p = ProcessedMessages::new(1_000);
        let key = Hash256::compute(b"m");
        assert!(p.first_delivery(key, 0));
        assert!(p.first_delivery(key, 1_000));
        p.prune(5_000);
        assert!(p.is_empty());
    }
}
