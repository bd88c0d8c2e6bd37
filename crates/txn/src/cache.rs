//! Per-transaction mutation buffer
//!
//! The buffer holds at most one live mutation per (table, key). A later
//! write to the same key merges into the existing entry in place, so the
//! insertion position of the first write survives merging and primary
//! selection stays deterministic across statement retries.

use meridian_store::{Key, KeyAddr, Mutation, Op, PartitionId, TableId};
use std::collections::HashMap;

/// Ordered buffer of row mutations with per-key dedup
#[derive(Debug, Default)]
pub struct TxnCache {
    entries: Vec<Mutation>,
    index: HashMap<(TableId, Key), usize>,
}

impl TxnCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a mutation, merging with any existing entry for its key.
    ///
    /// Merge rules (newest applied to existing):
    /// - put then delete  -> delete
    /// - delete then put  -> put
    /// - check-not-exists then put -> put-if-absent
    /// - put-if-absent then put -> put-if-absent with the new value
    /// - a lock entry never downgrades a buffered write
    /// - anything else: the later mutation supersedes, keeping the slot
    pub fn merge(&mut self, mutation: Mutation) {
        let slot = (mutation.table_id, mutation.key.clone());
        let Some(&i) = self.index.get(&slot) else {
            self.index.insert(slot, self.entries.len());
            self.entries.push(mutation);
            return;
        };

        let existing = &mut self.entries[i];
        let for_update_ts = mutation.for_update_ts.or(existing.for_update_ts);
        match (existing.op, mutation.op) {
            // A lock request on an already-buffered write changes nothing
            (_, Op::Lock) => {}
            (Op::CheckNotExists, Op::Put) | (Op::PutIfAbsent, Op::Put) => {
                existing.op = Op::PutIfAbsent;
                existing.value = mutation.value;
            }
            _ => {
                existing.op = mutation.op;
                existing.value = mutation.value;
            }
        }
        existing.for_update_ts = for_update_ts;
    }

    /// The transaction's primary: the first buffered write
    pub fn primary(&self) -> Option<&Mutation> {
        self.entries.iter().find(|m| m.op != Op::Lock)
    }

    /// Current entry for a key
    pub fn get(&self, table_id: TableId, key: &[u8]) -> Option<&Mutation> {
        self.index
            .get(&(table_id, key.to_vec()))
            .map(|&i| &self.entries[i])
    }

    /// Whether anything at all is buffered
    pub fn has_any(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Whether there is data to prewrite and commit
    pub fn check_continue(&self) -> bool {
        self.entries.iter().any(|m| m.op != Op::Lock)
    }

    /// Whether cleanup has work to do
    pub fn check_clean_continue(&self, pessimistic: bool) -> bool {
        if pessimistic {
            self.has_any()
        } else {
            self.check_continue()
        }
    }

    /// Write mutations grouped by partition; group order and in-group order
    /// follow the insertion order of the first write to each key.
    pub fn write_groups(&self) -> Vec<(PartitionId, Vec<Mutation>)> {
        let mut groups: Vec<(PartitionId, Vec<Mutation>)> = Vec::new();
        for m in self.entries.iter().filter(|m| m.op != Op::Lock) {
            match groups.iter_mut().find(|(p, _)| *p == m.partition_id) {
                Some((_, batch)) => batch.push(m.clone()),
                None => groups.push((m.partition_id, vec![m.clone()])),
            }
        }
        groups
    }

    /// Addresses of every buffered write
    pub fn write_keys(&self) -> Vec<KeyAddr> {
        self.entries
            .iter()
            .filter(|m| m.op != Op::Lock)
            .map(Mutation::addr)
            .collect()
    }

    /// Lock entries never superseded by a write: the residual pessimistic
    /// locks to roll back before commit.
    pub fn residual_locks(&self) -> Vec<(KeyAddr, Option<u64>)> {
        self.entries
            .iter()
            .filter(|m| m.op == Op::Lock)
            .map(|m| (m.addr(), m.for_update_ts))
            .collect()
    }

    /// Drop residual lock entries once they have been rolled back
    pub fn remove_locks(&mut self) {
        self.entries.retain(|m| m.op != Op::Lock);
        self.index.clear();
        for (i, m) in self.entries.iter().enumerate() {
            self.index.insert((m.table_id, m.key.clone()), i);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything; invoked by the cleanup job
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: TableId = TableId(1);

    fn put(key: &[u8], value: &[u8]) -> Mutation {
        Mutation::put(TABLE, key.to_vec(), value.to_vec())
    }

    #[test]
    fn test_put_then_delete_is_delete() {
        let mut cache = TxnCache::new();
        cache.merge(put(b"a", b"1"));
        cache.merge(Mutation::delete(TABLE, b"a".to_vec()));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.primary().unwrap().op, Op::Delete);
    }

    #[test]
    fn test_delete_then_put_is_put() {
        let mut cache = TxnCache::new();
        cache.merge(Mutation::delete(TABLE, b"a".to_vec()));
        cache.merge(put(b"a", b"2"));

        let m = cache.primary().unwrap();
        assert_eq!(m.op, Op::Put);
        assert_eq!(m.value, b"2");
    }

    #[test]
    fn test_check_not_exists_then_put_is_put_if_absent() {
        let mut cache = TxnCache::new();
        cache.merge(Mutation::check_not_exists(TABLE, b"a".to_vec()));
        cache.merge(put(b"a", b"1"));

        let m = cache.primary().unwrap();
        assert_eq!(m.op, Op::PutIfAbsent);
        assert_eq!(m.value, b"1");

        // A later update keeps the absent check alive
        cache.merge(put(b"a", b"2"));
        let m = cache.primary().unwrap();
        assert_eq!(m.op, Op::PutIfAbsent);
        assert_eq!(m.value, b"2");
    }

    #[test]
    fn test_merge_keeps_first_write_position() {
        let mut cache = TxnCache::new();
        cache.merge(put(b"a", b"1"));
        cache.merge(put(b"b", b"2"));
        cache.merge(put(b"a", b"3"));

        // "a" keeps its slot, so it stays the primary
        let m = cache.primary().unwrap();
        assert_eq!(m.key, b"a");
        assert_eq!(m.value, b"3");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_lock_entries() {
        let mut cache = TxnCache::new();
        cache.merge(Mutation::lock(TABLE, b"a".to_vec()));
        cache.merge(Mutation::lock(TABLE, b"b".to_vec()));
        cache.merge(put(b"b", b"2"));

        // Lock-only buffers have nothing to commit
        assert!(cache.has_any());
        assert!(cache.check_continue());
        assert_eq!(cache.primary().unwrap().key, b"b");

        // "a" was never written, so it is residual; "b" was superseded
        let residual = cache.residual_locks();
        assert_eq!(residual.len(), 1);
        assert_eq!(residual[0].0.key, b"a");

        // A lock after a write does not downgrade it
        cache.merge(Mutation::lock(TABLE, b"b".to_vec()));
        assert_eq!(cache.primary().unwrap().op, Op::Put);
    }

    #[test]
    fn test_clean_continue() {
        let mut cache = TxnCache::new();
        cache.merge(Mutation::lock(TABLE, b"a".to_vec()));

        assert!(!cache.check_continue());
        assert!(cache.check_clean_continue(true));
        assert!(!cache.check_clean_continue(false));
    }

    #[test]
    fn test_write_groups_follow_insertion_order() {
        let mut cache = TxnCache::new();
        let mut a = put(b"a", b"1");
        a.partition_id = PartitionId(1);
        let mut b = put(b"b", b"2");
        b.partition_id = PartitionId(2);
        let mut c = put(b"c", b"3");
        c.partition_id = PartitionId(1);

        cache.merge(a);
        cache.merge(b);
        cache.merge(c);

        let groups = cache.write_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, PartitionId(1));
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[0].1[0].key, b"a");
        assert_eq!(groups[0].1[1].key, b"c");
        assert_eq!(groups[1].0, PartitionId(2));
    }
}
