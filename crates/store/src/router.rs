//! Partition routing
//!
//! Keys are placed by hashing into a per-table partition count. Raising the
//! count models a region split: most keys re-resolve to a different
//! partition id, which is exactly what the coordinator's split-retry paths
//! need to observe.

use crate::types::{PartitionId, TableId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Resolves a key to its current partition
pub trait PartitionRouter: Send + Sync {
    fn resolve(&self, table_id: TableId, key: &[u8]) -> PartitionId;
}

/// Hash-based router with a mutable per-table partition count
pub struct HashRouter {
    tables: Mutex<HashMap<TableId, u64>>,
    default_partitions: u64,
}

impl HashRouter {
    pub fn new(default_partitions: u64) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            default_partitions: default_partitions.max(1),
        }
    }

    /// Change a table's partition count, e.g. to model a region split.
    pub fn set_partitions(&self, table_id: TableId, partitions: u64) {
        self.tables.lock().insert(table_id, partitions.max(1));
    }

    fn partitions(&self, table_id: TableId) -> u64 {
        self.tables
            .lock()
            .get(&table_id)
            .copied()
            .unwrap_or(self.default_partitions)
    }
}

impl PartitionRouter for HashRouter {
    fn resolve(&self, table_id: TableId, key: &[u8]) -> PartitionId {
        let partitions = self.partitions(table_id);
        let mut hasher = DefaultHasher::new();
        table_id.hash(&mut hasher);
        key.hash(&mut hasher);
        let bucket = hasher.finish() % partitions;
        // Partition count in the high bits so ids change across splits
        PartitionId((partitions << 16) | bucket)
    }
}
