//! Wire-shaped types shared between the coordinator and the store

use serde::{Deserialize, Serialize};
use std::fmt;

/// Table identifier
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TableId(pub u64);

/// Partition (region) identifier; refreshed by the router after a split
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PartitionId(pub u64);

/// Raw row key bytes
pub type Key = Vec<u8>;

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Mutation operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Write a value
    Put,
    /// Remove the key
    Delete,
    /// Assert the key does not exist; leaves no write
    CheckNotExists,
    /// Write a value, failing if the key already exists
    PutIfAbsent,
    /// Pessimistic lock record with no data write
    Lock,
}

/// Fully addressed key: table, partition, key bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyAddr {
    pub table_id: TableId,
    pub partition_id: PartitionId,
    pub key: Key,
}

impl KeyAddr {
    pub fn new(table_id: TableId, partition_id: PartitionId, key: Key) -> Self {
        Self {
            table_id,
            partition_id,
            key,
        }
    }
}

/// A single buffered row mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub op: Op,
    pub table_id: TableId,
    pub partition_id: PartitionId,
    pub key: Key,
    pub value: Vec<u8>,
    /// Set on rows locked by a pessimistic statement
    pub for_update_ts: Option<u64>,
}

impl Mutation {
    pub fn put(table_id: TableId, key: Key, value: Vec<u8>) -> Self {
        Self::new(Op::Put, table_id, key, value)
    }

    pub fn delete(table_id: TableId, key: Key) -> Self {
        Self::new(Op::Delete, table_id, key, Vec::new())
    }

    pub fn check_not_exists(table_id: TableId, key: Key) -> Self {
        Self::new(Op::CheckNotExists, table_id, key, Vec::new())
    }

    pub fn put_if_absent(table_id: TableId, key: Key, value: Vec<u8>) -> Self {
        Self::new(Op::PutIfAbsent, table_id, key, value)
    }

    pub fn lock(table_id: TableId, key: Key) -> Self {
        Self::new(Op::Lock, table_id, key, Vec::new())
    }

    fn new(op: Op, table_id: TableId, key: Key, value: Vec<u8>) -> Self {
        Self {
            op,
            table_id,
            partition_id: PartitionId(0),
            key,
            value,
            for_update_ts: None,
        }
    }

    /// Address of this mutation's key
    pub fn addr(&self) -> KeyAddr {
        KeyAddr::new(self.table_id, self.partition_id, self.key.clone())
    }
}

/// The transaction's primary key record.
///
/// Chosen as the first buffered write; every other mutation is a secondary.
/// The partition may be refreshed when the store reports a region split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKey {
    pub table_id: TableId,
    pub partition_id: PartitionId,
    pub key: Key,
    pub op: Op,
    pub value: Vec<u8>,
}

impl PrimaryKey {
    pub fn from_mutation(mutation: &Mutation) -> Self {
        Self {
            table_id: mutation.table_id,
            partition_id: mutation.partition_id,
            key: mutation.key.clone(),
            op: mutation.op,
            value: mutation.value.clone(),
        }
    }

    /// Address of the primary key
    pub fn addr(&self) -> KeyAddr {
        KeyAddr::new(self.table_id, self.partition_id, self.key.clone())
    }
}
