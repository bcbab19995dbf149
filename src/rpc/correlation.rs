//! Correlation IDs and the map of outstanding calls.
//!
//! Keeping the correlation table out of the connection objects separates
//! timeout handling from connection lifetime: a timer only needs the map,
//! never the connection, so neither has to wait for the other to die.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::base::id_alloc;
use crate::define_id_space;

// The reuse window shrinks with the batch size; at 128, a thread must sit
// on a batch through ~40M allocations process-wide before a still-in-use
// ID could come around again.
define_id_space!(RpcCorrelationIds, min: 1, max: u32::MAX, batch: 128);

/// Allocates an ID for one RPC.
pub fn new_rpc_correlation_id() -> u32 {
    id_alloc::next::<RpcCorrelationIds>()
}

/// Allocates an ID for one connection.
///
/// Connection establishment is inherently slow; no point in batching
/// these.
pub fn new_connection_correlation_id() -> u32 {
    static NEXT_ID: AtomicU32 = AtomicU32::new(0);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Packs a connection ID and an RPC ID into one key.
pub fn merge_correlation_id(conn: u32, rpc: u32) -> u64 {
    (u64::from(conn)) << 32 | u64::from(rpc)
}

/// Splits a key packed by [`merge_correlation_id`].
pub fn split_correlation_id(id: u64) -> (u32, u32) {
    ((id >> 32) as u32, id as u32)
}

const SHARDS: usize = 16384;

/// A sharded map of outstanding calls keyed by full correlation ID.
///
/// There is one map per scheduling group, so sharding can be generous.
/// Shard critical sections contain nothing but the hash-map operation.
pub struct CorrelationMap<T> {
    shards: Vec<std::sync::Mutex<HashMap<u64, T>>>,
}

impl<T> CorrelationMap<T> {
    /// Creates an empty map.
    pub fn new() -> CorrelationMap<T> {
        let mut shards = Vec::with_capacity(SHARDS);
        shards.resize_with(SHARDS, || std::sync::Mutex::new(HashMap::new()));
        CorrelationMap { shards }
    }

    /// Inserts a new correlation. Duplicates are a caller bug and panic.
    pub fn insert(&self, correlation_id: u64, value: T) {
        let mut shard = self.shard(correlation_id).lock().expect("shard poisoned");
        let previous = shard.insert(correlation_id, value);
        assert!(
            previous.is_none(),
            "duplicate correlation_id {}",
            correlation_id
        );
    }

    /// Removes and returns the value under `correlation_id`, if any.
    pub fn remove(&self, correlation_id: u64) -> Option<T> {
        let mut shard = self.shard(correlation_id).lock().expect("shard poisoned");
        shard.remove(&correlation_id)
    }

    /// Visits every entry, holding each shard's lock in turn.
    ///
    /// Entries inserted or removed concurrently may be missed. The visitor
    /// must not touch the map.
    pub fn for_each<F: FnMut(u64, &T)>(&self, mut f: F) {
        for shard in &self.shards {
            let shard = shard.lock().expect("shard poisoned");
            for (correlation_id, value) in shard.iter() {
                f(*correlation_id, value);
            }
        }
    }

    fn shard(&self, correlation_id: u64) -> &std::sync::Mutex<HashMap<u64, T>> {
        &self.shards[Self::index_of(correlation_id)]
    }

    fn index_of(mut x: u64) -> usize {
        x = ((x >> 16) ^ x).wrapping_mul(0x45d9f3b);
        x = ((x >> 16) ^ x).wrapping_mul(0x45d9f3b);
        x = (x >> 16) ^ x;
        (x % SHARDS as u64) as usize
    }
}

impl<T> Default for CorrelationMap<T> {
    fn default() -> CorrelationMap<T> {
        CorrelationMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_split_round_trip() {
        let id = merge_correlation_id(0xdead, 0xbeef);
        assert_eq!(split_correlation_id(id), (0xdead, 0xbeef));
    }

    #[test]
    fn rpc_ids_are_nonzero() {
        for _ in 0..1000 {
            assert_ne!(new_rpc_correlation_id(), 0);
        }
    }

    #[test]
    fn insert_remove() {
        let map = CorrelationMap::new();
        map.insert(1, "a");
        map.insert(2, "b");
        assert_eq!(map.remove(1), Some("a"));
        assert_eq!(map.remove(1), None);
        assert_eq!(map.remove(2), Some("b"));
    }

    #[test]
    #[should_panic(expected = "duplicate correlation_id")]
    fn duplicate_insert_panics() {
        let map = CorrelationMap::new();
        map.insert(7, ());
        map.insert(7, ());
    }

    #[test]
    fn for_each_sees_all_entries() {
        let map = CorrelationMap::new();
        for i in 0..1000u64 {
            map.insert(i, i * 2);
        }
        let mut seen = 0u64;
        map.for_each(|k, v| {
            assert_eq!(*v, k * 2);
            seen += 1;
        });
        assert_eq!(seen, 1000);
    }

    #[test]
    fn contended_inserts_and_removes() {
        let map = std::sync::Arc::new(CorrelationMap::new());
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let map = map.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        let key = t * 1_000_000 + i;
                        map.insert(key, key);
                        assert_eq!(map.remove(key), Some(key));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let mut count = 0;
        map.for_each(|_, _| count += 1);
        assert_eq!(count, 0);
    }
}
