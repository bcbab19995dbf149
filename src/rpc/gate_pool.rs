//! Pooling of call gates: shared, exclusive, and dedicated.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use log::debug;
use rand::Rng;

use crate::clock::{coarse_steady_now, CoarseInstant};
use crate::fiber::{self, timer};

use super::call_gate::StreamCallGate;

/// Tuning for a [`StreamCallGatePool`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Global cap on shared connections per server, divided among
    /// scheduling groups. Two protocols talking to one server each get
    /// their own allotment (they live in differently-keyed pools).
    pub max_connections_per_server: usize,
    /// Period of the idle-connection purge sweep.
    pub purge_interval: Duration,
    /// Idle age past which a pooled connection is evicted. Keep this
    /// strictly below the server-side idle timeout, or we risk picking up
    /// a connection the server is closing.
    pub max_idle: Duration,
}

impl Default for PoolOptions {
    fn default() -> PoolOptions {
        PoolOptions {
            max_connections_per_server: 8,
            purge_interval: Duration::from_secs(15),
            max_idle: Duration::from_secs(45),
        }
    }
}

// How long a connection may sit idle before reuse is forced upon it.
//
// Linux restarts TCP slow start once a connection has idled for roughly an
// RTT-derived period (@sa `net.ipv4.tcp_slow_start_after_idle`), which in
// our environments can be as low as ~200ms. Under light load, fanning out
// to `max_conns` connections therefore hurts: every one of them keeps
// re-entering slow start. Reusing a recently-used connection first avoids
// that.
const FORCE_REUSE_THRESHOLD: Duration = Duration::from_millis(25);

// A connection serving fewer concurrent users than this is not worth
// bypassing for a brand-new one.
const MINIMUM_USERS: usize = 2;

static NEW_CONN_CREATION_IN_SHARED_POOL: AtomicU64 = AtomicU64::new(0);

/// Number of times a shared pool decided to open a new connection.
pub fn new_conn_creation_in_shared_pool() -> u64 {
    NEW_CONN_CREATION_IN_SHARED_POOL.load(Ordering::Relaxed)
}

struct GateEntry {
    last_used: AtomicU64, // Coarse-clock nanos.
    gate: StreamCallGate,
}

impl GateEntry {
    fn new(gate: StreamCallGate) -> GateEntry {
        GateEntry {
            last_used: AtomicU64::new(coarse_steady_now().as_nanos()),
            gate,
        }
    }

    fn last_used(&self) -> CoarseInstant {
        CoarseInstant::from_nanos(self.last_used.load(Ordering::Relaxed))
    }

    // Refreshes the timestamp, skipping the store when the coarse clock
    // hasn't advanced — which is most of the time, and saves the cacheline
    // traffic of everybody stamping every acquisition.
    fn touch(&self, now: CoarseInstant) {
        if self.last_used() != now {
            // This store races. It doesn't hurt.
            self.last_used.store(now.as_nanos(), Ordering::Relaxed);
        }
    }
}

type Creator<'a> = &'a dyn Fn() -> StreamCallGate;

trait AbstractGatePool: Send + Sync {
    fn get_or_create(&self, key: SocketAddr, creator: Creator<'_>) -> StreamCallGate;
    fn put(&self, gate: StreamCallGate);
    fn purge(&self, max_idle: Duration);
    fn stop(&self);
    fn join(&self);
}

// Removes entries idle past `max_idle` from `gates`, compacting the lists
// and dropping emptied keys. The caller stops/joins what comes back.
fn purge_gates<E: std::borrow::Borrow<GateEntry>>(
    gates: &mut HashMap<SocketAddr, Vec<E>>,
    max_idle: Duration,
    destroying: &mut Vec<E>,
) {
    let now = coarse_steady_now();
    gates.retain(|_, entries| {
        let mut index = 0;
        while index < entries.len() {
            if entries[index].borrow().last_used().saturating_add(max_idle) < now {
                destroying.push(entries.remove(index));
            } else {
                index += 1;
            }
        }
        !entries.is_empty()
    });
}

// Pool for shared (multiplexed) gates: per endpoint, up to `max_conns`
// connections used by any number of callers at once.
//
// Reads go through a copy-on-write snapshot so the hot acquisition path
// takes no exclusive lock; mutations rebuild the snapshot under
// `mutation`.
struct SharedGatePool {
    max_conns: usize,
    snapshot: RwLock<Arc<SharedSnapshot>>,
    mutation: Mutex<()>,
}

#[derive(Default)]
struct SharedSnapshot {
    gates: HashMap<SocketAddr, Vec<Arc<GateEntry>>>,
}

impl SharedGatePool {
    fn new(max_conns: usize) -> SharedGatePool {
        SharedGatePool {
            max_conns,
            snapshot: RwLock::new(Arc::new(SharedSnapshot::default())),
            mutation: Mutex::new(()),
        }
    }

    fn load_snapshot(&self) -> Arc<SharedSnapshot> {
        self.snapshot.read().expect("pool snapshot poisoned").clone()
    }

    fn store_snapshot(&self, snapshot: SharedSnapshot) {
        *self.snapshot.write().expect("pool snapshot poisoned") = Arc::new(snapshot);
    }

    fn consider_reuse(&self, entries: &[Arc<GateEntry>]) -> Option<StreamCallGate> {
        // The coarse timestamp only changes every few milliseconds; the
        // heuristics below lean on that.
        let now = coarse_steady_now();

        // If we've created the maximum number of connections *and the last
        // one has been used recently enough*, pick one at random. The
        // second condition matters: with the scan order below, the last
        // connection's timestamp is the farthest from now — so either load
        // is light and the tail connection should not be revived, or all
        // of them are busy and random spreading is the best we can do.
        if entries.len() == self.max_conns {
            let last = entries.last().expect("checked non-empty");
            if now < last.last_used().saturating_add(FORCE_REUSE_THRESHOLD) {
                let pick = &entries[rand::rng().random_range(0..entries.len())];
                pick.touch(now);
                return Some(pick.gate.clone());
            }
        }

        // Otherwise reuse any connection that is either lightly loaded or
        // idle long enough that it will slow-start anyway. Linear, but
        // `max_conns` is small.
        for entry in entries {
            if entry.gate.user_count() < MINIMUM_USERS + 1 /* the pool's own reference */
                || entry.last_used().saturating_add(FORCE_REUSE_THRESHOLD) < now
            {
                entry.touch(now);
                return Some(entry.gate.clone());
            }
        }

        None
    }
}

impl AbstractGatePool for SharedGatePool {
    fn get_or_create(&self, key: SocketAddr, creator: Creator<'_>) -> StreamCallGate {
        // Reuse first, snapshot only.
        {
            let snapshot = self.load_snapshot();
            if let Some(entries) = snapshot.gates.get(&key) {
                debug_assert!(entries.len() <= self.max_conns);
                if let Some(gate) = self.consider_reuse(entries) {
                    return gate;
                }
            }
        }

        // Either we may, or we need to, create another connection.
        NEW_CONN_CREATION_IN_SHARED_POOL.fetch_add(1, Ordering::Relaxed);
        let now = coarse_steady_now();

        let _mutation = self.mutation.lock().expect("pool mutation poisoned");
        let mut gates = self.load_snapshot().gates.clone();
        let entries = gates.entry(key).or_default();
        if entries.len() == self.max_conns {
            // Somebody else created one while we raced here; use theirs.
            let pick = entries[rand::rng().random_range(0..entries.len())].clone();
            pick.touch(now);
            return pick.gate.clone();
        }

        let entry = Arc::new(GateEntry::new(creator()));
        let gate = entry.gate.clone();
        entries.push(entry);
        self.store_snapshot(SharedSnapshot { gates });
        gate
    }

    fn put(&self, gate: StreamCallGate) {
        if gate.healthy() {
            // Nothing to do; the gate stays pooled.
            return;
        }
        // Unhealthy: take it out of the pool, then shut it down outside
        // the mutation lock.
        let mut stop_and_join = false;
        {
            let _mutation = self.mutation.lock().expect("pool mutation poisoned");
            let mut gates = self.load_snapshot().gates.clone();
            if let Some(entries) = gates.get_mut(&gate.endpoint()) {
                if let Some(at) = entries.iter().position(|e| e.gate.is_same(&gate)) {
                    entries.remove(at);
                    if entries.is_empty() {
                        gates.remove(&gate.endpoint());
                    }
                    // We're responsible for destroying it.
                    stop_and_join = true;
                }
            }
            if stop_and_join {
                self.store_snapshot(SharedSnapshot { gates });
            } // Already removed by someone else otherwise; nothing to do.
        }
        if stop_and_join {
            gate.stop();
            gate.join();
        }
    }

    fn purge(&self, max_idle: Duration) {
        let mut destroying = Vec::new();
        {
            let _mutation = self.mutation.lock().expect("pool mutation poisoned");
            let mut gates = self.load_snapshot().gates.clone();
            purge_gates(&mut gates, max_idle, &mut destroying);
            self.store_snapshot(SharedSnapshot { gates });
        }
        for entry in &destroying {
            entry.gate.stop();
        }
        for entry in &destroying {
            entry.gate.join();
        }
    }

    fn stop(&self) {
        let snapshot = self.load_snapshot();
        for entries in snapshot.gates.values() {
            for entry in entries {
                entry.gate.stop();
            }
        }
    }

    fn join(&self) {
        let snapshot = self.load_snapshot();
        for entries in snapshot.gates.values() {
            for entry in entries {
                entry.gate.join();
            }
        }
    }
}

// Pool for exclusive gates: a free list per endpoint; each caller owns the
// gate until it is put back. LIFO keeps the hottest connection in play.
#[derive(Default)]
struct ExclusiveGatePool {
    gates: Mutex<HashMap<SocketAddr, Vec<GateEntry>>>,
}

impl AbstractGatePool for ExclusiveGatePool {
    fn get_or_create(&self, key: SocketAddr, creator: Creator<'_>) -> StreamCallGate {
        {
            let mut gates = self.gates.lock().expect("exclusive pool poisoned");
            if let Some(entries) = gates.get_mut(&key) {
                if let Some(entry) = entries.pop() {
                    return entry.gate;
                }
            }
        }
        creator()
    }

    fn put(&self, gate: StreamCallGate) {
        if !gate.healthy() {
            gate.stop();
            gate.join();
            return;
        }
        let mut gates = self.gates.lock().expect("exclusive pool poisoned");
        gates
            .entry(gate.endpoint())
            .or_default()
            .push(GateEntry::new(gate));
    }

    fn purge(&self, max_idle: Duration) {
        let mut destroying = Vec::new();
        {
            let mut gates = self.gates.lock().expect("exclusive pool poisoned");
            purge_gates(&mut gates, max_idle, &mut destroying);
        }
        for entry in &destroying {
            entry.gate.stop();
        }
        for entry in &destroying {
            entry.gate.join();
        }
    }

    fn stop(&self) {
        let gates = self.gates.lock().expect("exclusive pool poisoned");
        for entries in gates.values() {
            for entry in entries {
                entry.gate.stop();
            }
        }
    }

    fn join(&self) {
        let gates = self.gates.lock().expect("exclusive pool poisoned");
        for entries in gates.values() {
            for entry in entries {
                entry.gate.join();
            }
        }
    }
}

// Pool for dedicated gates: never caches anything.
struct DedicatedGatePool;

impl AbstractGatePool for DedicatedGatePool {
    fn get_or_create(&self, _key: SocketAddr, creator: Creator<'_>) -> StreamCallGate {
        creator()
    }

    fn put(&self, gate: StreamCallGate) {
        gate.stop();
        gate.join();
    }

    // We own nothing, so the rest are no-ops.
    fn purge(&self, _max_idle: Duration) {}
    fn stop(&self) {}
    fn join(&self) {}
}

#[derive(Copy, Clone)]
enum SubPool {
    Shared(usize),
    Exclusive(usize),
    Dedicated,
}

/// A set of gate pools, usually one per `(protocol, options)` pool key.
///
/// Three pooling disciplines coexist:
/// - *shared*: multiplexed connections, bounded per endpoint;
/// - *exclusive*: one caller at a time, free-listed;
/// - *dedicated*: created and torn down per use.
///
/// Shared and exclusive pools are per scheduling group; an extra shared
/// pool capped at one connection serves callers asking for a `unique`
/// connection.
pub struct StreamCallGatePool {
    options: PoolOptions,
    // Indices 0..groups are per-group; the last one is the `unique` pool.
    shared: Vec<SharedGatePool>,
    exclusive: Vec<ExclusiveGatePool>,
    dedicated: DedicatedGatePool,
    purge_timer: timer::TimerId,
    weak_self: std::sync::Weak<StreamCallGatePool>,
}

impl StreamCallGatePool {
    /// Creates the pool set and arms its purge timer.
    pub fn new(options: PoolOptions) -> Arc<StreamCallGatePool> {
        let groups = fiber::scheduling_group_count();
        let max_conns = std::cmp::max(1, options.max_connections_per_server / groups);

        let mut shared: Vec<_> = (0..groups).map(|_| SharedGatePool::new(max_conns)).collect();
        shared.push(SharedGatePool::new(1)); // `unique` users land here.
        let exclusive = (0..groups).map(|_| ExclusiveGatePool::default()).collect();

        Arc::new_cyclic(|weak: &std::sync::Weak<StreamCallGatePool>| {
            let timer_weak = weak.clone();
            let interval = options.purge_interval;
            let purge_timer =
                timer::set_periodic_timer(std::time::Instant::now() + interval, interval, move || {
                    if let Some(pool) = timer_weak.upgrade() {
                        pool.purge();
                    }
                });
            StreamCallGatePool {
                options,
                shared,
                exclusive,
                dedicated: DedicatedGatePool,
                purge_timer,
                weak_self: weak.clone(),
            }
        })
    }

    // Every pool lives inside an `Arc` (see `new`).
    fn strong_self(&self) -> Arc<StreamCallGatePool> {
        self.weak_self.upgrade().expect("pool vanished")
    }

    /// Acquires a shared (multiplexed) gate to `endpoint`, creating one
    /// through `creator` when the pool decides to grow. With `unique`
    /// set, at most one connection per endpoint is kept regardless of the
    /// configured cap.
    pub fn get_or_create_shared<F>(&self, endpoint: SocketAddr, unique: bool, creator: F) -> GateHandle
    where
        F: Fn() -> StreamCallGate,
    {
        let index = if unique {
            self.shared.len() - 1
        } else {
            fiber::current_scheduling_group()
        };
        let gate = self.shared[index].get_or_create(endpoint, &creator);
        GateHandle::new(self.strong_self(), SubPool::Shared(index), gate)
    }

    /// Acquires an exclusive gate to `endpoint`: nobody else uses it until
    /// the handle goes back.
    pub fn get_or_create_exclusive<F>(&self, endpoint: SocketAddr, creator: F) -> GateHandle
    where
        F: Fn() -> StreamCallGate,
    {
        let index = fiber::current_scheduling_group();
        let gate = self.exclusive[index].get_or_create(endpoint, &creator);
        GateHandle::new(self.strong_self(), SubPool::Exclusive(index), gate)
    }

    /// Acquires a gate that will be torn down when the handle drops.
    pub fn get_or_create_dedicated<F>(&self, endpoint: SocketAddr, creator: F) -> GateHandle
    where
        F: Fn() -> StreamCallGate,
    {
        let gate = self.dedicated.get_or_create(endpoint, &creator);
        GateHandle::new(self.strong_self(), SubPool::Dedicated, gate)
    }

    /// Evicts connections idle past the configured threshold, two-phase:
    /// detached under the pool's write discipline, then stopped and
    /// joined outside of it.
    pub fn purge(&self) {
        self.for_each_pool(|pool| pool.purge(self.options.max_idle));
    }

    /// Number of connections currently held by the shared pools.
    pub fn shared_connection_count(&self) -> usize {
        self.shared
            .iter()
            .map(|pool| {
                pool.load_snapshot()
                    .gates
                    .values()
                    .map(Vec::len)
                    .sum::<usize>()
            })
            .sum()
    }

    /// Kills the purge timer and stops every pooled gate.
    pub fn stop(&self) {
        timer::kill_timer(self.purge_timer);
        self.for_each_pool(|pool| pool.stop());
    }

    /// Joins every pooled gate.
    pub fn join(&self) {
        self.for_each_pool(|pool| pool.join());
        // A purge sweep may still be mid-flight on the timer worker; give
        // it a moment to drain before callers tear the world down.
        fiber::sleep_for(Duration::from_millis(100));
    }

    fn for_each_pool<F: FnMut(&dyn AbstractGatePool)>(&self, mut f: F) {
        for pool in &self.shared {
            f(pool);
        }
        for pool in &self.exclusive {
            f(pool);
        }
        f(&self.dedicated);
    }

    fn put(&self, sub_pool: SubPool, gate: StreamCallGate) {
        match sub_pool {
            SubPool::Shared(index) => self.shared[index].put(gate),
            SubPool::Exclusive(index) => self.exclusive[index].put(gate),
            SubPool::Dedicated => self.dedicated.put(gate),
        }
    }
}

/// A pooled gate; returns to its owning pool on drop.
pub struct GateHandle {
    pool: Arc<StreamCallGatePool>,
    sub_pool: SubPool,
    gate: Option<StreamCallGate>,
}

impl GateHandle {
    fn new(pool: Arc<StreamCallGatePool>, sub_pool: SubPool, gate: StreamCallGate) -> GateHandle {
        GateHandle {
            pool,
            sub_pool,
            gate: Some(gate),
        }
    }

    /// The gate itself.
    pub fn gate(&self) -> &StreamCallGate {
        self.gate.as_ref().expect("handle already closed")
    }

    /// Returns the gate to the pool early.
    pub fn close(&mut self) {
        if let Some(gate) = self.gate.take() {
            self.pool.put(self.sub_pool, gate);
        }
    }
}

impl std::ops::Deref for GateHandle {
    type Target = StreamCallGate;

    fn deref(&self) -> &StreamCallGate {
        self.gate()
    }
}

impl Drop for GateHandle {
    fn drop(&mut self) {
        self.close();
    }
}

static GLOBAL_POOLS: OnceLock<RwLock<HashMap<String, Arc<StreamCallGatePool>>>> = OnceLock::new();
static GLOBAL_POOLS_STOPPED: AtomicBool = AtomicBool::new(false);

fn global_pools() -> &'static RwLock<HashMap<String, Arc<StreamCallGatePool>>> {
    GLOBAL_POOLS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Returns the process-wide pool registered under `key` (typically the
/// protocol name plus an options signature), creating it with `options`
/// on first use.
pub fn global_pool(key: &str, options: PoolOptions) -> Arc<StreamCallGatePool> {
    assert!(
        !GLOBAL_POOLS_STOPPED.load(Ordering::Relaxed),
        "the call gate pools have already been stopped"
    );
    {
        let pools = global_pools().read().expect("pool registry poisoned");
        if let Some(pool) = pools.get(key) {
            return pool.clone();
        }
    }
    let mut pools = global_pools().write().expect("pool registry poisoned");
    if let Some(pool) = pools.get(key) {
        return pool.clone();
    }
    debug!("creating call gate pool for key {:?}", key);
    let pool = StreamCallGatePool::new(options);
    pools.insert(key.to_owned(), pool.clone());
    pool
}

/// Stops every global pool. Part of process shutdown.
pub fn stop_all_global_pools() {
    GLOBAL_POOLS_STOPPED.store(true, Ordering::Relaxed);
    let pools = global_pools().read().expect("pool registry poisoned");
    for pool in pools.values() {
        pool.stop();
    }
}

/// Joins every global pool and drops them. Part of process shutdown.
pub fn join_all_global_pools() {
    let mut pools = global_pools().write().expect("pool registry poisoned");
    for pool in pools.values() {
        pool.join();
    }
    pools.clear();
}
