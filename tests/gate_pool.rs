//! Pooling behavior: shared reuse, purge, exclusive and dedicated
//! disciplines.

mod util;

use std::sync::Arc;
use std::time::Duration;

use strand::fiber;
use strand::rpc::gate_pool::{
    new_conn_creation_in_shared_pool, PoolOptions, StreamCallGatePool,
};
use strand::rpc::StreamCallGate;

use util::TestProtocol;

fn gate_creator(addr: std::net::SocketAddr) -> impl Fn() -> StreamCallGate {
    move || {
        StreamCallGate::open(
            addr,
            strand::rpc::call_gate::GateOptions::new(Box::new(TestProtocol)),
        )
    }
}

#[test]
fn shared_pool_reuse_and_purge() {
    util::init_runtime();
    let addr = util::start_echo_server();
    let pool = StreamCallGatePool::new(PoolOptions {
        max_connections_per_server: 8,
        // Keep the sweep manual and the idle threshold short, so the test
        // does not sit around for the production 45s.
        purge_interval: Duration::from_secs(3600),
        max_idle: Duration::from_millis(100),
    });

    let created_before = new_conn_creation_in_shared_pool();

    // Four concurrent acquirers; the pool may open up to four
    // connections, but never more.
    let barrier = Arc::new(fiber::Barrier::new(4));
    let fibers: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            let barrier = barrier.clone();
            let creator = gate_creator(addr);
            fiber::spawn(move || {
                barrier.arrive_and_wait();
                let handle = pool.get_or_create_shared(addr, false, creator);
                assert!(handle.healthy());
                // Hold the gate briefly so the peers see it as busy.
                fiber::sleep_for(Duration::from_millis(20));
            })
        })
        .collect();
    for f in fibers {
        f.join();
    }

    let created = new_conn_creation_in_shared_pool() - created_before;
    assert!(created >= 1, "no connection was ever created");
    assert!(created <= 4, "{} connections for 4 acquirers", created);
    let pooled = pool.shared_connection_count();
    assert!((1..=4).contains(&pooled));

    // Keep a reference so eviction is observable.
    let witness = pool
        .get_or_create_shared(addr, false, gate_creator(addr))
        .gate()
        .clone();

    // Everything is idle now; once past the idle threshold a sweep must
    // evict, stop and join every connection.
    fiber::sleep_for(Duration::from_millis(200));
    pool.purge();
    assert_eq!(pool.shared_connection_count(), 0);
    assert!(!witness.healthy(), "evicted gate was not stopped");

    pool.stop();
    pool.join();
}

#[test]
fn unique_shared_pool_caps_at_one() {
    util::init_runtime();
    let addr = util::start_echo_server();
    let pool = StreamCallGatePool::new(PoolOptions::default());

    let first = pool.get_or_create_shared(addr, true, gate_creator(addr));
    let second = pool.get_or_create_shared(addr, true, gate_creator(addr));
    assert!(first.gate().is_same(second.gate()));

    drop(first);
    drop(second);
    pool.stop();
    pool.join();
}

#[test]
fn exclusive_pool_hands_out_lifo_and_recycles() {
    util::init_runtime();
    let addr = util::start_echo_server();
    let pool = StreamCallGatePool::new(PoolOptions::default());

    let first = pool.get_or_create_exclusive(addr, gate_creator(addr));
    let first_gate = first.gate().clone();
    drop(first); // Back into the free list.

    let second = pool.get_or_create_exclusive(addr, gate_creator(addr));
    assert!(
        first_gate.is_same(second.gate()),
        "the freshest free gate should be handed out first"
    );

    // An unhealthy gate must not be recycled.
    second.gate().set_unhealthy();
    drop(second);
    let third = pool.get_or_create_exclusive(addr, gate_creator(addr));
    assert!(!first_gate.is_same(third.gate()));
    assert!(third.healthy());

    drop(third);
    pool.stop();
    pool.join();
}

#[test]
fn dedicated_pool_never_caches() {
    util::init_runtime();
    let addr = util::start_echo_server();
    let pool = StreamCallGatePool::new(PoolOptions::default());

    let first = pool.get_or_create_dedicated(addr, gate_creator(addr));
    let first_gate = first.gate().clone();
    drop(first); // Stopped and joined by the pool.
    assert!(!first_gate.healthy());

    let second = pool.get_or_create_dedicated(addr, gate_creator(addr));
    assert!(!first_gate.is_same(second.gate()));

    drop(second);
    pool.stop();
    pool.join();
}
