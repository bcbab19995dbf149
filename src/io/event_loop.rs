//! The event loop: readiness dispatch plus a deferred-task queue.

use std::cell::Cell;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use log::trace;
use slab::Slab;

use crate::fiber::{self, Fiber, Latch};
use crate::sys;

use super::timed_call::timed_call;
use super::{Descriptor, Ready, Token};

// One tick blocks at most this long, and handles at most this many events.
const POLL_TIMEOUT: Duration = Duration::from_millis(5);
const EVENTS_PER_POLL: usize = 128;

// Budget after which a single event handler or user task is logged as slow.
const SLOW_CALL_BUDGET: Duration = Duration::from_millis(5);

// The waker occupies a token no slab index will reach.
const WAKER_TOKEN: Token = Token(usize::MAX);

type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    // Id of the loop currently running on this thread, 0 if none.
    static CURRENT_LOOP: Cell<usize> = const { Cell::new(0) };
}

struct Entry {
    descriptor: Arc<dyn Descriptor>,
    enabled: bool,
}

/// An event loop owning descriptors and a queue of deferred user tasks.
///
/// One fiber runs [`run`](EventLoop::run); each iteration polls readiness
/// for up to 5ms, dispatches events to descriptor callbacks, drains the
/// user-task queue, and yields to the fiber scheduler.
pub struct EventLoop {
    id: usize,
    selector: sys::Selector,
    notifier: sys::Waker,
    descriptors: Mutex<Slab<Entry>>,
    tasks: Mutex<VecDeque<Task>>,
    exiting: AtomicBool,
}

impl EventLoop {
    /// Creates a loop with its selector and internal notifier.
    pub fn new() -> io::Result<EventLoop> {
        static NEXT_ID: AtomicUsize = AtomicUsize::new(1);
        let selector = sys::Selector::new()?;
        // The notifier's `on-readable` handling must stay synchronous to
        // avoid wake-up loss, so it is registered directly rather than as a
        // descriptor.
        let notifier = sys::Waker::new(&selector, WAKER_TOKEN)?;
        Ok(EventLoop {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            selector,
            notifier,
            descriptors: Mutex::new(Slab::new()),
            tasks: Mutex::new(VecDeque::new()),
            exiting: AtomicBool::new(false),
        })
    }

    /// Returns whether the calling fiber is this loop's own.
    pub fn is_current(&self) -> bool {
        CURRENT_LOOP.with(|c| c.get()) == self.id
    }

    /// Takes (shared) ownership of `descriptor`, optionally enabling it
    /// right away. Returns the token identifying the registration.
    pub fn attach_descriptor(
        &self,
        descriptor: Arc<dyn Descriptor>,
        enabled: bool,
    ) -> io::Result<Token> {
        let token = {
            let mut descriptors = self.descriptors.lock().expect("descriptor table poisoned");
            // `enabled` starts false; `enable_descriptor` flips it.
            Token(descriptors.insert(Entry {
                descriptor,
                enabled: false,
            }))
        };
        if enabled {
            if let Err(e) = self.enable_descriptor(token) {
                let mut descriptors = self.descriptors.lock().expect("descriptor table poisoned");
                descriptors.remove(token.0);
                return Err(e);
            }
        }
        Ok(token)
    }

    /// Starts polling the descriptor registered under `token`.
    pub fn enable_descriptor(&self, token: Token) -> io::Result<()> {
        let (fd, interest) = {
            let mut descriptors = self.descriptors.lock().expect("descriptor table poisoned");
            let entry = descriptors.get_mut(token.0).expect("unknown descriptor");
            assert!(!entry.enabled, "the descriptor has already been enabled");
            entry.enabled = true;
            (entry.descriptor.fd(), entry.descriptor.interest())
        };
        trace!("enabling descriptor fd #{} as {:?}", fd, token);
        self.selector.register(fd, token, interest)
    }

    /// Refreshes the registration of an enabled descriptor.
    pub fn rearm_descriptor(&self, token: Token) -> io::Result<()> {
        let (fd, interest) = {
            let descriptors = self.descriptors.lock().expect("descriptor table poisoned");
            let entry = descriptors.get(token.0).expect("unknown descriptor");
            assert!(entry.enabled, "the descriptor is not enabled");
            (entry.descriptor.fd(), entry.descriptor.interest())
        };
        self.selector.reregister(fd, token, interest)
    }

    /// Stops polling the descriptor. Must be called from the loop.
    pub fn disable_descriptor(&self, token: Token) -> io::Result<()> {
        assert!(
            self.is_current(),
            "this method must be called in event loop's context"
        );
        let fd = {
            let mut descriptors = self.descriptors.lock().expect("descriptor table poisoned");
            let entry = descriptors.get_mut(token.0).expect("unknown descriptor");
            assert!(entry.enabled, "the descriptor is not enabled");
            entry.enabled = false;
            entry.descriptor.fd()
        };
        trace!("disabling descriptor fd #{}", fd);
        self.selector.deregister(fd)
    }

    /// Drops the loop's reference to a disabled descriptor. Must be called
    /// from the loop.
    pub fn detach_descriptor(&self, token: Token) {
        assert!(
            self.is_current(),
            "this method must be called in event loop's context"
        );
        let mut descriptors = self.descriptors.lock().expect("descriptor table poisoned");
        let entry = descriptors.remove(token.0);
        assert!(
            !entry.enabled,
            "the descriptor must be disabled before calling this method"
        );
    }

    /// Schedules `cb` to run on the loop after the next event dispatch.
    pub fn add_task<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut tasks = self.tasks.lock().expect("task queue poisoned");
            tasks.push_back(Box::new(cb));
        }
        // Wake up the event loop to run our callback.
        let _ = self.notifier.wake();
    }

    /// Blocks the calling fiber until every task posted before this call
    /// has run.
    pub fn barrier(&self) {
        let latch = Arc::new(Latch::new(1));
        let latch2 = latch.clone();
        self.add_task(move || latch2.count_down(1));
        latch.wait();
    }

    /// The loop's main procedure; runs until [`stop`](EventLoop::stop).
    pub fn run(&self) {
        CURRENT_LOOP.with(|c| c.set(self.id));
        let mut events: sys::Events = Vec::with_capacity(EVENTS_PER_POLL);

        while !self.exiting.load(Ordering::Relaxed) {
            // May block if there's no event pending; woken early by the
            // notifier.
            self.wait_and_run_events(&mut events);

            // User callbacks run after descriptor callbacks each tick.
            timed_call(|| self.run_user_tasks(), SLOW_CALL_BUDGET, "user task drain");

            // The loop rarely saturates its worker; donating the rest of
            // the slice helps under load.
            fiber::yield_now();
        }

        CURRENT_LOOP.with(|c| c.set(0));
    }

    /// Asks the loop to exit and wakes it.
    pub fn stop(&self) {
        self.exiting.store(true, Ordering::Relaxed);
        let _ = self.notifier.wake();
    }

    fn wait_and_run_events(&self, events: &mut sys::Events) {
        if let Err(e) = self.selector.select(events, Some(POLL_TIMEOUT)) {
            panic!("unexpected: selector wait failed: {}", e);
        }
        let start = Instant::now();
        for event in events.iter() {
            let token = sys::unix::event::token(event);
            if token == WAKER_TOKEN {
                assert!(
                    !sys::unix::event::is_error(event),
                    "unexpected error on event loop notifier"
                );
                let _ = self.notifier.reset();
                continue;
            }

            let descriptor = {
                let descriptors = self.descriptors.lock().expect("descriptor table poisoned");
                match descriptors.get(token.0) {
                    Some(entry) if entry.enabled => Some(entry.descriptor.clone()),
                    // Detached (or disabled) between the poll and now.
                    _ => None,
                }
            };
            if let Some(descriptor) = descriptor {
                let ready = Ready::from_event(event);
                timed_call(
                    || descriptor.fire_events(ready, start),
                    SLOW_CALL_BUDGET,
                    "descriptor event handler",
                );
            }
        }
    }

    fn run_user_tasks(&self) {
        let mut pending = {
            let mut tasks = self.tasks.lock().expect("task queue poisoned");
            std::mem::take(&mut *tasks)
        };
        // We don't expect too many tasks in the queue, nor tasks that run
        // long.
        for task in pending.drain(..) {
            timed_call(task, SLOW_CALL_BUDGET, "user task");
        }
    }
}

struct LoopWorker {
    event_loop: Arc<EventLoop>,
    fiber: Mutex<Option<Fiber>>,
}

// (Scheduling group index, event loop index).
static LOOP_WORKERS: OnceLock<Vec<Vec<LoopWorker>>> = OnceLock::new();

/// Constructs and starts every event loop: `loops_per_group` per
/// scheduling group. Returns once all loops are serving.
pub fn start_all_event_loops(scheduling_groups: usize, loops_per_group: usize) -> io::Result<()> {
    assert!(scheduling_groups > 0 && loops_per_group > 0);
    let all_started = Arc::new(Latch::new((scheduling_groups * loops_per_group) as isize));

    let mut groups = Vec::with_capacity(scheduling_groups);
    for group_index in 0..scheduling_groups {
        let mut workers = Vec::with_capacity(loops_per_group);
        for _ in 0..loops_per_group {
            let event_loop = Arc::new(EventLoop::new()?);
            let started = all_started.clone();
            let fiber = {
                let event_loop = event_loop.clone();
                fiber::spawn_in_group(group_index, move || {
                    event_loop.add_task(move || started.count_down(1));
                    event_loop.run();
                })
            };
            workers.push(LoopWorker {
                event_loop,
                fiber: Mutex::new(Some(fiber)),
            });
        }
        groups.push(workers);
    }

    if LOOP_WORKERS.set(groups).is_err() {
        panic!("event loops started twice");
    }
    all_started.wait();
    Ok(())
}

fn loop_workers() -> &'static Vec<Vec<LoopWorker>> {
    LOOP_WORKERS.get().expect("event loops are not running")
}

// Integer hash spreading nearby fds across loops.
fn hash_fd(fd: i32) -> u32 {
    let xorshift = |n: u64, i: u64| n ^ (n >> i);
    let p = 0x5555_5555_5555_5555u64; // pattern of alternating 0 and 1
    let c = 17316035218449499591u64; // random uneven integer constant
    c.wrapping_mul(xorshift(p.wrapping_mul(xorshift(fd as u32 as u64, 32)), 32)) as u32
}

/// Returns the loop serving `fd` within `scheduling_group`.
///
/// Passing `-2` as `fd` selects a loop at random, for resources with no
/// descriptor of their own.
pub fn event_loop_for(scheduling_group: usize, fd: i32) -> Arc<EventLoop> {
    assert!(
        fd != 0 && fd != -1,
        "you're likely passing in an fd from an invalid handle"
    );
    let fd = if fd == -2 { rand::random::<i32>() } else { fd };
    let groups = loop_workers();
    assert!(scheduling_group < groups.len());
    let workers = &groups[scheduling_group];
    let index = hash_fd(fd) as usize % workers.len();
    workers[index].event_loop.clone()
}

/// Blocks until every loop has drained the tasks posted before this call.
pub fn all_event_loops_barrier() {
    let groups = loop_workers();
    let total: usize = groups.iter().map(|g| g.len()).sum();
    let latch = Arc::new(Latch::new(total as isize));
    for workers in groups {
        for worker in workers {
            let latch = latch.clone();
            worker.event_loop.add_task(move || latch.count_down(1));
        }
    }
    latch.wait();
}

/// Visits every running loop.
pub(crate) fn for_each_event_loop<F: FnMut(&Arc<EventLoop>)>(mut f: F) {
    if let Some(groups) = LOOP_WORKERS.get() {
        for workers in groups {
            for worker in workers {
                f(&worker.event_loop);
            }
        }
    }
}

/// Asks every loop to exit.
pub fn stop_all_event_loops() {
    for_each_event_loop(|event_loop| event_loop.stop());
}

/// Joins the fibers running the loops.
pub fn join_all_event_loops() {
    if let Some(groups) = LOOP_WORKERS.get() {
        for workers in groups {
            for worker in workers {
                let fiber = worker
                    .fiber
                    .lock()
                    .expect("loop worker poisoned")
                    .take();
                if let Some(fiber) = fiber {
                    fiber.join();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_run_and_barrier_waits() {
        let event_loop = Arc::new(EventLoop::new().unwrap());
        let runner = {
            let event_loop = event_loop.clone();
            std::thread::spawn(move || event_loop.run())
        };

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            event_loop.add_task(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        event_loop.barrier();
        assert_eq!(counter.load(Ordering::SeqCst), 10);

        event_loop.stop();
        runner.join().unwrap();
    }

    #[test]
    fn fd_hash_spreads() {
        let mut seen = std::collections::HashSet::new();
        for fd in 0..64 {
            seen.insert(hash_fd(fd) % 8);
        }
        // 64 sequential fds must not all collapse onto one loop.
        assert!(seen.len() > 2);
    }
}
