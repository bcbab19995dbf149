//! One-shot and periodic timers.
//!
//! A process-wide worker thread keeps a deadline-ordered heap. Callbacks
//! run on the worker, so they must be brief; anything that may block is
//! expected to bounce to a fiber first (the RPC completion paths do).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Identifies a timer for [`kill_timer`].
pub type TimerId = u64;

enum Callback {
    OneShot(Option<Box<dyn FnOnce() + Send>>),
    Periodic(Box<dyn FnMut() + Send>),
}

struct Entry {
    at: Instant,
    id: TimerId,
    interval: Option<Duration>,
    callback: Callback,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Entry) -> bool {
        self.at == other.at && self.id == other.id
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Entry) -> std::cmp::Ordering {
        self.at.cmp(&other.at).then(self.id.cmp(&other.id))
    }
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Reverse<Entry>>,
    // IDs that are still armed. An ID missing here while its heap entry is
    // pending means the timer was killed.
    live: HashSet<TimerId>,
    next_id: TimerId,
    stopping: bool,
}

struct TimerWorker {
    state: Mutex<State>,
    cv: Condvar,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

static WORKER: OnceLock<&'static TimerWorker> = OnceLock::new();

fn worker() -> &'static TimerWorker {
    WORKER.get_or_init(|| {
        let worker: &'static TimerWorker = Box::leak(Box::new(TimerWorker {
            state: Mutex::new(State {
                next_id: 1,
                ..State::default()
            }),
            cv: Condvar::new(),
            thread: Mutex::new(None),
        }));
        let handle = std::thread::Builder::new()
            .name("strand-timer".to_owned())
            .spawn(move || worker_proc(worker))
            .expect("failed to spawn timer worker");
        *worker.thread.lock().expect("timer thread poisoned") = Some(handle);
        worker
    })
}

fn worker_proc(worker: &'static TimerWorker) {
    let mut state = worker.state.lock().expect("timer state poisoned");
    loop {
        if state.stopping {
            break;
        }
        let now = Instant::now();
        let next_due = state.heap.peek().map(|entry| entry.0.at);
        match next_due {
            None => {
                state = worker.cv.wait(state).expect("timer state poisoned");
            }
            Some(at) if at > now => {
                state = worker
                    .cv
                    .wait_timeout(state, at - now)
                    .expect("timer state poisoned")
                    .0;
            }
            Some(_) => {
                let Reverse(mut entry) = state.heap.pop().expect("peeked entry vanished");
                if !state.live.contains(&entry.id) {
                    continue; // Killed while pending.
                }
                match entry.callback {
                    Callback::OneShot(ref mut cb) => {
                        state.live.remove(&entry.id);
                        let cb = cb.take().expect("one-shot timer fired twice");
                        drop(state);
                        cb();
                        state = worker.state.lock().expect("timer state poisoned");
                    }
                    Callback::Periodic(ref mut cb) => {
                        drop(state);
                        cb();
                        state = worker.state.lock().expect("timer state poisoned");
                        if state.live.contains(&entry.id) {
                            let interval =
                                entry.interval.expect("periodic timer without interval");
                            entry.at += interval;
                            state.heap.push(Reverse(entry));
                        }
                    }
                }
            }
        }
    }
}

fn arm(at: Instant, interval: Option<Duration>, callback: Callback) -> TimerId {
    let worker = worker();
    let mut state = worker.state.lock().expect("timer state poisoned");
    let id = state.next_id;
    state.next_id += 1;
    state.live.insert(id);
    state.heap.push(Reverse(Entry {
        at,
        id,
        interval,
        callback,
    }));
    worker.cv.notify_one();
    id
}

/// Schedules `cb` to run once at `at`.
///
/// One-shot timers disarm themselves after firing; [`kill_timer`] before
/// that cancels the callback.
pub fn set_timer<F>(at: Instant, cb: F) -> TimerId
where
    F: FnOnce() + Send + 'static,
{
    arm(at, None, Callback::OneShot(Some(Box::new(cb))))
}

/// Schedules `cb` to run at `at` and every `interval` after, until killed.
pub fn set_periodic_timer<F>(at: Instant, interval: Duration, cb: F) -> TimerId
where
    F: FnMut() + Send + 'static,
{
    assert!(interval > Duration::ZERO);
    arm(at, Some(interval), Callback::Periodic(Box::new(cb)))
}

/// Cancels a timer.
///
/// A callback already running is not waited for; a pending one will not
/// fire.
pub fn kill_timer(id: TimerId) {
    let worker = worker();
    let mut state = worker.state.lock().expect("timer state poisoned");
    state.live.remove(&id);
    // Heap entries of killed timers are skipped lazily on expiry.
}

/// Asks the timer worker to exit. Part of runtime shutdown.
///
/// Timers still pending — or armed afterwards — never fire.
pub fn stop() {
    if let Some(worker) = WORKER.get() {
        let mut state = worker.state.lock().expect("timer state poisoned");
        state.stopping = true;
        worker.cv.notify_all();
    }
}

/// Waits for the timer worker to finish. Call [`stop`] first.
pub fn join() {
    if let Some(worker) = WORKER.get() {
        let handle = worker.thread.lock().expect("timer thread poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}
