//! A FIFO work queue drained by a dedicated fiber.

use std::collections::VecDeque;
use std::sync::Arc;

use super::{spawn, Condvar, Fiber, Latch, Mutex};

type Job = Box<dyn FnOnce() + Send>;

/// Runs posted closures one at a time, in posting order, on one fiber.
///
/// Serializing through a queue is how callback-heavy components keep their
/// state single-threaded without holding locks across user code.
pub struct WorkQueue {
    inner: Arc<Inner>,
    done: Arc<Latch>,
    _worker: Fiber,
}

struct Inner {
    state: Mutex<State>,
    cv: Condvar,
}

#[derive(Default)]
struct State {
    jobs: VecDeque<Job>,
    stopped: bool,
}

impl WorkQueue {
    /// Creates the queue and its worker fiber in the caller's scheduling
    /// group.
    pub fn new() -> WorkQueue {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            cv: Condvar::new(),
        });
        let done = Arc::new(Latch::new(1));
        let worker = {
            let inner = inner.clone();
            let done = done.clone();
            spawn(move || {
                worker_proc(&inner);
                done.count_down(1);
            })
        };
        WorkQueue {
            inner,
            done,
            _worker: worker,
        }
    }

    /// Schedules `job` for execution.
    ///
    /// Must not be called after [`stop`](WorkQueue::stop).
    pub fn push<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        assert!(!state.stopped, "pushed into a stopped work queue");
        state.jobs.push_back(Box::new(job));
        self.inner.cv.notify_one();
    }

    /// Stops the queue. Jobs already posted still run.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        state.stopped = true;
        self.inner.cv.notify_all();
    }

    /// Waits until every posted job has run and the worker exited.
    ///
    /// Call [`stop`](WorkQueue::stop) first.
    pub fn join(&self) {
        self.done.wait();
    }
}

impl Default for WorkQueue {
    fn default() -> WorkQueue {
        WorkQueue::new()
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        // Let the worker fiber exit; pending jobs still run.
        self.stop();
    }
}

fn worker_proc(inner: &Inner) {
    loop {
        let job = {
            let guard = inner.state.lock();
            let mut guard = inner
                .cv
                .wait_while(guard, |s| s.jobs.is_empty() && !s.stopped);
            match guard.jobs.pop_front() {
                Some(job) => job,
                None => break, // Stopped and drained.
            }
        };
        job();
    }
}
