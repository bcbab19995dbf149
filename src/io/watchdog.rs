//! Liveness probing for event loops.

use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{error, trace};

use crate::fiber::Latch;

use super::EventLoop;

/// Tuning for the [`Watchdog`].
#[derive(Debug, Clone)]
pub struct WatchdogOptions {
    /// Interval between two probe rounds.
    pub check_interval: Duration,
    /// How long a loop may take to run the probe before it is declared
    /// unresponsive. Must not exceed `check_interval`.
    pub max_tolerable_delay: Duration,
    /// Abort the process on an unresponsive loop instead of logging.
    pub crash_on_unresponsive: bool,
}

impl Default for WatchdogOptions {
    fn default() -> WatchdogOptions {
        WatchdogOptions {
            check_interval: Duration::from_millis(10_000),
            max_tolerable_delay: Duration::from_millis(5_000),
            crash_on_unresponsive: false,
        }
    }
}

/// Periodically posts a trivial task to every watched loop and escalates
/// when one fails to run it in time.
///
/// Runs on its own OS thread so that it stays responsive precisely when
/// the loops are not. Stoppable and joinable independently of them.
pub struct Watchdog {
    options: WatchdogOptions,
    watched: Vec<Arc<EventLoop>>,
    exiting: Arc<AtomicBool>,
    exiting_latch: Arc<Latch>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Watchdog {
    /// Creates a watchdog with nothing to watch yet.
    pub fn new(options: WatchdogOptions) -> Watchdog {
        assert!(
            options.check_interval >= options.max_tolerable_delay,
            "check interval must be at least the maximum tolerable delay"
        );
        Watchdog {
            options,
            watched: Vec::new(),
            exiting: Arc::new(AtomicBool::new(false)),
            exiting_latch: Arc::new(Latch::new(1)),
            worker: Mutex::new(None),
        }
    }

    /// Adds a loop to watch. Must be called before [`start`](Watchdog::start).
    pub fn add_event_loop(&mut self, watched: Arc<EventLoop>) {
        self.watched.push(watched);
    }

    /// Starts the prober thread.
    pub fn start(&self) {
        let options = self.options.clone();
        let watched = self.watched.clone();
        let exiting = self.exiting.clone();
        let exiting_latch = self.exiting_latch.clone();
        let handle = thread::Builder::new()
            .name("strand-watchdog".to_owned())
            .spawn(move || worker_proc(options, watched, exiting, exiting_latch))
            .expect("failed to spawn watchdog");
        *self.worker.lock().expect("watchdog worker poisoned") = Some(handle);
    }

    /// Asks the prober to exit; it abandons any in-progress wait.
    pub fn stop(&self) {
        if !self.exiting.swap(true, Ordering::Relaxed) {
            self.exiting_latch.count_down(1);
        }
    }

    /// Waits for the prober thread to finish.
    pub fn join(&self) {
        let handle = self
            .worker
            .lock()
            .expect("watchdog worker poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn worker_proc(
    options: WatchdogOptions,
    watched: Vec<Arc<EventLoop>>,
    exiting: Arc<AtomicBool>,
    exiting_latch: Arc<Latch>,
) {
    let mut next_try = std::time::Instant::now();

    while !exiting.load(Ordering::Relaxed) {
        let wait_until = std::time::Instant::now() + options.max_tolerable_delay;
        // When we don't crash on a miss, an `acked` latch can be counted
        // down after we've moved on; shared ownership keeps that sound.
        let acked: Vec<_> = watched
            .iter()
            .map(|event_loop| {
                let latch = Arc::new(Latch::new(1));
                let posted = latch.clone();
                event_loop.add_task(move || posted.count_down(1));
                latch
            })
            .collect();

        // Deliberately a second loop: waiting inline would delay the
        // subsequent posts.
        for (index, latch) in acked.iter().enumerate() {
            let responsive =
                latch.wait_until(wait_until) || exiting.load(Ordering::Relaxed);
            if !responsive {
                if options.crash_on_unresponsive {
                    error!(
                        "event loop #{} is likely unresponsive, crashing the program",
                        index
                    );
                    process::abort();
                } else {
                    error!("event loop #{} is likely unresponsive, overloaded?", index);
                }
            }
        }
        trace!("watchdog: life is good");

        // Sleep until the next round starts.
        next_try += options.check_interval;
        exiting_latch.wait_until(next_try);
    }
}
