//! Process-level startup and shutdown.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Once, OnceLock};

use log::info;

use crate::io::{self, Watchdog, WatchdogOptions};
use crate::{clock, fiber, rpc};

/// Everything [`start`] needs to know; the defaults are safe.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Number of scheduling groups to partition workers into.
    pub scheduling_groups: usize,
    /// Event loops constructed per scheduling group. The default is
    /// normally sufficient.
    pub event_loops_per_scheduling_group: usize,
    /// Periodically test that the event loops are responsive.
    pub enable_watchdog: bool,
    /// Watchdog tuning.
    pub watchdog: WatchdogOptions,
    /// A second SIGINT/SIGQUIT/SIGTERM force-aborts the process.
    pub double_quit_aborts: bool,
}

impl Default for RuntimeOptions {
    fn default() -> RuntimeOptions {
        RuntimeOptions {
            scheduling_groups: 1,
            event_loops_per_scheduling_group: 1,
            enable_watchdog: true,
            watchdog: WatchdogOptions::default(),
            double_quit_aborts: true,
        }
    }
}

static QUIT_SIGNALS: AtomicU32 = AtomicU32::new(0);
static WATCHDOG: OnceLock<Option<Watchdog>> = OnceLock::new();

/// Whether a quit signal has been received since startup.
pub fn quit_requested() -> bool {
    QUIT_SIGNALS.load(Ordering::Relaxed) != 0
}

extern "C" fn on_quit_signal(_signal: libc::c_int) {
    // First signal: remembered, for the application to poll. Second:
    // somebody really wants us gone.
    if QUIT_SIGNALS.fetch_add(1, Ordering::Relaxed) >= 1 {
        std::process::abort();
    }
}

fn install_quit_handlers() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_quit_signal as extern "C" fn(libc::c_int) as usize;
        libc::sigemptyset(&mut action.sa_mask);
        for signal in [libc::SIGINT, libc::SIGQUIT, libc::SIGTERM] {
            libc::sigaction(signal, &action, std::ptr::null_mut());
        }
    }
}

/// Brings the runtime up if it is not yet: scheduling groups, event
/// loops, the watchdog, the coarse clock.
///
/// Idempotent; only the first call's `options` take effect.
pub fn ensure_started(options: &RuntimeOptions) {
    static STARTED: Once = Once::new();
    STARTED.call_once(|| {
        assert!(options.scheduling_groups > 0);
        if options.double_quit_aborts {
            install_quit_handlers();
        }
        fiber::set_scheduling_group_count(options.scheduling_groups);
        io::start_all_event_loops(
            options.scheduling_groups,
            options.event_loops_per_scheduling_group,
        )
        .expect("failed to start event loops");

        let watchdog = if options.enable_watchdog {
            let mut watchdog = Watchdog::new(options.watchdog.clone());
            io::for_each_event_loop(|event_loop| {
                watchdog.add_event_loop(event_loop.clone());
            });
            watchdog.start();
            Some(watchdog)
        } else {
            None
        };
        WATCHDOG.set(watchdog).ok().expect("runtime started twice");
        info!(
            "runtime up: {} scheduling group(s), {} event loop(s) each",
            options.scheduling_groups, options.event_loops_per_scheduling_group
        );
    });
}

/// Starts the runtime, runs `f` inside a fiber of scheduling group 0, and
/// tears everything down in reverse order once it returns.
pub fn start<F>(options: RuntimeOptions, f: F)
where
    F: FnOnce() + Send + 'static,
{
    ensure_started(&options);
    fiber::spawn_in_group(0, f).join();
    shutdown();
}

/// Stops and joins pools, the watchdog, loops, the timer worker, and the
/// coarse clock, in that order.
pub fn shutdown() {
    static DONE: Once = Once::new();
    DONE.call_once(|| {
        rpc::gate_pool::stop_all_global_pools();
        // Joining pools needs the loops still alive (gate teardown posts
        // loop tasks), so pools go first, completely.
        let join_pools = fiber::spawn(rpc::gate_pool::join_all_global_pools);
        join_pools.join();

        if let Some(Some(watchdog)) = WATCHDOG.get() {
            watchdog.stop();
            watchdog.join();
        }
        io::stop_all_event_loops();
        io::join_all_event_loops();
        fiber::timer::stop();
        fiber::timer::join();
        clock::stop_coarse_updater();
        info!("runtime down");
    });
}
