//! Steady / system clocks and their coarse counterparts.
//!
//! The coarse clocks trade accuracy for speed: a dedicated updater thread
//! refreshes a pair of atomic timestamps roughly every 4 milliseconds, and
//! readers pay a single relaxed atomic load. The deviation from the
//! underlying clock is bounded by ~10ms.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Once, OnceLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Interval between two refreshes of the coarse timestamps.
const UPDATE_INTERVAL: Duration = Duration::from_millis(4);

/// Reads the steady (monotonic) clock.
pub fn steady_now() -> Instant {
    Instant::now()
}

/// Reads the system (wall) clock.
pub fn system_now() -> SystemTime {
    SystemTime::now()
}

/// A cheap monotonic timestamp produced by [`coarse_steady_now`].
///
/// Represented as nanoseconds since an unspecified per-process epoch so it
/// can be stored in an `AtomicU64`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CoarseInstant(u64);

impl CoarseInstant {
    /// Nanoseconds since the process epoch.
    pub fn as_nanos(self) -> u64 {
        self.0
    }

    /// Rebuilds an instant from a value previously obtained via
    /// [`CoarseInstant::as_nanos`].
    pub fn from_nanos(nanos: u64) -> CoarseInstant {
        CoarseInstant(nanos)
    }

    /// The instant `duration` later than `self`, saturating on overflow.
    pub fn saturating_add(self, duration: Duration) -> CoarseInstant {
        CoarseInstant(self.0.saturating_add(duration.as_nanos() as u64))
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: CoarseInstant) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

/// Reads the coarse steady clock.
///
/// The result may lag [`steady_now`] by up to ~10ms.
pub fn coarse_steady_now() -> CoarseInstant {
    ensure_updater_started();
    CoarseInstant(COARSE_STEADY_NANOS.load(Ordering::Relaxed))
}

/// Reads the coarse system clock.
///
/// The result may lag [`system_now`] by up to ~10ms.
pub fn coarse_system_now() -> SystemTime {
    ensure_updater_started();
    UNIX_EPOCH + Duration::from_nanos(COARSE_SYSTEM_NANOS.load(Ordering::Relaxed))
}

static COARSE_STEADY_NANOS: AtomicU64 = AtomicU64::new(0);
static COARSE_SYSTEM_NANOS: AtomicU64 = AtomicU64::new(0);
static UPDATER_EXITING: AtomicBool = AtomicBool::new(false);

fn steady_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

fn update_coarse_timestamps() {
    let steady = steady_epoch().elapsed().as_nanos() as u64;
    COARSE_STEADY_NANOS.store(steady, Ordering::Relaxed);
    let system = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as u64;
    COARSE_SYSTEM_NANOS.store(system, Ordering::Relaxed);
}

fn ensure_updater_started() {
    static STARTED: Once = Once::new();
    STARTED.call_once(|| {
        // Publish a valid timestamp before the first reader returns.
        update_coarse_timestamps();
        thread::Builder::new()
            .name("strand-coarse-clock".to_owned())
            .spawn(|| {
                while !UPDATER_EXITING.load(Ordering::Relaxed) {
                    thread::sleep(UPDATE_INTERVAL);
                    update_coarse_timestamps();
                }
            })
            .expect("failed to spawn coarse clock updater");
    });
}

/// Asks the updater thread to terminate. Called on runtime shutdown; the
/// coarse clocks keep returning the last published values afterwards.
pub(crate) fn stop_coarse_updater() {
    UPDATER_EXITING.store(true, Ordering::Relaxed);
}
