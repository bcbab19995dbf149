use std::time::{Duration, Instant};

use log::warn;

/// Runs `f`, logging a warning if it overruns `tolerance`.
///
/// `label` should not be capitalized; it completes the sentence
/// "`label` cost N ms".
pub fn timed_call<F: FnOnce()>(f: F, tolerance: Duration, label: &str) {
    let start = Instant::now();
    f();
    let used = start.elapsed();
    if used > tolerance {
        warn!("{} cost {} millisecond(s).", label, used.as_millis());
    }
}
