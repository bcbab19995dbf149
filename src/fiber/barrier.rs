//! A reusable phase barrier for fibers.

use super::{Condvar, Mutex};

/// A barrier in the style of `std::barrier`, usable from fibers and with an
/// optional per-phase completion function.
///
/// Each phase collects `expected` arrivals; the final arrival runs the
/// completion, resets the counter and releases every waiter of that phase.
pub struct Barrier {
    state: Mutex<State>,
    cv: Condvar,
}

struct State {
    count: isize,
    expected: isize,
    phase: u64,
    completion: Option<Box<dyn FnMut() + Send>>,
}

/// Proof of arrival at a particular phase, consumed by [`Barrier::wait`].
#[derive(Debug)]
pub struct ArrivalToken {
    phase: u64,
}

impl Barrier {
    /// Creates a barrier expecting `expected` arrivals per phase.
    pub fn new(expected: isize) -> Barrier {
        Barrier::with_completion_option(expected, None)
    }

    /// Creates a barrier running `completion` on each phase's final arrival.
    pub fn with_completion<F>(expected: isize, completion: F) -> Barrier
    where
        F: FnMut() + Send + 'static,
    {
        Barrier::with_completion_option(expected, Some(Box::new(completion)))
    }

    fn with_completion_option(
        expected: isize,
        completion: Option<Box<dyn FnMut() + Send>>,
    ) -> Barrier {
        assert!(expected > 0);
        Barrier {
            state: Mutex::new(State {
                count: expected,
                expected,
                phase: 0,
                completion,
            }),
            cv: Condvar::new(),
        }
    }

    /// Arrives at the barrier, decrementing the phase counter by `update`.
    pub fn arrive(&self, update: isize) -> ArrivalToken {
        let mut state = self.state.lock();
        self.arrive_locked(&mut state, update)
    }

    /// Blocks until the phase `token` was issued for has completed.
    pub fn wait(&self, token: ArrivalToken) {
        let guard = self.state.lock();
        let _guard = self
            .cv
            .wait_while(guard, |state| state.phase == token.phase);
    }

    /// Arrives and waits for the current phase to complete.
    pub fn arrive_and_wait(&self) {
        self.wait(self.arrive(1));
    }

    /// Arrives and permanently drops this participant from subsequent
    /// phases.
    pub fn arrive_and_drop(&self) {
        let mut state = self.state.lock();
        state.expected -= 1;
        let _ = self.arrive_locked(&mut state, 1);
    }

    fn arrive_locked(&self, state: &mut State, update: isize) -> ArrivalToken {
        assert!(state.count >= update, "too many arrivals this phase");
        state.count -= update;
        let token = ArrivalToken { phase: state.phase };
        if state.count == 0 {
            if let Some(completion) = state.completion.as_mut() {
                completion();
            }
            state.phase += 1;
            state.count = state.expected;
            self.cv.notify_all();
        }
        token
    }
}
