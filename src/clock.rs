use std::time::{Duration, Instant};

/// Monotonic time source. Abstracted behind a trait so FSM/retransmission
/// tests can drive time deterministically instead of sleeping.
pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Opaque handle to a single in-flight timer. Comparing two handles tells
/// you whether a callback still corresponds to the timer you armed, which
/// guards against spurious/late wakeups firing against a timer that was
/// since replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

/// A single-slot cancellable timer, per `spec.md` §4.1: "at most one
/// in-flight FSM timer per Device; setting a new timeout cancels any prior."
///
/// This only tracks *when* the timer should fire; the reactor (`reactor.rs`)
/// is responsible for actually waking the event loop at that deadline.
#[derive(Debug, Default)]
pub struct Timer {
    next_id: u64,
    armed: Option<(TimerId, Instant)>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer for `deadline`, cancelling whatever was previously
    /// armed. Returns the new handle.
    pub fn arm(&mut self, deadline: Instant) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.armed = Some((id, deadline));
        id
    }

    pub fn arm_after(&mut self, clock: &dyn Clock, delay: Duration) -> TimerId {
        self.arm(clock.now() + delay)
    }

    /// Cancel any in-flight timer. Synchronous: once this returns, no
    /// previously-armed handle will be considered live by `is_current`.
    pub fn cancel(&mut self) {
        self.armed = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.armed.map(|(_, d)| d)
    }

    pub fn is_current(&self, id: TimerId) -> bool {
        matches!(self.armed, Some((current, _)) if current == id)
    }

    /// True once `clock.now() >= deadline`. Callers must re-check against
    /// the clock rather than trusting a bare wakeup, since the reactor may
    /// wake early.
    pub fn is_due(&self, clock: &dyn Clock) -> bool {
        self.armed
            .is_some_and(|(_, deadline)| clock.now() >= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rearming_invalidates_previous_handle() {
        let mut timer = Timer::new();
        let first = timer.arm(Instant::now());
        let second = timer.arm(Instant::now());
        assert_ne!(first, second);
        assert!(!timer.is_current(first));
        assert!(timer.is_current(second));
    }

    #[test]
    fn cancel_clears_armed_state() {
        let mut timer = Timer::new();
        let id = timer.arm(Instant::now());
        timer.cancel();
        assert!(!timer.is_current(id));
        assert!(timer.deadline().is_none());
    }

    #[test]
    fn is_due_requires_clock_past_deadline() {
        struct FixedClock(std::cell::Cell<Instant>);
        impl Clock for FixedClock {
            fn now(&self) -> Instant {
                self.0.get()
            }
        }
        let base = Instant::now();
        let clock = FixedClock(std::cell::Cell::new(base));
        let mut timer = Timer::new();
        timer.arm(base + Duration::from_millis(100));
        assert!(!timer.is_due(&clock));
        clock.0.set(base + Duration::from_millis(150));
        assert!(timer.is_due(&clock));
    }
}
