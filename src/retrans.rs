//! RFC 3315 §14 / RFC 8415 §15 retransmission backoff with jitter
//! (`spec.md` §4.3, component C3).

use std::time::{Duration, Instant};

use rand::RngCore;

use crate::clock::Clock;

/// Jitter base magnitude: 100 represents a factor of 0.1 (±10%), applied as
/// `value * rand_signed / 1000`.
pub const JITTER_MAGNITUDE: i32 = 100;

/// Which RFC 8415 exchange the parameters belong to, used only to select
/// the right constant table (`spec.md` §4.5 "Timeouts / defaults").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Solicit,
    Request,
    Confirm,
    Renew,
    Rebind,
    InformationRequest,
    Release,
    Decline,
}

/// IRT/MRT/MRC/MRD plus the random initial delay window, per message kind.
#[derive(Debug, Clone, Copy)]
pub struct RetransParams {
    pub irt_ms: u64,
    /// 0 means unbounded.
    pub mrt_ms: u64,
    /// 0 means infinite retries.
    pub mrc: u32,
    /// 0 means unbounded duration (no MRD timer armed).
    pub mrd_ms: u64,
    /// Upper bound (ms) of the uniform `[0, initial_delay_ms]` pre-send
    /// delay; 0 disables it.
    pub initial_delay_ms: u64,
}

impl MessageKind {
    /// Static defaults from `spec.md` §4.5. Renew/Rebind/Confirm MRD is
    /// dynamic (bounded by T2 / valid-lifetime / a fixed cap) and must be
    /// overridden by the caller via `RetransState::set_mrd`.
    pub fn default_params(self) -> RetransParams {
        match self {
            MessageKind::Solicit => RetransParams {
                irt_ms: 1_000,
                mrt_ms: 120_000,
                mrc: 0,
                mrd_ms: 0,
                initial_delay_ms: 1_000,
            },
            MessageKind::Request => RetransParams {
                irt_ms: 1_000,
                mrt_ms: 30_000,
                mrc: 10,
                mrd_ms: 0,
                initial_delay_ms: 0,
            },
            MessageKind::Confirm => RetransParams {
                irt_ms: 1_000,
                mrt_ms: 4_000,
                mrc: 0,
                mrd_ms: 10_000,
                initial_delay_ms: 0,
            },
            MessageKind::Renew => RetransParams {
                irt_ms: 10_000,
                mrt_ms: 600_000,
                mrc: 0,
                mrd_ms: 0,
                initial_delay_ms: 0,
            },
            MessageKind::Rebind => RetransParams {
                irt_ms: 10_000,
                mrt_ms: 600_000,
                mrc: 0,
                mrd_ms: 0,
                initial_delay_ms: 0,
            },
            MessageKind::InformationRequest => RetransParams {
                irt_ms: 1_000,
                mrt_ms: 120_000,
                mrc: 0,
                mrd_ms: 0,
                initial_delay_ms: 1_000,
            },
            MessageKind::Release => RetransParams {
                irt_ms: 1_000,
                mrt_ms: 0,
                mrc: 5,
                mrd_ms: 0,
                initial_delay_ms: 0,
            },
            MessageKind::Decline => RetransParams {
                irt_ms: 1_000,
                mrt_ms: 0,
                mrc: 5,
                mrd_ms: 0,
                initial_delay_ms: 0,
            },
        }
    }
}

fn jitter_draw(rng: &mut dyn RngCore, min: i32, max: i32) -> i64 {
    debug_assert!(min <= max);
    let span = (max - min) as u32 + 1;
    min as i64 + (rng.next_u32() % span) as i64
}

fn apply_jitter(value_ms: u64, rand_signed: i64) -> u64 {
    let delta = (value_ms as i64 * rand_signed) / 1000;
    (value_ms as i64 + delta).max(0) as u64
}

/// Mutable backoff state for one in-flight exchange (Solicit, Request, ...).
/// Mirrors the fields in `spec.md` §3 "Retransmission State".
#[derive(Debug, Clone)]
pub struct RetransState {
    pub start: Option<Instant>,
    pub count: u32,
    /// Pre-send delay remaining, ms; zero once armed for real.
    pub delay_ms: u64,
    pub jitter: i32,
    pub duration_ms: u64,
    pub deadline: Option<Instant>,
    pub timeout_ms: u64,
    pub mrt_ms: u64,
    pub mrc: u32,
}

impl RetransState {
    pub fn new(params: RetransParams) -> Self {
        Self {
            start: None,
            count: 0,
            delay_ms: params.initial_delay_ms,
            jitter: JITTER_MAGNITUDE,
            duration_ms: params.mrd_ms,
            deadline: None,
            timeout_ms: params.irt_ms,
            mrt_ms: params.mrt_ms,
            mrc: params.mrc,
        }
    }

    /// Override MRD with a value computed from lease state (T2, valid
    /// lifetime), for Renew/Rebind.
    pub fn set_mrd(&mut self, mrd_ms: u64) {
        self.duration_ms = mrd_ms;
    }

    /// RFC 3315 §17.1.2 initial pre-send delay. Returns the absolute
    /// deadline at which the caller should proceed to `first_arm`; `None`
    /// if there is no delay to wait out.
    pub fn arm_initial_delay(&mut self, clock: &dyn Clock, rng: &mut dyn RngCore) -> Option<Instant> {
        if self.delay_ms == 0 {
            return None;
        }
        let rand_signed = jitter_draw(rng, -self.jitter, self.jitter);
        let wait = apply_jitter(self.delay_ms, rand_signed);
        Some(clock.now() + Duration::from_millis(wait))
    }

    /// Called once the initial delay has fired (or was never needed).
    /// `strictly_positive` selects the Selecting-specific RAND range
    /// `(0, +jitter]` per RFC 3315 §17.1.2; all other states use the
    /// symmetric `[-jitter, +jitter]` range.
    pub fn first_arm(
        &mut self,
        clock: &dyn Clock,
        rng: &mut dyn RngCore,
        strictly_positive: bool,
    ) -> Instant {
        self.delay_ms = 0;
        let now = clock.now();
        self.start = Some(now);
        let (min, max) = if strictly_positive {
            (1, self.jitter)
        } else {
            (-self.jitter, self.jitter)
        };
        let rand_signed = jitter_draw(rng, min, max);
        self.timeout_ms = apply_jitter(self.timeout_ms, rand_signed);
        self.count = 1;
        let deadline = now + Duration::from_millis(self.timeout_ms);
        self.deadline = Some(deadline);
        deadline
    }

    /// RTn = 2*RTn-1 + RAND*RTn-1, clamped to MRT. Returns `None` once MRC
    /// has been exhausted (caller should treat this as exchange failure).
    pub fn advance(&mut self, clock: &dyn Clock, rng: &mut dyn RngCore) -> Option<Instant> {
        if self.mrc > 0 && self.count >= self.mrc {
            return None;
        }
        let rand_signed = jitter_draw(rng, -self.jitter, self.jitter);
        let delta = (self.timeout_ms as i64 * rand_signed) / 1000;
        let mut rt = (self.timeout_ms as i64 * 2 + delta).max(0) as u64;
        if self.mrt_ms > 0 && rt > self.mrt_ms {
            let rand_signed_mrt = jitter_draw(rng, -self.jitter, self.jitter);
            rt = apply_jitter(self.mrt_ms, rand_signed_mrt);
        }
        self.timeout_ms = rt;
        self.count += 1;
        let deadline = clock.now() + Duration::from_millis(self.timeout_ms);
        self.deadline = Some(deadline);
        Some(deadline)
    }

    /// Clears all backoff state; xid clearing is the FSM's responsibility.
    pub fn disarm(&mut self) {
        self.start = None;
        self.count = 0;
        self.delay_ms = 0;
        self.duration_ms = 0;
        self.deadline = None;
        self.timeout_ms = 0;
        self.mrt_ms = 0;
        self.mrc = 0;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Elapsed time since `start`, clamped, expressed in 1/100s units as
    /// used by the DHCPv6 Elapsed-Time option (`spec.md` §4.4 `uptime`).
    pub fn elapsed_hundredths(&self, clock: &dyn Clock, clamp: u16) -> u16 {
        let Some(start) = self.start else { return 0 };
        let elapsed = clock.now().saturating_duration_since(start);
        let hundredths = elapsed.as_millis() / 10;
        hundredths.min(u128::from(clamp)) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;

    /// Deterministic `RngCore` that always yields `0`, so `jitter_draw`
    /// always lands on `min`.
    struct ZeroRng;
    impl RngCore for ZeroRng {
        fn next_u32(&mut self) -> u32 {
            0
        }
        fn next_u64(&mut self) -> u64 {
            0
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0);
        }
    }

    #[test]
    fn selecting_first_rt_is_strictly_greater_than_irt() {
        let clock = MonotonicClock;
        let mut rng = ZeroRng;
        let mut state = RetransState::new(MessageKind::Solicit.default_params());
        state.first_arm(&clock, &mut rng, true);
        // strictly_positive range is [1, jitter], ZeroRng picks the min (1).
        assert!(state.timeout_ms > 1_000);
    }

    #[test]
    fn non_selecting_first_rt_can_be_negative_jitter() {
        let clock = MonotonicClock;
        // ZeroRng always yields 0 -> jitter_draw picks the minimum of the
        // range, i.e. -jitter for the symmetric case.
        let mut rng = ZeroRng;
        let mut state = RetransState::new(MessageKind::Request.default_params());
        state.first_arm(&clock, &mut rng, false);
        assert!(state.timeout_ms < 1_000);
    }

    #[test]
    fn advance_respects_mrt_clamp() {
        let clock = MonotonicClock;
        let mut rng = ZeroRng;
        let mut params = MessageKind::Solicit.default_params();
        params.mrt_ms = 5_000;
        let mut state = RetransState::new(params);
        state.first_arm(&clock, &mut rng, true);
        for _ in 0..10 {
            state.advance(&clock, &mut rng);
        }
        assert!(state.timeout_ms as f64 <= 5_000.0 * 1.1 + 1.0);
    }

    #[test]
    fn advance_stops_at_mrc() {
        let clock = MonotonicClock;
        let mut rng = ZeroRng;
        let mut params = MessageKind::Request.default_params();
        params.mrc = 3;
        let mut state = RetransState::new(params);
        state.first_arm(&clock, &mut rng, false);
        assert!(state.advance(&clock, &mut rng).is_some());
        assert!(state.advance(&clock, &mut rng).is_some());
        assert!(state.advance(&clock, &mut rng).is_none());
    }

    #[test]
    fn disarm_zeroes_state() {
        let clock = MonotonicClock;
        let mut rng = ZeroRng;
        let mut state = RetransState::new(MessageKind::Solicit.default_params());
        state.first_arm(&clock, &mut rng, true);
        state.disarm();
        assert!(!state.is_armed());
        assert_eq!(state.count, 0);
    }

    #[test]
    fn elapsed_time_clamps_at_65535() {
        struct FixedClock(std::cell::Cell<Instant>);
        impl Clock for FixedClock {
            fn now(&self) -> Instant {
                self.0.get()
            }
        }
        let base = Instant::now();
        let clock = FixedClock(std::cell::Cell::new(base));
        let mut rng = ZeroRng;
        let mut state = RetransState::new(MessageKind::Request.default_params());
        state.first_arm(&clock, &mut rng, false);
        clock.0.set(base + Duration::from_secs(10_000));
        assert_eq!(state.elapsed_hundredths(&clock, 65535), 65535);
    }
}
