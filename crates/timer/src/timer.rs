//! Relay countdown: the single "keep the relay on until T" deadline and its
//! transition rules.
//!
//! Every caller (button interrupt, HTTP handlers, the scheduler tick) goes
//! through lock-free atomics, so none of them can block another.  Only
//! [`TimerState::tick`] decides that the relay changes state, and only the
//! scheduler calls it; everybody else merely requests a new deadline.
//!
//! ## Deadline state machine
//!
//! ```text
//!            increment / set_absolute
//!  Idle ─────────────────────────────▶ Until(t) ──[tick: now > t]──▶ Idle
//!   ▲                                     │
//!   │                                  cancel
//!   │                                     ▼
//!   └──────────────[tick]──────────── ExpireNow
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Tag bit marking an encoded `Deadline::Until`.
const UNTIL_TAG: u64 = 1 << 63;
const IDLE: u64 = 0;
const EXPIRE_NOW: u64 = 1;

/// Largest timestamp representable next to the tag bit.
pub const MAX_TIMESTAMP_MS: u64 = UNTIL_TAG - 1;

// ---------------------------------------------------------------------------
// Deadline
// ---------------------------------------------------------------------------

/// When the relay should switch off, in the monotonic millisecond domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Timer inactive, relay off.
    Idle,
    /// Relay stays on until this timestamp.
    Until(u64),
    /// Switch off on the next tick.
    ExpireNow,
}

impl Deadline {
    /// Clamp into the encodable range.
    fn until(t: u64) -> Self {
        Self::Until(t.min(MAX_TIMESTAMP_MS))
    }

    fn encode(self) -> u64 {
        match self {
            Self::Idle => IDLE,
            Self::ExpireNow => EXPIRE_NOW,
            Self::Until(t) => UNTIL_TAG | (t & MAX_TIMESTAMP_MS),
        }
    }

    fn decode(raw: u64) -> Self {
        if raw & UNTIL_TAG != 0 {
            Self::Until(raw & MAX_TIMESTAMP_MS)
        } else if raw == EXPIRE_NOW {
            Self::ExpireNow
        } else {
            Self::Idle
        }
    }
}

// ---------------------------------------------------------------------------
// Tick outcome
// ---------------------------------------------------------------------------

/// What the scheduler has to do to the hardware after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing scheduled.
    Idle,
    /// Deadline unchanged since the last tick, or changed to a value that is
    /// neither running nor overdue yet.
    Unchanged,
    /// A new deadline in the future was observed: relay on, acknowledge.
    Armed { remaining_ms: u64 },
    /// Deadline passed or expiry requested: relay off, state reset.
    Expired,
}

/// Snapshot used by the status page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerStatus {
    pub on: bool,
    pub remaining_secs: u64,
}

// ---------------------------------------------------------------------------
// Timer state
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct TimerState {
    increment_ms: u64,
    run_until: AtomicU64,
    /// Written by `tick` only.
    last_run_until: AtomicU64,
}

impl TimerState {
    pub fn new(increment: Duration) -> Self {
        Self {
            increment_ms: u64::try_from(increment.as_millis()).unwrap_or(MAX_TIMESTAMP_MS),
            run_until: AtomicU64::new(IDLE),
            last_run_until: AtomicU64::new(IDLE),
        }
    }

    pub fn increment_ms(&self) -> u64 {
        self.increment_ms
    }

    pub fn run_until(&self) -> Deadline {
        Deadline::decode(self.run_until.load(Ordering::Acquire))
    }

    pub fn last_run_until(&self) -> Deadline {
        Deadline::decode(self.last_run_until.load(Ordering::Acquire))
    }

    pub fn is_idle(&self) -> bool {
        self.run_until() == Deadline::Idle
    }

    /// Add one increment.  An inactive or overdue timer restarts from `now`;
    /// a running one is extended, so repeated presses stack.
    ///
    /// Safe to call from the button interrupt: a compare-and-swap loop on a
    /// single word, no allocation, no lock.
    pub fn increment(&self, now: u64) -> Deadline {
        let inc = self.increment_ms;
        let next = move |current: Deadline| match current {
            Deadline::Until(t) if t > now => Deadline::until(t.saturating_add(inc)),
            _ => Deadline::until(now.saturating_add(inc)),
        };
        let (Ok(prev) | Err(prev)) =
            self.run_until
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                    Some(next(Deadline::decode(raw)).encode())
                });
        next(Deadline::decode(prev))
    }

    /// Run for exactly `seconds` from `now`.  Zero or negative values expire
    /// the timer on the next tick.
    pub fn set_absolute(&self, now: u64, seconds: i64) -> Deadline {
        let deadline = match u64::try_from(seconds) {
            Ok(secs) if secs > 0 => {
                Deadline::until(now.saturating_add(secs.saturating_mul(1000)))
            }
            _ => Deadline::ExpireNow,
        };
        self.run_until.store(deadline.encode(), Ordering::Release);
        deadline
    }

    /// Request switch-off.  Resolved by the next tick, never synchronously.
    pub fn cancel(&self) {
        self.run_until.store(EXPIRE_NOW, Ordering::Release);
    }

    /// Authoritative transition.  Scheduler only.
    pub fn tick(&self, now: u64) -> TickOutcome {
        let current = self.run_until();

        let overdue = match current {
            Deadline::Idle => return TickOutcome::Idle,
            Deadline::ExpireNow => true,
            Deadline::Until(t) => now > t,
        };

        if overdue {
            // A press that lands between the load and the swap keeps its new
            // deadline; the next tick arms it again.
            let _ = self.run_until.compare_exchange(
                current.encode(),
                IDLE,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            self.last_run_until.store(IDLE, Ordering::Release);
            return TickOutcome::Expired;
        }

        if current == self.last_run_until() {
            return TickOutcome::Unchanged;
        }
        self.last_run_until.store(current.encode(), Ordering::Release);

        match current {
            Deadline::Until(t) if t > now => TickOutcome::Armed {
                remaining_ms: t - now,
            },
            _ => TickOutcome::Unchanged,
        }
    }

    pub fn status(&self, now: u64) -> TimerStatus {
        match self.run_until() {
            Deadline::Until(t) if t > now => TimerStatus {
                on: true,
                remaining_secs: (t - now) / 1000,
            },
            _ => TimerStatus {
                on: false,
                remaining_secs: 0,
            },
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn timer() -> TimerState {
        TimerState::new(Duration::from_secs(30))
    }

    // -- Deadline encoding -------------------------------------------------

    #[test]
    fn deadline_one_millisecond_is_not_expire_now() {
        assert_eq!(Deadline::decode(Deadline::Until(1).encode()), Deadline::Until(1));
        assert_eq!(Deadline::decode(Deadline::ExpireNow.encode()), Deadline::ExpireNow);
        assert_eq!(Deadline::decode(Deadline::Idle.encode()), Deadline::Idle);
    }

    #[test]
    fn deadline_zero_timestamp_is_not_idle() {
        assert_eq!(Deadline::decode(Deadline::Until(0).encode()), Deadline::Until(0));
    }

    // -- increment ---------------------------------------------------------

    #[test]
    fn increment_from_idle_starts_at_now() {
        let t = timer();
        assert_eq!(t.increment(1000), Deadline::Until(31_000));
        assert_eq!(t.run_until(), Deadline::Until(31_000));
    }

    #[test]
    fn increments_stack_while_running() {
        let t = timer();
        t.increment(1000);
        t.increment(1000);
        assert_eq!(t.run_until(), Deadline::Until(61_000));
    }

    #[test]
    fn increment_after_expiry_restarts_from_now() {
        let t = timer();
        t.increment(1000); // until 31_000
        assert_eq!(t.increment(40_000), Deadline::Until(70_000));
    }

    #[test]
    fn increment_at_exact_deadline_restarts() {
        let t = timer();
        t.increment(1000);
        assert_eq!(t.increment(31_000), Deadline::Until(61_000));
    }

    #[test]
    fn increment_overrides_pending_cancel() {
        let t = timer();
        t.increment(1000);
        t.cancel();
        assert_eq!(t.increment(2000), Deadline::Until(32_000));
    }

    // -- set_absolute ------------------------------------------------------

    #[test]
    fn set_absolute_replaces_deadline() {
        let t = timer();
        t.increment(0);
        t.increment(0);
        assert_eq!(t.set_absolute(5000, 10), Deadline::Until(15_000));
    }

    #[test]
    fn set_absolute_zero_or_negative_expires() {
        let t = timer();
        assert_eq!(t.set_absolute(5000, 0), Deadline::ExpireNow);
        assert_eq!(t.set_absolute(5000, -3), Deadline::ExpireNow);
        assert_eq!(t.tick(5000), TickOutcome::Expired);
        assert!(t.is_idle());
    }

    #[test]
    fn set_absolute_huge_value_saturates() {
        let t = timer();
        assert_eq!(t.set_absolute(5000, i64::MAX), Deadline::Until(MAX_TIMESTAMP_MS));
    }

    // -- cancel + tick -----------------------------------------------------

    #[test]
    fn cancel_then_tick_fully_resets() {
        for now in [0, 1, 500, 31_000, 1_000_000] {
            let t = timer();
            t.increment(0);
            t.tick(0);
            t.cancel();
            assert_eq!(t.tick(now), TickOutcome::Expired);
            assert_eq!(t.run_until(), Deadline::Idle);
            assert_eq!(t.last_run_until(), Deadline::Idle);
        }
    }

    #[test]
    fn cancel_while_idle_resets_on_tick() {
        let t = timer();
        t.cancel();
        assert_eq!(t.tick(10), TickOutcome::Expired);
        assert!(t.is_idle());
    }

    // -- tick --------------------------------------------------------------

    #[test]
    fn tick_idle_is_noop() {
        let t = timer();
        assert_eq!(t.tick(100), TickOutcome::Idle);
        assert_eq!(t.last_run_until(), Deadline::Idle);
    }

    #[test]
    fn tick_arms_once_per_change() {
        let t = timer();
        t.set_absolute(0, 10);
        assert_eq!(t.tick(100), TickOutcome::Armed { remaining_ms: 9900 });
        assert_eq!(t.tick(200), TickOutcome::Unchanged);
        assert_eq!(t.tick(9_000), TickOutcome::Unchanged);
        assert_eq!(t.last_run_until(), Deadline::Until(10_000));
    }

    #[test]
    fn tick_rearms_after_extension() {
        let t = timer();
        t.increment(0);
        t.tick(0);
        t.increment(100);
        assert_eq!(t.tick(200), TickOutcome::Armed { remaining_ms: 59_800 });
    }

    #[test]
    fn expiry_boundary() {
        let t = timer();
        t.set_absolute(0, 5);
        assert_eq!(t.tick(0), TickOutcome::Armed { remaining_ms: 5000 });
        assert_eq!(t.tick(4999), TickOutcome::Unchanged);
        assert!(t.status(4999).on);
        assert_eq!(t.tick(5001), TickOutcome::Expired);
        assert_eq!(t.run_until(), Deadline::Idle);
        assert_eq!(t.last_run_until(), Deadline::Idle);
    }

    #[test]
    fn tick_at_exact_deadline_neither_arms_nor_expires() {
        let t = timer();
        t.set_absolute(0, 5);
        assert_eq!(t.tick(5000), TickOutcome::Unchanged);
        assert_eq!(t.tick(5001), TickOutcome::Expired);
    }

    // -- status ------------------------------------------------------------

    #[test]
    fn status_reports_whole_seconds_remaining() {
        let t = timer();
        t.set_absolute(1000, 10);
        assert_eq!(
            t.status(1500),
            TimerStatus {
                on: true,
                remaining_secs: 9
            }
        );
    }

    #[test]
    fn status_off_when_idle_overdue_or_cancelled() {
        let t = timer();
        assert!(!t.status(0).on);
        t.set_absolute(0, 1);
        assert_eq!(t.status(2000).remaining_secs, 0);
        assert!(!t.status(2000).on);
        t.set_absolute(0, 100);
        t.cancel();
        assert!(!t.status(10).on);
    }
}
