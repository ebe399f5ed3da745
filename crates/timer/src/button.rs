//! Button handling split between the falling-edge interrupt and the
//! scheduler's periodic poll.
//!
//! The interrupt side is what guarantees a press is never missed while the
//! scheduler is busy: it adds one increment immediately and stamps the press.
//! Hold detection is polled, one sample per scheduler tick, so a hold of
//! `hold_threshold` ticks cancels the timer (after the edge already added its
//! increment).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::timer::TimerState;

/// Result of one scheduler poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonPoll {
    Released,
    Pressed { held_polls: u32 },
    /// Threshold reached on this poll.  Reported once per physical hold.
    HoldDetected,
}

#[derive(Debug)]
pub struct ButtonTracker {
    hold_threshold: u32,
    /// Millisecond timestamp of the last unconsumed edge, 0 when none.
    press_started_at: AtomicU64,
    held_polls: AtomicU32,
}

impl ButtonTracker {
    pub fn new(hold_threshold: u32) -> Self {
        Self {
            hold_threshold,
            press_started_at: AtomicU64::new(0),
            held_polls: AtomicU32::new(0),
        }
    }

    pub fn hold_threshold(&self) -> u32 {
        self.hold_threshold
    }

    #[cfg(test)]
    pub fn held_polls(&self) -> u32 {
        self.held_polls.load(Ordering::Acquire)
    }

    /// Interrupt path.  Atomic stores plus the timer's lock-free increment.
    pub fn on_falling_edge(&self, timer: &TimerState, now: u64) {
        timer.increment(now);
        self.press_started_at.store(now.max(1), Ordering::Release);
        self.held_polls.store(0, Ordering::Release);
    }

    /// Scheduler path, once per tick.  Cancels the timer when a hold is
    /// detected.
    pub fn poll_tick(&self, pressed: bool, timer: &TimerState) -> ButtonPoll {
        if !pressed {
            self.held_polls.store(0, Ordering::Release);
            return ButtonPoll::Released;
        }

        let (Ok(prev) | Err(prev)) =
            self.held_polls
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    Some(n.saturating_add(1))
                });
        let held_polls = prev.saturating_add(1);

        if held_polls == self.hold_threshold {
            timer.cancel();
            ButtonPoll::HoldDetected
        } else {
            ButtonPoll::Pressed { held_polls }
        }
    }

    /// Consume the press marker left by the interrupt.
    pub fn take_press(&self) -> Option<u64> {
        match self.press_started_at.swap(0, Ordering::AcqRel) {
            0 => None,
            at => Some(at),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
