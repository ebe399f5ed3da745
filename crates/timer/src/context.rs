use std::sync::Arc;

use crate::button::ButtonTracker;
use crate::clock::Clock;
use crate::config::Config;
use crate::timer::TimerState;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

/// Shared by the button interrupt, the HTTP handlers and the scheduler.
pub type SharedContext = Arc<Context>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct Context {
    pub clock: Clock,
    pub timer: TimerState,
    pub button: ButtonTracker,
    pub page: PageSettings,
}

#[derive(Debug, Clone)]
pub struct PageSettings {
    pub title: String,
    pub refresh_secs: u32,
}

/// What the status page shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub on: bool,
    pub remaining_secs: u64,
    pub increment_secs: u64,
}

// ---------------------------------------------------------------------------
// Construction & access
// ---------------------------------------------------------------------------

impl Context {
    pub fn new(cfg: &Config) -> Self {
        Self {
            clock: Clock::start(),
            timer: TimerState::new(cfg.timer.increment()),
            button: ButtonTracker::new(cfg.timer.hold_threshold()),
            page: PageSettings {
                title: cfg.web.title.clone(),
                refresh_secs: cfg.web.refresh_sec,
            },
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Falling-edge callback body.  Registered with the board at startup.
    pub fn on_falling_edge(&self) {
        self.button.on_falling_edge(&self.timer, self.clock.now_ms());
    }

    pub fn status(&self) -> Status {
        let timer = self.timer.status(self.clock.now_ms());
        Status {
            on: timer.on,
            remaining_secs: timer.remaining_secs,
            increment_secs: self.timer.increment_ms() / 1000,
        }
    }
}
