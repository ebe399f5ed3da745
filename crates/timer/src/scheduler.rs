//! Cooperative control loop: the only place the relay and LED are driven.
//!
//! Once per period the loop makes sure the HTTP listener is up, polls the
//! button for a hold, and resolves the timer deadline into a relay state.
//! HTTP handlers and the button interrupt run elsewhere and only request
//! transitions through the shared [`TimerState`](crate::timer::TimerState).
//!
//! ## Loop states
//!
//! ```text
//! IDLE ──[deadline set]──▶ ARMED ──[deadline passed]──▶ IDLE
//!                            │
//!                      [cancel / hold]
//!                            ▼
//!                        EXPIRING ──[next tick]──▶ IDLE
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::board::Board;
use crate::button::ButtonPoll;
use crate::context::SharedContext;
use crate::timer::TickOutcome;
use crate::web;

/// Length of each LED phase in the arm acknowledgment.
const BLINK_STEP: Duration = Duration::from_millis(100);

/// Listener state.  Binding is retried each tick until the link is up.
enum Listener {
    Disabled,
    Pending { addr: SocketAddr, attempts: u32 },
    Serving(JoinHandle<std::io::Result<()>>),
}

pub(crate) struct Scheduler {
    ctx: SharedContext,
    board: Board,
    period: Duration,
    listener: Listener,
}

impl Scheduler {
    /// Lights the LED: it stays lit for as long as the loop is alive.
    /// `listen_addr` of `None` runs without an HTTP surface.
    pub(crate) fn new(
        ctx: SharedContext,
        mut board: Board,
        period: Duration,
        listen_addr: Option<SocketAddr>,
    ) -> Self {
        let listener = match listen_addr {
            Some(addr) => Listener::Pending { addr, attempts: 0 },
            None => Listener::Disabled,
        };
        board.set_led(true);
        Self {
            ctx,
            board,
            period,
            listener,
        }
    }

    /// Run until a fatal fault.  The caller is responsible for
    /// [`shutdown`](Self::shutdown) afterwards.
    pub(crate) async fn run(&mut self) -> Result<()> {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            period_ms = self.period.as_millis() as u64,
            hold_ticks = self.ctx.button.hold_threshold(),
            increment_sec = self.ctx.timer.increment_ms() / 1000,
            "scheduler started"
        );

        loop {
            ticker.tick().await;
            self.step().await?;
        }
    }

    /// One loop body.
    pub(crate) async fn step(&mut self) -> Result<()> {
        self.ensure_listening().await?;

        let now = self.ctx.now_ms();

        if let Some(at_ms) = self.ctx.button.take_press() {
            debug!(at_ms, "button pressed");
        }

        let pressed = self.board.button_pressed();
        match self.ctx.button.poll_tick(pressed, &self.ctx.timer) {
            ButtonPoll::HoldDetected => {
                info!(
                    held_ticks = self.ctx.button.hold_threshold(),
                    "button held, turning off"
                );
            }
            ButtonPoll::Pressed { held_polls } => trace!(held_polls, "button down"),
            ButtonPoll::Released => {}
        }

        // Fast path: nothing scheduled, no hardware calls.
        if self.ctx.timer.is_idle() {
            return Ok(());
        }

        match self.ctx.timer.tick(now) {
            TickOutcome::Armed { remaining_ms } => {
                info!(seconds = remaining_ms as f64 / 1000.0, "running");
                self.board.set_relay(true);
                self.blink().await;
            }
            TickOutcome::Expired => {
                info!("turning off");
                self.board.set_relay(false);
            }
            TickOutcome::Idle | TickOutcome::Unchanged => {}
        }

        Ok(())
    }

    /// Relay off and LED dark.  Used on the way out, whatever the reason;
    /// a dark LED is the only sign the loop has stopped.
    pub(crate) fn shutdown(&mut self) {
        warn!(deadline = ?self.ctx.timer.run_until(), "safety shutdown: relay off");
        self.board.all_off();
        if let Listener::Serving(handle) = &self.listener {
            handle.abort();
        }
    }

    /// Dark, lit, dark, lit, ending on the steady liveness light.
    async fn blink(&mut self) {
        self.board.set_led(false);
        for lit in [true, false, true] {
            sleep(BLINK_STEP).await;
            self.board.set_led(lit);
        }
    }

    async fn ensure_listening(&mut self) -> Result<()> {
        match &mut self.listener {
            Listener::Disabled => Ok(()),
            Listener::Serving(handle) if handle.is_finished() => {
                let result = handle.await;
                self.listener = Listener::Disabled;
                match result {
                    Ok(Ok(())) => Err(anyhow!("http server stopped")),
                    Ok(Err(e)) => Err(anyhow::Error::new(e).context("http server failed")),
                    Err(e) => Err(anyhow::Error::new(e).context("http server task failed")),
                }
            }
            Listener::Serving(_) => Ok(()),
            Listener::Pending { addr, attempts } => {
                let addr = *addr;
                match web::bind(addr).await {
                    Ok(listener) => {
                        info!("listening on http://{addr}");
                        self.listener =
                            Listener::Serving(web::spawn(listener, self.ctx.clone()));
                    }
                    Err(e) => {
                        *attempts += 1;
                        if *attempts == 1 {
                            warn!(%addr, "network not ready, will keep retrying: {e}");
                        } else {
                            debug!(%addr, attempts = *attempts, "bind failed: {e}");
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
