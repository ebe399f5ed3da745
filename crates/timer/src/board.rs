//! Relay, status LED and push button. The `gpio` feature gates the real
//! rppal driver; without it, a mock board keeps the pin states in memory and
//! logs changes.
//!
//! Only the scheduler holds the board, so relay and LED writes never race.
//! Both variants switch everything off when constructed and again when
//! dropped, including while unwinding from a panic.

use anyhow::Result;

#[cfg(feature = "gpio")]
use anyhow::Context as _;
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, InputPin, OutputPin, Trigger};

use crate::config::GpioConfig;

#[cfg(all(test, not(feature = "gpio")))]
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

// ---------------------------------------------------------------------------
// rppal board, Raspberry Pi only
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct Board {
    button: InputPin,
    relay: OutputPin,
    led: OutputPin,
    relay_active_low: bool,
    led_active_low: bool,
    relay_on: bool,
}

#[cfg(feature = "gpio")]
impl Board {
    pub(crate) fn new(cfg: &GpioConfig) -> Result<Self> {
        let gpio = Gpio::new().context("failed to open GPIO")?;
        let pin = |num: i64, what: &str| {
            gpio.get(num as u8)
                .with_context(|| format!("failed to claim {what} gpio {num}"))
        };

        // Button to ground, idle high.
        let button = pin(cfg.button_pin, "button")?.into_input_pullup();
        let relay = pin(cfg.relay_pin, "relay")?.into_output();
        let led = pin(cfg.led_pin, "led")?.into_output();

        let mut board = Self {
            button,
            relay,
            led,
            relay_active_low: cfg.relay_active_low,
            led_active_low: cfg.led_active_low,
            relay_on: false,
        };
        board.all_off();
        tracing::info!(
            button = cfg.button_pin,
            relay = cfg.relay_pin,
            led = cfg.led_pin,
            "gpio board initialised"
        );
        Ok(board)
    }

    /// Register the falling-edge handler.  rppal runs it on its interrupt
    /// thread, so it must not block.
    pub(crate) fn on_falling_edge<F>(&mut self, mut handler: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        self.button
            .set_async_interrupt(Trigger::FallingEdge, move |_level| handler())
            .context("failed to register button interrupt")
    }

    pub(crate) fn button_pressed(&self) -> bool {
        self.button.is_low()
    }

    pub(crate) fn set_relay(&mut self, on: bool) {
        drive(&mut self.relay, on, self.relay_active_low);
        if on != self.relay_on {
            tracing::info!(state = if on { "ON" } else { "OFF" }, "relay");
        }
        self.relay_on = on;
    }

    pub(crate) fn set_led(&mut self, lit: bool) {
        drive(&mut self.led, lit, self.led_active_low);
    }

    pub(crate) fn all_off(&mut self) {
        self.set_relay(false);
        self.set_led(false);
    }
}

#[cfg(feature = "gpio")]
fn drive(pin: &mut OutputPin, active: bool, active_low: bool) {
    // active-low: LOW = active, HIGH = inactive
    if active != active_low {
        pin.set_high();
    } else {
        pin.set_low();
    }
}

// ---------------------------------------------------------------------------
// In-memory board for development and tests
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct Board {
    pub(super) relay: bool,
    pub(super) led: bool,
    /// Every LED write, oldest first.
    #[cfg(test)]
    pub(super) led_writes: Vec<bool>,
    /// Relay level that outlives the board.
    #[cfg(test)]
    relay_line: Arc<AtomicBool>,
    button: mock::MockButton,
}

#[cfg(not(feature = "gpio"))]
impl Board {
    pub(crate) fn new(cfg: &GpioConfig) -> Result<Self> {
        tracing::info!(
            button = cfg.button_pin,
            relay = cfg.relay_pin,
            led = cfg.led_pin,
            "[mock-gpio] board initialised (no hardware)"
        );
        let mut board = Self {
            relay: false,
            led: false,
            #[cfg(test)]
            led_writes: Vec::new(),
            #[cfg(test)]
            relay_line: Arc::new(AtomicBool::new(false)),
            button: mock::MockButton::default(),
        };
        board.all_off();
        Ok(board)
    }

    pub(crate) fn on_falling_edge<F>(&mut self, handler: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        self.button.set_handler(Box::new(handler));
        Ok(())
    }

    pub(crate) fn button_pressed(&self) -> bool {
        self.button.is_pressed()
    }

    pub(crate) fn set_relay(&mut self, on: bool) {
        if on != self.relay {
            tracing::info!(state = if on { "ON" } else { "OFF" }, "[mock-gpio] relay");
        }
        self.relay = on;
        #[cfg(test)]
        self.relay_line.store(on, Ordering::Release);
    }

    pub(crate) fn set_led(&mut self, lit: bool) {
        if lit != self.led {
            tracing::trace!(lit, "[mock-gpio] led");
        }
        self.led = lit;
        #[cfg(test)]
        self.led_writes.push(lit);
    }

    pub(crate) fn all_off(&mut self) {
        self.set_relay(false);
        self.set_led(false);
    }

    /// Relay level readable after the board is dropped.
    #[cfg(test)]
    pub(crate) fn relay_line(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.relay_line)
    }

    /// Handle for simulating the physical button.
    #[cfg(test)]
    pub(crate) fn button(&self) -> mock::MockButton {
        self.button.clone()
    }
}

impl Drop for Board {
    fn drop(&mut self) {
        self.all_off();
    }
}

#[cfg(not(feature = "gpio"))]
pub(crate) mod mock {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    type EdgeHandler = Box<dyn FnMut() + Send>;

    /// Shared button level plus the registered edge handler.
    #[derive(Clone, Default)]
    pub(crate) struct MockButton {
        level: Arc<AtomicBool>,
        handler: Arc<Mutex<Option<EdgeHandler>>>,
    }

    impl MockButton {
        pub(super) fn set_handler(&self, handler: EdgeHandler) {
            if let Ok(mut slot) = self.handler.lock() {
                *slot = Some(handler);
            }
        }

        pub(super) fn is_pressed(&self) -> bool {
            self.level.load(Ordering::Acquire)
        }

        /// Pull the line low: level reads pressed, edge handler fires.
        #[cfg(test)]
        pub(crate) fn press(&self) {
            self.level.store(true, Ordering::Release);
            if let Ok(mut slot) = self.handler.lock() {
                if let Some(handler) = slot.as_mut() {
                    handler();
                }
            }
        }

        #[cfg(test)]
        pub(crate) fn release(&self) {
            self.level.store(false, Ordering::Release);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    // -- Board (mock) -------------------------------------------------------

    #[test]
    fn board_new_all_off() {
        let board = Board::new(&GpioConfig::default()).unwrap();
        assert!(!board.relay);
        assert!(!board.led);
    }

    #[test]
    fn board_set_relay_on_off() {
        let mut board = Board::new(&GpioConfig::default()).unwrap();
        board.set_relay(true);
        assert!(board.relay);
        board.set_relay(false);
        assert!(!board.relay);
    }

    #[test]
    fn board_all_off_resets_everything() {
        let mut board = Board::new(&GpioConfig::default()).unwrap();
        board.set_relay(true);
        board.set_led(true);
        board.all_off();
        assert!(!board.relay);
        assert!(!board.led);
    }

    #[test]
    fn press_fires_edge_handler_and_reads_pressed() {
        let mut board = Board::new(&GpioConfig::default()).unwrap();
        let edges = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&edges);
        board
            .on_falling_edge(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let button = board.button();
        assert!(!board.button_pressed());
        button.press();
        assert!(board.button_pressed());
        button.release();
        assert!(!board.button_pressed());
        button.press();
        assert_eq!(edges.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn drop_switches_relay_off() {
        let mut board = Board::new(&GpioConfig::default()).unwrap();
        let relay = board.relay_line();
        board.set_relay(true);
        assert!(relay.load(Ordering::Acquire));
        drop(board);
        assert!(!relay.load(Ordering::Acquire));
    }

    #[test]
    fn press_without_handler_does_not_panic() {
        let board = Board::new(&GpioConfig::default()).unwrap();
        board.button().press();
        assert!(board.button_pressed());
    }
}
