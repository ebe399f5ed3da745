//! TOML config file loading and validation for timer behaviour, the web UI,
//! network identity and GPIO wiring.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub timer: TimerConfig,
    pub web: WebConfig,
    pub network: NetworkConfig,
    pub gpio: GpioConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Seconds added per press or `/incr`.
    pub increment_sec: i64,
    /// Scheduler ticks the button must stay down to cancel.
    pub hold_ticks: i64,
    /// Scheduler period.
    pub tick_ms: i64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub title: String,
    pub bind: IpAddr,
    pub port: u16,
    /// Status page auto-refresh, 0 disables.
    pub refresh_sec: u32,
}

/// Network identity.  Link bring-up happens outside this process; the values
/// are carried so the device's configuration lives in one file.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub hostname: String,
    pub ssid: String,
    pub psk: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GpioConfig {
    pub button_pin: i64,
    pub relay_pin: i64,
    pub led_pin: i64,
    pub relay_active_low: bool,
    /// Status LEDs on most relay boards are wired to VCC.
    pub led_active_low: bool,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            increment_sec: 30,
            hold_ticks: 15,
            tick_ms: 100,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            title: "Timer control".to_string(),
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            refresh_sec: 5,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            hostname: "timer".to_string(),
            ssid: String::new(),
            psk: String::new(),
        }
    }
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            button_pin: 17,
            relay_pin: 27,
            led_pin: 22,
            relay_active_low: false,
            led_active_low: true,
        }
    }
}

impl TimerConfig {
    pub fn increment(&self) -> Duration {
        Duration::from_secs(self.increment_sec as u64)
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.tick_ms as u64)
    }

    pub fn hold_threshold(&self) -> u32 {
        u32::try_from(self.hold_ticks).unwrap_or(u32::MAX)
    }
}

impl WebConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Accepted scheduler period, milliseconds.
const TICK_MS_RANGE: std::ops::RangeInclusive<i64> = 10..=1000;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_timer(&mut errors);
        self.validate_web(&mut errors);
        self.validate_gpio(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_timer(&self, errors: &mut Vec<String>) {
        let t = &self.timer;

        if t.increment_sec <= 0 {
            errors.push(format!(
                "timer: increment_sec must be positive, got {}",
                t.increment_sec
            ));
        }
        if t.hold_ticks <= 0 || t.hold_ticks > i64::from(u32::MAX) {
            errors.push(format!(
                "timer: hold_ticks must be in 1..={}, got {}",
                u32::MAX,
                t.hold_ticks
            ));
        }
        if !TICK_MS_RANGE.contains(&t.tick_ms) {
            errors.push(format!(
                "timer: tick_ms {} out of range [{}, {}]",
                t.tick_ms,
                TICK_MS_RANGE.start(),
                TICK_MS_RANGE.end()
            ));
        }
    }

    fn validate_web(&self, errors: &mut Vec<String>) {
        if self.web.title.trim().is_empty() {
            errors.push("web: title is empty".to_string());
        }
        if self.web.port == 0 {
            errors.push("web: port must not be 0".to_string());
        }
        if self.network.hostname.trim().is_empty() {
            errors.push("network: hostname is empty".to_string());
        }
    }

    fn validate_gpio(&self, errors: &mut Vec<String>) {
        let g = &self.gpio;
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (name, pin) in [
            ("button_pin", g.button_pin),
            ("relay_pin", g.relay_pin),
            ("led_pin", g.led_pin),
        ] {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "gpio: {name} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen_pins.insert(pin) {
                errors.push(format!("gpio: {name} {pin} is already used by another function"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Like [`load`], but a missing file means built-in defaults.
pub fn load_or_default(path: &str) -> Result<Config> {
    if Path::new(path).exists() {
        return load(path);
    }
    tracing::info!(path, "no config file, using defaults");
    Ok(Config::default())
}

// ===========================================================================
// Tests
// ===========================================================================
