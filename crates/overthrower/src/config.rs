//! Environment-driven configuration, loaded on every activation.
//!
//! Each recognized variable that is unset or carries an invalid token falls
//! back to a random value drawn from /dev/urandom, announced on stderr. The
//! chosen parameters are cached in process-wide atomics; the hot path reads
//! them without synchronization (activation is documented not to race with
//! intercepted allocations).

use crate::stderr::report;
use crate::strategy;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::fs::File;
use std::io::Read;

pub const MIN_DUTY_CYCLE: u32 = 1;
pub const MAX_DUTY_CYCLE: u32 = 4096;

pub const MIN_DELAY: u32 = 0;
pub const MAX_RANDOM_DELAY: u32 = 1000;
pub const MAX_DELAY: u32 = 1_000_000;

pub const MIN_DURATION: u32 = 1;
pub const MAX_DURATION: u32 = 100;

pub const VERBOSE_NO: u32 = 0;
pub const VERBOSE_FAILED_ALLOCATIONS: u32 = 1;
pub const VERBOSE_ALL_ALLOCATIONS: u32 = 2;

/// Failure-scheduling strategy, as configured by `OVERTHROWER_STRATEGY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Strategy {
    Random = 0,
    Step = 1,
    Pulse = 2,
    None = 3,
}

impl Strategy {
    fn from_u32(value: u32) -> Strategy {
        match value {
            0 => Strategy::Random,
            1 => Strategy::Step,
            2 => Strategy::Pulse,
            _ => Strategy::None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Strategy::Random => "random",
            Strategy::Step => "step",
            Strategy::Pulse => "pulse",
            Strategy::None => "none",
        }
    }
}

static STRATEGY: AtomicU32 = AtomicU32::new(Strategy::Random as u32);
static SEED: AtomicU32 = AtomicU32::new(0);
static DUTY_CYCLE: AtomicU32 = AtomicU32::new(1024);
static DELAY: AtomicU32 = AtomicU32::new(MIN_DELAY);
static DURATION: AtomicU32 = AtomicU32::new(MIN_DURATION);
static SELF_OVERTHROW: AtomicBool = AtomicBool::new(false);
static VERBOSE: AtomicU32 = AtomicU32::new(VERBOSE_NO);

#[inline]
pub fn strategy() -> Strategy {
    Strategy::from_u32(STRATEGY.load(Ordering::Relaxed))
}

#[inline]
pub fn duty_cycle() -> u32 {
    DUTY_CYCLE.load(Ordering::Relaxed)
}

#[inline]
pub fn delay() -> u32 {
    DELAY.load(Ordering::Relaxed)
}

#[inline]
pub fn duration() -> u32 {
    DURATION.load(Ordering::Relaxed)
}

#[inline]
pub fn self_overthrow() -> bool {
    SELF_OVERTHROW.load(Ordering::Relaxed)
}

pub fn clear_self_overthrow() {
    SELF_OVERTHROW.store(false, Ordering::Relaxed);
}

#[inline]
pub fn verbose_mode() -> u32 {
    VERBOSE.load(Ordering::Relaxed)
}

/// Read all `OVERTHROWER_*` variables, announce the chosen parameters on
/// stderr and cache them. Invoked by `activate`; reading twice is benign.
pub fn load_from_env() {
    let strategy_value = read_env_value(
        "OVERTHROWER_STRATEGY",
        Strategy::Random as u32,
        Strategy::None as u32,
        Strategy::Pulse as u32,
        None,
    );
    let chosen = Strategy::from_u32(strategy_value);
    STRATEGY.store(strategy_value, Ordering::Relaxed);
    report!("Strategy = {}", chosen.name());

    if chosen == Strategy::Random {
        let seed = read_env_value("OVERTHROWER_SEED", 0, u32::MAX, 0, None);
        let duty_cycle =
            read_env_value("OVERTHROWER_DUTY_CYCLE", MIN_DUTY_CYCLE, MAX_DUTY_CYCLE, 0, None);
        SEED.store(seed, Ordering::Relaxed);
        DUTY_CYCLE.store(duty_cycle, Ordering::Relaxed);
        strategy::reseed(seed);
        report!("Duty cycle = {}", duty_cycle);
        report!("Seed = {}", seed);
    } else if chosen != Strategy::None {
        let delay = read_env_value("OVERTHROWER_DELAY", MIN_DELAY, MAX_DELAY, MAX_RANDOM_DELAY, None);
        DELAY.store(delay, Ordering::Relaxed);
        report!("Delay = {}", delay);
        if chosen == Strategy::Pulse {
            let duration = read_env_value("OVERTHROWER_DURATION", MIN_DURATION, MAX_DURATION, 0, None);
            DURATION.store(duration, Ordering::Relaxed);
            report!("Duration = {}", duration);
        }
    }

    let self_overthrow = std::env::var_os("OVERTHROWER_SELF_OVERTHROW").is_some();
    SELF_OVERTHROW.store(self_overthrow, Ordering::Relaxed);
    report!(
        "Self overthrow mode = {}",
        if self_overthrow { "enabled" } else { "disabled" }
    );

    let verbose = read_env_value(
        "OVERTHROWER_VERBOSE",
        VERBOSE_NO,
        VERBOSE_ALL_ALLOCATIONS,
        0,
        Some(VERBOSE_NO),
    );
    VERBOSE.store(verbose, Ordering::Relaxed);
    report!("Verbose mode = {}", verbose);
}

/// Parse a decimal token the way strtoul-with-junk-rejection would: the
/// whole string must be digits and the value must fit the inclusive range.
fn parse_token(token: &str, min: u32, max: u32) -> Option<u32> {
    let value: u64 = token.parse().ok()?;
    if value < min as u64 || value > max as u64 {
        return None;
    }
    Some(value as u32)
}

/// Draw a uniform value in `[min, max]` from /dev/urandom, falling back to
/// the midpoint if the device cannot be read.
fn generate_random_value(min: u32, max: u32) -> u32 {
    let mut value = ((min as u64 + max as u64) / 2) as u32;
    if let Ok(mut file) = File::open("/dev/urandom") {
        let mut buf = [0u8; 4];
        if file.read_exact(&mut buf).is_ok() {
            value = u32::from_ne_bytes(buf);
        }
    }
    // Modulus stays in u32: when max is u32::MAX the +1 is dropped, exactly
    // offsetting the otherwise-overflowing span.
    let modulus = max - min + if max == u32::MAX { 0 } else { 1 };
    value % modulus + min
}

/// Read one variable. With `default` present, bad input falls back to the
/// default; otherwise to a random draw capped at `max_random` (when nonzero).
fn read_env_value(
    name: &str,
    min: u32,
    max: u32,
    max_random: u32,
    default: Option<u32>,
) -> u32 {
    let raw = std::env::var(name).ok();

    if let Some(default_value) = default {
        return match raw {
            None => default_value,
            Some(token) => match parse_token(&token, min, max) {
                Some(value) => value,
                None => {
                    report!(
                        "{} has incorrect value ({}). Using a default value ({}).",
                        name, token, default_value
                    );
                    default_value
                }
            },
        };
    }

    let random_max = if max_random != 0 { max_random } else { max };
    match raw {
        None => {
            let random_value = generate_random_value(min, random_max);
            report!(
                "{} environment variable not set. Using a random value ({}).",
                name, random_value
            );
            random_value
        }
        Some(token) => match parse_token(&token, min, max) {
            Some(value) => value,
            None => {
                let random_value = generate_random_value(min, random_max);
                report!(
                    "{} has incorrect value ({}). Using a random value ({}).",
                    name, token, random_value
                );
                random_value
            }
        },
    }
}
