//! Failure-decision engine.
//!
//! Given the sequence number reserved for an intercepted allocation, decides
//! whether that allocation must fail. The sequence number is assigned by an
//! atomic fetch-add *before* the decision, so numbering is identical across
//! strategies.

use crate::config::{self, Strategy};
use core::sync::atomic::{AtomicU32, Ordering};

/// xorshift32 state shared by the random strategy and the self-overthrow
/// coin flips. Reseeded only when the random strategy is configured.
static PRNG_STATE: AtomicU32 = AtomicU32::new(DEFAULT_SEED);

/// Arbitrary nonzero default; xorshift32 has a fixed point at zero.
const DEFAULT_SEED: u32 = 0x9E37_79B9;

pub fn reseed(seed: u32) {
    let state = if seed == 0 { DEFAULT_SEED } else { seed };
    PRNG_STATE.store(state, Ordering::Relaxed);
}

/// Next pseudo-random value. Racing threads may observe the same draw;
/// that is acceptable for a failure-probability dial, as it was for the
/// C library's `rand()`.
#[inline]
pub fn next_random() -> u32 {
    let mut x = PRNG_STATE.load(Ordering::Relaxed);
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    PRNG_STATE.store(x, Ordering::Relaxed);
    // Multiplicative finalizer; plain xorshift output has weak low bits,
    // which matters because callers reduce modulo small duty cycles.
    let mut z = x.wrapping_mul(0x9E37_79B1);
    z ^= z >> 16;
    z
}

/// One coin flip for self-overthrow mode.
#[inline]
pub fn self_overthrow_flip() -> bool {
    next_random() % 2 == 0
}

#[inline]
fn random_should_fail(roll: u32, duty_cycle: u32) -> bool {
    roll % duty_cycle == 0
}

#[inline]
fn step_should_fail(seq_num: u32, delay: u32) -> bool {
    seq_num >= delay
}

/// Exactly `duration` failures right after the first `delay` allocations.
#[inline]
fn pulse_should_fail(seq_num: u32, delay: u32, duration: u32) -> bool {
    seq_num >= delay && seq_num - delay < duration
}

/// Decide whether the allocation holding `seq_num` must fail.
#[inline]
pub fn is_time_to_fail(seq_num: u32) -> bool {
    match config::strategy() {
        Strategy::Random => random_should_fail(next_random(), config::duty_cycle()),
        Strategy::Step => step_should_fail(seq_num, config::delay()),
        Strategy::Pulse => pulse_should_fail(seq_num, config::delay(), config::duration()),
        Strategy::None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_passes_first_delay_allocations() {
        for delay in [0u32, 1, 2, 3, 5] {
            for seq in 0..50 {
                assert_eq!(step_should_fail(seq, delay), seq >= delay);
            }
        }
    }

    #[test]
    fn pulse_fails_exactly_duration_times() {
        for delay in [0u32, 1, 2, 3, 5] {
            for duration in [1u32, 2, 3, 5] {
                let failures: Vec<u32> = (0..50)
                    .filter(|&seq| pulse_should_fail(seq, delay, duration))
                    .collect();
                let expected: Vec<u32> = (delay..delay + duration).collect();
                assert_eq!(failures, expected);
            }
        }
    }

    #[test]
    fn pulse_handles_large_delay_without_overflow() {
        assert!(!pulse_should_fail(0, 1_000_000, 100));
        assert!(pulse_should_fail(1_000_000, 1_000_000, 100));
        assert!(pulse_should_fail(1_000_099, 1_000_000, 100));
        assert!(!pulse_should_fail(1_000_100, 1_000_000, 100));
    }

    #[test]
    fn duty_cycle_one_always_fails() {
        reseed(0);
        for _ in 0..1000 {
            assert!(random_should_fail(next_random(), 1));
        }
    }

    #[test]
    fn duty_cycle_ratio_is_roughly_uniform() {
        for duty_cycle in [2u32, 3, 5, 10, 50] {
            reseed(12345);
            let iterations = 1024 * duty_cycle;
            let failures = (0..iterations)
                .filter(|_| random_should_fail(next_random(), duty_cycle))
                .count() as u32;
            let expected = iterations / duty_cycle;
            let delta = expected / 10;
            assert!(
                failures >= expected - delta && failures <= expected + delta,
                "duty_cycle {}: {} failures, expected {} +/- {}",
                duty_cycle,
                failures,
                expected,
                delta
            );
        }
    }

    #[test]
    fn self_overthrow_flip_is_roughly_fair() {
        const FLIPS: i64 = 4096;
        reseed(99);
        let heads = (0..FLIPS).filter(|_| self_overthrow_flip()).count() as i64;
        let delta = FLIPS / 20;
        assert!(
            (heads - FLIPS / 2).abs() <= delta,
            "{} heads out of {} flips",
            heads,
            FLIPS
        );
    }

    #[test]
    fn reseed_makes_the_sequence_deterministic() {
        reseed(42);
        let first: Vec<u32> = (0..16).map(|_| next_random()).collect();
        reseed(42);
        let second: Vec<u32> = (0..16).map(|_| next_random()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn zero_seed_is_mapped_off_the_fixed_point() {
        reseed(0);
        assert_ne!(next_random(), 0);
    }
}
