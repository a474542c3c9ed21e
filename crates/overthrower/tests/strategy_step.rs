//! Step strategy: the first `delay` allocations pass, everything after
//! fails until deactivation.

mod common;

use common::*;

#[test]
fn step_fails_everything_after_the_delay() {
    const ITERATIONS: usize = 50;

    for delay in [0usize, 1, 2, 3, 5] {
        let mut real_pattern = [0u8; ITERATIONS];
        let mut expected_pattern = [0u8; ITERATIONS];
        expected_step_pattern(&mut expected_pattern, delay);

        configure_step(delay as u32);
        activate();
        let failure_count = failure_counter(&mut real_pattern);
        assert_eq!(deactivate(), 0);

        assert_eq!(failure_count as usize, ITERATIONS - delay);
        assert_eq!(real_pattern, expected_pattern);
    }
}
