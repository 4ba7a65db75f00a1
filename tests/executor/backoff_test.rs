/*!
 * Backoff Property Tests
 */

use proptest::prelude::*;
use scoped_exec::RetryPolicy;
use std::time::Duration;

proptest! {
    #[test]
    fn prop_backoff_never_shrinks(base_ms in 1u64..5_000, attempt in 0u32..64) {
        let policy = RetryPolicy::new(Duration::from_millis(base_ms));
        prop_assert!(policy.backoff(attempt + 1) >= policy.backoff(attempt));
    }

    #[test]
    fn prop_backoff_is_capped(base_ms in 1u64..5_000, attempt in 0u32..1_000) {
        let policy = RetryPolicy::new(Duration::from_millis(base_ms));
        let cap = Duration::from_millis(base_ms) * 2u32.pow(policy.max_exponent);
        prop_assert!(policy.backoff(attempt) <= cap);
    }

    #[test]
    fn prop_total_delay_is_sum_of_retries(base_ms in 1u64..1_000, budget in 0u32..20) {
        let policy = RetryPolicy::new(Duration::from_millis(base_ms));
        let sum: Duration = (1..=budget).map(|n| policy.backoff(n)).sum();
        prop_assert_eq!(policy.max_total_delay(budget), sum);
    }
}

#[test]
fn test_first_retry_doubles_base() {
    let policy = RetryPolicy::new(Duration::from_millis(10));
    assert_eq!(policy.backoff(1), Duration::from_millis(20));
    assert_eq!(policy.backoff(3), Duration::from_millis(80));
}
