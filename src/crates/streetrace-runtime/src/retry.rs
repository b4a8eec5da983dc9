//! Retry backoff for DSL retry policies.
//!
//! `retry default = 3 times, exponential backoff` wraps agent LLM dispatch:
//! a failed call is retried up to `times` attempts with the configured
//! backoff curve plus jitter.

use std::time::Duration;

use rand::Rng;
use streetrace_compiler::workflow::{BackoffSpec, RetryPolicySpec};

const BASE_INTERVAL_MS: u64 = 500;
const MAX_INTERVAL_MS: u64 = 30_000;

/// Should the operation be retried after `attempt` failures?
pub fn should_retry(policy: &RetryPolicySpec, attempt: u32) -> bool {
    attempt + 1 < policy.times
}

/// Delay before retry number `attempt` (0-based), with jitter.
pub fn delay_for(policy: &RetryPolicySpec, attempt: u32) -> Duration {
    let base = match policy.backoff {
        BackoffSpec::Exponential => BASE_INTERVAL_MS.saturating_mul(1 << attempt.min(16)),
        BackoffSpec::Linear => BASE_INTERVAL_MS.saturating_mul(attempt as u64 + 1),
        BackoffSpec::Fixed => BASE_INTERVAL_MS,
    };
    let capped = base.min(MAX_INTERVAL_MS);
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_millis((capped as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(times: u32, backoff: BackoffSpec) -> RetryPolicySpec {
        RetryPolicySpec { times, backoff }
    }

    #[test]
    fn test_should_retry_counts_attempts() {
        let p = policy(3, BackoffSpec::Fixed);
        assert!(should_retry(&p, 0));
        assert!(should_retry(&p, 1));
        assert!(!should_retry(&p, 2));
        assert!(!should_retry(&p, 5));
    }

    #[test]
    fn test_exponential_grows() {
        let p = policy(5, BackoffSpec::Exponential);
        // Jitter is bounded to [0.5, 1.5), so attempt 3 always exceeds
        // attempt 0's maximum.
        let early = delay_for(&p, 0);
        let late = delay_for(&p, 3);
        assert!(late > early);
    }

    #[test]
    fn test_fixed_is_bounded() {
        let p = policy(3, BackoffSpec::Fixed);
        for attempt in 0..3 {
            let d = delay_for(&p, attempt);
            assert!(d >= Duration::from_millis(250));
            assert!(d <= Duration::from_millis(750));
        }
    }

    #[test]
    fn test_delay_never_exceeds_cap() {
        let p = policy(30, BackoffSpec::Exponential);
        let d = delay_for(&p, 20);
        assert!(d <= Duration::from_millis((MAX_INTERVAL_MS as f64 * 1.5) as u64));
    }
}
