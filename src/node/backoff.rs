use std::time::Duration;

use crate::config::ReconnectPolicy;

/// Delay before reconnect attempt `attempt` (0-based): doubles from the
/// initial delay and saturates at the policy maximum.
pub(super) fn reconnect_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.min(24));
    let delay = policy
        .initial_delay_ms
        .saturating_mul(factor)
        .min(policy.max_delay_ms);
    Duration::from_millis(delay)
}
