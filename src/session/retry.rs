// SPDX-License-Identifier: GPL-3.0-only

//! Bounded retry schedule for descriptor-pull sources
//!
//! A pull source (gphoto2 helper, network stream) needs time before it
//! produces data, so pipeline construction is retried on a fixed interval
//! after an initial warm-up delay. Attempts alternate between the descriptor
//! as built and a variant without an explicit bind address, because the
//! helper's UDP sender does not bind the same way on every system.

use crate::constants::{network, retry};
use std::time::Duration;

/// Retry parameters for pull-source pipeline construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first attempt
    pub initial_delay: Duration,
    /// Delay between later attempts
    pub interval: Duration,
    /// Attempt cap; reaching it is terminal
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: retry::PIPELINE_INITIAL_DELAY,
            interval: retry::PIPELINE_INTERVAL,
            max_attempts: retry::PIPELINE_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, interval: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            interval,
            max_attempts,
        }
    }

    /// Delay to wait before attempt `attempt` (1-based)
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            self.initial_delay
        } else {
            self.interval
        }
    }

    /// Worst-case time until the terminal error
    pub fn total_budget(&self) -> Duration {
        self.initial_delay + self.interval * self.max_attempts.saturating_sub(1)
    }
}

/// Descriptor to use for attempt `attempt` (1-based)
///
/// Odd attempts use the descriptor unchanged, even attempts drop the
/// loopback bind address so the source listens on all interfaces.
pub fn descriptor_for_attempt(descriptor: &str, attempt: u32) -> String {
    let bound = format!(" address={}", network::LOOPBACK_ADDRESS);
    if attempt % 2 == 0 && descriptor.contains(&bound) {
        descriptor.replacen(&bound, "", 1)
    } else {
        descriptor.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before(1), Duration::from_secs(2));
        assert_eq!(policy.delay_before(2), Duration::from_millis(500));
        assert_eq!(policy.delay_before(30), Duration::from_millis(500));
        assert_eq!(policy.total_budget(), Duration::from_millis(16_500));
    }

    #[test]
    fn test_bind_address_alternates() {
        let descriptor = "udpsrc port=5100 address=127.0.0.1 caps=\"video/mpegts\" ! tsdemux";
        assert_eq!(descriptor_for_attempt(descriptor, 1), descriptor);
        assert_eq!(
            descriptor_for_attempt(descriptor, 2),
            "udpsrc port=5100 caps=\"video/mpegts\" ! tsdemux"
        );
        assert_eq!(descriptor_for_attempt(descriptor, 3), descriptor);
    }

    #[test]
    fn test_descriptor_without_address_is_untouched() {
        let descriptor = "rtspsrc location=\"rtsp://cam/1\" latency=300 ! decodebin";
        assert_eq!(descriptor_for_attempt(descriptor, 2), descriptor);
    }
}
