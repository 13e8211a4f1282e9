// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Capped exponential backoff for transient gateway failures.

use std::thread;
use std::time::Duration;

/// Backoff parameters.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use payment_settlement_rs::RetryPolicy;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.max_attempts, 3);
/// assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first (default: 3)
    pub max_attempts: u32,
    /// Delay before the first retry (default: 200ms)
    pub initial_delay: Duration,
    /// Upper bound for any single delay (default: 5s)
    pub max_delay: Duration,
    /// Growth factor between retries (default: 2.0)
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Policy that retries without sleeping; for tests and offline tooling.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// `initial_delay * multiplier^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Runs `operation` until it yields a non-retryable outcome or attempts run out.
///
/// `operation` receives the zero-based attempt number. The last outcome is
/// returned either way; nothing loops past `max_attempts`.
pub fn retry_with_backoff<T>(
    policy: &RetryPolicy,
    mut operation: impl FnMut(u32) -> T,
    is_retryable: impl Fn(&T) -> bool,
) -> T {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let outcome = operation(attempt);
        if !is_retryable(&outcome) {
            if attempt > 0 {
                tracing::info!(attempt = attempt + 1, "gateway call succeeded after retry");
            }
            return outcome;
        }
        if attempt + 1 >= attempts {
            tracing::warn!(attempts, "gateway still unavailable, giving up");
            return outcome;
        }
        let delay = policy.delay_for_attempt(attempt);
        tracing::warn!(
            attempt = attempt + 1,
            max_attempts = attempts,
            delay_ms = delay.as_millis() as u64,
            "gateway unavailable, retrying"
        );
        thread::sleep(delay);
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_millis(350));
    }

    #[test]
    fn stops_at_first_success() {
        let mut calls = 0;
        let result = retry_with_backoff(
            &RetryPolicy::immediate(5),
            |attempt| {
                calls += 1;
                if attempt < 2 { Err("unavailable") } else { Ok(attempt) }
            },
            |r| r.is_err(),
        );
        assert_eq!(result, Ok(2));
        assert_eq!(calls, 3);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut calls = 0;
        let result: Result<(), &str> = retry_with_backoff(
            &RetryPolicy::immediate(3),
            |_| {
                calls += 1;
                Err("unavailable")
            },
            |r| r.is_err(),
        );
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn non_retryable_is_returned_immediately() {
        let mut calls = 0;
        let result: Result<(), &str> = retry_with_backoff(
            &RetryPolicy::immediate(3),
            |_| {
                calls += 1;
                Err("rejected")
            },
            |r| matches!(r, Err("unavailable")),
        );
        assert_eq!(result, Err("rejected"));
        assert_eq!(calls, 1);
    }

    #[test]
    fn zero_attempts_still_calls_once() {
        let mut calls = 0;
        retry_with_backoff(&RetryPolicy::immediate(0), |_| calls += 1, |_| true);
        assert_eq!(calls, 1);
    }
}
