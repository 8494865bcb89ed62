//! Workflow engine configuration.
//!
//! Defaults are suitable for a single-node deployment. Override via
//! environment variables or explicit construction in tests.

use std::time::Duration as StdDuration;

/// Ten years.
const MAX_REQUEST_TTL_SECS: u64 = 10 * 365 * 24 * 3600;

/// Retry policy for post-commit notification delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delivery attempts before an event is dropped (at least 1).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: StdDuration,
    /// Upper bound on the delay between attempts.
    pub max_backoff: StdDuration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based). The first attempt is
    /// immediate; each retry doubles the delay up to `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> StdDuration {
        if attempt <= 1 {
            return StdDuration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: StdDuration::from_millis(200),
            max_backoff: StdDuration::from_secs(30),
        }
    }
}

/// Configuration for the escrow workflow engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowConfig {
    /// Age after which an active fund request is expired. `None` disables
    /// expiry.
    pub request_ttl: Option<chrono::Duration>,
    /// Notification retry policy.
    pub notification_retry: RetryPolicy,
    /// Capacity of the post-commit dispatch channel.
    pub dispatch_buffer: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            request_ttl: None,
            notification_retry: RetryPolicy::default(),
            dispatch_buffer: 1_024,
        }
    }
}

impl WorkflowConfig {
    /// Load configuration from environment variables.
    ///
    /// Variables:
    /// - `ESCROW_REQUEST_TTL_SECS` (default: unset, requests never expire)
    /// - `ESCROW_NOTIFY_MAX_ATTEMPTS` (default: 5)
    /// - `ESCROW_NOTIFY_BACKOFF_MS` (default: 200)
    /// - `ESCROW_DISPATCH_BUFFER` (default: 1024)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let request_ttl = match parse_u64(&lookup, "ESCROW_REQUEST_TTL_SECS")? {
            None => None,
            Some(0) => {
                return Err(ConfigError::Invalid {
                    var: "ESCROW_REQUEST_TTL_SECS",
                    reason: "must be greater than zero".to_string(),
                })
            }
            Some(secs) if secs <= MAX_REQUEST_TTL_SECS => Some(chrono::Duration::seconds(secs as i64)),
            Some(secs) => {
                return Err(ConfigError::Invalid {
                    var: "ESCROW_REQUEST_TTL_SECS",
                    reason: format!("{secs} exceeds {MAX_REQUEST_TTL_SECS}"),
                })
            }
        };

        let max_attempts = match parse_u64(&lookup, "ESCROW_NOTIFY_MAX_ATTEMPTS")? {
            None => defaults.notification_retry.max_attempts,
            Some(n) if (1..=u64::from(u32::MAX)).contains(&n) => n as u32,
            Some(n) => {
                return Err(ConfigError::Invalid {
                    var: "ESCROW_NOTIFY_MAX_ATTEMPTS",
                    reason: format!("{n} is not a positive 32-bit count"),
                })
            }
        };

        let initial_backoff = parse_u64(&lookup, "ESCROW_NOTIFY_BACKOFF_MS")?
            .map(StdDuration::from_millis)
            .unwrap_or(defaults.notification_retry.initial_backoff);

        let dispatch_buffer = match parse_u64(&lookup, "ESCROW_DISPATCH_BUFFER")? {
            None => defaults.dispatch_buffer,
            Some(0) => {
                return Err(ConfigError::Invalid {
                    var: "ESCROW_DISPATCH_BUFFER",
                    reason: "must be greater than zero".to_string(),
                })
            }
            Some(n) => usize::try_from(n).map_err(|_| ConfigError::Invalid {
                var: "ESCROW_DISPATCH_BUFFER",
                reason: format!("{n} is out of range"),
            })?,
        };

        Ok(Self {
            request_ttl,
            notification_retry: RetryPolicy {
                max_attempts,
                initial_backoff,
                max_backoff: defaults.notification_retry.max_backoff,
            },
            dispatch_buffer,
        })
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<u64>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                var,
                reason: format!("\"{raw}\" is not an unsigned integer"),
            }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_set() {
        let cfg = WorkflowConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, WorkflowConfig::default());
        assert!(cfg.request_ttl.is_none());
    }

    #[test]
    fn reads_overrides() {
        let cfg = WorkflowConfig::from_lookup(lookup(&[
            ("ESCROW_REQUEST_TTL_SECS", "3600"),
            ("ESCROW_NOTIFY_MAX_ATTEMPTS", "3"),
            ("ESCROW_NOTIFY_BACKOFF_MS", "50"),
            ("ESCROW_DISPATCH_BUFFER", "16"),
        ]))
        .unwrap();
        assert_eq!(cfg.request_ttl, Some(chrono::Duration::hours(1)));
        assert_eq!(cfg.notification_retry.max_attempts, 3);
        assert_eq!(cfg.notification_retry.initial_backoff, StdDuration::from_millis(50));
        assert_eq!(cfg.dispatch_buffer, 16);
    }

    #[test]
    fn rejects_garbage_and_zero() {
        assert!(WorkflowConfig::from_lookup(lookup(&[("ESCROW_REQUEST_TTL_SECS", "soon")])).is_err());
        assert!(WorkflowConfig::from_lookup(lookup(&[("ESCROW_REQUEST_TTL_SECS", "0")])).is_err());
        assert!(WorkflowConfig::from_lookup(lookup(&[("ESCROW_NOTIFY_MAX_ATTEMPTS", "0")])).is_err());
        let err = WorkflowConfig::from_lookup(lookup(&[("ESCROW_DISPATCH_BUFFER", "-1")])).unwrap_err();
        assert!(format!("{err}").contains("ESCROW_DISPATCH_BUFFER"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            initial_backoff: StdDuration::from_millis(100),
            max_backoff: StdDuration::from_millis(500),
        };
        assert_eq!(p.backoff(1), StdDuration::ZERO);
        assert_eq!(p.backoff(2), StdDuration::from_millis(100));
        assert_eq!(p.backoff(3), StdDuration::from_millis(200));
        assert_eq!(p.backoff(4), StdDuration::from_millis(400));
        assert_eq!(p.backoff(5), StdDuration::from_millis(500));
        assert_eq!(p.backoff(40), StdDuration::from_millis(500));
    }
}
