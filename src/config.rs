//! Controller configuration
//!
//! Defaults suit a single provider instance; every value can be overridden
//! from the environment so the same image runs sharded deployments.

use std::time::Duration;

/// Tunables shared by every reconciler
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Maximum number of concurrent reconciles per kind
    pub concurrency: u16,
    /// Only reconcile objects whose watch-filter label equals this value
    pub watch_filter: Option<String>,
    /// Deadline for a single reconcile invocation
    pub reconcile_timeout: Duration,
    /// Delay for an explicit "not ready yet" requeue
    pub not_ready_requeue: Duration,
    /// Delay for a requeue after an optimistic-concurrency conflict
    pub conflict_requeue: Duration,
    /// First backoff delay after an error
    pub backoff_base: Duration,
    /// Upper bound for the backoff delay
    pub backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            watch_filter: None,
            reconcile_timeout: Duration::from_secs(120),
            not_ready_requeue: Duration::from_secs(5),
            conflict_requeue: Duration::from_millis(100),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }
}

impl ControllerConfig {
    /// Build configuration from `CAPC_*` environment variables
    ///
    /// Unparseable values fall back to the default for that field.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            concurrency: lookup("CAPC_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.concurrency),
            watch_filter: lookup("CAPC_WATCH_FILTER").filter(|v| !v.is_empty()),
            reconcile_timeout: lookup("CAPC_RECONCILE_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconcile_timeout),
            ..defaults
        }
    }

    /// Backoff delay for the given number of consecutive failures
    ///
    /// The first failure waits `backoff_base`, each further failure doubles
    /// the delay until `backoff_max`.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_when_environment_is_empty() {
        let config = ControllerConfig::from_lookup(|_| None);
        assert_eq!(config, ControllerConfig::default());
    }

    #[test]
    fn environment_overrides_are_applied() {
        let env: HashMap<&str, &str> = [
            ("CAPC_CONCURRENCY", "4"),
            ("CAPC_WATCH_FILTER", "shard-a"),
            ("CAPC_RECONCILE_TIMEOUT_SECS", "30"),
        ]
        .into_iter()
        .collect();
        let config = ControllerConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.concurrency, 4);
        assert_eq!(config.watch_filter.as_deref(), Some("shard-a"));
        assert_eq!(config.reconcile_timeout, Duration::from_secs(30));
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = ControllerConfig::from_lookup(|k| match k {
            "CAPC_CONCURRENCY" => Some("0".to_string()),
            "CAPC_WATCH_FILTER" => Some(String::new()),
            _ => Some("nope".to_string()),
        });
        assert_eq!(config, ControllerConfig::default());
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let config = ControllerConfig::default();
        assert_eq!(config.backoff_delay(1), Duration::from_secs(5));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(10));
        assert_eq!(config.backoff_delay(4), Duration::from_secs(40));
        assert_eq!(config.backoff_delay(7), Duration::from_secs(300));
        assert_eq!(config.backoff_delay(u32::MAX), Duration::from_secs(300));
    }
}
