//! Operator configuration loaded from environment variables

use std::time::Duration;

/// Default metrics port
pub const DEFAULT_METRICS_PORT: u16 = 8080;
/// Periodic resync interval (seconds)
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 300;
/// Deadline for a single reconciliation attempt (seconds)
pub const DEFAULT_RECONCILE_TIMEOUT_SECS: u64 = 120;
/// First error backoff step (seconds)
pub const DEFAULT_ERROR_BACKOFF_BASE_SECS: u64 = 5;
/// Error backoff ceiling (seconds)
pub const DEFAULT_ERROR_BACKOFF_MAX_SECS: u64 = 300;
/// Time a rotation may sit in one non-Idle phase before it counts as stalled
pub const DEFAULT_ROTATION_STALL_THRESHOLD_SECS: u64 = 3600;
/// Concurrent reconciliations across distinct resources
pub const DEFAULT_CONTROLLER_CONCURRENCY: u16 = 4;

/// Operator-wide settings
///
/// All settings have defaults and can be overridden via environment variables.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// HTTP port for metrics and health probes
    pub metrics_port: u16,
    /// Requeue delay after a successful reconciliation
    pub reconcile_interval: Duration,
    /// Deadline for one reconciliation attempt
    pub reconcile_timeout: Duration,
    /// Base delay for exponential error backoff
    pub error_backoff_base: Duration,
    /// Ceiling for exponential error backoff
    pub error_backoff_max: Duration,
    /// Rotation stall threshold
    pub rotation_stall_threshold: Duration,
    /// Max concurrent reconciliations
    pub concurrency: u16,
    /// Restrict the watch to one namespace
    pub watch_namespace: Option<String>,
    /// "json" (default) or "text"
    pub log_format: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            metrics_port: DEFAULT_METRICS_PORT,
            reconcile_interval: Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECS),
            reconcile_timeout: Duration::from_secs(DEFAULT_RECONCILE_TIMEOUT_SECS),
            error_backoff_base: Duration::from_secs(DEFAULT_ERROR_BACKOFF_BASE_SECS),
            error_backoff_max: Duration::from_secs(DEFAULT_ERROR_BACKOFF_MAX_SECS),
            rotation_stall_threshold: Duration::from_secs(DEFAULT_ROTATION_STALL_THRESHOLD_SECS),
            concurrency: DEFAULT_CONTROLLER_CONCURRENCY,
            watch_namespace: None,
            log_format: "json".to_string(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            metrics_port: env_var_or_default("METRICS_PORT", DEFAULT_METRICS_PORT),
            reconcile_interval: Duration::from_secs(env_var_or_default(
                "RECONCILE_INTERVAL_SECS",
                DEFAULT_RECONCILE_INTERVAL_SECS,
            )),
            reconcile_timeout: Duration::from_secs(env_var_or_default(
                "RECONCILE_TIMEOUT_SECS",
                DEFAULT_RECONCILE_TIMEOUT_SECS,
            )),
            error_backoff_base: Duration::from_secs(env_var_or_default(
                "ERROR_BACKOFF_BASE_SECS",
                DEFAULT_ERROR_BACKOFF_BASE_SECS,
            )),
            error_backoff_max: Duration::from_secs(env_var_or_default(
                "ERROR_BACKOFF_MAX_SECS",
                DEFAULT_ERROR_BACKOFF_MAX_SECS,
            )),
            rotation_stall_threshold: Duration::from_secs(env_var_or_default(
                "ROTATION_STALL_THRESHOLD_SECS",
                DEFAULT_ROTATION_STALL_THRESHOLD_SECS,
            )),
            concurrency: env_var_or_default("CONTROLLER_CONCURRENCY", DEFAULT_CONTROLLER_CONCURRENCY),
            watch_namespace: std::env::var("WATCH_NAMESPACE")
                .ok()
                .filter(|ns| !ns.is_empty()),
            log_format: env_var_or_default("LOG_FORMAT", "json".to_string()),
        }
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::default();
        assert_eq!(config.metrics_port, 8080);
        assert_eq!(config.reconcile_interval, Duration::from_secs(300));
        assert_eq!(config.rotation_stall_threshold, Duration::from_secs(3600));
        assert!(config.watch_namespace.is_none());
    }

    #[test]
    fn test_unparseable_value_falls_back() {
        assert_eq!(env_var_or_default("DATABASE_OPERATOR_TEST_UNSET_VAR", 7u64), 7);
    }
}
