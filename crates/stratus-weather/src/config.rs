//! Orchestrator configuration.

use std::time::Duration;

use crate::retry::RetryConfig;

/// Configuration validation errors
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Result of config validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationResult {
    /// Returns true if there are no errors (warnings are OK)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add an error
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError { field: field.into(), message: message.into() });
    }

    /// Add a warning
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError { field: field.into(), message: message.into() });
    }
}

/// Tuning knobs for the fetch orchestrator and its coalescers.
///
/// The in-flight tolerance and the coalescer tolerance default to the same
/// number but guard different invariants (duplicate concurrent work vs.
/// politeness to the upstream API). They stay independently configurable.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// A non-forced request within this interval of the last success is a no-op.
    pub minimum_fetch_interval: Duration,
    /// Non-forced requests this close to an active fetch are dropped.
    pub in_flight_tolerance_deg: f64,
    /// Merge distance for pending primary / air-quality requests.
    pub coalesce_tolerance_deg: f64,
    /// Merge distance for pending alert requests. Alerts are regional, so
    /// this is looser than the point-specific tolerance.
    pub alert_tolerance_deg: f64,
    /// How long a pending batch waits for nearby requests before dispatch.
    pub coalesce_window: Duration,
    /// Pending-entry count that triggers an immediate flush.
    pub max_batch_size: usize,
    /// Per-request connect timeout.
    pub request_timeout: Duration,
    /// Overall per-transfer timeout.
    pub resource_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            minimum_fetch_interval: Duration::from_secs(60),
            in_flight_tolerance_deg: 0.05,
            coalesce_tolerance_deg: 0.05,
            alert_tolerance_deg: 0.25,
            coalesce_window: Duration::from_secs(2),
            max_batch_size: 5,
            request_timeout: Duration::from_secs(15),
            resource_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

impl FetchConfig {
    /// Validate the configuration, collecting all problems at once.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.in_flight_tolerance_deg <= 0.0 {
            result.add_error("in_flight_tolerance_deg", "must be positive");
        }
        if self.coalesce_tolerance_deg <= 0.0 {
            result.add_error("coalesce_tolerance_deg", "must be positive");
        }
        if self.alert_tolerance_deg < self.coalesce_tolerance_deg {
            result.add_warning(
                "alert_tolerance_deg",
                "alerts are regional; a tolerance below the primary tolerance defeats merging",
            );
        }
        if self.max_batch_size == 0 {
            result.add_error("max_batch_size", "must be at least 1");
        }
        if self.coalesce_window.is_zero() {
            result.add_error("coalesce_window", "must be non-zero");
        }
        if self.retry.max_attempts == 0 {
            result.add_error("retry.max_attempts", "must be at least 1");
        }
        if self.retry.initial_delay > self.retry.max_delay {
            result.add_error("retry.initial_delay", "exceeds retry.max_delay");
        }
        if self.minimum_fetch_interval < Duration::from_secs(10) {
            result.add_warning(
                "minimum_fetch_interval",
                "intervals under 10s will hammer the upstream API",
            );
        }
        if self.request_timeout > self.resource_timeout {
            result.add_error("request_timeout", "exceeds resource_timeout");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let result = FetchConfig::default().validate();
        assert!(result.is_valid());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_zero_tolerance_rejected() {
        let config = FetchConfig { coalesce_tolerance_deg: 0.0, ..Default::default() };
        let result = config.validate();
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.field == "coalesce_tolerance_deg"));
    }

    #[test]
    fn test_aggressive_interval_warns() {
        let config =
            FetchConfig { minimum_fetch_interval: Duration::from_secs(1), ..Default::default() };
        let result = config.validate();
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_defaults_match_policy() {
        let config = FetchConfig::default();
        assert_eq!(config.minimum_fetch_interval, Duration::from_secs(60));
        assert!((config.in_flight_tolerance_deg - 0.05).abs() < f64::EPSILON);
        assert!((config.coalesce_tolerance_deg - 0.05).abs() < f64::EPSILON);
        assert_eq!(config.max_batch_size, 5);
        assert_eq!(config.coalesce_window, Duration::from_secs(2));
    }
}
