use std::time::Duration;

use thiserror::Error;

/// Tuning knobs for the correlation engine, registry and dispatchers.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upper bound on each Metadata Resolver round trip during enrichment.
    pub resolver_timeout: Duration,
    /// Upper bound on a single subscriber delivery.
    pub delivery_timeout: Duration,
    /// Pending forwards older than this are evicted by the sweeper.
    pub pending_max_age: Duration,
    /// Interval between sweeper runs.
    pub sweep_interval: Duration,
    /// Maximum number of pending forwards held at once.
    pub max_pending: usize,
    /// How long `stop()` waits for dispatchers to exit.
    pub shutdown_grace: Duration,
    /// Substituted for identities and aliases that could not be resolved.
    pub placeholder: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            resolver_timeout: Duration::from_secs(5),
            delivery_timeout: Duration::from_secs(2),
            pending_max_age: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            max_pending: 50_000,
            shutdown_grace: Duration::from_secs(5),
            placeholder: "unknown".to_string(),
        }
    }
}

/// Rejected configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("placeholder must not be empty")]
    EmptyPlaceholder,
}

impl RelayConfig {
    /// Check that every duration and capacity is usable.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Zero` naming the first zero-valued field, or
    /// `ConfigError::EmptyPlaceholder`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("resolver_timeout", self.resolver_timeout),
            ("delivery_timeout", self.delivery_timeout),
            ("pending_max_age", self.pending_max_age),
            ("sweep_interval", self.sweep_interval),
            ("shutdown_grace", self.shutdown_grace),
        ];
        if let Some((field, _)) = durations.into_iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Zero { field });
        }
        if self.max_pending == 0 {
            return Err(ConfigError::Zero {
                field: "max_pending",
            });
        }
        if self.placeholder.is_empty() {
            return Err(ConfigError::EmptyPlaceholder);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.resolver_timeout, Duration::from_secs(5));
        assert_eq!(config.delivery_timeout, Duration::from_secs(2));
        assert_eq!(config.pending_max_age, Duration::from_secs(3600));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.max_pending, 50_000);
        assert_eq!(config.placeholder, "unknown");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_duration_is_rejected() {
        let config = RelayConfig {
            delivery_timeout: Duration::ZERO,
            ..RelayConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "delivery_timeout"
            })
        );
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = RelayConfig {
            max_pending: 0,
            ..RelayConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "max_pending"
            })
        );
    }

    #[test]
    fn empty_placeholder_is_rejected() {
        let config = RelayConfig {
            placeholder: String::new(),
            ..RelayConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::EmptyPlaceholder));
    }
}
