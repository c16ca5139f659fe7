//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (rates, cooldowns, step sizes, caps)
//! - Resolve protocol names in bucket and policy entries
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Sections that are disabled are not range-checked

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::NlbConfig;
use crate::inspector::{parse_protocol, Protocol};

/// One failed check, keyed by the offending field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &NlbConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.admin.enabled && config.admin.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "admin.bind_address",
            format!("not a socket address: {}", config.admin.bind_address),
        ));
    }

    let rl = &config.rate_limit;
    if rl.enabled {
        if !(rl.default_capacity > 0.0) {
            errors.push(ValidationError::new("rate_limit.default_capacity", "must be positive"));
        }
        if !(rl.default_refill_rate > 0.0) {
            errors.push(ValidationError::new("rate_limit.default_refill_rate", "must be positive"));
        }
        for (i, bucket) in rl.buckets.iter().enumerate() {
            let field = |name: &str| format!("rate_limit.buckets[{i}].{name}");
            if bucket.name.trim().is_empty() {
                errors.push(ValidationError::new(field("name"), "must not be empty"));
            }
            if bucket.protocol() == Protocol::Unknown {
                errors.push(ValidationError::new(
                    field("protocol"),
                    format!("unknown protocol: {}", bucket.protocol),
                ));
            }
            if !(bucket.capacity > 0.0) {
                errors.push(ValidationError::new(field("capacity"), "must be positive"));
            }
            if !(bucket.refill_rate > 0.0) {
                errors.push(ValidationError::new(field("refill_rate"), "must be positive"));
            }
        }
    }

    let autoscale = &config.autoscale;
    if autoscale.enabled {
        if autoscale.interval_secs == 0 {
            errors.push(ValidationError::new("autoscale.interval_secs", "must be positive"));
        }
        if autoscale.scale_up_cooldown_secs == 0 {
            errors.push(ValidationError::new("autoscale.scale_up_cooldown_secs", "must be positive"));
        }
        if autoscale.scale_down_cooldown_secs == 0 {
            errors.push(ValidationError::new("autoscale.scale_down_cooldown_secs", "must be positive"));
        }
        if autoscale.max_history == 0 {
            errors.push(ValidationError::new("autoscale.max_history", "must be positive"));
        }
        for (i, entry) in autoscale.policies.iter().enumerate() {
            let field = format!("autoscale.policies[{i}]");
            if parse_protocol(&entry.protocol) == Protocol::Unknown {
                errors.push(ValidationError::new(
                    format!("{field}.protocol"),
                    format!("unknown protocol: {}", entry.protocol),
                ));
                continue;
            }
            if let Err(e) = autoscale.resolve(entry).validate() {
                errors.push(ValidationError::new(field, e.to_string()));
            }
        }
    }

    let bg = &config.blue_green;
    if bg.enabled {
        if !(1..=100).contains(&bg.step_size) {
            errors.push(ValidationError::new("blue_green.step_size", "must be between 1 and 100"));
        }
        if bg.step_duration_secs == 0 {
            errors.push(ValidationError::new("blue_green.step_duration_secs", "must be positive"));
        }
        if bg.tick_interval_ms == 0 {
            errors.push(ValidationError::new("blue_green.tick_interval_ms", "must be positive"));
        }
    }

    let modules = &config.modules;
    if modules.max_modules_per_protocol == 0 {
        errors.push(ValidationError::new("modules.max_modules_per_protocol", "must be positive"));
    }
    if modules.max_connections_per_module == 0 {
        errors.push(ValidationError::new("modules.max_connections_per_module", "must be positive"));
    }
    if modules.health_check_interval_secs == 0 {
        errors.push(ValidationError::new("modules.health_check_interval_secs", "must be positive"));
    }
    if modules.connect_timeout_secs == 0 {
        errors.push(ValidationError::new("modules.connect_timeout_secs", "must be positive"));
    }
    if modules.reconnect_max_delay_ms < modules.reconnect_base_delay_ms {
        errors.push(ValidationError::new(
            "modules.reconnect_max_delay_ms",
            "must not be below reconnect_base_delay_ms",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{BucketConfig, PolicyConfig};

    fn fields(errors: &[ValidationError]) -> Vec<&str> {
        errors.iter().map(|e| e.field.as_str()).collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(validate_config(&NlbConfig::default()), Ok(()));
    }

    #[test]
    fn test_collects_every_error() {
        let mut config = NlbConfig::default();
        config.admin.bind_address = "nowhere".into();
        config.rate_limit.default_capacity = 0.0;
        config.blue_green.step_size = 0;
        config.modules.max_connections_per_module = 0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            fields(&errors),
            vec![
                "admin.bind_address",
                "rate_limit.default_capacity",
                "blue_green.step_size",
                "modules.max_connections_per_module",
            ]
        );
    }

    #[test]
    fn test_disabled_sections_are_skipped() {
        let mut config = NlbConfig::default();
        config.blue_green.enabled = false;
        config.blue_green.step_size = 500;
        config.autoscale.enabled = false;
        config.autoscale.interval_secs = 0;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_bucket_and_policy_entries() {
        let mut config = NlbConfig::default();
        config.rate_limit.buckets.push(BucketConfig {
            name: "gopher".into(),
            protocol: "gopher".into(),
            capacity: 10.0,
            refill_rate: 1.0,
        });
        config.autoscale.policies.push(PolicyConfig {
            protocol: "mysql".into(),
            min_replicas: Some(5),
            max_replicas: Some(2),
            target_cpu: None,
            target_memory: None,
            target_conn_per_replica: None,
            scale_up_threshold: None,
            scale_down_threshold: None,
            evaluation_periods: None,
        });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            fields(&errors),
            vec!["rate_limit.buckets[0].protocol", "autoscale.policies[0]"]
        );
        assert!(errors[1].message.contains("max_replicas"));
    }
}
