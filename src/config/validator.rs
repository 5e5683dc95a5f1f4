//! Configuration validation for the desired state.
//!
//! Collects every problem found in one pass so the operator sees all of
//! them at once; the first error is surfaced as the failure.

use crate::error::{ConfigError, ConvergeError, Result};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{
    ConvergeConfig, LaunchTemplateSpec, MachinePoolConfig, NetworkConfig, ObjectStoreBackend,
};

/// Scaling processes the autoscaling service knows about.
const KNOWN_PROCESSES: &[&str] = &[
    "Launch",
    "Terminate",
    "AddToLoadBalancer",
    "AlarmNotification",
    "AZRebalance",
    "HealthCheck",
    "InstanceRefresh",
    "ReplaceUnhealthy",
    "ScheduledActions",
];

/// Validator for the desired-state configuration.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any check fails.
    pub fn validate(&self, config: &ConvergeConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        match result.errors.first() {
            None => {
                debug!("Configuration validation passed");
                Ok(result)
            }
            Some(first) => Err(ConvergeError::Config(ConfigError::ValidationError {
                message: first.message.clone(),
                field: Some(first.field.clone()),
            })),
        }
    }

    /// Runs every check and returns all findings without failing.
    #[must_use]
    pub fn check(&self, config: &ConvergeConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_cluster(config, &mut result);
        if let Some(network) = &config.network {
            Self::validate_network(network, &mut result);
        }
        Self::validate_object_store(config, &mut result);
        Self::validate_launch_templates(&config.launch_templates, &mut result);
        Self::validate_machine_pools(config, &mut result);

        if config.retention.keep_latest == 0 {
            result.errors.push(ValidationError {
                field: String::from("retention.keep_latest"),
                message: String::from("At least one version must be retained"),
            });
        }
        if config.retry.multiplier < 1.0 {
            result.errors.push(ValidationError {
                field: String::from("retry.multiplier"),
                message: String::from("Backoff multiplier must be at least 1.0"),
            });
        }

        result
    }

    fn validate_cluster(config: &ConvergeConfig, result: &mut ValidationResult) {
        let cluster = &config.cluster;
        if cluster.name.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("cluster.name"),
                message: String::from("Cluster name cannot be empty"),
            });
        } else if !is_valid_name(&cluster.name) {
            result.errors.push(ValidationError {
                field: String::from("cluster.name"),
                message: format!(
                    "Cluster name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    cluster.name
                ),
            });
        }

        for key in cluster.additional_tags.keys() {
            if key.starts_with(crate::tags::RESERVED_TAG_PREFIX) {
                result.errors.push(ValidationError {
                    field: format!("cluster.additional_tags.{key}"),
                    message: format!("Tag key '{key}' uses the provider-reserved prefix"),
                });
            }
        }
    }

    fn validate_network(network: &NetworkConfig, result: &mut ValidationResult) {
        if !is_valid_cidr(&network.cidr) {
            result.errors.push(ValidationError {
                field: String::from("network.cidr"),
                message: format!("Invalid CIDR block: {}", network.cidr),
            });
        }

        let mut seen = HashSet::new();
        for (i, group) in network.security_groups.iter().enumerate() {
            let prefix = format!("network.security_groups[{i}]");
            if !seen.insert(&group.name) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!("Duplicate security group name: {}", group.name),
                });
            }
            for (j, rule) in group.ingress.iter().enumerate() {
                if rule.from_port > rule.to_port {
                    result.errors.push(ValidationError {
                        field: format!("{prefix}.ingress[{j}]"),
                        message: format!(
                            "Port range {}-{} is inverted",
                            rule.from_port, rule.to_port
                        ),
                    });
                }
                if !is_valid_cidr(&rule.cidr) {
                    result.errors.push(ValidationError {
                        field: format!("{prefix}.ingress[{j}].cidr"),
                        message: format!("Invalid CIDR block: {}", rule.cidr),
                    });
                }
            }
        }
    }

    fn validate_object_store(config: &ConvergeConfig, result: &mut ValidationResult) {
        let Some(store) = &config.object_store else {
            return;
        };
        if store.bucket.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("object_store.bucket"),
                message: String::from("Bucket name cannot be empty"),
            });
        }
        if store.backend == ObjectStoreBackend::S3
            && store.region.is_none()
            && config.cluster.region.is_none()
        {
            result.warnings.push(String::from(
                "object_store.region: no region set, the AWS environment default is used",
            ));
        }
    }

    fn validate_launch_templates(templates: &[LaunchTemplateSpec], result: &mut ValidationResult) {
        let mut seen = HashSet::new();

        for (i, template) in templates.iter().enumerate() {
            let prefix = format!("launch_templates[{i}]");

            if !seen.insert(&template.name) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!("Duplicate launch template name: {}", template.name),
                });
            }

            if template.instance_type.trim().is_empty() {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.instance_type"),
                    message: format!("Launch template '{}' has no instance type", template.name),
                });
            }

            if template.image.id.is_none() && template.image.lookup.is_none() {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.image"),
                    message: format!(
                        "Launch template '{}' needs an image id or an image lookup",
                        template.name
                    ),
                });
            }

            if template.user_data.is_some() && template.user_data_file.is_some() {
                result.warnings.push(format!(
                    "{prefix}: both user_data and user_data_file set, inline user_data wins"
                ));
            }

            if let Some(opts) = &template.metadata_options
                && !(1..=64).contains(&opts.hop_limit)
            {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.metadata_options.hop_limit"),
                    message: format!("Hop limit {} is outside 1-64", opts.hop_limit),
                });
            }
        }
    }

    fn validate_machine_pools(config: &ConvergeConfig, result: &mut ValidationResult) {
        let mut seen = HashSet::new();

        for (i, pool) in config.machine_pools.iter().enumerate() {
            let prefix = format!("machine_pools[{i}]");

            if !seen.insert(&pool.name) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!("Duplicate machine pool name: {}", pool.name),
                });
            }

            if config.launch_template(&pool.launch_template).is_none() {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.launch_template"),
                    message: format!(
                        "Launch template '{}' referenced by pool '{}' is not defined",
                        pool.launch_template, pool.name
                    ),
                });
            }

            Self::validate_sizes(pool, &prefix, result);

            if pool.refresh.min_healthy_percentage > 100 {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.refresh.min_healthy_percentage"),
                    message: String::from("Minimum healthy percentage cannot exceed 100"),
                });
            }

            for process in &pool.suspended_processes {
                if !KNOWN_PROCESSES.contains(&process.as_str()) {
                    result.warnings.push(format!(
                        "{prefix}.suspended_processes: unknown process '{process}'"
                    ));
                }
            }
        }
    }

    fn validate_sizes(pool: &MachinePoolConfig, prefix: &str, result: &mut ValidationResult) {
        if pool.min_size > pool.max_size {
            result.errors.push(ValidationError {
                field: format!("{prefix}.min_size"),
                message: format!(
                    "min_size {} is greater than max_size {}",
                    pool.min_size, pool.max_size
                ),
            });
        }

        if let Some(desired) = pool.desired_capacity
            && !(pool.min_size..=pool.max_size).contains(&desired)
        {
            result.errors.push(ValidationError {
                field: format!("{prefix}.desired_capacity"),
                message: format!(
                    "desired_capacity {desired} is outside {}-{}",
                    pool.min_size, pool.max_size
                ),
            });
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.ends_with('-')
        && !name.contains("--")
}

/// Checks an IPv4 CIDR block such as `10.0.0.0/16`.
fn is_valid_cidr(cidr: &str) -> bool {
    let Some((addr, len)) = cidr.split_once('/') else {
        return false;
    };
    addr.parse::<std::net::Ipv4Addr>().is_ok() && len.parse::<u8>().is_ok_and(|l| l <= 32)
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::error::ErrorClass;

    fn parse(yaml: &str) -> ConvergeConfig {
        ConfigParser::new().parse_yaml(yaml, None).expect("parse")
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("prod"));
        assert!(is_valid_name("prod-eu-1"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Prod"));
        assert!(!is_valid_name("1prod"));
        assert!(!is_valid_name("prod-"));
        assert!(!is_valid_name("prod--eu"));
    }

    #[test]
    fn test_cidr() {
        assert!(is_valid_cidr("10.0.0.0/16"));
        assert!(is_valid_cidr("0.0.0.0/0"));
        assert!(!is_valid_cidr("10.0.0.0"));
        assert!(!is_valid_cidr("10.0.0.0/33"));
        assert!(!is_valid_cidr("10.0.0/16"));
    }

    #[test]
    fn test_collects_all_errors() {
        let config = parse(
            r"
cluster:
  name: prod
launch_templates:
  - name: workers
    instance_type: ''
    image: { id: ami-1 }
machine_pools:
  - name: workers
    launch_template: missing
    min_size: 3
    max_size: 1
",
        );

        let result = ConfigValidator::new().check(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();

        assert!(fields.contains(&"launch_templates[0].instance_type"));
        assert!(fields.contains(&"machine_pools[0].launch_template"));
        assert!(fields.contains(&"machine_pools[0].min_size"));
    }

    #[test]
    fn test_first_error_is_validation_class() {
        let config = parse(
            r"
cluster:
  name: Bad_Name
",
        );

        let err = ConfigValidator::new()
            .validate(&config)
            .expect_err("invalid");
        assert_eq!(err.class(), ErrorClass::Validation);
    }

    #[test]
    fn test_valid_config_with_warnings() {
        let config = parse(
            r"
cluster:
  name: prod
launch_templates:
  - name: workers
    instance_type: m5.large
    image: { id: ami-1 }
machine_pools:
  - name: workers
    launch_template: workers
    min_size: 1
    max_size: 3
    suspended_processes: [Bogus]
",
        );

        let result = ConfigValidator::new().validate(&config).expect("valid");
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 1);
    }
}
