//! Configuration validation for stack configs.
//!
//! Validation collects every problem it can find (errors and warnings)
//! before the blueprint is built, so a bad config never reaches a backend.

use crate::error::{ConfigError, Result, StackError};
use tracing::debug;

use super::spec::{
    ApiConfig, ApplyConfig, DatabaseConfig, ProjectConfig, SecretSource, SiteConfig, StackConfig,
    StateBackend, StateConfig,
};

/// Upper bound for `apply.max_concurrency`.
const MAX_CONCURRENCY: usize = 32;

/// RDS storage bounds for general purpose volumes, in GB.
const MIN_STORAGE_GB: u32 = 20;
const MAX_STORAGE_GB: u32 = 65_536;

/// Engines the blueprint knows how to wire.
const SUPPORTED_ENGINES: &[&str] = &["postgres"];

/// Validator for stack configurations.
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

    /// Validates a stack configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(StackError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Runs every check and returns the full result without failing.
    #[must_use]
    pub fn check(&self, config: &StackConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_site(&config.site, &mut result);
        Self::validate_api(&config.api, &mut result);
        Self::validate_database(&config.database, &mut result);
        Self::validate_apply(&config.apply, &mut result);
        Self::validate_tags(config, &mut result);

        result
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if !is_valid_name(&project.environment) {
            result.error(
                "project.environment",
                format!(
                    "Environment '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.environment
                ),
            );
        }

        // Bucket names are capped at 63 characters and carry a suffix.
        let prefix_len = project.name.len() + project.environment.len() + 1;
        if prefix_len > 40 {
            result.error(
                "project.name",
                format!("Project and environment names are too long ({prefix_len} > 40 characters)"),
            );
        }

        if !is_valid_region(&project.region) {
            result.error(
                "project.region",
                format!("Region '{}' is not a valid AWS region name", project.region),
            );
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
                if state.path.is_some() {
                    result
                        .warnings
                        .push(String::from("state.path is ignored by the s3 backend"));
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }
    }

    fn validate_site(site: &SiteConfig, result: &mut ValidationResult) {
        if site.index_document.is_empty() || site.index_document.contains('/') {
            result.error(
                "site.index_document",
                "Index document must be a plain file name",
            );
        }
        if site.error_document.is_empty() {
            result.error("site.error_document", "Error document cannot be empty");
        }
        if site.cors_origins.is_empty() {
            result.warnings.push(String::from(
                "site.cors_origins is empty; browsers on other origins cannot fetch site objects",
            ));
        }
        if let Some(dir) = &site.bundle_dir {
            if !std::path::Path::new(dir).is_dir() {
                result.warnings.push(format!(
                    "site.bundle_dir '{dir}' does not exist yet; build the frontend before apply"
                ));
            }
        }
    }

    fn validate_api(api: &ApiConfig, result: &mut ValidationResult) {
        if api.port == 0 {
            result.error("api.port", "API port must be between 1 and 65535");
        }
        if !api.health_path.starts_with('/') {
            result.error(
                "api.health_path",
                format!("Health path must start with '/': {}", api.health_path),
            );
        }
        if api.instance_type.split('.').count() != 2 {
            result.error(
                "api.instance_type",
                format!("Instance type '{}' is not of the form family.size", api.instance_type),
            );
        }
        for (i, cidr) in api.ingress_cidrs.iter().enumerate() {
            if !is_valid_cidr(cidr) {
                result.error(
                    format!("api.ingress_cidrs[{i}]"),
                    format!("Invalid IPv4 CIDR block: {cidr}"),
                );
            }
        }
        if api.ingress_cidrs.is_empty() {
            result
                .warnings
                .push(String::from("api.ingress_cidrs is empty; the API is unreachable"));
        }
        if api.ami.owners.is_empty() {
            result.error("api.ami.owners", "At least one image owner is required");
        }
        if api.ami.name_pattern.is_empty() {
            result.error("api.ami.name_pattern", "Image name pattern cannot be empty");
        }
        for (i, arn) in api.managed_policies.iter().enumerate() {
            if !arn.starts_with("arn:aws:iam::") {
                result.error(
                    format!("api.managed_policies[{i}]"),
                    format!("Not an IAM policy ARN: {arn}"),
                );
            }
        }
    }

    fn validate_database(db: &DatabaseConfig, result: &mut ValidationResult) {
        if !SUPPORTED_ENGINES.contains(&db.engine.as_str()) {
            result.error(
                "database.engine",
                format!("Unsupported engine '{}'", db.engine),
            );
        }
        if !(MIN_STORAGE_GB..=MAX_STORAGE_GB).contains(&db.allocated_storage_gb) {
            result.error(
                "database.allocated_storage_gb",
                format!(
                    "Allocated storage must be between {MIN_STORAGE_GB} and {MAX_STORAGE_GB} GB"
                ),
            );
        }
        if !is_valid_identifier(&db.name) {
            result.error(
                "database.name",
                format!("Database name '{}' must start with a letter and be alphanumeric", db.name),
            );
        }
        if !is_valid_identifier(&db.username) {
            result.error(
                "database.username",
                format!("Username '{}' must start with a letter and be alphanumeric", db.username),
            );
        }
        match &db.password {
            SecretSource::SsmParameter(name) if !name.starts_with('/') => {
                result.error(
                    "database.password.ssm_parameter",
                    format!("SSM parameter names must be absolute paths: {name}"),
                );
            }
            SecretSource::Env(name) if name.is_empty() => {
                result.error("database.password.env", "Variable name cannot be empty");
            }
            _ => {}
        }
        if !db.skip_final_snapshot {
            result.warnings.push(String::from(
                "database.skip_final_snapshot is false; destroy leaves a final snapshot behind",
            ));
        }
    }

    fn validate_apply(apply: &ApplyConfig, result: &mut ValidationResult) {
        if apply.max_concurrency == 0 {
            result.error("apply.max_concurrency", "Concurrency must be at least 1");
        } else if apply.max_concurrency > MAX_CONCURRENCY {
            result.error(
                "apply.max_concurrency",
                format!("Concurrency above {MAX_CONCURRENCY} invites API throttling"),
            );
        }
        if apply.max_retries > 10 {
            result
                .warnings
                .push(format!("apply.max_retries: {} retries is unusual", apply.max_retries));
        }
    }

    fn validate_tags(config: &StackConfig, result: &mut ValidationResult) {
        for key in config.tags.keys() {
            if key.starts_with("aws:") {
                result.error(format!("tags.{key}"), "Tag keys cannot use the aws: prefix");
            }
            if key.starts_with("taskstack:") {
                result.error(
                    format!("tags.{key}"),
                    "The taskstack: tag prefix is reserved",
                );
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Database identifiers: a letter followed by letters, digits or underscores.
fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 63
}

/// Region names look like `us-east-1` or `ap-southeast-2`.
fn is_valid_region(region: &str) -> bool {
    let parts: Vec<&str> = region.split('-').collect();
    parts.len() >= 3
        && parts[..parts.len() - 1]
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_lowercase()))
        && parts[parts.len() - 1].parse::<u8>().is_ok()
}

fn is_valid_cidr(cidr: &str) -> bool {
    let Some((addr, len)) = cidr.split_once('/') else {
        return false;
    };
    addr.parse::<std::net::Ipv4Addr>().is_ok() && len.parse::<u8>().is_ok_and(|l| l <= 32)
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

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

    fn config(yaml_tail: &str) -> StackConfig {
        let yaml = format!(
            "project:\n  name: taskstack\ndatabase:\n  password:\n    ssm_parameter: /taskstack/dev/db\n{yaml_tail}"
        );
        ConfigParser::new().parse_yaml(&yaml, None).unwrap()
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("taskstack"));
        assert!(is_valid_name("my-app-123"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Task-Stack")); // uppercase
        assert!(!is_valid_name("123-app")); // starts with number
        assert!(!is_valid_name("task_stack")); // underscore
        assert!(!is_valid_name("app-")); // ends with hyphen
        assert!(!is_valid_name("app--x")); // consecutive hyphens
    }

    #[test]
    fn test_region_and_cidr_formats() {
        assert!(is_valid_region("us-east-1"));
        assert!(is_valid_region("ap-southeast-2"));
        assert!(!is_valid_region("useast1"));
        assert!(!is_valid_region("us-east-x"));

        assert!(is_valid_cidr("0.0.0.0/0"));
        assert!(is_valid_cidr("10.0.0.0/16"));
        assert!(!is_valid_cidr("10.0.0.0/33"));
        assert!(!is_valid_cidr("10.0.0.0"));
    }

    #[test]
    fn test_default_config_is_valid() {
        let result = ConfigValidator::new().check(&config(""));
        assert!(result.is_valid(), "{:?}", result.errors);
    }

    #[test]
    fn test_s3_backend_requires_bucket() {
        let cfg = config("state:\n  backend: s3\n");
        let err = ConfigValidator::new().validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("S3 bucket name is required"));
    }

    #[test]
    fn test_collects_every_error() {
        let cfg = config(
            "api:\n  port: 0\n  health_path: health\napply:\n  max_concurrency: 0\n",
        );
        let result = ConfigValidator::new().check(&cfg);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();

        assert_eq!(result.error_count(), 3);
        assert!(fields.contains(&"api.port"));
        assert!(fields.contains(&"api.health_path"));
        assert!(fields.contains(&"apply.max_concurrency"));
    }

    #[test]
    fn test_relative_ssm_parameter_is_rejected() {
        let yaml = "project:\n  name: taskstack\ndatabase:\n  password:\n    ssm_parameter: db-password\n";
        let cfg = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        let result = ConfigValidator::new().check(&cfg);
        assert_eq!(result.errors[0].field, "database.password.ssm_parameter");
    }

    #[test]
    fn test_reserved_tag_prefix() {
        let cfg = config("tags:\n  taskstack:owner: me\n");
        let result = ConfigValidator::new().check(&cfg);
        assert!(!result.is_valid());
    }
}
