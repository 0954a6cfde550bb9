//! Configuration parser for loading and merging configuration files.
//!
//! Configuration comes from a YAML file, optionally overridden by
//! `TASKSTACK_*` environment variables and a `.env` file next to it.

use crate::error::{ConfigError, Result, StackError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::StackConfig;

/// Environment overrides: variable name and the field it replaces.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("TASKSTACK_PROJECT_NAME", "project.name"),
    ("TASKSTACK_ENVIRONMENT", "project.environment"),
    ("TASKSTACK_REGION", "project.region"),
    ("TASKSTACK_STATE_BUCKET", "state.bucket"),
    ("TASKSTACK_STATE_PREFIX", "state.prefix"),
];

/// Configuration parser for loading stack configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving `.env` and relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(StackError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            StackError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        let mut config = self.parse_yaml(&content, Some(path))?;
        self.resolve_paths(&mut config, path);
        Ok(config)
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackConfig> {
        debug!("Parsing YAML configuration");

        let config: StackConfig = serde_yaml::from_str(content).map_err(|e| {
            StackError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })?;

        debug!(
            "Parsed configuration for {}/{}",
            config.project.name, config.project.environment
        );
        Ok(config)
    }

    /// Loads configuration and applies `TASKSTACK_*` overrides from the
    /// process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok());
        Ok(config)
    }

    /// Applies environment overrides using the given variable reader.
    pub fn apply_env_overrides(config: &mut StackConfig, read: impl Fn(&str) -> Option<String>) {
        for (var, field) in ENV_OVERRIDES {
            let Some(value) = read(var) else {
                continue;
            };
            debug!("Overriding {field} from {var}");
            match *field {
                "project.name" => config.project.name = value,
                "project.environment" => config.project.environment = value,
                "project.region" => config.project.region = value,
                "state.bucket" => config.state.bucket = Some(value),
                "state.prefix" => config.state.prefix = Some(value),
                _ => {}
            }
        }
    }

    /// Makes a relative `site.bundle_dir` relative to the config file.
    fn resolve_paths(&self, config: &mut StackConfig, config_path: &Path) {
        let Some(dir) = config.site.bundle_dir.as_ref() else {
            return;
        };
        let dir_path = Path::new(dir);
        if dir_path.is_absolute() {
            return;
        }
        let base = self
            .base_path
            .clone()
            .or_else(|| config_path.parent().map(Path::to_path_buf))
            .unwrap_or_default();
        config.site.bundle_dir = Some(base.join(dir_path).display().to_string());
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                StackError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "taskstack.deploy.yaml",
    "taskstack.deploy.yml",
    "deploy.yaml",
    "deploy.yml",
];

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(StackError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::spec::{SecretSource, StateBackend};
    use std::collections::HashMap;
    use tempfile::TempDir;

    const MINIMAL: &str = r"
project:
  name: taskstack
database:
  password:
    env: DB_PASSWORD
";

    #[test]
    fn test_parse_minimal_config() {
        let config = ConfigParser::new().parse_yaml(MINIMAL, None).unwrap();

        assert_eq!(config.project.name, "taskstack");
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.project.region, "us-east-1");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.database.engine_version, "16");
        assert_eq!(config.apply.max_concurrency, 4);
        assert_eq!(
            config.database.password,
            SecretSource::Env("DB_PASSWORD".into())
        );
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
project:
  name: taskstack
  environment: prod
  region: eu-west-1

state:
  backend: s3
  bucket: taskstack-state
  prefix: taskstack/prod

site:
  bundle_dir: /srv/frontend/dist
  force_destroy: false

api:
  instance_type: t3.small
  port: 8080
  ami:
    owners: ["099720109477"]
    name_pattern: "ubuntu/images/*"

database:
  instance_class: db.t3.small
  allocated_storage_gb: 50
  password:
    ssm_parameter: /taskstack/prod/db-password

apply:
  max_concurrency: 2
  max_retries: 5

tags:
  Owner: platform
"#;
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();

        assert_eq!(config.project.environment, "prod");
        assert_eq!(config.state.bucket.as_deref(), Some("taskstack-state"));
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.api.ami.owners, vec!["099720109477".to_string()]);
        assert_eq!(config.database.allocated_storage_gb, 50);
        assert_eq!(config.apply.max_retries, 5);
        assert_eq!(config.apply.retry_delay_ms, 2000);
        assert_eq!(config.tags.get("Owner").map(String::as_str), Some("platform"));
        assert!(!config.site.force_destroy);
    }

    #[test]
    fn test_missing_password_is_a_parse_error() {
        let yaml = r"
project:
  name: taskstack
database:
  username: appuser
";
        let err = ConfigParser::new().parse_yaml(yaml, None).unwrap_err();
        assert!(matches!(err, StackError::Config(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ConfigParser::new().parse_yaml(MINIMAL, None).unwrap();
        let vars: HashMap<&str, &str> = HashMap::from([
            ("TASKSTACK_ENVIRONMENT", "staging"),
            ("TASKSTACK_STATE_BUCKET", "shared-state"),
        ]);

        ConfigParser::apply_env_overrides(&mut config, |name| {
            vars.get(name).map(|v| (*v).to_string())
        });

        assert_eq!(config.project.environment, "staging");
        assert_eq!(config.project.name, "taskstack");
        assert_eq!(config.state.bucket.as_deref(), Some("shared-state"));
    }

    #[test]
    fn test_bundle_dir_is_relative_to_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taskstack.deploy.yaml");
        let yaml = format!("{MINIMAL}site:\n  bundle_dir: frontend/dist\n");
        std::fs::write(&path, yaml).unwrap();

        let config = ConfigParser::new().load_file(&path).unwrap();
        let expected = dir.path().join("frontend/dist").display().to_string();
        assert_eq!(config.site.bundle_dir.as_deref(), Some(expected.as_str()));
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("taskstack.deploy.yaml"), MINIMAL).unwrap();
        let nested = dir.path().join("infra").join("nested");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("taskstack.deploy.yaml"));
    }

    #[test]
    fn test_init_template_is_valid() {
        let config = ConfigParser::new()
            .parse_yaml(include_str!("../../templates/taskstack.deploy.yaml"), None)
            .unwrap();
        let result = crate::config::ConfigValidator::new().validate(&config).unwrap();

        assert!(result.errors.is_empty());
        assert_eq!(
            config.database.password,
            SecretSource::SsmParameter("/tasks/dev/db-password".into())
        );
    }
}
