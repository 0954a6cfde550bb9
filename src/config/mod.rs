//! Configuration module for the taskstack deployment tool.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `taskstack.deploy.yaml`
//! - Validation of configuration values
//! - Hashing resource inputs and configurations for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    AmiConfig, ApiConfig, ApplyConfig, DatabaseConfig, ProjectConfig, SecretSource, SiteConfig,
    StackConfig, StateBackend, StateConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use validator::{ConfigValidator, ValidationError, ValidationResult, is_valid_name};
pub use hash::ConfigHasher;
