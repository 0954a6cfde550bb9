//! Configuration specification types for the stack.
//!
//! This module defines the structs that map to `taskstack.deploy.yaml`.
//! They describe the desired stack declaratively; the blueprint turns them
//! into a resource plan.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The root configuration structure for a taskstack deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Static site (S3 website) configuration.
    #[serde(default)]
    pub site: SiteConfig,
    /// API host (EC2) configuration.
    #[serde(default)]
    pub api: ApiConfig,
    /// Managed Postgres (RDS) configuration.
    pub database: DatabaseConfig,
    /// Apply scheduler settings.
    #[serde(default)]
    pub apply: ApplyConfig,
    /// Tags added to every resource that supports them.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Project name; prefix of every physical resource name.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
    /// AWS region all resources are created in.
    #[serde(default = "default_region")]
    pub region: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, falls back to the project region).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state file path (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Static website bucket configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SiteConfig {
    /// Directory of built frontend files to upload (optional).
    #[serde(default)]
    pub bundle_dir: Option<String>,
    /// Document served for `/`.
    #[serde(default = "default_index_document")]
    pub index_document: String,
    /// Document served for unknown paths (SPA routing falls back to index).
    #[serde(default = "default_index_document")]
    pub error_document: String,
    /// Empty the bucket before deleting it.
    #[serde(default = "default_true")]
    pub force_destroy: bool,
    /// CORS origins allowed to GET/HEAD site objects.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

/// API host configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiConfig {
    /// EC2 instance type.
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    /// Port the CRUD service listens on; opened to the world.
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Path probed by `status --health`.
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// CIDR blocks allowed to reach the API port.
    #[serde(default = "default_ingress_cidrs")]
    pub ingress_cidrs: Vec<String>,
    /// Machine image selection.
    #[serde(default)]
    pub ami: AmiConfig,
    /// Managed IAM policies attached to the instance role.
    #[serde(default = "default_managed_policies")]
    pub managed_policies: Vec<String>,
    /// Boot script override (defaults to installing docker).
    #[serde(default)]
    pub user_data: Option<String>,
}

/// Machine image lookup parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AmiConfig {
    /// Image owner account ids.
    #[serde(default = "default_ami_owners")]
    pub owners: Vec<String>,
    /// Image name glob; the most recent match wins.
    #[serde(default = "default_ami_pattern")]
    pub name_pattern: String,
}

/// Managed database configuration.
///
/// There is deliberately no field that accepts a literal password.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Database engine.
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Engine major version.
    #[serde(default = "default_engine_version")]
    pub engine_version: String,
    /// RDS instance class.
    #[serde(default = "default_instance_class")]
    pub instance_class: String,
    /// Allocated storage in GB.
    #[serde(default = "default_storage_gb")]
    pub allocated_storage_gb: u32,
    /// Initial database name.
    #[serde(default = "default_db_name")]
    pub name: String,
    /// Master username.
    #[serde(default = "default_db_username")]
    pub username: String,
    /// Where the master password is read from.
    pub password: SecretSource,
    /// Skip the final snapshot on delete.
    #[serde(default = "default_true")]
    pub skip_final_snapshot: bool,
}

/// Source of a secret value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SecretSource {
    /// An SSM Parameter Store parameter (read with decryption).
    SsmParameter(String),
    /// An environment variable of the deploying process.
    Env(String),
}

/// Apply scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyConfig {
    /// Maximum backend calls in flight at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Retries for transient backend failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay between retries in milliseconds (grows linearly).
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

// Default value functions

fn default_environment() -> String {
    String::from("dev")
}

fn default_region() -> String {
    String::from("us-east-1")
}

fn default_index_document() -> String {
    String::from("index.html")
}

const fn default_true() -> bool {
    true
}

fn default_cors_origins() -> Vec<String> {
    vec![String::from("*")]
}

fn default_instance_type() -> String {
    String::from("t3.micro")
}

const fn default_api_port() -> u16 {
    80
}

fn default_health_path() -> String {
    String::from("/health")
}

fn default_ingress_cidrs() -> Vec<String> {
    vec![String::from("0.0.0.0/0")]
}

fn default_ami_owners() -> Vec<String> {
    vec![String::from("137112412989")]
}

fn default_ami_pattern() -> String {
    String::from("amzn2-ami-hvm-*-x86_64-gp2")
}

fn default_managed_policies() -> Vec<String> {
    vec![
        String::from("arn:aws:iam::aws:policy/AmazonSSMManagedInstanceCore"),
        String::from("arn:aws:iam::aws:policy/CloudWatchAgentServerPolicy"),
    ]
}

fn default_engine() -> String {
    String::from("postgres")
}

fn default_engine_version() -> String {
    String::from("16")
}

fn default_instance_class() -> String {
    String::from("db.t3.micro")
}

const fn default_storage_gb() -> u32 {
    20
}

fn default_db_name() -> String {
    String::from("appdb")
}

fn default_db_username() -> String {
    String::from("appuser")
}

const fn default_max_concurrency() -> usize {
    4
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_retry_delay_ms() -> u64 {
    2000
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            bundle_dir: None,
            index_document: default_index_document(),
            error_document: default_index_document(),
            force_destroy: true,
            cors_origins: default_cors_origins(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            instance_type: default_instance_type(),
            port: default_api_port(),
            health_path: default_health_path(),
            ingress_cidrs: default_ingress_cidrs(),
            ami: AmiConfig::default(),
            managed_policies: default_managed_policies(),
            user_data: None,
        }
    }
}

impl Default for AmiConfig {
    fn default() -> Self {
        Self {
            owners: default_ami_owners(),
            name_pattern: default_ami_pattern(),
        }
    }
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl StackConfig {
    /// Returns the full name prefix for physical resources.
    #[must_use]
    pub fn name_prefix(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns the region used by the S3 state backend.
    #[must_use]
    pub fn state_region(&self) -> &str {
        self.state.region.as_deref().unwrap_or(&self.project.region)
    }
}

impl SecretSource {
    /// Short description that never includes the secret value.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::SsmParameter(name) => format!("ssm:{name}"),
            Self::Env(name) => format!("env:{name}"),
        }
    }
}

impl std::fmt::Display for StateBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::S3 => write!(f, "s3"),
        }
    }
}
