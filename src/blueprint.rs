//! The taskstack three-tier stack.
//!
//! Declares, from a [`StackConfig`]:
//! - a public S3 static website (bucket, public access relaxation, website
//!   hosting, CORS, public-read policy and optionally the frontend upload)
//! - lookups for the default VPC, its subnets, the API machine image, the
//!   region and the database password
//! - the API host (security group, IAM role with managed policies, instance
//!   profile, EC2 instance)
//! - a private Postgres instance reachable only from the API security group
//! - the `bucket`, `websiteUrl`, `apiIp`, `apiDns` and `dbHost` outputs

use serde_json::{Value as Json, json};
use std::collections::BTreeMap;
use tracing::debug;

use crate::bundle::SiteBundle;
use crate::config::StackConfig;
use crate::error::Result;
use crate::graph::{
    LookupHandle, LookupQuery, Plan, ProviderConfig, Resource, ResourceHandle, ResourceKind, Value,
};

/// Postgres port opened from the API security group.
pub const DB_PORT: u16 = 5432;

/// Boot script used when `api.user_data` is not set: installs and starts
/// docker on Amazon Linux 2.
pub const DEFAULT_USER_DATA: &str = "#!/bin/bash
set -e
yum update -y
amazon-linux-extras install docker -y || yum install -y docker
systemctl enable docker
systemctl start docker
usermod -aG docker ec2-user
";

/// Names of the plan outputs.
pub const OUTPUT_NAMES: [&str; 5] = ["bucket", "websiteUrl", "apiIp", "apiDns", "dbHost"];

struct Network {
    vpc: LookupHandle,
    subnets: LookupHandle,
    ami: LookupHandle,
    region: LookupHandle,
    db_password: LookupHandle,
}

/// Declares the full stack.
///
/// # Errors
///
/// Returns a plan error if a declaration is rejected, or `InvalidBundle` if
/// `site.bundle_dir` is set but cannot be scanned.
pub fn three_tier(config: &StackConfig) -> Result<Plan> {
    let mut plan = Plan::new(ProviderConfig::from_config(config));

    let site = declare_site(&mut plan, config)?;
    let network = declare_lookups(&mut plan, config)?;
    let (api_sg, api) = declare_api(&mut plan, config, &network)?;
    let db = declare_database(&mut plan, config, &network, &api_sg)?;

    plan.export("bucket", site.id(), false)?;
    plan.export(
        "websiteUrl",
        Value::interpolate(
            "http://{}.s3-website-{}.amazonaws.com",
            vec![site.id(), network.region.attr("name")],
        ),
        false,
    )?;
    plan.export("apiIp", api.attr("public_ip"), false)?;
    plan.export("apiDns", api.attr("public_dns"), false)?;
    plan.export("dbHost", db.attr("address"), false)?;

    plan.validate()?;
    debug!(
        "Declared {} resources and {} lookups",
        plan.resources().len(),
        plan.lookups().len()
    );
    Ok(plan)
}

fn declare_site(plan: &mut Plan, config: &StackConfig) -> Result<ResourceHandle> {
    let site_config = &config.site;
    let site = plan.declare(
        Resource::new("site", ResourceKind::Bucket).with("force_destroy", site_config.force_destroy),
    )?;

    let bap = plan.declare(
        Resource::new("site-bap", ResourceKind::BucketPublicAccessBlock)
            .with("bucket", site.id())
            .with("block_public_acls", false)
            .with("block_public_policy", false)
            .with("ignore_public_acls", false)
            .with("restrict_public_buckets", false),
    )?;

    plan.declare(
        Resource::new("site-website", ResourceKind::BucketWebsite)
            .with("bucket", site.id())
            .with("index_document", site_config.index_document.as_str())
            .with("error_document", site_config.error_document.as_str()),
    )?;

    plan.declare(
        Resource::new("site-cors", ResourceKind::BucketCors)
            .with("bucket", site.id())
            .with(
                "rules",
                json!([{
                    "allowed_methods": ["GET", "HEAD"],
                    "allowed_origins": site_config.cors_origins,
                    "allowed_headers": ["*"],
                }]),
            ),
    )?;

    // The public-read policy is rejected while public access is blocked.
    let policy = plan.declare(
        Resource::new("site-policy", ResourceKind::BucketPolicy)
            .with("bucket", site.id())
            .with(
                "policy",
                Value::derive("public-read policy", vec![site.id()], |inputs| {
                    public_read_policy(inputs.first().and_then(Json::as_str).unwrap_or_default())
                }),
            ),
    )?;
    plan.depends_on(&policy, &[&bap])?;

    if let Some(dir) = &site_config.bundle_dir {
        let bundle = SiteBundle::scan(dir)?;
        debug!(
            "Bundle {dir}: {} files, digest {}",
            bundle.files().len(),
            bundle.digest()
        );
        plan.declare(
            Resource::new("site-content", ResourceKind::BucketContent)
                .with("bucket", site.id())
                .with("source_dir", dir.as_str())
                .with("digest", bundle.digest())
                .with("object_count", json!(bundle.files().len()))
                .after(policy.name()),
        )?;
    }

    Ok(site)
}

fn declare_lookups(plan: &mut Plan, config: &StackConfig) -> Result<Network> {
    let vpc = plan.lookup("vpc", LookupQuery::DefaultVpc)?;
    let subnets = plan.lookup(
        "subnets",
        LookupQuery::Subnets {
            vpc: vpc.reference("id"),
        },
    )?;
    let ami = plan.lookup(
        "ami",
        LookupQuery::LatestAmi {
            owners: config.api.ami.owners.clone(),
            name_pattern: config.api.ami.name_pattern.clone(),
        },
    )?;
    let region = plan.lookup("region", LookupQuery::Region)?;
    let db_password = plan.lookup(
        "db-password",
        LookupQuery::Secret {
            source: config.database.password.clone(),
        },
    )?;
    Ok(Network {
        vpc,
        subnets,
        ami,
        region,
        db_password,
    })
}

fn declare_api(
    plan: &mut Plan,
    config: &StackConfig,
    network: &Network,
) -> Result<(ResourceHandle, ResourceHandle)> {
    let api_config = &config.api;

    let api_sg = plan.declare(
        Resource::new("api-sg", ResourceKind::SecurityGroup)
            .with("vpc_id", network.vpc.attr("id"))
            .with("description", "Allow HTTP to API")
            .with(
                "ingress",
                json!([{
                    "protocol": "tcp",
                    "from_port": api_config.port,
                    "to_port": api_config.port,
                    "cidr_blocks": api_config.ingress_cidrs,
                }]),
            )
            .with("egress", allow_all_egress()),
    )?;

    let role = plan.declare(
        Resource::new("ec2-role", ResourceKind::IamRole).with(
            "assume_role_policy",
            json!({
                "Version": "2012-10-17",
                "Statement": [{
                    "Action": "sts:AssumeRole",
                    "Effect": "Allow",
                    "Principal": { "Service": "ec2.amazonaws.com" },
                }],
            }),
        ),
    )?;

    let mut attachments = Vec::new();
    for (i, policy_arn) in api_config.managed_policies.iter().enumerate() {
        let mut name = attachment_name(policy_arn);
        let mut n = i;
        while plan.node_kind(&name).is_some() {
            name = format!("ec2-policy-{n}");
            n += 1;
        }
        attachments.push(plan.declare(
            Resource::new(name, ResourceKind::RolePolicyAttachment)
                .with("role", role.attr("name"))
                .with("policy_arn", policy_arn.as_str()),
        )?);
    }

    let profile = plan.declare(
        Resource::new("ec2-prof", ResourceKind::InstanceProfile).with("role", role.attr("name")),
    )?;

    let user_data = api_config
        .user_data
        .clone()
        .unwrap_or_else(|| DEFAULT_USER_DATA.to_string());
    let api = plan.declare(
        Resource::new("api", ResourceKind::Instance)
            .with("instance_type", api_config.instance_type.as_str())
            .with("ami", network.ami.attr("id"))
            .with("security_group_ids", Value::List(vec![api_sg.id()]))
            .with("iam_instance_profile", profile.attr("name"))
            .with("user_data", user_data),
    )?;
    // Boot scripts may need the managed policies right away.
    plan.depends_on(&api, &attachments)?;

    Ok((api_sg, api))
}

fn declare_database(
    plan: &mut Plan,
    config: &StackConfig,
    network: &Network,
    api_sg: &ResourceHandle,
) -> Result<ResourceHandle> {
    let db_config = &config.database;

    let db_sg = plan.declare(
        Resource::new("db-sg", ResourceKind::SecurityGroup)
            .with("vpc_id", network.vpc.attr("id"))
            .with("description", "Allow Postgres from API SG only")
            .with(
                "ingress",
                Value::List(vec![Value::Map(BTreeMap::from([
                    (String::from("protocol"), Value::from("tcp")),
                    (String::from("from_port"), Value::from(DB_PORT)),
                    (String::from("to_port"), Value::from(DB_PORT)),
                    (
                        String::from("source_security_group_ids"),
                        Value::List(vec![api_sg.id()]),
                    ),
                ]))]),
            )
            .with("egress", allow_all_egress()),
    )?;

    let subnet_group = plan.declare(
        Resource::new("db-subnets", ResourceKind::DbSubnetGroup)
            .with("subnet_ids", network.subnets.attr("ids"))
            .with("description", "Default VPC subnets"),
    )?;

    let db = plan.declare(
        Resource::new("db", ResourceKind::DbInstance)
            .with("engine", db_config.engine.as_str())
            .with("engine_version", db_config.engine_version.as_str())
            .with("instance_class", db_config.instance_class.as_str())
            .with("allocated_storage", db_config.allocated_storage_gb)
            .with("db_name", db_config.name.as_str())
            .with("username", db_config.username.as_str())
            .with("password", network.db_password.attr("value"))
            .with("publicly_accessible", false)
            .with("vpc_security_group_ids", Value::List(vec![db_sg.id()]))
            .with("db_subnet_group_name", subnet_group.attr("name"))
            .with("skip_final_snapshot", db_config.skip_final_snapshot),
    )?;

    Ok(db)
}

fn allow_all_egress() -> Json {
    json!([{
        "protocol": "-1",
        "from_port": 0,
        "to_port": 0,
        "cidr_blocks": ["0.0.0.0/0"],
    }])
}

/// Bucket policy allowing anonymous reads of every object.
#[must_use]
pub fn public_read_policy(bucket: &str) -> Json {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Sid": "PublicReadGetObject",
            "Effect": "Allow",
            "Principal": "*",
            "Action": ["s3:GetObject"],
            "Resource": [format!("arn:aws:s3:::{bucket}/*")],
        }],
    })
}

fn attachment_name(policy_arn: &str) -> String {
    let policy = policy_arn.rsplit('/').next().unwrap_or(policy_arn);
    if policy.contains("SSM") {
        String::from("ec2-ssm")
    } else if policy.contains("CloudWatch") {
        String::from("ec2-cw")
    } else {
        format!("ec2-policy-{}", policy.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::graph::NodeKind;
    use std::collections::HashMap;

    fn config() -> StackConfig {
        ConfigParser::new()
            .parse_yaml(
                r"
project:
  name: tasks
  environment: dev
  region: eu-west-1
database:
  password:
    ssm_parameter: /tasks/dev/db-password
",
                None,
            )
            .unwrap()
    }

    fn position(order: &[String], node: &str) -> usize {
        order.iter().position(|n| n == node).unwrap()
    }

    #[test]
    fn test_declares_the_demo_stack() {
        let plan = three_tier(&config()).unwrap();

        let resources: Vec<&str> = plan.resources().keys().map(String::as_str).collect();
        assert_eq!(
            resources,
            vec![
                "api", "api-sg", "db", "db-sg", "db-subnets", "ec2-cw", "ec2-prof", "ec2-role",
                "ec2-ssm", "site", "site-bap", "site-cors", "site-policy", "site-website",
            ]
        );
        assert_eq!(plan.lookups().len(), 5);
        let outputs: Vec<&str> = plan.outputs().iter().map(|o| o.name.as_str()).collect();
        assert_eq!(outputs, OUTPUT_NAMES);
    }

    #[test]
    fn test_ordering_constraints() {
        let plan = three_tier(&config()).unwrap();
        let order = plan.apply_order().unwrap();

        assert!(position(&order, "site-bap") < position(&order, "site-policy"));
        assert!(position(&order, "subnets") < position(&order, "db-subnets"));
        assert!(position(&order, "vpc") < position(&order, "subnets"));
        assert!(position(&order, "api-sg") < position(&order, "db-sg"));
        assert!(position(&order, "db-sg") < position(&order, "db"));
        assert!(position(&order, "ec2-prof") < position(&order, "api"));
        assert!(position(&order, "ec2-ssm") < position(&order, "api"));
    }

    #[test]
    fn test_password_is_never_a_literal() {
        let plan = three_tier(&config()).unwrap();
        let db = &plan.resources()["db"];

        let password = db.properties["password"].to_string();
        assert_eq!(password, "${db-password.value}");
        assert_eq!(plan.node_kind("db-password"), Some(NodeKind::Lookup));
        assert!(plan.lookups()["db-password"].is_sensitive());
    }

    #[test]
    fn test_website_url_from_bucket_and_region() {
        let plan = three_tier(&config()).unwrap();
        let resolved = HashMap::from([
            (
                String::from("site"),
                crate::graph::Attributes::from([(String::from("id"), json!("tasks-dev-site-1a2b3c4d"))]),
            ),
            (
                String::from("region"),
                crate::graph::Attributes::from([(String::from("name"), json!("eu-west-1"))]),
            ),
        ]);
        let url = plan
            .outputs()
            .iter()
            .find(|o| o.name == "websiteUrl")
            .unwrap()
            .value
            .resolve(&resolved)
            .unwrap();
        assert_eq!(
            url,
            json!("http://tasks-dev-site-1a2b3c4d.s3-website-eu-west-1.amazonaws.com")
        );
    }

    #[test]
    fn test_bundle_adds_content_upload() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>tasks</h1>").unwrap();
        let mut config = config();
        config.site.bundle_dir = Some(dir.path().display().to_string());

        let plan = three_tier(&config).unwrap();
        let content = &plan.resources()["site-content"];
        assert!(content.dependencies().contains("site-policy"));
        assert!(content.properties.contains_key("digest"));
    }

    #[test]
    fn test_missing_bundle_is_rejected() {
        let mut config = config();
        config.site.bundle_dir = Some(String::from("/nonexistent/taskstack/dist"));
        assert!(three_tier(&config).is_err());
    }

    #[test]
    fn test_policy_document() {
        let policy = public_read_policy("tasks-site");
        assert_eq!(
            policy["Statement"][0]["Resource"][0],
            json!("arn:aws:s3:::tasks-site/*")
        );
    }

    #[test]
    fn test_attachment_names_never_collide() {
        let mut config = config();
        config.api.managed_policies = vec![
            String::from("arn:aws:iam::aws:policy/AmazonSSMManagedInstanceCore"),
            String::from("arn:aws:iam::123456789012:policy/AmazonSSMManagedInstanceCore"),
            String::from("arn:aws:iam::123456789012:policy/Role"),
            String::from("arn:aws:iam::123456789012:policy/Prof"),
        ];

        let plan = three_tier(&config).unwrap();
        let attachments: Vec<&str> = plan
            .resources()
            .values()
            .filter(|r| r.kind == ResourceKind::RolePolicyAttachment)
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(
            attachments,
            vec!["ec2-policy-1", "ec2-policy-prof", "ec2-policy-role", "ec2-ssm"]
        );
    }

    #[test]
    fn test_attachment_names() {
        assert_eq!(
            attachment_name("arn:aws:iam::aws:policy/AmazonSSMManagedInstanceCore"),
            "ec2-ssm"
        );
        assert_eq!(
            attachment_name("arn:aws:iam::aws:policy/CloudWatchAgentServerPolicy"),
            "ec2-cw"
        );
        assert_eq!(
            attachment_name("arn:aws:iam::aws:policy/AmazonS3ReadOnlyAccess"),
            "ec2-policy-amazons3readonlyaccess"
        );
    }
}
