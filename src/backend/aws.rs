//! AWS backend.
//!
//! Maps each resource kind onto S3, EC2, IAM, RDS and SSM calls. Creates are
//! idempotent through deterministic names, EC2 client tokens and
//! "already exists" handling. Long-running resources (instances, databases)
//! are polled until usable before their attributes are returned.

use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use base64::Engine;
use serde_json::{Value as Json, json};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{BackendResult, CloudBackend, LookupRequest, ResourceRequest, ResourceTarget};
use crate::bundle::SiteBundle;
use crate::error::BackendError;
use crate::graph::{Attributes, ResourceKind};

/// Service error codes worth retrying.
const TRANSIENT_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "SlowDown",
    "RequestTimeout",
    "ServiceUnavailable",
    "InternalError",
    "InternalFailure",
    "DependencyViolation",
    "OperationAborted",
];

/// How long to wait on slow resources.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    /// Delay between instance state checks.
    pub instance_interval: Duration,
    /// Instance state checks before giving up.
    pub instance_attempts: u32,
    /// Delay between database state checks.
    pub db_interval: Duration,
    /// Database state checks before giving up.
    pub db_attempts: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            instance_interval: Duration::from_secs(5),
            instance_attempts: 120,
            db_interval: Duration::from_secs(15),
            db_attempts: 160,
        }
    }
}

/// [`CloudBackend`] backed by the AWS SDK.
#[derive(Debug, Clone)]
pub struct AwsBackend {
    region: String,
    s3: aws_sdk_s3::Client,
    ec2: aws_sdk_ec2::Client,
    iam: aws_sdk_iam::Client,
    rds: aws_sdk_rds::Client,
    ssm: aws_sdk_ssm::Client,
    poll: PollSettings,
}

fn service_code<E, R>(err: &SdkError<E, R>) -> Option<&str>
where
    E: ProvideErrorMetadata,
{
    err.as_service_error().and_then(ProvideErrorMetadata::code)
}

fn has_code<E, R>(err: &SdkError<E, R>, codes: &[&str]) -> bool
where
    E: ProvideErrorMetadata,
{
    service_code(err).is_some_and(|code| codes.contains(&code))
}

/// Converts an SDK error, keeping throttling and network failures retryable.
fn classify<E, R>(err: &SdkError<E, R>, resource: &str, operation: &str) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(err).to_string();
    let transient = match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        _ => has_code(err, TRANSIENT_CODES),
    };
    if transient {
        BackendError::transient(resource, operation, message)
    } else {
        BackendError::request(resource, operation, message)
    }
}

fn lookup_error<E, R>(err: &SdkError<E, R>, query: &LookupRequest) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    match classify(err, &query.to_string(), "lookup") {
        transient @ BackendError::Transient { .. } => transient,
        other => BackendError::LookupFailed {
            query: query.to_string(),
            message: other.to_string(),
        },
    }
}

fn invalid(resource: &str, err: impl std::fmt::Display) -> BackendError {
    BackendError::invalid(resource, err.to_string())
}

impl AwsBackend {
    /// Loads credentials from the environment for an explicit region.
    pub async fn new(region: &str) -> Self {
        let config = aws_config::from_env()
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;
        Self::from_config(&config, region)
    }

    /// Builds every service client from a shared SDK config.
    #[must_use]
    pub fn from_config(config: &aws_config::SdkConfig, region: &str) -> Self {
        Self {
            region: region.to_string(),
            s3: aws_sdk_s3::Client::new(config),
            ec2: aws_sdk_ec2::Client::new(config),
            iam: aws_sdk_iam::Client::new(config),
            rds: aws_sdk_rds::Client::new(config),
            ssm: aws_sdk_ssm::Client::new(config),
            poll: PollSettings::default(),
        }
    }

    /// Overrides polling for slow resources.
    #[must_use]
    pub const fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    // ---- S3 ------------------------------------------------------------

    async fn create_bucket(&self, req: &ResourceRequest) -> BackendResult<Attributes> {
        let name = &req.physical_name;
        let mut call = self.s3.create_bucket().bucket(name);
        // us-east-1 rejects an explicit location constraint.
        if self.region != "us-east-1" {
            call = call.create_bucket_configuration(
                aws_sdk_s3::types::CreateBucketConfiguration::builder()
                    .location_constraint(aws_sdk_s3::types::BucketLocationConstraint::from(
                        self.region.as_str(),
                    ))
                    .build(),
            );
        }
        match call.send().await {
            Ok(_) => info!("Created bucket {name}"),
            Err(err) if has_code(&err, &["BucketAlreadyOwnedByYou"]) => {
                debug!("Bucket {name} already owned, adopting");
            }
            Err(err) => return Err(classify(&err, &req.logical_name, "create")),
        }
        self.tag_bucket(req).await?;
        Ok(self.bucket_attributes(req))
    }

    async fn tag_bucket(&self, req: &ResourceRequest) -> BackendResult<()> {
        let tags = req
            .tags
            .iter()
            .map(|(k, v)| {
                aws_sdk_s3::types::Tag::builder()
                    .key(k)
                    .value(v)
                    .build()
                    .map_err(|e| invalid(&req.logical_name, e))
            })
            .collect::<BackendResult<Vec<_>>>()?;
        let tagging = aws_sdk_s3::types::Tagging::builder()
            .set_tag_set(Some(tags))
            .build()
            .map_err(|e| invalid(&req.logical_name, e))?;
        self.s3
            .put_bucket_tagging()
            .bucket(&req.physical_name)
            .tagging(tagging)
            .send()
            .await
            .map_err(|e| classify(&e, &req.logical_name, "tag"))?;
        Ok(())
    }

    fn bucket_attributes(&self, req: &ResourceRequest) -> Attributes {
        let name = &req.physical_name;
        Attributes::from([
            ("id".to_string(), json!(name)),
            ("arn".to_string(), json!(format!("arn:aws:s3:::{name}"))),
            (
                "bucket_domain_name".to_string(),
                json!(format!("{name}.s3.amazonaws.com")),
            ),
            ("region".to_string(), json!(self.region)),
            (
                "force_destroy".to_string(),
                json!(req.bool_prop("force_destroy").unwrap_or(false)),
            ),
        ])
    }

    async fn bucket_exists(&self, bucket: &str, resource: &str) -> BackendResult<bool> {
        match self.s3.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(false),
            Err(err) if has_code(&err, &["NotFound", "NoSuchBucket"]) => Ok(false),
            Err(err) => Err(classify(&err, resource, "read")),
        }
    }

    async fn delete_keys(&self, bucket: &str, keys: Vec<String>, resource: &str) -> BackendResult<()> {
        for chunk in keys.chunks(1000) {
            let objects = chunk
                .iter()
                .map(|key| {
                    aws_sdk_s3::types::ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(|e| invalid(resource, e))
                })
                .collect::<BackendResult<Vec<_>>>()?;
            let delete = aws_sdk_s3::types::Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| invalid(resource, e))?;
            self.s3
                .delete_objects()
                .bucket(bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| classify(&e, resource, "delete"))?;
        }
        Ok(())
    }

    async fn empty_bucket(&self, bucket: &str, resource: &str) -> BackendResult<()> {
        let mut token: Option<String> = None;
        loop {
            let page = self
                .s3
                .list_objects_v2()
                .bucket(bucket)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| classify(&e, resource, "delete"))?;
            let keys: Vec<String> = page
                .contents()
                .iter()
                .filter_map(|o| o.key().map(str::to_string))
                .collect();
            if !keys.is_empty() {
                debug!("Removing {} objects from {bucket}", keys.len());
                self.delete_keys(bucket, keys, resource).await?;
            }
            match page.next_continuation_token() {
                Some(next) => token = Some(next.to_string()),
                None => return Ok(()),
            }
        }
    }

    async fn delete_bucket(&self, target: &ResourceTarget) -> BackendResult<()> {
        let bucket = target.str_attr("id")?;
        if !self.bucket_exists(bucket, &target.logical_name).await? {
            return Ok(());
        }
        let force = target
            .attributes
            .get("force_destroy")
            .and_then(Json::as_bool)
            .unwrap_or(false);
        if force {
            self.empty_bucket(bucket, &target.logical_name).await?;
        }
        match self.s3.delete_bucket().bucket(bucket).send().await {
            Ok(_) => {
                info!("Deleted bucket {bucket}");
                Ok(())
            }
            Err(err) if has_code(&err, &["NoSuchBucket"]) => Ok(()),
            Err(err) => Err(classify(&err, &target.logical_name, "delete")),
        }
    }

    fn bucket_sub_attributes(&self, req: &ResourceRequest) -> BackendResult<Attributes> {
        let bucket = req.str_prop("bucket")?;
        let mut attrs = Attributes::from([
            ("id".to_string(), json!(bucket)),
            ("bucket".to_string(), json!(bucket)),
        ]);
        if req.kind == ResourceKind::BucketWebsite {
            attrs.insert(
                "website_endpoint".to_string(),
                json!(format!("{bucket}.s3-website-{}.amazonaws.com", self.region)),
            );
        }
        Ok(attrs)
    }

    async fn put_public_access_block(&self, req: &ResourceRequest) -> BackendResult<Attributes> {
        let flag = |key: &str| req.bool_prop(key).unwrap_or(true);
        let config = aws_sdk_s3::types::PublicAccessBlockConfiguration::builder()
            .block_public_acls(flag("block_public_acls"))
            .block_public_policy(flag("block_public_policy"))
            .ignore_public_acls(flag("ignore_public_acls"))
            .restrict_public_buckets(flag("restrict_public_buckets"))
            .build();
        self.s3
            .put_public_access_block()
            .bucket(req.str_prop("bucket")?)
            .public_access_block_configuration(config)
            .send()
            .await
            .map_err(|e| classify(&e, &req.logical_name, "put"))?;
        self.bucket_sub_attributes(req)
    }

    async fn put_website(&self, req: &ResourceRequest) -> BackendResult<Attributes> {
        let resource = &req.logical_name;
        let index = aws_sdk_s3::types::IndexDocument::builder()
            .suffix(req.str_prop("index_document")?)
            .build()
            .map_err(|e| invalid(resource, e))?;
        let error = aws_sdk_s3::types::ErrorDocument::builder()
            .key(req.str_prop("error_document")?)
            .build()
            .map_err(|e| invalid(resource, e))?;
        let config = aws_sdk_s3::types::WebsiteConfiguration::builder()
            .index_document(index)
            .error_document(error)
            .build();
        self.s3
            .put_bucket_website()
            .bucket(req.str_prop("bucket")?)
            .website_configuration(config)
            .send()
            .await
            .map_err(|e| classify(&e, resource, "put"))?;
        self.bucket_sub_attributes(req)
    }

    async fn put_cors(&self, req: &ResourceRequest) -> BackendResult<Attributes> {
        let resource = &req.logical_name;
        let rules = req
            .properties
            .get("rules")
            .and_then(Json::as_array)
            .ok_or_else(|| invalid(resource, "property 'rules' must be a list"))?;

        let strings = |rule: &Json, key: &str| -> Vec<String> {
            rule.get(key)
                .and_then(Json::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };

        let cors_rules = rules
            .iter()
            .map(|rule| {
                aws_sdk_s3::types::CorsRule::builder()
                    .set_allowed_methods(Some(strings(rule, "allowed_methods")))
                    .set_allowed_origins(Some(strings(rule, "allowed_origins")))
                    .set_allowed_headers(Some(strings(rule, "allowed_headers")))
                    .build()
                    .map_err(|e| invalid(resource, e))
            })
            .collect::<BackendResult<Vec<_>>>()?;
        let config = aws_sdk_s3::types::CorsConfiguration::builder()
            .set_cors_rules(Some(cors_rules))
            .build()
            .map_err(|e| invalid(resource, e))?;

        self.s3
            .put_bucket_cors()
            .bucket(req.str_prop("bucket")?)
            .cors_configuration(config)
            .send()
            .await
            .map_err(|e| classify(&e, resource, "put"))?;
        self.bucket_sub_attributes(req)
    }

    async fn put_policy(&self, req: &ResourceRequest) -> BackendResult<Attributes> {
        let policy = req
            .properties
            .get("policy")
            .ok_or_else(|| invalid(&req.logical_name, "property 'policy' is missing"))?
            .to_string();
        self.s3
            .put_bucket_policy()
            .bucket(req.str_prop("bucket")?)
            .policy(policy)
            .send()
            .await
            .map_err(|e| classify(&e, &req.logical_name, "put"))?;
        self.bucket_sub_attributes(req)
    }

    async fn upload_content(
        &self,
        req: &ResourceRequest,
        previous: Option<&ResourceTarget>,
    ) -> BackendResult<Attributes> {
        let resource = &req.logical_name;
        let bucket = req.str_prop("bucket")?;
        let bundle = SiteBundle::scan(req.str_prop("source_dir")?).map_err(|e| invalid(resource, e))?;

        for file in bundle.files() {
            let bytes = tokio::fs::read(&file.path)
                .await
                .map_err(|e| invalid(resource, format!("{}: {e}", file.path.display())))?;
            self.s3
                .put_object()
                .bucket(bucket)
                .key(&file.key)
                .content_type(file.content_type)
                .body(aws_sdk_s3::primitives::ByteStream::from(bytes))
                .send()
                .await
                .map_err(|e| classify(&e, resource, "upload"))?;
        }
        info!("Uploaded {} files to {bucket}", bundle.files().len());

        let keys: BTreeSet<String> = bundle.files().iter().map(|f| f.key.clone()).collect();
        if let Some(previous) = previous {
            let stale: Vec<String> = recorded_keys(previous)
                .into_iter()
                .filter(|k| !keys.contains(k))
                .collect();
            if !stale.is_empty() {
                debug!("Removing {} stale objects", stale.len());
                self.delete_keys(bucket, stale, resource).await?;
            }
        }

        Ok(Attributes::from([
            ("id".to_string(), json!(req.physical_name)),
            ("bucket".to_string(), json!(bucket)),
            ("digest".to_string(), json!(bundle.digest())),
            ("object_count".to_string(), json!(bundle.files().len())),
            ("keys".to_string(), json!(keys)),
        ]))
    }

    async fn read_content(&self, target: &ResourceTarget) -> BackendResult<Option<Attributes>> {
        let bucket = target.str_attr("bucket")?;
        let Some(first) = recorded_keys(target).into_iter().next() else {
            return Ok(Some(target.attributes.clone()));
        };
        match self.s3.head_object().bucket(bucket).key(&first).send().await {
            Ok(_) => Ok(Some(target.attributes.clone())),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(None),
            Err(err) if has_code(&err, &["NotFound", "NoSuchBucket", "NoSuchKey"]) => Ok(None),
            Err(err) => Err(classify(&err, &target.logical_name, "read")),
        }
    }

    /// Reads a bucket sub-configuration; `None` once it or the bucket is gone.
    async fn read_bucket_config(
        &self,
        target: &ResourceTarget,
    ) -> BackendResult<Option<Attributes>> {
        let bucket = target.str_attr("bucket")?;
        let resource = &target.logical_name;
        let found = match target.kind {
            ResourceKind::BucketPublicAccessBlock => {
                match self.s3.get_public_access_block().bucket(bucket).send().await {
                    Ok(_) => true,
                    Err(err)
                        if has_code(
                            &err,
                            &["NoSuchPublicAccessBlockConfiguration", "NoSuchBucket"],
                        ) =>
                    {
                        false
                    }
                    Err(err) => return Err(classify(&err, resource, "read")),
                }
            }
            ResourceKind::BucketWebsite => {
                match self.s3.get_bucket_website().bucket(bucket).send().await {
                    Ok(_) => true,
                    Err(err) if has_code(&err, &["NoSuchWebsiteConfiguration", "NoSuchBucket"]) => {
                        false
                    }
                    Err(err) => return Err(classify(&err, resource, "read")),
                }
            }
            ResourceKind::BucketCors => {
                match self.s3.get_bucket_cors().bucket(bucket).send().await {
                    Ok(_) => true,
                    Err(err) if has_code(&err, &["NoSuchCORSConfiguration", "NoSuchBucket"]) => {
                        false
                    }
                    Err(err) => return Err(classify(&err, resource, "read")),
                }
            }
            ResourceKind::BucketPolicy => {
                match self.s3.get_bucket_policy().bucket(bucket).send().await {
                    Ok(_) => true,
                    Err(err) if has_code(&err, &["NoSuchBucketPolicy", "NoSuchBucket"]) => false,
                    Err(err) => return Err(classify(&err, resource, "read")),
                }
            }
            other => {
                return Err(invalid(resource, format!("{other} is not a bucket configuration")));
            }
        };
        Ok(found.then(|| target.attributes.clone()))
    }

    async fn delete_bucket_config(&self, target: &ResourceTarget) -> BackendResult<()> {
        let bucket = target.str_attr("bucket")?;
        let resource = &target.logical_name;
        let result = match target.kind {
            ResourceKind::BucketPublicAccessBlock => self
                .s3
                .delete_public_access_block()
                .bucket(bucket)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| (has_code(&e, &["NoSuchBucket"]), classify(&e, resource, "delete"))),
            ResourceKind::BucketWebsite => self
                .s3
                .delete_bucket_website()
                .bucket(bucket)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| (has_code(&e, &["NoSuchBucket"]), classify(&e, resource, "delete"))),
            ResourceKind::BucketCors => self
                .s3
                .delete_bucket_cors()
                .bucket(bucket)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| (has_code(&e, &["NoSuchBucket"]), classify(&e, resource, "delete"))),
            ResourceKind::BucketPolicy => self
                .s3
                .delete_bucket_policy()
                .bucket(bucket)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| (has_code(&e, &["NoSuchBucket"]), classify(&e, resource, "delete"))),
            ResourceKind::BucketContent => {
                if !self.bucket_exists(bucket, resource).await? {
                    return Ok(());
                }
                return self.delete_keys(bucket, recorded_keys(target), resource).await;
            }
            other => {
                return Err(invalid(resource, format!("{other} is not a bucket configuration")));
            }
        };
        match result {
            Ok(()) | Err((true, _)) => Ok(()),
            Err((false, err)) => Err(err),
        }
    }

    // ---- EC2 -----------------------------------------------------------

    fn ec2_tags(
        resource_type: aws_sdk_ec2::types::ResourceType,
        tags: &BTreeMap<String, String>,
    ) -> aws_sdk_ec2::types::TagSpecification {
        let tags = tags
            .iter()
            .map(|(k, v)| aws_sdk_ec2::types::Tag::builder().key(k).value(v).build())
            .collect();
        aws_sdk_ec2::types::TagSpecification::builder()
            .resource_type(resource_type)
            .set_tags(Some(tags))
            .build()
    }

    fn filter(name: &str, value: impl Into<String>) -> aws_sdk_ec2::types::Filter {
        aws_sdk_ec2::types::Filter::builder()
            .name(name)
            .values(value)
            .build()
    }

    async fn lookup_default_vpc(&self, query: &LookupRequest) -> BackendResult<Attributes> {
        let out = self
            .ec2
            .describe_vpcs()
            .filters(Self::filter("is-default", "true"))
            .send()
            .await
            .map_err(|e| lookup_error(&e, query))?;
        let vpc = out.vpcs().first().ok_or_else(|| BackendError::LookupFailed {
            query: query.to_string(),
            message: format!("no default VPC in {}", self.region),
        })?;
        Ok(Attributes::from([
            ("id".to_string(), json!(vpc.vpc_id())),
            ("cidr_block".to_string(), json!(vpc.cidr_block())),
        ]))
    }

    async fn lookup_subnets(&self, query: &LookupRequest, vpc_id: &str) -> BackendResult<Attributes> {
        let out = self
            .ec2
            .describe_subnets()
            .filters(Self::filter("vpc-id", vpc_id))
            .send()
            .await
            .map_err(|e| lookup_error(&e, query))?;
        let mut ids: Vec<String> = out
            .subnets()
            .iter()
            .filter_map(|s| s.subnet_id().map(str::to_string))
            .collect();
        ids.sort();
        if ids.is_empty() {
            return Err(BackendError::LookupFailed {
                query: query.to_string(),
                message: format!("VPC {vpc_id} has no subnets"),
            });
        }
        Ok(Attributes::from([
            ("id".to_string(), json!(vpc_id)),
            ("ids".to_string(), json!(ids)),
        ]))
    }

    async fn lookup_ami(
        &self,
        query: &LookupRequest,
        owners: &[String],
        name_pattern: &str,
    ) -> BackendResult<Attributes> {
        let out = self
            .ec2
            .describe_images()
            .set_owners(Some(owners.to_vec()))
            .filters(Self::filter("name", name_pattern))
            .filters(Self::filter("state", "available"))
            .send()
            .await
            .map_err(|e| lookup_error(&e, query))?;
        // Creation dates are ISO 8601, so string order is time order.
        let image = out
            .images()
            .iter()
            .max_by(|a, b| a.creation_date().cmp(&b.creation_date()))
            .ok_or_else(|| BackendError::LookupFailed {
                query: query.to_string(),
                message: format!("no image matches '{name_pattern}'"),
            })?;
        Ok(Attributes::from([
            ("id".to_string(), json!(image.image_id())),
            ("name".to_string(), json!(image.name())),
        ]))
    }

    fn desired_permissions(
        req: &ResourceRequest,
        key: &str,
    ) -> BackendResult<Vec<aws_sdk_ec2::types::IpPermission>> {
        let Some(rules) = req.properties.get(key) else {
            return Ok(Vec::new());
        };
        let rules = rules
            .as_array()
            .ok_or_else(|| invalid(&req.logical_name, format!("property '{key}' must be a list")))?;

        rules
            .iter()
            .map(|rule| {
                let protocol = rule.get("protocol").and_then(Json::as_str).unwrap_or("tcp");
                let mut perm = aws_sdk_ec2::types::IpPermission::builder().ip_protocol(protocol);
                if protocol != "-1" {
                    let port = |k: &str| {
                        rule.get(k)
                            .and_then(Json::as_i64)
                            .and_then(|p| i32::try_from(p).ok())
                    };
                    perm = perm.set_from_port(port("from_port")).set_to_port(port("to_port"));
                }
                for cidr in rule
                    .get("cidr_blocks")
                    .and_then(Json::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(Json::as_str)
                {
                    perm = perm.ip_ranges(aws_sdk_ec2::types::IpRange::builder().cidr_ip(cidr).build());
                }
                for group in rule
                    .get("source_security_group_ids")
                    .and_then(Json::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(Json::as_str)
                {
                    perm = perm.user_id_group_pairs(
                        aws_sdk_ec2::types::UserIdGroupPair::builder()
                            .group_id(group)
                            .build(),
                    );
                }
                Ok(perm.build())
            })
            .collect()
    }

    async fn find_group_id(&self, req: &ResourceRequest, vpc_id: &str) -> BackendResult<String> {
        let out = self
            .ec2
            .describe_security_groups()
            .filters(Self::filter("group-name", &req.physical_name))
            .filters(Self::filter("vpc-id", vpc_id))
            .send()
            .await
            .map_err(|e| classify(&e, &req.logical_name, "read"))?;
        out.security_groups()
            .first()
            .and_then(|g| g.group_id())
            .map(str::to_string)
            .ok_or_else(|| invalid(&req.logical_name, "duplicate group reported but not found"))
    }

    async fn create_security_group(&self, req: &ResourceRequest) -> BackendResult<Attributes> {
        let resource = &req.logical_name;
        let vpc_id = req.str_prop("vpc_id")?;
        let created = self
            .ec2
            .create_security_group()
            .group_name(&req.physical_name)
            .description(req.str_prop("description").unwrap_or("managed by taskstack"))
            .vpc_id(vpc_id)
            .tag_specifications(Self::ec2_tags(
                aws_sdk_ec2::types::ResourceType::SecurityGroup,
                &req.tags,
            ))
            .send()
            .await;
        let group_id = match created {
            Ok(out) => out
                .group_id()
                .map(str::to_string)
                .ok_or_else(|| invalid(resource, "no group id returned"))?,
            Err(err) if has_code(&err, &["InvalidGroup.Duplicate"]) => {
                debug!("Security group {} exists, adopting", req.physical_name);
                self.find_group_id(req, vpc_id).await?
            }
            Err(err) => return Err(classify(&err, resource, "create")),
        };
        info!("Security group {} is {group_id}", req.physical_name);
        self.sync_group_rules(req, &group_id).await?;
        Ok(Attributes::from([
            ("id".to_string(), json!(group_id)),
            ("name".to_string(), json!(req.physical_name)),
            ("vpc_id".to_string(), json!(vpc_id)),
        ]))
    }

    async fn sync_group_rules(&self, req: &ResourceRequest, group_id: &str) -> BackendResult<()> {
        let resource = &req.logical_name;
        let out = self
            .ec2
            .describe_security_groups()
            .group_ids(group_id)
            .send()
            .await
            .map_err(|e| classify(&e, resource, "read"))?;
        let group = out
            .security_groups()
            .first()
            .ok_or_else(|| invalid(resource, format!("group {group_id} vanished")))?;

        let desired_in = Self::desired_permissions(req, "ingress")?;
        let desired_out = Self::desired_permissions(req, "egress")?;

        if rule_keys(group.ip_permissions()) != rule_keys(&desired_in) {
            if !group.ip_permissions().is_empty() {
                self.ec2
                    .revoke_security_group_ingress()
                    .group_id(group_id)
                    .set_ip_permissions(Some(group.ip_permissions().to_vec()))
                    .send()
                    .await
                    .map_err(|e| classify(&e, resource, "update"))?;
            }
            if !desired_in.is_empty() {
                match self
                    .ec2
                    .authorize_security_group_ingress()
                    .group_id(group_id)
                    .set_ip_permissions(Some(desired_in))
                    .send()
                    .await
                {
                    Ok(_) => {}
                    Err(err) if has_code(&err, &["InvalidPermission.Duplicate"]) => {}
                    Err(err) => return Err(classify(&err, resource, "update")),
                }
            }
        }

        if rule_keys(group.ip_permissions_egress()) != rule_keys(&desired_out) {
            if !group.ip_permissions_egress().is_empty() {
                self.ec2
                    .revoke_security_group_egress()
                    .group_id(group_id)
                    .set_ip_permissions(Some(group.ip_permissions_egress().to_vec()))
                    .send()
                    .await
                    .map_err(|e| classify(&e, resource, "update"))?;
            }
            if !desired_out.is_empty() {
                match self
                    .ec2
                    .authorize_security_group_egress()
                    .group_id(group_id)
                    .set_ip_permissions(Some(desired_out))
                    .send()
                    .await
                {
                    Ok(_) => {}
                    Err(err) if has_code(&err, &["InvalidPermission.Duplicate"]) => {}
                    Err(err) => return Err(classify(&err, resource, "update")),
                }
            }
        }
        Ok(())
    }

    async fn read_security_group(&self, target: &ResourceTarget) -> BackendResult<Option<Attributes>> {
        let group_id = target.str_attr("id")?;
        match self
            .ec2
            .describe_security_groups()
            .group_ids(group_id)
            .send()
            .await
        {
            Ok(out) if out.security_groups().is_empty() => Ok(None),
            Ok(_) => Ok(Some(target.attributes.clone())),
            Err(err) if has_code(&err, &["InvalidGroup.NotFound", "InvalidGroupId.Malformed"]) => {
                Ok(None)
            }
            Err(err) => Err(classify(&err, &target.logical_name, "read")),
        }
    }

    async fn delete_security_group(&self, target: &ResourceTarget) -> BackendResult<()> {
        let group_id = target.str_attr("id")?;
        match self.ec2.delete_security_group().group_id(group_id).send().await {
            Ok(_) => {
                info!("Deleted security group {group_id}");
                Ok(())
            }
            Err(err) if has_code(&err, &["InvalidGroup.NotFound"]) => Ok(()),
            Err(err) => Err(classify(&err, &target.logical_name, "delete")),
        }
    }

    async fn create_instance(&self, req: &ResourceRequest) -> BackendResult<Attributes> {
        let resource = &req.logical_name;
        let user_data = req.str_prop("user_data").unwrap_or_default();
        let mut call = self
            .ec2
            .run_instances()
            .image_id(req.str_prop("ami")?)
            .instance_type(aws_sdk_ec2::types::InstanceType::from(
                req.str_prop("instance_type")?,
            ))
            .min_count(1)
            .max_count(1)
            .set_security_group_ids(Some(req.str_list_prop("security_group_ids")?))
            .user_data(base64::engine::general_purpose::STANDARD.encode(user_data))
            .client_token(&req.idempotency_token)
            .tag_specifications(Self::ec2_tags(
                aws_sdk_ec2::types::ResourceType::Instance,
                &req.tags,
            ));
        if let Ok(profile) = req.str_prop("iam_instance_profile") {
            call = call.iam_instance_profile(
                aws_sdk_ec2::types::IamInstanceProfileSpecification::builder()
                    .name(profile)
                    .build(),
            );
        }
        if let Ok(subnet) = req.str_prop("subnet_id") {
            call = call.subnet_id(subnet);
        }

        let out = match call.send().await {
            Ok(out) => out,
            // A just-created instance profile takes a few seconds to propagate.
            Err(err)
                if has_code(&err, &["InvalidParameterValue"])
                    && err
                        .as_service_error()
                        .and_then(ProvideErrorMetadata::message)
                        .is_some_and(|m| m.to_lowercase().contains("instance profile")) =>
            {
                return Err(BackendError::transient(
                    resource,
                    "create",
                    "instance profile not yet visible to EC2",
                ));
            }
            Err(err) => return Err(classify(&err, resource, "create")),
        };
        let instance_id = out
            .instances()
            .first()
            .and_then(|i| i.instance_id())
            .map(str::to_string)
            .ok_or_else(|| invalid(resource, "no instance returned"))?;
        info!("Launched instance {instance_id}, waiting for it to run");
        self.wait_for_instance(resource, &instance_id).await
    }

    async fn describe_instance(
        &self,
        resource: &str,
        instance_id: &str,
    ) -> BackendResult<Option<aws_sdk_ec2::types::Instance>> {
        match self
            .ec2
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
        {
            Ok(out) => Ok(out
                .reservations()
                .iter()
                .flat_map(|r| r.instances())
                .next()
                .cloned()),
            Err(err) if has_code(&err, &["InvalidInstanceID.NotFound"]) => Ok(None),
            Err(err) => Err(classify(&err, resource, "read")),
        }
    }

    async fn wait_for_instance(&self, resource: &str, instance_id: &str) -> BackendResult<Attributes> {
        use aws_sdk_ec2::types::InstanceStateName;

        for attempt in 0..self.poll.instance_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.poll.instance_interval).await;
            }
            // Freshly launched instances may not be visible yet.
            let Some(instance) = self.describe_instance(resource, instance_id).await? else {
                continue;
            };
            match instance.state().and_then(|s| s.name()) {
                Some(InstanceStateName::Running) => return Ok(instance_attributes(&instance)),
                Some(InstanceStateName::Terminated | InstanceStateName::ShuttingDown) => {
                    return Err(BackendError::request(
                        resource,
                        "create",
                        format!("instance {instance_id} terminated during launch"),
                    ));
                }
                state => debug!("Instance {instance_id} is {state:?}"),
            }
        }
        Err(BackendError::Timeout {
            resource: resource.to_string(),
            expected_state: String::from("running"),
        })
    }

    async fn read_instance(&self, target: &ResourceTarget) -> BackendResult<Option<Attributes>> {
        use aws_sdk_ec2::types::InstanceStateName;

        let instance_id = target.str_attr("id")?;
        let Some(instance) = self.describe_instance(&target.logical_name, instance_id).await? else {
            return Ok(None);
        };
        match instance.state().and_then(|s| s.name()) {
            Some(InstanceStateName::Terminated | InstanceStateName::ShuttingDown) => Ok(None),
            _ => Ok(Some(instance_attributes(&instance))),
        }
    }

    async fn delete_instance(&self, target: &ResourceTarget) -> BackendResult<()> {
        use aws_sdk_ec2::types::InstanceStateName;

        let resource = &target.logical_name;
        let instance_id = target.str_attr("id")?;
        match self
            .ec2
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
        {
            Ok(_) => info!("Terminating instance {instance_id}"),
            Err(err) if has_code(&err, &["InvalidInstanceID.NotFound"]) => return Ok(()),
            Err(err) => return Err(classify(&err, resource, "delete")),
        }

        // Security groups cannot be deleted while the instance holds them.
        for attempt in 0..self.poll.instance_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.poll.instance_interval).await;
            }
            let state = self
                .describe_instance(resource, instance_id)
                .await?
                .and_then(|i| i.state().and_then(|s| s.name()).cloned());
            match state {
                None | Some(InstanceStateName::Terminated) => return Ok(()),
                Some(state) => debug!("Instance {instance_id} is {state:?}"),
            }
        }
        Err(BackendError::Timeout {
            resource: resource.clone(),
            expected_state: String::from("terminated"),
        })
    }

    // ---- IAM -----------------------------------------------------------

    fn iam_tags(req: &ResourceRequest) -> BackendResult<Vec<aws_sdk_iam::types::Tag>> {
        req.tags
            .iter()
            .map(|(k, v)| {
                aws_sdk_iam::types::Tag::builder()
                    .key(k)
                    .value(v)
                    .build()
                    .map_err(|e| invalid(&req.logical_name, e))
            })
            .collect()
    }

    async fn role_attributes(&self, resource: &str, name: &str) -> BackendResult<Option<Attributes>> {
        match self.iam.get_role().role_name(name).send().await {
            Ok(out) => Ok(out.role().map(|role| {
                Attributes::from([
                    ("id".to_string(), json!(name)),
                    ("name".to_string(), json!(name)),
                    ("arn".to_string(), json!(role.arn())),
                ])
            })),
            Err(err) if has_code(&err, &["NoSuchEntity"]) => Ok(None),
            Err(err) => Err(classify(&err, resource, "read")),
        }
    }

    async fn create_role(&self, req: &ResourceRequest) -> BackendResult<Attributes> {
        let resource = &req.logical_name;
        let policy = req
            .properties
            .get("assume_role_policy")
            .ok_or_else(|| invalid(resource, "property 'assume_role_policy' is missing"))?
            .to_string();
        match self
            .iam
            .create_role()
            .role_name(&req.physical_name)
            .assume_role_policy_document(&policy)
            .set_tags(Some(Self::iam_tags(req)?))
            .send()
            .await
        {
            Ok(_) => info!("Created role {}", req.physical_name),
            Err(err) if has_code(&err, &["EntityAlreadyExists"]) => {
                debug!("Role {} exists, adopting", req.physical_name);
                self.update_role_policy(req, &policy).await?;
            }
            Err(err) => return Err(classify(&err, resource, "create")),
        }
        self.role_attributes(resource, &req.physical_name)
            .await?
            .ok_or_else(|| BackendError::transient(resource, "create", "role not yet readable"))
    }

    async fn update_role_policy(&self, req: &ResourceRequest, policy: &str) -> BackendResult<()> {
        self.iam
            .update_assume_role_policy()
            .role_name(&req.physical_name)
            .policy_document(policy)
            .send()
            .await
            .map_err(|e| classify(&e, &req.logical_name, "update"))?;
        Ok(())
    }

    async fn delete_role(&self, target: &ResourceTarget) -> BackendResult<()> {
        let name = target.str_attr("name")?;
        match self.iam.delete_role().role_name(name).send().await {
            Ok(_) => {
                info!("Deleted role {name}");
                Ok(())
            }
            Err(err) if has_code(&err, &["NoSuchEntity"]) => Ok(()),
            Err(err) => Err(classify(&err, &target.logical_name, "delete")),
        }
    }

    async fn attach_policy(&self, req: &ResourceRequest) -> BackendResult<Attributes> {
        let role = req.str_prop("role")?;
        let policy_arn = req.str_prop("policy_arn")?;
        self.iam
            .attach_role_policy()
            .role_name(role)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(|e| classify(&e, &req.logical_name, "create"))?;
        info!("Attached {policy_arn} to {role}");
        Ok(Attributes::from([
            ("id".to_string(), json!(format!("{role}/{policy_arn}"))),
            ("role".to_string(), json!(role)),
            ("policy_arn".to_string(), json!(policy_arn)),
        ]))
    }

    async fn read_attachment(&self, target: &ResourceTarget) -> BackendResult<Option<Attributes>> {
        let role = target.str_attr("role")?;
        let policy_arn = target.str_attr("policy_arn")?;
        match self
            .iam
            .list_attached_role_policies()
            .role_name(role)
            .send()
            .await
        {
            Ok(out) => Ok(out
                .attached_policies()
                .iter()
                .any(|p| p.policy_arn() == Some(policy_arn))
                .then(|| target.attributes.clone())),
            Err(err) if has_code(&err, &["NoSuchEntity"]) => Ok(None),
            Err(err) => Err(classify(&err, &target.logical_name, "read")),
        }
    }

    async fn detach_policy(&self, target: &ResourceTarget) -> BackendResult<()> {
        let role = target.str_attr("role")?;
        let policy_arn = target.str_attr("policy_arn")?;
        match self
            .iam
            .detach_role_policy()
            .role_name(role)
            .policy_arn(policy_arn)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if has_code(&err, &["NoSuchEntity"]) => Ok(()),
            Err(err) => Err(classify(&err, &target.logical_name, "delete")),
        }
    }

    /// Returns the profile's ARN and role names, or `None` if it is gone.
    async fn get_profile(
        &self,
        resource: &str,
        name: &str,
    ) -> BackendResult<Option<(Json, Vec<String>)>> {
        match self
            .iam
            .get_instance_profile()
            .instance_profile_name(name)
            .send()
            .await
        {
            Ok(out) => Ok(out.instance_profile().map(|p| {
                let roles = p
                    .roles()
                    .iter()
                    .filter_map(|r| {
                        serde_json::to_value(r.role_name())
                            .ok()
                            .and_then(|v| v.as_str().map(str::to_string))
                    })
                    .collect();
                (json!(p.arn()), roles)
            })),
            Err(err) if has_code(&err, &["NoSuchEntity"]) => Ok(None),
            Err(err) => Err(classify(&err, resource, "read")),
        }
    }

    async fn create_instance_profile(&self, req: &ResourceRequest) -> BackendResult<Attributes> {
        let resource = &req.logical_name;
        let name = &req.physical_name;
        let role = req.str_prop("role")?;
        match self
            .iam
            .create_instance_profile()
            .instance_profile_name(name)
            .set_tags(Some(Self::iam_tags(req)?))
            .send()
            .await
        {
            Ok(_) => info!("Created instance profile {name}"),
            Err(err) if has_code(&err, &["EntityAlreadyExists"]) => {
                debug!("Instance profile {name} exists, adopting");
            }
            Err(err) => return Err(classify(&err, resource, "create")),
        }

        let (arn, roles) = self
            .get_profile(resource, name)
            .await?
            .ok_or_else(|| BackendError::transient(resource, "create", "profile not yet readable"))?;
        if !roles.iter().any(|r| r == role) {
            self.iam
                .add_role_to_instance_profile()
                .instance_profile_name(name)
                .role_name(role)
                .send()
                .await
                .map_err(|e| classify(&e, resource, "create"))?;
        }
        Ok(Attributes::from([
            ("id".to_string(), json!(name)),
            ("name".to_string(), json!(name)),
            ("arn".to_string(), arn),
            ("role".to_string(), json!(role)),
        ]))
    }

    async fn delete_instance_profile(&self, target: &ResourceTarget) -> BackendResult<()> {
        let resource = &target.logical_name;
        let name = target.str_attr("name")?;
        let Some((_, roles)) = self.get_profile(resource, name).await? else {
            return Ok(());
        };
        for role in roles {
            match self
                .iam
                .remove_role_from_instance_profile()
                .instance_profile_name(name)
                .role_name(&role)
                .send()
                .await
            {
                Ok(_) => {}
                Err(err) if has_code(&err, &["NoSuchEntity"]) => {}
                Err(err) => return Err(classify(&err, resource, "delete")),
            }
        }
        match self
            .iam
            .delete_instance_profile()
            .instance_profile_name(name)
            .send()
            .await
        {
            Ok(_) => {
                info!("Deleted instance profile {name}");
                Ok(())
            }
            Err(err) if has_code(&err, &["NoSuchEntity"]) => Ok(()),
            Err(err) => Err(classify(&err, resource, "delete")),
        }
    }

    // ---- RDS -----------------------------------------------------------

    fn rds_tags(tags: &BTreeMap<String, String>) -> Vec<aws_sdk_rds::types::Tag> {
        tags.iter()
            .map(|(k, v)| aws_sdk_rds::types::Tag::builder().key(k).value(v).build())
            .collect()
    }

    async fn subnet_group_attributes(
        &self,
        resource: &str,
        name: &str,
    ) -> BackendResult<Option<Attributes>> {
        match self
            .rds
            .describe_db_subnet_groups()
            .db_subnet_group_name(name)
            .send()
            .await
        {
            Ok(out) => Ok(out.db_subnet_groups().first().map(|g| {
                Attributes::from([
                    ("id".to_string(), json!(name)),
                    ("name".to_string(), json!(name)),
                    ("arn".to_string(), json!(g.db_subnet_group_arn())),
                ])
            })),
            Err(err) if has_code(&err, &["DBSubnetGroupNotFoundFault"]) => Ok(None),
            Err(err) => Err(classify(&err, resource, "read")),
        }
    }

    async fn create_subnet_group(&self, req: &ResourceRequest) -> BackendResult<Attributes> {
        let resource = &req.logical_name;
        let name = &req.physical_name;
        match self
            .rds
            .create_db_subnet_group()
            .db_subnet_group_name(name)
            .db_subnet_group_description(req.str_prop("description").unwrap_or("managed by taskstack"))
            .set_subnet_ids(Some(req.str_list_prop("subnet_ids")?))
            .set_tags(Some(Self::rds_tags(&req.tags)))
            .send()
            .await
        {
            Ok(_) => info!("Created DB subnet group {name}"),
            Err(err) if has_code(&err, &["DBSubnetGroupAlreadyExists"]) => {
                debug!("DB subnet group {name} exists, converging");
                self.modify_subnet_group(req).await?;
            }
            Err(err) => return Err(classify(&err, resource, "create")),
        }
        self.subnet_group_attributes(resource, name)
            .await?
            .ok_or_else(|| BackendError::transient(resource, "create", "subnet group not yet readable"))
    }

    async fn modify_subnet_group(&self, req: &ResourceRequest) -> BackendResult<Attributes> {
        let resource = &req.logical_name;
        self.rds
            .modify_db_subnet_group()
            .db_subnet_group_name(&req.physical_name)
            .db_subnet_group_description(req.str_prop("description").unwrap_or("managed by taskstack"))
            .set_subnet_ids(Some(req.str_list_prop("subnet_ids")?))
            .send()
            .await
            .map_err(|e| classify(&e, resource, "update"))?;
        self.subnet_group_attributes(resource, &req.physical_name)
            .await?
            .ok_or_else(|| invalid(resource, "subnet group vanished during update"))
    }

    async fn delete_subnet_group(&self, target: &ResourceTarget) -> BackendResult<()> {
        let name = target.str_attr("name")?;
        match self
            .rds
            .delete_db_subnet_group()
            .db_subnet_group_name(name)
            .send()
            .await
        {
            Ok(_) => {
                info!("Deleted DB subnet group {name}");
                Ok(())
            }
            Err(err) if has_code(&err, &["DBSubnetGroupNotFoundFault"]) => Ok(()),
            // Still attached to a database that is being deleted.
            Err(err) if has_code(&err, &["InvalidDBSubnetGroupStateFault"]) => Err(
                BackendError::transient(&target.logical_name, "delete", "subnet group still in use"),
            ),
            Err(err) => Err(classify(&err, &target.logical_name, "delete")),
        }
    }

    async fn describe_db(
        &self,
        resource: &str,
        identifier: &str,
    ) -> BackendResult<Option<aws_sdk_rds::types::DbInstance>> {
        match self
            .rds
            .describe_db_instances()
            .db_instance_identifier(identifier)
            .send()
            .await
        {
            Ok(out) => Ok(out.db_instances().first().cloned()),
            Err(err) if has_code(&err, &["DBInstanceNotFound", "DBInstanceNotFoundFault"]) => {
                Ok(None)
            }
            Err(err) => Err(classify(&err, resource, "read")),
        }
    }

    fn db_attributes(db: &aws_sdk_rds::types::DbInstance, skip_final_snapshot: bool) -> Attributes {
        let endpoint = db.endpoint();
        let address = endpoint.and_then(|e| e.address()).unwrap_or_default();
        let port = endpoint.and_then(|e| e.port()).unwrap_or(5432);
        Attributes::from([
            ("id".to_string(), json!(db.db_instance_identifier())),
            ("arn".to_string(), json!(db.db_instance_arn())),
            ("address".to_string(), json!(address)),
            ("port".to_string(), json!(port)),
            ("endpoint".to_string(), json!(format!("{address}:{port}"))),
            ("skip_final_snapshot".to_string(), json!(skip_final_snapshot)),
        ])
    }

    async fn wait_for_db(&self, req: &ResourceRequest) -> BackendResult<Attributes> {
        let resource = &req.logical_name;
        let skip = req.bool_prop("skip_final_snapshot").unwrap_or(true);
        for attempt in 0..self.poll.db_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.poll.db_interval).await;
            }
            let Some(db) = self.describe_db(resource, &req.physical_name).await? else {
                continue;
            };
            match db.db_instance_status() {
                Some("available") if db.endpoint().is_some() => {
                    return Ok(Self::db_attributes(&db, skip));
                }
                Some(status @ ("failed" | "incompatible-parameters" | "storage-full")) => {
                    return Err(BackendError::request(
                        resource,
                        "create",
                        format!("database entered state '{status}'"),
                    ));
                }
                status => debug!("Database {} is {status:?}", req.physical_name),
            }
        }
        Err(BackendError::Timeout {
            resource: resource.clone(),
            expected_state: String::from("available"),
        })
    }

    async fn create_db(&self, req: &ResourceRequest) -> BackendResult<Attributes> {
        let resource = &req.logical_name;
        let storage = req
            .properties
            .get("allocated_storage")
            .and_then(Json::as_i64)
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| invalid(resource, "property 'allocated_storage' must be an integer"))?;
        match self
            .rds
            .create_db_instance()
            .db_instance_identifier(&req.physical_name)
            .engine(req.str_prop("engine")?)
            .engine_version(req.str_prop("engine_version")?)
            .db_instance_class(req.str_prop("instance_class")?)
            .allocated_storage(storage)
            .db_name(req.str_prop("db_name")?)
            .master_username(req.str_prop("username")?)
            .master_user_password(req.str_prop("password")?)
            .db_subnet_group_name(req.str_prop("db_subnet_group_name")?)
            .set_vpc_security_group_ids(Some(req.str_list_prop("vpc_security_group_ids")?))
            .publicly_accessible(req.bool_prop("publicly_accessible").unwrap_or(false))
            .set_tags(Some(Self::rds_tags(&req.tags)))
            .send()
            .await
        {
            Ok(_) => info!("Creating database {}, waiting for it to become available", req.physical_name),
            Err(err) if has_code(&err, &["DBInstanceAlreadyExists", "DBInstanceAlreadyExistsFault"]) => {
                debug!("Database {} exists, adopting", req.physical_name);
            }
            Err(err) => return Err(classify(&err, resource, "create")),
        }
        self.wait_for_db(req).await
    }

    async fn modify_db(&self, req: &ResourceRequest) -> BackendResult<Attributes> {
        let resource = &req.logical_name;
        let mut call = self
            .rds
            .modify_db_instance()
            .db_instance_identifier(&req.physical_name)
            .db_instance_class(req.str_prop("instance_class")?)
            .engine_version(req.str_prop("engine_version")?)
            .allow_major_version_upgrade(true)
            .master_user_password(req.str_prop("password")?)
            .db_subnet_group_name(req.str_prop("db_subnet_group_name")?)
            .set_vpc_security_group_ids(Some(req.str_list_prop("vpc_security_group_ids")?))
            .publicly_accessible(req.bool_prop("publicly_accessible").unwrap_or(false))
            .apply_immediately(true);
        if let Some(storage) = req
            .properties
            .get("allocated_storage")
            .and_then(Json::as_i64)
            .and_then(|v| i32::try_from(v).ok())
        {
            call = call.allocated_storage(storage);
        }
        call.send()
            .await
            .map_err(|e| classify(&e, resource, "update"))?;
        info!("Modifying database {}", req.physical_name);
        self.wait_for_db(req).await
    }

    async fn read_db(&self, target: &ResourceTarget) -> BackendResult<Option<Attributes>> {
        let identifier = target.str_attr("id")?;
        let skip = target
            .attributes
            .get("skip_final_snapshot")
            .and_then(Json::as_bool)
            .unwrap_or(true);
        Ok(self
            .describe_db(&target.logical_name, identifier)
            .await?
            .filter(|db| db.db_instance_status() != Some("deleting"))
            .map(|db| Self::db_attributes(&db, skip)))
    }

    async fn delete_db(&self, target: &ResourceTarget) -> BackendResult<()> {
        let resource = &target.logical_name;
        let identifier = target.str_attr("id")?;
        let skip = target
            .attributes
            .get("skip_final_snapshot")
            .and_then(Json::as_bool)
            .unwrap_or(true);
        let mut call = self
            .rds
            .delete_db_instance()
            .db_instance_identifier(identifier)
            .skip_final_snapshot(skip)
            .delete_automated_backups(true);
        if !skip {
            call = call.final_db_snapshot_identifier(format!(
                "{identifier}-final-{}",
                chrono::Utc::now().format("%Y%m%d%H%M%S")
            ));
        }
        match call.send().await {
            Ok(_) => info!("Deleting database {identifier}"),
            Err(err) if has_code(&err, &["DBInstanceNotFound", "DBInstanceNotFoundFault"]) => {
                return Ok(());
            }
            Err(err) if has_code(&err, &["InvalidDBInstanceState"]) => {
                warn!("Database {identifier} is busy; waiting for deletion");
            }
            Err(err) => return Err(classify(&err, resource, "delete")),
        }

        for attempt in 0..self.poll.db_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.poll.db_interval).await;
            }
            if self.describe_db(resource, identifier).await?.is_none() {
                return Ok(());
            }
        }
        Err(BackendError::Timeout {
            resource: resource.clone(),
            expected_state: String::from("deleted"),
        })
    }

    // ---- SSM -----------------------------------------------------------

    async fn lookup_parameter(&self, query: &LookupRequest, name: &str) -> BackendResult<Attributes> {
        let out = self
            .ssm
            .get_parameter()
            .name(name)
            .with_decryption(true)
            .send()
            .await
            .map_err(|e| lookup_error(&e, query))?;
        let parameter = out.parameter();
        let value = parameter
            .and_then(|p| p.value())
            .ok_or_else(|| BackendError::LookupFailed {
                query: query.to_string(),
                message: String::from("parameter has no value"),
            })?;
        Ok(Attributes::from([
            ("id".to_string(), json!(name)),
            ("value".to_string(), json!(value)),
            ("version".to_string(), json!(parameter.map(|p| p.version()))),
        ]))
    }
}

fn instance_attributes(instance: &aws_sdk_ec2::types::Instance) -> Attributes {
    Attributes::from([
        ("id".to_string(), json!(instance.instance_id())),
        ("public_ip".to_string(), json!(instance.public_ip_address())),
        ("public_dns".to_string(), json!(instance.public_dns_name())),
        ("private_ip".to_string(), json!(instance.private_ip_address())),
    ])
}

/// Comparable form of a rule set: (protocol, from, to, sources).
fn rule_keys(
    perms: &[aws_sdk_ec2::types::IpPermission],
) -> BTreeSet<(String, Option<i32>, Option<i32>, BTreeSet<String>)> {
    perms
        .iter()
        .map(|p| {
            let sources = p
                .ip_ranges()
                .iter()
                .filter_map(|r| r.cidr_ip().map(str::to_string))
                .chain(
                    p.user_id_group_pairs()
                        .iter()
                        .filter_map(|g| g.group_id().map(str::to_string)),
                )
                .collect();
            let all = p.ip_protocol() == Some("-1");
            (
                p.ip_protocol().unwrap_or_default().to_string(),
                if all { None } else { p.from_port() },
                if all { None } else { p.to_port() },
                sources,
            )
        })
        .collect()
}

fn recorded_keys(target: &ResourceTarget) -> Vec<String> {
    target
        .attributes
        .get("keys")
        .and_then(Json::as_array)
        .map(|keys| {
            keys.iter()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl CloudBackend for AwsBackend {
    async fn lookup(&self, request: &LookupRequest) -> BackendResult<Attributes> {
        debug!("Looking up {request}");
        match request {
            LookupRequest::DefaultVpc => self.lookup_default_vpc(request).await,
            LookupRequest::Subnets { vpc_id } => self.lookup_subnets(request, vpc_id).await,
            LookupRequest::LatestAmi {
                owners,
                name_pattern,
            } => self.lookup_ami(request, owners, name_pattern).await,
            LookupRequest::SsmParameter { name } => self.lookup_parameter(request, name).await,
        }
    }

    async fn create(&self, request: &ResourceRequest) -> BackendResult<Attributes> {
        match request.kind {
            ResourceKind::Bucket => self.create_bucket(request).await,
            ResourceKind::BucketPublicAccessBlock => self.put_public_access_block(request).await,
            ResourceKind::BucketWebsite => self.put_website(request).await,
            ResourceKind::BucketCors => self.put_cors(request).await,
            ResourceKind::BucketPolicy => self.put_policy(request).await,
            ResourceKind::BucketContent => self.upload_content(request, None).await,
            ResourceKind::SecurityGroup => self.create_security_group(request).await,
            ResourceKind::IamRole => self.create_role(request).await,
            ResourceKind::RolePolicyAttachment => self.attach_policy(request).await,
            ResourceKind::InstanceProfile => self.create_instance_profile(request).await,
            ResourceKind::Instance => self.create_instance(request).await,
            ResourceKind::DbSubnetGroup => self.create_subnet_group(request).await,
            ResourceKind::DbInstance => self.create_db(request).await,
        }
    }

    async fn read(&self, target: &ResourceTarget) -> BackendResult<Option<Attributes>> {
        match target.kind {
            ResourceKind::Bucket => {
                let bucket = target.str_attr("id")?;
                Ok(self
                    .bucket_exists(bucket, &target.logical_name)
                    .await?
                    .then(|| target.attributes.clone()))
            }
            ResourceKind::BucketPublicAccessBlock
            | ResourceKind::BucketWebsite
            | ResourceKind::BucketCors
            | ResourceKind::BucketPolicy => self.read_bucket_config(target).await,
            ResourceKind::BucketContent => self.read_content(target).await,
            ResourceKind::SecurityGroup => self.read_security_group(target).await,
            ResourceKind::IamRole => {
                self.role_attributes(&target.logical_name, target.str_attr("name")?)
                    .await
            }
            ResourceKind::RolePolicyAttachment => self.read_attachment(target).await,
            ResourceKind::InstanceProfile => Ok(self
                .get_profile(&target.logical_name, target.str_attr("name")?)
                .await?
                .map(|_| target.attributes.clone())),
            ResourceKind::Instance => self.read_instance(target).await,
            ResourceKind::DbSubnetGroup => {
                self.subnet_group_attributes(&target.logical_name, target.str_attr("name")?)
                    .await
            }
            ResourceKind::DbInstance => self.read_db(target).await,
        }
    }

    async fn update(
        &self,
        request: &ResourceRequest,
        current: &ResourceTarget,
    ) -> BackendResult<Attributes> {
        match request.kind {
            ResourceKind::Bucket => {
                self.tag_bucket(request).await?;
                Ok(self.bucket_attributes(request))
            }
            ResourceKind::BucketPublicAccessBlock => self.put_public_access_block(request).await,
            ResourceKind::BucketWebsite => self.put_website(request).await,
            ResourceKind::BucketCors => self.put_cors(request).await,
            ResourceKind::BucketPolicy => self.put_policy(request).await,
            ResourceKind::BucketContent => self.upload_content(request, Some(current)).await,
            ResourceKind::SecurityGroup => {
                let group_id = current.str_attr("id")?;
                // VPC and description changes are routed to a replacement.
                self.sync_group_rules(request, group_id).await?;
                Ok(current.attributes.clone())
            }
            ResourceKind::IamRole => {
                let policy = request
                    .properties
                    .get("assume_role_policy")
                    .map(Json::to_string)
                    .unwrap_or_default();
                self.update_role_policy(request, &policy).await?;
                Ok(current.attributes.clone())
            }
            ResourceKind::DbSubnetGroup => self.modify_subnet_group(request).await,
            ResourceKind::DbInstance => self.modify_db(request).await,
            kind @ (ResourceKind::RolePolicyAttachment
            | ResourceKind::InstanceProfile
            | ResourceKind::Instance) => Err(BackendError::request(
                &request.logical_name,
                "update",
                format!("{kind} resources are replaced, not updated"),
            )),
        }
    }

    async fn delete(&self, target: &ResourceTarget) -> BackendResult<()> {
        match target.kind {
            ResourceKind::Bucket => self.delete_bucket(target).await,
            ResourceKind::BucketPublicAccessBlock
            | ResourceKind::BucketWebsite
            | ResourceKind::BucketCors
            | ResourceKind::BucketPolicy
            | ResourceKind::BucketContent => self.delete_bucket_config(target).await,
            ResourceKind::SecurityGroup => self.delete_security_group(target).await,
            ResourceKind::IamRole => self.delete_role(target).await,
            ResourceKind::RolePolicyAttachment => self.detach_policy(target).await,
            ResourceKind::InstanceProfile => self.delete_instance_profile(target).await,
            ResourceKind::Instance => self.delete_instance(target).await,
            ResourceKind::DbSubnetGroup => self.delete_subnet_group(target).await,
            ResourceKind::DbInstance => self.delete_db(target).await,
        }
    }

    fn backend_type(&self) -> &'static str {
        "aws"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_ec2::types::{IpPermission, IpRange, UserIdGroupPair};

    fn request(properties: Json) -> ResourceRequest {
        let properties = properties
            .as_object()
            .map(|m| m.clone().into_iter().collect())
            .unwrap_or_default();
        ResourceRequest {
            logical_name: String::from("api-sg"),
            physical_name: String::from("taskstack-dev-api-sg"),
            kind: ResourceKind::SecurityGroup,
            properties,
            tags: BTreeMap::new(),
            idempotency_token: String::new(),
        }
    }

    #[test]
    fn test_desired_permissions_from_rules() {
        let req = request(json!({
            "ingress": [
                {"protocol": "tcp", "from_port": 80, "to_port": 80, "cidr_blocks": ["0.0.0.0/0"]},
                {"protocol": "tcp", "from_port": 5432, "to_port": 5432,
                 "source_security_group_ids": ["sg-0123"]}
            ]
        }));

        let perms = AwsBackend::desired_permissions(&req, "ingress").unwrap();
        assert_eq!(perms.len(), 2);
        assert_eq!(perms[0].from_port(), Some(80));
        assert_eq!(perms[0].ip_ranges()[0].cidr_ip(), Some("0.0.0.0/0"));
        assert_eq!(perms[1].user_id_group_pairs()[0].group_id(), Some("sg-0123"));
        assert!(AwsBackend::desired_permissions(&req, "egress").unwrap().is_empty());
    }

    #[test]
    fn test_rule_keys_ignore_representation_details() {
        // What AWS reports for the default egress rule.
        let reported = IpPermission::builder()
            .ip_protocol("-1")
            .ip_ranges(IpRange::builder().cidr_ip("0.0.0.0/0").build())
            .build();
        let req = request(json!({
            "egress": [{"protocol": "-1", "from_port": 0, "to_port": 0, "cidr_blocks": ["0.0.0.0/0"]}]
        }));
        let desired = AwsBackend::desired_permissions(&req, "egress").unwrap();

        assert_eq!(rule_keys(&[reported]), rule_keys(&desired));

        let from_group = IpPermission::builder()
            .ip_protocol("tcp")
            .from_port(5432)
            .to_port(5432)
            .user_id_group_pairs(UserIdGroupPair::builder().group_id("sg-1").build())
            .build();
        assert_ne!(rule_keys(&[from_group]), rule_keys(&desired));
    }

    #[test]
    fn test_recorded_keys() {
        let target = ResourceTarget {
            logical_name: String::from("site-content"),
            physical_name: String::from("taskstack-dev-site-content"),
            kind: ResourceKind::BucketContent,
            attributes: Attributes::from([(
                "keys".to_string(),
                json!(["index.html", "assets/app.js"]),
            )]),
        };
        assert_eq!(recorded_keys(&target), vec!["index.html", "assets/app.js"]);
    }
}
