//! Deterministic in-process cloud.
//!
//! Used by tests and by `--backend memory` rehearsals. Every call is logged,
//! failures can be injected per logical name, and the number of concurrent
//! mutating calls is tracked.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{BackendResult, CloudBackend, LookupRequest, ResourceRequest, ResourceTarget};
use crate::error::BackendError;
use crate::graph::{Attributes, ResourceKind};

/// Backend operation names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Lookup.
    Lookup,
    /// Create.
    Create,
    /// Read.
    Read,
    /// Update.
    Update,
    /// Delete.
    Delete,
}

/// One logged backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCall {
    /// Operation.
    pub operation: Operation,
    /// Logical resource name, or the lookup description.
    pub target: String,
}

/// How an injected failure behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Fails every time.
    Fatal,
    /// Fails with a transient error this many times, then succeeds.
    Transient(u32),
}

#[derive(Debug, Clone)]
struct StoredResource {
    kind: ResourceKind,
    logical_name: String,
    attributes: Attributes,
}

#[derive(Debug, Default)]
struct MemoryCloud {
    /// physical name -> resource
    resources: BTreeMap<String, StoredResource>,
    calls: Vec<BackendCall>,
    /// (operation, target) -> failure
    failures: HashMap<(Operation, String), FailureMode>,
    /// parameter name -> (value, version)
    secrets: HashMap<String, (String, i64)>,
    next_id: u32,
}

/// In-memory [`CloudBackend`].
#[derive(Debug)]
pub struct MemoryBackend {
    region: String,
    cloud: Mutex<MemoryCloud>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new("us-east-1")
    }
}

impl MemoryBackend {
    /// Creates an empty in-memory cloud for a region.
    #[must_use]
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            cloud: Mutex::new(MemoryCloud::default()),
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Adds a delay to every mutating call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Seeds an SSM parameter.
    #[must_use]
    pub fn with_secret(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.put_secret(name, value);
        self
    }

    /// Writes an SSM parameter, bumping its version like a real overwrite.
    pub fn put_secret(&self, name: impl Into<String>, value: impl Into<String>) {
        let mut cloud = self.lock();
        let entry = cloud.secrets.entry(name.into()).or_insert((String::new(), 0));
        entry.0 = value.into();
        entry.1 += 1;
    }

    /// Makes `operation` on `target` fail. For lookups the target is the
    /// request's display form, e.g. `subnets(vpc-0default)`.
    pub fn fail(&self, operation: Operation, target: impl Into<String>, mode: FailureMode) {
        self.lock().failures.insert((operation, target.into()), mode);
    }

    /// Removes every injected failure.
    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Deletes a resource behind the planner's back (drift).
    pub fn remove_out_of_band(&self, logical_name: &str) -> bool {
        let mut cloud = self.lock();
        let physical = cloud
            .resources
            .iter()
            .find(|(_, r)| r.logical_name == logical_name)
            .map(|(p, _)| p.clone());
        physical.is_some_and(|p| cloud.resources.remove(&p).is_some())
    }

    /// All calls made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    /// Targets of calls with the given operation, in call order.
    #[must_use]
    pub fn calls_of(&self, operation: Operation) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .map(|c| c.target.clone())
            .collect()
    }

    /// Forgets the call log.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Logical names of resources that currently exist.
    #[must_use]
    pub fn existing(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .resources
            .values()
            .map(|r| r.logical_name.clone())
            .collect();
        names.sort();
        names
    }

    /// Highest number of mutating calls observed in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryCloud> {
        // A poisoned lock only means a test panicked mid-call; the data is
        // still usable.
        self.cloud
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Logs the call and applies any injected failure.
    fn record(&self, operation: Operation, target: &str) -> BackendResult<()> {
        let mut cloud = self.lock();
        cloud.calls.push(BackendCall {
            operation,
            target: target.to_string(),
        });

        let key = (operation, target.to_string());
        let op_name = format!("{operation:?}").to_lowercase();
        match cloud.failures.get(&key).copied() {
            None => Ok(()),
            Some(FailureMode::Fatal) => Err(BackendError::request(
                target,
                op_name,
                "injected failure",
            )),
            Some(FailureMode::Transient(0)) => {
                cloud.failures.remove(&key);
                Ok(())
            }
            Some(FailureMode::Transient(n)) => {
                cloud.failures.insert(key, FailureMode::Transient(n - 1));
                Err(BackendError::transient(target, op_name, "injected throttling"))
            }
        }
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        InFlight(&self.in_flight)
    }

    fn generate_attributes(&self, request: &ResourceRequest, serial: u32) -> Attributes {
        let physical = &request.physical_name;
        let props = &request.properties;
        let prop = |key: &str| props.get(key).cloned().unwrap_or(serde_json::Value::Null);
        let mut attrs = Attributes::new();

        match request.kind {
            ResourceKind::Bucket => {
                attrs.insert("id".into(), json!(physical));
                attrs.insert("arn".into(), json!(format!("arn:aws:s3:::{physical}")));
                attrs.insert(
                    "bucket_domain_name".into(),
                    json!(format!("{physical}.s3.amazonaws.com")),
                );
                attrs.insert("region".into(), json!(self.region));
            }
            ResourceKind::BucketPublicAccessBlock
            | ResourceKind::BucketCors
            | ResourceKind::BucketPolicy => {
                attrs.insert("id".into(), prop("bucket"));
                attrs.insert("bucket".into(), prop("bucket"));
            }
            ResourceKind::BucketWebsite => {
                let bucket = prop("bucket");
                let endpoint = format!(
                    "{}.s3-website-{}.amazonaws.com",
                    bucket.as_str().unwrap_or_default(),
                    self.region
                );
                attrs.insert("id".into(), bucket.clone());
                attrs.insert("bucket".into(), bucket);
                attrs.insert("website_endpoint".into(), json!(endpoint));
            }
            ResourceKind::BucketContent => {
                attrs.insert("id".into(), json!(physical));
                attrs.insert("bucket".into(), prop("bucket"));
                attrs.insert("digest".into(), prop("digest"));
                attrs.insert("object_count".into(), prop("object_count"));
            }
            ResourceKind::SecurityGroup => {
                attrs.insert("id".into(), json!(format!("sg-{serial:08x}")));
                attrs.insert("name".into(), json!(physical));
                attrs.insert("vpc_id".into(), prop("vpc_id"));
            }
            ResourceKind::IamRole | ResourceKind::InstanceProfile => {
                let kind = if request.kind == ResourceKind::IamRole {
                    "role"
                } else {
                    "instance-profile"
                };
                attrs.insert("id".into(), json!(physical));
                attrs.insert("name".into(), json!(physical));
                attrs.insert(
                    "arn".into(),
                    json!(format!("arn:aws:iam::000000000000:{kind}/{physical}")),
                );
            }
            ResourceKind::RolePolicyAttachment => {
                let role = prop("role");
                let policy = prop("policy_arn");
                attrs.insert(
                    "id".into(),
                    json!(format!(
                        "{}/{}",
                        role.as_str().unwrap_or_default(),
                        policy.as_str().unwrap_or_default()
                    )),
                );
                attrs.insert("role".into(), role);
                attrs.insert("policy_arn".into(), policy);
            }
            ResourceKind::Instance => {
                let octet = serial % 250 + 1;
                attrs.insert("id".into(), json!(format!("i-{serial:017x}")));
                attrs.insert("public_ip".into(), json!(format!("203.0.113.{octet}")));
                attrs.insert(
                    "public_dns".into(),
                    json!(format!(
                        "ec2-203-0-113-{octet}.{}.compute.amazonaws.com",
                        self.region
                    )),
                );
                attrs.insert("private_ip".into(), json!(format!("172.31.0.{octet}")));
            }
            ResourceKind::DbSubnetGroup => {
                attrs.insert("id".into(), json!(physical));
                attrs.insert("name".into(), json!(physical));
                attrs.insert(
                    "arn".into(),
                    json!(format!(
                        "arn:aws:rds:{}:000000000000:subgrp:{physical}",
                        self.region
                    )),
                );
            }
            ResourceKind::DbInstance => {
                let address = format!("{physical}.c0ffee.{}.rds.amazonaws.com", self.region);
                attrs.insert("id".into(), json!(physical));
                attrs.insert("address".into(), json!(address));
                attrs.insert("port".into(), json!(5432));
                attrs.insert("endpoint".into(), json!(format!("{address}:5432")));
                attrs.insert(
                    "arn".into(),
                    json!(format!(
                        "arn:aws:rds:{}:000000000000:db:{physical}",
                        self.region
                    )),
                );
            }
        }
        attrs
    }
}

/// Decrements the in-flight counter on drop.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CloudBackend for MemoryBackend {
    async fn lookup(&self, request: &LookupRequest) -> BackendResult<Attributes> {
        let label = request.to_string();
        self.record(Operation::Lookup, &label).map_err(|e| {
            if e.is_transient() {
                e
            } else {
                BackendError::LookupFailed {
                    query: label.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        let mut attrs = Attributes::new();
        match request {
            LookupRequest::DefaultVpc => {
                attrs.insert("id".into(), json!("vpc-0default"));
                attrs.insert("cidr_block".into(), json!("172.31.0.0/16"));
            }
            LookupRequest::Subnets { vpc_id } => {
                attrs.insert("id".into(), json!(vpc_id));
                attrs.insert(
                    "ids".into(),
                    json!(["subnet-0a", "subnet-0b", "subnet-0c"]),
                );
            }
            LookupRequest::LatestAmi { name_pattern, .. } => {
                attrs.insert("id".into(), json!("ami-0123456789abcdef0"));
                attrs.insert("name".into(), json!(name_pattern.replace('*', "2024.0.1")));
            }
            LookupRequest::SsmParameter { name } => {
                let (value, version) = self.lock().secrets.get(name).cloned().ok_or_else(|| {
                    BackendError::LookupFailed {
                        query: label.clone(),
                        message: String::from("ParameterNotFound"),
                    }
                })?;
                attrs.insert("id".into(), json!(name));
                attrs.insert("value".into(), json!(value));
                attrs.insert("version".into(), json!(version));
            }
        }
        Ok(attrs)
    }

    async fn create(&self, request: &ResourceRequest) -> BackendResult<Attributes> {
        let _guard = self.enter().await;
        self.record(Operation::Create, &request.logical_name)?;

        let mut cloud = self.lock();
        if let Some(existing) = cloud.resources.get(&request.physical_name) {
            debug!("{} already exists, adopting", request.physical_name);
            return Ok(existing.attributes.clone());
        }
        cloud.next_id += 1;
        let attributes = self.generate_attributes(request, cloud.next_id);
        cloud.resources.insert(
            request.physical_name.clone(),
            StoredResource {
                kind: request.kind,
                logical_name: request.logical_name.clone(),
                attributes: attributes.clone(),
            },
        );
        Ok(attributes)
    }

    async fn read(&self, target: &ResourceTarget) -> BackendResult<Option<Attributes>> {
        self.record(Operation::Read, &target.logical_name)?;
        Ok(self
            .lock()
            .resources
            .get(&target.physical_name)
            .filter(|r| r.kind == target.kind)
            .map(|r| r.attributes.clone()))
    }

    async fn update(
        &self,
        request: &ResourceRequest,
        current: &ResourceTarget,
    ) -> BackendResult<Attributes> {
        let _guard = self.enter().await;
        self.record(Operation::Update, &request.logical_name)?;

        let mut cloud = self.lock();
        let serial = cloud.next_id;
        let Some(stored) = cloud.resources.get_mut(&current.physical_name) else {
            return Err(BackendError::request(
                &request.logical_name,
                "update",
                "resource does not exist",
            ));
        };
        // Identity-bearing attributes (ids, addresses) survive an update.
        let regenerated = self.generate_attributes(request, serial);
        for (key, value) in regenerated {
            stored.attributes.entry(key).or_insert(value);
        }
        for key in ["digest", "object_count"] {
            if let Some(value) = request.properties.get(key) {
                stored.attributes.insert(key.to_string(), value.clone());
            }
        }
        Ok(stored.attributes.clone())
    }

    async fn delete(&self, target: &ResourceTarget) -> BackendResult<()> {
        let _guard = self.enter().await;
        self.record(Operation::Delete, &target.logical_name)?;
        self.lock().resources.remove(&target.physical_name);
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, kind: ResourceKind) -> ResourceRequest {
        ResourceRequest {
            logical_name: name.to_string(),
            physical_name: format!("taskstack-dev-{name}"),
            kind,
            properties: Attributes::new(),
            tags: BTreeMap::new(),
            idempotency_token: String::from("token"),
        }
    }

    fn target(req: &ResourceRequest, attributes: Attributes) -> ResourceTarget {
        ResourceTarget {
            logical_name: req.logical_name.clone(),
            physical_name: req.physical_name.clone(),
            kind: req.kind,
            attributes,
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent_by_physical_name() {
        let backend = MemoryBackend::default();
        let req = request("api", ResourceKind::Instance);

        let first = backend.create(&req).await.unwrap();
        let second = backend.create(&req).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.existing(), vec!["api".to_string()]);
        assert_eq!(backend.calls_of(Operation::Create).len(), 2);
    }

    #[tokio::test]
    async fn test_read_after_delete_is_none() {
        let backend = MemoryBackend::default();
        let req = request("db", ResourceKind::DbInstance);
        let attrs = backend.create(&req).await.unwrap();
        let target = target(&req, attrs);

        assert!(backend.read(&target).await.unwrap().is_some());
        backend.delete(&target).await.unwrap();
        assert!(backend.read(&target).await.unwrap().is_none());
        // Deleting twice succeeds.
        backend.delete(&target).await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failure_clears() {
        let backend = MemoryBackend::default();
        backend.fail(Operation::Create, "api-sg", FailureMode::Transient(1));
        let req = request("api-sg", ResourceKind::SecurityGroup);

        assert!(backend.create(&req).await.unwrap_err().is_transient());
        assert!(backend.create(&req).await.is_ok());
    }

    #[tokio::test]
    async fn test_secret_lookup() {
        let backend = MemoryBackend::default().with_secret("/taskstack/dev/db", "s3cret");
        let attrs = backend
            .lookup(&LookupRequest::SsmParameter {
                name: "/taskstack/dev/db".into(),
            })
            .await
            .unwrap();
        assert_eq!(attrs["value"], json!("s3cret"));
        assert_eq!(attrs["version"], json!(1));

        let missing = backend
            .lookup(&LookupRequest::SsmParameter {
                name: "/missing".into(),
            })
            .await;
        assert!(matches!(missing, Err(BackendError::LookupFailed { .. })));
    }

    #[tokio::test]
    async fn test_update_keeps_identity() {
        let backend = MemoryBackend::default();
        let req = request("db", ResourceKind::DbInstance);
        let created = backend.create(&req).await.unwrap();

        let updated = backend
            .update(&req, &target(&req, created.clone()))
            .await
            .unwrap();
        assert_eq!(created["address"], updated["address"]);
    }
}
