//! Parallel apply and destroy passes.
//!
//! Resources are scheduled off a [`Frontier`]: a resource starts once every
//! resource it depends on has completed, and at most `max_concurrency`
//! backend steps run at once. State is saved after every completion. On the
//! first failure nothing new is started, in-flight steps are allowed to
//! finish, and nothing is rolled back.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backend::{CloudBackend, ResourceRequest, ResourceTarget, RetryPolicy};
use crate::error::{ApplyError, BackendError, Result};
use crate::graph::{Attributes, Frontier, Plan, Resource, resolve_properties};
use crate::state::{ResourceState, StackState, StateStore};

use super::cancel::CancelSignal;
use super::diff::{ChangeAction, DiffEngine, InputsDigest, SecretMask};

/// Default number of backend steps in flight.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Runs apply and destroy passes against a backend.
pub struct ApplyExecutor<'a> {
    backend: Arc<dyn CloudBackend>,
    store: &'a dyn StateStore,
    retry: RetryPolicy,
    max_concurrency: usize,
    cancel: CancelSignal,
    engine: DiffEngine,
}

/// What a finished pass did, in completion order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    /// Each completed resource and what happened to it.
    pub changes: Vec<(String, ChangeAction)>,
}

/// A backend step chosen for one resource.
#[derive(Debug)]
enum Step {
    Create,
    Verify(ResourceTarget),
    Update(ResourceTarget),
    Replace(ResourceTarget),
}

/// What a failed step leaves behind in state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Residue {
    /// The record still describes the resource.
    Intact,
    /// The resource exists but its inputs are unknown.
    Taint,
    /// The resource is gone.
    Forget,
}

struct StepOutput {
    name: String,
    physical_name: String,
    inputs: InputsDigest,
    result: std::result::Result<(ChangeAction, Attributes), (BackendError, Residue)>,
}

impl ApplyReport {
    fn record(&mut self, name: &str, action: ChangeAction) {
        self.changes.push((name.to_string(), action));
    }

    /// Names that completed with `action`.
    #[must_use]
    pub fn names(&self, action: ChangeAction) -> Vec<&str> {
        self.changes
            .iter()
            .filter(|(_, a)| *a == action)
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Every completed name.
    #[must_use]
    pub fn completed(&self) -> Vec<String> {
        self.changes.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Names the pass actually changed.
    #[must_use]
    pub fn touched(&self) -> Vec<String> {
        self.changes
            .iter()
            .filter(|(_, a)| *a != ChangeAction::NoChange)
            .map(|(n, _)| n.clone())
            .collect()
    }
}

impl<'a> ApplyExecutor<'a> {
    /// Creates an executor with default concurrency and no cancellation.
    #[must_use]
    pub fn new(backend: Arc<dyn CloudBackend>, store: &'a dyn StateStore) -> Self {
        Self {
            backend,
            store,
            retry: RetryPolicy::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            cancel: CancelSignal::never(),
            engine: DiffEngine::new(),
        }
    }

    /// Sets the retry policy for transient backend errors.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the concurrency bound (at least one).
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Sets the cancellation signal.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Converges every resource in `plan`, then deletes recorded resources
    /// the plan no longer declares.
    ///
    /// `lookups` must already hold every resolved lookup.
    ///
    /// # Errors
    ///
    /// Returns a plan error (cycle, duplicate, unresolved reference) before
    /// any backend call, `Halted` on the first failed resource or state save
    /// and `Interrupted` if cancelled before everything started.
    pub async fn apply(
        &mut self,
        plan: &Plan,
        state: &mut StackState,
        lookups: &HashMap<String, Attributes>,
    ) -> Result<ApplyReport> {
        plan.apply_order()?;
        let mask = SecretMask::from_lookups(plan, lookups);
        let mut frontier = Frontier::new(&plan.resource_graph());
        let mut known = lookups.clone();
        let mut tasks: JoinSet<StepOutput> = JoinSet::new();
        let mut report = ApplyReport::default();
        let mut failure: Option<(String, String)> = None;
        let mut interrupted = false;

        info!(
            "Applying {} resources (max {} in flight)",
            plan.resources().len(),
            self.max_concurrency
        );

        loop {
            if !interrupted && self.cancel.is_cancelled() {
                interrupted = true;
                warn!("Cancellation requested; waiting for in-flight steps");
            }

            while failure.is_none() && !interrupted && tasks.len() < self.max_concurrency {
                let Some(name) = frontier.pop_ready() else {
                    break;
                };
                let Some(resource) = plan.resources().get(&name) else {
                    frontier.complete(&name);
                    continue;
                };
                match self.prepare(plan, resource, state, &known, &mask) {
                    Ok((request, step, inputs)) => {
                        debug!("Starting {name}: {step:?}");
                        tasks.spawn(run_step(
                            Arc::clone(&self.backend),
                            self.retry,
                            request,
                            step,
                            inputs,
                        ));
                    }
                    Err(err) => {
                        error!("Cannot start {name}: {err}");
                        failure = Some((name, err.to_string()));
                    }
                }
            }

            if tasks.is_empty() {
                break;
            }

            let joined = if failure.is_none() && !interrupted {
                tokio::select! {
                    joined = tasks.join_next() => joined,
                    () = self.cancel.cancelled() => continue,
                }
            } else {
                tasks.join_next().await
            };
            let Some(joined) = joined else {
                break;
            };
            let output = match joined {
                Ok(output) => output,
                Err(err) => {
                    failure.get_or_insert((String::from("<task>"), err.to_string()));
                    continue;
                }
            };

            let name = output.name.clone();
            match output.result {
                Ok((action, attributes)) => {
                    info!("{name}: {action}");
                    let Some(resource) = plan.resources().get(&name) else {
                        continue;
                    };
                    state.set_resource(
                        ResourceState::new(
                            &name,
                            resource.kind,
                            &output.physical_name,
                            &output.inputs.hash,
                            attributes.clone(),
                        )
                        .with_input_hashes(output.inputs.keys)
                        .with_dependencies(resource.dependencies()),
                    );
                    known.insert(name.clone(), attributes);
                    frontier.complete(&name);
                    report.record(&name, action);

                    if let Err(err) = self.store.save(state).await {
                        error!("State save failed after {name}: {err}");
                        failure.get_or_insert((name, format!("state save failed: {err}")));
                    }
                }
                Err((err, residue)) => {
                    error!("{name} failed: {err}");
                    match residue {
                        Residue::Intact => {}
                        Residue::Taint => state.taint(&name),
                        Residue::Forget => {
                            state.remove_resource(&name);
                        }
                    }
                    if residue != Residue::Intact {
                        if let Err(save_err) = self.store.save(state).await {
                            warn!("State save failed after {name} failure: {save_err}");
                        }
                    }
                    failure.get_or_insert((name, err.to_string()));
                }
            }
        }

        if let Some((failed, reason)) = failure {
            return Err(ApplyError::Halted {
                failed,
                reason,
                completed: report.completed(),
                not_started: frontier.not_started(),
            }
            .into());
        }
        if interrupted && !frontier.is_finished() {
            return Err(ApplyError::Interrupted {
                completed: report.completed(),
                not_started: frontier.not_started(),
            }
            .into());
        }

        let orphans: BTreeSet<String> = DiffEngine::orphans(plan, state)
            .into_iter()
            .map(|r| r.name.clone())
            .collect();
        if !orphans.is_empty() {
            info!("Deleting {} resources no longer declared", orphans.len());
            for name in self.delete_set(state, &orphans).await? {
                report.record(&name, ChangeAction::Delete);
            }
        }

        Ok(report)
    }

    /// Deletes every recorded resource, dependents first.
    ///
    /// # Errors
    ///
    /// Returns `DestroyIncomplete` listing what is still recorded, or
    /// `Interrupted` if cancelled.
    pub async fn destroy(&mut self, state: &mut StackState) -> Result<Vec<String>> {
        let all: BTreeSet<String> = state.resources.keys().cloned().collect();
        info!("Destroying {} resources", all.len());
        self.delete_set(state, &all).await
    }

    async fn delete_set(
        &mut self,
        state: &mut StackState,
        names: &BTreeSet<String>,
    ) -> Result<Vec<String>> {
        let mut frontier = Frontier::new(&state.dependency_graph().subgraph(names).reversed());
        let mut tasks: JoinSet<(String, std::result::Result<(), BackendError>)> = JoinSet::new();
        let mut deleted = Vec::new();
        let mut failure: Option<(String, String)> = None;
        let mut interrupted = false;

        loop {
            if !interrupted && self.cancel.is_cancelled() {
                interrupted = true;
                warn!("Cancellation requested; waiting for in-flight deletes");
            }

            while failure.is_none() && !interrupted && tasks.len() < self.max_concurrency {
                let Some(name) = frontier.pop_ready() else {
                    break;
                };
                let Some(target) = state.resource(&name).map(ResourceState::target) else {
                    frontier.complete(&name);
                    continue;
                };
                let backend = Arc::clone(&self.backend);
                let retry = self.retry;
                tasks.spawn(async move {
                    let label = format!("delete {name}");
                    let result = retry.run(&label, || backend.delete(&target)).await;
                    (name, result)
                });
            }

            if tasks.is_empty() {
                break;
            }

            let joined = if failure.is_none() && !interrupted {
                tokio::select! {
                    joined = tasks.join_next() => joined,
                    () = self.cancel.cancelled() => continue,
                }
            } else {
                tasks.join_next().await
            };
            let Some(joined) = joined else {
                break;
            };
            match joined {
                Ok((name, Ok(()))) => {
                    info!("{name}: deleted");
                    state.remove_resource(&name);
                    frontier.complete(&name);
                    if let Err(err) = self.store.save(state).await {
                        error!("State save failed after deleting {name}: {err}");
                        failure.get_or_insert((name.clone(), format!("state save failed: {err}")));
                    }
                    deleted.push(name);
                }
                Ok((name, Err(err))) => {
                    error!("Deleting {name} failed: {err}");
                    failure.get_or_insert((name, err.to_string()));
                }
                Err(err) => {
                    failure.get_or_insert((String::from("<task>"), err.to_string()));
                }
            }
        }

        if let Some((failed, reason)) = failure {
            let remaining = names
                .iter()
                .filter(|n| state.resource(n).is_some())
                .cloned()
                .collect();
            return Err(ApplyError::DestroyIncomplete {
                failed,
                reason,
                remaining,
            }
            .into());
        }
        if interrupted && !frontier.is_finished() {
            return Err(ApplyError::Interrupted {
                completed: deleted,
                not_started: frontier.not_started(),
            }
            .into());
        }
        Ok(deleted)
    }

    /// Resolves inputs and picks the step for one resource.
    fn prepare(
        &self,
        plan: &Plan,
        resource: &Resource,
        state: &StackState,
        known: &HashMap<String, Attributes>,
        mask: &SecretMask,
    ) -> std::result::Result<(ResourceRequest, Step, InputsDigest), ApplyError> {
        let properties = resolve_properties(&resource.properties, known).map_err(|reference| {
            ApplyError::MissingAttribute {
                resource: reference.target,
                attribute: reference.attribute,
            }
        })?;
        let inputs = self.engine.digest(&properties, mask);
        let provider = plan.provider();
        let physical_name = provider.physical_name(&resource.name, resource.kind);
        let recorded = state.resource(&resource.name);

        let step = match (
            DiffEngine::decide(resource.kind, recorded, &inputs),
            recorded,
        ) {
            (ChangeAction::NoChange, Some(r)) => Step::Verify(r.target()),
            (ChangeAction::Update, Some(r)) => Step::Update(r.target()),
            (ChangeAction::Replace, Some(r)) => Step::Replace(r.target()),
            _ => Step::Create,
        };

        let request = ResourceRequest {
            logical_name: resource.name.clone(),
            tags: provider.tags_for(&resource.name, &physical_name),
            idempotency_token: idempotency_token(
                &physical_name,
                &inputs.hash,
                recorded.map(|r| r.id.as_str()),
            ),
            physical_name,
            kind: resource.kind,
            properties,
        };
        Ok((request, step, inputs))
    }
}

/// Client token for one create attempt: stable across retries of the same
/// attempt, different once the prior resource has been replaced.
fn idempotency_token(physical_name: &str, inputs_hash: &str, prior_id: Option<&str>) -> String {
    let digest = Sha256::digest(format!(
        "{physical_name}|{inputs_hash}|{}",
        prior_id.unwrap_or_default()
    ));
    hex::encode(digest).chars().take(32).collect()
}

async fn run_step(
    backend: Arc<dyn CloudBackend>,
    retry: RetryPolicy,
    request: ResourceRequest,
    step: Step,
    inputs: InputsDigest,
) -> StepOutput {
    let name = request.logical_name.clone();
    let create = || backend.create(&request);
    let create_label = format!("create {name}");

    let result = match step {
        Step::Create => retry
            .run(&create_label, create)
            .await
            .map(|attrs| (ChangeAction::Create, attrs))
            .map_err(|e| (e, Residue::Intact)),
        Step::Verify(target) => {
            match retry.run(&format!("read {name}"), || backend.read(&target)).await {
                Ok(Some(attrs)) => Ok((ChangeAction::NoChange, attrs)),
                Ok(None) => {
                    warn!("{name} was deleted outside taskstack; creating it again");
                    retry
                        .run(&create_label, create)
                        .await
                        .map(|attrs| (ChangeAction::Create, attrs))
                        .map_err(|e| (e, Residue::Forget))
                }
                Err(e) => Err((e, Residue::Intact)),
            }
        }
        Step::Update(target) => retry
            .run(&format!("update {name}"), || backend.update(&request, &target))
            .await
            .map(|attrs| (ChangeAction::Update, attrs))
            .map_err(|e| (e, Residue::Taint)),
        Step::Replace(target) => {
            match retry.run(&format!("delete {name}"), || backend.delete(&target)).await {
                Err(e) => Err((e, Residue::Intact)),
                Ok(()) => retry
                    .run(&create_label, create)
                    .await
                    .map(|attrs| (ChangeAction::Replace, attrs))
                    .map_err(|e| (e, Residue::Forget)),
            }
        }
    };

    StepOutput {
        name,
        physical_name: request.physical_name.clone(),
        inputs,
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FailureMode, MemoryBackend, Operation};
    use crate::error::PlanError;
    use crate::graph::{ProviderConfig, Reference, ResourceKind};
    use crate::planner::cancel_pair;
    use crate::state::{MemoryStateStore, ResourceStatus};
    use std::time::Duration;

    /// `api-sg <- db-sg <- db`, plus an unrelated `site`.
    fn plan(ami: &str) -> Plan {
        let mut plan = Plan::new(ProviderConfig::new("tasks", "dev", "us-east-1"));
        plan.declare(Resource::new("site", ResourceKind::Bucket).with("force_destroy", true))
            .unwrap();
        let api_sg = plan
            .declare(Resource::new("api-sg", ResourceKind::SecurityGroup).with("vpc_id", "vpc-1"))
            .unwrap();
        let db_sg = plan
            .declare(
                Resource::new("db-sg", ResourceKind::SecurityGroup)
                    .with("vpc_id", "vpc-1")
                    .with("source", api_sg.id()),
            )
            .unwrap();
        plan.declare(
            Resource::new("api", ResourceKind::Instance)
                .with("ami", ami)
                .with("security_group_ids", vec![api_sg.id()]),
        )
        .unwrap();
        plan.declare(Resource::new("db", ResourceKind::DbInstance).with("sg", db_sg.id()))
            .unwrap();
        plan
    }

    fn executor<'a>(backend: &Arc<MemoryBackend>, store: &'a MemoryStateStore) -> ApplyExecutor<'a> {
        ApplyExecutor::new(Arc::clone(backend) as Arc<dyn CloudBackend>, store)
            .with_retry(RetryPolicy::new(2, Duration::ZERO))
    }

    fn halted(err: crate::error::StackError) -> (String, Vec<String>, Vec<String>) {
        match err {
            crate::error::StackError::Apply(ApplyError::Halted {
                failed,
                completed,
                not_started,
                ..
            }) => (failed, completed, not_started),
            other => panic!("expected Halted, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_cycle_is_rejected_before_any_call() {
        let backend = Arc::new(MemoryBackend::default());
        let store = MemoryStateStore::new();
        let mut state = StackState::new("tasks", "dev");
        let mut plan = Plan::new(ProviderConfig::new("tasks", "dev", "us-east-1"));
        plan.declare(
            Resource::new("a", ResourceKind::SecurityGroup).with("peer", Reference::new("b", "id")),
        )
        .unwrap();
        plan.declare(
            Resource::new("b", ResourceKind::SecurityGroup).with("peer", Reference::new("a", "id")),
        )
        .unwrap();
        plan.declare(Resource::new("c", ResourceKind::Bucket)).unwrap();

        let err = executor(&backend, &store)
            .apply(&plan, &mut state, &HashMap::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            crate::error::StackError::Plan(PlanError::CyclicDependency { .. })
        ));
        assert!(backend.calls().is_empty());
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_unresolved_reference_is_rejected_before_any_call() {
        let backend = Arc::new(MemoryBackend::default());
        let store = MemoryStateStore::new();
        let mut state = StackState::new("tasks", "dev");
        let mut plan = Plan::new(ProviderConfig::new("tasks", "dev", "us-east-1"));
        plan.declare(Resource::new("a", ResourceKind::Bucket)).unwrap();
        plan.declare(
            Resource::new("z", ResourceKind::BucketPolicy).with("bucket", Reference::new("ghost", "id")),
        )
        .unwrap();

        let err = executor(&backend, &store)
            .with_max_concurrency(1)
            .apply(&plan, &mut state, &HashMap::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            crate::error::StackError::Plan(PlanError::UnresolvedReference { ref target, .. }) if target == "ghost"
        ));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_fresh_apply_creates_in_dependency_order() {
        let backend = Arc::new(MemoryBackend::default());
        let store = MemoryStateStore::new();
        let mut state = StackState::new("tasks", "dev");

        let report = executor(&backend, &store)
            .with_max_concurrency(1)
            .apply(&plan("ami-1"), &mut state, &HashMap::new())
            .await
            .unwrap();

        assert_eq!(
            backend.calls_of(Operation::Create),
            vec!["api-sg", "api", "db-sg", "db", "site"]
        );
        assert_eq!(report.names(ChangeAction::Create).len(), 5);
        assert_eq!(store.save_count(), 5);

        let db_sg = state.resource("db-sg").unwrap();
        assert!(db_sg.dependencies.contains("api-sg"));
        assert!(db_sg.id.starts_with("sg-"));
    }

    #[tokio::test]
    async fn test_second_apply_only_verifies() {
        let backend = Arc::new(MemoryBackend::default());
        let store = MemoryStateStore::new();
        let mut state = StackState::new("tasks", "dev");
        let plan = plan("ami-1");

        executor(&backend, &store)
            .apply(&plan, &mut state, &HashMap::new())
            .await
            .unwrap();
        backend.clear_calls();

        let report = executor(&backend, &store)
            .apply(&plan, &mut state, &HashMap::new())
            .await
            .unwrap();

        assert!(report.touched().is_empty());
        assert!(backend.calls_of(Operation::Create).is_empty());
        assert!(backend.calls_of(Operation::Update).is_empty());
        assert_eq!(backend.calls_of(Operation::Read).len(), 5);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let backend = Arc::new(MemoryBackend::default().with_latency(Duration::from_millis(20)));
        let store = MemoryStateStore::new();
        let mut state = StackState::new("tasks", "dev");
        let mut plan = Plan::new(ProviderConfig::new("tasks", "dev", "us-east-1"));
        for i in 0..6 {
            plan.declare(Resource::new(format!("sg-{i}"), ResourceKind::SecurityGroup))
                .unwrap();
        }

        executor(&backend, &store)
            .with_max_concurrency(2)
            .apply(&plan, &mut state, &HashMap::new())
            .await
            .unwrap();

        assert_eq!(backend.max_in_flight(), 2);
        assert_eq!(state.resources.len(), 6);
    }

    #[tokio::test]
    async fn test_failure_halts_dependents_without_rollback() {
        let backend = Arc::new(MemoryBackend::default());
        backend.fail(Operation::Create, "db-sg", FailureMode::Fatal);
        let store = MemoryStateStore::new();
        let mut state = StackState::new("tasks", "dev");

        let err = executor(&backend, &store)
            .with_max_concurrency(1)
            .apply(&plan("ami-1"), &mut state, &HashMap::new())
            .await
            .unwrap_err();

        let (failed, completed, not_started) = halted(err);
        assert_eq!(failed, "db-sg");
        assert_eq!(completed, vec!["api-sg", "api"]);
        assert_eq!(not_started, vec!["db", "site"]);

        assert!(backend.calls_of(Operation::Delete).is_empty());
        assert_eq!(state.resource_names(), vec!["api", "api-sg"]);
        assert_eq!(store.snapshot().unwrap().resources.len(), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let backend = Arc::new(MemoryBackend::default());
        backend.fail(Operation::Create, "api", FailureMode::Transient(2));
        let store = MemoryStateStore::new();
        let mut state = StackState::new("tasks", "dev");

        executor(&backend, &store)
            .apply(&plan("ami-1"), &mut state, &HashMap::new())
            .await
            .unwrap();

        assert_eq!(
            backend
                .calls_of(Operation::Create)
                .iter()
                .filter(|t| *t == "api")
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn test_changed_inputs_replace_instances_only() {
        let backend = Arc::new(MemoryBackend::default());
        let store = MemoryStateStore::new();
        let mut state = StackState::new("tasks", "dev");

        executor(&backend, &store)
            .apply(&plan("ami-1"), &mut state, &HashMap::new())
            .await
            .unwrap();
        let old_id = state.resource("api").unwrap().id.clone();
        backend.clear_calls();

        let report = executor(&backend, &store)
            .apply(&plan("ami-2"), &mut state, &HashMap::new())
            .await
            .unwrap();

        assert_eq!(report.touched(), vec!["api"]);
        assert_eq!(report.names(ChangeAction::Replace), vec!["api"]);
        assert_eq!(backend.calls_of(Operation::Delete), vec!["api"]);
        assert_ne!(state.resource("api").unwrap().id, old_id);
    }

    #[tokio::test]
    async fn test_immutable_input_change_replaces_in_place_kind() {
        let backend = Arc::new(MemoryBackend::default());
        let store = MemoryStateStore::new();
        let mut state = StackState::new("tasks", "dev");
        let group = |vpc: &str, port: i64| {
            let mut plan = Plan::new(ProviderConfig::new("tasks", "dev", "us-east-1"));
            plan.declare(
                Resource::new("api-sg", ResourceKind::SecurityGroup)
                    .with("vpc_id", vpc)
                    .with("description", "Allow HTTP to API")
                    .with("port", port),
            )
            .unwrap();
            plan
        };

        executor(&backend, &store)
            .apply(&group("vpc-1", 80), &mut state, &HashMap::new())
            .await
            .unwrap();
        backend.clear_calls();

        let report = executor(&backend, &store)
            .apply(&group("vpc-1", 8080), &mut state, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(report.names(ChangeAction::Update), vec!["api-sg"]);
        assert!(backend.calls_of(Operation::Delete).is_empty());

        let old_id = state.resource("api-sg").unwrap().id.clone();
        backend.clear_calls();
        let report = executor(&backend, &store)
            .apply(&group("vpc-2", 8080), &mut state, &HashMap::new())
            .await
            .unwrap();

        assert_eq!(report.names(ChangeAction::Replace), vec!["api-sg"]);
        assert!(backend.calls_of(Operation::Update).is_empty());
        assert_eq!(backend.calls_of(Operation::Delete), vec!["api-sg"]);
        let record = state.resource("api-sg").unwrap();
        assert_ne!(record.id, old_id);
        assert_eq!(record.attributes["vpc_id"], serde_json::json!("vpc-2"));
    }

    #[tokio::test]
    async fn test_failed_update_taints_record() {
        let backend = Arc::new(MemoryBackend::default());
        let store = MemoryStateStore::new();
        let mut state = StackState::new("tasks", "dev");
        executor(&backend, &store)
            .apply(&plan("ami-1"), &mut state, &HashMap::new())
            .await
            .unwrap();

        let mut changed = Plan::new(ProviderConfig::new("tasks", "dev", "us-east-1"));
        changed
            .declare(Resource::new("site", ResourceKind::Bucket).with("force_destroy", false))
            .unwrap();
        backend.fail(Operation::Update, "site", FailureMode::Fatal);

        let err = executor(&backend, &store)
            .apply(&changed, &mut state, &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(halted(err).0, "site");
        assert_eq!(state.resource("site").unwrap().status, ResourceStatus::Tainted);
        // Orphans are left alone when convergence fails.
        assert!(state.resource("db").is_some());
    }

    #[tokio::test]
    async fn test_out_of_band_deletion_is_recreated() {
        let backend = Arc::new(MemoryBackend::default());
        let store = MemoryStateStore::new();
        let mut state = StackState::new("tasks", "dev");
        let plan = plan("ami-1");
        executor(&backend, &store)
            .apply(&plan, &mut state, &HashMap::new())
            .await
            .unwrap();

        assert!(backend.remove_out_of_band("db"));
        let report = executor(&backend, &store)
            .apply(&plan, &mut state, &HashMap::new())
            .await
            .unwrap();

        assert_eq!(report.touched(), vec!["db"]);
        assert!(backend.existing().contains(&String::from("db")));
    }

    #[tokio::test]
    async fn test_orphans_are_deleted_after_convergence() {
        let backend = Arc::new(MemoryBackend::default());
        let store = MemoryStateStore::new();
        let mut state = StackState::new("tasks", "dev");
        executor(&backend, &store)
            .apply(&plan("ami-1"), &mut state, &HashMap::new())
            .await
            .unwrap();
        backend.clear_calls();

        let mut smaller = Plan::new(ProviderConfig::new("tasks", "dev", "us-east-1"));
        smaller
            .declare(Resource::new("site", ResourceKind::Bucket).with("force_destroy", true))
            .unwrap();
        let report = executor(&backend, &store)
            .with_max_concurrency(1)
            .apply(&smaller, &mut state, &HashMap::new())
            .await
            .unwrap();

        let deleted = backend.calls_of(Operation::Delete);
        let pos = |n: &str| deleted.iter().position(|d| d == n).unwrap();
        assert!(pos("db") < pos("db-sg"));
        assert!(pos("db-sg") < pos("api-sg"));
        assert!(pos("api") < pos("api-sg"));
        assert_eq!(report.names(ChangeAction::Delete).len(), 4);
        assert_eq!(state.resource_names(), vec!["site"]);
    }

    #[tokio::test]
    async fn test_missing_attribute_halts() {
        let backend = Arc::new(MemoryBackend::default());
        let store = MemoryStateStore::new();
        let mut state = StackState::new("tasks", "dev");
        let mut plan = Plan::new(ProviderConfig::new("tasks", "dev", "us-east-1"));
        plan.declare(Resource::new("sg", ResourceKind::SecurityGroup))
            .unwrap();
        plan.declare(
            Resource::new("api", ResourceKind::Instance)
                .with("sg", Reference::new("sg", "arn")),
        )
        .unwrap();

        let err = executor(&backend, &store)
            .apply(&plan, &mut state, &HashMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("arn"));
        assert!(!backend.existing().contains(&String::from("api")));
    }

    #[tokio::test]
    async fn test_state_save_failure_halts() {
        let backend = Arc::new(MemoryBackend::default());
        let store = MemoryStateStore::new();
        store.fail_saves_after(1);
        let mut state = StackState::new("tasks", "dev");

        let err = executor(&backend, &store)
            .with_max_concurrency(1)
            .apply(&plan("ami-1"), &mut state, &HashMap::new())
            .await
            .unwrap_err();

        let (failed, _, not_started) = halted(err);
        assert_eq!(failed, "api");
        assert!(not_started.contains(&String::from("db")));
    }

    #[tokio::test]
    async fn test_cancel_before_start_touches_nothing() {
        let backend = Arc::new(MemoryBackend::default());
        let store = MemoryStateStore::new();
        let mut state = StackState::new("tasks", "dev");
        let (handle, signal) = cancel_pair();
        handle.cancel();

        let err = executor(&backend, &store)
            .with_cancel(signal)
            .apply(&plan("ami-1"), &mut state, &HashMap::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            crate::error::StackError::Apply(ApplyError::Interrupted { ref not_started, .. })
                if not_started.len() == 5
        ));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_apply_lets_in_flight_finish() {
        let backend = Arc::new(MemoryBackend::default().with_latency(Duration::from_millis(50)));
        let store = MemoryStateStore::new();
        let mut state = StackState::new("tasks", "dev");
        let (handle, signal) = cancel_pair();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.cancel();
        });
        let err = executor(&backend, &store)
            .with_max_concurrency(1)
            .with_cancel(signal)
            .apply(&plan("ami-1"), &mut state, &HashMap::new())
            .await
            .unwrap_err();
        canceller.await.unwrap();

        match err {
            crate::error::StackError::Apply(ApplyError::Interrupted {
                completed,
                not_started,
            }) => {
                assert_eq!(completed, vec!["api-sg"]);
                assert_eq!(not_started.len(), 4);
            }
            other => panic!("expected Interrupted, got {other}"),
        }
        assert_eq!(state.resource_names(), vec!["api-sg"]);
    }

    #[tokio::test]
    async fn test_destroy_runs_in_reverse_order() {
        let backend = Arc::new(MemoryBackend::default());
        let store = MemoryStateStore::new();
        let mut state = StackState::new("tasks", "dev");
        executor(&backend, &store)
            .apply(&plan("ami-1"), &mut state, &HashMap::new())
            .await
            .unwrap();
        backend.clear_calls();

        let deleted = executor(&backend, &store)
            .with_max_concurrency(1)
            .destroy(&mut state)
            .await
            .unwrap();

        assert_eq!(deleted.len(), 5);
        assert!(state.is_empty());
        assert!(backend.existing().is_empty());
        let pos = |n: &str| deleted.iter().position(|d| d == n).unwrap();
        assert!(pos("db") < pos("db-sg"));
        assert!(pos("db-sg") < pos("api-sg"));
    }

    #[tokio::test]
    async fn test_destroy_failure_reports_remaining() {
        let backend = Arc::new(MemoryBackend::default());
        let store = MemoryStateStore::new();
        let mut state = StackState::new("tasks", "dev");
        executor(&backend, &store)
            .apply(&plan("ami-1"), &mut state, &HashMap::new())
            .await
            .unwrap();
        backend.fail(Operation::Delete, "db", FailureMode::Fatal);

        let err = executor(&backend, &store)
            .with_max_concurrency(1)
            .destroy(&mut state)
            .await
            .unwrap_err();

        match err {
            crate::error::StackError::Apply(ApplyError::DestroyIncomplete {
                failed,
                remaining,
                ..
            }) => {
                assert_eq!(failed, "db");
                assert!(remaining.contains(&String::from("db")));
                assert!(remaining.contains(&String::from("db-sg")));
                assert!(remaining.contains(&String::from("api-sg")));
            }
            other => panic!("expected DestroyIncomplete, got {other}"),
        }
    }

    #[test]
    fn test_idempotency_token_changes_with_prior_id() {
        let first = idempotency_token("tasks-dev-api", "h", None);
        assert_eq!(first.len(), 32);
        assert_eq!(first, idempotency_token("tasks-dev-api", "h", None));
        assert_ne!(first, idempotency_token("tasks-dev-api", "h", Some("i-1")));
    }
}
