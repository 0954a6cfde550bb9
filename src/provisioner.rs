//! End-to-end provisioning runs.
//!
//! A [`Provisioner`] drives one command against one stack: it declares the
//! plan from configuration, takes the state lock, resolves lookups, hands
//! the plan to the [`ApplyExecutor`] and records outputs and history.

use serde::Serialize;
use serde_json::{Value as Json, json};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::backend::{CloudBackend, LookupRequest, RetryPolicy};
use crate::blueprint;
use crate::config::{ConfigValidator, SecretSource, StackConfig, ValidationResult};
use crate::error::{ApplyError, Result};
use crate::graph::{Attributes, LookupQuery, Plan};
use crate::planner::{ApplyExecutor, ApplyReport, CancelSignal, ChangeSet, DiffEngine};
use crate::state::{
    HistoryEntry, OutputState, StackOperation, StackState, StateStore, generate_holder_id,
};

/// Reads an environment variable.
pub type EnvReader = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Drives plan, apply, destroy and drift checks for one stack.
pub struct Provisioner<'a> {
    config: &'a StackConfig,
    backend: Arc<dyn CloudBackend>,
    store: &'a dyn StateStore,
    cancel: CancelSignal,
    env: EnvReader,
    holder: String,
    diff_engine: DiffEngine,
}

/// Result of a successful apply.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    /// What each resource went through.
    pub report: ApplyReport,
    /// Every output, including sensitive ones.
    pub outputs: Vec<OutputValue>,
}

/// One evaluated output.
#[derive(Debug, Clone, Serialize)]
pub struct OutputValue {
    /// Output name.
    pub name: String,
    /// Evaluated value.
    pub value: Json,
    /// Whether the value is kept out of state and displays.
    pub sensitive: bool,
}

/// Why a resource is reported as drifted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    /// Declared but never created.
    NotCreated,
    /// Recorded but gone from the cloud.
    Missing,
    /// Cloud attributes differ from the recorded ones.
    Changed,
    /// A previous update did not finish.
    Tainted,
    /// Recorded but no longer declared.
    Undeclared,
}

/// One drifted resource.
#[derive(Debug, Clone, Serialize)]
pub struct DriftEntry {
    /// Logical name.
    pub name: String,
    /// Kind of drift.
    pub kind: DriftKind,
    /// Attributes that changed, for [`DriftKind::Changed`].
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<String>,
}

/// Report of drift detection.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// Drifted resources, sorted by name.
    pub entries: Vec<DriftEntry>,
    /// Number of declared resources.
    pub declared: usize,
    /// Number of recorded resources the backend still has.
    pub observed: usize,
}

impl DriftReport {
    /// Returns true if the state is converged (no drift).
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names drifted in a given way.
    #[must_use]
    pub fn names(&self, kind: DriftKind) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.name.as_str())
            .collect()
    }
}

impl<'a> Provisioner<'a> {
    /// Creates a provisioner reading secrets from the process environment.
    #[must_use]
    pub fn new(
        config: &'a StackConfig,
        backend: Arc<dyn CloudBackend>,
        store: &'a dyn StateStore,
    ) -> Self {
        Self {
            config,
            backend,
            store,
            cancel: CancelSignal::never(),
            env: Arc::new(|name| std::env::var(name).ok()),
            holder: generate_holder_id(),
            diff_engine: DiffEngine::new(),
        }
    }

    /// Sets the cancellation signal for apply and destroy.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Replaces the environment reader used for `env` secrets.
    #[must_use]
    pub fn with_env_reader(
        mut self,
        read: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.env = Arc::new(read);
        self
    }

    /// Validates the configuration and the declared plan without touching
    /// the backend.
    ///
    /// # Errors
    ///
    /// Returns the first configuration error or a structural plan error.
    pub fn validate(&self) -> Result<(ValidationResult, Plan)> {
        let result = ConfigValidator::new().validate(self.config)?;
        let plan = self.plan()?;
        Ok((result, plan))
    }

    /// Declares the stack.
    ///
    /// # Errors
    ///
    /// Returns an error if the plan cannot be declared.
    pub fn plan(&self) -> Result<Plan> {
        blueprint::three_tier(self.config)
    }

    /// Computes what an apply would do. Lookups and reads are performed,
    /// nothing is changed.
    ///
    /// # Errors
    ///
    /// Returns an error if a lookup, read or state load fails.
    pub async fn preview(&self) -> Result<ChangeSet> {
        let plan = self.plan()?;
        let state = self.store.load().await?;
        let lookups = self.resolve_lookups(&plan).await?;
        let missing = self.missing_resources(&plan, state.as_ref()).await?;
        let changes = self
            .diff_engine
            .compute(&plan, state.as_ref(), &lookups, &missing)?;
        info!("{changes}");
        Ok(changes)
    }

    /// Converges the cloud to the declared stack.
    ///
    /// # Errors
    ///
    /// Returns structural errors before any backend call, `LookupFailed`
    /// before any resource is touched, and `Halted`/`Interrupted` from the
    /// executor. State is saved in every case.
    pub async fn apply(&self) -> Result<ApplyOutcome> {
        let plan = self.plan()?;
        plan.apply_order()?;

        let lock = self.store.acquire_lock(&self.holder, "apply").await?;
        debug!("Acquired state lock {}", lock.lock_id);
        let result = self.apply_locked(&plan).await;
        self.release(&lock.lock_id).await;
        result
    }

    async fn apply_locked(&self, plan: &Plan) -> Result<ApplyOutcome> {
        let mut state = self.load_or_new().await?;
        let plan_hash = plan.fingerprint();

        info!(
            "Applying {}/{} ({} resources, {} lookups)",
            self.config.project.name,
            self.config.project.environment,
            plan.resources().len(),
            plan.lookups().len()
        );

        let lookups = self.resolve_lookups(plan).await?;

        let mut executor = self.executor();
        let report = match executor.apply(plan, &mut state, &lookups).await {
            Ok(report) => report,
            Err(err) => {
                let touched = completed_of(&err);
                state.add_history(HistoryEntry::failed(
                    StackOperation::Apply,
                    &plan_hash,
                    touched,
                    &err.to_string(),
                ));
                if let Err(save_err) = self.store.save(&state).await {
                    warn!("Failed to record apply failure: {save_err}");
                }
                return Err(err);
            }
        };

        let mut known = state.attribute_map();
        known.extend(lookups);
        let evaluated = plan.evaluate_outputs(&known).map_err(|(output, reference)| {
            error!("Output {output} could not be evaluated");
            ApplyError::MissingAttribute {
                resource: reference.target,
                attribute: reference.attribute,
            }
        })?;

        let outputs: Vec<OutputValue> = evaluated
            .into_iter()
            .map(|(output, value)| OutputValue {
                name: output.name.clone(),
                value,
                sensitive: output.sensitive,
            })
            .collect();

        state.outputs = outputs
            .iter()
            .filter(|o| !o.sensitive)
            .map(|o| {
                (
                    o.name.clone(),
                    OutputState {
                        value: o.value.clone(),
                    },
                )
            })
            .collect();
        state.plan_hash.clone_from(&plan_hash);
        state.add_history(HistoryEntry::new(
            StackOperation::Apply,
            &plan_hash,
            report.touched(),
        ));
        self.store.save(&state).await?;

        info!(
            "Apply complete: {} changed, {} unchanged",
            report.touched().len(),
            report.changes.len() - report.touched().len()
        );
        Ok(ApplyOutcome { report, outputs })
    }

    /// Deletes every recorded resource in reverse dependency order.
    ///
    /// # Errors
    ///
    /// Returns `DestroyIncomplete` with the resources still present.
    pub async fn destroy(&self) -> Result<Vec<String>> {
        let lock = self.store.acquire_lock(&self.holder, "destroy").await?;
        let result = self.destroy_locked().await;
        self.release(&lock.lock_id).await;
        result
    }

    async fn destroy_locked(&self) -> Result<Vec<String>> {
        let Some(mut state) = self.store.load().await? else {
            info!("No state recorded; nothing to destroy");
            return Ok(Vec::new());
        };
        if state.is_empty() {
            info!("State is empty; nothing to destroy");
            return Ok(Vec::new());
        }

        let plan_hash = state.plan_hash.clone();
        let mut executor = self.executor();
        match executor.destroy(&mut state).await {
            Ok(deleted) => {
                state.outputs.clear();
                state.plan_hash.clear();
                state.add_history(HistoryEntry::new(
                    StackOperation::Destroy,
                    &plan_hash,
                    deleted.clone(),
                ));
                self.store.save(&state).await?;
                info!("Destroyed {} resources", deleted.len());
                Ok(deleted)
            }
            Err(err) => {
                let remaining = state.resource_names().into_iter().map(String::from).collect();
                state.add_history(HistoryEntry::failed(
                    StackOperation::Destroy,
                    &plan_hash,
                    remaining,
                    &err.to_string(),
                ));
                if let Err(save_err) = self.store.save(&state).await {
                    warn!("Failed to record destroy failure: {save_err}");
                }
                Err(err)
            }
        }
    }

    /// Non-sensitive outputs recorded by the last successful apply.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded.
    pub async fn outputs(&self) -> Result<BTreeMap<String, Json>> {
        Ok(self
            .store
            .load()
            .await?
            .map(|state| {
                state
                    .outputs
                    .into_iter()
                    .map(|(name, output)| (name, output.value))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Compares declarations, recorded state and the cloud.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded or a read fails.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        let plan = self.plan()?;
        let state = self.load_or_new().await?;
        let retry = RetryPolicy::from_config(&self.config.apply);
        let mut entries = Vec::new();
        let mut observed = 0;

        for name in plan.resources().keys() {
            if state.resource(name).is_none() {
                entries.push(DriftEntry::new(name, DriftKind::NotCreated));
            }
        }

        for (name, recorded) in &state.resources {
            if !plan.resources().contains_key(name) {
                entries.push(DriftEntry::new(name, DriftKind::Undeclared));
            }
            let target = recorded.target();
            let label = format!("read {name}");
            match retry.run(&label, || self.backend.read(&target)).await? {
                None => entries.push(DriftEntry::new(name, DriftKind::Missing)),
                Some(current) => {
                    observed += 1;
                    let changed = changed_attributes(&recorded.attributes, &current);
                    if !changed.is_empty() {
                        entries.push(DriftEntry {
                            name: name.clone(),
                            kind: DriftKind::Changed,
                            attributes: changed,
                        });
                    } else if !recorded.is_ready() {
                        entries.push(DriftEntry::new(name, DriftKind::Tainted));
                    }
                }
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        if entries.is_empty() {
            info!("No drift detected");
        } else {
            warn!("{} resources drifted", entries.len());
        }
        Ok(DriftReport {
            entries,
            declared: plan.resources().len(),
            observed,
        })
    }

    /// Resolves every lookup in dependency order.
    ///
    /// # Errors
    ///
    /// Returns `LookupFailed` naming the first lookup that failed.
    pub async fn resolve_lookups(&self, plan: &Plan) -> Result<HashMap<String, Attributes>> {
        let retry = RetryPolicy::from_config(&self.config.apply);
        let mut resolved: HashMap<String, Attributes> = HashMap::new();

        for name in plan.lookup_order()? {
            let Some(query) = plan.lookups().get(&name) else {
                continue;
            };
            let attributes = self
                .resolve_lookup(plan, query, &resolved, retry)
                .await
                .map_err(|reason| {
                    error!("Lookup {name} failed: {reason}");
                    ApplyError::LookupFailed {
                        lookup: name.clone(),
                        reason,
                    }
                })?;
            if query.is_sensitive() {
                debug!("Resolved {name} ({})", query.label());
            } else {
                debug!("Resolved {name}: {attributes:?}");
            }
            resolved.insert(name, attributes);
        }
        Ok(resolved)
    }

    async fn resolve_lookup(
        &self,
        plan: &Plan,
        query: &LookupQuery,
        resolved: &HashMap<String, Attributes>,
        retry: RetryPolicy,
    ) -> std::result::Result<Attributes, String> {
        let request = match query {
            LookupQuery::Region => {
                let region = &plan.provider().region;
                return Ok(Attributes::from([
                    (String::from("id"), json!(region)),
                    (String::from("name"), json!(region)),
                ]));
            }
            LookupQuery::Secret {
                source: SecretSource::Env(var),
            } => {
                let value = (self.env)(var)
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| format!("environment variable {var} is not set"))?;
                return Ok(Attributes::from([
                    (String::from("id"), json!(format!("env:{var}"))),
                    (String::from("value"), json!(value)),
                    (String::from("version"), Json::Null),
                ]));
            }
            LookupQuery::Secret {
                source: SecretSource::SsmParameter(name),
            } => LookupRequest::SsmParameter { name: name.clone() },
            LookupQuery::DefaultVpc => LookupRequest::DefaultVpc,
            LookupQuery::Subnets { vpc } => {
                let vpc_id = vpc
                    .read(resolved)
                    .and_then(Json::as_str)
                    .ok_or_else(|| format!("{vpc} is not resolved"))?;
                LookupRequest::Subnets {
                    vpc_id: vpc_id.to_string(),
                }
            }
            LookupQuery::LatestAmi {
                owners,
                name_pattern,
            } => LookupRequest::LatestAmi {
                owners: owners.clone(),
                name_pattern: name_pattern.clone(),
            },
        };

        let label = format!("lookup {request}");
        retry
            .run(&label, || self.backend.lookup(&request))
            .await
            .map_err(|e| e.to_string())
    }

    /// Recorded, still-declared resources the backend no longer has.
    async fn missing_resources(
        &self,
        plan: &Plan,
        state: Option<&StackState>,
    ) -> Result<BTreeSet<String>> {
        let mut missing = BTreeSet::new();
        let Some(state) = state else {
            return Ok(missing);
        };
        let retry = RetryPolicy::from_config(&self.config.apply);
        for (name, recorded) in &state.resources {
            if !plan.resources().contains_key(name) {
                continue;
            }
            let target = recorded.target();
            let label = format!("read {name}");
            if retry.run(&label, || self.backend.read(&target)).await?.is_none() {
                debug!("{name} is recorded but missing from the cloud");
                missing.insert(name.clone());
            }
        }
        Ok(missing)
    }

    fn executor(&self) -> ApplyExecutor<'_> {
        ApplyExecutor::new(Arc::clone(&self.backend), self.store)
            .with_retry(RetryPolicy::from_config(&self.config.apply))
            .with_max_concurrency(self.config.apply.max_concurrency)
            .with_cancel(self.cancel.clone())
    }

    async fn load_or_new(&self) -> Result<StackState> {
        Ok(self.store.load().await?.unwrap_or_else(|| {
            StackState::new(&self.config.project.name, &self.config.project.environment)
        }))
    }

    async fn release(&self, lock_id: &str) {
        if let Err(e) = self.store.release_lock(lock_id).await {
            warn!("Failed to release state lock {lock_id}: {e}");
        }
    }
}

impl DriftEntry {
    fn new(name: &str, kind: DriftKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            attributes: Vec::new(),
        }
    }
}

/// Recorded attributes whose current value differs.
fn changed_attributes(recorded: &Attributes, current: &Attributes) -> Vec<String> {
    recorded
        .iter()
        .filter(|(key, value)| current.get(*key).is_some_and(|now| now != *value))
        .map(|(key, _)| key.clone())
        .collect()
}

fn completed_of(err: &crate::error::StackError) -> Vec<String> {
    match err {
        crate::error::StackError::Apply(
            ApplyError::Halted { completed, .. } | ApplyError::Interrupted { completed, .. },
        ) => completed.clone(),
        _ => Vec::new(),
    }
}

impl std::fmt::Display for DriftKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::NotCreated => "not created",
            Self::Missing => "missing",
            Self::Changed => "changed",
            Self::Tainted => "tainted",
            Self::Undeclared => "no longer declared",
        };
        write!(f, "{label}")
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.entries.is_empty() {
            return write!(f, "No drift detected - state is converged");
        }
        writeln!(f, "Drift detected:")?;
        for entry in &self.entries {
            write!(f, "  - {}: {}", entry.name, entry.kind)?;
            if !entry.attributes.is_empty() {
                write!(f, " ({})", entry.attributes.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
