//! Reconciliation engine
//!
//! Drives observed state toward the desired state model. Resources are
//! processed in dependency order (reversed for teardown); independent
//! resources may run concurrently up to the configured parallelism. A failed
//! resource fails everything that depends on it without touching those
//! resources, while unrelated subtrees keep going.

use crate::client::{Completion, ObservedState, ResourceClient};
use crate::error::{ClientError, ClientResult, Result};
use crate::graph::DependencyGraph;
use crate::plan::{self, Action, ActionType, Plan};
use crate::poller::{PollPolicy, TaskOutcome, TaskPoller};
use crate::record::{Mode, Phase, RecordStore, RunReport};
use crate::retry::{RetryConfig, retry_transient};
use chrono::Utc;
use futures_util::FutureExt;
use pveflow_core::{DesiredStateModel, ResourceId, ResourceSpec};
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Engine settings
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Maximum number of resources processed at once
    pub parallelism: usize,

    /// Diff only; no mutating calls are issued
    pub dry_run: bool,

    pub retry: RetryConfig,
    pub poll: PollPolicy,

    /// Whole-run deadline; expiry cancels the run
    pub run_timeout: Option<Duration>,

    /// Delete resources whose create task failed
    pub rollback_failed_creates: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            parallelism: 1,
            dry_run: false,
            retry: RetryConfig::default(),
            poll: PollPolicy::default(),
            run_timeout: None,
            rollback_failed_creates: false,
        }
    }
}

/// Reconciles a [`DesiredStateModel`] through a [`ResourceClient`].
///
/// Each call to [`ReconciliationEngine::reconcile`] uses its own record
/// store, so separate runs never share mutable state.
pub struct ReconciliationEngine {
    client: Arc<dyn ResourceClient>,
    options: EngineOptions,
    cancel: CancellationToken,
}

impl ReconciliationEngine {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self::with_options(client, EngineOptions::default())
    }

    pub fn with_options(client: Arc<dyn ResourceClient>, options: EngineOptions) -> Self {
        Self {
            client,
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Token that cancels every current and future run of this engine
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Read-only diff of every resource, in execution order
    #[instrument(skip(self, model), fields(environment = %model.environment()))]
    pub async fn plan(&self, model: &DesiredStateModel, mode: Mode) -> Result<Plan> {
        let graph = DependencyGraph::build(model)?;
        let order = match mode {
            Mode::Apply => graph.order().to_vec(),
            Mode::Destroy => graph.teardown_order(),
        };

        let mut actions = Vec::with_capacity(order.len());
        for id in &order {
            let observed = read_optional(
                self.client.as_ref(),
                &self.options.retry,
                &self.cancel,
                id,
            )
            .await?;
            let action = match (mode, model.resource(id)) {
                (Mode::Apply, Some(spec)) => plan::diff(spec, observed.as_ref()),
                _ => plan::destroy(id, observed.as_ref()),
            };
            debug!(resource = %id, action = %action.action_type, "Planned");
            actions.push(action);
        }
        Ok(Plan::new(actions))
    }

    /// Reconcile every resource of `model`.
    ///
    /// Only graph errors abort the run (before anything is mutated);
    /// per-resource failures end up in the returned records.
    #[instrument(skip(self, model), fields(environment = %model.environment()))]
    pub async fn reconcile(&self, model: &DesiredStateModel, mode: Mode) -> Result<RunReport> {
        let graph = DependencyGraph::build(model)?;
        let order = match mode {
            Mode::Apply => graph.order().to_vec(),
            Mode::Destroy => graph.teardown_order(),
        };

        let started_at = Utc::now();
        let run_cancel = self.cancel.child_token();
        let records = RecordStore::new(&order);
        info!(
            mode = %mode,
            resources = order.len(),
            parallelism = self.options.parallelism,
            dry_run = self.options.dry_run,
            "Starting reconciliation"
        );

        let timeout_guard = self.options.run_timeout.map(|limit| {
            let cancel = run_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!(timeout_secs = limit.as_secs(), "Run timeout reached, cancelling");
                cancel.cancel();
            })
        });

        let worker = Arc::new(Worker {
            client: self.client.clone(),
            poller: TaskPoller::new(
                self.client.clone(),
                self.options.poll.clone(),
                run_cancel.clone(),
            ),
            records: records.clone(),
            retry: self.options.retry.clone(),
            dry_run: self.options.dry_run,
            rollback: self.options.rollback_failed_creates,
            cancel: run_cancel.clone(),
        });

        let parallelism = self.options.parallelism.max(1);
        let mut pending: Vec<ResourceId> = order.clone();
        let mut running: BTreeSet<ResourceId> = BTreeSet::new();
        let mut finished: BTreeSet<ResourceId> = BTreeSet::new();
        let mut workers: JoinSet<ResourceId> = JoinSet::new();

        loop {
            let mut i = 0;
            while i < pending.len() {
                let id = &pending[i];
                let prerequisites: Vec<&ResourceId> = match mode {
                    Mode::Apply => graph.dependencies(id).collect(),
                    Mode::Destroy => graph.dependents(id).collect(),
                };

                let failed = prerequisites
                    .iter()
                    .find(|p| records.phase(p).is_some_and(|phase| phase.is_failure()));
                if let Some(failed) = failed {
                    let cause = records.root_cause(failed);
                    info!(resource = %id, cause = %cause, "Skipped because a dependency failed");
                    records.skip(id, &cause);
                    finished.insert(pending.remove(i));
                    continue;
                }

                if run_cancel.is_cancelled() {
                    records.fail(id, "cancelled before start");
                    finished.insert(pending.remove(i));
                    continue;
                }

                let ready = prerequisites.iter().all(|p| finished.contains(*p));
                if ready && running.len() < parallelism {
                    let id = pending.remove(i);
                    running.insert(id.clone());
                    let worker = worker.clone();
                    let spec = model.resource(&id).cloned();
                    workers.spawn(async move {
                        let outcome = AssertUnwindSafe(worker.run(mode, &id, spec))
                            .catch_unwind()
                            .await;
                        if outcome.is_err() {
                            error!(resource = %id, "Worker panicked");
                            worker.records.fail(&id, "internal error: worker panicked");
                        }
                        id
                    });
                    continue;
                }
                i += 1;
            }

            if running.is_empty() {
                // unreachable for an acyclic graph, kept so a bug cannot hang the run
                for id in pending.drain(..) {
                    records.fail(&id, "dependencies never completed");
                }
                break;
            }

            match workers.join_next().await {
                Some(Ok(id)) => {
                    running.remove(&id);
                    finished.insert(id);
                }
                Some(Err(e)) => {
                    error!(error = %e, "Worker task aborted");
                    for id in std::mem::take(&mut running) {
                        if !records.phase(&id).is_some_and(|p| p.is_terminal()) {
                            records.fail(&id, format!("worker aborted: {}", e));
                        }
                        finished.insert(id);
                    }
                }
                None => running.clear(),
            }
        }

        if let Some(guard) = timeout_guard {
            guard.abort();
        }

        let records: Vec<_> = order.iter().filter_map(|id| records.get(id)).collect();
        let report = RunReport {
            environment: model.environment().to_string(),
            mode,
            dry_run: self.options.dry_run,
            started_at,
            finished_at: Utc::now(),
            records,
        };
        info!(
            failed = report.failed_count(),
            total = report.records.len(),
            "Reconciliation finished"
        );
        Ok(report)
    }
}

async fn read_optional(
    client: &dyn ResourceClient,
    retry: &RetryConfig,
    cancel: &CancellationToken,
    id: &ResourceId,
) -> ClientResult<Option<ObservedState>> {
    match retry_transient(retry, "read", cancel, || client.read(id)).await {
        Ok(state) => Ok(Some(state)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Why a step ended a resource early
enum StepError {
    Failed(String),
    RolledBack(String),
}

type StepResult = std::result::Result<(), StepError>;

/// State shared by the workers of one run
struct Worker {
    client: Arc<dyn ResourceClient>,
    poller: TaskPoller,
    records: RecordStore,
    retry: RetryConfig,
    dry_run: bool,
    rollback: bool,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(&self, mode: Mode, id: &ResourceId, spec: Option<ResourceSpec>) {
        match (mode, spec) {
            (Mode::Apply, Some(spec)) => self.apply(&spec).await,
            (Mode::Apply, None) => self.records.fail(id, "resource is not part of the model"),
            (Mode::Destroy, _) => self.destroy(id).await,
        }
    }

    async fn read(&self, id: &ResourceId) -> ClientResult<Option<ObservedState>> {
        read_optional(self.client.as_ref(), &self.retry, &self.cancel, id).await
    }

    fn record_action(&self, id: &ResourceId, action: &Action) {
        let action = action.clone();
        self.records.update(id, |r| r.action = Some(action));
    }

    async fn apply(&self, spec: &ResourceSpec) {
        let id = &spec.id;
        let observed = match self.read(id).await {
            Ok(observed) => observed,
            Err(e) => {
                warn!(resource = %id, error = %e, "Read failed");
                self.records.fail(id, format!("read failed: {}", e));
                return;
            }
        };

        let action = plan::diff(spec, observed.as_ref());
        self.record_action(id, &action);
        if self.dry_run {
            info!(resource = %id, action = %action.description, "Planned (dry run)");
            return;
        }
        if self.cancel.is_cancelled() {
            self.records.fail(id, "cancelled");
            return;
        }

        self.records.set_phase(id, Phase::Applying);
        if action.is_mutation() {
            info!(resource = %id, action = %action.action_type, "Applying");
        }

        let result = match action.action_type {
            ActionType::NoOp => Ok(()),
            ActionType::Create => self.create(spec).await,
            ActionType::Update => self.update(spec).await,
            ActionType::Replace => match self.delete(id).await {
                Ok(()) => self.create(spec).await,
                Err(e) => Err(e),
            },
            ActionType::Delete => self.delete(id).await,
        };

        match result {
            Ok(()) => {
                let address = if action.is_mutation() {
                    self.read_address(id).await
                } else {
                    observed.and_then(|o| o.address)
                };
                self.records.update(id, |r| {
                    r.phase = Phase::Applied;
                    r.address = address;
                });
                info!(resource = %id, "Applied");
            }
            Err(StepError::Failed(detail)) => {
                warn!(resource = %id, error = %detail, "Apply failed");
                self.records.fail(id, detail);
            }
            Err(StepError::RolledBack(detail)) => {
                warn!(resource = %id, error = %detail, "Create failed, partial resource removed");
                self.records.update(id, |r| {
                    r.phase = Phase::RolledBack;
                    r.error_detail = Some(detail);
                });
            }
        }
    }

    async fn destroy(&self, id: &ResourceId) {
        let observed = match self.read(id).await {
            Ok(observed) => observed,
            Err(e) => {
                warn!(resource = %id, error = %e, "Read failed");
                self.records.fail(id, format!("read failed: {}", e));
                return;
            }
        };

        let action = plan::destroy(id, observed.as_ref());
        self.record_action(id, &action);
        if self.dry_run {
            info!(resource = %id, action = %action.description, "Planned (dry run)");
            return;
        }
        if observed.is_none() {
            debug!(resource = %id, "Already absent");
            self.records.set_phase(id, Phase::Destroyed);
            return;
        }
        if self.cancel.is_cancelled() {
            self.records.fail(id, "cancelled");
            return;
        }

        self.records.set_phase(id, Phase::Destroying);
        info!(resource = %id, "Destroying");
        match self.delete(id).await {
            Ok(()) => {
                self.records.set_phase(id, Phase::Destroyed);
                info!(resource = %id, "Destroyed");
            }
            Err(StepError::Failed(detail)) | Err(StepError::RolledBack(detail)) => {
                warn!(resource = %id, error = %detail, "Destroy failed");
                self.records.fail(id, detail);
            }
        }
    }

    async fn create(&self, spec: &ResourceSpec) -> StepResult {
        let detail = match retry_transient(&self.retry, "create", &self.cancel, || {
            self.client.create(spec)
        })
        .await
        {
            Ok(completion) => match self.settle(&spec.id, completion).await {
                Ok(()) => return Ok(()),
                Err(detail) => detail,
            },
            // the resource is someone else's
            Err(e @ ClientError::Conflict(_)) => {
                return Err(StepError::Failed(format!("create failed: {}", e)));
            }
            Err(e) => {
                let detail = format!("create failed: {}", e);
                if !self.rollback || self.cancel.is_cancelled() {
                    return Err(StepError::Failed(detail));
                }
                match self.read(&spec.id).await {
                    Ok(Some(_)) => detail,
                    Ok(None) => return Err(StepError::Failed(detail)),
                    Err(read) => {
                        return Err(StepError::Failed(format!(
                            "{}; rollback skipped: {}",
                            detail, read
                        )));
                    }
                }
            }
        };
        if !self.rollback || self.cancel.is_cancelled() {
            return Err(StepError::Failed(detail));
        }

        warn!(resource = %spec.id, "Rolling back failed create");
        match self.delete(&spec.id).await {
            Ok(()) => Err(StepError::RolledBack(detail)),
            Err(StepError::Failed(cleanup)) | Err(StepError::RolledBack(cleanup)) => Err(
                StepError::Failed(format!("{}; rollback failed: {}", detail, cleanup)),
            ),
        }
    }

    async fn update(&self, spec: &ResourceSpec) -> StepResult {
        let completion = retry_transient(&self.retry, "update", &self.cancel, || {
            self.client.update(&spec.id, &spec.attributes)
        })
        .await
        .map_err(|e| StepError::Failed(format!("update failed: {}", e)))?;
        self.settle(&spec.id, completion)
            .await
            .map_err(StepError::Failed)
    }

    /// Delete; an already absent resource counts as deleted
    async fn delete(&self, id: &ResourceId) -> StepResult {
        let completion =
            match retry_transient(&self.retry, "delete", &self.cancel, || self.client.delete(id))
                .await
            {
                Ok(completion) => completion,
                Err(ClientError::NotFound(_)) => return Ok(()),
                Err(e) => return Err(StepError::Failed(format!("delete failed: {}", e))),
            };
        self.settle(id, completion).await.map_err(StepError::Failed)
    }

    /// Wait for the completion of a mutating call
    async fn settle(
        &self,
        id: &ResourceId,
        completion: Completion,
    ) -> std::result::Result<(), String> {
        let Completion::Task(handle) = completion else {
            return Ok(());
        };
        let task_id = handle.id.clone();
        self.records.update(id, |r| r.last_task_id = Some(task_id));

        debug!(resource = %id, task = %handle.id, operation = %handle.operation, "Awaiting task");
        let (outcome, timeout) = self.poller.await_task(&handle).await;
        match outcome {
            TaskOutcome::Success => Ok(()),
            TaskOutcome::Cancelled => Err("cancelled".to_string()),
            other => Err(other.describe(&handle, timeout)),
        }
    }

    async fn read_address(&self, id: &ResourceId) -> Option<String> {
        if !id.kind.is_guest() {
            return None;
        }
        match self.read(id).await {
            Ok(observed) => observed.and_then(|o| o.address),
            Err(e) => {
                warn!(resource = %id, error = %e, "Could not read back address");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ResourceStatus;
    use crate::memory::{CallKind, InMemoryClient};
    use crate::testing::{sample_config, sample_model};
    use pveflow_core::attr;

    fn engine(client: &Arc<InMemoryClient>, options: EngineOptions) -> ReconciliationEngine {
        ReconciliationEngine::with_options(client.clone(), options)
    }

    fn phase(report: &RunReport, id: &ResourceId) -> Phase {
        report.record(id).unwrap().phase
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_creates_everything_in_order() {
        let client = Arc::new(InMemoryClient::new());
        let model = sample_model();

        let report = engine(&client, EngineOptions::default())
            .reconcile(&model, Mode::Apply)
            .await
            .unwrap();

        assert!(report.is_success(), "{:?}", report.records);
        assert!(report.records.iter().all(|r| r.phase == Phase::Applied));
        assert_eq!(client.resource_count(), model.len());

        let creates: Vec<ResourceId> = client
            .calls()
            .into_iter()
            .filter(|c| c.kind == CallKind::Create)
            .map(|c| c.id)
            .collect();
        let graph = DependencyGraph::build(&model).unwrap();
        assert_eq!(creates, graph.order());

        let vm = report.record(&ResourceId::vm(301)).unwrap();
        assert_eq!(vm.address.as_deref(), Some("10.100.2.21"));
        assert!(vm.last_task_id.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_apply_issues_no_mutations() {
        let client = Arc::new(InMemoryClient::new());
        let model = sample_model();
        let engine = engine(&client, EngineOptions::default());

        engine.reconcile(&model, Mode::Apply).await.unwrap();
        client.clear_calls();

        let report = engine.reconcile(&model, Mode::Apply).await.unwrap();
        assert_eq!(client.mutation_count(), 0);
        assert!(report.records.iter().all(|r| r.phase == Phase::Applied));
        assert!(
            report
                .records
                .iter()
                .all(|r| r.action.as_ref().is_some_and(|a| a.action_type == ActionType::NoOp))
        );
        assert!(!report.plan().has_changes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_then_apply_round_trip() {
        let client = Arc::new(InMemoryClient::new());
        let model = sample_model();
        let engine = engine(&client, EngineOptions::default());

        engine.reconcile(&model, Mode::Apply).await.unwrap();
        let destroyed = engine.reconcile(&model, Mode::Destroy).await.unwrap();
        assert!(destroyed.records.iter().all(|r| r.phase == Phase::Destroyed));
        assert_eq!(client.resource_count(), 0);

        let deletes: Vec<ResourceId> = client
            .calls()
            .into_iter()
            .filter(|c| c.kind == CallKind::Delete)
            .map(|c| c.id)
            .collect();
        let graph = DependencyGraph::build(&model).unwrap();
        assert_eq!(deletes, graph.teardown_order());

        let applied = engine.reconcile(&model, Mode::Apply).await.unwrap();
        assert!(applied.is_success());
        for spec in model.resources() {
            let observed = client.observed(&spec.id).unwrap();
            for (key, value) in &observed.attributes {
                assert_eq!(spec.attributes.get(key), Some(value), "{} {}", spec.id, key);
            }
            assert!(plan::changes(spec, &observed).is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_of_absent_resources_is_noop() {
        let client = Arc::new(InMemoryClient::new());
        let report = engine(&client, EngineOptions::default())
            .reconcile(&sample_model(), Mode::Destroy)
            .await
            .unwrap();

        assert!(report.is_success());
        assert!(report.records.iter().all(|r| r.phase == Phase::Destroyed));
        assert_eq!(client.mutation_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_management_failure_skips_both_vms() {
        let client = Arc::new(InMemoryClient::new());
        let container = ResourceId::container(200);
        client.fail_always(
            CallKind::Create,
            &container,
            ClientError::Rejected("template not found".to_string()),
        );

        let report = engine(&client, EngineOptions::default())
            .reconcile(&sample_model(), Mode::Apply)
            .await
            .unwrap();

        assert_eq!(phase(&report, &container), Phase::Failed);
        assert!(report.record(&container).unwrap().failed_itself());
        for vm in [ResourceId::vm(301), ResourceId::vm(302)] {
            let record = report.record(&vm).unwrap();
            assert_eq!(record.phase, Phase::Failed);
            assert_eq!(record.skipped_due_to, Some(container.clone()));
            assert!(client.mutations_for(&vm).is_empty());
        }
        // the network phase is unaffected
        assert_eq!(phase(&report, &ResourceId::zone("labzone")), Phase::Applied);
        assert_eq!(report.failed_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vm_failure_leaves_sibling_applied() {
        let client = Arc::new(InMemoryClient::new());
        let a = ResourceId::vm(301);
        let b = ResourceId::vm(302);
        client.fail_task_of(CallKind::Create, &a, "clone failed");

        let report = engine(&client, EngineOptions::default())
            .reconcile(&sample_model(), Mode::Apply)
            .await
            .unwrap();

        assert_eq!(phase(&report, &a), Phase::Failed);
        assert!(
            report
                .record(&a)
                .unwrap()
                .error_detail
                .as_deref()
                .unwrap()
                .contains("clone failed")
        );
        assert_eq!(phase(&report, &b), Phase::Applied);
        assert_eq!(report.failed_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_reports_first_failing_ancestor() {
        let mut config = sample_config();
        config.fleet.get_mut("docker-01").unwrap().depends_on = vec!["db-01".to_string()];
        let model = DesiredStateModel::load(&config).unwrap();

        let client = Arc::new(InMemoryClient::new());
        let subnet = ResourceId::subnet("10.100.2.0/24");
        client.fail_always(
            CallKind::Create,
            &subnet,
            ClientError::Rejected("invalid gateway".to_string()),
        );

        let report = engine(&client, EngineOptions::default())
            .reconcile(&model, Mode::Apply)
            .await
            .unwrap();

        // docker-01 waits on db-01, which was skipped because of the subnet
        let record = report.record(&ResourceId::vm(301)).unwrap();
        assert_eq!(record.skipped_due_to, Some(subnet.clone()));
        assert_eq!(phase(&report, &ResourceId::container(200)), Phase::Applied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hostname_change_replaces_container() {
        let client = Arc::new(InMemoryClient::new());
        let engine = engine(&client, EngineOptions::default());
        engine.reconcile(&sample_model(), Mode::Apply).await.unwrap();
        client.clear_calls();

        let mut config = sample_config();
        config.management.hostname = "mgmt-b".to_string();
        let model = DesiredStateModel::load(&config).unwrap();
        let report = engine.reconcile(&model, Mode::Apply).await.unwrap();

        let container = ResourceId::container(200);
        assert_eq!(
            client.mutations_for(&container),
            vec![CallKind::Delete, CallKind::Create]
        );
        let record = report.record(&container).unwrap();
        assert_eq!(record.phase, Phase::Applied);
        assert_eq!(
            record.action.as_ref().map(|a| a.action_type),
            Some(ActionType::Replace)
        );
        assert_eq!(
            client.observed(&container).unwrap().attributes[attr::HOSTNAME].as_str(),
            Some("mgmt-b")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sizing_change_updates_in_place() {
        let client = Arc::new(InMemoryClient::new());
        let engine = engine(&client, EngineOptions::default());
        engine.reconcile(&sample_model(), Mode::Apply).await.unwrap();
        client.clear_calls();

        let mut config = sample_config();
        config.fleet.get_mut("db-01").unwrap().memory_mb = 8192;
        let model = DesiredStateModel::load(&config).unwrap();
        engine.reconcile(&model, Mode::Apply).await.unwrap();

        assert_eq!(
            client.mutations_for(&ResourceId::vm(302)),
            vec![CallKind::Update]
        );
        assert_eq!(client.mutation_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_independent_vms() {
        let client = Arc::new(InMemoryClient::new().with_task_polls(3));
        let options = EngineOptions {
            parallelism: 2,
            ..Default::default()
        };

        let report = engine(&client, options)
            .reconcile(&sample_model(), Mode::Apply)
            .await
            .unwrap();

        assert_eq!(phase(&report, &ResourceId::vm(301)), Phase::Applied);
        assert_eq!(phase(&report, &ResourceId::vm(302)), Phase::Applied);
        assert_eq!(report.records.len(), 8);
        assert_eq!(client.max_outstanding_tasks(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_by_default() {
        let client = Arc::new(InMemoryClient::new().with_task_polls(3));
        engine(&client, EngineOptions::default())
            .reconcile(&sample_model(), Mode::Apply)
            .await
            .unwrap();
        assert_eq!(client.max_outstanding_tasks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let client = Arc::new(InMemoryClient::new());
        let vm = ResourceId::vm(301);
        client.fail_times(
            CallKind::Create,
            &vm,
            ClientError::Transient("connection reset".to_string()),
            2,
        );

        let report = engine(&client, EngineOptions::default())
            .reconcile(&sample_model(), Mode::Apply)
            .await
            .unwrap();
        assert_eq!(phase(&report, &vm), Phase::Applied);
        assert_eq!(client.mutations_for(&vm), vec![CallKind::Create; 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_exhaust_retries() {
        let client = Arc::new(InMemoryClient::new());
        let vm = ResourceId::vm(301);
        client.fail_always(
            CallKind::Create,
            &vm,
            ClientError::Transient("connection reset".to_string()),
        );

        let report = engine(&client, EngineOptions::default())
            .reconcile(&sample_model(), Mode::Apply)
            .await
            .unwrap();
        assert_eq!(phase(&report, &vm), Phase::Failed);
        assert_eq!(client.mutations_for(&vm).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_is_not_retried() {
        let client = Arc::new(InMemoryClient::new());
        let vm = ResourceId::vm(302);
        client.fail_always(
            CallKind::Create,
            &vm,
            ClientError::Conflict("vmid 302 already exists".to_string()),
        );

        let report = engine(&client, EngineOptions::default())
            .reconcile(&sample_model(), Mode::Apply)
            .await
            .unwrap();
        assert_eq!(phase(&report, &vm), Phase::Failed);
        assert_eq!(client.mutations_for(&vm).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_task_times_out() {
        let client = Arc::new(InMemoryClient::new());
        let vm = ResourceId::vm(301);
        client.hang_task_of(CallKind::Create, &vm);

        let report = engine(&client, EngineOptions::default())
            .reconcile(&sample_model(), Mode::Apply)
            .await
            .unwrap();

        let record = report.record(&vm).unwrap();
        assert_eq!(record.phase, Phase::Failed);
        assert!(record.error_detail.as_deref().unwrap().contains("300s"));
        assert_eq!(phase(&report, &ResourceId::vm(302)), Phase::Applied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_removes_partial_resource() {
        let client = Arc::new(InMemoryClient::new());
        let vm = ResourceId::vm(301);
        client.fail_task_of(CallKind::Create, &vm, "disk resize failed");
        let options = EngineOptions {
            rollback_failed_creates: true,
            ..Default::default()
        };

        let report = engine(&client, options)
            .reconcile(&sample_model(), Mode::Apply)
            .await
            .unwrap();

        assert_eq!(phase(&report, &vm), Phase::RolledBack);
        assert!(client.observed(&vm).is_none());
        assert_eq!(
            client.mutations_for(&vm),
            vec![CallKind::Create, CallKind::Delete]
        );
        assert_eq!(report.failed_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_after_create_call_error_leaves_nothing() {
        let client = Arc::new(InMemoryClient::new());
        let vm = ResourceId::vm(301);
        client.fail_create_partway(&vm, ClientError::Rejected("cloud-init drive busy".to_string()));
        let options = EngineOptions {
            rollback_failed_creates: true,
            ..Default::default()
        };

        let report = engine(&client, options)
            .reconcile(&sample_model(), Mode::Apply)
            .await
            .unwrap();

        let record = report.record(&vm).unwrap();
        assert_eq!(record.phase, Phase::RolledBack);
        assert!(
            record
                .error_detail
                .as_deref()
                .unwrap()
                .contains("cloud-init drive busy")
        );
        assert!(client.observed(&vm).is_none());
        assert_eq!(
            client.mutations_for(&vm),
            vec![CallKind::Create, CallKind::Delete]
        );
        assert_eq!(phase(&report, &ResourceId::vm(302)), Phase::Applied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_call_error_without_rollback_keeps_partial_resource() {
        let client = Arc::new(InMemoryClient::new());
        let vm = ResourceId::vm(301);
        client.fail_create_partway(&vm, ClientError::Rejected("cloud-init drive busy".to_string()));

        let report = engine(&client, EngineOptions::default())
            .reconcile(&sample_model(), Mode::Apply)
            .await
            .unwrap();

        assert_eq!(phase(&report, &vm), Phase::Failed);
        assert!(client.observed(&vm).is_some());
        assert_eq!(client.mutations_for(&vm), vec![CallKind::Create]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_issues_no_mutations() {
        let client = Arc::new(InMemoryClient::new());
        let options = EngineOptions {
            dry_run: true,
            ..Default::default()
        };

        let report = engine(&client, options)
            .reconcile(&sample_model(), Mode::Apply)
            .await
            .unwrap();

        assert_eq!(client.mutation_count(), 0);
        assert!(report.records.iter().all(|r| r.phase == Phase::Planned));
        assert_eq!(report.plan_summary().create, 8);
        assert!(report.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_matches_diff() {
        let client = Arc::new(InMemoryClient::new());
        let engine = engine(&client, EngineOptions::default());
        engine.reconcile(&sample_model(), Mode::Apply).await.unwrap();
        client.remove_observed(&ResourceId::vm(302));

        let plan = engine.plan(&sample_model(), Mode::Apply).await.unwrap();
        let summary = plan.summary();
        assert_eq!(summary.create, 1);
        assert_eq!(summary.no_change, 7);

        let teardown = engine.plan(&sample_model(), Mode::Destroy).await.unwrap();
        assert_eq!(teardown.summary().delete, 7);
        assert_eq!(teardown.actions[0].resource_id, ResourceId::vm(302));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_fails_in_flight_and_pending() {
        let client = Arc::new(InMemoryClient::new());
        let container = ResourceId::container(200);
        client.hang_task_of(CallKind::Create, &container);
        let engine = engine(&client, EngineOptions::default());

        let token = engine.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(20)).await;
            token.cancel();
        });

        let report = engine.reconcile(&sample_model(), Mode::Apply).await.unwrap();
        let record = report.record(&container).unwrap();
        assert_eq!(record.phase, Phase::Failed);
        assert_eq!(record.error_detail.as_deref(), Some("cancelled"));
        for vm in [ResourceId::vm(301), ResourceId::vm(302)] {
            assert_eq!(phase(&report, &vm), Phase::Failed);
            assert!(client.mutations_for(&vm).is_empty());
        }
        assert!(report.records.iter().all(|r| r.phase != Phase::Applying));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout_cancels() {
        let client = Arc::new(InMemoryClient::new());
        let vm = ResourceId::vm(301);
        client.hang_task_of(CallKind::Create, &vm);
        let options = EngineOptions {
            run_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let engine = engine(&client, options);

        let report = engine.reconcile(&sample_model(), Mode::Apply).await.unwrap();
        assert_eq!(phase(&report, &vm), Phase::Failed);
        assert_eq!(phase(&report, &ResourceId::vm(302)), Phase::Failed);

        // the timeout only cancelled that run
        assert!(!engine.cancellation_token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_guest_without_drift_is_noop() {
        let client = Arc::new(InMemoryClient::new());
        let engine = engine(&client, EngineOptions::default());
        engine.reconcile(&sample_model(), Mode::Apply).await.unwrap();

        let vm = ResourceId::vm(301);
        let stopped = client
            .observed(&vm)
            .unwrap()
            .with_status(ResourceStatus::Stopped);
        client.set_observed(stopped);
        client.clear_calls();

        engine.reconcile(&sample_model(), Mode::Apply).await.unwrap();
        assert_eq!(client.mutation_count(), 0);
    }
}
