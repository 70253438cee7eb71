//! Per-resource reconciliation records and run reports

use crate::plan::{Action, Plan, PlanSummary};
use chrono::{DateTime, Utc};
use pveflow_core::ResourceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Direction of a reconciliation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Apply,
    Destroy,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Apply => write!(f, "apply"),
            Mode::Destroy => write!(f, "destroy"),
        }
    }
}

/// Lifecycle phase of a resource within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planned,
    Applying,
    Applied,
    Destroying,
    Destroyed,
    Failed,
    /// A failed create was cleaned up
    RolledBack,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Phase::Applied | Phase::Destroyed | Phase::Failed | Phase::RolledBack
        )
    }

    /// Whether the phase counts as a failed resource
    pub fn is_failure(&self) -> bool {
        matches!(self, Phase::Failed | Phase::RolledBack)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Planned => write!(f, "planned"),
            Phase::Applying => write!(f, "applying"),
            Phase::Applied => write!(f, "applied"),
            Phase::Destroying => write!(f, "destroying"),
            Phase::Destroyed => write!(f, "destroyed"),
            Phase::Failed => write!(f, "failed"),
            Phase::RolledBack => write!(f, "rolled back"),
        }
    }
}

/// Outcome of one resource in the current run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub resource_id: ResourceId,
    pub phase: Phase,

    /// Action decided for the resource, once it has been read
    pub action: Option<Action>,

    pub last_task_id: Option<String>,
    pub error_detail: Option<String>,

    /// Root-cause dependency when the resource was never attempted
    pub skipped_due_to: Option<ResourceId>,

    /// Observed primary address after apply
    pub address: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl ReconciliationRecord {
    pub fn planned(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            phase: Phase::Planned,
            action: None,
            last_task_id: None,
            error_detail: None,
            skipped_due_to: None,
            address: None,
            updated_at: Utc::now(),
        }
    }

    /// The resource itself failed (as opposed to being skipped)
    pub fn failed_itself(&self) -> bool {
        self.phase.is_failure() && self.skipped_due_to.is_none()
    }
}

/// Record storage shared by the workers of one run.
///
/// Each worker writes only the record of the resource it owns.
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    inner: Arc<Mutex<BTreeMap<ResourceId, ReconciliationRecord>>>,
}

impl RecordStore {
    pub fn new<'a>(ids: impl IntoIterator<Item = &'a ResourceId>) -> Self {
        let records = ids
            .into_iter()
            .map(|id| (id.clone(), ReconciliationRecord::planned(id.clone())))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(records)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ResourceId, ReconciliationRecord>> {
        // a panicking worker leaves plain data behind
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mutate one record; the lock is held only for the closure
    pub fn update(&self, id: &ResourceId, f: impl FnOnce(&mut ReconciliationRecord)) {
        let mut records = self.lock();
        let record = records
            .entry(id.clone())
            .or_insert_with(|| ReconciliationRecord::planned(id.clone()));
        f(record);
        record.updated_at = Utc::now();
    }

    pub fn set_phase(&self, id: &ResourceId, phase: Phase) {
        self.update(id, |r| r.phase = phase);
    }

    pub fn fail(&self, id: &ResourceId, detail: impl Into<String>) {
        let detail = detail.into();
        self.update(id, |r| {
            r.phase = Phase::Failed;
            r.error_detail = Some(detail);
        });
    }

    /// Mark a resource failed without attempting it
    pub fn skip(&self, id: &ResourceId, cause: &ResourceId) {
        self.update(id, |r| {
            r.phase = Phase::Failed;
            r.error_detail = Some(format!("skipped because {} failed", cause));
            r.skipped_due_to = Some(cause.clone());
        });
    }

    pub fn get(&self, id: &ResourceId) -> Option<ReconciliationRecord> {
        self.lock().get(id).cloned()
    }

    pub fn phase(&self, id: &ResourceId) -> Option<Phase> {
        self.lock().get(id).map(|r| r.phase)
    }

    /// Root cause to report for dependents of a failed `id`
    pub fn root_cause(&self, id: &ResourceId) -> ResourceId {
        self.lock()
            .get(id)
            .and_then(|r| r.skipped_due_to.clone())
            .unwrap_or_else(|| id.clone())
    }
}

/// Full result of one reconciliation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub environment: String,
    pub mode: Mode,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Records in execution order
    pub records: Vec<ReconciliationRecord>,
}

impl RunReport {
    pub fn record(&self, id: &ResourceId) -> Option<&ReconciliationRecord> {
        self.records.iter().find(|r| &r.resource_id == id)
    }

    pub fn failed_count(&self) -> usize {
        self.records.iter().filter(|r| r.phase.is_failure()).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed_count() == 0
    }

    /// Actions decided during the run
    pub fn plan(&self) -> Plan {
        Plan::new(
            self.records
                .iter()
                .filter_map(|r| r.action.clone())
                .collect(),
        )
    }

    pub fn plan_summary(&self) -> PlanSummary {
        self.plan().summary()
    }

    /// Serializable per-resource summary for downstream tooling
    pub fn summary(&self) -> RunSummary {
        let resources = self
            .records
            .iter()
            .map(|r| {
                (
                    r.resource_id.to_string(),
                    ResourceSummary {
                        phase: r.phase,
                        action: r.action.as_ref().map(|a| a.action_type),
                        vmid: r.resource_id.vmid(),
                        address: r.address.clone(),
                        error: r.error_detail.clone(),
                        skipped_due_to: r.skipped_due_to.clone(),
                    },
                )
            })
            .collect();

        RunSummary {
            environment: self.environment.clone(),
            mode: self.mode,
            dry_run: self.dry_run,
            finished_at: self.finished_at,
            failed: self.failed_count(),
            resources,
        }
    }
}

/// Resource id to final phase and observed identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub environment: String,
    pub mode: Mode,
    pub dry_run: bool,
    pub finished_at: DateTime<Utc>,
    pub failed: usize,
    pub resources: BTreeMap<String, ResourceSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<crate::plan::ActionType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vmid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_due_to: Option<ResourceId>,
}
