//! pveflow reconciliation engine
//!
//! This crate drives a Proxmox VE estate toward the state declared in a
//! [`pveflow_core::DesiredStateModel`], behind a client abstraction so that
//! the same engine runs against a live endpoint or an in-memory hypervisor.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 pve-fleet CLI                    │
//! │          (deploy / destroy / validate)           │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                pveflow-cloud                     │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │ ReconciliationEngine                      │   │
//! │  │   DependencyGraph → diff → TaskPoller     │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────────┐  ┌──────────────┐            │
//! │  │HealthValidator│ │  State Mgmt  │            │
//! │  └──────────────┘  └──────────────┘            │
//! │  trait ResourceClient { ... }                    │
//! └───────┬─────────────────┬───────────────────────┘
//!         │                 │
//! ┌───────▼───────┐ ┌───────▼───────┐
//! │    proxmox    │ │   in-memory   │
//! │    client     │ │    client     │
//! └───────────────┘ └───────────────┘
//! ```

pub mod client;
pub mod engine;
pub mod error;
pub mod graph;
pub mod health;
pub mod memory;
pub mod plan;
pub mod poller;
pub mod record;
pub mod retry;
pub mod state;

#[cfg(test)]
mod testing;

// Re-exports
pub use client::{
    Completion, ObservedState, ResourceClient, ResourceStatus, TaskHandle, TaskOperation,
    TaskStatus,
};
pub use engine::{EngineOptions, ReconciliationEngine};
pub use error::{ClientError, ClientResult, CloudError, Result};
pub use graph::DependencyGraph;
pub use health::{CheckResult, FnCheck, HealthValidator, PostApplyCheck, Scope};
pub use memory::InMemoryClient;
pub use plan::{Action, ActionType, AttributeChange, Plan, PlanSummary};
pub use poller::{PollPolicy, TaskOutcome, TaskPoller};
pub use record::{
    Mode, Phase, ReconciliationRecord, RecordStore, ResourceSummary, RunReport, RunSummary,
};
pub use retry::RetryConfig;
pub use state::{StateLock, StateManager, StoredState};
