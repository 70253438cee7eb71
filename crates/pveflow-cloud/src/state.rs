//! Persisted run state
//!
//! Manages `.pveflow/<environment>/state.json`, which keeps the last known
//! outcome of every resource of an environment across runs, together with
//! an advisory lock so two runs against the same environment cannot overlap.

use crate::error::{CloudError, Result};
use crate::record::{Mode, Phase, ResourceSummary, RunReport, RunSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

const STATE_VERSION: u32 = 1;
const STATE_DIR: &str = ".pveflow";
const STATE_FILE: &str = "state.json";
const STATE_BACKUP: &str = "state.json.backup";
const LOCK_FILE: &str = "lock.json";

/// Stored state of one environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredState {
    /// State file version
    pub version: u32,

    pub environment: String,

    /// Last modified timestamp
    pub updated_at: DateTime<Utc>,

    /// Last known outcome per resource id
    pub resources: BTreeMap<String, ResourceSummary>,

    /// Summary of the most recent run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<RunSummary>,
}

impl StoredState {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            version: STATE_VERSION,
            environment: environment.into(),
            updated_at: Utc::now(),
            resources: BTreeMap::new(),
            last_run: None,
        }
    }

    /// Merge the outcome of a run.
    ///
    /// Dry runs only update `last_run`. Destroyed resources are forgotten.
    pub fn record_run(&mut self, report: &RunReport) {
        let summary = report.summary();
        if !report.dry_run {
            for (id, resource) in &summary.resources {
                match (report.mode, resource.phase) {
                    (Mode::Destroy, Phase::Destroyed) => {
                        self.resources.remove(id);
                    }
                    _ => {
                        self.resources.insert(id.clone(), resource.clone());
                    }
                }
            }
        }
        self.last_run = Some(summary);
        self.updated_at = Utc::now();
    }

    pub fn resource(&self, id: &str) -> Option<&ResourceSummary> {
        self.resources.get(id)
    }
}

/// State manager for reading/writing state files
pub struct StateManager {
    /// Project root directory
    project_root: PathBuf,
    environment: String,
}

impl StateManager {
    pub fn new(project_root: impl AsRef<Path>, environment: impl Into<String>) -> Self {
        Self {
            project_root: project_root.as_ref().to_path_buf(),
            environment: environment.into(),
        }
    }

    /// Get the state directory path
    pub fn state_dir(&self) -> PathBuf {
        self.project_root.join(STATE_DIR).join(&self.environment)
    }

    fn state_path(&self) -> PathBuf {
        self.state_dir().join(STATE_FILE)
    }

    fn backup_path(&self) -> PathBuf {
        self.state_dir().join(STATE_BACKUP)
    }

    fn lock_path(&self) -> PathBuf {
        self.state_dir().join(LOCK_FILE)
    }

    async fn ensure_state_dir(&self) -> Result<()> {
        let dir = self.state_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir).await?;
            tracing::debug!("Created state directory: {}", dir.display());
        }
        Ok(())
    }

    /// Load the current state
    pub async fn load(&self) -> Result<StoredState> {
        let path = self.state_path();
        if !path.exists() {
            tracing::debug!("State file not found, returning empty state");
            return Ok(StoredState::new(&self.environment));
        }

        let content = fs::read_to_string(&path).await?;
        let state: StoredState = serde_json::from_str(&content)?;

        if state.version > STATE_VERSION {
            return Err(CloudError::StateError(format!(
                "State file version {} is newer than supported version {}",
                state.version, STATE_VERSION
            )));
        }
        if state.environment != self.environment {
            return Err(CloudError::StateError(format!(
                "State file {} belongs to environment '{}'",
                path.display(),
                state.environment
            )));
        }

        tracing::debug!("Loaded state with {} resources", state.resources.len());
        Ok(state)
    }

    /// Save the state, keeping the previous file as a backup
    pub async fn save(&self, state: &StoredState) -> Result<()> {
        self.ensure_state_dir().await?;

        let path = self.state_path();
        let backup = self.backup_path();

        if path.exists() {
            if backup.exists() {
                fs::remove_file(&backup).await?;
            }
            fs::rename(&path, &backup).await?;
            tracing::debug!("Created state backup");
        }

        let content = serde_json::to_string_pretty(state)?;
        fs::write(&path, content).await?;

        tracing::debug!("Saved state with {} resources", state.resources.len());
        Ok(())
    }

    /// Load, merge `report` and save
    pub async fn record_run(&self, report: &RunReport) -> Result<StoredState> {
        let mut state = self.load().await?;
        state.record_run(report);
        self.save(&state).await?;
        Ok(state)
    }

    /// Acquire a lock for exclusive access to this environment
    pub async fn acquire_lock(&self) -> Result<StateLock> {
        self.ensure_state_dir().await?;

        let lock_path = self.lock_path();

        if lock_path.exists() {
            let content = fs::read_to_string(&lock_path).await?;
            let lock_info: LockInfo = serde_json::from_str(&content)?;

            // Locks older than one hour are stale
            let age = Utc::now().signed_duration_since(lock_info.acquired_at);
            if age.num_hours() < 1 {
                return Err(CloudError::LockError(format!(
                    "Environment '{}' is locked by {} (pid {}) since {}",
                    self.environment, lock_info.holder, lock_info.pid, lock_info.acquired_at
                )));
            }

            tracing::warn!("Removing stale lock from {}", lock_info.holder);
        }

        let lock_info = LockInfo {
            holder: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };

        let content = serde_json::to_string_pretty(&lock_info)?;
        fs::write(&lock_path, content).await?;

        tracing::debug!("Acquired state lock");
        Ok(StateLock {
            lock_path,
            released: false,
        })
    }
}

/// Lock information
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    #[serde(default)]
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// RAII guard for the state lock
pub struct StateLock {
    lock_path: PathBuf,
    released: bool,
}

impl StateLock {
    /// Release the lock
    pub async fn release(mut self) -> Result<()> {
        if !self.released {
            if self.lock_path.exists() {
                fs::remove_file(&self.lock_path).await?;
                tracing::debug!("Released state lock");
            }
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if !self.released && self.lock_path.exists() {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}
