//! In-memory hypervisor
//!
//! A [`ResourceClient`] that keeps resources in a map and simulates
//! asynchronous tasks for guests. Used for dry runs without an endpoint and
//! as the backing store of the test suite; failures can be injected per
//! operation and resource.

use crate::client::{
    Completion, ObservedState, ResourceClient, ResourceStatus, TaskHandle, TaskOperation,
    TaskStatus,
};
use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use pveflow_core::{Attributes, ResourceId, ResourceSpec, attr};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Client operation, as recorded in the call log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Read,
    Create,
    Update,
    Delete,
}

impl CallKind {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, CallKind::Read)
    }
}

/// One recorded client call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub kind: CallKind,
    pub id: ResourceId,
}

#[derive(Debug, Clone)]
enum TaskScript {
    Succeed,
    Fail(String),
    Hang,
}

#[derive(Debug, Clone)]
enum Effect {
    None,
    Create(ResourceId),
    Update(ResourceId, Attributes),
    Delete(ResourceId),
}

#[derive(Debug)]
struct Task {
    remaining_polls: u32,
    polls: u32,
    script: TaskScript,
    effect: Effect,
    result: Option<TaskStatus>,
}

#[derive(Debug)]
struct Injection {
    error: ClientError,
    /// `None` fails every call
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct Inner {
    resources: BTreeMap<ResourceId, ObservedState>,
    tasks: HashMap<String, Task>,
    next_task: u64,
    calls: Vec<Call>,
    injections: HashMap<(CallKind, ResourceId), Injection>,
    task_scripts: HashMap<(CallKind, ResourceId), TaskScript>,
    /// create leaves a stopped guest behind and then fails
    partial_creates: HashMap<ResourceId, ClientError>,
    outstanding: usize,
    max_outstanding: usize,
}

/// In-memory [`ResourceClient`]
#[derive(Debug)]
pub struct InMemoryClient {
    inner: Mutex<Inner>,
    task_polls: u32,
}

impl Default for InMemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryClient {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            task_polls: 1,
        }
    }

    /// Number of `Running` answers a task gives before it finishes
    pub fn with_task_polls(mut self, polls: u32) -> Self {
        self.task_polls = polls;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `times` calls of `kind` on `id` with `error`
    pub fn fail_times(&self, kind: CallKind, id: &ResourceId, error: ClientError, times: u32) {
        self.lock().injections.insert(
            (kind, id.clone()),
            Injection {
                error,
                remaining: Some(times),
            },
        );
    }

    pub fn fail_next(&self, kind: CallKind, id: &ResourceId, error: ClientError) {
        self.fail_times(kind, id, error, 1);
    }

    pub fn fail_always(&self, kind: CallKind, id: &ResourceId, error: ClientError) {
        self.lock().injections.insert(
            (kind, id.clone()),
            Injection {
                error,
                remaining: None,
            },
        );
    }

    /// Make the next create of `id` leave a partial resource and fail with `error`
    pub fn fail_create_partway(&self, id: &ResourceId, error: ClientError) {
        self.lock().partial_creates.insert(id.clone(), error);
    }

    /// Let the task started by the next `kind` call on `id` fail
    pub fn fail_task_of(&self, kind: CallKind, id: &ResourceId, reason: impl Into<String>) {
        self.lock()
            .task_scripts
            .insert((kind, id.clone()), TaskScript::Fail(reason.into()));
    }

    /// Let the task started by the next `kind` call on `id` never finish
    pub fn hang_task_of(&self, kind: CallKind, id: &ResourceId) {
        self.lock()
            .task_scripts
            .insert((kind, id.clone()), TaskScript::Hang);
    }

    /// Start a task that is not tied to any resource
    pub fn start_task(&self, operation: TaskOperation) -> TaskHandle {
        let mut inner = self.lock();
        self.spawn_task(&mut inner, operation, TaskScript::Succeed, Effect::None)
    }

    pub fn fail_task(&self, task_id: &str, reason: impl Into<String>) {
        if let Some(task) = self.lock().tasks.get_mut(task_id) {
            task.script = TaskScript::Fail(reason.into());
        }
    }

    pub fn hang_task(&self, task_id: &str) {
        if let Some(task) = self.lock().tasks.get_mut(task_id) {
            task.script = TaskScript::Hang;
        }
    }

    /// Replace the observed state of a resource, simulating an external change
    pub fn set_observed(&self, state: ObservedState) {
        self.lock().resources.insert(state.id.clone(), state);
    }

    pub fn remove_observed(&self, id: &ResourceId) {
        self.lock().resources.remove(id);
    }

    pub fn observed(&self, id: &ResourceId) -> Option<ObservedState> {
        self.lock().resources.get(id).cloned()
    }

    pub fn resource_count(&self) -> usize {
        self.lock().resources.len()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Number of create, update and delete calls issued so far
    pub fn mutation_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.kind.is_mutation())
            .count()
    }

    /// Mutating calls issued for `id`, in order
    pub fn mutations_for(&self, id: &ResourceId) -> Vec<CallKind> {
        self.lock()
            .calls
            .iter()
            .filter(|c| &c.id == id && c.kind.is_mutation())
            .map(|c| c.kind)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn status_polls(&self, task_id: &str) -> u32 {
        self.lock().tasks.get(task_id).map(|t| t.polls).unwrap_or(0)
    }

    /// Highest number of guest tasks that were in flight at the same time
    pub fn max_outstanding_tasks(&self) -> usize {
        self.lock().max_outstanding
    }

    fn spawn_task(
        &self,
        inner: &mut Inner,
        operation: TaskOperation,
        script: TaskScript,
        effect: Effect,
    ) -> TaskHandle {
        inner.next_task += 1;
        let id = format!(
            "UPID:memory:{:08X}:{}:{}",
            inner.next_task,
            operation,
            inner.next_task
        );
        inner.tasks.insert(
            id.clone(),
            Task {
                remaining_polls: self.task_polls,
                polls: 0,
                script,
                effect,
                result: None,
            },
        );
        inner.outstanding += 1;
        inner.max_outstanding = inner.max_outstanding.max(inner.outstanding);
        TaskHandle::new(id, operation)
    }

    /// Record the call and apply any injected failure
    fn enter(&self, inner: &mut Inner, kind: CallKind, id: &ResourceId) -> ClientResult<()> {
        inner.calls.push(Call {
            kind,
            id: id.clone(),
        });

        let key = (kind, id.clone());
        let Some(injection) = inner.injections.get_mut(&key) else {
            return Ok(());
        };
        let error = injection.error.clone();
        match injection.remaining.as_mut() {
            None => Err(error),
            Some(0) => {
                inner.injections.remove(&key);
                Ok(())
            }
            Some(n) => {
                *n -= 1;
                if *n == 0 {
                    inner.injections.remove(&key);
                }
                Err(error)
            }
        }
    }

    fn script_for(inner: &mut Inner, kind: CallKind, id: &ResourceId) -> TaskScript {
        inner
            .task_scripts
            .remove(&(kind, id.clone()))
            .unwrap_or(TaskScript::Succeed)
    }
}

/// Observed form of a spec: every attribute the hypervisor can report back
fn observe(spec: &ResourceSpec, status: ResourceStatus) -> ObservedState {
    let mut state = ObservedState::new(spec.id.clone()).with_status(status);
    for (key, value) in &spec.attributes {
        if key != attr::SSH_KEYS {
            state.attributes.insert(key.clone(), value.clone());
        }
    }
    if spec.kind().is_guest() {
        state.address = spec
            .attr_str(attr::IP)
            .map(|ip| ip.split('/').next().unwrap_or(ip).to_string());
    }
    state
}

fn apply_effect(inner: &mut Inner, effect: &Effect, succeeded: bool) {
    match effect {
        Effect::None => {}
        Effect::Create(id) => {
            if let Some(state) = inner.resources.get_mut(id) {
                state.status = if succeeded {
                    ResourceStatus::Running
                } else {
                    ResourceStatus::Error
                };
            }
        }
        Effect::Update(id, attributes) if succeeded => {
            if let Some(state) = inner.resources.get_mut(id) {
                for (key, value) in attributes {
                    if state.attributes.contains_key(key) {
                        state.attributes.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        Effect::Delete(id) if succeeded => {
            inner.resources.remove(id);
        }
        Effect::Update(..) | Effect::Delete(_) => {}
    }
}

#[async_trait]
impl ResourceClient for InMemoryClient {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn read(&self, id: &ResourceId) -> ClientResult<ObservedState> {
        let mut inner = self.lock();
        self.enter(&mut inner, CallKind::Read, id)?;
        inner
            .resources
            .get(id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(id.to_string()))
    }

    async fn create(&self, spec: &ResourceSpec) -> ClientResult<Completion> {
        let mut inner = self.lock();
        self.enter(&mut inner, CallKind::Create, &spec.id)?;
        if inner.resources.contains_key(&spec.id) {
            return Err(ClientError::Conflict(format!("{} already exists", spec.id)));
        }
        if let Some(error) = inner.partial_creates.remove(&spec.id) {
            inner
                .resources
                .insert(spec.id.clone(), observe(spec, ResourceStatus::Stopped));
            return Err(error);
        }

        if !spec.kind().is_guest() {
            inner
                .resources
                .insert(spec.id.clone(), observe(spec, ResourceStatus::Active));
            return Ok(Completion::Done);
        }

        // partially created until the task finishes
        inner
            .resources
            .insert(spec.id.clone(), observe(spec, ResourceStatus::Stopped));
        let script = Self::script_for(&mut inner, CallKind::Create, &spec.id);
        let handle = self.spawn_task(
            &mut inner,
            TaskOperation::Create,
            script,
            Effect::Create(spec.id.clone()),
        );
        Ok(Completion::Task(handle))
    }

    async fn update(&self, id: &ResourceId, attributes: &Attributes) -> ClientResult<Completion> {
        let mut inner = self.lock();
        self.enter(&mut inner, CallKind::Update, id)?;
        if !inner.resources.contains_key(id) {
            return Err(ClientError::NotFound(id.to_string()));
        }

        let effect = Effect::Update(id.clone(), attributes.clone());
        if !id.kind.is_guest() {
            apply_effect(&mut inner, &effect, true);
            return Ok(Completion::Done);
        }
        let script = Self::script_for(&mut inner, CallKind::Update, id);
        let handle = self.spawn_task(&mut inner, TaskOperation::Update, script, effect);
        Ok(Completion::Task(handle))
    }

    async fn delete(&self, id: &ResourceId) -> ClientResult<Completion> {
        let mut inner = self.lock();
        self.enter(&mut inner, CallKind::Delete, id)?;
        if !inner.resources.contains_key(id) {
            return Err(ClientError::NotFound(id.to_string()));
        }

        let effect = Effect::Delete(id.clone());
        if !id.kind.is_guest() {
            apply_effect(&mut inner, &effect, true);
            return Ok(Completion::Done);
        }
        let script = Self::script_for(&mut inner, CallKind::Delete, id);
        let handle = self.spawn_task(&mut inner, TaskOperation::Delete, script, effect);
        Ok(Completion::Task(handle))
    }

    async fn task_status(&self, handle: &TaskHandle) -> ClientResult<TaskStatus> {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(&handle.id) else {
            return Err(ClientError::NotFound(format!("task {}", handle.id)));
        };
        task.polls += 1;

        if let Some(result) = &task.result {
            return Ok(result.clone());
        }
        if matches!(task.script, TaskScript::Hang) {
            return Ok(TaskStatus::Running);
        }
        if task.remaining_polls > 0 {
            task.remaining_polls -= 1;
            return Ok(TaskStatus::Running);
        }

        let status = match &task.script {
            TaskScript::Fail(reason) => TaskStatus::Failed(reason.clone()),
            TaskScript::Succeed | TaskScript::Hang => TaskStatus::Succeeded,
        };
        task.result = Some(status.clone());
        let effect = task.effect.clone();

        inner.outstanding = inner.outstanding.saturating_sub(1);
        apply_effect(&mut inner, &effect, status == TaskStatus::Succeeded);
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm_spec() -> ResourceSpec {
        ResourceSpec::new(ResourceId::vm(301))
            .with_attr(attr::MEMORY, 2048u32)
            .with_attr(attr::IP, "10.100.2.21/24")
            .with_attr(attr::SSH_KEYS, vec!["ssh-ed25519 AAAA".to_string()])
    }

    async fn finish(client: &InMemoryClient, completion: Completion) -> TaskStatus {
        let Completion::Task(handle) = completion else {
            return TaskStatus::Succeeded;
        };
        loop {
            match client.task_status(&handle).await.unwrap() {
                TaskStatus::Running => continue,
                done => return done,
            }
        }
    }

    #[tokio::test]
    async fn test_guest_create_runs_as_task() {
        let client = InMemoryClient::new();
        let completion = client.create(&vm_spec()).await.unwrap();
        assert!(matches!(completion, Completion::Task(_)));
        assert_eq!(
            client.observed(&ResourceId::vm(301)).unwrap().status,
            ResourceStatus::Stopped
        );

        assert_eq!(finish(&client, completion).await, TaskStatus::Succeeded);
        let state = client.read(&ResourceId::vm(301)).await.unwrap();
        assert!(state.is_running());
        assert_eq!(state.address.as_deref(), Some("10.100.2.21"));
        assert!(!state.attributes.contains_key(attr::SSH_KEYS));
    }

    #[tokio::test]
    async fn test_network_create_is_immediate_and_conflicts() {
        let client = InMemoryClient::new();
        let zone = ResourceSpec::new(ResourceId::zone("labzone")).with_attr(attr::TYPE, "simple");
        assert_eq!(client.create(&zone).await.unwrap(), Completion::Done);
        assert!(matches!(
            client.create(&zone).await,
            Err(ClientError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_absent_is_not_found() {
        let client = InMemoryClient::new();
        let err = client.delete(&ResourceId::vm(301)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let client = InMemoryClient::new();
        let id = ResourceId::vm(301);
        client.fail_next(CallKind::Read, &id, ClientError::Transient("503".to_string()));

        assert!(client.read(&id).await.unwrap_err().is_transient());
        assert!(client.read(&id).await.unwrap_err().is_not_found());

        client.fail_task_of(CallKind::Create, &id, "clone failed");
        let completion = client.create(&vm_spec()).await.unwrap();
        assert_eq!(
            finish(&client, completion).await,
            TaskStatus::Failed("clone failed".to_string())
        );
        assert_eq!(client.observed(&id).unwrap().status, ResourceStatus::Error);
        assert_eq!(
            client.mutations_for(&id),
            vec![CallKind::Create]
        );
    }
}
