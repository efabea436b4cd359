//! Common test utilities for reconciliation tests
//!
//! In-memory stand-ins for every seam the reconciler talks through: the
//! Kubernetes API, Event recorder, source fetchers and the automation engine.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use async_trait::async_trait;
use stack_controller::controller::reconciler::driver::{
    AutomationDriver, DriverError, OutputValue, StackInfo, StackOutputs, UpdateResult,
};
use stack_controller::controller::reconciler::events::{EventPublisher, StackEvent};
use stack_controller::controller::reconciler::source::{
    AcquiredSource, SourceError, SourceProvider, SourceSpec, Workspace,
};
use stack_controller::controller::reconciler::stack_config::StackConfig;
use stack_controller::controller::reconciler::store::{ResourceStore, StackKey, StoreError};
use stack_controller::controller::reconciler::Reconciler;
use stack_controller::config::ControllerConfig;
use stack_controller::crd::{Permalink, SourceReference, Stack};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub const NAMESPACE: &str = "infra";

/// Build a Stack from its JSON manifest
pub fn stack_from_json(value: serde_json::Value) -> Stack {
    serde_json::from_value(value).expect("valid Stack manifest")
}

/// A Stack tracking `main` of a git repository
pub fn git_stack(name: &str) -> Stack {
    stack_from_json(serde_json::json!({
        "apiVersion": "pulumi.com/v1",
        "kind": "Stack",
        "metadata": {"name": name, "namespace": NAMESPACE},
        "spec": {
            "stack": format!("acme/{name}/prod"),
            "gitRepo": {
                "projectRepo": "https://github.com/acme/network",
                "branch": "main"
            }
        }
    }))
}

pub fn key(name: &str) -> StackKey {
    StackKey::new(NAMESPACE, name)
}

/// Config with short waits so deletion paths finish quickly
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        deletion_wait_timeout_ms: 200,
        deletion_poll_interval_ms: 5,
        finalizer_visible_timeout_ms: 50,
        ..ControllerConfig::default()
    }
}

#[derive(Default)]
struct StoreState {
    stacks: HashMap<StackKey, Stack>,
    next_version: u64,
    secrets: HashMap<(String, String), BTreeMap<String, Vec<u8>>>,
    config_maps: HashMap<(String, String), BTreeMap<String, String>>,
    source_objects: HashMap<(String, String), serde_json::Value>,
    pending_conflicts: usize,
    writes: usize,
    retain_released: bool,
    failing_status_writes: bool,
}

/// In-memory API server
///
/// Writes are checked against `resourceVersion` like the real API, and a
/// deleting Stack disappears once its last finalizer is removed.
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_stack(&self, mut stack: Stack) {
        let mut state = self.state.lock().unwrap();
        state.next_version += 1;
        stack.metadata.resource_version = Some(state.next_version.to_string());
        state.stacks.insert(StackKey::from_stack(&stack), stack);
    }

    pub fn stack(&self, key: &StackKey) -> Option<Stack> {
        self.state.lock().unwrap().stacks.get(key).cloned()
    }

    pub fn insert_secret(&self, name: &str, data: &[(&str, &str)]) {
        let data = data
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.as_bytes().to_vec()))
            .collect();
        self.state
            .lock()
            .unwrap()
            .secrets
            .insert((NAMESPACE.to_string(), name.to_string()), data);
    }

    pub fn insert_config_map(&self, name: &str, data: &[(&str, &str)]) {
        let data = data
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        self.state
            .lock()
            .unwrap()
            .config_maps
            .insert((NAMESPACE.to_string(), name.to_string()), data);
    }

    pub fn insert_source_object(&self, name: &str, object: serde_json::Value) {
        self.state
            .lock()
            .unwrap()
            .source_objects
            .insert((NAMESPACE.to_string(), name.to_string()), object);
    }

    /// Fail the next `count` Stack writes with a conflict
    pub fn inject_conflicts(&self, count: usize) {
        self.state.lock().unwrap().pending_conflicts = count;
    }

    /// Injected conflicts not yet consumed
    pub fn pending_conflicts(&self) -> usize {
        self.state.lock().unwrap().pending_conflicts
    }

    /// Keep deleting Stacks around after their last finalizer is removed
    pub fn retain_released(&self) {
        self.state.lock().unwrap().retain_released = true;
    }

    /// Reject every status write with an API error
    pub fn fail_status_writes(&self) {
        self.state.lock().unwrap().failing_status_writes = true;
    }

    /// Successful Stack writes so far
    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    fn write(
        &self,
        incoming: &Stack,
        apply: impl FnOnce(&mut Stack, &Stack),
    ) -> Result<Stack, StoreError> {
        let key = StackKey::from_stack(incoming);
        let mut state = self.state.lock().unwrap();
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(StoreError::Conflict {
                key: key.to_string(),
                message: "injected conflict".to_string(),
            });
        }
        state.next_version += 1;
        let version = state.next_version.to_string();
        let stored = state.stacks.get_mut(&key).ok_or_else(|| StoreError::NotFound {
            kind: "Stack",
            key: key.to_string(),
        })?;
        if stored.metadata.resource_version != incoming.metadata.resource_version {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                message: "the object has been modified".to_string(),
            });
        }
        apply(stored, incoming);
        stored.metadata.resource_version = Some(version);
        let result = stored.clone();
        let released = result.is_being_deleted()
            && result.metadata.finalizers.as_ref().is_none_or(Vec::is_empty);
        if released && !state.retain_released {
            state.stacks.remove(&key);
        }
        state.writes += 1;
        Ok(result)
    }
}

#[async_trait]
impl ResourceStore for FakeStore {
    async fn get_stack(&self, key: &StackKey) -> Result<Stack, StoreError> {
        self.stack(key).ok_or_else(|| StoreError::NotFound {
            kind: "Stack",
            key: key.to_string(),
        })
    }

    async fn update_stack(&self, stack: &Stack) -> Result<Stack, StoreError> {
        self.write(stack, |stored, incoming| {
            stored.metadata.finalizers = incoming.metadata.finalizers.clone();
            stored.spec = incoming.spec.clone();
        })
    }

    async fn update_stack_status(&self, stack: &Stack) -> Result<Stack, StoreError> {
        if self.state.lock().unwrap().failing_status_writes {
            return Err(StoreError::Api("status subresource unavailable".to_string()));
        }
        self.write(stack, |stored, incoming| {
            stored.status = incoming.status.clone();
        })
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_source_object(
        &self,
        namespace: &str,
        source: &SourceReference,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .source_objects
            .get(&(namespace.to_string(), source.name.clone()))
            .cloned())
    }
}

/// Keeps every published event for assertions
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<(StackEvent, String)>>,
}

impl RecordingEventPublisher {
    pub fn events(&self) -> Vec<(StackEvent, String)> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<StackEvent> {
        self.events().into_iter().map(|(event, _)| event).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(&self, _stack: &Stack, event: StackEvent, message: String) {
        self.events.lock().unwrap().push((event, message));
    }
}

/// Hands out empty workspaces at a settable revision
pub struct FakeSourceProvider {
    revision: Mutex<String>,
    acquired: Mutex<usize>,
}

impl FakeSourceProvider {
    pub fn new(revision: &str) -> Self {
        Self {
            revision: Mutex::new(revision.to_string()),
            acquired: Mutex::new(0),
        }
    }

    pub fn set_revision(&self, revision: &str) {
        *self.revision.lock().unwrap() = revision.to_string();
    }

    pub fn acquired(&self) -> usize {
        *self.acquired.lock().unwrap()
    }
}

#[async_trait]
impl SourceProvider for FakeSourceProvider {
    async fn acquire(
        &self,
        source: SourceSpec<'_>,
        repo_dir: Option<&str>,
    ) -> Result<AcquiredSource, SourceError> {
        let revision = match source {
            SourceSpec::Git { .. } => self.revision.lock().unwrap().clone(),
            SourceSpec::Artifact { object } => object
                .pointer("/status/artifact/revision")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| SourceError::InvalidSourceObject("no revision".to_string()))?,
        };
        let mut workspace = Workspace::create("stack-test-").map_err(|source| SourceError::Io {
            context: "creating workspace".to_string(),
            source,
        })?;
        workspace.set_repo_dir(repo_dir);
        *self.acquired.lock().unwrap() += 1;
        Ok(AcquiredSource {
            workspace,
            revision,
        })
    }
}

/// Result the fake engine gives for the next `up`
#[derive(Debug, Clone)]
pub enum ScriptedUpdate {
    Succeeded(Option<&'static str>),
    Conflict,
    NotFound,
    Failed(&'static str),
}

fn command_failure(command: &str, stdout: &str, stderr: &str) -> DriverError {
    DriverError::Command {
        command: command.to_string(),
        code: Some(255),
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

/// Records every call in order and answers from a script
#[derive(Default)]
pub struct FakeDriver {
    calls: Mutex<Vec<String>>,
    updates: Mutex<VecDeque<ScriptedUpdate>>,
    outputs: Mutex<StackOutputs>,
    info_url: Mutex<Option<String>>,
    config: Mutex<StackConfig>,
    env: Mutex<BTreeMap<String, String>>,
    refresh_failure: Mutex<Option<&'static str>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, operation: &str) -> bool {
        self.calls().iter().any(|c| c == operation)
    }

    /// Queue results for upcoming `up` calls; an empty queue succeeds
    pub fn script_update(&self, update: ScriptedUpdate) {
        self.updates.lock().unwrap().push_back(update);
    }

    pub fn set_output(&self, name: &str, value: serde_json::Value, secret: bool) {
        self.outputs
            .lock()
            .unwrap()
            .insert(name.to_string(), OutputValue { value, secret });
    }

    pub fn clear_outputs(&self) {
        self.outputs.lock().unwrap().clear();
    }

    pub fn set_info_url(&self, url: &str) {
        *self.info_url.lock().unwrap() = Some(url.to_string());
    }

    pub fn fail_refresh(&self, stdout: &'static str) {
        *self.refresh_failure.lock().unwrap() = Some(stdout);
    }

    /// Config passed to the last `set_all_config`
    pub fn applied_config(&self) -> StackConfig {
        self.config.lock().unwrap().clone()
    }

    /// Workspace environment seen by the last `up`
    pub fn update_env(&self) -> BTreeMap<String, String> {
        self.env.lock().unwrap().clone()
    }

    fn record(&self, operation: &str) {
        self.calls.lock().unwrap().push(operation.to_string());
    }
}

#[async_trait]
impl AutomationDriver for FakeDriver {
    async fn select_stack(
        &self,
        _ws: &Workspace,
        _stack: &str,
        create: bool,
    ) -> Result<(), DriverError> {
        self.record(if create { "select --create" } else { "select" });
        Ok(())
    }

    async fn get_all_config(&self, _ws: &Workspace, _stack: &str) -> Result<StackConfig, DriverError> {
        self.record("get_all_config");
        Ok(StackConfig::new())
    }

    async fn set_all_config(
        &self,
        _ws: &Workspace,
        _stack: &str,
        config: &StackConfig,
    ) -> Result<(), DriverError> {
        self.record("set_all_config");
        *self.config.lock().unwrap() = config.clone();
        Ok(())
    }

    async fn save_stack_settings(
        &self,
        _ws: &Workspace,
        _stack: &str,
        _secrets_provider: Option<&str>,
    ) -> Result<(), DriverError> {
        self.record("save_stack_settings");
        Ok(())
    }

    async fn install_dependencies(&self, _ws: &Workspace) -> Result<(), DriverError> {
        self.record("install_dependencies");
        Ok(())
    }

    async fn refresh(
        &self,
        _ws: &Workspace,
        _stack: &str,
        _expect_no_changes: bool,
    ) -> Result<Option<Permalink>, DriverError> {
        self.record("refresh");
        match *self.refresh_failure.lock().unwrap() {
            Some(stdout) => Err(command_failure("pulumi refresh", stdout, "error: refresh failed")),
            None => Ok(Some(Permalink("https://app.example.com/refresh/1".to_string()))),
        }
    }

    async fn up(&self, ws: &Workspace, _stack: &str) -> UpdateResult {
        self.record("up");
        *self.env.lock().unwrap() = ws.env_vars().clone();
        let next = self.updates.lock().unwrap().pop_front();
        match next.unwrap_or(ScriptedUpdate::Succeeded(None)) {
            ScriptedUpdate::Succeeded(permalink) => UpdateResult::Succeeded {
                permalink: permalink.map(|p| Permalink(p.to_string())),
            },
            ScriptedUpdate::Conflict => UpdateResult::Conflict(command_failure(
                "pulumi up",
                "",
                "error: [409] Conflict: Another update is currently in progress.",
            )),
            ScriptedUpdate::NotFound => {
                UpdateResult::NotFound(command_failure("pulumi up", "", "error: [404] Not found"))
            }
            ScriptedUpdate::Failed(stdout) => {
                UpdateResult::Failed(command_failure("pulumi up", stdout, "error: update failed"))
            }
        }
    }

    async fn outputs(&self, _ws: &Workspace, _stack: &str) -> Result<StackOutputs, DriverError> {
        self.record("outputs");
        Ok(self.outputs.lock().unwrap().clone())
    }

    async fn destroy(&self, _ws: &Workspace, _stack: &str) -> Result<(), DriverError> {
        self.record("destroy");
        Ok(())
    }

    async fn remove_stack(&self, _ws: &Workspace, _stack: &str) -> Result<(), DriverError> {
        self.record("remove_stack");
        Ok(())
    }

    async fn info(&self, _ws: &Workspace, stack: &str) -> Result<StackInfo, DriverError> {
        self.record("info");
        Ok(StackInfo {
            name: stack.to_string(),
            url: self.info_url.lock().unwrap().clone(),
        })
    }
}

/// A reconciler wired to fakes, with handles to each of them
///
/// The engine starts with one output so successful passes record status.
pub struct Harness {
    pub store: Arc<FakeStore>,
    pub events: Arc<RecordingEventPublisher>,
    pub sources: Arc<FakeSourceProvider>,
    pub driver: Arc<FakeDriver>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new(revision: &str) -> Self {
        let store = Arc::new(FakeStore::new());
        let events = Arc::new(RecordingEventPublisher::default());
        let sources = Arc::new(FakeSourceProvider::new(revision));
        let driver = Arc::new(FakeDriver::new());
        driver.set_output("endpoint", serde_json::json!("https://network.example.com"), false);
        let reconciler = Reconciler::new(
            store.clone(),
            events.clone(),
            sources.clone(),
            driver.clone(),
            test_config(),
        );
        Self {
            store,
            events,
            sources,
            driver,
            reconciler,
        }
    }
}
