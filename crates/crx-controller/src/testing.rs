//! Test fixtures and an in-memory store
//!
//! The store behaves like the API server where it matters for the state
//! machine: metadata writes are checked against `resourceVersion`, every
//! write bumps it, and an object marked for deletion disappears once its
//! last finalizer is removed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crx_common::crd::{
    ContainerRuntime, ContainerRuntimeSpec, ContainerRuntimeStatus, LastOperation,
    LastOperationState, LastOperationType, WorkerPoolSelector,
};
use crx_common::{Error, OPERATION_ANNOTATION};

use crate::store::{MetadataChange, ObjectKey, RuntimeStore};

pub const NAMESPACE: &str = "shoot--dev--demo";
pub const NAME: &str = "worker-a-gvisor";

/// A namespaced gvisor ContainerRuntime at resourceVersion 1
pub fn sample_runtime() -> ContainerRuntime {
    let mut runtime = ContainerRuntime::new(
        NAME,
        ContainerRuntimeSpec {
            type_: "gvisor".to_string(),
            provider_config: None,
            binary_path: "/var/bin/containerruntimes".to_string(),
            worker_pool: WorkerPoolSelector {
                name: "worker-a".to_string(),
                selector: BTreeMap::from([(
                    "worker.gardener.cloud/pool".to_string(),
                    "worker-a".to_string(),
                )]),
            },
        },
    );
    runtime.metadata.namespace = Some(NAMESPACE.to_string());
    runtime.metadata.resource_version = Some("1".to_string());
    runtime.metadata.generation = Some(1);
    runtime
}

/// Sample runtime with an optional trigger, deletion marker and last operation
pub fn runtime_with(
    trigger: Option<&str>,
    deleting: bool,
    last_operation: Option<LastOperation>,
) -> ContainerRuntime {
    let mut runtime = sample_runtime();
    if let Some(value) = trigger {
        runtime.metadata.annotations = Some(BTreeMap::from([(
            OPERATION_ANNOTATION.to_string(),
            value.to_string(),
        )]));
    }
    if deleting {
        runtime.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    }
    if last_operation.is_some() {
        runtime.status = Some(ContainerRuntimeStatus {
            last_operation,
            ..Default::default()
        });
    }
    runtime
}

/// Last operation record with the given type and state
pub fn last_op(type_: LastOperationType, state: LastOperationState) -> LastOperation {
    LastOperation::new(type_, state, 0, "")
}

/// A write observed by the in-memory store
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Write {
    Status(LastOperationType, LastOperationState),
    Finalizers(Vec<String>),
    RemoveAnnotation(String),
}

#[derive(Default)]
struct State {
    objects: HashMap<ObjectKey, ContainerRuntime>,
    writes: Vec<Write>,
    fail_status: Option<LastOperationState>,
    fail_metadata: bool,
    after_status: Option<(LastOperationState, StatusHook)>,
}

type StatusHook = Arc<dyn Fn() + Send + Sync>;

/// In-memory [`RuntimeStore`]
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn with(runtime: ContainerRuntime) -> Self {
        let store = Self::default();
        store.insert(runtime);
        store
    }

    pub fn insert(&self, runtime: ContainerRuntime) {
        let key = ObjectKey::for_runtime(&runtime).unwrap();
        self.state.lock().unwrap().objects.insert(key, runtime);
    }

    pub fn object(&self) -> Option<ContainerRuntime> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&ObjectKey::new(NAMESPACE, NAME))
            .cloned()
    }

    pub fn writes(&self) -> Vec<Write> {
        self.state.lock().unwrap().writes.clone()
    }

    /// Fail status writes that record the given state
    pub fn fail_status(&self, state: LastOperationState) {
        self.state.lock().unwrap().fail_status = Some(state);
    }

    /// Fail every metadata write
    pub fn fail_metadata(&self) {
        self.state.lock().unwrap().fail_metadata = true;
    }

    /// Run `hook` right after a status write that records `state` lands
    pub fn after_status(&self, state: LastOperationState, hook: impl Fn() + Send + Sync + 'static) {
        self.state.lock().unwrap().after_status = Some((state, Arc::new(hook)));
    }

    /// Bump the stored resourceVersion as if another writer touched the object
    pub fn touch(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(obj) = state.objects.get_mut(&ObjectKey::new(NAMESPACE, NAME)) {
            bump(obj);
        }
    }
}

fn bump(runtime: &mut ContainerRuntime) {
    let next = runtime
        .metadata
        .resource_version
        .as_deref()
        .and_then(|rv| rv.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    runtime.metadata.resource_version = Some(next.to_string());
}

fn not_found(key: &ObjectKey) -> Error {
    Error::internal_with_context("store", format!("{} not found", key))
}

#[async_trait]
impl RuntimeStore for InMemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ContainerRuntime>, Error> {
        Ok(self.state.lock().unwrap().objects.get(key).cloned())
    }

    async fn patch_status(
        &self,
        runtime: &ContainerRuntime,
        status: &ContainerRuntimeStatus,
    ) -> Result<ContainerRuntime, Error> {
        let key = ObjectKey::for_runtime(runtime)?;
        let op = status.last_operation.as_ref().unwrap();
        let (updated, hook) = {
            let mut state = self.state.lock().unwrap();
            state.writes.push(Write::Status(op.type_, op.state));
            if state.fail_status == Some(op.state) {
                return Err(Error::internal_with_context("store", "status write rejected"));
            }

            let stored = state.objects.get_mut(&key).ok_or_else(|| not_found(&key))?;
            stored.status = Some(status.clone());
            bump(stored);
            let updated = stored.clone();
            let hook = state
                .after_status
                .as_ref()
                .filter(|(on, _)| *on == op.state)
                .map(|(_, hook)| hook.clone());
            (updated, hook)
        };

        if let Some(hook) = hook {
            hook();
        }
        Ok(updated)
    }

    async fn patch_metadata(
        &self,
        runtime: &ContainerRuntime,
        change: MetadataChange,
    ) -> Result<ContainerRuntime, Error> {
        let key = ObjectKey::for_runtime(runtime)?;
        let mut state = self.state.lock().unwrap();
        state.writes.push(match &change {
            MetadataChange::SetFinalizers(f) => Write::Finalizers(f.clone()),
            MetadataChange::RemoveAnnotation(a) => Write::RemoveAnnotation(a.clone()),
        });
        if state.fail_metadata {
            return Err(Error::internal_with_context("store", "metadata write rejected"));
        }

        let stored = state.objects.get_mut(&key).ok_or_else(|| not_found(&key))?;
        if stored.metadata.resource_version != runtime.metadata.resource_version {
            return Err(Error::conflict(
                key.to_string(),
                "the object has been modified; please apply your changes to the latest version",
            ));
        }

        match change {
            MetadataChange::SetFinalizers(finalizers) => {
                stored.metadata.finalizers = Some(finalizers);
            }
            MetadataChange::RemoveAnnotation(annotation) => {
                if let Some(annotations) = stored.metadata.annotations.as_mut() {
                    annotations.remove(&annotation);
                }
            }
        }
        bump(stored);
        let updated = stored.clone();

        if updated.is_deleting()
            && updated.metadata.finalizers.as_ref().map_or(true, Vec::is_empty)
        {
            state.objects.remove(&key);
        }
        Ok(updated)
    }
}
