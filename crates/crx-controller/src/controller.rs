//! ContainerRuntime reconciliation controller
//!
//! Each pass fetches the object, resolves its Cluster, classifies it into
//! exactly one phase (Migrate, Delete, Restore or Reconcile) and runs that
//! phase's handler around the actuator. Status records and finalizers are
//! kept consistent with what the actuator did; everything the scheduler
//! needs to decide on a retry is carried by the returned [`Error`].

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crx_common::crd::{ContainerRuntime, LastOperationType};
use crx_common::kube_utils::object_name;
use crx_common::{Error, CONTAINER_RUNTIME_FINALIZER, OPERATION_ANNOTATION};

use crate::actuator::{Actuator, OperationContext};
use crate::backoff::{BackoffConfig, FailureBackoff};
use crate::cluster::{ClusterDescriptor, ClusterResolver, KubeClusterResolver};
use crate::finalizer::FinalizerManager;
use crate::operation::{classify, has_reconcile_trigger, should_skip, Phase};
use crate::owner::{guard_ownership, DisabledWatchdog, OwnerWatchdog, OwnershipLease};
use crate::status::StatusReporter;
use crate::store::{KubeRuntimeStore, MetadataChange, ObjectKey, RuntimeStore};

/// Default delay before re-checking an object whose shoot belongs to another seed
pub const DEFAULT_OWNER_RECHECK: Duration = Duration::from_secs(60);

// =============================================================================
// Configuration
// =============================================================================

/// Controller settings
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Runtime types (`spec.type`) this controller serves
    pub extension_types: Vec<String>,
    /// Requeue delay after the ownership check refused an object
    pub owner_recheck: Duration,
    /// Failure backoff for the error policy
    pub backoff: BackoffConfig,
    /// Finalizer token managed by this controller
    pub finalizer: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            extension_types: vec!["gvisor".to_string()],
            owner_recheck: DEFAULT_OWNER_RECHECK,
            backoff: BackoffConfig::default(),
            finalizer: CONTAINER_RUNTIME_FINALIZER.to_string(),
        }
    }
}

impl ControllerConfig {
    /// Whether objects of `runtime_type` are handled by this controller
    pub fn serves(&self, runtime_type: &str) -> bool {
        self.extension_types.iter().any(|t| t == runtime_type)
    }
}

// =============================================================================
// Context
// =============================================================================

/// Controller context shared by all reconcile passes
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client, actuator)
///     .watchdog(watchdog)
///     .config(config)
///     .build();
/// ```
pub struct Context {
    /// Store for ContainerRuntime objects
    pub store: Arc<dyn RuntimeStore>,
    /// Resolver for the Cluster of a namespace
    pub clusters: Arc<dyn ClusterResolver>,
    /// Shoot ownership watchdog
    pub watchdog: Arc<dyn OwnerWatchdog>,
    /// Actuator performing the operations
    pub actuator: Arc<dyn Actuator>,
    /// Status reporter writing through `store`
    pub status: StatusReporter,
    /// Finalizer manager writing through `store`
    pub finalizers: FinalizerManager,
    /// Per-object failure backoff used by [`error_policy`]
    pub backoff: FailureBackoff,
    /// Root token, cancelled on shutdown; every pass derives from it
    pub shutdown: CancellationToken,
    /// Settings
    pub config: ControllerConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, actuator: Arc<dyn Actuator>) -> ContextBuilder {
        ContextBuilder::new(client, actuator)
    }

    fn assemble(
        store: Arc<dyn RuntimeStore>,
        clusters: Arc<dyn ClusterResolver>,
        watchdog: Arc<dyn OwnerWatchdog>,
        actuator: Arc<dyn Actuator>,
        shutdown: CancellationToken,
        config: ControllerConfig,
    ) -> Self {
        Self {
            status: StatusReporter::new(store.clone()),
            finalizers: FinalizerManager::new(store.clone(), config.finalizer.clone()),
            backoff: FailureBackoff::new(config.backoff.clone()),
            store,
            clusters,
            watchdog,
            actuator,
            shutdown,
            config,
        }
    }

    /// Create a context for testing with in-memory or mock collaborators
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn RuntimeStore>,
        clusters: Arc<dyn ClusterResolver>,
        watchdog: Arc<dyn OwnerWatchdog>,
        actuator: Arc<dyn Actuator>,
    ) -> Self {
        Self::assemble(
            store,
            clusters,
            watchdog,
            actuator,
            CancellationToken::new(),
            ControllerConfig::default(),
        )
    }
}

/// Builder for constructing [`Context`] instances
///
/// Collaborators that are not set explicitly talk to the API server through
/// the given client. Owner checks are off unless a watchdog is set.
pub struct ContextBuilder {
    client: Client,
    actuator: Arc<dyn Actuator>,
    store: Option<Arc<dyn RuntimeStore>>,
    clusters: Option<Arc<dyn ClusterResolver>>,
    watchdog: Option<Arc<dyn OwnerWatchdog>>,
    shutdown: Option<CancellationToken>,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(client: Client, actuator: Arc<dyn Actuator>) -> Self {
        Self {
            client,
            actuator,
            store: None,
            clusters: None,
            watchdog: None,
            shutdown: None,
            config: ControllerConfig::default(),
        }
    }

    /// Override the ContainerRuntime store
    pub fn store(mut self, store: Arc<dyn RuntimeStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the Cluster resolver
    pub fn cluster_resolver(mut self, clusters: Arc<dyn ClusterResolver>) -> Self {
        self.clusters = Some(clusters);
        self
    }

    /// Set the shoot ownership watchdog
    pub fn watchdog(mut self, watchdog: Arc<dyn OwnerWatchdog>) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    /// Set the root cancellation token
    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Set controller settings
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let client = self.client;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(KubeRuntimeStore::new(client.clone())));
        let clusters = self
            .clusters
            .unwrap_or_else(|| Arc::new(KubeClusterResolver::new(client.clone())));
        let watchdog = self.watchdog.unwrap_or_else(|| Arc::new(DisabledWatchdog));
        Context::assemble(
            store,
            clusters,
            watchdog,
            self.actuator,
            self.shutdown.unwrap_or_default(),
            self.config,
        )
    }
}

// =============================================================================
// Reconcile entry point
// =============================================================================

/// Reconcile a ContainerRuntime
///
/// The watched object is only used for its identity; the pass works on a
/// fresh read from the store.
#[instrument(skip(runtime, ctx), fields(containerruntime = %object_name(runtime.as_ref())))]
pub async fn reconcile(runtime: Arc<ContainerRuntime>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = ObjectKey::for_runtime(&runtime)?;
    let result = reconcile_object(&key, &ctx).await;
    if result.is_ok() {
        ctx.backoff.reset(&key);
    }
    result
}

async fn reconcile_object(key: &ObjectKey, ctx: &Context) -> Result<Action, Error> {
    let Some(runtime) = ctx.store.get(key).await? else {
        debug!("containerruntime no longer exists");
        return Ok(Action::await_change());
    };

    if !ctx.config.serves(&runtime.spec.type_) {
        debug!(runtime_type = %runtime.spec.type_, "containerruntime type not handled by this controller");
        return Ok(Action::await_change());
    }

    let cluster = ctx.clusters.resolve(&key.namespace).await?;
    if cluster.is_failed() {
        info!(cluster = %cluster.name, "Skipping the reconciliation of containerruntime of failed shoot");
        return Ok(Action::await_change());
    }

    let classification = classify(&runtime);

    // Held until the pass returns; dropping it unregisters from the watchdog
    let lease = match &cluster.shoot {
        Some(shoot) if classification.phase != Phase::Migrate => {
            guard_ownership(ctx.watchdog.as_ref(), &ctx.shutdown, key, shoot).await?
        }
        _ => OwnershipLease::detached(ctx.shutdown.child_token()),
    };

    if should_skip(classification.operation_type, &runtime) {
        debug!("containerruntime has been migrated, skipping");
        return Ok(Action::await_change());
    }

    let runtime = if has_reconcile_trigger(&runtime) {
        remove_operation_annotation(ctx, &runtime).await?
    } else {
        runtime
    };

    let op = OperationContext::new(lease.token().clone());
    info!(phase = %classification.phase, operation = %classification.operation_type, "dispatching containerruntime");

    match classification.phase {
        Phase::Migrate => reconcile_migrate(ctx, &op, runtime, &cluster).await,
        Phase::Delete => reconcile_delete(ctx, &op, runtime, &cluster).await,
        Phase::Restore => reconcile_restore(ctx, &op, runtime, &cluster).await,
        Phase::Reconcile => reconcile_apply(ctx, &op, runtime, &cluster).await,
    }
}

// =============================================================================
// Phase handlers
// =============================================================================

struct PhaseMessages {
    processing: &'static str,
    error: &'static str,
    success: &'static str,
}

fn messages(phase: Phase) -> PhaseMessages {
    match phase {
        Phase::Reconcile => PhaseMessages {
            processing: "Reconciling the containerruntime",
            error: "Error reconciling containerruntime",
            success: "Successfully reconciled containerruntime",
        },
        Phase::Restore => PhaseMessages {
            processing: "Restoring the containerruntime",
            error: "Error restoring containerruntime",
            success: "Successfully restored containerruntime",
        },
        Phase::Delete => PhaseMessages {
            processing: "Deleting the containerruntime",
            error: "Error deleting containerruntime",
            success: "Successfully deleted containerruntime",
        },
        Phase::Migrate => PhaseMessages {
            processing: "Migrating the containerruntime",
            error: "Error migrating containerruntime",
            success: "Successfully migrated containerruntime",
        },
    }
}

/// Fail once the operation token is cancelled, before the next store write
///
/// A guarded pass is cancelled by the watchdog when the shoot changed owner;
/// an unguarded one only by shutdown.
fn ensure_active(
    op: &OperationContext,
    phase: Phase,
    cluster: &ClusterDescriptor,
    step: &str,
) -> Result<(), Error> {
    if !op.is_cancelled() {
        return Ok(());
    }
    warn!(phase = %phase, step, "operation cancelled, stopping before the next write");
    Err(match &cluster.shoot {
        Some(shoot) if phase != Phase::Migrate => Error::not_owner(shoot.object_name()),
        _ => Error::internal_with_context("shutdown", format!("operation cancelled before {}", step)),
    })
}

/// Report Processing, call the actuator, then report Succeeded or Error
async fn run_operation(
    ctx: &Context,
    op: &OperationContext,
    phase: Phase,
    operation: LastOperationType,
    runtime: ContainerRuntime,
    cluster: &ClusterDescriptor,
) -> Result<ContainerRuntime, Error> {
    let messages = messages(phase);
    let runtime = ctx
        .status
        .processing(&runtime, operation, messages.processing)
        .await?;

    let result = match phase {
        Phase::Reconcile => ctx.actuator.reconcile(op, &runtime, cluster).await,
        Phase::Restore => ctx.actuator.restore(op, &runtime, cluster).await,
        Phase::Delete => ctx.actuator.delete(op, &runtime, cluster).await,
        Phase::Migrate => ctx.actuator.migrate(op, &runtime, cluster).await,
    };

    if let Err(err) = result {
        warn!(phase = %phase, error = %err, "{}", messages.error);
        if op.is_cancelled() {
            debug!(phase = %phase, "operation cancelled, not recording the error");
        } else {
            ctx.status
                .error(&runtime, err.cause(), operation, messages.error)
                .await;
        }
        return Err(Error::actuator(operation, err));
    }

    ensure_active(op, phase, cluster, "recording success")?;
    let runtime = ctx
        .status
        .success(&runtime, operation, messages.success)
        .await?;
    info!(phase = %phase, "{}", messages.success);
    Ok(runtime)
}

async fn reconcile_apply(
    ctx: &Context,
    op: &OperationContext,
    runtime: ContainerRuntime,
    cluster: &ClusterDescriptor,
) -> Result<Action, Error> {
    let runtime = ensure_finalizer(ctx, &runtime).await?;
    run_operation(
        ctx,
        op,
        Phase::Reconcile,
        LastOperationType::Reconcile,
        runtime,
        cluster,
    )
    .await?;
    Ok(Action::await_change())
}

async fn reconcile_restore(
    ctx: &Context,
    op: &OperationContext,
    runtime: ContainerRuntime,
    cluster: &ClusterDescriptor,
) -> Result<Action, Error> {
    let runtime = ensure_finalizer(ctx, &runtime).await?;
    let runtime = run_operation(
        ctx,
        op,
        Phase::Restore,
        LastOperationType::Restore,
        runtime,
        cluster,
    )
    .await?;
    ensure_active(op, Phase::Restore, cluster, "removing the annotation")?;
    remove_operation_annotation(ctx, &runtime).await?;
    Ok(Action::await_change())
}

async fn reconcile_delete(
    ctx: &Context,
    op: &OperationContext,
    runtime: ContainerRuntime,
    cluster: &ClusterDescriptor,
) -> Result<Action, Error> {
    if !ctx.finalizers.has(&runtime) {
        debug!("Deleting containerruntime causes a no-op as there is no finalizer");
        return Ok(Action::await_change());
    }

    let runtime = run_operation(
        ctx,
        op,
        Phase::Delete,
        LastOperationType::Delete,
        runtime,
        cluster,
    )
    .await?;

    ensure_active(op, Phase::Delete, cluster, "removing the finalizer")?;
    ctx.finalizers
        .remove(&runtime)
        .await
        .map_err(|e| Error::bookkeeping("removing finalizer from the containerruntime", e))?;
    Ok(Action::await_change())
}

async fn reconcile_migrate(
    ctx: &Context,
    op: &OperationContext,
    runtime: ContainerRuntime,
    cluster: &ClusterDescriptor,
) -> Result<Action, Error> {
    let runtime = run_operation(
        ctx,
        op,
        Phase::Migrate,
        LastOperationType::Migrate,
        runtime,
        cluster,
    )
    .await?;

    ensure_active(op, Phase::Migrate, cluster, "removing the finalizers")?;
    let runtime = ctx
        .finalizers
        .remove_all(&runtime)
        .await
        .map_err(|e| Error::bookkeeping("removing finalizers from the containerruntime", e))?;

    // A migrated object that was also being deleted is gone now
    if runtime.is_deleting() {
        return Ok(Action::await_change());
    }
    ensure_active(op, Phase::Migrate, cluster, "removing the annotation")?;
    remove_operation_annotation(ctx, &runtime).await?;
    Ok(Action::await_change())
}

async fn ensure_finalizer(ctx: &Context, runtime: &ContainerRuntime) -> Result<ContainerRuntime, Error> {
    ctx.finalizers
        .ensure(runtime)
        .await
        .map_err(|e| Error::bookkeeping("adding finalizer to the containerruntime", e))
}

/// Remove the operation trigger annotation; no write if it is absent
async fn remove_operation_annotation(
    ctx: &Context,
    runtime: &ContainerRuntime,
) -> Result<ContainerRuntime, Error> {
    if runtime.annotation(OPERATION_ANNOTATION).is_none() {
        return Ok(runtime.clone());
    }
    ctx.store
        .patch_metadata(
            runtime,
            MetadataChange::RemoveAnnotation(OPERATION_ANNOTATION.to_string()),
        )
        .await
        .map_err(|e| Error::bookkeeping("removing annotation from containerruntime", e))
}

// =============================================================================
// Error policy
// =============================================================================

/// Decide when a failed object is retried
///
/// - an actuator-requested delay is honored as is
/// - ownership refusals are re-checked after `owner_recheck`
/// - errors that retrying cannot fix wait for the object to change
/// - everything else backs off exponentially per object
pub fn error_policy(runtime: Arc<ContainerRuntime>, error: &Error, ctx: Arc<Context>) -> Action {
    if let Some(delay) = error.requeue_after() {
        debug!(containerruntime = %runtime.name_any(), delay_secs = delay.as_secs(), "requeue requested by actuator");
        return Action::requeue(delay);
    }

    if matches!(error, Error::NotOwner { .. }) {
        debug!(containerruntime = %runtime.name_any(), error = %error, "not the shoot owner, re-checking later");
        return Action::requeue(ctx.config.owner_recheck);
    }

    if !error.is_retryable() {
        warn!(containerruntime = %runtime.name_any(), error = %error, "reconciliation failed, waiting for a change");
        return Action::await_change();
    }

    match ObjectKey::for_runtime(&runtime) {
        Ok(key) => {
            let delay = ctx.backoff.next_delay(&key);
            warn!(
                containerruntime = %key,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "reconciliation failed, backing off"
            );
            Action::requeue(delay)
        }
        Err(_) => Action::await_change(),
    }
}
