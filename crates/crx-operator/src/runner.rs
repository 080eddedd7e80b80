//! Controller runner - wires the ContainerRuntime controller to the API server

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Config as ControllerRuntimeConfig;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crx_common::crd::{Cluster, ContainerRuntime};
use crx_common::kube_utils::create_client;
use crx_common::FIELD_MANAGER;
use crx_controller::{
    error_policy, reconcile, Context, DisabledWatchdog, LeaseOwnerChecker, OwnerWatchdog,
    WatchdogManager,
};

use crate::actuator::ConfigMapActuator;
use crate::config::OperatorArgs;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Run the ContainerRuntime controller until a termination signal arrives
pub async fn run(args: OperatorArgs) -> anyhow::Result<()> {
    let owner_identity = args
        .owner_identity()
        .map_err(anyhow::Error::msg)?
        .map(str::to_string);

    let client = create_client(args.kubeconfig.as_deref()).await?;
    if args.install_crds {
        ensure_crds_installed(&client).await?;
    }

    let watchdog: Arc<dyn OwnerWatchdog> = match owner_identity {
        Some(seed) => {
            info!(seed = %seed, "owner checks enabled");
            Arc::new(WatchdogManager::new(
                LeaseOwnerChecker::new(client.clone(), seed),
                args.watchdog_config(),
            ))
        }
        None => Arc::new(DisabledWatchdog),
    };

    let shutdown = CancellationToken::new();
    let config = args.controller_config();
    info!(types = ?config.extension_types, "starting ContainerRuntime controller");

    let ctx = Arc::new(
        Context::builder(client.clone(), Arc::new(ConfigMapActuator::new(client.clone())))
            .watchdog(watchdog)
            .shutdown(shutdown.clone())
            .config(config)
            .build(),
    );

    let runtimes: Api<ContainerRuntime> = Api::all(client.clone());
    let clusters: Api<Cluster> = Api::all(client);

    let controller = Controller::new(runtimes, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .with_config(ControllerRuntimeConfig::default().concurrency(args.max_concurrent_reconciles));
    let reader = controller.store();

    controller
        // A Cluster change (e.g. the shoot failing or recovering) affects every
        // runtime in the namespace it is named after
        .watches(
            clusters,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
            move |cluster| runtimes_in_namespace(&reader.state(), &cluster.name_any()),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("ContainerRuntime"))
        .await;

    shutdown.cancel();
    info!("ContainerRuntime controller stopped");
    Ok(())
}

/// References to the cached runtimes in `namespace`
fn runtimes_in_namespace(
    runtimes: &[Arc<ContainerRuntime>],
    namespace: &str,
) -> Vec<ObjectRef<ContainerRuntime>> {
    runtimes
        .iter()
        .filter(|r| r.namespace().as_deref() == Some(namespace))
        .map(|r| ObjectRef::from_obj(r.as_ref()))
        .collect()
}

/// Install the crx CRDs with server-side apply
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [ContainerRuntime::crd(), Cluster::crd()] {
        let name = crd.name_any();
        info!(crd = %name, "installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }
    Ok(())
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
