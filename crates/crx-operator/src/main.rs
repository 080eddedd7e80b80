//! crx operator - drives ContainerRuntime resources through their lifecycle

mod actuator;
mod config;
mod runner;

use clap::Parser;
use kube::CustomResourceExt;

use crx_common::crd::{Cluster, ContainerRuntime};
use crx_common::telemetry::init_logging;

use crate::config::OperatorArgs;

/// crx - ContainerRuntime extension controller
#[derive(Parser, Debug)]
#[command(name = "crx-operator", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    args: OperatorArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_manifests()?);
        return Ok(());
    }

    init_logging(cli.args.log_config())?;
    runner::run(cli.args).await
}

/// Multi-document YAML with every crx CRD
fn crd_manifests() -> anyhow::Result<String> {
    let docs = [
        serde_yaml::to_string(&ContainerRuntime::crd()),
        serde_yaml::to_string(&Cluster::crd()),
    ]
    .into_iter()
    .collect::<Result<Vec<_>, _>>()
    .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
    Ok(docs.join("---\n"))
}
