//! Command-line and environment configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crx_common::telemetry::{LogConfig, LogFormat};
use crx_controller::{BackoffConfig, ControllerConfig, WatchdogConfig};

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    /// JSON lines
    #[default]
    Json,
    /// Human-readable text
    Text,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Text => LogFormat::Text,
        }
    }
}

/// Operator settings
#[derive(Args, Clone, Debug)]
pub struct OperatorArgs {
    /// Path to a kubeconfig; in-cluster config or `KUBECONFIG` when unset
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// ContainerRuntime types (`spec.type`) handled by this operator
    #[arg(
        long,
        env = "CRX_EXTENSION_TYPES",
        value_delimiter = ',',
        default_value = "gvisor"
    )]
    pub extension_types: Vec<String>,

    /// Maximum number of objects reconciled concurrently
    #[arg(long, default_value_t = 5)]
    pub max_concurrent_reconciles: u16,

    /// Refuse to work on shoots owned by another seed
    #[arg(long, env = "CRX_OWNER_CHECKS")]
    pub owner_checks: bool,

    /// Name of this seed, compared with the holder of the shoot owner Lease
    #[arg(long, env = "CRX_SEED_NAME")]
    pub seed_name: Option<String>,

    /// Seconds between ownership re-checks while an operation runs
    #[arg(long, default_value_t = 30)]
    pub owner_check_interval_secs: u64,

    /// Seconds before an object refused by the ownership check is retried
    #[arg(long, default_value_t = 60)]
    pub owner_recheck_secs: u64,

    /// Requeue delay in seconds after the first failure of an object
    #[arg(long, default_value_t = 5)]
    pub backoff_base_secs: u64,

    /// Upper bound in seconds for the failure requeue delay
    #[arg(long, default_value_t = 300)]
    pub backoff_max_secs: u64,

    /// Install or update the CRDs on startup
    #[arg(long, env = "CRX_INSTALL_CRDS")]
    pub install_crds: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormatArg::Json)]
    pub log_format: LogFormatArg,
}

impl OperatorArgs {
    /// Controller settings derived from the arguments
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            extension_types: self
                .extension_types
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            owner_recheck: Duration::from_secs(self.owner_recheck_secs),
            backoff: BackoffConfig {
                base: Duration::from_secs(self.backoff_base_secs),
                max: Duration::from_secs(self.backoff_max_secs),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Watchdog settings derived from the arguments
    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            interval: Duration::from_secs(self.owner_check_interval_secs),
        }
    }

    /// Logging settings derived from the arguments
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            format: self.log_format.into(),
            ..Default::default()
        }
    }

    /// Seed identity for owner checks; required when they are enabled
    pub fn owner_identity(&self) -> Result<Option<&str>, String> {
        if !self.owner_checks {
            return Ok(None);
        }
        match self.seed_name.as_deref() {
            Some(name) if !name.is_empty() => Ok(Some(name)),
            _ => Err("--seed-name is required when --owner-checks is set".to_string()),
        }
    }
}
