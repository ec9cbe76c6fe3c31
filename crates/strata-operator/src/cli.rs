//! Command line and environment configuration

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, Subcommand};

use strata_common::config::{
    OperatorConfig, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_HEALTH_CHECK_DEADLINE,
    DEFAULT_MAX_CONFLICT_RETRIES, DEFAULT_RESTART_BUDGET, DEFAULT_RESYNC_INTERVAL,
    DEFAULT_STORE_TIMEOUT, DEFAULT_WORKERS,
};
use strata_common::telemetry::LogFormat;

/// Strata - operator for StrataCluster compute clusters
#[derive(Parser, Debug)]
#[command(name = "strata-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print the StrataCluster CRD as YAML and exit
    #[arg(long)]
    pub crd: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the controller (default mode)
    Run(RunArgs),
}

impl Cli {
    /// Run arguments, falling back to flag/env defaults when no subcommand was given
    pub fn run_args(self) -> RunArgs {
        match self.command {
            Some(Command::Run(args)) => args,
            None => RunArgs::parse_from(["run"]),
        }
    }
}

/// Controller settings
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Namespace to watch (all namespaces when unset)
    #[arg(long, env = "STRATA_NAMESPACE")]
    pub namespace: Option<String>,

    /// Concurrent reconcile workers
    #[arg(long, env = "STRATA_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Seconds between full resyncs
    #[arg(long, env = "STRATA_RESYNC_INTERVAL_SECS", default_value_t = DEFAULT_RESYNC_INTERVAL.as_secs())]
    pub resync_interval_secs: u64,

    /// Immediate retries of a conflicting write within one pass
    #[arg(long, env = "STRATA_MAX_CONFLICT_RETRIES", default_value_t = DEFAULT_MAX_CONFLICT_RETRIES)]
    pub max_conflict_retries: u32,

    /// Seconds a pending generation may take to become ready
    #[arg(long, env = "STRATA_HEALTH_CHECK_DEADLINE_SECS", default_value_t = DEFAULT_HEALTH_CHECK_DEADLINE.as_secs())]
    pub health_check_deadline_secs: u64,

    /// Container restarts tolerated before a unit is considered failed
    #[arg(long, env = "STRATA_RESTART_BUDGET", default_value_t = DEFAULT_RESTART_BUDGET)]
    pub restart_budget: i32,

    /// Seconds before a store call is abandoned
    #[arg(long, env = "STRATA_STORE_TIMEOUT_SECS", default_value_t = DEFAULT_STORE_TIMEOUT.as_secs())]
    pub store_timeout_secs: u64,

    /// First retry delay after a failed pass, in milliseconds
    #[arg(long, env = "STRATA_BACKOFF_BASE_MS", default_value_t = DEFAULT_BACKOFF_BASE.as_millis() as u64)]
    pub backoff_base_ms: u64,

    /// Longest retry delay after repeated failures, in seconds
    #[arg(long, env = "STRATA_BACKOFF_MAX_SECS", default_value_t = DEFAULT_BACKOFF_MAX.as_secs())]
    pub backoff_max_secs: u64,

    /// Only run reconcile workers while holding the leader lease
    #[arg(long, env = "STRATA_LEADER_ELECT")]
    pub leader_elect: bool,

    /// Address for /healthz and /readyz
    #[arg(long, env = "STRATA_PROBE_ADDR", default_value = "0.0.0.0:8081")]
    pub probe_addr: SocketAddr,

    /// Log output: json or text
    #[arg(long, env = "STRATA_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,
}

impl RunArgs {
    /// Validated operator configuration
    pub fn operator_config(&self) -> Result<OperatorConfig, strata_common::Error> {
        let config = OperatorConfig {
            namespace: self.namespace.clone(),
            workers: self.workers,
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            max_conflict_retries: self.max_conflict_retries,
            health_check_deadline: Duration::from_secs(self.health_check_deadline_secs),
            restart_budget: self.restart_budget,
            store_timeout: Duration::from_secs(self.store_timeout_secs),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_secs(self.backoff_max_secs),
            ..OperatorConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}
