//! Strata Operator - manages StrataCluster compute clusters on Kubernetes

use std::sync::Arc;

use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tracing::{info, warn};

use strata_cluster::{ClusterReconciler, Context};
use strata_common::crd::StrataCluster;
use strata_common::leader_election::{LeaderElector, LeaderGuard, LEADER_LEASE_NAME};
use strata_common::retry::{retry_with_backoff, RetryConfig};
use strata_common::store::{KubeStore, StateStore};
use strata_common::telemetry::{init_telemetry, TelemetryConfig};
use strata_common::{FIELD_MANAGER, STRATA_SYSTEM_NAMESPACE};
use strata_operator::cli::{Cli, RunArgs};
use strata_operator::health::{self, HealthState};
use strata_runtime::{Controller, ControllerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&StrataCluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run(cli.run_args()).await
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig {
        format: args.log_format,
        ..TelemetryConfig::default()
    })?;
    let config = args.operator_config()?;
    info!(?config, "Strata operator starting");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    retry_with_backoff(&RetryConfig::with_max_attempts(5), "install CRD", || {
        ensure_crd_installed(&client)
    })
    .await?;

    let health = HealthState::default();
    let probe_addr = args.probe_addr;
    let probes = tokio::spawn({
        let health = health.clone();
        async move {
            if let Err(e) = health::serve(probe_addr, health).await {
                warn!(error = %e, "Health probe server stopped");
            }
        }
    });

    let mut leadership = if args.leader_elect {
        Some(acquire_leadership(client.clone()).await?)
    } else {
        None
    };

    let store: Arc<dyn StateStore> = Arc::new(KubeStore::new(client, config.store_timeout));
    let controller_config = ControllerConfig {
        workers: config.workers,
        resync_interval: config.resync_interval,
        namespace: config.namespace.clone(),
    };
    let reconciler = Arc::new(ClusterReconciler::new(Arc::new(Context::new(
        Arc::clone(&store),
        config,
    ))));
    let controller = Controller::new(reconciler, store, controller_config);

    health.set_ready(true);
    controller.run(shutdown_signal(leadership.as_mut())).await;
    health.set_ready(false);

    if let Some(guard) = leadership {
        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release leader lease");
        }
    }
    probes.abort();
    info!("Strata operator stopped");
    Ok(())
}

/// Install or update the StrataCluster CRD so it always matches this binary
async fn ensure_crd_installed(client: &Client) -> Result<(), kube::Error> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let crd = StrataCluster::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();

    info!(crd = %name, "Installing StrataCluster CRD...");
    crds.patch(&name, &params, &Patch::Apply(&crd)).await?;
    Ok(())
}

async fn acquire_leadership(client: Client) -> anyhow::Result<LeaderGuard> {
    let namespace =
        std::env::var("POD_NAMESPACE").unwrap_or_else(|_| STRATA_SYSTEM_NAMESPACE.to_string());
    let identity =
        std::env::var("POD_NAME").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
    let elector = Arc::new(LeaderElector::new(
        client,
        LEADER_LEASE_NAME,
        &namespace,
        &identity,
    ));
    Ok(elector.acquire().await?)
}

/// Resolves on SIGINT, SIGTERM, or loss of the leader lease
async fn shutdown_signal(leadership: Option<&mut LeaderGuard>) {
    let lease_lost = async {
        match leadership {
            Some(guard) => guard.lost().await,
            None => std::future::pending::<()>().await,
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Received Ctrl-C");
        }
        _ = terminate => info!("Received SIGTERM"),
        _ = lease_lost => warn!("Leader lease lost, shutting down"),
    }
}
