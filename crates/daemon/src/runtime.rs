// Daemon bootstrap: wire the clients, syncers and walker, then run until shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use hubsync_common::document::ResourceKind;
use hubsync_common::interval::ExponentialBackoffPolicy;
use tokio::sync::watch;
use tracing::info;

use crate::authz::client::PolicyClient;
use crate::authz::{Authorizer, PolicyAuthorizer};
use crate::cluster_set::KubeClusterSets;
use crate::config::SyncConfig;
use crate::db::spec::{LabelWriter, PgLabelStore, SpecDb};
use crate::db::status::PgStatusDb;
use crate::git::{FingerprintSource, GitWorker};
use crate::subscription::KubeSubscriptions;
use crate::syncer::{GenericSyncer, ManagedClusterSetTransform, ManagedClustersGroupTransform};
use crate::walker::GitStorageWalker;

pub async fn run(config: SyncConfig) -> Result<()> {
    let pool = crate::db::pool::connect(&config.database)
        .await
        .context("failed to connect to hub-of-hubs PostgreSQL")?;

    let policy =
        PolicyClient::new(&config.authorization).context("failed to build policy engine client")?;
    info!(url = %policy.compile_url(), "policy engine client ready");

    let authorizer: Arc<dyn Authorizer> =
        Arc::new(PolicyAuthorizer::new(policy, PgStatusDb::new(pool.clone())));
    let spec_db: Arc<dyn SpecDb> = Arc::new(LabelWriter::new(PgLabelStore::new(pool.clone())));
    let fingerprints: Arc<dyn FingerprintSource> = Arc::new(GitWorker::new());

    let kube_client =
        kube::Client::try_default().await.context("failed to create Kubernetes client")?;
    let subscriptions =
        Arc::new(KubeSubscriptions::new(kube_client.clone(), &config.subscriptions_namespace));
    let cluster_sets = Arc::new(KubeClusterSets::new(kube_client));

    let mut walker = GitStorageWalker::new(
        config.git_storage_root.clone(),
        subscriptions,
        ExponentialBackoffPolicy::new(config.sync_interval),
        config.full_reconciliation_interval,
    );
    walker.register(
        ResourceKind::ManagedClustersGroup.as_str(),
        Box::new(GenericSyncer::new(
            Arc::clone(&fingerprints),
            ManagedClustersGroupTransform::new(Arc::clone(&authorizer), Arc::clone(&spec_db)),
        )),
    );
    walker.register(
        ResourceKind::ManagedClusterSet.as_str(),
        Box::new(GenericSyncer::new(
            fingerprints,
            ManagedClusterSetTransform::new(authorizer, spec_db, cluster_sets),
        )),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut walker_task = tokio::spawn(walker.run(shutdown_rx));

    tokio::select! {
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(true);
            walker_task.await.context("git storage walker panicked")?;
        }
        joined = &mut walker_task => {
            joined.context("git storage walker panicked")?;
        }
    }

    pool.close().await;
    info!("hubsync daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
