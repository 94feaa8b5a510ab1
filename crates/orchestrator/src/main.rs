//! Worker binary: drains the job queue and drives the periodic loops.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use workbench_orchestrator::auth::HmacTokenIssuer;
use workbench_orchestrator::catalog::{
    ConfigStoragePolicy, NoGradingBackend, NoReservations, StaticCourseDirectory,
    StaticImageCatalog,
};
use workbench_orchestrator::config::OrchestratorConfig;
use workbench_orchestrator::k8s::ClusterClient;
use workbench_orchestrator::orchestrator::{Collaborators, Orchestrator};
use workbench_orchestrator::queue::{spawn_tickers, JobQueue, Worker};
use workbench_orchestrator::store::SqliteSessionStore;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Reconciliation period
const REAP_EVERY: Duration = Duration::from_secs(300);
/// Status polling period
const UPDATE_EVERY: Duration = Duration::from_secs(60);

/// Token signing secret, from the environment or freshly generated
fn token_secret() -> String {
    match std::env::var("WORKBENCH_TOKEN_SECRET") {
        Ok(secret) if !secret.is_empty() => secret,
        _ => {
            warn!("WORKBENCH_TOKEN_SECRET not set; generating an ephemeral signing secret");
            HmacTokenIssuer::generate_secret()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = VERSION, "workbench orchestrator starting");

    let config = OrchestratorConfig::load();
    let store = Arc::new(
        SqliteSessionStore::open(&config.store_path()).context("opening session store")?,
    );
    let cluster = ClusterClient::connect(&config)
        .await
        .context("connecting to cluster")?;
    info!(namespace = cluster.namespace(), "connected to cluster");

    let collab = Collaborators {
        catalog: Arc::new(StaticImageCatalog::from_config(&config.images)),
        storage: Arc::new(ConfigStoragePolicy::new(config.storage.clone())),
        courses: Arc::new(StaticCourseDirectory::default()),
        reserved: Arc::new(NoReservations),
        grading: Arc::new(NoGradingBackend),
        tokens: Arc::new(HmacTokenIssuer::new(token_secret(), 6)),
    };

    let (queue, rx) = JobQueue::new();
    let orchestrator = Arc::new(Orchestrator::new(
        config,
        store,
        cluster,
        collab,
        queue.clone(),
    ));

    let shutdown = CancellationToken::new();
    let worker = Worker::spawn(orchestrator, rx, shutdown.clone());
    let tickers = spawn_tickers(queue, shutdown.clone(), REAP_EVERY, UPDATE_EVERY);

    signal::ctrl_c().await.context("waiting for shutdown")?;
    info!("shutdown requested");

    shutdown.cancel();
    worker.join().await;
    let _ = tickers.await;
    Ok(())
}
