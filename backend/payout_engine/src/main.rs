//! Payout engine — entry point.
//!
//! Starts the retry scheduler and an audit listener as background tasks and
//! exposes the administrative REST API. Ctrl-C stops all three.

use std::sync::Arc;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use payout_engine::api::{self, ApiState};
use payout_engine::config::Config;
use payout_engine::db::{self, SqlitePayoutStore};
use payout_engine::events::{self, EventBus};
use payout_engine::executor::TransactionExecutor;
use payout_engine::ledger::{StellarRpcClient, TransferSigner};
use payout_engine::orchestrator::Orchestrator;
use payout_engine::scheduler::RetryScheduler;
use payout_engine::service::PayoutService;
use payout_engine::store::PayoutStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    let pool = db::init_pool(&config.database_url).await?;
    let store: Arc<dyn PayoutStore> = Arc::new(SqlitePayoutStore::new(pool));

    let client = Client::builder()
        .timeout(std::time::Duration::from_secs(config.http_timeout_secs))
        .build()?;
    let ledger = Arc::new(StellarRpcClient::new(
        client,
        config.rpc_url.clone(),
        config.horizon_url.clone(),
    ));
    let signer = TransferSigner::from_hex_seed(&config.signer_secret)?;
    info!(
        source_account = %config.source_account,
        public_key = %signer.public_key_hex(),
        "Payout signer loaded"
    );
    let executor = Arc::new(TransactionExecutor::new(ledger, signer, config.executor()));

    let bus = EventBus::default();
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        executor,
        bus.clone(),
        config.retry_policy(),
    ));

    let shutdown = CancellationToken::new();

    // ─── Background tasks ─────────────────────────────────
    let scheduler = Arc::new(RetryScheduler::new(
        store.clone(),
        orchestrator.clone(),
        config.scheduler(),
    ));
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));
    let audit_task = tokio::spawn(events::run_audit_listener(bus.subscribe(), shutdown.clone()));

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(ApiState {
        service: Arc::new(PayoutService::new(store, orchestrator)),
    });
    let app = api::router(api_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = tokio::join!(scheduler_task, audit_task);
    Ok(())
}
