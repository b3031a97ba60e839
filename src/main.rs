use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use axum::{routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;
use credit_ledger::config::{self, LedgerConfig};
use credit_ledger::credits::{LedgerServices, LedgerStore, MemoryLedgerStore, PgLedgerStore};
use credit_ledger::routes;
use sqlx::postgres::PgPoolOptions;
use tokio::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast without a webhook secret
    let webhook_secret = config::CREDIT_WEBHOOK_SECRET
        .clone()
        .ok_or_else(|| anyhow!("CREDIT_WEBHOOK_SECRET or CREDIT_WEBHOOK_SECRET_FILE must be set"))?;
    if config::CREDIT_ADMIN_TOKEN.is_none() {
        tracing::warn!("CREDIT_ADMIN_TOKEN unset; operator endpoints will reject every request");
    }

    let store: Arc<dyn LedgerStore> = match config::DATABASE_URL.as_deref() {
        Some(db_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(db_url)
                .await
                .context("connecting to DATABASE_URL")?;

            if let Err(error) = sqlx::migrate!().run(&pool).await {
                if *config::ALLOW_MIGRATION_FAILURE {
                    tracing::warn!(
                        ?error,
                        "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
                    );
                } else {
                    return Err(error.into());
                }
            }
            Arc::new(PgLedgerStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL unset; balances are kept in memory and lost on restart");
            Arc::new(MemoryLedgerStore::new())
        }
    };

    let services = LedgerServices::new(
        store,
        LedgerConfig::from_env(),
        webhook_secret.as_bytes(),
        config::CREDIT_ADMIN_TOKEN.clone(),
    );
    services
        .scheduler()
        .spawn(Duration::from_secs(*config::CREDIT_RESET_SCAN_INTERVAL_SECS));
    services
        .idempotency
        .clone()
        .spawn_sweeper(Duration::from_secs(
            *config::CREDIT_IDEMPOTENCY_SWEEP_INTERVAL_SECS,
        ));

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(routes::app(services))
        .layer(prometheus_layer);

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .context("parsing BIND_ADDRESS and BIND_PORT")?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
