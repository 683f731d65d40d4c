use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::{fmt, EnvFilter};

use tuition_ledger::billing::{
    spawn_billing_scheduler, BillingContext, EnrollmentDirectory, HttpPaymentGateway,
    LedgerStore, LoggingNotifier, MemoryLedgerStore, PgEnrollmentDirectory, PgLedgerStore,
    StaticEnrollmentDirectory,
};
use tuition_ledger::config::{self, BillingConfig};
use tuition_ledger::job_queue::start_worker;
use tuition_ledger::routes::api_routes;
use tuition_ledger::webhooks::GatewayWebhookSecret;

async fn root() -> &'static str {
    "Tuition Ledger API"
}

async fn connect_ledger() -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(*config::DATABASE_MAX_CONNECTIONS)
        .connect(config::DATABASE_URL.as_str())
        .await
        .context("connecting to the ledger database")?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(error).context("running ledger migrations");
        }
    }
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let billing_config = BillingConfig::from_env();

    let (pool, store, enrollment) = match config::LEDGER_BACKEND.as_str() {
        "memory" => {
            tracing::warn!("using the in-memory ledger; nothing survives a restart");
            (
                None,
                Arc::new(MemoryLedgerStore::new()) as Arc<dyn LedgerStore>,
                Arc::new(StaticEnrollmentDirectory::new()) as Arc<dyn EnrollmentDirectory>,
            )
        }
        _ => {
            let pool = connect_ledger().await?;
            (
                Some(pool.clone()),
                Arc::new(PgLedgerStore::new(pool.clone())) as Arc<dyn LedgerStore>,
                Arc::new(PgEnrollmentDirectory::new(pool)) as Arc<dyn EnrollmentDirectory>,
            )
        }
    };

    let gateway = HttpPaymentGateway::new(
        config::PAYMENT_GATEWAY_URL.as_str(),
        (*config::PAYMENT_GATEWAY_API_KEY).clone(),
        billing_config.gateway_timeout,
    )
    .context("building the payment gateway client")?;
    if config::PAYMENT_GATEWAY_WEBHOOK_SECRET.is_none() {
        tracing::warn!("PAYMENT_GATEWAY_WEBHOOK_SECRET is unset; gateway callbacks will be refused");
    }

    let context = BillingContext::new(
        store,
        enrollment,
        Arc::new(gateway),
        Arc::new(LoggingNotifier),
        billing_config,
    )
    .with_reconciliation_worker();
    let jobs = start_worker(context.clone(), pool);
    spawn_billing_scheduler(context.clone(), jobs.clone());

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(context))
        .layer(Extension(jobs))
        .layer(Extension(GatewayWebhookSecret::from_env()));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .context("parsing the bind address")?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
