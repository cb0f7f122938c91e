//! Application startup and lifecycle management.

use crate::config::ReconciliationConfig;
use crate::handlers;
use crate::services::metrics::http_metrics_middleware;
use crate::services::{
    init_metrics, Database, HttpPaymentGateway, InMemoryPaymentLedger, InMemoryRuleStore,
    InMemoryTransactionStore, PaymentGateway, ReconciliationEngine, ReportingService, RuleService,
    RuleStore, TransactionStore,
};
use axum::{
    extract::Request,
    middleware,
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{request_id_middleware, REQUEST_ID_HEADER};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ReconciliationConfig,
    pub transactions: Arc<dyn TransactionStore>,
    pub engine: Arc<ReconciliationEngine>,
    pub rules: RuleService,
    pub reporting: ReportingService,
}

impl AppState {
    /// Wire the engine and its services over the given storage and payment
    /// collaborator.
    pub fn new(
        config: ReconciliationConfig,
        transactions: Arc<dyn TransactionStore>,
        rules: Arc<dyn RuleStore>,
        payments: Arc<dyn PaymentGateway>,
    ) -> Self {
        let engine = Arc::new(ReconciliationEngine::new(
            transactions.clone(),
            rules.clone(),
            payments.clone(),
            &config,
        ));
        Self {
            rules: RuleService::new(rules),
            reporting: ReportingService::new(transactions.clone(), payments),
            transactions,
            engine,
            config,
        }
    }

    /// Build state from configuration: PostgreSQL when a database is
    /// configured, in-memory stores otherwise; the HTTP payment ledger when a
    /// URL is configured, an in-memory ledger otherwise.
    pub async fn from_config(
        config: ReconciliationConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        let (transactions, rules): (Arc<dyn TransactionStore>, Arc<dyn RuleStore>) =
            match &config.database {
                Some(db_config) => {
                    let db = Database::new(
                        db_config.url.expose_secret(),
                        db_config.max_connections,
                        db_config.min_connections,
                    )
                    .await
                    .map_err(|e| {
                        tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                        e
                    })?;

                    if run_migrations {
                        db.run_migrations().await.map_err(|e| {
                            tracing::error!(error = %e, "Failed to run migrations");
                            e
                        })?;
                    }

                    let db = Arc::new(db);
                    (db.clone(), db)
                }
                None => {
                    tracing::warn!("DATABASE_URL not set - using in-memory stores");
                    (
                        Arc::new(InMemoryTransactionStore::new()),
                        Arc::new(InMemoryRuleStore::new()),
                    )
                }
            };

        let payments: Arc<dyn PaymentGateway> = match &config.payment_ledger.url {
            Some(url) => Arc::new(HttpPaymentGateway::new(url, config.payment_ledger.timeout)?),
            None => {
                tracing::warn!("PAYMENT_LEDGER_URL not set - using an in-memory payment ledger");
                Arc::new(InMemoryPaymentLedger::new())
            }
        };

        Ok(Self::new(config, transactions, rules, payments))
    }
}

/// The HTTP surface with its middleware stack.
pub fn router(state: AppState) -> Router {
    let reconciliation = Router::new()
        .route("/import", post(handlers::import_transactions))
        .route("/transactions", get(handlers::list_transactions))
        .route("/transactions/:id", get(handlers::get_transaction))
        .route("/transactions/:id/unmatch", post(handlers::unmatch))
        .route("/match", post(handlers::manual_match))
        .route("/write-off", post(handlers::write_off))
        .route(
            "/rules",
            get(handlers::list_rules).post(handlers::create_rule),
        )
        .route(
            "/rules/:id",
            get(handlers::get_rule)
                .put(handlers::update_rule)
                .delete(handlers::delete_rule),
        )
        .route("/summary", get(handlers::summary))
        .route("/missing-payments", get(handlers::missing_payments))
        .route("/report", get(handlers::period_report));

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request| {
            let request_id = req
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            tracing::info_span!(
                "http_request",
                method = %req.method(),
                uri = %req.uri(),
                request_id = %request_id,
                owner_id = tracing::field::Empty,
            )
        })
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .nest("/reconciliation", reconciliation)
        .layer(middleware::from_fn(http_metrics_middleware))
        .layer(trace_layer)
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: ReconciliationConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this when migrations are applied out of band.
    pub async fn build_without_migrations(config: ReconciliationConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: ReconciliationConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let addr = SocketAddr::new(
            config.common.host.parse().map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!(
                    "Invalid host '{}': {}",
                    config.common.host,
                    e
                ))
            })?,
            config.common.port,
        );
        let state = AppState::from_config(config, run_migrations).await?;

        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Reconciliation service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        tracing::info!(
            service = "reconciliation-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, router(self.state)).await
    }
}
