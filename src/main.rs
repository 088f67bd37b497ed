use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use http::HeaderValue;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod db;
mod error;
mod routes;
mod services;

use config::Config;
use services::agent::{AgentClient, MonitoringAgent};
use services::email::EmailService;
use services::scheduler::Scheduler;
use services::webhook::WebhookDeliveryService;

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub scheduler: Scheduler,
    pub agent: Arc<dyn MonitoringAgent>,
    pub email: Arc<EmailService>,
    pub webhook: Arc<WebhookDeliveryService>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "torale=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Torale task engine");

    // Initialize database
    let pool = db::init_db(&config).await?;

    let app_state = Arc::new(AppState {
        db: pool,
        scheduler: Scheduler::new(),
        agent: Arc::new(AgentClient::new(config.agent.clone())),
        email: Arc::new(EmailService::new(config.email.clone())),
        webhook: Arc::new(WebhookDeliveryService::new(config.webhook.clone())),
        config: config.clone(),
    });

    // Rebuild the scheduler's job set from the tasks table before anything
    // can fire or be served.
    app_state.scheduler.reconcile(&app_state.db).await?;
    tracing::info!(
        "Scheduler jobs reconciled from database ({} job(s))",
        app_state.scheduler.job_count()
    );

    // Spawn the scheduler tick loop and the system maintenance workers.
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let mut worker_handles =
        services::scheduler::spawn_system_workers(app_state.clone(), shutdown_tx.clone());
    {
        let state = app_state.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        worker_handles.push(tokio::spawn(async move {
            services::scheduler::run(state, shutdown_rx).await;
        }));
    }

    // Build router: operational surface only (the REST API for task CRUD
    // lives in a separate service).
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/stats", get(routes::stats::stats))
        .route(
            "/internal/tasks/:task_id/executions",
            post(routes::executions::run_now),
        )
        .route(
            "/internal/tasks/:task_id/state",
            post(routes::tasks::transition),
        )
        .route(
            "/internal/users/:user_id/notification-emails",
            post(routes::verification::request_code),
        )
        .route(
            "/internal/users/:user_id/notification-emails/verify",
            post(routes::verification::verify_code),
        )
        .with_state(app_state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(
                    config
                        .server
                        .frontend_url
                        .parse::<HeaderValue>()
                        .expect("Invalid FRONTEND_URL for CORS"),
                )
                .allow_methods([http::Method::GET, http::Method::POST])
                .allow_headers([http::header::CONTENT_TYPE, http::header::ACCEPT]),
        );

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
    })
    .await?;

    // Stop background workers and wait for them to drain.
    let _ = shutdown_tx.send(());
    for handle in worker_handles {
        let _ = handle.await;
    }

    tracing::info!("Torale task engine shut down");
    Ok(())
}
