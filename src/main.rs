use std::sync::Arc;

use axum::{http::Method, routing::get, Router};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bearlink_preview::config::Config;
use bearlink_preview::handlers;
use bearlink_preview::preview::{HttpFetcher, PreviewService};
use bearlink_preview::queue::{AmqpBroker, ConsumerSettings, JobConsumer, QueueTopology};
use bearlink_preview::state::AppState;

#[tokio::main]
async fn main() {
    // Configuration first: the log level comes from it.
    let config = Config::from_env().expect("Failed to load configuration");

    // Initialize tracing: JSON in production, human-readable in dev.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_filter()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.is_production {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "🚀 BearLink Preview Service starting..."
    );
    info!(
        timeout_secs = config.request_timeout.as_secs(),
        workers = config.preview_workers,
        "📝 Configuration loaded"
    );

    let fetcher = HttpFetcher::new(config.request_timeout).expect("Failed to build HTTP client");
    let previews = PreviewService::new(Arc::new(fetcher));

    // CORS: the preview endpoint is read-only and public.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    let app_state = AppState {
        previews: previews.clone(),
    };

    // Build router
    let app = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::ready_check))
        .route("/preview", get(handlers::preview::get_preview))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state);

    let addr = config.server_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    // Cancellation token shared by the HTTP server and the job consumer.
    let cancel = CancellationToken::new();

    let consumer_task = if config.job_consumer_enabled {
        let topology = QueueTopology::from_config(&config);
        let broker = AmqpBroker::new(config.rabbitmq_url.clone(), topology);
        let consumer = JobConsumer::new(broker, previews, ConsumerSettings::from_config(&config));
        Some(tokio::spawn(consumer.run(cancel.clone())))
    } else {
        info!("⏸️  Job consumer disabled (JOB_CONSUMER_ENABLED=false)");
        None
    };

    info!("🎧 Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .expect("Server failed to start");

    // Stop the consumer and wait for it to drain before exiting.
    cancel.cancel();
    if let Some(task) = consumer_task {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Job consumer task failed");
        }
    }

    info!("👋 Server shutdown complete");
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => {}
    }

    info!("Shutdown signal received");
}
