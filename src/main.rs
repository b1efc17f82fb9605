use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use tokio::sync::watch;

use realtime_distribution_service::auth::TokenValidator;
use realtime_distribution_service::config::Config;
use realtime_distribution_service::error::AppError;
use realtime_distribution_service::routes::wsroute;
use realtime_distribution_service::services::{
    ConsumerPool, EventPublisher, EventRouter, FanoutDispatcher, LogQuarantine, RetryPolicy,
    RetrySupervisor,
};
use realtime_distribution_service::websocket::messages::CLOSE_NORMAL;
use realtime_distribution_service::websocket::session::REASON_SHUTDOWN;
use realtime_distribution_service::websocket::{SessionManager, SubscriptionRegistry};
use realtime_distribution_service::{logging, metrics, AppState};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    logging::init_tracing();
    let cfg = Arc::new(Config::from_env()?);

    let validator = Arc::new(TokenValidator::new(&cfg.auth)?);
    let registry = Arc::new(SubscriptionRegistry::new());
    let sessions = Arc::new(SessionManager::new(
        registry.clone(),
        cfg.session.clone(),
        &cfg.wire,
    ));
    let dispatcher = Arc::new(FanoutDispatcher::new(registry.clone(), sessions.clone()));
    let router = Arc::new(EventRouter::new(dispatcher.clone()));
    let supervisor = Arc::new(RetrySupervisor::new(
        RetryPolicy::default(),
        Arc::new(LogQuarantine),
    ));

    let publisher = if cfg.publisher_enabled {
        Some(Arc::new(EventPublisher::new(&cfg.broker.bootstrap_servers)?))
    } else {
        tracing::info!("outbound publisher disabled");
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool = ConsumerPool::new(cfg.broker.clone(), router, supervisor);
    let consumer_handles = pool.spawn(shutdown_rx.clone());
    let _liveness_scan = sessions.spawn_liveness_scan(shutdown_rx.clone());

    let state = AppState {
        config: cfg.clone(),
        validator,
        registry,
        sessions: sessions.clone(),
        dispatcher,
        publisher,
    };

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(%bind_addr, "starting realtime-distribution-service");

    let allow_any_origin = cfg.allows_any_origin();
    let allowed_origins = cfg.wire.allowed_origins.clone();
    let server = HttpServer::new(move || {
        let cors = if allow_any_origin {
            Cors::default().allow_any_origin()
        } else {
            allowed_origins
                .iter()
                .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
        };
        let cors = cors.allow_any_method().allow_any_header().max_age(3600);

        App::new()
            .wrap(cors)
            .app_data(web::Data::new(state.clone()))
            .service(wsroute::ws_positions)
            .service(wsroute::ws_inventory)
            .service(wsroute::ws_locates)
            .service(wsroute::ws_alerts)
            .service(wsroute::ws_admin_rules)
            .route("/health", web::get().to(|| async { "OK" }))
            .route("/metrics", web::get().to(metrics::serve_metrics))
    })
    .disable_signals()
    .bind(&bind_addr)
    .map_err(|e| AppError::StartServer(format!("bind: {e}")))?
    .run();

    // Shutdown order: stop accepting connections, stop consumers, close
    // sessions with a grace window, then let the server drain.
    let server_handle = server.handle();
    let shutdown_sessions = sessions.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
        shutdown_sessions.close_all(CLOSE_NORMAL, REASON_SHUTDOWN);
        server_handle.stop(true).await;
    });

    server
        .await
        .map_err(|e| AppError::StartServer(format!("server: {e}")))?;

    let drain_consumers = async {
        for handle in consumer_handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(30), drain_consumers)
        .await
        .is_err()
    {
        tracing::warn!("hard shutdown deadline reached before consumer workers drained");
    }

    tracing::info!("realtime-distribution-service stopped");
    Ok(())
}
