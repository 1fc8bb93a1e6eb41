use std::{net::SocketAddr, sync::Arc};

use axum::http::HeaderValue;
use tokio::{
    signal,
    sync::{mpsc, watch},
};
use tower_http::cors::{AllowHeaders, AllowMethods, CorsLayer};
use tracing::{error, info, warn};

use dtbank_api as api;
use api::message_queue::{InMemoryMessageQueue, MessageQueue, RedisMessageQueue};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(&cfg.log_level, cfg.log_json);

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    // Lifecycle events
    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = api::events::EventSender::new(event_tx);
    tokio::spawn(api::events::process_events(event_rx));

    // Broker
    let message_queue: Arc<dyn MessageQueue> = if cfg.uses_redis_queue() {
        let client = redis::Client::open(cfg.redis_url.clone())?;
        let queue = RedisMessageQueue::connect(client, cfg.message_queue_namespace.clone()).await?;
        for binding in api::events::BINDINGS {
            queue.recover(binding.queue).await?;
        }
        Arc::new(queue)
    } else {
        warn!("Using in-memory message queue; undelivered events are lost on restart");
        Arc::new(InMemoryMessageQueue::new())
    };

    let auth_service = Arc::new(api::auth::AuthService::new(api::auth::AuthConfig::new(
        cfg.jwt_secret.clone(),
        cfg.auth_issuer.clone(),
        cfg.auth_audience.clone(),
    )));

    let services = api::handlers::AppServices::new(db_arc.clone(), &cfg, event_sender.clone())?;

    // Background workers: outbox relay and cascade consumers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = vec![api::events::outbox::start_worker(
        api::events::outbox::OutboxRelay::new((*db_arc).clone(), message_queue.clone()),
        cfg.outbox_poll_interval(),
        shutdown_rx.clone(),
    )];
    workers.extend(api::events::consumers::spawn_consumers(
        api::cascade_subscriptions(&services),
        message_queue,
        cfg.consumer_poll_interval(),
        shutdown_rx,
    ));

    let app_state = api::AppState {
        db: db_arc,
        config: cfg.clone(),
        event_sender,
        services,
    };

    let app = api::build_router(app_state, auth_service).layer(cors_layer(&cfg));

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port).parse()?;
    info!("dtbank-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped; draining background workers");
    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(e) = worker.await {
            error!("Background worker ended abnormally: {}", e);
        }
    }

    Ok(())
}

fn cors_layer(cfg: &api::config::AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = cfg
        .cors_origins()
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    if !origins.is_empty() {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(AllowMethods::mirror_request())
            .allow_headers(AllowHeaders::mirror_request())
            .allow_credentials(cfg.cors_allow_credentials)
    } else if cfg.is_development() {
        info!("Using permissive CORS in development");
        CorsLayer::permissive()
    } else {
        // Same-origin only.
        CorsLayer::new()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
