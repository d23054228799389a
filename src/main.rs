use actix_web::{error::JsonPayloadError, web, App, HttpRequest, HttpServer};
use edu_chat_service::{
    config, db,
    error::{self, AppError},
    logging,
    metrics::{self, HubMetrics},
    presence::{InMemoryPresence, PresenceStore, RedisPresence},
    redis_client::RedisClient,
    routes,
    services::RelatedUsers,
    state::{AppState, Stores},
    store::{InMemoryStore, PgStore},
    websocket::ConnectionRegistry,
};
use mockable::DefaultClock;
use std::sync::Arc;

fn json_error(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    AppError::BadRequest(err.to_string()).into()
}

fn query_error(err: actix_web::error::QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    AppError::BadRequest(err.to_string()).into()
}

fn path_error(err: actix_web::error::PathError, _req: &HttpRequest) -> actix_web::Error {
    AppError::BadRequest(err.to_string()).into()
}

#[tokio::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = Arc::new(config::Config::from_env()?);

    let stores = match cfg.database_url.as_deref() {
        Some(url) => {
            let pool = db::init_pool(url, cfg.db_max_connections).await?;
            Stores::from_single(Arc::new(PgStore::new(pool)))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
            Stores::from_single(Arc::new(InMemoryStore::new()))
        }
    };

    let presence: Arc<dyn PresenceStore> = match cfg.redis_url.as_deref() {
        Some(url) => {
            let redis = RedisClient::from_url(url)
                .await
                .map_err(|e| AppError::StartServer(format!("redis: {e}")))?;
            Arc::new(RedisPresence::new(redis))
        }
        None => {
            tracing::warn!("REDIS_URL not set, presence is process-local");
            Arc::new(InMemoryPresence::new())
        }
    };

    let hub_metrics = HubMetrics::new()
        .map_err(|e| AppError::StartServer(format!("metrics registry: {e}")))?;
    let registry = ConnectionRegistry::new(
        presence.clone(),
        cfg.presence.clone(),
        cfg.ws.send_buffer,
    )
    .with_metrics(hub_metrics)
    .with_status_audience(Arc::new(RelatedUsers::new(
        stores.chat.clone(),
        stores.friends.clone(),
    )));
    let _heartbeat = registry.spawn_presence_heartbeat();

    let state = web::Data::new(AppState::new(
        stores,
        presence,
        registry,
        Arc::new(DefaultClock),
        cfg.clone(),
    ));

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(%bind_addr, "starting edu-chat-service");

    HttpServer::new(move || {
        let cors = actix_cors::Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .app_data(state.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error))
            .app_data(web::QueryConfig::default().error_handler(query_error))
            .app_data(web::PathConfig::default().error_handler(path_error))
            .configure(routes::configure)
            .route("/health", web::get().to(|| async { "OK" }))
            .route("/metrics", web::get().to(metrics::metrics_handler))
    })
    .bind(&bind_addr)
    .map_err(|e| AppError::StartServer(format!("bind REST: {e}")))?
    .run()
    .await
    .map_err(|e| AppError::StartServer(format!("REST server: {e}")))
}
