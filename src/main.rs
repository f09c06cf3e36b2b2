use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderName, HeaderValue, Method};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use rag_chat::config::{AppConfig, KvBackend};
use rag_chat::db::PgChatRepository;
use rag_chat::kv::memory::InMemoryStore;
use rag_chat::kv::postgres::PgKeyValueStore;
use rag_chat::kv::SharedStore;
use rag_chat::routes::identity::USER_ID_HEADER;
use rag_chat::service::chat_service::ChatService;
use rag_chat::upstream::RagClient;

const KV_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development convenience)
    dotenvy::dotenv().ok();

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rag_chat=debug,tower_http=debug".into()),
        )
        .init();

    let config = AppConfig::from_env()?;

    // ── Database ──────────────────────────────────────────────────────────────
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("Database connection established and migrations applied");

    // ── Shared state for rate limits and cancellation flags ───────────────────
    let store: SharedStore = match config.kv_backend {
        KvBackend::Memory => Arc::new(InMemoryStore::with_cleanup(KV_SWEEP_INTERVAL)),
        KvBackend::Postgres => {
            let store = PgKeyValueStore::new(pool.clone());
            tokio::spawn(purge_expired_entries(store.clone()));
            Arc::new(store)
        }
    };
    info!("Using {:?} key-value backend", config.kv_backend);

    // ── Dependency wiring ─────────────────────────────────────────────────────
    let repo = Arc::new(PgChatRepository::new(pool.clone()));
    let backend = Arc::new(RagClient::new(&config.upstream)?);
    info!("Generation backend at {} (mode {})", config.upstream.base_url, config.upstream.query_mode);
    let chat_service = ChatService::new(repo, backend, store, config.chat.clone());

    // ── Router ────────────────────────────────────────────────────────────────
    let app = rag_chat::routes::router(chat_service)
        .layer(cors_layer(config.cors_allowed_origin.as_deref())?)
        .layer(TraceLayer::new_for_http());

    // ── Listen ────────────────────────────────────────────────────────────────
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{addr}/");

    axum::serve(listener, app).await?;
    Ok(())
}

fn cors_layer(allowed_origin: Option<&str>) -> anyhow::Result<CorsLayer> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(USER_ID_HEADER)]);
    Ok(match allowed_origin {
        Some(origin) => layer.allow_origin(origin.parse::<HeaderValue>()?),
        None => layer.allow_origin(Any),
    })
}

async fn purge_expired_entries(store: PgKeyValueStore) {
    let mut ticker = tokio::time::interval(KV_SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(e) = store.purge_expired().await {
            error!("KV purge failed: {e}");
        }
    }
}
