//! HTTP gateway for Parley.
//!
//! Serves the chat event stream, the thread store API used by clients to
//! persist their transcript, document extraction, and an operational log
//! stream of domain events.
//!
//! Built on Axum.

pub mod api_v1;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method, header};
use axum::extract::State;
use axum::{Router, response::Json, routing::get};
use parley_agent::ConversationEngine;
use parley_config::{AppConfig, StoreBackend, StoreConfig};
use parley_core::document::{DocumentExtractor, PlainTextExtractor};
use parley_core::error::{ProviderError, StoreError};
use parley_core::profile::{ProfileSource, StaticProfiles};
use parley_core::store::ConversationStore;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

/// Header carrying the organization scope on thread routes.
pub const ORG_HEADER: &str = "x-org-id";

/// Shared application state.
pub struct GatewayState {
    pub engine: ConversationEngine,
    pub store: Arc<dyn ConversationStore>,
    pub profiles: Arc<dyn ProfileSource>,
    pub extractor: Arc<dyn DocumentExtractor>,
    pub start_time: chrono::DateTime<chrono::Utc>,
}

pub type SharedState = Arc<GatewayState>;

impl GatewayState {
    pub fn new(engine: ConversationEngine, store: Arc<dyn ConversationStore>) -> Self {
        Self {
            engine,
            store,
            profiles: Arc::new(StaticProfiles::default()),
            extractor: Arc::new(PlainTextExtractor::default()),
            start_time: chrono::Utc::now(),
        }
    }

    pub fn with_profiles(mut self, profiles: Arc<dyn ProfileSource>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn DocumentExtractor>) -> Self {
        self.extractor = extractor;
        self
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build the full router: `/health` plus the v1 API.
///
/// Layers: 1 MB body limit, CORS for the local web client, HTTP trace logging.
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::exact(HeaderValue::from_static("http://localhost:8080")))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::HeaderName::from_static(ORG_HEADER)])
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .with_state(state.clone())
        .nest("/v1", api_v1::v1_router(state))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Open the configured conversation store.
pub async fn build_store(config: &StoreConfig) -> Result<Arc<dyn ConversationStore>, StoreError> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(parley_store::InMemoryStore::new())),
        StoreBackend::Sqlite => {
            let path = config.resolved_path();
            info!(path = %path.display(), "Opening SQLite store");
            Ok(Arc::new(parley_store::SqliteStore::open(&path).await?))
        }
    }
}

/// Build every subsystem once from configuration.
pub async fn build_state(config: &AppConfig) -> Result<SharedState, GatewayError> {
    let provider = parley_providers::build_from_config(config)?;
    let tools = Arc::new(parley_tools::default_registry());
    let engine = ConversationEngine::from_config(config, provider, tools);
    let store = build_store(&config.store).await?;

    Ok(Arc::new(
        GatewayState::new(engine, store).with_profiles(Arc::new(StaticProfiles::new(config.profiles.clone()))),
    ))
}

/// Serve the router on an already bound listener.
pub async fn serve(listener: TcpListener, state: SharedState) -> Result<(), GatewayError> {
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

/// Start the gateway HTTP server.
pub async fn start(config: AppConfig) -> Result<(), GatewayError> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let state = build_state(&config).await?;

    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, model = %config.model, store = state.store.name(), "Gateway listening");
    serve(listener, state).await
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
}

async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    let uptime = chrono::Utc::now()
        .signed_duration_since(state.start_time)
        .num_seconds()
        .max(0) as u64;
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: uptime,
    })
}
