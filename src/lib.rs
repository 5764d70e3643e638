//! fedireads - ActivityPub inbox for a federated book-review server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - POST /inbox, /inbox/:username, /user/:username/inbox     │
//! │  - /health, /metrics                                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Federation Layer                           │
//! │  - ActivityRouter: parse, verify signature, route, enqueue  │
//! │  - WorkerPool + InboxProcessor: apply activities            │
//! │  - Actor fetching, key cache, outbound delivery             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `federation`: ActivityPub inbox pipeline
//! - `data`: Database layer
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;
use std::time::Duration;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Inbox admission gate
    pub inbox: Arc<federation::ActivityRouter>,
}

impl AppState {
    /// Initialize application state and start the inbox workers
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build the HTTP client used for actor fetches and deliveries
    /// 3. Start the worker pool
    /// 4. Wire the signature verifier and queue into the inbox router
    ///
    /// The returned pool stops once the state (and every clone) is dropped.
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(
        config: config::AppConfig,
    ) -> Result<(Self, federation::WorkerPool), error::AppError> {
        tracing::info!("Initializing application state...");

        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        let http_client = Arc::new(federation::federation_client(&config.federation)?);
        let guard = federation::DestinationGuard::new(config.federation.allow_private_addresses);

        let fetcher: Arc<dyn federation::ActorFetcher> =
            Arc::new(federation::HttpActorFetcher::new(http_client.clone(), guard));
        if config.federation.allow_private_addresses {
            tracing::warn!("Fetching actors from private addresses is allowed");
        }

        let keys = Arc::new(federation::PublicKeyCache::new(
            db.clone(),
            fetcher.clone(),
            Some(Duration::from_secs(config.federation.key_cache_ttl_seconds)),
        ));
        let verifier = Arc::new(federation::HttpSignatureVerifier::new(
            keys,
            config.federation.signature_max_age_seconds,
        ));

        let processor = Arc::new(federation::InboxProcessor::new(
            db.clone(),
            federation::ActorResolver::new(db.clone(), fetcher),
            Arc::new(federation::ActivityDelivery::new(http_client, guard)),
        ));
        let (queue, pool) = federation::WorkerPool::spawn(processor, &config.federation);

        let inbox = Arc::new(federation::ActivityRouter::new(verifier, Arc::new(queue)));

        tracing::info!("Application state initialized successfully");

        Ok((Self::from_parts(config, db, inbox), pool))
    }

    /// Assemble state from already-built components
    pub fn from_parts(
        config: config::AppConfig,
        db: Arc<data::Database>,
        inbox: Arc<federation::ActivityRouter>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            db,
            inbox,
        }
    }
}

/// Largest activity body accepted by the inboxes
const MAX_INBOX_BODY_BYTES: usize = 1024 * 1024;

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::inbox_router())
        .layer(RequestBodyLimitLayer::new(MAX_INBOX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
