//! Tidepool - the federation engine of a small ActivityPub-speaking server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Inbox, actor, object, outbox endpoints                   │
//! │  - WebFinger, metrics, health                               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Engine                         │
//! │  - Normalizer, filters, delivery queue                      │
//! │  - Box/key resolvers, signatures, transport                 │
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
//! - `service`: Feeds and follows
//! - `federation`: Inbound normalization, outbound delivery, resolvers
//! - `data`: Database layer
//! - `tasks`: Background task supervision
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;
pub mod tasks;

use std::sync::Arc;
use std::time::Duration;

use federation::{
    BoxResolver, DeliveryEngine, FilterEngine, KeyResolver, MediaMirror, Normalizer,
    PassthroughTranscoder, Tracker, TrackerHandle, Transport,
};

/// RSA key size for generated local users.
const LOCAL_KEY_BITS: usize = 2048;

/// Application state shared across all handlers
///
/// Cloned for each request; everything inside is reference counted.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::AppConfig>,
    pub db: Arc<data::Database>,
    pub transport: Arc<dyn Transport>,
    pub keys: Arc<KeyResolver>,
    pub boxes: Arc<BoxResolver>,
    pub filters: Arc<FilterEngine>,
    pub normalizer: Arc<Normalizer>,
    pub delivery: Arc<DeliveryEngine>,
    pub tracker: TrackerHandle,
    pub feeds: Arc<service::FeedService>,
    pub follows: Arc<service::FollowService>,
    pub inflight: tasks::InflightTracker,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build resolvers, filters, normalizer and delivery engine
    /// 3. Ensure the admin user exists
    ///
    /// The returned [`Tracker`] must be handed to [`AppState::spawn_background`].
    pub async fn new(
        config: config::AppConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, Tracker), error::AppError> {
        tracing::info!("Initializing application state...");

        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        let federation = &config.federation;
        let keys = Arc::new(KeyResolver::new(
            db.clone(),
            transport.clone(),
            config.cache.key_capacity,
            Duration::from_secs(config.cache.key_ttl_secs),
            federation.fast_timeout(),
        ));
        let boxes = Arc::new(BoxResolver::new(
            db.clone(),
            transport.clone(),
            keys.clone(),
            config.cache.box_capacity,
            federation.fast_timeout(),
        ));
        let filters = Arc::new(FilterEngine::new(db.clone()));
        let media = Arc::new(MediaMirror::new(
            db.clone(),
            transport.clone(),
            Arc::new(PassthroughTranscoder),
            federation.max_concurrent_transcodes,
            federation.slow_timeout(),
        ));
        let normalizer = Arc::new(Normalizer::new(
            db.clone(),
            transport.clone(),
            filters.clone(),
            boxes.clone(),
            media,
            federation.archive_path.clone(),
            federation.slow_timeout(),
        ));

        let (tracker, tracker_task) = Tracker::new(db.clone());
        let delivery = Arc::new(DeliveryEngine::new(
            db.clone(),
            transport.clone(),
            boxes.clone(),
            tracker.clone(),
            federation.max_concurrent_deliveries,
            federation.post_timeout(),
        ));

        let feeds = Arc::new(service::FeedService::new(
            db.clone(),
            filters.clone(),
            config.retention.public_feed_days,
        ));
        let follows = Arc::new(service::FollowService::new(
            db.clone(),
            transport.clone(),
            boxes.clone(),
            delivery.clone(),
            federation.fast_timeout(),
        ));

        Self::ensure_admin_user(&db, &config).await?;
        tracing::info!("Application state initialized successfully");

        let state = Self {
            config: Arc::new(config),
            db,
            transport,
            keys,
            boxes,
            filters,
            normalizer,
            delivery,
            tracker,
            feeds,
            follows,
            inflight: tasks::InflightTracker::default(),
        };
        Ok((state, tracker_task))
    }

    /// Local user behind the admin configuration.
    pub async fn admin(&self) -> Result<data::LocalUser, error::AppError> {
        self.db
            .get_user_by_username(&self.config.admin.username)
            .await?
            .ok_or(error::AppError::NotFound)
    }

    /// Ensure the admin user exists, generating its keypair on first start.
    async fn ensure_admin_user(
        db: &data::Database,
        config: &config::AppConfig,
    ) -> Result<(), error::AppError> {
        if let Some(user) = db.get_user_by_username(&config.admin.username).await? {
            tracing::info!(username = %user.username, "Admin user exists");
            return Ok(());
        }

        tracing::info!("Creating admin user...");
        let (private_key_pem, public_key_pem) = federation::generate_keypair(LOCAL_KEY_BITS)?;
        let user = data::LocalUser {
            id: data::EntityId::new().0,
            username: config.admin.username.clone(),
            display_name: config.admin.display_name.clone(),
            url: format!(
                "{}/u/{}",
                config.server.base_url(),
                config.admin.username
            ),
            private_key_pem,
            public_key_pem,
            created_at: chrono::Utc::now(),
        };
        db.insert_user(&user).await?;

        tracing::info!(username = %user.username, url = %user.url, "Admin user created");
        Ok(())
    }

    /// Follow everything listed in `admin.follows`. Failures are logged.
    pub async fn ensure_follows(&self) -> Result<(), error::AppError> {
        if self.config.admin.follows.is_empty() {
            return Ok(());
        }
        let admin = self.admin().await?;
        for target in &self.config.admin.follows {
            if let Err(error) = self.follows.follow(&admin, target).await {
                tracing::warn!(%target, %error, "Unable to follow");
            }
        }
        Ok(())
    }

    /// Start the background loops.
    pub fn spawn_background(&self, tracker: Tracker) -> tasks::Supervisor {
        let mut supervisor = tasks::Supervisor::new();

        supervisor.spawn("tracker", |stop| tracker.run(stop));

        let delivery = self.delivery.clone();
        supervisor.spawn("delivery", |stop| delivery.run(stop));

        let keys = self.keys.clone();
        supervisor.spawn("maintenance", |stop| tasks::maintenance_sweep(keys, stop));

        let interval = self.config.federation.harvest_interval_secs;
        if interval > 0 {
            let db = self.db.clone();
            let normalizer = self.normalizer.clone();
            supervisor.spawn("harvest", move |stop| {
                tasks::harvest_sweep(db, normalizer, Duration::from_secs(interval), stop)
            });
        } else {
            tracing::info!("Outbox harvest disabled");
        }

        supervisor
    }
}

/// Build the Axum router with all routes.
///
/// Shared by the binary and integration tests so route composition is the
/// same in both.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router(state.config.federation.max_inbox_bytes))
        .merge(api::metrics_router())
        .layer(axum::middleware::from_fn_with_state(
            state.inflight.clone(),
            tasks::track_inflight,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
