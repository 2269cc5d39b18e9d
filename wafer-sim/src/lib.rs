//! wafer-sim library interface
//!
//! Exposes the simulation engine and the HTTP router for the binary and for
//! integration tests.

pub mod api;
pub mod controller;
pub mod error;
pub mod image_source;
pub mod machine;
pub mod scorer;
pub mod store;

pub use crate::controller::{
    ControllerConfig, ControllerStatus, RunParameters, RunSummary, SimulationController,
};
pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use wafer_common::config::{OutputDirs, TomlConfig};
use wafer_common::events::EventBus;

use crate::image_source::ImageSource;
use crate::scorer::DefectScorer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Bootstrap configuration (run defaults, thresholds)
    pub config: Arc<TomlConfig>,
    /// Where runs write snapshots and image copies
    pub output: OutputDirs,
    pub image_source: Arc<dyn ImageSource>,
    /// `None` runs in degraded mode
    pub scorer: Option<Arc<dyn DefectScorer>>,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Most recent run; a new run may start once it is STOPPED
    pub controller: Arc<RwLock<Option<Arc<SimulationController>>>>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last run failure for diagnostics
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(
        config: TomlConfig,
        output: OutputDirs,
        image_source: Arc<dyn ImageSource>,
        scorer: Option<Arc<dyn DefectScorer>>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            config: Arc::new(config),
            output,
            image_source,
            scorer,
            event_bus,
            controller: Arc::new(RwLock::new(None)),
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    /// Controller settings for a new run
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig::from_toml(&self.config, self.output.clone())
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::health_routes())
        .merge(api::simulation_routes())
        .merge(api::analytics_routes())
        .route("/events", get(api::event_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
