//! HTTP API handlers

pub mod analytics;
pub mod health;
pub mod simulation;
pub mod sse;

pub use analytics::analytics_routes;
pub use health::health_routes;
pub use simulation::{launch_run, simulation_routes};
pub use sse::event_stream;
