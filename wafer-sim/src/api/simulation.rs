//! Simulation lifecycle handlers
//!
//! POST /simulation/start, POST /simulation/stop, GET /simulation/status

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;
use wafer_common::SimulationState;

use crate::controller::{ControllerStatus, RunParameters, SimulationController};
use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// POST /simulation/start request; omitted fields use the configured defaults
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StartSimulationRequest {
    pub duration_seconds: Option<f64>,
    pub max_wafers: Option<usize>,
    pub simulation_date: Option<String>,
}

/// POST /simulation/start response
#[derive(Debug, Serialize)]
pub struct StartSimulationResponse {
    pub run_id: Uuid,
    pub state: SimulationState,
    pub results_file: PathBuf,
}

/// POST /simulation/start
pub async fn start_simulation(
    State(state): State<AppState>,
    Json(request): Json<StartSimulationRequest>,
) -> ApiResult<Json<StartSimulationResponse>> {
    let defaults = &state.config.simulation;
    let duration = match request.duration_seconds {
        Some(seconds) => Duration::try_from_secs_f64(seconds).map_err(|_| {
            ApiError::BadRequest(format!("duration_seconds must be a positive number (got {})", seconds))
        })?,
        None => defaults.duration(),
    };
    let params = RunParameters {
        duration,
        max_wafers: request.max_wafers.or(defaults.max_wafers),
        simulation_date: request.simulation_date,
    };

    let controller = launch_run(&state, params).await?;
    Ok(Json(StartSimulationResponse {
        run_id: controller.run_id(),
        state: controller.state(),
        results_file: controller.results_file().to_path_buf(),
    }))
}

/// Create a controller and run it in the background
///
/// Fails with `Conflict` while the previous run has not reached STOPPED.
pub async fn launch_run(
    state: &AppState,
    params: RunParameters,
) -> ApiResult<Arc<SimulationController>> {
    params.validate()?;

    let mut current = state.controller.write().await;
    if let Some(existing) = current.as_ref() {
        if !existing.state().is_terminal() {
            return Err(ApiError::Conflict(format!(
                "Simulation {} is already {}",
                existing.run_id(),
                existing.state()
            )));
        }
    }

    let controller = Arc::new(SimulationController::new(
        state.controller_config(),
        state.image_source.clone(),
        state.scorer.clone(),
        Some(state.event_bus.clone()),
    )?);
    *current = Some(controller.clone());
    drop(current);

    let run = controller.clone();
    let last_error = state.last_error.clone();
    tokio::spawn(async move {
        match run.run_simulation(params).await {
            Ok(summary) => info!(
                run_id = %summary.run_id,
                results_file = %summary.results_file.display(),
                "Background simulation finished"
            ),
            Err(e) => {
                error!(run_id = %run.run_id(), error = %e, "Simulation failed");
                *last_error.write().await = Some(e.to_string());
            }
        }
    });

    Ok(controller)
}

/// POST /simulation/stop
pub async fn stop_simulation(State(state): State<AppState>) -> ApiResult<Json<ControllerStatus>> {
    let controller = current_controller(&state).await?;
    controller.stop_all_machines();
    Ok(Json(controller.status()))
}

/// GET /simulation/status
pub async fn get_simulation_status(
    State(state): State<AppState>,
) -> ApiResult<Json<ControllerStatus>> {
    let controller = current_controller(&state).await?;
    Ok(Json(controller.status()))
}

async fn current_controller(state: &AppState) -> ApiResult<Arc<SimulationController>> {
    state
        .controller
        .read()
        .await
        .clone()
        .ok_or_else(|| ApiError::NotFound("No simulation has been started".to_string()))
}

pub fn simulation_routes() -> Router<AppState> {
    Router::new()
        .route("/simulation/start", post(start_simulation))
        .route("/simulation/stop", post(stop_simulation))
        .route("/simulation/status", get(get_simulation_status))
}
