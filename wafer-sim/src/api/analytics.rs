//! Result analytics handlers
//!
//! Every request loads the snapshot files afresh on the blocking pool, so
//! answers reflect whatever the running simulation last persisted.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{Days, Local};
use serde::Deserialize;
use std::collections::BTreeMap;
use wafer_common::{
    DataAggregator, DateStatistics, DefectDistribution, MachineRanking, MachineStatistics,
    ResultEntry, SummaryReport, TemporalKey, TimeSeries,
};

use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// Default look-back for GET /results/timeseries
const DEFAULT_SERIES_DAYS: u64 = 7;

#[derive(Debug, Default, Deserialize)]
pub struct SummaryQuery {
    pub date: Option<String>,
    #[serde(default)]
    pub key: TemporalKey,
}

#[derive(Debug, Default, Deserialize)]
pub struct DatesQuery {
    #[serde(default)]
    pub key: TemporalKey,
}

#[derive(Debug, Default, Deserialize)]
pub struct AnomalyQuery {
    pub threshold: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct TimeSeriesQuery {
    pub days: Option<u64>,
    #[serde(default = "timestamp_key")]
    pub key: TemporalKey,
}

fn timestamp_key() -> TemporalKey {
    TemporalKey::Timestamp
}

/// Load every snapshot in the results directory
async fn load_aggregator(state: &AppState) -> ApiResult<DataAggregator> {
    let results_dir = state.output.results_dir.clone();
    let alert_threshold = state.config.simulation.alert_threshold;

    tokio::task::spawn_blocking(move || {
        let mut aggregator = DataAggregator::new(results_dir).with_alert_threshold(alert_threshold);
        aggregator.load_results(None);
        aggregator
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Failed to load results: {}", e)))
}

/// GET /results/summary?date=&key=
pub async fn get_summary(
    State(state): State<AppState>,
    Query(query): Query<SummaryQuery>,
) -> ApiResult<Json<SummaryReport>> {
    let aggregator = load_aggregator(&state).await?;
    let report = match query.date {
        Some(date) => aggregator.get_statistics_for_date(query.key, &date),
        None => aggregator.get_summary_statistics(),
    };
    Ok(Json(report))
}

/// GET /results/dates?key=
pub async fn get_dates(
    State(state): State<AppState>,
    Query(query): Query<DatesQuery>,
) -> ApiResult<Json<Vec<String>>> {
    let aggregator = load_aggregator(&state).await?;
    Ok(Json(aggregator.get_available_dates(query.key)))
}

/// GET /results/machines
pub async fn get_machines(State(state): State<AppState>) -> ApiResult<Json<Vec<MachineStatistics>>> {
    let aggregator = load_aggregator(&state).await?;
    Ok(Json(aggregator.get_machine_statistics()))
}

/// GET /results/ranking
pub async fn get_ranking(State(state): State<AppState>) -> ApiResult<Json<Vec<MachineRanking>>> {
    let aggregator = load_aggregator(&state).await?;
    Ok(Json(aggregator.get_machine_performance_ranking()))
}

/// GET /results/defects
pub async fn get_defects(State(state): State<AppState>) -> ApiResult<Json<DefectDistribution>> {
    let aggregator = load_aggregator(&state).await?;
    Ok(Json(aggregator.get_defect_distribution()))
}

/// GET /results/anomalies?threshold=
///
/// Threshold defaults to the configured alert threshold.
pub async fn get_anomalies(
    State(state): State<AppState>,
    Query(query): Query<AnomalyQuery>,
) -> ApiResult<Json<Vec<ResultEntry>>> {
    let threshold = query
        .threshold
        .unwrap_or(state.config.simulation.alert_threshold);
    if !threshold.is_finite() {
        return Err(ApiError::BadRequest("threshold must be a finite number".to_string()));
    }
    let aggregator = load_aggregator(&state).await?;
    Ok(Json(aggregator.get_anomalies(threshold)))
}

/// GET /results/by-date
pub async fn get_by_date(
    State(state): State<AppState>,
) -> ApiResult<Json<BTreeMap<String, DateStatistics>>> {
    let aggregator = load_aggregator(&state).await?;
    Ok(Json(aggregator.get_date_statistics()))
}

/// GET /results/daily/:date
pub async fn get_daily(
    State(state): State<AppState>,
    Path(date): Path<String>,
) -> ApiResult<Json<SummaryReport>> {
    let aggregator = load_aggregator(&state).await?;
    Ok(Json(aggregator.get_daily_statistics(&date)))
}

/// GET /results/timeseries?days=&key=
///
/// Covers the last `days` calendar days (default 7), keyed by creation
/// timestamp unless `key=simulation_date`.
pub async fn get_timeseries(
    State(state): State<AppState>,
    Query(query): Query<TimeSeriesQuery>,
) -> ApiResult<Json<TimeSeries>> {
    let days = query.days.unwrap_or(DEFAULT_SERIES_DAYS);
    let since = Local::now()
        .date_naive()
        .checked_sub_days(Days::new(days))
        .ok_or_else(|| ApiError::BadRequest(format!("days out of range: {}", days)))?;

    let aggregator = load_aggregator(&state).await?;
    Ok(Json(aggregator.get_time_series(query.key, since)))
}

pub fn analytics_routes() -> Router<AppState> {
    Router::new()
        .route("/results/summary", get(get_summary))
        .route("/results/dates", get(get_dates))
        .route("/results/machines", get(get_machines))
        .route("/results/ranking", get(get_ranking))
        .route("/results/defects", get(get_defects))
        .route("/results/anomalies", get(get_anomalies))
        .route("/results/by-date", get(get_by_date))
        .route("/results/daily/:date", get(get_daily))
        .route("/results/timeseries", get(get_timeseries))
}
