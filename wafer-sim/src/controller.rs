//! Simulation controller
//!
//! Owns the machines of one run and drives them concurrently:
//! - one tokio task per machine produces, scores and stores wafers
//! - a supervisory loop watches the deadline and logs throughput
//! - stop conditions (deadline, wafer cap, stop request) cancel a shared
//!   token; the first one observed is kept as the [`StopReason`]
//!
//! A controller is single-use: `IDLE → RUNNING → STOPPING → STOPPED`.

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wafer_common::config::{OutputDirs, SimulationSettings, TimingTable, TomlConfig};
use wafer_common::{
    DataAggregator, DefectDistribution, Error, EventBus, Result, SimEvent, SimulationState,
    StopReason, SummaryReport, WaferRecord,
};

use crate::image_source::ImageSource;
use crate::machine::{Machine, MachineStatus};
use crate::scorer::{self, DefectScorer};
use crate::store::{AppendOutcome, ResultStore, StoreHandle};

/// Supervisory loop period
const SUPERVISOR_TICK: Duration = Duration::from_millis(250);

/// Elapsed time between throughput log lines
const THROUGHPUT_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Longest accepted run (30 days)
pub const MAX_RUN_DURATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Static configuration of a controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub settings: SimulationSettings,
    pub timing: TimingTable,
    pub output: OutputDirs,
}

impl ControllerConfig {
    pub fn from_toml(config: &TomlConfig, output: OutputDirs) -> Self {
        Self {
            settings: config.simulation.clone(),
            timing: config.timing.clone(),
            output,
        }
    }
}

/// Per-run parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RunParameters {
    pub duration: Duration,
    /// `None` = unlimited
    pub max_wafers: Option<usize>,
    /// Logical run day (`YYYY-MM-DD`); today when `None`
    pub simulation_date: Option<String>,
}

impl RunParameters {
    pub fn from_settings(settings: &SimulationSettings) -> Self {
        Self {
            duration: settings.duration(),
            max_wafers: settings.max_wafers,
            simulation_date: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.duration.is_zero() {
            return Err(Error::InvalidInput(
                "duration must be greater than zero".to_string(),
            ));
        }
        if self.duration > MAX_RUN_DURATION {
            return Err(Error::InvalidInput(format!(
                "duration must be at most {} seconds (got {})",
                MAX_RUN_DURATION.as_secs(),
                self.duration.as_secs_f64()
            )));
        }
        if self.max_wafers == Some(0) {
            return Err(Error::InvalidInput(
                "max_wafers must be at least 1".to_string(),
            ));
        }
        if let Some(date) = &self.simulation_date {
            NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| {
                Error::InvalidInput(format!("simulation_date must be YYYY-MM-DD (got {})", date))
            })?;
        }
        Ok(())
    }

    fn resolved_date(&self) -> String {
        self.simulation_date
            .clone()
            .unwrap_or_else(|| Local::now().format("%Y-%m-%d").to_string())
    }
}

/// Outcome of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub simulation_date: String,
    pub results_file: PathBuf,
    pub stop_reason: Option<StopReason>,
    pub elapsed_seconds: f64,
    pub statistics: SummaryReport,
    pub wafers_by_machine_type: BTreeMap<String, usize>,
    pub defect_distribution: DefectDistribution,
}

impl RunSummary {
    fn from_records(
        run_id: Uuid,
        simulation_date: String,
        results_file: PathBuf,
        stop_reason: Option<StopReason>,
        elapsed: Duration,
        records: &[WaferRecord],
    ) -> Self {
        let mut wafers_by_machine_type = BTreeMap::new();
        for record in records {
            *wafers_by_machine_type
                .entry(record.machine_type.to_string())
                .or_insert(0) += 1;
        }

        let aggregator = DataAggregator::from_values(
            records.iter().filter_map(|record| serde_json::to_value(record).ok()),
        );

        Self {
            run_id,
            simulation_date,
            results_file,
            stop_reason,
            elapsed_seconds: elapsed.as_secs_f64(),
            statistics: aggregator.get_summary_statistics(),
            wafers_by_machine_type,
            defect_distribution: aggregator.get_defect_distribution(),
        }
    }

    fn total_wafers(&self) -> usize {
        self.statistics.stats().map_or(0, |s| s.total_wafers)
    }
}

/// Live view of a controller
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub run_id: Uuid,
    pub state: SimulationState,
    pub simulation_date: Option<String>,
    pub results_file: PathBuf,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: f64,
    /// Records held by the result store
    pub results_count: usize,
    /// Images produced by machines (approximate while running)
    pub processed_wafers: u64,
    pub machines: Vec<MachineStatus>,
    pub stop_reason: Option<StopReason>,
}

/// Set once when the run starts
struct RunInfo {
    simulation_date: String,
    started_at: DateTime<Utc>,
    started: Instant,
    store: StoreHandle,
}

/// Everything a machine worker needs, cloned into its task
#[derive(Clone)]
struct WorkerContext {
    run_id: Uuid,
    image_source: Arc<dyn ImageSource>,
    scorer: Option<Arc<dyn DefectScorer>>,
    store: StoreHandle,
    event_bus: Option<EventBus>,
    cancel: CancellationToken,
    stop_reason: Arc<OnceLock<StopReason>>,
    deadline: Instant,
    simulation_date: Arc<str>,
    defect_threshold: f64,
    normal_bias: f64,
}

impl WorkerContext {
    fn stop_with(&self, reason: StopReason) {
        if self.stop_reason.set(reason).is_ok() {
            info!(run_id = %self.run_id, %reason, "Stop condition reached");
        }
        self.cancel.cancel();
    }
}

/// Runs one simulation over a fixed set of machines
pub struct SimulationController {
    run_id: Uuid,
    settings: SimulationSettings,
    machines: Vec<Arc<Machine>>,
    image_source: Arc<dyn ImageSource>,
    scorer: Option<Arc<dyn DefectScorer>>,
    event_bus: Option<EventBus>,
    results_file: PathBuf,
    state: watch::Sender<SimulationState>,
    cancel: CancellationToken,
    stop_reason: Arc<OnceLock<StopReason>>,
    run: OnceLock<RunInfo>,
    finished: OnceLock<Instant>,
}

impl SimulationController {
    /// Register machines and pick the results file
    ///
    /// Creates the output directories if missing. A missing scorer puts the
    /// controller in degraded mode: every wafer is recorded as `Unknown`.
    pub fn new(
        config: ControllerConfig,
        image_source: Arc<dyn ImageSource>,
        scorer: Option<Arc<dyn DefectScorer>>,
        event_bus: Option<EventBus>,
    ) -> Result<Self> {
        config.output.ensure()?;

        let machines: Vec<Arc<Machine>> = config
            .settings
            .machine_counts()
            .into_iter()
            .flat_map(|(machine_type, count)| {
                let timing = config.timing.for_type(machine_type);
                let output_dir = config.output.processed_images_dir.clone();
                (1..=count)
                    .map(move |index| Arc::new(Machine::new(machine_type, index, timing, output_dir.clone())))
            })
            .collect();

        if machines.is_empty() {
            return Err(Error::Config("At least one machine is required".to_string()));
        }

        let run_id = Uuid::new_v4();
        let results_file = unique_results_file(&config.output.results_dir);
        // Claim the name so a controller built in the same second picks another
        std::fs::write(&results_file, "[]")?;
        if scorer.is_none() {
            warn!(%run_id, "No scorer available, wafers will be recorded as Unknown");
        }
        info!(
            %run_id,
            machines = machines.len(),
            results_file = %results_file.display(),
            "Simulation controller initialized"
        );

        let (state, _) = watch::channel(SimulationState::Idle);
        Ok(Self {
            run_id,
            settings: config.settings,
            machines,
            image_source,
            scorer,
            event_bus,
            results_file,
            state,
            cancel: CancellationToken::new(),
            stop_reason: Arc::new(OnceLock::new()),
            run: OnceLock::new(),
            finished: OnceLock::new(),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn results_file(&self) -> &Path {
        &self.results_file
    }

    pub fn machines(&self) -> &[Arc<Machine>] {
        &self.machines
    }

    pub fn state(&self) -> SimulationState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SimulationState::Running
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SimulationState> {
        self.state.subscribe()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason.get().copied()
    }

    /// Request a stop; safe to call from anywhere, any number of times
    pub fn stop_all_machines(&self) {
        if self.stop_reason.set(StopReason::StopRequested).is_ok() {
            info!(run_id = %self.run_id, "Stop requested");
        }
        for machine in &self.machines {
            machine.stop();
        }
        self.cancel.cancel();
    }

    /// Snapshot of the stored records (empty before the run starts)
    pub async fn results(&self) -> Vec<WaferRecord> {
        let Some(run) = self.run.get() else {
            return Vec::new();
        };
        match run.store.snapshot().await {
            Ok(records) => records,
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "Result snapshot unavailable");
                Vec::new()
            }
        }
    }

    pub fn status(&self) -> ControllerStatus {
        let run = self.run.get();
        let elapsed = run.map_or(Duration::ZERO, |run| {
            self.finished
                .get()
                .map_or_else(|| run.started.elapsed(), |end| end.duration_since(run.started))
        });

        ControllerStatus {
            run_id: self.run_id,
            state: self.state(),
            simulation_date: run.map(|run| run.simulation_date.clone()),
            results_file: self.results_file.clone(),
            started_at: run.map(|run| run.started_at),
            elapsed_seconds: elapsed.as_secs_f64(),
            results_count: run.map_or(0, |run| run.store.len()),
            processed_wafers: self.processed_wafers(),
            machines: self.machines.iter().map(|m| m.status()).collect(),
            stop_reason: self.stop_reason(),
        }
    }

    fn processed_wafers(&self) -> u64 {
        self.machines.iter().map(|m| m.processed_count()).sum()
    }

    /// Run to completion
    ///
    /// Returns once every worker has finished or been detached after the
    /// join timeout. Fails with `InvalidState` unless the controller is IDLE.
    /// Any failure after RUNNING still ends the run in STOPPED.
    pub async fn run_simulation(&self, params: RunParameters) -> Result<RunSummary> {
        params.validate()?;
        self.transition(SimulationState::Running)?;

        match self.execute(params).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                error!(run_id = %self.run_id, error = %e, "Simulation aborted");
                self.abort();
                Err(e)
            }
        }
    }

    async fn execute(&self, params: RunParameters) -> Result<RunSummary> {
        let started = Instant::now();
        let deadline = started.checked_add(params.duration).ok_or_else(|| {
            Error::InvalidInput(format!(
                "duration out of range: {} seconds",
                params.duration.as_secs_f64()
            ))
        })?;

        let simulation_date = params.resolved_date();
        let (store, _store_task) = ResultStore::spawn(self.results_file.clone(), params.max_wafers);

        let run = RunInfo {
            simulation_date: simulation_date.clone(),
            started_at: Utc::now(),
            started,
            store: store.clone(),
        };
        if self.run.set(run).is_err() {
            return Err(Error::Internal("Run already initialized".to_string()));
        }

        info!(
            run_id = %self.run_id,
            simulation_date = %simulation_date,
            duration_seconds = params.duration.as_secs_f64(),
            max_wafers = ?params.max_wafers,
            "Starting manufacturing simulation"
        );

        for machine in &self.machines {
            machine.start();
        }
        self.emit(SimEvent::SimulationStarted {
            run_id: self.run_id,
            simulation_date: simulation_date.clone(),
            machines: self.machines.iter().map(|m| m.key()).collect(),
            duration_seconds: params.duration.as_secs_f64(),
            max_wafers: params.max_wafers,
            results_file: self.results_file.display().to_string(),
            timestamp: Utc::now(),
        });

        let context = WorkerContext {
            run_id: self.run_id,
            image_source: self.image_source.clone(),
            scorer: self.scorer.clone(),
            store: store.clone(),
            event_bus: self.event_bus.clone(),
            cancel: self.cancel.clone(),
            stop_reason: self.stop_reason.clone(),
            deadline,
            simulation_date: Arc::from(simulation_date.as_str()),
            defect_threshold: self.settings.defect_threshold,
            normal_bias: self.settings.normal_bias,
        };
        let workers: Vec<(String, JoinHandle<()>)> = self
            .machines
            .iter()
            .map(|machine| {
                let task = tokio::spawn(run_machine(context.clone(), machine.clone()));
                (machine.key(), task)
            })
            .collect();

        self.supervise(&context, &store).await;

        self.transition(SimulationState::Stopping)?;
        for machine in &self.machines {
            machine.stop();
        }
        self.cancel.cancel();
        self.join_workers(workers).await;

        let records = store.snapshot().await?;
        let elapsed = started.elapsed();
        let _ = self.finished.set(Instant::now());

        let summary = RunSummary::from_records(
            self.run_id,
            simulation_date,
            self.results_file.clone(),
            self.stop_reason(),
            elapsed,
            &records,
        );
        self.transition(SimulationState::Stopped)?;
        self.log_summary(&summary);

        let (pass_count, fail_count) = summary
            .statistics
            .stats()
            .map_or((0, 0), |s| (s.pass_count, s.fail_count));
        self.emit(SimEvent::SimulationCompleted {
            run_id: self.run_id,
            stop_reason: summary.stop_reason,
            total_wafers: summary.total_wafers(),
            pass_count,
            fail_count,
            results_file: self.results_file.display().to_string(),
            elapsed_seconds: summary.elapsed_seconds,
            timestamp: Utc::now(),
        });

        Ok(summary)
    }

    /// Stop everything and walk the state machine to STOPPED
    fn abort(&self) {
        for machine in &self.machines {
            machine.stop();
        }
        self.cancel.cancel();
        let _ = self.finished.set(Instant::now());

        if self.state() == SimulationState::Running {
            let _ = self.transition(SimulationState::Stopping);
        }
        if self.state() == SimulationState::Stopping {
            let _ = self.transition(SimulationState::Stopped);
        }
    }

    /// Wait for the deadline or cancellation, logging throughput
    async fn supervise(&self, context: &WorkerContext, store: &StoreHandle) {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(SUPERVISOR_TICK);
        let mut next_report = THROUGHPUT_LOG_INTERVAL;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep_until(context.deadline) => {
                    context.stop_with(StopReason::DurationElapsed);
                    break;
                }
                _ = ticker.tick() => {
                    let elapsed = started.elapsed();
                    if elapsed >= next_report {
                        next_report += THROUGHPUT_LOG_INTERVAL;
                        let processed = self.processed_wafers();
                        info!(
                            run_id = %self.run_id,
                            elapsed_seconds = elapsed.as_secs(),
                            processed,
                            results = store.len(),
                            wafers_per_minute = processed as f64 / elapsed.as_secs_f64() * 60.0,
                            "Simulation progress"
                        );
                    }
                }
            }
        }
    }

    /// Await each worker for at most the join timeout; stragglers are detached
    async fn join_workers(&self, workers: Vec<(String, JoinHandle<()>)>) {
        let join_timeout = self.settings.join_timeout();
        for (machine, task) in workers {
            match tokio::time::timeout(join_timeout, task).await {
                Ok(Ok(())) => debug!(run_id = %self.run_id, machine = %machine, "Worker finished"),
                Ok(Err(e)) => {
                    error!(run_id = %self.run_id, machine = %machine, error = %e, "Worker task failed")
                }
                Err(_) => warn!(
                    run_id = %self.run_id,
                    machine = %machine,
                    timeout_seconds = join_timeout.as_secs_f64(),
                    "Worker did not stop in time, detaching"
                ),
            }
        }
    }

    fn transition(&self, next: SimulationState) -> Result<SimulationState> {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                previous = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });

        let Some(old_state) = previous else {
            return Err(Error::InvalidState(format!(
                "Cannot move simulation from {} to {}",
                self.state(),
                next
            )));
        };

        info!(run_id = %self.run_id, old_state = %old_state, new_state = %next, "Simulation state changed");
        self.emit(SimEvent::SimulationStateChanged {
            run_id: self.run_id,
            old_state,
            new_state: next,
            timestamp: Utc::now(),
        });
        Ok(old_state)
    }

    fn emit(&self, event: SimEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit_lossy(event);
        }
    }

    fn log_summary(&self, summary: &RunSummary) {
        match summary.statistics.stats() {
            Some(stats) => info!(
                run_id = %self.run_id,
                stop_reason = ?summary.stop_reason,
                total_wafers = stats.total_wafers,
                pass_count = stats.pass_count,
                fail_count = stats.fail_count,
                pass_rate = stats.pass_rate,
                by_machine_type = ?summary.wafers_by_machine_type,
                defect_classes = ?summary.defect_distribution.counts,
                results_file = %summary.results_file.display(),
                "Simulation completed"
            ),
            None => info!(
                run_id = %self.run_id,
                stop_reason = ?summary.stop_reason,
                results_file = %summary.results_file.display(),
                "Simulation completed without wafers"
            ),
        }
    }
}

impl Drop for SimulationController {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Worker loop for one machine
async fn run_machine(ctx: WorkerContext, machine: Arc<Machine>) {
    debug!(run_id = %ctx.run_id, machine_id = %machine.machine_id(), "Worker started");

    loop {
        if ctx.cancel.is_cancelled() || !machine.is_running() {
            break;
        }
        if Instant::now() >= ctx.deadline {
            ctx.stop_with(StopReason::DurationElapsed);
            break;
        }
        if ctx.store.cap().is_some_and(|cap| ctx.store.len() >= cap) {
            ctx.stop_with(StopReason::WaferCapReached);
            break;
        }

        if let Some(raw) = machine
            .process_wafer(ctx.image_source.as_ref(), ctx.normal_bias)
            .await
        {
            let (prediction, measurement) =
                scorer::analyze(ctx.scorer.as_ref(), &raw.wafer_id, &raw.image_path).await;
            let record = WaferRecord::assemble(
                raw,
                prediction,
                measurement,
                ctx.defect_threshold,
                &ctx.simulation_date,
            );

            info!(
                run_id = %ctx.run_id,
                wafer_id = %record.wafer_id,
                machine_id = %record.machine_id,
                defect_class = %record.prediction.defect_class,
                confidence = record.prediction.confidence,
                defect_percentage = record.defect_percentage,
                quality_status = record.quality_status.as_str(),
                "Wafer analysed"
            );

            let event = wafer_event(&ctx, &record);
            match ctx.store.append(record).await {
                AppendOutcome::Accepted { total } => {
                    if let Some(bus) = &ctx.event_bus {
                        bus.emit_lossy(with_total(event, total));
                    }
                    if ctx.store.cap() == Some(total) {
                        ctx.stop_with(StopReason::WaferCapReached);
                        break;
                    }
                }
                AppendOutcome::CapReached => {
                    ctx.stop_with(StopReason::WaferCapReached);
                    break;
                }
                AppendOutcome::Closed => {
                    error!(run_id = %ctx.run_id, "Result store closed, worker exiting");
                    break;
                }
            }
        }

        let wake_at = (Instant::now() + machine.next_interval()).min(ctx.deadline);
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep_until(wake_at) => {}
        }
    }

    debug!(run_id = %ctx.run_id, machine_id = %machine.machine_id(), "Worker exited");
}

fn wafer_event(ctx: &WorkerContext, record: &WaferRecord) -> SimEvent {
    SimEvent::WaferProcessed {
        run_id: ctx.run_id,
        wafer_id: record.wafer_id.clone(),
        machine_id: record.machine_id.clone(),
        machine_type: record.machine_type,
        defect_class: record.prediction.defect_class.clone(),
        confidence: record.prediction.confidence,
        defect_percentage: record.defect_percentage,
        quality_status: record.quality_status,
        total_results: 0,
        timestamp: Utc::now(),
    }
}

fn with_total(mut event: SimEvent, total: usize) -> SimEvent {
    if let SimEvent::WaferProcessed { total_results, .. } = &mut event {
        *total_results = total;
    }
    event
}

/// `results_{YYYYmmdd_HHMMSS}.json`, suffixed when a run in the same second
/// already claimed the name
fn unique_results_file(results_dir: &Path) -> PathBuf {
    let stem = format!("results_{}", Local::now().format("%Y%m%d_%H%M%S"));
    let mut candidate = results_dir.join(format!("{}.json", stem));
    let mut suffix = 1;
    while candidate.exists() {
        candidate = results_dir.join(format!("{}_{}.json", stem, suffix));
        suffix += 1;
    }
    candidate
}
