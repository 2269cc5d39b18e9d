//! Simulated process equipment
//!
//! A [`Machine`] turns sample images into raw wafer records. Its counters are
//! atomics so status readers never block the worker that drives it.

use chrono::Local;
use rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use wafer_common::config::MachineTiming;
use wafer_common::record::wafer_id;
use wafer_common::{MachineType, RawWafer};

use crate::image_source::ImageSource;

/// Read-only snapshot of a machine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineStatus {
    pub machine_id: String,
    pub machine_type: MachineType,
    pub is_running: bool,
    pub processed_count: u64,
    pub sequence_counter: u64,
    pub min_interval_seconds: f64,
    pub max_interval_seconds: f64,
}

/// One wafer-producing machine
#[derive(Debug)]
pub struct Machine {
    machine_id: String,
    machine_type: MachineType,
    timing: MachineTiming,
    output_dir: PathBuf,
    running: AtomicBool,
    processed: AtomicU64,
    sequence: AtomicU64,
}

impl Machine {
    /// Machine number `index` (1-based) of its type, e.g. `THERM_02`
    pub fn new(
        machine_type: MachineType,
        index: usize,
        timing: MachineTiming,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            machine_id: format!("{}_{:02}", machine_type.id_prefix(), index),
            machine_type,
            timing,
            output_dir: output_dir.into(),
            running: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// `{machine_type}_{machine_id}`, the aggregation grouping key
    pub fn key(&self) -> String {
        format!("{}_{}", self.machine_type, self.machine_id)
    }

    pub fn start(&self) {
        if !self.running.swap(true, Ordering::Relaxed) {
            info!(machine_id = %self.machine_id, machine_type = %self.machine_type, "Machine started");
        }
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::Relaxed) {
            info!(machine_id = %self.machine_id, machine_type = %self.machine_type, "Machine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Produce the next raw wafer
    ///
    /// Returns `None` when the machine is stopped, the source has no images,
    /// or the image copy fails. The sequence number is consumed either way,
    /// so wafer ids never repeat.
    pub async fn process_wafer(
        &self,
        source: &dyn ImageSource,
        bias_towards_normal: f64,
    ) -> Option<RawWafer> {
        if !self.is_running() {
            return None;
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let wafer_id = wafer_id(self.machine_type, &self.machine_id, sequence);

        let Some(source_image) = source.next_image(bias_towards_normal) else {
            warn!(machine_id = %self.machine_id, wafer_id = %wafer_id, "No images available, wafer skipped");
            return None;
        };

        let timestamp = Local::now();
        let file_name = format!(
            "{}_{}_{}.jpg",
            self.machine_type,
            wafer_id,
            timestamp.format("%Y%m%d_%H%M%S_%6f")
        );
        let image_path = self.output_dir.join(file_name);

        if let Err(e) = tokio::fs::copy(&source_image, &image_path).await {
            error!(
                machine_id = %self.machine_id,
                wafer_id = %wafer_id,
                source = %source_image.display(),
                error = %e,
                "Failed to copy wafer image"
            );
            return None;
        }

        self.processed.fetch_add(1, Ordering::Relaxed);
        debug!(machine_id = %self.machine_id, wafer_id = %wafer_id, "Wafer produced");

        Some(RawWafer {
            wafer_id,
            machine_id: self.machine_id.clone(),
            machine_type: self.machine_type,
            image_path,
            timestamp,
            process_step: self.machine_type.process_step().to_string(),
        })
    }

    /// Random pause before the next wafer, uniform over the timing range
    pub fn next_interval(&self) -> Duration {
        let MachineTiming {
            min_seconds,
            max_seconds,
        } = self.timing;
        let seconds = rand::thread_rng().gen_range(min_seconds..=max_seconds);
        Duration::from_secs_f64(seconds)
    }

    pub fn status(&self) -> MachineStatus {
        MachineStatus {
            machine_id: self.machine_id.clone(),
            machine_type: self.machine_type,
            is_running: self.is_running(),
            processed_count: self.processed.load(Ordering::Relaxed),
            sequence_counter: self.sequence.load(Ordering::Relaxed),
            min_interval_seconds: self.timing.min_seconds,
            max_interval_seconds: self.timing.max_seconds,
        }
    }
}
