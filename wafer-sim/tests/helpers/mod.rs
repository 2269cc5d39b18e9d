//! Test Helper Utilities
//!
//! Shared fixtures for wafer-sim integration tests: a tiny on-disk dataset,
//! a scorer with scripted measurements, and fast machine timings.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use wafer_common::config::{MachineTiming, OutputDirs, SimulationSettings, TimingTable};
use wafer_common::{DefectClass, Prediction};
use wafer_sim::image_source::{ImagePool, ImageSource};
use wafer_sim::scorer::{DefectScorer, ScoringError};
use wafer_sim::ControllerConfig;

/// Machine interval used by most tests
pub const FAST_TIMING: MachineTiming = MachineTiming::new(0.01, 0.02);

/// Dataset with one normal and one scratch image under `root/dataset`
pub fn create_dataset(root: &Path) -> PathBuf {
    let dataset = root.join("dataset");
    for (class, name) in [("Normal", "normal_1.jpg"), ("Scratch", "scratch_1.jpg")] {
        let folder = dataset.join(class);
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join(name), format!("{} image bytes", name)).unwrap();
    }
    dataset
}

pub fn image_source(root: &Path) -> Arc<dyn ImageSource> {
    Arc::new(ImagePool::scan(&create_dataset(root)).unwrap())
}

/// Controller config writing under `root` with `(mechanical, electrical, thermal)` machines
pub fn fast_config(root: &Path, machines: (usize, usize, usize)) -> ControllerConfig {
    ControllerConfig {
        settings: SimulationSettings {
            mechanical: machines.0,
            electrical: machines.1,
            thermal: machines.2,
            ..Default::default()
        },
        timing: TimingTable::uniform(FAST_TIMING),
        output: OutputDirs::under(root),
    }
}

/// Scorer returning queued defect percentages in call order
pub struct ScriptedScorer {
    percentages: Mutex<VecDeque<f64>>,
    fallback: f64,
}

impl ScriptedScorer {
    pub fn new(percentages: impl IntoIterator<Item = f64>) -> Self {
        Self {
            percentages: Mutex::new(percentages.into_iter().collect()),
            fallback: 0.0,
        }
    }

    pub fn constant(percentage: f64) -> Self {
        Self {
            percentages: Mutex::new(VecDeque::new()),
            fallback: percentage,
        }
    }

    pub fn shared(self) -> Option<Arc<dyn DefectScorer>> {
        Some(Arc::new(self))
    }
}

impl DefectScorer for ScriptedScorer {
    fn classify(&self, _image: &Path) -> Result<Prediction, ScoringError> {
        Ok(Prediction::new(DefectClass::Normal, 0.9))
    }

    fn measure_defect_area(&self, _image: &Path) -> Result<f64, ScoringError> {
        let mut queue = self.percentages.lock().unwrap();
        Ok(queue.pop_front().unwrap_or(self.fallback))
    }
}
