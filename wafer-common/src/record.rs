//! Wafer record model and pass/fail policy
//!
//! A [`WaferRecord`] is the atomic unit written by the simulation controller.
//! Quality fields are derived inside [`WaferRecord::assemble`] only, so a
//! stored status can never disagree with the stored defect percentage.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::Error;

/// Global pass/fail defect-percentage threshold (inclusive PASS bound)
pub const DEFAULT_DEFECT_THRESHOLD: f64 = 40.0;

/// Label used when the scorer failed while processing a wafer
pub const ERROR_CLASS: &str = "Error";

/// Label used when no usable classification exists
pub const UNKNOWN_CLASS: &str = "Unknown";

/// Kind of process equipment producing wafers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MachineType {
    Mechanical,
    Electrical,
    Thermal,
}

impl MachineType {
    /// All machine types in registration order
    pub const ALL: [MachineType; 3] = [
        MachineType::Mechanical,
        MachineType::Electrical,
        MachineType::Thermal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MachineType::Mechanical => "Mechanical",
            MachineType::Electrical => "Electrical",
            MachineType::Thermal => "Thermal",
        }
    }

    /// Prefix used for machine identifiers (`MECH_01`, `ELEC_02`, ...)
    pub fn id_prefix(&self) -> &'static str {
        match self {
            MachineType::Mechanical => "MECH",
            MachineType::Electrical => "ELEC",
            MachineType::Thermal => "THERM",
        }
    }

    /// Human-readable description of the process step this machine performs
    pub fn process_step(&self) -> &'static str {
        match self {
            MachineType::Mechanical => "Mechanical Processing (Dicing, Grinding, Polishing)",
            MachineType::Electrical => "Electrical Testing (Probe Testing, Parametric Testing)",
            MachineType::Thermal => "Thermal Processing (Annealing, Stress Relief, Burn-in)",
        }
    }
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MachineType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mechanical" => Ok(MachineType::Mechanical),
            "electrical" => Ok(MachineType::Electrical),
            "thermal" => Ok(MachineType::Thermal),
            other => Err(Error::InvalidInput(format!("Unknown machine type: {}", other))),
        }
    }
}

/// The nine wafer map defect classes produced by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DefectClass {
    Center,
    Donut,
    #[serde(rename = "Edge-Loc")]
    EdgeLoc,
    #[serde(rename = "Edge-Ring")]
    EdgeRing,
    Local,
    #[serde(rename = "Near-Full")]
    NearFull,
    Normal,
    Random,
    Scratch,
}

impl DefectClass {
    /// Class order used by the classifier output layer
    pub const ALL: [DefectClass; 9] = [
        DefectClass::Center,
        DefectClass::Donut,
        DefectClass::EdgeLoc,
        DefectClass::EdgeRing,
        DefectClass::Local,
        DefectClass::NearFull,
        DefectClass::Normal,
        DefectClass::Random,
        DefectClass::Scratch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DefectClass::Center => "Center",
            DefectClass::Donut => "Donut",
            DefectClass::EdgeLoc => "Edge-Loc",
            DefectClass::EdgeRing => "Edge-Ring",
            DefectClass::Local => "Local",
            DefectClass::NearFull => "Near-Full",
            DefectClass::Normal => "Normal",
            DefectClass::Random => "Random",
            DefectClass::Scratch => "Scratch",
        }
    }
}

impl fmt::Display for DefectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DefectClass {
    type Err = Error;

    /// Case-insensitive; accepts `_` or `-` as separator (dataset folder names vary)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('_', "-");
        DefectClass::ALL
            .into_iter()
            .find(|class| class.as_str().eq_ignore_ascii_case(&wanted))
            .ok_or_else(|| Error::InvalidInput(format!("Unknown defect class: {}", s)))
    }
}

/// Inspection verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QualityStatus {
    Pass,
    Fail,
}

impl QualityStatus {
    /// PASS iff `defect_percentage <= threshold`
    pub fn from_percentage(defect_percentage: f64, threshold: f64) -> Self {
        if defect_percentage <= threshold {
            QualityStatus::Pass
        } else {
            QualityStatus::Fail
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityStatus::Pass => "PASS",
            QualityStatus::Fail => "FAIL",
        }
    }
}

/// Classifier output attached to a record
///
/// `defect_class` is a string rather than [`DefectClass`] because the
/// sentinel labels `Error` and `Unknown` are stored in the same field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(alias = "Defect Class")]
    pub defect_class: String,

    /// Softmax confidence in [0, 1]
    #[serde(alias = "Confidence Score")]
    pub confidence: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Prediction {
    pub fn new(defect_class: DefectClass, confidence: f64) -> Self {
        Self {
            defect_class: defect_class.as_str().to_string(),
            confidence,
            error: None,
        }
    }

    /// Classification raised an error; run continues with this placeholder
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            defect_class: ERROR_CLASS.to_string(),
            confidence: 0.0,
            error: Some(error.into()),
        }
    }

    /// No usable classification (scorer missing or invalid output)
    pub fn unknown(error: impl Into<String>) -> Self {
        Self {
            defect_class: UNKNOWN_CLASS.to_string(),
            confidence: 0.0,
            error: Some(error.into()),
        }
    }
}

/// Independent defect-area measurement for one wafer
#[derive(Debug, Clone, PartialEq)]
pub struct DefectMeasurement {
    pub defect_percentage: f64,
    pub error: Option<String>,
}

impl DefectMeasurement {
    pub fn measured(defect_percentage: f64) -> Self {
        Self {
            defect_percentage,
            error: None,
        }
    }

    /// Measurement failed; percentage falls back to 0.0
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            defect_percentage: 0.0,
            error: Some(error.into()),
        }
    }
}

/// Raw record emitted by a machine before scoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawWafer {
    pub wafer_id: String,
    pub machine_id: String,
    pub machine_type: MachineType,
    pub image_path: PathBuf,
    pub timestamp: DateTime<Local>,
    pub process_step: String,
}

/// Fully analysed wafer as persisted in a snapshot file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaferRecord {
    pub wafer_id: String,
    pub machine_id: String,
    pub machine_type: MachineType,
    pub image_path: PathBuf,
    pub timestamp: DateTime<Local>,
    pub process_step: String,
    /// Logical run day (`YYYY-MM-DD`), identical for every record of a run
    pub simulation_date: String,
    pub prediction: Prediction,
    pub defect_percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defect_count_error: Option<String>,
    pub quality_status: QualityStatus,
    pub quality_reason: String,
    pub defect_threshold: f64,
    pub threshold_exceeded: bool,
    pub analysis_timestamp: DateTime<Local>,
}

impl WaferRecord {
    /// Combine a raw wafer with its scoring results and derive the verdict
    pub fn assemble(
        raw: RawWafer,
        prediction: Prediction,
        measurement: DefectMeasurement,
        threshold: f64,
        simulation_date: &str,
    ) -> Self {
        let defect_percentage = measurement.defect_percentage;
        let quality_status = QualityStatus::from_percentage(defect_percentage, threshold);
        let quality_reason = quality_reason(defect_percentage, threshold, &prediction);

        Self {
            wafer_id: raw.wafer_id,
            machine_id: raw.machine_id,
            machine_type: raw.machine_type,
            image_path: raw.image_path,
            timestamp: raw.timestamp,
            process_step: raw.process_step,
            simulation_date: simulation_date.to_string(),
            prediction,
            defect_percentage,
            defect_count_error: measurement.error,
            quality_status,
            quality_reason,
            defect_threshold: threshold,
            threshold_exceeded: defect_percentage > threshold,
            analysis_timestamp: Local::now(),
        }
    }

    /// Grouping key used by per-machine statistics
    pub fn machine_key(&self) -> String {
        format!("{}_{}", self.machine_type, self.machine_id)
    }
}

fn quality_reason(defect_percentage: f64, threshold: f64, prediction: &Prediction) -> String {
    let comparison = if defect_percentage > threshold {
        format!("(>{}% threshold)", threshold)
    } else {
        format!("(<={}% threshold)", threshold)
    };
    format!(
        "Defect Percentage: {:?}% {}, Defect Class: {}, Confidence: {:.2}%",
        defect_percentage,
        comparison,
        prediction.defect_class,
        prediction.confidence * 100.0
    )
}

/// Wafer identifier: `{MachineType}_{MachineID}_W{seq:04}`
pub fn wafer_id(machine_type: MachineType, machine_id: &str, sequence: u64) -> String {
    format!("{}_{}_W{:04}", machine_type, machine_id, sequence)
}
