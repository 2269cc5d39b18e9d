//! # Wafer Common Library
//!
//! Shared code for the wafer inspection simulation service:
//! - Wafer record model and pass/fail policy
//! - Lenient read model for persisted snapshot files
//! - Result aggregation (filtering and statistical rollups)
//! - Event types (SimEvent enum) and EventBus
//! - Configuration loading and root folder resolution

pub mod aggregator;
pub mod config;
pub mod entry;
pub mod error;
pub mod events;
pub mod record;
pub mod sse;

pub use aggregator::{
    DataAggregator, DateStatistics, DefectDistribution, MachineRanking, MachineStatistics,
    SummaryReport, SummaryStatistics, TemporalKey, TimeSeries,
};
pub use config::{MachineTiming, OutputDirs, SimulationSettings, TimingTable, TomlConfig};
pub use entry::ResultEntry;
pub use error::{Error, Result};
pub use events::{EventBus, SimEvent, SimulationState, StopReason};
pub use record::{
    DefectClass, DefectMeasurement, MachineType, Prediction, QualityStatus, RawWafer, WaferRecord,
    DEFAULT_DEFECT_THRESHOLD,
};
