//! Bootstrap configuration and root folder resolution
//!
//! Settings come from two tiers:
//! 1. **Command line / environment**: root folder, config path, port, dataset
//! 2. **TOML file**: everything else, with built-in defaults for every key
//!
//! A missing TOML file is never fatal: the service logs a warning and runs
//! with defaults. A malformed file is an error.

use crate::record::{MachineType, DEFAULT_DEFECT_THRESHOLD};
use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable consulted for the root folder
pub const ROOT_FOLDER_ENV: &str = "WAFER_ROOT_FOLDER";

/// Results directory name under the root folder
pub const RESULTS_DIR_NAME: &str = "Manufacturing_Output";

/// Image copies directory name under the results directory
pub const PROCESSED_IMAGES_DIR_NAME: &str = "processed_images";

/// Bootstrap configuration loaded from `wafer-sim.toml`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Root folder for run output (optional, see [`resolve_root_folder`])
    pub root_folder: Option<PathBuf>,

    /// Sample image dataset with one sub-folder per defect class
    pub dataset_dir: Option<PathBuf>,

    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub simulation: SimulationSettings,
    pub timing: TimingTable,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path (logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Run defaults and pass/fail policy
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    /// Number of mechanical machines
    pub mechanical: usize,
    /// Number of electrical machines
    pub electrical: usize,
    /// Number of thermal machines
    pub thermal: usize,

    /// Default run length when a start request names none
    pub duration_seconds: u64,

    /// Default wafer cap (`None` = unlimited)
    pub max_wafers: Option<usize>,

    /// PASS iff `defect_percentage <= defect_threshold`
    pub defect_threshold: f64,

    /// Probability of drawing from the normal bucket
    pub normal_bias: f64,

    /// How long to wait for each worker after stop before detaching it
    pub join_timeout_seconds: u64,

    /// Threshold used by per-date anomaly counts
    pub alert_threshold: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            mechanical: 1,
            electrical: 1,
            thermal: 1,
            duration_seconds: 60,
            max_wafers: None,
            defect_threshold: DEFAULT_DEFECT_THRESHOLD,
            normal_bias: 0.7,
            join_timeout_seconds: 5,
            alert_threshold: DEFAULT_DEFECT_THRESHOLD,
        }
    }
}

impl SimulationSettings {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_seconds)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_seconds)
    }

    /// Machine counts in registration order
    pub fn machine_counts(&self) -> [(MachineType, usize); 3] {
        [
            (MachineType::Mechanical, self.mechanical),
            (MachineType::Electrical, self.electrical),
            (MachineType::Thermal, self.thermal),
        ]
    }
}

/// Uniform interval range between two wafers of one machine
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct MachineTiming {
    pub min_seconds: f64,
    pub max_seconds: f64,
}

impl MachineTiming {
    pub const fn new(min_seconds: f64, max_seconds: f64) -> Self {
        Self {
            min_seconds,
            max_seconds,
        }
    }

    /// Built-in range for a machine type
    pub fn default_for(machine_type: MachineType) -> Self {
        match machine_type {
            MachineType::Mechanical => Self::new(5.0, 8.0),
            MachineType::Electrical => Self::new(5.0, 6.0),
            MachineType::Thermal => Self::new(5.0, 12.0),
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(self.min_seconds) || !positive(self.max_seconds) {
            return Err(Error::Config(format!(
                "timing.{}: intervals must be positive (got {}..{})",
                name, self.min_seconds, self.max_seconds
            )));
        }
        if self.min_seconds > self.max_seconds {
            return Err(Error::Config(format!(
                "timing.{}: min_seconds {} exceeds max_seconds {}",
                name, self.min_seconds, self.max_seconds
            )));
        }
        Ok(())
    }
}

/// Per machine type interval ranges
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimingTable {
    pub mechanical: MachineTiming,
    pub electrical: MachineTiming,
    pub thermal: MachineTiming,
}

impl Default for TimingTable {
    fn default() -> Self {
        Self {
            mechanical: MachineTiming::default_for(MachineType::Mechanical),
            electrical: MachineTiming::default_for(MachineType::Electrical),
            thermal: MachineTiming::default_for(MachineType::Thermal),
        }
    }
}

impl TimingTable {
    /// Same range for every machine type
    pub fn uniform(timing: MachineTiming) -> Self {
        Self {
            mechanical: timing,
            electrical: timing,
            thermal: timing,
        }
    }

    pub fn for_type(&self, machine_type: MachineType) -> MachineTiming {
        match machine_type {
            MachineType::Mechanical => self.mechanical,
            MachineType::Electrical => self.electrical,
            MachineType::Thermal => self.thermal,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5730
}

impl TomlConfig {
    /// Load from an explicit path or the platform default location
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path.map(Path::to_path_buf).or_else(default_config_path) {
            Some(path) => path,
            None => {
                warn!("Could not determine config directory, using built-in defaults");
                return Ok(Self::default());
            }
        };

        if !path.exists() {
            warn!(path = %path.display(), "Config file not found, using built-in defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let sim = &self.simulation;
        for (name, value) in [
            ("defect_threshold", sim.defect_threshold),
            ("alert_threshold", sim.alert_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(Error::Config(format!(
                    "simulation.{} must be within 0..=100 (got {})",
                    name, value
                )));
            }
        }
        if !(0.0..=1.0).contains(&sim.normal_bias) {
            return Err(Error::Config(format!(
                "simulation.normal_bias must be within 0..=1 (got {})",
                sim.normal_bias
            )));
        }
        if sim.max_wafers == Some(0) {
            return Err(Error::Config(
                "simulation.max_wafers must be at least 1 (omit it for unlimited)".to_string(),
            ));
        }

        self.timing.mechanical.validate("mechanical")?;
        self.timing.electrical.validate("electrical")?;
        self.timing.thermal.validate("thermal")?;
        Ok(())
    }
}

/// Root folder resolution, highest priority first:
/// 1. Command-line argument
/// 2. Environment variable
/// 3. TOML `root_folder`
/// 4. OS-dependent default
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    toml_root: Option<&Path>,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = toml_root {
        return path.to_path_buf();
    }

    default_root_folder()
}

/// Platform config file location (`<config dir>/wafer/wafer-sim.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("wafer").join("wafer-sim.toml"))
}

/// OS-dependent default root folder
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("wafer-sim"))
        .unwrap_or_else(|| PathBuf::from("./wafer_sim_data"))
}

/// Directories a run writes into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDirs {
    /// Snapshot files (`results_*.json`)
    pub results_dir: PathBuf,
    /// Per-wafer image copies
    pub processed_images_dir: PathBuf,
}

impl OutputDirs {
    pub fn under(root_folder: &Path) -> Self {
        let results_dir = root_folder.join(RESULTS_DIR_NAME);
        let processed_images_dir = results_dir.join(PROCESSED_IMAGES_DIR_NAME);
        Self {
            results_dir,
            processed_images_dir,
        }
    }

    /// Create both directories if missing
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.results_dir)?;
        std::fs::create_dir_all(&self.processed_images_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_defaults() {
        let table = TimingTable::default();
        assert_eq!(table.for_type(MachineType::Mechanical), MachineTiming::new(5.0, 8.0));
        assert_eq!(table.for_type(MachineType::Electrical), MachineTiming::new(5.0, 6.0));
        assert_eq!(table.for_type(MachineType::Thermal), MachineTiming::new(5.0, 12.0));
    }

    #[test]
    fn test_output_dirs_layout() {
        let dirs = OutputDirs::under(Path::new("/data/wafer"));
        assert_eq!(dirs.results_dir, PathBuf::from("/data/wafer/Manufacturing_Output"));
        assert_eq!(
            dirs.processed_images_dir,
            PathBuf::from("/data/wafer/Manufacturing_Output/processed_images")
        );
    }

    #[test]
    fn test_machine_counts_order() {
        let settings = SimulationSettings {
            electrical: 2,
            ..Default::default()
        };
        let counts = settings.machine_counts();
        assert_eq!(counts[0], (MachineType::Mechanical, 1));
        assert_eq!(counts[1], (MachineType::Electrical, 2));
        assert_eq!(counts[2], (MachineType::Thermal, 1));
    }
}
