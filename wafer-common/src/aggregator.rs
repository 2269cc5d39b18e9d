//! Result aggregation over persisted snapshot files
//!
//! [`DataAggregator`] is a read-only view: it re-reads `results_*.json` files
//! from disk on every [`load_results`](DataAggregator::load_results) call and
//! never writes to them. Readers therefore see whatever snapshot the
//! simulation last wrote, which may be stale. A file caught mid-write fails
//! to parse and is skipped for that load.
//!
//! Every query degrades to an empty or zero-valued result on missing data.
//! The one exception is [`SummaryReport::NoData`], which distinguishes "no
//! data loaded" from "data loaded and the rate legitimately is zero".

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::entry::ResultEntry;
use crate::record::DEFAULT_DEFECT_THRESHOLD;

/// File name prefix of snapshot files written by the simulation
pub const RESULTS_FILE_PREFIX: &str = "results_";

/// Which record field supplies the date in a query context
///
/// Chosen once per query; the aggregator never falls back from one to the
/// other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalKey {
    /// Logical run day assigned at simulation start
    #[default]
    SimulationDate,
    /// Calendar date of the wall-clock creation timestamp
    Timestamp,
}

impl TemporalKey {
    /// Date of an entry under this key, formatted `YYYY-MM-DD`
    pub fn date_of(&self, entry: &ResultEntry) -> Option<String> {
        match self {
            TemporalKey::SimulationDate => entry.simulation_date.clone(),
            TemporalKey::Timestamp => entry
                .timestamp_date
                .map(|date| date.format("%Y-%m-%d").to_string()),
        }
    }

    fn naive_date_of(&self, entry: &ResultEntry) -> Option<NaiveDate> {
        match self {
            TemporalKey::SimulationDate => entry
                .simulation_date
                .as_deref()
                .and_then(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()),
            TemporalKey::Timestamp => entry.timestamp_date,
        }
    }
}

/// Overall statistics for a set of records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryStatistics {
    pub total_wafers: usize,
    pub pass_count: usize,
    pub fail_count: usize,
    /// Percentage of PASS records (0 when there are no records)
    pub pass_rate: f64,
    pub fail_rate: f64,
    /// Mean over records that carry a percentage, 2 decimals
    pub average_defect_percentage: f64,
    /// Mean over records that carry a confidence, 4 decimals
    pub average_confidence: f64,
}

/// Summary result or the explicit "no data" marker
///
/// Serializes untagged: statistics as a plain object, the marker as
/// `{"error": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SummaryReport {
    Available(SummaryStatistics),
    NoData { error: String },
}

impl SummaryReport {
    fn no_data(message: impl Into<String>) -> Self {
        SummaryReport::NoData {
            error: message.into(),
        }
    }

    /// Statistics, or `None` for the no-data marker
    pub fn stats(&self) -> Option<&SummaryStatistics> {
        match self {
            SummaryReport::Available(stats) => Some(stats),
            SummaryReport::NoData { .. } => None,
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, SummaryReport::NoData { .. })
    }
}

/// Per-machine rollup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineStatistics {
    /// `{machine_type}_{machine_id}`
    pub machine_id: String,
    pub total_wafers: usize,
    pub pass_count: usize,
    pub fail_count: usize,
    pub pass_rate: f64,
    pub average_defect_percentage: f64,
    pub defect_class_distribution: BTreeMap<String, usize>,
}

/// Entry of the machine performance ranking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineRanking {
    pub machine: String,
    pub pass_rate: f64,
    pub total_wafers: usize,
    pub average_defect_percentage: f64,
}

/// Defect class histogram
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefectDistribution {
    pub counts: BTreeMap<String, usize>,
    /// Share of each class in percent, 2 decimals
    pub percentages: BTreeMap<String, f64>,
}

/// Rollup for one simulation date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateStatistics {
    pub total_wafers: usize,
    pub pass_count: usize,
    pub fail_count: usize,
    pub pass_rate: f64,
    pub avg_defect_percentage: f64,
    /// Records strictly above the aggregator's alert threshold
    pub anomalies: usize,
}

/// One day of a time series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyPoint {
    pub date: NaiveDate,
    pub total_wafers: usize,
    pub pass_count: usize,
    pub fail_count: usize,
    pub pass_rate: f64,
    pub average_defect_percentage: f64,
}

/// Per-day trend data since a start date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub key: TemporalKey,
    pub since: NaiveDate,
    pub total_wafers: usize,
    /// Ascending by date
    pub daily_breakdown: Vec<DailyPoint>,
}

/// Running counters shared by the grouped rollups
#[derive(Default)]
struct Tally {
    total: usize,
    pass: usize,
    percentages: Vec<f64>,
}

impl Tally {
    fn add(&mut self, entry: &ResultEntry) {
        self.total += 1;
        if entry.is_pass() {
            self.pass += 1;
        }
        if let Some(pct) = entry.defect_percentage {
            self.percentages.push(pct);
        }
    }

    fn fail(&self) -> usize {
        self.total - self.pass
    }

    fn pass_rate(&self) -> f64 {
        percent(self.pass, self.total)
    }

    fn mean_percentage(&self) -> f64 {
        mean(&self.percentages)
    }
}

/// Loads snapshot files and answers filtering and statistics queries
#[derive(Debug, Clone)]
pub struct DataAggregator {
    results_dir: PathBuf,
    alert_threshold: f64,
    data: Vec<ResultEntry>,
}

impl DataAggregator {
    /// Create an aggregator over a results directory (nothing loaded yet)
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
            alert_threshold: DEFAULT_DEFECT_THRESHOLD,
            data: Vec::new(),
        }
    }

    /// Aggregator over records already in memory
    pub fn from_entries(entries: Vec<ResultEntry>) -> Self {
        Self {
            results_dir: PathBuf::new(),
            alert_threshold: DEFAULT_DEFECT_THRESHOLD,
            data: entries,
        }
    }

    /// Aggregator over serialized records; non-object values are dropped
    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        Self::from_entries(values.into_iter().filter_map(ResultEntry::from_value).collect())
    }

    /// Threshold used for the per-date anomaly count
    pub fn with_alert_threshold(mut self, threshold: f64) -> Self {
        self.alert_threshold = threshold;
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Load one file, or every snapshot in the results directory
    ///
    /// Directory scans order files by modification time, newest first, and
    /// concatenate their records file by file. The previous in-memory copy
    /// is replaced, so repeated calls are idempotent. Unreadable or
    /// malformed files are skipped with a warning.
    pub fn load_results(&mut self, file_path: Option<&Path>) -> &[ResultEntry] {
        let files = match file_path {
            Some(path) => vec![path.to_path_buf()],
            None => discover_snapshot_files(&self.results_dir),
        };

        let mut loaded = Vec::new();
        for path in &files {
            match read_snapshot(path) {
                Ok(values) => {
                    let before = loaded.len();
                    for value in values {
                        match ResultEntry::from_value(value) {
                            Some(entry) => loaded.push(entry),
                            None => warn!(
                                file = %path.display(),
                                "Skipping non-object record in snapshot"
                            ),
                        }
                    }
                    debug!(
                        file = %path.display(),
                        records = loaded.len() - before,
                        "Loaded snapshot file"
                    );
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Error loading snapshot file");
                }
            }
        }

        info!(files = files.len(), records = loaded.len(), "Results loaded");
        self.data = loaded;
        &self.data
    }

    /// Exact match on `simulation_date`
    pub fn filter_by_simulation_date(&self, simulation_date: &str) -> Vec<ResultEntry> {
        self.filter_by_date(TemporalKey::SimulationDate, simulation_date)
    }

    /// Exact match on the date selected by `key`
    pub fn filter_by_date(&self, key: TemporalKey, date: &str) -> Vec<ResultEntry> {
        self.data
            .iter()
            .filter(|entry| key.date_of(entry).as_deref() == Some(date))
            .cloned()
            .collect()
    }

    /// Distinct simulation dates, most recent first
    pub fn get_available_simulation_dates(&self) -> Vec<String> {
        self.get_available_dates(TemporalKey::SimulationDate)
    }

    /// Distinct dates under `key`, most recent first
    pub fn get_available_dates(&self, key: TemporalKey) -> Vec<String> {
        let mut dates: Vec<String> = self.data.iter().filter_map(|e| key.date_of(e)).collect();
        dates.sort_unstable_by(|a, b| b.cmp(a));
        dates.dedup();
        dates
    }

    pub fn get_summary_statistics(&self) -> SummaryReport {
        if self.data.is_empty() {
            return SummaryReport::no_data("No data loaded");
        }
        SummaryReport::Available(summarize(&self.data))
    }

    /// Summary over one simulation date
    pub fn get_daily_statistics(&self, simulation_date: &str) -> SummaryReport {
        self.get_statistics_for_date(TemporalKey::SimulationDate, simulation_date)
    }

    /// Summary over the records whose `key` date equals `date`
    pub fn get_statistics_for_date(&self, key: TemporalKey, date: &str) -> SummaryReport {
        let daily = self.filter_by_date(key, date);
        if daily.is_empty() {
            return SummaryReport::no_data(format!("No data found for date {}", date));
        }
        SummaryReport::Available(summarize(&daily))
    }

    /// Per-machine statistics in order of first appearance
    pub fn get_machine_statistics(&self) -> Vec<MachineStatistics> {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, (Tally, BTreeMap<String, usize>)> = HashMap::new();

        for entry in &self.data {
            let key = entry.machine_key();
            let (tally, classes) = groups.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                Default::default()
            });
            tally.add(entry);
            *classes
                .entry(entry.defect_class_or_unknown().to_string())
                .or_insert(0) += 1;
        }

        order
            .into_iter()
            .filter_map(|key| {
                let (tally, classes) = groups.remove(&key)?;
                Some(MachineStatistics {
                    machine_id: key,
                    total_wafers: tally.total,
                    pass_count: tally.pass,
                    fail_count: tally.fail(),
                    pass_rate: round_to(tally.pass_rate(), 2),
                    average_defect_percentage: round_to(tally.mean_percentage(), 2),
                    defect_class_distribution: classes,
                })
            })
            .collect()
    }

    pub fn get_defect_distribution(&self) -> DefectDistribution {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for entry in &self.data {
            *counts
                .entry(entry.defect_class_or_unknown().to_string())
                .or_insert(0) += 1;
        }

        let total: usize = counts.values().sum();
        let percentages = counts
            .iter()
            .map(|(class, count)| (class.clone(), round_to(percent(*count, total), 2)))
            .collect();

        DefectDistribution {
            counts,
            percentages,
        }
    }

    /// Records with `defect_percentage > threshold`, highest first
    ///
    /// The sort is stable, so tied records keep their load order. Records
    /// without a percentage never qualify.
    pub fn get_anomalies(&self, threshold_percentage: f64) -> Vec<ResultEntry> {
        let mut anomalies: Vec<ResultEntry> = self
            .data
            .iter()
            .filter(|entry| {
                entry
                    .defect_percentage
                    .is_some_and(|pct| pct > threshold_percentage)
            })
            .cloned()
            .collect();

        anomalies.sort_by(|a, b| {
            let a = a.defect_percentage.unwrap_or(0.0);
            let b = b.defect_percentage.unwrap_or(0.0);
            b.total_cmp(&a)
        });
        anomalies
    }

    /// Machines by pass rate, best first (stable for ties)
    pub fn get_machine_performance_ranking(&self) -> Vec<MachineRanking> {
        let mut ranking: Vec<MachineRanking> = self
            .get_machine_statistics()
            .into_iter()
            .map(|stats| MachineRanking {
                machine: stats.machine_id,
                pass_rate: stats.pass_rate,
                total_wafers: stats.total_wafers,
                average_defect_percentage: stats.average_defect_percentage,
            })
            .collect();

        ranking.sort_by(|a, b| b.pass_rate.total_cmp(&a.pass_rate));
        ranking
    }

    /// Per simulation date breakdown; records without a date are left out
    pub fn get_date_statistics(&self) -> BTreeMap<String, DateStatistics> {
        let mut tallies: BTreeMap<String, (Tally, usize)> = BTreeMap::new();

        for entry in &self.data {
            let Some(date) = entry.simulation_date.as_ref() else {
                continue;
            };
            let (tally, anomalies) = tallies.entry(date.clone()).or_default();
            tally.add(entry);
            if entry
                .defect_percentage
                .is_some_and(|pct| pct > self.alert_threshold)
            {
                *anomalies += 1;
            }
        }

        tallies
            .into_iter()
            .map(|(date, (tally, anomalies))| {
                let stats = DateStatistics {
                    total_wafers: tally.total,
                    pass_count: tally.pass,
                    fail_count: tally.fail(),
                    pass_rate: round_to(tally.pass_rate(), 2),
                    avg_defect_percentage: round_to(tally.mean_percentage(), 2),
                    anomalies,
                };
                (date, stats)
            })
            .collect()
    }

    /// Daily trend for every date under `key` on or after `since`
    pub fn get_time_series(&self, key: TemporalKey, since: NaiveDate) -> TimeSeries {
        let mut days: BTreeMap<NaiveDate, Tally> = BTreeMap::new();

        for entry in &self.data {
            match key.naive_date_of(entry) {
                Some(date) if date >= since => days.entry(date).or_default().add(entry),
                _ => {}
            }
        }

        let daily_breakdown: Vec<DailyPoint> = days
            .into_iter()
            .map(|(date, tally)| DailyPoint {
                date,
                total_wafers: tally.total,
                pass_count: tally.pass,
                fail_count: tally.fail(),
                pass_rate: round_to(tally.pass_rate(), 2),
                average_defect_percentage: round_to(tally.mean_percentage(), 2),
            })
            .collect();

        TimeSeries {
            key,
            since,
            total_wafers: daily_breakdown.iter().map(|d| d.total_wafers).sum(),
            daily_breakdown,
        }
    }
}

fn summarize(entries: &[ResultEntry]) -> SummaryStatistics {
    let mut tally = Tally::default();
    let mut confidences = Vec::new();
    for entry in entries {
        tally.add(entry);
        if let Some(confidence) = entry.confidence {
            confidences.push(confidence);
        }
    }

    SummaryStatistics {
        total_wafers: tally.total,
        pass_count: tally.pass,
        fail_count: tally.fail(),
        pass_rate: tally.pass_rate(),
        fail_rate: percent(tally.fail(), tally.total),
        average_defect_percentage: round_to(tally.mean_percentage(), 2),
        average_confidence: round_to(mean(&confidences), 4),
    }
}

/// `results_*.json` files in `dir`, newest modification first
fn discover_snapshot_files(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Results directory not readable");
            return Vec::new();
        }
    };

    let mut files: Vec<(SystemTime, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| is_snapshot_file(path))
        .map(|path| {
            let modified = fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, path)
        })
        .collect();

    files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
    files.into_iter().map(|(_, path)| path).collect()
}

fn is_snapshot_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    path.is_file() && name.starts_with(RESULTS_FILE_PREFIX) && name.ends_with(".json")
}

/// A snapshot is a JSON array; a lone object counts as one record
fn read_snapshot(path: &Path) -> crate::Result<Vec<Value>> {
    let content = fs::read_to_string(path)?;
    match serde_json::from_str::<Value>(&content)? {
        Value::Array(values) => Ok(values),
        other => Ok(vec![other]),
    }
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(date: &str, pct: Option<f64>, status: &str) -> ResultEntry {
        let mut value = json!({
            "machine_id": "MECH_01",
            "machine_type": "Mechanical",
            "simulation_date": date,
            "quality_status": status,
            "prediction": {"defect_class": "Normal", "confidence": 0.8}
        });
        if let Some(pct) = pct {
            value["defect_percentage"] = json!(pct);
        }
        ResultEntry::from_value(value).unwrap()
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(33.333333, 2), 33.33);
        assert_eq!(round_to(0.123456, 4), 0.1235);
        assert_eq!(round_to(0.0, 2), 0.0);
    }

    #[test]
    fn test_percent_guards_zero_total() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(1, 4), 25.0);
    }

    #[test]
    fn test_missing_percentage_counted_but_not_averaged() {
        let aggregator = DataAggregator::from_entries(vec![
            entry("2025-01-01", Some(20.0), "PASS"),
            entry("2025-01-01", None, "PASS"),
        ]);
        let stats = aggregator.get_summary_statistics();
        let stats = stats.stats().unwrap();
        assert_eq!(stats.total_wafers, 2);
        assert_eq!(stats.average_defect_percentage, 20.0);
    }

    #[test]
    fn test_date_statistics_anomaly_threshold() {
        let aggregator = DataAggregator::from_entries(vec![
            entry("2025-01-01", Some(40.0), "PASS"),
            entry("2025-01-01", Some(40.5), "FAIL"),
            entry("2025-01-02", Some(90.0), "FAIL"),
        ])
        .with_alert_threshold(40.0);

        let by_date = aggregator.get_date_statistics();
        assert_eq!(by_date["2025-01-01"].anomalies, 1);
        assert_eq!(by_date["2025-01-01"].pass_rate, 50.0);
        assert_eq!(by_date["2025-01-02"].anomalies, 1);
        assert_eq!(by_date["2025-01-02"].avg_defect_percentage, 90.0);
    }

    #[test]
    fn test_no_data_marker_serialization() {
        let aggregator = DataAggregator::from_entries(Vec::new());
        let report = aggregator.get_summary_statistics();
        assert!(report.is_no_data());
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({"error": "No data loaded"})
        );
    }

    #[test]
    fn test_temporal_key_never_falls_back() {
        let no_timestamp = entry("2025-03-04", Some(1.0), "PASS");
        assert_eq!(
            TemporalKey::SimulationDate.date_of(&no_timestamp).as_deref(),
            Some("2025-03-04")
        );
        assert_eq!(TemporalKey::Timestamp.date_of(&no_timestamp), None);
    }
}
