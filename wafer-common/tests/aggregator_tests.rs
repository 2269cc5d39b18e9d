//! Integration tests for snapshot loading and statistics
//!
//! Fixtures are written into temp directories as real snapshot files so the
//! discovery, ordering and skip-on-error paths are exercised.

use chrono::NaiveDate;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};
use wafer_common::{DataAggregator, SummaryReport, TemporalKey};

fn record(
    wafer_id: &str,
    machine: (&str, &str),
    date: &str,
    pct: f64,
    class: &str,
    confidence: f64,
) -> Value {
    json!({
        "wafer_id": wafer_id,
        "machine_type": machine.0,
        "machine_id": machine.1,
        "timestamp": format!("{}T09:30:00.000000+00:00", date),
        "simulation_date": date,
        "prediction": {"defect_class": class, "confidence": confidence},
        "defect_percentage": pct,
        "quality_status": if pct <= 40.0 { "PASS" } else { "FAIL" },
    })
}

fn write_snapshot(dir: &Path, name: &str, records: &[Value], age_secs: u64) {
    let path = dir.join(name);
    fs::write(&path, serde_json::to_string_pretty(records).unwrap()).unwrap();
    let mtime = SystemTime::now() - Duration::from_secs(age_secs);
    fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(mtime)
        .unwrap();
}

/// Ten wafers on 2025-01-01: six at 10% and four at 55%
fn ten_wafer_run() -> Vec<Value> {
    let mech = ("Mechanical", "MECH_01");
    (1..=10)
        .map(|i| {
            let (pct, class) = if i <= 6 { (10.0, "Normal") } else { (55.0, "Scratch") };
            record(&format!("Mechanical_MECH_01_W{:04}", i), mech, "2025-01-01", pct, class, 0.9)
        })
        .collect()
}

#[test]
fn test_ten_wafer_scenario() {
    let temp = tempfile::tempdir().unwrap();
    write_snapshot(temp.path(), "results_20250101_090000.json", &ten_wafer_run(), 0);

    let mut aggregator = DataAggregator::new(temp.path());
    assert_eq!(aggregator.load_results(None).len(), 10);

    let summary = aggregator.get_summary_statistics();
    let stats = summary.stats().unwrap();
    assert_eq!(stats.total_wafers, 10);
    assert_eq!(stats.pass_count, 6);
    assert_eq!(stats.fail_count, 4);
    assert_eq!(stats.pass_rate, 60.0);
    assert_eq!(stats.fail_rate, 40.0);
    assert_eq!(stats.average_defect_percentage, 28.0);
    assert_eq!(stats.average_confidence, 0.9);

    let anomalies = aggregator.get_anomalies(40.0);
    let ids: Vec<_> = anomalies.iter().filter_map(|e| e.wafer_id.as_deref()).collect();
    assert_eq!(
        ids,
        [
            "Mechanical_MECH_01_W0007",
            "Mechanical_MECH_01_W0008",
            "Mechanical_MECH_01_W0009",
            "Mechanical_MECH_01_W0010",
        ]
    );
}

#[test]
fn test_files_loaded_newest_first_and_malformed_skipped() {
    let temp = tempfile::tempdir().unwrap();
    let therm = ("Thermal", "THERM_01");
    write_snapshot(
        temp.path(),
        "results_20250101_080000.json",
        &[record("old", therm, "2025-01-01", 5.0, "Normal", 0.8)],
        600,
    );
    write_snapshot(
        temp.path(),
        "results_20250102_080000.json",
        &[record("new", therm, "2025-01-02", 5.0, "Normal", 0.8)],
        10,
    );
    fs::write(temp.path().join("results_20250103_080000.json"), "[{\"wafer_id\": ").unwrap();
    fs::write(temp.path().join("notes.json"), "[]").unwrap();

    let mut aggregator = DataAggregator::new(temp.path());
    let ids: Vec<_> = aggregator
        .load_results(None)
        .iter()
        .filter_map(|e| e.wafer_id.clone())
        .collect();
    assert_eq!(ids, ["new", "old"]);
}

#[test]
fn test_explicit_file_and_single_object_snapshot() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("elsewhere.json");
    let single = record("solo", ("Electrical", "ELEC_01"), "2025-02-02", 70.0, "Donut", 0.6);
    fs::write(&path, single.to_string()).unwrap();

    let mut aggregator = DataAggregator::new(temp.path());
    assert_eq!(aggregator.load_results(Some(&path)).len(), 1);

    // Directory scan ignores files without the results_ prefix
    assert!(aggregator.load_results(None).is_empty());
}

#[test]
fn test_missing_directory_yields_no_data() {
    let temp = tempfile::tempdir().unwrap();
    let mut aggregator = DataAggregator::new(temp.path().join("never_created"));

    assert!(aggregator.load_results(None).is_empty());
    assert_eq!(
        aggregator.get_summary_statistics(),
        SummaryReport::NoData {
            error: "No data loaded".to_string()
        }
    );
    assert!(aggregator.get_machine_statistics().is_empty());
    assert!(aggregator.get_defect_distribution().counts.is_empty());
    assert!(aggregator.get_defect_distribution().percentages.is_empty());
    assert!(aggregator.get_anomalies(0.0).is_empty());
    assert!(aggregator.get_date_statistics().is_empty());
}

#[test]
fn test_reload_is_idempotent() {
    let temp = tempfile::tempdir().unwrap();
    write_snapshot(temp.path(), "results_20250101_090000.json", &ten_wafer_run(), 0);

    let mut aggregator = DataAggregator::new(temp.path());
    aggregator.load_results(None);
    let first = aggregator.get_summary_statistics();
    let first_machines = aggregator.get_machine_statistics();

    aggregator.load_results(None);
    assert_eq!(aggregator.len(), 10);
    assert_eq!(aggregator.get_summary_statistics(), first);
    assert_eq!(aggregator.get_machine_statistics(), first_machines);
}

#[test]
fn test_defect_distribution_sums_to_hundred() {
    let mech = ("Mechanical", "MECH_01");
    let aggregator = DataAggregator::from_values(vec![
        record("a", mech, "2025-01-01", 1.0, "Normal", 0.9),
        record("b", mech, "2025-01-01", 50.0, "Donut", 0.9),
        record("c", mech, "2025-01-01", 60.0, "Edge-Ring", 0.9),
        json!({"wafer_id": "d"}),
    ]);

    let distribution = aggregator.get_defect_distribution();
    assert_eq!(distribution.counts["Unknown"], 1);
    assert_eq!(distribution.percentages["Normal"], 25.0);
    let sum: f64 = distribution.percentages.values().sum();
    assert!((sum - 100.0).abs() < 0.05, "sum was {}", sum);
}

#[test]
fn test_machine_statistics_and_ranking() {
    let mech = ("Mechanical", "MECH_01");
    let elec = ("Electrical", "ELEC_01");
    let aggregator = DataAggregator::from_values(vec![
        record("m1", mech, "2025-01-01", 50.0, "Scratch", 0.9),
        record("e1", elec, "2025-01-01", 10.0, "Normal", 0.9),
        record("m2", mech, "2025-01-01", 20.0, "Normal", 0.9),
        record("e2", elec, "2025-01-01", 20.0, "Normal", 0.9),
        record("m3", mech, "2025-01-01", 30.0, "Normal", 0.9),
    ]);

    let machines = aggregator.get_machine_statistics();
    assert_eq!(machines.len(), 2);
    assert_eq!(machines[0].machine_id, "Mechanical_MECH_01");
    assert_eq!(machines[0].total_wafers, 3);
    assert_eq!(machines[0].pass_rate, 66.67);
    assert_eq!(machines[0].average_defect_percentage, 33.33);
    assert_eq!(machines[0].defect_class_distribution["Normal"], 2);
    assert_eq!(machines[1].machine_id, "Electrical_ELEC_01");

    let ranking = aggregator.get_machine_performance_ranking();
    assert_eq!(ranking[0].machine, "Electrical_ELEC_01");
    assert_eq!(ranking[0].pass_rate, 100.0);
    assert_eq!(ranking[1].machine, "Mechanical_MECH_01");
}

#[test]
fn test_ranking_ties_keep_first_appearance() {
    let aggregator = DataAggregator::from_values(vec![
        record("t", ("Thermal", "THERM_01"), "2025-01-01", 1.0, "Normal", 0.9),
        record("e", ("Electrical", "ELEC_01"), "2025-01-01", 1.0, "Normal", 0.9),
    ]);
    let ranking = aggregator.get_machine_performance_ranking();
    assert_eq!(ranking[0].machine, "Thermal_THERM_01");
    assert_eq!(ranking[1].machine, "Electrical_ELEC_01");
}

#[test]
fn test_anomalies_strict_descending_and_stable() {
    let mech = ("Mechanical", "MECH_01");
    let aggregator = DataAggregator::from_values(vec![
        record("at", mech, "2025-01-01", 40.0, "Normal", 0.9),
        record("first70", mech, "2025-01-01", 70.0, "Donut", 0.9),
        record("high", mech, "2025-01-01", 95.0, "Near-Full", 0.9),
        record("second70", mech, "2025-01-01", 70.0, "Donut", 0.9),
        json!({"wafer_id": "no_pct"}),
    ]);

    let ids: Vec<_> = aggregator
        .get_anomalies(40.0)
        .into_iter()
        .filter_map(|e| e.wafer_id)
        .collect();
    assert_eq!(ids, ["high", "first70", "second70"]);
    assert!(aggregator.get_anomalies(100.0).is_empty());
}

#[test]
fn test_daily_statistics_match_filtered_summary() {
    let mech = ("Mechanical", "MECH_01");
    let aggregator = DataAggregator::from_values(vec![
        record("a", mech, "2025-01-01", 10.0, "Normal", 0.8),
        record("b", mech, "2025-01-02", 80.0, "Donut", 0.7),
        record("c", mech, "2025-01-02", 30.0, "Normal", 0.95),
    ]);

    let filtered = DataAggregator::from_entries(aggregator.filter_by_simulation_date("2025-01-02"));
    assert_eq!(
        aggregator.get_daily_statistics("2025-01-02"),
        filtered.get_summary_statistics()
    );

    assert_eq!(
        aggregator.get_daily_statistics("2030-01-01"),
        SummaryReport::NoData {
            error: "No data found for date 2030-01-01".to_string()
        }
    );
}

#[test]
fn test_temporal_keys_are_independent() {
    let mech = ("Mechanical", "MECH_01");
    // Simulated day differs from the wall-clock day of creation
    let mut shifted = record("shifted", mech, "2025-01-01", 10.0, "Normal", 0.9);
    shifted["timestamp"] = json!("2025-03-15T12:00:00+00:00");
    let aggregator = DataAggregator::from_values(vec![
        shifted,
        record("plain", mech, "2025-03-15", 10.0, "Normal", 0.9),
    ]);

    assert_eq!(aggregator.get_available_simulation_dates(), ["2025-03-15", "2025-01-01"]);
    assert_eq!(aggregator.get_available_dates(TemporalKey::Timestamp), ["2025-03-15"]);
    assert_eq!(aggregator.filter_by_simulation_date("2025-01-01").len(), 1);
    assert_eq!(aggregator.filter_by_date(TemporalKey::Timestamp, "2025-03-15").len(), 2);
    assert!(aggregator.filter_by_date(TemporalKey::Timestamp, "2025-01-01").is_empty());
}

#[test]
fn test_date_statistics_and_time_series() {
    let mech = ("Mechanical", "MECH_01");
    let aggregator = DataAggregator::from_values(vec![
        record("a", mech, "2025-01-01", 10.0, "Normal", 0.9),
        record("b", mech, "2025-01-03", 55.0, "Donut", 0.9),
        record("c", mech, "2025-01-03", 45.0, "Donut", 0.9),
        record("d", mech, "2025-01-02", 20.0, "Normal", 0.9),
        json!({"wafer_id": "undated", "defect_percentage": 99.0}),
    ])
    .with_alert_threshold(50.0);

    let by_date = aggregator.get_date_statistics();
    assert_eq!(by_date.keys().collect::<Vec<_>>(), ["2025-01-01", "2025-01-02", "2025-01-03"]);
    let jan3 = &by_date["2025-01-03"];
    assert_eq!(jan3.total_wafers, 2);
    assert_eq!(jan3.fail_count, 2);
    assert_eq!(jan3.avg_defect_percentage, 50.0);
    assert_eq!(jan3.anomalies, 1);

    let since = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
    let series = aggregator.get_time_series(TemporalKey::SimulationDate, since);
    assert_eq!(series.total_wafers, 3);
    let days: Vec<_> = series.daily_breakdown.iter().map(|d| d.date).collect();
    assert_eq!(days, [since, NaiveDate::from_ymd_opt(2025, 1, 3).unwrap()]);
    assert_eq!(series.daily_breakdown[0].pass_rate, 100.0);
    assert_eq!(series.daily_breakdown[1].pass_rate, 0.0);
}
