//! Tests for bootstrap configuration and root folder resolution
//!
//! Tests that touch WAFER_ROOT_FOLDER are marked #[serial] so they do not
//! race each other on the process environment.

use serial_test::serial;
use std::env;
use std::path::{Path, PathBuf};
use wafer_common::config::{
    default_root_folder, resolve_root_folder, MachineTiming, OutputDirs, TomlConfig,
    ROOT_FOLDER_ENV,
};
use wafer_common::{Error, MachineType};

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let temp = tempfile::tempdir().unwrap();
    let config = TomlConfig::load(Some(&temp.path().join("absent.toml"))).unwrap();

    assert_eq!(config.server.port, 5730);
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.simulation.defect_threshold, 40.0);
    assert_eq!(config.simulation.normal_bias, 0.7);
    assert_eq!(config.simulation.duration_seconds, 60);
    assert_eq!(config.simulation.max_wafers, None);
    assert!(config.root_folder.is_none());
}

#[test]
fn test_partial_file_keeps_remaining_defaults() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("wafer-sim.toml");
    std::fs::write(
        &path,
        r#"
root_folder = "/srv/wafer"

[server]
port = 6000

[simulation]
thermal = 2
max_wafers = 25

[timing.thermal]
min_seconds = 1.0
max_seconds = 2.5
"#,
    )
    .unwrap();

    let config = TomlConfig::load(Some(&path)).unwrap();
    assert_eq!(config.root_folder, Some(PathBuf::from("/srv/wafer")));
    assert_eq!(config.server.port, 6000);
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.simulation.thermal, 2);
    assert_eq!(config.simulation.mechanical, 1);
    assert_eq!(config.simulation.max_wafers, Some(25));
    assert_eq!(
        config.timing.for_type(MachineType::Thermal),
        MachineTiming::new(1.0, 2.5)
    );
    assert_eq!(
        config.timing.for_type(MachineType::Mechanical),
        MachineTiming::new(5.0, 8.0)
    );
}

#[test]
fn test_malformed_file_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("wafer-sim.toml");
    std::fs::write(&path, "[server\nport = ").unwrap();

    assert!(matches!(TomlConfig::load(Some(&path)), Err(Error::Config(_))));
}

#[test]
fn test_validation_rejects_out_of_range_values() {
    let bad = [
        "[simulation]\ndefect_threshold = 140.0",
        "[simulation]\nnormal_bias = 1.5",
        "[simulation]\nmax_wafers = 0",
        "[timing.electrical]\nmin_seconds = 9.0\nmax_seconds = 3.0",
        "[timing.mechanical]\nmin_seconds = 0.0\nmax_seconds = 3.0",
    ];
    for content in bad {
        assert!(
            matches!(TomlConfig::from_toml_str(content), Err(Error::Config(_))),
            "expected rejection of {:?}",
            content
        );
    }
}

#[test]
#[serial]
fn test_cli_argument_wins() {
    env::set_var(ROOT_FOLDER_ENV, "/tmp/wafer-env-root");
    let resolved = resolve_root_folder(
        Some(Path::new("/tmp/wafer-cli-root")),
        ROOT_FOLDER_ENV,
        Some(Path::new("/tmp/wafer-toml-root")),
    );
    env::remove_var(ROOT_FOLDER_ENV);

    assert_eq!(resolved, PathBuf::from("/tmp/wafer-cli-root"));
}

#[test]
#[serial]
fn test_env_var_beats_toml() {
    env::set_var(ROOT_FOLDER_ENV, "/tmp/wafer-env-root");
    let resolved = resolve_root_folder(
        None,
        ROOT_FOLDER_ENV,
        Some(Path::new("/tmp/wafer-toml-root")),
    );
    env::remove_var(ROOT_FOLDER_ENV);

    assert_eq!(resolved, PathBuf::from("/tmp/wafer-env-root"));
}

#[test]
#[serial]
fn test_toml_then_os_default() {
    env::remove_var(ROOT_FOLDER_ENV);

    let from_toml = resolve_root_folder(None, ROOT_FOLDER_ENV, Some(Path::new("/tmp/wafer-toml-root")));
    assert_eq!(from_toml, PathBuf::from("/tmp/wafer-toml-root"));

    let fallback = resolve_root_folder(None, ROOT_FOLDER_ENV, None);
    assert_eq!(fallback, default_root_folder());
    assert!(fallback.ends_with("wafer-sim") || fallback.ends_with("wafer_sim_data"));
}

#[test]
fn test_output_dirs_created() {
    let temp = tempfile::tempdir().unwrap();
    let dirs = OutputDirs::under(temp.path());

    dirs.ensure().unwrap();
    assert!(dirs.results_dir.is_dir());
    assert!(dirs.processed_images_dir.is_dir());

    // Second call is a no-op
    dirs.ensure().unwrap();
}
