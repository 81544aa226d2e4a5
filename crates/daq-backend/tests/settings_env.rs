//! Environment layering. Kept in its own test binary because it mutates the process environment.

use daq_backend::{LogFormat, Settings};

#[test]
fn environment_overrides_file_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lab.toml");
    std::fs::write(
        &path,
        r#"
        log_format = "compact"
        record_samples = 10
        [flush]
        interval_s = 5.0
        "#,
    )
    .unwrap();

    std::env::set_var("LABDAQ_RECORD_SAMPLES", "42");
    std::env::set_var("LABDAQ_FLUSH__INTERVAL_S", "2.5");
    let settings = Settings::load(Some(&path)).unwrap();
    std::env::remove_var("LABDAQ_RECORD_SAMPLES");
    std::env::remove_var("LABDAQ_FLUSH__INTERVAL_S");

    assert_eq!(settings.log_format, LogFormat::Compact);
    assert_eq!(settings.record_samples, 42);
    assert_eq!(settings.flush.interval_s, 2.5);
    assert!(settings.flush.periodic);
}
