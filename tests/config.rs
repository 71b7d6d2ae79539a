use std::time::Duration;

use assert_matches::assert_matches;

use kira_expression_index::config::{Config, ConfigLoader};
use kira_expression_index::error::KiraError;

#[test]
fn loads_overrides_from_json_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("kira-ei.json");
    std::fs::write(
        &path,
        r#"{
            "schema_version": 1,
            "api_base_url": "http://localhost:8080/",
            "data_root": "/tmp/kira-ei-data",
            "min_cases": 50,
            "checkpoint_interval": 100,
            "case_concurrency": 2,
            "case_delay_ms": 250,
            "download_timeout_secs": 30,
            "count_column": "stranded_first",
            "skip_indexed_cases": true
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.api_base_url, "http://localhost:8080");
    assert_eq!(resolved.data_root.as_str(), "/tmp/kira-ei-data");
    assert_eq!(resolved.min_cases, 50);
    assert_eq!(resolved.checkpoint_interval, 100);
    assert_eq!(resolved.checkpoint_keep, 3);
    assert_eq!(resolved.case_concurrency, 2);
    assert_eq!(resolved.case_delay, Duration::from_millis(250));
    assert_eq!(resolved.download_timeout, Duration::from_secs(30));
    assert_eq!(resolved.count_column, "stranded_first");
    assert!(resolved.skip_indexed_cases);
}

#[test]
fn explicit_missing_file_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, KiraError::ConfigRead(_));
}

#[test]
fn malformed_json_is_a_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("kira-ei.json");
    std::fs::write(&path, "{ not json").unwrap();
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, KiraError::ConfigParse(_));
}

#[test]
fn zero_values_are_rejected() {
    let config = Config {
        case_concurrency: Some(0),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(KiraError::ConfigValue {
            key: "case_concurrency",
            ..
        })
    );

    let config = Config {
        download_timeout_secs: Some(0),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(KiraError::ConfigValue {
            key: "download_timeout_secs",
            ..
        })
    );
}
