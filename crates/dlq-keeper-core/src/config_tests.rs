//! Tests for configuration loading

use super::*;
use std::io::Write;
use tempfile::NamedTempFile;

fn temp_file(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn env(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
    Some(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

mod defaults_tests {
    use super::*;

    /// Verify the defaults are valid
    #[test]
    fn test_defaults_validate() {
        let config = DlqKeeperConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.monitor.peek_batch_size, 100);
        assert_eq!(config.rate_limit.window_seconds, 3600);
        assert_eq!(config.circuit_breaker.window_size, 50);
        assert_eq!(config.orchestrator.scan_interval_seconds, 60);
        assert_eq!(config.logging.level, "info");
    }

    /// Verify an empty environment yields the defaults
    #[test]
    fn test_load_without_sources() {
        let config = DlqKeeperConfig::load_with_env(None, env(&[])).unwrap();

        assert_eq!(config, DlqKeeperConfig::default());
    }
}

mod file_tests {
    use super::*;

    /// Verify a partial YAML file overrides only what it names
    #[test]
    fn test_from_yaml_file() {
        let file = temp_file(
            ".yaml",
            "monitor:\n  peek_batch_size: 25\norchestrator:\n  namespaces: [ns-a, ns-b]\n",
        );

        let config = DlqKeeperConfig::from_file(file.path()).unwrap();

        assert_eq!(config.monitor.peek_batch_size, 25);
        assert_eq!(config.monitor.body_preview_bytes, 512);
        assert_eq!(config.orchestrator.namespaces.len(), 2);
        assert_eq!(config.orchestrator.namespaces[1].as_str(), "ns-b");
    }

    /// Verify JSON files are accepted
    #[test]
    fn test_from_json_file() {
        let file = temp_file(".json", r#"{"circuit_breaker": {"min_success_rate": 0.5}}"#);

        let config = DlqKeeperConfig::from_file(file.path()).unwrap();

        assert_eq!(config.circuit_breaker.min_success_rate, 0.5);
    }

    /// Verify a missing file is a load error
    #[test]
    fn test_from_missing_file() {
        let err = DlqKeeperConfig::from_file(Path::new("/nonexistent/dlq-keeper.yaml")).unwrap_err();

        assert!(matches!(err, ConfigError::Load { .. }));
    }

    /// Verify a malformed file is a load error
    #[test]
    fn test_from_malformed_file() {
        let file = temp_file(".yaml", "monitor: [not, a, map]\n");

        let err = DlqKeeperConfig::from_file(file.path()).unwrap_err();

        assert!(matches!(err, ConfigError::Load { .. }));
    }

    /// Verify file contents are validated
    #[test]
    fn test_from_file_validates() {
        let file = temp_file(".yaml", "rate_limit:\n  window_seconds: 0\n");

        let err = DlqKeeperConfig::from_file(file.path()).unwrap_err();

        match err {
            ConfigError::Invalid { field, .. } => assert_eq!(field, "rate_limit.window_seconds"),
            other => panic!("expected invalid field, got {other:?}"),
        }
    }
}

mod layering_tests {
    use super::*;

    /// Verify an explicit file is layered over the defaults
    #[test]
    fn test_explicit_file() {
        let file = temp_file(".yaml", "executor:\n  broker_timeout_seconds: 5\n");

        let config = DlqKeeperConfig::load_with_env(Some(file.path()), env(&[])).unwrap();

        assert_eq!(config.executor.broker_timeout_seconds, 5);
        assert_eq!(config.executor.retry_base_delay_ms, 500);
    }

    /// Verify a missing explicit file is an error
    #[test]
    fn test_explicit_file_is_required() {
        let err = DlqKeeperConfig::load_with_env(
            Some(Path::new("/nonexistent/dlq-keeper.yaml")),
            env(&[]),
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::Load { .. }));
    }

    /// Verify environment variables override file values
    #[test]
    fn test_environment_overrides_file() {
        let file = temp_file(".yaml", "monitor:\n  peek_batch_size: 25\n");

        let config = DlqKeeperConfig::load_with_env(
            Some(file.path()),
            env(&[
                ("DLQK__MONITOR__PEEK_BATCH_SIZE", "50"),
                ("DLQK__LOGGING__JSON_FORMAT", "true"),
                ("DLQK__ORCHESTRATOR__NAMESPACES", "ns-a,ns-b"),
            ]),
        )
        .unwrap();

        assert_eq!(config.monitor.peek_batch_size, 50);
        assert!(config.logging.json_format);
        assert_eq!(config.orchestrator.namespaces.len(), 2);
    }

    /// Verify values that cannot be coerced fail loading
    #[test]
    fn test_environment_type_mismatch() {
        let err = DlqKeeperConfig::load_with_env(
            None,
            env(&[("DLQK__MONITOR__PEEK_BATCH_SIZE", "lots")]),
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::Load { .. }));
    }
}

mod validation_tests {
    use super::*;

    fn field_of(config: &DlqKeeperConfig) -> String {
        match config.validate() {
            Err(ConfigError::Invalid { field, .. }) => field,
            other => panic!("expected invalid field, got {other:?}"),
        }
    }

    /// Verify each zero or out-of-range value is named
    #[test]
    fn test_rejects_nonsensical_values() {
        let mut config = DlqKeeperConfig::default();
        config.monitor.peek_batch_size = 0;
        assert_eq!(field_of(&config), "monitor.peek_batch_size");

        let mut config = DlqKeeperConfig::default();
        config.circuit_breaker.min_success_rate = 1.5;
        assert_eq!(field_of(&config), "circuit_breaker");

        let mut config = DlqKeeperConfig::default();
        config.orchestrator.max_concurrent_namespaces = 0;
        assert_eq!(field_of(&config), "orchestrator.max_concurrent_namespaces");

        let mut config = DlqKeeperConfig::default();
        config.executor.retry_base_delay_ms = 60_000;
        assert_eq!(field_of(&config), "executor.retry_base_delay_ms");
    }

    /// Verify log levels are checked case-insensitively
    #[test]
    fn test_log_level() {
        let mut config = DlqKeeperConfig::default();
        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.logging.level = "loud".to_string();
        assert_eq!(field_of(&config), "logging.level");
    }
}
