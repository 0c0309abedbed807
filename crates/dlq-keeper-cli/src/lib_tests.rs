//! Tests for the dlq-keeper-cli library module.

use super::*;
use std::io::Write as _;
use tempfile::NamedTempFile;

const RULES_YAML: &str = r#"
rules:
  - name: lock-lost
    conditions:
      - field: DeadLetterReason
        operator: Contains
        value: Lock
    action:
      max_retries: 1
"#;

const SNAPSHOT_JSON: &str = r#"{
  "namespaces": [
    {
      "id": "ns-sim",
      "entities": [
        {
          "name": "orders",
          "dead_letters": [
            {"body": "a", "dead_letter_reason": "MessageLockLost"},
            {"body": "b", "dead_letter_reason": "MessageLockLost"},
            {"body": "c", "dead_letter_reason": "PoisonMessage"}
          ]
        }
      ]
    }
  ]
}"#;

fn temp_file(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

async fn run(command: Commands) -> Result<String, CliError> {
    let mut out = Vec::new();
    execute(command, &DlqKeeperConfig::default(), &mut out).await?;
    Ok(String::from_utf8(out).unwrap())
}

mod parsing_tests {
    use super::*;

    /// Verify global flags and nested subcommands parse
    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from([
            "dlq-keeper",
            "--log-level",
            "debug",
            "rules",
            "validate",
            "rules.yaml",
        ])
        .unwrap();

        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Commands::Rules {
                action: RuleCommands::Validate { file },
            } => assert_eq!(file, PathBuf::from("rules.yaml")),
            _ => panic!("Expected rules validate command"),
        }
    }

    /// Verify run waits for a signal unless a duration is given
    #[test]
    fn test_run_defaults() {
        let cli = Cli::try_parse_from(["dlq-keeper", "run", "-b", "s.json", "-r", "r.yaml"]).unwrap();
        match cli.command {
            Commands::Run {
                duration_seconds, ..
            } => assert_eq!(duration_seconds, None),
            _ => panic!("Expected run command"),
        }
    }

    /// Verify simulate defaults to one cycle
    #[test]
    fn test_simulate_defaults() {
        let cli =
            Cli::try_parse_from(["dlq-keeper", "simulate", "-b", "s.json", "-r", "r.yaml"]).unwrap();

        match cli.command {
            Commands::Simulate { cycles, .. } => assert_eq!(cycles, 1),
            _ => panic!("Expected simulate command"),
        }
    }

    /// Verify a missing subcommand is rejected
    #[test]
    fn test_requires_subcommand() {
        assert!(Cli::try_parse_from(["dlq-keeper"]).is_err());
    }
}

mod error_tests {
    use super::*;
    use dlq_keeper_core::ValidationError;

    /// Verify each error family has its own exit code
    #[test]
    fn test_exit_codes() {
        let config = CliError::Configuration(ConfigError::Load {
            message: "x".to_string(),
        });
        let validation = CliError::Validation(RuleError::InvalidFile { errors: vec![] });
        let core_validation = CliError::DlqKeeper(DlqKeeperError::Validation(
            ValidationError::Required {
                field: "name".to_string(),
            },
        ));
        let failed = CliError::CommandFailed {
            message: "x".to_string(),
        };
        let argument = CliError::InvalidArgument {
            arg: "cycles".to_string(),
            message: "x".to_string(),
        };
        let io = CliError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "x"));

        assert_eq!(config.exit_code(), 1);
        assert_eq!(validation.exit_code(), 2);
        assert_eq!(core_validation.exit_code(), 2);
        assert_eq!(failed.exit_code(), 3);
        assert_eq!(argument.exit_code(), 4);
        assert_eq!(io.exit_code(), 5);
    }
}

mod command_tests {
    use super::*;

    /// Verify the resolved configuration can be printed as JSON
    #[tokio::test]
    async fn test_config_show_json() {
        let output = run(Commands::Config {
            show: true,
            format: ConfigFormat::Json,
        })
        .await
        .unwrap();

        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["monitor"]["peek_batch_size"], 100);
    }

    /// Verify a valid rule file is summarized
    #[tokio::test]
    async fn test_rules_validate() {
        let rules = temp_file(".yaml", RULES_YAML);

        let output = run(Commands::Rules {
            action: RuleCommands::Validate {
                file: rules.path().to_path_buf(),
            },
        })
        .await
        .unwrap();

        assert!(output.contains("1 rule(s) valid"));
        assert!(output.contains("lock-lost (enabled, 1 condition(s))"));
    }

    /// Verify a missing rule file is an I/O error
    #[tokio::test]
    async fn test_rules_validate_missing_file() {
        let err = run(Commands::Rules {
            action: RuleCommands::Validate {
                file: PathBuf::from("/nonexistent/rules.yaml"),
            },
        })
        .await
        .unwrap_err();

        assert_eq!(err.exit_code(), 5);
    }

    /// Verify rules are matched against snapshot dead letters
    #[tokio::test]
    async fn test_rules_test() {
        let rules = temp_file(".yaml", RULES_YAML);
        let snapshot = temp_file(".json", SNAPSHOT_JSON);

        let output = run(Commands::Rules {
            action: RuleCommands::Test {
                rules_file: rules.path().to_path_buf(),
                messages_file: snapshot.path().to_path_buf(),
            },
        })
        .await
        .unwrap();

        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["messages"], 3);
        assert_eq!(value["matched"], 2);
    }

    /// Verify the classifier preview
    #[tokio::test]
    async fn test_classify() {
        let output = run(Commands::Classify {
            reason: Some("MessageLockLost".to_string()),
            description: None,
            delivery_count: 1,
        })
        .await
        .unwrap();

        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["category"], "Transient");
    }

    /// Verify a simulation replays matches once across cycles
    #[tokio::test]
    async fn test_simulate() {
        let rules = temp_file(".yaml", RULES_YAML);
        let snapshot = temp_file(".json", SNAPSHOT_JSON);

        let output = run(Commands::Simulate {
            broker: snapshot.path().to_path_buf(),
            rules: rules.path().to_path_buf(),
            cycles: 2,
        })
        .await
        .unwrap();

        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["cycles"].as_array().unwrap().len(), 2);
        assert_eq!(value["cycles"][0]["namespaces"][0]["report"]["replayed"], 2);
        assert_eq!(value["cycles"][1]["namespaces"][0]["report"]["replayed"], 0);
        assert_eq!(value["broker_replays"], 2);
        assert_eq!(value["summary"]["total"], 3);
    }

    /// Verify zero cycles is an invalid argument
    #[tokio::test]
    async fn test_simulate_requires_cycles() {
        let rules = temp_file(".yaml", RULES_YAML);
        let snapshot = temp_file(".json", SNAPSHOT_JSON);

        let err = run(Commands::Simulate {
            broker: snapshot.path().to_path_buf(),
            rules: rules.path().to_path_buf(),
            cycles: 0,
        })
        .await
        .unwrap_err();

        assert_eq!(err.exit_code(), 4);
    }

    /// Verify the polling loop runs until its duration elapses
    #[tokio::test(start_paused = true)]
    async fn test_run_until_duration_elapses() {
        let rules = temp_file(".yaml", RULES_YAML);
        let snapshot = temp_file(".json", SNAPSHOT_JSON);

        let output = run(Commands::Run {
            broker: snapshot.path().to_path_buf(),
            rules: rules.path().to_path_buf(),
            duration_seconds: Some(90),
        })
        .await
        .unwrap();

        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["namespaces"][0], "ns-sim");
        assert_eq!(value["broker_replays"], 2);
        assert_eq!(value["summary"]["total"], 3);
    }

    /// Verify a zero duration is an invalid argument
    #[tokio::test]
    async fn test_run_rejects_zero_duration() {
        let err = run(Commands::Run {
            broker: "s.json".into(),
            rules: "r.yaml".into(),
            duration_seconds: Some(0),
        })
        .await
        .unwrap_err();

        assert_eq!(err.exit_code(), 4);
    }

    /// Verify a missing snapshot is an I/O error
    #[tokio::test]
    async fn test_run_missing_snapshot() {
        let rules = temp_file(".yaml", RULES_YAML);

        let err = run(Commands::Run {
            broker: "/nonexistent/snapshot.json".into(),
            rules: rules.path().to_path_buf(),
            duration_seconds: Some(1),
        })
        .await
        .unwrap_err();

        assert_eq!(err.exit_code(), 5);
    }
}
