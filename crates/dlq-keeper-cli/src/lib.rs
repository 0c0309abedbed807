//! # DLQ Keeper CLI
//!
//! Command-line interface for the DLQ Keeper remediation engine.
//!
//! This module provides CLI commands for:
//! - Configuration validation
//! - Rule file validation and dry runs against broker snapshots
//! - Previewing the failure classifier
//! - Simulating remediation cycles against an in-memory broker
//! - Running the polling loop until interrupted
//!
//! Command output goes to stdout; logs go to stderr.

use clap::{Parser, Subcommand};
use dlq_broker::{BrokerSnapshot, InMemoryBroker};
use dlq_keeper_core::config::LoggingConfig;
use dlq_keeper_core::monitor::DlqMonitor;
use dlq_keeper_core::service::DlqSummary;
use dlq_keeper_core::store::{MessageFilter, MessageStore};
use dlq_keeper_core::{
    AutoReplayRule, ConfigError, CycleReport, DlqKeeper, DlqKeeperConfig, DlqKeeperError,
    FailureCategory, FailureClassifier, InMemoryDlqStore, NamespaceId, RuleEngine,
    RuleError, RuleSet,
};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ============================================================================
// CLI Structure
// ============================================================================

/// DLQ Keeper CLI - dead-letter queue detection and auto-remediation
#[derive(Parser)]
#[command(name = "dlq-keeper")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Dead-letter queue detection and auto-remediation")]
#[command(
    long_about = "DLQ Keeper detects dead-lettered messages, classifies their failures and replays them according to user-defined rules"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "DLQ_KEEPER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level, overrides the configured level
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate configuration
    Config {
        /// Print the resolved configuration
        #[arg(short, long)]
        show: bool,

        /// Output format for the configuration
        #[arg(short = 'f', long, default_value = "yaml")]
        format: ConfigFormat,
    },

    /// Rule file commands
    Rules {
        #[command(subcommand)]
        action: RuleCommands,
    },

    /// Preview how a dead-letter reason is classified
    Classify {
        /// Dead-letter reason reported by the broker
        #[arg(short, long)]
        reason: Option<String>,

        /// Dead-letter error description
        #[arg(short, long)]
        description: Option<String>,

        /// Delivery count of the message
        #[arg(short = 'n', long, default_value = "1")]
        delivery_count: u32,
    },

    /// Run remediation cycles against an in-memory broker snapshot
    Simulate {
        /// JSON broker snapshot
        #[arg(short, long)]
        broker: PathBuf,

        /// Rule definition file
        #[arg(short, long)]
        rules: PathBuf,

        /// Number of cycles to run
        #[arg(long, default_value = "1")]
        cycles: u32,
    },

    /// Poll the configured namespaces until Ctrl+C or SIGTERM
    Run {
        /// JSON broker snapshot seeding the in-memory broker
        #[arg(short, long)]
        broker: PathBuf,

        /// Rule definition file
        #[arg(short, long)]
        rules: PathBuf,

        /// Stop after this many seconds instead of waiting for a signal
        #[arg(long)]
        duration_seconds: Option<u64>,
    },
}

/// Rule file subcommands
#[derive(Subcommand)]
pub enum RuleCommands {
    /// Validate a rule definition file
    Validate {
        /// Rule definition file (YAML or JSON)
        file: PathBuf,
    },

    /// Evaluate rules against the dead letters of a broker snapshot
    Test {
        /// Rule definition file (YAML or JSON)
        rules_file: PathBuf,

        /// JSON broker snapshot
        messages_file: PathBuf,
    },
}

/// Configuration format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// JSON format
    Json,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Validation failed: {0}")]
    Validation(#[from] RuleError),

    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DLQ Keeper error: {0}")]
    DlqKeeper(#[from] DlqKeeperError),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Validation(_) => 2,
            Self::DlqKeeper(DlqKeeperError::Validation(_) | DlqKeeperError::Rule(_)) => 2,
            Self::CommandFailed { .. } | Self::DlqKeeper(_) => 3,
            Self::InvalidArgument { .. } => 4,
            Self::Io(_) => 5,
        }
    }
}

// ============================================================================
// Output Types
// ============================================================================

/// Classifier preview
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationOutput {
    pub category: FailureCategory,
    pub confidence: f64,
    pub replay_success_prior: f64,
}

/// Rules matching one dead-lettered message
#[derive(Debug, Clone, Serialize)]
pub struct MessageMatches {
    pub namespace_id: NamespaceId,
    pub entity_name: String,
    pub sequence_number: i64,
    pub dead_letter_reason: Option<String>,
    pub failure_category: FailureCategory,
    pub matched_rules: Vec<String>,
}

/// Result of dry-running a rule file
#[derive(Debug, Clone, Serialize)]
pub struct RuleTestReport {
    pub messages: usize,
    pub matched: usize,
    pub results: Vec<MessageMatches>,
}

/// One namespace within a simulated cycle
#[derive(Debug, Clone, Serialize)]
pub struct NamespaceOutcome {
    pub namespace_id: NamespaceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<CycleReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One simulated cycle across all namespaces
#[derive(Debug, Clone, Serialize)]
pub struct SimulatedCycle {
    pub cycle: u32,
    pub namespaces: Vec<NamespaceOutcome>,
}

/// Final state after the polling loop stopped
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub namespaces: Vec<NamespaceId>,
    pub broker_replays: u64,
    pub summary: DlqSummary,
}

/// Result of a simulation run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub cycles: Vec<SimulatedCycle>,
    /// Messages replayed on the simulated broker
    pub broker_replays: u64,
    pub summary: DlqSummary,
}

// ============================================================================
// Entry Points
// ============================================================================

/// Parse arguments, set up logging and run the selected command
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    // Logging needs the configured level, so it is set up before a
    // configuration error is reported.
    let config = DlqKeeperConfig::load(cli.config.as_deref());
    let logging = match &config {
        Ok(config) => config.logging.clone(),
        Err(_) => LoggingConfig::default(),
    };
    let level = cli.log_level.as_deref().unwrap_or(&logging.level);
    initialize_logging(level, cli.json_logs || logging.json_format)?;

    let config = config?;
    let mut stdout = std::io::stdout();
    execute(cli.command, &config, &mut stdout).await
}

/// Initialize logging on stderr
///
/// `RUST_LOG` takes precedence over `level`.
pub fn initialize_logging(level: &str, json: bool) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| CliError::InvalidArgument {
            arg: "log-level".to_string(),
            message: e.to_string(),
        })?;

    let json_layer = json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!json).then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| CliError::CommandFailed {
            message: format!("failed to initialize logging: {}", e),
        })
}

/// Run one command, writing its output to `out`
pub async fn execute<W: Write>(
    command: Commands,
    config: &DlqKeeperConfig,
    out: &mut W,
) -> Result<(), CliError> {
    match command {
        Commands::Config { show, format } => execute_config_command(config, show, format, out),
        Commands::Rules { action } => match action {
            RuleCommands::Validate { file } => execute_rules_validate(&file, out),
            RuleCommands::Test {
                rules_file,
                messages_file,
            } => execute_rules_test(config, &rules_file, &messages_file, out).await,
        },
        Commands::Classify {
            reason,
            description,
            delivery_count,
        } => execute_classify_command(
            config,
            reason.as_deref(),
            description.as_deref(),
            delivery_count,
            out,
        ),
        Commands::Simulate {
            broker,
            rules,
            cycles,
        } => execute_simulate_command(config, &broker, &rules, cycles, out).await,
        Commands::Run {
            broker,
            rules,
            duration_seconds,
        } => {
            let stop_after = duration_seconds.map(Duration::from_secs);
            execute_run_command(config, &broker, &rules, stop_after, out).await
        }
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

fn execute_config_command<W: Write>(
    config: &DlqKeeperConfig,
    show: bool,
    format: ConfigFormat,
    out: &mut W,
) -> Result<(), CliError> {
    if !show {
        writeln!(out, "Configuration is valid")?;
        return Ok(());
    }

    let rendered = match format {
        ConfigFormat::Yaml => serde_yaml::to_string(config).map_err(command_failed)?,
        ConfigFormat::Json => serde_json::to_string_pretty(config).map_err(command_failed)?,
    };
    writeln!(out, "{}", rendered.trim_end())?;
    Ok(())
}

fn execute_rules_validate<W: Write>(file: &Path, out: &mut W) -> Result<(), CliError> {
    let rule_set = load_rules(file)?;

    writeln!(
        out,
        "{}: {} rule(s) valid",
        file.display(),
        rule_set.rules.len()
    )?;
    for rule in &rule_set.rules {
        let state = if rule.enabled { "enabled" } else { "disabled" };
        writeln!(
            out,
            "  {} ({}, {} condition(s))",
            rule.name,
            state,
            rule.conditions.len()
        )?;
    }
    Ok(())
}

async fn execute_rules_test<W: Write>(
    config: &DlqKeeperConfig,
    rules_file: &Path,
    messages_file: &Path,
    out: &mut W,
) -> Result<(), CliError> {
    let rules: Vec<AutoReplayRule> = load_rules(rules_file)?
        .rules
        .into_iter()
        .map(AutoReplayRule::from_definition)
        .collect();
    let snapshot = load_snapshot(messages_file)?;
    let namespaces = snapshot_namespaces(&snapshot)?;

    // Detection runs through the monitor so previews and classification
    // match what the service would store.
    let broker = Arc::new(InMemoryBroker::from_snapshot(&snapshot).map_err(|e| {
        CliError::InvalidArgument {
            arg: "messages-file".to_string(),
            message: e.to_string(),
        }
    })?);
    let store = Arc::new(InMemoryDlqStore::new());
    let monitor = DlqMonitor::new(broker, store.clone(), config.monitor.clone());
    for namespace_id in &namespaces {
        monitor
            .scan_namespace(namespace_id)
            .await
            .map_err(DlqKeeperError::from)?;
    }

    let engine = RuleEngine::new();
    let messages = store
        .list_messages(&MessageFilter::default())
        .await
        .map_err(DlqKeeperError::from)?;
    let results: Vec<MessageMatches> = messages
        .iter()
        .map(|message| MessageMatches {
            namespace_id: message.namespace_id.clone(),
            entity_name: message.entity_name.clone(),
            sequence_number: message.sequence_number,
            dead_letter_reason: message.dead_letter_reason.clone(),
            failure_category: message.failure_category,
            matched_rules: engine
                .find_matching_rules(message, &rules)
                .into_iter()
                .map(|m| m.rule.name)
                .collect(),
        })
        .collect();

    let report = RuleTestReport {
        messages: results.len(),
        matched: results.iter().filter(|r| !r.matched_rules.is_empty()).count(),
        results,
    };
    info!(
        messages = report.messages,
        matched = report.matched,
        "Rule test complete"
    );
    write_json(out, &report)
}

fn execute_classify_command<W: Write>(
    config: &DlqKeeperConfig,
    reason: Option<&str>,
    description: Option<&str>,
    delivery_count: u32,
    out: &mut W,
) -> Result<(), CliError> {
    let classifier = FailureClassifier::new(config.monitor.max_delivery_count_hint);
    let classification = classifier.classify(reason, description, delivery_count);

    write_json(
        out,
        &ClassificationOutput {
            category: classification.category,
            confidence: classification.confidence,
            replay_success_prior: classification.category.replay_success_prior(),
        },
    )
}

async fn execute_simulate_command<W: Write>(
    config: &DlqKeeperConfig,
    broker_file: &Path,
    rules_file: &Path,
    cycles: u32,
    out: &mut W,
) -> Result<(), CliError> {
    if cycles == 0 {
        return Err(CliError::InvalidArgument {
            arg: "cycles".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    let SnapshotEngine {
        broker,
        keeper,
        namespaces,
    } = SnapshotEngine::build(config, broker_file, rules_file).await?;

    let mut report_cycles = Vec::with_capacity(cycles as usize);
    for cycle in 1..=cycles {
        let outcomes = keeper
            .orchestrator()
            .run_all(&namespaces)
            .await
            .into_iter()
            .map(|(namespace_id, result)| match result {
                Ok(report) => NamespaceOutcome {
                    namespace_id,
                    report: Some(report),
                    error: None,
                },
                Err(e) => NamespaceOutcome {
                    namespace_id,
                    report: None,
                    error: Some(e.to_string()),
                },
            })
            .collect();
        report_cycles.push(SimulatedCycle {
            cycle,
            namespaces: outcomes,
        });
    }

    // Deferred replays never run in a simulation
    keeper.executor().shutdown().await;

    let report = SimulationReport {
        cycles: report_cycles,
        broker_replays: broker.replay_calls(),
        summary: keeper.service().get_summary(None).await?,
    };
    write_json(out, &report)
}

async fn execute_run_command<W: Write>(
    config: &DlqKeeperConfig,
    broker_file: &Path,
    rules_file: &Path,
    stop_after: Option<Duration>,
    out: &mut W,
) -> Result<(), CliError> {
    if stop_after == Some(Duration::ZERO) {
        return Err(CliError::InvalidArgument {
            arg: "duration-seconds".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    let engine = SnapshotEngine::build(config, broker_file, rules_file).await?;

    let shutdown = CancellationToken::new();
    let signal = tokio::spawn(cancel_on_signal(shutdown.clone(), stop_after));
    engine.keeper.run(shutdown).await;
    signal.abort();

    let report = RunReport {
        namespaces: engine.namespaces,
        broker_replays: engine.broker.replay_calls(),
        summary: engine.keeper.service().get_summary(None).await?,
    };
    write_json(out, &report)
}

/// Cancel `shutdown` on Ctrl+C, SIGTERM or once `stop_after` elapses
async fn cancel_on_signal(shutdown: CancellationToken, stop_after: Option<Duration>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let elapsed = async {
        match stop_after {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C), shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
        _ = elapsed => info!("Run duration elapsed, shutting down"),
    }
    shutdown.cancel();
}

// ============================================================================
// Helpers
// ============================================================================

/// An engine over an in-memory broker seeded from a snapshot
struct SnapshotEngine {
    broker: Arc<InMemoryBroker>,
    keeper: DlqKeeper,
    namespaces: Vec<NamespaceId>,
}

impl SnapshotEngine {
    /// Seed the broker, wire the engine and create the rules
    ///
    /// Namespaces come from the configuration, or from the snapshot when
    /// none are configured.
    async fn build(
        config: &DlqKeeperConfig,
        broker_file: &Path,
        rules_file: &Path,
    ) -> Result<Self, CliError> {
        let rule_set = load_rules(rules_file)?;
        let snapshot = load_snapshot(broker_file)?;

        let mut config = config.clone();
        if config.orchestrator.namespaces.is_empty() {
            config.orchestrator.namespaces = snapshot_namespaces(&snapshot)?;
        }

        let broker = Arc::new(InMemoryBroker::from_snapshot(&snapshot).map_err(|e| {
            CliError::InvalidArgument {
                arg: "broker".to_string(),
                message: e.to_string(),
            }
        })?);
        let store = Arc::new(InMemoryDlqStore::new());
        let keeper = DlqKeeper::new(&config, broker.clone(), store)?;

        for definition in rule_set.rules {
            let rule = keeper.service().create_rule(definition).await?;
            debug!(rule_id = %rule.id, rule_name = %rule.name, "Loaded rule");
        }

        Ok(Self {
            broker,
            keeper,
            namespaces: config.orchestrator.namespaces,
        })
    }
}

/// Load a rule file, reporting a missing file as an I/O error
fn load_rules(path: &Path) -> Result<RuleSet, CliError> {
    RuleSet::load_from_file(path).map_err(|e| match e {
        RuleError::FileNotFound { path } => CliError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("rule file not found: {}", path),
        )),
        other => CliError::Validation(other),
    })
}

fn load_snapshot(path: &Path) -> Result<BrokerSnapshot, CliError> {
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|e| CliError::InvalidArgument {
        arg: path.display().to_string(),
        message: format!("invalid broker snapshot: {}", e),
    })
}

fn snapshot_namespaces(snapshot: &BrokerSnapshot) -> Result<Vec<NamespaceId>, CliError> {
    snapshot
        .namespaces
        .iter()
        .map(|ns| {
            NamespaceId::new(&ns.id).map_err(|e| CliError::InvalidArgument {
                arg: "namespace".to_string(),
                message: e.to_string(),
            })
        })
        .collect()
}

fn write_json<W: Write, T: Serialize>(out: &mut W, value: &T) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value).map_err(command_failed)?;
    writeln!(out, "{}", rendered)?;
    Ok(())
}

fn command_failed(e: impl std::fmt::Display) -> CliError {
    CliError::CommandFailed {
        message: e.to_string(),
    }
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
