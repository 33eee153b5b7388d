//! Command-line surface of the engine.
//!
//! Results go to stdout in the selected format; errors go to stderr as a
//! JSON object and select the process exit code (see [`ExitCode`]).

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use ke_common::{CalibrationResult, Error, MetricKind, MetricState, OutputFormat, TenantId};
use ke_config::{resolve_config, ConfigError, ConfigPaths, EngineConfig, ResolvedConfig};
use ke_store::{default_store_dir, JsonFileStore, RetentionPolicy};

use crate::api::{EstimateRequest, EstimateResponse, StateView};
use crate::engine::Engine;
use crate::exit_codes::ExitCode;

#[derive(Parser, Debug)]
#[command(
    name = "ke-core",
    version,
    about = "Kalman filter estimation engine for multi-source business metrics"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalOpts {
    /// Config file (JSON, or TOML by extension)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory holding persisted filter state
    #[arg(long, global = true, env = "KE_STORE_DIR", value_name = "DIR")]
    pub store_dir: Option<PathBuf>,

    /// Tenant for commands that do not name one
    #[arg(long, global = true, env = "KE_TENANT")]
    pub tenant: Option<String>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,

    /// Log filter directive (overrides KE_LOG and RUST_LOG)
    #[arg(long, global = true, value_name = "FILTER")]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one estimation cycle from a JSON request
    Estimate(EstimateArgs),

    /// Initialize a metric explicitly
    Init(InitArgs),

    /// Show current state with recent history (read-only)
    State(StateArgs),

    /// Evaluate noise calibration without applying it
    Calibrate(MetricArgs),

    /// Apply a reviewed calibration result
    ApplyCalibration(ApplyCalibrationArgs),

    /// Mark an anomaly resolved
    ResolveAnomaly(ResolveAnomalyArgs),

    /// Manage the source registry
    #[command(subcommand)]
    Sources(SourcesCommand),

    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Print a JSON Schema
    Schema {
        #[arg(value_enum)]
        kind: SchemaKind,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug)]
pub struct EstimateArgs {
    /// Request file, or `-` for stdin
    #[arg(long, value_name = "PATH", default_value = "-")]
    pub request: PathBuf,

    /// Print only the summarizer payload
    #[arg(long)]
    pub insight: bool,
}

#[derive(Args, Debug)]
pub struct MetricArgs {
    #[arg(long, value_enum)]
    pub metric: MetricKind,
}

#[derive(Args, Debug)]
pub struct InitArgs {
    #[arg(long, value_enum)]
    pub metric: MetricKind,

    #[arg(long, allow_negative_numbers = true)]
    pub value: f64,

    #[arg(long)]
    pub variance: f64,

    /// Supersede an existing state
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct StateArgs {
    #[arg(long, value_enum)]
    pub metric: MetricKind,

    /// Number of recent innovations to include
    #[arg(long, default_value_t = 30)]
    pub history: usize,
}

#[derive(Args, Debug)]
pub struct ApplyCalibrationArgs {
    /// Calibration result file, or `-` for stdin
    #[arg(long, value_name = "PATH")]
    pub result: PathBuf,
}

#[derive(Args, Debug)]
pub struct ResolveAnomalyArgs {
    #[arg(long, value_enum)]
    pub metric: MetricKind,

    #[arg(long)]
    pub id: Uuid,
}

#[derive(Subcommand, Debug)]
pub enum SourcesCommand {
    /// Register or re-register a source for a metric
    Register {
        #[arg(long = "source")]
        source_id: String,
        #[arg(long, value_enum)]
        metric: MetricKind,
        /// Base confidence in (0, 1]
        #[arg(long)]
        confidence: f64,
        #[arg(long, default_value_t = 0)]
        latency_seconds: u64,
    },

    /// List registered sources and pending reviews
    List,

    /// Accept a down-weight review with a new base confidence
    ApplyReview {
        #[arg(long = "source")]
        source_id: String,
        #[arg(long, value_enum)]
        metric: MetricKind,
        #[arg(long)]
        confidence: f64,
    },

    /// Reject a down-weight review
    DismissReview {
        #[arg(long = "source")]
        source_id: String,
        #[arg(long, value_enum)]
        metric: MetricKind,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration and where it came from
    Show,

    /// Validate a config file (defaults to the resolved one)
    Validate {
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    Request,
    Response,
    State,
    Calibration,
    Config,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Engine(#[from] Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot render output: {0}")]
    Render(String),

    #[error("cannot write output: {0}")]
    Output(#[source] io::Error),
}

impl CliError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Engine(err) => ExitCode::from(err),
            CliError::Config(_) => ExitCode::ConfigError,
            CliError::Read { .. } | CliError::Parse { .. } => ExitCode::InputError,
            CliError::Render(_) | CliError::Output(_) => ExitCode::InternalError,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CliError::Engine(err) => err.kind(),
            CliError::Config(_) => "invalid_configuration",
            CliError::Read { .. } => "io",
            CliError::Parse { .. } => "invalid_input",
            CliError::Render(_) | CliError::Output(_) => "internal",
        }
    }
}

/// Machine-readable error object written to stderr.
pub fn error_payload(err: &CliError) -> serde_json::Value {
    let retryable = match err {
        CliError::Engine(e) => e.is_retryable(),
        _ => false,
    };
    serde_json::json!({
        "error": {
            "kind": err.kind(),
            "exit_code": err.exit_code().as_i32(),
            "message": err.to_string(),
            "retryable": retryable,
        }
    })
}

/// Render `value` in `format`.
pub fn render<T: Serialize + ?Sized>(value: &T, format: OutputFormat) -> Result<String, CliError> {
    match format {
        OutputFormat::Json => serde_json::to_string(value).map_err(|e| CliError::Render(e.to_string())),
        OutputFormat::Pretty => {
            serde_json::to_string_pretty(value).map_err(|e| CliError::Render(e.to_string()))
        }
        OutputFormat::Yaml => serde_yaml::to_string(value).map_err(|e| CliError::Render(e.to_string())),
    }
}

fn emit<T: Serialize + ?Sized>(
    out: &mut dyn Write,
    value: &T,
    format: OutputFormat,
) -> Result<(), CliError> {
    let text = render(value, format)?;
    writeln!(out, "{}", text.trim_end()).map_err(CliError::Output)
}

fn read_input(path: &Path) -> Result<String, CliError> {
    let read = if path == Path::new("-") {
        let mut text = String::new();
        io::stdin().read_to_string(&mut text).map(|_| text)
    } else {
        std::fs::read_to_string(path)
    };
    read.map_err(|source| CliError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CliError> {
    let text = read_input(path)?;
    serde_json::from_str(&text).map_err(|source| CliError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn resolve(global: &GlobalOpts) -> Result<ResolvedConfig, CliError> {
    Ok(resolve_config(&ConfigPaths::discover(global.config.clone()))?)
}

fn open_engine(global: &GlobalOpts) -> Result<Engine<JsonFileStore>, CliError> {
    let resolved = resolve(global)?;
    let retention = RetentionPolicy {
        innovations: resolved.config.store.innovation_retention,
        snapshots: resolved.config.store.snapshot_retention,
        anomalies: resolved.config.store.anomaly_retention,
    };
    let root = global.store_dir.clone().unwrap_or_else(default_store_dir);
    tracing::debug!(
        config = %resolved.source.describe(),
        config_hash = %resolved.snapshot.short_hash(),
        store = %root.display(),
        "opening engine"
    );
    let store = JsonFileStore::new(root).with_retention(retention);
    let mut engine = Engine::new(resolved.config, store)?;
    if let Some(raw) = global.tenant.as_deref() {
        let tenant = TenantId::parse(raw)
            .ok_or_else(|| Error::InvalidInput(format!("invalid tenant id: {raw:?}")))?;
        engine = engine.with_default_tenant(tenant);
    }
    Ok(engine)
}

fn schema_for(kind: SchemaKind) -> schemars::Schema {
    match kind {
        SchemaKind::Request => schemars::schema_for!(EstimateRequest),
        SchemaKind::Response => schemars::schema_for!(EstimateResponse),
        SchemaKind::State => schemars::schema_for!(StateView),
        SchemaKind::Calibration => schemars::schema_for!(CalibrationResult),
        SchemaKind::Config => schemars::schema_for!(EngineConfig),
    }
}

/// Execute a parsed command, writing its result to `out`.
pub fn run(cli: Cli, out: &mut dyn Write) -> Result<(), CliError> {
    let global = &cli.global;
    let format = global.format;
    match cli.command {
        Commands::Estimate(args) => {
            let request: EstimateRequest = read_json(&args.request)?;
            let response = open_engine(global)?.estimate(request)?;
            if args.insight {
                emit(out, &response.insight_payload(), format)
            } else {
                emit(out, &response, format)
            }
        }
        Commands::Init(args) => {
            let state: MetricState = open_engine(global)?.initialize(
                None,
                args.metric,
                args.value,
                args.variance,
                args.force,
            )?;
            emit(out, &state, format)
        }
        Commands::State(args) => {
            let view = open_engine(global)?.get_state(None, args.metric, args.history)?;
            emit(out, &view, format)
        }
        Commands::Calibrate(args) => {
            let result = open_engine(global)?.calibrate(None, args.metric)?;
            emit(out, &result, format)
        }
        Commands::ApplyCalibration(args) => {
            let result: CalibrationResult = read_json(&args.result)?;
            let state = open_engine(global)?.apply_calibration(&result)?;
            emit(out, &state, format)
        }
        Commands::ResolveAnomaly(args) => {
            let anomaly = open_engine(global)?.resolve_anomaly(None, args.metric, args.id)?;
            emit(out, &anomaly, format)
        }
        Commands::Sources(command) => run_sources(command, global, out),
        Commands::Config(command) => run_config(command, global, out),
        Commands::Schema { kind } => emit(out, &schema_for(kind), format),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "ke-core", out);
            Ok(())
        }
    }
}

fn parse_source(raw: &str) -> Result<ke_common::SourceId, CliError> {
    ke_common::SourceId::parse(raw)
        .ok_or_else(|| Error::InvalidInput("source id must not be empty".to_string()).into())
}

fn run_sources(
    command: SourcesCommand,
    global: &GlobalOpts,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let engine = open_engine(global)?;
    let format = global.format;
    match command {
        SourcesCommand::Register {
            source_id,
            metric,
            confidence,
            latency_seconds,
        } => {
            let descriptor =
                engine.register_source(parse_source(&source_id)?, metric, confidence, latency_seconds)?;
            emit(out, &descriptor, format)
        }
        SourcesCommand::List => emit(out, &engine.sources(), format),
        SourcesCommand::ApplyReview {
            source_id,
            metric,
            confidence,
        } => {
            let descriptor = engine.apply_review(&parse_source(&source_id)?, metric, confidence)?;
            emit(out, &descriptor, format)
        }
        SourcesCommand::DismissReview { source_id, metric } => {
            let dismissed = engine.dismiss_review(&parse_source(&source_id)?, metric)?;
            emit(out, &serde_json::json!({ "dismissed": dismissed }), format)
        }
    }
}

fn run_config(
    command: ConfigCommand,
    global: &GlobalOpts,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    match command {
        ConfigCommand::Show => {
            let resolved = resolve(global)?;
            let view = serde_json::json!({
                "source": resolved.source.describe(),
                "hash": resolved.snapshot.hash,
                "config": resolved.config,
            });
            emit(out, &view, global.format)
        }
        ConfigCommand::Validate { file } => {
            let config = match file {
                Some(path) => ke_config::resolve::load_file(&path)?,
                None => resolve(global)?.config,
            };
            let result = ke_config::validate::validate(&config);
            if !result.is_ok() {
                return Err(ConfigError::Validation(result).into());
            }
            emit(out, &serde_json::json!({ "valid": true }), global.format)
        }
    }
}
