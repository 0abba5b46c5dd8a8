//! Planforge CLI entry point.
//!
//! This binary is the composition root for the whole workspace:
//!
//! 1. **Parse configuration**: load `--config`, `PLANFORGE_CONFIG`, or
//!    `.planforge/config.toml`, and validate it before any work starts.
//! 2. **Wire observability**: a `tracing-subscriber` stack writing to stderr,
//!    plus an OpenTelemetry OTLP exporter when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
//! 3. **Construct infrastructure**: the filesystem checkpoint store and the LLM
//!    client factory, injected into [`nodes::PipelineOrchestrator`].
//! 4. **Dispatch** one subcommand and map its outcome to an exit code.
//!
//! ## Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success, or a run that completed |
//! | 1 | Configuration or I/O error, or a run that failed |
//! | 130 | Run cancelled with Ctrl-C |

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use pipeline::RunId;

mod commands;
mod observability;

use commands::Session;
use observability::LogFormat;

/// Turns a project interview into a validated design and development plan.
#[derive(Debug, Parser)]
#[command(name = "planforge", version, about)]
struct Cli {
    /// Configuration file. Defaults to `.planforge/config.toml` when present.
    #[arg(long, global = true, env = "PLANFORGE_CONFIG")]
    config: Option<PathBuf>,

    /// Log line format on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a new run from an interview transcript.
    Run {
        /// File holding the interview text.
        #[arg(long)]
        input: PathBuf,
    },
    /// Continue a run from its newest readable checkpoint.
    Resume {
        #[arg(value_parser = parse_run_id)]
        run_id: RunId,
    },
    /// Show a run's checkpoints and latest state.
    Status {
        #[arg(value_parser = parse_run_id)]
        run_id: RunId,
    },
    /// Write a run's documents to a directory.
    Export {
        #[arg(value_parser = parse_run_id)]
        run_id: RunId,
        /// Destination directory; created if missing.
        #[arg(long)]
        dir: PathBuf,
    },
    /// Delete a run's checkpoints.
    Cleanup {
        #[arg(value_parser = parse_run_id)]
        run_id: RunId,
        /// Keep the newest N checkpoints.
        #[arg(long, conflicts_with = "older_than_hours")]
        keep: Option<usize>,
        /// Delete checkpoints older than H hours.
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
    /// Validate the configuration and print each stage's effective client.
    CheckConfig,
}

fn parse_run_id(value: &str) -> Result<RunId, String> {
    RunId::parse(value).ok_or_else(|| format!("`{value}` is not a run id"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _telemetry = match observability::init(cli.log_format) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = commands::load_config(cli.config.as_deref())?;
    if let Command::CheckConfig = cli.command {
        return commands::check_config(&config);
    }

    let cleanup = match cli.command {
        Command::Cleanup {
            run_id,
            keep,
            older_than_hours,
        } => Some((run_id, commands::cleanup_policy(keep, older_than_hours, &config))),
        _ => None,
    };
    let session = Session::open(config)?;
    if let Some((run_id, policy)) = cleanup {
        return commands::cleanup(&session, run_id, policy).await;
    }
    match cli.command {
        Command::Run { input } => commands::run(&session, &input).await,
        Command::Resume { run_id } => commands::resume(&session, run_id).await,
        Command::Status { run_id } => commands::status(&session, run_id).await,
        Command::Export { run_id, dir } => commands::export(&session, run_id, &dir).await,
        Command::Cleanup { .. } | Command::CheckConfig => Ok(ExitCode::SUCCESS),
    }
}
