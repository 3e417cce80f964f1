mod batch;
mod classify;
mod config;
mod listener;
mod protocol;
mod report;
mod rpc;
mod sentry;
mod sink;
mod tail;
#[cfg(test)]
mod testutil;

use clap::{Args, Parser, Subcommand, ValueEnum};
use config::{ConfigError, ListenerConfig, Overrides, Variant};
use listener::Listener;
use protocol::Channel;
use rpc::SupervisorRpc;
use sentry::SentrySink;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const DEFAULT_CONFIG: &str = "procsentry.toml";

/// Supervisor event listeners that report unexpected process exits and
/// fatal start failures to Sentry, with the tail of the process's output.
///
/// Run under supervisord as an `[eventlistener:x]` program, e.g.
/// `command=procsentry report -e crash` with `events=PROCESS_STATE`.
#[derive(Parser, Debug)]
#[command(name = "procsentry", version, about)]
pub struct Cli {
    /// Config file path [default: procsentry.toml, optional]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (classification and tail reads)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Resolve and print settings, don't listen
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: ListenerCommand,
}

#[derive(Subcommand, Debug)]
enum ListenerCommand {
    /// Report unexpected exits as one message with stderr/stdout tails
    Crash(CommonArgs),
    /// Report unexpected exits or fatal starts with tails as separate fields
    Report {
        /// Which transition to report
        #[arg(short, long, value_enum)]
        event_type: EventType,

        #[command(flatten)]
        common: CommonArgs,
    },
    /// Batch fatal start failures and send them together on tick events
    FatalBatch {
        /// Batch interval in minutes
        #[arg(short, long)]
        interval: Option<f64>,

        /// TICK event that drives the batch
        #[arg(short, long, short_alias = 'e', alias = "tickEvent")]
        tick_event: Option<String>,

        #[command(flatten)]
        common: CommonArgs,
    },
}

// The hidden aliases accept the flag spellings of the older crashsentry and
// fatalsentrybatch listeners, so existing `command=` lines keep working.
#[derive(Args, Debug)]
struct CommonArgs {
    /// Sentry DSN (falls back to SENTRY_DSN)
    #[arg(short, long, short_alias = 'S', aliases = ["sentry_dsn", "sentryDsn"])]
    sentry_dsn: Option<String>,

    /// Number of stdout lines to report
    #[arg(short = 'o', long, short_alias = 'w', alias = "stdout_lines")]
    stdout_lines: Option<usize>,

    /// Number of stderr lines to report (crashsentry's `-e` is `-r` here)
    #[arg(short = 'r', long, short_alias = 'q', alias = "stderr_lines")]
    stderr_lines: Option<usize>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum EventType {
    Crash,
    Fatal,
}

impl ListenerCommand {
    fn into_parts(self) -> (Variant, Overrides) {
        let (variant, common, interval_mins, tick_event) = match self {
            ListenerCommand::Crash(common) => (Variant::Crash, common, None, None),
            ListenerCommand::Report { event_type, common } => (
                Variant::Report {
                    fatal: matches!(event_type, EventType::Fatal),
                },
                common,
                None,
                None,
            ),
            ListenerCommand::FatalBatch {
                interval,
                tick_event,
                common,
            } => (Variant::FatalBatch, common, interval, tick_event),
        };
        let overrides = Overrides {
            sentry_dsn: common.sentry_dsn,
            stderr_lines: common.stderr_lines,
            stdout_lines: common.stdout_lines,
            interval_mins,
            tick_event,
        };
        (variant, overrides)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // stdout carries the listener protocol, so all diagnostics go to stderr.
    let default_level = if cli.verbose { "procsentry=debug" } else { "procsentry=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match load(cli) {
        Ok(Some(config)) => config,
        Ok(None) => return ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match serve(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Resolve settings; `None` means a dry run that has already printed them.
fn load(cli: Cli) -> Result<Option<ListenerConfig>, ConfigError> {
    let file = match &cli.config {
        Some(path) => config::load_config(path, true)?,
        None => config::load_config(Path::new(DEFAULT_CONFIG), false)?,
    };
    let (variant, overrides) = cli.command.into_parts();
    let config = ListenerConfig::resolve(variant, file, overrides, |key| std::env::var(key).ok())?;

    if cli.dry_run {
        println!("procsentry v{}", env!("CARGO_PKG_VERSION"));
        println!("mode: {:?}", config.mode);
        println!("style: {:?}", config.style);
        println!("stderr lines: {}", config.stderr_lines);
        println!("stdout lines: {}", config.stdout_lines);
        if let Some(batch) = &config.batch {
            println!(
                "batch: every {} min ({} min per tick)",
                batch.interval_mins, batch.tick_mins
            );
        }
        println!(
            "supervisor: {}",
            config.supervisor.server_url.as_deref().unwrap_or("<not set>")
        );
        return Ok(None);
    }

    config.require_supervisor()?;
    Ok(Some(config))
}

async fn serve(config: &ListenerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let logs = SupervisorRpc::new(
        config.require_supervisor()?,
        config.supervisor.username.clone(),
        config.supervisor.password.clone(),
        config.supervisor.timeout,
    )?;
    let sink = SentrySink::new(
        &config.sentry.dsn,
        config.sentry.logger.clone(),
        config.sentry.string_max_length,
        config.sentry.timeout,
    )?;
    let channel = Channel::new(
        tokio::io::BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    );

    tracing::info!(mode = ?config.mode, "procsentry listening for supervisor events");
    Listener::new(config, channel, logs, sink).run().await?;
    Ok(())
}
