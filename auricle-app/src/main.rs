//! Auricle CLI entry point — the composition root.
//!
//! `start` wires the full pipeline and streams log lines to stdout plus
//! `{log_dir}/transcriber.log`; every other subcommand performs one round of
//! work and prints a JSON document. Exit code 0 on success, 1 on any
//! initialization or command failure.

mod cli;
mod commands;
mod settings;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use auricle_core::PipelineAgent;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Start);

    if let Err(e) = run(cli.config.as_deref(), command, cli.verbose).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(
    config_file: Option<&std::path::Path>,
    command: Commands,
    verbose: bool,
) -> anyhow::Result<()> {
    let config = settings::load_config(config_file).context("loading configuration")?;

    match command {
        Commands::Start => {
            let _guard = init_pipeline_logging(&config.log_dir, verbose)
                .context("initializing logging")?;
            tracing::info!(
                api_url = config.api_url.as_deref().unwrap_or("<unset>"),
                backend = config.whisper_backend.as_str(),
                sample_rate = config.sample_rate,
                "configuration loaded"
            );
            let agent = PipelineAgent::new(config).context("initializing pipeline")?;
            agent.run().await.context("running pipeline")?;
            Ok(())
        }
        command => {
            init_cli_logging(verbose);
            let value = match command {
                Commands::Start => unreachable!("handled above"),
                Commands::Status => commands::status(&config).await?,
                Commands::Test => commands::test(&config).await?,
                Commands::Queue => commands::queue_info(&config)?,
                Commands::Retry { item_id } => commands::retry(&config, &item_id).await?,
                Commands::Cleanup { days } => commands::cleanup(&config, days)?,
            };
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
    }
}

/// `start`: human-readable lines on stdout plus an append-only log file.
/// The returned guard flushes the file writer on drop.
fn init_pipeline_logging(
    log_dir: &std::path::Path,
    verbose: bool,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::never(log_dir, "transcriber.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    Ok(guard)
}

/// Non-`start` subcommands print JSON on stdout; diagnostics go to stderr.
fn init_cli_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
