//! gptlog - LLM request broker
//!
//! Command-line entry point: ask the configured model through the broker,
//! check credentials, and inspect the call log.

use std::time::Duration;
use anyhow::Result;
use chrono::{DateTime, Local};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};

use gptlog::broker::{check_api, RequestBroker};
use gptlog::calllog::PersistentCallLog;
use gptlog::cli::{Args, Commands, LogAction};
use gptlog::config::{Config, LoggingConfig};

const LOG_FILE_NAME: &str = "gptlog.log";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(config_path) => Config::from_file(config_path)?,
        None => {
            if std::path::Path::new("config.toml").exists() {
                Config::from_file("config.toml")?
            } else {
                Config::default()
            }
        }
    };
    config.apply_env_overrides();

    let log_guard = setup_logging(&config.logging, args.verbose)?;
    info!("Using model {} at {}", config.api.model, config.api.completions_url());

    match args.command {
        Commands::Ask { prompt, raw, log_title, timeout } => {
            let broker = RequestBroker::new(&config)?;

            let mut request = broker.request_config();
            if raw {
                request = request.text();
            }
            request.log_partition = Commands::log_partition(&log_title);
            if let Some(secs) = timeout {
                request = request.with_deadline(Duration::from_secs(secs));
            }

            let spinner = spinner(&format!("Asking {}...", config.api.model));
            let result = broker.ask(&prompt, &request).await;
            spinner.finish_and_clear();

            let value = result?;
            match value.as_str() {
                Some(text) if raw => println!("{}", text),
                _ => println!("{}", serde_json::to_string_pretty(&value)?),
            }
        }
        Commands::Check => {
            let broker = RequestBroker::new(&config)?;

            let spinner = spinner("Checking API...");
            let valid = check_api(&broker).await;
            spinner.finish_and_clear();

            if valid {
                println!("API key is valid");
            } else {
                println!("API key is invalid");
                // exit() skips destructors
                drop(log_guard);
                std::process::exit(1);
            }
        }
        Commands::Log { action } => {
            let log = PersistentCallLog::new(&config.broker.log_dir);

            match action {
                LogAction::Partitions => {
                    let partitions = log.partitions()?;
                    if partitions.is_empty() {
                        println!("No log partitions in {}", log.dir().display());
                    } else {
                        println!("\nLog Partitions ({}):", log.dir().display());
                        println!("{:<25} {:<10} {:<25}", "Partition", "Records", "Modified");
                        println!("{}", "-".repeat(60));

                        for partition in partitions {
                            let records = log.read(&partition)?;
                            let modified = std::fs::metadata(log.partition_path(&partition))
                                .and_then(|m| m.modified())
                                .map(|t| DateTime::<Local>::from(t).format("%Y-%m-%d %H:%M:%S").to_string())
                                .unwrap_or_else(|_| "-".to_string());

                            println!("{:<25} {:<10} {:<25}", partition, records.len(), modified);
                        }
                    }
                }
                LogAction::Show { partition } => {
                    let records = log.read(&partition)?;
                    if records.is_empty() {
                        println!("No records in partition '{}'.", partition);
                    } else {
                        println!("{}", serde_json::to_string_pretty(&records)?);
                    }
                }
            }
        }
    }

    Ok(())
}

fn spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Console output on stderr plus a daily rolling file under `logging.dir`.
///
/// `RUST_LOG` wins over `--verbose`. The returned guard flushes the file
/// writer on drop, so it has to outlive every command.
fn setup_logging(logging: &LoggingConfig, verbose: bool) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&logging.dir)?;

    let (file_writer, guard) = non_blocking(rolling::daily(&logging.dir, LOG_FILE_NAME));

    let default_directive = if verbose { "gptlog=debug" } else { "gptlog=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    // stdout carries command output; diagnostics stay on stderr
    let console_layer = fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(false);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    debug!("Writing application log to {}", logging.dir.join(LOG_FILE_NAME).display());
    Ok(guard)
}
