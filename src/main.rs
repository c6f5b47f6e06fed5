use anyhow::{Context, Result};
use clap::Parser;
use sms_throttler::{DryRunSender, SmsMessage, Throttler, ThrottlerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Queue one message per recipient through the account and per-number throttles.
#[derive(Debug, Parser)]
#[command(name = "sms-throttler", version, about)]
struct Cli {
    /// Sender number the messages are sent from
    #[arg(long, env = "FROM_NUMBER")]
    from: String,

    /// Recipient numbers, comma separated
    #[arg(long, env = "TO_NUMBERS", value_delimiter = ',', required = true)]
    to: Vec<String>,

    /// Message text
    #[arg(long, default_value = "This is a test message to be sent to all numbers")]
    text: String,

    /// JSON configuration file; ACCOUNT_* / NUMBER_* environment variables are used otherwise
    #[arg(long, env = "THROTTLER_CONFIG")]
    config: Option<PathBuf>,

    /// Simulated provider latency, e.g. "200ms"
    #[arg(long, default_value = "0s", value_parser = humantime_serde::re::humantime::parse_duration)]
    latency: Duration,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("sms_throttler={}", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &cli.config {
        Some(path) => ThrottlerConfig::from_json_file(path),
        None => ThrottlerConfig::from_env(),
    }
    .context("Failed to load configuration")?;

    tracing::info!(
        account_calls = config.account.calls_per_window,
        account_window = ?config.account.window,
        number_calls = config.number.calls_per_window,
        number_window = ?config.number.window,
        recipients = cli.to.len(),
        "Starting throttler"
    );

    let sender = Arc::new(DryRunSender::new(cli.latency));
    let throttler = Throttler::new(sender, config).context("Failed to create throttler")?;

    let handles: Vec<_> = cli
        .to
        .iter()
        .map(|to| (to.clone(), throttler.send(SmsMessage::new(&cli.from, to, &cli.text))))
        .collect();

    for (to, handle) in handles {
        match handle.await {
            Ok(response) => tracing::info!(to = %to, message_id = %response.id, "Completed"),
            Err(e) => tracing::error!(to = %to, error = %e, "Failed"),
        }
    }

    let stats = throttler.stats().context("Failed to collect throttler stats")?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}
