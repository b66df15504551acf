use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use sales_agent::readiness::{attempt_limit, wait_until_ready, PostgresProbe, WaitPolicy};
use sales_agent::telemetry::init_tracing;
use sales_agent::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "wait-for-db")]
#[command(about = "Block until Postgres accepts connections")]
struct Cli {
    /// Give up after this many attempts. Zero retries forever; when omitted
    /// DB_WAIT_MAX_ATTEMPTS applies.
    #[arg(long)]
    max_attempts: Option<u32>,
    #[arg(long)]
    interval_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load()?;
    let _guard = init_tracing(&config.logging)?;

    let mut policy = WaitPolicy::from(&config.readiness);
    if let Some(max) = cli.max_attempts {
        policy.max_attempts = attempt_limit(max);
    }
    if let Some(ms) = cli.interval_ms {
        policy.interval = Duration::from_millis(ms);
    }

    let probe = PostgresProbe::new(config.database.url.clone());
    let attempts = wait_until_ready(&probe, policy).await?;
    println!("database ready after {attempts} attempt(s)");
    Ok(())
}
