use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Connection, PgConnection};

use crate::config::ReadinessConfig;

/// A single connectivity check against a dependency.
#[async_trait]
pub trait Probe: Send + Sync {
    fn target(&self) -> &str;

    async fn check(&self) -> Result<()>;
}

/// Opens a fresh connection and runs `SELECT 1`. The connection is dropped
/// afterwards so the probe never holds pool slots.
pub struct PostgresProbe {
    url: String,
    redacted: String,
}

impl PostgresProbe {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let redacted = redact_url(&url);
        Self { url, redacted }
    }
}

#[async_trait]
impl Probe for PostgresProbe {
    fn target(&self) -> &str {
        &self.redacted
    }

    async fn check(&self) -> Result<()> {
        let mut conn = PgConnection::connect(&self.url).await?;
        sqlx::query("SELECT 1").execute(&mut conn).await?;
        conn.close().await?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct WaitPolicy {
    pub interval: Duration,
    pub max_attempts: Option<u32>,
}

impl From<&ReadinessConfig> for WaitPolicy {
    fn from(config: &ReadinessConfig) -> Self {
        Self {
            interval: config.interval,
            max_attempts: config.max_attempts,
        }
    }
}

/// Attempt cap as configured by a user, where zero means retry forever.
pub fn attempt_limit(max_attempts: u32) -> Option<u32> {
    (max_attempts > 0).then_some(max_attempts)
}

/// Polls `probe` at a fixed interval until it succeeds. Every failure is
/// treated as transient. Returns the number of attempts used, or an error
/// once `max_attempts` is exhausted.
pub async fn wait_until_ready<P: Probe + ?Sized>(probe: &P, policy: WaitPolicy) -> Result<u32> {
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        match probe.check().await {
            Ok(()) => {
                tracing::info!(dependency = probe.target(), attempt, "dependency is ready");
                return Ok(attempt);
            }
            Err(err) => {
                if let Some(max) = policy.max_attempts {
                    if attempt >= max {
                        tracing::error!(
                            dependency = probe.target(),
                            attempt,
                            "dependency did not become ready"
                        );
                        anyhow::bail!(
                            "{} not ready after {attempt} attempts: {err}",
                            probe.target()
                        );
                    }
                }
                tracing::warn!(
                    dependency = probe.target(),
                    attempt,
                    error = %err,
                    "dependency not ready, retrying in {:?}",
                    policy.interval
                );
            }
        }

        tokio::time::sleep(policy.interval).await;
    }
}

fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.rsplit_once('@') {
        Some((credentials, host)) => {
            let user = credentials.split(':').next().unwrap_or_default();
            format!("{scheme}://{user}:***@{host}")
        }
        None => url.to_string(),
    }
}
