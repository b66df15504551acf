use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::Usage;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub total_tokens: u64,
    #[serde(default)]
    pub models: BTreeMap<String, ModelUsage>,
}

/// Persisted shape of the usage file. Days are keyed `YYYY-MM-DD`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total_tokens: u64,
    #[serde(default)]
    pub daily_usage: BTreeMap<String, DailyUsage>,
    #[serde(default)]
    pub provider_usage: BTreeMap<String, ProviderUsage>,
}

impl UsageSummary {
    pub fn record(&mut self, provider: &str, model: &str, tokens: u64, day: NaiveDate) {
        self.total_tokens += tokens;
        self.daily_usage
            .entry(day.format("%Y-%m-%d").to_string())
            .or_default()
            .tokens += tokens;

        let provider = self.provider_usage.entry(provider.to_string()).or_default();
        provider.total_tokens += tokens;
        provider
            .models
            .entry(model.to_string())
            .or_default()
            .total_tokens += tokens;
    }

    /// Daily entries for the last `days` days, today included.
    pub fn daily_since(&self, today: NaiveDate, days: i64) -> BTreeMap<String, DailyUsage> {
        let cutoff = today - Duration::days(days.max(1) - 1);
        self.daily_usage
            .iter()
            .filter(|(day, _)| {
                NaiveDate::parse_from_str(day, "%Y-%m-%d")
                    .map(|d| d >= cutoff)
                    .unwrap_or(false)
            })
            .map(|(day, usage)| (day.clone(), usage.clone()))
            .collect()
    }
}

/// JSON-file backed token counter shared by every provider.
pub struct TokenTracker {
    path: PathBuf,
    state: Mutex<UsageSummary>,
}

impl TokenTracker {
    /// Loads the usage file, or starts empty when it does not exist yet. A
    /// file that no longer parses is logged and replaced on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let summary = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                tracing::warn!(path = %path.display(), error = %err, "unreadable token usage file, starting fresh");
                UsageSummary::default()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => UsageSummary::default(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read token usage {}", path.display()))
            }
        };

        Ok(Self {
            path,
            state: Mutex::new(summary),
        })
    }

    pub async fn track(&self, provider: &str, model: &str, usage: Usage) -> Result<()> {
        let tokens = if usage.total_tokens > 0 {
            usage.total_tokens
        } else {
            usage.prompt_tokens + usage.completion_tokens
        };

        let mut state = self.state.lock().await;
        state.record(provider, model, tokens, Utc::now().date_naive());
        self.persist(&state).await
    }

    pub async fn summary(&self) -> UsageSummary {
        self.state.lock().await.clone()
    }

    async fn persist(&self, summary: &UsageSummary) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(summary)?;
        tokio::fs::write(&self.path, bytes)
            .await
            .with_context(|| format!("failed to write token usage {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn record_aggregates_by_day_provider_and_model() {
        let mut summary = UsageSummary::default();
        summary.record("azure_openai", "gpt-4", 100, day("2024-05-01"));
        summary.record("azure_openai", "gpt-4", 50, day("2024-05-01"));
        summary.record("azure_openai", "gpt-35", 10, day("2024-05-02"));
        summary.record("huggingface", "dialo", 5, day("2024-05-02"));

        assert_eq!(summary.total_tokens, 165);
        assert_eq!(summary.daily_usage["2024-05-01"].tokens, 150);
        assert_eq!(summary.daily_usage["2024-05-02"].tokens, 15);
        let azure = &summary.provider_usage["azure_openai"];
        assert_eq!(azure.total_tokens, 160);
        assert_eq!(azure.models["gpt-4"].total_tokens, 150);
        assert_eq!(summary.provider_usage["huggingface"].total_tokens, 5);
    }

    #[test]
    fn daily_since_drops_old_days() {
        let mut summary = UsageSummary::default();
        summary.record("p", "m", 1, day("2024-01-01"));
        summary.record("p", "m", 2, day("2024-03-01"));
        let recent = summary.daily_since(day("2024-03-10"), 30);
        assert_eq!(recent.keys().collect::<Vec<_>>(), vec!["2024-03-01"]);

        summary.record("p", "m", 4, day("2024-03-10"));
        let today_only = summary.daily_since(day("2024-03-10"), 1);
        assert_eq!(today_only.keys().collect::<Vec<_>>(), vec!["2024-03-10"]);
    }

    #[tokio::test]
    async fn usage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("token_usage.json");

        let tracker = TokenTracker::open(&path).unwrap();
        tracker
            .track("azure_openai", "gpt-4", Usage::new(30, 12))
            .await
            .unwrap();

        let reopened = TokenTracker::open(&path).unwrap();
        let summary = reopened.summary().await;
        assert_eq!(summary.total_tokens, 42);
        assert_eq!(
            summary.provider_usage["azure_openai"].models["gpt-4"].total_tokens,
            42
        );
    }

    #[tokio::test]
    async fn corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token_usage.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let tracker = TokenTracker::open(&path).unwrap();
        assert_eq!(tracker.summary().await, UsageSummary::default());
    }
}
