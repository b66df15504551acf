use std::future::Future;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::db::Database;
use crate::readiness::{wait_until_ready, Probe, WaitPolicy};

#[async_trait]
pub trait SchemaMigrator: Send + Sync {
    async fn migrate(&self) -> Result<()>;
}

#[async_trait]
impl SchemaMigrator for Database {
    async fn migrate(&self) -> Result<()> {
        Database::migrate(self).await
    }
}

/// Container start sequence: block until the database answers, apply the
/// schema once, then hand control to `serve`. A failure in either of the
/// first two steps returns before `serve` is ever called.
pub async fn run_startup<P, M, S, Fut>(
    probe: &P,
    policy: WaitPolicy,
    migrator: &M,
    serve: S,
) -> Result<()>
where
    P: Probe + ?Sized,
    M: SchemaMigrator + ?Sized,
    S: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let attempts = wait_until_ready(probe, policy)
        .await
        .context("database did not become ready")?;
    tracing::info!(attempts, "database reachable, running migrations");

    migrator.migrate().await?;
    tracing::info!("migrations applied");

    serve().await
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    struct RecordingProbe {
        log: Log,
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl Probe for RecordingProbe {
        fn target(&self) -> &str {
            "test-db"
        }

        async fn check(&self) -> Result<()> {
            self.log.lock().unwrap().push("probe");
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                anyhow::bail!("not yet");
            }
            Ok(())
        }
    }

    struct RecordingMigrator {
        log: Log,
        fail: bool,
    }

    #[async_trait]
    impl SchemaMigrator for RecordingMigrator {
        async fn migrate(&self) -> Result<()> {
            self.log.lock().unwrap().push("migrate");
            if self.fail {
                anyhow::bail!("bad migration");
            }
            Ok(())
        }
    }

    fn policy(max_attempts: Option<u32>) -> WaitPolicy {
        WaitPolicy {
            interval: Duration::from_millis(10),
            max_attempts,
        }
    }

    fn fixtures(failures: u32, fail_migration: bool) -> (Log, RecordingProbe, RecordingMigrator) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let probe = RecordingProbe {
            log: log.clone(),
            failures_left: Mutex::new(failures),
        };
        let migrator = RecordingMigrator {
            log: log.clone(),
            fail: fail_migration,
        };
        (log, probe, migrator)
    }

    #[tokio::test(start_paused = true)]
    async fn migrates_once_after_ready_and_before_serving() {
        let (log, probe, migrator) = fixtures(2, false);
        let serve_log = log.clone();

        run_startup(&probe, policy(None), &migrator, || async move {
            serve_log.lock().unwrap().push("serve");
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["probe", "probe", "probe", "migrate", "serve"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_migration_never_serves() {
        let (log, probe, migrator) = fixtures(0, true);
        let serve_log = log.clone();

        let result = run_startup(&probe, policy(None), &migrator, || async move {
            serve_log.lock().unwrap().push("serve");
            Ok(())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(*log.lock().unwrap(), vec!["probe", "migrate"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_database_skips_migration() {
        let (log, probe, migrator) = fixtures(u32::MAX, false);
        let serve_log = log.clone();

        let result = run_startup(&probe, policy(Some(2)), &migrator, || async move {
            serve_log.lock().unwrap().push("serve");
            Ok(())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(*log.lock().unwrap(), vec!["probe", "probe"]);
    }
}
