//! Run Logger: records exactly one [`RunOutcome`] per run request.
//!
//! `record` cannot fail. A storage error is written to the error log together
//! with the outcome, and the run carries on.

use async_trait::async_trait;
use tracing::{error, info, warn};

use briefengine_shared::RunOutcome;
use briefengine_storage::{Storage, output_digest};

/// Sink for run outcomes.
#[async_trait]
pub trait RunLogger: Send + Sync {
    async fn record(&self, outcome: &RunOutcome);
}

/// Appends outcomes to the libSQL run database.
pub struct StorageRunLogger {
    storage: Storage,
}

impl StorageRunLogger {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl RunLogger for StorageRunLogger {
    async fn record(&self, outcome: &RunOutcome) {
        if let Err(e) = self.storage.insert_run_outcome(outcome).await {
            error!(error = %e, "failed to persist run outcome");
            TracingRunLogger.record(outcome).await;
        }
    }
}

/// Emits outcomes as structured log events only. Used when no run database
/// can be opened, and as the fallback when an insert fails.
pub struct TracingRunLogger;

#[async_trait]
impl RunLogger for TracingRunLogger {
    async fn record(&self, outcome: &RunOutcome) {
        let digest = outcome.output.as_deref().map(output_digest);
        if outcome.success {
            info!(
                run_id = %outcome.id,
                module = %outcome.module,
                run_type = %outcome.run_type,
                stage = %outcome.stage,
                elapsed_ms = outcome.elapsed_ms(),
                delivery_id = outcome.delivery_id.as_deref().unwrap_or(""),
                output_sha256 = digest.as_deref().unwrap_or(""),
                "run outcome"
            );
        } else {
            warn!(
                run_id = %outcome.id,
                module = %outcome.module,
                run_type = %outcome.run_type,
                stage = %outcome.stage,
                elapsed_ms = outcome.elapsed_ms(),
                kind = outcome.error_kind.as_deref().unwrap_or(""),
                detail = outcome.error_detail.as_deref().unwrap_or(""),
                output = outcome.output.as_deref().unwrap_or(""),
                output_sha256 = digest.as_deref().unwrap_or(""),
                "run outcome"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use briefengine_shared::{RunId, Stage};
    use briefengine_storage::RunQuery;

    use super::*;

    fn outcome() -> RunOutcome {
        let now = Utc::now();
        RunOutcome {
            id: RunId::new(),
            module: "stone-news".into(),
            run_type: "daily".into(),
            started_at: now,
            finished_at: now,
            stage: Stage::SearchAggregator,
            success: false,
            error_kind: Some("SearchUnavailable".into()),
            error_detail: Some("all 3 search queries failed".into()),
            delivery_id: None,
            output: None,
        }
    }

    #[tokio::test]
    async fn storage_logger_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        let logger = StorageRunLogger::new(Storage::open(&path).await.unwrap());
        let run = outcome();

        logger.record(&run).await;

        let reader = Storage::open_readonly(&path).await.unwrap();
        let rows = reader
            .list_run_outcomes(&RunQuery { module: None, limit: 5 })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].outcome.id, run.id);
    }

    #[tokio::test]
    async fn storage_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        let logger = StorageRunLogger::new(Storage::open(&path).await.unwrap());
        let run = outcome();

        logger.record(&run).await;
        // Duplicate id makes the insert fail; record must still return normally.
        logger.record(&run).await;
    }
}
