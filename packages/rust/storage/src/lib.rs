//! libSQL storage for run outcomes (embedded, local file).
//!
//! The [`Storage`] struct wraps a libSQL database holding the append-only
//! `run_outcomes` audit table. There is no update or delete API, and the
//! schema rejects both.
//!
//! **Access rules:**
//! - `briefengine run`: read-write via [`Storage::open`]
//! - `briefengine runs`: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use briefengine_shared::{BriefError, Result, RunId, RunOutcome, Stage};
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, Row, params};
use sha2::{Digest, Sha256};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// A stored run outcome plus the digest of its preserved output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub outcome: RunOutcome,
    pub output_sha256: Option<String>,
}

/// Filters for [`Storage::list_run_outcomes`].
#[derive(Debug, Clone, Default)]
pub struct RunQuery {
    pub module: Option<String>,
    pub limit: usize,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| BriefError::io(parent, e))?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| BriefError::Storage(e.to_string()))?;

        let conn = db.connect().map_err(|e| BriefError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` for listing only.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(BriefError::Storage(format!(
                "run database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| BriefError::Storage(e.to_string()))?;

        let conn = db.connect().map_err(|e| BriefError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| BriefError::Storage(format!("migration v{} failed: {e}", migration.version)))?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(BriefError::Storage("database is opened in read-only mode".into()));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run outcomes
    // -----------------------------------------------------------------------

    /// Append one run outcome. A second insert with the same run id fails.
    pub async fn insert_run_outcome(&self, outcome: &RunOutcome) -> Result<()> {
        self.check_writable()?;

        let digest = outcome.output.as_deref().map(output_digest);

        self.conn
            .execute(
                "INSERT INTO run_outcomes (
                    id, module, run_type, started_at, finished_at, elapsed_ms, stage, success,
                    error_kind, error_detail, delivery_id, output, output_sha256
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    outcome.id.to_string(),
                    outcome.module.as_str(),
                    outcome.run_type.as_str(),
                    timestamp(&outcome.started_at),
                    timestamp(&outcome.finished_at),
                    outcome.elapsed_ms(),
                    outcome.stage.as_str(),
                    i64::from(outcome.success),
                    outcome.error_kind.as_deref(),
                    outcome.error_detail.as_deref(),
                    outcome.delivery_id.as_deref(),
                    outcome.output.as_deref(),
                    digest.as_deref()
                ],
            )
            .await
            .map_err(|e| BriefError::Storage(e.to_string()))?;

        Ok(())
    }

    /// Most recent run outcomes first.
    pub async fn list_run_outcomes(&self, query: &RunQuery) -> Result<Vec<RunRecord>> {
        let limit = i64::try_from(query.limit.max(1)).unwrap_or(i64::MAX);

        let mut rows = match &query.module {
            Some(module) => self
                .conn
                .query(
                    &format!("{SELECT_RUNS} WHERE module = ?1 ORDER BY started_at DESC, id DESC LIMIT ?2"),
                    params![module.as_str(), limit],
                )
                .await,
            None => self
                .conn
                .query(
                    &format!("{SELECT_RUNS} ORDER BY started_at DESC, id DESC LIMIT ?1"),
                    params![limit],
                )
                .await,
        }
        .map_err(|e| BriefError::Storage(e.to_string()))?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| BriefError::Storage(e.to_string()))? {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    /// One run outcome by id.
    pub async fn get_run_outcome(&self, id: &RunId) -> Result<Option<RunRecord>> {
        let mut rows = self
            .conn
            .query(&format!("{SELECT_RUNS} WHERE id = ?1"), params![id.to_string()])
            .await
            .map_err(|e| BriefError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(BriefError::Storage(e.to_string())),
        }
    }
}

const SELECT_RUNS: &str = "SELECT id, module, run_type, started_at, finished_at, stage, success, \
     error_kind, error_detail, delivery_id, output, output_sha256 FROM run_outcomes";

/// Hex SHA-256 of a brief, for matching a preserved output against what was sent.
pub fn output_digest(output: &str) -> String {
    let digest = Sha256::digest(output.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn row_to_record(row: &Row) -> Result<RunRecord> {
    let text = |idx: i32| -> Result<String> {
        row.get::<String>(idx)
            .map_err(|e| BriefError::Storage(e.to_string()))
    };

    let id = text(0)?
        .parse::<RunId>()
        .map_err(|e| BriefError::Storage(format!("bad run id: {e}")))?;
    let stage = text(5)?.parse::<Stage>().map_err(BriefError::Storage)?;

    let outcome = RunOutcome {
        id,
        module: text(1)?,
        run_type: text(2)?,
        started_at: parse_timestamp(&text(3)?)?,
        finished_at: parse_timestamp(&text(4)?)?,
        stage,
        success: row
            .get::<i64>(6)
            .map_err(|e| BriefError::Storage(e.to_string()))?
            != 0,
        error_kind: row.get::<String>(7).ok(),
        error_detail: row.get::<String>(8).ok(),
        delivery_id: row.get::<String>(9).ok(),
        output: row.get::<String>(10).ok(),
    };

    Ok(RunRecord {
        outcome,
        output_sha256: row.get::<String>(11).ok(),
    })
}

/// Fixed-width UTC timestamps so `ORDER BY started_at` sorts chronologically.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BriefError::Storage(format!("bad timestamp '{raw}': {e}")))
}
