//! SQL migration definitions for the run database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: run_outcomes (append-only)",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per run request
CREATE TABLE IF NOT EXISTS run_outcomes (
    id            TEXT PRIMARY KEY,
    module        TEXT NOT NULL,
    run_type      TEXT NOT NULL,
    started_at    TEXT NOT NULL,
    finished_at   TEXT NOT NULL,
    elapsed_ms    INTEGER NOT NULL,
    stage         TEXT NOT NULL,
    success       INTEGER NOT NULL,
    error_kind    TEXT,
    error_detail  TEXT,
    delivery_id   TEXT,
    output        TEXT,
    output_sha256 TEXT
);

CREATE INDEX IF NOT EXISTS idx_run_outcomes_module ON run_outcomes(module, started_at);
CREATE INDEX IF NOT EXISTS idx_run_outcomes_started ON run_outcomes(started_at);

-- Audit rows are never rewritten
CREATE TRIGGER IF NOT EXISTS run_outcomes_no_update BEFORE UPDATE ON run_outcomes BEGIN
    SELECT RAISE(ABORT, 'run_outcomes is append-only');
END;

CREATE TRIGGER IF NOT EXISTS run_outcomes_no_delete BEFORE DELETE ON run_outcomes BEGIN
    SELECT RAISE(ABORT, 'run_outcomes is append-only');
END;

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
