mod cache;
mod files;
mod history;
mod knowledge;
mod symbols;

pub use cache::{query_signature, CachedResult};
pub use files::{
    technical_debt_score, DebtInputs, FileAttrs, FileEdge, FileRecord, ModuleDependency,
    ModuleStats,
};
pub use history::{
    validate_revision, AnalysisCheckpoint, CommitRecord, DefectFilter, DefectRecord,
    IndexCheckpoint, NewDefect, RunRecord,
};
pub use knowledge::{ArchitectureDecision, Pattern};
pub use symbols::{
    CrossFileEdge, Direction, NewRelation, NewSymbol, PendingReference, RelationTarget,
    ReplaceStats, SymbolEdge, SymbolRecord,
};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{GraphError, Result};

/// Millisecond ISO-8601 UTC timestamp, the only format stored in the database.
pub(crate) const NOW_SQL: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

/// SQLite's bound-parameter limit is far above this; chunking keeps statements small.
pub(crate) const IN_CHUNK: usize = 500;

pub fn format_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// The graph store. One writer connection per process does all indexing;
/// query servers open their own connections and read through WAL snapshots.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) a SQLite database at `path` and run migrations.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.apply_pragmas()?;
        db.migrate()?;
        tracing::debug!(path, "graph store opened");
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.apply_pragmas()?;
        db.migrate()?;
        Ok(db)
    }

    fn apply_pragmas(&self) -> Result<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Execute `f` as one atomic write. The outermost call takes the write
    /// lock with `BEGIN IMMEDIATE`; calls made inside an open transaction
    /// become savepoints so they can roll back on their own.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let nested = !self.conn.is_autocommit();
        if nested {
            self.conn.execute_batch("SAVEPOINT graph_write")?;
        } else {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        match f() {
            Ok(val) => {
                if nested {
                    self.conn.execute_batch("RELEASE graph_write")?;
                } else {
                    self.conn.execute_batch("COMMIT")?;
                }
                Ok(val)
            }
            Err(e) => {
                let rollback = if nested {
                    "ROLLBACK TO graph_write; RELEASE graph_write"
                } else {
                    "ROLLBACK"
                };
                if let Err(rb) = self.conn.execute_batch(rollback) {
                    tracing::error!(error = %rb, "rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Run several reads against one point-in-time view of the store.
    pub fn snapshot<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        if !self.conn.is_autocommit() {
            return f();
        }
        self.conn.execute_batch("BEGIN DEFERRED")?;
        let out = f();
        if let Err(e) = self.conn.execute_batch("COMMIT") {
            tracing::warn!(error = %e, "closing read snapshot failed");
            if let Err(rb) = self.conn.execute_batch("ROLLBACK") {
                tracing::error!(error = %rb, "rollback failed");
            }
        }
        out
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS files (
                id                   INTEGER PRIMARY KEY,
                path                 TEXT NOT NULL UNIQUE,
                filename             TEXT NOT NULL,
                extension            TEXT NOT NULL DEFAULT '',
                module               TEXT NOT NULL DEFAULT 'root',
                layer                TEXT,
                file_type            TEXT NOT NULL DEFAULT 'source',
                language             TEXT NOT NULL DEFAULT '',
                is_critical          INTEGER NOT NULL DEFAULT 0,
                criticality_reason   TEXT,
                security_sensitive   INTEGER NOT NULL DEFAULT 0,
                lines_total          INTEGER NOT NULL DEFAULT 0,
                lines_code           INTEGER NOT NULL DEFAULT 0,
                lines_comment        INTEGER NOT NULL DEFAULT 0,
                lines_blank          INTEGER NOT NULL DEFAULT 0,
                complexity_sum       INTEGER NOT NULL DEFAULT 0,
                complexity_avg       REAL    NOT NULL DEFAULT 0,
                complexity_max       INTEGER NOT NULL DEFAULT 0,
                complexity_max_prev  INTEGER,
                commits_30d          INTEGER NOT NULL DEFAULT 0,
                commits_90d          INTEGER NOT NULL DEFAULT 0,
                commits_365d         INTEGER NOT NULL DEFAULT 0,
                last_modified        TEXT,
                has_tests            INTEGER NOT NULL DEFAULT 0,
                test_file_path       TEXT,
                documentation_score  REAL    NOT NULL DEFAULT 0,
                technical_debt_score INTEGER NOT NULL DEFAULT 0,
                content_hash         TEXT NOT NULL,
                created_at           TEXT NOT NULL,
                indexed_at           TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS symbols (
                id             INTEGER PRIMARY KEY,
                file_id        INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
                name           TEXT NOT NULL,
                qualified_name TEXT NOT NULL DEFAULT '',
                kind           TEXT NOT NULL,
                line_start     INTEGER NOT NULL,
                line_end       INTEGER NOT NULL,
                column_start   INTEGER NOT NULL DEFAULT 0,
                column_end     INTEGER NOT NULL DEFAULT 0,
                signature      TEXT NOT NULL DEFAULT '',
                return_type    TEXT,
                visibility     TEXT NOT NULL DEFAULT 'public',
                is_exported    INTEGER NOT NULL DEFAULT 0,
                complexity     INTEGER NOT NULL DEFAULT 1,
                lines_of_code  INTEGER NOT NULL DEFAULT 0,
                doc_comment    TEXT,
                has_doc        INTEGER NOT NULL DEFAULT 0,
                UNIQUE(file_id, name, kind, line_start, column_start)
            );

            CREATE TABLE IF NOT EXISTS relations (
                id               INTEGER PRIMARY KEY,
                source_id        INTEGER NOT NULL REFERENCES symbols(id) ON DELETE CASCADE,
                target_id        INTEGER NOT NULL REFERENCES symbols(id) ON DELETE CASCADE,
                relation_type    TEXT NOT NULL,
                location_file_id INTEGER REFERENCES files(id) ON DELETE CASCADE,
                location_line    INTEGER,
                location_column  INTEGER,
                count            INTEGER NOT NULL DEFAULT 1 CHECK (count >= 1),
                is_direct        INTEGER NOT NULL DEFAULT 1,
                is_conditional   INTEGER NOT NULL DEFAULT 0,
                UNIQUE(source_id, target_id, relation_type)
            );

            -- References whose target was not in the store when their file
            -- committed; retried after every indexing pass.
            CREATE TABLE IF NOT EXISTS pending_references (
                id            INTEGER PRIMARY KEY,
                file_id       INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
                source_id     INTEGER NOT NULL REFERENCES symbols(id) ON DELETE CASCADE,
                target_name   TEXT NOT NULL,
                target_path   TEXT,
                relation_type TEXT NOT NULL,
                line          INTEGER,
                count         INTEGER NOT NULL DEFAULT 1 CHECK (count >= 1)
            );

            CREATE TABLE IF NOT EXISTS file_relations (
                id             INTEGER PRIMARY KEY,
                source_file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
                target_file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
                relation_type  TEXT NOT NULL,
                line_number    INTEGER,
                UNIQUE(source_file_id, target_file_id, relation_type)
            );

            CREATE TABLE IF NOT EXISTS file_commits (
                id           INTEGER PRIMARY KEY,
                path         TEXT NOT NULL,
                revision     TEXT NOT NULL,
                author       TEXT NOT NULL DEFAULT '',
                committed_at TEXT NOT NULL,
                UNIQUE(path, revision)
            );

            CREATE TABLE IF NOT EXISTS error_history (
                id                INTEGER PRIMARY KEY,
                file_id           INTEGER REFERENCES files(id) ON DELETE SET NULL,
                file_path         TEXT NOT NULL,
                module            TEXT,
                symbol_id         INTEGER REFERENCES symbols(id) ON DELETE SET NULL,
                symbol_name       TEXT,
                error_type        TEXT NOT NULL,
                severity          TEXT NOT NULL,
                title             TEXT NOT NULL,
                description       TEXT,
                root_cause        TEXT,
                fix_description   TEXT,
                prevention        TEXT,
                discovered_at     TEXT NOT NULL,
                resolved_at       TEXT,
                ticket            TEXT,
                is_regression     INTEGER NOT NULL DEFAULT 0,
                original_error_id INTEGER
            );

            CREATE TABLE IF NOT EXISTS patterns (
                id           INTEGER PRIMARY KEY,
                name         TEXT NOT NULL UNIQUE,
                category     TEXT NOT NULL,
                scope        TEXT NOT NULL DEFAULT 'global',
                module       TEXT,
                file_pattern TEXT,
                title        TEXT NOT NULL,
                description  TEXT NOT NULL,
                severity     TEXT NOT NULL DEFAULT 'medium',
                is_active    INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS architecture_decisions (
                id               INTEGER PRIMARY KEY,
                decision_id      TEXT NOT NULL UNIQUE,
                status           TEXT NOT NULL DEFAULT 'accepted',
                title            TEXT NOT NULL,
                context          TEXT NOT NULL DEFAULT '',
                decision         TEXT NOT NULL DEFAULT '',
                consequences     TEXT NOT NULL DEFAULT '',
                affected_modules TEXT NOT NULL DEFAULT '[]',
                affected_files   TEXT NOT NULL DEFAULT '[]',
                date_decided     TEXT,
                decided_by       TEXT
            );

            CREATE TABLE IF NOT EXISTS analysis_checkpoints (
                branch           TEXT PRIMARY KEY,
                last_revision    TEXT NOT NULL,
                files_analyzed   INTEGER NOT NULL DEFAULT 0,
                symbols_analyzed INTEGER NOT NULL DEFAULT 0,
                merge_base       TEXT,
                updated_at       TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS index_checkpoint (
                id                INTEGER PRIMARY KEY CHECK (id = 1),
                revision          TEXT NOT NULL,
                files_indexed     INTEGER NOT NULL,
                files_deleted     INTEGER NOT NULL,
                symbols_indexed   INTEGER NOT NULL,
                relations_indexed INTEGER NOT NULL,
                duration_ms       INTEGER NOT NULL,
                mode              TEXT NOT NULL,
                created_at        TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pipeline_runs (
                id             INTEGER PRIMARY KEY,
                run_id         TEXT NOT NULL UNIQUE,
                revision       TEXT,
                branch         TEXT,
                status         TEXT NOT NULL,
                score          REAL,
                verdict        TEXT,
                files_analyzed INTEGER NOT NULL DEFAULT 0,
                started_at     TEXT NOT NULL,
                completed_at   TEXT,
                duration_ms    INTEGER
            );

            CREATE TABLE IF NOT EXISTS query_cache (
                signature   TEXT PRIMARY KEY,
                operation   TEXT NOT NULL,
                result_json TEXT NOT NULL,
                cited_count INTEGER NOT NULL,
                created_at  TEXT NOT NULL,
                expires_at  TEXT NOT NULL,
                hit_count   INTEGER NOT NULL DEFAULT 0,
                last_hit_at TEXT
            );

            CREATE TABLE IF NOT EXISTS query_cache_files (
                signature TEXT NOT NULL REFERENCES query_cache(signature) ON DELETE CASCADE,
                file_id   INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
                PRIMARY KEY (signature, file_id)
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_files_module          ON files(module);
            CREATE INDEX IF NOT EXISTS idx_symbols_file          ON symbols(file_id, line_start);
            CREATE INDEX IF NOT EXISTS idx_symbols_name          ON symbols(name);
            CREATE INDEX IF NOT EXISTS idx_symbols_kind          ON symbols(kind, name);
            CREATE INDEX IF NOT EXISTS idx_relations_source      ON relations(source_id);
            CREATE INDEX IF NOT EXISTS idx_relations_target      ON relations(target_id);
            CREATE INDEX IF NOT EXISTS idx_pending_source        ON pending_references(source_id);
            CREATE INDEX IF NOT EXISTS idx_file_relations_target ON file_relations(target_file_id);
            CREATE INDEX IF NOT EXISTS idx_file_commits_path     ON file_commits(path, committed_at);
            CREATE INDEX IF NOT EXISTS idx_errors_path           ON error_history(file_path, discovered_at);
            CREATE INDEX IF NOT EXISTS idx_errors_module         ON error_history(module);
            CREATE INDEX IF NOT EXISTS idx_cache_files_file      ON query_cache_files(file_id);
            ",
        )?;
        Ok(())
    }

    /// Names of all user tables, sorted.
    pub fn table_names(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

pub(crate) fn require<T>(value: Option<T>, kind: &'static str, name: &str) -> Result<T> {
    value.ok_or_else(|| GraphError::not_found(kind, name))
}
