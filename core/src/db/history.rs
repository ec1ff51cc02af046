use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::files::module_for_path;
use super::{format_ts, Database, NOW_SQL};
use crate::error::{GraphError, Result};
use crate::model::{IndexMode, Severity};

// ---------------------------------------------------------------------------
// Commit activity
// ---------------------------------------------------------------------------

/// One commit touching one path, as reported by revision control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRecord {
    pub path: String,
    pub revision: String,
    #[serde(default)]
    pub author: String,
    pub committed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Defect history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDefect {
    pub file_path: String,
    #[serde(default)]
    pub symbol_name: Option<String>,
    pub error_type: String,
    pub severity: Severity,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub root_cause: Option<String>,
    #[serde(default)]
    pub fix_description: Option<String>,
    #[serde(default)]
    pub prevention: Option<String>,
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ticket: Option<String>,
    #[serde(default)]
    pub is_regression: bool,
    #[serde(default)]
    pub original_error_id: Option<i64>,
}

impl NewDefect {
    pub fn new(file_path: &str, error_type: &str, severity: Severity, title: &str, discovered_at: DateTime<Utc>) -> Self {
        Self {
            file_path: file_path.to_string(),
            symbol_name: None,
            error_type: error_type.to_string(),
            severity,
            title: title.to_string(),
            description: None,
            root_cause: None,
            fix_description: None,
            prevention: None,
            discovered_at,
            resolved_at: None,
            ticket: None,
            is_regression: false,
            original_error_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DefectRecord {
    pub id: i64,
    pub file_path: String,
    pub module: Option<String>,
    pub symbol_name: Option<String>,
    pub error_type: String,
    pub severity: Severity,
    pub title: String,
    pub description: Option<String>,
    pub root_cause: Option<String>,
    pub fix_description: Option<String>,
    pub prevention: Option<String>,
    pub discovered_at: String,
    pub resolved_at: Option<String>,
    pub ticket: Option<String>,
    pub is_regression: bool,
    pub original_error_id: Option<i64>,
}

/// Filters for defect queries; `None` means unfiltered.
#[derive(Debug, Clone, Default)]
pub struct DefectFilter {
    pub file_path: Option<String>,
    pub symbol_name: Option<String>,
    pub module: Option<String>,
    pub error_type: Option<String>,
    pub min_severity: Option<Severity>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

const DEFECT_COLUMNS: &str = "id, file_path, module, symbol_name, error_type, severity, title,
     description, root_cause, fix_description, prevention, discovered_at, resolved_at,
     ticket, is_regression, original_error_id";

fn defect_from_row(row: &Row<'_>) -> rusqlite::Result<DefectRecord> {
    Ok(DefectRecord {
        id: row.get(0)?,
        file_path: row.get(1)?,
        module: row.get(2)?,
        symbol_name: row.get(3)?,
        error_type: row.get(4)?,
        severity: Severity::parse_lenient(&row.get::<_, String>(5)?),
        title: row.get(6)?,
        description: row.get(7)?,
        root_cause: row.get(8)?,
        fix_description: row.get(9)?,
        prevention: row.get(10)?,
        discovered_at: row.get(11)?,
        resolved_at: row.get(12)?,
        ticket: row.get(13)?,
        is_regression: row.get(14)?,
        original_error_id: row.get(15)?,
    })
}

// ---------------------------------------------------------------------------
// Checkpoints and run ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexCheckpoint {
    pub revision: String,
    pub files_indexed: i64,
    pub files_deleted: i64,
    pub symbols_indexed: i64,
    pub relations_indexed: i64,
    pub duration_ms: i64,
    pub mode: IndexMode,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisCheckpoint {
    pub branch: String,
    pub last_revision: String,
    pub files_analyzed: i64,
    pub symbols_analyzed: i64,
    pub merge_base: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub revision: Option<String>,
    pub branch: Option<String>,
    pub status: String,
    pub score: Option<f64>,
    pub verdict: Option<String>,
    pub files_analyzed: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// Revision ids are opaque, but must be short printable tokens.
pub fn validate_revision(revision: &str) -> Result<()> {
    let ok = !revision.is_empty()
        && revision.len() <= 64
        && revision
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'));
    if ok {
        Ok(())
    } else {
        Err(GraphError::IntegrityError(format!(
            "malformed revision id '{revision}'"
        )))
    }
}

impl Database {
    // -----------------------------------------------------------------------
    // Commit activity
    // -----------------------------------------------------------------------

    /// Record commits; re-recording the same (path, revision) is a no-op.
    pub fn record_commits(&self, commits: &[CommitRecord]) -> Result<usize> {
        self.with_transaction(|| {
            let mut stmt = self.conn.prepare(
                "INSERT INTO file_commits (path, revision, author, committed_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(path, revision) DO NOTHING",
            )?;
            let mut added = 0;
            for c in commits {
                validate_revision(&c.revision)?;
                added += stmt.execute(params![c.path, c.revision, c.author, format_ts(c.committed_at)])?;
            }
            Ok(added)
        })
    }

    // -----------------------------------------------------------------------
    // Defect history
    // -----------------------------------------------------------------------

    pub fn insert_defect(&self, defect: &NewDefect) -> Result<i64> {
        if defect.title.trim().is_empty() {
            return Err(GraphError::InvalidArgument("defect title is empty".into()));
        }
        let file = self.get_file(&defect.file_path)?;
        let module = file
            .as_ref()
            .map(|f| f.module.clone())
            .unwrap_or_else(|| module_for_path(&defect.file_path));
        let symbol_id = match (&file, &defect.symbol_name) {
            (Some(f), Some(name)) => self
                .conn
                .query_row(
                    "SELECT id FROM symbols WHERE file_id = ?1 AND name = ?2
                     ORDER BY line_start LIMIT 1",
                    params![f.id, name],
                    |r| r.get::<_, i64>(0),
                )
                .optional()?,
            _ => None,
        };

        self.conn.execute(
            "INSERT INTO error_history (file_id, file_path, module, symbol_id, symbol_name,
                                        error_type, severity, title, description, root_cause,
                                        fix_description, prevention, discovered_at, resolved_at,
                                        ticket, is_regression, original_error_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                file.as_ref().map(|f| f.id),
                defect.file_path,
                module,
                symbol_id,
                defect.symbol_name,
                defect.error_type,
                defect.severity.as_str(),
                defect.title,
                defect.description,
                defect.root_cause,
                defect.fix_description,
                defect.prevention,
                format_ts(defect.discovered_at),
                defect.resolved_at.map(format_ts),
                defect.ticket,
                defect.is_regression,
                defect.original_error_id,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        if let Some(f) = &file {
            self.purge_cache_for_files(&[f.id])?;
        }
        Ok(id)
    }

    /// Import a batch atomically.
    pub fn import_defects(&self, defects: &[NewDefect]) -> Result<Vec<i64>> {
        self.with_transaction(|| defects.iter().map(|d| self.insert_defect(d)).collect())
    }

    pub fn resolve_defect(&self, id: i64, resolved_at: DateTime<Utc>, fix: Option<&str>) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE error_history
             SET resolved_at = ?2, fix_description = COALESCE(?3, fix_description)
             WHERE id = ?1",
            params![id, format_ts(resolved_at), fix],
        )?;
        if changed == 0 {
            return Err(GraphError::not_found("defect", id.to_string()));
        }
        Ok(())
    }

    /// Matching defects, newest first.
    pub fn query_defects(&self, filter: &DefectFilter) -> Result<Vec<DefectRecord>> {
        let mut sql = format!("SELECT {DEFECT_COLUMNS} FROM error_history WHERE 1=1");
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        let mut idx = 1;

        if let Some(path) = &filter.file_path {
            sql.push_str(&format!(" AND file_path = ?{idx}"));
            param_values.push(Box::new(path.clone()));
            idx += 1;
        }
        if let Some(name) = &filter.symbol_name {
            sql.push_str(&format!(" AND symbol_name = ?{idx}"));
            param_values.push(Box::new(name.clone()));
            idx += 1;
        }
        if let Some(module) = &filter.module {
            sql.push_str(&format!(" AND module = ?{idx}"));
            param_values.push(Box::new(module.clone()));
            idx += 1;
        }
        if let Some(kind) = &filter.error_type {
            sql.push_str(&format!(" AND error_type = ?{idx}"));
            param_values.push(Box::new(kind.clone()));
            idx += 1;
        }
        if let Some(min) = filter.min_severity {
            let allowed = min.at_least();
            sql.push_str(&format!(
                " AND severity IN ({})",
                super::placeholders(idx, allowed.len())
            ));
            for s in &allowed {
                param_values.push(Box::new(s.as_str().to_string()));
            }
            idx += allowed.len();
        }
        if let Some(since) = filter.since {
            sql.push_str(&format!(" AND discovered_at >= ?{idx}"));
            param_values.push(Box::new(format_ts(since)));
        }
        sql.push_str(" ORDER BY discovered_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let params_refs: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|b| b.as_ref()).collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_refs.as_slice(), defect_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    pub fn get_index_checkpoint(&self) -> Result<Option<IndexCheckpoint>> {
        let r = self
            .conn
            .query_row(
                "SELECT revision, files_indexed, files_deleted, symbols_indexed, relations_indexed,
                        duration_ms, mode, created_at
                 FROM index_checkpoint WHERE id = 1",
                [],
                |row| {
                    Ok(IndexCheckpoint {
                        revision: row.get(0)?,
                        files_indexed: row.get(1)?,
                        files_deleted: row.get(2)?,
                        symbols_indexed: row.get(3)?,
                        relations_indexed: row.get(4)?,
                        duration_ms: row.get(5)?,
                        mode: IndexMode::parse_lenient(&row.get::<_, String>(6)?),
                        created_at: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(r)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn write_index_checkpoint(
        &self,
        revision: &str,
        files_indexed: i64,
        files_deleted: i64,
        symbols_indexed: i64,
        relations_indexed: i64,
        duration_ms: i64,
        mode: IndexMode,
    ) -> Result<()> {
        validate_revision(revision)?;
        self.conn.execute(
            &format!(
                "INSERT INTO index_checkpoint (id, revision, files_indexed, files_deleted,
                                               symbols_indexed, relations_indexed, duration_ms,
                                               mode, created_at)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, {NOW_SQL})
                 ON CONFLICT(id) DO UPDATE SET
                    revision          = excluded.revision,
                    files_indexed     = excluded.files_indexed,
                    files_deleted     = excluded.files_deleted,
                    symbols_indexed   = excluded.symbols_indexed,
                    relations_indexed = excluded.relations_indexed,
                    duration_ms       = excluded.duration_ms,
                    mode              = excluded.mode,
                    created_at        = excluded.created_at"
            ),
            params![
                revision,
                files_indexed,
                files_deleted,
                symbols_indexed,
                relations_indexed,
                duration_ms,
                mode.as_str()
            ],
        )?;
        Ok(())
    }

    pub fn get_analysis_checkpoint(&self, branch: &str) -> Result<Option<AnalysisCheckpoint>> {
        let r = self
            .conn
            .query_row(
                "SELECT branch, last_revision, files_analyzed, symbols_analyzed, merge_base, updated_at
                 FROM analysis_checkpoints WHERE branch = ?1",
                params![branch],
                |row| {
                    Ok(AnalysisCheckpoint {
                        branch: row.get(0)?,
                        last_revision: row.get(1)?,
                        files_analyzed: row.get(2)?,
                        symbols_analyzed: row.get(3)?,
                        merge_base: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(r)
    }

    pub fn write_analysis_checkpoint(
        &self,
        branch: &str,
        revision: &str,
        files_analyzed: i64,
        symbols_analyzed: i64,
        merge_base: Option<&str>,
    ) -> Result<()> {
        if branch.trim().is_empty() {
            return Err(GraphError::InvalidArgument("branch name is empty".into()));
        }
        validate_revision(revision)?;
        if let Some(base) = merge_base {
            validate_revision(base)?;
        }
        self.conn.execute(
            &format!(
                "INSERT INTO analysis_checkpoints (branch, last_revision, files_analyzed,
                                                   symbols_analyzed, merge_base, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, {NOW_SQL})
                 ON CONFLICT(branch) DO UPDATE SET
                    last_revision    = excluded.last_revision,
                    files_analyzed   = excluded.files_analyzed,
                    symbols_analyzed = excluded.symbols_analyzed,
                    merge_base       = excluded.merge_base,
                    updated_at       = excluded.updated_at"
            ),
            params![branch, revision, files_analyzed, symbols_analyzed, merge_base],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run ledger (append-only)
    // -----------------------------------------------------------------------

    pub fn record_run(&self, run: &RunRecord) -> Result<i64> {
        if let Some(rev) = &run.revision {
            validate_revision(rev)?;
        }
        self.conn.execute(
            "INSERT INTO pipeline_runs (run_id, revision, branch, status, score, verdict,
                                        files_analyzed, started_at, completed_at, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                run.run_id,
                run.revision,
                run.branch,
                run.status,
                run.score,
                run.verdict,
                run.files_analyzed,
                format_ts(run.started_at),
                run.completed_at.map(format_ts),
                run.duration_ms,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent runs first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT run_id, revision, branch, status, score, verdict, files_analyzed,
                    started_at, completed_at, duration_ms
             FROM pipeline_runs ORDER BY id DESC LIMIT {limit}"
        ))?;
        let rows = stmt.query_map([], |row| {
            let started: String = row.get(7)?;
            let completed: Option<String> = row.get(8)?;
            Ok(RunRecord {
                run_id: row.get(0)?,
                revision: row.get(1)?,
                branch: row.get(2)?,
                status: row.get(3)?,
                score: row.get(4)?,
                verdict: row.get(5)?,
                files_analyzed: row.get(6)?,
                started_at: parse_ts(&started),
                completed_at: completed.as_deref().map(parse_ts),
                duration_ms: row.get(9)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}
