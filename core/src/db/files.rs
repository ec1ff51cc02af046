use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{format_ts, placeholders, require, Database, IN_CHUNK, NOW_SQL};
use crate::error::{GraphError, Result};
use crate::model::FileRelationType;

// ---------------------------------------------------------------------------
// Data structs
// ---------------------------------------------------------------------------

/// Attributes written by `upsert_file`. Derived aggregates (complexity,
/// activity, coverage) are owned by `recompute_aggregates` instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileAttrs {
    /// Defaults to the first path component, or `root` for top-level files.
    pub module: Option<String>,
    pub layer: Option<String>,
    pub file_type: Option<String>,
    pub language: String,
    pub is_critical: bool,
    pub criticality_reason: Option<String>,
    pub security_sensitive: bool,
    pub lines_total: i64,
    pub lines_code: i64,
    pub lines_comment: i64,
    pub lines_blank: i64,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub filename: String,
    pub extension: String,
    pub module: String,
    pub layer: Option<String>,
    pub file_type: String,
    pub language: String,
    pub is_critical: bool,
    pub criticality_reason: Option<String>,
    pub security_sensitive: bool,
    pub lines_total: i64,
    pub lines_code: i64,
    pub lines_comment: i64,
    pub lines_blank: i64,
    pub complexity_sum: i64,
    pub complexity_avg: f64,
    pub complexity_max: i64,
    pub complexity_max_prev: Option<i64>,
    pub commits_30d: i64,
    pub commits_90d: i64,
    pub commits_365d: i64,
    pub last_modified: Option<String>,
    pub has_tests: bool,
    pub test_file_path: Option<String>,
    pub documentation_score: f64,
    pub technical_debt_score: i64,
    pub content_hash: String,
    pub created_at: String,
    pub indexed_at: String,
}

impl FileRecord {
    /// Growth of the worst symbol's complexity since the previous index.
    pub fn complexity_delta(&self) -> i64 {
        match self.complexity_max_prev {
            Some(prev) => (self.complexity_max - prev).max(0),
            None => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileEdge {
    pub file_id: i64,
    pub path: String,
    pub relation_type: FileRelationType,
    pub line: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleStats {
    pub module: String,
    pub file_count: i64,
    pub critical_files: i64,
    pub files_with_tests: i64,
    pub lines_code: i64,
    pub complexity_avg: f64,
    pub complexity_max: i64,
    pub commits_30d: i64,
    pub symbol_counts: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleDependency {
    pub module: String,
    pub edge_count: i64,
}

/// Inputs of the technical-debt heuristic.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebtInputs {
    pub complexity_max: i64,
    pub lines_code: i64,
    pub function_count: i64,
    pub documented_ratio: f64,
    pub commits_30d: i64,
}

/// 0-100, higher means more debt.
pub fn technical_debt_score(d: DebtInputs) -> i64 {
    let mut score = 0;
    score += if d.complexity_max > 20 {
        25
    } else if d.complexity_max > 10 {
        10
    } else {
        0
    };
    score += if d.lines_code > 500 {
        20
    } else if d.lines_code > 300 {
        10
    } else {
        0
    };
    score += if d.function_count > 20 {
        15
    } else if d.function_count > 10 {
        5
    } else {
        0
    };
    if d.function_count > 0 {
        score += if d.documented_ratio < 0.3 {
            20
        } else if d.documented_ratio < 0.5 {
            10
        } else {
            0
        };
    }
    if d.commits_30d > 10 {
        score += 10;
    }
    score.min(100)
}

const FILE_COLUMNS: &str = "id, path, filename, extension, module, layer, file_type, language,
     is_critical, criticality_reason, security_sensitive,
     lines_total, lines_code, lines_comment, lines_blank,
     complexity_sum, complexity_avg, complexity_max, complexity_max_prev,
     commits_30d, commits_90d, commits_365d, last_modified,
     has_tests, test_file_path, documentation_score, technical_debt_score,
     content_hash, created_at, indexed_at";

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        path: row.get(1)?,
        filename: row.get(2)?,
        extension: row.get(3)?,
        module: row.get(4)?,
        layer: row.get(5)?,
        file_type: row.get(6)?,
        language: row.get(7)?,
        is_critical: row.get(8)?,
        criticality_reason: row.get(9)?,
        security_sensitive: row.get(10)?,
        lines_total: row.get(11)?,
        lines_code: row.get(12)?,
        lines_comment: row.get(13)?,
        lines_blank: row.get(14)?,
        complexity_sum: row.get(15)?,
        complexity_avg: row.get(16)?,
        complexity_max: row.get(17)?,
        complexity_max_prev: row.get(18)?,
        commits_30d: row.get(19)?,
        commits_90d: row.get(20)?,
        commits_365d: row.get(21)?,
        last_modified: row.get(22)?,
        has_tests: row.get(23)?,
        test_file_path: row.get(24)?,
        documentation_score: row.get(25)?,
        technical_debt_score: row.get(26)?,
        content_hash: row.get(27)?,
        created_at: row.get(28)?,
        indexed_at: row.get(29)?,
    })
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub(crate) fn module_for_path(path: &str) -> String {
    let mut parts = path.split('/').filter(|p| !p.is_empty());
    match (parts.next(), parts.next()) {
        (Some(first), Some(_)) => first.to_string(),
        _ => "root".to_string(),
    }
}

fn file_stem(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.find('.') {
        Some(0) | None => name,
        Some(pos) => &name[..pos],
    }
}

/// For a test file, the stem of the file it exercises.
pub(crate) fn stem_under_test(path: &str) -> Option<String> {
    let stem = file_stem(path);
    let name = path.rsplit('/').next().unwrap_or(path);
    if let Some(rest) = stem.strip_prefix("test_") {
        return Some(rest.to_string());
    }
    if let Some(rest) = stem.strip_suffix("_test") {
        return Some(rest.to_string());
    }
    if name.contains(".test.") || name.contains(".spec.") {
        return Some(stem.to_string());
    }
    let in_test_dir = path
        .split('/')
        .rev()
        .skip(1)
        .any(|c| c == "tests" || c == "test");
    in_test_dir.then(|| stem.to_string())
}

fn default_file_type(path: &str) -> &'static str {
    if stem_under_test(path).is_some() {
        return "test";
    }
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("h" | "hpp" | "hh") => "header",
        _ => "source",
    }
}

impl Database {
    // -----------------------------------------------------------------------
    // File CRUD
    // -----------------------------------------------------------------------

    /// Insert or update the file at `path`; the id of an existing row is kept.
    pub fn upsert_file(&self, path: &str, attrs: &FileAttrs) -> Result<i64> {
        let path = path.trim();
        if path.is_empty() {
            return Err(GraphError::InvalidArgument("file path is empty".into()));
        }
        let filename = path.rsplit('/').next().unwrap_or(path).to_string();
        let extension = Path::new(path)
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();
        let module = attrs
            .module
            .clone()
            .unwrap_or_else(|| module_for_path(path));
        let file_type = attrs
            .file_type
            .clone()
            .unwrap_or_else(|| default_file_type(path).to_string());

        self.conn.execute(
            &format!(
                "INSERT INTO files (path, filename, extension, module, layer, file_type, language,
                                    is_critical, criticality_reason, security_sensitive,
                                    lines_total, lines_code, lines_comment, lines_blank,
                                    content_hash, created_at, indexed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, {NOW_SQL}, {NOW_SQL})
                 ON CONFLICT(path) DO UPDATE SET
                    filename            = excluded.filename,
                    extension           = excluded.extension,
                    module              = excluded.module,
                    layer               = excluded.layer,
                    file_type           = excluded.file_type,
                    language            = excluded.language,
                    is_critical         = excluded.is_critical,
                    criticality_reason  = excluded.criticality_reason,
                    security_sensitive  = excluded.security_sensitive,
                    lines_total         = excluded.lines_total,
                    lines_code          = excluded.lines_code,
                    lines_comment       = excluded.lines_comment,
                    lines_blank         = excluded.lines_blank,
                    complexity_max_prev = files.complexity_max,
                    content_hash        = excluded.content_hash,
                    indexed_at          = excluded.indexed_at"
            ),
            params![
                path,
                filename,
                extension,
                module,
                attrs.layer,
                file_type,
                attrs.language,
                attrs.is_critical,
                attrs.criticality_reason,
                attrs.security_sensitive,
                attrs.lines_total,
                attrs.lines_code,
                attrs.lines_comment,
                attrs.lines_blank,
                attrs.content_hash,
            ],
        )?;
        // last_insert_rowid is stale on the UPDATE path of an upsert.
        let id: i64 = self.conn.query_row(
            "SELECT id FROM files WHERE path = ?1",
            params![path],
            |r| r.get(0),
        )?;
        self.purge_cache_for_files(&[id])?;
        Ok(id)
    }

    pub fn get_file(&self, path: &str) -> Result<Option<FileRecord>> {
        let r = self
            .conn
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM files WHERE path = ?1"),
                params![path],
                file_from_row,
            )
            .optional()?;
        Ok(r)
    }

    /// Like `get_file` but a missing path is `NotFound`.
    pub fn require_file(&self, path: &str) -> Result<FileRecord> {
        require(self.get_file(path)?, "file", path)
    }

    pub fn get_file_by_id(&self, id: i64) -> Result<Option<FileRecord>> {
        let r = self
            .conn
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"),
                params![id],
                file_from_row,
            )
            .optional()?;
        Ok(r)
    }

    pub fn get_files_by_ids(&self, ids: &[i64]) -> Result<Vec<FileRecord>> {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT {FILE_COLUMNS} FROM files WHERE id IN ({}) ORDER BY path",
                placeholders(1, chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), file_from_row)?;
            for r in rows {
                out.push(r?);
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    pub fn list_files(&self) -> Result<Vec<FileRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {FILE_COLUMNS} FROM files ORDER BY path"))?;
        let rows = stmt.query_map([], file_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn list_files_in_module(&self, module: &str) -> Result<Vec<FileRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE module = ?1 ORDER BY path"
        ))?;
        let rows = stmt.query_map(params![module], file_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn get_file_hash(&self, path: &str) -> Result<Option<String>> {
        let r = self
            .conn
            .query_row(
                "SELECT content_hash FROM files WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(r)
    }

    pub fn file_count(&self) -> Result<i64> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))?;
        Ok(n)
    }

    /// Delete the file at `path` together with its symbols, every relation
    /// touching them and every file relation touching the file. Defect
    /// history survives with its file link cleared. Returns false when the
    /// path is not tracked.
    pub fn delete_file(&self, path: &str) -> Result<bool> {
        self.with_transaction(|| {
            let file_id: Option<i64> = self
                .conn
                .query_row(
                    "SELECT id FROM files WHERE path = ?1",
                    params![path],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(file_id) = file_id else {
                return Ok(false);
            };
            self.purge_cache_for_files(&[file_id])?;
            self.conn
                .execute("DELETE FROM files WHERE id = ?1", params![file_id])?;
            Ok(true)
        })
    }

    // -----------------------------------------------------------------------
    // File relations
    // -----------------------------------------------------------------------

    /// Replace the include/import edges leaving `source_file_id`.
    pub fn replace_file_relations(
        &self,
        source_file_id: i64,
        edges: &[(i64, FileRelationType, Option<i64>)],
    ) -> Result<usize> {
        self.with_transaction(|| {
            let mut touched: Vec<i64> = {
                let mut stmt = self.conn.prepare(
                    "SELECT target_file_id FROM file_relations WHERE source_file_id = ?1",
                )?;
                let rows = stmt.query_map(params![source_file_id], |r| r.get(0))?;
                rows.collect::<std::result::Result<_, rusqlite::Error>>()?
            };
            self.conn.execute(
                "DELETE FROM file_relations WHERE source_file_id = ?1",
                params![source_file_id],
            )?;
            let mut stmt = self.conn.prepare(
                "INSERT INTO file_relations (source_file_id, target_file_id, relation_type, line_number)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(source_file_id, target_file_id, relation_type) DO NOTHING",
            )?;
            let mut count = 0;
            for (target, kind, line) in edges {
                if *target == source_file_id {
                    continue;
                }
                touched.push(*target);
                count += stmt.execute(params![source_file_id, target, kind.as_str(), line])?;
            }
            // Includers of a target change, so do impact answers citing it.
            touched.push(source_file_id);
            touched.sort_unstable();
            touched.dedup();
            self.purge_cache_for_files(&touched)?;
            Ok(count)
        })
    }

    /// Files that `file_id` includes or imports.
    pub fn get_file_relations_out(&self, file_id: i64) -> Result<Vec<FileEdge>> {
        self.file_edges(
            "SELECT f.id, f.path, fr.relation_type, fr.line_number
             FROM file_relations fr JOIN files f ON f.id = fr.target_file_id
             WHERE fr.source_file_id = ?1
             ORDER BY f.path, fr.relation_type",
            file_id,
        )
    }

    /// Files that include or import `file_id`.
    pub fn get_file_relations_in(&self, file_id: i64) -> Result<Vec<FileEdge>> {
        self.file_edges(
            "SELECT f.id, f.path, fr.relation_type, fr.line_number
             FROM file_relations fr JOIN files f ON f.id = fr.source_file_id
             WHERE fr.target_file_id = ?1
             ORDER BY f.path, fr.relation_type",
            file_id,
        )
    }

    fn file_edges(&self, sql: &str, file_id: i64) -> Result<Vec<FileEdge>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![file_id], |row| {
            Ok(FileEdge {
                file_id: row.get(0)?,
                path: row.get(1)?,
                relation_type: FileRelationType::parse_lenient(&row.get::<_, String>(2)?),
                line: row.get(3)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// `(target_file_id, includer_file_id)` for every includer of `file_ids`.
    pub fn includers_of(&self, file_ids: &[i64]) -> Result<Vec<(i64, i64)>> {
        let mut out = Vec::new();
        for chunk in file_ids.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT target_file_id, source_file_id FROM file_relations
                 WHERE target_file_id IN ({})
                 ORDER BY target_file_id, source_file_id",
                placeholders(1, chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            for r in rows {
                out.push(r?);
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Derived aggregates
    // -----------------------------------------------------------------------

    /// Recompute complexity rollups, documentation ratio, rolling commit
    /// windows, test counterparts and technical debt for every file.
    pub fn recompute_aggregates(&self, now: DateTime<Utc>) -> Result<usize> {
        let d30 = format_ts(now - Duration::days(30));
        let d90 = format_ts(now - Duration::days(90));
        let d365 = format_ts(now - Duration::days(365));

        self.with_transaction(|| {
            let updated = self.conn.execute(
                "UPDATE files SET
                    complexity_sum = COALESCE((SELECT SUM(complexity) FROM symbols s WHERE s.file_id = files.id), 0),
                    complexity_max = COALESCE((SELECT MAX(complexity) FROM symbols s WHERE s.file_id = files.id), 0),
                    complexity_avg = COALESCE((SELECT AVG(complexity) FROM symbols s
                                                WHERE s.file_id = files.id AND s.kind IN ('function', 'method')), 0),
                    documentation_score = COALESCE((SELECT AVG(has_doc) FROM symbols s
                                                     WHERE s.file_id = files.id
                                                       AND s.kind IN ('function', 'method', 'class', 'struct',
                                                                      'enum', 'interface', 'trait')), 0),
                    commits_30d  = (SELECT COUNT(*) FROM file_commits c WHERE c.path = files.path AND c.committed_at >= ?1),
                    commits_90d  = (SELECT COUNT(*) FROM file_commits c WHERE c.path = files.path AND c.committed_at >= ?2),
                    commits_365d = (SELECT COUNT(*) FROM file_commits c WHERE c.path = files.path AND c.committed_at >= ?3),
                    last_modified = (SELECT MAX(committed_at) FROM file_commits c WHERE c.path = files.path)",
                params![d30, d90, d365],
            )?;

            // Test counterparts, keyed by the stem under test.
            let mut tests_by_stem: HashMap<String, String> = HashMap::new();
            let mut rows: Vec<(i64, String, String, i64, i64, f64, i64)> = Vec::new();
            {
                let mut stmt = self.conn.prepare(
                    "SELECT id, path, file_type, lines_code, complexity_max, documentation_score, commits_30d
                     FROM files ORDER BY path",
                )?;
                let mapped = stmt.query_map([], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?, r.get(6)?))
                })?;
                for r in mapped {
                    rows.push(r?);
                }
            }
            for (_, path, file_type, ..) in &rows {
                if file_type == "test" {
                    if let Some(stem) = stem_under_test(path) {
                        tests_by_stem.entry(stem).or_insert_with(|| path.clone());
                    }
                }
            }

            let function_counts: HashMap<i64, i64> = {
                let mut stmt = self.conn.prepare(
                    "SELECT file_id, COUNT(*) FROM symbols
                     WHERE kind IN ('function', 'method') GROUP BY file_id",
                )?;
                let mapped = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
                mapped.collect::<std::result::Result<_, _>>()?
            };

            let mut stmt = self.conn.prepare(
                "UPDATE files SET has_tests = ?2, test_file_path = ?3, technical_debt_score = ?4
                 WHERE id = ?1",
            )?;
            for (id, path, file_type, lines_code, complexity_max, doc_score, commits_30d) in &rows {
                let counterpart = if file_type == "test" {
                    None
                } else {
                    tests_by_stem.get(file_stem(path)).cloned()
                };
                let debt = technical_debt_score(DebtInputs {
                    complexity_max: *complexity_max,
                    lines_code: *lines_code,
                    function_count: function_counts.get(id).copied().unwrap_or(0),
                    documented_ratio: *doc_score,
                    commits_30d: *commits_30d,
                });
                stmt.execute(params![id, counterpart.is_some(), counterpart, debt])?;
            }
            Ok(updated)
        })
    }

    // -----------------------------------------------------------------------
    // Module rollups
    // -----------------------------------------------------------------------

    pub fn module_stats(&self, module: &str) -> Result<Option<ModuleStats>> {
        let base = self
            .conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(is_critical), 0), COALESCE(SUM(has_tests), 0),
                        COALESCE(SUM(lines_code), 0), COALESCE(AVG(complexity_avg), 0),
                        COALESCE(MAX(complexity_max), 0), COALESCE(SUM(commits_30d), 0)
                 FROM files WHERE module = ?1",
                params![module],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, i64>(1)?,
                        r.get::<_, i64>(2)?,
                        r.get::<_, i64>(3)?,
                        r.get::<_, f64>(4)?,
                        r.get::<_, i64>(5)?,
                        r.get::<_, i64>(6)?,
                    ))
                },
            )?;
        if base.0 == 0 {
            return Ok(None);
        }

        let mut stmt = self.conn.prepare(
            "SELECT s.kind, COUNT(*) FROM symbols s JOIN files f ON f.id = s.file_id
             WHERE f.module = ?1 GROUP BY s.kind ORDER BY s.kind",
        )?;
        let counts = stmt
            .query_map(params![module], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;

        Ok(Some(ModuleStats {
            module: module.to_string(),
            file_count: base.0,
            critical_files: base.1,
            files_with_tests: base.2,
            lines_code: base.3,
            complexity_avg: base.4,
            complexity_max: base.5,
            commits_30d: base.6,
            symbol_counts: counts,
        }))
    }

    /// Modules this module includes/imports, and modules that include it.
    pub fn module_dependencies(
        &self,
        module: &str,
    ) -> Result<(Vec<ModuleDependency>, Vec<ModuleDependency>)> {
        let depends_on = self.module_edges(
            "SELECT t.module, COUNT(*) FROM file_relations fr
             JOIN files s ON s.id = fr.source_file_id
             JOIN files t ON t.id = fr.target_file_id
             WHERE s.module = ?1 AND t.module != ?1
             GROUP BY t.module ORDER BY t.module",
            module,
        )?;
        let depended_by = self.module_edges(
            "SELECT s.module, COUNT(*) FROM file_relations fr
             JOIN files s ON s.id = fr.source_file_id
             JOIN files t ON t.id = fr.target_file_id
             WHERE t.module = ?1 AND s.module != ?1
             GROUP BY s.module ORDER BY s.module",
            module,
        )?;
        Ok((depends_on, depended_by))
    }

    fn module_edges(&self, sql: &str, module: &str) -> Result<Vec<ModuleDependency>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![module], |r| {
            Ok(ModuleDependency {
                module: r.get(0)?,
                edge_count: r.get(1)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Every module name, sorted.
    pub fn list_modules(&self) -> Result<BTreeSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT module FROM files ORDER BY module")?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        rows.collect::<std::result::Result<BTreeSet<_>, _>>()
            .map_err(Into::into)
    }
}
