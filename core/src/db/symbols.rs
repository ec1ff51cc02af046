use std::collections::{BTreeMap, HashMap};

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{placeholders, Database, IN_CHUNK, NOW_SQL};
use crate::error::{GraphError, Result};
use crate::model::{RelationType, SymbolKind};

// ---------------------------------------------------------------------------
// Write-side structs
// ---------------------------------------------------------------------------

/// A symbol as produced by extraction, before it has an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSymbol {
    pub name: String,
    #[serde(default)]
    pub qualified_name: Option<String>,
    pub kind: SymbolKind,
    pub line_start: i64,
    pub line_end: i64,
    #[serde(default)]
    pub column_start: i64,
    #[serde(default)]
    pub column_end: i64,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub return_type: Option<String>,
    #[serde(default = "default_visibility")]
    pub visibility: String,
    #[serde(default)]
    pub is_exported: bool,
    #[serde(default = "default_complexity")]
    pub complexity: i64,
    #[serde(default)]
    pub lines_of_code: i64,
    #[serde(default)]
    pub doc_comment: Option<String>,
}

fn default_visibility() -> String {
    "public".to_string()
}

fn default_complexity() -> i64 {
    1
}

impl NewSymbol {
    pub fn new(name: &str, kind: SymbolKind, line_start: i64, line_end: i64) -> Self {
        Self {
            name: name.to_string(),
            qualified_name: None,
            kind,
            line_start,
            line_end,
            column_start: 0,
            column_end: 0,
            signature: String::new(),
            return_type: None,
            visibility: default_visibility(),
            is_exported: false,
            complexity: default_complexity(),
            lines_of_code: (line_end - line_start + 1).max(0),
            doc_comment: None,
        }
    }

    pub fn with_complexity(mut self, complexity: i64) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_doc(mut self, doc: &str) -> Self {
        self.doc_comment = Some(doc.to_string());
        self
    }

    pub fn with_signature(mut self, signature: &str) -> Self {
        self.signature = signature.to_string();
        self
    }
}

/// Target endpoint of a new relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationTarget {
    /// Index into the symbol list of the same replace call.
    Local(usize),
    /// An existing symbol id, usually owned by another file.
    Symbol(i64),
}

/// A relation owned by the file of its source symbol.
#[derive(Debug, Clone)]
pub struct NewRelation {
    /// Index into the symbol list of the same replace call.
    pub source: usize,
    pub target: RelationTarget,
    pub relation_type: RelationType,
    pub line: Option<i64>,
    pub column: Option<i64>,
    pub count: i64,
    pub is_direct: bool,
    pub is_conditional: bool,
}

impl NewRelation {
    pub fn new(source: usize, target: RelationTarget, relation_type: RelationType) -> Self {
        Self {
            source,
            target,
            relation_type,
            line: None,
            column: None,
            count: 1,
            is_direct: true,
            is_conditional: false,
        }
    }

    pub fn calls(source: usize, target: RelationTarget) -> Self {
        Self::new(source, target, RelationType::Calls)
    }

    pub fn at_line(mut self, line: i64) -> Self {
        self.line = Some(line);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplaceStats {
    /// Ids of the inserted symbols, in input order.
    pub symbol_ids: Vec<i64>,
    pub relations: usize,
    /// Incoming edges from other files re-pointed at the new symbols.
    pub relinked: usize,
}

/// A reference stored until a symbol with `target_name` appears.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReference {
    pub file_id: i64,
    pub source_id: i64,
    pub target_name: String,
    pub target_path: Option<String>,
    pub relation_type: RelationType,
    pub line: Option<i64>,
    pub count: i64,
}

// ---------------------------------------------------------------------------
// Read-side structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SymbolRecord {
    pub id: i64,
    pub file_id: i64,
    pub file_path: String,
    pub name: String,
    pub qualified_name: String,
    pub kind: SymbolKind,
    pub line_start: i64,
    pub line_end: i64,
    pub column_start: i64,
    pub signature: String,
    pub visibility: String,
    pub is_exported: bool,
    pub complexity: i64,
    pub has_doc: bool,
    pub file_is_critical: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Follow edges backwards: who references the frontier.
    Incoming,
    /// Follow edges forwards: what the frontier references.
    Outgoing,
}

/// One edge reached from a frontier symbol.
#[derive(Debug, Clone)]
pub struct SymbolEdge {
    pub from: i64,
    pub symbol: SymbolRecord,
    pub relation_type: RelationType,
    pub line: Option<i64>,
    pub count: i64,
    pub is_direct: bool,
}

/// A symbol edge crossing from one file into another.
#[derive(Debug, Clone)]
pub struct CrossFileEdge {
    pub target_file_id: i64,
    pub source_file_id: i64,
    pub source_symbol: String,
}

const SYMBOL_COLUMNS: &str = "s.id, s.file_id, f.path, s.name, s.qualified_name, s.kind,
     s.line_start, s.line_end, s.column_start, s.signature, s.visibility, s.is_exported,
     s.complexity, s.has_doc, f.is_critical";

fn symbol_from_row_at(row: &Row<'_>, at: usize) -> rusqlite::Result<SymbolRecord> {
    Ok(SymbolRecord {
        id: row.get(at)?,
        file_id: row.get(at + 1)?,
        file_path: row.get(at + 2)?,
        name: row.get(at + 3)?,
        qualified_name: row.get(at + 4)?,
        kind: SymbolKind::parse_lenient(&row.get::<_, String>(at + 5)?),
        line_start: row.get(at + 6)?,
        line_end: row.get(at + 7)?,
        column_start: row.get(at + 8)?,
        signature: row.get(at + 9)?,
        visibility: row.get(at + 10)?,
        is_exported: row.get(at + 11)?,
        complexity: row.get(at + 12)?,
        has_doc: row.get(at + 13)?,
        file_is_critical: row.get(at + 14)?,
    })
}

fn symbol_from_row(row: &Row<'_>) -> rusqlite::Result<SymbolRecord> {
    symbol_from_row_at(row, 0)
}

/// Incoming edge remembered across a replace, keyed by the target's (name, kind).
struct IncomingEdge {
    source_id: i64,
    target_name: String,
    target_kind: String,
    relation_type: String,
    location_file_id: Option<i64>,
    line: Option<i64>,
    column: Option<i64>,
    count: i64,
    is_direct: bool,
    is_conditional: bool,
}

/// Turn a `*`/`?` glob into a LIKE pattern with `\` as escape.
pub(crate) fn glob_to_like(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 2);
    for c in glob.chars() {
        match c {
            '*' => out.push('%'),
            '?' => out.push('_'),
            '%' | '_' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

impl Database {
    // -----------------------------------------------------------------------
    // Atomic replace
    // -----------------------------------------------------------------------

    /// Replace every symbol owned by `file_id`, and every relation owned by
    /// those symbols, with the given sets. Any failure rolls the file back to
    /// its previous state.
    ///
    /// Relations from other files into the old symbols are re-pointed to the
    /// new symbol with the same name and kind; those without a match are dropped.
    pub fn replace_symbols_for_file(
        &self,
        file_id: i64,
        symbols: &[NewSymbol],
        relations: &[NewRelation],
    ) -> Result<ReplaceStats> {
        self.with_transaction(|| {
            let exists: Option<i64> = self
                .conn
                .query_row("SELECT id FROM files WHERE id = ?1", params![file_id], |r| {
                    r.get(0)
                })
                .optional()?;
            if exists.is_none() {
                return Err(GraphError::not_found("file", format!("id {file_id}")));
            }

            let mut touched = self.linked_files(file_id)?;
            let incoming = self.snapshot_incoming_edges(file_id)?;
            self.conn
                .execute("DELETE FROM symbols WHERE file_id = ?1", params![file_id])?;

            let mut ids = Vec::with_capacity(symbols.len());
            {
                let mut stmt = self.conn.prepare(
                    "INSERT INTO symbols (file_id, name, qualified_name, kind, line_start, line_end,
                                          column_start, column_end, signature, return_type, visibility,
                                          is_exported, complexity, lines_of_code, doc_comment, has_doc)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                )?;
                for sym in symbols {
                    let qualified = sym.qualified_name.as_deref().unwrap_or(&sym.name);
                    let has_doc = sym
                        .doc_comment
                        .as_deref()
                        .is_some_and(|d| !d.trim().is_empty());
                    stmt.execute(params![
                        file_id,
                        sym.name,
                        qualified,
                        sym.kind.as_str(),
                        sym.line_start,
                        sym.line_end,
                        sym.column_start,
                        sym.column_end,
                        sym.signature,
                        sym.return_type,
                        sym.visibility,
                        sym.is_exported,
                        sym.complexity,
                        sym.lines_of_code,
                        sym.doc_comment,
                        has_doc,
                    ])?;
                    ids.push(self.conn.last_insert_rowid());
                }
            }

            let local = |idx: usize| {
                ids.get(idx).copied().ok_or_else(|| {
                    GraphError::ConstraintViolation(format!(
                        "relation endpoint {idx} is outside the {} new symbols",
                        ids.len()
                    ))
                })
            };
            {
                let mut stmt = self.conn.prepare(
                    "INSERT INTO relations (source_id, target_id, relation_type, location_file_id,
                                            location_line, location_column, count, is_direct, is_conditional)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )?;
                for rel in relations {
                    let source = local(rel.source)?;
                    let target = match rel.target {
                        RelationTarget::Local(idx) => local(idx)?,
                        RelationTarget::Symbol(id) => id,
                    };
                    stmt.execute(params![
                        source,
                        target,
                        rel.relation_type.as_str(),
                        file_id,
                        rel.line,
                        rel.column,
                        rel.count,
                        rel.is_direct,
                        rel.is_conditional,
                    ])?;
                }
            }

            let relinked = self.relink_incoming_edges(file_id, &incoming)?;
            self.conn.execute(
                &format!("UPDATE files SET indexed_at = {NOW_SQL} WHERE id = ?1"),
                params![file_id],
            )?;
            // Files on the far side of old or new edges see different callers and callees.
            touched.extend(self.linked_files(file_id)?);
            touched.push(file_id);
            touched.sort_unstable();
            touched.dedup();
            self.purge_cache_for_files(&touched)?;

            Ok(ReplaceStats {
                symbol_ids: ids,
                relations: relations.len(),
                relinked,
            })
        })
    }

    /// Other files holding a symbol edge into or out of `file_id`.
    fn linked_files(&self, file_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT t.file_id FROM relations r
             JOIN symbols s ON s.id = r.source_id
             JOIN symbols t ON t.id = r.target_id
             WHERE s.file_id = ?1 AND t.file_id != ?1
             UNION
             SELECT s.file_id FROM relations r
             JOIN symbols s ON s.id = r.source_id
             JOIN symbols t ON t.id = r.target_id
             WHERE t.file_id = ?1 AND s.file_id != ?1",
        )?;
        let rows = stmt.query_map(params![file_id], |r| r.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    fn snapshot_incoming_edges(&self, file_id: i64) -> Result<Vec<IncomingEdge>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.source_id, t.name, t.kind, r.relation_type, r.location_file_id,
                    r.location_line, r.location_column, r.count, r.is_direct, r.is_conditional
             FROM relations r
             JOIN symbols t ON t.id = r.target_id
             JOIN symbols s ON s.id = r.source_id
             WHERE t.file_id = ?1 AND s.file_id != ?1",
        )?;
        let rows = stmt.query_map(params![file_id], |row| {
            Ok(IncomingEdge {
                source_id: row.get(0)?,
                target_name: row.get(1)?,
                target_kind: row.get(2)?,
                relation_type: row.get(3)?,
                location_file_id: row.get(4)?,
                line: row.get(5)?,
                column: row.get(6)?,
                count: row.get(7)?,
                is_direct: row.get(8)?,
                is_conditional: row.get(9)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    fn relink_incoming_edges(&self, file_id: i64, incoming: &[IncomingEdge]) -> Result<usize> {
        if incoming.is_empty() {
            return Ok(0);
        }
        // First symbol in source order wins when a name repeats.
        let mut by_key: HashMap<(String, String), i64> = HashMap::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT id, name, kind FROM symbols WHERE file_id = ?1
                 ORDER BY line_start, column_start, id",
            )?;
            let rows = stmt.query_map(params![file_id], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
            })?;
            for r in rows {
                let (id, name, kind) = r?;
                by_key.entry((name, kind)).or_insert(id);
            }
        }

        let mut stmt = self.conn.prepare(
            "INSERT INTO relations (source_id, target_id, relation_type, location_file_id,
                                    location_line, location_column, count, is_direct, is_conditional)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(source_id, target_id, relation_type)
             DO UPDATE SET count = relations.count + excluded.count",
        )?;
        let mut relinked = 0;
        for edge in incoming {
            let key = (edge.target_name.clone(), edge.target_kind.clone());
            let Some(&target) = by_key.get(&key) else {
                continue;
            };
            stmt.execute(params![
                edge.source_id,
                target,
                edge.relation_type,
                edge.location_file_id,
                edge.line,
                edge.column,
                edge.count,
                edge.is_direct,
                edge.is_conditional,
            ])?;
            relinked += 1;
        }
        Ok(relinked)
    }

    /// Add relations whose targets could not be resolved when their owning
    /// file was replaced. Every source must belong to `file_id`.
    pub fn add_relations(
        &self,
        file_id: i64,
        relations: &[(i64, i64, RelationType, Option<i64>, i64)],
    ) -> Result<usize> {
        self.with_transaction(|| {
            let mut owner = self
                .conn
                .prepare("SELECT file_id FROM symbols WHERE id = ?1")?;
            let mut insert = self.conn.prepare(
                "INSERT INTO relations (source_id, target_id, relation_type, location_file_id,
                                        location_line, count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(source_id, target_id, relation_type)
                 DO UPDATE SET count = relations.count + excluded.count",
            )?;
            let mut added = 0;
            let mut touched = vec![file_id];
            for (source, target, kind, line, count) in relations {
                let source_file: Option<i64> = owner
                    .query_row(params![source], |r| r.get(0))
                    .optional()?;
                if source_file != Some(file_id) {
                    return Err(GraphError::ConstraintViolation(format!(
                        "symbol {source} is not owned by file {file_id}"
                    )));
                }
                let target_file: Option<i64> = owner
                    .query_row(params![target], |r| r.get(0))
                    .optional()?;
                touched.extend(target_file);
                added += insert.execute(params![source, target, kind.as_str(), file_id, line, count])?;
            }
            if added > 0 {
                touched.sort_unstable();
                touched.dedup();
                self.purge_cache_for_files(&touched)?;
            }
            Ok(added)
        })
    }

    // -----------------------------------------------------------------------
    // Pending references
    // -----------------------------------------------------------------------

    /// Source symbols must belong to the named file.
    pub fn add_pending_references(&self, refs: &[PendingReference]) -> Result<usize> {
        if refs.is_empty() {
            return Ok(0);
        }
        self.with_transaction(|| {
            let mut owner = self
                .conn
                .prepare("SELECT file_id FROM symbols WHERE id = ?1")?;
            let mut insert = self.conn.prepare(
                "INSERT INTO pending_references
                    (file_id, source_id, target_name, target_path, relation_type, line, count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for p in refs {
                let source_file: Option<i64> = owner
                    .query_row(params![p.source_id], |r| r.get(0))
                    .optional()?;
                if source_file != Some(p.file_id) {
                    return Err(GraphError::ConstraintViolation(format!(
                        "symbol {} is not owned by file {}",
                        p.source_id, p.file_id
                    )));
                }
                insert.execute(params![
                    p.file_id,
                    p.source_id,
                    p.target_name,
                    p.target_path,
                    p.relation_type.as_str(),
                    p.line,
                    p.count.max(1),
                ])?;
            }
            Ok(refs.len())
        })
    }

    /// Every stored pending reference with its row id, oldest first.
    pub fn pending_references(&self) -> Result<Vec<(i64, PendingReference)>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, file_id, source_id, target_name, target_path, relation_type, line, count
             FROM pending_references ORDER BY id",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get(0)?,
                PendingReference {
                    file_id: r.get(1)?,
                    source_id: r.get(2)?,
                    target_name: r.get(3)?,
                    target_path: r.get(4)?,
                    relation_type: RelationType::parse_lenient(&r.get::<_, String>(5)?),
                    line: r.get(6)?,
                    count: r.get(7)?,
                },
            ))
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn clear_pending_references(&self, ids: &[i64]) -> Result<usize> {
        let mut removed = 0;
        for chunk in ids.chunks(IN_CHUNK) {
            let sql = format!(
                "DELETE FROM pending_references WHERE id IN ({})",
                placeholders(1, chunk.len())
            );
            removed += self
                .conn
                .execute(&sql, rusqlite::params_from_iter(chunk.iter()))?;
        }
        Ok(removed)
    }

    pub fn pending_reference_count(&self) -> Result<i64> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM pending_references", [], |r| r.get(0))?;
        Ok(n)
    }

    // -----------------------------------------------------------------------
    // Symbol reads
    // -----------------------------------------------------------------------

    pub fn get_symbols_by_file(&self, file_id: i64) -> Result<Vec<SymbolRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SYMBOL_COLUMNS} FROM symbols s JOIN files f ON f.id = s.file_id
             WHERE s.file_id = ?1
             ORDER BY s.line_start, s.column_start, s.name"
        ))?;
        let rows = stmt.query_map(params![file_id], symbol_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn get_symbol(&self, id: i64) -> Result<Option<SymbolRecord>> {
        let r = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SYMBOL_COLUMNS} FROM symbols s JOIN files f ON f.id = s.file_id
                     WHERE s.id = ?1"
                ),
                params![id],
                symbol_from_row,
            )
            .optional()?;
        Ok(r)
    }

    /// Symbols named `name` (or whose qualified name is `name`), optionally
    /// restricted to one file. Ordered by resolution preference.
    pub fn find_symbols(&self, name: &str, file_path: Option<&str>) -> Result<Vec<SymbolRecord>> {
        let mut sql = format!(
            "SELECT {SYMBOL_COLUMNS} FROM symbols s JOIN files f ON f.id = s.file_id
             WHERE (s.name = ?1 OR s.qualified_name = ?1)"
        );
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(name.to_string())];
        if let Some(path) = file_path {
            sql.push_str(" AND f.path = ?2");
            param_values.push(Box::new(path.to_string()));
        }
        sql.push_str(" ORDER BY f.path, s.line_start, s.id");

        let params_refs: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|b| b.as_ref()).collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_refs.as_slice(), symbol_from_row)?;
        let mut out = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        out.sort_by_key(|s| s.kind.resolution_rank());
        Ok(out)
    }

    /// Name to candidate symbol ids across the store, function/method first.
    pub fn symbol_name_index(&self) -> Result<HashMap<String, Vec<(i64, i64, SymbolKind)>>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.file_id, s.name, s.qualified_name, s.kind
             FROM symbols s JOIN files f ON f.id = s.file_id
             ORDER BY f.path, s.line_start, s.id",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
            ))
        })?;
        let mut index: HashMap<String, Vec<(i64, i64, SymbolKind)>> = HashMap::new();
        for r in rows {
            let (id, file_id, name, qualified, kind) = r?;
            let kind = SymbolKind::parse_lenient(&kind);
            if qualified != name && !qualified.is_empty() {
                index.entry(qualified).or_default().push((id, file_id, kind));
            }
            index.entry(name).or_default().push((id, file_id, kind));
        }
        for candidates in index.values_mut() {
            candidates.sort_by_key(|(_, _, kind)| kind.resolution_rank());
        }
        Ok(index)
    }

    pub fn symbol_count(&self) -> Result<i64> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM symbols", [], |r| r.get(0))?;
        Ok(n)
    }

    pub fn relation_count(&self) -> Result<i64> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM relations", [], |r| r.get(0))?;
        Ok(n)
    }

    /// Relations whose source or target symbol no longer exists. Always zero
    /// while foreign keys are enforced.
    pub fn dangling_relation_count(&self) -> Result<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM relations r
             WHERE NOT EXISTS (SELECT 1 FROM symbols s WHERE s.id = r.source_id)
                OR NOT EXISTS (SELECT 1 FROM symbols s WHERE s.id = r.target_id)",
            [],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    pub fn symbol_kind_counts(&self, file_id: i64) -> Result<BTreeMap<String, i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, COUNT(*) FROM symbols WHERE file_id = ?1 GROUP BY kind ORDER BY kind",
        )?;
        let rows = stmt.query_map(params![file_id], |r| Ok((r.get(0)?, r.get(1)?)))?;
        rows.collect::<std::result::Result<BTreeMap<_, _>, _>>()
            .map_err(Into::into)
    }

    /// Glob search over symbol names. Returns the total match count and the
    /// first `limit` matches ordered by name, path and line.
    pub fn search_symbols(
        &self,
        pattern: &str,
        kind: Option<SymbolKind>,
        module: Option<&str>,
        file_path: Option<&str>,
        limit: usize,
    ) -> Result<(i64, Vec<SymbolRecord>)> {
        let mut filter = String::from(" WHERE s.name LIKE ?1 ESCAPE '\\'");
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(glob_to_like(pattern))];
        let mut idx = 2;

        if let Some(kind) = kind {
            filter.push_str(&format!(" AND s.kind = ?{idx}"));
            param_values.push(Box::new(kind.as_str().to_string()));
            idx += 1;
        }
        if let Some(module) = module {
            filter.push_str(&format!(" AND f.module = ?{idx}"));
            param_values.push(Box::new(module.to_string()));
            idx += 1;
        }
        if let Some(path) = file_path {
            filter.push_str(&format!(" AND f.path LIKE ?{idx} ESCAPE '\\'"));
            param_values.push(Box::new(format!("%{}%", glob_to_like(path))));
        }

        let params_refs: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|b| b.as_ref()).collect();

        let total: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM symbols s JOIN files f ON f.id = s.file_id{filter}"),
            params_refs.as_slice(),
            |r| r.get(0),
        )?;

        let sql = format!(
            "SELECT {SYMBOL_COLUMNS} FROM symbols s JOIN files f ON f.id = s.file_id{filter}
             ORDER BY s.name, f.path, s.line_start, s.id LIMIT {limit}"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_refs.as_slice(), symbol_from_row)?;
        let results = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok((total, results))
    }

    // -----------------------------------------------------------------------
    // Edge reads for traversal
    // -----------------------------------------------------------------------

    /// All edges leaving (or entering) the frontier `ids`, restricted to
    /// `types` when non-empty.
    pub fn symbol_edges(
        &self,
        ids: &[i64],
        direction: Direction,
        types: &[RelationType],
    ) -> Result<Vec<SymbolEdge>> {
        let (anchor, other) = match direction {
            Direction::Incoming => ("r.target_id", "r.source_id"),
            Direction::Outgoing => ("r.source_id", "r.target_id"),
        };
        let mut out = Vec::new();
        for chunk in ids.chunks(IN_CHUNK) {
            let mut sql = format!(
                "SELECT {anchor}, r.relation_type, r.location_line, r.count, r.is_direct, {SYMBOL_COLUMNS}
                 FROM relations r
                 JOIN symbols s ON s.id = {other}
                 JOIN files f ON f.id = s.file_id
                 WHERE {anchor} IN ({})",
                placeholders(1, chunk.len())
            );
            let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = chunk
                .iter()
                .map(|id| Box::new(*id) as Box<dyn rusqlite::types::ToSql>)
                .collect();
            if !types.is_empty() {
                sql.push_str(&format!(
                    " AND r.relation_type IN ({})",
                    placeholders(chunk.len() + 1, types.len())
                ));
                for t in types {
                    param_values.push(Box::new(t.as_str().to_string()));
                }
            }
            let params_refs: Vec<&dyn rusqlite::types::ToSql> =
                param_values.iter().map(|b| b.as_ref()).collect();
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_refs.as_slice(), |row| {
                Ok(SymbolEdge {
                    from: row.get(0)?,
                    relation_type: RelationType::parse_lenient(&row.get::<_, String>(1)?),
                    line: row.get(2)?,
                    count: row.get(3)?,
                    is_direct: row.get(4)?,
                    symbol: symbol_from_row_at(row, 5)?,
                })
            })?;
            for r in rows {
                out.push(r?);
            }
        }
        Ok(out)
    }

    /// Symbol edges from other files into the files `file_ids`.
    pub fn cross_file_dependents(&self, file_ids: &[i64]) -> Result<Vec<CrossFileEdge>> {
        let mut out = Vec::new();
        for chunk in file_ids.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT DISTINCT t.file_id, s.file_id, s.name
                 FROM relations r
                 JOIN symbols s ON s.id = r.source_id
                 JOIN symbols t ON t.id = r.target_id
                 WHERE t.file_id IN ({}) AND s.file_id != t.file_id
                 ORDER BY t.file_id, s.file_id, s.name",
                placeholders(1, chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), |row| {
                Ok(CrossFileEdge {
                    target_file_id: row.get(0)?,
                    source_file_id: row.get(1)?,
                    source_symbol: row.get(2)?,
                })
            })?;
            for r in rows {
                out.push(r?);
            }
        }
        Ok(out)
    }

    /// Distinct symbols in other files that reference any symbol of `file_id`.
    pub fn external_caller_count(&self, file_id: i64) -> Result<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(DISTINCT r.source_id)
             FROM relations r
             JOIN symbols s ON s.id = r.source_id
             JOIN symbols t ON t.id = r.target_id
             WHERE t.file_id = ?1 AND s.file_id != ?1",
            params![file_id],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    /// Outgoing or incoming symbol-level dependencies of a whole file,
    /// summarised as `(other file path, other symbol name, relation type)`.
    pub fn file_symbol_dependencies(
        &self,
        file_id: i64,
        direction: Direction,
        types: &[RelationType],
    ) -> Result<Vec<(String, String, RelationType)>> {
        let ids: Vec<i64> = self
            .get_symbols_by_file(file_id)?
            .into_iter()
            .map(|s| s.id)
            .collect();
        let mut out: Vec<(String, String, RelationType)> = self
            .symbol_edges(&ids, direction, types)?
            .into_iter()
            .filter(|e| e.symbol.file_id != file_id)
            .map(|e| (e.symbol.file_path, e.symbol.name, e.relation_type))
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }
}
