use globset::Glob;
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use super::{Database, FileRecord};
use crate::error::{GraphError, Result};
use crate::model::Severity;

/// A coding convention or known pitfall, scoped globally, to a module or to
/// files matching a glob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub name: String,
    pub category: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub file_pattern: Option<String>,
    pub title: String,
    pub description: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_scope() -> String {
    "global".to_string()
}

fn default_severity() -> Severity {
    Severity::Medium
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchitectureDecision {
    pub decision_id: String,
    #[serde(default = "default_status")]
    pub status: String,
    pub title: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub decision: String,
    #[serde(default)]
    pub consequences: String,
    #[serde(default)]
    pub affected_modules: Vec<String>,
    #[serde(default)]
    pub affected_files: Vec<String>,
    #[serde(default)]
    pub date_decided: Option<String>,
    #[serde(default)]
    pub decided_by: Option<String>,
}

fn default_status() -> String {
    "accepted".to_string()
}

fn glob_matches(pattern: &str, path: &str) -> bool {
    match Glob::new(pattern) {
        Ok(g) => g.compile_matcher().is_match(path),
        Err(e) => {
            tracing::debug!(pattern, error = %e, "ignoring malformed glob");
            false
        }
    }
}

impl Pattern {
    pub fn applies_to(&self, file: &FileRecord) -> bool {
        if !self.is_active {
            return false;
        }
        match self.scope.as_str() {
            "global" => true,
            "module" => self.module.as_deref() == Some(file.module.as_str()),
            _ => {
                self.module.as_deref() == Some(file.module.as_str())
                    || self
                        .file_pattern
                        .as_deref()
                        .is_some_and(|p| glob_matches(p, &file.path))
            }
        }
    }
}

impl ArchitectureDecision {
    pub fn applies_to(&self, file: &FileRecord) -> bool {
        self.status == "accepted"
            && (self.affected_modules.iter().any(|m| m == &file.module)
                || self.affected_files.iter().any(|p| glob_matches(p, &file.path)))
    }
}

fn pattern_from_row(row: &Row<'_>) -> rusqlite::Result<Pattern> {
    Ok(Pattern {
        name: row.get(0)?,
        category: row.get(1)?,
        scope: row.get(2)?,
        module: row.get(3)?,
        file_pattern: row.get(4)?,
        title: row.get(5)?,
        description: row.get(6)?,
        severity: Severity::parse_lenient(&row.get::<_, String>(7)?),
        is_active: row.get(8)?,
    })
}

impl Database {
    // -----------------------------------------------------------------------
    // Patterns
    // -----------------------------------------------------------------------

    pub fn upsert_pattern(&self, p: &Pattern) -> Result<()> {
        if let Some(glob) = &p.file_pattern {
            Glob::new(glob).map_err(|e| GraphError::InvalidArgument(format!("bad file_pattern: {e}")))?;
        }
        self.conn.execute(
            "INSERT INTO patterns (name, category, scope, module, file_pattern, title, description,
                                   severity, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(name) DO UPDATE SET
                category     = excluded.category,
                scope        = excluded.scope,
                module       = excluded.module,
                file_pattern = excluded.file_pattern,
                title        = excluded.title,
                description  = excluded.description,
                severity     = excluded.severity,
                is_active    = excluded.is_active",
            params![
                p.name,
                p.category,
                p.scope,
                p.module,
                p.file_pattern,
                p.title,
                p.description,
                p.severity.as_str(),
                p.is_active
            ],
        )?;
        Ok(())
    }

    pub fn list_patterns(&self) -> Result<Vec<Pattern>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, category, scope, module, file_pattern, title, description, severity, is_active
             FROM patterns ORDER BY category, name",
        )?;
        let rows = stmt.query_map([], pattern_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn patterns_for_file(&self, file: &FileRecord) -> Result<Vec<Pattern>> {
        Ok(self
            .list_patterns()?
            .into_iter()
            .filter(|p| p.applies_to(file))
            .collect())
    }

    pub fn patterns_for_module(&self, module: &str) -> Result<Vec<Pattern>> {
        Ok(self
            .list_patterns()?
            .into_iter()
            .filter(|p| p.is_active && (p.scope == "global" || p.module.as_deref() == Some(module)))
            .collect())
    }

    // -----------------------------------------------------------------------
    // Architecture decisions
    // -----------------------------------------------------------------------

    pub fn upsert_decision(&self, adr: &ArchitectureDecision) -> Result<()> {
        let modules = serde_json::to_string(&adr.affected_modules)?;
        let files = serde_json::to_string(&adr.affected_files)?;
        self.conn.execute(
            "INSERT INTO architecture_decisions (decision_id, status, title, context, decision,
                                                 consequences, affected_modules, affected_files,
                                                 date_decided, decided_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(decision_id) DO UPDATE SET
                status           = excluded.status,
                title            = excluded.title,
                context          = excluded.context,
                decision         = excluded.decision,
                consequences     = excluded.consequences,
                affected_modules = excluded.affected_modules,
                affected_files   = excluded.affected_files,
                date_decided     = excluded.date_decided,
                decided_by       = excluded.decided_by",
            params![
                adr.decision_id,
                adr.status,
                adr.title,
                adr.context,
                adr.decision,
                adr.consequences,
                modules,
                files,
                adr.date_decided,
                adr.decided_by
            ],
        )?;
        Ok(())
    }

    pub fn list_decisions(&self, status: Option<&str>) -> Result<Vec<ArchitectureDecision>> {
        let mut stmt = self.conn.prepare(
            "SELECT decision_id, status, title, context, decision, consequences,
                    affected_modules, affected_files, date_decided, decided_by
             FROM architecture_decisions
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY decision_id",
        )?;
        let rows = stmt.query_map(params![status], |row| {
            Ok((
                ArchitectureDecision {
                    decision_id: row.get(0)?,
                    status: row.get(1)?,
                    title: row.get(2)?,
                    context: row.get(3)?,
                    decision: row.get(4)?,
                    consequences: row.get(5)?,
                    affected_modules: Vec::new(),
                    affected_files: Vec::new(),
                    date_decided: row.get(8)?,
                    decided_by: row.get(9)?,
                },
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;
        let mut out = Vec::new();
        for r in rows {
            let (mut adr, modules, files) = r?;
            adr.affected_modules = serde_json::from_str(&modules)?;
            adr.affected_files = serde_json::from_str(&files)?;
            out.push(adr);
        }
        Ok(out)
    }

    pub fn decisions_for_file(&self, file: &FileRecord) -> Result<Vec<ArchitectureDecision>> {
        Ok(self
            .list_decisions(Some("accepted"))?
            .into_iter()
            .filter(|adr| adr.applies_to(file))
            .collect())
    }

    pub fn decisions_for_module(&self, module: &str) -> Result<Vec<ArchitectureDecision>> {
        Ok(self
            .list_decisions(Some("accepted"))?
            .into_iter()
            .filter(|adr| adr.affected_modules.iter().any(|m| m == module))
            .collect())
    }
}
