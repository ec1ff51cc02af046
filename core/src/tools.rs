use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use rmcp::schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::ResolvedConfig;
use crate::db::{query_signature, Database, DefectFilter, DefectRecord, Direction, FileRecord};
use crate::error::{GraphError, Result};
use crate::graph::{GraphEngine, TraversalLimits};
use crate::model::{RelationType, Severity, SymbolKind};
use crate::risk::{RiskEngine, RiskPolicy};

// ---------------------------------------------------------------------------
// Parameter structs. Doc comments become descriptions in the MCP schema.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FileContextParams {
    /// Repository-relative file path
    pub file_path: String,
    /// Include owned symbols (default true)
    pub include_symbols: Option<bool>,
    /// Include include/call dependencies in both directions (default true)
    pub include_dependencies: Option<bool>,
    /// Include defects from the last 365 days (default true)
    pub include_history: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SymbolTraversalParams {
    /// Symbol name (plain or qualified)
    pub symbol_name: String,
    /// Disambiguating file path
    pub file_path: Option<String>,
    /// Levels to walk (callers default 3, callees default 2, at most 16)
    pub max_depth: Option<usize>,
    /// When false only direct neighbours are returned
    pub include_indirect: Option<bool>,
    /// Relation types to follow (default: calls)
    pub relation_types: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FileImpactParams {
    /// Repository-relative file path
    pub file_path: String,
    /// Levels to walk (default 3, at most 16)
    pub max_depth: Option<usize>,
    /// When false only direct dependents are returned
    pub include_transitive: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ErrorHistoryParams {
    pub file_path: Option<String>,
    pub symbol_name: Option<String>,
    pub module: Option<String>,
    pub error_type: Option<String>,
    /// Minimum severity: critical, high, medium, low or info
    pub severity: Option<String>,
    /// Trailing window in days (default 180)
    pub days: Option<i64>,
    /// Maximum records (default 20)
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SearchSymbolsParams {
    /// Name pattern; `*` and `?` are wildcards
    pub query: String,
    /// Symbol kind filter (function, struct, method, ...)
    pub kind: Option<String>,
    pub module: Option<String>,
    pub file_path: Option<String>,
    /// Maximum results (default 50)
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FileMetricsParams {
    pub file_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ModuleSummaryParams {
    pub module: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RiskAssessmentParams {
    /// Files touched by the change
    pub files: Vec<String>,
    /// Lines changed per file path
    pub lines_changed: Option<BTreeMap<String, i64>>,
    /// Attach review recommendations (default true)
    pub include_recommendations: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PatternsParams {
    pub file_path: Option<String>,
    pub module: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DecisionsParams {
    pub module: Option<String>,
    /// accepted, proposed, deprecated, superseded
    pub status: Option<String>,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    GetFileContext,
    GetSymbolCallers,
    GetSymbolCallees,
    GetFileImpact,
    GetErrorHistory,
    SearchSymbols,
    GetFileMetrics,
    GetModuleSummary,
    GetRiskAssessment,
    GetPatterns,
    GetArchitectureDecisions,
}

impl Operation {
    pub const ALL: &'static [(Operation, &'static str)] = &[
        (Operation::GetFileContext, "get_file_context"),
        (Operation::GetSymbolCallers, "get_symbol_callers"),
        (Operation::GetSymbolCallees, "get_symbol_callees"),
        (Operation::GetFileImpact, "get_file_impact"),
        (Operation::GetErrorHistory, "get_error_history"),
        (Operation::SearchSymbols, "search_symbols"),
        (Operation::GetFileMetrics, "get_file_metrics"),
        (Operation::GetModuleSummary, "get_module_summary"),
        (Operation::GetRiskAssessment, "get_risk_assessment"),
        (Operation::GetPatterns, "get_patterns"),
        (Operation::GetArchitectureDecisions, "get_architecture_decisions"),
    ];

    pub fn lookup(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .find(|(_, n)| *n == name.trim())
            .map(|(op, _)| *op)
    }

    pub fn as_str(self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(op, _)| *op == self)
            .map(|(_, n)| *n)
            .unwrap_or("unknown")
    }

    /// Results computed from specific files go through the query cache.
    fn cacheable(self) -> bool {
        matches!(
            self,
            Operation::GetFileContext
                | Operation::GetSymbolCallers
                | Operation::GetSymbolCallees
                | Operation::GetFileImpact
                | Operation::GetFileMetrics
                | Operation::GetRiskAssessment
        )
    }
}

/// Limits and windows the query surface applies.
#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub traversal: TraversalLimits,
    pub risk: RiskPolicy,
    pub cache_ttl_secs: i64,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            traversal: TraversalLimits::default(),
            risk: RiskPolicy::default(),
            cache_ttl_secs: 3600,
        }
    }
}

impl From<&ResolvedConfig> for QuerySettings {
    fn from(cfg: &ResolvedConfig) -> Self {
        Self {
            traversal: cfg.traversal,
            risk: cfg.risk.clone(),
            cache_ttl_secs: cfg.cache_ttl_secs,
        }
    }
}

/// An operation's result plus the paths it was computed from.
struct Answer {
    value: Value,
    cited: BTreeSet<String>,
}

impl Answer {
    fn new(value: Value) -> Self {
        Self {
            value,
            cited: BTreeSet::new(),
        }
    }

    fn citing<I: IntoIterator<Item = String>>(mut self, paths: I) -> Self {
        self.cited.extend(paths);
        self
    }
}

fn parse_args<T: DeserializeOwned>(op: Operation, args: Value) -> Result<T> {
    serde_json::from_value(args)
        .map_err(|e| GraphError::InvalidArgument(format!("bad arguments for {}: {e}", op.as_str())))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

// ---------------------------------------------------------------------------
// QueryService
// ---------------------------------------------------------------------------

/// The read-side query surface: one operation name plus JSON arguments in,
/// one JSON result or one `{"error": {...}}` object out.
pub struct QueryService<'a> {
    db: &'a Database,
    settings: QuerySettings,
    clock: Option<DateTime<Utc>>,
}

impl<'a> QueryService<'a> {
    pub fn new(db: &'a Database, settings: QuerySettings) -> Self {
        Self {
            db,
            settings,
            clock: None,
        }
    }

    /// Pin "now" for history windows.
    pub fn with_clock(mut self, now: DateTime<Utc>) -> Self {
        self.clock = Some(now);
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or_else(Utc::now)
    }

    pub fn operations() -> impl Iterator<Item = &'static str> {
        Operation::ALL.iter().map(|(_, n)| *n)
    }

    /// Never fails: errors become the structured `error` object.
    pub fn dispatch(&self, operation: &str, args: Value) -> Value {
        match self.execute(operation, args) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(operation, kind = e.kind(), error = %e, "query failed");
                json!({ "error": { "kind": e.kind(), "message": e.to_string() } })
            }
        }
    }

    pub fn execute(&self, operation: &str, args: Value) -> Result<Value> {
        let op = Operation::lookup(operation)
            .ok_or_else(|| GraphError::InvalidArgument(format!("unknown operation '{operation}'")))?;
        let args = if args.is_null() { json!({}) } else { args };

        let signature = query_signature(op.as_str(), &args);
        if op.cacheable() {
            if let Some(hit) = self.db.cache_get(&signature)? {
                tracing::debug!(operation, hits = hit.hit_count, "query cache hit");
                return Ok(hit.value);
            }
        }

        let answer = self.run(op, args)?;
        if op.cacheable() {
            let mut ids = Vec::with_capacity(answer.cited.len());
            for path in &answer.cited {
                if let Some(f) = self.db.get_file(path)? {
                    ids.push(f.id);
                }
            }
            self.db
                .cache_put(&signature, op.as_str(), &answer.value, &ids, self.settings.cache_ttl_secs)?;
        }
        Ok(answer.value)
    }

    fn run(&self, op: Operation, args: Value) -> Result<Answer> {
        match op {
            Operation::GetFileContext => self.file_context(parse_args(op, args)?),
            Operation::GetSymbolCallers => self.traversal(parse_args(op, args)?, Direction::Incoming),
            Operation::GetSymbolCallees => self.traversal(parse_args(op, args)?, Direction::Outgoing),
            Operation::GetFileImpact => self.file_impact(parse_args(op, args)?),
            Operation::GetErrorHistory => self.error_history(parse_args(op, args)?),
            Operation::SearchSymbols => self.search_symbols(parse_args(op, args)?),
            Operation::GetFileMetrics => self.file_metrics(parse_args(op, args)?),
            Operation::GetModuleSummary => self.module_summary(parse_args(op, args)?),
            Operation::GetRiskAssessment => self.risk_assessment(parse_args(op, args)?),
            Operation::GetPatterns => self.patterns(parse_args(op, args)?),
            Operation::GetArchitectureDecisions => self.decisions(parse_args(op, args)?),
        }
    }

    // -----------------------------------------------------------------------
    // File context
    // -----------------------------------------------------------------------

    fn file_context(&self, p: FileContextParams) -> Result<Answer> {
        self.db.snapshot(|| {
            let file = self.db.require_file(&p.file_path)?;
            let mut cited = vec![file.path.clone()];
            let mut out = serde_json::Map::new();
            out.insert("file".into(), file_summary(&file));

            if p.include_symbols.unwrap_or(true) {
                let symbols: Vec<Value> = self
                    .db
                    .get_symbols_by_file(file.id)?
                    .iter()
                    .map(|s| {
                        json!({
                            "name": s.name,
                            "kind": s.kind,
                            "line_start": s.line_start,
                            "line_end": s.line_end,
                            "signature": s.signature,
                            "complexity": s.complexity,
                            "has_doc": s.has_doc,
                        })
                    })
                    .collect();
                out.insert("symbols".into(), Value::Array(symbols));
            }

            if p.include_dependencies.unwrap_or(true) {
                let includes: Vec<String> = self
                    .db
                    .get_file_relations_out(file.id)?
                    .into_iter()
                    .map(|e| e.path)
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                let included_by: Vec<String> = self
                    .db
                    .get_file_relations_in(file.id)?
                    .into_iter()
                    .map(|e| e.path)
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                let edge = |(path, name, _): &(String, String, RelationType)| {
                    json!({ "file": path, "symbol": name })
                };
                let calls_to = self
                    .db
                    .file_symbol_dependencies(file.id, Direction::Outgoing, &[RelationType::Calls])?;
                let called_by = self
                    .db
                    .file_symbol_dependencies(file.id, Direction::Incoming, &[RelationType::Calls])?;
                cited.extend(includes.iter().cloned());
                cited.extend(included_by.iter().cloned());
                cited.extend(calls_to.iter().map(|(path, _, _)| path.clone()));
                cited.extend(called_by.iter().map(|(path, _, _)| path.clone()));
                out.insert(
                    "dependencies".into(),
                    json!({
                        "includes": includes,
                        "included_by": included_by,
                        "calls_to": calls_to.iter().map(edge).collect::<Vec<_>>(),
                        "called_by": called_by.iter().map(edge).collect::<Vec<_>>(),
                    }),
                );
            }

            if p.include_history.unwrap_or(true) {
                let defects = self.db.query_defects(&DefectFilter {
                    file_path: Some(file.path.clone()),
                    since: Some(self.now() - Duration::days(365)),
                    limit: Some(10),
                    ..DefectFilter::default()
                })?;
                out.insert("error_history".into(), to_json(&defects)?);
            }

            out.insert("patterns".into(), to_json(&self.db.patterns_for_file(&file)?)?);
            out.insert(
                "architecture_decisions".into(),
                to_json(&self.db.decisions_for_file(&file)?)?,
            );
            Ok(Answer::new(Value::Object(out)).citing(cited))
        })
    }

    // -----------------------------------------------------------------------
    // Traversals
    // -----------------------------------------------------------------------

    fn traversal(&self, p: SymbolTraversalParams, direction: Direction) -> Result<Answer> {
        let types = p
            .relation_types
            .unwrap_or_default()
            .iter()
            .map(|t| t.parse::<RelationType>())
            .collect::<Result<Vec<_>>>()?;
        let default_depth = match direction {
            Direction::Incoming => 3,
            Direction::Outgoing => 2,
        };
        let depth = if p.include_indirect == Some(false) {
            1.min(p.max_depth.unwrap_or(1))
        } else {
            p.max_depth.unwrap_or(default_depth)
        };

        let engine = GraphEngine::new(self.db, self.settings.traversal);
        let result = match direction {
            Direction::Incoming => engine.callers(&p.symbol_name, p.file_path.as_deref(), Some(depth), &types)?,
            Direction::Outgoing => engine.callees(&p.symbol_name, p.file_path.as_deref(), Some(depth), &types)?,
        };
        let mut cited = result.summary.files_affected.clone();
        cited.push(result.symbol.file.clone());
        Ok(Answer::new(to_json(&result)?).citing(cited))
    }

    fn file_impact(&self, p: FileImpactParams) -> Result<Answer> {
        let depth = if p.include_transitive == Some(false) {
            1.min(p.max_depth.unwrap_or(1))
        } else {
            p.max_depth.unwrap_or(3)
        };
        let impact = GraphEngine::new(self.db, self.settings.traversal)
            .file_impact(&p.file_path, Some(depth))?;
        let mut cited = impact.summary.files.clone();
        cited.push(impact.file_path.clone());
        Ok(Answer::new(to_json(&impact)?).citing(cited))
    }

    // -----------------------------------------------------------------------
    // History and search
    // -----------------------------------------------------------------------

    fn error_history(&self, p: ErrorHistoryParams) -> Result<Answer> {
        let min_severity = p.severity.as_deref().map(str::parse::<Severity>).transpose()?;
        let days = p.days.unwrap_or(180);
        if days <= 0 {
            return Err(GraphError::InvalidArgument("days must be positive".into()));
        }
        let limit = p.limit.unwrap_or(20);
        if limit == 0 {
            return Err(GraphError::InvalidArgument("limit must be at least 1".into()));
        }

        let base = DefectFilter {
            file_path: p.file_path,
            symbol_name: p.symbol_name,
            module: p.module,
            error_type: p.error_type,
            min_severity,
            since: Some(self.now() - Duration::days(days)),
            limit: None,
        };
        let all = self.db.query_defects(&base)?;
        let stats = defect_statistics(&all);
        let errors: Vec<&DefectRecord> = all.iter().take(limit).collect();
        Ok(Answer::new(json!({
            "errors": errors,
            "statistics": stats,
        })))
    }

    fn search_symbols(&self, p: SearchSymbolsParams) -> Result<Answer> {
        if p.query.trim().is_empty() {
            return Err(GraphError::InvalidArgument("query is empty".into()));
        }
        let kind = p.kind.as_deref().map(str::parse::<SymbolKind>).transpose()?;
        let limit = p.limit.unwrap_or(50);
        if limit == 0 {
            return Err(GraphError::InvalidArgument("limit must be at least 1".into()));
        }
        let (total, found) = self.db.search_symbols(
            p.query.trim(),
            kind,
            p.module.as_deref(),
            p.file_path.as_deref(),
            limit,
        )?;
        let results: Vec<Value> = found
            .iter()
            .map(|s| {
                json!({
                    "name": s.name,
                    "qualified_name": s.qualified_name,
                    "kind": s.kind,
                    "file": s.file_path,
                    "line": s.line_start,
                    "signature": s.signature,
                })
            })
            .collect();
        Ok(Answer::new(json!({
            "query": p.query.trim(),
            "returned": results.len(),
            "total": total,
            "results": results,
        })))
    }

    // -----------------------------------------------------------------------
    // Aggregate reporting
    // -----------------------------------------------------------------------

    fn file_metrics(&self, p: FileMetricsParams) -> Result<Answer> {
        self.db.snapshot(|| {
            let file = self.db.require_file(&p.file_path)?;
            let structure = self.db.symbol_kind_counts(file.id)?;
            let value = json!({
                "file": file.path,
                "size": {
                    "lines_total": file.lines_total,
                    "lines_code": file.lines_code,
                    "lines_comment": file.lines_comment,
                    "lines_blank": file.lines_blank,
                },
                "complexity": {
                    "sum": file.complexity_sum,
                    "avg": file.complexity_avg,
                    "max": file.complexity_max,
                    "delta": file.complexity_delta(),
                },
                "structure": structure,
                "quality": {
                    "documentation_score": file.documentation_score,
                    "has_tests": file.has_tests,
                    "test_file_path": file.test_file_path,
                    "technical_debt_score": file.technical_debt_score,
                },
                "activity": activity(&file),
            });
            Ok(Answer::new(value).citing([file.path.clone()]))
        })
    }

    fn module_summary(&self, p: ModuleSummaryParams) -> Result<Answer> {
        self.db.snapshot(|| {
            let stats = self
                .db
                .module_stats(&p.module)?
                .ok_or_else(|| GraphError::not_found("module", p.module.clone()))?;
            let errors_90d = self
                .db
                .query_defects(&DefectFilter {
                    module: Some(p.module.clone()),
                    since: Some(self.now() - Duration::days(90)),
                    ..DefectFilter::default()
                })?
                .len();
            let (depends_on, depended_by) = self.db.module_dependencies(&p.module)?;

            let test_coverage = if stats.files_with_tests == 0 {
                "none"
            } else if stats.files_with_tests >= stats.file_count {
                "full"
            } else {
                "partial"
            };
            let debt = if stats.complexity_avg > 15.0 || errors_90d > 5 {
                "high"
            } else if stats.complexity_avg > 10.0 || errors_90d > 2 {
                "medium"
            } else {
                "low"
            };
            let symbol_total: i64 = stats.symbol_counts.values().sum();

            Ok(Answer::new(json!({
                "module": stats.module,
                "file_count": stats.file_count,
                "symbol_count": symbol_total,
                "symbols_by_kind": stats.symbol_counts,
                "metrics": {
                    "lines_code": stats.lines_code,
                    "complexity_avg": stats.complexity_avg,
                    "complexity_max": stats.complexity_max,
                    "critical_files": stats.critical_files,
                    "commits_30d": stats.commits_30d,
                },
                "health": {
                    "errors_last_90d": errors_90d,
                    "test_coverage": test_coverage,
                    "technical_debt": debt,
                },
                "depends_on": depends_on,
                "depended_by": depended_by,
                "patterns": self.db.patterns_for_module(&p.module)?,
                "architecture_decisions": self.db.decisions_for_module(&p.module)?,
            })))
        })
    }

    fn risk_assessment(&self, p: RiskAssessmentParams) -> Result<Answer> {
        let engine = RiskEngine::new(self.db, self.settings.risk.clone());
        let assessment = engine.assess(
            &p.files,
            &p.lines_changed.unwrap_or_default(),
            self.now(),
            p.include_recommendations.unwrap_or(true),
        )?;
        let cited: Vec<String> = assessment.files.iter().map(|f| f.file.clone()).collect();
        Ok(Answer::new(to_json(&assessment)?).citing(cited))
    }

    // -----------------------------------------------------------------------
    // Knowledge tables
    // -----------------------------------------------------------------------

    fn patterns(&self, p: PatternsParams) -> Result<Answer> {
        let patterns = match (&p.file_path, &p.module) {
            (Some(path), _) => {
                let file = self.db.require_file(path)?;
                self.db.patterns_for_file(&file)?
            }
            (None, Some(module)) => self.db.patterns_for_module(module)?,
            (None, None) => self.db.list_patterns()?,
        };
        Ok(Answer::new(json!({
            "count": patterns.len(),
            "patterns": patterns,
        })))
    }

    fn decisions(&self, p: DecisionsParams) -> Result<Answer> {
        let mut decisions = self.db.list_decisions(p.status.as_deref())?;
        if let Some(module) = &p.module {
            decisions.retain(|d| d.affected_modules.iter().any(|m| m == module));
        }
        Ok(Answer::new(json!({
            "count": decisions.len(),
            "decisions": decisions,
        })))
    }
}

fn activity(file: &FileRecord) -> Value {
    json!({
        "commits_30d": file.commits_30d,
        "commits_90d": file.commits_90d,
        "commits_365d": file.commits_365d,
        "last_modified": file.last_modified,
    })
}

fn file_summary(file: &FileRecord) -> Value {
    json!({
        "path": file.path,
        "module": file.module,
        "layer": file.layer,
        "file_type": file.file_type,
        "language": file.language,
        "is_critical": file.is_critical,
        "criticality_reason": file.criticality_reason,
        "security_sensitive": file.security_sensitive,
        "metrics": {
            "lines_total": file.lines_total,
            "lines_code": file.lines_code,
            "complexity_avg": file.complexity_avg,
            "complexity_max": file.complexity_max,
            "documentation_score": file.documentation_score,
            "technical_debt_score": file.technical_debt_score,
        },
        "activity": activity(file),
        "has_tests": file.has_tests,
        "test_file_path": file.test_file_path,
        "indexed_at": file.indexed_at,
    })
}

fn defect_statistics(defects: &[DefectRecord]) -> Value {
    let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
    let mut by_severity: BTreeMap<&str, usize> = BTreeMap::new();
    for d in defects {
        *by_type.entry(d.error_type.as_str()).or_default() += 1;
        *by_severity.entry(d.severity.as_str()).or_default() += 1;
    }
    let regressions = defects.iter().filter(|d| d.is_regression).count();
    let regression_rate = if defects.is_empty() {
        0.0
    } else {
        regressions as f64 / defects.len() as f64
    };
    json!({
        "total_errors": defects.len(),
        "by_type": by_type,
        "by_severity": by_severity,
        "regression_rate": regression_rate,
    })
}
