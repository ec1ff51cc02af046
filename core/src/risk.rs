//! Change-risk scoring.
//!
//! A file's score starts at 100. Five factor families each deduct at most
//! their cap; inside a family only the most severe matching threshold
//! counts. [`score_file`] is a pure function of its inputs, and
//! [`RiskEngine`] only gathers those inputs from the store.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{Database, DefectFilter};
use crate::error::{GraphError, Result};
use crate::graph::{GraphEngine, TraversalLimits};
use crate::model::Severity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskPolicy {
    pub history_window_days: i64,
    /// A diff at least this many lines is "large" for the coverage family.
    pub large_diff_lines: i64,
    pub traversal: TraversalLimits,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            history_window_days: 90,
            large_diff_lines: 200,
            traversal: TraversalLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFamily {
    Criticality,
    History,
    Complexity,
    Coverage,
    GraphImpact,
}

impl RiskFamily {
    pub fn cap(self) -> i64 {
        match self {
            RiskFamily::Criticality => 30,
            RiskFamily::History => 25,
            RiskFamily::Complexity => 20,
            RiskFamily::Coverage => 15,
            RiskFamily::GraphImpact => 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Low,
    Medium,
    High,
}

impl Verdict {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            Verdict::Low
        } else if score >= 50.0 {
            Verdict::Medium
        } else {
            Verdict::High
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Low => "low",
            Verdict::Medium => "medium",
            Verdict::High => "high",
        }
    }
}

// ---------------------------------------------------------------------------
// Pure scoring
// ---------------------------------------------------------------------------

/// Raw per-file signals. Defect counts cover the policy's history window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FileRiskInputs {
    pub path: String,
    pub is_critical: bool,
    pub security_sensitive: bool,
    pub defects: i64,
    /// Defects of critical or high severity.
    pub severe_defects: i64,
    pub regressions: i64,
    pub complexity_max: i64,
    pub complexity_avg: f64,
    pub complexity_delta: i64,
    pub has_tests: bool,
    pub lines_changed: i64,
    pub external_callers: i64,
    pub impacted_files: i64,
    pub impacted_critical_files: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskFactor {
    pub family: RiskFamily,
    pub description: String,
    pub deduction: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRisk {
    pub file: String,
    pub score: i64,
    pub deductions: BTreeMap<RiskFamily, i64>,
    pub factors: Vec<RiskFactor>,
    #[serde(skip)]
    pub inputs: FileRiskInputs,
}

type Rule = fn(&FileRiskInputs, &RiskPolicy) -> Option<(i64, String)>;

const FAMILIES: [(RiskFamily, Rule); 5] = [
    (RiskFamily::Criticality, criticality),
    (RiskFamily::History, history),
    (RiskFamily::Complexity, complexity),
    (RiskFamily::Coverage, coverage),
    (RiskFamily::GraphImpact, graph_impact),
];

fn criticality(f: &FileRiskInputs, _: &RiskPolicy) -> Option<(i64, String)> {
    match (f.is_critical, f.security_sensitive) {
        (true, true) => Some((30, "critical and security-sensitive file".into())),
        (true, false) => Some((25, "critical file".into())),
        (false, true) => Some((20, "security-sensitive file".into())),
        (false, false) => None,
    }
}

fn history(f: &FileRiskInputs, p: &RiskPolicy) -> Option<(i64, String)> {
    let window = p.history_window_days;
    if f.regressions > 0 {
        Some((25, format!("regression recorded in the last {window} days")))
    } else if f.defects >= 5 {
        Some((25, format!("5+ defects in the last {window} days")))
    } else if f.defects >= 3 {
        Some((20, format!("3+ defects in the last {window} days")))
    } else if f.severe_defects >= 1 {
        Some((15, format!("critical or high severity defect in the last {window} days")))
    } else if f.defects >= 1 {
        Some((10, format!("defect recorded in the last {window} days")))
    } else {
        None
    }
}

fn complexity(f: &FileRiskInputs, _: &RiskPolicy) -> Option<(i64, String)> {
    if f.complexity_max > 20 {
        Some((20, "maximum complexity above 20".into()))
    } else if f.complexity_delta > 10 {
        Some((15, "complexity grew by more than 10".into()))
    } else if f.complexity_max > 10 || f.complexity_avg > 10.0 {
        Some((10, "complexity above 10".into()))
    } else if f.complexity_delta > 5 {
        Some((5, "complexity grew by more than 5".into()))
    } else {
        None
    }
}

fn coverage(f: &FileRiskInputs, p: &RiskPolicy) -> Option<(i64, String)> {
    let large = p.large_diff_lines;
    if !f.has_tests && f.lines_changed >= large {
        Some((15, format!("no tests and {large}+ lines changed")))
    } else if !f.has_tests {
        Some((10, "no tests".into()))
    } else if f.lines_changed >= large.saturating_mul(2) {
        Some((5, format!("{}+ lines changed", large.saturating_mul(2))))
    } else {
        None
    }
}

fn graph_impact(f: &FileRiskInputs, _: &RiskPolicy) -> Option<(i64, String)> {
    if f.external_callers > 20 || f.impacted_files > 20 {
        Some((10, "more than 20 external callers or impacted files".into()))
    } else if f.external_callers > 10 || f.impacted_files > 10 {
        Some((5, "more than 10 external callers or impacted files".into()))
    } else if f.impacted_critical_files > 0 {
        Some((5, "change reaches a critical file".into()))
    } else {
        None
    }
}

pub fn score_file(inputs: &FileRiskInputs, policy: &RiskPolicy) -> FileRisk {
    let mut deductions = BTreeMap::new();
    let mut factors = Vec::new();
    for (family, rule) in FAMILIES {
        let Some((amount, description)) = rule(inputs, policy) else {
            continue;
        };
        let amount = amount.min(family.cap());
        deductions.insert(family, amount);
        factors.push(RiskFactor {
            family,
            description,
            deduction: amount,
        });
    }
    let total: i64 = deductions.values().sum();
    FileRisk {
        file: inputs.path.clone(),
        score: (100 - total).max(0),
        deductions,
        factors,
        inputs: inputs.clone(),
    }
}

// ---------------------------------------------------------------------------
// Multi-file assessment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregatedFactor {
    pub family: RiskFamily,
    pub description: String,
    pub deduction: i64,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAssessment {
    pub files: Vec<FileRisk>,
    pub score: f64,
    pub verdict: Verdict,
    pub factors: Vec<AggregatedFactor>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<String>,
}

/// Mean of the per-file scores plus the union of their factors.
pub fn combine(files: Vec<FileRisk>, include_recommendations: bool) -> RiskAssessment {
    let score = if files.is_empty() {
        100.0
    } else {
        let sum: i64 = files.iter().map(|f| f.score).sum();
        let mean = sum as f64 / files.len() as f64;
        (mean * 100.0).round() / 100.0
    };

    let mut union: BTreeMap<(RiskFamily, String), (i64, BTreeSet<String>)> = BTreeMap::new();
    for f in &files {
        for factor in &f.factors {
            let slot = union
                .entry((factor.family, factor.description.clone()))
                .or_insert((0, BTreeSet::new()));
            slot.0 = slot.0.max(factor.deduction);
            slot.1.insert(f.file.clone());
        }
    }
    let mut factors: Vec<AggregatedFactor> = union
        .into_iter()
        .map(|((family, description), (deduction, files))| AggregatedFactor {
            family,
            description,
            deduction,
            files: files.into_iter().collect(),
        })
        .collect();
    factors.sort_by(|a, b| {
        a.family
            .cmp(&b.family)
            .then(b.deduction.cmp(&a.deduction))
            .then_with(|| a.description.cmp(&b.description))
    });

    let recommendations = if include_recommendations {
        recommendations(&files, score)
    } else {
        Vec::new()
    };
    RiskAssessment {
        verdict: Verdict::from_score(score),
        score,
        files,
        factors,
        recommendations,
    }
}

fn recommendations(files: &[FileRisk], score: f64) -> Vec<String> {
    let mut out = Vec::new();
    if score < 50.0 {
        out.push("High risk change: require a senior reviewer and a staged rollout".to_string());
    }
    for f in files.iter().filter(|f| f.inputs.is_critical) {
        out.push(format!("{} is critical: get a review from its owner", f.file));
    }
    let with_history: Vec<&str> = files
        .iter()
        .filter(|f| f.deductions.contains_key(&RiskFamily::History))
        .map(|f| f.file.as_str())
        .collect();
    if !with_history.is_empty() {
        out.push(format!(
            "Recent defects in {}: check earlier root causes before merging",
            with_history.join(", ")
        ));
    }
    if files
        .iter()
        .any(|f| f.deductions.contains_key(&RiskFamily::Complexity))
    {
        out.push("High complexity: consider splitting the affected functions".to_string());
    }
    let untested: Vec<&str> = files
        .iter()
        .filter(|f| !f.inputs.has_tests)
        .map(|f| f.file.as_str())
        .collect();
    if !untested.is_empty() {
        out.push(format!("Add tests for {}", untested.join(", ")));
    }
    if files.len() > 10 {
        out.push(format!(
            "Large changeset ({} files): consider splitting it into smaller changes",
            files.len()
        ));
    }
    if out.is_empty() {
        out.push("Low risk change: standard review is sufficient".to_string());
    }
    out
}

// ---------------------------------------------------------------------------
// RiskEngine
// ---------------------------------------------------------------------------

pub struct RiskEngine<'a> {
    db: &'a Database,
    policy: RiskPolicy,
}

impl<'a> RiskEngine<'a> {
    pub fn new(db: &'a Database, policy: RiskPolicy) -> Self {
        Self { db, policy }
    }

    pub fn policy(&self) -> &RiskPolicy {
        &self.policy
    }

    /// Read the signals for one stored file. `now` anchors the history window.
    pub fn gather(&self, path: &str, lines_changed: i64, now: DateTime<Utc>) -> Result<FileRiskInputs> {
        self.db.snapshot(|| {
            let file = self.db.require_file(path)?;
            let defects = self.db.query_defects(&DefectFilter {
                file_path: Some(file.path.clone()),
                since: Some(now - Duration::days(self.policy.history_window_days)),
                ..DefectFilter::default()
            })?;
            let impact = GraphEngine::new(self.db, self.policy.traversal)
                .file_impact(&file.path, None)?;

            Ok(FileRiskInputs {
                path: file.path.clone(),
                is_critical: file.is_critical,
                security_sensitive: file.security_sensitive,
                defects: defects.len() as i64,
                severe_defects: defects
                    .iter()
                    .filter(|d| d.severity.rank() >= Severity::High.rank())
                    .count() as i64,
                regressions: defects.iter().filter(|d| d.is_regression).count() as i64,
                complexity_max: file.complexity_max,
                complexity_avg: file.complexity_avg,
                complexity_delta: file.complexity_delta(),
                has_tests: file.has_tests,
                lines_changed: lines_changed.max(0),
                external_callers: self.db.external_caller_count(file.id)?,
                impacted_files: impact.summary.total_files_impacted as i64,
                impacted_critical_files: impact.summary.critical_files_impacted as i64,
            })
        })
    }

    pub fn assess_file(&self, path: &str, lines_changed: i64, now: DateTime<Utc>) -> Result<FileRisk> {
        let inputs = self.gather(path, lines_changed, now)?;
        Ok(score_file(&inputs, &self.policy))
    }

    /// Score every file in `files` (duplicates collapse) and combine them.
    pub fn assess(
        &self,
        files: &[String],
        lines_changed: &BTreeMap<String, i64>,
        now: DateTime<Utc>,
        include_recommendations: bool,
    ) -> Result<RiskAssessment> {
        let unique: BTreeSet<&str> = files.iter().map(|f| f.trim()).filter(|f| !f.is_empty()).collect();
        if unique.is_empty() {
            return Err(GraphError::InvalidArgument(
                "risk assessment needs at least one file".into(),
            ));
        }
        let mut scored = Vec::with_capacity(unique.len());
        for path in unique {
            let changed = lines_changed.get(path).copied().unwrap_or(0);
            scored.push(self.assess_file(path, changed, now)?);
        }
        let assessment = combine(scored, include_recommendations);
        tracing::debug!(
            files = assessment.files.len(),
            score = assessment.score,
            verdict = assessment.verdict.as_str(),
            "risk assessment computed"
        );
        Ok(assessment)
    }
}
