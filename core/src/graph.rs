use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;

use crate::db::{Database, Direction, FileRecord, SymbolRecord};
use crate::error::{GraphError, Result};
use crate::model::{ImpactReason, RelationType, SymbolKind};

/// Deepest walk any caller may request.
pub const MAX_DEPTH_LIMIT: usize = 16;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TraversalLimits {
    /// Used when a query does not name a depth.
    pub max_depth: usize,
    /// Most entities kept per level before the level is truncated.
    pub frontier_cap: usize,
}

impl Default for TraversalLimits {
    fn default() -> Self {
        Self {
            max_depth: 3,
            frontier_cap: 500,
        }
    }
}

impl TraversalLimits {
    pub fn new(max_depth: usize, frontier_cap: usize) -> Result<Self> {
        check_depth(max_depth)?;
        if frontier_cap == 0 {
            return Err(GraphError::InvalidArgument(
                "frontier_cap must be at least 1".into(),
            ));
        }
        Ok(Self {
            max_depth,
            frontier_cap,
        })
    }
}

fn check_depth(depth: usize) -> Result<()> {
    if depth > MAX_DEPTH_LIMIT {
        return Err(GraphError::InvalidArgument(format!(
            "max_depth {depth} exceeds the limit of {MAX_DEPTH_LIMIT}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Bounded BFS
// ---------------------------------------------------------------------------

struct Walk<N> {
    /// `levels[k]` holds nodes first reached at depth `k + 1`.
    levels: Vec<Vec<N>>,
    truncated: bool,
}

/// Level-by-level walk from `start`. `expand` maps a frontier to the
/// `(id, node)` pairs one hop away. Every id is expanded at most once, so
/// cycles terminate after at most one visit per node. A level larger than
/// `frontier_cap` is cut to its canonical prefix and the walk is flagged.
fn bounded_bfs<N, E>(start: &[i64], max_depth: usize, frontier_cap: usize, mut expand: E) -> Result<Walk<N>>
where
    N: Ord,
    E: FnMut(&[i64]) -> Result<Vec<(i64, N)>>,
{
    let mut visited: HashSet<i64> = start.iter().copied().collect();
    let mut frontier: Vec<i64> = start.to_vec();
    let mut levels = Vec::new();
    let mut truncated = false;

    for _ in 0..max_depth {
        if frontier.is_empty() {
            break;
        }
        let mut reached: BTreeMap<i64, N> = BTreeMap::new();
        for (id, node) in expand(&frontier)? {
            if visited.contains(&id) {
                continue;
            }
            match reached.get(&id) {
                Some(existing) if *existing <= node => {}
                _ => {
                    reached.insert(id, node);
                }
            }
        }
        if reached.is_empty() {
            break;
        }
        visited.extend(reached.keys().copied());

        let mut level: Vec<(i64, N)> = reached.into_iter().collect();
        level.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        if level.len() > frontier_cap {
            level.truncate(frontier_cap);
            truncated = true;
        }
        frontier = level.iter().map(|(id, _)| *id).collect();
        levels.push(level.into_iter().map(|(_, n)| n).collect());
    }

    Ok(Walk { levels, truncated })
}

// ---------------------------------------------------------------------------
// Symbol traversal output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolRef {
    pub name: String,
    pub kind: SymbolKind,
    pub file: String,
    pub line: i64,
}

impl From<&SymbolRecord> for SymbolRef {
    fn from(s: &SymbolRecord) -> Self {
        Self {
            name: s.name.clone(),
            kind: s.kind,
            file: s.file_path.clone(),
            line: s.line_start,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraversalEntry {
    pub name: String,
    pub kind: SymbolKind,
    pub file: String,
    pub line: i64,
    pub relation_type: RelationType,
    pub is_critical: bool,
}

// Canonical order within a level: path, then name, then position.
impl Ord for TraversalEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.file
            .cmp(&other.file)
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.line.cmp(&other.line))
            .then_with(|| self.kind.cmp(&other.kind))
            .then_with(|| self.relation_type.cmp(&other.relation_type))
            .then_with(|| self.is_critical.cmp(&other.is_critical))
    }
}

impl PartialOrd for TraversalEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraversalLevel {
    pub depth: usize,
    pub entries: Vec<TraversalEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraversalSummary {
    pub total: usize,
    pub critical: usize,
    pub files_affected: Vec<String>,
    pub max_depth_reached: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Traversal {
    pub symbol: SymbolRef,
    pub levels: Vec<TraversalLevel>,
    pub summary: TraversalSummary,
    pub truncated: bool,
}

// ---------------------------------------------------------------------------
// File impact output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct FileNode {
    path: String,
    is_critical: bool,
    symbols: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImpactEntry {
    pub file: String,
    pub reason: ImpactReason,
    pub depth: usize,
    pub is_critical: bool,
    /// Symbols in `file` that reference the changed code.
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImpactSummary {
    pub total_files_impacted: usize,
    pub critical_files_impacted: usize,
    pub max_depth: usize,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileImpact {
    pub file_path: String,
    pub direct_impact: Vec<ImpactEntry>,
    pub transitive_impact: Vec<ImpactEntry>,
    pub include_impact: Vec<ImpactEntry>,
    pub summary: ImpactSummary,
    pub truncated: bool,
}

impl FileImpact {
    pub fn entries(&self) -> impl Iterator<Item = &ImpactEntry> {
        self.direct_impact
            .iter()
            .chain(&self.transitive_impact)
            .chain(&self.include_impact)
    }
}

// ---------------------------------------------------------------------------
// GraphEngine
// ---------------------------------------------------------------------------

/// Read-only walks over the symbol and file graphs. Each query runs inside
/// one read snapshot, so concurrent indexing never shows through half-way.
pub struct GraphEngine<'a> {
    db: &'a Database,
    limits: TraversalLimits,
}

impl<'a> GraphEngine<'a> {
    pub fn new(db: &'a Database, limits: TraversalLimits) -> Self {
        Self { db, limits }
    }

    pub fn limits(&self) -> TraversalLimits {
        self.limits
    }

    /// Symbols that reach `name` through incoming edges of `types`
    /// (calls when empty).
    pub fn callers(
        &self,
        name: &str,
        file: Option<&str>,
        max_depth: Option<usize>,
        types: &[RelationType],
    ) -> Result<Traversal> {
        self.symbol_walk(name, file, max_depth, types, Direction::Incoming)
    }

    pub fn callees(
        &self,
        name: &str,
        file: Option<&str>,
        max_depth: Option<usize>,
        types: &[RelationType],
    ) -> Result<Traversal> {
        self.symbol_walk(name, file, max_depth, types, Direction::Outgoing)
    }

    fn symbol_walk(
        &self,
        name: &str,
        file: Option<&str>,
        max_depth: Option<usize>,
        types: &[RelationType],
        direction: Direction,
    ) -> Result<Traversal> {
        let depth = max_depth.unwrap_or(self.limits.max_depth);
        check_depth(depth)?;
        let types: Vec<RelationType> = if types.is_empty() {
            vec![RelationType::Calls]
        } else {
            types.to_vec()
        };

        self.db.snapshot(|| {
            let root = self.resolve_symbol(name, file)?;
            let walk = bounded_bfs(&[root.id], depth, self.limits.frontier_cap, |frontier| {
                Ok(self
                    .db
                    .symbol_edges(frontier, direction, &types)?
                    .into_iter()
                    .map(|edge| {
                        let entry = TraversalEntry {
                            name: edge.symbol.name.clone(),
                            kind: edge.symbol.kind,
                            file: edge.symbol.file_path.clone(),
                            line: edge.symbol.line_start,
                            relation_type: edge.relation_type,
                            is_critical: edge.symbol.file_is_critical,
                        };
                        (edge.symbol.id, entry)
                    })
                    .collect())
            })?;

            let levels: Vec<TraversalLevel> = walk
                .levels
                .into_iter()
                .enumerate()
                .map(|(i, entries)| TraversalLevel {
                    depth: i + 1,
                    entries,
                })
                .collect();

            let all = || levels.iter().flat_map(|l| &l.entries);
            let files: BTreeSet<String> = all().map(|e| e.file.clone()).collect();
            let summary = TraversalSummary {
                total: all().count(),
                critical: all().filter(|e| e.is_critical).count(),
                files_affected: files.into_iter().collect(),
                max_depth_reached: levels.len(),
            };
            if walk.truncated {
                tracing::debug!(symbol = name, cap = self.limits.frontier_cap, "traversal truncated");
            }
            Ok(Traversal {
                symbol: SymbolRef::from(&root),
                levels,
                summary,
                truncated: walk.truncated,
            })
        })
    }

    /// Files that could be affected by a change to `path`, with provenance:
    /// cross-file symbol references (direct at depth 1, transitive beyond)
    /// and include/import edges, walked independently.
    pub fn file_impact(&self, path: &str, max_depth: Option<usize>) -> Result<FileImpact> {
        let depth = max_depth.unwrap_or(self.limits.max_depth);
        check_depth(depth)?;
        let cap = self.limits.frontier_cap;

        self.db.snapshot(|| {
            let file = self.db.require_file(path)?;

            let calls = bounded_bfs(&[file.id], depth, cap, |frontier| {
                let mut grouped: BTreeMap<i64, BTreeSet<String>> = BTreeMap::new();
                for edge in self.db.cross_file_dependents(frontier)? {
                    grouped
                        .entry(edge.source_file_id)
                        .or_default()
                        .insert(edge.source_symbol);
                }
                self.file_nodes(grouped)
            })?;

            let includes = bounded_bfs(&[file.id], depth, cap, |frontier| {
                let mut grouped: BTreeMap<i64, BTreeSet<String>> = BTreeMap::new();
                for (_, includer) in self.db.includers_of(frontier)? {
                    grouped.entry(includer).or_default();
                }
                self.file_nodes(grouped)
            })?;

            let mut direct_impact = Vec::new();
            let mut transitive_impact = Vec::new();
            for (i, level) in calls.levels.into_iter().enumerate() {
                let (reason, bucket) = if i == 0 {
                    (ImpactReason::DirectCall, &mut direct_impact)
                } else {
                    (ImpactReason::TransitiveCall, &mut transitive_impact)
                };
                bucket.extend(level.into_iter().map(|n| impact_entry(n, reason, i + 1)));
            }
            let include_impact: Vec<ImpactEntry> = includes
                .levels
                .into_iter()
                .enumerate()
                .flat_map(|(i, level)| {
                    level
                        .into_iter()
                        .map(move |n| impact_entry(n, ImpactReason::Include, i + 1))
                })
                .collect();

            let mut impact = FileImpact {
                file_path: file.path.clone(),
                direct_impact,
                transitive_impact,
                include_impact,
                summary: ImpactSummary {
                    total_files_impacted: 0,
                    critical_files_impacted: 0,
                    max_depth: 0,
                    files: Vec::new(),
                },
                truncated: calls.truncated || includes.truncated,
            };
            let mut critical = BTreeSet::new();
            let mut files = BTreeSet::new();
            let mut deepest = 0;
            for e in impact.entries() {
                files.insert(e.file.clone());
                if e.is_critical {
                    critical.insert(e.file.clone());
                }
                deepest = deepest.max(e.depth);
            }
            impact.summary = ImpactSummary {
                total_files_impacted: files.len(),
                critical_files_impacted: critical.len(),
                max_depth: deepest,
                files: files.into_iter().collect(),
            };
            Ok(impact)
        })
    }

    fn file_nodes(&self, grouped: BTreeMap<i64, BTreeSet<String>>) -> Result<Vec<(i64, FileNode)>> {
        let ids: Vec<i64> = grouped.keys().copied().collect();
        let records: BTreeMap<i64, FileRecord> = self
            .db
            .get_files_by_ids(&ids)?
            .into_iter()
            .map(|f| (f.id, f))
            .collect();
        Ok(grouped
            .into_iter()
            .filter_map(|(id, symbols)| {
                records.get(&id).map(|f| {
                    (
                        id,
                        FileNode {
                            path: f.path.clone(),
                            is_critical: f.is_critical,
                            symbols,
                        },
                    )
                })
            })
            .collect())
    }

    /// Best match for `name`, preferring functions and methods; `file`
    /// narrows the search to one path.
    pub fn resolve_symbol(&self, name: &str, file: Option<&str>) -> Result<SymbolRecord> {
        if name.trim().is_empty() {
            return Err(GraphError::InvalidArgument("symbol name is empty".into()));
        }
        self.db
            .find_symbols(name, file)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                let label = match file {
                    Some(f) => format!("{name} in {f}"),
                    None => name.to_string(),
                };
                GraphError::not_found("symbol", label)
            })
    }
}

fn impact_entry(node: FileNode, reason: ImpactReason, depth: usize) -> ImpactEntry {
    ImpactEntry {
        file: node.path,
        reason,
        depth,
        is_critical: node.is_critical,
        symbols: node.symbols.into_iter().collect(),
    }
}
