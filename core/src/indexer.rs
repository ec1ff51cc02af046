use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::db::{
    validate_revision, CommitRecord, Database, FileAttrs, NewRelation, NewSymbol,
    PendingReference, RelationTarget,
};
use crate::error::{GraphError, Result};
use crate::extract::{Extraction, Extractor, LineCounts, Reference};
use crate::model::{IndexMode, RelationType, SymbolKind};

// ---------------------------------------------------------------------------
// Policy (resolved configuration)
// ---------------------------------------------------------------------------

/// Which paths are tracked and how they are classified.
#[derive(Debug, Clone)]
pub struct IndexPolicy {
    /// Empty means every extension is tracked.
    extensions: BTreeSet<String>,
    excludes: GlobSet,
    critical: GlobSet,
    critical_patterns: Vec<String>,
    security: GlobSet,
    max_file_size: u64,
    parallelism: usize,
}

impl Default for IndexPolicy {
    fn default() -> Self {
        Self {
            extensions: BTreeSet::new(),
            excludes: GlobSet::empty(),
            critical: GlobSet::empty(),
            critical_patterns: Vec::new(),
            security: GlobSet::empty(),
            max_file_size: 512 * 1024,
            parallelism: 4,
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        let glob = Glob::new(p)
            .map_err(|e| GraphError::InvalidArgument(format!("invalid glob '{p}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| GraphError::InvalidArgument(format!("invalid glob set: {e}")))
}

impl IndexPolicy {
    pub fn new(
        extensions: &[String],
        excludes: &[String],
        critical: &[String],
        security: &[String],
    ) -> Result<Self> {
        Ok(Self {
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            excludes: build_globset(excludes)?,
            critical: build_globset(critical)?,
            critical_patterns: critical.to_vec(),
            security: build_globset(security)?,
            ..Self::default()
        })
    }

    pub fn with_max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    pub fn with_parallelism(mut self, threads: usize) -> Self {
        self.parallelism = threads.max(1);
        self
    }

    pub fn is_excluded(&self, rel_path: &str) -> bool {
        self.excludes.is_match(rel_path)
    }

    /// A directory is pruned when anything directly under it would be excluded.
    fn excludes_dir(&self, rel_dir: &str) -> bool {
        !rel_dir.is_empty() && self.excludes.is_match(format!("{rel_dir}/__dir_probe__"))
    }

    pub fn is_tracked(&self, rel_path: &str) -> bool {
        if self.is_excluded(rel_path) {
            return false;
        }
        if self.extensions.is_empty() {
            return true;
        }
        Path::new(rel_path)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.contains(&e.to_ascii_lowercase()))
    }

    /// `(is_critical, reason, security_sensitive)`
    pub fn classify(&self, rel_path: &str) -> (bool, Option<String>, bool) {
        let reason = self
            .critical
            .matches(rel_path)
            .first()
            .and_then(|&i| self.critical_patterns.get(i))
            .map(|p| format!("matches critical path {p}"));
        (reason.is_some(), reason, self.security.is_match(rel_path))
    }
}

fn language_for(path: &str) -> String {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" | "hh" => "cpp",
        "rs" => "rust",
        "py" => "python",
        "go" => "go",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" => "javascript",
        other => other,
    }
    .to_string()
}

fn fingerprint(source: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source);
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Request / report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct IndexRequest {
    /// Revision the working tree is at after this pass.
    pub revision: String,
    /// Revision the change list was computed from; must match the stored checkpoint.
    pub base_revision: Option<String>,
    pub branch: Option<String>,
    pub merge_base: Option<String>,
    /// Repository-relative (or absolute, under the root) changed paths.
    pub changed_paths: Vec<String>,
    /// Walk the whole root instead of trusting `changed_paths`.
    pub full: bool,
    pub commits: Vec<CommitRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexFailure {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub mode: IndexMode,
    pub revision: String,
    pub files_indexed: usize,
    pub files_skipped: usize,
    pub files_deleted: usize,
    pub symbols_extracted: usize,
    pub relations_created: usize,
    pub relations_relinked: usize,
    pub unresolved_references: usize,
    pub failures: Vec<IndexFailure>,
    pub checkpoint_advanced: bool,
    pub duration_ms: i64,
}

impl IndexReport {
    fn new(mode: IndexMode, revision: &str) -> Self {
        Self {
            mode,
            revision: revision.to_string(),
            files_indexed: 0,
            files_skipped: 0,
            files_deleted: 0,
            symbols_extracted: 0,
            relations_created: 0,
            relations_relinked: 0,
            unresolved_references: 0,
            failures: Vec::new(),
            checkpoint_advanced: false,
            duration_ms: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Indexer
// ---------------------------------------------------------------------------

struct Pending {
    path: String,
    source: Vec<u8>,
    hash: String,
}

enum Candidate {
    Changed(Pending),
    Unchanged,
    Oversized,
}

type NameIndex = HashMap<String, Vec<(i64, i64, SymbolKind)>>;

pub struct Indexer<'a> {
    db: &'a Database,
    extractor: &'a dyn Extractor,
    policy: &'a IndexPolicy,
    root: PathBuf,
}

impl<'a> Indexer<'a> {
    pub fn new(
        db: &'a Database,
        extractor: &'a dyn Extractor,
        policy: &'a IndexPolicy,
        root: &Path,
    ) -> Self {
        Self {
            db,
            extractor,
            policy,
            root: root.to_path_buf(),
        }
    }

    /// Apply one change set. Per-file extraction failures are reported in
    /// the returned report and leave the checkpoint where it was, so the
    /// next run retries from the same base.
    pub fn run(&self, request: &IndexRequest, now: DateTime<Utc>) -> Result<IndexReport> {
        let started = Instant::now();
        validate_revision(&request.revision)?;
        let checkpoint = self.db.get_index_checkpoint()?;
        if let (Some(base), Some(cp)) = (&request.base_revision, &checkpoint) {
            validate_revision(base)?;
            if base != &cp.revision {
                return Err(GraphError::IntegrityError(format!(
                    "change list is based on {base} but the store is at {}",
                    cp.revision
                )));
            }
        }
        let mode = if request.full || checkpoint.is_none() {
            IndexMode::Full
        } else {
            IndexMode::Incremental
        };
        let mut report = IndexReport::new(mode, &request.revision);

        let targets = match mode {
            IndexMode::Full => self.full_targets()?,
            IndexMode::Incremental => self.changed_targets(&request.changed_paths)?,
        };
        tracing::info!(mode = %mode, targets = targets.len(), revision = %request.revision, "indexing pass started");

        if !request.commits.is_empty() {
            self.db.record_commits(&request.commits)?;
        }

        // Partition into deletions, unchanged files and files to extract.
        let mut deletions = Vec::new();
        let mut pending = Vec::new();
        for path in &targets {
            let abs = self.root.join(path);
            if !abs.is_file() || !self.policy.is_tracked(path) {
                deletions.push(path.clone());
                continue;
            }
            match self.read_candidate(path, &abs) {
                Ok(Candidate::Changed(p)) => pending.push(p),
                Ok(Candidate::Unchanged) => report.files_skipped += 1,
                // A stored file that grew past the cap must not keep its old graph.
                Ok(Candidate::Oversized) => {
                    if self.db.get_file_hash(path)?.is_some() {
                        deletions.push(path.clone());
                    } else {
                        report.files_skipped += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "failed to read file");
                    report.failures.push(IndexFailure {
                        path: path.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        for path in &deletions {
            if self.db.delete_file(path)? {
                tracing::debug!(path = %path, "removed deleted file");
                report.files_deleted += 1;
            }
        }

        let extracted = self.extract_all(&pending)?;

        // Symbols of files being replaced must never be used as targets.
        let mut index = self.db.symbol_name_index()?;
        let mut replaced = HashSet::new();
        for p in &pending {
            if let Some(f) = self.db.get_file(&p.path)? {
                replaced.insert(f.id);
            }
        }
        for candidates in index.values_mut() {
            candidates.retain(|(_, file_id, _)| !replaced.contains(file_id));
        }

        let mut committed: Vec<(i64, Extraction)> = Vec::new();
        for (item, result) in pending.iter().zip(extracted) {
            let extraction = match result {
                Ok(x) => x,
                Err(e) => {
                    tracing::warn!(path = %item.path, error = %e, "extraction failed");
                    report.failures.push(IndexFailure {
                        path: item.path.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            match self.commit_file(item, &extraction, &mut index) {
                Ok((file_id, relations, relinked)) => {
                    report.files_indexed += 1;
                    report.symbols_extracted += extraction.symbols.len();
                    report.relations_created += relations;
                    report.relations_relinked += relinked;
                    committed.push((file_id, extraction));
                }
                Err(e) => {
                    tracing::warn!(path = %item.path, error = %e, "failed to store file");
                    report.failures.push(IndexFailure {
                        path: item.path.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let (late, unresolved) = self.resolve_pending()?;
        report.relations_created += late;
        report.unresolved_references = unresolved;
        self.write_file_relations(&committed)?;

        report.duration_ms = started.elapsed().as_millis() as i64;
        if report.failures.is_empty() {
            self.db.with_transaction(|| {
                self.db.recompute_aggregates(now)?;
                self.db.write_index_checkpoint(
                    &request.revision,
                    report.files_indexed as i64,
                    report.files_deleted as i64,
                    self.db.symbol_count()?,
                    self.db.relation_count()?,
                    report.duration_ms,
                    mode,
                )?;
                if let Some(branch) = &request.branch {
                    self.db.write_analysis_checkpoint(
                        branch,
                        &request.revision,
                        (report.files_indexed + report.files_deleted) as i64,
                        report.symbols_extracted as i64,
                        request.merge_base.as_deref(),
                    )?;
                }
                Ok(())
            })?;
            report.checkpoint_advanced = true;
        } else {
            self.db.recompute_aggregates(now)?;
            tracing::warn!(
                failures = report.failures.len(),
                revision = %request.revision,
                "checkpoint not advanced; change set will be retried"
            );
        }

        tracing::info!(
            files_indexed = report.files_indexed,
            files_skipped = report.files_skipped,
            files_deleted = report.files_deleted,
            symbols = report.symbols_extracted,
            relations = report.relations_created,
            unresolved = report.unresolved_references,
            "indexing pass complete"
        );
        Ok(report)
    }

    /// Normalise a caller-supplied path to repository-relative form.
    fn normalize(&self, raw: &str) -> Result<String> {
        let raw = raw.trim().replace('\\', "/");
        let p = Path::new(&raw);
        let rel = if p.is_absolute() {
            p.strip_prefix(&self.root).map_err(|_| {
                GraphError::InvalidArgument(format!("{raw} is outside {}", self.root.display()))
            })?
        } else {
            p
        };
        let mut parts = Vec::new();
        for c in rel.components() {
            match c {
                Component::Normal(s) => parts.push(s.to_string_lossy().to_string()),
                Component::CurDir => {}
                _ => {
                    return Err(GraphError::InvalidArgument(format!(
                        "path {raw} must stay inside the repository"
                    )))
                }
            }
        }
        if parts.is_empty() {
            return Err(GraphError::InvalidArgument("empty path in change list".into()));
        }
        Ok(parts.join("/"))
    }

    fn changed_targets(&self, changed: &[String]) -> Result<Vec<String>> {
        let mut out = BTreeSet::new();
        for raw in changed {
            let rel = self.normalize(raw)?;
            // Untracked paths still matter if the store holds them.
            if self.policy.is_tracked(&rel) || self.db.get_file_hash(&rel)?.is_some() {
                out.insert(rel);
            }
        }
        Ok(out.into_iter().collect())
    }

    /// Every tracked file on disk plus every stored path.
    fn full_targets(&self) -> Result<Vec<String>> {
        let mut out: BTreeSet<String> = self
            .db
            .list_files()?
            .into_iter()
            .map(|f| f.path)
            .collect();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                if !e.file_type().is_dir() {
                    return true;
                }
                let rel = self.relative(e.path());
                !self.policy.excludes_dir(&rel)
            });
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    tracing::warn!(error = %err, "walk error");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = self.relative(entry.path());
            if self.policy.is_tracked(&rel) {
                out.insert(rel);
            }
        }
        Ok(out.into_iter().collect())
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn read_candidate(&self, path: &str, abs: &Path) -> Result<Candidate> {
        let metadata = std::fs::metadata(abs)?;
        if metadata.len() > self.policy.max_file_size {
            tracing::debug!(path, size = metadata.len(), "oversized file");
            return Ok(Candidate::Oversized);
        }
        let source = std::fs::read(abs)?;
        let hash = fingerprint(&source);
        if self.db.get_file_hash(path)?.as_deref() == Some(hash.as_str()) {
            return Ok(Candidate::Unchanged);
        }
        Ok(Candidate::Changed(Pending {
            path: path.to_string(),
            source,
            hash,
        }))
    }

    /// Run the extractor over every pending file on a bounded pool; the
    /// result order matches `pending`.
    fn extract_all(&self, pending: &[Pending]) -> Result<Vec<Result<Extraction>>> {
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.policy.parallelism)
            .build()
            .map_err(|e| GraphError::ResourceExceeded(format!("extraction pool: {e}")))?;
        let extractor = self.extractor;
        Ok(pool.install(|| {
            pending
                .par_iter()
                .map(|p| extractor.extract(&p.path, &p.source))
                .collect()
        }))
    }

    fn file_attrs(&self, item: &Pending, extraction: &Extraction) -> FileAttrs {
        let (is_critical, criticality_reason, security_sensitive) = self.policy.classify(&item.path);
        let lines = extraction
            .lines
            .unwrap_or_else(|| LineCounts::from_source(&item.source));
        FileAttrs {
            language: extraction
                .language
                .clone()
                .unwrap_or_else(|| language_for(&item.path)),
            is_critical,
            criticality_reason,
            security_sensitive,
            lines_total: lines.total,
            lines_code: lines.code,
            lines_comment: lines.comment,
            lines_blank: lines.blank,
            content_hash: item.hash.clone(),
            ..FileAttrs::default()
        }
    }

    /// Upsert the file row, replace its symbol set and store its unresolved
    /// references, all in one transaction.
    /// Returns `(file_id, relations stored, incoming edges relinked)`.
    fn commit_file(
        &self,
        item: &Pending,
        extraction: &Extraction,
        index: &mut NameIndex,
    ) -> Result<(i64, usize, usize)> {
        for r in &extraction.references {
            if r.from >= extraction.symbols.len() {
                return Err(GraphError::Extraction {
                    path: item.path.clone(),
                    message: format!("reference source {} has no symbol", r.from),
                });
            }
        }

        let attrs = self.file_attrs(item, extraction);
        let lookup: &NameIndex = index;
        let (file_id, stats) = self.db.with_transaction(|| {
            let file_id = self.db.upsert_file(&item.path, &attrs)?;
            let path_ids = self.target_file_ids(extraction)?;

            let mut relations: Vec<NewRelation> = Vec::new();
            let mut merged: HashMap<(usize, RelationTarget, RelationType), usize> = HashMap::new();
            let mut unresolved = Vec::new();
            for r in &extraction.references {
                let target = resolve_local(&extraction.symbols, r, &item.path)
                    .map(RelationTarget::Local)
                    .or_else(|| {
                        resolve_global(lookup, &r.to, r.to_file.as_deref(), file_id, &path_ids)
                            .map(RelationTarget::Symbol)
                    });
                let Some(target) = target else {
                    unresolved.push(r);
                    continue;
                };
                let key = (r.from, target, r.relation_type);
                if let Some(&at) = merged.get(&key) {
                    relations[at].count += r.count.max(1);
                    continue;
                }
                merged.insert(key, relations.len());
                let mut rel = NewRelation::new(r.from, target, r.relation_type);
                rel.line = r.line;
                rel.column = r.column;
                rel.count = r.count.max(1);
                rel.is_conditional = r.is_conditional;
                relations.push(rel);
            }

            let stats = self
                .db
                .replace_symbols_for_file(file_id, &extraction.symbols, &relations)?;
            let pending: Vec<PendingReference> = unresolved
                .into_iter()
                .filter_map(|r| {
                    Some(PendingReference {
                        file_id,
                        source_id: *stats.symbol_ids.get(r.from)?,
                        target_name: r.to.clone(),
                        target_path: r.to_file.clone(),
                        relation_type: r.relation_type,
                        line: r.line,
                        count: r.count.max(1),
                    })
                })
                .collect();
            self.db.add_pending_references(&pending)?;
            Ok((file_id, stats))
        })?;

        // Later files in this pass may target the new symbols.
        for candidates in index.values_mut() {
            candidates.retain(|(_, fid, _)| *fid != file_id);
        }
        for (sym, &id) in extraction.symbols.iter().zip(&stats.symbol_ids) {
            let mut keys = vec![sym.name.clone()];
            if let Some(q) = sym.qualified_name.as_ref().filter(|q| *q != &sym.name) {
                keys.push(q.clone());
            }
            for key in keys {
                let entry = index.entry(key).or_default();
                entry.push((id, file_id, sym.kind));
                entry.sort_by_key(|(_, _, kind)| kind.resolution_rank());
            }
        }

        Ok((file_id, stats.relations, stats.relinked))
    }

    fn target_file_ids(&self, extraction: &Extraction) -> Result<HashMap<String, i64>> {
        let mut ids = HashMap::new();
        for r in &extraction.references {
            if let Some(path) = &r.to_file {
                if ids.contains_key(path) {
                    continue;
                }
                if let Some(f) = self.db.get_file(path)? {
                    ids.insert(path.clone(), f.id);
                }
            }
        }
        Ok(ids)
    }

    /// Retry every stored unresolved reference against the current store,
    /// including ones left over from earlier passes.
    /// Returns `(relations added, still unresolved)`.
    fn resolve_pending(&self) -> Result<(usize, usize)> {
        let stored = self.db.pending_references()?;
        if stored.is_empty() {
            return Ok((0, 0));
        }
        let index = self.db.symbol_name_index()?;
        let path_ids: HashMap<String, i64> = self
            .db
            .list_files()?
            .into_iter()
            .map(|f| (f.path, f.id))
            .collect();

        let mut by_file: BTreeMap<i64, Vec<(i64, i64, RelationType, Option<i64>, i64)>> = BTreeMap::new();
        let mut resolved = Vec::new();
        for (row_id, p) in &stored {
            let Some(target) = resolve_global(
                &index,
                &p.target_name,
                p.target_path.as_deref(),
                p.file_id,
                &path_ids,
            ) else {
                tracing::debug!(target = %p.target_name, "unresolved reference");
                continue;
            };
            resolved.push(*row_id);
            let edges = by_file.entry(p.file_id).or_default();
            match edges
                .iter_mut()
                .find(|(s, t, k, _, _)| *s == p.source_id && *t == target && *k == p.relation_type)
            {
                Some(existing) => existing.4 += p.count,
                None => edges.push((p.source_id, target, p.relation_type, p.line, p.count)),
            }
        }

        let added = self.db.with_transaction(|| {
            let mut added = 0;
            for (file_id, edges) in &by_file {
                added += self.db.add_relations(*file_id, edges)?;
            }
            self.db.clear_pending_references(&resolved)?;
            Ok(added)
        })?;
        Ok((added, stored.len() - resolved.len()))
    }

    /// Include/import edges for every committed file, resolved against the
    /// store after all files of the pass are present.
    fn write_file_relations(&self, committed: &[(i64, Extraction)]) -> Result<()> {
        for (file_id, extraction) in committed {
            let mut edges = Vec::new();
            for import in &extraction.imports {
                let Ok(target) = self.normalize(&import.path) else {
                    continue;
                };
                if let Some(f) = self.db.get_file(&target)? {
                    edges.push((f.id, import.relation_type, import.line));
                }
            }
            self.db.replace_file_relations(*file_id, &edges)?;
        }
        Ok(())
    }
}

/// Target in the same extraction, unless the reference names another file.
fn resolve_local(symbols: &[NewSymbol], r: &Reference, own_path: &str) -> Option<usize> {
    if r.to_file.as_deref().is_some_and(|p| p != own_path) {
        return None;
    }
    symbols
        .iter()
        .enumerate()
        .filter(|(_, s)| s.name == r.to || s.qualified_name.as_deref() == Some(r.to.as_str()))
        .min_by_key(|(i, s)| (s.kind.resolution_rank(), *i))
        .map(|(i, _)| i)
}

/// Target elsewhere in the store: the named file when given, otherwise the
/// best-ranked candidate outside the referencing file.
fn resolve_global(
    index: &NameIndex,
    name: &str,
    path: Option<&str>,
    own_file_id: i64,
    path_ids: &HashMap<String, i64>,
) -> Option<i64> {
    let candidates = index.get(name)?;
    match path {
        Some(path) => {
            let wanted = path_ids.get(path)?;
            candidates
                .iter()
                .find(|(_, fid, _)| fid == wanted)
                .map(|(id, _, _)| *id)
        }
        None => candidates
            .iter()
            .find(|(_, fid, _)| *fid != own_file_id)
            .map(|(id, _, _)| *id),
    }
}
