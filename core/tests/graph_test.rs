use riskgraph_core::db::{Database, FileAttrs, NewSymbol};
use riskgraph_core::error::GraphError;
use riskgraph_core::graph::{GraphEngine, TraversalLimits, MAX_DEPTH_LIMIT};
use riskgraph_core::model::{FileRelationType, ImpactReason, RelationType, SymbolKind};

fn add_file(db: &Database, path: &str, critical: bool) -> i64 {
    db.upsert_file(
        path,
        &FileAttrs {
            language: "c".to_string(),
            is_critical: critical,
            content_hash: format!("hash-{path}"),
            ..FileAttrs::default()
        },
    )
    .unwrap()
}

/// Give `file_id` one function per name; returns their ids in order.
fn define(db: &Database, file_id: i64, names: &[&str]) -> Vec<i64> {
    let symbols: Vec<NewSymbol> = names
        .iter()
        .enumerate()
        .map(|(i, n)| NewSymbol::new(n, SymbolKind::Function, i as i64 * 10 + 1, i as i64 * 10 + 8))
        .collect();
    db.replace_symbols_for_file(file_id, &symbols, &[]).unwrap().symbol_ids
}

fn link(db: &Database, source_file: i64, source: i64, target: i64, kind: RelationType) {
    db.add_relations(source_file, &[(source, target, kind, Some(1), 1)])
        .unwrap();
}

fn engine(db: &Database) -> GraphEngine<'_> {
    GraphEngine::new(db, TraversalLimits::default())
}

fn level_names(levels: &[riskgraph_core::graph::TraversalLevel]) -> Vec<Vec<String>> {
    levels
        .iter()
        .map(|l| l.entries.iter().map(|e| e.name.clone()).collect())
        .collect()
}

/// `d -> c -> b -> a`, one file each.
fn chain(db: &Database) {
    let mut prev: Option<(i64, i64)> = None;
    for (path, name) in [("src/a.c", "a"), ("src/b.c", "b"), ("src/c.c", "c"), ("src/d.c", "d")] {
        let fid = add_file(db, path, false);
        let sid = define(db, fid, &[name])[0];
        if let Some((_, target)) = prev {
            link(db, fid, sid, target, RelationType::Calls);
        }
        prev = Some((fid, sid));
    }
}

// ---------------------------------------------------------------------------
// 1. Callers and callees, level by level
// ---------------------------------------------------------------------------
#[test]
fn test_transitive_callers_by_level() {
    let db = Database::open_in_memory().unwrap();
    chain(&db);

    let t = engine(&db).callers("a", None, Some(3), &[]).unwrap();
    assert_eq!(t.symbol.name, "a");
    assert_eq!(t.symbol.file, "src/a.c");
    assert_eq!(level_names(&t.levels), vec![vec!["b"], vec!["c"], vec!["d"]]);
    assert_eq!(t.levels[2].depth, 3);
    assert_eq!(t.summary.total, 3);
    assert_eq!(t.summary.max_depth_reached, 3);
    assert_eq!(t.summary.files_affected, vec!["src/b.c", "src/c.c", "src/d.c"]);
    assert!(!t.truncated);

    let t = engine(&db).callers("a", None, Some(2), &[]).unwrap();
    assert_eq!(level_names(&t.levels), vec![vec!["b"], vec!["c"]]);
}

#[test]
fn test_callees_follow_outgoing_edges() {
    let db = Database::open_in_memory().unwrap();
    chain(&db);

    let t = engine(&db).callees("d", None, Some(16), &[]).unwrap();
    assert_eq!(level_names(&t.levels), vec![vec!["c"], vec!["b"], vec!["a"]]);
    assert_eq!(t.levels[0].entries[0].relation_type, RelationType::Calls);

    let leaf = engine(&db).callees("a", None, None, &[]).unwrap();
    assert!(leaf.levels.is_empty());
    assert_eq!(leaf.summary.total, 0);
}

#[test]
fn test_depth_zero_returns_only_the_root() {
    let db = Database::open_in_memory().unwrap();
    chain(&db);
    let t = engine(&db).callers("a", None, Some(0), &[]).unwrap();
    assert_eq!(t.symbol.name, "a");
    assert!(t.levels.is_empty());
    assert_eq!(t.summary.max_depth_reached, 0);
}

// ---------------------------------------------------------------------------
// 2. Cycles and minimal depth
// ---------------------------------------------------------------------------
#[test]
fn test_cycles_terminate() {
    let db = Database::open_in_memory().unwrap();
    let fa = add_file(&db, "a.c", false);
    let fb = add_file(&db, "b.c", false);
    let a = define(&db, fa, &["ping"])[0];
    let b = define(&db, fb, &["pong"])[0];
    link(&db, fa, a, b, RelationType::Calls);
    link(&db, fb, b, a, RelationType::Calls);
    link(&db, fa, a, a, RelationType::Calls);

    let t = engine(&db).callers("ping", None, Some(MAX_DEPTH_LIMIT), &[]).unwrap();
    assert_eq!(level_names(&t.levels), vec![vec!["pong"]]);
    assert_eq!(t.summary.total, 1);
}

#[test]
fn test_symbol_reported_at_shallowest_depth() {
    let db = Database::open_in_memory().unwrap();
    let f = add_file(&db, "one.c", false);
    let ids = define(&db, f, &["target", "mid", "outer"]);
    link(&db, f, ids[1], ids[0], RelationType::Calls);
    link(&db, f, ids[2], ids[1], RelationType::Calls);
    link(&db, f, ids[2], ids[0], RelationType::Calls);

    let t = engine(&db).callers("target", None, Some(3), &[]).unwrap();
    assert_eq!(level_names(&t.levels), vec![vec!["mid", "outer"]]);
}

// ---------------------------------------------------------------------------
// 3. Relation-type filters
// ---------------------------------------------------------------------------
#[test]
fn test_relation_type_filter() {
    let db = Database::open_in_memory().unwrap();
    let f = add_file(&db, "types.c", false);
    let ids = define(&db, f, &["widget_new", "render", "config"]);
    link(&db, f, ids[1], ids[0], RelationType::Calls);
    link(&db, f, ids[2], ids[0], RelationType::UsesType);

    let calls = engine(&db).callers("widget_new", None, Some(1), &[]).unwrap();
    assert_eq!(level_names(&calls.levels), vec![vec!["render"]]);

    let uses = engine(&db)
        .callers("widget_new", None, Some(1), &[RelationType::UsesType])
        .unwrap();
    assert_eq!(level_names(&uses.levels), vec![vec!["config"]]);
    assert_eq!(uses.levels[0].entries[0].relation_type, RelationType::UsesType);

    let both = engine(&db)
        .callers("widget_new", None, Some(1), &[RelationType::Calls, RelationType::UsesType])
        .unwrap();
    assert_eq!(both.summary.total, 2);
}

// ---------------------------------------------------------------------------
// 4. Frontier cap and canonical ordering
// ---------------------------------------------------------------------------
#[test]
fn test_frontier_cap_truncates_canonical_prefix() {
    let db = Database::open_in_memory().unwrap();
    let target_file = add_file(&db, "lib/core.c", false);
    let target = define(&db, target_file, &["core"])[0];
    // Inserted in reverse so id order differs from path order.
    for i in (1..=5).rev() {
        let fid = add_file(&db, &format!("src/f{i}.c"), i == 2);
        let name = format!("caller{i}");
        let sid = define(&db, fid, &[name.as_str()])[0];
        link(&db, fid, sid, target, RelationType::Calls);
    }

    let limits = TraversalLimits::new(3, 2).unwrap();
    let t = GraphEngine::new(&db, limits).callers("core", None, Some(1), &[]).unwrap();
    assert!(t.truncated);
    let files: Vec<&str> = t.levels[0].entries.iter().map(|e| e.file.as_str()).collect();
    assert_eq!(files, vec!["src/f1.c", "src/f2.c"]);
    assert_eq!(t.summary.critical, 1);
    assert!(t.levels[0].entries[1].is_critical);

    let full = engine(&db).callers("core", None, Some(1), &[]).unwrap();
    assert!(!full.truncated);
    assert_eq!(full.summary.total, 5);
}

#[test]
fn test_results_are_deterministic() {
    let db = Database::open_in_memory().unwrap();
    chain(&db);
    let f = add_file(&db, "src/e.c", true);
    let extra = define(&db, f, &["e"])[0];
    let b = db.find_symbols("b", None).unwrap()[0].id;
    link(&db, f, extra, b, RelationType::Calls);

    let first = serde_json::to_string(&engine(&db).callers("a", None, Some(4), &[]).unwrap()).unwrap();
    let second = serde_json::to_string(&engine(&db).callers("a", None, Some(4), &[]).unwrap()).unwrap();
    assert_eq!(first, second);

    let t = engine(&db).callers("a", None, Some(4), &[]).unwrap();
    assert_eq!(level_names(&t.levels), vec![vec!["b"], vec!["c", "e"], vec!["d"]]);
}

// ---------------------------------------------------------------------------
// 5. Argument validation
// ---------------------------------------------------------------------------
#[test]
fn test_depth_above_limit_rejected() {
    let db = Database::open_in_memory().unwrap();
    chain(&db);
    let err = engine(&db)
        .callers("a", None, Some(MAX_DEPTH_LIMIT + 1), &[])
        .unwrap_err();
    assert!(matches!(err, GraphError::InvalidArgument(_)), "got {err:?}");

    let err = engine(&db).file_impact("src/a.c", Some(17)).unwrap_err();
    assert!(matches!(err, GraphError::InvalidArgument(_)), "got {err:?}");

    assert!(TraversalLimits::new(MAX_DEPTH_LIMIT + 1, 10).is_err());
    assert!(TraversalLimits::new(3, 0).is_err());
}

#[test]
fn test_unknown_symbol_and_file() {
    let db = Database::open_in_memory().unwrap();
    chain(&db);

    let err = engine(&db).callers("nope", None, None, &[]).unwrap_err();
    assert!(matches!(err, GraphError::NotFound { kind: "symbol", .. }), "got {err:?}");

    let err = engine(&db).callers("a", Some("src/b.c"), None, &[]).unwrap_err();
    assert!(matches!(err, GraphError::NotFound { .. }), "got {err:?}");

    let err = engine(&db).callers("  ", None, None, &[]).unwrap_err();
    assert!(matches!(err, GraphError::InvalidArgument(_)), "got {err:?}");

    let err = engine(&db).file_impact("missing.c", None).unwrap_err();
    assert!(matches!(err, GraphError::NotFound { kind: "file", .. }), "got {err:?}");
}

// ---------------------------------------------------------------------------
// 6. File impact with provenance
// ---------------------------------------------------------------------------
#[test]
fn test_file_impact_provenance() {
    let db = Database::open_in_memory().unwrap();
    let core = add_file(&db, "lib/core.c", false);
    let a = add_file(&db, "app/a.c", false);
    let b = add_file(&db, "app/b.c", true);
    let x = add_file(&db, "inc/x.c", false);
    let y = add_file(&db, "inc/y.c", false);

    let core_ids = define(&db, core, &["core_fn", "core_helper"]);
    let a_ids = define(&db, a, &["a_fn", "a_other"]);
    let b_ids = define(&db, b, &["b_fn"]);

    link(&db, core, core_ids[0], core_ids[1], RelationType::Calls);
    link(&db, a, a_ids[0], core_ids[0], RelationType::Calls);
    link(&db, a, a_ids[1], core_ids[1], RelationType::UsesType);
    link(&db, b, b_ids[0], a_ids[0], RelationType::Calls);
    db.replace_file_relations(x, &[(core, FileRelationType::Includes, Some(1))])
        .unwrap();
    db.replace_file_relations(y, &[(x, FileRelationType::Includes, Some(3))])
        .unwrap();

    let impact = engine(&db).file_impact("lib/core.c", Some(3)).unwrap();
    assert_eq!(impact.file_path, "lib/core.c");

    assert_eq!(impact.direct_impact.len(), 1);
    let direct = &impact.direct_impact[0];
    assert_eq!(direct.file, "app/a.c");
    assert_eq!(direct.reason, ImpactReason::DirectCall);
    assert_eq!(direct.depth, 1);
    assert_eq!(direct.symbols, vec!["a_fn", "a_other"]);

    assert_eq!(impact.transitive_impact.len(), 1);
    assert_eq!(impact.transitive_impact[0].file, "app/b.c");
    assert_eq!(impact.transitive_impact[0].reason, ImpactReason::TransitiveCall);
    assert_eq!(impact.transitive_impact[0].depth, 2);
    assert!(impact.transitive_impact[0].is_critical);

    let includes: Vec<(&str, usize)> = impact
        .include_impact
        .iter()
        .map(|e| (e.file.as_str(), e.depth))
        .collect();
    assert_eq!(includes, vec![("inc/x.c", 1), ("inc/y.c", 2)]);
    assert!(impact.include_impact.iter().all(|e| e.reason == ImpactReason::Include));

    assert_eq!(impact.summary.total_files_impacted, 4);
    assert_eq!(impact.summary.critical_files_impacted, 1);
    assert_eq!(impact.summary.max_depth, 2);
    assert_eq!(
        impact.summary.files,
        vec!["app/a.c", "app/b.c", "inc/x.c", "inc/y.c"]
    );
    assert!(!impact.truncated);

    let shallow = engine(&db).file_impact("lib/core.c", Some(1)).unwrap();
    assert!(shallow.transitive_impact.is_empty());
    assert_eq!(shallow.include_impact.len(), 1);
    assert_eq!(shallow.summary.total_files_impacted, 2);
}

#[test]
fn test_file_impact_of_isolated_file_is_empty() {
    let db = Database::open_in_memory().unwrap();
    let f = add_file(&db, "solo.c", false);
    define(&db, f, &["alone"]);
    let impact = engine(&db).file_impact("solo.c", None).unwrap();
    assert_eq!(impact.entries().count(), 0);
    assert_eq!(impact.summary.total_files_impacted, 0);
    assert_eq!(impact.summary.max_depth, 0);
}
