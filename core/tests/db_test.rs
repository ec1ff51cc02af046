use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

use riskgraph_core::db::{
    query_signature, ArchitectureDecision, Database, DefectFilter, Direction, FileAttrs, NewDefect,
    NewRelation, NewSymbol, Pattern, PendingReference, RelationTarget,
};
use riskgraph_core::error::GraphError;
use riskgraph_core::model::{FileRelationType, IndexMode, RelationType, Severity, SymbolKind};

fn attrs(hash: &str) -> FileAttrs {
    FileAttrs {
        language: "c".to_string(),
        content_hash: hash.to_string(),
        lines_total: 10,
        lines_code: 8,
        ..FileAttrs::default()
    }
}

fn func(name: &str, line: i64) -> NewSymbol {
    NewSymbol::new(name, SymbolKind::Function, line, line + 2)
}

fn names(db: &Database, file_id: i64) -> Vec<String> {
    let mut out: Vec<String> = db
        .get_symbols_by_file(file_id)
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect();
    out.sort();
    out
}

// ---------------------------------------------------------------------------
// 1. Schema is created on open
// ---------------------------------------------------------------------------
#[test]
fn test_schema_tables_exist() {
    let db = Database::open_in_memory().unwrap();
    let tables = db.table_names().unwrap();
    for expected in [
        "files",
        "symbols",
        "relations",
        "file_relations",
        "pending_references",
        "file_commits",
        "error_history",
        "patterns",
        "architecture_decisions",
        "analysis_checkpoints",
        "index_checkpoint",
        "pipeline_runs",
        "query_cache",
        "query_cache_files",
    ] {
        assert!(tables.iter().any(|t| t == expected), "missing table {expected}: {tables:?}");
    }
}

// ---------------------------------------------------------------------------
// 2. upsert_file is idempotent on path and keeps the id
// ---------------------------------------------------------------------------
#[test]
fn test_upsert_file_preserves_id() {
    let db = Database::open_in_memory().unwrap();
    let id1 = db.upsert_file("net/socket.c", &attrs("aaa")).unwrap();
    let id2 = db.upsert_file("net/socket.c", &attrs("bbb")).unwrap();
    assert_eq!(id1, id2);
    assert_eq!(db.file_count().unwrap(), 1);

    let file = db.require_file("net/socket.c").unwrap();
    assert_eq!(file.content_hash, "bbb");
    assert_eq!(file.module, "net");
    assert_eq!(file.filename, "socket.c");
    assert_eq!(file.extension, "c");
    assert_eq!(file.file_type, "source");

    let top = db.upsert_file("main.c", &attrs("ccc")).unwrap();
    assert_eq!(db.get_file_by_id(top).unwrap().unwrap().module, "root");
}

#[test]
fn test_missing_file_is_not_found() {
    let db = Database::open_in_memory().unwrap();
    let err = db.require_file("nope.c").unwrap_err();
    assert!(matches!(err, GraphError::NotFound { kind: "file", .. }), "got {err:?}");
    assert_eq!(err.kind(), "not_found");
}

// ---------------------------------------------------------------------------
// 3. replace_symbols_for_file replaces the whole set
// ---------------------------------------------------------------------------
#[test]
fn test_replace_symbols_replaces_whole_set() {
    let db = Database::open_in_memory().unwrap();
    let fid = db.upsert_file("lib/a.c", &attrs("h1")).unwrap();

    let stats = db
        .replace_symbols_for_file(
            fid,
            &[func("alpha", 1), func("beta", 10)],
            &[NewRelation::calls(0, RelationTarget::Local(1)).at_line(2)],
        )
        .unwrap();
    assert_eq!(stats.symbol_ids.len(), 2);
    assert_eq!(stats.relations, 1);
    assert_eq!(names(&db, fid), vec!["alpha", "beta"]);

    db.replace_symbols_for_file(fid, &[func("gamma", 1)], &[]).unwrap();
    assert_eq!(names(&db, fid), vec!["gamma"]);
    assert_eq!(db.relation_count().unwrap(), 0, "old relations must go with old symbols");
    assert!(db.get_symbol(stats.symbol_ids[0]).unwrap().is_none());
}

#[test]
fn test_replace_symbols_unknown_file() {
    let db = Database::open_in_memory().unwrap();
    let err = db.replace_symbols_for_file(999, &[func("x", 1)], &[]).unwrap_err();
    assert!(matches!(err, GraphError::NotFound { .. }), "got {err:?}");
}

// ---------------------------------------------------------------------------
// 4. A failing replace leaves the previous set untouched
// ---------------------------------------------------------------------------
#[test]
fn test_replace_rollback_on_bad_relation_endpoint() {
    let db = Database::open_in_memory().unwrap();
    let fid = db.upsert_file("lib/a.c", &attrs("h1")).unwrap();
    db.replace_symbols_for_file(
        fid,
        &[func("alpha", 1), func("beta", 10)],
        &[NewRelation::calls(0, RelationTarget::Local(1))],
    )
    .unwrap();

    let err = db
        .replace_symbols_for_file(
            fid,
            &[func("x", 1), func("y", 5)],
            &[NewRelation::calls(0, RelationTarget::Local(7))],
        )
        .unwrap_err();
    assert!(matches!(err, GraphError::ConstraintViolation(_)), "got {err:?}");

    assert_eq!(names(&db, fid), vec!["alpha", "beta"]);
    assert_eq!(db.relation_count().unwrap(), 1);
}

#[test]
fn test_replace_rollback_on_duplicate_symbol() {
    let db = Database::open_in_memory().unwrap();
    let fid = db.upsert_file("lib/a.c", &attrs("h1")).unwrap();
    db.replace_symbols_for_file(fid, &[func("alpha", 1)], &[]).unwrap();

    let err = db
        .replace_symbols_for_file(fid, &[func("dup", 3), func("dup", 3)], &[])
        .unwrap_err();
    assert!(matches!(err, GraphError::ConstraintViolation(_)), "got {err:?}");
    assert_eq!(names(&db, fid), vec!["alpha"]);
}

#[test]
fn test_replace_rollback_on_dangling_symbol_target() {
    let db = Database::open_in_memory().unwrap();
    let fid = db.upsert_file("lib/a.c", &attrs("h1")).unwrap();
    db.replace_symbols_for_file(fid, &[func("alpha", 1)], &[]).unwrap();

    let err = db
        .replace_symbols_for_file(
            fid,
            &[func("beta", 1)],
            &[NewRelation::calls(0, RelationTarget::Symbol(424242))],
        )
        .unwrap_err();
    assert!(matches!(err, GraphError::ConstraintViolation(_)), "got {err:?}");
    assert_eq!(names(&db, fid), vec!["alpha"]);
}

// ---------------------------------------------------------------------------
// 5. Incoming edges from other files follow a re-index by (name, kind)
// ---------------------------------------------------------------------------
#[test]
fn test_incoming_edges_relinked_on_reindex() {
    let db = Database::open_in_memory().unwrap();
    let lib = db.upsert_file("lib/util.c", &attrs("u1")).unwrap();
    let app = db.upsert_file("app/main.c", &attrs("m1")).unwrap();

    let lib_ids = db
        .replace_symbols_for_file(lib, &[func("helper", 1), func("gone", 9)], &[])
        .unwrap()
        .symbol_ids;
    db.replace_symbols_for_file(
        app,
        &[func("main", 1)],
        &[
            NewRelation::calls(0, RelationTarget::Symbol(lib_ids[0])),
            NewRelation::calls(0, RelationTarget::Symbol(lib_ids[1])),
        ],
    )
    .unwrap();
    assert_eq!(db.relation_count().unwrap(), 2);

    // helper moves, gone disappears.
    let stats = db
        .replace_symbols_for_file(lib, &[func("helper", 20)], &[])
        .unwrap();
    assert_eq!(stats.relinked, 1);
    assert_eq!(db.relation_count().unwrap(), 1);

    let callers = db
        .symbol_edges(&stats.symbol_ids, Direction::Incoming, &[RelationType::Calls])
        .unwrap();
    assert_eq!(callers.len(), 1);
    assert_eq!(callers[0].symbol.name, "main");
    assert_eq!(db.dangling_relation_count().unwrap(), 0);
}

// ---------------------------------------------------------------------------
// 6. delete_file cascades to symbols, relations and file relations
// ---------------------------------------------------------------------------
#[test]
fn test_delete_file_cascades() {
    let db = Database::open_in_memory().unwrap();
    let lib = db.upsert_file("lib/util.c", &attrs("u1")).unwrap();
    let app = db.upsert_file("app/main.c", &attrs("m1")).unwrap();
    let lib_ids = db
        .replace_symbols_for_file(lib, &[func("helper", 1)], &[])
        .unwrap()
        .symbol_ids;
    db.replace_symbols_for_file(
        app,
        &[func("main", 1)],
        &[NewRelation::calls(0, RelationTarget::Symbol(lib_ids[0]))],
    )
    .unwrap();
    db.replace_file_relations(app, &[(lib, FileRelationType::Includes, Some(1))])
        .unwrap();

    assert!(db.delete_file("lib/util.c").unwrap());
    assert!(!db.delete_file("lib/util.c").unwrap(), "second delete is a no-op");

    assert!(db.get_symbol(lib_ids[0]).unwrap().is_none());
    assert!(db.find_symbols("helper", None).unwrap().is_empty());
    assert_eq!(db.relation_count().unwrap(), 0);
    assert_eq!(db.dangling_relation_count().unwrap(), 0);
    assert!(db.get_file_relations_out(app).unwrap().is_empty());
    assert_eq!(names(&db, app), vec!["main"]);
}

// ---------------------------------------------------------------------------
// 7. add_relations merges duplicates and checks ownership
// ---------------------------------------------------------------------------
#[test]
fn test_add_relations_merges_counts() {
    let db = Database::open_in_memory().unwrap();
    let a = db.upsert_file("a.c", &attrs("a")).unwrap();
    let b = db.upsert_file("b.c", &attrs("b")).unwrap();
    let a_ids = db.replace_symbols_for_file(a, &[func("fa", 1)], &[]).unwrap().symbol_ids;
    let b_ids = db.replace_symbols_for_file(b, &[func("fb", 1)], &[]).unwrap().symbol_ids;

    let edge = (a_ids[0], b_ids[0], RelationType::Calls, Some(2), 1);
    db.add_relations(a, &[edge]).unwrap();
    db.add_relations(a, &[edge]).unwrap();
    assert_eq!(db.relation_count().unwrap(), 1);
    let out = db
        .symbol_edges(&a_ids, Direction::Outgoing, &[RelationType::Calls])
        .unwrap();
    assert_eq!(out[0].count, 2);

    let err = db.add_relations(b, &[edge]).unwrap_err();
    assert!(matches!(err, GraphError::ConstraintViolation(_)), "got {err:?}");
}

#[test]
fn test_pending_references_follow_their_source_symbols() {
    let db = Database::open_in_memory().unwrap();
    let a = db.upsert_file("a.c", &attrs("a")).unwrap();
    let b = db.upsert_file("b.c", &attrs("b")).unwrap();
    let a_ids = db.replace_symbols_for_file(a, &[func("fa", 1)], &[]).unwrap().symbol_ids;
    let b_ids = db.replace_symbols_for_file(b, &[func("fb", 1)], &[]).unwrap().symbol_ids;

    let pending = |file_id, source_id, name: &str| PendingReference {
        file_id,
        source_id,
        target_name: name.to_string(),
        target_path: None,
        relation_type: RelationType::Calls,
        line: Some(4),
        count: 1,
    };
    assert_eq!(
        db.add_pending_references(&[pending(a, a_ids[0], "later"), pending(b, b_ids[0], "other")])
            .unwrap(),
        2
    );
    let stored = db.pending_references().unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].1, pending(a, a_ids[0], "later"));

    let err = db
        .add_pending_references(&[pending(b, a_ids[0], "wrong")])
        .unwrap_err();
    assert!(matches!(err, GraphError::ConstraintViolation(_)), "got {err:?}");

    // Replacing the source's symbols drops its stored references.
    db.replace_symbols_for_file(a, &[func("fa", 1)], &[]).unwrap();
    assert_eq!(db.pending_reference_count().unwrap(), 1);

    let (row, _) = db.pending_references().unwrap()[0].clone();
    assert_eq!(db.clear_pending_references(&[row]).unwrap(), 1);
    assert_eq!(db.pending_reference_count().unwrap(), 0);
}

// ---------------------------------------------------------------------------
// 8. Lookups: find, search, name index
// ---------------------------------------------------------------------------
#[test]
fn test_find_symbols_prefers_functions() {
    let db = Database::open_in_memory().unwrap();
    let a = db.upsert_file("a/types.h", &attrs("a")).unwrap();
    let b = db.upsert_file("b/impl.c", &attrs("b")).unwrap();
    db.replace_symbols_for_file(a, &[NewSymbol::new("widget", SymbolKind::Struct, 1, 5)], &[])
        .unwrap();
    db.replace_symbols_for_file(b, &[func("widget", 1)], &[]).unwrap();

    let found = db.find_symbols("widget", None).unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].kind, SymbolKind::Function);
    assert_eq!(found[0].file_path, "b/impl.c");

    let scoped = db.find_symbols("widget", Some("a/types.h")).unwrap();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].kind, SymbolKind::Struct);
}

#[test]
fn test_search_symbols_glob_and_filters() {
    let db = Database::open_in_memory().unwrap();
    let a = db.upsert_file("net/tcp.c", &attrs("a")).unwrap();
    let b = db.upsert_file("fs/file.c", &attrs("b")).unwrap();
    db.replace_symbols_for_file(a, &[func("tcp_send", 1), func("tcp_recv", 5), func("udp_send", 9)], &[])
        .unwrap();
    db.replace_symbols_for_file(b, &[func("file_send", 1)], &[]).unwrap();

    let (total, results) = db.search_symbols("tcp_*", None, None, None, 50).unwrap();
    assert_eq!(total, 2);
    assert!(results.iter().all(|s| s.name.starts_with("tcp_")));

    let (total, _) = db.search_symbols("*_send", None, Some("net"), None, 50).unwrap();
    assert_eq!(total, 2);

    let (total, results) = db.search_symbols("*send", None, None, None, 1).unwrap();
    assert_eq!(total, 3);
    assert_eq!(results.len(), 1);

    let (total, _) = db
        .search_symbols("*", Some(SymbolKind::Struct), None, None, 50)
        .unwrap();
    assert_eq!(total, 0);
}

// ---------------------------------------------------------------------------
// 9. Aggregates: complexity rollup, tests, commit windows
// ---------------------------------------------------------------------------
#[test]
fn test_recompute_aggregates() {
    let db = Database::open_in_memory().unwrap();
    let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
    let src = db.upsert_file("core/parser.c", &attrs("p")).unwrap();
    db.upsert_file("core/test_parser.c", &attrs("t")).unwrap();
    db.replace_symbols_for_file(
        src,
        &[
            func("parse", 1).with_complexity(12).with_doc("Parses input."),
            func("lex", 20).with_complexity(4),
        ],
        &[],
    )
    .unwrap();
    db.record_commits(&[
        riskgraph_core::db::CommitRecord {
            path: "core/parser.c".into(),
            revision: "r1".into(),
            author: "dev".into(),
            committed_at: now - Duration::days(5),
        },
        riskgraph_core::db::CommitRecord {
            path: "core/parser.c".into(),
            revision: "r0".into(),
            author: "dev".into(),
            committed_at: now - Duration::days(100),
        },
    ])
    .unwrap();

    db.recompute_aggregates(now).unwrap();
    let f = db.require_file("core/parser.c").unwrap();
    assert_eq!(f.complexity_max, 12);
    assert_eq!(f.complexity_sum, 16);
    assert!((f.complexity_avg - 8.0).abs() < 1e-9);
    assert!((f.documentation_score - 0.5).abs() < 1e-9);
    assert!(f.has_tests);
    assert_eq!(f.test_file_path.as_deref(), Some("core/test_parser.c"));
    assert_eq!(f.commits_30d, 1);
    assert_eq!(f.commits_90d, 1);
    assert_eq!(f.commits_365d, 2);

    // The previous maximum survives the next upsert, giving a delta.
    db.upsert_file("core/parser.c", &attrs("p2")).unwrap();
    db.replace_symbols_for_file(src, &[func("parse", 1).with_complexity(25)], &[])
        .unwrap();
    db.recompute_aggregates(now).unwrap();
    let f = db.require_file("core/parser.c").unwrap();
    assert_eq!(f.complexity_max_prev, Some(12));
    assert_eq!(f.complexity_delta(), 13);
}

// ---------------------------------------------------------------------------
// 10. Defect history
// ---------------------------------------------------------------------------
#[test]
fn test_defects_filter_and_survive_file_delete() {
    let db = Database::open_in_memory().unwrap();
    let now = Utc::now();
    db.upsert_file("net/socket.c", &attrs("s")).unwrap();

    let ids = db
        .import_defects(&[
            NewDefect::new("net/socket.c", "crash", Severity::High, "null deref", now - Duration::days(3)),
            NewDefect::new("net/socket.c", "leak", Severity::Low, "fd leak", now - Duration::days(1)),
            NewDefect::new("net/socket.c", "crash", Severity::Critical, "old", now - Duration::days(400)),
        ])
        .unwrap();
    assert_eq!(ids.len(), 3);

    let recent = db
        .query_defects(&DefectFilter {
            file_path: Some("net/socket.c".into()),
            since: Some(now - Duration::days(90)),
            ..DefectFilter::default()
        })
        .unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].title, "fd leak", "newest first");

    let severe = db
        .query_defects(&DefectFilter {
            min_severity: Some(Severity::High),
            ..DefectFilter::default()
        })
        .unwrap();
    assert_eq!(severe.len(), 2);
    assert_eq!(severe[0].module.as_deref(), Some("net"));

    db.resolve_defect(ids[0], now, Some("added null check")).unwrap();
    let err = db.resolve_defect(987654, now, None).unwrap_err();
    assert!(matches!(err, GraphError::NotFound { .. }));

    db.delete_file("net/socket.c").unwrap();
    let all = db.query_defects(&DefectFilter::default()).unwrap();
    assert_eq!(all.len(), 3, "history is keyed by path and outlives the file row");
}

// ---------------------------------------------------------------------------
// 11. Checkpoints and the run ledger
// ---------------------------------------------------------------------------
#[test]
fn test_checkpoints_roundtrip_and_validation() {
    let db = Database::open_in_memory().unwrap();
    assert!(db.get_index_checkpoint().unwrap().is_none());

    db.write_index_checkpoint("abc123", 4, 1, 20, 30, 15, IndexMode::Full)
        .unwrap();
    db.write_index_checkpoint("def456", 1, 0, 21, 31, 5, IndexMode::Incremental)
        .unwrap();
    let cp = db.get_index_checkpoint().unwrap().unwrap();
    assert_eq!(cp.revision, "def456");
    assert_eq!(cp.mode, IndexMode::Incremental);

    let err = db
        .write_index_checkpoint("bad revision!", 0, 0, 0, 0, 0, IndexMode::Full)
        .unwrap_err();
    assert!(matches!(err, GraphError::IntegrityError(_)), "got {err:?}");

    db.write_analysis_checkpoint("main", "def456", 3, 9, Some("abc123"))
        .unwrap();
    db.write_analysis_checkpoint("main", "fff000", 1, 2, None).unwrap();
    let branch = db.get_analysis_checkpoint("main").unwrap().unwrap();
    assert_eq!(branch.last_revision, "fff000");
    assert!(db.get_analysis_checkpoint("dev").unwrap().is_none());
}

#[test]
fn test_run_ledger_appends() {
    let db = Database::open_in_memory().unwrap();
    let started = Utc::now();
    for (i, score) in [72.5, 91.0].iter().enumerate() {
        db.record_run(&riskgraph_core::db::RunRecord {
            run_id: format!("run-{i}"),
            revision: Some("abc123".into()),
            branch: Some("main".into()),
            status: "completed".into(),
            score: Some(*score),
            verdict: Some("medium".into()),
            files_analyzed: 2,
            started_at: started,
            completed_at: Some(started),
            duration_ms: Some(3),
        })
        .unwrap();
    }
    let runs = db.list_runs(10).unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].run_id, "run-1", "most recent first");
}

// ---------------------------------------------------------------------------
// 12. Knowledge tables
// ---------------------------------------------------------------------------
#[test]
fn test_patterns_and_decisions_apply_by_module_or_glob() {
    let db = Database::open_in_memory().unwrap();
    db.upsert_file("net/socket.c", &attrs("s")).unwrap();
    db.upsert_file("fs/file.c", &attrs("f")).unwrap();

    let pattern: Pattern = serde_json::from_value(json!({
        "name": "check-return",
        "category": "error-handling",
        "scope": "file",
        "file_pattern": "net/*.c",
        "title": "Check return values",
        "description": "Every syscall result is checked.",
    }))
    .unwrap();
    db.upsert_pattern(&pattern).unwrap();
    let global: Pattern = serde_json::from_value(json!({
        "name": "no-globals",
        "category": "style",
        "title": "No mutable globals",
        "description": "Pass state explicitly.",
    }))
    .unwrap();
    db.upsert_pattern(&global).unwrap();

    let socket = db.require_file("net/socket.c").unwrap();
    let file = db.require_file("fs/file.c").unwrap();
    assert_eq!(db.patterns_for_file(&socket).unwrap().len(), 2);
    assert_eq!(db.patterns_for_file(&file).unwrap().len(), 1);

    let adr: ArchitectureDecision = serde_json::from_value(json!({
        "decision_id": "ADR-001",
        "title": "Sockets are non-blocking",
        "affected_modules": ["net"],
    }))
    .unwrap();
    db.upsert_decision(&adr).unwrap();
    let proposed: ArchitectureDecision = serde_json::from_value(json!({
        "decision_id": "ADR-002",
        "status": "proposed",
        "title": "Async file IO",
        "affected_files": ["fs/**"],
    }))
    .unwrap();
    db.upsert_decision(&proposed).unwrap();

    assert_eq!(db.decisions_for_file(&socket).unwrap().len(), 1);
    assert!(db.decisions_for_file(&file).unwrap().is_empty(), "only accepted ADRs apply");
    assert_eq!(db.list_decisions(None).unwrap().len(), 2);
    assert_eq!(db.list_decisions(Some("proposed")).unwrap()[0].affected_files, vec!["fs/**"]);
}

// ---------------------------------------------------------------------------
// 13. Query cache invalidation
// ---------------------------------------------------------------------------
#[test]
fn test_query_signature_normalises_arguments() {
    let a = query_signature("search_symbols", &json!({"query": " tcp_* ", "kind": null}));
    let b = query_signature("search_symbols", &json!({"query": "tcp_*"}));
    let c = query_signature("get_file_metrics", &json!({"query": "tcp_*"}));
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn test_cache_invalidated_by_reindex_and_delete() {
    let db = Database::open_in_memory().unwrap();
    let a = db.upsert_file("a.c", &attrs("a")).unwrap();
    let b = db.upsert_file("b.c", &attrs("b")).unwrap();

    db.cache_put("sig-a", "op", &json!({"v": 1}), &[a], 3600).unwrap();
    db.cache_put("sig-b", "op", &json!({"v": 2}), &[b], 3600).unwrap();
    let hit = db.cache_get("sig-a").unwrap().unwrap();
    assert_eq!(hit.value, json!({"v": 1}));
    assert_eq!(hit.hit_count, 1);

    db.replace_symbols_for_file(a, &[func("fa", 1)], &[]).unwrap();
    assert!(db.cache_get("sig-a").unwrap().is_none(), "re-indexed file invalidates");

    db.delete_file("b.c").unwrap();
    assert!(db.cache_get("sig-b").unwrap().is_none(), "deleted file invalidates");

    db.cache_put("sig-ttl", "op", &json!(1), &[], -1).unwrap();
    assert!(db.cache_get("sig-ttl").unwrap().is_none(), "expired entry misses");
    assert_eq!(db.cache_entry_count().unwrap(), 0);
}

// ---------------------------------------------------------------------------
// 14. Read snapshots
// ---------------------------------------------------------------------------
#[test]
fn test_failed_snapshot_leaves_connection_usable() {
    let db = Database::open_in_memory().unwrap();
    let err = db
        .snapshot(|| -> riskgraph_core::error::Result<()> {
            db.file_count()?;
            Err(GraphError::InvalidArgument("stop".into()))
        })
        .unwrap_err();
    assert!(matches!(err, GraphError::InvalidArgument(_)));

    // The read transaction is closed, so a write transaction can start.
    let a = db.upsert_file("a.c", &attrs("a")).unwrap();
    db.cache_put("sig-a", "op", &json!(1), &[a], 3600).unwrap();
    assert!(db.cache_get("sig-a").unwrap().is_some());
}
