use std::fs;

use riskgraph_core::config::{Config, CONFIG_FILE_NAME};
use riskgraph_core::tools::QuerySettings;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// 1. Defaults
// ---------------------------------------------------------------------------
#[test]
fn test_defaults_resolve() {
    let resolved = Config::default().resolve().unwrap();
    assert_eq!(resolved.traversal.max_depth, 3);
    assert_eq!(resolved.traversal.frontier_cap, 500);
    assert_eq!(resolved.risk.history_window_days, 90);
    assert_eq!(resolved.risk.large_diff_lines, 200);
    assert_eq!(resolved.cache_ttl_secs, 3600);
    assert!(resolved.extractor_command.is_empty());

    assert!(resolved.index.is_tracked("src/main.c"));
    assert!(!resolved.index.is_tracked("docs/readme.md"));
    assert!(!resolved.index.is_tracked("app/target/debug/gen.rs"));
    assert!(!resolved.index.is_tracked(".git/hooks/pre-commit.py"));
}

#[test]
fn test_empty_document_is_default() {
    let cfg = Config::parse("").unwrap();
    assert_eq!(cfg.indexing.parallelism, 4);
    assert_eq!(cfg.indexing.max_file_size, 512 * 1024);
}

// ---------------------------------------------------------------------------
// 2. Parsing
// ---------------------------------------------------------------------------
#[test]
fn test_parse_sections() {
    let cfg = Config::parse(
        r#"
[indexing]
extensions = ["c", "h"]
exclude = ["vendor/**"]

[criticality]
critical_paths = ["kernel/**"]
security_paths = ["kernel/crypto/**"]

[extraction]
command = ["ctags-json", "--fields=+n"]

[traversal]
max_depth = 6
frontier_cap = 50

[risk]
history_window_days = 30

[cache]
ttl_secs = 0
"#,
    )
    .unwrap();
    let resolved = cfg.resolve().unwrap();

    assert_eq!(resolved.extractor_command, vec!["ctags-json", "--fields=+n"]);
    assert_eq!(resolved.traversal.max_depth, 6);
    assert_eq!(resolved.risk.traversal.frontier_cap, 50);
    assert_eq!(resolved.risk.history_window_days, 30);
    assert_eq!(resolved.risk.large_diff_lines, 200);
    assert_eq!(resolved.cache_ttl_secs, 0);

    assert!(!resolved.index.is_tracked("vendor/zlib.c"));
    assert!(!resolved.index.is_tracked("kernel/sched.rs"));
    let (critical, reason, security) = resolved.index.classify("kernel/crypto/aes.c");
    assert!(critical);
    assert!(reason.unwrap().contains("kernel/**"));
    assert!(security);
    assert_eq!(resolved.index.classify("lib/list.c"), (false, None, false));

    let settings = QuerySettings::from(&resolved);
    assert_eq!(settings.cache_ttl_secs, 0);
    assert_eq!(settings.traversal.max_depth, 6);
}

#[test]
fn test_parse_rejects_wrong_types() {
    assert!(Config::parse("[traversal]\nmax_depth = \"deep\"").is_err());
    assert!(Config::parse("[indexing\n").is_err());
}

// ---------------------------------------------------------------------------
// 3. Validation on resolve
// ---------------------------------------------------------------------------
#[test]
fn test_resolve_rejects_bad_values() {
    let mut cfg = Config::default();
    cfg.indexing.parallelism = 0;
    assert!(cfg.resolve().is_err());

    let mut cfg = Config::default();
    cfg.cache.ttl_secs = -1;
    assert!(cfg.resolve().is_err());

    let mut cfg = Config::default();
    cfg.traversal.max_depth = 17;
    assert!(cfg.resolve().is_err());

    let mut cfg = Config::default();
    cfg.traversal.frontier_cap = 0;
    assert!(cfg.resolve().is_err());

    let mut cfg = Config::default();
    cfg.criticality.critical_paths = vec!["src/[".to_string()];
    let err = cfg.resolve().unwrap_err();
    assert!(format!("{err:#}").contains("glob"));
}

// ---------------------------------------------------------------------------
// 4. Discovery
// ---------------------------------------------------------------------------
#[test]
fn test_discover_prefers_repository_file() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join(CONFIG_FILE_NAME),
        "[traversal]\nmax_depth = 9\n",
    )
    .unwrap();
    let cfg = Config::discover(dir.path()).unwrap();
    assert_eq!(cfg.traversal.max_depth, 9);
}

#[test]
fn test_load_reports_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[cache]\nttl_secs = [").unwrap();
    let err = Config::load(&path).unwrap_err();
    assert!(format!("{err:#}").contains("broken.toml"));

    let missing = Config::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(format!("{missing:#}").contains("absent.toml"));
}
