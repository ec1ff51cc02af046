use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use rmcp::ServiceExt;
use tokio_util::sync::CancellationToken;

use riskgraph_core::config::{Config, ResolvedConfig};
use riskgraph_core::db::{ArchitectureDecision, CommitRecord, Database, NewDefect, Pattern, RunRecord};
use riskgraph_core::extract::CommandExtractor;
use riskgraph_core::indexer::{IndexRequest, Indexer};
use riskgraph_core::mcp::RiskGraphServer;
use riskgraph_core::risk::RiskEngine;
use riskgraph_core::tools::{QueryService, QuerySettings};

#[derive(Parser)]
#[command(name = "riskgraph", about = "Code graph, impact analysis and change-risk scoring")]
struct Cli {
    /// Repository root
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Database file (default: <root>/.riskgraph/graph.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Configuration file (default: <root>/riskgraph.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply a change set (or a full walk) to the graph
    Index {
        /// Revision the working tree is at
        #[arg(long)]
        revision: String,
        /// Revision the change list was computed against
        #[arg(long)]
        base: Option<String>,
        /// Branch whose analysis checkpoint advances with this pass
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        merge_base: Option<String>,
        /// Ignore the change list and walk the whole root
        #[arg(long)]
        full: bool,
        /// File with one changed path per line ("-" for stdin)
        #[arg(long)]
        changed_from: Option<PathBuf>,
        /// JSON array of commit records to roll into activity windows
        #[arg(long)]
        commits: Option<PathBuf>,
        /// Changed paths
        paths: Vec<String>,
    },
    /// Load defect records from a JSON array
    ImportDefects { file: PathBuf },
    /// Load coding patterns and architecture decisions from JSON arrays
    ImportKnowledge {
        #[arg(long)]
        patterns: Option<PathBuf>,
        #[arg(long)]
        decisions: Option<PathBuf>,
    },
    /// Run one query operation and print its JSON result
    Query {
        operation: String,
        /// JSON object of arguments
        #[arg(default_value = "{}")]
        args: String,
    },
    /// Score the risk of changing the given files
    Assess {
        files: Vec<String>,
        /// Lines changed per file, as path=count
        #[arg(long = "lines", value_parser = parse_lines)]
        lines: Vec<(String, i64)>,
        #[arg(long)]
        revision: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        /// Append the result to the run ledger
        #[arg(long)]
        record: bool,
    },
    /// Serve the query surface over MCP
    Serve {
        /// Run HTTP MCP server instead of stdio
        #[arg(long)]
        http: bool,
        /// HTTP port (only with --http)
        #[arg(long, default_value = "3100")]
        port: u16,
    },
}

fn parse_lines(s: &str) -> std::result::Result<(String, i64), String> {
    let (path, n) = s
        .rsplit_once('=')
        .ok_or_else(|| format!("expected path=count, got '{s}'"))?;
    let n = n.parse().map_err(|e| format!("bad line count in '{s}': {e}"))?;
    Ok((path.to_string(), n))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn read_paths(source: &Path) -> Result<Vec<String>> {
    let mut text = String::new();
    if source == Path::new("-") {
        std::io::stdin().read_to_string(&mut text)?;
    } else {
        text = std::fs::read_to_string(source)
            .with_context(|| format!("failed to read {}", source.display()))?;
    }
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

fn open_database(cli: &Cli, root: &Path) -> Result<Database> {
    let db_path = match &cli.db {
        Some(p) => p.clone(),
        None => {
            let dir = root.join(".riskgraph");
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            dir.join("graph.db")
        }
    };
    let db_path_str = db_path.to_string_lossy().to_string();
    tracing::info!(db = %db_path_str, "opening database");
    Database::open(&db_path_str).with_context(|| format!("failed to open {db_path_str}"))
}

fn load_config(cli: &Cli, root: &Path) -> Result<ResolvedConfig> {
    let config = match &cli.config {
        Some(p) => Config::load(p)?,
        None => Config::discover(root)?,
    };
    config.resolve()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("riskgraph=info".parse()?)
                .add_directive("riskgraph_core=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("repository root {} not found", cli.root.display()))?;
    let config = load_config(&cli, &root)?;
    let db = open_database(&cli, &root)?;

    match &cli.command {
        Command::Index {
            revision,
            base,
            branch,
            merge_base,
            full,
            changed_from,
            commits,
            paths,
        } => {
            let mut changed = paths.clone();
            if let Some(source) = changed_from {
                changed.extend(read_paths(source)?);
            }
            let commits: Vec<CommitRecord> = match commits {
                Some(p) => read_json(p)?,
                None => Vec::new(),
            };
            let extractor = CommandExtractor::new(&config.extractor_command, root.clone())
                .context("set [extraction].command in riskgraph.toml")?;
            let request = IndexRequest {
                revision: revision.clone(),
                base_revision: base.clone(),
                branch: branch.clone(),
                merge_base: merge_base.clone(),
                changed_paths: changed,
                full: *full,
                commits,
            };
            let report = Indexer::new(&db, &extractor, &config.index, &root).run(&request, Utc::now())?;
            for failure in &report.failures {
                tracing::warn!(path = %failure.path, error = %failure.error, "indexer error");
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.checkpoint_advanced {
                std::process::exit(1);
            }
        }
        Command::ImportDefects { file } => {
            let defects: Vec<NewDefect> = read_json(file)?;
            let ids = db.import_defects(&defects)?;
            tracing::info!(imported = ids.len(), "defects imported");
        }
        Command::ImportKnowledge { patterns, decisions } => {
            if let Some(p) = patterns {
                let items: Vec<Pattern> = read_json(p)?;
                db.with_transaction(|| items.iter().try_for_each(|x| db.upsert_pattern(x)))?;
                tracing::info!(patterns = items.len(), "patterns imported");
            }
            if let Some(p) = decisions {
                let items: Vec<ArchitectureDecision> = read_json(p)?;
                db.with_transaction(|| items.iter().try_for_each(|x| db.upsert_decision(x)))?;
                tracing::info!(decisions = items.len(), "architecture decisions imported");
            }
        }
        Command::Query { operation, args } => {
            let args: serde_json::Value =
                serde_json::from_str(args).context("query arguments must be a JSON object")?;
            let service = QueryService::new(&db, QuerySettings::from(&config));
            match service.execute(operation, args) {
                Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                Err(e) => {
                    println!("{}", serde_json::to_string_pretty(&e.to_payload())?);
                    std::process::exit(2);
                }
            }
        }
        Command::Assess {
            files,
            lines,
            revision,
            branch,
            record,
        } => {
            let started = Utc::now();
            let timer = Instant::now();
            let lines: BTreeMap<String, i64> = lines.iter().cloned().collect();
            let assessment = RiskEngine::new(&db, config.risk.clone()).assess(files, &lines, started, true)?;
            println!("{}", serde_json::to_string_pretty(&assessment)?);
            if *record {
                let run = RunRecord {
                    run_id: format!("run-{}", started.timestamp_millis()),
                    revision: revision.clone(),
                    branch: branch.clone(),
                    status: "completed".to_string(),
                    score: Some(assessment.score),
                    verdict: Some(assessment.verdict.as_str().to_string()),
                    files_analyzed: assessment.files.len() as i64,
                    started_at: started,
                    completed_at: Some(Utc::now()),
                    duration_ms: Some(timer.elapsed().as_millis() as i64),
                };
                db.record_run(&run)?;
                tracing::info!(run_id = %run.run_id, "run recorded");
            }
        }
        Command::Serve { http, port } => {
            let settings = QuerySettings::from(&config);
            serve(db, settings, *http, *port).await?;
        }
    }
    Ok(())
}

async fn serve(db: Database, settings: QuerySettings, http: bool, port: u16) -> Result<()> {
    let db = Arc::new(Mutex::new(db));

    if http {
        let ct = CancellationToken::new();

        let service: StreamableHttpService<RiskGraphServer, LocalSessionManager> =
            StreamableHttpService::new(
                {
                    let db = Arc::clone(&db);
                    let settings = settings.clone();
                    move || Ok(RiskGraphServer::new(Arc::clone(&db), settings.clone()))
                },
                Default::default(),
                StreamableHttpServerConfig {
                    stateful_mode: true,
                    cancellation_token: ct.child_token(),
                    ..Default::default()
                },
            );

        let router = axum::Router::new().nest_service("/mcp", service);
        let bind_addr = format!("127.0.0.1:{port}");
        let tcp_listener = tokio::net::TcpListener::bind(&bind_addr).await?;
        tracing::info!(addr = %bind_addr, "serving MCP over HTTP");

        axum::serve(tcp_listener, router)
            .with_graceful_shutdown(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for ctrl-c");
                }
                tracing::info!("shutting down HTTP MCP server");
                ct.cancel();
            })
            .await?;

        return Ok(());
    }

    tracing::info!("serving MCP over stdio");
    let server = RiskGraphServer::new(db, settings);
    let running = server.serve(rmcp::transport::stdio()).await?;
    running.waiting().await?;
    Ok(())
}
