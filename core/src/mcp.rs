use std::sync::{Arc, Mutex};

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{ServerCapabilities, ServerInfo};
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use serde::Serialize;

use crate::db::Database;
use crate::tools::{
    DecisionsParams, ErrorHistoryParams, FileContextParams, FileImpactParams, FileMetricsParams,
    ModuleSummaryParams, PatternsParams, QueryService, QuerySettings, RiskAssessmentParams,
    SearchSymbolsParams, SymbolTraversalParams,
};

/// MCP front end for [`QueryService`]. Every tool serializes its parameters
/// and goes through the same dispatcher, so results and the query cache are
/// shared with the CLI.
#[derive(Clone)]
pub struct RiskGraphServer {
    db: Arc<Mutex<Database>>,
    settings: QuerySettings,
    tool_router: ToolRouter<Self>,
}

impl RiskGraphServer {
    pub fn new(db: Arc<Mutex<Database>>, settings: QuerySettings) -> Self {
        Self {
            db,
            settings,
            tool_router: Self::tool_router(),
        }
    }

    fn call<P: Serialize>(&self, operation: &str, params: &P) -> Result<String, String> {
        let args = serde_json::to_value(params).map_err(|e| format!("json error: {e}"))?;
        let result = {
            let db = self.db.lock().map_err(|e| format!("lock error: {e}"))?;
            QueryService::new(&db, self.settings.clone()).execute(operation, args)
        };
        match result {
            Ok(value) => serde_json::to_string_pretty(&value).map_err(|e| format!("json error: {e}")),
            Err(e) => {
                tracing::debug!(operation, kind = e.kind(), "tool call failed");
                Err(serde_json::to_string(&e.to_payload()).unwrap_or_else(|_| e.to_string()))
            }
        }
    }
}

#[tool_router]
impl RiskGraphServer {
    #[tool(description = "Summary of one file: metrics, owned symbols, include and call dependencies in both directions, recent defects, and the coding patterns and architecture decisions that apply to it.")]
    fn get_file_context(
        &self,
        Parameters(params): Parameters<FileContextParams>,
    ) -> Result<String, String> {
        self.call("get_file_context", &params)
    }

    #[tool(description = "Symbols that call the given symbol, level by level up to `max_depth` (default 3). Entries within a level are sorted by file, then name. `truncated` is set when a level hit the frontier cap.")]
    fn get_symbol_callers(
        &self,
        Parameters(params): Parameters<SymbolTraversalParams>,
    ) -> Result<String, String> {
        self.call("get_symbol_callers", &params)
    }

    #[tool(description = "Symbols the given symbol calls, level by level up to `max_depth` (default 2).")]
    fn get_symbol_callees(
        &self,
        Parameters(params): Parameters<SymbolTraversalParams>,
    ) -> Result<String, String> {
        self.call("get_symbol_callees", &params)
    }

    #[tool(description = "Files that could be affected by changing this file, grouped by provenance: direct calls, transitive calls and includes/imports.")]
    fn get_file_impact(
        &self,
        Parameters(params): Parameters<FileImpactParams>,
    ) -> Result<String, String> {
        self.call("get_file_impact", &params)
    }

    #[tool(description = "Past defects filtered by file, symbol, module, type or minimum severity within a trailing window, newest first, with statistics.")]
    fn get_error_history(
        &self,
        Parameters(params): Parameters<ErrorHistoryParams>,
    ) -> Result<String, String> {
        self.call("get_error_history", &params)
    }

    #[tool(description = "Find symbols whose name matches a pattern (`*` and `?` wildcards), optionally filtered by kind, module or file.")]
    fn search_symbols(
        &self,
        Parameters(params): Parameters<SearchSymbolsParams>,
    ) -> Result<String, String> {
        self.call("search_symbols", &params)
    }

    #[tool(description = "Size, complexity, structure, quality and commit activity metrics for one file.")]
    fn get_file_metrics(
        &self,
        Parameters(params): Parameters<FileMetricsParams>,
    ) -> Result<String, String> {
        self.call("get_file_metrics", &params)
    }

    #[tool(description = "Rollup for a module: file and symbol counts, health, module dependencies, patterns and decisions.")]
    fn get_module_summary(
        &self,
        Parameters(params): Parameters<ModuleSummaryParams>,
    ) -> Result<String, String> {
        self.call("get_module_summary", &params)
    }

    #[tool(description = "Risk score (0-100, higher is safer) for changing one or more files, with the triggered factors per family, a low/medium/high verdict and review recommendations.")]
    fn get_risk_assessment(
        &self,
        Parameters(params): Parameters<RiskAssessmentParams>,
    ) -> Result<String, String> {
        self.call("get_risk_assessment", &params)
    }

    #[tool(description = "Coding patterns and known pitfalls that apply to a file or module, or all of them.")]
    fn get_patterns(
        &self,
        Parameters(params): Parameters<PatternsParams>,
    ) -> Result<String, String> {
        self.call("get_patterns", &params)
    }

    #[tool(description = "Architecture decision records, optionally filtered by module and status.")]
    fn get_architecture_decisions(
        &self,
        Parameters(params): Parameters<DecisionsParams>,
    ) -> Result<String, String> {
        self.call("get_architecture_decisions", &params)
    }
}

#[tool_handler]
impl ServerHandler for RiskGraphServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "riskgraph: code graph and change-risk queries. \
                 Walk callers and callees, compute file impact, read defect history \
                 and score the risk of touching a set of files."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: rmcp::model::Implementation {
                name: "riskgraph".to_string(),
                title: Some("riskgraph MCP server".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
