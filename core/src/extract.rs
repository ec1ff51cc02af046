use std::path::PathBuf;
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::db::NewSymbol;
use crate::error::{GraphError, Result};
use crate::model::{FileRelationType, RelationType};

// ---------------------------------------------------------------------------
// Extraction output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineCounts {
    pub total: i64,
    pub code: i64,
    pub comment: i64,
    pub blank: i64,
}

impl LineCounts {
    /// Rough line classification used when the extractor does not report counts.
    pub fn from_source(source: &[u8]) -> Self {
        let text = String::from_utf8_lossy(source);
        let mut counts = LineCounts::default();
        let mut in_block = false;
        for line in text.lines() {
            counts.total += 1;
            let t = line.trim();
            if t.is_empty() {
                counts.blank += 1;
            } else if in_block {
                counts.comment += 1;
                if t.contains("*/") {
                    in_block = false;
                }
            } else if t.starts_with("/*") {
                counts.comment += 1;
                in_block = !t.contains("*/");
            } else if t.starts_with("//")
                || (t.starts_with('#') && !t.starts_with("#include") && !t.starts_with("#define"))
            {
                counts.comment += 1;
            } else {
                counts.code += 1;
            }
        }
        counts
    }
}

/// A reference from one extracted symbol to a target identified by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    /// Index of the referencing symbol in `Extraction::symbols`.
    pub from: usize,
    /// Target symbol name (plain or qualified).
    pub to: String,
    /// Repository-relative path that defines the target, when known.
    #[serde(default)]
    pub to_file: Option<String>,
    #[serde(default = "default_relation")]
    pub relation_type: RelationType,
    #[serde(default)]
    pub line: Option<i64>,
    #[serde(default)]
    pub column: Option<i64>,
    #[serde(default = "default_count")]
    pub count: i64,
    #[serde(default)]
    pub is_conditional: bool,
}

fn default_relation() -> RelationType {
    RelationType::Calls
}

fn default_count() -> i64 {
    1
}

/// A file-level include/import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Import {
    /// Repository-relative path of the included file.
    pub path: String,
    #[serde(default = "default_import")]
    pub relation_type: FileRelationType,
    #[serde(default)]
    pub line: Option<i64>,
}

fn default_import() -> FileRelationType {
    FileRelationType::Includes
}

/// Everything the extractor knows about one file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Extraction {
    pub language: Option<String>,
    pub lines: Option<LineCounts>,
    pub symbols: Vec<NewSymbol>,
    pub references: Vec<Reference>,
    pub imports: Vec<Import>,
}

// ---------------------------------------------------------------------------
// Adapter seam
// ---------------------------------------------------------------------------

/// Turns source text into symbols and references. Implementations must be
/// deterministic for a given `(path, source)`.
pub trait Extractor: Send + Sync {
    fn extract(&self, path: &str, source: &[u8]) -> Result<Extraction>;
}

/// Runs an external extractor once per file: `argv... <absolute path>`,
/// reading an `Extraction` as JSON from stdout.
pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
    root: PathBuf,
}

impl CommandExtractor {
    pub fn new(argv: &[String], root: PathBuf) -> Result<Self> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            GraphError::InvalidArgument("extraction command is not configured".into())
        })?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            root,
        })
    }
}

impl Extractor for CommandExtractor {
    fn extract(&self, path: &str, _source: &[u8]) -> Result<Extraction> {
        let abs = self.root.join(path);
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&abs)
            .output()
            .map_err(|e| GraphError::Extraction {
                path: path.to_string(),
                message: format!("failed to run {}: {e}", self.program),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GraphError::Extraction {
                path: path.to_string(),
                message: format!("{} exited with {}: {}", self.program, output.status, stderr.trim()),
            });
        }
        serde_json::from_slice(&output.stdout).map_err(|e| GraphError::Extraction {
            path: path.to_string(),
            message: format!("invalid extractor output: {e}"),
        })
    }
}
