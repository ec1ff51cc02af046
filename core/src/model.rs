//! Closed vocabularies shared by the store, the engines and the query surface.
//!
//! Every vocabulary is a plain enum plus one lookup table mapping variants to
//! their stored string form; parsing and printing both go through the table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

macro_rules! vocabulary {
    (
        $(#[$meta:meta])*
        $name:ident (fallback = $fallback:ident) {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const TABLE: &'static [($name, &'static str)] = &[$(($name::$variant, $text)),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            /// Case-insensitive lookup; `None` for unknown names.
            pub fn lookup(s: &str) -> Option<Self> {
                let needle = s.trim();
                Self::TABLE
                    .iter()
                    .find(|(_, text)| text.eq_ignore_ascii_case(needle))
                    .map(|(variant, _)| *variant)
            }

            /// Lenient parse used for rows written by older extractors.
            pub fn parse_lenient(s: &str) -> Self {
                Self::lookup(s).unwrap_or($name::$fallback)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = GraphError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::lookup(s).ok_or_else(|| {
                    GraphError::InvalidArgument(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        s
                    ))
                })
            }
        }
    };
}

vocabulary! {
    /// Kind of a named code entity.
    SymbolKind (fallback = Variable) {
        Function => "function",
        Method => "method",
        Struct => "struct",
        Class => "class",
        Enum => "enum",
        Union => "union",
        Typedef => "typedef",
        Macro => "macro",
        Variable => "variable",
        Constant => "constant",
        Interface => "interface",
        Trait => "trait",
        Module => "module",
        Namespace => "namespace",
        Property => "property",
        Field => "field",
        Parameter => "parameter",
    }
}

impl SymbolKind {
    pub fn is_callable(self) -> bool {
        matches!(self, SymbolKind::Function | SymbolKind::Method)
    }

    /// Preference order when a bare name resolves to several symbols.
    pub fn resolution_rank(self) -> u8 {
        match self {
            SymbolKind::Function => 0,
            SymbolKind::Method => 1,
            SymbolKind::Class | SymbolKind::Struct | SymbolKind::Trait | SymbolKind::Interface => 2,
            _ => 3,
        }
    }
}

vocabulary! {
    /// Type of a symbol-to-symbol edge.
    RelationType (fallback = References) {
        Calls => "calls",
        Includes => "includes",
        Imports => "imports",
        UsesType => "uses_type",
        ReturnsType => "returns_type",
        HasParamType => "has_param_type",
        Inherits => "inherits",
        Implements => "implements",
        UsesVariable => "uses_variable",
        Modifies => "modifies",
        Reads => "reads",
        Instantiates => "instantiates",
        UsesMacro => "uses_macro",
        Contains => "contains",
        References => "references",
        Defines => "defines",
        Declares => "declares",
    }
}

vocabulary! {
    /// Type of a file-to-file edge.
    FileRelationType (fallback = Includes) {
        Includes => "includes",
        Imports => "imports",
    }
}

vocabulary! {
    /// Defect severity, most severe first.
    Severity (fallback = Medium) {
        Critical => "critical",
        High => "high",
        Medium => "medium",
        Low => "low",
        Info => "info",
    }
}

impl Severity {
    /// Higher is more severe.
    pub fn rank(self) -> u8 {
        match self {
            Severity::Critical => 4,
            Severity::High => 3,
            Severity::Medium => 2,
            Severity::Low => 1,
            Severity::Info => 0,
        }
    }

    /// Severities at or above `self`, for "minimum severity" filters.
    pub fn at_least(self) -> Vec<Severity> {
        Severity::TABLE
            .iter()
            .map(|(s, _)| *s)
            .filter(|s| s.rank() >= self.rank())
            .collect()
    }
}

vocabulary! {
    /// How an indexing pass enumerated its inputs.
    IndexMode (fallback = Incremental) {
        Full => "full",
        Incremental => "incremental",
    }
}

vocabulary! {
    /// Why a file appears in an impact result.
    ImpactReason (fallback = DirectCall) {
        DirectCall => "direct_call",
        TransitiveCall => "transitive_call",
        Include => "include",
    }
}
