//! Output format selection for CLI results.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How command results are rendered on stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Single-line JSON.
    #[default]
    Json,
    /// Indented JSON.
    Pretty,
    /// YAML document.
    Yaml,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Pretty => write!(f, "pretty"),
            OutputFormat::Yaml => write!(f, "yaml"),
        }
    }
}
