//! Tenant, source, and metric identity types.
//!
//! Filter state is keyed by `(tenant, metric)`; every other component refers
//! to state through a [`MetricKey`].

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

const TENANT_PATTERN: &str = r"^[a-z0-9][a-z0-9_-]{0,63}$";

fn tenant_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(TENANT_PATTERN).expect("tenant pattern is a valid regex"))
}

/// Tenant identifier.
///
/// Lowercase alphanumerics, `_` and `-`, at most 64 characters. The value is
/// used as a directory name by file-backed stores, so it is validated on parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub const DEFAULT: &'static str = "default";

    /// Parse and validate a tenant identifier.
    pub fn parse(s: &str) -> Option<Self> {
        if tenant_regex().is_match(s) {
            Some(TenantId(s.to_string()))
        } else {
            None
        }
    }

    /// The tenant used when a request does not name one.
    pub fn default_tenant() -> Self {
        TenantId(Self::DEFAULT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::default_tenant()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Data source identifier (e.g. `stripe`, `salesforce`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct SourceId(pub String);

impl SourceId {
    /// Trimmed, non-empty source identifier.
    pub fn parse(s: &str) -> Option<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(SourceId(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        SourceId(s.to_string())
    }
}

/// Business metrics the engine estimates.
///
/// Ratio metrics (churn, conversion) live in `[0, 1]`; magnitude metrics are
/// currency amounts.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Mrr,
    Arr,
    Cac,
    Ltv,
    #[serde(alias = "churn_rate")]
    Churn,
    #[serde(alias = "conversion_rate")]
    Conversion,
}

impl MetricKind {
    pub const ALL: [MetricKind; 6] = [
        MetricKind::Mrr,
        MetricKind::Arr,
        MetricKind::Cac,
        MetricKind::Ltv,
        MetricKind::Churn,
        MetricKind::Conversion,
    ];

    /// Ratio metrics are estimated in `[0, 1]` space.
    pub fn is_ratio(&self) -> bool {
        matches!(self, MetricKind::Churn | MetricKind::Conversion)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Mrr => "mrr",
            MetricKind::Arr => "arr",
            MetricKind::Cac => "cac",
            MetricKind::Ltv => "ltv",
            MetricKind::Churn => "churn",
            MetricKind::Conversion => "conversion",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mrr" => Ok(MetricKind::Mrr),
            "arr" => Ok(MetricKind::Arr),
            "cac" => Ok(MetricKind::Cac),
            "ltv" => Ok(MetricKind::Ltv),
            "churn" | "churn_rate" => Ok(MetricKind::Churn),
            "conversion" | "conversion_rate" => Ok(MetricKind::Conversion),
            other => Err(format!("unknown metric: {other}")),
        }
    }
}

/// Unit of independent mutation: one filter per `(tenant, metric)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricKey {
    pub tenant: TenantId,
    pub metric: MetricKind,
}

impl MetricKey {
    pub fn new(tenant: TenantId, metric: MetricKind) -> Self {
        Self { tenant, metric }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.metric)
    }
}
