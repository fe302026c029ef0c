use serde::{Deserialize, Serialize};

/// Remote verdict for one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateStatus {
    Success,
    Failed,
    Hold,
    Unknown,
}

impl GateStatus {
    /// Case-insensitive mapping of the wire value.
    ///
    /// Any other non-empty value (e.g. `RELEASE`) is a terminal success.
    pub fn from_wire(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return GateStatus::Unknown;
        };
        match raw.to_ascii_uppercase().as_str() {
            "FAILED" => GateStatus::Failed,
            "HOLD" => GateStatus::Hold,
            "UNKNOWN" | "NULL" => GateStatus::Unknown,
            _ => GateStatus::Success,
        }
    }
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateStatus::Success => write!(f, "SUCCESS"),
            GateStatus::Failed => write!(f, "FAILED"),
            GateStatus::Hold => write!(f, "HOLD"),
            GateStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
}

impl SeverityCounts {
    pub fn any_positive(&self) -> bool {
        self.critical > 0 || self.high > 0 || self.medium > 0 || self.low > 0
    }

    /// Labelled counts in reporting order
    pub fn labelled(&self) -> [(u64, &'static str); 4] {
        [
            (self.critical, "Critical"),
            (self.high, "High"),
            (self.medium, "Medium"),
            (self.low, "Low"),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskCounts {
    pub very_poor: u64,
    pub poor: u64,
    pub fair: u64,
    pub good: u64,
}

impl RiskCounts {
    pub fn any_positive(&self) -> bool {
        self.very_poor > 0 || self.poor > 0 || self.fair > 0 || self.good > 0
    }

    pub fn labelled(&self) -> [(u64, &'static str); 4] {
        [
            (self.very_poor, "Very Poor"),
            (self.poor, "Poor"),
            (self.fair, "Fair"),
            (self.good, "Good"),
        ]
    }
}

/// Typed view of one validation response. Produced fresh per attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResponse {
    pub status: GateStatus,
    /// Status text exactly as the service sent it (`UNKNOWN` when absent)
    pub raw_status: String,
    pub severity: Option<SeverityCounts>,
    pub risk: Option<RiskCounts>,
    pub failure_reason: Option<String>,
    pub details_link: Option<String>,
}

impl GateResponse {
    pub fn is_severity_based(&self) -> bool {
        self.severity.is_some_and(|s| s.any_positive())
    }

    pub fn is_risk_based(&self) -> bool {
        self.risk.is_some_and(|r| r.any_positive())
    }
}

/// Local policy for a FAILED verdict
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Block,
    Warn,
}

impl Mode {
    /// `warn` (any case) selects Warn; everything else, including unset, blocks.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("warn") => Mode::Warn,
            _ => Mode::Block,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Block => write!(f, "block"),
            Mode::Warn => write!(f, "warn"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateResult {
    Pass,
    Fail,
    Degraded,
}

/// Terminal result of one pipeline invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub result: GateResult,
    pub applied_mode: Mode,
    pub attempts_used: u32,
    pub last_status: GateStatus,
    /// Rendered failure explanation for FAIL / DEGRADED
    pub explanation: Option<String>,
}

impl GateOutcome {
    /// Only a blocked verdict stops the pipeline.
    pub fn halts_pipeline(&self) -> bool {
        self.result == GateResult::Fail
    }

    /// Degraded invocations continue but are not clean.
    pub fn is_clean(&self) -> bool {
        self.result == GateResult::Pass
    }
}

/// Build identity reported to the service and used in detail links
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildIdentity {
    pub build_number: String,
    pub job_name: String,
    pub job_url: String,
}

/// One validation request. Immutable per attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateRequest {
    pub product: String,
    pub sub_products: Vec<String>,
    pub environment: String,
    pub build: BuildIdentity,
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Sub-products as callers supply them
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SubProductsInput {
    List(Vec<String>),
    /// One sub-product per line
    Text(String),
    Empty,
}

impl SubProductsInput {
    pub fn materialize(&self) -> Vec<String> {
        let clean = |s: &str| Some(s.trim().to_string()).filter(|s| !s.is_empty());
        match self {
            SubProductsInput::List(items) => items.iter().filter_map(|s| clean(s)).collect(),
            SubProductsInput::Text(text) => text.lines().filter_map(clean).collect(),
            SubProductsInput::Empty => Vec::new(),
        }
    }

    /// The input as recorded in run metadata: text verbatim, lists as `[a, b]`.
    pub fn recorded_text(&self) -> String {
        match self {
            SubProductsInput::List(items) => format!("[{}]", items.join(", ")),
            SubProductsInput::Text(text) => text.clone(),
            SubProductsInput::Empty => String::new(),
        }
    }
}

impl From<Option<String>> for SubProductsInput {
    fn from(value: Option<String>) -> Self {
        value.map(SubProductsInput::Text).unwrap_or(SubProductsInput::Empty)
    }
}
