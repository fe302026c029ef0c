//! Response Classifier
//!
//! Turns raw validation bodies into a typed [`GateResponse`] and renders the
//! failure explanation shown on the invocation console.

use serde_json::{Map, Value};

use super::error::GateError;
use super::types::{GateResponse, GateStatus, RiskCounts, SeverityCounts};

pub const DEFAULT_DETAILS_LINK: &str = "https://app.armorcode.com/client/integrations/jenkins";
pub const DEFAULT_REASON: &str = "SLA check failed";

/// Fields of the invocation that appear in an explanation
#[derive(Debug, Clone, Default)]
pub struct ExplainContext {
    pub product: String,
    pub sub_products: String,
    pub environment: String,
    pub build_number: String,
    pub job_name: String,
}

/// Parse one response body.
///
/// Anything that is not a JSON object is a protocol error.
pub fn classify(raw: &str) -> Result<GateResponse, GateError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| GateError::Protocol(format!("response is not valid JSON: {}", e)))?;
    let Value::Object(obj) = value else {
        return Err(GateError::Protocol("response is not a JSON object".to_string()));
    };

    let wire_status = obj.get("status").and_then(as_text);
    let status = GateStatus::from_wire(wire_status.as_deref());
    let raw_status = wire_status
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "UNKNOWN".to_string());

    let severity = read_counts(&obj, "severity", &["Critical", "High", "Medium", "Low"]).map(|c| {
        SeverityCounts { critical: c[0], high: c[1], medium: c[2], low: c[3] }
    });
    let risk = read_counts(&obj, "otherProperties", &["VERY_POOR", "POOR", "FAIR", "GOOD"]).map(|c| {
        RiskCounts { very_poor: c[0], poor: c[1], fair: c[2], good: c[3] }
    });

    let failure_reason = obj
        .get("failureReasonText")
        .and_then(as_text)
        .filter(|s| !s.is_empty() && s != "null");

    let details_link = obj
        .get("detailsLink")
        .and_then(as_text)
        .or_else(|| obj.get("link").and_then(as_text))
        .filter(|s| !s.is_empty() && s != "null");

    Ok(GateResponse { status, raw_status, severity, risk, failure_reason, details_link })
}

/// Render the multi-line failure explanation.
pub fn explain(ctx: &ExplainContext, response: &GateResponse) -> String {
    let mut message = String::new();
    message.push_str(&format!("Group: {}\n", ctx.product));
    message.push_str(&format!("Sub Group: {}\n", ctx.sub_products));
    message.push_str(&format!("Environment: {}\n", ctx.environment));

    // Severity wins when both kinds carry findings
    let scope: Vec<String> = if let Some(sev) = response.severity.filter(|s| s.any_positive()) {
        render_scope(&sev.labelled())
    } else if let Some(risk) = response.risk.filter(|r| r.any_positive()) {
        render_scope(&risk.labelled())
    } else {
        Vec::new()
    };

    if scope.is_empty() {
        message.push_str("Findings Scope: No findings detected\n");
    } else {
        message.push_str(&format!("Findings Scope: {}\n", scope.join(", ")));
    }

    let reason = response.failure_reason.as_deref().unwrap_or(DEFAULT_REASON);
    message.push_str(&format!("Reason: {}\n", reason));
    message.push_str(&format!(
        "For more details, please refer to: {}",
        details_link(response.details_link.as_deref(), &ctx.build_number, &ctx.job_name)
    ));
    message
}

/// Link to the findings filtered down to this build.
pub fn details_link(base: Option<&str>, build_number: &str, job_name: &str) -> String {
    let base = base.unwrap_or(DEFAULT_DETAILS_LINK);
    let separator = if base.contains('?') { '&' } else { '?' };
    let filter = serde_json::json!({
        "buildNumber": [build_number],
        "jobName": [job_name],
    });
    // Form encoding: spaces become '+'
    let encoded = urlencoding::encode(&filter.to_string()).replace("%20", "+");
    format!("{}{}filters={}", base, separator, encoded)
}

fn render_scope(counts: &[(u64, &'static str)]) -> Vec<String> {
    counts
        .iter()
        .filter(|(n, _)| *n > 0)
        .map(|(n, label)| format!("{} {}", n, label))
        .collect()
}

/// Nested object first, flattened dotted keys otherwise.
fn read_counts(obj: &Map<String, Value>, prefix: &str, keys: &[&str; 4]) -> Option<[u64; 4]> {
    if let Some(Value::Object(nested)) = obj.get(prefix) {
        return Some(keys.map(|k| nested.get(k).map(as_count).unwrap_or(0)));
    }

    let flattened = keys.map(|k| obj.get(&format!("{}.{}", prefix, k)));
    if flattened.iter().all(Option::is_none) {
        return None;
    }
    Some(flattened.map(|v| v.map(as_count).unwrap_or(0)))
}

fn as_count(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse::<i64>().map(|n| n.max(0) as u64).unwrap_or(0),
        _ => 0,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
