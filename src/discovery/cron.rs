//! Cron handling
//!
//! Operators write 5-field, Jenkins-flavoured expressions (`H H * * *`). The
//! `cron` crate wants a seconds field, no `H` tokens, and counts weekdays
//! from Sunday = 1, so expressions are normalized before evaluation.

use std::str::FromStr;

use cron::Schedule;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Seed for `H` tokens. Stable so the same expression always lands on the same slot.
const HASH_SEED: &str = "armorcode-job-discovery";

/// (min, max) per 5-field position. Day of month stops at 28 so `H` is valid every month.
const FIELD_RANGES: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 28), (1, 12), (0, 6)];

/// Bounds an explicit `H(a-b)` range must stay within.
const FIELD_LIMITS: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 7)];

const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("cron expression is empty")]
    Empty,
    #[error("invalid cron expression '{expression}': {message}")]
    Invalid { expression: String, message: String },
}

/// Parse a (possibly Jenkins-style) expression into a [`Schedule`].
pub fn parse_schedule(expression: &str) -> Result<Schedule, ScheduleError> {
    if expression.trim().is_empty() {
        return Err(ScheduleError::Empty);
    }
    let normalized = normalize(expression)?;
    Schedule::from_str(&normalized).map_err(|e| ScheduleError::Invalid {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

/// Rewrite into the 6-field dialect of the `cron` crate.
pub fn normalize(expression: &str) -> Result<String, ScheduleError> {
    let trimmed = expression.trim();
    if trimmed.starts_with('@') {
        return Ok(match trimmed.to_ascii_lowercase().as_str() {
            "@midnight" => "@daily".to_string(),
            other => other.to_string(),
        });
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    if fields.len() != 5 {
        // Already carries seconds (and maybe years)
        return Ok(trimmed.to_string());
    }

    let digest = Sha256::digest(HASH_SEED.as_bytes());
    let mut out = Vec::with_capacity(6);
    out.push("0".to_string());

    for (idx, field) in fields.iter().enumerate() {
        let seed = u32::from(u16::from_be_bytes([digest[idx * 2], digest[idx * 2 + 1]]));
        let (lo, hi) = FIELD_RANGES[idx];
        let mut parts = Vec::new();
        for token in field.split(',') {
            let token = if token.starts_with('H') {
                resolve_hash(token, (lo, hi), FIELD_LIMITS[idx], seed).ok_or_else(|| ScheduleError::Invalid {
                    expression: expression.to_string(),
                    message: format!("bad hash token '{}'", token),
                })?
            } else {
                token.to_string()
            };
            parts.push(if idx == 4 { weekday_names(&token) } else { token });
        }
        out.push(parts.join(","));
    }

    Ok(out.join(" "))
}

/// `H`, `H(a-b)`, `H/n`, `H(a-b)/n`
fn resolve_hash(token: &str, (lo, hi): (u32, u32), limits: (u32, u32), seed: u32) -> Option<String> {
    let rest = &token[1..];
    let (range, step) = match rest.split_once('/') {
        Some((range, step)) => (range, Some(step.parse::<u32>().ok().filter(|s| *s > 0)?)),
        None => (rest, None),
    };

    let (lo, hi) = if range.is_empty() {
        (lo, hi)
    } else {
        let inner = range.strip_prefix('(')?.strip_suffix(')')?;
        let (a, b) = inner.split_once('-')?;
        let (a, b) = (a.trim().parse::<u32>().ok()?, b.trim().parse::<u32>().ok()?);
        if a > b || a < limits.0 || b > limits.1 {
            return None;
        }
        (a, b)
    };

    let span = (hi - lo).checked_add(1)?;
    Some(match step {
        None => (lo + seed % span).to_string(),
        Some(step) => {
            let start = lo + seed % step.min(span);
            format!("{}-{}/{}", start, hi, step)
        }
    })
}

/// Numeric weekdays (0/7 = Sunday) to names
fn weekday_names(token: &str) -> String {
    let (range, step) = match token.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (token, None),
    };
    let name = |n: &str| n.parse::<usize>().ok().and_then(|n| WEEKDAYS.get(n).copied());

    let mapped = match range.split_once('-') {
        Some((a, b)) => match (name(a), name(b)) {
            // Ranges ending on the trailing Sunday wrap past SAT
            (Some(start), Some(_)) if b == "7" && step.is_none() => {
                if a == "0" {
                    "*".to_string()
                } else {
                    format!("{}-SAT,SUN", start)
                }
            }
            (Some(start), Some(end)) => format!("{}-{}", start, end),
            _ => range.to_string(),
        },
        None => name(range).map(str::to_string).unwrap_or_else(|| range.to_string()),
    };

    match step {
        Some(step) => format!("{}/{}", mapped, step),
        None => mapped,
    }
}

/// More often than once per hour. Mirrors what the settings form rejects.
pub fn is_too_frequent(expression: &str) -> bool {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() < 5 {
        return false;
    }
    let minutes = fields[0];

    if let Some(step) = minutes.strip_prefix("*/").or_else(|| minutes.strip_prefix("H/")) {
        if let Ok(step) = step.parse::<u32>() {
            return step < 60;
        }
    }
    minutes.contains(',') || minutes.contains('-') || minutes == "*"
}
