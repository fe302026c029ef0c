//! Truncation Utilities
//!
//! Keeps remote error bodies short enough for console and log lines while
//! respecting UTF-8 boundaries.

/// Bodies longer than this are cut when attached to errors
pub const ERROR_BODY_LIMIT: usize = 500;

/// Keep the first `max_bytes` of `content`, marking what was dropped.
pub fn truncate_text(content: &str, max_bytes: usize) -> String {
    if content.len() <= max_bytes {
        return content.to_string();
    }

    let mut end = 0;
    for (idx, c) in content.char_indices() {
        let char_end = idx + c.len_utf8();
        if char_end > max_bytes {
            break;
        }
        end = char_end;
    }

    format!("{}... [{} bytes truncated]", &content[..end], content.len() - end)
}

/// Shorthand for bodies attached to [`crate::gate::GateError`]s.
pub fn truncate_body(body: &str) -> String {
    truncate_text(body.trim(), ERROR_BODY_LIMIT)
}
