use serde::{Deserialize, Serialize};

/// Upper bound on error text persisted with a job.
pub const MAX_STORED_ERROR_BYTES: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Permanent,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

/// A failure after classification: category for retry policy, a stable
/// reason string for observability, and the (truncated) original message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub reason: String,
    pub message: String,
}

impl ClassifiedError {
    /// Retries worth attempting for this failure. Permanent errors get none;
    /// unknown errors get exactly one.
    pub fn recommended_retries(&self) -> u32 {
        match self.category {
            ErrorCategory::Permanent => 0,
            ErrorCategory::Unknown => 1,
            ErrorCategory::Transient => match self.reason.as_str() {
                "rate_limited" | "database_busy" => 5,
                _ => 3,
            },
        }
    }
}

/// Map an error message (including its chained sources, if the caller
/// flattened them in) to a category and a stable reason string.
pub fn classify_error(message: &str) -> ClassifiedError {
    let lower = message.to_lowercase();

    let (category, reason) = if lower.contains("no such file")
        || lower.contains("not found")
        || lower.contains("enoent")
    {
        (ErrorCategory::Permanent, "file_not_found")
    } else if lower.contains("invalid session") || lower.contains("invalid session header") {
        (ErrorCategory::Permanent, "invalid_session")
    } else if lower.contains("missing required skill") {
        (ErrorCategory::Permanent, "missing_skill")
    } else if lower.contains("validation") || lower.contains("schema mismatch") {
        (ErrorCategory::Permanent, "validation")
    } else if lower.contains("timed out") || lower.contains("timeout") || lower.contains("etimedout")
    {
        (ErrorCategory::Transient, "timeout")
    } else if lower.contains("429") || lower.contains("rate limit") || lower.contains("rate-limit")
    {
        (ErrorCategory::Transient, "rate_limited")
    } else if lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("broken pipe")
        || lower.contains("network")
        || lower.contains("econnrefused")
    {
        (ErrorCategory::Transient, "network")
    } else if lower.contains("database is locked") || lower.contains("database busy") {
        (ErrorCategory::Transient, "database_busy")
    } else {
        (ErrorCategory::Unknown, "unknown")
    };

    ClassifiedError {
        category,
        reason: reason.to_string(),
        message: truncate_to_bytes(message, MAX_STORED_ERROR_BYTES),
    }
}

fn truncate_to_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
