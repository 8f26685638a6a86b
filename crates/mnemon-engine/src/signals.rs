use chrono::{DateTime, Duration, Utc};
use mnemon_types::{EntryPayload, Outcome, SessionEntry, ToolOp};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;

/// Friction observed inside one segment. Each field is a raw count or rate;
/// `score()` folds them into a weighted [0,1] value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrictionSignals {
    /// Runs of >=3 consecutive user messages without a meaningful reply.
    pub rephrasing_cascades: u32,
    /// Same tool failing with the same error kind >=3 times in a row.
    pub tool_loops: u32,
    /// Distinct files hit by read/list operations relative to segment size.
    pub context_churn: f64,
    /// Segment is the session tail and stops mid-task.
    pub silent_termination: bool,
    pub model_switches: u32,
    pub manual_flags: u32,
}

impl FrictionSignals {
    pub fn score(&self) -> f64 {
        let mut score = 0.0;
        score += 0.25 * self.rephrasing_cascades.min(3) as f64;
        score += 0.25 * self.tool_loops.min(3) as f64;
        if self.context_churn > 0.3 {
            score += 0.2;
        }
        if self.silent_termination {
            score += 0.3;
        }
        score += 0.1 * self.model_switches.min(3) as f64;
        score += 0.3 * self.manual_flags.min(2) as f64;
        score.min(1.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelightSignals {
    /// Tool error auto-fixed (no user intervention) then succeeding.
    pub resilient_recoveries: u32,
    /// Single ask, several tool calls, zero corrections, clean finish.
    pub one_shot_success: bool,
    pub praise_count: u32,
}

impl DelightSignals {
    pub fn score(&self) -> f64 {
        let mut score = 0.0;
        score += 0.4 * self.resilient_recoveries.min(2) as f64;
        if self.one_shot_success {
            score += 0.5;
        }
        score += 0.2 * self.praise_count.min(2) as f64;
        score.min(1.0)
    }
}

fn praise_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(thanks|thank you|perfect|great|awesome|excellent|nice work)\b")
            .expect("praise pattern is valid")
    })
}

/// Extract friction signals for one segment. `is_session_tail` marks the
/// final segment of the file, the only place silent termination can occur.
pub fn extract_friction(entries: &[SessionEntry], is_session_tail: bool) -> FrictionSignals {
    let mut signals = FrictionSignals::default();

    // Rephrasing cascades: user messages piling up with no substantive
    // assistant text in between.
    let mut consecutive_users = 0u32;
    let mut cascade_open = false;
    for entry in entries {
        match &entry.payload {
            EntryPayload::User(_) => {
                consecutive_users += 1;
                if consecutive_users >= 3 && !cascade_open {
                    signals.rephrasing_cascades += 1;
                    cascade_open = true;
                }
            }
            EntryPayload::Assistant(reply) if !reply.text.trim().is_empty() => {
                consecutive_users = 0;
                cascade_open = false;
            }
            _ => {}
        }
    }

    // Tool loops: identical (tool, error kind) failures back to back.
    let mut run_key: Option<(String, String)> = None;
    let mut run_len = 0u32;
    let mut loop_counted = false;
    for entry in entries {
        if let EntryPayload::ToolResult(result) = &entry.payload {
            if result.is_error {
                let key = (
                    result.tool.clone(),
                    result.error_kind.clone().unwrap_or_default(),
                );
                if run_key.as_ref() == Some(&key) {
                    run_len += 1;
                } else {
                    run_key = Some(key);
                    run_len = 1;
                    loop_counted = false;
                }
                if run_len >= 3 && !loop_counted {
                    signals.tool_loops += 1;
                    loop_counted = true;
                }
            } else {
                run_key = None;
                run_len = 0;
                loop_counted = false;
            }
        }
    }

    // Context churn: breadth of read/list traffic relative to segment size.
    let mut distinct_reads: HashSet<&str> = HashSet::new();
    for entry in entries {
        if let EntryPayload::ToolResult(result) = &entry.payload {
            if matches!(result.op, Some(ToolOp::Read) | Some(ToolOp::List)) {
                if let Some(path) = result.file_path.as_deref() {
                    distinct_reads.insert(path);
                }
            }
        }
    }
    signals.context_churn = distinct_reads.len() as f64 / entries.len().max(1) as f64;

    if is_session_tail {
        signals.silent_termination = entries
            .last()
            .map(|entry| !matches!(entry.payload, EntryPayload::Assistant(_)))
            .unwrap_or(false);
    }

    for entry in entries {
        match &entry.payload {
            EntryPayload::ModelChange(_) => signals.model_switches += 1,
            EntryPayload::Label(label) if label.text.to_lowercase().contains("friction") => {
                signals.manual_flags += 1;
            }
            _ => {}
        }
    }

    signals
}

pub fn extract_delight(entries: &[SessionEntry]) -> DelightSignals {
    let mut signals = DelightSignals::default();

    // Resilient recovery: tool error then a success of the same tool with no
    // user message in between.
    let mut failed_tool: Option<String> = None;
    for entry in entries {
        match &entry.payload {
            EntryPayload::ToolResult(result) if result.is_error => {
                failed_tool = Some(result.tool.clone());
            }
            EntryPayload::ToolResult(result) => {
                if failed_tool.as_deref() == Some(result.tool.as_str()) {
                    signals.resilient_recoveries += 1;
                }
                failed_tool = None;
            }
            EntryPayload::User(_) => failed_tool = None,
            _ => {}
        }
    }

    let user_messages = entries
        .iter()
        .filter(|e| matches!(e.payload, EntryPayload::User(_)))
        .count();
    let tool_calls = entries
        .iter()
        .filter(|e| matches!(e.payload, EntryPayload::ToolResult(_)))
        .count();
    let tool_errors = entries
        .iter()
        .filter(|e| matches!(&e.payload, EntryPayload::ToolResult(r) if r.is_error))
        .count();
    let ends_with_reply = matches!(
        entries.last().map(|e| &e.payload),
        Some(EntryPayload::Assistant(_))
    );

    signals.one_shot_success =
        user_messages == 1 && tool_calls >= 3 && tool_errors == 0 && ends_with_reply;

    for entry in entries {
        if let EntryPayload::User(user) = &entry.payload {
            if praise_pattern().is_match(&user.text) {
                signals.praise_count += 1;
            }
        }
    }

    signals
}

/// Inputs for recognizing that a new segment restarts work a prior segment
/// abandoned.
#[derive(Debug, Clone)]
pub struct RestartCandidate<'a> {
    pub prior_outcome: Outcome,
    pub prior_end: DateTime<Utc>,
    pub new_start: DateTime<Utc>,
    pub prior_files: &'a [String],
    pub new_files: &'a [String],
}

const RESTART_WINDOW_MINUTES: i64 = 30;
const RESTART_MIN_OVERLAP: f64 = 0.3;

/// True when a segment looks like a retry of abandoned work: abandoned
/// outcome, restarted within 30 minutes, file-touch overlap >= 30% (Jaccard).
pub fn is_abandoned_restart(candidate: &RestartCandidate<'_>) -> bool {
    if candidate.prior_outcome != Outcome::Abandoned {
        return false;
    }

    let gap = candidate.new_start.signed_duration_since(candidate.prior_end);
    if gap < Duration::zero() || gap > Duration::minutes(RESTART_WINDOW_MINUTES) {
        return false;
    }

    let prior: HashSet<&str> = candidate.prior_files.iter().map(String::as_str).collect();
    let new: HashSet<&str> = candidate.new_files.iter().map(String::as_str).collect();
    if prior.is_empty() || new.is_empty() {
        return false;
    }

    let intersection = prior.intersection(&new).count() as f64;
    let union = prior.union(&new).count() as f64;
    intersection / union >= RESTART_MIN_OVERLAP
}
