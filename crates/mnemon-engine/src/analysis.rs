use crate::{Error, Result};
use mnemon_types::{
    Decision, EdgeKind, Lesson, ModelQuirk, NodeType, Outcome, ToolErrorStat,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Structured result the analyzer subprocess emits for one segment. This is
/// the agent-facing shape; the worker grafts identity and source onto it to
/// form a full `Node`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisPayload {
    pub summary: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub outcome: Outcome,
    #[serde(default)]
    pub had_clear_goal: bool,
    #[serde(default)]
    pub is_new_project: bool,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub lessons: Vec<Lesson>,
    #[serde(default)]
    pub quirks: Vec<ModelQuirk>,
    #[serde(default)]
    pub tool_errors: Vec<ToolErrorStat>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub duration_minutes: f64,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub relationships: Vec<AnalysisRelationship>,
    /// Fields we do not model; preserved verbatim into the document.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Relationship the analyzer declares from the analyzed segment to other
/// work. `target` is a concrete node ID when the analyzer resolved one;
/// otherwise `description` carries the free-text hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRelationship {
    pub kind: EdgeKind,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Decoded agent stdout: every line that parsed as JSON, in order, plus the
/// accepted node payload if any event (or raw-text fallback) carried one.
#[derive(Debug, Clone, Default)]
pub struct ParsedAgentOutput {
    pub events: Vec<Value>,
    pub payload: Option<AnalysisPayload>,
}

/// Two-stage parse of agent stdout. Stage one decodes newline-delimited JSON
/// events, tolerating garbage lines. Stage two picks the last event whose
/// body validates as a node payload; when no event qualifies, the raw text is
/// scanned for JSON objects (bare or inside fenced code blocks).
pub fn parse_agent_output(stdout: &str) -> ParsedAgentOutput {
    let mut events = Vec::new();

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(line) {
            events.push(value);
        }
    }

    let mut payload = None;
    for event in events.iter().rev() {
        let candidate = event.get("node").unwrap_or(event);
        if let Ok(parsed) = validate_payload(candidate) {
            payload = Some(parsed);
            break;
        }
    }

    if payload.is_none() {
        payload = scan_raw_for_payload(stdout);
    }

    ParsedAgentOutput { events, payload }
}

/// Minimal schema gate before deserialization: the required scalar fields
/// must exist with the right shapes, and collection fields must be arrays
/// when present.
pub fn validate_payload(value: &Value) -> Result<AnalysisPayload> {
    let object = value
        .as_object()
        .ok_or_else(|| Error::Validation("payload is not an object".into()))?;

    let summary = object
        .get("summary")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Validation("missing required field: summary".into()))?;
    if summary.trim().is_empty() {
        return Err(Error::Validation("summary is empty".into()));
    }

    let node_type = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Validation("missing required field: type".into()))?;
    if NodeType::parse(node_type).is_none() {
        return Err(Error::Validation(format!("unknown type: {}", node_type)));
    }

    let outcome = object
        .get("outcome")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Validation("missing required field: outcome".into()))?;
    if Outcome::parse(outcome).is_none() {
        return Err(Error::Validation(format!("unknown outcome: {}", outcome)));
    }

    for field in ["decisions", "lessons", "quirks", "toolErrors", "relationships"] {
        if let Some(v) = object.get(field) {
            if !v.is_array() {
                return Err(Error::Validation(format!("{} must be an array", field)));
            }
        }
    }

    serde_json::from_value(value.clone())
        .map_err(|e| Error::Validation(format!("payload deserialization: {}", e)))
}

/// Fallback extraction from non-NDJSON output: fenced ```json blocks first,
/// then any balanced top-level JSON objects in the raw text. The last valid
/// payload wins.
fn scan_raw_for_payload(raw: &str) -> Option<AnalysisPayload> {
    let mut found = None;

    for block in extract_fenced_blocks(raw) {
        if let Ok(value) = serde_json::from_str::<Value>(&block) {
            if let Ok(payload) = validate_payload(&value) {
                found = Some(payload);
            }
        }
    }
    if found.is_some() {
        return found;
    }

    for span in extract_json_spans(raw) {
        if let Ok(value) = serde_json::from_str::<Value>(span) {
            if let Ok(payload) = validate_payload(&value) {
                found = Some(payload);
            }
        }
    }

    found
}

fn extract_fenced_blocks(raw: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut inside = false;
    let mut current = String::new();

    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            if inside {
                blocks.push(std::mem::take(&mut current));
            }
            inside = !inside;
            continue;
        }
        if inside {
            current.push_str(line);
            current.push('\n');
        }
    }

    blocks
}

/// Balanced `{...}` spans at any position, ignoring braces inside strings.
fn extract_json_spans(raw: &str) -> Vec<&str> {
    let bytes = raw.as_bytes();
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        spans.push(&raw[start..=i]);
                    }
                }
            }
            _ => {}
        }
    }

    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_payload_json() -> &'static str {
        r#"{"summary":"wired up the cache","type":"coding","outcome":"success"}"#
    }

    #[test]
    fn test_event_stream_prefers_last_valid_payload() {
        let stdout = format!(
            "{}\n{}\n{}\n",
            r#"{"event":"progress","message":"reading"}"#,
            r#"{"event":"result","node":{"summary":"first pass","type":"coding","outcome":"partial"}}"#,
            r#"{"event":"result","node":{"summary":"final pass","type":"coding","outcome":"success"}}"#,
        );
        let parsed = parse_agent_output(&stdout);
        assert_eq!(parsed.events.len(), 3);
        let payload = parsed.payload.unwrap();
        assert_eq!(payload.summary, "final pass");
        assert_eq!(payload.outcome, Outcome::Success);
    }

    #[test]
    fn test_garbage_lines_do_not_fail_parse() {
        let stdout = format!(
            "starting up...\nnot json\n{}\n",
            minimal_payload_json()
        );
        let parsed = parse_agent_output(&stdout);
        assert_eq!(parsed.events.len(), 1);
        assert!(parsed.payload.is_some());
    }

    #[test]
    fn test_fenced_block_fallback() {
        let stdout = format!(
            "Here is the analysis:\n```json\n{}\n```\nthat's all\n",
            minimal_payload_json()
        );
        let parsed = parse_agent_output(&stdout);
        assert_eq!(parsed.payload.unwrap().summary, "wired up the cache");
    }

    #[test]
    fn test_inline_json_fallback() {
        let stdout = format!("prefix text {} suffix", minimal_payload_json());
        let parsed = parse_agent_output(&stdout);
        assert!(parsed.payload.is_some());
    }

    #[test]
    fn test_validation_rejects_missing_fields() {
        let missing_outcome: Value =
            serde_json::from_str(r#"{"summary":"x","type":"coding"}"#).unwrap();
        assert!(validate_payload(&missing_outcome).is_err());

        let empty_summary: Value =
            serde_json::from_str(r#"{"summary":"  ","type":"coding","outcome":"success"}"#)
                .unwrap();
        assert!(validate_payload(&empty_summary).is_err());

        let bad_type: Value =
            serde_json::from_str(r#"{"summary":"x","type":"jazz","outcome":"success"}"#).unwrap();
        assert!(validate_payload(&bad_type).is_err());
    }

    #[test]
    fn test_unknown_fields_preserved_in_extra() {
        let json = r#"{"summary":"x","type":"coding","outcome":"success","vibe":"immaculate"}"#;
        let value: Value = serde_json::from_str(json).unwrap();
        let payload = validate_payload(&value).unwrap();
        assert_eq!(payload.extra.get("vibe").and_then(Value::as_str), Some("immaculate"));
    }

    #[test]
    fn test_relationships_parsed() {
        let json = r#"{
            "summary":"x","type":"coding","outcome":"success",
            "relationships":[
                {"kind":"reference","target":"aabbccddeeff0011","confidence":0.9},
                {"kind":"lesson_application","description":"the retry lesson from last week"}
            ]
        }"#;
        let value: Value = serde_json::from_str(json).unwrap();
        let payload = validate_payload(&value).unwrap();
        assert_eq!(payload.relationships.len(), 2);
        assert_eq!(payload.relationships[0].kind, EdgeKind::Reference);
        assert!(payload.relationships[1].target.is_none());
    }

    #[test]
    fn test_no_payload_yields_none() {
        let parsed = parse_agent_output("just some chatter\nno json here\n");
        assert!(parsed.payload.is_none());
        assert!(parsed.events.is_empty());
    }
}
