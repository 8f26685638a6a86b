use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// First line of a session file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHeader {
    pub version: u32,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session: Option<ParentSessionRef>,
}

/// Reference to the parent session a fork was started from, encoded on the
/// wire as `"<file>@<entryId>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentSessionRef {
    pub file: String,
    pub entry_id: String,
}

impl ParentSessionRef {
    pub fn parse(s: &str) -> Option<Self> {
        let (file, entry_id) = s.rsplit_once('@')?;
        if file.is_empty() || entry_id.is_empty() {
            return None;
        }
        Some(Self {
            file: file.to_string(),
            entry_id: entry_id.to_string(),
        })
    }
}

impl std::fmt::Display for ParentSessionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.file, self.entry_id)
    }
}

impl Serialize for ParentSessionRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ParentSessionRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ParentSessionRef::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("expected '<file>@<entryId>', got '{}'", s)))
    }
}

/// One line of a session file past the header. Entries form a tree via
/// `parent_id`; IDs are unique within a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EntryPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EntryPayload {
    User(UserPayload),
    Assistant(AssistantPayload),
    ToolResult(ToolResultPayload),
    Compaction(CompactionPayload),
    BranchSummary(BranchSummaryPayload),
    ModelChange(ModelChangePayload),
    ThinkingChange(ThinkingChangePayload),
    Marker(MarkerPayload),
    Label(LabelPayload),
    SessionInfo(SessionInfoPayload),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPayload {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantPayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Operation class of a tool invocation, used for file-touch tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOp {
    Read,
    List,
    Write,
    Edit,
    Delete,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultPayload {
    pub tool: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<ToolOp>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompactionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchSummaryPayload {
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelChangePayload {
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingChangePayload {
    pub level: String,
}

/// Custom marker entry. A marker named `handoff` delimits a handoff segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerPayload {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub const HANDOFF_MARKER: &str = "handoff";

impl MarkerPayload {
    pub fn is_handoff(&self) -> bool {
        self.name == HANDOFF_MARKER
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelPayload {
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionInfoPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A session file parsed into header + entries. Lines that failed to decode
/// (other than a trailing partial line) are counted, not kept.
#[derive(Debug, Clone)]
pub struct ParsedSession {
    pub header: SessionHeader,
    pub entries: Vec<SessionEntry>,
    pub skipped_lines: usize,
}

impl ParsedSession {
    /// Latest entry that no other entry names as its parent.
    pub fn leaf_entry_id(&self) -> Option<&str> {
        leaf_entry_id(&self.entries)
    }

    /// Computer name advertised by the most recent session_info entry.
    pub fn computer(&self) -> Option<&str> {
        self.entries.iter().rev().find_map(|e| match &e.payload {
            EntryPayload::SessionInfo(info) => info.computer.as_deref(),
            _ => None,
        })
    }
}

pub fn leaf_entry_id(entries: &[SessionEntry]) -> Option<&str> {
    let parents: HashSet<&str> = entries
        .iter()
        .filter_map(|e| e.parent_id.as_deref())
        .collect();

    entries
        .iter()
        .rev()
        .find(|e| !parents.contains(e.id.as_str()))
        .map(|e| e.id.as_str())
}

/// Read a session file. The first non-empty line must be a valid header;
/// entry lines that fail to parse are skipped, and a trailing partial line
/// is tolerated silently.
pub fn read_session_file(path: &Path) -> Result<ParsedSession> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);

    let mut header: Option<SessionHeader> = None;
    let mut entries = Vec::new();
    let mut skipped = 0usize;
    let mut pending_bad_line = false;

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if header.is_none() {
            let parsed: SessionHeader = serde_json::from_str(line)
                .map_err(|e| Error::Header(format!("{}: {}", path.display(), e)))?;
            header = Some(parsed);
            continue;
        }

        // A bad line followed by more content is corruption, not truncation.
        if pending_bad_line {
            skipped += 1;
            pending_bad_line = false;
        }

        match serde_json::from_str::<SessionEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(_) => pending_bad_line = true,
        }
    }

    let header = header.ok_or_else(|| Error::Header(format!("{}: empty file", path.display())))?;

    Ok(ParsedSession {
        header,
        entries,
        skipped_lines: skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_json(id: &str, parent: Option<&str>, ts: &str) -> String {
        match parent {
            Some(p) => format!(
                r#"{{"id":"{}","parentId":"{}","timestamp":"{}","type":"user","payload":{{"text":"hi"}}}}"#,
                id, p, ts
            ),
            None => format!(
                r#"{{"id":"{}","timestamp":"{}","type":"user","payload":{{"text":"hi"}}}}"#,
                id, ts
            ),
        }
    }

    #[test]
    fn test_parse_entry_roundtrip() {
        let line = entry_json("e1", Some("e0"), "2026-01-01T00:00:00Z");
        let entry: SessionEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(entry.id, "e1");
        assert_eq!(entry.parent_id.as_deref(), Some("e0"));
        assert!(matches!(entry.payload, EntryPayload::User(_)));

        let back = serde_json::to_string(&entry).unwrap();
        let again: SessionEntry = serde_json::from_str(&back).unwrap();
        assert_eq!(again.id, "e1");
    }

    #[test]
    fn test_unknown_entry_type_tolerated() {
        let line = r#"{"id":"e1","timestamp":"2026-01-01T00:00:00Z","type":"hologram","payload":{"x":1}}"#;
        let entry: SessionEntry = serde_json::from_str(line).unwrap();
        assert!(matches!(entry.payload, EntryPayload::Unknown));
    }

    #[test]
    fn test_parent_session_ref_parse() {
        let r = ParentSessionRef::parse("s1.jsonl@e5").unwrap();
        assert_eq!(r.file, "s1.jsonl");
        assert_eq!(r.entry_id, "e5");
        assert_eq!(r.to_string(), "s1.jsonl@e5");

        assert!(ParentSessionRef::parse("no-separator").is_none());
        assert!(ParentSessionRef::parse("@e5").is_none());
    }

    #[test]
    fn test_read_session_file_tolerates_partial_tail() {
        let dir = std::env::temp_dir().join(format!("mnemon-types-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("partial.jsonl");

        let mut content = String::from("{\"version\":1,\"cwd\":\"/p\"}\n");
        content.push_str(&entry_json("e1", None, "2026-01-01T00:00:00Z"));
        content.push('\n');
        content.push_str("{\"id\":\"e2\",\"timestamp\":\"2026-01-01T00:0"); // truncated
        std::fs::write(&path, content).unwrap();

        let parsed = read_session_file(&path).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.skipped_lines, 0);
        assert_eq!(parsed.header.cwd, "/p");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_read_session_file_counts_mid_file_garbage() {
        let dir = std::env::temp_dir().join(format!("mnemon-types-g-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("garbage.jsonl");

        let mut content = String::from("{\"version\":1,\"cwd\":\"/p\"}\n");
        content.push_str("not json at all\n");
        content.push_str(&entry_json("e1", None, "2026-01-01T00:00:00Z"));
        content.push('\n');
        std::fs::write(&path, content).unwrap();

        let parsed = read_session_file(&path).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.skipped_lines, 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_malformed_header_is_fatal() {
        let dir = std::env::temp_dir().join(format!("mnemon-types-h-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad-header.jsonl");
        std::fs::write(&path, "this is not a header\n").unwrap();

        let err = read_session_file(&path).unwrap_err();
        assert!(matches!(err, Error::Header(_)));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_leaf_entry_id_linear_chain() {
        let entries: Vec<SessionEntry> = (1..=3)
            .map(|i| {
                let parent = if i == 1 { None } else { Some(format!("e{}", i - 1)) };
                SessionEntry {
                    id: format!("e{}", i),
                    parent_id: parent,
                    timestamp: "2026-01-01T00:00:00Z".parse().unwrap(),
                    payload: EntryPayload::User(UserPayload { text: "x".into() }),
                }
            })
            .collect();

        assert_eq!(leaf_entry_id(&entries), Some("e3"));
    }
}
