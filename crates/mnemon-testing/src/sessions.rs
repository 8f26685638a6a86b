use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use mnemon_types::{
    AssistantPayload, CompactionPayload, EntryPayload, MarkerPayload, ParentSessionRef,
    SessionEntry, SessionHeader, ToolOp, ToolResultPayload, UserPayload,
};
use std::path::Path;

/// Builds realistic session files line by line. Entry IDs default to
/// `e1, e2, ...` chained linearly; timestamps advance one second per entry
/// unless placed explicitly.
pub struct SessionFileBuilder {
    header: SessionHeader,
    entries: Vec<SessionEntry>,
    base_time: DateTime<Utc>,
}

impl SessionFileBuilder {
    pub fn new(cwd: &str) -> Self {
        Self {
            header: SessionHeader {
                version: 1,
                cwd: cwd.to_string(),
                parent_session: None,
            },
            entries: Vec::new(),
            base_time: Utc.with_ymd_and_hms(2026, 3, 5, 10, 0, 0).unwrap(),
        }
    }

    pub fn parent_session(mut self, file: &str, entry_id: &str) -> Self {
        self.header.parent_session = Some(ParentSessionRef {
            file: file.to_string(),
            entry_id: entry_id.to_string(),
        });
        self
    }

    pub fn base_time(mut self, base: DateTime<Utc>) -> Self {
        self.base_time = base;
        self
    }

    fn next_id(&self) -> String {
        format!("e{}", self.entries.len() + 1)
    }

    fn chained_parent(&self) -> Option<String> {
        self.entries.last().map(|e| e.id.clone())
    }

    fn next_time(&self) -> DateTime<Utc> {
        self.base_time + Duration::seconds(self.entries.len() as i64)
    }

    /// Append a payload chained to the previous entry.
    pub fn push(mut self, payload: EntryPayload) -> Self {
        let entry = SessionEntry {
            id: self.next_id(),
            parent_id: self.chained_parent(),
            timestamp: self.next_time(),
            payload,
        };
        self.entries.push(entry);
        self
    }

    /// Append with explicit id/parent/offset, for trees and time gaps.
    pub fn push_at(
        mut self,
        id: &str,
        parent: Option<&str>,
        offset_seconds: i64,
        payload: EntryPayload,
    ) -> Self {
        self.entries.push(SessionEntry {
            id: id.to_string(),
            parent_id: parent.map(String::from),
            timestamp: self.base_time + Duration::seconds(offset_seconds),
            payload,
        });
        self
    }

    pub fn user(self, text: &str) -> Self {
        self.push(EntryPayload::User(UserPayload { text: text.into() }))
    }

    pub fn assistant(self, text: &str) -> Self {
        self.push(EntryPayload::Assistant(AssistantPayload {
            text: text.into(),
            model: None,
        }))
    }

    pub fn tool_result(self, tool: &str, is_error: bool) -> Self {
        self.push(EntryPayload::ToolResult(ToolResultPayload {
            tool: tool.into(),
            is_error,
            error_kind: is_error.then(|| "exit_1".to_string()),
            file_path: None,
            op: Some(ToolOp::Other),
        }))
    }

    pub fn compaction(self) -> Self {
        self.push(EntryPayload::Compaction(CompactionPayload::default()))
    }

    pub fn handoff(self) -> Self {
        self.push(EntryPayload::Marker(MarkerPayload {
            name: "handoff".into(),
            data: None,
        }))
    }

    pub fn entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    pub fn render(&self) -> Result<String> {
        let mut content = serde_json::to_string(&self.header)?;
        content.push('\n');
        for entry in &self.entries {
            content.push_str(&serde_json::to_string(entry)?);
            content.push('\n');
        }
        Ok(content)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.render()?)?;
        Ok(())
    }
}

/// The ten-entry linear session from the fresh-ingest scenario.
pub fn linear_session(cwd: &str) -> SessionFileBuilder {
    let mut builder = SessionFileBuilder::new(cwd);
    for i in 0..10 {
        builder = if i % 2 == 0 {
            builder.user(&format!("step {}", i + 1))
        } else {
            builder.assistant(&format!("done with step {}", i))
        };
    }
    builder
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemon_types::read_session_file;

    #[test]
    fn test_builder_round_trips_through_reader() {
        let dir = std::env::temp_dir().join(format!("mnemon-fixtures-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("s1.jsonl");

        linear_session("/p").write_to(&path).unwrap();
        let parsed = read_session_file(&path).unwrap();

        assert_eq!(parsed.header.cwd, "/p");
        assert_eq!(parsed.entries.len(), 10);
        assert_eq!(parsed.entries[0].id, "e1");
        assert_eq!(parsed.entries[9].parent_id.as_deref(), Some("e9"));
        assert_eq!(parsed.leaf_entry_id(), Some("e10"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_parent_session_header() {
        let builder = SessionFileBuilder::new("/p").parent_session("s1.jsonl", "e5");
        let rendered = builder.render().unwrap();
        assert!(rendered.contains(r#""parentSession":"s1.jsonl@e5""#));
    }
}
