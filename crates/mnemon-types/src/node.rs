use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Task classification assigned by the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Coding,
    Debugging,
    Refactoring,
    Sysadmin,
    Research,
    Planning,
    Qa,
    Brainstorm,
    Handoff,
    Documentation,
    Configuration,
    Data,
    Other,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Coding => "coding",
            NodeType::Debugging => "debugging",
            NodeType::Refactoring => "refactoring",
            NodeType::Sysadmin => "sysadmin",
            NodeType::Research => "research",
            NodeType::Planning => "planning",
            NodeType::Qa => "qa",
            NodeType::Brainstorm => "brainstorm",
            NodeType::Handoff => "handoff",
            NodeType::Documentation => "documentation",
            NodeType::Configuration => "configuration",
            NodeType::Data => "data",
            NodeType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Partial,
    Failed,
    Abandoned,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Partial => "partial",
            Outcome::Failed => "failed",
            Outcome::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }
}

/// Scope a lesson applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonLevel {
    Project,
    Task,
    User,
    Model,
    Tool,
    Skill,
    Subagent,
}

impl LessonLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LessonLevel::Project => "project",
            LessonLevel::Task => "task",
            LessonLevel::User => "user",
            LessonLevel::Model => "model",
            LessonLevel::Tool => "tool",
            LessonLevel::Skill => "skill",
            LessonLevel::Subagent => "subagent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    pub level: LessonLevel,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub what: String,
    pub why: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuirkSeverity {
    Low,
    Medium,
    High,
}

impl QuirkSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuirkSeverity::Low => "low",
            QuirkSeverity::Medium => "medium",
            QuirkSeverity::High => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelQuirk {
    pub observation: String,
    pub frequency: u32,
    pub severity: QuirkSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolErrorStat {
    pub tool: String,
    pub error_kind: String,
    pub count: u32,
}

/// Where the analyzed segment came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSource {
    pub session_file: String,
    pub segment_start: String,
    pub segment_end: String,
    pub project_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computer: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub outcome: Outcome,
    pub had_clear_goal: bool,
    pub is_new_project: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeContent {
    pub summary: String,
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Analyzer fields we do not project into rows, kept verbatim.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extra: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    pub prompt_version: String,
    pub analyzed_at: DateTime<Utc>,
    #[serde(default)]
    pub previous_versions: Vec<i64>,
}

/// The persisted analysis of one segment. Identity is deterministic over
/// `(session_file, segment_start, segment_end)`; content is versioned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub node_id: String,
    pub version: i64,
    pub source: NodeSource,
    pub classification: Classification,
    pub content: NodeContent,
    pub metadata: NodeMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_type_round_trip() {
        for t in [NodeType::Coding, NodeType::Qa, NodeType::Other] {
            assert_eq!(NodeType::parse(t.as_str()), Some(t));
        }
        assert_eq!(NodeType::parse("interpretive_dance"), None);
    }

    #[test]
    fn test_node_serde_round_trip() {
        let node = Node {
            node_id: "aabbccddeeff0011".into(),
            version: 1,
            source: NodeSource {
                session_file: "s1.jsonl".into(),
                segment_start: "e1".into(),
                segment_end: "e10".into(),
                project_path: "/p".into(),
                computer: Some("box".into()),
                timestamp: "2026-01-01T00:00:00Z".parse().unwrap(),
            },
            classification: Classification {
                node_type: NodeType::Debugging,
                outcome: Outcome::Partial,
                had_clear_goal: true,
                is_new_project: false,
            },
            content: NodeContent {
                summary: "fixed the flaky test".into(),
                decisions: vec![Decision {
                    what: "pin the clock".into(),
                    why: "test depended on wall time".into(),
                    alternatives: vec!["retry loop".into()],
                }],
                lessons: vec![Lesson {
                    level: LessonLevel::Tool,
                    text: "timeouts need jitter".into(),
                }],
                quirks: vec![],
                tool_errors: vec![],
                tags: vec!["tests".into()],
                topics: vec!["flakiness".into()],
                files_touched: vec!["src/lib.rs".into()],
                tokens_used: 1200,
                cost: 0.03,
                duration_minutes: 7.5,
                model: Some("mx-1".into()),
                extra: Value::Null,
            },
            metadata: NodeMetadata {
                prompt_version: "0011223344556677".into(),
                analyzed_at: "2026-01-01T00:10:00Z".parse().unwrap(),
                previous_versions: vec![],
            },
        };

        let json = serde_json::to_string(&node).unwrap();
        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(back.node_id, node.node_id);
        assert_eq!(back.classification.node_type, NodeType::Debugging);
        assert_eq!(back.content.decisions.len(), 1);
    }
}
