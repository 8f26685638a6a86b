use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Target used for analyzer references that could not be resolved to a node
/// yet; the free-text hint lives in `Edge::unresolved_target`.
pub const UNRESOLVED_TARGET: &str = "0000000000000000";

/// Typed relationship between two nodes. Structural kinds come from session
/// topology at ingest time; semantic kinds are added later from content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Fork,
    Branch,
    TreeJump,
    Resume,
    Compaction,
    Continuation,
    Handoff,
    AbandonedRestart,
    Semantic,
    Reference,
    LessonApplication,
}

impl EdgeKind {
    pub fn is_structural(&self) -> bool {
        !matches!(
            self,
            EdgeKind::Semantic | EdgeKind::Reference | EdgeKind::LessonApplication
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Fork => "fork",
            EdgeKind::Branch => "branch",
            EdgeKind::TreeJump => "tree_jump",
            EdgeKind::Resume => "resume",
            EdgeKind::Compaction => "compaction",
            EdgeKind::Continuation => "continuation",
            EdgeKind::Handoff => "handoff",
            EdgeKind::AbandonedRestart => "abandoned_restart",
            EdgeKind::Semantic => "semantic",
            EdgeKind::Reference => "reference",
            EdgeKind::LessonApplication => "lesson_application",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCreator {
    Boundary,
    Daemon,
    User,
}

impl EdgeCreator {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeCreator::Boundary => "boundary",
            EdgeCreator::Daemon => "daemon",
            EdgeCreator::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub kind: EdgeKind,
    pub created_by: EdgeCreator,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unresolved_target: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    pub fn structural(source: &str, target: &str, kind: EdgeKind, now: DateTime<Utc>) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            kind,
            created_by: EdgeCreator::Boundary,
            confidence: 1.0,
            similarity: None,
            unresolved_target: None,
            created_at: now,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        self.target == UNRESOLVED_TARGET
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_partition() {
        assert!(EdgeKind::Fork.is_structural());
        assert!(EdgeKind::Continuation.is_structural());
        assert!(EdgeKind::AbandonedRestart.is_structural());
        assert!(!EdgeKind::Semantic.is_structural());
        assert!(!EdgeKind::LessonApplication.is_structural());
    }

    #[test]
    fn test_kind_string_round_trip() {
        for kind in [
            EdgeKind::Fork,
            EdgeKind::TreeJump,
            EdgeKind::AbandonedRestart,
            EdgeKind::LessonApplication,
        ] {
            assert_eq!(EdgeKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EdgeKind::parse("psychic_link"), None);
    }
}
