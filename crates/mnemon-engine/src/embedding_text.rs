use mnemon_types::{LessonLevel, Node};

/// Marker baked into embedding input text. Its presence distinguishes the
/// current rich format from older summary-only texts, which the embedding
/// backfill treats as outdated.
pub const EMBED_FORMAT_MARKER: &str = "[embed-text:v2]";

/// Build the canonical embedding input for a node: marker, classification,
/// summary, decisions, lessons grouped by level.
pub fn build_embedding_text(node: &Node) -> String {
    let mut text = String::new();
    text.push_str(EMBED_FORMAT_MARKER);
    text.push('\n');
    text.push_str(node.classification.node_type.as_str());
    text.push_str(" | ");
    text.push_str(node.classification.outcome.as_str());
    text.push('\n');
    text.push_str(&node.content.summary);
    text.push('\n');

    for decision in &node.content.decisions {
        text.push_str("decision: ");
        text.push_str(&decision.what);
        text.push_str(" because ");
        text.push_str(&decision.why);
        text.push('\n');
    }

    for level in [
        LessonLevel::Project,
        LessonLevel::Task,
        LessonLevel::User,
        LessonLevel::Model,
        LessonLevel::Tool,
        LessonLevel::Skill,
        LessonLevel::Subagent,
    ] {
        for lesson in node.content.lessons.iter().filter(|l| l.level == level) {
            text.push_str(level.as_str());
            text.push_str(" lesson: ");
            text.push_str(&lesson.text);
            text.push('\n');
        }
    }

    text
}

pub fn is_rich_format(text: &str) -> bool {
    text.contains(EMBED_FORMAT_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemon_types::*;
    use serde_json::Value;

    fn sample_node() -> Node {
        Node {
            node_id: "0011223344556677".into(),
            version: 1,
            source: NodeSource {
                session_file: "s1.jsonl".into(),
                segment_start: "e1".into(),
                segment_end: "e10".into(),
                project_path: "/p".into(),
                computer: None,
                timestamp: "2026-01-01T00:00:00Z".parse().unwrap(),
            },
            classification: Classification {
                node_type: NodeType::Coding,
                outcome: Outcome::Success,
                had_clear_goal: true,
                is_new_project: false,
            },
            content: NodeContent {
                summary: "added retry logic".into(),
                decisions: vec![Decision {
                    what: "use exponential backoff".into(),
                    why: "linear retries hammered the API".into(),
                    alternatives: vec![],
                }],
                lessons: vec![
                    Lesson {
                        level: LessonLevel::Tool,
                        text: "curl exits 28 on timeout".into(),
                    },
                    Lesson {
                        level: LessonLevel::Project,
                        text: "client wraps all HTTP calls".into(),
                    },
                ],
                quirks: vec![],
                tool_errors: vec![],
                tags: vec![],
                topics: vec![],
                files_touched: vec![],
                tokens_used: 0,
                cost: 0.0,
                duration_minutes: 0.0,
                model: None,
                extra: Value::Null,
            },
            metadata: NodeMetadata {
                prompt_version: "aa".into(),
                analyzed_at: "2026-01-01T00:00:00Z".parse().unwrap(),
                previous_versions: vec![],
            },
        }
    }

    #[test]
    fn test_rich_format_marker_present() {
        let text = build_embedding_text(&sample_node());
        assert!(is_rich_format(&text));
        assert!(text.contains("coding | success"));
        assert!(text.contains("added retry logic"));
        assert!(text.contains("decision: use exponential backoff"));
        // Project lessons come before tool lessons regardless of input order.
        let project = text.find("project lesson").unwrap();
        let tool = text.find("tool lesson").unwrap();
        assert!(project < tool);
    }

    #[test]
    fn test_plain_text_is_not_rich() {
        assert!(!is_rich_format("added retry logic"));
        assert!(!is_rich_format(""));
    }
}
