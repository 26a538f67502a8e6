//! Message payloads routed between workflow nodes.
//!
//! A payload is a closed set of tagged variants; every consumer pattern-matches
//! rather than inspecting runtime types.

use serde::{Deserialize, Serialize};

/// Content carried by a routed [`crate::model::Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// Plain text, the common case for node-to-node handoff.
    Text { text: String },

    /// Arbitrary JSON-shaped value (workflow inputs, tool outputs).
    Json { value: serde_json::Value },

    /// Join of several branch payloads, produced when parallel branches
    /// are merged before delivery.
    Aggregated { parts: Vec<Payload> },
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Payload::Text { text: text.into() }
    }

    pub fn json(value: serde_json::Value) -> Self {
        Payload::Json { value }
    }

    /// Extract the textual parts of this payload, depth-first.
    ///
    /// JSON string values surface as-is; other JSON values are rendered
    /// compactly so downstream prompts always receive text.
    pub fn text_parts(&self) -> Vec<String> {
        match self {
            Payload::Text { text } => vec![text.clone()],
            Payload::Json { value } => match value {
                serde_json::Value::String(s) => vec![s.clone()],
                other => vec![other.to_string()],
            },
            Payload::Aggregated { parts } => {
                parts.iter().flat_map(|p| p.text_parts()).collect()
            }
        }
    }

    /// All text parts joined with blank lines, for prompt construction.
    pub fn joined_text(&self) -> String {
        self.text_parts().join("\n\n")
    }

    /// Truncate textual content to `max_chars`, marking the cut.
    ///
    /// Non-text payloads are first flattened to text.
    pub fn truncated(&self, max_chars: usize) -> Payload {
        let text = self.joined_text();
        if text.chars().count() <= max_chars {
            return Payload::Text { text };
        }
        let cut: String = text.chars().take(max_chars).collect();
        Payload::Text {
            text: format!("{cut}… [truncated]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_parts_of_text() {
        let p = Payload::text("hello");
        assert_eq!(p.text_parts(), vec!["hello"]);
    }

    #[test]
    fn text_parts_of_json_string_unwraps() {
        let p = Payload::json(json!("inner"));
        assert_eq!(p.text_parts(), vec!["inner"]);
    }

    #[test]
    fn text_parts_of_json_object_renders_compact() {
        let p = Payload::json(json!({"a": 1}));
        assert_eq!(p.text_parts(), vec![r#"{"a":1}"#]);
    }

    #[test]
    fn aggregated_flattens_depth_first() {
        let p = Payload::Aggregated {
            parts: vec![
                Payload::text("one"),
                Payload::Aggregated {
                    parts: vec![Payload::text("two"), Payload::text("three")],
                },
            ],
        };
        assert_eq!(p.text_parts(), vec!["one", "two", "three"]);
    }

    #[test]
    fn truncated_marks_the_cut() {
        let p = Payload::text("x".repeat(600));
        match p.truncated(500) {
            Payload::Text { text } => {
                assert!(text.starts_with(&"x".repeat(500)));
                assert!(text.ends_with("[truncated]"));
            }
            other => panic!("expected text payload, got {other:?}"),
        }
    }

    #[test]
    fn truncated_short_text_untouched() {
        let p = Payload::text("short");
        assert_eq!(p.truncated(500), Payload::text("short"));
    }

    #[test]
    fn serde_tags_are_snake_case() {
        let p = Payload::text("hi");
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["kind"], "text");

        let round: Payload = serde_json::from_value(v).unwrap();
        assert_eq!(round, p);
    }
}
