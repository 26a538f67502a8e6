//! Secret redaction applied to trace content before it reaches persistence.
//!
//! Tool outputs and terminate content may echo credentials that tools saw
//! in their environment; the serialized outward trace must not carry them.

/// Known secret token prefixes and the labels that replace them.
static SECRET_PREFIXES: &[(&str, &str)] = &[
    ("sk-ant-", "ANTHROPIC_KEY"),
    ("sk-proj-", "OPENAI_KEY"),
    ("sk-", "API_KEY"),
    ("github_pat_", "GITHUB_FINE_PAT"),
    ("ghp_", "GITHUB_PAT"),
    ("xoxb-", "SLACK_BOT_TOKEN"),
    ("xoxp-", "SLACK_USER_TOKEN"),
    ("AKIA", "AWS_ACCESS_KEY"),
    ("eyJ", "JWT_TOKEN"),
];

/// Replaces known secret tokens in trace text with `[REDACTED:<label>]`.
#[derive(Debug, Default, Clone)]
pub struct SecretRedactor;

impl SecretRedactor {
    pub fn new() -> Self {
        Self
    }

    /// Redact every secret token in `input`, returning the cleaned text
    /// and the number of replacements made.
    pub fn redact(&self, input: &str) -> (String, usize) {
        let mut output = input.to_string();
        let mut count = 0;

        for (prefix, label) in SECRET_PREFIXES {
            let replacement = format!("[REDACTED:{label}]");
            let mut from = 0;
            while let Some(rel) = output[from..].find(prefix) {
                let start = from + rel;
                let end = token_end(&output, start);
                output.replace_range(start..end, &replacement);
                count += 1;
                from = start + replacement.len();
            }
        }

        (output, count)
    }
}

/// A secret token runs until whitespace or a JSON/string delimiter.
fn token_end(s: &str, start: usize) -> usize {
    s[start..]
        .find(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | ',' | ';' | ')' | ']' | '}'))
        .map(|pos| start + pos)
        .unwrap_or(s.len())
}
