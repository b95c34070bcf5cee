//! Structured article JSON and its deterministic Markdown rendering.
//!
//! Models return the article as JSON, sometimes wrapped in a fenced code
//! block or surrounded by prose, and sometimes with string-valued fields
//! where a list was asked for (or vice versa). `extract_json_object` digs
//! the object out; `FlexText` absorbs the string-or-list ambiguity; the
//! JSON → Markdown conversion is a fixed transformation so the same input
//! always yields byte-identical output.

use serde::de::Deserializer;
use serde::Deserialize;
use serde_json::Value;

// ── JSON extraction ──────────────────────────────────────────────────────

/// Pull a JSON object out of a model response: the text as-is, the contents
/// of a fenced code block, or the outermost `{...}` substring.
pub fn extract_json_object(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if serde_json::from_str::<Value>(trimmed).map(|v| v.is_object()).unwrap_or(false) {
        return Some(trimmed.to_string());
    }

    if let Some(inner) = fenced_block(trimmed) {
        if serde_json::from_str::<Value>(inner).map(|v| v.is_object()).unwrap_or(false) {
            return Some(inner.to_string());
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end > start {
        let candidate = &trimmed[start..=end];
        if serde_json::from_str::<Value>(candidate).map(|v| v.is_object()).unwrap_or(false) {
            return Some(candidate.to_string());
        }
    }
    None
}

fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_fence = &text[open + 3..];
    let newline = after_fence.find('\n')?;
    let body = &after_fence[newline + 1..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

// ── Flexible fields ──────────────────────────────────────────────────────

/// A field the model may return as a string, a list of strings, a number,
/// or null. Lists are joined with blank lines; the result is trimmed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlexText(pub String);

impl FlexText {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for FlexText {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(FlexText(ensure_string(&value)))
    }
}

/// The "ensure-string" rule: strings pass through, lists join with blank
/// lines, null becomes empty, anything else uses its JSON rendering.
pub fn ensure_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Array(items) => items
            .iter()
            .filter(|v| !v.is_null())
            .map(ensure_string)
            .collect::<Vec<_>>()
            .join("\n\n")
            .trim()
            .to_string(),
        other => other.to_string(),
    }
}

// ── Article model ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodeBlock {
    #[serde(default)]
    pub language: FlexText,
    #[serde(default)]
    pub code: FlexText,
    #[serde(default)]
    pub explanation: FlexText,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListBlock {
    /// "bulleted" or "numbered".
    #[serde(rename = "type", default)]
    pub kind: FlexText,
    #[serde(default)]
    pub items: Vec<FlexText>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Section {
    #[serde(default)]
    pub heading: FlexText,
    #[serde(default)]
    pub content_paragraphs: Vec<FlexText>,
    #[serde(default)]
    pub code_blocks: Vec<CodeBlock>,
    #[serde(default)]
    pub lists: Vec<ListBlock>,
    #[serde(default)]
    pub notes_or_tips: Vec<FlexText>,
}

/// External reference, usually `{text, url}` but tolerated as a bare string.
#[derive(Debug, Clone)]
pub enum Reference {
    Link { text: String, url: String },
    Plain(String),
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        if let Value::Object(map) = &value {
            let url = map.get("url").map(ensure_string).unwrap_or_else(|| "#".to_string());
            let text = map
                .get("text")
                .map(ensure_string)
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| url.clone());
            return Ok(Reference::Link { text, url });
        }
        Ok(Reference::Plain(ensure_string(&value)))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArticleJson {
    pub suggested_title: FlexText,
    #[serde(default)]
    pub meta_description: FlexText,
    #[serde(default)]
    pub introduction: FlexText,
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default)]
    pub key_takeaways: Vec<FlexText>,
    #[serde(default)]
    pub conclusion: FlexText,
    #[serde(default)]
    pub external_references: Vec<Reference>,
}

impl ArticleJson {
    /// Parse a model response, accepting fenced or embedded JSON. Requires
    /// `suggested_title` and at least one section.
    pub fn parse(response: &str) -> Result<Self, String> {
        let json = extract_json_object(response)
            .ok_or_else(|| "response did not contain a JSON object".to_string())?;
        let article: ArticleJson =
            serde_json::from_str(&json).map_err(|e| format!("article JSON did not match the expected shape: {e}"))?;
        if article.suggested_title.is_empty() {
            return Err("article JSON is missing 'suggested_title'".to_string());
        }
        if article.sections.is_empty() {
            return Err("article JSON has no sections".to_string());
        }
        Ok(article)
    }
}

// ── Markdown rendering ───────────────────────────────────────────────────

/// Deterministic article JSON → Markdown conversion.
pub fn article_to_markdown(article: &ArticleJson) -> String {
    let mut lines: Vec<String> = Vec::new();

    let title =
        if article.suggested_title.is_empty() { "Knowledge Base Item" } else { article.suggested_title.as_str() };
    lines.push(format!("# {title}"));
    lines.push(String::new());

    if !article.introduction.is_empty() {
        lines.push("## Introduction".to_string());
        lines.push(article.introduction.0.clone());
        lines.push(String::new());
    }

    for section in &article.sections {
        let heading = if section.heading.is_empty() { "Section" } else { section.heading.as_str() };
        lines.push(format!("## {heading}"));
        lines.push(String::new());

        for paragraph in &section.content_paragraphs {
            lines.push(paragraph.0.clone());
            lines.push(String::new());
        }

        for block in &section.code_blocks {
            let lang = if block.language.is_empty() { "plain_text" } else { block.language.as_str() };
            if !block.explanation.is_empty() {
                lines.push(format!("_{}_", block.explanation.as_str()));
                lines.push(String::new());
            }
            lines.push(format!("```{lang}\n{}\n```", block.code.as_str()));
            lines.push(String::new());
        }

        for list in &section.lists {
            let prefix = if list.kind.as_str() == "numbered" { "1." } else { "-" };
            for item in &list.items {
                lines.push(format!("{prefix} {}", item.as_str()));
            }
            lines.push(String::new());
        }

        for note in &section.notes_or_tips {
            lines.push(format!("> **Note/Tip:** {}", note.as_str()));
            lines.push(String::new());
        }
    }

    if !article.key_takeaways.is_empty() {
        lines.push("## Key Takeaways".to_string());
        lines.push(String::new());
        for takeaway in &article.key_takeaways {
            lines.push(format!("- {}", takeaway.as_str()));
        }
        lines.push(String::new());
    }

    if !article.conclusion.is_empty() {
        lines.push("## Conclusion".to_string());
        lines.push(article.conclusion.0.clone());
        lines.push(String::new());
    }

    if !article.external_references.is_empty() {
        lines.push("## External References".to_string());
        lines.push(String::new());
        for reference in &article.external_references {
            match reference {
                Reference::Link { text, url } => lines.push(format!("- [{text}]({url})")),
                Reference::Plain(s) => lines.push(format!("- {s}")),
            }
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "suggested_title": "Async Rust Patterns",
        "introduction": "Why async matters.",
        "sections": [
            {
                "heading": "Tasks",
                "content_paragraphs": ["Spawn with tokio.", ["Multiple", "paragraphs"]],
                "code_blocks": [
                    {"language": "rust", "code": "tokio::spawn(async {});", "explanation": "Fire and forget."}
                ],
                "lists": [
                    {"type": "numbered", "items": ["first", "second"]},
                    {"type": "bulleted", "items": ["a point"]}
                ],
                "notes_or_tips": ["Prefer JoinSet for fan-out."]
            }
        ],
        "key_takeaways": ["Use structured concurrency."],
        "conclusion": "That is all.",
        "external_references": [
            {"text": "Tokio docs", "url": "https://tokio.rs"},
            "https://blog.example.com/async"
        ]
    }"#;

    #[test]
    fn extracts_plain_json() {
        assert!(extract_json_object(r#"{"a": 1}"#).is_some());
    }

    #[test]
    fn extracts_fenced_json() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(extract_json_object(text).unwrap(), r#"{"a": 1}"#);
    }

    #[test]
    fn extracts_embedded_json() {
        let text = "The answer is {\"a\": 1} as requested.";
        assert_eq!(extract_json_object(text).unwrap(), r#"{"a": 1}"#);
    }

    #[test]
    fn rejects_non_object_responses() {
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("[1, 2, 3]").is_none());
        assert!(extract_json_object("").is_none());
    }

    #[test]
    fn ensure_string_joins_lists_with_blank_lines() {
        let v: Value = serde_json::json!(["one", "two", null, "three"]);
        assert_eq!(ensure_string(&v), "one\n\ntwo\n\nthree");
        assert_eq!(ensure_string(&Value::Null), "");
        assert_eq!(ensure_string(&serde_json::json!(" padded ")), "padded");
    }

    #[test]
    fn parse_requires_title_and_sections() {
        assert!(ArticleJson::parse(r#"{"sections": [{"heading": "x"}]}"#).is_err());
        assert!(ArticleJson::parse(r#"{"suggested_title": "t", "sections": []}"#).is_err());
        assert!(ArticleJson::parse(SAMPLE).is_ok());
    }

    #[test]
    fn markdown_conversion_is_deterministic() {
        let a = ArticleJson::parse(SAMPLE).unwrap();
        let b = ArticleJson::parse(SAMPLE).unwrap();
        assert_eq!(article_to_markdown(&a), article_to_markdown(&b));
    }

    #[test]
    fn markdown_shape() {
        let article = ArticleJson::parse(SAMPLE).unwrap();
        let md = article_to_markdown(&article);
        assert!(md.starts_with("# Async Rust Patterns\n"));
        assert!(md.contains("## Introduction"));
        assert!(md.contains("## Tasks"));
        assert!(md.contains("Multiple\n\nparagraphs"));
        assert!(md.contains("_Fire and forget._"));
        assert!(md.contains("```rust\ntokio::spawn(async {});\n```"));
        assert!(md.contains("1. first\n1. second"));
        assert!(md.contains("- a point"));
        assert!(md.contains("> **Note/Tip:** Prefer JoinSet for fan-out."));
        assert!(md.contains("## Key Takeaways"));
        assert!(md.contains("- Use structured concurrency."));
        assert!(md.contains("## Conclusion"));
        assert!(md.contains("- [Tokio docs](https://tokio.rs)"));
        assert!(md.contains("- https://blog.example.com/async"));
    }
}
