//! Local document analysis run by the analyze step

use crate::constants::{EXCERPT_CHARS, TOP_KEYWORDS};
use crate::db::Document;
use serde_json::{json, Value};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("document for subject {0} has no text to analyze")]
    EmptyDocument(String),
}

/// Turns a fetched document into a JSON analysis
pub trait Analyzer: std::fmt::Debug + Send + Sync {
    fn analyze(&self, document: &Document) -> Result<Value, AnalysisError>;
}

const STOP_WORDS: &[&str] = &[
    "about", "after", "also", "been", "before", "being", "between", "both", "could", "does",
    "each", "from", "have", "here", "into", "more", "most", "only", "other", "over", "same",
    "should", "some", "such", "than", "that", "their", "them", "then", "there", "these", "they",
    "this", "those", "through", "under", "very", "were", "what", "when", "where", "which",
    "while", "will", "with", "would", "your",
];

/// Word statistics over the plain text of a document
#[derive(Debug, Clone)]
pub struct TextAnalyzer {
    pub excerpt_chars: usize,
    pub top_keywords: usize,
}

impl Default for TextAnalyzer {
    fn default() -> Self {
        Self {
            excerpt_chars: EXCERPT_CHARS,
            top_keywords: TOP_KEYWORDS,
        }
    }
}

fn is_html(document: &Document) -> bool {
    document
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.contains("html"))
        || document.content.trim_start().starts_with('<')
}

/// Drops markup and the contents of `script`/`style` elements
fn strip_tags(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(start) = rest.find('<') {
        text.push_str(&rest[..start]);
        let after = &rest[start..];
        let lower = after.get(..7).unwrap_or(after).to_ascii_lowercase();
        let skip_to = if lower.starts_with("<script") {
            after.to_ascii_lowercase().find("</script>").map(|i| i + 9)
        } else if lower.starts_with("<style") {
            after.to_ascii_lowercase().find("</style>").map(|i| i + 8)
        } else {
            after.find('>').map(|i| i + 1)
        };
        match skip_to {
            Some(offset) => {
                text.push('\n');
                rest = &after[offset..];
            }
            None => {
                rest = "";
            }
        }
    }
    text.push_str(rest);
    text
}

fn html_title(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let start = lower.find("<title")?;
    let open_end = lower[start..].find('>')? + start + 1;
    let close = lower[open_end..].find("</title>")? + open_end;
    let title = html[open_end..close].trim();
    (!title.is_empty()).then(|| title.to_string())
}

impl TextAnalyzer {
    fn keywords(&self, words: &[&str]) -> Vec<Value> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for word in words {
            let word = word.to_lowercase();
            if word.chars().count() < 4
                || !word.chars().all(char::is_alphabetic)
                || STOP_WORDS.contains(&word.as_str())
            {
                continue;
            }
            *counts.entry(word).or_default() += 1;
        }
        let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
            .into_iter()
            .take(self.top_keywords)
            .map(|(word, count)| json!({"word": word, "count": count}))
            .collect()
    }
}

impl Analyzer for TextAnalyzer {
    fn analyze(&self, document: &Document) -> Result<Value, AnalysisError> {
        let html = is_html(document);
        let text = if html {
            strip_tags(&document.content)
        } else {
            document.content.clone()
        };

        let words: Vec<&str> = text
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
            .filter(|w| !w.is_empty())
            .collect();
        if words.is_empty() {
            return Err(AnalysisError::EmptyDocument(document.subject_id.clone()));
        }

        let title = html
            .then(|| html_title(&document.content))
            .flatten()
            .or_else(|| {
                text.lines()
                    .map(str::trim)
                    .find(|line| !line.is_empty())
                    .map(|line| line.chars().take(200).collect())
            });

        let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut excerpt: String = normalized.chars().take(self.excerpt_chars).collect();
        if normalized.chars().count() > self.excerpt_chars {
            excerpt.push('…');
        }

        Ok(json!({
            "title": title,
            "word_count": words.len(),
            "excerpt": excerpt,
            "keywords": self.keywords(&words),
            "source_url": document.source_url,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(content: &str, content_type: Option<&str>) -> Document {
        Document {
            subject_id: "42".to_string(),
            source_url: Some("https://example.org/42".to_string()),
            content_type: content_type.map(str::to_string),
            content: content.to_string(),
            fetched_at: "2024-01-01T00:00:00.000000Z".to_string(),
            analysis: None,
            analyzed_at: None,
        }
    }

    #[test]
    fn test_plain_text_analysis() {
        let doc = document(
            "\n  Graph Neural Networks\nGraph networks learn graph structure. Networks scale.",
            Some("text/plain"),
        );
        let analysis = TextAnalyzer::default().analyze(&doc).unwrap();
        assert_eq!(analysis["title"], "Graph Neural Networks");
        assert_eq!(analysis["word_count"], 10);
        assert_eq!(analysis["keywords"][0], json!({"word": "graph", "count": 3}));
        assert_eq!(analysis["keywords"][1], json!({"word": "networks", "count": 3}));
    }

    #[test]
    fn test_html_title_and_markup_removed() {
        let doc = document(
            "<html><head><title>On Agents</title><style>p { color: red }</style></head>\
             <body><p>Agents pull work.</p><script>var agents = 1;</script></body></html>",
            Some("text/html; charset=utf-8"),
        );
        let analysis = TextAnalyzer::default().analyze(&doc).unwrap();
        assert_eq!(analysis["title"], "On Agents");
        assert_eq!(analysis["excerpt"], "On Agents Agents pull work.");
        assert!(!analysis["excerpt"].as_str().unwrap().contains("color"));
    }

    #[test]
    fn test_excerpt_is_truncated() {
        let analyzer = TextAnalyzer {
            excerpt_chars: 5,
            top_keywords: 3,
        };
        let analysis = analyzer.analyze(&document("abcdefgh ijk", None)).unwrap();
        assert_eq!(analysis["excerpt"], "abcde…");
    }

    #[test]
    fn test_empty_document_fails() {
        let result = TextAnalyzer::default().analyze(&document("  <br/> ", Some("text/html")));
        assert!(matches!(result, Err(AnalysisError::EmptyDocument(_))));
    }
}
