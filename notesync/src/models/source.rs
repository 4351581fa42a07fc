//! Citation and content units attached to a session.

use serde::{Deserialize, Serialize};

/// Kind of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    #[serde(rename = "web")]
    Web,
    #[serde(rename = "kb", alias = "knowledge-base", alias = "rag")]
    KnowledgeBase,
    #[serde(rename = "file", alias = "upload")]
    File,
    #[serde(rename = "report", alias = "generated-report")]
    Report,
}

impl SourceKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::KnowledgeBase => "kb",
            Self::File => "file",
            Self::Report => "report",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "web" => Some(Self::Web),
            "kb" | "knowledge-base" | "rag" => Some(Self::KnowledgeBase),
            "file" | "upload" => Some(Self::File),
            "report" | "generated-report" => Some(Self::Report),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

const fn default_selected() -> bool {
    true
}

/// One source owned by exactly one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: SourceKind,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default = "default_selected")]
    pub selected: bool,
}

impl Source {
    pub fn new(id: impl Into<String>, kind: SourceKind, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            title: title.into(),
            url: None,
            content: None,
            selected: true,
        }
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.url = (!url.is_empty()).then_some(url);
        self
    }

    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        let content = content.into();
        self.content = (!content.is_empty()).then_some(content);
        self
    }

    /// Identity used to avoid attaching the same reference twice.
    pub fn dedup_key(&self) -> String {
        let locator = self
            .url
            .as_deref()
            .filter(|u| !u.is_empty())
            .or_else(|| Some(self.title.as_str()).filter(|t| !t.is_empty()))
            .unwrap_or(self.id.as_str());
        format!("{}-{locator}", self.kind)
    }

    /// Render as a markdown section for export.
    pub fn to_markdown(&self) -> String {
        let mut out = format!("## {}\n", self.title);
        if let Some(url) = &self.url {
            out.push_str(&format!("Source: {url}\n"));
        }
        if let Some(content) = &self.content {
            out.push('\n');
            out.push_str(content.trim_end());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selected_defaults_to_true() {
        let json = r#"{"id":"s1","type":"web","title":"Example"}"#;
        let source: Source = serde_json::from_str(json).unwrap();
        assert!(source.selected);
        assert_eq!(source.kind, SourceKind::Web);
    }

    #[test]
    fn accepts_long_kind_names() {
        let json = r#"{"id":"r","type":"generated-report","title":"R","selected":false}"#;
        let source: Source = serde_json::from_str(json).unwrap();
        assert_eq!(source.kind, SourceKind::Report);
        assert!(!source.selected);
        let back = serde_json::to_value(&source).unwrap();
        assert_eq!(back["type"], "report");
    }

    #[test]
    fn dedup_key_prefers_url() {
        let a = Source::new("1", SourceKind::Web, "A").with_url("https://a.example");
        let b = Source::new("2", SourceKind::Web, "B").with_url("https://a.example");
        let c = Source::new("3", SourceKind::KnowledgeBase, "A");
        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_eq!(c.dedup_key(), "kb-A");
    }

    #[test]
    fn markdown_section() {
        let s = Source::new("1", SourceKind::Web, "Title")
            .with_url("https://x.example")
            .with_content("Body\n");
        assert_eq!(s.to_markdown(), "## Title\nSource: https://x.example\n\nBody\n");
    }
}
