//! Session model: one chat/research thread within a notebook.

use serde::{Deserialize, Serialize};

use super::{ChatMessage, MessageRole, ResearchJobState, Source, Timestamp};

/// Marker that opens the assistant message announcing a finished research report.
pub const REPORT_BANNER: &str = "📚 Deep research complete";

const TITLE_SNIPPET_CHARS: usize = 40;

/// One conversational/research thread within a notebook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(alias = "sessionId", alias = "id")]
    pub session_id: String,
    /// Title as stored by the backend; see [`Session::title`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default, alias = "researchReport", skip_serializing_if = "Option::is_none")]
    pub research_report: Option<String>,
    #[serde(default, alias = "researchState", skip_serializing_if = "Option::is_none")]
    pub research_state: Option<ResearchJobState>,
    #[serde(default, alias = "createdAt")]
    pub created_at: Timestamp,
    #[serde(default, alias = "updatedAt")]
    pub updated_at: Timestamp,
}

impl Session {
    /// Create an empty session.
    pub fn new(session_id: impl Into<String>, now: Timestamp) -> Self {
        Self {
            session_id: session_id.into(),
            title: None,
            messages: Vec::new(),
            sources: Vec::new(),
            research_report: None,
            research_state: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Client-side id for a session created at `now`.
    pub fn generate_id(now: Timestamp) -> String {
        format!("session-{}", now.as_millis())
    }

    /// Display title: the stored one, or one derived from creation time and
    /// the first user message.
    pub fn title(&self) -> String {
        match self.title.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => derive_title(self),
        }
    }

    /// Bump `updated_at` so it stays strictly monotonic.
    pub fn touch(&mut self, now: Timestamp) {
        self.updated_at = self.updated_at.advance_to(now);
    }

    pub fn has_report(&self) -> bool {
        self.research_report
            .as_deref()
            .is_some_and(|r| !r.trim().is_empty())
    }

    /// Whether a report banner already sits in an assistant message at or
    /// after `from`.
    pub fn has_report_banner_since(&self, from: usize) -> bool {
        self.messages
            .iter()
            .skip(from)
            .any(|m| m.is_assistant() && m.content.contains(REPORT_BANNER))
    }

    pub fn pending_recovery(&self) -> bool {
        self.research_state
            .as_ref()
            .is_some_and(|s| s.pending_recovery)
    }

    pub fn research_running(&self) -> bool {
        self.research_state.as_ref().is_some_and(|s| s.running)
    }

    /// The last assistant message if it is still streaming.
    pub fn streaming_message_mut(&mut self) -> Option<&mut ChatMessage> {
        self.messages
            .iter_mut()
            .rev()
            .find(|m| m.is_assistant() && m.streaming)
    }

    pub fn selected_sources(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter().filter(|s| s.selected)
    }

    /// Flip the selection flag of one source. Returns the new value.
    pub fn toggle_source(&mut self, source_id: &str) -> Option<bool> {
        let source = self.sources.iter_mut().find(|s| s.id == source_id)?;
        source.selected = !source.selected;
        Some(source.selected)
    }

    /// Attach a source unless one with the same identity is already present.
    pub fn add_source(&mut self, source: Source) -> bool {
        let key = source.dedup_key();
        if self
            .sources
            .iter()
            .any(|s| s.id == source.id || s.dedup_key() == key)
        {
            return false;
        }
        self.sources.push(source);
        true
    }

    /// Chat history as sent to the chat transport.
    pub fn history(&self) -> Vec<(MessageRole, &str)> {
        self.messages
            .iter()
            .filter(|m| !m.streaming && !m.content.is_empty())
            .map(|m| (m.role, m.content.as_str()))
            .collect()
    }
}

/// Render selected sources as one markdown document for export.
pub fn sources_markdown<'a>(sources: impl IntoIterator<Item = &'a Source>) -> String {
    sources
        .into_iter()
        .map(Source::to_markdown)
        .collect::<Vec<_>>()
        .join("\n")
}

fn derive_title(session: &Session) -> String {
    let time_label = session
        .created_at
        .to_local()
        .format("%Y-%m-%d %H:%M")
        .to_string();

    let first_user = session
        .messages
        .iter()
        .find(|m| m.role == MessageRole::User && !m.content.trim().is_empty());

    match first_user {
        Some(msg) => {
            let collapsed = msg.content.split_whitespace().collect::<Vec<_>>().join(" ");
            let short = if collapsed.chars().count() > TITLE_SNIPPET_CHARS {
                let cut: String = collapsed.chars().take(TITLE_SNIPPET_CHARS).collect();
                format!("{cut}...")
            } else {
                collapsed
            };
            format!("{time_label} · {short}")
        }
        None => time_label,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceKind;

    #[test]
    fn title_uses_first_user_message() {
        let mut s = Session::new("session-1", Timestamp::from_millis(1_700_000_000_000));
        s.messages.push(ChatMessage::assistant("hello"));
        s.messages.push(ChatMessage::user("  what   is\nquantum computing  "));
        let title = s.title();
        assert!(title.ends_with(" · what is quantum computing"), "{title}");
    }

    #[test]
    fn title_truncates_long_messages() {
        let mut s = Session::new("session-1", Timestamp::from_millis(0));
        s.messages.push(ChatMessage::user("x".repeat(60)));
        let title = s.title();
        assert!(title.ends_with(&format!("{}...", "x".repeat(40))));
    }

    #[test]
    fn stored_title_wins() {
        let mut s = Session::new("session-1", Timestamp::from_millis(0));
        s.title = Some("Named".into());
        assert_eq!(s.title(), "Named");
    }

    #[test]
    fn accepts_camel_case_and_id_alias() {
        let json = r##"{"id":"abc","researchReport":"# R","updatedAt":1700000000,"sources":[]}"##;
        let s: Session = serde_json::from_str(json).unwrap();
        assert_eq!(s.session_id, "abc");
        assert!(s.has_report());
        assert_eq!(s.updated_at.as_millis(), 1_700_000_000_000);
    }

    #[test]
    fn toggle_and_dedup_sources() {
        let mut s = Session::new("a", Timestamp::from_millis(0));
        assert!(s.add_source(Source::new("1", SourceKind::Web, "A").with_url("u")));
        assert!(!s.add_source(Source::new("2", SourceKind::Web, "B").with_url("u")));
        assert_eq!(s.toggle_source("1"), Some(false));
        assert_eq!(s.selected_sources().count(), 0);
        assert_eq!(s.toggle_source("missing"), None);
    }

    #[test]
    fn banner_search_respects_anchor() {
        let mut s = Session::new("a", Timestamp::from_millis(0));
        s.messages.push(ChatMessage::assistant(format!("{REPORT_BANNER}: old")));
        s.messages.push(ChatMessage::user("again"));
        assert!(s.has_report_banner_since(0));
        assert!(!s.has_report_banner_since(1));
    }
}
