//! Attaching a finished research report to its session.

use serde_json::Value;

use crate::models::{ChatMessage, Session, Source, SourceKind, Timestamp, REPORT_BANNER};

/// Assistant message announcing a report.
pub fn banner_message(topic: &str) -> String {
    if topic.trim().is_empty() {
        format!("{REPORT_BANNER}\n\nThe full report was added to this session's sources.")
    } else {
        format!(
            "{REPORT_BANNER}: {}\n\nThe full report was added to this session's sources.",
            topic.trim()
        )
    }
}

/// Whether this job's report is already in the session.
pub fn report_inserted(session: &Session) -> bool {
    let anchor = session
        .research_state
        .as_ref()
        .and_then(|s| s.message_anchor)
        .unwrap_or(0);
    session.has_report() && session.has_report_banner_since(anchor)
}

/// Insert a report exactly once.
///
/// The banner message is the guard: a second delivery of the same report
/// (live result racing a recovery poll) finds it and changes nothing but the
/// job flags. Returns whether the session changed.
pub fn insert_report(
    session: &mut Session,
    report: &str,
    metadata: Option<&Value>,
    now: Timestamp,
) -> bool {
    if report_inserted(session) {
        return finish_job(session);
    }

    let topic = session
        .research_state
        .as_ref()
        .map(|s| s.topic.clone())
        .unwrap_or_default();

    session.research_report = Some(report.to_string());
    match session.streaming_message_mut() {
        Some(msg) => {
            msg.content = banner_message(&topic);
            msg.streaming = false;
        }
        None => session.messages.push(ChatMessage::assistant(banner_message(&topic))),
    }

    session.sources.retain(|s| s.kind != SourceKind::Report);
    session.sources.push(report_source(&topic, report, now));
    if let Some(metadata) = metadata {
        for source in metadata_sources(metadata, now) {
            session.add_source(source);
        }
    }

    finish_job(session);
    true
}

fn finish_job(session: &mut Session) -> bool {
    match session.research_state.as_mut() {
        Some(state) if state.running || state.pending_recovery => {
            state.complete();
            true
        }
        _ => false,
    }
}

fn report_source(topic: &str, report: &str, now: Timestamp) -> Source {
    let title = if topic.trim().is_empty() {
        "Deep research report".to_string()
    } else {
        format!("Deep research report - {}", topic.trim())
    };
    Source::new(format!("report-{}", now.as_millis()), SourceKind::Report, title)
        .with_content(report)
}

/// Sources cited in a report's metadata (`web_sources`, `rag_sources`,
/// `sources`).
pub fn metadata_sources(metadata: &Value, now: Timestamp) -> Vec<Source> {
    let millis = now.as_millis();
    let mut out = Vec::new();

    for (idx, item) in items(metadata, "web_sources").enumerate() {
        let url = text(item, &["url"]);
        let title =
            text(item, &["title", "url"]).unwrap_or_else(|| format!("Web source {}", idx + 1));
        let source = Source::new(format!("research-web-{millis}-{idx}"), SourceKind::Web, title)
            .with_url(url.unwrap_or_default())
            .with_content(text(item, &["content", "snippet"]).unwrap_or_default());
        out.push(source);
    }

    for (idx, item) in items(metadata, "rag_sources").enumerate() {
        let title = text(item, &["title", "source", "source_file", "kb_name"])
            .unwrap_or_else(|| format!("Knowledge base source {}", idx + 1));
        let source = Source::new(
            format!("research-rag-{millis}-{idx}"),
            SourceKind::KnowledgeBase,
            title,
        )
        .with_url(text(item, &["url"]).unwrap_or_default())
        .with_content(text(item, &["content", "content_preview"]).unwrap_or_default());
        out.push(source);
    }

    for (idx, item) in items(metadata, "sources").enumerate() {
        let kind = text(item, &["type"])
            .as_deref()
            .and_then(SourceKind::from_str)
            .unwrap_or(SourceKind::Web);
        let id = text(item, &["id"]).unwrap_or_else(|| format!("research-src-{millis}-{idx}"));
        let title = text(item, &["title", "url"]).unwrap_or_else(|| format!("Source {}", idx + 1));
        let source = Source::new(id, kind, title)
            .with_url(text(item, &["url"]).unwrap_or_default())
            .with_content(text(item, &["content", "snippet"]).unwrap_or_default());
        out.push(source);
    }

    out
}

fn items<'a>(metadata: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    metadata
        .get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn text(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| item.get(*k).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PlanDepth, ResearchJobState};
    use serde_json::json;

    fn researching_session() -> Session {
        let now = Timestamp::from_millis(1_700_000_000_000);
        let mut s = Session::new("s", now);
        s.messages.push(ChatMessage::user("Deep research: quantum computing"));
        s.messages.push(ChatMessage::placeholder());
        s.research_state = Some(ResearchJobState::begin(
            "quantum computing",
            PlanDepth::Medium,
            0,
            now,
        ));
        s
    }

    fn banners(s: &Session) -> usize {
        s.messages
            .iter()
            .filter(|m| m.content.contains(REPORT_BANNER))
            .count()
    }

    #[test]
    fn double_delivery_inserts_once() {
        let mut s = researching_session();
        let now = Timestamp::from_millis(1_700_000_100_000);
        assert!(insert_report(&mut s, "# Report\nbody", None, now));
        // Recovery poll delivers the same report again.
        assert!(!insert_report(&mut s, "# Report\nbody", None, now));

        assert_eq!(banners(&s), 1);
        let reports = s.sources.iter().filter(|x| x.kind == SourceKind::Report).count();
        assert_eq!(reports, 1);
        assert_eq!(s.messages.len(), 2);
        assert!(!s.messages[1].streaming);
        let state = s.research_state.as_ref().unwrap();
        assert!(!state.running);
        assert!(!state.pending_recovery);
    }

    #[test]
    fn new_job_replaces_previous_report_source() {
        let mut s = researching_session();
        insert_report(&mut s, "# Old", None, Timestamp::from_millis(1_700_000_001_000));

        let anchor = s.messages.len();
        s.messages.push(ChatMessage::user("Deep research: again"));
        s.research_state = Some(ResearchJobState::begin(
            "again",
            PlanDepth::Quick,
            anchor,
            Timestamp::from_millis(1_700_000_002_000),
        ));
        assert!(insert_report(&mut s, "# New", None, Timestamp::from_millis(1_700_000_003_000)));

        assert_eq!(banners(&s), 2);
        let reports: Vec<_> = s.sources.iter().filter(|x| x.kind == SourceKind::Report).collect();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].content.as_deref(), Some("# New"));
        assert_eq!(reports[0].title, "Deep research report - again");
    }

    #[test]
    fn metadata_sources_are_deduplicated() {
        let mut s = researching_session();
        let metadata = json!({
            "web_sources": [
                {"title": "A", "url": "https://a.example", "snippet": "a"},
                {"title": "A again", "url": "https://a.example"}
            ],
            "rag_sources": [{"source_file": "ch1.pdf", "content_preview": "intro"}],
            "sources": [{"id": "x1", "type": "file", "title": "notes.md"}]
        });
        insert_report(&mut s, "# R", Some(&metadata), Timestamp::from_millis(1_700_000_000_500));

        let kinds: Vec<_> = s.sources.iter().map(|x| x.kind).collect();
        assert_eq!(
            kinds,
            [SourceKind::Report, SourceKind::Web, SourceKind::KnowledgeBase, SourceKind::File]
        );
        assert_eq!(s.sources[2].title, "ch1.pdf");
    }
}
