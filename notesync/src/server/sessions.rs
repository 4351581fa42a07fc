//! Session endpoints and the server-side upsert rules.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use tracing::debug;

use super::AppState;
use crate::models::{Session, SourceKind, Timestamp, REPORT_BANNER};

pub(super) async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Path(notebook_id): Path<String>,
) -> Json<Value> {
    let sessions = state.sessions(&notebook_id).await;
    Json(json!({ "sessions": sessions }))
}

pub(super) async fn upsert_session(
    State(state): State<Arc<AppState>>,
    Path(notebook_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, (StatusCode, String)> {
    // `{"session": {...}}`, or a bare session object.
    let raw = match body {
        Value::Object(mut map) if map.contains_key("session") => map
            .remove("session")
            .unwrap_or(Value::Null),
        other => other,
    };
    let incoming: Session = serde_json::from_value(raw)
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, format!("invalid session: {e}")))?;
    if incoming.session_id.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "session_id is required".into()));
    }

    let stored = {
        let mut notebooks = state.notebooks.write().await;
        let sessions = notebooks.entry(notebook_id.clone()).or_default();
        let merged = merge_upsert(sessions.get(&incoming.session_id), incoming, Timestamp::now());
        sessions.insert(merged.session_id.clone(), merged.clone());
        merged
    };
    debug!(notebook_id, session_id = %stored.session_id, "session upserted");
    Ok(Json(json!({ "session": stored })))
}

/// Combine an incoming snapshot with the stored copy.
///
/// A client that never saw a report (its stream was lost) must not erase one
/// the server already attached: the stored report, its banner messages and
/// its report sources survive an incoming snapshot that lacks them.
pub fn merge_upsert(stored: Option<&Session>, mut incoming: Session, now: Timestamp) -> Session {
    if incoming.updated_at == Timestamp::default() {
        incoming.updated_at = now;
    }

    match stored {
        Some(stored) => {
            incoming.created_at = stored.created_at;
            if !incoming.has_report() && stored.has_report() {
                incoming.research_report.clone_from(&stored.research_report);
            }
            if has_banner(stored) && !has_banner(&incoming) {
                incoming.messages.clone_from(&stored.messages);
            }
            let incoming_has_report_source = incoming
                .sources
                .iter()
                .any(|s| s.kind == SourceKind::Report);
            if !incoming_has_report_source {
                incoming.sources.extend(
                    stored
                        .sources
                        .iter()
                        .filter(|s| s.kind == SourceKind::Report)
                        .cloned(),
                );
            }
        }
        None => {
            if incoming.created_at == Timestamp::default() {
                incoming.created_at = now;
            }
        }
    }

    if incoming.title.as_deref().map_or(true, |t| t.trim().is_empty()) {
        incoming.title = Some(incoming.title());
    }
    incoming
}

fn has_banner(session: &Session) -> bool {
    session
        .messages
        .iter()
        .any(|m| m.is_assistant() && m.content.contains(REPORT_BANNER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatMessage, Source};

    fn at(ms: i64) -> Timestamp {
        Timestamp::from_millis(1_700_000_000_000 + ms)
    }

    fn with_report() -> Session {
        let mut s = Session::new("s1", at(0));
        s.messages.push(ChatMessage::user("Deep research: tides"));
        s.messages
            .push(ChatMessage::assistant(format!("{REPORT_BANNER}: tides")));
        s.research_report = Some("# tides".into());
        s.sources.push(
            Source::new("report-1", SourceKind::Report, "Deep research report - tides")
                .with_content("# tides"),
        );
        s
    }

    #[test]
    fn stale_client_snapshot_keeps_server_report() {
        let stored = with_report();
        let mut incoming = Session::new("s1", at(500));
        incoming.messages.push(ChatMessage::user("Deep research: tides"));
        incoming.messages.push(ChatMessage::assistant("[connection lost, report incomplete]"));
        incoming.sources.push(Source::new("web-1", SourceKind::Web, "A"));
        incoming.updated_at = at(900);

        let merged = merge_upsert(Some(&stored), incoming, at(1_000));
        assert_eq!(merged.created_at, at(0));
        assert_eq!(merged.updated_at, at(900));
        assert_eq!(merged.research_report.as_deref(), Some("# tides"));
        assert_eq!(merged.messages, stored.messages);
        let kinds: Vec<_> = merged.sources.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, [SourceKind::Web, SourceKind::Report]);
    }

    #[test]
    fn newer_report_replaces_stored_one() {
        let stored = with_report();
        let mut incoming = with_report();
        incoming.research_report = Some("# tides v2".into());
        incoming.sources[0].content = Some("# tides v2".into());
        incoming.messages.push(ChatMessage::user("thanks"));

        let merged = merge_upsert(Some(&stored), incoming.clone(), at(1_000));
        assert_eq!(merged.research_report.as_deref(), Some("# tides v2"));
        assert_eq!(merged.messages, incoming.messages);
        assert_eq!(merged.sources.len(), 1);
    }

    #[test]
    fn first_upsert_fills_timestamps_and_title() {
        let mut incoming = Session::new("s9", Timestamp::default());
        incoming.messages.push(ChatMessage::user("hello there"));
        let merged = merge_upsert(None, incoming, at(42));
        assert_eq!(merged.created_at, at(42));
        assert_eq!(merged.updated_at, at(42));
        assert!(merged.title.unwrap().ends_with("hello there"));
    }
}
