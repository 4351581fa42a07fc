//! Tagged events received over the chat and research transports.
//!
//! Frames are JSON objects dispatched on their `type` field. Unknown types
//! parse to an `Unknown` variant so new server events never break a stream.

use serde_json::Value;

use crate::models::{Progress, ResearchPhase, Source, SourceKind};

/// One frame from the research transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ResearchEvent {
    /// The server assigned a task id.
    TaskId(String),
    /// Free-form status line, possibly carrying the job id.
    Status {
        content: String,
        job_id: Option<String>,
    },
    Progress {
        phase: Option<ResearchPhase>,
        progress: Option<Progress>,
        sub_topic: Option<String>,
        message: Option<String>,
    },
    Log(String),
    Ping,
    /// Terminal by indirection: the report must be fetched from here.
    ReportPath(String),
    /// Terminal: the finished report.
    Result {
        report: String,
        metadata: Option<Value>,
        job_id: Option<String>,
    },
    /// Terminal: the job failed.
    Error(String),
    Unknown(String),
}

impl ResearchEvent {
    /// Parse one text frame. Returns `None` for blank or non-JSON input.
    pub fn parse(frame: &str) -> Option<Self> {
        let value = parse_object(frame)?;
        Some(Self::from_value(&value))
    }

    pub fn from_value(value: &Value) -> Self {
        let kind = value.get("type").and_then(Value::as_str);
        match kind {
            Some("task_id") => {
                Self::TaskId(str_field(value, &["task_id", "taskId"]).unwrap_or_default())
            }
            Some("status") => Self::Status {
                content: str_field(value, &["content", "message"]).unwrap_or_default(),
                job_id: str_field(value, &["research_id", "researchId", "task_id"]),
            },
            Some("progress") => Self::Progress {
                phase: str_field(value, &["stage", "phase"])
                    .as_deref()
                    .and_then(ResearchPhase::from_str),
                progress: counters(value),
                sub_topic: str_field(value, &["sub_topic", "current_topic", "currentSubTopic"]),
                message: str_field(value, &["message"]),
            },
            Some("log") => Self::Log(str_field(value, &["content", "message"]).unwrap_or_default()),
            Some("ping") => Self::Ping,
            Some("report_path" | "reportPath") => {
                let path = str_field(value, &["path", "url", "report_path"]);
                Self::ReportPath(path.unwrap_or_default())
            }
            Some("result") => Self::Result {
                report: str_field(value, &["report", "content"]).unwrap_or_default(),
                metadata: value.get("metadata").filter(|m| !m.is_null()).cloned(),
                job_id: str_field(value, &["research_id", "researchId"]),
            },
            Some("error") => Self::Error(error_text(value)),
            None if value.get("error").is_some() => Self::Error(error_text(value)),
            Some(other) => Self::Unknown(other.to_string()),
            None => Self::Unknown(String::new()),
        }
    }

    /// Whether this event ends the job.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::ReportPath(_) | Self::Result { .. } | Self::Error(_))
    }
}

/// One frame from the chat transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// Incremental assistant text.
    Stream(String),
    /// Terminal: the full answer and any cited sources.
    Result {
        content: String,
        sources: Vec<Source>,
    },
    Error(String),
    Unknown(String),
}

impl ChatEvent {
    pub fn parse(frame: &str) -> Option<Self> {
        let value = parse_object(frame)?;
        Some(Self::from_value(&value))
    }

    pub fn from_value(value: &Value) -> Self {
        match value.get("type").and_then(Value::as_str) {
            Some("stream") => Self::Stream(str_field(value, &["content"]).unwrap_or_default()),
            Some("result") => Self::Result {
                content: str_field(value, &["content"]).unwrap_or_default(),
                sources: chat_sources(value.get("sources")),
            },
            Some("error") => Self::Error(error_text(value)),
            None if value.get("error").is_some() => Self::Error(error_text(value)),
            Some(other) => Self::Unknown(other.to_string()),
            None => Self::Unknown(String::new()),
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Result { .. } | Self::Error(_))
    }
}

fn parse_object(frame: &str) -> Option<Value> {
    let frame = frame.trim();
    if frame.is_empty() {
        return None;
    }
    serde_json::from_str::<Value>(frame)
        .ok()
        .filter(Value::is_object)
}

/// First non-empty string among `keys`.
fn str_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| value.get(*k))
        .find_map(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn counters(value: &Value) -> Option<Progress> {
    let read = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    };
    match (read("current"), read("total")) {
        (None, None) => None,
        (current, total) => Some(Progress {
            current: current.unwrap_or(0),
            total: total.unwrap_or(0),
        }),
    }
}

fn error_text(value: &Value) -> String {
    str_field(value, &["content", "error", "message"])
        .unwrap_or_else(|| "unknown error".to_string())
}

/// Chat results cite sources as `{rag: [...], web: [...]}` or a flat list.
fn chat_sources(value: Option<&Value>) -> Vec<Source> {
    let Some(value) = value else {
        return Vec::new();
    };
    let mut out = Vec::new();
    match value {
        Value::Array(items) => {
            for item in items {
                let kind = item
                    .get("type")
                    .and_then(Value::as_str)
                    .and_then(SourceKind::from_str)
                    .unwrap_or(SourceKind::Web);
                out.extend(source_from_item(item, kind));
            }
        }
        Value::Object(map) => {
            for (key, kind) in [("rag", SourceKind::KnowledgeBase), ("web", SourceKind::Web)] {
                if let Some(Value::Array(items)) = map.get(key) {
                    for item in items {
                        out.extend(source_from_item(item, kind));
                    }
                }
            }
        }
        _ => {}
    }
    out
}

fn source_from_item(item: &Value, kind: SourceKind) -> Option<Source> {
    let url = str_field(item, &["url"]);
    let title = str_field(item, &["title", "source", "kb_name"]).or_else(|| url.clone())?;
    // Sources without an id get one when they are attached to a session.
    let id = str_field(item, &["id"]).unwrap_or_default();
    let mut source = Source::new(id, kind, title);
    if let Some(url) = url {
        source = source.with_url(url);
    }
    if let Some(content) = str_field(item, &["content", "snippet", "content_preview"]) {
        source = source.with_content(content);
    }
    Some(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_research_progress() {
        let ev = ResearchEvent::parse(
            r#"{"type":"progress","stage":"researching","current":1,"total":3,"sub_topic":"qubits"}"#,
        )
        .unwrap();
        assert_eq!(
            ev,
            ResearchEvent::Progress {
                phase: Some(ResearchPhase::Researching),
                progress: Some(Progress { current: 1, total: 3 }),
                sub_topic: Some("qubits".into()),
                message: None,
            }
        );
        assert!(!ev.is_terminal());
    }

    #[test]
    fn accepts_phase_key_and_camel_report_path() {
        let ev = ResearchEvent::parse(r#"{"type":"progress","phase":"planning"}"#).unwrap();
        assert!(matches!(
            ev,
            ResearchEvent::Progress { phase: Some(ResearchPhase::Planning), progress: None, .. }
        ));
        let ev = ResearchEvent::parse(r#"{"type":"reportPath","url":"/r.md"}"#).unwrap();
        assert_eq!(ev, ResearchEvent::ReportPath("/r.md".into()));
        assert!(ev.is_terminal());
    }

    #[test]
    fn untyped_error_frame_is_an_error() {
        let ev = ResearchEvent::parse(r#"{"error":"boom"}"#).unwrap();
        assert_eq!(ev, ResearchEvent::Error("boom".into()));
    }

    #[test]
    fn result_keeps_metadata() {
        let ev = ResearchEvent::parse(
            r##"{"type":"result","report":"# Report","metadata":{"web_sources":[]},"research_id":"r1"}"##,
        )
        .unwrap();
        match ev {
            ResearchEvent::Result { report, metadata, job_id } => {
                assert_eq!(report, "# Report");
                assert!(metadata.is_some());
                assert_eq!(job_id.as_deref(), Some("r1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_and_garbage() {
        assert_eq!(
            ResearchEvent::parse(r#"{"type":"mystery"}"#),
            Some(ResearchEvent::Unknown("mystery".into()))
        );
        assert!(ResearchEvent::parse("not json").is_none());
        assert!(ResearchEvent::parse("[1,2]").is_none());
    }

    #[test]
    fn chat_result_collects_grouped_sources() {
        let ev = ChatEvent::parse(
            r#"{"type":"result","content":"answer","sources":{"rag":[{"title":"Ch 1","content":"x"}],"web":[{"url":"https://a.example","title":"A"}]}}"#,
        )
        .unwrap();
        let ChatEvent::Result { content, sources } = ev else {
            panic!("expected result");
        };
        assert_eq!(content, "answer");
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].kind, SourceKind::KnowledgeBase);
        assert_eq!(sources[1].url.as_deref(), Some("https://a.example"));
    }

    #[test]
    fn chat_stream_and_error() {
        assert_eq!(
            ChatEvent::parse(r#"{"type":"stream","content":"he"}"#),
            Some(ChatEvent::Stream("he".into()))
        );
        assert_eq!(
            ChatEvent::parse(r#"{"type":"error","content":"nope"}"#),
            Some(ChatEvent::Error("nope".into()))
        );
    }
}
