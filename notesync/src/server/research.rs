//! Simulated research pipeline.
//!
//! A job runs in its own task and outlives the socket that started it, so a
//! client that drops its connection can still find the report through the
//! status endpoint or the session list.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::AppState;
use crate::api::JobStatus;
use crate::engine::insert_report;
use crate::models::{PlanDepth, ResearchJobState, Session, Timestamp};

const REPORTS_PATH: &str = "/api/outputs/research/reports";

/// One research job held by the dev backend.
#[derive(Debug)]
pub struct Job {
    pub notebook_id: String,
    pub session_id: String,
    pub topic: String,
    pub depth: PlanDepth,
    /// `planning`, `researching`, `reporting`, `completed` or `cancelled`.
    pub stage: String,
    pub report: Option<String>,
    pub metadata: Option<Value>,
    pub cancelled: bool,
    events: broadcast::Sender<Value>,
}

#[derive(Debug, Deserialize)]
struct StartFrame {
    topic: String,
    #[serde(default)]
    plan_mode: Option<PlanDepth>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    notebook_id: Option<String>,
}

impl AppState {
    /// Register a job and subscribe to its events before it starts.
    pub async fn create_job(
        &self,
        notebook_id: &str,
        session_id: &str,
        topic: &str,
        depth: PlanDepth,
    ) -> (String, broadcast::Receiver<Value>) {
        let job_id = format!("research_{}", uuid::Uuid::now_v7().simple());
        let (events, rx) = broadcast::channel(256);
        let job = Job {
            notebook_id: notebook_id.to_string(),
            session_id: session_id.to_string(),
            topic: topic.to_string(),
            depth,
            stage: "planning".to_string(),
            report: None,
            metadata: None,
            cancelled: false,
            events,
        };
        self.jobs.write().await.insert(job_id.clone(), job);
        (job_id, rx)
    }

    async fn cancel_job(&self, job_id: &str) {
        if let Some(job) = self.jobs.write().await.get_mut(job_id) {
            job.cancelled = true;
        }
    }

    /// Set the stage and broadcast a frame. Returns false once cancelled.
    async fn advance(&self, job_id: &str, stage: &str, frame: Value) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(job_id) else {
            return false;
        };
        if job.cancelled {
            job.stage = "cancelled".to_string();
            return false;
        }
        job.stage = stage.to_string();
        let _ = job.events.send(frame);
        true
    }

    /// Attach a finished report to the owning session, creating it if the
    /// client never persisted it.
    async fn attach_report(&self, job_id: &str, report: &str, metadata: &Value) {
        let (notebook_id, session_id, topic) = {
            let mut jobs = self.jobs.write().await;
            let Some(job) = jobs.get_mut(job_id) else {
                return;
            };
            job.stage = "completed".to_string();
            job.report = Some(report.to_string());
            job.metadata = Some(metadata.clone());
            (job.notebook_id.clone(), job.session_id.clone(), job.topic.clone())
        };

        let now = Timestamp::now();
        let mut notebooks = self.notebooks.write().await;
        let session = notebooks
            .entry(notebook_id)
            .or_default()
            .entry(session_id.clone())
            .or_insert_with(|| Session::new(session_id.clone(), now));
        if session.research_state.is_none() {
            session.research_state = Some(ResearchJobState {
                topic,
                message_anchor: Some(session.messages.len()),
                ..ResearchJobState::default()
            });
        }
        insert_report(session, report, Some(metadata), now);
        session.touch(now);
        info!(job_id, session_id, "report stored in session");
    }
}

pub(super) async fn research_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_research(socket, state))
}

async fn handle_research(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();

    let start = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<StartFrame>(text.as_str()) {
                    Ok(start) if !start.topic.trim().is_empty() => break start,
                    Ok(_) | Err(_) => {
                        let frame = json!({"type": "error", "content": "invalid start frame"});
                        let _ = sink.send(Message::Text(frame.to_string().into())).await;
                        return;
                    }
                }
            }
            Some(Ok(Message::Close(_)) | Err(_)) | None => return,
            Some(Ok(_)) => {}
        }
    };

    let notebook_id = start.notebook_id.unwrap_or_default();
    let session_id = start.session_id.unwrap_or_default();
    let depth = start.plan_mode.unwrap_or_default();
    let (job_id, mut events) = state
        .create_job(&notebook_id, &session_id, start.topic.trim(), depth)
        .await;
    info!(job_id, session_id, topic = %start.topic, "research job started");

    let opening = [
        json!({"type": "task_id", "task_id": job_id}),
        json!({"type": "status", "content": "research started", "research_id": job_id}),
    ];
    for frame in opening {
        if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
            break;
        }
    }
    tokio::spawn(run_pipeline(state.clone(), job_id.clone()));

    loop {
        tokio::select! {
            frame = events.recv() => match frame {
                Ok(frame) => {
                    let terminal = matches!(frame["type"].as_str(), Some("result" | "error"));
                    if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
                        debug!(job_id, "research listener went away, job continues");
                        break;
                    }
                    if terminal {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let cancel = serde_json::from_str::<Value>(text.as_str())
                        .is_ok_and(|v| v["type"] == "cancel");
                    if cancel {
                        info!(job_id, "research cancel requested");
                        state.cancel_job(&job_id).await;
                        break;
                    }
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => {
                    debug!(job_id, "research listener disconnected, job continues");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
    let _ = sink.close().await;
}

/// Planning, one step per sub-topic, reporting, then the report.
pub(super) async fn run_pipeline(state: Arc<AppState>, job_id: String) {
    let step = state.step;
    let Some((topic, depth)) = state
        .jobs
        .read()
        .await
        .get(&job_id)
        .map(|job| (job.topic.clone(), job.depth))
    else {
        return;
    };
    let sub_topics = plan(&topic, depth);
    let total = sub_topics.len();

    let planning = json!({
        "type": "progress",
        "stage": "planning",
        "message": format!("Planning {total} sub-topics"),
    });
    if !state.advance(&job_id, "planning", planning).await {
        return;
    }
    tokio::time::sleep(step).await;

    for (idx, sub_topic) in sub_topics.iter().enumerate() {
        let frame = json!({
            "type": "progress",
            "stage": "researching",
            "current": idx + 1,
            "total": total,
            "sub_topic": sub_topic,
        });
        if !state.advance(&job_id, "researching", frame).await {
            return;
        }
        tokio::time::sleep(step).await;
    }

    let reporting = json!({
        "type": "progress",
        "stage": "reporting",
        "current": total,
        "total": total,
    });
    if !state.advance(&job_id, "reporting", reporting).await {
        return;
    }
    tokio::time::sleep(step).await;

    let report = compose_report(&topic, &sub_topics);
    let metadata = json!({
        "web_sources": sub_topics
            .iter()
            .enumerate()
            .map(|(i, s)| json!({
                "title": s,
                "url": format!("https://example.org/{}/{}", slug(&topic), i + 1),
            }))
            .collect::<Vec<_>>(),
    });
    if state.jobs.read().await.get(&job_id).map_or(true, |j| j.cancelled) {
        return;
    }
    state.attach_report(&job_id, &report, &metadata).await;

    let frame = json!({
        "type": "result",
        "report": report,
        "metadata": metadata,
        "research_id": job_id,
    });
    if let Some(job) = state.jobs.read().await.get(&job_id) {
        let _ = job.events.send(frame);
    }
}

fn plan(topic: &str, depth: PlanDepth) -> Vec<String> {
    let count = match depth {
        PlanDepth::Quick => 2,
        PlanDepth::Medium | PlanDepth::Auto => 3,
        PlanDepth::Deep => 5,
    };
    let angles = ["background", "current state", "open problems", "applications", "outlook"];
    angles
        .iter()
        .take(count)
        .map(|angle| format!("{topic}: {angle}"))
        .collect()
}

fn compose_report(topic: &str, sub_topics: &[String]) -> String {
    let mut report = format!("# {topic}\n\n");
    for sub in sub_topics {
        report.push_str(&format!("## {sub}\n\nFindings on {sub}.\n\n"));
    }
    report.push_str("## Conclusion\n\nSimulated report from the development backend.\n");
    report
}

fn slug(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

pub(super) async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatus>, StatusCode> {
    let jobs = state.jobs.read().await;
    let job = jobs.get(&job_id).ok_or(StatusCode::NOT_FOUND)?;
    let has_report = job.report.is_some();
    Ok(Json(JobStatus {
        research_id: job_id.clone(),
        stage: job.stage.clone(),
        has_report,
        report_url: has_report.then(|| format!("{REPORTS_PATH}/{job_id}.md")),
        metadata: job.metadata.clone(),
    }))
}

pub(super) async fn download_report(
    State(state): State<Arc<AppState>>,
    Path(file): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let job_id = file.strip_suffix(".md").unwrap_or(&file);
    let jobs = state.jobs.read().await;
    let report = jobs
        .get(job_id)
        .and_then(|j| j.report.clone())
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(([(header::CONTENT_TYPE, "text/markdown; charset=utf-8")], report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancelled_job_stops_without_report() {
        let state = AppState::new(Duration::from_millis(5));
        let (job_id, mut events) = state.create_job("nb", "s", "tides", PlanDepth::Deep).await;
        state.cancel_job(&job_id).await;
        run_pipeline(state.clone(), job_id.clone()).await;

        assert!(events.try_recv().is_err());
        let jobs = state.jobs.read().await;
        assert_eq!(jobs[&job_id].stage, "cancelled");
        assert!(jobs[&job_id].report.is_none());
        assert!(state.notebooks.read().await.is_empty());
    }

    #[tokio::test]
    async fn pipeline_emits_progress_then_result() {
        let state = AppState::new(Duration::from_millis(1));
        let (job_id, mut events) = state.create_job("nb", "s", "tides", PlanDepth::Quick).await;
        run_pipeline(state.clone(), job_id).await;

        let mut kinds = Vec::new();
        while let Ok(frame) = events.try_recv() {
            let kind = frame["stage"].as_str().or(frame["type"].as_str()).unwrap();
            kinds.push(kind.to_string());
        }
        assert_eq!(
            kinds,
            ["planning", "researching", "researching", "reporting", "result"]
        );
    }

    #[test]
    fn plan_depth_sets_sub_topic_count() {
        assert_eq!(plan("x", PlanDepth::Quick).len(), 2);
        assert_eq!(plan("x", PlanDepth::Deep).len(), 5);
    }
}
