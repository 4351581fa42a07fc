//! Development backend.
//!
//! An in-memory stand-in for the notebook service so the client can be run
//! end to end on one machine.
//!
//! Endpoints:
//! - GET  /api/v1/notebooks/{id}/sessions - list sessions
//! - POST /api/v1/notebooks/{id}/sessions - upsert one session
//! - WS   /api/v1/research/run - start a research job and stream its events
//! - GET  /api/v1/research/status/{job_id} - job status
//! - WS   /api/v1/chat - canned streaming chat
//! - GET  /api/outputs/research/reports/{file} - report download
//! - GET  / - overview of notebooks and jobs

mod chat;
mod research;
mod sessions;

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;

use crate::models::Session;

use research::Job;

/// Shared server state.
pub struct AppState {
    /// notebook id -> session id -> session
    notebooks: RwLock<HashMap<String, BTreeMap<String, Session>>>,
    jobs: RwLock<HashMap<String, Job>>,
    /// Delay between simulated pipeline steps.
    step: Duration,
}

impl AppState {
    pub fn new(step: Duration) -> Arc<Self> {
        Arc::new(Self {
            notebooks: RwLock::new(HashMap::new()),
            jobs: RwLock::new(HashMap::new()),
            step,
        })
    }

    /// Sessions of a notebook, oldest first.
    pub async fn sessions(&self, notebook_id: &str) -> Vec<Session> {
        let notebooks = self.notebooks.read().await;
        let mut sessions: Vec<Session> = notebooks
            .get(notebook_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route(
            "/api/v1/notebooks/{notebook_id}/sessions",
            get(sessions::list_sessions).post(sessions::upsert_session),
        )
        .route("/api/v1/research/run", get(research::research_socket))
        .route("/api/v1/research/status/{job_id}", get(research::job_status))
        .route("/api/v1/chat", get(chat::chat_socket))
        .route(
            "/api/outputs/research/reports/{file}",
            get(research::download_report),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the server and block until it stops.
pub async fn start_server(port: u16, open_browser: bool, step_ms: u64) -> Result<()> {
    let state = AppState::new(Duration::from_millis(step_ms));
    let app = router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    println!("notesync dev backend on http://{addr}");
    println!("API base: http://{addr}/api/v1");

    if open_browser {
        let _ = open::that(format!("http://{addr}/"));
    }

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

async fn index_handler(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Json<Value> {
    let notebooks: Vec<Value> = {
        let notebooks = state.notebooks.read().await;
        let mut list: Vec<Value> = notebooks
            .iter()
            .map(|(id, sessions)| json!({"notebook_id": id, "sessions": sessions.len()}))
            .collect();
        list.sort_by_key(|v| v["notebook_id"].as_str().unwrap_or_default().to_string());
        list
    };
    let jobs: Vec<Value> = {
        let jobs = state.jobs.read().await;
        jobs.iter()
            .map(|(id, job)| {
                json!({
                    "research_id": id,
                    "topic": job.topic,
                    "stage": job.stage,
                    "session_id": job.session_id,
                })
            })
            .collect()
    };
    Json(json!({"notebooks": notebooks, "jobs": jobs}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{HttpBackend, ResearchApi, SessionApi};
    use crate::cache::LocalCache;
    use crate::config::SyncConfig;
    use crate::engine::{NotebookRuntime, Notice, Outcome, View};
    use crate::models::{PlanDepth, SourceKind, REPORT_BANNER};
    use tokio::sync::broadcast;

    async fn spawn_backend() -> (SyncConfig, Arc<AppState>) {
        let state = AppState::new(Duration::from_millis(15));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let config = SyncConfig {
            api_base: format!("http://{addr}/api/v1"),
            debounce_ms: 20,
            connect_timeout_secs: 5,
            recovery_delay_ms: 50,
            recovery_retry_secs: 1,
            request_timeout_secs: 5,
            ..SyncConfig::default()
        };
        (config, state)
    }

    async fn wait_for(
        notices: &mut broadcast::Receiver<Notice>,
        pred: impl Fn(&Notice) -> bool,
    ) -> Notice {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match notices.recv().await {
                    Ok(n) if pred(&n) => return n,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("runtime stopped"),
                }
            }
        })
        .await
        .expect("notice in time")
    }

    fn report_count(view: &View) -> usize {
        view.current_session()
            .map(|s| s.sources.iter().filter(|x| x.kind == SourceKind::Report).count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn research_streams_to_completion() {
        let (config, state) = spawn_backend().await;
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open_at(dir.path()).unwrap();
        let backend = HttpBackend::new(&config).unwrap();
        let runtime = NotebookRuntime::new("nb1", &config, cache, backend).unwrap();
        let (handle, mut notices) = runtime.spawn();

        wait_for(&mut notices, |n| matches!(n, Notice::Synced { .. })).await;
        handle
            .start_research("quantum computing", PlanDepth::Quick, None)
            .await
            .unwrap();
        let done = wait_for(&mut notices, |n| matches!(n, Notice::ResearchFinished { .. })).await;
        assert!(matches!(
            done,
            Notice::ResearchFinished {
                outcome: Outcome::Completed,
                ..
            }
        ));

        let view = handle.shutdown().await.unwrap();
        assert_eq!(report_count(&view), 1);
        let session = view.current_session().unwrap();
        assert!(!session.pending_recovery());

        // The server persisted the same report into its copy.
        let stored = state.sessions("nb1").await;
        assert_eq!(stored.len(), 1);
        assert!(stored[0].has_report());
        assert_eq!(stored[0].session_id, session.session_id);
    }

    #[tokio::test]
    async fn reload_after_lost_stream_recovers_report() {
        let (config, state) = spawn_backend().await;
        let dir = tempfile::tempdir().unwrap();

        // First page: start a job and leave before it finishes.
        let runtime = NotebookRuntime::new(
            "nb2",
            &config,
            LocalCache::open_at(dir.path()).unwrap(),
            HttpBackend::new(&config).unwrap(),
        )
        .unwrap();
        let (handle, mut notices) = runtime.spawn();
        wait_for(&mut notices, |n| matches!(n, Notice::Synced { .. })).await;
        handle
            .start_research("ocean currents", PlanDepth::Medium, None)
            .await
            .unwrap();
        let first = handle.shutdown().await.unwrap();
        let session_id = first.current_session_id.clone().unwrap();
        assert!(first.current_session().unwrap().pending_recovery());

        // The job keeps running on the server without a listener.
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let done = state
                    .sessions("nb2")
                    .await
                    .iter()
                    .any(|s| s.session_id == session_id && s.has_report());
                if done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("server finished the job");

        // Second page over the same cache.
        let runtime = NotebookRuntime::new(
            "nb2",
            &config,
            LocalCache::open_at(dir.path()).unwrap(),
            HttpBackend::new(&config).unwrap(),
        )
        .unwrap();
        let (handle, _notices) = runtime.spawn();
        let view = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let view = handle.inspect().await.unwrap();
                let recovered = view
                    .current_session()
                    .is_some_and(|s| s.has_report() && !s.pending_recovery());
                if recovered {
                    return view;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("report recovered after reload");

        let session = view.current_session().unwrap();
        assert_eq!(session.session_id, session_id);
        assert_eq!(report_count(&view), 1);
        let banners = session
            .messages
            .iter()
            .filter(|m| m.content.contains(REPORT_BANNER))
            .count();
        assert_eq!(banners, 1);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn status_and_report_endpoints() {
        let (config, state) = spawn_backend().await;
        let backend = HttpBackend::new(&config).unwrap();
        assert_eq!(backend.job_status("research_missing").await.unwrap(), None);

        let job_id = state
            .create_job("nb3", "s1", "tides", PlanDepth::Quick)
            .await
            .0;
        research::run_pipeline(state.clone(), job_id.clone()).await;

        let status = backend.job_status(&job_id).await.unwrap().unwrap();
        assert_eq!(status.stage, "completed");
        assert!(status.report_ready());
        let report = backend
            .fetch_report(status.report_url.as_deref().unwrap())
            .await
            .unwrap();
        assert!(report.starts_with("# tides"));

        let sessions = backend.list_sessions("nb3").await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].research_report.as_deref(), Some(report.as_str()));
    }
}
