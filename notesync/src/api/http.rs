//! reqwest implementation of the backend contracts.

use std::path::Path;

use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

use super::{JobStatus, ResearchApi, SessionApi};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::models::Session;

const REPORTS_PATH: &str = "/api/outputs/research/reports";

#[derive(Debug, Deserialize)]
struct SessionsResponse {
    #[serde(default)]
    sessions: Vec<Session>,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    session: Session,
}

/// HTTP client for the backend API.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    api_base: String,
    origin: Url,
}

impl HttpBackend {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()?;
        Self::with_client(client, &config.api_base)
    }

    pub fn with_client(client: reqwest::Client, api_base: &str) -> Result<Self> {
        let api_base = api_base.trim_end_matches('/').to_string();
        let parsed =
            Url::parse(&api_base).map_err(|e| SyncError::InvalidUrl(format!("{api_base}: {e}")))?;
        let origin = Url::parse(&parsed.origin().ascii_serialization())
            .map_err(|e| SyncError::InvalidUrl(format!("{api_base}: {e}")))?;
        Ok(Self {
            client,
            api_base,
            origin,
        })
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn sessions_url(&self, notebook_id: &str) -> String {
        format!(
            "{}/notebooks/{}/sessions",
            self.api_base,
            urlencoding::encode(notebook_id)
        )
    }

    /// Turn whatever the backend handed out into an absolute report URL.
    ///
    /// Absolute URLs pass through, server-relative paths join the API
    /// origin, and anything else is taken as a report file path whose name
    /// is served from the reports directory.
    pub fn resolve_report_url(&self, raw: &str) -> Result<Url> {
        let raw = raw.trim();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Url::parse(raw).map_err(|e| SyncError::InvalidUrl(format!("{raw}: {e}")));
        }
        let path = if raw.starts_with("/api/") {
            raw.to_string()
        } else {
            let name = Path::new(raw)
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| SyncError::InvalidUrl(raw.to_string()))?;
            format!("{REPORTS_PATH}/{}", urlencoding::encode(name))
        };
        self.origin
            .join(&path)
            .map_err(|e| SyncError::InvalidUrl(format!("{raw}: {e}")))
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(resp.url().to_string()));
        }
        if !status.is_success() {
            return Err(SyncError::Status {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp)
    }
}

impl SessionApi for HttpBackend {
    async fn list_sessions(&self, notebook_id: &str) -> Result<Vec<Session>> {
        let url = self.sessions_url(notebook_id);
        let resp = Self::check(self.client.get(&url).send().await?).await?;
        let body: SessionsResponse = resp.json().await?;
        debug!(notebook_id, count = body.sessions.len(), "fetched remote sessions");
        Ok(body.sessions)
    }

    async fn upsert_session(&self, notebook_id: &str, session: &Session) -> Result<Session> {
        let url = self.sessions_url(notebook_id);
        let body = serde_json::json!({ "session": session });
        let resp = Self::check(self.client.post(&url).json(&body).send().await?).await?;
        let stored: SessionResponse = resp.json().await?;
        debug!(
            notebook_id,
            session_id = %stored.session.session_id,
            "persisted session"
        );
        Ok(stored.session)
    }
}

impl ResearchApi for HttpBackend {
    async fn job_status(&self, job_id: &str) -> Result<Option<JobStatus>> {
        let url = format!(
            "{}/research/status/{}",
            self.api_base,
            urlencoding::encode(job_id)
        );
        match Self::check(self.client.get(&url).send().await?).await {
            Ok(resp) => Ok(Some(resp.json().await?)),
            Err(SyncError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn fetch_report(&self, url: &str) -> Result<String> {
        let url = self.resolve_report_url(url)?;
        let resp = Self::check(self.client.get(url).send().await?).await?;
        Ok(resp.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> HttpBackend {
        HttpBackend::with_client(reqwest::Client::new(), "http://127.0.0.1:8001/api/v1/").unwrap()
    }

    #[test]
    fn sessions_url_encodes_notebook() {
        assert_eq!(
            backend().sessions_url("nb 1"),
            "http://127.0.0.1:8001/api/v1/notebooks/nb%201/sessions"
        );
    }

    #[test]
    fn report_urls_resolve_against_origin() {
        let b = backend();
        assert_eq!(
            b.resolve_report_url("/api/outputs/research/reports/r.md")
                .unwrap()
                .as_str(),
            "http://127.0.0.1:8001/api/outputs/research/reports/r.md"
        );
        assert_eq!(
            b.resolve_report_url("/data/user/research/reports/research_1.md")
                .unwrap()
                .as_str(),
            "http://127.0.0.1:8001/api/outputs/research/reports/research_1.md"
        );
        assert_eq!(
            b.resolve_report_url("https://cdn.example/r.md").unwrap().as_str(),
            "https://cdn.example/r.md"
        );
    }

    #[test]
    fn rejects_bad_base() {
        assert!(HttpBackend::with_client(reqwest::Client::new(), "not a url").is_err());
    }
}
