//! Backend contracts consumed by the sync engine.
//!
//! The engine only depends on these traits; [`HttpBackend`] is the real
//! implementation over reqwest.

mod http;

use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::models::{ResearchPhase, Session};

pub use http::HttpBackend;

/// Remote, authoritative session storage.
pub trait SessionApi: Clone + Send + Sync + 'static {
    /// All sessions of a notebook.
    fn list_sessions(&self, notebook_id: &str) -> impl Future<Output = Result<Vec<Session>>> + Send;

    /// Store a full snapshot; returns the canonical stored form.
    fn upsert_session(
        &self,
        notebook_id: &str,
        session: &Session,
    ) -> impl Future<Output = Result<Session>> + Send;
}

/// Endpoints used by the research recovery path.
pub trait ResearchApi: Clone + Send + Sync + 'static {
    /// Status of a server-side job. `None` when the server does not know it.
    fn job_status(&self, job_id: &str) -> impl Future<Output = Result<Option<JobStatus>>> + Send;

    /// Download a report body. Relative URLs and bare file paths are
    /// resolved against the backend.
    fn fetch_report(&self, url: &str) -> impl Future<Output = Result<String>> + Send;
}

/// Reply of the job-status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    #[serde(alias = "researchId")]
    pub research_id: String,
    #[serde(default)]
    pub stage: String,
    #[serde(default, alias = "hasReport")]
    pub has_report: bool,
    #[serde(default, alias = "reportUrl", skip_serializing_if = "Option::is_none")]
    pub report_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl JobStatus {
    /// The job finished and its report can be downloaded.
    pub fn report_ready(&self) -> bool {
        self.report_url.is_some() && (self.has_report || self.stage == "completed")
    }

    /// The job is still doing work on the server.
    pub fn is_running(&self) -> bool {
        use ResearchPhase::{Planning, Reporting, Researching};
        !self.report_ready()
            && matches!(
                ResearchPhase::from_str(&self.stage),
                Some(Planning | Researching | Reporting)
            )
    }

    pub fn phase(&self) -> Option<ResearchPhase> {
        ResearchPhase::from_str(&self.stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(stage: &str, url: Option<&str>) -> JobStatus {
        JobStatus {
            research_id: "job".into(),
            stage: stage.into(),
            has_report: url.is_some(),
            report_url: url.map(String::from),
            metadata: None,
        }
    }

    #[test]
    fn readiness_and_running() {
        assert!(status("completed", Some("/r.md")).report_ready());
        assert!(!status("completed", None).report_ready());
        assert!(status("researching", None).is_running());
        assert!(!status("completed", None).is_running());
        assert!(!status("mystery", None).is_running());
    }

    #[test]
    fn parses_camel_case_reply() {
        let s: JobStatus = serde_json::from_str(
            r#"{"researchId":"r1","stage":"completed","hasReport":true,"reportUrl":"/x.md"}"#,
        )
        .unwrap();
        assert!(s.report_ready());
        assert_eq!(s.phase(), Some(ResearchPhase::Idle));
    }
}
