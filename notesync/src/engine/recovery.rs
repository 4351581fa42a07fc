//! Recovery of research results whose event stream was lost.
//!
//! Order of attempts: poll the job-status endpoint and download the report,
//! then resync the whole session list. Only when both fail is the user asked
//! to refresh. A session with a recovery in flight ignores new triggers.

use tracing::{debug, info, warn};

use super::controller::{Effect, FetchPurpose, NotebookController, Notice};
use super::report;
use crate::api::JobStatus;
use crate::models::{ResearchPhase, Session, Timestamp};

/// Where a session's recovery currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStep {
    PollingStatus,
    FetchingReport,
    Resyncing,
}

impl NotebookController {
    /// Start recovery for a session whose job may still be running.
    pub(super) fn begin_recovery(
        &mut self,
        session_id: &str,
        now: Timestamp,
        fx: &mut Vec<Effect>,
    ) {
        if self.recovering.contains_key(session_id)
            || self.research_links.contains_key(session_id)
        {
            return;
        }
        let Some(session) = self.store.get(session_id) else {
            return;
        };
        if !session.pending_recovery() {
            return;
        }

        if report::report_inserted(session) {
            debug!(session_id, "report already present, clearing recovery flag");
            self.store.update(session_id, now, |s| {
                if let Some(state) = s.research_state.as_mut() {
                    state.complete();
                }
            });
            fx.push(Effect::SaveCache);
            self.persist(session_id, true, fx);
            fx.push(Effect::Notify(Notice::RecoveryFinished {
                session_id: session_id.to_string(),
                recovered: true,
            }));
            return;
        }

        let limit_ms = u64::try_from(self.timings.job_timeout.as_millis()).unwrap_or(u64::MAX);
        let overdue = session
            .research_state
            .as_ref()
            .is_some_and(|s| s.running && s.overdue(now, limit_ms));
        if overdue {
            let minutes = self.timings.job_timeout.as_secs() / 60;
            self.fail_research(
                session_id,
                &format!("research timed out after {minutes} minutes"),
                now,
                fx,
            );
            return;
        }

        let job_id = session.research_state.as_ref().and_then(|s| s.job_id.clone());
        info!(session_id, job_id = ?job_id, "recovering research result");
        match job_id {
            Some(job_id) => {
                self.recovering
                    .insert(session_id.to_string(), RecoveryStep::PollingStatus);
                fx.push(Effect::PollJobStatus {
                    session_id: session_id.to_string(),
                    job_id,
                });
            }
            None => self.resync(session_id, fx),
        }
    }

    fn resync(&mut self, session_id: &str, fx: &mut Vec<Effect>) {
        self.recovering
            .insert(session_id.to_string(), RecoveryStep::Resyncing);
        fx.push(Effect::FetchSessions {
            purpose: FetchPurpose::Resync {
                session_id: session_id.to_string(),
            },
        });
    }

    pub(super) fn on_job_status(
        &mut self,
        session_id: &str,
        result: Result<Option<JobStatus>, String>,
        now: Timestamp,
        fx: &mut Vec<Effect>,
    ) {
        if self.recovering.get(session_id) != Some(&RecoveryStep::PollingStatus) {
            return;
        }
        match result {
            Ok(Some(status)) if status.report_ready() => {
                let url = status.report_url.clone().unwrap_or_default();
                debug!(session_id, url, "job finished, fetching report");
                self.recovering
                    .insert(session_id.to_string(), RecoveryStep::FetchingReport);
                fx.push(Effect::FetchReport {
                    session_id: session_id.to_string(),
                    url,
                    metadata: status.metadata,
                });
            }
            Ok(Some(status)) if status.is_running() => {
                self.recovering.remove(session_id);
                let phase = status.phase().unwrap_or(ResearchPhase::Researching);
                self.store.update(session_id, now, |s| {
                    if let Some(state) = s.research_state.as_mut() {
                        state.adopt_stage(phase);
                    }
                });
                debug!(session_id, stage = %status.stage, "job still running, retrying later");
                fx.push(Effect::SaveCache);
                fx.push(Effect::ScheduleRecovery {
                    session_id: session_id.to_string(),
                    after: self.timings.recovery_retry,
                });
                fx.push(Effect::Notify(Notice::RecoveryPending {
                    session_id: session_id.to_string(),
                    phase,
                }));
            }
            Ok(status) => {
                debug!(session_id, ?status, "job status has no report, resyncing");
                self.resync(session_id, fx);
            }
            Err(e) => {
                warn!(session_id, error = %e, "job status poll failed, resyncing");
                self.resync(session_id, fx);
            }
        }
    }

    pub(super) fn on_report_fetched(
        &mut self,
        session_id: &str,
        metadata: Option<serde_json::Value>,
        result: Result<String, String>,
        now: Timestamp,
        fx: &mut Vec<Effect>,
    ) {
        if self.recovering.get(session_id) != Some(&RecoveryStep::FetchingReport) {
            return;
        }
        match result {
            Ok(text) if !text.trim().is_empty() => {
                self.complete_report(session_id, &text, metadata.as_ref(), now, fx);
            }
            Ok(_) => {
                warn!(session_id, "report download was empty, resyncing");
                self.resync(session_id, fx);
            }
            Err(e) => {
                warn!(session_id, error = %e, "report download failed, resyncing");
                self.resync(session_id, fx);
            }
        }
    }

    pub(super) fn on_resync(
        &mut self,
        session_id: &str,
        result: Result<Vec<Session>, String>,
        now: Timestamp,
        fx: &mut Vec<Effect>,
    ) {
        if self.recovering.get(session_id) != Some(&RecoveryStep::Resyncing) {
            return;
        }
        match result {
            Ok(remote) => {
                let recovered = self.merge_remote(remote, now, fx);
                if self.current.is_none() {
                    self.current = self.store.latest().map(|s| s.session_id.clone());
                }
                fx.push(Effect::SaveCache);
                if recovered.iter().any(|id| id == session_id) {
                    fx.push(Effect::Notify(Notice::RecoveryFinished {
                        session_id: session_id.to_string(),
                        recovered: true,
                    }));
                    return;
                }
                if let Some(newest) = self.report_elsewhere(session_id) {
                    info!(session_id, adopted = %newest, "report found in a newer session");
                    self.recovering.remove(session_id);
                    self.store.update(session_id, now, |s| {
                        if let Some(state) = s.research_state.as_mut() {
                            state.complete();
                        }
                    });
                    if self.current.as_deref().map_or(true, |id| id == session_id) {
                        self.current = Some(newest);
                    }
                    self.persist(session_id, false, fx);
                    fx.push(Effect::Notify(Notice::RecoveryFinished {
                        session_id: session_id.to_string(),
                        recovered: true,
                    }));
                    return;
                }
                let still_pending = self
                    .store
                    .get(session_id)
                    .is_some_and(Session::pending_recovery);
                if still_pending {
                    self.exhausted(session_id, "resync did not contain the report", fx);
                } else {
                    self.recovering.remove(session_id);
                    fx.push(Effect::Notify(Notice::RecoveryFinished {
                        session_id: session_id.to_string(),
                        recovered: false,
                    }));
                }
            }
            Err(e) => self.exhausted(session_id, &e, fx),
        }
    }

    /// The newest session, when it holds a finished report on the same
    /// topic under another id.
    fn report_elsewhere(&self, session_id: &str) -> Option<String> {
        let pending = self.store.get(session_id)?;
        let topic = pending.research_state.as_ref()?.topic.as_str();
        let latest = self.store.latest()?;
        let same_topic = latest
            .research_state
            .as_ref()
            .is_some_and(|s| s.topic == topic);
        let adopt = latest.session_id != session_id
            && latest.updated_at > pending.updated_at
            && latest.has_report()
            && !latest.pending_recovery()
            && same_topic;
        adopt.then(|| latest.session_id.clone())
    }

    /// Every path failed. The session keeps its pending flag so a later
    /// visibility change tries again.
    fn exhausted(&mut self, session_id: &str, reason: &str, fx: &mut Vec<Effect>) {
        self.recovering.remove(session_id);
        warn!(session_id, reason, "research recovery exhausted");
        fx.push(Effect::Notify(Notice::RefreshRequired {
            session_id: session_id.to_string(),
        }));
        fx.push(Effect::Notify(Notice::RecoveryFinished {
            session_id: session_id.to_string(),
            recovered: false,
        }));
    }
}
