//! State machine of one research job.
//!
//! `idle -> planning -> researching -> reporting -> idle`, with a cancel exit
//! from any running phase. Terminal frames are handed back to the caller as a
//! [`Terminal`]; this module never performs I/O.

use serde_json::Value;

use crate::models::{PlanDepth, Progress, ResearchJobState, ResearchPhase, Timestamp};
use crate::transport::ResearchEvent;

/// What an event did to the job.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Phase, counters or sub-topic changed.
    Updated,
    /// The server assigned (or changed) the job id.
    JobAssigned(String),
    /// The job ended.
    Terminal(Terminal),
    /// Nothing relevant changed.
    Ignored,
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    Report {
        report: String,
        metadata: Option<Value>,
    },
    /// The report must be downloaded from this location first.
    ReportAt(String),
    Failed(String),
}

impl ResearchJobState {
    /// Fresh job state for a research start at `now`.
    pub fn begin(
        topic: impl Into<String>,
        plan_depth: PlanDepth,
        message_anchor: usize,
        now: Timestamp,
    ) -> Self {
        Self {
            topic: topic.into(),
            running: true,
            phase: ResearchPhase::Planning,
            plan_depth,
            started_at: Some(now),
            pending_recovery: true,
            message_anchor: Some(message_anchor),
            ..Self::default()
        }
    }

    /// Fold one transport event into the job.
    pub fn apply(&mut self, event: &ResearchEvent, now: Timestamp) -> Transition {
        match event {
            ResearchEvent::Status {
                job_id: Some(id), ..
            } => self.assign_job(id),
            ResearchEvent::Result {
                report,
                metadata,
                job_id,
            } => {
                if let Some(id) = job_id {
                    self.job_id.get_or_insert_with(|| id.clone());
                }
                Transition::Terminal(Terminal::Report {
                    report: report.clone(),
                    metadata: metadata.clone(),
                })
            }
            ResearchEvent::ReportPath(path) if !path.is_empty() => {
                Transition::Terminal(Terminal::ReportAt(path.clone()))
            }
            ResearchEvent::Error(message) => {
                Transition::Terminal(Terminal::Failed(message.clone()))
            }
            ResearchEvent::Progress {
                phase,
                progress,
                sub_topic,
                ..
            } => {
                if !self.running {
                    return Transition::Ignored;
                }
                if let Some(phase) = phase.filter(|p| *p != ResearchPhase::Idle) {
                    self.phase = phase;
                }
                if let Some(p) = progress {
                    self.progress = *p;
                }
                if let Some(topic) = sub_topic {
                    self.current_sub_topic = Some(topic.clone());
                }
                self.estimated_time_remaining = self.estimate_remaining(now);
                Transition::Updated
            }
            _ => Transition::Ignored,
        }
    }

    fn assign_job(&mut self, id: &str) -> Transition {
        if self.job_id.as_deref() == Some(id) {
            return Transition::Ignored;
        }
        self.job_id = Some(id.to_string());
        Transition::JobAssigned(id.to_string())
    }

    /// Seconds left, extrapolated from elapsed time per finished sub-topic.
    pub fn estimate_remaining(&self, now: Timestamp) -> Option<u64> {
        if self.phase != ResearchPhase::Researching {
            return None;
        }
        let Progress { current, total } = self.progress;
        if current == 0 || total < current {
            return None;
        }
        let elapsed_ms = now.millis_since(self.started_at?);
        let remaining_ms = elapsed_ms * u64::from(total - current) / u64::from(current);
        Some(remaining_ms / 1000)
    }

    /// A report was obtained, live or recovered.
    pub fn complete(&mut self) {
        self.running = false;
        self.pending_recovery = false;
        self.phase = ResearchPhase::Idle;
        self.estimated_time_remaining = None;
    }

    /// The job failed or timed out. Nothing is left to recover.
    pub fn fail(&mut self) {
        self.complete();
    }

    /// Local reset after a user cancel. The server may still finish the job,
    /// and a late report is still accepted.
    pub fn cancel(&mut self) {
        self.complete();
    }

    /// The event stream ended before a terminal event.
    pub fn lose_stream(&mut self) {
        self.pending_recovery = true;
    }

    /// Adopt the stage reported by the status endpoint during recovery.
    pub fn adopt_stage(&mut self, phase: ResearchPhase) {
        if phase != ResearchPhase::Idle {
            self.phase = phase;
            self.running = true;
        }
    }

    /// Whether the job has been running longer than `limit_ms`.
    pub fn overdue(&self, now: Timestamp, limit_ms: u64) -> bool {
        self.running
            && self
                .started_at
                .is_some_and(|start| now.millis_since(start) >= limit_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;

    fn at(offset_ms: i64) -> Timestamp {
        Timestamp::from_millis(T0 + offset_ms)
    }

    fn progress(phase: ResearchPhase, current: u32, total: u32) -> ResearchEvent {
        ResearchEvent::Progress {
            phase: Some(phase),
            progress: Some(Progress { current, total }),
            sub_topic: None,
            message: None,
        }
    }

    #[test]
    fn begin_sets_planning_and_pending_recovery() {
        let job = ResearchJobState::begin("quantum computing", PlanDepth::Deep, 3, at(0));
        assert!(job.running);
        assert!(job.pending_recovery);
        assert_eq!(job.phase, ResearchPhase::Planning);
        assert_eq!(job.message_anchor, Some(3));
    }

    #[test]
    fn progress_drives_phase_and_eta() {
        let mut job = ResearchJobState::begin("t", PlanDepth::Medium, 0, at(0));
        job.apply(&progress(ResearchPhase::Researching, 1, 3), at(60_000));
        assert_eq!(job.phase, ResearchPhase::Researching);
        assert_eq!(job.progress, Progress { current: 1, total: 3 });
        // 60s per sub-topic, two left.
        assert_eq!(job.estimated_time_remaining, Some(120));

        job.apply(&progress(ResearchPhase::Researching, 3, 3), at(150_000));
        assert_eq!(job.estimated_time_remaining, Some(0));
    }

    #[test]
    fn status_assigns_job_id_once() {
        let mut job = ResearchJobState::begin("t", PlanDepth::Medium, 0, at(0));
        let status = ResearchEvent::Status {
            content: "started".into(),
            job_id: Some("research_1".into()),
        };
        assert_eq!(job.apply(&status, at(1)), Transition::JobAssigned("research_1".into()));
        assert_eq!(job.apply(&status, at(2)), Transition::Ignored);
        assert_eq!(job.job_id.as_deref(), Some("research_1"));
    }

    #[test]
    fn terminal_events() {
        let mut job = ResearchJobState::begin("t", PlanDepth::Medium, 0, at(0));
        let result = ResearchEvent::Result {
            report: "# Report".into(),
            metadata: None,
            job_id: Some("r9".into()),
        };
        assert!(matches!(
            job.apply(&result, at(5)),
            Transition::Terminal(Terminal::Report { .. })
        ));
        assert_eq!(job.job_id.as_deref(), Some("r9"));
        assert_eq!(
            job.apply(&ResearchEvent::ReportPath("/r.md".into()), at(6)),
            Transition::Terminal(Terminal::ReportAt("/r.md".into()))
        );
        assert_eq!(
            job.apply(&ResearchEvent::Error("boom".into()), at(7)),
            Transition::Terminal(Terminal::Failed("boom".into()))
        );
    }

    #[test]
    fn cancel_resets_but_still_takes_late_result() {
        let mut job = ResearchJobState::begin("t", PlanDepth::Medium, 0, at(0));
        job.apply(&progress(ResearchPhase::Researching, 1, 3), at(10));
        job.cancel();
        assert!(!job.running);
        assert_eq!(job.phase, ResearchPhase::Idle);
        assert!(!job.pending_recovery);

        assert_eq!(
            job.apply(&progress(ResearchPhase::Reporting, 3, 3), at(20)),
            Transition::Ignored
        );
        let late = ResearchEvent::Result {
            report: "late".into(),
            metadata: None,
            job_id: None,
        };
        assert!(matches!(job.apply(&late, at(30)), Transition::Terminal(_)));
    }

    #[test]
    fn overdue_after_limit() {
        let job = ResearchJobState::begin("t", PlanDepth::Medium, 0, at(0));
        assert!(!job.overdue(at(999), 1_000));
        assert!(job.overdue(at(1_000), 1_000));
    }
}
