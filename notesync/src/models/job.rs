//! Snapshot of an in-flight research job.

use serde::{Deserialize, Serialize};

use super::Timestamp;

/// Phase of a research job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResearchPhase {
    /// No job running.
    #[default]
    Idle,
    /// Topic is being decomposed into sub-topics.
    Planning,
    /// Sub-topics are being researched.
    Researching,
    /// Final report is being written.
    Reporting,
}

impl ResearchPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::Researching => "researching",
            Self::Reporting => "reporting",
        }
    }

    /// Parse a phase or backend stage name.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "idle" | "completed" | "cancelled" => Some(Self::Idle),
            "planning" | "plan" | "rephrase" | "decompose" => Some(Self::Planning),
            "researching" | "research" => Some(Self::Researching),
            "reporting" | "report" | "writing" => Some(Self::Reporting),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResearchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How deep the research plan goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PlanDepth {
    Quick,
    #[default]
    Medium,
    Deep,
    Auto,
}

impl PlanDepth {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Medium => "medium",
            Self::Deep => "deep",
            Self::Auto => "auto",
        }
    }
}

/// Sub-topic counters while researching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u32,
    pub total: u32,
}

/// Tracks one in-flight asynchronous research job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchJobState {
    pub topic: String,
    pub running: bool,
    pub phase: ResearchPhase,
    pub progress: Progress,
    #[serde(alias = "currentSubTopic", skip_serializing_if = "Option::is_none")]
    pub current_sub_topic: Option<String>,
    #[serde(alias = "startedAt", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// Seconds.
    #[serde(alias = "estimatedTimeRemaining", skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<u64>,
    #[serde(alias = "planDepth")]
    pub plan_depth: PlanDepth,
    #[serde(alias = "jobId", skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// The event stream was lost before a terminal event arrived.
    #[serde(alias = "pendingRecovery")]
    pub pending_recovery: bool,
    /// Index of the assistant message this job streams into.
    #[serde(alias = "messageAnchor", skip_serializing_if = "Option::is_none")]
    pub message_anchor: Option<usize>,
}
