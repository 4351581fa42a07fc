//! Data models for notebook sessions.

mod job;
mod message;
mod session;
mod source;
mod time;

pub use job::{PlanDepth, Progress, ResearchJobState, ResearchPhase};
pub use message::{ChatMessage, MessageRole};
pub use session::{sources_markdown, Session, REPORT_BANNER};
pub use source::{Source, SourceKind};
pub use time::Timestamp;
