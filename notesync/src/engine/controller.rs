//! Per-notebook reconciliation state machine.
//!
//! [`NotebookController::dispatch`] is the single entry point: it folds one
//! [`Event`] into the in-memory state and returns the [`Effect`]s the runtime
//! must carry out. It performs no I/O and reads no clock.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::recovery::RecoveryStep;
use super::report;
use crate::api::JobStatus;
use crate::cache::CacheSnapshot;
use crate::config::SyncConfig;
use crate::models::{
    ChatMessage, PlanDepth, Progress, ResearchJobState, ResearchPhase, Session, Source, Timestamp,
};
use crate::research::{Terminal, Transition};
use crate::store::SessionStore;
use crate::transport::{ChatEvent, ResearchEvent};

pub(super) const RESEARCH_LOST_MARKER: &str = "[connection lost, report incomplete]";
pub(super) const CHAT_LOST_MARKER: &str = "[connection lost, response incomplete]";
const CANCELLED_MARKER: &str = "[research cancelled]";

/// Identifies one opened transport so events from a replaced link are dropped.
pub type LinkId = u64;

/// Why a session list was fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchPurpose {
    Mount,
    /// Last recovery step for one session.
    Resync { session_id: String },
}

/// Options of a chat request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatOptions {
    pub kb_name: Option<String>,
    pub enable_rag: bool,
    pub enable_web_search: bool,
}

/// Inputs to the controller.
#[derive(Debug, Clone)]
pub enum Event {
    /// Page opened with whatever the local cache held.
    Mounted { snapshot: CacheSnapshot },
    SessionsFetched {
        purpose: FetchPurpose,
        result: Result<Vec<Session>, String>,
    },
    /// The user typed into the current session.
    DraftEdited,
    SendChat {
        message: String,
        options: ChatOptions,
    },
    ChatLinkFailed {
        session_id: String,
        link: LinkId,
        error: String,
    },
    Chat {
        session_id: String,
        link: LinkId,
        event: ChatEvent,
    },
    ChatClosed {
        session_id: String,
        link: LinkId,
    },
    StartResearch {
        topic: String,
        depth: PlanDepth,
        kb_name: Option<String>,
    },
    ResearchLinkFailed {
        session_id: String,
        link: LinkId,
        error: String,
    },
    Research {
        session_id: String,
        link: LinkId,
        event: ResearchEvent,
    },
    ResearchClosed {
        session_id: String,
        link: LinkId,
    },
    CancelResearch,
    VisibilityChanged { visible: bool },
    /// Explicit request to recover the current session.
    Recover,
    RecoveryDue { session_id: String },
    JobStatusFetched {
        session_id: String,
        result: Result<Option<JobStatus>, String>,
    },
    ReportFetched {
        session_id: String,
        metadata: Option<Value>,
        result: Result<String, String>,
    },
    Persisted {
        session_id: String,
        result: Result<Session, String>,
    },
    ToggleSource { source_id: String },
    NewSession,
    SelectSession { session_id: String },
    JobTimedOut { session_id: String },
}

/// Work the runtime performs on the controller's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Write the session list and current id to the local cache.
    SaveCache,
    Persist { session: Session, immediate: bool },
    /// Persist every debounced snapshot now.
    FlushPending,
    FetchSessions { purpose: FetchPurpose },
    OpenChat {
        session_id: String,
        link: LinkId,
        request: Value,
    },
    OpenResearch {
        session_id: String,
        link: LinkId,
        start: Value,
    },
    /// Advisory; the server may still finish the job.
    SendResearchCancel { session_id: String },
    CloseResearch { session_id: String },
    PollJobStatus { session_id: String, job_id: String },
    FetchReport {
        session_id: String,
        url: String,
        metadata: Option<Value>,
    },
    ScheduleRecovery { session_id: String, after: Duration },
    ArmJobTimeout { session_id: String, after: Duration },
    ClearJobTimeout { session_id: String },
    Notify(Notice),
}

/// How a chat reply or research job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed(String),
    Cancelled,
    ConnectionLost,
}

/// User-visible notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The mount fetch finished (or failed and the cache is all we have).
    Synced { sessions: usize, offline: bool },
    Progress {
        session_id: String,
        phase: ResearchPhase,
        progress: Progress,
        sub_topic: Option<String>,
        eta_secs: Option<u64>,
    },
    ChatFinished { session_id: String, outcome: Outcome },
    ResearchFinished { session_id: String, outcome: Outcome },
    /// The job is alive on the server; recovery will retry.
    RecoveryPending { session_id: String, phase: ResearchPhase },
    RecoveryFinished { session_id: String, recovered: bool },
    /// Every recovery path failed.
    RefreshRequired { session_id: String },
    Error(String),
}

/// Controller timings, taken from [`SyncConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub recovery_delay: Duration,
    pub recovery_retry: Duration,
    pub job_timeout: Duration,
}

impl From<&SyncConfig> for Timings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            recovery_delay: config.recovery_delay(),
            recovery_retry: config.recovery_retry(),
            job_timeout: config.job_timeout(),
        }
    }
}

/// Owns all session state of one open notebook.
#[derive(Debug)]
pub struct NotebookController {
    pub(super) notebook_id: String,
    pub(super) timings: Timings,
    pub(super) store: SessionStore,
    pub(super) current: Option<String>,
    /// The user edited the current session since mount.
    pub(super) draft_dirty: bool,
    pub(super) chat_links: HashMap<String, LinkId>,
    pub(super) research_links: HashMap<String, LinkId>,
    /// Links of cancelled jobs, kept open only for a late report.
    pub(super) draining: HashMap<String, LinkId>,
    pub(super) recovering: HashMap<String, RecoveryStep>,
    next_link: LinkId,
}

impl NotebookController {
    pub fn new(notebook_id: impl Into<String>, timings: Timings) -> Self {
        Self {
            notebook_id: notebook_id.into(),
            timings,
            store: SessionStore::new(),
            current: None,
            draft_dirty: false,
            chat_links: HashMap::new(),
            research_links: HashMap::new(),
            draining: HashMap::new(),
            recovering: HashMap::new(),
            next_link: 0,
        }
    }

    pub fn notebook_id(&self) -> &str {
        &self.notebook_id
    }

    pub fn sessions(&self) -> &[Session] {
        self.store.list()
    }

    pub fn session(&self, session_id: &str) -> Option<&Session> {
        self.store.get(session_id)
    }

    pub fn current_session_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn current_session(&self) -> Option<&Session> {
        self.current.as_deref().and_then(|id| self.store.get(id))
    }

    /// Read-only view of every session's sources.
    pub fn all_sources(&self) -> Vec<&Source> {
        self.store.all_sources()
    }

    pub fn is_recovering(&self, session_id: &str) -> bool {
        self.recovering.contains_key(session_id)
    }

    /// The research link the controller currently listens to for a session.
    pub fn research_link(&self, session_id: &str) -> Option<LinkId> {
        self.research_links.get(session_id).copied()
    }

    pub fn chat_link(&self, session_id: &str) -> Option<LinkId> {
        self.chat_links.get(session_id).copied()
    }

    /// Fold one event into the state.
    pub fn dispatch(&mut self, event: Event, now: Timestamp) -> Vec<Effect> {
        let mut fx = Vec::new();
        match event {
            Event::Mounted { snapshot } => self.on_mounted(snapshot, &mut fx),
            Event::SessionsFetched { purpose, result } => match purpose {
                FetchPurpose::Mount => self.on_mount_fetch(result, now, &mut fx),
                FetchPurpose::Resync { session_id } => {
                    self.on_resync(&session_id, result, now, &mut fx);
                }
            },
            Event::DraftEdited => self.draft_dirty = true,
            Event::SendChat { message, options } => {
                self.send_chat(&message, &options, now, &mut fx);
            }
            Event::ChatLinkFailed {
                session_id,
                link,
                error,
            } => {
                if self.chat_links.get(&session_id) == Some(&link) {
                    self.finish_chat(&session_id, ChatEvent::Error(error), now, &mut fx);
                }
            }
            Event::Chat {
                session_id,
                link,
                event,
            } => {
                if self.chat_links.get(&session_id) == Some(&link) {
                    self.on_chat_event(&session_id, event, now, &mut fx);
                }
            }
            Event::ChatClosed { session_id, link } => {
                if self.chat_links.get(&session_id) == Some(&link) {
                    self.on_chat_lost(&session_id, now, &mut fx);
                }
            }
            Event::StartResearch {
                topic,
                depth,
                kb_name,
            } => self.start_research(&topic, depth, kb_name, now, &mut fx),
            Event::ResearchLinkFailed {
                session_id,
                link,
                error,
            } => {
                if self.research_links.get(&session_id) == Some(&link) {
                    self.research_links.remove(&session_id);
                    let message = format!("could not connect to research service: {error}");
                    self.fail_research(&session_id, &message, now, &mut fx);
                } else if self.draining.get(&session_id) == Some(&link) {
                    self.close_draining(&session_id, &mut fx);
                }
            }
            Event::Research {
                session_id,
                link,
                event,
            } => {
                if self.research_links.get(&session_id) == Some(&link) {
                    self.on_research_event(&session_id, &event, now, &mut fx);
                } else if self.draining.get(&session_id) == Some(&link) {
                    self.on_draining_event(&session_id, &event, now, &mut fx);
                }
            }
            Event::ResearchClosed { session_id, link } => {
                if self.research_links.get(&session_id) == Some(&link) {
                    self.research_links.remove(&session_id);
                    self.on_research_lost(&session_id, now, &mut fx);
                } else if self.draining.get(&session_id) == Some(&link) {
                    self.close_draining(&session_id, &mut fx);
                }
            }
            Event::CancelResearch => self.cancel_research(now, &mut fx),
            Event::VisibilityChanged { visible } => self.on_visibility(visible, now, &mut fx),
            Event::Recover => {
                if let Some(id) = self.current.clone() {
                    self.begin_recovery(&id, now, &mut fx);
                }
            }
            Event::RecoveryDue { session_id } => self.begin_recovery(&session_id, now, &mut fx),
            Event::JobStatusFetched { session_id, result } => {
                self.on_job_status(&session_id, result, now, &mut fx);
            }
            Event::ReportFetched {
                session_id,
                metadata,
                result,
            } => self.on_report_fetched(&session_id, metadata, result, now, &mut fx),
            Event::Persisted { session_id, result } => {
                self.on_persisted(&session_id, result, &mut fx);
            }
            Event::ToggleSource { source_id } => self.toggle_source(&source_id, now, &mut fx),
            Event::NewSession => self.new_session(now, &mut fx),
            Event::SelectSession { session_id } => self.select_session(&session_id, &mut fx),
            Event::JobTimedOut { session_id } => {
                if self.draining.remove(&session_id).is_some() {
                    debug!(session_id = %session_id, "closing link of cancelled job");
                    fx.push(Effect::CloseResearch {
                        session_id: session_id.clone(),
                    });
                }
                let running = self
                    .store
                    .get(&session_id)
                    .is_some_and(Session::research_running);
                if running {
                    if self.research_links.remove(&session_id).is_some() {
                        fx.push(Effect::CloseResearch {
                            session_id: session_id.clone(),
                        });
                    }
                    let minutes = self.timings.job_timeout.as_secs() / 60;
                    let message = format!("research timed out after {minutes} minutes");
                    self.fail_research(&session_id, &message, now, &mut fx);
                }
            }
        }
        fx
    }

    // --- mount ---------------------------------------------------------

    fn on_mounted(&mut self, snapshot: CacheSnapshot, fx: &mut Vec<Effect>) {
        self.store = SessionStore::from_sessions(snapshot.sessions);
        self.current = snapshot
            .current_session_id
            .filter(|id| self.store.contains(id))
            .or_else(|| self.store.latest().map(|s| s.session_id.clone()));
        self.draft_dirty = false;
        debug!(
            notebook_id = %self.notebook_id,
            sessions = self.store.len(),
            current = ?self.current,
            "mounted from cache"
        );
        fx.push(Effect::FetchSessions {
            purpose: FetchPurpose::Mount,
        });
    }

    fn on_mount_fetch(
        &mut self,
        result: Result<Vec<Session>, String>,
        now: Timestamp,
        fx: &mut Vec<Effect>,
    ) {
        let offline = match result {
            Ok(remote) => {
                let _ = self.merge_remote(remote, now, fx);
                false
            }
            Err(e) => {
                warn!(
                    notebook_id = %self.notebook_id,
                    error = %e,
                    "session fetch failed, using cache"
                );
                true
            }
        };
        if self.current.is_none() {
            self.current = self.store.latest().map(|s| s.session_id.clone());
        }
        fx.push(Effect::SaveCache);
        fx.push(Effect::Notify(Notice::Synced {
            sessions: self.store.len(),
            offline,
        }));

        let pending: Vec<String> = self
            .store
            .list()
            .iter()
            .filter(|s| s.pending_recovery() && !self.research_links.contains_key(&s.session_id))
            .map(|s| s.session_id.clone())
            .collect();
        for id in pending {
            self.begin_recovery(&id, now, fx);
        }
    }

    /// Merge a remote list without losing live edits or pending reports.
    /// Returns the sessions whose pending report was found on the server.
    pub(super) fn merge_remote(
        &mut self,
        remote: Vec<Session>,
        now: Timestamp,
        fx: &mut Vec<Effect>,
    ) -> Vec<String> {
        let pending: HashMap<String, ResearchJobState> = self
            .store
            .list()
            .iter()
            .filter_map(|s| {
                s.research_state
                    .as_ref()
                    .filter(|r| r.pending_recovery)
                    .map(|r| (s.session_id.clone(), r.clone()))
            })
            .collect();
        let remote_reports: HashMap<String, Session> = remote
            .iter()
            .filter(|s| {
                pending.contains_key(&s.session_id) && s.has_report() && !s.pending_recovery()
            })
            .map(|s| (s.session_id.clone(), s.clone()))
            .collect();

        let live = self.live_session();
        let outcome = self.store.merge_remote(remote, live.as_deref());
        debug!(
            adopted = outcome.adopted.len(),
            kept_local = outcome.kept_local.len(),
            "merged remote sessions"
        );

        let mut recovered = Vec::new();
        for (id, state) in pending {
            if self.reconcile_pending(&id, state, remote_reports.get(&id), now, fx) {
                recovered.push(id);
            }
        }

        let mut pushed = HashSet::new();
        for id in outcome.kept_local {
            if pushed.insert(id.clone()) {
                self.persist(&id, false, fx);
            }
        }
        recovered
    }

    /// Re-attach a pending job to a session after the remote copy replaced it,
    /// and adopt a report the server finished while we were away.
    fn reconcile_pending(
        &mut self,
        session_id: &str,
        state: ResearchJobState,
        remote: Option<&Session>,
        now: Timestamp,
        fx: &mut Vec<Effect>,
    ) -> bool {
        let Some(session) = self.store.get(session_id) else {
            return false;
        };
        let started = state.started_at.unwrap_or_default();
        let finished_remotely = remote
            .filter(|r| r.updated_at >= started)
            .and_then(|r| r.research_report.clone());
        if session.pending_recovery() && finished_remotely.is_none() {
            return false;
        }

        let changed = self.store.update(session_id, now, |s| {
            if !s.pending_recovery() {
                s.research_state = Some(state);
            }
            match finished_remotely {
                Some(text) => report::insert_report(s, &text, None, now),
                None => false,
            }
        });

        if changed == Some(true) {
            info!(session_id, "adopted report finished on the server");
            self.recovering.remove(session_id);
            fx.push(Effect::ClearJobTimeout {
                session_id: session_id.to_string(),
            });
            self.persist(session_id, true, fx);
            fx.push(Effect::Notify(Notice::ResearchFinished {
                session_id: session_id.to_string(),
                outcome: Outcome::Completed,
            }));
        }
        fx.push(Effect::SaveCache);
        changed == Some(true)
    }

    /// The session whose local state must not be overwritten by a fetch.
    fn live_session(&self) -> Option<String> {
        let id = self.current.as_ref()?;
        let busy = self.chat_links.contains_key(id) || self.research_links.contains_key(id);
        (self.draft_dirty || busy).then(|| id.clone())
    }

    // --- persistence ---------------------------------------------------

    pub(super) fn persist(&self, session_id: &str, immediate: bool, fx: &mut Vec<Effect>) {
        if let Some(session) = self.store.get(session_id) {
            fx.push(Effect::Persist {
                session: session.clone(),
                immediate,
            });
        }
    }

    fn on_persisted(
        &mut self,
        session_id: &str,
        result: Result<Session, String>,
        fx: &mut Vec<Effect>,
    ) {
        match result {
            Ok(echo) => {
                if echo.session_id != session_id {
                    warn!(
                        session_id,
                        echoed = %echo.session_id,
                        "persist echo for another session"
                    );
                    return;
                }
                let outcome = self.store.accept(echo);
                debug!(session_id, ?outcome, "persist acknowledged");
                fx.push(Effect::SaveCache);
            }
            Err(e) => {
                warn!(session_id, error = %e, "failed to persist session, kept locally");
            }
        }
    }

    // --- sessions ------------------------------------------------------

    /// The current session, created lazily.
    fn ensure_session(&mut self, now: Timestamp) -> String {
        if let Some(id) = self.current.clone().filter(|id| self.store.contains(id)) {
            return id;
        }
        let id = self.create_session(now);
        self.current = Some(id.clone());
        id
    }

    fn create_session(&mut self, now: Timestamp) -> String {
        let mut stamp = now;
        let mut id = Session::generate_id(stamp);
        while self.store.contains(&id) {
            stamp = Timestamp::from_millis(stamp.as_millis() + 1);
            id = Session::generate_id(stamp);
        }
        self.store.upsert(Session::new(id.clone(), now));
        info!(notebook_id = %self.notebook_id, session_id = %id, "created session");
        id
    }

    fn new_session(&mut self, now: Timestamp, fx: &mut Vec<Effect>) {
        if let Some(outgoing) = self.current.clone() {
            self.persist(&outgoing, true, fx);
        }
        let id = self.create_session(now);
        self.current = Some(id.clone());
        self.draft_dirty = false;
        self.persist(&id, true, fx);
        fx.push(Effect::SaveCache);
    }

    fn select_session(&mut self, session_id: &str, fx: &mut Vec<Effect>) {
        if !self.store.contains(session_id) {
            fx.push(Effect::Notify(Notice::Error(format!("no session {session_id}"))));
            return;
        }
        if let Some(outgoing) = self.current.clone().filter(|id| id != session_id) {
            self.persist(&outgoing, true, fx);
        }
        self.current = Some(session_id.to_string());
        self.draft_dirty = false;
        fx.push(Effect::SaveCache);
    }

    fn toggle_source(&mut self, source_id: &str, now: Timestamp, fx: &mut Vec<Effect>) {
        let Some(id) = self.current.clone() else {
            fx.push(Effect::Notify(Notice::Error("no current session".into())));
            return;
        };
        match self.store.toggle_source(&id, source_id, now) {
            Some(selected) => {
                debug!(session_id = %id, source_id, selected, "toggled source");
                fx.push(Effect::SaveCache);
                // Exports read the selection, so it goes out right away.
                self.persist(&id, true, fx);
            }
            None => fx.push(Effect::Notify(Notice::Error(format!(
                "no source {source_id} in the current session"
            )))),
        }
    }

    fn on_visibility(&mut self, visible: bool, now: Timestamp, fx: &mut Vec<Effect>) {
        if !visible {
            fx.push(Effect::FlushPending);
            return;
        }
        let pending: Vec<String> = self
            .store
            .list()
            .iter()
            .filter(|s| s.pending_recovery() && !self.research_links.contains_key(&s.session_id))
            .map(|s| s.session_id.clone())
            .collect();
        for id in pending {
            self.begin_recovery(&id, now, fx);
        }
    }

    fn next_link(&mut self) -> LinkId {
        self.next_link += 1;
        self.next_link
    }

    // --- chat ----------------------------------------------------------

    fn send_chat(
        &mut self,
        message: &str,
        options: &ChatOptions,
        now: Timestamp,
        fx: &mut Vec<Effect>,
    ) {
        let message = message.trim();
        if message.is_empty() {
            return;
        }
        let id = self.ensure_session(now);
        if self.chat_links.contains_key(&id) {
            fx.push(Effect::Notify(Notice::Error(
                "a reply is still streaming in this session".into(),
            )));
            return;
        }

        let history: Vec<Value> = self
            .store
            .get(&id)
            .map(|s| {
                s.history()
                    .into_iter()
                    .map(|(role, content)| json!({"role": role.as_str(), "content": content}))
                    .collect()
            })
            .unwrap_or_default();

        self.store.update(&id, now, |s| {
            s.messages.push(ChatMessage::user(message));
            s.messages.push(ChatMessage::placeholder());
        });
        self.draft_dirty = true;

        let link = self.next_link();
        self.chat_links.insert(id.clone(), link);
        fx.push(Effect::SaveCache);
        self.persist(&id, false, fx);
        fx.push(Effect::OpenChat {
            session_id: id,
            link,
            request: json!({
                "message": message,
                "history": history,
                "kb_name": options.kb_name,
                "enable_rag": options.enable_rag,
                "enable_web_search": options.enable_web_search,
            }),
        });
    }

    fn on_chat_event(
        &mut self,
        session_id: &str,
        event: ChatEvent,
        now: Timestamp,
        fx: &mut Vec<Effect>,
    ) {
        match event {
            ChatEvent::Stream(chunk) => {
                self.store.update(session_id, now, |s| {
                    if let Some(msg) = s.streaming_message_mut() {
                        msg.content.push_str(&chunk);
                    }
                });
                fx.push(Effect::SaveCache);
                self.persist(session_id, false, fx);
            }
            ChatEvent::Unknown(kind) => debug!(session_id, kind, "ignoring chat frame"),
            terminal => self.finish_chat(session_id, terminal, now, fx),
        }
    }

    fn finish_chat(
        &mut self,
        session_id: &str,
        event: ChatEvent,
        now: Timestamp,
        fx: &mut Vec<Effect>,
    ) {
        self.chat_links.remove(session_id);
        let outcome = match event {
            ChatEvent::Result { content, sources } => {
                let millis = now.as_millis();
                self.store.update(session_id, now, |s| {
                    match s.streaming_message_mut() {
                        Some(msg) => {
                            if !content.is_empty() {
                                msg.content = content;
                            }
                            msg.streaming = false;
                        }
                        None => s.messages.push(ChatMessage::assistant(content)),
                    }
                    for (idx, mut source) in sources.into_iter().enumerate() {
                        if source.id.is_empty() {
                            source.id = format!("chat-{}-{millis}-{idx}", source.kind);
                        }
                        s.add_source(source);
                    }
                });
                Outcome::Completed
            }
            ChatEvent::Error(message) => {
                self.store.update(session_id, now, |s| {
                    let text = format!("Error: {message}");
                    match s.streaming_message_mut() {
                        Some(msg) => {
                            msg.content = text;
                            msg.streaming = false;
                        }
                        None => s.messages.push(ChatMessage::assistant(text)),
                    }
                });
                Outcome::Failed(message)
            }
            ChatEvent::Stream(_) | ChatEvent::Unknown(_) => return,
        };
        fx.push(Effect::SaveCache);
        self.persist(session_id, true, fx);
        fx.push(Effect::Notify(Notice::ChatFinished {
            session_id: session_id.to_string(),
            outcome,
        }));
    }

    fn on_chat_lost(&mut self, session_id: &str, now: Timestamp, fx: &mut Vec<Effect>) {
        self.chat_links.remove(session_id);
        self.store.update(session_id, now, |s| {
            if let Some(msg) = s.streaming_message_mut() {
                append_marker(&mut msg.content, CHAT_LOST_MARKER);
                msg.streaming = false;
            }
        });
        warn!(session_id, "chat connection lost before the reply finished");
        fx.push(Effect::SaveCache);
        self.persist(session_id, true, fx);
        fx.push(Effect::Notify(Notice::ChatFinished {
            session_id: session_id.to_string(),
            outcome: Outcome::ConnectionLost,
        }));
    }

    // --- research ------------------------------------------------------

    fn start_research(
        &mut self,
        topic: &str,
        depth: PlanDepth,
        kb_name: Option<String>,
        now: Timestamp,
        fx: &mut Vec<Effect>,
    ) {
        let topic = topic.trim();
        if topic.is_empty() {
            fx.push(Effect::Notify(Notice::Error("research topic is empty".into())));
            return;
        }
        let id = self.ensure_session(now);
        if self.research_links.contains_key(&id)
            || self.store.get(&id).is_some_and(Session::research_running)
        {
            fx.push(Effect::Notify(Notice::Error(
                "a research job is already running in this session".into(),
            )));
            return;
        }

        if self.draining.remove(&id).is_some() {
            fx.push(Effect::CloseResearch { session_id: id.clone() });
        }
        self.recovering.remove(&id);
        self.store.update(&id, now, |s| {
            let anchor = s.messages.len();
            s.messages.push(ChatMessage::user(format!("Deep research: {topic}")));
            let mut placeholder = ChatMessage::placeholder();
            placeholder.content = format!("Planning research on {topic}...");
            s.messages.push(placeholder);
            s.research_state = Some(ResearchJobState::begin(topic, depth, anchor, now));
        });
        self.draft_dirty = true;
        info!(session_id = %id, topic, depth = depth.as_str(), "starting research");

        let link = self.next_link();
        self.research_links.insert(id.clone(), link);
        fx.push(Effect::SaveCache);
        self.persist(&id, false, fx);
        fx.push(Effect::OpenResearch {
            session_id: id.clone(),
            link,
            start: json!({
                "topic": topic,
                "kb_name": kb_name,
                "plan_mode": depth.as_str(),
                "session_id": id,
                "notebook_id": self.notebook_id,
            }),
        });
        fx.push(Effect::ArmJobTimeout {
            session_id: id,
            after: self.timings.job_timeout,
        });
    }

    fn on_research_event(
        &mut self,
        session_id: &str,
        event: &ResearchEvent,
        now: Timestamp,
        fx: &mut Vec<Effect>,
    ) {
        match event {
            ResearchEvent::Log(line) => {
                debug!(session_id, line, "research log");
                return;
            }
            ResearchEvent::TaskId(task) => {
                debug!(session_id, task, "research task assigned");
                return;
            }
            ResearchEvent::Ping => return,
            ResearchEvent::Unknown(kind) => {
                debug!(session_id, kind, "ignoring research frame");
                return;
            }
            _ => {}
        }

        let transition = self.store.update(session_id, now, |s| {
            let state = s.research_state.get_or_insert_with(ResearchJobState::default);
            let transition = state.apply(event, now);
            if transition == Transition::Updated {
                let line = progress_line(state);
                if let Some(msg) = s.streaming_message_mut() {
                    msg.content = line;
                }
            }
            transition
        });

        match transition {
            Some(Transition::Updated) => {
                let state = self
                    .store
                    .get(session_id)
                    .and_then(|s| s.research_state.as_ref());
                if let Some(state) = state {
                    fx.push(Effect::Notify(Notice::Progress {
                        session_id: session_id.to_string(),
                        phase: state.phase,
                        progress: state.progress,
                        sub_topic: state.current_sub_topic.clone(),
                        eta_secs: state.estimated_time_remaining,
                    }));
                }
                fx.push(Effect::SaveCache);
                self.persist(session_id, false, fx);
            }
            Some(Transition::JobAssigned(job_id)) => {
                debug!(session_id, job_id, "research job id assigned");
                fx.push(Effect::SaveCache);
                self.persist(session_id, false, fx);
            }
            Some(Transition::Terminal(Terminal::Report { report, metadata })) => {
                self.complete_report(session_id, &report, metadata.as_ref(), now, fx);
            }
            Some(Transition::Terminal(Terminal::ReportAt(url))) => {
                debug!(session_id, url, "report published at path");
                self.recovering
                    .insert(session_id.to_string(), RecoveryStep::FetchingReport);
                fx.push(Effect::FetchReport {
                    session_id: session_id.to_string(),
                    url,
                    metadata: None,
                });
            }
            Some(Transition::Terminal(Terminal::Failed(message))) => {
                self.research_links.remove(session_id);
                fx.push(Effect::CloseResearch {
                    session_id: session_id.to_string(),
                });
                self.fail_research(session_id, &message, now, fx);
            }
            Some(Transition::Ignored) | None => {}
        }
    }

    /// Attach a report delivered live or by recovery. Safe to call twice.
    pub(super) fn complete_report(
        &mut self,
        session_id: &str,
        report_text: &str,
        metadata: Option<&Value>,
        now: Timestamp,
        fx: &mut Vec<Effect>,
    ) {
        if report_text.trim().is_empty() {
            self.fail_research(session_id, "research finished without a report", now, fx);
            return;
        }
        let recovered = self.recovering.remove(session_id).is_some();
        let open = self.research_links.remove(session_id).is_some();
        if open || self.draining.remove(session_id).is_some() {
            fx.push(Effect::CloseResearch {
                session_id: session_id.to_string(),
            });
        }
        fx.push(Effect::ClearJobTimeout {
            session_id: session_id.to_string(),
        });

        let already = self.store.get(session_id).is_some_and(report::report_inserted);
        let changed = if already {
            self.store.update(session_id, now, |s| {
                if let Some(state) = s.research_state.as_mut() {
                    state.complete();
                }
            });
            false
        } else {
            self.store
                .update(session_id, now, |s| report::insert_report(s, report_text, metadata, now))
                .unwrap_or(false)
        };
        info!(session_id, changed, recovered, "research report delivered");

        fx.push(Effect::SaveCache);
        self.persist(session_id, true, fx);
        if changed || recovered {
            fx.push(Effect::Notify(Notice::ResearchFinished {
                session_id: session_id.to_string(),
                outcome: Outcome::Completed,
            }));
        }
        if recovered {
            fx.push(Effect::Notify(Notice::RecoveryFinished {
                session_id: session_id.to_string(),
                recovered: true,
            }));
        }
    }

    /// Terminal job failure: replace the streaming message and reset to idle.
    pub(super) fn fail_research(
        &mut self,
        session_id: &str,
        message: &str,
        now: Timestamp,
        fx: &mut Vec<Effect>,
    ) {
        self.recovering.remove(session_id);
        self.store.update(session_id, now, |s| {
            if let Some(state) = s.research_state.as_mut() {
                state.fail();
            }
            let text = format!("Research failed: {message}");
            match s.streaming_message_mut() {
                Some(msg) => {
                    msg.content = text;
                    msg.streaming = false;
                }
                None => s.messages.push(ChatMessage::assistant(text)),
            }
        });
        warn!(session_id, message, "research failed");
        fx.push(Effect::ClearJobTimeout {
            session_id: session_id.to_string(),
        });
        fx.push(Effect::SaveCache);
        self.persist(session_id, true, fx);
        fx.push(Effect::Notify(Notice::ResearchFinished {
            session_id: session_id.to_string(),
            outcome: Outcome::Failed(message.to_string()),
        }));
    }

    fn on_research_lost(&mut self, session_id: &str, now: Timestamp, fx: &mut Vec<Effect>) {
        let running = self
            .store
            .get(session_id)
            .is_some_and(Session::research_running);
        if !running || self.recovering.contains_key(session_id) {
            return;
        }
        self.store.update(session_id, now, |s| {
            if let Some(state) = s.research_state.as_mut() {
                state.lose_stream();
            }
            match s.streaming_message_mut() {
                Some(msg) => {
                    append_marker(&mut msg.content, RESEARCH_LOST_MARKER);
                    msg.streaming = false;
                }
                None => s.messages.push(ChatMessage::assistant(RESEARCH_LOST_MARKER)),
            }
        });
        warn!(session_id, "research stream lost, scheduling recovery");
        fx.push(Effect::SaveCache);
        self.persist(session_id, true, fx);
        fx.push(Effect::ScheduleRecovery {
            session_id: session_id.to_string(),
            after: self.timings.recovery_delay,
        });
        fx.push(Effect::Notify(Notice::ResearchFinished {
            session_id: session_id.to_string(),
            outcome: Outcome::ConnectionLost,
        }));
    }

    fn cancel_research(&mut self, now: Timestamp, fx: &mut Vec<Effect>) {
        let Some(id) = self.current.clone() else {
            return;
        };
        if !self.store.get(&id).is_some_and(Session::research_running) {
            return;
        }
        self.recovering.remove(&id);
        self.store.update(&id, now, |s| {
            if let Some(state) = s.research_state.as_mut() {
                state.cancel();
            }
            if let Some(msg) = s.streaming_message_mut() {
                append_marker(&mut msg.content, CANCELLED_MARKER);
                msg.streaming = false;
            }
        });
        info!(session_id = %id, "research cancelled locally");
        // The job timeout stays armed and bounds how long the link drains.
        match self.research_links.remove(&id) {
            Some(link) => {
                fx.push(Effect::SendResearchCancel {
                    session_id: id.clone(),
                });
                self.draining.insert(id.clone(), link);
            }
            None => fx.push(Effect::ClearJobTimeout {
                session_id: id.clone(),
            }),
        }
        fx.push(Effect::SaveCache);
        self.persist(&id, true, fx);
        fx.push(Effect::Notify(Notice::ResearchFinished {
            session_id: id,
            outcome: Outcome::Cancelled,
        }));
    }

    /// Frames of a cancelled job. A late report is still taken.
    fn on_draining_event(
        &mut self,
        session_id: &str,
        event: &ResearchEvent,
        now: Timestamp,
        fx: &mut Vec<Effect>,
    ) {
        match event {
            ResearchEvent::Result {
                report, metadata, ..
            } => {
                info!(session_id, "report arrived after cancel");
                self.complete_report(session_id, report, metadata.as_ref(), now, fx);
            }
            ResearchEvent::Error(message) => {
                debug!(session_id, message, "cancelled job ended with an error");
                self.close_draining(session_id, fx);
            }
            _ => {}
        }
    }

    fn close_draining(&mut self, session_id: &str, fx: &mut Vec<Effect>) {
        if self.draining.remove(session_id).is_some() {
            fx.push(Effect::CloseResearch {
                session_id: session_id.to_string(),
            });
            fx.push(Effect::ClearJobTimeout {
                session_id: session_id.to_string(),
            });
        }
    }
}

fn append_marker(content: &mut String, marker: &str) {
    if content.contains(marker) {
        return;
    }
    if !content.is_empty() {
        content.push_str("\n\n");
    }
    content.push_str(marker);
}

fn progress_line(state: &ResearchJobState) -> String {
    match state.phase {
        ResearchPhase::Idle => String::new(),
        ResearchPhase::Planning => format!("Planning research on {}...", state.topic),
        ResearchPhase::Researching => {
            let Progress { current, total } = state.progress;
            let mut line = format!("Researching {current}/{total}");
            if let Some(sub) = &state.current_sub_topic {
                line.push_str(&format!(": {sub}"));
            }
            if let Some(eta) = state.estimated_time_remaining {
                line.push_str(&format!(" (about {eta}s left)"));
            }
            line
        }
        ResearchPhase::Reporting => "Writing the report...".to_string(),
    }
}
