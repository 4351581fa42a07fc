//! Async driver for one notebook.
//!
//! The runtime owns the controller, the local cache and every timer. One
//! `select!` loop feeds it commands, results of spawned I/O tasks and timer
//! expirations, one at a time, so the controller never sees concurrent
//! mutation.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::controller::{
    ChatOptions, Effect, Event, FetchPurpose, LinkId, NotebookController, Notice, Timings,
};
use crate::api::{ResearchApi, SessionApi};
use crate::cache::LocalCache;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::models::{PlanDepth, Session, Source, Timestamp};
use crate::store::{PersistQueue, SingleSlotTimer};
use crate::transport::{self, ChatEvent, LinkEvent, ResearchEvent, WsLink};

const NOTICE_CAPACITY: usize = 512;

/// Snapshot of the controller state handed to callers.
#[derive(Debug, Clone, Default)]
pub struct View {
    pub sessions: Vec<Session>,
    pub current_session_id: Option<String>,
}

impl View {
    pub fn current_session(&self) -> Option<&Session> {
        let id = self.current_session_id.as_deref()?;
        self.sessions.iter().find(|s| s.session_id == id)
    }

    /// Sources of every session, deduplicated by id.
    pub fn all_sources(&self) -> Vec<&Source> {
        let mut seen = HashSet::new();
        self.sessions
            .iter()
            .flat_map(|s| s.sources.iter())
            .filter(|s| seen.insert(s.id.as_str()))
            .collect()
    }
}

enum Command {
    Dispatch(Event),
    Inspect(oneshot::Sender<View>),
    Shutdown(oneshot::Sender<View>),
}

#[derive(Debug, Clone, Copy)]
enum LinkKind {
    Chat,
    Research,
}

enum Internal {
    Event(Event),
    LinkOpened {
        kind: LinkKind,
        session_id: String,
        link_id: LinkId,
        link: WsLink,
    },
}

/// Cloneable handle to a running notebook.
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    commands: mpsc::Sender<Command>,
    notices: broadcast::Sender<Notice>,
}

impl RuntimeHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub async fn dispatch(&self, event: Event) -> Result<()> {
        self.commands
            .send(Command::Dispatch(event))
            .await
            .map_err(|_| SyncError::RuntimeStopped)
    }

    pub async fn send_chat(&self, message: impl Into<String>, options: ChatOptions) -> Result<()> {
        self.dispatch(Event::SendChat {
            message: message.into(),
            options,
        })
        .await
    }

    pub async fn start_research(
        &self,
        topic: impl Into<String>,
        depth: PlanDepth,
        kb_name: Option<String>,
    ) -> Result<()> {
        self.dispatch(Event::StartResearch {
            topic: topic.into(),
            depth,
            kb_name,
        })
        .await
    }

    pub async fn cancel_research(&self) -> Result<()> {
        self.dispatch(Event::CancelResearch).await
    }

    pub async fn set_visible(&self, visible: bool) -> Result<()> {
        self.dispatch(Event::VisibilityChanged { visible }).await
    }

    pub async fn recover(&self) -> Result<()> {
        self.dispatch(Event::Recover).await
    }

    pub async fn toggle_source(&self, source_id: impl Into<String>) -> Result<()> {
        self.dispatch(Event::ToggleSource {
            source_id: source_id.into(),
        })
        .await
    }

    pub async fn new_session(&self) -> Result<()> {
        self.dispatch(Event::NewSession).await
    }

    pub async fn select_session(&self, session_id: impl Into<String>) -> Result<()> {
        self.dispatch(Event::SelectSession {
            session_id: session_id.into(),
        })
        .await
    }

    pub async fn inspect(&self) -> Result<View> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Inspect(tx))
            .await
            .map_err(|_| SyncError::RuntimeStopped)?;
        rx.await.map_err(|_| SyncError::RuntimeStopped)
    }

    /// Flush pending persists, save the cache and stop.
    pub async fn shutdown(self) -> Result<View> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown(tx))
            .await
            .map_err(|_| SyncError::RuntimeStopped)?;
        rx.await.map_err(|_| SyncError::RuntimeStopped)
    }
}

/// Executes controller effects against a backend.
pub struct NotebookRuntime<B> {
    controller: NotebookController,
    backend: B,
    cache: LocalCache,
    ws_base: String,
    connect_timeout: Duration,
    shutdown_grace: Duration,
    persist_queue: PersistQueue,
    in_flight: HashSet<String>,
    /// Newest snapshot waiting behind an in-flight persist of the same session.
    stashed: HashMap<String, Session>,
    recovery_timers: HashMap<String, SingleSlotTimer<()>>,
    job_timers: HashMap<String, SingleSlotTimer<()>>,
    research_links: HashMap<String, WsLink>,
    chat_links: HashMap<String, WsLink>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    notices: broadcast::Sender<Notice>,
    tasks: JoinSet<()>,
    cache_dirty: bool,
}

impl<B: SessionApi + ResearchApi> NotebookRuntime<B> {
    pub fn new(
        notebook_id: impl Into<String>,
        config: &SyncConfig,
        cache: LocalCache,
        backend: B,
    ) -> Result<Self> {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Ok(Self {
            controller: NotebookController::new(notebook_id, Timings::from(config)),
            backend,
            cache,
            ws_base: config.ws_base()?,
            connect_timeout: config.connect_timeout(),
            shutdown_grace: config.request_timeout(),
            persist_queue: PersistQueue::new(config.debounce()),
            in_flight: HashSet::new(),
            stashed: HashMap::new(),
            recovery_timers: HashMap::new(),
            job_timers: HashMap::new(),
            research_links: HashMap::new(),
            chat_links: HashMap::new(),
            internal_tx,
            internal_rx,
            notices,
            tasks: JoinSet::new(),
            cache_dirty: false,
        })
    }

    /// Start the runtime. The returned receiver sees every notice from mount on.
    pub fn spawn(self) -> (RuntimeHandle, broadcast::Receiver<Notice>) {
        let (commands, rx) = mpsc::channel(64);
        let notices = self.notices.clone();
        let first = notices.subscribe();
        tokio::spawn(self.run(rx));
        (RuntimeHandle { commands, notices }, first)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let snapshot = self.cache.load(self.controller.notebook_id());
        self.apply(Event::Mounted { snapshot });

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Dispatch(event)) => self.apply(event),
                    Some(Command::Inspect(reply)) => {
                        let _ = reply.send(self.view());
                    }
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(self.view());
                        return;
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => {}
                () = sleep_until(deadline) => self.fire_timers(),
            }
        }
    }

    fn view(&self) -> View {
        View {
            sessions: self.controller.sessions().to_vec(),
            current_session_id: self.controller.current_session_id().map(String::from),
        }
    }

    fn apply(&mut self, event: Event) {
        let effects = self.controller.dispatch(event, Timestamp::now());
        for effect in effects {
            self.perform(effect);
        }
        if std::mem::take(&mut self.cache_dirty) {
            self.save_cache();
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Event(event) => {
                if let Event::Persisted { session_id, .. } = &event {
                    self.in_flight.remove(session_id);
                    if let Some(next) = self.stashed.remove(session_id) {
                        self.persist_now(next);
                    }
                }
                self.apply(event);
            }
            Internal::LinkOpened {
                kind,
                session_id,
                link_id,
                link,
            } => {
                let (expected, links) = match kind {
                    LinkKind::Research => (
                        self.controller.research_link(&session_id),
                        &mut self.research_links,
                    ),
                    LinkKind::Chat => {
                        (self.controller.chat_link(&session_id), &mut self.chat_links)
                    }
                };
                // A link the controller stopped listening to is dropped, which closes it.
                if expected == Some(link_id) {
                    links.insert(session_id, link);
                }
            }
        }
    }

    fn perform(&mut self, effect: Effect) {
        match effect {
            Effect::SaveCache => self.cache_dirty = true,
            Effect::Persist { session, immediate } => {
                if immediate {
                    self.persist_queue.cancel(&session.session_id);
                    self.persist_now(session);
                } else {
                    self.persist_queue.schedule(session, Instant::now());
                }
            }
            Effect::FlushPending => {
                for session in self.persist_queue.drain_all() {
                    self.persist_now(session);
                }
            }
            Effect::FetchSessions { purpose } => self.fetch_sessions(purpose),
            Effect::OpenChat {
                session_id,
                link,
                request,
            } => self.open_chat(session_id, link, request),
            Effect::OpenResearch {
                session_id,
                link,
                start,
            } => self.open_research(session_id, link, start),
            Effect::SendResearchCancel { session_id } => {
                let sent = self
                    .research_links
                    .get(&session_id)
                    .is_some_and(|link| link.send_json(&json!({"type": "cancel"})));
                debug!(session_id, sent, "sent research cancel");
            }
            Effect::CloseResearch { session_id } => {
                self.research_links.remove(&session_id);
            }
            Effect::PollJobStatus { session_id, job_id } => {
                let backend = self.backend.clone();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = backend.job_status(&job_id).await.map_err(|e| e.to_string());
                    let event = Event::JobStatusFetched { session_id, result };
                    let _ = tx.send(Internal::Event(event));
                });
            }
            Effect::FetchReport {
                session_id,
                url,
                metadata,
            } => {
                let backend = self.backend.clone();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = backend.fetch_report(&url).await.map_err(|e| e.to_string());
                    let _ = tx.send(Internal::Event(Event::ReportFetched {
                        session_id,
                        metadata,
                        result,
                    }));
                });
            }
            Effect::ScheduleRecovery { session_id, after } => {
                self.recovery_timers
                    .entry(session_id)
                    .or_default()
                    .arm(Instant::now() + after, ());
            }
            Effect::ArmJobTimeout { session_id, after } => {
                self.job_timers
                    .entry(session_id)
                    .or_default()
                    .arm(Instant::now() + after, ());
            }
            Effect::ClearJobTimeout { session_id } => {
                self.job_timers.remove(&session_id);
            }
            Effect::Notify(notice) => {
                debug!(?notice, "notice");
                let _ = self.notices.send(notice);
            }
        }
    }

    fn save_cache(&self) {
        let notebook_id = self.controller.notebook_id();
        if let Err(e) = self.cache.save(
            notebook_id,
            self.controller.sessions(),
            self.controller.current_session_id(),
        ) {
            warn!(notebook_id, error = %e, "failed to write session cache");
        }
    }

    /// Send a snapshot now, keeping at most one request per session in flight.
    fn persist_now(&mut self, session: Session) {
        let session_id = session.session_id.clone();
        if self.in_flight.contains(&session_id) {
            self.stashed.insert(session_id, session);
            return;
        }
        self.in_flight.insert(session_id.clone());

        let backend = self.backend.clone();
        let notebook_id = self.controller.notebook_id().to_string();
        let tx = self.internal_tx.clone();
        self.tasks.spawn(async move {
            let result = backend
                .upsert_session(&notebook_id, &session)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(Internal::Event(Event::Persisted { session_id, result }));
        });
    }

    fn fetch_sessions(&self, purpose: FetchPurpose) {
        let backend = self.backend.clone();
        let notebook_id = self.controller.notebook_id().to_string();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = backend
                .list_sessions(&notebook_id)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(Internal::Event(Event::SessionsFetched { purpose, result }));
        });
    }

    fn open_research(&self, session_id: String, link_id: LinkId, start: Value) {
        let url = format!("{}/research/run", self.ws_base);
        let timeout = self.connect_timeout;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let (link, mut frames) = match transport::connect(&url, timeout).await {
                Ok(opened) => opened,
                Err(e) => {
                    let _ = tx.send(Internal::Event(Event::ResearchLinkFailed {
                        session_id,
                        link: link_id,
                        error: e.to_string(),
                    }));
                    return;
                }
            };
            link.send_json(&start);
            let _ = tx.send(Internal::LinkOpened {
                kind: LinkKind::Research,
                session_id: session_id.clone(),
                link_id,
                link,
            });

            while let Some(frame) = frames.recv().await {
                let event = match frame {
                    LinkEvent::Frame(text) => match ResearchEvent::parse(&text) {
                        Some(event) => Event::Research {
                            session_id: session_id.clone(),
                            link: link_id,
                            event,
                        },
                        None => continue,
                    },
                    LinkEvent::Closed { error } => {
                        debug!(session_id, ?error, "research link closed");
                        Event::ResearchClosed {
                            session_id: session_id.clone(),
                            link: link_id,
                        }
                    }
                };
                if tx.send(Internal::Event(event)).is_err() {
                    break;
                }
            }
        });
    }

    fn open_chat(&self, session_id: String, link_id: LinkId, request: Value) {
        let url = format!("{}/chat", self.ws_base);
        let timeout = self.connect_timeout;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let (link, mut frames) = match transport::connect(&url, timeout).await {
                Ok(opened) => opened,
                Err(e) => {
                    let _ = tx.send(Internal::Event(Event::ChatLinkFailed {
                        session_id,
                        link: link_id,
                        error: e.to_string(),
                    }));
                    return;
                }
            };
            link.send_json(&request);
            let _ = tx.send(Internal::LinkOpened {
                kind: LinkKind::Chat,
                session_id: session_id.clone(),
                link_id,
                link,
            });

            while let Some(frame) = frames.recv().await {
                let event = match frame {
                    LinkEvent::Frame(text) => match ChatEvent::parse(&text) {
                        Some(event) => Event::Chat {
                            session_id: session_id.clone(),
                            link: link_id,
                            event,
                        },
                        None => continue,
                    },
                    LinkEvent::Closed { .. } => Event::ChatClosed {
                        session_id: session_id.clone(),
                        link: link_id,
                    },
                };
                if tx.send(Internal::Event(event)).is_err() {
                    break;
                }
            }
        });
    }

    fn next_deadline(&self) -> Option<Instant> {
        let timers = self
            .recovery_timers
            .values()
            .chain(self.job_timers.values())
            .filter_map(SingleSlotTimer::due);
        self.persist_queue.next_due().into_iter().chain(timers).min()
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        for session in self.persist_queue.drain_due(now) {
            self.persist_now(session);
        }

        let recoveries = take_due(&mut self.recovery_timers, now);
        for session_id in recoveries {
            self.apply(Event::RecoveryDue { session_id });
        }
        let timeouts = take_due(&mut self.job_timers, now);
        for session_id in timeouts {
            self.apply(Event::JobTimedOut { session_id });
        }
    }

    async fn shutdown(&mut self) {
        for session in self.persist_queue.drain_all() {
            self.persist_now(session);
        }

        let deadline = Instant::now() + self.shutdown_grace;
        while !self.in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, self.internal_rx.recv()).await {
                Ok(Some(Internal::Event(event @ Event::Persisted { .. }))) => {
                    self.handle_internal(Internal::Event(event));
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => {
                    warn!(pending = self.in_flight.len(), "gave up waiting for persists");
                    break;
                }
            }
        }

        self.research_links.clear();
        self.chat_links.clear();
        self.save_cache();
        debug!(notebook_id = self.controller.notebook_id(), "runtime stopped");
    }
}

fn take_due(timers: &mut HashMap<String, SingleSlotTimer<()>>, now: Instant) -> Vec<String> {
    let due: Vec<String> = timers
        .iter_mut()
        .filter_map(|(id, timer)| timer.take_if_due(now).map(|()| id.clone()))
        .collect();
    timers.retain(|_, timer| timer.is_armed());
    due
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
