//! CLI command execution.
//!
//! Each notebook command opens one runtime over the local cache, waits for the
//! mount sync, does its work and shuts the runtime down so pending persists
//! are flushed before the process exits.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use crate::api::HttpBackend;
use crate::cache::LocalCache;
use crate::config::SyncConfig;
use crate::engine::{ChatOptions, NotebookRuntime, Notice, Outcome, RuntimeHandle, View};
use crate::models::{sources_markdown, PlanDepth, Session, Source};
use crate::server;

use super::args::{Cli, Commands};

/// Config layers: defaults, file, environment, then flags.
fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::load_from_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SyncConfig::load().context("Failed to load config")?,
    };
    if let Some(api_base) = &cli.api_base {
        config.api_base.clone_from(api_base);
    }
    if let Some(dir) = &cli.cache_dir {
        config.cache_dir = Some(dir.clone());
    }
    Ok(config)
}

fn open_cache(config: &SyncConfig) -> Result<LocalCache> {
    let cache = match &config.cache_dir {
        Some(dir) => LocalCache::open_at(PathBuf::from(dir)),
        None => LocalCache::open_default(),
    };
    cache.context("Failed to open the session cache")
}

/// A mounted notebook: runtime handle plus its notice stream.
struct Notebook {
    handle: RuntimeHandle,
    notices: broadcast::Receiver<Notice>,
}

impl Notebook {
    async fn open(notebook_id: &str, config: &SyncConfig, cache: LocalCache) -> Result<Self> {
        let backend = HttpBackend::new(config).context("Failed to build the HTTP client")?;
        let runtime = NotebookRuntime::new(notebook_id, config, cache, backend)?;
        let (handle, notices) = runtime.spawn();
        let mut notebook = Self { handle, notices };

        loop {
            if let Notice::Synced { sessions, offline } = notebook.next_notice().await? {
                if offline {
                    println!(
                        "Backend unreachable, working from the local cache ({sessions} sessions)."
                    );
                }
                break;
            }
        }
        Ok(notebook)
    }

    async fn next_notice(&mut self) -> Result<Notice> {
        loop {
            match self.notices.recv().await {
                Ok(notice) => return Ok(notice),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "notice stream lagged"),
                Err(RecvError::Closed) => bail!("notebook runtime stopped"),
            }
        }
    }

    async fn close(self) -> Result<View> {
        Ok(self.handle.shutdown().await?)
    }
}

// === Command Execution ===

pub async fn execute(cli: Cli) -> Result<()> {
    if let Commands::Serve {
        port,
        open,
        step_ms,
    } = cli.command
    {
        return server::start_server(port, open, step_ms).await;
    }

    let config = load_config(&cli)?;
    let cache = open_cache(&config)?;
    debug!(notebook = cli.command.notebook(), api_base = %config.api_base, "running command");

    match cli.command {
        Commands::Sessions { notebook } => list_sessions(&notebook, &config, cache).await,
        Commands::Chat {
            notebook,
            kb,
            no_rag,
            web,
            message,
        } => {
            let options = ChatOptions {
                enable_rag: kb.is_some() && !no_rag,
                kb_name: kb,
                enable_web_search: web,
            };
            chat(&notebook, &config, cache, &message.join(" "), options).await
        }
        Commands::Research {
            notebook,
            depth,
            kb,
            topic,
        } => research(&notebook, &config, cache, &topic.join(" "), depth, kb).await,
        Commands::Recover { notebook } => recover(&notebook, &config, cache).await,
        Commands::NewSession { notebook } => new_session(&notebook, &config, cache).await,
        Commands::Sources {
            notebook,
            toggle,
            markdown,
            all,
        } => sources(&notebook, &config, cache, toggle, markdown, all).await,
        Commands::Serve { .. } => Ok(()),
    }
}

fn print_sessions(sessions: &[Session], current: Option<&str>) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }
    println!("  {:<28} {:<48} {:>5} {:>7}  STATE", "ID", "TITLE", "MSGS", "SOURCES");
    println!("{}", "-".repeat(100));
    for s in sessions {
        let marker = if current == Some(s.session_id.as_str()) { '*' } else { ' ' };
        let title = s.title();
        let title: String = if title.chars().count() > 46 {
            title.chars().take(45).chain(std::iter::once('…')).collect()
        } else {
            title
        };
        let state = if s.pending_recovery() {
            "pending recovery"
        } else if s.has_report() {
            "report"
        } else {
            ""
        };
        println!(
            "{marker} {:<28} {:<48} {:>5} {:>7}  {state}",
            s.session_id,
            title,
            s.messages.len(),
            s.sources.len(),
        );
    }
}

async fn list_sessions(notebook_id: &str, config: &SyncConfig, cache: LocalCache) -> Result<()> {
    let cached = cache.load(notebook_id);
    if !cached.is_empty() {
        println!("Cached:");
        print_sessions(&cached.sessions, cached.current_session_id.as_deref());
        println!();
    }

    let notebook = Notebook::open(notebook_id, config, cache).await?;
    let view = notebook.close().await?;
    println!("Synced:");
    print_sessions(&view.sessions, view.current_session_id.as_deref());
    Ok(())
}

async fn chat(
    notebook_id: &str,
    config: &SyncConfig,
    cache: LocalCache,
    message: &str,
    options: ChatOptions,
) -> Result<()> {
    if message.trim().is_empty() {
        bail!("Message is required for chat");
    }
    let mut notebook = Notebook::open(notebook_id, config, cache).await?;
    notebook.handle.send_chat(message, options).await?;

    let outcome = loop {
        match notebook.next_notice().await? {
            Notice::ChatFinished { outcome, .. } => break outcome,
            Notice::Error(e) => {
                notebook.close().await?;
                bail!(e);
            }
            _ => {}
        }
    };

    let view = notebook.close().await?;
    if let Some(reply) = view
        .current_session()
        .and_then(|s| s.messages.iter().rev().find(|m| m.is_assistant()))
    {
        println!("{}", reply.content);
    }
    match outcome {
        Outcome::Completed => Ok(()),
        Outcome::ConnectionLost => bail!("Chat connection lost, the partial reply was kept"),
        Outcome::Failed(e) => bail!("Chat failed: {e}"),
        Outcome::Cancelled => Ok(()),
    }
}

async fn research(
    notebook_id: &str,
    config: &SyncConfig,
    cache: LocalCache,
    topic: &str,
    depth: PlanDepth,
    kb: Option<String>,
) -> Result<()> {
    if topic.trim().is_empty() {
        bail!("Topic is required for research");
    }
    let mut notebook = Notebook::open(notebook_id, config, cache).await?;
    notebook.handle.start_research(topic, depth, kb).await?;
    println!("Researching: {topic} ({})", depth.as_str());

    let result = wait_for_report(&mut notebook).await;
    let view = notebook.close().await?;
    if result? {
        print_report(&view);
    }
    Ok(())
}

/// Follow notices until the job ends. Returns whether a report arrived.
async fn wait_for_report(notebook: &mut Notebook) -> Result<bool> {
    let mut interrupted = false;
    loop {
        let notice = tokio::select! {
            notice = notebook.next_notice() => notice?,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                println!("Cancelling...");
                notebook.handle.cancel_research().await?;
                continue;
            }
        };
        match notice {
            Notice::Progress {
                phase,
                progress,
                sub_topic,
                eta_secs,
                ..
            } => {
                let mut line = format!("  [{phase}] {}/{}", progress.current, progress.total);
                if let Some(sub) = sub_topic {
                    line.push_str(&format!(" {sub}"));
                }
                if let Some(eta) = eta_secs {
                    line.push_str(&format!(" (~{eta}s left)"));
                }
                println!("{line}");
            }
            Notice::ResearchFinished { outcome, .. } => match outcome {
                Outcome::Completed => return Ok(true),
                Outcome::Cancelled => {
                    println!("Research cancelled.");
                    return Ok(false);
                }
                Outcome::Failed(e) => bail!("Research failed: {e}"),
                Outcome::ConnectionLost => println!("Connection lost, recovering..."),
            },
            Notice::RecoveryPending { phase, .. } => {
                println!("Job still running on the server ({phase}), checking again shortly...");
            }
            Notice::RecoveryFinished {
                recovered: true, ..
            } => return Ok(true),
            Notice::RefreshRequired { .. } => {
                bail!("The report could not be recovered. Run `notesync recover` later.")
            }
            Notice::Error(e) => bail!(e),
            _ => {}
        }
    }
}

fn print_report(view: &View) {
    match view.current_session().and_then(|s| s.research_report.as_deref()) {
        Some(report) => {
            println!();
            println!("{report}");
        }
        None => println!("Report stored in the session."),
    }
}

async fn recover(notebook_id: &str, config: &SyncConfig, cache: LocalCache) -> Result<()> {
    let mut notebook = Notebook::open(notebook_id, config, cache).await?;
    let view = notebook.handle.inspect().await?;

    let Some(current) = view.current_session() else {
        notebook.close().await?;
        println!("No current session.");
        return Ok(());
    };
    if !current.pending_recovery() {
        notebook.close().await?;
        println!("Nothing to recover in {}.", current.session_id);
        return Ok(());
    }

    // Mount may already have started recovery; a second trigger is a no-op.
    notebook.handle.recover().await?;
    let result = wait_for_report(&mut notebook).await;
    let view = notebook.close().await?;
    if result? {
        println!("Report recovered.");
        print_report(&view);
    }
    Ok(())
}

async fn new_session(notebook_id: &str, config: &SyncConfig, cache: LocalCache) -> Result<()> {
    let notebook = Notebook::open(notebook_id, config, cache).await?;
    notebook.handle.new_session().await?;
    let view = notebook.close().await?;
    match view.current_session_id {
        Some(id) => println!("Switched to new session {id}"),
        None => bail!("No session was created"),
    }
    Ok(())
}

async fn sources(
    notebook_id: &str,
    config: &SyncConfig,
    cache: LocalCache,
    toggle: Option<String>,
    markdown: bool,
    all: bool,
) -> Result<()> {
    let notebook = Notebook::open(notebook_id, config, cache).await?;
    if let Some(source_id) = toggle {
        notebook.handle.toggle_source(source_id).await?;
    }
    let view = notebook.close().await?;

    let list: Vec<&Source> = if all {
        view.all_sources()
    } else {
        view.current_session()
            .map(|s| s.sources.iter().collect())
            .unwrap_or_default()
    };

    if markdown {
        println!("{}", sources_markdown(list.into_iter().filter(|s| s.selected)));
        return Ok(());
    }
    if list.is_empty() {
        println!("No sources.");
        return Ok(());
    }
    println!("  {:<36} {:<8} {}", "ID", "TYPE", "TITLE");
    println!("{}", "-".repeat(80));
    for source in list {
        let mark = if source.selected { 'x' } else { ' ' };
        println!("{mark} {:<36} {:<8} {}", source.id, source.kind.as_str(), source.title);
    }
    Ok(())
}
