//! notesync - headless notebook client that keeps chat sessions and
//! deep-research reports consistent across the local cache, live transports
//! and the backend.
//!
//! Architecture:
//! - `engine::NotebookController` is a pure state machine over one notebook
//! - `engine::NotebookRuntime` drives it: backend calls, sockets, timers, cache
//! - `server` is an in-memory development backend for running end to end

mod api;
mod cache;
mod cli;
mod config;
mod engine;
mod error;
mod models;
mod research;
mod server;
mod store;
mod transport;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{execute, Cli};

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "notesync=info,warn",
        _ => "notesync=debug,info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    execute(cli).await
}
