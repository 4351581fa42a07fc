//! CLI argument definitions.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use crate::models::PlanDepth;

/// notesync - keep notebook sessions and deep-research reports in sync
#[derive(Parser, Debug)]
#[command(name = "notesync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Backend API base URL (overrides config and NOTESYNC_API_BASE)
    #[arg(long, global = true)]
    pub api_base: Option<String>,

    /// Directory of the local session cache
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Config file (default: <config dir>/notesync/config.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List sessions (cache first, then corrected by the backend)
    Sessions {
        /// Notebook id
        notebook: String,
    },

    /// Send a chat message in the current session
    Chat {
        /// Notebook id
        notebook: String,

        /// Knowledge base to answer from
        #[arg(long)]
        kb: Option<String>,

        /// Do not use the knowledge base
        #[arg(long)]
        no_rag: bool,

        /// Allow web search
        #[arg(long)]
        web: bool,

        /// Message to send
        #[arg(trailing_var_arg = true, required = true)]
        message: Vec<String>,
    },

    /// Start a deep-research job in the current session and wait for the report
    Research {
        /// Notebook id
        notebook: String,

        /// Plan depth
        #[arg(long, value_enum, default_value_t = PlanDepth::Medium)]
        depth: PlanDepth,

        /// Knowledge base to research from
        #[arg(long)]
        kb: Option<String>,

        /// Research topic
        #[arg(trailing_var_arg = true, required = true)]
        topic: Vec<String>,
    },

    /// Recover a research report whose stream was lost
    Recover {
        /// Notebook id
        notebook: String,
    },

    /// Flush the current session and switch to a fresh one
    NewSession {
        /// Notebook id
        notebook: String,
    },

    /// List or toggle sources of the current session
    Sources {
        /// Notebook id
        notebook: String,

        /// Flip the selection of this source
        #[arg(long)]
        toggle: Option<String>,

        /// Print selected sources as markdown
        #[arg(long)]
        markdown: bool,

        /// Show sources of every session
        #[arg(long)]
        all: bool,
    },

    /// Run the development backend
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8001")]
        port: u16,

        /// Open browser automatically
        #[arg(long)]
        open: bool,

        /// Delay between simulated research steps
        #[arg(long, default_value = "400")]
        step_ms: u64,
    },
}

impl Commands {
    /// Notebook the command works on, if any.
    pub fn notebook(&self) -> Option<&str> {
        match self {
            Self::Sessions { notebook }
            | Self::Chat { notebook, .. }
            | Self::Research { notebook, .. }
            | Self::Recover { notebook }
            | Self::NewSession { notebook }
            | Self::Sources { notebook, .. } => Some(notebook),
            Self::Serve { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn research_collects_topic_words() {
        let cli = Cli::parse_from([
            "notesync", "research", "nb1", "--depth", "deep", "quantum", "computing",
        ]);
        match cli.command {
            Commands::Research { notebook, depth, topic, .. } => {
                assert_eq!(notebook, "nb1");
                assert_eq!(depth, PlanDepth::Deep);
                assert_eq!(topic.join(" "), "quantum computing");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "notesync",
            "sessions",
            "nb1",
            "-vv",
            "--api-base",
            "http://x/api",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.api_base.as_deref(), Some("http://x/api"));
        assert_eq!(cli.command.notebook(), Some("nb1"));
    }
}
