//! Session reconciliation engine.
//!
//! [`NotebookController`] holds the state and decides; [`NotebookRuntime`]
//! performs the I/O it asks for.

mod controller;
mod recovery;
mod report;
mod runtime;


pub use controller::{
    ChatOptions, Effect, Event, FetchPurpose, LinkId, NotebookController, Notice, Outcome, Timings,
};
pub use report::insert_report;
pub use runtime::{NotebookRuntime, RuntimeHandle, View};
