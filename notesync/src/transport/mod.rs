//! Chat and research transports.

mod events;
mod ws;

pub use events::{ChatEvent, ResearchEvent};
pub use ws::{connect, LinkEvent, WsLink};
