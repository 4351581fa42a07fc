//! Research job tracking.

mod tracker;

pub use tracker::{Terminal, Transition};
