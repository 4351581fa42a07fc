//! Browser-local style cache of notebook sessions.

mod local;

pub use local::{CacheSnapshot, LocalCache};
