//! In-memory session store and persist scheduling.

mod debounce;
mod sessions;

pub use debounce::{PersistQueue, SingleSlotTimer};
pub use sessions::SessionStore;
