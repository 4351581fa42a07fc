//! Cancel-and-reschedule timers for session persists.
//!
//! Both types are pure: the caller passes the current [`Instant`] and asks
//! what is due, so the runtime owns the only real sleep.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::models::Session;

/// Debounced persist queue holding at most one pending snapshot per session.
#[derive(Debug)]
pub struct PersistQueue {
    window: Duration,
    slots: HashMap<String, Slot>,
}

#[derive(Debug)]
struct Slot {
    due: Instant,
    session: Session,
}

impl PersistQueue {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            slots: HashMap::new(),
        }
    }

    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Queue a snapshot, replacing any pending one and restarting its window.
    pub fn schedule(&mut self, session: Session, now: Instant) {
        let due = now + self.window;
        self.slots
            .insert(session.session_id.clone(), Slot { due, session });
    }

    /// Drop the pending snapshot for a session, e.g. when an immediate
    /// persist supersedes it.
    pub fn cancel(&mut self, session_id: &str) -> Option<Session> {
        self.slots.remove(session_id).map(|slot| slot.session)
    }

    pub fn is_pending(&self, session_id: &str) -> bool {
        self.slots.contains_key(session_id)
    }

    /// Earliest deadline among pending snapshots.
    pub fn next_due(&self) -> Option<Instant> {
        self.slots.values().map(|slot| slot.due).min()
    }

    /// Remove and return every snapshot whose window has elapsed.
    pub fn drain_due(&mut self, now: Instant) -> Vec<Session> {
        let due: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.due <= now)
            .map(|(id, _)| id.clone())
            .collect();
        due.iter()
            .filter_map(|id| self.slots.remove(id))
            .map(|slot| slot.session)
            .collect()
    }

    /// Remove and return everything, regardless of deadline.
    pub fn drain_all(&mut self) -> Vec<Session> {
        self.slots.drain().map(|(_, slot)| slot.session).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// A timer with one slot: arming it again replaces the previous deadline.
#[derive(Debug)]
pub struct SingleSlotTimer<T> {
    slot: Option<(Instant, T)>,
}

impl<T> Default for SingleSlotTimer<T> {
    fn default() -> Self {
        Self { slot: None }
    }
}

impl<T> SingleSlotTimer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, due: Instant, payload: T) {
        self.slot = Some((due, payload));
    }

    pub fn cancel(&mut self) -> Option<T> {
        self.slot.take().map(|(_, payload)| payload)
    }

    pub fn due(&self) -> Option<Instant> {
        self.slot.as_ref().map(|(due, _)| *due)
    }

    pub const fn is_armed(&self) -> bool {
        self.slot.is_some()
    }

    /// Fire the timer if its deadline has passed.
    pub fn take_if_due(&mut self, now: Instant) -> Option<T> {
        match self.slot {
            Some((due, _)) if due <= now => self.cancel(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Timestamp;

    fn session(id: &str, updated: i64) -> Session {
        let mut s = Session::new(id, Timestamp::from_millis(1));
        s.updated_at = Timestamp::from_millis(updated);
        s
    }

    #[test]
    fn reschedule_coalesces_and_extends_window() {
        let start = Instant::now();
        let window = Duration::from_millis(1_200);
        let mut queue = PersistQueue::new(window);

        queue.schedule(session("a", 1), start);
        queue.schedule(session("a", 2), start + Duration::from_millis(800));
        assert_eq!(queue.len(), 1);

        assert!(queue.drain_due(start + window).is_empty());
        let fired = queue.drain_due(start + Duration::from_millis(2_000));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].updated_at.as_millis(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn sessions_have_independent_slots() {
        let start = Instant::now();
        let mut queue = PersistQueue::new(Duration::from_millis(100));
        queue.schedule(session("a", 1), start);
        queue.schedule(session("b", 1), start + Duration::from_millis(50));

        assert_eq!(queue.next_due(), Some(start + Duration::from_millis(100)));
        let fired = queue.drain_due(start + Duration::from_millis(120));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].session_id, "a");
        assert!(queue.is_pending("b"));
    }

    #[test]
    fn cancel_supersedes_pending() {
        let start = Instant::now();
        let mut queue = PersistQueue::new(Duration::from_millis(100));
        queue.schedule(session("a", 1), start);
        assert!(queue.cancel("a").is_some());
        assert!(queue.drain_due(start + Duration::from_secs(5)).is_empty());
        assert!(queue.cancel("a").is_none());
    }

    #[test]
    fn single_slot_timer_rearms() {
        let start = Instant::now();
        let mut timer = SingleSlotTimer::new();
        timer.arm(start + Duration::from_secs(1), "first");
        timer.arm(start + Duration::from_secs(3), "second");

        assert_eq!(timer.take_if_due(start + Duration::from_secs(2)), None);
        assert_eq!(timer.take_if_due(start + Duration::from_secs(3)), Some("second"));
        assert!(!timer.is_armed());
    }
}
