//! Per-key debounce timers
//!
//! A pure state machine over explicit instants. Each key is either idle or
//! pending with a deadline; an event while pending pushes the deadline out.
//! Nothing here sleeps; the caller decides when to call [`Debouncer::fire`].

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Pending { deadline: Instant },
}

#[derive(Debug, Clone)]
pub struct Debouncer<K> {
    window: Duration,
    pending: BTreeMap<K, Instant>,
}

impl<K: Ord + Clone> Debouncer<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: BTreeMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record an event for `key` at `now`, returning the new deadline
    pub fn event(&mut self, key: K, now: Instant) -> Instant {
        let deadline = now + self.window;
        self.pending.insert(key, deadline);
        deadline
    }

    pub fn state(&self, key: &K) -> TimerState {
        match self.pending.get(key) {
            Some(&deadline) => TimerState::Pending { deadline },
            None => TimerState::Idle,
        }
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Move every key whose deadline has passed back to idle and return them
    /// in key order
    pub fn fire(&mut self, now: Instant) -> Vec<K> {
        let due: Vec<K> = self
            .pending
            .iter()
            .filter(|&(_, &deadline)| deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &due {
            self.pending.remove(key);
        }
        due
    }

    pub fn cancel_all(&mut self) {
        self.pending.clear();
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(100);

    #[test]
    fn test_idle_to_pending_to_fired() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        assert_eq!(d.state(&"styles"), TimerState::Idle);

        let deadline = d.event("styles", t0);
        assert_eq!(deadline, t0 + WINDOW);
        assert_eq!(d.state(&"styles"), TimerState::Pending { deadline });

        assert!(d.fire(t0 + Duration::from_millis(99)).is_empty());
        assert_eq!(d.fire(t0 + WINDOW), vec!["styles"]);
        assert_eq!(d.state(&"styles"), TimerState::Idle);
        assert!(d.is_idle());
    }

    #[test]
    fn test_event_while_pending_resets_deadline() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        for ms in [0, 30, 60, 90, 120] {
            d.event(0usize, t0 + Duration::from_millis(ms));
        }
        assert_eq!(d.next_deadline(), Some(t0 + Duration::from_millis(220)));
        assert!(d.fire(t0 + Duration::from_millis(200)).is_empty());
        assert_eq!(d.fire(t0 + Duration::from_millis(220)), vec![0]);
        // A quiet period produces nothing further
        assert!(d.fire(t0 + Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn test_keys_are_independent() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.event(2usize, t0);
        d.event(1usize, t0 + Duration::from_millis(50));

        assert_eq!(d.next_deadline(), Some(t0 + WINDOW));
        assert_eq!(d.fire(t0 + WINDOW), vec![2]);
        assert_eq!(
            d.state(&1),
            TimerState::Pending {
                deadline: t0 + Duration::from_millis(150)
            }
        );
        d.event(2usize, t0 + Duration::from_millis(120));
        assert_eq!(d.fire(t0 + Duration::from_millis(300)), vec![1, 2]);
    }

    #[test]
    fn test_cancel_all() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.event("a", t0);
        d.event("b", t0);
        d.cancel_all();
        assert!(d.is_idle());
        assert_eq!(d.next_deadline(), None);
        assert!(d.fire(t0 + WINDOW).is_empty());
    }
}
