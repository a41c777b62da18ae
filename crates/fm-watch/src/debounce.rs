// debounce.rs — Per-project signal coalescing.
//
// Raw watcher events arrive in bursts: a single record write fires
// create + modify + rename signals, and an agent touching sidecar files
// fires more. The queue keeps one slot per project id and releases it
// only once the project has been quiet for the stability window, so
// each burst becomes one absorption.
//
// This is the explicit single-consumer queue the drain loop owns — no
// timers, no shared state, ordering auditable from the call sites.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Coalesces change signals per project id.
#[derive(Debug)]
pub struct DebounceQueue {
    window: Duration,
    last_signal: BTreeMap<String, Instant>,
}

impl DebounceQueue {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_signal: BTreeMap::new(),
        }
    }

    /// Record a signal for a project. Re-noting an id pushes its
    /// release time out — the project must go quiet to settle.
    pub fn note(&mut self, id: impl Into<String>, now: Instant) {
        self.last_signal.insert(id.into(), now);
    }

    /// Remove and return every project that has been quiet for the
    /// full window, in id order.
    pub fn drain_settled(&mut self, now: Instant) -> Vec<String> {
        let settled: Vec<String> = self
            .last_signal
            .iter()
            .filter(|(_, last)| now.duration_since(**last) >= self.window)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &settled {
            self.last_signal.remove(id);
        }
        settled
    }

    pub fn is_empty(&self) -> bool {
        self.last_signal.is_empty()
    }

    pub fn len(&self) -> usize {
        self.last_signal.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(100);

    #[test]
    fn nothing_settles_inside_the_window() {
        let mut queue = DebounceQueue::new(WINDOW);
        let start = Instant::now();

        queue.note("p1", start);
        assert!(queue.drain_settled(start + Duration::from_millis(50)).is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn a_quiet_project_settles_once() {
        let mut queue = DebounceQueue::new(WINDOW);
        let start = Instant::now();

        queue.note("p1", start);
        let settled = queue.drain_settled(start + WINDOW);
        assert_eq!(settled, vec!["p1".to_string()]);
        assert!(queue.is_empty());
    }

    #[test]
    fn rapid_signals_coalesce_into_one_release() {
        let mut queue = DebounceQueue::new(WINDOW);
        let start = Instant::now();

        for ms in [0, 20, 40, 60] {
            queue.note("p1", start + Duration::from_millis(ms));
        }

        // Quiet only since the last signal.
        assert!(queue
            .drain_settled(start + Duration::from_millis(120))
            .is_empty());
        let settled = queue.drain_settled(start + Duration::from_millis(160));
        assert_eq!(settled, vec!["p1".to_string()]);
    }

    #[test]
    fn projects_settle_independently() {
        let mut queue = DebounceQueue::new(WINDOW);
        let start = Instant::now();

        queue.note("p1", start);
        queue.note("p2", start + Duration::from_millis(80));

        let settled = queue.drain_settled(start + Duration::from_millis(110));
        assert_eq!(settled, vec!["p1".to_string()]);
        assert_eq!(queue.len(), 1);

        let settled = queue.drain_settled(start + Duration::from_millis(200));
        assert_eq!(settled, vec!["p2".to_string()]);
    }
}
