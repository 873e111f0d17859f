//! Guards that serialize trackable lifecycle operations.
//!
//! ```text
//!   add(T1) ──► start_adding ──────────────► finish_adding(result)
//!   add(T1) ──► save_duplicate_handler ─┘        │
//!                                                ▼  every saved handler
//!   remove(T1) while adding ──► mark_for_removal ──► remove_marked(result)
//! ```
//!
//! Both guards are keyed by trackable id.

use crate::callback::ResultCallback;
use crate::error::PublisherError;
use std::collections::{HashMap, HashSet};

// ============================================================================
// DUPLICATE OPERATION GUARD
// ============================================================================

/// Deduplicates concurrent "add" calls for the same trackable.
pub struct DuplicateOperationGuard<T> {
    /// Trackables with an add in flight
    adding: HashSet<String>,

    /// Callers that asked to add a trackable while it was already being added
    duplicate_handlers: HashMap<String, Vec<ResultCallback<T>>>,
}

impl<T: Clone> DuplicateOperationGuard<T> {
    pub fn new() -> Self {
        Self {
            adding: HashSet::new(),
            duplicate_handlers: HashMap::new(),
        }
    }

    pub fn start_adding(&mut self, trackable_id: &str) {
        self.adding.insert(trackable_id.to_string());
    }

    pub fn is_currently_adding(&self, trackable_id: &str) -> bool {
        self.adding.contains(trackable_id)
    }

    /// True while any add is in flight.
    pub fn is_adding_any(&self) -> bool {
        !self.adding.is_empty()
    }

    pub fn save_duplicate_handler(&mut self, trackable_id: &str, handler: ResultCallback<T>) {
        self.duplicate_handlers
            .entry(trackable_id.to_string())
            .or_default()
            .push(handler);
    }

    /// Stops treating the trackable as "adding" while keeping its saved
    /// handlers for the eventual `finish_adding`.
    pub fn stop_adding(&mut self, trackable_id: &str) {
        self.adding.remove(trackable_id);
    }

    /// Ends the add and delivers `result` to every saved duplicate handler.
    ///
    /// Handlers are drained, so repeated calls deliver nothing new.
    pub fn finish_adding(&mut self, trackable_id: &str, result: Result<T, PublisherError>) {
        self.adding.remove(trackable_id);
        if let Some(handlers) = self.duplicate_handlers.remove(trackable_id) {
            for handler in handlers {
                handler.complete(result.clone());
            }
        }
    }

    pub fn clear(&mut self, trackable_id: &str) {
        self.adding.remove(trackable_id);
        self.duplicate_handlers.remove(trackable_id);
    }

    /// Fails every waiting handler with `error` and resets the guard.
    pub fn clear_all(&mut self, error: PublisherError) {
        self.adding.clear();
        for (_, handlers) in self.duplicate_handlers.drain() {
            for handler in handlers {
                handler.complete(Err(error.clone()));
            }
        }
    }
}

impl<T: Clone> Default for DuplicateOperationGuard<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// REMOVAL GUARD
// ============================================================================

/// Defers a remove request that arrives while the trackable is being added.
#[derive(Default)]
pub struct RemovalGuard {
    marked: HashMap<String, Vec<ResultCallback<bool>>>,
}

impl RemovalGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_for_removal(&mut self, trackable_id: &str, callback: ResultCallback<bool>) {
        self.marked
            .entry(trackable_id.to_string())
            .or_default()
            .push(callback);
    }

    pub fn is_marked_for_removal(&self, trackable_id: &str) -> bool {
        self.marked.contains_key(trackable_id)
    }

    pub fn is_marked_any(&self) -> bool {
        !self.marked.is_empty()
    }

    /// Completes the pending removal callbacks and un-marks the trackable.
    pub fn remove_marked(&mut self, trackable_id: &str, result: Result<bool, PublisherError>) {
        if let Some(callbacks) = self.marked.remove(trackable_id) {
            for callback in callbacks {
                callback.complete(result.clone());
            }
        }
    }

    pub fn clear_all(&mut self, error: PublisherError) {
        for (_, callbacks) in self.marked.drain() {
            for callback in callbacks {
                callback.complete(Err(error.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::sync::oneshot::error::TryRecvError;

    #[test]
    fn test_duplicate_handlers_receive_primary_result() {
        let mut guard = DuplicateOperationGuard::<u32>::new();
        guard.start_adding("T1");
        assert!(guard.is_currently_adding("T1"));

        let (first, mut rx1) = ResultCallback::channel();
        let (second, mut rx2) = ResultCallback::channel();
        guard.save_duplicate_handler("T1", first);
        guard.save_duplicate_handler("T1", second);

        guard.finish_adding("T1", Ok(42));
        assert!(!guard.is_currently_adding("T1"));
        assert_eq!(rx1.try_recv().unwrap(), Ok(42));
        assert_eq!(rx2.try_recv().unwrap(), Ok(42));
    }

    #[test]
    fn test_stop_adding_keeps_handlers() {
        let mut guard = DuplicateOperationGuard::<u32>::new();
        guard.start_adding("T1");
        let (handler, mut rx) = ResultCallback::channel();
        guard.save_duplicate_handler("T1", handler);

        guard.stop_adding("T1");
        assert!(!guard.is_currently_adding("T1"));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        guard.finish_adding("T1", Err(PublisherError::RemoveRequested));
        assert_eq!(rx.try_recv().unwrap(), Err(PublisherError::RemoveRequested));
    }

    #[test]
    fn test_removal_guard_completes_and_unmarks() {
        let mut guard = RemovalGuard::new();
        let (callback, mut rx) = ResultCallback::channel();
        guard.mark_for_removal("T1", callback);
        assert!(guard.is_marked_for_removal("T1"));

        guard.remove_marked("T1", Ok(true));
        assert!(!guard.is_marked_for_removal("T1"));
        assert_eq!(rx.try_recv().unwrap(), Ok(true));

        // Nothing marked: no-op
        guard.remove_marked("T1", Ok(false));
    }

    #[test]
    fn test_clear_all_fails_waiting_handlers() {
        let mut guard = DuplicateOperationGuard::<u32>::new();
        guard.start_adding("T1");
        let (handler, mut rx) = ResultCallback::channel();
        guard.save_duplicate_handler("T1", handler);

        guard.clear_all(PublisherError::Stopped);
        assert!(!guard.is_adding_any());
        assert_eq!(rx.try_recv().unwrap(), Err(PublisherError::Stopped));
    }

    proptest! {
        #[test]
        fn test_finish_adding_delivers_exactly_once(handlers in 0usize..8, finishes in 1usize..5) {
            let mut guard = DuplicateOperationGuard::<u32>::new();
            guard.start_adding("T1");

            let mut receivers = Vec::new();
            for _ in 0..handlers {
                let (handler, rx) = ResultCallback::channel();
                guard.save_duplicate_handler("T1", handler);
                receivers.push(rx);
            }

            for n in 0..finishes {
                guard.finish_adding("T1", Ok(n as u32));
            }

            for mut rx in receivers {
                prop_assert_eq!(rx.try_recv().unwrap(), Ok(0));
                prop_assert!(rx.try_recv().is_err());
            }
        }
    }
}
