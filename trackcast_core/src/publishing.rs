//! Location publishing reliability layer.
//!
//! Per trackable and per channel (raw, enhanced):
//!
//! ```text
//!   update ──► pending? ──yes──► waiting (FIFO)
//!                 │no
//!                 ▼
//!             publish ──ok──► unmark, drain next waiting
//!                 │fail
//!                 ▼
//!        retries left? ──yes──► publish again
//!                 │no
//!                 ▼
//!        skipped buffer (sorted by time, bounded), drain next waiting
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use trackcast_env::Location;

/// Single-flight, retry and FIFO-waiting state for one location channel.
pub struct LocationsPublishingState<T> {
    /// Trackables with a publish attempt outstanding
    pending: HashSet<String>,

    /// Retries already spent on the outstanding attempt
    retry_counter: HashMap<String, u32>,

    /// Updates that arrived while an attempt was outstanding
    waiting: HashMap<String, VecDeque<T>>,

    max_retry_count: u32,
}

impl<T> LocationsPublishingState<T> {
    pub fn new(max_retry_count: u32) -> Self {
        Self {
            pending: HashSet::new(),
            retry_counter: HashMap::new(),
            waiting: HashMap::new(),
            max_retry_count,
        }
    }

    pub fn mark_message_as_pending(&mut self, trackable_id: &str) {
        self.pending.insert(trackable_id.to_string());
    }

    /// Ends the outstanding attempt and resets its retry counter.
    pub fn unmark_message_as_pending(&mut self, trackable_id: &str) {
        self.pending.remove(trackable_id);
        self.retry_counter.remove(trackable_id);
    }

    pub fn has_pending_message(&self, trackable_id: &str) -> bool {
        self.pending.contains(trackable_id)
    }

    pub fn should_retry_publishing(&self, trackable_id: &str) -> bool {
        self.retry_counter.get(trackable_id).copied().unwrap_or(0) < self.max_retry_count
    }

    pub fn increment_retry_count(&mut self, trackable_id: &str) {
        *self.retry_counter.entry(trackable_id.to_string()).or_insert(0) += 1;
    }

    pub fn add_to_waiting(&mut self, trackable_id: &str, update: T) {
        self.waiting
            .entry(trackable_id.to_string())
            .or_default()
            .push_back(update);
    }

    /// Pops the oldest waiting update.
    pub fn get_next_waiting(&mut self, trackable_id: &str) -> Option<T> {
        let queue = self.waiting.get_mut(trackable_id)?;
        let next = queue.pop_front();
        if queue.is_empty() {
            self.waiting.remove(trackable_id);
        }
        next
    }

    pub fn waiting_count(&self, trackable_id: &str) -> usize {
        self.waiting.get(trackable_id).map_or(0, VecDeque::len)
    }

    pub fn clear(&mut self, trackable_id: &str) {
        self.pending.remove(trackable_id);
        self.retry_counter.remove(trackable_id);
        self.waiting.remove(trackable_id);
    }

    pub fn clear_all(&mut self) {
        self.pending.clear();
        self.retry_counter.clear();
        self.waiting.clear();
    }
}

/// Undelivered locations per trackable, attached to the next successful publish.
pub struct SkippedLocations {
    locations: HashMap<String, Vec<Location>>,
    capacity: usize,
}

impl SkippedLocations {
    pub fn new(capacity: usize) -> Self {
        Self {
            locations: HashMap::new(),
            capacity,
        }
    }

    pub fn add(&mut self, trackable_id: &str, location: Location) {
        let entries = self.locations.entry(trackable_id.to_string()).or_default();
        entries.push(location);
        Self::trim(entries, self.capacity);
    }

    pub fn add_all(&mut self, trackable_id: &str, locations: impl IntoIterator<Item = Location>) {
        let entries = self.locations.entry(trackable_id.to_string()).or_default();
        entries.extend(locations);
        Self::trim(entries, self.capacity);
    }

    // Keeps the newest `capacity` entries, oldest first.
    fn trim(entries: &mut Vec<Location>, capacity: usize) {
        if entries.len() > capacity {
            entries.sort_by_key(|location| location.time);
            let excess = entries.len() - capacity;
            entries.drain(..excess);
        }
    }

    /// Buffered locations in timestamp order.
    pub fn to_list(&self, trackable_id: &str) -> Vec<Location> {
        let mut list = self.locations.get(trackable_id).cloned().unwrap_or_default();
        list.sort_by_key(|location| location.time);
        list
    }

    pub fn len(&self, trackable_id: &str) -> usize {
        self.locations.get(trackable_id).map_or(0, Vec::len)
    }

    pub fn clear(&mut self, trackable_id: &str) {
        self.locations.remove(trackable_id);
    }

    pub fn clear_all(&mut self) {
        self.locations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at(time: i64) -> Location {
        Location::new(0.0, 0.0, time)
    }

    #[test]
    fn test_single_retry_allowance() {
        let mut state = LocationsPublishingState::<u32>::new(1);
        state.mark_message_as_pending("T2");
        assert!(state.has_pending_message("T2"));
        assert!(state.should_retry_publishing("T2"));

        state.increment_retry_count("T2");
        assert!(!state.should_retry_publishing("T2"));

        state.unmark_message_as_pending("T2");
        assert!(!state.has_pending_message("T2"));
        assert!(state.should_retry_publishing("T2"));
    }

    #[test]
    fn test_waiting_updates_drain_fifo() {
        let mut state = LocationsPublishingState::new(1);
        state.mark_message_as_pending("T1");
        state.add_to_waiting("T1", 1);
        state.add_to_waiting("T1", 2);
        state.add_to_waiting("T2", 9);

        assert_eq!(state.waiting_count("T1"), 2);
        assert_eq!(state.get_next_waiting("T1"), Some(1));
        assert_eq!(state.get_next_waiting("T1"), Some(2));
        assert_eq!(state.get_next_waiting("T1"), None);
        assert_eq!(state.get_next_waiting("T2"), Some(9));
    }

    #[test]
    fn test_clear_resets_one_trackable() {
        let mut state = LocationsPublishingState::new(1);
        state.mark_message_as_pending("T1");
        state.mark_message_as_pending("T2");
        state.add_to_waiting("T1", 1);

        state.clear("T1");
        assert!(!state.has_pending_message("T1"));
        assert_eq!(state.waiting_count("T1"), 0);
        assert!(state.has_pending_message("T2"));

        state.clear_all();
        assert!(!state.has_pending_message("T2"));
    }

    #[test]
    fn test_skipped_locations_evict_oldest() {
        let mut skipped = SkippedLocations::new(3);
        for time in [40, 10, 30, 20] {
            skipped.add("T1", at(time));
        }

        let times: Vec<i64> = skipped.to_list("T1").iter().map(|l| l.time).collect();
        assert_eq!(times, vec![20, 30, 40]);
        assert_eq!(skipped.len("T2"), 0);
    }

    proptest! {
        #[test]
        fn test_skipped_buffer_keeps_most_recent(times in proptest::collection::vec(0i64..1_000_000, 0..200)) {
            let mut skipped = SkippedLocations::new(60);
            for (i, time) in times.iter().enumerate() {
                skipped.add("T1", at(*time));
                prop_assert!(skipped.len("T1") <= 60);
                prop_assert_eq!(skipped.len("T1"), (i + 1).min(60));
            }

            let mut expected = times.clone();
            expected.sort();
            let keep = expected.len().saturating_sub(60);
            let expected: Vec<i64> = expected[keep..].to_vec();
            let actual: Vec<i64> = skipped.to_list("T1").iter().map(|l| l.time).collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
