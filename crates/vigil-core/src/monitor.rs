//! The monitor entry ring and its subscriber fan-out.
//!
//! Every terminal decision that reaches the wire is appended here. The ring
//! is bounded: overflow drops the oldest entries, and any subscriber whose
//! cursor pointed into the dropped range is advanced to the new front.
//! Entries are only retained while at least one subscriber is registered.
//!
//! Entry ids grow monotonically for the lifetime of the hub; the front id is
//! `next_id - len`, so "has this cursor been overrun" is a single compare.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, warn};

use crate::types::MonitorEntry;

/// Default bound on retained entries.
pub const DEFAULT_CAPACITY: usize = 1024;

/// A subscriber's fetch state.
#[derive(Debug, Clone)]
struct Subscriber {
    /// Id of the first entry not yet delivered.
    cursor: u64,
    /// How many entries one fetch should deliver.
    buffer_size: usize,
}

/// Bounded decision-audit ring with per-subscriber cursors.
#[derive(Debug)]
pub struct MonitorHub {
    entries: VecDeque<MonitorEntry>,
    /// Id the next appended entry will get.
    next_id: u64,
    capacity: usize,
    subscribers: BTreeMap<u64, Subscriber>,
}

impl MonitorHub {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 0,
            capacity: capacity.max(1),
            subscribers: BTreeMap::new(),
        }
    }

    /// Id of the oldest retained entry.
    fn front_id(&self) -> u64 {
        self.next_id - self.entries.len() as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Append an entry. Dropped outright when nobody is subscribed; evicts
    /// the oldest entry (advancing overrun cursors) when the ring is full.
    pub fn append(&mut self, entry: MonitorEntry) {
        if self.subscribers.is_empty() {
            return;
        }
        self.entries.push_back(entry);
        self.next_id += 1;
        if self.entries.len() > self.capacity {
            self.entries.pop_front();
            let front = self.front_id();
            for subscriber in self.subscribers.values_mut() {
                if subscriber.cursor < front {
                    warn!(cursor = subscriber.cursor, front, "monitor subscriber overrun");
                    subscriber.cursor = front;
                }
            }
        }
    }

    /// Register a subscriber. It sees only entries appended from now on.
    /// Re-subscribing replaces the buffer size but keeps the cursor.
    pub fn subscribe(&mut self, subscriber_id: u64, buffer_size: usize) {
        let buffer_size = buffer_size.max(1);
        match self.subscribers.get_mut(&subscriber_id) {
            Some(existing) => existing.buffer_size = buffer_size,
            None => {
                self.subscribers.insert(
                    subscriber_id,
                    Subscriber {
                        cursor: self.next_id,
                        buffer_size,
                    },
                );
                debug!(subscriber_id, buffer_size, "monitor subscriber added");
            }
        }
    }

    /// Whether a normal (unforced) fetch would deliver right now.
    #[must_use]
    pub fn is_filled(&self, subscriber_id: u64) -> bool {
        self.subscribers
            .get(&subscriber_id)
            .is_some_and(|s| self.accumulated(s) >= s.buffer_size)
    }

    fn accumulated(&self, subscriber: &Subscriber) -> usize {
        (self.next_id - subscriber.cursor.max(self.front_id())) as usize
    }

    /// Deliver entries to a subscriber.
    ///
    /// Unforced: returns `None` until `buffer_size` entries have accumulated
    /// since the cursor; the subscriber stays registered. Forced: returns
    /// whatever has accumulated (possibly empty). Either way a delivery
    /// advances the cursor past the returned entries.
    pub fn fetch(&mut self, subscriber_id: u64, force: bool) -> Option<Vec<MonitorEntry>> {
        let subscriber = self.subscribers.get(&subscriber_id)?.clone();
        let available = self.accumulated(&subscriber);
        if !force && available < subscriber.buffer_size {
            return None;
        }

        let count = available.min(subscriber.buffer_size);
        let start_id = subscriber.cursor.max(self.front_id());
        let offset = (start_id - self.front_id()) as usize;
        let fetched: Vec<MonitorEntry> = self
            .entries
            .iter()
            .skip(offset)
            .take(count)
            .cloned()
            .collect();

        if let Some(subscriber) = self.subscribers.get_mut(&subscriber_id) {
            subscriber.cursor = start_id + fetched.len() as u64;
        }
        self.shrink_front();
        Some(fetched)
    }

    /// Deliver everything accumulated and drop the subscriber.
    pub fn flush(&mut self, subscriber_id: u64) -> Option<Vec<MonitorEntry>> {
        let fetched = self.fetch(subscriber_id, true);
        self.unsubscribe(subscriber_id);
        fetched
    }

    /// Remove a subscriber, releasing entries nobody waits for.
    pub fn unsubscribe(&mut self, subscriber_id: u64) {
        if self.subscribers.remove(&subscriber_id).is_some() {
            debug!(subscriber_id, "monitor subscriber removed");
        }
        self.shrink_front();
    }

    /// Drop entries already delivered to every subscriber; clear the ring
    /// entirely when the last subscriber leaves.
    fn shrink_front(&mut self) {
        if self.subscribers.is_empty() {
            self.entries.clear();
            return;
        }
        let lowest = self
            .subscribers
            .values()
            .map(|s| s.cursor)
            .min()
            .unwrap_or(self.next_id);
        while self.front_id() < lowest && !self.entries.is_empty() {
            self.entries.pop_front();
        }
    }
}

impl Default for MonitorHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::types::{PolicyKey, PolicyType, Timestamp};

    fn entry(n: i64) -> MonitorEntry {
        MonitorEntry::new(
            PolicyKey::new("client", "user", format!("priv-{n}")).unwrap(),
            PolicyType::DENY,
            Timestamp { sec: n, nsec: 0 },
        )
    }

    #[test]
    fn entries_without_subscribers_are_dropped() {
        let mut hub = MonitorHub::new(8);
        hub.append(entry(1));
        assert!(hub.is_empty());
    }

    #[test]
    fn subscriber_sees_only_future_entries() {
        let mut hub = MonitorHub::new(8);
        hub.subscribe(1, 2);
        hub.append(entry(1));
        hub.subscribe(2, 1);
        hub.append(entry(2));

        let got = hub.fetch(2, false).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].timestamp.sec, 2);
    }

    #[test]
    fn unforced_fetch_waits_for_buffer_size() {
        let mut hub = MonitorHub::new(8);
        hub.subscribe(1, 3);
        hub.append(entry(1));
        hub.append(entry(2));
        assert!(hub.fetch(1, false).is_none());
        assert!(!hub.is_filled(1));

        hub.append(entry(3));
        assert!(hub.is_filled(1));
        let got = hub.fetch(1, false).unwrap();
        assert_eq!(got.len(), 3);
        // Subscriber stays registered and continues from its cursor.
        hub.append(entry(4));
        let got = hub.fetch(1, true).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].timestamp.sec, 4);
    }

    #[test]
    fn forced_fetch_returns_partial() {
        let mut hub = MonitorHub::new(8);
        hub.subscribe(1, 10);
        hub.append(entry(1));
        let got = hub.fetch(1, true).unwrap();
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn flush_unsubscribes() {
        let mut hub = MonitorHub::new(8);
        hub.subscribe(1, 10);
        hub.append(entry(1));
        let got = hub.flush(1).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(hub.subscriber_count(), 0);
        assert!(hub.is_empty());
    }

    #[test]
    fn overflow_advances_overrun_cursors_to_front() {
        let mut hub = MonitorHub::new(3);
        hub.subscribe(1, 100);
        for n in 0..10 {
            hub.append(entry(n));
        }
        let got = hub.fetch(1, true).unwrap();
        // Only the ring's current contents are observable, and they are the
        // newest three.
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].timestamp.sec, 7);
        assert_eq!(got[2].timestamp.sec, 9);
    }

    #[test]
    fn slow_subscriber_never_sees_evicted_entries() {
        let mut hub = MonitorHub::new(4);
        hub.subscribe(1, 2);
        hub.subscribe(2, 100);
        for n in 0..20 {
            hub.append(entry(n));
        }
        let fast = hub.fetch(1, false).unwrap();
        assert_eq!(fast.len(), 2);
        assert!(fast[0].timestamp.sec >= 16);
    }

    #[test]
    fn delivered_entries_are_released_once_everyone_has_them() {
        let mut hub = MonitorHub::new(100);
        hub.subscribe(1, 1);
        hub.subscribe(2, 1);
        hub.append(entry(1));
        hub.fetch(1, false).unwrap();
        // Subscriber 2 still waits on entry 1.
        assert!(!hub.is_empty());
        hub.fetch(2, false).unwrap();
        assert!(hub.is_empty());
    }
}
