//! Bounded, TTL-expiring cache of publishing records that failed to reach the
//! broker, deduplicated by message id.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Priority carried on an outgoing publish. Defaults to `Medium` (5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Value 5, the default when a caller omits priority.
    Medium,
    /// Any other explicit priority in `0..=9`.
    Explicit(u8),
}

impl Priority {
    /// The default priority per §4.D: `Medium`, value 5.
    pub const DEFAULT: Priority = Priority::Medium;

    /// The numeric AMQP priority value.
    pub fn value(self) -> u8 {
        match self {
            Priority::Medium => 5,
            Priority::Explicit(v) => v,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Whether the broker should persist the message to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// The broker may lose the message on restart. AMQP value 1.
    Transient,
    /// The broker writes the message to disk. AMQP value 2, the default.
    #[default]
    Persistent,
}

impl DeliveryMode {
    /// The numeric AMQP delivery-mode value.
    pub fn value(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

/// A publish that has not yet been confirmed to have reached the broker.
///
/// Equality and cache identity are both by `message_id`.
#[derive(Debug, Clone)]
pub struct PublishingRecord {
    /// Target exchange.
    pub exchange: String,
    /// Routing key.
    pub routing_key: String,
    /// Whether the broker should return the message if it cannot be routed.
    pub mandatory: bool,
    /// Whether the broker should return the message if it cannot be
    /// delivered immediately. The source never surfaces this to callers; it
    /// is always `false` unless a future options field adds it (see
    /// DESIGN.md Open Questions).
    pub immediate: bool,
    /// Already-encoded message body.
    pub body: Vec<u8>,
    /// Content-type string from the codec that produced `body`.
    pub content_type: String,
    /// Publish priority.
    pub priority: Priority,
    /// Publish delivery mode.
    pub delivery_mode: DeliveryMode,
    /// Unique identity of this publish; also the cache key.
    pub message_id: Uuid,
    /// When this record was enqueued.
    pub timestamp: DateTime<Utc>,
    /// Publish attempts left before the record is dropped as exhausted.
    pub attempts_remaining: u32,
}

/// Bounded mapping from message id to publishing record, ordered by
/// insertion, with absolute per-record expiry.
///
/// All operations are O(1) amortized except [`PublishingCache::prune`] and
/// [`PublishingCache::iter`], which are O(n). TTL is measured from insertion
/// time, not from the time of the last retry attempt.
///
/// Cache operations are not internally synchronized; the owning publisher
/// channel serializes access on its single internal work queue (§5), so no
/// lock is taken here.
pub struct PublishingCache {
    capacity: usize,
    ttl: Duration,
    order: VecDeque<Uuid>,
    records: HashMap<Uuid, (PublishingRecord, Instant)>,
}

impl PublishingCache {
    /// Creates an empty cache with the given bounds.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            order: VecDeque::new(),
            records: HashMap::new(),
        }
    }

    /// Number of records currently cached.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the cache holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Inserts or overwrites `rec` by its `message_id`. If the cache is at
    /// capacity and `rec.message_id` is not already present, the
    /// oldest-inserted entry is evicted first to make room.
    pub fn put(&mut self, rec: PublishingRecord) {
        let id = rec.message_id;
        let now = Instant::now();

        if self.records.contains_key(&id) {
            self.records.insert(id, (rec, now));
            return;
        }

        if self.capacity > 0 && self.records.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.records.remove(&oldest);
            }
        }

        self.order.push_back(id);
        self.records.insert(id, (rec, now));
    }

    /// Returns records in insertion order; newer insertions never reorder
    /// older ones still present.
    pub fn iter(&self) -> impl Iterator<Item = &PublishingRecord> + '_ {
        self.order
            .iter()
            .filter_map(move |id| self.records.get(id).map(|(rec, _)| rec))
    }

    /// Removes a record by id. Idempotent: removing an absent id is a no-op.
    pub fn remove(&mut self, id: &Uuid) {
        if self.records.remove(id).is_some() {
            if let Some(pos) = self.order.iter().position(|x| x == id) {
                self.order.remove(pos);
            }
        }
    }

    /// Removes every record whose insertion time plus TTL has elapsed as of
    /// `now`, returning the removed records (for logging by the caller).
    pub fn prune(&mut self, now: Instant) -> Vec<PublishingRecord> {
        let ttl = self.ttl;
        let expired_ids: Vec<Uuid> = self
            .records
            .iter()
            .filter(|(_, (_, inserted_at))| now.saturating_duration_since(*inserted_at) >= ttl)
            .map(|(id, _)| *id)
            .collect();

        let mut expired = Vec::with_capacity(expired_ids.len());
        for id in expired_ids {
            if let Some((rec, _)) = self.records.remove(&id) {
                expired.push(rec);
            }
            if let Some(pos) = self.order.iter().position(|x| *x == id) {
                self.order.remove(pos);
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(id: Uuid) -> PublishingRecord {
        PublishingRecord {
            exchange: "ex".into(),
            routing_key: "rk".into(),
            mandatory: false,
            immediate: false,
            body: b"hi".to_vec(),
            content_type: "text/plain".into(),
            priority: Priority::DEFAULT,
            delivery_mode: DeliveryMode::Persistent,
            message_id: id,
            timestamp: Utc::now(),
            attempts_remaining: 3,
        }
    }

    #[test]
    fn put_then_remove_then_absent() {
        let mut cache = PublishingCache::new(10, Duration::from_secs(60));
        let id = Uuid::new_v4();
        cache.put(record(id));
        assert_eq!(cache.len(), 1);
        cache.remove(&id);
        assert_eq!(cache.len(), 0);
        // idempotent
        cache.remove(&id);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn put_same_id_twice_does_not_grow_cache() {
        let mut cache = PublishingCache::new(10, Duration::from_secs(60));
        let id = Uuid::new_v4();
        cache.put(record(id));
        cache.put(record(id));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn eviction_drops_oldest_when_at_capacity() {
        let mut cache = PublishingCache::new(2, Duration::from_secs(60));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        cache.put(record(a));
        cache.put(record(b));
        cache.put(record(c));

        let ids: Vec<Uuid> = cache.iter().map(|r| r.message_id).collect();
        assert_eq!(ids, vec![b, c]);
    }

    #[test]
    fn iter_preserves_insertion_order() {
        let mut cache = PublishingCache::new(10, Duration::from_secs(60));
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            cache.put(record(*id));
        }
        let observed: Vec<Uuid> = cache.iter().map(|r| r.message_id).collect();
        assert_eq!(observed, ids);
    }

    #[test]
    fn prune_removes_only_expired_entries() {
        let mut cache = PublishingCache::new(10, Duration::from_millis(20));
        let id = Uuid::new_v4();
        cache.put(record(id));

        let not_yet = cache.prune(Instant::now());
        assert!(not_yet.is_empty());
        assert_eq!(cache.len(), 1);

        std::thread::sleep(Duration::from_millis(30));
        let expired = cache.prune(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(cache.len(), 0);
    }
}
