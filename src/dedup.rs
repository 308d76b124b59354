use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default number of remembered sale ids.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Default protection window below the watermark (24h).
pub const DEFAULT_SAFETY_WINDOW_SECS: i64 = 86_400;

/// Bounded set of already-notified sale ids plus the watermark (timestamp of
/// the newest processed sale).
///
/// Once the set exceeds its capacity the oldest ids are evicted, but only ids
/// older than `watermark - safety_window`. Sales older than that horizon are
/// reported as seen, so an evicted id can never come back as new.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "DedupRecord", into = "DedupRecord")]
pub struct DedupStore {
    seen: HashMap<String, DateTime<Utc>>,
    by_time: BTreeSet<(DateTime<Utc>, String)>,
    watermark: Option<DateTime<Utc>>,
    capacity: usize,
    safety_window: Duration,
}

impl Default for DedupStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, Duration::seconds(DEFAULT_SAFETY_WINDOW_SECS))
    }
}

impl DedupStore {
    pub fn new(capacity: usize, safety_window: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            by_time: BTreeSet::new(),
            watermark: None,
            capacity: capacity.max(1),
            safety_window,
        }
    }

    /// Apply runtime limits to a store loaded from disk.
    pub fn configure(&mut self, capacity: usize, safety_window: Duration) {
        self.capacity = capacity.max(1);
        self.safety_window = safety_window;
        self.evict();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains_key(id)
    }

    /// Oldest timestamp still protected from eviction.
    pub fn horizon(&self) -> Option<DateTime<Utc>> {
        self.watermark.map(|w| w - self.safety_window)
    }

    /// Whether a sale must not be notified: either remembered, or older than
    /// the horizon (its id may already have been evicted).
    pub fn is_seen(&self, id: &str, sold_at: DateTime<Utc>) -> bool {
        self.contains(id) || self.horizon().is_some_and(|h| sold_at < h)
    }

    /// Remember a sale and advance the watermark. Returns `false` if it was
    /// already present.
    pub fn record(&mut self, id: &str, sold_at: DateTime<Utc>) -> bool {
        if self.seen.contains_key(id) {
            return false;
        }
        self.seen.insert(id.to_string(), sold_at);
        self.by_time.insert((sold_at, id.to_string()));
        if self.watermark.is_none_or(|w| sold_at > w) {
            self.watermark = Some(sold_at);
        }
        self.evict();
        true
    }

    fn evict(&mut self) {
        let horizon = self.horizon();
        while self.seen.len() > self.capacity {
            let Some((oldest, _)) = self.by_time.first() else {
                break;
            };
            if !horizon.is_some_and(|h| *oldest < h) {
                warn!(
                    "Dedup store holds {} ids inside the safety window (capacity {})",
                    self.seen.len(),
                    self.capacity
                );
                break;
            }
            if let Some((_, id)) = self.by_time.pop_first() {
                self.seen.remove(&id);
            }
        }
    }
}

/// On-disk layout of the dedup store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupRecord {
    #[serde(default)]
    pub seen: Vec<SeenEntry>,
    #[serde(default)]
    pub watermark: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeenEntry {
    pub id: String,
    pub at: DateTime<Utc>,
}

impl From<DedupRecord> for DedupStore {
    fn from(record: DedupRecord) -> Self {
        let mut store = DedupStore::default();
        for entry in record.seen {
            // First occurrence wins; a second timestamp would orphan an index entry.
            if store.seen.contains_key(&entry.id) {
                continue;
            }
            store.by_time.insert((entry.at, entry.id.clone()));
            store.seen.insert(entry.id, entry.at);
        }
        store.watermark = record.watermark.max(store.by_time.last().map(|(at, _)| *at));
        store
    }
}

impl From<DedupStore> for DedupRecord {
    fn from(store: DedupStore) -> Self {
        DedupRecord {
            seen: store
                .by_time
                .into_iter()
                .map(|(at, id)| SeenEntry { id, at })
                .collect(),
            watermark: store.watermark,
        }
    }
}
