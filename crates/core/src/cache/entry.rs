//! Memory-tier entries, TTL priority and eviction ranking.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Relative importance of a cached result. Scales the entry's TTL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// High doubles the TTL, low halves it.
    pub fn scale(self, ttl: Duration) -> Duration {
        match self {
            Priority::Low => ttl / 2,
            Priority::Normal => ttl,
            Priority::High => ttl.saturating_mul(2),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub(crate) key: String,
    pub(crate) value: Arc<[u8]>,
    pub(crate) value_type: String,
    pub(crate) created_at: Instant,
    pub(crate) ttl: Duration,
    pub(crate) hit_count: u64,
    pub(crate) last_accessed: Instant,
    pub(crate) compute_time_ms: u64,
    pub(crate) size_bytes: usize,
    pub(crate) tags: Vec<String>,
}

impl CacheEntry {
    pub(crate) fn new(
        key: String, value: Arc<[u8]>, value_type: String, ttl: Duration, compute_time_ms: u64, tags: Vec<String>,
    ) -> Self {
        let now = Instant::now();
        let size_bytes = key.len() + value.len() + tags.iter().map(String::len).sum::<usize>();
        Self {
            key,
            value,
            value_type,
            created_at: now,
            ttl,
            hit_count: 0,
            last_accessed: now,
            compute_time_ms,
            size_bytes,
            tags,
        }
    }

    /// Expired strictly after `created_at + ttl`.
    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        match self.created_at.checked_add(self.ttl) {
            Some(deadline) => now > deadline,
            None => false,
        }
    }

    /// Retention value: entries that are hit often and were expensive to
    /// compute rank highest.
    pub(crate) fn score(&self) -> f64 {
        self.hit_count as f64 * (self.compute_time_ms as f64 + 1.0).ln()
    }

    pub(crate) fn matches(&self, pattern: Option<&Regex>, tags: &[String]) -> bool {
        pattern.is_some_and(|re| re.is_match(&self.key)) || self.tags.iter().any(|t| tags.contains(t))
    }
}

/// Keyed entries plus the running byte total.
#[derive(Debug, Default)]
pub(crate) struct CacheIndex {
    pub(crate) entries: HashMap<String, CacheEntry>,
    pub(crate) memory_bytes: usize,
}

impl CacheIndex {
    pub(crate) fn insert(&mut self, entry: CacheEntry) {
        self.memory_bytes += entry.size_bytes;
        if let Some(old) = self.entries.insert(entry.key.clone(), entry) {
            self.memory_bytes -= old.size_bytes;
        }
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.memory_bytes -= entry.size_bytes;
        Some(entry)
    }

    /// Remove every entry `keep` rejects. Returns how many were removed.
    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&CacheEntry) -> bool) -> usize {
        let before = self.entries.len();
        let mut freed = 0;
        self.entries.retain(|_, entry| {
            let kept = keep(entry);
            if !kept {
                freed += entry.size_bytes;
            }
            kept
        });
        self.memory_bytes -= freed;
        before - self.entries.len()
    }

    pub(crate) fn purge_expired(&mut self, now: Instant) -> usize {
        self.retain(|entry| !entry.is_expired(now))
    }

    pub(crate) fn over_limit(&self, incoming_bytes: usize, max_entries: usize, max_bytes: usize) -> bool {
        self.entries.len() + 1 > max_entries || self.memory_bytes + incoming_bytes > max_bytes
    }
}

fn rank(a: &CacheEntry, b: &CacheEntry) -> Ordering {
    a.score().total_cmp(&b.score()).then_with(|| a.last_accessed.cmp(&b.last_accessed))
}

/// Keys to evict so that one more entry of `incoming_bytes` fits.
///
/// Lowest score goes first, oldest access breaking ties. A pass removes at
/// least a tenth of the entries (and at least one), more if the limits need it.
pub(crate) fn select_victims(
    index: &CacheIndex, incoming_bytes: usize, max_entries: usize, max_bytes: usize,
) -> Vec<String> {
    if !index.over_limit(incoming_bytes, max_entries, max_bytes) {
        return Vec::new();
    }

    let len = index.entries.len();
    let count_needed = (len + 1).saturating_sub(max_entries);
    let bytes_needed = (index.memory_bytes + incoming_bytes).saturating_sub(max_bytes);
    let min_count = len.div_ceil(10).max(1).max(count_needed);

    let mut ranked: Vec<&CacheEntry> = index.entries.values().collect();
    ranked.sort_by(|a, b| rank(a, b));

    let mut victims = Vec::new();
    let mut freed = 0;
    for entry in ranked {
        if victims.len() >= min_count && freed >= bytes_needed {
            break;
        }
        freed += entry.size_bytes;
        victims.push(entry.key.clone());
    }
    victims
}
