//! In-memory cache of refinement results.
//!
//! Entries are keyed by the full [`RefineRequest`] and expire after a fixed
//! TTL (one hour by default). Expired entries are dropped on lookup and
//! whenever an insert finds the cache full; past that the oldest entry goes.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use super::RefineRequest;
use crate::scheduler::task::RefinedPrompt;

const DEFAULT_TTL: Duration = Duration::from_secs(3600);
const DEFAULT_MAX_ENTRIES: usize = 1000;

#[derive(Debug, Clone)]
struct CacheEntry {
    prompt: RefinedPrompt,
    created_at: Instant,
}

/// Thread-safe TTL cache for refined prompts.
#[derive(Debug)]
pub struct RefineCache {
    ttl: Duration,
    max_entries: usize,
    entries: RwLock<HashMap<RefineRequest, CacheEntry>>,
}

impl Default for RefineCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl RefineCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_MAX_ENTRIES)
    }

    /// A cache holding at most `max_entries` prompts (at least one).
    pub fn with_capacity(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Returns a live entry for `key`, removing it if it has expired.
    pub fn get(&self, key: &RefineRequest) -> Option<RefinedPrompt> {
        {
            let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
            match entries.get(key) {
                Some(entry) if entry.created_at.elapsed() < self.ttl => {
                    return Some(entry.prompt.clone())
                }
                Some(_) => {}
                None => return None,
            }
        }

        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
        None
    }

    /// Stores `prompt`. A full cache first sheds expired entries, then its
    /// oldest entry.
    pub fn insert(&self, key: RefineRequest, prompt: RefinedPrompt) {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            retain_live(&mut entries, self.ttl);
            if entries.len() >= self.max_entries {
                evict_oldest(&mut entries);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                prompt,
                created_at: Instant::now(),
            },
        );
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        retain_live(&mut entries, self.ttl)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn retain_live(entries: &mut HashMap<RefineRequest, CacheEntry>, ttl: Duration) -> usize {
    let before = entries.len();
    entries.retain(|_, e| e.created_at.elapsed() < ttl);
    before - entries.len()
}

fn evict_oldest(entries: &mut HashMap<RefineRequest, CacheEntry>) {
    let oldest = entries
        .iter()
        .min_by_key(|(_, e)| e.created_at)
        .map(|(k, _)| k.clone());
    if let Some(key) = oldest {
        entries.remove(&key);
    }
}
