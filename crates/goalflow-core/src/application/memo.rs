use crate::domain::step::Step;
use crate::Args;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::trace;

/// LRU cache of successful outputs for memoizable steps
///
/// Entries are keyed by step ID, step version and the canonical JSON of
/// the work item's inputs. `Args` is an ordered map, so equal inputs
/// always serialize identically.
pub struct MemoCache {
    // LruCache is not thread-safe; lookups are short so a std mutex suffices
    entries: Option<Mutex<LruCache<String, Args>>>,
}

impl MemoCache {
    /// A capacity of zero disables caching
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|c| Mutex::new(LruCache::new(c))),
        }
    }

    pub fn key(step: &Step, inputs: &Args) -> Option<String> {
        let inputs = serde_json::to_string(inputs).ok()?;
        Some(format!("{}@{}:{}", step.id, step.version, inputs))
    }

    pub fn get(&self, step: &Step, inputs: &Args) -> Option<Args> {
        if !step.memoizable {
            return None;
        }
        let entries = self.entries.as_ref()?;
        let key = Self::key(step, inputs)?;
        let mut cache = entries.lock().unwrap_or_else(|e| e.into_inner());
        let hit = cache.get(&key).cloned();
        if hit.is_some() {
            trace!(step_id = %step.id, "Memo cache hit");
        }
        hit
    }

    pub fn put(&self, step: &Step, inputs: &Args, outputs: &Args) {
        if !step.memoizable {
            return;
        }
        let (Some(entries), Some(key)) = (self.entries.as_ref(), Self::key(step, inputs)) else {
            return;
        };
        let mut cache = entries.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(key, outputs.clone());
    }

    pub fn len(&self) -> usize {
        self.entries
            .as_ref()
            .map(|e| e.lock().unwrap_or_else(|e| e.into_inner()).len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
