//! Result cache
//!
//! Completed detector results keyed by [`JobFingerprint`], held for a TTL.
//! Each take has its own lock so unrelated takes never contend. Every entry
//! stores a content hash; content supplied later that hashes differently
//! invalidates the entry instead of letting it be served stale.

use crate::error::{DetectorError, Result};
use crate::models::result::results_hash;
use crate::models::{DetectionResult, JobFingerprint};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry {
    results: Arc<Vec<DetectionResult>>,
    content_hash: String,
    stored_at: Instant,
}

#[derive(Debug, Default)]
struct TakeCache {
    entries: HashMap<JobFingerprint, CacheEntry>,
}

impl TakeCache {
    fn purge_expired(&mut self, ttl: Duration, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| now.duration_since(entry.stored_at) < ttl);
        before - self.entries.len()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.stored_at)
            .map(|(fingerprint, _)| fingerprint.clone());
        if let Some(fingerprint) = oldest {
            self.entries.remove(&fingerprint);
        }
    }
}

/// Cache counters and size
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub takes: usize,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub invalidations: u64,
}

/// Per-take TTL cache of detector results
#[derive(Debug)]
pub struct ResultCache {
    ttl: Duration,
    max_entries_per_take: usize,
    takes: RwLock<HashMap<i64, Arc<Mutex<TakeCache>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    invalidations: AtomicU64,
}

impl ResultCache {
    pub fn new(ttl: Duration, max_entries_per_take: usize) -> Self {
        Self {
            ttl,
            max_entries_per_take: max_entries_per_take.max(1),
            takes: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    async fn take(&self, take_id: i64) -> Option<Arc<Mutex<TakeCache>>> {
        self.takes.read().await.get(&take_id).cloned()
    }

    async fn take_or_insert(&self, take_id: i64) -> Arc<Mutex<TakeCache>> {
        if let Some(existing) = self.take(take_id).await {
            return existing;
        }
        let mut takes = self.takes.write().await;
        Arc::clone(takes.entry(take_id).or_default())
    }

    /// Cached results, if present and fresh
    pub async fn get(&self, fingerprint: &JobFingerprint) -> Option<Arc<Vec<DetectionResult>>> {
        let Some(take) = self.take(fingerprint.current_take_id).await else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let mut take = take.lock().await;
        let found = match take.entries.get(fingerprint) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(Arc::clone(&entry.results)),
            Some(_) => {
                take.entries.remove(fingerprint);
                self.expired.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => None,
        };
        match &found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Store results for `fingerprint`, replacing any previous entry
    pub async fn put(&self, fingerprint: JobFingerprint, results: Vec<DetectionResult>) {
        let take = self.take_or_insert(fingerprint.current_take_id).await;
        let mut take = take.lock().await;
        let now = Instant::now();

        let purged = take.purge_expired(self.ttl, now);
        self.expired.fetch_add(purged as u64, Ordering::Relaxed);
        if !take.entries.contains_key(&fingerprint) && take.entries.len() >= self.max_entries_per_take {
            take.evict_oldest();
        }

        let content_hash = results_hash(&results);
        take.entries.insert(
            fingerprint,
            CacheEntry {
                results: Arc::new(results),
                content_hash,
                stored_at: now,
            },
        );
    }

    /// Compare `supplied` against the cached entry
    ///
    /// A mismatch invalidates the entry and returns
    /// [`DetectorError::CacheInconsistency`]. A missing entry is not an error.
    pub async fn verify(&self, fingerprint: &JobFingerprint, supplied: &[DetectionResult]) -> Result<()> {
        let Some(take) = self.take(fingerprint.current_take_id).await else {
            return Ok(());
        };
        let mut take = take.lock().await;
        let Some(entry) = take.entries.get(fingerprint) else {
            return Ok(());
        };

        let supplied_hash = results_hash(supplied);
        if entry.content_hash == supplied_hash {
            return Ok(());
        }
        let cached = entry.content_hash.clone();
        take.entries.remove(fingerprint);
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!(fingerprint = %fingerprint, "Cache entry invalidated on content mismatch");
        Err(DetectorError::CacheInconsistency {
            fingerprint: fingerprint.to_string(),
            cached: short_hash(&cached),
            supplied: short_hash(&supplied_hash),
        })
    }

    /// [`verify`](Self::verify) for several fingerprints; returns how many
    /// entries were invalidated
    pub async fn reconcile(&self, current: &HashMap<JobFingerprint, Vec<DetectionResult>>) -> usize {
        let mut invalidated = 0;
        for (fingerprint, results) in current {
            if self.verify(fingerprint, results).await.is_err() {
                invalidated += 1;
            }
        }
        invalidated
    }

    pub async fn invalidate(&self, fingerprint: &JobFingerprint) -> bool {
        let Some(take) = self.take(fingerprint.current_take_id).await else {
            return false;
        };
        let removed = take.lock().await.entries.remove(fingerprint).is_some();
        if removed {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drop entries of one detector, or everything; returns entries removed
    pub async fn clear(&self, detector: Option<&str>) -> usize {
        let mut takes = self.takes.write().await;
        let mut removed = 0;
        match detector {
            None => {
                for take in takes.values() {
                    removed += take.lock().await.entries.len();
                }
                takes.clear();
            }
            Some(name) => {
                for take in takes.values() {
                    let mut take = take.lock().await;
                    let before = take.entries.len();
                    take.entries.retain(|fingerprint, _| fingerprint.detector_name != name);
                    removed += before - take.entries.len();
                }
                let mut empty = Vec::new();
                for (take_id, take) in takes.iter() {
                    if take.lock().await.entries.is_empty() {
                        empty.push(*take_id);
                    }
                }
                for take_id in empty {
                    takes.remove(&take_id);
                }
            }
        }
        removed
    }

    pub async fn stats(&self) -> CacheStats {
        let takes = self.takes.read().await;
        let mut entries = 0;
        for take in takes.values() {
            entries += take.lock().await.entries.len();
        }
        CacheStats {
            takes: takes.len(),
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

fn short_hash(hash: &str) -> String {
    hash.chars().take(12).collect()
}
