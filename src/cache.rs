//! Content-addressed, TTL-bounded annotation cache with single-flight
//! computation per key.
//!
//! The cache is an explicit store object passed into workers, never
//! ambient state. The in-flight marker is just an entry in the store; the
//! lock is scoped strictly to the check-and-insert of that marker.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::schema::{Annotation, ContextSummary};
use crate::util::{now_epoch_ms, sha256_hex};

/// Failed computations are cached briefly so repeated lookups don't
/// hammer a provider that is already known to be failing.
pub const FAILURE_TTL_SECONDS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    MissComputed,
    MissFailed,
    ExpiredRefreshed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Annotation,
    pub created_at_epoch_ms: u64,
    pub ttl_seconds: u64,
}

impl CacheEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.created_at_epoch_ms + self.ttl_seconds * 1000 <= now_ms
    }
}

/// Deterministic cache key: any change to included content, provider,
/// model, or prompt template version changes the key.
pub fn cache_key(
    provider_identity: &str,
    model_identity: &str,
    prompt_template_version: &str,
    context_summary: &ContextSummary,
    file_hashes: &[(String, String)],
) -> String {
    let summary_hash = sha256_hex(
        serde_json::to_vec(context_summary)
            .unwrap_or_default()
            .as_slice(),
    );
    let mut material = String::new();
    material.push_str(provider_identity);
    material.push('\n');
    material.push_str(model_identity);
    material.push('\n');
    material.push_str(prompt_template_version);
    material.push('\n');
    material.push_str(&summary_hash);
    for (path, hash) in file_hashes {
        material.push('\n');
        material.push_str(path);
        material.push('=');
        material.push_str(hash);
    }
    sha256_hex(material.as_bytes())
}

enum Slot {
    InFlight,
    Ready(CacheEntry),
}

pub struct AnnotationCache {
    slots: Mutex<HashMap<String, Slot>>,
    ready: Condvar,
    disk_dir: Option<PathBuf>,
}

impl AnnotationCache {
    pub fn new() -> Self {
        AnnotationCache {
            slots: Mutex::new(HashMap::new()),
            ready: Condvar::new(),
            disk_dir: None,
        }
    }

    /// Cache that also persists entries under `dir`, one JSON file per
    /// key, so annotations survive across runs.
    pub fn with_disk_dir(dir: &Path) -> Self {
        AnnotationCache {
            slots: Mutex::new(HashMap::new()),
            ready: Condvar::new(),
            disk_dir: Some(dir.to_path_buf()),
        }
    }

    /// Look up `key`, computing at most once across concurrent callers.
    ///
    /// `compute` returns the annotation with any provider failure already
    /// folded into `Annotation.error`; failures are cached with the
    /// shorter failure TTL. Expired entries are treated as absent for
    /// lookup but left in place for `sweep`.
    pub fn get_or_compute(
        &self,
        key: &str,
        ttl_seconds: u64,
        compute: impl FnOnce() -> Annotation,
    ) -> (Annotation, CacheOutcome) {
        let mut was_expired = false;
        {
            let mut slots = self.lock_slots();
            loop {
                match slots.get(key) {
                    Some(Slot::Ready(entry)) if !entry.is_expired(now_epoch_ms()) => {
                        tracing::debug!(key, "annotation cache hit");
                        return (entry.payload.clone(), CacheOutcome::Hit);
                    }
                    Some(Slot::Ready(_)) => {
                        was_expired = true;
                        break;
                    }
                    Some(Slot::InFlight) => {
                        slots = self
                            .ready
                            .wait(slots)
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                    }
                    None => {
                        if let Some(entry) = self.load_from_disk(key) {
                            if !entry.is_expired(now_epoch_ms()) {
                                let payload = entry.payload.clone();
                                slots.insert(key.to_string(), Slot::Ready(entry));
                                return (payload, CacheOutcome::Hit);
                            }
                            was_expired = true;
                        }
                        break;
                    }
                }
            }
            slots.insert(key.to_string(), Slot::InFlight);
        }

        let payload = compute();
        let failed = payload.error.is_some();
        let effective_ttl = if failed {
            ttl_seconds.min(FAILURE_TTL_SECONDS)
        } else {
            ttl_seconds
        };
        let entry = CacheEntry {
            key: key.to_string(),
            payload: payload.clone(),
            created_at_epoch_ms: now_epoch_ms(),
            ttl_seconds: effective_ttl,
        };
        self.store_to_disk(&entry);
        {
            let mut slots = self.lock_slots();
            slots.insert(key.to_string(), Slot::Ready(entry));
        }
        self.ready.notify_all();

        let outcome = if failed {
            CacheOutcome::MissFailed
        } else if was_expired {
            CacheOutcome::ExpiredRefreshed
        } else {
            CacheOutcome::MissComputed
        };
        (payload, outcome)
    }

    /// Physically remove expired entries from memory and disk. Returns
    /// the number of entries removed.
    pub fn sweep(&self) -> usize {
        let now = now_epoch_ms();
        let mut removed = 0;
        {
            let mut slots = self.lock_slots();
            slots.retain(|_, slot| match slot {
                Slot::Ready(entry) if entry.is_expired(now) => {
                    removed += 1;
                    false
                }
                _ => true,
            });
        }
        if let Some(dir) = &self.disk_dir {
            if let Ok(listing) = fs::read_dir(dir) {
                for item in listing.flatten() {
                    let path = item.path();
                    let Ok(bytes) = fs::read(&path) else {
                        continue;
                    };
                    let Ok(entry) = serde_json::from_slice::<CacheEntry>(&bytes) else {
                        continue;
                    };
                    if entry.is_expired(now) && fs::remove_file(&path).is_ok() {
                        removed += 1;
                    }
                }
            }
        }
        removed
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn entry_path(&self, key: &str) -> Option<PathBuf> {
        self.disk_dir.as_ref().map(|dir| dir.join(format!("{key}.json")))
    }

    fn load_from_disk(&self, key: &str) -> Option<CacheEntry> {
        let path = self.entry_path(key)?;
        let bytes = fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn store_to_disk(&self, entry: &CacheEntry) {
        let Some(path) = self.entry_path(&entry.key) else {
            return;
        };
        let Some(dir) = self.disk_dir.as_ref() else {
            return;
        };
        if fs::create_dir_all(dir).is_err() {
            return;
        }
        match serde_json::to_vec_pretty(entry) {
            Ok(bytes) => {
                if let Err(err) = fs::write(&path, bytes) {
                    tracing::debug!(key = entry.key.as_str(), %err, "cache persist failed");
                }
            }
            Err(err) => tracing::debug!(key = entry.key.as_str(), %err, "cache serialize failed"),
        }
    }
}

impl Default for AnnotationCache {
    fn default() -> Self {
        Self::new()
    }
}
