//! Resolved plan caching with TTL
//!
//! Resolution and compilation read every module of the closure from disk.
//! This cache keeps the result keyed by module directory, a fingerprint of
//! the root manifest and plan files, and the compile options, so repeated
//! operations in one process (deploy then verify, status after deploy)
//! skip the walk.

use crate::compiler::{CompileOptions, MergedPlan};
use crate::resolver::Resolution;
use sqlpack_core::script_hash;
use sqlpack_plan::{MANIFEST_FILE, PLAN_FILE};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// A resolution and the merged plan compiled from it
#[derive(Debug, Clone)]
pub struct CachedPlan {
    pub resolution: Resolution,
    pub plan: MergedPlan,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Arc<CachedPlan>,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_valid(&self) -> bool {
        self.created_at.elapsed() < self.ttl
    }
}

/// Fingerprint of a module directory's manifest and plan
pub fn fingerprint(module_dir: &Path) -> std::io::Result<String> {
    let mut bytes = std::fs::read(module_dir.join(MANIFEST_FILE))?;
    bytes.push(0);
    bytes.extend(std::fs::read(module_dir.join(PLAN_FILE))?);
    Ok(script_hash(&bytes))
}

/// Resolved plan cache with TTL support
///
/// Clones share the same storage. Expired entries are evicted on access.
///
/// ## Usage
///
/// ```rust,ignore
/// let cache = ResolutionCache::new(Duration::from_secs(300));
/// let key = ResolutionCache::cache_key(dir, &fingerprint(dir)?, options);
///
/// if let Some(cached) = cache.get(&key) {
///     deploy(&cached.plan, &db, &deploy_options).await?;
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ResolutionCache {
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
    default_ttl: Duration,
}

impl ResolutionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            default_ttl: ttl,
        }
    }

    /// Format: "<dir>#<fingerprint>#<deps>/<tags-only>"
    pub fn cache_key(module_dir: &Path, fingerprint: &str, options: CompileOptions) -> String {
        format!(
            "{}#{}#{}/{}",
            module_dir.display(),
            fingerprint,
            options.include_dependency_changes,
            options.include_tags_only
        )
    }

    pub fn insert(&self, key: String, value: CachedPlan) -> Arc<CachedPlan> {
        let value = Arc::new(value);
        let entry = CacheEntry {
            value: Arc::clone(&value),
            created_at: Instant::now(),
            ttl: self.default_ttl,
        };

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(key, entry);
        }
        value
    }

    /// Cached value if present and not expired
    pub fn get(&self, key: &str) -> Option<Arc<CachedPlan>> {
        if let Ok(cache) = self.cache.read() {
            if let Some(entry) = cache.get(key) {
                if entry.is_valid() {
                    return Some(Arc::clone(&entry.value));
                }
            }
        }

        self.evict(key);
        None
    }

    pub fn evict(&self, key: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(key);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }

    /// Number of entries, including expired ones
    pub fn len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evict_expired(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.retain(|_, entry| entry.is_valid());
        }
    }

    /// (total_entries, valid_entries, expired_entries)
    pub fn stats(&self) -> (usize, usize, usize) {
        if let Ok(cache) = self.cache.read() {
            let total = cache.len();
            let valid = cache.values().filter(|e| e.is_valid()).count();
            (total, valid, total - valid)
        } else {
            (0, 0, 0)
        }
    }
}

impl Default for ResolutionCache {
    /// Five minute TTL
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}
