//! Parsed-expression caching to avoid re-parsing unchanged expression text
//!
//! A batch run evaluates the same indicator formulas across many organisation
//! units and periods, so each distinct expression text is parsed once and the
//! tree is shared from then on. Keys are the expression source itself; since
//! text is immutable there is nothing to invalidate, and the LRU bound keeps
//! long-running services from accumulating every formula ever seen.
//!
//! # Configuration
//!
//! Cache size can be configured via the `ADEX_CACHE_SIZE` environment
//! variable:
//!
//! ```bash
//! # Use a larger cache for batch analytics runs
//! export ADEX_CACHE_SIZE=5000
//! ```

use crate::ast::Expr;
use crate::error::Result;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Cache metrics for observability
///
/// Tracks cache hits, misses, and evictions to help tune cache size
/// and understand cache effectiveness.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Number of cache hits
    pub hits: AtomicU64,
    /// Number of cache misses
    pub misses: AtomicU64,
    /// Number of cache evictions (LRU)
    pub evictions: AtomicU64,
}

impl CacheMetrics {
    /// Calculate cache hit rate as a fraction (0.0 to 1.0)
    ///
    /// Returns 0.0 if no requests have been made yet.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Reset all metrics to zero
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    /// Clone the current metrics values (for reporting)
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of cache metrics at a point in time
#[derive(Debug, Clone, Copy)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheMetricsSnapshot {
    /// Calculate hit rate as a fraction (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Total number of cache requests
    pub fn total_requests(&self) -> u64 {
        self.hits + self.misses
    }
}

/// Thread-safe LRU cache of parsed expression trees
///
/// Cached trees are shared as `Arc<Expr>`, so a hit is a cheap pointer clone
/// and evaluators on several threads can hold the same tree at once.
///
/// # Example
///
/// ```
/// use adex::cache::ExpressionCache;
/// use std::sync::Arc;
///
/// let cache = ExpressionCache::new(100);
///
/// // First parse (cache miss)
/// let first = cache.get_or_parse("1 + 2", adex::parse_str).unwrap();
///
/// // Second parse (cache hit)
/// let second = cache.get_or_parse("1 + 2", adex::parse_str).unwrap();
///
/// // Both point to the same underlying tree
/// assert!(Arc::ptr_eq(&first, &second));
/// ```
#[derive(Clone)]
pub struct ExpressionCache {
    cache: Arc<Mutex<LruCache<String, Arc<Expr>>>>,
    metrics: Arc<CacheMetrics>,
    capacity: Arc<AtomicUsize>,
}

impl ExpressionCache {
    /// Create a new cache with the specified capacity
    ///
    /// # Panics
    ///
    /// Panics if capacity is 0
    pub fn new(capacity: usize) -> Self {
        let capacity_val =
            NonZeroUsize::new(capacity).expect("Cache capacity must be greater than 0");

        Self {
            cache: Arc::new(Mutex::new(LruCache::new(capacity_val))),
            metrics: Arc::new(CacheMetrics::default()),
            capacity: Arc::new(AtomicUsize::new(capacity)),
        }
    }

    /// Create a new cache with default capacity (1000 entries)
    ///
    /// Can be overridden with the `ADEX_CACHE_SIZE` environment variable
    pub fn with_default_capacity() -> Self {
        let capacity = std::env::var("ADEX_CACHE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&c| c > 0)
            .unwrap_or(1000);

        Self::new(capacity)
    }

    /// Get a cached tree or parse the expression text if not cached
    ///
    /// This is the primary method for interacting with the cache. Repeated
    /// calls with the same text return the same `Arc<Expr>` until the entry
    /// is evicted.
    pub fn get_or_parse<F>(&self, text: &str, parse_fn: F) -> Result<Arc<Expr>>
    where
        F: FnOnce(&str) -> Result<Expr>,
    {
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(cached) = cache.get(text) {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(expression = text, "expression cache hit");
                return Ok(Arc::clone(cached));
            }
        }

        // Cache miss: parse outside the lock so a slow parse does not
        // block other lookups
        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(expression = text, "expression cache miss");
        let expr = Arc::new(parse_fn(text)?);

        {
            let mut cache = self.cache.lock().unwrap();
            let old_len = cache.len();
            cache.put(text.to_string(), Arc::clone(&expr));

            if old_len == cache.cap().get() && cache.len() == cache.cap().get() {
                self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        Ok(expr)
    }

    /// Get a cached tree without parsing
    pub fn get(&self, text: &str) -> Option<Arc<Expr>> {
        let mut cache = self.cache.lock().unwrap();
        cache.get(text).cloned()
    }

    /// Clear all cached trees
    pub fn clear(&self) {
        let mut cache = self.cache.lock().unwrap();
        cache.clear();
    }

    /// Get cache metrics
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Get a snapshot of current metrics
    pub fn metrics_snapshot(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Reset cache metrics
    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Get the number of cached trees
    pub fn len(&self) -> usize {
        let cache = self.cache.lock().unwrap();
        cache.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        let cache = self.cache.lock().unwrap();
        cache.is_empty()
    }

    /// Get cache capacity
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }
}

impl Default for ExpressionCache {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_parser::parse;

    #[test]
    fn test_cache_hit_returns_the_same_tree() {
        let cache = ExpressionCache::new(10);

        let first = cache.get_or_parse("1 + 2", parse).unwrap();
        let second = cache.get_or_parse("1 + 2", parse).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_distinct_texts_are_distinct_entries() {
        let cache = ExpressionCache::new(10);

        let a = cache.get_or_parse("1 + 2", parse).unwrap();
        let b = cache.get_or_parse("1+2", parse).unwrap();

        // Keys are the raw text, so formatting variants cache separately
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_parse_errors_are_not_cached() {
        let cache = ExpressionCache::new(10);

        assert!(cache.get_or_parse("1 +", parse).is_err());
        assert!(cache.is_empty());

        // The same text still parses fresh on the next attempt
        assert!(cache.get_or_parse("1 +", parse).is_err());
        assert_eq!(cache.metrics_snapshot().misses, 2);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ExpressionCache::new(2);

        cache.get_or_parse("1", parse).unwrap();
        cache.get_or_parse("2", parse).unwrap();
        cache.get_or_parse("3", parse).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.get("1").is_none());
        assert!(cache.get("2").is_some());
        assert!(cache.get("3").is_some());
        assert_eq!(cache.metrics_snapshot().evictions, 1);
    }

    #[test]
    fn test_cache_clear() {
        let cache = ExpressionCache::new(10);
        cache.get_or_parse("1 + 2", parse).unwrap();
        assert_eq!(cache.len(), 1);

        cache.clear();

        assert_eq!(cache.len(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_capacity() {
        let cache = ExpressionCache::new(50);
        assert_eq!(cache.capacity(), 50);
    }

    #[test]
    #[should_panic(expected = "Cache capacity must be greater than 0")]
    fn test_zero_capacity_panics() {
        ExpressionCache::new(0);
    }

    #[test]
    fn test_cache_metrics_hits_and_misses() {
        let cache = ExpressionCache::new(10);

        cache.get_or_parse("1 + 2", parse).unwrap();

        let metrics = cache.metrics_snapshot();
        assert_eq!(metrics.hits, 0);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hit_rate(), 0.0);

        cache.get_or_parse("1 + 2", parse).unwrap();

        let metrics = cache.metrics_snapshot();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hit_rate(), 0.5);
        assert_eq!(metrics.total_requests(), 2);
    }

    #[test]
    fn test_cache_metrics_reset() {
        let cache = ExpressionCache::new(10);
        cache.get_or_parse("1 + 2", parse).unwrap();
        cache.get_or_parse("1 + 2", parse).unwrap();

        cache.reset_metrics();

        let metrics = cache.metrics_snapshot();
        assert_eq!(metrics.hits, 0);
        assert_eq!(metrics.misses, 0);
    }

    #[test]
    fn test_env_var_cache_size() {
        // One test covers both env states so parallel tests cannot race
        let original = std::env::var("ADEX_CACHE_SIZE").ok();

        std::env::remove_var("ADEX_CACHE_SIZE");
        assert_eq!(ExpressionCache::default().capacity(), 1000);

        std::env::set_var("ADEX_CACHE_SIZE", "500");
        assert_eq!(ExpressionCache::with_default_capacity().capacity(), 500);

        match original {
            Some(val) => std::env::set_var("ADEX_CACHE_SIZE", val),
            None => std::env::remove_var("ADEX_CACHE_SIZE"),
        }
    }
}
