use crate::density::Density;
use crate::factor::Factor;
use crate::storage::CachedBlock;
use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

const SHARDS: usize = 16;

struct CacheEntry {
    block: Arc<CachedBlock>,
    hits: AtomicUsize,
}

/// A shared store of log-value blocks, keyed by a fingerprint of a factor's schema and contents.
///
/// Many inference jobs build the same factor over and over (for example, one per alignment column
/// when several columns look alike). Passing a cache to
/// [`Factorize::with_cache`][crate::Factorize::with_cache] lets all of those results share one
/// block of storage.
///
/// The cache is safe to use from many threads at once. Entries are never replaced once
/// inserted, and the map is split into independently locked shards so an insert only blocks
/// readers of one shard. Correctness never depends on the cache: a miss just means the caller
/// keeps its own storage.
///
/// ```
/// use factor_tables::{EnumVariable, Factor, FactorCache};
///
/// let a = EnumVariable::new(0, "A", &["t", "f"]).unwrap();
/// let mut f: Factor = Factor::new(&[a]).unwrap();
/// f.set_probability(&[0], 0.25).unwrap();
/// f.set_probability(&[1], 0.75).unwrap();
///
/// let cache = FactorCache::new();
/// let first = f.share(&cache);
/// let second = f.share(&cache);
/// assert_eq!(cache.len(), 1);
/// assert_eq!(cache.hits(FactorCache::fingerprint(&f)), Some(1));
/// assert_eq!(first.storage().name(), "cached");
/// assert_eq!(second.value(1).unwrap(), f.value(1).unwrap());
/// ```
pub struct FactorCache {
    shards: Box<[RwLock<HashMap<u64, CacheEntry>>]>,
}

impl FactorCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        FactorCache {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, fingerprint: u64) -> &RwLock<HashMap<u64, CacheEntry>> {
        &self.shards[(fingerprint % SHARDS as u64) as usize]
    }

    /// Looks up a block, counting the access if it's present.
    pub fn get(&self, fingerprint: u64) -> Option<Arc<CachedBlock>> {
        // Entries are immutable once inserted, so a poisoned shard is still consistent.
        let shard = self
            .shard(fingerprint)
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = shard.get(&fingerprint)?;
        entry.hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(fingerprint, "factor cache hit");
        Some(entry.block.clone())
    }

    /// Inserts a block unless one is already present under this fingerprint, and returns
    /// whichever block ends up in the cache.
    pub fn put(&self, fingerprint: u64, block: Arc<CachedBlock>) -> Arc<CachedBlock> {
        let mut shard = self
            .shard(fingerprint)
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match shard.entry(fingerprint) {
            Entry::Occupied(entry) => entry.get().block.clone(),
            Entry::Vacant(entry) => {
                tracing::debug!(fingerprint, cells = block.len(), "factor cached");
                entry
                    .insert(CacheEntry {
                        block,
                        hits: AtomicUsize::new(0),
                    })
                    .block
                    .clone()
            }
        }
    }

    /// Returns how many times [`get`][FactorCache::get] found this fingerprint.
    pub fn hits(&self, fingerprint: u64) -> Option<usize> {
        let shard = self
            .shard(fingerprint)
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        shard
            .get(&fingerprint)
            .map(|entry| entry.hits.load(Ordering::Relaxed))
    }

    /// The number of cached blocks.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    /// Returns `true` if nothing has been cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hashes a factor's enumerable variables, their domain sizes, and every non-zero cell.
    ///
    /// Dense and sparse factors with the same schema and the same cells have the same
    /// fingerprint.
    pub fn fingerprint<D: Density>(factor: &Factor<D>) -> u64 {
        let mut hasher = DefaultHasher::new();
        for variable in factor.enum_vars() {
            variable.canonical_index().hash(&mut hasher);
            variable.size().hash(&mut hasher);
        }
        let mut cells: Vec<_> = factor.cells().collect();
        cells.sort_unstable_by_key(|&(index, _)| index);
        for (index, value) in cells {
            index.hash(&mut hasher);
            value.to_bits().hash(&mut hasher);
        }
        hasher.finish()
    }
}

impl Default for FactorCache {
    fn default() -> Self {
        FactorCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EnumVariable, Mixture};
    use std::thread;

    fn block() -> Arc<CachedBlock> {
        let a = EnumVariable::new(0, "A", &["t", "f"]).unwrap();
        let f: Factor<Mixture> = Factor::new(&[a]).unwrap();
        Arc::new(CachedBlock::from_storage(f.storage()))
    }

    #[test]
    fn first_writer_wins() {
        let cache = FactorCache::new();
        let a = block();
        let b = block();
        assert!(Arc::ptr_eq(&cache.put(7, a.clone()), &a));
        assert!(Arc::ptr_eq(&cache.put(7, b), &a));
        assert_eq!(cache.hits(7), Some(0));
        assert!(cache.get(8).is_none());
        assert!(Arc::ptr_eq(&cache.get(7).unwrap(), &a));
        assert_eq!(cache.hits(7), Some(1));
    }

    #[test]
    fn concurrent_puts_keep_every_entry() {
        let cache = Arc::new(FactorCache::new());
        let shared = block();
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let cache = cache.clone();
                let shared = shared.clone();
                thread::spawn(move || {
                    for i in 0..100u64 {
                        cache.put(t * 1000 + i, shared.clone());
                        cache.put(i, shared.clone());
                        assert!(cache.get(t * 1000 + i).is_some());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        // 8 threads * 100 private keys, where thread 0's overlap with the 100 shared keys.
        assert_eq!(cache.len(), 800);
    }
}
