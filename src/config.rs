/// Tunables of an [`Engine`](crate::Engine).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EngineConfig {
    /// Maximum summed memory usage of cached values, in bytes.
    pub value_cache_capacity: usize,
    /// Maximum number of cached fingerprints.
    pub hash_cache_capacity: usize,
    /// Number of independently locked parts of each cache.
    pub shards: usize,
    /// Whether cached values are occasionally checked against a fresh
    /// compute.
    pub hash_validation: HashValidation,
}

impl EngineConfig {
    pub fn with_value_cache_capacity(mut self, bytes: usize) -> Self {
        self.value_cache_capacity = bytes;
        self
    }

    pub fn with_hash_cache_capacity(mut self, entries: usize) -> Self {
        self.hash_cache_capacity = entries;
        self
    }

    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards.max(1);
        self
    }

    pub fn with_hash_validation(mut self, validation: HashValidation) -> Self {
        self.hash_validation = validation;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            value_cache_capacity: 1024 * 1024 * 1024,
            hash_cache_capacity: 128_000,
            shards: 16,
            hash_validation: HashValidation::Off,
        }
    }
}

/// Cross-checking of a node's `hash` against its `compute`.
///
/// A node whose `hash` misses something its `compute` reads produces stale
/// values that are otherwise undetectable. With `Sample(n)`, every n-th value
/// cache hit is recomputed and compared to the cached value; a difference is
/// reported as a compute failure.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum HashValidation {
    #[default]
    Off,
    Sample(u64),
}
