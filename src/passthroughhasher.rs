use std::collections::HashMap;
use std::hash::{BuildHasher, Hasher};

/// Hash map for keys that are already uniformly distributed 128-bit digests.
pub(crate) type PassthroughHashMap<Key, Value> = HashMap<Key, Value, BuildPassthroughHasher>;

#[derive(Copy, Clone, Default)]
pub(crate) struct BuildPassthroughHasher;

/// Reuses a written `u128` as the hash value instead of hashing it again.
#[derive(Default)]
pub(crate) struct PassthroughHasher {
    value: u64,
}

impl Hasher for PassthroughHasher {
    #[inline(always)]
    fn finish(&self) -> u64 {
        self.value
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        // Only reached for keys that don't write a single digest.
        for &byte in bytes {
            self.value = (self.value.rotate_left(5) ^ u64::from(byte))
                .wrapping_mul(0x51_7c_c1_b7_27_22_0a_95);
        }
    }

    #[inline]
    fn write_u128(&mut self, i: u128) {
        self.value ^= (i as u64) ^ ((i >> 64) as u64);
    }
}

impl BuildHasher for BuildPassthroughHasher {
    type Hasher = PassthroughHasher;

    #[inline]
    fn build_hasher(&self) -> PassthroughHasher {
        PassthroughHasher::default()
    }
}
