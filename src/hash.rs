use std::fmt::{self, Debug, Display, Formatter};
use std::hash::{Hash, Hasher};

use siphasher::sip128::{Hasher128, SipHasher13};

/// Produce a 128-bit fingerprint of a value.
#[inline]
pub fn hash<T: Hash + ?Sized>(value: &T) -> Fingerprint {
    let mut state = SipHasher13::new();
    value.hash(&mut state);
    Fingerprint(state.finish128().as_u128())
}

/// A deterministic 128-bit digest of everything a computation depends on.
///
/// Two evaluations with equal fingerprints must produce equal values. The
/// fingerprint of an output plug is built by its node's `hash` method through
/// an [`Accumulator`].
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Fingerprint(u128);

impl Fingerprint {
    /// The raw 128-bit value.
    pub const fn as_u128(self) -> u128 {
        self.0
    }

    /// Combine fingerprints independently of their order.
    ///
    /// Only for nodes whose result is genuinely commutative in the combined
    /// inputs. Everything else must append in order.
    pub fn unordered<I>(fingerprints: I) -> Self
    where
        I: IntoIterator<Item = Fingerprint>,
    {
        let mut count = 0u64;
        let sum = fingerprints.into_iter().fold(0u128, |acc, fp| {
            count += 1;
            acc.wrapping_add(mix(fp.0))
        });
        hash(&(sum, count))
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "Fingerprint({:032x})", self.0)
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Scrambles a fingerprint before it takes part in a commutative sum, so that
/// structured inputs (e.g. consecutive integers) don't cancel out.
#[inline]
pub(crate) fn mix(raw: u128) -> u128 {
    let lo = raw as u64;
    let hi = (raw >> 64) as u64;
    let lo = lo.wrapping_mul(0x9e37_79b9_7f4a_7c15).rotate_left(31) ^ hi;
    let hi = hi.wrapping_mul(0xc2b2_ae3d_27d4_eb4f).rotate_left(27) ^ lo;
    (u128::from(hi) << 64) | u128::from(lo)
}

/// Accumulates everything a computation depends on into a [`Fingerprint`].
///
/// Appends are order-sensitive. The accumulator also implements
/// [`std::hash::Hasher`] so that any `Hash` type can be written into it
/// directly.
#[derive(Clone)]
pub struct Accumulator {
    state: SipHasher13,
    writes: usize,
}

impl Accumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self { state: SipHasher13::new(), writes: 0 }
    }

    /// Append a hashable value.
    #[inline]
    pub fn append<T: Hash + ?Sized>(&mut self, value: &T) -> &mut Self {
        value.hash(self);
        self
    }

    /// Append another fingerprint, typically an upstream plug's.
    #[inline]
    pub fn append_fingerprint(&mut self, fingerprint: Fingerprint) -> &mut Self {
        self.write_u128(fingerprint.0);
        self
    }

    /// Append a set of fingerprints whose order must not matter.
    pub fn append_unordered<I>(&mut self, fingerprints: I) -> &mut Self
    where
        I: IntoIterator<Item = Fingerprint>,
    {
        self.append_fingerprint(Fingerprint::unordered(fingerprints))
    }

    /// How many writes went into this accumulator so far.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Finish accumulation.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(self.state.finish128().as_u128())
    }
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for Accumulator {
    #[inline]
    fn finish(&self) -> u64 {
        self.state.finish128().as_u128() as u64
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        self.writes += 1;
        self.state.write(bytes);
    }
}

impl Debug for Accumulator {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Accumulator")
            .field("writes", &self.writes)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_sensitive() {
        let mut a = Accumulator::new();
        a.append(&1u32).append(&2u32);
        let mut b = Accumulator::new();
        b.append(&2u32).append(&1u32);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_unordered() {
        let x = hash("x");
        let y = hash("y");
        let z = hash("z");
        assert_eq!(Fingerprint::unordered([x, y, z]), Fingerprint::unordered([z, x, y]));
        assert_ne!(Fingerprint::unordered([x, y]), Fingerprint::unordered([x, y, y]));
    }

    #[test]
    fn test_writes_counted() {
        let mut a = Accumulator::new();
        assert_eq!(a.writes(), 0);
        a.append(&"plug");
        assert!(a.writes() > 0);
    }
}
