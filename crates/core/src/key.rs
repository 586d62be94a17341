//! Row identities.
//!
//! A [`Key`] is the stable identity of a row. Keys are either assigned by the
//! connector that produced the row, or derived from row content with seeded
//! XXH64, whose output is fixed by the algorithm rather than by a crate version.
//! The same content maps to the same identity in every process and every build,
//! which replay and recovery depend on.

use crate::value::Value;
use core::fmt;
use core::hash::{Hash, Hasher};
use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

const KEY_SEED: u64 = 0x5152_4950_504c_4531;

/// Stable identity of a row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(pub u64);

impl Key {
    /// Derives an identity from a slice of values.
    pub fn for_values(values: &[Value]) -> Self {
        Key(hash_one(&("values", values)))
    }

    /// Derives an identity from a single value.
    pub fn for_value(value: &Value) -> Self {
        Self::for_values(core::slice::from_ref(value))
    }

    /// Derives the identity of a row produced from two parent rows.
    pub fn pair(left: Key, right: Key) -> Self {
        Key(hash_one(&("pair", left.0, right.0)))
    }

    /// Derives the identity of the `index`-th row produced from a parent row.
    pub fn child(parent: Key, index: usize) -> Self {
        Key(hash_one(&("child", parent.0, index as u64)))
    }

    /// Identity of an outer join row padding the left row `left`.
    pub fn left_unmatched(left: Key) -> Self {
        Key(hash_one(&("left_unmatched", left.0)))
    }

    /// Identity of an outer join row padding the right row `right`.
    pub fn right_unmatched(right: Key) -> Self {
        Key(hash_one(&("right_unmatched", right.0)))
    }

    /// Returns the raw identity value.
    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }
}

fn hash_one<T: Hash + ?Sized>(value: &T) -> u64 {
    stable_hash(KEY_SEED, value)
}

/// Hashes `value` with seeded XXH64. The result only depends on the seed and the
/// bytes `value` feeds to the hasher.
pub fn stable_hash<T: Hash + ?Sized>(seed: u64, value: &T) -> u64 {
    let mut hasher = XxHash64::with_seed(seed);
    value.hash(&mut hasher);
    hasher.finish()
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "^{:016X}", self.0)
    }
}

impl From<u64> for Key {
    fn from(v: u64) -> Self {
        Key(v)
    }
}
