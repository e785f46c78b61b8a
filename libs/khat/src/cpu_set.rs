// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// The maximum number of CPUs the translation layer can track.
pub const MAX_CPUS: usize = 256;

const WORDS: usize = MAX_CPUS / u64::BITS as usize;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CpuId(usize);

impl CpuId {
    /// # Panics
    ///
    /// Panics if `id` is not below [`MAX_CPUS`].
    #[must_use]
    pub const fn new(id: usize) -> Self {
        assert!(id < MAX_CPUS, "cpu id out of range");
        Self(id)
    }

    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[cpu #{}]", self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A set of CPUs that can be updated concurrently.
///
/// Membership changes and reads are sequentially consistent: a CPU that adds itself to a context's
/// set before loading that context's tables is guaranteed to be seen by any shootdown whose PTE
/// write came after the load.
pub struct CpuSet {
    words: [AtomicU64; WORDS],
}

impl CpuSet {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            words: [const { AtomicU64::new(0) }; WORDS],
        }
    }

    fn locate(cpu: CpuId) -> (usize, u64) {
        let bits = u64::BITS as usize;
        (cpu.get() / bits, 1 << (cpu.get() % bits))
    }

    /// Adds `cpu` to the set, returning `true` if it was not present before.
    pub fn insert(&self, cpu: CpuId) -> bool {
        let (word, mask) = Self::locate(cpu);
        self.words[word].fetch_or(mask, Ordering::SeqCst) & mask == 0
    }

    /// Removes `cpu` from the set, returning `true` if it was present.
    pub fn remove(&self, cpu: CpuId) -> bool {
        let (word, mask) = Self::locate(cpu);
        self.words[word].fetch_and(!mask, Ordering::SeqCst) & mask != 0
    }

    pub fn contains(&self, cpu: CpuId) -> bool {
        let (word, mask) = Self::locate(cpu);
        self.words[word].load(Ordering::SeqCst) & mask != 0
    }

    pub fn is_empty(&self) -> bool {
        self.words
            .iter()
            .all(|word| word.load(Ordering::SeqCst) == 0)
    }

    pub fn len(&self) -> usize {
        self.words
            .iter()
            .map(|word| word.load(Ordering::SeqCst).count_ones() as usize)
            .sum()
    }

    /// Returns an iterator over a snapshot of the members.
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.words.iter().enumerate().flat_map(|(index, word)| {
            let mut bits = word.load(Ordering::SeqCst);
            core::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(CpuId(index * u64::BITS as usize + bit))
            })
        })
    }
}

impl Default for CpuSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for CpuSet {
    fn clone(&self) -> Self {
        let set = Self::new();
        for cpu in self.iter() {
            set.insert(cpu);
        }
        set
    }
}

impl FromIterator<CpuId> for CpuSet {
    fn from_iter<T: IntoIterator<Item = CpuId>>(iter: T) -> Self {
        let set = Self::new();
        for cpu in iter {
            set.insert(cpu);
        }
        set
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_remove() {
        let set = CpuSet::new();
        assert!(set.is_empty());

        assert!(set.insert(CpuId::new(3)));
        assert!(!set.insert(CpuId::new(3)));
        assert!(set.insert(CpuId::new(200)));
        assert!(set.contains(CpuId::new(200)));
        assert_eq!(set.len(), 2);

        assert!(set.remove(CpuId::new(3)));
        assert!(!set.remove(CpuId::new(3)));
        assert_eq!(set.iter().collect::<Vec<_>>(), [CpuId::new(200)]);
    }

    #[test]
    fn iter_is_ordered() {
        let set: CpuSet = [70, 1, 64, 255].into_iter().map(CpuId::new).collect();
        let ids: Vec<_> = set.iter().map(CpuId::get).collect();
        assert_eq!(ids, [1, 64, 70, 255]);
    }
}
