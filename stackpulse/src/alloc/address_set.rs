// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/* Alignment makes the low address bits carry no information */
const LOWER_BITS_IGNORED: u32 = 4;

const BITS_PER_WORD: usize = 64;

/// Default capacity in bits; one bit tracks one address.
pub const DEFAULT_BITSET_BITS: usize = 8 * 1024 * 1024;

/// Lock-free set of allocation addresses. Each address folds down to
/// one bit of a fixed atomic word array, so membership updates are a
/// single fetch_or/fetch_and and never allocate or block. Collisions
/// lose track of one address; live-allocation accounting tolerates
/// that kind of desync.
pub struct AddressBitset {
    words: Box<[AtomicU64]>,
    bits_mask: u32,
    count: AtomicI64,
}

impl AddressBitset {
    pub fn new(
        bitset_bits: usize) -> Self {
        let bitset_bits = bitset_bits
            .next_power_of_two()
            .max(BITS_PER_WORD);

        let word_count = bitset_bits / BITS_PER_WORD;

        let mut words = Vec::with_capacity(word_count);
        words.resize_with(word_count, || AtomicU64::new(0));

        Self {
            words: words.into_boxed_slice(),
            bits_mask: (bitset_bits - 1) as u32,
            count: AtomicI64::new(0),
        }
    }

    /// Folds an address onto its bit position: drop the alignment
    /// bits, xor the halves, mask to the bitset width.
    fn significant_bits(
        &self,
        addr: u64) -> u32 {
        let intermediate = addr >> LOWER_BITS_IGNORED;
        let high = (intermediate >> 32) as u32;
        let low = intermediate as u32;

        (high ^ low) & self.bits_mask
    }

    /// Returns true when the address was inserted; false means the
    /// bit was already set (the address itself or a collision).
    pub fn add(
        &self,
        addr: u64) -> bool {
        let bits = self.significant_bits(addr);
        let index = bits as usize / BITS_PER_WORD;
        let bit = 1u64 << (bits as usize % BITS_PER_WORD);

        if self.words[index].fetch_or(bit, Ordering::AcqRel) & bit == 0 {
            self.count.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        false
    }

    /// Returns true when the address was tracked and is now removed.
    pub fn remove(
        &self,
        addr: u64) -> bool {
        let bits = self.significant_bits(addr);
        let index = bits as usize / BITS_PER_WORD;
        let bit = 1u64 << (bits as usize % BITS_PER_WORD);

        if self.words[index].fetch_and(!bit, Ordering::AcqRel) & bit != 0 {
            /* A concurrent clear can briefly push the count negative;
             * count desyncs are acceptable */
            self.count.fetch_sub(1, Ordering::Relaxed);
            return true;
        }

        false
    }

    pub fn clear(&self) {
        for word in self.words.iter() {
            let original = word.swap(0, Ordering::AcqRel);
            let set_bits = original.count_ones() as i64;

            if set_bits > 0 {
                self.count.fetch_sub(set_bits, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed).max(0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove() {
        let set = AddressBitset::new(4096);

        assert!(set.add(0xDEAD0));
        assert_eq!(1, set.count());

        /* Same address is a collision with itself */
        assert!(!set.add(0xDEAD0));
        assert_eq!(1, set.count());

        assert!(set.remove(0xDEAD0));
        assert_eq!(0, set.count());

        /* Gone means gone */
        assert!(!set.remove(0xDEAD0));
        assert_eq!(0, set.count());
    }

    #[test]
    fn untracked_address_is_not_removed() {
        let set = AddressBitset::new(4096);

        set.add(0x1000);

        assert!(!set.remove(0x8000));
        assert_eq!(1, set.count());
    }

    #[test]
    fn clear_resets_count() {
        let set = AddressBitset::new(4096);

        for i in 0..64u64 {
            set.add(0x10000 + i * 16);
        }

        assert!(set.count() > 0);

        set.clear();

        assert_eq!(0, set.count());
        assert!(set.add(0x10000));
    }

    #[test]
    fn distinct_addresses_accumulate() {
        let set = AddressBitset::new(1024 * 1024);

        let mut inserted = 0;

        for i in 0..1000u64 {
            if set.add(0x7F00_0000_0000 + i * 32) {
                inserted += 1;
            }
        }

        /* A sparse bitset keeps collisions rare */
        assert!(inserted >= 990, "only {} inserted", inserted);
        assert_eq!(inserted, set.count());
    }

    #[test]
    fn concurrent_adds_and_removes() {
        use std::sync::Arc;

        let set = Arc::new(AddressBitset::new(1024 * 1024));
        let mut handles = Vec::new();

        for t in 0..4u64 {
            let set = set.clone();

            handles.push(std::thread::spawn(move || {
                for i in 0..512u64 {
                    let addr = 0x1000_0000 + (t * 512 + i) * 16;

                    set.add(addr);
                    set.remove(addr);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(0, set.count());
    }
}
