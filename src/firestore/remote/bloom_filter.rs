//! Bloom filter carried by watch existence filters.
//!
//! Membership is tested with double hashing: the first 16 bytes of the SHA-256 digest
//! of a document's resource name are read as two little-endian `u64`s `h1` and `h2`,
//! and bit `i` of `hash_count` is `(h1 + i * h2) mod bit_count` with wrapping
//! arithmetic. A filter that cannot be parsed is treated as absent, which makes the
//! caller fall back to a full target reset.

use sha2::{Digest, Sha256};

use crate::firestore::error::{invalid_argument, FirestoreResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    bit_count: u64,
    hash_count: u32,
}

impl BloomFilter {
    /// `padding` is the number of unused trailing bits in the last byte of `bitmap`.
    pub fn new(bitmap: Vec<u8>, padding: u32, hash_count: u32) -> FirestoreResult<Self> {
        if padding >= 8 {
            return Err(invalid_argument(format!("invalid bloom filter padding {padding}")));
        }
        if bitmap.is_empty() {
            if padding != 0 || hash_count != 0 {
                return Err(invalid_argument(
                    "an empty bloom filter must have zero padding and zero hashes",
                ));
            }
        } else if hash_count == 0 {
            return Err(invalid_argument("bloom filter hash count must be positive"));
        }
        let bit_count = bitmap.len() as u64 * 8 - u64::from(padding);
        Ok(Self {
            bitmap,
            bit_count,
            hash_count,
        })
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (h1, h2) = hash_pair(value);
        (0..self.hash_count).all(|i| self.is_bit_set(self.bit_index(h1, h2, i)))
    }

    /// Sets the bits for `value`.
    pub fn insert(&mut self, value: &str) {
        if self.bit_count == 0 {
            return;
        }
        let (h1, h2) = hash_pair(value);
        for i in 0..self.hash_count {
            let index = self.bit_index(h1, h2, i);
            self.bitmap[(index / 8) as usize] |= 1 << (index % 8);
        }
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add(h2.wrapping_mul(u64::from(i))) % self.bit_count
    }

    fn is_bit_set(&self, index: u64) -> bool {
        self.bitmap[(index / 8) as usize] & (1 << (index % 8)) != 0
    }
}

fn hash_pair(value: &str) -> (u64, u64) {
    let digest = Sha256::digest(value.as_bytes());
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[0..8]);
    second.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_parameters() {
        assert!(BloomFilter::new(vec![0], 8, 1).is_err());
        assert!(BloomFilter::new(vec![], 1, 0).is_err());
        assert!(BloomFilter::new(vec![0], 0, 0).is_err());
        assert!(BloomFilter::new(vec![], 0, 0).is_ok());
    }

    #[test]
    fn inserted_values_are_found() {
        let mut filter = BloomFilter::new(vec![0; 32], 3, 7).unwrap();
        assert_eq!(filter.bit_count(), 253);
        let names: Vec<String> = (0..20)
            .map(|i| format!("projects/p/databases/(default)/documents/rooms/{i}"))
            .collect();
        for name in &names {
            filter.insert(name);
        }
        assert!(names.iter().all(|name| filter.might_contain(name)));
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(vec![], 0, 0).unwrap();
        assert!(!filter.might_contain("anything"));
        let zeroed = BloomFilter::new(vec![0; 4], 0, 3).unwrap();
        assert!(!zeroed.might_contain("projects/p/databases/(default)/documents/rooms/a"));
    }
}
