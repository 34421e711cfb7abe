use sha2::{Digest, Sha256};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Bloom filter parameters as they arrive in an existence filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilterParams {
    pub bitmap: Vec<u8>,
    /// Unused bits at the end of the bitmap, in `0..8`.
    pub padding: i32,
    pub hash_count: i32,
}

/// Membership test over the document names the backend considers unchanged
/// for a target. False positives are possible, false negatives are not.
#[derive(Clone, Debug)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> FirestoreResult<Self> {
        if !(0..8).contains(&padding) {
            return Err(invalid_argument(format!("Invalid bloom filter padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(invalid_argument(format!(
                "Invalid bloom filter hash count: {hash_count}"
            )));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument("Bloom filter with bits needs a positive hash count"));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(invalid_argument(format!(
                "Empty bloom filter cannot have padding {padding}"
            )));
        }

        let bit_count = bitmap.len() as u64 * 8 - padding as u64;
        Ok(Self {
            bitmap,
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    pub fn from_params(params: &BloomFilterParams) -> FirestoreResult<Self> {
        Self::new(params.bitmap.clone(), params.padding, params.hash_count)
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (h1, h2) = hash_pair(value);
        (0..self.hash_count).all(|index| self.is_bit_set(self.bit_index(h1, h2, index)))
    }

    fn bit_index(&self, h1: u64, h2: u64, index: u32) -> u64 {
        h1.wrapping_add(h2.wrapping_mul(u64::from(index))) % self.bit_count
    }

    fn is_bit_set(&self, index: u64) -> bool {
        let byte = self.bitmap[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }

    #[cfg(test)]
    pub(crate) fn insert(&mut self, value: &str) {
        let (h1, h2) = hash_pair(value);
        for index in 0..self.hash_count {
            let bit = self.bit_index(h1, h2, index);
            self.bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    #[cfg(test)]
    pub(crate) fn to_params(&self) -> BloomFilterParams {
        let padding = (self.bitmap.len() as u64 * 8 - self.bit_count) as i32;
        BloomFilterParams {
            bitmap: self.bitmap.clone(),
            padding,
            hash_count: self.hash_count as i32,
        }
    }
}

/// Two 64-bit little-endian hashes from the first 16 bytes of the SHA-256
/// digest of `value`.
fn hash_pair(value: &str) -> (u64, u64) {
    let digest = Sha256::digest(value.as_bytes());
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    second.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAME: &str = "projects/p/databases/(default)/documents/rooms/a";

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(Vec::new(), 0, 0).unwrap();
        assert_eq!(filter.bit_count(), 0);
        assert!(!filter.might_contain(NAME));
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert!(BloomFilter::new(vec![0], 8, 1).is_err());
        assert!(BloomFilter::new(vec![0], -1, 1).is_err());
        assert!(BloomFilter::new(vec![0], 0, 0).is_err());
        assert!(BloomFilter::new(Vec::new(), 1, 0).is_err());
        assert!(BloomFilter::new(vec![0], 0, -1).is_err());
    }

    #[test]
    fn inserted_values_are_contained() {
        let mut filter = BloomFilter::new(vec![0; 16], 3, 5).unwrap();
        assert_eq!(filter.bit_count(), 125);
        filter.insert(NAME);
        assert!(filter.might_contain(NAME));

        let restored = BloomFilter::from_params(&filter.to_params()).unwrap();
        assert!(restored.might_contain(NAME));
    }

    #[test]
    fn full_bitmap_contains_everything() {
        let filter = BloomFilter::new(vec![0xff; 4], 0, 3).unwrap();
        assert!(filter.might_contain(NAME));
        assert!(filter.might_contain("anything"));
    }
}
