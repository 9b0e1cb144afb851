//! Double-hashed bloom filter. Mirrors the C++ `BloomFilter`'s `Hash`/`Hash2`
//! string hashes and its `bit_pos = (h1 + i*h2) % num_bits` probe sequence,
//! backed by `bit-vec` instead of a hand-rolled bit array.

use std::convert::TryInto;
use std::f64::consts::LN_2;

use bit_vec::BitVec;

/// `Hash()`: base-131 polynomial hash.
fn hash1(key: &[u8]) -> u64 {
    let mut h: u64 = 0;
    for &b in key {
        h = h.wrapping_mul(131).wrapping_add(b as u64);
    }
    h
}

/// `Hash2()`: base-137 polynomial hash, forced odd so it's never zero (a
/// zero second hash would collapse every probe onto the same bit).
fn hash2(key: &[u8]) -> u64 {
    let mut h: u64 = 0;
    for &b in key {
        h = h.wrapping_mul(137).wrapping_add(b as u64);
    }
    h | 1
}

fn optimal_bits_per_key(false_positive_rate: f64) -> usize {
    let bits = -(false_positive_rate.ln()) / (LN_2 * LN_2);
    bits.ceil().max(1.0) as usize
}

fn optimal_num_hash_functions(bits_per_key: usize) -> usize {
    ((bits_per_key as f64) * LN_2).round().max(1.0) as usize
}

/// A filter over an expected number of keys, sized for a target false
/// positive rate. Once built, `num_bits`/`num_hash_functions` are frozen in
/// the encoded bytes so a reopened SSTable can use it without recomputing.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits_per_key: usize,
    num_hash_functions: usize,
    bits: BitVec,
}

impl BloomFilter {
    pub fn new(expected_keys: usize, false_positive_rate: f64) -> Self {
        let bits_per_key = optimal_bits_per_key(false_positive_rate);
        let num_hash_functions = optimal_num_hash_functions(bits_per_key);
        let num_bits = (expected_keys.max(1) * bits_per_key).max(64);
        BloomFilter {
            bits_per_key,
            num_hash_functions,
            bits: BitVec::from_elem(num_bits, false),
        }
    }

    pub fn add(&mut self, key: &[u8]) {
        let h1 = hash1(key);
        let h2 = hash2(key);
        let n = self.bits.len() as u64;
        for i in 0..self.num_hash_functions as u64 {
            let pos = (h1.wrapping_add(i.wrapping_mul(h2)) % n) as usize;
            self.bits.set(pos, true);
        }
    }

    /// `false` is a definite answer (key is absent); `true` only means
    /// "maybe present" and must still be confirmed by the caller.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let h1 = hash1(key);
        let h2 = hash2(key);
        let n = self.bits.len() as u64;
        for i in 0..self.num_hash_functions as u64 {
            let pos = (h1.wrapping_add(i.wrapping_mul(h2)) % n) as usize;
            if !self.bits[pos] {
                return false;
            }
        }
        true
    }

    /// `[bits_per_key: u64][num_hash_functions: u64][num_bits: u64][bit array]`
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24 + self.bits.to_bytes().len());
        buf.extend_from_slice(&(self.bits_per_key as u64).to_be_bytes());
        buf.extend_from_slice(&(self.num_hash_functions as u64).to_be_bytes());
        buf.extend_from_slice(&(self.bits.len() as u64).to_be_bytes());
        buf.extend_from_slice(&self.bits.to_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        let bits_per_key = u64::from_be_bytes(buf[0..8].try_into().unwrap()) as usize;
        let num_hash_functions = u64::from_be_bytes(buf[8..16].try_into().unwrap()) as usize;
        let num_bits = u64::from_be_bytes(buf[16..24].try_into().unwrap()) as usize;
        let mut bits = BitVec::from_bytes(&buf[24..]);
        bits.truncate(num_bits);
        BloomFilter {
            bits_per_key,
            num_hash_functions,
            bits,
        }
    }

    pub fn encoded_len(&self) -> usize {
        24 + self.bits.to_bytes().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn added_keys_are_always_found() {
        let mut f = BloomFilter::new(1000, 0.01);
        let keys: Vec<Vec<u8>> = (0..1000u32).map(|i| i.to_be_bytes().to_vec()).collect();
        for k in &keys {
            f.add(k);
        }
        for k in &keys {
            assert!(f.may_contain(k));
        }
    }

    #[test]
    fn false_positive_rate_is_roughly_bounded() {
        let mut f = BloomFilter::new(1000, 0.01);
        for i in 0..1000u32 {
            f.add(&i.to_be_bytes());
        }
        let mut false_positives = 0;
        for i in 1000u32..11000u32 {
            if f.may_contain(&i.to_be_bytes()) {
                false_positives += 1;
            }
        }
        // generous bound so the test isn't flaky; a correct filter sized
        // for 1% should land nowhere close to this.
        assert!(false_positives < 500, "got {} false positives", false_positives);
    }

    #[test]
    fn round_trips_through_bytes() {
        let mut f = BloomFilter::new(100, 0.01);
        f.add(b"hello");
        let bytes = f.encode();
        let back = BloomFilter::decode(&bytes);
        assert!(back.may_contain(b"hello"));
        assert_eq!(back.bits.len(), f.bits.len());
    }
}
