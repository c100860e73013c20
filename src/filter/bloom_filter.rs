use crate::filter::FilterPolicy;
use crate::hash::hash;

const SEED: u32 = 0xbc9f1d34;

#[inline]
fn bloom_hash(key: &[u8]) -> u32 {
    hash(key, SEED)
}

/// Bloom filter policy. The filter is a bit array followed by one byte
/// holding the number of probes.
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    /// number of probes per key, ~= ln(2) * bits_per_key
    k: usize,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> BloomFilterPolicy {
        let k = ((bits_per_key as f64) * std::f64::consts::LN_2).round() as usize;
        BloomFilterPolicy {
            bits_per_key,
            k: k.clamp(1, 30),
        }
    }

    /// Compute bloom filter size (in both bits and bytes)
    /// For small n, we can see a very high false positive rate.  Fix it
    /// by enforcing a minimum bloom filter length.
    #[inline]
    fn calc_bytes(&self, num_keys: usize) -> usize {
        let bits = (num_keys * self.bits_per_key).max(64);
        (bits + 7) / 8
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "leveldb.BuiltinBloomFilter2"
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
        let bytes = self.calc_bytes(keys.len());
        let bits = (bytes * 8) as u32;

        let init_size = dst.len();
        dst.resize(init_size + bytes, 0);
        // Remember # of probes in filter
        dst.push(self.k as u8);
        let array = &mut dst[init_size..init_size + bytes];
        for key in keys {
            // Use double-hashing to generate a sequence of hash values.
            let mut h = bloom_hash(key);
            let delta = h.rotate_right(17);
            for _ in 0..self.k {
                let bit_pos = h % bits;
                array[(bit_pos / 8) as usize] |= 1 << (bit_pos % 8);
                h = h.wrapping_add(delta);
            }
        }
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        let len = filter.len();
        if len < 2 {
            return false;
        }

        let array = &filter[..len - 1];
        let bits = (array.len() * 8) as u32;

        // Use the encoded k so that we can read filters generated by
        // bloom filters created using different parameters.
        let k = filter[len - 1];
        if k > 30 {
            // Reserved for potentially new encodings for short bloom filters.
            // Consider it a match.
            return true;
        }

        let mut h = bloom_hash(key);
        let delta = h.rotate_right(17);
        for _ in 0..k {
            let bit_pos = h % bits;
            if (array[(bit_pos / 8) as usize] & (1 << (bit_pos % 8))) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::filter::bloom_filter::BloomFilterPolicy;
    use crate::filter::FilterPolicy;

    struct Harness {
        policy: BloomFilterPolicy,
        keys: Vec<Vec<u8>>,
        filter: Vec<u8>,
    }

    impl Harness {
        fn new() -> Harness {
            Harness {
                policy: BloomFilterPolicy::new(10),
                keys: vec![],
                filter: vec![],
            }
        }

        fn add(&mut self, key: &[u8]) {
            self.keys.push(key.to_vec());
        }

        fn build(&mut self) {
            let keys: Vec<&[u8]> = self.keys.iter().map(|k| k.as_slice()).collect();
            self.filter.clear();
            self.policy.create_filter(&keys, &mut self.filter);
            self.keys.clear();
        }

        fn matches(&mut self, key: &[u8]) -> bool {
            if !self.keys.is_empty() {
                self.build();
            }
            self.policy.key_may_match(key, &self.filter)
        }

        fn false_positive_rate(&mut self) -> f64 {
            let mut result = 0;
            for i in 0..10000u32 {
                if self.matches(&(i + 1000000000).to_le_bytes()) {
                    result += 1;
                }
            }
            result as f64 / 10000.0
        }
    }

    fn next_length(length: usize) -> usize {
        if length < 10 {
            length + 1
        } else if length < 100 {
            length + 10
        } else if length < 1000 {
            length + 100
        } else {
            length + 1000
        }
    }

    #[test]
    fn test_empty_filter() {
        let mut h = Harness::new();
        assert!(!h.matches(b"hello"));
        assert!(!h.matches(b"world"));
    }

    #[test]
    fn test_small() {
        let mut h = Harness::new();
        h.add(b"hello");
        h.add(b"world");
        assert!(h.matches(b"hello"));
        assert!(h.matches(b"world"));
        assert!(!h.matches(b"x"));
        assert!(!h.matches(b"foo"));
    }

    #[test]
    fn test_varying_lengths() {
        // Count number of filters that significantly exceed the false positive rate
        let mut mediocre_filters = 0;
        let mut good_filters = 0;

        let mut length = 1;
        while length <= 10000 {
            let mut h = Harness::new();
            for i in 0..length as u32 {
                h.add(&i.to_le_bytes());
            }
            h.build();
            assert!(h.filter.len() <= (length * 10 / 8) + 40, "{}", length);

            // All added keys must match
            for i in 0..length as u32 {
                assert!(h.matches(&i.to_le_bytes()), "length {}; key {}", length, i);
            }

            // Check false positive rate
            let rate = h.false_positive_rate();
            assert!(rate <= 0.02, "rate {} at length {}", rate, length);
            if rate > 0.0125 {
                mediocre_filters += 1;
            } else {
                good_filters += 1;
            }
            length = next_length(length);
        }
        assert!(mediocre_filters <= good_filters / 5);
    }

    #[test]
    fn test_random_keys() {
        let mut rng = rand::thread_rng();
        let mut h = Harness::new();
        let rand_keys = rand::seq::index::sample(&mut rng, usize::MAX, 20000);
        for i in 0..10000 {
            h.add(&rand_keys.index(i).to_le_bytes());
        }
        h.build();
        for i in 0..10000 {
            assert!(h.matches(&rand_keys.index(i).to_le_bytes()));
        }
        let mut false_pos_count = 0;
        for i in 10000..20000 {
            if h.matches(&rand_keys.index(i).to_le_bytes()) {
                false_pos_count += 1;
            }
        }
        assert!(
            false_pos_count < 200,
            "false positive rate: {}/10000",
            false_pos_count
        );
    }
}
