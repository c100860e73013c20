pub mod bloom_filter;

pub use bloom_filter::BloomFilterPolicy;

use crate::comparator::Comparator;
use crate::db::key_types::extract_user_key;
use std::borrow::Cow;
use std::sync::Arc;

/// Builds small summaries of a set of keys that can answer "is this key
/// possibly in the set". Used to skip table blocks on point lookups.
pub trait FilterPolicy: Send + Sync {
    /// Name persisted in every table built with this policy. A table whose
    /// filter was built under another name has its filter ignored.
    fn name(&self) -> &'static str;

    /// Append a filter that summarizes `keys` to `dst`.
    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>);

    /// Must return true if `key` was in the list passed to `create_filter`.
    /// May return true or false otherwise, but should aim for false.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

/// Adapts a user-key policy to tables, whose keys are internal keys.
/// User keys are passed through `Comparator::filter_key` so that keys the
/// comparator treats as equal share one filter entry.
#[derive(Clone)]
pub struct InternalFilterPolicy {
    user_policy: Arc<dyn FilterPolicy>,
    user_comparator: Arc<dyn Comparator>,
}

impl InternalFilterPolicy {
    pub fn new(
        user_policy: Arc<dyn FilterPolicy>,
        user_comparator: Arc<dyn Comparator>,
    ) -> InternalFilterPolicy {
        InternalFilterPolicy {
            user_policy,
            user_comparator,
        }
    }
}

impl FilterPolicy for InternalFilterPolicy {
    fn name(&self) -> &'static str {
        self.user_policy.name()
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
        let folded: Vec<Cow<[u8]>> = keys
            .iter()
            .map(|k| self.user_comparator.filter_key(extract_user_key(k)))
            .collect();
        let user_keys: Vec<&[u8]> = folded.iter().map(|k| k.as_ref()).collect();
        self.user_policy.create_filter(&user_keys, dst);
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        let user_key = self.user_comparator.filter_key(extract_user_key(key));
        self.user_policy.key_may_match(&user_key, filter)
    }
}

#[cfg(test)]
mod tests {
    use crate::comparator::CaseInsensitiveComparator;
    use crate::db::key_types::{InternalKey, ValueType};
    use crate::filter::{BloomFilterPolicy, FilterPolicy, InternalFilterPolicy};
    use std::sync::Arc;

    #[test]
    fn test_case_variants_share_filter_entry() {
        let policy = InternalFilterPolicy::new(
            Arc::new(BloomFilterPolicy::new(10)),
            Arc::new(CaseInsensitiveComparator),
        );
        let stored = InternalKey::new(b"Foo", 7, ValueType::Value);
        let mut filter = vec![];
        policy.create_filter(&[stored.encode()], &mut filter);

        for variant in [&b"foo"[..], b"FOO", b"Foo"] {
            let lookup = InternalKey::new(variant, 100, ValueType::Value);
            assert!(policy.key_may_match(lookup.encode(), &filter), "{:?}", variant);
        }
    }
}
