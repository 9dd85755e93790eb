//! Process-wide tag name registry, independent of the NVTable handle
//! namespace (tags are boolean flags a message carries, not name-value
//! pairs).

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use smallvec::SmallVec;

struct Inner {
    names: Vec<Arc<str>>,
    by_name: HashMap<Arc<str>, u32>,
}

use std::sync::Arc;

pub struct TagRegistry {
    inner: RwLock<Inner>,
}

impl TagRegistry {
    fn new() -> Self {
        TagRegistry {
            inner: RwLock::new(Inner {
                names: Vec::new(),
                by_name: HashMap::new(),
            }),
        }
    }

    pub fn get_by_name(&self, name: &str) -> u32 {
        if let Some(id) = self.inner.read().unwrap().by_name.get(name) {
            return *id;
        }
        let mut guard = self.inner.write().unwrap();
        if let Some(id) = guard.by_name.get(name) {
            return *id;
        }
        let id = guard.names.len() as u32;
        let owned: Arc<str> = Arc::from(name);
        guard.names.push(owned.clone());
        guard.by_name.insert(owned, id);
        id
    }

    pub fn get_by_id(&self, id: u32) -> Option<Arc<str>> {
        self.inner.read().unwrap().names.get(id as usize).cloned()
    }
}

static GLOBAL: OnceLock<TagRegistry> = OnceLock::new();

pub fn global() -> &'static TagRegistry {
    GLOBAL.get_or_init(TagRegistry::new)
}

/// A compact set of tag ids. Inline for the common case (a handful of tags
/// per message) before spilling to a heap-allocated bitset, mirroring the
/// message struct's `num_tags` plus an inline-or-heap bitset described in
/// the data model.
#[derive(Debug, Clone, Default)]
pub struct TagSet {
    bits: SmallVec<[u64; 2]>,
}

impl TagSet {
    pub fn new() -> Self {
        TagSet::default()
    }

    fn word_index(id: u32) -> (usize, u64) {
        ((id / 64) as usize, 1u64 << (id % 64))
    }

    pub fn set(&mut self, id: u32) {
        let (word, mask) = Self::word_index(id);
        if self.bits.len() <= word {
            self.bits.resize(word + 1, 0);
        }
        self.bits[word] |= mask;
    }

    pub fn clear(&mut self, id: u32) {
        let (word, mask) = Self::word_index(id);
        if let Some(w) = self.bits.get_mut(word) {
            *w &= !mask;
        }
    }

    pub fn is_set(&self, id: u32) -> bool {
        let (word, mask) = Self::word_index(id);
        self.bits.get(word).map(|w| w & mask != 0).unwrap_or(false)
    }

    pub fn foreach<F: FnMut(u32)>(&self, mut f: F) {
        for (word_idx, word) in self.bits.iter().enumerate() {
            let mut remaining = *word;
            while remaining != 0 {
                let bit = remaining.trailing_zeros();
                f(word_idx as u32 * 64 + bit);
                remaining &= remaining - 1;
            }
        }
    }

    pub fn print(&self, registry: &TagRegistry, out: &mut String) {
        let mut first = true;
        self.foreach(|id| {
            if !first {
                out.push(',');
            }
            first = false;
            if let Some(name) = registry.get_by_id(id) {
                out.push_str(&name);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_roundtrip_through_ids() {
        let reg = TagRegistry::new();
        let a = reg.get_by_name(".source.network");
        let b = reg.get_by_name(".source.network");
        assert_eq!(a, b);
        assert_eq!(&*reg.get_by_id(a).unwrap(), ".source.network");
    }

    #[test]
    fn tag_set_spans_multiple_words() {
        let mut set = TagSet::new();
        set.set(3);
        set.set(130);
        assert!(set.is_set(3));
        assert!(set.is_set(130));
        assert!(!set.is_set(4));
        set.clear(3);
        assert!(!set.is_set(3));
    }
}
