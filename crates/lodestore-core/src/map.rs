//! The pluggable map seam
//!
//! The store is generic over its in-memory container: any associative
//! container implementing [`KvMap`] works. `hashbrown::HashMap` is the
//! default; `std` hash and btree maps are also wired up (a btree map gives
//! key-ordered snapshots).

use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hash};

/// Minimal associative-container surface the store needs.
pub trait KvMap<K, V>: Default {
    fn insert(&mut self, key: K, value: V);
    fn remove(&mut self, key: &K) -> Option<V>;
    fn get(&self, key: &K) -> Option<&V>;
    fn get_mut(&mut self, key: &K) -> Option<&mut V>;
    fn contains_key(&self, key: &K) -> bool;
    fn clear(&mut self);
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate all entries, in whatever order the container keeps them.
    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = (&'a K, &'a V)> + 'a>
    where
        K: 'a,
        V: 'a;
}

macro_rules! hash_map_kvmap {
    ($($map:ident)::+) => {
        impl<K, V, S> KvMap<K, V> for $($map)::+<K, V, S>
        where
            K: Eq + Hash,
            S: BuildHasher + Default,
        {
            fn insert(&mut self, key: K, value: V) {
                Self::insert(self, key, value);
            }

            fn remove(&mut self, key: &K) -> Option<V> {
                Self::remove(self, key)
            }

            fn get(&self, key: &K) -> Option<&V> {
                Self::get(self, key)
            }

            fn get_mut(&mut self, key: &K) -> Option<&mut V> {
                Self::get_mut(self, key)
            }

            fn contains_key(&self, key: &K) -> bool {
                Self::contains_key(self, key)
            }

            fn clear(&mut self) {
                Self::clear(self)
            }

            fn len(&self) -> usize {
                Self::len(self)
            }

            fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = (&'a K, &'a V)> + 'a>
            where
                K: 'a,
                V: 'a,
            {
                Box::new(Self::iter(self))
            }
        }
    };
}

hash_map_kvmap!(hashbrown::HashMap);
hash_map_kvmap!(HashMap);

impl<K: Ord, V> KvMap<K, V> for BTreeMap<K, V> {
    fn insert(&mut self, key: K, value: V) {
        Self::insert(self, key, value);
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        Self::remove(self, key)
    }

    fn get(&self, key: &K) -> Option<&V> {
        Self::get(self, key)
    }

    fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        Self::get_mut(self, key)
    }

    fn contains_key(&self, key: &K) -> bool {
        Self::contains_key(self, key)
    }

    fn clear(&mut self) {
        Self::clear(self)
    }

    fn len(&self) -> usize {
        Self::len(self)
    }

    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = (&'a K, &'a V)> + 'a>
    where
        K: 'a,
        V: 'a,
    {
        Box::new(Self::iter(self))
    }
}
