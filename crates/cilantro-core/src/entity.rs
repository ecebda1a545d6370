use serde::{Deserialize, Serialize};

/// Typed `u32` index into an [`IdMap`].
pub trait EntityId: Copy + Eq + std::hash::Hash + std::fmt::Debug {
    fn from_index(index: u32) -> Self;
    fn index(self) -> u32;
}

/// Define a typed id (a newtype over `u32`).
///
/// ```ignore
/// define_id!(TypeId);
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident) => {
        #[derive(
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Debug,
            serde::Serialize,
            serde::Deserialize,
        )]
        pub struct $name(u32);

        impl $crate::entity::EntityId for $name {
            fn from_index(index: u32) -> Self {
                Self(index)
            }
            fn index(self) -> u32 {
                self.0
            }
        }
    };
}

/// Append-only arena keyed by a typed id. Serializes as a plain `Vec<V>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdMap<K: EntityId, V> {
    elems: Vec<V>,
    #[serde(skip)]
    _phantom: std::marker::PhantomData<K>,
}

impl<K: EntityId, V> Default for IdMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: EntityId, V> IdMap<K, V> {
    pub fn new() -> Self {
        Self {
            elems: Vec::new(),
            _phantom: std::marker::PhantomData,
        }
    }

    pub fn push(&mut self, value: V) -> K {
        let key = K::from_index(self.elems.len() as u32);
        self.elems.push(value);
        key
    }

    pub fn get(&self, key: K) -> Option<&V> {
        self.elems.get(key.index() as usize)
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = K> {
        (0..self.elems.len() as u32).map(K::from_index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.elems
            .iter()
            .enumerate()
            .map(|(i, v)| (K::from_index(i as u32), v))
    }
}

impl<K: EntityId, V> std::ops::Index<K> for IdMap<K, V> {
    type Output = V;
    fn index(&self, key: K) -> &V {
        &self.elems[key.index() as usize]
    }
}

impl<K: EntityId, V> std::ops::IndexMut<K> for IdMap<K, V> {
    fn index_mut(&mut self, key: K) -> &mut V {
        &mut self.elems[key.index() as usize]
    }
}

impl<K: EntityId, V> FromIterator<V> for IdMap<K, V> {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        Self {
            elems: iter.into_iter().collect(),
            _phantom: std::marker::PhantomData,
        }
    }
}

/// Sparse sidecar storage keyed by a typed id; entries may be absent.
#[derive(Debug, Clone)]
pub struct SparseMap<K: EntityId, V> {
    elems: Vec<Option<V>>,
    _phantom: std::marker::PhantomData<K>,
}

impl<K: EntityId, V> Default for SparseMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: EntityId, V> SparseMap<K, V> {
    pub fn new() -> Self {
        Self {
            elems: Vec::new(),
            _phantom: std::marker::PhantomData,
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        let idx = key.index() as usize;
        if idx >= self.elems.len() {
            self.elems.resize_with(idx + 1, || None);
        }
        self.elems[idx] = Some(value);
    }

    pub fn get(&self, key: K) -> Option<&V> {
        self.elems
            .get(key.index() as usize)
            .and_then(|v| v.as_ref())
    }

    pub fn contains_key(&self, key: K) -> bool {
        self.get(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    define_id!(TestId);

    #[test]
    fn test_idmap_push_and_index() {
        let mut map: IdMap<TestId, &str> = IdMap::new();
        let a = map.push("a");
        let b = map.push("b");
        assert_ne!(a, b);
        assert_eq!(map[a], "a");
        assert_eq!(map[b], "b");
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_sparse_map_absent() {
        let mut map: SparseMap<TestId, u32> = SparseMap::new();
        let k = TestId::from_index(5);
        assert!(map.get(k).is_none());
        map.insert(k, 9);
        assert_eq!(map.get(k), Some(&9));
        assert!(!map.contains_key(TestId::from_index(4)));
    }
}
