//! Insertion-ordered associative container.
//!
//! Every index of the engine (listener index,
//! listener sets, callback sets, registries)
//! must iterate in insertion order, and must
//! keep that order while entries come and go.
//! `HashMap` gives no such guarantee, so the
//! order is made explicit here.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

/// Insertion-ordered map.
///
/// Entries live in a slot vector in insertion
/// order, and a hash index maps every key to its
/// slot. Removing an entry leaves a cavity in the
/// slot vector; cavities are compacted away once
/// they outnumber the live entries. Compaction
/// shifts entries down without reordering them.
#[derive(Debug, Clone)]
pub struct OrderedMap<K, V>
where
    K: Hash + Eq + Clone,
{
    slots: Vec<Option<(K, V)>>,
    index: HashMap<K, usize>,
}

impl<K, V> Default for OrderedMap<K, V>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<K, V> OrderedMap<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.contains_key(key)
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = *self.index.get(key)?;
        self.slots[slot].as_ref().map(|(_, v)| v)
    }

    /// Insert or replace the value under `key`.
    ///
    /// A replaced entry keeps its original
    /// position, so re-inserting never reorders.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if let Some(&slot) = self.index.get(&key) {
            let entry = self.slots[slot].as_mut()?;
            return Some(std::mem::replace(&mut entry.1, value));
        }
        self.index.insert(key.clone(), self.slots.len());
        self.slots.push(Some((key, value)));
        None
    }

    /// Return the value under `key`, inserting the
    /// result of `make` at the end if absent.
    pub fn get_or_insert_with<F>(&mut self, key: K, make: F) -> &mut V
    where
        F: FnOnce() -> V,
    {
        let slot = match self.index.get(&key) {
            Some(&slot) => slot,
            None => {
                let slot = self.slots.len();
                self.slots.push(Some((key.clone(), make())));
                self.index.insert(key, slot);
                slot
            }
        };
        // XXX: the index only ever points at
        // occupied slots, see remove/compact.
        let (_, value) = self.slots[slot]
            .as_mut()
            .expect("indexed slot must be occupied");
        value
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self.index.remove(key)?;
        let (_, value) = self.slots[slot].take()?;
        self.compact();
        Some(value)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slots.iter().flatten().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, v)| v)
    }

    fn compact(&mut self) {
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
        if self.slots.len() <= self.index.len() * 2 {
            return;
        }
        self.slots.retain(Option::is_some);
        for (slot, entry) in self.slots.iter().enumerate() {
            if let Some((key, _)) = entry {
                self.index.insert(key.clone(), slot);
            }
        }
        if self.slots.capacity() >= self.slots.len() * 2 {
            self.slots.shrink_to_fit();
        }
    }
}

impl<K, V> IntoIterator for OrderedMap<K, V>
where
    K: Hash + Eq + Clone,
{
    type Item = (K, V);
    type IntoIter = std::iter::Flatten<std::vec::IntoIter<Option<(K, V)>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.slots.into_iter().flatten()
    }
}
