//! A map that shards itself once the active shard fills up.
//!
//! Graph-object key spaces routinely reach millions of entries. A single
//! `HashMap` of that size pays for every resize with a full rehash and a
//! transient doubling of memory. `BigMap` caps each underlying map at
//! `max_shard_size` keys; new keys go into the newest shard and a fresh shard
//! is allocated once it is full.
//!
//! Lookups walk shards newest to oldest. The shard count stays small relative
//! to the key count, so this is cheap in practice.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct BigMap<K, V> {
    max_shard_size: usize,
    shards: Vec<HashMap<K, V>>,
}

impl<K: Hash + Eq, V> BigMap<K, V> {
    /// Creates an empty map. A `max_shard_size` of zero is treated as one.
    pub fn new(max_shard_size: usize) -> Self {
        Self {
            max_shard_size: max_shard_size.max(1),
            shards: vec![HashMap::new()],
        }
    }

    /// Inserts a value, returning the previous value for the key if any.
    ///
    /// An existing key is updated in whichever shard holds it, so a key is
    /// never present in two shards at once.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if let Some(existing) = self.get_mut(&key) {
            return Some(std::mem::replace(existing, value));
        }

        let needs_shard = self
            .shards
            .last()
            .map_or(true, |shard| shard.len() >= self.max_shard_size);
        if needs_shard {
            self.shards.push(HashMap::new());
        }

        if let Some(shard) = self.shards.last_mut() {
            shard.insert(key, value);
        }
        None
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shards.iter().rev().find_map(|shard| shard.get(key))
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shards
            .iter_mut()
            .rev()
            .find_map(|shard| shard.get_mut(key))
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shards.iter().rev().any(|shard| shard.contains_key(key))
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shards
            .iter_mut()
            .rev()
            .find_map(|shard| shard.remove(key))
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(HashMap::is_empty)
    }

    /// Number of underlying maps allocated so far.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}
