//! Sharded inverted index: label (name, value) -> series bitmap

use crate::{Labels, SeriesId};
use parking_lot::RwLock;
use roaring::RoaringTreemap;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

type ValueMap = HashMap<String, RoaringTreemap>;

/// Postings lists sharded by label name
///
/// All values of one label name live in the same shard, so a lookup or a
/// value scan for that name takes exactly one shard lock.
pub struct Postings {
    shards: Vec<RwLock<HashMap<String, ValueMap>>>,
}

impl Postings {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, name: &str) -> &RwLock<HashMap<String, ValueMap>> {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        &self.shards[(hasher.finish() % self.shards.len() as u64) as usize]
    }

    /// Add `id` to the postings of every label
    pub fn insert(&self, labels: &Labels, id: SeriesId) {
        for label in labels.iter() {
            let mut shard = self.shard(&label.name).write();
            shard
                .entry(label.name.clone())
                .or_default()
                .entry(label.value.clone())
                .or_default()
                .insert(id);
        }
    }

    /// Remove `id` from the postings of every label, dropping emptied lists
    pub fn remove(&self, labels: &Labels, id: SeriesId) {
        for label in labels.iter() {
            let mut shard = self.shard(&label.name).write();
            let Some(values) = shard.get_mut(&label.name) else {
                continue;
            };
            if let Some(bitmap) = values.get_mut(&label.value) {
                bitmap.remove(id);
                if bitmap.is_empty() {
                    values.remove(&label.value);
                }
            }
            if values.is_empty() {
                shard.remove(&label.name);
            }
        }
    }

    /// Postings of a single (name, value) pair
    pub fn get(&self, name: &str, value: &str) -> RoaringTreemap {
        self.shard(name)
            .read()
            .get(name)
            .and_then(|values| values.get(value))
            .cloned()
            .unwrap_or_default()
    }

    /// Union of the postings of several values of one name
    pub fn union_of(&self, name: &str, values: &[String]) -> RoaringTreemap {
        let shard = self.shard(name).read();
        let mut out = RoaringTreemap::new();
        if let Some(map) = shard.get(name) {
            for value in values {
                if let Some(bitmap) = map.get(value) {
                    out |= bitmap;
                }
            }
        }
        out
    }

    /// Union of the postings of every value of `name` accepted by `pred`
    pub fn union_where(&self, name: &str, mut pred: impl FnMut(&str) -> bool) -> RoaringTreemap {
        let shard = self.shard(name).read();
        let mut out = RoaringTreemap::new();
        if let Some(map) = shard.get(name) {
            for (value, bitmap) in map {
                if pred(value) {
                    out |= bitmap;
                }
            }
        }
        out
    }

    /// Every series carrying label `name`
    pub fn with_name(&self, name: &str) -> RoaringTreemap {
        self.union_where(name, |_| true)
    }

    /// Sorted label names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shards
            .iter()
            .flat_map(|shard| shard.read().keys().cloned().collect::<Vec<_>>())
            .collect();
        names.sort_unstable();
        names
    }

    /// Sorted values of `name`
    pub fn values(&self, name: &str) -> Vec<String> {
        let mut values: Vec<String> = self
            .shard(name)
            .read()
            .get(name)
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        values.sort_unstable();
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let postings = Postings::new(4);
        let a = Labels::from_pairs([("__name__", "cpu"), ("host", "a")]);
        let b = Labels::from_pairs([("__name__", "cpu"), ("host", "b")]);
        postings.insert(&a, 1);
        postings.insert(&b, 2);

        assert_eq!(postings.get("__name__", "cpu").iter().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(postings.get("host", "a").len(), 1);
        assert!(postings.get("host", "zzz").is_empty());
        assert_eq!(postings.with_name("host").len(), 2);
        assert_eq!(postings.names(), vec!["__name__", "host"]);
        assert_eq!(postings.values("host"), vec!["a", "b"]);

        postings.remove(&a, 1);
        assert_eq!(postings.values("host"), vec!["b"]);
        assert_eq!(postings.get("__name__", "cpu").iter().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_unions() {
        let postings = Postings::new(2);
        for (id, host) in [(1, "a"), (2, "b"), (3, "c"), (4, "ab")] {
            postings.insert(&Labels::from_pairs([("host", host)]), id);
        }

        let ab = postings.union_of("host", &["a".to_string(), "b".to_string(), "x".to_string()]);
        assert_eq!(ab.iter().collect::<Vec<_>>(), vec![1, 2]);

        let starts_with_a = postings.union_where("host", |v| v.starts_with('a'));
        assert_eq!(starts_with_a.iter().collect::<Vec<_>>(), vec![1, 4]);
    }
}
