use std::{
    collections::HashMap,
    hash::Hash,
    sync::{PoisonError, RwLock},
};

use crate::types::DataAndSlot;

/// Map of entity key to `(value, slot)` with monotonic writes.
///
/// A write is applied iff its slot is at least the stored slot, so two update
/// sources racing on the same key can never move an entry back in time. Ties go
/// to the last writer. Batches are applied under one write lock and readers
/// see either none or all of a batch.
#[derive(Debug)]
pub struct SlotStampedCache<K, V> {
    entries: RwLock<HashMap<K, DataAndSlot<V>>>,
}

impl<K, V> Default for SlotStampedCache<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> SlotStampedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` unless a newer slot is already cached. Returns whether it was applied.
    pub fn put(&self, key: K, value: V, slot: u64) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Self::apply(&mut entries, key, value, slot)
    }

    /// Applies every entry of a batch observed at one slot, atomically for readers.
    /// Returns how many entries were applied.
    pub fn put_batch(&self, batch: impl IntoIterator<Item = (K, V)>, slot: u64) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        batch
            .into_iter()
            .map(|(key, value)| Self::apply(&mut entries, key, value, slot))
            .filter(|applied| *applied)
            .count()
    }

    fn apply(entries: &mut HashMap<K, DataAndSlot<V>>, key: K, value: V, slot: u64) -> bool {
        match entries.get_mut(&key) {
            Some(existing) if existing.slot > slot => false,
            Some(existing) => {
                existing.data = value;
                existing.slot = slot;
                true
            }
            None => {
                entries.insert(key, DataAndSlot::new(value, slot));
                true
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<DataAndSlot<V>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Reads several keys under one lock so they come from the same set of batches
    pub fn get_many(&self, keys: &[K]) -> Vec<Option<DataAndSlot<V>>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        keys.iter().map(|key| entries.get(key).cloned()).collect()
    }

    pub fn get_all(&self) -> Vec<(K, DataAndSlot<V>)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn remove(&self, key: &K) -> Option<DataAndSlot<V>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn stale_write_is_ignored() {
        let cache = SlotStampedCache::new();
        assert!(cache.put("market", "at 100", 100));

        // notification from the lagging source
        assert!(!cache.put("market", "at 95", 95));
        let entry = cache.get(&"market").unwrap();
        assert_eq!(entry.slot, 100);
        assert_eq!(entry.data, "at 100");

        assert!(cache.put("market", "at 101", 101));
        assert_eq!(cache.get(&"market").unwrap().slot, 101);
    }

    #[test]
    fn same_slot_last_writer_wins() {
        let cache = SlotStampedCache::new();
        cache.put(1u8, "poll", 50);
        assert!(cache.put(1u8, "push", 50));
        assert_eq!(cache.get(&1u8).unwrap().data, "push");
    }

    #[test]
    fn batch_applies_per_entry_rule() {
        let cache = SlotStampedCache::new();
        cache.put("a", 1, 10);
        cache.put("b", 1, 30);

        let applied = cache.put_batch(vec![("a", 2), ("b", 2), ("c", 2)], 20);
        assert_eq!(applied, 2);
        assert_eq!(cache.get(&"a").unwrap(), DataAndSlot::new(2, 20));
        assert_eq!(cache.get(&"b").unwrap(), DataAndSlot::new(1, 30));
        assert_eq!(cache.get(&"c").unwrap(), DataAndSlot::new(2, 20));
    }

    #[test]
    fn slot_never_decreases_under_concurrent_writers() {
        let cache = Arc::new(SlotStampedCache::new());
        let writers: Vec<_> = (0..4u64)
            .map(|offset| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for slot in (0..100u64).rev().map(|i| offset + i * 4) {
                        cache.put("key", slot, slot);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let entry = cache.get(&"key").unwrap();
        assert_eq!(entry.slot, 399);
        assert_eq!(entry.data, 399);
    }

    #[test]
    fn readers_never_see_half_a_batch() {
        let cache = Arc::new(SlotStampedCache::new());
        let keys = ["perp-0", "perp-1", "oracle-0"];
        cache.put_batch(keys.iter().map(|k| (*k, 0u64)), 0);

        let writer = {
            let cache = cache.clone();
            thread::spawn(move || {
                for slot in 1..500u64 {
                    cache.put_batch(keys.iter().map(|k| (*k, slot)), slot);
                }
            })
        };

        for _ in 0..500 {
            let seen = cache.get_many(&keys);
            let slots: Vec<u64> = seen.iter().map(|e| e.as_ref().unwrap().slot).collect();
            assert!(slots.windows(2).all(|w| w[0] == w[1]), "torn read: {slots:?}");
        }
        writer.join().unwrap();
    }
}
