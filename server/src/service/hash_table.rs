// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A chained hash table with two bucket arrays and incremental rehashing.
//!
//! While rehashing, buckets below the cursor have been moved to the
//! secondary array; lookups in that range consult the secondary array. Every
//! mutating call moves one bucket forward so a busy table finishes its
//! rehash without a dedicated pass; the cron supplies bounded extra steps.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use rand::Rng;
use resp::memory::{tracker, Category};
use twox_hash::XxHash64;

/// An immutable key plus its last-access stamp. The data table, the expire
/// table, and the eviction pool all hold the same record for the same key,
/// so identity comparisons are pointer comparisons.
pub struct Key {
    bytes: Box<[u8]>,
    last_access: AtomicU32,
}

pub type SharedKey = Arc<Key>;

impl Key {
    pub fn shared(bytes: &[u8]) -> SharedKey {
        tracker().allocate(Category::Data, bytes.len());
        Arc::new(Key {
            bytes: bytes.into(),
            last_access: AtomicU32::new(0),
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes
    }

    /// Milliseconds on the LRU clock. Written only by the data worker.
    pub fn last_access(&self) -> u32 {
        self.last_access.load(Ordering::Relaxed)
    }

    pub fn set_last_access(&self, when: u32) {
        self.last_access.store(when, Ordering::Relaxed);
    }
}

impl Drop for Key {
    fn drop(&mut self) {
        tracker().deallocate(Category::Data, self.bytes.len());
    }
}

pub struct Entry<V> {
    pub key: SharedKey,
    pub value: V,
    next: Option<Box<Entry<V>>>,
}

type Bucket<V> = Option<Box<Entry<V>>>;

pub struct HashTable<V> {
    primary: Vec<Bucket<V>>,
    secondary: Vec<Bucket<V>>,
    /// Buckets below this index have been moved to `secondary`. Absent when
    /// not rehashing.
    rehash_index: Option<usize>,
    entries: usize,
}

impl<V> Default for HashTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> HashTable<V> {
    pub fn new() -> Self {
        HashTable {
            primary: Vec::new(),
            secondary: Vec::new(),
            rehash_index: None,
            entries: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.entries
    }

    pub fn bucket_count(&self) -> usize {
        self.primary.len()
    }

    pub fn load_factor(&self) -> f64 {
        if self.primary.is_empty() {
            return 0.0;
        }
        self.entries as f64 / self.primary.len() as f64
    }

    pub fn is_rehashing(&self) -> bool {
        self.rehash_index.is_some()
    }

    pub fn clear(&mut self) {
        self.primary.clear();
        self.secondary.clear();
        self.rehash_index = None;
        self.entries = 0;
    }

    pub fn find(&mut self, key: &[u8]) -> Option<&mut Entry<V>> {
        if self.primary.is_empty() {
            return None;
        }
        self.rehash_step();
        let hash = hash_key(key);
        find_in_chain(self.slot_for(hash), key)
    }

    /// Returns the entry for `key`, creating it with `make` if absent. The
    /// second result is whether the entry already existed.
    pub fn find_or_create(
        &mut self,
        key: &[u8],
        make: impl FnOnce() -> V,
    ) -> (&mut Entry<V>, bool) {
        self.find_or_create_keyed(key, None, make)
    }

    /// Insert `value` if `key` is absent; an existing entry is untouched.
    /// Returns (entry, inserted).
    pub fn insert(&mut self, key: &[u8], value: V) -> (&mut Entry<V>, bool) {
        let (entry, existed) = self.find_or_create(key, move || value);
        (entry, !existed)
    }

    /// Insert or overwrite. Returns (entry, existed).
    pub fn upsert(&mut self, key: &[u8], value: V) -> (&mut Entry<V>, bool) {
        let mut slot = Some(value);
        let (entry, existed) = self.find_or_create(key, || slot.take().expect("value consumed"));
        if existed {
            entry.value = slot.take().expect("value consumed");
        }
        (entry, existed)
    }

    /// Like `upsert`, but a created entry adopts the given shared key record
    /// instead of copying the bytes. This is how the expire table shares key
    /// identity with the data table.
    pub fn upsert_shared(&mut self, key: &SharedKey, value: V) -> (&mut Entry<V>, bool) {
        let mut slot = Some(value);
        let (entry, existed) =
            self.find_or_create_keyed(key.data(), Some(key), || slot.take().expect("consumed"));
        if existed {
            debug_assert!(Arc::ptr_eq(&entry.key, key));
            entry.value = slot.take().expect("consumed");
        }
        (entry, existed)
    }

    pub fn erase(&mut self, key: &[u8]) -> bool {
        if self.primary.is_empty() {
            return false;
        }
        self.rehash_step();
        let hash = hash_key(key);
        let erased = {
            let mut cur = self.slot_for(hash);
            while cur.as_ref().map_or(false, |e| e.key.data() != key) {
                cur = &mut cur.as_mut().expect("checked above").next;
            }
            match cur.take() {
                None => false,
                Some(mut entry) => {
                    *cur = entry.next.take();
                    true
                }
            }
        };
        if erased {
            self.entries -= 1;
        }
        erased
    }

    /// A uniformly-random-ish live entry: picks a random non-empty bucket
    /// (consulting the secondary array for already-moved indices), then a
    /// random entry in its chain.
    pub fn random_entry(&self) -> Option<&Entry<V>> {
        if self.entries == 0 || self.primary.is_empty() {
            return None;
        }
        let mut rng = rand::thread_rng();
        loop {
            let roll: usize = rng.gen();
            let index = roll % self.primary.len();
            let bucket = match self.rehash_index {
                Some(cursor) if index < cursor => &self.secondary[roll % self.secondary.len()],
                _ => &self.primary[index],
            };
            if let Some(first) = bucket.as_deref() {
                return Some(random_in_chain(first, &mut rng));
            }
        }
    }

    /// Invokes `visit` on every entry of `primary[bucket_index]` and returns
    /// the next cursor in reversed-bit-increment order, so that a traversal
    /// started at 0 visits every bucket exactly once even across table
    /// growth. Returns 0 while rehashing: the sweep retries later rather
    /// than observing a half-moved table.
    pub fn traverse_bucket(&self, bucket_index: usize, mut visit: impl FnMut(&Entry<V>)) -> usize {
        if self.is_rehashing() || self.primary.is_empty() {
            return 0;
        }
        debug_assert!(bucket_index < self.primary.len());
        let next = next_bucket_index(bucket_index, self.primary.len());
        let mut entry = self.primary[bucket_index].as_deref();
        while let Some(e) = entry {
            visit(e);
            entry = e.next.as_deref();
        }
        next
    }

    /// Moves up to `buckets_to_rehash` non-empty buckets (or ten times that
    /// many empty probes) into the secondary array. Returns whether
    /// rehashing completed; on completion the secondary array becomes the
    /// primary and the cursor clears.
    pub fn rehash_some(&mut self, buckets_to_rehash: usize) -> bool {
        let mut cursor = self.rehash_index.expect("rehash_some while not rehashing");
        debug_assert!(buckets_to_rehash != 0);
        debug_assert!(cursor < self.primary.len());

        let mut non_empty_left = buckets_to_rehash;
        let mut empty_left = buckets_to_rehash * 10;
        loop {
            let moved = self.rehash_bucket(cursor);
            cursor += 1;
            if cursor == self.primary.len() {
                self.rehash_index = None;
                self.primary = std::mem::take(&mut self.secondary);
                return true;
            }
            if moved == 0 {
                empty_left -= 1;
                if empty_left == 0 {
                    break;
                }
            } else {
                non_empty_left -= 1;
                if non_empty_left == 0 {
                    break;
                }
            }
        }
        self.rehash_index = Some(cursor);
        false
    }

    fn rehash_bucket(&mut self, index: usize) -> usize {
        let mut chain = self.primary[index].take();
        let mut moved = 0;
        while let Some(mut entry) = chain {
            chain = entry.next.take();
            let target = (hash_key(entry.key.data()) as usize) % self.secondary.len();
            entry.next = self.secondary[target].take();
            self.secondary[target] = Some(entry);
            moved += 1;
        }
        moved
    }

    fn find_or_create_keyed(
        &mut self,
        key: &[u8],
        shared: Option<&SharedKey>,
        make: impl FnOnce() -> V,
    ) -> (&mut Entry<V>, bool) {
        if self.primary.is_empty() {
            self.primary.resize_with(4, || None);
        }
        self.rehash_step();
        let hash = hash_key(key);

        let exists = chain_contains(self.slot_for(hash), key);
        if !exists {
            self.expand();
            self.entries += 1;
            let record = match shared {
                Some(record) => record.clone(),
                None => Key::shared(key),
            };
            let slot = self.slot_for(hash);
            let entry = Box::new(Entry {
                key: record,
                value: make(),
                next: slot.take(),
            });
            *slot = Some(entry);
        }
        let entry = find_in_chain(self.slot_for(hash), key).expect("just found or created");
        (entry, exists)
    }

    /// One rehash step, charged to every mutating call.
    fn rehash_step(&mut self) {
        if self.is_rehashing() {
            self.rehash_some(1);
        }
    }

    /// Starts rehashing when the load factor reaches one. The new array is
    /// twice the current size.
    fn expand(&mut self) {
        if self.is_rehashing() || self.entries < self.primary.len() {
            return;
        }
        debug_assert!(self.secondary.is_empty());
        self.secondary.resize_with(self.primary.len() * 2, || None);
        self.rehash_index = Some(0);
        self.rehash_some(1);
    }

    fn slot_for(&mut self, hash: u64) -> &mut Bucket<V> {
        let index = (hash as usize) % self.primary.len();
        if let Some(cursor) = self.rehash_index {
            if index < cursor {
                let secondary_index = (hash as usize) % self.secondary.len();
                return &mut self.secondary[secondary_index];
            }
        }
        &mut self.primary[index]
    }
}

fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key);
    hasher.finish()
}

fn chain_contains<V>(mut bucket: &Bucket<V>, key: &[u8]) -> bool {
    while let Some(entry) = bucket {
        if entry.key.data() == key {
            return true;
        }
        bucket = &entry.next;
    }
    false
}

fn find_in_chain<'a, V>(mut bucket: &'a mut Bucket<V>, key: &[u8]) -> Option<&'a mut Entry<V>> {
    while bucket.as_ref().map_or(false, |e| e.key.data() != key) {
        bucket = &mut bucket.as_mut().expect("checked above").next;
    }
    bucket.as_deref_mut()
}

fn random_in_chain<'a, V>(first: &'a Entry<V>, rng: &mut impl Rng) -> &'a Entry<V> {
    let mut len = 1;
    let mut entry = first;
    while let Some(next) = entry.next.as_deref() {
        len += 1;
        entry = next;
    }
    let target = rng.gen_range(0..len);
    let mut entry = first;
    for _ in 0..target {
        entry = entry.next.as_deref().expect("target within chain");
    }
    entry
}

/// Advances a bucket cursor by incrementing its reversed bits, masked to the
/// current table size. A traversal using this order visits every bucket of a
/// power-of-two table exactly once and stays exhaustive across expansions.
fn next_bucket_index(index: usize, size: usize) -> usize {
    debug_assert!(size.is_power_of_two());
    let mask = size - 1;
    let mut cursor = index | !mask;
    cursor = cursor.reverse_bits();
    cursor = cursor.wrapping_add(1);
    cursor.reverse_bits()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn key_of(i: usize) -> Vec<u8> {
        format!("key:{i}").into_bytes()
    }

    #[test]
    fn insert_find_erase() {
        let mut table: HashTable<u64> = HashTable::new();
        assert!(table.find(b"missing").is_none());
        assert!(!table.erase(b"missing"));

        let (_, inserted) = table.insert(b"a", 1);
        assert!(inserted);
        let (entry, inserted) = table.insert(b"a", 2);
        assert!(!inserted);
        assert_eq!(entry.value, 1);

        let (entry, existed) = table.upsert(b"a", 3);
        assert!(existed);
        assert_eq!(entry.value, 3);

        assert_eq!(table.count(), 1);
        assert!(table.erase(b"a"));
        assert!(!table.erase(b"a"));
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn grows_and_keeps_every_key_reachable() {
        let mut table: HashTable<usize> = HashTable::new();
        for i in 0..1000 {
            table.upsert(&key_of(i), i);
        }
        assert_eq!(table.count(), 1000);
        assert!(table.bucket_count() >= 1000 || table.is_rehashing());
        for i in 0..1000 {
            let entry = table.find(&key_of(i)).expect("key must be reachable");
            assert_eq!(entry.value, i);
        }
    }

    // Repeated single-step rehashing terminates, keys stay reachable
    // throughout, and the secondary array is gone at the end.
    #[test]
    fn single_step_rehash_terminates() {
        let mut table: HashTable<usize> = HashTable::new();
        let mut i = 0;
        while !table.is_rehashing() {
            table.upsert(&key_of(i), i);
            i += 1;
        }
        let inserted = i;

        let mut steps = 0;
        while table.is_rehashing() {
            for j in 0..inserted {
                assert!(table.find(&key_of(j)).is_some(), "key {j} lost mid-rehash");
            }
            table.rehash_some(1);
            steps += 1;
            assert!(steps < 1_000_000, "rehash does not terminate");
        }
        assert!(table.secondary.is_empty());
        for j in 0..inserted {
            assert!(table.find(&key_of(j)).is_some());
        }
    }

    #[test]
    fn erase_during_rehash() {
        let mut table: HashTable<usize> = HashTable::new();
        let mut inserted = 0;
        while !table.is_rehashing() || inserted < 64 {
            table.upsert(&key_of(inserted), inserted);
            inserted += 1;
        }
        for i in (0..64).step_by(2) {
            assert!(table.erase(&key_of(i)));
        }
        for i in 0..64 {
            assert_eq!(table.find(&key_of(i)).is_some(), i % 2 == 1);
        }
        for i in 64..inserted {
            assert!(table.find(&key_of(i)).is_some());
        }
    }

    #[test]
    fn traversal_visits_every_entry_once() {
        let mut table: HashTable<usize> = HashTable::new();
        for i in 0..256 {
            table.upsert(&key_of(i), i);
        }
        while table.is_rehashing() {
            table.rehash_some(8);
        }

        let mut seen: HashSet<Vec<u8>> = HashSet::new();
        let mut cursor = 0;
        loop {
            cursor = table.traverse_bucket(cursor, |entry| {
                assert!(seen.insert(entry.key.data().to_vec()), "entry visited twice");
            });
            if cursor == 0 {
                break;
            }
        }
        assert_eq!(seen.len(), 256);
    }

    #[test]
    fn traversal_is_a_noop_while_rehashing() {
        let mut table: HashTable<usize> = HashTable::new();
        let mut i = 0;
        while !table.is_rehashing() {
            table.upsert(&key_of(i), i);
            i += 1;
        }
        let mut visited = 0;
        assert_eq!(table.traverse_bucket(1, |_| visited += 1), 0);
        assert_eq!(visited, 0);
    }

    #[test]
    fn random_entry_returns_live_entries() {
        let mut table: HashTable<usize> = HashTable::new();
        assert!(table.random_entry().is_none());
        for i in 0..32 {
            table.upsert(&key_of(i), i);
        }
        for _ in 0..100 {
            let entry = table.random_entry().expect("table is non-empty");
            assert!(entry.key.data().starts_with(b"key:"));
        }
    }

    #[test]
    fn shared_key_identity() {
        let mut data: HashTable<u32> = HashTable::new();
        let mut expire: HashTable<i64> = HashTable::new();

        let (entry, _) = data.upsert(b"k", 7);
        let record = entry.key.clone();
        let (expire_entry, existed) = expire.upsert_shared(&record, 12345);
        assert!(!existed);
        assert!(Arc::ptr_eq(&expire_entry.key, &record));

        let (expire_entry, existed) = expire.upsert_shared(&record, 99999);
        assert!(existed);
        assert_eq!(expire_entry.value, 99999);
    }

    #[test]
    fn clear_empties_both_arrays() {
        let mut table: HashTable<usize> = HashTable::new();
        for i in 0..100 {
            table.upsert(&key_of(i), i);
        }
        table.clear();
        assert_eq!(table.count(), 0);
        assert!(!table.is_rehashing());
        assert!(table.find(&key_of(1)).is_none());
    }

    #[test]
    fn reversed_bit_cursor_covers_the_table() {
        for size in [4usize, 8, 64] {
            let mut seen = HashSet::new();
            let mut cursor = 0;
            loop {
                assert!(seen.insert(cursor), "cursor repeated at {cursor}");
                cursor = next_bucket_index(cursor, size);
                if cursor == 0 {
                    break;
                }
            }
            assert_eq!(seen.len(), size);
        }
    }
}
