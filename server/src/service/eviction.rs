// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Maxmemory enforcement: the accountant-vs-limit check plus the random and
//! sampled-approximate-LRU eviction strategies.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use log::*;
use resp::memory::{tracker, Category};

use crate::config::{Config, MaxmemoryPolicy};
use crate::service::hash_table::SharedKey;
use crate::service::DataStructureService;

/// The eviction pool keeps at most this many candidates, oldest first.
const EVICTION_POOL_LIMIT: usize = 16;

/// A sampled eviction candidate. Ordered by last-access so the pool's first
/// element is the oldest; ties break on key identity.
struct PoolCandidate {
    last_access: u32,
    key: SharedKey,
}

impl PartialEq for PoolCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for PoolCandidate {}

impl PartialOrd for PoolCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PoolCandidate {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.last_access
            .cmp(&other.last_access)
            .then_with(|| Arc::as_ptr(&self.key).cmp(&Arc::as_ptr(&other.key)))
    }
}

pub struct EvictionState {
    policy: MaxmemoryPolicy,
    maxmemory: u64,
    samples: usize,
    /// Monotonic base for the 32-bit millisecond LRU clock.
    lru_base: Instant,
    lru_clock: u32,
    pool: BTreeSet<PoolCandidate>,
}

impl EvictionState {
    pub fn new(config: &Config) -> Self {
        EvictionState {
            policy: config.maxmemory_policy,
            maxmemory: config.maxmemory,
            samples: config.maxmemory_samples.max(1) as usize,
            lru_base: Instant::now(),
            lru_clock: 0,
            pool: BTreeSet::new(),
        }
    }

    pub fn lru_clock(&self) -> u32 {
        self.lru_clock
    }
}

impl DataStructureService {
    /// Stamps the LRU clock from the monotonic base. Runs on every cron
    /// interval; accesses between refreshes share the same stamp.
    pub fn refresh_lru_clock(&mut self) {
        self.evictor.lru_clock = self.evictor.lru_base.elapsed().as_millis() as u32;
    }

    /// How far over `maxmemory` the accountant currently is; zero when
    /// under the limit or unlimited.
    pub fn maxmemory_exceeded(&self) -> usize {
        if self.evictor.maxmemory == 0 {
            return 0;
        }
        tracker()
            .total_allocated()
            .saturating_sub(self.evictor.maxmemory as usize)
    }

    /// Frees at least `bytes_to_free` accounted bytes by erasing keys under
    /// the configured policy. Returns false if the policy forbids eviction
    /// or the table ran dry first.
    pub fn evict(&mut self, bytes_to_free: usize) -> bool {
        debug_assert!(bytes_to_free != 0);
        debug!(
            "eviction: policy:{} bytes_to_free:{}",
            self.evictor.policy, bytes_to_free
        );

        match self.evictor.policy {
            MaxmemoryPolicy::NoEviction => false,
            MaxmemoryPolicy::AllKeysRandom => {
                let mut freed = 0;
                while freed < bytes_to_free {
                    if self.data_ht.count() == 0 {
                        return false;
                    }
                    let victim = match self.data_ht.random_entry() {
                        Some(entry) => entry.key.data().to_vec(),
                        None => return false,
                    };
                    freed += self.evict_one(&victim);
                }
                true
            }
            MaxmemoryPolicy::AllKeysLru => {
                let mut freed = 0;
                while freed < bytes_to_free {
                    if self.data_ht.count() == 0 {
                        return false;
                    }
                    let samples = self.evictor.samples;
                    let victim = match self.get_some_old_entry(samples) {
                        Some(key) => key,
                        None => return false,
                    };
                    freed += self.evict_one(&victim.data().to_vec());
                }
                true
            }
        }
    }

    fn evict_one(&mut self, key: &[u8]) -> usize {
        let before = tracker().allocated(Category::Data);
        trace!("evicting key {:?}", String::from_utf8_lossy(key));
        self.expire_ht.erase(key);
        self.data_ht.erase(key);
        self.stats.evicted_keys.fetch_add(1, Ordering::Relaxed);
        before.saturating_sub(tracker().allocated(Category::Data))
    }

    /// Samples `samples` random entries into the eviction pool and pops the
    /// oldest candidate that still exists with an unchanged last-access
    /// stamp. The pool carries over between calls to amortize sampling.
    fn get_some_old_entry(&mut self, samples: usize) -> Option<SharedKey> {
        debug_assert!(self.data_ht.count() > 0);
        loop {
            if self.data_ht.count() == 0 {
                return None;
            }
            for _ in 0..samples.min(self.data_ht.count()) {
                let entry = self.data_ht.random_entry()?;
                self.evictor.pool.insert(PoolCandidate {
                    last_access: entry.key.last_access(),
                    key: entry.key.clone(),
                });
            }
            while self.evictor.pool.len() > EVICTION_POOL_LIMIT {
                self.evictor.pool.pop_last();
            }
            while let Some(candidate) = self.evictor.pool.pop_first() {
                let live = matches!(
                    self.data_ht.find(candidate.key.data()),
                    Some(entry) if entry.key.last_access() == candidate.last_access
                );
                if live {
                    return Some(candidate.key);
                }
            }
        }
    }
}
