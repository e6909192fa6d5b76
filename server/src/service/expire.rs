// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Active expiration: an incremental sweep over the expire table that erases
//! stale keys until the stale ratio looks healthy or the cycle's time
//! budget runs out.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use log::*;

use crate::service::hash_table::SharedKey;
use crate::service::DataStructureService;

#[derive(Default)]
pub struct ExpireState {
    /// Sweep cursor into the expire table, carried across cron ticks.
    bucket_index: usize,
    /// Scratch for keys found stale in the bucket under traversal; erasure
    /// happens after the traversal step, never during it.
    stale_scratch: Vec<SharedKey>,
}

impl DataStructureService {
    /// One expiration cycle. Samples buckets of the expire table, erasing
    /// entries whose instant is at or before the clock, and stops on the
    /// first of: acceptable stale ratio, exhausted time budget, the whole
    /// table scanned, or nothing sampled.
    pub fn active_expire(&mut self) {
        if self.expire_ht.count() == 0 {
            return;
        }

        let time_limit = Duration::from_micros(
            1_000_000u64 * self.config.active_expire_cycle_time_percent as u64
                / 100
                / self.config.hz as u64,
        );
        let keys_per_loop = self.config.active_expire_keys_per_loop as usize;
        let threshold = self.config.active_expire_acceptable_stale_percent as f64;
        let max_samples = self.expire_ht.count();
        let now = self.clock.now();
        let start = Instant::now();

        let mut sampled_total = 0usize;
        let mut expired_total = 0u64;
        loop {
            let keys_to_sample = keys_per_loop.min(self.expire_ht.count());
            if keys_to_sample == 0 {
                break;
            }

            let mut sampled_this_iter = 0usize;
            let mut expired_this_iter = 0usize;
            while sampled_this_iter < keys_to_sample {
                let mut scratch = std::mem::take(&mut self.expirer.stale_scratch);
                scratch.clear();
                let cursor = self.expirer.bucket_index;
                self.expirer.bucket_index = self.expire_ht.traverse_bucket(cursor, |entry| {
                    sampled_this_iter += 1;
                    if entry.value <= now {
                        scratch.push(entry.key.clone());
                    }
                });
                for key in &scratch {
                    self.data_ht.erase(key.data());
                    self.expire_ht.erase(key.data());
                    expired_this_iter += 1;
                }
                self.expirer.stale_scratch = scratch;
                if self.expirer.bucket_index == 0 {
                    break;
                }
            }

            if sampled_this_iter == 0 {
                break;
            }
            sampled_total += sampled_this_iter;
            expired_total += expired_this_iter as u64;

            let expired_rate = expired_this_iter as f64 * 100.0 / sampled_this_iter as f64;
            trace!(
                "active expire loop | sampled:{sampled_this_iter} expired:{expired_this_iter} \
                 rate:{expired_rate:.1}"
            );
            if expired_rate <= threshold {
                break;
            }
            if start.elapsed() >= time_limit {
                break;
            }
            if sampled_total >= max_samples {
                break;
            }
        }
        self.stats
            .active_expired_keys
            .fetch_add(expired_total, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_util::*;

    fn settle_rehash(harness: &mut Harness) {
        // The sweep skips buckets while a table is mid-rehash; finish any
        // pending rehash so the test observes a full pass.
        harness
            .svc
            .incremental_rehashing(Duration::from_secs(1));
    }

    #[test]
    fn empty_table_is_a_noop() {
        let mut harness = Harness::new();
        harness.svc.active_expire();
        assert_eq!(
            harness.svc.stats.active_expired_keys.load(Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn sweeps_out_stale_keys() {
        let mut harness = Harness::new();
        for i in 0..50 {
            expect_ok(&harness.invoke(&format!("SET key:{i} v PX 100")));
        }
        for i in 0..10 {
            expect_ok(&harness.invoke(&format!("SET live:{i} v")));
        }
        harness.advance(200);
        settle_rehash(&mut harness);

        // Drive cycles until the sweep has covered the table.
        for _ in 0..100 {
            harness.svc.active_expire();
            if harness.svc.expire_ht.count() == 0 {
                break;
            }
        }
        assert_eq!(harness.svc.expire_ht.count(), 0);
        for i in 0..50 {
            assert!(
                harness.svc.data_ht.find(format!("key:{i}").as_bytes()).is_none(),
                "stale key:{i} must be swept"
            );
        }
    }

    #[test]
    fn fresh_keys_survive_the_sweep() {
        let mut harness = Harness::new();
        for i in 0..20 {
            expect_ok(&harness.invoke(&format!("SET stale:{i} v PX 50")));
        }
        for i in 0..20 {
            expect_ok(&harness.invoke(&format!("SET fresh:{i} v PX 60000")));
        }
        harness.advance(100);
        settle_rehash(&mut harness);

        for _ in 0..100 {
            harness.svc.active_expire();
        }
        assert_eq!(harness.svc.expire_ht.count(), 20);
        for i in 0..20 {
            assert!(harness
                .svc
                .data_ht
                .find(format!("fresh:{i}").as_bytes())
                .is_some());
        }
    }

    // The expire table's key set stays a subset of the data table's.
    #[test]
    fn expire_subset_invariant_holds() {
        let mut harness = Harness::new();
        for i in 0..30 {
            expect_ok(&harness.invoke(&format!("SET k:{i} v PX {}", 50 + i)));
        }
        harness.advance(70);
        settle_rehash(&mut harness);
        for _ in 0..50 {
            harness.svc.active_expire();
        }

        let mut expire_keys = Vec::new();
        let mut cursor = 0;
        loop {
            cursor = harness.svc.expire_ht.traverse_bucket(cursor, |entry| {
                expire_keys.push(entry.key.data().to_vec());
            });
            if cursor == 0 {
                break;
            }
        }
        for key in expire_keys {
            assert!(
                harness.svc.data_ht.find(&key).is_some(),
                "expire-table key missing from data table"
            );
        }
    }
}
