// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The data-structure service: the command dictionary, the data and expire
//! tables, and the eviction/expiration drivers. Everything here runs on the
//! single data worker; I/O workers never touch the tables.

pub mod commands;
pub mod eviction;
pub mod expire;
pub mod hash_table;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use log::*;
use resp::memory::{SharedString, TrackedString};
use resp::reply::{ErrorKind, Reply};

use crate::clock::{Clock, UnixMillis};
use crate::config::Config;
use crate::server::Shared;
use eviction::EvictionState;
use expire::ExpireState;
use hash_table::{Entry, HashTable, SharedKey};

/// A command handler. Arguments are views into the client's query buffer,
/// valid for the duration of the call; the handler writes its outcome into
/// the reply.
pub type Handler = fn(&mut DataStructureService, &[&[u8]], &mut Reply);

#[derive(Clone, Copy)]
pub struct Command {
    handler: Handler,
    is_write: bool,
}

impl Command {
    /// A read command: never gated on memory pressure.
    pub fn read(handler: Handler) -> Self {
        Command {
            handler,
            is_write: false,
        }
    }

    /// A write command: subject to the maxmemory check before running.
    pub fn write(handler: Handler) -> Self {
        Command {
            handler,
            is_write: true,
        }
    }
}

#[derive(Default)]
pub struct DssStats {
    pub commands_processed: AtomicU64,
    pub evicted_keys: AtomicU64,
    pub active_expired_keys: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// Update if the key is present, insert otherwise.
    Regular,
    /// Only insert if the key is absent.
    Nx,
    /// Only update if the key is present.
    Xx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetStatus {
    NoOp,
    Inserted,
    Updated,
}

pub struct DataStructureService {
    pub(crate) config: Arc<Config>,
    pub(crate) shared: Arc<Shared>,
    pub(crate) clock: Clock,
    commands: HashMap<String, Command>,
    pub(crate) data_ht: HashTable<SharedString>,
    pub(crate) expire_ht: HashTable<UnixMillis>,
    pub(crate) evictor: EvictionState,
    pub(crate) expirer: ExpireState,
    command_time: UnixMillis,
    pub(crate) stats: DssStats,
    shutdown_tx: mpsc::Sender<()>,
}

impl DataStructureService {
    pub fn new(
        config: Arc<Config>,
        shared: Arc<Shared>,
        clock: Clock,
        shutdown_tx: mpsc::Sender<()>,
    ) -> Self {
        let command_time = clock.now();
        let evictor = EvictionState::new(&config);
        DataStructureService {
            config,
            shared,
            clock,
            commands: HashMap::new(),
            data_ht: HashTable::new(),
            expire_ht: HashTable::new(),
            evictor,
            expirer: ExpireState::default(),
            command_time,
            stats: DssStats::default(),
            shutdown_tx,
        }
    }

    /// Registers `command` under both the all-lowercase and all-uppercase
    /// spelling of `name`.
    pub fn register_command(&mut self, name: &str, command: Command) {
        self.commands.insert(name.to_lowercase(), command);
        self.commands.insert(name.to_uppercase(), command);
    }

    pub fn invoke(&mut self, args: &[&[u8]], reply: &mut Reply) {
        let name = match args.first().and_then(|arg| std::str::from_utf8(arg).ok()) {
            Some(name) => name,
            None => {
                *reply = Reply::Err(ErrorKind::Protocol);
                return;
            }
        };
        let command = match self.commands.get(name) {
            Some(command) => *command,
            None => {
                *reply = Reply::Err(ErrorKind::UnknownCommand);
                return;
            }
        };

        if command.is_write {
            let bytes_to_free = self.maxmemory_exceeded();
            if bytes_to_free != 0 && !self.evict(bytes_to_free) {
                *reply = Reply::Err(ErrorKind::Oom);
                return;
            }
        }
        (command.handler)(self, args, reply);
        self.stats.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// All TTL comparisons within one command use this fixed instant.
    pub fn command_time_snapshot(&self) -> UnixMillis {
        self.command_time
    }

    pub fn update_command_time(&mut self) {
        self.command_time = self.clock.now();
    }

    /// Returns the entry of `key` if it is live; a stale key is erased from
    /// both tables and reported absent. The single lazy-expiration path.
    pub fn find_or_expire(&mut self, key: &[u8]) -> Option<&mut Entry<SharedString>> {
        let expired = matches!(
            self.expire_ht.find(key),
            Some(entry) if entry.value <= self.command_time
        );
        if expired {
            self.data_ht.erase(key);
            self.expire_ht.erase(key);
            return None;
        }
        self.data_ht.find(key)
    }

    /// Erases `key` from the data table and, if present, the expire table.
    pub fn erase_key(&mut self, key: &[u8]) {
        if !self.data_ht.erase(key) {
            return;
        }
        self.expire_ht.erase(key);
    }

    /// Sets `key` to `value` under `mode`. Returns the operation outcome,
    /// the key record of the touched entry, and, when `get` is set and the
    /// key held a live value, that previous value.
    pub fn set_data(
        &mut self,
        key: &[u8],
        value: &[u8],
        mode: SetMode,
        get: bool,
    ) -> (SetStatus, Option<SharedKey>, Option<SharedString>) {
        let mut status = SetStatus::NoOp;
        let mut shared_key = None;
        let mut old_value = None;
        let now = self.command_time;

        match mode {
            SetMode::Regular => {
                let live = !matches!(
                    self.expire_ht.find(key),
                    Some(entry) if entry.value <= now
                );
                let mut fresh = Some(TrackedString::shared(value));
                let (entry, existed) = self
                    .data_ht
                    .find_or_create(key, || fresh.take().expect("consumed once"));
                if existed {
                    if get && live {
                        old_value = Some(entry.value.clone());
                    }
                    entry.value = fresh.take().expect("consumed once");
                }
                shared_key = Some(entry.key.clone());
                status = if existed {
                    SetStatus::Updated
                } else {
                    SetStatus::Inserted
                };
            }
            SetMode::Nx => {
                let expired = matches!(
                    self.expire_ht.find(key),
                    Some(entry) if entry.value <= now
                );
                if let Some(entry) = self.data_ht.find(key) {
                    if expired {
                        entry.value = TrackedString::shared(value);
                        shared_key = Some(entry.key.clone());
                        self.expire_ht.erase(key);
                        status = SetStatus::Inserted;
                    }
                } else {
                    let (entry, _) = self.data_ht.insert(key, TrackedString::shared(value));
                    shared_key = Some(entry.key.clone());
                    status = SetStatus::Inserted;
                }
            }
            SetMode::Xx => {
                let expired = matches!(
                    self.expire_ht.find(key),
                    Some(entry) if entry.value <= now
                );
                if self.data_ht.find(key).is_some() {
                    if expired {
                        self.data_ht.erase(key);
                        self.expire_ht.erase(key);
                    } else {
                        let entry = self.data_ht.find(key).expect("present and live");
                        if get {
                            old_value = Some(entry.value.clone());
                        }
                        entry.value = TrackedString::shared(value);
                        shared_key = Some(entry.key.clone());
                        status = SetStatus::Updated;
                    }
                }
            }
        }

        if let Some(record) = &shared_key {
            record.set_last_access(self.evictor.lru_clock());
        }
        (status, shared_key, old_value)
    }

    /// Rehashes each table for up to `time_limit`, in 100-bucket slices.
    /// Called from the cron.
    pub fn incremental_rehashing(&mut self, time_limit: Duration) {
        fn drive<V>(table: &mut HashTable<V>, time_limit: Duration) {
            if !table.is_rehashing() {
                return;
            }
            let start = Instant::now();
            while !table.rehash_some(100) && start.elapsed() < time_limit {}
        }
        drive(&mut self.data_ht, time_limit);
        drive(&mut self.expire_ht, time_limit);
    }

    /// Fulfills the shutdown future the main thread is blocked on.
    pub fn shutdown(&self) {
        info!("User requested shutdown.");
        let _ = self.shutdown_tx.send(());
    }

    pub fn lru_clock(&self) -> u32 {
        self.evictor.lru_clock()
    }
}
