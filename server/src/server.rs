// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Bring-up and lifecycle: spawns the data worker and the I/O workers,
//! seeds the accept and cron tasks, blocks on the shutdown future, and
//! tears everything down in order.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use io_uring::{opcode, squeue, types};
use log::*;

use crate::client::{Client, ClientState};
use crate::client_manager::ClientManager;
use crate::clock::{Clock, UnixMillis};
use crate::config::Config;
use crate::io::{Connection, Listener};
use crate::runtime::ring::{event_loop, post_to_ring, RingConfig, RingWorker};
use crate::runtime::task::{Disposition, Task};
use crate::runtime::CompletionHandler;
use crate::service::commands::register_all;
use crate::service::DataStructureService;

#[derive(Default)]
pub struct ServerStats {
    pub connections_received: AtomicU64,
    pub rejected_connections: AtomicU64,
}

/// State reachable from every worker: configuration, the client registry,
/// and server-wide counters.
pub struct Shared {
    pub config: Arc<Config>,
    pub manager: ClientManager,
    pub stats: ServerStats,
    pub start_time_ms: UnixMillis,
}

impl Shared {
    pub fn new(config: Arc<Config>, start_time_ms: UnixMillis) -> Self {
        Shared {
            config,
            manager: ClientManager::default(),
            stats: ServerStats::default(),
            start_time_ms,
        }
    }
}

/// The accept loop as a task: each completion delivers one connection,
/// binds it to an I/O worker round-robin, and resubmits the accept.
pub struct Acceptor {
    listener: Listener,
    io_ring_fds: Vec<RawFd>,
    dss_ring_fd: RawFd,
    /// Index of the I/O worker running this acceptor.
    own_index: usize,
    next_worker: usize,
    shared: Arc<Shared>,
}

impl Acceptor {
    pub fn new(
        listener: Listener,
        io_ring_fds: Vec<RawFd>,
        dss_ring_fd: RawFd,
        own_index: usize,
        shared: Arc<Shared>,
    ) -> Self {
        Acceptor {
            listener,
            io_ring_fds,
            dss_ring_fd,
            own_index,
            next_worker: 0,
            shared,
        }
    }

    pub fn prep_accept(&self) -> squeue::Entry {
        self.listener.prep_accept()
    }

    pub fn on_event(
        &mut self,
        worker: &mut RingWorker,
        user_data: u64,
        result: i32,
    ) -> Disposition {
        if result < 0 {
            error!("accept: {}", nix::errno::Errno::from_raw(-result));
        } else {
            self.place_connection(worker, result);
        }
        worker.push(self.prep_accept().user_data(user_data));
        Disposition::Pending
    }

    fn place_connection(&mut self, worker: &mut RingWorker, fd: RawFd) {
        self.shared
            .stats
            .connections_received
            .fetch_add(1, Ordering::Relaxed);
        if self.shared.manager.active_clients() >= self.shared.config.maxclients {
            self.shared
                .stats
                .rejected_connections
                .fetch_add(1, Ordering::Relaxed);
            // SAFETY: fd was just accepted and handed to no one else.
            unsafe { libc::close(fd) };
            return;
        }

        let target = self.next_worker;
        self.next_worker = (self.next_worker + 1) % self.io_ring_fds.len();

        let client = Client::new(
            Connection::new(fd),
            self.io_ring_fds[target],
            self.dss_ring_fd,
            self.shared.clone(),
            self.shared.config.use_ring_buffer,
        );
        self.shared.manager.add(fd);
        let client_ud = Box::new(Task::Client(client)).into_user_data();

        if target == self.own_index {
            // The connection stays on this worker; start it inline instead
            // of bouncing a message off our own ring.
            let mut task = unsafe { Task::from_user_data(client_ud) };
            let disposition = match &mut *task {
                Task::Client(client) => client.on_io_event(worker, client_ud, 0, 0),
                _ => unreachable!(),
            };
            debug_assert_eq!(disposition, Disposition::Pending);
            let _ = task.into_user_data();
        } else {
            // Hand the new client to its worker; it resumes there in the
            // Start state.
            let entry =
                opcode::MsgRingData::new(types::Fd(self.io_ring_fds[target]), 0, client_ud, None)
                    .build()
                    .flags(squeue::Flags::SKIP_SUCCESS);
            worker.push(entry);
        }
    }
}

/// The data worker's housekeeping task, rescheduled on a 1 ms ring timeout.
/// Every tick refreshes the command-time snapshot; every `1000/hz` ticks it
/// advances the LRU clock, runs one expiration cycle, and rehashes a slice
/// of each table.
pub struct Cron {
    timeout: types::Timespec,
    ticks: u32,
    interval_ticks: u32,
}

impl Cron {
    pub fn new(interval_ticks: u32) -> Self {
        Cron {
            timeout: types::Timespec::new().nsec(1_000_000),
            ticks: 0,
            interval_ticks: interval_ticks.max(1),
        }
    }

    pub fn interval_ticks(&self) -> u32 {
        self.interval_ticks
    }

    pub fn prep_timeout(&self) -> squeue::Entry {
        opcode::Timeout::new(&self.timeout as *const types::Timespec).build()
    }

    pub fn on_tick(&mut self, service: &mut DataStructureService) {
        service.update_command_time();
        self.ticks += 1;
        if self.ticks < self.interval_ticks {
            return;
        }
        self.ticks = 0;
        service.refresh_lru_clock();
        service.active_expire();
        service.incremental_rehashing(Duration::from_millis(1));
    }
}

/// Completion dispatch for I/O workers: accepts and client pipeline events.
struct IoHandler;

impl CompletionHandler for IoHandler {
    fn on_completion(&mut self, worker: &mut RingWorker, user_data: u64, result: i32, flags: u32) {
        let mut task = unsafe { Task::from_user_data(user_data) };
        let disposition = match &mut *task {
            Task::Accept(acceptor) => acceptor.on_event(worker, user_data, result),
            Task::Client(client) => client.on_io_event(worker, user_data, result, flags),
            Task::Cron(_) => unreachable!("cron lives on the data worker"),
        };
        match disposition {
            Disposition::Pending => {
                let _ = task.into_user_data();
            }
            Disposition::Done => drop(task),
        }
    }
}

/// Completion dispatch for the data worker: cron ticks and client command
/// invocations arriving by ring message.
struct DataHandler {
    service: DataStructureService,
}

impl CompletionHandler for DataHandler {
    fn on_completion(&mut self, worker: &mut RingWorker, user_data: u64, result: i32, _flags: u32) {
        let mut task = unsafe { Task::from_user_data(user_data) };
        let disposition = match &mut *task {
            Task::Cron(cron) => {
                if result != -libc::ETIME && result != 0 {
                    panic!("cron timeout completion: {result}");
                }
                cron.on_tick(&mut self.service);
                worker.push(cron.prep_timeout().user_data(user_data));
                Disposition::Pending
            }
            Task::Client(client) => match client.state() {
                ClientState::Invoking => {
                    client.on_data_event(&mut self.service);
                    let entry = opcode::MsgRingData::new(
                        types::Fd(client.io_ring_fd()),
                        0,
                        user_data,
                        None,
                    )
                    .build()
                    .flags(squeue::Flags::SKIP_SUCCESS)
                    .user_data(user_data);
                    worker.push(entry);
                    Disposition::Pending
                }
                ClientState::Responding => {
                    // The resumption message back to the I/O worker failed.
                    error!("ring message to I/O worker failed: {result}");
                    client.abandon();
                    Disposition::Done
                }
                state => unreachable!("client in state {state:?} on the data worker"),
            },
            Task::Accept(_) => unreachable!("accepts live on I/O workers"),
        };
        match disposition {
            Disposition::Pending => {
                let _ = task.into_user_data();
            }
            Disposition::Done => drop(task),
        }
    }
}

struct WorkerHandle {
    ring_fd: RawFd,
    active: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

/// Runs the server to completion: returns after a client issued SHUTDOWN
/// (or every worker died). Startup failures return an error.
pub fn run(config: Config) -> io::Result<()> {
    config
        .sanity_check()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    let config = Arc::new(config);
    set_nofile_limit(u16::MAX as u64);

    let shared = Arc::new(Shared::new(config.clone(), Clock::system().now()));
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let mut workers: Vec<WorkerHandle> = Vec::new();

    // Data worker first; the I/O workers need its ring fd.
    let (setup_tx, setup_rx) = mpsc::channel();
    {
        let config = config.clone();
        let shared = shared.clone();
        let shutdown_tx = shutdown_tx.clone();
        let join = std::thread::Builder::new()
            .name("dss".into())
            .spawn(move || data_worker_main(config, shared, shutdown_tx, setup_tx))?;
        let (ring_fd, active) = recv_setup(setup_rx, join.thread().name())?;
        workers.push(WorkerHandle {
            ring_fd,
            active,
            join,
        });
    }
    let dss_ring_fd = workers[0].ring_fd;
    // Only worker threads signal shutdown from here on; if they all die,
    // the receive below unblocks with an error instead of hanging.
    drop(shutdown_tx);

    // I/O workers. Worker 0 additionally waits for the acceptor task.
    let (acceptor_tx, acceptor_rx) = mpsc::channel::<Acceptor>();
    let mut acceptor_rx = Some(acceptor_rx);
    for index in 0..config.client_executors as usize {
        let (setup_tx, setup_rx) = mpsc::channel();
        let config = config.clone();
        let seed = acceptor_rx.take();
        let name = format!("cli_exr_{index}");
        let join = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || io_worker_main(index, config, seed, setup_tx))?;
        let (ring_fd, active) = recv_setup(setup_rx, Some(name.as_str()))?;
        workers.push(WorkerHandle {
            ring_fd,
            active,
            join,
        });
    }
    let io_ring_fds: Vec<RawFd> = workers[1..].iter().map(|w| w.ring_fd).collect();

    // Seed the accept loop on I/O worker 0.
    let listener = match Listener::bind(config.port) {
        Ok(listener) => listener,
        Err(e) => {
            // Worker 0 is still waiting for the acceptor; dropping the
            // sender unblocks it before the join.
            drop(acceptor_tx);
            shutdown_workers(&workers);
            join_workers(workers);
            return Err(e);
        }
    };
    let acceptor = Acceptor::new(listener, io_ring_fds, dss_ring_fd, 0, shared.clone());
    acceptor_tx
        .send(acceptor)
        .expect("I/O worker 0 waits for the acceptor");

    info!("ringkv serving on port {}", config.port);
    // The shutdown future: fulfilled by the SHUTDOWN command, or broken if
    // every worker died.
    let _ = shutdown_rx.recv();

    info!("shutting down");
    shutdown_workers(&workers);
    join_workers(workers);
    shared.manager.close_all();
    Ok(())
}

fn data_worker_main(
    config: Arc<Config>,
    shared: Arc<Shared>,
    shutdown_tx: mpsc::Sender<()>,
    setup_tx: mpsc::Sender<io::Result<(RawFd, Arc<AtomicBool>)>>,
) {
    let mut worker = match RingWorker::new(&RingConfig::data_worker(&config)) {
        Ok(worker) => {
            let _ = setup_tx.send(Ok((worker.ring_fd(), worker.active_flag())));
            worker
        }
        Err(e) => {
            let _ = setup_tx.send(Err(e));
            return;
        }
    };

    let mut service =
        DataStructureService::new(config.clone(), shared, Clock::system(), shutdown_tx);
    register_all(&mut service);

    // Seed the cron; it reschedules itself from then on.
    let interval_ticks = 1000 / config.hz;
    let cron = Box::new(Task::Cron(Cron::new(interval_ticks)));
    let cron_ud = cron.into_user_data();
    {
        let mut task = unsafe { Task::from_user_data(cron_ud) };
        if let Task::Cron(cron) = &mut *task {
            worker.push(cron.prep_timeout().user_data(cron_ud));
        }
        let _ = task.into_user_data();
    }

    let mut handler = DataHandler { service };
    event_loop(&mut worker, &mut handler);
}

fn io_worker_main(
    index: usize,
    config: Arc<Config>,
    acceptor_rx: Option<mpsc::Receiver<Acceptor>>,
    setup_tx: mpsc::Sender<io::Result<(RawFd, Arc<AtomicBool>)>>,
) {
    let build = || -> io::Result<RingWorker> {
        let mut worker = RingWorker::new(&RingConfig::io_worker(index, &config))?;
        if config.use_ring_buffer {
            worker.enable_buf_ring(1024)?;
        }
        Ok(worker)
    };
    let mut worker = match build() {
        Ok(worker) => {
            let _ = setup_tx.send(Ok((worker.ring_fd(), worker.active_flag())));
            worker
        }
        Err(e) => {
            let _ = setup_tx.send(Err(e));
            return;
        }
    };

    // Worker 0 hosts the accept loop; the listener arrives once every
    // worker's ring fd is known.
    if let Some(acceptor_rx) = acceptor_rx {
        let acceptor = match acceptor_rx.recv() {
            Ok(acceptor) => acceptor,
            // Bring-up failed on the main thread; just run down.
            Err(_) => return,
        };
        let task = Box::new(Task::Accept(acceptor));
        let accept_ud = task.into_user_data();
        let mut task = unsafe { Task::from_user_data(accept_ud) };
        if let Task::Accept(acceptor) = &mut *task {
            worker.push(acceptor.prep_accept().user_data(accept_ud));
        }
        let _ = task.into_user_data();
    }

    event_loop(&mut worker, &mut IoHandler);
}

fn recv_setup(
    setup_rx: mpsc::Receiver<io::Result<(RawFd, Arc<AtomicBool>)>>,
    name: Option<&str>,
) -> io::Result<(RawFd, Arc<AtomicBool>)> {
    match setup_rx.recv() {
        Ok(result) => result,
        Err(_) => Err(io::Error::other(format!(
            "worker {} died during setup",
            name.unwrap_or("?")
        ))),
    }
}

fn shutdown_workers(workers: &[WorkerHandle]) {
    for worker in workers {
        worker.active.store(false, Ordering::Relaxed);
        if let Err(e) = post_to_ring(worker.ring_fd, 0) {
            warn!("wake for shutdown: {e}");
        }
    }
}

fn join_workers(workers: Vec<WorkerHandle>) {
    for worker in workers {
        if worker.join.join().is_err() {
            error!("a worker thread panicked");
        }
    }
}

fn set_nofile_limit(limit: u64) {
    use nix::sys::resource::{setrlimit, Resource};
    if let Err(e) = setrlimit(Resource::RLIMIT_NOFILE, limit, limit) {
        warn!("setrlimit(RLIMIT_NOFILE, {limit}): {e}");
    }
}
