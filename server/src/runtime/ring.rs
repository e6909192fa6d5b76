// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use io_uring::{opcode, squeue, types, IoUring};
use log::*;

use crate::config::Config;
use crate::runtime::buf_ring::BufRing;

/// All workers share buffer-ring group id 0.
pub const BUF_GROUP_ID: u16 = 0;

/// Size of one provisioned buffer-ring entry and of the owned query buffer:
/// a recv never returns more than this.
pub const IO_BUFFER_SIZE: usize = 1024 * 16;

/// The completion-wait tick; the loop wakes at least this often to check
/// the active flag.
const WAIT_TICK_NSEC: u32 = 25_000_000;

#[derive(Debug, Clone)]
pub struct RingConfig {
    pub name: String,
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub sqpoll: bool,
    pub max_registered_fds: u32,
    pub submit_batch_size: u32,
    pub wait_batch_size: u32,
    /// CPU to pin the worker thread to. SQPOLL claims the next CPU up for
    /// the kernel's submission thread.
    pub cpu: Option<usize>,
}

impl RingConfig {
    pub fn data_worker(config: &Config) -> Self {
        RingConfig {
            name: "dss".to_string(),
            sq_entries: 4096,
            cq_entries: 65536,
            sqpoll: config.sqpoll,
            max_registered_fds: 0,
            submit_batch_size: config.submit_batch_size,
            wait_batch_size: config.wait_batch_size,
            cpu: Some(0),
        }
    }

    pub fn io_worker(index: usize, config: &Config) -> Self {
        let cpu_base = if config.sqpoll { 2 } else { 1 };
        RingConfig {
            name: format!("cli_exr_{index}"),
            sq_entries: 4096,
            cq_entries: 65536,
            sqpoll: false,
            max_registered_fds: config.max_direct_fds_per_exr,
            submit_batch_size: config.submit_batch_size,
            wait_batch_size: config.wait_batch_size,
            cpu: Some(cpu_base + index),
        }
    }
}

/// A worker's completion ring plus the per-worker resources submissions can
/// name: registered-fd slots and the provisioned buffer ring. Constructed on
/// the worker's own thread (the ring is single-issuer).
pub struct RingWorker {
    name: String,
    ring: IoUring,
    active: Arc<AtomicBool>,
    fd_slots: Vec<u32>,
    buf_ring: Option<BufRing>,
    submit_batch_size: u32,
    wait_batch_size: u32,
}

impl RingWorker {
    pub fn new(config: &RingConfig) -> io::Result<Self> {
        if let Some(cpu) = config.cpu {
            set_thread_affinity(cpu, config.sqpoll);
        }

        let mut builder = IoUring::builder();
        builder
            .setup_cqsize(config.cq_entries)
            .setup_single_issuer();
        if config.sqpoll {
            builder.setup_sqpoll(1000);
        } else {
            builder.setup_coop_taskrun().setup_taskrun_flag();
        }
        let ring = builder.build(config.sq_entries)?;

        let mut fd_slots = Vec::new();
        if config.max_registered_fds > 0 {
            ring.submitter()
                .register_files_sparse(config.max_registered_fds)?;
            fd_slots.extend(0..config.max_registered_fds);
        }

        info!(
            "worker {} ring fd {} ({} registered-fd slots)",
            config.name,
            ring.as_raw_fd(),
            fd_slots.len()
        );
        Ok(RingWorker {
            name: config.name.clone(),
            ring,
            active: Arc::new(AtomicBool::new(true)),
            fd_slots,
            buf_ring: None,
            submit_batch_size: config.submit_batch_size.max(1),
            wait_batch_size: config.wait_batch_size.max(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ring_fd(&self) -> RawFd {
        self.ring.as_raw_fd()
    }

    pub fn active_flag(&self) -> Arc<AtomicBool> {
        self.active.clone()
    }

    /// Sets up the provisioned buffer ring for buffer-selecting receives.
    pub fn enable_buf_ring(&mut self, entries: u16) -> io::Result<()> {
        let buf_ring = BufRing::new(
            self.ring.submitter(),
            entries,
            IO_BUFFER_SIZE as u32,
            BUF_GROUP_ID,
        )?;
        info!(
            "worker {}: buffer ring with {} entries of {} bytes",
            self.name, entries, IO_BUFFER_SIZE
        );
        self.buf_ring = Some(buf_ring);
        Ok(())
    }

    pub fn buf_ring_mut(&mut self) -> Option<&mut BufRing> {
        self.buf_ring.as_mut()
    }

    /// Enqueues one submission, draining the queue with `submit` when full.
    /// A submit failure here is unrecoverable.
    pub fn push(&mut self, entry: squeue::Entry) {
        loop {
            // SAFETY: every entry built by this crate keeps its referenced
            // buffers alive in the leaked task until the completion arrives.
            if unsafe { self.ring.submission().push(&entry) }.is_ok() {
                return;
            }
            self.ring
                .submit()
                .unwrap_or_else(|e| panic!("{}: submit: {e}", self.name));
        }
    }

    /// Publishes `fd` into a registered-fd slot, if one is free. Operations
    /// on a registered connection use the fixed-file fast path.
    pub fn register_fd(&mut self, fd: RawFd) -> Option<u32> {
        let slot = self.fd_slots.pop()?;
        match self.ring.submitter().register_files_update(slot, &[fd]) {
            Ok(_) => Some(slot),
            Err(e) => panic!("{}: register_files_update: {e}", self.name),
        }
    }

    pub fn unregister_fd(&mut self, slot: u32) {
        self.fd_slots.push(slot);
    }
}

pub trait CompletionHandler {
    fn on_completion(&mut self, worker: &mut RingWorker, user_data: u64, result: i32, flags: u32);
}

/// The worker loop: submit pending entries and wait up to ~25 ms for
/// completions, then dispatch each completion to the handler. A user_data of
/// zero is a bare wake-up (used by deactivation). Runs until the active
/// flag drops.
pub fn event_loop<H: CompletionHandler>(worker: &mut RingWorker, handler: &mut H) {
    let tick = types::Timespec::new().nsec(WAIT_TICK_NSEC);
    let mut completions: Vec<(u64, i32, u32)> = Vec::with_capacity(1024);
    let active = worker.active_flag();

    while active.load(Ordering::Relaxed) {
        let args = types::SubmitArgs::new().timespec(&tick);
        match worker
            .ring
            .submitter()
            .submit_with_args(worker.wait_batch_size as usize, &args)
        {
            Ok(_) => {}
            Err(e) => match e.raw_os_error() {
                Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY)
                | Some(libc::EAGAIN) => {}
                _ => panic!("{}: submit_with_args: {e}", worker.name),
            },
        }

        completions.clear();
        {
            let completion = worker.ring.completion();
            if completion.overflow() > 0 {
                warn!("{}: completion queue overflow", worker.name);
            }
            for cqe in completion {
                completions.push((cqe.user_data(), cqe.result(), cqe.flags()));
            }
        }

        for (index, (user_data, result, flags)) in completions.iter().enumerate() {
            if *user_data == 0 {
                continue;
            }
            handler.on_completion(worker, *user_data, *result, *flags);
            if (index + 1) % worker.submit_batch_size as usize == 0 {
                if let Err(e) = worker.ring.submit() {
                    panic!("{}: submit: {e}", worker.name);
                }
            }
        }
    }
    info!("worker {} exiting", worker.name);
}

/// Sends a bare message to another worker's ring from any thread, through a
/// short-lived local ring. The destination sees one completion carrying
/// `user_data`: zero wakes the loop, anything else resumes the task it
/// points to. This is also the deactivation kick.
pub fn post_to_ring(ring_fd: RawFd, user_data: u64) -> io::Result<()> {
    let mut ring = IoUring::new(4)?;
    let entry = opcode::MsgRingData::new(types::Fd(ring_fd), 0, user_data, None)
        .build()
        .flags(squeue::Flags::SKIP_SUCCESS);
    // SAFETY: MsgRingData carries no pointers.
    unsafe {
        ring.submission()
            .push(&entry)
            .expect("fresh ring has queue space");
    }
    ring.submit()?;
    Ok(())
}

fn set_thread_affinity(cpu: usize, sqpoll: bool) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    let mut cpus = vec![cpu];
    if sqpoll {
        cpus.push(cpu + 1);
    }
    for cpu in cpus {
        if set.set(cpu).is_err() {
            warn!("cpu {cpu} out of range for affinity mask");
            return;
        }
    }
    if let Err(e) = sched_setaffinity(Pid::from_raw(0), &set) {
        warn!("sched_setaffinity: {e}");
    }
}
