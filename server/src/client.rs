// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The per-connection pipeline: recv, parse, hop to the data worker,
//! invoke, hop back, reply. Written as an explicit state machine advanced
//! by ring completions; the state names the event the client is suspended
//! on. One operation is in flight per connection at any time.

use std::os::fd::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use io_uring::{cqueue, opcode, squeue, types};
use log::*;
use nix::errno::Errno;

use resp::buffer::Buffer;
use resp::parser::{parse_inline, ArgViews, MultiBulkParser, ParserState};
use resp::replier::{needs_gather, reply_to_iovecs, reply_to_view};
use resp::reply::{ErrorKind, Reply};

use crate::io::Connection;
use crate::runtime::ring::{RingWorker, BUF_GROUP_ID, IO_BUFFER_SIZE};
use crate::runtime::task::Disposition;
use crate::server::Shared;
use crate::service::DataStructureService;

/// Initial output buffer size; replies beyond it grow on demand.
const OUTPUT_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Newly accepted; the first event starts the pipeline on the owning
    /// I/O worker.
    Start,
    /// A recv is in flight.
    Receiving,
    /// Handed to the data worker; an event on the I/O ring in this state is
    /// a failed ring message.
    Invoking,
    /// Back from the data worker with the reply filled in.
    Responding,
    /// A send or writev is in flight.
    Replying,
}

pub struct Client {
    conn: Connection,
    /// Ring of the I/O worker this client lives on; the data worker sends
    /// the resumption message here.
    io_ring_fd: RawFd,
    dss_ring_fd: RawFd,
    shared: Arc<Shared>,
    use_buf_ring: bool,

    query: Buffer,
    output: Buffer,
    /// Created on the first multi-bulk request and reused after.
    parser: Option<MultiBulkParser>,
    /// Parsed argument views; storage is kept across commands.
    args: ArgViews,
    num_args: usize,
    reply: Reply,
    iovecs: Vec<libc::iovec>,

    state: ClientState,
    /// Buffer-ring entry currently loaned into `query`, if any.
    loan_entry: Option<u16>,
}

impl Client {
    pub fn new(
        conn: Connection,
        io_ring_fd: RawFd,
        dss_ring_fd: RawFd,
        shared: Arc<Shared>,
        use_buf_ring: bool,
    ) -> Self {
        let query = if use_buf_ring {
            Buffer::with_capacity(0)
        } else {
            Buffer::with_capacity(IO_BUFFER_SIZE)
        };
        Client {
            conn,
            io_ring_fd,
            dss_ring_fd,
            shared,
            use_buf_ring,
            query,
            output: Buffer::with_capacity(OUTPUT_BUFFER_SIZE),
            parser: None,
            args: ArgViews::new(),
            num_args: 0,
            reply: Reply::default(),
            iovecs: Vec::new(),
            state: ClientState::Start,
            loan_entry: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn io_ring_fd(&self) -> RawFd {
        self.io_ring_fd
    }

    /// Advances the state machine for a completion on the I/O worker.
    pub fn on_io_event(
        &mut self,
        worker: &mut RingWorker,
        user_data: u64,
        result: i32,
        flags: u32,
    ) -> Disposition {
        match self.state {
            ClientState::Start => {
                self.conn.try_register(worker);
                self.submit_recv(worker, user_data);
                Disposition::Pending
            }
            ClientState::Receiving => self.on_recv(worker, user_data, result, flags),
            ClientState::Invoking => {
                error!(
                    "ring message to data worker failed: {}",
                    Errno::from_raw(-result)
                );
                self.close(worker);
                Disposition::Done
            }
            ClientState::Responding => {
                // The command ran; the loaned bytes are no longer needed.
                self.discard_loan(worker);
                self.submit_reply(worker, user_data);
                Disposition::Pending
            }
            ClientState::Replying => self.on_reply_complete(worker, user_data, result),
        }
    }

    /// Runs the parsed command against the service. Called on the data
    /// worker; the argument views resolve into this client's query buffer,
    /// which is untouched while the client is suspended here.
    pub fn on_data_event(&mut self, service: &mut DataStructureService) {
        debug_assert_eq!(self.state, ClientState::Invoking);
        {
            let Client {
                query,
                args,
                num_args,
                reply,
                ..
            } = &mut *self;
            let argv: Vec<&[u8]> = args[..*num_args].iter().map(|v| v.slice(query)).collect();
            service.invoke(&argv, reply);
        }
        self.state = ClientState::Responding;
    }

    /// Closes the connection without touching worker-owned resources. Used
    /// when the client dies on the data worker.
    pub fn abandon(&mut self) {
        let fd = self.conn.fd();
        self.conn.close();
        self.shared.manager.remove(fd);
    }

    fn on_recv(
        &mut self,
        worker: &mut RingWorker,
        user_data: u64,
        result: i32,
        flags: u32,
    ) -> Disposition {
        if result < 0 {
            debug!("recv: {}", Errno::from_raw(-result));
            self.close(worker);
            return Disposition::Done;
        }
        if result == 0 {
            trace!("peer closed fd {}", self.conn.fd());
            self.close(worker);
            return Disposition::Done;
        }
        let received = result as usize;

        if self.use_buf_ring {
            let entry_id = match cqueue::buffer_select(flags) {
                Some(id) => id,
                None => {
                    warn!("recv completed without a selected buffer");
                    self.close(worker);
                    return Disposition::Done;
                }
            };
            let block = worker
                .buf_ring_mut()
                .expect("buffer ring enabled")
                .take(entry_id);
            if self.query.unread() == 0 && !self.parse_in_progress() {
                // Whole-command fast path: parse straight out of the ring
                // entry.
                self.query.install_loan(block, received);
                self.loan_entry = Some(entry_id);
            } else {
                // A command is spanning receives; accumulate in owned
                // storage so earlier argument offsets stay valid.
                self.query.ensure_available(received, false);
                self.query.sink()[..received].copy_from_slice(&block[..received]);
                self.query.produce(received);
                worker
                    .buf_ring_mut()
                    .expect("buffer ring enabled")
                    .put(entry_id, block);
            }
        } else {
            self.query.produce(received);
        }
        self.shared
            .manager
            .stats
            .net_input_bytes
            .fetch_add(received as u64, Ordering::Relaxed);

        match self.parse() {
            ParserState::Init | ParserState::Parsing => {
                // Partial command: move any loan into owned storage and
                // keep receiving.
                self.adopt_loan(worker);
                self.submit_recv(worker, user_data);
                Disposition::Pending
            }
            ParserState::Error => {
                self.reply = Reply::Err(ErrorKind::Protocol);
                self.discard_loan(worker);
                self.submit_reply(worker, user_data);
                Disposition::Pending
            }
            ParserState::Done => {
                if self.num_args == 0 {
                    // An empty request (e.g. `*0`); nothing to run.
                    self.reset_round(worker);
                    self.submit_recv(worker, user_data);
                    return Disposition::Pending;
                }
                self.state = ClientState::Invoking;
                self.push_transfer(worker, self.dss_ring_fd, user_data);
                Disposition::Pending
            }
        }
    }

    fn on_reply_complete(
        &mut self,
        worker: &mut RingWorker,
        user_data: u64,
        result: i32,
    ) -> Disposition {
        if result < 0 {
            error!("send/writev: {}", Errno::from_raw(-result));
            self.close(worker);
            return Disposition::Done;
        }
        if result == 0 {
            self.close(worker);
            return Disposition::Done;
        }
        self.shared
            .manager
            .stats
            .net_output_bytes
            .fetch_add(result as u64, Ordering::Relaxed);
        self.shared
            .manager
            .update_max_output_buffer(self.output.capacity() as u64);

        self.reset_round(worker);
        self.submit_recv(worker, user_data);
        Disposition::Pending
    }

    fn parse(&mut self) -> ParserState {
        if self.parse_in_progress() || self.query.source().first() == Some(&b'*') {
            let parser = self.parser.get_or_insert_with(MultiBulkParser::new);
            let state = parser.parse(&mut self.query, &mut self.args);
            if state == ParserState::Done {
                self.num_args = parser.result_size();
            }
            state
        } else {
            parse_inline(&mut self.query, &mut self.args, &mut self.num_args)
        }
    }

    fn parse_in_progress(&self) -> bool {
        self.parser.as_ref().map_or(false, |p| p.in_progress())
    }

    fn submit_recv(&mut self, worker: &mut RingWorker, user_data: u64) {
        self.state = ClientState::Receiving;
        let entry = if self.use_buf_ring {
            self.conn.prep_buf_recv(BUF_GROUP_ID)
        } else {
            let greedy = self.query.capacity() < IO_BUFFER_SIZE;
            self.query.ensure_available(IO_BUFFER_SIZE, greedy);
            self.shared
                .manager
                .update_max_input_buffer(self.query.capacity() as u64);
            self.conn.prep_recv(self.query.sink())
        };
        worker.push(entry.user_data(user_data));
    }

    fn submit_reply(&mut self, worker: &mut RingWorker, user_data: u64) {
        self.state = ClientState::Replying;
        self.output.reset();
        self.iovecs.clear();
        let entry = if needs_gather(&self.reply) {
            reply_to_iovecs(&self.reply, &mut self.output, &mut self.iovecs);
            self.conn.prep_writev(&self.iovecs)
        } else {
            let view = reply_to_view(&self.reply, &mut self.output);
            self.conn.prep_send(view)
        };
        worker.push(entry.user_data(user_data));
    }

    /// The cross-worker hand-off: a ring message to `dest_ring` carrying
    /// this task's pointer. Success is suppressed on the sending ring, so
    /// the next event for this client fires on the destination.
    fn push_transfer(&self, worker: &mut RingWorker, dest_ring: RawFd, user_data: u64) {
        let entry = opcode::MsgRingData::new(types::Fd(dest_ring), 0, user_data, None)
            .build()
            .flags(squeue::Flags::SKIP_SUCCESS)
            .user_data(user_data);
        worker.push(entry);
    }

    fn reset_round(&mut self, worker: &mut RingWorker) {
        self.discard_loan(worker);
        self.query.reset();
        self.output.reset();
        self.reply.reset();
        self.iovecs.clear();
        self.num_args = 0;
    }

    /// Returns the loaned ring entry, dropping its bytes.
    fn discard_loan(&mut self, worker: &mut RingWorker) {
        if let Some(entry_id) = self.loan_entry.take() {
            let block = self.query.take_loan().expect("loan entry recorded");
            worker
                .buf_ring_mut()
                .expect("buffer ring enabled")
                .put(entry_id, block);
        }
    }

    /// Copies the loaned bytes into owned storage (offsets preserved) and
    /// returns the ring entry.
    fn adopt_loan(&mut self, worker: &mut RingWorker) {
        if let Some(entry_id) = self.loan_entry.take() {
            let block = self.query.adopt_loan();
            worker
                .buf_ring_mut()
                .expect("buffer ring enabled")
                .put(entry_id, block);
        }
    }

    fn close(&mut self, worker: &mut RingWorker) {
        let fd = self.conn.fd();
        self.discard_loan(worker);
        self.conn.release_slot(worker);
        self.conn.close();
        self.shared.manager.remove(fd);
    }
}
