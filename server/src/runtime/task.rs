// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use crate::client::Client;
use crate::server::{Acceptor, Cron};

/// Every in-flight operation's user_data is a pointer to one of these. A
/// task is "leaked" into the kernel while its operation is pending and
/// reclaimed when the completion (or a ring message carrying the same
/// pointer) is processed — the suspended-coroutine protocol, spelled out.
///
/// Soundness rests on one rule: a task has at most one outstanding
/// operation at a time, so exactly one future completion holds its pointer.
pub enum Task {
    Accept(Acceptor),
    Client(Client),
    Cron(Cron),
}

/// What the dispatcher should do with a task after it handled an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Another operation is in flight; leak the task again.
    Pending,
    /// The task is finished; drop it.
    Done,
}

impl Task {
    /// Temporarily leaks the task so the kernel side can hold it until the
    /// completion is processed. Exposes provenance so the pointer can be
    /// reconstructed from the raw completion value.
    pub fn into_user_data(self: Box<Self>) -> u64 {
        Box::into_raw(self).expose_provenance() as u64
    }

    /// Reclaims a task previously leaked with `into_user_data`.
    ///
    /// SAFETY: `user_data` must come from `into_user_data` and must not have
    /// been reclaimed since.
    pub unsafe fn from_user_data(user_data: u64) -> Box<Self> {
        Box::from_raw(std::ptr::with_exposed_provenance_mut::<Task>(
            user_data as usize,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Cron;

    #[test]
    fn user_data_roundtrip() {
        let task = Box::new(Task::Cron(Cron::new(100)));
        let user_data = task.into_user_data();
        assert_ne!(user_data, 0);
        let task = unsafe { Task::from_user_data(user_data) };
        match *task {
            Task::Cron(cron) => assert_eq!(cron.interval_ticks(), 100),
            _ => panic!("wrong variant after roundtrip"),
        }
    }
}
