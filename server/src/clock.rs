// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::cell::Cell;
use std::time::{SystemTime, UNIX_EPOCH};

/// System-clock milliseconds since the Unix epoch. All expiration instants
/// and command-time snapshots are in this unit.
pub type UnixMillis = i64;

/// The data worker's clock. The system mode reads the wall clock; the
/// manual mode is driven explicitly so service tests can advance time
/// between commands.
pub struct Clock {
    manual: Option<Cell<UnixMillis>>,
}

impl Clock {
    pub fn system() -> Self {
        Clock { manual: None }
    }

    pub fn manual(start: UnixMillis) -> Self {
        Clock {
            manual: Some(Cell::new(start)),
        }
    }

    pub fn now(&self) -> UnixMillis {
        match &self.manual {
            Some(time) => time.get(),
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("system clock before the epoch")
                .as_millis() as UnixMillis,
        }
    }

    pub fn set(&self, time: UnixMillis) {
        self.manual
            .as_ref()
            .expect("set on a system clock")
            .set(time);
    }

    pub fn advance(&self, delta: UnixMillis) {
        let manual = self.manual.as_ref().expect("advance on a system clock");
        manual.set(manual.get() + delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_is_driven_explicitly() {
        let clock = Clock::manual(1_000);
        assert_eq!(clock.now(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now(), 1_500);
        clock.set(10);
        assert_eq!(clock.now(), 10);
    }

    #[test]
    fn system_clock_moves() {
        let clock = Clock::system();
        assert!(clock.now() > 1_600_000_000_000); // after 2020
    }
}
