// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! State of a hart that other threads are allowed to touch.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

/// The part of a hart visible to device threads, other harts and the
/// flusher: the pending-interrupt mask, the exit-request word the JIT polls
/// at every block entry, and the parker WFI sleeps on.
///
/// Everything else about a hart is owned exclusively by its own thread.
pub(crate) struct HartShared {
    /// Pending interrupt bits, `mip` layout. Lock-free so device models can
    /// post from any thread.
    pub(crate) mip: AtomicU64,
    /// Nonzero when the hart should return to the loop top at the next safe
    /// point. Compiled blocks load this through a pointer in the hart state.
    pub(crate) exit_request: AtomicU32,
    token: Mutex<bool>,
    wake: Condvar,
}

impl HartShared {
    pub(crate) fn new() -> Self {
        Self {
            mip: AtomicU64::new(0),
            exit_request: AtomicU32::new(0),
            token: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    /// Asks the hart to come to its safe point and wakes it if parked.
    pub(crate) fn kick(&self) {
        self.exit_request.store(1, Ordering::Release);
        self.unpark();
    }

    pub(crate) fn clear_exit_request(&self) {
        self.exit_request.store(0, Ordering::Release);
    }

    #[inline]
    pub(crate) fn exit_requested(&self) -> bool {
        self.exit_request.load(Ordering::Acquire) != 0
    }

    /// Blocks the calling hart thread until someone calls [`Self::unpark`].
    /// Consumes at most one wake token, so a wake posted just before the
    /// park is not lost.
    pub(crate) fn park(&self) {
        let mut token = self.token.lock().expect("hart parker poisoned");
        while !*token {
            token = self.wake.wait(token).expect("hart parker poisoned");
        }
        *token = false;
    }

    pub(crate) fn unpark(&self) {
        let mut token = self.token.lock().expect("hart parker poisoned");
        *token = true;
        self.wake.notify_all();
    }

    pub(crate) fn raise(&self, mask: u64) {
        self.mip.fetch_or(mask, Ordering::AcqRel);
        self.kick();
    }

    pub(crate) fn clear(&self, mask: u64) {
        self.mip.fetch_and(!mask, Ordering::AcqRel);
    }
}
