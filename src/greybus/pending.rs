//! Outstanding-request bookkeeping for one cport.
//!
//! Every request sent with `need_response` sits here, holding its own
//! reference, until its response arrives or it is reaped as timed out.
//! There is no timer: expired entries are reaped during the same linear
//! scan that matches an inbound response, so a request on an otherwise
//! silent cport stays pending until the next response arrives (or until
//! the host calls `Greybus::reap_expired`).

use core::cell::RefCell;
use core::time::Duration;
use std::time::Instant;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{debug, warn};

use super::operation::Operation;
use crate::error::{Error, Result};

/// Maximum outstanding requests per cport.
pub const TX_PENDING_DEPTH: usize = 32;

type PendingList = heapless::Vec<Operation, TX_PENDING_DEPTH>;

/// What one correlation pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Outcome {
    pub timed_out: usize,
    pub matched: bool,
}

pub(crate) struct TxPending {
    list: Mutex<CriticalSectionRawMutex, RefCell<PendingList>>,
}

impl TxPending {
    pub fn new() -> Self {
        Self {
            list: Mutex::new(RefCell::new(heapless::Vec::new())),
        }
    }

    /// Append an entry. The list takes ownership of the reference.
    pub fn push(&self, op: Operation) -> Result<()> {
        self.list
            .lock(|cell| cell.borrow_mut().push(op))
            .map_err(|_| Error::OutOfMemory)
    }

    /// Detach `op` if it is still listed.
    pub fn remove(&self, op: &Operation) -> Option<Operation> {
        self.list.lock(|cell| {
            let mut list = cell.borrow_mut();
            let idx = list.iter().position(|p| p.ptr_eq(op))?;
            Some(list.remove(idx))
        })
    }

    pub fn len(&self) -> usize {
        self.list.lock(|cell| cell.borrow().len())
    }

    /// Detach every expired entry and, if `response_id` is given, the first
    /// live entry with that id. An entry that has expired is reaped even
    /// when its response is the one arriving.
    fn scan(
        &self,
        now: Instant,
        timeout: Duration,
        response_id: Option<u16>,
    ) -> (PendingList, Option<Operation>) {
        let mut expired = PendingList::new();
        let mut matched = None;

        self.list.lock(|cell| {
            let mut list = cell.borrow_mut();
            let mut i = 0;
            while i < list.len() {
                if list[i].has_timed_out(now, timeout) {
                    // Both vectors share one capacity, so this cannot fail.
                    let _ = expired.push(list.remove(i));
                    continue;
                }
                if matched.is_none() && response_id == Some(list[i].id()) {
                    matched = Some(list.remove(i));
                    continue;
                }
                i += 1;
            }
        });

        (expired, matched)
    }

    /// Correlate an inbound response against the list, reaping expired
    /// entries along the way. Callbacks run after the list is released.
    pub fn process_response(&self, response: &Operation, timeout: Duration) -> Outcome {
        let (expired, matched) = self.scan(Instant::now(), timeout, Some(response.id()));
        let timed_out = expired.len();
        expired.into_iter().for_each(expire);

        let matched = match matched {
            Some(op) => {
                op.attach_response(response.clone());
                op.complete();
                true
            }
            None => {
                debug!(
                    "GB[{}]: no pending request for response id {}",
                    response.cport(),
                    response.id()
                );
                false
            }
        };

        Outcome { timed_out, matched }
    }

    /// Reap expired entries without a response to match.
    pub fn reap(&self, timeout: Duration) -> usize {
        let (expired, _) = self.scan(Instant::now(), timeout, None);
        let n = expired.len();
        expired.into_iter().for_each(expire);
        n
    }
}

/// Deliver a synthesized `Timeout` response and drop the list's reference.
fn expire(op: Operation) {
    warn!(
        "GB[{}]: request id {} (type {:#04x}) timed out",
        op.cport(),
        op.id(),
        op.op_type()
    );
    op.set_timeout_response();
    op.complete();
}
