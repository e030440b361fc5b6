//! Operation lifecycle: a reference-counted request/response pair.
//!
//! An [`Operation`] is a cheap handle over shared state. Cloning the handle
//! takes a reference, dropping it releases one; the request and response
//! buffers (and the linked response Operation, if any) are freed when the
//! last handle goes away.
//!
//! Buffers live behind a critical-section mutex because the same Operation
//! can be reached from a cport worker, the TX pending list and a caller
//! blocked in `send_request_sync` at the same time. The critical section is
//! only held to copy bytes in or out: payload closures run on a copy, so a
//! handler may call back into its Operation or the engine from inside one.

use core::cell::RefCell;
use core::fmt;
use core::time::Duration;
use std::sync::{Arc, Weak};
use std::time::Instant;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

use super::CportId;
use super::header::{
    HEADER_SIZE, ID_OFFSET, INVALID_TYPE, OpResult, OperationHeader, RESPONSE_FLAG,
    RESULT_OFFSET, frame_size,
};
use crate::error::{Error, Result};

/// Completion callback, invoked once with the pending Operation after its
/// response arrived or it timed out.
pub type Callback = Box<dyn FnOnce(&Operation) + Send>;

struct State {
    request: Vec<u8>,
    response: Option<Vec<u8>>,
    sent_at: Option<Instant>,
    callback: Option<Callback>,
    responded: bool,
    linked_response: Option<Operation>,
}

struct Inner {
    cport: CportId,
    state: Mutex<CriticalSectionRawMutex, RefCell<State>>,
}

/// Handle to a Greybus operation.
#[derive(Clone)]
pub struct Operation {
    inner: Arc<Inner>,
}

/// Non-owning handle; reports whether the Operation has been freed.
#[derive(Clone)]
pub struct WeakOperation(Weak<Inner>);

impl WeakOperation {
    pub fn upgrade(&self) -> Option<Operation> {
        self.0.upgrade().map(|inner| Operation { inner })
    }

    /// True once every handle is gone and both buffers have been dropped.
    pub fn is_released(&self) -> bool {
        self.0.strong_count() == 0
    }
}

/// Zero-filled buffer of `len` bytes, or `OutOfMemory`.
pub(crate) fn alloc_frame(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| Error::OutOfMemory)?;
    buf.resize(len, 0);
    Ok(buf)
}

// Buffers are never shorter than the header, so decoding cannot fail.
fn read_header(buf: &[u8]) -> OperationHeader {
    OperationHeader::decode(buf).unwrap_or(OperationHeader {
        size: 0,
        id: 0,
        op_type: INVALID_TYPE,
        result: 0,
    })
}

impl Operation {
    /// Fresh outbound request with a zero-filled payload and `id == 0`.
    pub(crate) fn new(cport: CportId, op_type: u8, payload_size: usize) -> Result<Self> {
        let hdr = OperationHeader::request(op_type, payload_size)?;
        let mut request = alloc_frame(hdr.size as usize)?;
        hdr.encode(&mut request).ok_or(Error::InvalidArgument)?;
        Ok(Self::from_request(cport, request))
    }

    /// Copy an inbound frame (header + payload) into a new Operation.
    /// `frame` must already be trimmed to the header's `size`.
    pub(crate) fn from_frame(cport: CportId, frame: &[u8]) -> Result<Self> {
        let mut request = alloc_frame(frame.len())?;
        request.copy_from_slice(frame);
        Ok(Self::from_request(cport, request))
    }

    fn from_request(cport: CportId, request: Vec<u8>) -> Self {
        let state = State {
            request,
            response: None,
            sent_at: None,
            callback: None,
            responded: false,
            linked_response: None,
        };
        Self {
            inner: Arc::new(Inner {
                cport,
                state: Mutex::new(RefCell::new(state)),
            }),
        }
    }

    fn lock<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        self.inner.state.lock(|cell| f(&mut cell.borrow_mut()))
    }

    pub fn cport(&self) -> CportId {
        self.inner.cport
    }

    // ── Reference counting ────────────────────────────────────

    /// Number of live handles.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn downgrade(&self) -> WeakOperation {
        WeakOperation(Arc::downgrade(&self.inner))
    }

    /// Release this handle. Equivalent to dropping it.
    pub fn destroy(self) {}

    /// True when both handles refer to the same Operation.
    pub fn ptr_eq(&self, other: &Operation) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ── Request side ──────────────────────────────────────────

    pub fn request_header(&self) -> OperationHeader {
        self.lock(|s| read_header(&s.request))
    }

    pub fn id(&self) -> u16 {
        self.request_header().id
    }

    pub fn op_type(&self) -> u8 {
        self.request_header().op_type
    }

    pub fn request_payload_size(&self) -> usize {
        self.request_header().payload_size()
    }

    pub fn with_request_payload<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.request_payload())
    }

    /// Runs `f` on a copy of the request payload, then writes the copy back.
    /// The payload length is fixed; `f` cannot grow or shrink it.
    pub fn with_request_payload_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut payload = self.request_payload();
        let out = f(&mut payload);
        self.lock(|s| s.request[HEADER_SIZE..].copy_from_slice(&payload));
        out
    }

    /// Copy of the request payload.
    pub fn request_payload(&self) -> Vec<u8> {
        self.lock(|s| s.request[HEADER_SIZE..].to_vec())
    }

    pub(crate) fn set_id(&self, id: u16) {
        self.lock(|s| s.request[ID_OFFSET..ID_OFFSET + 2].copy_from_slice(&id.to_le_bytes()));
    }

    /// Copy of the full request frame, for handing to the transport
    /// without holding the critical section.
    pub(crate) fn request_frame(&self) -> Result<Vec<u8>> {
        let len = self.lock(|s| s.request.len());
        let mut frame = alloc_frame(len)?;
        // The request buffer is never resized after creation.
        self.lock(|s| frame.copy_from_slice(&s.request));
        Ok(frame)
    }

    // ── Response side ─────────────────────────────────────────

    /// Allocate a response buffer with `payload_size` zeroed payload bytes,
    /// mirroring `id` and `type | RESPONSE_FLAG` from the request, and let
    /// `fill` write the payload. On failure any previous response buffer is
    /// left untouched.
    pub fn alloc_response<R>(
        &self,
        payload_size: usize,
        fill: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let req = self.request_header();
        let hdr = OperationHeader {
            size: frame_size(payload_size)?,
            id: req.id,
            op_type: req.op_type | RESPONSE_FLAG,
            result: 0,
        };
        let mut buf = alloc_frame(hdr.size as usize)?;
        hdr.encode(&mut buf).ok_or(Error::InvalidArgument)?;
        let out = fill(&mut buf[HEADER_SIZE..]);
        self.lock(|s| s.response = Some(buf));
        Ok(out)
    }

    pub fn response_header(&self) -> Option<OperationHeader> {
        self.lock(|s| s.response.as_deref().map(read_header))
    }

    pub fn with_response_payload<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let payload = self.lock(|s| s.response.as_deref().map(|buf| buf[HEADER_SIZE..].to_vec()));
        payload.map(|p| f(&p))
    }

    pub fn has_responded(&self) -> bool {
        self.lock(|s| s.responded)
    }

    /// The response Operation attached by correlation, if one arrived.
    pub fn response(&self) -> Option<Operation> {
        self.lock(|s| s.linked_response.clone())
    }

    /// Result delivered for this operation: the linked response's result,
    /// else the result stamped in the local response buffer (a synthesized
    /// timeout, or the reply this side sent).
    pub fn result(&self) -> Option<OpResult> {
        if let Some(resp) = self.response() {
            return Some(resp.request_header().op_result());
        }
        self.response_header().map(|h| h.op_result())
    }

    /// Take the response buffer for transmission, stamping `result` and
    /// marking the operation responded. Returns the frame and whether it
    /// was allocated here.
    pub(crate) fn take_response(&self, result: OpResult) -> Result<(Vec<u8>, bool)> {
        let lazily = self.lock(|s| {
            if s.responded {
                Err(Error::InvalidState)
            } else {
                Ok(s.response.is_none())
            }
        })?;
        if lazily {
            self.alloc_response(0, |_| ())?;
        }
        self.lock(|s| {
            if s.responded {
                return Err(Error::InvalidState);
            }
            let mut frame = s.response.take().ok_or(Error::InvalidState)?;
            frame[RESULT_OFFSET] = result.code();
            s.responded = true;
            Ok((frame, lazily))
        })
    }

    /// Put a transmitted response back. A failed send clears `responded`
    /// and discards a buffer that was only allocated for the send.
    pub(crate) fn restore_response(&self, frame: Vec<u8>, lazily: bool, sent: bool) {
        self.lock(|s| {
            if sent {
                s.response = Some(frame);
            } else {
                s.responded = false;
                if !lazily {
                    s.response = Some(frame);
                }
            }
        });
    }

    // ── Pending-request bookkeeping ───────────────────────────

    pub fn sent_at(&self) -> Option<Instant> {
        self.lock(|s| s.sent_at)
    }

    pub(crate) fn arm(&self, now: Instant, callback: Option<Callback>) {
        self.lock(|s| {
            s.sent_at = Some(now);
            s.callback = callback;
        });
    }

    /// Undo [`arm`](Self::arm) after a failed send; the callback is dropped
    /// without running.
    pub(crate) fn disarm(&self) {
        let callback = self.lock(|s| {
            s.sent_at = None;
            s.callback.take()
        });
        drop(callback);
    }

    pub(crate) fn has_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        self.sent_at()
            .is_some_and(|t| now.saturating_duration_since(t) > timeout)
    }

    pub(crate) fn attach_response(&self, response: Operation) {
        self.lock(|s| s.linked_response = Some(response));
    }

    /// Install a header-only response carrying `Timeout`.
    pub(crate) fn set_timeout_response(&self) {
        self.lock(|s| {
            let req = read_header(&s.request);
            let hdr = OperationHeader {
                size: HEADER_SIZE as u16,
                id: req.id,
                op_type: req.op_type | RESPONSE_FLAG,
                result: OpResult::Timeout.code(),
            };
            s.response = Some(hdr.to_bytes().to_vec());
        });
    }

    /// Run the completion callback, if any, outside the critical section.
    pub(crate) fn complete(&self) {
        let callback = self.lock(|s| s.callback.take());
        if let Some(cb) = callback {
            cb(self);
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hdr = self.request_header();
        f.debug_struct("Operation")
            .field("cport", &self.cport())
            .field("id", &hdr.id)
            .field("type", &format_args!("{:#04x}", hdr.op_type))
            .field("size", &hdr.size)
            .field("refs", &self.ref_count())
            .finish()
    }
}
