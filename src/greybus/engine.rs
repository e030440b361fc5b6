//! The Greybus engine: cport table, receive path, request/response flow.
//!
//! [`Greybus`] is a cloneable handle over the engine state. The host creates
//! it once with [`Greybus::init`], registers a driver per cport, and feeds
//! inbound frames in through [`Greybus::on_receive`]. Everything else
//! (dispatch, response correlation, timeout reaping) happens on the
//! per-cport worker threads.
//!
//! ```text
//!            transport                      worker (gb-cport<N>)
//!   frame ──▶ on_receive ──┬─ fast handler ──▶ (inline, done)
//!                          │
//!                          └─ RX FIFO ──▶ dispatch
//!                                           ├─ request  ──▶ handler ──▶ send_response
//!                                           └─ response ──▶ TX pending scan
//!                                                             ├─ match   ──▶ callback
//!                                                             └─ expired ──▶ Timeout + callback
//! ```
//!
//! Locks are only ever held for bookkeeping. The transport, handlers and
//! completion callbacks always run with no engine lock held, so they are
//! free to call back into the engine.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use core::time::Duration;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use burster::Limiter;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use log::{debug, info, trace, warn};

use super::CportId;
use super::driver::{CportDriver, OperationHandler};
use super::header::{OpResult, OperationHeader};
use super::operation::{Callback, Operation};
use super::pending::TxPending;
use super::transport::TransportBackend;
use super::worker::{self, RxFifo};
use crate::config::GreybusConfig;
use crate::diagnostics::{CportCounters, CportStats};
use crate::error::{Error, Result};

struct CportSlot {
    /// Set while a registration owns (or is installing into) this slot.
    claimed: AtomicBool,
    /// Published once the driver is fully initialised and its worker runs.
    driver: OnceLock<Arc<CportDriver>>,
    worker: OnceLock<JoinHandle<()>>,
    rx_fifo: RxFifo,
    pending: TxPending,
    counters: CportCounters,
}

impl CportSlot {
    fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            driver: OnceLock::new(),
            worker: OnceLock::new(),
            rx_fifo: RxFifo::new(),
            pending: TxPending::new(),
            counters: CportCounters::default(),
        }
    }
}

struct Shared {
    transport: Arc<dyn TransportBackend>,
    config: GreybusConfig,
    cports: Box<[CportSlot]>,
    next_id: AtomicU16,
    drop_log: Mutex<CriticalSectionRawMutex, RefCell<burster::TokenBucket<fn() -> Duration>>>,
}

/// Handle to the Greybus engine. Clones share the same state.
#[derive(Clone)]
pub struct Greybus {
    shared: Arc<Shared>,
}

impl Greybus {
    /// Bring the engine up on `transport`.
    ///
    /// The transport's `init` runs once here. The cport count it reports
    /// fixes the size of the cport table for the engine's lifetime.
    pub fn init<T: TransportBackend + 'static>(
        transport: Arc<T>,
        config: GreybusConfig,
    ) -> Result<Self> {
        let count = transport.cport_count();
        if count == 0 {
            return Err(Error::InvalidArgument);
        }
        let cports: Box<[CportSlot]> = (0..count).map(|_| CportSlot::new()).collect();

        transport.init()?;

        info!(
            "GB: engine up, {} cports, request timeout {}ms",
            count, config.request_timeout_ms
        );

        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                config,
                cports,
                next_id: AtomicU16::new(0),
                drop_log: Mutex::new(RefCell::new(
                    burster::TokenBucket::new_with_time_provider(
                        10,
                        10, // 10 warnings per second, 10 burst capacity
                        platform_now as fn() -> Duration,
                    ),
                )),
            }),
        })
    }

    pub fn cport_count(&self) -> CportId {
        // The table was built from a CportId count.
        self.shared.cports.len() as CportId
    }

    pub fn config(&self) -> &GreybusConfig {
        &self.shared.config
    }

    fn slot(&self, cport: CportId) -> Result<&CportSlot> {
        self.shared
            .cports
            .get(usize::from(cport))
            .ok_or(Error::InvalidArgument)
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.shared.config.request_timeout_ms))
    }

    pub(crate) fn rx_fifo(&self, cport: CportId) -> Option<&RxFifo> {
        self.slot(cport).ok().map(|s| &s.rx_fifo)
    }

    // ── Driver registration ───────────────────────────────────

    /// Bind `driver` to `cport` and start its worker.
    ///
    /// The handler table is validated and sorted, the init hook runs, then
    /// the worker is spawned. The driver becomes visible to the receive path
    /// only after all of that succeeded; on any failure the cport is left
    /// unregistered.
    pub fn register_driver(&self, cport: CportId, driver: CportDriver) -> Result<()> {
        let slot = self.slot(cport)?;
        if slot
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyExists);
        }

        let result = self.install(cport, slot, driver);
        if let Err(e) = result {
            warn!("GB[{}]: driver registration failed: {}", cport, e);
            slot.claimed.store(false, Ordering::Release);
        }
        result
    }

    fn install(&self, cport: CportId, slot: &CportSlot, mut driver: CportDriver) -> Result<()> {
        driver.prepare()?;
        driver.run_init(cport)?;

        let driver = Arc::new(driver);
        let stack = driver
            .requested_stack_size()
            .unwrap_or(self.shared.config.default_stack_size);

        let handle = match worker::spawn(self.clone(), cport, driver.clone(), stack) {
            Ok(handle) => handle,
            Err(e) => {
                driver.run_exit(cport);
                return Err(e);
            }
        };

        // The claim guarantees both cells are still empty.
        let _ = slot.worker.set(handle);
        let name = driver.name();
        let handlers = driver.handler_count();
        let _ = slot.driver.set(driver);

        info!(
            "GB[{}]: registered '{}' ({} handlers)",
            cport, name, handlers
        );
        Ok(())
    }

    pub fn is_registered(&self, cport: CportId) -> bool {
        self.driver(cport).is_some()
    }

    /// Name of the driver bound to `cport`, if any.
    pub fn driver_name(&self, cport: CportId) -> Option<&'static str> {
        self.driver(cport).map(|d| d.name())
    }

    fn driver(&self, cport: CportId) -> Option<&Arc<CportDriver>> {
        self.slot(cport).ok()?.driver.get()
    }

    fn registered(&self, cport: CportId) -> Result<&CportSlot> {
        let slot = self.slot(cport)?;
        if slot.driver.get().is_none() {
            return Err(Error::InvalidArgument);
        }
        Ok(slot)
    }

    /// Ask the transport to start delivering traffic for a registered cport.
    pub fn listen(&self, cport: CportId) -> Result<()> {
        self.registered(cport)?;
        self.shared.transport.listen(cport)?;
        debug!("GB[{}]: listening", cport);
        Ok(())
    }

    pub fn stop_listening(&self, cport: CportId) -> Result<()> {
        self.registered(cport)?;
        self.shared.transport.stop_listening(cport)?;
        debug!("GB[{}]: stopped listening", cport);
        Ok(())
    }

    // ── Receive path ──────────────────────────────────────────

    /// Accept one inbound frame from the transport.
    ///
    /// Never blocks and does not log above `warn`, so it may be called from
    /// interrupt context. `data` may be longer than the frame; bytes past
    /// the header's `size` are ignored. Frames for a cport with no driver
    /// are dropped and reported as success.
    pub fn on_receive(&self, cport: CportId, data: &[u8]) -> Result<()> {
        let slot = self.slot(cport)?;
        if data.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let Some(driver) = slot.driver.get() else {
            trace!("GB[{}]: no driver, dropping {} bytes", cport, data.len());
            return Ok(());
        };

        let hdr = match OperationHeader::validate(data) {
            Ok(hdr) => hdr,
            Err(e) => {
                slot.counters.rx_dropped();
                self.warn_dropped(cport, "malformed header", data.len());
                return Err(e);
            }
        };
        let frame = &data[..usize::from(hdr.size)];
        slot.counters.rx_frame();
        trace!("GB[{}]: rx {:02x?}", cport, frame);

        if let Some(fast) = driver
            .find_handler(hdr.op_type)
            .and_then(OperationHandler::fast_handler)
        {
            slot.counters.fast_path();
            fast(cport, frame);
            return Ok(());
        }

        let op = match Operation::from_frame(cport, frame) {
            Ok(op) => op,
            Err(e) => {
                slot.counters.rx_dropped();
                self.warn_dropped(cport, "no memory for operation", frame.len());
                return Err(e);
            }
        };

        if slot.rx_fifo.try_send(op).is_err() {
            slot.counters.rx_dropped();
            self.warn_dropped(cport, "rx fifo full", frame.len());
            return Err(Error::OutOfMemory);
        }
        Ok(())
    }

    fn warn_dropped(&self, cport: CportId, reason: &str, len: usize) {
        let allowed = self
            .shared
            .drop_log
            .lock(|bucket| bucket.borrow_mut().try_consume(1).is_ok());
        if allowed {
            warn!("GB[{}]: dropped {} byte frame: {}", cport, len, reason);
        }
    }

    /// Worker-side handling of one dequeued Operation. Consumes the queue's
    /// reference.
    pub(crate) fn dispatch(&self, driver: &CportDriver, op: Operation) {
        if op.request_header().is_response() {
            self.process_response(&op);
        } else {
            self.process_request(driver, &op);
        }
        op.destroy();
    }

    fn process_request(&self, driver: &CportDriver, op: &Operation) {
        let hdr = op.request_header();
        let Some(handler) = driver
            .find_handler(hdr.op_type)
            .and_then(OperationHandler::request_handler)
        else {
            debug!(
                "GB[{}]: no handler for type {:#04x} (id {})",
                op.cport(),
                hdr.op_type,
                hdr.id
            );
            if hdr.id != 0 {
                self.reply(op, OpResult::Invalid);
            }
            return;
        };

        let result = handler(self, op);
        if hdr.id != 0 && !op.has_responded() {
            self.reply(op, result);
        }
    }

    fn reply(&self, op: &Operation, result: OpResult) {
        if let Err(e) = self.send_response(op, result) {
            warn!(
                "GB[{}]: failed to answer type {:#04x} (id {}): {}",
                op.cport(),
                op.op_type(),
                op.id(),
                e
            );
        }
    }

    fn process_response(&self, response: &Operation) {
        let Ok(slot) = self.slot(response.cport()) else {
            return;
        };
        let outcome = slot
            .pending
            .process_response(response, self.request_timeout());
        if outcome.matched {
            slot.counters.matched();
        }
        if outcome.timed_out > 0 {
            slot.counters.timed_out(outcome.timed_out);
        }
    }

    // ── Transmit path ─────────────────────────────────────────

    /// Create an outbound request on `cport` with a zeroed payload of
    /// `payload_size` bytes.
    pub fn create_operation(
        &self,
        cport: CportId,
        op_type: u8,
        payload_size: usize,
    ) -> Result<Operation> {
        self.slot(cport)?;
        Operation::new(cport, op_type, payload_size)
    }

    fn alloc_id(&self) -> u16 {
        loop {
            let id = self
                .shared
                .next_id
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    fn transmit(&self, slot: &CportSlot, cport: CportId, frame: &[u8]) -> Result<()> {
        trace!("GB[{}]: tx {:02x?}", cport, frame);
        self.shared.transport.send(cport, frame)?;
        slot.counters.tx_frame();
        Ok(())
    }

    /// Send `op` as a request.
    ///
    /// Without `need_response` the frame goes out with id 0 and nothing is
    /// retained; `callback` is dropped. With it, a fresh non-zero id is
    /// assigned and the operation stays on the cport's pending list until
    /// its response arrives or it times out, at which point `callback` runs
    /// on the cport worker.
    pub fn send_request(
        &self,
        op: &Operation,
        callback: Option<Callback>,
        need_response: bool,
    ) -> Result<()> {
        let cport = op.cport();
        let slot = self.slot(cport)?;

        if !need_response {
            op.set_id(0);
            let frame = op.request_frame()?;
            return self.transmit(slot, cport, &frame);
        }

        let id = self.alloc_id();
        op.set_id(id);
        slot.pending.push(op.clone())?;
        op.arm(std::time::Instant::now(), callback);

        let sent = op
            .request_frame()
            .and_then(|frame| self.transmit(slot, cport, &frame));
        if let Err(e) = sent {
            slot.pending.remove(op);
            op.disarm();
            debug!("GB[{}]: request id {} not sent: {}", cport, id, e);
            return Err(e);
        }
        Ok(())
    }

    /// Send `op` and block until its response arrives or it times out.
    ///
    /// Returns the delivered result (`Timeout` when reaped). Must not be
    /// called from the worker of the same cport: that worker is the one
    /// that would deliver the response.
    pub fn send_request_sync(&self, op: &Operation) -> Result<OpResult> {
        let done: Arc<Signal<CriticalSectionRawMutex, ()>> = Arc::new(Signal::new());
        let notify = done.clone();
        self.send_request(op, Some(Box::new(move |_: &Operation| notify.signal(()))), true)?;

        futures_lite::future::block_on(done.wait());
        Ok(op.result().unwrap_or(OpResult::Malfunction))
    }

    /// Answer the request `op` with `result`.
    ///
    /// Sends the response buffer from [`Operation::alloc_response`], or a
    /// header-only response if none was allocated. Fails with
    /// `InvalidState` if a response was already sent.
    pub fn send_response(&self, op: &Operation, result: OpResult) -> Result<()> {
        let cport = op.cport();
        let slot = self.slot(cport)?;
        let (frame, lazily) = op.take_response(result)?;
        let sent = self.transmit(slot, cport, &frame);
        op.restore_response(frame, lazily, sent.is_ok());
        sent
    }

    // ── Introspection ─────────────────────────────────────────

    /// Requests on `cport` still waiting for a response.
    pub fn pending_count(&self, cport: CportId) -> Result<usize> {
        Ok(self.slot(cport)?.pending.len())
    }

    /// Reap timed-out requests on `cport` without waiting for the next
    /// inbound response. Returns how many were reaped.
    pub fn reap_expired(&self, cport: CportId) -> Result<usize> {
        let slot = self.slot(cport)?;
        let n = slot.pending.reap(self.request_timeout());
        if n > 0 {
            slot.counters.timed_out(n);
        }
        Ok(n)
    }

    pub fn stats(&self, cport: CportId) -> Result<CportStats> {
        Ok(self.slot(cport)?.counters.snapshot())
    }
}

// ── Platform time for rate limiter ───────────────────────────

fn platform_now() -> Duration {
    use std::time::Instant;
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed()
}
