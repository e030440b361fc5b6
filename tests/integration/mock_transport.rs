//! Mock transport for integration tests.
//!
//! Records every transmitted frame so tests can assert on the wire history,
//! and can optionally forward frames to a peer engine to emulate the link.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use greybus_core::greybus::OperationHeader;
use greybus_core::{CportId, Greybus, GreybusConfig, TransportBackend, TransportError};

// ── MockTransport ─────────────────────────────────────────────

pub struct MockTransport {
    cports: CportId,
    sent: Mutex<Vec<(CportId, Vec<u8>)>>,
    listening: Mutex<Vec<CportId>>,
    fail_sends: AtomicBool,
    peer: OnceLock<Greybus>,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new(cports: CportId) -> Arc<Self> {
        Arc::new(Self {
            cports,
            sent: Mutex::new(Vec::new()),
            listening: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            peer: OnceLock::new(),
        })
    }

    /// Deliver every frame sent from now on to `peer` on the same cport.
    pub fn connect(&self, peer: Greybus) {
        assert!(self.peer.set(peer).is_ok(), "peer already connected");
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(CportId, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_headers(&self) -> Vec<OperationHeader> {
        self.sent()
            .iter()
            .map(|(_, f)| OperationHeader::decode(f).unwrap())
            .collect()
    }

    /// Block until at least `n` frames were sent, or panic after a second.
    pub fn wait_for_frames(&self, n: usize) -> Vec<(CportId, Vec<u8>)> {
        assert!(
            wait_until(|| self.sent.lock().unwrap().len() >= n),
            "expected {n} frames, got {:?}",
            self.sent()
        );
        self.sent()
    }

    pub fn is_listening(&self, cport: CportId) -> bool {
        self.listening.lock().unwrap().contains(&cport)
    }
}

impl TransportBackend for MockTransport {
    fn init(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn cport_count(&self) -> CportId {
        self.cports
    }

    fn send(&self, cport: CportId, frame: &[u8]) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Io("injected failure"));
        }
        self.sent.lock().unwrap().push((cport, frame.to_vec()));
        if let Some(peer) = self.peer.get() {
            let _ = peer.on_receive(cport, frame);
        }
        Ok(())
    }

    fn listen(&self, cport: CportId) -> Result<(), TransportError> {
        self.listening.lock().unwrap().push(cport);
        Ok(())
    }

    fn stop_listening(&self, cport: CportId) -> Result<(), TransportError> {
        self.listening.lock().unwrap().retain(|&c| c != cport);
        Ok(())
    }
}

// ── Helpers ───────────────────────────────────────────────────

#[allow(dead_code)]
pub fn engine(cports: CportId) -> (Greybus, Arc<MockTransport>) {
    engine_with(cports, GreybusConfig::default())
}

#[allow(dead_code)]
pub fn engine_with(cports: CportId, config: GreybusConfig) -> (Greybus, Arc<MockTransport>) {
    let transport = MockTransport::new(cports);
    let gb = Greybus::init(transport.clone(), config).unwrap();
    (gb, transport)
}

/// Host and module engines wired back to back.
#[allow(dead_code)]
pub struct Link {
    pub host: Greybus,
    pub host_tx: Arc<MockTransport>,
    pub module: Greybus,
    pub module_tx: Arc<MockTransport>,
}

#[allow(dead_code)]
pub fn link(cports: CportId, config: GreybusConfig) -> Link {
    let (host, host_tx) = engine_with(cports, config.clone());
    let (module, module_tx) = engine_with(cports, config);
    host_tx.connect(module.clone());
    module_tx.connect(host.clone());
    Link {
        host,
        host_tx,
        module,
        module_tx,
    }
}

/// A request frame with the given id and payload.
#[allow(dead_code)]
pub fn request_frame(op_type: u8, id: u16, payload: &[u8]) -> Vec<u8> {
    let mut hdr = OperationHeader::request(op_type, payload.len()).unwrap();
    hdr.id = id;
    let mut frame = hdr.to_bytes().to_vec();
    frame.extend_from_slice(payload);
    frame
}

/// Poll `cond` for up to a second.
pub fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
