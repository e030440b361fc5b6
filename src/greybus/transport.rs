//! Transport abstraction: the switched link that carries cport traffic.
//!
//! Concrete implementations live with the board code (UniPro switch, SPI
//! bridge, test loopback). The engine only ever sends whole frames and
//! asks the backend to start or stop listening on a cport; inbound frames
//! come back through [`Greybus::on_receive`](super::engine::Greybus::on_receive).

use super::CportId;
use crate::error::TransportError;

/// Frame-oriented transport backend.
pub trait TransportBackend: Send + Sync {
    /// Bring the link up. Called once from `Greybus::init`.
    fn init(&self) -> Result<(), TransportError>;

    /// Number of cports the platform exposes; valid ids are `0..count`.
    fn cport_count(&self) -> CportId;

    /// Transmit one complete frame on `cport`.
    fn send(&self, cport: CportId, frame: &[u8]) -> Result<(), TransportError>;

    /// Start delivering inbound traffic for `cport`.
    fn listen(&self, cport: CportId) -> Result<(), TransportError>;

    /// Stop delivering inbound traffic for `cport`.
    fn stop_listening(&self, cport: CportId) -> Result<(), TransportError>;
}

/// A transport that accepts and discards every frame.
/// Useful as a default when no link is attached.
pub struct NullTransport {
    cports: CportId,
}

impl NullTransport {
    pub fn new(cports: CportId) -> Self {
        Self { cports }
    }
}

impl TransportBackend for NullTransport {
    fn init(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn cport_count(&self) -> CportId {
        self.cports
    }

    fn send(&self, _cport: CportId, _frame: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    fn listen(&self, _cport: CportId) -> Result<(), TransportError> {
        Ok(())
    }

    fn stop_listening(&self, _cport: CportId) -> Result<(), TransportError> {
        Ok(())
    }
}
