//! Greybus operation engine.
//!
//! Carries request/response Operations between protocol drivers bound to
//! cports and a frame-oriented transport.
//!
//! ```text
//!   ┌──────────────┐   register_driver   ┌──────────────────────────┐
//!   │ CportDriver  │────────────────────▶│ Greybus                  │
//!   │ (handlers)   │◀── handler(op) ─────│  cport[0..N]             │
//!   └──────────────┘                     │   ├─ RX FIFO ─▶ worker   │
//!                                        │   └─ TX pending list     │
//!   ┌──────────────┐  on_receive(frame)  │                          │
//!   │ Transport    │────────────────────▶│                          │
//!   │ Backend      │◀──── send(frame) ───│                          │
//!   └──────────────┘                     └──────────────────────────┘
//! ```

pub mod driver;
pub mod engine;
pub mod header;
pub mod operation;
pub mod transport;

mod pending;
mod worker;

/// Logical channel identifier, `0..cport_count`.
pub type CportId = u16;

pub use driver::{CportDriver, OperationHandler};
pub use engine::Greybus;
pub use header::{HEADER_SIZE, OpResult, OperationHeader, RESPONSE_FLAG};
pub use operation::{Callback, Operation, WeakOperation};
pub use pending::TX_PENDING_DEPTH;
pub use transport::{NullTransport, TransportBackend};
pub use worker::RX_FIFO_DEPTH;
