//! Greybus operation engine.
//!
//! Exposes the engine, the control protocol driver and the ambient types
//! (errors, configuration, diagnostics) for firmware and host-side tests.
//! The crate never installs a logger; the binary that links it does.

#![deny(unused_must_use)]

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod greybus;
pub mod protocols;

pub use config::GreybusConfig;
pub use error::{Error, Result, TransportError};
pub use greybus::{CportDriver, CportId, Greybus, OpResult, Operation, TransportBackend};
