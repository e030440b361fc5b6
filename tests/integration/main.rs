//! Integration test driver for the `tests/integration/` submodules.
//!
//! Each `mod` below exercises one part of the engine end to end through a
//! recording mock transport. Two engines can be wired back to back to act
//! as host and module. All tests run on the host with real worker threads.

mod correlation_tests;
mod mock_transport;
