//! Per-cport worker threads.
//!
//! Each registered cport gets one thread that drains its RX FIFO in arrival
//! order. The FIFO is an `embassy-sync` channel: the receive path pushes
//! with `try_send` (never blocks, safe from interrupt context) and the
//! worker parks in `receive().await`, driven by `futures_lite::block_on`.
//!
//! ```text
//!  on_receive (any context)          gb-cport<N> thread
//!  ┌──────────────────────┐         ┌────────────────────────────┐
//!  │ validate + allocate  │ try_send│ loop {                     │
//!  │ Operation            │────────▶│   op = fifo.receive().await│
//!  └──────────────────────┘  FIFO   │   dispatch(op)             │
//!                                   │ }                          │
//!                                   └────────────────────────────┘
//! ```

use std::sync::Arc;
use std::thread::JoinHandle;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use log::{info, warn};

use super::CportId;
use super::driver::CportDriver;
use super::engine::Greybus;
use super::operation::Operation;
use crate::error::{Error, Result};

/// Inbound Operations buffered per cport before the worker picks them up.
pub const RX_FIFO_DEPTH: usize = 16;

pub(crate) type RxFifo = Channel<CriticalSectionRawMutex, Operation, RX_FIFO_DEPTH>;

/// Host threads run handlers with std formatting and need more headroom
/// than the MCU task hint.
#[cfg(not(target_os = "espidf"))]
const HOST_STACK_FLOOR: usize = 64 * 1024;

#[cfg(not(target_os = "espidf"))]
fn effective_stack(hint: usize) -> usize {
    hint.max(HOST_STACK_FLOOR)
}

#[cfg(target_os = "espidf")]
fn effective_stack(hint: usize) -> usize {
    hint
}

/// Spawn the worker for `cport`.
pub(crate) fn spawn(
    gb: Greybus,
    cport: CportId,
    driver: Arc<CportDriver>,
    stack_size: usize,
) -> Result<JoinHandle<()>> {
    let stack = effective_stack(stack_size);
    info!(
        "GB[{}]: spawning worker for '{}' (stack={}B)",
        cport,
        driver.name(),
        stack
    );

    std::thread::Builder::new()
        .name(format!("gb-cport{cport}"))
        .stack_size(stack)
        .spawn(move || run(&gb, cport, &driver))
        .map_err(|e| {
            warn!("GB[{}]: worker spawn failed: {}", cport, e);
            Error::WorkerSpawn
        })
}

fn run(gb: &Greybus, cport: CportId, driver: &CportDriver) {
    let Some(fifo) = gb.rx_fifo(cport) else {
        return;
    };

    futures_lite::future::block_on(async {
        loop {
            let op = fifo.receive().await;
            gb.dispatch(driver, op);
        }
    });
}
