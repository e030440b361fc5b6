//! Per-cport traffic counters.
//!
//! Counters are plain atomics so the receive path can bump them from
//! interrupt context. [`CportStats`] is the serializable snapshot handed
//! out to diagnostics consumers.

use core::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Default)]
pub(crate) struct CportCounters {
    rx_frames: AtomicU32,
    rx_dropped: AtomicU32,
    fast_path: AtomicU32,
    tx_frames: AtomicU32,
    responses_matched: AtomicU32,
    timeouts: AtomicU32,
}

impl CportCounters {
    pub fn rx_frame(&self) {
        self.rx_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rx_dropped(&self) {
        self.rx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fast_path(&self) {
        self.fast_path.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tx_frame(&self) {
        self.tx_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn matched(&self) {
        self.responses_matched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timed_out(&self, n: usize) {
        self.timeouts.fetch_add(n as u32, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CportStats {
        CportStats {
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            fast_path: self.fast_path.load(Ordering::Relaxed),
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            responses_matched: self.responses_matched.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time traffic counters for one cport.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CportStats {
    /// Well-formed frames accepted on a registered cport.
    pub rx_frames: u32,
    /// Frames dropped: malformed, or the RX FIFO was full.
    pub rx_dropped: u32,
    /// Frames answered inline by a fast handler.
    pub fast_path: u32,
    /// Frames handed to the transport successfully.
    pub tx_frames: u32,
    pub responses_matched: u32,
    pub timeouts: u32,
}
