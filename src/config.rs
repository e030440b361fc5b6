//! Engine configuration parameters
//!
//! Tunables for the Greybus engine. The cport count is not configured here;
//! it is a platform property reported by the transport backend.
//! Values can be persisted as a postcard blob and restored at boot.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Core engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreybusConfig {
    /// Age (milliseconds) after which a pending request is reaped
    pub request_timeout_ms: u32,
    /// Worker stack size (bytes) for drivers that give no hint
    pub default_stack_size: usize,
}

impl Default for GreybusConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 1000,
            default_stack_size: 2048,
        }
    }
}

impl GreybusConfig {
    /// Restore a configuration persisted with [`to_postcard`](Self::to_postcard).
    pub fn from_postcard(bytes: &[u8]) -> Result<Self> {
        postcard::from_bytes(bytes).map_err(|_| Error::InvalidArgument)
    }

    pub fn to_postcard(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|_| Error::OutOfMemory)
    }
}
