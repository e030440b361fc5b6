//! Greybus control protocol.
//!
//! Two operations, both answered by the module side:
//!
//! | Type | Name             | Request            | Response                          |
//! |------|------------------|--------------------|-----------------------------------|
//! | 0x01 | PROTOCOL_VERSION | (empty)            | `major:u8, minor:u8`              |
//! | 0x02 | PROBE_AP         | `endo_id, intf_id` | `auth_size:u16le, auth_data[..]`  |
//!
//! [`driver`] builds the module-side cport driver; [`protocol_version`] and
//! [`probe_ap`] are the synchronous host-side calls.

use log::{debug, info};

use crate::error::{Error, Result};
use crate::greybus::{CportDriver, CportId, Greybus, OpResult, Operation};

pub const TYPE_PROTOCOL_VERSION: u8 = 0x01;
pub const TYPE_PROBE_AP: u8 = 0x02;

pub const VERSION_MAJOR: u8 = 0x00;
pub const VERSION_MINOR: u8 = 0x01;

const VERSION_RESPONSE_SIZE: usize = 2;
const PROBE_AP_REQUEST_SIZE: usize = 2;
const AUTH_SIZE_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

/// Decoded PROBE_AP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeApResponse {
    pub auth_data: Vec<u8>,
}

// ── Module side ──────────────────────────────────────────────

/// Control driver answering with `auth_data` on every PROBE_AP.
pub fn driver(auth_data: Vec<u8>) -> CportDriver {
    CportDriver::new("control")
        .handler(TYPE_PROTOCOL_VERSION, handle_protocol_version)
        .handler(TYPE_PROBE_AP, move |_, op| handle_probe_ap(op, &auth_data))
        .on_init(|cport| {
            info!("GB[{}]: control protocol {}.{}", cport, VERSION_MAJOR, VERSION_MINOR);
            Ok(())
        })
}

fn handle_protocol_version(_: &Greybus, op: &Operation) -> OpResult {
    let filled = op.alloc_response(VERSION_RESPONSE_SIZE, |p| {
        p[0] = VERSION_MAJOR;
        p[1] = VERSION_MINOR;
    });
    match filled {
        Ok(()) => OpResult::Success,
        Err(e) => e.into(),
    }
}

fn handle_probe_ap(op: &Operation, auth_data: &[u8]) -> OpResult {
    let Some((endo_id, intf_id)) = op.with_request_payload(|p| match p {
        [endo, intf, ..] => Some((*endo, *intf)),
        _ => None,
    }) else {
        return OpResult::Invalid;
    };
    debug!(
        "GB[{}]: probe AP endo={} intf={}",
        op.cport(),
        endo_id,
        intf_id
    );

    let Ok(auth_size) = u16::try_from(auth_data.len()) else {
        return OpResult::Overflow;
    };
    let filled = op.alloc_response(AUTH_SIZE_LEN + auth_data.len(), |p| {
        p[..AUTH_SIZE_LEN].copy_from_slice(&auth_size.to_le_bytes());
        p[AUTH_SIZE_LEN..].copy_from_slice(auth_data);
    });
    match filled {
        Ok(()) => OpResult::Success,
        Err(e) => e.into(),
    }
}

// ── Host side ────────────────────────────────────────────────

/// Ask the module on `cport` for its control protocol version.
pub fn protocol_version(gb: &Greybus, cport: CportId) -> Result<ProtocolVersion> {
    let op = gb.create_operation(cport, TYPE_PROTOCOL_VERSION, 0)?;
    match exchange(gb, &op)?.as_slice() {
        [major, minor, ..] => Ok(ProtocolVersion {
            major: *major,
            minor: *minor,
        }),
        _ => Err(Error::Remote(OpResult::ProtocolBad)),
    }
}

/// Probe the module on `cport` and collect its authentication data.
pub fn probe_ap(gb: &Greybus, cport: CportId, endo_id: u8, intf_id: u8) -> Result<ProbeApResponse> {
    let op = gb.create_operation(cport, TYPE_PROBE_AP, PROBE_AP_REQUEST_SIZE)?;
    op.with_request_payload_mut(|p| {
        p[0] = endo_id;
        p[1] = intf_id;
    });

    let payload = exchange(gb, &op)?;
    let (size, data) = payload
        .split_first_chunk::<AUTH_SIZE_LEN>()
        .ok_or(Error::Remote(OpResult::ProtocolBad))?;
    let auth_size = usize::from(u16::from_le_bytes(*size));
    let auth_data = data
        .get(..auth_size)
        .ok_or(Error::Remote(OpResult::ProtocolBad))?;

    debug!("GB[{}]: probe AP returned {} auth bytes", cport, auth_size);
    Ok(ProbeApResponse {
        auth_data: auth_data.to_vec(),
    })
}

/// Send `op` synchronously and return the response payload.
fn exchange(gb: &Greybus, op: &Operation) -> Result<Vec<u8>> {
    match gb.send_request_sync(op)? {
        OpResult::Success => {}
        OpResult::Timeout => return Err(Error::Timeout),
        other => return Err(Error::Remote(other)),
    }
    let response = op.response().ok_or(Error::InvalidState)?;
    Ok(response.request_payload())
}
