//! Process-wide port leasing for concurrently running nodes.
//!
//! Every node needs three listeners (P2P, RPC, WebSocket) and several nodes
//! run at once, so ports are handed out from a single monotonic watermark:
//! a port number is never issued twice within one process, even though the
//! probe socket is released immediately. Availability right now is confirmed
//! by binding; exclusivity over the rest of the run comes from never probing
//! below the watermark again.

use std::net::TcpListener;

use lazy_static::lazy_static;
use log::trace;
use parking_lot::Mutex;

use crate::error::{TestnetError, TestnetResult};

/// First port the allocator will ever probe (start of the IANA dynamic range).
pub const FIRST_EPHEMERAL_PORT: u16 = 49152;

/// Probes attempted above the watermark before giving up.
const PROBE_WINDOW: u32 = 1000;

lazy_static! {
    // Watermark of the next port to probe. u32 so the scan can run past
    // u16::MAX and report exhaustion instead of wrapping.
    static ref NEXT_PROBE: Mutex<u32> = Mutex::new(FIRST_EPHEMERAL_PORT as u32);
}

/// Lease a currently-free local TCP port.
///
/// The port is bound once to confirm availability, then released; callers are
/// expected to hand it to a child process which binds it for real. Returned
/// values are strictly increasing across a process, so two leases can never
/// collide even if neither side has bound its port yet.
pub fn allocate_port() -> TestnetResult<u16> {
    let mut next = NEXT_PROBE.lock();
    let first = *next;

    for candidate in first..first.saturating_add(PROBE_WINDOW) {
        if candidate > u16::MAX as u32 {
            break;
        }
        let port = candidate as u16;
        match TcpListener::bind(("127.0.0.1", port)) {
            Ok(listener) => {
                drop(listener);
                *next = candidate + 1;
                trace!("leased port {}", port);
                return Ok(port);
            }
            Err(_) => continue,
        }
    }

    Err(TestnetError::PortExhausted {
        first,
        last: first.saturating_add(PROBE_WINDOW).min(u16::MAX as u32 + 1),
        probes: PROBE_WINDOW,
    })
}
