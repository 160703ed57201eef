//! Blocking event consumption loop
//!
//! One blocking read per iteration; records are decoded and reported
//! strictly in arrival order, one at a time, before the next read. A
//! transient read fault or a malformed record is logged and skipped;
//! only the distinguished closed condition ends the loop, and that is
//! the expected cooperative-shutdown path rather than an error.

use tracing::{debug, info, warn};

use crate::buffer::{EventBuffer, ReadError};
use crate::event::ExecEvent;

/// Counters reported when the loop exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    /// Records decoded and reported.
    pub delivered: u64,
    /// Records dropped because they failed to decode.
    pub decode_failures: u64,
    /// Transient read faults recovered from.
    pub read_faults: u64,
}

/// Consume `buffer` until it is closed, invoking `on_event` exactly
/// once per well-formed record.
pub fn run<F>(buffer: &dyn EventBuffer, mut on_event: F) -> LoopStats
where
    F: FnMut(ExecEvent),
{
    let mut stats = LoopStats::default();

    loop {
        let raw = match buffer.read() {
            Ok(raw) => raw,
            Err(ReadError::Closed) => {
                info!(
                    delivered = stats.delivered,
                    decode_failures = stats.decode_failures,
                    read_faults = stats.read_faults,
                    "event buffer closed, exiting"
                );
                return stats;
            }
            Err(ReadError::Fault(err)) => {
                stats.read_faults += 1;
                warn!(error = %err, "transient read fault, continuing");
                continue;
            }
        };

        match ExecEvent::decode(&raw) {
            Ok(event) => {
                debug!(uid = event.uid, pid = event.pid, "record decoded");
                on_event(event);
                stats.delivered += 1;
            }
            Err(err) => {
                stats.decode_failures += 1;
                warn!(error = %err, len = raw.len(), "malformed record dropped");
            }
        }
    }
}
