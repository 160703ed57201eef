//! Shared event buffer contract
//!
//! The buffer is the single cross-thread seam in the agent: the kernel
//! (or an in-process producer) writes records, the consumption loop
//! blocks on `read`, and shutdown is expressed by exactly one `close`
//! from any thread. Close must unblock a pending read with the
//! distinguished [`ReadError::Closed`] condition and must be a no-op
//! when called again.

use std::io;
use std::sync::Mutex;

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use thiserror::Error;

/// Read-side failures. `Closed` is the expected cooperative-shutdown
/// path, not an error condition; `Fault` is transient and the caller
/// is expected to keep reading.
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("event buffer closed")]
    Closed,

    #[error("event buffer read fault: {0}")]
    Fault(#[from] io::Error),
}

/// Single-reader blocking record source with idempotent cross-thread
/// close.
pub trait EventBuffer: Send + Sync {
    /// Block until the next raw record, a transient fault, or close.
    fn read(&self) -> Result<Vec<u8>, ReadError>;

    /// Unblock any pending read with [`ReadError::Closed`]. Safe to
    /// call from any thread, any number of times.
    fn close(&self);
}

/// In-process [`EventBuffer`] over crossbeam channels.
///
/// Producers push raw records through a cloned [`Sender`]; pushes
/// never block the producer. Records queued before `close` are still
/// drained by the reader, then `Closed` is reported.
pub struct ChannelBuffer {
    records: Receiver<Vec<u8>>,
    closed: Receiver<()>,
    // Dropping this sender is the close signal; Option makes the drop
    // explicit and idempotent.
    close_guard: Mutex<Option<Sender<()>>>,
}

impl ChannelBuffer {
    /// Returns the buffer and the producer handle that feeds it.
    pub fn new() -> (Self, Sender<Vec<u8>>) {
        let (tx, rx) = channel::unbounded();
        let (close_tx, close_rx) = channel::bounded(0);
        let buffer = ChannelBuffer {
            records: rx,
            closed: close_rx,
            close_guard: Mutex::new(Some(close_tx)),
        };
        (buffer, tx)
    }
}

impl EventBuffer for ChannelBuffer {
    fn read(&self) -> Result<Vec<u8>, ReadError> {
        // Drain queued records before honoring close, so cooperative
        // shutdown never discards records produced before the signal.
        match self.records.try_recv() {
            Ok(record) => return Ok(record),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return Err(ReadError::Closed),
        }

        crossbeam::select! {
            recv(self.records) -> record => match record {
                Ok(record) => Ok(record),
                Err(_) => Err(ReadError::Closed),
            },
            recv(self.closed) -> _ => Err(ReadError::Closed),
        }
    }

    fn close(&self) {
        // Poisoning cannot happen: the guard is only ever taken.
        if let Ok(mut guard) = self.close_guard.lock() {
            guard.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn read_returns_pushed_record() {
        let (buffer, tx) = ChannelBuffer::new();
        tx.send(vec![1, 2, 3]).unwrap();
        assert_eq!(buffer.read().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn close_unblocks_pending_read() {
        let (buffer, _tx) = ChannelBuffer::new();
        let buffer = Arc::new(buffer);

        let reader = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || buffer.read())
        };

        // Give the reader time to block.
        thread::sleep(Duration::from_millis(50));
        buffer.close();

        match reader.join().unwrap() {
            Err(ReadError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn close_is_idempotent() {
        let (buffer, _tx) = ChannelBuffer::new();
        buffer.close();
        buffer.close();
        match buffer.read() {
            Err(ReadError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn queued_records_survive_close() {
        let (buffer, tx) = ChannelBuffer::new();
        tx.send(vec![1]).unwrap();
        tx.send(vec![2]).unwrap();
        buffer.close();

        assert_eq!(buffer.read().unwrap(), vec![1]);
        assert_eq!(buffer.read().unwrap(), vec![2]);
        match buffer.read() {
            Err(ReadError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn dropping_all_producers_also_closes() {
        let (buffer, tx) = ChannelBuffer::new();
        drop(tx);
        match buffer.read() {
            Err(ReadError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn concurrent_close_from_two_threads() {
        let (buffer, _tx) = ChannelBuffer::new();
        let buffer = Arc::new(buffer);

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || buffer.close())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        match buffer.read() {
            Err(ReadError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }
}
