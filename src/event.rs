//! Fixed-layout event record shared with the kernel-side program
//!
//! The program packs a 24-byte record on its stack and emits it
//! verbatim: uid at bytes [0,4), pid at [4,8), NUL-padded comm at
//! [8,24). Both fields are little-endian u32. This layout is the only
//! wire-format contract between the two sides and must not drift.

use std::borrow::Cow;

use thiserror::Error;

/// Decode failures; a failed decode never yields a partial record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("short event record: got {len} bytes, need {}", ExecEvent::SIZE)]
    ShortRecord { len: usize },
}

/// One execve event as emitted by the kernel-side program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecEvent {
    pub uid: u32,
    pub pid: u32,
    /// Process short name, NUL-padded to 16 bytes.
    pub comm: [u8; 16],
}

impl ExecEvent {
    /// Fixed record size on the wire.
    pub const SIZE: usize = 24;

    /// Decode a record from raw bytes. Trailing bytes beyond
    /// [`SIZE`](Self::SIZE) are ignored; the perf layer pads samples
    /// to 8-byte alignment.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < Self::SIZE {
            return Err(DecodeError::ShortRecord { len: bytes.len() });
        }

        let mut uid = [0u8; 4];
        let mut pid = [0u8; 4];
        let mut comm = [0u8; 16];
        uid.copy_from_slice(&bytes[0..4]);
        pid.copy_from_slice(&bytes[4..8]);
        comm.copy_from_slice(&bytes[8..24]);

        Ok(ExecEvent {
            uid: u32::from_le_bytes(uid),
            pid: u32::from_le_bytes(pid),
            comm,
        })
    }

    /// Inverse of [`decode`](Self::decode).
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.uid.to_le_bytes());
        out[4..8].copy_from_slice(&self.pid.to_le_bytes());
        out[8..24].copy_from_slice(&self.comm);
        out
    }

    /// Comm rendered as text, stopping at the first NUL or the field
    /// boundary, whichever comes first.
    pub fn comm(&self) -> Cow<'_, str> {
        let end = self
            .comm
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.comm.len());
        String::from_utf8_lossy(&self.comm[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comm_bytes(name: &str) -> [u8; 16] {
        let mut comm = [0u8; 16];
        comm[..name.len()].copy_from_slice(name.as_bytes());
        comm
    }

    #[test]
    fn decode_valid_record() {
        let ev = ExecEvent {
            uid: 1000,
            pid: 4242,
            comm: comm_bytes("cat"),
        };
        let decoded = ExecEvent::decode(&ev.encode()).unwrap();
        assert_eq!(decoded.uid, 1000);
        assert_eq!(decoded.pid, 4242);
        assert_eq!(decoded.comm(), "cat");
    }

    #[test]
    fn short_record_fails() {
        for len in 0..ExecEvent::SIZE {
            let bytes = vec![0xab; len];
            assert_eq!(
                ExecEvent::decode(&bytes),
                Err(DecodeError::ShortRecord { len })
            );
        }
    }

    #[test]
    fn trailing_padding_is_ignored() {
        let ev = ExecEvent {
            uid: 1,
            pid: 2,
            comm: comm_bytes("sh"),
        };
        let mut bytes = ev.encode().to_vec();
        bytes.extend_from_slice(&[0u8; 8]); // perf pads to 8 bytes
        assert_eq!(ExecEvent::decode(&bytes).unwrap(), ev);
    }

    #[test]
    fn fields_are_little_endian_at_fixed_offsets() {
        let mut bytes = [0u8; ExecEvent::SIZE];
        bytes[0..4].copy_from_slice(&[0x01, 0x02, 0x00, 0x00]);
        bytes[4..8].copy_from_slice(&[0xff, 0x00, 0x00, 0x00]);
        let ev = ExecEvent::decode(&bytes).unwrap();
        assert_eq!(ev.uid, 0x0201);
        assert_eq!(ev.pid, 0xff);
    }

    #[test]
    fn comm_stops_at_first_nul() {
        let mut comm = comm_bytes("cat");
        comm[4] = b'x'; // garbage after the terminator
        let ev = ExecEvent { uid: 0, pid: 0, comm };
        assert_eq!(ev.comm(), "cat");
    }

    #[test]
    fn comm_without_nul_uses_full_field() {
        let ev = ExecEvent {
            uid: 0,
            pid: 0,
            comm: *b"aaaaaaaaaaaaaaaa",
        };
        assert_eq!(ev.comm(), "aaaaaaaaaaaaaaaa");
        assert_eq!(ev.comm().len(), 16);
    }

    #[test]
    fn round_trip_is_identity() {
        let original: [u8; ExecEvent::SIZE] = {
            let mut b = [0u8; ExecEvent::SIZE];
            for (i, byte) in b.iter_mut().enumerate() {
                *byte = (i * 7 + 3) as u8;
            }
            b
        };
        let ev = ExecEvent::decode(&original).unwrap();
        assert_eq!(ev.encode(), original);
    }
}
