//! In-order chunk reassembly.

use bytes::{Bytes, BytesMut};
use msnp_protocol::SessionId;

use crate::error::{EngineError, EngineResult};

/// Collects `DAT` chunks for one transfer.
///
/// Chunks must arrive exactly in offset order: the next chunk starts where
/// the previous one ended, declares the same total, and does not run past
/// it. Anything else is a [`EngineError::ChunkOrderViolation`].
#[derive(Debug)]
pub struct Reassembler {
    session: SessionId,
    total: u64,
    buf: BytesMut,
}

impl Reassembler {
    pub fn new(session: SessionId, total: u64) -> Self {
        Self {
            session,
            total,
            buf: BytesMut::with_capacity(usize::try_from(total).unwrap_or(0).min(1 << 20)),
        }
    }

    /// Appends a chunk and returns the number of bytes received so far.
    pub fn accept(&mut self, offset: u64, total: u64, data: &[u8]) -> EngineResult<u64> {
        let expected = self.received();
        let end = offset.saturating_add(data.len() as u64);
        if offset != expected || total != self.total || data.is_empty() || end > self.total {
            return Err(EngineError::ChunkOrderViolation {
                session: self.session,
                expected,
                got: offset,
            });
        }
        self.buf.extend_from_slice(data);
        Ok(self.received())
    }

    pub fn received(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_complete(&self) -> bool {
        self.received() == self.total
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(byte: u8) -> Vec<u8> {
        vec![byte; 100]
    }

    #[test]
    fn in_order_chunks_reassemble_exactly() {
        let mut r = Reassembler::new(9, 300);
        assert_eq!(r.accept(0, 300, &chunk(b'a')).unwrap(), 100);
        assert_eq!(r.accept(100, 300, &chunk(b'b')).unwrap(), 200);
        assert!(!r.is_complete());
        assert_eq!(r.accept(200, 300, &chunk(b'c')).unwrap(), 300);
        assert!(r.is_complete());

        let data = r.into_bytes();
        assert_eq!(&data[..100], &chunk(b'a')[..]);
        assert_eq!(&data[100..200], &chunk(b'b')[..]);
        assert_eq!(&data[200..], &chunk(b'c')[..]);
    }

    #[test]
    fn out_of_order_chunks_are_rejected() {
        let mut r = Reassembler::new(9, 300);
        let err = r.accept(200, 300, &chunk(b'c')).unwrap_err();
        assert!(matches!(
            err,
            EngineError::ChunkOrderViolation { session: 9, expected: 0, got: 200 }
        ));
        assert_eq!(r.received(), 0);

        r.accept(0, 300, &chunk(b'a')).unwrap();
        let err = r.accept(0, 300, &chunk(b'a')).unwrap_err();
        assert!(matches!(
            err,
            EngineError::ChunkOrderViolation { expected: 100, got: 0, .. }
        ));
    }

    #[test]
    fn mismatched_total_is_rejected() {
        let mut r = Reassembler::new(1, 10);
        assert!(r.accept(0, 12, b"abc").is_err());
    }

    #[test]
    fn overflowing_chunk_is_rejected() {
        let mut r = Reassembler::new(1, 4);
        assert!(r.accept(0, 4, b"abcde").is_err());
        assert!(r.accept(0, 4, b"").is_err());
        assert_eq!(r.accept(0, 4, b"abcd").unwrap(), 4);
    }
}
