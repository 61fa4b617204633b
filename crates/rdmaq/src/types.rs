//! Tokens, descriptors, scatter-gather arrays and operation results.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Caller-chosen identifier for one asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QToken(pub u64);

impl fmt::Display for QToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "qt#{}", self.0)
    }
}

/// Queue descriptor assigned by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QDesc(pub u32);

impl fmt::Display for QDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "qd#{}", self.0)
    }
}

/// Socket kind requested at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SockType {
    /// Reliable, connection-oriented byte-array queue.
    Stream,
    /// Unreliable datagrams.
    Datagram,
}

/// Ordered list of segments forming one logical payload.
///
/// Segments are reference-counted so the queue can keep them alive for as long as the
/// hardware may read them. For received payloads, `buf` is the whole receive buffer and
/// every segment is a view into it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SgArray {
    /// Backing receive buffer, set on pop results.
    pub buf: Option<Bytes>,
    /// Payload segments in order.
    pub segments: Vec<Bytes>,
}

impl SgArray {
    /// Creates an array from owned segments.
    pub fn new(segments: Vec<Bytes>) -> Self {
        Self {
            buf: None,
            segments,
        }
    }

    /// Creates an array by copying each slice into its own segment.
    pub fn from_slices(slices: &[&[u8]]) -> Self {
        Self::new(slices.iter().map(|s| Bytes::copy_from_slice(s)).collect())
    }

    /// Number of segments.
    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    /// Returns true if there are no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Sum of segment lengths.
    pub fn payload_len(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }

    /// Concatenates every segment into one vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload_len());
        for seg in &self.segments {
            out.extend_from_slice(seg);
        }
        out
    }
}

/// Outcome of a completed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    /// A push was sent; `bytes` is what the hardware reported transferring.
    Push {
        /// Bytes on the wire, framing included.
        bytes: usize,
    },
    /// A message was received.
    Pop {
        /// Bytes received, framing included.
        bytes: usize,
        /// Decoded segments aliasing the receive buffer.
        sga: SgArray,
    },
    /// A connection was accepted onto the queue with this descriptor.
    Accept {
        /// Descriptor of the newly connected queue.
        qd: QDesc,
    },
}

/// What a single poll observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult {
    /// The operation has not finished; poll again.
    NotReady,
    /// The operation finished.
    Done(OperationResult),
}

impl PollResult {
    /// Returns true if the operation finished.
    pub fn is_done(&self) -> bool {
        matches!(self, PollResult::Done(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sgarray_lengths() {
        let sga = SgArray::from_slices(&[b"abc", b"", b"defgh"]);
        assert_eq!(sga.num_segments(), 3);
        assert_eq!(sga.payload_len(), 8);
        assert_eq!(sga.to_vec(), b"abcdefgh".to_vec());
        assert!(sga.buf.is_none());
    }

    #[test]
    fn test_empty_sgarray() {
        let sga = SgArray::default();
        assert!(sga.is_empty());
        assert_eq!(sga.payload_len(), 0);
    }

    #[test]
    fn test_token_display() {
        assert_eq!(QToken(42).to_string(), "qt#42");
        assert_eq!(QDesc(3).to_string(), "qd#3");
    }

    #[test]
    fn test_poll_result_is_done() {
        assert!(!PollResult::NotReady.is_done());
        assert!(PollResult::Done(OperationResult::Push { bytes: 1 }).is_done());
    }
}
