//! Wire framing for scatter-gather payloads.
//!
//! A message on the wire is a fixed 16-byte header followed by one
//! `(u32 length, payload)` pair per segment:
//!
//! ```text
//! +-------+-------+-----------+-------+------+-------+------+
//! | magic | count | total(u64)| len0  | seg0 | len1  | seg1 | ...
//! +-------+-------+-----------+-------+------+-------+------+
//! ```
//!
//! `total` counts the payload bytes plus the length fields, not the header.
//! All integers are little-endian.
//!
//! Encoding never copies payload bytes: the header and length fields live in one
//! small framing buffer and the gather list interleaves slices of it with the
//! caller's segments. Decoding never copies either: segments are views into the
//! receive buffer.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{QueueError, Result};
use crate::types::SgArray;

/// Header size in bytes (magic:4 + segment_count:4 + total_bytes:8).
pub const HEADER_SIZE: usize = 16;

/// Size of each per-segment length field.
pub const SEGMENT_LEN_SIZE: usize = 4;

/// Magic number identifying a framed message.
pub const HEADER_MAGIC: u32 = 0x1010_CAFE;

/// Fixed header preceding every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    /// Must equal [`HEADER_MAGIC`].
    pub magic: u32,
    /// Number of `(length, payload)` pairs that follow.
    pub segment_count: u32,
    /// Payload bytes plus length-field bytes.
    pub total_bytes: u64,
}

impl WireHeader {
    /// Writes the header into the first [`HEADER_SIZE`] bytes of `dst`.
    fn write_to(&self, dst: &mut [u8]) {
        dst[0..4].copy_from_slice(&self.magic.to_le_bytes());
        dst[4..8].copy_from_slice(&self.segment_count.to_le_bytes());
        dst[8..16].copy_from_slice(&self.total_bytes.to_le_bytes());
    }

    /// Reads a header from the front of `src`.
    pub fn parse(src: &[u8]) -> Result<Self> {
        if src.len() < HEADER_SIZE {
            return Err(QueueError::protocol(format!(
                "received {} bytes, header needs {}",
                src.len(),
                HEADER_SIZE
            )));
        }
        let mut cursor = &src[..HEADER_SIZE];
        Ok(Self {
            magic: cursor.get_u32_le(),
            segment_count: cursor.get_u32_le(),
            total_bytes: cursor.get_u64_le(),
        })
    }
}

/// An encoded message ready to be handed to the hardware as one gather list.
#[derive(Debug, Clone)]
pub struct OutgoingFrame {
    header: WireHeader,
    framing: Bytes,
    gather: Vec<Bytes>,
}

impl OutgoingFrame {
    /// Frames `sga` without copying its segments.
    pub fn encode(sga: &SgArray) -> Result<Self> {
        if sga.is_empty() {
            return Err(QueueError::invalid_argument(
                "scatter-gather array has no segments",
            ));
        }
        let count = u32::try_from(sga.num_segments())
            .map_err(|_| QueueError::not_supported("too many segments"))?;

        let mut framing = BytesMut::zeroed(HEADER_SIZE + sga.num_segments() * SEGMENT_LEN_SIZE);
        let mut total_bytes = 0u64;
        for (i, seg) in sga.segments.iter().enumerate() {
            let len = u32::try_from(seg.len())
                .map_err(|_| QueueError::not_supported(format!("segment {} exceeds 4 GiB", i)))?;
            let off = HEADER_SIZE + i * SEGMENT_LEN_SIZE;
            framing[off..off + SEGMENT_LEN_SIZE].copy_from_slice(&len.to_le_bytes());
            total_bytes += u64::from(len) + SEGMENT_LEN_SIZE as u64;
        }

        let header = WireHeader {
            magic: HEADER_MAGIC,
            segment_count: count,
            total_bytes,
        };
        header.write_to(&mut framing[..HEADER_SIZE]);
        let framing = framing.freeze();

        let mut gather = Vec::with_capacity(2 * sga.num_segments() + 1);
        gather.push(framing.slice(..HEADER_SIZE));
        for (i, seg) in sga.segments.iter().enumerate() {
            let off = HEADER_SIZE + i * SEGMENT_LEN_SIZE;
            gather.push(framing.slice(off..off + SEGMENT_LEN_SIZE));
            gather.push(seg.clone());
        }

        Ok(Self {
            header,
            framing,
            gather,
        })
    }

    /// The header that leads the message.
    pub fn header(&self) -> &WireHeader {
        &self.header
    }

    /// The buffer holding the header and the length fields.
    pub fn framing(&self) -> &Bytes {
        &self.framing
    }

    /// Regions in wire order: header, then length and payload for each segment.
    pub fn gather(&self) -> &[Bytes] {
        &self.gather
    }

    /// Total bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.header.total_bytes as usize
    }
}

/// Decodes a received message. Segments alias `buf`.
pub fn decode_frame(buf: Bytes) -> Result<SgArray> {
    let header = WireHeader::parse(&buf)?;
    if header.magic != HEADER_MAGIC {
        return Err(QueueError::protocol(format!(
            "bad magic 0x{:08X}, expected 0x{:08X}",
            header.magic, HEADER_MAGIC
        )));
    }

    let count = header.segment_count as usize;
    let mut segments = Vec::with_capacity(count.min((buf.len() - HEADER_SIZE) / SEGMENT_LEN_SIZE));
    let mut offset = HEADER_SIZE;
    for i in 0..count {
        if buf.len() - offset < SEGMENT_LEN_SIZE {
            return Err(QueueError::protocol(format!(
                "length field of segment {} truncated at offset {}",
                i, offset
            )));
        }
        let len = (&buf[offset..offset + SEGMENT_LEN_SIZE]).get_u32_le() as usize;
        offset += SEGMENT_LEN_SIZE;
        if buf.len() - offset < len {
            return Err(QueueError::protocol(format!(
                "segment {} claims {} bytes, {} remain",
                i,
                len,
                buf.len() - offset
            )));
        }
        segments.push(buf.slice(offset..offset + len));
        offset += len;
    }

    let walked = (offset - HEADER_SIZE) as u64;
    if walked != header.total_bytes {
        return Err(QueueError::protocol(format!(
            "header claims {} bytes, segments hold {}",
            header.total_bytes, walked
        )));
    }
    if offset != buf.len() {
        return Err(QueueError::protocol(format!(
            "{} trailing bytes after {} segments",
            buf.len() - offset,
            count
        )));
    }

    Ok(SgArray {
        buf: Some(buf),
        segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flatten(frame: &OutgoingFrame) -> Bytes {
        let mut out = BytesMut::new();
        for region in frame.gather() {
            out.extend_from_slice(region);
        }
        out.freeze()
    }

    #[test]
    fn test_gather_list_layout() {
        let sga = SgArray::from_slices(&[b"hello", b"rdma"]);
        let frame = OutgoingFrame::encode(&sga).unwrap();

        let gather = frame.gather();
        assert_eq!(gather.len(), 5);
        assert_eq!(gather[0].len(), HEADER_SIZE);
        assert_eq!(&gather[1][..], &5u32.to_le_bytes());
        assert_eq!(&gather[2][..], b"hello");
        assert_eq!(&gather[3][..], &4u32.to_le_bytes());
        assert_eq!(&gather[4][..], b"rdma");
    }

    #[test]
    fn test_header_totals() {
        let sga = SgArray::from_slices(&[b"hello", b"rdma"]);
        let frame = OutgoingFrame::encode(&sga).unwrap();
        assert_eq!(frame.header().segment_count, 2);
        assert_eq!(frame.header().total_bytes, 9 + 8);
        assert_eq!(frame.wire_len(), HEADER_SIZE + 17);
        assert_eq!(frame.framing().len(), HEADER_SIZE + 8);
    }

    #[test]
    fn test_encode_does_not_copy_payload() {
        let payload = Bytes::from_static(b"zero-copy");
        let sga = SgArray::new(vec![payload.clone()]);
        let frame = OutgoingFrame::encode(&sga).unwrap();
        assert_eq!(frame.gather()[2].as_ptr(), payload.as_ptr());
    }

    #[test]
    fn test_header_and_lengths_share_framing_buffer() {
        let sga = SgArray::from_slices(&[b"a", b"b"]);
        let frame = OutgoingFrame::encode(&sga).unwrap();
        let base = frame.framing().as_ptr() as usize;
        assert_eq!(frame.gather()[0].as_ptr() as usize, base);
        assert_eq!(frame.gather()[1].as_ptr() as usize, base + HEADER_SIZE);
        assert_eq!(frame.gather()[3].as_ptr() as usize, base + HEADER_SIZE + 4);
    }

    #[test]
    fn test_encode_rejects_empty_array() {
        let err = OutgoingFrame::encode(&SgArray::default()).unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument { .. }));
    }

    #[test]
    fn test_decode_aliases_receive_buffer() {
        let sga = SgArray::from_slices(&[b"first", b"", b"third"]);
        let wire = flatten(&OutgoingFrame::encode(&sga).unwrap());
        let decoded = decode_frame(wire.clone()).unwrap();

        assert_eq!(decoded.segments, sga.segments);
        let base = wire.as_ptr() as usize;
        let first = decoded.segments[0].as_ptr() as usize;
        assert_eq!(first, base + HEADER_SIZE + SEGMENT_LEN_SIZE);
        assert_eq!(decoded.buf.as_ref().map(Bytes::len), Some(wire.len()));
    }

    #[test]
    fn test_decode_short_buffer() {
        for len in 0..HEADER_SIZE {
            let err = decode_frame(Bytes::from(vec![0u8; len])).unwrap_err();
            assert!(matches!(err, QueueError::ProtocolViolation { .. }));
        }
    }

    #[test]
    fn test_decode_bad_magic() {
        let mut wire = BytesMut::zeroed(HEADER_SIZE);
        wire[0..4].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        let err = decode_frame(wire.freeze()).unwrap_err();
        assert!(format!("{}", err).contains("bad magic"));
    }

    #[test]
    fn test_decode_truncated_segment() {
        let sga = SgArray::from_slices(&[b"0123456789"]);
        let wire = flatten(&OutgoingFrame::encode(&sga).unwrap());
        let cut = wire.slice(..wire.len() - 3);
        assert!(matches!(
            decode_frame(cut),
            Err(QueueError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_decode_truncated_length_field() {
        let sga = SgArray::from_slices(&[b"ab", b"cd"]);
        let wire = flatten(&OutgoingFrame::encode(&sga).unwrap());
        // header + len0 + "ab" + two bytes of len1
        let cut = wire.slice(..HEADER_SIZE + 4 + 2 + 2);
        assert!(decode_frame(cut).is_err());
    }

    #[test]
    fn test_decode_total_mismatch() {
        let sga = SgArray::from_slices(&[b"abc"]);
        let mut wire = BytesMut::from(&flatten(&OutgoingFrame::encode(&sga).unwrap())[..]);
        wire[8..16].copy_from_slice(&99u64.to_le_bytes());
        let err = decode_frame(wire.freeze()).unwrap_err();
        assert!(matches!(err, QueueError::ProtocolViolation { .. }));
        assert!(err.to_string().contains("claims 99 bytes"));
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let sga = SgArray::from_slices(&[b"abc"]);
        let mut wire = BytesMut::from(&flatten(&OutgoingFrame::encode(&sga).unwrap())[..]);
        wire.extend_from_slice(b"junk");
        let err = decode_frame(wire.freeze()).unwrap_err();
        assert!(matches!(err, QueueError::ProtocolViolation { .. }));
        assert!(err.to_string().contains("4 trailing bytes"));
    }

    #[test]
    fn test_decode_huge_segment_count() {
        let header = WireHeader {
            magic: HEADER_MAGIC,
            segment_count: u32::MAX,
            total_bytes: 0,
        };
        let mut wire = BytesMut::zeroed(HEADER_SIZE);
        header.write_to(&mut wire);
        assert!(decode_frame(wire.freeze()).is_err());
    }

    #[test]
    fn test_parse_header_fields() {
        let header = WireHeader {
            magic: HEADER_MAGIC,
            segment_count: 3,
            total_bytes: 0x0102_0304_0506,
        };
        let mut raw = [0u8; HEADER_SIZE];
        header.write_to(&mut raw);
        assert_eq!(WireHeader::parse(&raw).unwrap(), header);
    }
}
