//! Event fragments and their flattened wire representation.
//!
//! A fragment is one timestamped unit of data produced by one digitizer source.
//! Readout code hands the builder contiguous buffers of *flat* fragments, each a
//! fixed header followed immediately by its payload:
//!
//! ```text
//! offset  width  field
//!   0      u64   timestamp      (NULL_TIMESTAMP = inherit from source)
//!   8      u32   source id
//!  12      u32   payload size   (bytes following the header)
//!  16      u32   barrier type   (0 = ordinary event)
//!  20      ...   payload
//! ```
//!
//! All header fields are little-endian. Payloads are held as [`Bytes`], so a
//! fragment clone shares the payload instead of copying it.

use crate::error::{EvbError, EvbResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Reserved timestamp meaning "no timestamp; inherit the source's newest".
pub const NULL_TIMESTAMP: u64 = u64::MAX;

/// Size of the flat fragment header in bytes.
pub const HEADER_SIZE: usize = 20;

/// Fixed header carried in front of every fragment payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentHeader {
    /// Device clock ticks, or [`NULL_TIMESTAMP`].
    pub timestamp: u64,
    /// Producing device.
    pub source_id: u32,
    /// Payload length in bytes.
    pub size: u32,
    /// Zero for ordinary data, otherwise the barrier type.
    pub barrier_type: u32,
}

impl FragmentHeader {
    /// Decode a header from the first [`HEADER_SIZE`] bytes of `buf`.
    ///
    /// Returns `None` when fewer than [`HEADER_SIZE`] bytes are available.
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            timestamp: buf.get_u64_le(),
            source_id: buf.get_u32_le(),
            size: buf.get_u32_le(),
            barrier_type: buf.get_u32_le(),
        })
    }

    /// Append the header to `out`.
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u64_le(self.timestamp);
        out.put_u32_le(self.source_id);
        out.put_u32_le(self.size);
        out.put_u32_le(self.barrier_type);
    }

    /// Header plus payload size.
    pub fn flat_size(&self) -> usize {
        HEADER_SIZE + self.size as usize
    }
}

/// A single fragment owned by the builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    header: FragmentHeader,
    payload: Bytes,
}

impl Fragment {
    /// Build a fragment; the header size is taken from the payload length.
    ///
    /// # Panics
    ///
    /// Panics if the payload is longer than `u32::MAX` bytes. Use
    /// [`Fragment::try_new`] for payloads of unchecked length.
    pub fn new(timestamp: u64, source_id: u32, barrier_type: u32, payload: Bytes) -> Self {
        match Self::try_new(timestamp, source_id, barrier_type, payload) {
            Ok(fragment) => fragment,
            Err(e) => panic!("{e}"),
        }
    }

    /// Build a fragment, rejecting payloads the header cannot describe.
    pub fn try_new(
        timestamp: u64,
        source_id: u32,
        barrier_type: u32,
        payload: Bytes,
    ) -> EvbResult<Self> {
        Ok(Self {
            header: FragmentHeader {
                timestamp,
                source_id,
                size: header_size_field(payload.len())?,
                barrier_type,
            },
            payload,
        })
    }

    /// The fragment header.
    pub fn header(&self) -> &FragmentHeader {
        &self.header
    }

    /// Timestamp in device clock ticks.
    pub fn timestamp(&self) -> u64 {
        self.header.timestamp
    }

    /// Producing source.
    pub fn source_id(&self) -> u32 {
        self.header.source_id
    }

    /// Barrier type, zero for ordinary data.
    pub fn barrier_type(&self) -> u32 {
        self.header.barrier_type
    }

    /// Whether this fragment marks a synchronization barrier.
    pub fn is_barrier(&self) -> bool {
        self.header.barrier_type != 0
    }

    /// Payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Bytes this fragment occupies in flat form.
    pub fn flat_size(&self) -> usize {
        self.header.flat_size()
    }

    pub(crate) fn set_timestamp(&mut self, timestamp: u64) {
        self.header.timestamp = timestamp;
    }

    /// Append the flat representation of this fragment to `out`.
    pub fn flatten_into(&self, out: &mut BytesMut) {
        out.reserve(self.flat_size());
        self.header.encode(out);
        out.put_slice(&self.payload);
    }
}

/// Flatten a sequence of fragments into one contiguous buffer.
pub fn encode_fragments<'a>(fragments: impl IntoIterator<Item = &'a Fragment>) -> Bytes {
    let mut out = BytesMut::new();
    for fragment in fragments {
        fragment.flatten_into(&mut out);
    }
    out.freeze()
}

/// Iterator over the flat fragments in a buffer.
///
/// Each item deep-copies one fragment out of the buffer. Iteration stops after
/// the first [`EvbError::SizeMismatch`].
#[derive(Debug)]
pub struct FlatFragments<'a> {
    buf: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> FlatFragments<'a> {
    /// Walk `buf` as concatenated flat fragments.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            failed: false,
        }
    }

    /// Byte offset of the next fragment to decode.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl Iterator for FlatFragments<'_> {
    type Item = EvbResult<Fragment>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.buf.len() {
            return None;
        }

        let remaining = &self.buf[self.offset..];
        let Some(header) = FragmentHeader::decode(remaining) else {
            self.failed = true;
            return Some(Err(EvbError::SizeMismatch {
                offset: self.offset,
                needed: HEADER_SIZE,
                available: remaining.len(),
            }));
        };

        let needed = header.flat_size();
        if needed > remaining.len() {
            self.failed = true;
            return Some(Err(EvbError::SizeMismatch {
                offset: self.offset,
                needed,
                available: remaining.len(),
            }));
        }

        let payload = Bytes::copy_from_slice(&remaining[HEADER_SIZE..needed]);
        self.offset += needed;
        Some(Ok(Fragment { header, payload }))
    }
}

/// Split `buf` at the last whole-fragment boundary that does not exceed `limit` bytes.
///
/// Returns the number of leading bytes holding complete fragments. Used to chunk
/// large replay files without cutting a fragment in half.
pub fn whole_fragment_prefix(buf: &[u8], limit: usize) -> usize {
    let mut offset = 0;
    while let Some(header) = FragmentHeader::decode(&buf[offset..]) {
        let next = offset + header.flat_size();
        if next > buf.len() || next > limit {
            break;
        }
        offset = next;
    }
    offset
}

fn header_size_field(len: usize) -> EvbResult<u32> {
    u32::try_from(len).map_err(|_| EvbError::PayloadTooLarge { len })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(ts: u64, sid: u32, payload: &'static [u8]) -> Fragment {
        Fragment::new(ts, sid, 0, Bytes::from_static(payload))
    }

    #[test]
    fn try_new_sets_size_from_payload() {
        let fragment = Fragment::try_new(5, 2, 0, Bytes::from_static(b"abcd")).unwrap();
        assert_eq!(fragment.header().size, 4);
        assert_eq!(fragment.flat_size(), HEADER_SIZE + 4);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn oversize_payload_is_rejected_not_truncated() {
        let len = u32::MAX as usize + 1;
        assert!(matches!(
            header_size_field(len),
            Err(EvbError::PayloadTooLarge { len: l }) if l == len
        ));
        assert_eq!(header_size_field(u32::MAX as usize).unwrap(), u32::MAX);
    }

    #[test]
    fn header_layout_is_little_endian() {
        let header = FragmentHeader {
            timestamp: 0x0102_0304_0506_0708,
            source_id: 7,
            size: 3,
            barrier_type: 2,
        };
        let mut out = BytesMut::new();
        header.encode(&mut out);

        assert_eq!(out.len(), HEADER_SIZE);
        assert_eq!(&out[0..8], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&out[8..12], &[7, 0, 0, 0]);
        assert_eq!(&out[12..16], &[3, 0, 0, 0]);
        assert_eq!(&out[16..20], &[2, 0, 0, 0]);
    }

    #[test]
    fn parses_concatenated_fragments() {
        let input = vec![frag(10, 1, b"abc"), frag(11, 2, b""), frag(12, 1, b"xy")];
        let flat = encode_fragments(&input);

        let parsed: Vec<Fragment> = FlatFragments::new(&flat)
            .collect::<EvbResult<_>>()
            .unwrap();
        assert_eq!(parsed, input);
    }

    #[test]
    fn truncated_payload_is_size_mismatch() {
        let flat = encode_fragments(&[frag(10, 1, b"abc"), frag(11, 1, b"defg")]);
        let truncated = &flat[..flat.len() - 2];

        let mut iter = FlatFragments::new(truncated);
        assert!(iter.next().unwrap().is_ok());
        match iter.next().unwrap() {
            Err(EvbError::SizeMismatch {
                offset,
                needed,
                available,
            }) => {
                assert_eq!(offset, HEADER_SIZE + 3);
                assert_eq!(needed, HEADER_SIZE + 4);
                assert_eq!(available, HEADER_SIZE + 2);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(iter.next().is_none());
    }

    #[test]
    fn truncated_header_is_size_mismatch() {
        let flat = encode_fragments(&[frag(10, 1, b"abc")]);
        let mut short = flat.to_vec();
        short.extend_from_slice(&[0u8; 7]);

        let results: Vec<_> = FlatFragments::new(&short).collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[1],
            Err(EvbError::SizeMismatch { needed: HEADER_SIZE, available: 7, .. })
        ));
    }

    #[test]
    fn whole_prefix_never_splits_a_fragment() {
        let flat = encode_fragments(&[frag(1, 1, b"aaaa"), frag(2, 1, b"bbbb"), frag(3, 1, b"c")]);
        let one = HEADER_SIZE + 4;

        assert_eq!(whole_fragment_prefix(&flat, one + 5), one);
        assert_eq!(whole_fragment_prefix(&flat, 2 * one), 2 * one);
        assert_eq!(whole_fragment_prefix(&flat, flat.len()), flat.len());
        assert_eq!(whole_fragment_prefix(&flat, 3), 0);
    }
}
