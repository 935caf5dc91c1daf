//! Shared helpers for the integration tests: a chunk builder that mirrors
//! what a producer-side writer emits, and readback shorthands.

// Each test binary uses a different slice of these helpers.
#![allow(dead_code)]

use tracebuf::{ClientIdentity, ReadPacket, TraceBuffer};

/// Size of the in-ring record header. The outer size of a chunk is
/// `sum(packet total sizes) + CHUNK_RECORD_SIZE`, rounded up to 16.
pub const CHUNK_RECORD_SIZE: usize = 16;

/// Encoded length of a varint.
pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Payload length such that `varint_len(len) + len == total`. Panics for the
/// few totals that no (header, payload) split can produce (e.g. 129).
fn payload_len_for(total: usize) -> usize {
    assert!(total >= 1, "a fragment needs at least a header byte");
    let mut len = total - 1;
    loop {
        let needed = varint_len(len as u64) + len;
        if needed == total {
            return len;
        }
        assert!(needed > total, "total size {total} is not representable");
        len -= 1;
    }
}

/// Deterministic payload: 4-byte groups of `{seed}{two-digit index}-`,
/// truncated to the payload length. Byte-precise, so patch tests can assert
/// exact content.
fn pattern_bytes(len: usize, seed: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut group = 0usize;
    while out.len() < len {
        let block =
            [seed, b'0' + ((group / 10) % 10) as u8, b'0' + (group % 10) as u8, b'-'];
        for &b in &block {
            if out.len() < len {
                out.push(b);
            }
        }
        group += 1;
    }
    out
}

/// The expected fragment payload for `add_packet(total_size, seed)`.
pub fn frag(total_size: usize, seed: u8) -> Vec<u8> {
    pattern_bytes(payload_len_for(total_size), seed)
}

/// Builds the byte image of one producer chunk and commits it.
///
/// `add_packet` sizes count the varint header, so a chunk built from packets
/// of total sizes summing to S occupies `S + CHUNK_RECORD_SIZE` bytes in the
/// ring (before alignment).
pub struct TestChunk {
    producer_id: u16,
    writer_id: u16,
    chunk_id: u32,
    client_identity: ClientIdentity,
    payload: Vec<u8>,
    num_fragments: u16,
    flags: u8,
}

pub fn chunk(producer_id: u16, writer_id: u16, chunk_id: u32) -> TestChunk {
    TestChunk {
        producer_id,
        writer_id,
        chunk_id,
        client_identity: ClientIdentity::default(),
        payload: Vec::new(),
        num_fragments: 0,
        flags: 0,
    }
}

impl TestChunk {
    pub fn client_identity(mut self, identity: ClientIdentity) -> Self {
        self.client_identity = identity;
        self
    }

    /// Appends one fragment of `total_size` bytes (header included) with a
    /// deterministic payload derived from `seed`.
    pub fn add_packet(self, total_size: usize, seed: u8) -> Self {
        self.add_packet_with_flags(total_size, seed, 0)
    }

    /// Like [`Self::add_packet`], additionally OR-ing `flags` into the chunk
    /// flags (continuation flags concern the first/last packet only).
    pub fn add_packet_with_flags(mut self, total_size: usize, seed: u8, flags: u8) -> Self {
        let payload_len = payload_len_for(total_size);
        encode_varint(payload_len as u64, &mut self.payload);
        self.payload.extend_from_slice(&pattern_bytes(payload_len, seed));
        self.num_fragments += 1;
        self.flags |= flags;
        self
    }

    /// Appends raw bytes, counted as one declared fragment. For forging
    /// malformed varints.
    pub fn add_raw(mut self, bytes: &[u8]) -> Self {
        self.payload.extend_from_slice(bytes);
        self.num_fragments += 1;
        self
    }

    pub fn set_flags(mut self, flags: u8) -> Self {
        self.flags |= flags;
        self
    }

    /// Zeroes `len` bytes at `off` within the chunk image (offset 0 is the
    /// first varint header).
    pub fn clear_bytes(mut self, off: usize, len: usize) -> Self {
        self.payload[off..off + len].fill(0);
        self
    }

    /// Zero-pads the chunk image so its total (with the record header)
    /// reaches `total_size`, emulating the fixed-size chunks of a shared
    /// memory buffer.
    pub fn pad_to(mut self, total_size: usize) -> Self {
        assert!(total_size >= self.payload.len() + CHUNK_RECORD_SIZE);
        self.payload.resize(total_size - CHUNK_RECORD_SIZE, 0);
        self
    }

    /// Declares one more fragment than the image actually holds.
    pub fn increment_num_fragments(mut self) -> Self {
        self.num_fragments += 1;
        self
    }

    /// Commits the chunk as complete. Returns the unaligned record size the
    /// chunk asks for (`payload + CHUNK_RECORD_SIZE`), handy for size math
    /// in tests.
    pub fn copy_into(&self, buf: &mut TraceBuffer) -> usize {
        self.commit(buf, true)
    }

    /// Commits the chunk as still being written (scraping).
    pub fn copy_into_incomplete(&self, buf: &mut TraceBuffer) -> usize {
        self.commit(buf, false)
    }

    fn commit(&self, buf: &mut TraceBuffer, complete: bool) -> usize {
        buf.copy_chunk_untrusted(
            self.producer_id,
            self.client_identity,
            self.writer_id,
            self.chunk_id,
            self.num_fragments,
            self.flags,
            complete,
            &self.payload,
        );
        self.payload.len() + CHUNK_RECORD_SIZE
    }
}

// ---------------------------------------------------------------------
// READBACK SHORTHANDS
// ---------------------------------------------------------------------

/// Reads one packet and returns its fragments; empty means no packet.
pub fn read_packet(buf: &mut TraceBuffer) -> Vec<Vec<u8>> {
    read(buf).map_or_else(Vec::new, |r| r.packet.slices().to_vec())
}

/// Reads one packet, also reporting the data-loss flag.
pub fn read_packet_dropped(buf: &mut TraceBuffer) -> (Vec<Vec<u8>>, bool) {
    read(buf).map_or_else(
        || (Vec::new(), false),
        |r| (r.packet.slices().to_vec(), r.previous_packet_dropped),
    )
}

pub fn read(buf: &mut TraceBuffer) -> Option<ReadPacket> {
    let read = buf.read_next_packet();
    if let Some(read) = &read {
        assert!(!read.packet.slices().is_empty(), "yielded packets are never empty");
    }
    read
}
