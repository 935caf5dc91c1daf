//! The unit of readback.

use crate::{ClientIdentity, ProducerId, WriterId};

/// One reassembled trace packet, as yielded by the reader.
///
/// A packet is one slice per fragment, in logical order: a standalone packet
/// has exactly one slice, a packet that spanned k chunks has k. Slices own
/// their bytes, so a packet stays valid while the buffer keeps mutating.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TracePacket {
    slices: Vec<Vec<u8>>,
}

impl TracePacket {
    pub(crate) fn add_slice(&mut self, bytes: &[u8]) {
        self.slices.push(bytes.to_vec());
    }

    /// Fragment payloads in logical order. Never empty for a yielded packet.
    pub fn slices(&self) -> &[Vec<u8>] {
        &self.slices
    }

    pub fn total_size(&self) -> usize {
        self.slices.iter().map(Vec::len).sum()
    }

    /// Concatenates the slices into one contiguous payload.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_size());
        for slice in &self.slices {
            out.extend_from_slice(slice);
        }
        out
    }
}

/// Identity of the sequence a packet was read from, as passed to
/// `copy_chunk_untrusted` when its chunks were committed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketSequenceProperties {
    pub producer_id: ProducerId,
    pub client_identity: ClientIdentity,
    pub writer_id: WriterId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_concatenates_slices() {
        let mut packet = TracePacket::default();
        packet.add_slice(b"hello ");
        packet.add_slice(b"world");
        assert_eq!(packet.slices().len(), 2);
        assert_eq!(packet.total_size(), 11);
        assert_eq!(packet.to_vec(), b"hello world");
    }
}
