//! Property-based tests for the buffer's quantified invariants:
//!
//! - packets survive a write/read round trip byte for byte,
//! - within one sequence packets come out in commit order,
//! - the stats counters keep their accounting identities under arbitrary
//!   interleavings of writes, reads and wraps.

mod common;

use std::collections::HashMap;
use std::collections::VecDeque;

use common::{chunk, frag, read, read_packet};
use proptest::prelude::*;
use tracebuf::{OverwritePolicy, TraceBuffer};

/// Packet total sizes that the test chunk builder can represent exactly
/// (sizes around the 1-to-2-byte varint boundary cannot be hit).
fn packet_size() -> impl Strategy<Value = usize> {
    prop_oneof![18usize..=120, 140usize..=1000]
}

proptest! {
    /// Whatever mix of chunk sizes is written (without wrapping), reading
    /// returns the same payloads in the same order.
    #[test]
    fn prop_round_trip_no_wrapping(sizes in prop::collection::vec(packet_size(), 1..40)) {
        let mut buf = TraceBuffer::new(64 * 1024, OverwritePolicy::Overwrite).unwrap();
        for (i, &size) in sizes.iter().enumerate() {
            let seed = (i % 251) as u8;
            chunk(1, 1, i as u32).add_packet(size, seed).copy_into(&mut buf);
        }

        buf.begin_read();
        for (i, &size) in sizes.iter().enumerate() {
            let seed = (i % 251) as u8;
            prop_assert_eq!(read_packet(&mut buf), vec![frag(size, seed)]);
        }
        prop_assert!(read_packet(&mut buf).is_empty());

        let stats = buf.stats();
        prop_assert_eq!(stats.chunks_written, sizes.len() as u64);
        prop_assert_eq!(stats.chunks_read, stats.chunks_written);
        prop_assert_eq!(stats.bytes_read, stats.bytes_written);
    }

    /// Interleaved writers: each sequence's packets are yielded strictly in
    /// commit order, whatever the global interleaving looks like.
    #[test]
    fn prop_per_sequence_fifo(
        commits in prop::collection::vec((1u16..=4, packet_size()), 1..60),
    ) {
        let mut buf = TraceBuffer::new(256 * 1024, OverwritePolicy::Overwrite).unwrap();
        let mut next_id: HashMap<u16, u32> = HashMap::new();
        let mut expected: HashMap<u16, VecDeque<Vec<u8>>> = HashMap::new();

        for &(writer, size) in &commits {
            let id = next_id.entry(writer).or_insert(0);
            let seed = (*id % 251) as u8;
            chunk(1, writer, *id).add_packet(size, seed).copy_into(&mut buf);
            expected.entry(writer).or_default().push_back(frag(size, seed));
            *id += 1;
        }

        buf.begin_read();
        while let Some(r) = read(&mut buf) {
            prop_assert!(!r.previous_packet_dropped);
            let queue = expected.get_mut(&r.sequence.writer_id).unwrap();
            // FIFO within the sequence: the packet must be the oldest one
            // still expected for this writer.
            prop_assert_eq!(r.packet.slices()[0].clone(), queue.pop_front().unwrap());
        }
        for queue in expected.values() {
            prop_assert!(queue.is_empty());
        }
    }

    /// With wrapping and eviction in play, every written chunk is either
    /// read or overwritten by the end, and reads never outrun writes.
    #[test]
    fn prop_chunk_accounting_with_wrapping(
        sizes in prop::collection::vec(packet_size(), 1..80),
        drain_every in 3usize..10,
    ) {
        let mut buf = TraceBuffer::new(4096, OverwritePolicy::Overwrite).unwrap();
        for (i, &size) in sizes.iter().enumerate() {
            chunk(1, 1, i as u32).add_packet(size, (i % 251) as u8).copy_into(&mut buf);
            if i % drain_every == 0 {
                buf.begin_read();
                while !read_packet(&mut buf).is_empty() {}
            }
            let stats = buf.stats();
            prop_assert!(stats.bytes_read <= stats.bytes_written);
        }

        buf.begin_read();
        while !read_packet(&mut buf).is_empty() {}

        let stats = buf.stats();
        prop_assert!(stats.bytes_read <= stats.bytes_written);
        prop_assert_eq!(
            stats.chunks_read + stats.chunks_overwritten,
            stats.chunks_written
        );
    }
}
