//! Per-sequence bookkeeping.

use std::cmp::Ordering;
use std::collections::VecDeque;

use crate::{ChunkId, ClientIdentity, ProducerId, WriterId};

/// State for one `(producer, writer)` sequence with chunks in the buffer.
///
/// Must stay trivially copyable for `clone_read_only()`: chunks are tracked
/// as buffer offsets, never as pointers into the ring.
///
/// Sequences are not deleted eagerly once their chunk list drains: keeping
/// `last_chunk_id_consumed` around is what lets us flag data losses for
/// writers that only commit sporadically. The buffer GC trims the oldest
/// empty sequences once their count passes a threshold.
#[derive(Clone, Debug)]
pub(crate) struct SequenceState {
    pub producer_id: ProducerId,
    pub writer_id: WriterId,
    pub client_identity: ClientIdentity,

    /// Semantically a boolean that resets on every `begin_read()`:
    /// skip := (skip_in_generation == read_generation). Set when the
    /// sequence proved unreadable in the current read cycle.
    pub skip_in_generation: u64,

    /// Monotonic stamp of when the chunk list last became empty. The GC
    /// deletes the oldest stamps first.
    pub age_for_gc: u64,

    pub last_chunk_id_consumed: Option<ChunkId>,

    /// Set whenever a loss is detected on this sequence; cleared when the
    /// next packet reports `previous_packet_dropped`.
    pub data_loss: bool,

    /// Buffer offsets of this sequence's chunks, sorted by modular chunk id.
    pub chunks: VecDeque<u32>,
}

impl SequenceState {
    pub fn new(
        producer_id: ProducerId,
        writer_id: WriterId,
        client_identity: ClientIdentity,
    ) -> Self {
        Self {
            producer_id,
            writer_id,
            client_identity,
            skip_in_generation: 0,
            age_for_gc: 0,
            last_chunk_id_consumed: None,
            data_loss: false,
            chunks: VecDeque::with_capacity(64),
        }
    }
}

/// Compares two chunk ids in the wrapping 32-bit id space: the order of two
/// distinct ids is decided by whether the distance from `a` to `b` is less
/// than half the range. TCP sequence numbers work the same way.
///
/// A distance of exactly 2^31 has no defined order; we warn and fall out on
/// the `Less` side deterministically.
pub(crate) fn chunk_id_cmp(a: ChunkId, b: ChunkId) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    if a.wrapping_sub(b) == 1 << 31 {
        log::warn!("chunk id distance of 2^31 ({a} vs {b}), ordering undefined");
    }
    if (a.wrapping_sub(b) as i32) < 0 {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}
