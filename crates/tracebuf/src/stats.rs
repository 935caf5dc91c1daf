//! Buffer usage statistics.
//!
//! All counters increase monotonically and are exposed to the session layer
//! and to tests. Recoverable error conditions never surface as `Result`s;
//! they land here.

use std::collections::HashMap;

use crate::SequenceKey;

/// Counters describing everything that ever happened to a buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Chunks committed into the buffer.
    pub chunks_written: u64,
    /// Chunks re-committed over an existing chunk with a grown payload.
    pub chunks_rewritten: u64,
    /// Chunks whose insertion point was not at the tail of their sequence.
    pub chunks_committed_out_of_order: u64,
    /// Live chunks evicted by the write cursor wrapping over them.
    pub chunks_overwritten: u64,
    /// Chunks dropped: stale re-commits, or any write under discard policy
    /// once the buffer filled up.
    pub chunks_discarded: u64,
    /// Chunks fully consumed by the reader.
    pub chunks_read: u64,

    /// Outer bytes (header + payload + alignment) of written chunks.
    pub bytes_written: u64,
    /// Outer bytes of evicted chunks.
    pub bytes_overwritten: u64,
    /// Outer bytes of fully consumed chunks.
    pub bytes_read: u64,

    /// Bytes spent on padding records (end-of-buffer gaps, eviction tails).
    pub padding_bytes_written: u64,
    /// Bytes of padding records reclaimed by new writes.
    pub padding_bytes_cleared: u64,

    /// Times the write cursor wrapped back to offset 0.
    pub write_wrap_count: u64,

    pub patches_succeeded: u64,
    pub patches_failed: u64,

    /// Fragmented-packet reassemblies that produced a packet.
    pub readaheads_succeeded: u64,
    /// Reassemblies aborted for missing data or a sequence gap.
    pub readaheads_failed: u64,

    /// Malformed producer input (out-of-bounds fragments, shrinking
    /// re-commits, oversized chunks, ...). The offending input is dropped.
    pub abi_violations: u64,

    /// Packets the writer itself dropped before committing (signalled with
    /// the reserved drop marker). Not an ABI violation.
    pub trace_writer_packet_loss: u64,

    /// Size in bytes of the ring, fixed at creation.
    pub buffer_size: u64,
}

// ---------------------------------------------------------------------
// PER-WRITER HISTOGRAMS
// ---------------------------------------------------------------------

/// Upper bounds (inclusive) of the histogram buckets, plus an implicit
/// overflow bucket. Chunk payloads max out at 64 KiB.
const BUCKET_BOUNDS: [u64; 8] = [0, 16, 64, 256, 1024, 4096, 16384, 65536];

/// Log-bucketed histogram of effective chunk payload sizes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Histogram {
    counts: [u64; BUCKET_BOUNDS.len() + 1],
    sum: u64,
}

impl Histogram {
    pub fn add(&mut self, value: u64) {
        let bucket = BUCKET_BOUNDS
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(BUCKET_BOUNDS.len());
        self.counts[bucket] += 1;
        self.sum += value;
    }

    pub fn count(&self) -> u64 {
        self.counts.iter().sum()
    }

    #[inline]
    pub fn sum(&self) -> u64 {
        self.sum
    }

    /// `(upper_bound, count)` pairs; the overflow bucket reports `u64::MAX`.
    pub fn buckets(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        BUCKET_BOUNDS
            .iter()
            .copied()
            .chain(std::iter::once(u64::MAX))
            .zip(self.counts.iter().copied())
    }
}

/// One [`Histogram`] per `(producer, writer)` sequence ever observed.
#[derive(Clone, Debug, Default)]
pub struct WriterStats {
    per_writer: HashMap<SequenceKey, Histogram>,
}

impl WriterStats {
    pub(crate) fn record(&mut self, key: SequenceKey, value: u64) {
        self.per_writer.entry(key).or_default().add(value);
    }

    pub fn get(&self, key: SequenceKey) -> Option<&Histogram> {
        self.per_writer.get(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SequenceKey, &Histogram)> {
        self.per_writer.iter().map(|(k, h)| (*k, h))
    }

    pub fn len(&self) -> usize {
        self.per_writer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.per_writer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_by_upper_bound() {
        let mut h = Histogram::default();
        h.add(0);
        h.add(16);
        h.add(17);
        h.add(1_000_000);
        assert_eq!(h.count(), 4);
        assert_eq!(h.sum(), 1_000_033);
        let buckets: Vec<_> = h.buckets().collect();
        assert_eq!(buckets[0], (0, 1));
        assert_eq!(buckets[1], (16, 1));
        assert_eq!(buckets[2], (64, 1));
        assert_eq!(buckets.last().copied(), Some((u64::MAX, 1)));
    }

    #[test]
    fn writer_stats_keeps_sequences_apart() {
        let mut ws = WriterStats::default();
        ws.record(1, 10);
        ws.record(1, 20);
        ws.record(2, 30);
        assert_eq!(ws.len(), 2);
        assert_eq!(ws.get(1).unwrap().count(), 2);
        assert_eq!(ws.get(2).unwrap().sum(), 30);
        assert!(ws.get(3).is_none());
    }
}
