//! Sequence-order readback.
//!
//! The read path visits the buffer in two layers. The outer layer (in
//! `TraceBuffer::read_next_packet`) walks chunks in buffer order. For each
//! live chunk it finds, a [`SequenceReader`] performs the inner walk: rewind
//! to the oldest chunk of the owning sequence (out-of-order commits mean that
//! chunk can sit physically *later* in the buffer), then consume fragments in
//! chunk-id order until the target chunk is exhausted.
//!
//! The same reader runs in erase mode when the write cursor is about to
//! overwrite a live chunk, so unread fragments are accounted as data loss
//! before the bytes go away.
//!
//! Neither type holds references into the buffer: they carry offsets and
//! indices only, and borrow the buffer per call. Chunks stay valid across
//! erasure because erasing rewrites a record in place as padding.

use crate::buffer::TraceBuffer;
use crate::chunk::{ChunkRecord, CHUNK_INCOMPLETE};
use crate::frag::{FragTokenizer, Fragment, FragmentKind};
use crate::invariants::debug_assert_chunk_accounting;
use crate::packet::TracePacket;
use crate::{abi, SequenceKey};

// ---------------------------------------------------------------------
// SEQUENCE CURSOR
// ---------------------------------------------------------------------

/// Follows one sequence's ordered chunk list and detects chunk-id gaps.
/// `Copy` so the reassembly look-ahead can fork it without disturbing the
/// main cursor.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SequenceCursor {
    seq_key: SequenceKey,
    chunk_off: u32,
    /// Index of the current chunk in the sequence's list. `usize::MAX` right
    /// after an erase, so the next advance wraps to element 0.
    list_idx: usize,
    gap_detected: bool,
}

impl SequenceCursor {
    /// Positions the cursor on the first (oldest) chunk of the sequence.
    pub fn rewind(buf: &TraceBuffer, seq_key: SequenceKey) -> Self {
        let seq = &buf.sequences[&seq_key];
        assert!(!seq.chunks.is_empty(), "cannot rewind an empty sequence");
        let first_off = seq.chunks[0];
        debug_assert!(!buf.chunk_at(first_off as usize).is_padding());
        Self { seq_key, chunk_off: first_off, list_idx: 0, gap_detected: false }
    }

    #[inline]
    pub fn chunk_off(&self) -> u32 {
        self.chunk_off
    }

    #[inline]
    pub fn gap_detected(&self) -> bool {
        self.gap_detected
    }

    /// Advances to the next chunk in id order, or `None` at the end of the
    /// list. Sets the gap flag when the next id is not consecutive.
    pub fn next_chunk(&mut self, buf: &TraceBuffer) -> Option<u32> {
        let seq = &buf.sequences[&self.seq_key];
        let cur = buf.chunk_at(self.chunk_off as usize);

        // Either the current chunk was erased under us (now padding), or it
        // must agree with our index into the list.
        debug_assert!(cur.is_padding() || seq.chunks[self.list_idx] == self.chunk_off);

        let next_idx = self.list_idx.wrapping_add(1);
        if next_idx >= seq.chunks.len() {
            return None;
        }

        // Two cases for the gap check:
        // 1) Consuming iteration: the current chunk was just erased and is no
        //    longer in the list, but last_chunk_id_consumed remembers it.
        // 2) Read-only look-ahead (reassembly): the current chunk is live.
        let last_chunk_id = if cur.is_padding() {
            seq.last_chunk_id_consumed
        } else {
            Some(cur.chunk_id)
        };

        let next_off = seq.chunks[next_idx];
        let next = buf.chunk_at(next_off as usize);
        if let Some(last) = last_chunk_id {
            if next.chunk_id != last.wrapping_add(1) {
                self.gap_detected = true;
            }
        }

        self.chunk_off = next_off;
        self.list_idx = next_idx;
        Some(next_off)
    }

    /// Unlinks the current chunk from the sequence, records it as consumed,
    /// and rewrites the record in place as padding (payload bytes are left
    /// alone; the record keeps its outer size).
    ///
    /// Stats are the callers' business: eviction and readback account the
    /// same erasure differently.
    pub fn erase_current(&mut self, buf: &mut TraceBuffer) {
        let chunk_off = self.chunk_off as usize;
        let chunk = buf.chunk_at(chunk_off);

        let became_empty = {
            let seq = buf
                .sequences
                .get_mut(&self.seq_key)
                .expect("live chunk belongs to no sequence");
            seq.last_chunk_id_consumed = Some(chunk.chunk_id);
            // Only the head of the list can be erased; the index tracking
            // relies on it.
            assert!(self.list_idx == 0 && seq.chunks.front() == Some(&self.chunk_off));
            seq.chunks.pop_front();
            seq.chunks.is_empty()
        };
        if became_empty {
            buf.seq_age += 1;
            buf.empty_sequences += 1;
            let age = buf.seq_age;
            buf.sequences
                .get_mut(&self.seq_key)
                .expect("live chunk belongs to no sequence")
                .age_for_gc = age;
        }

        // The element at list_idx was just removed; park the cursor one
        // before the start so the next advance lands on element 0.
        self.list_idx = usize::MAX;

        let mut cleared = ChunkRecord::new(chunk_off, usize::from(chunk.size));
        cleared.payload_size = chunk.payload_size;
        buf.store_chunk(chunk_off, &cleared);
    }
}

// ---------------------------------------------------------------------
// SEQUENCE READER
// ---------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReadMode {
    /// Standard readback.
    Read,
    /// Read-while-overwriting, ahead of chunk eviction.
    Erase,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Reassembly {
    Success,
    /// A needed follow-on chunk is absent or still waiting for a patch.
    NotEnoughData,
    /// Gap in the sequence, or a corrupted chunk, mid-packet.
    DataLoss,
}

/// Reads and consumes chunks of one sequence, in id order, up to a target
/// chunk.
///
/// The target is fixed at construction: the chunk at the outer read cursor,
/// or the chunk about to be evicted. The reader rewinds to the oldest chunk
/// of the sequence and iterates from there; with fragmentation it may
/// overshoot the target by one packet, consuming only the fragments needed
/// for reassembly and leaving everything else in place.
#[derive(Debug)]
pub(crate) struct SequenceReader {
    mode: ReadMode,

    /// Where the iteration stops. Never changes; this is *not* the end of
    /// the sequence, just where this reader stops.
    end_off: u32,

    seq_key: SequenceKey,
    seq_cursor: SequenceCursor,

    /// Current chunk, starting from the first of the sequence and advanced
    /// until `end_off` is reached.
    iter_off: u32,
    frag_iter: FragTokenizer,
}

impl SequenceReader {
    pub fn new(buf: &mut TraceBuffer, end_off: u32, mode: ReadMode) -> Self {
        let end_chunk = buf.chunk_at(end_off as usize);
        debug_assert!(!end_chunk.is_padding());
        let seq_key = end_chunk.seq_key;

        let seq_cursor = SequenceCursor::rewind(buf, seq_key);
        let iter_off = seq_cursor.chunk_off();
        let first = buf.chunk_at(iter_off as usize);
        let frag_iter = FragTokenizer::for_chunk(&first);

        // A gap between what was consumed last cycle and the oldest chunk we
        // still have means the ring wrapped over unread data (or the producer
        // skipped ids).
        let seq = buf
            .sequences
            .get_mut(&seq_key)
            .expect("live chunk belongs to no sequence");
        if let Some(last) = seq.last_chunk_id_consumed {
            if first.chunk_id != last.wrapping_add(1) {
                seq.data_loss = true;
            }
        }

        Self { mode, end_off, seq_key, seq_cursor, iter_off, frag_iter }
    }

    #[inline]
    pub fn end_off(&self) -> u32 {
        self.end_off
    }

    #[inline]
    pub fn seq_key(&self) -> SequenceKey {
        self.seq_key
    }

    /// Yields the next packet of this sequence, consuming fragments as it
    /// goes. Returns `false` once the target chunk is exhausted, the
    /// sequence has no more data, or (in read mode) the sequence is blocked.
    pub fn read_next_packet_in_seq_order(
        &mut self,
        buf: &mut TraceBuffer,
        mut out: Option<&mut TracePacket>,
    ) -> bool {
        {
            let iter = buf.chunk_at(self.iter_off as usize);
            debug_assert!(!iter.is_padding());
            debug_assert_chunk_accounting!(iter);
            debug_assert!(self.frag_iter.next_frag_off() >= usize::from(iter.unread_payload_off()));
            debug_assert!(self.frag_iter.next_frag_off() <= usize::from(iter.payload_size));
        }

        // The sequence already proved unreadable in this generation (missing
        // continuation, pending patch, incomplete chunk). Don't retry until
        // the next begin_read().
        if self.mode == ReadMode::Read
            && buf.sequences[&self.seq_key].skip_in_generation == buf.read_generation
        {
            return false;
        }

        // This loop must terminate only after visiting every fragment of
        // every chunk up to `end_off`: the erase path relies on the target
        // chunk always ending up as padding.
        loop {
            let maybe_frag = {
                let payload = buf.chunk_payload(self.iter_off as usize);
                self.frag_iter.next_fragment(payload)
            };

            let Some(frag) = maybe_frag else {
                // All fragments of the current chunk are exhausted. Either
                // stop at an incomplete chunk (its payload may still grow) or
                // erase it and move to the next chunk of the sequence.
                let mut end_reached = self.iter_off == self.end_off;

                if self.frag_iter.chunk_corrupted() {
                    buf.sequences.get_mut(&self.seq_key).unwrap().data_loss = true;
                }

                let iter_chunk = buf.chunk_at(self.iter_off as usize);
                if iter_chunk.flags & CHUNK_INCOMPLETE != 0 && self.mode == ReadMode::Read {
                    let generation = buf.read_generation;
                    buf.sequences.get_mut(&self.seq_key).unwrap().skip_in_generation = generation;
                    end_reached = true;
                } else {
                    self.seq_cursor.erase_current(buf);
                }

                if end_reached {
                    return false;
                }
                let Some(next_off) = self.seq_cursor.next_chunk(buf) else {
                    return false;
                };
                self.iter_off = next_off;
                self.frag_iter = FragTokenizer::for_chunk(&buf.chunk_at(next_off as usize));
                continue;
            };

            match frag.kind {
                FragmentKind::Whole => {
                    self.consume_fragment(buf, self.iter_off, &frag);
                    // Empty packets are consumed but not propagated, so they
                    // don't bloat the output.
                    if frag.size == 0 {
                        continue;
                    }
                    if let Some(packet) = out.as_deref_mut() {
                        packet.add_slice(buf.frag_payload(self.iter_off, &frag));
                    }
                    return true;
                }

                FragmentKind::Continue | FragmentKind::End => {
                    // A continuation with no packet in flight: the chunk
                    // holding the matching begin fragment is gone. Consume
                    // silently and surface the loss.
                    buf.sequences.get_mut(&self.seq_key).unwrap().data_loss = true;
                    self.consume_fragment(buf, self.iter_off, &frag);
                }

                FragmentKind::Begin => {
                    let res = self.reassemble_fragmented_packet(buf, out.as_deref_mut(), &frag);
                    if res == Reassembly::Success {
                        buf.stats.readaheads_succeeded += 1;
                        // Every involved fragment is consumed. The begin
                        // fragment was the last of this chunk, so the next
                        // call lands in the erase-and-advance branch above.
                        return true;
                    }
                    buf.stats.readaheads_failed += 1;

                    if res == Reassembly::NotEnoughData && self.mode == ReadMode::Read {
                        // Nothing to gain from insisting on this sequence:
                        // the continuation is either missing or unpatched.
                        // Let the outer walk try other chunks.
                        let generation = buf.read_generation;
                        buf.sequences.get_mut(&self.seq_key).unwrap().skip_in_generation =
                            generation;
                        return false;
                    }

                    // Data loss (or erase mode running out of data): the
                    // fragments up to the break point are already consumed.
                    // Keep walking this sequence and mark the loss.
                    debug_assert!(
                        res == Reassembly::DataLoss
                            || (res == Reassembly::NotEnoughData && self.mode == ReadMode::Erase)
                    );
                    buf.sequences.get_mut(&self.seq_key).unwrap().data_loss = true;
                }
            }
        }
    }

    /// Consumes one fragment from `chunk_off`. Fragments are consumed in
    /// order, exactly once.
    fn consume_fragment(&mut self, buf: &mut TraceBuffer, chunk_off: u32, frag: &Fragment) {
        let mut chunk = buf.chunk_at(chunk_off as usize);
        debug_assert_eq!(
            usize::from(frag.payload_off),
            usize::from(chunk.unread_payload_off()) + usize::from(frag.hdr_size)
        );
        debug_assert!(usize::from(chunk.payload_avail) >= frag.size_with_header());

        chunk.payload_avail -= frag.size_with_header() as u16;
        let fully_consumed = chunk.payload_avail == 0;
        buf.store_chunk(chunk_off as usize, &chunk);

        if fully_consumed && self.mode == ReadMode::Read {
            buf.stats.chunks_read += 1;
            buf.stats.bytes_read += chunk.outer_size() as u64;
        }
    }

    /// Forks the sequence cursor and walks forward, greedily collecting the
    /// continuation fragments of the packet started by `initial_frag`.
    ///
    /// On success or data loss the involved fragments are consumed (so a
    /// broken packet doesn't re-trip error stats on the next visit); when
    /// there isn't enough data yet, everything is left untouched.
    fn reassemble_fragmented_packet(
        &mut self,
        buf: &mut TraceBuffer,
        mut out: Option<&mut TracePacket>,
        initial_frag: &Fragment,
    ) -> Reassembly {
        debug_assert_eq!(initial_frag.kind, FragmentKind::Begin);

        let initial_off = self.seq_cursor.chunk_off();
        debug_assert_eq!(initial_off, self.iter_off);
        if buf.chunk_at(initial_off as usize).flags & abi::CHUNK_NEEDS_PATCH != 0 {
            return Reassembly::NotEnoughData;
        }

        let mut frags: Vec<(u32, Fragment)> = Vec::with_capacity(8);
        frags.push((initial_off, *initial_frag));
        let mut cursor = self.seq_cursor; // Fork; the main cursor stays put.

        let res = loop {
            let Some(next_off) = cursor.next_chunk(buf) else {
                break Reassembly::NotEnoughData;
            };
            let next_chunk = buf.chunk_at(next_off as usize);
            if next_chunk.flags & abi::CHUNK_NEEDS_PATCH != 0 {
                break Reassembly::NotEnoughData;
            }
            if cursor.gap_detected() {
                break Reassembly::DataLoss;
            }

            // Only the first unread fragment of each follow-on chunk can
            // belong to our packet: middle chunks of a fragmented packet
            // carry exactly one fragment, and the chunk that ends the packet
            // ends it with its first fragment.
            let mut frag_iter = FragTokenizer::for_chunk(&next_chunk);
            let maybe_frag = {
                let payload = buf.chunk_payload(next_off as usize);
                frag_iter.next_fragment(payload)
            };
            let Some(frag) = maybe_frag else {
                if frag_iter.chunk_corrupted() {
                    break Reassembly::DataLoss;
                }
                // An empty chunk in the middle of a sequence. Rare but legal.
                continue;
            };

            match frag.kind {
                FragmentKind::Continue => frags.push((next_off, frag)),
                FragmentKind::End => {
                    frags.push((next_off, frag));
                    break Reassembly::Success;
                }
                // Consecutive ids, but the continue-from-prev chain is
                // broken. Leave the stranger fragments alone, they don't
                // belong to this packet; later reads deal with them.
                FragmentKind::Begin | FragmentKind::Whole => break Reassembly::DataLoss,
            }
        };

        for (chunk_off, frag) in &frags {
            if res == Reassembly::Success && frag.size > 0 {
                if let Some(packet) = out.as_deref_mut() {
                    packet.add_slice(buf.frag_payload(*chunk_off, frag));
                }
            }
            if res == Reassembly::Success || res == Reassembly::DataLoss {
                self.consume_fragment(buf, *chunk_off, frag);
            }
        }
        res
    }
}
