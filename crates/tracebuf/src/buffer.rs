//! The trace buffer: a fixed-capacity byte ring of chunk records.
//!
//! Writes go through [`TraceBuffer::copy_chunk_untrusted`]: the caller hands
//! in a private copy of a producer's shared-memory chunk, the buffer
//! tokenizes it (rejecting malformed input), reserves space at the write
//! cursor (wrapping and evicting as needed) and links the new record into
//! the owning sequence's index. Readback drains packets via
//! [`TraceBuffer::begin_read`] / [`TraceBuffer::read_next_packet`].
//!
//! The buffer is deliberately not thread-safe: the service task runner calls
//! every entry point serially, which the `&mut self` receivers enforce at
//! compile time. All bounded-lifetime state lives inside the ring itself;
//! the only heap state outside it is the sequence map and the stats.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::chunk::{ChunkRecord, ALIGNMENT, CHUNK_INCOMPLETE, HEADER_SIZE};
use crate::frag::{FragTokenizer, Fragment};
use crate::invariants::{
    debug_assert_aligned_and_within_bounds, debug_assert_expected_client_fault,
};
use crate::packet::{PacketSequenceProperties, TracePacket};
use crate::reader::{ReadMode, SequenceReader};
use crate::sequence::{chunk_id_cmp, SequenceState};
use crate::stats::{BufferStats, WriterStats};
use crate::{abi, sequence_key, ChunkId, ClientIdentity, ProducerId, SequenceKey, WriterId};

/// Buffer sizes are rounded up to this.
const PAGE_SIZE: usize = 4096;

/// Number of most-recently-emptied sequences retained after a GC pass, to
/// preserve data-loss detection for long-idle writers.
const KEEP_LAST_EMPTY_SEQ: usize = 1024;

/// The GC starts only past this, so steady-state churn of one sequence
/// emptying and refilling does not cause repeated sorts.
const EMPTY_SEQUENCES_GC_THRESHOLD: usize = KEEP_LAST_EMPTY_SEQ + 128;

/// What happens when the ring runs out of space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverwritePolicy {
    /// New writes evict the oldest chunks.
    #[default]
    Overwrite,
    /// The first write that cannot fit turns the buffer read-only for the
    /// rest of its life.
    Discard,
}

/// One out-of-band correction: overwrites the packet size header at
/// `offset_untrusted` within a chunk's payload region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Patch {
    pub offset_untrusted: u32,
    pub data: [u8; abi::PACKET_HEADER_SIZE],
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CreateError {
    #[error("trace buffer allocation failed (size: {size} bytes)")]
    AllocationFailed { size: usize },
    #[error("trace buffer size {size} exceeds the 32-bit offset limit")]
    TooLarge { size: usize },
}

/// One successfully read packet, together with the identity of the sequence
/// that produced it.
#[derive(Clone, Debug)]
pub struct ReadPacket {
    pub packet: TracePacket,
    pub sequence: PacketSequenceProperties,
    /// Data was lost on this sequence since the previous packet yielded for
    /// it (ring wrap over unread chunks, id gap, corrupted chain).
    pub previous_packet_dropped: bool,
}

pub struct TraceBuffer {
    /// The ring. Chunk records and payloads live here and nowhere else;
    /// everything is addressed by byte offset so a clone is a flat copy.
    pub(crate) data: Box<[u8]>,
    pub(crate) size: usize,

    /// High watermark: bytes written before the first wraparound. Grows
    /// until it saturates at `size`. The region past it is untouched zeros.
    pub(crate) used_size: usize,

    /// Write cursor.
    pub(crate) wr: usize,
    /// Read cursor, reset to `wr` on every `begin_read()`.
    pub(crate) rd: usize,

    /// The active inner walk, while one is in flight.
    seq_reader: Option<SequenceReader>,

    pub(crate) stats: BufferStats,
    writer_stats: WriterStats,

    overwrite_policy: OverwritePolicy,

    pub(crate) sequences: HashMap<SequenceKey, SequenceState>,

    /// `COUNT(sequences) WHERE chunks.is_empty()`, maintained best effort;
    /// the GC revalidates against the map.
    pub(crate) empty_sequences: usize,

    /// Incremented on every `begin_read()`.
    pub(crate) read_generation: u64,

    /// Monotonic stamp of sequence-emptying events, for GC ordering.
    pub(crate) seq_age: u64,

    /// Set on clones. Writing to a read-only buffer is a caller bug and
    /// halts the process.
    read_only: bool,

    /// Discard policy only: set permanently by the first write that did not
    /// fit.
    discard_writes: bool,

    /// Disables the debug assertions that flag malformed producer input, for
    /// tests that emulate a malicious producer.
    pub(crate) suppress_client_checks: bool,
}

impl TraceBuffer {
    /// Allocates a ring of `size` bytes, rounded up to a page boundary.
    /// Sizes beyond the 32-bit offset space are rejected; so is a failed
    /// allocation.
    pub fn new(size: usize, policy: OverwritePolicy) -> Result<Self, CreateError> {
        let rounded = (size.max(1) + (PAGE_SIZE - 1)) & !(PAGE_SIZE - 1);
        if rounded > u32::MAX as usize {
            return Err(CreateError::TooLarge { size });
        }

        let mut bytes: Vec<u8> = Vec::new();
        if bytes.try_reserve_exact(rounded).is_err() {
            log::warn!("trace buffer allocation failed (size: {rounded} bytes)");
            return Err(CreateError::AllocationFailed { size: rounded });
        }
        bytes.resize(rounded, 0);

        Ok(Self {
            data: bytes.into_boxed_slice(),
            size: rounded,
            used_size: 0,
            wr: 0,
            rd: 0,
            seq_reader: None,
            stats: BufferStats { buffer_size: rounded as u64, ..BufferStats::default() },
            writer_stats: WriterStats::default(),
            overwrite_policy: policy,
            sequences: HashMap::new(),
            empty_sequences: 0,
            read_generation: 0,
            seq_age: 0,
            read_only: false,
            discard_writes: false,
            suppress_client_checks: false,
        })
    }

    // ---------------------------------------------------------------------
    // ACCESSORS
    // ---------------------------------------------------------------------

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// High watermark of committed bytes; non-decreasing, saturates at
    /// `size()` on the first wrap.
    #[inline]
    pub fn used_size(&self) -> usize {
        self.used_size
    }

    #[inline]
    pub fn has_data(&self) -> bool {
        self.used_size > 0
    }

    #[inline]
    pub fn overwrite_policy(&self) -> OverwritePolicy {
        self.overwrite_policy
    }

    #[inline]
    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }

    /// Per-(producer, writer) histograms of effective chunk payload sizes.
    #[inline]
    pub fn writer_stats(&self) -> &WriterStats {
        &self.writer_stats
    }

    /// Makes every further write a fatal error. Clones are born this way.
    pub fn set_read_only(&mut self) {
        self.read_only = true;
    }

    /// For tests that emulate a buggy or malicious producer: keeps the
    /// recoverable handling (stats + drop) but silences the debug
    /// assertions that would otherwise flag the malformed input.
    pub fn suppress_client_checks_for_testing(&mut self) {
        self.suppress_client_checks = true;
    }

    // ---------------------------------------------------------------------
    // RECORD ACCESS (crate-internal)
    // ---------------------------------------------------------------------

    pub(crate) fn chunk_at_unchecked(&self, off: usize) -> ChunkRecord {
        debug_assert_aligned_and_within_bounds!(self, off);
        ChunkRecord::load(&self.data, off)
    }

    /// Loads and validates the record at `off`. A failure here is a bug in
    /// the buffer itself (a wild write), never producer input, and halts.
    pub(crate) fn chunk_at(&self, off: usize) -> ChunkRecord {
        let rec = self.chunk_at_unchecked(off);
        assert!(rec.outer_size() <= self.size - off, "chunk record at {off} overruns the buffer");
        assert!(rec.checksum_valid(off), "chunk record checksum mismatch at offset {off}");
        rec
    }

    pub(crate) fn store_chunk(&mut self, off: usize, rec: &ChunkRecord) {
        debug_assert_aligned_and_within_bounds!(self, off);
        rec.store(&mut self.data, off);
    }

    /// Writes a fresh (padding-shaped) record at `off`, growing the high
    /// watermark if the record extends past it.
    pub(crate) fn create_chunk(&mut self, off: usize, size: usize) -> ChunkRecord {
        debug_assert_aligned_and_within_bounds!(self, off);
        let end = off + ChunkRecord::outer_size_for(size);
        if end > self.used_size {
            self.used_size = end;
        }
        let rec = ChunkRecord::new(off, size);
        rec.store(&mut self.data, off);
        rec
    }

    /// The valid payload region of the chunk at `off`.
    pub(crate) fn chunk_payload(&self, off: usize) -> &[u8] {
        let rec = self.chunk_at(off);
        let begin = off + HEADER_SIZE;
        &self.data[begin..begin + usize::from(rec.payload_size)]
    }

    /// The payload bytes of one tokenized fragment of the chunk at
    /// `chunk_off`.
    pub(crate) fn frag_payload(&self, chunk_off: u32, frag: &Fragment) -> &[u8] {
        let begin = chunk_off as usize + HEADER_SIZE + usize::from(frag.payload_off);
        &self.data[begin..begin + usize::from(frag.size)]
    }

    #[inline]
    fn size_to_end(&self) -> usize {
        self.size - self.wr
    }

    fn note_abi_violation(&mut self, what: &str) {
        self.stats.abi_violations += 1;
        log::debug!("abi violation: {what}");
    }

    // ---------------------------------------------------------------------
    // WRITE PATH
    // ---------------------------------------------------------------------

    /// Copies a chunk committed by a producer into the ring.
    ///
    /// `src` must be a private copy of the shared-memory chunk, so a
    /// malicious producer cannot race the validation below. Nothing in it is
    /// trusted; `producer_id` and `client_identity` are vouched for by the
    /// IPC layer.
    ///
    /// May be called again for the same `(producer, writer, chunk_id)`: the
    /// service commits partially written chunks (`chunk_complete = false`)
    /// when scraping, and the producer re-commits them later. A re-commit
    /// may only grow the payload and add flags.
    ///
    /// When `chunk_complete` is false the last fragment is discarded (the
    /// producer may still be writing it) and reads will not progress past
    /// this chunk until it is re-committed complete.
    pub fn copy_chunk_untrusted(
        &mut self,
        producer_id: ProducerId,
        client_identity: ClientIdentity,
        writer_id: WriterId,
        chunk_id: ChunkId,
        num_fragments: u16,
        chunk_flags: u8,
        chunk_complete: bool,
        src: &[u8],
    ) {
        assert!(!self.read_only, "write to a read-only trace buffer clone");

        if self.discard_writes {
            return self.discard_write();
        }

        let mut num_fragments = num_fragments;
        let mut chunk_flags = chunk_flags;
        if !chunk_complete {
            chunk_flags |= CHUNK_INCOMPLETE;
            if num_fragments > 0 {
                num_fragments -= 1;
                // These flags only concern the last (dropped) fragment.
                // Clearing them lets the reader consume the rest of the
                // chunk.
                chunk_flags &= !abi::CHUNK_LAST_PACKET_CONTINUES_ON_NEXT;
                chunk_flags &= !abi::CHUNK_NEEDS_PATCH;
            }
        }

        // Tokenize the declared fragments to compute the effective payload
        // size, dropping whatever padding the producer left after them.
        let src_size = src.len();
        let mut all_frags_size = 0usize;
        let mut tokenizer = FragTokenizer::new(src_size, 0, chunk_flags);
        for _ in 0..num_fragments {
            match tokenizer.next_fragment(src) {
                Some(frag) => all_frags_size += frag.size_with_header(),
                None => {
                    if !tokenizer.trace_writer_data_drop() {
                        // Fewer fragments than declared, or one of them runs
                        // out of bounds.
                        self.note_abi_violation("fragments truncated or out of bounds");
                        debug_assert_expected_client_fault!(self);
                    }
                    break;
                }
            }
        }
        let trace_writer_data_drop = tokenizer.trace_writer_data_drop();
        assert!(all_frags_size <= src_size);

        // An incomplete chunk reserves its full declared size, leaving
        // headroom for the payload to grow on re-commit.
        let record_size = if chunk_complete { all_frags_size } else { src_size };
        if record_size > ChunkRecord::MAX_SIZE {
            self.note_abi_violation("chunk larger than the maximum record size");
            debug_assert_expected_client_fault!(self);
            return;
        }
        let record_outer_size = ChunkRecord::outer_size_for(record_size);
        if record_outer_size > self.size {
            self.note_abi_violation("chunk larger than the buffer");
            debug_assert_expected_client_fault!(self);
            return;
        }

        let seq_key = sequence_key(producer_id, writer_id);
        self.writer_stats.record(seq_key, all_frags_size as u64);

        let seq_is_new = !self.sequences.contains_key(&seq_key);
        if trace_writer_data_drop {
            self.stats.trace_writer_packet_loss += 1;
        }
        let seq = self
            .sequences
            .entry(seq_key)
            .or_insert_with(|| SequenceState::new(producer_id, writer_id, client_identity));
        if trace_writer_data_drop {
            seq.data_loss = true;
        }

        // Re-commits of chunks that were already consumed are dropped: too
        // late, honoring them would only corrupt the sequence further.
        let stale = seq
            .last_chunk_id_consumed
            .is_some_and(|last| chunk_id_cmp(chunk_id, last) != std::cmp::Ordering::Greater);
        if stale {
            self.stats.chunks_discarded += 1;
            debug_assert_expected_client_fault!(self);
            return;
        }

        // Not enough room before the end of the buffer: pad the tail, wrap.
        let cached_size_to_end = self.size_to_end();
        if record_outer_size > cached_size_to_end {
            if self.overwrite_policy == OverwritePolicy::Discard {
                return self.discard_write();
            }
            self.evict_next_chunks_for(cached_size_to_end);
            self.wr = 0;
            self.stats.write_wrap_count += 1;
            debug_assert!(self.size_to_end() >= record_outer_size);
        }

        // Evict whatever lives in the range the new record will occupy.
        self.evict_next_chunks_for(record_outer_size);

        // Find the insertion point in the sequence's chunk list. Scanned in
        // reverse: chunks arrive in order in the vast majority of cases,
        // scraping is the only source of slightly out-of-order commits.
        let (insert_idx, recommit_off, list_len) = {
            let seq = &self.sequences[&seq_key];
            let mut idx = seq.chunks.len();
            let mut recommit = None;
            while idx > 0 {
                let other_off = seq.chunks[idx - 1];
                let other = self.chunk_at(other_off as usize);
                match chunk_id_cmp(chunk_id, other.chunk_id) {
                    std::cmp::Ordering::Greater => break,
                    std::cmp::Ordering::Equal => {
                        recommit = Some(other_off);
                        break;
                    }
                    std::cmp::Ordering::Less => idx -= 1,
                }
            }
            (idx, recommit, seq.chunks.len())
        };

        if let Some(recommit_off) = recommit_off {
            self.recommit_chunk(recommit_off, chunk_flags, all_frags_size, src);
            return;
        }

        let mut record = self.create_chunk(self.wr, record_size);
        record.chunk_id = chunk_id;
        record.seq_key = seq_key;
        record.payload_size = all_frags_size as u16;
        record.payload_avail = all_frags_size as u16;
        record.flags = chunk_flags;
        self.store_chunk(self.wr, &record);

        let payload_begin = self.wr + HEADER_SIZE;
        self.data[payload_begin..payload_begin + all_frags_size]
            .copy_from_slice(&src[..all_frags_size]);

        if insert_idx != list_len {
            self.stats.chunks_committed_out_of_order += 1;
        }
        let new_off = self.wr as u32;
        let seq = self.sequences.get_mut(&seq_key).expect("sequence created above");
        seq.chunks.insert(insert_idx, new_off);
        if seq.chunks.len() == 1 && !seq_is_new {
            debug_assert!(self.empty_sequences > 0);
            self.empty_sequences -= 1;
        }

        self.wr += record_outer_size;
        debug_assert!(self.wr <= self.size && self.wr <= self.used_size);
        if self.wr >= self.size {
            self.wr = 0;
        }

        self.stats.chunks_written += 1;
        self.stats.bytes_written += record_outer_size as u64;

        // Sequence GC can only run here: the readback path caches sequence
        // state across calls, but never across a copy_chunk_untrusted().
        if self.empty_sequences > EMPTY_SEQUENCES_GC_THRESHOLD {
            self.delete_stale_empty_sequences();
        }
    }

    /// Overwrites an existing record with a re-committed chunk. The payload
    /// may never shrink, cannot grow past the original capacity, and flags
    /// may only accumulate; bytes already consumed stay consumed.
    fn recommit_chunk(
        &mut self,
        recommit_off: u32,
        chunk_flags: u8,
        all_frags_size: usize,
        src: &[u8],
    ) {
        let mut rec = self.chunk_at(recommit_off as usize);
        let prev_abi_flags = rec.flags & abi::CHUNK_FLAGS_MASK;
        if all_frags_size < usize::from(rec.payload_size)
            || all_frags_size > usize::from(rec.size)
            || (prev_abi_flags & chunk_flags) != prev_abi_flags
        {
            self.note_abi_violation("re-commit shrinks the chunk or removes flags");
            debug_assert_expected_client_fault!(self);
            return;
        }

        rec.flags &= !CHUNK_INCOMPLETE;
        if all_frags_size == usize::from(rec.payload_size) {
            // Identical payload: nothing to rewrite, but the chunk is now
            // complete.
            self.store_chunk(recommit_off as usize, &rec);
            return;
        }

        let payload_consumed = rec.payload_size - rec.payload_avail;
        rec.payload_size = all_frags_size as u16;
        rec.payload_avail = all_frags_size as u16 - payload_consumed;
        rec.flags |= chunk_flags;
        self.store_chunk(recommit_off as usize, &rec);

        let payload_begin = recommit_off as usize + HEADER_SIZE;
        self.data[payload_begin..payload_begin + all_frags_size]
            .copy_from_slice(&src[..all_frags_size]);
        self.stats.chunks_rewritten += 1;
    }

    fn discard_write(&mut self) {
        debug_assert_eq!(self.overwrite_policy, OverwritePolicy::Discard);
        if !self.discard_writes {
            log::debug!("trace buffer full under discard policy, dropping all further writes");
        }
        self.discard_writes = true;
        self.stats.chunks_discarded += 1;
    }

    // ---------------------------------------------------------------------
    // EVICTION
    // ---------------------------------------------------------------------

    /// Clears `bytes_to_clear` bytes starting at the write cursor, draining
    /// every live chunk in the range through an erase-mode sequence reader
    /// first, so unread fragments surface as data loss. If the range ends in
    /// the middle of a record, a padding record covers the remainder (the
    /// record alignment guarantees the remainder fits a header).
    fn evict_next_chunks_for(&mut self, bytes_to_clear: usize) {
        assert!(!self.discard_writes);
        debug_assert!(bytes_to_clear >= HEADER_SIZE);
        debug_assert_eq!(bytes_to_clear % ALIGNMENT, 0);
        debug_assert_aligned_and_within_bounds!(self, self.wr);
        let clear_end = self.wr + bytes_to_clear;
        debug_assert!(clear_end <= self.size);

        let mut off = self.wr;
        while off < clear_end {
            if off >= self.used_size {
                // First lap around the buffer: virgin territory, nothing to
                // delete.
                break;
            }
            let rec = self.chunk_at(off);
            let rec_outer_size = rec.outer_size();
            let next_off = off + rec_outer_size;
            if rec.is_padding() {
                self.stats.padding_bytes_cleared += rec_outer_size as u64;
                off = next_off;
                continue;
            }

            // Drain the sequence up to this chunk. Chunks prior to it in id
            // order are read first; a trailing fragmented packet may pull in
            // one more chunk, which stays in the buffer partially consumed.
            let mut reader = SequenceReader::new(self, off as u32, ReadMode::Erase);
            let mut cleared_unconsumed_fragments = false;
            while reader.read_next_packet_in_seq_order(self, None) {
                cleared_unconsumed_fragments = true;
            }
            if cleared_unconsumed_fragments {
                self.sequences
                    .get_mut(&reader.seq_key())
                    .expect("sequence outlives its reader")
                    .data_loss = true;
            }
            debug_assert!(self.chunk_at(off).is_padding());

            self.stats.chunks_overwritten += 1;
            self.stats.bytes_overwritten += rec_outer_size as u64;
            off = next_off;
        }

        // Second pass: everything in range is padding now; re-pad the tail
        // if the clear range splits a record.
        let mut off = self.wr;
        while off < clear_end && off < self.used_size {
            let rec = self.chunk_at(off);
            debug_assert!(rec.is_padding());
            let rec_end = off + rec.outer_size();
            if clear_end > off && clear_end < rec_end {
                debug_assert!(rec_end - clear_end >= HEADER_SIZE);
                let pad = self.create_chunk(clear_end, rec_end - clear_end - HEADER_SIZE);
                self.stats.padding_bytes_written += pad.outer_size() as u64;
            }
            off = rec_end;
        }
    }

    // ---------------------------------------------------------------------
    // PATCHING
    // ---------------------------------------------------------------------

    /// Applies a batch of patches to the given chunk, if it is still in the
    /// buffer. With `other_patches_pending == false` the chunk becomes
    /// readable afterwards.
    ///
    /// Returns false (and counts a failed patch) if the chunk is gone or any
    /// offset is out of range; malicious offsets can never touch a
    /// neighbouring chunk or bytes the reader already consumed.
    pub fn try_patch_chunk_contents(
        &mut self,
        producer_id: ProducerId,
        writer_id: WriterId,
        chunk_id: ChunkId,
        patches: &[Patch],
        other_patches_pending: bool,
    ) -> bool {
        assert!(!self.read_only, "patch of a read-only trace buffer clone");

        // Linear search, newest first: patches almost always target the most
        // recently committed chunk.
        let seq_key = sequence_key(producer_id, writer_id);
        let chunk_off = self.sequences.get(&seq_key).and_then(|seq| {
            seq.chunks
                .iter()
                .rev()
                .copied()
                .find(|&off| self.chunk_at(off as usize).chunk_id == chunk_id)
        });
        let Some(off) = chunk_off else {
            // The chunk is gone (or never existed); nothing to patch.
            self.stats.patches_failed += 1;
            return false;
        };
        let off = off as usize;

        let mut rec = self.chunk_at(off);
        let payload_size = usize::from(rec.payload_size);
        let consumed_tail = payload_size - usize::from(rec.payload_avail);
        for patch in patches {
            let patch_off = patch.offset_untrusted as usize;
            // Either the writer wrapped over this chunk id while the IPC was
            // in flight, or the producer is malicious. Already-consumed
            // bytes cannot be rewritten either way.
            if payload_size < abi::PACKET_HEADER_SIZE
                || patch_off > payload_size - abi::PACKET_HEADER_SIZE
                || patch_off < consumed_tail
            {
                self.stats.patches_failed += 1;
                return false;
            }
            let dst = off + HEADER_SIZE + patch_off;
            self.data[dst..dst + abi::PACKET_HEADER_SIZE].copy_from_slice(&patch.data);
        }
        self.stats.patches_succeeded += patches.len() as u64;

        if !other_patches_pending {
            rec.flags &= !abi::CHUNK_NEEDS_PATCH;
            self.store_chunk(off, &rec);
        }
        true
    }

    // ---------------------------------------------------------------------
    // READ PATH
    // ---------------------------------------------------------------------

    /// Resets the read cursor to the oldest chunk in buffer order and starts
    /// a new read generation. Reads are not idempotent: packets are consumed
    /// as they are yielded.
    ///
    /// No other buffer call may be interleaved between `begin_read()` and
    /// the `read_next_packet()` calls that follow it.
    pub fn begin_read(&mut self) {
        // The oldest data sits at the write cursor once the buffer has
        // wrapped, at offset 0 before that.
        self.rd = if self.wr == self.used_size { 0 } else { self.wr };
        self.seq_reader = None;
        self.read_generation += 1;
    }

    /// Yields the next complete packet, or `None` once the whole buffer has
    /// been scanned without finding one.
    ///
    /// Packets of a given `(producer, writer)` sequence come out in FIFO
    /// order. No ordering is guaranteed across sequences beyond approximate
    /// arrival order.
    pub fn read_next_packet(&mut self) -> Option<ReadPacket> {
        let mut packet = TracePacket::default();

        // Outer layer: buffer order, starting at the write cursor. Inner
        // layer: the sequence reader, which owns one target chunk at a time.
        loop {
            let next_rd;
            if self.seq_reader.is_none() {
                // With the buffer completely empty this loads the all-zero
                // record at offset 0, which is valid padding of outer size
                // HEADER_SIZE; no special case needed.
                let rec = self.chunk_at(self.rd);
                if !rec.is_padding() {
                    let reader = SequenceReader::new(self, self.rd as u32, ReadMode::Read);
                    self.seq_reader = Some(reader);
                    continue;
                }
                next_rd = self.rd + rec.outer_size();
            } else {
                let mut reader = self.seq_reader.take().expect("checked above");
                if reader.read_next_packet_in_seq_order(self, Some(&mut packet)) {
                    let seq = self
                        .sequences
                        .get_mut(&reader.seq_key())
                        .expect("sequence outlives its reader");
                    let sequence = PacketSequenceProperties {
                        producer_id: seq.producer_id,
                        client_identity: seq.client_identity,
                        writer_id: seq.writer_id,
                    };
                    let previous_packet_dropped = seq.data_loss;
                    seq.data_loss = false;
                    self.seq_reader = Some(reader);
                    return Some(ReadPacket { packet, sequence, previous_packet_dropped });
                }
                // The sequence ran out of data (or is blocked); resume the
                // buffer-order walk after the reader's target chunk.
                let end_off = reader.end_off() as usize;
                next_rd = end_off + self.chunk_at(end_off).outer_size();
            }

            debug_assert!(next_rd > 0);
            let wrap = next_rd >= self.used_size;
            self.seq_reader = None;
            if next_rd == self.wr || (wrap && self.wr == 0) {
                // Traversed the full buffer back to the write cursor.
                return None;
            }
            self.rd = if wrap { 0 } else { next_rd };
        }
    }

    // ---------------------------------------------------------------------
    // CLONING
    // ---------------------------------------------------------------------

    /// Snapshots the buffer into an independent read-only copy: same bytes
    /// up to the high watermark, same sequence map, read state reset. The
    /// live buffer is unaffected and the clone never sees later writes.
    pub fn clone_read_only(&self) -> Result<TraceBuffer, CreateError> {
        let mut clone = TraceBuffer::new(self.size, self.overwrite_policy)?;
        clone.data[..self.used_size].copy_from_slice(&self.data[..self.used_size]);
        clone.used_size = self.used_size;
        clone.wr = self.wr;
        clone.sequences = self.sequences.clone();
        clone.read_generation = self.read_generation;
        clone.discard_writes = self.discard_writes;
        clone.read_only = true;

        clone.stats = self.stats.clone();
        clone.stats.bytes_read = 0;
        clone.stats.chunks_read = 0;
        clone.stats.readaheads_succeeded = 0;
        clone.stats.readaheads_failed = 0;
        Ok(clone)
    }

    // ---------------------------------------------------------------------
    // SEQUENCE GC
    // ---------------------------------------------------------------------

    /// Trims the oldest empty sequences, keeping the most recent
    /// [`KEEP_LAST_EMPTY_SEQ`] so their `last_chunk_id_consumed` keeps
    /// detecting data losses for writers that only commit sporadically.
    fn delete_stale_empty_sequences(&mut self) {
        let mut empty: Vec<(u64, SequenceKey)> = self
            .sequences
            .iter()
            .filter(|(_, seq)| seq.chunks.is_empty())
            .map(|(key, seq)| (seq.age_for_gc, *key))
            .collect();
        if empty.len() < EMPTY_SEQUENCES_GC_THRESHOLD {
            return;
        }

        empty.sort_unstable();
        let n_oldest = empty.len() - KEEP_LAST_EMPTY_SEQ;
        for &(_, key) in &empty[..n_oldest] {
            self.sequences.remove(&key);
        }
        self.empty_sequences = KEEP_LAST_EMPTY_SEQ;

        // Defensive: the reader caches sequence keys, but is always reset by
        // begin_read() before the next read cycle anyway.
        self.seq_reader = None;
    }
}

impl fmt::Debug for TraceBuffer {
    /// Compact dump of the record chain, for debugging test failures.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "TraceBuffer(wr: {}, size: {}, used_size: {}, read_only: {})",
            self.wr, self.size, self.used_size, self.read_only
        )?;
        let mut off = 0;
        while off + HEADER_SIZE <= self.used_size {
            let rec = ChunkRecord::load(&self.data, off);
            if !rec.checksum_valid(off) {
                writeln!(f, "  [{off:06}] !! invalid record !!")?;
                break;
            }
            writeln!(
                f,
                "  [{:06}-{:06}] id={:05} seq={:08x} payload={:05}({:05} unread) flags={:02x}",
                off,
                off + rec.outer_size(),
                rec.chunk_id,
                rec.seq_key,
                rec.payload_size,
                rec.payload_avail,
                rec.flags
            )?;
            off += rec.outer_size();
        }
        Ok(())
    }
}
