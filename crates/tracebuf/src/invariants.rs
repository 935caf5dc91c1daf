//! Debug assertion macros for buffer invariants.
//!
//! Only active in debug builds, zero overhead in release. These guard the
//! buffer's *own* state; violations mean a bug in this crate, not bad
//! producer input. Checks on untrusted input instead use
//! `debug_assert_expected_client_fault!`, which tests feeding malicious
//! chunks silence via `suppress_client_checks_for_testing()`.

/// Assert that a buffer offset is record-aligned and leaves room for a
/// chunk header.
///
/// **Invariant**: `off % ALIGNMENT == 0 && off <= size - HEADER_SIZE`
macro_rules! debug_assert_aligned_and_within_bounds {
    ($buf:expr, $off:expr) => {
        debug_assert!(
            ($off & (crate::chunk::ALIGNMENT - 1)) == 0,
            "unaligned chunk offset {}",
            $off
        );
        debug_assert!(
            $off <= $buf.size - crate::chunk::HEADER_SIZE,
            "chunk offset {} out of bounds (buffer size {})",
            $off,
            $buf.size
        );
    };
}

/// Assert the byte accounting of a chunk record.
///
/// **Invariant**: `payload_avail <= payload_size <= size`
macro_rules! debug_assert_chunk_accounting {
    ($chunk:expr) => {
        debug_assert!(
            $chunk.payload_avail <= $chunk.payload_size && $chunk.payload_size <= $chunk.size,
            "broken chunk accounting: avail {} size {} cap {}",
            $chunk.payload_avail,
            $chunk.payload_size,
            $chunk.size
        )
    };
}

/// Assert that a condition only failed because a test is deliberately
/// emulating a buggy producer.
///
/// The recoverable handling (count the violation, drop the input) runs in
/// all builds; this makes unexpected malformed input loud in debug builds.
macro_rules! debug_assert_expected_client_fault {
    ($buf:expr) => {
        debug_assert!(
            $buf.suppress_client_checks,
            "malformed producer input; tests emulating a buggy producer must \
             call suppress_client_checks_for_testing()"
        )
    };
}

pub(crate) use debug_assert_aligned_and_within_bounds;
pub(crate) use debug_assert_chunk_accounting;
pub(crate) use debug_assert_expected_client_fault;
