//! Write and readback throughput of the trace buffer.
//!
//! Chunks carry one whole packet each; the write benchmark keeps the ring
//! wrapping so the eviction path is part of the measured cost.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use tracebuf::{ClientIdentity, OverwritePolicy, TraceBuffer};

const BUFFER_SIZE: usize = 1024 * 1024;
const CHUNK_PAYLOAD: usize = 4000;

fn make_chunk() -> Vec<u8> {
    // One fragment: 2-byte varint header + payload.
    let mut data = Vec::with_capacity(CHUNK_PAYLOAD + 2);
    let len = CHUNK_PAYLOAD as u64;
    data.push((len & 0x7f) as u8 | 0x80);
    data.push((len >> 7) as u8);
    data.extend((0..CHUNK_PAYLOAD).map(|i| i as u8));
    data
}

fn bench_write(c: &mut Criterion) {
    let src = make_chunk();
    let mut group = c.benchmark_group("write");
    group.throughput(Throughput::Bytes(src.len() as u64));

    group.bench_function("copy_chunk_wrapping", |b| {
        let mut buf = TraceBuffer::new(BUFFER_SIZE, OverwritePolicy::Overwrite).unwrap();
        let mut chunk_id = 0u32;
        b.iter(|| {
            buf.copy_chunk_untrusted(
                1,
                ClientIdentity::default(),
                1,
                chunk_id,
                1,
                0,
                true,
                &src,
            );
            chunk_id = chunk_id.wrapping_add(1);
        });
    });
    group.finish();
}

fn bench_write_and_drain(c: &mut Criterion) {
    let src = make_chunk();
    let chunks_per_iter = BUFFER_SIZE / (src.len() + 64);
    let mut group = c.benchmark_group("write_and_drain");
    group.throughput(Throughput::Bytes((src.len() * chunks_per_iter) as u64));

    group.bench_function("fill_then_read_all", |b| {
        let mut chunk_id = 0u32;
        b.iter(|| {
            let mut buf = TraceBuffer::new(BUFFER_SIZE, OverwritePolicy::Overwrite).unwrap();
            for _ in 0..chunks_per_iter {
                buf.copy_chunk_untrusted(
                    1,
                    ClientIdentity::default(),
                    1,
                    chunk_id,
                    1,
                    0,
                    true,
                    &src,
                );
                chunk_id = chunk_id.wrapping_add(1);
            }
            buf.begin_read();
            let mut packets = 0usize;
            while buf.read_next_packet().is_some() {
                packets += 1;
            }
            assert_eq!(packets, chunks_per_iter);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_write, bench_write_and_drain);
criterion_main!(benches);
