//! Benchmarks for the device-side streaming paths

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use microfreeze::core::compression::{compress, gzip_wrap};
use microfreeze::{ArchiveReader, CompressionMethod, Framing, GzipUnwrap, InflateStream};
use std::io::Read;

fn source_like(len: usize) -> Vec<u8> {
    b"def handler(event):\n    return sensors.read(event.channel) * SCALE\n"
        .iter()
        .cycle()
        .take(len)
        .copied()
        .collect()
}

fn archive_of(count: usize, size: usize) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let content = source_like(size);
    for i in 0..count {
        let mut header = tar::Header::new_gnu();
        header.set_size(size as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("lib/module_{}.py", i), content.as_slice())
            .unwrap();
    }
    builder.into_inner().unwrap()
}

fn benchmark_inflate(c: &mut Criterion) {
    let mut group = c.benchmark_group("inflate_pull");

    for size in [4 * 1024, 64 * 1024, 512 * 1024].iter() {
        let compressed = compress(&source_like(*size), CompressionMethod::Zlib, 4).unwrap();
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &compressed, |b, compressed| {
            b.iter(|| {
                let mut stream = InflateStream::new(&compressed[..], Framing::Zlib);
                let mut buf = [0u8; 512];
                let mut total = 0;
                loop {
                    let n = stream.pull(&mut buf).unwrap();
                    if n == 0 {
                        break;
                    }
                    total += n;
                }
                black_box(total)
            });
        });
    }

    group.finish();
}

fn benchmark_archive_walk(c: &mut Criterion) {
    let mut group = c.benchmark_group("archive_walk");

    for count in [10, 100, 1000].iter() {
        let bytes = archive_of(*count, 2048);
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &bytes, |b, bytes| {
            b.iter(|| {
                let mut reader = ArchiveReader::from_bytes(bytes);
                let mut buf = [0u8; 512];
                let mut sink = std::io::sink();
                while reader.next_entry().unwrap().is_some() {
                    reader.entry_reader().copy_to(&mut sink, &mut buf).unwrap();
                }
                black_box(reader.entries_read())
            });
        });
    }

    group.finish();
}

fn benchmark_gzip_unwrap(c: &mut Criterion) {
    let bytes = archive_of(200, 4096);
    let wrapped = gzip_wrap(&mut bytes.as_slice(), Vec::new(), 6).unwrap();

    let mut group = c.benchmark_group("gzip_unwrap");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("bundle_800k", |b| {
        b.iter(|| {
            let mut gz = GzipUnwrap::new(&wrapped[..]).unwrap();
            let mut out = Vec::with_capacity(bytes.len());
            gz.read_to_end(&mut out).unwrap();
            black_box(out.len())
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    benchmark_inflate,
    benchmark_archive_walk,
    benchmark_gzip_unwrap
);
criterion_main!(benches);
