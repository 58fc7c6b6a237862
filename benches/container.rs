//! Benchmarks for payload encoding, sealing and import

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sma_rs::core::compression::{encode_payload, PayloadReader, DEFAULT_CHUNK_SIZE};
use sma_rs::{
    ActorDataService, CancelToken, CompressionConfig, LayerDocument, LocalFileCache,
    MetadataSummary, OwnerKeyPair, PackagedFile, SmaConfig, SmaFile, SmaKind,
};
use std::sync::Arc;
use tempfile::TempDir;

const SIZES: [usize; 3] = [64 * 1024, 1024 * 1024, 8 * 1024 * 1024];

fn texture(size: usize) -> Vec<u8> {
    // Mildly compressible, like real texture data
    (0..size).map(|i| ((i / 7) % 251) as u8).collect()
}

fn document(files: &[PackagedFile]) -> LayerDocument {
    let mut summary = MetadataSummary::new("bench");
    summary.files = files.iter().map(|f| f.entry.clone()).collect();
    LayerDocument {
        summary,
        filter: None,
    }
}

fn benchmark_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("payload_encode");

    for size in SIZES {
        let files = vec![PackagedFile::from_bytes(texture(size), vec!["a/b.tex".into()])];
        let doc = document(&files);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                encode_payload(
                    &doc,
                    &files,
                    &CompressionConfig::default(),
                    DEFAULT_CHUNK_SIZE,
                    &CancelToken::new(),
                )
                .unwrap()
            });
        });
    }

    group.finish();
}

fn benchmark_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("payload_stream");

    for size in SIZES {
        let files = vec![PackagedFile::from_bytes(texture(size), vec!["a/b.tex".into()])];
        let doc = document(&files);
        let encoded = encode_payload(
            &doc,
            &files,
            &CompressionConfig::default(),
            DEFAULT_CHUNK_SIZE,
            &CancelToken::new(),
        )
        .unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let cancel = CancelToken::new();
                let mut reader = PayloadReader::new(encoded.as_slice());
                let _: LayerDocument = reader.read_metadata().unwrap();
                reader.skip_entry(size as u64, &cancel).unwrap();
                reader.finish().unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_open(c: &mut Criterion) {
    let mut group = c.benchmark_group("container_open");
    group.sample_size(20);

    let dir = TempDir::new().unwrap();
    let service = ActorDataService::new(
        Arc::new(LocalFileCache::open(dir.path().join("cache")).unwrap()),
        Arc::new(OwnerKeyPair::generate()),
        SmaConfig::fast_kdf(),
    )
    .unwrap();

    for size in SIZES {
        let path = dir.path().join(format!("bench-{}.smab", size));
        service
            .export(SmaKind::Base)
            .add_bytes(texture(size), vec!["a/b.tex".into()])
            .write(&path, "pw")
            .unwrap();
        let file = SmaFile::new(&path, SmaKind::Base);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(file.try_open("pw", service.config()).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_encode, benchmark_stream, benchmark_open);
criterion_main!(benches);
