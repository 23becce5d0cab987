//! Benchmarks for journal scanning.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use stagerun::metadata::{Journal, JournalScanner, MetadataFile};
use tempfile::TempDir;

fn populated_journal(nodes: usize) -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    let journal = Journal::new(dir.path());
    for i in 0..nodes {
        let name = format!("pipe.STAGE{i}.fork0.chnk0");
        journal.record(&name, MetadataFile::Heartbeat).expect("record");
        journal.record(&name, MetadataFile::Log).expect("record");
    }
    dir
}

fn journal_benchmark(c: &mut Criterion) {
    let dir = populated_journal(500);

    c.bench_function("scan_cold_500", |b| {
        b.iter_batched(
            || JournalScanner::new(dir.path()),
            |mut scanner| black_box(scanner.scan().expect("scan")),
            BatchSize::SmallInput,
        );
    });

    c.bench_function("scan_unchanged_500", |b| {
        let mut scanner = JournalScanner::new(dir.path());
        scanner.scan().expect("scan");
        b.iter(|| black_box(scanner.scan().expect("scan")));
    });

    c.bench_function("parse_marker", |b| {
        b.iter(|| black_box(stagerun::metadata::JournalEntry::parse("pipe.STAGE.fork0.chnk3.heartbeat.42")));
    });
}

criterion_group!(benches, journal_benchmark);
criterion_main!(benches);
