//! Criterion benchmarks for the SQLite state backend.
//!
//! These measure the two hot transactions of a crawl: reserving fairness
//! bin values during seeding and claiming documents for workers.

use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use harvester_state::prelude::*;
use harvester_types::job::PipelineStage;

fn bench_grab_bin_values(c: &mut Criterion) {
    let mut group = c.benchmark_group("state/grab_bin_values");

    for batch in [1usize, 16, 256] {
        group.bench_with_input(BenchmarkId::new("batch", batch), &batch, |b, &batch| {
            let backend = SqliteStateBackend::in_memory().unwrap();
            b.iter(|| {
                backend
                    .grab_bin_values("filesystem", "host-a", 0.0, batch)
                    .unwrap();
            });
        });
    }

    group.finish();
}

fn bench_claim_documents(c: &mut Criterion) {
    let mut group = c.benchmark_group("state/claim_documents");

    for batch in [1usize, 32] {
        group.bench_with_input(BenchmarkId::new("batch", batch), &batch, |b, &batch| {
            let backend = SqliteStateBackend::in_memory().unwrap();
            let job = backend
                .create_job(
                    &JobDescription::new("bench", "files").with_stage(PipelineStage::output("idx")),
                )
                .unwrap();
            backend.begin_job_run(&job.id, Utc::now()).unwrap();
            let mut counter = 0u64;

            b.iter(|| {
                let docs: Vec<NewDocument> = (0..batch)
                    .map(|_| {
                        counter += 1;
                        NewDocument {
                            identifier: format!("doc-{counter}"),
                            priority: 0.0,
                            bin_name: String::new(),
                        }
                    })
                    .collect();
                backend.add_documents(&job.id, &docs).unwrap();
                let claimed = backend.claim_documents(batch, Utc::now()).unwrap();
                for doc in claimed {
                    backend
                        .finish_document(
                            &job.id,
                            &doc.identifier,
                            &DocumentOutcome::Completed { version: None },
                        )
                        .unwrap();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_grab_bin_values, bench_claim_documents);
criterion_main!(benches);
