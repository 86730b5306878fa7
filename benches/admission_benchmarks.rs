use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use feedback_uploads::limits::{AdmissionConfig, UploadAdmission};
use std::hint::black_box;
use std::time::{Duration, Instant};

// Limiter with `clients` distinct clients, each holding a full hour of history.
fn populated_limiter(clients: usize) -> (UploadAdmission, Instant) {
    let limiter = UploadAdmission::new(AdmissionConfig {
        concurrency_ceiling: usize::MAX,
        ..AdmissionConfig::default()
    });
    let start = Instant::now();

    for client in 0..clients {
        let key = format!(
            "10.{}.{}.{}",
            (client >> 16) & 0xff,
            (client >> 8) & 0xff,
            client & 0xff
        );
        for upload in 0..14u64 {
            let at = start + Duration::from_secs(upload * 240);
            drop(limiter.admit(&key, at));
        }
    }

    (limiter, start + Duration::from_secs(14 * 240))
}

fn bench_admit(c: &mut Criterion) {
    let mut group = c.benchmark_group("admit");
    group.throughput(Throughput::Elements(1));

    for clients in [1usize, 1_000, 50_000] {
        let (limiter, now) = populated_limiter(clients);
        group.bench_with_input(BenchmarkId::new("rejected", clients), &clients, |b, _| {
            // Immediately after the last upload: rejected without mutation.
            let last_upload = now - Duration::from_secs(240);
            b.iter(|| black_box(limiter.admit("10.0.0.0", last_upload)).is_err());
        });
        group.bench_with_input(BenchmarkId::new("new_client", clients), &clients, |b, _| {
            let mut n = 0u64;
            b.iter(|| {
                n += 1;
                let key = format!("192.0.2.{n}");
                black_box(limiter.admit(&key, now)).is_ok()
            });
        });
    }

    group.finish();
}

fn bench_prune(c: &mut Criterion) {
    let mut group = c.benchmark_group("prune");

    for clients in [1_000usize, 50_000] {
        group.throughput(Throughput::Elements(clients as u64));
        group.bench_with_input(BenchmarkId::from_parameter(clients), &clients, |b, &clients| {
            b.iter_batched(
                || populated_limiter(clients),
                |(limiter, now)| black_box(limiter.prune(now + Duration::from_secs(1800))),
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_admit, bench_prune);
criterion_main!(benches);
