//! Rate limiter throughput benchmark.
//!
//! Measures check_rate_limit and consume_quota latency against the in-memory
//! counter store as the sliding-window log grows.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use toolgate_core::rate_limit::{RateLimitConfig, RateLimiter, UserRole, WindowLimits};
use toolgate_core::store::InMemoryCounterStore;
use toolgate_core::types::UserId;

fn limiter() -> RateLimiter {
    let roomy = WindowLimits {
        per_minute: u32::MAX,
        per_hour: u32::MAX,
        per_day: u32::MAX,
    };
    let config = RateLimitConfig {
        admin: roomy,
        ..Default::default()
    };
    RateLimiter::new(Arc::new(InMemoryCounterStore::new()), config)
}

fn bench_check_rate_limit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let window_sizes: &[u32] = &[0, 100, 1000, 10_000];

    let mut group = c.benchmark_group("check_rate_limit");
    for &size in window_sizes {
        let limiter = limiter();
        let user = UserId::must("bench");
        rt.block_on(limiter.consume_quota(&user, UserRole::Admin, "tool_execution", size));

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    limiter
                        .check_rate_limit(black_box(&user), UserRole::Admin, "tool_execution")
                        .await
                })
            });
        });
    }
    group.finish();
}

fn bench_consume_quota(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let limiter = limiter();
    let user = UserId::must("bench");

    c.bench_function("consume_quota", |b| {
        b.iter(|| {
            rt.block_on(async {
                limiter
                    .consume_quota(black_box(&user), UserRole::Admin, "tool_execution", 1)
                    .await
            })
        });
    });
}

criterion_group!(benches, bench_check_rate_limit, bench_consume_quota);
criterion_main!(benches);
