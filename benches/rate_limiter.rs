use std::time::{Duration, Instant};

use ai_firewall_engine::core::matchers::{PiiFieldSpec, PiiMatcher, StandardPiiField};
use ai_firewall_engine::core::rate_limiter::{RateLimit, RateLimitKey, SlidingWindowLimiter};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn key(subject: usize) -> RateLimitKey {
    RateLimitKey {
        application_id: "1".to_string(),
        model: "gpt-4-turbo".to_string(),
        rule: "rate_limiting#0".to_string(),
        subject: format!("ip:10.0.{}.{}", subject / 256, subject % 256),
    }
}

fn rate_limiter_benchmark(c: &mut Criterion) {
    let limit = RateLimit {
        requests: 1_000,
        period: Duration::from_secs(60),
    };

    let limiter = SlidingWindowLimiter::default();
    let hot = key(0);
    c.bench_function("rate_limiter_check_single_key", |b| {
        b.iter(|| black_box(limiter.check(black_box(&hot), limit)))
    });

    let limiter = SlidingWindowLimiter::default();
    let keys: Vec<RateLimitKey> = (0..10_000).map(key).collect();
    let mut i = 0;
    c.bench_function("rate_limiter_check_10k_keys", |b| {
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(limiter.check_at(&keys[i], limit, Instant::now()))
        })
    });
}

fn pii_matcher_benchmark(c: &mut Criterion) {
    let specs = StandardPiiField::ALL
        .iter()
        .map(|field| PiiFieldSpec::Standard { field: *field })
        .chain(std::iter::once(PiiFieldSpec::Custom {
            name: "Internal Project ID".to_string(),
            pattern: "PROJ-[A-Z0-9]{8}".to_string(),
        }))
        .collect();
    let matcher = match PiiMatcher::compile(specs, false) {
        Ok(matcher) => matcher,
        Err(e) => panic!("benchmark patterns must compile: {e}"),
    };
    let text = "Hi, I'm Jane (jane.doe@example.com, 555-123-4567). My card is 4111 1111 1111 1111 \
                and the ticket references PROJ-AB12CD34 from host 192.168.1.20. "
        .repeat(8);

    c.bench_function("pii_matcher_find_all", |b| b.iter(|| black_box(matcher.find_all(black_box(&text)))));
}

criterion_group!(benches, rate_limiter_benchmark, pii_matcher_benchmark);
criterion_main!(benches);
