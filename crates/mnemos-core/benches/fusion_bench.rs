//! Benchmarks for search fusion and blind-index tokenization.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use mnemos_core::cortex::{RRF_C, reciprocal_rank_fusion};
use mnemos_core::shield::TokenType;
use mnemos_core::shield::blind_index::tokenize_text;

fn ranked_list(prefix: &str, n: usize) -> Vec<(String, f32)> {
    (0..n)
        .map(|i| (format!("{prefix}-{i}"), 1.0 - i as f32 / n as f32))
        .collect()
}

fn bench_rrf(c: &mut Criterion) {
    let keyword = ranked_list("mem", 200);
    let mut semantic = ranked_list("mem", 200);
    semantic.rotate_left(37);

    c.bench_function("rrf_fuse_200x2", |b| {
        b.iter(|| {
            reciprocal_rank_fusion(
                black_box(&[keyword.clone(), semantic.clone()]),
                black_box(RRF_C),
            )
        })
    });
}

fn bench_tokenize(c: &mut Criterion) {
    let key = [42u8; 32];
    let body: String = "ate pain au chocolat near the Seine before the museum opened "
        .repeat(64);

    c.bench_function("tokenize_body_with_bigrams", |b| {
        b.iter(|| tokenize_text(black_box(&key), black_box(&body), TokenType::Body, true))
    });
}

criterion_group!(benches, bench_rrf, bench_tokenize);
criterion_main!(benches);
