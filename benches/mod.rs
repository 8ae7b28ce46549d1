use criterion::{criterion_group, criterion_main};


criterion_group!(
    benches,
    agent::bench_hs256_assertion,
    agent::bench_rs256_assertion,
    agent::bench_verify_platform_token,
    upload::bench_md5,
    upload::bench_plan_chunks
);
criterion_main!(benches);
