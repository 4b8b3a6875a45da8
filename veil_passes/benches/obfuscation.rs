//! Pass throughput over the synthetic corpus

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use veil_ir::synth::synth_module;
use veil_passes::{BogusFlowPass, FlatteningPass, Pipeline, SubstitutionPass};

fn corpus() -> Vec<veil_ir::Module> {
    (0..32).map(synth_module).collect()
}

fn bench_substitution(c: &mut Criterion) {
    let modules = corpus();
    c.bench_function("substitution", |b| {
        b.iter(|| {
            for m in &modules {
                let mut pipeline = Pipeline::new();
                pipeline.add_function_pass(Box::new(SubstitutionPass::default()));
                let mut m = m.clone();
                pipeline.run(black_box(&mut m));
            }
        })
    });
}

fn bench_bogus_flow(c: &mut Criterion) {
    let modules = corpus();
    c.bench_function("bogus_flow", |b| {
        b.iter(|| {
            for m in &modules {
                let mut pipeline = Pipeline::new();
                pipeline.add_function_pass(Box::new(BogusFlowPass::new(100)));
                let mut m = m.clone();
                pipeline.run(black_box(&mut m));
            }
        })
    });
}

fn bench_flattening(c: &mut Criterion) {
    let modules = corpus();
    c.bench_function("flattening", |b| {
        b.iter(|| {
            for m in &modules {
                let mut pipeline = Pipeline::new();
                pipeline.add_function_pass(Box::new(FlatteningPass::new()));
                let mut m = m.clone();
                pipeline.run(black_box(&mut m));
            }
        })
    });
}

criterion_group!(benches, bench_substitution, bench_bogus_flow, bench_flattening);
criterion_main!(benches);
