//! End-to-end coordination throughput with trivial callbacks: measures the
//! manager loop, the channels, and the history bookkeeping rather than any
//! real simulation work.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ensemble::{
    Blob, CalcContext, CalcResult, DType, Ensemble, ExitCriteria, FieldDef, Frame, GenSpecs,
    RunConfig, Schema, SimSpecs, Value,
};

fn x_schema() -> Schema {
    Schema::new(vec![FieldDef::new("x", DType::Float)]).unwrap()
}

fn f_schema() -> Schema {
    Schema::new(vec![FieldDef::new("f", DType::Float)]).unwrap()
}

fn trivial_specs() -> (SimSpecs, GenSpecs) {
    let sim = SimSpecs::new(
        |input: &Frame, _persis: &mut Blob, _ctx: &mut CalcContext<'_>| -> anyhow::Result<CalcResult> {
            let x = input.get("x", 0)?.as_float().unwrap();
            Ok(CalcResult::done(Frame::from_rows(
                f_schema(),
                vec![vec![Value::Float(x * 2.0)]],
            )?))
        },
        &["x"],
        vec![FieldDef::new("f", DType::Float)],
    );
    let gen = GenSpecs::new(
        |_input: Option<&Frame>, persis: &mut Blob, _ctx: &mut CalcContext<'_>| -> anyhow::Result<CalcResult> {
            let next = persis
                .get("next")
                .and_then(Value::as_float)
                .unwrap_or(0.0);
            persis.insert("next".to_string(), Value::Float(next + 8.0));
            let rows = (0..8).map(|i| vec![Value::Float(next + i as f64)]).collect();
            Ok(CalcResult::done(Frame::from_rows(x_schema(), rows)?))
        },
        &[],
        vec![FieldDef::new("x", DType::Float)],
    );
    (sim, gen)
}

fn bench_round_trips(c: &mut Criterion) {
    let mut group = c.benchmark_group("coordination");
    group.sample_size(10);
    for &nworkers in &[1usize, 4] {
        group.bench_with_input(
            BenchmarkId::new("sim_max_64", nworkers),
            &nworkers,
            |b, &nworkers| {
                b.iter(|| {
                    let (sim, gen) = trivial_specs();
                    let output = Ensemble::new(sim, gen, ExitCriteria::sim_max(64))
                        .config(RunConfig::new(nworkers))
                        .run()
                        .unwrap();
                    assert!(output.history.sim_count() >= 64);
                    output
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_round_trips);
criterion_main!(benches);
