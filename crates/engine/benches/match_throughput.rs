//! Assert/retract throughput through a two-join rule

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use engine::{Engine, Lit, RuleDef, Term};

fn build_engine() -> Engine {
    let mut engine = Engine::new();
    engine.define_template("a", &["v"]).unwrap();
    engine.define_template("b", &["v"]).unwrap();
    engine
        .add_rule(
            RuleDef::new("pair")
                .pattern("a", &[("v", Term::var("x"))])
                .pattern("b", &[("v", Term::var("x"))]),
        )
        .unwrap();
    engine
}

fn bench_assert_retract(c: &mut Criterion) {
    c.bench_function("assert_retract_1k_pairs", |b| {
        b.iter(|| {
            let mut engine = build_engine();
            let mut ids = Vec::with_capacity(2000);
            for i in 0..1000_i64 {
                ids.push(
                    engine
                        .assert_fact("a", &[("v", Lit::Int(i))])
                        .unwrap(),
                );
                ids.push(
                    engine
                        .assert_fact("b", &[("v", Lit::Int(i))])
                        .unwrap(),
                );
            }
            black_box(engine.agenda_len());
            for id in ids {
                engine.retract(id).unwrap();
            }
            black_box(engine.agenda_len())
        })
    });
}

fn bench_agenda_churn(c: &mut Criterion) {
    c.bench_function("agenda_fire_1k", |b| {
        b.iter(|| {
            let mut engine = build_engine();
            for i in 0..1000_i64 {
                engine.assert_fact("a", &[("v", Lit::Int(i))]).unwrap();
                engine.assert_fact("b", &[("v", Lit::Int(i))]).unwrap();
            }
            black_box(engine.run(None))
        })
    });
}

criterion_group!(benches, bench_assert_retract, bench_agenda_churn);
criterion_main!(benches);
