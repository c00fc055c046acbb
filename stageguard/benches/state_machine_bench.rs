//! Benchmarks for transition validation and result lookup.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use stageguard::core::{PipelineState, StageFailure, StageOutput};
use stageguard::machine::{StateMachine, StateStackEntry, TransitionTable};
use std::time::Duration;

fn transition_benchmark(c: &mut Criterion) {
    let table = TransitionTable::default();
    c.bench_function("allows_all_pairs", |b| {
        b.iter(|| {
            let mut allowed = 0usize;
            for from in PipelineState::ALL {
                for to in PipelineState::ALL {
                    if table.allows(black_box(from), black_box(to)) {
                        allowed += 1;
                    }
                }
            }
            allowed
        });
    });
}

fn stack_benchmark(c: &mut Criterion) {
    let mut machine = StateMachine::new("bench");
    for i in 0..1_000u32 {
        let stage = format!("stage-{}", i % 20);
        if i % 3 == 0 {
            let failure = StageFailure::new("flaky", "retry");
            machine.push_entry(StateStackEntry::stage_failed(&stage, &failure, i % 4));
        } else {
            let output = StageOutput::ok_value("i", serde_json::json!(i));
            machine.push_entry(StateStackEntry::stage_completed(
                &stage,
                &output,
                Duration::from_millis(5),
                0,
            ));
        }
    }

    c.bench_function("latest_result_scan", |b| {
        b.iter(|| machine.get_latest_result(black_box("stage-7")).is_some());
    });
    c.bench_function("all_latest_results", |b| {
        b.iter(|| machine.get_all_latest_results().len());
    });
}

criterion_group!(benches, transition_benchmark, stack_benchmark);
criterion_main!(benches);
