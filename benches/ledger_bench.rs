use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use notify_relay::{SubscriptionLedger, topic_matches_filter, validate_topic_filter};

fn populated_ledger(hosts: usize, topics: usize) -> SubscriptionLedger {
    let mut ledger = SubscriptionLedger::new();
    for h in 0..hosts {
        for t in 0..topics {
            ledger.increment(&format!("robot-{h}.local"), &format!("robot-server/runs/{t}"));
        }
    }
    ledger
}

fn ledger_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_operations");

    group.bench_function("increment_decrement", |b| {
        let mut ledger = populated_ledger(8, 64);
        b.iter(|| {
            ledger.increment(black_box("robot-3.local"), black_box("robot-server/runs/17"));
            ledger.decrement(black_box("robot-3.local"), black_box("robot-server/runs/17"));
        });
    });

    for topics in [16, 256] {
        group.bench_with_input(
            BenchmarkId::new("total_for_host", topics),
            &topics,
            |b, &topics| {
                let ledger = populated_ledger(4, topics);
                b.iter(|| black_box(ledger.total_for_host(black_box("robot-1.local"))));
            },
        );
    }

    group.finish();
}

fn topic_filter_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic_filters");

    group.bench_function("validate", |b| {
        b.iter(|| validate_topic_filter(black_box("robot-server/runs/+/commands/#")));
    });

    let cases = [
        ("exact", "robot-server/runs/42/commands"),
        ("single_level", "robot-server/runs/+/commands"),
        ("multi_level", "robot-server/#"),
        ("miss", "robot-server/protocols/+"),
    ];
    for (name, filter) in cases {
        group.bench_with_input(BenchmarkId::new("match", name), &filter, |b, filter| {
            b.iter(|| {
                topic_matches_filter(black_box("robot-server/runs/42/commands"), black_box(filter))
            });
        });
    }

    group.finish();
}

criterion_group!(benches, ledger_benchmark, topic_filter_benchmark);
criterion_main!(benches);
