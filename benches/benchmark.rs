use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

use squall::commands::Command;
use squall::config::EngineConfig;
use squall::memory::{Document, MemoryDataset, MemoryEngine};
use squall::merge::{iterate_multi, IterateOptions, MergeSource};
use squall::remote::{RemoteSession, SessionBox};
use squall::session::{DatasetRequest, Session, SessionOpener};

const DOCS: i64 = 20_000;

fn dataset(offset: i64) -> MemoryDataset {
    let docs = (0..DOCS)
        .map(|i| {
            Document::builder(i * 1000)
                .string("query", &format!("q{}", (i * 7 + offset) % 2000))
                .int("clicks", i % 13)
                .build()
        })
        .collect();
    MemoryDataset::new(docs)
}

fn open_sessions(count: usize) -> Vec<SessionBox> {
    let mut engine = MemoryEngine::new();
    let mut sessions = Vec::new();
    for i in 0..count {
        let name = format!("d{}", i);
        engine.add_dataset(&name, dataset(i as i64 * 31));
        let mut opened = engine.open(&DatasetRequest::new(&name, 0, 86_400_000)).expect("open");
        opened.session.push_stat("count()").expect("push");
        opened.session.push_stat("clicks").expect("push");
        sessions.push(opened.session);
    }
    sessions
}

fn merge(sessions: &mut [SessionBox]) -> usize {
    let num_sessions = sessions.len();
    let mut sources: Vec<MergeSource<'_>> = sessions
        .iter_mut()
        .enumerate()
        .map(|(i, session)| MergeSource {
            name: "bench",
            session: session.as_mut(),
            field: "query".to_string(),
            metric_indexes: vec![2 * i, 2 * i + 1],
            presence_index: None,
        })
        .collect();
    let mut rows = 0;
    iterate_multi::<String>(&mut sources, 2 * num_sessions, &IterateOptions::default(), true, true, |_, stats, _| {
        rows += black_box(stats).len();
        Ok(())
    })
    .expect("merge");
    rows
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut single = open_sessions(1);
    c.bench_function("merge 1 session", |b| b.iter(|| merge(&mut single)));
    let mut three = open_sessions(3);
    c.bench_function("merge 3 sessions", |b| b.iter(|| merge(&mut three)));

    c.bench_function("time regroup and count", |b| {
        b.iter(|| {
            let mut engine = MemoryEngine::new();
            engine.add_dataset("d", dataset(0));
            let commands = vec![Command::time_regroup(3_600_000, "%H"), Command::count_per_group()];
            let datasets = vec![DatasetRequest::new("d", 0, 86_400_000)];
            Session::create(&mut engine, datasets, commands, &EngineConfig::default()).expect("query")
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
