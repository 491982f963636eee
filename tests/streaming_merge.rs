use std::sync::Arc;

use squall::memory::{Document, MemoryCounters, MemoryDataset, MemoryEngine};
use squall::merge::{iterate_multi, iterate_multi_int, IntIterateCallback, IterateOptions, MergeSource, TermSubset};
use squall::Result;
use squall::remote::{RemoteSession, SessionBox};
use squall::session::{DatasetRequest, SessionOpener};

type Row<T> = (T, usize, Vec<i64>);

fn tagged(tags: &[(&str, i64)]) -> MemoryDataset {
    let docs = tags
        .iter()
        .enumerate()
        .map(|(i, (tag, clicks))| Document::builder(i as i64 * 1000).string("tag", tag).int("clicks", *clicks).build())
        .collect();
    MemoryDataset::new(docs)
}

/// Two sessions with a `count()` stat pushed on each.
fn setup(a: MemoryDataset, b: MemoryDataset) -> (Vec<SessionBox>, Arc<MemoryCounters>) {
    let mut engine = MemoryEngine::new();
    engine.add_dataset("a", a);
    engine.add_dataset("b", b);
    let mut sessions = Vec::new();
    for name in ["a", "b"] {
        let mut opened = engine.open(&DatasetRequest::new(name, 0, 86_400_000)).expect("open ok");
        opened.session.push_stat("count()").expect("push ok");
        sessions.push(opened.session);
    }
    (sessions, engine.counters())
}

fn sources<'a>(sessions: &'a mut [SessionBox], field: &str, presence: bool) -> Vec<MergeSource<'a>> {
    let count = sessions.len();
    sessions
        .iter_mut()
        .enumerate()
        .map(|(i, session)| MergeSource {
            name: if i == 0 { "a" } else { "b" },
            session: session.as_mut(),
            field: field.to_string(),
            metric_indexes: vec![i],
            presence_index: presence.then_some(count + i),
        })
        .collect()
}

fn collect_strings(sources: &mut [MergeSource<'_>], num_metrics: usize, options: &IterateOptions) -> Vec<Row<String>> {
    let mut rows = Vec::new();
    iterate_multi::<String>(sources, num_metrics, options, true, true, |term, stats, group| {
        rows.push((term.clone(), group, stats.to_vec()));
        Ok(())
    })
    .expect("merge ok");
    rows
}

#[test]
fn merge_combines_matching_terms() {
    let (mut sessions, _) = setup(tagged(&[("x", 0), ("x", 0), ("y", 0)]), tagged(&[("y", 0), ("y", 0), ("y", 0), ("z", 0)]));
    let mut sources = sources(&mut sessions, "tag", true);
    let rows = collect_strings(&mut sources, 2, &IterateOptions::default());
    assert_eq!(
        rows,
        vec![
            ("x".to_string(), 1, vec![2, 0, 1, 0]),
            ("y".to_string(), 1, vec![1, 3, 1, 1]),
            ("z".to_string(), 1, vec![0, 1, 0, 1]),
        ],
        "one row per (term, group) with each session's slots and presence"
    );
}

#[test]
fn merge_orders_by_term_then_group() {
    let (mut sessions, _) = setup(tagged(&[("b", 5), ("a", 20), ("c", -5)]), tagged(&[("a", 3), ("b", 20)]));
    // spread documents over groups by their clicks
    for session in sessions.iter_mut() {
        session.push_stat("clicks").expect("push ok");
        session.metric_regroup(1, -10, 30, 10, true).expect("regroup ok");
        session.pop_stat().expect("pop ok");
    }
    let mut sources = sources(&mut sessions, "tag", false);
    let rows = collect_strings(&mut sources, 2, &IterateOptions::default());
    let keys: Vec<(String, usize)> = rows.iter().map(|(t, g, _)| (t.clone(), *g)).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(keys, sorted, "strictly ascending by term, then group");
    assert_eq!(keys.len(), 5, "a@2, a@4, b@2, b@4, c@1 are distinct pairs");
}

#[test]
fn int_terms_compare_numerically() {
    let ints = |values: &[i64]| {
        let docs = values.iter().map(|v| Document::builder(0).int("n", *v).build()).collect();
        MemoryDataset::new(docs)
    };
    let (mut sessions, _) = setup(ints(&[20, -5]), ints(&[3, 20]));
    let mut sources = sources(&mut sessions, "n", false);
    let mut terms = Vec::new();
    iterate_multi::<i64>(&mut sources, 2, &IterateOptions::default(), true, true, |term, stats, _| {
        terms.push((*term, stats.to_vec()));
        Ok(())
    })
    .expect("merge ok");
    assert_eq!(terms, vec![(-5, vec![1, 0]), (3, vec![0, 1]), (20, vec![1, 1])]);
}

#[test]
fn fast_path_matches_general_path() {
    let dataset = tagged(&[("p", 1), ("q", 15), ("p", 12), ("r", 3), ("q", 2)]);
    let (mut sessions, _) = setup(dataset, tagged(&[]));
    let session = &mut sessions[0];
    session.push_stat("clicks").expect("push ok");
    session.metric_regroup(1, 0, 20, 10, true).expect("regroup ok");
    session.pop_stat().expect("pop ok");
    let subset = IterateOptions { term_subset: Some(TermSubset::Str(vec!["r".into(), "p".into()])), ..Default::default() };
    let limited = IterateOptions { limit: Some(2), ..Default::default() };

    for options in [IterateOptions::default(), subset, limited] {
        let mut fast = vec![MergeSource {
            name: "a",
            session: session.as_mut(),
            field: "tag".to_string(),
            metric_indexes: vec![0],
            presence_index: None,
        }];
        let fast_rows = collect_strings(&mut fast, 1, &options);
        drop(fast);
        // a presence slot forces the priority queue
        let mut general = vec![MergeSource {
            name: "a",
            session: session.as_mut(),
            field: "tag".to_string(),
            metric_indexes: vec![0],
            presence_index: Some(1),
        }];
        let general_rows: Vec<Row<String>> = collect_strings(&mut general, 1, &options)
            .into_iter()
            .map(|(t, g, stats)| (t, g, stats[..1].to_vec()))
            .collect();
        assert_eq!(fast_rows, general_rows, "paths differ for {:?}", options);
        assert!(!fast_rows.is_empty());
    }
}

#[test]
fn failed_merge_releases_iterators() {
    let broken = tagged(&[("a", 0), ("b", 0), ("c", 0)]).with_ftgs_failure_after(1);
    let (mut sessions, counters) = setup(tagged(&[("a", 0), ("b", 0)]), broken);
    let mut sources = sources(&mut sessions, "tag", false);
    let result = iterate_multi::<String>(&mut sources, 2, &IterateOptions::default(), true, true, |_, _, _| Ok(()));
    assert!(result.is_err(), "stream failure aborts the merge");
    assert_eq!(counters.open_iterators(), 0, "every iterator was dropped");
}

#[test]
fn callback_error_releases_iterators() {
    let (mut sessions, counters) = setup(tagged(&[("a", 0)]), tagged(&[("b", 0)]));
    let mut sources = sources(&mut sessions, "tag", false);
    let result = iterate_multi::<String>(&mut sources, 2, &IterateOptions::default(), true, true, |_, _, _| {
        Err(squall::SquallError::Execution("stop".into()))
    });
    assert!(result.is_err());
    assert_eq!(counters.open_iterators(), 0);
}

#[test]
fn empty_sessions_never_enter_the_queue() {
    let (mut sessions, _) = setup(tagged(&[]), tagged(&[("only", 0)]));
    let mut sources = sources(&mut sessions, "tag", true);
    let rows = collect_strings(&mut sources, 2, &IterateOptions::default());
    assert_eq!(rows, vec![("only".to_string(), 1, vec![0, 1, 0, 1])]);
}

struct Totals {
    seen: Vec<(i64, i64)>,
}

impl IntIterateCallback for Totals {
    fn term(&mut self, term: i64, stats: &[i64], _group: usize) -> Result<()> {
        self.seen.push((term, stats.iter().sum()));
        Ok(())
    }
    fn need_sorted(&self) -> bool {
        true
    }
    fn need_group(&self) -> bool {
        false
    }
    fn need_stats(&self) -> bool {
        true
    }
}

#[test]
fn int_callbacks_receive_combined_stats() {
    let ints = |values: &[i64]| MemoryDataset::new(values.iter().map(|v| Document::builder(0).int("n", *v).build()).collect());
    let (mut sessions, _) = setup(ints(&[1, 1, 2]), ints(&[2, 3]));
    let mut sources = sources(&mut sessions, "n", false);
    let mut totals = Totals { seen: Vec::new() };
    iterate_multi_int(&mut sources, 2, &IterateOptions::default(), &mut totals).expect("merge ok");
    assert_eq!(totals.seen, vec![(1, 2), (2, 2), (3, 1)]);
}
