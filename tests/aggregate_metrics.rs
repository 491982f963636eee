use std::collections::HashMap;
use std::sync::Arc;

use roaring::RoaringBitmap;

use squall::aggregate::{
    AggregateFilter, AggregateMetric, AtomicStats, Comparison, MetricIndexes, QualifiedPush, TermRef,
};
use squall::groupkeys::{DumbGroupKeySet, GroupKey, KeySetRef, MaskingGroupKeySet};
use squall::remote::{BinaryOp, StatTree, Term, UnaryOp};
use squall::SquallError;

/// Two parents with three children each; slot 0 is `count()` and slot 1 `clicks`.
fn setup() -> (KeySetRef, MetricIndexes, Vec<Vec<i64>>) {
    let parents = vec![0, 1, 1, 1, 2, 2, 2];
    let keys = (0..=6).map(|g| if g == 0 { GroupKey::Initial } else { GroupKey::IntTerm(g as i64) }).collect();
    let key_set = DumbGroupKeySet::create(DumbGroupKeySet::empty(), parents, keys);
    let mut indexes = HashMap::new();
    indexes.insert(count(), 0);
    indexes.insert(clicks(), 1);
    let stats = vec![vec![0, 4, 2, 6, 1, 3, 5], vec![0, 40, 10, 12, 9, 6, 0]];
    (key_set, indexes, stats)
}

fn count() -> QualifiedPush {
    QualifiedPush::new("jobs", vec!["count()".to_string()])
}

fn clicks() -> QualifiedPush {
    QualifiedPush::new("jobs", vec!["clicks".to_string()])
}

fn registered(mut metric: AggregateMetric, key_set: &KeySetRef, indexes: &MetricIndexes) -> AggregateMetric {
    metric.register(indexes, key_set).expect("register ok");
    metric
}

#[test]
fn ratios_per_group() {
    let (key_set, indexes, stats) = setup();
    let ctr = AggregateMetric::divide(
        AggregateMetric::doc_stats("jobs", &["clicks"]),
        AggregateMetric::doc_stats("jobs", &["count()"]),
    );
    let mut ctr = registered(ctr, &key_set, &indexes);
    let values = ctr.get_group_stats(&stats, 6).expect("values");
    assert_eq!(&values[1..], &[10.0, 5.0, 2.0, 9.0, 2.0, 0.0]);
}

#[test]
fn unregistered_metrics_fail() {
    let (_, _, stats) = setup();
    let mut metric = AggregateMetric::doc_stats("jobs", &["clicks"]);
    assert!(matches!(metric.get_group_stats(&stats, 6), Err(SquallError::Invariant(_))));
}

#[test]
fn missing_pushes_fail_registration() {
    let (key_set, _, _) = setup();
    let mut metric = AggregateMetric::doc_stats("jobs", &["clicks"]);
    assert!(metric.register(&HashMap::new(), &key_set).is_err());
}

#[test]
fn parent_lag_stays_within_its_parent() {
    let (key_set, indexes, stats) = setup();
    let mut lag = registered(AggregateMetric::parent_lag(1, AggregateMetric::doc_stats("jobs", &["count()"])), &key_set, &indexes);
    let values = lag.get_group_stats(&stats, 6).expect("values");
    // group 4 starts parent 2, so it has no predecessor
    assert_eq!(&values[1..], &[0.0, 4.0, 2.0, 0.0, 1.0, 3.0]);
}

#[test]
fn running_sums_restart_per_parent() {
    let (key_set, indexes, stats) = setup();
    let mut running = registered(AggregateMetric::running(AggregateMetric::doc_stats("jobs", &["count()"])), &key_set, &indexes);
    let values = running.get_group_stats(&stats, 6).expect("values");
    assert_eq!(&values[1..], &[4.0, 6.0, 12.0, 1.0, 4.0, 9.0]);
}

#[test]
fn windows_sum_siblings() {
    let (key_set, indexes, stats) = setup();
    let mut window = registered(AggregateMetric::window(2, AggregateMetric::doc_stats("jobs", &["count()"])), &key_set, &indexes);
    let values = window.get_group_stats(&stats, 6).expect("values");
    assert_eq!(&values[1..], &[4.0, 6.0, 8.0, 1.0, 4.0, 8.0]);
}

#[test]
fn windows_over_masked_groups_fail() {
    let (key_set, indexes, stats) = setup();
    let mut mask = RoaringBitmap::new();
    mask.extend([1u32, 3, 4, 5, 6]);
    let masked: KeySetRef = Arc::new(MaskingGroupKeySet::new(key_set, mask));
    let mut window = registered(AggregateMetric::window(2, AggregateMetric::doc_stats("jobs", &["count()"])), &masked, &indexes);
    let err = window.get_group_stats(&stats, 6).expect_err("group 2 is missing");
    assert_eq!(err.to_string(), "Execution error: Cannot use window where the window overlaps missing data.");
}

#[test]
fn iterate_lag_has_no_group_stats() {
    let (key_set, indexes, stats) = setup();
    let mut lag = registered(AggregateMetric::iterate_lag(1, AggregateMetric::doc_stats("jobs", &["count()"])), &key_set, &indexes);
    assert!(matches!(lag.get_group_stats(&stats, 6), Err(SquallError::Unsupported(_))));
}

#[test]
fn streaming_lag_and_window_per_group() {
    let (key_set, indexes, _) = setup();
    let clicks = || AggregateMetric::doc_stats("jobs", &["clicks"]);
    let mut lag = registered(AggregateMetric::iterate_lag(1, clicks()), &key_set, &indexes);
    let mut window = registered(AggregateMetric::window(2, clicks()), &key_set, &indexes);
    let mut running = registered(AggregateMetric::running(clicks()), &key_set, &indexes);
    let rows: [(&str, usize, [i64; 2]); 5] =
        [("a", 1, [1, 3]), ("a", 2, [1, 100]), ("b", 1, [1, 5]), ("c", 1, [1, 7]), ("c", 2, [1, 1])];
    let mut seen = Vec::new();
    for (term, group, stats) in rows {
        let term = TermRef::Str(term);
        seen.push((
            lag.apply(term, &stats, group).expect("lag"),
            window.apply(term, &stats, group).expect("window"),
            running.apply(term, &stats, group).expect("running"),
        ));
    }
    assert_eq!(
        seen,
        vec![(0.0, 3.0, 3.0), (0.0, 100.0, 100.0), (3.0, 8.0, 8.0), (5.0, 12.0, 15.0), (100.0, 101.0, 101.0)],
        "state is kept per group across terms"
    );
}

#[test]
fn streaming_parent_lag_reads_the_earlier_sibling() {
    let (key_set, indexes, _) = setup();
    let mut lag = registered(AggregateMetric::parent_lag(1, AggregateMetric::doc_stats("jobs", &["clicks"])), &key_set, &indexes);
    let term = TermRef::Int(9);
    let values: Vec<f64> = [(1, 10), (2, 20), (4, 40), (5, 50)]
        .iter()
        .map(|(group, clicks)| lag.apply(term, &[1, *clicks], *group).expect("lag"))
        .collect();
    assert_eq!(values, vec![0.0, 10.0, 0.0, 40.0], "group 4 has no sibling before it");
}

#[test]
fn zero_delay_lags_return_the_current_value() {
    let (key_set, indexes, _) = setup();
    let clicks = || AggregateMetric::doc_stats("jobs", &["clicks"]);
    let mut parent = registered(AggregateMetric::parent_lag(0, clicks()), &key_set, &indexes);
    let mut iterate = registered(AggregateMetric::iterate_lag(0, clicks()), &key_set, &indexes);
    for (term, group, clicks) in [("a", 1, 10), ("a", 2, 20), ("b", 1, 30)] {
        let term = TermRef::Str(term);
        let expected = clicks as f64;
        assert_eq!(parent.apply(term, &[1, clicks], group).expect("parent lag"), expected);
        assert_eq!(iterate.apply(term, &[1, clicks], group).expect("iterate lag"), expected);
    }
}

#[test]
fn term_filters_ignore_stats() {
    let mut equals = AggregateFilter::TermEquals(Term::Str("jobs".into()));
    // the stats buffer content is irrelevant to term predicates
    assert!(equals.allow(TermRef::Str("jobs"), &[], 0).expect("allow"));
    assert!(equals.allow(TermRef::Str("jobs"), &[i64::MIN, -1, 99], 17).expect("allow"));
    assert!(!equals.allow(TermRef::Str("job"), &[], 0).expect("allow"));
    assert!(!equals.need_stats());
    assert!(!equals.need_sorted());
    assert!(!equals.need_group());

    let mut by_number = AggregateFilter::TermEquals(Term::Str("42".into()));
    assert!(by_number.allow(TermRef::Int(42), &[], 1).expect("allow"), "string terms match int terms by text");
}

#[test]
fn term_filters_have_no_group_values() {
    let (_, _, stats) = setup();
    let mut filter = AggregateFilter::TermEquals(Term::Int(1));
    assert!(matches!(filter.get_group_stats(&stats, 6), Err(SquallError::Unsupported(_))));
}

#[test]
fn regexes_match_whole_terms() {
    let mut filter = AggregateFilter::term_regex("soft.*eng").expect("pattern");
    assert!(filter.allow(TermRef::Str("software eng"), &[], 1).expect("allow"));
    assert!(!filter.allow(TermRef::Str("senior software engineer"), &[], 1).expect("allow"));
    assert!(AggregateFilter::term_regex("(").is_err());
}

#[test]
fn combinators_need_two_children() {
    assert!(AggregateFilter::and(vec![AggregateFilter::Constant(true)]).is_err());
    assert!(AggregateFilter::or(Vec::new()).is_err());
}

#[test]
fn and_evaluates_every_child() {
    let (key_set, indexes, _) = setup();
    let running = AggregateMetric::running(AggregateMetric::doc_stats("jobs", &["clicks"]));
    let mut filter = AggregateFilter::and(vec![
        AggregateFilter::Constant(false),
        AggregateFilter::compare(Comparison::Gt, running, AggregateMetric::constant(5.0)),
    ])
    .expect("two children");
    filter.register(&indexes, &key_set).expect("register ok");
    assert!(!filter.allow(TermRef::Int(1), &[1, 4], 1).expect("allow"));
    assert!(!filter.allow(TermRef::Int(2), &[1, 4], 1).expect("allow"));
    let mut probe = match filter {
        AggregateFilter::And(mut children) => children.remove(1),
        _ => unreachable!(),
    };
    assert!(probe.allow(TermRef::Int(3), &[1, 0], 1).expect("allow"), "the running sum saw both earlier rows");
}

#[test]
fn default_groups_are_detected() {
    let keys = vec![GroupKey::Initial, GroupKey::StringTerm("a".into()), GroupKey::default_group()];
    let key_set = DumbGroupKeySet::create(DumbGroupKeySet::empty(), vec![0, 1, 1], keys);
    let mut filter = AggregateFilter::is_default_group();
    filter.register(&HashMap::new(), &key_set).expect("register ok");
    assert_eq!(filter.get_group_stats(&[], 2).expect("values"), vec![false, false, true]);
    assert!(filter.allow(TermRef::Int(0), &[], 2).expect("allow"));
}

#[test]
fn local_and_remote_evaluation_agree() {
    let (key_set, indexes, stats) = setup();
    let metric = AggregateMetric::if_then_else(
        AggregateFilter::compare(
            Comparison::Gte,
            AggregateMetric::doc_stats("jobs", &["count()"]),
            AggregateMetric::constant(3.0),
        ),
        AggregateMetric::unary(UnaryOp::Negate, AggregateMetric::doc_stats("jobs", &["clicks"])),
        AggregateMetric::add(AggregateMetric::per_group(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]), AggregateMetric::constant(0.5)),
    );
    let mut local = registered(metric, &key_set, &indexes);
    let values = local.get_group_stats(&stats, 6).expect("values");

    let mut atomic: AtomicStats = HashMap::new();
    atomic.insert(count(), StatTree::Stat(0));
    atomic.insert(clicks(), StatTree::Stat(1));
    let tree = local.to_stat_tree(&atomic).expect("tree");
    let term = Term::Int(0);
    for group in 1..=6 {
        let row = [stats[0][group], stats[1][group]];
        let remote = tree.eval(&term, &row, group).expect("eval");
        assert_eq!(remote, values[group], "group {}", group);
        assert_eq!(local.apply(TermRef::Int(0), &row, group).expect("apply"), values[group]);
    }
}

#[test]
fn order_dependent_metrics_stay_local() {
    let (key_set, indexes, _) = setup();
    let running = registered(AggregateMetric::running(AggregateMetric::doc_stats("jobs", &["clicks"])), &key_set, &indexes);
    let mut atomic: AtomicStats = HashMap::new();
    atomic.insert(clicks(), StatTree::Stat(1));
    assert!(matches!(running.to_stat_tree(&atomic), Err(SquallError::Unsupported(_))));
}

#[test]
fn filter_trees_fold_left() {
    let filter = AggregateFilter::or(vec![
        AggregateFilter::TermEquals(Term::Int(1)),
        AggregateFilter::TermEquals(Term::Int(2)),
        AggregateFilter::negate(AggregateFilter::term_regex("9+").expect("pattern")),
    ])
    .expect("three children");
    let tree = filter.to_stat_tree(&HashMap::new()).expect("tree");
    let expected = StatTree::binary(
        BinaryOp::Or,
        StatTree::binary(BinaryOp::Or, StatTree::TermEqualsInt(1), StatTree::TermEqualsInt(2)),
        StatTree::unary(UnaryOp::Not, StatTree::TermRegex("9+".into())),
    );
    assert_eq!(tree, expected);
    assert_eq!(tree.eval(&Term::Int(99), &[], 1).expect("eval"), 0.0);
    assert_eq!(tree.eval(&Term::Int(5), &[], 1).expect("eval"), 1.0);
}

#[test]
fn requires_collects_every_push() {
    let metric = AggregateMetric::add(
        AggregateMetric::doc_stats("jobs", &["count()"]),
        AggregateMetric::if_then_else(
            AggregateFilter::compare(Comparison::Lt, AggregateMetric::doc_stats("ads", &["clicks"]), AggregateMetric::constant(1.0)),
            AggregateMetric::doc_stats("jobs", &["count()"]),
            AggregateMetric::named_lookup("saved"),
        ),
    );
    let requires = metric.requires();
    assert_eq!(requires.len(), 2, "the repeated push counts once");
    assert!(requires.contains(&QualifiedPush::new("ads", vec!["clicks".to_string()])));
}
