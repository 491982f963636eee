use squall::actions::{optimize_consecutive_query_actions, scope_of, Action};
use squall::commands::{Command, CommandOutput};
use squall::config::EngineConfig;
use squall::docfilter::{DocFilter, GroupSupplier};
use squall::groupkeys::{DumbGroupKeySet, GroupKey};
use squall::memory::{Document, MemoryDataset, MemoryEngine};
use squall::remote::{Query, Term};
use squall::session::{DatasetRequest, Session};
use squall::SquallError;

/// One dataset of four documents, spread over three named groups with all
/// documents starting out in group 1.
fn setup() -> Session {
    let docs = [("us", 1), ("us", 5), ("ca", 3), ("gb", 7)]
        .iter()
        .enumerate()
        .map(|(i, (country, clicks))| Document::builder(i as i64 * 1000).string("country", country).int("clicks", *clicks).build())
        .collect();
    let mut engine = MemoryEngine::new();
    engine.add_dataset("jobs", MemoryDataset::new(docs));
    let mut session =
        Session::open(&mut engine, vec![DatasetRequest::new("jobs", 0, 86_400_000)], &EngineConfig::default())
            .expect("open ok");
    let root = session.key_set().clone();
    session.assume_dense(DumbGroupKeySet::create(
        root,
        vec![0, 1, 1, 1],
        vec![GroupKey::Initial, GroupKey::IntTerm(1), GroupKey::IntTerm(2), GroupKey::IntTerm(3)],
    ));
    session
}

fn counts(session: &mut Session) -> Vec<String> {
    match session.run_command(&mut Command::count_per_group()).expect("count ok") {
        CommandOutput::Rows(rows) => rows,
        other => panic!("unexpected output {:?}", other),
    }
}

fn replay(session: &mut Session, actions: &[Action]) {
    for action in actions {
        action.apply(session).expect("action ok");
    }
}

fn us() -> DocFilter {
    DocFilter::field_is("country", Term::Str("us".into()))
}

#[test]
fn distinct_groups_need_no_auxiliary_group() {
    let mut session = setup();
    let supplier = GroupSupplier::new(4);
    let filter = DocFilter::and(DocFilter::Always, DocFilter::Always);
    let actions = filter.get_execution_actions(&scope_of(&["jobs"]), 1, 2, 3, &supplier).expect("compile ok");
    assert_eq!(supplier.acquired(), 0, "target, positive and negative all differ");
    replay(&mut session, &actions);
    assert_eq!(counts(&mut session), vec!["1\t0", "2\t4", "3\t0"]);
}

#[test]
fn and_into_its_own_negative_stages_through_an_auxiliary_group() {
    let mut session = setup();
    let supplier = GroupSupplier::new(4);
    let filter = DocFilter::and(us(), DocFilter::field_is("clicks", Term::Int(5)));
    let actions = filter.get_execution_actions(&scope_of(&["jobs"]), 1, 2, 1, &supplier).expect("compile ok");
    assert_eq!(supplier.acquired(), 1);
    assert_eq!(supplier.outstanding(), 0, "released after compiling");
    supplier.finish().expect("balanced");
    replay(&mut session, &actions);
    // the staging group 4 is empty again
    assert_eq!(counts(&mut session), vec!["1\t3", "2\t1", "3\t0"]);
}

#[test]
fn and_with_shared_outcome_moves_every_document() {
    let mut session = setup();
    let supplier = GroupSupplier::new(4);
    let filter = DocFilter::and(us(), DocFilter::Always);
    let actions = filter.get_execution_actions(&scope_of(&["jobs"]), 1, 2, 2, &supplier).expect("compile ok");
    replay(&mut session, &actions);
    assert_eq!(counts(&mut session), vec!["1\t0", "2\t4", "3\t0"], "failing documents land in the negative group too");
}

#[test]
fn or_into_its_own_positive_stages_through_an_auxiliary_group() {
    let mut session = setup();
    let supplier = GroupSupplier::new(4);
    let filter = DocFilter::or(us(), DocFilter::field_is("country", Term::Str("ca".into())));
    let actions = filter.get_execution_actions(&scope_of(&["jobs"]), 1, 1, 3, &supplier).expect("compile ok");
    assert_eq!(supplier.acquired(), 1);
    replay(&mut session, &actions);
    assert_eq!(counts(&mut session), vec!["1\t3", "2\t0", "3\t1"]);
}

#[test]
fn nested_staging_is_lifo() {
    let supplier = GroupSupplier::new(10);
    let outer = supplier.acquire();
    let inner = supplier.acquire();
    assert_eq!((outer.group(), inner.group()), (10, 11));
    assert_eq!(supplier.outstanding(), 2);
    let err = outer.release().expect_err("outer released first");
    assert!(matches!(err, SquallError::Invariant(_)));
    inner.release().ok();
    assert!(supplier.finish().is_err(), "the violation is remembered");
}

#[test]
fn dropped_groups_are_released() {
    let supplier = GroupSupplier::new(5);
    {
        let _staged = supplier.acquire();
        assert_eq!(supplier.outstanding(), 1);
    }
    assert_eq!(supplier.outstanding(), 0);
    supplier.finish().expect("drop releases in order");
    assert_eq!(supplier.acquire().group(), 5, "numbers are reused");
}

#[test]
fn filter_keeps_matching_documents_in_every_group() {
    let mut session = setup();
    // two documents per group to start with
    let scope = session.all_datasets();
    session.query_regroup(&Query::Term { field: "clicks".into(), term: Term::Int(7) }, 1, 1, 2, &scope).expect("ok");
    session.query_regroup(&Query::Term { field: "clicks".into(), term: Term::Int(5) }, 1, 1, 2, &scope).expect("ok");
    let filter = DocFilter::negate(us());
    let actions = filter.filter_actions(&session.all_datasets(), session.num_groups()).expect("compile ok");
    replay(&mut session, &actions);
    assert_eq!(counts(&mut session), vec!["1\t1", "2\t1", "3\t0"], "each group lost its us documents");
}

#[test]
fn qualified_filters_leave_other_datasets_alone() {
    let mut session = setup();
    let filter = DocFilter::qualified(&["other"], DocFilter::Never);
    let actions = filter.filter_actions(&session.all_datasets(), session.num_groups()).expect("compile ok");
    replay(&mut session, &actions);
    assert_eq!(counts(&mut session)[0], "1\t4");
}

#[test]
fn metric_filters_become_metric_actions() {
    let mut session = setup();
    let filter = DocFilter::compare(
        squall::aggregate::Comparison::Gt,
        squall::docfilter::DocMetric::field("clicks"),
        squall::docfilter::DocMetric::Constant(2),
    );
    let actions = filter.filter_actions(&session.all_datasets(), 1).expect("compile ok");
    assert!(matches!(actions.as_slice(), [Action::Metric { .. }]));
    replay(&mut session, &actions);
    assert_eq!(counts(&mut session)[0], "1\t3");
}

#[test]
fn consecutive_queries_are_folded() {
    let scope = scope_of(&["jobs"]);
    let term = |v: i64| Query::Term { field: "clicks".into(), term: Term::Int(v) };
    let query = |q: Query, positive: usize, negative: usize| Action::Query {
        scope: scope.clone(),
        query: q,
        target: 1,
        positive,
        negative,
    };

    // unmatched documents stay behind: an OR
    let ors = optimize_consecutive_query_actions(vec![query(term(1), 2, 1), query(term(3), 2, 1), query(term(5), 2, 1)]);
    assert_eq!(ors, vec![query(Query::Or(vec![term(1), term(3), term(5)]), 2, 1)]);

    // matched documents stay behind: an AND
    let ands = optimize_consecutive_query_actions(vec![query(term(1), 1, 0), query(term(3), 1, 0)]);
    assert_eq!(ands, vec![query(Query::And(vec![term(1), term(3)]), 1, 0)]);

    let mixed = optimize_consecutive_query_actions(vec![query(term(1), 2, 1), query(term(3), 1, 0)]);
    assert_eq!(mixed.len(), 2, "different groups are not folded");
}

#[test]
fn folded_queries_filter_like_unfolded_ones() {
    let filter = DocFilter::and(us(), DocFilter::field_is("clicks", Term::Int(5)));
    let mut plain = setup();
    let actions = filter.filter_actions(&plain.all_datasets(), 1).expect("compile ok");
    replay(&mut plain, &actions);
    let mut folded = setup();
    let optimized = optimize_consecutive_query_actions(actions.clone());
    assert!(optimized.len() < actions.len());
    replay(&mut folded, &optimized);
    assert_eq!(counts(&mut plain), counts(&mut folded));
}

#[test]
fn empty_term_sets_are_rejected() {
    let err = DocFilter::int_field_in("clicks", Vec::new()).expect_err("empty");
    assert_eq!(err.to_string(), "Parse error: Cannot have empty set of terms!");
    assert!(DocFilter::string_field_in("country", Vec::new()).is_err());
}

#[test]
fn int_terms_match_string_fields_by_text() {
    let docs = vec![Document::builder(0).string("code", "42").build(), Document::builder(1000).string("code", "7").build()];
    let mut engine = MemoryEngine::new();
    engine.add_dataset("codes", MemoryDataset::new(docs));
    let mut session =
        Session::open(&mut engine, vec![DatasetRequest::new("codes", 0, 86_400_000)], &EngineConfig::default())
            .expect("open ok");
    let filter = DocFilter::int_field_in("code", vec![42]).expect("terms");
    let actions = filter.filter_actions(&session.all_datasets(), 1).expect("compile ok");
    replay(&mut session, &actions);
    assert_eq!(counts(&mut session), vec!["1"]);
}
