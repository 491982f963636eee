use std::sync::Arc;

use chrono::NaiveDate;
use roaring::RoaringBitmap;

use squall::groupkeys::{
    ancestor_group, key_chain, DateTimeRangeGroupKeySet, DumbGroupKeySet, FieldInGroupKeySet, GroupKey, GroupKeySet,
    KeySetRef, MaskingGroupKeySet, MetricRangeGroupKeySet, YearMonthGroupKeySet,
};

const HOUR: i64 = 3_600_000;

/// Three parents below the root, one per string term.
fn setup() -> KeySetRef {
    let terms = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    Arc::new(FieldInGroupKeySet::strings(DumbGroupKeySet::empty(), &terms, false))
}

#[test]
fn bucketing_maps_back_to_parents() {
    let parents = setup();
    let buckets = 4;
    let sets: Vec<KeySetRef> = vec![
        Arc::new(DateTimeRangeGroupKeySet::new(parents.clone(), 0, HOUR, buckets, 3 * buckets, "%H:%M")),
        Arc::new(MetricRangeGroupKeySet::new(parents.clone(), buckets, true, 0, 10, false, false, 3 * buckets)),
        Arc::new(FieldInGroupKeySet::ints(parents.clone(), &[1, 2, 3, 4], false)),
    ];
    for set in &sets {
        assert_eq!(set.num_groups(), 3 * buckets, "P*B groups for {:?}", set);
        for p in 1..=3 {
            for b in 1..=buckets {
                assert_eq!(set.parent_group((p - 1) * buckets + b), p, "bucket {} of parent {}", b, p);
            }
        }
    }
}

#[test]
fn presence_is_bounded() {
    let set = setup();
    assert!(!set.is_present(0), "group 0 is never present");
    assert!(set.is_present(3));
    assert!(!set.is_present(4), "beyond num_groups");
}

#[test]
fn metric_range_gutters_are_the_last_two_buckets() {
    // buckets [0,10) [10,20) plus low and high gutters
    let set = MetricRangeGroupKeySet::new(DumbGroupKeySet::empty(), 4, false, 0, 10, false, false, 4);
    let labels: Vec<String> = (1..=4).map(|g| set.group_key(g).to_string()).collect();
    assert_eq!(labels, vec!["[0, 10)", "[10, 20)", "< 0", ">= 20"]);

    let with_default = MetricRangeGroupKeySet::new(DumbGroupKeySet::empty(), 3, true, 0, 10, true, false, 3);
    assert!(with_default.group_key(3).is_default(), "default bucket is last");
    assert_eq!(with_default.group_key(2).to_string(), "[10, 20)");
}

#[test]
fn from_predicate_buckets_render_as_terms() {
    let set = MetricRangeGroupKeySet::new(DumbGroupKeySet::empty(), 2, true, 0, 1, false, true, 2);
    assert_eq!(set.group_key(1), GroupKey::IntTerm(0));
    assert_eq!(set.group_key(2), GroupKey::IntTerm(1));
}

#[test]
fn time_ranges_render_with_their_format() {
    let set = DateTimeRangeGroupKeySet::new(DumbGroupKeySet::empty(), 0, HOUR, 2, 2, "%H:%M");
    assert_eq!(set.group_key(2).to_string(), "[01:00, 02:00)");
    assert_eq!(set.parent_group(1), 1);
    assert_eq!(set.parent_group(2), 1);
}

#[test]
fn year_months_follow_calendar() {
    let start = NaiveDate::from_ymd_opt(2015, 1, 17).unwrap();
    let set = YearMonthGroupKeySet::new(setup(), 3, start);
    assert_eq!(set.num_groups(), 9, "three months for each of three parents");
    assert_eq!(set.group_key(2).to_string(), "February 2015");
    assert_eq!(set.group_key(6).to_string(), "March 2015", "last month of the second parent");
    let (from, to) = set.month_range(2);
    assert_eq!(to - from, 28 * 24 * HOUR, "February 2015 has 28 days");
}

#[test]
fn masking_hides_without_renumbering() {
    let wrapped: KeySetRef = Arc::new(FieldInGroupKeySet::ints(setup(), &[1, 2], false));
    let mut mask = RoaringBitmap::new();
    mask.insert(1);
    mask.insert(4);
    let masked = MaskingGroupKeySet::new(wrapped.clone(), mask.clone());
    for g in 0..=7 {
        assert_eq!(masked.is_present(g), mask.contains(g as u32) && wrapped.is_present(g), "presence of {}", g);
        if g > 0 && g <= 6 {
            assert_eq!(masked.parent_group(g), wrapped.parent_group(g), "parent of {}", g);
            assert_eq!(masked.group_key(g), wrapped.group_key(g));
        }
    }
    assert_eq!(masked.num_groups(), 6);
}

#[test]
fn key_chain_walks_every_stage() {
    let months = YearMonthGroupKeySet::new(setup(), 2, NaiveDate::from_ymd_opt(2020, 5, 1).unwrap());
    let keys: Vec<String> = key_chain(&months, 4).iter().map(|k| k.to_string()).collect();
    assert_eq!(keys, vec!["b", "June 2020"], "parent term first, then month");
    assert_eq!(ancestor_group(&months, 4, 1), 2);
    assert_eq!(ancestor_group(&months, 4, 2), 1, "two levels reach the root");
}

#[test]
fn dumb_sets_carry_explicit_parents() {
    let parents = setup();
    let set = DumbGroupKeySet::create(
        parents,
        vec![0, 3, 3, 1],
        vec![GroupKey::Initial, GroupKey::IntTerm(7), GroupKey::default_group(), GroupKey::StringTerm("x\ty".into())],
    );
    assert_eq!(set.num_groups(), 3);
    assert_eq!(set.parent_group(2), 3);
    assert_eq!(set.group_key(3).to_string(), "x\u{FFFD}y", "tabs are replaced in keys");
}
