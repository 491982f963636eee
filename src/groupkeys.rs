//! Group key sets: immutable, chained descriptions of the live groups at one
//! pipeline stage.
//!
//! Groups are numbered `1..=num_groups()`; group 0 is the "absent" sentinel
//! and is never present. Every stage except the root refers to the stage it
//! refines through [`GroupKeySet::previous`], and `parent_group` maps a group
//! back to the group it came from. A new stage is always a new value; nothing
//! here is mutated after construction, so stages are shared as [`KeySetRef`].
//!
//! Bucketing stages number bucket `b` (1-based) of parent `p` as
//! `(p - 1) * B + b`. Masking hides groups without renumbering them.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use roaring::RoaringBitmap;

pub type KeySetRef = Arc<dyn GroupKeySet>;

pub const DEFAULT_GROUP_NAME: &str = "DEFAULT";

// ------------- GroupKey -------------
/// Rendering metadata for one group. Never used for control flow except by
/// `IsDefaultGroup`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    Initial,
    IntTerm(i64),
    StringTerm(String),
    Range { min: i64, max: i64 },
    LowGutter(i64),
    HighGutter(i64),
    Default(String),
    TimeRange { start: i64, end: i64, format: String },
    YearMonth { year: i32, month: u32 },
}

impl GroupKey {
    pub fn default_group() -> Self {
        GroupKey::Default(DEFAULT_GROUP_NAME.to_string())
    }
    pub fn is_default(&self) -> bool {
        matches!(self, GroupKey::Default(_))
    }
    /// The root stage contributes no column to output rows.
    pub fn is_initial(&self) -> bool {
        matches!(self, GroupKey::Initial)
    }
}

fn format_millis(millis: i64, format: &str) -> String {
    match DateTime::<Utc>::from_timestamp_millis(millis) {
        Some(t) => t.format(format).to_string(),
        None => millis.to_string(),
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Initial => Ok(()),
            GroupKey::IntTerm(term) => write!(f, "{}", term),
            GroupKey::StringTerm(term) => write!(f, "{}", escape_tsv(term)),
            GroupKey::Range { min, max } => write!(f, "[{}, {})", min, max),
            GroupKey::LowGutter(min) => write!(f, "< {}", min),
            GroupKey::HighGutter(max) => write!(f, ">= {}", max),
            GroupKey::Default(name) => write!(f, "{}", escape_tsv(name)),
            GroupKey::TimeRange { start, end, format } => {
                write!(f, "[{}, {})", format_millis(*start, format), format_millis(*end, format))
            }
            GroupKey::YearMonth { year, month } => match NaiveDate::from_ymd_opt(*year, *month, 1) {
                Some(date) => write!(f, "{}", date.format("%B %Y")),
                None => write!(f, "{}-{:02}", year, month),
            },
        }
    }
}

/// Tabs and line breaks would split a TSV cell.
pub fn escape_tsv(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '\t' | '\r' | '\n' => '\u{FFFD}',
            c => c,
        })
        .collect()
}

// ------------- GroupKeySet -------------
pub trait GroupKeySet: fmt::Debug + Send + Sync {
    fn previous(&self) -> Option<&KeySetRef>;
    /// Only meaningful for `0 < group <= num_groups()`.
    fn parent_group(&self, group: usize) -> usize;
    fn group_key(&self, group: usize) -> GroupKey;
    fn num_groups(&self) -> usize;
    fn is_present(&self, group: usize) -> bool;
}

/// Keys of `group` and all its ancestors, root-most first, skipping the root stage.
pub fn key_chain(set: &dyn GroupKeySet, group: usize) -> Vec<GroupKey> {
    let mut keys = Vec::new();
    let mut current = set;
    let mut g = group;
    while let Some(previous) = current.previous() {
        keys.push(current.group_key(g));
        g = current.parent_group(g);
        current = previous.as_ref();
    }
    keys.reverse();
    keys
}

/// Walks `levels` stages up the chain, returning the ancestor group.
pub fn ancestor_group(set: &dyn GroupKeySet, group: usize, levels: usize) -> usize {
    let mut current = set;
    let mut g = group;
    for _ in 0..levels {
        g = current.parent_group(g);
        match current.previous() {
            Some(previous) => current = previous.as_ref(),
            None => break,
        }
    }
    g
}

fn previous_present(previous: &KeySetRef, parent: usize) -> bool {
    previous.is_present(parent)
}

// ------------- Dumb -------------
/// Explicit parents and keys per group, index 0 unused.
#[derive(Debug)]
pub struct DumbGroupKeySet {
    previous: Option<KeySetRef>,
    parents: Vec<usize>,
    keys: Vec<GroupKey>,
}

impl DumbGroupKeySet {
    /// The root stage: one group, no ancestors.
    pub fn empty() -> KeySetRef {
        Arc::new(Self { previous: None, parents: vec![0, 0], keys: vec![GroupKey::Initial, GroupKey::Initial] })
    }
    pub fn create(previous: KeySetRef, parents: Vec<usize>, keys: Vec<GroupKey>) -> KeySetRef {
        Self::with_previous(Some(previous), parents, keys)
    }
    /// Like `create`, but also allows replacing the root stage.
    pub fn with_previous(previous: Option<KeySetRef>, parents: Vec<usize>, keys: Vec<GroupKey>) -> KeySetRef {
        debug_assert_eq!(parents.len(), keys.len());
        Arc::new(Self { previous, parents, keys })
    }
}

impl GroupKeySet for DumbGroupKeySet {
    fn previous(&self) -> Option<&KeySetRef> {
        self.previous.as_ref()
    }
    fn parent_group(&self, group: usize) -> usize {
        self.parents[group]
    }
    fn group_key(&self, group: usize) -> GroupKey {
        self.keys[group].clone()
    }
    fn num_groups(&self) -> usize {
        self.parents.len().saturating_sub(1)
    }
    fn is_present(&self, group: usize) -> bool {
        group > 0
            && group <= self.num_groups()
            && self.previous.as_ref().is_none_or(|p| previous_present(p, self.parents[group]))
    }
}

// ------------- DateTimeRange -------------
#[derive(Debug)]
pub struct DateTimeRangeGroupKeySet {
    previous: KeySetRef,
    earliest_start: i64,
    unit_millis: i64,
    num_buckets: usize,
    num_groups: usize,
    format: String,
}

impl DateTimeRangeGroupKeySet {
    pub fn new(
        previous: KeySetRef,
        earliest_start: i64,
        unit_millis: i64,
        num_buckets: usize,
        num_groups: usize,
        format: &str,
    ) -> Self {
        Self { previous, earliest_start, unit_millis, num_buckets, num_groups, format: format.to_string() }
    }
}

impl GroupKeySet for DateTimeRangeGroupKeySet {
    fn previous(&self) -> Option<&KeySetRef> {
        Some(&self.previous)
    }
    fn parent_group(&self, group: usize) -> usize {
        1 + (group - 1) / self.num_buckets
    }
    fn group_key(&self, group: usize) -> GroupKey {
        let inner = ((group - 1) % self.num_buckets) as i64;
        let start = self.earliest_start + inner * self.unit_millis;
        GroupKey::TimeRange { start, end: start + self.unit_millis, format: self.format.clone() }
    }
    fn num_groups(&self) -> usize {
        self.num_groups
    }
    fn is_present(&self, group: usize) -> bool {
        group > 0 && group <= self.num_groups && previous_present(&self.previous, self.parent_group(group))
    }
}

// ------------- MetricRange -------------
/// `num_buckets` counts the two gutters when they are kept, and the default
/// bucket when one is requested.
#[derive(Debug)]
pub struct MetricRangeGroupKeySet {
    previous: KeySetRef,
    num_buckets: usize,
    exclude_gutters: bool,
    min: i64,
    interval: i64,
    with_default: bool,
    from_predicate: bool,
    num_groups: usize,
}

impl MetricRangeGroupKeySet {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        previous: KeySetRef,
        num_buckets: usize,
        exclude_gutters: bool,
        min: i64,
        interval: i64,
        with_default: bool,
        from_predicate: bool,
        num_groups: usize,
    ) -> Self {
        Self { previous, num_buckets, exclude_gutters, min, interval, with_default, from_predicate, num_groups }
    }
}

impl GroupKeySet for MetricRangeGroupKeySet {
    fn previous(&self) -> Option<&KeySetRef> {
        Some(&self.previous)
    }
    fn parent_group(&self, group: usize) -> usize {
        1 + (group - 1) / self.num_buckets
    }
    fn group_key(&self, group: usize) -> GroupKey {
        let inner = (group - 1) % self.num_buckets;
        let last = self.num_buckets - 1;
        if !self.exclude_gutters && inner == last {
            GroupKey::HighGutter(self.min + self.interval * (self.num_buckets as i64 - 2))
        } else if !self.exclude_gutters && inner + 1 == last {
            GroupKey::LowGutter(self.min)
        } else if self.with_default && inner == last {
            GroupKey::default_group()
        } else if self.from_predicate {
            GroupKey::IntTerm(inner as i64)
        } else {
            let min = self.min + inner as i64 * self.interval;
            GroupKey::Range { min, max: min + self.interval }
        }
    }
    fn num_groups(&self) -> usize {
        self.num_groups
    }
    fn is_present(&self, group: usize) -> bool {
        group > 0 && group <= self.num_groups && previous_present(&self.previous, self.parent_group(group))
    }
}

// ------------- YearMonth -------------
#[derive(Debug)]
pub struct YearMonthGroupKeySet {
    previous: KeySetRef,
    num_months: usize,
    start_month: NaiveDate,
}

impl YearMonthGroupKeySet {
    /// `start_month` is truncated to the first day of its month.
    pub fn new(previous: KeySetRef, num_months: usize, start_month: NaiveDate) -> Self {
        let start_month = start_month.with_day(1).unwrap_or(start_month);
        Self { previous, num_months, start_month }
    }

    fn month_of(&self, group: usize) -> NaiveDate {
        let inner = ((group - 1) % self.num_months) as u32;
        self.start_month.checked_add_months(Months::new(inner)).unwrap_or(self.start_month)
    }

    /// `[start, end)` of the month behind `group`, in epoch millis (UTC).
    pub fn month_range(&self, group: usize) -> (i64, i64) {
        let start = self.month_of(group);
        let end = start.checked_add_months(Months::new(1)).unwrap_or(start);
        (midnight_millis(start), midnight_millis(end))
    }
}

pub(crate) fn midnight_millis(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0).map(|t| t.and_utc().timestamp_millis()).unwrap_or_default()
}

impl GroupKeySet for YearMonthGroupKeySet {
    fn previous(&self) -> Option<&KeySetRef> {
        Some(&self.previous)
    }
    fn parent_group(&self, group: usize) -> usize {
        1 + (group - 1) / self.num_months
    }
    fn group_key(&self, group: usize) -> GroupKey {
        let month = self.month_of(group);
        GroupKey::YearMonth { year: month.year(), month: month.month() }
    }
    fn num_groups(&self) -> usize {
        self.previous.num_groups() * self.num_months
    }
    fn is_present(&self, group: usize) -> bool {
        group > 0 && group <= self.num_groups() && previous_present(&self.previous, self.parent_group(group))
    }
}

// ------------- FieldIn -------------
/// One group per listed term per parent, plus an optional trailing default group.
#[derive(Debug)]
pub struct FieldInGroupKeySet {
    previous: KeySetRef,
    keys: Vec<GroupKey>,
    with_default: bool,
}

impl FieldInGroupKeySet {
    pub fn ints(previous: KeySetRef, terms: &[i64], with_default: bool) -> Self {
        Self { previous, keys: terms.iter().map(|t| GroupKey::IntTerm(*t)).collect(), with_default }
    }
    pub fn strings(previous: KeySetRef, terms: &[String], with_default: bool) -> Self {
        Self { previous, keys: terms.iter().map(|t| GroupKey::StringTerm(t.clone())).collect(), with_default }
    }
    fn groups_per_parent(&self) -> usize {
        self.keys.len() + usize::from(self.with_default)
    }
}

impl GroupKeySet for FieldInGroupKeySet {
    fn previous(&self) -> Option<&KeySetRef> {
        Some(&self.previous)
    }
    fn parent_group(&self, group: usize) -> usize {
        1 + (group - 1) / self.groups_per_parent()
    }
    fn group_key(&self, group: usize) -> GroupKey {
        let index = (group - 1) % self.groups_per_parent();
        self.keys.get(index).cloned().unwrap_or_else(GroupKey::default_group)
    }
    fn num_groups(&self) -> usize {
        self.previous.num_groups() * self.groups_per_parent()
    }
    fn is_present(&self, group: usize) -> bool {
        group > 0 && group <= self.num_groups() && previous_present(&self.previous, self.parent_group(group))
    }
}

// ------------- Masking -------------
/// Hides groups absent from `mask`; numbering, parents and keys are those of `wrapped`.
#[derive(Debug)]
pub struct MaskingGroupKeySet {
    wrapped: KeySetRef,
    mask: RoaringBitmap,
}

impl MaskingGroupKeySet {
    pub fn new(wrapped: KeySetRef, mask: RoaringBitmap) -> Self {
        Self { wrapped, mask }
    }
    pub fn mask(&self) -> &RoaringBitmap {
        &self.mask
    }
}

impl GroupKeySet for MaskingGroupKeySet {
    fn previous(&self) -> Option<&KeySetRef> {
        self.wrapped.previous()
    }
    fn parent_group(&self, group: usize) -> usize {
        self.wrapped.parent_group(group)
    }
    fn group_key(&self, group: usize) -> GroupKey {
        self.wrapped.group_key(group)
    }
    fn num_groups(&self) -> usize {
        self.wrapped.num_groups()
    }
    fn is_present(&self, group: usize) -> bool {
        u32::try_from(group).is_ok_and(|g| self.mask.contains(g)) && self.wrapped.is_present(group)
    }
}
