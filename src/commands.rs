//! The commands a compiled query is made of.
//!
//! Each command mutates the [`Session`]'s group partition or reads per-group
//! results from it. The output of the last command is the query result.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate};
use tracing::debug;

use crate::actions::{optimize_consecutive_query_actions, Action, Scope};
use crate::aggregate::{AggregateFilter, AggregateMetric, QualifiedPush, TermRef};
use crate::docfilter::{DocFilter, DocMetric};
use crate::error::{Result, SquallError};
use crate::format::{format_value, group_columns, render_row, stats_row, term_column};
use crate::groupkeys::{
    midnight_millis, DateTimeRangeGroupKeySet, DumbGroupKeySet, FieldInGroupKeySet, GroupKey, KeySetRef,
    MetricRangeGroupKeySet, YearMonthGroupKeySet,
};
use crate::merge::{IterateOptions, TermSubset};
use crate::remote::{GroupMultiRemapRule, RegroupCondition, RemoteTopKParams, Term};
use crate::session::{bucket_starts, find_percentile, prepend_zero, GroupLookupMergeType, PushedMetrics, Session};

const MILLIS_PER_DAY: i64 = 86_400_000;

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutput {
    Rows(Vec<String>),
    /// `[metric][group]`, index 0 unused.
    Matrix(Vec<Vec<f64>>),
    Nothing,
}

/// Keep the `limit` terms per group ranking highest by `metric`.
#[derive(Debug, Clone)]
pub struct TopK {
    pub limit: usize,
    pub metric: AggregateMetric,
}

#[derive(Debug, Clone)]
pub enum Command {
    ApplyFilterActions(Vec<Action>),
    /// Moves documents failing `filter`, in `scope` or every dataset, to group 0.
    FilterDocs { filter: DocFilter, scope: Option<Scope> },
    /// Keeps only the groups passing `filter`, renumbered densely.
    ApplyGroupFilter { filter: AggregateFilter },
    TimeRegroup {
        unit_millis: i64,
        field: Option<String>,
        is_relative: bool,
        delete_empty_groups: bool,
        format: String,
    },
    ExplodeMonthOfYear,
    MetricRegroup {
        metric: DocMetric,
        min: i64,
        max: i64,
        interval: i64,
        exclude_gutters: bool,
        with_default: bool,
        from_predicate: bool,
    },
    IntRegroupFieldIn { field: String, terms: Vec<i64>, with_default: bool },
    StringRegroupFieldIn { field: String, terms: Vec<String>, with_default: bool },
    /// `terms_per_group[g - 1]` lists the child terms of group `g`.
    ExplodePerGroup { field: String, terms_per_group: Vec<Vec<Term>>, default_name: Option<String> },
    RegroupIntoParent { merge: GroupLookupMergeType },
    GetGroupStats { metrics: Vec<AggregateMetric>, save_as: Vec<Option<String>>, return_matrix: bool },
    /// Document count per group summed over every dataset.
    CountPerGroup,
    ComputeAndCreateGroupStatsLookup { metric: AggregateMetric, name: String },
    SimpleIterate {
        field: String,
        metrics: Vec<AggregateMetric>,
        filter: Option<AggregateFilter>,
        top_k: Option<TopK>,
        limit: Option<usize>,
        term_subset: Option<TermSubset>,
    },
    SumAcross { field: String, metric: AggregateMetric, filter: Option<AggregateFilter> },
    GetSimpleGroupDistincts { dataset: String, field: String },
    GetGroupPercentiles { field: String, percentiles: Vec<f64> },
    /// Splits every group into `num_buckets` children holding equal shares
    /// of its documents, ordered by the int `field`.
    ExplodePerDocPercentile { field: String, num_buckets: usize },
    /// Splits every group into `num_buckets` children by where each term's
    /// `metric` falls among the group's term values.
    ExplodeByAggregatePercentile { field: String, metric: AggregateMetric, num_buckets: usize },
    /// Folds a group passing `filter`, and every later sibling, into the last
    /// sibling of its parent.
    RegroupIntoLastSiblingWhere { filter: AggregateFilter, merge: GroupLookupMergeType },
    /// Distinct terms per group. A term kept in group `g` also counts for the
    /// next `window_size - 1` siblings of `g`.
    GetGroupDistincts { scope: Option<Scope>, field: String, filter: Option<AggregateFilter>, window_size: usize },
    GetFieldMax { field: String },
    GetFieldMin { field: String },
}

impl Command {
    pub fn count_per_group() -> Self {
        Command::CountPerGroup
    }

    pub fn get_group_stats(metrics: Vec<AggregateMetric>) -> Self {
        let save_as = vec![None; metrics.len()];
        Command::GetGroupStats { metrics, save_as, return_matrix: false }
    }

    pub fn time_regroup(unit_millis: i64, format: &str) -> Self {
        Command::TimeRegroup {
            unit_millis,
            field: None,
            is_relative: false,
            delete_empty_groups: false,
            format: format.to_string(),
        }
    }

    pub fn filter_docs(filter: DocFilter) -> Self {
        Command::FilterDocs { filter, scope: None }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::ApplyFilterActions(_) => "ApplyFilterActions",
            Command::FilterDocs { .. } => "FilterDocs",
            Command::ApplyGroupFilter { .. } => "ApplyGroupFilter",
            Command::TimeRegroup { .. } => "TimeRegroup",
            Command::ExplodeMonthOfYear => "ExplodeMonthOfYear",
            Command::MetricRegroup { .. } => "MetricRegroup",
            Command::IntRegroupFieldIn { .. } => "IntRegroupFieldIn",
            Command::StringRegroupFieldIn { .. } => "StringRegroupFieldIn",
            Command::ExplodePerGroup { .. } => "ExplodePerGroup",
            Command::RegroupIntoParent { .. } => "RegroupIntoParent",
            Command::GetGroupStats { .. } => "GetGroupStats",
            Command::CountPerGroup => "CountPerGroup",
            Command::ComputeAndCreateGroupStatsLookup { .. } => "ComputeAndCreateGroupStatsLookup",
            Command::SimpleIterate { .. } => "SimpleIterate",
            Command::SumAcross { .. } => "SumAcross",
            Command::GetSimpleGroupDistincts { .. } => "GetSimpleGroupDistincts",
            Command::GetGroupPercentiles { .. } => "GetGroupPercentiles",
            Command::ExplodePerDocPercentile { .. } => "ExplodePerDocPercentile",
            Command::ExplodeByAggregatePercentile { .. } => "ExplodeByAggregatePercentile",
            Command::RegroupIntoLastSiblingWhere { .. } => "RegroupIntoLastSiblingWhere",
            Command::GetGroupDistincts { .. } => "GetGroupDistincts",
            Command::GetFieldMax { .. } => "GetFieldMax",
            Command::GetFieldMin { .. } => "GetFieldMin",
        }
    }

    pub fn execute(&mut self, session: &mut Session) -> Result<CommandOutput> {
        match self {
            Command::ApplyFilterActions(actions) => {
                for action in actions.iter() {
                    action.apply(session)?;
                }
                Ok(CommandOutput::Nothing)
            }
            Command::FilterDocs { filter, scope } => {
                let scope = scope.clone().unwrap_or_else(|| session.all_datasets());
                let actions = optimize_consecutive_query_actions(filter.filter_actions(&scope, session.num_groups())?);
                debug!(actions = actions.len(), "filtering documents");
                for action in &actions {
                    action.apply(session)?;
                }
                Ok(CommandOutput::Nothing)
            }
            Command::ApplyGroupFilter { filter } => apply_group_filter(session, filter),
            Command::TimeRegroup { unit_millis, field, is_relative, delete_empty_groups, format } => {
                time_regroup(session, *unit_millis, field.as_deref(), *is_relative, *delete_empty_groups, format)
            }
            Command::ExplodeMonthOfYear => explode_month_of_year(session),
            Command::MetricRegroup { metric, min, max, interval, exclude_gutters, with_default, from_predicate } => {
                let bounds = MetricBounds { min: *min, max: *max, interval: *interval };
                metric_regroup(session, metric, bounds, *exclude_gutters, *with_default, *from_predicate)
            }
            Command::IntRegroupFieldIn { field, terms, with_default } => {
                let conditions: Vec<Term> = terms.iter().map(|t| Term::Int(*t)).collect();
                let key_set = Arc::new(FieldInGroupKeySet::ints(session.key_set().clone(), terms, *with_default));
                regroup_field_in(session, field, &conditions, *with_default, key_set)
            }
            Command::StringRegroupFieldIn { field, terms, with_default } => {
                let conditions: Vec<Term> = terms.iter().map(|t| Term::Str(t.clone())).collect();
                let key_set = Arc::new(FieldInGroupKeySet::strings(session.key_set().clone(), terms, *with_default));
                regroup_field_in(session, field, &conditions, *with_default, key_set)
            }
            Command::ExplodePerGroup { field, terms_per_group, default_name } => {
                explode_per_group(session, field, terms_per_group, default_name.as_deref())
            }
            Command::RegroupIntoParent { merge } => {
                session.regroup_into_parent(*merge)?;
                Ok(CommandOutput::Nothing)
            }
            Command::GetGroupStats { metrics, save_as, return_matrix } => {
                get_group_stats(session, metrics, save_as, *return_matrix)
            }
            Command::CountPerGroup => {
                let count = session
                    .dataset_names()
                    .iter()
                    .map(|name| AggregateMetric::doc_stats(name, &["count()"]))
                    .reduce(AggregateMetric::add)
                    .unwrap_or(AggregateMetric::Constant(0.0));
                get_group_stats(session, &mut [count], &[None], false)
            }
            Command::ComputeAndCreateGroupStatsLookup { metric, name } => {
                get_group_stats(session, std::slice::from_mut(metric), &[Some(name.clone())], true)?;
                Ok(CommandOutput::Nothing)
            }
            Command::SimpleIterate { field, metrics, filter, top_k, limit, term_subset } => {
                simple_iterate(session, field, metrics, filter.as_mut(), top_k.as_mut(), *limit, term_subset.clone())
            }
            Command::SumAcross { field, metric, filter } => sum_across(session, field, metric, filter.as_mut()),
            Command::GetSimpleGroupDistincts { dataset, field } => {
                let counts = session.get_simple_distinct(dataset, field)?;
                let rows = present_groups(session)
                    .map(|g| stats_row(session.key_set().as_ref(), g, &[counts[g] as f64], session.output_format()))
                    .collect();
                Ok(CommandOutput::Rows(rows))
            }
            Command::GetGroupPercentiles { field, percentiles } => {
                let values = session.get_percentiles(field, percentiles)?;
                let rows = present_groups(session)
                    .map(|g| {
                        let row: Vec<f64> = values.iter().map(|p| p[g] as f64).collect();
                        stats_row(session.key_set().as_ref(), g, &row, session.output_format())
                    })
                    .collect();
                Ok(CommandOutput::Rows(rows))
            }
            Command::ExplodePerDocPercentile { field, num_buckets } => {
                explode_per_doc_percentile(session, field, *num_buckets)
            }
            Command::ExplodeByAggregatePercentile { field, metric, num_buckets } => {
                explode_by_aggregate_percentile(session, field, metric, *num_buckets)
            }
            Command::RegroupIntoLastSiblingWhere { filter, merge } => {
                regroup_into_last_sibling_where(session, filter, *merge)
            }
            Command::GetGroupDistincts { scope, field, filter, window_size } => {
                get_group_distincts(session, scope.as_ref(), field, filter.as_mut(), *window_size)
            }
            Command::GetFieldMax { field } => field_extreme(session, field, true),
            Command::GetFieldMin { field } => field_extreme(session, field, false),
        }
    }
}

fn present_groups(session: &Session) -> impl Iterator<Item = usize> + '_ {
    (1..=session.num_groups()).filter(|g| session.key_set().is_present(*g))
}

fn all_requires<'a>(metrics: impl IntoIterator<Item = &'a AggregateMetric>) -> HashSet<QualifiedPush> {
    metrics.into_iter().flat_map(AggregateMetric::requires).collect()
}

// ------------- Group stats -------------
fn get_group_stats(
    session: &mut Session,
    metrics: &mut [AggregateMetric],
    save_as: &[Option<String>],
    return_matrix: bool,
) -> Result<CommandOutput> {
    let requires = all_requires(metrics.iter());
    let num_groups = session.num_groups();
    let values: Vec<Vec<f64>> = session.with_pushed(&requires, |session, pushed| {
        session.register_metrics(metrics, &pushed.indexes)?;
        let stats = session.compute_group_stats(pushed)?;
        metrics.iter_mut().map(|m| m.get_group_stats(&stats, num_groups)).collect()
    })?;
    for (name, stats) in save_as.iter().zip(&values) {
        if let Some(name) = name {
            session.save_group_stats(name, stats.clone());
        }
    }
    if return_matrix {
        return Ok(CommandOutput::Matrix(values));
    }
    let rows = present_groups(session)
        .map(|g| {
            let row: Vec<f64> = values.iter().map(|v| v.get(g).copied().unwrap_or_default()).collect();
            stats_row(session.key_set().as_ref(), g, &row, session.output_format())
        })
        .collect();
    Ok(CommandOutput::Rows(rows))
}

fn apply_group_filter(session: &mut Session, filter: &mut AggregateFilter) -> Result<CommandOutput> {
    let num_groups = session.num_groups();
    let keep = session.with_pushed(&filter.requires(), |session, pushed| {
        session.register_filter(filter, &pushed.indexes)?;
        let stats = session.compute_group_stats(pushed)?;
        filter.get_group_stats(&stats, num_groups)
    })?;
    let key_set = session.key_set().clone();
    let mut parents = vec![0];
    let mut keys = vec![GroupKey::Initial];
    let mut old_groups = vec![0];
    let mut rules = Vec::new();
    for group in 1..=num_groups {
        if !key_set.is_present(group) || !keep.get(group).copied().unwrap_or(false) {
            continue;
        }
        old_groups.push(group);
        parents.push(key_set.parent_group(group));
        keys.push(key_set.group_key(group));
        rules.push(GroupMultiRemapRule::unconditional(group, old_groups.len() - 1));
    }
    debug!(kept = rules.len(), of = num_groups, "filtering groups");
    session.regroup_all(&rules, true)?;
    session.renumber_groups(DumbGroupKeySet::with_previous(key_set.previous().cloned(), parents, keys), &old_groups);
    Ok(CommandOutput::Nothing)
}

// ------------- Regroups -------------
fn time_regroup(
    session: &mut Session,
    unit_millis: i64,
    field: Option<&str>,
    is_relative: bool,
    delete_empty_groups: bool,
    format: &str,
) -> Result<CommandOutput> {
    let start = session.get_earliest_start();
    let end = session.get_latest_end();
    let span = if is_relative { session.get_longest_session_distance() } else { end - start };
    if span <= 0 {
        return Err(SquallError::parse("time regroup over an empty time range"));
    }
    let previous = session.key_set().clone();
    let buckets = (span as f64 / unit_millis as f64).ceil() as usize;
    let max_groups = session.perform_time_regroup(start, end, unit_millis, field, is_relative, delete_empty_groups)?;
    debug!(buckets, max_groups, "time regroup");
    let key_set = Arc::new(DateTimeRangeGroupKeySet::new(
        Arc::clone(&previous),
        start,
        unit_millis,
        buckets,
        previous.num_groups() * buckets,
        format,
    ));
    if delete_empty_groups {
        session.densify(key_set)?;
    } else {
        session.assume_dense(key_set);
    }
    Ok(CommandOutput::Nothing)
}

fn month_index(first: NaiveDate, date: NaiveDate) -> usize {
    ((date.year() - first.year()) * 12 + date.month0() as i32 - first.month0() as i32) as usize
}

fn utc_date(millis: i64) -> Result<NaiveDate> {
    DateTime::from_timestamp_millis(millis)
        .map(|t| t.date_naive())
        .ok_or_else(|| SquallError::parse(format!("timestamp {} out of range", millis)))
}

/// Year-month buckets: regroup by day, then remap days onto their month.
fn explode_month_of_year(session: &mut Session) -> Result<CommandOutput> {
    let first_day = utc_date(session.get_earliest_start())?;
    let last_day = utc_date(session.get_latest_end() - 1)?;
    let day_start = midnight_millis(first_day);
    let num_days = ((midnight_millis(last_day) - day_start) / MILLIS_PER_DAY + 1) as usize;
    let first_month = first_day.with_day(1).unwrap_or(first_day);
    let num_months = month_index(first_month, last_day) + 1;
    let previous = session.key_set().clone();
    let parents = session.num_groups();
    session.check_group_limit(parents * num_days.max(num_months))?;

    let pushes: HashMap<String, Vec<String>> = session
        .dataset_names()
        .into_iter()
        .filter_map(|name| {
            let field = session.session_info(&name)?.time_field.clone();
            Some((name, vec![field]))
        })
        .collect();
    session.metric_regroup(
        &|name| lookup_pushes(&pushes, name),
        day_start / 1000,
        (day_start + num_days as i64 * MILLIS_PER_DAY) / 1000,
        MILLIS_PER_DAY / 1000,
        true,
    )?;

    let mut from = Vec::with_capacity(parents * num_days);
    let mut to = Vec::with_capacity(parents * num_days);
    for parent in 1..=parents {
        for (day, date) in first_day.iter_days().take(num_days).enumerate() {
            from.push((parent - 1) * num_days + day + 1);
            to.push((parent - 1) * num_months + month_index(first_month, date) + 1);
        }
    }
    session.remap_groups(&from, &to, true, &session.all_datasets())?;
    session.assume_dense(Arc::new(YearMonthGroupKeySet::new(previous, num_months, first_month)));
    Ok(CommandOutput::Nothing)
}

fn lookup_pushes(pushes: &HashMap<String, Vec<String>>, name: &str) -> Result<Vec<String>> {
    pushes.get(name).cloned().ok_or_else(|| SquallError::Invariant(format!("no pushes for dataset {}", name)))
}

struct MetricBounds {
    min: i64,
    max: i64,
    interval: i64,
}

fn metric_regroup(
    session: &mut Session,
    metric: &DocMetric,
    bounds: MetricBounds,
    exclude_gutters: bool,
    with_default: bool,
    from_predicate: bool,
) -> Result<CommandOutput> {
    let MetricBounds { min, max, interval } = bounds;
    if interval <= 0 || max <= min {
        return Err(SquallError::parse(format!("invalid bucket range [{}, {}) by {}", min, max, interval)));
    }
    let buckets = ((max - 1 - min) / interval + 1) as usize;
    let per_parent = if with_default {
        buckets + 1
    } else if exclude_gutters {
        buckets
    } else {
        buckets + 2
    };
    let parents = session.num_groups();
    session.check_group_limit(parents * per_parent)?;

    let mut pushes = HashMap::new();
    for name in session.dataset_names() {
        let tokens = metric.get_pushes(&name)?;
        pushes.insert(name, tokens);
    }
    session.metric_regroup(&|name| lookup_pushes(&pushes, name), min, max, interval, exclude_gutters && !with_default)?;
    if with_default {
        // both gutters of every parent fold into its default bucket
        let with_gutters = buckets + 2;
        let from: Vec<usize> = (1..=parents * with_gutters).collect();
        let to: Vec<usize> = from
            .iter()
            .map(|g| {
                let (parent, inner) = ((g - 1) / with_gutters, (g - 1) % with_gutters);
                parent * per_parent + inner.min(buckets) + 1
            })
            .collect();
        session.remap_groups(&from, &to, false, &session.all_datasets())?;
    }
    let previous = session.key_set().clone();
    session.assume_dense(Arc::new(MetricRangeGroupKeySet::new(
        previous,
        per_parent,
        exclude_gutters || with_default,
        min,
        interval,
        with_default,
        from_predicate,
        parents * per_parent,
    )));
    Ok(CommandOutput::Nothing)
}

fn regroup_field_in(
    session: &mut Session,
    field: &str,
    terms: &[Term],
    with_default: bool,
    key_set: KeySetRef,
) -> Result<CommandOutput> {
    if terms.is_empty() && !with_default {
        return Err(SquallError::parse("Cannot have empty set of terms!"));
    }
    let per_parent = terms.len() + usize::from(with_default);
    let parents = session.num_groups();
    session.check_group_limit(parents * per_parent)?;
    let conditions: Vec<RegroupCondition> = terms
        .iter()
        .map(|term| RegroupCondition { field: field.to_string(), term: term.clone(), inequality: false })
        .collect();
    let rules: Vec<GroupMultiRemapRule> = present_groups(session)
        .map(|group| {
            let base = 1 + (group - 1) * per_parent;
            GroupMultiRemapRule {
                target: group,
                negative: if with_default { base + terms.len() } else { 0 },
                positive: (0..terms.len()).map(|i| base + i).collect(),
                conditions: conditions.clone(),
            }
        })
        .collect();
    session.regroup_with_single_field_rules(field, &rules, true)?;
    session.densify(key_set)?;
    Ok(CommandOutput::Nothing)
}

fn explode_per_group(
    session: &mut Session,
    field: &str,
    terms_per_group: &[Vec<Term>],
    default_name: Option<&str>,
) -> Result<CommandOutput> {
    let num_groups = session.num_groups();
    if terms_per_group.len() != num_groups {
        return Err(SquallError::Invariant(format!(
            "{} term lists for {} groups",
            terms_per_group.len(),
            num_groups
        )));
    }
    let mut parents = vec![0];
    let mut keys = vec![GroupKey::Initial];
    let mut rules = Vec::with_capacity(num_groups);
    for (group, terms) in (1..=num_groups).zip(terms_per_group) {
        let first = parents.len();
        for term in terms {
            parents.push(group);
            keys.push(match term {
                Term::Int(v) => GroupKey::IntTerm(*v),
                Term::Str(s) => GroupKey::StringTerm(s.clone()),
            });
        }
        let negative = match default_name {
            Some(name) => {
                parents.push(group);
                keys.push(GroupKey::Default(name.to_string()));
                parents.len() - 1
            }
            None => 0,
        };
        if terms.is_empty() {
            rules.push(GroupMultiRemapRule::unconditional(group, negative));
            continue;
        }
        rules.push(GroupMultiRemapRule {
            target: group,
            negative,
            positive: (first..first + terms.len()).collect(),
            conditions: terms
                .iter()
                .map(|term| RegroupCondition { field: field.to_string(), term: term.clone(), inequality: false })
                .collect(),
        });
    }
    session.check_group_limit(parents.len() - 1)?;
    session.regroup_with_single_field_rules(field, &rules, true)?;
    let previous = session.key_set().clone();
    session.assume_dense(DumbGroupKeySet::create(previous, parents, keys));
    Ok(CommandOutput::Nothing)
}

fn bucket_label(from: usize, to: usize, num_buckets: usize) -> GroupKey {
    let share = |i: usize| i as f64 / num_buckets as f64;
    GroupKey::StringTerm(format!("[{}, {})", share(from), share(to)))
}

fn explode_per_doc_percentile(session: &mut Session, field: &str, num_buckets: usize) -> Result<CommandOutput> {
    if num_buckets == 0 {
        return Err(SquallError::parse("ExplodePerDocPercentile needs at least one bucket"));
    }
    let num_groups = session.num_groups();
    session.check_group_limit(num_buckets * num_groups)?;
    let requires: HashSet<QualifiedPush> = session
        .dataset_names()
        .iter()
        .map(|name| QualifiedPush::new(name, vec![format!("hasintfield {}", field)]))
        .collect();
    // cutoffs[g][b] is the largest term of bucket b in group g
    let cutoffs = session.with_pushed(&requires, |session, pushed| {
        let stats = session.compute_group_stats(pushed)?;
        let counts: Vec<i64> = (0..=num_groups).map(|g| stats.iter().map(|s| s.get(g).copied().unwrap_or(0)).sum()).collect();
        let mut running = vec![0i64; num_groups + 1];
        let mut filled = vec![0usize; num_groups + 1];
        let mut cutoffs = vec![vec![0i64; num_buckets]; num_groups + 1];
        session.iterate_field(field, pushed, &IterateOptions::default(), true, true, |term, stats, group| {
            let TermRef::Int(term) = term else {
                return Err(SquallError::Unsupported(format!("ExplodePerDocPercentile over the string field {}", field)));
            };
            if group > num_groups {
                return Ok(());
            }
            running[group] += stats.iter().sum::<i64>();
            let reached = match running[group].cmp(&counts[group]) {
                Ordering::Equal => num_buckets,
                Ordering::Less => (num_buckets as f64 * running[group] as f64 / counts[group] as f64).floor() as usize,
                Ordering::Greater => {
                    return Err(SquallError::Unsupported(format!(
                        "ExplodePerDocPercentile over the multi-valued field {}",
                        field
                    )));
                }
            };
            if reached > filled[group] {
                cutoffs[group][filled[group]..reached].fill(term);
                filled[group] = reached;
            }
            Ok(())
        })?;
        Ok(cutoffs)
    })?;

    let mut parents = vec![0];
    let mut keys = vec![GroupKey::Initial];
    let mut rules = Vec::with_capacity(num_groups);
    for (group, cutoffs) in cutoffs.iter().enumerate().skip(1) {
        let mut positive = Vec::new();
        let mut conditions = Vec::new();
        for (bucket, cutoff) in cutoffs.iter().enumerate() {
            if bucket > 0 && cutoffs[bucket - 1] == *cutoff {
                continue;
            }
            let end = cutoffs.iter().rposition(|c| c == cutoff).unwrap_or(bucket);
            parents.push(group);
            keys.push(bucket_label(bucket, end + 1, num_buckets));
            positive.push(parents.len() - 1);
            conditions.push(RegroupCondition { field: field.to_string(), term: Term::Int(*cutoff), inequality: true });
        }
        rules.push(GroupMultiRemapRule { target: group, negative: 0, positive, conditions });
    }
    debug!(groups = parents.len() - 1, "per-document percentile buckets");
    session.regroup_with_single_field_rules(field, &rules, true)?;
    let previous = session.key_set().clone();
    session.assume_dense(DumbGroupKeySet::create(previous, parents, keys));
    Ok(CommandOutput::Nothing)
}

fn explode_by_aggregate_percentile(
    session: &mut Session,
    field: &str,
    metric: &mut AggregateMetric,
    num_buckets: usize,
) -> Result<CommandOutput> {
    if num_buckets == 0 {
        return Err(SquallError::parse("ExplodeByAggregatePercentile needs at least one bucket"));
    }
    let num_groups = session.num_groups();
    session.check_group_limit(num_buckets * num_groups)?;
    let per_group = session.with_pushed(&metric.requires(), |session, pushed| {
        session.register_metrics(std::slice::from_mut(metric), &pushed.indexes)?;
        let need_stats = metric.need_stats();
        let mut per_group: Vec<Vec<(Term, f64)>> = vec![Vec::new(); num_groups + 1];
        session.iterate_field(field, pushed, &IterateOptions::default(), true, need_stats, |term, stats, group| {
            if let Some(values) = per_group.get_mut(group) {
                values.push((term.to_term(), metric.apply(term, stats, group)?));
            }
            Ok(())
        })?;
        Ok(per_group)
    })?;

    let mut parents = vec![0];
    let mut keys = vec![GroupKey::Initial];
    let mut rules = Vec::with_capacity(num_groups);
    for (group, terms) in per_group.into_iter().enumerate().skip(1) {
        let base = parents.len();
        for bucket in 0..num_buckets {
            parents.push(group);
            keys.push(bucket_label(bucket, bucket + 1, num_buckets));
        }
        let values: Vec<f64> = terms.iter().map(|(_, v)| *v).collect();
        let starts = bucket_starts(&values, num_buckets);
        let (positive, conditions): (Vec<usize>, Vec<RegroupCondition>) = terms
            .into_iter()
            .map(|(term, value)| {
                (base + find_percentile(value, &starts), RegroupCondition { field: field.to_string(), term, inequality: false })
            })
            .unzip();
        rules.push(GroupMultiRemapRule { target: group, negative: 0, positive, conditions });
    }
    session.regroup_with_single_field_rules(field, &rules, true)?;
    let previous = session.key_set().clone();
    session.assume_dense(DumbGroupKeySet::create(previous, parents, keys));
    Ok(CommandOutput::Nothing)
}

/// Answers, for groups `1..=n`, whether the group was folded into its last sibling.
fn regroup_into_last_sibling_where(
    session: &mut Session,
    filter: &mut AggregateFilter,
    merge: GroupLookupMergeType,
) -> Result<CommandOutput> {
    let num_groups = session.num_groups();
    let passes = session.with_pushed(&filter.requires(), |session, pushed| {
        session.register_filter(filter, &pushed.indexes)?;
        let stats = session.compute_group_stats(pushed)?;
        filter.get_group_stats(&stats, num_groups)
    })?;
    let key_set = session.key_set().clone();
    let mut last_child: HashMap<usize, usize> = HashMap::new();
    for group in 1..=num_groups {
        last_child.insert(key_set.parent_group(group), group);
    }
    let last_of = |group: usize| last_child.get(&key_set.parent_group(group)).copied().unwrap_or(group);

    let mut remerge: Vec<bool> = (0..=num_groups).map(|g| g > 0 && passes.get(g).copied().unwrap_or(false)).collect();
    for group in 1..=num_groups {
        if remerge[group] {
            remerge[group..last_of(group)].fill(true);
        }
    }
    for last in last_child.values() {
        remerge[*last] = false;
    }

    let from: Vec<usize> = (1..=num_groups).filter(|g| remerge[*g]).collect();
    if !from.is_empty() && session.has_saved_stats_at_depth() {
        return Err(match merge {
            GroupLookupMergeType::FailIfPresent => {
                SquallError::Execution("saved group stats would merge into the last sibling".to_string())
            }
            other => SquallError::Unsupported(format!("{:?} merge into the last sibling", other)),
        });
    }
    if !from.is_empty() {
        let to: Vec<usize> = from.iter().map(|g| last_of(*g)).collect();
        debug!(merged = from.len(), "regrouping into last siblings");
        session.remap_groups(&from, &to, false, &session.all_datasets())?;
    }
    Ok(CommandOutput::Rows(vec![serde_json::to_string(&remerge[1..])?]))
}

// ------------- Iteration -------------
fn same_term(term: &Term, other: TermRef<'_>) -> bool {
    match (term, other) {
        (Term::Int(a), TermRef::Int(b)) => *a == b,
        (Term::Str(a), TermRef::Str(b)) => a == b,
        _ => false,
    }
}

fn term_text(term: TermRef<'_>) -> String {
    match term {
        TermRef::Int(v) => v.to_string(),
        TermRef::Str(s) => term_column(s),
    }
}

struct TermRow {
    term: String,
    values: Vec<f64>,
    rank: f64,
}

/// The remote side may rank terms itself when one session holds the field
/// and the ranking metric is a plain pushed stat.
fn remote_top_k(session: &Session, top_k: Option<&TopK>, filtered: bool, pushed: &PushedMetrics) -> Option<RemoteTopKParams> {
    let top_k = top_k?;
    if filtered || session.dataset_names().len() != 1 || pushed.num_metrics == 0 {
        return None;
    }
    match &top_k.metric {
        AggregateMetric::DocStats { index: Some(index), .. } => {
            Some(RemoteTopKParams { limit: top_k.limit, sort_stat: *index })
        }
        _ => None,
    }
}

fn simple_iterate(
    session: &mut Session,
    field: &str,
    metrics: &mut [AggregateMetric],
    mut filter: Option<&mut AggregateFilter>,
    mut top_k: Option<&mut TopK>,
    limit: Option<usize>,
    term_subset: Option<TermSubset>,
) -> Result<CommandOutput> {
    let mut requires = all_requires(metrics.iter());
    if let Some(filter) = filter.as_deref() {
        requires.extend(filter.requires());
    }
    if let Some(top_k) = top_k.as_deref() {
        requires.extend(top_k.metric.requires());
    }
    let term_subset = if session.has_option("nosubset") { None } else { term_subset };
    let key_set = session.key_set().clone();
    let format = session.output_format();

    let by_group = session.with_pushed(&requires, |session, pushed| {
        session.register_metrics(metrics, &pushed.indexes)?;
        if let Some(filter) = filter.as_deref_mut() {
            session.register_filter(filter, &pushed.indexes)?;
        }
        if let Some(top_k) = top_k.as_deref_mut() {
            session.register_metrics(std::slice::from_mut(&mut top_k.metric), &pushed.indexes)?;
        }
        let filtered = filter.is_some();
        let options = IterateOptions {
            term_subset,
            top_k: remote_top_k(session, top_k.as_deref(), filtered, pushed),
            limit: if filtered || top_k.is_some() { None } else { limit },
        };
        let need_sorted = limit.is_some()
            || metrics.iter().any(AggregateMetric::need_sorted)
            || filter.as_deref().is_some_and(AggregateFilter::need_sorted);
        let need_stats = metrics.iter().any(AggregateMetric::need_stats)
            || filter.as_deref().is_some_and(AggregateFilter::need_stats)
            || top_k.as_deref().is_some_and(|t| t.metric.need_stats());

        let mut by_group: BTreeMap<usize, Vec<TermRow>> = BTreeMap::new();
        let mut terms_seen = 0usize;
        let mut last_term: Option<String> = None;
        session.iterate_field(field, pushed, &options, need_sorted, need_stats, |term, stats, group| {
            if !key_set.is_present(group) {
                return Ok(());
            }
            if let Some(filter) = filter.as_deref_mut() {
                if !filter.allow(term, stats, group)? {
                    return Ok(());
                }
            }
            let text = term_text(term);
            if last_term.as_deref() != Some(text.as_str()) {
                if limit.is_some_and(|limit| terms_seen >= limit) {
                    return Ok(());
                }
                terms_seen += 1;
                last_term = Some(text.clone());
            }
            let values = metrics.iter_mut().map(|m| m.apply(term, stats, group)).collect::<Result<Vec<f64>>>()?;
            let rank = match top_k.as_deref_mut() {
                Some(top_k) => top_k.metric.apply(term, stats, group)?,
                None => 0.0,
            };
            by_group.entry(group).or_default().push(TermRow { term: text, values, rank });
            Ok(())
        })?;
        Ok(by_group)
    })?;

    let mut rows = Vec::new();
    for (group, mut terms) in by_group {
        if let Some(top_k) = top_k.as_deref() {
            // stable: ties keep term order
            terms.sort_by(|a, b| b.rank.total_cmp(&a.rank));
            terms.truncate(top_k.limit);
        }
        for row in terms {
            let mut columns = group_columns(key_set.as_ref(), group);
            columns.push(row.term);
            columns.extend(row.values.iter().map(|v| format_value(*v)));
            rows.push(render_row(&columns, format));
        }
    }
    Ok(CommandOutput::Rows(rows))
}

/// Per group, the sum of `metric` over every term of `field` passing `filter`.
fn sum_across(
    session: &mut Session,
    field: &str,
    metric: &mut AggregateMetric,
    mut filter: Option<&mut AggregateFilter>,
) -> Result<CommandOutput> {
    let mut requires = metric.requires();
    if let Some(filter) = filter.as_deref() {
        requires.extend(filter.requires());
    }
    let num_groups = session.num_groups();
    let sums = session.with_pushed(&requires, |session, pushed| {
        session.register_metrics(std::slice::from_mut(metric), &pushed.indexes)?;
        if let Some(filter) = filter.as_deref_mut() {
            session.register_filter(filter, &pushed.indexes)?;
        }
        let need_sorted = metric.need_sorted() || filter.as_deref().is_some_and(AggregateFilter::need_sorted);
        let need_stats = metric.need_stats() || filter.as_deref().is_some_and(AggregateFilter::need_stats);
        let mut sums = vec![0.0; num_groups + 1];
        session.iterate_field(field, pushed, &IterateOptions::default(), need_sorted, need_stats, |term, stats, group| {
            if let Some(filter) = filter.as_deref_mut() {
                if !filter.allow(term, stats, group)? {
                    return Ok(());
                }
            }
            if let Some(sum) = sums.get_mut(group) {
                *sum += metric.apply(term, stats, group)?;
            }
            Ok(())
        })?;
        Ok(sums)
    })?;
    let rows = present_groups(session)
        .map(|g| stats_row(session.key_set().as_ref(), g, &[sums[g]], session.output_format()))
        .collect();
    Ok(CommandOutput::Rows(rows))
}

/// Per group, the number of distinct `field` terms passing `filter`, each
/// term counted for a window of `window_size` siblings.
fn get_group_distincts(
    session: &mut Session,
    scope: Option<&Scope>,
    field: &str,
    mut filter: Option<&mut AggregateFilter>,
    window_size: usize,
) -> Result<CommandOutput> {
    if window_size == 0 {
        return Err(SquallError::parse("GetGroupDistincts needs a window of at least one group"));
    }
    let num_groups = session.num_groups();
    let key_set = session.key_set().clone();
    let requires = filter.as_deref().map(AggregateFilter::requires).unwrap_or_default();
    let counts = session.with_pushed(&requires, |session, pushed| {
        if let Some(filter) = filter.as_deref_mut() {
            session.register_filter(filter, &pushed.indexes)?;
        }
        let need_stats = filter.as_deref().is_some_and(AggregateFilter::need_stats);
        let mut counts = vec![0i64; num_groups];
        let mut current: Option<Term> = None;
        let mut marked: HashSet<usize> = HashSet::new();
        fn flush(marked: &mut HashSet<usize>, counts: &mut [i64]) {
            for group in marked.drain() {
                counts[group - 1] += 1;
            }
        }
        // sorted iteration hands over every group of a term before the next term
        session.iterate_field_in(field, scope, pushed, &IterateOptions::default(), true, need_stats, |term, stats, group| {
            if current.as_ref().is_none_or(|c| !same_term(c, term)) {
                flush(&mut marked, &mut counts);
                current = Some(term.to_term());
            }
            if group == 0 || group > num_groups {
                return Ok(());
            }
            if let Some(filter) = filter.as_deref_mut() {
                if !filter.allow(term, stats, group)? {
                    return Ok(());
                }
            }
            let parent = key_set.parent_group(group);
            let window = (group..group + window_size).take_while(|g| *g <= num_groups && key_set.parent_group(*g) == parent);
            marked.extend(window);
            Ok(())
        })?;
        flush(&mut marked, &mut counts);
        Ok(prepend_zero(&counts))
    })?;
    let rows = present_groups(session)
        .map(|g| stats_row(session.key_set().as_ref(), g, &[counts[g] as f64], session.output_format()))
        .collect();
    Ok(CommandOutput::Rows(rows))
}

/// Largest (or smallest) term of `field` per group. String terms count when
/// they parse as integers; a group without any value reads NaN.
fn field_extreme(session: &mut Session, field: &str, take_max: bool) -> Result<CommandOutput> {
    let num_groups = session.num_groups();
    let values = session.with_pushed(&HashSet::new(), |session, pushed| {
        let mut values: Vec<Option<i64>> = vec![None; num_groups + 1];
        session.iterate_field(field, pushed, &IterateOptions::default(), false, false, |term, _, group| {
            let value = match term {
                TermRef::Int(v) => Some(v),
                TermRef::Str(s) => s.parse::<i64>().ok(),
            };
            if let (Some(v), Some(slot)) = (value, values.get_mut(group)) {
                *slot = Some(match *slot {
                    Some(seen) if take_max => seen.max(v),
                    Some(seen) => seen.min(v),
                    None => v,
                });
            }
            Ok(())
        })?;
        Ok(values)
    })?;
    let rows = present_groups(session)
        .map(|g| {
            let value = values[g].map_or(f64::NAN, |v| v as f64);
            stats_row(session.key_set().as_ref(), g, &[value], session.output_format())
        })
        .collect();
    Ok(CommandOutput::Rows(rows))
}
