//! Per-group aggregate metrics and filters.
//!
//! Both trees support two evaluation modes that must agree:
//! * local, over a materialized stats matrix (`get_group_stats`) or one
//!   merged FTGS row at a time (`apply` / `allow`);
//! * remote, compiled into a [`StatTree`] built from the already-compiled
//!   stat trees of the pushed metrics (`to_stat_tree`).
//!
//! `register` must run over the whole tree before either mode: it binds
//! pushed metrics to their slot and captures the live group key set.
//!
//! `need_sorted`, `need_group` and `need_stats` are the OR over children,
//! except term predicates, which need none of them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use regex::Regex;

use crate::error::{Result, SquallError};
use crate::groupkeys::KeySetRef;
use crate::remote::{anchored, BinaryOp, GroupStats, StatTree, Term, UnaryOp};

pub type MetricIndexes = HashMap<QualifiedPush, usize>;
pub type AtomicStats = HashMap<QualifiedPush, StatTree>;

/// One requested remote statistic: the session it is pushed to and its tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedPush {
    pub session_name: String,
    pub pushes: Vec<String>,
}

impl QualifiedPush {
    pub fn new(session_name: &str, pushes: Vec<String>) -> Self {
        Self { session_name: session_name.to_string(), pushes }
    }
}

/// A borrowed term of the row being evaluated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TermRef<'a> {
    Int(i64),
    Str(&'a str),
}

impl TermRef<'_> {
    pub fn to_term(self) -> Term {
        match self {
            TermRef::Int(v) => Term::Int(v),
            TermRef::Str(s) => Term::Str(s.to_string()),
        }
    }
    fn matches_string(self, s: &str) -> bool {
        match self {
            TermRef::Int(v) => v.to_string() == s,
            TermRef::Str(t) => t == s,
        }
    }
}

fn missing_registration(what: &str) -> SquallError {
    SquallError::Invariant(format!("{} evaluated before register", what))
}

// ------------- AggregateMetric -------------
#[derive(Debug, Clone)]
pub enum AggregateMetric {
    Constant(f64),
    /// A metric pushed to one session; bound to its slot by `register`.
    DocStats { push: QualifiedPush, index: Option<usize> },
    /// One value per group, index 0 unused.
    PerGroupConstant(Arc<Vec<f64>>),
    /// Stats saved by an earlier command, aligned to the current depth by `bind_lookups`.
    NamedLookup { name: String, values: Option<Arc<Vec<f64>>> },
    Unary(UnaryOp, Box<AggregateMetric>),
    Binary(BinaryOp, Box<AggregateMetric>, Box<AggregateMetric>),
    /// The value `delay` groups earlier under the same parent.
    ParentLag { delay: usize, metric: Box<AggregateMetric>, state: LagState },
    /// The value the same group had `delay` terms earlier.
    IterateLag { delay: usize, metric: Box<AggregateMetric>, state: IterateState },
    /// Running sum: across terms per group, or across sibling groups.
    Running { metric: Box<AggregateMetric>, state: IterateState },
    /// Sum of the last `size` values: across terms per group, or across sibling groups.
    Window { size: usize, metric: Box<AggregateMetric>, state: IterateState },
    IfThenElse(Box<AggregateFilter>, Box<AggregateMetric>, Box<AggregateMetric>),
}

/// Streaming state of lag and window nodes, plus the group key set they walk.
#[derive(Debug, Clone, Default)]
pub struct LagState {
    key_set: Option<KeySetRef>,
    last_term: Option<Term>,
    recent: VecDeque<(usize, f64)>,
}

#[derive(Debug, Clone, Default)]
pub struct IterateState {
    key_set: Option<KeySetRef>,
    history: HashMap<usize, VecDeque<f64>>,
    sums: HashMap<usize, f64>,
}

impl AggregateMetric {
    pub fn constant(v: f64) -> Self {
        AggregateMetric::Constant(v)
    }
    pub fn doc_stats(session_name: &str, pushes: &[&str]) -> Self {
        AggregateMetric::DocStats {
            push: QualifiedPush::new(session_name, pushes.iter().map(|p| p.to_string()).collect()),
            index: None,
        }
    }
    pub fn per_group(values: Vec<f64>) -> Self {
        AggregateMetric::PerGroupConstant(Arc::new(values))
    }
    pub fn named_lookup(name: &str) -> Self {
        AggregateMetric::NamedLookup { name: name.to_string(), values: None }
    }
    pub fn unary(op: UnaryOp, m: AggregateMetric) -> Self {
        AggregateMetric::Unary(op, Box::new(m))
    }
    pub fn binary(op: BinaryOp, l: AggregateMetric, r: AggregateMetric) -> Self {
        AggregateMetric::Binary(op, Box::new(l), Box::new(r))
    }
    pub fn add(l: AggregateMetric, r: AggregateMetric) -> Self {
        Self::binary(BinaryOp::Add, l, r)
    }
    pub fn divide(l: AggregateMetric, r: AggregateMetric) -> Self {
        Self::binary(BinaryOp::Divide, l, r)
    }
    pub fn parent_lag(delay: usize, m: AggregateMetric) -> Self {
        AggregateMetric::ParentLag { delay, metric: Box::new(m), state: LagState::default() }
    }
    pub fn iterate_lag(delay: usize, m: AggregateMetric) -> Self {
        AggregateMetric::IterateLag { delay, metric: Box::new(m), state: IterateState::default() }
    }
    pub fn running(m: AggregateMetric) -> Self {
        AggregateMetric::Running { metric: Box::new(m), state: IterateState::default() }
    }
    pub fn window(size: usize, m: AggregateMetric) -> Self {
        AggregateMetric::Window { size, metric: Box::new(m), state: IterateState::default() }
    }
    pub fn if_then_else(cond: AggregateFilter, t: AggregateMetric, f: AggregateMetric) -> Self {
        AggregateMetric::IfThenElse(Box::new(cond), Box::new(t), Box::new(f))
    }

    pub fn requires(&self) -> HashSet<QualifiedPush> {
        let mut out = HashSet::new();
        self.collect_requires(&mut out);
        out
    }

    pub(crate) fn collect_requires(&self, out: &mut HashSet<QualifiedPush>) {
        match self {
            AggregateMetric::Constant(_) | AggregateMetric::PerGroupConstant(_) | AggregateMetric::NamedLookup { .. } => {}
            AggregateMetric::DocStats { push, .. } => {
                out.insert(push.clone());
            }
            AggregateMetric::Unary(_, m)
            | AggregateMetric::ParentLag { metric: m, .. }
            | AggregateMetric::IterateLag { metric: m, .. }
            | AggregateMetric::Running { metric: m, .. }
            | AggregateMetric::Window { metric: m, .. } => m.collect_requires(out),
            AggregateMetric::Binary(_, l, r) => {
                l.collect_requires(out);
                r.collect_requires(out);
            }
            AggregateMetric::IfThenElse(c, t, f) => {
                c.collect_requires(out);
                t.collect_requires(out);
                f.collect_requires(out);
            }
        }
    }

    /// Replaces every named lookup's values with those `resolve` returns.
    pub fn bind_lookups(&mut self, resolve: &mut dyn FnMut(&str) -> Result<Arc<Vec<f64>>>) -> Result<()> {
        match self {
            AggregateMetric::NamedLookup { name, values } => {
                *values = Some(resolve(name)?);
                Ok(())
            }
            AggregateMetric::Constant(_) | AggregateMetric::DocStats { .. } | AggregateMetric::PerGroupConstant(_) => Ok(()),
            AggregateMetric::Unary(_, m)
            | AggregateMetric::ParentLag { metric: m, .. }
            | AggregateMetric::IterateLag { metric: m, .. }
            | AggregateMetric::Running { metric: m, .. }
            | AggregateMetric::Window { metric: m, .. } => m.bind_lookups(resolve),
            AggregateMetric::Binary(_, l, r) => {
                l.bind_lookups(resolve)?;
                r.bind_lookups(resolve)
            }
            AggregateMetric::IfThenElse(c, t, f) => {
                c.bind_lookups(resolve)?;
                t.bind_lookups(resolve)?;
                f.bind_lookups(resolve)
            }
        }
    }

    pub fn register(&mut self, metric_indexes: &MetricIndexes, key_set: &KeySetRef) -> Result<()> {
        match self {
            AggregateMetric::Constant(_) | AggregateMetric::PerGroupConstant(_) => Ok(()),
            AggregateMetric::NamedLookup { name, values } => match values {
                Some(_) => Ok(()),
                None => Err(SquallError::Invariant(format!("lookup {} was never bound", name))),
            },
            AggregateMetric::DocStats { push, index } => {
                let slot = metric_indexes
                    .get(push)
                    .ok_or_else(|| SquallError::Invariant(format!("metric {:?} was never pushed", push)))?;
                *index = Some(*slot);
                Ok(())
            }
            AggregateMetric::Unary(_, m) => m.register(metric_indexes, key_set),
            AggregateMetric::Binary(_, l, r) => {
                l.register(metric_indexes, key_set)?;
                r.register(metric_indexes, key_set)
            }
            AggregateMetric::ParentLag { metric, state, .. } => {
                *state = LagState { key_set: Some(key_set.clone()), ..Default::default() };
                metric.register(metric_indexes, key_set)
            }
            AggregateMetric::IterateLag { metric, state, .. }
            | AggregateMetric::Running { metric, state }
            | AggregateMetric::Window { metric, state, .. } => {
                *state = IterateState { key_set: Some(key_set.clone()), ..Default::default() };
                metric.register(metric_indexes, key_set)
            }
            AggregateMetric::IfThenElse(c, t, f) => {
                c.register(metric_indexes, key_set)?;
                t.register(metric_indexes, key_set)?;
                f.register(metric_indexes, key_set)
            }
        }
    }

    /// One value per group `0..=num_groups`; `stats[slot][group]`.
    pub fn get_group_stats(&mut self, stats: &[GroupStats], num_groups: usize) -> Result<Vec<f64>> {
        Ok(match self {
            AggregateMetric::Constant(v) => vec![*v; num_groups + 1],
            AggregateMetric::DocStats { index, .. } => {
                let slot = index.ok_or_else(|| missing_registration("DocStats"))?;
                let column = stats.get(slot).map(Vec::as_slice).unwrap_or_default();
                (0..=num_groups).map(|g| column.get(g).copied().unwrap_or_default() as f64).collect()
            }
            AggregateMetric::PerGroupConstant(values) | AggregateMetric::NamedLookup { values: Some(values), .. } => {
                (0..=num_groups).map(|g| values.get(g).copied().unwrap_or_default()).collect()
            }
            AggregateMetric::NamedLookup { values: None, .. } => return Err(missing_registration("NamedLookup")),
            AggregateMetric::Unary(op, m) => {
                let mut values = m.get_group_stats(stats, num_groups)?;
                values.iter_mut().for_each(|v| *v = op.eval(*v));
                values
            }
            AggregateMetric::Binary(op, l, r) => {
                let mut lhs = l.get_group_stats(stats, num_groups)?;
                let rhs = r.get_group_stats(stats, num_groups)?;
                lhs.iter_mut().zip(rhs).for_each(|(l, r)| *l = op.eval(*l, r));
                lhs
            }
            AggregateMetric::ParentLag { delay, metric, state } => {
                let inner = metric.get_group_stats(stats, num_groups)?;
                let key_set = state.key_set.as_ref().ok_or_else(|| missing_registration("ParentLag"))?;
                let mut result = vec![0.0; num_groups + 1];
                for g in (*delay + 1)..=num_groups {
                    if key_set.parent_group(g - *delay) == key_set.parent_group(g) {
                        result[g] = inner[g - *delay];
                    }
                }
                result
            }
            AggregateMetric::IterateLag { .. } => {
                return Err(SquallError::Unsupported("IterateLag cannot compute group stats".to_string()));
            }
            AggregateMetric::Running { metric, state } => {
                let inner = metric.get_group_stats(stats, num_groups)?;
                let key_set = state.key_set.as_ref().ok_or_else(|| missing_registration("Running"))?;
                let mut result = vec![0.0; num_groups + 1];
                let mut sum = 0.0;
                for g in 1..=num_groups {
                    if g == 1 || key_set.parent_group(g - 1) != key_set.parent_group(g) {
                        sum = 0.0;
                    }
                    sum += inner[g];
                    result[g] = sum;
                }
                result
            }
            AggregateMetric::Window { size, metric, state } => {
                let inner = metric.get_group_stats(stats, num_groups)?;
                let key_set = state.key_set.as_ref().ok_or_else(|| missing_registration("Window"))?;
                let mut result = vec![0.0; num_groups + 1];
                for g in 1..=num_groups {
                    let parent = key_set.parent_group(g);
                    let mut sum = 0.0;
                    for offset in 0..*size {
                        if offset >= g || key_set.parent_group(g - offset) != parent {
                            break;
                        }
                        if !key_set.is_present(g - offset) {
                            return Err(SquallError::Execution(
                                "Cannot use window where the window overlaps missing data.".to_string(),
                            ));
                        }
                        sum += inner[g - offset];
                    }
                    result[g] = sum;
                }
                result
            }
            AggregateMetric::IfThenElse(c, t, f) => {
                let cond = c.get_group_stats(stats, num_groups)?;
                let tv = t.get_group_stats(stats, num_groups)?;
                let fv = f.get_group_stats(stats, num_groups)?;
                (0..=num_groups).map(|g| if cond[g] { tv[g] } else { fv[g] }).collect()
            }
        })
    }

    pub fn apply(&mut self, term: TermRef<'_>, stats: &[i64], group: usize) -> Result<f64> {
        Ok(match self {
            AggregateMetric::Constant(v) => *v,
            AggregateMetric::DocStats { index, .. } => {
                let slot = index.ok_or_else(|| missing_registration("DocStats"))?;
                stats.get(slot).copied().unwrap_or_default() as f64
            }
            AggregateMetric::PerGroupConstant(values) | AggregateMetric::NamedLookup { values: Some(values), .. } => {
                values.get(group).copied().unwrap_or_default()
            }
            AggregateMetric::NamedLookup { values: None, .. } => return Err(missing_registration("NamedLookup")),
            AggregateMetric::Unary(op, m) => op.eval(m.apply(term, stats, group)?),
            AggregateMetric::Binary(op, l, r) => {
                let lv = l.apply(term, stats, group)?;
                op.eval(lv, r.apply(term, stats, group)?)
            }
            AggregateMetric::ParentLag { delay, metric, state } => {
                let value = metric.apply(term, stats, group)?;
                let key_set = state.key_set.clone().ok_or_else(|| missing_registration("ParentLag"))?;
                let current = term.to_term();
                if state.last_term.as_ref() != Some(&current) {
                    state.recent.clear();
                    state.last_term = Some(current);
                }
                let result = if *delay == 0 {
                    value
                } else if group > *delay {
                    let wanted = group - *delay;
                    state
                        .recent
                        .iter()
                        .find(|(g, _)| *g == wanted && key_set.parent_group(*g) == key_set.parent_group(group))
                        .map_or(0.0, |(_, v)| *v)
                } else {
                    0.0
                };
                state.recent.push_back((group, value));
                while state.recent.len() > *delay {
                    state.recent.pop_front();
                }
                result
            }
            AggregateMetric::IterateLag { delay, metric, state } => {
                let value = metric.apply(term, stats, group)?;
                let history = state.history.entry(group).or_default();
                let result = match history.front() {
                    _ if *delay == 0 => value,
                    Some(front) if history.len() == *delay => *front,
                    _ => 0.0,
                };
                history.push_back(value);
                while history.len() > *delay {
                    history.pop_front();
                }
                result
            }
            AggregateMetric::Running { metric, state } => {
                let value = metric.apply(term, stats, group)?;
                let sum = state.sums.entry(group).or_default();
                *sum += value;
                *sum
            }
            AggregateMetric::Window { size, metric, state } => {
                let value = metric.apply(term, stats, group)?;
                let history = state.history.entry(group).or_default();
                history.push_back(value);
                while history.len() > *size {
                    history.pop_front();
                }
                history.iter().sum()
            }
            AggregateMetric::IfThenElse(c, t, f) => {
                if c.allow(term, stats, group)? {
                    t.apply(term, stats, group)?
                } else {
                    f.apply(term, stats, group)?
                }
            }
        })
    }

    pub fn to_stat_tree(&self, atomic: &AtomicStats) -> Result<StatTree> {
        Ok(match self {
            AggregateMetric::Constant(v) => StatTree::Constant(*v),
            AggregateMetric::DocStats { push, .. } => atomic
                .get(push)
                .cloned()
                .ok_or_else(|| SquallError::Invariant(format!("no remote stat for {:?}", push)))?,
            AggregateMetric::PerGroupConstant(values) | AggregateMetric::NamedLookup { values: Some(values), .. } => {
                StatTree::PerGroupConstant(Arc::clone(values))
            }
            AggregateMetric::NamedLookup { values: None, .. } => return Err(missing_registration("NamedLookup")),
            AggregateMetric::Unary(op, m) => StatTree::unary(*op, m.to_stat_tree(atomic)?),
            AggregateMetric::Binary(op, l, r) => StatTree::binary(*op, l.to_stat_tree(atomic)?, r.to_stat_tree(atomic)?),
            AggregateMetric::IfThenElse(c, t, f) => StatTree::IfThenElse(
                Box::new(c.to_stat_tree(atomic)?),
                Box::new(t.to_stat_tree(atomic)?),
                Box::new(f.to_stat_tree(atomic)?),
            ),
            AggregateMetric::ParentLag { .. }
            | AggregateMetric::IterateLag { .. }
            | AggregateMetric::Running { .. }
            | AggregateMetric::Window { .. } => {
                return Err(SquallError::Unsupported("order-dependent metrics cannot be computed remotely".to_string()));
            }
        })
    }

    pub fn need_sorted(&self) -> bool {
        match self {
            AggregateMetric::Constant(_)
            | AggregateMetric::DocStats { .. }
            | AggregateMetric::PerGroupConstant(_)
            | AggregateMetric::NamedLookup { .. } => false,
            AggregateMetric::Unary(_, m) | AggregateMetric::ParentLag { metric: m, .. } => m.need_sorted(),
            AggregateMetric::IterateLag { .. } | AggregateMetric::Running { .. } | AggregateMetric::Window { .. } => true,
            AggregateMetric::Binary(_, l, r) => l.need_sorted() || r.need_sorted(),
            AggregateMetric::IfThenElse(c, t, f) => c.need_sorted() || t.need_sorted() || f.need_sorted(),
        }
    }

    pub fn need_group(&self) -> bool {
        match self {
            AggregateMetric::Constant(_) | AggregateMetric::DocStats { .. } => false,
            AggregateMetric::PerGroupConstant(_)
            | AggregateMetric::NamedLookup { .. }
            | AggregateMetric::ParentLag { .. }
            | AggregateMetric::IterateLag { .. }
            | AggregateMetric::Running { .. }
            | AggregateMetric::Window { .. } => true,
            AggregateMetric::Unary(_, m) => m.need_group(),
            AggregateMetric::Binary(_, l, r) => l.need_group() || r.need_group(),
            AggregateMetric::IfThenElse(c, t, f) => c.need_group() || t.need_group() || f.need_group(),
        }
    }

    pub fn need_stats(&self) -> bool {
        match self {
            AggregateMetric::Constant(_) | AggregateMetric::PerGroupConstant(_) | AggregateMetric::NamedLookup { .. } => false,
            AggregateMetric::DocStats { .. } => true,
            AggregateMetric::Unary(_, m)
            | AggregateMetric::ParentLag { metric: m, .. }
            | AggregateMetric::IterateLag { metric: m, .. }
            | AggregateMetric::Running { metric: m, .. }
            | AggregateMetric::Window { metric: m, .. } => m.need_stats(),
            AggregateMetric::Binary(_, l, r) => l.need_stats() || r.need_stats(),
            AggregateMetric::IfThenElse(c, t, f) => c.need_stats() || t.need_stats() || f.need_stats(),
        }
    }
}

// ------------- AggregateFilter -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equals,
    NotEquals,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparison {
    pub fn as_binary_op(self) -> BinaryOp {
        match self {
            Comparison::Equals => BinaryOp::Eq,
            Comparison::NotEquals => BinaryOp::Neq,
            Comparison::Gt => BinaryOp::Gt,
            Comparison::Gte => BinaryOp::Gte,
            Comparison::Lt => BinaryOp::Lt,
            Comparison::Lte => BinaryOp::Lte,
        }
    }
    fn eval(self, l: f64, r: f64) -> bool {
        self.as_binary_op().eval(l, r) != 0.0
    }
}

#[derive(Debug, Clone)]
pub enum AggregateFilter {
    Constant(bool),
    TermEquals(Term),
    TermRegex { pattern: String, regex: Regex },
    Compare(Comparison, Box<AggregateMetric>, Box<AggregateMetric>),
    Not(Box<AggregateFilter>),
    /// At least two children.
    And(Vec<AggregateFilter>),
    /// At least two children.
    Or(Vec<AggregateFilter>),
    IsDefaultGroup { key_set: Option<KeySetRef> },
}

impl AggregateFilter {
    pub fn term_regex(pattern: &str) -> Result<Self> {
        Ok(AggregateFilter::TermRegex { pattern: pattern.to_string(), regex: anchored(pattern)? })
    }
    pub fn compare(op: Comparison, l: AggregateMetric, r: AggregateMetric) -> Self {
        AggregateFilter::Compare(op, Box::new(l), Box::new(r))
    }
    pub fn negate(f: AggregateFilter) -> Self {
        AggregateFilter::Not(Box::new(f))
    }
    pub fn and(filters: Vec<AggregateFilter>) -> Result<Self> {
        Self::check_arity("And", &filters)?;
        Ok(AggregateFilter::And(filters))
    }
    pub fn or(filters: Vec<AggregateFilter>) -> Result<Self> {
        Self::check_arity("Or", &filters)?;
        Ok(AggregateFilter::Or(filters))
    }
    pub fn is_default_group() -> Self {
        AggregateFilter::IsDefaultGroup { key_set: None }
    }

    fn check_arity(name: &str, filters: &[AggregateFilter]) -> Result<()> {
        if filters.len() < 2 {
            return Err(SquallError::Invariant(format!("{} needs at least two filters, got {}", name, filters.len())));
        }
        Ok(())
    }

    pub fn requires(&self) -> HashSet<QualifiedPush> {
        let mut out = HashSet::new();
        self.collect_requires(&mut out);
        out
    }

    pub(crate) fn collect_requires(&self, out: &mut HashSet<QualifiedPush>) {
        match self {
            AggregateFilter::Constant(_)
            | AggregateFilter::TermEquals(_)
            | AggregateFilter::TermRegex { .. }
            | AggregateFilter::IsDefaultGroup { .. } => {}
            AggregateFilter::Compare(_, l, r) => {
                l.collect_requires(out);
                r.collect_requires(out);
            }
            AggregateFilter::Not(f) => f.collect_requires(out),
            AggregateFilter::And(fs) | AggregateFilter::Or(fs) => fs.iter().for_each(|f| f.collect_requires(out)),
        }
    }

    pub fn bind_lookups(&mut self, resolve: &mut dyn FnMut(&str) -> Result<Arc<Vec<f64>>>) -> Result<()> {
        match self {
            AggregateFilter::Compare(_, l, r) => {
                l.bind_lookups(resolve)?;
                r.bind_lookups(resolve)
            }
            AggregateFilter::Not(f) => f.bind_lookups(resolve),
            AggregateFilter::And(fs) | AggregateFilter::Or(fs) => fs.iter_mut().try_for_each(|f| f.bind_lookups(resolve)),
            _ => Ok(()),
        }
    }

    pub fn register(&mut self, metric_indexes: &MetricIndexes, key_set: &KeySetRef) -> Result<()> {
        match self {
            AggregateFilter::Constant(_) | AggregateFilter::TermEquals(_) | AggregateFilter::TermRegex { .. } => Ok(()),
            AggregateFilter::Compare(_, l, r) => {
                l.register(metric_indexes, key_set)?;
                r.register(metric_indexes, key_set)
            }
            AggregateFilter::Not(f) => f.register(metric_indexes, key_set),
            AggregateFilter::And(fs) | AggregateFilter::Or(fs) => {
                fs.iter_mut().try_for_each(|f| f.register(metric_indexes, key_set))
            }
            AggregateFilter::IsDefaultGroup { key_set: slot } => {
                *slot = Some(key_set.clone());
                Ok(())
            }
        }
    }

    /// One verdict per group `0..=num_groups`.
    pub fn get_group_stats(&mut self, stats: &[GroupStats], num_groups: usize) -> Result<Vec<bool>> {
        Ok(match self {
            AggregateFilter::Constant(b) => vec![*b; num_groups + 1],
            AggregateFilter::TermEquals(_) | AggregateFilter::TermRegex { .. } => {
                return Err(SquallError::Unsupported("term filters have no per-group value".to_string()));
            }
            AggregateFilter::Compare(op, l, r) => {
                let lhs = l.get_group_stats(stats, num_groups)?;
                let rhs = r.get_group_stats(stats, num_groups)?;
                lhs.into_iter().zip(rhs).map(|(l, r)| op.eval(l, r)).collect()
            }
            AggregateFilter::Not(f) => f.get_group_stats(stats, num_groups)?.into_iter().map(|b| !b).collect(),
            AggregateFilter::And(fs) => reduce_groups(fs, stats, num_groups, |a, b| a && b)?,
            AggregateFilter::Or(fs) => reduce_groups(fs, stats, num_groups, |a, b| a || b)?,
            AggregateFilter::IsDefaultGroup { key_set } => {
                let key_set = key_set.as_ref().ok_or_else(|| missing_registration("IsDefaultGroup"))?;
                (0..=num_groups).map(|g| g > 0 && key_set.group_key(g).is_default()).collect()
            }
        })
    }

    pub fn allow(&mut self, term: TermRef<'_>, stats: &[i64], group: usize) -> Result<bool> {
        Ok(match self {
            AggregateFilter::Constant(b) => *b,
            AggregateFilter::TermEquals(Term::Int(v)) => matches!(term, TermRef::Int(t) if t == *v),
            AggregateFilter::TermEquals(Term::Str(s)) => term.matches_string(s),
            AggregateFilter::TermRegex { regex, .. } => match term {
                TermRef::Int(v) => regex.is_match(&v.to_string()),
                TermRef::Str(s) => regex.is_match(s),
            },
            AggregateFilter::Compare(op, l, r) => {
                let lv = l.apply(term, stats, group)?;
                op.eval(lv, r.apply(term, stats, group)?)
            }
            AggregateFilter::Not(f) => !f.allow(term, stats, group)?,
            AggregateFilter::And(fs) => {
                let mut result = true;
                for f in fs.iter_mut() {
                    // every child sees the row so stateful metrics stay in step
                    result &= f.allow(term, stats, group)?;
                }
                result
            }
            AggregateFilter::Or(fs) => {
                let mut result = false;
                for f in fs.iter_mut() {
                    result |= f.allow(term, stats, group)?;
                }
                result
            }
            AggregateFilter::IsDefaultGroup { key_set } => {
                let key_set = key_set.as_ref().ok_or_else(|| missing_registration("IsDefaultGroup"))?;
                key_set.group_key(group).is_default()
            }
        })
    }

    pub fn to_stat_tree(&self, atomic: &AtomicStats) -> Result<StatTree> {
        Ok(match self {
            AggregateFilter::Constant(b) => StatTree::Constant(if *b { 1.0 } else { 0.0 }),
            AggregateFilter::TermEquals(Term::Int(v)) => StatTree::TermEqualsInt(*v),
            AggregateFilter::TermEquals(Term::Str(s)) => StatTree::TermEqualsString(s.clone()),
            AggregateFilter::TermRegex { pattern, .. } => StatTree::TermRegex(pattern.clone()),
            AggregateFilter::Compare(op, l, r) => {
                StatTree::binary(op.as_binary_op(), l.to_stat_tree(atomic)?, r.to_stat_tree(atomic)?)
            }
            AggregateFilter::Not(f) => StatTree::unary(UnaryOp::Not, f.to_stat_tree(atomic)?),
            AggregateFilter::And(fs) => fold_trees(fs, atomic, BinaryOp::And)?,
            AggregateFilter::Or(fs) => fold_trees(fs, atomic, BinaryOp::Or)?,
            AggregateFilter::IsDefaultGroup { key_set } => {
                let key_set = key_set.as_ref().ok_or_else(|| missing_registration("IsDefaultGroup"))?;
                let values = (0..=key_set.num_groups())
                    .map(|g| if g > 0 && key_set.group_key(g).is_default() { 1.0 } else { 0.0 })
                    .collect();
                StatTree::PerGroupConstant(Arc::new(values))
            }
        })
    }

    pub fn need_sorted(&self) -> bool {
        match self {
            AggregateFilter::Constant(_)
            | AggregateFilter::TermEquals(_)
            | AggregateFilter::TermRegex { .. }
            | AggregateFilter::IsDefaultGroup { .. } => false,
            AggregateFilter::Compare(_, l, r) => l.need_sorted() || r.need_sorted(),
            AggregateFilter::Not(f) => f.need_sorted(),
            AggregateFilter::And(fs) | AggregateFilter::Or(fs) => fs.iter().any(AggregateFilter::need_sorted),
        }
    }

    pub fn need_group(&self) -> bool {
        match self {
            AggregateFilter::Constant(_) | AggregateFilter::TermEquals(_) | AggregateFilter::TermRegex { .. } => false,
            AggregateFilter::IsDefaultGroup { .. } => true,
            AggregateFilter::Compare(_, l, r) => l.need_group() || r.need_group(),
            AggregateFilter::Not(f) => f.need_group(),
            AggregateFilter::And(fs) | AggregateFilter::Or(fs) => fs.iter().any(AggregateFilter::need_group),
        }
    }

    pub fn need_stats(&self) -> bool {
        match self {
            AggregateFilter::Constant(_)
            | AggregateFilter::TermEquals(_)
            | AggregateFilter::TermRegex { .. }
            | AggregateFilter::IsDefaultGroup { .. } => false,
            AggregateFilter::Compare(_, l, r) => l.need_stats() || r.need_stats(),
            AggregateFilter::Not(f) => f.need_stats(),
            AggregateFilter::And(fs) | AggregateFilter::Or(fs) => fs.iter().any(AggregateFilter::need_stats),
        }
    }
}

fn reduce_groups(
    filters: &mut [AggregateFilter],
    stats: &[GroupStats],
    num_groups: usize,
    combine: impl Fn(bool, bool) -> bool,
) -> Result<Vec<bool>> {
    let mut result: Option<Vec<bool>> = None;
    for f in filters.iter_mut() {
        let values = f.get_group_stats(stats, num_groups)?;
        result = Some(match result {
            None => values,
            Some(acc) => acc.into_iter().zip(values).map(|(a, b)| combine(a, b)).collect(),
        });
    }
    Ok(result.unwrap_or_else(|| vec![false; num_groups + 1]))
}

fn fold_trees(filters: &[AggregateFilter], atomic: &AtomicStats, op: BinaryOp) -> Result<StatTree> {
    let mut trees = filters.iter().map(|f| f.to_stat_tree(atomic));
    let first = trees
        .next()
        .ok_or_else(|| SquallError::Invariant("boolean combinator without children".to_string()))??;
    trees.try_fold(first, |acc, tree| Ok(StatTree::binary(op, acc, tree?)))
}
