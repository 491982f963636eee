//! An in-process implementation of [`RemoteSession`] over a vector of documents.
//!
//! Every document carries its current group and the session keeps a stack of
//! per-document stat columns built from push tokens. It is meant for tests and
//! demos: everything is recomputed on each call, nothing is indexed.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use crate::error::{Result, SquallError};
use crate::remote::{
    anchored, FtgsIterator, FtgsParams, GroupMultiRemapRule, GroupStats, PerformanceStats, Query,
    QueryRemapRule, RegroupCondition, RemoteSession, Term, FAKE_FIELD,
};
use crate::session::{DatasetRequest, OpenedSession, SessionOpener};

lazy_static! {
    static ref INT_LITERAL: Regex = Regex::new(r"^-?[0-9]+$").expect("literal pattern");
}

pub const DEFAULT_TIME_FIELD: &str = "unixtime";
const MILLIS_PER_DAY: i64 = 86_400_000;

// ------------- Document -------------
#[derive(Debug, Clone, Default)]
pub struct Document {
    /// Epoch millis.
    pub timestamp: i64,
    pub int_fields: HashMap<String, Vec<i64>>,
    pub string_fields: HashMap<String, Vec<String>>,
}

impl Document {
    pub fn builder(timestamp: i64) -> DocumentBuilder {
        DocumentBuilder { doc: Document { timestamp, ..Default::default() } }
    }
    fn ints(&self, field: &str) -> &[i64] {
        self.int_fields.get(field).map(Vec::as_slice).unwrap_or_default()
    }
    fn strings(&self, field: &str) -> &[String] {
        self.string_fields.get(field).map(Vec::as_slice).unwrap_or_default()
    }
}

pub struct DocumentBuilder {
    doc: Document,
}

impl DocumentBuilder {
    pub fn int(mut self, field: &str, value: i64) -> Self {
        self.doc.int_fields.entry(field.to_string()).or_default().push(value);
        self
    }
    pub fn string(mut self, field: &str, value: &str) -> Self {
        self.doc.string_fields.entry(field.to_string()).or_default().push(value.to_string());
        self
    }
    pub fn build(self) -> Document {
        self.doc
    }
}

// ------------- Dataset -------------
/// Documents of one dataset. Shards are whole UTC days.
#[derive(Debug, Clone)]
pub struct MemoryDataset {
    docs: Arc<Vec<Document>>,
    int_fields: BTreeSet<String>,
    string_fields: BTreeSet<String>,
    time_field: String,
    ftgs_failure_after_terms: Option<usize>,
}

impl MemoryDataset {
    pub fn new(docs: Vec<Document>) -> Self {
        let mut int_fields = BTreeSet::new();
        let mut string_fields = BTreeSet::new();
        for doc in &docs {
            int_fields.extend(doc.int_fields.keys().cloned());
            string_fields.extend(doc.string_fields.keys().cloned());
        }
        int_fields.insert(DEFAULT_TIME_FIELD.to_string());
        Self { docs: Arc::new(docs), int_fields, string_fields, time_field: DEFAULT_TIME_FIELD.to_string(), ftgs_failure_after_terms: None }
    }

    /// Declares a field known to the schema even when no document has it.
    pub fn with_int_field(mut self, field: &str) -> Self {
        self.int_fields.insert(field.to_string());
        self
    }
    pub fn with_string_field(mut self, field: &str) -> Self {
        self.string_fields.insert(field.to_string());
        self
    }
    /// FTGS iterators of this dataset fail once this many terms were read.
    pub fn with_ftgs_failure_after(mut self, terms: usize) -> Self {
        self.ftgs_failure_after_terms = Some(terms);
        self
    }

    /// The documents of every day shard intersecting `[start, end)`.
    fn overlapping_shards(&self, start: i64, end: i64) -> MemoryDataset {
        let docs: Vec<Document> = self
            .docs
            .iter()
            .filter(|d| {
                let day = d.timestamp.div_euclid(MILLIS_PER_DAY) * MILLIS_PER_DAY;
                day < end && day + MILLIS_PER_DAY > start
            })
            .cloned()
            .collect();
        MemoryDataset { docs: Arc::new(docs), ..self.clone() }
    }

    fn shard_range(&self) -> Option<(i64, i64)> {
        let min = self.docs.iter().map(|d| d.timestamp).min()?;
        let max = self.docs.iter().map(|d| d.timestamp).max()?;
        Some((min.div_euclid(MILLIS_PER_DAY) * MILLIS_PER_DAY, (max.div_euclid(MILLIS_PER_DAY) + 1) * MILLIS_PER_DAY))
    }
}

/// Counters shared between a session and whoever opened it.
#[derive(Debug, Default)]
pub struct MemoryCounters {
    pub open_iterators: AtomicUsize,
    pub iterators_opened: AtomicUsize,
    pub sessions_closed: AtomicUsize,
    pub regroups: AtomicUsize,
}

impl MemoryCounters {
    pub fn open_iterators(&self) -> usize {
        self.open_iterators.load(Ordering::SeqCst)
    }
    pub fn sessions_closed(&self) -> usize {
        self.sessions_closed.load(Ordering::SeqCst)
    }
}

/// Opens [`MemorySession`]s by dataset name.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    datasets: HashMap<String, MemoryDataset>,
    counters: Arc<MemoryCounters>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn add_dataset(&mut self, name: &str, dataset: MemoryDataset) {
        self.datasets.insert(name.to_string(), dataset);
    }
    pub fn counters(&self) -> Arc<MemoryCounters> {
        Arc::clone(&self.counters)
    }
}

impl SessionOpener for MemoryEngine {
    fn open(&mut self, request: &DatasetRequest) -> Result<OpenedSession> {
        let dataset = self
            .datasets
            .get(&request.dataset)
            .ok_or_else(|| SquallError::remote(&request.dataset, "unknown dataset"))?;
        // only shards overlapping the requested window are opened
        let dataset = dataset.overlapping_shards(request.start, request.end);
        let shard_range = dataset.shard_range();
        debug!(dataset = %request.dataset, docs = dataset.docs.len(), ?shard_range, "opening memory session");
        Ok(OpenedSession {
            session: Box::new(MemorySession::new(dataset.clone(), Arc::clone(&self.counters))),
            int_fields: dataset.int_fields.iter().cloned().collect(),
            string_fields: dataset.string_fields.iter().cloned().collect(),
            time_field: dataset.time_field.clone(),
            shard_range,
        })
    }
}

// ------------- Session -------------
pub struct MemorySession {
    dataset: MemoryDataset,
    groups: Vec<usize>,
    stats: Vec<Vec<i64>>,
    counters: Arc<MemoryCounters>,
    performance: PerformanceStats,
    closed: bool,
}

impl MemorySession {
    pub fn new(dataset: MemoryDataset, counters: Arc<MemoryCounters>) -> Self {
        let groups = vec![1; dataset.docs.len()];
        Self { dataset, groups, stats: Vec::new(), counters, performance: PerformanceStats::default(), closed: false }
    }

    /// Current group of every document, in insertion order.
    pub fn groups(&self) -> &[usize] {
        &self.groups
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(SquallError::remote("memory", "session already closed"));
        }
        Ok(())
    }

    fn stat(&self, index: usize) -> Result<&Vec<i64>> {
        self.stats.get(index).ok_or_else(|| SquallError::remote("memory", format!("no stat at index {}", index)))
    }

    fn regrouped(&mut self) -> usize {
        self.counters.regroups.fetch_add(1, Ordering::SeqCst);
        self.performance.regroups += 1;
        self.num_groups()
    }

    fn is_int_field(&self, field: &str) -> bool {
        self.dataset.int_fields.contains(field)
    }

    fn doc_terms(&self, doc: &Document, field: &str) -> Vec<Term> {
        if field == self.dataset.time_field {
            return vec![Term::Int(doc.timestamp.div_euclid(1000))];
        }
        if self.is_int_field(field) {
            doc.ints(field).iter().map(|v| Term::Int(*v)).collect()
        } else {
            doc.strings(field).iter().map(|s| Term::Str(s.clone())).collect()
        }
    }

    fn int_value(&self, doc: &Document, field: &str) -> i64 {
        if field == self.dataset.time_field {
            return doc.timestamp.div_euclid(1000);
        }
        doc.ints(field).first().copied().unwrap_or_default()
    }

    fn condition_matches(&self, doc: &Document, condition: &RegroupCondition) -> bool {
        if condition.field == FAKE_FIELD {
            return false;
        }
        self.doc_terms(doc, &condition.field).iter().any(|t| match (t, &condition.term) {
            (Term::Int(v), Term::Int(c)) => if condition.inequality { v <= c } else { v == c },
            (Term::Str(v), Term::Str(c)) => if condition.inequality { v <= c } else { v == c },
            _ => false,
        })
    }

    fn query_matches(&self, doc: &Document, query: &Query) -> bool {
        match query {
            Query::Term { field, term } => field != FAKE_FIELD && self.doc_terms(doc, field).iter().any(|t| t.as_string() == term.as_string()),
            Query::Range { field, lower, upper, upper_inclusive } => self.doc_terms(doc, field).iter().any(|t| match (t, lower, upper) {
                (Term::Int(v), Term::Int(lo), Term::Int(hi)) => v >= lo && (v < hi || (*upper_inclusive && v == hi)),
                (t, lo, hi) => {
                    let v = t.as_string();
                    let (lo, hi) = (lo.as_string(), hi.as_string());
                    v >= lo && (v < hi || (*upper_inclusive && v == hi))
                }
            }),
            Query::And(queries) => queries.iter().all(|q| self.query_matches(doc, q)),
            Query::Or(queries) => queries.iter().any(|q| self.query_matches(doc, q)),
            Query::Not(q) => !self.query_matches(doc, q),
        }
    }

    /// Routes documents of `target` to `positive` when `predicate` holds,
    /// else to `negative`. Other groups are untouched.
    fn split_target(&mut self, target: usize, negative: usize, positive: usize, predicate: impl Fn(&Self, usize, &Document) -> bool) -> usize {
        let docs = Arc::clone(&self.dataset.docs);
        for (i, doc) in docs.iter().enumerate() {
            if self.groups[i] == target {
                self.groups[i] = if predicate(self, i, doc) { positive } else { negative };
            }
        }
        self.regrouped()
    }

    fn unary(&mut self, f: impl Fn(i64) -> i64) -> Result<()> {
        let top = self.stats.last_mut().ok_or_else(|| SquallError::parse("unary operator on empty stack"))?;
        top.iter_mut().for_each(|v| *v = f(*v));
        Ok(())
    }

    fn binary(&mut self, f: impl Fn(i64, i64) -> i64) -> Result<()> {
        let right = self.stats.pop().ok_or_else(|| SquallError::parse("binary operator on empty stack"))?;
        let left = self.stats.last_mut().ok_or_else(|| SquallError::parse("binary operator needs two operands"))?;
        left.iter_mut().zip(right).for_each(|(l, r)| *l = f(*l, r));
        Ok(())
    }

    fn column(&self, f: impl Fn(usize, &Document) -> i64) -> Vec<i64> {
        self.dataset.docs.iter().enumerate().map(|(i, d)| f(i, d)).collect()
    }

    fn materialize(&self, fields: Vec<(String, bool)>, params: FtgsParams, subset: Option<&HashMap<String, HashSet<String>>>) -> MemoryFtgs {
        let mut out = Vec::new();
        for (field, is_int) in fields {
            let allowed = subset.and_then(|s| s.get(&field));
            let mut terms: BTreeMap<TermKey, BTreeMap<usize, Vec<i64>>> = BTreeMap::new();
            for (i, doc) in self.dataset.docs.iter().enumerate() {
                let group = self.groups[i];
                if group == 0 {
                    continue;
                }
                let mut seen = HashSet::new();
                for term in self.doc_terms(doc, &field) {
                    if !seen.insert(term.clone()) || allowed.is_some_and(|a| !a.contains(&term.as_string())) {
                        continue;
                    }
                    let stats = terms.entry(TermKey::from(term)).or_default().entry(group).or_insert_with(|| vec![0; self.stats.len()]);
                    for (slot, column) in stats.iter_mut().zip(&self.stats) {
                        *slot += column[i];
                    }
                }
            }
            if params.term_limit > 0 {
                terms = limit_terms(terms, params);
            }
            out.push(FieldTerms { field, is_int, terms: terms.into_iter().map(|(k, g)| (k, g.into_iter().collect())).collect() });
        }
        MemoryFtgs::new(out, self.stats.len(), self.dataset.ftgs_failure_after_terms, Arc::clone(&self.counters))
    }
}

fn limit_terms(terms: BTreeMap<TermKey, BTreeMap<usize, Vec<i64>>>, params: FtgsParams) -> BTreeMap<TermKey, BTreeMap<usize, Vec<i64>>> {
    match params.sort_stat {
        None => terms.into_iter().take(params.term_limit).collect(),
        Some(stat) => {
            // top terms by stat descending per group, ties broken by term
            let mut per_group: BTreeMap<usize, Vec<(i64, TermKey)>> = BTreeMap::new();
            for (term, groups) in &terms {
                for (group, stats) in groups {
                    per_group.entry(*group).or_default().push((stats.get(stat).copied().unwrap_or_default(), term.clone()));
                }
            }
            let mut keep: HashSet<(TermKey, usize)> = HashSet::new();
            for (group, mut candidates) in per_group {
                candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
                keep.extend(candidates.into_iter().take(params.term_limit).map(|(_, t)| (t, group)));
            }
            terms
                .into_iter()
                .filter_map(|(term, groups)| {
                    let groups: BTreeMap<_, _> = groups.into_iter().filter(|(g, _)| keep.contains(&(term.clone(), *g))).collect();
                    (!groups.is_empty()).then_some((term, groups))
                })
                .collect()
        }
    }
}

impl RemoteSession for MemorySession {
    fn push_stat(&mut self, token: &str) -> Result<usize> {
        self.check_open()?;
        let token = token.trim();
        let (head, rest) = token.split_once(' ').unwrap_or((token, ""));
        match head {
            "count()" => self.stats.push(self.column(|_, _| 1)),
            "docId()" => self.stats.push(self.column(|i, _| i as i64)),
            "+" => self.binary(|l, r| l.wrapping_add(r))?,
            "-" => self.binary(|l, r| l.wrapping_sub(r))?,
            "*" => self.binary(|l, r| l.wrapping_mul(r))?,
            "/" => self.binary(|l, r| if r == 0 { 0 } else { l.wrapping_div(r) })?,
            "%" => self.binary(|l, r| if r == 0 { 0 } else { l.wrapping_rem(r) })?,
            "min()" => self.binary(i64::min)?,
            "max()" => self.binary(i64::max)?,
            "=" => self.binary(|l, r| i64::from(l == r))?,
            "!=" => self.binary(|l, r| i64::from(l != r))?,
            "<" => self.binary(|l, r| i64::from(l < r))?,
            "<=" => self.binary(|l, r| i64::from(l <= r))?,
            ">" => self.binary(|l, r| i64::from(l > r))?,
            ">=" => self.binary(|l, r| i64::from(l >= r))?,
            "abs()" => self.unary(i64::wrapping_abs)?,
            "log" => {
                let scale: f64 = rest.parse().map_err(|_| SquallError::parse(format!("bad log scale: {}", token)))?;
                self.unary(|v| if v > 0 { ((v as f64).ln() * scale) as i64 } else { 0 })?
            }
            "hasint" | "hasstr" => {
                let (field, term) = rest.split_once(':').ok_or_else(|| SquallError::parse(format!("expected field:term in {}", token)))?;
                let column = self.column(|_, d| i64::from(self.doc_terms(d, field).iter().any(|t| t.as_string() == term)));
                self.stats.push(column)
            }
            "hasintfield" => self.stats.push(self.column(|_, d| i64::from(!d.ints(rest).is_empty()))),
            "hasstrfield" => self.stats.push(self.column(|_, d| i64::from(!d.strings(rest).is_empty()))),
            "regex" => {
                let (field, pattern) = rest.split_once(':').ok_or_else(|| SquallError::parse(format!("expected field:regex in {}", token)))?;
                let re = anchored(pattern)?;
                self.stats.push(self.column(|_, d| i64::from(d.strings(field).iter().any(|s| re.is_match(s)))))
            }
            "len" => self.stats.push(self.column(|_, d| d.strings(rest).first().map_or(0, |s| s.chars().count() as i64))),
            literal if INT_LITERAL.is_match(literal) => {
                let value: i64 = literal.parse().map_err(|_| SquallError::parse(format!("bad constant: {}", literal)))?;
                self.stats.push(self.column(|_, _| value))
            }
            field if rest.is_empty() && self.is_int_field(field) => {
                let column = self.column(|_, d| self.int_value(d, field));
                self.stats.push(column)
            }
            _ => return Err(SquallError::parse(format!("unknown push token: {}", token))),
        }
        Ok(self.stats.len())
    }

    fn pop_stat(&mut self) -> Result<usize> {
        self.stats.pop().ok_or_else(|| SquallError::remote("memory", "pop on empty stat stack"))?;
        Ok(self.stats.len())
    }

    fn num_stats(&self) -> usize {
        self.stats.len()
    }

    fn metric_regroup(&mut self, stat: usize, min: i64, max: i64, interval: i64, no_gutters: bool) -> Result<usize> {
        self.check_open()?;
        if interval <= 0 || max <= min {
            return Err(SquallError::remote("memory", format!("bad metric regroup range [{}, {}) / {}", min, max, interval)));
        }
        let buckets = ((max - 1 - min) / interval + 1) as usize;
        let per_parent = if no_gutters { buckets } else { buckets + 2 };
        let values = self.stat(stat)?.clone();
        for (group, value) in self.groups.iter_mut().zip(values) {
            if *group == 0 {
                continue;
            }
            let inner = if value < min {
                (!no_gutters).then_some(buckets)
            } else if value >= max {
                (!no_gutters).then_some(buckets + 1)
            } else {
                Some(((value - min) / interval) as usize)
            };
            *group = inner.map_or(0, |inner| (*group - 1) * per_parent + inner + 1);
        }
        Ok(self.regrouped())
    }

    fn metric_filter(&mut self, stat: usize, min: i64, max: i64, target: usize, negative: usize, positive: usize) -> Result<usize> {
        self.check_open()?;
        let values = self.stat(stat)?.clone();
        Ok(self.split_target(target, negative, positive, |_, i, _| (min..=max).contains(&values[i])))
    }

    fn remap(&mut self, from: &[usize], to: &[usize], filter_untargeted: bool) -> Result<usize> {
        self.check_open()?;
        let mapping: HashMap<usize, usize> = from.iter().copied().zip(to.iter().copied()).collect();
        for group in self.groups.iter_mut() {
            match mapping.get(group) {
                Some(to) => *group = *to,
                None if filter_untargeted => *group = 0,
                None => {}
            }
        }
        Ok(self.regrouped())
    }

    fn regroup_rules(&mut self, rules: &[GroupMultiRemapRule], error_on_collisions: bool) -> Result<usize> {
        self.check_open()?;
        let mut by_target: HashMap<usize, &GroupMultiRemapRule> = HashMap::new();
        for rule in rules {
            if by_target.insert(rule.target, rule).is_some() && error_on_collisions {
                return Err(SquallError::remote("memory", format!("two rules target group {}", rule.target)));
            }
        }
        let docs = Arc::clone(&self.dataset.docs);
        for (i, doc) in docs.iter().enumerate() {
            let group = self.groups[i];
            self.groups[i] = match by_target.get(&group) {
                None => 0,
                Some(rule) => rule
                    .conditions
                    .iter()
                    .position(|c| self.condition_matches(doc, c))
                    .and_then(|p| rule.positive.get(p).copied())
                    .unwrap_or(rule.negative),
            };
        }
        Ok(self.regrouped())
    }

    fn query_regroup(&mut self, rule: &QueryRemapRule) -> Result<usize> {
        self.check_open()?;
        Ok(self.split_target(rule.target, rule.negative, rule.positive, |s, _, d| s.query_matches(d, &rule.query)))
    }

    fn int_or_regroup(&mut self, field: &str, terms: &[i64], target: usize, negative: usize, positive: usize) -> Result<()> {
        self.check_open()?;
        let terms: HashSet<i64> = terms.iter().copied().collect();
        self.split_target(target, negative, positive, |s, _, d| {
            s.doc_terms(d, field).iter().any(|t| matches!(t, Term::Int(v) if terms.contains(v)))
        });
        Ok(())
    }

    fn string_or_regroup(&mut self, field: &str, terms: &[String], target: usize, negative: usize, positive: usize) -> Result<()> {
        self.check_open()?;
        let terms: HashSet<&str> = terms.iter().map(String::as_str).collect();
        self.split_target(target, negative, positive, |s, _, d| {
            s.doc_terms(d, field).iter().any(|t| terms.contains(t.as_string().as_str()))
        });
        Ok(())
    }

    fn regex_regroup(&mut self, field: &str, regex: &str, target: usize, negative: usize, positive: usize) -> Result<()> {
        self.check_open()?;
        let re = anchored(regex)?;
        self.split_target(target, negative, positive, |s, _, d| s.doc_terms(d, field).iter().any(|t| re.is_match(&t.as_string())));
        Ok(())
    }

    fn random_regroup(&mut self, field: &str, _is_int: bool, salt: &str, probability: f64, target: usize, negative: usize, positive: usize) -> Result<()> {
        self.check_open()?;
        self.split_target(target, negative, positive, |s, _, d| {
            s.doc_terms(d, field).first().is_some_and(|t| {
                let hash = seahash::hash(format!("{}{}", t.as_string(), salt).as_bytes());
                (hash as f64 / u64::MAX as f64) < probability
            })
        });
        Ok(())
    }

    fn get_group_stats(&mut self, stat: usize) -> Result<GroupStats> {
        self.check_open()?;
        let column = self.stat(stat)?;
        let mut out = vec![0i64; self.num_groups() + 1];
        for (group, value) in self.groups.iter().zip(column) {
            out[*group] += value;
        }
        out[0] = 0;
        Ok(out)
    }

    fn get_ftgs_iterator(&mut self, int_fields: &[String], string_fields: &[String], params: FtgsParams) -> Result<Box<dyn FtgsIterator>> {
        self.check_open()?;
        let fields = int_fields.iter().map(|f| (f.clone(), true)).chain(string_fields.iter().map(|f| (f.clone(), false))).collect();
        self.performance.ftgs_iterators_opened += 1;
        Ok(Box::new(self.materialize(fields, params, None)))
    }

    fn get_subset_ftgs_iterator(&mut self, int_terms: &HashMap<String, Vec<i64>>, string_terms: &HashMap<String, Vec<String>>) -> Result<Box<dyn FtgsIterator>> {
        self.check_open()?;
        let mut subset: HashMap<String, HashSet<String>> = HashMap::new();
        let mut fields = Vec::new();
        for (field, terms) in int_terms {
            subset.insert(field.clone(), terms.iter().map(|t| t.to_string()).collect());
            fields.push((field.clone(), true));
        }
        for (field, terms) in string_terms {
            subset.insert(field.clone(), terms.iter().cloned().collect());
            fields.push((field.clone(), false));
        }
        fields.sort();
        self.performance.ftgs_iterators_opened += 1;
        Ok(Box::new(self.materialize(fields, FtgsParams::unlimited(true), Some(&subset))))
    }

    fn get_distinct(&mut self, field: &str, _is_int: bool) -> Result<Box<dyn Iterator<Item = i64>>> {
        self.check_open()?;
        let mut distinct: Vec<HashSet<String>> = vec![HashSet::new(); self.num_groups() + 1];
        for (i, doc) in self.dataset.docs.iter().enumerate() {
            let group = self.groups[i];
            if group > 0 {
                distinct[group].extend(self.doc_terms(doc, field).iter().map(Term::as_string));
            }
        }
        let counts: Vec<i64> = distinct.into_iter().map(|s| s.len() as i64).collect();
        Ok(Box::new(counts.into_iter()))
    }

    fn num_groups(&self) -> usize {
        self.groups.iter().copied().max().unwrap_or_default()
    }

    fn close_and_get_performance_stats(&mut self) -> Result<PerformanceStats> {
        if !self.closed {
            self.closed = true;
            self.stats.clear();
            self.counters.sessions_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(self.performance.clone())
    }
}

// ------------- FTGS -------------
/// Int terms order numerically and before string terms.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum TermKey {
    Int(i64),
    Str(String),
}

impl From<Term> for TermKey {
    fn from(term: Term) -> Self {
        match term {
            Term::Int(v) => TermKey::Int(v),
            Term::Str(s) => TermKey::Str(s),
        }
    }
}

struct FieldTerms {
    field: String,
    is_int: bool,
    terms: Vec<(TermKey, Vec<(usize, Vec<i64>)>)>,
}

pub struct MemoryFtgs {
    fields: Vec<FieldTerms>,
    num_stats: usize,
    field: Option<usize>,
    term: Option<usize>,
    group: Option<usize>,
    terms_read: usize,
    fail_after: Option<usize>,
    counters: Arc<MemoryCounters>,
}

impl MemoryFtgs {
    fn new(fields: Vec<FieldTerms>, num_stats: usize, fail_after: Option<usize>, counters: Arc<MemoryCounters>) -> Self {
        counters.open_iterators.fetch_add(1, Ordering::SeqCst);
        counters.iterators_opened.fetch_add(1, Ordering::SeqCst);
        Self { fields, num_stats, field: None, term: None, group: None, terms_read: 0, fail_after, counters }
    }

    fn current_field(&self) -> Option<&FieldTerms> {
        self.field.and_then(|f| self.fields.get(f))
    }

    fn current_term(&self) -> Option<&(TermKey, Vec<(usize, Vec<i64>)>)> {
        let field = self.current_field()?;
        self.term.and_then(|t| field.terms.get(t))
    }
}

impl Drop for MemoryFtgs {
    fn drop(&mut self) {
        self.counters.open_iterators.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FtgsIterator for MemoryFtgs {
    fn next_field(&mut self) -> Result<bool> {
        let next = self.field.map_or(0, |f| f + 1);
        self.field = Some(next);
        self.term = None;
        self.group = None;
        Ok(next < self.fields.len())
    }
    fn field_name(&self) -> &str {
        self.current_field().map(|f| f.field.as_str()).unwrap_or_default()
    }
    fn field_is_int_type(&self) -> bool {
        self.current_field().is_some_and(|f| f.is_int)
    }
    fn next_term(&mut self) -> Result<bool> {
        if self.fail_after.is_some_and(|limit| self.terms_read >= limit) {
            return Err(SquallError::remote("memory", "ftgs stream broken"));
        }
        let Some(field) = self.current_field() else { return Ok(false) };
        let next = self.term.map_or(0, |t| t + 1);
        let has = next < field.terms.len();
        self.term = Some(next);
        self.group = None;
        if has {
            self.terms_read += 1;
        }
        Ok(has)
    }
    fn term_int_val(&self) -> i64 {
        match self.current_term() {
            Some((TermKey::Int(v), _)) => *v,
            _ => 0,
        }
    }
    fn term_string_val(&self) -> &str {
        match self.current_term() {
            Some((TermKey::Str(s), _)) => s,
            _ => "",
        }
    }
    fn next_group(&mut self) -> Result<bool> {
        let Some((_, groups)) = self.current_term() else { return Ok(false) };
        let next = self.group.map_or(0, |g| g + 1);
        let has = next < groups.len();
        self.group = Some(next);
        Ok(has)
    }
    fn group(&self) -> usize {
        match (self.current_term(), self.group) {
            (Some((_, groups)), Some(g)) => groups.get(g).map_or(0, |(group, _)| *group),
            _ => 0,
        }
    }
    fn group_stats(&self, buffer: &mut [i64]) {
        if let (Some((_, groups)), Some(g)) = (self.current_term(), self.group) {
            if let Some((_, stats)) = groups.get(g) {
                for (slot, value) in buffer.iter_mut().zip(stats) {
                    *slot = *value;
                }
            }
        }
    }
    fn num_stats(&self) -> usize {
        self.num_stats
    }
}
