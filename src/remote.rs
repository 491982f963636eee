//! The interface the engine needs from a remote, per-dataset analytic session.
//!
//! Everything here is a collaborator contract: the engine only drives these
//! calls, it never implements the remote side (see [`crate::memory`] for an
//! in-process implementation). All calls are blocking round trips.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Per-group statistic values, 1-indexed, index 0 unused.
pub type GroupStats = Vec<i64>;

// ------------- Terms -------------
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Term {
    Int(i64),
    Str(String),
}

impl Term {
    pub fn is_int(&self) -> bool {
        matches!(self, Term::Int(_))
    }
    pub fn as_string(&self) -> String {
        match self {
            Term::Int(v) => v.to_string(),
            Term::Str(s) => s.clone(),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

// ------------- Regroup rules -------------
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegroupCondition {
    pub field: String,
    pub term: Term,
    /// When set, matches documents whose term is `<=` the condition's term.
    pub inequality: bool,
}

/// Documents in `target` go to the positive group of the first matching
/// condition, otherwise to `negative`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMultiRemapRule {
    pub target: usize,
    pub negative: usize,
    pub positive: Vec<usize>,
    pub conditions: Vec<RegroupCondition>,
}

impl GroupMultiRemapRule {
    /// A rule whose only condition names a field no document has, so
    /// everything in `target` lands in `negative`.
    pub fn unconditional(target: usize, to: usize) -> Self {
        Self {
            target,
            negative: to,
            positive: vec![to],
            conditions: vec![RegroupCondition { field: FAKE_FIELD.to_string(), term: Term::Int(0), inequality: false }],
        }
    }
}

pub const FAKE_FIELD: &str = "fakeField";

/// A rule set serialized once, replayable on any number of sessions.
#[derive(Debug, Clone)]
pub struct MarshaledRules {
    bytes: Arc<Vec<u8>>,
    num_rules: usize,
}

impl MarshaledRules {
    pub fn marshal(rules: &[GroupMultiRemapRule]) -> Result<Self> {
        Ok(Self { bytes: Arc::new(serde_json::to_vec(rules)?), num_rules: rules.len() })
    }
    pub fn unmarshal(&self) -> Result<Vec<GroupMultiRemapRule>> {
        Ok(serde_json::from_slice(&self.bytes)?)
    }
    pub fn len(&self) -> usize {
        self.num_rules
    }
    pub fn is_empty(&self) -> bool {
        self.num_rules == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Query {
    Term { field: String, term: Term },
    /// `[lower, upper)` over an int field, or lexicographic over a string field.
    Range { field: String, lower: Term, upper: Term, upper_inclusive: bool },
    And(Vec<Query>),
    Or(Vec<Query>),
    Not(Box<Query>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRemapRule {
    pub target: usize,
    pub query: Query,
    pub negative: usize,
    pub positive: usize,
}

// ------------- FTGS -------------
/// Options for a full FTGS iterator. `term_limit == 0` means no limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FtgsParams {
    pub term_limit: usize,
    pub sort_stat: Option<usize>,
    pub sorted: bool,
}

impl FtgsParams {
    pub fn unlimited(sorted: bool) -> Self {
        Self { term_limit: 0, sort_stat: None, sorted }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteTopKParams {
    pub limit: usize,
    pub sort_stat: usize,
}

/// Field/Term/Group/Stats iteration over one or more fields.
///
/// Single pass: fields in request order, terms ascending within a field,
/// groups ascending within a term. Dropping the iterator releases it.
pub trait FtgsIterator {
    fn next_field(&mut self) -> Result<bool>;
    fn field_name(&self) -> &str;
    fn field_is_int_type(&self) -> bool;
    fn next_term(&mut self) -> Result<bool>;
    fn term_int_val(&self) -> i64;
    fn term_string_val(&self) -> &str;
    fn next_group(&mut self) -> Result<bool>;
    fn group(&self) -> usize;
    /// Copies the current group's stats into the front of `buffer`.
    fn group_stats(&self, buffer: &mut [i64]);
    fn num_stats(&self) -> usize;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PerformanceStats {
    pub cpu_millis: u64,
    pub temp_file_bytes_written: u64,
    pub ftgs_iterators_opened: u64,
    pub regroups: u64,
}

// ------------- Session -------------
pub trait RemoteSession {
    /// Pushes one token; returns the number of stats now on the stack.
    fn push_stat(&mut self, token: &str) -> Result<usize>;
    fn push_stats(&mut self, tokens: &[String]) -> Result<usize> {
        let mut count = self.num_stats();
        for token in tokens {
            count = self.push_stat(token)?;
        }
        Ok(count)
    }
    fn pop_stat(&mut self) -> Result<usize>;
    fn num_stats(&self) -> usize;

    /// Buckets each group by the value of `stat` into `(max - min) / interval`
    /// ranges, plus two gutters unless `no_gutters`.
    fn metric_regroup(&mut self, stat: usize, min: i64, max: i64, interval: i64, no_gutters: bool) -> Result<usize>;
    /// Keeps documents of `target` whose `stat` lies in `[min, max]` in `positive`, the rest go to `negative`.
    fn metric_filter(&mut self, stat: usize, min: i64, max: i64, target: usize, negative: usize, positive: usize) -> Result<usize>;
    fn remap(&mut self, from: &[usize], to: &[usize], filter_untargeted: bool) -> Result<usize>;
    fn regroup_rules(&mut self, rules: &[GroupMultiRemapRule], error_on_collisions: bool) -> Result<usize>;
    fn regroup_marshaled(&mut self, rules: &MarshaledRules, error_on_collisions: bool) -> Result<usize> {
        let rules = rules.unmarshal()?;
        self.regroup_rules(&rules, error_on_collisions)
    }
    fn query_regroup(&mut self, rule: &QueryRemapRule) -> Result<usize>;
    fn int_or_regroup(&mut self, field: &str, terms: &[i64], target: usize, negative: usize, positive: usize) -> Result<()>;
    fn string_or_regroup(&mut self, field: &str, terms: &[String], target: usize, negative: usize, positive: usize) -> Result<()>;
    fn regex_regroup(&mut self, field: &str, regex: &str, target: usize, negative: usize, positive: usize) -> Result<()>;
    #[allow(clippy::too_many_arguments)]
    fn random_regroup(
        &mut self,
        field: &str,
        is_int: bool,
        salt: &str,
        probability: f64,
        target: usize,
        negative: usize,
        positive: usize,
    ) -> Result<()>;

    fn get_group_stats(&mut self, stat: usize) -> Result<GroupStats>;
    fn get_ftgs_iterator(
        &mut self,
        int_fields: &[String],
        string_fields: &[String],
        params: FtgsParams,
    ) -> Result<Box<dyn FtgsIterator>>;
    fn get_subset_ftgs_iterator(
        &mut self,
        int_terms: &HashMap<String, Vec<i64>>,
        string_terms: &HashMap<String, Vec<String>>,
    ) -> Result<Box<dyn FtgsIterator>>;
    /// Distinct term count per group, starting at group 0.
    fn get_distinct(&mut self, field: &str, is_int: bool) -> Result<Box<dyn Iterator<Item = i64>>>;
    fn num_groups(&self) -> usize;
    fn close_and_get_performance_stats(&mut self) -> Result<PerformanceStats>;
}

pub type SessionBox = Box<dyn RemoteSession>;

// ------------- Aggregate stat tree -------------
/// The remote representation of an aggregate metric or filter, evaluated by
/// the engine per (term, group) instead of by the client. Booleans are 1.0 / 0.0.
#[derive(Debug, Clone, PartialEq)]
pub enum StatTree {
    Constant(f64),
    /// An already-pushed stat slot.
    Stat(usize),
    PerGroupConstant(Arc<Vec<f64>>),
    Unary(UnaryOp, Box<StatTree>),
    Binary(BinaryOp, Box<StatTree>, Box<StatTree>),
    TermEqualsInt(i64),
    TermEqualsString(String),
    TermRegex(String),
    IfThenElse(Box<StatTree>, Box<StatTree>, Box<StatTree>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Abs,
    Signum,
    Log,
    Negate,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulus,
    Power,
    Min,
    Max,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    And,
    Or,
}

impl UnaryOp {
    pub fn eval(self, v: f64) -> f64 {
        match self {
            UnaryOp::Abs => v.abs(),
            UnaryOp::Signum => {
                if v > 0.0 {
                    1.0
                } else if v < 0.0 {
                    -1.0
                } else {
                    v
                }
            }
            UnaryOp::Log => v.ln(),
            UnaryOp::Negate => -v,
            UnaryOp::Not => truth(v == 0.0),
        }
    }
}

impl BinaryOp {
    pub fn eval(self, l: f64, r: f64) -> f64 {
        match self {
            BinaryOp::Add => l + r,
            BinaryOp::Subtract => l - r,
            BinaryOp::Multiply => l * r,
            BinaryOp::Divide => l / r,
            BinaryOp::Modulus => l % r,
            BinaryOp::Power => l.powf(r),
            BinaryOp::Min => l.min(r),
            BinaryOp::Max => l.max(r),
            BinaryOp::Eq => truth(l == r),
            BinaryOp::Neq => truth(l != r),
            BinaryOp::Gt => truth(l > r),
            BinaryOp::Gte => truth(l >= r),
            BinaryOp::Lt => truth(l < r),
            BinaryOp::Lte => truth(l <= r),
            BinaryOp::And => truth(l != 0.0 && r != 0.0),
            BinaryOp::Or => truth(l != 0.0 || r != 0.0),
        }
    }
}

/// Term regexes match the whole term, not a substring.
pub fn anchored(pattern: &str) -> Result<regex::Regex> {
    Ok(regex::Regex::new(&format!("^(?:{})$", pattern))?)
}

pub(crate) fn truth(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

impl StatTree {
    pub fn unary(op: UnaryOp, operand: StatTree) -> Self {
        StatTree::Unary(op, Box::new(operand))
    }
    pub fn binary(op: BinaryOp, left: StatTree, right: StatTree) -> Self {
        StatTree::Binary(op, Box::new(left), Box::new(right))
    }

    /// Evaluates the tree the way the remote engine would for one (term, group).
    pub fn eval(&self, term: &Term, stats: &[i64], group: usize) -> Result<f64> {
        Ok(match self {
            StatTree::Constant(v) => *v,
            StatTree::Stat(index) => stats.get(*index).copied().unwrap_or_default() as f64,
            StatTree::PerGroupConstant(values) => values.get(group).copied().unwrap_or_default(),
            StatTree::Unary(op, operand) => op.eval(operand.eval(term, stats, group)?),
            StatTree::Binary(op, l, r) => op.eval(l.eval(term, stats, group)?, r.eval(term, stats, group)?),
            StatTree::TermEqualsInt(v) => truth(matches!(term, Term::Int(t) if t == v)),
            StatTree::TermEqualsString(s) => truth(term.as_string() == *s),
            StatTree::TermRegex(pattern) => truth(anchored(pattern)?.is_match(&term.as_string())),
            StatTree::IfThenElse(cond, t, f) => {
                if cond.eval(term, stats, group)? != 0.0 {
                    t.eval(term, stats, group)?
                } else {
                    f.eval(term, stats, group)?
                }
            }
        })
    }
}
