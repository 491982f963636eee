//! Per-document metrics and filters.
//!
//! A [`DocMetric`] compiles into push tokens for one dataset. A [`DocFilter`]
//! compiles either into a 0/1 metric or into a list of regroup [`Action`]s
//! that split a target group into a positive and a negative group.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use crate::actions::{Action, Scope};
use crate::aggregate::Comparison;
use crate::error::{Result, SquallError};
use crate::remote::{Query, Term};

// ------------- DocMetric -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulus,
    Min,
    Max,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl DocOp {
    fn token(self) -> &'static str {
        match self {
            DocOp::Add => "+",
            DocOp::Subtract => "-",
            DocOp::Multiply => "*",
            DocOp::Divide => "/",
            DocOp::Modulus => "%",
            DocOp::Min => "min()",
            DocOp::Max => "max()",
            DocOp::Eq => "=",
            DocOp::Neq => "!=",
            DocOp::Lt => "<",
            DocOp::Lte => "<=",
            DocOp::Gt => ">",
            DocOp::Gte => ">=",
        }
    }
}

impl From<Comparison> for DocOp {
    fn from(c: Comparison) -> Self {
        match c {
            Comparison::Equals => DocOp::Eq,
            Comparison::NotEquals => DocOp::Neq,
            Comparison::Gt => DocOp::Gt,
            Comparison::Gte => DocOp::Gte,
            Comparison::Lt => DocOp::Lt,
            Comparison::Lte => DocOp::Lte,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocMetric {
    Count,
    DocId,
    Field(String),
    Constant(i64),
    Binary(DocOp, Box<DocMetric>, Box<DocMetric>),
    Abs(Box<DocMetric>),
    Negate(Box<DocMetric>),
    Signum(Box<DocMetric>),
    /// `ln(m) * scale`, truncated.
    Log { metric: Box<DocMetric>, scale: i64 },
    HasInt { field: String, term: i64 },
    HasString { field: String, term: String },
    HasIntField(String),
    HasStringField(String),
    RegexMetric { field: String, regex: String },
    StringLen(String),
    IfThenElse(Box<DocFilter>, Box<DocMetric>, Box<DocMetric>),
    Qualified { datasets: Vec<String>, metric: Box<DocMetric> },
}

impl DocMetric {
    pub fn field(name: &str) -> Self {
        DocMetric::Field(name.to_string())
    }
    pub fn binary(op: DocOp, l: DocMetric, r: DocMetric) -> Self {
        DocMetric::Binary(op, Box::new(l), Box::new(r))
    }
    pub fn add(l: DocMetric, r: DocMetric) -> Self {
        Self::binary(DocOp::Add, l, r)
    }
    pub fn subtract(l: DocMetric, r: DocMetric) -> Self {
        Self::binary(DocOp::Subtract, l, r)
    }
    pub fn multiply(l: DocMetric, r: DocMetric) -> Self {
        Self::binary(DocOp::Multiply, l, r)
    }
    pub fn if_then_else(cond: DocFilter, t: DocMetric, f: DocMetric) -> Self {
        DocMetric::IfThenElse(Box::new(cond), Box::new(t), Box::new(f))
    }
    pub fn qualified(datasets: &[&str], metric: DocMetric) -> Self {
        DocMetric::Qualified { datasets: datasets.iter().map(|d| d.to_string()).collect(), metric: Box::new(metric) }
    }

    pub fn get_pushes(&self, dataset: &str) -> Result<Vec<String>> {
        Ok(match self {
            DocMetric::Count => vec!["count()".to_string()],
            DocMetric::DocId => vec!["docId()".to_string()],
            DocMetric::Field(field) => vec![field.clone()],
            DocMetric::Constant(v) => vec![v.to_string()],
            DocMetric::Binary(op, l, r) => {
                let mut pushes = l.get_pushes(dataset)?;
                pushes.extend(r.get_pushes(dataset)?);
                pushes.push(op.token().to_string());
                pushes
            }
            DocMetric::Abs(m) => {
                let mut pushes = m.get_pushes(dataset)?;
                pushes.push("abs()".to_string());
                pushes
            }
            DocMetric::Negate(m) => Self::subtract(DocMetric::Constant(0), (**m).clone()).get_pushes(dataset)?,
            DocMetric::Signum(m) => {
                let m = (**m).clone();
                let negative = Self::if_then_else(
                    DocFilter::compare(Comparison::Lt, m.clone(), DocMetric::Constant(0)),
                    DocMetric::Constant(-1),
                    DocMetric::Constant(0),
                );
                Self::if_then_else(DocFilter::compare(Comparison::Gt, m, DocMetric::Constant(0)), DocMetric::Constant(1), negative)
                    .get_pushes(dataset)?
            }
            DocMetric::Log { metric, scale } => {
                let mut pushes = metric.get_pushes(dataset)?;
                pushes.push(format!("log {}", scale));
                pushes
            }
            DocMetric::HasInt { field, term } => vec![format!("hasint {}:{}", field, term)],
            DocMetric::HasString { field, term } => vec![format!("hasstr {}:{}", field, term)],
            DocMetric::HasIntField(field) => vec![format!("hasintfield {}", field)],
            DocMetric::HasStringField(field) => vec![format!("hasstrfield {}", field)],
            DocMetric::RegexMetric { field, regex } => vec![format!("regex {}:{}", field, regex)],
            DocMetric::StringLen(field) => vec![format!("len {}", field)],
            DocMetric::IfThenElse(cond, t, f) => {
                let truth = cond.as_zero_one_metric(dataset)?;
                let taken = Self::multiply(truth.clone(), (**t).clone());
                let other = Self::multiply(Self::subtract(DocMetric::Constant(1), truth), (**f).clone());
                Self::add(taken, other).get_pushes(dataset)?
            }
            DocMetric::Qualified { datasets, metric } => {
                if !datasets.iter().any(|d| d == dataset) {
                    return Err(SquallError::Invariant(format!(
                        "metric qualified to {:?} pushed to dataset {}",
                        datasets, dataset
                    )));
                }
                metric.get_pushes(dataset)?
            }
        })
    }

    /// Datasets named by `Qualified` nodes anywhere in the tree.
    pub fn qualifications(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_qualifications(&mut out);
        out
    }

    fn collect_qualifications(&self, out: &mut BTreeSet<String>) {
        match self {
            DocMetric::Qualified { datasets, metric } => {
                out.extend(datasets.iter().cloned());
                metric.collect_qualifications(out);
            }
            DocMetric::Binary(_, l, r) => {
                l.collect_qualifications(out);
                r.collect_qualifications(out);
            }
            DocMetric::Abs(m) | DocMetric::Negate(m) | DocMetric::Signum(m) | DocMetric::Log { metric: m, .. } => {
                m.collect_qualifications(out)
            }
            DocMetric::IfThenElse(_, t, f) => {
                t.collect_qualifications(out);
                f.collect_qualifications(out);
            }
            _ => {}
        }
    }
}

// ------------- DocFilter -------------
#[derive(Debug, Clone, PartialEq)]
pub enum DocFilter {
    FieldIs { field: String, term: Term },
    FieldIsnt { field: String, term: Term },
    /// `lower <= field < upper`.
    Between { field: String, lower: i64, upper: i64 },
    Compare(Comparison, Box<DocMetric>, Box<DocMetric>),
    And(Box<DocFilter>, Box<DocFilter>),
    Or(Box<DocFilter>, Box<DocFilter>),
    Ors(Vec<DocFilter>),
    Not(Box<DocFilter>),
    Regex { field: String, regex: String },
    NotRegex { field: String, regex: String },
    Qualified { datasets: Vec<String>, filter: Box<DocFilter> },
    Sample { field: String, numerator: u64, denominator: u64, seed: String },
    Always,
    Never,
    IntFieldIn { field: String, terms: Vec<i64> },
    StringFieldIn { field: String, terms: Vec<String> },
}

impl DocFilter {
    pub fn field_is(field: &str, term: Term) -> Self {
        DocFilter::FieldIs { field: field.to_string(), term }
    }
    pub fn compare(op: Comparison, l: DocMetric, r: DocMetric) -> Self {
        DocFilter::Compare(op, Box::new(l), Box::new(r))
    }
    pub fn and(a: DocFilter, b: DocFilter) -> Self {
        DocFilter::And(Box::new(a), Box::new(b))
    }
    pub fn or(a: DocFilter, b: DocFilter) -> Self {
        DocFilter::Or(Box::new(a), Box::new(b))
    }
    pub fn negate(f: DocFilter) -> Self {
        DocFilter::Not(Box::new(f))
    }
    pub fn qualified(datasets: &[&str], filter: DocFilter) -> Self {
        DocFilter::Qualified { datasets: datasets.iter().map(|d| d.to_string()).collect(), filter: Box::new(filter) }
    }
    pub fn int_field_in(field: &str, terms: Vec<i64>) -> Result<Self> {
        if terms.is_empty() {
            return Err(SquallError::parse("Cannot have empty set of terms!"));
        }
        Ok(DocFilter::IntFieldIn { field: field.to_string(), terms })
    }
    pub fn string_field_in(field: &str, terms: Vec<String>) -> Result<Self> {
        if terms.is_empty() {
            return Err(SquallError::parse("Cannot have empty set of terms!"));
        }
        Ok(DocFilter::StringFieldIn { field: field.to_string(), terms })
    }

    /// A metric that is 1 for matching documents and 0 otherwise.
    pub fn as_zero_one_metric(&self, dataset: &str) -> Result<DocMetric> {
        let one = || DocMetric::Constant(1);
        Ok(match self {
            DocFilter::FieldIs { field, term: Term::Int(v) } => DocMetric::HasInt { field: field.clone(), term: *v },
            DocFilter::FieldIs { field, term: Term::Str(s) } => DocMetric::HasString { field: field.clone(), term: s.clone() },
            DocFilter::FieldIsnt { field, term } => {
                let is = DocFilter::FieldIs { field: field.clone(), term: term.clone() };
                DocMetric::subtract(one(), is.as_zero_one_metric(dataset)?)
            }
            DocFilter::Between { field, lower, upper } => DocFilter::and(
                DocFilter::compare(Comparison::Gte, DocMetric::field(field), DocMetric::Constant(*lower)),
                DocFilter::compare(Comparison::Lt, DocMetric::field(field), DocMetric::Constant(*upper)),
            )
            .as_zero_one_metric(dataset)?,
            DocFilter::Compare(op, l, r) => DocMetric::binary(DocOp::from(*op), (**l).clone(), (**r).clone()),
            DocFilter::And(a, b) => DocMetric::binary(
                DocOp::Eq,
                DocMetric::add(a.as_zero_one_metric(dataset)?, b.as_zero_one_metric(dataset)?),
                DocMetric::Constant(2),
            ),
            DocFilter::Or(a, b) => DocMetric::binary(
                DocOp::Gt,
                DocMetric::add(a.as_zero_one_metric(dataset)?, b.as_zero_one_metric(dataset)?),
                DocMetric::Constant(0),
            ),
            DocFilter::Ors(filters) => {
                let mut sum: Option<DocMetric> = None;
                for f in filters {
                    let m = f.as_zero_one_metric(dataset)?;
                    sum = Some(match sum {
                        None => m,
                        Some(acc) => DocMetric::add(acc, m),
                    });
                }
                match sum {
                    None => DocMetric::Constant(0),
                    Some(sum) => DocMetric::binary(DocOp::Gt, sum, DocMetric::Constant(0)),
                }
            }
            DocFilter::Not(f) => DocMetric::subtract(one(), f.as_zero_one_metric(dataset)?),
            DocFilter::Regex { field, regex } => DocMetric::RegexMetric { field: field.clone(), regex: regex.clone() },
            DocFilter::NotRegex { field, regex } => {
                DocMetric::subtract(one(), DocMetric::RegexMetric { field: field.clone(), regex: regex.clone() })
            }
            DocFilter::Qualified { datasets, filter } => {
                if datasets.iter().any(|d| d == dataset) {
                    filter.as_zero_one_metric(dataset)?
                } else {
                    one()
                }
            }
            DocFilter::Sample { .. } => {
                return Err(SquallError::Unsupported("sample filters have no per-document metric".to_string()));
            }
            DocFilter::Always => one(),
            DocFilter::Never => DocMetric::Constant(0),
            DocFilter::IntFieldIn { field, terms } => {
                DocFilter::Ors(terms.iter().map(|t| DocFilter::field_is(field, Term::Int(*t))).collect())
                    .as_zero_one_metric(dataset)?
            }
            DocFilter::StringFieldIn { field, terms } => {
                DocFilter::Ors(terms.iter().map(|t| DocFilter::field_is(field, Term::Str(t.clone()))).collect())
                    .as_zero_one_metric(dataset)?
            }
        })
    }

    /// Actions that move every document of `target` in `scope` into
    /// `positive` when it matches and into `negative` otherwise.
    pub fn get_execution_actions(
        &self,
        scope: &Scope,
        target: usize,
        positive: usize,
        negative: usize,
        groups: &GroupSupplier,
    ) -> Result<Vec<Action>> {
        let query = |query: Query| Action::Query { scope: scope.clone(), query, target, positive, negative };
        Ok(match self {
            DocFilter::FieldIs { field, term } => vec![query(Query::Term { field: field.clone(), term: term.clone() })],
            DocFilter::FieldIsnt { field, term } => DocFilter::FieldIs { field: field.clone(), term: term.clone() }
                .get_execution_actions(scope, target, negative, positive, groups)?,
            DocFilter::Between { field, lower, upper } => vec![query(Query::Range {
                field: field.clone(),
                lower: Term::Int(*lower),
                upper: Term::Int(*upper),
                upper_inclusive: false,
            })],
            DocFilter::Compare(_, l, r) => {
                let mut qualifications = l.qualifications();
                qualifications.extend(r.qualifications());
                if qualifications.len() > 1 {
                    return Err(SquallError::parse(format!(
                        "DocFilter cannot have multiple different qualifications! qualifications = {:?}",
                        qualifications
                    )));
                }
                if !qualifications.is_subset(scope) {
                    return Err(SquallError::parse(format!(
                        "Scope does not contain qualifications! scope = {:?}, qualifications = {:?}",
                        scope, qualifications
                    )));
                }
                let scope = if qualifications.is_empty() { scope.clone() } else { qualifications };
                vec![Action::Metric { scope, filter: self.clone(), target, positive, negative }]
            }
            DocFilter::And(a, b) => {
                let mut actions = Vec::new();
                if target != negative && positive != negative {
                    actions.extend(a.get_execution_actions(scope, target, target, negative, groups)?);
                    actions.extend(b.get_execution_actions(scope, target, positive, negative, groups)?);
                } else {
                    let staged = groups.acquire();
                    actions.extend(a.get_execution_actions(scope, target, target, staged.group(), groups)?);
                    actions.extend(b.get_execution_actions(scope, target, target, staged.group(), groups)?);
                    actions.push(Action::Unconditional { scope: scope.clone(), target, new_group: positive });
                    actions.push(Action::Unconditional { scope: scope.clone(), target: staged.group(), new_group: negative });
                    staged.release()?;
                }
                actions
            }
            DocFilter::Or(a, b) => {
                let mut actions = Vec::new();
                if target != positive && positive != negative {
                    actions.extend(a.get_execution_actions(scope, target, positive, target, groups)?);
                    actions.extend(b.get_execution_actions(scope, target, positive, negative, groups)?);
                } else {
                    let staged = groups.acquire();
                    actions.extend(a.get_execution_actions(scope, target, staged.group(), target, groups)?);
                    actions.extend(b.get_execution_actions(scope, target, staged.group(), target, groups)?);
                    actions.push(Action::Unconditional { scope: scope.clone(), target, new_group: negative });
                    actions.push(Action::Unconditional { scope: scope.clone(), target: staged.group(), new_group: positive });
                    staged.release()?;
                }
                actions
            }
            DocFilter::Ors(filters) => {
                let mut iter = filters.iter().rev();
                match iter.next() {
                    None => vec![Action::Unconditional { scope: scope.clone(), target, new_group: negative }],
                    Some(last) => {
                        let folded = iter.fold(last.clone(), |acc, f| DocFilter::or(f.clone(), acc));
                        folded.get_execution_actions(scope, target, positive, negative, groups)?
                    }
                }
            }
            DocFilter::Not(f) => f.get_execution_actions(scope, target, negative, positive, groups)?,
            DocFilter::Regex { field, regex } => vec![Action::Regex {
                scope: scope.clone(),
                field: field.clone(),
                regex: regex.clone(),
                target,
                positive,
                negative,
            }],
            DocFilter::NotRegex { field, regex } => DocFilter::Regex { field: field.clone(), regex: regex.clone() }
                .get_execution_actions(scope, target, negative, positive, groups)?,
            DocFilter::Qualified { datasets, filter } => {
                let restricted: Scope = datasets.iter().filter(|d| scope.contains(*d)).cloned().collect();
                filter.get_execution_actions(&restricted, target, positive, negative, groups)?
            }
            DocFilter::Sample { field, numerator, denominator, seed } => {
                if *denominator == 0 {
                    return Err(SquallError::parse("sample denominator must be positive"));
                }
                vec![Action::Sample {
                    scope: scope.clone(),
                    field: field.clone(),
                    probability: *numerator as f64 / *denominator as f64,
                    seed: seed.clone(),
                    target,
                    positive,
                    negative,
                }]
            }
            DocFilter::Always => vec![Action::Unconditional { scope: scope.clone(), target, new_group: positive }],
            DocFilter::Never => vec![Action::Unconditional { scope: scope.clone(), target, new_group: negative }],
            DocFilter::IntFieldIn { field, terms } => vec![Action::IntOr {
                scope: scope.clone(),
                field: field.clone(),
                terms: terms.clone(),
                target,
                positive,
                negative,
            }],
            DocFilter::StringFieldIn { field, terms } => vec![Action::StringOr {
                scope: scope.clone(),
                field: field.clone(),
                terms: terms.clone(),
                target,
                positive,
                negative,
            }],
        })
    }

    /// Actions keeping matching documents in their group and dropping the rest
    /// to group 0, for every group `1..=num_groups`.
    pub fn filter_actions(&self, scope: &Scope, num_groups: usize) -> Result<Vec<Action>> {
        let groups = GroupSupplier::new(num_groups + 1);
        let mut actions = Vec::new();
        for group in 1..=num_groups {
            actions.extend(self.get_execution_actions(scope, group, group, 0, &groups)?);
        }
        groups.finish()?;
        Ok(actions)
    }
}

// ------------- GroupSupplier -------------
#[derive(Debug, Default)]
struct SupplierState {
    next: usize,
    outstanding: Vec<usize>,
    acquired: usize,
    violation: Option<String>,
}

impl SupplierState {
    fn release(&mut self, group: usize) -> Result<()> {
        match self.outstanding.last() {
            Some(top) if *top == group => {
                self.outstanding.pop();
                self.next -= 1;
                Ok(())
            }
            top => {
                let message = format!("auxiliary group {} released out of order (innermost is {:?})", group, top);
                self.violation.get_or_insert_with(|| message.clone());
                self.outstanding.retain(|g| *g != group);
                Err(SquallError::Invariant(message))
            }
        }
    }
}

/// Hands out auxiliary group numbers above the live range, strictly LIFO.
///
/// Clones share one pool.
#[derive(Debug, Clone)]
pub struct GroupSupplier {
    state: Rc<RefCell<SupplierState>>,
}

impl GroupSupplier {
    /// `first_free` is the lowest group number not in use.
    pub fn new(first_free: usize) -> Self {
        Self { state: Rc::new(RefCell::new(SupplierState { next: first_free, ..Default::default() })) }
    }

    pub fn acquire(&self) -> AuxGroup {
        let mut state = self.state.borrow_mut();
        let group = state.next;
        state.next += 1;
        state.acquired += 1;
        state.outstanding.push(group);
        AuxGroup { group, state: Rc::clone(&self.state), released: false }
    }

    pub fn outstanding(&self) -> usize {
        self.state.borrow().outstanding.len()
    }

    /// Total number of acquisitions so far.
    pub fn acquired(&self) -> usize {
        self.state.borrow().acquired
    }

    /// Fails if any group is still held or was ever released out of order.
    pub fn finish(&self) -> Result<()> {
        let state = self.state.borrow();
        if let Some(violation) = &state.violation {
            return Err(SquallError::Invariant(violation.clone()));
        }
        if !state.outstanding.is_empty() {
            return Err(SquallError::Invariant(format!("auxiliary groups {:?} never released", state.outstanding)));
        }
        Ok(())
    }
}

/// An acquired auxiliary group; released on drop if not released explicitly.
pub struct AuxGroup {
    group: usize,
    state: Rc<RefCell<SupplierState>>,
    released: bool,
}

impl AuxGroup {
    pub fn group(&self) -> usize {
        self.group
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.state.borrow_mut().release(self.group)
    }
}

impl Drop for AuxGroup {
    fn drop(&mut self) {
        if !self.released {
            // recorded in the pool and reported by `finish`
            let _ = self.state.borrow_mut().release(self.group);
        }
    }
}

impl fmt::Debug for AuxGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuxGroup({})", self.group)
    }
}
