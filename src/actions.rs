//! Primitive regroup actions produced by compiling a [`DocFilter`].
//!
//! Each action splits the documents of `target` into `positive` and
//! `negative` on every session in its scope; other groups are untouched.
//! Actions are applied one after another and are not transactional.

use std::collections::BTreeSet;

use tracing::debug;

use crate::docfilter::DocFilter;
use crate::error::Result;
use crate::remote::Query;
use crate::session::Session;

/// Dataset names an action applies to.
pub type Scope = BTreeSet<String>;

pub fn scope_of(datasets: &[&str]) -> Scope {
    datasets.iter().map(|d| d.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Query { scope: Scope, query: Query, target: usize, positive: usize, negative: usize },
    IntOr { scope: Scope, field: String, terms: Vec<i64>, target: usize, positive: usize, negative: usize },
    StringOr { scope: Scope, field: String, terms: Vec<String>, target: usize, positive: usize, negative: usize },
    /// Evaluates the filter's 0/1 metric per document.
    Metric { scope: Scope, filter: DocFilter, target: usize, positive: usize, negative: usize },
    Regex { scope: Scope, field: String, regex: String, target: usize, positive: usize, negative: usize },
    Sample {
        scope: Scope,
        field: String,
        probability: f64,
        seed: String,
        target: usize,
        positive: usize,
        negative: usize,
    },
    /// Moves every document of `target` to `new_group`.
    Unconditional { scope: Scope, target: usize, new_group: usize },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Query { .. } => "query",
            Action::IntOr { .. } => "int or",
            Action::StringOr { .. } => "string or",
            Action::Metric { .. } => "metric",
            Action::Regex { .. } => "regex",
            Action::Sample { .. } => "sample",
            Action::Unconditional { .. } => "unconditional",
        }
    }

    pub fn apply(&self, session: &mut Session) -> Result<()> {
        debug!(action = self.name(), "applying filter action");
        match self {
            Action::Query { scope, query, target, positive, negative } => {
                session.query_regroup(query, *target, *negative, *positive, scope)
            }
            Action::IntOr { scope, field, terms, target, positive, negative } => {
                let mut sorted = terms.clone();
                sorted.sort_unstable();
                sorted.dedup();
                for dataset in session.datasets_in(scope) {
                    let single: Scope = std::iter::once(dataset.clone()).collect();
                    if session.is_int_field(&dataset, field) {
                        session.int_or_regroup(field, &sorted, *target, *negative, *positive, &single)?;
                    } else {
                        // string fields holding numbers are matched by their text
                        let stringified: Vec<String> = sorted.iter().map(i64::to_string).collect();
                        session.string_or_regroup(field, &stringified, *target, *negative, *positive, &single)?;
                    }
                }
                Ok(())
            }
            Action::StringOr { scope, field, terms, target, positive, negative } => {
                let mut sorted = terms.clone();
                sorted.sort();
                sorted.dedup();
                session.string_or_regroup(field, &sorted, *target, *negative, *positive, scope)
            }
            Action::Metric { scope, filter, target, positive, negative } => {
                for dataset in session.datasets_in(scope) {
                    let pushes = filter.as_zero_one_metric(&dataset)?.get_pushes(&dataset)?;
                    session.metric_filter(&dataset, &pushes, 1, 1, *target, *negative, *positive)?;
                }
                Ok(())
            }
            Action::Regex { scope, field, regex, target, positive, negative } => {
                session.regex_regroup(field, regex, *target, *negative, *positive, scope)
            }
            Action::Sample { scope, field, probability, seed, target, positive, negative } => {
                session.random_regroup(field, seed, *probability, *target, *negative, *positive, scope)
            }
            Action::Unconditional { scope, target, new_group } => session.remap_group(*target, *new_group, scope),
        }
    }
}

/// Folds runs of query actions over the same scope and groups into one.
///
/// With `target == negative` unmatched documents stay in `target` for the
/// next action, so the run is an OR; with `target == positive` matched ones
/// do, so it is an AND.
pub fn optimize_consecutive_query_actions(actions: Vec<Action>) -> Vec<Action> {
    let mut out: Vec<Action> = Vec::with_capacity(actions.len());
    for action in actions {
        if let Some(Action::Query { scope, query, target, positive, negative }) = out.last_mut() {
            if let Action::Query { scope: s2, query: q2, target: t2, positive: p2, negative: n2 } = &action {
                if scope == s2 && target == t2 && positive == p2 && negative == n2 && positive != negative {
                    if target == negative {
                        *query = combine(query.clone(), q2.clone(), true);
                        continue;
                    }
                    if target == positive {
                        *query = combine(query.clone(), q2.clone(), false);
                        continue;
                    }
                }
            }
        }
        out.push(action);
    }
    out
}

fn combine(a: Query, b: Query, or: bool) -> Query {
    let mut parts = Vec::new();
    for q in [a, b] {
        match q {
            Query::Or(inner) if or => parts.extend(inner),
            Query::And(inner) if !or => parts.extend(inner),
            q => parts.push(q),
        }
    }
    if or { Query::Or(parts) } else { Query::And(parts) }
}
