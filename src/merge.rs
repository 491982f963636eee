//! Multi-session FTGS merge.
//!
//! Every participating session contributes one sorted stream of
//! (term, group, stats) for a field. The merge emits one callback per distinct
//! (term, group), with a combined stat buffer where each session writes only
//! its assigned slots and an optional presence slot set to 1. Slots of
//! sessions lacking the key stay 0.
//!
//! A lone session whose slots are already the identity mapping skips the heap
//! and streams its iterator straight into the callback.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

use tracing::debug;

use crate::error::{Result, SquallError};
use crate::remote::{FtgsIterator, FtgsParams, RemoteSession, RemoteTopKParams};

// ------------- Callbacks -------------
/// Receives merged rows of an int field.
///
/// `need_sorted`, `need_group`, `need_stats` tell the driver what it may skip:
/// when `need_stats()` is false the `stats` slice can hold anything, when
/// `need_group()` is false so can `group`.
pub trait IntIterateCallback {
    fn term(&mut self, term: i64, stats: &[i64], group: usize) -> Result<()>;
    fn need_sorted(&self) -> bool;
    fn need_group(&self) -> bool;
    fn need_stats(&self) -> bool;
}

pub trait StringIterateCallback {
    fn term(&mut self, term: &str, stats: &[i64], group: usize) -> Result<()>;
    fn need_sorted(&self) -> bool;
    fn need_group(&self) -> bool;
    fn need_stats(&self) -> bool;
}

// ------------- Sources -------------
/// One session taking part in a merge.
pub struct MergeSource<'a> {
    pub name: &'a str,
    pub session: &'a mut dyn RemoteSession,
    /// The session's real name for the merged field.
    pub field: String,
    /// Slot in the combined buffer for each of the session's pushed stats.
    pub metric_indexes: Vec<usize>,
    pub presence_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TermSubset {
    Int(Vec<i64>),
    Str(Vec<String>),
}

#[derive(Debug, Clone, Default)]
pub struct IterateOptions {
    pub term_subset: Option<TermSubset>,
    pub top_k: Option<RemoteTopKParams>,
    pub limit: Option<usize>,
}

/// Term types the merge can order.
pub trait MergeTerm: Ord + Clone {
    const IS_INT: bool;
    fn read(iterator: &dyn FtgsIterator) -> Self;
}

impl MergeTerm for i64 {
    const IS_INT: bool = true;
    fn read(iterator: &dyn FtgsIterator) -> Self {
        iterator.term_int_val()
    }
}

impl MergeTerm for String {
    const IS_INT: bool = false;
    fn read(iterator: &dyn FtgsIterator) -> Self {
        iterator.term_string_val().to_string()
    }
}

// ------------- Iterators -------------
/// Opens the FTGS iterator matching the requested options.
pub fn create_ftgs_iterator(
    session: &mut dyn RemoteSession,
    field: &str,
    is_int: bool,
    options: &IterateOptions,
    sorted: bool,
) -> Result<Box<dyn FtgsIterator>> {
    let fields = vec![field.to_string()];
    let (int_fields, string_fields): (&[String], &[String]) = if is_int { (&fields, &[]) } else { (&[], &fields) };
    if let Some(subset) = &options.term_subset {
        let mut ints = HashMap::new();
        let mut strings = HashMap::new();
        match subset {
            TermSubset::Int(terms) => {
                let mut terms = terms.clone();
                terms.sort_unstable();
                ints.insert(field.to_string(), terms);
            }
            TermSubset::Str(terms) => {
                let mut terms = terms.clone();
                terms.sort();
                strings.insert(field.to_string(), terms);
            }
        }
        return session.get_subset_ftgs_iterator(&ints, &strings);
    }
    let params = match (options.top_k, options.limit) {
        (Some(top_k), _) => FtgsParams { term_limit: top_k.limit, sort_stat: Some(top_k.sort_stat), sorted },
        (None, Some(limit)) => FtgsParams { term_limit: limit, sort_stat: None, sorted: true },
        (None, None) => FtgsParams::unlimited(sorted),
    };
    session.get_ftgs_iterator(int_fields, string_fields, params)
}

/// One session, no presence slot, and slot `i` holding the session's stat `i`.
pub fn is_simple(sources: &[MergeSource<'_>], num_metrics: usize) -> bool {
    match sources {
        [source] => {
            source.presence_index.is_none()
                && source.metric_indexes.len() == num_metrics
                && source.metric_indexes.iter().enumerate().all(|(i, index)| i == *index)
        }
        _ => false,
    }
}

fn enter_field<T: MergeTerm>(iterator: &mut dyn FtgsIterator, field: &str) -> Result<()> {
    if !iterator.next_field()? {
        return Err(SquallError::Invariant(format!("FTGS iterator produced no field for {}", field)));
    }
    if iterator.field_is_int_type() != T::IS_INT {
        return Err(SquallError::Invariant(format!(
            "field {} is not an {} field",
            field,
            if T::IS_INT { "int" } else { "string" }
        )));
    }
    Ok(())
}

fn leave_field(iterator: &mut dyn FtgsIterator, field: &str) -> Result<()> {
    if iterator.next_field()? {
        return Err(SquallError::Invariant(format!("FTGS iterator for {} produced more than one field", field)));
    }
    Ok(())
}

// ------------- Merge state -------------
/// Where one session's stream currently stands.
struct IterationState<T> {
    term: T,
    group: usize,
    stats: Vec<i64>,
    source: usize,
}

impl<T: Ord> PartialEq for IterationState<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Ord> Eq for IterationState<T> {}

impl<T: Ord> PartialOrd for IterationState<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> Ord for IterationState<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.term
            .cmp(&other.term)
            .then(self.group.cmp(&other.group))
            .then(self.source.cmp(&other.source))
    }
}

impl<T: Ord> IterationState<T> {
    fn same_key(&self, other: &Self) -> bool {
        self.term == other.term && self.group == other.group
    }
}

/// Moves to the next group of the current term, else to the first group of
/// the next term that has one. `None` once the stream is exhausted.
fn advance<T: MergeTerm>(
    mut state: IterationState<T>,
    iterator: &mut dyn FtgsIterator,
    need_stats: bool,
) -> Result<Option<IterationState<T>>> {
    loop {
        if iterator.next_group()? {
            state.group = iterator.group();
            if need_stats {
                iterator.group_stats(&mut state.stats);
            }
            return Ok(Some(state));
        }
        if !iterator.next_term()? {
            return Ok(None);
        }
        state.term = T::read(iterator);
    }
}

fn first_state<T: MergeTerm>(
    source: usize,
    iterator: &mut dyn FtgsIterator,
    num_stats: usize,
    need_stats: bool,
) -> Result<Option<IterationState<T>>> {
    if !iterator.next_term()? {
        return Ok(None);
    }
    let state = IterationState { term: T::read(iterator), group: 0, stats: vec![0; num_stats], source };
    advance(state, iterator, need_stats)
}

/// Drives the merge for one field and hands each combined row to `emit`.
///
/// Iterators are owned by this call and dropped on every exit path.
pub fn iterate_multi<T: MergeTerm>(
    sources: &mut [MergeSource<'_>],
    num_metrics: usize,
    options: &IterateOptions,
    need_sorted: bool,
    need_stats: bool,
    mut emit: impl FnMut(&T, &[i64], usize) -> Result<()>,
) -> Result<()> {
    if is_simple(sources, num_metrics) {
        let source = &mut sources[0];
        debug!(session = source.name, field = %source.field, "single session FTGS stream");
        let mut iterator = create_ftgs_iterator(&mut *source.session, &source.field, T::IS_INT, options, need_sorted)?;
        enter_field::<T>(iterator.as_mut(), &source.field)?;
        let mut buffer = vec![0i64; num_metrics];
        while iterator.next_term()? {
            let term = T::read(iterator.as_ref());
            while iterator.next_group()? {
                if need_stats {
                    iterator.group_stats(&mut buffer);
                }
                emit(&term, &buffer, iterator.group())?;
            }
        }
        return leave_field(iterator.as_mut(), &source.field);
    }

    let presence_slots = sources.iter().filter(|s| s.presence_index.is_some()).count();
    let mut iterators: Vec<Box<dyn FtgsIterator>> = Vec::with_capacity(sources.len());
    for source in sources.iter_mut() {
        // the merge relies on term order from every stream
        let mut iterator = create_ftgs_iterator(&mut *source.session, &source.field, T::IS_INT, options, true)?;
        enter_field::<T>(iterator.as_mut(), &source.field)?;
        iterators.push(iterator);
    }
    debug!(sessions = sources.len(), num_metrics, presence_slots, "merging FTGS streams");

    let mut heap: BinaryHeap<Reverse<IterationState<T>>> = BinaryHeap::new();
    for (index, iterator) in iterators.iter_mut().enumerate() {
        let num_stats = iterator.num_stats().max(sources[index].metric_indexes.len());
        if let Some(state) = first_state(index, iterator.as_mut(), num_stats, need_stats)? {
            heap.push(Reverse(state));
        }
    }

    let mut buffer = vec![0i64; num_metrics + presence_slots];
    let mut popped: Vec<IterationState<T>> = Vec::with_capacity(sources.len());
    while let Some(Reverse(first)) = heap.pop() {
        buffer.iter_mut().for_each(|v| *v = 0);
        copy_stats(&sources[first.source], &first, &mut buffer);
        while heap.peek().is_some_and(|Reverse(next)| next.same_key(&first)) {
            if let Some(Reverse(tied)) = heap.pop() {
                copy_stats(&sources[tied.source], &tied, &mut buffer);
                popped.push(tied);
            }
        }
        emit(&first.term, &buffer, first.group)?;
        popped.push(first);
        for state in popped.drain(..) {
            let source = state.source;
            if let Some(next) = advance(state, iterators[source].as_mut(), need_stats)? {
                heap.push(Reverse(next));
            }
        }
    }
    Ok(())
}

fn copy_stats<T>(source: &MergeSource<'_>, state: &IterationState<T>, buffer: &mut [i64]) {
    for (value, index) in state.stats.iter().zip(&source.metric_indexes) {
        buffer[*index] = *value;
    }
    if let Some(presence) = source.presence_index {
        buffer[presence] = 1;
    }
}

pub fn iterate_multi_int(
    sources: &mut [MergeSource<'_>],
    num_metrics: usize,
    options: &IterateOptions,
    callback: &mut dyn IntIterateCallback,
) -> Result<()> {
    let need_sorted = callback.need_sorted();
    let need_stats = callback.need_stats();
    iterate_multi::<i64>(sources, num_metrics, options, need_sorted, need_stats, |term, stats, group| {
        callback.term(*term, stats, group)
    })
}

pub fn iterate_multi_string(
    sources: &mut [MergeSource<'_>],
    num_metrics: usize,
    options: &IterateOptions,
    callback: &mut dyn StringIterateCallback,
) -> Result<()> {
    let need_sorted = callback.need_sorted();
    let need_stats = callback.need_stats();
    iterate_multi::<String>(sources, num_metrics, options, need_sorted, need_stats, |term, stats, group| {
        callback.term(term, stats, group)
    })
}
