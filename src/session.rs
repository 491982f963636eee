//! The query orchestrator.
//!
//! A [`Session`] owns one remote session per dataset, the live group key set,
//! the pipeline depth and the statistics saved by earlier commands. Commands
//! run strictly in order and every per-session call is issued in dataset
//! insertion order. Remote sessions are closed on every exit path, including
//! drop.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use roaring::RoaringBitmap;
use tracing::{debug, info, info_span, warn};

use crate::actions::Scope;
use crate::aggregate::{AggregateFilter, AggregateMetric, MetricIndexes, QualifiedPush, TermRef};
use crate::commands::{Command, CommandOutput};
use crate::config::{EngineConfig, OutputFormat};
use crate::error::{Result, SquallError};
use crate::groupkeys::{ancestor_group, DumbGroupKeySet, KeySetRef, MaskingGroupKeySet};
use crate::merge::{iterate_multi, IterateOptions, MergeSource};
use crate::remote::{
    GroupMultiRemapRule, GroupStats, MarshaledRules, PerformanceStats, Query, QueryRemapRule, SessionBox,
};
use crate::timer::{Phase, TreeTimer};
use crate::NameHasher;

// ------------- Requests -------------
/// One dataset of a query and the time window requested for it.
#[derive(Debug, Clone)]
pub struct DatasetRequest {
    pub dataset: String,
    /// Name the dataset is referred to by in scopes and pushes.
    pub display_name: String,
    /// Epoch millis, inclusive.
    pub start: i64,
    /// Epoch millis, exclusive.
    pub end: i64,
    /// Alias to field name; aliases may chain.
    pub field_aliases: HashMap<String, String>,
}

impl DatasetRequest {
    pub fn new(dataset: &str, start: i64, end: i64) -> Self {
        Self {
            dataset: dataset.to_string(),
            display_name: dataset.to_string(),
            start,
            end,
            field_aliases: HashMap::new(),
        }
    }
    pub fn named(mut self, display_name: &str) -> Self {
        self.display_name = display_name.to_string();
        self
    }
    pub fn with_alias(mut self, alias: &str, field: &str) -> Self {
        self.field_aliases.insert(alias.to_string(), field.to_string());
        self
    }
}

/// What a [`SessionOpener`] hands back for one dataset.
pub struct OpenedSession {
    pub session: SessionBox,
    pub int_fields: Vec<String>,
    pub string_fields: Vec<String>,
    pub time_field: String,
    /// `[start, end)` covered by the opened shards; `None` when there are none.
    pub shard_range: Option<(i64, i64)>,
}

pub trait SessionOpener {
    fn open(&mut self, request: &DatasetRequest) -> Result<OpenedSession>;
}

/// A live remote session and what the engine knows about its dataset.
pub struct SessionInfo {
    pub session: SessionBox,
    pub dataset: String,
    pub int_fields: BTreeSet<String>,
    pub string_fields: BTreeSet<String>,
    pub start: i64,
    pub end: i64,
    pub time_field: String,
    pub shard_range: Option<(i64, i64)>,
    aliases: HashMap<String, String>,
}

impl SessionInfo {
    pub fn resolve_field(&self, field: &str) -> String {
        self.aliases.get(field).cloned().unwrap_or_else(|| field.to_string())
    }

    fn resolve_token(&self, token: &str) -> String {
        let (head, rest) = token.split_once(' ').unwrap_or((token, ""));
        match head {
            "hasint" | "hasstr" | "regex" => match rest.split_once(':') {
                Some((field, value)) => format!("{} {}:{}", head, self.resolve_field(field), value),
                None => token.to_string(),
            },
            "hasintfield" | "hasstrfield" | "len" => format!("{} {}", head, self.resolve_field(rest)),
            _ if rest.is_empty() => self.resolve_field(head),
            _ => token.to_string(),
        }
    }

    fn resolve_query(&self, query: &Query) -> Query {
        match query {
            Query::Term { field, term } => Query::Term { field: self.resolve_field(field), term: term.clone() },
            Query::Range { field, lower, upper, upper_inclusive } => Query::Range {
                field: self.resolve_field(field),
                lower: lower.clone(),
                upper: upper.clone(),
                upper_inclusive: *upper_inclusive,
            },
            Query::And(queries) => Query::And(queries.iter().map(|q| self.resolve_query(q)).collect()),
            Query::Or(queries) => Query::Or(queries.iter().map(|q| self.resolve_query(q)).collect()),
            Query::Not(q) => Query::Not(Box::new(self.resolve_query(q))),
        }
    }

    fn is_int_field(&self, field: &str) -> bool {
        self.int_fields.contains(&self.resolve_field(field))
    }

    fn has_field(&self, field: &str) -> bool {
        let real = self.resolve_field(field);
        self.int_fields.contains(&real) || self.string_fields.contains(&real)
    }

    /// Pushes `tokens` and returns the slot of the resulting stat.
    fn push_single(&mut self, tokens: &[String]) -> Result<usize> {
        let before = self.session.num_stats();
        let resolved: Vec<String> = tokens.iter().map(|t| self.resolve_token(t)).collect();
        let after = self.session.push_stats(&resolved)?;
        if after != before + 1 {
            return Err(SquallError::Invariant(format!(
                "pushes {:?} left {} stats instead of {}",
                tokens,
                after,
                before + 1
            )));
        }
        Ok(before)
    }
}

/// Resolves every alias to its final field name, rejecting cycles.
pub fn resolve_aliases(aliases: &HashMap<String, String>) -> Result<HashMap<String, String>> {
    let mut names: Vec<&String> = aliases.keys().collect();
    names.sort();
    let mut resolved = HashMap::with_capacity(aliases.len());
    for alias in names {
        let mut visiting = Vec::new();
        resolved.insert(alias.clone(), resolve_alias(aliases, alias, &mut visiting)?);
    }
    Ok(resolved)
}

fn resolve_alias(aliases: &HashMap<String, String>, field: &str, visiting: &mut Vec<String>) -> Result<String> {
    if visiting.iter().any(|v| v == field) {
        visiting.push(field.to_string());
        return Err(SquallError::FieldAlias(format!(
            "field alias has circular reference: {}",
            visiting.join(" -> ")
        )));
    }
    match aliases.get(field) {
        None => Ok(field.to_string()),
        Some(next) => {
            visiting.push(field.to_string());
            resolve_alias(aliases, next, visiting)
        }
    }
}

fn tag(name: &str, error: SquallError) -> SquallError {
    match error {
        SquallError::Remote { message, .. } => SquallError::remote(name, message),
        other => other,
    }
}

// ------------- Results -------------
/// A per-group statistic captured at some depth, for later named lookups.
#[derive(Debug, Clone)]
pub struct SavedGroupStats {
    pub depth: usize,
    pub stats: Arc<Vec<f64>>,
}

/// How saved stats of sibling groups combine when regrouping into the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupLookupMergeType {
    SumAll,
    TakeTheOneUniqueValue,
    FailIfPresent,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub rows: Vec<String>,
    /// `[metric][group]`, set when the last command produced a matrix.
    pub matrix: Option<Vec<Vec<f64>>>,
    pub temp_bytes_written: u64,
    pub timings: Phase,
    pub performance: Vec<(String, PerformanceStats)>,
}

/// Pushed stats: global slot of each push, and the global slots owned by each
/// session in the order they sit on its stack.
#[derive(Debug, Clone, Default)]
pub struct PushedMetrics {
    pub indexes: MetricIndexes,
    pub per_session: Vec<Vec<usize>>,
    pub num_metrics: usize,
}

// ------------- Session -------------
pub struct Session {
    sessions: Vec<(String, SessionInfo)>,
    key_set: KeySetRef,
    num_groups: usize,
    depth: usize,
    saved_stats: HashMap<String, SavedGroupStats, NameHasher>,
    group_limit: Option<usize>,
    options: Vec<String>,
    output_format: OutputFormat,
    timer: TreeTimer,
    closed: Vec<(String, PerformanceStats)>,
}

impl Session {
    /// Opens every dataset, runs `commands` and closes everything again.
    pub fn create(
        opener: &mut dyn SessionOpener,
        datasets: Vec<DatasetRequest>,
        commands: Vec<Command>,
        config: &EngineConfig,
    ) -> Result<QueryResult> {
        let started = Instant::now();
        let mut session = Session::open(opener, datasets, config)?;
        let outcome = session.run(commands);
        let num_groups = session.num_groups;
        let timings = session.timer.report();
        let performance = session.close();
        let output = outcome?;
        let temp_bytes_written = performance.iter().map(|(_, p)| p.temp_file_bytes_written).sum();
        info!(
            ms = started.elapsed().as_millis() as u64,
            groups = num_groups,
            temp_bytes = temp_bytes_written,
            "query complete"
        );
        let (rows, matrix) = match output {
            CommandOutput::Rows(rows) => (rows, None),
            CommandOutput::Matrix(matrix) => (Vec::new(), Some(matrix)),
            CommandOutput::Nothing => (Vec::new(), None),
        };
        Ok(QueryResult { rows, matrix, temp_bytes_written, timings, performance })
    }

    /// Opens one remote session per dataset and trims shards to the requested windows.
    pub fn open(opener: &mut dyn SessionOpener, datasets: Vec<DatasetRequest>, config: &EngineConfig) -> Result<Session> {
        let mut session = Session {
            sessions: Vec::with_capacity(datasets.len()),
            key_set: DumbGroupKeySet::empty(),
            num_groups: 1,
            depth: 0,
            saved_stats: HashMap::default(),
            group_limit: config.group_limit,
            options: config.options.clone(),
            output_format: config.output,
            timer: TreeTimer::new(),
            closed: Vec::new(),
        };
        session.timer.push("open sessions");
        for request in &datasets {
            if session.sessions.iter().any(|(name, _)| *name == request.display_name) {
                return Err(SquallError::Invariant(format!("dataset {} requested twice", request.display_name)));
            }
            let aliases = resolve_aliases(&request.field_aliases)?;
            let opened = opener.open(request).map_err(|e| tag(&request.display_name, e))?;
            debug!(dataset = %request.dataset, name = %request.display_name, shards = ?opened.shard_range, "opened session");
            session.sessions.push((
                request.display_name.clone(),
                SessionInfo {
                    session: opened.session,
                    dataset: request.dataset.clone(),
                    int_fields: opened.int_fields.into_iter().collect(),
                    string_fields: opened.string_fields.into_iter().collect(),
                    start: request.start,
                    end: request.end,
                    time_field: opened.time_field,
                    shard_range: opened.shard_range,
                    aliases,
                },
            ));
        }
        session.timer.pop();
        if !session.sessions.is_empty() && session.sessions.iter().all(|(_, info)| info.shard_range.is_none()) {
            let names: Vec<&str> = session.sessions.iter().map(|(name, _)| name.as_str()).collect();
            return Err(SquallError::NoData(format!("no shards found for {:?} in the requested time range", names)));
        }
        session.apply_shard_windows()?;
        Ok(session)
    }

    /// Drops documents of shards that stick out of the requested window.
    fn apply_shard_windows(&mut self) -> Result<()> {
        for (name, info) in self.sessions.iter_mut() {
            let Some((shard_start, shard_end)) = info.shard_range else { continue };
            if shard_start >= info.start && shard_end <= info.end {
                continue;
            }
            debug!(session = %name, shard_start, shard_end, start = info.start, end = info.end, "filtering to requested window");
            let stat = info.push_single(&[info.time_field.clone()]).map_err(|e| tag(name, e))?;
            info.session
                .metric_filter(stat, info.start.div_euclid(1000), (info.end - 1).div_euclid(1000), 1, 0, 1)
                .map_err(|e| tag(name, e))?;
            info.session.pop_stat().map_err(|e| tag(name, e))?;
        }
        Ok(())
    }

    pub fn run(&mut self, commands: Vec<Command>) -> Result<CommandOutput> {
        let total = commands.len();
        let mut output = CommandOutput::Nothing;
        for (index, mut command) in commands.into_iter().enumerate() {
            if self.num_groups == 0 {
                debug!(skipped = total - index, "no groups left");
                output = CommandOutput::Rows(Vec::new());
                break;
            }
            output = self.run_command(&mut command)?;
        }
        Ok(output)
    }

    pub fn run_command(&mut self, command: &mut Command) -> Result<CommandOutput> {
        let span = info_span!("command", name = command.name(), groups = self.num_groups);
        let _entered = span.enter();
        self.timer.push(command.name());
        let output = command.execute(self);
        self.timer.pop();
        debug!(groups = self.num_groups, depth = self.depth, "command done");
        output
    }

    /// Closes every remote session still open. Close failures are logged.
    pub fn close(&mut self) -> Vec<(String, PerformanceStats)> {
        for (name, mut info) in self.sessions.drain(..) {
            match info.session.close_and_get_performance_stats() {
                Ok(stats) => self.closed.push((name, stats)),
                Err(e) => warn!(session = %name, error = %e, "failed to close session"),
            }
        }
        std::mem::take(&mut self.closed)
    }

    // ------------- State -------------
    pub fn num_groups(&self) -> usize {
        self.num_groups
    }
    pub fn depth(&self) -> usize {
        self.depth
    }
    pub fn key_set(&self) -> &KeySetRef {
        &self.key_set
    }
    pub fn output_format(&self) -> OutputFormat {
        self.output_format
    }
    pub fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|o| o.eq_ignore_ascii_case(option))
    }
    pub fn timer_mut(&mut self) -> &mut TreeTimer {
        &mut self.timer
    }
    pub fn dataset_names(&self) -> Vec<String> {
        self.sessions.iter().map(|(name, _)| name.clone()).collect()
    }
    pub fn all_datasets(&self) -> Scope {
        self.sessions.iter().map(|(name, _)| name.clone()).collect()
    }
    /// Datasets of `scope`, in insertion order.
    pub fn datasets_in(&self, scope: &Scope) -> Vec<String> {
        self.sessions.iter().filter(|(name, _)| scope.contains(name)).map(|(name, _)| name.clone()).collect()
    }
    pub fn session_info(&self, dataset: &str) -> Option<&SessionInfo> {
        self.sessions.iter().find(|(name, _)| name == dataset).map(|(_, info)| info)
    }
    pub fn is_int_field(&self, dataset: &str, field: &str) -> bool {
        self.session_info(dataset).is_some_and(|info| info.is_int_field(field))
    }
    pub fn has_saved_stats_at_depth(&self) -> bool {
        self.saved_stats.values().any(|s| s.depth == self.depth)
    }
    pub fn saved_stats(&self, name: &str) -> Option<&SavedGroupStats> {
        self.saved_stats.get(name)
    }

    fn info_mut(&mut self, dataset: &str) -> Result<&mut SessionInfo> {
        self.sessions
            .iter_mut()
            .find(|(name, _)| name == dataset)
            .map(|(_, info)| info)
            .ok_or_else(|| SquallError::Invariant(format!("no session for dataset {}", dataset)))
    }

    fn in_scope<'a>(&'a mut self, scope: &'a Scope) -> impl Iterator<Item = &'a mut (String, SessionInfo)> + 'a {
        self.sessions.iter_mut().filter(move |entry| scope.contains(&entry.0))
    }

    // ------------- Groups -------------
    pub fn check_group_limit(&self, num_groups: usize) -> Result<()> {
        let checked = self.check_group_limit_without_log(num_groups);
        if let Err(e) = &checked {
            warn!(num_groups, limit = ?self.group_limit, "{}", e);
        }
        checked
    }

    pub fn check_group_limit_without_log(&self, num_groups: usize) -> Result<()> {
        match self.group_limit {
            Some(limit) if num_groups > limit => Err(SquallError::GroupLimitExceeded { num_groups, limit }),
            _ => Ok(()),
        }
    }

    /// Installs `key_set` as a new stage without checking group presence.
    pub fn assume_dense(&mut self, key_set: KeySetRef) {
        self.num_groups = key_set.num_groups();
        self.key_set = key_set;
        self.depth += 1;
        debug!(groups = self.num_groups, depth = self.depth, "installed group key set");
    }

    /// Installs `key_set` as a new stage, masking groups no session has documents in.
    pub fn densify(&mut self, key_set: KeySetRef) -> Result<()> {
        self.timer.push("densify");
        let num_groups = key_set.num_groups();
        let mut mask = RoaringBitmap::new();
        for (name, info) in self.sessions.iter_mut() {
            let stat = info.push_single(&["count()".to_string()]).map_err(|e| tag(name, e))?;
            let counts = info.session.get_group_stats(stat).map_err(|e| tag(name, e))?;
            info.session.pop_stat().map_err(|e| tag(name, e))?;
            for (group, count) in counts.iter().enumerate().take(num_groups + 1).skip(1) {
                if *count > 0 {
                    let group = u32::try_from(group)
                        .map_err(|_| SquallError::Invariant(format!("group {} does not fit a bitmap", group)))?;
                    mask.insert(group);
                }
            }
        }
        self.timer.pop();
        debug!(groups = num_groups, present = mask.len(), "densified");
        self.assume_dense(Arc::new(MaskingGroupKeySet::new(key_set, mask)));
        Ok(())
    }

    /// Replaces the current stage's key set after its groups were renumbered,
    /// keeping the depth. `old_groups[new]` is the group each new one came from.
    pub fn renumber_groups(&mut self, key_set: KeySetRef, old_groups: &[usize]) {
        let depth = self.depth;
        for saved in self.saved_stats.values_mut().filter(|s| s.depth == depth) {
            let stats: Vec<f64> = old_groups.iter().map(|old| saved.stats.get(*old).copied().unwrap_or_default()).collect();
            saved.stats = Arc::new(stats);
        }
        self.num_groups = key_set.num_groups();
        self.key_set = key_set;
    }

    /// Buckets every group by time. Returns the new group count: the
    /// theoretical maximum, or the largest count any session reports when
    /// `delete_empty_groups` is set.
    pub fn perform_time_regroup(
        &mut self,
        start: i64,
        end: i64,
        unit_millis: i64,
        field_override: Option<&str>,
        is_relative: bool,
        delete_empty_groups: bool,
    ) -> Result<usize> {
        if unit_millis < 1000 {
            return Err(SquallError::parse(format!("time bucket of {}ms is shorter than a second", unit_millis)));
        }
        let span = if is_relative { self.get_longest_session_distance() } else { end - start };
        let max_groups = (self.num_groups as f64 * (span as f64 / unit_millis as f64).ceil()) as usize;
        self.check_group_limit(max_groups)?;
        let mut observed = 0;
        for (name, info) in self.sessions.iter_mut() {
            let field = match field_override {
                Some(field) => info.resolve_field(field),
                None => info.time_field.clone(),
            };
            let (real_start, real_end) = if is_relative { (info.start, info.start + span) } else { (start, end) };
            let stat = info.push_single(&[field]).map_err(|e| tag(name, e))?;
            let groups = info
                .session
                .metric_regroup(stat, real_start.div_euclid(1000), real_end.div_euclid(1000), unit_millis / 1000, true)
                .map_err(|e| tag(name, e))?;
            info.session.pop_stat().map_err(|e| tag(name, e))?;
            observed = observed.max(groups);
        }
        Ok(if delete_empty_groups { observed.min(max_groups) } else { max_groups })
    }

    /// Routes each session's documents through a metric range regroup on `pushes`.
    pub fn metric_regroup(
        &mut self,
        pushes_of: &dyn Fn(&str) -> Result<Vec<String>>,
        min: i64,
        max: i64,
        interval: i64,
        no_gutters: bool,
    ) -> Result<usize> {
        let mut observed = 0;
        for (name, info) in self.sessions.iter_mut() {
            let pushes = pushes_of(name.as_str())?;
            let stat = info.push_single(&pushes).map_err(|e| tag(name, e))?;
            let groups = info.session.metric_regroup(stat, min, max, interval, no_gutters).map_err(|e| tag(name, e))?;
            info.session.pop_stat().map_err(|e| tag(name, e))?;
            observed = observed.max(groups);
        }
        Ok(observed)
    }

    pub fn remap_group(&mut self, target: usize, new_group: usize, scope: &Scope) -> Result<()> {
        self.remap_groups(&[target], &[new_group], false, scope).map(|_| ())
    }

    pub fn remap_groups(&mut self, from: &[usize], to: &[usize], filter_untargeted: bool, scope: &Scope) -> Result<usize> {
        let mut observed = 0;
        for (name, info) in self.in_scope(scope) {
            observed = observed.max(info.session.remap(from, to, filter_untargeted).map_err(|e| tag(name, e))?);
        }
        Ok(observed)
    }

    pub fn int_or_regroup(
        &mut self,
        field: &str,
        terms: &[i64],
        target: usize,
        negative: usize,
        positive: usize,
        scope: &Scope,
    ) -> Result<()> {
        for (name, info) in self.in_scope(scope) {
            let real = info.resolve_field(field);
            info.session.int_or_regroup(&real, terms, target, negative, positive).map_err(|e| tag(name, e))?;
        }
        Ok(())
    }

    pub fn string_or_regroup(
        &mut self,
        field: &str,
        terms: &[String],
        target: usize,
        negative: usize,
        positive: usize,
        scope: &Scope,
    ) -> Result<()> {
        for (name, info) in self.in_scope(scope) {
            let real = info.resolve_field(field);
            info.session.string_or_regroup(&real, terms, target, negative, positive).map_err(|e| tag(name, e))?;
        }
        Ok(())
    }

    pub fn regex_regroup(
        &mut self,
        field: &str,
        regex: &str,
        target: usize,
        negative: usize,
        positive: usize,
        scope: &Scope,
    ) -> Result<()> {
        for (name, info) in self.in_scope(scope) {
            let real = info.resolve_field(field);
            info.session.regex_regroup(&real, regex, target, negative, positive).map_err(|e| tag(name, e))?;
        }
        Ok(())
    }

    pub fn random_regroup(
        &mut self,
        field: &str,
        seed: &str,
        probability: f64,
        target: usize,
        negative: usize,
        positive: usize,
        scope: &Scope,
    ) -> Result<()> {
        for (name, info) in self.in_scope(scope) {
            let real = info.resolve_field(field);
            let is_int = info.int_fields.contains(&real);
            info.session
                .random_regroup(&real, is_int, seed, probability, target, negative, positive)
                .map_err(|e| tag(name, e))?;
        }
        Ok(())
    }

    pub fn query_regroup(&mut self, query: &Query, target: usize, negative: usize, positive: usize, scope: &Scope) -> Result<()> {
        for (name, info) in self.in_scope(scope) {
            let rule = QueryRemapRule { target, query: info.resolve_query(query), negative, positive };
            info.session.query_regroup(&rule).map_err(|e| tag(name, e))?;
        }
        Ok(())
    }

    /// Keeps documents of `target` whose metric lies in `[min, max]` in `positive`.
    pub fn metric_filter(
        &mut self,
        dataset: &str,
        pushes: &[String],
        min: i64,
        max: i64,
        target: usize,
        negative: usize,
        positive: usize,
    ) -> Result<()> {
        let info = self.info_mut(dataset)?;
        let stat = info.push_single(pushes).map_err(|e| tag(dataset, e))?;
        info.session.metric_filter(stat, min, max, target, negative, positive).map_err(|e| tag(dataset, e))?;
        info.session.pop_stat().map_err(|e| tag(dataset, e))?;
        Ok(())
    }

    /// Applies `rules` on every session, marshaled once. Untargeted groups go to 0.
    pub fn regroup_all(&mut self, rules: &[GroupMultiRemapRule], error_on_collisions: bool) -> Result<usize> {
        let marshaled = MarshaledRules::marshal(rules)?;
        let mut observed = 0;
        for (name, info) in self.sessions.iter_mut() {
            observed = observed.max(info.session.regroup_marshaled(&marshaled, error_on_collisions).map_err(|e| tag(name, e))?);
        }
        Ok(observed)
    }

    /// Applies rules whose conditions all test `field`. The rule set is
    /// marshaled once per distinct real field name: once overall when no
    /// dataset aliases the field differently.
    pub fn regroup_with_single_field_rules(
        &mut self,
        field: &str,
        rules: &[GroupMultiRemapRule],
        error_on_collisions: bool,
    ) -> Result<usize> {
        let mut by_real_field: HashMap<String, MarshaledRules, NameHasher> = HashMap::default();
        for (_, info) in self.sessions.iter() {
            let real = info.resolve_field(field);
            if by_real_field.contains_key(&real) {
                continue;
            }
            let renamed: Vec<GroupMultiRemapRule> = rules
                .iter()
                .map(|rule| {
                    let mut rule = rule.clone();
                    for condition in rule.conditions.iter_mut().filter(|c| c.field == field) {
                        condition.field = real.clone();
                    }
                    rule
                })
                .collect();
            by_real_field.insert(real, MarshaledRules::marshal(&renamed)?);
        }
        if by_real_field.len() == 1 {
            debug!(field, rules = rules.len(), "regrouping with cached rules");
        } else {
            debug!(field, rules = rules.len(), fields = by_real_field.len(), "regrouping with per-field rules");
        }
        let mut observed = 0;
        for (name, info) in self.sessions.iter_mut() {
            let marshaled = by_real_field
                .get(&info.resolve_field(field))
                .ok_or_else(|| SquallError::Invariant(format!("no rules marshaled for {}", name)))?;
            observed = observed.max(info.session.regroup_marshaled(marshaled, error_on_collisions).map_err(|e| tag(name, e))?);
        }
        Ok(observed)
    }

    /// Moves every group into its parent, folding saved stats of the current
    /// depth with `merge`.
    pub fn regroup_into_parent(&mut self, merge: GroupLookupMergeType) -> Result<()> {
        let Some(previous) = self.key_set.previous().cloned() else {
            return Err(SquallError::Invariant("cannot regroup into the parent of the root stage".to_string()));
        };
        let parent_groups = previous.num_groups();
        let depth = self.depth;
        for (name, saved) in self.saved_stats.iter_mut().filter(|(_, s)| s.depth == depth) {
            let mut merged: Vec<Option<f64>> = vec![None; parent_groups + 1];
            for group in 1..=self.num_groups {
                let Some(value) = saved.stats.get(group).copied() else { continue };
                let parent = self.key_set.parent_group(group);
                let slot = &mut merged[parent];
                *slot = Some(match (merge, *slot) {
                    (_, None) => value,
                    (GroupLookupMergeType::SumAll, Some(acc)) => acc + value,
                    (GroupLookupMergeType::TakeTheOneUniqueValue, Some(acc)) => {
                        if acc == value { acc } else { f64::NAN }
                    }
                    (GroupLookupMergeType::FailIfPresent, Some(_)) => {
                        return Err(SquallError::Execution(format!(
                            "saved stats {} have several values for parent group {}",
                            name, parent
                        )));
                    }
                });
            }
            *saved = SavedGroupStats {
                depth: depth - 1,
                stats: Arc::new(merged.into_iter().map(|v| v.unwrap_or_default()).collect()),
            };
        }
        let rules: Vec<GroupMultiRemapRule> = (1..=self.num_groups)
            .filter(|g| self.key_set.is_present(*g))
            .map(|g| GroupMultiRemapRule::unconditional(g, self.key_set.parent_group(g)))
            .collect();
        self.regroup_all(&rules, true)?;
        self.key_set = previous;
        self.num_groups = parent_groups;
        self.depth -= 1;
        Ok(())
    }

    // ------------- Saved stats -------------
    pub fn save_group_stats(&mut self, name: &str, stats: Vec<f64>) {
        debug!(name, depth = self.depth, "saving group stats");
        self.saved_stats.insert(name.to_string(), SavedGroupStats { depth: self.depth, stats: Arc::new(stats) });
    }

    /// A saved stat aligned to the current depth through the parent chain.
    pub fn named_metric_lookup(&self, name: &str) -> Result<Arc<Vec<f64>>> {
        let saved = self
            .saved_stats
            .get(name)
            .ok_or_else(|| SquallError::Execution(format!("no saved group stats named {}", name)))?;
        if saved.depth > self.depth {
            return Err(SquallError::Invariant(format!(
                "stats {} saved at depth {} looked up at depth {}",
                name, saved.depth, self.depth
            )));
        }
        let levels = self.depth - saved.depth;
        if levels == 0 {
            return Ok(Arc::clone(&saved.stats));
        }
        let mut aligned = vec![0.0; self.num_groups + 1];
        for (group, value) in aligned.iter_mut().enumerate().skip(1) {
            let ancestor = ancestor_group(self.key_set.as_ref(), group, levels);
            *value = saved.stats.get(ancestor).copied().unwrap_or_default();
        }
        Ok(Arc::new(aligned))
    }

    // ------------- Metrics -------------
    /// Pushes every requested stat; slots are assigned in sorted push order.
    pub fn push_metrics(&mut self, requires: &HashSet<QualifiedPush>) -> Result<PushedMetrics> {
        let mut ordered: Vec<&QualifiedPush> = requires.iter().collect();
        ordered.sort();
        let mut pushed = PushedMetrics { per_session: vec![Vec::new(); self.sessions.len()], ..Default::default() };
        for push in ordered {
            let position = self
                .sessions
                .iter()
                .position(|(name, _)| *name == push.session_name)
                .ok_or_else(|| SquallError::Invariant(format!("metric pushed to unknown dataset {}", push.session_name)))?;
            let (name, info) = &mut self.sessions[position];
            info.push_single(&push.pushes).map_err(|e| tag(name, e))?;
            pushed.per_session[position].push(pushed.num_metrics);
            pushed.indexes.insert(push.clone(), pushed.num_metrics);
            pushed.num_metrics += 1;
        }
        Ok(pushed)
    }

    pub fn pop_stats(&mut self) -> Result<()> {
        for (name, info) in self.sessions.iter_mut() {
            while info.session.num_stats() > 0 {
                info.session.pop_stat().map_err(|e| tag(name, e))?;
            }
        }
        Ok(())
    }

    /// Pushes `requires`, runs `f`, and pops everything again.
    pub fn with_pushed<T>(
        &mut self,
        requires: &HashSet<QualifiedPush>,
        f: impl FnOnce(&mut Session, &PushedMetrics) -> Result<T>,
    ) -> Result<T> {
        let result = self.push_metrics(requires).and_then(|pushed| f(self, &pushed));
        let popped = self.pop_stats();
        let value = result?;
        popped?;
        Ok(value)
    }

    pub fn register_metrics(&self, metrics: &mut [AggregateMetric], indexes: &MetricIndexes) -> Result<()> {
        for metric in metrics.iter_mut() {
            metric.bind_lookups(&mut |name| self.named_metric_lookup(name))?;
            metric.register(indexes, &self.key_set)?;
        }
        Ok(())
    }

    pub fn register_filter(&self, filter: &mut AggregateFilter, indexes: &MetricIndexes) -> Result<()> {
        filter.bind_lookups(&mut |name| self.named_metric_lookup(name))?;
        filter.register(indexes, &self.key_set)
    }

    /// `[slot][group]` for every pushed stat; slots of absent groups stay 0.
    pub fn compute_group_stats(&mut self, pushed: &PushedMetrics) -> Result<Vec<GroupStats>> {
        self.timer.push("group stats");
        let mut matrix = vec![vec![0i64; self.num_groups + 1]; pushed.num_metrics];
        for (index, (name, info)) in self.sessions.iter_mut().enumerate() {
            for (local, global) in pushed.per_session[index].iter().enumerate() {
                let stats = info.session.get_group_stats(local).map_err(|e| tag(name, e))?;
                for (slot, value) in matrix[*global].iter_mut().zip(stats) {
                    *slot = value;
                }
            }
        }
        self.timer.pop();
        Ok(matrix)
    }

    /// Streams the merged (term, group, stats) rows of `field` over every
    /// dataset that has it.
    pub fn iterate_field(
        &mut self,
        field: &str,
        pushed: &PushedMetrics,
        options: &IterateOptions,
        need_sorted: bool,
        need_stats: bool,
        emit: impl FnMut(TermRef<'_>, &[i64], usize) -> Result<()>,
    ) -> Result<()> {
        self.iterate_field_in(field, None, pushed, options, need_sorted, need_stats, emit)
    }

    /// Like [`Session::iterate_field`], restricted to the datasets in `scope`.
    #[allow(clippy::too_many_arguments)]
    pub fn iterate_field_in(
        &mut self,
        field: &str,
        scope: Option<&Scope>,
        pushed: &PushedMetrics,
        options: &IterateOptions,
        need_sorted: bool,
        need_stats: bool,
        mut emit: impl FnMut(TermRef<'_>, &[i64], usize) -> Result<()>,
    ) -> Result<()> {
        let (mut int_sources, mut string_sources) = (0, 0);
        let mut sources: Vec<MergeSource<'_>> = Vec::new();
        for (index, (name, info)) in self.sessions.iter_mut().enumerate() {
            if !info.has_field(field) || scope.is_some_and(|scope| !scope.contains(name.as_str())) {
                continue;
            }
            if info.is_int_field(field) {
                int_sources += 1;
            } else {
                string_sources += 1;
            }
            let real = info.resolve_field(field);
            sources.push(MergeSource {
                name: name.as_str(),
                session: info.session.as_mut(),
                field: real,
                metric_indexes: pushed.per_session[index].clone(),
                presence_index: None,
            });
        }
        if int_sources > 0 && string_sources > 0 {
            return Err(SquallError::Unsupported(format!(
                "field {} is an int field in some datasets and a string field in others",
                field
            )));
        }
        self.timer.push("iterate");
        let merged = if int_sources > 0 {
            iterate_multi::<i64>(&mut sources, pushed.num_metrics, options, need_sorted, need_stats, |term, stats, group| {
                emit(TermRef::Int(*term), stats, group)
            })
        } else if string_sources > 0 {
            iterate_multi::<String>(&mut sources, pushed.num_metrics, options, need_sorted, need_stats, |term, stats, group| {
                emit(TermRef::Str(term), stats, group)
            })
        } else {
            Ok(())
        };
        drop(sources);
        self.timer.pop();
        merged
    }

    /// Distinct term counts per group for one dataset, index 0 unused.
    pub fn get_simple_distinct(&mut self, dataset: &str, field: &str) -> Result<Vec<i64>> {
        let num_groups = self.num_groups;
        let info = self.info_mut(dataset)?;
        let real = info.resolve_field(field);
        let is_int = info.int_fields.contains(&real);
        let counts = info.session.get_distinct(&real, is_int).map_err(|e| tag(dataset, e))?;
        let mut result: Vec<i64> = counts.take(num_groups + 1).collect();
        result.resize(num_groups + 1, 0);
        result[0] = 0;
        Ok(result)
    }

    /// For each percentile, the first term per group at which the running
    /// document count reaches that share of the group's total.
    pub fn get_percentiles(&mut self, field: &str, percentiles: &[f64]) -> Result<Vec<Vec<i64>>> {
        let requires: HashSet<QualifiedPush> = self
            .sessions
            .iter()
            .filter(|(_, info)| info.has_field(field))
            .map(|(name, _)| QualifiedPush::new(name, vec!["count()".to_string()]))
            .collect();
        let num_groups = self.num_groups;
        self.with_pushed(&requires, |session, pushed| {
            let stats = session.compute_group_stats(pushed)?;
            let totals: Vec<f64> = (0..=num_groups).map(|g| stats.iter().map(|s| s[g] as f64).sum::<f64>()).collect();
            let mut running = vec![0.0; num_groups + 1];
            let mut result = vec![vec![0i64; num_groups + 1]; percentiles.len()];
            let mut reached = vec![vec![false; num_groups + 1]; percentiles.len()];
            session.iterate_field(field, pushed, &IterateOptions::default(), true, true, |term, stats, group| {
                let TermRef::Int(term) = term else {
                    return Err(SquallError::Unsupported("percentiles need an int field".to_string()));
                };
                running[group] += stats.iter().map(|v| *v as f64).sum::<f64>();
                for (p, percentile) in percentiles.iter().enumerate() {
                    if !reached[p][group] && running[group] >= totals[group] * percentile / 100.0 {
                        reached[p][group] = true;
                        result[p][group] = term;
                    }
                }
                Ok(())
            })?;
            Ok(result)
        })
    }

    // ------------- Time -------------
    pub fn get_earliest_start(&self) -> i64 {
        self.sessions.iter().map(|(_, info)| info.start).min().unwrap_or_default()
    }
    pub fn get_latest_end(&self) -> i64 {
        self.sessions.iter().map(|(_, info)| info.end).max().unwrap_or_default()
    }
    pub fn get_longest_session_distance(&self) -> i64 {
        self.sessions.iter().map(|(_, info)| info.end - info.start).max().unwrap_or_default()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("datasets", &self.sessions.iter().map(|(name, _)| name).collect::<Vec<_>>())
            .field("num_groups", &self.num_groups)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.sessions.is_empty() {
            self.close();
        }
    }
}

/// The start value of each of `k` equal-count buckets over `values`. The
/// first start is the smallest value.
pub fn bucket_starts(values: &[f64], k: usize) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let Some(last) = sorted.len().checked_sub(1) else {
        return Vec::new();
    };
    (0..k)
        .map(|i| {
            let index = (sorted.len() as f64 * i as f64 / k as f64).ceil() as usize;
            sorted[index.min(last)]
        })
        .collect()
}

/// Bucket of `v` given ascending bucket starts. A value equal to a start
/// stays in the bucket before it.
pub fn find_percentile(v: f64, starts: &[f64]) -> usize {
    starts.iter().skip(1).position(|start| v <= *start).unwrap_or(starts.len().saturating_sub(1))
}

pub fn prepend_zero(values: &[i64]) -> Vec<i64> {
    std::iter::once(0).chain(values.iter().copied()).collect()
}
