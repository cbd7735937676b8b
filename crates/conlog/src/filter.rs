//! Visible-row projection over an [`EntryStore`].
//!
//! This module provides:
//! - [`FilterState`] — The active predicates and toggles
//! - [`project`] — Pure function from (store, filter, collapse) to rows and
//!   tag histogram
//! - [`FilterEngine`] — Memoizing wrapper around [`project`] with search
//!   debouncing and dirty tracking
//!
//! Predicates are checked cheapest first and stop at the first failure:
//! severity, message number, sequence, timestamp, search, then tags. The tag
//! histogram is collected after every non-tag predicate, so it shows what
//! including or excluding a tag would do.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Display;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{ConsoleError, Result};
use crate::store::EntryStore;
use crate::types::{Entry, FilteredRow, Severity};

/// Inclusive range with optional bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueRange<T> {
    min: Option<T>,
    max: Option<T>,
}

impl<T> Default for ValueRange<T> {
    fn default() -> Self {
        Self {
            min: None,
            max: None,
        }
    }
}

impl<T: PartialOrd + Display> ValueRange<T> {
    /// Builds a range, rejecting `min > max`.
    ///
    /// # Errors
    ///
    /// Returns [`ConsoleError::InvalidRange`] naming `field` when both bounds
    /// are set and `min` exceeds `max`.
    pub fn new(field: &'static str, min: Option<T>, max: Option<T>) -> Result<Self> {
        if let (Some(lo), Some(hi)) = (&min, &max) {
            if lo > hi {
                return Err(ConsoleError::InvalidRange {
                    field,
                    reason: format!("min {lo} is greater than max {hi}"),
                });
            }
        }
        Ok(Self { min, max })
    }

    /// True if `value` lies within both bounds.
    pub fn contains(&self, value: &T) -> bool {
        self.min.as_ref().is_none_or(|lo| value >= lo)
            && self.max.as_ref().is_none_or(|hi| value <= hi)
    }

    /// True if neither bound is set.
    pub const fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    /// Lower bound.
    pub const fn min(&self) -> Option<&T> {
        self.min.as_ref()
    }

    /// Upper bound.
    pub const fn max(&self) -> Option<&T> {
        self.max.as_ref()
    }
}

/// How a tag participates in filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagMode {
    /// No effect.
    Neutral,
    /// Entries must carry at least one included tag.
    Include,
    /// Entries carrying this tag are hidden.
    Exclude,
}

/// The active predicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterState {
    search: String,
    regex: bool,
    timestamps: ValueRange<String>,
    numbers: ValueRange<u32>,
    sequences: ValueRange<u64>,
    hidden_severities: BTreeSet<Severity>,
    // lowercase tag keys
    included_tags: BTreeSet<String>,
    excluded_tags: BTreeSet<String>,
}

impl Default for FilterState {
    fn default() -> Self {
        Self {
            search: String::new(),
            regex: false,
            timestamps: ValueRange::default(),
            numbers: ValueRange::default(),
            sequences: ValueRange::default(),
            hidden_severities: BTreeSet::new(),
            included_tags: BTreeSet::new(),
            excluded_tags: BTreeSet::new(),
        }
    }
}

impl FilterState {
    /// Creates a filter that shows everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the committed search text.
    #[must_use]
    pub fn with_search(mut self, text: impl Into<String>) -> Self {
        self.search = text.into();
        self
    }

    /// Interprets the search text as a regular expression.
    #[must_use]
    pub const fn with_regex(mut self, regex: bool) -> Self {
        self.regex = regex;
        self
    }

    /// Hides a severity.
    #[must_use]
    pub fn hiding(mut self, severity: Severity) -> Self {
        self.hidden_severities.insert(severity);
        self
    }

    /// Sets a tag's mode.
    #[must_use]
    pub fn with_tag(mut self, tag: &str, mode: TagMode) -> Self {
        self.set_tag_mode(tag, mode);
        self
    }

    /// Committed search text.
    #[must_use]
    pub fn search(&self) -> &str {
        &self.search
    }

    /// Whether search is a regular expression.
    #[must_use]
    pub const fn regex(&self) -> bool {
        self.regex
    }

    /// Timestamp range.
    #[must_use]
    pub const fn timestamps(&self) -> &ValueRange<String> {
        &self.timestamps
    }

    /// Message number range.
    #[must_use]
    pub const fn numbers(&self) -> &ValueRange<u32> {
        &self.numbers
    }

    /// Sequence range.
    #[must_use]
    pub const fn sequences(&self) -> &ValueRange<u64> {
        &self.sequences
    }

    /// Whether entries of `severity` are shown.
    #[must_use]
    pub fn severity_visible(&self, severity: Severity) -> bool {
        !self.hidden_severities.contains(&severity)
    }

    /// Mode of a tag (case-insensitive).
    #[must_use]
    pub fn tag_mode(&self, tag: &str) -> TagMode {
        let key = tag.to_lowercase();
        if self.included_tags.contains(&key) {
            TagMode::Include
        } else if self.excluded_tags.contains(&key) {
            TagMode::Exclude
        } else {
            TagMode::Neutral
        }
    }

    fn set_tag_mode(&mut self, tag: &str, mode: TagMode) -> bool {
        let key = tag.to_lowercase();
        let before = self.tag_mode(&key);
        self.included_tags.remove(&key);
        self.excluded_tags.remove(&key);
        match mode {
            TagMode::Include => {
                self.included_tags.insert(key);
            }
            TagMode::Exclude => {
                self.excluded_tags.insert(key);
            }
            TagMode::Neutral => {}
        }
        before != mode
    }

    /// Checks that the search text can be applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConsoleError::InvalidPattern`] when regex mode is on and the
    /// search text does not compile.
    pub fn validate_search(&self) -> Result<()> {
        if self.regex && !self.search.is_empty() {
            Regex::new(&self.search).map_err(|e| {
                ConsoleError::InvalidPattern(format!("search '{}': {e}", self.search))
            })?;
        }
        Ok(())
    }

    fn passes_non_tag(&self, entry: &Entry, search: &SearchMatcher) -> bool {
        self.severity_visible(entry.severity)
            && self.numbers.contains(&entry.number)
            && self.sequences.contains(&entry.sequence)
            && self.timestamps.contains(&entry.timestamp)
            && search.matches(&entry.content)
    }

    fn passes_tags(&self, entry: &Entry) -> bool {
        if !self.included_tags.is_empty()
            && !self.included_tags.iter().any(|t| entry.tags.contains_key(t))
        {
            return false;
        }
        !self.excluded_tags.iter().any(|t| entry.tags.contains_key(t))
    }
}

/// Compiled form of the committed search.
#[derive(Debug, Clone)]
enum SearchMatcher {
    All,
    Literal(String),
    Regex(Regex),
    // An invalid regex matches nothing.
    Invalid,
}

impl SearchMatcher {
    fn compile(state: &FilterState) -> Self {
        if state.search.is_empty() {
            return Self::All;
        }
        if !state.regex {
            return Self::Literal(state.search.to_lowercase());
        }
        match Regex::new(&state.search) {
            Ok(re) => Self::Regex(re),
            Err(e) => {
                warn!(pattern = %state.search, error = %e, "invalid search regex, nothing matches");
                Self::Invalid
            }
        }
    }

    fn matches(&self, content: &str) -> bool {
        match self {
            Self::All => true,
            Self::Literal(needle) => content.to_lowercase().contains(needle.as_str()),
            Self::Regex(re) => re.is_match(content),
            Self::Invalid => false,
        }
    }
}

/// Occurrences of one tag among the entries passing the non-tag predicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagCount {
    /// Tag as first spelled.
    pub name: String,
    /// Sum of repeat counts of entries carrying it.
    pub count: usize,
}

/// Rows and histogram computed together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    /// Visible rows, in order.
    pub rows: Vec<FilteredRow>,
    /// Tag histogram, ordered by case-insensitive name.
    pub histogram: Vec<TagCount>,
}

/// Computes the projection from scratch.
#[must_use]
pub fn project(store: &EntryStore, filter: &FilterState, collapse: bool) -> Projection {
    project_with(store, filter, &SearchMatcher::compile(filter), collapse)
}

fn project_with(
    store: &EntryStore,
    filter: &FilterState,
    search: &SearchMatcher,
    collapse: bool,
) -> Projection {
    let mut rows = Vec::new();
    let mut histogram: BTreeMap<&str, (&str, usize)> = BTreeMap::new();
    // (content, detail, severity) -> position in `rows`
    let mut groups: HashMap<(&str, &str, Severity), usize> = HashMap::new();

    for (index, entry) in store.iter().enumerate() {
        if !filter.passes_non_tag(entry, search) {
            continue;
        }
        let repeats = entry.repeat_count as usize;
        for (key, name) in entry.tags.iter() {
            histogram.entry(key).or_insert((name, 0)).1 += repeats;
        }
        if !filter.passes_tags(entry) {
            continue;
        }

        if collapse {
            let key = (entry.content.as_str(), entry.detail.as_str(), entry.severity);
            match groups.get(&key) {
                Some(&row) => {
                    let group: &mut FilteredRow = &mut rows[row];
                    group.display_count = group.display_count.saturating_add(entry.repeat_count);
                }
                None => {
                    groups.insert(key, rows.len());
                    rows.push(FilteredRow {
                        entry_index: index,
                        display_count: entry.repeat_count,
                    });
                }
            }
        } else {
            for _ in 0..entry.repeat_count {
                rows.push(FilteredRow {
                    entry_index: index,
                    display_count: 1,
                });
            }
        }
    }

    Projection {
        rows,
        histogram: histogram
            .into_values()
            .map(|(name, count)| TagCount {
                name: name.to_string(),
                count,
            })
            .collect(),
    }
}

/// Holds raw search input until it has been stable for the quiet period.
#[derive(Debug, Clone)]
pub struct SearchDebounce {
    quiet: Duration,
    pending: Option<(String, Instant)>,
}

impl SearchDebounce {
    /// Creates a debouncer with the given quiet period.
    #[must_use]
    pub const fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            pending: None,
        }
    }

    /// Records new input, restarting the quiet period.
    pub fn input(&mut self, text: impl Into<String>, now: Instant) {
        self.pending = Some((text.into(), now));
    }

    /// Returns the pending input once the quiet period has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<String> {
        let ready = self
            .pending
            .as_ref()
            .is_some_and(|(_, at)| now.saturating_duration_since(*at) >= self.quiet);
        if ready {
            self.pending.take().map(|(text, _)| text)
        } else {
            None
        }
    }

    /// Returns the pending input immediately, if any.
    pub fn take(&mut self) -> Option<String> {
        self.pending.take().map(|(text, _)| text)
    }

    /// True while input is waiting.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

/// Memoized projection with debounced search.
///
/// The cache is rebuilt on the next read after any predicate, toggle or
/// collapse change, or when the store's generation moves.
pub struct FilterEngine {
    state: FilterState,
    search: SearchMatcher,
    debounce: SearchDebounce,
    collapse: bool,
    cache: Projection,
    cached_generation: Option<u64>,
    dirty: bool,
}

impl Default for FilterEngine {
    fn default() -> Self {
        Self::new(Duration::from_millis(350))
    }
}

impl FilterEngine {
    /// Creates an engine with the given search quiet period.
    #[must_use]
    pub fn new(search_debounce: Duration) -> Self {
        Self::with_state(FilterState::default(), search_debounce)
    }

    /// Creates an engine with initial predicates.
    #[must_use]
    pub fn with_state(state: FilterState, search_debounce: Duration) -> Self {
        Self {
            search: SearchMatcher::compile(&state),
            state,
            debounce: SearchDebounce::new(search_debounce),
            collapse: false,
            cache: Projection::default(),
            cached_generation: None,
            dirty: true,
        }
    }

    /// Active predicates.
    #[must_use]
    pub const fn state(&self) -> &FilterState {
        &self.state
    }

    /// Whether collapse grouping is on.
    #[must_use]
    pub const fn collapse(&self) -> bool {
        self.collapse
    }

    /// Marks the cache stale.
    pub const fn invalidate(&mut self) {
        self.dirty = true;
    }

    /// Records raw search input; it is committed by [`Self::tick`] after the
    /// quiet period.
    pub fn set_search_input(&mut self, text: impl Into<String>, now: Instant) {
        self.debounce.input(text, now);
    }

    /// Commits debounced search input whose quiet period has elapsed.
    ///
    /// Returns true if the committed search changed.
    pub fn tick(&mut self, now: Instant) -> bool {
        match self.debounce.poll(now) {
            Some(text) => self.commit_search(text),
            None => false,
        }
    }

    /// True while search input is waiting for its quiet period.
    #[must_use]
    pub const fn search_pending(&self) -> bool {
        self.debounce.is_pending()
    }

    /// Commits search text immediately, discarding pending input.
    ///
    /// Returns true if the committed search changed.
    pub fn commit_search(&mut self, text: impl Into<String>) -> bool {
        let _ = self.debounce.take();
        let text = text.into();
        if text == self.state.search {
            return false;
        }
        debug!(search = %text, "committed search");
        self.state.search = text;
        self.recompile_search();
        true
    }

    /// Switches between literal and regular-expression search.
    pub fn set_regex(&mut self, regex: bool) {
        if self.state.regex != regex {
            self.state.regex = regex;
            self.recompile_search();
        }
    }

    fn recompile_search(&mut self) {
        self.search = SearchMatcher::compile(&self.state);
        self.dirty = true;
    }

    /// Sets the inclusive timestamp range. Empty strings mean unbounded.
    ///
    /// # Errors
    ///
    /// Rejects `min > max`, leaving the previous range in place.
    pub fn set_timestamp_range(&mut self, min: Option<&str>, max: Option<&str>) -> Result<()> {
        let normalize = |bound: Option<&str>| {
            bound
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(str::to_string)
        };
        self.state.timestamps = ValueRange::new("timestamp", normalize(min), normalize(max))?;
        self.dirty = true;
        Ok(())
    }

    /// Sets the inclusive message number range.
    ///
    /// # Errors
    ///
    /// Rejects `min > max`, leaving the previous range in place.
    pub fn set_number_range(&mut self, min: Option<u32>, max: Option<u32>) -> Result<()> {
        self.state.numbers = ValueRange::new("message number", min, max)?;
        self.dirty = true;
        Ok(())
    }

    /// Sets the inclusive sequence range.
    ///
    /// # Errors
    ///
    /// Rejects `min > max`, leaving the previous range in place.
    pub fn set_sequence_range(&mut self, min: Option<u64>, max: Option<u64>) -> Result<()> {
        self.state.sequences = ValueRange::new("sequence", min, max)?;
        self.dirty = true;
        Ok(())
    }

    /// Removes every range bound.
    pub fn clear_ranges(&mut self) {
        self.state.timestamps = ValueRange::default();
        self.state.numbers = ValueRange::default();
        self.state.sequences = ValueRange::default();
        self.dirty = true;
    }

    /// Shows or hides a severity.
    pub fn set_severity_visible(&mut self, severity: Severity, visible: bool) {
        let changed = if visible {
            self.state.hidden_severities.remove(&severity)
        } else {
            self.state.hidden_severities.insert(severity)
        };
        self.dirty |= changed;
    }

    /// Sets a tag's mode.
    pub fn set_tag_mode(&mut self, tag: &str, mode: TagMode) {
        self.dirty |= self.state.set_tag_mode(tag, mode);
    }

    /// Resets every tag to neutral.
    pub fn clear_tag_filters(&mut self) {
        self.state.included_tags.clear();
        self.state.excluded_tags.clear();
        self.dirty = true;
    }

    /// Replaces all predicates at once.
    pub fn set_state(&mut self, state: FilterState) {
        self.state = state;
        self.recompile_search();
    }

    /// Turns collapse grouping on or off.
    pub fn set_collapse(&mut self, collapse: bool) {
        if self.collapse != collapse {
            self.collapse = collapse;
            self.dirty = true;
        }
    }

    fn refresh(&mut self, store: &EntryStore) {
        if !self.dirty && self.cached_generation == Some(store.generation()) {
            return;
        }
        self.cache = project_with(store, &self.state, &self.search, self.collapse);
        self.cached_generation = Some(store.generation());
        self.dirty = false;
        debug!(rows = self.cache.rows.len(), entries = store.len(), "recomputed visible rows");
    }

    /// Visible rows.
    pub fn rows(&mut self, store: &EntryStore) -> &[FilteredRow] {
        self.refresh(store);
        &self.cache.rows
    }

    /// Number of visible rows.
    pub fn row_count(&mut self, store: &EntryStore) -> usize {
        self.rows(store).len()
    }

    /// Row `index` with its entry.
    pub fn row<'s>(&mut self, store: &'s EntryStore, index: usize) -> Option<(&'s Entry, u32)> {
        let row = *self.rows(store).get(index)?;
        store.get(row.entry_index).map(|e| (e, row.display_count))
    }

    /// Tag histogram over entries passing every non-tag predicate.
    pub fn histogram(&mut self, store: &EntryStore) -> &[TagCount] {
        self.refresh(store);
        &self.cache.histogram
    }
}
