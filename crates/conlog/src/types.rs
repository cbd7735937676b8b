//! Core types for the console log core.
//!
//! This module provides:
//! - [`Severity`] — Severity of a console message
//! - [`Entry`] — One ingested record with its derived tag set
//! - [`RawEvent`] — An un-numbered tuple as delivered by a producer
//! - [`TagSet`] — Case-insensitive, deduplicated tag collection
//! - [`TagRule`] — User-defined tagging rule
//! - [`FilteredRow`] — One element of the visible-row projection

use std::collections::BTreeMap;
use std::fmt;

use chrono::Local;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConsoleError, Result};

/// Format of entry timestamps. Lexicographic order equals chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Returns the current wall-clock time formatted with [`TIMESTAMP_FORMAT`].
#[must_use]
pub fn now_timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Console message severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Plain informational message
    Info = 0,
    /// Warning
    Warning = 1,
    /// Error
    Error = 2,
    /// Failed assertion
    Assert = 3,
    /// Uncaught exception
    Exception = 4,
}

impl Severity {
    /// All severities, in encoding order.
    pub const ALL: [Self; 5] = [
        Self::Info,
        Self::Warning,
        Self::Error,
        Self::Assert,
        Self::Exception,
    ];

    /// Integer used in the durable log encoding.
    #[must_use]
    pub const fn as_int(self) -> u8 {
        self as u8
    }

    /// Decodes the durable log integer. Unknown values yield `None`.
    #[must_use]
    pub const fn from_int(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Info),
            1 => Some(Self::Warning),
            2 => Some(Self::Error),
            3 => Some(Self::Assert),
            4 => Some(Self::Exception),
            _ => None,
        }
    }

    /// Returns the string representation of this severity.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Assert => "assert",
            Self::Exception => "exception",
        }
    }

    /// True for severities that can trigger an error pause.
    #[must_use]
    pub const fn is_error_like(self) -> bool {
        matches!(self, Self::Error | Self::Exception)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" | "log" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" | "err" => Ok(Self::Error),
            "assert" => Ok(Self::Assert),
            "exception" => Ok(Self::Exception),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// Deduplicated set of tags. Membership is case-insensitive; the first
/// spelling inserted is the one displayed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    // lowercase key -> display spelling
    tags: BTreeMap<String, String>,
}

impl TagSet {
    /// Creates an empty tag set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a tag, ignoring it if an equal (case-insensitive) tag exists.
    /// Returns true if the tag was new.
    pub fn insert(&mut self, tag: &str) -> bool {
        let key = tag.to_lowercase();
        if self.tags.contains_key(&key) {
            return false;
        }
        self.tags.insert(key, tag.to_string());
        true
    }

    /// Case-insensitive membership test.
    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.tags.contains_key(&tag.to_lowercase())
    }

    /// Membership test for an already lowercased key.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.tags.contains_key(key)
    }

    /// Iterates over `(lowercase key, display spelling)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Iterates over display spellings in key order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tags.values().map(String::as_str)
    }

    /// Number of tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// True if there are no tags.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

/// One ingested console record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Message number, assigned at append time. 0 until appended.
    pub number: u32,
    /// Message text
    pub content: String,
    /// Auxiliary detail, usually a stack trace
    pub detail: String,
    /// Severity
    pub severity: Severity,
    /// Wall-clock timestamp in [`TIMESTAMP_FORMAT`]
    pub timestamp: String,
    /// Host-supplied sequence (tick or frame counter), 0 if unavailable
    pub sequence: u64,
    /// Number of merged occurrences, at least 1
    pub repeat_count: u32,
    /// Derived tags; replaced wholesale on every recomputation
    pub tags: TagSet,
}

impl Entry {
    /// Creates an un-numbered entry with a repeat count of 1 and no tags.
    #[must_use]
    pub fn new(
        content: impl Into<String>,
        detail: impl Into<String>,
        severity: Severity,
        timestamp: impl Into<String>,
        sequence: u64,
    ) -> Self {
        Self {
            number: 0,
            content: content.into(),
            detail: detail.into(),
            severity,
            timestamp: timestamp.into(),
            sequence,
            repeat_count: 1,
            tags: TagSet::new(),
        }
    }

    /// Exact, ordinal comparison of content, detail and severity.
    #[must_use]
    pub fn same_content(&self, content: &str, detail: &str, severity: Severity) -> bool {
        self.severity == severity && self.content == content && self.detail == detail
    }

    /// First line of the content.
    #[must_use]
    pub fn first_line(&self) -> &str {
        self.content.lines().next().unwrap_or("")
    }
}

/// A tuple delivered by a producer, not yet numbered or tagged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Message text
    pub content: String,
    /// Auxiliary detail
    pub detail: String,
    /// Severity
    pub severity: Severity,
    /// Timestamp captured at enqueue time
    pub timestamp: String,
    /// Host sequence if one was attributed at enqueue time
    pub sequence: Option<u64>,
}

impl RawEvent {
    /// Creates an event stamped with the current time and no sequence.
    #[must_use]
    pub fn new(content: impl Into<String>, detail: impl Into<String>, severity: Severity) -> Self {
        Self {
            content: content.into(),
            detail: detail.into(),
            severity,
            timestamp: now_timestamp(),
            sequence: None,
        }
    }

    /// Sets the host sequence.
    #[must_use]
    pub const fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Overrides the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    /// Converts into an un-numbered entry; a missing sequence becomes 0.
    #[must_use]
    pub fn into_entry(self) -> Entry {
        Entry::new(
            self.content,
            self.detail,
            self.severity,
            self.timestamp,
            self.sequence.unwrap_or(0),
        )
    }
}

impl From<Entry> for RawEvent {
    fn from(entry: Entry) -> Self {
        Self {
            content: entry.content,
            detail: entry.detail,
            severity: entry.severity,
            timestamp: entry.timestamp,
            sequence: Some(entry.sequence),
        }
    }
}

/// How a [`TagRule`] pattern is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// Case-insensitive substring
    Contains,
    /// Regular expression; case sensitivity is up to the pattern
    Regex,
    /// Case-insensitive prefix
    Prefix,
    /// Case-insensitive suffix
    Suffix,
}

/// Which text a [`TagRule`] is tested against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTarget {
    /// Content only
    ContentOnly,
    /// Detail only
    DetailOnly,
    /// Content or detail
    Both,
}

/// A persisted user rule that attaches `name` to matching entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRule {
    /// Tag name added on match
    pub name: String,
    /// Match kind
    pub kind: MatchKind,
    /// Match target
    pub target: MatchTarget,
    /// Pattern string
    pub pattern: String,
}

impl TagRule {
    /// Creates a new rule.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        kind: MatchKind,
        target: MatchTarget,
        pattern: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            target,
            pattern: pattern.into(),
        }
    }

    /// Compiles the pattern of a [`MatchKind::Regex`] rule.
    ///
    /// # Errors
    ///
    /// Returns [`ConsoleError::InvalidPattern`] naming the rule when the
    /// pattern does not compile.
    pub fn compile_regex(&self) -> Result<Regex> {
        Regex::new(&self.pattern)
            .map_err(|e| ConsoleError::InvalidPattern(format!("tag rule '{}': {e}", self.name)))
    }

    /// Checks that the rule can be applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConsoleError::InvalidPattern`] for a regex rule whose
    /// pattern does not compile.
    pub fn validate(&self) -> Result<()> {
        if self.kind == MatchKind::Regex {
            self.compile_regex()?;
        }
        Ok(())
    }

    /// Applies `test` to the texts selected by this rule's target.
    pub(crate) fn test_targets(
        &self,
        content: &str,
        detail: &str,
        test: impl Fn(&str) -> bool,
    ) -> bool {
        match self.target {
            MatchTarget::ContentOnly => test(content),
            MatchTarget::DetailOnly => test(detail),
            MatchTarget::Both => test(content) || test(detail),
        }
    }
}

/// Literal match of an already lowercased haystack and needle.
pub(crate) fn text_matches(kind: MatchKind, haystack: &str, needle: &str) -> bool {
    match kind {
        MatchKind::Contains => haystack.contains(needle),
        MatchKind::Prefix => haystack.starts_with(needle),
        MatchKind::Suffix => haystack.ends_with(needle),
        MatchKind::Regex => false,
    }
}

/// One visible row: an index into the entry store and the count shown for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilteredRow {
    /// Index of the (representative) entry in the store
    pub entry_index: usize,
    /// Aggregated repeat count under collapse, otherwise 1
    pub display_count: u32,
}
