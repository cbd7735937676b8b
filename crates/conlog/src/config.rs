//! Configuration for the console log core.
//!
//! Configuration is an explicit value handed to each component at
//! construction; components expose a `reload` operation instead of reading
//! global state. [`ConsoleConfig`] persists as pretty JSON.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ConsoleError, Result};
use crate::types::TagRule;

/// Settings for the process-wide durable log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DurableLogConfig {
    /// Directory holding the log, its marker and rotated backups.
    pub dir: PathBuf,
    /// Log file name.
    pub file_name: String,
    /// Name of the file storing the last-seen process identifier.
    pub marker_name: String,
    /// Flush once this many records are buffered.
    pub flush_threshold: usize,
    /// Flush once the oldest buffered record is this old (milliseconds).
    pub flush_interval_ms: u64,
}

impl Default for DurableLogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            file_name: "console.log".to_string(),
            marker_name: "console.pid".to_string(),
            flush_threshold: 50,
            flush_interval_ms: 1500,
        }
    }
}

impl DurableLogConfig {
    /// Creates a config rooted at the given directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Sets the count threshold.
    #[must_use]
    pub const fn with_flush_threshold(mut self, records: usize) -> Self {
        self.flush_threshold = records;
        self
    }

    /// Sets the time threshold.
    #[must_use]
    pub const fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the log file name.
    #[must_use]
    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = name.into();
        self
    }

    /// Path of the log file.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    /// Path of the process marker file.
    #[must_use]
    pub fn marker_path(&self) -> PathBuf {
        self.dir.join(&self.marker_name)
    }

    /// Time threshold as a [`Duration`].
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Checks that the paths can be derived and the thresholds are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConsoleError::Config`] for an empty file or marker name, a
    /// marker that would overwrite the log, or a zero flush threshold.
    pub fn validate(&self) -> Result<()> {
        if self.file_name.trim().is_empty() {
            return Err(ConsoleError::Config("log file name is empty".to_string()));
        }
        if self.marker_name.trim().is_empty() {
            return Err(ConsoleError::Config("marker file name is empty".to_string()));
        }
        if self.marker_name == self.file_name {
            return Err(ConsoleError::Config(format!(
                "marker file name '{}' collides with the log file",
                self.marker_name
            )));
        }
        if self.flush_threshold == 0 {
            return Err(ConsoleError::Config("flush threshold must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Settings for automatic and rule-based tagging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagConfig {
    /// Extract `[token]` tags from content.
    pub bracket_tags: bool,
    /// Only scan the first content line for bracket tags.
    pub bracket_first_line_only: bool,
    /// Extract tags from `at|in Identifier` frames in the detail.
    pub trace_tags: bool,
    /// Trace-derived tags must be shorter than this.
    pub max_trace_tag_len: usize,
    /// User rules.
    pub rules: Vec<TagRule>,
}

impl Default for TagConfig {
    fn default() -> Self {
        Self {
            bracket_tags: true,
            bracket_first_line_only: false,
            trace_tags: true,
            max_trace_tag_len: 32,
            rules: Vec::new(),
        }
    }
}

impl TagConfig {
    /// Adds a rule.
    #[must_use]
    pub fn with_rule(mut self, rule: TagRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Enables or disables bracket extraction.
    #[must_use]
    pub const fn with_bracket_tags(mut self, enabled: bool) -> Self {
        self.bracket_tags = enabled;
        self
    }

    /// Enables or disables trace extraction.
    #[must_use]
    pub const fn with_trace_tags(mut self, enabled: bool) -> Self {
        self.trace_tags = enabled;
        self
    }
}

/// Settings for one viewing session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum entries retained in memory.
    pub max_entries: usize,
    /// Records loaded from the durable log on open; 0 loads everything.
    pub load_cap: usize,
    /// Drain tick interval (milliseconds).
    pub tick_interval_ms: u64,
    /// Quiet period before search input is committed (milliseconds).
    pub search_debounce_ms: u64,
    /// Start with collapse mode on.
    pub collapse: bool,
    /// Request a host pause on error and exception entries.
    pub error_pause: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            load_cap: 1000,
            tick_interval_ms: 250,
            search_debounce_ms: 350,
            collapse: false,
            error_pause: false,
        }
    }
}

impl SessionConfig {
    /// Sets the retention bound.
    #[must_use]
    pub const fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Sets the load cap.
    #[must_use]
    pub const fn with_load_cap(mut self, load_cap: usize) -> Self {
        self.load_cap = load_cap;
        self
    }

    /// Sets the initial collapse mode.
    #[must_use]
    pub const fn with_collapse(mut self, collapse: bool) -> Self {
        self.collapse = collapse;
        self
    }

    /// Sets error pause.
    #[must_use]
    pub const fn with_error_pause(mut self, error_pause: bool) -> Self {
        self.error_pause = error_pause;
        self
    }

    /// Tick interval as a [`Duration`].
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Search debounce as a [`Duration`].
    #[must_use]
    pub const fn search_debounce(&self) -> Duration {
        Duration::from_millis(self.search_debounce_ms)
    }

    /// Checks that the session can tick.
    ///
    /// # Errors
    ///
    /// Returns [`ConsoleError::Config`] for a zero tick interval.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(ConsoleError::Config("tick interval must be at least 1 ms".to_string()));
        }
        Ok(())
    }
}

/// Complete persisted configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Durable log settings.
    pub log: DurableLogConfig,
    /// Tagging settings.
    pub tags: TagConfig,
    /// Session settings.
    pub session: SessionConfig,
}

impl ConsoleConfig {
    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns [`ConsoleError::Config`] for unusable log or session settings
    /// and [`ConsoleError::InvalidPattern`] for a tag rule that cannot compile.
    pub fn validate(&self) -> Result<()> {
        self.log.validate()?;
        self.session.validate()?;
        self.tags.rules.iter().try_for_each(TagRule::validate)
    }

    /// Loads configuration from a JSON file.
    ///
    /// A missing or unreadable file yields the defaults.
    pub fn load(path: &Path) -> Self {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Self::default();
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to read config, using defaults");
                return Self::default();
            }
        };
        let config: Self = match serde_json::from_str(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, path = %path.display(), "invalid config, using defaults");
                return Self::default();
            }
        };
        match config.validate() {
            Ok(()) => config,
            // The tag engine disables just that rule.
            Err(e @ ConsoleError::InvalidPattern(_)) => {
                warn!(error = %e, path = %path.display(), "config has an unusable tag rule");
                config
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), "invalid config, using defaults");
                Self::default()
            }
        }
    }

    /// Saves configuration as pretty JSON, replacing the file atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
