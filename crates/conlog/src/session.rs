//! A viewing session over the console stream.
//!
//! [`ConsoleSession`] ties the pieces together for one consumer: it seeds an
//! [`EntryStore`] from the durable log's bounded history, subscribes a sink
//! to the process-wide [`EventDispatcher`], drains that sink on every tick,
//! and serves visible rows through a [`FilterEngine`].
//!
//! A session is single-owner. Every mutating method takes `&mut self` and is
//! expected to run on one logical thread or task; producers interact only
//! through the dispatcher.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConsoleConfig, SessionConfig};
use crate::error::Result;
use crate::filter::{FilterEngine, TagCount};
use crate::pipeline::{DrainReport, EventDispatcher, IngestSink, Ingested, IngestionPipeline, SinkId};
use crate::store::{EntryStore, shift_index};
use crate::tags::TagEngine;
use crate::types::{Entry, RawEvent};

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Drain totals.
    pub drain: DrainReport,
    /// Debounced search input was committed.
    pub search_committed: bool,
    /// The durable log's time threshold triggered a flush.
    pub log_flushed: bool,
}

/// One consumer's view of the console stream.
pub struct ConsoleSession {
    config: SessionConfig,
    store: EntryStore,
    pipeline: IngestionPipeline,
    filter: FilterEngine,
    dispatcher: Arc<EventDispatcher>,
    sink_id: Option<SinkId>,
    selected: Option<usize>,
}

impl ConsoleSession {
    /// Opens a session, seeding it with the last `load_cap` durable records
    /// and subscribing to `dispatcher`.
    #[must_use]
    pub fn open(config: &ConsoleConfig, dispatcher: Arc<EventDispatcher>) -> Self {
        let session_config = config.session.clone();
        let sink = IngestSink::new();
        let mut pipeline = IngestionPipeline::new(
            sink.clone(),
            TagEngine::new(config.tags.clone()),
            Arc::clone(dispatcher.host()),
        )
        .with_error_pause(session_config.error_pause);

        let mut store = EntryStore::new(session_config.max_entries);
        if let Some(log) = dispatcher.log() {
            let history = log.load(session_config.load_cap);
            let loaded = history.len();
            pipeline.seed(
                &mut store,
                history.into_iter().map(RawEvent::from),
                session_config.collapse,
            );
            debug!(loaded, kept = store.len(), "seeded session from durable log");
        }

        let mut filter = FilterEngine::new(session_config.search_debounce());
        filter.set_collapse(session_config.collapse);

        let sink_id = dispatcher.subscribe(sink);
        info!(sink = sink_id.0, entries = store.len(), "console session opened");

        Self {
            config: session_config,
            store,
            pipeline,
            filter,
            dispatcher,
            sink_id: Some(sink_id),
            selected: None,
        }
    }

    /// Drains pending events, commits debounced search input and gives the
    /// durable log a chance to flush on its time threshold.
    pub fn tick(&mut self, now: Instant) -> TickReport {
        let drain = self.pipeline.drain(&mut self.store, self.filter.collapse());
        if drain.trimmed > 0 {
            self.selected = shift_index(self.selected, drain.trimmed);
        }
        let search_committed = self.filter.tick(now);
        let log_flushed = self
            .dispatcher
            .log()
            .is_some_and(|log| log.flush_if_due(now));
        TickReport {
            drain,
            search_committed,
            log_flushed,
        }
    }

    /// Ingests one event immediately on the owner, bypassing the queue.
    /// The event is not recorded in the durable log.
    pub fn ingest_now(&mut self, event: RawEvent) -> Ingested {
        let outcome = self
            .pipeline
            .ingest_now(&mut self.store, event, self.filter.collapse());
        if let Ingested::Appended { trimmed, .. } = outcome {
            if trimmed > 0 {
                self.selected = shift_index(self.selected, trimmed);
            }
        }
        outcome
    }

    /// Ticks on the configured interval until `cancel` fires.
    pub async fn run_until(&mut self, cancel: &CancellationToken) {
        let period = self.config.tick_interval().max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                at = interval.tick() => {
                    self.tick(at.into_std());
                }
            }
        }
        debug!("session tick loop stopped");
    }

    /// Clears the session and the durable log.
    ///
    /// Publishing is blocked for the duration. Pending events are drained
    /// first so nothing enqueued before the clear survives it. Entries
    /// matching `retain` are kept in memory and written back as the new
    /// durable log content. Numbering restarts at 1.
    ///
    /// Returns the number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable log could not be rewritten; the
    /// in-memory clear has still happened.
    pub fn clear(&mut self, retain: Option<&dyn Fn(&Entry) -> bool>) -> Result<usize> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let removed = dispatcher.quiesced(|| self.clear_quiesced(retain))?;
        info!(removed, kept = self.store.len(), "console cleared");
        Ok(removed)
    }

    fn clear_quiesced(&mut self, retain: Option<&dyn Fn(&Entry) -> bool>) -> Result<usize> {
        self.pipeline.drain(&mut self.store, self.filter.collapse());
        let removed = self.store.clear(retain);
        self.selected = None;
        self.filter.invalidate();

        if let Some(log) = self.dispatcher.log() {
            let retained: Vec<Entry> = self.store.iter().cloned().collect();
            log.rewrite(&retained)?;
        }
        Ok(removed)
    }

    /// Turns collapse mode on or off for both merging and grouping.
    pub fn set_collapse(&mut self, collapse: bool) {
        self.filter.set_collapse(collapse);
    }

    /// Whether collapse mode is on.
    #[must_use]
    pub const fn collapse(&self) -> bool {
        self.filter.collapse()
    }

    /// Turns error pause on or off.
    pub const fn set_error_pause(&mut self, enabled: bool) {
        self.pipeline.set_error_pause(enabled);
    }

    /// Changes the retention bound, trimming immediately.
    pub fn set_max_entries(&mut self, max_entries: usize) {
        self.config.max_entries = max_entries;
        let trimmed = self.store.set_max_entries(max_entries);
        self.selected = shift_index(self.selected, trimmed);
    }

    /// Applies a new configuration: tag rules (recomputing every entry's
    /// tags), retention, collapse and error pause.
    pub fn reload_config(&mut self, config: &ConsoleConfig) {
        self.pipeline.reload_tags(config.tags.clone(), &mut self.store);
        self.set_max_entries(config.session.max_entries);
        self.set_collapse(config.session.collapse);
        self.set_error_pause(config.session.error_pause);
        self.filter.invalidate();
        self.config = config.session.clone();
    }

    /// Filter predicates and toggles.
    #[must_use]
    pub const fn filter(&self) -> &FilterEngine {
        &self.filter
    }

    /// Mutable access to filter predicates and toggles.
    pub const fn filter_mut(&mut self) -> &mut FilterEngine {
        &mut self.filter
    }

    /// Stored entries.
    #[must_use]
    pub const fn store(&self) -> &EntryStore {
        &self.store
    }

    /// Number of visible rows.
    pub fn row_count(&mut self) -> usize {
        self.filter.row_count(&self.store)
    }

    /// Visible row `index`: the entry and its display count.
    pub fn row(&mut self, index: usize) -> Option<(&Entry, u32)> {
        self.filter.row(&self.store, index)
    }

    /// Visible row `index` as one line of text.
    pub fn row_text(&mut self, index: usize) -> Option<String> {
        self.row(index).map(|(entry, count)| format_row(entry, count))
    }

    /// Tag histogram over the current non-tag predicates.
    pub fn histogram(&mut self) -> &[TagCount] {
        self.filter.histogram(&self.store)
    }

    /// Selects a stored entry by index, or clears the selection.
    pub fn select(&mut self, entry_index: Option<usize>) {
        self.selected = entry_index.filter(|&i| i < self.store.len());
    }

    /// Currently selected entry index.
    #[must_use]
    pub const fn selected(&self) -> Option<usize> {
        self.selected
    }

    /// Currently selected entry.
    #[must_use]
    pub fn selected_entry(&self) -> Option<&Entry> {
        self.selected.and_then(|i| self.store.get(i))
    }

    /// Number of events waiting for the next tick.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pipeline.sink().pending_len()
    }

    /// Unsubscribes, drains what is left and flushes the durable log.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(sink_id) = self.sink_id.take() else {
            return;
        };
        self.dispatcher.unsubscribe(sink_id);
        self.pipeline.drain(&mut self.store, self.filter.collapse());
        if let Some(log) = self.dispatcher.log() {
            if let Err(e) = log.flush() {
                warn!(error = %e, "durable log flush on session close failed");
            }
        }
        info!(sink = sink_id.0, "console session closed");
    }
}

impl Drop for ConsoleSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Formats a row as `[timestamp] [severity] content`, with ` (xN)` appended
/// when the display count exceeds one. Only the first content line is used.
#[must_use]
pub fn format_row(entry: &Entry, count: u32) -> String {
    let mut line = format!(
        "[{}] [{}] {}",
        entry.timestamp,
        entry.severity,
        entry.first_line()
    );
    if count > 1 {
        line.push_str(&format!(" (x{count})"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DurableLogConfig;
    use crate::durable::DurableLog;
    use crate::pipeline::{HostBridge, NoopHost};
    use crate::types::Severity;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn open_log(dir: &TempDir) -> Arc<DurableLog> {
        let config = DurableLogConfig::new(dir.path()).with_flush_interval(Duration::from_secs(60));
        Arc::new(DurableLog::open_for_process(config, 1).expect("open log"))
    }

    fn dispatcher(log: Option<Arc<DurableLog>>) -> Arc<EventDispatcher> {
        Arc::new(EventDispatcher::new(log, Arc::new(NoopHost)))
    }

    fn config() -> ConsoleConfig {
        ConsoleConfig::default()
    }

    #[test]
    fn events_become_visible_after_tick() {
        let dispatcher = dispatcher(None);
        let mut session = ConsoleSession::open(&config(), Arc::clone(&dispatcher));

        dispatcher.publish("hello", "", Severity::Info);
        assert_eq!(session.row_count(), 0);
        assert_eq!(session.pending_len(), 1);

        let report = session.tick(Instant::now());
        assert_eq!(report.drain.appended, 1);
        assert_eq!(session.row_count(), 1);
        assert_eq!(session.row(0).map(|(e, _)| e.number), Some(1));
    }

    #[test]
    fn session_seeds_from_bounded_history() {
        let dir = TempDir::new().expect("tempdir");
        let log = open_log(&dir);
        for i in 1..=5 {
            log.append(&Entry::new(format!("m{i}"), "", Severity::Info, "t", i));
        }

        let mut cfg = config();
        cfg.session = cfg.session.with_load_cap(3);
        let mut session = ConsoleSession::open(&cfg, dispatcher(Some(log)));

        let contents: Vec<String> = session.store().iter().map(|e| e.content.clone()).collect();
        assert_eq!(contents, vec!["m3", "m4", "m5"]);
        let numbers: Vec<u32> = session.store().iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(session.row_count(), 3);
    }

    #[test]
    fn seeding_applies_collapse() {
        let dir = TempDir::new().expect("tempdir");
        let log = open_log(&dir);
        for _ in 0..3 {
            log.append(&Entry::new("same", "", Severity::Warning, "t", 0));
        }

        let mut cfg = config();
        cfg.session = cfg.session.with_collapse(true);
        let mut session = ConsoleSession::open(&cfg, dispatcher(Some(log)));
        assert_eq!(session.store().len(), 1);
        assert_eq!(session.row(0).map(|(_, count)| count), Some(3));
    }

    #[test]
    fn collapse_toggle_changes_merge_and_rows() {
        let dispatcher = dispatcher(None);
        let mut session = ConsoleSession::open(&config(), Arc::clone(&dispatcher));

        session.set_collapse(true);
        for _ in 0..3 {
            dispatcher.publish("dup", "", Severity::Info);
        }
        session.tick(Instant::now());
        assert_eq!(session.store().len(), 1);
        assert_eq!(session.row_count(), 1);

        session.set_collapse(false);
        assert_eq!(session.row_count(), 3);
        for _ in 0..3 {
            dispatcher.publish("dup", "", Severity::Info);
        }
        session.tick(Instant::now());
        assert_eq!(session.store().len(), 4);
        assert_eq!(session.row_count(), 6);

        session.set_collapse(true);
        assert_eq!(session.row_count(), 1);
        assert_eq!(session.row(0).map(|(_, count)| count), Some(6));
    }

    #[test]
    fn clear_restarts_numbering_and_rewrites_log() {
        let dir = TempDir::new().expect("tempdir");
        let log = open_log(&dir);
        let dispatcher = dispatcher(Some(Arc::clone(&log)));
        let mut session = ConsoleSession::open(&config(), Arc::clone(&dispatcher));

        dispatcher.publish("keep: compile error", "", Severity::Error);
        dispatcher.publish("noise", "", Severity::Info);
        session.tick(Instant::now());
        dispatcher.publish("pending noise", "", Severity::Info);

        let keep = |e: &Entry| e.content.starts_with("keep");
        let removed = session.clear(Some(&keep));
        assert!(matches!(removed, Ok(2)));
        assert_eq!(session.row_count(), 1);

        let persisted: Vec<String> = log.load(0).into_iter().map(|e| e.content).collect();
        assert_eq!(persisted, vec!["keep: compile error"]);

        dispatcher.publish("after", "", Severity::Info);
        session.tick(Instant::now());
        assert_eq!(session.store().last().map(|e| e.number), Some(1));
    }

    #[test]
    fn clear_keeps_collapsed_occurrences_on_disk() {
        let dir = TempDir::new().expect("tempdir");
        let log = open_log(&dir);
        let first = dispatcher(Some(Arc::clone(&log)));
        let mut cfg = config();
        cfg.session = cfg.session.with_collapse(true);
        let mut session = ConsoleSession::open(&cfg, Arc::clone(&first));

        for _ in 0..3 {
            first.publish("keep", "", Severity::Error);
        }
        first.publish("drop", "", Severity::Info);
        session.tick(Instant::now());
        assert_eq!(session.store().len(), 2);

        let keep = |e: &Entry| e.content == "keep";
        assert!(matches!(session.clear(Some(&keep)), Ok(1)));
        session.close();
        assert_eq!(log.load(0).len(), 3);

        let mut reopened = ConsoleSession::open(&cfg, dispatcher(Some(log)));
        assert_eq!(reopened.row_count(), 1);
        assert_eq!(reopened.row(0).map(|(_, count)| count), Some(3));
    }

    #[test]
    fn clear_during_publishing_keeps_log_and_store_aligned() {
        let dir = TempDir::new().expect("tempdir");
        let log = open_log(&dir);
        let dispatcher = dispatcher(Some(Arc::clone(&log)));
        let mut cfg = config();
        cfg.session = cfg.session.with_max_entries(0);
        let mut session = ConsoleSession::open(&cfg, Arc::clone(&dispatcher));

        let producer = {
            let dispatcher = Arc::clone(&dispatcher);
            std::thread::spawn(move || {
                for i in 0..2000 {
                    dispatcher.publish(&format!("m{i}"), "", Severity::Info);
                }
            })
        };
        for _ in 0..20 {
            assert!(session.clear(None).is_ok());
            session.tick(Instant::now());
            std::thread::yield_now();
        }
        assert!(producer.join().is_ok());
        session.tick(Instant::now());

        let in_store: Vec<String> = session.store().iter().map(|e| e.content.clone()).collect();
        let on_disk: Vec<String> = log.load(0).into_iter().map(|e| e.content).collect();
        assert_eq!(on_disk, in_store);
    }

    #[test]
    fn selection_follows_trimming() {
        let dispatcher = dispatcher(None);
        let mut cfg = config();
        cfg.session = cfg.session.with_max_entries(4);
        let mut session = ConsoleSession::open(&cfg, Arc::clone(&dispatcher));

        for i in 0..4 {
            dispatcher.publish(&format!("m{i}"), "", Severity::Info);
        }
        session.tick(Instant::now());
        session.select(Some(3));
        assert_eq!(session.selected_entry().map(|e| e.content.as_str()), Some("m3"));

        dispatcher.publish("m4", "", Severity::Info);
        dispatcher.publish("m5", "", Severity::Info);
        session.tick(Instant::now());
        assert_eq!(session.selected(), Some(1));
        assert_eq!(session.selected_entry().map(|e| e.content.as_str()), Some("m3"));

        for i in 6..9 {
            dispatcher.publish(&format!("m{i}"), "", Severity::Info);
        }
        session.tick(Instant::now());
        assert_eq!(session.selected(), None);
    }

    #[test]
    fn select_out_of_range_is_ignored() {
        let mut session = ConsoleSession::open(&config(), dispatcher(None));
        session.select(Some(0));
        assert_eq!(session.selected(), None);
    }

    #[test]
    fn search_is_committed_by_tick() {
        let dispatcher = dispatcher(None);
        let mut session = ConsoleSession::open(&config(), Arc::clone(&dispatcher));
        dispatcher.publish("alpha", "", Severity::Info);
        dispatcher.publish("beta", "", Severity::Info);
        let start = Instant::now();
        session.tick(start);

        session.filter_mut().set_search_input("beta", start);
        assert_eq!(session.row_count(), 2);
        let report = session.tick(start + Duration::from_millis(400));
        assert!(report.search_committed);
        assert_eq!(session.row_count(), 1);
    }

    #[test]
    fn error_pause_signals_live_host() {
        struct LiveHost(AtomicUsize);
        impl HostBridge for LiveHost {
            fn is_live(&self) -> bool {
                true
            }
            fn request_pause(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let host = Arc::new(LiveHost(AtomicUsize::new(0)));
        let dispatcher = Arc::new(EventDispatcher::new(None, host.clone()));
        let mut cfg = config();
        cfg.session = cfg.session.with_error_pause(true);
        let mut session = ConsoleSession::open(&cfg, Arc::clone(&dispatcher));

        dispatcher.publish("boom", "", Severity::Exception);
        dispatcher.publish("fine", "", Severity::Info);
        session.tick(Instant::now());
        assert_eq!(host.0.load(Ordering::SeqCst), 1);

        session.set_error_pause(false);
        dispatcher.publish("boom", "", Severity::Error);
        session.tick(Instant::now());
        assert_eq!(host.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_unsubscribes_and_flushes() {
        let dir = TempDir::new().expect("tempdir");
        let log = open_log(&dir);
        let dispatcher = dispatcher(Some(Arc::clone(&log)));
        let session = ConsoleSession::open(&config(), Arc::clone(&dispatcher));
        assert_eq!(dispatcher.sink_count(), 1);

        dispatcher.publish("last words", "", Severity::Info);
        assert_eq!(log.pending_len(), 1);
        session.close();

        assert_eq!(dispatcher.sink_count(), 0);
        assert_eq!(log.pending_len(), 0);
        assert_eq!(log.load(0).len(), 1);
    }

    #[test]
    fn sessions_are_independent() {
        let dispatcher = dispatcher(None);
        let mut a = ConsoleSession::open(&config(), Arc::clone(&dispatcher));
        let mut b = ConsoleSession::open(&config(), Arc::clone(&dispatcher));

        dispatcher.publish("shared", "", Severity::Info);
        a.tick(Instant::now());
        b.tick(Instant::now());
        assert!(a.clear(None).is_ok());

        assert_eq!(a.row_count(), 0);
        assert_eq!(b.row_count(), 1);
        drop(a);
        assert_eq!(dispatcher.sink_count(), 1);
    }

    #[test]
    fn reload_config_recomputes_tags_and_retention() {
        let dispatcher = dispatcher(None);
        let mut session = ConsoleSession::open(&config(), Arc::clone(&dispatcher));
        for i in 0..5 {
            dispatcher.publish(&format!("[Net] {i}"), "", Severity::Info);
        }
        session.tick(Instant::now());
        assert_eq!(session.histogram().len(), 1);

        let mut cfg = config();
        cfg.tags = cfg.tags.with_bracket_tags(false);
        cfg.session = cfg.session.with_max_entries(2);
        session.reload_config(&cfg);

        assert!(session.histogram().is_empty());
        assert_eq!(session.row_count(), 2);
    }

    #[test]
    fn row_text_formats_counts() {
        let entry = Entry::new("first\nsecond", "", Severity::Warning, "2024-05-01 12:00:00.000", 0);
        assert_eq!(
            format_row(&entry, 1),
            "[2024-05-01 12:00:00.000] [warning] first"
        );
        assert_eq!(
            format_row(&entry, 4),
            "[2024-05-01 12:00:00.000] [warning] first (x4)"
        );
    }

    #[tokio::test]
    async fn run_until_ticks_until_cancelled() {
        let dispatcher = dispatcher(None);
        let mut cfg = config();
        cfg.session.tick_interval_ms = 5;
        let mut session = ConsoleSession::open(&cfg, Arc::clone(&dispatcher));

        dispatcher.publish("async", "", Severity::Info);
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        session.run_until(&cancel).await;
        assert_eq!(session.row_count(), 1);
        assert_eq!(session.row_text(0).map(|t| t.ends_with("async")), Some(true));
    }
}
