//! Ingestion from producer threads into the owner's entry store.
//!
//! This module provides:
//! - [`HostBridge`] — What the core needs from the hosting application
//! - [`IngestSink`] — Cloneable, thread-safe pending queue producers push into
//! - [`EventDispatcher`] — Process-wide fan-out from one event stream to
//!   every registered sink, and into the durable log
//! - [`IngestionPipeline`] — Owner-side drain applying the collapse-merge policy
//!
//! Producers only ever take two short locks: the durable log buffer and a
//! sink's pending queue. All store mutation and tag computation happens in
//! [`IngestionPipeline::drain`] on the owning thread.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::TagConfig;
use crate::durable::DurableLog;
use crate::store::EntryStore;
use crate::tags::TagEngine;
use crate::types::{RawEvent, Severity};

/// Interface to the hosting application.
///
/// Implementations must be cheap and non-blocking; `is_live` and `sequence`
/// are called from producer threads. `request_pause` must not publish
/// synchronously.
pub trait HostBridge: Send + Sync {
    /// Whether the live/running session is currently active.
    fn is_live(&self) -> bool {
        false
    }

    /// Current host sequence (tick or frame counter).
    fn sequence(&self) -> u64 {
        0
    }

    /// Asks the host to pause. Fire-and-forget.
    fn request_pause(&self) {}
}

/// Host that is never live and ignores pause requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHost;

impl HostBridge for NoopHost {}

/// Thread-safe pending queue for one session.
#[derive(Debug, Clone, Default)]
pub struct IngestSink {
    pending: Arc<Mutex<VecDeque<RawEvent>>>,
}

impl IngestSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues an event. Never blocks beyond the queue mutex.
    pub fn submit(&self, event: RawEvent) {
        self.pending.lock().push_back(event);
    }

    /// Number of events waiting for the next drain.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Takes every pending event, leaving the queue empty.
    #[must_use]
    pub fn take_all(&self) -> VecDeque<RawEvent> {
        std::mem::take(&mut *self.pending.lock())
    }
}

/// Identifier of a registered sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(pub u64);

/// Forwards host events to the durable log and every registered sink.
pub struct EventDispatcher {
    log: Option<Arc<DurableLog>>,
    host: Arc<dyn HostBridge>,
    sinks: RwLock<Vec<(SinkId, IngestSink)>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    /// Creates a dispatcher. Without a durable log, events are only forwarded.
    #[must_use]
    pub fn new(log: Option<Arc<DurableLog>>, host: Arc<dyn HostBridge>) -> Self {
        Self {
            log,
            host,
            sinks: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a sink to receive every subsequent event.
    pub fn subscribe(&self, sink: IngestSink) -> SinkId {
        let id = SinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sinks.write().push((id, sink));
        debug!(sink = id.0, "sink subscribed");
        id
    }

    /// Removes a sink. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SinkId) -> bool {
        let mut sinks = self.sinks.write();
        let before = sinks.len();
        sinks.retain(|(sink_id, _)| *sink_id != id);
        let removed = sinks.len() != before;
        if removed {
            debug!(sink = id.0, "sink unsubscribed");
        }
        removed
    }

    /// Number of registered sinks.
    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks.read().len()
    }

    /// Publishes a host event. Callable from any thread.
    pub fn publish(&self, content: &str, detail: &str, severity: Severity) {
        self.publish_event(RawEvent::new(content, detail, severity));
    }

    /// Publishes a prepared event. When it carries no sequence and the host
    /// is live, the host sequence is attached.
    pub fn publish_event(&self, mut event: RawEvent) {
        if event.sequence.is_none() && self.host.is_live() {
            event.sequence = Some(self.host.sequence());
        }
        // Held across both writes so `quiesced` never sees an event in only one.
        let sinks = self.sinks.read();
        if let Some(log) = &self.log {
            log.append_event(&event);
        }
        for (_, sink) in sinks.iter() {
            sink.submit(event.clone());
        }
    }

    /// Runs `f` with publishing blocked.
    ///
    /// Every event is either fully published (durable log and all sinks)
    /// before `f` starts, or published after it returns. `f` must not publish.
    pub fn quiesced<R>(&self, f: impl FnOnce() -> R) -> R {
        let _sinks = self.sinks.write();
        f()
    }

    /// The durable log events are recorded into, if any.
    #[must_use]
    pub const fn log(&self) -> Option<&Arc<DurableLog>> {
        self.log.as_ref()
    }

    /// The host bridge.
    #[must_use]
    pub fn host(&self) -> &Arc<dyn HostBridge> {
        &self.host
    }
}

/// What happened to a single ingested event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    /// Folded into the last entry.
    Merged {
        /// Index of the entry that absorbed it.
        index: usize,
    },
    /// Appended as a new entry.
    Appended {
        /// Index of the new entry.
        index: usize,
        /// Entries trimmed from the front as a result.
        trimmed: usize,
    },
}

/// Totals for one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// New entries appended.
    pub appended: usize,
    /// Events merged into an existing entry.
    pub merged: usize,
    /// Entries trimmed from the front.
    pub trimmed: usize,
    /// Pause requests sent to the host.
    pub pause_requests: usize,
}

impl DrainReport {
    /// True if the store changed.
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.appended > 0 || self.merged > 0
    }
}

/// Owner-side half of ingestion.
pub struct IngestionPipeline {
    sink: IngestSink,
    tags: TagEngine,
    host: Arc<dyn HostBridge>,
    error_pause: bool,
}

impl IngestionPipeline {
    /// Creates a pipeline draining `sink`.
    #[must_use]
    pub fn new(sink: IngestSink, tags: TagEngine, host: Arc<dyn HostBridge>) -> Self {
        Self {
            sink,
            tags,
            host,
            error_pause: false,
        }
    }

    /// Enables or disables error pause.
    #[must_use]
    pub fn with_error_pause(mut self, enabled: bool) -> Self {
        self.error_pause = enabled;
        self
    }

    /// Sets error pause.
    pub const fn set_error_pause(&mut self, enabled: bool) {
        self.error_pause = enabled;
    }

    /// Whether error pause is active.
    #[must_use]
    pub const fn error_pause(&self) -> bool {
        self.error_pause
    }

    /// The sink this pipeline drains.
    #[must_use]
    pub const fn sink(&self) -> &IngestSink {
        &self.sink
    }

    /// The tag engine.
    #[must_use]
    pub const fn tags(&self) -> &TagEngine {
        &self.tags
    }

    /// Replaces the tag configuration and recomputes every stored entry's tags.
    pub fn reload_tags(&mut self, config: TagConfig, store: &mut EntryStore) {
        self.tags.reload(config);
        for entry in store.iter_mut() {
            self.tags.apply(entry);
        }
        info!(entries = store.len(), "recomputed tags after reload");
    }

    /// Drains every pending event into `store`, in enqueue order.
    pub fn drain(&mut self, store: &mut EntryStore, collapse: bool) -> DrainReport {
        let pending = self.sink.take_all();
        let mut report = DrainReport::default();
        if pending.is_empty() {
            return report;
        }

        for event in pending {
            if self.should_pause(event.severity) {
                self.host.request_pause();
                report.pause_requests += 1;
            }
            match self.apply(store, event, collapse) {
                Ingested::Merged { .. } => report.merged += 1,
                Ingested::Appended { trimmed, .. } => {
                    report.appended += 1;
                    report.trimmed += trimmed;
                }
            }
        }

        debug!(
            appended = report.appended,
            merged = report.merged,
            trimmed = report.trimmed,
            "drained pending events"
        );
        report
    }

    /// Ingests one event immediately, bypassing the queue.
    ///
    /// Uses the same merge policy and pause rule as [`Self::drain`].
    pub fn ingest_now(
        &mut self,
        store: &mut EntryStore,
        event: RawEvent,
        collapse: bool,
    ) -> Ingested {
        if self.should_pause(event.severity) {
            self.host.request_pause();
        }
        self.apply(store, event, collapse)
    }

    /// Seeds the store with already-persisted history, without pause checks.
    pub fn seed(
        &mut self,
        store: &mut EntryStore,
        events: impl IntoIterator<Item = RawEvent>,
        collapse: bool,
    ) {
        for event in events {
            self.apply(store, event, collapse);
        }
    }

    fn should_pause(&self, severity: Severity) -> bool {
        self.error_pause && severity.is_error_like() && self.host.is_live()
    }

    fn apply(&self, store: &mut EntryStore, event: RawEvent, collapse: bool) -> Ingested {
        if collapse {
            let identical = store
                .last()
                .is_some_and(|last| last.same_content(&event.content, &event.detail, event.severity));
            if identical {
                if let Some(index) = store.merge_into_last() {
                    return Ingested::Merged { index };
                }
            }
        }

        let mut entry = event.into_entry();
        self.tags.apply(&mut entry);
        let appended = store.append(entry);
        Ingested::Appended {
            index: appended.index,
            trimmed: appended.trimmed,
        }
    }
}
