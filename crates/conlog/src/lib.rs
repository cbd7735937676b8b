//! # conlog
//!
//! Console log capture for interactive hosts.
//!
//! This crate provides:
//!
//! - [`DurableLog`] — Buffered, crash-tolerant append-only log with per-process rotation
//! - [`TagEngine`] — Bracket, stack-trace and rule-based tag derivation
//! - [`EntryStore`] — Bounded in-memory history with message numbering
//! - [`EventDispatcher`] / [`IngestionPipeline`] — Thread-safe fan-out and single-owner drain
//! - [`FilterEngine`] — Cached search, range, severity and tag filtering with collapse
//! - [`ConsoleSession`] — One consumer's view tying the pieces together
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Instant;
//! use conlog::{ConsoleConfig, ConsoleSession, EventDispatcher, NoopHost, Severity};
//!
//! let dispatcher = Arc::new(EventDispatcher::new(None, Arc::new(NoopHost)));
//! let mut session = ConsoleSession::open(&ConsoleConfig::default(), Arc::clone(&dispatcher));
//!
//! dispatcher.publish("[Net] connected", "", Severity::Info);
//! session.tick(Instant::now());
//!
//! assert_eq!(session.row_count(), 1);
//! assert_eq!(session.histogram()[0].name, "Net");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod config;
pub mod durable;
pub mod error;
pub mod filter;
pub mod pipeline;
pub mod session;
pub mod store;
pub mod tags;
pub mod types;

// Re-export main types
pub use codec::{decode_record, encode_record};
pub use config::{ConsoleConfig, DurableLogConfig, SessionConfig, TagConfig};
pub use durable::{DurableLog, Rotation, read_tail};
pub use error::{ConsoleError, Result};
pub use filter::{FilterEngine, FilterState, Projection, SearchDebounce, TagCount, TagMode, ValueRange, project};
pub use pipeline::{
    DrainReport, EventDispatcher, HostBridge, IngestSink, Ingested, IngestionPipeline, NoopHost, SinkId,
};
pub use session::{ConsoleSession, TickReport, format_row};
pub use store::{Appended, EntryStore, shift_index};
pub use tags::TagEngine;
pub use types::{Entry, FilteredRow, MatchKind, MatchTarget, RawEvent, Severity, TagRule, TagSet};
