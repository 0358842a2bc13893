//! Rbel Proxy - stream reassembly and capture pipeline.
//!
//! Feeds captured TCP segments through per-connection queues into the
//! `rbel-core` converter pipeline and publishes the resulting parse trees.
//!
//! ## Features
//!
//! - Full-duplex reassembly with per-direction reads
//! - Deterministic message uuids derived from segment identity and offset
//! - HTTP framing of pipelined and split messages, request/response pairing
//! - Dual-mode scheduler (blocking or callback-based) with caller-runs backpressure
//! - Byte-bounded history, broadcast subscribers and JSON Lines trace files
//!
//! ## Architecture
//!
//! ```text
//! transport ──► TrafficCapture::ingest(RawSegment)
//!                      │
//!               AsyncByteQueue ──► frame ──► Scheduler ──► RbelConverter
//!                                                │
//!                          ┌─────────────────────┼──────────────┐
//!                          ▼                     ▼              ▼
//!                   MessageHistory         TraceWriter     subscribers
//! ```

pub mod capture;
pub mod connection;
pub mod error;
pub mod history;
pub mod queue;
pub mod scheduler;
pub mod segment;
pub mod trace;

pub use capture::TrafficCapture;
pub use connection::ConnectionIdentifier;
pub use error::{ProxyError, Result, SchedulerError, TraceError};
pub use history::MessageHistory;
pub use queue::AsyncByteQueue;
pub use scheduler::Scheduler;
pub use segment::{RawSegment, ReassembledMessage};
pub use trace::{TraceReader, TraceRecord, TraceWriter};
