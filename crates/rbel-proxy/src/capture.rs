//! Capture pipeline: segments in, finished parse trees out.
//!
//! ## Architecture
//!
//! ```text
//! RawSegment ──► AsyncByteQueue (per connection)
//!                    │ peek / frame_http / consume
//!                    ▼
//!             ReassembledMessage ── reserve sequence (arrival order)
//!                    │
//!                    ▼
//!             Scheduler ──► RbelConverter::parse_message_with (blocking pool)
//!                    │
//!                    ▼ continuation
//!             publication slot (released in dispatch order)
//!                    │
//!                    ▼
//!      MessageHistory + trace file + broadcast subscribers
//! ```
//!
//! Conversions may finish in any order. Each dispatch reserves a publication
//! slot together with its sequence number; a finished message waits until
//! every earlier slot has been filled or abandoned.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rbel_core::converter::http::{frame_http, Framing};
use rbel_core::{MessageMetadata, RbelConfig, RbelConverter, RbelMessage, SequenceTicket};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::connection::ConnectionIdentifier;
use crate::error::Result;
use crate::history::MessageHistory;
use crate::queue::AsyncByteQueue;
use crate::scheduler::Scheduler;
use crate::segment::{RawSegment, ReassembledMessage};
use crate::trace::{TraceReader, TraceWriter};

/// Requests remembered per connection while waiting for their response.
const MAX_PENDING_REQUESTS: usize = 64;

/// Capacity of the broadcast channel for finished messages.
const BROADCAST_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct FramingState {
    last_message_uuid: Option<Uuid>,
    pending_requests: VecDeque<(SocketAddr, Uuid)>,
}

impl FramingState {
    /// Returns the request a response from `responder` answers, if known.
    fn pair(&mut self, message: &ReassembledMessage, uuid: Uuid) -> Option<Uuid> {
        if message.data.starts_with(b"HTTP/") {
            let index = self
                .pending_requests
                .iter()
                .position(|(requester, _)| *requester == message.receiver)?;
            return self.pending_requests.remove(index).map(|(_, request)| request);
        }
        self.pending_requests.push_back((message.sender, uuid));
        if self.pending_requests.len() > MAX_PENDING_REQUESTS {
            self.pending_requests.pop_front();
        }
        None
    }
}

#[derive(Debug)]
struct ConnectionState {
    queue: AsyncByteQueue,
    framing: Mutex<FramingState>,
}

/// Finished messages held back until every earlier slot is settled.
#[derive(Debug, Default)]
struct ReleaseOrder {
    issued: u64,
    next: u64,
    /// `None` marks a slot whose conversion failed or was dropped.
    settled: BTreeMap<u64, Option<Arc<RbelMessage>>>,
}

/// Where finished messages go.
#[derive(Clone)]
struct Publisher {
    history: Arc<MessageHistory>,
    events: broadcast::Sender<Arc<RbelMessage>>,
    trace: Option<Arc<Mutex<TraceWriter>>>,
    order: Arc<Mutex<ReleaseOrder>>,
}

impl Publisher {
    /// Reserves a publication slot and a sequence number in one step, so
    /// both follow dispatch order.
    fn reserve(&self, converter: &RbelConverter) -> (PublishSlot, SequenceTicket) {
        let mut order = self.order.lock();
        let ticket = converter.reserve_sequence();
        let slot = PublishSlot {
            index: order.issued,
            publisher: Some(self.clone()),
        };
        order.issued += 1;
        (slot, ticket)
    }

    fn settle(&self, index: u64, message: Option<Arc<RbelMessage>>) {
        let mut order = self.order.lock();
        order.settled.insert(index, message);
        loop {
            let next = order.next;
            let Some(entry) = order.settled.remove(&next) else {
                break;
            };
            order.next += 1;
            if let Some(message) = entry {
                self.publish(message);
            }
        }
        if !order.settled.is_empty() {
            tracing::trace!(
                "{} finished messages wait for slot {}",
                order.settled.len(),
                order.next
            );
        }
    }

    fn publish(&self, message: Arc<RbelMessage>) {
        tracing::debug!(
            "Message #{} {} ({} bytes, {} elements)",
            message.metadata().sequence_number,
            message.uuid(),
            message.size(),
            message.element_count()
        );
        self.history.push(message.clone());
        if let Some(trace) = &self.trace {
            if let Err(e) = trace.lock().write(&message) {
                tracing::warn!("Failed to write trace record for {}: {}", message.uuid(), e);
            }
        }
        // No subscribers is fine.
        let _ = self.events.send(message);
    }
}

/// A reserved place in the publication order.
///
/// Dropping an unfilled slot abandons it, so later messages are not held back.
struct PublishSlot {
    index: u64,
    publisher: Option<Publisher>,
}

impl PublishSlot {
    fn fill(mut self, message: Option<Arc<RbelMessage>>) {
        if let Some(publisher) = self.publisher.take() {
            publisher.settle(self.index, message);
        }
    }
}

impl Drop for PublishSlot {
    fn drop(&mut self) {
        if let Some(publisher) = self.publisher.take() {
            tracing::debug!("Publication slot {} abandoned", self.index);
            publisher.settle(self.index, None);
        }
    }
}

/// Turns captured segments into finished messages.
pub struct TrafficCapture {
    converter: Arc<RbelConverter>,
    scheduler: Arc<Scheduler>,
    connections: Mutex<HashMap<ConnectionIdentifier, Arc<ConnectionState>>>,
    publisher: Publisher,
}

impl std::fmt::Debug for TrafficCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrafficCapture")
            .field("converter", &self.converter)
            .field("scheduler", &self.scheduler)
            .field("connections", &self.connections.lock().len())
            .field("history", &self.publisher.history.len())
            .finish()
    }
}

impl TrafficCapture {
    /// Builds the pipeline, scheduler and optional trace file from configuration.
    pub fn new(config: RbelConfig) -> Result<Self> {
        let scheduler = Arc::new(Scheduler::new(&config.scheduler)?);
        let converter = Arc::new(RbelConverter::new(config)?);
        Self::from_parts(converter, scheduler)
    }

    /// Builds a capture around an existing converter and scheduler.
    pub fn from_parts(converter: Arc<RbelConverter>, scheduler: Arc<Scheduler>) -> Result<Self> {
        let config = converter.config();
        let trace = match &config.trace_file {
            Some(path) => {
                tracing::info!("Writing trace to {:?}", path);
                Some(Arc::new(Mutex::new(TraceWriter::append(path)?)))
            }
            None => None,
        };
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        let publisher = Publisher {
            history: Arc::new(MessageHistory::new(config.max_history_bytes)),
            events,
            trace,
            order: Arc::new(Mutex::new(ReleaseOrder::default())),
        };
        Ok(Self {
            converter,
            scheduler,
            connections: Mutex::new(HashMap::new()),
            publisher,
        })
    }

    /// The conversion pipeline.
    pub fn converter(&self) -> &Arc<RbelConverter> {
        &self.converter
    }

    /// The scheduler running conversions.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Finished messages kept in memory.
    pub fn history(&self) -> &Arc<MessageHistory> {
        &self.publisher.history
    }

    /// Receives every finished message from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RbelMessage>> {
        self.publisher.events.subscribe()
    }

    /// Number of connections with a live queue.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    fn connection(&self, id: ConnectionIdentifier) -> Arc<ConnectionState> {
        self.connections
            .lock()
            .entry(id)
            .or_insert_with(|| {
                tracing::debug!("New connection {}", id);
                Arc::new(ConnectionState {
                    queue: AsyncByteQueue::new(id),
                    framing: Mutex::new(FramingState::default()),
                })
            })
            .clone()
    }

    /// Queues a segment and dispatches every message it completes.
    ///
    /// Returns the number of messages dispatched.
    pub fn ingest(&self, segment: RawSegment) -> usize {
        let state = self.connection(segment.connection());
        let mut framing = state.framing.lock();
        state.queue.write(segment);

        let mut dispatched = 0;
        while let Some(pending) = state.queue.peek() {
            let message = match frame_http(&pending.data) {
                Framing::Complete(len) => pending.prefix(len),
                Framing::Incomplete => break,
                Framing::NotHttp => pending,
            };
            state.queue.consume(message.len());
            self.dispatch(&mut framing, message);
            dispatched += 1;
        }
        dispatched
    }

    /// Dispatches whatever is left on a connection and forgets it.
    pub fn close_connection(&self, id: ConnectionIdentifier) -> usize {
        let Some(state) = self.connections.lock().remove(&id) else {
            return 0;
        };
        let mut framing = state.framing.lock();
        let mut dispatched = 0;
        while let Some(rest) = state.queue.peek() {
            state.queue.consume(rest.len());
            self.dispatch(&mut framing, rest);
            dispatched += 1;
        }
        tracing::debug!("Closed connection {} ({} trailing messages)", id, dispatched);
        dispatched
    }

    /// Converts every record of a trace file again.
    ///
    /// Records are whole messages; they bypass framing but keep their uuids.
    pub fn replay(&self, reader: TraceReader) -> Result<usize> {
        let mut replayed = 0;
        for record in reader {
            let segment = record?.to_segment()?;
            let state = self.connection(segment.connection());
            let mut framing = state.framing.lock();
            let uuid = segment.uuid.unwrap_or_else(Uuid::new_v4);
            let message =
                ReassembledMessage::assemble(&segment, 0, [(&segment, uuid, segment.data.clone())]);
            self.dispatch(&mut framing, message);
            replayed += 1;
        }
        tracing::info!("Replayed {} messages", replayed);
        Ok(replayed)
    }

    fn dispatch(&self, framing: &mut FramingState, message: ReassembledMessage) {
        let uuid = message.message_uuid();
        let mut metadata = MessageMetadata::with_uuid(uuid)
            .with_endpoints(message.sender, message.receiver);
        metadata.previous_uuid = framing.last_message_uuid.or(message.previous_uuid);
        metadata.timestamp = message.timestamp;
        metadata.source_uuids = message.source_uuids.clone();
        metadata.extra = message.metadata.clone();
        metadata.paired_request = framing.pair(&message, uuid);
        framing.last_message_uuid = Some(uuid);

        let (slot, ticket) = self.publisher.reserve(&self.converter);
        let converter = self.converter.clone();
        let ReassembledMessage { data, hooks, .. } = message;

        self.scheduler.execute(
            async move {
                tokio::task::spawn_blocking(move || {
                    converter.parse_message_with(ticket, data, metadata, &hooks)
                })
                .await
            },
            move |result| match result {
                Ok(Ok(message)) => slot.fill(Some(message)),
                Ok(Err(e)) => {
                    tracing::warn!("Conversion of {} failed: {}", uuid, e);
                    slot.fill(None);
                }
                Err(e) => {
                    tracing::warn!("Conversion of {} not completed: {}", uuid, e);
                    slot.fill(None);
                }
            },
        );
    }

    /// Waits until every dispatched message has been published or dropped.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.scheduler.wait_idle(timeout)
    }

    /// Flushes the trace file, if any.
    pub fn flush_trace(&self) -> Result<()> {
        if let Some(trace) = &self.publisher.trace {
            trace.lock().flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rbel_core::{SchedulerConfig, SchedulerMode};

    use super::*;

    fn client() -> SocketAddr {
        "10.0.0.1:50000".parse().unwrap()
    }

    fn server() -> SocketAddr {
        "10.0.0.2:80".parse().unwrap()
    }

    fn capture(mode: SchedulerMode) -> TrafficCapture {
        let config = RbelConfig {
            scheduler: SchedulerConfig {
                mode,
                worker_pool_size: Some(2),
                forward_timeout_ms: 5_000,
            },
            ..RbelConfig::default()
        };
        TrafficCapture::new(config).unwrap()
    }

    #[test]
    fn split_request_is_dispatched_once_complete() {
        let capture = capture(SchedulerMode::Sync);
        assert_eq!(
            capture.ingest(RawSegment::new(&b"GET /a HTTP/1.1\r\nHost: x\r\n"[..], client(), server())),
            0
        );
        assert_eq!(
            capture.ingest(RawSegment::new(&b"\r\n"[..], client(), server())),
            1
        );
        let message = capture.history().last().unwrap();
        assert_eq!(message.metadata().source_uuids.len(), 2);
        assert_eq!(message.metadata().sender, Some(client()));
    }

    #[test]
    fn pipelined_requests_are_split() {
        let capture = capture(SchedulerMode::Sync);
        let two = b"GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\n";
        assert_eq!(capture.ingest(RawSegment::new(&two[..], client(), server())), 2);
        let history = capture.history().snapshot();
        assert_eq!(history.len(), 2);
        assert_ne!(history[0].uuid(), history[1].uuid());
        assert_eq!(history[1].metadata().previous_uuid, Some(history[0].uuid()));
    }

    #[test]
    fn responses_pair_with_requests() {
        let capture = capture(SchedulerMode::Sync);
        capture.ingest(RawSegment::new(&b"GET / HTTP/1.1\r\n\r\n"[..], client(), server()));
        capture.ingest(RawSegment::new(
            &b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"[..],
            server(),
            client(),
        ));
        let history = capture.history().snapshot();
        assert_eq!(history[1].metadata().paired_request, Some(history[0].uuid()));
    }

    #[test]
    fn close_flushes_partial_data() {
        let capture = capture(SchedulerMode::Sync);
        capture.ingest(RawSegment::new(&b"GET / HTTP/1.1\r\n"[..], client(), server()));
        assert_eq!(capture.connection_count(), 1);
        assert_eq!(capture.close_connection(ConnectionIdentifier::new(client(), server())), 1);
        assert_eq!(capture.connection_count(), 0);
        assert_eq!(capture.history().len(), 1);
    }

    #[test]
    fn async_mode_publishes_in_background() {
        let capture = capture(SchedulerMode::Async);
        let mut events = capture.subscribe();
        capture.ingest(RawSegment::new(&b"not http at all"[..], client(), server()));
        assert!(capture.wait_idle(Duration::from_secs(10)));
        assert_eq!(capture.history().len(), 1);
        assert_eq!(events.try_recv().unwrap().raw().as_ref(), b"not http at all");
    }

    #[test]
    fn pending_requests_are_capped() {
        let mut framing = FramingState::default();
        let base = ReassembledMessage::start(&RawSegment::new(&b"x"[..], client(), server()), 0);
        for _ in 0..(MAX_PENDING_REQUESTS + 10) {
            framing.pair(&base, Uuid::new_v4());
        }
        assert_eq!(framing.pending_requests.len(), MAX_PENDING_REQUESTS);
    }

    #[test]
    fn async_publication_follows_dispatch_order() {
        let capture = capture(SchedulerMode::Async);
        for i in 0..50 {
            let request = format!("GET /item/{} HTTP/1.1\r\n\r\n", i);
            capture.ingest(RawSegment::new(request.into_bytes(), client(), server()));
        }
        assert!(capture.wait_idle(Duration::from_secs(10)));

        let history = capture.history().snapshot();
        assert_eq!(history.len(), 50);
        assert!(history
            .windows(2)
            .all(|w| w[0].metadata().sequence_number < w[1].metadata().sequence_number));
        for (i, message) in history.iter().enumerate() {
            let path = message.find_first("$.path").unwrap();
            assert_eq!(path.content_lossy(), format!("/item/{}", i));
        }
    }

    #[test]
    fn later_message_waits_for_earlier_slot() {
        let capture = capture(SchedulerMode::Sync);
        let converter = capture.converter().clone();
        let (first, first_ticket) = capture.publisher.reserve(&converter);
        let (second, second_ticket) = capture.publisher.reserve(&converter);
        assert!(first_ticket.sequence() < second_ticket.sequence());

        let late = converter.parse_message_with(second_ticket, &b"second"[..], MessageMetadata::new(), &[]);
        second.fill(Some(late));
        assert!(capture.history().is_empty());

        let early = converter.parse_message_with(first_ticket, &b"first"[..], MessageMetadata::new(), &[]);
        first.fill(Some(early));
        let history = capture.history().snapshot();
        assert_eq!(history[0].raw().as_ref(), b"first");
        assert_eq!(history[1].raw().as_ref(), b"second");
    }

    #[test]
    fn abandoned_slot_releases_later_messages() {
        let capture = capture(SchedulerMode::Sync);
        let converter = capture.converter().clone();
        let (failed, _) = capture.publisher.reserve(&converter);
        let (done, ticket) = capture.publisher.reserve(&converter);
        done.fill(Some(converter.parse_message_with(ticket, &b"x"[..], MessageMetadata::new(), &[])));
        assert!(capture.history().is_empty());

        drop(failed);
        assert_eq!(capture.history().len(), 1);
    }

    #[test]
    fn malformed_chunked_request_does_not_stall_connection() {
        let capture = capture(SchedulerMode::Sync);
        let broken = b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\nabc\r\n";
        assert_eq!(capture.ingest(RawSegment::new(&broken[..], client(), server())), 1);
        assert_eq!(
            capture.ingest(RawSegment::new(&b"GET /next HTTP/1.1\r\n\r\n"[..], client(), server())),
            1
        );
        let next = capture.history().last().unwrap();
        assert_eq!(next.find_first("$.path").unwrap().content_lossy(), "/next");
    }
}
