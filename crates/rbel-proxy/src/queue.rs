//! Per-connection byte reassembly.
//!
//! Both directions of a connection share one ordered segment list. Reads
//! look only at the direction of the head segment, skipping (but keeping)
//! segments sent the other way, so each direction drains in its own order.
//!
//! ```text
//! write:  [C "Hello"] [S "Hi"] [C " World"]
//! peek:   "Hello World"            (head direction = C)
//! consume(11)
//! peek:   "Hi"                     (head direction = S)
//! ```

use std::collections::VecDeque;

use parking_lot::Mutex;
use rbel_core::generate_uuid;
use uuid::Uuid;

use crate::connection::ConnectionIdentifier;
use crate::segment::{RawSegment, ReassembledMessage};

#[derive(Debug)]
struct QueuedSegment {
    segment: RawSegment,
    uuid: Uuid,
    cursor: usize,
}

impl QueuedSegment {
    fn unread(&self) -> usize {
        self.segment.data.len() - self.cursor
    }
}

#[derive(Debug, Default)]
struct QueueState {
    segments: VecDeque<QueuedSegment>,
    last_uuid: Option<Uuid>,
    bytes_written: u64,
}

impl QueueState {
    fn head_direction(&self) -> Option<std::net::SocketAddr> {
        self.segments.front().map(|s| s.segment.sender)
    }
}

/// Ordered byte accumulator for one connection.
#[derive(Debug)]
pub struct AsyncByteQueue {
    connection: ConnectionIdentifier,
    state: Mutex<QueueState>,
}

impl AsyncByteQueue {
    /// Creates an empty queue.
    pub fn new(connection: ConnectionIdentifier) -> Self {
        Self {
            connection,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// The connection this queue belongs to.
    pub fn connection(&self) -> ConnectionIdentifier {
        self.connection
    }

    /// Appends a segment and returns it with uuid and previous-uuid filled in.
    ///
    /// A missing previous-uuid is linked to the last segment written here.
    /// A missing uuid is derived from that link (or the connection) and the
    /// number of bytes written so far. Empty segments are linked but not queued.
    pub fn write(&self, mut segment: RawSegment) -> RawSegment {
        let mut state = self.state.lock();
        if segment.previous_uuid.is_none() {
            segment.previous_uuid = state.last_uuid;
        }
        let uuid = match segment.uuid {
            Some(uuid) => uuid,
            None => {
                let source = segment
                    .previous_uuid
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| self.connection.to_string());
                generate_uuid(&source, state.bytes_written)
            }
        };
        segment.uuid = Some(uuid);
        state.last_uuid = Some(uuid);
        state.bytes_written += segment.data.len() as u64;

        if !segment.data.is_empty() {
            state.segments.push_back(QueuedSegment {
                segment: segment.clone(),
                uuid,
                cursor: 0,
            });
        }
        tracing::trace!(
            "Queued {} bytes from {} on {}",
            segment.data.len(),
            segment.sender,
            self.connection
        );
        segment
    }

    /// Unread bytes of the head direction, or `None` if the queue is empty.
    pub fn peek(&self) -> Option<ReassembledMessage> {
        let state = self.state.lock();
        let head = state.segments.front()?;
        let direction = head.segment.sender;
        let parts = state
            .segments
            .iter()
            .filter(|q| q.segment.sender == direction)
            .map(|q| (&q.segment, q.uuid, q.segment.data.slice(q.cursor..)));
        Some(ReassembledMessage::assemble(&head.segment, head.cursor, parts))
    }

    /// Marks `n` bytes of the head direction as read.
    ///
    /// Fully read segments are dropped. Consuming more than is available
    /// drains the direction.
    pub fn consume(&self, n: usize) {
        let mut state = self.state.lock();
        let Some(direction) = state.head_direction() else {
            if n > 0 {
                tracing::trace!("consume({}) on empty queue {}", n, self.connection);
            }
            return;
        };

        let mut remaining = n;
        for queued in state
            .segments
            .iter_mut()
            .filter(|q| q.segment.sender == direction)
        {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(queued.unread());
            queued.cursor += take;
            remaining -= take;
        }
        state.segments.retain(|q| q.unread() > 0);
        if remaining > 0 {
            tracing::trace!(
                "Over-consumed {} bytes from {} on {}",
                remaining,
                direction,
                self.connection
            );
        }
    }

    /// Unread bytes in the head direction.
    pub fn available_bytes(&self) -> usize {
        let state = self.state.lock();
        let Some(direction) = state.head_direction() else {
            return 0;
        };
        state
            .segments
            .iter()
            .filter(|q| q.segment.sender == direction)
            .map(QueuedSegment::unread)
            .sum()
    }

    /// Returns true if no unread bytes remain in the head direction.
    pub fn is_empty(&self) -> bool {
        self.available_bytes() == 0
    }

    /// Total bytes ever written.
    pub fn total_bytes_written(&self) -> u64 {
        self.state.lock().bytes_written
    }

    /// Number of queued segments (both directions).
    pub fn len(&self) -> usize {
        self.state.lock().segments.len()
    }

    /// Drops all queued segments. The uuid chain is kept.
    pub fn clear(&self) {
        self.state.lock().segments.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    fn client() -> SocketAddr {
        "10.0.0.1:50000".parse().unwrap()
    }

    fn server() -> SocketAddr {
        "10.0.0.2:80".parse().unwrap()
    }

    fn queue() -> AsyncByteQueue {
        AsyncByteQueue::new(ConnectionIdentifier::new(client(), server()))
    }

    fn from_client(data: &'static [u8]) -> RawSegment {
        RawSegment::new(data, client(), server())
    }

    fn from_server(data: &'static [u8]) -> RawSegment {
        RawSegment::new(data, server(), client())
    }

    #[test]
    fn hello_world_hi() {
        let q = queue();
        q.write(from_client(b"Hello"));
        q.write(from_server(b"Hi"));
        q.write(from_client(b" World"));

        let peeked = q.peek().unwrap();
        assert_eq!(peeked.data.as_ref(), b"Hello World");
        assert_eq!(peeked.source_uuids.len(), 2);
        assert_eq!(q.available_bytes(), 11);

        q.consume(11);
        let peeked = q.peek().unwrap();
        assert_eq!(peeked.data.as_ref(), b"Hi");
        assert_eq!(peeked.sender, server());
    }

    #[test]
    fn round_trip_empties_queue() {
        let q = queue();
        let chunks: [&'static [u8]; 3] = [b"abc", b"defgh", b"i"];
        for chunk in chunks {
            q.write(from_client(chunk));
        }
        q.consume(9);
        assert!(q.is_empty());
        assert_eq!(q.available_bytes(), 0);
        assert!(q.peek().is_none());
        assert_eq!(q.total_bytes_written(), 9);
    }

    #[test]
    fn partial_consume_advances_cursor() {
        let q = queue();
        q.write(from_client(b"abcdef"));
        q.consume(2);
        let peeked = q.peek().unwrap();
        assert_eq!(peeked.data.as_ref(), b"cdef");
        assert_eq!(peeked.offset, 2);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn over_consumption_drains_direction_only() {
        let q = queue();
        q.write(from_client(b"abc"));
        q.write(from_server(b"xyz"));
        q.consume(100);
        let peeked = q.peek().unwrap();
        assert_eq!(peeked.data.as_ref(), b"xyz");
        q.consume(100);
        assert!(q.is_empty());
        q.consume(1);
    }

    #[test]
    fn peek_does_not_mutate() {
        let q = queue();
        q.write(from_client(b"abc"));
        let first = q.peek().unwrap();
        let second = q.peek().unwrap();
        assert_eq!(first.data, second.data);
        assert_eq!(first.source_uuids, second.source_uuids);
    }

    #[test]
    fn write_links_and_derives_uuids() {
        let q = queue();
        let first = q.write(from_client(b"abc"));
        let second = q.write(from_server(b"de"));
        assert_eq!(first.previous_uuid, None);
        assert_eq!(second.previous_uuid, first.uuid);

        let expected_first = generate_uuid(&q.connection().to_string(), 0);
        assert_eq!(first.uuid, Some(expected_first));
        let expected_second = generate_uuid(&expected_first.to_string(), 3);
        assert_eq!(second.uuid, Some(expected_second));
    }

    #[test]
    fn independent_queues_agree_on_uuids() {
        let a = queue();
        let b = queue();
        for q in [&a, &b] {
            q.write(from_client(b"GET / HTTP/1.1\r\n\r\n"));
            q.write(from_server(b"HTTP/1.1 204 No Content\r\n\r\n"));
        }
        assert_eq!(a.peek().unwrap().source_uuids, b.peek().unwrap().source_uuids);
    }

    #[test]
    fn precomputed_uuid_is_kept() {
        let q = queue();
        let uuid = Uuid::new_v4();
        let written = q.write(from_client(b"abc").with_uuid(uuid));
        assert_eq!(written.uuid, Some(uuid));
        assert_eq!(q.peek().unwrap().message_uuid(), uuid);
    }

    #[test]
    fn interleaved_directions_keep_relative_order() {
        let q = queue();
        q.write(from_server(b"1"));
        q.write(from_client(b"a"));
        q.write(from_server(b"2"));
        q.write(from_client(b"b"));
        q.write(from_server(b"3"));
        assert_eq!(q.peek().unwrap().data.as_ref(), b"123");
        q.consume(2);
        // "1" and "2" are gone, so the client segment is now at the head.
        assert_eq!(q.peek().unwrap().data.as_ref(), b"ab");
        q.consume(2);
        assert_eq!(q.peek().unwrap().data.as_ref(), b"3");
        q.consume(1);
        assert!(q.is_empty());
    }

    #[test]
    fn clear_drops_segments() {
        let q = queue();
        q.write(from_client(b"abc"));
        q.clear();
        assert!(q.peek().is_none());
        assert_eq!(q.total_bytes_written(), 3);
    }
}
