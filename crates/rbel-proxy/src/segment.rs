//! Captured byte chunks and messages reassembled from them.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use rbel_core::{generate_uuid, PreConversionHook};
use uuid::Uuid;

use crate::connection::ConnectionIdentifier;

/// One chunk of bytes as delivered by the transport.
#[derive(Clone)]
pub struct RawSegment {
    /// Payload.
    pub data: Bytes,
    /// Sending endpoint.
    pub sender: SocketAddr,
    /// Receiving endpoint.
    pub receiver: SocketAddr,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
    /// Identifier; derived by the queue when absent.
    pub uuid: Option<Uuid>,
    /// Identifier of the segment written before this one; linked by the queue when absent.
    pub previous_uuid: Option<Uuid>,
    /// Free-form metadata, merged into the message metadata.
    pub metadata: BTreeMap<String, String>,
    /// Hook run on the message before conversion.
    pub hook: Option<PreConversionHook>,
}

impl std::fmt::Debug for RawSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSegment")
            .field("len", &self.data.len())
            .field("sender", &self.sender)
            .field("receiver", &self.receiver)
            .field("uuid", &self.uuid)
            .field("previous_uuid", &self.previous_uuid)
            .field("metadata", &self.metadata)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl RawSegment {
    /// Creates a segment captured now.
    pub fn new(data: impl Into<Bytes>, sender: SocketAddr, receiver: SocketAddr) -> Self {
        Self {
            data: data.into(),
            sender,
            receiver,
            timestamp: Utc::now(),
            uuid: None,
            previous_uuid: None,
            metadata: BTreeMap::new(),
            hook: None,
        }
    }

    /// Sets a precomputed uuid.
    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    /// Sets a precomputed previous-uuid link.
    pub fn with_previous_uuid(mut self, previous: Uuid) -> Self {
        self.previous_uuid = Some(previous);
        self
    }

    /// Sets the capture time.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets the pre-conversion hook.
    pub fn with_hook(mut self, hook: PreConversionHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Connection this segment belongs to.
    pub fn connection(&self) -> ConnectionIdentifier {
        ConnectionIdentifier::new(self.sender, self.receiver)
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Contiguous bytes of one direction, synthesised from queued segments.
#[derive(Clone)]
pub struct ReassembledMessage {
    /// Unread bytes.
    pub data: Bytes,
    /// Uuids of the contributing segments, in order.
    pub source_uuids: Vec<Uuid>,
    /// Unread bytes taken from each contributing segment.
    pub(crate) source_lengths: Vec<usize>,
    /// Read offset into the first contributing segment.
    pub offset: usize,
    /// Previous-uuid link of the first contributing segment.
    pub previous_uuid: Option<Uuid>,
    /// Merged metadata; the first segment to set a key wins.
    pub metadata: BTreeMap<String, String>,
    /// Sending endpoint.
    pub sender: SocketAddr,
    /// Receiving endpoint.
    pub receiver: SocketAddr,
    /// Capture time of the first contributing segment.
    pub timestamp: DateTime<Utc>,
    /// Hooks of the contributing segments.
    pub hooks: Vec<PreConversionHook>,
}

impl std::fmt::Debug for ReassembledMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReassembledMessage")
            .field("len", &self.data.len())
            .field("source_uuids", &self.source_uuids)
            .field("offset", &self.offset)
            .field("sender", &self.sender)
            .field("receiver", &self.receiver)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl ReassembledMessage {
    /// Starts an empty span at `offset` into `segment`.
    pub(crate) fn start(segment: &RawSegment, offset: usize) -> Self {
        Self {
            data: Bytes::new(),
            source_uuids: Vec::new(),
            source_lengths: Vec::new(),
            offset,
            previous_uuid: segment.previous_uuid,
            metadata: BTreeMap::new(),
            sender: segment.sender,
            receiver: segment.receiver,
            timestamp: segment.timestamp,
            hooks: Vec::new(),
        }
    }

    /// Builds a span from the unread bytes of consecutive segments, the
    /// first of which is read from `offset`. The bytes are copied at most once.
    pub(crate) fn assemble<'a>(
        first: &RawSegment,
        offset: usize,
        parts: impl IntoIterator<Item = (&'a RawSegment, Uuid, Bytes)>,
    ) -> Self {
        let mut message = Self::start(first, offset);
        let mut chunks = Vec::new();
        for (segment, uuid, unread) in parts {
            message.absorb(segment, uuid, unread.len());
            chunks.push(unread);
        }
        message.data = match chunks.as_slice() {
            [single] => single.clone(),
            _ => {
                let mut joined = BytesMut::with_capacity(message.source_lengths.iter().sum());
                for chunk in &chunks {
                    joined.extend_from_slice(chunk);
                }
                joined.freeze()
            }
        };
        message
    }

    /// Records a contributing segment; its bytes are joined by the caller.
    fn absorb(&mut self, segment: &RawSegment, uuid: Uuid, len: usize) {
        self.source_uuids.push(uuid);
        self.source_lengths.push(len);
        for (k, v) in &segment.metadata {
            self.metadata.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self.hooks.extend(segment.hook.iter().cloned());
    }

    /// Length of the unread bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if nothing is unread.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Identifier of a message starting at the head of this span.
    ///
    /// At offset zero this is the first segment's uuid; otherwise it is
    /// derived from that uuid and the offset, so independent observers agree.
    pub fn message_uuid(&self) -> Uuid {
        match (self.offset, self.source_uuids.first()) {
            (0, Some(uuid)) => *uuid,
            (offset, Some(uuid)) => generate_uuid(&uuid.to_string(), offset as u64),
            (_, None) => Uuid::new_v4(),
        }
    }

    /// The first `len` bytes, restricted to the segments that contribute to them.
    pub fn prefix(&self, len: usize) -> ReassembledMessage {
        let len = len.min(self.data.len());
        let mut covered = 0;
        let mut count = 0;
        for length in &self.source_lengths {
            if covered >= len && count > 0 {
                break;
            }
            covered += length;
            count += 1;
        }
        let count = count.min(self.source_uuids.len());
        ReassembledMessage {
            data: self.data.slice(..len),
            source_uuids: self.source_uuids[..count].to_vec(),
            source_lengths: self.source_lengths[..count].to_vec(),
            offset: self.offset,
            previous_uuid: self.previous_uuid,
            metadata: self.metadata.clone(),
            sender: self.sender,
            receiver: self.receiver,
            timestamp: self.timestamp,
            hooks: self.hooks.clone(),
        }
    }
}
