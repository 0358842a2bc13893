//! JSON Lines trace files of captured messages.
//!
//! One record per line, raw bytes base64-encoded. Parse trees are not
//! stored; replaying a trace runs the converters again, so a trace taken
//! with VAU disabled can be decrypted later with the right keys.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::net::SocketAddr;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rbel_core::RbelMessage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TraceError;
use crate::segment::RawSegment;

const UNKNOWN_ENDPOINT: SocketAddr = SocketAddr::V4(std::net::SocketAddrV4::new(
    std::net::Ipv4Addr::UNSPECIFIED,
    0,
));

/// A captured message as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub uuid: Uuid,
    pub sequence_number: u64,
    pub sender: Option<SocketAddr>,
    pub receiver: Option<SocketAddr>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Raw message bytes, standard base64.
    pub raw: String,
}

impl TraceRecord {
    /// Builds a record from a finished message.
    pub fn from_message(message: &RbelMessage) -> Self {
        let metadata = message.metadata();
        Self {
            uuid: metadata.uuid,
            sequence_number: metadata.sequence_number,
            sender: metadata.sender,
            receiver: metadata.receiver,
            timestamp: metadata.timestamp,
            previous_uuid: metadata.previous_uuid,
            metadata: metadata.extra.clone(),
            raw: STANDARD.encode(message.raw()),
        }
    }

    /// Decodes the raw bytes.
    pub fn raw_bytes(&self) -> Result<Bytes, TraceError> {
        STANDARD
            .decode(&self.raw)
            .map(Bytes::from)
            .map_err(|e| TraceError::Payload {
                uuid: self.uuid,
                reason: e.to_string(),
            })
    }

    /// Turns the record back into a segment for re-ingestion.
    ///
    /// The stored uuid is kept, so replayed messages keep their identity.
    pub fn to_segment(&self) -> Result<RawSegment, TraceError> {
        let mut segment = RawSegment::new(
            self.raw_bytes()?,
            self.sender.unwrap_or(UNKNOWN_ENDPOINT),
            self.receiver.unwrap_or(UNKNOWN_ENDPOINT),
        )
        .with_uuid(self.uuid)
        .with_timestamp(self.timestamp);
        segment.previous_uuid = self.previous_uuid;
        segment.metadata = self.metadata.clone();
        Ok(segment)
    }
}

/// Appends records to a trace file.
pub struct TraceWriter {
    out: BufWriter<File>,
    written: usize,
}

impl std::fmt::Debug for TraceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceWriter")
            .field("written", &self.written)
            .finish()
    }
}

impl TraceWriter {
    /// Creates (or truncates) a trace file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        Ok(Self::from_file(File::create(path)?))
    }

    /// Opens a trace file for appending, creating it if needed.
    pub fn append(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_file(file))
    }

    fn from_file(file: File) -> Self {
        Self {
            out: BufWriter::new(file),
            written: 0,
        }
    }

    /// Writes one message.
    pub fn write(&mut self, message: &RbelMessage) -> Result<(), TraceError> {
        self.write_record(&TraceRecord::from_message(message))
    }

    /// Writes one record.
    pub fn write_record(&mut self, record: &TraceRecord) -> Result<(), TraceError> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    /// Records written through this writer.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Flushes buffered records to disk.
    pub fn flush(&mut self) -> Result<(), TraceError> {
        self.out.flush()?;
        Ok(())
    }
}

impl Drop for TraceWriter {
    fn drop(&mut self) {
        if let Err(e) = self.out.flush() {
            tracing::warn!("Failed to flush trace file: {}", e);
        }
    }
}

/// Reads records back from a trace file.
#[derive(Debug)]
pub struct TraceReader {
    lines: Lines<BufReader<File>>,
    line: usize,
}

impl TraceReader {
    /// Opens a trace file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let file = File::open(path)?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            line: 0,
        })
    }
}

impl Iterator for TraceReader {
    type Item = Result<TraceRecord, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let text = match self.lines.next()? {
                Ok(text) => text,
                Err(e) => return Some(Err(e.into())),
            };
            self.line += 1;
            if text.trim().is_empty() {
                continue;
            }
            let line = self.line;
            return Some(
                serde_json::from_str(&text).map_err(|source| TraceError::Record { line, source }),
            );
        }
    }
}
