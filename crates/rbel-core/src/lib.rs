//! Rbel Core - parse trees, converter pipeline and key management.
//!
//! This crate turns raw captured messages into navigable parse trees. It has
//! no notion of sockets or capture; the `rbel-proxy` crate feeds it.
//!
//! ## Features
//!
//! - Arena-backed parse tree with typed facets and path queries
//! - Dependency-ordered converter pipeline (HTTP, URI, gzip/deflate, form,
//!   JSON, base64, JWT, JWE)
//! - Optional VAU converters: traced keys, handshake sessions, AES-GCM data
//! - Key manager with precedence ordering and content-hash dedup
//! - Deterministic uuids for reassembled segments
//!
//! ## Architecture
//!
//! ```text
//! bytes + metadata
//!        │
//!        ▼
//!  RbelConverter::parse_message ──► ConversionContext
//!        │                               │
//!        │                 ┌─────────────┼──────────────┐
//!        │                 ▼             ▼              ▼
//!        │            converters    RbelKeyManager  SessionRegistry
//!        │            (sorted)       (shared)        (shared)
//!        ▼
//!  Arc<RbelMessage>  (read-only tree)
//! ```

pub mod aead;
pub mod config;
pub mod converter;
pub mod element;
mod error;
pub mod keys;
pub mod session;
mod uuid_gen;

pub use config::{KeyConfig, RbelConfig, SchedulerConfig, SchedulerMode};
pub use converter::{
    Activation, ConversionContext, Converter, ConverterRegistry, PreConversionHook,
    RbelConverter, SequenceTicket,
};
pub use element::{
    Facet, FacetKind, HandshakeStage, JsonShape, MessageMetadata, NodeId, NoteSeverity,
    RbelElement, RbelMessage,
};
pub use error::{ConversionError, CoreError, Result};
pub use keys::{RbelKey, RbelKeyManager};
pub use session::SessionRegistry;
pub use uuid_gen::generate_uuid;
