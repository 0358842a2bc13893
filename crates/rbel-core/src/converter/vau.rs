//! VAU channel: handshake correlation and AES-GCM data messages.
//!
//! ## Data message layout
//!
//! ```text
//! version(1) | pu(1) | request(1) | counter(8, BE) | key_id(32) | iv(12) | ciphertext+tag
//! \_______________________ AAD (43 bytes) ______________________/
//! ```
//!
//! Keys are looked up by name `<key_id hex>_c2s` (requests) or
//! `<key_id hex>_s2c` (responses) first, then every other AES-256 key in
//! precedence order. Keys arrive from configuration, key folders, or the
//! `VAU-nonPU-Tracing` header of the message itself.
//!
//! ## Handshake
//!
//! `M1` opens a session keyed by the SHA-256 of its body. `M2` finds that
//! session through its paired request and binds the announced `KeyID`.
//! `M3`/`M4` and data messages find the session by key id.

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use super::http::enclosing_http_message;
use super::{Activation, ConversionContext, Converter};
use crate::aead;
use crate::element::{Facet, FacetKind, HandshakeStage, NodeId, NoteSeverity};
use crate::error::ConversionError;
use crate::keys::{RbelKey, PRECEDENCE_TRACED_KEY};

/// Converter family name used in `activate_converters`.
pub const FEATURE: &str = "vau";

/// Header carrying the traced channel keys.
pub const TRACING_HEADER: &str = "VAU-nonPU-Tracing";

/// Only supported data message version.
pub const VERSION: u8 = 0x02;

/// Length of the fixed header, which is also the AAD.
pub const HEADER_LEN: usize = 43;

/// Fixed header of a data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VauHeader {
    pub version: u8,
    pub pu: bool,
    pub is_request: bool,
    pub request_counter: u64,
    pub key_id: [u8; 32],
}

impl VauHeader {
    /// Parses the header of a data message.
    ///
    /// `None` unless the version matches and there is room for IV and tag.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN + aead::NONCE_SIZE + aead::TAG_SIZE || data[0] != VERSION {
            return None;
        }
        let request_counter = u64::from_be_bytes(data[3..11].try_into().ok()?);
        let key_id: [u8; 32] = data[11..HEADER_LEN].try_into().ok()?;
        Some(Self {
            version: data[0],
            pu: data[1] == 1,
            is_request: data[2] == 1,
            request_counter,
            key_id,
        })
    }

    /// Serialises the header.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.version;
        out[1] = u8::from(self.pu);
        out[2] = u8::from(self.is_request);
        out[3..11].copy_from_slice(&self.request_counter.to_be_bytes());
        out[11..].copy_from_slice(&self.key_id);
        out
    }

    /// Lowercase hex of the key id.
    pub fn key_id_hex(&self) -> String {
        hex::encode(self.key_id)
    }

    /// `c2s` for requests, `s2c` for responses.
    pub fn direction(&self) -> &'static str {
        if self.is_request {
            "c2s"
        } else {
            "s2c"
        }
    }

    /// Encrypts a payload into a complete data message.
    pub fn seal(&self, key: &[u8], iv: &[u8; aead::NONCE_SIZE], plaintext: &[u8]) -> Option<Vec<u8>> {
        let header = self.to_bytes();
        let sealed = aead::encrypt(key, iv, &header, plaintext)?;
        let mut out = Vec::with_capacity(HEADER_LEN + iv.len() + sealed.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(iv);
        out.extend_from_slice(&sealed);
        Some(out)
    }
}

/// Normalises a `KeyID` field to lowercase hex. Accepts hex or base64.
fn normalize_key_id(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.len() == 64 && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Some(raw.to_ascii_lowercase());
    }
    let decoded = STANDARD.decode(raw).or_else(|_| URL_SAFE.decode(raw)).ok()?;
    (decoded.len() == 32).then(|| hex::encode(decoded))
}

fn decode_key(token: &str) -> Option<Vec<u8>> {
    STANDARD.decode(token).or_else(|_| URL_SAFE.decode(token)).ok()
}

fn is_octet_stream_body(ctx: &ConversionContext<'_>, node: NodeId) -> bool {
    let message = ctx.message();
    enclosing_http_message(message, node)
        .and_then(|http| message.header_value(http, "Content-Type"))
        .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("application/octet-stream"))
}

/// Registers keys from the `VAU-nonPU-Tracing` header.
#[derive(Debug, Default)]
pub struct VauTracingKeyConverter;

impl Converter for VauTracingKeyConverter {
    fn name(&self) -> &'static str {
        "vau-tracing-keys"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["http"]
    }

    fn activation(&self) -> Activation {
        Activation::Feature(FEATURE)
    }

    fn consider(
        &self,
        ctx: &mut ConversionContext<'_>,
        node: NodeId,
    ) -> Result<bool, ConversionError> {
        let message = ctx.message();
        let Some(http) = enclosing_http_message(message, node) else {
            return Ok(false);
        };
        let Some(value) = message.header_value(http, TRACING_HEADER) else {
            return Ok(false);
        };
        let tokens: Vec<&str> = value.split_whitespace().collect();
        // Third-party traffic may carry anything under this name.
        let [c2s, s2c] = tokens.as_slice() else {
            tracing::trace!(
                "Ignoring {} header with {} keys",
                TRACING_HEADER,
                tokens.len()
            );
            return Ok(false);
        };
        let (Some(c2s), Some(s2c)) = (decode_key(c2s), decode_key(s2c)) else {
            tracing::trace!("Ignoring {} header that is not base64", TRACING_HEADER);
            return Ok(false);
        };
        let prefix = VauHeader::parse(message.element(node).content())
            .map(|h| h.key_id_hex())
            .unwrap_or_else(|| format!("traced-{}", message.uuid()));

        let mut added = Vec::new();
        for (direction, material) in [("c2s", c2s), ("s2c", s2c)] {
            let name = format!("{}_{}", prefix, direction);
            if ctx.keys().add_key(RbelKey::symmetric(
                name.clone(),
                material,
                "AES-GCM",
                PRECEDENCE_TRACED_KEY,
            )) {
                tracing::debug!("Registered traced key {}", name);
                added.push(name);
            }
        }
        if added.is_empty() {
            return Ok(false);
        }
        ctx.add_note(
            node,
            NoteSeverity::Info,
            format!("registered traced keys {}", added.join(", ")),
        );
        Ok(true)
    }
}

/// Correlates handshake messages into sessions.
#[derive(Debug, Default)]
pub struct VauHandshakeConverter;

impl VauHandshakeConverter {
    fn json_field(ctx: &ConversionContext<'_>, node: NodeId, name: &str) -> Option<String> {
        let message = ctx.message();
        let child = message.child(node, name)?;
        match message.element(child).facet(FacetKind::Value) {
            Some(Facet::Value(serde_json::Value::String(s))) => Some(s.clone()),
            _ => None,
        }
    }

    fn hash_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }
}

impl Converter for VauHandshakeConverter {
    fn name(&self) -> &'static str {
        "vau-handshake"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["json", "http"]
    }

    fn activation(&self) -> Activation {
        Activation::Feature(FEATURE)
    }

    fn consider(
        &self,
        ctx: &mut ConversionContext<'_>,
        node: NodeId,
    ) -> Result<bool, ConversionError> {
        let element = ctx.message().element(node);
        if element.has_facet(FacetKind::VauHandshake) || !element.has_facet(FacetKind::Json) {
            return Ok(false);
        }
        let Some(stage) = Self::json_field(ctx, node, "MessageType")
            .and_then(|t| HandshakeStage::parse(&t))
        else {
            return Ok(false);
        };
        let key_id = Self::json_field(ctx, node, "KeyID").and_then(|k| normalize_key_id(&k));

        let session = match stage {
            HandshakeStage::M1 => {
                let hash = Self::hash_hex(ctx.message().element(node).content());
                Some(ctx.sessions().open(&hash))
            }
            HandshakeStage::M2 => {
                let Some(request) = ctx.paired_request() else {
                    tracing::trace!("M2 without a paired request");
                    return Ok(false);
                };
                let Some(body) = request
                    .http_body(NodeId::ROOT)
                    .map(|b| request.element(b).content().clone())
                else {
                    tracing::trace!("Paired request {} has no body", request.uuid());
                    return Ok(false);
                };
                let pending = ctx.sessions().find_by_handshake_hash(&Self::hash_hex(&body));
                match (pending, &key_id) {
                    (Some(session), Some(key_id)) => {
                        Some(ctx.sessions().bind_key_id(&session, key_id, stage))
                    }
                    (pending, _) => pending,
                }
            }
            HandshakeStage::M3 | HandshakeStage::M4 => match &key_id {
                Some(key_id) => ctx
                    .sessions()
                    .find_by_key_id(key_id)
                    .map(|session| ctx.sessions().bind_key_id(&session, key_id, stage)),
                None => None,
            },
        };
        let Some(session) = session else {
            tracing::trace!("No session for handshake {:?}", stage);
            return Ok(false);
        };

        ctx.add_facet(node, Facet::VauHandshake {
            stage,
            session_id: session.id.clone(),
            key_id: session.key_id.clone(),
        });
        Ok(true)
    }
}

/// Decrypts data messages.
#[derive(Debug, Default)]
pub struct VauDecryptionConverter;

impl Converter for VauDecryptionConverter {
    fn name(&self) -> &'static str {
        "vau-decrypt"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["vau-tracing-keys", "vau-handshake", "http"]
    }

    fn activation(&self) -> Activation {
        Activation::Feature(FEATURE)
    }

    fn requires_predecessors(&self) -> bool {
        true
    }

    fn consider(
        &self,
        ctx: &mut ConversionContext<'_>,
        node: NodeId,
    ) -> Result<bool, ConversionError> {
        let element = ctx.message().element(node);
        if element.has_facet(FacetKind::VauEncrypted) || !is_octet_stream_body(ctx, node) {
            return Ok(false);
        }
        let content = element.content().clone();
        let Some(header) = VauHeader::parse(&content) else {
            return Ok(false);
        };
        let key_id = header.key_id_hex();
        let preferred = format!("{}_{}", key_id, header.direction());

        let keys = ctx.keys();
        let mut candidates: Vec<_> = keys.find_key_by_name(&preferred).into_iter().collect();
        candidates.extend(
            keys.keys_for_algorithm("AES-GCM")
                .into_iter()
                .filter(|k| k.material().len() == aead::KEY_SIZE && k.name() != preferred),
        );

        let aad = &content[..HEADER_LEN];
        let iv = &content[HEADER_LEN..HEADER_LEN + aead::NONCE_SIZE];
        let sealed = &content[HEADER_LEN + aead::NONCE_SIZE..];
        let Some((key_name, plaintext)) = candidates.iter().find_map(|key| {
            aead::decrypt(key.material(), iv, aad, sealed).map(|p| (key.name().to_string(), p))
        }) else {
            tracing::trace!(
                "No key decrypts VAU message #{} for key id {}",
                header.request_counter,
                key_id
            );
            return Ok(false);
        };

        let session_id = ctx.sessions().find_by_key_id(&key_id).map(|s| s.id.clone());
        let decrypted = ctx.add_child(node, "decrypted", Bytes::from(plaintext));
        ctx.add_facet(node, Facet::VauEncrypted {
            version: header.version,
            pu: header.pu,
            is_request: header.is_request,
            request_counter: header.request_counter,
            key_id,
            key_name,
            session_id,
            decrypted,
        });
        ctx.convert(decrypted);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::RbelConfig;
    use crate::converter::RbelConverter;
    use crate::element::MessageMetadata;
    use crate::keys::PRECEDENCE_OPERATOR_KEY;

    const KEY_ID: [u8; 32] = [0xab; 32];

    fn vau_converter() -> RbelConverter {
        RbelConverter::new(RbelConfig::default().with_converter(FEATURE)).unwrap()
    }

    fn http_with_body(start: &str, headers: &str, body: &[u8]) -> Vec<u8> {
        let mut raw = format!(
            "{}\r\n{}Content-Length: {}\r\n\r\n",
            start,
            headers,
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(body);
        raw
    }

    fn data_message(is_request: bool, counter: u64, key: &[u8], plaintext: &[u8]) -> Vec<u8> {
        VauHeader {
            version: VERSION,
            pu: false,
            is_request,
            request_counter: counter,
            key_id: KEY_ID,
        }
        .seal(key, &[5; aead::NONCE_SIZE], plaintext)
        .unwrap()
    }

    #[test]
    fn header_layout() {
        let header = VauHeader {
            version: VERSION,
            pu: true,
            is_request: true,
            request_counter: 258,
            key_id: KEY_ID,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[..3], &[2, 1, 1]);
        assert_eq!(&bytes[3..11], &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(header.direction(), "c2s");

        let sealed = header.seal(&[1; 32], &[0; 12], b"x").unwrap();
        assert_eq!(VauHeader::parse(&sealed), Some(header));
        assert!(VauHeader::parse(&sealed[..HEADER_LEN + 12]).is_none());
    }

    #[test]
    fn normalizes_key_ids() {
        let hex_id = "AB".repeat(32);
        assert_eq!(normalize_key_id(&hex_id), Some("ab".repeat(32)));
        let b64 = STANDARD.encode(KEY_ID);
        assert_eq!(normalize_key_id(&b64), Some("ab".repeat(32)));
        assert_eq!(normalize_key_id("short"), None);
    }

    #[test]
    fn decrypts_with_traced_keys() {
        let c2s = [0x11u8; 32];
        let s2c = [0x22u8; 32];
        let body = data_message(true, 1, &c2s, b"GET /epa/authz HTTP/1.1\r\n\r\n");
        let tracing = format!("{}: {} {}\r\n", TRACING_HEADER, STANDARD.encode(c2s), STANDARD.encode(s2c));
        let raw = http_with_body(
            "POST /VAU HTTP/1.1",
            &format!("Content-Type: application/octet-stream\r\n{}", tracing),
            &body,
        );

        let converter = vau_converter();
        let msg = converter.parse_message(raw, MessageMetadata::new());
        let body = msg.http_body(NodeId::ROOT).unwrap();
        match msg.element(body).facet(FacetKind::VauEncrypted) {
            Some(Facet::VauEncrypted {
                key_name,
                request_counter,
                is_request,
                ..
            }) => {
                assert_eq!(key_name, &format!("{}_c2s", "ab".repeat(32)));
                assert_eq!(*request_counter, 1);
                assert!(*is_request);
            }
            other => panic!("unexpected facet {:?}", other),
        }
        assert_eq!(
            msg.find_first("$.body.decrypted.path").unwrap().content().as_ref(),
            b"/epa/authz"
        );
        assert!(converter
            .key_manager()
            .find_key_by_name(&format!("{}_s2c", "ab".repeat(32)))
            .is_some());
    }

    #[test]
    fn malformed_tracing_header_is_ignored() {
        let body = data_message(true, 1, &[0x11; 32], b"GET / HTTP/1.1\r\n\r\n");
        for value in ["onlyone", "!!! ???", "a b c"] {
            let raw = http_with_body(
                "POST /VAU HTTP/1.1",
                &format!("{}: {}\r\n", TRACING_HEADER, value),
                &body,
            );
            let converter = vau_converter();
            let msg = converter.parse_message(raw, MessageMetadata::new());
            let body = msg.http_body(NodeId::ROOT).unwrap();
            assert!(msg.element(body).notes().is_empty(), "notes for {:?}", value);
            assert!(msg.root().notes().is_empty());
        }
    }

    #[test]
    fn undecryptable_body_stays_opaque() {
        let body = data_message(false, 2, &[0x33; 32], b"secret");
        let raw = http_with_body(
            "HTTP/1.1 200 OK",
            "Content-Type: application/octet-stream\r\n",
            &body,
        );
        let msg = vau_converter().parse_message(raw, MessageMetadata::new());
        let body = msg.http_body(NodeId::ROOT).unwrap();
        assert!(msg.element(body).facets().is_empty());
    }

    #[test]
    fn falls_back_to_configured_keys() {
        let key = [0x44u8; 32];
        let config = RbelConfig::default().with_converter(FEATURE);
        let converter = RbelConverter::new(config).unwrap();
        converter.key_manager().add_key(RbelKey::symmetric(
            "operator",
            key.to_vec(),
            "AES-GCM",
            PRECEDENCE_OPERATOR_KEY,
        ));
        let raw = http_with_body(
            "HTTP/1.1 200 OK",
            "Content-Type: application/octet-stream\r\n",
            &data_message(false, 3, &key, b"{\"ok\":true}"),
        );
        let msg = converter.parse_message(raw, MessageMetadata::new());
        assert_eq!(
            msg.find_first("$.body.decrypted.ok").unwrap().content().as_ref(),
            b"true"
        );
    }

    #[test]
    fn handshake_binds_session_to_key_id() {
        let converter = vau_converter();
        let m1_body = br#"{"MessageType":"M1","ECDH_PK":"x"}"#;
        let m1 = converter.parse_message(
            http_with_body("POST /VAU HTTP/1.1", "Content-Type: application/json\r\n", m1_body),
            MessageMetadata::new(),
        );
        let m1_session = match msg_facet(&m1) {
            Some(Facet::VauHandshake { stage, session_id, .. }) => {
                assert_eq!(stage, HandshakeStage::M1);
                session_id
            }
            other => panic!("unexpected facet {:?}", other),
        };

        let m2_body = format!(r#"{{"MessageType":"M2","KeyID":"{}"}}"#, STANDARD.encode(KEY_ID));
        let m2 = converter.parse_message(
            http_with_body("HTTP/1.1 200 OK", "", m2_body.as_bytes()),
            MessageMetadata::new().with_paired_request(m1.uuid()),
        );
        match msg_facet(&m2) {
            Some(Facet::VauHandshake {
                stage,
                session_id,
                key_id,
            }) => {
                assert_eq!(stage, HandshakeStage::M2);
                assert_eq!(session_id, m1_session);
                assert_eq!(key_id, Some("ab".repeat(32)));
            }
            other => panic!("unexpected facet {:?}", other),
        }

        // Data messages in that session carry the session id.
        let key = [0x55u8; 32];
        converter.key_manager().add_key(RbelKey::symmetric(
            format!("{}_c2s", "ab".repeat(32)),
            key.to_vec(),
            "AES-GCM",
            PRECEDENCE_OPERATOR_KEY,
        ));
        let data = converter.parse_message(
            http_with_body(
                "POST /VAU/abc HTTP/1.1",
                "Content-Type: application/octet-stream\r\n",
                &data_message(true, 1, &key, b"inner"),
            ),
            MessageMetadata::new(),
        );
        let body = data.http_body(NodeId::ROOT).unwrap();
        match data.element(body).facet(FacetKind::VauEncrypted) {
            Some(Facet::VauEncrypted { session_id, .. }) => {
                assert_eq!(session_id.as_deref(), Some(m1_session.as_str()));
            }
            other => panic!("unexpected facet {:?}", other),
        }
    }

    fn msg_facet(msg: &Arc<crate::element::RbelMessage>) -> Option<Facet> {
        let body = msg.http_body(NodeId::ROOT)?;
        msg.element(body).facet(FacetKind::VauHandshake).cloned()
    }
}
